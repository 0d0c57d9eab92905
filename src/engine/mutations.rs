use chrono::Utc;
use ulid::Ulid;

use crate::authz::{self, Action, RequestContext};
use crate::limits::*;
use crate::merge::merge;
use crate::model::*;

use super::conflict::{self, validate_booking};
use super::validation::{validate_booking_fields, validate_room, validate_time_slot, validate_user};
use super::{Engine, EngineError, Transaction};

fn normalize_reason(reason: Option<String>) -> Option<String> {
    reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
}

fn record_rejection(booking: &Booking, err: &EngineError) {
    metrics::counter!(crate::observability::BOOKINGS_REJECTED_TOTAL, "reason" => err.kind())
        .increment(1);
    tracing::debug!(booking = %booking.id, room = %booking.room_id, date = %booking.date, "booking rejected: {err}");
}

impl Engine {
    // ── Rooms ────────────────────────────────────────────────

    pub async fn create_room(&self, ctx: &RequestContext, input: NewRoom) -> Result<Room, EngineError> {
        authz::require(ctx.principal(), Action::ManageCatalog)?;
        let room = Room {
            id: input.id.unwrap_or_else(Ulid::new),
            name: input.name.trim().to_string(),
            capacity: input.capacity,
            has_computers: input.has_computers,
        };
        validate_room(&room)?;

        let txn = self.begin_exclusive().await?;
        if self.store.room_count() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.store.contains_room(&room.id) {
            return Err(EngineError::already_exists("room", room.id));
        }
        ctx.ensure_active()?;
        self.commit(txn, Event::RoomCreated(room.clone())).await?;
        tracing::info!(room = %room.id, name = %room.name, "room created");
        Ok(room)
    }

    /// Existing bookings are not re-checked against a reduced capacity.
    pub async fn update_room(
        &self,
        ctx: &RequestContext,
        id: Ulid,
        patch: RoomPatch,
    ) -> Result<Room, EngineError> {
        authz::require(ctx.principal(), Action::ManageCatalog)?;
        let mut txn = self.begin().await?;
        self.lock_rooms(&mut txn, &[id]).await?;
        let current = txn
            .room(&id)
            .map(|rs| rs.room.clone())
            .ok_or_else(|| EngineError::not_found("room", id))?;

        let mut room = merge(current, patch);
        room.name = room.name.trim().to_string();
        validate_room(&room)?;
        ctx.ensure_active()?;
        self.commit(txn, Event::RoomUpdated(room.clone())).await?;
        Ok(room)
    }

    // ── Time slots ───────────────────────────────────────────

    pub async fn create_time_slot(
        &self,
        ctx: &RequestContext,
        input: NewTimeSlot,
    ) -> Result<TimeSlot, EngineError> {
        authz::require(ctx.principal(), Action::ManageCatalog)?;
        let slot = TimeSlot {
            id: input.id.unwrap_or_else(Ulid::new),
            day: input.day,
            start: input.start,
            end: input.end,
        };
        validate_time_slot(&slot)?;

        let txn = self.begin_exclusive().await?;
        if self.store.time_slot_count() >= MAX_TIME_SLOTS {
            return Err(EngineError::LimitExceeded("too many time slots"));
        }
        if self.store.contains_time_slot(&slot.id) {
            return Err(EngineError::already_exists("time slot", slot.id));
        }
        ctx.ensure_active()?;
        self.commit(txn, Event::TimeSlotCreated(slot.clone())).await?;
        tracing::info!(time_slot = %slot.id, day = %slot.day, start = %slot.start, end = %slot.end, "time slot created");
        Ok(slot)
    }

    /// Bookings referencing the slot keep their reservation; overlap for future
    /// candidates is judged against the new boundaries.
    pub async fn update_time_slot(
        &self,
        ctx: &RequestContext,
        id: Ulid,
        patch: TimeSlotPatch,
    ) -> Result<TimeSlot, EngineError> {
        authz::require(ctx.principal(), Action::ManageCatalog)?;
        let txn = self.begin_exclusive().await?;
        let current = self
            .store
            .time_slot(&id)
            .ok_or_else(|| EngineError::not_found("time slot", id))?;
        let slot = merge(current, patch);
        validate_time_slot(&slot)?;
        ctx.ensure_active()?;
        self.commit(txn, Event::TimeSlotUpdated(slot.clone())).await?;
        Ok(slot)
    }

    // ── Users ────────────────────────────────────────────────

    /// Open to anonymous callers. New accounts start enabled.
    ///
    /// Once any account exists, only an administrator may register another administrator.
    pub async fn register_user(&self, ctx: &RequestContext, input: NewUser) -> Result<User, EngineError> {
        authz::require(ctx.principal(), Action::Register)?;
        let user = User {
            id: input.id.unwrap_or_else(Ulid::new),
            name: input.name.unwrap_or_default().trim().to_string(),
            email: input.email.unwrap_or_default().trim().to_string(),
            password: input.password.unwrap_or_default(),
            roles: input.roles.unwrap_or_default(),
            enabled: true,
        };

        let txn = self.begin_exclusive().await?;
        validate_user(&user, |email| self.store.email_owner(email).is_some())?;
        if user.roles.is_admin() && self.store.user_count() > 0 && !ctx.principal().is_admin() {
            return Err(EngineError::Forbidden("only an administrator may register an administrator"));
        }
        if self.store.user_count() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.store.contains_user(&user.id) {
            return Err(EngineError::already_exists("user", user.id));
        }
        ctx.ensure_active()?;
        self.commit(txn, Event::UserCreated(user.clone())).await?;
        tracing::info!(user = %user.id, roles = %user.roles, "user registered");
        Ok(user)
    }

    /// Users may edit themselves; administrators may edit anyone.
    /// Only administrators may change roles or the enabled flag.
    pub async fn update_user(
        &self,
        ctx: &RequestContext,
        id: Ulid,
        patch: UserPatch,
    ) -> Result<User, EngineError> {
        authz::require(ctx.principal(), Action::Users)?;
        let txn = self.begin_exclusive().await?;
        let current = self
            .store
            .user(&id)
            .ok_or_else(|| EngineError::not_found("user", id))?;
        authz::authorize_mutation(ctx.principal(), &current.email)?;

        let changes_roles = patch.roles.as_ref().is_some_and(|r| *r != current.roles);
        let changes_enabled = patch.enabled.is_some_and(|e| e != current.enabled);
        if (changes_roles || changes_enabled) && !ctx.principal().is_admin() {
            return Err(EngineError::Forbidden("only an administrator may change roles or account status"));
        }

        let mut user = merge(current, patch);
        user.name = user.name.trim().to_string();
        user.email = user.email.trim().to_string();
        validate_user(&user, |email| {
            self.store.email_owner(email).is_some_and(|owner| owner != id)
        })?;
        ctx.ensure_active()?;
        self.commit(txn, Event::UserUpdated(user.clone())).await?;
        Ok(user)
    }

    /// Replace the caller's own password.
    pub async fn change_password(&self, ctx: &RequestContext, password: String) -> Result<User, EngineError> {
        authz::require(ctx.principal(), Action::Users)?;
        let me = self.principal_user(ctx)?;
        let patch = UserPatch {
            password: Some(password),
            ..Default::default()
        };
        self.update_user(ctx, me.id, patch).await
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Create a booking for the calling user against an existing room and time slot.
    pub async fn create_booking(
        &self,
        ctx: &RequestContext,
        input: NewBooking,
    ) -> Result<BookingDetail, EngineError> {
        authz::require(ctx.principal(), Action::Bookings)?;
        let mut txn = self.begin().await?;
        let creator = self.principal_user(ctx)?;
        let slot = self
            .store
            .time_slot(&input.time_slot_id)
            .ok_or_else(|| EngineError::not_found("time slot", input.time_slot_id))?;
        self.lock_rooms(&mut txn, &[input.room_id]).await?;
        let room_state = txn
            .room(&input.room_id)
            .ok_or_else(|| EngineError::not_found("room", input.room_id))?;

        let booking = Booking {
            id: input.id.unwrap_or_else(Ulid::new),
            date: input.date,
            reason: normalize_reason(input.reason),
            attendees: input.attendees,
            created_at: Utc::now(),
            room_id: input.room_id,
            time_slot_id: input.time_slot_id,
            user_id: creator.id,
        };
        if room_state.bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        if self.store.room_for_booking(&booking.id).is_some() {
            return Err(EngineError::already_exists("booking", booking.id));
        }
        validate_booking_fields(&booking)?;

        ctx.ensure_active()?;
        validate_booking(
            &booking,
            room_state,
            &slot,
            |id| self.store.time_slot(&id),
            conflict::today(),
        )
        .inspect_err(|e| record_rejection(&booking, e))?;

        let detail = BookingDetail {
            booking: booking.clone(),
            room: room_state.room.clone(),
            time_slot: slot,
            creator,
        };
        self.commit(txn, Event::BookingCreated(booking)).await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        Ok(detail)
    }

    /// Patch a booking. Only its owner or an administrator may do so; the creator
    /// and creation time never change.
    pub async fn update_booking(
        &self,
        ctx: &RequestContext,
        id: Ulid,
        patch: BookingPatch,
    ) -> Result<BookingDetail, EngineError> {
        authz::require(ctx.principal(), Action::Bookings)?;
        for _ in 0..MAX_LOCK_RETRIES {
            let mut txn = self.begin().await?;
            let Some(current_room) = self.store.room_for_booking(&id) else {
                return Err(EngineError::not_found("booking", id));
            };
            let target_room = patch.room_id.unwrap_or(current_room);
            match self.lock_rooms(&mut txn, &[current_room, target_room]).await {
                Ok(()) => {}
                // The booking left `current_room` while we waited
                Err(EngineError::NotFound { .. })
                    if self.store.room_for_booking(&id) != Some(current_room) =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
            let Some(persisted) = txn
                .room(&current_room)
                .and_then(|rs| rs.booking(id))
                .cloned()
            else {
                continue;
            };
            return self.update_locked(ctx, txn, persisted, patch).await;
        }
        Err(EngineError::Timeout)
    }

    async fn update_locked(
        &self,
        ctx: &RequestContext,
        txn: Transaction,
        persisted: Booking,
        patch: BookingPatch,
    ) -> Result<BookingDetail, EngineError> {
        let owner = self
            .store
            .user(&persisted.user_id)
            .ok_or_else(|| EngineError::not_found("user", persisted.user_id))?;
        authz::authorize_mutation(ctx.principal(), &owner.email)?;

        let mut booking = merge(persisted, patch);
        booking.reason = normalize_reason(booking.reason);
        let slot = self
            .store
            .time_slot(&booking.time_slot_id)
            .ok_or_else(|| EngineError::not_found("time slot", booking.time_slot_id))?;
        validate_booking_fields(&booking)?;

        ctx.ensure_active()?;
        let room_state = txn
            .room(&booking.room_id)
            .ok_or_else(|| EngineError::not_found("room", booking.room_id))?;
        validate_booking(
            &booking,
            room_state,
            &slot,
            |id| self.store.time_slot(&id),
            conflict::today(),
        )
        .inspect_err(|e| record_rejection(&booking, e))?;

        let detail = BookingDetail {
            booking: booking.clone(),
            room: room_state.room.clone(),
            time_slot: slot,
            creator: owner,
        };
        self.commit(txn, Event::BookingUpdated(booking)).await?;
        Ok(detail)
    }

    /// The stored user behind the request's principal.
    pub(super) fn principal_user(&self, ctx: &RequestContext) -> Result<User, EngineError> {
        ctx.principal()
            .email()
            .and_then(|email| self.store.user_by_email(email))
            .filter(|user| user.enabled)
            .ok_or(EngineError::Unauthenticated)
    }
}
