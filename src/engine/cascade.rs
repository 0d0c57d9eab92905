use ulid::Ulid;

use crate::authz::{self, Action, RequestContext};
use crate::limits::MAX_LOCK_RETRIES;
use crate::model::*;

use super::{Engine, EngineError, Transaction};

fn record_cascade(parent: &'static str, id: Ulid, removed: usize) {
    metrics::counter!(crate::observability::CASCADE_DELETED_BOOKINGS_TOTAL, "parent" => parent)
        .increment(removed as u64);
    tracing::info!(parent, id = %id, bookings = removed, "deleted with dependent bookings");
}

impl Engine {
    /// Delete a room and every booking held against it, as one WAL record.
    pub async fn delete_room(&self, ctx: &RequestContext, id: Ulid) -> Result<DeleteReport, EngineError> {
        authz::require(ctx.principal(), Action::ManageCatalog)?;
        let mut txn = self.begin().await?;
        self.lock_rooms(&mut txn, &[id]).await?;
        let bookings: Vec<Ulid> = txn
            .room(&id)
            .map(|rs| rs.bookings.iter().map(|b| b.id).collect())
            .unwrap_or_default();

        ctx.ensure_active()?;
        let removed = bookings.len();
        self.commit(txn, Event::RoomDeleted { id, bookings: bookings.clone() }).await?;
        record_cascade("room", id, removed);
        Ok(DeleteReport { id, bookings })
    }

    /// Delete a time slot and every booking that references it, in any room.
    pub async fn delete_time_slot(&self, ctx: &RequestContext, id: Ulid) -> Result<DeleteReport, EngineError> {
        authz::require(ctx.principal(), Action::ManageCatalog)?;
        let mut txn = self.begin_exclusive().await?;
        if !self.store.contains_time_slot(&id) {
            return Err(EngineError::not_found("time slot", id));
        }
        let bookings = self
            .lock_dependents(&mut txn, |b| b.time_slot_id == id)
            .await?;

        ctx.ensure_active()?;
        let removed = bookings.len();
        self.commit(txn, Event::TimeSlotDeleted { id, bookings: bookings.clone() }).await?;
        record_cascade("time_slot", id, removed);
        Ok(DeleteReport { id, bookings })
    }

    /// Delete a user and every booking they created. Users may delete themselves;
    /// administrators may delete anyone.
    pub async fn delete_user(&self, ctx: &RequestContext, id: Ulid) -> Result<DeleteReport, EngineError> {
        authz::require(ctx.principal(), Action::Users)?;
        let mut txn = self.begin_exclusive().await?;
        let user = self
            .store
            .user(&id)
            .ok_or_else(|| EngineError::not_found("user", id))?;
        authz::authorize_mutation(ctx.principal(), &user.email)?;
        let bookings = self.lock_dependents(&mut txn, |b| b.user_id == id).await?;

        ctx.ensure_active()?;
        let removed = bookings.len();
        self.commit(txn, Event::UserDeleted { id, bookings: bookings.clone() }).await?;
        record_cascade("user", id, removed);
        Ok(DeleteReport { id, bookings })
    }

    /// Delete one booking. Owner or administrator only; nothing cascades.
    pub async fn delete_booking(&self, ctx: &RequestContext, id: Ulid) -> Result<Booking, EngineError> {
        authz::require(ctx.principal(), Action::Bookings)?;
        for _ in 0..MAX_LOCK_RETRIES {
            let mut txn = self.begin().await?;
            let Some(room_id) = self.store.room_for_booking(&id) else {
                return Err(EngineError::not_found("booking", id));
            };
            match self.lock_rooms(&mut txn, &[room_id]).await {
                Ok(()) => {}
                Err(EngineError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
            let Some(booking) = txn.room(&room_id).and_then(|rs| rs.booking(id)).cloned() else {
                continue;
            };

            let owner = self
                .store
                .user(&booking.user_id)
                .ok_or_else(|| EngineError::not_found("user", booking.user_id))?;
            authz::authorize_mutation(ctx.principal(), &owner.email)?;
            ctx.ensure_active()?;
            self.commit(txn, Event::BookingDeleted { id, room_id }).await?;
            return Ok(booking);
        }
        Err(EngineError::not_found("booking", id))
    }

    /// Find bookings matching `depends` in every room and write-lock the rooms holding them.
    /// Only called under an exclusive transaction, so nothing moves between the scan and the locks.
    async fn lock_dependents<F>(&self, txn: &mut Transaction, depends: F) -> Result<Vec<Ulid>, EngineError>
    where
        F: Fn(&Booking) -> bool,
    {
        let mut rooms = Vec::new();
        let mut bookings = Vec::new();
        for (room_id, rs) in self.store.rooms_sorted() {
            let guard = rs.read().await;
            let before = bookings.len();
            bookings.extend(guard.bookings.iter().filter(|b| depends(b)).map(|b| b.id));
            if bookings.len() > before {
                rooms.push(room_id);
            }
        }
        self.lock_rooms(txn, &rooms).await?;
        Ok(bookings)
    }
}
