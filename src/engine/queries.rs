use ulid::Ulid;

use crate::authz::{self, Action, Principal, RequestContext};
use crate::model::*;

use super::{Engine, EngineError};

/// Room catalogue filters; unset fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomFilter {
    pub min_capacity: Option<u32>,
    pub has_computers: Option<bool>,
}

impl RoomFilter {
    pub fn matches(&self, room: &Room) -> bool {
        self.min_capacity.is_none_or(|min| room.capacity >= min)
            && self.has_computers.is_none_or(|flag| room.has_computers == flag)
    }
}

impl Engine {
    pub async fn list_rooms(&self, ctx: &RequestContext, filter: RoomFilter) -> Result<Vec<Room>, EngineError> {
        authz::require(ctx.principal(), Action::ReadCatalog)?;
        let _graph = self.read_graph().await?;
        let mut rooms = Vec::new();
        for (_, rs) in self.store.rooms_sorted() {
            let guard = rs.read().await;
            if filter.matches(&guard.room) {
                rooms.push(guard.room.clone());
            }
        }
        Ok(rooms)
    }

    pub async fn get_room(&self, ctx: &RequestContext, id: Ulid) -> Result<Room, EngineError> {
        authz::require(ctx.principal(), Action::ReadCatalog)?;
        let _graph = self.read_graph().await?;
        let rs = self
            .store
            .get_room(&id)
            .ok_or_else(|| EngineError::not_found("room", id))?;
        let guard = rs.read().await;
        Ok(guard.room.clone())
    }

    pub async fn list_time_slots(&self, ctx: &RequestContext) -> Result<Vec<TimeSlot>, EngineError> {
        authz::require(ctx.principal(), Action::ReadCatalog)?;
        let _graph = self.read_graph().await?;
        Ok(self.store.time_slots())
    }

    pub async fn get_time_slot(&self, ctx: &RequestContext, id: Ulid) -> Result<TimeSlot, EngineError> {
        authz::require(ctx.principal(), Action::ReadCatalog)?;
        let _graph = self.read_graph().await?;
        self.store
            .time_slot(&id)
            .ok_or_else(|| EngineError::not_found("time slot", id))
    }

    /// Every booking, ordered by date then slot start.
    pub async fn list_bookings(&self, ctx: &RequestContext) -> Result<Vec<BookingDetail>, EngineError> {
        authz::require(ctx.principal(), Action::Bookings)?;
        let _graph = self.read_graph().await?;
        let mut details = Vec::new();
        for (_, rs) in self.store.rooms_sorted() {
            let guard = rs.read().await;
            details.extend(guard.bookings.iter().filter_map(|b| self.detail(b, &guard.room)));
        }
        sort_details(&mut details);
        Ok(details)
    }

    pub async fn room_bookings(&self, ctx: &RequestContext, room_id: Ulid) -> Result<Vec<BookingDetail>, EngineError> {
        authz::require(ctx.principal(), Action::Bookings)?;
        let _graph = self.read_graph().await?;
        let rs = self
            .store
            .get_room(&room_id)
            .ok_or_else(|| EngineError::not_found("room", room_id))?;
        let guard = rs.read().await;
        let mut details: Vec<BookingDetail> = guard
            .bookings
            .iter()
            .filter_map(|b| self.detail(b, &guard.room))
            .collect();
        sort_details(&mut details);
        Ok(details)
    }

    pub async fn get_booking(&self, ctx: &RequestContext, id: Ulid) -> Result<BookingDetail, EngineError> {
        authz::require(ctx.principal(), Action::Bookings)?;
        let _graph = self.read_graph().await?;
        let not_found = || EngineError::not_found("booking", id);
        let room_id = self.store.room_for_booking(&id).ok_or_else(not_found)?;
        let rs = self.store.get_room(&room_id).ok_or_else(not_found)?;
        let guard = rs.read().await;
        guard
            .booking(id)
            .and_then(|b| self.detail(b, &guard.room))
            .ok_or_else(not_found)
    }

    /// The caller's own account.
    pub async fn profile(&self, ctx: &RequestContext) -> Result<User, EngineError> {
        authz::require(ctx.principal(), Action::Users)?;
        self.principal_user(ctx)
    }

    /// Map a login to a principal. Unknown or disabled accounts become anonymous.
    pub fn resolve_principal(&self, email: &str) -> Principal {
        match self.store.user_by_email(email) {
            Some(user) if user.enabled => Principal::new(user.email, user.roles),
            _ => Principal::anonymous(),
        }
    }

    /// Stored credential of an enabled account.
    pub fn credential_for(&self, email: &str) -> Option<String> {
        self.store
            .user_by_email(email)
            .filter(|user| user.enabled)
            .map(|user| user.password)
    }

    fn detail(&self, booking: &Booking, room: &Room) -> Option<BookingDetail> {
        let time_slot = self.store.time_slot(&booking.time_slot_id)?;
        let creator = self.store.user(&booking.user_id)?;
        Some(BookingDetail {
            booking: booking.clone(),
            room: room.clone(),
            time_slot,
            creator,
        })
    }
}

fn sort_details(details: &mut [BookingDetail]) {
    details.sort_by(|a, b| {
        (a.booking.date, a.time_slot.start, a.booking.id).cmp(&(b.booking.date, b.time_slot.start, b.booking.id))
    });
}
