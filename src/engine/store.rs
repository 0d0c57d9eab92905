use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Write guards held by a transaction. A `BTreeMap` so they are taken and released in id order.
pub type RoomGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<RoomState>>;

/// Emails are unique regardless of case or surrounding whitespace.
pub(crate) fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

/// In-memory entity collections plus the reverse indexes the engine needs.
/// Only `apply` mutates it, always for an event already written to the WAL.
#[derive(Default)]
pub struct Store {
    rooms: DashMap<Ulid, SharedRoomState>,
    time_slots: DashMap<Ulid, TimeSlot>,
    users: DashMap<Ulid, User>,
    /// `email_key` → user id
    emails: DashMap<String, Ulid>,
    /// booking id → room id
    booking_to_room: DashMap<Ulid, Ulid>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Rooms ────────────────────────────────────────────────

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn contains_room(&self, id: &Ulid) -> bool {
        self.rooms.contains_key(id)
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// Handles to every room, sorted by id. Collected up front so no shard lock is held across an await.
    pub fn rooms_sorted(&self) -> Vec<(Ulid, SharedRoomState)> {
        let mut rooms: Vec<(Ulid, SharedRoomState)> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        rooms.sort_by_key(|(id, _)| *id);
        rooms
    }

    // ── Time slots ───────────────────────────────────────────

    pub fn time_slot_count(&self) -> usize {
        self.time_slots.len()
    }

    pub fn contains_time_slot(&self, id: &Ulid) -> bool {
        self.time_slots.contains_key(id)
    }

    pub fn time_slot(&self, id: &Ulid) -> Option<TimeSlot> {
        self.time_slots.get(id).map(|e| e.value().clone())
    }

    /// All slots ordered by day, then start time.
    pub fn time_slots(&self) -> Vec<TimeSlot> {
        let mut slots: Vec<TimeSlot> = self.time_slots.iter().map(|e| e.value().clone()).collect();
        slots.sort_by(|a, b| (a.day, a.start, a.id).cmp(&(b.day, b.start, b.id)));
        slots
    }

    // ── Users ────────────────────────────────────────────────

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn contains_user(&self, id: &Ulid) -> bool {
        self.users.contains_key(id)
    }

    pub fn user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        users
    }

    pub fn email_owner(&self, email: &str) -> Option<Ulid> {
        self.emails.get(&email_key(email)).map(|e| *e.value())
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let id = self.email_owner(email)?;
        self.user(&id)
    }

    // ── Booking index ────────────────────────────────────────

    pub fn room_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_room.get(booking_id).map(|e| *e.value())
    }

    pub fn booking_count(&self) -> usize {
        self.booking_to_room.len()
    }

    // ── Event application ────────────────────────────────────

    /// Rooms whose state `event` changes. Replay locks exactly these before `apply`.
    pub fn rooms_touched(&self, event: &Event) -> Vec<Ulid> {
        let mut ids = match event {
            Event::RoomUpdated(room) => vec![room.id],
            Event::RoomDeleted { id, .. } => vec![*id],
            Event::TimeSlotDeleted { bookings, .. } | Event::UserDeleted { bookings, .. } => {
                bookings.iter().filter_map(|b| self.room_for_booking(b)).collect()
            }
            Event::BookingCreated(booking) => vec![booking.room_id],
            Event::BookingUpdated(booking) => {
                let mut ids = vec![booking.room_id];
                ids.extend(self.room_for_booking(&booking.id));
                ids
            }
            Event::BookingDeleted { room_id, .. } => vec![*room_id],
            Event::RoomCreated(_)
            | Event::TimeSlotCreated(_)
            | Event::TimeSlotUpdated(_)
            | Event::UserCreated(_)
            | Event::UserUpdated(_) => Vec::new(),
        };
        ids.sort();
        ids.dedup();
        ids
    }

    /// Apply a committed event. The caller holds write guards for `rooms_touched(event)`.
    pub fn apply(&self, rooms: &mut RoomGuards, event: &Event) {
        match event {
            Event::RoomCreated(room) => {
                let state = RoomState::new(room.clone());
                self.rooms.insert(room.id, Arc::new(RwLock::new(state)));
            }
            Event::RoomUpdated(room) => {
                if let Some(rs) = rooms.get_mut(&room.id) {
                    rs.room = room.clone();
                }
            }
            Event::RoomDeleted { id, bookings } => {
                if let Some(rs) = rooms.get_mut(id) {
                    rs.bookings.clear();
                    rs.retired = true;
                }
                for booking_id in bookings {
                    self.booking_to_room.remove(booking_id);
                }
                self.rooms.remove(id);
            }
            Event::TimeSlotCreated(slot) | Event::TimeSlotUpdated(slot) => {
                self.time_slots.insert(slot.id, slot.clone());
            }
            Event::TimeSlotDeleted { id, bookings } => {
                self.remove_bookings(rooms, bookings);
                self.time_slots.remove(id);
            }
            Event::UserCreated(user) => {
                self.emails.insert(email_key(&user.email), user.id);
                self.users.insert(user.id, user.clone());
            }
            Event::UserUpdated(user) => {
                let previous = self.users.insert(user.id, user.clone());
                if let Some(prev) = previous {
                    let old_key = email_key(&prev.email);
                    if old_key != email_key(&user.email) {
                        self.emails.remove(&old_key);
                    }
                }
                self.emails.insert(email_key(&user.email), user.id);
            }
            Event::UserDeleted { id, bookings } => {
                self.remove_bookings(rooms, bookings);
                let removed = self.users.remove(id);
                if let Some((_, user)) = removed {
                    self.emails.remove(&email_key(&user.email));
                }
            }
            Event::BookingCreated(booking) => {
                if let Some(rs) = rooms.get_mut(&booking.room_id) {
                    rs.insert_booking(booking.clone());
                }
                self.booking_to_room.insert(booking.id, booking.room_id);
            }
            Event::BookingUpdated(booking) => {
                let previous_room = self.room_for_booking(&booking.id);
                if let Some(prev) = previous_room
                    && let Some(rs) = rooms.get_mut(&prev)
                {
                    rs.remove_booking(booking.id);
                }
                if let Some(rs) = rooms.get_mut(&booking.room_id) {
                    rs.insert_booking(booking.clone());
                }
                self.booking_to_room.insert(booking.id, booking.room_id);
            }
            Event::BookingDeleted { id, room_id } => {
                if let Some(rs) = rooms.get_mut(room_id) {
                    rs.remove_booking(*id);
                }
                self.booking_to_room.remove(id);
            }
        }
    }

    fn remove_bookings(&self, rooms: &mut RoomGuards, bookings: &[Ulid]) {
        for booking_id in bookings {
            let room_id = self.room_for_booking(booking_id);
            if let Some(room_id) = room_id
                && let Some(rs) = rooms.get_mut(&room_id)
            {
                rs.remove_booking(*booking_id);
            }
            self.booking_to_room.remove(booking_id);
        }
    }
}
