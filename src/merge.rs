//! Field-by-field merge of a partial update into a persisted entity.
//!
//! Every field of the patch that is `Some` overwrites the persisted value;
//! `None` leaves it as it was. Identity, creation time and ownership are not
//! patchable and so never appear in a patch. No validation happens here.

use crate::model::*;

pub trait Merge {
    type Patch;

    fn merge_from(&mut self, patch: Self::Patch);
}

/// Merge `patch` into `persisted` and hand the same entity back.
pub fn merge<T: Merge>(mut persisted: T, patch: T::Patch) -> T {
    persisted.merge_from(patch);
    persisted
}

fn set<T>(field: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *field = v;
    }
}

impl Merge for Room {
    type Patch = RoomPatch;

    fn merge_from(&mut self, patch: RoomPatch) {
        let RoomPatch { name, capacity, has_computers } = patch;
        set(&mut self.name, name);
        set(&mut self.capacity, capacity);
        set(&mut self.has_computers, has_computers);
    }
}

impl Merge for TimeSlot {
    type Patch = TimeSlotPatch;

    fn merge_from(&mut self, patch: TimeSlotPatch) {
        let TimeSlotPatch { day, start, end } = patch;
        set(&mut self.day, day);
        set(&mut self.start, start);
        set(&mut self.end, end);
    }
}

impl Merge for Booking {
    type Patch = BookingPatch;

    fn merge_from(&mut self, patch: BookingPatch) {
        let BookingPatch { date, reason, attendees, room_id, time_slot_id } = patch;
        set(&mut self.date, date);
        if reason.is_some() {
            self.reason = reason;
        }
        set(&mut self.attendees, attendees);
        set(&mut self.room_id, room_id);
        set(&mut self.time_slot_id, time_slot_id);
    }
}

impl Merge for User {
    type Patch = UserPatch;

    fn merge_from(&mut self, patch: UserPatch) {
        let UserPatch { name, email, password, roles, enabled } = patch;
        set(&mut self.name, name);
        set(&mut self.email, email);
        set(&mut self.password, password);
        set(&mut self.roles, roles);
        set(&mut self.enabled, enabled);
    }
}
