use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Local calendar date used as "today" by the date check.
pub(crate) fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub(crate) fn check_date(date: NaiveDate, today: NaiveDate) -> Result<(), EngineError> {
    if date < today {
        return Err(EngineError::PastDate { date, today });
    }
    Ok(())
}

pub(crate) fn check_capacity(attendees: u32, room: &Room) -> Result<(), EngineError> {
    if attendees > room.capacity {
        return Err(EngineError::CapacityExceeded {
            attendees,
            capacity: room.capacity,
        });
    }
    Ok(())
}

/// Reject `candidate` if another booking of the same date sits on a slot overlapping `slot`.
///
/// The candidate's own id is skipped so an update never collides with the row it replaces.
/// Overlap is judged on the slot records as they are now, resolved through `slot_of`.
pub(crate) fn check_no_overlap<'a, F>(
    candidate: &Booking,
    slot: &TimeSlot,
    existing: impl IntoIterator<Item = &'a Booking>,
    slot_of: F,
) -> Result<(), EngineError>
where
    F: Fn(Ulid) -> Option<TimeSlot>,
{
    for other in existing {
        if other.id == candidate.id || other.date != candidate.date {
            continue;
        }
        if other.time_slot_id == slot.id {
            return Err(EngineError::Overlap(other.id));
        }
        let Some(other_slot) = slot_of(other.time_slot_id) else {
            continue;
        };
        if slot.overlaps(&other_slot) {
            return Err(EngineError::Overlap(other.id));
        }
    }
    Ok(())
}

/// Date, then capacity, then overlap against the room's bookings. First failure wins.
pub(crate) fn validate_booking<F>(
    candidate: &Booking,
    room: &RoomState,
    slot: &TimeSlot,
    slot_of: F,
    today: NaiveDate,
) -> Result<(), EngineError>
where
    F: Fn(Ulid) -> Option<TimeSlot>,
{
    check_date(candidate.date, today)?;
    check_capacity(candidate.attendees, &room.room)?;
    check_no_overlap(candidate, slot, room.on_date(candidate.date), slot_of)
}
