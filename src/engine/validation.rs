use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_room(room: &Room) -> Result<(), EngineError> {
    if room.name.trim().is_empty() {
        return Err(EngineError::validation("name", "must not be blank"));
    }
    if room.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    if room.capacity == 0 {
        return Err(EngineError::validation("capacity", "must be a positive integer"));
    }
    if room.capacity > MAX_ROOM_CAPACITY {
        return Err(EngineError::LimitExceeded("room capacity too large"));
    }
    Ok(())
}

pub(crate) fn validate_time_slot(slot: &TimeSlot) -> Result<(), EngineError> {
    if slot.end <= slot.start {
        return Err(EngineError::validation(
            "end",
            format!("end time {} must be after start time {}", slot.end, slot.start),
        ));
    }
    Ok(())
}

/// Shape checks only. The rules that need the room and its other bookings live in `conflict`.
pub(crate) fn validate_booking_fields(booking: &Booking) -> Result<(), EngineError> {
    if booking.attendees == 0 {
        return Err(EngineError::validation("attendees", "must be a positive integer"));
    }
    if let Some(reason) = &booking.reason
        && reason.len() > MAX_REASON_LEN
    {
        return Err(EngineError::LimitExceeded("booking reason too long"));
    }
    Ok(())
}

/// Registration and profile checks, fail-fast in this order:
/// name, role, email present and well-formed, email unique, password.
pub(crate) fn validate_user(
    user: &User,
    email_taken: impl Fn(&str) -> bool,
) -> Result<(), EngineError> {
    if user.name.trim().is_empty() {
        return Err(EngineError::validation("name", "must not be blank"));
    }
    if user.name.len() > MAX_NAME_LEN {
        return Err(EngineError::validation(
            "name",
            format!("must be at most {MAX_NAME_LEN} bytes"),
        ));
    }

    if user.roles.is_empty() {
        return Err(EngineError::validation("role", "is required"));
    }
    if user.roles.sole_recognized().is_none() {
        let known: Vec<&str> = Role::RECOGNIZED.iter().map(|r| r.tag()).collect();
        return Err(EngineError::validation(
            "role",
            format!("must be exactly one of {} (got {})", known.join(", "), user.roles),
        ));
    }

    let email = user.email.trim();
    if email.is_empty() {
        return Err(EngineError::validation("email", "is required"));
    }
    if email.len() > MAX_EMAIL_LEN || !is_plausible_email(email) {
        return Err(EngineError::validation("email", "is not a valid address"));
    }
    if email_taken(email) {
        return Err(EngineError::validation("email", "is already registered"));
    }

    if user.password.trim().is_empty() {
        return Err(EngineError::validation("password", "is required"));
    }
    if user.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(EngineError::validation(
            "password",
            format!("must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }
    if user.password.len() > MAX_PASSWORD_LEN {
        return Err(EngineError::validation("password", "is too long"));
    }
    Ok(())
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}
