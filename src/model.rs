use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    pub fn as_str(self) -> &'static str {
        match self {
            DayOfWeek::Monday => "MONDAY",
            DayOfWeek::Tuesday => "TUESDAY",
            DayOfWeek::Wednesday => "WEDNESDAY",
            DayOfWeek::Thursday => "THURSDAY",
            DayOfWeek::Friday => "FRIDAY",
            DayOfWeek::Saturday => "SATURDAY",
            DayOfWeek::Sunday => "SUNDAY",
        }
    }

    /// Day of week a calendar date falls on.
    pub fn of(date: NaiveDate) -> Self {
        match date.weekday() {
            Weekday::Mon => DayOfWeek::Monday,
            Weekday::Tue => DayOfWeek::Tuesday,
            Weekday::Wed => DayOfWeek::Wednesday,
            Weekday::Thu => DayOfWeek::Thursday,
            Weekday::Fri => DayOfWeek::Friday,
            Weekday::Sat => DayOfWeek::Saturday,
            Weekday::Sun => DayOfWeek::Sunday,
        }
    }
}

impl fmt::Display for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DayOfWeek {
    type Err = String;

    /// Accepts English names (full or three-letter) and Spanish names, any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let day = match s.trim().to_uppercase().as_str() {
            "MONDAY" | "MON" | "LUNES" => DayOfWeek::Monday,
            "TUESDAY" | "TUE" | "MARTES" => DayOfWeek::Tuesday,
            "WEDNESDAY" | "WED" | "MIERCOLES" | "MIÉRCOLES" => DayOfWeek::Wednesday,
            "THURSDAY" | "THU" | "JUEVES" => DayOfWeek::Thursday,
            "FRIDAY" | "FRI" | "VIERNES" => DayOfWeek::Friday,
            "SATURDAY" | "SAT" | "SABADO" | "SÁBADO" => DayOfWeek::Saturday,
            "SUNDAY" | "SUN" | "DOMINGO" => DayOfWeek::Sunday,
            _ => return Err(format!("unknown day of week: {s}")),
        };
        Ok(day)
    }
}

/// A physical room that can be booked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub has_computers: bool,
}

/// Weekly recurring window `[start, end)` on one day of the week.
/// Shared by every booking that references it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Ulid,
    pub day: DayOfWeek,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeSlot {
    /// Same day and intersecting half-open intervals. Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.day == other.day && self.start < other.end && other.start < self.end
    }
}

/// One room reserved for one date against one time slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub date: NaiveDate,
    pub reason: Option<String>,
    pub attendees: u32,
    /// Set on creation, never changed afterwards.
    pub created_at: DateTime<Utc>,
    pub room_id: Ulid,
    pub time_slot_id: Ulid,
    /// Creator, assigned from the authenticated principal.
    pub user_id: Ulid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Profesor,
}

impl Role {
    pub const RECOGNIZED: [Role; 2] = [Role::Admin, Role::Profesor];

    pub fn tag(self) -> &'static str {
        match self {
            Role::Admin => "ROLE_ADMIN",
            Role::Profesor => "ROLE_PROFESOR",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Role> {
        Self::RECOGNIZED.into_iter().find(|r| r.tag() == tag)
    }
}

/// Set of role tags, normalized to upper-case `ROLE_*` form.
///
/// Unrecognized tags are kept so validation can name them; only
/// [`Role::RECOGNIZED`] tags grant anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roles(BTreeSet<String>);

impl Roles {
    pub fn single(role: Role) -> Self {
        Self(BTreeSet::from([role.tag().to_string()]))
    }

    /// Parse the comma-joined boundary form. `"admin, ROLE_PROFESOR"` holds both roles.
    pub fn parse(raw: &str) -> Self {
        raw.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(normalize_tag)
            .collect()
    }

    pub fn has(&self, role: Role) -> bool {
        self.0.contains(role.tag())
    }

    pub fn is_admin(&self) -> bool {
        self.has(Role::Admin)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// The role, if the set holds exactly one tag and that tag is recognized.
    pub fn sole_recognized(&self) -> Option<Role> {
        if self.0.len() != 1 {
            return None;
        }
        self.0.iter().next().and_then(|t| Role::from_tag(t))
    }
}

fn normalize_tag(tag: &str) -> String {
    let upper = tag.to_uppercase();
    if upper.starts_with("ROLE_") {
        upper
    } else {
        format!("ROLE_{upper}")
    }
}

impl FromIterator<String> for Roles {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Roles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        f.write_str(&joined.join(","))
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    /// Opaque credential. Never rendered.
    pub password: String,
    pub roles: Roles,
    pub enabled: bool,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("email", &self.email)
            .field("roles", &self.roles)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

// ── Inputs ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct NewRoom {
    pub id: Option<Ulid>,
    pub name: String,
    pub capacity: u32,
    pub has_computers: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTimeSlot {
    pub id: Option<Ulid>,
    pub day: DayOfWeek,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Booking request. The creator is never taken from here.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBooking {
    pub id: Option<Ulid>,
    pub date: NaiveDate,
    pub reason: Option<String>,
    pub attendees: u32,
    pub room_id: Ulid,
    pub time_slot_id: Ulid,
}

/// Registration request. Every field is optional so validation can name the first missing one.
#[derive(Clone, Default, PartialEq)]
pub struct NewUser {
    pub id: Option<Ulid>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub roles: Option<Roles>,
}

impl fmt::Debug for NewUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewUser")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("email", &self.email)
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

// ── Patches: `None` leaves the persisted field untouched ──────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub capacity: Option<u32>,
    pub has_computers: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSlotPatch {
    pub day: Option<DayOfWeek>,
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingPatch {
    pub date: Option<NaiveDate>,
    pub reason: Option<String>,
    pub attendees: Option<u32>,
    pub room_id: Option<Ulid>,
    pub time_slot_id: Option<Ulid>,
}

#[derive(Clone, Default, PartialEq)]
pub struct UserPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub roles: Option<Roles>,
    pub enabled: Option<bool>,
}

impl fmt::Debug for UserPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPatch")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("roles", &self.roles)
            .field("enabled", &self.enabled)
            .finish()
    }
}

// ── In-memory room state ──────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Bookings against this room, sorted by `date`.
    pub bookings: Vec<Booking>,
    /// Set once the room is deleted. A writer that resolved the handle earlier must treat it as gone.
    pub retired: bool,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            bookings: Vec::new(),
            retired: false,
        }
    }

    /// Insert maintaining sort order by date.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self.bookings.partition_point(|b| b.date <= booking.date);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings held for exactly `date`.
    pub fn on_date(&self, date: NaiveDate) -> &[Booking] {
        let lo = self.bookings.partition_point(|b| b.date < date);
        let hi = self.bookings.partition_point(|b| b.date <= date);
        &self.bookings[lo..hi]
    }
}

/// A booking with every reference resolved, as returned to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingDetail {
    pub booking: Booking,
    pub room: Room,
    pub time_slot: TimeSlot,
    pub creator: User,
}

/// What was removed by a delete. `bookings` lists cascaded booking ids.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteReport {
    pub id: Ulid,
    pub bookings: Vec<Ulid>,
}

// ── WAL events ────────────────────────────────────────────────

/// One durable mutation. Cascading deletes carry the removed booking ids
/// so the parent and its dependents disappear in a single record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated(Room),
    RoomUpdated(Room),
    RoomDeleted { id: Ulid, bookings: Vec<Ulid> },
    TimeSlotCreated(TimeSlot),
    TimeSlotUpdated(TimeSlot),
    TimeSlotDeleted { id: Ulid, bookings: Vec<Ulid> },
    UserCreated(User),
    UserUpdated(User),
    UserDeleted { id: Ulid, bookings: Vec<Ulid> },
    BookingCreated(Booking),
    BookingUpdated(Booking),
    BookingDeleted { id: Ulid, room_id: Ulid },
}
