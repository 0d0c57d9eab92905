pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_PASSWORD_LEN: usize = 1024;
pub const MIN_PASSWORD_LEN: usize = 6;

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_TIME_SLOTS: usize = 10_000;
pub const MAX_USERS: usize = 100_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 100_000;
pub const MAX_ROOM_CAPACITY: u32 = 100_000;

/// A booking that moves between rooms while an update waits for locks is re-resolved this many times.
pub const MAX_LOCK_RETRIES: usize = 3;
