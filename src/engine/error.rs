use chrono::NaiveDate;
use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or out-of-range input. `field` names the first offending field.
    Validation {
        field: &'static str,
        message: String,
    },
    PastDate {
        date: NaiveDate,
        today: NaiveDate,
    },
    CapacityExceeded {
        attendees: u32,
        capacity: u32,
    },
    /// Carries the id of the existing booking the candidate collides with.
    Overlap(Ulid),
    NotFound {
        entity: &'static str,
        id: String,
    },
    AlreadyExists {
        entity: &'static str,
        id: String,
    },
    Forbidden(&'static str),
    Unauthenticated,
    LimitExceeded(&'static str),
    Cancelled,
    Timeout,
    WalError(String),
    Internal(String),
}

impl EngineError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn already_exists(entity: &'static str, id: impl ToString) -> Self {
        EngineError::AlreadyExists {
            entity,
            id: id.to_string(),
        }
    }

    /// HTTP-equivalent status class.
    pub fn status(&self) -> u16 {
        match self {
            EngineError::Validation { .. }
            | EngineError::PastDate { .. }
            | EngineError::CapacityExceeded { .. }
            | EngineError::Overlap(_)
            | EngineError::LimitExceeded(_) => 400,
            EngineError::Unauthenticated => 401,
            EngineError::Forbidden(_) => 403,
            EngineError::NotFound { .. } => 404,
            EngineError::AlreadyExists { .. } => 409,
            EngineError::Cancelled => 499,
            EngineError::Timeout => 503,
            EngineError::WalError(_) | EngineError::Internal(_) => 500,
        }
    }

    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "22023",
            EngineError::PastDate { .. } => "22008",
            EngineError::CapacityExceeded { .. } => "23514",
            EngineError::Overlap(_) => "23P01",
            EngineError::NotFound { .. } => "P0002",
            EngineError::AlreadyExists { .. } => "23505",
            EngineError::Forbidden(_) => "42501",
            EngineError::Unauthenticated => "28000",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Cancelled => "57014",
            EngineError::Timeout => "55P03",
            EngineError::WalError(_) | EngineError::Internal(_) => "XX000",
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "validation",
            EngineError::PastDate { .. } => "past_date",
            EngineError::CapacityExceeded { .. } => "capacity",
            EngineError::Overlap(_) => "overlap",
            EngineError::NotFound { .. } => "not_found",
            EngineError::AlreadyExists { .. } => "already_exists",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Unauthenticated => "unauthenticated",
            EngineError::LimitExceeded(_) => "limit",
            EngineError::Cancelled => "cancelled",
            EngineError::Timeout => "timeout",
            EngineError::WalError(_) => "wal",
            EngineError::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation { field, message } => write!(f, "invalid {field}: {message}"),
            EngineError::PastDate { date, today } => {
                write!(f, "booking date {date} is in the past (today is {today})")
            }
            EngineError::CapacityExceeded {
                attendees,
                capacity,
            } => write!(f, "{attendees} attendees exceed room capacity {capacity}"),
            EngineError::Overlap(id) => {
                write!(f, "room already booked for an overlapping time slot (booking {id})")
            }
            EngineError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            EngineError::AlreadyExists { entity, id } => write!(f, "{entity} already exists: {id}"),
            EngineError::Forbidden(reason) => write!(f, "forbidden: {reason}"),
            EngineError::Unauthenticated => write!(f, "authentication required"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Cancelled => write!(f, "request cancelled"),
            EngineError::Timeout => write!(f, "timed out waiting for a lock"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
