use thiserror::Error;
use ulid::Ulid;

use crate::model::ReservationStatus;

/// Broad error class, one per caller reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Permission,
    Storage,
}

/// Why a request was rejected as malformed or out of range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Invalid {
    #[error("invalid_interval")]
    InvalidInterval,
    #[error("room_inactive")]
    RoomInactive,
    #[error("capacity_exceeded: {participants} participants, room holds {capacity}")]
    CapacityExceeded { participants: u32, capacity: u32 },
    #[error("not_modifiable: reservation is {0}")]
    NotModifiable(ReservationStatus),
    #[error("already_completed")]
    AlreadyCompleted,
    #[error("duplicate_name: {0}")]
    DuplicateName(String),
    #[error("invalid_capacity")]
    InvalidCapacity,
    #[error("invalid_participants")]
    InvalidParticipants,
    #[error("empty_name")]
    EmptyName,
    #[error("empty_title")]
    EmptyTitle,
    #[error("room_has_reservations")]
    RoomHasReservations,
    #[error("duplicate_id: {0}")]
    DuplicateId(Ulid),
    #[error("limit_exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl Invalid {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Invalid::InvalidInterval => "invalid_interval",
            Invalid::RoomInactive => "room_inactive",
            Invalid::CapacityExceeded { .. } => "capacity_exceeded",
            Invalid::NotModifiable(_) => "not_modifiable",
            Invalid::AlreadyCompleted => "already_completed",
            Invalid::DuplicateName(_) => "duplicate_name",
            Invalid::InvalidCapacity => "invalid_capacity",
            Invalid::InvalidParticipants => "invalid_participants",
            Invalid::EmptyName => "empty_name",
            Invalid::EmptyTitle => "empty_title",
            Invalid::RoomHasReservations => "room_has_reservations",
            Invalid::DuplicateId(_) => "duplicate_id",
            Invalid::LimitExceeded(_) => "limit_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(Invalid),
    /// Overlap with the given reservation on the same room.
    #[error("conflict: time_overlap with reservation {0}")]
    Conflict(Ulid),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::PermissionDenied(_) => ErrorKind::Permission,
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(invalid) => invalid.code(),
            EngineError::Conflict(_) => "time_overlap",
            EngineError::NotFound(_) => "not_found",
            EngineError::PermissionDenied(_) => "permission_denied",
            EngineError::WalError(_) => "storage",
        }
    }
}

impl From<Invalid> for EngineError {
    fn from(invalid: Invalid) -> Self {
        EngineError::Validation(invalid)
    }
}
