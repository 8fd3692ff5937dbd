use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::Invalid;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

fn in_range(t: Ms) -> bool {
    (MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t)
}

/// Interval check for reservation spans: ordered, in range, not absurdly long.
/// `available_rooms` windows go through here too, so a window it accepts is
/// one a booking may cover.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end).ok_or(Invalid::InvalidInterval)?;
    if !in_range(span.start) || !in_range(span.end) {
        return Err(Invalid::LimitExceeded("timestamp out of range").into());
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(Invalid::LimitExceeded("reservation too long").into());
    }
    Ok(span)
}

/// Interval check for read windows. Bounds are range-checked before any
/// arithmetic on them.
pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let window = Span::try_new(start, end).ok_or(Invalid::InvalidInterval)?;
    if !in_range(window.start) || !in_range(window.end) {
        return Err(Invalid::LimitExceeded("timestamp out of range").into());
    }
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(Invalid::LimitExceeded("query window too wide").into());
    }
    Ok(window)
}

/// A single instant for point-in-time reads.
pub(crate) fn validate_instant(at: Ms) -> Result<Ms, EngineError> {
    if !in_range(at) {
        return Err(Invalid::LimitExceeded("timestamp out of range").into());
    }
    Ok(at)
}

pub(crate) fn normalize_name(name: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Invalid::EmptyName.into());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Invalid::LimitExceeded("room name too long").into());
    }
    Ok(name.to_string())
}

pub(crate) fn validate_room_fields(room: &Room) -> Result<(), EngineError> {
    if room.capacity == 0 {
        return Err(Invalid::InvalidCapacity.into());
    }
    if room.location.len() > MAX_LOCATION_LEN {
        return Err(Invalid::LimitExceeded("location too long").into());
    }
    if room.description.len() > MAX_DESCRIPTION_LEN {
        return Err(Invalid::LimitExceeded("description too long").into());
    }
    if room.resources.len() > MAX_RESOURCES {
        return Err(Invalid::LimitExceeded("too many resources").into());
    }
    Ok(())
}

/// Field-level checks that don't need the room.
pub(crate) fn validate_reservation_fields(r: &Reservation) -> Result<(), EngineError> {
    if r.title.trim().is_empty() {
        return Err(Invalid::EmptyTitle.into());
    }
    if r.title.len() > MAX_TITLE_LEN {
        return Err(Invalid::LimitExceeded("title too long").into());
    }
    if r.description.as_ref().is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(Invalid::LimitExceeded("description too long").into());
    }
    if r.owner.len() > MAX_OWNER_LEN {
        return Err(Invalid::LimitExceeded("owner id too long").into());
    }
    if r.participants == 0 {
        return Err(Invalid::InvalidParticipants.into());
    }
    Ok(())
}

pub(crate) fn check_capacity(room: &Room, participants: u32) -> Result<(), EngineError> {
    if participants > room.capacity {
        return Err(Invalid::CapacityExceeded {
            participants,
            capacity: room.capacity,
        }
        .into());
    }
    Ok(())
}

/// Overlap scan against every non-cancelled reservation of the room except
/// `exclude`. Caller must hold the room's write lock through the commit.
pub(crate) fn check_no_conflict(
    rs: &RoomState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match rs.first_conflict(span, exclude) {
        Some(blocking) => Err(EngineError::Conflict(blocking.id)),
        None => Ok(()),
    }
}
