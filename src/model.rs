use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC), the only time type.
pub type Ms = i64;

pub const DAY_MS: Ms = 24 * 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied bounds.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// The one overlap predicate. Touching intervals do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// UTC calendar day containing `t`.
    pub fn day_of(t: Ms) -> Self {
        let start = t - t.rem_euclid(DAY_MS);
        Self::new(start, start + DAY_MS)
    }
}

// ── Actors ───────────────────────────────────────────────────────

/// Capability flags granted by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Create, update, deactivate and delete rooms.
    ManageRooms,
    /// Update or cancel reservations owned by someone else.
    ManageAnyReservation,
}

/// An already-authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub capabilities: Vec<Capability>,
}

impl Actor {
    pub fn member(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: Vec::new(),
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: vec![Capability::ManageRooms, Capability::ManageAnyReservation],
        }
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Owner, or holder of the elevated capability.
    pub fn may_modify(&self, reservation: &Reservation) -> bool {
        reservation.owner == self.id || self.can(Capability::ManageAnyReservation)
    }
}

// ── Rooms ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    /// Max participants per reservation. Always > 0.
    pub capacity: u32,
    /// Equipment tags, e.g. "projector", "whiteboard".
    pub resources: Vec<String>,
    pub location: String,
    pub description: String,
    pub active: bool,
    pub created_at: Ms,
}

/// Fields for a new room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomDraft {
    pub name: String,
    pub capacity: u32,
    pub resources: Vec<String>,
    pub location: String,
    pub description: String,
}

/// Partial room update. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPatch {
    pub name: Option<String>,
    pub capacity: Option<u32>,
    pub resources: Option<Vec<String>>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub active: Option<bool>,
}

impl RoomPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Scheduled => "scheduled",
            ReservationStatus::InProgress => "in_progress",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored reservation. Only cancellation is persisted; the other statuses
/// are derived from the clock on every read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: Ulid,
    pub owner: String,
    pub title: String,
    pub description: Option<String>,
    pub span: Span,
    pub participants: u32,
    pub cancelled_at: Option<Ms>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    pub fn status_at(&self, now: Ms) -> ReservationStatus {
        if self.cancelled_at.is_some() {
            ReservationStatus::Cancelled
        } else if now >= self.span.end {
            ReservationStatus::Completed
        } else if now >= self.span.start {
            ReservationStatus::InProgress
        } else {
            ReservationStatus::Scheduled
        }
    }

    /// Counts against the room's timeline (every status but cancelled).
    pub fn is_blocking(&self) -> bool {
        self.cancelled_at.is_none()
    }

    pub fn info(&self, now: Ms) -> ReservationInfo {
        ReservationInfo {
            id: self.id,
            room_id: self.room_id,
            owner: self.owner.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            start: self.span.start,
            end: self.span.end,
            participants: self.participants,
            status: self.status_at(now),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Fields for a new reservation. The owner comes from the acting caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationDraft {
    pub room_id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub start: Ms,
    pub end: Ms,
    pub participants: u32,
}

/// Partial reservation update, merged over the stored record before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub room_id: Option<Ulid>,
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub participants: Option<u32>,
}

impl ReservationPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Reservation as returned to callers, status derived at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub room_id: Ulid,
    pub owner: String,
    pub title: String,
    pub description: Option<String>,
    pub start: Ms,
    pub end: Ms,
    pub participants: u32,
    pub status: ReservationStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

// ── Per-room state ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// All reservations ever made on this room (cancelled included), sorted by `span.start`.
    pub reservations: Vec<Reservation>,
    /// Set under the write lock when the room is deleted; writers still queued
    /// on the lock must not commit into it.
    pub deleted: bool,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            reservations: Vec::new(),
            deleted: false,
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get_reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations (any status) whose span overlaps the window.
    /// Binary search skips everything starting at or after `window.end`.
    pub fn overlapping(&self, window: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < window.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > window.start)
    }

    /// First non-cancelled reservation, other than `exclude`, overlapping `span`.
    pub fn first_conflict(&self, span: &Span, exclude: Option<Ulid>) -> Option<&Reservation> {
        self.overlapping(span)
            .find(|r| r.is_blocking() && Some(r.id) != exclude)
    }

    /// True if a non-cancelled reservation covers the instant.
    pub fn occupied_at(&self, t: Ms) -> bool {
        self.overlapping(&Span::new(t, t + 1))
            .any(|r| r.is_blocking() && r.span.contains_instant(t))
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        room: Room,
    },
    RoomUpdated {
        room: Room,
    },
    RoomDeleted {
        id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
        actor: String,
    },
    ReservationUpdated {
        previous_room_id: Ulid,
        reservation: Reservation,
        actor: String,
    },
    ReservationCancelled {
        id: Ulid,
        room_id: Ulid,
        cancelled_at: Ms,
        actor: String,
    },
}

impl Event {
    /// Rooms whose state this event touches.
    pub fn room_ids(&self) -> Vec<Ulid> {
        match self {
            Event::RoomCreated { room } | Event::RoomUpdated { room } => vec![room.id],
            Event::RoomDeleted { id } => vec![*id],
            Event::ReservationCreated { reservation, .. } => vec![reservation.room_id],
            Event::ReservationUpdated {
                previous_room_id,
                reservation,
                ..
            } => {
                if *previous_room_id == reservation.room_id {
                    vec![reservation.room_id]
                } else {
                    vec![*previous_room_id, reservation.room_id]
                }
            }
            Event::ReservationCancelled { room_id, .. } => vec![*room_id],
        }
    }
}

// ── Query types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub room_id: Option<Ulid>,
    pub owner: Option<String>,
    /// start >= from
    pub from: Option<Ms>,
    /// end <= until
    pub until: Option<Ms>,
    pub include_cancelled: bool,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.room_id.is_none_or(|id| r.room_id == id)
            && self.owner.as_deref().is_none_or(|o| r.owner == o)
            && self.from.is_none_or(|t| r.span.start >= t)
            && self.until.is_none_or(|t| r.span.end <= t)
            && (self.include_cancelled || r.is_blocking())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupancy {
    pub at: Ms,
    pub total_rooms: usize,
    pub occupied_rooms: usize,
    pub free_rooms: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dashboard {
    pub occupancy: Occupancy,
    pub reservations_today: usize,
    pub upcoming: Vec<ReservationInfo>,
}
