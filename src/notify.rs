use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::ReservationInfo;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    ReservationCreated,
    ReservationUpdated,
    ReservationCancelled,
}

impl LifecycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleKind::ReservationCreated => "reservation_created",
            LifecycleKind::ReservationUpdated => "reservation_updated",
            LifecycleKind::ReservationCancelled => "reservation_cancelled",
        }
    }
}

/// Emitted after a reservation write commits. Carries the full snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub reservation: ReservationInfo,
    pub actor: String,
}

/// Broadcast hub for lifecycle events, per room and organization-wide.
/// Publishing never fails: lagging or absent subscribers are ignored.
pub struct NotifyHub {
    rooms: DashMap<Ulid, broadcast::Sender<LifecycleEvent>>,
    all: broadcast::Sender<LifecycleEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to events for one room. Creates the channel if needed.
    pub fn subscribe(&self, room_id: Ulid) -> broadcast::Receiver<LifecycleEvent> {
        let sender = self
            .rooms
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.all.subscribe()
    }

    /// Deliver to the organization channel and to every room the event
    /// touches (both rooms for a move).
    pub fn publish(&self, event: LifecycleEvent, previous_room_id: Option<Ulid>) {
        if let Some(prev) = previous_room_id.filter(|p| *p != event.reservation.room_id)
            && let Some(sender) = self.rooms.get(&prev)
        {
            let _ = sender.send(event.clone());
        }
        if let Some(sender) = self.rooms.get(&event.reservation.room_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event);
    }

    /// Drop a room's channel (room deleted).
    pub fn remove(&self, room_id: &Ulid) {
        self.rooms.remove(room_id);
    }
}
