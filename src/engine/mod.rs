mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod registry;

pub use error::{EngineError, ErrorKind, Invalid};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

type Ack = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append { event: Event, response: Ack },
    Compact { events: Vec<Event>, response: Ack },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Pull every append already queued behind `first`. Stops at the first
/// command of another kind and hands it back so it runs after the batch.
fn drain_appends(
    rx: &mut mpsc::Receiver<WalCommand>,
    first: (Event, Ack),
) -> (Vec<(Event, Ack)>, Option<WalCommand>) {
    let mut batch = vec![first];
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            WalCommand::Append { event, response } => batch.push((event, response)),
            other => return (batch, Some(other)),
        }
    }
    (batch, None)
}

/// Owns the WAL. Appends that queue up while a flush is in progress share
/// the next fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            run_command(&mut wal, cmd);
            continue;
        };
        let (batch, deferred) = drain_appends(&mut rx, (event, response));

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let started = std::time::Instant::now();
        let result = write_batch(&mut wal, batch.iter().map(|(event, _)| event));
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
        }
        for (_, ack) in batch {
            let _ = ack.send(
                result
                    .as_ref()
                    .map(|_| ())
                    .map_err(|e| io::Error::new(e.kind(), e.to_string())),
            );
        }

        if let Some(cmd) = deferred {
            run_command(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn write_batch<'a>(wal: &mut Wal, events: impl Iterator<Item = &'a Event>) -> io::Result<()> {
    let appended = events
        .map(|event| wal.append_buffered(event))
        .find(Result::is_err)
        .unwrap_or(Ok(()));
    // Flush regardless so a half-written batch cannot prefix the next one.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn run_command(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Append { event, response } => {
            let _ = response.send(write_batch(wal, std::iter::once(&event)));
        }
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

/// The reservation engine for one organization.
///
/// Every room owns its own `RwLock`. Writes to a room (conflict check, WAL
/// append, in-memory apply) run under that room's write lock, so two writers
/// racing for the same room serialize while writers on different rooms never
/// touch each other's locks.
pub struct Engine {
    rooms: DashMap<Ulid, SharedRoomState>,
    /// Trimmed room name → room id.
    room_names: DashMap<String, Ulid>,
    /// Reservation id → room currently holding it.
    reservation_to_room: DashMap<Ulid, Ulid>,
    /// Serializes room-registry writes (create/rename/delete) and compaction.
    registry_lock: Mutex<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Apply a reservation or room-update event to one room (caller holds the lock).
fn apply_to_room(rs: &mut RoomState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::RoomUpdated { room } => {
            rs.room = room.clone();
        }
        Event::ReservationCreated { reservation, .. } => {
            rs.insert_reservation(reservation.clone());
            index.insert(reservation.id, reservation.room_id);
        }
        Event::ReservationUpdated { reservation, .. } => {
            rs.remove_reservation(reservation.id);
            if rs.room.id == reservation.room_id {
                rs.insert_reservation(reservation.clone());
                index.insert(reservation.id, reservation.room_id);
            }
        }
        Event::ReservationCancelled { id, cancelled_at, .. } => {
            if let Some(r) = rs.reservations.iter_mut().find(|r| r.id == *id) {
                r.cancelled_at = Some(*cancelled_at);
            }
        }
        // Handled at the map level.
        Event::RoomCreated { .. } | Event::RoomDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let index = DashMap::new();
        let mut rooms: HashMap<Ulid, RoomState> = HashMap::new();
        for event in &events {
            match event {
                Event::RoomCreated { room } => {
                    rooms.insert(room.id, RoomState::new(room.clone()));
                }
                Event::RoomDeleted { id } => {
                    rooms.remove(id);
                }
                other => {
                    for room_id in other.room_ids() {
                        if let Some(rs) = rooms.get_mut(&room_id) {
                            apply_to_room(rs, other, &index);
                        }
                    }
                }
            }
        }

        let room_names = DashMap::new();
        let state = DashMap::new();
        for (id, rs) in rooms {
            room_names.insert(rs.room.name.clone(), id);
            state.insert(id, Arc::new(RwLock::new(rs)));
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events: {} rooms, {} reservations",
                events.len(),
                state.len(),
                index.len()
            );
        }

        Ok(Self {
            rooms: state,
            room_names,
            reservation_to_room: index,
            registry_lock: Mutex::new(()),
            wal_tx,
            notify,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn room_state(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn room_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_room.get(reservation_id).map(|e| *e.value())
    }

    /// Snapshot of room handles. Never hold DashMap refs across an await.
    pub(super) fn room_handles(&self) -> Vec<SharedRoomState> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// WAL-append then apply, under the caller's room lock.
    pub(super) async fn commit(&self, rs: &mut RoomState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.reservation_to_room);
        Ok(())
    }
}
