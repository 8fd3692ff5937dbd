use tokio::sync::{oneshot, OwnedRwLockWriteGuard};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_capacity, check_no_conflict, validate_reservation_fields, validate_span};
use super::{apply_to_room, Engine, EngineError, Invalid, WalCommand};

/// A reservation can be moved between rooms while a writer waits for its
/// lock. After this many re-resolutions we give up.
const MAX_LOCK_ATTEMPTS: usize = 8;

/// Write locks covering one reservation: the room holding it and, for a move,
/// the destination room.
pub(super) struct WriteLocks {
    pub source: OwnedRwLockWriteGuard<RoomState>,
    pub target: Option<OwnedRwLockWriteGuard<RoomState>>,
}

impl WriteLocks {
    pub fn current(&self, id: Ulid) -> Option<&Reservation> {
        self.source.get_reservation(id)
    }

    /// The room a candidate will land in.
    pub fn target_state(&self) -> &RoomState {
        self.target.as_deref().unwrap_or(&*self.source)
    }
}

/// Room-level checks run under the target room's write lock. Activity is only
/// enforced when the reservation enters the room.
fn validate_candidate(
    target: &RoomState,
    candidate: &Reservation,
    entering: bool,
) -> Result<(), EngineError> {
    if target.deleted {
        return Err(EngineError::NotFound(target.room.id));
    }
    if entering && !target.room.active {
        return Err(Invalid::RoomInactive.into());
    }
    check_capacity(&target.room, candidate.participants)?;
    check_no_conflict(target, &candidate.span, Some(candidate.id))
}

impl Engine {
    /// Insert a new reservation. The interval, field, room, capacity and
    /// overlap checks all pass before anything is written.
    pub(super) async fn insert_reservation(
        &self,
        candidate: Reservation,
        actor: &str,
    ) -> Result<Reservation, EngineError> {
        validate_span(candidate.span.start, candidate.span.end)?;
        validate_reservation_fields(&candidate)?;
        if self.reservation_to_room.contains_key(&candidate.id) {
            return Err(Invalid::DuplicateId(candidate.id).into());
        }

        let rs = self
            .room_state(&candidate.room_id)
            .ok_or(EngineError::NotFound(candidate.room_id))?;
        let mut guard = rs.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(Invalid::LimitExceeded("too many reservations on room").into());
        }
        validate_candidate(&guard, &candidate, true)?;

        // Claim the id under the room lock so a racing insert on another room
        // with the same id loses.
        match self.reservation_to_room.entry(candidate.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Invalid::DuplicateId(candidate.id).into());
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(candidate.room_id);
            }
        }

        let event = Event::ReservationCreated {
            reservation: candidate.clone(),
            actor: actor.to_string(),
        };
        if let Err(e) = self.commit(&mut guard, &event).await {
            self.reservation_to_room.remove(&candidate.id);
            return Err(e);
        }
        Ok(candidate)
    }

    /// Lock the room holding `id` and, when `destination` names a different
    /// room, that room too. Locks are taken in ascending room id order.
    pub(super) async fn lock_reservation(
        &self,
        id: Ulid,
        destination: Option<Ulid>,
    ) -> Result<WriteLocks, EngineError> {
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let source_id = self.room_for_reservation(&id).ok_or(EngineError::NotFound(id))?;
            let source = self.room_state(&source_id).ok_or(EngineError::NotFound(id))?;

            let locks = match destination.filter(|d| *d != source_id) {
                None => WriteLocks {
                    source: source.write_owned().await,
                    target: None,
                },
                Some(dest_id) => {
                    let dest = self
                        .room_state(&dest_id)
                        .ok_or(EngineError::NotFound(dest_id))?;
                    let (source, target) = if source_id < dest_id {
                        let s = source.write_owned().await;
                        (s, dest.write_owned().await)
                    } else {
                        let t = dest.write_owned().await;
                        (source.write_owned().await, t)
                    };
                    WriteLocks {
                        source,
                        target: Some(target),
                    }
                }
            };

            if locks.current(id).is_some() {
                return Ok(locks);
            }
            // Moved while we waited; resolve again.
        }
        tracing::warn!("reservation {id} kept moving while waiting for its room lock");
        Err(EngineError::NotFound(id))
    }

    /// Commit an updated record. `candidate` has already passed the lifecycle
    /// checks; room-level checks run here against the locked target room.
    pub(super) async fn commit_update(
        &self,
        locks: &mut WriteLocks,
        candidate: Reservation,
        actor: &str,
    ) -> Result<Reservation, EngineError> {
        validate_span(candidate.span.start, candidate.span.end)?;
        validate_reservation_fields(&candidate)?;
        let previous_room_id = locks.source.room.id;
        let moving = locks.target.is_some();
        if moving && locks.target_state().reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(Invalid::LimitExceeded("too many reservations on room").into());
        }
        validate_candidate(locks.target_state(), &candidate, moving)?;

        let event = Event::ReservationUpdated {
            previous_room_id,
            reservation: candidate.clone(),
            actor: actor.to_string(),
        };
        self.wal_append(&event).await?;
        apply_to_room(&mut locks.source, &event, &self.reservation_to_room);
        if let Some(target) = locks.target.as_mut() {
            apply_to_room(target, &event, &self.reservation_to_room);
        }
        Ok(candidate)
    }

    pub(super) async fn commit_cancel(
        &self,
        locks: &mut WriteLocks,
        id: Ulid,
        cancelled_at: Ms,
        actor: &str,
    ) -> Result<(), EngineError> {
        let event = Event::ReservationCancelled {
            id,
            room_id: locks.source.room.id,
            cancelled_at,
            actor: actor.to_string(),
        };
        self.commit(&mut locks.source, &event).await
    }

    /// Rewrite the WAL with the minimal event set reproducing current state.
    /// Holds the registry lock and a read lock on every room until the new
    /// file is in place, so no committed write can land in the old file only.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;

        let mut handles: Vec<(Ulid, _)> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(handles.len());
        for (_, rs) in handles {
            guards.push(rs.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::RoomCreated {
                room: guard.room.clone(),
            });
        }
        for guard in &guards {
            for reservation in &guard.reservations {
                events.push(Event::ReservationCreated {
                    reservation: reservation.clone(),
                    actor: reservation.owner.clone(),
                });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);

        tracing::debug!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
