use ulid::Ulid;

use crate::model::*;
use crate::notify::{LifecycleEvent, LifecycleKind};
use crate::observability::{RESERVATIONS_COMMITTED_TOTAL, RESERVATION_CONFLICTS_TOTAL};

use super::conflict::{now_ms, validate_span};
use super::{Engine, EngineError, Invalid};

fn normalize_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}

/// Count the outcome of a reservation write.
fn observe<T>(op: &'static str, id: Ulid, result: Result<T, EngineError>) -> Result<T, EngineError> {
    match &result {
        Ok(_) => {
            metrics::counter!(RESERVATIONS_COMMITTED_TOTAL, "op" => op).increment(1);
            tracing::debug!("{op} {id} committed");
        }
        Err(EngineError::Conflict(blocking)) => {
            metrics::counter!(RESERVATION_CONFLICTS_TOTAL).increment(1);
            tracing::debug!("{op} {id} rejected: overlaps {blocking}");
        }
        Err(EngineError::WalError(e)) => tracing::error!("{op} {id} failed: {e}"),
        Err(e) => tracing::debug!("{op} {id} rejected: {e}"),
    }
    result
}

impl Engine {
    /// Ownership check against the reservation's current room, taken before a
    /// move resolves its destination, so a stranger cannot learn which room
    /// ids exist.
    /// Repeated under the write locks.
    async fn authorize_modify(&self, id: Ulid, actor: &Actor) -> Result<(), EngineError> {
        let room_id = self.room_for_reservation(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.room_state(&room_id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        match guard.get_reservation(id) {
            Some(current) if !actor.may_modify(current) => Err(EngineError::PermissionDenied(
                format!("{} may not modify reservation {id}", actor.id),
            )),
            _ => Ok(()),
        }
    }

    /// Book a room. The caller becomes the owner; the reservation starts out
    /// scheduled.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        draft: ReservationDraft,
        actor: &Actor,
    ) -> Result<ReservationInfo, EngineError> {
        let result: Result<ReservationInfo, EngineError> = async move {
            let now = now_ms();
            let candidate = Reservation {
                id,
                room_id: draft.room_id,
                owner: actor.id.clone(),
                title: draft.title.trim().to_string(),
                description: normalize_description(draft.description),
                span: validate_span(draft.start, draft.end)?,
                participants: draft.participants,
                cancelled_at: None,
                created_at: now,
                updated_at: now,
            };
            let reservation = self.insert_reservation(candidate, &actor.id).await?;
            Ok(reservation.info(now))
        }
        .await;
        let info = observe("create", id, result)?;

        self.notify.publish(
            LifecycleEvent {
                kind: LifecycleKind::ReservationCreated,
                reservation: info.clone(),
                actor: actor.id.clone(),
            },
            None,
        );
        Ok(info)
    }

    /// Change time, room, size or text of a scheduled reservation. The merged
    /// record goes through the same checks as a create.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
        actor: &Actor,
    ) -> Result<ReservationInfo, EngineError> {
        let result: Result<(ReservationInfo, Option<Ulid>), EngineError> = async move {
            if patch.room_id.is_some() {
                self.authorize_modify(id, actor).await?;
            }
            let mut locks = self.lock_reservation(id, patch.room_id).await?;
            let now = now_ms();
            let current = locks.current(id).ok_or(EngineError::NotFound(id))?.clone();

            if !actor.may_modify(&current) {
                return Err(EngineError::PermissionDenied(format!(
                    "{} may not modify reservation {id}",
                    actor.id
                )));
            }
            let status = current.status_at(now);
            if status != ReservationStatus::Scheduled {
                return Err(Invalid::NotModifiable(status).into());
            }

            let mut candidate = current.clone();
            if let Some(room_id) = patch.room_id {
                candidate.room_id = room_id;
            }
            if let Some(title) = patch.title {
                candidate.title = title.trim().to_string();
            }
            if let Some(description) = patch.description {
                candidate.description = normalize_description(description);
            }
            candidate.span = validate_span(
                patch.start.unwrap_or(current.span.start),
                patch.end.unwrap_or(current.span.end),
            )?;
            if let Some(participants) = patch.participants {
                candidate.participants = participants;
            }
            if candidate == current {
                return Ok((current.info(now), None));
            }
            candidate.updated_at = now;

            let reservation = self.commit_update(&mut locks, candidate, &actor.id).await?;
            Ok((reservation.info(now), Some(current.room_id)))
        }
        .await;
        let (info, previous_room_id) = observe("update", id, result)?;

        if previous_room_id.is_some() {
            self.notify.publish(
                LifecycleEvent {
                    kind: LifecycleKind::ReservationUpdated,
                    reservation: info.clone(),
                    actor: actor.id.clone(),
                },
                previous_room_id,
            );
        }
        Ok(info)
    }

    /// Cancel a scheduled or in-progress reservation. Cancelling twice returns
    /// the already-cancelled record without writing.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        actor: &Actor,
    ) -> Result<ReservationInfo, EngineError> {
        let result: Result<(ReservationInfo, bool), EngineError> = async move {
            let mut locks = self.lock_reservation(id, None).await?;
            let now = now_ms();
            let current = locks.current(id).ok_or(EngineError::NotFound(id))?.clone();

            if !actor.may_modify(&current) {
                return Err(EngineError::PermissionDenied(format!(
                    "{} may not cancel reservation {id}",
                    actor.id
                )));
            }
            match current.status_at(now) {
                ReservationStatus::Cancelled => return Ok((current.info(now), false)),
                ReservationStatus::Completed => return Err(Invalid::AlreadyCompleted.into()),
                ReservationStatus::Scheduled | ReservationStatus::InProgress => {}
            }

            self.commit_cancel(&mut locks, id, now, &actor.id).await?;
            let cancelled = locks.current(id).ok_or(EngineError::NotFound(id))?;
            Ok((cancelled.info(now), true))
        }
        .await;
        let (info, changed) = observe("cancel", id, result)?;

        if changed {
            self.notify.publish(
                LifecycleEvent {
                    kind: LifecycleKind::ReservationCancelled,
                    reservation: info.clone(),
                    actor: actor.id.clone(),
                },
                None,
            );
        }
        Ok(info)
    }
}
