use ulid::Ulid;

use crate::model::*;

use super::conflict::{now_ms, validate_window};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_room(&self, id: Ulid) -> Result<Room, EngineError> {
        let rs = self.room_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard.room.clone())
    }

    /// Rooms ordered by name.
    pub async fn list_rooms(&self, active_only: bool) -> Vec<Room> {
        let mut rooms = Vec::new();
        for rs in self.room_handles() {
            let guard = rs.read().await;
            if guard.deleted || (active_only && !guard.room.active) {
                continue;
            }
            rooms.push(guard.room.clone());
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        let room_id = self.room_for_reservation(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.room_state(&room_id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        guard
            .get_reservation(id)
            .map(|r| r.info(now_ms()))
            .ok_or(EngineError::NotFound(id))
    }

    /// Reservations matching the filter, ordered by start.
    pub async fn list_reservations(
        &self,
        filter: &ReservationFilter,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        if let (Some(from), Some(until)) = (filter.from, filter.until) {
            validate_window(from, until)?;
        }
        let handles = match filter.room_id {
            Some(room_id) => vec![self.room_state(&room_id).ok_or(EngineError::NotFound(room_id))?],
            None => self.room_handles(),
        };

        let now = now_ms();
        let mut out = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| filter.matches(r))
                    .map(|r| r.info(now)),
            );
        }
        out.sort_by_key(|r| (r.start, r.id));
        Ok(out)
    }
}
