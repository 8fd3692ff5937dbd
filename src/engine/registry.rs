use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{normalize_name, now_ms, validate_room_fields};
use super::{Engine, EngineError, Invalid};

impl Engine {
    pub async fn create_room(&self, id: Ulid, draft: RoomDraft) -> Result<Room, EngineError> {
        let _registry = self.registry_lock.lock().await;
        if self.rooms.len() >= MAX_ROOMS_PER_ORGANIZATION {
            return Err(Invalid::LimitExceeded("too many rooms").into());
        }
        if self.rooms.contains_key(&id) {
            return Err(Invalid::DuplicateId(id).into());
        }

        let room = Room {
            id,
            name: normalize_name(&draft.name)?,
            capacity: draft.capacity,
            resources: normalize_resources(draft.resources),
            location: draft.location.trim().to_string(),
            description: draft.description,
            active: true,
            created_at: now_ms(),
        };
        validate_room_fields(&room)?;
        if self.room_names.contains_key(&room.name) {
            return Err(Invalid::DuplicateName(room.name).into());
        }

        let event = Event::RoomCreated { room: room.clone() };
        self.wal_append(&event).await?;
        self.room_names.insert(room.name.clone(), id);
        self.rooms
            .insert(id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
        tracing::debug!("room {id} created: {}", room.name);
        Ok(room)
    }

    /// Apply a partial update. Existing reservations are left untouched, even
    /// when capacity shrinks below their participant count.
    pub async fn update_room(&self, id: Ulid, patch: RoomPatch) -> Result<Room, EngineError> {
        let _registry = self.registry_lock.lock().await;
        let rs = self.room_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }

        let previous = guard.room.clone();
        let mut room = previous.clone();
        if let Some(name) = patch.name {
            room.name = normalize_name(&name)?;
        }
        if let Some(capacity) = patch.capacity {
            room.capacity = capacity;
        }
        if let Some(resources) = patch.resources {
            room.resources = normalize_resources(resources);
        }
        if let Some(location) = patch.location {
            room.location = location.trim().to_string();
        }
        if let Some(description) = patch.description {
            room.description = description;
        }
        if let Some(active) = patch.active {
            room.active = active;
        }
        validate_room_fields(&room)?;
        if room == previous {
            return Ok(room);
        }
        if room.name != previous.name
            && self.room_names.get(&room.name).is_some_and(|owner| *owner != id)
        {
            return Err(Invalid::DuplicateName(room.name).into());
        }

        let event = Event::RoomUpdated { room: room.clone() };
        self.commit(&mut guard, &event).await?;
        if room.name != previous.name {
            self.room_names.remove(&previous.name);
            self.room_names.insert(room.name.clone(), id);
        }
        if room.active != previous.active {
            tracing::info!("room {id} active={}", room.active);
        }
        Ok(room)
    }

    /// Take the room out of availability searches. Its reservations stay valid.
    pub async fn deactivate_room(&self, id: Ulid) -> Result<Room, EngineError> {
        self.update_room(
            id,
            RoomPatch {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    /// Delete a room that never held a reservation. Rooms with history must be
    /// deactivated instead.
    pub async fn delete_room(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;
        let rs = self.room_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if guard.deleted {
            return Err(EngineError::NotFound(id));
        }
        if !guard.reservations.is_empty() {
            return Err(Invalid::RoomHasReservations.into());
        }

        let event = Event::RoomDeleted { id };
        self.wal_append(&event).await?;
        guard.deleted = true;
        self.room_names.remove(&guard.room.name);
        self.rooms.remove(&id);
        self.notify.remove(&id);
        tracing::debug!("room {id} deleted");
        Ok(())
    }
}

fn normalize_resources(resources: Vec<String>) -> Vec<String> {
    resources
        .into_iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect()
}
