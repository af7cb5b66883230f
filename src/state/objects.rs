//! Network Object Registry
//!
//! Per-room table of replicated objects, indexed by view id, room and owner.
//! View ids come from a process-wide counter and are never reused.
//! Ownership checks are the caller's job.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::network::protocol::{ObjectInstantiate, Properties, Quaternion, Vector3};

/// Replicated object identifier.
pub type ViewId = u64;

/// Partial transform. `None` fields are left untouched on update.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Transform {
    /// Position.
    pub position: Option<Vector3>,
    /// Rotation.
    pub rotation: Option<Quaternion>,
    /// Scale.
    pub scale: Option<Vector3>,
}

impl Transform {
    /// Whether any field is set.
    pub fn is_empty(&self) -> bool {
        self.position.is_none() && self.rotation.is_none() && self.scale.is_none()
    }
}

/// A replicated entity scoped to a room.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkObject {
    /// View id.
    pub view_id: ViewId,
    /// Owning player; empty means backend authority.
    pub owner_id: String,
    /// Room the object lives in.
    pub room_id: String,
    /// Prefab/type name.
    pub prefab_name: String,
    /// Current position.
    pub position: Option<Vector3>,
    /// Current rotation.
    pub rotation: Option<Quaternion>,
    /// Current scale.
    pub scale: Option<Vector3>,
    /// Named byte-valued properties.
    pub properties: Properties,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl NetworkObject {
    /// Wire form.
    pub fn to_instantiate(&self) -> ObjectInstantiate {
        ObjectInstantiate {
            view_id: self.view_id,
            owner_id: self.owner_id.clone(),
            prefab_name: self.prefab_name.clone(),
            position: self.position,
            rotation: self.rotation,
            scale: self.scale,
            properties: self.properties.clone(),
        }
    }
}

/// Object registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectError {
    /// No object with that view id.
    #[error("object {0} not found")]
    NotFound(ViewId),
}

#[derive(Default)]
struct ObjectTable {
    objects: HashMap<ViewId, NetworkObject>,
    by_room: HashMap<String, BTreeSet<ViewId>>,
    by_owner: HashMap<String, BTreeSet<ViewId>>,
}

impl ObjectTable {
    fn unlink(&mut self, object: &NetworkObject) {
        if let Some(ids) = self.by_room.get_mut(&object.room_id) {
            ids.remove(&object.view_id);
            if ids.is_empty() {
                self.by_room.remove(&object.room_id);
            }
        }
        if let Some(ids) = self.by_owner.get_mut(&object.owner_id) {
            ids.remove(&object.view_id);
            if ids.is_empty() {
                self.by_owner.remove(&object.owner_id);
            }
        }
    }

    fn remove(&mut self, view_id: ViewId) -> Option<NetworkObject> {
        let object = self.objects.remove(&view_id)?;
        self.unlink(&object);
        Some(object)
    }
}

/// Replicated objects for every room.
pub struct ObjectRegistry {
    next_view_id: AtomicU64,
    table: RwLock<ObjectTable>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    /// Empty registry; the first view id is 1.
    pub fn new() -> Self {
        Self {
            next_view_id: AtomicU64::new(1),
            table: RwLock::new(ObjectTable::default()),
        }
    }

    /// Spawn an object and index it under its room and owner.
    pub async fn create_object(
        &self,
        owner_id: &str,
        room_id: &str,
        prefab_name: &str,
        transform: Transform,
        properties: Properties,
    ) -> NetworkObject {
        let view_id = self.next_view_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let object = NetworkObject {
            view_id,
            owner_id: owner_id.to_string(),
            room_id: room_id.to_string(),
            prefab_name: prefab_name.to_string(),
            position: transform.position,
            rotation: transform.rotation,
            scale: transform.scale,
            properties,
            created_at: now,
            updated_at: now,
        };

        let mut table = self.table.write().await;
        table
            .by_room
            .entry(object.room_id.clone())
            .or_default()
            .insert(view_id);
        if !object.owner_id.is_empty() {
            table
                .by_owner
                .entry(object.owner_id.clone())
                .or_default()
                .insert(view_id);
        }
        table.objects.insert(view_id, object.clone());

        debug!(view_id, room_id = %room_id, owner = %owner_id, prefab = %prefab_name, "object created");
        object
    }

    /// Snapshot of one object.
    pub async fn get(&self, view_id: ViewId) -> Option<NetworkObject> {
        self.table.read().await.objects.get(&view_id).cloned()
    }

    /// Overwrite only the supplied transform fields.
    pub async fn update_transform(
        &self,
        view_id: ViewId,
        transform: Transform,
    ) -> Result<NetworkObject, ObjectError> {
        let mut table = self.table.write().await;
        let object = table
            .objects
            .get_mut(&view_id)
            .ok_or(ObjectError::NotFound(view_id))?;
        if let Some(position) = transform.position {
            object.position = Some(position);
        }
        if let Some(rotation) = transform.rotation {
            object.rotation = Some(rotation);
        }
        if let Some(scale) = transform.scale {
            object.scale = Some(scale);
        }
        object.updated_at = Utc::now();
        Ok(object.clone())
    }

    /// Merge properties into the existing map.
    pub async fn update_properties(
        &self,
        view_id: ViewId,
        properties: Properties,
    ) -> Result<NetworkObject, ObjectError> {
        let mut table = self.table.write().await;
        let object = table
            .objects
            .get_mut(&view_id)
            .ok_or(ObjectError::NotFound(view_id))?;
        object.properties.extend(properties);
        object.updated_at = Utc::now();
        Ok(object.clone())
    }

    /// Remove an object. Returns the room it lived in.
    pub async fn delete_object(&self, view_id: ViewId) -> Option<String> {
        let removed = self.table.write().await.remove(view_id)?;
        debug!(view_id, room_id = %removed.room_id, "object destroyed");
        Some(removed.room_id)
    }

    /// Objects in a room, by view id.
    pub async fn room_objects(&self, room_id: &str) -> Vec<NetworkObject> {
        let table = self.table.read().await;
        table
            .by_room
            .get(room_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| table.objects.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Objects owned by a player, by view id.
    pub async fn player_objects(&self, player_id: &str) -> Vec<NetworkObject> {
        let table = self.table.read().await;
        table
            .by_owner
            .get(player_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| table.objects.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove every object in a room.
    pub async fn cleanup_room(&self, room_id: &str) -> Vec<NetworkObject> {
        let mut table = self.table.write().await;
        let ids = table.by_room.remove(room_id).unwrap_or_default();
        let removed: Vec<NetworkObject> = ids.into_iter().filter_map(|id| table.remove(id)).collect();
        if !removed.is_empty() {
            debug!(room_id = %room_id, count = removed.len(), "room objects purged");
        }
        removed
    }

    /// Remove every object a player owns.
    pub async fn cleanup_player(&self, player_id: &str) -> Vec<NetworkObject> {
        let mut table = self.table.write().await;
        let ids = table.by_owner.remove(player_id).unwrap_or_default();
        let removed: Vec<NetworkObject> = ids.into_iter().filter_map(|id| table.remove(id)).collect();
        if !removed.is_empty() {
            debug!(player_id = %player_id, count = removed.len(), "player objects purged");
        }
        removed
    }

    /// Remove the objects a player owns in one room.
    pub async fn release_player_room(&self, player_id: &str, room_id: &str) -> Vec<NetworkObject> {
        let mut table = self.table.write().await;
        let ids: Vec<ViewId> = match table.by_owner.get(player_id) {
            Some(ids) => ids
                .iter()
                .copied()
                .filter(|id| {
                    table
                        .objects
                        .get(id)
                        .is_some_and(|o| o.room_id == room_id)
                })
                .collect(),
            None => return Vec::new(),
        };
        ids.into_iter().filter_map(|id| table.remove(id)).collect()
    }

    /// Number of live objects.
    pub async fn object_count(&self) -> usize {
        self.table.read().await.objects.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================
