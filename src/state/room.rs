//! Room Manager
//!
//! Authoritative in-gateway view of room membership, readiness and
//! ownership. Rooms are mirrored to the backend when one is configured;
//! if room creation cannot reach the backend the room lives locally
//! (degraded mode) instead of failing.
//!
//! All state sits behind one lock. Backend calls are made with the lock
//! released and their results applied afterwards under the write lock.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::backend::{
    BackendClient, BackendError, BackendRoom, CallScope, GameStateSnapshot, NewRoom,
    PersistedState, RoomStateUpdate,
};
use crate::network::protocol::Metadata;

/// Room visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// Anyone may join.
    Public,
    /// Listed only to those who know the id; optional password.
    Private {
        /// Required password, if any.
        password: Option<String>,
    },
}

impl Visibility {
    /// Build from wire fields. An empty password means none.
    pub fn from_wire(is_private: bool, password: &str) -> Self {
        if is_private {
            Visibility::Private {
                password: (!password.is_empty()).then(|| password.to_string()),
            }
        } else {
            Visibility::Public
        }
    }

    /// Whether the room is private.
    pub fn is_private(&self) -> bool {
        matches!(self, Visibility::Private { .. })
    }

    /// The password, if the room has one.
    pub fn password(&self) -> Option<&str> {
        match self {
            Visibility::Private { password } => password.as_deref(),
            Visibility::Public => None,
        }
    }

    /// Whether `attempt` satisfies this visibility.
    pub fn admits(&self, attempt: Option<&str>) -> bool {
        match self.password() {
            Some(expected) => attempt == Some(expected),
            None => true,
        }
    }
}

/// A member of a room.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    /// Player id.
    pub player_id: String,
    /// Connection the player joined from.
    pub session_id: String,
    /// Ready flag.
    pub ready: bool,
    /// Per-player metadata.
    pub metadata: Metadata,
    /// Join time.
    pub joined_at: DateTime<Utc>,
}

/// A grouping of players sharing game state.
#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    /// Room id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Game type.
    pub game_type: String,
    /// Capacity, zero is unbounded.
    pub capacity: u32,
    /// Visibility and password.
    pub visibility: Visibility,
    /// Current owner.
    pub owner_id: String,
    /// Members by player id.
    pub members: BTreeMap<String, Member>,
    /// Free-form metadata.
    pub metadata: Metadata,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// True when the backend holds an authoritative copy.
    pub mirrored: bool,
}

impl Room {
    fn from_backend(record: BackendRoom) -> Self {
        let now = Utc::now();
        Self {
            visibility: Visibility::from_wire(
                record.is_private,
                record.password.as_deref().unwrap_or(""),
            ),
            id: record.id,
            name: record.name,
            game_type: record.game_type,
            capacity: record.max_players,
            owner_id: record.owner_id,
            members: BTreeMap::new(),
            metadata: record.metadata,
            created_at: now,
            updated_at: now,
            mirrored: true,
        }
    }

    /// Whether no more members fit.
    pub fn is_full(&self) -> bool {
        self.capacity > 0 && self.members.len() >= self.capacity as usize
    }

    /// Whether a player is a member.
    pub fn has_member(&self, player_id: &str) -> bool {
        self.members.contains_key(player_id)
    }

    /// Member ids in stable order.
    pub fn member_ids(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    /// Number of members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Non-empty and every member ready.
    pub fn all_ready(&self) -> bool {
        !self.members.is_empty() && self.members.values().all(|m| m.ready)
    }

    /// Earliest joiner, ties broken by player id.
    fn successor(&self) -> Option<String> {
        self.members
            .values()
            .min_by(|a, b| {
                a.joined_at
                    .cmp(&b.joined_at)
                    .then_with(|| a.player_id.cmp(&b.player_id))
            })
            .map(|m| m.player_id.clone())
    }
}

/// Result of removing a player from a room.
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    /// Room the player left.
    pub room_id: String,
    /// Player who left.
    pub player_id: String,
    /// True if the room became empty and was removed.
    pub room_deleted: bool,
    /// Set when ownership moved to another member.
    pub new_owner: Option<String>,
    /// Members still in the room.
    pub remaining: Vec<String>,
    /// Whether the room was mirrored to the backend.
    pub mirrored: bool,
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    /// Room after the join.
    pub room: Room,
    /// Departure from the player's previous room, if any.
    pub departed: Option<Departure>,
    /// The player was already a member; nothing changed.
    pub already_member: bool,
}

/// Result of a room creation.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOutcome {
    /// The new room.
    pub room: Room,
    /// Departure from the owner's previous room, if any.
    pub departed: Option<Departure>,
}

/// Room creation parameters.
#[derive(Debug, Clone)]
pub struct CreateRoom {
    /// Display name.
    pub name: String,
    /// Game type.
    pub game_type: String,
    /// Capacity, zero is unbounded.
    pub capacity: u32,
    /// Visibility.
    pub visibility: Visibility,
    /// Creator, seeded as owner and first member.
    pub owner_id: String,
    /// Creator's connection.
    pub owner_session_id: String,
    /// Room metadata.
    pub metadata: Metadata,
}

/// Room operation errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoomError {
    /// No such room.
    #[error("room {0} not found")]
    NotFound(String),
    /// Password mismatch.
    #[error("invalid room password")]
    InvalidPassword,
    /// At capacity.
    #[error("room {0} is full")]
    Full(String),
    /// Player is not in any room.
    #[error("player is not in a room")]
    NotInRoom,
    /// Player is in a different room than the one named.
    #[error("player is not in room {0}")]
    WrongRoom(String),
    /// Backend rejected the operation.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result of admitting a player under the table lock.
enum Admission {
    AlreadyMember(Room),
    Joined {
        room: Room,
        departed: Option<Departure>,
    },
}

#[derive(Default)]
struct RoomTable {
    rooms: HashMap<String, Room>,
    player_rooms: HashMap<String, String>,
}

impl RoomTable {
    /// Add a player to the room described by `snapshot`, re-checking
    /// membership and capacity against the live table.
    fn admit(
        &mut self,
        snapshot: &Room,
        player_id: &str,
        session_id: &str,
        metadata: Metadata,
    ) -> Result<Admission, RoomError> {
        let room_id = snapshot.id.as_str();
        if !self.rooms.contains_key(room_id) {
            if !snapshot.mirrored {
                return Err(RoomError::NotFound(room_id.to_string()));
            }
            let mut fresh = snapshot.clone();
            fresh.members.clear();
            self.rooms.insert(room_id.to_string(), fresh);
        }

        if let Some(room) = self.rooms.get(room_id) {
            if room.has_member(player_id) {
                return Ok(Admission::AlreadyMember(room.clone()));
            }
            if room.is_full() {
                return Err(RoomError::Full(room_id.to_string()));
            }
        }

        let departed = self.remove_player(player_id);
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;

        let now = Utc::now();
        room.members.insert(
            player_id.to_string(),
            Member {
                player_id: player_id.to_string(),
                session_id: session_id.to_string(),
                ready: false,
                metadata,
                joined_at: now,
            },
        );
        if !room.has_member(&room.owner_id) {
            room.owner_id = player_id.to_string();
        }
        room.updated_at = now;
        let room = room.clone();
        self.player_rooms
            .insert(player_id.to_string(), room_id.to_string());
        Ok(Admission::Joined { room, departed })
    }

    /// Remove a player from their room, deleting or re-owning it as needed.
    fn remove_player(&mut self, player_id: &str) -> Option<Departure> {
        let room_id = self.player_rooms.remove(player_id)?;
        let room = self.rooms.get_mut(&room_id)?;
        room.members.remove(player_id);
        room.updated_at = Utc::now();

        let mirrored = room.mirrored;
        if room.members.is_empty() {
            self.rooms.remove(&room_id);
            return Some(Departure {
                room_id,
                player_id: player_id.to_string(),
                room_deleted: true,
                new_owner: None,
                remaining: Vec::new(),
                mirrored,
            });
        }

        let mut new_owner = None;
        if room.owner_id == player_id || !room.has_member(&room.owner_id) {
            if let Some(successor) = room.successor() {
                room.owner_id = successor.clone();
                new_owner = Some(successor);
            }
        }

        Some(Departure {
            room_id,
            player_id: player_id.to_string(),
            room_deleted: false,
            new_owner,
            remaining: room.member_ids(),
            mirrored,
        })
    }
}

/// Room membership, readiness and ownership.
pub struct RoomManager {
    table: RwLock<RoomTable>,
    backend: Option<BackendClient>,
}

impl RoomManager {
    /// Create a manager; `None` keeps every room local.
    pub fn new(backend: Option<BackendClient>) -> Self {
        Self {
            table: RwLock::new(RoomTable::default()),
            backend,
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Snapshot of a room.
    pub async fn get_room(&self, room_id: &str) -> Option<Room> {
        self.table.read().await.rooms.get(room_id).cloned()
    }

    /// Snapshot of the room a player is in.
    pub async fn player_room(&self, player_id: &str) -> Option<Room> {
        let table = self.table.read().await;
        table
            .player_rooms
            .get(player_id)
            .and_then(|id| table.rooms.get(id))
            .cloned()
    }

    /// Member ids of a room; empty if it does not exist.
    pub async fn players_in_room(&self, room_id: &str) -> Vec<String> {
        self.table
            .read()
            .await
            .rooms
            .get(room_id)
            .map(Room::member_ids)
            .unwrap_or_default()
    }

    /// Number of rooms.
    pub async fn room_count(&self) -> usize {
        self.table.read().await.rooms.len()
    }

    /// Non-empty room where every member is ready.
    pub async fn are_all_ready(&self, room_id: &str) -> bool {
        self.table
            .read()
            .await
            .rooms
            .get(room_id)
            .is_some_and(Room::all_ready)
    }

    // =========================================================================
    // MUTATIONS
    // =========================================================================

    /// Create a room with the requester as owner and sole member.
    ///
    /// Falls back to a local-only room when the backend call fails.
    pub async fn create_room(&self, scope: &CallScope, request: CreateRoom) -> CreateOutcome {
        let mirrored = match &self.backend {
            Some(backend) => {
                let new_room = NewRoom {
                    name: request.name.clone(),
                    game_type: request.game_type.clone(),
                    max_players: request.capacity,
                    is_private: request.visibility.is_private(),
                    password: request.visibility.password().map(str::to_string),
                    owner_id: request.owner_id.clone(),
                    metadata: request.metadata.clone(),
                };
                match backend.create_room(scope, new_room).await {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(error = %e, "backend room create failed, using local room");
                        None
                    }
                }
            }
            None => None,
        };

        let now = Utc::now();
        let (id, metadata, is_mirrored) = match mirrored {
            Some(record) => {
                let mut metadata = request.metadata;
                metadata.extend(record.metadata);
                (record.id, metadata, true)
            }
            None => (uuid::Uuid::new_v4().to_string(), request.metadata, false),
        };

        let mut members = BTreeMap::new();
        members.insert(
            request.owner_id.clone(),
            Member {
                player_id: request.owner_id.clone(),
                session_id: request.owner_session_id,
                ready: false,
                metadata: Metadata::new(),
                joined_at: now,
            },
        );
        let room = Room {
            id: id.clone(),
            name: request.name,
            game_type: request.game_type,
            capacity: request.capacity,
            visibility: request.visibility,
            owner_id: request.owner_id.clone(),
            members,
            metadata,
            created_at: now,
            updated_at: now,
            mirrored: is_mirrored,
        };

        let departed = {
            let mut table = self.table.write().await;
            let departed = table.remove_player(&request.owner_id);
            table.rooms.insert(id.clone(), room.clone());
            table.player_rooms.insert(request.owner_id.clone(), id.clone());
            departed
        };

        if let Some(departure) = &departed {
            self.mirror_leave(scope, departure).await;
        }

        info!(room_id = %id, owner = %request.owner_id, mirrored = is_mirrored, "room created");
        CreateOutcome { room, departed }
    }

    /// Add a player to a room, leaving any previous room first.
    pub async fn join_room(
        &self,
        scope: &CallScope,
        room_id: &str,
        player_id: &str,
        session_id: &str,
        password: Option<&str>,
        metadata: Metadata,
    ) -> Result<JoinOutcome, RoomError> {
        let known = self.get_room(room_id).await;
        let snapshot = match known {
            Some(room) => room,
            None => self.fetch_room(scope, room_id).await?,
        };

        if snapshot.has_member(player_id) {
            return Ok(JoinOutcome {
                room: snapshot,
                departed: None,
                already_member: true,
            });
        }
        if !snapshot.visibility.admits(password) {
            return Err(RoomError::InvalidPassword);
        }
        if snapshot.is_full() {
            return Err(RoomError::Full(room_id.to_string()));
        }

        let mut backend_joined = false;
        if snapshot.mirrored {
            if let Some(backend) = &self.backend {
                match backend.join_room(scope, room_id, player_id, password).await {
                    Ok(_) => backend_joined = true,
                    Err(e) if e.is_connectivity() => {
                        warn!(room_id = %room_id, error = %e, "backend join unreachable, joining locally");
                    }
                    Err(e) => return Err(RoomError::Backend(e)),
                }
            }
        }

        let admitted = self.table.write().await.admit(
            &snapshot,
            player_id,
            session_id,
            metadata,
        );
        let (room, departed) = match admitted {
            Ok(Admission::AlreadyMember(room)) => {
                return Ok(JoinOutcome {
                    room,
                    departed: None,
                    already_member: true,
                })
            }
            Ok(Admission::Joined { room, departed }) => (room, departed),
            Err(e) => {
                if backend_joined {
                    self.mirror_leave(
                        scope,
                        &Departure {
                            room_id: room_id.to_string(),
                            player_id: player_id.to_string(),
                            room_deleted: false,
                            new_owner: None,
                            remaining: Vec::new(),
                            mirrored: true,
                        },
                    )
                    .await;
                }
                return Err(e);
            }
        };

        if let Some(departure) = &departed {
            self.mirror_leave(scope, departure).await;
        }

        info!(room_id = %room_id, player_id = %player_id, members = room.member_count(), "player joined room");
        Ok(JoinOutcome {
            room,
            departed,
            already_member: false,
        })
    }

    /// Remove a player from their room.
    pub async fn leave_room(
        &self,
        scope: &CallScope,
        player_id: &str,
    ) -> Result<Departure, RoomError> {
        let departure = self
            .table
            .write()
            .await
            .remove_player(player_id)
            .ok_or(RoomError::NotInRoom)?;

        self.mirror_leave(scope, &departure).await;
        info!(
            room_id = %departure.room_id,
            player_id = %player_id,
            room_deleted = departure.room_deleted,
            "player left room"
        );
        Ok(departure)
    }

    /// Set a member's ready flag. Returns the room id and whether everyone is ready.
    pub async fn set_ready(
        &self,
        scope: &CallScope,
        player_id: &str,
        ready: bool,
    ) -> Result<(String, bool), RoomError> {
        let (room_id, all_ready, mirrored) = {
            let mut table = self.table.write().await;
            let room_id = table
                .player_rooms
                .get(player_id)
                .cloned()
                .ok_or(RoomError::NotInRoom)?;
            let room = table
                .rooms
                .get_mut(&room_id)
                .ok_or(RoomError::NotInRoom)?;
            let member = room
                .members
                .get_mut(player_id)
                .ok_or(RoomError::NotInRoom)?;
            member.ready = ready;
            room.updated_at = Utc::now();
            (room_id, room.all_ready(), room.mirrored)
        };

        if mirrored {
            if let Some(backend) = &self.backend {
                let mut metadata = Metadata::new();
                metadata.insert(format!("player_{}_ready", player_id), ready.to_string());
                let update = RoomStateUpdate {
                    room_id: room_id.clone(),
                    metadata,
                    ..Default::default()
                };
                if let Err(e) = backend.update_room_state(scope, update).await {
                    warn!(room_id = %room_id, error = %e, "failed to mirror ready flag");
                }
            }
        }

        debug!(room_id = %room_id, player_id = %player_id, ready, all_ready, "ready changed");
        Ok((room_id, all_ready))
    }

    /// Forcibly remove a member.
    pub async fn kick(
        &self,
        scope: &CallScope,
        room_id: &str,
        player_id: &str,
        reason: &str,
    ) -> Result<Departure, RoomError> {
        let mirrored = {
            let table = self.table.read().await;
            let room = table
                .rooms
                .get(room_id)
                .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
            if !room.has_member(player_id) {
                return Err(RoomError::WrongRoom(room_id.to_string()));
            }
            room.mirrored
        };

        if mirrored {
            if let Some(backend) = &self.backend {
                if let Err(e) = backend.kick_player(scope, room_id, player_id, reason).await {
                    warn!(room_id = %room_id, player_id = %player_id, error = %e, "backend kick failed");
                }
            }
        }

        let departure = {
            let mut table = self.table.write().await;
            if table.player_rooms.get(player_id).map(String::as_str) != Some(room_id) {
                return Err(RoomError::WrongRoom(room_id.to_string()));
            }
            table.remove_player(player_id).ok_or(RoomError::NotInRoom)?
        };

        info!(room_id = %room_id, player_id = %player_id, reason = %reason, "player kicked");
        Ok(departure)
    }

    /// Forward a game-state transition and refresh local metadata from the reply.
    ///
    /// Without a backend the update is applied locally.
    pub async fn update_state(
        &self,
        scope: &CallScope,
        player_id: &str,
        mut update: RoomStateUpdate,
    ) -> Result<Room, RoomError> {
        let room = self.player_room(player_id).await.ok_or(RoomError::NotInRoom)?;
        update.room_id = room.id.clone();

        let refreshed = match (&self.backend, room.mirrored) {
            (Some(backend), true) => backend.update_room_state(scope, update).await?.metadata,
            _ => {
                let mut metadata = update.metadata;
                if !update.state.is_empty() {
                    metadata.insert("state".into(), update.state);
                }
                if !update.current_turn_player_id.is_empty() {
                    metadata.insert("current_turn_player_id".into(), update.current_turn_player_id);
                    metadata.insert("turn_number".into(), update.turn_number.to_string());
                }
                metadata
            }
        };

        self.merge_metadata(&room.id, refreshed).await
    }

    /// Persist a full snapshot through the backend.
    pub async fn persist_game_state(
        &self,
        scope: &CallScope,
        player_id: &str,
        mut snapshot: GameStateSnapshot,
    ) -> Result<PersistedState, RoomError> {
        let room = self.player_room(player_id).await.ok_or(RoomError::NotInRoom)?;
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| BackendError::unavailable("no backend configured"))?;
        if !room.mirrored {
            return Err(RoomError::Backend(BackendError::unavailable(
                "room is not mirrored to the backend",
            )));
        }

        snapshot.room_id = room.id.clone();
        let persisted = backend.persist_game_state(scope, snapshot).await?;
        self.merge_metadata(&room.id, persisted.metadata.clone())
            .await?;
        Ok(persisted)
    }

    /// Remove a room and all of its memberships.
    pub async fn delete_room(&self, scope: &CallScope, room_id: &str) -> Result<Room, RoomError> {
        let room = {
            let mut table = self.table.write().await;
            let room = table
                .rooms
                .remove(room_id)
                .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
            for player_id in room.members.keys() {
                table.player_rooms.remove(player_id);
            }
            room
        };

        if room.mirrored {
            if let Some(backend) = &self.backend {
                if let Err(e) = backend.delete_room(scope, room_id).await {
                    warn!(room_id = %room_id, error = %e, "backend room delete failed");
                }
            }
        }

        info!(room_id = %room_id, "room deleted");
        Ok(room)
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    async fn fetch_room(&self, scope: &CallScope, room_id: &str) -> Result<Room, RoomError> {
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
        match backend.get_room(scope, room_id).await {
            Ok(record) => Ok(Room::from_backend(record)),
            Err(e) if e.is_connectivity() || e.code == crate::backend::BackendCode::NotFound => {
                debug!(room_id = %room_id, error = %e, "room lookup failed");
                Err(RoomError::NotFound(room_id.to_string()))
            }
            Err(e) => Err(RoomError::Backend(e)),
        }
    }

    async fn mirror_leave(&self, scope: &CallScope, departure: &Departure) {
        if !departure.mirrored {
            return;
        }
        if let Some(backend) = &self.backend {
            if let Err(e) = backend
                .leave_room(scope, &departure.room_id, &departure.player_id)
                .await
            {
                warn!(
                    room_id = %departure.room_id,
                    player_id = %departure.player_id,
                    error = %e,
                    "backend leave failed"
                );
            }
        }
    }

    async fn merge_metadata(&self, room_id: &str, metadata: Metadata) -> Result<Room, RoomError> {
        let mut table = self.table.write().await;
        let room = table
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
        room.metadata.extend(metadata);
        room.updated_at = Utc::now();
        Ok(room.clone())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendTimeouts, MemoryBackend};
    use std::sync::Arc;

    fn scope() -> CallScope {
        CallScope::new("g1")
    }

    fn request(owner: &str, capacity: u32) -> CreateRoom {
        CreateRoom {
            name: "r1".into(),
            game_type: "test".into(),
            capacity,
            visibility: Visibility::Public,
            owner_id: owner.into(),
            owner_session_id: format!("s-{}", owner),
            metadata: Metadata::new(),
        }
    }

    async fn join(manager: &RoomManager, room_id: &str, player: &str) -> Result<JoinOutcome, RoomError> {
        manager
            .join_room(&scope(), room_id, player, &format!("s-{}", player), None, Metadata::new())
            .await
    }

    fn with_backend() -> (Arc<MemoryBackend>, RoomManager) {
        let backend = Arc::new(MemoryBackend::default());
        let client = BackendClient::new(backend.clone(), BackendTimeouts::default());
        (backend, RoomManager::new(Some(client)))
    }

    #[tokio::test]
    async fn test_create_seeds_owner() {
        let manager = RoomManager::new(None);
        let outcome = manager.create_room(&scope(), request("a", 4)).await;

        assert_eq!(outcome.room.owner_id, "a");
        assert_eq!(outcome.room.member_count(), 1);
        assert!(!outcome.room.mirrored);
        assert!(outcome.departed.is_none());
        assert_eq!(manager.player_room("a").await.unwrap().id, outcome.room.id);
    }

    #[tokio::test]
    async fn test_create_mirrors_to_backend() {
        let (backend, manager) = with_backend();
        let outcome = manager.create_room(&scope(), request("a", 4)).await;

        assert!(outcome.room.mirrored);
        assert!(backend.room(&scope(), &outcome.room.id).await.is_some());
    }

    #[tokio::test]
    async fn test_create_falls_back_when_backend_down() {
        let (backend, manager) = with_backend();
        backend.set_available(false);

        let outcome = manager.create_room(&scope(), request("a", 4)).await;
        assert!(!outcome.room.mirrored);
        assert_eq!(manager.room_count().await, 1);

        // Local rooms stay usable
        join(&manager, &outcome.room.id, "b").await.unwrap();
        assert_eq!(manager.players_in_room(&outcome.room.id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_join_respects_capacity() {
        let manager = RoomManager::new(None);
        let room = manager.create_room(&scope(), request("a", 2)).await.room;

        join(&manager, &room.id, "b").await.unwrap();
        let err = join(&manager, &room.id, "c").await.unwrap_err();
        assert_eq!(err, RoomError::Full(room.id.clone()));
    }

    #[tokio::test]
    async fn test_zero_capacity_is_unbounded() {
        let manager = RoomManager::new(None);
        let room = manager.create_room(&scope(), request("a", 0)).await.room;

        for i in 0..50 {
            join(&manager, &room.id, &format!("p{}", i)).await.unwrap();
        }
        assert_eq!(manager.players_in_room(&room.id).await.len(), 51);
    }

    #[tokio::test]
    async fn test_private_room_password() {
        let manager = RoomManager::new(None);
        let mut req = request("a", 4);
        req.visibility = Visibility::Private {
            password: Some("secret".into()),
        };
        let room = manager.create_room(&scope(), req).await.room;

        let err = manager
            .join_room(&scope(), &room.id, "b", "s-b", Some("nope"), Metadata::new())
            .await
            .unwrap_err();
        assert_eq!(err, RoomError::InvalidPassword);

        manager
            .join_room(&scope(), &room.id, "b", "s-b", Some("secret"), Metadata::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_join_unknown_room() {
        let manager = RoomManager::new(None);
        let err = join(&manager, "nope", "a").await.unwrap_err();
        assert_eq!(err, RoomError::NotFound("nope".into()));
    }

    #[tokio::test]
    async fn test_join_leaves_previous_room() {
        let manager = RoomManager::new(None);
        let a = manager.create_room(&scope(), request("a", 4)).await.room;
        let b = manager.create_room(&scope(), request("b", 4)).await.room;

        join(&manager, &a.id, "c").await.unwrap();
        let outcome = join(&manager, &b.id, "c").await.unwrap();

        let departed = outcome.departed.unwrap();
        assert_eq!(departed.room_id, a.id);
        assert!(!manager.get_room(&a.id).await.unwrap().has_member("c"));
        assert!(manager.get_room(&b.id).await.unwrap().has_member("c"));
    }

    #[tokio::test]
    async fn test_rejoin_same_room_is_noop() {
        let manager = RoomManager::new(None);
        let room = manager.create_room(&scope(), request("a", 4)).await.room;

        let outcome = join(&manager, &room.id, "a").await.unwrap();
        assert!(outcome.already_member);
        assert_eq!(manager.players_in_room(&room.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_owner_leave_promotes_earliest() {
        let manager = RoomManager::new(None);
        let room = manager.create_room(&scope(), request("a", 4)).await.room;
        join(&manager, &room.id, "c").await.unwrap();
        join(&manager, &room.id, "b").await.unwrap();

        let departure = manager.leave_room(&scope(), "a").await.unwrap();
        assert_eq!(departure.new_owner.as_deref(), Some("c"));
        assert!(!departure.room_deleted);

        let room = manager.get_room(&room.id).await.unwrap();
        assert_eq!(room.owner_id, "c");
        assert!(!room.has_member("a"));
    }

    #[tokio::test]
    async fn test_last_leave_deletes_room() {
        let manager = RoomManager::new(None);
        let room = manager.create_room(&scope(), request("a", 4)).await.room;

        let departure = manager.leave_room(&scope(), "a").await.unwrap();
        assert!(departure.room_deleted);
        assert!(manager.get_room(&room.id).await.is_none());
        assert_eq!(
            manager.leave_room(&scope(), "a").await.unwrap_err(),
            RoomError::NotInRoom
        );
    }

    #[tokio::test]
    async fn test_ready_tracking() {
        let manager = RoomManager::new(None);
        let room = manager.create_room(&scope(), request("a", 4)).await.room;
        join(&manager, &room.id, "b").await.unwrap();

        let (_, all) = manager.set_ready(&scope(), "a", true).await.unwrap();
        assert!(!all);
        let (_, all) = manager.set_ready(&scope(), "b", true).await.unwrap();
        assert!(all);
        assert!(manager.are_all_ready(&room.id).await);
        assert!(!manager.are_all_ready("missing").await);
    }

    #[tokio::test]
    async fn test_ready_mirrored_to_backend() {
        let (backend, manager) = with_backend();
        let room = manager.create_room(&scope(), request("a", 4)).await.room;

        manager.set_ready(&scope(), "a", true).await.unwrap();
        let stored = backend.room(&scope(), &room.id).await.unwrap();
        assert_eq!(
            stored.metadata.get("player_a_ready").map(String::as_str),
            Some("true")
        );
    }

    #[tokio::test]
    async fn test_kick_removes_member() {
        let manager = RoomManager::new(None);
        let room = manager.create_room(&scope(), request("a", 4)).await.room;
        join(&manager, &room.id, "b").await.unwrap();

        let departure = manager.kick(&scope(), &room.id, "b", "afk").await.unwrap();
        assert_eq!(departure.player_id, "b");
        assert!(manager.player_room("b").await.is_none());

        let err = manager.kick(&scope(), &room.id, "b", "afk").await.unwrap_err();
        assert_eq!(err, RoomError::WrongRoom(room.id.clone()));
    }

    #[tokio::test]
    async fn test_join_backend_room_not_cached_locally() {
        let (backend, manager) = with_backend();
        let record = backend
            .create_room(
                &scope(),
                NewRoom {
                    name: "remote".into(),
                    max_players: 4,
                    owner_id: "ghost".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let outcome = join(&manager, &record.id, "a").await.unwrap();
        assert_eq!(outcome.room.member_count(), 1);
        assert_eq!(outcome.room.owner_id, "a");
        assert!(outcome.room.mirrored);
    }

    #[tokio::test]
    async fn test_update_state_refreshes_metadata() {
        let (_backend, manager) = with_backend();
        let room = manager.create_room(&scope(), request("a", 4)).await.room;

        let updated = manager
            .update_state(
                &scope(),
                "a",
                RoomStateUpdate {
                    state: "playing".into(),
                    current_turn_player_id: "a".into(),
                    turn_number: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.id, room.id);
        assert_eq!(updated.metadata.get("state").map(String::as_str), Some("playing"));
        assert_eq!(updated.metadata.get("turn_number").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn test_persist_requires_backend() {
        let manager = RoomManager::new(None);
        manager.create_room(&scope(), request("a", 4)).await;

        let err = manager
            .persist_game_state(&scope(), "a", GameStateSnapshot::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Backend(e) if e.is_connectivity()));
    }

    #[tokio::test]
    async fn test_persist_versions_increase() {
        let (_backend, manager) = with_backend();
        manager.create_room(&scope(), request("a", 4)).await;

        let first = manager
            .persist_game_state(&scope(), "a", GameStateSnapshot::default())
            .await
            .unwrap();
        let second = manager
            .persist_game_state(&scope(), "a", GameStateSnapshot::default())
            .await
            .unwrap();
        assert!(second.version > first.version);
    }

    #[tokio::test]
    async fn test_delete_room_clears_memberships() {
        let manager = RoomManager::new(None);
        let room = manager.create_room(&scope(), request("a", 4)).await.room;
        join(&manager, &room.id, "b").await.unwrap();

        let removed = manager.delete_room(&scope(), &room.id).await.unwrap();
        assert_eq!(removed.member_count(), 2);
        assert!(manager.player_room("a").await.is_none());
        assert!(manager.player_room("b").await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_joins_never_exceed_capacity() {
        let manager = Arc::new(RoomManager::new(None));
        let room = manager.create_room(&scope(), request("owner", 5)).await.room;

        let mut handles = Vec::new();
        for i in 0..20 {
            let manager = manager.clone();
            let room_id = room.id.clone();
            handles.push(tokio::spawn(async move {
                join(&manager, &room_id, &format!("p{}", i)).await.is_ok()
            }));
        }
        let mut joined = 0;
        for handle in handles {
            if handle.await.unwrap() {
                joined += 1;
            }
        }

        assert_eq!(joined, 4);
        assert_eq!(manager.players_in_room(&room.id).await.len(), 5);
    }

    /// Memory backend with unbounded rooms whose joins wait on a barrier,
    /// so concurrent joins all pass the backend before any is applied locally.
    struct GatedBackend {
        inner: MemoryBackend,
        gate: tokio::sync::Barrier,
    }

    #[async_trait::async_trait]
    impl Backend for GatedBackend {
        async fn authenticate(
            &self,
            scope: &CallScope,
            device_id: Option<&str>,
            token: Option<&str>,
        ) -> Result<crate::backend::AuthSession, BackendError> {
            self.inner.authenticate(scope, device_id, token).await
        }
        async fn update_player(
            &self,
            scope: &CallScope,
            player_id: &str,
            display_name: &str,
            metadata: &Metadata,
        ) -> Result<crate::backend::PlayerProfile, BackendError> {
            self.inner.update_player(scope, player_id, display_name, metadata).await
        }
        async fn get_player_attributes(
            &self,
            scope: &CallScope,
            player_id: &str,
            collection: &str,
            key: Option<&str>,
        ) -> Result<crate::backend::AttributeSet, BackendError> {
            self.inner.get_player_attributes(scope, player_id, collection, key).await
        }
        async fn update_player_attribute(
            &self,
            scope: &CallScope,
            attribute: crate::backend::Attribute,
        ) -> Result<crate::backend::Attribute, BackendError> {
            self.inner.update_player_attribute(scope, attribute).await
        }
        async fn delete_player_attribute(
            &self,
            scope: &CallScope,
            player_id: &str,
            collection: &str,
            key: &str,
        ) -> Result<(), BackendError> {
            self.inner.delete_player_attribute(scope, player_id, collection, key).await
        }
        async fn create_room(&self, scope: &CallScope, mut room: NewRoom) -> Result<BackendRoom, BackendError> {
            room.max_players = 0;
            self.inner.create_room(scope, room).await
        }
        async fn get_room(&self, scope: &CallScope, room_id: &str) -> Result<BackendRoom, BackendError> {
            self.inner.get_room(scope, room_id).await
        }
        async fn join_room(
            &self,
            scope: &CallScope,
            room_id: &str,
            player_id: &str,
            password: Option<&str>,
        ) -> Result<BackendRoom, BackendError> {
            let joined = self.inner.join_room(scope, room_id, player_id, password).await;
            self.gate.wait().await;
            joined
        }
        async fn leave_room(&self, scope: &CallScope, room_id: &str, player_id: &str) -> Result<(), BackendError> {
            self.inner.leave_room(scope, room_id, player_id).await
        }
        async fn delete_room(&self, scope: &CallScope, room_id: &str) -> Result<(), BackendError> {
            self.inner.delete_room(scope, room_id).await
        }
        async fn kick_player(
            &self,
            scope: &CallScope,
            room_id: &str,
            player_id: &str,
            reason: &str,
        ) -> Result<(), BackendError> {
            self.inner.kick_player(scope, room_id, player_id, reason).await
        }
        async fn update_room_state(
            &self,
            scope: &CallScope,
            update: RoomStateUpdate,
        ) -> Result<BackendRoom, BackendError> {
            self.inner.update_room_state(scope, update).await
        }
        async fn persist_game_state(
            &self,
            scope: &CallScope,
            snapshot: GameStateSnapshot,
        ) -> Result<PersistedState, BackendError> {
            self.inner.persist_game_state(scope, snapshot).await
        }
        async fn create_ticket(
            &self,
            scope: &CallScope,
            request: crate::backend::TicketRequest,
        ) -> Result<String, BackendError> {
            self.inner.create_ticket(scope, request).await
        }
        async fn delete_ticket(&self, scope: &CallScope, player_id: &str, ticket_id: &str) -> Result<(), BackendError> {
            self.inner.delete_ticket(scope, player_id, ticket_id).await
        }
        fn channel_state(&self) -> crate::backend::ChannelState {
            self.inner.channel_state()
        }
    }

    #[tokio::test]
    async fn test_local_full_undoes_backend_join() {
        let backend = Arc::new(GatedBackend {
            inner: MemoryBackend::default(),
            gate: tokio::sync::Barrier::new(2),
        });
        let manager = RoomManager::new(Some(BackendClient::new(
            backend.clone(),
            BackendTimeouts::default(),
        )));
        let room = manager.create_room(&scope(), request("a", 2)).await.room;
        assert!(room.mirrored);

        let (b, c) = tokio::join!(join(&manager, &room.id, "b"), join(&manager, &room.id, "c"));
        let (winner, loser) = match (b, c) {
            (Ok(_), Err(e)) => ("b", e),
            (Err(e), Ok(_)) => ("c", e),
            other => panic!("expected exactly one join to fit, got {:?}", other),
        };
        assert!(matches!(loser, RoomError::Full(_)));

        let local = manager.get_room(&room.id).await.unwrap();
        assert_eq!(local.member_count(), 2);
        let mirrored = backend.inner.room(&scope(), &room.id).await.unwrap();
        let mut expected = vec!["a".to_string(), winner.to_string()];
        expected.sort();
        let mut actual = mirrored.player_ids.clone();
        actual.sort();
        assert_eq!(actual, expected);
    }
}
