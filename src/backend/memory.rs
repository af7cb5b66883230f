//! In-Process Backend
//!
//! Keeps players, attributes, rooms and matchmaker tickets in memory,
//! partitioned by scope key. Used by the development binary and by tests.
//! [`MemoryBackend::set_available`] simulates an outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::auth::{derive_player_id, issue_token, validate_token, TokenConfig};
use super::{
    Attribute, AttributeSet, AuthSession, Backend, BackendCode, BackendError, BackendRoom,
    CallScope, ChannelState, GameStateSnapshot, NewRoom, PersistedState, PlayerProfile,
    RoomStateUpdate, TicketRequest,
};
use crate::network::protocol::Metadata;

/// Per-scope storage.
#[derive(Default)]
struct Tenant {
    players: HashMap<String, PlayerProfile>,
    /// (player, collection) -> key -> value
    attributes: HashMap<(String, String), Metadata>,
    rooms: HashMap<String, BackendRoom>,
    snapshots: HashMap<String, (u64, GameStateSnapshot)>,
    tickets: HashMap<String, TicketRequest>,
}

/// In-memory [`Backend`].
pub struct MemoryBackend {
    tokens: TokenConfig,
    tenants: RwLock<HashMap<String, Tenant>>,
    available: AtomicBool,
    next_room: AtomicU64,
}

impl MemoryBackend {
    /// Empty backend issuing tokens with the given configuration.
    pub fn new(tokens: TokenConfig) -> Self {
        Self {
            tokens,
            tenants: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            next_room: AtomicU64::new(1),
        }
    }

    /// Toggle simulated availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self, scope: &CallScope) -> Result<(), BackendError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::unavailable("backend offline"));
        }
        if scope.scope_key.is_empty() {
            return Err(BackendError::new(
                BackendCode::Unauthenticated,
                "missing game key",
            ));
        }
        Ok(())
    }

    /// Number of rooms stored under a scope.
    pub async fn room_count(&self, scope: &CallScope) -> usize {
        self.tenants
            .read()
            .await
            .get(&scope.scope_key)
            .map_or(0, |t| t.rooms.len())
    }

    /// Stored copy of a room.
    pub async fn room(&self, scope: &CallScope, room_id: &str) -> Option<BackendRoom> {
        self.tenants
            .read()
            .await
            .get(&scope.scope_key)
            .and_then(|t| t.rooms.get(room_id).cloned())
    }

    /// Whether a matchmaker ticket is open.
    pub async fn has_ticket(&self, scope: &CallScope, ticket_id: &str) -> bool {
        self.tenants
            .read()
            .await
            .get(&scope.scope_key)
            .is_some_and(|t| t.tickets.contains_key(ticket_id))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(TokenConfig::default())
    }
}

fn missing_room(room_id: &str) -> BackendError {
    BackendError::not_found(format!("room {} not found", room_id))
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn authenticate(
        &self,
        scope: &CallScope,
        device_id: Option<&str>,
        token: Option<&str>,
    ) -> Result<AuthSession, BackendError> {
        self.check(scope)?;

        let player_id = match (device_id.filter(|d| !d.is_empty()), token) {
            (Some(device), _) => derive_player_id(&scope.scope_key, device),
            (None, Some(token)) => validate_token(token, &scope.scope_key, &self.tokens)
                .map_err(|e| BackendError::new(BackendCode::Unauthenticated, e.to_string()))?
                .sub,
            (None, None) => {
                return Err(BackendError::new(
                    BackendCode::InvalidArgument,
                    "device_id or token required",
                ))
            }
        };

        let created = {
            let mut tenants = self.tenants.write().await;
            let tenant = tenants.entry(scope.scope_key.clone()).or_default();
            let created = !tenant.players.contains_key(&player_id);
            tenant
                .players
                .entry(player_id.clone())
                .or_insert_with(|| PlayerProfile {
                    player_id: player_id.clone(),
                    ..Default::default()
                });
            created
        };

        let token = issue_token(&player_id, &scope.scope_key, &self.tokens)
            .map_err(|e| BackendError::new(BackendCode::Internal, e.to_string()))?;

        debug!(player_id = %player_id, created, "authenticated");
        Ok(AuthSession {
            player_id,
            token,
            created,
        })
    }

    async fn update_player(
        &self,
        scope: &CallScope,
        player_id: &str,
        display_name: &str,
        metadata: &Metadata,
    ) -> Result<PlayerProfile, BackendError> {
        self.check(scope)?;
        let mut tenants = self.tenants.write().await;
        let profile = tenants
            .get_mut(&scope.scope_key)
            .and_then(|t| t.players.get_mut(player_id))
            .ok_or_else(|| BackendError::not_found("player not found"))?;

        if !display_name.is_empty() {
            profile.display_name = display_name.to_string();
        }
        profile
            .metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(profile.clone())
    }

    async fn get_player_attributes(
        &self,
        scope: &CallScope,
        player_id: &str,
        collection: &str,
        key: Option<&str>,
    ) -> Result<AttributeSet, BackendError> {
        self.check(scope)?;
        let tenants = self.tenants.read().await;
        let values = tenants
            .get(&scope.scope_key)
            .and_then(|t| t.attributes.get(&(player_id.to_string(), collection.to_string())));

        match key {
            Some(key) => {
                let value = values
                    .and_then(|v| v.get(key))
                    .ok_or_else(|| BackendError::not_found("attribute not found"))?;
                Ok(AttributeSet {
                    player_id: player_id.to_string(),
                    collection: collection.to_string(),
                    key: key.to_string(),
                    value: value.clone(),
                    attributes: Metadata::new(),
                })
            }
            None => Ok(AttributeSet {
                player_id: player_id.to_string(),
                collection: collection.to_string(),
                attributes: values.cloned().unwrap_or_default(),
                ..Default::default()
            }),
        }
    }

    async fn update_player_attribute(
        &self,
        scope: &CallScope,
        attribute: Attribute,
    ) -> Result<Attribute, BackendError> {
        self.check(scope)?;
        if attribute.collection.is_empty() || attribute.key.is_empty() {
            return Err(BackendError::new(
                BackendCode::InvalidArgument,
                "collection and key are required",
            ));
        }
        let mut tenants = self.tenants.write().await;
        let tenant = tenants.entry(scope.scope_key.clone()).or_default();
        tenant
            .attributes
            .entry((attribute.player_id.clone(), attribute.collection.clone()))
            .or_default()
            .insert(attribute.key.clone(), attribute.value.clone());
        Ok(attribute)
    }

    async fn delete_player_attribute(
        &self,
        scope: &CallScope,
        player_id: &str,
        collection: &str,
        key: &str,
    ) -> Result<(), BackendError> {
        self.check(scope)?;
        let mut tenants = self.tenants.write().await;
        tenants
            .get_mut(&scope.scope_key)
            .and_then(|t| {
                t.attributes
                    .get_mut(&(player_id.to_string(), collection.to_string()))
            })
            .and_then(|values| values.remove(key))
            .map(|_| ())
            .ok_or_else(|| BackendError::not_found("attribute not found"))
    }

    async fn create_room(
        &self,
        scope: &CallScope,
        room: NewRoom,
    ) -> Result<BackendRoom, BackendError> {
        self.check(scope)?;
        let id = format!("room-{}", self.next_room.fetch_add(1, Ordering::SeqCst));
        let record = BackendRoom {
            id: id.clone(),
            name: room.name,
            game_type: room.game_type,
            max_players: room.max_players,
            is_private: room.is_private,
            password: room.password,
            owner_id: room.owner_id.clone(),
            player_ids: vec![room.owner_id],
            metadata: room.metadata,
        };
        let mut tenants = self.tenants.write().await;
        tenants
            .entry(scope.scope_key.clone())
            .or_default()
            .rooms
            .insert(id, record.clone());
        Ok(record)
    }

    async fn get_room(&self, scope: &CallScope, room_id: &str) -> Result<BackendRoom, BackendError> {
        self.check(scope)?;
        self.tenants
            .read()
            .await
            .get(&scope.scope_key)
            .and_then(|t| t.rooms.get(room_id).cloned())
            .ok_or_else(|| missing_room(room_id))
    }

    async fn join_room(
        &self,
        scope: &CallScope,
        room_id: &str,
        player_id: &str,
        password: Option<&str>,
    ) -> Result<BackendRoom, BackendError> {
        self.check(scope)?;
        let mut tenants = self.tenants.write().await;
        let room = tenants
            .get_mut(&scope.scope_key)
            .and_then(|t| t.rooms.get_mut(room_id))
            .ok_or_else(|| missing_room(room_id))?;

        if room.is_private && room.password.is_some() && room.password.as_deref() != password {
            return Err(BackendError::new(
                BackendCode::PermissionDenied,
                "invalid password",
            ));
        }
        if room.player_ids.iter().any(|p| p == player_id) {
            return Ok(room.clone());
        }
        if room.max_players > 0 && room.player_ids.len() >= room.max_players as usize {
            return Err(BackendError::new(
                BackendCode::ResourceExhausted,
                "room is full",
            ));
        }
        room.player_ids.push(player_id.to_string());
        if room.owner_id.is_empty() {
            room.owner_id = player_id.to_string();
        }
        Ok(room.clone())
    }

    async fn leave_room(
        &self,
        scope: &CallScope,
        room_id: &str,
        player_id: &str,
    ) -> Result<(), BackendError> {
        self.check(scope)?;
        let mut tenants = self.tenants.write().await;
        let tenant = tenants
            .get_mut(&scope.scope_key)
            .ok_or_else(|| missing_room(room_id))?;
        let room = tenant
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| missing_room(room_id))?;

        room.player_ids.retain(|p| p != player_id);
        if room.player_ids.is_empty() {
            tenant.rooms.remove(room_id);
            tenant.snapshots.remove(room_id);
        } else if room.owner_id == player_id {
            room.owner_id = room.player_ids[0].clone();
        }
        Ok(())
    }

    async fn delete_room(&self, scope: &CallScope, room_id: &str) -> Result<(), BackendError> {
        self.check(scope)?;
        let mut tenants = self.tenants.write().await;
        let tenant = tenants
            .get_mut(&scope.scope_key)
            .ok_or_else(|| missing_room(room_id))?;
        tenant.snapshots.remove(room_id);
        tenant
            .rooms
            .remove(room_id)
            .map(|_| ())
            .ok_or_else(|| missing_room(room_id))
    }

    async fn kick_player(
        &self,
        scope: &CallScope,
        room_id: &str,
        player_id: &str,
        _reason: &str,
    ) -> Result<(), BackendError> {
        self.leave_room(scope, room_id, player_id).await
    }

    async fn update_room_state(
        &self,
        scope: &CallScope,
        update: RoomStateUpdate,
    ) -> Result<BackendRoom, BackendError> {
        self.check(scope)?;
        let mut tenants = self.tenants.write().await;
        let room = tenants
            .get_mut(&scope.scope_key)
            .and_then(|t| t.rooms.get_mut(&update.room_id))
            .ok_or_else(|| missing_room(&update.room_id))?;

        room.metadata.extend(update.metadata);
        if !update.state.is_empty() {
            room.metadata.insert("state".into(), update.state);
        }
        if !update.current_turn_player_id.is_empty() {
            room.metadata
                .insert("current_turn_player_id".into(), update.current_turn_player_id);
            room.metadata
                .insert("turn_number".into(), update.turn_number.to_string());
        }
        Ok(room.clone())
    }

    async fn persist_game_state(
        &self,
        scope: &CallScope,
        snapshot: GameStateSnapshot,
    ) -> Result<PersistedState, BackendError> {
        self.check(scope)?;
        let mut tenants = self.tenants.write().await;
        let tenant = tenants
            .get_mut(&scope.scope_key)
            .ok_or_else(|| missing_room(&snapshot.room_id))?;
        let room = tenant
            .rooms
            .get_mut(&snapshot.room_id)
            .ok_or_else(|| missing_room(&snapshot.room_id))?;

        room.metadata
            .extend(snapshot.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        let metadata = room.metadata.clone();

        let version = tenant
            .snapshots
            .get(&snapshot.room_id)
            .map_or(1, |(v, _)| v + 1);
        let room_id = snapshot.room_id.clone();
        tenant
            .snapshots
            .insert(room_id.clone(), (version, snapshot));

        Ok(PersistedState {
            room_id,
            version,
            metadata,
        })
    }

    async fn create_ticket(
        &self,
        scope: &CallScope,
        request: TicketRequest,
    ) -> Result<String, BackendError> {
        self.check(scope)?;
        let ticket = uuid::Uuid::new_v4().to_string();
        let mut tenants = self.tenants.write().await;
        tenants
            .entry(scope.scope_key.clone())
            .or_default()
            .tickets
            .insert(ticket.clone(), request);
        Ok(ticket)
    }

    async fn delete_ticket(
        &self,
        scope: &CallScope,
        player_id: &str,
        ticket_id: &str,
    ) -> Result<(), BackendError> {
        self.check(scope)?;
        let mut tenants = self.tenants.write().await;
        let tickets = &mut tenants
            .get_mut(&scope.scope_key)
            .ok_or_else(|| BackendError::not_found("ticket not found"))?
            .tickets;

        match tickets.get(ticket_id) {
            None => Err(BackendError::not_found("ticket not found")),
            Some(t) if t.player_id != player_id => Err(BackendError::new(
                BackendCode::PermissionDenied,
                "ticket belongs to another player",
            )),
            Some(_) => {
                tickets.remove(ticket_id);
                Ok(())
            }
        }
    }

    fn channel_state(&self) -> ChannelState {
        if self.available.load(Ordering::SeqCst) {
            ChannelState::Ready
        } else {
            ChannelState::TransientFailure
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> CallScope {
        CallScope::new("g1")
    }

    #[tokio::test]
    async fn test_device_auth_is_stable() {
        let backend = MemoryBackend::default();
        let first = backend.authenticate(&scope(), Some("d1"), None).await.unwrap();
        let second = backend.authenticate(&scope(), Some("d1"), None).await.unwrap();

        assert_eq!(first.player_id, second.player_id);
        assert!(first.created);
        assert!(!second.created);
        assert!(!first.token.is_empty());
    }

    #[tokio::test]
    async fn test_token_reauthentication() {
        let backend = MemoryBackend::default();
        let session = backend.authenticate(&scope(), Some("d1"), None).await.unwrap();

        let again = backend
            .authenticate(&scope(), None, Some(&session.token))
            .await
            .unwrap();
        assert_eq!(again.player_id, session.player_id);

        let err = backend
            .authenticate(&CallScope::new("g2"), None, Some(&session.token))
            .await
            .unwrap_err();
        assert_eq!(err.code, BackendCode::Unauthenticated);
    }

    #[tokio::test]
    async fn test_missing_scope_key_rejected() {
        let backend = MemoryBackend::default();
        let err = backend
            .authenticate(&CallScope::new(""), Some("d1"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, BackendCode::Unauthenticated);
    }

    #[tokio::test]
    async fn test_attributes_roundtrip() {
        let backend = MemoryBackend::default();
        backend
            .update_player_attribute(
                &scope(),
                Attribute {
                    player_id: "p1".into(),
                    collection: "stats".into(),
                    key: "wins".into(),
                    value: "3".into(),
                },
            )
            .await
            .unwrap();

        let one = backend
            .get_player_attributes(&scope(), "p1", "stats", Some("wins"))
            .await
            .unwrap();
        assert_eq!(one.value, "3");

        let all = backend
            .get_player_attributes(&scope(), "p1", "stats", None)
            .await
            .unwrap();
        assert_eq!(all.attributes.get("wins").map(String::as_str), Some("3"));

        backend
            .delete_player_attribute(&scope(), "p1", "stats", "wins")
            .await
            .unwrap();
        let err = backend
            .get_player_attributes(&scope(), "p1", "stats", Some("wins"))
            .await
            .unwrap_err();
        assert_eq!(err.code, BackendCode::NotFound);
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let backend = MemoryBackend::default();
        let room = backend
            .create_room(
                &scope(),
                NewRoom {
                    name: "r1".into(),
                    max_players: 2,
                    owner_id: "a".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        backend.join_room(&scope(), &room.id, "b", None).await.unwrap();
        let err = backend
            .join_room(&scope(), &room.id, "c", None)
            .await
            .unwrap_err();
        assert_eq!(err.code, BackendCode::ResourceExhausted);

        backend.leave_room(&scope(), &room.id, "a").await.unwrap();
        assert_eq!(backend.room(&scope(), &room.id).await.unwrap().owner_id, "b");

        backend.leave_room(&scope(), &room.id, "b").await.unwrap();
        assert_eq!(backend.room_count(&scope()).await, 0);
    }

    #[tokio::test]
    async fn test_outage_toggle() {
        let backend = MemoryBackend::default();
        backend.set_available(false);
        assert_eq!(backend.channel_state(), ChannelState::TransientFailure);

        let err = backend.get_room(&scope(), "x").await.unwrap_err();
        assert!(err.is_connectivity());

        backend.set_available(true);
        assert_eq!(backend.channel_state(), ChannelState::Ready);
    }

    #[tokio::test]
    async fn test_ticket_ownership() {
        let backend = MemoryBackend::default();
        let ticket = backend
            .create_ticket(
                &scope(),
                TicketRequest {
                    player_id: "p1".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = backend
            .delete_ticket(&scope(), "p2", &ticket)
            .await
            .unwrap_err();
        assert_eq!(err.code, BackendCode::PermissionDenied);

        backend.delete_ticket(&scope(), "p1", &ticket).await.unwrap();
        assert!(!backend.has_ticket(&scope(), &ticket).await);
    }
}
