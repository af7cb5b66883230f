//! Backend Collaborator
//!
//! The identity/room/persistence service the gateway consumes. The gateway
//! only depends on the [`Backend`] trait; [`BackendClient`] adds the per-call
//! timeout every call site needs, and [`memory::MemoryBackend`] is an
//! in-process implementation for development and tests.

pub mod auth;
pub mod memory;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::protocol::{ErrorCode, Metadata};

pub use memory::MemoryBackend;

// =============================================================================
// CALL METADATA
// =============================================================================

/// Call-scoped metadata attached to every backend request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallScope {
    /// Tenant/game key supplied by the client at connect time.
    pub scope_key: String,
}

impl CallScope {
    /// Scope for the given key.
    pub fn new(scope_key: impl Into<String>) -> Self {
        Self {
            scope_key: scope_key.into(),
        }
    }
}

// =============================================================================
// REQUESTS / RESPONSES
// =============================================================================

/// Identity returned by [`Backend::authenticate`].
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSession {
    /// Stable player id.
    pub player_id: String,
    /// Opaque session token.
    pub token: String,
    /// True when the player record was created by this call.
    pub created: bool,
}

/// Player profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerProfile {
    /// Player id.
    pub player_id: String,
    /// Display name.
    pub display_name: String,
    /// Avatar URL.
    pub avatar_url: String,
    /// Free-form metadata.
    pub metadata: Metadata,
}

/// A single attribute value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attribute {
    /// Owner.
    pub player_id: String,
    /// Collection name.
    pub collection: String,
    /// Key within the collection.
    pub key: String,
    /// Value.
    pub value: String,
}

/// Result of an attribute read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeSet {
    /// Owner.
    pub player_id: String,
    /// Collection name.
    pub collection: String,
    /// Requested key, empty when the whole collection was read.
    pub key: String,
    /// Value of `key`, empty when the whole collection was read.
    pub value: String,
    /// Whole collection, filled when no key was requested.
    pub attributes: Metadata,
}

/// Room creation parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRoom {
    /// Display name.
    pub name: String,
    /// Game type.
    pub game_type: String,
    /// Capacity, zero is unbounded.
    pub max_players: u32,
    /// Private rooms may carry a password.
    pub is_private: bool,
    /// Optional password.
    pub password: Option<String>,
    /// Creator.
    pub owner_id: String,
    /// Room metadata.
    pub metadata: Metadata,
}

/// Authoritative room record held by the backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendRoom {
    /// Room id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Game type.
    pub game_type: String,
    /// Capacity, zero is unbounded.
    pub max_players: u32,
    /// Private flag.
    pub is_private: bool,
    /// Optional password.
    pub password: Option<String>,
    /// Current owner.
    pub owner_id: String,
    /// Members as seen by the backend.
    pub player_ids: Vec<String>,
    /// Room metadata. Partial responses may omit keys.
    pub metadata: Metadata,
}

/// Game-state transition forwarded to the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomStateUpdate {
    /// Target room.
    pub room_id: String,
    /// New state label.
    pub state: String,
    /// Whose turn it is.
    pub current_turn_player_id: String,
    /// Turn counter.
    pub turn_number: u32,
    /// Metadata to merge.
    pub metadata: Metadata,
}

/// Full game-state snapshot to persist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameStateSnapshot {
    /// Target room.
    pub room_id: String,
    /// Opaque serialized state.
    pub state_data: Vec<u8>,
    /// Whose turn it is.
    pub current_turn_player_id: String,
    /// Turn counter.
    pub turn_number: u32,
    /// Metadata to merge.
    pub metadata: Metadata,
}

/// Result of a persist call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    /// Room id.
    pub room_id: String,
    /// Monotonic version of the stored snapshot.
    pub version: u64,
    /// Room metadata after the write.
    pub metadata: Metadata,
}

/// Matchmaker ticket request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketRequest {
    /// Requesting player.
    pub player_id: String,
    /// Match query.
    pub query: String,
    /// Minimum party size.
    pub min_count: u32,
    /// Maximum party size.
    pub max_count: u32,
    /// String properties.
    pub string_properties: Metadata,
    /// Numeric properties.
    pub numeric_properties: BTreeMap<String, f64>,
}

/// Backend connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// No call made yet.
    Idle,
    /// Establishing a connection.
    Connecting,
    /// Connected.
    Ready,
    /// Failing, may recover.
    TransientFailure,
    /// Closed for good.
    Shutdown,
}

impl ChannelState {
    /// Whether the gateway should accept traffic.
    pub fn is_ready(&self) -> bool {
        matches!(self, ChannelState::Ready | ChannelState::Idle)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Status codes a backend call may fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BackendCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Unavailable,
    Unauthenticated,
    Internal,
}

/// Failed backend call.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("backend {code:?}: {message}")]
pub struct BackendError {
    /// Status code.
    pub code: BackendCode,
    /// Detail from the backend.
    pub message: String,
}

impl BackendError {
    /// Error with the given code.
    pub fn new(code: BackendCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Backend unreachable.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(BackendCode::Unavailable, message)
    }

    /// Entity missing.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackendCode::NotFound, message)
    }

    /// The call never got a usable answer.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self.code,
            BackendCode::Unavailable | BackendCode::DeadlineExceeded
        )
    }

    /// Client-facing code and message.
    pub fn client_error(&self) -> (ErrorCode, String) {
        let code = match self.code {
            BackendCode::Unauthenticated => ErrorCode::AuthenticationFailed,
            BackendCode::PermissionDenied => ErrorCode::PermissionDenied,
            BackendCode::InvalidArgument => ErrorCode::InvalidArgument,
            BackendCode::NotFound => ErrorCode::NotFound,
            BackendCode::AlreadyExists => ErrorCode::AlreadyExists,
            BackendCode::ResourceExhausted => ErrorCode::ResourceExhausted,
            BackendCode::FailedPrecondition => ErrorCode::FailedPrecondition,
            BackendCode::Aborted => ErrorCode::Aborted,
            BackendCode::DeadlineExceeded => ErrorCode::Timeout,
            BackendCode::Unavailable => ErrorCode::ServiceUnavailable,
            BackendCode::Cancelled | BackendCode::Unknown | BackendCode::Internal => {
                ErrorCode::InternalError
            }
        };
        let message = match code {
            ErrorCode::Timeout => "Request timed out".to_string(),
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable".to_string(),
            ErrorCode::InternalError => "Internal server error".to_string(),
            _ => self.message.clone(),
        };
        (code, message)
    }
}

// =============================================================================
// BACKEND TRAIT
// =============================================================================

/// Request/response interface to the backend service.
///
/// Every call carries the caller's [`CallScope`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// Authenticate a device (or re-authenticate with a session token).
    async fn authenticate(
        &self,
        scope: &CallScope,
        device_id: Option<&str>,
        token: Option<&str>,
    ) -> Result<AuthSession, BackendError>;

    /// Update display name and metadata.
    async fn update_player(
        &self,
        scope: &CallScope,
        player_id: &str,
        display_name: &str,
        metadata: &Metadata,
    ) -> Result<PlayerProfile, BackendError>;

    /// Read one attribute, or the whole collection when `key` is `None`.
    async fn get_player_attributes(
        &self,
        scope: &CallScope,
        player_id: &str,
        collection: &str,
        key: Option<&str>,
    ) -> Result<AttributeSet, BackendError>;

    /// Write one attribute.
    async fn update_player_attribute(
        &self,
        scope: &CallScope,
        attribute: Attribute,
    ) -> Result<Attribute, BackendError>;

    /// Delete one attribute.
    async fn delete_player_attribute(
        &self,
        scope: &CallScope,
        player_id: &str,
        collection: &str,
        key: &str,
    ) -> Result<(), BackendError>;

    /// Create a room.
    async fn create_room(&self, scope: &CallScope, room: NewRoom)
        -> Result<BackendRoom, BackendError>;

    /// Fetch a room.
    async fn get_room(&self, scope: &CallScope, room_id: &str) -> Result<BackendRoom, BackendError>;

    /// Add a player to a room.
    async fn join_room(
        &self,
        scope: &CallScope,
        room_id: &str,
        player_id: &str,
        password: Option<&str>,
    ) -> Result<BackendRoom, BackendError>;

    /// Remove a player from a room.
    async fn leave_room(
        &self,
        scope: &CallScope,
        room_id: &str,
        player_id: &str,
    ) -> Result<(), BackendError>;

    /// Delete a room.
    async fn delete_room(&self, scope: &CallScope, room_id: &str) -> Result<(), BackendError>;

    /// Forcibly remove a player from a room.
    async fn kick_player(
        &self,
        scope: &CallScope,
        room_id: &str,
        player_id: &str,
        reason: &str,
    ) -> Result<(), BackendError>;

    /// Apply a game-state transition.
    async fn update_room_state(
        &self,
        scope: &CallScope,
        update: RoomStateUpdate,
    ) -> Result<BackendRoom, BackendError>;

    /// Persist a full game-state snapshot.
    async fn persist_game_state(
        &self,
        scope: &CallScope,
        snapshot: GameStateSnapshot,
    ) -> Result<PersistedState, BackendError>;

    /// Open a matchmaker ticket.
    async fn create_ticket(
        &self,
        scope: &CallScope,
        request: TicketRequest,
    ) -> Result<String, BackendError>;

    /// Withdraw a matchmaker ticket.
    async fn delete_ticket(
        &self,
        scope: &CallScope,
        player_id: &str,
        ticket_id: &str,
    ) -> Result<(), BackendError>;

    /// Current connection health.
    fn channel_state(&self) -> ChannelState;
}

// =============================================================================
// CLIENT
// =============================================================================

/// Timeouts applied by [`BackendClient`].
#[derive(Debug, Clone, Copy)]
pub struct BackendTimeouts {
    /// Default per-call timeout.
    pub call: Duration,
    /// Timeout for room creation.
    pub create: Duration,
}

impl Default for BackendTimeouts {
    fn default() -> Self {
        Self {
            call: Duration::from_secs(5),
            create: Duration::from_secs(10),
        }
    }
}

/// Shared handle to a [`Backend`] that bounds every call with a timeout.
///
/// No retries happen here.
#[derive(Clone)]
pub struct BackendClient {
    inner: Arc<dyn Backend>,
    timeouts: BackendTimeouts,
}

impl BackendClient {
    /// Wrap a backend.
    pub fn new(inner: Arc<dyn Backend>, timeouts: BackendTimeouts) -> Self {
        Self { inner, timeouts }
    }

    /// Connection health of the wrapped backend.
    pub fn channel_state(&self) -> ChannelState {
        self.inner.channel_state()
    }

    async fn bounded<T>(
        &self,
        limit: Duration,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::new(
                BackendCode::DeadlineExceeded,
                format!("no response within {:?}", limit),
            )),
        }
    }

    /// See [`Backend::authenticate`].
    pub async fn authenticate(
        &self,
        scope: &CallScope,
        device_id: Option<&str>,
        token: Option<&str>,
    ) -> Result<AuthSession, BackendError> {
        self.bounded(self.timeouts.call, self.inner.authenticate(scope, device_id, token))
            .await
    }

    /// See [`Backend::update_player`].
    pub async fn update_player(
        &self,
        scope: &CallScope,
        player_id: &str,
        display_name: &str,
        metadata: &Metadata,
    ) -> Result<PlayerProfile, BackendError> {
        self.bounded(
            self.timeouts.call,
            self.inner.update_player(scope, player_id, display_name, metadata),
        )
        .await
    }

    /// See [`Backend::get_player_attributes`].
    pub async fn get_player_attributes(
        &self,
        scope: &CallScope,
        player_id: &str,
        collection: &str,
        key: Option<&str>,
    ) -> Result<AttributeSet, BackendError> {
        self.bounded(
            self.timeouts.call,
            self.inner.get_player_attributes(scope, player_id, collection, key),
        )
        .await
    }

    /// See [`Backend::update_player_attribute`].
    pub async fn update_player_attribute(
        &self,
        scope: &CallScope,
        attribute: Attribute,
    ) -> Result<Attribute, BackendError> {
        self.bounded(
            self.timeouts.call,
            self.inner.update_player_attribute(scope, attribute),
        )
        .await
    }

    /// See [`Backend::delete_player_attribute`].
    pub async fn delete_player_attribute(
        &self,
        scope: &CallScope,
        player_id: &str,
        collection: &str,
        key: &str,
    ) -> Result<(), BackendError> {
        self.bounded(
            self.timeouts.call,
            self.inner.delete_player_attribute(scope, player_id, collection, key),
        )
        .await
    }

    /// See [`Backend::create_room`].
    pub async fn create_room(
        &self,
        scope: &CallScope,
        room: NewRoom,
    ) -> Result<BackendRoom, BackendError> {
        self.bounded(self.timeouts.create, self.inner.create_room(scope, room))
            .await
    }

    /// See [`Backend::get_room`].
    pub async fn get_room(
        &self,
        scope: &CallScope,
        room_id: &str,
    ) -> Result<BackendRoom, BackendError> {
        self.bounded(self.timeouts.call, self.inner.get_room(scope, room_id))
            .await
    }

    /// See [`Backend::join_room`].
    pub async fn join_room(
        &self,
        scope: &CallScope,
        room_id: &str,
        player_id: &str,
        password: Option<&str>,
    ) -> Result<BackendRoom, BackendError> {
        self.bounded(
            self.timeouts.call,
            self.inner.join_room(scope, room_id, player_id, password),
        )
        .await
    }

    /// See [`Backend::leave_room`].
    pub async fn leave_room(
        &self,
        scope: &CallScope,
        room_id: &str,
        player_id: &str,
    ) -> Result<(), BackendError> {
        self.bounded(
            self.timeouts.call,
            self.inner.leave_room(scope, room_id, player_id),
        )
        .await
    }

    /// See [`Backend::delete_room`].
    pub async fn delete_room(&self, scope: &CallScope, room_id: &str) -> Result<(), BackendError> {
        self.bounded(self.timeouts.call, self.inner.delete_room(scope, room_id))
            .await
    }

    /// See [`Backend::kick_player`].
    pub async fn kick_player(
        &self,
        scope: &CallScope,
        room_id: &str,
        player_id: &str,
        reason: &str,
    ) -> Result<(), BackendError> {
        self.bounded(
            self.timeouts.call,
            self.inner.kick_player(scope, room_id, player_id, reason),
        )
        .await
    }

    /// See [`Backend::update_room_state`].
    pub async fn update_room_state(
        &self,
        scope: &CallScope,
        update: RoomStateUpdate,
    ) -> Result<BackendRoom, BackendError> {
        self.bounded(self.timeouts.call, self.inner.update_room_state(scope, update))
            .await
    }

    /// See [`Backend::persist_game_state`].
    pub async fn persist_game_state(
        &self,
        scope: &CallScope,
        snapshot: GameStateSnapshot,
    ) -> Result<PersistedState, BackendError> {
        self.bounded(
            self.timeouts.call,
            self.inner.persist_game_state(scope, snapshot),
        )
        .await
    }

    /// See [`Backend::create_ticket`].
    pub async fn create_ticket(
        &self,
        scope: &CallScope,
        request: TicketRequest,
    ) -> Result<String, BackendError> {
        self.bounded(self.timeouts.call, self.inner.create_ticket(scope, request))
            .await
    }

    /// See [`Backend::delete_ticket`].
    pub async fn delete_ticket(
        &self,
        scope: &CallScope,
        player_id: &str,
        ticket_id: &str,
    ) -> Result<(), BackendError> {
        self.bounded(
            self.timeouts.call,
            self.inner.delete_ticket(scope, player_id, ticket_id),
        )
        .await
    }
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("timeouts", &self.timeouts)
            .field("channel_state", &self.channel_state())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
