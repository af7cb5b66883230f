//! Protocol Messages
//!
//! Wire format for client-gateway communication over WebSocket.
//! Every frame carries exactly one [`Envelope`]: a correlation id plus one
//! tagged [`Message`] variant. Envelopes are JSON documents; the gateway
//! writes them as binary frames and accepts both binary and text frames.

// Payload field names mirror the wire schema.
#![allow(missing_docs)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Named byte-valued properties attached to a network object.
pub type Properties = BTreeMap<String, Vec<u8>>;

/// String-to-string metadata map used by rooms, members and players.
pub type Metadata = BTreeMap<String, String>;

// =============================================================================
// ENVELOPE
// =============================================================================

/// Top-level wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id. Replies reuse the request id; server pushes get a fresh one.
    #[serde(default)]
    pub id: String,
    /// The single tagged payload.
    pub message: Message,
}

impl Envelope {
    /// Build an envelope with an explicit correlation id.
    pub fn new(id: impl Into<String>, message: Message) -> Self {
        Self {
            id: id.into(),
            message,
        }
    }

    /// Build a server-originated envelope with a fresh id.
    pub fn push(message: Message) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), message)
    }

    /// Build an error reply for the given request id.
    pub fn error(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            id,
            Message::Error(ErrorPayload {
                code,
                message: message.into(),
                context: Metadata::new(),
            }),
        )
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Operation code of the payload.
    pub fn op_code(&self) -> OpCode {
        self.message.op_code()
    }
}

/// Payload variants.
///
/// Variants the gateway has never heard of decode as [`Message::Unknown`]
/// instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Authenticate the connection.
    Connect(SessionConnect),
    /// Client is going away.
    Disconnect(Disconnect),
    /// Application-level keep-alive.
    Heartbeat(Heartbeat),
    /// Update the caller's profile.
    UpdatePlayer(UpdatePlayer),
    /// Set one attribute in a collection.
    UpdatePlayerAttributes(UpdatePlayerAttributes),
    /// Read one attribute or a whole collection.
    GetPlayerAttributes(GetPlayerAttributes),
    /// Remove one attribute.
    DeletePlayerAttribute(DeletePlayerAttribute),
    /// Create a room (request and reply).
    RoomCreate(RoomCreate),
    /// Join a room (request and reply).
    RoomJoin(RoomJoin),
    /// Leave the current room (request and reply).
    RoomLeave(RoomLeave),
    /// Relay opaque data to the rest of the room.
    RoomMessage(RoomMessage),
    /// Remote procedure call.
    Rpc(RpcCall),
    /// Reply to an RPC.
    RpcResult(RpcResult),
    /// RPC delivered to a peer.
    RpcEvent(RpcEvent),
    /// Spawn a replicated object (request, reply and event).
    ObjectInstantiate(ObjectInstantiate),
    /// Update a replicated object (request and event).
    ObjectSync(ObjectSync),
    /// Acknowledge an object sync.
    ObjectSyncAck(ObjectSyncAck),
    /// Destroy a replicated object (request, reply and event).
    ObjectDestroy(ObjectDestroy),
    /// Enter the matchmaker.
    MatchmakerAdd(MatchmakerAdd),
    /// Withdraw a matchmaker ticket.
    MatchmakerRemove(MatchmakerRemove),
    /// A match was found.
    MatchmakerMatched(MatchmakerMatched),
    /// Generic status reply.
    Status(Status),
    /// Structured error reply.
    Error(ErrorPayload),
    /// Someone joined the caller's room.
    PlayerJoined(PlayerJoined),
    /// Someone left the caller's room.
    PlayerLeft(PlayerLeft),
    /// Data relayed by a room member.
    RoomMessageEvent(RoomMessageEvent),
    /// Any variant not listed above.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Classify the payload.
    pub fn op_code(&self) -> OpCode {
        match self {
            Message::Connect(_) => OpCode::Connect,
            Message::Disconnect(_) => OpCode::Disconnect,
            Message::Heartbeat(_) => OpCode::Heartbeat,
            Message::UpdatePlayer(_) => OpCode::UpdatePlayer,
            Message::UpdatePlayerAttributes(_) => OpCode::UpdatePlayerAttributes,
            Message::GetPlayerAttributes(_) => OpCode::GetPlayerAttributes,
            Message::DeletePlayerAttribute(_) => OpCode::DeletePlayerAttribute,
            Message::RoomCreate(_) => OpCode::RoomCreate,
            Message::RoomJoin(_) => OpCode::RoomJoin,
            Message::RoomLeave(_) => OpCode::RoomLeave,
            Message::RoomMessage(_) => OpCode::RoomMessage,
            Message::Rpc(_) => OpCode::Rpc,
            Message::RpcResult(_) => OpCode::RpcResult,
            Message::RpcEvent(_) => OpCode::RpcEvent,
            Message::ObjectInstantiate(_) => OpCode::ObjectInstantiate,
            Message::ObjectSync(_) => OpCode::ObjectSync,
            Message::ObjectSyncAck(_) => OpCode::ObjectSyncAck,
            Message::ObjectDestroy(_) => OpCode::ObjectDestroy,
            Message::MatchmakerAdd(_) => OpCode::MatchmakerAdd,
            Message::MatchmakerRemove(_) => OpCode::MatchmakerRemove,
            Message::MatchmakerMatched(_) => OpCode::MatchmakerMatched,
            Message::Status(_) => OpCode::Status,
            Message::Error(_) => OpCode::Error,
            Message::PlayerJoined(_) => OpCode::PlayerJoined,
            Message::PlayerLeft(_) => OpCode::PlayerLeft,
            Message::RoomMessageEvent(_) => OpCode::RoomMessageEvent,
            Message::Unknown => OpCode::Unknown,
        }
    }
}

/// Symbolic operation code for a payload variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCode {
    Connect,
    Disconnect,
    Heartbeat,
    UpdatePlayer,
    UpdatePlayerAttributes,
    GetPlayerAttributes,
    DeletePlayerAttribute,
    RoomCreate,
    RoomJoin,
    RoomLeave,
    RoomMessage,
    Rpc,
    RpcResult,
    RpcEvent,
    ObjectInstantiate,
    ObjectSync,
    ObjectSyncAck,
    ObjectDestroy,
    MatchmakerAdd,
    MatchmakerRemove,
    MatchmakerMatched,
    Status,
    Error,
    PlayerJoined,
    PlayerLeft,
    RoomMessageEvent,
    Unknown,
}

impl OpCode {
    /// Stable name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpCode::Connect => "connect",
            OpCode::Disconnect => "disconnect",
            OpCode::Heartbeat => "heartbeat",
            OpCode::UpdatePlayer => "update_player",
            OpCode::UpdatePlayerAttributes => "update_player_attributes",
            OpCode::GetPlayerAttributes => "get_player_attributes",
            OpCode::DeletePlayerAttribute => "delete_player_attribute",
            OpCode::RoomCreate => "room_create",
            OpCode::RoomJoin => "room_join",
            OpCode::RoomLeave => "room_leave",
            OpCode::RoomMessage => "room_message",
            OpCode::Rpc => "rpc",
            OpCode::RpcResult => "rpc_result",
            OpCode::RpcEvent => "rpc_event",
            OpCode::ObjectInstantiate => "object_instantiate",
            OpCode::ObjectSync => "object_sync",
            OpCode::ObjectSyncAck => "object_sync_ack",
            OpCode::ObjectDestroy => "object_destroy",
            OpCode::MatchmakerAdd => "matchmaker_add",
            OpCode::MatchmakerRemove => "matchmaker_remove",
            OpCode::MatchmakerMatched => "matchmaker_matched",
            OpCode::Status => "status",
            OpCode::Error => "error",
            OpCode::PlayerJoined => "player_joined",
            OpCode::PlayerLeft => "player_left",
            OpCode::RoomMessageEvent => "room_message_event",
            OpCode::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SESSION PAYLOADS
// =============================================================================

/// Connect request and reply.
///
/// The request carries a `device_id` or a previously issued `token`.
/// The reply carries the session token and connection metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConnect {
    /// Device credential.
    pub device_id: String,
    /// Session token (request: re-authentication, reply: issued token).
    pub token: String,
    /// Connection metadata returned with the reply.
    pub connection_metadata: Metadata,
}

/// Client disconnect notice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Disconnect {
    /// Free-form reason.
    pub reason: String,
}

/// Heartbeat ping/pong.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Heartbeat {
    /// Unix milliseconds of the sender.
    pub timestamp: i64,
}

// =============================================================================
// PLAYER PAYLOADS
// =============================================================================

/// Profile update request and reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePlayer {
    pub player_id: String,
    pub display_name: String,
    pub avatar_url: String,
    pub metadata: Metadata,
}

/// Attribute write request and reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePlayerAttributes {
    pub player_id: String,
    pub collection: String,
    pub key: String,
    pub value: String,
}

/// Attribute read request and reply. An empty `key` reads the whole collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetPlayerAttributes {
    pub player_id: String,
    pub collection: String,
    pub key: String,
    pub value: String,
    pub attributes: Metadata,
}

/// Attribute delete request and reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeletePlayerAttribute {
    pub player_id: String,
    pub collection: String,
    pub key: String,
    pub success: bool,
}

// =============================================================================
// ROOM PAYLOADS
// =============================================================================

/// Room creation request and reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomCreate {
    pub room_id: String,
    pub name: String,
    pub game_type: String,
    /// Zero means unbounded.
    pub max_players: u32,
    pub is_private: bool,
    pub password: String,
    pub metadata: Metadata,
    pub owner_id: String,
}

/// Room join request and reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomJoin {
    pub room_id: String,
    pub password: String,
    /// Request: member metadata. Reply: room metadata.
    pub metadata: Metadata,
    pub success: bool,
    pub players: Vec<RoomPlayer>,
    pub owner_id: String,
}

/// Member summary carried by join replies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomPlayer {
    pub player_id: String,
    pub is_ready: bool,
    pub metadata: Metadata,
}

/// Room leave request and reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomLeave {
    /// Optional on request; must match the current room when set.
    pub room_id: String,
    pub success: bool,
}

/// Room broadcast request and reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomMessage {
    pub room_id: String,
    pub data: Vec<u8>,
    pub success: bool,
}

/// A player entered the room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerJoined {
    pub room_id: String,
    pub player_id: String,
}

/// A player left the room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerLeft {
    pub room_id: String,
    pub player_id: String,
    /// Set when the room changed owner as a result.
    pub new_owner_id: String,
    /// Set when the departure was a kick.
    pub reason: String,
}

/// Data relayed from one room member to the others.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomMessageEvent {
    pub room_id: String,
    pub sender_id: String,
    pub data: Vec<u8>,
}

// =============================================================================
// RPC PAYLOADS
// =============================================================================

/// Who receives an RPC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcTarget {
    /// Every room member, caller included.
    #[default]
    All,
    /// Every room member except the caller.
    Others,
    /// The room owner.
    Master,
    /// Players listed in `target_players`.
    Specific,
    /// A function registered on the gateway.
    Server,
}

/// RPC request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcCall {
    /// Caller-chosen call id, echoed in the result.
    pub id: String,
    pub method: String,
    pub params: Vec<u8>,
    pub target: RpcTarget,
    /// JSON array of player ids, used with [`RpcTarget::Specific`].
    pub target_players: Vec<u8>,
    pub view_id: u64,
}

/// RPC reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcResult {
    pub id: String,
    pub result: Vec<u8>,
}

/// RPC delivered to a peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcEvent {
    pub id: String,
    pub sender_id: String,
    pub method: String,
    pub params: Vec<u8>,
    pub view_id: u64,
}

// =============================================================================
// OBJECT SYNC PAYLOADS
// =============================================================================

/// Position or scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

/// Spawn request, reply and event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectInstantiate {
    pub view_id: u64,
    pub owner_id: String,
    pub prefab_name: String,
    pub position: Option<Vector3>,
    pub rotation: Option<Quaternion>,
    pub scale: Option<Vector3>,
    pub properties: Properties,
}

/// Partial object update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectSync {
    pub view_id: u64,
    pub position: Option<Vector3>,
    pub rotation: Option<Quaternion>,
    pub scale: Option<Vector3>,
    pub properties: Properties,
}

/// Sync acknowledgment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectSyncAck {
    pub view_id: u64,
    pub success: bool,
}

/// Destroy request, reply and event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectDestroy {
    pub view_id: u64,
    pub success: bool,
}

// =============================================================================
// MATCHMAKING PAYLOADS
// =============================================================================

/// Matchmaker ticket request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakerAdd {
    pub query: String,
    pub min_count: u32,
    pub max_count: u32,
    pub string_properties: Metadata,
    pub numeric_properties: BTreeMap<String, f64>,
}

/// Matchmaker ticket withdrawal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakerRemove {
    pub ticket: String,
}

/// Match found notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakerMatched {
    pub ticket: String,
    pub match_id: String,
    pub token: String,
    pub users: Vec<String>,
}

/// Generic status payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Status {
    pub presence_statuses: Metadata,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Structured error reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Extra detail.
    #[serde(default)]
    pub context: Metadata,
}

/// Client-visible error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Required fields missing or malformed frame.
    InvalidPayload,
    /// Action requires an authenticated player.
    Unauthorized,
    /// Unrecognized operation.
    UnknownMessage,
    /// Session already bound to a player.
    AlreadyAuthenticated,
    /// Room does not exist.
    RoomNotFound,
    /// Private room password mismatch.
    InvalidPassword,
    /// Room full or join rejected.
    JoinFailed,
    /// Leave lost a race with another removal.
    LeaveFailed,
    /// Caller is not in a room.
    NotInRoom,
    /// Caller is in a different room.
    WrongRoom,
    /// No object with that view id.
    ObjectNotFound,
    /// Caller does not own the object.
    NotOwner,
    /// Object disappeared before it could be destroyed.
    DestroyFailed,
    /// Server function failed.
    RpcError,
    /// Backend rejected the credentials.
    AuthenticationFailed,
    /// Backend denied the action.
    PermissionDenied,
    /// Backend rejected an argument.
    InvalidArgument,
    /// Backend entity missing.
    NotFound,
    /// Backend entity already exists.
    AlreadyExists,
    /// Backend quota exceeded.
    ResourceExhausted,
    /// Backend precondition failed.
    FailedPrecondition,
    /// Backend aborted the call.
    Aborted,
    /// Backend call timed out.
    Timeout,
    /// Backend unreachable.
    ServiceUnavailable,
    /// Anything else.
    InternalError,
}

// =============================================================================
// TESTS
// =============================================================================
