//! Built-in Server Functions
//!
//! Room operations that have no envelope of their own are reachable as
//! server-targeted RPCs. Parameters and results are JSON documents.
//!
//! | Name                 | Params                                                     | Result                          |
//! |----------------------|------------------------------------------------------------|---------------------------------|
//! | `room.set_ready`     | `{"ready"}`                                                | `{"ready", "all_ready"}`        |
//! | `room.kick`          | `{"player_id", "reason"}`                                  | `{"kicked"}`                    |
//! | `room.update_state`  | `{"state", "current_turn_player_id", "turn_number", "metadata"}` | `{"room_id", "metadata"}` |
//! | `room.persist_state` | `{"state_data", "current_turn_player_id", "turn_number", "metadata"}` | `{"room_id", "version"}` |
//! | `room.delete`        | none                                                       | `{"deleted"}`                   |

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{GameStateSnapshot, RoomStateUpdate};
use crate::network::fanout::Fanout;
use crate::network::protocol::{Message, Metadata, PlayerLeft};
use crate::state::room::{RoomError, RoomManager};
use crate::state::rpc::{CallContext, RpcError, RpcRouter, ServerFunction};

/// `room.set_ready`
pub const SET_READY: &str = "room.set_ready";
/// `room.kick`
pub const KICK: &str = "room.kick";
/// `room.update_state`
pub const UPDATE_STATE: &str = "room.update_state";
/// `room.persist_state`
pub const PERSIST_STATE: &str = "room.persist_state";
/// `room.delete`
pub const DELETE_ROOM: &str = "room.delete";

/// Empty params decode as the default value.
fn parse<T: DeserializeOwned + Default>(params: &[u8]) -> Result<T, RpcError> {
    if params.is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(params)?)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RpcError> {
    Ok(serde_json::to_vec(value)?)
}

/// Register every built-in function.
pub async fn register_builtins(router: &RpcRouter, rooms: Arc<RoomManager>, fanout: Fanout) {
    router
        .register(SET_READY, Arc::new(SetReady { rooms: rooms.clone() }))
        .await;
    router
        .register(
            KICK,
            Arc::new(Kick {
                rooms: rooms.clone(),
                fanout: fanout.clone(),
            }),
        )
        .await;
    router
        .register(UPDATE_STATE, Arc::new(UpdateState { rooms: rooms.clone() }))
        .await;
    router
        .register(
            PERSIST_STATE,
            Arc::new(PersistState {
                rooms: rooms.clone(),
            }),
        )
        .await;
    router
        .register(DELETE_ROOM, Arc::new(DeleteRoom { rooms, fanout }))
        .await;
}

// =============================================================================
// room.set_ready
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SetReadyParams {
    ready: bool,
}

#[derive(Debug, Serialize)]
struct SetReadyResult {
    ready: bool,
    all_ready: bool,
}

/// Toggle the caller's ready flag.
pub struct SetReady {
    rooms: Arc<RoomManager>,
}

#[async_trait]
impl ServerFunction for SetReady {
    async fn call(&self, ctx: &CallContext, params: &[u8]) -> Result<Vec<u8>, RpcError> {
        let params: SetReadyParams = parse(params)?;
        let (_, all_ready) = self
            .rooms
            .set_ready(&ctx.scope, &ctx.player_id, params.ready)
            .await?;
        encode(&SetReadyResult {
            ready: params.ready,
            all_ready,
        })
    }
}

// =============================================================================
// room.kick
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KickParams {
    player_id: String,
    reason: String,
}

#[derive(Debug, Serialize)]
struct KickResult {
    kicked: String,
}

/// Remove another member from the caller's room. Owner only.
pub struct Kick {
    rooms: Arc<RoomManager>,
    fanout: Fanout,
}

#[async_trait]
impl ServerFunction for Kick {
    async fn call(&self, ctx: &CallContext, params: &[u8]) -> Result<Vec<u8>, RpcError> {
        let params: KickParams = parse(params)?;
        if params.player_id.is_empty() {
            return Err(RpcError::Failed("player_id is required".into()));
        }

        let room = self
            .rooms
            .player_room(&ctx.player_id)
            .await
            .ok_or(RoomError::NotInRoom)?;
        if room.owner_id != ctx.player_id {
            return Err(RpcError::PermissionDenied(
                "only the room owner can kick".into(),
            ));
        }
        if params.player_id == ctx.player_id {
            return Err(RpcError::Failed("cannot kick yourself".into()));
        }

        let departure = self
            .rooms
            .kick(&ctx.scope, &room.id, &params.player_id, &params.reason)
            .await?;

        if let Err(e) = self
            .fanout
            .to_player(
                &params.player_id,
                Message::PlayerLeft(PlayerLeft {
                    room_id: room.id.clone(),
                    player_id: params.player_id.clone(),
                    new_owner_id: departure.new_owner.clone().unwrap_or_default(),
                    reason: params.reason.clone(),
                }),
            )
            .await
        {
            debug!(player_id = %params.player_id, error = %e, "kick notice dropped");
        }
        self.fanout.departure(&departure, &params.reason).await;

        info!(room_id = %room.id, by = %ctx.player_id, kicked = %params.player_id, "kick via rpc");
        encode(&KickResult {
            kicked: params.player_id,
        })
    }
}

// =============================================================================
// room.update_state
// =============================================================================

#[derive(Debug, Serialize)]
struct RoomMetadataResult {
    room_id: String,
    metadata: Metadata,
}

/// Forward a game-state transition for the caller's room.
pub struct UpdateState {
    rooms: Arc<RoomManager>,
}

#[async_trait]
impl ServerFunction for UpdateState {
    async fn call(&self, ctx: &CallContext, params: &[u8]) -> Result<Vec<u8>, RpcError> {
        let update: RoomStateUpdate = parse(params)?;
        let room = self
            .rooms
            .update_state(&ctx.scope, &ctx.player_id, update)
            .await?;
        encode(&RoomMetadataResult {
            room_id: room.id,
            metadata: room.metadata,
        })
    }
}

// =============================================================================
// room.persist_state
// =============================================================================

#[derive(Debug, Serialize)]
struct PersistResult {
    room_id: String,
    version: u64,
}

/// Persist a snapshot of the caller's room through the backend.
pub struct PersistState {
    rooms: Arc<RoomManager>,
}

#[async_trait]
impl ServerFunction for PersistState {
    async fn call(&self, ctx: &CallContext, params: &[u8]) -> Result<Vec<u8>, RpcError> {
        let snapshot: GameStateSnapshot = parse(params)?;
        let persisted = self
            .rooms
            .persist_game_state(&ctx.scope, &ctx.player_id, snapshot)
            .await?;
        encode(&PersistResult {
            room_id: persisted.room_id,
            version: persisted.version,
        })
    }
}

// =============================================================================
// room.delete
// =============================================================================

#[derive(Debug, Serialize)]
struct DeleteResult {
    deleted: String,
}

/// Close the caller's room for everyone. Owner only.
pub struct DeleteRoom {
    rooms: Arc<RoomManager>,
    fanout: Fanout,
}

#[async_trait]
impl ServerFunction for DeleteRoom {
    async fn call(&self, ctx: &CallContext, _params: &[u8]) -> Result<Vec<u8>, RpcError> {
        let room = self
            .rooms
            .player_room(&ctx.player_id)
            .await
            .ok_or(RoomError::NotInRoom)?;
        if room.owner_id != ctx.player_id {
            return Err(RpcError::PermissionDenied(
                "only the room owner can delete the room".into(),
            ));
        }

        let deleted = self.rooms.delete_room(&ctx.scope, &room.id).await?;
        let purged = self.fanout.room_closed(&deleted, "room_deleted").await;

        info!(room_id = %deleted.id, by = %ctx.player_id, purged, "room deleted via rpc");
        encode(&DeleteResult { deleted: deleted.id })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CallScope;
    use crate::network::session::SessionRegistry;
    use crate::state::objects::ObjectRegistry;
    use crate::network::protocol::Envelope;
    use crate::network::session::Session;
    use crate::network::protocol::Properties;
    use crate::state::objects::Transform;
    use crate::state::room::{CreateRoom, Visibility};

    fn ctx(player: &str) -> CallContext {
        CallContext {
            player_id: player.into(),
            session_id: format!("s-{}", player),
            scope: CallScope::new("g1"),
        }
    }

    async fn setup(members: &[&str]) -> (RpcRouter, Arc<RoomManager>, String) {
        let rooms = Arc::new(RoomManager::new(None));
        let scope = CallScope::new("g1");
        let room = rooms
            .create_room(
                &scope,
                CreateRoom {
                    name: "r1".into(),
                    game_type: "t".into(),
                    capacity: 4,
                    visibility: Visibility::Public,
                    owner_id: members[0].into(),
                    owner_session_id: "s".into(),
                    metadata: Metadata::new(),
                },
            )
            .await
            .room;
        for member in &members[1..] {
            rooms
                .join_room(&scope, &room.id, member, "s", None, Metadata::new())
                .await
                .unwrap();
        }

        let router = RpcRouter::new();
        let fanout = Fanout::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(ObjectRegistry::new()),
        );
        register_builtins(&router, rooms.clone(), fanout).await;
        (router, rooms, room.id)
    }

    /// Same room as `setup`, with the member sessions bound and the object
    /// registry exposed.
    async fn setup_live(
        members: &[&str],
    ) -> (
        RpcRouter,
        Arc<RoomManager>,
        Arc<ObjectRegistry>,
        Vec<tokio::sync::mpsc::Receiver<Envelope>>,
        String,
    ) {
        let (_, rooms, room_id) = setup(members).await;
        let sessions = Arc::new(SessionRegistry::new());
        let objects = Arc::new(ObjectRegistry::new());
        let mut inboxes = Vec::new();
        for member in members {
            let (session, rx) = Session::new("g1", 16, None);
            sessions.register(&session).await;
            sessions.bind(member, &session).await.unwrap();
            inboxes.push(rx);
        }

        let router = RpcRouter::new();
        let fanout = Fanout::new(sessions, objects.clone());
        register_builtins(&router, rooms.clone(), fanout).await;
        (router, rooms, objects, inboxes, room_id)
    }

    #[tokio::test]
    async fn test_builtins_registered() {
        let (router, _, _) = setup(&["a"]).await;
        for name in [SET_READY, KICK, UPDATE_STATE, PERSIST_STATE, DELETE_ROOM] {
            assert!(router.has_function(name).await, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_set_ready_reports_all_ready() {
        let (router, _, _) = setup(&["a", "b"]).await;

        let out = router
            .call_server_function(&ctx("a"), SET_READY, br#"{"ready":true}"#)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["all_ready"], false);

        let out = router
            .call_server_function(&ctx("b"), SET_READY, br#"{"ready":true}"#)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["ready"], true);
        assert_eq!(value["all_ready"], true);
    }

    #[tokio::test]
    async fn test_set_ready_outside_room() {
        let (router, _, _) = setup(&["a"]).await;
        let err = router
            .call_server_function(&ctx("zed"), SET_READY, b"")
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Room(RoomError::NotInRoom)));
    }

    #[tokio::test]
    async fn test_kick_owner_only() {
        let (router, rooms, room_id) = setup(&["a", "b", "c"]).await;

        let err = router
            .call_server_function(&ctx("b"), KICK, br#"{"player_id":"c"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::PermissionDenied(_)));

        router
            .call_server_function(&ctx("a"), KICK, br#"{"player_id":"c","reason":"afk"}"#)
            .await
            .unwrap();
        let room = rooms.get_room(&room_id).await.unwrap();
        assert!(!room.has_member("c"));
        assert_eq!(room.member_count(), 2);
    }

    #[tokio::test]
    async fn test_bad_params_rejected() {
        let (router, _, _) = setup(&["a"]).await;
        let err = router
            .call_server_function(&ctx("a"), SET_READY, b"not json")
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_update_state_local_room() {
        let (router, _, room_id) = setup(&["a"]).await;
        let out = router
            .call_server_function(&ctx("a"), UPDATE_STATE, br#"{"state":"playing"}"#)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["room_id"], room_id.as_str());
        assert_eq!(value["metadata"]["state"], "playing");
    }

    #[tokio::test]
    async fn test_persist_without_backend_fails() {
        let (router, _, _) = setup(&["a"]).await;
        let err = router
            .call_server_function(&ctx("a"), PERSIST_STATE, b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Room(RoomError::Backend(_))));
    }

    #[tokio::test]
    async fn test_delete_room_purges_objects_and_notifies() {
        let (router, rooms, objects, mut inboxes, room_id) = setup_live(&["a", "b"]).await;
        objects
            .create_object("a", &room_id, "ball", Transform::default(), Properties::new())
            .await;
        objects
            .create_object("", &room_id, "door", Transform::default(), Properties::new())
            .await;

        let out = router
            .call_server_function(&ctx("a"), DELETE_ROOM, b"")
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["deleted"], room_id.as_str());

        assert_eq!(objects.object_count().await, 0);
        assert!(rooms.get_room(&room_id).await.is_none());
        assert!(rooms.player_room("a").await.is_none());
        assert!(rooms.player_room("b").await.is_none());

        let rx_b = &mut inboxes[1];
        let mut destroyed = 0;
        let mut left = None;
        while let Ok(env) = rx_b.try_recv() {
            match env.message {
                Message::ObjectDestroy(_) => destroyed += 1,
                Message::PlayerLeft(msg) => left = Some(msg),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(destroyed, 2);
        let left = left.unwrap();
        assert_eq!(left.player_id, "b");
        assert_eq!(left.reason, "room_deleted");
    }

    #[tokio::test]
    async fn test_delete_room_owner_only() {
        let (router, rooms, objects, _inboxes, room_id) = setup_live(&["a", "b"]).await;
        objects
            .create_object("b", &room_id, "bat", Transform::default(), Properties::new())
            .await;

        let err = router
            .call_server_function(&ctx("b"), DELETE_ROOM, b"")
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::PermissionDenied(_)));
        assert!(rooms.get_room(&room_id).await.is_some());
        assert_eq!(objects.object_count().await, 1);

        let err = router
            .call_server_function(&ctx("zed"), DELETE_ROOM, b"")
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Room(RoomError::NotInRoom)));
    }
}
