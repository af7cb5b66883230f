//! Protocol Dispatcher
//!
//! Maps each decoded envelope to its handler. Routing is decided from the
//! operation code alone: server-originated and unknown variants are
//! rejected with `unknown_message`, and everything except `connect`
//! requires a bound player.
//!
//! Handlers live in [`super::handlers`]; each one replies to the
//! originating session and never fails the connection.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{BackendClient, BackendError};
use crate::network::fanout::Fanout;
use crate::network::protocol::{Envelope, ErrorCode, Message, OpCode};
use crate::network::session::{Session, SessionRegistry};
use crate::state::objects::ObjectRegistry;
use crate::state::room::{RoomError, RoomManager};
use crate::state::rpc::RpcRouter;

/// How an operation is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Allowed before authentication.
    Public,
    /// Requires a bound player.
    Authenticated,
    /// Not accepted from clients.
    Unroutable,
}

/// Admission rule for every operation code.
pub fn route(op: OpCode) -> Route {
    match op {
        OpCode::Connect => Route::Public,

        OpCode::Disconnect
        | OpCode::Heartbeat
        | OpCode::UpdatePlayer
        | OpCode::UpdatePlayerAttributes
        | OpCode::GetPlayerAttributes
        | OpCode::DeletePlayerAttribute
        | OpCode::RoomCreate
        | OpCode::RoomJoin
        | OpCode::RoomLeave
        | OpCode::RoomMessage
        | OpCode::Rpc
        | OpCode::ObjectInstantiate
        | OpCode::ObjectSync
        | OpCode::ObjectDestroy
        | OpCode::MatchmakerAdd
        | OpCode::MatchmakerRemove => Route::Authenticated,

        OpCode::RpcResult
        | OpCode::RpcEvent
        | OpCode::ObjectSyncAck
        | OpCode::MatchmakerMatched
        | OpCode::Status
        | OpCode::Error
        | OpCode::PlayerJoined
        | OpCode::PlayerLeft
        | OpCode::RoomMessageEvent
        | OpCode::Unknown => Route::Unroutable,
    }
}

/// One inbound request as seen by a handler.
pub(crate) struct Request<'a> {
    /// Correlation id to reply with.
    pub id: String,
    /// Originating connection.
    pub session: &'a Arc<Session>,
    /// Bound player; empty only for `connect`.
    pub player_id: String,
}

/// Routes envelopes from every connection to the shared components.
pub struct Dispatcher {
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) rooms: Arc<RoomManager>,
    pub(crate) objects: Arc<ObjectRegistry>,
    pub(crate) rpc: Arc<RpcRouter>,
    pub(crate) backend: BackendClient,
    pub(crate) fanout: Fanout,
}

impl Dispatcher {
    /// Wire the dispatcher to its components.
    pub fn new(
        sessions: Arc<SessionRegistry>,
        rooms: Arc<RoomManager>,
        objects: Arc<ObjectRegistry>,
        rpc: Arc<RpcRouter>,
        backend: BackendClient,
    ) -> Self {
        let fanout = Fanout::new(sessions.clone(), objects.clone());
        Self {
            sessions,
            rooms,
            objects,
            rpc,
            backend,
            fanout,
        }
    }

    /// Session registry shared with the transport.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Handle one envelope to completion.
    pub async fn dispatch(&self, session: &Arc<Session>, envelope: Envelope) {
        let op = envelope.op_code();
        let Envelope { id, message } = envelope;
        debug!(session_id = %session.id(), op_code = op.as_str(), "message received");

        match route(op) {
            Route::Public => {}
            Route::Authenticated if session.player_id().is_some() => {}
            Route::Authenticated => {
                self.send_error(
                    session,
                    &id,
                    ErrorCode::Unauthorized,
                    "You must be authenticated first",
                )
                .await;
                return;
            }
            Route::Unroutable => {
                warn!(session_id = %session.id(), op_code = op.as_str(), "unknown message type");
                self.send_error(
                    session,
                    &id,
                    ErrorCode::UnknownMessage,
                    format!("Unknown message type: {}", op.as_str()),
                )
                .await;
                return;
            }
        }

        let req = Request {
            id,
            session,
            player_id: session.player_id().unwrap_or_default().to_string(),
        };

        match message {
            Message::Connect(p) => self.handle_connect(&req, p).await,
            Message::Disconnect(p) => self.handle_disconnect(&req, p).await,
            Message::Heartbeat(p) => self.handle_heartbeat(&req, p).await,

            Message::UpdatePlayer(p) => self.handle_update_player(&req, p).await,
            Message::UpdatePlayerAttributes(p) => self.handle_update_attributes(&req, p).await,
            Message::GetPlayerAttributes(p) => self.handle_get_attributes(&req, p).await,
            Message::DeletePlayerAttribute(p) => self.handle_delete_attribute(&req, p).await,

            Message::RoomCreate(p) => self.handle_room_create(&req, p).await,
            Message::RoomJoin(p) => self.handle_room_join(&req, p).await,
            Message::RoomLeave(p) => self.handle_room_leave(&req, p).await,
            Message::RoomMessage(p) => self.handle_room_message(&req, p).await,

            Message::Rpc(p) => self.handle_rpc(&req, p).await,

            Message::ObjectInstantiate(p) => self.handle_object_instantiate(&req, p).await,
            Message::ObjectSync(p) => self.handle_object_sync(&req, p).await,
            Message::ObjectDestroy(p) => self.handle_object_destroy(&req, p).await,

            Message::MatchmakerAdd(p) => self.handle_matchmaker_add(&req, p).await,
            Message::MatchmakerRemove(p) => self.handle_matchmaker_remove(&req, p).await,

            Message::RpcResult(_)
            | Message::RpcEvent(_)
            | Message::ObjectSyncAck(_)
            | Message::MatchmakerMatched(_)
            | Message::Status(_)
            | Message::Error(_)
            | Message::PlayerJoined(_)
            | Message::PlayerLeft(_)
            | Message::RoomMessageEvent(_)
            | Message::Unknown => {
                self.reply_error(
                    &req,
                    ErrorCode::UnknownMessage,
                    format!("Unknown message type: {}", op.as_str()),
                )
                .await
            }
        }
    }

    /// Room and object cleanup once a connection is gone.
    ///
    /// Skipped when the player has since bound a newer connection.
    pub async fn on_disconnect(&self, session: &Arc<Session>) {
        let Some(player_id) = session.player_id() else {
            return;
        };
        if self.sessions.is_superseded(session).await {
            debug!(session_id = %session.id(), player_id = %player_id, "superseded session, skipping cleanup");
            return;
        }

        match self.rooms.leave_room(session.scope(), player_id).await {
            Ok(departure) => self.fanout.departure(&departure, "disconnected").await,
            Err(RoomError::NotInRoom) => {}
            Err(e) => warn!(player_id = %player_id, error = %e, "room cleanup failed"),
        }

        let orphaned = self.objects.cleanup_player(player_id).await;
        if !orphaned.is_empty() {
            debug!(player_id = %player_id, objects = orphaned.len(), "removed orphaned objects");
        }
    }

    // =========================================================================
    // REPLIES
    // =========================================================================

    pub(crate) async fn reply(&self, req: &Request<'_>, message: Message) {
        let envelope = Envelope::new(req.id.clone(), message);
        if let Err(e) = self.sessions.send(req.session, envelope).await {
            debug!(session_id = %req.session.id(), error = %e, "reply dropped");
        }
    }

    pub(crate) async fn reply_error(
        &self,
        req: &Request<'_>,
        code: ErrorCode,
        message: impl Into<String>,
    ) {
        self.send_error(req.session, &req.id, code, message).await;
    }

    pub(crate) async fn reply_backend_error(&self, req: &Request<'_>, err: &BackendError) {
        warn!(session_id = %req.session.id(), error = %err, "backend call failed");
        let (code, message) = err.client_error();
        self.reply_error(req, code, message).await;
    }

    async fn send_error(
        &self,
        session: &Arc<Session>,
        id: &str,
        code: ErrorCode,
        message: impl Into<String>,
    ) {
        if let Err(e) = self
            .sessions
            .send(session, Envelope::error(id, code, message))
            .await
        {
            debug!(session_id = %session.id(), error = %e, "error reply dropped");
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendTimeouts, MemoryBackend};
    use crate::network::protocol::{Heartbeat, RoomCreate, SessionConnect};
    use tokio::sync::mpsc;

    struct Harness {
        dispatcher: Dispatcher,
        rooms: Arc<RoomManager>,
    }

    fn harness() -> Harness {
        let backend = BackendClient::new(
            Arc::new(MemoryBackend::default()),
            BackendTimeouts::default(),
        );
        let rooms = Arc::new(RoomManager::new(Some(backend.clone())));
        let dispatcher = Dispatcher::new(
            Arc::new(SessionRegistry::new()),
            rooms.clone(),
            Arc::new(ObjectRegistry::new()),
            Arc::new(RpcRouter::new()),
            backend,
        );
        Harness { dispatcher, rooms }
    }

    async fn open(h: &Harness) -> (Arc<Session>, mpsc::Receiver<Envelope>) {
        let (session, rx) = Session::new("g1", 32, None);
        h.dispatcher.sessions().register(&session).await;
        (session, rx)
    }

    fn error_code(envelope: &Envelope) -> Option<ErrorCode> {
        match &envelope.message {
            Message::Error(e) => Some(e.code),
            _ => None,
        }
    }

    #[test]
    fn test_only_connect_is_public() {
        assert_eq!(route(OpCode::Connect), Route::Public);
        assert_eq!(route(OpCode::Heartbeat), Route::Authenticated);
        assert_eq!(route(OpCode::Rpc), Route::Authenticated);
        assert_eq!(route(OpCode::PlayerJoined), Route::Unroutable);
        assert_eq!(route(OpCode::Unknown), Route::Unroutable);
    }

    #[tokio::test]
    async fn test_unauthenticated_request_rejected() {
        let h = harness();
        let (session, mut rx) = open(&h).await;

        let create = Envelope::new(
            "7",
            Message::RoomCreate(RoomCreate {
                name: "r1".into(),
                max_players: 4,
                ..Default::default()
            }),
        );
        h.dispatcher.dispatch(&session, create).await;

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.id, "7");
        assert_eq!(error_code(&reply), Some(ErrorCode::Unauthorized));
        assert!(rx.try_recv().is_err());
        assert_eq!(h.rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_variant_rejected() {
        let h = harness();
        let (session, mut rx) = open(&h).await;

        h.dispatcher
            .dispatch(&session, Envelope::new("1", Message::Unknown))
            .await;
        let reply = rx.try_recv().unwrap();
        assert_eq!(error_code(&reply), Some(ErrorCode::UnknownMessage));
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_connect_then_heartbeat() {
        let h = harness();
        let (session, mut rx) = open(&h).await;

        let connect = Envelope::new(
            "1",
            Message::Connect(SessionConnect {
                device_id: "d1".into(),
                ..Default::default()
            }),
        );
        h.dispatcher.dispatch(&session, connect).await;
        match rx.try_recv().unwrap().message {
            Message::Connect(reply) => {
                assert!(!reply.token.is_empty());
                assert_eq!(
                    reply.connection_metadata.get("status").map(String::as_str),
                    Some("online")
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(session.player_id().is_some());

        h.dispatcher
            .dispatch(&session, Envelope::new("2", Message::Heartbeat(Heartbeat::default())))
            .await;
        match rx.try_recv().unwrap().message {
            Message::Heartbeat(hb) => assert!(hb.timestamp > 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_superseded_session_skips_cleanup() {
        let h = harness();
        let (old, mut rx_old) = open(&h).await;
        let (new, mut rx_new) = open(&h).await;

        let connect = || {
            Envelope::new(
                "c",
                Message::Connect(SessionConnect {
                    device_id: "d1".into(),
                    ..Default::default()
                }),
            )
        };
        h.dispatcher.dispatch(&old, connect()).await;
        rx_old.try_recv().unwrap();
        h.dispatcher
            .dispatch(
                &old,
                Envelope::new(
                    "r",
                    Message::RoomCreate(RoomCreate {
                        name: "r1".into(),
                        max_players: 4,
                        ..Default::default()
                    }),
                ),
            )
            .await;
        h.dispatcher.dispatch(&new, connect()).await;
        rx_new.try_recv().unwrap();

        h.dispatcher.sessions().close(&old).await;
        h.dispatcher.on_disconnect(&old).await;

        let player = new.player_id().unwrap();
        assert!(h.rooms.player_room(player).await.is_some());
    }
}
