//! RPC handler.
//!
//! `server` calls run a registered function and reply with its result.
//! Every other target is relayed to room members as an [`RpcEvent`] after
//! the caller has been acknowledged.
//!
//! [`RpcEvent`]: crate::network::protocol::RpcEvent

use tracing::{debug, info};

use crate::network::dispatch::{Dispatcher, Request};
use crate::network::protocol::{ErrorCode, Message, RpcCall, RpcResult, RpcTarget};
use crate::state::rpc::{CallContext, RpcRouter};

const CLIENT_ACK: &[u8] = br#"{"success":true}"#;

impl Dispatcher {
    pub(crate) async fn handle_rpc(&self, req: &Request<'_>, call: RpcCall) {
        info!(
            method = %call.method,
            target = ?call.target,
            session_id = %req.session.id(),
            player_id = %req.player_id,
            "rpc call"
        );

        if call.target == RpcTarget::Server {
            return self.handle_server_rpc(req, call).await;
        }

        let Some(room) = self.rooms.player_room(&req.player_id).await else {
            return self
                .reply_error(
                    req,
                    ErrorCode::NotInRoom,
                    "You must be in a room to make client RPC calls",
                )
                .await;
        };

        self.reply(
            req,
            Message::RpcResult(RpcResult {
                id: call.id.clone(),
                result: CLIENT_ACK.to_vec(),
            }),
        )
        .await;

        let targets = RpcRouter::resolve_targets(&call, &req.player_id, &room);
        let event = RpcRouter::create_event(&call, &req.player_id);
        let delivered = self.fanout.to_players(&targets, Message::RpcEvent(event)).await;
        debug!(method = %call.method, targets = targets.len(), delivered, "rpc relayed");
    }

    async fn handle_server_rpc(&self, req: &Request<'_>, call: RpcCall) {
        let ctx = CallContext {
            player_id: req.player_id.clone(),
            session_id: req.session.id().to_string(),
            scope: req.session.scope().clone(),
        };

        match self.rpc.call_server_function(&ctx, &call.method, &call.params).await {
            Ok(result) => {
                self.reply(req, Message::RpcResult(RpcResult { id: call.id, result }))
                    .await
            }
            Err(e) => {
                debug!(method = %call.method, error = %e, "server function failed");
                self.reply_error(req, ErrorCode::RpcError, e.to_string()).await
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::super::testing::{error_code, Harness};
    use crate::network::protocol::{ErrorCode, Message, RpcCall, RpcTarget};

    fn call(target: RpcTarget, target_players: &[u8]) -> Message {
        Message::Rpc(RpcCall {
            id: "call-1".into(),
            method: "wave".into(),
            params: b"{}".to_vec(),
            target,
            target_players: target_players.to_vec(),
            view_id: 0,
        })
    }

    fn ack_of(message: &Message) -> (&str, serde_json::Value) {
        match message {
            Message::RpcResult(r) => (r.id.as_str(), serde_json::from_slice(&r.result).unwrap()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_specific_list_reaches_nobody() {
        let h = Harness::new();
        let mut a = h.connect("d1").await;
        let mut b = h.connect("d2").await;
        let room_id = h.create_room(&mut a, 4).await;
        h.join(&mut b, &room_id).await;
        a.drain();

        let reply = h
            .request(&mut a, "7", call(RpcTarget::Specific, b"not a list"))
            .await;
        assert_eq!(reply.id, "7");
        let (id, result) = ack_of(&reply.message);
        assert_eq!(id, "call-1");
        assert_eq!(result, serde_json::json!({"success": true}));

        assert!(a.drain().is_empty());
        assert!(b.drain().is_empty());
    }

    #[tokio::test]
    async fn test_specific_list_targets_named_players() {
        let h = Harness::new();
        let mut a = h.connect("d1").await;
        let mut b = h.connect("d2").await;
        let mut c = h.connect("d3").await;
        let room_id = h.create_room(&mut a, 4).await;
        h.join(&mut b, &room_id).await;
        h.join(&mut c, &room_id).await;
        a.drain();
        b.drain();

        let list = serde_json::to_vec(&[c.player_id.as_str()]).unwrap();
        h.request(&mut a, "7", call(RpcTarget::Specific, &list)).await;

        assert!(b.drain().is_empty());
        let events = c.drain();
        assert_eq!(events.len(), 1);
        match &events[0].message {
            Message::RpcEvent(event) => {
                assert_eq!(event.sender_id, a.player_id);
                assert_eq!(event.method, "wave");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_all_includes_caller_after_ack() {
        let h = Harness::new();
        let mut a = h.connect("d1").await;
        let mut b = h.connect("d2").await;
        let room_id = h.create_room(&mut a, 4).await;
        h.join(&mut b, &room_id).await;
        a.drain();

        let reply = h.request(&mut a, "7", call(RpcTarget::All, b"")).await;
        ack_of(&reply.message);
        let own = a.drain();
        assert_eq!(own.len(), 1);
        assert!(matches!(own[0].message, Message::RpcEvent(_)));
        assert_eq!(b.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_client_rpc_outside_room() {
        let h = Harness::new();
        let mut a = h.connect("d1").await;
        let reply = h.request(&mut a, "7", call(RpcTarget::Others, b"")).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::NotInRoom));
    }

    #[tokio::test]
    async fn test_unregistered_server_function() {
        let h = Harness::new();
        let mut a = h.connect("d1").await;
        let reply = h.request(&mut a, "7", call(RpcTarget::Server, b"")).await;
        assert_eq!(error_code(&reply), Some(ErrorCode::RpcError));
    }
}
