//! Connect, heartbeat and disconnect.

use tracing::{info, warn};

use crate::network::dispatch::{Dispatcher, Request};
use crate::network::protocol::{Disconnect, ErrorCode, Heartbeat, Message, Metadata, SessionConnect};
use crate::network::session::SessionError;

impl Dispatcher {
    pub(crate) async fn handle_connect(&self, req: &Request<'_>, connect: SessionConnect) {
        let session = req.session;
        if let Some(bound) = session.player_id() {
            self.reply_error(
                req,
                ErrorCode::AlreadyAuthenticated,
                format!("Session already authenticated as {}", bound),
            )
            .await;
            return;
        }
        if session.scope_key().is_empty() {
            self.reply_error(req, ErrorCode::InvalidPayload, "Game key not found")
                .await;
            return;
        }

        let device_id = (!connect.device_id.is_empty()).then_some(connect.device_id.as_str());
        let token = (!connect.token.is_empty()).then_some(connect.token.as_str());
        if device_id.is_none() && token.is_none() {
            self.reply_error(req, ErrorCode::InvalidPayload, "device_id or token required")
                .await;
            return;
        }

        let auth = match self
            .backend
            .authenticate(session.scope(), device_id, token)
            .await
        {
            Ok(auth) => auth,
            Err(e) => {
                self.reply_backend_error(req, &e).await;
                return;
            }
        };

        match self.sessions.bind(&auth.player_id, session).await {
            Ok(superseded) => {
                if let Some(old) = superseded {
                    info!(player_id = %auth.player_id, old_session = %old.id(), "player reconnected");
                }
            }
            Err(SessionError::AlreadyBound(bound)) => {
                self.reply_error(
                    req,
                    ErrorCode::AlreadyAuthenticated,
                    format!("Session already authenticated as {}", bound),
                )
                .await;
                return;
            }
            Err(SessionError::Closed) => {
                warn!(session_id = %session.id(), "session closed during authentication");
                return;
            }
        }

        info!(
            session_id = %session.id(),
            player_id = %auth.player_id,
            game_key = %session.scope_key(),
            created = auth.created,
            "player authenticated"
        );

        let mut metadata = Metadata::new();
        metadata.insert("user_id".into(), auth.player_id.clone());
        metadata.insert("status".into(), "online".into());
        metadata.insert("session_id".into(), session.id().to_string());
        self.reply(
            req,
            Message::Connect(SessionConnect {
                device_id: String::new(),
                token: auth.token,
                connection_metadata: metadata,
            }),
        )
        .await;
    }

    pub(crate) async fn handle_heartbeat(&self, req: &Request<'_>, _heartbeat: Heartbeat) {
        self.reply(
            req,
            Message::Heartbeat(Heartbeat {
                timestamp: chrono::Utc::now().timestamp_millis(),
            }),
        )
        .await;
    }

    pub(crate) async fn handle_disconnect(&self, req: &Request<'_>, disconnect: Disconnect) {
        info!(
            session_id = %req.session.id(),
            player_id = %req.player_id,
            reason = %disconnect.reason,
            "client requested disconnect"
        );
        self.sessions.close(req.session).await;
    }
}

// =============================================================================
// TESTS
// =============================================================================
