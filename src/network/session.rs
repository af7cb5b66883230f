//! Session Registry
//!
//! Owns the set of live connections, indexed by session id and, once
//! authenticated, by player id. Both indices sit behind one lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::CallScope;
use crate::network::protocol::Envelope;

/// Delivery failure for a single envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// Session closed or closing.
    #[error("session closed")]
    Closed,
    /// Outbound queue full; the session has been torn down.
    #[error("outbound queue full")]
    QueueFull,
    /// No live session for that player.
    #[error("player not connected")]
    NotConnected,
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Session already bound to a player.
    #[error("session already bound to player {0}")]
    AlreadyBound(String),
    /// Session no longer registered.
    #[error("session closed")]
    Closed,
}

// =============================================================================
// SESSION
// =============================================================================

/// Gateway-side state for one client connection.
#[derive(Debug)]
pub struct Session {
    id: String,
    scope: CallScope,
    player_id: OnceLock<String>,
    outbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
    created_at: DateTime<Utc>,
    remote_addr: Option<SocketAddr>,
}

impl Session {
    /// Create a session with a bounded outbound queue.
    ///
    /// The receiver belongs to the connection's outbound loop.
    pub fn new(
        scope_key: impl Into<String>,
        queue_size: usize,
        remote_addr: Option<SocketAddr>,
    ) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (outbound, rx) = mpsc::channel(queue_size.max(1));
        let session = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            scope: CallScope::new(scope_key),
            player_id: OnceLock::new(),
            outbound,
            cancel: CancellationToken::new(),
            created_at: Utc::now(),
            remote_addr,
        });
        (session, rx)
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tenant/game key given at connect time.
    pub fn scope_key(&self) -> &str {
        &self.scope.scope_key
    }

    /// Backend call scope for this session.
    pub fn scope(&self) -> &CallScope {
        &self.scope
    }

    /// Player id, once authenticated.
    pub fn player_id(&self) -> Option<&str> {
        self.player_id.get().map(String::as_str)
    }

    /// When the connection was accepted.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Peer address, if known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Cancellation signal shared by both pump loops.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Non-blocking enqueue.
    pub fn enqueue(&self, envelope: Envelope) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

// =============================================================================
// SESSION REGISTRY
// =============================================================================

#[derive(Default)]
struct Indices {
    by_session: HashMap<String, Arc<Session>>,
    by_player: HashMap<String, Arc<Session>>,
}

/// Live sessions indexed by session id and player id.
#[derive(Default)]
pub struct SessionRegistry {
    indices: RwLock<Indices>,
    live: AtomicUsize,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a new session. Returns false if the session was already closed.
    pub async fn register(&self, session: &Arc<Session>) -> bool {
        let mut indices = self.indices.write().await;
        if session.is_closed() {
            return false;
        }
        if indices
            .by_session
            .insert(session.id.clone(), session.clone())
            .is_none()
        {
            self.live.fetch_add(1, Ordering::Relaxed);
        }
        debug!(session_id = %session.id, "session registered");
        true
    }

    /// Bind an authenticated player to a session.
    ///
    /// Returns the session previously indexed under that player, if another
    /// connection is being superseded.
    pub async fn bind(
        &self,
        player_id: &str,
        session: &Arc<Session>,
    ) -> Result<Option<Arc<Session>>, SessionError> {
        let mut indices = self.indices.write().await;
        if !indices.by_session.contains_key(&session.id) {
            return Err(SessionError::Closed);
        }
        if let Some(bound) = session.player_id() {
            return Err(SessionError::AlreadyBound(bound.to_string()));
        }
        if session.player_id.set(player_id.to_string()).is_err() {
            return Err(SessionError::AlreadyBound(
                session.player_id().unwrap_or_default().to_string(),
            ));
        }

        let previous = indices
            .by_player
            .insert(player_id.to_string(), session.clone())
            .filter(|prev| !Arc::ptr_eq(prev, session));
        if let Some(prev) = &previous {
            info!(
                player_id = %player_id,
                old_session = %prev.id,
                new_session = %session.id,
                "player session superseded"
            );
        }
        Ok(previous)
    }

    /// Find a session by connection id.
    pub async fn lookup(&self, session_id: &str) -> Option<Arc<Session>> {
        self.indices.read().await.by_session.get(session_id).cloned()
    }

    /// Find the session currently bound to a player.
    pub async fn lookup_player(&self, player_id: &str) -> Option<Arc<Session>> {
        self.indices.read().await.by_player.get(player_id).cloned()
    }

    /// Whether another session has since been bound to this session's player.
    ///
    /// Stays accurate after `session` itself was closed.
    pub async fn is_superseded(&self, session: &Arc<Session>) -> bool {
        match session.player_id() {
            Some(pid) => self
                .indices
                .read()
                .await
                .by_player
                .get(pid)
                .is_some_and(|s| !Arc::ptr_eq(s, session)),
            None => false,
        }
    }

    /// Remove a session from both indices and signal its loops to stop.
    ///
    /// Idempotent. Returns true for the call that actually removed it.
    pub async fn close(&self, session: &Arc<Session>) -> bool {
        let removed = {
            let mut indices = self.indices.write().await;
            let removed = indices.by_session.remove(&session.id).is_some();
            if let Some(pid) = session.player_id() {
                if indices
                    .by_player
                    .get(pid)
                    .is_some_and(|s| Arc::ptr_eq(s, session))
                {
                    indices.by_player.remove(pid);
                }
            }
            removed
        };
        session.cancel.cancel();

        if removed {
            self.live.fetch_sub(1, Ordering::Relaxed);
            info!(
                session_id = %session.id,
                player_id = session.player_id().unwrap_or("-"),
                "session closed"
            );
        }
        removed
    }

    /// Deliver an envelope to one session.
    ///
    /// A full queue tears the session down.
    pub async fn send(&self, session: &Arc<Session>, envelope: Envelope) -> Result<(), SendError> {
        match session.enqueue(envelope) {
            Err(SendError::QueueFull) => {
                warn!(session_id = %session.id, "outbound queue full, closing session");
                self.close(session).await;
                Err(SendError::QueueFull)
            }
            other => other,
        }
    }

    /// Deliver an envelope to whichever session a player is bound to.
    pub async fn send_to_player(&self, player_id: &str, envelope: Envelope) -> Result<(), SendError> {
        let session = self
            .lookup_player(player_id)
            .await
            .ok_or(SendError::NotConnected)?;
        self.send(&session, envelope).await
    }

    /// Best-effort fan-out. Returns how many recipients accepted the envelope.
    pub async fn send_to_players<'a, I>(&self, player_ids: I, envelope: &Envelope) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut delivered = 0;
        for player_id in player_ids {
            let mut copy = envelope.clone();
            copy.id = uuid::Uuid::new_v4().to_string();
            match self.send_to_player(player_id, copy).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(player_id = %player_id, error = %e, "fan-out skipped recipient"),
            }
        }
        delivered
    }

    /// Close every live session.
    pub async fn close_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self
            .indices
            .read()
            .await
            .by_session
            .values()
            .cloned()
            .collect();
        let mut closed = 0;
        for session in &sessions {
            if self.close(session).await {
                closed += 1;
            }
        }
        closed
    }

    /// Number of registered sessions, readable without the lock.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

// =============================================================================
// TESTS
// =============================================================================
