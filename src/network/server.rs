//! WebSocket Relay Server
//!
//! Accepts connections, performs the upgrade handshake and runs one
//! inbound/outbound pump pair per session.
//!
//! The handshake must carry a game key, either as the `X-Game-Key` header
//! or the `game_key` query parameter; upgrades without one are refused
//! with `400 Bad Request`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RelayConfig;
use crate::network::dispatch::Dispatcher;
use crate::network::protocol::{Envelope, ErrorCode};
use crate::network::session::Session;

/// Header carrying the game key.
pub const GAME_KEY_HEADER: &str = "x-game-key";

/// Query parameter carrying the game key.
pub const GAME_KEY_PARAM: &str = "game_key";

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Upgrade path.
    pub path: String,
    /// Largest accepted message.
    pub max_message_size: usize,
    /// Deadline for one frame write.
    pub write_wait: Duration,
    /// Read deadline.
    pub pong_wait: Duration,
    /// Keep-alive interval.
    pub ping_period: Duration,
    /// Outbound queue capacity per session.
    pub outbound_queue: usize,
    /// Time allowed for connections to finish on shutdown.
    pub shutdown_grace: Duration,
    /// Deadline for the upgrade handshake.
    pub handshake_timeout: Duration,
}

impl From<&RelayConfig> for ServerConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            bind_addr: config.server.bind_addr,
            max_connections: config.server.max_connections,
            path: config.websocket.path.clone(),
            max_message_size: config.websocket.max_message_size,
            write_wait: config.websocket.write_wait(),
            pong_wait: config.websocket.pong_wait(),
            ping_period: config.websocket.ping_period(),
            outbound_queue: config.websocket.outbound_queue,
            shutdown_grace: Duration::from_secs(config.server.shutdown_grace_secs),
            handshake_timeout: config.websocket.handshake_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl ServerConfig {
    fn websocket(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(self.max_message_size),
            max_frame_size: Some(self.max_message_size),
            ..Default::default()
        }
    }
}

/// Relay server errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayServerError {
    /// Failed to bind or accept.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket handshake or transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Game key from the upgrade request, header first.
pub fn game_key_from(request: &Request) -> Option<String> {
    if let Some(key) = request
        .headers()
        .get(GAME_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
    {
        return Some(key.to_string());
    }

    request.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, value)| *name == GAME_KEY_PARAM && !value.is_empty())
            .map(|(_, value)| value.to_string())
    })
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Validate an upgrade request and extract its game key.
pub fn check_upgrade(request: &Request, path: &str) -> Result<String, ErrorResponse> {
    if request.uri().path() != path {
        return Err(reject(StatusCode::NOT_FOUND, "not found"));
    }
    game_key_from(request).ok_or_else(|| reject(StatusCode::BAD_REQUEST, "game key required"))
}

// =============================================================================
// SERVER
// =============================================================================

/// The relay server.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    dispatcher: Arc<Dispatcher>,
    listener: TcpListener,
    shutdown: CancellationToken,
    /// One permit per accepted socket, held from accept until the
    /// connection task ends.
    slots: Arc<Semaphore>,
}

impl RelayServer {
    /// Bind the listener.
    pub async fn bind(
        config: ServerConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, RelayServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let slots = Arc::new(Semaphore::new(
            config.max_connections.min(Semaphore::MAX_PERMITS),
        ));
        Ok(Self {
            config: Arc::new(config),
            dispatcher,
            listener,
            shutdown: CancellationToken::new(),
            slots,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting and close every session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.dispatcher.sessions().live_count()
    }

    /// Accept connections until shut down.
    #[instrument(skip(self), fields(addr = %self.config.bind_addr))]
    pub async fn run(self) -> Result<(), RelayServerError> {
        info!(addr = %self.local_addr()?, path = %self.config.path, "relay server listening");
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("shutdown signal received");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    let permit = match self.slots.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(%addr, "connection limit reached, rejecting");
                            continue;
                        }
                    };

                    let config = self.config.clone();
                    let dispatcher = self.dispatcher.clone();
                    tracker.spawn(async move {
                        if let Err(e) = serve_connection(stream, addr, config, dispatcher, permit).await {
                            debug!(%addr, error = %e, "connection ended with error");
                        }
                    });
                }
            }
        }

        let closed = self.dispatcher.sessions().close_all().await;
        info!(closed, "closing live sessions");
        tracker.close();
        if timeout(self.config.shutdown_grace, tracker.wait()).await.is_err() {
            warn!("shutdown grace period elapsed with connections still open");
        }
        Ok(())
    }
}

// =============================================================================
// CONNECTION PUMPS
// =============================================================================

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: Arc<ServerConfig>,
    dispatcher: Arc<Dispatcher>,
    _slot: OwnedSemaphorePermit,
) -> Result<(), RelayServerError> {
    let mut game_key = None;
    let path = config.path.as_str();
    let handshake = accept_hdr_async_with_config(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let key = check_upgrade(request, path)?;
            game_key = Some(key);
            Ok(response)
        },
        Some(config.websocket()),
    );
    let ws = match timeout(config.handshake_timeout, handshake).await {
        Ok(ws) => ws?,
        Err(_) => {
            debug!(%addr, "handshake deadline exceeded");
            return Ok(());
        }
    };
    let Some(game_key) = game_key else {
        return Ok(());
    };

    let (session, outbound) = Session::new(game_key, config.outbound_queue, Some(addr));
    let sessions = dispatcher.sessions().clone();
    if !sessions.register(&session).await {
        return Ok(());
    }
    info!(session_id = %session.id(), %addr, game_key = %session.scope_key(), "connection opened");

    let (sink, source) = ws.split();
    let writer = tokio::spawn(write_pump(sink, outbound, session.clone(), config.clone()));

    read_pump(source, &session, &dispatcher, &config).await;

    sessions.close(&session).await;
    if let Err(e) = writer.await {
        error!(session_id = %session.id(), error = %e, "outbound task failed");
    }
    dispatcher.on_disconnect(&session).await;
    info!(
        session_id = %session.id(),
        player_id = session.player_id().unwrap_or("-"),
        remote = ?session.remote_addr(),
        duration_secs = (Utc::now() - session.created_at()).num_seconds(),
        "connection closed"
    );
    Ok(())
}

/// Correlation id of a frame that failed to decode, if one can be read.
fn salvage_id(bytes: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|v| v.get("id")?.as_str().map(str::to_string))
        .unwrap_or_default()
}

async fn read_pump(
    mut source: WsSource,
    session: &Arc<Session>,
    dispatcher: &Dispatcher,
    config: &ServerConfig,
) {
    let cancel = session.cancel_token().clone();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = timeout(config.pong_wait, source.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                info!(session_id = %session.id(), "read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(session_id = %session.id(), error = %e, "read failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let bytes = match frame {
            WsMessage::Binary(bytes) => bytes,
            WsMessage::Text(text) => text.into_bytes(),
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
        };

        match Envelope::from_bytes(&bytes) {
            Ok(envelope) => dispatcher.dispatch(session, envelope).await,
            Err(e) => {
                debug!(session_id = %session.id(), error = %e, "undecodable frame");
                let reply = Envelope::error(
                    salvage_id(&bytes),
                    ErrorCode::InvalidPayload,
                    "Invalid message format",
                );
                if dispatcher.sessions().send(session, reply).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn write_pump(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<Envelope>,
    session: Arc<Session>,
    config: Arc<ServerConfig>,
) {
    let cancel = session.cancel_token().clone();
    let mut ticker = interval_at(Instant::now() + config.ping_period, config.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = outbound.recv() => {
                let Some(envelope) = next else { break };
                match envelope.to_bytes() {
                    Ok(bytes) => WsMessage::Binary(bytes),
                    Err(e) => {
                        error!(session_id = %session.id(), error = %e, "failed to encode envelope");
                        continue;
                    }
                }
            }
            _ = ticker.tick() => {
                if !outbound.is_empty() {
                    continue;
                }
                WsMessage::Ping(Vec::new())
            }
        };

        match timeout(config.write_wait, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(session_id = %session.id(), error = %e, "write failed");
                break;
            }
            Err(_) => {
                warn!(session_id = %session.id(), "write deadline exceeded");
                break;
            }
        }
    }

    outbound.close();
    let _ = timeout(config.write_wait, sink.send(WsMessage::Close(None))).await;
    cancel.cancel();
}

// =============================================================================
// TESTS
// =============================================================================
