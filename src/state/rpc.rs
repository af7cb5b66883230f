//! RPC Router
//!
//! Holds the table of server-side functions and resolves who receives a
//! client-targeted call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::backend::CallScope;
use crate::network::protocol::{RpcCall, RpcEvent, RpcTarget};
use crate::state::room::{Room, RoomError};

/// Who is calling a server function.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Authenticated caller.
    pub player_id: String,
    /// Caller's connection.
    pub session_id: String,
    /// Backend scope of the caller.
    pub scope: CallScope,
}

/// Server function failures.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No function registered under that name.
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    /// Parameters did not parse.
    #[error("invalid params: {0}")]
    InvalidParams(#[from] serde_json::Error),
    /// Caller may not do this.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Room operation failed.
    #[error(transparent)]
    Room(#[from] RoomError),
    /// Function-specific failure.
    #[error("{0}")]
    Failed(String),
}

/// A function callable with [`RpcTarget::Server`].
#[async_trait]
pub trait ServerFunction: Send + Sync {
    /// Run with raw parameter bytes; the returned bytes are the reply.
    async fn call(&self, ctx: &CallContext, params: &[u8]) -> Result<Vec<u8>, RpcError>;
}

#[async_trait]
impl<F, Fut> ServerFunction for F
where
    F: Fn(CallContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, RpcError>> + Send + 'static,
{
    async fn call(&self, ctx: &CallContext, params: &[u8]) -> Result<Vec<u8>, RpcError> {
        (self)(ctx.clone(), params.to_vec()).await
    }
}

/// Function table plus target resolution.
#[derive(Default)]
pub struct RpcRouter {
    functions: RwLock<HashMap<String, Arc<dyn ServerFunction>>>,
}

impl RpcRouter {
    /// Empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function, replacing any previous one with the same name.
    pub async fn register(&self, name: impl Into<String>, function: Arc<dyn ServerFunction>) {
        let name = name.into();
        let replaced = self
            .functions
            .write()
            .await
            .insert(name.clone(), function)
            .is_some();
        info!(function = %name, replaced, "server function registered");
    }

    /// Whether a function is registered.
    pub async fn has_function(&self, name: &str) -> bool {
        self.functions.read().await.contains_key(name)
    }

    /// Registered names, sorted.
    pub async fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke a server function.
    pub async fn call_server_function(
        &self,
        ctx: &CallContext,
        name: &str,
        params: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        let function = self
            .functions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::UnknownFunction(name.to_string()))?;
        debug!(function = %name, player_id = %ctx.player_id, "calling server function");
        function.call(ctx, params).await
    }

    /// Event delivered to peers for a client-targeted call.
    pub fn create_event(call: &RpcCall, sender_id: &str) -> RpcEvent {
        RpcEvent {
            id: call.id.clone(),
            sender_id: sender_id.to_string(),
            method: call.method.clone(),
            params: call.params.clone(),
            view_id: call.view_id,
        }
    }

    /// Recipients of a client-targeted call within `room`.
    ///
    /// A malformed `Specific` list resolves to nobody.
    pub fn resolve_targets(call: &RpcCall, sender_id: &str, room: &Room) -> Vec<String> {
        match call.target {
            RpcTarget::All => room.member_ids(),
            RpcTarget::Others => room
                .member_ids()
                .into_iter()
                .filter(|id| id != sender_id)
                .collect(),
            RpcTarget::Master => {
                if room.owner_id.is_empty() {
                    Vec::new()
                } else {
                    vec![room.owner_id.clone()]
                }
            }
            RpcTarget::Specific => {
                serde_json::from_slice::<Vec<String>>(&call.target_players).unwrap_or_default()
            }
            RpcTarget::Server => Vec::new(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
