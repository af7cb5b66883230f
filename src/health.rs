//! Health Reporting
//!
//! Liveness, readiness and a detailed report, answered synchronously from
//! the backend channel state and the session count.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::backend::{BackendClient, ChannelState};
use crate::network::session::SessionRegistry;

/// Overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Backend reachable.
    Healthy,
    /// Serving, but the backend is not ready.
    Degraded,
}

/// Detailed health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,
    /// Backend channel state.
    pub backend: ChannelState,
    /// Live connections.
    pub connections: usize,
    /// Crate version.
    pub version: &'static str,
    /// RFC 3339 timestamp.
    pub timestamp: String,
}

/// Answers health queries.
#[derive(Clone)]
pub struct HealthReporter {
    backend: BackendClient,
    sessions: Arc<SessionRegistry>,
}

impl HealthReporter {
    /// Reporter over the given components.
    pub fn new(backend: BackendClient, sessions: Arc<SessionRegistry>) -> Self {
        Self { backend, sessions }
    }

    /// The process is up.
    pub fn liveness(&self) -> bool {
        true
    }

    /// The backend channel can take calls.
    pub fn readiness(&self) -> bool {
        self.backend.channel_state().is_ready()
    }

    /// Full report.
    pub fn detailed(&self) -> HealthReport {
        let backend = self.backend.channel_state();
        HealthReport {
            status: if backend.is_ready() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            backend,
            connections: self.sessions.live_count(),
            version: crate::VERSION,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}
