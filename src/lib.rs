//! # Relay Gateway
//!
//! Real-time relay between game clients and a backend service. Clients
//! hold one WebSocket each; the gateway authenticates them, keeps room
//! membership and replicated objects in memory, relays room traffic and
//! RPCs, and forwards persistent operations to the backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       RELAY GATEWAY                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  network/        - Transport and routing                     │
//! │  ├── server.rs   - Accept loop, handshake, pump pair         │
//! │  ├── session.rs  - Session registry, bounded send queues     │
//! │  ├── protocol.rs - Envelope and payload types                │
//! │  ├── dispatch.rs - Op-code routing and auth gate             │
//! │  ├── fanout.rs   - Per-recipient delivery                    │
//! │  └── handlers/   - One handler per client operation          │
//! │                                                              │
//! │  state/          - Shared in-memory state                    │
//! │  ├── room.rs     - Rooms, membership, ownership              │
//! │  ├── objects.rs  - Replicated network objects                │
//! │  └── rpc.rs      - Server functions and RPC targets          │
//! │                                                              │
//! │  backend/        - Consumed backend service                  │
//! │  ├── mod.rs      - Backend trait, timeouts, error mapping    │
//! │  ├── auth.rs     - Session tokens                            │
//! │  └── memory.rs   - In-process backend                        │
//! │                                                              │
//! │  functions.rs    - Built-in server functions                 │
//! │  health.rs       - Liveness/readiness reporting              │
//! │  config.rs       - Layered configuration                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Model
//!
//! Each connection processes its own requests strictly in arrival order.
//! Outbound delivery never blocks: a session whose queue is full is
//! closed rather than buffered.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod functions;
pub mod health;
pub mod network;
pub mod state;

// Re-export commonly used types
pub use backend::{Backend, BackendClient, BackendError, CallScope, MemoryBackend};
pub use config::{ConfigError, RelayConfig};
pub use health::{HealthReport, HealthReporter, HealthStatus};
pub use network::{Dispatcher, Envelope, ErrorCode, Message, RelayServer, ServerConfig, SessionRegistry};
pub use state::{ObjectRegistry, RoomManager, RpcRouter};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
