//! Shared State
//!
//! Cross-connection state: rooms, replicated objects and the RPC table.
//! Each component guards its own data; there is no global lock.

pub mod objects;
pub mod room;
pub mod rpc;

pub use objects::{NetworkObject, ObjectError, ObjectRegistry, Transform, ViewId};
pub use room::{CreateRoom, Departure, JoinOutcome, Room, RoomError, RoomManager, Visibility};
pub use rpc::{CallContext, RpcError, RpcRouter, ServerFunction};
