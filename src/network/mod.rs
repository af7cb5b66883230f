//! Network Layer
//!
//! WebSocket transport, the wire protocol, live sessions and the
//! dispatcher that routes client requests to shared state.

pub mod dispatch;
pub mod fanout;
mod handlers;
pub mod protocol;
pub mod server;
pub mod session;

pub use dispatch::{route, Dispatcher, Route};
pub use fanout::Fanout;
pub use protocol::{Envelope, ErrorCode, Message, OpCode};
pub use server::{RelayServer, RelayServerError, ServerConfig};
pub use session::{SendError, Session, SessionError, SessionRegistry};
