//! Request handlers, one file per area.
//!
//! Every handler is an `impl Dispatcher` block method taking the parsed
//! [`Request`](super::dispatch::Request) and its payload. Handlers reply on
//! the originating session; failures become error envelopes.

mod auth;
mod matchmaking;
mod player;
mod room;
mod rpc;
mod sync;

#[cfg(test)]
mod testing;
