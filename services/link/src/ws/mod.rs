//! WebSocket Transport
//!
//! - `connection`: per-connection reader/writer tasks and the sending handle.
//! - `dispatch`: the coordinator task owning dedup and turn-taking state.
//! - `server`: the inbound-accepting endpoint.
//! - `client`: the outbound-dialling endpoint.

pub mod client;
pub mod connection;
pub(crate) mod dispatch;
pub mod server;

pub use client::ClientEndpoint;
pub use connection::{ConnectionHandle, ConnectionId, ConnectionRole};
pub use server::ServerEndpoint;
