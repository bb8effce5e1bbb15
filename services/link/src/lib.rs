//! Parley Link Library Crate
//!
//! The network side of a parley participant: a WebSocket server and client
//! feeding one dispatch coordinator, the `Communicator` facade over them,
//! environment configuration, and canned demo participants. The `parley`
//! binary is a thin wrapper around this library.

pub mod communicator;
pub mod config;
pub mod demo;
pub mod error;
pub mod ws;

pub use communicator::{Communicator, CommunicatorStats, communicator_pair};
pub use config::{ConfigError, LinkConfig};
pub use error::LinkError;
