//! Tunnel agent
//!
//! Runs next to a local service: holds the control channel open to a relay and
//! opens one local TCP connection per stream the relay announces. Relays are
//! reached over `ws://` or `wss://`.

pub mod agent;
pub mod config;
mod tls;

pub use agent::{Agent, AgentConnection, AgentError};
pub use config::AgentConfig;
