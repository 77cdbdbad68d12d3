//! hexrelay - reverse tunnel relay over a hex-framed WebSocket control channel
//!
//! This crate re-exports the workspace crates and adds [`RelayBuilder`], which
//! wires the registry, control handler and public listeners into one [`Relay`].
//!
//! # Quick Start - Relay
//!
//! ```ignore
//! use hexrelay_lib::RelayBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = RelayBuilder::new()
//!         .control_addr("0.0.0.0:8888")?
//!         .http_addr("0.0.0.0:5000")?
//!         .tcp_route(7001, "ssh-box")
//!         .tokens_path("./tokens.json")
//!         .suffix("-hexrelay")
//!         .build()?;
//!
//!     relay.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Quick Start - Agent
//!
//! ```ignore
//! use hexrelay_lib::{Agent, AgentConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig::new("ws://relay.example.com:8888", "<token>", "127.0.0.1:3000")
//!     .with_identifier("myapp")
//!     .with_public_domain("relay.example.com");
//! Agent::new(config).run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Public requests to `http://myapp-hexrelay.relay.example.com:5000` then reach
//! `127.0.0.1:3000` on the agent's machine.

pub mod relay;

pub use relay::{BoundRelay, Relay, RelayBuilder, RelayBuilderError};

// Protocol
pub use hexrelay_proto::{Frame, FrameError, FrameKind, StreamId};

// Credentials
pub use hexrelay_auth::{
    generate_token, CredentialValidator, StaticValidator, StoreValidator, TokenStore,
    TokenStoreError,
};

// Routing
pub use hexrelay_router::{ClientRegistry, SubdomainResolver, TcpRoute};

// Control plane
pub use hexrelay_control::{ClientSession, ControlConfig, ControlHandler, SessionRegistry};

// Public listeners
pub use hexrelay_server_http::{HttpServer, HttpServerConfig};
pub use hexrelay_server_tcp::{TcpServer, TcpServerConfig};

// Agent
pub use hexrelay_client::{Agent, AgentConfig, AgentError};
