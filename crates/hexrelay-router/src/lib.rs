//! Routing logic for public traffic
//!
//! Maps an inbound public connection to the client session that should carry it:
//! HTTP requests by host-name subdomain, raw TCP connections by listener port.

pub mod host;
pub mod http;
pub mod registry;
pub mod tcp;

pub use host::SubdomainResolver;
pub use http::{HttpRouter, HttpRouterError};
pub use registry::ClientRegistry;
pub use tcp::{TcpRoute, TcpRouter, TcpRouterError};
