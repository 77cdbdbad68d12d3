//! Public HTTP listener
//!
//! Accepts plain HTTP connections, routes each by host name to a connected agent
//! and hands the raw socket over to that agent's session.
pub mod head;
pub mod server;

pub use head::{read_request_head, HeadError, RequestHead, MAX_HEAD_SIZE};
pub use server::{HttpServer, HttpServerConfig, HttpServerError};
