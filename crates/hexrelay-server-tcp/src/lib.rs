//! Public raw TCP listener
pub mod server;

pub use server::{TcpServer, TcpServerConfig, TcpServerError};
