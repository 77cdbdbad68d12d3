//! Control-channel protocol definitions
//!
//! The relay and a tunnel agent exchange colon-delimited ASCII text frames over a
//! single WebSocket. Each frame refers to one logical stream (one public
//! connection) by a numeric id scoped to the agent's session:
//!
//! | Frame | Direction |
//! |---|---|
//! | `msg:<streamId>:<hexPayload>` | both |
//! | `close:<streamId>` | both |
//! | `registered:<streamId>` / `start:<streamId>` | relay → agent |

pub mod frame;

pub use frame::{Frame, FrameError, FrameKind, StreamId};

/// Header carrying the agent credential on the registration request
pub const TOKEN_HEADER: &str = "X-Hexrelay-Token";

/// Header that overrides the routing host, on both registration and public requests
pub const HOST_HEADER: &str = "X-Hexrelay-Host";

/// Query parameter naming the routing identifier on the registration request
pub const HOST_QUERY_PARAM: &str = "host";

/// Query parameter fallback for the credential
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Path of the control-channel upgrade endpoint
pub const REGISTER_PATH: &str = "/register";

/// Size of a single read from a public (or local) connection (100 KiB)
pub const RELAY_CHUNK_SIZE: usize = 100 * 1024;

/// Initial value of a session's stream counter; the first assigned id is one above it
pub const INITIAL_STREAM_COUNTER: StreamId = 1;
