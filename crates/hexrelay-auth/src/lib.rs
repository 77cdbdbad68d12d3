//! Credential storage and validation for tunnel agents
//!
//! Credentials are opaque hex tokens kept as a flat JSON array on disk. The relay
//! consults the store on every control-channel registration.

pub mod store;
pub mod validator;

pub use store::{generate_token, TokenStore, TokenStoreError, DEFAULT_TOKENS_PATH, TOKEN_BYTES};
pub use validator::{AuthError, CredentialValidator, StaticValidator, StoreValidator};
