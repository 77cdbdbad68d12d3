//! Token file storage
//!
//! Manages the persisted token list (`./tokens.json` by default). A missing file is
//! an empty list, not an error.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Default token file location
pub const DEFAULT_TOKENS_PATH: &str = "./tokens.json";

/// Random bytes per generated token (256 bits)
pub const TOKEN_BYTES: usize = 32;

/// Token store errors
#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("Failed to read token file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write token file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse token file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Generate a new random token, hex-encoded
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Persisted ordered list of agent tokens
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all tokens, in insertion order
    pub fn load(&self) -> Result<Vec<String>, TokenStoreError> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Token file {:?} does not exist, treating as empty", self.path);
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(TokenStoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_str(&json).map_err(|source| TokenStoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the stored list
    pub fn save(&self, tokens: &[String]) -> Result<(), TokenStoreError> {
        let json = serde_json::to_string_pretty(tokens).map_err(|source| TokenStoreError::Parse {
            path: self.path.clone(),
            source,
        })?;

        self.write_private(json.as_bytes())
            .map_err(|source| TokenStoreError::Write {
                path: self.path.clone(),
                source,
            })
    }

    /// Generate a token, append it to the store and return it
    pub fn generate(&self) -> Result<String, TokenStoreError> {
        let token = generate_token();
        let mut tokens = self.load()?;
        tokens.push(token.clone());
        self.save(&tokens)?;
        Ok(token)
    }

    /// Remove every token
    pub fn clear(&self) -> Result<(), TokenStoreError> {
        self.save(&[])
    }

    /// Remove all entries equal to `token`, returning how many were removed
    pub fn remove(&self, token: &str) -> Result<usize, TokenStoreError> {
        let tokens = self.load()?;
        let before = tokens.len();
        let kept: Vec<String> = tokens.into_iter().filter(|t| t != token).collect();
        let removed = before - kept.len();
        self.save(&kept)?;
        Ok(removed)
    }

    #[cfg(unix)]
    fn write_private(&self, data: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)?;
        file.write_all(data)
    }

    #[cfg(not(unix))]
    fn write_private(&self, data: &[u8]) -> io::Result<()> {
        let mut file = fs::File::create(&self.path)?;
        file.write_all(data)
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new(DEFAULT_TOKENS_PATH)
    }
}
