//! Credential validation
//!
//! Validators answer one question: is this token currently authorized? Failing to
//! read the credential set is reported as an error so callers can log it apart
//! from a plain rejection, and must be treated as "not authorized".

use crate::store::{TokenStore, TokenStoreError};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Credential store unavailable: {0}")]
    StoreUnavailable(#[from] TokenStoreError),
}

/// Credential validator trait
///
/// Implementations must compare in constant time with respect to token content.
pub trait CredentialValidator: Send + Sync {
    /// Returns `Ok(true)` if the token is authorized, `Ok(false)` if it is not
    fn validate(&self, token: &str) -> Result<bool, AuthError>;
}

/// Constant-time membership test of `token` in `tokens`
///
/// Every candidate is compared; the loop never exits early on a match.
fn contains_token(tokens: &[String], token: &str) -> bool {
    let candidate = token.as_bytes();
    let mut found = subtle::Choice::from(0u8);
    for stored in tokens {
        // ct_eq is already false for slices of different length
        found |= stored.as_bytes().ct_eq(candidate);
    }
    found.into()
}

/// Validator backed by the token file, re-read on every call so that
/// `hexrelay token` edits take effect without restarting the relay
#[derive(Debug, Clone)]
pub struct StoreValidator {
    store: TokenStore,
}

impl StoreValidator {
    pub fn new(store: TokenStore) -> Self {
        Self { store }
    }
}

impl CredentialValidator for StoreValidator {
    fn validate(&self, token: &str) -> Result<bool, AuthError> {
        let tokens = self.store.load()?;
        Ok(contains_token(&tokens, token))
    }
}

/// Fixed in-memory token set
#[derive(Debug, Clone, Default)]
pub struct StaticValidator {
    tokens: Vec<String>,
}

impl StaticValidator {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

impl CredentialValidator for StaticValidator {
    fn validate(&self, token: &str) -> Result<bool, AuthError> {
        Ok(contains_token(&self.tokens, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_contains_token() {
        let tokens = vec!["abc".to_string(), "deadbeef".to_string()];
        assert!(contains_token(&tokens, "deadbeef"));
        assert!(!contains_token(&tokens, "deadbee"));
        assert!(!contains_token(&tokens, "deadbeef0"));
        assert!(!contains_token(&tokens, ""));
        assert!(!contains_token(&[], "abc"));
    }

    #[test]
    fn test_generated_token_valid_until_removed() {
        let temp_dir = TempDir::new().unwrap();
        let store = TokenStore::new(temp_dir.path().join("tokens.json"));
        let validator = StoreValidator::new(store.clone());

        let token = store.generate().unwrap();
        assert!(validator.validate(&token).unwrap());

        store.remove(&token).unwrap();
        assert!(!validator.validate(&token).unwrap());
    }

    #[test]
    fn test_missing_store_rejects_everything() {
        let temp_dir = TempDir::new().unwrap();
        let validator = StoreValidator::new(TokenStore::new(temp_dir.path().join("absent.json")));
        assert!(!validator.validate("anything").unwrap());
    }

    #[test]
    fn test_unreadable_store_fails_closed() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tokens.json");
        fs::write(&path, "{ broken").unwrap();

        let validator = StoreValidator::new(TokenStore::new(path));
        assert!(matches!(
            validator.validate("anything"),
            Err(AuthError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn test_static_validator() {
        let validator = StaticValidator::new(["one", "two"]);
        assert!(validator.validate("two").unwrap());
        assert!(!validator.validate("three").unwrap());
    }
}
