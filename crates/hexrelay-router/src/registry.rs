//! Client registry: routing identifier -> live client session
//!
//! Registration is last-writer-wins. A replaced session is not torn down here; it
//! goes away when its own control channel closes, and at that point it may only
//! evict itself, never a newer session holding the same identifier.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry of connected client sessions keyed by routing identifier
pub struct ClientRegistry<S> {
    sessions: DashMap<String, Arc<S>>,
}

impl<S> ClientRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register `session` under `identifier`, replacing any previous holder
    ///
    /// Returns the replaced session, if there was one.
    pub fn set(&self, identifier: impl Into<String>, session: Arc<S>) -> Option<Arc<S>> {
        let identifier = identifier.into();
        let previous = self.sessions.insert(identifier.clone(), session);

        if previous.is_some() {
            info!(identifier = %identifier, "Replaced existing client session");
        } else {
            debug!(identifier = %identifier, "Registered client session");
        }

        previous
    }

    /// Look up the current session for `identifier`
    pub fn get(&self, identifier: &str) -> Option<Arc<S>> {
        self.sessions
            .get(identifier)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `identifier` only if it is still held by `session`
    ///
    /// Returns whether an entry was removed.
    pub fn delete(&self, identifier: &str, session: &Arc<S>) -> bool {
        let removed = self
            .sessions
            .remove_if(identifier, |_, current| Arc::ptr_eq(current, session))
            .is_some();

        if removed {
            debug!(identifier = %identifier, "Evicted client session");
        } else {
            debug!(
                identifier = %identifier,
                "Skipped eviction: identifier absent or held by a newer session"
            );
        }

        removed
    }

    /// Check if an identifier has a live session
    pub fn contains(&self, identifier: &str) -> bool {
        self.sessions.contains_key(identifier)
    }

    /// All registered identifiers
    pub fn identifiers(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of live sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

impl<S> Default for ClientRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
