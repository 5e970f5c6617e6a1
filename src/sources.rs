//! Collaborator interfaces: the remote token operation and credential storage

use crate::AccessToken;
use async_trait::async_trait;
use std::collections::HashMap;
use std::error;
use std::sync::Mutex;

/// An asynchronous source of replacement tokens
///
/// This is the host-supplied "obtain a new token" operation. The refresh
/// coordinator treats it as opaque; whatever it returns is validated before
/// being exposed to anyone.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// The error type returned when obtaining a token fails
    type Error: error::Error + Send + Sync + 'static;

    /// Requests a fresh token
    async fn request_token(&mut self) -> Result<AccessToken, Self::Error>;
}

/// Well-known credential store keys
pub mod keys {
    /// The current bearer token
    pub const ACCESS_TOKEN: &str = "auth.access_token";
    /// The refresh token, if the host uses one
    pub const REFRESH_TOKEN: &str = "auth.refresh_token";
    /// The cached user record associated with the session
    pub const CACHED_USER: &str = "auth.cached_user";
}

/// Persistent storage for session credentials
///
/// The recovery state machine is the only component that clears entries;
/// everything else only reads.
pub trait CredentialStore: Send + Sync {
    /// Reads a stored value
    fn get(&self, key: &str) -> Option<String>;
    /// Writes a value
    fn set(&self, key: &str, value: &str);
    /// Removes a value
    fn remove(&self, key: &str);
}

/// Removes every credential entry from the store
pub fn clear_credentials(store: &dyn CredentialStore) {
    for key in &[keys::ACCESS_TOKEN, keys::REFRESH_TOKEN, keys::CACHED_USER] {
        store.remove(key);
    }
}

/// An in-memory credential store
///
/// Suitable for tests and for hosts without platform storage.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    /// Constructs a new, empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.to_owned());
    }

    fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryCredentialStore::new();
        store.set(keys::ACCESS_TOKEN, "abc");
        assert_eq!(store.get(keys::ACCESS_TOKEN).as_deref(), Some("abc"));
        store.remove(keys::ACCESS_TOKEN);
        assert_eq!(store.get(keys::ACCESS_TOKEN), None);
    }

    #[test]
    fn clear_credentials_removes_every_entry() {
        let store = MemoryCredentialStore::new();
        store.set(keys::ACCESS_TOKEN, "a");
        store.set(keys::REFRESH_TOKEN, "b");
        store.set(keys::CACHED_USER, "{}");
        store.set("unrelated", "kept");
        clear_credentials(&store);
        assert_eq!(store.get(keys::ACCESS_TOKEN), None);
        assert_eq!(store.get(keys::REFRESH_TOKEN), None);
        assert_eq!(store.get(keys::CACHED_USER), None);
        assert_eq!(store.get("unrelated").as_deref(), Some("kept"));
    }
}
