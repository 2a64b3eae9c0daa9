//! Identity persistence seen from the authority.
//!
//! The authority only needs to load and save one record per username; how and
//! where records live is up to the implementation. [`MemoryStore`] keeps them in
//! process memory.

use crate::packet::KeyData;
use secrecy::{ExposeSecret, SecretBox};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identity store unavailable: {0}")]
    Unavailable(String),
}

/// OTP shared secret. Never printed, zeroed on drop.
#[derive(Clone)]
pub struct OtpSecret(Arc<SecretBox<[u8]>>);

impl OtpSecret {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::new(SecretBox::new(bytes.into_boxed_slice())))
    }

    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.0.expose_secret()
    }
}

impl fmt::Debug for OtpSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OtpSecret(***)")
    }
}

/// Everything known about one registered user.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub username: String,
    pub public_key: KeyData,
    pub secret: Option<OtpSecret>,
    /// Clock drift of the user's token, in OTP time steps.
    pub drift: i64,
}

impl IdentityRecord {
    #[must_use]
    pub fn new(username: impl Into<String>, public_key: KeyData) -> Self {
        Self {
            username: username.into(),
            public_key,
            secret: None,
            drift: 0,
        }
    }

    #[must_use]
    pub fn with_secret(mut self, secret: OtpSecret) -> Self {
        self.secret = Some(secret);
        self
    }
}

pub trait IdentityStore: Send + Sync {
    /// # Errors
    /// Returns [`StoreError`] if the backend cannot be reached.
    fn load(&self, username: &str) -> Result<Option<IdentityRecord>, StoreError>;

    /// Insert or replace the record for `record.username`.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the backend cannot be reached.
    fn save(&self, record: IdentityRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, IdentityRecord>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdentityStore for MemoryStore {
    fn load(&self, username: &str) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .cloned())
    }

    fn save(&self, record: IdentityRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.username.clone(), record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_redacted() {
        let secret = OtpSecret::new(b"hunter2".to_vec());
        assert_eq!(format!("{secret:?}"), "OtpSecret(***)");
        assert_eq!(secret.expose(), b"hunter2");
    }

    #[test]
    fn save_replaces_record() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        let first = IdentityRecord::new("alice", KeyData::rsa(vec![1], vec![3]));
        assert!(store.save(first).is_ok());

        let mut second = IdentityRecord::new("alice", KeyData::rsa(vec![2], vec![3]))
            .with_secret(OtpSecret::new(vec![7; 20]));
        second.drift = 4;
        assert!(store.save(second).is_ok());

        assert_eq!(store.len(), 1);
        let loaded = store.load("alice").ok().flatten();
        assert_eq!(
            loaded.as_ref().map(|r| r.public_key.clone()),
            Some(KeyData::rsa(vec![2], vec![3]))
        );
        assert_eq!(loaded.as_ref().map(|r| r.drift), Some(4));
        assert_eq!(
            loaded.and_then(|r| r.secret).map(|s| s.expose().to_vec()),
            Some(vec![7; 20])
        );
    }

    #[test]
    fn unknown_user_is_none() {
        let store = MemoryStore::new();
        assert!(matches!(store.load("bob"), Ok(None)));
    }
}
