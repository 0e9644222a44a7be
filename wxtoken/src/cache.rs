//! Durable caching of the access token across restarts
//!
//! After every successful refresh the token is written to the configured
//! cache under a fixed key, with an expiry shortened by a safety margin. On
//! start-up an empty credential store can be seeded from that record, so a
//! restarted process does not immediately spend an issuer call.

use std::error;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use wxtoken_clock::{DurationSecs, UnixTime};

use crate::{AccessToken, AppIdRef, Credential};

#[cfg(feature = "file")]
pub mod file;
pub mod in_memory;

#[cfg(feature = "file")]
pub use file::FileCache;
pub use in_memory::InMemoryCache;

/// An error from a persistent cache
pub type CacheError = Box<dyn error::Error + Send + Sync + 'static>;

/// Subtracted from a token's expiry when it is persisted
pub const DEFAULT_SAFETY_MARGIN: DurationSecs = DurationSecs(1500);

/// The persisted form of a credential
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCredential {
    /// The access token
    pub access_token: AccessToken,
    /// When the record should no longer be trusted
    pub expires_at: UnixTime,
}

/// A durable store for the access token
#[async_trait]
pub trait PersistentCache: Send + Sync {
    /// Loads the record stored under `key`, if any
    async fn load(&self, key: &str) -> Result<Option<PersistedCredential>, CacheError>;

    /// Stores `record` under `key`, replacing any previous record
    async fn store(&self, key: &str, record: &PersistedCredential) -> Result<(), CacheError>;
}

/// Gets the cache key used for an application's access token
pub fn cache_key(app_id: &AppIdRef) -> String {
    format!("wxtoken:access_token:{}", app_id)
}

/// A persistent cache together with how the token is written to it
pub struct CacheBinding {
    cache: Box<dyn PersistentCache>,
    key: String,
    safety_margin: DurationSecs,
}

impl CacheBinding {
    /// Binds `cache` to `key` using the default safety margin
    pub fn new(cache: impl PersistentCache + 'static, key: impl Into<String>) -> Self {
        Self {
            cache: Box::new(cache),
            key: key.into(),
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }

    /// Sets the margin subtracted from a token's expiry when it is written
    pub fn with_safety_margin(mut self, safety_margin: DurationSecs) -> Self {
        self.safety_margin = safety_margin;
        self
    }

    /// Gets the cache key
    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) async fn load(&self) -> Option<PersistedCredential> {
        match self.cache.load(&self.key).await {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(
                    cache.key = %self.key,
                    error = (&*error as &dyn error::Error),
                    "unable to read token from persistent cache"
                );
                None
            }
        }
    }

    pub(crate) async fn persist(&self, credential: &Credential, now: UnixTime) {
        let expires_at = credential.expires_at() - self.safety_margin;
        if expires_at <= now {
            tracing::debug!(
                cache.key = %self.key,
                expiry = credential.expires_at().0,
                safety_margin = self.safety_margin.0,
                "token too close to expiry to persist"
            );
            return;
        }

        let record = PersistedCredential {
            access_token: credential.access_token().to_owned(),
            expires_at,
        };

        match self.cache.store(&self.key, &record).await {
            Ok(()) => {
                tracing::trace!(cache.key = %self.key, expiry = expires_at.0, "persisted token");
            }
            Err(error) => {
                tracing::warn!(
                    cache.key = %self.key,
                    error = (&*error as &dyn error::Error),
                    "unable to persist token"
                );
            }
        }
    }
}

impl std::fmt::Debug for CacheBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CacheBinding")
            .field("key", &self.key)
            .field("safety_margin", &self.safety_margin)
            .finish_non_exhaustive()
    }
}
