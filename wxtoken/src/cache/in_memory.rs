//! An in-memory token cache

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CacheError, PersistedCredential, PersistentCache};

/// An in-memory token cache
///
/// Clones share the same entries. Mostly useful in tests and for processes
/// that host several token servers.
#[derive(Clone, Default, Debug)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, PersistedCredential>>>,
}

impl InMemoryCache {
    /// Constructs an empty in-memory cache
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentCache for InMemoryCache {
    async fn load(&self, key: &str) -> Result<Option<PersistedCredential>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn store(&self, key: &str, record: &PersistedCredential) -> Result<(), CacheError> {
        self.entries.lock().insert(key.to_owned(), record.clone());
        Ok(())
    }
}
