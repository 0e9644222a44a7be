use std::sync::Arc;

use arc_swap::ArcSwapOption;
use wxtoken_clock::UnixTime;

use crate::Credential;

/// Holds the current credential
///
/// Reads take a snapshot without blocking; a replacement is a single atomic
/// pointer swap, so readers see either the old or the new credential in full.
#[derive(Debug, Default)]
pub struct CredentialStore {
    current: ArcSwapOption<Credential>,
}

impl CredentialStore {
    /// Constructs an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a snapshot of the current credential
    pub fn current(&self) -> Option<Arc<Credential>> {
        self.current.load_full()
    }

    /// Whether a credential exists and is still accepted at `now`
    pub fn is_valid(&self, now: UnixTime) -> bool {
        self.current
            .load()
            .as_deref()
            .map_or(false, |c| c.is_valid_at(now))
    }

    /// Whether there is no credential, or the current one is due for renewal
    pub fn needs_refresh(&self, now: UnixTime) -> bool {
        self.current
            .load()
            .as_deref()
            .map_or(true, |c| c.needs_refresh_at(now))
    }

    /// Swaps in a new credential
    pub fn replace(&self, credential: Arc<Credential>) {
        self.current.store(Some(credential));
    }

    /// Swaps in `credential` only while the store is still empty
    ///
    /// Returns whether the credential was stored.
    pub(crate) fn seed(&self, credential: Arc<Credential>) -> bool {
        let previous = self
            .current
            .compare_and_swap(&None::<Arc<Credential>>, Some(credential));
        previous.is_none()
    }
}
