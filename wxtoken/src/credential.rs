use serde::{Deserialize, Serialize};
use wxtoken_clock::{Clock, DurationSecs, System, UnixTime};

use crate::{AccessToken, AccessTokenRef, TokenError};

/// An access token together with the times that govern its renewal
///
/// A credential is never modified after construction. Renewal replaces it
/// with a new credential.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    access_token: AccessToken,
    lifetime: DurationSecs,
    issued: UnixTime,
    refresh_at: UnixTime,
    expires_at: UnixTime,
}

/// Where a credential is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialStatus {
    /// The credential is valid and not yet due for renewal
    Fresh,
    /// The credential is valid, but should be renewed
    Stale,
    /// The credential is no longer accepted by the issuer
    Expired,
}

impl Credential {
    /// # Panics
    ///
    /// When `refresh_at` falls after the expiry; callers compute it from the
    /// lifetime, so this is a programming error.
    pub(crate) fn new(
        access_token: AccessToken,
        issued: UnixTime,
        lifetime: DurationSecs,
        refresh_at: UnixTime,
    ) -> Self {
        let expires_at = issued + lifetime;
        assert!(
            refresh_at <= expires_at,
            "refresh time {} must not be after expiry {}",
            refresh_at,
            expires_at
        );

        Self {
            access_token,
            lifetime,
            issued,
            refresh_at,
            expires_at,
        }
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the lifetime reported by the issuer
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.lifetime
    }

    /// Gets the time that the credential was issued
    #[inline]
    pub fn issued(&self) -> UnixTime {
        self.issued
    }

    /// Gets the time from which the credential should be renewed
    #[inline]
    pub fn refresh_at(&self) -> UnixTime {
        self.refresh_at
    }

    /// Gets the time that the credential expires
    #[inline]
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// Whether the credential is still accepted at `time`
    #[inline]
    pub fn is_valid_at(&self, time: UnixTime) -> bool {
        time < self.expires_at
    }

    /// Whether the credential is due for renewal at `time`
    #[inline]
    pub fn needs_refresh_at(&self, time: UnixTime) -> bool {
        time >= self.refresh_at
    }

    /// Gets the credential's lifecycle status as of `time`
    #[inline]
    pub fn status_at(&self, time: UnixTime) -> CredentialStatus {
        if time < self.refresh_at {
            CredentialStatus::Fresh
        } else if time < self.expires_at {
            CredentialStatus::Stale
        } else {
            CredentialStatus::Expired
        }
    }

    /// Gets the credential's lifecycle status according to `clock`
    #[inline]
    pub fn status_with_clock<C: Clock>(&self, clock: &C) -> CredentialStatus {
        self.status_at(clock.now())
    }

    /// Gets how much longer the credential stays fresh as of `time`
    #[inline]
    pub fn until_refresh_at(&self, time: UnixTime) -> DurationSecs {
        self.refresh_at - time
    }

    /// Gets how much longer the credential stays valid as of `time`
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        self.expires_at - time
    }
}

/// Decides when credentials should be renewed
///
/// A credential issued at `T` with lifetime `ttl` expires at `T + ttl` and is
/// due for renewal `refresh_buffer` before that.
#[derive(Clone, Debug)]
pub struct RefreshPolicy<C = System> {
    refresh_buffer: DurationSecs,
    clock: C,
}

/// Five minutes before expiry
pub const DEFAULT_REFRESH_BUFFER: DurationSecs = DurationSecs(300);

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_BUFFER)
    }
}

impl RefreshPolicy {
    /// Constructs a policy using the system clock
    pub fn new(refresh_buffer: DurationSecs) -> Self {
        Self {
            refresh_buffer,
            clock: System,
        }
    }
}

impl<C> RefreshPolicy<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> RefreshPolicy<D> {
        RefreshPolicy {
            refresh_buffer: self.refresh_buffer,
            clock,
        }
    }

    /// Gets the renewal buffer
    pub fn refresh_buffer(&self) -> DurationSecs {
        self.refresh_buffer
    }

    /// Gets the clock
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Checks that credentials living for `ttl` get a renewal window
    pub fn validate_lifetime(&self, ttl: DurationSecs) -> Result<(), TokenError> {
        if self.refresh_buffer >= ttl {
            Err(TokenError::invalid_config(format!(
                "refresh buffer {} must be shorter than the token lifetime {}",
                self.refresh_buffer, ttl
            )))
        } else {
            Ok(())
        }
    }

    fn refresh_time(&self, issued: UnixTime, lifetime: DurationSecs) -> UnixTime {
        if self.refresh_buffer < lifetime {
            issued + lifetime - self.refresh_buffer
        } else {
            let fallback = issued + lifetime / 2;
            tracing::warn!(
                lifetime = lifetime.0,
                refresh_buffer = self.refresh_buffer.0,
                refresh_at = fallback.0,
                "issued lifetime is not longer than the refresh buffer, renewing at half-life"
            );
            fallback
        }
    }
}

impl<C: Clock> RefreshPolicy<C> {
    /// Gets the current time according to the policy's clock
    #[inline]
    pub fn now(&self) -> UnixTime {
        self.clock.now()
    }

    /// Builds a credential for a token issued now
    pub fn create_credential(&self, access_token: AccessToken, lifetime: DurationSecs) -> Credential {
        let issued = self.clock.now();
        Credential::new(
            access_token,
            issued,
            lifetime,
            self.refresh_time(issued, lifetime),
        )
    }

    /// Rebuilds a credential from a persisted token and its expiry
    ///
    /// Returns `None` if the token has already expired. The credential is
    /// treated as issued now, and is due for renewal immediately if the
    /// expiry is within the refresh buffer.
    pub fn restore_credential(
        &self,
        access_token: AccessToken,
        expires_at: UnixTime,
    ) -> Option<Credential> {
        let now = self.clock.now();
        if expires_at <= now {
            return None;
        }

        let lifetime = expires_at - now;
        let refresh_at = (expires_at - self.refresh_buffer).max(now);
        Some(Credential::new(access_token, now, lifetime, refresh_at))
    }
}
