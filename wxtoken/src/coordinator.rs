//! Single-flight renewal of the access token
//!
//! Any number of tasks may ask the [`RefreshCoordinator`] for a token at the
//! same time. While the cached credential is valid, each gets it straight from
//! the [`CredentialStore`]. Once it is not, the first task to notice starts a
//! refresh and every later task joins that same refresh instead of starting
//! its own. All tasks that joined a refresh see its single outcome.
//!
//! The issuer call itself runs as a tracked background task. A waiting task
//! that gives up (its cancellation token fires) only stops waiting; the call
//! it may have started carries on for the benefit of everyone else, bounded
//! by the coordinator's issue timeout.

use std::{error, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::{
    sync::{CancellationToken, WaitForCancellationFuture},
    task::TaskTracker,
};
use wxtoken_clock::{Clock, DurationSecs, System, UnixTime};

use crate::{
    backoff::{ErrorBackoffConfig, ErrorBackoffHandler},
    cache::CacheBinding,
    issuer::{CredentialIssuer, IssueError},
    stats::StatsCollector,
    AccessToken, Credential, CredentialStore, RefreshPolicy, RefreshStats, TokenError,
};

/// Default upper bound on a single issuer call
pub const DEFAULT_ISSUE_TIMEOUT: Duration = Duration::from_secs(10);

type Outcome = Result<Arc<Credential>, TokenError>;

/// The receiving side of one refresh; `None` until the refresh completes
type Flight = watch::Receiver<Option<Outcome>>;

/// Coordinates access to, and renewal of, a single access token
///
/// Cloning is cheap; clones share the same store and in-flight refresh.
#[derive(Debug)]
pub struct RefreshCoordinator<C = System> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for RefreshCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C> {
    store: CredentialStore,
    issuer: Arc<dyn CredentialIssuer>,
    policy: RefreshPolicy<C>,
    stats: StatsCollector,
    cache: Option<CacheBinding>,
    in_flight: Mutex<Option<Flight>>,
    issue_timeout: Duration,
    reactive: bool,
    reactive_gate: Mutex<ReactiveGate>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl<C: std::fmt::Debug> std::fmt::Debug for Inner<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("store", &self.store)
            .field("policy", &self.policy)
            .field("cache", &self.cache)
            .field("refreshing", &self.in_flight.lock().is_some())
            .field("issue_timeout", &self.issue_timeout)
            .field("reactive", &self.reactive)
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Builds a [`RefreshCoordinator`]
#[must_use]
pub struct RefreshCoordinatorBuilder<C = System> {
    issuer: Arc<dyn CredentialIssuer>,
    policy: RefreshPolicy<C>,
    cache: Option<CacheBinding>,
    issue_timeout: Duration,
    reactive: bool,
    reactive_backoff: ErrorBackoffConfig,
}

impl<C: std::fmt::Debug> std::fmt::Debug for RefreshCoordinatorBuilder<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinatorBuilder")
            .field("policy", &self.policy)
            .field("cache", &self.cache)
            .field("issue_timeout", &self.issue_timeout)
            .field("reactive", &self.reactive)
            .field("reactive_backoff", &self.reactive_backoff)
            .finish_non_exhaustive()
    }
}

impl RefreshCoordinator {
    /// Starts building a coordinator around `issuer`
    pub fn builder(issuer: impl CredentialIssuer + 'static) -> RefreshCoordinatorBuilder {
        RefreshCoordinatorBuilder::from_shared(Arc::new(issuer))
    }
}

impl RefreshCoordinatorBuilder {
    /// Starts building a coordinator around a shared issuer
    pub fn from_shared(issuer: Arc<dyn CredentialIssuer>) -> Self {
        Self {
            issuer,
            policy: RefreshPolicy::default(),
            cache: None,
            issue_timeout: DEFAULT_ISSUE_TIMEOUT,
            reactive: true,
            reactive_backoff: ErrorBackoffConfig::default(),
        }
    }
}

impl<C> RefreshCoordinatorBuilder<C> {
    /// Sets the renewal policy, which also supplies the clock
    pub fn policy<D>(self, policy: RefreshPolicy<D>) -> RefreshCoordinatorBuilder<D> {
        RefreshCoordinatorBuilder {
            issuer: self.issuer,
            policy,
            cache: self.cache,
            issue_timeout: self.issue_timeout,
            reactive: self.reactive,
            reactive_backoff: self.reactive_backoff,
        }
    }

    /// Persists every renewed token to `cache`
    pub fn cache(mut self, cache: CacheBinding) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Bounds each issuer call, independently of any caller's cancellation
    pub fn issue_timeout(mut self, issue_timeout: Duration) -> Self {
        self.issue_timeout = issue_timeout;
        self
    }

    /// Whether serving a stale token also starts a background refresh
    pub fn reactive(mut self, reactive: bool) -> Self {
        self.reactive = reactive;
        self
    }

    /// Sets how long background refreshes on stale reads are held off after
    /// failed renewals
    pub fn reactive_backoff(mut self, backoff: ErrorBackoffConfig) -> Self {
        self.reactive_backoff = backoff;
        self
    }

    /// Builds the coordinator with an empty store
    pub fn build(self) -> RefreshCoordinator<C> {
        RefreshCoordinator {
            inner: Arc::new(Inner {
                store: CredentialStore::new(),
                issuer: self.issuer,
                policy: self.policy,
                stats: StatsCollector::new(),
                cache: self.cache,
                in_flight: Mutex::new(None),
                issue_timeout: self.issue_timeout,
                reactive: self.reactive,
                reactive_gate: Mutex::new(ReactiveGate::new(self.reactive_backoff)),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }
}

impl<C> RefreshCoordinator<C> {
    /// Gets the credential store
    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    /// Gets the renewal policy
    pub fn policy(&self) -> &RefreshPolicy<C> {
        &self.inner.policy
    }

    /// Gets a snapshot of the refresh statistics
    pub fn stats(&self) -> RefreshStats {
        let mut stats = self.inner.stats.snapshot();
        stats.current_token_preview = self
            .inner
            .store
            .current()
            .map(|c| c.access_token().preview());
        stats
    }

    /// Whether a refresh is currently underway
    pub fn is_refreshing(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }

    /// Releases every waiting caller with [`TokenError::Canceled`]
    ///
    /// Refreshes already underway run to completion; use
    /// [`wait_idle`](Self::wait_idle) to wait for them. No new refresh is
    /// started afterwards.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Waits until background work started by the coordinator has finished
    ///
    /// Only returns once [`shutdown`](Self::shutdown) has been called.
    pub async fn wait_idle(&self) {
        self.inner.tasks.wait().await;
    }

    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.inner.tasks
    }

    pub(crate) fn shutdown_signal(&self) -> WaitForCancellationFuture<'_> {
        self.inner.shutdown.cancelled()
    }
}

impl<C: Clock + Send + Sync + 'static> RefreshCoordinator<C> {
    /// Gets a valid access token
    ///
    /// Returns the cached token without waiting whenever it has not expired.
    /// Otherwise starts or joins a refresh and waits for its outcome, giving
    /// up with [`TokenError::Canceled`] when `cancel` fires.
    pub async fn get_valid(&self, cancel: &CancellationToken) -> Result<AccessToken, TokenError> {
        let now = self.inner.policy.now();

        if let Some(current) = self.inner.store.current() {
            if current.is_valid_at(now) {
                if self.inner.reactive && current.needs_refresh_at(now) {
                    self.refresh_in_background(now);
                }
                return Ok(current.access_token().to_owned());
            }
        }

        let pending = self.join_or_start(|current, now| current.is_valid_at(now))?;
        let credential = self.settle(pending, cancel).await?;
        Ok(credential.access_token().to_owned())
    }

    /// Renews the token if it is missing or due for renewal
    ///
    /// A credential that is still fresh is returned as is, otherwise this
    /// joins or starts a refresh.
    pub async fn refresh_stale(&self, cancel: &CancellationToken) -> Outcome {
        let now = self.inner.policy.now();

        if let Some(current) = self.inner.store.current() {
            if !current.needs_refresh_at(now) {
                return Ok(current);
            }
        }

        let pending = self.join_or_start(|current, now| !current.needs_refresh_at(now))?;
        self.settle(pending, cancel).await
    }

    /// Renews the token unless `seen` has already been replaced
    ///
    /// Used to renew ahead of the credential's own refresh time. If anyone
    /// else renewed the token in the meantime, the newer credential is
    /// returned without calling the issuer.
    pub async fn refresh_replacing(
        &self,
        seen: &Arc<Credential>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let pending = self.join_or_start(|current, _| !Arc::ptr_eq(current, seen))?;
        self.settle(pending, cancel).await
    }

    /// Renews the token regardless of its freshness
    ///
    /// Joins the refresh underway, if any, instead of starting another.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Outcome {
        let pending = self.join_or_start(|_, _| false)?;
        self.settle(pending, cancel).await
    }

    /// Seeds an empty store from the persistent cache
    ///
    /// Returns whether a cached token was adopted.
    pub async fn warm_start(&self) -> bool {
        let Some(cache) = &self.inner.cache else {
            return false;
        };

        let Some(record) = cache.load().await else {
            tracing::debug!(cache.key = cache.key(), "no cached token to warm start from");
            return false;
        };

        let Some(credential) = self
            .inner
            .policy
            .restore_credential(record.access_token, record.expires_at)
        else {
            tracing::debug!(
                cache.key = cache.key(),
                expiry = record.expires_at.0,
                "cached token already expired"
            );
            return false;
        };

        let refresh_at = credential.refresh_at();
        let adopted = self.inner.store.seed(Arc::new(credential));
        if adopted {
            tracing::info!(
                cache.key = cache.key(),
                expiry = record.expires_at.0,
                refresh_at = refresh_at.0,
                "warm started from cached token"
            );
        }
        adopted
    }

    fn refresh_in_background(&self, now: UnixTime) {
        let not_before = self.inner.reactive_gate.lock().not_before;
        if now < not_before {
            tracing::trace!(
                retry_at = not_before.0,
                "renewal failed recently, not refreshing in the background"
            );
            return;
        }

        match self.join_or_start(|current, now| !current.needs_refresh_at(now)) {
            Ok(Pending::Flight(_)) => {
                tracing::debug!("serving stale token while refreshing in the background")
            }
            Ok(Pending::Settled(_)) => {}
            Err(error) => {
                tracing::trace!(error = (&error as &dyn error::Error), "no background refresh")
            }
        }
    }

    /// Joins the refresh underway, or starts one
    ///
    /// The store is checked again under the slot lock, so a refresh that
    /// completed after the caller last looked is not repeated: when `settled`
    /// accepts the stored credential, that credential is returned instead.
    fn join_or_start(
        &self,
        settled: impl FnOnce(&Arc<Credential>, UnixTime) -> bool,
    ) -> Result<Pending, TokenError> {
        let mut slot = self.inner.in_flight.lock();

        if let Some(flight) = slot.as_ref() {
            tracing::trace!("joining refresh already underway");
            return Ok(Pending::Flight(flight.clone()));
        }

        if let Some(current) = self.inner.store.current() {
            if settled(&current, self.inner.policy.now()) {
                tracing::trace!("token renewed meanwhile");
                return Ok(Pending::Settled(current));
            }
        }

        if self.inner.shutdown.is_cancelled() {
            return Err(TokenError::Canceled);
        }

        let (tx, rx) = watch::channel(None);
        *slot = Some(rx.clone());
        drop(slot);

        let this = self.clone();
        self.inner.tasks.spawn(async move { this.lead(tx).await });

        Ok(Pending::Flight(rx))
    }

    async fn lead(self, tx: watch::Sender<Option<Outcome>>) {
        let outcome = {
            let _in_flight = InFlightGuard(&self.inner.in_flight);
            self.issue_and_store().await
        };

        let credential = outcome.as_ref().ok().cloned();
        tx.send_replace(Some(outcome));

        if let (Some(cache), Some(credential)) = (&self.inner.cache, credential) {
            cache.persist(&credential, self.inner.policy.now()).await;
        }
    }

    async fn issue_and_store(&self) -> Outcome {
        tracing::debug!("requesting new access token");

        let issued = match tokio::time::timeout(self.inner.issue_timeout, self.inner.issuer.issue())
            .await
        {
            Ok(issued) => issued,
            Err(_) => Err(IssueError::Timeout(self.inner.issue_timeout)),
        };

        match issued {
            Ok(issued) => {
                let credential = Arc::new(
                    self.inner
                        .policy
                        .create_credential(issued.access_token, issued.ttl),
                );
                self.inner.store.replace(Arc::clone(&credential));
                self.inner.stats.record_success(credential.issued());
                self.inner.reactive_gate.lock().reopen();

                tracing::info!(
                    lifetime = credential.lifetime().0,
                    refresh_at = credential.refresh_at().0,
                    expiry = credential.expires_at().0,
                    "access token renewed"
                );
                Ok(credential)
            }
            Err(error) => {
                let now = self.inner.policy.now();
                self.inner.stats.record_failure(now);
                let reactive_retry_at = self.inner.reactive_gate.lock().hold_off(now);

                let error = TokenError::from(error);
                let serving_stale = self.inner.store.is_valid(now);
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    serving_stale,
                    reactive_retry_at = reactive_retry_at.0,
                    "error renewing access token"
                );
                Err(error)
            }
        }
    }

    async fn settle(&self, pending: Pending, cancel: &CancellationToken) -> Outcome {
        match pending {
            Pending::Settled(credential) => Ok(credential),
            Pending::Flight(flight) => self.wait_for(flight, cancel).await,
        }
    }

    /// Waits for the outcome of a refresh
    ///
    /// Every caller that joined the refresh gets its outcome, errors
    /// included; a follower woken by a failure does not start another
    /// refresh itself. Failures are not remembered, so the next call after
    /// the refresh ended starts a new one.
    async fn wait_for(&self, mut flight: Flight, cancel: &CancellationToken) -> Outcome {
        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TokenError::Canceled),
            _ = self.inner.shutdown.cancelled() => return Err(TokenError::Canceled),
            finished = flight.wait_for(Option::is_some) => finished.map(|outcome| outcome.clone()),
        };

        match finished {
            Ok(Some(outcome)) => outcome,
            // the refresh task ended without publishing, which only happens if it panicked
            Ok(None) | Err(_) => Err(TokenError::Canceled),
        }
    }
}

/// Either a credential that needs no refresh, or the refresh to wait on
enum Pending {
    Settled(Arc<Credential>),
    Flight(Flight),
}

/// Clears the in-flight slot when the refresh ends, however it ends
struct InFlightGuard<'a>(&'a Mutex<Option<Flight>>);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

/// Holds off reactive refreshes after failed renewals
#[derive(Debug)]
struct ReactiveGate {
    backoff: ErrorBackoffHandler,
    not_before: UnixTime,
}

impl ReactiveGate {
    fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            backoff: ErrorBackoffHandler::new(config),
            not_before: UnixTime(0),
        }
    }

    fn reopen(&mut self) {
        self.backoff.success();
        self.not_before = UnixTime(0);
    }

    fn hold_off(&mut self, now: UnixTime) -> UnixTime {
        let delay = DurationSecs::from(self.backoff.error()).max(DurationSecs(1));
        self.not_before = now + delay;
        self.not_before
    }
}
