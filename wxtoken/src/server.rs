//! The token server: a coordinator, its background refresher and their lifecycle

use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use wxtoken_clock::{Clock, DurationSecs, System};

use crate::{
    backoff::ErrorBackoffConfig,
    cache::CacheBinding,
    coordinator::RefreshCoordinatorBuilder,
    issuer::CredentialIssuer,
    jitter::{JitterSource, NullJitter},
    refresher::{ProactiveRefresher, DEFAULT_REFRESH_INTERVAL},
    AccessToken, CredentialStatus, RefreshCoordinator, RefreshPolicy, RefreshStats, TokenError,
};

/// Default largest early shift of background renewals
pub const DEFAULT_MAX_JITTER: DurationSecs = DurationSecs(30);

/// Serves access tokens to the rest of an application
///
/// Construct one per application identity, share it with every consumer,
/// [`start`](Self::start) it once and [`stop`](Self::stop) it on shutdown.
#[derive(Debug)]
pub struct TokenServer<C = System> {
    coordinator: RefreshCoordinator<C>,
    proactive: bool,
    refresh_interval: Duration,
    max_jitter: DurationSecs,
    backoff: ErrorBackoffConfig,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Debug)]
enum Lifecycle {
    Idle,
    Running(CancellationToken),
    Stopped,
}

/// Builds a [`TokenServer`]
#[derive(Debug)]
#[must_use]
pub struct TokenServerBuilder<C = System> {
    coordinator: RefreshCoordinatorBuilder<C>,
    proactive: bool,
    refresh_interval: Duration,
    max_jitter: DurationSecs,
    backoff: ErrorBackoffConfig,
}

impl TokenServer {
    /// Starts building a token server around `issuer`
    pub fn builder(issuer: impl CredentialIssuer + 'static) -> TokenServerBuilder {
        TokenServerBuilder::new(RefreshCoordinator::builder(issuer))
    }
}

impl TokenServerBuilder {
    fn new(coordinator: RefreshCoordinatorBuilder) -> Self {
        Self {
            coordinator,
            proactive: true,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            max_jitter: DEFAULT_MAX_JITTER,
            backoff: ErrorBackoffConfig::default(),
        }
    }
}

impl<C> TokenServerBuilder<C> {
    /// Sets the renewal policy, which also supplies the clock
    pub fn policy<D>(self, policy: RefreshPolicy<D>) -> TokenServerBuilder<D> {
        TokenServerBuilder {
            coordinator: self.coordinator.policy(policy),
            proactive: self.proactive,
            refresh_interval: self.refresh_interval,
            max_jitter: self.max_jitter,
            backoff: self.backoff,
        }
    }

    /// Persists renewed tokens to `cache` and warm starts from it
    pub fn cache(mut self, cache: CacheBinding) -> Self {
        self.coordinator = self.coordinator.cache(cache);
        self
    }

    /// Bounds each issuer call
    pub fn issue_timeout(mut self, issue_timeout: Duration) -> Self {
        self.coordinator = self.coordinator.issue_timeout(issue_timeout);
        self
    }

    /// Whether serving a stale token also starts a background refresh
    pub fn reactive(mut self, reactive: bool) -> Self {
        self.coordinator = self.coordinator.reactive(reactive);
        self
    }

    /// Whether to renew in the background ahead of expiry
    pub fn proactive(mut self, proactive: bool) -> Self {
        self.proactive = proactive;
        self
    }

    /// Sets the longest sleep of the background refresher
    pub fn refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    /// Sets the largest early shift of background renewals
    pub fn max_jitter(mut self, max_jitter: DurationSecs) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Sets the backoff after failed background renewals
    ///
    /// Applies both to the refresher's retries and to the hold off of
    /// background refreshes started by stale reads.
    pub fn backoff(mut self, backoff: ErrorBackoffConfig) -> Self {
        self.coordinator = self.coordinator.reactive_backoff(backoff.clone());
        self.backoff = backoff;
        self
    }

    /// Builds the server; nothing runs until it is started
    pub fn build(self) -> TokenServer<C> {
        TokenServer {
            coordinator: self.coordinator.build(),
            proactive: self.proactive,
            refresh_interval: self.refresh_interval,
            max_jitter: self.max_jitter,
            backoff: self.backoff,
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }
}

#[cfg(feature = "wechat")]
impl TokenServer {
    /// Builds a server talking to the WeChat API as configured
    ///
    /// The configuration is validated first.
    pub fn from_config(config: &crate::config::TokenServerConfig) -> Result<Self, TokenError> {
        use std::sync::Arc;

        use crate::{
            cache::{cache_key, InMemoryCache},
            config::CacheKind,
            issuer::{dto::AppCredentials, Endpoint, WeChatIssuer},
        };

        config.validate()?;
        let token = &config.access_token;

        let client = reqwest::Client::builder()
            .timeout(token.issue_timeout())
            .build()
            .map_err(|e| TokenError::invalid_config(format!("unable to build HTTP client: {}", e)))?;

        let endpoint = if token.use_stable_api {
            Endpoint::Stable {
                force_refresh: false,
            }
        } else {
            Endpoint::Classic
        };

        let issuer = WeChatIssuer::new(
            client,
            config.wechat.api_domain,
            AppCredentials {
                app_id: config.wechat.app_id.clone(),
                app_secret: config.wechat.app_secret.clone(),
            },
        )
        .map_err(|e| TokenError::invalid_config(e.to_string()))?
        .with_endpoint(endpoint)
        .with_timeout(token.issue_timeout());

        let mut builder =
            TokenServerBuilder::new(RefreshCoordinatorBuilder::from_shared(Arc::new(issuer)))
                .policy(RefreshPolicy::new(token.refresh_buffer))
                .issue_timeout(token.issue_timeout())
                .reactive(token.enable_reactive)
                .proactive(token.enable_proactive)
                .refresh_interval(token.refresh_interval())
                .max_jitter(token.max_jitter);

        let key = cache_key(&config.wechat.app_id);
        let binding = match config.cache.kind {
            CacheKind::None => None,
            CacheKind::Memory => Some(CacheBinding::new(InMemoryCache::new(), key)),
            #[cfg(feature = "file")]
            CacheKind::File => Some(CacheBinding::new(
                crate::cache::FileCache::new(&config.cache.path),
                key,
            )),
            #[cfg(not(feature = "file"))]
            CacheKind::File => {
                return Err(TokenError::invalid_config(
                    "file cache requested but the `file` feature is disabled",
                ))
            }
        };
        if let Some(binding) = binding {
            builder = builder.cache(binding.with_safety_margin(config.cache.safety_margin));
        }

        Ok(builder.build())
    }
}

impl<C> TokenServer<C> {
    /// Gets the underlying coordinator
    pub fn coordinator(&self) -> &RefreshCoordinator<C> {
        &self.coordinator
    }

    /// Gets a snapshot of the refresh statistics
    pub fn stats(&self) -> RefreshStats {
        self.coordinator.stats()
    }

    /// Whether the server has been started and not yet stopped
    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }
}

impl<C: Clock + Send + Sync + 'static> TokenServer<C> {
    /// Starts the server
    ///
    /// Seeds the token from the persistent cache, if any, and launches the
    /// background refresher when enabled. Starting twice, or after stopping,
    /// does nothing.
    pub async fn start(&self) {
        let cancel = {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Idle => {}
                Lifecycle::Running(_) => {
                    tracing::warn!("token server already running");
                    return;
                }
                Lifecycle::Stopped => {
                    tracing::warn!("token server cannot be restarted once stopped");
                    return;
                }
            }
            let cancel = CancellationToken::new();
            *lifecycle = Lifecycle::Running(cancel.clone());
            cancel
        };

        self.coordinator.warm_start().await;

        if self.proactive {
            ProactiveRefresher::new(self.coordinator.clone(), jitter_source(self.max_jitter))
                .with_interval(self.refresh_interval)
                .with_backoff(self.backoff.clone())
                .spawn(cancel);
        }

        tracing::info!(proactive = self.proactive, "token server started");
    }

    /// Stops the server
    ///
    /// Stops the background refresher, releases every waiting caller with
    /// [`TokenError::Canceled`] and waits for refreshes already underway to
    /// finish.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        if let Lifecycle::Running(cancel) = previous {
            cancel.cancel();
        }

        self.coordinator.shutdown();
        self.coordinator
            .wait_idle()
            .instrument(tracing::debug_span!("draining"))
            .await;

        let stats = self.coordinator.stats();
        tracing::info!(
            refresh_count = stats.refresh_count,
            failure_count = stats.failure_count,
            last_refresh = stats.last_refresh_time.map(|t| t.0),
            "token server stopped"
        );
    }

    /// Gets a valid access token, waiting for a refresh if needed
    ///
    /// Gives up with [`TokenError::Canceled`] when `cancel` fires.
    pub async fn get_token(&self, cancel: &CancellationToken) -> Result<AccessToken, TokenError> {
        self.coordinator.get_valid(cancel).await
    }

    /// Gets a valid access token, waiting at most `timeout` for a refresh
    pub async fn get_token_within(&self, timeout: Duration) -> Result<AccessToken, TokenError> {
        let cancel = CancellationToken::new();
        tokio::time::timeout(timeout, self.coordinator.get_valid(&cancel))
            .await
            .unwrap_or(Err(TokenError::Canceled))
    }

    /// Renews the token now, regardless of its freshness
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<AccessToken, TokenError> {
        let credential = self.coordinator.refresh(cancel).await?;
        Ok(credential.access_token().to_owned())
    }

    /// Gets the status of the current token, if there is one
    pub fn status(&self) -> Option<CredentialStatus> {
        self.coordinator
            .store()
            .current()
            .map(|c| c.status_with_clock(self.coordinator.policy().clock()))
    }
}

#[cfg(feature = "rand")]
fn jitter_source(max_jitter: DurationSecs) -> Box<dyn JitterSource + Send> {
    if max_jitter.is_zero() {
        Box::new(NullJitter)
    } else {
        Box::new(crate::jitter::RandomEarlyJitter::new(max_jitter))
    }
}

#[cfg(not(feature = "rand"))]
fn jitter_source(_max_jitter: DurationSecs) -> Box<dyn JitterSource + Send> {
    Box::new(NullJitter)
}

#[cfg(test)]
mod tests {
    use wxtoken_clock::{ManualClock, UnixTime};

    use super::*;
    use crate::{
        cache::{cache_key, InMemoryCache, PersistedCredential, PersistentCache},
        issuer::testing::ScriptedIssuer,
        AppId,
    };

    const T: UnixTime = UnixTime(1_700_000_000);

    fn server(issuer: &ScriptedIssuer, proactive: bool) -> (TokenServer<ManualClock>, ManualClock) {
        let clock = ManualClock::new(T);
        let server = TokenServer::builder(issuer.clone())
            .policy(RefreshPolicy::new(DurationSecs(300)).with_clock(clock.clone()))
            .proactive(proactive)
            .max_jitter(DurationSecs::ZERO)
            .build();
        (server, clock)
    }

    #[tokio::test]
    async fn started_server_fetches_a_token_in_the_background() {
        let issuer = ScriptedIssuer::new();
        issuer.push_token("background", 7200);
        let (server, _) = server(&issuer, true);

        server.start().await;
        assert!(server.is_running());
        issuer.wait_for_calls(1).await;

        let token = server.get_token(&CancellationToken::new()).await.unwrap();
        assert_eq!(token.as_str(), "background");
        assert_eq!(issuer.calls(), 1);
        assert_eq!(server.status(), Some(CredentialStatus::Fresh));

        server.stop().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn without_proactive_refresh_tokens_are_fetched_on_demand() {
        let issuer = ScriptedIssuer::new();
        issuer.push_token("on-demand", 7200);
        let (server, _) = server(&issuer, false);

        server.start().await;
        tokio::task::yield_now().await;
        assert_eq!(issuer.calls(), 0);
        assert_eq!(server.status(), None);

        let token = server.get_token(&CancellationToken::new()).await.unwrap();
        assert_eq!(token.as_str(), "on-demand");

        server.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_waiting_callers() {
        let issuer = ScriptedIssuer::gated();
        issuer.push_token("too-late", 7200);
        let (server, _) = server(&issuer, false);
        let server = std::sync::Arc::new(server);
        server.start().await;

        let waiter = {
            let server = server.clone();
            tokio::spawn(async move { server.get_token(&CancellationToken::new()).await })
        };
        issuer.wait_for_calls(1).await;

        let stopping = {
            let server = server.clone();
            tokio::spawn(async move { server.stop().await })
        };

        assert!(matches!(waiter.await.unwrap(), Err(TokenError::Canceled)));

        issuer.release();
        stopping.await.unwrap();
        assert_eq!(server.stats().refresh_count, 1);

        // the stored token is still served, but nothing new is fetched
        assert_eq!(
            server.get_token(&CancellationToken::new()).await.unwrap().as_str(),
            "too-late"
        );
        assert!(matches!(
            server.refresh(&CancellationToken::new()).await,
            Err(TokenError::Canceled)
        ));
    }

    #[tokio::test]
    async fn lifecycle_is_one_way() {
        let issuer = ScriptedIssuer::new();
        let (server, _) = server(&issuer, false);

        server.stop().await;
        server.start().await;
        assert!(!server.is_running());
        server.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_gives_up_without_aborting_the_refresh() {
        let issuer = ScriptedIssuer::gated();
        issuer.push_token("eventually", 7200);
        let (server, _) = server(&issuer, false);

        let result = server.get_token_within(Duration::from_secs(2)).await;
        assert!(matches!(result, Err(TokenError::Canceled)));
        assert!(server.coordinator().is_refreshing());

        issuer.release();
        let token = server.get_token_within(Duration::from_secs(2)).await.unwrap();
        assert_eq!(token.as_str(), "eventually");
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test]
    async fn forced_refresh_replaces_a_fresh_token() {
        let issuer = ScriptedIssuer::new();
        issuer.push_token("one", 7200).push_token("two", 7200);
        let (server, _) = server(&issuer, false);
        let cancel = CancellationToken::new();

        assert_eq!(server.get_token(&cancel).await.unwrap().as_str(), "one");
        assert_eq!(server.refresh(&cancel).await.unwrap().as_str(), "two");
        assert_eq!(server.get_token(&cancel).await.unwrap().as_str(), "two");
    }

    #[tokio::test]
    async fn stats_preview_the_token_without_revealing_it() {
        let issuer = ScriptedIssuer::new();
        issuer.push_token("ACCESS_TOKEN_0123456789_SECRET_PART", 7200);
        let (server, clock) = server(&issuer, false);

        assert_eq!(server.stats(), RefreshStats::default());

        server.get_token(&CancellationToken::new()).await.unwrap();
        clock.advance(DurationSecs(7000));

        let stats = server.stats();
        assert_eq!(stats.refresh_count, 1);
        assert_eq!(stats.last_refresh_time, Some(T));
        let preview = stats.current_token_preview.unwrap();
        assert!(preview.starts_with("ACCESS_TOKE"));
        assert!(!preview.contains("SECRET_PART"));
        assert_eq!(server.status(), Some(CredentialStatus::Stale));
    }

    #[tokio::test]
    async fn start_warm_starts_from_the_cache() {
        let cache = InMemoryCache::new();
        let key = cache_key(&AppId::from_static("wx42"));
        cache
            .store(
                &key,
                &PersistedCredential {
                    access_token: AccessToken::from_static("from-cache"),
                    expires_at: T + DurationSecs(3600),
                },
            )
            .await
            .unwrap();

        let issuer = ScriptedIssuer::new();
        let server = TokenServer::builder(issuer.clone())
            .policy(RefreshPolicy::new(DurationSecs(300)).with_clock(ManualClock::new(T)))
            .cache(CacheBinding::new(cache, key))
            .max_jitter(DurationSecs::ZERO)
            .build();

        server.start().await;
        tokio::task::yield_now().await;

        let token = server.get_token(&CancellationToken::new()).await.unwrap();
        assert_eq!(token.as_str(), "from-cache");
        assert_eq!(issuer.calls(), 0);

        server.stop().await;
    }

    #[cfg(feature = "wechat")]
    #[tokio::test]
    async fn from_config_validates_first() {
        let config = crate::config::TokenServerConfig::default();
        assert!(matches!(
            TokenServer::from_config(&config),
            Err(TokenError::ConfigurationInvalid(_))
        ));
    }

    #[cfg(feature = "wechat")]
    #[tokio::test]
    async fn from_config_builds_an_idle_server() {
        let config = crate::config::TokenServerConfig::from_toml_str(
            r#"
            [wechat]
            app_id = "wx42"
            app_secret = "s3cr3t"

            [access_token]
            enable_proactive = false

            [cache]
            kind = "memory"
            "#,
        )
        .unwrap();

        let server = TokenServer::from_config(&config).unwrap();
        assert!(!server.is_running());
        assert_eq!(server.status(), None);
        assert_eq!(server.coordinator().policy().refresh_buffer(), DurationSecs(300));
    }

    async fn settle(server: &TokenServer<ManualClock>) {
        while server.coordinator().is_refreshing() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn backoff_also_holds_off_stale_read_refreshes() {
        let issuer = ScriptedIssuer::new();
        issuer
            .push_token("old", 7200)
            .push_error(crate::IssueError::Timeout(Duration::from_secs(10)))
            .push_token("new", 7200);
        let clock = ManualClock::new(T);
        let server = TokenServer::builder(issuer.clone())
            .policy(RefreshPolicy::new(DurationSecs(300)).with_clock(clock.clone()))
            .proactive(false)
            .backoff(ErrorBackoffConfig::new(
                Duration::from_secs(10),
                Duration::from_secs(60),
                2,
            ))
            .build();
        let cancel = CancellationToken::new();
        server.start().await;

        server.get_token(&cancel).await.unwrap();
        clock.advance(DurationSecs(7000));

        assert_eq!(server.get_token(&cancel).await.unwrap().as_str(), "old");
        settle(&server).await;
        assert_eq!(issuer.calls(), 2);

        clock.advance(DurationSecs(9));
        server.get_token(&cancel).await.unwrap();
        settle(&server).await;
        assert_eq!(issuer.calls(), 2);

        clock.advance(DurationSecs(1));
        server.get_token(&cancel).await.unwrap();
        settle(&server).await;
        assert_eq!(issuer.calls(), 3);
        assert_eq!(server.get_token(&cancel).await.unwrap().as_str(), "new");

        server.stop().await;
    }
}
