//! Background renewal ahead of expiry

use std::{error, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use wxtoken_clock::{Clock, DurationSecs, UnixTime};

use crate::{
    backoff::{ErrorBackoffConfig, ErrorBackoffHandler, WithBackoff},
    jitter::JitterSource,
    RefreshCoordinator, TokenError,
};

/// Default longest sleep between two checks of the current token
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Earliest a successfully renewed token is checked again
const MIN_RECHECK: DurationSecs = DurationSecs(1);

/// Renews the access token in the background before it goes stale
///
/// The refresher sleeps until the current token's (jittered) renewal time and
/// then has the coordinator renew that token, so that callers never have to
/// wait on the issuer. A token someone else renewed meanwhile is adopted
/// instead. It never sleeps longer than its interval, which bounds the
/// lag after a suspended host wakes up, and picks up tokens renewed by anyone
/// else along the way. Failed renewals are retried with backoff.
#[derive(Debug)]
pub struct ProactiveRefresher<C, J> {
    coordinator: RefreshCoordinator<C>,
    jitter: J,
    backoff: ErrorBackoffConfig,
    interval: Duration,
}

enum Delay {
    UntilTime(UnixTime),
    ForDuration(Duration),
}

impl<C, J> ProactiveRefresher<C, J>
where
    C: Clock + Send + Sync + 'static,
    J: JitterSource + Send + 'static,
{
    /// Constructs a refresher for the coordinator's token
    pub fn new(coordinator: RefreshCoordinator<C>, jitter: J) -> Self {
        Self {
            coordinator,
            jitter,
            backoff: ErrorBackoffConfig::default(),
            interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    /// Sets the longest sleep between checks
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the backoff after failed renewals
    ///
    /// Delays are further capped at the refresh interval.
    pub fn with_backoff(mut self, backoff: ErrorBackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs the refresher as a task tracked by the coordinator
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let tasks = self.coordinator.tasks().clone();
        tasks.spawn(self.run(cancel).in_current_span())
    }

    /// Runs the refresher until `cancel` fires or the coordinator shuts down
    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            coordinator,
            mut jitter,
            backoff,
            interval,
        } = self;

        let clock = coordinator.policy().clock();
        let mut backoff_handler = ErrorBackoffHandler::new(backoff.capped_at(interval));

        // the credential the next wake-up was scheduled from
        let mut scheduled_from = coordinator.store().current();
        let mut next_check = match &scheduled_from {
            Some(credential) => Delay::UntilTime(jitter.jitter(credential.refresh_at())),
            None => Delay::UntilTime(clock.now()),
        };

        tracing::info!(
            interval_secs = interval.as_secs(),
            "starting proactive refresh"
        );

        loop {
            if !sleep(&coordinator, interval, next_check, &cancel).await {
                break;
            }

            let outcome = match &scheduled_from {
                Some(seen) => coordinator.refresh_replacing(seen, &cancel).await,
                None => coordinator.refresh_stale(&cancel).await,
            };

            next_check = match outcome.with_backoff(&mut backoff_handler) {
                Ok(credential) => {
                    let earliest = clock.now() + MIN_RECHECK;
                    let refresh_at = jitter.jitter(credential.refresh_at()).max(earliest);
                    tracing::debug!(
                        refresh_at = refresh_at.0,
                        delay = (refresh_at - clock.now()).0,
                        "waiting for token to become stale"
                    );
                    scheduled_from = Some(credential);
                    Delay::UntilTime(refresh_at)
                }
                Err((TokenError::Canceled, _)) => break,
                Err((error, delay)) => {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        delay_ms = delay.as_millis() as u64,
                        "error renewing token in the background, will retry"
                    );
                    Delay::ForDuration(delay)
                }
            };
        }

        tracing::info!("stopping proactive refresh");
    }
}

/// Sleeps according to `delay`; returns `false` if stopped meanwhile
async fn sleep<C: Clock>(
    coordinator: &RefreshCoordinator<C>,
    interval: Duration,
    delay: Delay,
    cancel: &CancellationToken,
) -> bool {
    match delay {
        Delay::ForDuration(d) => nap(coordinator, d, cancel).await,
        Delay::UntilTime(t) => {
            // Timers do not advance while the host is suspended, so wake at
            // least every interval and compare against the clock.
            let clock = coordinator.policy().clock();
            loop {
                let now = clock.now();
                if now >= t {
                    tracing::trace!("token now stale");
                    return true;
                }

                let until_stale: Duration = (t - now).into();
                let delay = until_stale.min(interval);
                tracing::trace!(
                    delay = delay.as_secs(),
                    until_stale = until_stale.as_secs(),
                    "token not yet stale, sleeping"
                );
                if !nap(coordinator, delay, cancel).await {
                    return false;
                }
            }
        }
    }
}

async fn nap<C>(
    coordinator: &RefreshCoordinator<C>,
    duration: Duration,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = coordinator.shutdown_signal() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::{issuer::testing::ScriptedIssuer, jitter::NullJitter, IssueError, RefreshPolicy};

    const T: UnixTime = UnixTime(1_700_000_000);

    /// Follows the tokio clock, so paused time drives token lifetimes too
    #[derive(Debug)]
    struct TokioClock(tokio::time::Instant);

    impl Clock for TokioClock {
        fn now(&self) -> UnixTime {
            T + DurationSecs(self.0.elapsed().as_secs())
        }
    }

    fn coordinator(issuer: &ScriptedIssuer) -> RefreshCoordinator<TokioClock> {
        RefreshCoordinator::builder(issuer.clone())
            .policy(
                RefreshPolicy::new(DurationSecs(300))
                    .with_clock(TokioClock(tokio::time::Instant::now())),
            )
            .reactive(false)
            .build()
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn renews_ahead_of_expiry_without_blocking_callers() {
        let issuer = ScriptedIssuer::new();
        issuer.push_token("first", 7200).push_token("second", 7200);
        let coordinator = coordinator(&issuer);
        let cancel = CancellationToken::new();

        ProactiveRefresher::new(coordinator.clone(), NullJitter).spawn(cancel.clone());

        tokio::time::sleep(secs(1)).await;
        assert_eq!(issuer.calls(), 1);
        assert_eq!(
            coordinator.get_valid(&cancel).await.unwrap().as_str(),
            "first"
        );

        tokio::time::sleep(secs(6898)).await;
        assert_eq!(issuer.calls(), 1);

        tokio::time::sleep(secs(2)).await;
        assert_eq!(issuer.calls(), 2);
        assert_eq!(
            coordinator.get_valid(&cancel).await.unwrap().as_str(),
            "second"
        );
        assert_eq!(issuer.calls(), 2);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn picks_up_an_existing_token() {
        let issuer = ScriptedIssuer::new();
        issuer.push_token("existing", 7200).push_token("renewed", 7200);
        let coordinator = coordinator(&issuer);
        let cancel = CancellationToken::new();

        coordinator.get_valid(&cancel).await.unwrap();
        ProactiveRefresher::new(coordinator.clone(), NullJitter).spawn(cancel.clone());

        tokio::time::sleep(secs(3600)).await;
        assert_eq!(issuer.calls(), 1);

        tokio::time::sleep(secs(3301)).await;
        assert_eq!(issuer.calls(), 2);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_renewals_are_retried_with_backoff() {
        let issuer = ScriptedIssuer::new();
        issuer
            .push_token("first", 7200)
            .push_error(IssueError::Timeout(secs(10)))
            .push_error(IssueError::Timeout(secs(10)))
            .push_token("second", 7200);
        let coordinator = coordinator(&issuer);
        let cancel = CancellationToken::new();

        ProactiveRefresher::new(coordinator.clone(), NullJitter).spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(6_900_500)).await;
        assert_eq!(issuer.calls(), 2);

        // first retry after a second
        tokio::time::sleep(secs(1)).await;
        assert_eq!(issuer.calls(), 3);

        // then after two
        tokio::time::sleep(secs(1)).await;
        assert_eq!(issuer.calls(), 3);
        tokio::time::sleep(secs(1)).await;
        assert_eq!(issuer.calls(), 4);

        let stats = coordinator.stats();
        assert_eq!(stats.refresh_count, 2);
        assert_eq!(stats.failure_count, 2);
        assert_eq!(
            coordinator.get_valid(&cancel).await.unwrap().as_str(),
            "second"
        );

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn stops_when_canceled() {
        let issuer = ScriptedIssuer::new();
        issuer.push_token("only", 7200);
        let coordinator = coordinator(&issuer);
        let cancel = CancellationToken::new();

        let handle = ProactiveRefresher::new(coordinator.clone(), NullJitter).spawn(cancel.clone());
        tokio::time::sleep(secs(1)).await;

        cancel.cancel();
        handle.await.unwrap();
        assert!(logs_contain("stopping proactive refresh"));

        tokio::time::sleep(secs(8000)).await;
        assert_eq!(issuer.calls(), 1);
    }

    /// Renews a fixed time ahead of schedule
    #[derive(Debug)]
    struct EarlyBy(DurationSecs);

    impl JitterSource for EarlyBy {
        fn jitter(&mut self, refresh_at: UnixTime) -> UnixTime {
            refresh_at - self.0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_starts_early_by_the_jitter() {
        let issuer = ScriptedIssuer::new();
        issuer.push_token("first", 7200).push_token("second", 7200);
        let coordinator = coordinator(&issuer);
        let cancel = CancellationToken::new();

        ProactiveRefresher::new(coordinator.clone(), EarlyBy(DurationSecs(100)))
            .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(6_799_500)).await;
        assert_eq!(issuer.calls(), 1);

        // renewed at 6800s although the token is not stale before 6900s
        tokio::time::sleep(secs(1)).await;
        assert_eq!(issuer.calls(), 2);
        assert_eq!(
            coordinator.get_valid(&cancel).await.unwrap().as_str(),
            "second"
        );
        assert_eq!(issuer.calls(), 2);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn early_renewal_adopts_a_token_renewed_meanwhile() {
        let issuer = ScriptedIssuer::new();
        issuer.push_token("first", 7200).push_token("second", 7200);
        let coordinator = coordinator(&issuer);
        let cancel = CancellationToken::new();

        ProactiveRefresher::new(coordinator.clone(), EarlyBy(DurationSecs(100)))
            .spawn(cancel.clone());

        tokio::time::sleep(secs(6750)).await;
        let renewed = coordinator.refresh(&cancel).await.unwrap();
        assert_eq!(renewed.access_token().as_str(), "second");
        assert_eq!(issuer.calls(), 2);

        tokio::time::sleep(secs(100)).await;
        assert_eq!(issuer.calls(), 2);
        assert_eq!(
            coordinator.get_valid(&cancel).await.unwrap().as_str(),
            "second"
        );

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_the_coordinator_shuts_down() {
        let issuer = ScriptedIssuer::new();
        issuer.push_token("only", 7200);
        let coordinator = coordinator(&issuer);

        let handle =
            ProactiveRefresher::new(coordinator.clone(), NullJitter).spawn(CancellationToken::new());
        tokio::time::sleep(secs(1)).await;

        coordinator.shutdown();
        handle.await.unwrap();
        coordinator.wait_idle().await;
    }
}
