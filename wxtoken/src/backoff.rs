//! Error backoff for background refresh attempts

use std::time::Duration;

/// How long to wait between failed refresh attempts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorBackoffConfig {
    initial_error_delay: Duration,
    max_error_delay: Duration,
    multiplier: u32,
}

impl Default for ErrorBackoffConfig {
    /// Default backoff configuration
    ///
    /// Waits one second after the first failure, doubling on each further
    /// failure up to one minute.
    fn default() -> Self {
        Self {
            initial_error_delay: Duration::from_secs(1),
            max_error_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// The first failure waits `initial_error_delay`; each further consecutive
    /// failure multiplies the previous delay by `multiplier`, never exceeding
    /// `max_error_delay`.
    pub fn new(initial_error_delay: Duration, max_error_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_error_delay,
            max_error_delay,
            multiplier,
        }
    }

    /// Caps the maximum delay, keeping the rest of the configuration
    pub fn capped_at(mut self, cap: Duration) -> Self {
        self.max_error_delay = self.max_error_delay.min(cap);
        self.initial_error_delay = self.initial_error_delay.min(self.max_error_delay);
        self
    }
}

/// Utility trait for extending types with a backoff handler
pub trait WithBackoff {
    /// The output of providing backoff
    type Output;

    /// Feeds the outcome into the handler, attaching the next delay to errors
    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output;
}

impl<T, E> WithBackoff for Result<T, E> {
    type Output = Result<T, (E, Duration)>;

    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output {
        match self {
            Ok(ok) => {
                handler.success();
                Ok(ok)
            }
            Err(err) => Err((err, handler.error())),
        }
    }
}

/// Tracks consecutive failures
#[derive(Debug)]
pub struct ErrorBackoffHandler {
    config: ErrorBackoffConfig,
    last_delay: Option<Duration>,
}

impl ErrorBackoffHandler {
    /// Constructs a new handler from an [`ErrorBackoffConfig`]
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            config,
            last_delay: None,
        }
    }

    /// Reports a success, resetting the delay
    pub fn success(&mut self) {
        self.last_delay = None;
    }

    /// Reports a failure and returns how long to wait before the next attempt
    pub fn error(&mut self) -> Duration {
        let next = match self.last_delay {
            Some(last) => last
                .checked_mul(self.config.multiplier)
                .unwrap_or(self.config.max_error_delay)
                .min(self.config.max_error_delay),
            None => self.config.initial_error_delay,
        };
        self.last_delay = Some(next);
        next
    }
}

impl From<ErrorBackoffConfig> for ErrorBackoffHandler {
    fn from(config: ErrorBackoffConfig) -> Self {
        Self::new(config)
    }
}
