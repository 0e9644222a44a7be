//! Jitter for renewal times, so that instances sharing a cache do not all
//! renew at the same moment

use wxtoken_clock::UnixTime;

/// A type that moves a renewal time
pub trait JitterSource {
    /// Jitters the given renewal time
    ///
    /// Implementations must only move the time earlier, so that a renewal
    /// never happens after the credential's own refresh time.
    fn jitter(&mut self, refresh_at: UnixTime) -> UnixTime;
}

/// A jitter source that leaves times untouched
#[derive(Clone, Copy, Debug, Default)]
pub struct NullJitter;

impl JitterSource for NullJitter {
    #[inline]
    fn jitter(&mut self, refresh_at: UnixTime) -> UnixTime {
        refresh_at
    }
}

impl<J: JitterSource + ?Sized> JitterSource for Box<J> {
    #[inline]
    fn jitter(&mut self, refresh_at: UnixTime) -> UnixTime {
        (**self).jitter(refresh_at)
    }
}

#[cfg(feature = "rand")]
mod random {
    use rand::{Rng, SeedableRng};
    use wxtoken_clock::{DurationSecs, UnixTime};

    /// Moves times earlier by a random amount
    ///
    /// Jittered times are uniformly distributed in `[time - max_jitter, time]`.
    #[derive(Debug)]
    pub struct RandomEarlyJitter<R> {
        max_jitter: DurationSecs,
        rand_source: R,
    }

    impl RandomEarlyJitter<rand::rngs::StdRng> {
        /// Constructs a new instance that will jitter times early by up to `max_jitter`
        pub fn new(max_jitter: DurationSecs) -> Self {
            Self::with_rng(max_jitter, rand::rngs::StdRng::from_entropy())
        }
    }

    impl<R: Rng> RandomEarlyJitter<R> {
        /// Constructs a new instance drawing from the given random source
        pub fn with_rng(max_jitter: DurationSecs, rand_source: R) -> Self {
            Self {
                max_jitter,
                rand_source,
            }
        }
    }

    impl<R: Rng> super::JitterSource for RandomEarlyJitter<R> {
        fn jitter(&mut self, refresh_at: UnixTime) -> UnixTime {
            if self.max_jitter.is_zero() {
                return refresh_at;
            }

            let jitter = self.rand_source.gen_range(0..=self.max_jitter.0);
            refresh_at - DurationSecs(jitter)
        }
    }
}

#[cfg(feature = "rand")]
pub use random::RandomEarlyJitter;
