use parking_lot::RwLock;
use serde::Serialize;
use wxtoken_clock::UnixTime;

/// A snapshot of refresh statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RefreshStats {
    /// Number of successful refreshes
    pub refresh_count: u64,
    /// Number of failed refresh attempts
    pub failure_count: u64,
    /// When the last successful refresh completed
    pub last_refresh_time: Option<UnixTime>,
    /// When the last failed refresh attempt completed
    pub last_failure_time: Option<UnixTime>,
    /// A short prefix of the token currently served
    pub current_token_preview: Option<String>,
}

/// Counts completed refresh attempts
#[derive(Debug, Default)]
pub struct StatsCollector {
    inner: RwLock<RefreshStats>,
}

impl StatsCollector {
    /// Constructs an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_success(&self, at: UnixTime) {
        let mut stats = self.inner.write();
        stats.refresh_count += 1;
        stats.last_refresh_time = Some(at);
    }

    pub(crate) fn record_failure(&self, at: UnixTime) {
        let mut stats = self.inner.write();
        stats.failure_count += 1;
        stats.last_failure_time = Some(at);
    }

    /// Gets a consistent snapshot of the counters
    pub fn snapshot(&self) -> RefreshStats {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_successes_and_failures_separately() {
        let stats = StatsCollector::new();

        stats.record_success(UnixTime(10));
        stats.record_failure(UnixTime(20));
        stats.record_failure(UnixTime(30));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.refresh_count, 1);
        assert_eq!(snapshot.failure_count, 2);
        assert_eq!(snapshot.last_refresh_time, Some(UnixTime(10)));
        assert_eq!(snapshot.last_failure_time, Some(UnixTime(30)));
    }

    #[test]
    fn serializes_for_health_endpoints() {
        let stats = StatsCollector::new();
        stats.record_success(UnixTime(1_700_000_000));

        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "refresh_count": 1,
                "failure_count": 0,
                "last_refresh_time": 1_700_000_000u64,
                "last_failure_time": null,
                "current_token_preview": null,
            })
        );
    }
}
