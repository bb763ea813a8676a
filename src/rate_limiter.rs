use std::sync::Arc;

use chrono::Utc;

use crate::error::CoreError;
use crate::infra::KvStore;

/// A sliding-window counter over a row store: fixed
/// one-minute windows, with reads weighting the current and previous window
/// proportionally to where `now` falls within the current window.
pub struct RateLimiter {
    kv_store: Arc<KvStore>,
    requests_per_minute: u32,
}

impl RateLimiter {
    pub fn new(
        kv_store: Arc<KvStore>,
        requests_per_minute: u32,
    ) -> Self {
        Self { kv_store, requests_per_minute }
    }

    /// Increments the counter for `key` and returns whether the caller is
    /// still within budget.
    #[tracing::instrument(skip(self))]
    pub async fn check(
        &self,
        key: &str,
    ) -> Result<bool, CoreError> {
        let now = Utc::now().timestamp();
        let window_start = now - (now % 60);
        let previous_window_start = window_start - 60;
        let elapsed_fraction = (now - window_start) as f64 / 60.0;

        let current = self.kv_store.increment_rate_limit_window(key, window_start).await? as f64;
        let previous = self.kv_store.get_rate_limit_window(key, previous_window_start).await? as f64;

        let weighted = previous * (1.0 - elapsed_fraction) + current;
        Ok(weighted <= self.requests_per_minute as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_start_is_floored_to_the_minute() {
        let now = 1_700_000_123_i64;
        let window_start = now - (now % 60);
        assert_eq!(window_start % 60, 0);
        assert!(window_start <= now);
    }
}
