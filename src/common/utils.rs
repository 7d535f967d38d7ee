//! Utility functions for appscale-coord

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Delay before retry number `attempt` (1-based): doubles from `base`, capped at `max`.
pub fn retry_delay_for(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(max.max(base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_fixed_by_default() {
        let base = Duration::from_secs(1);
        for attempt in 1..10 {
            assert_eq!(retry_delay_for(attempt, base, base), base);
        }
    }

    #[test]
    fn test_retry_delay_doubles_up_to_cap() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(750);
        assert_eq!(retry_delay_for(1, base, max), Duration::from_millis(100));
        assert_eq!(retry_delay_for(2, base, max), Duration::from_millis(200));
        assert_eq!(retry_delay_for(3, base, max), Duration::from_millis(400));
        assert_eq!(retry_delay_for(4, base, max), max);
        assert_eq!(retry_delay_for(40, base, max), max);
    }

    #[test]
    fn test_timestamp_now() {
        assert!(timestamp_now() > 1_600_000_000);
    }
}
