//! Eviction rules for machine histories and the GPU usage log.

use chrono::{DateTime, Duration, Utc};

/// Number of oldest records to drop so a history holds at most `max_records`.
pub fn history_overflow(len: usize, max_records: usize) -> usize {
    len.saturating_sub(max_records)
}

/// Whether the oldest history entry of the reporting machine is past the
/// retention window, in which case one GPU log entry is evicted.
///
/// A window that runs past the end of representable time never expires.
pub fn gpu_log_expired(oldest: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    oldest
        .checked_add_signed(window)
        .is_some_and(|limit| now >= limit)
}

/// Number of oldest events to drop so the log stays below `max_gpu_records`.
/// Never more than `len`.
pub fn gpu_log_overflow(len: usize, max_gpu_records: usize) -> usize {
    if len >= max_gpu_records {
        (len + 1 - max_gpu_records).min(len)
    } else {
        0
    }
}

/// Number of oldest events to drop from a reloaded log so it holds at most
/// `max_gpu_records`.
pub fn loaded_gpu_log_overflow(len: usize, max_gpu_records: usize) -> usize {
    len.saturating_sub(max_gpu_records)
}

/// Whether a GPU event is past the retention window on its own timestamp.
pub fn event_expired(time: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    gpu_log_expired(time, now, window)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn history_overflow_counts_excess() {
        assert_eq!(history_overflow(0, 10), 0);
        assert_eq!(history_overflow(10, 10), 0);
        assert_eq!(history_overflow(11, 10), 1);
        assert_eq!(history_overflow(15, 10), 5);
    }

    #[test]
    fn gpu_log_overflow_keeps_log_below_cap() {
        assert_eq!(gpu_log_overflow(4, 5), 0);
        assert_eq!(gpu_log_overflow(5, 5), 1);
        assert_eq!(gpu_log_overflow(7, 5), 3);
        assert_eq!(gpu_log_overflow(1, 1), 1);
        assert_eq!(gpu_log_overflow(0, 0), 0);
        assert_eq!(gpu_log_overflow(3, 0), 3);
    }

    #[test]
    fn reloaded_log_keeps_up_to_the_cap() {
        assert_eq!(loaded_gpu_log_overflow(3, 5), 0);
        assert_eq!(loaded_gpu_log_overflow(5, 5), 0);
        assert_eq!(loaded_gpu_log_overflow(8, 5), 3);
    }

    #[test]
    fn expiry_is_inclusive_of_the_boundary() {
        let oldest = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let window = Duration::days(14);

        assert!(!gpu_log_expired(oldest, oldest + Duration::days(13), window));
        assert!(gpu_log_expired(oldest, oldest + window, window));
        assert!(gpu_log_expired(oldest, oldest + Duration::days(30), window));
    }

    #[test]
    fn unrepresentable_window_never_expires() {
        let oldest = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let now = oldest + Duration::days(365);

        assert!(!gpu_log_expired(oldest, now, Duration::MAX));
        assert!(!event_expired(oldest, now, Duration::MAX));
    }
}
