//! Client-side write timestamps.
//!
//! When a session has a generator configured, every QUERY request without
//! an explicit [`Statement::set_timestamp`](crate::statement::Statement::set_timestamp)
//! carries a timestamp taken from it.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tracing::warn;

/// Source of write timestamps, in microseconds since the Unix epoch.
pub trait TimestampGenerator: Send + Sync {
    fn next_timestamp(&self) -> i64;
}

fn now_micros() -> Option<i64> {
    let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_micros()).ok()
}

/// Reads the system clock. Two requests issued within the same
/// microsecond get the same timestamp, and a clock going backwards is not
/// corrected. A clock set before the epoch yields 0.
#[derive(Debug, Default)]
pub struct SimpleTimestampGenerator;

impl SimpleTimestampGenerator {
    pub fn new() -> Self {
        SimpleTimestampGenerator
    }
}

impl TimestampGenerator for SimpleTimestampGenerator {
    fn next_timestamp(&self) -> i64 {
        now_micros().unwrap_or(0)
    }
}

/// Returns strictly increasing timestamps.
///
/// The clock is used when it is ahead of the last returned timestamp;
/// otherwise the last timestamp is incremented by one microsecond. If the
/// clock lags by more than the warning threshold (1 second by default) a
/// warning is logged, at most once per warning interval (1 second by
/// default).
///
/// Monotonicity holds per generator instance, so share one `Arc` between
/// all the sessions that write the same data.
pub struct MonotonicTimestampGenerator {
    last: AtomicI64,
    skew_warnings: Option<SkewWarnings>,
}

struct SkewWarnings {
    threshold: Duration,
    interval: Duration,
    last_warning: Mutex<Option<Instant>>,
}

impl SkewWarnings {
    fn report(&self, clock: i64, last: i64) {
        let lag = Duration::from_micros(last.saturating_sub(clock).unsigned_abs());
        if lag <= self.threshold {
            return;
        }

        let now = Instant::now();
        let mut last_warning = self
            .last_warning
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if last_warning.is_some_and(|at| now.duration_since(at) < self.interval) {
            return;
        }
        *last_warning = Some(now);
        drop(last_warning);

        warn!(
            clock,
            last,
            ?lag,
            "Clock is behind the last generated timestamp, incrementing it instead"
        );
    }
}

impl MonotonicTimestampGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
            skew_warnings: Some(SkewWarnings {
                threshold: Duration::from_secs(1),
                interval: Duration::from_secs(1),
                last_warning: Mutex::new(None),
            }),
        }
    }

    /// Changes when clock skew is reported: a lag above `threshold`, at
    /// most once per `interval`.
    pub fn with_warning_times(mut self, threshold: Duration, interval: Duration) -> Self {
        self.skew_warnings = Some(SkewWarnings {
            threshold,
            interval,
            last_warning: Mutex::new(None),
        });
        self
    }

    pub fn without_warnings(mut self) -> Self {
        self.skew_warnings = None;
        self
    }

    fn successor(&self, last: i64, clock: Option<i64>) -> i64 {
        match clock {
            Some(clock) if clock > last => clock,
            Some(clock) => {
                if let Some(warnings) = &self.skew_warnings {
                    warnings.report(clock, last);
                }
                last.saturating_add(1)
            }
            None => {
                warn!("System clock is set before the Unix epoch");
                last.saturating_add(1)
            }
        }
    }
}

impl Default for MonotonicTimestampGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MonotonicTimestampGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonotonicTimestampGenerator")
            .field("last", &self.last)
            .field("warns", &self.skew_warnings.is_some())
            .finish()
    }
}

impl TimestampGenerator for MonotonicTimestampGenerator {
    fn next_timestamp(&self) -> i64 {
        let clock = now_micros();
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = self.successor(last, clock);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MonotonicTimestampGenerator, SimpleTimestampGenerator, TimestampGenerator};
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[test]
    fn simple_generator_follows_the_clock() {
        let generator = SimpleTimestampGenerator::new();
        let first = generator.next_timestamp();
        let second = generator.next_timestamp();
        // Some time after 2020-01-01.
        assert!(first > 1_577_836_800_000_000);
        assert!(second >= first);
    }

    #[test]
    fn monotonic_generator_ticks_on_duplicates() {
        let generator = MonotonicTimestampGenerator::new().without_warnings();
        let ahead = super::now_micros().unwrap() + 60_000_000;
        generator.last.store(ahead, Ordering::SeqCst);

        // The clock is a minute behind, so timestamps tick from the last one.
        assert_eq!(generator.next_timestamp(), ahead + 1);
        assert_eq!(generator.next_timestamp(), ahead + 2);
    }

    #[test]
    fn monotonic_generator_has_no_duplicates_across_threads() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1000;

        let generator = Arc::new(MonotonicTimestampGenerator::new());
        let all: Vec<Vec<i64>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        (0..PER_THREAD)
                            .map(|_| generator.next_timestamp())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for timestamps in &all {
            assert!(timestamps.windows(2).all(|pair| pair[0] < pair[1]));
        }
        let unique: HashSet<i64> = all.into_iter().flatten().collect();
        assert_eq!(unique.len(), THREADS * PER_THREAD);
    }
}
