//! Delays between attempts to reconnect to a host.
//!
//! Each connection pool asks its [`ReconnectionPolicy`] for a fresh
//! [`ReconnectionSchedule`] when connecting to its host starts failing,
//! and keeps pulling delays from that schedule until a connection opens.

use std::time::Duration;

/// Produces reconnection schedules. One policy is shared by every pool
/// of a session.
pub trait ReconnectionPolicy: std::fmt::Debug + Send + Sync {
    /// A schedule starting from the first delay.
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule>;
}

/// Sequence of delays, consumed by a single pool during one streak of
/// failed connection attempts.
pub trait ReconnectionSchedule: Send + Sync {
    /// Delay to wait before the next attempt.
    fn next_delay(&mut self) -> Duration;
}

/// Waits the same interval before every attempt.
#[derive(Debug, Clone)]
pub struct ConstantReconnectionPolicy {
    interval: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ConstantSchedule(self.interval))
    }
}

struct ConstantSchedule(Duration);

impl ReconnectionSchedule for ConstantSchedule {
    fn next_delay(&mut self) -> Duration {
        self.0
    }
}

/// Starts at `start` and multiplies the delay by `multiplier` after every
/// attempt, never going above `max`.
///
/// The session uses `ExponentialReconnectionPolicy::new(500ms, 30s)` with a
/// multiplier of 2 unless configured otherwise.
///
/// # Example
/// ```
/// # use cassandra_driver::policies::reconnection::{ExponentialReconnectionPolicy, ReconnectionPolicy};
/// # use std::time::Duration;
/// let policy = ExponentialReconnectionPolicy::new(Duration::from_millis(100), Duration::from_secs(1))
///     .with_multiplier(3);
/// let mut schedule = policy.new_schedule();
/// assert_eq!(schedule.next_delay(), Duration::from_millis(100));
/// assert_eq!(schedule.next_delay(), Duration::from_millis(300));
/// assert_eq!(schedule.next_delay(), Duration::from_millis(900));
/// assert_eq!(schedule.next_delay(), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    start: Duration,
    max: Duration,
    multiplier: u32,
}

impl ExponentialReconnectionPolicy {
    /// A `max` lower than `start` is raised to `start`.
    pub fn new(start: Duration, max: Duration) -> Self {
        Self {
            start,
            max: max.max(start),
            multiplier: 2,
        }
    }

    /// Factor applied to the delay after each attempt. Values below 1 are
    /// treated as 1, which makes the schedule constant.
    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier.max(1);
        self
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ExponentialSchedule {
            current: self.start,
            max: self.max,
            multiplier: self.multiplier,
        })
    }
}

struct ExponentialSchedule {
    current: Duration,
    max: Duration,
    multiplier: u32,
}

impl ReconnectionSchedule for ExponentialSchedule {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(self.multiplier)
            .map_or(self.max, |next| next.min(self.max));
        delay
    }
}
