//! Exponential reconnect backoff.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Auto-reconnect is turned off for this relay.
    Disabled,
    /// A reconnect is already armed.
    AlreadyPending,
    /// Every attempt has been used up.
    Exhausted { attempts: u32 },
    Scheduled { delay: Duration, attempt: u32, at: Instant },
}

/// Attempt counter plus the pending reconnect slot.
///
/// The delay for attempt `n` (zero based) is `base_delay * 2^n`. The counter
/// only goes back to zero on [`ReconnectPolicy::reset`], which the connection
/// calls once a relay is ready.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    enabled: bool,
    base_delay: Duration,
    max_attempts: u32,
    attempts: u32,
    last_delay: Option<Duration>,
    pending: Option<Instant>,
}

impl ReconnectPolicy {
    pub fn new(enabled: bool, base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            enabled,
            base_delay,
            max_attempts,
            attempts: 0,
            last_delay: None,
            pending: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay of the most recently scheduled attempt.
    pub fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    pub fn pending(&self) -> Option<Instant> {
        self.pending
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub fn should_retry(&self) -> bool {
        self.enabled && self.attempts < self.max_attempts
    }

    pub fn schedule(&mut self, now: Instant) -> ReconnectDecision {
        if !self.enabled {
            return ReconnectDecision::Disabled;
        }
        if self.pending.is_some() {
            return ReconnectDecision::AlreadyPending;
        }
        if self.attempts >= self.max_attempts {
            return ReconnectDecision::Exhausted {
                attempts: self.max_attempts,
            };
        }

        let delay = self.delay_for_attempt(self.attempts);
        self.attempts += 1;
        self.last_delay = Some(delay);
        let at = now + delay;
        self.pending = Some(at);
        ReconnectDecision::Scheduled {
            delay,
            attempt: self.attempts,
            at,
        }
    }

    /// Take the pending slot if it is due.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.pending {
            Some(at) if now >= at => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Drop a pending reconnect without touching the counter.
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_delay = None;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let mut policy = ReconnectPolicy::new(true, Duration::from_millis(100), 3);
        let now = Instant::now();

        let mut delays = Vec::new();
        for _ in 0..3 {
            match policy.schedule(now) {
                ReconnectDecision::Scheduled { delay, .. } => delays.push(delay),
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(policy.last_delay(), delays.last().copied());
            assert!(policy.fire(now + Duration::from_secs(10)));
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert_eq!(
            policy.schedule(now),
            ReconnectDecision::Exhausted { attempts: 3 }
        );
        assert_eq!(policy.last_delay(), Some(Duration::from_millis(400)));
    }

    #[test]
    fn test_single_pending_slot() {
        let mut policy = ReconnectPolicy::new(true, Duration::from_secs(1), 5);
        let now = Instant::now();
        assert!(matches!(policy.schedule(now), ReconnectDecision::Scheduled { attempt: 1, .. }));
        assert_eq!(policy.schedule(now), ReconnectDecision::AlreadyPending);
        assert!(!policy.fire(now));
        assert!(policy.fire(now + Duration::from_secs(1)));
        assert_eq!(policy.pending(), None);
    }

    #[test]
    fn test_disabled_and_reset() {
        let mut disabled = ReconnectPolicy::new(false, Duration::from_secs(1), 5);
        assert_eq!(disabled.schedule(Instant::now()), ReconnectDecision::Disabled);

        let mut policy = ReconnectPolicy::new(true, Duration::from_secs(1), 5);
        policy.schedule(Instant::now());
        policy.cancel();
        assert_eq!(policy.attempts(), 1);
        assert_eq!(policy.last_delay(), Some(Duration::from_secs(1)));
        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.last_delay(), None);
        assert!(policy.should_retry());
    }
}
