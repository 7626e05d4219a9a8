use crate::lock::config::LockConfig;
use rand::rngs::ThreadRng;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::trace;

// About a century; far beyond any real wait and representable as an Instant
// offset on every supported platform.
const MAX_TIMEOUT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// How long an acquire is willing to wait for a contended lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockStrategy {
    #[default]
    Wait,
    NoWait,
    Timeout(Duration),
}

impl LockStrategy {
    /// Map the `(blocking, timeout)` pair of the acquire calls onto a
    /// strategy. A timeout is ignored when `blocking` is false.
    pub fn from_flags(blocking: bool, timeout: Option<Duration>) -> Self {
        match (blocking, timeout) {
            (false, _) => LockStrategy::NoWait,
            (true, None) => LockStrategy::Wait,
            (true, Some(duration)) => LockStrategy::Timeout(duration),
        }
    }

    /// Fix the deadline for one acquire call, starting now.
    pub(crate) fn start(&self) -> Wait {
        match self {
            LockStrategy::Wait => Wait::Forever,
            LockStrategy::NoWait => Wait::Never,
            LockStrategy::Timeout(duration) => {
                let now = Instant::now();
                // Huge timeouts are capped, never turned into an untimed wait.
                let deadline = now
                    .checked_add(*duration)
                    .or_else(|| now.checked_add(MAX_TIMEOUT))
                    .unwrap_or(now);
                Wait::Until(deadline)
            }
        }
    }
}

/// Deadline of an acquire call in progress. Shared by the in-process wait and
/// the OS polling loop so the two together never exceed the caller's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    Never,
    Until(Instant),
    Forever,
}

impl Wait {
    pub(crate) fn is_forever(&self) -> bool {
        matches!(self, Wait::Forever)
    }
}

/// Exponential backoff with jitter between non-blocking lock attempts.
pub(crate) struct Backoff {
    current: Duration,
    max: Duration,
    jitter: Duration,
    rng: ThreadRng,
}

impl Backoff {
    pub(crate) fn new(config: &LockConfig) -> Self {
        Self {
            current: config.initial_delay,
            max: config.max_delay.max(config.initial_delay),
            jitter: config.jitter,
            rng: rand::thread_rng(),
        }
    }

    /// Sleep before the next attempt. Returns false, without sleeping, once
    /// the deadline has passed or when the caller does not wait at all.
    pub(crate) fn pause(&mut self, wait: Wait) -> bool {
        let jitter_us = self.jitter.as_micros() as u64;
        let mut pause = self.current + Duration::from_micros(self.rng.gen_range(0..=jitter_us));

        match wait {
            Wait::Never => return false,
            Wait::Forever => {}
            Wait::Until(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                pause = pause.min(deadline - now);
            }
        }

        trace!(?pause, "lock contended, backing off");
        std::thread::sleep(pause);

        self.current = self.current.saturating_mul(2).min(self.max);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_flags() {
        assert_eq!(LockStrategy::from_flags(true, None), LockStrategy::Wait);
        assert_eq!(LockStrategy::from_flags(false, None), LockStrategy::NoWait);
        assert_eq!(
            LockStrategy::from_flags(false, Some(Duration::from_secs(1))),
            LockStrategy::NoWait
        );
        assert_eq!(
            LockStrategy::from_flags(true, Some(Duration::from_millis(5))),
            LockStrategy::Timeout(Duration::from_millis(5))
        );
    }

    #[test]
    fn test_huge_timeout_stays_timed() {
        let wait = LockStrategy::Timeout(Duration::MAX).start();
        assert!(matches!(wait, Wait::Until(_)));
        assert!(!wait.is_forever());
    }

    #[test]
    fn test_no_wait_never_sleeps() {
        let mut backoff = Backoff::new(&LockConfig::default());
        assert!(!backoff.pause(Wait::Never));
    }

    #[test]
    fn test_pause_is_clamped_to_deadline() {
        let config = LockConfig::default()
            .with_initial_delay(Duration::from_secs(5))
            .with_max_delay(Duration::from_secs(5));
        let mut backoff = Backoff::new(&config);
        let wait = LockStrategy::Timeout(Duration::from_millis(50)).start();

        let start = Instant::now();
        assert!(backoff.pause(wait));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!backoff.pause(wait), "deadline has passed");
    }

    #[test]
    fn test_delay_grows_up_to_max() {
        let config = LockConfig::default()
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(4))
            .with_jitter(Duration::ZERO);
        let mut backoff = Backoff::new(&config);

        for _ in 0..5 {
            assert!(backoff.pause(Wait::Forever));
        }
        assert_eq!(backoff.current, Duration::from_millis(4));
    }
}
