//! Bounded polling.
//!
//! Every wait on an external process (server settle, connection marker, watchdog, teardown)
//! goes through [`poll_until`], so there is exactly one place deciding how often to check and
//! when to give up. A [`CancelToken`] lets the owner of a match cut those waits short.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Shared flag asking a running match to stop as soon as possible.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a [`poll_until`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The check returned `Some` before the deadline.
    Ready(T),
    /// The deadline passed without the check succeeding.
    Expired,
}

impl<T> PollOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            PollOutcome::Ready(value) => Some(value),
            PollOutcome::Expired => None,
        }
    }
}

/// Calls `check` every `interval` until it returns `Some` or `timeout` elapses.
///
/// The check always runs at least once, and once more right at the deadline, so a zero
/// timeout still performs a single check. Sleeps never overshoot the deadline.
pub fn poll_until<T>(
    interval: Duration,
    timeout: Duration,
    mut check: impl FnMut() -> Option<T>,
) -> PollOutcome<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return PollOutcome::Ready(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::Expired;
        }
        // at least one millisecond, otherwise a zero interval would spin
        let nap = interval.max(Duration::from_millis(1)).min(deadline - now);
        std::thread::sleep(nap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = CancelToken::new();
        let worker = token.clone();
        assert!(!worker.is_cancelled());
        token.cancel();
        assert!(worker.is_cancelled());
    }

    #[test]
    fn ready_on_first_check() {
        let outcome = poll_until(Duration::from_secs(10), Duration::from_secs(10), || Some(7));
        assert_eq!(outcome, PollOutcome::Ready(7));
    }

    #[test]
    fn zero_timeout_checks_once() {
        let mut calls = 0;
        let outcome: PollOutcome<()> = poll_until(Duration::from_millis(5), Duration::ZERO, || {
            calls += 1;
            None
        });
        assert_eq!(outcome, PollOutcome::Expired);
        assert_eq!(calls, 1);
    }

    #[test]
    fn ready_after_a_few_checks() {
        let mut calls = 0;
        let outcome = poll_until(Duration::from_millis(1), Duration::from_secs(5), || {
            calls += 1;
            (calls == 3).then_some(calls)
        });
        assert_eq!(outcome.ready(), Some(3));
    }

    #[test]
    fn expires_close_to_deadline() {
        let start = Instant::now();
        let outcome: PollOutcome<()> =
            poll_until(Duration::from_millis(10), Duration::from_millis(50), || None);
        let elapsed = start.elapsed();
        assert!(!outcome.is_ready());
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2));
    }
}
