//! Cloud reachability tracking
//!
//! The [`ConnectionWatchdog`] probes the cloud host on a fixed cadence and is
//! the only writer of the shared [`LinkState`]. Everyone else reads it:
//!
//! ```text
//!            probe ok                      probe fails
//!  ┌──────────────┐ ──────────────▶ ┌───────────┐ ──────────▶ ┌──────────────┐
//!  │ Disconnected │                 │ Connected │             │ Disconnected │
//!  └──────────────┘ ◀────────────── └───────────┘             └──────────────┘
//!     │ probe fails: attempts += 1
//!     ▼
//!  attempts == max ──▶ exhausted (terminal, probing stops)
//! ```

pub mod probe;
pub mod watchdog;

pub use probe::{Probe, TcpProbe};
pub use watchdog::ConnectionWatchdog;

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Reachability of the cloud host as last observed by the watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    #[default]
    Disconnected,
    Connected,
}

/// Result of feeding one probe into the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Disconnected → Connected
    Connected,
    /// Still connected
    Steady,
    /// Connected → Disconnected
    Lost,
    /// Failed again while disconnected; carries the new attempt count
    Retrying(u32),
    /// Attempt count reached the maximum on this probe
    Exhausted,
    /// Already exhausted; the probe was ignored
    Finished,
}

/// Answer to [`LinkState::wait_for_link`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkWait {
    Connected,
    Exhausted,
    TimedOut,
}

#[derive(Debug, Default)]
struct Inner {
    status: LinkStatus,
    attempts: u32,
    exhausted: bool,
}

/// Link status shared between the watchdog and the session loop
///
/// Mutated only through [`LinkState::record_probe`], which is crate-private
/// and called from the watchdog thread alone.
#[derive(Debug)]
pub struct LinkState {
    inner: Mutex<Inner>,
    changed: Condvar,
    /// 0 disables exhaustion
    max_attempts: u32,
}

impl LinkState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            changed: Condvar::new(),
            max_attempts,
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.inner.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == LinkStatus::Connected
    }

    /// Consecutive failed probes since the link was last seen up
    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// True once the attempt budget has run out. Never reset.
    pub fn is_exhausted(&self) -> bool {
        self.inner.lock().exhausted
    }

    /// Block until the link is up, the budget is exhausted, or `timeout`
    /// elapses, whichever comes first.
    pub fn wait_for_link(&self, timeout: Duration) -> LinkWait {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.exhausted {
                return LinkWait::Exhausted;
            }
            if inner.status == LinkStatus::Connected {
                return LinkWait::Connected;
            }
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return match (inner.exhausted, inner.status) {
                    (true, _) => LinkWait::Exhausted,
                    (false, LinkStatus::Connected) => LinkWait::Connected,
                    (false, LinkStatus::Disconnected) => LinkWait::TimedOut,
                };
            }
        }
    }

    /// Apply one probe result.
    pub(crate) fn record_probe(&self, reachable: bool) -> ProbeOutcome {
        let mut inner = self.inner.lock();
        if inner.exhausted {
            return ProbeOutcome::Finished;
        }

        let outcome = match (reachable, inner.status) {
            (true, LinkStatus::Disconnected) => {
                inner.status = LinkStatus::Connected;
                inner.attempts = 0;
                ProbeOutcome::Connected
            }
            (true, LinkStatus::Connected) => ProbeOutcome::Steady,
            (false, LinkStatus::Connected) => {
                inner.status = LinkStatus::Disconnected;
                ProbeOutcome::Lost
            }
            (false, LinkStatus::Disconnected) => {
                inner.attempts += 1;
                if self.max_attempts > 0 && inner.attempts >= self.max_attempts {
                    inner.exhausted = true;
                    ProbeOutcome::Exhausted
                } else {
                    ProbeOutcome::Retrying(inner.attempts)
                }
            }
        };

        if !matches!(outcome, ProbeOutcome::Steady | ProbeOutcome::Retrying(_)) {
            self.changed.notify_all();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_initially_disconnected() {
        let link = LinkState::new(5);
        assert_eq!(link.status(), LinkStatus::Disconnected);
        assert_eq!(link.attempts(), 0);
        assert!(!link.is_exhausted());
    }

    #[test]
    fn test_connect_resets_attempts() {
        let link = LinkState::new(10);
        assert_eq!(link.record_probe(false), ProbeOutcome::Retrying(1));
        assert_eq!(link.record_probe(false), ProbeOutcome::Retrying(2));
        assert_eq!(link.record_probe(true), ProbeOutcome::Connected);
        assert_eq!(link.attempts(), 0);
        assert_eq!(link.record_probe(true), ProbeOutcome::Steady);
    }

    #[test]
    fn test_first_failure_after_connected_does_not_count() {
        let link = LinkState::new(10);
        link.record_probe(true);
        assert_eq!(link.record_probe(false), ProbeOutcome::Lost);
        assert_eq!(link.attempts(), 0);
        assert_eq!(link.record_probe(false), ProbeOutcome::Retrying(1));
    }

    #[test]
    fn test_attempts_increase_by_one_until_exhausted_once() {
        let link = LinkState::new(5);
        let outcomes: Vec<_> = (0..8).map(|_| link.record_probe(false)).collect();

        assert_eq!(
            outcomes,
            vec![
                ProbeOutcome::Retrying(1),
                ProbeOutcome::Retrying(2),
                ProbeOutcome::Retrying(3),
                ProbeOutcome::Retrying(4),
                ProbeOutcome::Exhausted,
                ProbeOutcome::Finished,
                ProbeOutcome::Finished,
                ProbeOutcome::Finished,
            ]
        );
        assert_eq!(link.attempts(), 5);
        assert!(link.is_exhausted());

        // Terminal: a late success does not revive the link
        assert_eq!(link.record_probe(true), ProbeOutcome::Finished);
        assert_eq!(link.status(), LinkStatus::Disconnected);
    }

    #[test]
    fn test_zero_max_never_exhausts() {
        let link = LinkState::new(0);
        for i in 1..=1000 {
            assert_eq!(link.record_probe(false), ProbeOutcome::Retrying(i));
        }
        assert!(!link.is_exhausted());
    }

    #[test]
    fn test_wait_times_out_while_down() {
        let link = LinkState::new(0);
        assert_eq!(
            link.wait_for_link(Duration::from_millis(20)),
            LinkWait::TimedOut
        );
    }

    #[test]
    fn test_wait_wakes_on_connect() {
        let link = Arc::new(LinkState::new(0));
        let writer = Arc::clone(&link);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            writer.record_probe(true);
        });

        assert_eq!(link.wait_for_link(Duration::from_secs(5)), LinkWait::Connected);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_wakes_on_exhaustion() {
        let link = Arc::new(LinkState::new(2));
        let writer = Arc::clone(&link);
        let handle = thread::spawn(move || {
            writer.record_probe(false);
            thread::sleep(Duration::from_millis(20));
            writer.record_probe(false);
        });

        assert_eq!(link.wait_for_link(Duration::from_secs(5)), LinkWait::Exhausted);
        handle.join().unwrap();
    }
}
