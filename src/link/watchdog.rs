//! Connection watchdog thread
//!
//! Runs for the whole life of the agent, independent of control sessions.
//! Each tick it runs one [`Probe`] and feeds the result into the shared
//! [`LinkState`]. It only stops on its own when the reconnection budget is
//! exhausted; otherwise it runs until [`ConnectionWatchdog::stop`] or drop.

use crate::error::{Error, Result};
use crate::link::{LinkState, Probe, ProbeOutcome};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handle to the background probing thread
pub struct ConnectionWatchdog {
    link: Arc<LinkState>,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ConnectionWatchdog {
    /// Start probing.
    ///
    /// # Arguments
    /// - `probe`: reachability check run once per `interval`
    /// - `max_attempts`: failed probes while disconnected before giving up (0 = unlimited)
    /// - `interval`: probing cadence
    pub fn spawn<P>(probe: P, max_attempts: u32, interval: Duration) -> Result<Self>
    where
        P: Probe + 'static,
    {
        let link = Arc::new(LinkState::new(max_attempts));
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread_link = Arc::clone(&link);
        let thread = thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || Self::probe_loop(probe, thread_link, stop_rx, interval))
            .map_err(|e| Error::Other(format!("Failed to spawn watchdog: {}", e)))?;

        info!(
            "Connection watchdog started (every {:?}, max attempts {})",
            interval,
            if max_attempts == 0 {
                "unlimited".to_string()
            } else {
                max_attempts.to_string()
            }
        );

        Ok(Self {
            link,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Shared, read-only view of the link
    pub fn link(&self) -> Arc<LinkState> {
        Arc::clone(&self.link)
    }

    /// True once the probing thread has returned
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Stop probing and wait for the thread to exit
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the channel and wakes the thread
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Watchdog thread panicked");
            }
            debug!("Connection watchdog stopped");
        }
    }

    fn probe_loop<P: Probe>(
        mut probe: P,
        link: Arc<LinkState>,
        stop_rx: Receiver<()>,
        interval: Duration,
    ) {
        loop {
            let reachable = probe.probe();
            match link.record_probe(reachable) {
                ProbeOutcome::Connected => info!("Cloud reachable"),
                ProbeOutcome::Steady => {}
                ProbeOutcome::Lost => warn!("Cloud unreachable, link marked down"),
                ProbeOutcome::Retrying(attempt) => {
                    if link.max_attempts() > 0 {
                        warn!(
                            "Cloud still unreachable (attempt {}/{})",
                            attempt,
                            link.max_attempts()
                        );
                    } else {
                        debug!("Cloud still unreachable (attempt {})", attempt);
                    }
                }
                ProbeOutcome::Exhausted | ProbeOutcome::Finished => {
                    error!(
                        "Reconnection attempts exhausted after {} tries, watchdog stopping",
                        link.attempts()
                    );
                    return;
                }
            }

            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("Watchdog received stop");
                    return;
                }
            }
        }
    }
}

impl Drop for ConnectionWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
