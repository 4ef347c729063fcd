//! Agent orchestration
//!
//! Brings the unit up, starts the watchdog, runs the session loop on the
//! calling thread and shuts everything down in reverse order.

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::link::{ConnectionWatchdog, TcpProbe};
use crate::session::{SessionConfig, SessionLoop, ShutdownReason};
use crate::sidecar::ProcessSupervisor;
use crate::unit::{SimulatedUnit, Unit};
use log::{info, warn};
use parking_lot::Mutex;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Longest the unit bring-up sleeps before rechecking for shutdown
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Shutdown request shared with the signal handler thread
///
/// Deactivates the attached unit, or the unit attached later if the request
/// arrives first.
#[derive(Default)]
pub struct ShutdownSignal {
    requested: AtomicBool,
    unit: Mutex<Option<Arc<dyn Unit>>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
        if let Some(unit) = self.unit.lock().as_ref() {
            unit.deactivate();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn attach(&self, unit: Arc<dyn Unit>) {
        let mut slot = self.unit.lock();
        if self.is_requested() {
            unit.deactivate();
        }
        *slot = Some(unit);
    }
}

/// Call `factory` every `retry` until it yields a unit.
///
/// Returns `None` if shutdown is requested first.
pub fn bring_up<U, F>(mut factory: F, retry: Duration, shutdown: &ShutdownSignal) -> Option<U>
where
    F: FnMut() -> Result<U>,
{
    let mut attempt = 0u32;
    loop {
        if shutdown.is_requested() {
            return None;
        }
        attempt += 1;
        match factory() {
            Ok(unit) => {
                if attempt > 1 {
                    info!("Unit up after {} attempts", attempt);
                }
                return Some(unit);
            }
            Err(e) => warn!("Unit unavailable (attempt {}): {}", attempt, e),
        }

        let deadline = Instant::now() + retry;
        while !shutdown.is_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(SHUTDOWN_POLL));
        }
    }
}

/// The whole agent: unit, watchdog and session loop
pub struct Agent {
    config: AgentConfig,
    app_dir: PathBuf,
    shutdown: Arc<ShutdownSignal>,
}

impl Agent {
    pub fn new(config: AgentConfig, app_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            app_dir: app_dir.into(),
            shutdown: Arc::new(ShutdownSignal::new()),
        }
    }

    /// Handle for requesting shutdown from another thread
    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        Arc::clone(&self.shutdown)
    }

    /// Run with the built-in simulated unit.
    pub fn run(&self) -> Result<ShutdownReason> {
        let unit_config = self.config.unit.clone();
        self.run_with(|| Ok(SimulatedUnit::new(&unit_config)))
    }

    /// Run until the unit is deactivated or the link budget is exhausted.
    ///
    /// SIGINT and SIGTERM deactivate the unit for the duration of the call.
    pub fn run_with<U, F>(&self, factory: F) -> Result<ShutdownReason>
    where
        U: Unit + 'static,
        F: FnMut() -> Result<U>,
    {
        info!(
            "Setu agent starting for unit {} (cloud {})",
            self.config.unit.id, self.config.cloud.host
        );

        let signals = self.setup_signal_handler()?;
        let result = self.run_unit(factory);
        signals.close();
        result
    }

    fn run_unit<U, F>(&self, factory: F) -> Result<ShutdownReason>
    where
        U: Unit + 'static,
        F: FnMut() -> Result<U>,
    {
        let Some(unit) = bring_up(factory, self.config.timing.unit_retry(), &self.shutdown) else {
            info!("Shutdown before the unit came up");
            return Ok(ShutdownReason::Deactivated);
        };
        let unit: Arc<dyn Unit> = Arc::new(unit);
        self.shutdown.attach(Arc::clone(&unit));

        let probe = TcpProbe::new(
            self.config.cloud.probe_address(),
            self.config.timing.probe_timeout(),
        );
        let mut watchdog = match ConnectionWatchdog::spawn(
            probe,
            self.config.cloud.max_reconnection_attempts,
            self.config.timing.probe_interval(),
        ) {
            Ok(watchdog) => watchdog,
            Err(e) => {
                unit.close();
                return Err(e);
            }
        };

        let mut session_loop = SessionLoop::new(
            SessionConfig::from_config(&self.config, &self.app_dir),
            watchdog.link(),
            unit,
            ProcessSupervisor::new(),
        );
        let reason = session_loop.run();

        watchdog.stop();
        info!("Unit offline ({:?})", reason);
        Ok(reason)
    }

    fn setup_signal_handler(&self) -> Result<Handle> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let handle = signals.handle();
        let shutdown = Arc::clone(&self.shutdown);

        thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                for sig in signals.forever() {
                    info!("Received signal {}, initiating shutdown...", sig);
                    shutdown.trigger();
                }
            })
            .map_err(|e| Error::Other(format!("Failed to spawn signal handler: {}", e)))?;

        Ok(handle)
    }
}
