//! Session loop
//!
//! Drives one control session after another for as long as the unit is
//! active. A session is everything that lives between a successful connect
//! and the next teardown: the control socket, the sidecar process and the
//! command receiver.
//!
//! ```text
//!            ┌───────────────────────────────────────────────┐
//!            ▼                                               │
//!  WaitingForNetwork ──▶ Connecting ──▶ Streaming ──▶ TearingDown
//!            │                │              │               ▲
//!            │ exhausted      └──── error ───┴── freeze() ───┘
//!            ▼
//!   deactivate + close
//! ```
//!
//! Teardown always runs, in a fixed order, whatever ended the session.

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::link::{LinkState, LinkWait};
use crate::sidecar::{
    ProcessSupervisor, ProcessTable, SidecarCommand, SidecarHandle, SystemProcessTable,
};
use crate::streaming::{CommandReceiver, wire};
use crate::unit::Unit;
use log::{debug, error, info, trace, warn};
use std::fmt;
use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Everything the loop needs from the configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub unit_id: String,
    pub control_address: String,
    pub connect_timeout: Duration,
    /// Longest a single frame write may block
    pub write_timeout: Duration,
    pub settle_delay: Duration,
    pub state_interval: Duration,
    /// Upper bound on how long the loop goes without checking the unit
    pub status_poll: Duration,
    /// Sidecar launched with every session; `None` runs without one
    pub sidecar: Option<SidecarCommand>,
}

impl SessionConfig {
    pub fn from_config(config: &AgentConfig, app_dir: &Path) -> Self {
        Self {
            unit_id: config.unit.id.clone(),
            control_address: config.cloud.control_address(),
            connect_timeout: config.timing.connect_timeout(),
            write_timeout: config.timing.write_timeout(),
            settle_delay: config.timing.settle_delay(),
            state_interval: config.timing.state_interval(),
            status_poll: config.timing.status_poll(),
            sidecar: SidecarCommand::video_streamer(config, app_dir),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    WaitingForNetwork,
    Connecting,
    Streaming,
    TearingDown,
}

/// Why a streaming phase ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
    NetworkLost,
    Deactivated,
}

impl fmt::Display for StreamExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamExit::NetworkLost => write!(f, "network lost"),
            StreamExit::Deactivated => write!(f, "unit deactivated"),
        }
    }
}

/// Why [`SessionLoop::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The unit was deactivated (signal, cloud command, ...)
    Deactivated,
    /// The watchdog ran out of reconnection attempts
    Exhausted,
}

/// Counters kept across sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Sessions whose handshake went out
    pub sessions_opened: u64,
    /// Sessions ended by an error rather than a clean exit
    pub sessions_failed: u64,
    /// State frames written across all sessions
    pub frames_sent: u64,
}

/// Resources owned by one session
#[derive(Default)]
struct Session {
    stream: Option<TcpStream>,
    sidecar: Option<SidecarHandle>,
    receiver: Option<CommandReceiver>,
    frames_sent: u64,
}

impl Session {
    /// Stop the receiver, kill the sidecar tree, close the socket.
    ///
    /// Each step runs even if an earlier one failed.
    fn tear_down<T: ProcessTable>(&mut self, supervisor: &mut ProcessSupervisor<T>) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.stop();
        }

        if let Some(mut sidecar) = self.sidecar.take()
            && let Err(e) = supervisor.terminate(&mut sidecar)
        {
            error!("Failed to terminate sidecar {}: {}", sidecar.pid(), e);
        }

        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both)
                && e.kind() != io::ErrorKind::NotConnected
            {
                warn!("Failed to shut down control socket: {}", e);
            }
            drop(stream);
        }
    }
}

/// Reconnecting session driver
pub struct SessionLoop<T: ProcessTable = SystemProcessTable> {
    config: SessionConfig,
    link: Arc<LinkState>,
    unit: Arc<dyn Unit>,
    supervisor: ProcessSupervisor<T>,
    state: LoopState,
    stats: SessionStats,
}

impl<T: ProcessTable> SessionLoop<T> {
    pub fn new(
        config: SessionConfig,
        link: Arc<LinkState>,
        unit: Arc<dyn Unit>,
        supervisor: ProcessSupervisor<T>,
    ) -> Self {
        Self {
            config,
            link,
            unit,
            supervisor,
            state: LoopState::WaitingForNetwork,
            stats: SessionStats::default(),
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run sessions until the unit is deactivated or the link budget is
    /// exhausted. Closes the unit before returning.
    pub fn run(&mut self) -> ShutdownReason {
        info!(
            "Session loop started for unit {} (control {})",
            self.config.unit_id, self.config.control_address
        );

        let reason = loop {
            if !self.unit.is_active() {
                break ShutdownReason::Deactivated;
            }

            self.enter(LoopState::WaitingForNetwork);
            match self.wait_for_network() {
                NetworkWait::Ready => {}
                NetworkWait::Exhausted => {
                    error!(
                        "Reconnection attempts exhausted ({}), shutting the unit down",
                        self.link.max_attempts()
                    );
                    self.unit.deactivate();
                    break ShutdownReason::Exhausted;
                }
                NetworkWait::Deactivated => break ShutdownReason::Deactivated,
            }

            self.run_session();
        };

        self.unit.close();
        info!(
            "Session loop finished ({:?}): {} sessions, {} failed, {} frames sent",
            reason, self.stats.sessions_opened, self.stats.sessions_failed, self.stats.frames_sent
        );
        reason
    }

    fn enter(&mut self, next: LoopState) {
        if self.state != next {
            trace!("{:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Block until the link is up and has stayed up through the settle delay.
    fn wait_for_network(&self) -> NetworkWait {
        let mut announced = false;
        loop {
            if !self.unit.is_active() {
                return NetworkWait::Deactivated;
            }

            match self.link.wait_for_link(self.config.status_poll) {
                LinkWait::Exhausted => return NetworkWait::Exhausted,
                LinkWait::TimedOut => {
                    if !announced {
                        info!("Waiting for network...");
                        announced = true;
                    }
                    continue;
                }
                LinkWait::Connected => {}
            }

            debug!("Network up, settling for {:?}", self.config.settle_delay);
            if !self.pause(self.config.settle_delay) {
                return NetworkWait::Deactivated;
            }
            if self.link.is_connected() {
                return NetworkWait::Ready;
            }
            debug!("Network dropped while settling");
        }
    }

    /// Sleep for `duration` in slices of at most `status_poll`.
    ///
    /// Returns false as soon as the unit is found inactive.
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if !self.unit.is_active() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(self.config.status_poll));
        }
    }

    fn run_session(&mut self) {
        let mut session = Session::default();

        let result = self
            .connect(&mut session)
            .and_then(|()| self.stream(&mut session));

        match result {
            Ok(exit) => info!(
                "Session ended: {} ({} frames sent)",
                exit, session.frames_sent
            ),
            Err(e) => {
                self.stats.sessions_failed += 1;
                if e.is_disconnect() {
                    warn!("Session lost: {}", e);
                } else {
                    error!("Session failed: {}", e);
                }
                self.unit.freeze();
            }
        }

        self.enter(LoopState::TearingDown);
        session.tear_down(&mut self.supervisor);
        debug!(
            "Session torn down ({} opened, {} failed so far)",
            self.stats.sessions_opened, self.stats.sessions_failed
        );
    }

    fn connect(&mut self, session: &mut Session) -> Result<()> {
        self.enter(LoopState::Connecting);

        let stream = connect_control(&self.config.control_address, self.config.connect_timeout)?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        // A peer that stops reading must fail the write, not stall the loop
        stream.set_write_timeout(Some(self.config.write_timeout))?;
        let stream = session.stream.insert(stream);

        wire::write_frame(stream, self.config.unit_id.as_bytes())?;
        self.stats.sessions_opened += 1;
        info!(
            "Unit {} connected to {}",
            self.config.unit_id, self.config.control_address
        );
        self.unit.resume();

        if let Some(command) = &self.config.sidecar {
            session.sidecar = Some(self.supervisor.spawn(command)?);
        }

        session.receiver = Some(CommandReceiver::spawn(stream, Arc::clone(&self.unit))?);
        Ok(())
    }

    fn stream(&mut self, session: &mut Session) -> Result<StreamExit> {
        self.enter(LoopState::Streaming);

        let Some(stream) = session.stream.as_mut() else {
            return Err(Error::Other("streaming without a control socket".into()));
        };

        loop {
            if !self.unit.is_active() {
                return Ok(StreamExit::Deactivated);
            }
            if !self.link.is_connected() {
                return Ok(StreamExit::NetworkLost);
            }
            if let Some(receiver) = &session.receiver
                && let Some(e) = receiver.failure()
            {
                return Err(e);
            }

            let state = self.unit.serialize_state()?;
            wire::write_frame(stream, &state)?;
            session.frames_sent += 1;
            self.stats.frames_sent += 1;
            trace!("State frame #{} ({} bytes)", session.frames_sent, state.len());

            if !self.pause(self.config.state_interval) {
                return Ok(StreamExit::Deactivated);
            }
        }
    }
}

enum NetworkWait {
    Ready,
    Exhausted,
    Deactivated,
}

/// Connect to the first resolved address that accepts within `timeout`.
fn connect_control(address: &str, timeout: Duration) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => Error::Io(e),
        None => Error::Other(format!("{} resolved to no addresses", address)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_connect_control_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect_control(&addr.to_string(), Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_connect_control_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let stream = connect_control(&addr, Duration::from_millis(500)).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), listener.local_addr().unwrap());
    }

    #[test]
    fn test_teardown_of_empty_session_is_noop() {
        let mut session = Session::default();
        let mut supervisor = ProcessSupervisor::new();
        session.tear_down(&mut supervisor);
        session.tear_down(&mut supervisor);
        assert!(session.stream.is_none());
    }

    #[test]
    fn test_teardown_closes_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let mut session = Session {
            stream: Some(client),
            ..Default::default()
        };
        session.tear_down(&mut ProcessSupervisor::new());

        let mut buf = [0u8; 1];
        let n = io::Read::read(&mut server, &mut buf).unwrap();
        assert_eq!(n, 0);
    }
}
