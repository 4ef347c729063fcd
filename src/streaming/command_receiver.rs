//! Downlink command receiver
//!
//! Owns the read side of the control socket for one session. Each decoded
//! frame is handed to [`Unit::apply_command`]; nothing is written back.
//!
//! # Lifecycle
//!
//! ```text
//! 1. Session connects and spawns the receiver on a clone of the socket
//! 2. Receiver blocks in decode() and dispatches each payload
//! 3a. decode() fails       → failure reported to the session loop, thread exits
//! 3b. teardown calls stop() → socket shut down, blocked read returns, thread exits
//! ```
//!
//! Shutting the socket down is the only way to interrupt a blocked read.

use crate::error::{Error, Result};
use crate::streaming::wire;
use crate::unit::Unit;
use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use log::{debug, error, info, trace};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Background reader for inbound command frames
pub struct CommandReceiver {
    /// Handle used only to shut the socket down
    control: TcpStream,
    stopping: Arc<AtomicBool>,
    failure_rx: Receiver<Error>,
    thread: Option<JoinHandle<()>>,
}

impl CommandReceiver {
    /// Start reading commands from `stream`.
    ///
    /// The receiver works on its own clones of the socket; the caller keeps
    /// `stream` for writing.
    pub fn spawn(stream: &TcpStream, unit: Arc<dyn Unit>) -> Result<Self> {
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let stopping = Arc::new(AtomicBool::new(false));
        let (failure_tx, failure_rx) = bounded(1);

        let thread_stopping = Arc::clone(&stopping);
        let thread = thread::Builder::new()
            .name("command-receiver".to_string())
            .spawn(move || Self::receive_loop(reader, unit, thread_stopping, failure_tx))
            .map_err(|e| Error::Other(format!("Failed to spawn command receiver: {}", e)))?;

        Ok(Self {
            control,
            stopping,
            failure_rx,
            thread: Some(thread),
        })
    }

    /// The error that ended the receiver, if it has failed.
    ///
    /// Returns each failure once.
    pub fn failure(&self) -> Option<Error> {
        match self.failure_rx.try_recv() {
            Ok(e) => Some(e),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                // Thread gone without reporting: it panicked
                if self.stopping.load(Ordering::SeqCst) {
                    None
                } else {
                    Some(Error::Other("command receiver exited unexpectedly".into()))
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Shut the socket down and wait for the thread to exit. Idempotent.
    pub fn stop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            trace!("Receiver socket shutdown: {}", e);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Command receiver thread panicked");
            }
            debug!("Command receiver stopped");
        }
    }

    fn receive_loop(
        mut reader: TcpStream,
        unit: Arc<dyn Unit>,
        stopping: Arc<AtomicBool>,
        failure_tx: Sender<Error>,
    ) {
        debug!("Command receiver started for {:?}", reader.peer_addr());
        let mut received = 0u64;

        loop {
            match wire::decode(&mut reader) {
                Ok(payload) => {
                    received += 1;
                    trace!("Command frame #{} ({} bytes)", received, payload.len());
                    if let Err(e) = unit.apply_command(&payload) {
                        error!("Failed to handle command: {}", e);
                    }
                }
                Err(e) => {
                    if stopping.load(Ordering::SeqCst) {
                        debug!("Command receiver exiting after {} commands", received);
                        return;
                    }
                    if e.is_disconnect() {
                        info!("Control socket closed by peer after {} commands", received);
                    } else {
                        error!("Failed to read command: {}", e);
                    }
                    let _ = failure_tx.send(e);
                    return;
                }
            }
        }
    }
}

impl Drop for CommandReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RecordingUnit {
        commands: Mutex<Vec<Vec<u8>>>,
    }

    impl Unit for RecordingUnit {
        fn is_active(&self) -> bool {
            true
        }
        fn serialize_state(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn apply_command(&self, payload: &[u8]) -> Result<()> {
            self.commands.lock().push(payload.to_vec());
            if payload == b"bad" {
                return Err(Error::Unit("rejected".into()));
            }
            Ok(())
        }
        fn freeze(&self) {}
        fn deactivate(&self) {}
        fn close(&self) {}
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn wait_for<T>(timeout: Duration, mut poll: impl FnMut() -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(v) = poll() {
                return Some(v);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_dispatches_commands_in_order() {
        let (agent, mut cloud) = socket_pair();
        let unit = Arc::new(RecordingUnit::default());
        let mut receiver = CommandReceiver::spawn(&agent, unit.clone()).unwrap();

        let payloads: [&[u8]; 3] = [b"takeoff", b"bad", b"land"];
        for payload in payloads {
            cloud.write_all(&wire::encode(payload).unwrap()).unwrap();
        }

        let done = wait_for(Duration::from_secs(2), || {
            (unit.commands.lock().len() == 3).then_some(())
        });
        assert!(done.is_some());
        assert_eq!(
            *unit.commands.lock(),
            vec![b"takeoff".to_vec(), b"bad".to_vec(), b"land".to_vec()]
        );

        // A rejected command does not end the session
        assert!(receiver.failure().is_none());
        assert!(receiver.is_running());
        receiver.stop();
        assert!(!receiver.is_running());
    }

    #[test]
    fn test_peer_close_reports_failure() {
        let (agent, cloud) = socket_pair();
        let unit = Arc::new(RecordingUnit::default());
        let receiver = CommandReceiver::spawn(&agent, unit).unwrap();

        drop(cloud);
        let failure = wait_for(Duration::from_secs(2), || receiver.failure());
        assert!(matches!(failure, Some(Error::ConnectionClosed)));
    }

    #[test]
    fn test_truncated_frame_never_dispatched() {
        let (agent, mut cloud) = socket_pair();
        let unit = Arc::new(RecordingUnit::default());
        let receiver = CommandReceiver::spawn(&agent, unit.clone()).unwrap();

        let mut frame = wire::encode(b"a command that never fully arrives").unwrap();
        frame.truncate(12);
        cloud.write_all(&frame).unwrap();
        drop(cloud);

        let failure = wait_for(Duration::from_secs(2), || receiver.failure());
        assert!(matches!(failure, Some(Error::ConnectionClosed)));
        assert!(unit.commands.lock().is_empty());
    }

    #[test]
    fn test_stop_unblocks_idle_read() {
        let (agent, _cloud) = socket_pair();
        let unit = Arc::new(RecordingUnit::default());
        let mut receiver = CommandReceiver::spawn(&agent, unit).unwrap();

        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        receiver.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(receiver.failure().is_none());

        // Second stop is a no-op
        receiver.stop();
    }
}
