//! Reachability probes

use log::trace;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// A single yes/no check of whether the cloud host can be reached
pub trait Probe: Send {
    fn probe(&mut self) -> bool;
}

impl<F> Probe for F
where
    F: FnMut() -> bool + Send,
{
    fn probe(&mut self) -> bool {
        self()
    }
}

/// Opens and immediately closes a TCP connection to the target
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    /// # Arguments
    /// - `address`: `host:port` to connect to
    /// - `timeout`: connect timeout per resolved address
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Probe for TcpProbe {
    fn probe(&mut self) -> bool {
        // Resolve every time: DNS may be the thing that is down
        let addrs = match self.address.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                trace!("Probe could not resolve {}: {}", self.address, e);
                return false;
            }
        };

        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    let _ = stream.shutdown(Shutdown::Both);
                    return true;
                }
                Err(e) => trace!("Probe to {} failed: {}", addr, e),
            }
        }
        false
    }
}
