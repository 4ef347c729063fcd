//! Setu - keeps a drone linked to its cloud control endpoint
//!
//! ## Architecture
//!
//! - **Watchdog** (`link`): probes the cloud host and publishes link status
//! - **Session loop** (`session`): connects, handshakes, streams state, tears down
//! - **Command receiver** (`streaming`): reads length-prefixed command frames
//! - **Sidecar** (`sidecar`): video streamer process, killed as a whole tree
//! - **Unit** (`unit`): the controlled device behind a narrow trait

pub mod app;
pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod session;
pub mod sidecar;
pub mod streaming;
pub mod unit;

// Re-export commonly used types
pub use app::Agent;
pub use config::AgentConfig;
pub use error::{Error, Result};
pub use session::{SessionLoop, ShutdownReason};
