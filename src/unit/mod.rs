//! Controlled unit capability
//!
//! The session loop never looks inside the unit. It only uses the narrow
//! [`Unit`] interface below, from up to three threads at once (session loop,
//! command receiver, signal handler), so implementations synchronise their
//! own state.

pub mod messages;
pub mod simulated;

pub use messages::{CommandCode, UnitCommand, UnitState};
pub use simulated::SimulatedUnit;

use crate::error::Result;

/// What the agent needs from the device it keeps online
pub trait Unit: Send + Sync {
    /// False once the unit has been deactivated; ends the session loop
    fn is_active(&self) -> bool;

    /// Current state as an opaque payload for the uplink
    fn serialize_state(&self) -> Result<Vec<u8>>;

    /// Apply one opaque command payload from the downlink
    fn apply_command(&self, payload: &[u8]) -> Result<()>;

    /// Enter a safe degraded state after a session failure
    fn freeze(&self);

    /// Leave the degraded state; called after a successful handshake
    fn resume(&self) {}

    /// Mark the unit inactive
    fn deactivate(&self);

    /// Release the unit at final shutdown
    fn close(&self);
}
