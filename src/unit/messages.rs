//! Protobuf payloads exchanged by the simulated unit
//!
//! These travel inside control-socket frames; the framing layer treats them
//! as opaque bytes.

use prost::Message as ProstMessage;

/// Uplink state report
#[derive(Clone, PartialEq, prost::Message)]
pub struct UnitState {
    #[prost(string, tag = "1")]
    pub unit_id: String,
    /// Milliseconds since the Unix epoch
    #[prost(uint64, tag = "2")]
    pub timestamp_ms: u64,
    #[prost(bool, tag = "3")]
    pub armed: bool,
    #[prost(bool, tag = "4")]
    pub flying: bool,
    #[prost(bool, tag = "5")]
    pub frozen: bool,
    #[prost(double, tag = "6")]
    pub latitude: f64,
    #[prost(double, tag = "7")]
    pub longitude: f64,
    /// Meters above home
    #[prost(float, tag = "8")]
    pub altitude: f32,
    /// Ground speed, m/s
    #[prost(float, tag = "9")]
    pub speed: f32,
    /// Degrees clockwise from north
    #[prost(float, tag = "10")]
    pub heading: f32,
    /// Percent
    #[prost(float, tag = "11")]
    pub battery: f32,
}

/// Downlink command
#[derive(Clone, PartialEq, prost::Message)]
pub struct UnitCommand {
    #[prost(enumeration = "CommandCode", tag = "1")]
    pub code: i32,
    /// Target altitude for `Takeoff`, meters
    #[prost(float, tag = "2")]
    pub altitude: f32,
    /// Speed for `Move` / `SetSpeed`, m/s
    #[prost(float, tag = "3")]
    pub speed: f32,
    /// Heading for `Move`, degrees
    #[prost(float, tag = "4")]
    pub heading: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CommandCode {
    Unspecified = 0,
    Arm = 1,
    Disarm = 2,
    Takeoff = 3,
    Land = 4,
    Move = 5,
    SetSpeed = 6,
    Hover = 7,
    Shutdown = 8,
}

impl UnitCommand {
    pub fn new(code: CommandCode) -> Self {
        Self {
            code: code as i32,
            ..Default::default()
        }
    }

    pub fn takeoff(altitude: f32) -> Self {
        Self {
            altitude,
            ..Self::new(CommandCode::Takeoff)
        }
    }

    pub fn move_to(heading: f32, speed: f32) -> Self {
        Self {
            heading,
            speed,
            ..Self::new(CommandCode::Move)
        }
    }

    pub fn set_speed(speed: f32) -> Self {
        Self {
            speed,
            ..Self::new(CommandCode::SetSpeed)
        }
    }

    /// Encoded payload, ready to be framed
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}
