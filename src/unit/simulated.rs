//! Simulated drone
//!
//! Lets the agent run end to end without flight hardware. Kinematics:
//!
//! | Quantity | Model |
//! |----------|-------|
//! | Position | Constant speed along heading, flat-earth degree conversion |
//! | Altitude | Climbs/descends toward target at [`CLIMB_RATE`] |
//! | Battery  | Linear drain, faster while flying |
//!
//! State is advanced lazily whenever it is serialized.

use crate::config::UnitConfig;
use crate::error::{Error, Result};
use crate::unit::messages::{CommandCode, UnitCommand, UnitState};
use crate::unit::Unit;
use log::{debug, info, warn};
use parking_lot::Mutex;
use prost::Message as ProstMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Vertical speed toward the target altitude, m/s
pub const CLIMB_RATE: f32 = 2.0;

/// Takeoff altitude when the command carries none, meters
const DEFAULT_TAKEOFF_ALTITUDE: f32 = 10.0;

/// Battery drain, percent per second
const IDLE_DRAIN: f32 = 0.005;
const FLIGHT_DRAIN: f32 = 0.05;

/// Meters per degree of latitude
const METERS_PER_DEGREE: f64 = 111_320.0;

#[derive(Debug)]
struct FlightState {
    armed: bool,
    flying: bool,
    frozen: bool,
    latitude: f64,
    longitude: f64,
    altitude: f32,
    target_altitude: f32,
    speed: f32,
    heading: f32,
    battery: f32,
    last_update: Instant,
}

impl FlightState {
    /// Integrate motion up to `now`.
    fn advance(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last_update).as_secs_f32();
        self.last_update = now;
        if dt <= 0.0 {
            return;
        }

        let drain = if self.flying { FLIGHT_DRAIN } else { IDLE_DRAIN };
        if self.armed {
            self.battery = (self.battery - drain * dt).max(0.0);
        }

        if !self.flying {
            return;
        }

        let climb = CLIMB_RATE * dt;
        let delta = self.target_altitude - self.altitude;
        self.altitude += delta.clamp(-climb, climb);

        if !self.frozen && self.speed > 0.0 {
            let distance = f64::from(self.speed * dt);
            let heading = f64::from(self.heading).to_radians();
            self.latitude += distance * heading.cos() / METERS_PER_DEGREE;
            let lon_scale = METERS_PER_DEGREE * self.latitude.to_radians().cos().max(1e-6);
            self.longitude += distance * heading.sin() / lon_scale;
        }

        if self.battery <= 0.0 && self.target_altitude > 0.0 {
            warn!("Battery depleted, landing");
            self.target_altitude = 0.0;
            self.speed = 0.0;
        }

        if self.target_altitude <= 0.0 && self.altitude <= 0.0 {
            self.altitude = 0.0;
            self.flying = false;
            self.speed = 0.0;
            info!("Landed");
        }
    }
}

/// In-process drone used when no flight controller is attached
pub struct SimulatedUnit {
    id: String,
    max_speed: f32,
    active: AtomicBool,
    state: Mutex<FlightState>,
}

impl SimulatedUnit {
    pub fn new(config: &UnitConfig) -> Self {
        Self {
            id: config.id.clone(),
            max_speed: config.max_speed,
            active: AtomicBool::new(true),
            state: Mutex::new(FlightState {
                armed: false,
                flying: false,
                frozen: false,
                latitude: config.home_latitude,
                longitude: config.home_longitude,
                altitude: 0.0,
                target_altitude: 0.0,
                speed: 0.0,
                heading: 0.0,
                battery: 100.0,
                last_update: Instant::now(),
            }),
        }
    }

    /// Decoded snapshot of the current state
    pub fn snapshot(&self) -> UnitState {
        let mut state = self.state.lock();
        state.advance(Instant::now());

        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        UnitState {
            unit_id: self.id.clone(),
            timestamp_ms,
            armed: state.armed,
            flying: state.flying,
            frozen: state.frozen,
            latitude: state.latitude,
            longitude: state.longitude,
            altitude: state.altitude,
            speed: state.speed,
            heading: state.heading,
            battery: state.battery,
        }
    }

    fn execute(&self, code: CommandCode, cmd: &UnitCommand) -> Result<()> {
        let mut state = self.state.lock();
        state.advance(Instant::now());

        match code {
            CommandCode::Unspecified => {
                return Err(Error::Unit("command code missing".into()));
            }
            CommandCode::Arm => state.armed = true,
            CommandCode::Disarm => {
                if state.flying {
                    return Err(Error::Unit("cannot disarm while flying".into()));
                }
                state.armed = false;
            }
            CommandCode::Takeoff => {
                if !state.armed {
                    return Err(Error::Unit("takeoff requires arming first".into()));
                }
                if state.battery <= 0.0 {
                    return Err(Error::Unit("battery depleted".into()));
                }
                state.flying = true;
                state.target_altitude = if cmd.altitude > 0.0 {
                    cmd.altitude
                } else {
                    DEFAULT_TAKEOFF_ALTITUDE
                };
            }
            CommandCode::Land => {
                state.target_altitude = 0.0;
                state.speed = 0.0;
            }
            CommandCode::Move => {
                if !state.flying {
                    return Err(Error::Unit("not flying".into()));
                }
                state.heading = cmd.heading.rem_euclid(360.0);
                state.speed = cmd.speed.clamp(0.0, self.max_speed);
            }
            CommandCode::SetSpeed => {
                state.speed = cmd.speed.clamp(0.0, self.max_speed);
            }
            CommandCode::Hover => state.speed = 0.0,
            CommandCode::Shutdown => {
                drop(state);
                info!("Shutdown requested by cloud");
                self.deactivate();
            }
        }
        Ok(())
    }
}

impl Unit for SimulatedUnit {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn serialize_state(&self) -> Result<Vec<u8>> {
        Ok(self.snapshot().encode_to_vec())
    }

    fn apply_command(&self, payload: &[u8]) -> Result<()> {
        let cmd = UnitCommand::decode(payload)?;
        let code = CommandCode::try_from(cmd.code)
            .map_err(|_| Error::Unit(format!("unknown command code {}", cmd.code)))?;

        if self.state.lock().frozen {
            debug!("Unit frozen, ignoring {:?}", code);
            return Ok(());
        }

        debug!("Applying {:?}", code);
        self.execute(code, &cmd)
    }

    fn freeze(&self) {
        let mut state = self.state.lock();
        state.advance(Instant::now());
        state.frozen = true;
        state.speed = 0.0;
        warn!("Unit frozen");
    }

    fn resume(&self) {
        let mut state = self.state.lock();
        if state.frozen {
            state.frozen = false;
            info!("Unit resumed");
        }
    }

    fn deactivate(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("Unit {} deactivated", self.id);
        }
    }

    fn close(&self) {
        self.deactivate();
        let mut state = self.state.lock();
        state.speed = 0.0;
        state.target_altitude = 0.0;
        info!("Unit {} closed", self.id);
    }
}
