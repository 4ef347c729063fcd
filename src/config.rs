//! Configuration for the Setu agent
//!
//! Loaded once at startup from a TOML file and treated as immutable for the
//! lifetime of the process. Components receive the pieces they need by value.
//!
//! ```toml
//! [unit]
//! id = "drone-01"
//!
//! [cloud]
//! host = "203.0.113.10"
//! control_port = 8880
//! video_port = 8881
//! max_reconnection_attempts = 20
//!
//! [video]
//! fps = 15
//! width = 640
//! height = 480
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level agent configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub unit: UnitConfig,
    pub cloud: CloudConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity of the controlled unit
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UnitConfig {
    /// Identifier announced in the handshake frame
    pub id: String,

    /// Starting position of the simulated unit (degrees)
    #[serde(default)]
    pub home_latitude: f64,
    #[serde(default)]
    pub home_longitude: f64,

    /// Speed limit of the simulated unit in m/s (default: 15.0)
    #[serde(default = "default_max_speed")]
    pub max_speed: f32,
}

/// Cloud endpoint settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudConfig {
    /// Cloud host name or IP address
    pub host: String,

    /// TCP port of the control endpoint (default: 8880)
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Port the video sidecar streams to (default: 8881)
    #[serde(default = "default_video_port")]
    pub video_port: u16,

    /// Consecutive failed probes before giving up (0 = never give up)
    #[serde(default = "default_max_reconnection_attempts")]
    pub max_reconnection_attempts: u32,

    /// Port probed by the watchdog (default: the control port)
    #[serde(default)]
    pub probe_port: Option<u16>,
}

/// Video sidecar settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VideoConfig {
    /// Spawn the sidecar for each session (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interpreter or executable used to launch the sidecar
    #[serde(default = "default_video_program")]
    pub program: String,

    /// Sidecar script, relative to the agent directory
    #[serde(default = "default_video_script")]
    pub script: String,

    #[serde(default)]
    pub grayscale: bool,

    /// Frames per second (1-60)
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// JPEG quality (1-100)
    #[serde(default = "default_quality")]
    pub quality: u32,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,
}

/// Cadences and timeouts, all in milliseconds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    /// Interval between reachability probes (default: 1000)
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Connect timeout of a single probe (default: 1000)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Delay after the link comes up before connecting (default: 3000)
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Interval between state frames (default: 1000)
    #[serde(default = "default_state_interval_ms")]
    pub state_interval_ms: u64,

    /// Control socket connect timeout (default: 5000)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Longest a single frame write may block before the session fails (default: 5000)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Upper bound on a single wait for link status (default: 1000)
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_ms: u64,

    /// Delay between attempts to bring the unit up (default: 2000)
    #[serde(default = "default_unit_retry_ms")]
    pub unit_retry_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log output (stdout, stderr, or file)
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_true() -> bool {
    true
}
fn default_max_speed() -> f32 {
    15.0
}
fn default_control_port() -> u16 {
    8880
}
fn default_video_port() -> u16 {
    8881
}
fn default_max_reconnection_attempts() -> u32 {
    20
}
fn default_video_program() -> String {
    "/usr/bin/python3".to_string()
}
fn default_video_script() -> String {
    "video_streamer.py".to_string()
}
fn default_fps() -> u32 {
    15
}
fn default_quality() -> u32 {
    50
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_probe_interval_ms() -> u64 {
    1000
}
fn default_probe_timeout_ms() -> u64 {
    1000
}
fn default_settle_delay_ms() -> u64 {
    3000
}
fn default_state_interval_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_write_timeout_ms() -> u64 {
    5000
}
fn default_status_poll_ms() -> u64 {
    1000
}
fn default_unit_retry_ms() -> u64 {
    2000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_output() -> String {
    "stderr".to_string()
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: default_video_program(),
            script: default_video_script(),
            grayscale: false,
            fps: default_fps(),
            quality: default_quality(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            state_interval_ms: default_state_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            status_poll_ms: default_status_poll_ms(),
            unit_retry_ms: default_unit_retry_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
        }
    }
}

impl TimingConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn state_interval(&self) -> Duration {
        Duration::from_millis(self.state_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }

    pub fn unit_retry(&self) -> Duration {
        Duration::from_millis(self.unit_retry_ms)
    }
}

impl CloudConfig {
    /// `host:port` of the control endpoint
    pub fn control_address(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }

    /// `host:port` the watchdog probes
    pub fn probe_address(&self) -> String {
        format!(
            "{}:{}",
            self.host,
            self.probe_port.unwrap_or(self.control_port)
        )
    }
}

impl AgentConfig {
    /// Load and validate configuration from a TOML file
    ///
    /// # Example
    /// ```no_run
    /// use setu::config::AgentConfig;
    ///
    /// let config = AgentConfig::load("setu.toml")?;
    /// # Ok::<(), setu::Error>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("could not read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.unit.id.trim().is_empty() {
            return Err(Error::Config("unit.id must not be empty".into()));
        }
        if self.unit.max_speed.is_nan() || self.unit.max_speed <= 0.0 {
            return Err(Error::Config("unit.max_speed must be positive".into()));
        }
        if self.cloud.host.trim().is_empty() {
            return Err(Error::Config("cloud.host must not be empty".into()));
        }
        if self.cloud.control_port == 0 {
            return Err(Error::Config("cloud.control_port must not be 0".into()));
        }
        if self.video.enabled && self.cloud.video_port == 0 {
            return Err(Error::Config("cloud.video_port must not be 0".into()));
        }
        if !(1..=60).contains(&self.video.fps) {
            return Err(Error::Config(format!(
                "video.fps must be 1-60, got {}",
                self.video.fps
            )));
        }
        if !(1..=100).contains(&self.video.quality) {
            return Err(Error::Config(format!(
                "video.quality must be 1-100, got {}",
                self.video.quality
            )));
        }

        if !matches!(self.logging.output.as_str(), "stdout" | "stderr" | "file") {
            return Err(Error::Config(format!(
                "logging.output must be stdout, stderr or file, got {:?}",
                self.logging.output
            )));
        }

        let timing = &self.timing;
        for (name, value) in [
            ("probe_interval_ms", timing.probe_interval_ms),
            ("probe_timeout_ms", timing.probe_timeout_ms),
            ("state_interval_ms", timing.state_interval_ms),
            ("connect_timeout_ms", timing.connect_timeout_ms),
            ("write_timeout_ms", timing.write_timeout_ms),
            ("status_poll_ms", timing.status_poll_ms),
            ("unit_retry_ms", timing.unit_retry_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("timing.{} must not be 0", name)));
            }
        }

        Ok(())
    }

    /// Default config file inside the agent directory
    pub fn default_path(app_dir: &Path) -> PathBuf {
        app_dir.join("setu.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[unit]
id = "drone-01"

[cloud]
host = "127.0.0.1"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AgentConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.unit.id, "drone-01");
        assert_eq!(config.cloud.control_port, 8880);
        assert_eq!(config.cloud.max_reconnection_attempts, 20);
        assert_eq!(config.timing.state_interval(), Duration::from_secs(1));
        assert_eq!(config.timing.settle_delay(), Duration::from_secs(3));
        assert_eq!(config.timing.write_timeout(), Duration::from_secs(5));
        assert!(config.video.enabled);
        assert_eq!(config.video.script, "video_streamer.py");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[unit]
id = "drone-02"

[cloud]
host = "cloud.example.net"
control_port = 9000
video_port = 9001
max_reconnection_attempts = 5

[video]
grayscale = true
fps = 30
quality = 80
width = 320
height = 240

[timing]
settle_delay_ms = 100
state_interval_ms = 250

[logging]
level = "debug"
output = "file"
"#;
        let config = AgentConfig::from_toml(toml_content).unwrap();
        assert_eq!(config.cloud.control_address(), "cloud.example.net:9000");
        assert_eq!(config.cloud.probe_address(), "cloud.example.net:9000");
        assert_eq!(config.cloud.max_reconnection_attempts, 5);
        assert!(config.video.grayscale);
        assert_eq!(config.video.fps, 30);
        assert_eq!(config.timing.state_interval(), Duration::from_millis(250));
        assert_eq!(config.timing.probe_interval(), Duration::from_secs(1));
        assert_eq!(config.logging.output, "file");
    }

    #[test]
    fn test_probe_port_override() {
        let mut config = AgentConfig::from_toml(MINIMAL).unwrap();
        config.cloud.probe_port = Some(443);
        assert_eq!(config.cloud.probe_address(), "127.0.0.1:443");
        assert_eq!(config.cloud.control_address(), "127.0.0.1:8880");
    }

    #[test]
    fn test_missing_unit_section_fails() {
        let err = AgentConfig::from_toml("[cloud]\nhost = \"h\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validation() {
        let mut config = AgentConfig::from_toml(MINIMAL).unwrap();
        config.unit.id = "  ".into();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::from_toml(MINIMAL).unwrap();
        config.video.fps = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::from_toml(MINIMAL).unwrap();
        config.timing.state_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::from_toml(MINIMAL).unwrap();
        config.logging.output = "syslog".into();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::from_toml(MINIMAL).unwrap();
        config.timing.write_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::from_toml(MINIMAL).unwrap();
        config.timing.settle_delay_ms = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = AgentConfig::default_path(dir.path());
        fs::write(&path, MINIMAL).unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.cloud.host, "127.0.0.1");

        let missing = AgentConfig::load(dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(Error::Config(_))));
    }
}
