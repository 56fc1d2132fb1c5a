// Link budgets, serial ports, gait defaults
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::motion::gait::{GaitOptions, GaitStyleConfig};
use crate::motion::kinematics::{HIP_OFFSET_X, LegGeometry, Point};
use crate::protocol::packet::ChecksumRecovery;

// Poll iterations before a request counts as unanswered
pub const NODE_RETRY_BUDGET: u32 = 1000;
pub const SERVO_RETRY_BUDGET: u32 = 100;

// All buses run at 1 Mbps
pub const NODE_BAUD: u32 = 1_000_000;
pub const SERVO_BAUD: u32 = 1_000_000;

// Read timeout of a single serial call
pub const SERIAL_TIMEOUT: Duration = Duration::from_millis(10);

// Default serial devices
pub const SERVO_RIGHT_PORT: &str = "/dev/ttyUSB0";
pub const SERVO_LEFT_PORT: &str = "/dev/ttyUSB1";
pub const COM3_PORT: &str = "/dev/ttyUSB2";
pub const COM1_PORT: &str = "/dev/ttyUSB3";

// Gait timing
pub const LIVENESS_ATTEMPTS: u32 = 200;
pub const LIVENESS_PAUSE_MS: u64 = 50;
pub const INIT_PAUSE_MS: u64 = 400;
pub const PHASE_PAUSE_MS: u64 = 50;
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

// Slave loop backs off this long when nothing arrived
pub const SLAVE_IDLE_PAUSE_MS: u64 = 1;

// Four-point gait, body coordinates of the middle-right leg (mm)
pub const FOUR_POINT_FRONT_DOWN: Point = Point::new(95.35293 + HIP_OFFSET_X, 55.05204, -129.10408);
pub const FOUR_POINT_FRONT_UP: Point = Point::new(150.59391 + HIP_OFFSET_X, 86.94544, -52.89087);
pub const FOUR_POINT_BACK_UP: Point = Point::new(150.59391 + HIP_OFFSET_X, -86.94544, -52.89087);
pub const FOUR_POINT_BACK_DOWN: Point = Point::new(95.35293 + HIP_OFFSET_X, -55.05204, -129.10408);

// Tripod gait stride
pub const TRIPOD_ORIGIN: Point = Point::new(110.0 + HIP_OFFSET_X, 0.0, -110.0);
pub const TRIPOD_DIRECTION: Point = Point::new(0.0, 1.0, 0.0);
pub const TRIPOD_HALF_STRIDE: f64 = 40.0;
pub const TRIPOD_LIFT_HEIGHT: f64 = 40.0;
pub const TRIPOD_INCREMENT: f64 = 5.0;

/// Error types for loading the configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Link tuning shared by every node
///
/// `servo_echo` is off by default. The stock servo adapters wire TX and RX
/// separately, so nothing comes back on the receive line. Turning echo
/// suppression on for such a bus discards the first bytes of every status
/// reply as if they were the echo, and every servo then looks dead. Set it
/// only for a true single-wire half-duplex bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub node_retry_budget: u32,
    pub servo_retry_budget: u32,
    pub node_baud: u32,
    pub servo_baud: u32,
    pub serial_timeout_ms: u64,
    /// The servo buses read back their own transmissions; off unless wired single-wire
    pub servo_echo: bool,
    pub checksum_recovery: ChecksumRecovery,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            node_retry_budget: NODE_RETRY_BUDGET,
            servo_retry_budget: SERVO_RETRY_BUDGET,
            node_baud: NODE_BAUD,
            servo_baud: SERVO_BAUD,
            serial_timeout_ms: SERIAL_TIMEOUT.as_millis() as u64,
            servo_echo: false,
            checksum_recovery: ChecksumRecovery::default(),
        }
    }
}

/// Serial devices of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub servo_right: String,
    pub servo_left: String,
    /// Link to slave A, master only
    pub com1: Option<String>,
    /// Link to slave B on the master, to the master on a slave
    pub com3: String,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            servo_right: SERVO_RIGHT_PORT.to_string(),
            servo_left: SERVO_LEFT_PORT.to_string(),
            com1: Some(COM1_PORT.to_string()),
            com3: COM3_PORT.to_string(),
        }
    }
}

/// Everything a node needs at boot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub geometry: LegGeometry,
    pub links: LinkConfig,
    pub ports: PortConfig,
    pub gait: GaitOptions,
    pub style: GaitStyleConfig,
}

impl RobotConfig {
    /// Load from a JSON file; missing fields keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Json {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn serial_timeout(&self) -> Duration {
        Duration::from_millis(self.links.serial_timeout_ms)
    }
}
