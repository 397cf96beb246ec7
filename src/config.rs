// Timeouts, topics, axis, homing, protocol and teleop configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Runtime loop frequency (one motion step per axis at most per tick)
pub const LOOP_HZ: u64 = 1000;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(3000);

// Publish actuation/health every N ticks (50 Hz at the default loop rate)
pub const STATUS_EVERY_TICKS: u64 = 20;

// Zenoh topics
pub const TOPIC_CMD_SUPER: &str = "robko/cmd/super"; // binary requests
pub const TOPIC_REPLY_SUPER: &str = "robko/reply/super"; // binary responses
pub const TOPIC_CMD_TELEOP: &str = "robko/cmd/teleop"; // gamepad samples
pub const TOPIC_IO_INPUTS: &str = "robko/io/inputs"; // raw limit/e-stop levels
pub const TOPIC_RT_ARM: &str = "robko/rt/arm"; // actuation
pub const TOPIC_HEALTH: &str = "robko/state/health"; // health status

// Serial port carrying the ASCII line protocol
pub const SERIAL_PORT: &str = "/dev/ttyUSB0";
pub const SERIAL_BAUDRATE: u32 = 9600;

// Enable the serial line protocol (set to false when no terminal is attached)
pub const SERIAL_ENABLED: bool = true;

// Axes
pub const NUM_AXES: usize = 6;
pub const AXIS_NAMES: [&str; NUM_AXES] = [
    "Base",
    "Shoulder",
    "Elbow",
    "LeftDiff",
    "RightDiff",
    "Gripper",
];
pub const AXIS_BASE: usize = 0;
pub const AXIS_SHOULDER: usize = 1;
pub const AXIS_ELBOW: usize = 2;
pub const AXIS_LEFT_DIFF: usize = 3;
pub const AXIS_RIGHT_DIFF: usize = 4;
pub const AXIS_GRIPPER: usize = 5;

pub const DEFAULT_MAX_SPEED: f32 = 100.0; // steps/s
pub const DEFAULT_ACCEL: f32 = 75.0; // steps/s^2

// Elbow, right differential and gripper drivers are wired reversed
pub const INVERTED_AXES: [bool; NUM_AXES] = [false, false, true, false, true, true];

// Limit switch / e-stop debounce
pub const DEBOUNCE_TIME: Duration = Duration::from_millis(100);

// Homing
pub const FAST_FORWARD_SPS: f32 = 50.0;
pub const SLOW_BACKWARD_SPS: f32 = 20.0;
pub const HOMING_TIMEOUT: Duration = Duration::from_millis(17000);
pub const GRIPPER_OPEN_POSITION: i32 = 300;
pub const GRIPPER_OPEN_SPEED: f32 = 40.0;

// ASCII line protocol
pub const LINE_LENGTH: usize = 128;
pub const MAX_RESPONSE_SIZE: usize = 64;

// Teleop
pub const TELEOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const TELEOP_SLEEP_COUNT: u32 = 100; // 10 s at 100 ms per poll
pub const TELEOP_STALE_AFTER: Duration = Duration::from_millis(500);
pub const STICK_MIN: i32 = -128;
pub const STICK_MAX: i32 = 127;
pub const TRIGGER_MAX: i32 = 255;
pub const PRC_MIN: i32 = -100;
pub const PRC_MAX: i32 = 100;
pub const DEAD_SPACE: i32 = 10; // percent

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Per-axis stepper parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    pub max_speed: f32,
    pub acceleration: f32,
    pub inverted: bool,
}

/// Where an axis is parked once its zero reference is found
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reposition {
    pub position: i32,
    pub speed: f32,
}

/// One axis of a homing sequence. Speeds are signed (sign = wiring convention).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomingAxisConfig {
    pub axis: usize,
    pub approach_speed: f32,
    pub release_speed: f32,
    pub approach_timeout_ms: u64,
    #[serde(default)]
    pub release_timeout_ms: Option<u64>,
    #[serde(default)]
    pub reposition: Option<Reposition>,
}

impl HomingAxisConfig {
    pub fn approach_timeout(&self) -> Duration {
        Duration::from_millis(self.approach_timeout_ms)
    }

    pub fn release_timeout(&self) -> Option<Duration> {
        self.release_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomingConfig {
    /// Full sequence (base, shoulder, elbow, gripper)
    pub full: Vec<HomingAxisConfig>,
    /// Gripper-only sequence used by the `@CLOSE` line command
    pub gripper: Vec<HomingAxisConfig>,
    /// Feed the watchdog on every tick of an active homing run
    pub feeds_watchdog: bool,
}

impl Default for HomingConfig {
    fn default() -> Self {
        let timeout_ms = HOMING_TIMEOUT.as_millis() as u64;
        let seek = |axis: usize, approach_sign: f32| HomingAxisConfig {
            axis,
            approach_speed: approach_sign * FAST_FORWARD_SPS,
            release_speed: -approach_sign * SLOW_BACKWARD_SPS,
            approach_timeout_ms: timeout_ms,
            release_timeout_ms: None,
            reposition: None,
        };

        let gripper = seek(AXIS_GRIPPER, -1.0);
        let gripper_open = HomingAxisConfig {
            reposition: Some(Reposition {
                position: GRIPPER_OPEN_POSITION,
                speed: GRIPPER_OPEN_SPEED,
            }),
            ..gripper.clone()
        };

        Self {
            full: vec![
                seek(AXIS_BASE, -1.0),
                seek(AXIS_SHOULDER, 1.0),
                seek(AXIS_ELBOW, 1.0),
                gripper_open,
            ],
            gripper: vec![gripper],
            feeds_watchdog: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub timeout_ms: u64,
    /// Re-enable drivers when a feed revives an expired watchdog
    pub auto_reenable_on_feed: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_ms: CMD_TIMEOUT.as_millis() as u64,
            auto_reenable_on_feed: true,
        }
    }
}

/// Deadzone in percent, independent for each direction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Deadzone {
    pub positive: i32,
    pub negative: i32,
}

impl Deadzone {
    pub const fn symmetric(percent: i32) -> Self {
        Self {
            positive: percent,
            negative: percent,
        }
    }

    /// True when `value` is outside the dead band (threshold inclusive)
    pub fn passes(&self, value: i32) -> bool {
        if value > 0 {
            value >= self.positive
        } else if value < 0 {
            -value >= self.negative
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeleopConfig {
    pub poll_interval_ms: u64,
    pub sleep_count: u32,
    pub left_x: Deadzone,
    pub left_y: Deadzone,
    pub right_x: Deadzone,
    pub right_y: Deadzone,
    /// Gates applied to the mixed wrist outputs, not to the raw stick
    pub diff_left: Deadzone,
    pub diff_right: Deadzone,
    pub trigger: Deadzone,
}

impl Default for TeleopConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: TELEOP_POLL_INTERVAL.as_millis() as u64,
            sleep_count: TELEOP_SLEEP_COUNT,
            left_x: Deadzone::symmetric(DEAD_SPACE),
            left_y: Deadzone::symmetric(DEAD_SPACE),
            right_x: Deadzone::symmetric(DEAD_SPACE),
            right_y: Deadzone::symmetric(DEAD_SPACE),
            diff_left: Deadzone::symmetric(DEAD_SPACE),
            diff_right: Deadzone::symmetric(DEAD_SPACE),
            trigger: Deadzone::symmetric(DEAD_SPACE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsciiConfig {
    pub line_length: usize,
    pub echo: bool,
    /// Report rejected motion commands instead of answering OK
    pub strict_replies: bool,
}

impl Default for AsciiConfig {
    fn default() -> Self {
        Self {
            line_length: LINE_LENGTH,
            echo: true,
            strict_replies: false,
        }
    }
}

/// Complete controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub tick_hz: u64,
    pub axes: [AxisConfig; NUM_AXES],
    pub homing: HomingConfig,
    pub watchdog: WatchdogConfig,
    pub teleop: TeleopConfig,
    pub ascii: AsciiConfig,
    pub debounce_ms: u64,
    /// Honour the e-stop input as a hard motion interlock
    pub estop_enabled: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_hz: LOOP_HZ,
            axes: INVERTED_AXES.map(|inverted| AxisConfig {
                max_speed: DEFAULT_MAX_SPEED,
                acceleration: DEFAULT_ACCEL,
                inverted,
            }),
            homing: HomingConfig::default(),
            watchdog: WatchdogConfig::default(),
            teleop: TeleopConfig::default(),
            ascii: AsciiConfig::default(),
            debounce_ms: DEBOUNCE_TIME.as_millis() as u64,
            estop_enabled: true,
        }
    }
}

impl ControllerConfig {
    /// Load a JSON config file; missing fields fall back to the defaults above
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_hz == 0 || self.tick_hz > 1_000_000 {
            return Err(ConfigError::Invalid("tick_hz must be in 1..=1000000".into()));
        }
        for (i, axis) in self.axes.iter().enumerate() {
            if axis.max_speed <= 0.0 || axis.acceleration <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "axis {} needs positive max_speed and acceleration",
                    i + 1
                )));
            }
        }
        for step in self.homing.full.iter().chain(&self.homing.gripper) {
            if step.axis >= NUM_AXES {
                return Err(ConfigError::Invalid(format!(
                    "homing axis index {} out of range",
                    step.axis
                )));
            }
        }
        if self.ascii.line_length < 2 {
            return Err(ConfigError::Invalid("line_length too small".into()));
        }
        if self.teleop.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "teleop poll interval must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.tick_hz)
    }

    /// Number of whole ticks covering `duration` (at least one)
    pub fn ticks_for(&self, duration: Duration) -> u32 {
        let period = self.tick_period().as_micros().max(1);
        let ticks = duration.as_micros().div_ceil(period);
        ticks.clamp(1, u32::MAX as u128) as u32
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_period(), Duration::from_millis(1));
        assert_eq!(config.ticks_for(CMD_TIMEOUT), 3000);
    }

    #[test]
    fn test_default_homing_sequences() {
        let homing = HomingConfig::default();
        let axes: Vec<usize> = homing.full.iter().map(|s| s.axis).collect();
        assert_eq!(axes, vec![AXIS_BASE, AXIS_SHOULDER, AXIS_ELBOW, AXIS_GRIPPER]);
        // Only the gripper is parked after the full run
        assert!(homing.full[..3].iter().all(|s| s.reposition.is_none()));
        assert!(homing.full[3].reposition.is_some());
        assert_eq!(homing.gripper.len(), 1);
        assert!(homing.gripper[0].reposition.is_none());
        // Release always runs opposite to approach
        for step in &homing.full {
            assert!(step.approach_speed * step.release_speed < 0.0);
        }
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ControllerConfig =
            serde_json::from_str(r#"{ "tick_hz": 500, "watchdog": { "timeout_ms": 1000 } }"#)
                .unwrap();
        assert_eq!(config.tick_hz, 500);
        assert_eq!(config.watchdog.timeout_ms, 1000);
        assert!(config.watchdog.auto_reenable_on_feed);
        assert_eq!(config.ascii.line_length, LINE_LENGTH);
        assert_eq!(config.ticks_for(Duration::from_millis(1000)), 500);
    }

    #[test]
    fn test_invalid_axis_rejected() {
        let mut config = ControllerConfig::default();
        config.axes[2].max_speed = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ControllerConfig::default();
        config.homing.gripper[0].axis = 9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deadzone_threshold_inclusive() {
        let dz = Deadzone {
            positive: 10,
            negative: 20,
        };
        assert!(!dz.passes(0));
        assert!(!dz.passes(9));
        assert!(dz.passes(10));
        assert!(!dz.passes(-19));
        assert!(dz.passes(-20));
    }
}
