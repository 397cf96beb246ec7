// Gamepad teleoperation
//
// Sticks map to percent speeds, polled at a fixed interval:
// - left X -> base, left Y -> shoulder
// - R1 held: right stick mixes into the differential pair (pitch +/- roll)
// - R1 released: right Y drives the elbow, gripper mirrors it inverted
// - L2 opens the gripper, L1 flips it to closing
// - Cross disables, Circle enables
// A local sleep counter powers the arm down after a quiet spell.

use tracing::{debug, info};

use crate::config::{
    Deadzone, TeleopConfig, AXIS_BASE, AXIS_ELBOW, AXIS_GRIPPER, AXIS_LEFT_DIFF,
    AXIS_RIGHT_DIFF, AXIS_SHOULDER, NUM_AXES, PRC_MAX, PRC_MIN, STICK_MAX, STICK_MIN,
    TRIGGER_MAX,
};
use crate::messages::GamepadSample;

/// Integer linear re-mapping, truncating like the classic Arduino `map`
pub fn arduino_map(x: i32, in_min: i32, in_max: i32, out_min: i32, out_max: i32) -> i32 {
    if in_max == in_min {
        return out_min;
    }
    (x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
}

fn limit(value: i32, max_speed: f32) -> i32 {
    let max = max_speed.abs() as i32;
    value.clamp(-max, max)
}

fn gate(value: i32, deadzone: &Deadzone) -> i32 {
    if deadzone.passes(value) { value } else { 0 }
}

/// Per-axis speeds (steps/s) for one gamepad sample
pub fn map_sample(
    sample: &GamepadSample,
    config: &TeleopConfig,
    max_speeds: &[f32; NUM_AXES],
) -> [i32; NUM_AXES] {
    let mut speeds = [0i32; NUM_AXES];

    let base = arduino_map(sample.left_x as i32, STICK_MIN, STICK_MAX, PRC_MAX, PRC_MIN);
    speeds[AXIS_BASE] = gate(limit(base, max_speeds[AXIS_BASE]), &config.left_x);

    let shoulder = arduino_map(sample.left_y as i32, STICK_MIN, STICK_MAX, PRC_MIN, PRC_MAX);
    speeds[AXIS_SHOULDER] = gate(limit(shoulder, max_speeds[AXIS_SHOULDER]), &config.left_y);

    if sample.r1 {
        let roll = arduino_map(sample.right_x as i32, STICK_MIN, STICK_MAX, PRC_MIN, PRC_MAX);
        let pitch = arduino_map(sample.right_y as i32, STICK_MIN, STICK_MAX, PRC_MIN, PRC_MAX);
        let left = limit(pitch + roll, max_speeds[AXIS_LEFT_DIFF]);
        let right = limit(pitch - roll, max_speeds[AXIS_RIGHT_DIFF]);
        speeds[AXIS_LEFT_DIFF] = gate(left, &config.diff_left);
        speeds[AXIS_RIGHT_DIFF] = -gate(right, &config.diff_right);
    } else {
        let elbow = arduino_map(sample.right_y as i32, STICK_MIN, STICK_MAX, PRC_MAX, PRC_MIN);
        let elbow = gate(limit(elbow, max_speeds[AXIS_ELBOW]), &config.right_y);
        speeds[AXIS_ELBOW] = -elbow;
        speeds[AXIS_GRIPPER] = limit(elbow, max_speeds[AXIS_GRIPPER]);
    }

    let mut grip = arduino_map(sample.l2 as i32, 0, TRIGGER_MAX, 0, PRC_MAX);
    if sample.l1 {
        grip = -grip;
    }
    if config.trigger.passes(grip) {
        speeds[AXIS_GRIPPER] = limit(grip, max_speeds[AXIS_GRIPPER]);
    }

    speeds
}

/// What one poll asks the controller to do, applied in field order
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TeleopOutput {
    /// Sleep counter ran out while connected
    pub sleep: bool,
    /// Enable/disable button pressed
    pub enable: Option<bool>,
    /// Continuous speeds to apply
    pub speeds: Option<[f32; NUM_AXES]>,
    /// Operator activity; feeds the watchdog
    pub active: bool,
}

pub struct TeleopMapper {
    config: TeleopConfig,
    poll_ticks: u32,
    countdown: u32,
    sleep_counter: u32,
    last_speeds: [i32; NUM_AXES],
}

impl TeleopMapper {
    pub fn new(config: TeleopConfig, poll_ticks: u32) -> Self {
        Self {
            poll_ticks: poll_ticks.max(1),
            countdown: poll_ticks.max(1),
            sleep_counter: config.sleep_count,
            config,
            last_speeds: [0; NUM_AXES],
        }
    }

    pub fn sleep_counter(&self) -> u32 {
        self.sleep_counter
    }

    /// Call once per controller tick; returns `Some` on poll ticks
    pub fn tick(
        &mut self,
        sample: Option<&GamepadSample>,
        motors_enabled: bool,
        max_speeds: &[f32; NUM_AXES],
    ) -> Option<TeleopOutput> {
        self.countdown -= 1;
        if self.countdown > 0 {
            return None;
        }
        self.countdown = self.poll_ticks;
        Some(self.poll(sample, motors_enabled, max_speeds))
    }

    /// One polling interval
    pub fn poll(
        &mut self,
        sample: Option<&GamepadSample>,
        motors_enabled: bool,
        max_speeds: &[f32; NUM_AXES],
    ) -> TeleopOutput {
        let mut out = TeleopOutput::default();

        let Some(sample) = sample.filter(|s| s.connected) else {
            // Gamepad gone: stop anything it was driving
            if self.last_speeds.iter().any(|&s| s != 0) {
                debug!("Gamepad disconnected, stopping teleop axes");
                self.last_speeds = [0; NUM_AXES];
                out.speeds = Some([0.0; NUM_AXES]);
            }
            return out;
        };

        if self.sleep_counter == 0 {
            if motors_enabled {
                info!("Teleop idle, going to sleep");
                out.sleep = true;
            }
        } else {
            self.sleep_counter -= 1;
        }

        if sample.cross {
            out.enable = Some(false);
        }
        if sample.circle {
            out.enable = Some(true);
            out.active = true;
            self.sleep_counter = self.config.sleep_count;
        }

        let enabled = match out.enable {
            Some(on) => on,
            None => motors_enabled && !out.sleep,
        };
        if !enabled {
            return out;
        }

        let speeds = map_sample(sample, &self.config, max_speeds);
        let moving = speeds.iter().any(|&s| s != 0);
        if moving {
            self.sleep_counter = self.config.sleep_count;
            out.active = true;
        }
        if moving || self.last_speeds.iter().any(|&s| s != 0) {
            out.speeds = Some(speeds.map(|s| s as f32));
        }
        self.last_speeds = speeds;
        out
    }
}
