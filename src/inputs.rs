// Debounced digital inputs: e-stop and the four limit switches
//
// Inputs byte layout (shared by the ASCII @READ reply and the binary DI opcode):
// bit 3 = e-stop, bits 4..7 = limit switches of axes 1, 2, 3 and 6.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{AXIS_BASE, AXIS_ELBOW, AXIS_GRIPPER, AXIS_SHOULDER};

/// Axes fitted with a limit switch, in inputs-byte order
pub const LIMIT_AXES: [usize; 4] = [AXIS_BASE, AXIS_SHOULDER, AXIS_ELBOW, AXIS_GRIPPER];

const ESTOP_BIT: u8 = 3;
const FIRST_LIMIT_BIT: u8 = 4;

/// Raw (undebounced) levels as sampled from the pins
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInputs {
    pub estop: bool,
    /// Limit switches of axes 1, 2, 3 and 6
    pub limits: [bool; 4],
}

/// Accepts a new level only after it has held for the debounce time
#[derive(Debug, Clone)]
pub struct Debouncer {
    stable: bool,
    candidate: bool,
    since: Duration,
}

impl Debouncer {
    pub fn new(initial: bool) -> Self {
        Self {
            stable: initial,
            candidate: initial,
            since: Duration::ZERO,
        }
    }

    /// Feed one sample; returns true when the debounced level changed
    pub fn update(&mut self, raw: bool, now: Duration, debounce: Duration) -> bool {
        if raw != self.candidate {
            self.candidate = raw;
            self.since = now;
        }
        if self.candidate != self.stable && now.saturating_sub(self.since) >= debounce {
            self.stable = self.candidate;
            return true;
        }
        false
    }

    pub fn is_pressed(&self) -> bool {
        self.stable
    }
}

#[derive(Debug, Clone)]
pub struct InputPanel {
    debounce: Duration,
    estop: Debouncer,
    limits: [Debouncer; 4],
}

impl InputPanel {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            estop: Debouncer::new(false),
            limits: std::array::from_fn(|_| Debouncer::new(false)),
        }
    }

    pub fn update(&mut self, raw: &RawInputs, now: Duration) {
        if self.estop.update(raw.estop, now, self.debounce) {
            if self.estop.is_pressed() {
                warn!("E-STOP pressed");
            } else {
                warn!("E-STOP released");
            }
        }
        for (i, debouncer) in self.limits.iter_mut().enumerate() {
            if debouncer.update(raw.limits[i], now, self.debounce) {
                debug!(
                    "Limit switch of axis {} {}",
                    LIMIT_AXES[i] + 1,
                    if debouncer.is_pressed() { "pressed" } else { "released" }
                );
            }
        }
    }

    pub fn estop_pressed(&self) -> bool {
        self.estop.is_pressed()
    }

    /// Debounced switch of an axis, `None` for axes without one
    pub fn limit_for_axis(&self, axis: usize) -> Option<bool> {
        LIMIT_AXES
            .iter()
            .position(|&a| a == axis)
            .map(|i| self.limits[i].is_pressed())
    }

    pub fn state_byte(&self) -> u8 {
        let mut byte = (self.estop.is_pressed() as u8) << ESTOP_BIT;
        for (i, debouncer) in self.limits.iter().enumerate() {
            byte |= (debouncer.is_pressed() as u8) << (FIRST_LIMIT_BIT + i as u8);
        }
        byte
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_debouncer_ignores_short_glitch() {
        let mut d = Debouncer::new(false);
        let debounce = Duration::from_millis(100);
        assert!(!d.update(true, MS * 10, debounce));
        assert!(!d.update(false, MS * 50, debounce));
        assert!(!d.update(false, MS * 500, debounce));
        assert!(!d.is_pressed());
    }

    #[test]
    fn test_debouncer_accepts_stable_level() {
        let mut d = Debouncer::new(false);
        let debounce = Duration::from_millis(100);
        assert!(!d.update(true, MS * 10, debounce));
        assert!(!d.update(true, MS * 109, debounce));
        assert!(d.update(true, MS * 110, debounce));
        assert!(d.is_pressed());
    }

    #[test]
    fn test_state_byte_layout() {
        let mut panel = InputPanel::new(Duration::ZERO);
        panel.update(
            &RawInputs {
                estop: true,
                limits: [true, false, false, true],
            },
            MS,
        );
        assert_eq!(panel.state_byte(), 0b1001_1000);
        assert_eq!(panel.limit_for_axis(AXIS_BASE), Some(true));
        assert_eq!(panel.limit_for_axis(AXIS_GRIPPER), Some(true));
        assert_eq!(panel.limit_for_axis(AXIS_SHOULDER), Some(false));
        assert_eq!(panel.limit_for_axis(3), None);
        assert!(panel.estop_pressed());
    }
}
