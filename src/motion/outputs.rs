// Stepper driver outputs
//
// The motion engine talks to the pin layer only through this trait:
// one enable line for all drivers and one step pulse per axis.

use serde::Serialize;
use tracing::{debug, trace};

use crate::config::NUM_AXES;

/// Narrow interface to the stepper drivers
pub trait StepperOutputs: Send {
    /// Drive the shared enable line (true = powered)
    fn set_enabled(&mut self, on: bool);

    /// Emit one step pulse; `forward` is the physical direction
    fn step(&mut self, axis: usize, forward: bool);

    /// Net physical pulses per axis, when the implementation tracks them
    fn pulse_counts(&self) -> Option<[i64; NUM_AXES]> {
        None
    }
}

/// Output stage that records the enable line and net pulses per axis
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PulseCounter {
    pub enabled: bool,
    pub pulses: [i64; NUM_AXES],
    pub total_pulses: u64,
}

impl PulseCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StepperOutputs for PulseCounter {
    fn set_enabled(&mut self, on: bool) {
        if self.enabled != on {
            debug!("Driver enable line -> {}", if on { "ON" } else { "OFF" });
        }
        self.enabled = on;
    }

    fn step(&mut self, axis: usize, forward: bool) {
        if axis >= NUM_AXES {
            return;
        }
        trace!("Step axis {} {}", axis + 1, if forward { "+" } else { "-" });
        self.pulses[axis] += if forward { 1 } else { -1 };
        self.total_pulses += 1;
    }

    fn pulse_counts(&self) -> Option<[i64; NUM_AXES]> {
        Some(self.pulses)
    }
}

/// Pulse counter shared with a test for inspection
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedPulseCounter(pub std::sync::Arc<std::sync::Mutex<PulseCounter>>);

#[cfg(test)]
impl SharedPulseCounter {
    pub fn pulses(&self) -> [i64; NUM_AXES] {
        self.0.lock().unwrap().pulses
    }

    pub fn total(&self) -> u64 {
        self.0.lock().unwrap().total_pulses
    }

    pub fn enabled(&self) -> bool {
        self.0.lock().unwrap().enabled
    }
}

#[cfg(test)]
impl StepperOutputs for SharedPulseCounter {
    fn set_enabled(&mut self, on: bool) {
        self.0.lock().unwrap().set_enabled(on);
    }

    fn step(&mut self, axis: usize, forward: bool) {
        self.0.lock().unwrap().step(axis, forward);
    }
}
