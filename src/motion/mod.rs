// Motion module for the Robko 01 arm
//
// Provides:
// - Per-axis stepper profile (positioning with acceleration, continuous speed)
// - Six-axis motion engine with enable/stop/zero and busy tracking
// - Stepper driver output interface

mod axis;
mod engine;
mod outputs;

pub use axis::{Axis, AxisAdvance};
pub use engine::{AxisSnapshot, MotionEngine, MotionState, OperationMode};
pub use outputs::{PulseCounter, StepperOutputs};

#[cfg(test)]
pub(crate) use outputs::SharedPulseCounter;

/// Why a motion command was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MotionError {
    #[error("Drivers are disabled")]
    Disabled,

    #[error("Axes still moving (busy mask 0b{mask:06b})")]
    Busy { mask: u8 },

    #[error("No such axis: {0}")]
    InvalidAxis(usize),
}
