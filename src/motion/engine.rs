// Six-axis motion engine
//
// Owns the axes, the global operation mode and the driver outputs. Every
// command setter checks its preconditions here; the controller decides
// when `tick` runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::axis::Axis;
use super::outputs::StepperOutputs;
use super::MotionError;
use crate::config::{AxisConfig, AXIS_NAMES, NUM_AXES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    #[default]
    None,
    Positioning,
    Speed,
}

/// Global motion flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MotionState {
    pub operation_mode: OperationMode,
    pub motors_enabled: bool,
    /// Bit i set while axis i still has steps to go
    pub busy_mask: u8,
    /// Hard interlock: the advance step is skipped while set
    pub safety_stop_active: bool,
}

/// Position and speed of one axis
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisSnapshot {
    pub position: i32,
    pub speed: f32,
}

pub struct MotionEngine {
    axes: [Axis; NUM_AXES],
    state: MotionState,
    outputs: Box<dyn StepperOutputs>,
}

impl MotionEngine {
    /// Create the engine with drivers powered off
    pub fn new(configs: &[AxisConfig; NUM_AXES], mut outputs: Box<dyn StepperOutputs>) -> Self {
        outputs.set_enabled(false);
        let axes = std::array::from_fn(|i| Axis::new(i, &configs[i]));
        Self {
            axes,
            state: MotionState::default(),
            outputs,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn motors_enabled(&self) -> bool {
        self.state.motors_enabled
    }

    pub fn busy_mask(&self) -> u8 {
        self.state.busy_mask
    }

    pub fn operation_mode(&self) -> OperationMode {
        self.state.operation_mode
    }

    pub fn axis(&self, index: usize) -> Option<&Axis> {
        self.axes.get(index)
    }

    pub fn axes(&self) -> &[Axis; NUM_AXES] {
        &self.axes
    }

    pub fn outputs(&self) -> &dyn StepperOutputs {
        self.outputs.as_ref()
    }

    fn check_enabled(&self) -> Result<(), MotionError> {
        if self.state.motors_enabled {
            Ok(())
        } else {
            Err(MotionError::Disabled)
        }
    }

    fn check_ready(&self) -> Result<(), MotionError> {
        self.check_enabled()?;
        if self.state.busy_mask != 0 {
            return Err(MotionError::Busy {
                mask: self.state.busy_mask,
            });
        }
        Ok(())
    }

    fn check_axis(index: usize) -> Result<(), MotionError> {
        if index < NUM_AXES {
            Ok(())
        } else {
            Err(MotionError::InvalidAxis(index))
        }
    }

    /// Switch to positioning; axes coming out of speed mode hold where they are
    fn enter_positioning(&mut self) {
        if self.state.operation_mode != OperationMode::Positioning {
            for axis in &mut self.axes {
                axis.halt();
            }
            self.state.operation_mode = OperationMode::Positioning;
        }
    }

    fn mark_busy_from_targets(&mut self) {
        let mut mask = 0u8;
        for axis in &self.axes {
            if axis.distance_to_go() != 0 {
                mask |= 1 << axis.id();
            }
        }
        self.state.busy_mask = mask;
    }

    /// Absolute move; axes already at their target are left untouched
    pub fn set_absolute(
        &mut self,
        targets: [i32; NUM_AXES],
        speeds: [f32; NUM_AXES],
    ) -> Result<(), MotionError> {
        self.check_ready()?;
        self.enter_positioning();
        for (i, axis) in self.axes.iter_mut().enumerate() {
            if axis.current_position() != targets[i] {
                axis.move_to(targets[i], speeds[i]);
            }
        }
        self.mark_busy_from_targets();
        debug!("Move absolute to {:?}", targets);
        Ok(())
    }

    /// Relative move, deltas are added to the current targets
    pub fn set_relative(
        &mut self,
        deltas: [i32; NUM_AXES],
        speeds: [f32; NUM_AXES],
    ) -> Result<(), MotionError> {
        self.check_ready()?;
        self.enter_positioning();
        for (i, axis) in self.axes.iter_mut().enumerate() {
            axis.move_by(deltas[i], speeds[i]);
        }
        self.mark_busy_from_targets();
        debug!("Move relative by {:?}", deltas);
        Ok(())
    }

    /// Continuous speed on all axes; never busy-gated
    pub fn set_continuous_speed(&mut self, speeds: [f32; NUM_AXES]) -> Result<(), MotionError> {
        self.check_enabled()?;
        self.state.operation_mode = OperationMode::Speed;
        for (i, axis) in self.axes.iter_mut().enumerate() {
            axis.set_speed(speeds[i]);
        }
        self.state.busy_mask = 0;
        Ok(())
    }

    /// Continuous speed on a single axis, others keep theirs
    pub fn set_axis_speed(&mut self, index: usize, speed: f32) -> Result<(), MotionError> {
        Self::check_axis(index)?;
        self.check_enabled()?;
        if self.state.operation_mode != OperationMode::Speed {
            // Entering speed mode from a positioning move: park the others
            for axis in &mut self.axes {
                axis.halt();
            }
            self.state.operation_mode = OperationMode::Speed;
        }
        self.axes[index].set_speed(speed);
        self.state.busy_mask = 0;
        Ok(())
    }

    /// Positioning move of a single axis, others hold position
    pub fn move_axis_to(&mut self, index: usize, target: i32, speed: f32) -> Result<(), MotionError> {
        Self::check_axis(index)?;
        self.check_enabled()?;
        self.enter_positioning();
        self.axes[index].move_to(target, speed);
        self.mark_busy_from_targets();
        Ok(())
    }

    /// Power the drivers up or down
    ///
    /// Disabling zeroes every axis speed. Enabling never touches speeds or
    /// targets, so an interrupted positioning move resumes. The operation
    /// mode is kept in both directions.
    pub fn enable(&mut self, on: bool) {
        if on {
            self.outputs.set_enabled(true);
            if !self.state.motors_enabled {
                info!("Drivers enabled");
            }
        } else {
            self.outputs.set_enabled(false);
            for axis in &mut self.axes {
                axis.cut_power();
            }
            if self.state.motors_enabled {
                info!("Drivers disabled");
            }
        }
        self.state.motors_enabled = on;
    }

    /// Soft stop: speeds to zero, outstanding distance dropped
    pub fn stop(&mut self) {
        for axis in &mut self.axes {
            axis.halt();
        }
        self.state.busy_mask = 0;
        debug!("Soft stop");
    }

    /// Redefine all positions as zero; the caller guarantees the arm is idle
    pub fn zero(&mut self) {
        for axis in &mut self.axes {
            axis.set_current_position(0);
        }
        self.state.busy_mask = 0;
        debug!("All positions cleared");
    }

    pub fn zero_axis(&mut self, index: usize) -> Result<(), MotionError> {
        Self::check_axis(index)?;
        self.axes[index].set_current_position(0);
        self.state.busy_mask &= !(1 << index);
        Ok(())
    }

    pub fn set_safety_stop(&mut self, active: bool) {
        if active != self.state.safety_stop_active {
            if active {
                warn!("Safety stop engaged, motion advance suspended");
            } else {
                info!("Safety stop released");
            }
        }
        self.state.safety_stop_active = active;
    }

    pub fn set_limit_switch(&mut self, index: usize, pressed: bool) {
        if let Some(axis) = self.axes.get_mut(index) {
            axis.set_limit_switch(pressed);
        }
    }

    /// Advance every axis by one tick of `dt`
    pub fn tick(&mut self, dt: Duration) {
        if !self.state.motors_enabled || self.state.safety_stop_active {
            return;
        }

        let dt = dt.as_secs_f32();
        let mode = self.state.operation_mode;
        let mut mask = 0u8;
        for axis in &mut self.axes {
            let advance = match mode {
                OperationMode::Positioning => axis.run_to_target(dt),
                OperationMode::Speed => axis.run_speed(dt),
                OperationMode::None => continue,
            };
            if advance.busy {
                mask |= 1 << axis.id();
            }
            if let Some(forward) = advance.step {
                self.outputs.step(axis.id(), forward != axis.is_inverted());
            }
        }
        self.state.busy_mask = mask;
    }

    pub fn snapshot(&self) -> [AxisSnapshot; NUM_AXES] {
        self.axes.each_ref().map(|axis| AxisSnapshot {
            position: axis.current_position(),
            speed: axis.current_speed(),
        })
    }

    pub fn positions(&self) -> [i32; NUM_AXES] {
        self.axes.each_ref().map(|axis| axis.current_position())
    }

    pub fn axis_name(index: usize) -> &'static str {
        AXIS_NAMES.get(index).copied().unwrap_or("?")
    }
}

impl Drop for MotionEngine {
    fn drop(&mut self) {
        // Leave the drivers unpowered when the engine goes away
        if self.state.motors_enabled {
            warn!("Motion engine dropped with drivers enabled, disabling");
            self.outputs.set_enabled(false);
        }
    }
}
