// Limit-switch homing, advanced once per controller tick
//
// Axes are homed strictly in order. Each one runs towards its switch at the
// approach speed, backs off slowly until the switch releases, and takes the
// release edge as its zero. A timeout on any axis aborts the whole run and
// powers the drivers down. The drivers are also powered down when the run
// completes; zeroed axes keep their new reference either way.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{HomingAxisConfig, HomingConfig};
use crate::motion::{MotionEngine, MotionError};

/// Which configured axis list a run homes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HomingSequence {
    Full,
    Gripper,
}

impl HomingSequence {
    pub fn steps(self, config: &HomingConfig) -> Vec<HomingAxisConfig> {
        match self {
            HomingSequence::Full => config.full.clone(),
            HomingSequence::Gripper => config.gripper.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HomingPhase {
    Pending,
    Approaching,
    Releasing,
    Repositioning,
    Done,
    TimedOut,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingStatus {
    Running,
    Completed,
    /// `phase` is `TimedOut` or `Aborted`
    Failed { axis: usize, phase: HomingPhase },
}

pub struct HomingRun {
    steps: Vec<HomingAxisConfig>,
    phases: Vec<HomingPhase>,
    current: usize,
    phase_started: Duration,
    outcome: Option<HomingStatus>,
}

impl HomingRun {
    /// Power the drivers and start approaching the first axis
    pub fn start(steps: Vec<HomingAxisConfig>, engine: &mut MotionEngine, now: Duration) -> Self {
        let mut run = Self {
            phases: vec![HomingPhase::Pending; steps.len()],
            steps,
            current: 0,
            phase_started: now,
            outcome: None,
        };
        info!(
            "Homing {} axes: {:?}",
            run.steps.len(),
            run.steps
                .iter()
                .map(|s| MotionEngine::axis_name(s.axis))
                .collect::<Vec<_>>()
        );
        engine.enable(true);
        if run.steps.is_empty() {
            run.finish(engine);
        } else if let Err(e) = run.begin_approach(engine, now) {
            run.abort(engine, e);
        }
        run
    }

    pub fn phases(&self) -> &[HomingPhase] {
        &self.phases
    }

    /// Axis currently being homed, `None` once the run has ended
    pub fn current_axis(&self) -> Option<usize> {
        if self.outcome.is_some() {
            return None;
        }
        self.steps.get(self.current).map(|s| s.axis)
    }

    /// Busy bit of the axis being homed
    pub fn busy_mask(&self) -> u8 {
        self.current_axis().map_or(0, |axis| 1 << axis)
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<HomingStatus> {
        self.outcome
    }

    /// Run one tick of the state machine
    pub fn advance(&mut self, engine: &mut MotionEngine, now: Duration) -> HomingStatus {
        if let Some(outcome) = self.outcome {
            return outcome;
        }

        // Drivers cut under us (watchdog, e-stop handling, explicit disable)
        if !engine.motors_enabled() {
            self.abort(engine, MotionError::Disabled);
            return self.status();
        }

        let step = self.steps[self.current].clone();
        let axis = step.axis;
        let pressed = engine.axis(axis).is_some_and(|a| a.limit_switch());
        let elapsed = now.saturating_sub(self.phase_started);

        let result = match self.phases[self.current] {
            HomingPhase::Pending => self.begin_approach(engine, now),
            HomingPhase::Approaching => {
                if pressed {
                    debug!("{} switch hit, releasing", MotionEngine::axis_name(axis));
                    self.enter(HomingPhase::Releasing, now);
                    engine.set_axis_speed(axis, step.release_speed)
                } else if elapsed >= step.approach_timeout() {
                    self.time_out(engine, "reaching the switch");
                    Ok(())
                } else {
                    Ok(())
                }
            }
            HomingPhase::Releasing => {
                if !pressed {
                    self.released(engine, &step, now)
                } else if step.release_timeout().is_some_and(|t| elapsed >= t) {
                    self.time_out(engine, "releasing the switch");
                    Ok(())
                } else {
                    Ok(())
                }
            }
            HomingPhase::Repositioning => {
                if engine.busy_mask() & (1 << axis) == 0 {
                    self.next_axis(engine, now)
                } else {
                    Ok(())
                }
            }
            HomingPhase::Done | HomingPhase::TimedOut | HomingPhase::Aborted => Ok(()),
        };

        if let Err(e) = result {
            self.abort(engine, e);
        }
        self.status()
    }

    /// Abort from outside (soft stop); drivers go down like on a timeout
    pub fn cancel(&mut self, engine: &mut MotionEngine) {
        if self.outcome.is_none() {
            engine.stop();
            self.abort_with(engine, "cancelled");
        }
    }

    fn status(&self) -> HomingStatus {
        self.outcome.unwrap_or(HomingStatus::Running)
    }

    fn enter(&mut self, phase: HomingPhase, now: Duration) {
        self.phases[self.current] = phase;
        self.phase_started = now;
    }

    fn begin_approach(&mut self, engine: &mut MotionEngine, now: Duration) -> Result<(), MotionError> {
        let step = &self.steps[self.current];
        debug!(
            "Homing {} at {} steps/s",
            MotionEngine::axis_name(step.axis),
            step.approach_speed
        );
        // Only the axis being homed may move
        engine.stop();
        engine.set_axis_speed(step.axis, step.approach_speed)?;
        self.enter(HomingPhase::Approaching, now);
        Ok(())
    }

    fn released(
        &mut self,
        engine: &mut MotionEngine,
        step: &HomingAxisConfig,
        now: Duration,
    ) -> Result<(), MotionError> {
        engine.set_axis_speed(step.axis, 0.0)?;
        engine.zero_axis(step.axis)?;
        info!("{} homed", MotionEngine::axis_name(step.axis));
        match step.reposition {
            Some(park) => {
                engine.move_axis_to(step.axis, park.position, park.speed)?;
                self.enter(HomingPhase::Repositioning, now);
                Ok(())
            }
            None => self.next_axis(engine, now),
        }
    }

    fn next_axis(&mut self, engine: &mut MotionEngine, now: Duration) -> Result<(), MotionError> {
        self.enter(HomingPhase::Done, now);
        self.current += 1;
        if self.current == self.steps.len() {
            self.finish(engine);
            Ok(())
        } else {
            self.begin_approach(engine, now)
        }
    }

    fn finish(&mut self, engine: &mut MotionEngine) {
        engine.enable(false);
        self.outcome = Some(HomingStatus::Completed);
        info!("Homing complete");
    }

    fn time_out(&mut self, engine: &mut MotionEngine, what: &str) {
        let axis = self.steps[self.current].axis;
        warn!(
            "Homing timed out {} on {}, drivers disabled",
            what,
            MotionEngine::axis_name(axis)
        );
        self.phases[self.current] = HomingPhase::TimedOut;
        engine.enable(false);
        self.outcome = Some(HomingStatus::Failed {
            axis,
            phase: HomingPhase::TimedOut,
        });
    }

    fn abort(&mut self, engine: &mut MotionEngine, err: MotionError) {
        self.abort_with(engine, &err.to_string());
    }

    fn abort_with(&mut self, engine: &mut MotionEngine, reason: &str) {
        let axis = self.steps.get(self.current).map_or(0, |s| s.axis);
        warn!("Homing aborted on {}: {}", MotionEngine::axis_name(axis), reason);
        if let Some(phase) = self.phases.get_mut(self.current) {
            *phase = HomingPhase::Aborted;
        }
        engine.enable(false);
        self.outcome = Some(HomingStatus::Failed {
            axis,
            phase: HomingPhase::Aborted,
        });
    }
}
