// Arm controller: every piece of mutable state, advanced one tick at a time
//
// Order inside a tick:
// 1. input sampling, e-stop and watchdog interlock bookkeeping
// 2. binary requests, then serial bytes, then the teleop poll
// 3. homing state machine
// 4. the single motion advance

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{ConfigError, ControllerConfig, NUM_AXES};
use crate::homing::{HomingRun, HomingSequence, HomingStatus};
use crate::inputs::{InputPanel, RawInputs, LIMIT_AXES};
use crate::messages::{ArmActuation, CommandRequest, CommandResponse, GamepadSample, RuntimeHealth};
use crate::motion::{MotionEngine, MotionError, StepperOutputs};
use crate::protocol::{self, LineInterpreter};
use crate::teleop::TeleopMapper;
use crate::watchdog::Watchdog;

// Longest robot identifier kept by SetRobotId
pub const ROBOT_ID_LEN: usize = 16;

/// State shared by all command sources
pub struct ArmCore {
    config: ControllerConfig,
    pub(crate) engine: MotionEngine,
    watchdog: Watchdog,
    inputs: InputPanel,
    homing: Option<HomingRun>,
    digital_out: u8,
    robot_id: Vec<u8>,
    /// Set by an explicit disable; blocks auto re-enable on feed
    disable_latched: bool,
    now: Duration,
}

impl ArmCore {
    pub fn new(config: ControllerConfig, outputs: Box<dyn StepperOutputs>) -> Self {
        let engine = MotionEngine::new(&config.axes, outputs);
        let watchdog = Watchdog::new(config.ticks_for(Duration::from_millis(config.watchdog.timeout_ms)));
        let inputs = InputPanel::new(config.debounce());
        Self {
            config,
            engine,
            watchdog,
            inputs,
            homing: None,
            digital_out: 0,
            robot_id: Vec::new(),
            disable_latched: false,
            now: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn engine(&self) -> &MotionEngine {
        &self.engine
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn digital_out(&self) -> u8 {
        self.digital_out
    }

    pub fn set_digital_out(&mut self, value: u8) {
        debug!("Digital outputs -> 0b{:08b}", value);
        self.digital_out = value;
    }

    pub fn robot_id(&self) -> &[u8] {
        &self.robot_id
    }

    /// Store the identifier, truncated to `ROBOT_ID_LEN`; returns what was kept
    pub fn set_robot_id(&mut self, id: &[u8]) -> &[u8] {
        self.robot_id = id[..id.len().min(ROBOT_ID_LEN)].to_vec();
        &self.robot_id
    }

    pub fn inputs_byte(&self) -> u8 {
        self.inputs.state_byte()
    }

    pub fn homing_active(&self) -> bool {
        self.homing.as_ref().is_some_and(|run| !run.is_finished())
    }

    /// Engine busy bits plus the axis an active homing run is working on
    pub fn busy_mask(&self) -> u8 {
        let homing = self.homing.as_ref().map_or(0, |run| run.busy_mask());
        self.engine.busy_mask() | homing
    }

    pub fn disable_latched(&self) -> bool {
        self.disable_latched
    }

    /// Generic precondition check shared by both command tables
    pub fn check(&self, requires_enabled: bool, requires_idle: bool) -> Result<(), MotionError> {
        if requires_enabled && !self.engine.motors_enabled() {
            return Err(MotionError::Disabled);
        }
        if requires_idle {
            let mask = self.busy_mask();
            if mask != 0 {
                return Err(MotionError::Busy { mask });
            }
        }
        Ok(())
    }

    /// Reload the watchdog; reviving it may bring the drivers back
    pub fn feed_watchdog(&mut self) {
        let was_expired = self.watchdog.expired();
        self.watchdog.feed();
        if was_expired
            && self.config.watchdog.auto_reenable_on_feed
            && !self.disable_latched
            && !self.engine.motors_enabled()
        {
            info!("Watchdog fed after expiry, re-enabling drivers");
            self.engine.enable(true);
        }
    }

    /// Reload a live watchdog; an expired one stays expired
    pub fn keep_watchdog_alive(&mut self) {
        if !self.watchdog.expired() {
            self.watchdog.feed();
        }
    }

    /// Explicit enable/disable from an operator or supervisor
    pub fn set_enabled(&mut self, on: bool) {
        self.disable_latched = !on;
        self.engine.enable(on);
    }

    /// Disable that only an explicit enable may undo
    pub fn latch_disable(&mut self, reason: &str) {
        if self.engine.motors_enabled() {
            info!("Drivers disabled: {}", reason);
        }
        self.set_enabled(false);
    }

    /// Soft stop; also cancels a homing run
    pub fn stop(&mut self) {
        if let Some(run) = self.homing.as_mut() {
            run.cancel(&mut self.engine);
        }
        self.engine.stop();
    }

    pub fn start_homing(&mut self, sequence: HomingSequence) -> Result<(), MotionError> {
        self.check(false, true)?;
        let steps = sequence.steps(&self.config.homing);
        self.disable_latched = false;
        self.homing = Some(HomingRun::start(steps, &mut self.engine, self.now));
        Ok(())
    }

    /// Advance an active homing run; returns its status on the tick it ends
    fn advance_homing(&mut self) -> Option<HomingStatus> {
        let run = self.homing.as_mut()?;
        let status = run.advance(&mut self.engine, self.now);
        if status == HomingStatus::Running {
            return None;
        }
        self.homing = None;
        Some(status)
    }

    fn sample_inputs(&mut self, raw: &RawInputs) {
        self.inputs.update(raw, self.now);
        for axis in LIMIT_AXES {
            let pressed = self.inputs.limit_for_axis(axis).unwrap_or(false);
            self.engine.set_limit_switch(axis, pressed);
        }
        if self.config.estop_enabled {
            self.engine.set_safety_stop(self.inputs.estop_pressed());
        }
    }

    fn watchdog_tick(&mut self) {
        self.watchdog.tick();
        if self.homing_active() && self.config.homing.feeds_watchdog {
            self.watchdog.feed();
        }
        if self.watchdog.expired() && self.engine.motors_enabled() {
            warn!("Watchdog expired, disabling drivers");
            self.engine.enable(false);
        }
    }
}

/// Everything that arrived since the previous tick
#[derive(Debug, Default, Clone, Copy)]
pub struct TickInput<'a> {
    pub requests: &'a [CommandRequest],
    pub serial_in: &'a [u8],
    /// Latest gamepad state, `None` when no fresh sample exists
    pub gamepad: Option<&'a GamepadSample>,
    pub raw_inputs: Option<&'a RawInputs>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickOutput {
    pub responses: Vec<CommandResponse>,
    pub serial_out: Vec<u8>,
    /// The teleop mapper sampled the gamepad on this tick
    pub teleop_polled: bool,
}

pub struct ArmController {
    core: ArmCore,
    line: LineInterpreter,
    teleop: TeleopMapper,
    raw_inputs: RawInputs,
    tick_period: Duration,
    ticks: u64,
}

impl ArmController {
    pub fn new(
        config: ControllerConfig,
        outputs: Box<dyn StepperOutputs>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let tick_period = config.tick_period();
        let poll_ticks = config.ticks_for(Duration::from_millis(config.teleop.poll_interval_ms));
        let line = LineInterpreter::new(config.ascii);
        let teleop = TeleopMapper::new(config.teleop, poll_ticks);
        info!(
            "Controller ready: {} Hz tick, {} ms watchdog, teleop every {} ticks",
            config.tick_hz, config.watchdog.timeout_ms, poll_ticks
        );
        Ok(Self {
            core: ArmCore::new(config, outputs),
            line,
            teleop,
            raw_inputs: RawInputs::default(),
            tick_period,
            ticks: 0,
        })
    }

    pub fn core(&self) -> &ArmCore {
        &self.core
    }

    pub fn line(&self) -> &LineInterpreter {
        &self.line
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }

    pub fn tick(&mut self, input: TickInput<'_>) -> TickOutput {
        let mut out = TickOutput::default();
        self.ticks += 1;
        self.core.now += self.tick_period;

        // 1. Interlocks
        if let Some(raw) = input.raw_inputs {
            self.raw_inputs = *raw;
        }
        let raw = self.raw_inputs;
        self.core.sample_inputs(&raw);
        self.core.watchdog_tick();

        // 2. Command sources
        for request in input.requests {
            if let Some(response) = protocol::dispatch(&mut self.core, request) {
                out.responses.push(response);
            }
        }
        for &byte in input.serial_in {
            out.serial_out.extend(self.line.push_byte(byte, &mut self.core));
        }
        out.teleop_polled = self.poll_teleop(input.gamepad);

        // 3. Homing
        if let Some(status) = self.core.advance_homing() {
            if let Some(reply) = self.line.homing_finished(status) {
                out.serial_out.extend(reply);
            }
        }

        // 4. Motion
        self.core.engine.tick(self.tick_period);
        out
    }

    fn poll_teleop(&mut self, gamepad: Option<&GamepadSample>) -> bool {
        let max_speeds = self.core.config.axes.map(|a| a.max_speed);
        let enabled = self.core.engine.motors_enabled();
        let Some(action) = self.teleop.tick(gamepad, enabled, &max_speeds) else {
            return false;
        };

        if action.sleep {
            self.core.latch_disable("teleop idle");
        }
        if let Some(on) = action.enable {
            self.core.set_enabled(on);
        }
        if action.active {
            self.core.feed_watchdog();
        }
        if let Some(speeds) = action.speeds {
            if self.core.homing_active() {
                debug!("Teleop ignored while homing");
            } else if let Err(e) = self.core.engine.set_continuous_speed(speeds) {
                debug!("Teleop speeds rejected: {}", e);
            }
        }
        true
    }

    pub fn actuation(&self) -> ArmActuation {
        let snapshot = self.core.engine.snapshot();
        let mut speeds = [0.0; NUM_AXES];
        let mut positions = [0; NUM_AXES];
        for (i, axis) in snapshot.iter().enumerate() {
            positions[i] = axis.position;
            speeds[i] = axis.speed;
        }
        ArmActuation {
            enabled: self.core.engine.motors_enabled(),
            busy_mask: self.core.busy_mask(),
            positions,
            speeds,
            pulses: self.core.engine.outputs().pulse_counts(),
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        if self.core.engine.state().safety_stop_active {
            RuntimeHealth::SafetyStop
        } else if self.core.homing_active() {
            RuntimeHealth::Homing
        } else if self.core.watchdog.expired() {
            RuntimeHealth::CmdStale
        } else {
            RuntimeHealth::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{JointRecord, Opcode, StatusCode};
    use crate::motion::SharedPulseCounter;

    fn controller() -> (ArmController, SharedPulseCounter) {
        let recorder = SharedPulseCounter::default();
        let controller = ArmController::new(ControllerConfig::default(), Box::new(recorder.clone()))
            .unwrap();
        (controller, recorder)
    }

    fn send(c: &mut ArmController, op: Opcode, payload: &[u8]) -> CommandResponse {
        let requests = [CommandRequest::new(op, payload)];
        let mut out = c.tick(TickInput {
            requests: &requests,
            ..Default::default()
        });
        assert_eq!(out.responses.len(), 1);
        out.responses.remove(0)
    }

    fn type_line(c: &mut ArmController, line: &str) -> String {
        let out = c.tick(TickInput {
            serial_in: line.as_bytes(),
            ..Default::default()
        });
        String::from_utf8(out.serial_out).unwrap()
    }

    fn idle(c: &mut ArmController, ticks: usize) -> Vec<u8> {
        let mut serial = Vec::new();
        for _ in 0..ticks {
            serial.extend(c.tick(TickInput::default()).serial_out);
        }
        serial
    }

    fn move_to(targets: [i16; NUM_AXES]) -> Vec<u8> {
        JointRecord {
            positions: targets,
            speeds: [50; NUM_AXES],
        }
        .encode()
        .to_vec()
    }

    #[test]
    fn test_move_rejected_while_disabled() {
        let (mut c, _) = controller();
        let resp = send(&mut c, Opcode::MoveAbsolute, &move_to([100, 0, 0, 0, 0, 0]));
        assert_eq!(resp.status, StatusCode::Error);
        assert!(resp.payload.is_empty());
        assert_eq!(c.core().engine().axis(0).unwrap().target_position(), 0);
    }

    #[test]
    fn test_move_absolute_while_busy_reports_mask() {
        let (mut c, _) = controller();
        assert_eq!(send(&mut c, Opcode::Enable, &[]).status, StatusCode::Ok);
        let resp = send(&mut c, Opcode::MoveAbsolute, &move_to([100, 0, 0, 0, 0, 0]));
        assert_eq!(resp.status, StatusCode::Ok);
        assert_eq!(c.core().busy_mask(), 0b000001);

        let resp = send(&mut c, Opcode::MoveAbsolute, &move_to([100, 0, 0, 0, 0, 0]));
        assert_eq!(resp, CommandResponse::busy(Opcode::MoveAbsolute as u8, 0b000001));
        let targets: Vec<i32> = c
            .core()
            .engine()
            .axes()
            .iter()
            .map(|a| a.target_position())
            .collect();
        assert_eq!(targets, vec![100, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_watchdog_expiry_disables_and_ping_revives() {
        let (mut c, rec) = controller();
        send(&mut c, Opcode::Enable, &[]);
        assert!(c.core().engine().motors_enabled());

        // Enable fed the watchdog on the tick it was handled
        idle(&mut c, 2999);
        assert!(c.core().engine().motors_enabled());
        idle(&mut c, 1);
        assert!(!c.core().engine().motors_enabled());
        assert!(!rec.enabled());
        assert_eq!(c.health(), RuntimeHealth::CmdStale);

        // Not latched: the next feed brings the drivers back
        assert_eq!(send(&mut c, Opcode::Ping, &[1, 2]).payload, vec![1, 2]);
        assert!(c.core().engine().motors_enabled());
        assert_eq!(c.health(), RuntimeHealth::Ok);
    }

    #[test]
    fn test_stop_after_expiry_leaves_drivers_off() {
        let (mut c, rec) = controller();
        send(&mut c, Opcode::Enable, &[]);
        idle(&mut c, 3000);
        assert!(!c.core().engine().motors_enabled());

        assert_eq!(send(&mut c, Opcode::Stop, &[]).status, StatusCode::Ok);
        assert!(!c.core().engine().motors_enabled());
        assert!(!rec.enabled());
        assert_eq!(c.health(), RuntimeHealth::CmdStale);
    }

    #[test]
    fn test_explicit_disable_is_not_undone_by_feed() {
        let (mut c, _) = controller();
        send(&mut c, Opcode::Enable, &[]);
        send(&mut c, Opcode::Disable, &[]);
        idle(&mut c, 3500);
        send(&mut c, Opcode::Ping, &[]);
        assert!(!c.core().engine().motors_enabled());
        assert!(c.core().disable_latched());

        send(&mut c, Opcode::Enable, &[]);
        assert!(c.core().engine().motors_enabled());
        assert!(!c.core().disable_latched());
    }

    #[test]
    fn test_queries_never_gated() {
        let (mut c, _) = controller();
        let resp = send(&mut c, Opcode::IsMoving, &[]);
        assert_eq!(resp.payload, vec![0]);
        let resp = send(&mut c, Opcode::CurrentPosition, &[]);
        assert_eq!(resp.status, StatusCode::Ok);
        assert_eq!(resp.payload.len(), crate::messages::JOINT_RECORD_LEN);
        // Queries do not feed the watchdog
        assert!(c.core().watchdog().expired());
    }

    #[test]
    fn test_positioning_move_completes_over_ticks() {
        let (mut c, _) = controller();
        send(&mut c, Opcode::Enable, &[]);
        send(&mut c, Opcode::MoveAbsolute, &move_to([10, -5, 0, 0, 0, 0]));
        for _ in 0..2000 {
            c.tick(TickInput::default());
            if c.core().busy_mask() == 0 {
                break;
            }
        }
        assert_eq!(c.core().engine().positions(), [10, -5, 0, 0, 0, 0]);
        let resp = send(&mut c, Opcode::CurrentPosition, &[]);
        let record = JointRecord::decode(&resp.payload).unwrap();
        assert_eq!(record.positions, [10, -5, 0, 0, 0, 0]);
    }

    #[test]
    fn test_estop_suspends_motion() {
        let (mut c, _) = controller();
        send(&mut c, Opcode::Enable, &[]);
        send(&mut c, Opcode::MoveSpeed, &move_to([0; NUM_AXES]));
        let pressed = RawInputs {
            estop: true,
            limits: [false; 4],
        };
        c.tick(TickInput {
            raw_inputs: Some(&pressed),
            ..Default::default()
        });
        // Debounce
        idle(&mut c, 100);
        assert_eq!(c.health(), RuntimeHealth::SafetyStop);
        assert_eq!(c.core().inputs_byte(), 0b0000_1000);
        let parked = c.core().engine().positions();
        idle(&mut c, 200);
        assert_eq!(c.core().engine().positions(), parked);
    }

    #[test]
    fn test_ascii_step_and_read() {
        let (mut c, _) = controller();
        let reply = type_line(&mut c, "@STEP 50,3,0,0,0,0,-2,0\r");
        assert!(reply.ends_with("\r\nOK\r\n"));
        assert!(c.core().engine().motors_enabled());
        for _ in 0..1000 {
            type_line(&mut c, "@READ\r");
        }
        let reply = type_line(&mut c, "@READ\r");
        assert!(reply.ends_with("\r\n3, 0, 0, 0, 0, -2, 0\r\n"), "{reply:?}");
    }

    #[test]
    fn test_ascii_close_replies_after_homing() {
        let (mut c, _) = controller();
        let reply = type_line(&mut c, "@CLOSE\r");
        // Echo only, the OK comes when the gripper is home
        assert_eq!(reply, "@CLOSE\r");
        assert!(c.core().homing_active());
        assert_eq!(c.health(), RuntimeHealth::Homing);

        // Busy while homing
        let resp = send(&mut c, Opcode::MoveAbsolute, &move_to([1, 0, 0, 0, 0, 0]));
        assert_eq!(resp.status, StatusCode::Busy);
        assert_eq!(resp.payload, vec![1 << crate::config::AXIS_GRIPPER]);

        let switch = |on: bool| RawInputs {
            estop: false,
            limits: [false, false, false, on],
        };
        c.tick(TickInput {
            raw_inputs: Some(&switch(true)),
            ..Default::default()
        });
        idle(&mut c, 150);
        c.tick(TickInput {
            raw_inputs: Some(&switch(false)),
            ..Default::default()
        });
        let serial = idle(&mut c, 150);
        assert_eq!(String::from_utf8(serial).unwrap(), "\r\nOK\r\n");
        assert!(!c.core().homing_active());
        assert!(!c.core().engine().motors_enabled());
        assert_eq!(c.core().engine().positions()[crate::config::AXIS_GRIPPER], 0);
    }

    #[test]
    fn test_binary_home_times_out_and_disables() {
        let mut config = ControllerConfig::default();
        for step in &mut config.homing.full {
            step.approach_timeout_ms = 50;
        }
        let mut c = ArmController::new(config, Box::new(SharedPulseCounter::default())).unwrap();
        assert_eq!(send(&mut c, Opcode::Home, &[]).status, StatusCode::Ok);
        assert!(c.core().engine().motors_enabled());
        idle(&mut c, 60);
        assert!(!c.core().homing_active());
        assert!(!c.core().engine().motors_enabled());
        assert_eq!(c.core().busy_mask(), 0);
    }

    #[test]
    fn test_teleop_drives_base() {
        let (mut c, _) = controller();
        let pad = GamepadSample {
            connected: true,
            circle: true,
            ..Default::default()
        };
        // First poll lands on tick 100
        for _ in 0..100 {
            c.tick(TickInput {
                gamepad: Some(&pad),
                ..Default::default()
            });
        }
        assert!(c.core().engine().motors_enabled());

        let push = GamepadSample {
            connected: true,
            left_x: -128,
            ..Default::default()
        };
        for _ in 0..1000 {
            c.tick(TickInput {
                gamepad: Some(&push),
                ..Default::default()
            });
        }
        assert!(c.core().engine().positions()[0] > 50);
        assert!(!c.core().watchdog().expired());
    }
}
