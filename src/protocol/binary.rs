// Binary opcode dispatcher
// One table row per opcode: preconditions, watchdog policy and handler.

use tracing::{debug, warn};

use super::CommandError;
use crate::controller::ArmCore;
use crate::homing::HomingSequence;
use crate::messages::{CommandRequest, CommandResponse, JointRecord, Opcode, WireError};
use crate::motion::MotionError;

type Handler = fn(&mut ArmCore, &[u8]) -> Result<Vec<u8>, CommandError>;

/// What a successful request does to the watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    Never,
    /// Reload only while still live; never powers the drivers back up
    KeepAlive,
    /// Reload, re-enabling the drivers if the watchdog had expired
    Revive,
}

pub struct OpcodeEntry {
    pub opcode: Opcode,
    pub requires_enabled: bool,
    pub requires_idle: bool,
    pub feed: Feed,
    handler: Handler,
}

const fn entry(
    opcode: Opcode,
    requires_enabled: bool,
    requires_idle: bool,
    feed: Feed,
    handler: Handler,
) -> OpcodeEntry {
    OpcodeEntry {
        opcode,
        requires_enabled,
        requires_idle,
        feed,
        handler,
    }
}

// Flags: requires_enabled, requires_idle, watchdog feed
pub static OPCODE_TABLE: [OpcodeEntry; 15] = [
    entry(Opcode::Ping, false, false, Feed::Revive, ping),
    entry(Opcode::Stop, false, false, Feed::KeepAlive, stop),
    entry(Opcode::Disable, false, false, Feed::Revive, disable),
    entry(Opcode::Enable, false, false, Feed::Revive, enable),
    entry(Opcode::Clear, false, true, Feed::KeepAlive, clear),
    entry(Opcode::MoveRelative, true, true, Feed::Revive, move_relative),
    entry(Opcode::MoveAbsolute, true, true, Feed::Revive, move_absolute),
    entry(Opcode::DigitalOutput, false, false, Feed::KeepAlive, digital_output),
    entry(Opcode::DigitalInput, false, false, Feed::Revive, digital_input),
    entry(Opcode::IsMoving, false, false, Feed::Never, is_moving),
    entry(Opcode::CurrentPosition, false, false, Feed::Never, current_position),
    entry(Opcode::MoveSpeed, true, false, Feed::Revive, move_speed),
    entry(Opcode::SetRobotId, false, false, Feed::Never, set_robot_id),
    entry(Opcode::GetRobotId, false, false, Feed::Never, get_robot_id),
    entry(Opcode::Home, false, true, Feed::Revive, home),
];

pub fn lookup(opcode: u8) -> Option<&'static OpcodeEntry> {
    OPCODE_TABLE.iter().find(|e| e.opcode as u8 == opcode)
}

/// Handle one request; unknown opcodes get no response
pub fn dispatch(core: &mut ArmCore, request: &CommandRequest) -> Option<CommandResponse> {
    let Some(entry) = lookup(request.opcode) else {
        warn!("Unknown operation code: {}", request.opcode);
        return None;
    };

    if let Err(e) = core.check(entry.requires_enabled, entry.requires_idle) {
        debug!("{:?} rejected: {}", entry.opcode, e);
        return Some(reject(request.opcode, &CommandError::Rejected(e)));
    }

    match (entry.handler)(core, &request.payload) {
        Ok(payload) => {
            match entry.feed {
                Feed::Revive => core.feed_watchdog(),
                Feed::KeepAlive => core.keep_watchdog_alive(),
                Feed::Never => {}
            }
            Some(CommandResponse::ok(request.opcode, &payload))
        }
        Err(e) => {
            warn!("{:?} failed: {}", entry.opcode, e);
            Some(reject(request.opcode, &e))
        }
    }
}

fn reject(opcode: u8, err: &CommandError) -> CommandResponse {
    match err {
        CommandError::Rejected(MotionError::Busy { mask }) => CommandResponse::busy(opcode, *mask),
        _ => CommandResponse::error(opcode),
    }
}

fn ping(_core: &mut ArmCore, payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    Ok(payload.to_vec())
}

fn stop(core: &mut ArmCore, _payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    core.stop();
    Ok(Vec::new())
}

fn disable(core: &mut ArmCore, _payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    core.set_enabled(false);
    Ok(Vec::new())
}

fn enable(core: &mut ArmCore, _payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    core.set_enabled(true);
    Ok(Vec::new())
}

fn clear(core: &mut ArmCore, _payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    core.engine.zero();
    Ok(Vec::new())
}

fn move_relative(core: &mut ArmCore, payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    let record = JointRecord::decode(payload)?;
    core.engine.set_relative(record.targets(), record.speeds_f32())?;
    Ok(Vec::new())
}

fn move_absolute(core: &mut ArmCore, payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    let record = JointRecord::decode(payload)?;
    core.engine.set_absolute(record.targets(), record.speeds_f32())?;
    Ok(Vec::new())
}

fn digital_output(core: &mut ArmCore, payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    let value = *payload.first().ok_or(WireError::Truncated { needed: 1, got: 0 })?;
    core.set_digital_out(value);
    Ok(vec![value])
}

fn digital_input(core: &mut ArmCore, _payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    Ok(vec![core.inputs_byte()])
}

fn is_moving(core: &mut ArmCore, _payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    Ok(vec![core.busy_mask()])
}

fn current_position(core: &mut ArmCore, _payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    let snapshot = core.engine.snapshot();
    let record = JointRecord::from_state(snapshot.map(|s| s.position), snapshot.map(|s| s.speed));
    Ok(record.encode().to_vec())
}

fn move_speed(core: &mut ArmCore, payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    let record = JointRecord::decode(payload)?;
    // Speed mode is never busy-gated, but it must not hijack a homing run
    if core.homing_active() {
        return Err(MotionError::Busy {
            mask: core.busy_mask(),
        }
        .into());
    }
    core.engine.set_continuous_speed(record.speeds_f32())?;
    Ok(Vec::new())
}

fn set_robot_id(core: &mut ArmCore, payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    Ok(core.set_robot_id(payload).to_vec())
}

fn get_robot_id(core: &mut ArmCore, _payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    Ok(core.robot_id().to_vec())
}

fn home(core: &mut ArmCore, _payload: &[u8]) -> Result<Vec<u8>, CommandError> {
    core.start_homing(HomingSequence::Full)?;
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::messages::StatusCode;
    use crate::motion::PulseCounter;

    fn core() -> ArmCore {
        ArmCore::new(ControllerConfig::default(), Box::new(PulseCounter::new()))
    }

    fn call(core: &mut ArmCore, op: Opcode, payload: &[u8]) -> CommandResponse {
        dispatch(core, &CommandRequest::new(op, payload)).unwrap()
    }

    #[test]
    fn test_table_covers_every_opcode_once() {
        for op in Opcode::ALL {
            let rows = OPCODE_TABLE.iter().filter(|e| e.opcode == op).count();
            assert_eq!(rows, 1, "{op:?}");
        }
        // Queries are never gated
        for op in [Opcode::IsMoving, Opcode::CurrentPosition, Opcode::DigitalInput] {
            let row = lookup(op as u8).unwrap();
            assert!(!row.requires_enabled && !row.requires_idle);
        }
    }

    #[test]
    fn test_unknown_opcode_ignored() {
        let mut core = core();
        let request = CommandRequest {
            opcode: 0x42,
            payload: vec![1, 2, 3],
        };
        assert_eq!(dispatch(&mut core, &request), None);
        assert!(!core.engine().motors_enabled());
    }

    #[test]
    fn test_short_joint_record_is_an_error() {
        let mut core = core();
        call(&mut core, Opcode::Enable, &[]);
        let resp = call(&mut core, Opcode::MoveRelative, &[0; 10]);
        assert_eq!(resp.status, StatusCode::Error);
        assert_eq!(core.busy_mask(), 0);
    }

    #[test]
    fn test_digital_io() {
        let mut core = core();
        let resp = call(&mut core, Opcode::DigitalOutput, &[0xA5]);
        assert_eq!(resp.payload, vec![0xA5]);
        assert_eq!(core.digital_out(), 0xA5);
        assert_eq!(call(&mut core, Opcode::DigitalOutput, &[]).status, StatusCode::Error);
        assert_eq!(call(&mut core, Opcode::DigitalInput, &[]).payload, vec![0]);
    }

    #[test]
    fn test_robot_id_truncated_and_returned() {
        let mut core = core();
        let id = b"robko-01-station-seven";
        let resp = call(&mut core, Opcode::SetRobotId, id);
        assert_eq!(resp.payload, id[..16].to_vec());
        assert_eq!(call(&mut core, Opcode::GetRobotId, &[]).payload, id[..16].to_vec());
    }

    #[test]
    fn test_clear_rejected_while_busy() {
        let mut core = core();
        call(&mut core, Opcode::Enable, &[]);
        let record = JointRecord {
            positions: [0, 0, 5, 0, 0, 0],
            speeds: [0; 6],
        };
        call(&mut core, Opcode::MoveAbsolute, &record.encode());
        let resp = call(&mut core, Opcode::Clear, &[]);
        assert_eq!(resp, CommandResponse::busy(Opcode::Clear as u8, 0b000100));
        assert_eq!(call(&mut core, Opcode::IsMoving, &[]).payload, vec![0b000100]);
    }

    #[test]
    fn test_move_speed_enters_speed_mode() {
        let mut core = core();
        call(&mut core, Opcode::Enable, &[]);
        let record = JointRecord {
            positions: [0; 6],
            speeds: [10, 0, 0, 0, 0, -10],
        };
        assert_eq!(call(&mut core, Opcode::MoveSpeed, &record.encode()).status, StatusCode::Ok);
        assert_eq!(core.engine().axis(5).unwrap().commanded_speed(), -10.0);
        assert_eq!(core.busy_mask(), 0);
    }

    #[test]
    fn test_stop_never_powers_drivers_up() {
        let mut core = core();
        // Fresh core: watchdog expired, drivers off, nothing latched
        for op in [Opcode::Stop, Opcode::DigitalOutput, Opcode::Clear] {
            let payload: &[u8] = if op == Opcode::DigitalOutput { &[1] } else { &[] };
            assert_eq!(call(&mut core, op, payload).status, StatusCode::Ok, "{op:?}");
            assert!(!core.engine().motors_enabled(), "{op:?}");
            assert!(core.watchdog().expired(), "{op:?}");
        }
        // Ping still revives
        call(&mut core, Opcode::Ping, &[]);
        assert!(core.engine().motors_enabled());
        // Stop keeps a live link alive
        call(&mut core, Opcode::Stop, &[]);
        assert_eq!(core.watchdog().remaining(), core.watchdog().timeout());
    }

    #[test]
    fn test_stop_cancels_homing() {
        let mut core = core();
        assert_eq!(call(&mut core, Opcode::Home, &[]).status, StatusCode::Ok);
        assert!(core.homing_active());
        assert_eq!(call(&mut core, Opcode::Home, &[]).status, StatusCode::Busy);
        call(&mut core, Opcode::Stop, &[]);
        assert!(!core.homing_active());
        assert!(!core.engine().motors_enabled());
    }
}
