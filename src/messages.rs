// Message types exchanged with the outside world
//
// Binary protocol frames travel as raw bytes on the command topic:
//   request  = [opcode, len, payload...]
//   response = [opcode, status, len, payload...]
// Everything else (teleop samples, raw inputs, actuation, health) is JSON.

use serde::{Deserialize, Serialize};

use crate::config::NUM_AXES;

// Longest payload either direction carries
pub const MAX_PAYLOAD: usize = 64;

// Six (position, speed) pairs of i16
pub const JOINT_RECORD_LEN: usize = NUM_AXES * 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("Frame too short: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Payload of {0} bytes exceeds the {MAX_PAYLOAD} byte limit")]
    Oversized(usize),

    #[error("Unknown status code {0}")]
    UnknownStatus(u8),
}

// Binary operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Ping = 1,
    Stop = 2,
    Disable = 3,
    Enable = 4,
    Clear = 5,
    MoveRelative = 6,
    MoveAbsolute = 7,
    DigitalOutput = 8,
    DigitalInput = 9,
    IsMoving = 10,
    CurrentPosition = 11,
    MoveSpeed = 12,
    SetRobotId = 13,
    GetRobotId = 14,
    Home = 15,
}

impl Opcode {
    pub const ALL: [Opcode; 15] = [
        Opcode::Ping,
        Opcode::Stop,
        Opcode::Disable,
        Opcode::Enable,
        Opcode::Clear,
        Opcode::MoveRelative,
        Opcode::MoveAbsolute,
        Opcode::DigitalOutput,
        Opcode::DigitalInput,
        Opcode::IsMoving,
        Opcode::CurrentPosition,
        Opcode::MoveSpeed,
        Opcode::SetRobotId,
        Opcode::GetRobotId,
        Opcode::Home,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| *op as u8 == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    Error = 1,
    Busy = 2,
}

impl TryFrom<u8> for StatusCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::Error),
            2 => Ok(StatusCode::Busy),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

/// Decoded binary request. The opcode stays raw so unknown codes can be reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl CommandRequest {
    pub fn new(opcode: Opcode, payload: &[u8]) -> Self {
        Self {
            opcode: opcode as u8,
            payload: payload.to_vec(),
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        match frame {
            [opcode, len, rest @ ..] => Ok(Self {
                opcode: *opcode,
                payload: take_payload(*len, rest, 2)?,
            }),
            _ => Err(WireError::Truncated {
                needed: 2,
                got: frame.len(),
            }),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        check_size(&self.payload)?;
        let mut frame = Vec::with_capacity(2 + self.payload.len());
        frame.push(self.opcode);
        frame.push(self.payload.len() as u8);
        frame.extend_from_slice(&self.payload);
        Ok(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub opcode: u8,
    pub status: StatusCode,
    pub payload: Vec<u8>,
}

impl CommandResponse {
    pub fn ok(opcode: u8, payload: &[u8]) -> Self {
        Self {
            opcode,
            status: StatusCode::Ok,
            payload: payload.to_vec(),
        }
    }

    pub fn error(opcode: u8) -> Self {
        Self {
            opcode,
            status: StatusCode::Error,
            payload: Vec::new(),
        }
    }

    pub fn busy(opcode: u8, mask: u8) -> Self {
        Self {
            opcode,
            status: StatusCode::Busy,
            payload: vec![mask],
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        match frame {
            [opcode, status, len, rest @ ..] => Ok(Self {
                opcode: *opcode,
                status: StatusCode::try_from(*status)?,
                payload: take_payload(*len, rest, 3)?,
            }),
            _ => Err(WireError::Truncated {
                needed: 3,
                got: frame.len(),
            }),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        check_size(&self.payload)?;
        let mut frame = Vec::with_capacity(3 + self.payload.len());
        frame.push(self.opcode);
        frame.push(self.status as u8);
        frame.push(self.payload.len() as u8);
        frame.extend_from_slice(&self.payload);
        Ok(frame)
    }
}

fn take_payload(len: u8, rest: &[u8], header: usize) -> Result<Vec<u8>, WireError> {
    let len = len as usize;
    if len > MAX_PAYLOAD {
        return Err(WireError::Oversized(len));
    }
    match rest.get(..len) {
        Some(payload) => Ok(payload.to_vec()),
        None => Err(WireError::Truncated {
            needed: header + len,
            got: header + rest.len(),
        }),
    }
}

fn check_size(payload: &[u8]) -> Result<(), WireError> {
    if payload.len() > MAX_PAYLOAD {
        Err(WireError::Oversized(payload.len()))
    } else {
        Ok(())
    }
}

/// Per-axis position and speed, as carried by the move and position opcodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JointRecord {
    pub positions: [i16; NUM_AXES],
    pub speeds: [i16; NUM_AXES],
}

impl JointRecord {
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let Some(bytes) = bytes.get(..JOINT_RECORD_LEN) else {
            return Err(WireError::Truncated {
                needed: JOINT_RECORD_LEN,
                got: bytes.len(),
            });
        };
        let mut record = Self::default();
        for (i, pair) in bytes.chunks_exact(4).enumerate() {
            record.positions[i] = i16::from_le_bytes([pair[0], pair[1]]);
            record.speeds[i] = i16::from_le_bytes([pair[2], pair[3]]);
        }
        Ok(record)
    }

    pub fn encode(&self) -> [u8; JOINT_RECORD_LEN] {
        let mut out = [0u8; JOINT_RECORD_LEN];
        for (i, pair) in out.chunks_exact_mut(4).enumerate() {
            pair[..2].copy_from_slice(&self.positions[i].to_le_bytes());
            pair[2..].copy_from_slice(&self.speeds[i].to_le_bytes());
        }
        out
    }

    /// Positions saturated into the record's range
    pub fn from_state(positions: [i32; NUM_AXES], speeds: [f32; NUM_AXES]) -> Self {
        Self {
            positions: positions.map(|p| p.clamp(i16::MIN as i32, i16::MAX as i32) as i16),
            // `as` saturates float to int
            speeds: speeds.map(|s| s.round() as i16),
        }
    }

    pub fn targets(&self) -> [i32; NUM_AXES] {
        self.positions.map(i32::from)
    }

    pub fn speeds_f32(&self) -> [f32; NUM_AXES] {
        self.speeds.map(f32::from)
    }
}

// Gamepad state from the teleop source -> runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GamepadSample {
    pub connected: bool,
    pub left_x: i8,
    pub left_y: i8,
    pub right_x: i8,
    pub right_y: i8,
    pub l2: u8,
    pub r2: u8,
    pub l1: bool,
    pub r1: bool,
    pub cross: bool,
    pub circle: bool,
    pub square: bool,
    pub triangle: bool,
}

// Actuation published by the runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmActuation {
    pub enabled: bool,
    pub busy_mask: u8,
    pub positions: [i32; NUM_AXES],
    pub speeds: [f32; NUM_AXES],
    /// Net physical step pulses per axis
    pub pulses: Option<[i64; NUM_AXES]>,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    Homing,
    SafetyStop,
}
