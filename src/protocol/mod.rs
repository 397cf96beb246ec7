// Command front ends
//
// - binary: opcode table behind the network command topic
// - ascii: character-at-a-time line interpreter behind the serial port
// Both check preconditions generically from their table rows before a
// handler runs.

pub mod ascii;
pub mod binary;

pub use ascii::{LineBuffer, LineEvent, LineInterpreter};
pub use binary::{dispatch, lookup, Feed, OpcodeEntry, OPCODE_TABLE};

use crate::messages::WireError;
use crate::motion::MotionError;

/// Why a command was not carried out
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Rejected(#[from] MotionError),

    #[error("Malformed payload: {0}")]
    Payload(#[from] WireError),

    #[error("Unknown command {0:?}")]
    UnknownCommand(String),

    #[error("{name} takes {expected} arguments, got {got}")]
    Arity {
        name: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Not a number: {0:?}")]
    BadNumber(String),
}
