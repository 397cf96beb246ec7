// ASCII line protocol (serial terminal)
//
// Bytes arrive one at a time. A CR or LF completes the line, commas count
// as spaces, backspace and the left-arrow sequence step the write index
// back. Filling the buffer discards the line.
//
// Commands:
//   FREE                          release all axes
//   @CLOSE                        home the gripper, reply when done
//   HOME                          home every axis, reply when done
//   @READ                         "p1, p2, p3, p4, p5, p6, inputs"
//   @RESET                        zero all positions
//   @SET <speed>                  store the line speed
//   @STEP <speed> <t1..t6> <do>   absolute move, drivers enabled

use tracing::{debug, warn};

use super::CommandError;
use crate::config::{AsciiConfig, MAX_RESPONSE_SIZE, NUM_AXES};
use crate::controller::ArmCore;
use crate::homing::{HomingSequence, HomingStatus};
use crate::motion::MotionEngine;

pub const KEY_BACKSPACE: u8 = 0x7F;
pub const KEY_CTRL_H: u8 = 0x08;
const KEY_ESC: u8 = 0x1B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    Idle,
    Esc,
    Csi,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Pending,
    /// Normalized line, ready for the command table
    Line(String),
    Overflow,
}

/// Fixed-capacity line assembly buffer
#[derive(Debug, Clone)]
pub struct LineBuffer {
    buf: Vec<u8>,
    write_index: usize,
    line_length: usize,
    escape: Escape,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(2)],
            write_index: 0,
            line_length: 0,
            escape: Escape::Idle,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn write_index(&self) -> usize {
        self.write_index
    }

    pub fn clear(&mut self) {
        self.buf.fill(0);
        self.write_index = 0;
        self.line_length = 0;
        self.escape = Escape::Idle;
    }

    pub fn push(&mut self, byte: u8) -> LineEvent {
        match self.escape {
            Escape::Esc => {
                self.escape = Escape::Idle;
                if byte == b'[' {
                    self.escape = Escape::Csi;
                    return LineEvent::Pending;
                }
                // Not a CSI sequence: handle the byte normally
            }
            Escape::Csi => {
                self.escape = Escape::Idle;
                if byte == b'D' {
                    self.write_index = self.write_index.saturating_sub(1);
                }
                return LineEvent::Pending;
            }
            Escape::Idle => {}
        }

        match byte {
            KEY_ESC => {
                self.escape = Escape::Esc;
                return LineEvent::Pending;
            }
            KEY_BACKSPACE | KEY_CTRL_H => {
                self.write_index = self.write_index.saturating_sub(1);
                return LineEvent::Pending;
            }
            _ => {}
        }

        self.buf[self.write_index] = byte;
        self.write_index += 1;
        if byte == b'\r' || byte == b'\n' {
            self.line_length = self.write_index;
        }

        if self.write_index >= self.buf.len() {
            warn!("Maximum line length exceeded, line discarded");
            self.clear();
            return LineEvent::Overflow;
        }

        if self.line_length != 0 && self.write_index == self.line_length {
            let line = normalize(&self.buf[..self.line_length]);
            self.clear();
            return LineEvent::Line(line);
        }
        LineEvent::Pending
    }
}

fn normalize(raw: &[u8]) -> String {
    let end = raw
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(raw.len());
    let text: Vec<u8> = raw[..end]
        .iter()
        .map(|&b| if b == b',' { b' ' } else { b })
        .collect();
    String::from_utf8_lossy(&text).into_owned()
}

/// Framed reply, bounded to the response buffer size
pub fn frame(body: &str) -> Vec<u8> {
    let mut end = body.len().min(MAX_RESPONSE_SIZE - 4);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("\r\n{}\r\n", &body[..end]).into_bytes()
}

#[derive(Debug, Clone, PartialEq)]
enum LineReply {
    Ok,
    Data(String),
    /// Reply follows when the homing run ends
    Deferred,
}

type LineResult = Result<LineReply, CommandError>;
type LineHandler = fn(&mut LineInterpreter, &mut ArmCore, &[f64]) -> LineResult;

struct LineCommand {
    name: &'static str,
    arity: usize,
    requires_idle: bool,
    run: LineHandler,
}

const fn command(
    name: &'static str,
    arity: usize,
    requires_idle: bool,
    run: LineHandler,
) -> LineCommand {
    LineCommand {
        name,
        arity,
        requires_idle,
        run,
    }
}

static COMMANDS: [LineCommand; 7] = [
    command("FREE", 0, false, cmd_free),
    command("@CLOSE", 0, true, cmd_close),
    command("HOME", 0, true, cmd_home),
    command("@READ", 0, false, cmd_read),
    command("@RESET", 0, true, cmd_reset),
    command("@SET", 1, false, cmd_set),
    command("@STEP", 8, true, cmd_step),
];

pub struct LineInterpreter {
    buffer: LineBuffer,
    config: AsciiConfig,
    speed: f32,
    awaiting_homing: bool,
}

impl LineInterpreter {
    pub fn new(config: AsciiConfig) -> Self {
        Self {
            buffer: LineBuffer::new(config.line_length),
            config,
            speed: 0.0,
            awaiting_homing: false,
        }
    }

    pub fn buffer(&self) -> &LineBuffer {
        &self.buffer
    }

    /// Speed stored by `@SET` / `@STEP`
    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn awaiting_homing(&self) -> bool {
        self.awaiting_homing
    }

    /// Feed one received byte; returns echo plus any reply
    pub fn push_byte(&mut self, byte: u8, core: &mut ArmCore) -> Vec<u8> {
        let mut out = Vec::new();
        if self.config.echo {
            out.push(byte);
        }
        if let LineEvent::Line(line) = self.buffer.push(byte) {
            out.extend(self.execute(&line, core));
        }
        out
    }

    /// Run one complete line against the command table
    pub fn execute(&mut self, line: &str, core: &mut ArmCore) -> Vec<u8> {
        let mut tokens = line.split_whitespace();
        let Some(name) = tokens.next() else {
            return Vec::new();
        };
        let args: Vec<&str> = tokens.collect();
        debug!("Line command: {} {:?}", name, args);

        match self.run(name, &args, core) {
            Ok(LineReply::Ok) => frame("OK"),
            Ok(LineReply::Data(data)) => frame(&data),
            Ok(LineReply::Deferred) => {
                self.awaiting_homing = true;
                Vec::new()
            }
            Err(CommandError::Rejected(e)) if !self.config.strict_replies => {
                warn!("{} rejected ({}), replying OK", name, e);
                frame("OK")
            }
            Err(e) => {
                warn!("{} failed: {}", name, e);
                frame(&format!("ERROR: {e}"))
            }
        }
    }

    fn run(&mut self, name: &str, args: &[&str], core: &mut ArmCore) -> LineResult {
        let command = COMMANDS
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
        core.feed_watchdog();

        if args.len() != command.arity {
            return Err(CommandError::Arity {
                name: command.name,
                expected: command.arity,
                got: args.len(),
            });
        }
        let numbers = args
            .iter()
            .map(|a| a.parse::<f64>().map_err(|_| CommandError::BadNumber(a.to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        core.check(false, command.requires_idle)?;
        (command.run)(self, core, &numbers)
    }

    /// Deferred reply for `@CLOSE` / `HOME`
    pub fn homing_finished(&mut self, status: HomingStatus) -> Option<Vec<u8>> {
        if !self.awaiting_homing {
            return None;
        }
        self.awaiting_homing = false;
        match status {
            HomingStatus::Failed { axis, phase } if self.config.strict_replies => Some(frame(
                &format!("ERROR: homing {:?} on {}", phase, MotionEngine::axis_name(axis)),
            )),
            _ => Some(frame("OK")),
        }
    }
}

fn cmd_free(_line: &mut LineInterpreter, core: &mut ArmCore, _args: &[f64]) -> LineResult {
    core.latch_disable("FREE");
    Ok(LineReply::Ok)
}

fn cmd_close(_line: &mut LineInterpreter, core: &mut ArmCore, _args: &[f64]) -> LineResult {
    core.start_homing(HomingSequence::Gripper)?;
    Ok(LineReply::Deferred)
}

fn cmd_home(_line: &mut LineInterpreter, core: &mut ArmCore, _args: &[f64]) -> LineResult {
    core.start_homing(HomingSequence::Full)?;
    Ok(LineReply::Deferred)
}

fn cmd_read(_line: &mut LineInterpreter, core: &mut ArmCore, _args: &[f64]) -> LineResult {
    let p = core
        .engine()
        .positions()
        .map(|p| p.clamp(i16::MIN as i32, i16::MAX as i32));
    Ok(LineReply::Data(format!(
        "{}, {}, {}, {}, {}, {}, {}",
        p[0],
        p[1],
        p[2],
        p[3],
        p[4],
        p[5],
        core.inputs_byte()
    )))
}

fn cmd_reset(_line: &mut LineInterpreter, core: &mut ArmCore, _args: &[f64]) -> LineResult {
    core.engine.zero();
    Ok(LineReply::Ok)
}

fn cmd_set(line: &mut LineInterpreter, _core: &mut ArmCore, args: &[f64]) -> LineResult {
    line.speed = args[0] as f32;
    Ok(LineReply::Ok)
}

fn cmd_step(line: &mut LineInterpreter, core: &mut ArmCore, args: &[f64]) -> LineResult {
    line.speed = args[0] as f32;
    let targets: [i32; NUM_AXES] = std::array::from_fn(|i| args[i + 1] as i32);
    // args[7] is the reserved digital-output field
    core.set_enabled(true);
    core.engine.set_absolute(targets, [line.speed; NUM_AXES])?;
    Ok(LineReply::Ok)
}
