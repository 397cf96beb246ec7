// Fixed-rate host for the arm controller
// Zenoh carries binary frames, gamepad samples and raw inputs in, replies,
// actuation and health out. The serial port carries the ASCII line protocol.
// Everything received between two ticks is handed to the controller at once.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{
    ControllerConfig, SERIAL_BAUDRATE, SERIAL_ENABLED, SERIAL_PORT, STATUS_EVERY_TICKS,
    TELEOP_STALE_AFTER, TOPIC_CMD_SUPER, TOPIC_CMD_TELEOP, TOPIC_HEALTH, TOPIC_IO_INPUTS,
    TOPIC_REPLY_SUPER, TOPIC_RT_ARM,
};
use crate::controller::{ArmController, TickInput, TickOutput};
use crate::inputs::RawInputs;
use crate::messages::{CommandRequest, GamepadSample, RuntimeHealth};
use crate::motion::PulseCounter;

const SERIAL_TIMEOUT_MS: u64 = 5;

/// Host-side settings that never reach the controller core
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub serial_port: String,
    pub baud_rate: u32,
    pub serial_enabled: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            serial_port: SERIAL_PORT.to_string(),
            baud_rate: SERIAL_BAUDRATE,
            serial_enabled: SERIAL_ENABLED,
        }
    }
}

/// Serial terminal carrying the ASCII line protocol
pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()?;
        Ok(Self { port })
    }

    /// Append whatever is already buffered without waiting for more
    pub fn read_available(&mut self, buf: &mut Vec<u8>) -> std::io::Result<usize> {
        let pending = self.port.bytes_to_read()? as usize;
        if pending > 0 {
            let start = buf.len();
            buf.resize(start + pending, 0);
            self.port.read_exact(&mut buf[start..])?;
        }
        Ok(pending)
    }

    pub fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }
}

pub struct Runtime {
    controller: ArmController,
    requests: Vec<CommandRequest>,
    gamepad: Option<(GamepadSample, Instant)>,
    /// Circle/Cross seen since the last teleop poll
    held_buttons: (bool, bool),
    raw_inputs: Option<RawInputs>,
    health: RuntimeHealth,
}

impl Runtime {
    pub fn new(controller: ArmController) -> Self {
        Self {
            controller,
            requests: Vec::new(),
            gamepad: None,
            held_buttons: (false, false),
            raw_inputs: None,
            health: RuntimeHealth::CmdStale, // Stale until the first command
        }
    }

    pub fn controller(&self) -> &ArmController {
        &self.controller
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Queue one binary request frame for the next tick
    pub fn on_request(&mut self, frame: &[u8]) {
        match CommandRequest::decode(frame) {
            Ok(request) => self.requests.push(request),
            Err(e) => warn!("Dropping malformed request frame: {}", e),
        }
    }

    /// Keep the latest sample; button presses stick until the mapper polls
    pub fn on_gamepad(&mut self, sample: GamepadSample, received_at: Instant) {
        self.held_buttons.0 |= sample.circle;
        self.held_buttons.1 |= sample.cross;
        self.gamepad = Some((sample, received_at));
    }

    pub fn on_inputs(&mut self, raw: RawInputs) {
        self.raw_inputs = Some(raw);
    }

    /// Latest gamepad sample, or `None` once it is too old to trust
    fn fresh_gamepad(&self, now: Instant) -> Option<GamepadSample> {
        let (mut sample, received_at) = self.gamepad?;
        if now.saturating_duration_since(received_at) > TELEOP_STALE_AFTER {
            return None;
        }
        sample.circle |= self.held_buttons.0;
        sample.cross |= self.held_buttons.1;
        Some(sample)
    }

    /// Run one controller tick over everything queued since the last one
    pub fn step(&mut self, serial_in: &[u8], now: Instant) -> TickOutput {
        let gamepad = self.fresh_gamepad(now);
        let raw_inputs = self.raw_inputs.take();
        let requests = std::mem::take(&mut self.requests);

        let out = self.controller.tick(TickInput {
            requests: &requests,
            serial_in,
            gamepad: gamepad.as_ref(),
            raw_inputs: raw_inputs.as_ref(),
        });

        if out.teleop_polled {
            self.held_buttons = (false, false);
        }

        let health = self.controller.health();
        if health != self.health {
            match health {
                RuntimeHealth::Ok => info!("Health: {:?}", health),
                _ => warn!("Health: {:?}", health),
            }
            self.health = health;
        }
        out
    }
}

pub async fn run(
    config: ControllerConfig,
    options: RuntimeOptions,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let controller = ArmController::new(config, Box::new(PulseCounter::new()))?;
    let period = controller.tick_period();

    let mut serial = if options.serial_enabled {
        match SerialLink::open(&options.serial_port, options.baud_rate) {
            Ok(link) => {
                info!(
                    "Serial terminal on {} at {} baud",
                    options.serial_port, options.baud_rate
                );
                Some(link)
            }
            Err(e) => {
                warn!(
                    "Failed to open {}: {}, continuing without serial",
                    options.serial_port, e
                );
                None
            }
        }
    } else {
        info!("Serial terminal disabled");
        None
    };

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let sub_requests = session.declare_subscriber(TOPIC_CMD_SUPER).await?;
    let sub_teleop = session.declare_subscriber(TOPIC_CMD_TELEOP).await?;
    let sub_inputs = session.declare_subscriber(TOPIC_IO_INPUTS).await?;
    let pub_reply = session.declare_publisher(TOPIC_REPLY_SUPER).await?;
    let pub_actuation = session.declare_publisher(TOPIC_RT_ARM).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let mut runtime = Runtime::new(controller);
    let mut tick = interval(period);

    info!("Runtime started: {:?} tick", period);
    info!(
        "Subscribed to: {}, {}, {}",
        TOPIC_CMD_SUPER, TOPIC_CMD_TELEOP, TOPIC_IO_INPUTS
    );
    info!(
        "Publishing to: {}, {}, {}",
        TOPIC_REPLY_SUPER, TOPIC_RT_ARM, TOPIC_HEALTH
    );

    loop {
        tick.tick().await;
        let now = Instant::now();

        // 1. Drain everything that arrived since the last tick
        while let Ok(Some(sample)) = sub_requests.try_recv() {
            runtime.on_request(&sample.payload().to_bytes());
        }
        while let Ok(Some(sample)) = sub_teleop.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<GamepadSample>(&payload) {
                Ok(gamepad) => runtime.on_gamepad(gamepad, now),
                Err(e) => warn!("Failed to parse gamepad sample: {}", e),
            }
        }
        while let Ok(Some(sample)) = sub_inputs.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<RawInputs>(&payload) {
                Ok(raw) => runtime.on_inputs(raw),
                Err(e) => warn!("Failed to parse inputs: {}", e),
            }
        }

        let mut serial_in = Vec::new();
        let read = serial.as_mut().map(|link| link.read_available(&mut serial_in));
        if let Some(Err(e)) = read {
            warn!("Serial read failed: {}, closing terminal", e);
            serial_in.clear();
            serial = None;
        }

        // 2. Tick the controller
        let out = runtime.step(&serial_in, now);

        // 3. Replies
        for response in &out.responses {
            match response.encode() {
                Ok(frame) => pub_reply.put(frame).await?,
                Err(e) => warn!("Dropping response to opcode {}: {}", response.opcode, e),
            }
        }
        if !out.serial_out.is_empty() {
            if let Some(link) = serial.as_mut() {
                if let Err(e) = link.write(&out.serial_out) {
                    warn!("Serial write failed: {}, closing terminal", e);
                    serial = None;
                }
            }
        }

        // 4. Status, decimated
        if runtime.controller().ticks() % STATUS_EVERY_TICKS == 0 {
            let actuation = runtime.controller().actuation();
            debug!("Actuation: {:?}", actuation);
            pub_actuation.put(serde_json::to_string(&actuation)?).await?;
            pub_health.put(serde_json::to_string(&runtime.health())?).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Opcode, StatusCode};

    fn runtime() -> Runtime {
        let controller =
            ArmController::new(ControllerConfig::default(), Box::new(PulseCounter::new()))
                .unwrap();
        Runtime::new(controller)
    }

    #[test]
    fn test_malformed_frame_dropped() {
        let mut rt = runtime();
        rt.on_request(&[Opcode::Ping as u8, 5, 1]);
        let out = rt.step(&[], Instant::now());
        assert!(out.responses.is_empty());
    }

    #[test]
    fn test_requests_answered_once() {
        let mut rt = runtime();
        let frame = CommandRequest::new(Opcode::Enable, &[]).encode().unwrap();
        rt.on_request(&frame);
        let now = Instant::now();
        let out = rt.step(&[], now);
        assert_eq!(out.responses.len(), 1);
        assert_eq!(out.responses[0].status, StatusCode::Ok);
        assert_eq!(rt.health(), RuntimeHealth::Ok);
        assert!(rt.step(&[], now).responses.is_empty());
    }

    #[test]
    fn test_stale_gamepad_treated_as_disconnected() {
        let mut rt = runtime();
        let received = Instant::now();
        let sample = GamepadSample {
            connected: true,
            ..Default::default()
        };
        rt.on_gamepad(sample, received);
        assert_eq!(rt.fresh_gamepad(received), Some(sample));
        assert_eq!(rt.fresh_gamepad(received + TELEOP_STALE_AFTER), Some(sample));
        let late = received + TELEOP_STALE_AFTER + Duration::from_millis(1);
        assert_eq!(rt.fresh_gamepad(late), None);
    }

    #[test]
    fn test_button_press_between_polls_is_not_lost() {
        let mut rt = runtime();
        let now = Instant::now();
        let idle = GamepadSample {
            connected: true,
            ..Default::default()
        };
        let press = GamepadSample {
            circle: true,
            ..idle
        };

        // Pressed for one sample early in the poll interval, released after
        rt.on_gamepad(press, now);
        rt.step(&[], now);
        let mut polled = false;
        for _ in 0..200 {
            rt.on_gamepad(idle, now);
            if rt.step(&[], now).teleop_polled {
                polled = true;
                break;
            }
        }
        assert!(polled);
        assert!(rt.controller().core().engine().motors_enabled());

        // Consumed by that poll
        assert_eq!(rt.fresh_gamepad(now), Some(idle));
    }

    #[test]
    fn test_serial_bytes_reach_line_interpreter() {
        let mut rt = runtime();
        let out = rt.step(b"@RESET\r", Instant::now());
        let text = String::from_utf8(out.serial_out).unwrap();
        assert!(text.ends_with("\r\nOK\r\n"), "{text:?}");
    }
}
