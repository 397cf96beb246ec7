// Keyboard gamepad: WASD left stick, IJKL right stick, E toggles R1,
// U/O open/close gripper, Enter enables, Space disables, R/F deflection, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use tracing::info;

use robko_zenoh_runtime::config::TOPIC_CMD_TELEOP;
use robko_zenoh_runtime::messages::GamepadSample;

const DEFLECTIONS: [i8; 3] = [40, 80, 127]; // stick counts
const INPUT_TIMEOUT_MS: u64 = 100; // Release sticks after this much time with no input

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_TELEOP).await?;

    info!("Controls: WASD/IJKL=sticks, E=R1, U/O=gripper, Enter=enable, Space=disable, R/F=deflection, Q=quit");
    print_deflection(0);

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    // Let the runtime stop acting on this source straight away
    let bye = GamepadSample::default();
    publisher.put(serde_json::to_string(&bye)?).await?;

    result
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut level: usize = 0;
    let mut r1 = false;

    let mut pad = GamepadSample::default();
    let mut last_input = Instant::now();

    loop {
        // Buttons are momentary: pressed for exactly one published sample
        pad.circle = false;
        pad.cross = false;

        // Poll for key with 20ms timeout (50Hz effective rate)
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;
                let deflection = DEFLECTIONS[level];

                match code {
                    // Left stick: base and shoulder
                    KeyCode::Char('a') if pressed => pad.left_x = -deflection,
                    KeyCode::Char('d') if pressed => pad.left_x = deflection,
                    KeyCode::Char('w') if pressed => pad.left_y = deflection,
                    KeyCode::Char('s') if pressed => pad.left_y = -deflection,

                    // Right stick: elbow, or the wrist pair with R1
                    KeyCode::Char('j') if pressed => pad.right_x = -deflection,
                    KeyCode::Char('l') if pressed => pad.right_x = deflection,
                    KeyCode::Char('i') if pressed => pad.right_y = deflection,
                    KeyCode::Char('k') if pressed => pad.right_y = -deflection,

                    // Gripper trigger, L1 flips it to closing
                    KeyCode::Char('u') if pressed => {
                        pad.l2 = u8::MAX;
                        pad.l1 = false;
                    }
                    KeyCode::Char('o') if pressed => {
                        pad.l2 = u8::MAX;
                        pad.l1 = true;
                    }

                    KeyCode::Char('e') if pressed => {
                        r1 = !r1;
                        info!("R1: {}", if r1 { "wrist" } else { "elbow" });
                        continue;
                    }
                    KeyCode::Enter if pressed => {
                        pad.circle = true;
                        info!("Enable");
                    }
                    KeyCode::Char(' ') if pressed => {
                        pad.cross = true;
                        info!("Disable");
                    }

                    KeyCode::Char('r') if pressed => {
                        level = (level + 1).min(DEFLECTIONS.len() - 1);
                        print_deflection(level);
                        continue;
                    }
                    KeyCode::Char('f') if pressed => {
                        level = level.saturating_sub(1);
                        print_deflection(level);
                        continue;
                    }

                    // Quit
                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => continue,
                }
                last_input = Instant::now();
            }
        }

        // Release sticks and trigger if no input for INPUT_TIMEOUT_MS
        if last_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            pad = GamepadSample::default();
        }
        pad.connected = true;
        pad.r1 = r1;

        // Always publish at ~50Hz
        publisher.put(serde_json::to_string(&pad)?).await?;
    }

    Ok(())
}

fn print_deflection(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Deflection: {}", label);
}
