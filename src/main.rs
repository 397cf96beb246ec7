use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use robko_zenoh_runtime::config::{ControllerConfig, SERIAL_BAUDRATE, SERIAL_ENABLED, SERIAL_PORT};
use robko_zenoh_runtime::runtime::{self, RuntimeOptions};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON controller config; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial device carrying the ASCII terminal
    #[arg(long, default_value = SERIAL_PORT)]
    serial_port: String,

    #[arg(long, default_value_t = SERIAL_BAUDRATE)]
    baud: u32,

    /// Run without the serial terminal
    #[arg(long)]
    no_serial: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match ControllerConfig::load(path) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                eprintln!("Config error: {}", e);
                std::process::exit(1);
            }
        },
        None => ControllerConfig::default(),
    };

    let options = RuntimeOptions {
        serial_port: args.serial_port,
        baud_rate: args.baud,
        serial_enabled: SERIAL_ENABLED && !args.no_serial,
    };

    if let Err(e) = runtime::run(config, options).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
