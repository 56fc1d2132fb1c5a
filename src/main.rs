use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use hexapod_runtime::config::{ConfigError, RobotConfig};
use hexapod_runtime::motion::GaitStyleConfig;
use hexapod_runtime::protocol::CancelToken;
use hexapod_runtime::runtime;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Gait {
    FourPoint,
    Tripod,
}

#[derive(Parser, Debug)]
#[command(name = "hexapod-runtime")]
#[command(about = "Runs one node of the three-node hexapod", long_about = None)]
struct Args {
    /// JSON configuration file; defaults apply to anything it leaves out
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port of the right servo bus
    #[arg(long)]
    servo_right: Option<String>,

    /// Serial port of the left servo bus
    #[arg(long)]
    servo_left: Option<String>,

    /// Master only: link to slave A
    #[arg(long)]
    com1: Option<String>,

    /// Link to slave B (master) or to the master (slaves)
    #[arg(long)]
    com3: Option<String>,

    /// Gait style with its default stride
    #[arg(long, value_enum)]
    gait: Option<Gait>,

    /// Stop the master after this many gait cycles
    #[arg(long)]
    cycles: Option<u64>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    dump_config: bool,
}

impl Args {
    fn into_config(self) -> Result<RobotConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => RobotConfig::load(path)?,
            None => RobotConfig::default(),
        };

        if let Some(port) = self.servo_right {
            config.ports.servo_right = port;
        }
        if let Some(port) = self.servo_left {
            config.ports.servo_left = port;
        }
        if let Some(port) = self.com1 {
            config.ports.com1 = Some(port);
        }
        if let Some(port) = self.com3 {
            config.ports.com3 = port;
        }
        match self.gait {
            Some(Gait::FourPoint) => config.style = GaitStyleConfig::four_point(),
            Some(Gait::Tripod) => config.style = GaitStyleConfig::tripod(),
            None => {}
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init(); // installs the subscriber globally

    let args = Args::parse();
    let cycles = args.cycles;
    let dump = args.dump_config;

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {}", e);
            std::process::exit(1);
        }
    };

    if dump {
        match config.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Config error: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    // The node loop polls serial ports and blocks; Ctrl-C only trips the token
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let mut handle = tokio::task::spawn_blocking(move || runtime::run(config, token, cycles));

    let result = tokio::select! {
        result = &mut handle => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, stopping node");
            cancel.cancel();
            handle.await
        }
    };

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            eprintln!("Runtime error: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Node task failed: {}", e);
            std::process::exit(1);
        }
    }
}
