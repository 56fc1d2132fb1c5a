// Servo scan: READ-ONLY check of both servo buses of one node
//
// Lights the LED of every servo that answers, reads back its position and
// reports the node role the ids imply. Nothing moves.
//
// Usage: cargo run --example servo_scan -- --right /dev/ttyUSB0 --left /dev/ttyUSB1

use clap::Parser;
use hexapod_runtime::config::{SERIAL_TIMEOUT, SERVO_BAUD, SERVO_LEFT_PORT, SERVO_RETRY_BUDGET, SERVO_RIGHT_PORT};
use hexapod_runtime::hal::SerialTransport;
use hexapod_runtime::motion::RobotState;
use hexapod_runtime::protocol::servo::{role_of, side_of, DISCOVERY_IDS};
use hexapod_runtime::protocol::{LinkChannel, ServoBus};

#[derive(Parser, Debug)]
#[command(about = "Read-only scan of the servo buses", long_about = None)]
struct Cli {
    #[arg(long, default_value = SERVO_RIGHT_PORT)]
    right: String,

    #[arg(long, default_value = SERVO_LEFT_PORT)]
    left: String,

    /// Servo buses read back their own transmissions
    #[arg(long)]
    echo: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::DEBUG.into()),
        )
        .init();

    let cli = Cli::parse();
    println!("Right bus: {}", cli.right);
    println!("Left bus:  {}", cli.left);
    println!();

    let right = SerialTransport::open(&cli.right, SERVO_BAUD, SERIAL_TIMEOUT)?;
    let left = SerialTransport::open(&cli.left, SERVO_BAUD, SERIAL_TIMEOUT)?;
    let mut bus = ServoBus::new(
        LinkChannel::new("servo-r", Box::new(right), SERVO_RETRY_BUDGET).with_echo_suppression(cli.echo),
        LinkChannel::new("servo-l", Box::new(left), SERVO_RETRY_BUDGET).with_echo_suppression(cli.echo),
    );

    let discovery = bus.discover(DISCOVERY_IDS);
    println!("{:>4}  {:<6} {:<5} {:>9}", "id", "side", "joint", "angle");
    for &id in &discovery.responders {
        let angle = match bus.read_angle(id) {
            Some(angle) => format!("{:.1}", angle),
            None => "-".to_string(),
        };
        println!("{:>4}  {:<6} {:<5} {:>9}", id, format!("{:?}", side_of(id)), format!("{:?}", role_of(id)), angle);
        bus.set_led(id, false);
    }
    println!();

    match RobotState::from_discovery(&discovery) {
        Ok(state) => println!("Node role: {:?}", state.role),
        Err(e) => println!("No role: {}", e),
    }
    Ok(())
}
