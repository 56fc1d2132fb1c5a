// Node boot and main loop
//
// Discover the local servos, derive the node role from the left hip id,
// then run either the gait coordinator (master) or the command dispatcher
// (slaves) until cancelled.

use tracing::{info, warn};

use crate::config::RobotConfig;
use crate::dispatcher::SlaveDispatcher;
use crate::hal::{SerialTransport, Transport};
use crate::messages::{NodeId, NodeRole};
use crate::motion::gait::{GaitCoordinator, GaitError};
use crate::motion::leg::{LegController, LegError, RobotState};
use crate::protocol::intercpu::InterCpu;
use crate::protocol::link::{CancelToken, LinkChannel};
use crate::protocol::servo::{DISCOVERY_IDS, ServoBus};

/// Node-to-node serial links, named after the board connectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLink {
    /// Master to slave A
    Com1,
    /// Master to slave B, or slave to master
    Com3,
}

/// Error types for booting and running a node
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Cannot open serial port {port}: {source}")]
    Serial {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("No serial port configured for {0:?}")]
    MissingLink(NodeLink),

    #[error(transparent)]
    Leg(#[from] LegError),

    #[error("Left hip id {hip} does not match any node role")]
    Unassigned { hip: u8 },

    #[error("Right hip {right} and left hip {left} belong to different nodes")]
    MixedLegs { right: u8, left: u8 },

    #[error(transparent)]
    Gait(#[from] GaitError),
}

/// A booted node, ready to run
pub enum Node {
    Master(GaitCoordinator),
    Slave(SlaveDispatcher),
}

impl Node {
    pub fn role(&self) -> NodeRole {
        match self {
            Node::Master(gait) => gait.state().role,
            Node::Slave(dispatcher) => dispatcher.state().role,
        }
    }

    /// Run until cancelled; the master also stops after `cycles` gait cycles
    pub fn run(self, cycles: Option<u64>) -> Result<(), RuntimeError> {
        match self {
            Node::Master(mut gait) => {
                let done = gait.run(cycles)?;
                info!(cycles = done, "Master finished");
            }
            Node::Slave(mut dispatcher) => dispatcher.run(),
        }
        Ok(())
    }
}

/// Bring up a node on the given servo buses
///
/// `open_link` is only asked for the node links the discovered role needs.
pub fn boot<F>(
    config: &RobotConfig,
    servo_right: Box<dyn Transport>,
    servo_left: Box<dyn Transport>,
    mut open_link: F,
    cancel: CancelToken,
) -> Result<Node, RuntimeError>
where
    F: FnMut(NodeLink) -> Result<Box<dyn Transport>, RuntimeError>,
{
    let links = &config.links;
    let channel = |name: &str, transport: Box<dyn Transport>, budget: u32| {
        LinkChannel::new(name, transport, budget)
            .with_checksum_recovery(links.checksum_recovery)
            .with_cancel_token(cancel.clone())
    };
    let servo_channel = |name: &str, transport: Box<dyn Transport>| {
        channel(name, transport, links.servo_retry_budget).with_echo_suppression(links.servo_echo)
    };

    let mut bus = ServoBus::new(servo_channel("servo-r", servo_right), servo_channel("servo-l", servo_left));
    let discovery = bus.discover(DISCOVERY_IDS);
    let mut state = RobotState::from_discovery(&discovery)?;

    let (right_hip, left_hip) = (state.right.hip.id, state.left.hip.id);
    if state.role == NodeRole::Unassigned {
        return Err(RuntimeError::Unassigned { hip: left_hip });
    }
    if right_hip + 3 != left_hip {
        return Err(RuntimeError::MixedLegs {
            right: right_hip,
            left: left_hip,
        });
    }

    let mut legs = LegController::new(bus, config.geometry);
    legs.read_back(&mut state.right);
    legs.read_back(&mut state.left);
    info!(role = ?state.role, "Node role assigned");

    let node = match state.role.node_id() {
        NodeId::Master => {
            let intercpu = InterCpu::for_master(
                channel("com1", open_link(NodeLink::Com1)?, links.node_retry_budget),
                channel("com3", open_link(NodeLink::Com3)?, links.node_retry_budget),
            );
            let gait = GaitCoordinator::new(state, legs, intercpu, config.style.build(), config.gait.clone())
                .with_cancel_token(cancel);
            Node::Master(gait)
        }
        own_id => {
            let intercpu = InterCpu::for_slave(
                own_id,
                channel("com3", open_link(NodeLink::Com3)?, links.node_retry_budget),
            );
            Node::Slave(SlaveDispatcher::new(state, legs, intercpu).with_cancel_token(cancel))
        }
    };
    Ok(node)
}

fn open_serial(port: &str, baud: u32, config: &RobotConfig) -> Result<Box<dyn Transport>, RuntimeError> {
    info!("Opening {} at {} baud", port, baud);
    let transport = SerialTransport::open(port, baud, config.serial_timeout()).map_err(|source| RuntimeError::Serial {
        port: port.to_string(),
        source,
    })?;
    Ok(Box::new(transport))
}

/// Open the configured serial ports, boot and run until cancelled
pub fn run(config: RobotConfig, cancel: CancelToken, cycles: Option<u64>) -> Result<(), RuntimeError> {
    let servo_right = open_serial(&config.ports.servo_right, config.links.servo_baud, &config)?;
    let servo_left = open_serial(&config.ports.servo_left, config.links.servo_baud, &config)?;

    let open_link = |link: NodeLink| -> Result<Box<dyn Transport>, RuntimeError> {
        let port = match link {
            NodeLink::Com1 => config.ports.com1.as_deref().ok_or(RuntimeError::MissingLink(link))?,
            NodeLink::Com3 => config.ports.com3.as_str(),
        };
        open_serial(port, config.links.node_baud, &config)
    };

    let node = boot(&config, servo_right, servo_left, open_link, cancel.clone())?;
    let result = node.run(cycles);
    if cancel.is_cancelled() {
        warn!("Stopped by user");
    }
    result
}
