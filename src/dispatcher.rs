// Slave-side command dispatch
//
// Polls the link towards the master and executes one command per frame.
// Replies go to the master only for frames addressed to this node; a
// broadcast is executed silently since nobody waits for its answer.

use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::hal::{Delay, ThreadDelay};
use crate::messages::{ConfigFlags, Message, MessageError, NakCode, NodeId, STATUS_IS_ALIVE};
use crate::motion::kinematics::Point;
use crate::motion::leg::{LegController, RobotState};
use crate::protocol::intercpu::InterCpu;
use crate::protocol::link::CancelToken;
use crate::protocol::packet::Packet;

/// Outcome of handling one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing received
    Idle,
    /// Addressed to another node
    Ignored,
    Status,
    Action,
    Point { accepted: bool },
    Angle,
    Unknown(u8),
    Malformed,
}

pub struct SlaveDispatcher {
    node: NodeId,
    state: RobotState,
    legs: LegController,
    intercpu: InterCpu,
    delay: Box<dyn Delay>,
    idle_pause: Duration,
    cancel: CancelToken,
}

impl SlaveDispatcher {
    pub fn new(state: RobotState, legs: LegController, intercpu: InterCpu) -> Self {
        Self {
            node: intercpu.own_id(),
            state,
            legs,
            intercpu,
            delay: Box::new(ThreadDelay),
            idle_pause: Duration::from_millis(crate::config::SLAVE_IDLE_PAUSE_MS),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_delay(mut self, delay: Box<dyn Delay>) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn state(&self) -> &RobotState {
        &self.state
    }

    /// Receive and handle at most one frame
    pub fn poll_once(&mut self) -> Dispatch {
        match self.intercpu.receive() {
            Some(packet) => self.dispatch(&packet),
            None => Dispatch::Idle,
        }
    }

    pub fn dispatch(&mut self, packet: &Packet) -> Dispatch {
        let direct = packet.destination == self.node.as_byte();
        if !direct && packet.destination != NodeId::Broadcast.as_byte() {
            trace!(destination = packet.destination, "Frame for another node");
            return Dispatch::Ignored;
        }

        let message = match Message::from_packet(packet) {
            Ok(message) => message,
            Err(MessageError::UnknownInstruction(instruction)) => {
                debug!(instruction, "Ignoring unknown instruction");
                return Dispatch::Unknown(instruction);
            }
            Err(e) => {
                warn!("{}", e);
                if direct {
                    self.intercpu.send_nak(NodeId::Master, NakCode::DefaultError);
                }
                return Dispatch::Malformed;
            }
        };

        match message {
            Message::Status { param } => {
                if param == STATUS_IS_ALIVE {
                    if direct {
                        self.intercpu.send_ack(NodeId::Master);
                    }
                } else {
                    debug!(param, "Unsupported status parameter");
                }
                Dispatch::Status
            }
            Message::Action => {
                self.legs.commit(&self.state.right);
                self.legs.commit(&self.state.left);
                Dispatch::Action
            }
            Message::Point { config, point, speed } => {
                let accepted = self.move_legs(config, point, speed);
                if direct {
                    if accepted {
                        self.intercpu.send_ack(NodeId::Master);
                    } else if config.sides().is_empty() {
                        self.intercpu.send_nak(NodeId::Master, NakCode::DefaultError);
                    } else {
                        self.intercpu.send_nak(NodeId::Master, NakCode::PointOutOfBounds);
                    }
                }
                Dispatch::Point { accepted }
            }
            Message::Angle { config, angle } => {
                for side in config.sides() {
                    for role in config.joints() {
                        self.legs.set_joint(self.state.leg_mut(side), role, angle);
                    }
                }
                if direct {
                    self.intercpu.send_ack(NodeId::Master);
                }
                Dispatch::Angle
            }
            Message::Ack | Message::Nak { .. } => {
                debug!(instruction = ?message.instruction(), "Unsolicited reply");
                Dispatch::Ignored
            }
        }
    }

    /// Move every selected leg; true only if all of them could
    fn move_legs(&mut self, config: ConfigFlags, point: Point, speed: Option<f64>) -> bool {
        let sides = config.sides();
        if sides.is_empty() {
            warn!(config = config.bits(), "POINT without a side");
            return false;
        }

        let global = config.is_global();
        let mut accepted = true;
        for side in sides {
            let leg = self.state.leg_mut(side);
            let moved = match speed {
                Some(speed) => self.legs.move_to_with_speed(leg, point, speed, global),
                None => self.legs.move_to(leg, point, global),
            };
            accepted &= moved;
        }
        accepted
    }

    /// Dispatch until cancelled
    pub fn run(&mut self) {
        info!(node = ?self.node, "Slave dispatcher running");
        while !self.cancel.is_cancelled() {
            if self.poll_once() == Dispatch::Idle {
                self.delay.pause(self.idle_pause);
            }
        }
        info!(node = ?self.node, "Slave dispatcher stopped");
    }
}
