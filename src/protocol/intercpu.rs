// Inter-node command protocol
//
// The master reaches slave A on one link and slave B on another; a slave
// talks to the master over its single link. Commands that expect an answer
// succeed only on ACK. A broadcast never waits for anything.

use tracing::{debug, warn};

use super::link::{LinkChannel, LinkGroup};
use super::packet::Packet;
use crate::messages::{ConfigFlags, Instruction, Message, NakCode, NodeId, STATUS_IS_ALIVE};
use crate::motion::kinematics::Point;

pub struct InterCpu {
    own_id: NodeId,
    links: LinkGroup,
}

impl InterCpu {
    /// Master wiring: `to_slave_a` and `to_slave_b` are its two node links
    pub fn for_master(to_slave_a: LinkChannel, to_slave_b: LinkChannel) -> Self {
        let mut links = LinkGroup::new(NodeId::Broadcast.as_byte());
        links.add_link(to_slave_a, [NodeId::SlaveA.as_byte()]);
        links.add_link(to_slave_b, [NodeId::SlaveB.as_byte()]);
        Self {
            own_id: NodeId::Master,
            links,
        }
    }

    /// Slave wiring: one link towards the master
    pub fn for_slave(own_id: NodeId, to_master: LinkChannel) -> Self {
        let mut links = LinkGroup::new(NodeId::Broadcast.as_byte());
        links.add_link(to_master, [NodeId::Master.as_byte()]);
        Self { own_id, links }
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    fn exchange(&mut self, node: NodeId, message: &Message) -> Option<Packet> {
        if node == NodeId::Broadcast {
            self.post(node, message);
            return None;
        }
        self.links.send(&message.to_packet(node), true)
    }

    fn post(&mut self, node: NodeId, message: &Message) {
        self.links.send(&message.to_packet(node), false);
    }

    /// True only when `node` answered with ACK
    fn acknowledged(&mut self, node: NodeId, message: &Message) -> bool {
        match self.exchange(node, message) {
            Some(reply) if reply.instruction == Instruction::Ack as u8 => true,
            Some(reply) if reply.instruction == Instruction::Nak as u8 => {
                let code = reply.payload.first().copied().map(NakCode::try_from);
                warn!(?node, ?code, command = ?message.instruction(), "Command rejected");
                false
            }
            Some(reply) => {
                warn!(?node, instruction = reply.instruction, "Unexpected reply");
                false
            }
            None => {
                debug!(?node, command = ?message.instruction(), "No reply");
                false
            }
        }
    }

    /// Ask a node for a status parameter; the raw reply is returned
    pub fn request_status(&mut self, node: NodeId, param: u8) -> Option<Packet> {
        self.exchange(node, &Message::Status { param })
    }

    pub fn is_alive(&mut self, node: NodeId) -> bool {
        self.acknowledged(node, &Message::Status { param: STATUS_IS_ALIVE })
    }

    pub fn send_point(&mut self, node: NodeId, point: Point, config: ConfigFlags) -> bool {
        self.acknowledged(
            node,
            &Message::Point {
                config,
                point,
                speed: None,
            },
        )
    }

    pub fn send_point_and_speed(&mut self, node: NodeId, point: Point, speed: f64, config: ConfigFlags) -> bool {
        self.acknowledged(
            node,
            &Message::Point {
                config,
                point,
                speed: Some(speed),
            },
        )
    }

    pub fn send_angle(&mut self, node: NodeId, angle: f64, config: ConfigFlags) -> bool {
        self.acknowledged(node, &Message::Angle { config, angle })
    }

    /// Commit buffered moves on `node`. Never waits.
    pub fn send_action(&mut self, node: NodeId) {
        self.post(node, &Message::Action);
    }

    pub fn send_ack(&mut self, node: NodeId) {
        self.post(node, &Message::Ack);
    }

    pub fn send_nak(&mut self, node: NodeId, code: NakCode) {
        self.post(node, &Message::Nak { code: code as u8 });
    }

    /// Poll every link once for an incoming frame
    pub fn receive(&mut self) -> Option<Packet> {
        self.links.receive()
    }
}
