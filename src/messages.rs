// Message types exchanged between the master and the slave nodes
//
// Every message travels in a packet frame. Multi-byte values are IEEE-754
// doubles in little-endian order.

use bitflags::bitflags;

use crate::motion::kinematics::Point;
use crate::protocol::packet::Packet;
use crate::protocol::servo::{JointRole, Side};

/// Node addresses on the inter-node links
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeId {
    NoId = 0x00,
    /// Rear body segment
    SlaveA = 0x01,
    Master = 0x02,
    /// Front body segment
    SlaveB = 0x03,
    Broadcast = 0xFE,
}

impl NodeId {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for NodeId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(NodeId::NoId),
            0x01 => Ok(NodeId::SlaveA),
            0x02 => Ok(NodeId::Master),
            0x03 => Ok(NodeId::SlaveB),
            0xFE => Ok(NodeId::Broadcast),
            other => Err(other),
        }
    }
}

/// Role of this node, derived from the id of its left hip servo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    SlaveA,
    SlaveB,
    Unassigned,
}

impl NodeRole {
    pub fn from_left_hip(hip_id: u8) -> Self {
        match hip_id {
            16 => NodeRole::SlaveA,
            10 => NodeRole::Master,
            4 => NodeRole::SlaveB,
            _ => NodeRole::Unassigned,
        }
    }

    pub fn node_id(self) -> NodeId {
        match self {
            NodeRole::Master => NodeId::Master,
            NodeRole::SlaveA => NodeId::SlaveA,
            NodeRole::SlaveB => NodeId::SlaveB,
            NodeRole::Unassigned => NodeId::NoId,
        }
    }
}

/// Instruction set of the inter-node protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Status = 0x01,
    Action = 0x02,
    Point = 0x03,
    Angle = 0x04,
    Ack = 0x06,
    Nak = 0x15,
}

impl TryFrom<u8> for Instruction {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Instruction::Status),
            0x02 => Ok(Instruction::Action),
            0x03 => Ok(Instruction::Point),
            0x04 => Ok(Instruction::Angle),
            0x06 => Ok(Instruction::Ack),
            0x15 => Ok(Instruction::Nak),
            other => Err(other),
        }
    }
}

/// Marks the optional speed block after a POINT payload
pub const SPEED_MARKER: u8 = 0x05;

/// STATUS parameter asking whether the node is up
pub const STATUS_IS_ALIVE: u8 = 0x01;

/// NAK reason codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakCode {
    AngleLimit = 0x01,
    PointOutOfBounds = 0x02,
    DefaultError = 0x03,
}

impl TryFrom<u8> for NakCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(NakCode::AngleLimit),
            0x02 => Ok(NakCode::PointOutOfBounds),
            0x03 => Ok(NakCode::DefaultError),
            other => Err(other),
        }
    }
}

bitflags! {
    /// Selects legs, frame and joints a POINT or ANGLE command applies to
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConfigFlags: u8 {
        const RIGHT = 0x01;
        const LEFT = 0x02;
        /// Point is in body coordinates instead of leg coordinates
        const GLOBAL = 0x04;
        const HIP = 0x08;
        const KNEE = 0x10;
        const FOOT = 0x20;
    }
}

impl ConfigFlags {
    pub fn for_side(side: Side) -> Self {
        match side {
            Side::Right => ConfigFlags::RIGHT,
            Side::Left => ConfigFlags::LEFT,
        }
    }

    pub fn for_joint(role: JointRole) -> Self {
        match role {
            JointRole::Hip => ConfigFlags::HIP,
            JointRole::Knee => ConfigFlags::KNEE,
            JointRole::Foot => ConfigFlags::FOOT,
        }
    }

    pub fn is_right(self) -> bool {
        self.contains(ConfigFlags::RIGHT)
    }

    pub fn is_left(self) -> bool {
        self.contains(ConfigFlags::LEFT)
    }

    pub fn is_global(self) -> bool {
        self.contains(ConfigFlags::GLOBAL)
    }

    pub fn is_hip(self) -> bool {
        self.contains(ConfigFlags::HIP)
    }

    pub fn is_knee(self) -> bool {
        self.contains(ConfigFlags::KNEE)
    }

    pub fn is_foot(self) -> bool {
        self.contains(ConfigFlags::FOOT)
    }

    /// Selected sides, left first
    pub fn sides(self) -> Vec<Side> {
        let mut sides = Vec::with_capacity(2);
        if self.is_left() {
            sides.push(Side::Left);
        }
        if self.is_right() {
            sides.push(Side::Right);
        }
        sides
    }

    /// Selected joints, hip to foot
    pub fn joints(self) -> Vec<JointRole> {
        JointRole::ALL
            .into_iter()
            .filter(|&role| self.contains(ConfigFlags::for_joint(role)))
            .collect()
    }
}

/// Error types for message decoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("Unknown instruction 0x{0:02X}")]
    UnknownInstruction(u8),

    #[error("{instruction:?} payload too short: expected {expected} bytes, got {actual}")]
    Truncated {
        instruction: Instruction,
        expected: usize,
        actual: usize,
    },
}

const F64_LEN: usize = 8;
/// config + x + y + z
const POINT_LEN: usize = 1 + 3 * F64_LEN;
/// POINT + marker + speed
const POINT_SPEED_LEN: usize = POINT_LEN + 1 + F64_LEN;
/// config + angle
const ANGLE_LEN: usize = 1 + F64_LEN;

/// Decoded inter-node message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Status { param: u8 },
    Action,
    Point {
        config: ConfigFlags,
        point: Point,
        speed: Option<f64>,
    },
    Angle { config: ConfigFlags, angle: f64 },
    Ack,
    Nak { code: u8 },
}

impl Message {
    pub fn instruction(&self) -> Instruction {
        match self {
            Message::Status { .. } => Instruction::Status,
            Message::Action => Instruction::Action,
            Message::Point { .. } => Instruction::Point,
            Message::Angle { .. } => Instruction::Angle,
            Message::Ack => Instruction::Ack,
            Message::Nak { .. } => Instruction::Nak,
        }
    }

    /// Encode the payload bytes
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Message::Status { param } => vec![*param],
            Message::Action | Message::Ack => Vec::new(),
            Message::Point { config, point, speed } => {
                let mut payload = Vec::with_capacity(POINT_SPEED_LEN);
                payload.push(config.bits());
                for value in [point.x, point.y, point.z] {
                    payload.extend_from_slice(&value.to_le_bytes());
                }
                if let Some(speed) = speed {
                    payload.push(SPEED_MARKER);
                    payload.extend_from_slice(&speed.to_le_bytes());
                }
                payload
            }
            Message::Angle { config, angle } => {
                let mut payload = Vec::with_capacity(ANGLE_LEN);
                payload.push(config.bits());
                payload.extend_from_slice(&angle.to_le_bytes());
                payload
            }
            Message::Nak { code } => vec![*code],
        }
    }

    pub fn to_packet(&self, destination: NodeId) -> Packet {
        Packet::new(destination.as_byte(), self.instruction() as u8, &self.payload())
    }

    /// Decode a received packet. Unknown config bits are dropped.
    pub fn from_packet(packet: &Packet) -> Result<Self, MessageError> {
        let instruction =
            Instruction::try_from(packet.instruction).map_err(MessageError::UnknownInstruction)?;
        let payload = packet.payload.as_slice();

        let message = match instruction {
            Instruction::Status => {
                require(instruction, payload, 1)?;
                Message::Status { param: payload[0] }
            }
            Instruction::Action => Message::Action,
            Instruction::Point => {
                require(instruction, payload, POINT_LEN)?;
                let speed = (payload.len() >= POINT_SPEED_LEN && payload[POINT_LEN] == SPEED_MARKER)
                    .then(|| read_f64(payload, POINT_LEN + 1));
                Message::Point {
                    config: ConfigFlags::from_bits_truncate(payload[0]),
                    point: Point::new(
                        read_f64(payload, 1),
                        read_f64(payload, 1 + F64_LEN),
                        read_f64(payload, 1 + 2 * F64_LEN),
                    ),
                    speed,
                }
            }
            Instruction::Angle => {
                require(instruction, payload, ANGLE_LEN)?;
                Message::Angle {
                    config: ConfigFlags::from_bits_truncate(payload[0]),
                    angle: read_f64(payload, 1),
                }
            }
            Instruction::Ack => Message::Ack,
            Instruction::Nak => {
                require(instruction, payload, 1)?;
                Message::Nak { code: payload[0] }
            }
        };
        Ok(message)
    }
}

fn require(instruction: Instruction, payload: &[u8], expected: usize) -> Result<(), MessageError> {
    if payload.len() < expected {
        return Err(MessageError::Truncated {
            instruction,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

/// Caller guarantees `offset + 8 <= bytes.len()`
fn read_f64(bytes: &[u8], offset: usize) -> f64 {
    let mut raw = [0u8; F64_LEN];
    raw.copy_from_slice(&bytes[offset..offset + F64_LEN]);
    f64::from_le_bytes(raw)
}
