// Serial protocol stack shared by every node
//
// Provides:
// - Packet framing and the receive ring buffer
// - Link channels with bounded response polling and routing
// - Dynamixel AX-12 actuator bus
// - Master/slave command protocol

pub mod intercpu;
pub mod link;
pub mod packet;
pub mod servo;

pub use intercpu::InterCpu;
pub use link::{CancelToken, LinkChannel, LinkError, LinkGroup};
pub use packet::{ChecksumRecovery, Packet, PacketError, RxBuffer};
pub use servo::{Discovery, JointRole, ServoBus, Side};
