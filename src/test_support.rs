// Scripted peers for the in-memory transports used by the unit tests

use crate::messages::{Message, NakCode, NodeId, STATUS_IS_ALIVE};
use crate::protocol::packet::{Packet, RxBuffer};
use crate::protocol::servo::{self, BROADCAST_ID};

/// Split a written byte stream back into packets
pub(crate) fn frames(bytes: &[u8]) -> Vec<Packet> {
    let mut rx = RxBuffer::default();
    let mut packets = Vec::new();
    for &byte in bytes {
        rx.push(byte);
        while let Ok(Some(packet)) = rx.try_parse() {
            packets.push(packet);
        }
    }
    packets
}

/// Decode every inter-node message in a written byte stream
pub(crate) fn messages(bytes: &[u8]) -> Vec<Message> {
    frames(bytes)
        .iter()
        .filter_map(|packet| Message::from_packet(packet).ok())
        .collect()
}

/// AX-12 stand-in: every servo in `ids` answers with a clean status packet,
/// reads return raw position 512. ACTION and broadcasts get no answer.
pub(crate) fn servo_responder(ids: &'static [u8]) -> impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static {
    move |bytes: &[u8]| {
        let packet = frames(bytes).into_iter().next()?;
        if packet.destination == BROADCAST_ID
            || packet.instruction == servo::Instruction::Action as u8
            || !ids.contains(&packet.destination)
        {
            return None;
        }
        let params: &[u8] = if packet.instruction == servo::Instruction::Read as u8 {
            &[0x00, 0x02]
        } else {
            &[]
        };
        Some(Packet::new(packet.destination, 0, params).encode())
    }
}

/// Slave node stand-in driven by a reply function
pub(crate) fn slave_replying<F>(mut reply: F) -> impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static
where
    F: FnMut(&Message) -> Option<Message> + Send + 'static,
{
    move |bytes: &[u8]| {
        let packet = frames(bytes).into_iter().next()?;
        if packet.destination == NodeId::Broadcast.as_byte() {
            return None;
        }
        let message = Message::from_packet(&packet).ok()?;
        reply(&message).map(|answer| answer.to_packet(NodeId::Master).encode())
    }
}

/// Slave that acknowledges everything, or rejects every POINT
pub(crate) fn slave_responder(nak_points: bool) -> impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static {
    slave_replying(move |message| match message {
        Message::Status { param } if *param == STATUS_IS_ALIVE => Some(Message::Ack),
        Message::Angle { .. } => Some(Message::Ack),
        Message::Point { .. } if nak_points => Some(Message::Nak {
            code: NakCode::PointOutOfBounds as u8,
        }),
        Message::Point { .. } => Some(Message::Ack),
        _ => None,
    })
}
