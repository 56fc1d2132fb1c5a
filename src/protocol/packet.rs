// Packet framing shared by the inter-node links and the actuator buses
//
// Frame format is Dynamixel Protocol 1.0:
// [0xFF, 0xFF, Destination, Length, Instruction, Payload..., Checksum]
// Length counts payload + instruction + checksum.

use heapless::Deque;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Frame sync byte
pub const SYNC: u8 = 0xFF;

/// Packet header bytes
const HEADER: [u8; 2] = [SYNC, SYNC];

/// Sync, sync, destination, length
pub const HEADER_LEN: usize = 4;

/// Receive ring buffer capacity; also the largest accepted frame
pub const RX_BUFFER_SIZE: usize = 128;

/// Largest payload that still fits a frame in the receive buffer
pub const MAX_PAYLOAD: usize = RX_BUFFER_SIZE - HEADER_LEN - 2;

/// Error types for packet decoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error(
        "Checksum mismatch for packet to 0x{destination:02X}: expected 0x{expected:02X}, got 0x{received:02X}"
    )]
    ChecksumMismatch {
        destination: u8,
        expected: u8,
        received: u8,
    },
}

/// What the receive buffer keeps after a checksum mismatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumRecovery {
    /// Drop everything buffered, including frames queued behind the bad one
    #[default]
    ResetBuffer,
    /// Drop only the leading byte and rescan the rest
    Resync,
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub destination: u8,
    pub instruction: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(destination: u8, instruction: u8, payload: &[u8]) -> Self {
        Self {
            destination,
            instruction,
            payload: payload.to_vec(),
        }
    }

    /// Size of the encoded frame in bytes
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + 2
    }

    /// Build the wire frame with header and checksum
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD);

        let length = (self.payload.len() + 2) as u8; // payload + instruction + checksum
        let mut frame = Vec::with_capacity(self.frame_len());

        frame.extend_from_slice(&HEADER);
        frame.push(self.destination);
        frame.push(length);
        frame.push(self.instruction);
        frame.extend_from_slice(&self.payload);

        // Checksum over destination, length, instruction, payload
        let checksum = checksum(&frame[2..]);
        frame.push(checksum);

        frame
    }
}

/// Bitwise complement of the byte sum, truncated to 8 bits
pub fn checksum(data: &[u8]) -> u8 {
    !data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Single-consumer receive buffer that turns a byte stream into packets
pub struct RxBuffer {
    bytes: Deque<u8, RX_BUFFER_SIZE>,
    recovery: ChecksumRecovery,
}

impl RxBuffer {
    pub fn new(recovery: ChecksumRecovery) -> Self {
        Self {
            bytes: Deque::new(),
            recovery,
        }
    }

    pub fn recovery(&self) -> ChecksumRecovery {
        self.recovery
    }

    pub fn set_recovery(&mut self, recovery: ChecksumRecovery) {
        self.recovery = recovery;
    }

    /// Append a received byte. Returns false (byte dropped) when full.
    pub fn push(&mut self, byte: u8) -> bool {
        self.bytes.push_back(byte).is_ok()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Free space left in the buffer
    pub fn room(&self) -> usize {
        RX_BUFFER_SIZE - self.bytes.len()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    fn peek(&self, index: usize) -> Option<u8> {
        self.bytes.iter().nth(index).copied()
    }

    /// Try to extract the next complete frame
    ///
    /// `Ok(None)` means "not yet": either too few bytes are buffered, or one
    /// leading byte was dropped while hunting for a frame start. Only a
    /// checksum mismatch is reported as an error.
    pub fn try_parse(&mut self) -> Result<Option<Packet>, PacketError> {
        if self.bytes.len() < HEADER_LEN {
            return Ok(None);
        }

        // A frame start is recognised by its first sync byte alone; the
        // second header byte is not checked.
        let (Some(SYNC), Some(length)) = (self.peek(0), self.peek(3)) else {
            let dropped = self.bytes.pop_front();
            debug!(?dropped, "Discarding byte outside a frame");
            return Ok(None);
        };

        let length = length as usize;
        let total = HEADER_LEN + length;
        if length < 2 || total > RX_BUFFER_SIZE {
            let dropped = self.bytes.pop_front();
            debug!(?dropped, length, "Discarding frame start with impossible length");
            return Ok(None);
        }

        if self.bytes.len() < total {
            return Ok(None);
        }

        let frame: Vec<u8> = (0..total).filter_map(|_| self.bytes.pop_front()).collect();
        let expected = checksum(&frame[2..total - 1]);
        let received = frame[total - 1];

        if expected != received {
            match self.recovery {
                ChecksumRecovery::ResetBuffer => {
                    warn!(
                        destination = frame[2],
                        discarded = self.bytes.len(),
                        "Checksum mismatch, receive buffer reset"
                    );
                    self.bytes.clear();
                }
                ChecksumRecovery::Resync => {
                    warn!(destination = frame[2], "Checksum mismatch, resynchronising");
                    // Room is guaranteed: `total` bytes were just popped
                    for &byte in frame[1..].iter().rev() {
                        let _ = self.bytes.push_front(byte);
                    }
                }
            }
            return Err(PacketError::ChecksumMismatch {
                destination: frame[2],
                expected,
                received,
            });
        }

        Ok(Some(Packet {
            destination: frame[2],
            instruction: frame[4],
            payload: frame[5..total - 1].to_vec(),
        }))
    }
}

impl Default for RxBuffer {
    fn default() -> Self {
        Self::new(ChecksumRecovery::default())
    }
}
