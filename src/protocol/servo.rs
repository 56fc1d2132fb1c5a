// Dynamixel AX-12 actuator bus
//
// Each node drives two buses, one per body side. A servo id is pinned to a
// bus by its number: ids 1-3, 7-9, 13-15 are right, 4-6, 10-12, 16-18 left.
// Angles are degrees relative to the leg's kinematic zero; the mounting
// corrections and the 150 degree hardware offset are applied here.

use std::ops::RangeInclusive;
use tracing::{debug, info, warn};

use super::link::{LinkChannel, LinkGroup};
use super::packet::Packet;

/// Broadcast id; every servo executes, none responds
pub const BROADCAST_ID: u8 = 0xFE;

/// Ids tried during discovery
pub const DISCOVERY_IDS: RangeInclusive<u8> = 1..=18;

/// Raw position units per degree (1023 units over 300 degrees)
const UNITS_PER_DEGREE: f64 = 3.41;

/// Hardware position of the kinematic zero
const ZERO_OFFSET_DEG: f64 = 150.0;

/// Largest raw position and speed value
pub const RAW_MAX: u16 = 1023;

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    RegWrite = 0x04,
    Action = 0x05,
    Reset = 0x06,
}

/// Control table addresses
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    // EEPROM area
    Id = 0x03, // 1 byte

    // RAM area
    Led = 0x19,             // 1 byte: 0=off, 1=on
    GoalPosition = 0x1E,    // 2 bytes, followed by MovingSpeed
    MovingSpeed = 0x20,     // 2 bytes
    PresentPosition = 0x24, // 2 bytes, read-only
    PresentSpeed = 0x26,    // 2 bytes, read-only
}

/// Body side a leg (and its bus) belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Right,
    Left,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Right => Side::Left,
            Side::Left => Side::Right,
        }
    }
}

/// Position of a joint within its leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JointRole {
    Hip,
    Knee,
    Foot,
}

impl JointRole {
    pub const ALL: [JointRole; 3] = [JointRole::Hip, JointRole::Knee, JointRole::Foot];
}

/// Bus side a servo id is wired to
pub fn side_of(id: u8) -> Side {
    if id.wrapping_sub(1) % 6 < 3 {
        Side::Right
    } else {
        Side::Left
    }
}

/// Joint a servo id drives
pub fn role_of(id: u8) -> JointRole {
    match id.wrapping_sub(1) % 3 {
        0 => JointRole::Hip,
        1 => JointRole::Knee,
        _ => JointRole::Foot,
    }
}

/// Servos mounted mirrored count their angle the other way round
fn is_mirrored(id: u8) -> bool {
    matches!(id.wrapping_sub(1) % 6, 0 | 2 | 3 | 4)
}

/// Convert a kinematic angle in degrees to a raw goal position
pub fn angle_to_raw(id: u8, degrees: f64) -> u16 {
    let mut value = if is_mirrored(id) { 360.0 - degrees } else { degrees };
    value += ZERO_OFFSET_DEG;
    if value >= 360.0 {
        value -= 360.0;
    }

    let raw = (UNITS_PER_DEGREE * value).floor();
    if !(0.0..=RAW_MAX as f64).contains(&raw) {
        warn!(id, degrees, raw, "Goal position outside servo range, clamped");
    }
    raw.clamp(0.0, RAW_MAX as f64) as u16
}

/// Convert a raw present position back to a kinematic angle in degrees,
/// normalised to (-180, 180]
pub fn raw_to_angle(id: u8, raw: u16) -> f64 {
    let mut value = raw as f64 / UNITS_PER_DEGREE - ZERO_OFFSET_DEG;
    if value < 0.0 {
        value += 360.0;
    }
    let mut degrees = if is_mirrored(id) { 360.0 - value } else { value };
    if degrees > 180.0 {
        degrees -= 360.0;
    }
    degrees
}

/// Convert a moving speed to its raw register value
pub fn speed_to_raw(id: u8, speed: f64) -> u16 {
    let raw = speed.floor();
    if !(0.0..=RAW_MAX as f64).contains(&raw) {
        warn!(id, speed, "Moving speed outside servo range, clamped");
    }
    raw.clamp(0.0, RAW_MAX as f64) as u16
}

/// Servo ids found on one side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegIds {
    pub hip: Option<u8>,
    pub knee: Option<u8>,
    pub foot: Option<u8>,
}

impl LegIds {
    pub fn get(&self, role: JointRole) -> Option<u8> {
        match role {
            JointRole::Hip => self.hip,
            JointRole::Knee => self.knee,
            JointRole::Foot => self.foot,
        }
    }

    fn set(&mut self, role: JointRole, id: u8) {
        match role {
            JointRole::Hip => self.hip = Some(id),
            JointRole::Knee => self.knee = Some(id),
            JointRole::Foot => self.foot = Some(id),
        }
    }
}

/// Result of probing the buses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub right: LegIds,
    pub left: LegIds,
    pub responders: Vec<u8>,
}

impl Discovery {
    /// Record a servo that answered
    pub fn record(&mut self, id: u8) {
        let leg = match side_of(id) {
            Side::Right => &mut self.right,
            Side::Left => &mut self.left,
        };
        leg.set(role_of(id), id);
        self.responders.push(id);
    }

    pub fn leg(&self, side: Side) -> &LegIds {
        match side {
            Side::Right => &self.right,
            Side::Left => &self.left,
        }
    }
}

/// The two actuator buses of one node
pub struct ServoBus {
    links: LinkGroup,
}

impl ServoBus {
    pub fn new(right: LinkChannel, left: LinkChannel) -> Self {
        let mut links = LinkGroup::new(BROADCAST_ID);
        let ids = || 1..BROADCAST_ID;
        links.add_link(right, ids().filter(|&id| side_of(id) == Side::Right));
        links.add_link(left, ids().filter(|&id| side_of(id) == Side::Left));
        Self { links }
    }

    /// Send an instruction, returning the status packet if one was awaited
    ///
    /// Only a status frame carrying `id` counts; stale frames from other
    /// servos on the same bus are dropped.
    fn instruct(&mut self, id: u8, instruction: Instruction, params: &[u8], expect_response: bool) -> Option<Packet> {
        let packet = Packet::new(id, instruction as u8, params);
        let status = if expect_response {
            self.links.request(&packet)?
        } else {
            self.links.send(&packet, false)?
        };
        check_status(id, status)
    }

    /// Assign a new id to a servo
    pub fn set_id(&mut self, old_id: u8, new_id: u8) -> bool {
        info!(old_id, new_id, "Changing servo id");
        // The status frame may already carry the new id
        let packet = Packet::new(old_id, Instruction::Write as u8, &[Register::Id as u8, new_id]);
        self.links
            .send(&packet, true)
            .and_then(|status| check_status(old_id, status))
            .is_some()
    }

    pub fn ping(&mut self, id: u8) -> bool {
        self.instruct(id, Instruction::Ping, &[], true).is_some()
    }

    pub fn set_led(&mut self, id: u8, on: bool) -> bool {
        self.instruct(id, Instruction::Write, &[Register::Led as u8, on as u8], true)
            .is_some()
    }

    pub fn set_speed(&mut self, id: u8, speed: f64) -> bool {
        let [lo, hi] = speed_to_raw(id, speed).to_le_bytes();
        self.instruct(id, Instruction::Write, &[Register::MovingSpeed as u8, lo, hi], true)
            .is_some()
    }

    /// Write a goal position; buffered writes wait for ACTION
    pub fn set_angle(&mut self, id: u8, degrees: f64, buffered: bool) -> bool {
        let [lo, hi] = angle_to_raw(id, degrees).to_le_bytes();
        self.instruct(id, write_kind(buffered), &[Register::GoalPosition as u8, lo, hi], true)
            .is_some()
    }

    /// Write goal position and moving speed in one frame
    pub fn set_angle_and_speed(&mut self, id: u8, degrees: f64, speed: f64, buffered: bool) -> bool {
        let [a_lo, a_hi] = angle_to_raw(id, degrees).to_le_bytes();
        let [s_lo, s_hi] = speed_to_raw(id, speed).to_le_bytes();
        self.instruct(
            id,
            write_kind(buffered),
            &[Register::GoalPosition as u8, a_lo, a_hi, s_lo, s_hi],
            true,
        )
        .is_some()
    }

    /// Execute buffered writes. Never waits for a response.
    pub fn send_action(&mut self, id: u8) {
        self.instruct(id, Instruction::Action, &[], false);
    }

    /// Restore factory defaults
    pub fn reset(&mut self, id: u8) -> bool {
        warn!(id, "Resetting servo to factory defaults");
        self.instruct(id, Instruction::Reset, &[], true).is_some()
    }

    fn read_u16(&mut self, id: u8, register: Register) -> Option<u16> {
        let status = self.instruct(id, Instruction::Read, &[register as u8, 2], true)?;
        match status.payload.as_slice() {
            [lo, hi, ..] => Some(u16::from_le_bytes([*lo, *hi])),
            _ => {
                warn!(id, ?register, "Short read response");
                None
            }
        }
    }

    /// Present position in kinematic degrees
    pub fn read_angle(&mut self, id: u8) -> Option<f64> {
        self.read_u16(id, Register::PresentPosition)
            .map(|raw| raw_to_angle(id, raw))
    }

    /// Present speed, raw units
    pub fn read_speed(&mut self, id: u8) -> Option<u16> {
        self.read_u16(id, Register::PresentSpeed)
    }

    /// Try each id by switching its LED on; responders are mapped to legs
    pub fn discover(&mut self, ids: impl IntoIterator<Item = u8>) -> Discovery {
        let mut discovery = Discovery::default();
        for id in ids {
            if self.set_led(id, true) {
                debug!(id, side = ?side_of(id), role = ?role_of(id), "Servo answered");
                discovery.record(id);
            }
        }
        info!(responders = ?discovery.responders, "Servo discovery complete");
        discovery
    }
}

// Status packets carry the servo error bits in the instruction slot
fn check_status(id: u8, status: Packet) -> Option<Packet> {
    if status.instruction != 0 {
        warn!(id, error = status.instruction, "Servo reported error status");
    }
    Some(status)
}

fn write_kind(buffered: bool) -> Instruction {
    if buffered {
        Instruction::RegWrite
    } else {
        Instruction::Write
    }
}
