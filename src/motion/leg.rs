// Leg controller
//
// Combines the kinematics solver with the actuator bus: a foot target is
// solved into three joint angles which are written buffered, so they only
// take effect on the next ACTION.

use tracing::{debug, info, warn};

use super::kinematics::{JointAngles, KinematicsError, LegGeometry, Mount, Point, local_point};
use crate::messages::NodeRole;
use crate::protocol::servo::{Discovery, JointRole, ServoBus, Side};

/// One actuator of a leg
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Joint {
    pub id: u8,
    /// Last angle written (degrees), whether committed or not
    pub commanded_angle: Option<f64>,
    /// Last angle read back from the servo (degrees)
    pub last_known_angle: Option<f64>,
}

impl Joint {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            commanded_angle: None,
            last_known_angle: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Leg {
    pub side: Side,
    pub hip: Joint,
    pub knee: Joint,
    pub foot: Joint,
    pub mount: Mount,
}

impl Leg {
    pub fn new(side: Side, hip_id: u8, knee_id: u8, foot_id: u8) -> Self {
        Self {
            side,
            hip: Joint::new(hip_id),
            knee: Joint::new(knee_id),
            foot: Joint::new(foot_id),
            mount: Mount::for_hip(hip_id),
        }
    }

    pub fn joint(&self, role: JointRole) -> &Joint {
        match role {
            JointRole::Hip => &self.hip,
            JointRole::Knee => &self.knee,
            JointRole::Foot => &self.foot,
        }
    }

    pub fn joint_mut(&mut self, role: JointRole) -> &mut Joint {
        match role {
            JointRole::Hip => &mut self.hip,
            JointRole::Knee => &mut self.knee,
            JointRole::Foot => &mut self.foot,
        }
    }

    pub fn joint_ids(&self) -> [u8; 3] {
        [self.hip.id, self.knee.id, self.foot.id]
    }
}

/// Error types for building the robot state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LegError {
    #[error("{side:?} leg incomplete: no {missing:?} servo answered")]
    Incomplete { side: Side, missing: JointRole },
}

/// The two local legs of a node and the role they imply
#[derive(Debug, Clone, PartialEq)]
pub struct RobotState {
    pub role: NodeRole,
    pub right: Leg,
    pub left: Leg,
}

impl RobotState {
    pub fn new(right: Leg, left: Leg) -> Self {
        Self {
            role: NodeRole::from_left_hip(left.hip.id),
            right,
            left,
        }
    }

    /// Build both legs from the discovered servos; every joint must be present
    pub fn from_discovery(discovery: &Discovery) -> Result<Self, LegError> {
        let leg = |side: Side| -> Result<Leg, LegError> {
            let ids = discovery.leg(side);
            let id = |role: JointRole| ids.get(role).ok_or(LegError::Incomplete { side, missing: role });
            Ok(Leg::new(side, id(JointRole::Hip)?, id(JointRole::Knee)?, id(JointRole::Foot)?))
        };

        let state = Self::new(leg(Side::Right)?, leg(Side::Left)?);
        info!(role = ?state.role, right = ?state.right.joint_ids(), left = ?state.left.joint_ids(), "Legs assigned");
        Ok(state)
    }

    pub fn leg(&self, side: Side) -> &Leg {
        match side {
            Side::Right => &self.right,
            Side::Left => &self.left,
        }
    }

    pub fn leg_mut(&mut self, side: Side) -> &mut Leg {
        match side {
            Side::Right => &mut self.right,
            Side::Left => &mut self.left,
        }
    }
}

/// Drives legs on the local actuator bus
pub struct LegController {
    bus: ServoBus,
    geometry: LegGeometry,
}

impl LegController {
    pub fn new(bus: ServoBus, geometry: LegGeometry) -> Self {
        Self { bus, geometry }
    }

    pub fn geometry(&self) -> &LegGeometry {
        &self.geometry
    }

    pub fn bus_mut(&mut self) -> &mut ServoBus {
        &mut self.bus
    }

    /// Joint angles in degrees for a target, in body (`global`) or leg frame
    pub fn solve(&self, leg: &Leg, point: Point, global: bool) -> Result<JointAngles, KinematicsError> {
        let target = if global { local_point(point, &leg.mount) } else { point };
        Ok(self.geometry.inverse(target)?.to_degrees())
    }

    /// Buffer a move of the foot tip to `point`
    ///
    /// Returns false, without touching the servos, when the target is
    /// unreachable.
    pub fn move_to(&mut self, leg: &mut Leg, point: Point, global: bool) -> bool {
        self.move_leg(leg, point, None, global)
    }

    /// Like `move_to`, also setting the moving speed of every joint
    pub fn move_to_with_speed(&mut self, leg: &mut Leg, point: Point, speed: f64, global: bool) -> bool {
        self.move_leg(leg, point, Some(speed), global)
    }

    fn move_leg(&mut self, leg: &mut Leg, point: Point, speed: Option<f64>, global: bool) -> bool {
        let angles = match self.solve(leg, point, global) {
            Ok(angles) => angles,
            Err(e) => {
                debug!(side = ?leg.side, "{}", e);
                return false;
            }
        };

        debug!(side = ?leg.side, ?point, ?angles, "Moving leg");
        for (role, angle) in [
            (JointRole::Hip, angles.hip),
            (JointRole::Knee, angles.knee),
            (JointRole::Foot, angles.foot),
        ] {
            self.write_joint(leg.joint_mut(role), angle, speed);
        }
        true
    }

    fn write_joint(&mut self, joint: &mut Joint, degrees: f64, speed: Option<f64>) {
        let acked = match speed {
            Some(speed) => self.bus.set_angle_and_speed(joint.id, degrees, speed, true),
            None => self.bus.set_angle(joint.id, degrees, true),
        };
        if !acked {
            warn!(id = joint.id, "Servo did not acknowledge goal position");
        }
        joint.commanded_angle = Some(degrees);
    }

    /// Buffer one joint angle (degrees)
    pub fn set_joint(&mut self, leg: &mut Leg, role: JointRole, degrees: f64) {
        self.write_joint(leg.joint_mut(role), degrees, None);
    }

    /// Buffer all three joint angles (degrees)
    pub fn set_joint_angles(&mut self, leg: &mut Leg, degrees: JointAngles) {
        self.set_joint(leg, JointRole::Hip, degrees.hip);
        self.set_joint(leg, JointRole::Knee, degrees.knee);
        self.set_joint(leg, JointRole::Foot, degrees.foot);
    }

    /// Execute the buffered writes of a leg
    pub fn commit(&mut self, leg: &Leg) {
        for id in leg.joint_ids() {
            self.bus.send_action(id);
        }
    }

    /// Refresh `last_known_angle` of every joint from the servos
    pub fn read_back(&mut self, leg: &mut Leg) {
        for role in JointRole::ALL {
            let joint = leg.joint_mut(role);
            joint.last_known_angle = self.bus.read_angle(joint.id);
        }
        debug!(
            side = ?leg.side,
            hip = ?leg.hip.last_known_angle,
            knee = ?leg.knee.last_known_angle,
            foot = ?leg.foot.last_known_angle,
            "Read back joint angles"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{MemoryHandle, MemoryTransport};
    use crate::protocol::link::LinkChannel;
    use crate::protocol::servo::Instruction;
    use crate::test_support::{frames, servo_responder};

    const MASTER_IDS: &[u8] = &[7, 8, 9, 10, 11, 12];

    fn controller() -> (LegController, MemoryHandle, MemoryHandle) {
        let (right, right_handle) = MemoryTransport::with_responder(servo_responder(MASTER_IDS));
        let (left, left_handle) = MemoryTransport::with_responder(servo_responder(MASTER_IDS));
        let bus = ServoBus::new(
            LinkChannel::new("servo-r", Box::new(right), 10),
            LinkChannel::new("servo-l", Box::new(left), 10),
        );
        (LegController::new(bus, LegGeometry::default()), right_handle, left_handle)
    }

    fn master_state() -> RobotState {
        RobotState::new(Leg::new(Side::Right, 7, 8, 9), Leg::new(Side::Left, 10, 11, 12))
    }

    #[test]
    fn test_from_discovery() {
        let mut discovery = Discovery::default();
        for id in [4, 5, 6, 1, 2, 3] {
            discovery.record(id);
        }
        let state = RobotState::from_discovery(&discovery).unwrap();
        assert_eq!(state.role, NodeRole::SlaveB);
        assert_eq!(state.left.joint_ids(), [4, 5, 6]);
        assert!(state.left.mount.rotated);
    }

    #[test]
    fn test_from_discovery_rejects_incomplete_leg() {
        let mut discovery = Discovery::default();
        for id in [7, 8, 9, 10, 12] {
            discovery.record(id);
        }
        assert_eq!(
            RobotState::from_discovery(&discovery),
            Err(LegError::Incomplete {
                side: Side::Left,
                missing: JointRole::Knee
            })
        );
    }

    #[test]
    fn test_move_to_writes_three_buffered_angles() {
        let (mut legs, right, left) = controller();
        let mut state = master_state();

        assert!(legs.move_to(&mut state.right, Point::new(150.0, 0.0, -50.0), false));

        let sent = frames(&right.take_written());
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|p| p.instruction == Instruction::RegWrite as u8));
        assert_eq!(sent.iter().map(|p| p.destination).collect::<Vec<_>>(), vec![7, 8, 9]);
        assert!(left.take_written().is_empty());

        let knee = state.right.knee.commanded_angle.unwrap();
        assert!((knee - (-11.15)).abs() < 0.01);
    }

    #[test]
    fn test_move_to_global_uses_mount() {
        let (mut legs, _right, left) = controller();
        let mut state = master_state();

        // Body point mirrored onto the left side, same leg-frame target
        assert!(legs.move_to_with_speed(&mut state.left, Point::new(-318.5, 0.0, -50.0), 200.0, true));
        let sent = frames(&left.take_written());
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].payload.len(), 5);

        let foot = state.left.foot.commanded_angle.unwrap();
        assert!((foot - 83.58).abs() < 0.01);
    }

    #[test]
    fn test_unreachable_target_sends_nothing() {
        let (mut legs, right, _left) = controller();
        let mut state = master_state();

        assert!(!legs.move_to(&mut state.right, Point::new(500.0, 0.0, 0.0), false));
        assert!(right.take_written().is_empty());
        assert_eq!(state.right.hip.commanded_angle, None);
    }

    #[test]
    fn test_commit_sends_action_per_joint() {
        let (mut legs, right, _left) = controller();
        let state = master_state();

        legs.commit(&state.right);
        let sent = frames(&right.take_written());
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|p| p.instruction == Instruction::Action as u8));
    }

    #[test]
    fn test_read_back() {
        let (mut legs, _right, _left) = controller();
        let mut state = master_state();

        legs.read_back(&mut state.left);
        assert!(state.left.hip.last_known_angle.is_some());
        assert!(state.left.foot.last_known_angle.is_some());
    }
}
