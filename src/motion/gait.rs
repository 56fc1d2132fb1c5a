// Master-side gait coordinator
//
// Moves the six legs as two tripods: on each node one side belongs to the
// swing group and the other to the stance group, mirrored between the master
// and the slaves. Local legs go through the LegController, remote legs
// through POINT commands; every phase ends with ACTION on all nodes so the
// buffered moves start together.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::kinematics::{JointAngles, Mount, Point, global_point, HIP_SPACING_Y};
use super::leg::{LegController, RobotState};
use crate::config;
use crate::hal::{Delay, ThreadDelay};
use crate::messages::{ConfigFlags, NodeId};
use crate::protocol::intercpu::InterCpu;
use crate::protocol::link::CancelToken;
use crate::protocol::servo::Side;

/// Hip id of the leg all gait points are expressed for (middle right)
const REFERENCE_HIP: u8 = 7;

const SLAVES: [NodeId; 2] = [NodeId::SlaveA, NodeId::SlaveB];

/// Joint angles (degrees) of the two init stages
const INIT_STAGES: [JointAngles; 2] = [JointAngles::new(0.0, 0.0, 0.0), JointAngles::new(0.0, 45.0, 45.0)];

/// What the coordinator does when a move is not acknowledged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the phase without ACTION and restart the cycle
    #[default]
    HoldPosition,
    /// Log and commit anyway
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GaitPhase {
    LivenessGate,
    InitPose,
    PrepareSwing,
    Reposition,
    Plant,
    SwapRoles,
    DriveStance,
}

/// Which side of each node swings and which carries the body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GaitRoleSet {
    pub active_side: Side,
    pub master_down: Side,
    pub master_up: Side,
    pub slave_down: Side,
    pub slave_up: Side,
}

impl GaitRoleSet {
    /// Master legs on `side` and slave legs on the other side carry the body
    fn with_active(side: Side) -> Self {
        Self {
            active_side: side,
            master_down: side,
            master_up: side.opposite(),
            slave_down: side.opposite(),
            slave_up: side,
        }
    }

    pub fn new() -> Self {
        Self::with_active(Side::Right)
    }

    /// Exchange swing and stance groups
    pub fn swap(&mut self) {
        *self = Self::with_active(self.active_side.opposite());
    }

    pub fn down_side(&self, node: NodeId) -> Side {
        if node == NodeId::Master { self.master_down } else { self.slave_down }
    }

    pub fn up_side(&self, node: NodeId) -> Side {
        if node == NodeId::Master { self.master_up } else { self.slave_up }
    }

    /// Legs of the stance group
    pub fn active_legs(&self) -> [(NodeId, Side); 3] {
        [
            (NodeId::Master, self.master_down),
            (NodeId::SlaveA, self.slave_down),
            (NodeId::SlaveB, self.slave_down),
        ]
    }
}

impl Default for GaitRoleSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a target given for the middle-right leg onto a node and side
pub fn point_for_node(point: Point, node: NodeId, side: Side) -> Point {
    let mut target = point;
    match node {
        NodeId::SlaveA => target.y -= HIP_SPACING_Y,
        NodeId::SlaveB => target.y += HIP_SPACING_Y,
        _ => {}
    }
    if side == Side::Left {
        target.x = -target.x;
    }
    target
}

/// Targets of one gait style, in body coordinates of the middle-right leg
pub trait GaitStyle: Send {
    fn name(&self) -> &'static str;

    /// Airborne target right after leaving the ground at `ground`
    fn lift(&self, ground: Point) -> Point;

    /// Airborne target at the front of the stride
    fn reposition(&self) -> Point;

    /// Ground contact at the front of the stride
    fn plant(&self) -> Point;

    /// Waypoints pushing the stance group from `from` to the back of the stride
    fn stroke(&self, from: Point) -> Vec<Point>;
}

/// Four fixed points; the stance group strokes in a single move
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FourPointGait {
    pub front_down: Point,
    pub front_up: Point,
    pub back_up: Point,
    pub back_down: Point,
}

impl Default for FourPointGait {
    fn default() -> Self {
        Self {
            front_down: config::FOUR_POINT_FRONT_DOWN,
            front_up: config::FOUR_POINT_FRONT_UP,
            back_up: config::FOUR_POINT_BACK_UP,
            back_down: config::FOUR_POINT_BACK_DOWN,
        }
    }
}

impl GaitStyle for FourPointGait {
    fn name(&self) -> &'static str {
        "four-point"
    }

    fn lift(&self, _ground: Point) -> Point {
        self.back_up
    }

    fn reposition(&self) -> Point {
        self.front_up
    }

    fn plant(&self) -> Point {
        self.front_down
    }

    fn stroke(&self, _from: Point) -> Vec<Point> {
        vec![self.back_down]
    }
}

/// Stride computed around an origin along a step direction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripodGait {
    origin: Point,
    direction: Point,
    half_stride: f64,
    lift_height: f64,
    increment: f64,
}

impl TripodGait {
    pub fn new(origin: Point, direction: Point, half_stride: f64, lift_height: f64, increment: f64) -> Self {
        let length = direction.length();
        let direction = if length > 0.0 {
            direction * (1.0 / length)
        } else {
            warn!("Zero step direction, walking forward");
            Point::new(0.0, 1.0, 0.0)
        };
        let increment = if increment > 0.0 {
            increment
        } else {
            warn!(increment, "Stroke increment must be positive, using default");
            config::TRIPOD_INCREMENT
        };

        Self {
            origin,
            direction,
            half_stride,
            lift_height,
            increment,
        }
    }

    fn front(&self) -> Point {
        self.origin + self.direction * self.half_stride
    }

    fn back(&self) -> Point {
        self.origin - self.direction * self.half_stride
    }

    fn raised(&self, point: Point) -> Point {
        point + Point::new(0.0, 0.0, self.lift_height)
    }
}

impl GaitStyle for TripodGait {
    fn name(&self) -> &'static str {
        "tripod"
    }

    fn lift(&self, ground: Point) -> Point {
        self.raised(ground)
    }

    fn reposition(&self) -> Point {
        self.raised(self.front())
    }

    fn plant(&self) -> Point {
        self.front()
    }

    fn stroke(&self, from: Point) -> Vec<Point> {
        let end = self.back();
        let steps = (from.distance_to(end) / self.increment).ceil().max(1.0) as usize;
        (1..=steps)
            .map(|i| from + (end - from) * (i as f64 / steps as f64))
            .collect()
    }
}

/// Gait style selection as stored in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GaitStyleConfig {
    FourPoint {
        front_down: Point,
        front_up: Point,
        back_up: Point,
        back_down: Point,
    },
    Tripod {
        origin: Point,
        direction: Point,
        half_stride: f64,
        lift_height: f64,
        increment: f64,
    },
}

impl GaitStyleConfig {
    pub fn four_point() -> Self {
        let gait = FourPointGait::default();
        GaitStyleConfig::FourPoint {
            front_down: gait.front_down,
            front_up: gait.front_up,
            back_up: gait.back_up,
            back_down: gait.back_down,
        }
    }

    pub fn tripod() -> Self {
        GaitStyleConfig::Tripod {
            origin: config::TRIPOD_ORIGIN,
            direction: config::TRIPOD_DIRECTION,
            half_stride: config::TRIPOD_HALF_STRIDE,
            lift_height: config::TRIPOD_LIFT_HEIGHT,
            increment: config::TRIPOD_INCREMENT,
        }
    }

    pub fn build(&self) -> Box<dyn GaitStyle> {
        match *self {
            GaitStyleConfig::FourPoint {
                front_down,
                front_up,
                back_up,
                back_down,
            } => Box::new(FourPointGait {
                front_down,
                front_up,
                back_up,
                back_down,
            }),
            GaitStyleConfig::Tripod {
                origin,
                direction,
                half_stride,
                lift_height,
                increment,
            } => Box::new(TripodGait::new(origin, direction, half_stride, lift_height, increment)),
        }
    }
}

impl Default for GaitStyleConfig {
    fn default() -> Self {
        Self::four_point()
    }
}

/// Coordinator tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaitOptions {
    pub policy: FailurePolicy,
    /// Moving speed for every joint; servo default when unset
    pub speed: Option<f64>,
    pub liveness_attempts: u32,
    pub liveness_pause_ms: u64,
    pub init_pause_ms: u64,
    pub phase_pause_ms: u64,
    /// Failed cycles in a row before the gait gives up
    pub max_consecutive_failures: u32,
}

impl Default for GaitOptions {
    fn default() -> Self {
        Self {
            policy: FailurePolicy::default(),
            speed: None,
            liveness_attempts: config::LIVENESS_ATTEMPTS,
            liveness_pause_ms: config::LIVENESS_PAUSE_MS,
            init_pause_ms: config::INIT_PAUSE_MS,
            phase_pause_ms: config::PHASE_PAUSE_MS,
            max_consecutive_failures: config::MAX_CONSECUTIVE_FAILURES,
        }
    }
}

/// Error types for the gait
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GaitError {
    #[error("Slave nodes did not answer after {attempts} liveness rounds")]
    SlavesUnresponsive { attempts: u32 },

    #[error("Local {side:?} leg cannot reach {point:?}")]
    LocalUnreachable { side: Side, point: Point },

    #[error("{node:?} rejected or missed the {phase:?} command")]
    RemoteRejected { node: NodeId, phase: GaitPhase },

    #[error("Gait cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    Swing,
    Stance,
}

pub struct GaitCoordinator {
    state: RobotState,
    legs: LegController,
    intercpu: InterCpu,
    style: Box<dyn GaitStyle>,
    options: GaitOptions,
    roles: GaitRoleSet,
    phase: GaitPhase,
    delay: Box<dyn Delay>,
    cancel: CancelToken,
    /// Last committed target of the swing group
    swing_position: Point,
    /// Where the swing group last stood on the ground
    swing_ground: Point,
    /// Last committed target of the stance group
    stance_position: Point,
    cycles: u64,
}

impl GaitCoordinator {
    pub fn new(
        state: RobotState,
        legs: LegController,
        intercpu: InterCpu,
        style: Box<dyn GaitStyle>,
        options: GaitOptions,
    ) -> Self {
        let neutral = global_point(
            legs.geometry().forward(INIT_STAGES[1].to_radians()),
            &Mount::for_hip(REFERENCE_HIP),
        );

        Self {
            state,
            legs,
            intercpu,
            style,
            options,
            roles: GaitRoleSet::new(),
            phase: GaitPhase::LivenessGate,
            delay: Box::new(ThreadDelay),
            cancel: CancelToken::new(),
            swing_position: neutral,
            swing_ground: neutral,
            stance_position: neutral,
            cycles: 0,
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

    pub fn roles(&self) -> &GaitRoleSet {
        &self.roles
    }

    pub fn phase(&self) -> GaitPhase {
        self.phase
    }

    pub fn state(&self) -> &RobotState {
        &self.state
    }

    /// Completed cycles
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn stance_position(&self) -> Point {
        self.stance_position
    }

    pub fn swing_position(&self) -> Point {
        self.swing_position
    }

    fn enter(&mut self, phase: GaitPhase) -> Result<(), GaitError> {
        if self.cancel.is_cancelled() {
            return Err(GaitError::Cancelled);
        }
        debug!(?phase, "Entering gait phase");
        self.phase = phase;
        Ok(())
    }

    fn pause(&mut self, millis: u64) {
        self.delay.pause(Duration::from_millis(millis));
    }

    /// Poll both slaves until they answer, with a bounded number of rounds
    pub fn wait_for_slaves(&mut self) -> Result<(), GaitError> {
        self.enter(GaitPhase::LivenessGate)?;

        for round in 1..=self.options.liveness_attempts {
            if SLAVES.iter().all(|&node| self.intercpu.is_alive(node)) {
                info!(round, "Slave nodes alive");
                return Ok(());
            }
            debug!(round, "Slave nodes not answering yet");

            if self.cancel.is_cancelled() {
                return Err(GaitError::Cancelled);
            }
            self.pause(self.options.liveness_pause_ms);
        }

        Err(GaitError::SlavesUnresponsive {
            attempts: self.options.liveness_attempts,
        })
    }

    /// Drive every joint through the two init stages
    pub fn init_pose(&mut self) -> Result<(), GaitError> {
        self.enter(GaitPhase::InitPose)?;

        for stage in INIT_STAGES {
            for side in [Side::Right, Side::Left] {
                self.legs.set_joint_angles(self.state.leg_mut(side), stage);
            }
            for node in SLAVES {
                for (joints, angle) in angle_groups(stage) {
                    let acked = self
                        .intercpu
                        .send_angle(node, angle, joints | ConfigFlags::LEFT | ConfigFlags::RIGHT);
                    self.check_remote(acked, node, self.options.policy)?;
                }
            }
            self.commit();
            self.pause(self.options.init_pause_ms);
        }

        let neutral = global_point(
            self.legs.geometry().forward(INIT_STAGES[1].to_radians()),
            &Mount::for_hip(REFERENCE_HIP),
        );
        self.swing_position = neutral;
        self.swing_ground = neutral;
        self.stance_position = neutral;

        info!("Init pose reached");
        Ok(())
    }

    /// Commit all buffered moves, local first
    fn commit(&mut self) {
        self.legs.commit(&self.state.right);
        self.legs.commit(&self.state.left);
        self.intercpu.send_action(NodeId::Broadcast);
    }

    fn check_remote(&self, acked: bool, node: NodeId, policy: FailurePolicy) -> Result<(), GaitError> {
        if acked {
            return Ok(());
        }
        match policy {
            FailurePolicy::HoldPosition => Err(GaitError::RemoteRejected {
                node,
                phase: self.phase,
            }),
            FailurePolicy::Ignore => {
                warn!(?node, phase = ?self.phase, "Command not acknowledged, ignoring");
                Ok(())
            }
        }
    }

    /// Buffer `target` for all three legs of a group
    fn move_group(&mut self, group: Group, target: Point, policy: FailurePolicy) -> Result<(), GaitError> {
        let (master_side, slave_side) = match group {
            Group::Swing => (self.roles.master_up, self.roles.slave_up),
            Group::Stance => (self.roles.master_down, self.roles.slave_down),
        };

        let local = point_for_node(target, NodeId::Master, master_side);
        let leg = self.state.leg_mut(master_side);
        let moved = match self.options.speed {
            Some(speed) => self.legs.move_to_with_speed(leg, local, speed, true),
            None => self.legs.move_to(leg, local, true),
        };
        if !moved {
            match policy {
                FailurePolicy::HoldPosition => {
                    return Err(GaitError::LocalUnreachable {
                        side: master_side,
                        point: local,
                    });
                }
                FailurePolicy::Ignore => warn!(side = ?master_side, ?local, "Local leg cannot reach target, ignoring"),
            }
        }

        let config = ConfigFlags::for_side(slave_side) | ConfigFlags::GLOBAL;
        for node in SLAVES {
            let point = point_for_node(target, node, slave_side);
            let acked = match self.options.speed {
                Some(speed) => self.intercpu.send_point_and_speed(node, point, speed, config),
                None => self.intercpu.send_point(node, point, config),
            };
            self.check_remote(acked, node, policy)?;
        }
        Ok(())
    }

    /// Overwrite the pending writes of an aborted phase with the group's
    /// last committed target, so a later ACTION keeps it in place
    fn hold(&mut self, group: Group) {
        let target = match group {
            Group::Swing => self.swing_position,
            Group::Stance => self.stance_position,
        };
        debug!(?group, ?target, "Holding position");
        if let Err(e) = self.move_group(group, target, FailurePolicy::Ignore) {
            warn!(?group, "{}; position not held", e);
        }
    }

    fn swing_phase(&mut self, phase: GaitPhase, target: Point) -> Result<(), GaitError> {
        self.enter(phase)?;

        if let Err(e) = self.move_group(Group::Swing, target, self.options.policy) {
            self.hold(Group::Swing);
            return Err(e);
        }
        self.commit();
        self.swing_position = target;
        self.pause(self.options.phase_pause_ms);
        Ok(())
    }

    /// One cycle: swing one group forward, swap roles, stroke the other
    pub fn step(&mut self) -> Result<(), GaitError> {
        let lifted = self.style.lift(self.swing_ground);
        self.swing_phase(GaitPhase::PrepareSwing, lifted)?;

        let front = self.style.reposition();
        self.swing_phase(GaitPhase::Reposition, front)?;

        let planted = self.style.plant();
        self.swing_phase(GaitPhase::Plant, planted)?;

        self.enter(GaitPhase::SwapRoles)?;
        self.roles.swap();
        std::mem::swap(&mut self.swing_position, &mut self.stance_position);
        self.swing_ground = self.swing_position;
        debug!(active = ?self.roles.active_side, "Swapped leg groups");

        self.enter(GaitPhase::DriveStance)?;
        let waypoints = self.style.stroke(self.stance_position);
        for (index, waypoint) in waypoints.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(GaitError::Cancelled);
            }
            if let Err(e) = self.move_group(Group::Stance, waypoint, self.options.policy) {
                self.hold(Group::Stance);
                if index == 0 {
                    return Err(e);
                }
                debug!(index, "{}; stroke ends early", e);
                break;
            }
            self.commit();
            self.stance_position = waypoint;
            self.pause(self.options.phase_pause_ms);
        }

        self.cycles += 1;
        Ok(())
    }

    /// Liveness gate, init pose, then cycles until cancelled or `max_cycles`
    ///
    /// Returns the number of completed cycles.
    pub fn run(&mut self, max_cycles: Option<u64>) -> Result<u64, GaitError> {
        info!(style = self.style.name(), policy = ?self.options.policy, "Starting gait");

        match self.wait_for_slaves().and_then(|()| self.init_pose()) {
            Ok(()) => {}
            Err(GaitError::Cancelled) => return Ok(self.cycles),
            Err(e) => return Err(e),
        }

        let mut failures = 0;
        while max_cycles.is_none_or(|max| self.cycles < max) {
            match self.step() {
                Ok(()) => failures = 0,
                Err(GaitError::Cancelled) => break,
                Err(e @ (GaitError::LocalUnreachable { .. } | GaitError::RemoteRejected { .. })) => {
                    failures += 1;
                    warn!(failures, "{}; holding position", e);
                    if failures >= self.options.max_consecutive_failures {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        info!(cycles = self.cycles, "Gait stopped");
        Ok(self.cycles)
    }
}

/// Joints sharing an angle go out in one ANGLE command
fn angle_groups(angles: JointAngles) -> Vec<(ConfigFlags, f64)> {
    let mut groups: Vec<(ConfigFlags, f64)> = Vec::with_capacity(3);
    for (joint, angle) in [
        (ConfigFlags::HIP, angles.hip),
        (ConfigFlags::KNEE, angles.knee),
        (ConfigFlags::FOOT, angles.foot),
    ] {
        match groups.iter_mut().find(|(_, existing)| *existing == angle) {
            Some((joints, _)) => *joints |= joint,
            None => groups.push((joint, angle)),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Dispatch, SlaveDispatcher};
    use crate::hal::{MemoryHandle, MemoryTransport, NoDelay, Responder};
    use crate::messages::Message;
    use crate::motion::kinematics::LegGeometry;
    use crate::motion::leg::Leg;
    use crate::protocol::link::LinkChannel;
    use crate::protocol::servo::ServoBus;
    use crate::test_support::{messages, servo_responder, slave_responder};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MASTER_IDS: &[u8] = &[7, 8, 9, 10, 11, 12];
    const SLAVE_A_IDS: &[u8] = &[13, 14, 15, 16, 17, 18];
    const SLAVE_B_IDS: &[u8] = &[1, 2, 3, 4, 5, 6];

    struct Rig {
        gait: GaitCoordinator,
        com1: MemoryHandle,
        com3: MemoryHandle,
        servo_right: MemoryHandle,
    }

    fn rig(style: Box<dyn GaitStyle>, options: GaitOptions, slave_a: Responder, slave_b: Responder) -> Rig {
        let (right, servo_right) = MemoryTransport::with_responder(servo_responder(MASTER_IDS));
        let (left, _servo_left) = MemoryTransport::with_responder(servo_responder(MASTER_IDS));
        let bus = ServoBus::new(
            LinkChannel::new("servo-r", Box::new(right), 10),
            LinkChannel::new("servo-l", Box::new(left), 10),
        );

        let (a, com1) = MemoryTransport::with_responder(slave_a);
        let (b, com3) = MemoryTransport::with_responder(slave_b);
        let intercpu = InterCpu::for_master(
            LinkChannel::new("com1", Box::new(a), 20),
            LinkChannel::new("com3", Box::new(b), 20),
        );

        let state = RobotState::new(Leg::new(Side::Right, 7, 8, 9), Leg::new(Side::Left, 10, 11, 12));
        let legs = LegController::new(bus, LegGeometry::default());
        let gait = GaitCoordinator::new(state, legs, intercpu, style, options).with_delay(Box::new(NoDelay));

        Rig {
            gait,
            com1,
            com3,
            servo_right,
        }
    }

    fn acking_rig(options: GaitOptions) -> Rig {
        rig(
            Box::new(FourPointGait::default()),
            options,
            Box::new(slave_responder(false)),
            Box::new(slave_responder(false)),
        )
    }

    fn count_actions(sent: &[Message]) -> usize {
        sent.iter().filter(|m| **m == Message::Action).count()
    }

    fn points(sent: &[Message]) -> Vec<(ConfigFlags, Point)> {
        sent.iter()
            .filter_map(|m| match m {
                Message::Point { config, point, .. } => Some((*config, *point)),
                _ => None,
            })
            .collect()
    }

    /// Four-point targets with a stroke that leaves the workspace halfway
    struct ShortReach {
        inner: FourPointGait,
        far: Point,
    }

    impl GaitStyle for ShortReach {
        fn name(&self) -> &'static str {
            "short-reach"
        }

        fn lift(&self, ground: Point) -> Point {
            self.inner.lift(ground)
        }

        fn reposition(&self) -> Point {
            self.inner.reposition()
        }

        fn plant(&self) -> Point {
            self.inner.plant()
        }

        fn stroke(&self, _from: Point) -> Vec<Point> {
            vec![self.inner.back_down, self.far, self.inner.front_down]
        }
    }

    #[test]
    fn test_role_set_starts_right() {
        let roles = GaitRoleSet::new();
        assert_eq!(roles.active_side, Side::Right);
        assert_eq!(roles.master_down, Side::Right);
        assert_eq!(roles.master_up, Side::Left);
        assert_eq!(roles.slave_down, Side::Left);
        assert_eq!(roles.slave_up, Side::Right);
        assert_eq!(roles.down_side(NodeId::SlaveA), Side::Left);
        assert_eq!(roles.up_side(NodeId::Master), Side::Left);
    }

    #[test]
    fn test_swap_makes_active_legs_disjoint() {
        let mut roles = GaitRoleSet::new();
        for _ in 0..4 {
            let before = roles.active_legs();
            roles.swap();
            let after = roles.active_legs();
            assert!(before.iter().all(|leg| !after.contains(leg)));
        }
        assert_eq!(roles, GaitRoleSet::new());
    }

    #[test]
    fn test_point_for_node() {
        let p = Point::new(263.85, 55.0, -129.1);
        assert_eq!(point_for_node(p, NodeId::Master, Side::Right), p);
        assert_eq!(point_for_node(p, NodeId::SlaveA, Side::Right), Point::new(263.85, 55.0 - 208.5, -129.1));
        assert_eq!(point_for_node(p, NodeId::SlaveB, Side::Left), Point::new(-263.85, 55.0 + 208.5, -129.1));
    }

    #[test]
    fn test_angle_groups() {
        assert_eq!(
            angle_groups(JointAngles::new(0.0, 0.0, 0.0)),
            vec![(ConfigFlags::HIP | ConfigFlags::KNEE | ConfigFlags::FOOT, 0.0)]
        );
        assert_eq!(
            angle_groups(JointAngles::new(0.0, 45.0, 45.0)),
            vec![(ConfigFlags::HIP, 0.0), (ConfigFlags::KNEE | ConfigFlags::FOOT, 45.0)]
        );
    }

    #[test]
    fn test_tripod_stroke_waypoints() {
        let tripod = TripodGait::new(Point::new(278.5, 0.0, -110.0), Point::new(0.0, 2.0, 0.0), 40.0, 40.0, 5.0);
        assert_eq!(tripod.plant(), Point::new(278.5, 40.0, -110.0));
        assert_eq!(tripod.reposition(), Point::new(278.5, 40.0, -70.0));

        let waypoints = tripod.stroke(tripod.plant());
        assert_eq!(waypoints.len(), 16);
        let end = waypoints[15];
        assert!(end.distance_to(Point::new(278.5, -40.0, -110.0)) < 1e-9);

        let mut previous = tripod.plant();
        for waypoint in waypoints {
            assert!(previous.distance_to(waypoint) <= 5.0 + 1e-9);
            previous = waypoint;
        }
    }

    #[test]
    fn test_style_config_builds_styles() {
        assert_eq!(GaitStyleConfig::default().build().name(), "four-point");
        assert_eq!(GaitStyleConfig::tripod().build().name(), "tripod");
    }

    #[test]
    fn test_wait_for_slaves() {
        let mut rig = acking_rig(GaitOptions::default());
        assert_eq!(rig.gait.wait_for_slaves(), Ok(()));
        assert_eq!(rig.gait.phase(), GaitPhase::LivenessGate);
    }

    #[test]
    fn test_wait_for_slaves_gives_up() {
        let options = GaitOptions {
            liveness_attempts: 3,
            ..GaitOptions::default()
        };
        let mut rig = rig(
            Box::new(FourPointGait::default()),
            options,
            Box::new(slave_responder(false)),
            Box::new(|_: &[u8]| -> Option<Vec<u8>> { None }),
        );

        assert_eq!(rig.gait.wait_for_slaves(), Err(GaitError::SlavesUnresponsive { attempts: 3 }));
        // One STATUS per round to each slave
        assert_eq!(messages(&rig.com3.take_written()).len(), 3);
    }

    #[test]
    fn test_init_pose_commands() {
        let mut rig = acking_rig(GaitOptions::default());
        rig.gait.init_pose().unwrap();

        let all = ConfigFlags::LEFT | ConfigFlags::RIGHT;
        let expected = vec![
            Message::Angle {
                config: ConfigFlags::HIP | ConfigFlags::KNEE | ConfigFlags::FOOT | all,
                angle: 0.0,
            },
            Message::Action,
            Message::Angle {
                config: ConfigFlags::HIP | all,
                angle: 0.0,
            },
            Message::Angle {
                config: ConfigFlags::KNEE | ConfigFlags::FOOT | all,
                angle: 45.0,
            },
            Message::Action,
        ];
        assert_eq!(messages(&rig.com1.take_written()), expected);
        assert_eq!(messages(&rig.com3.take_written()), expected);

        let state = rig.gait.state();
        assert_eq!(state.right.knee.commanded_angle, Some(45.0));
        assert_eq!(state.left.hip.commanded_angle, Some(0.0));
        assert!(rig.gait.stance_position().distance_to(Point::new(278.604, 0.0, -129.104)) < 1e-3);
    }

    #[test]
    fn test_four_point_step() {
        let mut rig = acking_rig(GaitOptions::default());
        rig.gait.init_pose().unwrap();
        rig.com1.take_written();
        rig.servo_right.take_written();

        rig.gait.step().unwrap();

        let sent = messages(&rig.com1.take_written());
        // Three swing phases and a one-waypoint stroke, each committed
        assert_eq!(count_actions(&sent), 4);

        let sent_points = points(&sent);
        assert_eq!(sent_points.len(), 4);
        // Swing group on the slaves starts on the right side
        let gait = FourPointGait::default();
        assert_eq!(
            sent_points[0],
            (
                ConfigFlags::RIGHT | ConfigFlags::GLOBAL,
                point_for_node(gait.back_up, NodeId::SlaveA, Side::Right)
            )
        );
        // After the swap the slaves' right legs carry the body
        assert_eq!(
            sent_points[3],
            (
                ConfigFlags::RIGHT | ConfigFlags::GLOBAL,
                point_for_node(gait.back_down, NodeId::SlaveA, Side::Right)
            )
        );

        assert_eq!(rig.gait.roles().active_side, Side::Left);
        assert_eq!(rig.gait.cycles(), 1);
        assert_eq!(rig.gait.stance_position(), gait.back_down);
        assert!(!rig.servo_right.take_written().is_empty());
    }

    #[test]
    fn test_hold_position_on_nak() {
        let mut rig = rig(
            Box::new(FourPointGait::default()),
            GaitOptions::default(),
            Box::new(slave_responder(false)),
            Box::new(slave_responder(true)),
        );
        rig.gait.init_pose().unwrap();
        rig.com1.take_written();

        assert_eq!(
            rig.gait.step(),
            Err(GaitError::RemoteRejected {
                node: NodeId::SlaveB,
                phase: GaitPhase::PrepareSwing
            })
        );

        let sent = messages(&rig.com1.take_written());
        assert_eq!(count_actions(&sent), 0);
        // Rejected target, then the held position again
        let sent_points = points(&sent);
        assert_eq!(sent_points.len(), 2);
        let neutral = rig.gait.swing_position();
        assert_eq!(sent_points[1].1, point_for_node(neutral, NodeId::SlaveA, Side::Right));

        assert_eq!(rig.gait.roles().active_side, Side::Right);
        assert_eq!(rig.gait.cycles(), 0);
    }

    #[test]
    fn test_ignore_policy_commits_anyway() {
        let options = GaitOptions {
            policy: FailurePolicy::Ignore,
            ..GaitOptions::default()
        };
        let mut rig = rig(
            Box::new(FourPointGait::default()),
            options,
            Box::new(slave_responder(true)),
            Box::new(slave_responder(true)),
        );
        rig.gait.init_pose().unwrap();
        rig.com1.take_written();

        assert_eq!(rig.gait.step(), Ok(()));
        assert_eq!(count_actions(&messages(&rig.com1.take_written())), 4);
        assert_eq!(rig.gait.roles().active_side, Side::Left);
    }

    #[test]
    fn test_stroke_ends_early_at_workspace_boundary() {
        let style = ShortReach {
            inner: FourPointGait::default(),
            far: Point::new(900.0, 0.0, -100.0),
        };
        let mut rig = rig(
            Box::new(style),
            GaitOptions::default(),
            Box::new(slave_responder(false)),
            Box::new(slave_responder(false)),
        );
        rig.gait.init_pose().unwrap();
        rig.com1.take_written();

        assert_eq!(rig.gait.step(), Ok(()));
        // The third waypoint is never tried
        assert_eq!(count_actions(&messages(&rig.com1.take_written())), 4);
        assert_eq!(rig.gait.stance_position(), FourPointGait::default().back_down);
        assert_eq!(rig.gait.cycles(), 1);
    }

    #[test]
    fn test_run_cycle_limit() {
        let mut rig = acking_rig(GaitOptions::default());
        assert_eq!(rig.gait.run(Some(2)), Ok(2));
        assert_eq!(*rig.gait.roles(), GaitRoleSet::new());
    }

    #[test]
    fn test_run_gives_up_after_repeated_failures() {
        let options = GaitOptions {
            max_consecutive_failures: 3,
            ..GaitOptions::default()
        };
        let mut rig = rig(
            Box::new(FourPointGait::default()),
            options,
            Box::new(slave_responder(true)),
            Box::new(slave_responder(false)),
        );

        assert!(matches!(rig.gait.run(None), Err(GaitError::RemoteRejected { node: NodeId::SlaveA, .. })));
        assert_eq!(rig.gait.cycles(), 0);
    }

    #[test]
    fn test_run_cancelled() {
        let cancel = CancelToken::new();
        let rig = acking_rig(GaitOptions::default());
        let mut gait = rig.gait.with_cancel_token(cancel.clone());

        cancel.cancel();
        assert_eq!(gait.run(None), Ok(0));
        assert!(rig.com1.take_written().is_empty());
    }

    /// Master-side peer backed by a real slave dispatcher with its own servo buses
    fn dispatcher_peer(node: NodeId, ids: &'static [u8], rejected: Arc<AtomicUsize>) -> Responder {
        let (right, _) = MemoryTransport::with_responder(servo_responder(ids));
        let (left, _) = MemoryTransport::with_responder(servo_responder(ids));
        let bus = ServoBus::new(
            LinkChannel::new("servo-r", Box::new(right), 10),
            LinkChannel::new("servo-l", Box::new(left), 10),
        );
        let (link, com3) = MemoryTransport::new();
        let intercpu = InterCpu::for_slave(node, LinkChannel::new("com3", Box::new(link), 10));

        let state = RobotState::new(
            Leg::new(Side::Right, ids[0], ids[1], ids[2]),
            Leg::new(Side::Left, ids[3], ids[4], ids[5]),
        );
        let mut dispatcher = SlaveDispatcher::new(state, LegController::new(bus, LegGeometry::default()), intercpu)
            .with_delay(Box::new(NoDelay));

        Box::new(move |bytes: &[u8]| -> Option<Vec<u8>> {
            com3.inject(bytes);
            for _ in 0..8 {
                match dispatcher.poll_once() {
                    Dispatch::Idle => break,
                    Dispatch::Point { accepted: false } => {
                        rejected.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
            let reply = com3.take_written();
            if messages(&reply).iter().any(|m| matches!(m, Message::Nak { .. })) {
                rejected.fetch_add(1, Ordering::Relaxed);
            }
            (!reply.is_empty()).then_some(reply)
        })
    }

    fn run_with_dispatchers(style: Box<dyn GaitStyle>, cycles: u64) -> (Result<u64, GaitError>, usize) {
        let rejected = Arc::new(AtomicUsize::new(0));
        let mut rig = rig(
            style,
            GaitOptions::default(),
            dispatcher_peer(NodeId::SlaveA, SLAVE_A_IDS, rejected.clone()),
            dispatcher_peer(NodeId::SlaveB, SLAVE_B_IDS, rejected.clone()),
        );
        let result = rig.gait.run(Some(cycles));
        (result, rejected.load(Ordering::Relaxed))
    }

    #[test]
    fn test_four_point_gait_with_dispatchers() {
        let (result, rejected) = run_with_dispatchers(Box::new(FourPointGait::default()), 3);
        assert_eq!(result, Ok(3));
        assert_eq!(rejected, 0);
    }

    #[test]
    fn test_tripod_gait_with_dispatchers() {
        let (result, rejected) = run_with_dispatchers(GaitStyleConfig::tripod().build(), 3);
        assert_eq!(result, Ok(3));
        assert_eq!(rejected, 0);
    }
}
