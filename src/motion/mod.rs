// Leg motion for the hexapod
//
// Provides:
// - Three-joint leg inverse and forward kinematics
// - Leg controller driving the local actuator bus
// - Master-side gait coordinator

pub mod gait;
pub mod kinematics;
pub mod leg;

pub use gait::{
    FailurePolicy, FourPointGait, GaitCoordinator, GaitError, GaitOptions, GaitPhase, GaitRoleSet, GaitStyle,
    GaitStyleConfig, TripodGait,
};
pub use kinematics::{JointAngles, KinematicsError, LegGeometry, Mount, Point};
pub use leg::{Joint, Leg, LegController, LegError, RobotState};
