// Leg kinematics for the three-joint hexapod legs
// Converts foot targets (mm) to hip/knee/foot angles (radians) and back.

use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;
use std::ops::{Add, Mul, Sub};

/// Leg segment lengths (mm)
pub const HIP_TO_KNEE: f64 = 50.0;
pub const KNEE_TO_FOOT: f64 = 85.0;
pub const FOOT_TO_TIP: f64 = 55.0;

/// Height of the knee axis relative to the hip frame origin (mm)
pub const KNEE_Z_OFFSET: f64 = -14.0;

/// Hip offset from the body centre along x (mm)
pub const HIP_OFFSET_X: f64 = 168.5;

/// Distance between neighbouring hips along y (mm)
pub const HIP_SPACING_Y: f64 = 208.5;

/// Cartesian point in mm
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance_to(self, other: Point) -> f64 {
        let d = other - self;
        (d.x * d.x + d.y * d.y + d.z * d.z).sqrt()
    }

    pub fn length(self) -> f64 {
        self.distance_to(Point::default())
    }
}

impl Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Point {
    type Output = Point;

    fn mul(self, rhs: f64) -> Point {
        Point::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Joint angles of one leg
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JointAngles {
    pub hip: f64,
    pub knee: f64,
    pub foot: f64,
}

impl JointAngles {
    pub const fn new(hip: f64, knee: f64, foot: f64) -> Self {
        Self { hip, knee, foot }
    }

    pub fn to_degrees(self) -> Self {
        Self::new(self.hip.to_degrees(), self.knee.to_degrees(), self.foot.to_degrees())
    }

    pub fn to_radians(self) -> Self {
        Self::new(self.hip.to_radians(), self.knee.to_radians(), self.foot.to_radians())
    }
}

/// Error types for kinematics
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum KinematicsError {
    #[error("Point ({x:.1}, {y:.1}, {z:.1}) is outside the leg workspace")]
    Unreachable { x: f64, y: f64, z: f64 },
}

impl KinematicsError {
    fn unreachable(point: Point) -> Self {
        KinematicsError::Unreachable {
            x: point.x,
            y: point.y,
            z: point.z,
        }
    }
}

/// Segment lengths of a leg
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegGeometry {
    pub hip_to_knee: f64,
    pub knee_to_foot: f64,
    pub foot_to_tip: f64,
    pub knee_z_offset: f64,
}

impl Default for LegGeometry {
    fn default() -> Self {
        Self {
            hip_to_knee: HIP_TO_KNEE,
            knee_to_foot: KNEE_TO_FOOT,
            foot_to_tip: FOOT_TO_TIP,
            knee_z_offset: KNEE_Z_OFFSET,
        }
    }
}

impl LegGeometry {
    /// Solve joint angles (radians) for a foot target in the leg frame
    ///
    /// The leg frame has x pointing away from the body, so `x` must be
    /// non-zero unless `y` is, and the hip swivel is `atan(y / x)`. Targets
    /// the three segments cannot reach yield `Unreachable`.
    pub fn inverse(&self, point: Point) -> Result<JointAngles, KinematicsError> {
        let z = point.z - self.knee_z_offset;
        let horizontal = point.x.hypot(point.y);

        let hip = if point.x != 0.0 {
            (point.y / point.x).atan()
        } else if point.y != 0.0 {
            FRAC_PI_2.copysign(point.y)
        } else {
            return Err(KinematicsError::unreachable(point));
        };

        // Knee-to-tip distance in the leg plane
        let reach = horizontal - self.hip_to_knee;
        let span = reach.hypot(z);

        // Law of cosines: angle at the foot joint between the two segments
        let alpha = ((self.foot_to_tip.powi(2) + self.knee_to_foot.powi(2) - span * span)
            / (2.0 * self.foot_to_tip * self.knee_to_foot))
            .acos();
        let beta = (self.foot_to_tip / span * alpha.sin()).asin();
        let gamma = (z.abs() / span).asin();

        let knee = if z < 0.0 { gamma - beta } else { -(gamma + beta) };
        let foot = std::f64::consts::PI - alpha;

        if hip.is_nan() || knee.is_nan() || foot.is_nan() {
            return Err(KinematicsError::unreachable(point));
        }

        Ok(JointAngles { hip, knee, foot })
    }

    /// Foot tip position in the leg frame for the given joint angles (radians)
    pub fn forward(&self, angles: JointAngles) -> Point {
        let outer = angles.knee + angles.foot;
        let reach = self.hip_to_knee + self.knee_to_foot * angles.knee.cos() + self.foot_to_tip * outer.cos();

        Point {
            x: reach * angles.hip.cos(),
            y: reach * angles.hip.sin(),
            z: -self.knee_to_foot * angles.knee.sin() - self.foot_to_tip * outer.sin() + self.knee_z_offset,
        }
    }
}

/// Where a leg's hip sits on the body
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub x: f64,
    pub y: f64,
    /// Left-side legs face the other way
    pub rotated: bool,
}

impl Mount {
    /// Mount of the leg whose hip servo has the given id
    pub fn for_hip(hip_id: u8) -> Self {
        let (x, y, rotated) = match hip_id {
            1 => (HIP_OFFSET_X, HIP_SPACING_Y, false),
            4 => (-HIP_OFFSET_X, HIP_SPACING_Y, true),
            7 => (HIP_OFFSET_X, 0.0, false),
            10 => (-HIP_OFFSET_X, 0.0, true),
            13 => (HIP_OFFSET_X, -HIP_SPACING_Y, false),
            16 => (-HIP_OFFSET_X, -HIP_SPACING_Y, true),
            _ => (0.0, 0.0, false),
        };
        Self { x, y, rotated }
    }
}

/// Body-frame point to leg-frame point
pub fn local_point(point: Point, mount: &Mount) -> Point {
    if mount.rotated {
        Point::new(mount.x - point.x, mount.y - point.y, point.z)
    } else {
        Point::new(point.x - mount.x, point.y - mount.y, point.z)
    }
}

/// Leg-frame point to body-frame point
pub fn global_point(point: Point, mount: &Mount) -> Point {
    if mount.rotated {
        Point::new(mount.x - point.x, mount.y - point.y, point.z)
    } else {
        Point::new(point.x + mount.x, point.y + mount.y, point.z)
    }
}
