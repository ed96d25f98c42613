//! Message contracts exchanged between the estimator stages and its clients.
//!
//! These types are transport agnostic: the [`crate::runtime`] passes them over channels, the [`crate::sim`]
//! replay builds them from CSV records, and all of them are serde-serializable so that they can be logged or
//! bridged to another transport.
use crate::Pose;
pub use crate::particle::Population;

use nalgebra::{Isometry3, Matrix6, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Initialization request: a pose and its 6×6 covariance over (x, y, z, roll, pitch, yaw).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitialPose {
    pub pose: Pose,
    pub covariance: Matrix6<f64>,
    /// Time of the request in seconds
    pub timestamp: f64,
}
impl InitialPose {
    pub fn new(pose: Pose, covariance: Matrix6<f64>, timestamp: f64) -> InitialPose {
        InitialPose {
            pose,
            covariance,
            timestamp,
        }
    }
    /// Initial pose with only the planar (x, y, yaw) variances set
    pub fn planar(pose: Pose, x_variance: f64, y_variance: f64, yaw_variance: f64, timestamp: f64) -> InitialPose {
        let mut covariance = Matrix6::zeros();
        covariance[(0, 0)] = x_variance;
        covariance[(1, 1)] = y_variance;
        covariance[(5, 5)] = yaw_variance;
        InitialPose::new(pose, covariance, timestamp)
    }
    /// Standard deviations of the x, y and yaw components
    ///
    /// These are the diagonal entries 0, 7 and 35 of the row-major covariance. Negative variances are treated as zero.
    pub fn planar_sigmas(&self) -> (f64, f64, f64) {
        (
            self.covariance[(0, 0)].max(0.0).sqrt(),
            self.covariance[(1, 1)].max(0.0).sqrt(),
            self.covariance[(5, 5)].max(0.0).sqrt(),
        )
    }
}

/// Motion observation: body-frame linear and angular velocity with a 6×6 covariance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TwistWithCovariance {
    /// Linear velocity in m/s; `x` is the forward speed
    pub linear: Vector3<f64>,
    /// Angular velocity in rad/s; `z` is the yaw rate
    pub angular: Vector3<f64>,
    pub covariance: Matrix6<f64>,
    pub timestamp: f64,
}
impl TwistWithCovariance {
    /// Planar twist with the given forward-speed and yaw-rate variances
    pub fn planar(
        forward_velocity: f64,
        yaw_rate: f64,
        linear_variance: f64,
        angular_variance: f64,
        timestamp: f64,
    ) -> TwistWithCovariance {
        let mut covariance = Matrix6::zeros();
        covariance[(0, 0)] = linear_variance;
        covariance[(5, 5)] = angular_variance;
        TwistWithCovariance {
            linear: Vector3::new(forward_velocity, 0.0, 0.0),
            angular: Vector3::new(0.0, 0.0, yaw_rate),
            covariance,
            timestamp,
        }
    }
    pub fn forward_velocity(&self) -> f64 {
        self.linear.x
    }
    pub fn yaw_rate(&self) -> f64 {
        self.angular.z
    }
    /// Variance of the forward speed (covariance entry 0)
    pub fn linear_variance(&self) -> f64 {
        self.covariance[(0, 0)]
    }
    /// Variance of the yaw rate (covariance entry 35)
    pub fn angular_variance(&self) -> f64 {
        self.covariance[(5, 5)]
    }
}

/// Carrier-phase solution status of a GNSS fix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixQuality {
    RtkFixed,
    RtkFloat,
    #[default]
    Standalone,
}
impl FixQuality {
    pub fn is_rtk_fixed(&self) -> bool {
        matches!(self, FixQuality::RtkFixed)
    }
}
impl Display for FixQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FixQuality::RtkFixed => "rtk_fixed",
            FixQuality::RtkFloat => "rtk_float",
            FixQuality::Standalone => "standalone",
        };
        write!(f, "{s}")
    }
}

/// Absolute position fix in the map frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GnssFix {
    pub position: Vector3<f64>,
    pub quality: FixQuality,
    pub timestamp: f64,
}
impl GnssFix {
    pub fn new(position: Vector3<f64>, quality: FixQuality, timestamp: f64) -> GnssFix {
        GnssFix {
            position,
            quality,
            timestamp,
        }
    }
}

/// Per-particle weights computed by a corrector, tagged with the population they were scored against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightedUpdate {
    pub epoch: u32,
    pub generation_id: u64,
    /// One weight per particle, aligned with the indices of the scored generation
    pub weights: Vec<f64>,
    /// Name of the corrector that produced the update
    pub source: String,
}

/// The point estimate of the population.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeanPose {
    pub pose: Pose,
    pub timestamp: f64,
}

/// Rigid transform from `parent_frame` to `child_frame`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoseTransform {
    pub parent_frame: String,
    pub child_frame: String,
    pub isometry: Isometry3<f64>,
    pub timestamp: f64,
}
impl PoseTransform {
    pub fn from_mean_pose(mean: &MeanPose, parent_frame: &str, child_frame: &str) -> PoseTransform {
        PoseTransform {
            parent_frame: parent_frame.to_string(),
            child_frame: child_frame.to_string(),
            isometry: mean.pose.to_isometry(),
            timestamp: mean.timestamp,
        }
    }
}

/// Administrative request to enable or disable one correction source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectorSwitch {
    pub corrector: String,
    pub enabled: bool,
}

/// Acknowledgment of a [`CorrectorSwitch`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchAck {
    pub corrector: String,
    /// Whether a corrector with the requested name exists and was switched
    pub applied: bool,
    /// The state of the corrector after the request
    pub enabled: bool,
}
