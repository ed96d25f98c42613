//! Modular Monte Carlo pose estimation
//!
//! This crate provides a particle-filter pose estimator for a moving ground vehicle. The estimator fuses a
//! continuous stream of noisy motion estimates (a twist: forward and angular velocity with covariance) with
//! intermittent absolute-position fixes (GNSS) and publishes a best-estimate pose at a fixed rate. The filter is
//! "modular" in the sense that the stage that scores particles against an observation is decoupled from the
//! stage that owns and advances the particle population. Scoring happens on its own execution context, takes an
//! unknown amount of time, and hands back a weight vector tagged with the *generation* of the population it was
//! computed against. The owner then matches that vector back onto the current population, tracing each particle
//! through any resamples that happened in the meantime, before merging.
//!
//! This crate is primarily built off of the following dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the pose, vector and covariance types.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provides random number generation for process noise and resampling.
//! - [`serde`](https://crates.io/crates/serde): Provides (de)serialization of messages, configuration and replay records.
//!
//! ## Crate overview
//!
//! This crate is organized into several modules:
//! - [math]: Gaussian sampling from a shared seedable source, angle normalization and circular means.
//! - [particle]: The weighted particle, the generation-tagged population and the mean-state estimator.
//! - [resampler]: Retroactive (generation-matched) weighting and interval-triggered resampling.
//! - [predictor]: Owns the live population; initialization and the kinematic prediction tick.
//! - [corrector]: Correction sources. Currently the absolute-position (GNSS) corrector.
//! - [visualize]: Diagnostic markers: weight colour map and fix-quality markers.
//! - [messages]: Transport-agnostic message contracts exchanged between the stages.
//! - [config]: Static configuration of the whole estimator, loadable from JSON, YAML or TOML.
//! - [runtime]: Threaded actor runtime that serializes all population mutation on one thread.
//! - [sim]: Deterministic offline replay of recorded motion and fix streams.
//!
//! ## Coordinate and state definitions
//!
//! Poses are expressed in a local planar map frame (x east, y north, z up). Prediction is a planar unicycle
//! model: each particle moves along its own heading (yaw) with the observed forward velocity and turns with the
//! observed yaw rate. Roll and pitch are carried in the orientation but are not propagated. Headings are always
//! kept in the half-open interval $(-\pi, \pi]$.
//!
//! The point estimate of a population is the weighted arithmetic mean of the positions and the per-axis
//! weighted *circular* mean of roll, pitch and yaw, so that headings either side of $\pm\pi$ average correctly.

pub mod config;
pub mod corrector;
pub mod error;
pub mod math;
pub mod messages;
pub mod particle;
pub mod predictor;
pub mod resampler;
pub mod runtime;
pub mod sim;
pub mod visualize;

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use std::fmt::{self, Debug, Display};

pub use crate::config::FilterConfig;
pub use crate::error::{FilterError, Result};
pub use crate::particle::{Particle, Population};
pub use crate::predictor::{Predictor, TickOutcome, UpdateOutcome};
pub use crate::resampler::{ResamplingStrategy, RetroactiveResampler};

/// A rigid-body pose in the map frame: position in meters and orientation as a unit quaternion.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Position (x, y, z) in meters
    pub position: Vector3<f64>,
    /// Orientation of the body with respect to the map frame
    pub orientation: UnitQuaternion<f64>,
}
impl Default for Pose {
    fn default() -> Self {
        Pose {
            position: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
        }
    }
}
impl Debug for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roll, pitch, yaw) = self.orientation.euler_angles();
        f.debug_struct("Pose")
            .field(
                "position (m)",
                &format_args!(
                    "[{:.3}, {:.3}, {:.3}]",
                    self.position.x, self.position.y, self.position.z
                ),
            )
            .field(
                "attitude (roll, pitch, yaw in deg)",
                &format_args!(
                    "[{:.2}, {:.2}, {:.2}]",
                    roll.to_degrees(),
                    pitch.to_degrees(),
                    yaw.to_degrees()
                ),
            )
            .finish()
    }
}
impl Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roll, pitch, yaw) = self.orientation.euler_angles();
        write!(
            f,
            "Pose {{ x: {:.3} m, y: {:.3} m, z: {:.3} m, attitude: [{:.2} deg, {:.2} deg, {:.2} deg] }}",
            self.position.x,
            self.position.y,
            self.position.z,
            roll.to_degrees(),
            pitch.to_degrees(),
            yaw.to_degrees()
        )
    }
}
impl Pose {
    /// Create a pose from a position and an orientation
    pub fn new(position: Vector3<f64>, orientation: UnitQuaternion<f64>) -> Pose {
        Pose {
            position,
            orientation,
        }
    }
    /// Create a pose from explicit position components and roll, pitch and yaw angles
    ///
    /// # Arguments
    /// * `x`, `y`, `z` - Position in meters.
    /// * `roll`, `pitch`, `yaw` - Euler angles in radians (XYZ convention, as nalgebra).
    pub fn from_xyz_rpy(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Pose {
        Pose {
            position: Vector3::new(x, y, z),
            orientation: UnitQuaternion::from_euler_angles(roll, pitch, yaw),
        }
    }
    /// Roll, pitch and yaw in radians
    pub fn euler_angles(&self) -> (f64, f64, f64) {
        self.orientation.euler_angles()
    }
    /// Heading (yaw) in radians
    pub fn yaw(&self) -> f64 {
        self.orientation.euler_angles().2
    }
    /// Planar (x, y) distance to a point
    pub fn planar_distance_to(&self, point: &Vector3<f64>) -> f64 {
        let dx = self.position.x - point.x;
        let dy = self.position.y - point.y;
        dx.hypot(dy)
    }
    /// The pose as a rigid transform from the body frame into the map frame
    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.orientation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_pose_default_is_identity() {
        let pose = Pose::default();
        assert_eq!(pose.position, Vector3::zeros());
        assert_eq!(pose.orientation, UnitQuaternion::identity());
        assert_approx_eq!(pose.yaw(), 0.0);
    }
    #[test]
    fn test_pose_from_xyz_rpy() {
        let pose = Pose::from_xyz_rpy(1.0, 2.0, 3.0, 0.0, 0.0, PI / 2.0);
        assert_approx_eq!(pose.position.x, 1.0);
        assert_approx_eq!(pose.position.y, 2.0);
        assert_approx_eq!(pose.position.z, 3.0);
        assert_approx_eq!(pose.yaw(), PI / 2.0, 1e-12);
    }
    #[test]
    fn test_planar_distance_ignores_height() {
        let pose = Pose::from_xyz_rpy(3.0, 4.0, 100.0, 0.0, 0.0, 0.0);
        assert_approx_eq!(pose.planar_distance_to(&Vector3::zeros()), 5.0);
    }
    #[test]
    fn test_to_isometry() {
        let pose = Pose::from_xyz_rpy(1.0, 0.0, 0.0, 0.0, 0.0, PI / 2.0);
        let iso = pose.to_isometry();
        // a point one meter ahead of the body lands one meter "north" of the body origin
        let p = iso.transform_point(&nalgebra::Point3::new(1.0, 0.0, 0.0));
        assert_approx_eq!(p.x, 1.0, 1e-12);
        assert_approx_eq!(p.y, 1.0, 1e-12);
    }
    #[test]
    fn test_display() {
        let text = format!("{}", Pose::from_xyz_rpy(1.0, 2.0, 0.0, 0.0, 0.0, 0.0));
        assert!(text.starts_with("Pose { x: 1.000 m, y: 2.000 m"));
    }
}
