//! Weighted particles, generation-tagged populations and the mean-state estimator.
use crate::Pose;
use crate::math::circular_mean;

use log::warn;
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

/// A single pose hypothesis and its (unnormalized) importance weight.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub pose: Pose,
    pub weight: f64,
}
impl Default for Particle {
    fn default() -> Self {
        Particle {
            pose: Pose::default(),
            weight: 1.0,
        }
    }
}
impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roll, pitch, yaw) = self.pose.euler_angles();
        f.debug_struct("Particle")
            .field("x", &self.pose.position.x)
            .field("y", &self.pose.position.y)
            .field("z", &self.pose.position.z)
            .field("roll", &roll)
            .field("pitch", &pitch)
            .field("yaw", &yaw)
            .field("weight", &self.weight)
            .finish()
    }
}
impl Particle {
    pub fn new(pose: Pose, weight: f64) -> Particle {
        Particle { pose, weight }
    }
}

/// An ordered, fixed-size set of particles tagged with the generation that produced it.
///
/// The index of a particle identifies the same lineage from one generation to the next until a resample
/// redraws the set. Prediction ticks never reorder the vector, which is what allows a weight vector scored
/// against an older generation to be mapped back onto the current one.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Population {
    /// Number of (re)initializations that preceded this population. Generation ids restart at zero on each one.
    pub epoch: u32,
    /// Monotonically increasing within an epoch. Advanced by every tick and every resample.
    pub generation_id: u64,
    /// Time of the last state change in seconds
    pub timestamp: f64,
    pub particles: Vec<Particle>,
}
impl Debug for Population {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        let mean = self.mean_pose();
        f.debug_struct("Population")
            .field("epoch", &self.epoch)
            .field("generation_id", &self.generation_id)
            .field("timestamp", &self.timestamp)
            .field("num_particles", &self.particles.len())
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field(
                "mean_position",
                &format_args!(
                    "({:.3}, {:.3}, {:.3}) m",
                    mean.position.x, mean.position.y, mean.position.z
                ),
            )
            .field("mean_yaw (deg)", &format_args!("{:.2}", mean.yaw().to_degrees()))
            .finish()
    }
}
impl Population {
    pub fn new(epoch: u32, generation_id: u64, timestamp: f64, particles: Vec<Particle>) -> Population {
        Population {
            epoch,
            generation_id,
            timestamp,
            particles,
        }
    }
    pub fn len(&self) -> usize {
        self.particles.len()
    }
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
    pub fn weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.weight).collect()
    }
    /// Weights scaled to sum to one, falling back to uniform when the sum is zero or non-finite.
    pub fn sum_normalized_weights(&self) -> Vec<f64> {
        let n = self.particles.len();
        let sum: f64 = self.particles.iter().map(|p| p.weight).sum();
        if sum > 0.0 && sum.is_finite() {
            self.particles.iter().map(|p| p.weight / sum).collect()
        } else {
            vec![1.0 / n as f64; n]
        }
    }
    /// Weights as used by the mean-state estimator
    ///
    /// The raw weights are first min–max normalized onto [0, 1] (uniform `1/N` when every weight is equal),
    /// then renormalized to sum to one. A degenerate sum falls back to uniform with a warning. Note that the
    /// min–max step gives the lowest-weighted particle zero influence on the estimate.
    pub fn estimator_weights(&self) -> Vec<f64> {
        let n = self.particles.len();
        if n == 0 {
            return Vec::new();
        }
        let uniform = vec![1.0 / n as f64; n];
        let (min_weight, max_weight) = self
            .particles
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.weight), hi.max(p.weight))
            });
        let range = max_weight - min_weight;
        let scaled: Vec<f64> = if !range.is_finite() {
            warn!(
                "Particle weights span a non-finite range [{min_weight}, {max_weight}]; using uniform weights"
            );
            return uniform;
        } else if range > 0.0 {
            self.particles
                .iter()
                .map(|p| (p.weight - min_weight) / range)
                .collect()
        } else {
            uniform.clone()
        };
        let sum: f64 = scaled.iter().sum();
        if !(sum > 0.0 && sum.is_finite()) {
            warn!("Degenerate particle weight sum ({sum}); using uniform weights");
            return uniform;
        }
        scaled.iter().map(|w| w / sum).collect()
    }
    /// The mean-state estimate of the population
    ///
    /// Position is the weighted arithmetic mean and orientation is assembled from the per-axis weighted
    /// circular means of roll, pitch and yaw, using [`Population::estimator_weights`]. Deterministic and never
    /// fails; an empty population yields the default pose.
    pub fn mean_pose(&self) -> Pose {
        if self.particles.is_empty() {
            return Pose::default();
        }
        let weights = self.estimator_weights();
        let position = self
            .particles
            .iter()
            .zip(weights.iter())
            .fold(Vector3::zeros(), |acc, (p, w)| acc + p.pose.position * *w);
        let n = self.particles.len();
        let mut rolls = Vec::with_capacity(n);
        let mut pitches = Vec::with_capacity(n);
        let mut yaws = Vec::with_capacity(n);
        for particle in &self.particles {
            let (roll, pitch, yaw) = particle.pose.euler_angles();
            rolls.push(roll);
            pitches.push(pitch);
            yaws.push(yaw);
        }
        let orientation = UnitQuaternion::from_euler_angles(
            circular_mean(&rolls, &weights),
            circular_mean(&pitches, &weights),
            circular_mean(&yaws, &weights),
        );
        Pose::new(position, orientation)
    }
    /// Effective sample size `1 / Σ wᵢ²` of the sum-normalized weights
    pub fn effective_sample_size(&self) -> f64 {
        let sum_of_squares: f64 = self
            .sum_normalized_weights()
            .iter()
            .map(|w| w * w)
            .sum();
        if sum_of_squares > 0.0 {
            1.0 / sum_of_squares
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn population_from(poses: &[(f64, f64, f64)], weights: &[f64]) -> Population {
        let particles = poses
            .iter()
            .zip(weights.iter())
            .map(|(&(x, y, yaw), &w)| Particle::new(Pose::from_xyz_rpy(x, y, 0.0, 0.0, 0.0, yaw), w))
            .collect();
        Population::new(1, 0, 0.0, particles)
    }

    #[test]
    fn test_estimator_weights_sum_to_one() {
        let cases: Vec<Vec<f64>> = vec![
            vec![0.1, 0.5, 0.9, 3.0],
            vec![1.0, 1.0, 1.0],
            vec![0.0, 0.0, 0.0, 0.0],
            vec![1e-300, 2e-300, 5.0],
            vec![f64::NAN, 1.0, 2.0],
            vec![f64::INFINITY, 1.0],
            vec![7.0],
        ];
        for weights in cases {
            let poses = vec![(0.0, 0.0, 0.0); weights.len()];
            let population = population_from(&poses, &weights);
            let normalized = population.estimator_weights();
            assert_eq!(normalized.len(), weights.len());
            assert_approx_eq!(normalized.iter().sum::<f64>(), 1.0, 1e-9);
            assert!(normalized.iter().all(|w| w.is_finite() && *w >= 0.0));
        }
    }
    #[test]
    fn test_estimator_weights_equal_is_uniform() {
        let population = population_from(&[(0.0, 0.0, 0.0); 4], &[0.3; 4]);
        for w in population.estimator_weights() {
            assert_approx_eq!(w, 0.25);
        }
    }
    #[test]
    fn test_estimator_weights_min_max() {
        let population = population_from(&[(0.0, 0.0, 0.0); 3], &[1.0, 2.0, 3.0]);
        let weights = population.estimator_weights();
        assert_approx_eq!(weights[0], 0.0);
        assert_approx_eq!(weights[1], 1.0 / 3.0);
        assert_approx_eq!(weights[2], 2.0 / 3.0);
    }
    #[test]
    fn test_sum_normalized_weights() {
        let population = population_from(&[(0.0, 0.0, 0.0); 2], &[1.0, 3.0]);
        let weights = population.sum_normalized_weights();
        assert_approx_eq!(weights[0], 0.25);
        assert_approx_eq!(weights[1], 0.75);
        let degenerate = population_from(&[(0.0, 0.0, 0.0); 2], &[0.0, 0.0]);
        assert_eq!(degenerate.sum_normalized_weights(), vec![0.5, 0.5]);
    }
    #[test]
    fn test_mean_pose_position() {
        let population = population_from(
            &[(0.0, 0.0, 0.0), (2.0, 4.0, 0.0), (4.0, 8.0, 0.0)],
            &[1.0, 1.0, 1.0],
        );
        let mean = population.mean_pose();
        assert_approx_eq!(mean.position.x, 2.0);
        assert_approx_eq!(mean.position.y, 4.0);
        assert_approx_eq!(mean.position.z, 0.0);
    }
    #[test]
    fn test_mean_pose_weighted_position() {
        // min-max scaling maps [1, 2, 3] to [0, 0.5, 1] -> [0, 1/3, 2/3]
        let population = population_from(
            &[(0.0, 0.0, 0.0), (3.0, 0.0, 0.0), (6.0, 0.0, 0.0)],
            &[1.0, 2.0, 3.0],
        );
        assert_approx_eq!(population.mean_pose().position.x, 5.0, 1e-12);
    }
    #[test]
    fn test_mean_pose_heading_across_wrap() {
        let population = population_from(
            &[
                (0.0, 0.0, 170.0_f64.to_radians()),
                (0.0, 0.0, (-170.0_f64).to_radians()),
            ],
            &[1.0, 1.0],
        );
        let yaw = population.mean_pose().yaw();
        assert_approx_eq!(yaw.abs(), PI, 1e-6);
    }
    #[test]
    fn test_mean_pose_empty() {
        let population = Population::new(0, 0, 0.0, Vec::new());
        assert_eq!(population.mean_pose(), Pose::default());
        assert!(population.estimator_weights().is_empty());
    }
    #[test]
    fn test_effective_sample_size() {
        let uniform = population_from(&[(0.0, 0.0, 0.0); 4], &[1.0; 4]);
        assert_approx_eq!(uniform.effective_sample_size(), 4.0);
        let peaked = population_from(&[(0.0, 0.0, 0.0); 4], &[1.0, 0.0, 0.0, 0.0]);
        assert_approx_eq!(peaked.effective_sample_size(), 1.0);
    }
    #[test]
    fn test_debug_summary() {
        let population = population_from(&[(1.0, 2.0, 0.0); 3], &[1.0; 3]);
        let text = format!("{:?}", population);
        assert!(text.contains("num_particles: 3"));
        assert!(text.contains("generation_id: 0"));
    }
}
