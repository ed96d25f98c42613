//! The predictor owns the live particle population.
//!
//! It creates the population from an initial pose, advances it with a planar kinematic model on every tick, and
//! hands weight updates to its [`RetroactiveResampler`]. All mutation of the population goes through the
//! methods of [`Predictor`], so wrapping one predictor in a single execution context (see [`crate::runtime`])
//! is enough to serialize ticks, merges and resamples.
use crate::config::{
    FilterConfig, FixInitConfig, NoiseModel, OutputConfig, PredictionConfig, ResamplingConfig,
};
use crate::error::Result;
use crate::math::{fork_rng, sample_normal, wrap_to_pi};
use crate::messages::{
    GnssFix, InitialPose, MeanPose, PoseTransform, TwistWithCovariance, WeightedUpdate,
};
use crate::particle::{Particle, Population};
use crate::resampler::RetroactiveResampler;
use crate::Pose;

use log::{debug, info, warn};
use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Lifecycle of the population.
#[derive(Debug)]
pub enum FilterState {
    Uninitialized,
    Ready {
        population: Population,
        resampler: RetroactiveResampler,
    },
}

/// What happened on a prediction tick.
#[derive(Clone, Debug)]
pub enum TickOutcome {
    /// The population was advanced; the new population and its point estimate are attached.
    Predicted(Prediction),
    /// No initial pose has been received yet
    Uninitialized,
    /// No motion observation has been received yet
    AwaitingMotion,
    /// The tick time is earlier than the population timestamp; nothing changed
    NonMonotonicTime { dt: f64 },
}

/// Output of a successful tick.
#[derive(Clone, Debug)]
pub struct Prediction {
    pub population: Population,
    pub mean_pose: MeanPose,
    pub transform: PoseTransform,
}

/// What happened to a weighted update.
#[derive(Clone, Debug)]
pub enum UpdateOutcome {
    /// No initial pose has been received yet
    Uninitialized,
    /// The update did not match the current epoch, generation window or size and was dropped
    Stale { resampled: Option<Population> },
    /// The update was merged into the current population
    Merged { resampled: Option<Population> },
}
impl UpdateOutcome {
    /// The population produced by a resample triggered while handling the update, if any.
    pub fn resampled(&self) -> Option<&Population> {
        match self {
            UpdateOutcome::Uninitialized => None,
            UpdateOutcome::Stale { resampled } | UpdateOutcome::Merged { resampled } => resampled.as_ref(),
        }
    }
    pub fn is_merged(&self) -> bool {
        matches!(self, UpdateOutcome::Merged { .. })
    }
}

pub struct Predictor {
    prediction: PredictionConfig,
    resampling: ResamplingConfig,
    output: OutputConfig,
    fix_init: FixInitConfig,
    state: FilterState,
    motion: Option<TwistWithCovariance>,
    ground_height: Option<f64>,
    epoch: u32,
    rng: StdRng,
}
impl Predictor {
    /// Create an uninitialized predictor. Fails if the configuration does not validate.
    pub fn new(config: &FilterConfig) -> Result<Predictor> {
        config.validate()?;
        Ok(Predictor {
            prediction: config.prediction.clone(),
            resampling: config.resampling.clone(),
            output: config.output.clone(),
            fix_init: config.fix_init.clone(),
            state: FilterState::Uninitialized,
            motion: None,
            ground_height: None,
            epoch: 0,
            rng: fork_rng(config.seed),
        })
    }
    pub fn state(&self) -> &FilterState {
        &self.state
    }
    pub fn is_initialized(&self) -> bool {
        matches!(self.state, FilterState::Ready { .. })
    }
    pub fn population(&self) -> Option<&Population> {
        match &self.state {
            FilterState::Ready { population, .. } => Some(population),
            FilterState::Uninitialized => None,
        }
    }
    /// Number of initializations performed so far
    pub fn epoch(&self) -> u32 {
        self.epoch
    }
    pub fn num_particles(&self) -> usize {
        self.prediction.num_particles
    }
    pub fn motion(&self) -> Option<&TwistWithCovariance> {
        self.motion.as_ref()
    }
    /// Create a fresh population around an initial pose
    ///
    /// Each of the N particles gets independent Gaussian offsets on x, y and yaw with standard deviations taken
    /// from the covariance diagonal; z is copied, roll and pitch are zero and every weight is one. The epoch
    /// advances, the generation id restarts at zero, and a new resampler is created so that updates scored
    /// against the previous population are dropped.
    pub fn initialize(&mut self, initial_pose: &InitialPose) -> Population {
        let (sigma_x, sigma_y, sigma_yaw) = initial_pose.planar_sigmas();
        let center = initial_pose.pose.position;
        let yaw = initial_pose.pose.yaw();
        let particles: Vec<Particle> = (0..self.prediction.num_particles)
            .map(|_| {
                let position = Vector3::new(
                    center.x + sample_normal(sigma_x, &mut self.rng),
                    center.y + sample_normal(sigma_y, &mut self.rng),
                    center.z,
                );
                let heading = wrap_to_pi(yaw + sample_normal(sigma_yaw, &mut self.rng));
                Particle::new(
                    Pose::new(position, UnitQuaternion::from_euler_angles(0.0, 0.0, heading)),
                    1.0,
                )
            })
            .collect();
        self.epoch += 1;
        let population = Population::new(self.epoch, 0, initial_pose.timestamp, particles);
        let resampler = RetroactiveResampler::new(
            &self.resampling,
            self.prediction.num_particles,
            self.epoch,
            initial_pose.timestamp,
            StdRng::seed_from_u64(self.rng.random()),
        );
        info!(
            "Initialized {} particles around {} (epoch {})",
            self.prediction.num_particles, initial_pose.pose, self.epoch
        );
        self.state = FilterState::Ready {
            population: population.clone(),
            resampler,
        };
        population
    }
    /// Replace the reference ground height used when initializing from a fix
    pub fn set_ground_height(&mut self, height: f64) {
        self.ground_height = Some(height);
    }
    pub fn ground_height(&self) -> Option<f64> {
        self.ground_height
    }
    /// (Re)initialize around a GNSS fix
    ///
    /// The population is centred on the fix position with heading zero and spread by the configured
    /// `fix_init` variances. The height is the reference ground height when one has been received, and the fix
    /// height otherwise.
    pub fn initialize_from_fix(&mut self, fix: &GnssFix) -> Population {
        let z = self.ground_height.unwrap_or(fix.position.z);
        let initial_pose = InitialPose::planar(
            Pose::from_xyz_rpy(fix.position.x, fix.position.y, z, 0.0, 0.0, 0.0),
            self.fix_init.position_variance,
            self.fix_init.position_variance,
            self.fix_init.yaw_variance,
            fix.timestamp,
        );
        debug!("Initializing from {} fix at {:.3} s", fix.quality, fix.timestamp);
        self.initialize(&initial_pose)
    }
    /// Replace the latest motion observation
    pub fn set_motion(&mut self, twist: TwistWithCovariance) {
        self.motion = Some(twist);
    }
    /// Standard deviations of the forward-speed and yaw-rate noise for a motion observation
    pub fn motion_sigmas(&self, twist: &TwistWithCovariance) -> (f64, f64) {
        let (linear_variance, angular_variance) = match self.prediction.noise_model {
            NoiseModel::Dynamic => (twist.linear_variance(), twist.angular_variance()),
            NoiseModel::Static {
                linear_variance,
                angular_variance,
            } => (linear_variance, angular_variance),
        };
        let gain = self.prediction.motion_noise_gain;
        (
            gain * linear_variance.max(0.0).sqrt(),
            gain * angular_variance.max(0.0).sqrt(),
        )
    }
    /// Advance the population to time `now` (seconds)
    ///
    /// Every particle moves along its own heading with the observed forward speed and turns with the observed
    /// yaw rate, each perturbed by independent zero-mean Gaussian noise. Particle order is preserved and the
    /// generation id advances by one, including when `now` equals the population timestamp.
    pub fn tick(&mut self, now: f64) -> TickOutcome {
        let Some(twist) = self.motion.clone() else {
            return if self.is_initialized() {
                TickOutcome::AwaitingMotion
            } else {
                TickOutcome::Uninitialized
            };
        };
        let (sigma_v, sigma_w) = self.motion_sigmas(&twist);
        let FilterState::Ready { population, .. } = &mut self.state else {
            return TickOutcome::Uninitialized;
        };
        let dt = now - population.timestamp;
        if dt < 0.0 {
            warn!(
                "Skipping prediction: tick time {now:.3} s is before population time {:.3} s",
                population.timestamp
            );
            return TickOutcome::NonMonotonicTime { dt };
        }
        for particle in population.particles.iter_mut() {
            let (roll, pitch, yaw) = particle.pose.euler_angles();
            let v = twist.forward_velocity() + sample_normal(sigma_v, &mut self.rng);
            let w = twist.yaw_rate() + sample_normal(sigma_w, &mut self.rng);
            particle.pose.position.x += v * yaw.cos() * dt;
            particle.pose.position.y += v * yaw.sin() * dt;
            particle.pose.orientation =
                UnitQuaternion::from_euler_angles(roll, pitch, wrap_to_pi(yaw + w * dt));
        }
        population.generation_id += 1;
        population.timestamp = now;
        let population = population.clone();
        let mean_pose = MeanPose {
            pose: population.mean_pose(),
            timestamp: now,
        };
        let transform =
            PoseTransform::from_mean_pose(&mean_pose, &self.output.map_frame, &self.output.estimate_frame);
        TickOutcome::Predicted(Prediction {
            population,
            mean_pose,
            transform,
        })
    }
    /// Merge a weighted update and resample if an interval has elapsed
    ///
    /// Updates that do not match the current epoch, are outside the retention horizon, or have the wrong size
    /// are dropped. A resample is attempted either way; when it happens the resampled population replaces the
    /// current one and is returned in the outcome.
    pub fn on_weighted_update(&mut self, update: &WeightedUpdate) -> UpdateOutcome {
        let FilterState::Ready {
            population,
            resampler,
        } = &mut self.state
        else {
            debug!("Ignoring update from {}: not initialized", update.source);
            return UpdateOutcome::Uninitialized;
        };
        let merged = match resampler.retroactive_weighting(population, update) {
            Some(weighted) => {
                *population = weighted;
                true
            }
            None => false,
        };
        let resampled = resampler.resampling(population);
        if let Some(next) = &resampled {
            *population = next.clone();
        }
        if merged {
            UpdateOutcome::Merged { resampled }
        } else {
            UpdateOutcome::Stale { resampled }
        }
    }
    /// Point estimate of the current population
    pub fn mean_pose(&self) -> Option<MeanPose> {
        self.population().map(|population| MeanPose {
            pose: population.mean_pose(),
            timestamp: population.timestamp,
        })
    }
}
