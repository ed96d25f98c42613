//! Correction sources: turn an observation into per-particle importance weights.
//!
//! A corrector scores a population it has been handed (usually a recent prediction, not the live one) and
//! returns a [`WeightedUpdate`] tagged with that population's epoch and generation. It never mutates the
//! population; merging is the predictor's job.
use crate::config::GnssCorrectorConfig;
use crate::messages::{FixQuality, GnssFix, WeightedUpdate};
use crate::particle::{Particle, Population};
use crate::visualize::{CorrectionMarkers, fix_marker, particle_markers};

use log::{debug, info};
use nalgebra::Vector3;
use std::collections::VecDeque;

/// Common interface of every correction source.
pub trait Corrector: Send {
    /// Stable name used for logging and for the administrative switch
    fn name(&self) -> &str;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&mut self, enabled: bool);
    /// Score a population against the latest observation. `None` when disabled or when there is nothing to score.
    fn score(&mut self, population: &Population) -> Option<WeightedUpdate>;
}

/// Short history of predicted populations, used to find the one closest in time to an observation.
#[derive(Clone, Debug)]
pub struct PopulationBuffer {
    capacity: usize,
    populations: VecDeque<Population>,
}
impl PopulationBuffer {
    pub fn new(capacity: usize) -> PopulationBuffer {
        PopulationBuffer {
            capacity: capacity.max(1),
            populations: VecDeque::with_capacity(capacity.max(1)),
        }
    }
    /// Add a population. A population from a new epoch discards everything buffered before it.
    pub fn push(&mut self, population: Population) {
        if self
            .populations
            .back()
            .is_some_and(|last| last.epoch != population.epoch)
        {
            self.populations.clear();
        }
        if self.populations.len() == self.capacity {
            self.populations.pop_front();
        }
        self.populations.push_back(population);
    }
    pub fn len(&self) -> usize {
        self.populations.len()
    }
    pub fn is_empty(&self) -> bool {
        self.populations.is_empty()
    }
    pub fn clear(&mut self) {
        self.populations.clear();
    }
    pub fn latest(&self) -> Option<&Population> {
        self.populations.back()
    }
    /// The buffered population whose timestamp is closest to `timestamp`
    ///
    /// Returns `None` when the buffer is empty or when `timestamp` precedes the oldest buffered population by
    /// more than `max_lag` seconds.
    pub fn closest(&self, timestamp: f64, max_lag: f64) -> Option<&Population> {
        let oldest = self.populations.front()?;
        if oldest.timestamp - timestamp > max_lag {
            return None;
        }
        self.populations.iter().min_by(|a, b| {
            let da = (a.timestamp - timestamp).abs();
            let db = (b.timestamp - timestamp).abs();
            da.total_cmp(&db)
        })
    }
}

/// Absolute-position corrector for GNSS fixes.
///
/// The planar distance `d` from each particle to the fix is turned into a weight
/// `max(exp(-½ (max(0, d - r)/σ)²), w_min)`, where `r` is the flat radius and `σ` is the configured standard
/// deviation, widened by the float gain for any fix that is not RTK-fixed. The fix height is replaced by the
/// reference height before scoring; until a reference height has been received the corrector does nothing.
#[derive(Clone, Debug)]
pub struct GnssCorrector {
    config: GnssCorrectorConfig,
    enabled: bool,
    height: Option<f64>,
    latest_fix: Option<GnssFix>,
    last_markers: Option<CorrectionMarkers>,
    frame_id: String,
}
impl GnssCorrector {
    pub const NAME: &'static str = "gnss";

    pub fn new(config: &GnssCorrectorConfig) -> GnssCorrector {
        GnssCorrector {
            config: config.clone(),
            enabled: config.enabled,
            height: None,
            latest_fix: None,
            last_markers: None,
            frame_id: "map".to_string(),
        }
    }
    /// Frame id written into the diagnostic markers
    pub fn with_frame_id(mut self, frame_id: &str) -> GnssCorrector {
        self.frame_id = frame_id.to_string();
        self
    }
    pub fn config(&self) -> &GnssCorrectorConfig {
        &self.config
    }
    /// Replace the reference height
    pub fn set_height(&mut self, height: f64) {
        self.height = Some(height);
    }
    pub fn height(&self) -> Option<f64> {
        self.height
    }
    /// Replace the pending fix; it is consumed by the next successful [`Corrector::score`].
    pub fn set_fix(&mut self, fix: GnssFix) {
        self.latest_fix = Some(fix);
    }
    pub fn pending_fix(&self) -> Option<&GnssFix> {
        self.latest_fix.as_ref()
    }
    /// Markers drawn for the most recently scored fix
    pub fn markers(&self) -> Option<&CorrectionMarkers> {
        self.last_markers.as_ref()
    }
    /// Likelihood standard deviation for a fix of the given quality
    pub fn sigma_for(&self, quality: FixQuality) -> f64 {
        if self.config.rtk_enabled && quality.is_rtk_fixed() {
            self.config.likelihood_stdev
        } else {
            self.config.likelihood_stdev * self.config.float_range_gain
        }
    }
    /// Weight of a particle at planar distance `distance` from the fix
    pub fn weight_at(&self, distance: f64, sigma: f64) -> f64 {
        let excess = (distance - self.config.likelihood_flat_radius).max(0.0);
        let likelihood = (-0.5 * (excess / sigma).powi(2)).exp();
        likelihood.max(self.config.likelihood_min_weight)
    }
    /// Distance from the fix at which the likelihood falls to `probability`
    ///
    /// Probabilities at or below zero are unreachable and map to infinity; probabilities at or above one map to
    /// the flat radius.
    pub fn likelihood_radius(&self, probability: f64, quality: FixQuality) -> f64 {
        let flat = self.config.likelihood_flat_radius;
        if probability >= 1.0 {
            return flat;
        }
        if !(probability > 0.0) {
            return f64::INFINITY;
        }
        flat + self.sigma_for(quality) * (-2.0 * probability.ln()).sqrt()
    }
    /// Per-particle weights for a fix position
    pub fn weigh(&self, particles: &[Particle], position: &Vector3<f64>, sigma: f64) -> Vec<f64> {
        particles
            .iter()
            .map(|p| self.weight_at(p.pose.planar_distance_to(position), sigma))
            .collect()
    }
    /// Store a fix and score it against the buffered population closest to its timestamp
    pub fn on_fix(&mut self, fix: GnssFix, buffer: &PopulationBuffer) -> Option<WeightedUpdate> {
        let timestamp = fix.timestamp;
        self.set_fix(fix);
        let Some(population) = buffer.closest(timestamp, self.config.max_sync_lag) else {
            debug!("No buffered population within {} s of fix at {timestamp:.3} s", self.config.max_sync_lag);
            return None;
        };
        self.score(population)
    }
}
impl Corrector for GnssCorrector {
    fn name(&self) -> &str {
        GnssCorrector::NAME
    }
    fn is_enabled(&self) -> bool {
        self.enabled
    }
    fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            info!("GNSS corrector {}", if enabled { "enabled" } else { "disabled" });
        }
        self.enabled = enabled;
    }
    fn score(&mut self, population: &Population) -> Option<WeightedUpdate> {
        if !self.enabled || population.is_empty() {
            return None;
        }
        let Some(height) = self.height else {
            debug!("Skipping GNSS correction: no reference height yet");
            return None;
        };
        let fix = self.latest_fix.take()?;
        let position = Vector3::new(fix.position.x, fix.position.y, height);
        let sigma = self.sigma_for(fix.quality);
        let weights = self.weigh(&population.particles, &position, sigma);

        let weighted: Vec<Particle> = population
            .particles
            .iter()
            .zip(weights.iter())
            .map(|(p, &w)| Particle::new(p.pose, w))
            .collect();
        let radii = [0.9, 0.5, 0.1]
            .iter()
            .map(|&p| self.likelihood_radius(p, fix.quality))
            .collect();
        self.last_markers = Some(CorrectionMarkers {
            frame_id: self.frame_id.clone(),
            timestamp: fix.timestamp,
            particles: particle_markers(&weighted),
            fix: fix_marker(position, fix.quality, radii),
        });
        debug!(
            "Scored {} fix at {:.3} s against generation {} (sigma {:.2} m)",
            fix.quality, fix.timestamp, population.generation_id, sigma
        );
        Some(WeightedUpdate {
            epoch: population.epoch,
            generation_id: population.generation_id,
            weights,
            source: self.name().to_string(),
        })
    }
}
