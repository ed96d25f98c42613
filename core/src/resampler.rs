//! Retroactive weighting and interval-triggered resampling.
//!
//! Weight updates are produced by correctors that run on their own schedule. By the time an update for
//! generation `g` arrives, the predictor may already be at generation `c > g`, and one or more resamples may
//! have redrawn the population in between. The [`RetroactiveResampler`] therefore keeps, for every resample it
//! performs, the parent index of each newly drawn particle. Merging an update walks each current particle back
//! through those maps to the particle it descends from in generation `g` and multiplies in that particle's
//! weight.
use crate::config::ResamplingConfig;
use crate::messages::WeightedUpdate;
use crate::particle::{Particle, Population};

use log::{debug, info, warn};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Method used to draw the new population from the normalized weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingStrategy {
    /// Low-variance sampling: one uniform offset and N evenly spaced pointers
    #[default]
    Systematic,
    /// N independent draws from the cumulative distribution
    Multinomial,
    /// Deterministic copies of ⌊N·wᵢ⌋ followed by systematic sampling of the residuals
    Residual,
}
impl ResamplingStrategy {
    /// Draw N parent indices from weights that sum to one.
    pub fn draw_indices<R: Rng + ?Sized>(&self, weights: &[f64], rng: &mut R) -> Vec<usize> {
        match self {
            ResamplingStrategy::Systematic => systematic_indices(weights, rng),
            ResamplingStrategy::Multinomial => multinomial_indices(weights, rng),
            ResamplingStrategy::Residual => residual_indices(weights, rng),
        }
    }
}

fn cumulative(weights: &[f64]) -> Vec<f64> {
    let mut cumsum = Vec::with_capacity(weights.len());
    let mut running = 0.0;
    for w in weights {
        running += w;
        cumsum.push(running);
    }
    cumsum
}

fn systematic_indices<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    let n = weights.len();
    let cumsum = cumulative(weights);
    let total = cumsum.last().copied().unwrap_or(0.0);
    let step = total / n as f64;
    let offset = rng.random::<f64>() * step;
    let mut indices = Vec::with_capacity(n);
    let mut i = 0;
    for k in 0..n {
        let pointer = offset + k as f64 * step;
        while i < n - 1 && pointer >= cumsum[i] {
            i += 1;
        }
        indices.push(i);
    }
    indices
}

fn multinomial_indices<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    let n = weights.len();
    let cumsum = cumulative(weights);
    let total = cumsum.last().copied().unwrap_or(0.0);
    (0..n)
        .map(|_| {
            let u = rng.random::<f64>() * total;
            cumsum.partition_point(|&c| c <= u).min(n - 1)
        })
        .collect()
}

fn residual_indices<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> Vec<usize> {
    let n = weights.len();
    let mut indices = Vec::with_capacity(n);
    let mut residual: Vec<f64> = vec![0.0; n];
    for (i, &w) in weights.iter().enumerate() {
        let copies = (w * n as f64).floor() as usize;
        residual[i] = w * n as f64 - copies as f64;
        for _ in 0..copies {
            indices.push(i);
        }
    }
    indices.truncate(n);
    let remaining = n - indices.len();
    if remaining > 0 {
        let sum_residual: f64 = residual.iter().sum();
        if sum_residual > 0.0 {
            let step = sum_residual / remaining as f64;
            let mut u = rng.random::<f64>() * step;
            let mut i = 0;
            let mut cumsum = residual[0];
            for _ in 0..remaining {
                while u >= cumsum && i < n - 1 {
                    i += 1;
                    cumsum += residual[i];
                }
                indices.push(i);
                u += step;
            }
        } else {
            indices.extend((0..remaining).map(|_| rng.random_range(0..n)));
        }
    }
    indices
}

/// Parent indices recorded by one resample: particle `k` of generation `generation_id` was drawn from particle
/// `parents[k]` of generation `generation_id - 1`.
#[derive(Clone, Debug)]
struct ResampleRecord {
    generation_id: u64,
    parents: Vec<usize>,
}

/// Merges generation-tagged weight updates into the current population and resamples it on a fixed interval.
///
/// One resampler belongs to one epoch: the predictor creates a fresh one on every (re)initialization.
#[derive(Debug)]
pub struct RetroactiveResampler {
    resampling_interval: f64,
    num_particles: usize,
    retention_horizon: u64,
    epoch: u32,
    strategy: ResamplingStrategy,
    last_resampling_time: f64,
    history: VecDeque<ResampleRecord>,
    rng: StdRng,
}
impl RetroactiveResampler {
    /// Create a resampler for one epoch
    ///
    /// # Arguments
    /// * `config` - Resampling interval, strategy and retention horizon.
    /// * `num_particles` - Population size N; updates of any other length are rejected.
    /// * `epoch` - The epoch of the populations this resampler will see.
    /// * `created_at` - Creation time in seconds; the first resample is due one interval after it.
    /// * `rng` - Generator for the resampling draws.
    pub fn new(
        config: &ResamplingConfig,
        num_particles: usize,
        epoch: u32,
        created_at: f64,
        rng: StdRng,
    ) -> RetroactiveResampler {
        RetroactiveResampler {
            resampling_interval: config.resampling_interval,
            num_particles,
            retention_horizon: config.retention_horizon,
            epoch,
            strategy: config.strategy,
            last_resampling_time: created_at,
            history: VecDeque::new(),
            rng,
        }
    }
    pub fn epoch(&self) -> u32 {
        self.epoch
    }
    pub fn last_resampling_time(&self) -> f64 {
        self.last_resampling_time
    }
    pub fn strategy(&self) -> ResamplingStrategy {
        self.strategy
    }
    /// Merge a weight update scored against some earlier (or the current) generation
    ///
    /// Returns `None` and leaves nothing changed when the update belongs to another epoch, names a generation
    /// newer than `current` or older than the retention horizon, or has the wrong length. Otherwise returns a
    /// copy of `current` with each weight multiplied by the update weight of its ancestor in the scored
    /// generation. Non-finite or negative update weights are treated as zero.
    pub fn retroactive_weighting(
        &self,
        current: &Population,
        update: &WeightedUpdate,
    ) -> Option<Population> {
        if update.epoch != self.epoch || current.epoch != self.epoch {
            debug!(
                "Dropping update from {} for epoch {} (current epoch {})",
                update.source, update.epoch, self.epoch
            );
            return None;
        }
        if update.generation_id > current.generation_id {
            debug!(
                "Dropping update from {} for future generation {} (current {})",
                update.source, update.generation_id, current.generation_id
            );
            return None;
        }
        if current.generation_id - update.generation_id > self.retention_horizon {
            debug!(
                "Dropping update from {} for generation {}: older than the retention horizon of {} (current {})",
                update.source, update.generation_id, self.retention_horizon, current.generation_id
            );
            return None;
        }
        if update.weights.len() != self.num_particles || current.len() != self.num_particles {
            debug!(
                "Dropping update from {} with {} weights for {} particles",
                update.source,
                update.weights.len(),
                self.num_particles
            );
            return None;
        }
        let ancestors = self.ancestor_indices(update.generation_id, current.generation_id);
        let mut merged = current.clone();
        for (particle, &ancestor) in merged.particles.iter_mut().zip(ancestors.iter()) {
            let u = update.weights[ancestor];
            particle.weight *= if u.is_finite() && u >= 0.0 { u } else { 0.0 };
        }
        Some(merged)
    }
    /// For each particle of generation `current`, the index of its ancestor in generation `scored`.
    fn ancestor_indices(&self, scored: u64, current: u64) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.num_particles).collect();
        for record in self
            .history
            .iter()
            .rev()
            .filter(|r| r.generation_id > scored && r.generation_id <= current)
        {
            for index in indices.iter_mut() {
                *index = record.parents[*index];
            }
        }
        indices
    }
    /// Resample `current` if at least one interval has passed since the last resample
    ///
    /// The new population has the same size, every weight set to `1/N`, and generation id
    /// `current.generation_id + 1`. When the weight sum is zero or non-finite, particles are drawn uniformly at
    /// random instead. Returns `None` when no resample is due.
    pub fn resampling(&mut self, current: &Population) -> Option<Population> {
        let elapsed = current.timestamp - self.last_resampling_time;
        if !(elapsed >= self.resampling_interval) {
            return None;
        }
        let n = current.len();
        if n == 0 {
            return None;
        }
        let sum: f64 = current.particles.iter().map(|p| p.weight).sum();
        let parents: Vec<usize> = if n == 1 {
            vec![0]
        } else if sum > 0.0 && sum.is_finite() {
            let weights: Vec<f64> = current.particles.iter().map(|p| p.weight / sum).collect();
            self.strategy.draw_indices(&weights, &mut self.rng)
        } else {
            warn!("Degenerate weight sum ({sum}) at resampling; drawing particles uniformly");
            (0..n).map(|_| self.rng.random_range(0..n)).collect()
        };
        let uniform = 1.0 / n as f64;
        let particles: Vec<Particle> = parents
            .iter()
            .map(|&parent| Particle::new(current.particles[parent].pose, uniform))
            .collect();
        let generation_id = current.generation_id + 1;
        self.history.push_back(ResampleRecord {
            generation_id,
            parents,
        });
        while let Some(oldest) = self.history.front() {
            if generation_id.saturating_sub(oldest.generation_id) > self.retention_horizon {
                self.history.pop_front();
            } else {
                break;
            }
        }
        self.last_resampling_time = current.timestamp;
        info!(
            "Resampled {} particles at t = {:.3} s: generation {} -> {}",
            n, current.timestamp, current.generation_id, generation_id
        );
        Some(Population::new(
            self.epoch,
            generation_id,
            current.timestamp,
            particles,
        ))
    }
    /// Number of resample records currently retained
    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Pose;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;

    fn population(n: usize, generation_id: u64, timestamp: f64, weights: &[f64]) -> Population {
        let particles = (0..n)
            .map(|i| Particle::new(Pose::from_xyz_rpy(i as f64, 0.0, 0.0, 0.0, 0.0, 0.0), weights[i]))
            .collect();
        Population::new(1, generation_id, timestamp, particles)
    }
    fn resampler(n: usize, interval: f64, horizon: u64, strategy: ResamplingStrategy) -> RetroactiveResampler {
        let config = ResamplingConfig {
            resampling_interval: interval,
            strategy,
            retention_horizon: horizon,
        };
        RetroactiveResampler::new(&config, n, 1, 0.0, StdRng::seed_from_u64(1234))
    }
    fn update(generation_id: u64, weights: Vec<f64>) -> WeightedUpdate {
        WeightedUpdate {
            epoch: 1,
            generation_id,
            weights,
            source: "test".to_string(),
        }
    }

    #[test]
    fn test_retroactive_same_generation_is_multiplication() {
        let r = resampler(4, 1.0, 10, ResamplingStrategy::Systematic);
        let current = population(4, 5, 0.1, &[1.0, 0.5, 2.0, 0.25]);
        let u = update(5, vec![0.1, 0.2, 0.3, 0.4]);
        let merged = r.retroactive_weighting(&current, &u).unwrap();
        assert_eq!(merged.generation_id, 5);
        for i in 0..4 {
            assert_approx_eq!(merged.particles[i].weight, current.particles[i].weight * u.weights[i]);
            assert_eq!(merged.particles[i].pose, current.particles[i].pose);
        }
    }
    #[test]
    fn test_retroactive_older_generation_without_resample() {
        let r = resampler(3, 1.0, 10, ResamplingStrategy::Systematic);
        let current = population(3, 8, 0.1, &[1.0, 1.0, 1.0]);
        let merged = r
            .retroactive_weighting(&current, &update(4, vec![0.2, 0.3, 0.5]))
            .unwrap();
        assert_eq!(merged.weights(), vec![0.2, 0.3, 0.5]);
    }
    #[test]
    fn test_retroactive_outside_horizon_is_dropped() {
        let r = resampler(3, 1.0, 10, ResamplingStrategy::Systematic);
        let current = population(3, 20, 0.1, &[1.0, 2.0, 3.0]);
        let before = current.clone();
        assert!(r.retroactive_weighting(&current, &update(9, vec![1.0; 3])).is_none());
        assert_eq!(current, before);
        // exactly at the horizon is still accepted
        assert!(r.retroactive_weighting(&current, &update(10, vec![1.0; 3])).is_some());
    }
    #[test]
    fn test_retroactive_rejects_future_epoch_and_length() {
        let r = resampler(3, 1.0, 10, ResamplingStrategy::Systematic);
        let current = population(3, 5, 0.1, &[1.0; 3]);
        assert!(r.retroactive_weighting(&current, &update(6, vec![1.0; 3])).is_none());
        assert!(r.retroactive_weighting(&current, &update(5, vec![1.0; 2])).is_none());
        let mut old_epoch = update(5, vec![1.0; 3]);
        old_epoch.epoch = 0;
        assert!(r.retroactive_weighting(&current, &old_epoch).is_none());
    }
    #[test]
    fn test_retroactive_traces_through_resample() {
        let mut r = resampler(4, 0.0, 10, ResamplingStrategy::Systematic);
        // all weight on particle 2: every resampled particle descends from it
        let scored = population(4, 3, 1.0, &[0.0, 0.0, 1.0, 0.0]);
        let resampled = r.resampling(&scored).unwrap();
        assert_eq!(resampled.generation_id, 4);
        for p in &resampled.particles {
            assert_approx_eq!(p.pose.position.x, 2.0);
        }
        let mut current = resampled.clone();
        current.generation_id = 6;
        let merged = r
            .retroactive_weighting(&current, &update(3, vec![0.1, 0.2, 0.7, 0.4]))
            .unwrap();
        for p in &merged.particles {
            assert_approx_eq!(p.weight, 0.25 * 0.7);
        }
        // scoring the resampled generation itself needs no tracing
        let direct = r
            .retroactive_weighting(&current, &update(4, vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        assert_approx_eq!(direct.particles[3].weight, 0.25 * 4.0);
    }
    #[test]
    fn test_resampling_not_due() {
        let mut r = resampler(4, 1.0, 10, ResamplingStrategy::Systematic);
        let current = population(4, 10, 0.5, &[1.0; 4]);
        assert!(r.resampling(&current).is_none());
        assert_eq!(r.history_len(), 0);
        let due = population(4, 11, 1.0, &[1.0; 4]);
        assert!(r.resampling(&due).is_some());
        assert_eq!(r.last_resampling_time(), 1.0);
        let too_soon = population(4, 12, 1.5, &[1.0; 4]);
        assert!(r.resampling(&too_soon).is_none());
    }
    #[test]
    fn test_resampling_output_shape() {
        for strategy in [
            ResamplingStrategy::Systematic,
            ResamplingStrategy::Multinomial,
            ResamplingStrategy::Residual,
        ] {
            let mut r = resampler(5, 0.0, 10, strategy);
            let current = population(5, 2, 0.0, &[0.1, 0.4, 0.2, 0.2, 0.1]);
            let resampled = r.resampling(&current).unwrap();
            assert_eq!(resampled.len(), 5);
            assert_eq!(resampled.generation_id, 3);
            assert_eq!(resampled.epoch, 1);
            for p in &resampled.particles {
                assert_approx_eq!(p.weight, 0.2);
            }
        }
    }
    #[test]
    fn test_resampling_single_particle() {
        let mut r = resampler(1, 0.0, 10, ResamplingStrategy::Systematic);
        let current = population(1, 7, 2.0, &[0.3]);
        let resampled = r.resampling(&current).unwrap();
        assert_eq!(resampled.len(), 1);
        assert_eq!(resampled.generation_id, 8);
        assert_eq!(resampled.particles[0].weight, 1.0);
        assert_eq!(resampled.particles[0].pose, current.particles[0].pose);
    }
    #[test]
    fn test_resampling_degenerate_weights() {
        for weights in [vec![0.0; 6], vec![f64::NAN; 6], vec![f64::INFINITY, 1.0, 1.0, 1.0, 1.0, 1.0]] {
            let mut r = resampler(6, 0.0, 10, ResamplingStrategy::Systematic);
            let current = population(6, 0, 0.0, &weights);
            let resampled = r.resampling(&current).unwrap();
            assert_eq!(resampled.len(), 6);
            for p in &resampled.particles {
                assert!((p.weight - 1.0 / 6.0).abs() < 1e-12);
            }
        }
    }
    #[test]
    fn test_systematic_counts_follow_weights() {
        let mut rng = StdRng::seed_from_u64(99);
        let weights = [0.5, 0.25, 0.125, 0.125];
        let indices = ResamplingStrategy::Systematic.draw_indices(&weights, &mut rng);
        let mut counts = [0usize; 4];
        for i in indices {
            counts[i] += 1;
        }
        // the pointers are spaced 1/4 apart, so the first two categories are reproduced exactly
        assert_eq!(counts[0], 2);
        assert_eq!(counts[1], 1);
        assert_eq!(counts[2] + counts[3], 1);
    }
    #[test]
    fn test_resampling_chi_square() {
        // 3 categories, 2 degrees of freedom: P(chi2 > 13.8) = 0.001
        let weights = [0.2, 0.3, 0.5];
        let n = 3000;
        for strategy in [
            ResamplingStrategy::Systematic,
            ResamplingStrategy::Multinomial,
            ResamplingStrategy::Residual,
        ] {
            let mut rng = StdRng::seed_from_u64(2024);
            let mut expanded = Vec::with_capacity(n);
            for i in 0..n {
                expanded.push(weights[i % 3] / (n as f64 / 3.0));
            }
            let indices = strategy.draw_indices(&expanded, &mut rng);
            assert_eq!(indices.len(), n);
            let mut counts = [0.0f64; 3];
            for i in indices {
                counts[i % 3] += 1.0;
            }
            let chi2: f64 = counts
                .iter()
                .zip(weights.iter())
                .map(|(&observed, &w)| {
                    let expected = w * n as f64;
                    (observed - expected).powi(2) / expected
                })
                .sum();
            assert!(chi2 < 13.8, "{strategy:?}: chi2 = {chi2}, counts = {counts:?}");
        }
    }
    #[test]
    fn test_equal_weight_resampling_preserves_distribution() {
        // particles labelled by x in {0, 1, 2}, in proportions 0.2 / 0.3 / 0.5
        let proportions = [0.2, 0.3, 0.5];
        let labels: Vec<usize> = [(0, 6), (1, 9), (2, 15)]
            .iter()
            .flat_map(|&(label, count)| std::iter::repeat_n(label, count))
            .collect();
        let n = labels.len();
        let particles = labels
            .iter()
            .map(|&label| {
                Particle::new(Pose::from_xyz_rpy(label as f64, 0.0, 0.0, 0.0, 0.0, 0.0), 1.0 / n as f64)
            })
            .collect();
        let input = Population::new(1, 0, 0.0, particles);
        let trials = 200;
        for strategy in [
            ResamplingStrategy::Systematic,
            ResamplingStrategy::Multinomial,
            ResamplingStrategy::Residual,
        ] {
            let mut r = resampler(n, 0.0, 1000, strategy);
            let mut counts = [0.0f64; 3];
            for _ in 0..trials {
                let output = r.resampling(&input).unwrap();
                assert_eq!(output.len(), n);
                for particle in &output.particles {
                    assert_approx_eq!(particle.weight, 1.0 / n as f64, 1e-15);
                    counts[particle.pose.position.x.round() as usize] += 1.0;
                }
            }
            let total = (trials * n) as f64;
            let chi2: f64 = counts
                .iter()
                .zip(proportions.iter())
                .map(|(&observed, &p)| {
                    let expected = p * total;
                    (observed - expected).powi(2) / expected
                })
                .sum();
            assert!(chi2 < 13.8, "{strategy:?}: chi2 = {chi2}, counts = {counts:?}");
        }
    }
    #[test]
    fn test_history_is_pruned_to_horizon() {
        let mut r = resampler(2, 0.0, 3, ResamplingStrategy::Systematic);
        let mut current = population(2, 0, 0.0, &[1.0, 1.0]);
        for _ in 0..10 {
            current = r.resampling(&current).unwrap();
            current.generation_id += 1;
        }
        assert!(r.history_len() <= 2);
    }
}
