//! Shared math utilities: Gaussian sampling, angle normalization and circular statistics.
//!
//! All stochastic parts of the estimator draw from random generators that are seeded from one process-wide
//! source. Seeding that source with [`seed_global_rng`] (or passing an explicit seed through the configuration)
//! makes a whole run reproducible.
use std::f64::consts::PI;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

static GLOBAL_RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();

fn global_rng() -> MutexGuard<'static, StdRng> {
    GLOBAL_RNG
        .get_or_init(|| Mutex::new(StdRng::seed_from_u64(rand::random())))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}
/// Reseed the process-wide random source.
pub fn seed_global_rng(seed: u64) {
    *global_rng() = StdRng::seed_from_u64(seed);
}
/// Create an independent generator, either from an explicit seed or from the process-wide source.
pub fn fork_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::seed_from_u64(global_rng().random()),
    }
}
/// Draw a zero-mean Gaussian sample with the given standard deviation from the process-wide source.
///
/// A non-positive or non-finite `sigma` yields exactly zero.
pub fn nrand(sigma: f64) -> f64 {
    sample_normal(sigma, &mut *global_rng())
}
/// Draw a zero-mean Gaussian sample with the given standard deviation from an explicit generator.
///
/// # Arguments
/// * `sigma` - Standard deviation. Non-positive or non-finite values yield exactly zero and consume no randomness.
/// * `rng` - The generator to draw from.
pub fn sample_normal<R: Rng + ?Sized>(sigma: f64, rng: &mut R) -> f64 {
    if !sigma.is_finite() || sigma <= 0.0 {
        return 0.0;
    }
    match Normal::new(0.0, sigma) {
        Ok(normal) => normal.sample(rng),
        Err(_) => 0.0,
    }
}
/// Wrap an angle to the half-open range $(-\pi, \pi]$ radians
///
/// Non-finite input is returned unchanged.
/// # Example
/// ```rust
/// use mpf::math::wrap_to_pi;
/// use std::f64::consts::PI;
/// assert_eq!(wrap_to_pi(-PI), PI);
/// assert_eq!(wrap_to_pi(0.5), 0.5);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    if !angle.is_finite() {
        return angle;
    }
    let mut wrapped = angle % (2.0 * PI);
    if wrapped > PI {
        wrapped -= 2.0 * PI;
    } else if wrapped <= -PI {
        wrapped += 2.0 * PI;
    }
    wrapped
}
/// Weighted circular mean of a set of angles in radians
///
/// Computed as `atan2(Σ wᵢ sin θᵢ, Σ wᵢ cos θᵢ)`. Angles and weights are paired positionally; extra entries in
/// the longer slice are ignored. The result lies in $[-\pi, \pi]$.
pub fn circular_mean(angles: &[f64], weights: &[f64]) -> f64 {
    let (sin_sum, cos_sum) = angles
        .iter()
        .zip(weights.iter())
        .fold((0.0, 0.0), |(s, c), (angle, weight)| {
            (s + weight * angle.sin(), c + weight * angle.cos())
        });
    sin_sum.atan2(cos_sum)
}
