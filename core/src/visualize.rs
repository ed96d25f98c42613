//! Diagnostic markers for operator display.
//!
//! Nothing in the estimation path depends on this module. Markers are plain data; turning them into draw calls
//! is left to whatever display is attached to the runtime output.
use crate::Pose;
use crate::messages::FixQuality;
use crate::particle::Particle;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rgba {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}
impl Rgba {
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Rgba {
        Rgba { r, g, b, a }
    }
}

/// Map a value in [0, 1] onto a blue → cyan → green → yellow → red colour ramp
///
/// Values outside the range are clamped. NaN maps to blue.
pub fn color_from_weight(value: f32) -> Rgba {
    let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
    let (mut r, mut g, mut b) = (1.0, 1.0, 1.0);
    if value < 0.25 {
        r = 0.0;
        g = 4.0 * value;
    } else if value < 0.5 {
        r = 0.0;
        b = 1.0 + 4.0 * (0.25 - value);
    } else if value < 0.75 {
        r = 4.0 * (value - 0.5);
        b = 0.0;
    } else {
        g = 1.0 + 4.0 * (0.75 - value);
        b = 0.0;
    }
    Rgba::new(r, g, b, 1.0)
}

/// One arrow per particle, coloured by its weight relative to the rest of the population.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleMarker {
    pub id: usize,
    pub pose: Pose,
    pub color: Rgba,
}

/// A fix position with likelihood contour radii (meters), coloured by solution quality.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixMarker {
    pub position: Vector3<f64>,
    pub quality: FixQuality,
    pub radii: Vec<f64>,
    pub color: Rgba,
}

/// Everything a corrector draws for one scored fix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrectionMarkers {
    pub frame_id: String,
    pub timestamp: f64,
    pub particles: Vec<ParticleMarker>,
    pub fix: FixMarker,
}

/// Markers for a set of particles with weights scaled onto [0, 1] by the population minimum and maximum.
///
/// The range is floored at 1e-7 so that a population of equal weights renders uniformly blue.
pub fn particle_markers(particles: &[Particle]) -> Vec<ParticleMarker> {
    let min = particles
        .iter()
        .map(|p| p.weight)
        .fold(f64::INFINITY, f64::min);
    let max = particles
        .iter()
        .map(|p| p.weight)
        .fold(f64::NEG_INFINITY, f64::max)
        .max(min + 1e-7);
    particles
        .iter()
        .enumerate()
        .map(|(id, p)| ParticleMarker {
            id,
            pose: p.pose,
            color: color_from_weight(((p.weight - min) / (max - min)) as f32),
        })
        .collect()
}

pub fn fix_color(quality: FixQuality) -> Rgba {
    match quality {
        FixQuality::RtkFixed => Rgba::new(0.0, 1.0, 0.0, 1.0),
        FixQuality::RtkFloat => Rgba::new(1.0, 1.0, 0.0, 1.0),
        FixQuality::Standalone => Rgba::new(1.0, 0.0, 0.0, 1.0),
    }
}

pub fn fix_marker(position: Vector3<f64>, quality: FixQuality, radii: Vec<f64>) -> FixMarker {
    FixMarker {
        position,
        quality,
        radii,
        color: fix_color(quality),
    }
}
