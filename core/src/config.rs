//! Static configuration for the estimator
//!
//! The whole estimator is configured by one [`FilterConfig`] that can be written to and read from JSON, YAML or
//! TOML, selected by file extension. Every field has a default, so partial files are accepted:
//!
//! ```toml
//! seed = 7
//!
//! [prediction]
//! num_particles = 200
//!
//! [gnss]
//! rtk_enabled = false
//! ```
use crate::error::{FilterError, Result};
use crate::resampler::ResamplingStrategy;

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

/// Source of the standard deviations used for the prediction noise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NoiseModel {
    /// Use the variances carried by each motion observation
    #[default]
    Dynamic,
    /// Ignore the observation covariance and use fixed variances
    Static {
        linear_variance: f64,
        angular_variance: f64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Number of particles N
    pub num_particles: usize,
    /// Tick rate in Hz
    pub prediction_rate: f64,
    /// Multiplier applied to the motion standard deviations on every tick
    pub motion_noise_gain: f64,
    pub noise_model: NoiseModel,
}
impl Default for PredictionConfig {
    fn default() -> Self {
        PredictionConfig {
            num_particles: 500,
            prediction_rate: 50.0,
            motion_noise_gain: 4.0,
            noise_model: NoiseModel::Dynamic,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResamplingConfig {
    /// Minimum time between two resamples in seconds
    pub resampling_interval: f64,
    pub strategy: ResamplingStrategy,
    /// How many generations back a weighted update may have been scored and still be merged
    pub retention_horizon: u64,
}
impl Default for ResamplingConfig {
    fn default() -> Self {
        ResamplingConfig {
            resampling_interval: 1.0,
            strategy: ResamplingStrategy::Systematic,
            retention_horizon: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GnssCorrectorConfig {
    /// Likelihood standard deviation in meters for RTK-fixed solutions
    pub likelihood_stdev: f64,
    /// Multiplier on `likelihood_stdev` for any solution that is not RTK-fixed
    pub float_range_gain: f64,
    /// Distance in meters within which every particle gets full likelihood
    pub likelihood_flat_radius: f64,
    /// Floor applied to every per-particle weight
    pub likelihood_min_weight: f64,
    /// When false every fix is treated as a float solution
    pub rtk_enabled: bool,
    /// Number of recent predicted populations kept for matching against fix timestamps
    pub buffer_length: usize,
    /// Fixes older than the oldest buffered population by more than this (seconds) are ignored
    pub max_sync_lag: f64,
    /// Whether the corrector starts enabled
    pub enabled: bool,
}
impl Default for GnssCorrectorConfig {
    fn default() -> Self {
        GnssCorrectorConfig {
            likelihood_stdev: 5.0,
            float_range_gain: 5.0,
            likelihood_flat_radius: 1.0,
            likelihood_min_weight: 0.01,
            rtk_enabled: true,
            buffer_length: 100,
            max_sync_lag: 0.5,
            enabled: true,
        }
    }
}

/// Spread of a population initialized from a GNSS fix.
///
/// A single fix says nothing about heading, so the default yaw variance is wide enough that the wrapped
/// headings cover the whole circle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixInitConfig {
    /// Variance (m²) of the x and y offsets around the fix
    pub position_variance: f64,
    /// Variance (rad²) of the heading around zero
    pub yaw_variance: f64,
}
impl Default for FixInitConfig {
    fn default() -> Self {
        FixInitConfig {
            position_variance: 1.0,
            yaw_variance: 10.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Parent frame of the published transform
    pub map_frame: String,
    /// Child frame of the published transform
    pub estimate_frame: String,
    /// Capacity of the runtime output queue; outputs are dropped while it is full
    pub queue_capacity: usize,
}
impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            map_frame: "map".to_string(),
            estimate_frame: "mpf".to_string(),
            queue_capacity: 64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Simulated delay between a fix and the arrival of its weighted update at the predictor, in seconds
    pub fix_latency: f64,
}
impl Default for ReplayConfig {
    fn default() -> Self {
        ReplayConfig { fix_latency: 0.1 }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Seed for every random generator in the estimator. Unseeded runs draw from entropy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub prediction: PredictionConfig,
    pub resampling: ResamplingConfig,
    pub gnss: GnssCorrectorConfig,
    pub fix_init: FixInitConfig,
    pub output: OutputConfig,
    pub replay: ReplayConfig,
}
impl FilterConfig {
    /// Reject configurations the estimator cannot run with.
    pub fn validate(&self) -> Result<()> {
        let p = &self.prediction;
        if p.num_particles == 0 {
            return Err(FilterError::Config("num_particles must be at least 1".into()));
        }
        if !(p.prediction_rate.is_finite() && p.prediction_rate > 0.0) {
            return Err(FilterError::Config(format!(
                "prediction_rate must be positive, got {}",
                p.prediction_rate
            )));
        }
        match Duration::try_from_secs_f64(self.prediction_period()) {
            Ok(period) if !period.is_zero() => {}
            _ => {
                return Err(FilterError::Config(format!(
                    "prediction_rate {} Hz gives a tick period that cannot be scheduled",
                    p.prediction_rate
                )));
            }
        }
        if !(p.motion_noise_gain.is_finite() && p.motion_noise_gain >= 0.0) {
            return Err(FilterError::Config(format!(
                "motion_noise_gain must be non-negative, got {}",
                p.motion_noise_gain
            )));
        }
        if let NoiseModel::Static {
            linear_variance,
            angular_variance,
        } = p.noise_model
        {
            if !(linear_variance >= 0.0 && angular_variance >= 0.0) {
                return Err(FilterError::Config(
                    "static noise variances must be non-negative".into(),
                ));
            }
        }
        let r = &self.resampling;
        if !(r.resampling_interval.is_finite() && r.resampling_interval >= 0.0) {
            return Err(FilterError::Config(format!(
                "resampling_interval must be non-negative, got {}",
                r.resampling_interval
            )));
        }
        if r.retention_horizon == 0 {
            return Err(FilterError::Config("retention_horizon must be at least 1".into()));
        }
        let g = &self.gnss;
        if !(g.likelihood_stdev.is_finite() && g.likelihood_stdev > 0.0) {
            return Err(FilterError::Config(format!(
                "likelihood_stdev must be positive, got {}",
                g.likelihood_stdev
            )));
        }
        if !(g.float_range_gain.is_finite() && g.float_range_gain > 0.0) {
            return Err(FilterError::Config(format!(
                "float_range_gain must be positive, got {}",
                g.float_range_gain
            )));
        }
        if !(g.likelihood_flat_radius >= 0.0) || !(g.likelihood_min_weight >= 0.0) {
            return Err(FilterError::Config(
                "likelihood_flat_radius and likelihood_min_weight must be non-negative".into(),
            ));
        }
        if g.buffer_length == 0 {
            return Err(FilterError::Config("gnss buffer_length must be at least 1".into()));
        }
        if !(g.max_sync_lag >= 0.0) {
            return Err(FilterError::Config("max_sync_lag must be non-negative".into()));
        }
        let f = &self.fix_init;
        if !(f.position_variance.is_finite() && f.position_variance >= 0.0)
            || !(f.yaw_variance.is_finite() && f.yaw_variance >= 0.0)
        {
            return Err(FilterError::Config(
                "fix_init variances must be finite and non-negative".into(),
            ));
        }
        if self.output.queue_capacity == 0 {
            return Err(FilterError::Config("output queue_capacity must be at least 1".into()));
        }
        if !(self.replay.fix_latency >= 0.0) {
            return Err(FilterError::Config("fix_latency must be non-negative".into()));
        }
        Ok(())
    }
    /// Tick period in seconds
    pub fn prediction_period(&self) -> f64 {
        1.0 / self.prediction.prediction_rate
    }
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self)?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self)?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        Ok(toml::from_str(&s)?)
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        match extension_of(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported_extension(p)),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml). The result is validated.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let config = match extension_of(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported_extension(p)),
        }?;
        config.validate()?;
        Ok(config)
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported_extension(path: &Path) -> FilterError {
    FilterError::Config(format!(
        "unsupported configuration file extension: {}",
        path.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn custom_config() -> FilterConfig {
        let mut config = FilterConfig::default();
        config.prediction.num_particles = 64;
        config.prediction.noise_model = NoiseModel::Static {
            linear_variance: 0.25,
            angular_variance: 0.01,
        };
        config.resampling.strategy = ResamplingStrategy::Residual;
        config.gnss.rtk_enabled = false;
        config.output.estimate_frame = "particle_filter".to_string();
        config.fix_init.position_variance = 4.0;
        config.seed = Some(7);
        config
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = FilterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.prediction.num_particles, 500);
        assert_eq!(config.prediction.prediction_rate, 50.0);
        assert_eq!(config.resampling.resampling_interval, 1.0);
        assert_eq!(config.prediction.motion_noise_gain, 4.0);
        assert_eq!(config.output.map_frame, "map");
        assert_eq!(config.output.estimate_frame, "mpf");
        assert!((config.prediction_period() - 0.02).abs() < 1e-12);
    }
    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = FilterConfig::default();
        config.prediction.num_particles = 0;
        assert!(matches!(config.validate(), Err(FilterError::Config(_))));

        let mut config = FilterConfig::default();
        config.prediction.prediction_rate = 0.0;
        assert!(config.validate().is_err());

        let mut config = FilterConfig::default();
        config.prediction.prediction_rate = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = FilterConfig::default();
        config.prediction.prediction_rate = 1e-30;
        assert!(matches!(config.validate(), Err(FilterError::Config(_))));

        let mut config = FilterConfig::default();
        config.prediction.prediction_rate = 1e12;
        assert!(config.validate().is_err());

        let mut config = FilterConfig::default();
        config.prediction.prediction_rate = 0.01;
        assert!(config.validate().is_ok());

        let mut config = FilterConfig::default();
        config.fix_init.yaw_variance = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = FilterConfig::default();
        config.output.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = FilterConfig::default();
        config.resampling.retention_horizon = 0;
        assert!(config.validate().is_err());

        let mut config = FilterConfig::default();
        config.gnss.likelihood_stdev = -1.0;
        assert!(config.validate().is_err());

        let mut config = FilterConfig::default();
        config.prediction.noise_model = NoiseModel::Static {
            linear_variance: -0.1,
            angular_variance: 0.0,
        };
        assert!(config.validate().is_err());
    }
    #[test]
    fn test_round_trip_all_formats() {
        let dir = tempdir().unwrap();
        let config = custom_config();
        for name in ["config.json", "config.yaml", "config.yml", "config.toml"] {
            let path = dir.path().join(name);
            config.to_file(&path).unwrap();
            let read = FilterConfig::from_file(&path).unwrap();
            assert_eq!(read, config, "round trip through {name}");
        }
    }
    #[test]
    fn test_partial_toml_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "seed = 3\n[prediction]\nnum_particles = 10\n").unwrap();
        let config = FilterConfig::from_file(&path).unwrap();
        assert_eq!(config.seed, Some(3));
        assert_eq!(config.prediction.num_particles, 10);
        assert_eq!(config.prediction.prediction_rate, 50.0);
        assert_eq!(config.gnss, GnssCorrectorConfig::default());
    }
    #[test]
    fn test_from_file_validates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"prediction": {"num_particles": 0}}"#).unwrap();
        assert!(matches!(
            FilterConfig::from_file(&path),
            Err(FilterError::Config(_))
        ));
    }
    #[test]
    fn test_unsupported_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.ini");
        assert!(FilterConfig::default().to_file(&path).is_err());
        assert!(FilterConfig::from_file(&path).is_err());
    }
}
