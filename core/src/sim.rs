//! Offline replay of recorded motion and fix streams.
//!
//! A replay feeds a time-ordered list of [`ReplayRecord`]s (initial pose, twist, GNSS fix, reference height)
//! through a [`Predictor`] and a [`GnssCorrector`] on a simulated clock. The predictor ticks at the configured
//! rate; fixes are scored against the buffered prediction closest to their timestamp, and the resulting
//! weighted update reaches the predictor `fix_latency` seconds later, so the asynchronous, out-of-order path of
//! the live runtime is exercised deterministically. Results are written to CSV.
use crate::config::FilterConfig;
use crate::corrector::{GnssCorrector, PopulationBuffer};
use crate::error::{FilterError, Result};
use crate::messages::{FixQuality, GnssFix, InitialPose, MeanPose, TwistWithCovariance, WeightedUpdate};
use crate::predictor::{Predictor, TickOutcome, UpdateOutcome};
use crate::Pose;

use log::info;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::{self, Display};
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Init,
    Twist,
    Fix,
    Height,
    #[serde(rename = "gnss_init")]
    GnssInit,
}
impl Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordKind::Init => "init",
            RecordKind::Twist => "twist",
            RecordKind::Fix => "fix",
            RecordKind::Height => "height",
            RecordKind::GnssInit => "gnss_init",
        };
        write!(f, "{s}")
    }
}

/// One row of a replay input file.
///
/// Only the columns relevant to `kind` need to be filled:
/// - `init`: `x`, `y`, `z`, `yaw`, and optionally `position_variance`, `yaw_variance`
/// - `twist`: `speed`, `yaw_rate`, and optionally `speed_variance`, `yaw_rate_variance`
/// - `fix`: `x`, `y`, `z`, and optionally `quality` (defaults to standalone)
/// - `height`: `z`
/// - `gnss_init`: `x`, `y`, and optionally `z`, `quality`; initializes the population around the fix
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ReplayRecord {
    /// Time in seconds
    pub time: f64,
    pub kind: RecordKind,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub z: Option<f64>,
    /// Heading in radians
    #[serde(default)]
    pub yaw: Option<f64>,
    /// Forward speed in m/s
    #[serde(default)]
    pub speed: Option<f64>,
    /// Yaw rate in rad/s
    #[serde(default)]
    pub yaw_rate: Option<f64>,
    #[serde(default)]
    pub position_variance: Option<f64>,
    #[serde(default)]
    pub yaw_variance: Option<f64>,
    #[serde(default)]
    pub speed_variance: Option<f64>,
    #[serde(default)]
    pub yaw_rate_variance: Option<f64>,
    #[serde(default)]
    pub quality: Option<FixQuality>,
}

/// A replay input converted into the message it carries.
#[derive(Clone, Debug, PartialEq)]
pub enum ReplayEvent {
    Initialize(InitialPose),
    InitializeFromFix(GnssFix),
    Motion(TwistWithCovariance),
    Fix(GnssFix),
    Height(f64),
}

impl ReplayRecord {
    fn empty(time: f64, kind: RecordKind) -> ReplayRecord {
        ReplayRecord {
            time,
            kind,
            x: None,
            y: None,
            z: None,
            yaw: None,
            speed: None,
            yaw_rate: None,
            position_variance: None,
            yaw_variance: None,
            speed_variance: None,
            yaw_rate_variance: None,
            quality: None,
        }
    }
    pub fn init(time: f64, x: f64, y: f64, yaw: f64, position_variance: f64, yaw_variance: f64) -> ReplayRecord {
        ReplayRecord {
            x: Some(x),
            y: Some(y),
            z: Some(0.0),
            yaw: Some(yaw),
            position_variance: Some(position_variance),
            yaw_variance: Some(yaw_variance),
            ..ReplayRecord::empty(time, RecordKind::Init)
        }
    }
    pub fn twist(time: f64, speed: f64, yaw_rate: f64, speed_variance: f64, yaw_rate_variance: f64) -> ReplayRecord {
        ReplayRecord {
            speed: Some(speed),
            yaw_rate: Some(yaw_rate),
            speed_variance: Some(speed_variance),
            yaw_rate_variance: Some(yaw_rate_variance),
            ..ReplayRecord::empty(time, RecordKind::Twist)
        }
    }
    pub fn fix(time: f64, x: f64, y: f64, z: f64, quality: FixQuality) -> ReplayRecord {
        ReplayRecord {
            x: Some(x),
            y: Some(y),
            z: Some(z),
            quality: Some(quality),
            ..ReplayRecord::empty(time, RecordKind::Fix)
        }
    }
    pub fn gnss_init(time: f64, x: f64, y: f64, z: f64) -> ReplayRecord {
        ReplayRecord {
            x: Some(x),
            y: Some(y),
            z: Some(z),
            ..ReplayRecord::empty(time, RecordKind::GnssInit)
        }
    }
    pub fn height(time: f64, z: f64) -> ReplayRecord {
        ReplayRecord {
            z: Some(z),
            ..ReplayRecord::empty(time, RecordKind::Height)
        }
    }
    fn required(&self, value: Option<f64>, column: &str) -> Result<f64> {
        value.ok_or_else(|| {
            FilterError::Parse(format!(
                "{} record at t = {} s is missing `{column}`",
                self.kind, self.time
            ))
        })
    }
    fn gnss_fix(&self) -> Result<GnssFix> {
        Ok(GnssFix::new(
            Vector3::new(
                self.required(self.x, "x")?,
                self.required(self.y, "y")?,
                self.z.unwrap_or(0.0),
            ),
            self.quality.unwrap_or_default(),
            self.time,
        ))
    }
    /// Convert the row into the message it describes. Fails when a required column is empty or the time is not
    /// a finite number.
    pub fn to_event(&self) -> Result<ReplayEvent> {
        if !self.time.is_finite() {
            return Err(FilterError::Parse(format!("{} record has a non-finite time ({})", self.kind, self.time)));
        }
        match self.kind {
            RecordKind::Init => {
                let pose = Pose::from_xyz_rpy(
                    self.required(self.x, "x")?,
                    self.required(self.y, "y")?,
                    self.z.unwrap_or(0.0),
                    0.0,
                    0.0,
                    self.required(self.yaw, "yaw")?,
                );
                let position_variance = self.position_variance.unwrap_or(0.0);
                Ok(ReplayEvent::Initialize(InitialPose::planar(
                    pose,
                    position_variance,
                    position_variance,
                    self.yaw_variance.unwrap_or(0.0),
                    self.time,
                )))
            }
            RecordKind::Twist => Ok(ReplayEvent::Motion(TwistWithCovariance::planar(
                self.required(self.speed, "speed")?,
                self.required(self.yaw_rate, "yaw_rate")?,
                self.speed_variance.unwrap_or(0.0),
                self.yaw_rate_variance.unwrap_or(0.0),
                self.time,
            ))),
            RecordKind::Fix => Ok(ReplayEvent::Fix(self.gnss_fix()?)),
            RecordKind::GnssInit => Ok(ReplayEvent::InitializeFromFix(self.gnss_fix()?)),
            RecordKind::Height => Ok(ReplayEvent::Height(self.required(self.z, "z")?)),
        }
    }
    /// Reads a CSV file and returns its records in file order.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
    /// Writes records to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// One output row: the point estimate after a prediction tick.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MeanPoseRecord {
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub yaw_deg: f64,
    pub epoch: u32,
    pub generation_id: u64,
    pub effective_particles: f64,
}
impl MeanPoseRecord {
    pub fn new(mean: &MeanPose, epoch: u32, generation_id: u64, effective_particles: f64) -> MeanPoseRecord {
        let (roll, pitch, yaw) = mean.pose.euler_angles();
        MeanPoseRecord {
            time: mean.timestamp,
            x: mean.pose.position.x,
            y: mean.pose.position.y,
            z: mean.pose.position.z,
            roll_deg: roll.to_degrees(),
            pitch_deg: pitch.to_degrees(),
            yaw_deg: yaw.to_degrees(),
            epoch,
            generation_id,
            effective_particles,
        }
    }
}

/// Outcome of a replay.
#[derive(Debug, Default, Clone)]
pub struct ReplayResult {
    pub poses: Vec<MeanPoseRecord>,
    /// Fixes that produced a weighted update
    pub corrections: usize,
    /// Weighted updates merged into the population
    pub merged: usize,
    /// Weighted updates dropped as stale
    pub stale: usize,
    pub resamples: usize,
}
impl ReplayResult {
    pub fn last_pose(&self) -> Option<&MeanPoseRecord> {
        self.poses.last()
    }
    /// Write the pose track to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for pose in &self.poses {
            writer.serialize(pose)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Run a deterministic replay of `records` with the given configuration
///
/// Records may be in any order; they are applied in time order (stable for equal times). The simulated clock
/// starts at the earliest record and ticks at the prediction rate until every in-flight weighted update has
/// been delivered.
pub fn run_replay(records: &[ReplayRecord], config: &FilterConfig) -> Result<ReplayResult> {
    let mut events = records
        .iter()
        .map(|r| r.to_event().map(|e| (r.time, e)))
        .collect::<Result<Vec<_>>>()?;
    events.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut result = ReplayResult::default();
    let (Some(&(start, _)), Some(&(end, _))) = (events.first(), events.last()) else {
        return Ok(result);
    };

    let mut predictor = Predictor::new(config)?;
    let mut corrector = GnssCorrector::new(&config.gnss).with_frame_id(&config.output.map_frame);
    let mut buffer = PopulationBuffer::new(config.gnss.buffer_length);
    let mut in_flight: VecDeque<(f64, WeightedUpdate)> = VecDeque::new();
    let period = config.prediction_period();
    let latency = config.replay.fix_latency;
    let stop = end + latency + period;

    let mut next_event = 0;
    let mut k: u64 = 0;
    loop {
        let now = start + k as f64 * period;
        if now > stop {
            break;
        }
        while next_event < events.len() && events[next_event].0 <= now {
            match &events[next_event].1 {
                ReplayEvent::Initialize(initial_pose) => {
                    buffer.push(predictor.initialize(initial_pose));
                }
                ReplayEvent::InitializeFromFix(fix) => {
                    buffer.push(predictor.initialize_from_fix(fix));
                }
                ReplayEvent::Motion(twist) => predictor.set_motion(twist.clone()),
                ReplayEvent::Height(height) => {
                    predictor.set_ground_height(*height);
                    corrector.set_height(*height);
                }
                ReplayEvent::Fix(fix) => {
                    if let Some(update) = corrector.on_fix(fix.clone(), &buffer) {
                        result.corrections += 1;
                        in_flight.push_back((fix.timestamp + latency, update));
                    }
                }
            }
            next_event += 1;
        }
        while in_flight.front().is_some_and(|(due, _)| *due <= now) {
            let Some((_, update)) = in_flight.pop_front() else {
                break;
            };
            let outcome = predictor.on_weighted_update(&update);
            match &outcome {
                UpdateOutcome::Merged { .. } => result.merged += 1,
                UpdateOutcome::Stale { .. } | UpdateOutcome::Uninitialized => result.stale += 1,
            }
            if let Some(population) = outcome.resampled() {
                result.resamples += 1;
                buffer.push(population.clone());
            }
        }
        if let TickOutcome::Predicted(prediction) = predictor.tick(now) {
            let population = &prediction.population;
            result.poses.push(MeanPoseRecord::new(
                &prediction.mean_pose,
                population.epoch,
                population.generation_id,
                population.effective_sample_size(),
            ));
            buffer.push(prediction.population);
        }
        k += 1;
    }
    info!(
        "Replay finished: {} poses, {} corrections ({} merged, {} stale), {} resamples",
        result.poses.len(),
        result.corrections,
        result.merged,
        result.stale,
        result.resamples
    );
    Ok(result)
}
