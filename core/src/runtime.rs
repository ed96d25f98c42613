//! Threaded runtime for the estimator.
//!
//! Two threads, connected by mpsc channels:
//! - Predictor thread: owns the [`Predictor`]. Runs the fixed-rate tick off a `recv_timeout` deadline loop and
//!   applies initializations, motion observations and weighted updates between ticks. It is the only place the
//!   population is mutated.
//! - Corrector thread: owns the [`GnssCorrector`] and a [`PopulationBuffer`] of recent predictions. Scores fixes
//!   and sends the resulting weighted updates back to the predictor thread.
//!
//! Clients talk to both through an [`EstimatorHandle`] and read everything the estimator publishes from the
//! [`EstimatorOutput`] receiver returned by [`EstimatorHandle::spawn`]. All timestamps handed to the runtime are
//! seconds on the runtime clock, see [`EstimatorHandle::now`].

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::FilterConfig;
use crate::corrector::{Corrector, GnssCorrector, PopulationBuffer};
use crate::error::{FilterError, Result};
use crate::messages::{
    CorrectorSwitch, GnssFix, InitialPose, MeanPose, PoseTransform, SwitchAck,
    TwistWithCovariance, WeightedUpdate,
};
use crate::particle::Population;
use crate::predictor::{Predictor, TickOutcome, UpdateOutcome};
use crate::visualize::CorrectionMarkers;

/// How long [`EstimatorHandle::switch_corrector`] waits for an acknowledgment by default
pub const DEFAULT_SWITCH_TIMEOUT: Duration = Duration::from_millis(1000);

/// Everything the estimator publishes.
#[derive(Clone, Debug)]
pub enum EstimatorOutput {
    /// A freshly initialized or predicted population
    Predicted(Population),
    /// A population produced by a resample
    Resampled(Population),
    /// A weighted update produced by a corrector
    Weighted(WeightedUpdate),
    MeanPose(MeanPose),
    Transform(PoseTransform),
    /// Diagnostic markers from the last scored fix
    Markers(CorrectionMarkers),
}

/// Sending side of the bounded output queue
///
/// Outputs are offered with `try_send`; when the client has not drained the queue the output is dropped and
/// counted, so the estimation threads never block on or buffer for a slow reader.
struct OutputSink {
    tx: SyncSender<EstimatorOutput>,
    dropped: u64,
}
impl OutputSink {
    fn new(tx: SyncSender<EstimatorOutput>) -> OutputSink {
        OutputSink { tx, dropped: 0 }
    }
    fn send(&mut self, output: EstimatorOutput) {
        match self.tx.try_send(output) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                if self.dropped.is_power_of_two() {
                    debug!("Output queue full; {} outputs dropped so far", self.dropped);
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Monotonic clock shared by the handle and both threads.
#[derive(Clone, Copy, Debug)]
pub struct EstimatorClock {
    origin: Instant,
}
impl EstimatorClock {
    pub fn start() -> EstimatorClock {
        EstimatorClock {
            origin: Instant::now(),
        }
    }
    /// Seconds since the clock was started
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

#[derive(Debug)]
enum PredictorCommand {
    Initialize(InitialPose),
    InitializeFromFix(GnssFix),
    Height(f64),
    Motion(TwistWithCovariance),
    Weighted(WeightedUpdate),
    Shutdown,
}

/// Switch request with a channel for the acknowledgment.
pub struct SwitchWithResponse {
    pub request: CorrectorSwitch,
    pub response_tx: Sender<SwitchAck>,
}
impl std::fmt::Debug for SwitchWithResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchWithResponse")
            .field("request", &self.request)
            .field("response_tx", &"...")
            .finish()
    }
}

#[derive(Debug)]
enum CorrectorCommand {
    Population(Population),
    Fix(GnssFix),
    Height(f64),
    Switch(SwitchWithResponse),
    Shutdown,
}

struct PredictorThread {
    predictor: Predictor,
    period: Duration,
    clock: EstimatorClock,
    commands: Receiver<PredictorCommand>,
    corrector_tx: Sender<CorrectorCommand>,
    outputs: OutputSink,
}
impl PredictorThread {
    fn run(mut self) {
        let mut next_tick = Instant::now() + self.period;
        loop {
            let now = Instant::now();
            if now >= next_tick {
                self.on_tick();
                next_tick += self.period;
                if next_tick <= now {
                    // fell behind by more than one period: skip the missed ticks
                    next_tick = now + self.period;
                }
                continue;
            }
            match self.commands.recv_timeout(next_tick - now) {
                Ok(PredictorCommand::Shutdown) => break,
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("Predictor thread stopped ({} outputs dropped)", self.outputs.dropped);
    }
    fn handle(&mut self, command: PredictorCommand) {
        match command {
            PredictorCommand::Initialize(initial_pose) => {
                let population = self.predictor.initialize(&initial_pose);
                self.publish_population(EstimatorOutput::Predicted(population));
            }
            PredictorCommand::InitializeFromFix(fix) => {
                let population = self.predictor.initialize_from_fix(&fix);
                self.publish_population(EstimatorOutput::Predicted(population));
            }
            PredictorCommand::Height(height) => self.predictor.set_ground_height(height),
            PredictorCommand::Motion(twist) => self.predictor.set_motion(twist),
            PredictorCommand::Weighted(update) => match self.predictor.on_weighted_update(&update) {
                UpdateOutcome::Merged { resampled } | UpdateOutcome::Stale { resampled } => {
                    if let Some(population) = resampled {
                        self.publish_population(EstimatorOutput::Resampled(population));
                    }
                }
                UpdateOutcome::Uninitialized => {}
            },
            PredictorCommand::Shutdown => {}
        }
    }
    fn on_tick(&mut self) {
        match self.predictor.tick(self.clock.now()) {
            TickOutcome::Predicted(prediction) => {
                self.publish_population(EstimatorOutput::Predicted(prediction.population));
                self.outputs.send(EstimatorOutput::MeanPose(prediction.mean_pose));
                self.outputs.send(EstimatorOutput::Transform(prediction.transform));
            }
            TickOutcome::NonMonotonicTime { dt } => {
                debug!("Tick skipped, dt = {dt:.4} s");
            }
            TickOutcome::Uninitialized | TickOutcome::AwaitingMotion => {}
        }
    }
    /// Send a population to the corrector buffer and to the outputs.
    fn publish_population(&mut self, output: EstimatorOutput) {
        let population = match &output {
            EstimatorOutput::Predicted(p) | EstimatorOutput::Resampled(p) => p.clone(),
            _ => return,
        };
        let _ = self.corrector_tx.send(CorrectorCommand::Population(population));
        self.outputs.send(output);
    }
}

struct CorrectorThread {
    corrector: GnssCorrector,
    buffer: PopulationBuffer,
    commands: Receiver<CorrectorCommand>,
    predictor_tx: Sender<PredictorCommand>,
    outputs: OutputSink,
}
impl CorrectorThread {
    fn run(mut self) {
        'outer: while let Ok(first) = self.commands.recv() {
            // drain everything queued so that only the newest fix gets scored
            let mut pending_fix = None;
            let mut next = Some(first);
            while let Some(command) = next {
                match command {
                    CorrectorCommand::Population(population) => self.buffer.push(population),
                    CorrectorCommand::Fix(fix) => pending_fix = Some(fix),
                    CorrectorCommand::Height(height) => self.corrector.set_height(height),
                    CorrectorCommand::Switch(switch) => self.switch(switch),
                    CorrectorCommand::Shutdown => break 'outer,
                }
                next = self.commands.try_recv().ok();
            }
            if let Some(fix) = pending_fix {
                self.score(fix);
            }
        }
        info!("Corrector thread stopped");
    }
    fn switch(&mut self, switch: SwitchWithResponse) {
        let SwitchWithResponse {
            request,
            response_tx,
        } = switch;
        let applied = request.corrector == self.corrector.name();
        if applied {
            self.corrector.set_enabled(request.enabled);
        } else {
            warn!("Switch request for unknown corrector `{}`", request.corrector);
        }
        let ack = SwitchAck {
            corrector: request.corrector,
            applied,
            enabled: applied && self.corrector.is_enabled(),
        };
        if response_tx.send(ack).is_err() {
            debug!("Switch requester stopped waiting before the acknowledgment");
        }
    }
    fn score(&mut self, fix: GnssFix) {
        let Some(update) = self.corrector.on_fix(fix, &self.buffer) else {
            return;
        };
        if let Some(markers) = self.corrector.markers() {
            self.outputs.send(EstimatorOutput::Markers(markers.clone()));
        }
        self.outputs.send(EstimatorOutput::Weighted(update.clone()));
        let _ = self.predictor_tx.send(PredictorCommand::Weighted(update));
    }
}

/// Wait for a switch acknowledgment for at most `timeout`
///
/// A timeout is logged and returned as [`FilterError::CommunicationTimeout`]; it is never retried.
pub fn await_ack(rx: &Receiver<SwitchAck>, target: &str, timeout: Duration) -> Result<SwitchAck> {
    match rx.recv_timeout(timeout) {
        Ok(ack) => Ok(ack),
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                "No response from {target} within {} ms; corrector switch not confirmed",
                timeout.as_millis()
            );
            Err(FilterError::CommunicationTimeout {
                target: target.to_string(),
                timeout_ms: timeout.as_millis(),
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(FilterError::Disconnected(target.to_string())),
    }
}

/// Client side of a running estimator. Dropping the handle stops both threads.
pub struct EstimatorHandle {
    clock: EstimatorClock,
    predictor_tx: Sender<PredictorCommand>,
    corrector_tx: Sender<CorrectorCommand>,
    predictor_thread: Option<JoinHandle<()>>,
    corrector_thread: Option<JoinHandle<()>>,
}
impl EstimatorHandle {
    /// Validate the configuration and start both threads.
    pub fn spawn(config: &FilterConfig) -> Result<(EstimatorHandle, Receiver<EstimatorOutput>)> {
        let predictor = Predictor::new(config)?;
        let corrector = GnssCorrector::new(&config.gnss).with_frame_id(&config.output.map_frame);
        let period = Duration::try_from_secs_f64(config.prediction_period())
            .map_err(|e| FilterError::Config(format!("invalid tick period: {e}")))?;
        let clock = EstimatorClock::start();
        let (predictor_tx, predictor_rx) = mpsc::channel::<PredictorCommand>();
        let (corrector_tx, corrector_rx) = mpsc::channel::<CorrectorCommand>();
        let (output_tx, output_rx) = mpsc::sync_channel::<EstimatorOutput>(config.output.queue_capacity);

        let predictor_thread = PredictorThread {
            predictor,
            period,
            clock,
            commands: predictor_rx,
            corrector_tx: corrector_tx.clone(),
            outputs: OutputSink::new(output_tx.clone()),
        };
        let corrector_thread = CorrectorThread {
            corrector,
            buffer: PopulationBuffer::new(config.gnss.buffer_length),
            commands: corrector_rx,
            predictor_tx: predictor_tx.clone(),
            outputs: OutputSink::new(output_tx),
        };

        let predictor_handle = thread::Builder::new()
            .name("mpf-predictor".into())
            .spawn(move || predictor_thread.run())?;
        let corrector_handle = thread::Builder::new()
            .name("mpf-corrector".into())
            .spawn(move || corrector_thread.run())?;
        info!(
            "Estimator started: {} particles at {} Hz",
            config.prediction.num_particles, config.prediction.prediction_rate
        );
        Ok((
            EstimatorHandle {
                clock,
                predictor_tx,
                corrector_tx,
                predictor_thread: Some(predictor_handle),
                corrector_thread: Some(corrector_handle),
            },
            output_rx,
        ))
    }
    /// Current time on the runtime clock in seconds
    pub fn now(&self) -> f64 {
        self.clock.now()
    }
    /// (Re)initialize the population
    pub fn initialize(&self, initial_pose: InitialPose) -> Result<()> {
        self.to_predictor(PredictorCommand::Initialize(initial_pose))
    }
    /// (Re)initialize the population around a GNSS fix
    pub fn initialize_from_fix(&self, fix: GnssFix) -> Result<()> {
        self.to_predictor(PredictorCommand::InitializeFromFix(fix))
    }
    /// Replace the latest motion observation
    pub fn set_motion(&self, twist: TwistWithCovariance) -> Result<()> {
        self.to_predictor(PredictorCommand::Motion(twist))
    }
    /// Hand a fix to the GNSS corrector
    pub fn push_fix(&self, fix: GnssFix) -> Result<()> {
        self.to_corrector(CorrectorCommand::Fix(fix))
    }
    /// Replace the reference ground height used by the GNSS corrector and by fix initialization
    pub fn set_height(&self, height: f64) -> Result<()> {
        self.to_predictor(PredictorCommand::Height(height))?;
        self.to_corrector(CorrectorCommand::Height(height))
    }
    /// Enable or disable a corrector and wait at most `timeout` for the acknowledgment
    pub fn switch_corrector(&self, request: CorrectorSwitch, timeout: Duration) -> Result<SwitchAck> {
        let target = request.corrector.clone();
        let (response_tx, response_rx) = mpsc::channel();
        info!(
            "Requesting corrector `{}` -> {}",
            target,
            if request.enabled { "enabled" } else { "disabled" }
        );
        self.to_corrector(CorrectorCommand::Switch(SwitchWithResponse {
            request,
            response_tx,
        }))?;
        await_ack(&response_rx, &target, timeout)
    }
    /// Stop both threads and wait for them to exit.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }
    fn stop(&mut self) -> Result<()> {
        let _ = self.predictor_tx.send(PredictorCommand::Shutdown);
        let _ = self.corrector_tx.send(CorrectorCommand::Shutdown);
        let mut result = Ok(());
        if let Some(handle) = self.predictor_thread.take() {
            if handle.join().is_err() {
                result = Err(FilterError::Disconnected("predictor".into()));
            }
        }
        if let Some(handle) = self.corrector_thread.take() {
            if handle.join().is_err() {
                result = Err(FilterError::Disconnected("corrector".into()));
            }
        }
        result
    }
    fn to_predictor(&self, command: PredictorCommand) -> Result<()> {
        self.predictor_tx
            .send(command)
            .map_err(|_| FilterError::Disconnected("predictor".into()))
    }
    fn to_corrector(&self, command: CorrectorCommand) -> Result<()> {
        self.corrector_tx
            .send(command)
            .map_err(|_| FilterError::Disconnected("corrector".into()))
    }
}
impl Drop for EstimatorHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Estimator shutdown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Pose;
    use crate::messages::FixQuality;
    use nalgebra::{Matrix6, Vector3};

    fn config() -> FilterConfig {
        let mut config = FilterConfig::default();
        config.prediction.num_particles = 50;
        config.prediction.prediction_rate = 100.0;
        config.seed = Some(5);
        config
    }
    /// Collect outputs until `predicate` matches one or `deadline` passes.
    fn wait_for<F: Fn(&EstimatorOutput) -> bool>(
        rx: &Receiver<EstimatorOutput>,
        deadline: Duration,
        predicate: F,
    ) -> Option<EstimatorOutput> {
        let end = Instant::now() + deadline;
        while let Some(remaining) = end.checked_duration_since(Instant::now()) {
            match rx.recv_timeout(remaining) {
                Ok(output) if predicate(&output) => return Some(output),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    #[test]
    fn test_await_ack_times_out() {
        let (_tx, rx) = mpsc::channel::<SwitchAck>();
        let result = await_ack(&rx, "gnss", Duration::from_millis(20));
        match result {
            Err(FilterError::CommunicationTimeout { target, timeout_ms }) => {
                assert_eq!(target, "gnss");
                assert_eq!(timeout_ms, 20);
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
    }
    #[test]
    fn test_await_ack_disconnected() {
        let (tx, rx) = mpsc::channel::<SwitchAck>();
        drop(tx);
        assert!(matches!(
            await_ack(&rx, "gnss", Duration::from_millis(20)),
            Err(FilterError::Disconnected(_))
        ));
    }
    #[test]
    fn test_spawn_rejects_invalid_config() {
        let mut bad = config();
        bad.prediction.num_particles = 0;
        assert!(EstimatorHandle::spawn(&bad).is_err());

        let mut slow = config();
        slow.prediction.prediction_rate = 1e-30;
        assert!(matches!(EstimatorHandle::spawn(&slow), Err(FilterError::Config(_))));
    }
    #[test]
    fn test_runtime_predicts_and_corrects() {
        let (handle, outputs) = EstimatorHandle::spawn(&config()).unwrap();
        let now = handle.now();
        handle
            .initialize(InitialPose::new(Pose::default(), Matrix6::zeros(), now))
            .unwrap();
        handle
            .set_motion(TwistWithCovariance::planar(1.0, 0.0, 0.0, 0.0, now))
            .unwrap();
        let mean = wait_for(&outputs, Duration::from_secs(5), |o| {
            matches!(o, EstimatorOutput::MeanPose(_))
        });
        assert!(mean.is_some(), "no mean pose published");

        handle.set_height(0.0).unwrap();
        handle
            .push_fix(GnssFix::new(Vector3::new(0.1, 0.0, 0.0), FixQuality::RtkFixed, handle.now()))
            .unwrap();
        let weighted = wait_for(&outputs, Duration::from_secs(5), |o| {
            matches!(o, EstimatorOutput::Weighted(_))
        });
        match weighted {
            Some(EstimatorOutput::Weighted(update)) => {
                assert_eq!(update.epoch, 1);
                assert_eq!(update.weights.len(), 50);
            }
            other => panic!("expected a weighted update, got {other:?}"),
        }
        handle.shutdown().unwrap();
    }
    #[test]
    fn test_runtime_initializes_from_fix() {
        let (handle, outputs) = EstimatorHandle::spawn(&config()).unwrap();
        handle.set_height(2.0).unwrap();
        handle
            .initialize_from_fix(GnssFix::new(Vector3::new(5.0, 6.0, 40.0), FixQuality::RtkFixed, handle.now()))
            .unwrap();
        let predicted = wait_for(&outputs, Duration::from_secs(5), |o| {
            matches!(o, EstimatorOutput::Predicted(_))
        });
        match predicted {
            Some(EstimatorOutput::Predicted(population)) => {
                assert_eq!(population.epoch, 1);
                assert_eq!(population.len(), 50);
                assert!(population.particles.iter().all(|p| p.pose.position.z == 2.0));
            }
            other => panic!("expected an initialized population, got {other:?}"),
        }
        handle.shutdown().unwrap();
    }
    #[test]
    fn test_unread_outputs_are_bounded() {
        let mut cfg = config();
        cfg.prediction.num_particles = 200;
        cfg.prediction.prediction_rate = 200.0;
        cfg.output.queue_capacity = 4;
        let (handle, outputs) = EstimatorHandle::spawn(&cfg).unwrap();
        let now = handle.now();
        handle
            .initialize(InitialPose::new(Pose::default(), Matrix6::zeros(), now))
            .unwrap();
        handle
            .set_motion(TwistWithCovariance::planar(1.0, 0.0, 0.01, 0.0, now))
            .unwrap();
        thread::sleep(Duration::from_millis(500));
        let queued = outputs.try_iter().count();
        assert!(queued <= 4, "{queued} outputs queued");
        // the estimator keeps running and publishing once the queue has room again
        let mean = wait_for(&outputs, Duration::from_secs(5), |o| {
            matches!(o, EstimatorOutput::MeanPose(_))
        });
        assert!(mean.is_some());
        handle.shutdown().unwrap();
    }
    #[test]
    fn test_switch_corrector() {
        let (handle, _outputs) = EstimatorHandle::spawn(&config()).unwrap();
        let ack = handle
            .switch_corrector(
                CorrectorSwitch {
                    corrector: "gnss".into(),
                    enabled: false,
                },
                DEFAULT_SWITCH_TIMEOUT,
            )
            .unwrap();
        assert!(ack.applied);
        assert!(!ack.enabled);
        let unknown = handle
            .switch_corrector(
                CorrectorSwitch {
                    corrector: "camera".into(),
                    enabled: true,
                },
                DEFAULT_SWITCH_TIMEOUT,
            )
            .unwrap();
        assert!(!unknown.applied);
        handle.shutdown().unwrap();
    }
}
