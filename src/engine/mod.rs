//! Experiment engine: device controllers, the raster walk, the UART
//! listener, and the dispatch loop that ties them together.

pub mod dispatch;
pub mod generator;
pub mod motion;
pub mod scan;
pub mod sim;
pub mod target;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use self::dispatch::{DispatchParams, EventDispatcher};
use self::generator::{GeneratorController, PulseChange, PulseDevice, SerialPulseDevice};
use self::motion::{serial_axis_map, AxisName, MotionController, MoveOptions};
use self::scan::Scanner;
use self::sim::{sim_axis_map, sim_target, SimDeviceHandle, SimPulseDevice};
use self::target::{
    MonitorParams, ResetLine, SerialResetLine, SerialTargetLink, TargetLink, TargetMonitor,
    TargetResetter, TargetShared,
};
use crate::error::DeviceError;
use crate::metrics;
use crate::model::{
    Checkpoint, ConfirmedAlarm, ConfirmedFault, DispatchMsg, ExperimentEvent, Position, RunReport,
    ScanConfig, ScanDirection, TimingHistory, TrialRecord,
};
use crate::storage;

/// Commands accepted by a running experiment.
#[derive(Debug, Clone)]
pub enum EngineControl {
    /// Stop the run, export what has been collected, and shut down.
    Cancel,
}

/// Sleeps in short slices so a stop request cuts long waits short.
pub fn sleep_unless_stopping(stop: &AtomicBool, dur: Duration) {
    let deadline = Instant::now() + dur;
    while !stop.load(Ordering::SeqCst) {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        std::thread::sleep(left.min(Duration::from_millis(100)));
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mutable experiment bookkeeping shared between the dispatch worker,
/// the UART listener, and the scanner. Guarded by a single mutex; the
/// rule is to never call into a device controller while holding it.
#[derive(Debug)]
pub struct ExperimentState {
    pub target_name: String,
    /// Probe position relative to the reference point (Z absolute).
    pub position: Position,
    pub direction: ScanDirection,
    /// Raster cells visited so far.
    pub position_counter: u64,
    pub tries_left: u32,
    /// Pulse schedule stage at the current position: 0 = start values,
    /// 1 = probing above them, 2 = probing below.
    pub schedule_stage: u8,
    /// Voltage level the current position started from. Reductions pull
    /// it down so the schedule keeps probing around the lowered level;
    /// every position change snaps it back to the configured start.
    pub voltage_baseline: u32,
    pub current_progress: u64,
    pub total_progress: u64,
    pub signatures_seen: u64,
    /// Signatures that arrived while pulsing was held off.
    pub signatures_while_disabled: u32,
    pub unparseables_total: u64,
    pub unparseables_at_position: u32,
    pub unparseables_in_a_row: u32,
    pub recovery_attempts_at_position: u32,
    pub trial_records: Vec<TrialRecord>,
    pub confirmed_faults: Vec<ConfirmedFault>,
    pub confirmed_alarms: Vec<ConfirmedAlarm>,
    pub past_timings: TimingHistory,
}

impl ExperimentState {
    pub fn new(cfg: &ScanConfig) -> Self {
        ExperimentState {
            target_name: cfg.target_name.clone(),
            position: Position {
                x: 0.0,
                y: 0.0,
                z: 0.0,
            },
            direction: cfg.start_direction,
            position_counter: 0,
            tries_left: cfg.tries_per_position,
            schedule_stage: 0,
            voltage_baseline: cfg.voltage_start,
            current_progress: 0,
            total_progress: Self::planned_positions(cfg) * u64::from(cfg.tries_per_position),
            signatures_seen: 0,
            signatures_while_disabled: 0,
            unparseables_total: 0,
            unparseables_at_position: 0,
            unparseables_in_a_row: 0,
            recovery_attempts_at_position: 0,
            trial_records: Vec::new(),
            confirmed_faults: Vec::new(),
            confirmed_alarms: Vec::new(),
            past_timings: TimingHistory::default(),
        }
    }

    /// Estimated number of raster cells for the configured window.
    pub fn planned_positions(cfg: &ScanConfig) -> u64 {
        let b = &cfg.boundaries;
        if cfg.step_size_mm <= 0.0 {
            return 1;
        }
        let cols = ((b.x_left - b.x_right + 1.0) / cfg.step_size_mm).floor().max(1.0);
        let rows = ((b.y_up - b.y_down + 1.0) / cfg.step_size_mm).floor().max(1.0);
        (cols * rows) as u64
    }

    /// Restores collected results and progress from a saved checkpoint.
    /// Re-positioning the probe is handled separately by the startup
    /// move.
    pub fn resume_from(&mut self, cp: &Checkpoint) {
        self.target_name = cp.target_name.clone();
        self.position = cp.position;
        self.tries_left = cp.tries_left;
        self.current_progress = cp.current_progress;
        self.total_progress = cp.total_progress;
        self.confirmed_faults = cp.confirmed_faults.clone();
        self.confirmed_alarms = cp.confirmed_alarms.clone();
        self.past_timings = cp.past_timings.clone();
    }

    pub fn to_checkpoint(&self, cfg: &ScanConfig, checkpoint_time: String) -> Checkpoint {
        Checkpoint {
            boundaries: cfg.boundaries,
            reference: cfg.reference,
            position: self.position,
            tries_left: self.tries_left,
            confirmed_faults: self.confirmed_faults.clone(),
            confirmed_alarms: self.confirmed_alarms.clone(),
            past_timings: self.past_timings.clone(),
            current_progress: self.current_progress,
            total_progress: self.total_progress,
            target_name: self.target_name.clone(),
            checkpoint_time,
        }
    }
}

/// Owns one scan from device bring-up to the final exports.
pub struct ExperimentEngine {
    cfg: ScanConfig,
    resume: Option<Checkpoint>,
}

impl ExperimentEngine {
    pub fn new(cfg: ScanConfig, resume: Option<Checkpoint>) -> Self {
        ExperimentEngine { cfg, resume }
    }

    /// Runs the scan on a blocking worker, with a small async shim for
    /// the control channel. Device traffic is all synchronous serial,
    /// so everything below this point lives on plain threads.
    pub async fn run(
        self,
        event_tx: mpsc::UnboundedSender<ExperimentEvent>,
        mut control_rx: mpsc::UnboundedReceiver<EngineControl>,
    ) -> Result<RunReport> {
        let stop = Arc::new(AtomicBool::new(false));

        let stop_flag = stop.clone();
        let control_handle = tokio::spawn(async move {
            while let Some(msg) = control_rx.recv().await {
                match msg {
                    EngineControl::Cancel => {
                        info!("Cancel requested, stopping the run.");
                        stop_flag.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });

        let cfg = Arc::new(self.cfg);
        let resume = self.resume;
        let worker_stop = stop.clone();
        let worker =
            tokio::task::spawn_blocking(move || run_blocking(cfg, resume, event_tx, worker_stop));
        let result = worker.await;

        // Dropping the JoinHandle would leave the task waiting on the
        // channel forever, so abort it explicitly.
        control_handle.abort();
        stop.store(true, Ordering::SeqCst);
        result.context("engine worker failed")?
    }
}

fn run_blocking(
    cfg: Arc<ScanConfig>,
    resume: Option<Checkpoint>,
    events: mpsc::UnboundedSender<ExperimentEvent>,
    stop: Arc<AtomicBool>,
) -> Result<RunReport> {
    let started_at = storage::date_stamp();
    std::fs::create_dir_all(&cfg.output_dir).context("creating the output directory failed")?;

    let state = Arc::new(Mutex::new(ExperimentState::new(&cfg)));
    if let Some(cp) = &resume {
        info!(
            "Resuming the run for '{}' from a checkpoint saved at {}",
            cp.target_name, cp.checkpoint_time
        );
        lock(&state).resume_from(cp);
    }

    // Pulse generator, real or emulated. The bench handle couples the
    // emulated target's fault behavior to the generator settings.
    let (pulse_device, bench_handle): (Box<dyn PulseDevice>, Option<SimDeviceHandle>) =
        if cfg.dry_run {
            let (device, handle) = SimPulseDevice::new();
            (Box::new(device), Some(handle))
        } else {
            let port = cfg
                .generator_port
                .as_deref()
                .context("no generator port configured; pass --generator-port or use --dry-run")?;
            (
                Box::new(SerialPulseDevice::new(port, cfg.generator_baud)),
                None,
            )
        };
    let generator = Arc::new(Mutex::new(
        GeneratorController::new(pulse_device, &cfg, events.clone(), stop.clone())
            .context("pulse generator setup failed")?,
    ));

    let factory = if cfg.dry_run {
        let (factory, _handles) = sim_axis_map();
        factory
    } else {
        serial_axis_map(&cfg, stop.clone()).context("stage port configuration is incomplete")?
    };
    let motion = Arc::new(Mutex::new(
        MotionController::new(factory, &cfg, stop.clone()).context("motion stage setup failed")?,
    ));

    let scanner = Scanner::new(
        cfg.clone(),
        state.clone(),
        motion.clone(),
        generator.clone(),
        events.clone(),
    );

    let shared = Arc::new(Mutex::new(TargetShared::new()));
    let (target_link, reset_line): (Box<dyn TargetLink>, Box<dyn ResetLine>) = if cfg.dry_run {
        let (link, reset) = sim_target(&cfg, bench_handle, stop.clone());
        (Box::new(link), Box::new(reset))
    } else {
        let target_port = cfg
            .target_port
            .as_deref()
            .context("no target port configured; pass --target-port or use --dry-run")?;
        let reset_port = cfg
            .reset_port
            .as_deref()
            .context("no reset port configured; pass --reset-port or use --dry-run")?;
        let link = SerialTargetLink::open(target_port, cfg.primary_baud, cfg.signature_period)
            .context("opening the target UART failed")?;
        let reset = SerialResetLine::new(reset_port, cfg.reset_baud, stop.clone());
        (Box::new(link), Box::new(reset))
    };
    let resetter = TargetResetter::new(
        shared.clone(),
        reset_line,
        generator.clone(),
        events.clone(),
        cfg.show_uart,
        stop.clone(),
    );

    // Park the stage over the first cell with the probe lifted, then
    // lower onto the surface.
    let start = {
        let st = lock(&state);
        if resume.is_some() {
            st.position
        } else {
            Position {
                x: cfg.boundaries.x_left,
                y: cfg.boundaries.y_up,
                z: cfg.boundaries.z_down,
            }
        }
    };
    let park = MoveOptions {
        force: true,
        lift_z: false,
        ..Default::default()
    };
    {
        let mut stage = lock(&motion);
        stage
            .move_axes(
                &[
                    (AxisName::Z, cfg.boundaries.z_up),
                    (AxisName::X, start.x),
                    (AxisName::Y, start.y),
                ],
                park,
            )
            .context("initial stage positioning failed")?;
        stage
            .move_axes(&[(AxisName::Z, cfg.boundaries.z_down)], park)
            .context("lowering the probe failed")?;
    }
    let live = lock(&motion)
        .store_positions()
        .context("reading the stage position failed")?;
    lock(&state).position = live;

    lock(&generator)
        .change(
            PulseChange {
                high_time_ns: None,
                voltage: Some(cfg.voltage_start),
                dead_time_ms: Some(cfg.dead_time_start_ms),
            },
            false,
        )
        .context("applying the initial pulse parameters failed")?;

    let (queue_tx, queue_rx) = std::sync::mpsc::channel();
    let monitor = TargetMonitor::new(MonitorParams {
        cfg: cfg.clone(),
        link: target_link,
        resetter: resetter.clone(),
        shared: shared.clone(),
        state: state.clone(),
        generator: generator.clone(),
        scanner: scanner.clone(),
        queue: queue_tx.clone(),
        events: events.clone(),
        stop: stop.clone(),
    });
    let dispatcher = EventDispatcher::new(DispatchParams {
        cfg: cfg.clone(),
        state: state.clone(),
        generator: generator.clone(),
        motion: motion.clone(),
        scanner,
        resetter: resetter.clone(),
        queue: queue_rx,
        events: events.clone(),
        stop: stop.clone(),
    });

    info!(
        "Starting the scan for target '{}' ({} planned positions, {} tries each)",
        cfg.target_name,
        ExperimentState::planned_positions(&cfg),
        cfg.tries_per_position
    );
    let listener = thread::Builder::new()
        .name("uart-listener".into())
        .spawn(move || monitor.listen())
        .context("spawning the UART listener failed")?;
    let dispatch_worker = thread::Builder::new()
        .name("dispatch".into())
        .spawn(move || dispatcher.run())
        .context("spawning the dispatch worker failed")?;

    // The reset both syncs the protocol stream to a known point and,
    // through the banner detection, arms the generator for the first
    // trial. A target that is not plugged in yet is not fatal.
    match resetter.reset() {
        Ok(()) => info!("Setup finished."),
        Err(DeviceError::Stopped) => {}
        Err(err) => warn!("Setup finished but failed to reset the target: {err}. Plug in the target now."),
    }

    while !stop.load(Ordering::SeqCst) {
        if dispatch_worker.is_finished() {
            break;
        }
        thread::sleep(Duration::from_millis(200));
    }

    info!("Shutting down...");
    stop.store(true, Ordering::SeqCst);
    let _ = queue_tx.send(DispatchMsg::Sentinel);
    let finished = dispatch_worker.join().unwrap_or(false);
    if listener.join().is_err() {
        error!("The UART listener panicked during shutdown.");
    }

    if let Err(err) = lock(&generator).arm(false, "shutdown") {
        warn!("Could not disarm the generator at shutdown: {err}");
    }
    lock(&motion).close_all();

    {
        let st = lock(&state);
        info!(
            "Moved {} times and received {} signatures during this run.",
            st.position_counter, st.signatures_seen
        );
    }

    let (timing_sign_gen_ms, timing_trigger_ns) = {
        let st = lock(&state);
        (
            metrics::compute_timing_stats(&st.past_timings.between_trigger_and_sign_gen_ms),
            metrics::compute_timing_stats(&st.past_timings.trigger_duration_ns),
        )
    };
    match (&timing_sign_gen_ms, &timing_trigger_ns) {
        (None, None) => info!("No timings recorded yet."),
        _ => {
            if let Some(stats) = &timing_sign_gen_ms {
                info!(
                    "Trigger to signature generation: mean {:.2} ms, stddev {:.2} ms over {} samples",
                    stats.mean, stats.stddev, stats.count
                );
            }
            if let Some(stats) = &timing_trigger_ns {
                info!(
                    "Trigger duration: mean {:.2} ns, stddev {:.2} ns over {} samples",
                    stats.mean, stats.stddev, stats.count
                );
            }
        }
    }

    let mut checkpoint_path = {
        let mut st = lock(&state);
        if let Err(err) = storage::export_trials(&cfg, &mut st.trial_records) {
            error!("Failed to export parameters: {err}");
        }
        let checkpoint = st.to_checkpoint(&cfg, storage::date_stamp());
        match storage::save_checkpoint(&cfg, &checkpoint) {
            Ok(path) => Some(path),
            Err(err) => {
                error!("Failed to save the final checkpoint: {err}");
                None
            }
        }
    };
    {
        let st = lock(&state);
        if let Err(err) = storage::export_faults(&cfg, &st.confirmed_faults) {
            error!("Failed to export results: {err}");
        }
        if let Err(err) = storage::export_alarms(&cfg, &st.confirmed_alarms) {
            error!("Failed to export alarms: {err}");
        }
    }
    if finished {
        match storage::mark_finished(&cfg) {
            Ok(renamed) => checkpoint_path = renamed,
            Err(err) => warn!("Could not rename the finished checkpoint: {err}"),
        }
    }

    let report = {
        let st = lock(&state);
        RunReport {
            target_name: st.target_name.clone(),
            started_at,
            finished_at: storage::date_stamp(),
            completed: finished,
            positions_visited: st.position_counter,
            signatures_seen: st.signatures_seen,
            unparseables_seen: st.unparseables_total,
            tries_per_position: cfg.tries_per_position,
            current_progress: st.current_progress,
            total_progress: st.total_progress,
            faults: st.confirmed_faults.clone(),
            alarms: st.confirmed_alarms.clone(),
            timing_sign_gen_ms,
            timing_trigger_ns,
            checkpoint_path,
        }
    };
    let _ = events.send(ExperimentEvent::RunCompleted {
        report: Box::new(report.clone()),
    });
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planned_positions_counts_grid_cells() {
        let mut cfg = ScanConfig::baseline("test");
        cfg.boundaries.x_left = 10.0;
        cfg.boundaries.x_right = 0.0;
        cfg.boundaries.y_up = 10.0;
        cfg.boundaries.y_down = 0.0;
        cfg.step_size_mm = 1.0;
        assert_eq!(ExperimentState::planned_positions(&cfg), 121);
    }

    #[test]
    fn total_progress_scales_with_tries() {
        let mut cfg = ScanConfig::baseline("test");
        cfg.boundaries.x_left = 2.0;
        cfg.boundaries.x_right = 0.0;
        cfg.boundaries.y_up = 0.0;
        cfg.boundaries.y_down = 0.0;
        cfg.step_size_mm = 1.0;
        cfg.tries_per_position = 5;
        let st = ExperimentState::new(&cfg);
        // 3 columns, 1 row.
        assert_eq!(st.total_progress, 15);
    }

    #[test]
    fn checkpoint_round_trip_restores_results() {
        let cfg = ScanConfig::baseline("test");
        let mut st = ExperimentState::new(&cfg);
        st.position = Position {
            x: 3.0,
            y: 4.0,
            z: 5.0,
        };
        st.tries_left = 42;
        st.current_progress = 7;
        let cp = st.to_checkpoint(&cfg, "10:00:00 (01.01.2026)".into());

        let mut restored = ExperimentState::new(&cfg);
        restored.resume_from(&cp);
        assert_eq!(restored.tries_left, 42);
        assert_eq!(restored.current_progress, 7);
        assert!((restored.position.y - 4.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn dry_run_engine_scans_a_single_cell_grid() {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let mut cfg = ScanConfig::baseline(format!("engine-smoke-{nonce}"));
        cfg.dry_run = true;
        cfg.output_dir = std::env::temp_dir();
        cfg.run_basename = format!("emfi-engine-{nonce}");
        cfg.valid_signature = "00112233445566778899aabbccddeeff".to_string();
        cfg.boundaries.x_left = 0.0;
        cfg.boundaries.x_right = 0.0;
        cfg.boundaries.y_up = 0.0;
        cfg.boundaries.y_down = 0.0;
        cfg.tries_per_position = 2;
        // Keep the emulated target and the reset handshake fast.
        cfg.signature_period = Duration::from_millis(20);
        cfg.reset_timeout = Duration::from_millis(50);

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_control_tx, control_rx) = mpsc::unbounded_channel();

        let report = ExperimentEngine::new(cfg, None)
            .run(event_tx, control_rx)
            .await
            .unwrap();

        assert!(report.completed);
        assert!(report.signatures_seen >= 2);
        assert_eq!(report.tries_per_position, 2);
        assert!(report
            .checkpoint_path
            .as_deref()
            .is_some_and(|p| p.to_string_lossy().ends_with("_checkpoint_finished.json")));

        let mut run_completed = false;
        while let Ok(event) = event_rx.try_recv() {
            if matches!(event, ExperimentEvent::RunCompleted { .. }) {
                run_completed = true;
            }
        }
        assert!(run_completed);
    }
}
