//! Worker side of the target event pipeline.
//!
//! The listener thread queues classified [`DispatchMsg`]s; this module
//! drains that queue and reacts: fault bookkeeping, the staged pulse
//! schedule, timing capture, alarm capture, and the jog to the next
//! scan position once the trial budget at the current one is spent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::engine::generator::{GeneratorController, PulseChange};
use crate::engine::motion::MotionController;
use crate::engine::scan::{self, Scanner};
use crate::engine::target::TargetResetter;
use crate::engine::{lock, ExperimentState};
use crate::error::{DeviceError, DeviceResult};
use crate::model::{
    ConfirmedAlarm, ConfirmedFault, DispatchMsg, EventContext, ExperimentEvent, InfoEvent,
    Keyword, ScanConfig, TargetEvent, TrialRecord, TrialResult,
};
use crate::storage;

/// Consecutive empty receive windows (each three signature periods
/// long) before the target gets reset on suspicion of being wedged.
const QUEUE_TIMEOUTS_BEFORE_RESET: u32 = 100;

/// Signatures observed with the generator disarmed before the most
/// recent hold is assumed stuck and force-released.
const STUCK_HOLD_SIGNATURE_LIMIT: u32 = 200;

/// The staged schedule needs enough tries per position for its 66%/33%
/// splits to be meaningful.
const SCHEDULE_MIN_TRIES: u32 = 12;

pub struct DispatchParams {
    pub cfg: Arc<ScanConfig>,
    pub state: Arc<Mutex<ExperimentState>>,
    pub generator: Arc<Mutex<GeneratorController>>,
    pub motion: Arc<Mutex<MotionController>>,
    pub scanner: Scanner,
    pub resetter: TargetResetter,
    pub queue: mpsc::Receiver<DispatchMsg>,
    pub events: UnboundedSender<ExperimentEvent>,
    pub stop: Arc<AtomicBool>,
}

/// Blocking event consumer. Runs on its own thread next to the UART
/// listener and owns the receiving end of the event queue.
pub struct EventDispatcher {
    cfg: Arc<ScanConfig>,
    state: Arc<Mutex<ExperimentState>>,
    generator: Arc<Mutex<GeneratorController>>,
    motion: Arc<Mutex<MotionController>>,
    scanner: Scanner,
    resetter: TargetResetter,
    queue: mpsc::Receiver<DispatchMsg>,
    events: UnboundedSender<ExperimentEvent>,
    stop: Arc<AtomicBool>,
    timeout_counter: u32,
}

impl EventDispatcher {
    pub fn new(params: DispatchParams) -> Self {
        EventDispatcher {
            cfg: params.cfg,
            state: params.state,
            generator: params.generator,
            motion: params.motion,
            scanner: params.scanner,
            resetter: params.resetter,
            queue: params.queue,
            events: params.events,
            stop: params.stop,
            timeout_counter: 0,
        }
    }

    /// Drains the event queue until the scan finishes or the stop flag
    /// goes up. Returns whether the scan ran to completion.
    pub fn run(mut self) -> bool {
        info!("Dispatch worker running");
        let patience = self.cfg.signature_period * 3;
        let mut finished = false;

        while !self.stop.load(Ordering::SeqCst) {
            match self.queue.recv_timeout(patience) {
                Ok(DispatchMsg::Sentinel) => continue,
                Ok(DispatchMsg::Event(event)) => {
                    self.timeout_counter = 0;
                    if self.dispatch(event) {
                        finished = true;
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => self.handle_queue_timeout(),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    debug!("Event queue closed, dispatch worker exiting");
                    break;
                }
            }
        }

        if finished {
            info!("Scanned the whole defined area. Done!");
            self.stop.store(true, Ordering::SeqCst);
        }
        debug!("Dispatch worker stopped");
        finished
    }

    /// A healthy target emits a signature every period; a long silent
    /// stretch on the queue means it wedged without tripping any of the
    /// listener-side counters.
    fn handle_queue_timeout(&mut self) {
        self.timeout_counter += 1;
        if self.timeout_counter > QUEUE_TIMEOUTS_BEFORE_RESET {
            warn!("Event queue is empty for a long time. The target is probably stuck, resetting it.");
            let _ = self.resetter.reset();
            self.timeout_counter = 0;
        }
    }

    /// Routes one event. Returns true when the scan is complete.
    fn dispatch(&self, event: TargetEvent) -> bool {
        if self.cfg.show_uart {
            match event.keyword {
                Some(keyword) => info!("{} | {} {}", event.source, keyword, event.payload),
                None => info!("{} | {}", event.source, event.payload),
            }
        }

        let keyword = match event.keyword {
            Some(keyword) => keyword,
            None => {
                warn!("{} sent an unexpected keyword: {}", event.source, event.payload);
                return false;
            }
        };

        let outcome = match keyword {
            Keyword::Signature => self.on_signature(&event),
            Keyword::Message => self.on_message(&event.payload),
            Keyword::Digest => {
                self.on_expected_field("digest", self.cfg.expected_digest.as_ref(), &event.payload)
            }
            Keyword::PrivKeyN => self.on_expected_field(
                "private key modulus",
                self.cfg.expected_privkey_n.as_ref(),
                &event.payload,
            ),
            Keyword::PrivKeyD => self.on_expected_field(
                "private exponent",
                self.cfg.expected_privkey_d.as_ref(),
                &event.payload,
            ),
            Keyword::PubKeyN => self.on_expected_field(
                "public key modulus",
                self.cfg.expected_pubkey_n.as_ref(),
                &event.payload,
            ),
            Keyword::PubKeyE => self.on_expected_field(
                "public exponent",
                self.cfg.expected_pubkey_e.as_ref(),
                &event.payload,
            ),
            Keyword::Timings => self.on_timings(&event.payload),
            Keyword::Pause => self.on_pause(),
            Keyword::Alarm => self.on_alarm(&event),
        };

        match outcome {
            Ok(finished) => finished,
            Err(DeviceError::Stopped) => false,
            Err(DeviceError::Rejected { reason }) => {
                // Out-of-range parameter requests are logged and dropped,
                // the trial keeps running on the previous settings.
                error!("Parameter change rejected while handling {keyword}: {reason}");
                false
            }
            Err(err) => {
                error!("Handling {keyword} failed: {err}");
                self.recover_rig();
                false
            }
        }
    }

    /// The per-signature hot path: fault detection, progress, the
    /// staged pulse schedule, and the trial budget.
    fn on_signature(&self, event: &TargetEvent) -> DeviceResult<bool> {
        lock(&self.state).signatures_seen += 1;

        // A disarmed generator cannot fault anything. Skip the trial
        // bookkeeping but watch for a hold that never gets released.
        if !lock(&self.generator).is_enabled() {
            debug!("Generator is disarmed, skipping signature processing.");
            let stuck = {
                let mut st = lock(&self.state);
                st.signatures_while_disabled += 1;
                st.signatures_while_disabled > STUCK_HOLD_SIGNATURE_LIMIT
            };
            if stuck {
                error!(
                    "Generator stayed disarmed for over {} signatures. Releasing the most recent hold.",
                    STUCK_HOLD_SIGNATURE_LIMIT
                );
                lock(&self.generator).release_disable("disable_timeout")?;
            }
            return Ok(false);
        }
        lock(&self.state).signatures_while_disabled = 0;

        {
            let mut st = lock(&self.state);
            st.current_progress += 1;
            // With movement off the planned total is meaningless, so it
            // grows alongside and the bar just counts trials.
            if !self.cfg.allow_movement {
                st.total_progress += 1;
            }
            let _ = self.events.send(ExperimentEvent::Progress {
                current: st.current_progress,
                total: st.total_progress,
            });
        }

        let context = match &event.context {
            Some(ctx) => ctx.clone(),
            None => self.fresh_context(),
        };

        if !event.payload.eq_ignore_ascii_case(&self.cfg.valid_signature) {
            if event.payload.len() != self.cfg.valid_signature.len() {
                info!("Success: Found an invalid signature (non-equal length)!");
            } else {
                info!("Success: Found an invalid signature!");
            }
            info!("- {}", event.payload);

            // Re-read the stage so the fault is stored with live
            // coordinates rather than the planned cell.
            let position = lock(&self.motion).store_positions()?;
            let mut context = context;
            context.position = position;
            info!(
                "- Current position: {:.3}mm (X), {:.3}mm (Y), {:.3}mm (Z) | Measured: {}V",
                position.x, position.y, position.z, context.voltage_measured
            );

            let _ = self.events.send(ExperimentEvent::FaultConfirmed {
                position,
                voltage_set: context.voltage_set,
            });
            lock(&self.state).confirmed_faults.push(ConfirmedFault {
                signature: event.payload.clone(),
                context: context.clone(),
            });
            self.record_trial(TrialResult::Faulted, context);
        } else {
            self.record_trial(TrialResult::ValidSignature, context);
        }

        if (self.cfg.vary_voltage || self.cfg.vary_high_time)
            && self.cfg.tries_per_position >= SCHEDULE_MIN_TRIES
        {
            self.step_pulse_schedule()?;
        }

        let jog = {
            let st = lock(&self.state);
            st.tries_left <= 1 && self.cfg.allow_movement
        };
        if jog {
            debug!("Position done. Resetting the budget and moving to the next position.");
            return self.scanner.advance_position();
        }
        let mut st = lock(&self.state);
        st.tries_left = st.tries_left.saturating_sub(1);
        Ok(false)
    }

    /// Walks the three-stage schedule: one increment above the start
    /// value after a third of the budget, one below after two thirds.
    fn step_pulse_schedule(&self) -> DeviceResult<()> {
        let (stage, tries_left, baseline) = {
            let st = lock(&self.state);
            (st.schedule_stage, st.tries_left, st.voltage_baseline)
        };
        let remaining = f64::from(tries_left) / f64::from(self.cfg.tries_per_position);

        if stage == 0 && remaining <= 0.66 {
            info!("First 30% of tries at this position done. Adjusting voltage and/or high time.");
            let mut change = PulseChange::default();
            if self.cfg.vary_high_time {
                let start = scan::quantized_high_time_start(&self.cfg);
                change.high_time_ns = Some(scan::raised_high_time(start, &self.cfg));
            }
            if self.cfg.vary_voltage {
                change.voltage = Some(scan::raised_voltage(baseline, &self.cfg));
            }
            self.change_pulse(change)?;
            lock(&self.state).schedule_stage = 1;
        } else if stage == 1 && remaining <= 0.33 {
            info!("First 60% of tries at this position done. Adjusting voltage and/or high time.");
            let mut change = PulseChange::default();
            if self.cfg.vary_high_time {
                let start = scan::quantized_high_time_start(&self.cfg);
                change.high_time_ns = Some(scan::lowered_high_time(start, &self.cfg));
            }
            if self.cfg.vary_voltage {
                change.voltage = Some(scan::lowered_voltage(baseline, &self.cfg));
            }
            self.change_pulse(change)?;
            lock(&self.state).schedule_stage = 2;
        }
        Ok(())
    }

    fn change_pulse(&self, change: PulseChange) -> DeviceResult<()> {
        let outcome = lock(&self.generator).change(change, false)?;
        if outcome.voltage_changed {
            // A fresh voltage invalidates the unparseable statistics
            // collected at the old one.
            let mut st = lock(&self.state);
            st.unparseables_at_position = 0;
            st.recovery_attempts_at_position = 0;
        }
        Ok(())
    }

    fn on_message(&self, payload: &str) -> DeviceResult<bool> {
        if let Some(expected) = &self.cfg.expected_message_hex {
            if !payload.eq_ignore_ascii_case(expected) {
                error!("Target sent an unexpected message: {payload}");
            }
        }
        Ok(false)
    }

    /// Shared handler for the fixed fields the target echoes back
    /// (digest and the RSA key halves). A mismatch is worth flagging
    /// but never worth interrupting the scan for.
    fn on_expected_field(
        &self,
        what: &str,
        expected: Option<&String>,
        payload: &str,
    ) -> DeviceResult<bool> {
        if let Some(expected) = expected {
            if payload != expected.as_str() {
                error!("Target sent an unexpected {what}: {payload}");
            }
        }
        Ok(false)
    }

    /// Payload is `trigger_ms,duration_ns,sign_gen_ms`. The deltas are
    /// kept as a series for the end-of-run summary and attached to the
    /// trial they belong to.
    fn on_timings(&self, payload: &str) -> DeviceResult<bool> {
        let parts: Vec<&str> = payload.trim().split(',').collect();
        if parts.len() != 3 {
            error!("Invalid timing payload: {payload}");
            return Ok(false);
        }
        match (
            parts[0].trim().parse::<i64>(),
            parts[1].trim().parse::<i64>(),
            parts[2].trim().parse::<i64>(),
        ) {
            (Ok(trigger_ms), Ok(duration_ns), Ok(sign_gen_ms)) => {
                let between = sign_gen_ms - trigger_ms;
                let mut st = lock(&self.state);
                st.past_timings
                    .between_trigger_and_sign_gen_ms
                    .push(between);
                st.past_timings.trigger_duration_ns.push(duration_ns);
                if let Some(last) = st.trial_records.last_mut() {
                    last.between_trigger_and_sign_gen_ms = Some(between);
                    last.trigger_duration_ns = Some(duration_ns);
                }
            }
            _ => error!("Failed to parse timing payload: {payload}"),
        }
        Ok(false)
    }

    /// The target announces a long private-key operation. Nothing will
    /// arrive for a while, so this is the natural moment to flush
    /// results to disk.
    fn on_pause(&self) -> DeviceResult<bool> {
        info!("Target initiated a short break.");
        let _ = self.events.send(ExperimentEvent::Info(InfoEvent::Message(
            "Target paused itself, flushing results to disk".to_string(),
        )));
        self.export_and_checkpoint();
        Ok(false)
    }

    fn on_alarm(&self, event: &TargetEvent) -> DeviceResult<bool> {
        let payload = event.payload.trim();
        let alarms: Vec<String> = if payload.is_empty() {
            warn!("Target raised an alarm but sent no alarm names.");
            Vec::new()
        } else {
            debug!("Target raised alarms: {payload}");
            payload.split(',').map(|s| s.trim().to_string()).collect()
        };

        if alarms
            .first()
            .is_some_and(|first| first.contains("TEST_ALARM"))
        {
            info!("Ignoring test alarm.");
            return Ok(false);
        }

        let context = match &event.context {
            Some(ctx) => ctx.clone(),
            None => self.fresh_context(),
        };
        let _ = self.events.send(ExperimentEvent::AlarmConfirmed {
            alarms: alarms.clone(),
            position: context.position,
        });
        lock(&self.state)
            .confirmed_alarms
            .push(ConfirmedAlarm { alarms, context });
        Ok(false)
    }

    /// Context for events that arrived without a listener-side snapshot.
    fn fresh_context(&self) -> EventContext {
        let position = lock(&self.state).position;
        let (voltage_set, voltage_measured, pattern) = lock(&self.generator).context_snapshot();
        EventContext {
            position,
            time: storage::date_stamp(),
            voltage_set,
            voltage_measured,
            pattern,
        }
    }

    fn record_trial(&self, result: TrialResult, context: EventContext) {
        lock(&self.state).trial_records.push(TrialRecord {
            result,
            context,
            between_trigger_and_sign_gen_ms: None,
            trigger_duration_ns: None,
        });
    }

    fn export_and_checkpoint(&self) {
        let checkpoint = {
            let mut st = lock(&self.state);
            if let Err(err) = storage::export_trials(&self.cfg, &mut st.trial_records) {
                warn!("Failed to export parameters: {err}");
            }
            st.to_checkpoint(&self.cfg, storage::date_stamp())
        };
        if let Err(err) = storage::save_checkpoint(&self.cfg, &checkpoint) {
            warn!("Failed to save a checkpoint: {err}");
        }
    }

    /// Full-rig recovery after a handler error: target first, then the
    /// stage, then the generator. When even that fails the run is over
    /// and whatever was collected gets flushed.
    fn recover_rig(&self) {
        info!("Recovering the rig: target reset, axis self-heal, generator self-heal.");
        let result = self
            .resetter
            .reset()
            .and_then(|()| lock(&self.motion).selfheal_axes())
            .and_then(|()| lock(&self.generator).self_heal().map(|_| ()));
        match result {
            Ok(()) => {}
            Err(DeviceError::Stopped) => {}
            Err(err) => {
                error!("Rig recovery failed: {err}. Stopping the experiment.");
                self.export_and_checkpoint();
                self.stop.store(true, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::{sim_axis_map, SimDeviceHandle, SimPulseDevice};
    use crate::engine::target::{ResetLine, TargetShared};
    use crate::model::{EventSource, Position, ScanDirection};
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct CountingResetLine {
        triggers: Arc<Mutex<u32>>,
    }

    impl ResetLine for CountingResetLine {
        fn trigger(&mut self) -> DeviceResult<String> {
            *lock(&self.triggers) += 1;
            Ok("reset".to_string())
        }
    }

    struct Harness {
        dispatcher: EventDispatcher,
        device: SimDeviceHandle,
        state: Arc<Mutex<ExperimentState>>,
        generator: Arc<Mutex<GeneratorController>>,
        events_rx: UnboundedReceiver<ExperimentEvent>,
        resets: Arc<Mutex<u32>>,
        queue_tx: mpsc::Sender<DispatchMsg>,
        stop: Arc<AtomicBool>,
        cfg: Arc<ScanConfig>,
    }

    impl Harness {
        fn valid_signature(&self) -> TargetEvent {
            self.signature(self.cfg.valid_signature.as_str())
        }

        fn signature(&self, payload: &str) -> TargetEvent {
            TargetEvent {
                source: EventSource::Target,
                keyword: Some(Keyword::Signature),
                payload: payload.to_string(),
                context: None,
            }
        }

        fn keyword_event(&self, keyword: Keyword, payload: &str) -> TargetEvent {
            TargetEvent {
                source: EventSource::Target,
                keyword: Some(keyword),
                payload: payload.to_string(),
                context: None,
            }
        }

        fn saw_event(&mut self, matcher: impl Fn(&ExperimentEvent) -> bool) -> bool {
            let mut saw = false;
            while let Ok(event) = self.events_rx.try_recv() {
                if matcher(&event) {
                    saw = true;
                }
            }
            saw
        }
    }

    fn harness(mut cfg: ScanConfig) -> Harness {
        cfg.output_dir = std::env::temp_dir();
        cfg.run_basename = format!(
            "emfi-dispatch-{}-{:?}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
        );
        if cfg.valid_signature.is_empty() {
            cfg.valid_signature = "a94a8fe5ccb19ba6".to_string();
        }
        let cfg = Arc::new(cfg);

        let stop = Arc::new(AtomicBool::new(false));
        let (events, events_rx) = unbounded_channel();
        let (queue_tx, queue_rx) = mpsc::channel();

        let (device, handle) = SimPulseDevice::new();
        let generator = Arc::new(Mutex::new(
            GeneratorController::new(Box::new(device), &cfg, events.clone(), stop.clone())
                .unwrap(),
        ));
        // Production arms through the reset/banner flow; these tests
        // start from the armed steady state.
        lock(&generator).arm(true, "test").unwrap();

        let (factory, _axes) = sim_axis_map();
        let motion = Arc::new(Mutex::new(
            MotionController::new(factory, &cfg, stop.clone()).unwrap(),
        ));

        let state = Arc::new(Mutex::new(ExperimentState::new(&cfg)));
        let scanner = Scanner::new(
            cfg.clone(),
            state.clone(),
            motion.clone(),
            generator.clone(),
            events.clone(),
        );

        let shared = Arc::new(Mutex::new(TargetShared::new()));
        let resets = Arc::new(Mutex::new(0u32));
        let resetter = TargetResetter::new(
            shared,
            Box::new(CountingResetLine {
                triggers: resets.clone(),
            }),
            generator.clone(),
            events.clone(),
            false,
            stop.clone(),
        );

        let dispatcher = EventDispatcher::new(DispatchParams {
            cfg: cfg.clone(),
            state: state.clone(),
            generator: generator.clone(),
            motion,
            scanner,
            resetter,
            queue: queue_rx,
            events,
            stop: stop.clone(),
        });

        Harness {
            dispatcher,
            device: handle,
            state,
            generator,
            events_rx,
            resets,
            queue_tx,
            stop,
            cfg,
        }
    }

    #[test]
    fn valid_signature_consumes_one_try() {
        let h = harness(ScanConfig::baseline("disp-valid"));
        let event = h.valid_signature();

        assert!(!h.dispatcher.dispatch(event));

        let st = lock(&h.state);
        assert_eq!(st.signatures_seen, 1);
        assert_eq!(st.current_progress, 1);
        assert_eq!(st.tries_left, 299);
        assert!(st.confirmed_faults.is_empty());
        assert_eq!(st.trial_records.len(), 1);
        assert_eq!(st.trial_records[0].result, TrialResult::ValidSignature);
    }

    #[test]
    fn invalid_signature_is_recorded_as_a_fault() {
        let mut h = harness(ScanConfig::baseline("disp-fault"));
        let damaged = "ffffffffffffffff";
        assert_ne!(damaged, h.cfg.valid_signature);

        assert!(!h.dispatcher.dispatch(h.signature(damaged)));

        {
            let st = lock(&h.state);
            assert_eq!(st.confirmed_faults.len(), 1);
            assert_eq!(st.confirmed_faults[0].signature, damaged);
            assert_eq!(st.confirmed_faults[0].context.voltage_set, 280);
            assert_eq!(st.trial_records[0].result, TrialResult::Faulted);
        }
        assert!(h.saw_event(|e| matches!(e, ExperimentEvent::FaultConfirmed { .. })));
    }

    #[test]
    fn budget_exhaustion_jogs_to_the_next_cell() {
        let h = harness(ScanConfig::baseline("disp-jog"));
        {
            let mut st = lock(&h.state);
            st.position = Position {
                x: 10.0,
                y: 10.0,
                z: 5.0,
            };
            st.tries_left = 1;
        }

        assert!(!h.dispatcher.dispatch(h.valid_signature()));

        let st = lock(&h.state);
        assert_eq!(st.tries_left, 300);
        assert_eq!(st.position_counter, 1);
        assert!((st.position.x - 9.0).abs() < 1e-9);
        assert!((st.position.y - 10.0).abs() < 1e-9);
    }

    #[test]
    fn finishing_the_grid_reports_completion() {
        let h = harness(ScanConfig::baseline("disp-done"));
        {
            let mut st = lock(&h.state);
            // Last cell of the raster: right edge of the bottom row.
            st.position = Position {
                x: 0.0,
                y: 0.0,
                z: 5.0,
            };
            st.direction = ScanDirection::Right;
            st.tries_left = 1;
        }

        assert!(h.dispatcher.dispatch(h.valid_signature()));
    }

    #[test]
    fn schedule_raises_then_lowers_the_high_time() {
        let mut cfg = ScanConfig::baseline("disp-schedule");
        cfg.tries_per_position = 30;
        let h = harness(cfg);
        {
            let mut st = lock(&h.state);
            st.tries_left = 30;
        }

        // Twelve signatures in, 19/30 of the budget remains and the
        // first stage fires: 60 ns start steps up one slot.
        for _ in 0..12 {
            assert!(!h.dispatcher.dispatch(h.valid_signature()));
        }
        assert_eq!(lock(&h.state).schedule_stage, 1);
        assert_eq!(lock(&h.generator).settings().high_time_ns, 80);

        // Ten more and 9/30 remains: second stage steps below the start.
        for _ in 0..10 {
            assert!(!h.dispatcher.dispatch(h.valid_signature()));
        }
        assert_eq!(lock(&h.state).schedule_stage, 2);
        assert_eq!(lock(&h.generator).settings().high_time_ns, 40);
    }

    #[test]
    fn stuck_disable_hold_is_released_after_two_hundred_signatures() {
        let h = harness(ScanConfig::baseline("disp-stuck"));
        lock(&h.generator).request_disable("wedged").unwrap();
        assert!(!h.device.armed());

        for _ in 0..201 {
            assert!(!h.dispatcher.dispatch(h.valid_signature()));
        }

        {
            let gen = lock(&h.generator);
            assert!(gen.is_enabled());
            assert!(gen.disable_reasons().is_empty());
        }
        assert!(h.device.armed());
        let st = lock(&h.state);
        // Disarmed signatures are observed but never consume the budget.
        assert_eq!(st.signatures_seen, 201);
        assert_eq!(st.current_progress, 0);
        assert_eq!(st.tries_left, 300);
    }

    #[test]
    fn timings_annotate_the_last_trial() {
        let h = harness(ScanConfig::baseline("disp-timings"));
        assert!(!h.dispatcher.dispatch(h.valid_signature()));
        assert!(!h.dispatcher.dispatch(h.keyword_event(Keyword::Timings, "100,200,400")));

        let st = lock(&h.state);
        assert_eq!(st.past_timings.between_trigger_and_sign_gen_ms, vec![300]);
        assert_eq!(st.past_timings.trigger_duration_ns, vec![200]);
        assert_eq!(st.trial_records[0].between_trigger_and_sign_gen_ms, Some(300));
        assert_eq!(st.trial_records[0].trigger_duration_ns, Some(200));
    }

    #[test]
    fn malformed_timings_are_dropped() {
        let h = harness(ScanConfig::baseline("disp-badtimings"));
        assert!(!h.dispatcher.dispatch(h.keyword_event(Keyword::Timings, "1,2")));
        assert!(!h.dispatcher.dispatch(h.keyword_event(Keyword::Timings, "a,b,c")));

        let st = lock(&h.state);
        assert!(st.past_timings.between_trigger_and_sign_gen_ms.is_empty());
        assert!(st.past_timings.trigger_duration_ns.is_empty());
    }

    #[test]
    fn test_alarms_are_ignored_and_real_ones_recorded() {
        let mut h = harness(ScanConfig::baseline("disp-alarms"));
        assert!(!h
            .dispatcher
            .dispatch(h.keyword_event(Keyword::Alarm, "TEST_ALARM triggered, GLITCH_DETECTED")));
        assert!(lock(&h.state).confirmed_alarms.is_empty());

        assert!(!h
            .dispatcher
            .dispatch(h.keyword_event(Keyword::Alarm, "GLITCH_DETECTED, VOLT_SEC")));
        {
            let st = lock(&h.state);
            assert_eq!(st.confirmed_alarms.len(), 1);
            assert_eq!(st.confirmed_alarms[0].alarms, ["GLITCH_DETECTED", "VOLT_SEC"]);
        }
        assert!(h.saw_event(|e| matches!(e, ExperimentEvent::AlarmConfirmed { .. })));
    }

    #[test]
    fn pause_flushes_trials_and_writes_a_checkpoint() {
        let h = harness(ScanConfig::baseline("disp-pause"));
        assert!(!h.dispatcher.dispatch(h.valid_signature()));
        assert!(!h.dispatcher.dispatch(h.keyword_event(Keyword::Pause, "")));

        assert!(lock(&h.state).trial_records.is_empty());
        assert!(storage::checkpoint_path(&h.cfg).exists());
        let trials = std::fs::read_to_string(storage::trials_path(&h.cfg)).unwrap();
        assert!(trials.contains("valid_signature"));
    }

    #[test]
    fn keywordless_events_are_ignored() {
        let h = harness(ScanConfig::baseline("disp-nokeyword"));
        let event = TargetEvent {
            source: EventSource::Target,
            keyword: None,
            payload: "boot noise".to_string(),
            context: None,
        };

        assert!(!h.dispatcher.dispatch(event));
        let st = lock(&h.state);
        assert_eq!(st.signatures_seen, 0);
        assert!(st.trial_records.is_empty());
    }

    #[test]
    fn a_silent_queue_eventually_resets_the_target() {
        let mut cfg = ScanConfig::baseline("disp-silence");
        cfg.signature_period = Duration::from_millis(1);
        let h = harness(cfg);

        let stop = h.stop.clone();
        let resets = h.resets.clone();
        let queue_tx = h.queue_tx.clone();
        let worker = std::thread::spawn(move || h.dispatcher.run());

        std::thread::sleep(Duration::from_millis(2000));
        stop.store(true, Ordering::SeqCst);
        let _ = queue_tx.send(DispatchMsg::Sentinel);

        assert!(!worker.join().unwrap());
        assert!(*lock(&resets) >= 1);
    }
}
