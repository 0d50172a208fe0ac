//! Serial link to the device under test.
//!
//! A blocking listener reads `\r\n`-framed lines, classifies each one as
//! parseable or unparseable, and queues classified events for the
//! dispatch loop. Around that sits the operational state machine: reset
//! detection via the boot banner, a three-rung recovery ladder for
//! streaks of unparseable output, and the reset trigger line.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::engine::generator::GeneratorController;
use crate::engine::scan::Scanner;
use crate::engine::{lock, sleep_unless_stopping, ExperimentState};
use crate::error::{DeviceError, DeviceResult};
use crate::model::{
    DispatchMsg, EventContext, EventSource, ExperimentEvent, InfoEvent, Keyword, ScanConfig,
    TargetEvent, TargetOpState, TrialRecord, TrialResult,
};
use crate::storage;

/// Marker in front of the raw signature bytes, so a corrupted
/// transmission cannot masquerade as a signature.
pub const SIGNATURE_PREFIX: &[u8] = &[0x01, 0xFE, 0x01, 0xFE];

/// Line the target sends before taking a self-imposed break.
pub const PAUSE_MARKER: &str = "for 30sec";

const EMPTY_READS_BEFORE_RESET: u32 = 50;
const SERIAL_ERRORS_BEFORE_RESET: u32 = 10;
const UNPARSEABLE_STREAK_ESCALATION: u32 = 6;

/// The reset trigger board reboots when its port opens; it needs a
/// moment before it accepts commands.
const RESET_LINE_SETTLE: Duration = Duration::from_secs(3);
const RESET_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period between disarming the generator and pulling reset.
const RESET_HOLD_DELAY: Duration = Duration::from_secs(1);

/// Byte stream carrying the target's UART output.
pub trait TargetLink: Send {
    /// Reads one `\r\n`-terminated frame, capped at `max_len` bytes. An
    /// empty frame means the read timed out with nothing buffered.
    fn read_frame(&mut self, max_len: usize) -> DeviceResult<Vec<u8>>;
    fn switch_baud(&mut self, baud: u32) -> DeviceResult<()>;
    fn baud(&self) -> u32;
}

/// Real serial connection to the target UART.
pub struct SerialTargetLink {
    port_path: String,
    baud: u32,
    timeout: Duration,
    link: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTargetLink {
    pub fn open(
        port_path: impl Into<String>,
        baud: u32,
        timeout: Duration,
    ) -> DeviceResult<Self> {
        let mut link = SerialTargetLink {
            port_path: port_path.into(),
            baud,
            timeout,
            link: None,
        };
        link.open_port()?;
        Ok(link)
    }

    fn open_port(&mut self) -> DeviceResult<()> {
        let port = serialport::new(&self.port_path, self.baud)
            .timeout(self.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .open()?;
        self.link = Some(port);
        Ok(())
    }
}

impl TargetLink for SerialTargetLink {
    fn read_frame(&mut self, max_len: usize) -> DeviceResult<Vec<u8>> {
        if self.link.is_none() {
            self.open_port()?;
        }
        let port = match self.link.as_mut() {
            Some(port) => port,
            None => {
                return Err(DeviceError::needs_reconnect(
                    "target",
                    "serial port not open",
                ))
            }
        };

        let mut frame = BytesMut::with_capacity(max_len.min(512));
        let mut byte = [0u8; 1];
        loop {
            match port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    frame.extend_from_slice(&byte);
                    if frame.ends_with(b"\r\n") || frame.len() >= max_len {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(frame.to_vec())
    }

    fn switch_baud(&mut self, baud: u32) -> DeviceResult<()> {
        self.link = None;
        self.baud = baud;
        self.open_port()
    }

    fn baud(&self) -> u32 {
        self.baud
    }
}

/// Out-of-band line that power-cycles the target.
pub trait ResetLine: Send {
    /// Issues the reset command and returns the board's reply.
    fn trigger(&mut self) -> DeviceResult<String>;
}

/// Reset trigger board on its own serial port. The port is opened fresh
/// for every reset; the board resets the target on command `reset` and
/// echoes the command back as acknowledgement.
pub struct SerialResetLine {
    port_path: String,
    baud: u32,
    stop: Arc<AtomicBool>,
}

impl SerialResetLine {
    pub fn new(port_path: impl Into<String>, baud: u32, stop: Arc<AtomicBool>) -> Self {
        SerialResetLine {
            port_path: port_path.into(),
            baud,
            stop,
        }
    }
}

impl ResetLine for SerialResetLine {
    fn trigger(&mut self) -> DeviceResult<String> {
        let mut port = serialport::new(&self.port_path, self.baud)
            .timeout(RESET_REPLY_TIMEOUT)
            .open()?;
        sleep_unless_stopping(&self.stop, RESET_LINE_SETTLE);
        if self.stop.load(Ordering::SeqCst) {
            return Err(DeviceError::Stopped);
        }

        port.write_all(b"reset\n")?;

        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    reply.push(byte[0]);
                    if reply.len() > 128 {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(DeviceError::Timeout {
                        what: "reset acknowledgement",
                        after: RESET_REPLY_TIMEOUT,
                    })
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(String::from_utf8_lossy(&reply).trim().to_string())
    }
}

/// Target state shared between the listener and the dispatch worker,
/// which can also trigger resets.
#[derive(Debug)]
pub struct TargetShared {
    pub op_state: TargetOpState,
    pub time_last_reset: Option<Instant>,
}

impl TargetShared {
    pub fn new() -> Self {
        TargetShared {
            op_state: TargetOpState::Normal,
            time_last_reset: None,
        }
    }
}

impl Default for TargetShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Issues target resets. While a reset is pending the generator is held
/// disarmed under the `target_reset` reason; the listener releases the
/// hold once the boot banner completes.
#[derive(Clone)]
pub struct TargetResetter {
    shared: Arc<Mutex<TargetShared>>,
    line: Arc<Mutex<Box<dyn ResetLine>>>,
    generator: Arc<Mutex<GeneratorController>>,
    events: UnboundedSender<ExperimentEvent>,
    show_uart: bool,
    stop: Arc<AtomicBool>,
}

impl TargetResetter {
    pub fn new(
        shared: Arc<Mutex<TargetShared>>,
        line: Box<dyn ResetLine>,
        generator: Arc<Mutex<GeneratorController>>,
        events: UnboundedSender<ExperimentEvent>,
        show_uart: bool,
        stop: Arc<AtomicBool>,
    ) -> Self {
        TargetResetter {
            shared,
            line: Arc::new(Mutex::new(line)),
            generator,
            events,
            show_uart,
            stop,
        }
    }

    pub fn reset(&self) -> DeviceResult<()> {
        match self.try_reset() {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("Failed to reset target: {err}");
                if let Err(release_err) = lock(&self.generator).release_disable("target_reset") {
                    warn!("Could not release the reset hold: {release_err}");
                }
                Err(err)
            }
        }
    }

    fn try_reset(&self) -> DeviceResult<()> {
        lock(&self.shared).time_last_reset = Some(Instant::now());

        lock(&self.generator).request_disable("target_reset")?;
        sleep_unless_stopping(&self.stop, RESET_HOLD_DELAY);
        if self.stop.load(Ordering::SeqCst) {
            return Err(DeviceError::Stopped);
        }

        let second = {
            let mut sh = lock(&self.shared);
            // A second reset that was already announced stays a second
            // reset, so the give-up path can eventually be reached.
            sh.op_state = match sh.op_state {
                TargetOpState::AfterFirstReset | TargetOpState::StartedSecondReset => {
                    TargetOpState::StartedSecondReset
                }
                _ => TargetOpState::StartedFirstReset,
            };
            debug!("Reset changed the target state to {:?}", sh.op_state);
            sh.op_state == TargetOpState::StartedSecondReset
        };
        let _ = self
            .events
            .send(ExperimentEvent::Info(InfoEvent::TargetResetting {
                second,
            }));

        let reply = lock(&self.line).trigger()?;
        if self.show_uart {
            info!("RESET | {reply}");
        }
        if reply == "reset" {
            info!("Reset line reports that it will reset the target now.");
            Ok(())
        } else {
            Err(DeviceError::Protocol(format!(
                "reset line replied {reply:?}"
            )))
        }
    }
}

/// Splits trimmed banner lines into the head set (reset detection) and
/// the tail set (reset completion).
pub fn banner_sets(lines: &[String], head: usize, tail: usize) -> (HashSet<String>, HashSet<String>) {
    let head_set = lines.iter().take(head).cloned().collect();
    let tail_set = lines[lines.len().saturating_sub(tail)..]
        .iter()
        .cloned()
        .collect();
    (head_set, tail_set)
}

/// Reads the banner file and returns its non-empty trimmed lines.
pub fn load_banner_lines(path: &std::path::Path) -> std::io::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Splits target output into parseable and unparseable lines.
///
/// A frame containing the signature prefix is always parseable: the
/// remainder is hex-encoded with the trailing CR-LF stripped. Anything
/// else is decoded as text and accepted only if it looks like a known
/// protocol shape.
pub struct LineClassifier {
    alarm_names: Vec<String>,
    signature_len: usize,
    /// Expected hex payload lengths used by the fuzzy shape check.
    hex_field_lengths: Vec<usize>,
}

impl LineClassifier {
    pub fn from_config(cfg: &ScanConfig) -> Self {
        let mut hex_field_lengths = Vec::new();
        for field in [
            &cfg.expected_message_hex,
            &cfg.expected_digest,
            &cfg.expected_privkey_n,
            &cfg.expected_privkey_d,
            &cfg.expected_pubkey_n,
            &cfg.expected_pubkey_e,
        ] {
            if let Some(value) = field {
                hex_field_lengths.push(value.len());
            }
        }
        LineClassifier {
            alarm_names: cfg.alarm_names.clone(),
            signature_len: cfg.valid_signature.len(),
            hex_field_lengths,
        }
    }

    /// Classifies one raw frame. Returns `(parseable, text)`.
    pub fn classify(&self, frame: &[u8]) -> (bool, String) {
        if let Some(at) = find_prefix(frame) {
            debug!("Found prefix, assuming signature ({:02x?}...)", &frame[..frame.len().min(8)]);
            let mut text = hex_string(&frame[at + SIGNATURE_PREFIX.len()..]);
            if let Some(stripped) = text.strip_suffix("0d0a") {
                text.truncate(stripped.len());
            }
            let text = text.trim().to_string();
            return (true, text);
        }

        debug!("Found no prefix, assuming an encoded string ({:02x?}...)", &frame[..frame.len().min(8)]);
        let text = String::from_utf8_lossy(frame);
        let text = text.trim_end_matches(['\r', '\n']).trim().to_string();
        if text.is_empty() {
            return (false, text);
        }

        let parseable = Keyword::from_line(&text).is_some()
            || Self::is_timings(&text)
            || self.is_alarm(&text)
            || text == PAUSE_MARKER
            || self
                .hex_field_lengths
                .iter()
                .any(|&len| looks_like_hex_field(&text, len));
        (parseable, text)
    }

    /// A timing report is three comma-separated integers.
    pub fn is_timings(s: &str) -> bool {
        let parts: Vec<&str> = s.split(',').collect();
        parts.len() == 3
            && parts.iter().all(|part| {
                let part = part.trim();
                !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
            })
    }

    pub fn is_alarm(&self, s: &str) -> bool {
        self.alarm_names.iter().any(|alarm| s.contains(alarm))
    }

    /// A keyword-less line that still has the size and shape of the
    /// reference signature.
    pub fn is_signature_shaped(&self, s: &str) -> bool {
        looks_like_hex_field(s, self.signature_len)
    }
}

/// Length within max(1, 10%) of the expected length and no more than
/// max(1, 40% of the line) non-hex characters. A faulted line may be
/// garbled, yet still needs to be recognizable as the field it was.
pub fn looks_like_hex_field(s: &str, expected_len: usize) -> bool {
    let invalid = s
        .chars()
        .filter(|c| !matches!(c, '0'..='9' | 'a'..='f'))
        .count();
    let length_diff = s.len().abs_diff(expected_len);

    let max_length_diff = (expected_len as f64 * 0.1).max(1.0);
    let max_invalid = (s.len() as f64 * 0.4).max(1.0);

    !(length_diff as f64 > max_length_diff || invalid as f64 > max_invalid)
}

fn find_prefix(frame: &[u8]) -> Option<usize> {
    frame
        .windows(SIGNATURE_PREFIX.len())
        .position(|window| window == SIGNATURE_PREFIX)
}

fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn excerpt(s: &str) -> String {
    s.chars().take(10).collect()
}

pub struct MonitorParams {
    pub cfg: Arc<ScanConfig>,
    pub link: Box<dyn TargetLink>,
    pub resetter: TargetResetter,
    pub shared: Arc<Mutex<TargetShared>>,
    pub state: Arc<Mutex<ExperimentState>>,
    pub generator: Arc<Mutex<GeneratorController>>,
    pub scanner: Scanner,
    pub queue: mpsc::Sender<DispatchMsg>,
    pub events: UnboundedSender<ExperimentEvent>,
    pub stop: Arc<AtomicBool>,
}

/// Listener over the target UART. Owns the serial link and the
/// line-level protocol state; shares the operational state with the
/// dispatch worker through [`TargetShared`].
pub struct TargetMonitor {
    cfg: Arc<ScanConfig>,
    classifier: LineClassifier,
    link: Box<dyn TargetLink>,
    resetter: TargetResetter,
    shared: Arc<Mutex<TargetShared>>,
    state: Arc<Mutex<ExperimentState>>,
    generator: Arc<Mutex<GeneratorController>>,
    scanner: Scanner,
    queue: mpsc::Sender<DispatchMsg>,
    events: UnboundedSender<ExperimentEvent>,
    stop: Arc<AtomicBool>,

    buffered_keyword: Option<Keyword>,
    banner_provided: bool,
    banner_head: HashSet<String>,
    banner_tail: HashSet<String>,
    max_frame_len: usize,
    empty_reads: u32,
    serial_errors: u32,
    scratch_path: PathBuf,
}

impl TargetMonitor {
    pub fn new(params: MonitorParams) -> Self {
        let MonitorParams {
            cfg,
            link,
            resetter,
            shared,
            state,
            generator,
            scanner,
            queue,
            events,
            stop,
        } = params;

        let (banner_provided, banner_head, banner_tail) = match &cfg.banner_file {
            Some(path) => match load_banner_lines(path) {
                Ok(lines) => {
                    let (head, tail) =
                        banner_sets(&lines, cfg.banner_head_lines, cfg.banner_tail_lines);
                    (true, head, tail)
                }
                // Startup validation already warned about this.
                Err(_) => (false, HashSet::new(), HashSet::new()),
            },
            None => (false, HashSet::new(), HashSet::new()),
        };

        let classifier = LineClassifier::from_config(&cfg);
        // A frame is at most twice the raw signature length, which
        // equals the signature's hex length in bytes.
        let max_frame_len = (cfg.valid_signature.len() / 2).max(1) * 2;
        let scratch_path = storage::unparseable_path(&cfg);

        TargetMonitor {
            cfg,
            classifier,
            link,
            resetter,
            shared,
            state,
            generator,
            scanner,
            queue,
            events,
            stop,
            buffered_keyword: None,
            banner_provided,
            banner_head,
            banner_tail,
            max_frame_len,
            empty_reads: 0,
            serial_errors: 0,
            scratch_path,
        }
    }

    /// Blocking listener loop. Returns once the stop flag is raised.
    pub fn listen(mut self) {
        info!("Target listener running");
        while !self.stop.load(Ordering::SeqCst) {
            self.poll_once();
        }
        debug!("Target listener stopped");
    }

    fn poll_once(&mut self) {
        match self.link.read_frame(self.max_frame_len) {
            Ok(frame) if frame.is_empty() => self.handle_empty_read(),
            Ok(frame) => {
                self.empty_reads = 0;
                let (parseable, text) = self.classifier.classify(&frame);
                self.process_line(parseable, &text, &frame);
                self.serial_errors = 0;
            }
            Err(err) => self.handle_serial_error(&err),
        }
    }

    fn process_line(&mut self, parseable: bool, text: &str, raw: &[u8]) {
        if self.handle_reset_state(text) {
            return;
        }

        if self.banner_provided {
            if self.detect_target_reset(text) {
                return;
            }
        } else {
            let mut sh = lock(&self.shared);
            // Without a banner the first line after a triggered reset is
            // taken as the boot starting.
            let started = matches!(
                sh.op_state,
                TargetOpState::StartedFirstReset | TargetOpState::StartedSecondReset
            );
            if started {
                if sh.time_last_reset.is_none() {
                    sh.time_last_reset = Some(Instant::now());
                }
                sh.op_state = if sh.op_state == TargetOpState::StartedFirstReset {
                    TargetOpState::InFirstReset
                } else {
                    TargetOpState::InSecondReset
                };
                return;
            }
        }

        if parseable {
            self.handle_parseable(text);
        } else {
            self.handle_unparseable(text, raw);
        }

        self.update_state_machine(parseable);
        self.recover_state_machine(parseable, text);
    }

    /// Consumes banner output while a reset is in progress. Completion
    /// is a banner-tail line, or the reset timeout when no banner can
    /// tell us more.
    fn handle_reset_state(&mut self, text: &str) -> bool {
        if !lock(&self.shared).op_state.in_reset() {
            return false;
        }

        let trimmed = text.trim();
        let complete = {
            let mut sh = lock(&self.shared);
            if sh.time_last_reset.is_none() {
                warn!("Target state indicates a reset but its start time is unknown. Using the current time.");
                sh.time_last_reset = Some(Instant::now());
            }
            let elapsed = sh
                .time_last_reset
                .map(|at| at.elapsed())
                .unwrap_or_default();
            (self.banner_provided && self.banner_tail.contains(trimmed))
                || elapsed > self.cfg.reset_timeout
        };

        if complete {
            self.complete_reset(trimmed);
        } else if !self.banner_provided {
            // No banner to watch for; just wait the reset out.
            sleep_unless_stopping(&self.stop, self.cfg.reset_timeout);
        }

        if self.cfg.show_uart {
            info!("TARGET | Reset: {text}");
        }
        true
    }

    fn complete_reset(&mut self, trimmed: &str) {
        let new_state = {
            let mut sh = lock(&self.shared);
            sh.time_last_reset = None;
            sh.op_state = if sh.op_state == TargetOpState::InFirstReset {
                TargetOpState::AfterFirstReset
            } else {
                TargetOpState::AfterSecondReset
            };
            sh.op_state
        };

        {
            let mut generator = lock(&self.generator);
            if generator
                .disable_reasons()
                .iter()
                .any(|reason| reason == "target_reset")
            {
                if let Err(err) = generator.release_disable("target_reset") {
                    warn!("Could not release the reset hold: {err}");
                }
            }
        }

        if self.banner_provided && self.banner_tail.contains(trimmed) {
            debug!("Detected end of reset based on line: {trimmed}");
        } else if new_state != TargetOpState::AfterSecondReset {
            warn!("Reset timeout reached. Resetting again...");
            lock(&self.shared).op_state = TargetOpState::StartedSecondReset;
            let _ = self.resetter.reset();
        } else {
            warn!("Reset timeout reached. Continuing anyway...");
        }
    }

    /// Watches for banner-head lines announcing a (re)boot.
    fn detect_target_reset(&mut self, text: &str) -> bool {
        let trimmed = text.trim();
        if !self.banner_provided || !self.banner_head.contains(trimmed) {
            return false;
        }

        let unexpected = {
            let mut sh = lock(&self.shared);
            match sh.op_state {
                TargetOpState::StartedFirstReset => {
                    sh.op_state = TargetOpState::InFirstReset;
                    None
                }
                TargetOpState::StartedSecondReset => {
                    sh.op_state = TargetOpState::InSecondReset;
                    None
                }
                other => {
                    sh.op_state = TargetOpState::InFirstReset;
                    Some(other)
                }
            }
        };
        if let Some(prior) = unexpected {
            warn!("Target reset detected without us triggering it! {prior:?} -> InFirstReset");
            self.record_trial(TrialResult::ResetDetected);
        }

        debug!("Detected reset of target based on line: {trimmed}");
        if self.cfg.show_uart {
            info!("TARGET | Reset: {text}");
        }
        true
    }

    fn handle_parseable(&mut self, text: &str) {
        let trimmed = text.trim();

        if let Some(buffered) = self.buffered_keyword.take() {
            if !trimmed.is_empty() && Keyword::from_line(trimmed).is_some() {
                debug!(
                    "Received keyword twice in succession ({trimmed}, buffered: {buffered}). Ignoring."
                );
            } else {
                let context = match buffered {
                    Keyword::Signature | Keyword::Alarm => Some(self.context_snapshot()),
                    _ => None,
                };
                self.enqueue(Some(buffered), text, context);
            }
            return;
        }

        if let Some(keyword) = Keyword::from_line(trimmed) {
            self.buffered_keyword = Some(keyword);
        } else if LineClassifier::is_timings(text) {
            info!(
                "Received no keyword but asserted that the payload must be timings: {}...",
                excerpt(text)
            );
            self.enqueue(Some(Keyword::Timings), text, None);
        } else if self.classifier.is_alarm(text) {
            info!(
                "Received no keyword but asserted that the payload must be an alarm: {}...",
                excerpt(text)
            );
            self.enqueue(Some(Keyword::Alarm), text, None);
        } else if text == PAUSE_MARKER {
            info!(
                "Received no keyword but asserted that target initiated a pause: {}...",
                excerpt(text)
            );
            self.enqueue(Some(Keyword::Pause), text, None);
        } else if self.classifier.is_signature_shaped(text) {
            info!(
                "Received no keyword but asserted that the payload must be a signature: {}...",
                excerpt(text)
            );
            let context = Some(self.context_snapshot());
            self.enqueue(Some(Keyword::Signature), text, context);
        } else {
            debug!("Received parseable line with no prior keyword: {text}");
            self.enqueue(None, text, None);
        }
    }

    fn handle_unparseable(&mut self, text: &str, raw: &[u8]) {
        let op_state = lock(&self.shared).op_state;

        let in_a_row = {
            let mut st = lock(&self.state);
            st.unparseables_total += 1;
            st.unparseables_at_position += 1;
            st.unparseables_in_a_row += 1;
            st.unparseables_in_a_row
        };

        if op_state != TargetOpState::Normal && op_state != TargetOpState::FirstUnparseable {
            debug!("Received unparseable signature while in state {op_state:?}. Will not store it.");
        } else {
            debug!("Received unparseable signature: {text} | {raw:02x?}");
            let (current, total) = {
                let st = lock(&self.state);
                (st.current_progress, st.total_progress)
            };
            if let Err(err) = storage::append_unparseable(&self.scratch_path, current, total, raw)
            {
                warn!("Failed to save unparseable signature: {err}");
            }
        }

        if in_a_row >= UNPARSEABLE_STREAK_ESCALATION {
            self.escalate_unparseables(in_a_row);
        }

        match self.scanner.reduce_voltage_or_advance() {
            Ok(true) => {
                info!("Scan complete after abandoning the final position.");
                self.stop.store(true, Ordering::SeqCst);
            }
            Ok(false) => {}
            Err(DeviceError::Stopped) => {}
            Err(err) => error!("Voltage reduction failed: {err}"),
        }
    }

    /// Recovery ladder for a streak of unparseable lines: try the
    /// fallback baud rate, then stop pulsing, then reset the target.
    fn escalate_unparseables(&mut self, in_a_row: u32) {
        let attempts = lock(&self.state).recovery_attempts_at_position;

        match attempts {
            0 => {
                if let Some(fallback) = self.cfg.fallback_baud {
                    if !self.cfg.dry_run && self.link.baud() == self.cfg.primary_baud {
                        info!("Switching to alternative baudrate {fallback} for UART");
                        match self.link.switch_baud(fallback) {
                            Ok(()) => {
                                lock(&self.shared).op_state = TargetOpState::TryingBaudrates;
                                let _ = self.events.send(ExperimentEvent::Info(
                                    InfoEvent::BaudFallback { baud: fallback },
                                ));
                            }
                            Err(err) => warn!("Could not switch baudrate: {err}"),
                        }
                    }
                }
            }
            1 => {
                if self.link.baud() != self.cfg.primary_baud {
                    if let Err(err) = self.link.switch_baud(self.cfg.primary_baud) {
                        warn!("Could not restore primary baudrate: {err}");
                    }
                }
                info!("Received {in_a_row} unparseable messages. Disabling the pulse generator.");
                lock(&self.shared).op_state = TargetOpState::CsDisabled;
                if let Err(err) =
                    lock(&self.generator).request_disable("unparseable_signature_check")
                {
                    warn!("Could not hold the generator disabled: {err}");
                }
            }
            _ => {
                info!("Unparseable messages persist. Resetting target.");
                self.relabel_last_trial(TrialResult::ResetRequired);
                let _ = self.resetter.reset();
            }
        }

        let mut st = lock(&self.state);
        if st.recovery_attempts_at_position >= 2 {
            drop(st);
            self.relabel_last_trial(TrialResult::Unresolved);
            lock(&self.state).recovery_attempts_at_position = 0;
        } else {
            st.recovery_attempts_at_position += 1;
        }
    }

    fn update_state_machine(&mut self, parseable: bool) {
        let op_state = lock(&self.shared).op_state;
        let at_position = lock(&self.state).unparseables_at_position;
        let auto = self.cfg.auto_reset_target;

        match op_state {
            TargetOpState::Normal => {
                if !parseable {
                    lock(&self.shared).op_state = TargetOpState::FirstUnparseable;
                    info!("Received the first of potentially many unparseable signatures");
                    self.record_trial(TrialResult::FirstUnparseable);
                }
            }
            TargetOpState::FirstUnparseable if at_position >= 3 && auto => {
                if parseable {
                    self.relabel_last_trial(TrialResult::SingleUnparseable);
                }
            }
            TargetOpState::TryingBaudrates if at_position >= 6 && auto => {
                if parseable {
                    debug!("Successfully received a parseable message after switching baudrate.");
                    self.relabel_last_trial(TrialResult::ChangedBaudrate);
                }
            }
            TargetOpState::CsDisabled if at_position >= 9 && auto => {
                if parseable {
                    self.relabel_last_trial(TrialResult::UnparseableWhileFaulting);
                }
            }
            _ => {}
        }
    }

    /// Any parseable line means the link works again: back to normal,
    /// ladder holds released.
    fn recover_state_machine(&mut self, parseable: bool, text: &str) {
        if !parseable {
            return;
        }
        let old_state = {
            let mut sh = lock(&self.shared);
            if sh.op_state == TargetOpState::Normal {
                return;
            }
            let old = sh.op_state;
            sh.op_state = TargetOpState::Normal;
            old
        };

        info!("Resuming normal operations as parseable message was received");
        debug!("Message that changed state: {text}");
        lock(&self.state).unparseables_in_a_row = 0;

        if old_state != TargetOpState::FirstUnparseable && self.cfg.auto_reset_target {
            let mut generator = lock(&self.generator);
            if generator
                .disable_reasons()
                .iter()
                .any(|reason| reason == "unparseable_signature_check")
            {
                if let Err(err) = generator.release_disable("unparseable_signature_check") {
                    warn!("Could not release the unparseable hold: {err}");
                }
            }
        }
    }

    fn handle_empty_read(&mut self) {
        self.empty_reads += 1;
        if self.empty_reads > EMPTY_READS_BEFORE_RESET {
            warn!("Received {} empty lines. Resetting target.", self.empty_reads);
            let _ = self.resetter.reset();
            self.empty_reads = 0;
        }
    }

    fn handle_serial_error(&mut self, err: &DeviceError) {
        error!("Serial error on target link: {err}");
        self.serial_errors += 1;
        if self.serial_errors > SERIAL_ERRORS_BEFORE_RESET {
            self.handle_critical_error();
        }
    }

    fn handle_critical_error(&mut self) {
        error!("More than {SERIAL_ERRORS_BEFORE_RESET} serial errors. Resetting target...");
        if self.resetter.reset().is_err() {
            error!("Critical error handling failed. Stopping the experiment.");
            self.stop.store(true, Ordering::SeqCst);
        }
        self.serial_errors = 0;
    }

    fn context_snapshot(&self) -> EventContext {
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

    fn record_trial(&self, result: TrialResult) {
        let context = self.context_snapshot();
        lock(&self.state).trial_records.push(TrialRecord {
            result,
            context,
            between_trigger_and_sign_gen_ms: None,
            trigger_duration_ns: None,
        });
    }

    fn relabel_last_trial(&self, result: TrialResult) {
        let mut st = lock(&self.state);
        match st.trial_records.last_mut() {
            Some(last) => last.result = result,
            None => warn!("Tried to relabel the last trial but none are recorded yet."),
        }
    }

    fn enqueue(&self, keyword: Option<Keyword>, payload: &str, context: Option<EventContext>) {
        let event = TargetEvent {
            source: EventSource::Target,
            keyword,
            payload: payload.to_string(),
            context,
        };
        if self.queue.send(DispatchMsg::Event(event)).is_err() {
            debug!("Dispatch queue closed; dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::motion::MotionController;
    use crate::engine::sim::{sim_axis_map, SimDeviceHandle, SimPulseDevice};
    use std::collections::VecDeque;
    use tokio::sync::mpsc::unbounded_channel;

    struct ScriptedLink {
        frames: Arc<Mutex<VecDeque<Vec<u8>>>>,
        bauds: Arc<Mutex<Vec<u32>>>,
        baud: u32,
    }

    impl TargetLink for ScriptedLink {
        fn read_frame(&mut self, _max_len: usize) -> DeviceResult<Vec<u8>> {
            Ok(lock(&self.frames).pop_front().unwrap_or_default())
        }

        fn switch_baud(&mut self, baud: u32) -> DeviceResult<()> {
            self.baud = baud;
            lock(&self.bauds).push(baud);
            Ok(())
        }

        fn baud(&self) -> u32 {
            self.baud
        }
    }

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
        monitor: TargetMonitor,
        device: SimDeviceHandle,
        shared: Arc<Mutex<TargetShared>>,
        state: Arc<Mutex<ExperimentState>>,
        generator: Arc<Mutex<GeneratorController>>,
        queue_rx: mpsc::Receiver<DispatchMsg>,
        resets: Arc<Mutex<u32>>,
        bauds: Arc<Mutex<Vec<u32>>>,
        frames: Arc<Mutex<VecDeque<Vec<u8>>>>,
    }

    impl Harness {
        fn drain(&mut self, frames: usize) {
            for _ in 0..frames {
                self.monitor.poll_once();
            }
        }
    }

    fn harness(mut cfg: ScanConfig) -> Harness {
        cfg.output_dir = std::env::temp_dir();
        cfg.run_basename = format!(
            "emfi-test-{}-{:?}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
        );
        let cfg = Arc::new(cfg);

        let stop = Arc::new(AtomicBool::new(false));
        let (events, _events_rx) = unbounded_channel();
        let (queue_tx, queue_rx) = mpsc::channel();

        let (device, handle) = SimPulseDevice::new();
        let generator = Arc::new(Mutex::new(
            GeneratorController::new(Box::new(device), &cfg, events.clone(), stop.clone())
                .unwrap(),
        ));

        let (factory, _axes) = sim_axis_map();
        let motion = Arc::new(Mutex::new(
            MotionController::new(factory, &cfg, stop.clone()).unwrap(),
        ));

        let state = Arc::new(Mutex::new(ExperimentState::new(&cfg)));
        let scanner = Scanner::new(
            cfg.clone(),
            state.clone(),
            motion,
            generator.clone(),
            events.clone(),
        );

        let shared = Arc::new(Mutex::new(TargetShared::new()));
        let resets = Arc::new(Mutex::new(0u32));
        let resetter = TargetResetter::new(
            shared.clone(),
            Box::new(CountingResetLine {
                triggers: resets.clone(),
            }),
            generator.clone(),
            events.clone(),
            false,
            stop.clone(),
        );

        let frames = Arc::new(Mutex::new(VecDeque::new()));
        let bauds = Arc::new(Mutex::new(Vec::new()));
        let link = ScriptedLink {
            frames: frames.clone(),
            bauds: bauds.clone(),
            baud: cfg.primary_baud,
        };

        let monitor = TargetMonitor::new(MonitorParams {
            cfg,
            link: Box::new(link),
            resetter,
            shared: shared.clone(),
            state: state.clone(),
            generator: generator.clone(),
            scanner,
            queue: queue_tx,
            events,
            stop,
        });

        Harness {
            monitor,
            device: handle,
            shared,
            state,
            generator,
            queue_rx,
            resets,
            bauds,
            frames,
        }
    }

    fn push_frame(h: &Harness, frame: &[u8]) {
        lock(&h.frames).push_back(frame.to_vec());
    }

    fn garbage_frame() -> Vec<u8> {
        // Wrong length, binary junk, no prefix.
        vec![0x7f, 0x33, 0x99, 0x42, 0x0d, 0x0a]
    }

    fn cfg_with_signature() -> ScanConfig {
        let mut cfg = ScanConfig::baseline("testchip");
        cfg.valid_signature = "a1b2c3d4e5f60718".to_string();
        cfg
    }

    #[test]
    fn prefix_frame_classifies_as_signature() {
        let cfg = cfg_with_signature();
        let classifier = LineClassifier::from_config(&cfg);

        let mut frame = SIGNATURE_PREFIX.to_vec();
        frame.extend_from_slice(&[0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6, 0x07, 0x18]);
        frame.extend_from_slice(b"\r\n");

        let (parseable, text) = classifier.classify(&frame);
        assert!(parseable);
        assert_eq!(text, cfg.valid_signature);
    }

    #[test]
    fn prefix_is_found_mid_frame() {
        let cfg = cfg_with_signature();
        let classifier = LineClassifier::from_config(&cfg);

        let mut frame = vec![0x55, 0xaa];
        frame.extend_from_slice(SIGNATURE_PREFIX);
        frame.extend_from_slice(&[0xde, 0xad]);

        let (parseable, text) = classifier.classify(&frame);
        assert!(parseable);
        assert_eq!(text, "dead");
    }

    #[test]
    fn corrupted_same_length_signature_still_parses() {
        let cfg = cfg_with_signature();
        let classifier = LineClassifier::from_config(&cfg);

        let mut frame = SIGNATURE_PREFIX.to_vec();
        frame.extend_from_slice(&[0xff; 8]);
        frame.extend_from_slice(b"\r\n");

        let (parseable, text) = classifier.classify(&frame);
        assert!(parseable);
        assert_ne!(text, cfg.valid_signature);
        assert_eq!(text.len(), cfg.valid_signature.len());
    }

    #[test]
    fn text_lines_classify_by_shape() {
        let cfg = cfg_with_signature();
        let classifier = LineClassifier::from_config(&cfg);

        assert!(classifier.classify(b"Signature:\r\n").0);
        assert!(classifier.classify(b"123,456,789\r\n").0);
        assert!(classifier.classify(b"ALARM_GLITCH_DETECTED triggered\r\n").0);
        assert!(classifier.classify(b"for 30sec\r\n").0);
        assert!(!classifier.classify(b"hello world\r\n").0);
        assert!(!classifier.classify(b"\r\n").0);
    }

    #[test]
    fn grossly_wrong_length_is_unparseable() {
        let cfg = cfg_with_signature();
        let classifier = LineClassifier::from_config(&cfg);
        let (parseable, _) = classifier.classify(&garbage_frame());
        assert!(!parseable);
    }

    #[test]
    fn fuzzy_hex_tolerates_small_damage_only() {
        // Expected length 16: one char off is fine, three is not.
        assert!(looks_like_hex_field("a1b2c3d4e5f6071", 16));
        assert!(!looks_like_hex_field("a1b2c3d4e5f60", 16));
        // Uppercase counts as damage.
        assert!(looks_like_hex_field("A1b2c3d4e5f60718", 16));
        assert!(!looks_like_hex_field("A1B2C3D4E5F60718", 16));
    }

    #[test]
    fn banner_sets_split_head_and_tail() {
        let lines: Vec<String> = ["boot v1", "copyright", "init ok", "ready"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (head, tail) = banner_sets(&lines, 2, 1);
        assert!(head.contains("boot v1"));
        assert!(head.contains("copyright"));
        assert!(!head.contains("ready"));
        assert_eq!(tail.len(), 1);
        assert!(tail.contains("ready"));
    }

    #[test]
    fn keyword_then_payload_queues_one_event() {
        let mut h = harness(cfg_with_signature());

        push_frame(&h, b"Timings:\r\n");
        push_frame(&h, b"100,200,300\r\n");
        h.drain(2);

        match h.queue_rx.try_recv() {
            Ok(DispatchMsg::Event(event)) => {
                assert_eq!(event.keyword, Some(Keyword::Timings));
                assert_eq!(event.payload, "100,200,300");
                assert!(event.context.is_none());
            }
            other => panic!("expected one event, got {other:?}"),
        }
        assert!(h.queue_rx.try_recv().is_err());
    }

    #[test]
    fn signature_keyword_payload_carries_context() {
        let mut h = harness(cfg_with_signature());

        push_frame(&h, b"Signature:\r\n");
        let mut frame = SIGNATURE_PREFIX.to_vec();
        frame.extend_from_slice(&[0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6, 0x07, 0x18]);
        frame.extend_from_slice(b"\r\n");
        push_frame(&h, &frame);
        h.drain(2);

        match h.queue_rx.try_recv() {
            Ok(DispatchMsg::Event(event)) => {
                assert_eq!(event.keyword, Some(Keyword::Signature));
                let context = event.context.expect("signature events carry a context");
                assert_eq!(context.voltage_set, 280);
            }
            other => panic!("expected one event, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_keyword_is_dropped() {
        let mut h = harness(cfg_with_signature());

        push_frame(&h, b"Signature:\r\n");
        push_frame(&h, b"Signature:\r\n");
        h.drain(2);

        assert!(h.queue_rx.try_recv().is_err());
    }

    #[test]
    fn first_unparseable_flips_state_and_records_a_trial() {
        let mut h = harness(cfg_with_signature());

        push_frame(&h, &garbage_frame());
        h.drain(1);

        assert_eq!(lock(&h.shared).op_state, TargetOpState::FirstUnparseable);
        let st = lock(&h.state);
        assert_eq!(st.unparseables_at_position, 1);
        assert_eq!(st.trial_records.len(), 1);
        assert_eq!(st.trial_records[0].result, TrialResult::FirstUnparseable);
    }

    #[test]
    fn parseable_line_recovers_to_normal() {
        let mut h = harness(cfg_with_signature());

        push_frame(&h, &garbage_frame());
        push_frame(&h, b"123,456,789\r\n");
        h.drain(2);

        assert_eq!(lock(&h.shared).op_state, TargetOpState::Normal);
        assert_eq!(lock(&h.state).unparseables_in_a_row, 0);
        // One unparseable then recovery: the trial is a one-off.
        assert_eq!(
            lock(&h.state).trial_records.last().map(|t| t.result),
            Some(TrialResult::FirstUnparseable)
        );
    }

    #[test]
    fn escalation_ladder_runs_baud_disable_reset_in_order() {
        let mut h = harness(cfg_with_signature());

        for _ in 0..5 {
            push_frame(&h, &garbage_frame());
        }
        h.drain(5);
        assert!(lock(&h.bauds).is_empty());
        assert_eq!(*lock(&h.resets), 0);

        // Sixth in a row: fallback baud rate.
        push_frame(&h, &garbage_frame());
        h.drain(1);
        assert_eq!(lock(&h.bauds).as_slice(), &[73_529]);
        assert_eq!(lock(&h.shared).op_state, TargetOpState::TryingBaudrates);

        // Seventh: back to primary, generator held disabled.
        push_frame(&h, &garbage_frame());
        h.drain(1);
        assert_eq!(lock(&h.bauds).as_slice(), &[73_529, 115_200]);
        assert_eq!(lock(&h.shared).op_state, TargetOpState::CsDisabled);
        assert!(lock(&h.generator)
            .disable_reasons()
            .iter()
            .any(|r| r == "unparseable_signature_check"));
        assert_eq!(*lock(&h.resets), 0);

        // Eighth: target reset, trial relabeled unresolved.
        push_frame(&h, &garbage_frame());
        h.drain(1);
        assert_eq!(*lock(&h.resets), 1);
        assert_eq!(
            lock(&h.state).trial_records.last().map(|t| t.result),
            Some(TrialResult::Unresolved)
        );
        assert_eq!(lock(&h.state).recovery_attempts_at_position, 0);
    }

    #[test]
    fn unparseable_pileup_lowers_voltage_and_refills_tries() {
        let mut cfg = cfg_with_signature();
        cfg.tries_per_position = 30; // reduction threshold max(30/3, 10) = 10
        let mut h = harness(cfg);

        // Interleave parseable lines so the streak ladder stays quiet
        // while the cumulative per-position count climbs.
        for chunk in 0..2 {
            for _ in 0..5 {
                push_frame(&h, &garbage_frame());
            }
            if chunk == 0 {
                push_frame(&h, b"123,456,789\r\n");
            }
        }
        h.drain(11);

        assert_eq!(*lock(&h.resets), 0);
        assert_eq!(h.device.voltage(), 270);
        let st = lock(&h.state);
        assert_eq!(st.tries_left, 30);
        assert_eq!(st.unparseables_at_position, 0);
        assert_eq!(st.voltage_baseline, 270);
    }

    #[test]
    fn empty_reads_trigger_a_reset_after_fifty() {
        let mut h = harness(cfg_with_signature());
        h.drain(50);
        assert_eq!(*lock(&h.resets), 0);
        h.drain(1);
        assert_eq!(*lock(&h.resets), 1);
    }

    #[test]
    fn triggered_reset_walks_the_banner_states() {
        let mut cfg = cfg_with_signature();
        let banner = std::env::temp_dir().join(format!(
            "emfi-banner-{}.txt",
            std::process::id()
        ));
        std::fs::write(&banner, "boot v1\ncopyright\nready\n").unwrap();
        cfg.banner_file = Some(banner.clone());
        cfg.banner_head_lines = 2;
        cfg.banner_tail_lines = 1;
        let mut h = harness(cfg);

        lock(&h.shared).op_state = TargetOpState::StartedFirstReset;
        lock(&h.shared).time_last_reset = Some(Instant::now());
        lock(&h.generator).request_disable("target_reset").unwrap();

        push_frame(&h, b"boot v1\r\n");
        h.drain(1);
        assert_eq!(lock(&h.shared).op_state, TargetOpState::InFirstReset);

        push_frame(&h, b"ready\r\n");
        h.drain(1);
        assert_eq!(lock(&h.shared).op_state, TargetOpState::AfterFirstReset);
        assert!(!lock(&h.generator)
            .disable_reasons()
            .iter()
            .any(|r| r == "target_reset"));
        // The reset hold was the only one, so releasing it re-arms.
        assert!(h.device.armed());

        let _ = std::fs::remove_file(banner);
    }

    #[test]
    fn unexpected_banner_head_records_a_reset_detection() {
        let mut cfg = cfg_with_signature();
        let banner = std::env::temp_dir().join(format!(
            "emfi-banner-unexpected-{}.txt",
            std::process::id()
        ));
        std::fs::write(&banner, "boot v1\ncopyright\nready\n").unwrap();
        cfg.banner_file = Some(banner.clone());
        cfg.banner_head_lines = 2;
        cfg.banner_tail_lines = 1;
        let mut h = harness(cfg);

        push_frame(&h, b"boot v1\r\n");
        h.drain(1);

        assert_eq!(lock(&h.shared).op_state, TargetOpState::InFirstReset);
        assert_eq!(
            lock(&h.state).trial_records.last().map(|t| t.result),
            Some(TrialResult::ResetDetected)
        );

        let _ = std::fs::remove_file(banner);
    }
}
