use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    pub target_name: String,
    pub run_basename: String,
    pub output_dir: PathBuf,

    pub dry_run: bool,
    pub generator_port: Option<String>,
    pub generator_baud: u32,
    pub target_port: Option<String>,
    pub reset_port: Option<String>,
    pub x_port: Option<String>,
    pub y_port: Option<String>,
    pub z_port: Option<String>,
    pub stage_baud: u32,
    pub primary_baud: u32,
    pub fallback_baud: Option<u32>,
    pub reset_baud: u32,
    pub auto_reset_target: bool,

    pub boundaries: Boundaries,
    pub reference: ReferencePoint,
    pub step_size_mm: f64,
    pub start_direction: ScanDirection,
    pub tries_per_position: u32,
    /// When false the probe stays put and the position budget never
    /// advances the scan (single-point campaigns).
    pub allow_movement: bool,

    pub voltage_start: u32,
    pub voltage_min: u32,
    pub voltage_max: u32,
    pub voltage_increment: u32,
    pub high_time_start_ns: u32,
    pub high_time_min_ns: u32,
    pub high_time_max_ns: u32,
    pub pattern_slots: u32,
    pub dead_time_start_ms: u32,
    pub vary_voltage: bool,
    pub vary_high_time: bool,

    #[serde(with = "humantime_serde")]
    pub signature_period: Duration,
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,

    pub valid_signature: String,
    #[serde(default)]
    pub expected_message_hex: Option<String>,
    #[serde(default)]
    pub expected_digest: Option<String>,
    #[serde(default)]
    pub expected_privkey_n: Option<String>,
    #[serde(default)]
    pub expected_privkey_d: Option<String>,
    #[serde(default)]
    pub expected_pubkey_n: Option<String>,
    #[serde(default)]
    pub expected_pubkey_e: Option<String>,
    pub alarm_names: Vec<String>,
    #[serde(default)]
    pub banner_file: Option<PathBuf>,
    pub banner_head_lines: usize,
    pub banner_tail_lines: usize,

    pub tip_diameter_mm: f64,
    pub tip_winding: String,
    pub show_uart: bool,
}

impl ScanConfig {
    /// Baseline configuration carrying the stock tuning constants.
    /// The CLI layer starts from this and overrides fields from
    /// arguments; tests use it directly.
    pub fn baseline(target_name: impl Into<String>) -> Self {
        ScanConfig {
            target_name: target_name.into(),
            run_basename: String::new(),
            output_dir: PathBuf::from("."),
            dry_run: false,
            generator_port: None,
            generator_baud: 115_200,
            target_port: None,
            reset_port: None,
            x_port: None,
            y_port: None,
            z_port: None,
            stage_baud: 115_200,
            primary_baud: 115_200,
            fallback_baud: Some(73_529),
            reset_baud: 115_200,
            auto_reset_target: true,
            boundaries: Boundaries {
                x_left: 10.0,
                x_right: 0.0,
                y_up: 10.0,
                y_down: 0.0,
                z_up: 0.0,
                z_down: 5.0,
            },
            reference: ReferencePoint { x: 0.0, y: 0.0 },
            step_size_mm: 1.0,
            start_direction: ScanDirection::Right,
            tries_per_position: 300,
            allow_movement: true,
            voltage_start: 280,
            voltage_min: 150,
            voltage_max: 500,
            voltage_increment: 10,
            high_time_start_ns: 60,
            high_time_min_ns: 20,
            high_time_max_ns: 20 * 66,
            pattern_slots: 66,
            // Capacitors charge at 30 V/ms worst case, so the floor is
            // derived from the maximum voltage.
            dead_time_start_ms: 100,
            vary_voltage: false,
            vary_high_time: true,
            signature_period: Duration::from_millis(1500),
            reset_timeout: Duration::from_secs(30),
            valid_signature: String::new(),
            expected_message_hex: None,
            expected_digest: None,
            expected_privkey_n: None,
            expected_privkey_d: None,
            expected_pubkey_n: None,
            expected_pubkey_e: None,
            alarm_names: vec![
                "TEST_ALARM".to_string(),
                "GLITCH_DETECTED".to_string(),
                "CLOCK_SEC".to_string(),
                "VOLT_SEC".to_string(),
            ],
            banner_file: None,
            banner_head_lines: 6,
            banner_tail_lines: 1,
            tip_diameter_mm: 4.0,
            tip_winding: "CW".to_string(),
            show_uart: false,
        }
    }
}

/// Scan area limits in mm. X/Y are relative to the reference point,
/// Z is absolute stage travel (up = lifted clear, down = probing height).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Boundaries {
    pub x_left: f64,
    pub x_right: f64,
    pub y_up: f64,
    pub y_down: f64,
    pub z_up: f64,
    pub z_down: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferencePoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanDirection {
    Left,
    Right,
}

impl ScanDirection {
    pub fn flipped(self) -> Self {
        match self {
            ScanDirection::Left => ScanDirection::Right,
            ScanDirection::Right => ScanDirection::Left,
        }
    }
}

/// Listener-side view of target health, driving reset detection and the
/// recovery escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOpState {
    Normal,
    FirstUnparseable,
    CsDisabled,
    StartedFirstReset,
    InFirstReset,
    AfterFirstReset,
    StartedSecondReset,
    InSecondReset,
    AfterSecondReset,
    TryingBaudrates,
}

impl TargetOpState {
    /// True while banner lines are being consumed without classification.
    pub fn in_reset(self) -> bool {
        matches!(
            self,
            TargetOpState::InFirstReset | TargetOpState::InSecondReset
        )
    }
}

/// Closed protocol keyword set announced by the target one line ahead of
/// its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Keyword {
    Signature,
    Message,
    Digest,
    PrivKeyN,
    PrivKeyD,
    PubKeyN,
    PubKeyE,
    Timings,
    Pause,
    Alarm,
}

impl Keyword {
    pub const ALL: [Keyword; 10] = [
        Keyword::Signature,
        Keyword::Message,
        Keyword::Digest,
        Keyword::PrivKeyN,
        Keyword::PrivKeyD,
        Keyword::PubKeyN,
        Keyword::PubKeyE,
        Keyword::Timings,
        Keyword::Pause,
        Keyword::Alarm,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Signature => "Signature:",
            Keyword::Message => "Message:",
            Keyword::Digest => "Digest:",
            Keyword::PrivKeyN => "PrivKey_n:",
            Keyword::PrivKeyD => "PrivKey_d:",
            Keyword::PubKeyN => "PubKey_n:",
            Keyword::PubKeyE => "PubKey_e:",
            Keyword::Timings => "Timings:",
            Keyword::Pause => "Pause:",
            Keyword::Alarm => "Alarm:",
        }
    }

    pub fn from_line(line: &str) -> Option<Keyword> {
        Keyword::ALL.iter().copied().find(|k| k.as_str() == line)
    }
}

impl std::fmt::Display for Keyword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Target,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSource::Target => f.write_str("TARGET"),
        }
    }
}

/// Position/voltage/pattern snapshot taken when a result-bearing line is
/// received, so results are attributed to the parameters that produced
/// them rather than whatever is current at processing time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventContext {
    pub position: Position,
    pub time: String,
    pub voltage_set: u32,
    pub voltage_measured: f64,
    pub pattern: String,
}

/// One classified line from the target, queued for the dispatch loop.
#[derive(Debug, Clone)]
pub struct TargetEvent {
    pub source: EventSource,
    pub keyword: Option<Keyword>,
    pub payload: String,
    pub context: Option<EventContext>,
}

#[derive(Debug, Clone)]
pub enum DispatchMsg {
    Event(TargetEvent),
    /// Unblocks the dispatch receive at shutdown.
    Sentinel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialResult {
    ValidSignature,
    Faulted,
    FirstUnparseable,
    SingleUnparseable,
    ChangedBaudrate,
    UnparseableWhileFaulting,
    ResetRequired,
    ResetDetected,
    Unresolved,
    UnparseableWithoutReason,
}

impl TrialResult {
    pub fn as_str(self) -> &'static str {
        match self {
            TrialResult::ValidSignature => "valid_signature",
            TrialResult::Faulted => "faulted",
            TrialResult::FirstUnparseable => "first_unparseable",
            TrialResult::SingleUnparseable => "single_unparseable",
            TrialResult::ChangedBaudrate => "changed_baudrate",
            TrialResult::UnparseableWhileFaulting => "unparseable_while_faulting",
            TrialResult::ResetRequired => "reset_required",
            TrialResult::ResetDetected => "reset_detected",
            TrialResult::Unresolved => "unresolved",
            TrialResult::UnparseableWithoutReason => "unparseable_without_reason",
        }
    }
}

/// One tried parameter set and what it produced, appended to the trial CSV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    pub result: TrialResult,
    #[serde(flatten)]
    pub context: EventContext,
    #[serde(default)]
    pub between_trigger_and_sign_gen_ms: Option<i64>,
    #[serde(default)]
    pub trigger_duration_ns: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmedFault {
    pub signature: String,
    #[serde(flatten)]
    pub context: EventContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmedAlarm {
    pub alarms: Vec<String>,
    #[serde(flatten)]
    pub context: EventContext,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingHistory {
    pub between_trigger_and_sign_gen_ms: Vec<i64>,
    pub trigger_duration_ns: Vec<i64>,
}

/// Everything needed to resume an interrupted run. Written on
/// target-initiated pauses and abnormal shutdown, renamed with a
/// `finished` suffix on normal completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub boundaries: Boundaries,
    pub reference: ReferencePoint,
    pub position: Position,
    pub tries_left: u32,
    pub confirmed_faults: Vec<ConfirmedFault>,
    pub confirmed_alarms: Vec<ConfirmedAlarm>,
    pub past_timings: TimingHistory,
    pub current_progress: u64,
    pub total_progress: u64,
    pub target_name: String,
    pub checkpoint_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingStats {
    pub count: u64,
    pub mean: f64,
    pub stddev: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

/// Final run outcome handed back by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub target_name: String,
    pub started_at: String,
    pub finished_at: String,
    pub completed: bool,
    pub positions_visited: u64,
    pub signatures_seen: u64,
    pub unparseables_seen: u64,
    pub tries_per_position: u32,
    pub current_progress: u64,
    pub total_progress: u64,
    pub faults: Vec<ConfirmedFault>,
    pub alarms: Vec<ConfirmedAlarm>,
    pub timing_sign_gen_ms: Option<TimingStats>,
    pub timing_trigger_ns: Option<TimingStats>,
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum ExperimentEvent {
    Progress {
        current: u64,
        total: u64,
    },
    PositionStarted {
        index: u64,
        position: Position,
    },
    FaultConfirmed {
        position: Position,
        voltage_set: u32,
    },
    AlarmConfirmed {
        alarms: Vec<String>,
        position: Position,
    },
    Info(InfoEvent),
    RunCompleted {
        // Box to keep ExperimentEvent small; RunReport carries full fault lists.
        report: Box<RunReport>,
    },
}

/// Structured info events emitted by the engine and rendered by the CLI.
#[derive(Debug, Clone)]
pub enum InfoEvent {
    Message(String),
    DisableHeld { reason: String },
    DisableReleased { reason: String },
    BaudFallback { baud: u32 },
    TargetResetting { second: bool },
    VoltageLowered { volts: u32 },
}

impl InfoEvent {
    /// Render a human-readable message for the CLI layer.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::DisableHeld { reason } => {
                format!("Generator disarmed (hold: {})", reason)
            }
            InfoEvent::DisableReleased { reason } => {
                format!("Generator hold released ({})", reason)
            }
            InfoEvent::BaudFallback { baud } => {
                format!("Switching target link to fallback baud rate {}", baud)
            }
            InfoEvent::TargetResetting { second } => {
                if *second {
                    "Resetting target (second attempt)".to_string()
                } else {
                    "Resetting target".to_string()
                }
            }
            InfoEvent::VoltageLowered { volts } => {
                format!("Persistent unparseables, lowering voltage to {} V", volts)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_round_trips_through_line_form() {
        for kw in Keyword::ALL {
            assert_eq!(Keyword::from_line(kw.as_str()), Some(kw));
        }
        assert_eq!(Keyword::from_line("Signature"), None);
        assert_eq!(Keyword::from_line(""), None);
    }

    #[test]
    fn direction_flips_both_ways() {
        assert_eq!(ScanDirection::Left.flipped(), ScanDirection::Right);
        assert_eq!(ScanDirection::Right.flipped(), ScanDirection::Left);
    }
}
