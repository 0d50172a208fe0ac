use crate::engine::sim::SIM_SIGNATURE;
use crate::engine::{EngineControl, ExperimentEngine};
use crate::model::{
    Boundaries, Checkpoint, ExperimentEvent, ReferencePoint, ScanConfig, ScanDirection,
};
use crate::storage;
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "emfi-scan",
    version,
    about = "Automated EMFI parameter scan over an XYZ stage and pulse generator"
)]
pub struct Cli {
    /// Name of the device under test, used to group trial logs across runs
    #[arg(long, default_value = "rsa_target")]
    pub target_name: String,

    /// Run against emulated bench hardware instead of serial ports
    #[arg(long)]
    pub dry_run: bool,

    /// Serial port of the pulse generator
    #[arg(long)]
    pub generator_port: Option<String>,

    /// Baud rate of the pulse generator port
    #[arg(long, default_value_t = 115_200)]
    pub generator_baud: u32,

    /// Serial port carrying the target's UART output
    #[arg(long)]
    pub target_port: Option<String>,

    /// Serial port wired to the target's reset line
    #[arg(long)]
    pub reset_port: Option<String>,

    /// Serial port of the X stage controller
    #[arg(long)]
    pub x_port: Option<String>,

    /// Serial port of the Y stage controller
    #[arg(long)]
    pub y_port: Option<String>,

    /// Serial port of the Z stage controller
    #[arg(long)]
    pub z_port: Option<String>,

    /// Baud rate of the stage controller ports
    #[arg(long, default_value_t = 115_200)]
    pub stage_baud: u32,

    /// Baud rate the target normally talks at
    #[arg(long, default_value_t = 115_200)]
    pub target_baud: u32,

    /// Secondary baud rate tried when the target stops parsing (0 disables)
    #[arg(long, default_value_t = 73_529)]
    pub fallback_baud: u32,

    /// Baud rate of the reset-line port
    #[arg(long, default_value_t = 115_200)]
    pub reset_baud: u32,

    /// Use --auto-reset-target false to require manual target power cycles
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_reset_target: bool,

    /// Left scan edge in mm, relative to the reference point
    #[arg(long, default_value_t = 10.0)]
    pub x_left: f64,

    /// Right scan edge in mm, relative to the reference point
    #[arg(long, default_value_t = 0.0)]
    pub x_right: f64,

    /// Upper scan edge in mm, relative to the reference point
    #[arg(long, default_value_t = 10.0)]
    pub y_up: f64,

    /// Lower scan edge in mm, relative to the reference point
    #[arg(long, default_value_t = 0.0)]
    pub y_down: f64,

    /// Probe height in mm of absolute stage travel when lifted clear
    #[arg(long, default_value_t = 0.0)]
    pub z_up: f64,

    /// Probe height in mm of absolute stage travel when on the chip
    #[arg(long, default_value_t = 5.0)]
    pub z_down: f64,

    /// Stage X coordinate of the reference point in mm
    #[arg(long, default_value_t = 0.0)]
    pub ref_x: f64,

    /// Stage Y coordinate of the reference point in mm
    #[arg(long, default_value_t = 0.0)]
    pub ref_y: f64,

    /// Grid pitch in mm
    #[arg(long, default_value_t = 1.0)]
    pub step_size: f64,

    /// Raster direction of the first row: right or left
    #[arg(long, default_value = "right")]
    pub start_direction: String,

    /// Pulses fired at each grid position
    #[arg(long, default_value_t = 300)]
    pub tries_per_position: u32,

    /// Keep the probe parked at the start position (single-point campaign)
    #[arg(long)]
    pub no_movement: bool,

    /// Pulse voltage applied at the start of each position, in volts
    #[arg(long, default_value_t = 280)]
    pub voltage_start: u32,

    /// Lowest voltage the recovery ladder may fall back to
    #[arg(long, default_value_t = 150)]
    pub voltage_min: u32,

    /// Highest voltage the schedule may raise to
    #[arg(long, default_value_t = 500)]
    pub voltage_max: u32,

    /// Voltage step in volts used by the schedule and the ladder
    #[arg(long, default_value_t = 10)]
    pub voltage_increment: u32,

    /// Pulse high time applied at the start of each position, in ns
    #[arg(long, default_value_t = 60)]
    pub high_time_start: u32,

    /// Shortest pulse high time in ns (also the pattern slot width)
    #[arg(long, default_value_t = 20)]
    pub high_time_min: u32,

    /// Longest pulse high time in ns
    #[arg(long, default_value_t = 1320)]
    pub high_time_max: u32,

    /// Slots available in the generator's pulse pattern memory
    #[arg(long, default_value_t = 66)]
    pub pattern_slots: u32,

    /// Initial dead time between pulses in ms
    #[arg(long, default_value_t = 100)]
    pub dead_time_start: u32,

    /// Sweep the voltage across each position's try budget
    #[arg(long)]
    pub vary_voltage: bool,

    /// Use --vary-high-time false to pin the pulse width
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub vary_high_time: bool,

    /// Interval at which a healthy target produces one signature
    #[arg(long, default_value = "1500ms")]
    pub signature_period: humantime::Duration,

    /// How long a target reset may take before the run gives up waiting
    #[arg(long, default_value = "30s")]
    pub reset_timeout: humantime::Duration,

    /// Hex signature a healthy target produces (dry runs default to the
    /// emulator's built-in signature)
    #[arg(long, default_value = "")]
    pub valid_signature: String,

    /// Reference message the target should print after a reset
    #[arg(long)]
    pub expected_message: Option<String>,

    /// Reference digest the target should print after a reset
    #[arg(long)]
    pub expected_digest: Option<String>,

    /// Reference private key modulus
    #[arg(long)]
    pub expected_privkey_n: Option<String>,

    /// Reference private key exponent
    #[arg(long)]
    pub expected_privkey_d: Option<String>,

    /// Reference public key modulus
    #[arg(long)]
    pub expected_pubkey_n: Option<String>,

    /// Reference public key exponent
    #[arg(long)]
    pub expected_pubkey_e: Option<String>,

    /// Alarm name the target can raise (repeatable; defaults to the
    /// stock set when omitted)
    #[arg(long = "alarm-name")]
    pub alarm_names: Vec<String>,

    /// File holding the target's boot banner, used to spot resets
    #[arg(long)]
    pub banner_file: Option<PathBuf>,

    /// Banner lines from the top that never change between boots
    #[arg(long, default_value_t = 6)]
    pub banner_head: usize,

    /// Banner lines from the bottom that never change between boots
    #[arg(long, default_value_t = 1)]
    pub banner_tail: usize,

    /// Probe tip diameter in mm, recorded with every trial
    #[arg(long, default_value_t = 4.0)]
    pub tip_diameter: f64,

    /// Probe tip winding direction, recorded with every trial
    #[arg(long, default_value = "CW")]
    pub tip_winding: String,

    /// Echo every line of target UART traffic
    #[arg(long)]
    pub show_uart: bool,

    /// Directory for trial logs, results and checkpoints
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Resume an interrupted run from its checkpoint file
    #[arg(long)]
    pub resume: Option<PathBuf>,

    /// List checkpoints in the output directory and exit
    #[arg(long)]
    pub list_checkpoints: bool,

    /// Print the final report as JSON instead of the text summary
    #[arg(long)]
    pub json: bool,

    /// Write the final report as JSON to this path
    #[arg(long)]
    pub export_report: Option<PathBuf>,

    /// Log filter, e.g. info or emfi_scan=debug
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Append logs to this file as well as stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

pub async fn run(args: Cli) -> Result<()> {
    init_tracing(&args)?;

    if args.list_checkpoints {
        return print_checkpoints(&args);
    }

    let resume = match args.resume.as_deref() {
        Some(path) => {
            Some(storage::load_checkpoint(path).context("loading the resume checkpoint failed")?)
        }
        None => None,
    };

    let cfg = build_config(&args)?;
    verify_parameters(&cfg)?;
    run_scan(args, cfg, resume).await
}

/// Initialize logging: stderr always, plus an optional non-ANSI file layer.
fn init_tracing(args: &Cli) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

fn resolve_output_dir(args: &Cli) -> PathBuf {
    match args.output_dir.clone() {
        Some(dir) => dir,
        None => dirs::data_local_dir()
            .map(|dir| dir.join("emfi-scan"))
            .unwrap_or_else(|| PathBuf::from(".")),
    }
}

fn print_checkpoints(args: &Cli) -> Result<()> {
    let dir = resolve_output_dir(args);
    let found = storage::list_checkpoints(&dir);
    if found.is_empty() {
        println!("No checkpoints under {}", dir.display());
        return Ok(());
    }
    for (path, label) in found {
        println!("{label}  {}", path.display());
    }
    Ok(())
}

/// Build a `ScanConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> Result<ScanConfig> {
    let start_direction = match args.start_direction.to_ascii_lowercase().as_str() {
        "right" => ScanDirection::Right,
        "left" => ScanDirection::Left,
        other => bail!("start direction must be either 'right' or 'left', not '{other}'"),
    };

    let mut valid_signature = args.valid_signature.trim().to_ascii_lowercase();
    if valid_signature.is_empty() && args.dry_run {
        valid_signature = SIM_SIGNATURE.to_string();
    }

    let mut cfg = ScanConfig::baseline(args.target_name.clone());
    cfg.run_basename = format!("{}_{}", storage::file_stamp(), args.target_name);
    cfg.output_dir = resolve_output_dir(args);
    cfg.dry_run = args.dry_run;
    cfg.generator_port = args.generator_port.clone();
    cfg.generator_baud = args.generator_baud;
    cfg.target_port = args.target_port.clone();
    cfg.reset_port = args.reset_port.clone();
    cfg.x_port = args.x_port.clone();
    cfg.y_port = args.y_port.clone();
    cfg.z_port = args.z_port.clone();
    cfg.stage_baud = args.stage_baud;
    cfg.primary_baud = args.target_baud;
    cfg.fallback_baud = (args.fallback_baud != 0).then_some(args.fallback_baud);
    cfg.reset_baud = args.reset_baud;
    cfg.auto_reset_target = args.auto_reset_target;
    cfg.boundaries = Boundaries {
        x_left: args.x_left,
        x_right: args.x_right,
        y_up: args.y_up,
        y_down: args.y_down,
        z_up: args.z_up,
        z_down: args.z_down,
    };
    cfg.reference = ReferencePoint {
        x: args.ref_x,
        y: args.ref_y,
    };
    cfg.step_size_mm = args.step_size;
    cfg.start_direction = start_direction;
    cfg.tries_per_position = args.tries_per_position;
    cfg.allow_movement = !args.no_movement;
    cfg.voltage_start = args.voltage_start;
    cfg.voltage_min = args.voltage_min;
    cfg.voltage_max = args.voltage_max;
    cfg.voltage_increment = args.voltage_increment;
    cfg.high_time_start_ns = args.high_time_start;
    cfg.high_time_min_ns = args.high_time_min;
    cfg.high_time_max_ns = args.high_time_max;
    cfg.pattern_slots = args.pattern_slots;
    cfg.dead_time_start_ms = args.dead_time_start;
    cfg.vary_voltage = args.vary_voltage;
    cfg.vary_high_time = args.vary_high_time;
    cfg.signature_period = Duration::from(args.signature_period);
    cfg.reset_timeout = Duration::from(args.reset_timeout);
    cfg.valid_signature = valid_signature;
    cfg.expected_message_hex = args.expected_message.clone();
    cfg.expected_digest = args.expected_digest.clone();
    cfg.expected_privkey_n = args.expected_privkey_n.clone();
    cfg.expected_privkey_d = args.expected_privkey_d.clone();
    cfg.expected_pubkey_n = args.expected_pubkey_n.clone();
    cfg.expected_pubkey_e = args.expected_pubkey_e.clone();
    if !args.alarm_names.is_empty() {
        cfg.alarm_names = args.alarm_names.clone();
    }
    cfg.banner_file = args.banner_file.clone();
    cfg.banner_head_lines = args.banner_head;
    cfg.banner_tail_lines = args.banner_tail;
    cfg.tip_diameter_mm = args.tip_diameter;
    cfg.tip_winding = args.tip_winding.clone();
    cfg.show_uart = args.show_uart;
    Ok(cfg)
}

/// Reject inconsistent configurations before any hardware is touched.
fn verify_parameters(cfg: &ScanConfig) -> Result<()> {
    if !cfg.dry_run {
        for (flag, port) in [
            ("--generator-port", &cfg.generator_port),
            ("--target-port", &cfg.target_port),
            ("--reset-port", &cfg.reset_port),
            ("--x-port", &cfg.x_port),
            ("--y-port", &cfg.y_port),
            ("--z-port", &cfg.z_port),
        ] {
            if port.is_none() {
                bail!("{flag} is required unless --dry-run is set");
            }
        }
    }

    let mut seen: Vec<(&str, &str)> = Vec::new();
    for (label, port) in [
        ("generator", cfg.generator_port.as_deref()),
        ("target", cfg.target_port.as_deref()),
        ("reset", cfg.reset_port.as_deref()),
        ("X stage", cfg.x_port.as_deref()),
        ("Y stage", cfg.y_port.as_deref()),
        ("Z stage", cfg.z_port.as_deref()),
    ] {
        if let Some(port) = port {
            if let Some((other, _)) = seen.iter().find(|(_, p)| *p == port) {
                bail!("the {label} port and the {other} port must not be the same ({port})");
            }
            seen.push((label, port));
        }
    }

    let b = &cfg.boundaries;
    if b.x_left <= b.x_right {
        bail!(
            "X boundaries are inverted: left ({}) must be greater than right ({})",
            b.x_left,
            b.x_right
        );
    }
    if b.y_up <= b.y_down {
        bail!(
            "Y boundaries are inverted: up ({}) must be greater than down ({})",
            b.y_up,
            b.y_down
        );
    }
    if b.z_up >= b.z_down {
        bail!(
            "Z boundaries are inverted: up ({}) must be smaller than down ({})",
            b.z_up,
            b.z_down
        );
    }
    if cfg.step_size_mm <= 0.0 {
        bail!("step size must be larger than 0");
    }
    if b.x_left - b.x_right < cfg.step_size_mm {
        bail!("X axis: distance between boundaries is smaller than the step size");
    }
    if b.y_up - b.y_down < cfg.step_size_mm {
        bail!("Y axis: distance between boundaries is smaller than the step size");
    }
    if cfg.tries_per_position == 0 {
        bail!("tries per position must be larger than 0");
    }

    if cfg.voltage_min > cfg.voltage_start || cfg.voltage_start > cfg.voltage_max {
        bail!(
            "voltage start ({} V) must lie between the minimum ({} V) and maximum ({} V)",
            cfg.voltage_start,
            cfg.voltage_min,
            cfg.voltage_max
        );
    }
    if cfg.vary_voltage && cfg.voltage_increment == 0 {
        bail!("voltage increment must be larger than 0 when the voltage is varied");
    }
    if cfg.high_time_min_ns == 0 {
        bail!("high time minimum must be larger than 0");
    }
    if cfg.high_time_min_ns > cfg.high_time_start_ns
        || cfg.high_time_start_ns > cfg.high_time_max_ns
    {
        bail!(
            "high time start ({} ns) must lie between the minimum ({} ns) and maximum ({} ns)",
            cfg.high_time_start_ns,
            cfg.high_time_min_ns,
            cfg.high_time_max_ns
        );
    }
    if cfg.high_time_max_ns > cfg.high_time_min_ns * cfg.pattern_slots {
        bail!(
            "high time maximum ({} ns) does not fit the {} pattern slots of {} ns",
            cfg.high_time_max_ns,
            cfg.pattern_slots,
            cfg.high_time_min_ns
        );
    }
    if cfg.dead_time_start_ms == 0 || cfg.dead_time_start_ms > 1000 {
        bail!("dead time start must lie between 1 and 1000 ms");
    }

    if cfg.valid_signature.is_empty() {
        bail!(
            "no valid signature configured; pass --valid-signature so faults \
             can be told apart from healthy output"
        );
    }
    if cfg.valid_signature.len() % 2 != 0
        || !cfg.valid_signature.bytes().all(|b| b.is_ascii_hexdigit())
    {
        bail!("the valid signature must be a hex string of even length");
    }
    if cfg.valid_signature.contains("0d0a") {
        bail!(
            "the valid signature must not contain the sequence '0d0a' as this \
             is used to detect the end of a line in the serial communication"
        );
    }

    if cfg.alarm_names.is_empty() {
        bail!("at least one alarm name must be configured");
    }

    match cfg.banner_file.as_deref() {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| {
                format!(
                    "could not read banner file {}; it holds the target's boot \
                     banner used to detect resets",
                    path.display()
                )
            })?;
            let lines = raw.lines().filter(|l| !l.trim().is_empty()).count();
            let needed = cfg.banner_head_lines + cfg.banner_tail_lines;
            if lines < needed {
                bail!(
                    "banner file {} does not contain enough lines: expected at \
                     least {needed}, but got {lines}",
                    path.display()
                );
            }
        }
        None => {
            warn!(
                "No banner file specified. Target resets will only be detected \
                 by the reply timeout."
            );
        }
    }

    info!("All parameters successfully verified");
    Ok(())
}

/// Run the scan engine, render its event stream, and print the report.
async fn run_scan(args: Cli, cfg: ScanConfig, resume: Option<Checkpoint>) -> Result<()> {
    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<ExperimentEvent>();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<EngineControl>();

    // The first Ctrl-C asks the engine to stop and checkpoint; a second
    // one kills the process for rigs that are already wedged.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrl_tx.send(EngineControl::Cancel);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });

    let engine = ExperimentEngine::new(cfg, resume);
    let handle = tokio::spawn(async move { engine.run(evt_tx, ctrl_rx).await });

    while let Some(ev) = evt_rx.recv().await {
        match ev {
            ExperimentEvent::Progress { current, total } => {
                let line = if total > 0 {
                    let pct = current as f64 / total as f64 * 100.0;
                    format!("Progress: {current}/{total} ({pct:.1}%)")
                } else {
                    format!("Progress: {current} tries")
                };
                let _ = out_tx.send(OutputLine::Stderr(line));
            }
            ExperimentEvent::PositionStarted { index, position } => {
                let _ = out_tx.send(OutputLine::Stderr(format!(
                    "== Position {index}: ({:.3}, {:.3}, {:.3}) mm ==",
                    position.x, position.y, position.z
                )));
            }
            ExperimentEvent::FaultConfirmed {
                position,
                voltage_set,
            } => {
                let _ = out_tx.send(OutputLine::Stderr(format!(
                    "!! Fault at ({:.3}, {:.3}, {:.3}) mm with {voltage_set} V",
                    position.x, position.y, position.z
                )));
            }
            ExperimentEvent::AlarmConfirmed { alarms, position } => {
                let _ = out_tx.send(OutputLine::Stderr(format!(
                    "!! Alarm [{}] at ({:.3}, {:.3}, {:.3}) mm",
                    alarms.join(", "),
                    position.x,
                    position.y,
                    position.z
                )));
            }
            ExperimentEvent::Info(info) => {
                let _ = out_tx.send(OutputLine::Stderr(info.to_message()));
            }
            ExperimentEvent::RunCompleted { .. } => {}
        }
    }

    let report = handle.await.context("experiment task failed")??;

    if let Some(path) = args.export_report.as_deref() {
        storage::export_report(path, &report)?;
    }

    if args.json {
        let out = serde_json::to_string_pretty(&report)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        let summary = crate::text_summary::build_text_summary(&report);
        for line in summary.lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Cli {
        let mut argv = vec!["emfi-scan", "--dry-run"];
        argv.extend_from_slice(extra);
        Cli::parse_from(argv)
    }

    #[test]
    fn dry_run_defaults_build_and_verify() {
        let args = parse(&[]);
        let cfg = build_config(&args).unwrap();
        assert!(verify_parameters(&cfg).is_ok());
        assert_eq!(cfg.valid_signature, SIM_SIGNATURE);
        assert_eq!(cfg.fallback_baud, Some(73_529));
        assert_eq!(cfg.tries_per_position, 300);
        assert!(cfg.allow_movement);
        assert!(cfg.run_basename.ends_with("_rsa_target"));
    }

    #[test]
    fn zero_disables_the_fallback_baud() {
        let args = parse(&["--fallback-baud", "0"]);
        let cfg = build_config(&args).unwrap();
        assert_eq!(cfg.fallback_baud, None);
    }

    #[test]
    fn direction_strings_are_case_insensitive() {
        let cfg = build_config(&parse(&["--start-direction", "LEFT"])).unwrap();
        assert_eq!(cfg.start_direction, ScanDirection::Left);
        assert!(build_config(&parse(&["--start-direction", "up"])).is_err());
    }

    #[test]
    fn inverted_boundaries_are_rejected() {
        let cfg = build_config(&parse(&["--x-left", "0.0", "--x-right", "5.0"])).unwrap();
        let err = verify_parameters(&cfg).unwrap_err();
        assert!(err.to_string().contains("X boundaries are inverted"));

        let cfg = build_config(&parse(&["--z-up", "6.0", "--z-down", "5.0"])).unwrap();
        let err = verify_parameters(&cfg).unwrap_err();
        assert!(err.to_string().contains("Z boundaries are inverted"));
    }

    #[test]
    fn a_step_wider_than_the_area_is_rejected() {
        let cfg = build_config(&parse(&["--step-size", "25.0"])).unwrap();
        let err = verify_parameters(&cfg).unwrap_err();
        assert!(err.to_string().contains("smaller than the step size"));
    }

    #[test]
    fn crlf_inside_the_signature_is_rejected() {
        let cfg = build_config(&parse(&["--valid-signature", "ab0D0Acd"])).unwrap();
        let err = verify_parameters(&cfg).unwrap_err();
        assert!(err.to_string().contains("0d0a"));
    }

    #[test]
    fn non_hex_signatures_are_rejected() {
        let cfg = build_config(&parse(&["--valid-signature", "xyz123"])).unwrap();
        let err = verify_parameters(&cfg).unwrap_err();
        assert!(err.to_string().contains("hex string of even length"));
    }

    #[test]
    fn hardware_mode_requires_every_port() {
        let args = Cli::parse_from(["emfi-scan", "--valid-signature", "ab12"]);
        let cfg = build_config(&args).unwrap();
        let err = verify_parameters(&cfg).unwrap_err();
        assert!(err.to_string().contains("--generator-port"));
    }

    #[test]
    fn shared_ports_are_rejected() {
        let args = Cli::parse_from([
            "emfi-scan",
            "--valid-signature",
            "ab12",
            "--generator-port",
            "/dev/ttyUSB0",
            "--target-port",
            "/dev/ttyUSB0",
            "--reset-port",
            "/dev/ttyUSB2",
            "--x-port",
            "/dev/ttyUSB3",
            "--y-port",
            "/dev/ttyUSB4",
            "--z-port",
            "/dev/ttyUSB5",
        ]);
        let cfg = build_config(&args).unwrap();
        let err = verify_parameters(&cfg).unwrap_err();
        assert!(err.to_string().contains("must not be the same"));
    }

    #[test]
    fn short_banner_files_are_rejected() {
        let path = std::env::temp_dir().join(format!(
            "emfi-cli-banner-{}-{:?}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
        ));
        std::fs::write(&path, "one\ntwo\n\nthree\n").unwrap();
        let cfg = build_config(&parse(&[
            "--banner-file",
            path.to_str().unwrap(),
            "--banner-head",
            "6",
            "--banner-tail",
            "1",
        ]))
        .unwrap();
        let err = verify_parameters(&cfg).unwrap_err();
        assert!(err.to_string().contains("does not contain enough lines"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn an_oversized_high_time_is_rejected() {
        let cfg = build_config(&parse(&["--high-time-max", "2000"])).unwrap();
        let err = verify_parameters(&cfg).unwrap_err();
        assert!(err.to_string().contains("pattern slots"));
    }
}
