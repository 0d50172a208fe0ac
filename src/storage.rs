//! Run artifacts on disk.
//!
//! Four files accumulate per run: the per-target trial CSV (appended
//! across runs so a target's whole parameter history stays together),
//! a fault CSV and an alarm CSV written at the end, a JSON checkpoint
//! for resuming, and a raw scratch file of unparseable signatures.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::info;

use crate::model::{Checkpoint, ConfirmedAlarm, ConfirmedFault, RunReport, ScanConfig, TrialRecord};

const FILE_STAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
const DATE_STAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[hour]:[minute]:[second] ([day].[month].[year])");
const CLOCK_STAMP: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]:[second]");

fn stamp(format: &[BorrowedFormatItem<'_>]) -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format)
        .unwrap_or_else(|_| "unknown-time".to_string())
}

/// Timestamp safe for filenames, e.g. `2026-03-14_16-20-05`.
pub fn file_stamp() -> String {
    stamp(FILE_STAMP)
}

/// Human-readable timestamp with the date, e.g. `16:20:05 (14.03.2026)`.
pub fn date_stamp() -> String {
    stamp(DATE_STAMP)
}

/// Time of day only.
pub fn clock_stamp() -> String {
    stamp(CLOCK_STAMP)
}

pub fn trials_path(cfg: &ScanConfig) -> PathBuf {
    cfg.output_dir
        .join(format!("{}_parameter_collection_v5.csv", cfg.target_name))
}

pub fn results_path(cfg: &ScanConfig) -> PathBuf {
    cfg.output_dir
        .join(format!("{}_results.csv", cfg.run_basename))
}

pub fn alarms_path(cfg: &ScanConfig) -> PathBuf {
    cfg.output_dir
        .join(format!("{}_alarms.csv", cfg.run_basename))
}

pub fn checkpoint_path(cfg: &ScanConfig) -> PathBuf {
    cfg.output_dir
        .join(format!("{}_checkpoint.json", cfg.run_basename))
}

pub fn unparseable_path(cfg: &ScanConfig) -> PathBuf {
    cfg.output_dir
        .join(format!("{}_unparseable.raw", cfg.run_basename))
}

/// First free variant of `path`: the path itself, then `stem_2.ext`,
/// `stem_3.ext` and so on. Result files are never overwritten.
fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("export")
        .to_string();
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("csv")
        .to_string();
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut n = 2;
    loop {
        let candidate = dir.join(format!("{stem}_{n}.{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Minimal CSV quoting, enough for hex strings, timestamps, and alarm
/// names.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_row(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| csv_field(f))
        .collect::<Vec<_>>()
        .join(",")
}

/// Appends every pending trial to the per-target parameter CSV and
/// drains the records on success only, so a failed write retries the
/// same rows at the next flush.
pub fn export_trials(cfg: &ScanConfig, records: &mut Vec<TrialRecord>) -> Result<()> {
    if records.is_empty() {
        info!("No parameters tried. Skipping export of parameters.");
        return Ok(());
    }

    let path = trials_path(cfg);
    let write_header = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;

    if write_header {
        writeln!(
            file,
            "time,result,x,y,z,voltage_set,voltage_measured,\
             between_trigger_and_signGen_ms,trigger_duration_ns,\
             tip_diameter_mm,tip_winding,pattern"
        )?;
    }
    for record in records.iter() {
        let ctx = &record.context;
        let row = [
            ctx.time.clone(),
            record.result.as_str().to_string(),
            format!("{}", ctx.position.x),
            format!("{}", ctx.position.y),
            format!("{}", ctx.position.z),
            ctx.voltage_set.to_string(),
            format!("{}", ctx.voltage_measured),
            record
                .between_trigger_and_sign_gen_ms
                .map(|v| v.to_string())
                .unwrap_or_default(),
            record
                .trigger_duration_ns
                .map(|v| v.to_string())
                .unwrap_or_default(),
            format!("{}", cfg.tip_diameter_mm),
            cfg.tip_winding.clone(),
            ctx.pattern.clone(),
        ];
        writeln!(file, "{}", csv_row(&row))?;
    }
    info!("Exported tried parameters to {}", path.display());
    records.clear();
    Ok(())
}

/// Writes confirmed faults to a fresh CSV next to the run's other
/// artifacts.
pub fn export_faults(cfg: &ScanConfig, faults: &[ConfirmedFault]) -> Result<Option<PathBuf>> {
    if faults.is_empty() {
        info!("No faults found. Skipping export of results.");
        return Ok(None);
    }

    let path = unique_path(results_path(cfg));
    let mut file = File::create(&path).with_context(|| format!("create {}", path.display()))?;
    writeln!(file, "x,y,z,time,voltage_set,voltage_measured,pattern,signature")?;
    for fault in faults {
        let ctx = &fault.context;
        let row = [
            format!("{}", ctx.position.x),
            format!("{}", ctx.position.y),
            format!("{}", ctx.position.z),
            ctx.time.clone(),
            ctx.voltage_set.to_string(),
            format!("{}", ctx.voltage_measured),
            ctx.pattern.clone(),
            fault.signature.clone(),
        ];
        writeln!(file, "{}", csv_row(&row))?;
    }
    info!("Exported {} faults to {}", faults.len(), path.display());
    Ok(Some(path))
}

/// Writes confirmed alarms as one-hot columns, one per configured
/// alarm name. Test alarms never get a column.
pub fn export_alarms(cfg: &ScanConfig, alarms: &[ConfirmedAlarm]) -> Result<Option<PathBuf>> {
    if alarms.is_empty() {
        info!("No alarms found. Skipping export of alarms.");
        return Ok(None);
    }

    let columns: Vec<&String> = cfg
        .alarm_names
        .iter()
        .filter(|name| !name.contains("TEST_ALARM"))
        .collect();

    let path = unique_path(alarms_path(cfg));
    let mut file = File::create(&path).with_context(|| format!("create {}", path.display()))?;

    let mut header: Vec<String> = [
        "x",
        "y",
        "z",
        "time",
        "voltage_set",
        "voltage_measured",
        "pattern",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    header.extend(columns.iter().map(|s| s.to_string()));
    writeln!(file, "{}", csv_row(&header))?;

    for alarm in alarms {
        let ctx = &alarm.context;
        let mut row = vec![
            format!("{}", ctx.position.x),
            format!("{}", ctx.position.y),
            format!("{}", ctx.position.z),
            ctx.time.clone(),
            ctx.voltage_set.to_string(),
            format!("{}", ctx.voltage_measured),
            ctx.pattern.clone(),
        ];
        for name in &columns {
            let hit = alarm.alarms.iter().any(|a| a == *name);
            row.push(if hit { "x".to_string() } else { String::new() });
        }
        writeln!(file, "{}", csv_row(&row))?;
    }
    info!("Exported {} alarms to {}", alarms.len(), path.display());
    Ok(Some(path))
}

pub fn save_checkpoint(cfg: &ScanConfig, checkpoint: &Checkpoint) -> Result<PathBuf> {
    let path = checkpoint_path(cfg);
    let json = serde_json::to_string_pretty(checkpoint)?;
    fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
    info!("Saved checkpoint at {}", checkpoint.checkpoint_time);
    Ok(path)
}

pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let checkpoint =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(checkpoint)
}

/// Checkpoints found in `dir`, sorted by filename. Corrupt files are
/// listed with a marker instead of being skipped silently.
pub fn list_checkpoints(dir: &Path) -> Vec<(PathBuf, String)> {
    let mut found = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return found,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_checkpoint = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with("_checkpoint.json"));
        if !is_checkpoint {
            continue;
        }
        let label = match load_checkpoint(&path) {
            Ok(cp) => cp.checkpoint_time,
            Err(_) => "corrupt".to_string(),
        };
        found.push((path, label));
    }
    found.sort();
    found
}

/// Renames the run's checkpoint once the scan is complete, so a resume
/// never picks up a finished run by accident.
pub fn mark_finished(cfg: &ScanConfig) -> Result<Option<PathBuf>> {
    let path = checkpoint_path(cfg);
    if !path.exists() {
        return Ok(None);
    }
    let done = cfg
        .output_dir
        .join(format!("{}_checkpoint_finished.json", cfg.run_basename));
    fs::rename(&path, &done).with_context(|| format!("rename {}", path.display()))?;
    Ok(Some(done))
}

/// Writes the final run report as pretty JSON to a caller-chosen path.
pub fn export_report(path: &Path, report: &RunReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    info!("Exported run report to {}", path.display());
    Ok(())
}

/// Delimiter framing each scratch entry. The alternating bytes cannot
/// appear in ASCII hex, so entries stay findable in a damaged file.
const SCRATCH_MARKER: [u8; 4] = [0xff, 0x00, 0xff, 0x00];

/// Progress counter packed big-endian into as few bytes as the planned
/// total needs. A counter that outgrows that width gets a fixed eight
/// bytes instead.
fn progress_bytes(current: u64, total: u64) -> Vec<u8> {
    let byte_len = |v: u64| ((64 - v.leading_zeros() as usize) + 7) / 8;
    let mut width = byte_len(total).max(1);
    if byte_len(current) > width {
        width = 8;
    }
    current.to_be_bytes()[8 - width..].to_vec()
}

/// Appends one raw unparseable line, framed by markers with the trial
/// progress in between, so entries can be lined up with the log later.
pub fn append_unparseable(
    path: &Path,
    current: u64,
    total: u64,
    raw: &[u8],
) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&SCRATCH_MARKER)?;
    file.write_all(&progress_bytes(current, total))?;
    file.write_all(&SCRATCH_MARKER)?;
    file.write_all(raw)?;
    Ok(())
}
