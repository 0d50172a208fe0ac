//! Text summary builder for CLI output.
//!
//! This module formats a finished run into human-readable lines for text mode.

use crate::model::{RunReport, TimingStats};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from a run report.
pub(crate) fn build_text_summary(report: &RunReport) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!("Target: {}", report.target_name));
    lines.push(format!(
        "Run window: {} to {}",
        report.started_at, report.finished_at
    ));
    if report.completed {
        lines.push("Outcome: scanned the whole defined area".to_string());
    } else {
        lines.push("Outcome: interrupted before the area was fully scanned".to_string());
    }

    if report.total_progress > 0 {
        let pct = report.current_progress as f64 / report.total_progress as f64 * 100.0;
        lines.push(format!(
            "Progress: {} of {} tries ({:.1}%), {} tries per position",
            report.current_progress, report.total_progress, pct, report.tries_per_position
        ));
    } else {
        lines.push(format!(
            "Progress: {} tries, {} tries per position",
            report.current_progress, report.tries_per_position
        ));
    }
    lines.push(format!(
        "Traffic: moved {} times, {} signatures received, {} unparseable lines",
        report.positions_visited, report.signatures_seen, report.unparseables_seen
    ));

    if report.faults.is_empty() {
        lines.push("Faults: none confirmed".to_string());
    } else {
        lines.push(format!("Faults: {} confirmed", report.faults.len()));
        for fault in &report.faults {
            let pos = &fault.context.position;
            lines.push(format!(
                "  ({:.3}, {:.3}, {:.3}) mm at {} set {}V measured {:.1}V: {}",
                pos.x,
                pos.y,
                pos.z,
                fault.context.time,
                fault.context.voltage_set,
                fault.context.voltage_measured,
                fault.signature
            ));
        }
    }

    if report.alarms.is_empty() {
        lines.push("Alarms: none".to_string());
    } else {
        lines.push(format!("Alarms: {} raised", report.alarms.len()));
        for alarm in &report.alarms {
            let pos = &alarm.context.position;
            lines.push(format!(
                "  ({:.3}, {:.3}, {:.3}) mm at {}: {}",
                pos.x,
                pos.y,
                pos.z,
                alarm.context.time,
                alarm.alarms.join(" + ")
            ));
        }
    }

    match report.timing_sign_gen_ms.as_ref() {
        Some(stats) => lines.push(timing_line("Trigger to signature", stats, "ms")),
        None => lines.push("Trigger to signature: no samples".to_string()),
    }
    match report.timing_trigger_ns.as_ref() {
        Some(stats) => lines.push(timing_line("Trigger duration", stats, "ns")),
        None => lines.push("Trigger duration: no samples".to_string()),
    }

    if let Some(path) = report.checkpoint_path.as_ref() {
        lines.push(format!("Checkpoint: {}", path.display()));
    }

    TextSummary { lines }
}

fn timing_line(label: &str, stats: &TimingStats, unit: &str) -> String {
    format!(
        "{label}: avg {:.1} med {:.0} p90 {:.0} p99 {:.0} {unit} (stddev {:.1}, n={})",
        stats.mean, stats.p50, stats.p90, stats.p99, stats.stddev, stats.count
    )
}
