use crate::oracle::RunOutcome;
use crate::results::{RunResult, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

pub const SUMMARY_FILE: &str = "summary.csv";

/// Target column value of the per-configuration aggregate row.
pub const ALL_TARGETS: &str = "*";

/// Aggregate figures for one (configuration, target) group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub configuration: String,
    pub target: String,
    pub runs: usize,
    pub successes: usize,
    pub timeouts: usize,
    pub out_of_memory: usize,
    pub crashes: usize,
    pub parse_failures: usize,
    pub success_rate: f64,
    pub timeout_rate: f64,
    pub oom_rate: f64,
    pub crash_rate: f64,
    pub parse_failure_rate: f64,
    pub mean_detection_seconds: Option<f64>,
    pub median_detection_seconds: Option<f64>,
    pub mean_peak_memory_mb: Option<f64>,
    pub max_peak_memory_mb: Option<f64>,
}

impl SummaryRow {
    fn from_group(configuration: &str, target: &str, results: &[&RunResult]) -> Self {
        let count = |wanted: fn(&RunOutcome) -> bool| {
            results.iter().filter(|r| wanted(&r.outcome)).count()
        };
        let runs = results.len();
        let successes = count(|o| matches!(o, RunOutcome::Success { .. }));
        let timeouts = count(|o| matches!(o, RunOutcome::Timeout));
        let out_of_memory = count(|o| matches!(o, RunOutcome::OutOfMemory));
        let crashes = count(|o| matches!(o, RunOutcome::Crash));
        let parse_failures = count(|o| matches!(o, RunOutcome::ParseFailure));
        let rate = |n: usize| if runs == 0 { 0.0 } else { n as f64 / runs as f64 };

        let detections: Vec<f64> = results
            .iter()
            .filter_map(|r| r.detection_time_seconds())
            .collect();
        let peaks: Vec<f64> = results.iter().filter_map(|r| r.peak_memory_mb).collect();

        Self {
            configuration: configuration.to_string(),
            target: target.to_string(),
            runs,
            successes,
            timeouts,
            out_of_memory,
            crashes,
            parse_failures,
            success_rate: rate(successes),
            timeout_rate: rate(timeouts),
            oom_rate: rate(out_of_memory),
            crash_rate: rate(crashes),
            parse_failure_rate: rate(parse_failures),
            mean_detection_seconds: mean(&detections),
            median_detection_seconds: median(detections.clone()),
            mean_peak_memory_mb: mean(&peaks),
            max_peak_memory_mb: peaks.iter().copied().max_by(f64::total_cmp),
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Groups results per configuration and target, plus one [`ALL_TARGETS`] row per configuration.
///
/// Pure: the output depends only on the given records, ordered by
/// configuration then target.
pub fn summarize(results: &[RunResult]) -> Vec<SummaryRow> {
    let mut groups: BTreeMap<(&str, &str), Vec<&RunResult>> = BTreeMap::new();
    for result in results {
        groups
            .entry((result.configuration.as_str(), result.target.as_str()))
            .or_default()
            .push(result);
        groups
            .entry((result.configuration.as_str(), ALL_TARGETS))
            .or_default()
            .push(result);
    }
    groups
        .iter()
        .map(|((configuration, target), group)| SummaryRow::from_group(configuration, target, group))
        .collect()
}

pub fn write_summary_csv(path: &Path, rows: &[SummaryRow]) -> Result<(), StoreError> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush().map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn seconds(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.1}s"))
}

fn megabytes(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.1}"))
}

fn render_table(header: &[String], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }
    let mut out = String::new();
    let mut line = |cells: &[String]| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!("{cell:<width$}"))
            .collect();
        let _ = writeln!(out, "{}", padded.join("  ").trim_end());
    };
    line(header);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    line(rule.as_slice());
    for row in rows {
        line(row.as_slice());
    }
    out
}

/// Human-readable version of [`summarize`] output.
pub fn render_summary_table(rows: &[SummaryRow]) -> String {
    let header: Vec<String> = [
        "configuration",
        "target",
        "runs",
        "success",
        "timeout",
        "oom",
        "crash",
        "parse",
        "mean det.",
        "median det.",
        "mean MB",
        "max MB",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            vec![
                row.configuration.clone(),
                row.target.clone(),
                row.runs.to_string(),
                format!("{:.0}%", row.success_rate * 100.0),
                format!("{:.0}%", row.timeout_rate * 100.0),
                format!("{:.0}%", row.oom_rate * 100.0),
                format!("{:.0}%", row.crash_rate * 100.0),
                format!("{:.0}%", row.parse_failure_rate * 100.0),
                seconds(row.mean_detection_seconds),
                seconds(row.median_detection_seconds),
                megabytes(row.mean_peak_memory_mb),
                megabytes(row.max_peak_memory_mb),
            ]
        })
        .collect();
    render_table(&header, &body)
}

fn outcome_cell(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Success {
            detection_time_seconds,
        } => format!("{detection_time_seconds:.1}s"),
        RunOutcome::Timeout => "Timeout".to_string(),
        RunOutcome::OutOfMemory => "OOM".to_string(),
        RunOutcome::Crash => "Crash".to_string(),
        RunOutcome::ParseFailure => "Parse failure".to_string(),
    }
}

/// Comparison table: one row per target, one column per configuration.
///
/// Columns follow the order in which configurations first appear in
/// `results`; so do rows. With several results for the same pair the last
/// one is shown.
pub fn render_results_table(results: &[RunResult]) -> String {
    let mut targets: Vec<&str> = Vec::new();
    let mut configurations: Vec<&str> = Vec::new();
    let mut seen_targets = BTreeSet::new();
    let mut seen_configurations = BTreeSet::new();
    let mut cells: BTreeMap<(&str, &str), String> = BTreeMap::new();
    for result in results {
        if seen_targets.insert(result.target.as_str()) {
            targets.push(&result.target);
        }
        if seen_configurations.insert(result.configuration.as_str()) {
            configurations.push(&result.configuration);
        }
        cells.insert(
            (result.target.as_str(), result.configuration.as_str()),
            outcome_cell(&result.outcome),
        );
    }

    let header: Vec<String> = std::iter::once("target".to_string())
        .chain(configurations.iter().map(|c| c.to_string()))
        .collect();
    let body: Vec<Vec<String>> = targets
        .iter()
        .map(|target| {
            std::iter::once(target.to_string())
                .chain(configurations.iter().map(|configuration| {
                    cells
                        .get(&(*target, *configuration))
                        .cloned()
                        .unwrap_or_else(|| "-".to_string())
                }))
                .collect()
        })
        .collect();
    render_table(&header, &body)
}
