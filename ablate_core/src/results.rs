use crate::corpus::{CorpusSnapshot, OverheadStats};
use crate::executor::RawRunOutput;
use crate::matrix::TestCase;
use crate::oracle::{OutcomeKind, RunOutcome};
use crate::probe::bytes_to_mb;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

pub const RESULTS_FILE: &str = "results.csv";
pub const METRICS_LOG_FILE: &str = "metrics.jsonl";
pub const METRICS_FILE: &str = "metrics.json";

/// Column order of `results.csv`. Matches the field order of [`ResultRow`].
pub const RESULT_COLUMNS: [&str; 8] = [
    "target",
    "configuration",
    "outcome",
    "detection_time_seconds",
    "peak_memory_mb",
    "log_path",
    "started_at",
    "ended_at",
];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CSV encoding error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{path:?} line {line}: {reason}")]
    Schema {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// The recorded result of one case. Appended exactly once per pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub target: String,
    pub configuration: String,
    pub outcome: RunOutcome,
    pub peak_memory_mb: Option<f64>,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RunResult {
    pub fn from_run(case: &TestCase, outcome: RunOutcome, raw: &RawRunOutput) -> Self {
        Self {
            target: case.target.clone(),
            configuration: case.configuration.clone(),
            outcome,
            peak_memory_mb: raw
                .telemetry
                .peak_rss_bytes
                .map(|bytes| round_hundredths(bytes_to_mb(bytes))),
            log_path: raw.log_path.clone(),
            started_at: raw.started_at,
            ended_at: raw.ended_at,
        }
    }

    pub fn detection_time_seconds(&self) -> Option<f64> {
        self.outcome.detection_time_seconds()
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.target, self.configuration)
    }

    pub fn to_row(&self) -> ResultRow {
        ResultRow {
            target: self.target.clone(),
            configuration: self.configuration.clone(),
            outcome: self.outcome.kind(),
            detection_time_seconds: self.detection_time_seconds(),
            peak_memory_mb: self.peak_memory_mb,
            log_path: self.log_path.to_string_lossy().into_owned(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

fn round_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Flat serialized form of a [`RunResult`], one line of `results.csv`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub target: String,
    pub configuration: String,
    pub outcome: OutcomeKind,
    pub detection_time_seconds: Option<f64>,
    pub peak_memory_mb: Option<f64>,
    pub log_path: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl TryFrom<ResultRow> for RunResult {
    type Error = String;

    fn try_from(row: ResultRow) -> Result<Self, Self::Error> {
        let outcome = match (row.outcome, row.detection_time_seconds) {
            (OutcomeKind::Success, Some(t)) if t.is_finite() && t >= 0.0 => RunOutcome::Success {
                detection_time_seconds: t,
            },
            (OutcomeKind::Success, Some(t)) => {
                return Err(format!("invalid detection time {t}"));
            }
            (OutcomeKind::Success, None) => {
                return Err("success row without detection time".to_string());
            }
            (kind, Some(_)) => return Err(format!("{kind} row carries a detection time")),
            (OutcomeKind::Timeout, None) => RunOutcome::Timeout,
            (OutcomeKind::OutOfMemory, None) => RunOutcome::OutOfMemory,
            (OutcomeKind::Crash, None) => RunOutcome::Crash,
            (OutcomeKind::ParseFailure, None) => RunOutcome::ParseFailure,
        };
        if row.ended_at < row.started_at {
            return Err("ended_at precedes started_at".to_string());
        }
        Ok(Self {
            target: row.target,
            configuration: row.configuration,
            outcome,
            peak_memory_mb: row.peak_memory_mb,
            log_path: PathBuf::from(row.log_path),
            started_at: row.started_at,
            ended_at: row.ended_at,
        })
    }
}

/// Full per-case record of the structured artifacts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetricsEntry {
    #[serde(flatten)]
    pub result: ResultRow,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub wall_clock_seconds: f64,
    pub snapshots: Vec<CorpusSnapshot>,
    pub overhead: Option<OverheadStats>,
}

impl MetricsEntry {
    pub fn new(result: &RunResult, raw: &RawRunOutput) -> Self {
        Self {
            result: result.to_row(),
            exit_code: raw.exit.code,
            signal: raw.exit.signal,
            wall_clock_seconds: raw.wall_clock.as_secs_f64(),
            snapshots: raw.telemetry.snapshots.clone(),
            overhead: OverheadStats::from_snapshots(&raw.telemetry.snapshots),
        }
    }
}

/// Destination for finished cases. Must be safe to call from several workers at once.
pub trait ResultSink: Send + Sync {
    fn append(&self, result: &RunResult, raw: &RawRunOutput) -> Result<(), StoreError>;
}

struct StoreFiles {
    csv: File,
    jsonl: File,
    entries: BTreeMap<String, MetricsEntry>,
}

/// File-backed results store for one pass directory.
///
/// `results.csv` and `metrics.jsonl` grow by one line per case. Each line is
/// written with a single `write_all` and synced before the lock is released,
/// so a crash can at worst leave a trailing fragment. `metrics.json` is only
/// written by [`ResultStore::finalize`].
pub struct ResultStore {
    dir: PathBuf,
    csv_path: PathBuf,
    jsonl_path: PathBuf,
    files: Mutex<StoreFiles>,
}

impl ResultStore {
    pub fn create(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let csv_path = dir.join(RESULTS_FILE);
        let jsonl_path = dir.join(METRICS_LOG_FILE);
        let mut csv = open_append(&csv_path)?;
        let jsonl = open_append(&jsonl_path)?;

        let existing = csv
            .metadata()
            .map_err(|source| StoreError::Io {
                path: csv_path.clone(),
                source,
            })?
            .len();
        if existing == 0 {
            let header = format!("{}\n", RESULT_COLUMNS.join(","));
            write_synced(&mut csv, &csv_path, header.as_bytes())?;
        }
        debug!(?dir, "results store ready");

        Ok(Self {
            dir: dir.to_path_buf(),
            csv_path,
            jsonl_path,
            files: Mutex::new(StoreFiles {
                csv,
                jsonl,
                entries: BTreeMap::new(),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    /// Writes `metrics.json` atomically and returns its path.
    pub fn finalize(&self) -> Result<PathBuf, StoreError> {
        let files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.dir.join(METRICS_FILE);
        let io_error = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_error)?;
        serde_json::to_writer_pretty(&mut tmp, &files.entries)?;
        tmp.write_all(b"\n").map_err(io_error)?;
        tmp.as_file().sync_data().map_err(io_error)?;
        tmp.persist(&path).map_err(|e| io_error(e.error))?;
        debug!(?path, entries = files.entries.len(), "metrics written");
        Ok(path)
    }
}

impl ResultSink for ResultStore {
    fn append(&self, result: &RunResult, raw: &RawRunOutput) -> Result<(), StoreError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.serialize(result.to_row())?;
        let csv_line = writer.into_inner().map_err(|e| StoreError::Io {
            path: self.csv_path.clone(),
            source: e.into_error(),
        })?;

        let entry = MetricsEntry::new(result, raw);
        let mut json_line = serde_json::to_vec(&entry)?;
        json_line.push(b'\n');

        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        write_synced(&mut files.csv, &self.csv_path, &csv_line)?;
        write_synced(&mut files.jsonl, &self.jsonl_path, &json_line)?;
        files.entries.insert(result.key(), entry);
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File, StoreError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn write_synced(file: &mut File, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    file.write_all(bytes)
        .and_then(|()| file.flush())
        .and_then(|()| file.sync_data())
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Reloads a `results.csv`, validating the header and every row.
///
/// A final line without a terminating newline is the remains of an
/// interrupted append; it is dropped with a warning.
pub fn load_results(path: &Path) -> Result<Vec<RunResult>, StoreError> {
    let content = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let complete = match content.rfind('\n') {
        Some(end) if end + 1 < content.len() => {
            warn!(
                ?path,
                fragment = %&content[end + 1..],
                "skipping incomplete trailing row"
            );
            &content[..=end]
        }
        Some(_) => content.as_str(),
        None => {
            if !content.is_empty() {
                warn!(?path, "results file has no complete line");
            }
            ""
        }
    };

    let schema_error = |line: usize, reason: String| StoreError::Schema {
        path: path.to_path_buf(),
        line,
        reason,
    };
    let mut reader = csv::ReaderBuilder::new().from_reader(complete.as_bytes());
    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Err(schema_error(1, "missing header".to_string()));
    }
    if !headers.iter().eq(RESULT_COLUMNS.iter().copied()) {
        return Err(schema_error(
            1,
            format!(
                "unexpected columns {:?}, expected {:?}",
                headers.iter().collect::<Vec<_>>(),
                RESULT_COLUMNS
            ),
        ));
    }

    let mut results = Vec::new();
    for (index, row) in reader.deserialize::<ResultRow>().enumerate() {
        let line = index + 2;
        let row = row.map_err(|e| schema_error(line, e.to_string()))?;
        results.push(RunResult::try_from(row).map_err(|reason| schema_error(line, reason))?);
    }
    Ok(results)
}
