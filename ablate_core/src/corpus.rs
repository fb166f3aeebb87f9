use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Aggregate on-disk footprint of an engine's corpus directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorpusFootprint {
    /// Sum of the sizes of every regular file below the directory.
    pub size_bytes: u64,
    /// Number of regular files below the directory.
    pub entry_count: u64,
}

/// Walks `dir` recursively and totals the regular files found.
///
/// A directory that does not exist yet is reported as an empty footprint: the
/// engine creates its working folders lazily, so the first samples of a run
/// routinely land before the directory appears. Symlinks are not followed.
/// Entries that vanish between listing and inspection are skipped, since the
/// engine keeps rewriting its corpus while it is being measured.
pub fn measure(dir: &Path) -> io::Result<CorpusFootprint> {
    let mut footprint = CorpusFootprint::default();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            let metadata = match fs::symlink_metadata(entry.path()) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.is_file() {
                footprint.size_bytes += metadata.len();
                footprint.entry_count += 1;
            }
        }
    }
    Ok(footprint)
}

/// One sampling tick of a running case in overhead mode.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CorpusSnapshot {
    pub elapsed_seconds: f64,
    pub corpus_size_bytes: u64,
    pub corpus_entry_count: u64,
    pub process_rss_mb: f64,
}

/// Reduction of one case's snapshot series into the figures the overhead table reports.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OverheadStats {
    pub samples: usize,
    pub max_corpus_entries: u64,
    pub max_corpus_bytes: u64,
    pub final_rss_mb: f64,
    pub mean_rss_mb: f64,
    /// Corpus entries gained per second between the first and the last sample.
    pub growth_rate_per_second: f64,
}

impl OverheadStats {
    /// Returns `None` for an empty series.
    pub fn from_snapshots(snapshots: &[CorpusSnapshot]) -> Option<Self> {
        let first = snapshots.first()?;
        let last = snapshots.last()?;
        let span = last.elapsed_seconds - first.elapsed_seconds;
        let growth_rate_per_second = if span > 0.0 {
            (last.corpus_entry_count as f64 - first.corpus_entry_count as f64) / span
        } else {
            0.0
        };
        Some(Self {
            samples: snapshots.len(),
            max_corpus_entries: snapshots
                .iter()
                .map(|s| s.corpus_entry_count)
                .max()
                .unwrap_or(0),
            max_corpus_bytes: snapshots
                .iter()
                .map(|s| s.corpus_size_bytes)
                .max()
                .unwrap_or(0),
            final_rss_mb: last.process_rss_mb,
            mean_rss_mb: snapshots.iter().map(|s| s.process_rss_mb).sum::<f64>()
                / snapshots.len() as f64,
            growth_rate_per_second,
        })
    }
}
