use crate::config::{ConfigError, ParserSettings};
use crate::executor::RawRunOutput;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const DEFAULT_MARKER_PATTERN: &str = r"(?i)(found\s+(a\s+)?vulnerabilit|vulnerabilit(y|ies)\s+(found|detected)|objective\s+found|bug\s+found)";
/// Status lines such as `0 vulnerabilities found` match the marker but report nothing.
const DEFAULT_IGNORE_PATTERN: &str = r"(?i)\b(0|no|zero)\s+(vulnerabilit|bugs?\b|objectives?\b)";
const DEFAULT_ELAPSED_PATTERN: &str =
    r"(?i)(?:\[\s*(\d+(?:\.\d+)?)\s*s\s*\]|(?:elapsed|time)\s*[:=]?\s*(\d+(?:\.\d+)?)\s*s\b)";
const DEFAULT_OOM_PATTERNS: [&str; 3] = [
    r"memory allocation of \d+ bytes failed",
    r"out of memory",
    r"cannot allocate memory",
];

/// Conventional exit code of a process killed by SIGKILL, as reported by shells and the OOM killer.
const OOM_EXIT_CODE: i32 = 137;
const SIGKILL: i32 = 9;

/// Terminal classification of one executed case.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunOutcome {
    Success { detection_time_seconds: f64 },
    Timeout,
    OutOfMemory,
    Crash,
    ParseFailure,
}

impl RunOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            RunOutcome::Success { .. } => OutcomeKind::Success,
            RunOutcome::Timeout => OutcomeKind::Timeout,
            RunOutcome::OutOfMemory => OutcomeKind::OutOfMemory,
            RunOutcome::Crash => OutcomeKind::Crash,
            RunOutcome::ParseFailure => OutcomeKind::ParseFailure,
        }
    }

    pub fn detection_time_seconds(&self) -> Option<f64> {
        match self {
            RunOutcome::Success {
                detection_time_seconds,
            } => Some(*detection_time_seconds),
            _ => None,
        }
    }
}

/// The outcome without its payload; this is what the `outcome` column stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Timeout,
    OutOfMemory,
    Crash,
    ParseFailure,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::OutOfMemory => "out_of_memory",
            OutcomeKind::Crash => "crash",
            OutcomeKind::ParseFailure => "parse_failure",
        };
        f.write_str(name)
    }
}

/// An `Oracle` turns a finished engine run into exactly one [`RunOutcome`].
///
/// Implementations must be pure over their inputs: the same run record and
/// log text always produce the same outcome.
pub trait Oracle: Send + Sync {
    fn examine(&self, run: &RawRunOutput, log: &str, timeout: Duration) -> RunOutcome;
}

/// Classifies runs from the exit status and the engine's log text.
///
/// Checks are applied in a fixed order and the first match wins:
/// watchdog timeout, a memory kill, detection marker, non-zero exit, and
/// finally a clean exit without any marker, which counts as a timeout only if
/// the engine used up its whole budget. Allocation failures in the log only
/// turn a non-zero exit into [`RunOutcome::OutOfMemory`]; an engine that
/// recovered from one and exited cleanly is judged on its markers.
#[derive(Debug, Clone)]
pub struct LogOracle {
    marker: Regex,
    ignore: Option<Regex>,
    elapsed: Regex,
    oom: Vec<Regex>,
}

impl Default for LogOracle {
    fn default() -> Self {
        Self::from_settings(&ParserSettings::default()).expect("built-in patterns are valid")
    }
}

impl LogOracle {
    pub fn from_settings(settings: &ParserSettings) -> Result<Self, ConfigError> {
        let marker = compile(
            "marker",
            settings
                .marker_pattern
                .as_deref()
                .unwrap_or(DEFAULT_MARKER_PATTERN),
        )?;
        let ignore = match settings.ignore_pattern.as_deref() {
            Some("") => None,
            Some(pattern) => Some(compile("ignore", pattern)?),
            None => Some(compile("ignore", DEFAULT_IGNORE_PATTERN)?),
        };
        let elapsed = compile(
            "elapsed",
            settings
                .elapsed_pattern
                .as_deref()
                .unwrap_or(DEFAULT_ELAPSED_PATTERN),
        )?;
        if elapsed.captures_len() < 2 {
            return Err(ConfigError::Invalid(
                "parser.elapsed-pattern needs a capture group for the seconds value".into(),
            ));
        }
        let oom = match &settings.oom_patterns {
            Some(patterns) => patterns
                .iter()
                .map(|p| compile("oom", p))
                .collect::<Result<Vec<_>, _>>()?,
            None => DEFAULT_OOM_PATTERNS
                .iter()
                .map(|p| {
                    RegexBuilder::new(p)
                        .case_insensitive(true)
                        .build()
                        .map_err(|source| ConfigError::Pattern { name: "oom", source })
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(Self {
            marker,
            ignore,
            elapsed,
            oom,
        })
    }

    /// Earliest elapsed time among the marker lines of `log`.
    pub fn detection_time(&self, log: &str) -> Option<f64> {
        log.lines()
            .filter(|line| self.is_marker(line))
            .filter_map(|line| self.elapsed_seconds(line))
            .min_by(f64::total_cmp)
    }

    fn is_marker(&self, line: &str) -> bool {
        self.marker.is_match(line) && !self.ignore.as_ref().is_some_and(|re| re.is_match(line))
    }

    fn elapsed_seconds(&self, line: &str) -> Option<f64> {
        let captures = self.elapsed.captures(line)?;
        let value = captures.iter().skip(1).flatten().next()?;
        value.as_str().parse::<f64>().ok().filter(|v| v.is_finite())
    }

    fn mentions_oom(&self, log: &str) -> bool {
        self.oom.iter().any(|pattern| pattern.is_match(log))
    }
}

fn compile(name: &'static str, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::Pattern { name, source })
}

impl Oracle for LogOracle {
    fn examine(&self, run: &RawRunOutput, log: &str, timeout: Duration) -> RunOutcome {
        if run.timed_out {
            return RunOutcome::Timeout;
        }
        // Any SIGKILL left at this point did not come from our own watchdogs.
        if run.oom || run.exit.code == Some(OOM_EXIT_CODE) || run.exit.signal == Some(SIGKILL) {
            return RunOutcome::OutOfMemory;
        }
        if let Some(detection_time_seconds) = self.detection_time(log) {
            return RunOutcome::Success {
                detection_time_seconds,
            };
        }
        if !run.exit.success() {
            return if self.mentions_oom(log) {
                RunOutcome::OutOfMemory
            } else {
                RunOutcome::Crash
            };
        }
        if run.wall_clock >= timeout {
            RunOutcome::Timeout
        } else {
            RunOutcome::ParseFailure
        }
    }
}
