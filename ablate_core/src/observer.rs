use crate::corpus::{self, CorpusSnapshot};
use crate::probe::{ProcessTreeProbe, bytes_to_mb};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Why a run was forcibly ended by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Timeout,
    MemoryLimit,
}

#[derive(Debug, Default)]
struct ControlState {
    cancelled: bool,
    termination: Option<TerminationReason>,
}

/// Shared between the supervising executor and the observers of one run.
///
/// Observers may ask for the process to be terminated; only the first request
/// is kept, and requests made after the run was cancelled are ignored. The
/// executor cancels the control as soon as the child has been reaped, which
/// wakes every observer immediately.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    inner: Arc<(Mutex<ControlState>, Condvar)>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ControlState> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if this call recorded the termination reason.
    pub fn request_termination(&self, reason: TerminationReason) -> bool {
        let mut state = self.state();
        if state.cancelled || state.termination.is_some() {
            return false;
        }
        state.termination = Some(reason);
        self.inner.1.notify_all();
        true
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.state().termination
    }

    pub fn cancel(&self) {
        let mut state = self.state();
        state.cancelled = true;
        self.inner.1.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    /// Sleeps up to `timeout`, waking early on cancellation. Returns whether the run was cancelled.
    pub fn wait_cancelled(&self, timeout: Duration) -> bool {
        let guard = self.state();
        let (guard, _) = self
            .inner
            .1
            .wait_timeout_while(guard, timeout, |state| !state.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        guard.cancelled
    }

    /// Sleeps up to `timeout`, waking early on cancellation or a termination request.
    pub fn park(&self, timeout: Duration) {
        let guard = self.state();
        let _ = self
            .inner
            .1
            .wait_timeout_while(guard, timeout, |state| {
                !state.cancelled && state.termination.is_none()
            })
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// What an observer concluded from one look at the running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Continue,
    Terminate(TerminationReason),
}

/// Data observers hand back once a run is over.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunTelemetry {
    pub peak_rss_bytes: Option<u64>,
    pub snapshots: Vec<CorpusSnapshot>,
}

impl RunTelemetry {
    fn record_rss(&mut self, bytes: u64) {
        self.peak_rss_bytes = Some(self.peak_rss_bytes.map_or(bytes, |peak| peak.max(bytes)));
    }
}

/// An `Observer` watches a running engine process from its own thread.
///
/// The executor starts one thread per observer right after spawning the
/// engine. Each thread alternates between sleeping for [`Observer::next_tick`]
/// and calling [`Observer::observe`] until the run is cancelled. An observer
/// that returns [`Observation::Terminate`] asks the executor to kill the
/// process tree and then stops; whichever observer asks first decides the
/// termination reason.
///
/// Once the run is over the executor calls [`Observer::collect`] so the
/// observer can contribute what it gathered (peak memory, snapshots) to the
/// run's telemetry.
pub trait Observer: Send {
    /// Short identifier used in log lines.
    fn name(&self) -> &'static str;

    /// How long to sleep before the next observation, given the time since the process started.
    fn next_tick(&self, elapsed: Duration) -> Duration;

    /// Looks at the process once. Errors are logged and observation continues.
    fn observe(&mut self, elapsed: Duration) -> Result<Observation, anyhow::Error>;

    /// Moves collected data into the run telemetry.
    fn collect(&mut self, telemetry: &mut RunTelemetry);
}

/// Drives one observer until the run is cancelled or the observer asks for termination.
pub fn run_observer(observer: &mut dyn Observer, control: &RunControl, started: Instant) {
    loop {
        let wait = observer.next_tick(started.elapsed());
        if control.wait_cancelled(wait) {
            break;
        }
        match observer.observe(started.elapsed()) {
            Ok(Observation::Continue) => {}
            Ok(Observation::Terminate(reason)) => {
                if control.request_termination(reason) {
                    info!(observer = observer.name(), ?reason, "requesting termination");
                } else {
                    debug!(observer = observer.name(), ?reason, "termination already decided");
                }
                break;
            }
            Err(e) => {
                warn!(observer = observer.name(), error = %e, "observation failed");
            }
        }
    }
}

/// Fires once the wall-clock limit has passed.
#[derive(Debug, Clone)]
pub struct TimeoutWatchdog {
    limit: Duration,
}

impl TimeoutWatchdog {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }
}

impl Observer for TimeoutWatchdog {
    fn name(&self) -> &'static str {
        "TimeoutWatchdog"
    }

    fn next_tick(&self, elapsed: Duration) -> Duration {
        self.limit
            .saturating_sub(elapsed)
            .max(Duration::from_millis(1))
    }

    fn observe(&mut self, elapsed: Duration) -> Result<Observation, anyhow::Error> {
        if elapsed >= self.limit {
            Ok(Observation::Terminate(TerminationReason::Timeout))
        } else {
            Ok(Observation::Continue)
        }
    }

    fn collect(&mut self, _telemetry: &mut RunTelemetry) {}
}

/// Polls the resident memory of the process tree, tracking the peak and
/// enforcing the optional ceiling.
pub struct MemoryWatchdog {
    probe: ProcessTreeProbe,
    limit_bytes: Option<u64>,
    interval: Duration,
    peak_bytes: Option<u64>,
}

impl MemoryWatchdog {
    pub fn new(pid: u32, limit_bytes: Option<u64>, interval: Duration) -> Self {
        Self {
            probe: ProcessTreeProbe::new(pid),
            limit_bytes,
            interval,
            peak_bytes: None,
        }
    }
}

impl Observer for MemoryWatchdog {
    fn name(&self) -> &'static str {
        "MemoryWatchdog"
    }

    fn next_tick(&self, _elapsed: Duration) -> Duration {
        self.interval
    }

    fn observe(&mut self, _elapsed: Duration) -> Result<Observation, anyhow::Error> {
        let Some(rss) = self.probe.resident_bytes() else {
            return Ok(Observation::Continue);
        };
        self.peak_bytes = Some(self.peak_bytes.map_or(rss, |peak| peak.max(rss)));
        match self.limit_bytes {
            Some(limit) if rss > limit => {
                warn!(
                    rss_mb = bytes_to_mb(rss),
                    limit_mb = bytes_to_mb(limit),
                    "memory ceiling exceeded"
                );
                Ok(Observation::Terminate(TerminationReason::MemoryLimit))
            }
            _ => Ok(Observation::Continue),
        }
    }

    fn collect(&mut self, telemetry: &mut RunTelemetry) {
        if let Some(peak) = self.peak_bytes {
            telemetry.record_rss(peak);
        }
    }
}

/// Overhead-mode sampler: corpus directory footprint plus tree RSS per tick.
pub struct StateSampler {
    probe: ProcessTreeProbe,
    corpus_dir: PathBuf,
    interval: Duration,
    snapshots: Vec<CorpusSnapshot>,
}

impl StateSampler {
    pub fn new(pid: u32, corpus_dir: PathBuf, interval: Duration) -> Self {
        Self {
            probe: ProcessTreeProbe::new(pid),
            corpus_dir,
            interval,
            snapshots: Vec::new(),
        }
    }
}

impl Observer for StateSampler {
    fn name(&self) -> &'static str {
        "StateSampler"
    }

    fn next_tick(&self, _elapsed: Duration) -> Duration {
        self.interval
    }

    fn observe(&mut self, elapsed: Duration) -> Result<Observation, anyhow::Error> {
        let footprint = corpus::measure(&self.corpus_dir).map_err(|e| {
            anyhow::anyhow!("Failed to measure corpus dir {:?}: {}", self.corpus_dir, e)
        })?;
        let rss = self.probe.resident_bytes().unwrap_or(0);
        self.snapshots.push(CorpusSnapshot {
            elapsed_seconds: elapsed.as_secs_f64(),
            corpus_size_bytes: footprint.size_bytes,
            corpus_entry_count: footprint.entry_count,
            process_rss_mb: bytes_to_mb(rss),
        });
        Ok(Observation::Continue)
    }

    fn collect(&mut self, telemetry: &mut RunTelemetry) {
        let snapshots = std::mem::take(&mut self.snapshots);
        if let Some(max_mb) = snapshots
            .iter()
            .map(|s| s.process_rss_mb)
            .reduce(f64::max)
        {
            telemetry.record_rss((max_mb * 1024.0 * 1024.0) as u64);
        }
        telemetry.snapshots = snapshots;
    }
}
