use crate::config::{ENGINE_ENV_OVERRIDE, EngineSettings, HarnessConfig};
use crate::error::HarnessError;
use crate::matrix::TestCase;
use crate::observer::{
    MemoryWatchdog, Observer, RunControl, RunTelemetry, StateSampler, TerminationReason,
    TimeoutWatchdog, run_observer,
};
use crate::probe::ProcessTreeProbe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

const SUPERVISE_POLL: Duration = Duration::from_millis(25);

/// How the engine process ended, as reported by the operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("Exited with code {code}"),
            (None, Some(signal)) => format!("Terminated by signal {signal}"),
            (None, None) => "Exited abnormally".to_string(),
        }
    }
}

/// Everything the executor knows about one finished engine invocation.
#[derive(Debug, Clone)]
pub struct RawRunOutput {
    pub exit: ExitInfo,
    pub timed_out: bool,
    pub oom: bool,
    pub log_path: PathBuf,
    pub wall_clock: Duration,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub telemetry: RunTelemetry,
}

pub trait Executor: Send + Sync {
    /// Runs one case to completion, writing its combined output to `log_path`.
    ///
    /// Returns only after the engine process has been reaped. Errors are fatal
    /// for the whole pass; per-case failures are reported through the output.
    fn execute(&self, case: &TestCase, log_path: &Path) -> Result<RawRunOutput, HarnessError>;
}

/// A located engine binary plus its argument template.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl EngineCommand {
    /// Locates the engine, honouring the `ABLATE_ENGINE` override.
    pub fn resolve(settings: &EngineSettings) -> Result<Self, HarnessError> {
        Self::resolve_with_override(settings, std::env::var_os(ENGINE_ENV_OVERRIDE))
    }

    pub fn resolve_with_override(
        settings: &EngineSettings,
        override_binary: Option<OsString>,
    ) -> Result<Self, HarnessError> {
        let requested = override_binary
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| OsString::from(&settings.binary));
        let binary = locate_binary(&requested)?;
        debug!(?binary, "resolved engine binary");
        Ok(Self {
            binary,
            args: settings.args.clone(),
            env: settings.env.clone(),
        })
    }

    /// Expands the template for `case`, then appends the case flags and `trailing`.
    pub fn argv(&self, case: &TestCase, work_dir: &Path, trailing: &[String]) -> Vec<String> {
        let timeout_secs = case.timeout.as_secs_f64().ceil() as u64;
        let contract = case.contract.to_string_lossy();
        let work_dir = work_dir.to_string_lossy();
        let mut argv: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{contract}", &contract)
                    .replace("{timeout}", &timeout_secs.to_string())
                    .replace("{target}", &case.target)
                    .replace("{configuration}", &case.configuration)
                    .replace("{work_dir}", &work_dir)
            })
            .collect();
        argv.extend(case.extra_flags.iter().cloned());
        argv.extend(trailing.iter().cloned());
        argv
    }
}

fn locate_binary(requested: &OsStr) -> Result<PathBuf, HarnessError> {
    let path = Path::new(requested);
    let display = requested.to_string_lossy().into_owned();
    if path.is_absolute() || path.components().count() > 1 {
        if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(HarnessError::EngineNotFound {
                binary: display,
                reason: "no such file".to_string(),
            })
        }
    } else {
        which::which(requested).map_err(|e| HarnessError::EngineNotFound {
            binary: display,
            reason: e.to_string(),
        })
    }
}

/// Overhead-mode settings for the state sampler.
#[derive(Debug, Clone)]
pub struct SamplingSettings {
    pub interval: Duration,
    /// Relative to the case working directory.
    pub corpus_dir: PathBuf,
    /// Appended to the engine command line, e.g. `--verbose`.
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EngineExecutorConfig {
    pub command: EngineCommand,
    pub memory_limit_bytes: Option<u64>,
    pub memory_poll: Duration,
    pub watchdog_slack: Duration,
    pub sampling: Option<SamplingSettings>,
}

impl EngineExecutorConfig {
    pub fn from_harness_config(
        config: &HarnessConfig,
        overhead: bool,
    ) -> Result<Self, HarnessError> {
        let sampling = overhead.then(|| SamplingSettings {
            interval: Duration::from_millis(config.overhead.sample_interval_ms),
            corpus_dir: config.overhead.corpus_dir.clone(),
            extra_args: config.engine.overhead_args.clone(),
        });
        Ok(Self {
            command: EngineCommand::resolve(&config.engine)?,
            memory_limit_bytes: config.harness.memory_limit_bytes(),
            memory_poll: Duration::from_millis(config.harness.memory_poll_ms),
            watchdog_slack: Duration::from_secs(config.harness.watchdog_slack_seconds),
            sampling,
        })
    }
}

/// Runs the external engine as a child process under watchdog supervision.
pub struct EngineExecutor {
    config: EngineExecutorConfig,
}

impl EngineExecutor {
    pub fn new(config: EngineExecutorConfig) -> Self {
        Self { config }
    }

    fn observers_for(&self, case: &TestCase, pid: u32, work_dir: &Path) -> Vec<Box<dyn Observer>> {
        let mut observers: Vec<Box<dyn Observer>> = vec![
            Box::new(TimeoutWatchdog::new(case.timeout + self.config.watchdog_slack)),
            Box::new(MemoryWatchdog::new(
                pid,
                self.config.memory_limit_bytes,
                self.config.memory_poll,
            )),
        ];
        if let Some(sampling) = &self.config.sampling {
            observers.push(Box::new(StateSampler::new(
                pid,
                work_dir.join(&sampling.corpus_dir),
                sampling.interval,
            )));
        }
        observers
    }
}

impl Executor for EngineExecutor {
    fn execute(&self, case: &TestCase, log_path: &Path) -> Result<RawRunOutput, HarnessError> {
        let workspace = CaseWorkspace::prepare(case)?;
        let work_dir = workspace.path().to_path_buf();

        let output_error = |source| HarnessError::Output {
            path: log_path.to_path_buf(),
            source,
        };
        let stdout_log = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(log_path)
            .map_err(output_error)?;
        let stderr_log = stdout_log.try_clone().map_err(output_error)?;

        let trailing = self
            .config
            .sampling
            .as_ref()
            .map(|s| s.extra_args.as_slice())
            .unwrap_or(&[]);
        let argv = self.config.command.argv(case, &work_dir, trailing);

        let mut cmd = Command::new(&self.config.command.binary);
        cmd.args(&argv)
            .current_dir(&work_dir)
            .envs(&self.config.command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        info!(case = %case.id(), binary = ?self.config.command.binary, ?argv, "launching engine");
        let started_at = Utc::now();
        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                drop(cmd);
                if let Err(e) = std::fs::remove_file(log_path) {
                    warn!(?log_path, error = %e, "failed to remove log of unlaunched case");
                }
                workspace.close();
                return Err(HarnessError::Launch {
                    binary: self.config.command.binary.clone(),
                    case: case.id(),
                    source,
                });
            }
        };

        let control = RunControl::new();
        let observers = self.observers_for(case, child.id(), &work_dir);
        let (wait_result, telemetry) = thread::scope(|scope| {
            let control = &control;
            let handles: Vec<_> = observers
                .into_iter()
                .map(|mut observer| {
                    scope.spawn(move || {
                        run_observer(observer.as_mut(), control, started);
                        observer
                    })
                })
                .collect();

            let wait_result = supervise(&mut child, control);
            control.cancel();

            let mut telemetry = RunTelemetry::default();
            for handle in handles {
                match handle.join() {
                    Ok(mut observer) => observer.collect(&mut telemetry),
                    Err(_) => warn!(case = %case.id(), "observer thread panicked"),
                }
            }
            (wait_result, telemetry)
        });
        let wall_clock = started.elapsed();
        let ended_at = Utc::now();
        workspace.close();

        let (status, reason) = wait_result.map_err(|source| HarnessError::ProcessControl {
            case: case.id(),
            source,
        })?;
        let exit = ExitInfo::from_status(status);
        debug!(case = %case.id(), exit = %exit.describe(), ?reason, "engine finished");

        Ok(RawRunOutput {
            exit,
            timed_out: reason == Some(TerminationReason::Timeout),
            oom: reason == Some(TerminationReason::MemoryLimit),
            log_path: log_path.to_path_buf(),
            wall_clock,
            started_at,
            ended_at,
            telemetry,
        })
    }
}

/// Waits for the child, killing its process tree if an observer asks for it.
fn supervise(
    child: &mut Child,
    control: &RunControl,
) -> io::Result<(ExitStatus, Option<TerminationReason>)> {
    loop {
        match child.try_wait() {
            // A watchdog may have fired just before the engine exited on its own.
            Ok(Some(status)) => return Ok((status, control.termination())),
            Ok(None) => {}
            Err(e) => {
                terminate_tree(child);
                let _ = child.wait();
                return Err(e);
            }
        }
        if let Some(reason) = control.termination() {
            terminate_tree(child);
            let status = child.wait()?;
            return Ok((status, Some(reason)));
        }
        control.park(SUPERVISE_POLL);
    }
}

fn terminate_tree(child: &mut Child) {
    let mut probe = ProcessTreeProbe::new(child.id());
    let descendants = probe.kill_descendants();
    if let Err(e) = child.kill() {
        debug!(error = %e, "engine exited before kill");
    }
    debug!(pid = child.id(), descendants, "killed engine process tree");
}

/// The directory a case runs in. Temporary directories are removed on close.
enum CaseWorkspace {
    Provided(PathBuf),
    Temporary(TempDir),
}

impl CaseWorkspace {
    fn prepare(case: &TestCase) -> Result<Self, HarnessError> {
        match &case.working_directory {
            Some(dir) => {
                let output_error = |source| HarnessError::Output {
                    path: dir.clone(),
                    source,
                };
                match std::fs::read_dir(dir) {
                    Ok(mut entries) => {
                        if entries.next().is_some() {
                            return Err(output_error(io::Error::new(
                                io::ErrorKind::AlreadyExists,
                                "case working directory is not empty",
                            )));
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(output_error(e)),
                }
                std::fs::create_dir_all(dir).map_err(output_error)?;
                Ok(Self::Provided(dir.clone()))
            }
            None => tempfile::Builder::new()
                .prefix(&format!("ablate-{}-{}-", case.target, case.configuration))
                .tempdir()
                .map(Self::Temporary)
                .map_err(|source| HarnessError::Output {
                    path: std::env::temp_dir(),
                    source,
                }),
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Provided(dir) => dir,
            Self::Temporary(dir) => dir.path(),
        }
    }

    fn close(self) {
        if let Self::Temporary(dir) = self {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(?path, error = %e, "failed to remove temporary working directory");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

    fn fake_engine_path() -> PathBuf {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.join("../test_targets/fake_engine.sh")
    }

    fn engine_settings(mode_args: &[&str]) -> EngineSettings {
        let target_path = fake_engine_path();
        if !target_path.exists() {
            panic!("Test target missing: {target_path:?}");
        }
        let mut args = vec![target_path.to_str().unwrap().to_string()];
        args.extend(mode_args.iter().map(|s| s.to_string()));
        EngineSettings {
            binary: "sh".to_string(),
            args,
            ..EngineSettings::default()
        }
    }

    fn executor(
        mode_args: &[&str],
        memory_limit_bytes: Option<u64>,
        sampling: Option<SamplingSettings>,
    ) -> EngineExecutor {
        let command = EngineCommand::resolve_with_override(&engine_settings(mode_args), None)
            .expect("sh is on PATH");
        EngineExecutor::new(EngineExecutorConfig {
            command,
            memory_limit_bytes,
            memory_poll: Duration::from_millis(20),
            watchdog_slack: Duration::ZERO,
            sampling,
        })
    }

    fn case(timeout: Duration) -> TestCase {
        TestCase {
            target: "dvd_unstoppable".to_string(),
            configuration: "baseline".to_string(),
            contract: PathBuf::from("/dev/null"),
            timeout,
            working_directory: None,
            extra_flags: Vec::new(),
        }
    }

    fn run(executor: &EngineExecutor, case: &TestCase) -> (RawRunOutput, String) {
        let logs = tempfile::tempdir().unwrap();
        let log_path = logs.path().join(case.log_file_name());
        let output = executor.execute(case, &log_path).unwrap();
        let log = std::fs::read_to_string(&log_path).unwrap();
        (output, log)
    }

    fn process_gone(pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        for _ in 0..60 {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            let gone = system
                .process(pid)
                .is_none_or(|p| matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead));
            if gone {
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
        false
    }

    #[test]
    fn marker_run_exits_cleanly_and_captures_output() {
        let executor = executor(&["markers"], None, None);
        let (output, log) = run(&executor, &case(Duration::from_secs(10)));
        assert!(output.exit.success(), "{}", output.exit.describe());
        assert!(!output.timed_out);
        assert!(!output.oom);
        assert!(log.contains("[12.5s] Found vulnerabilities!"));
        assert!(log.contains("[47.0s] Found vulnerabilities!"));
        assert!(output.ended_at >= output.started_at);
        assert!(output.telemetry.snapshots.is_empty());
    }

    #[test]
    fn crash_reports_exit_code_and_stderr() {
        let executor = executor(&["crash"], None, None);
        let (output, log) = run(&executor, &case(Duration::from_secs(10)));
        assert_eq!(output.exit.code, Some(3));
        assert_eq!(output.exit.describe(), "Exited with code 3");
        assert!(!output.timed_out);
        assert!(log.contains("panicked"));
    }

    #[test]
    fn hanging_engine_is_killed_at_timeout() {
        let executor = executor(&["hang"], None, None);
        let (output, log) = run(&executor, &case(Duration::from_secs(1)));
        assert!(output.timed_out);
        assert!(!output.oom);
        assert!(output.wall_clock >= Duration::from_secs(1));
        assert!(
            output.wall_clock < Duration::from_secs(4),
            "took {:?}",
            output.wall_clock
        );
        let grandchild: u32 = log
            .lines()
            .find_map(|line| line.strip_prefix("child "))
            .expect("script reports its background child")
            .trim()
            .parse()
            .unwrap();
        assert!(process_gone(grandchild), "descendant {grandchild} survived");
    }

    #[test]
    fn memory_hog_hits_ceiling() {
        let executor = executor(&["hog"], Some(32 * 1024 * 1024), None);
        let (output, log) = run(&executor, &case(Duration::from_secs(30)));
        assert!(output.oom, "exit: {}", output.exit.describe());
        assert!(!output.timed_out);
        assert!(output.telemetry.peak_rss_bytes.unwrap() > 32 * 1024 * 1024);
        assert!(log.contains("Found vulnerabilities!"));
    }

    #[test]
    fn sampler_tracks_corpus_growth() {
        let sampling = SamplingSettings {
            interval: Duration::from_millis(100),
            corpus_dir: PathBuf::from("work_dir"),
            extra_args: Vec::new(),
        };
        let executor = executor(&["corpus"], None, Some(sampling));
        let (output, _) = run(&executor, &case(Duration::from_secs(20)));
        assert!(output.exit.success());
        let snapshots = &output.telemetry.snapshots;
        assert!(snapshots.len() >= 3, "only {} snapshots", snapshots.len());
        assert!(
            snapshots
                .windows(2)
                .all(|w| w[0].elapsed_seconds <= w[1].elapsed_seconds)
        );
        let last = snapshots.last().unwrap();
        assert!(last.corpus_entry_count >= snapshots[0].corpus_entry_count);
        assert!(last.corpus_entry_count > 0);
        assert!(last.corpus_size_bytes > 0);
    }

    #[test]
    fn command_line_environment_and_workspace() {
        let mut settings = engine_settings(&[
            "echo-args",
            "--contract",
            "{contract}",
            "--timeout",
            "{timeout}",
            "{target}",
            "{configuration}",
        ]);
        settings
            .env
            .insert("ABLATE_TEST_VAR".to_string(), "hello".to_string());
        let executor = EngineExecutor::new(EngineExecutorConfig {
            command: EngineCommand::resolve_with_override(&settings, None).unwrap(),
            memory_limit_bytes: None,
            memory_poll: Duration::from_millis(20),
            watchdog_slack: Duration::ZERO,
            sampling: Some(SamplingSettings {
                interval: Duration::from_secs(5),
                corpus_dir: PathBuf::from("work_dir"),
                extra_args: vec!["--verbose".to_string()],
            }),
        });
        let mut case = case(Duration::from_millis(1500));
        case.extra_flags = vec!["--dataflow".to_string()];

        let (output, log) = run(&executor, &case);
        assert!(output.exit.success());
        assert!(
            log.contains(
                "args: --contract /dev/null --timeout 2 dvd_unstoppable baseline --dataflow --verbose"
            ),
            "{log}"
        );
        assert!(log.contains("env: hello"));
        let cwd = log
            .lines()
            .find_map(|line| line.strip_prefix("cwd: "))
            .unwrap();
        assert!(cwd.contains("ablate-dvd_unstoppable-baseline-"));
        assert!(!Path::new(cwd).exists(), "temporary workspace left behind");
    }

    #[test]
    fn provided_working_directory_is_kept() {
        let root = tempfile::tempdir().unwrap();
        let executor = executor(&["corpus"], None, None);
        let mut case = case(Duration::from_secs(20));
        case.working_directory = Some(root.path().join("bacon"));
        let (output, _) = run(&executor, &case);
        assert!(output.exit.success());
        assert!(root.path().join("bacon/work_dir/corpus/state_0").exists());
    }

    #[test]
    fn existing_log_is_never_overwritten() {
        let logs = tempfile::tempdir().unwrap();
        let log_path = logs.path().join("dvd_unstoppable_baseline.log");
        std::fs::write(&log_path, "previous run").unwrap();
        let executor = executor(&["clean"], None, None);
        let err = executor
            .execute(&case(Duration::from_secs(5)), &log_path)
            .unwrap_err();
        assert!(matches!(err, HarnessError::Output { .. }), "got {err:?}");
        assert_eq!(std::fs::read_to_string(&log_path).unwrap(), "previous run");
    }

    #[test]
    fn unlaunchable_engine_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let not_executable = dir.path().join("ityfuzz");
        std::fs::write(&not_executable, "not a program").unwrap();
        let settings = EngineSettings {
            binary: not_executable.to_str().unwrap().to_string(),
            ..EngineSettings::default()
        };
        let executor = EngineExecutor::new(EngineExecutorConfig {
            command: EngineCommand::resolve_with_override(&settings, None).unwrap(),
            memory_limit_bytes: None,
            memory_poll: Duration::from_millis(20),
            watchdog_slack: Duration::ZERO,
            sampling: None,
        });
        let err = executor
            .execute(&case(Duration::from_secs(5)), &dir.path().join("case.log"))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Launch { .. }), "got {err:?}");
        assert!(!dir.path().join("case.log").exists(), "empty log left behind");
    }

    #[test]
    fn populated_working_directory_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let work_dir = root.path().join("bacon_baseline");
        std::fs::create_dir_all(work_dir.join("work_dir/corpus")).unwrap();
        std::fs::write(work_dir.join("work_dir/corpus/state_0"), "stale").unwrap();
        let mut case = case(Duration::from_secs(5));
        case.working_directory = Some(work_dir.clone());

        let logs = tempfile::tempdir().unwrap();
        let log_path = logs.path().join(case.log_file_name());
        let err = executor(&["clean"], None, None)
            .execute(&case, &log_path)
            .unwrap_err();
        match err {
            HarnessError::Output { path, source } => {
                assert_eq!(path, work_dir);
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!log_path.exists());
        assert_eq!(
            std::fs::read_to_string(work_dir.join("work_dir/corpus/state_0")).unwrap(),
            "stale"
        );
    }

    #[test]
    fn termination_recorded_before_exit_is_reported() {
        let mut child = Command::new("sh").args(["-c", "exit 0"]).spawn().unwrap();
        // Let the child exit before the watchdog's request is observed.
        thread::sleep(Duration::from_millis(200));
        let control = RunControl::new();
        assert!(control.request_termination(TerminationReason::MemoryLimit));
        let (status, reason) = supervise(&mut child, &control).unwrap();
        assert!(status.success());
        assert_eq!(reason, Some(TerminationReason::MemoryLimit));
    }

    #[test]
    fn missing_engine_is_reported() {
        let settings = EngineSettings {
            binary: "definitely-not-an-engine-12345".to_string(),
            ..EngineSettings::default()
        };
        assert!(matches!(
            EngineCommand::resolve_with_override(&settings, None),
            Err(HarnessError::EngineNotFound { .. })
        ));
        assert!(matches!(
            EngineCommand::resolve_with_override(
                &EngineSettings::default(),
                Some(OsString::from("/nonexistent/ityfuzz"))
            ),
            Err(HarnessError::EngineNotFound { .. })
        ));
    }

    #[test]
    fn environment_override_replaces_binary() {
        let command = EngineCommand::resolve_with_override(
            &EngineSettings::default(),
            Some(OsString::from("sh")),
        )
        .unwrap();
        assert!(command.binary.ends_with("sh"));
        assert_eq!(command.args, EngineSettings::default().args);
    }

    #[test]
    fn exit_info_descriptions() {
        let by_signal = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(by_signal.describe(), "Terminated by signal 9");
        assert!(!by_signal.success());
        assert!(
            ExitInfo {
                code: Some(0),
                signal: None
            }
            .success()
        );
    }
}
