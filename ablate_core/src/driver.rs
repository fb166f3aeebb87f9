use crate::config::{ConfigError, HarnessConfig};
use crate::error::HarnessError;
use crate::executor::{EngineExecutor, EngineExecutorConfig, Executor};
use crate::matrix::{TestCase, TestMatrix};
use crate::oracle::{LogOracle, Oracle, RunOutcome};
use crate::results::{ResultSink, ResultStore, RunResult};
use crate::summary::{SUMMARY_FILE, SummaryRow, summarize, write_summary_csv};
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Instant;
use tracing::{error, info, warn};

const LOGS_DIR: &str = "logs";

/// Directory layout of one pass: `<output-dir>/<pass-name>/` with a `logs/` folder.
#[derive(Debug, Clone)]
pub struct PassLayout {
    pub root: PathBuf,
    pub logs_dir: PathBuf,
}

impl PassLayout {
    /// Creates the pass directory. An existing directory is only reused while it is empty.
    pub fn prepare(output_dir: &Path, pass_name: &str) -> Result<Self, HarnessError> {
        if pass_name.is_empty()
            || pass_name == "."
            || pass_name == ".."
            || pass_name.contains(['/', '\\'])
        {
            return Err(ConfigError::Invalid(format!("invalid pass name '{pass_name}'")).into());
        }
        let root = output_dir.join(pass_name);
        let output_error = |path: &Path, source| HarnessError::Output {
            path: path.to_path_buf(),
            source,
        };
        match std::fs::read_dir(&root) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return Err(output_error(
                        &root,
                        io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            "pass directory already contains results",
                        ),
                    ));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(output_error(&root, e)),
        }
        let logs_dir = root.join(LOGS_DIR);
        std::fs::create_dir_all(&logs_dir).map_err(|e| output_error(&logs_dir, e))?;
        Ok(Self { root, logs_dir })
    }
}

/// UTC timestamp such as `20240131-235959`.
pub fn default_pass_name() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Runs every case of a matrix through executor, oracle and sink.
pub struct MatrixDriver<'a> {
    executor: &'a dyn Executor,
    oracle: &'a dyn Oracle,
    sink: &'a dyn ResultSink,
    logs_dir: PathBuf,
    workers: usize,
}

impl<'a> MatrixDriver<'a> {
    pub fn new(
        executor: &'a dyn Executor,
        oracle: &'a dyn Oracle,
        sink: &'a dyn ResultSink,
        logs_dir: PathBuf,
        workers: usize,
    ) -> Self {
        Self {
            executor,
            oracle,
            sink,
            logs_dir,
            workers,
        }
    }

    /// Executes the matrix and returns one result per case, in matrix order.
    ///
    /// With more than one worker, cases are handed out through a shared index
    /// to a bounded set of scoped threads. The first fatal error stops every
    /// worker from taking new cases; cases already running finish and are
    /// recorded before the error is returned.
    pub fn run(&self, matrix: &TestMatrix) -> Result<Vec<RunResult>, HarnessError> {
        let cases = matrix.cases();
        let total = cases.len();
        let workers = self.workers.clamp(1, total.max(1));
        info!(cases = total, workers, "starting matrix");

        let next = AtomicUsize::new(0);
        let finished = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let failure: Mutex<Option<HarnessError>> = Mutex::new(None);
        let slots: Mutex<Vec<Option<RunResult>>> = Mutex::new(vec![None; total]);

        let worker = || {
            while !abort.load(Ordering::SeqCst) {
                let index = next.fetch_add(1, Ordering::SeqCst);
                let Some(case) = cases.get(index) else {
                    break;
                };
                let started = Instant::now();
                match self.run_case(case) {
                    Ok(result) => {
                        let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                        println!(
                            "[{done}/{total}] {} / {} -> {} ({:.1}s)",
                            case.target,
                            case.configuration,
                            describe(&result.outcome),
                            started.elapsed().as_secs_f64()
                        );
                        slots.lock().unwrap_or_else(PoisonError::into_inner)[index] = Some(result);
                    }
                    Err(e) => {
                        error!(case = %case.id(), error = %e, "aborting matrix");
                        abort.store(true, Ordering::SeqCst);
                        failure
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get_or_insert(e);
                        break;
                    }
                }
            }
        };

        if workers == 1 {
            worker();
        } else {
            thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(&worker);
                }
            });
        }

        if let Some(e) = failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(e);
        }
        let results: Vec<RunResult> = slots
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .flatten()
            .collect();
        debug_assert_eq!(results.len(), total);
        Ok(results)
    }

    fn run_case(&self, case: &TestCase) -> Result<RunResult, HarnessError> {
        let log_path = self.logs_dir.join(case.log_file_name());
        let raw = self.executor.execute(case, &log_path)?;
        let log = read_log(&log_path);
        let outcome = self.oracle.examine(&raw, &log, case.timeout);
        let result = RunResult::from_run(case, outcome, &raw);
        self.sink
            .append(&result, &raw)
            .map_err(|source| HarnessError::Persist {
                case: case.id(),
                source,
            })?;
        info!(case = %case.id(), outcome = %outcome.kind(), "case recorded");
        Ok(result)
    }
}

/// Engines may print invalid UTF-8; an unreadable log is classified as empty.
fn read_log(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(?path, error = %e, "could not read case log");
            String::new()
        }
    }
}

fn describe(outcome: &RunOutcome) -> String {
    match outcome.detection_time_seconds() {
        Some(t) => format!("{} at {t:.1}s", outcome.kind()),
        None => outcome.kind().to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct PassOptions {
    pub overhead: bool,
    /// Defaults to [`default_pass_name`].
    pub pass_name: Option<String>,
}

#[derive(Debug)]
pub struct PassReport {
    pub layout: PassLayout,
    pub results: Vec<RunResult>,
    pub summary: Vec<SummaryRow>,
}

/// One complete pass: check the contracts, resolve the engine, prepare the
/// pass directory, run the matrix, then write `metrics.json` and `summary.csv`.
pub fn run_pass(
    config: &HarnessConfig,
    matrix: &TestMatrix,
    options: &PassOptions,
) -> Result<PassReport, HarnessError> {
    matrix.check_contracts()?;
    let overhead = options.overhead || config.overhead.enabled;
    let executor = EngineExecutor::new(EngineExecutorConfig::from_harness_config(
        config, overhead,
    )?);
    let oracle = LogOracle::from_settings(&config.parser)?;

    let pass_name = options.pass_name.clone().unwrap_or_else(default_pass_name);
    let layout = PassLayout::prepare(&config.harness.output_dir, &pass_name)?;
    let store = ResultStore::create(&layout.root)?;
    info!(pass = %layout.root.display(), overhead, "pass directory ready");

    let driver = MatrixDriver::new(
        &executor,
        &oracle,
        &store,
        layout.logs_dir.clone(),
        config.harness.workers,
    );
    let results = match driver.run(matrix) {
        Ok(results) => results,
        Err(e) => {
            if let Err(finalize_error) = store.finalize() {
                warn!(error = %finalize_error, "could not write metrics for aborted pass");
            }
            return Err(e);
        }
    };

    store.finalize()?;
    let summary = summarize(&results);
    write_summary_csv(&layout.root.join(SUMMARY_FILE), &summary)?;
    Ok(PassReport {
        layout,
        results,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExitInfo, RawRunOutput};
    use crate::observer::RunTelemetry;
    use crate::results::{METRICS_FILE, MetricsEntry, StoreError, load_results};
    use std::collections::{BTreeMap, HashSet};
    use std::time::Duration;
    use tempfile::tempdir;

    /// Writes a scripted log instead of launching anything.
    struct ScriptedExecutor {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_on: Option<String>,
    }

    impl ScriptedExecutor {
        fn new(fail_on: Option<&str>) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fail_on: fail_on.map(str::to_string),
            }
        }
    }

    impl Executor for ScriptedExecutor {
        fn execute(&self, case: &TestCase, log_path: &Path) -> Result<RawRunOutput, HarnessError> {
            if self.fail_on.as_deref() == Some(case.id().as_str()) {
                return Err(HarnessError::Launch {
                    binary: PathBuf::from("ityfuzz"),
                    case: case.id(),
                    source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
                });
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let started_at = Utc::now();
            thread::sleep(Duration::from_millis(20));
            let log = if case.target.ends_with('0') {
                "[4.5s] Found vulnerabilities!\n"
            } else {
                "[INFO] nothing found\n"
            };
            std::fs::write(log_path, log).unwrap();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(RawRunOutput {
                exit: ExitInfo {
                    code: Some(0),
                    signal: None,
                },
                timed_out: false,
                oom: false,
                log_path: log_path.to_path_buf(),
                wall_clock: Duration::from_millis(20),
                started_at,
                ended_at: Utc::now(),
                telemetry: RunTelemetry::default(),
            })
        }
    }

    struct RejectingSink;

    impl ResultSink for RejectingSink {
        fn append(&self, _: &RunResult, _: &RawRunOutput) -> Result<(), StoreError> {
            Err(StoreError::Io {
                path: PathBuf::from("results.csv"),
                source: io::Error::new(io::ErrorKind::StorageFull, "disk full"),
            })
        }
    }

    fn cases(count: usize) -> TestMatrix {
        let cases = (0..count)
            .map(|i| TestCase {
                target: format!("target{i}"),
                configuration: "baseline".to_string(),
                contract: PathBuf::from(format!("target{i}.sol")),
                timeout: Duration::from_secs(60),
                working_directory: None,
                extra_flags: Vec::new(),
            })
            .collect();
        TestMatrix::from_cases(cases).unwrap()
    }

    #[test]
    fn bounded_pool_records_every_case() {
        let dir = tempdir().unwrap();
        let layout = PassLayout::prepare(dir.path(), "pool").unwrap();
        let store = ResultStore::create(&layout.root).unwrap();
        let executor = ScriptedExecutor::new(None);
        let oracle = LogOracle::default();
        let driver = MatrixDriver::new(&executor, &oracle, &store, layout.logs_dir.clone(), 3);

        let matrix = cases(7);
        let results = driver.run(&matrix).unwrap();
        assert_eq!(results.len(), 7);
        let order: Vec<String> = results.iter().map(|r| r.target.clone()).collect();
        let expected: Vec<String> = matrix.cases().iter().map(|c| c.target.clone()).collect();
        assert_eq!(order, expected);
        assert!(executor.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert_eq!(results[0].detection_time_seconds(), Some(4.5));
        assert_eq!(results[1].outcome, RunOutcome::ParseFailure);

        let loaded = load_results(store.csv_path()).unwrap();
        assert_eq!(loaded.len(), 7);
        let keys: HashSet<String> = loaded.iter().map(|r| r.key()).collect();
        assert_eq!(keys.len(), 7);
    }

    #[test]
    fn launch_failure_stops_the_matrix() {
        let dir = tempdir().unwrap();
        let layout = PassLayout::prepare(dir.path(), "fatal").unwrap();
        let store = ResultStore::create(&layout.root).unwrap();
        let executor = ScriptedExecutor::new(Some("target2/baseline"));
        let oracle = LogOracle::default();
        let driver = MatrixDriver::new(&executor, &oracle, &store, layout.logs_dir.clone(), 1);

        match driver.run(&cases(5)) {
            Err(HarnessError::Launch { case, .. }) => assert_eq!(case, "target2/baseline"),
            other => panic!("expected launch failure, got {other:?}"),
        }
        assert_eq!(load_results(store.csv_path()).unwrap().len(), 2);
    }

    #[test]
    fn persistence_failure_names_the_case() {
        let dir = tempdir().unwrap();
        let executor = ScriptedExecutor::new(None);
        let oracle = LogOracle::default();
        let driver = MatrixDriver::new(
            &executor,
            &oracle,
            &RejectingSink,
            dir.path().to_path_buf(),
            2,
        );
        let err = driver.run(&cases(4)).unwrap_err();
        assert!(matches!(err, HarnessError::Persist { .. }), "got {err:?}");
        assert!(err.to_string().contains("/baseline"));
    }

    #[test]
    fn pass_directory_must_be_fresh() {
        let dir = tempdir().unwrap();
        let layout = PassLayout::prepare(dir.path(), "first").unwrap();
        assert!(layout.logs_dir.is_dir());
        assert!(matches!(
            PassLayout::prepare(dir.path(), "first"),
            Err(HarnessError::Output { .. })
        ));

        std::fs::create_dir(dir.path().join("empty")).unwrap();
        assert!(PassLayout::prepare(dir.path(), "empty").is_ok());
        assert!(matches!(
            PassLayout::prepare(dir.path(), "../escape"),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn default_pass_name_is_a_timestamp() {
        let name = default_pass_name();
        assert_eq!(name.len(), "20240131-235959".len());
        assert_eq!(name.as_bytes()[8], b'-');
    }

    fn fake_engine_path() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../test_targets/fake_engine.sh")
    }

    fn write_contracts(dir: &Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), "contract Target {}").unwrap();
        }
    }

    #[test]
    fn missing_contract_fails_before_the_pass_starts() {
        let dir = tempdir().unwrap();
        write_contracts(dir.path(), &["present.sol"]);
        let config = HarnessConfig::from_toml_str(
            r#"
            [engine]
            binary = "sh"

            [harness]
            output-dir = "out"

            [[targets]]
            id = "present"
            contract = "present.sol"

            [[targets]]
            id = "typo"
            contract = "contracts/tpyo.sol"

            [[configurations]]
            id = "baseline"
            "#,
            dir.path(),
        )
        .unwrap();
        let matrix = TestMatrix::full(&config).unwrap();
        let options = PassOptions {
            overhead: false,
            pass_name: Some("never".to_string()),
        };

        let err = run_pass(&config, &matrix, &options).unwrap_err();
        assert!(
            matches!(err, HarnessError::Config(ConfigError::MissingContract { ref target, .. }) if target == "typo"),
            "got {err:?}"
        );
        assert!(!dir.path().join("out").exists());
    }

    #[cfg(unix)]
    #[test]
    fn configurations_get_separate_working_directories() {
        let dir = tempdir().unwrap();
        write_contracts(dir.path(), &["corpus.sol"]);
        let config = HarnessConfig::from_toml_str(
            &format!(
                r#"
                [engine]
                binary = "sh"
                args = ['{}', "{{target}}"]
                overhead-args = []

                [harness]
                timeout-seconds = 20
                workers = 1
                output-dir = "out"

                [overhead]
                sample-interval-ms = 100

                [[targets]]
                id = "corpus"
                contract = "corpus.sol"
                working-dir = "work"

                [[configurations]]
                id = "baseline"

                [[configurations]]
                id = "strategy-A"
                flags = ["--dataflow"]
                "#,
                fake_engine_path().display()
            ),
            dir.path(),
        )
        .unwrap();
        let matrix = TestMatrix::full(&config).unwrap();
        let options = PassOptions {
            overhead: true,
            pass_name: Some("isolated".to_string()),
        };

        let report = run_pass(&config, &matrix, &options).unwrap();
        assert_eq!(report.results.len(), 2);

        let metrics: BTreeMap<String, MetricsEntry> = serde_json::from_str(
            &std::fs::read_to_string(report.layout.root.join(METRICS_FILE)).unwrap(),
        )
        .unwrap();
        for configuration in ["baseline", "strategy-A"] {
            let entry = &metrics[&format!("corpus/{configuration}")];
            let first = entry.snapshots.first().expect("sampled at least once");
            // A shared directory would already hold the previous case's corpus.
            assert!(
                first.corpus_entry_count < 15,
                "{configuration} started with {} entries",
                first.corpus_entry_count
            );
            let corpus = dir
                .path()
                .join(format!("work/corpus_{configuration}/work_dir/corpus"));
            assert_eq!(std::fs::read_dir(&corpus).unwrap().count(), 15);
        }

        // Rerunning against populated working directories refuses to mix state.
        let rerun = PassOptions {
            overhead: true,
            pass_name: Some("again".to_string()),
        };
        assert!(matches!(
            run_pass(&config, &matrix, &rerun),
            Err(HarnessError::Output { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn full_pass_with_simulated_engine() {
        let script = fake_engine_path();
        let dir = tempdir().unwrap();
        write_contracts(dir.path(), &["markers.sol", "crash.sol", "clean.sol"]);
        let config = HarnessConfig::from_toml_str(
            &format!(
                r#"
                [engine]
                binary = "sh"
                args = ['{}', "{{target}}"]

                [harness]
                timeout-seconds = 10
                workers = 2
                output-dir = "out"

                [[targets]]
                id = "markers"
                contract = "markers.sol"

                [[targets]]
                id = "crash"
                contract = "crash.sol"

                [[targets]]
                id = "clean"
                contract = "clean.sol"

                [[configurations]]
                id = "baseline"

                [[configurations]]
                id = "strategy-A"
                flags = ["--dataflow"]
                "#,
                script.display()
            ),
            dir.path(),
        )
        .unwrap();
        let matrix = TestMatrix::full(&config).unwrap();
        let options = PassOptions {
            overhead: false,
            pass_name: Some("it".to_string()),
        };

        let report = run_pass(&config, &matrix, &options).unwrap();
        assert_eq!(report.results.len(), 6);
        let outcome_of = |target: &str| {
            report
                .results
                .iter()
                .find(|r| r.target == target)
                .unwrap()
                .outcome
        };
        assert_eq!(
            outcome_of("markers"),
            RunOutcome::Success {
                detection_time_seconds: 12.5
            }
        );
        assert_eq!(outcome_of("crash"), RunOutcome::Crash);
        assert_eq!(outcome_of("clean"), RunOutcome::ParseFailure);

        let root = dir.path().join("out/it");
        for file in [
            "results.csv",
            "metrics.jsonl",
            "metrics.json",
            "summary.csv",
            "logs/markers_baseline.log",
            "logs/clean_strategy-A.log",
        ] {
            assert!(root.join(file).exists(), "missing {file}");
        }
        assert_eq!(load_results(&root.join("results.csv")).unwrap().len(), 6);
        assert_eq!(summarize(&report.results), report.summary);

        assert!(matches!(
            run_pass(&config, &matrix, &options),
            Err(HarnessError::Output { .. })
        ));
    }
}
