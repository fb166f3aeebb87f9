use crate::config::{ConfigError, ConfigurationSpec, HarnessConfig, TargetSpec};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// One harness invocation: a target paired with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub target: String,
    pub configuration: String,
    pub contract: PathBuf,
    pub timeout: Duration,
    /// When `None` the executor creates a temporary directory for the run.
    /// Otherwise a per-case directory below the target's `working-dir`.
    pub working_directory: Option<PathBuf>,
    /// Configuration flags followed by target flags.
    pub extra_flags: Vec<String>,
}

impl TestCase {
    fn from_specs(target: &TargetSpec, configuration: &ConfigurationSpec, timeout: Duration) -> Self {
        let mut extra_flags = configuration.flags.clone();
        extra_flags.extend(target.flags.iter().cloned());
        let case_dir = format!("{}_{}", target.id, configuration.id);
        Self {
            target: target.id.clone(),
            configuration: configuration.id.clone(),
            contract: target.contract.clone(),
            timeout,
            working_directory: target.working_dir.as_ref().map(|dir| dir.join(&case_dir)),
            extra_flags,
        }
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.target, self.configuration)
    }

    pub fn log_file_name(&self) -> String {
        format!("{}_{}.log", self.target, self.configuration)
    }

    /// Fails unless the contract exists as a regular file.
    pub fn check_contract(&self) -> Result<(), ConfigError> {
        if self.contract.is_file() {
            Ok(())
        } else {
            Err(ConfigError::MissingContract {
                target: self.target.clone(),
                path: self.contract.clone(),
            })
        }
    }
}

/// The ordered list of cases a pass executes.
#[derive(Debug, Clone)]
pub struct TestMatrix {
    cases: Vec<TestCase>,
}

impl TestMatrix {
    /// Cross product of every target with every configuration, target-major.
    pub fn full(config: &HarnessConfig) -> Result<Self, ConfigError> {
        let timeout = config.harness.timeout();
        let cases = config
            .targets
            .iter()
            .flat_map(|target| {
                config
                    .configurations
                    .iter()
                    .map(move |configuration| TestCase::from_specs(target, configuration, timeout))
            })
            .collect();
        Self::from_cases(cases)
    }

    /// A single case. Without an explicit configuration the first configured one is used.
    pub fn single(
        config: &HarnessConfig,
        target: &str,
        configuration: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let target = config.target(target)?;
        let configuration = match configuration {
            Some(id) => config.configuration(id)?,
            None => config
                .configurations
                .first()
                .ok_or_else(|| ConfigError::Invalid("no [[configurations]] defined".into()))?,
        };
        Self::from_cases(vec![TestCase::from_specs(
            target,
            configuration,
            config.harness.timeout(),
        )])
    }

    pub fn from_cases(cases: Vec<TestCase>) -> Result<Self, ConfigError> {
        let mut names = HashSet::new();
        for case in &cases {
            if !names.insert(case.log_file_name()) {
                return Err(ConfigError::Invalid(format!(
                    "case {} collides with another case on log file {}",
                    case.id(),
                    case.log_file_name()
                )));
            }
        }
        Ok(Self { cases })
    }

    /// Checks every contract up front so a typo fails before any engine runs.
    pub fn check_contracts(&self) -> Result<(), ConfigError> {
        self.cases.iter().try_for_each(TestCase::check_contract)
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}
