use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable that replaces `engine.binary` without editing the config file.
pub const ENGINE_ENV_OVERRIDE: &str = "ABLATE_ENGINE";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Unknown target '{name}'. Available: {available}")]
    UnknownTarget { name: String, available: String },
    #[error("Unknown configuration '{name}'. Available: {available}")]
    UnknownConfiguration { name: String, available: String },
    #[error("Contract for target '{target}' not found at {path:?}")]
    MissingContract { target: String, path: PathBuf },
    #[error("Invalid {name} pattern: {source}")]
    Pattern {
        name: &'static str,
        #[source]
        source: regex::Error,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    #[serde(default = "default_engine_binary")]
    pub binary: String,
    #[serde(default = "default_engine_args")]
    pub args: Vec<String>,
    #[serde(default = "default_overhead_args")]
    pub overhead_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_engine_binary() -> String {
    "ityfuzz".to_string()
}

fn default_engine_args() -> Vec<String> {
    ["--contract", "{contract}", "--evm", "--timeout", "{timeout}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_overhead_args() -> Vec<String> {
    vec!["--verbose".to_string()]
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            args: default_engine_args(),
            overhead_args: default_overhead_args(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HarnessSettings {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default = "default_memory_poll_ms")]
    pub memory_poll_ms: u64,
    #[serde(default)]
    pub watchdog_slack_seconds: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

pub fn default_timeout_seconds() -> u64 {
    3600
}

fn default_memory_poll_ms() -> u64 {
    500
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

pub fn default_workers() -> usize {
    1
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            memory_limit_mb: None,
            memory_poll_ms: default_memory_poll_ms(),
            watchdog_slack_seconds: 0,
            output_dir: default_output_dir(),
            workers: default_workers(),
        }
    }
}

impl HarnessSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit_mb.map(|mb| mb * 1024 * 1024)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OverheadSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_corpus_dir")]
    pub corpus_dir: PathBuf,
}

fn default_sample_interval_ms() -> u64 {
    2000
}

fn default_corpus_dir() -> PathBuf {
    PathBuf::from("work_dir")
}

impl Default for OverheadSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_interval_ms: default_sample_interval_ms(),
            corpus_dir: default_corpus_dir(),
        }
    }
}

/// Optional overrides for the log patterns the oracle looks for.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ParserSettings {
    pub marker_pattern: Option<String>,
    pub elapsed_pattern: Option<String>,
    pub oom_patterns: Option<Vec<String>>,
    /// Marker lines matching this are skipped. An empty string disables the filter.
    pub ignore_pattern: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSpec {
    pub id: String,
    pub contract: PathBuf,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ConfigurationSpec {
    pub id: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub harness: HarnessSettings,
    #[serde(default)]
    pub overhead: OverheadSettings,
    #[serde(default)]
    pub parser: ParserSettings,
    pub targets: Vec<TargetSpec>,
    pub configurations: Vec<ConfigurationSpec>,
}

impl HarnessConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&content, base_dir).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parses and validates a config, resolving relative paths against `base_dir`.
    pub fn from_toml_str(content: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let mut config: HarnessConfig =
            toml::from_str(content).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        config.resolve_paths(base_dir);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        let resolve = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base_dir.join(p)
            }
        };
        self.harness.output_dir = resolve(&self.harness.output_dir);
        for target in &mut self.targets {
            target.contract = resolve(&target.contract);
            if let Some(dir) = target.working_dir.take() {
                target.working_dir = Some(resolve(&dir));
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.binary.trim().is_empty() {
            return Err(ConfigError::Invalid("engine.binary is empty".into()));
        }
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid("no [[targets]] defined".into()));
        }
        if self.configurations.is_empty() {
            return Err(ConfigError::Invalid("no [[configurations]] defined".into()));
        }
        if self.harness.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "harness.timeout-seconds must be positive".into(),
            ));
        }
        if self.harness.workers == 0 {
            return Err(ConfigError::Invalid("harness.workers must be at least 1".into()));
        }
        if self.harness.memory_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "harness.memory-poll-ms must be positive".into(),
            ));
        }
        if self.harness.memory_limit_mb == Some(0) {
            return Err(ConfigError::Invalid(
                "harness.memory-limit-mb must be positive when set".into(),
            ));
        }
        if self.overhead.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "overhead.sample-interval-ms must be positive".into(),
            ));
        }
        check_ids("target", self.targets.iter().map(|t| t.id.as_str()))?;
        check_ids(
            "configuration",
            self.configurations.iter().map(|c| c.id.as_str()),
        )?;
        Ok(())
    }

    pub fn target(&self, id: &str) -> Result<&TargetSpec, ConfigError> {
        self.targets
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| ConfigError::UnknownTarget {
                name: id.to_string(),
                available: self.target_ids().join(", "),
            })
    }

    pub fn configuration(&self, id: &str) -> Result<&ConfigurationSpec, ConfigError> {
        self.configurations
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| ConfigError::UnknownConfiguration {
                name: id.to_string(),
                available: self.configuration_ids().join(", "),
            })
    }

    pub fn target_ids(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.id.as_str()).collect()
    }

    pub fn configuration_ids(&self) -> Vec<&str> {
        self.configurations.iter().map(|c| c.id.as_str()).collect()
    }
}

fn check_ids<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !is_valid_id(id) {
            return Err(ConfigError::Invalid(format!(
                "{kind} id '{id}' must be non-empty and only use [A-Za-z0-9._-]"
            )));
        }
        if !seen.insert(id) {
            return Err(ConfigError::Invalid(format!("duplicate {kind} id '{id}'")));
        }
    }
    Ok(())
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Starter configuration written by `ablate init`: the reference ablation matrix.
pub const STARTER_CONFIG: &str = r#"# ablate harness configuration

[engine]
binary = "ityfuzz"
args = ["--contract", "{contract}", "--evm", "--timeout", "{timeout}"]
overhead-args = ["--verbose"]

[harness]
timeout-seconds = 3600
memory-poll-ms = 500
output-dir = "results"
workers = 1

[overhead]
enabled = false
sample-interval-ms = 2000
corpus-dir = "work_dir"

[[targets]]
id = "dvd_unstoppable"
contract = "contracts/dvd_unstoppable.sol"

[[targets]]
id = "bacon_protocol"
contract = "contracts/bacon_protocol.sol"

[[targets]]
id = "n00d_token"
contract = "contracts/n00d_token.sol"

[[targets]]
id = "egd_finance"
contract = "contracts/egd_finance.sol"

[[targets]]
id = "contract1_undisclosed"
contract = "contracts/contract1_undisclosed.sol"

[[targets]]
id = "contract2_undisclosed"
contract = "contracts/contract2_undisclosed.sol"

[[configurations]]
id = "ItyFuzz"
flags = []

[[configurations]]
id = "ItyFuzz-DF"
flags = ["--dataflow"]

[[configurations]]
id = "ItyFuzz-Rand"
flags = ["--random"]
"#;
