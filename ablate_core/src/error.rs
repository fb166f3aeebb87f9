use crate::config::ConfigError;
use crate::results::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a harness pass.
///
/// Per-case outcomes such as timeouts or crashes are never represented here;
/// they are recorded as results and the matrix keeps going. Everything in this
/// enum means the comparison table can no longer be trusted, so the driver
/// stops and the CLI exits non-zero.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// The configuration file could not be read, parsed, or validated.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The engine binary could not be located on disk or on `PATH`.
    #[error("Engine binary '{binary}' not found: {reason}")]
    EngineNotFound { binary: String, reason: String },

    /// The engine was located but the operating system refused to start it.
    #[error("Failed to launch engine {binary:?} for case {case}: {source}")]
    Launch {
        binary: PathBuf,
        case: String,
        #[source]
        source: std::io::Error,
    },

    /// An output location (pass directory, log file, working directory) is unusable.
    #[error("Output path {path:?} unusable: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on or terminating the engine process failed.
    #[error("Process control failed for case {case}: {source}")]
    ProcessControl {
        case: String,
        #[source]
        source: std::io::Error,
    },

    /// A finished case could not be appended to the results store.
    #[error("Result for case {case} could not be persisted: {source}")]
    Persist {
        case: String,
        #[source]
        source: StoreError,
    },

    /// The results store could not be opened or finalized.
    #[error("Results store failure: {0}")]
    Store(#[from] StoreError),
}
