pub mod config;
pub mod corpus;
pub mod driver;
pub mod error;
pub mod executor;
pub mod matrix;
pub mod observer;
pub mod oracle;
pub mod probe;
pub mod results;
pub mod summary;

pub use config::{ConfigError, HarnessConfig, STARTER_CONFIG};
pub use corpus::{CorpusSnapshot, OverheadStats};
pub use driver::{MatrixDriver, PassLayout, PassOptions, PassReport, run_pass};
pub use error::HarnessError;
pub use executor::{EngineExecutor, Executor, RawRunOutput};
pub use matrix::{TestCase, TestMatrix};
pub use observer::{Observer, RunControl};
pub use oracle::{LogOracle, Oracle, OutcomeKind, RunOutcome};
pub use results::{ResultSink, ResultStore, RunResult, StoreError, load_results};
pub use summary::{SummaryRow, summarize};
