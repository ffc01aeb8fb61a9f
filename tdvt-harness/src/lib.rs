use std::io;
use thiserror::Error;

pub mod datasource;
pub mod diff;
pub mod diff_fixtures;
pub mod discover;
pub mod ini;
pub mod log;
pub mod query_tool;
pub mod report;
pub mod rerun;
pub mod resources;
pub mod result_xml;
pub mod runner;
pub mod suite;
pub mod test_set;

pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
  #[error(transparent)]
  Io(#[from] io::Error),
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Parse(#[from] ParseError),
  #[error(transparent)]
  Execution(#[from] ExecutionError),
  #[error(transparent)]
  RerunState(#[from] RerunStateError),
  #[error("dispatched {expected} test(s) but collected {actual} result(s)")]
  CountMismatch { expected: usize, actual: usize },
  #[error("invalid filter '{0}'")]
  InvalidFilter(String),
  #[error("report failed: {0}")]
  Report(String),
}

pub use datasource::{list_datasources, load_datasource, load_datasource_file, DatasourceTests};
pub use diff::{diff_outputs, select_best_match, BestMatch, DiffEntry, DiffKind, DiffOutcome};
pub use diff_fixtures::{check_diff_fixtures, FixtureOutcome};
pub use discover::{build_filter, enumerate_tests, expected_candidates, Filter, TestUnit};
pub use ini::{ConfigError, IniDocument, IniSection};
pub use log::RunLog;
pub use query_tool::{ExecutionError, ProcessRunner, QueryRunner};
pub use report::{RunReport, Summary, REPORT_SCHEMA_VERSION};
pub use rerun::{persist, rehydrate, RerunStateError, RERUN_FILE_NAME};
pub use resources::resolve_resource;
pub use result_xml::{parse_result_document, parse_result_file, ParseError, ParsedTestOutput};
pub use runner::{all_passed, run_units, verify_result_count, RunOptions, TestRunResult};
pub use suite::{
  collect_units, rerun_failed, run_datasource, DatasourceRunOptions, FamilySelection, SuiteOutcome,
};
pub use test_set::{TestFamily, TestInvocationConfig, TestSet};
