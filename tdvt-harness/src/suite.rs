use crate::datasource::{load_datasource_file, DatasourceTests};
use crate::discover::{enumerate_tests, Filter, TestUnit};
use crate::log::RunLog;
use crate::query_tool::QueryRunner;
use crate::rerun::{persist, rehydrate, RERUN_FILE_NAME};
use crate::runner::{run_units, RunOptions, TestRunResult};
use crate::test_set::{TestFamily, TestInvocationConfig};
use crate::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FamilySelection {
  #[default]
  All,
  LogicalOnly,
  ExpressionOnly,
}

impl FamilySelection {
  pub fn includes(self, family: TestFamily) -> bool {
    match self {
      FamilySelection::All => true,
      FamilySelection::LogicalOnly => family == TestFamily::Logical,
      FamilySelection::ExpressionOnly => family == TestFamily::Expression,
    }
  }
}

#[derive(Debug, Clone)]
pub struct DatasourceRunOptions {
  pub config_path: PathBuf,
  pub datasource: String,
  pub root: PathBuf,
  pub families: FamilySelection,
  /// Comparison flags and extra tool arguments. The family flag is set per
  /// test set; an override here replaces the one from the config file.
  pub invocation: TestInvocationConfig,
  pub filter: Filter,
  /// Worker count; falls back to the datasource's `max_threads`, then the CPU count.
  pub jobs: Option<usize>,
  pub timeout: Duration,
  pub output_dir: PathBuf,
}

#[derive(Debug)]
pub struct SuiteOutcome {
  /// The resolved matrix, for runs started from a config file.
  pub datasource: Option<DatasourceTests>,
  pub results: BTreeMap<String, TestRunResult>,
  /// Rerun file written for the failures, if any failed.
  pub failures_file: Option<PathBuf>,
}

impl SuiteOutcome {
  pub fn all_passed(&self) -> bool {
    self.results.values().all(|result| result.passed)
  }
}

/// Expands every selected test set of a datasource into units, matching
/// `filter` against unit identities.
pub fn collect_units(
  tests: &DatasourceTests,
  root: &Path,
  families: FamilySelection,
  invocation: &TestInvocationConfig,
  filter: &Filter,
) -> Result<Vec<TestUnit>> {
  let mut units = Vec::new();
  for family in [TestFamily::Logical, TestFamily::Expression] {
    if !families.includes(family) {
      continue;
    }
    let mut config = invocation.for_family(family);
    if config.datasource_override.is_none() {
      config.datasource_override = tests.datasource_override.clone();
    }
    for set in tests.tests_for(family) {
      let found = enumerate_tests(root, set, &config)?;
      let before = units.len();
      units.extend(found.into_iter().filter(|unit| filter.matches(&unit.id)));
      tracing::debug!(set = %set, units = units.len() - before, "enumerated test set");
    }
  }
  Ok(units)
}

/// Resolves, runs and records one datasource's tests.
pub fn run_datasource(
  options: &DatasourceRunOptions,
  runner: &dyn QueryRunner,
  log: &RunLog,
) -> Result<SuiteOutcome> {
  let tests = load_datasource_file(&options.config_path, &options.datasource)?;
  if tests.is_empty() {
    log.warn(format!(
      "no test sets configured for datasource '{}' in {}",
      options.datasource,
      options.config_path.display()
    ));
  }
  for set in tests.all_tests() {
    log.line(format!("test set: {set}"));
  }
  if !options.invocation.compares_anything() {
    log.warn("neither SQL nor tuples are compared; every test will pass");
  }

  let units = collect_units(
    &tests,
    &options.root,
    options.families,
    &options.invocation,
    &options.filter,
  )?;
  let run = RunOptions {
    jobs: worker_count(options.jobs, tests.max_threads),
    timeout: options.timeout,
    output_dir: options.output_dir.clone(),
  };

  let (results, failures_file) = execute_and_record(units, runner, &options.root, &run, log)?;
  Ok(SuiteOutcome {
    datasource: Some(tests),
    results,
    failures_file,
  })
}

/// `--jobs` wins over the configured `max_threads`; otherwise one worker per CPU.
fn worker_count(requested: Option<usize>, configured: Option<usize>) -> usize {
  requested
    .or(configured)
    .unwrap_or_else(|| num_cpus::get().max(1))
}

/// Replays the units recorded in `file`, with the recorded flags.
pub fn rerun_failed(
  file: &Path,
  root: &Path,
  ambient: &TestInvocationConfig,
  run: &RunOptions,
  runner: &dyn QueryRunner,
  log: &RunLog,
) -> Result<SuiteOutcome> {
  let units = rehydrate(file, root, ambient)?;
  log.line(format!("rerunning {} test(s) from {}", units.len(), file.display()));
  let (results, failures_file) = execute_and_record(units, runner, root, run, log)?;
  Ok(SuiteOutcome {
    datasource: None,
    results,
    failures_file,
  })
}

fn execute_and_record(
  units: Vec<TestUnit>,
  runner: &dyn QueryRunner,
  root: &Path,
  run: &RunOptions,
  log: &RunLog,
) -> Result<(BTreeMap<String, TestRunResult>, Option<PathBuf>)> {
  let results = run_units(units, runner, run, log)?;
  let failures_path = run.output_dir.join(RERUN_FILE_NAME);
  let written = persist(&results, root, &failures_path, log)?;
  Ok((results, (written > 0).then_some(failures_path)))
}
