use crate::diff::{select_best_match, DiffEntry};
use crate::discover::{expected_candidates, TestUnit};
use crate::log::RunLog;
use crate::query_tool::QueryRunner;
use crate::result_xml::{parse_result_file, ParsedTestOutput};
use crate::test_set::TestFamily;
use crate::{HarnessError, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct RunOptions {
  pub jobs: usize,
  pub timeout: Duration,
  pub output_dir: PathBuf,
}

impl RunOptions {
  pub fn new(output_dir: impl Into<PathBuf>) -> Self {
    Self {
      jobs: num_cpus::get().max(1),
      timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
      output_dir: output_dir.into(),
    }
  }
}

/// Outcome of one invocation unit.
#[derive(Debug, Clone, Serialize)]
pub struct TestRunResult {
  pub id: String,
  pub family: TestFamily,
  #[serde(skip)]
  pub unit: TestUnit,
  pub actual_path: PathBuf,
  #[serde(skip)]
  pub actual: Option<ParsedTestOutput>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub expected_path: Option<PathBuf>,
  #[serde(skip)]
  pub expected: Option<ParsedTestOutput>,
  pub diff_count: usize,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub diffs: Vec<DiffEntry>,
  #[serde(skip_serializing_if = "String::is_empty")]
  pub diff_text: String,
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub should_fail: bool,
  /// Why no verdict could be computed (tool failure, unreadable output, no
  /// expected file).
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub passed: bool,
  pub duration_ms: u128,
}

impl TestRunResult {
  fn pending(unit: TestUnit, actual_path: PathBuf) -> Self {
    Self {
      id: unit.id.clone(),
      family: unit.family(),
      should_fail: unit.should_fail(),
      unit,
      actual_path,
      actual: None,
      expected_path: None,
      expected: None,
      diff_count: 0,
      diffs: Vec::new(),
      diff_text: String::new(),
      error: None,
      passed: false,
      duration_ms: 0,
    }
  }

  fn fail_with(mut self, error: String) -> Self {
    self.error = Some(error);
    self.passed = false;
    self
  }

  /// Diff text if there is one, otherwise the error.
  pub fn failure_detail(&self) -> Option<String> {
    if let Some(err) = &self.error {
      return Some(err.clone());
    }
    if self.passed {
      return None;
    }
    if self.should_fail && self.diff_count == 0 {
      return Some("expected a difference (shouldfail) but outputs matched".to_string());
    }
    Some(self.diff_text.clone())
  }
}

pub fn all_passed(results: &BTreeMap<String, TestRunResult>) -> bool {
  results.values().all(|result| result.passed)
}

/// Fails with [`HarnessError::CountMismatch`] unless exactly `expected`
/// results were collected.
pub fn verify_result_count(expected: usize, actual: usize) -> Result<()> {
  if expected != actual {
    return Err(HarnessError::CountMismatch { expected, actual });
  }
  Ok(())
}

/// Runs every unit on a pool of `options.jobs` workers and returns the results
/// keyed by unit identity.
///
/// Per-unit failures become failing results; only harness-level problems are
/// returned as errors.
pub fn run_units(
  units: Vec<TestUnit>,
  runner: &dyn QueryRunner,
  options: &RunOptions,
  log: &RunLog,
) -> Result<BTreeMap<String, TestRunResult>> {
  let dispatched = units.len();
  let job_count = options.jobs.max(1);
  log.line(format!(
    "running {dispatched} test(s) with {job_count} worker(s)"
  ));

  let pool = rayon::ThreadPoolBuilder::new()
    .num_threads(job_count)
    .build()
    .map_err(|err| HarnessError::Io(io::Error::other(format!("create thread pool: {err}"))))?;

  let results: Vec<TestRunResult> = pool.install(|| {
    units
      .into_par_iter()
      .map(|unit| execute_unit(unit, runner, options, log))
      .collect()
  });

  let mut keyed = BTreeMap::new();
  for result in results {
    keyed.insert(result.id.clone(), result);
  }
  verify_result_count(dispatched, keyed.len())?;
  Ok(keyed)
}

fn execute_unit(
  unit: TestUnit,
  runner: &dyn QueryRunner,
  options: &RunOptions,
  log: &RunLog,
) -> TestRunResult {
  let started = Instant::now();
  let actual_path = unit.actual_path(&options.output_dir);
  let mut result = evaluate(
    TestRunResult::pending(unit, actual_path),
    runner,
    options.timeout,
    log,
  );
  result.duration_ms = started.elapsed().as_millis();

  let verdict = if result.passed {
    "PASS"
  } else if result.error.is_some() {
    "ERROR"
  } else {
    "FAIL"
  };
  log.line(format!("{verdict} {} ({} diff(s))", result.id, result.diff_count));
  if let Some(err) = &result.error {
    log.warn(format!("  {err}"));
  }
  result
}

fn evaluate(
  mut result: TestRunResult,
  runner: &dyn QueryRunner,
  timeout: Duration,
  log: &RunLog,
) -> TestRunResult {
  if let Err(err) = runner.run(&result.unit, &result.actual_path, timeout) {
    return result.fail_with(format!("execution failed: {err}"));
  }

  let actual = match parse_result_file(&result.actual_path) {
    Ok(parsed) => parsed,
    Err(err) => return result.fail_with(format!("actual output unreadable: {err}")),
  };

  let (candidates, parse_failure) = load_candidates(&result.unit, log);
  if candidates.is_empty() {
    let reason = parse_failure
      .unwrap_or_else(|| format!("no expected output found for {}", result.unit.name));
    result.actual = Some(actual);
    return result.fail_with(reason);
  }

  let Some(best) = select_best_match(&actual, &candidates, &result.unit.config) else {
    result.actual = Some(actual);
    return result.fail_with("no expected output could be compared".to_string());
  };

  result.diff_count = best.outcome.diff_count;
  result.diff_text = best.outcome.text();
  result.diffs = best.outcome.entries;
  result.expected_path = Some(best.path);
  result.expected = candidates.into_iter().nth(best.index).map(|(_, parsed)| parsed);
  result.actual = Some(actual);
  result.passed = (result.diff_count == 0) != result.should_fail;
  result
}

/// Parses every expected candidate, skipping unreadable ones. Returns the
/// first parse failure for reporting when nothing parsed.
fn load_candidates(
  unit: &TestUnit,
  log: &RunLog,
) -> (Vec<(PathBuf, ParsedTestOutput)>, Option<String>) {
  let mut parsed = Vec::new();
  let mut first_failure = None;
  for path in expected_candidates(unit) {
    match parse_result_file(&path) {
      Ok(output) => parsed.push((path, output)),
      Err(err) => {
        log.warn(format!("{}: skipping expected candidate: {err}", unit.id));
        first_failure.get_or_insert_with(|| format!("expected output unreadable: {err}"));
      }
    }
  }
  (parsed, first_failure)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_tool::ExecutionError;
  use crate::test_set::{TestInvocationConfig, TestSet};
  use std::fs;
  use std::path::Path;
  use tempfile::tempdir;

  const DOC: &str = "<results><test name='t'><table><tuple><value>1</value></tuple></table></test></results>";

  /// Writes a fixed document, or fails for tests whose name contains `crash`.
  struct FixedRunner(&'static str);

  impl QueryRunner for FixedRunner {
    fn run(&self, unit: &TestUnit, output: &Path, _timeout: Duration) -> std::result::Result<(), ExecutionError> {
      if unit.name.contains("crash") {
        return Err(ExecutionError::Failed {
          status: "exit status: 1".to_string(),
          stderr: "crashed".to_string(),
        });
      }
      fs::create_dir_all(output.parent().unwrap()).unwrap();
      fs::write(output, self.0).unwrap();
      Ok(())
    }
  }

  fn unit(root: &Path, name: &str, expected: Option<&str>) -> TestUnit {
    let rel = format!("exprtests/standard/setup.{name}.txt");
    let path = root.join(&rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, "").unwrap();
    if let Some(expected) = expected {
      fs::write(path.with_file_name(format!("expected.{name}.xml")), expected).unwrap();
    }
    TestUnit::new(
      root,
      &rel,
      name,
      TestSet::new("expression_test.x.cfg", "t.tds", "", "exprtests/standard/"),
      root.join("t.tds"),
      TestInvocationConfig::default(),
    )
  }

  fn options(root: &Path) -> RunOptions {
    RunOptions {
      jobs: 2,
      timeout: Duration::from_secs(5),
      output_dir: root.join("out"),
    }
  }

  #[test]
  fn verdicts_per_unit() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let units = vec![
      unit(root, "same", Some(DOC)),
      unit(root, "differs", Some(DOC.replace(">1<", ">2<").as_str())),
      unit(root, "crash", Some(DOC)),
      unit(root, "orphan", None),
      unit(root, "negative.shouldfail", Some(DOC.replace(">1<", ">2<").as_str())),
    ];

    let results = run_units(units, &FixedRunner(DOC), &options(root), &RunLog::disabled()).unwrap();
    assert_eq!(results.len(), 5);
    let get = |name: &str| {
      results
        .values()
        .find(|r| r.unit.name == name)
        .unwrap()
    };

    let same = get("same");
    assert!(same.passed);
    assert_eq!(same.diff_count, 0);
    assert!(same.actual.is_some());
    assert!(same.expected_path.as_ref().unwrap().ends_with("expected.same.xml"));
    assert!(same.actual_path.starts_with(root.join("out/expression_test.x.cfg")));

    let differs = get("differs");
    assert!(!differs.passed);
    assert_eq!(differs.diff_count, 1);
    assert!(differs.diff_text.contains("[t] row 0 differs"));
    assert!(differs.error.is_none());

    let crash = get("crash");
    assert!(!crash.passed);
    assert!(crash.actual.is_none());
    assert!(crash.error.as_deref().unwrap().contains("crashed"));

    let orphan = get("orphan");
    assert!(!orphan.passed);
    assert!(orphan.error.as_deref().unwrap().contains("no expected output"));

    let inverted = get("negative.shouldfail");
    assert!(inverted.should_fail);
    assert!(inverted.passed);

    assert!(!all_passed(&results));
  }

  #[test]
  fn malformed_expected_is_a_unit_failure() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let units = vec![unit(root, "broken", Some("<results><test"))];
    let results = run_units(units, &FixedRunner(DOC), &options(root), &RunLog::disabled()).unwrap();
    let result = results.values().next().unwrap();
    assert!(!result.passed);
    assert!(result.error.as_deref().unwrap().contains("unreadable"));
  }

  #[test]
  fn malformed_actual_is_a_unit_failure() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let units = vec![unit(root, "a", Some(DOC)), unit(root, "b", Some(DOC))];
    let results = run_units(units, &FixedRunner("not xml"), &options(root), &RunLog::disabled()).unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.values().all(|r| !r.passed && r.actual.is_none()));
  }

  #[test]
  fn colliding_identities_are_a_count_mismatch() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let first = unit(root, "same", Some(DOC));
    let duplicate = first.clone();
    let err = run_units(
      vec![first, duplicate],
      &FixedRunner(DOC),
      &options(root),
      &RunLog::disabled(),
    )
    .unwrap_err();
    assert!(matches!(
      err,
      HarnessError::CountMismatch {
        expected: 2,
        actual: 1
      }
    ));
  }

  #[test]
  fn count_check() {
    assert!(verify_result_count(3, 3).is_ok());
    let err = verify_result_count(2, 1).unwrap_err();
    assert_eq!(err.to_string(), "dispatched 2 test(s) but collected 1 result(s)");
  }

  #[test]
  fn empty_batch_is_fine() {
    let dir = tempdir().unwrap();
    let results = run_units(Vec::new(), &FixedRunner(DOC), &options(dir.path()), &RunLog::disabled()).unwrap();
    assert!(results.is_empty());
    assert!(all_passed(&results));
  }
}
