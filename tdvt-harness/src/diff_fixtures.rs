//! Self-check of the diff engine against hand-written fixture pairs.
//!
//! A directory holds pairs such as `expected.tuples.row_count.shouldfail.xml`
//! and `actual.tuples.row_count.shouldfail.xml`. The fixture name selects the
//! comparison flags and whether a difference is the correct outcome.

use crate::diff::diff_outputs;
use crate::log::RunLog;
use crate::result_xml::parse_result_file;
use crate::test_set::TestInvocationConfig;
use crate::Result;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

const EXPECTED_MARKER: &str = "expected.";
const SHOULD_FAIL_MARKER: &str = "shouldfail";

#[derive(Debug, Clone, Serialize)]
pub struct FixtureOutcome {
  /// File name of the expected half.
  pub name: String,
  pub expected_path: PathBuf,
  pub actual_path: PathBuf,
  pub compare_sql: bool,
  pub compare_tuples: bool,
  pub should_fail: bool,
  pub diff_count: usize,
  #[serde(skip_serializing_if = "String::is_empty")]
  pub diff_text: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  pub passed: bool,
}

/// Comparison flags selected by a fixture file name.
pub fn fixture_config(name: &str) -> TestInvocationConfig {
  let both = name.contains("expected.both");
  TestInvocationConfig {
    logical: false,
    compare_sql: both || name.contains("expected.sql"),
    compare_tuples: both || name.contains("expected.tuples"),
    extra_args: String::new(),
    datasource_override: None,
  }
}

pub fn check_diff_fixtures(dir: &Path, log: &RunLog) -> Result<Vec<FixtureOutcome>> {
  let mut names: Vec<String> = fs::read_dir(dir)?
    .filter_map(|entry| entry.ok())
    .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
    .map(|entry| entry.file_name().to_string_lossy().into_owned())
    .filter(|name| name.contains(EXPECTED_MARKER))
    .collect();
  names.sort();

  log.line(format!("checking {} diff fixture(s) in {}", names.len(), dir.display()));
  let outcomes: Vec<FixtureOutcome> = names
    .into_iter()
    .map(|name| {
      let outcome = check_fixture(dir, name);
      let status = if outcome.passed { "passed" } else { "FAILED" };
      log.line(format!("{status}: {}", outcome.name));
      if let Some(err) = &outcome.error {
        log.warn(format!("  {err}"));
      }
      outcome
    })
    .collect();

  let failed = outcomes.iter().filter(|o| !o.passed).count();
  log.line(format!("{failed} of {} diff fixture(s) failed", outcomes.len()));
  Ok(outcomes)
}

fn check_fixture(dir: &Path, name: String) -> FixtureOutcome {
  let config = fixture_config(&name);
  let mut outcome = FixtureOutcome {
    expected_path: dir.join(&name),
    actual_path: dir.join(name.replace("expected", "actual")),
    compare_sql: config.compare_sql,
    compare_tuples: config.compare_tuples,
    should_fail: name.contains(SHOULD_FAIL_MARKER),
    diff_count: 0,
    diff_text: String::new(),
    error: None,
    passed: false,
    name,
  };

  let parsed = parse_result_file(&outcome.actual_path)
    .and_then(|actual| parse_result_file(&outcome.expected_path).map(|expected| (actual, expected)));
  match parsed {
    Ok((actual, expected)) => {
      let diff = diff_outputs(&actual, &expected, &config);
      outcome.diff_count = diff.diff_count;
      outcome.diff_text = diff.text();
      outcome.passed = (diff.diff_count == 0) != outcome.should_fail;
    }
    Err(err) => outcome.error = Some(err.to_string()),
  }
  outcome
}
