//! Persistence of failing units so a later invocation can replay exactly those.
//!
//! Records carry paths relative to the test root plus the complete invocation
//! flags. On replay the recorded flags win over whatever the replaying process
//! would use by default.

use crate::discover::TestUnit;
use crate::log::RunLog;
use crate::report::write_json_report;
use crate::resources::relative_to;
use crate::runner::TestRunResult;
use crate::test_set::{TestInvocationConfig, TestSet};
use crate::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const RERUN_FILE_NAME: &str = "failed_tests.json";
pub const RERUN_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RerunStateError {
  #[error("rerun file {0} does not exist")]
  Missing(PathBuf),
  #[error("read rerun file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("rerun file {path} is malformed: {message}")]
  Malformed { path: PathBuf, message: String },
  #[error("rerun file {path} has schema version {found}; expected {RERUN_SCHEMA_VERSION}")]
  UnsupportedVersion { path: PathBuf, found: u64 },
}

#[derive(Debug, Serialize, Deserialize)]
struct RerunFile {
  schema_version: u32,
  tests: Vec<RerunRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RerunRecord {
  id: String,
  relative_path: String,
  name: String,
  test_set: TestSet,
  /// Descriptor path, relative to the test root when it lies under it.
  tds: String,
  config: RecordedConfig,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  failure: Option<String>,
}

/// Invocation flags as recorded. `None` means the record predates the field
/// and the replaying process supplies it.
#[derive(Debug, Serialize, Deserialize)]
struct RecordedConfig {
  logical: bool,
  #[serde(default)]
  compare_sql: Option<bool>,
  #[serde(default)]
  compare_tuples: Option<bool>,
  #[serde(default)]
  extra_args: Option<String>,
  /// `null` records "no override"; an absent key defers to the replaying process.
  #[serde(default, deserialize_with = "explicit_option")]
  datasource_override: Option<Option<String>>,
}

fn explicit_option<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
  D: Deserializer<'de>,
  T: Deserialize<'de>,
{
  Option::<T>::deserialize(deserializer).map(Some)
}

impl RecordedConfig {
  fn capture(config: &TestInvocationConfig) -> Self {
    Self {
      logical: config.logical,
      compare_sql: Some(config.compare_sql),
      compare_tuples: Some(config.compare_tuples),
      extra_args: Some(config.extra_args.clone()),
      datasource_override: Some(config.datasource_override.clone()),
    }
  }

  fn restore(self, ambient: &TestInvocationConfig) -> TestInvocationConfig {
    TestInvocationConfig {
      logical: self.logical,
      compare_sql: self.compare_sql.unwrap_or(ambient.compare_sql),
      compare_tuples: self.compare_tuples.unwrap_or(ambient.compare_tuples),
      extra_args: self
        .extra_args
        .unwrap_or_else(|| ambient.extra_args.clone()),
      datasource_override: self
        .datasource_override
        .unwrap_or_else(|| ambient.datasource_override.clone()),
    }
  }
}

/// Writes every failing result to `path`, or removes `path` when nothing
/// failed. Returns the number of records written.
pub fn persist(
  results: &BTreeMap<String, TestRunResult>,
  root: &Path,
  path: &Path,
  log: &RunLog,
) -> Result<usize> {
  let tests: Vec<RerunRecord> = results
    .values()
    .filter(|result| !result.passed)
    .map(|result| {
      let unit = &result.unit;
      RerunRecord {
        id: unit.id.clone(),
        relative_path: unit.relative_path.clone(),
        name: unit.name.clone(),
        test_set: unit.test_set.clone(),
        tds: relative_to(root, &unit.tds_path),
        config: RecordedConfig::capture(&unit.config),
        failure: result.failure_detail().filter(|detail| !detail.is_empty()),
      }
    })
    .collect();

  if tests.is_empty() {
    match fs::remove_file(path) {
      Ok(()) => log.line(format!("no failures; removed {}", path.display())),
      Err(err) if err.kind() == io::ErrorKind::NotFound => {}
      Err(err) => return Err(err.into()),
    }
    return Ok(0);
  }

  let count = tests.len();
  write_json_report(
    path,
    &RerunFile {
      schema_version: RERUN_SCHEMA_VERSION,
      tests,
    },
  )?;
  log.line(format!("wrote {count} failing test(s) to {}", path.display()));
  Ok(count)
}

/// Rebuilds the units recorded in `path` under `root`.
///
/// Flags stored in the file take precedence; `ambient` only fills fields a
/// record leaves out. Logical and expression records may be mixed.
pub fn rehydrate(
  path: &Path,
  root: &Path,
  ambient: &TestInvocationConfig,
) -> std::result::Result<Vec<TestUnit>, RerunStateError> {
  let raw = fs::read_to_string(path).map_err(|source| {
    if source.kind() == io::ErrorKind::NotFound {
      RerunStateError::Missing(path.to_path_buf())
    } else {
      RerunStateError::Read {
        path: path.to_path_buf(),
        source,
      }
    }
  })?;
  let malformed = |message: String| RerunStateError::Malformed {
    path: path.to_path_buf(),
    message,
  };

  let value: serde_json::Value =
    serde_json::from_str(&raw).map_err(|err| malformed(err.to_string()))?;
  let version = value
    .get("schema_version")
    .and_then(|v| v.as_u64())
    .ok_or_else(|| malformed("missing `schema_version`".to_string()))?;
  if version != u64::from(RERUN_SCHEMA_VERSION) {
    return Err(RerunStateError::UnsupportedVersion {
      path: path.to_path_buf(),
      found: version,
    });
  }
  let file: RerunFile = serde_json::from_value(value).map_err(|err| malformed(err.to_string()))?;

  let mut units = Vec::with_capacity(file.tests.len());
  for record in file.tests {
    let tds_path = if Path::new(&record.tds).is_absolute() {
      PathBuf::from(&record.tds)
    } else {
      root.join(&record.tds)
    };
    let unit = TestUnit::new(
      root,
      &record.relative_path,
      &record.name,
      record.test_set,
      tds_path,
      record.config.restore(ambient),
    );
    if unit.id != record.id {
      return Err(malformed(format!(
        "record `{}` does not match its test set and path (`{}`)",
        record.id, unit.id
      )));
    }
    units.push(unit);
  }
  Ok(units)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_set::TestFamily;
  use tempfile::tempdir;

  fn failing(root: &Path, rel: &str, name: &str, config: TestInvocationConfig) -> TestRunResult {
    let config_name = if config.logical {
      "logical.calcs.pg.cfg"
    } else {
      "expression_test.pg.cfg"
    };
    let unit = TestUnit::new(
      root,
      rel,
      name,
      TestSet::new(config_name, "cast_calcs.pg.tds", "", "pattern"),
      root.join("tds/cast_calcs.pg.tds"),
      config,
    );
    TestRunResult {
      id: unit.id.clone(),
      family: unit.family(),
      should_fail: false,
      actual_path: root.join("out").join(format!("actual.{name}.xml")),
      unit,
      actual: None,
      expected_path: None,
      expected: None,
      diff_count: 1,
      diffs: Vec::new(),
      diff_text: "[t] row 0 differs\n".to_string(),
      error: None,
      passed: false,
      duration_ms: 1,
    }
  }

  fn keyed(results: Vec<TestRunResult>) -> BTreeMap<String, TestRunResult> {
    results.into_iter().map(|r| (r.id.clone(), r)).collect()
  }

  #[test]
  fn round_trip_preserves_flags_over_ambient() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let original = TestInvocationConfig {
      logical: false,
      compare_sql: true,
      compare_tuples: false,
      extra_args: "--force-sql".to_string(),
      datasource_override: None,
    };
    let mut passing = failing(root, "exprtests/standard/setup.ok.txt", "ok", original.clone());
    passing.passed = true;
    let results = keyed(vec![
      failing(root, "exprtests/standard/setup.a.txt", "a", original.clone()),
      failing(root, "exprtests/standard/setup.b.txt", "b", original.clone()),
      passing,
    ]);

    let file = root.join("out").join(RERUN_FILE_NAME);
    assert_eq!(persist(&results, root, &file, &RunLog::disabled()).unwrap(), 2);

    let ambient = TestInvocationConfig {
      datasource_override: Some("DAmbient=1".to_string()),
      ..TestInvocationConfig::default()
    };
    let units = rehydrate(&file, root, &ambient).unwrap();
    assert_eq!(units.len(), 2);
    for unit in &units {
      assert_eq!(unit.config, original);
      assert_eq!(unit.tds_path, root.join("tds/cast_calcs.pg.tds"));
      assert_eq!(unit.test_set.tds_name, "cast_calcs.pg.tds");
      assert!(results.contains_key(&unit.id));
      assert!(results[&unit.id].unit == *unit);
    }
  }

  #[test]
  fn replays_under_a_different_root() {
    let dir = tempdir().unwrap();
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    let results = keyed(vec![failing(
      &first,
      "exprtests/standard/setup.a.txt",
      "a",
      TestInvocationConfig::default(),
    )]);
    let file = dir.path().join(RERUN_FILE_NAME);
    persist(&results, &first, &file, &RunLog::disabled()).unwrap();

    let units = rehydrate(&file, &second, &TestInvocationConfig::default()).unwrap();
    assert_eq!(units[0].path, second.join("exprtests/standard/setup.a.txt"));
    assert_eq!(units[0].tds_path, second.join("tds/cast_calcs.pg.tds"));
  }

  #[test]
  fn mixed_families_rehydrate() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let logical = TestInvocationConfig {
      logical: true,
      ..TestInvocationConfig::default()
    };
    let results = keyed(vec![
      failing(root, "logicaltests/setup/calcs/setup.a.bool_.xml", "a", logical),
      failing(
        root,
        "exprtests/standard/setup.b.txt",
        "b",
        TestInvocationConfig::default(),
      ),
    ]);
    let file = root.join(RERUN_FILE_NAME);
    persist(&results, root, &file, &RunLog::disabled()).unwrap();

    let units = rehydrate(&file, root, &TestInvocationConfig::default()).unwrap();
    let mut families: Vec<TestFamily> = units.iter().map(|u| u.family()).collect();
    families.sort_by_key(|f| f.as_str());
    assert_eq!(families, vec![TestFamily::Expression, TestFamily::Logical]);
  }

  #[test]
  fn no_failures_removes_the_file() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let file = root.join(RERUN_FILE_NAME);
    fs::write(&file, "stale").unwrap();
    let mut ok = failing(root, "exprtests/standard/setup.a.txt", "a", TestInvocationConfig::default());
    ok.passed = true;
    assert_eq!(persist(&keyed(vec![ok]), root, &file, &RunLog::disabled()).unwrap(), 0);
    assert!(!file.exists());
  }

  #[test]
  fn optional_fields_fall_back_to_ambient() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let file = root.join(RERUN_FILE_NAME);
    fs::write(
      &file,
      r#"{
        "schema_version": 1,
        "tests": [{
          "id": "expression_test.pg.cfg/exprtests/standard/setup.a.txt",
          "relative_path": "exprtests/standard/setup.a.txt",
          "name": "a",
          "test_set": {
            "config_name": "expression_test.pg.cfg",
            "tds_name": "cast_calcs.pg.tds",
            "exclusions": "",
            "test_path": "exprtests/standard/"
          },
          "tds": "cast_calcs.pg.tds",
          "config": { "logical": false, "compare_sql": true }
        }]
      }"#,
    )
    .unwrap();
    let ambient = TestInvocationConfig {
      compare_tuples: false,
      extra_args: "--x".to_string(),
      datasource_override: Some("DKey=1".to_string()),
      ..TestInvocationConfig::default()
    };
    let units = rehydrate(&file, root, &ambient).unwrap();
    let config = &units[0].config;
    assert!(config.compare_sql);
    assert!(!config.compare_tuples);
    assert_eq!(config.extra_args, "--x");
    assert_eq!(config.datasource_override.as_deref(), Some("DKey=1"));
  }

  #[test]
  fn bad_files_are_rerun_state_errors() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let ambient = TestInvocationConfig::default();

    let err = rehydrate(&root.join("absent.json"), root, &ambient).unwrap_err();
    assert!(matches!(err, RerunStateError::Missing(_)));

    let file = root.join(RERUN_FILE_NAME);
    fs::write(&file, "{ not json").unwrap();
    assert!(matches!(
      rehydrate(&file, root, &ambient).unwrap_err(),
      RerunStateError::Malformed { .. }
    ));

    fs::write(&file, r#"{"schema_version": 9, "tests": []}"#).unwrap();
    assert!(matches!(
      rehydrate(&file, root, &ambient).unwrap_err(),
      RerunStateError::UnsupportedVersion { found: 9, .. }
    ));

    fs::write(
      &file,
      r#"{"schema_version": 1, "tests": [{"id": "x", "name": "a"}]}"#,
    )
    .unwrap();
    let err = rehydrate(&file, root, &ambient).unwrap_err();
    assert!(err.to_string().contains("relative_path"), "{err}");
  }
}
