use serde::{Deserialize, Serialize};
use std::fmt;

/// One named group of tests resolved for a datasource.
///
/// Equality is plain value equality over all four fields; the resolver's output
/// is checked against hand-written definitions using it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestSet {
  /// Logical identifier of the test group, e.g. `logical.calcs.aurora.cfg`.
  pub config_name: String,
  /// Datasource descriptor the group runs against, e.g. `cast_calcs.aurora.tds`.
  pub tds_name: String,
  /// Comma-separated sub-test names to skip. May be empty.
  pub exclusions: String,
  /// Pattern selecting test-definition files, relative to the test root.
  pub test_path: String,
}

impl TestSet {
  pub fn new(
    config_name: impl Into<String>,
    tds_name: impl Into<String>,
    exclusions: impl Into<String>,
    test_path: impl Into<String>,
  ) -> Self {
    Self {
      config_name: config_name.into(),
      tds_name: tds_name.into(),
      exclusions: exclusions.into(),
      test_path: test_path.into(),
    }
  }

  /// Trimmed, non-empty entries of the exclusion list.
  pub fn exclusion_list(&self) -> Vec<&str> {
    self
      .exclusions
      .split(',')
      .map(str::trim)
      .filter(|entry| !entry.is_empty())
      .collect()
  }
}

impl fmt::Display for TestSet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} (tds={}, path={}, exclusions=[{}])",
      self.config_name, self.tds_name, self.test_path, self.exclusions
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestFamily {
  Logical,
  Expression,
}

impl TestFamily {
  pub fn as_str(&self) -> &'static str {
    match self {
      TestFamily::Logical => "logical",
      TestFamily::Expression => "expression",
    }
  }
}

/// Flags that travel with every invocation unit to the query tool and the
/// diff engine.
///
/// With both `compare_sql` and `compare_tuples` off nothing is compared and
/// every unit that produces output passes. That configuration is accepted
/// as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestInvocationConfig {
  pub logical: bool,
  pub compare_sql: bool,
  pub compare_tuples: bool,
  #[serde(default)]
  pub extra_args: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub datasource_override: Option<String>,
}

impl Default for TestInvocationConfig {
  fn default() -> Self {
    Self {
      logical: false,
      compare_sql: false,
      compare_tuples: true,
      extra_args: String::new(),
      datasource_override: None,
    }
  }
}

impl TestInvocationConfig {
  pub fn family(&self) -> TestFamily {
    if self.logical {
      TestFamily::Logical
    } else {
      TestFamily::Expression
    }
  }

  pub fn for_family(&self, family: TestFamily) -> Self {
    Self {
      logical: family == TestFamily::Logical,
      ..self.clone()
    }
  }

  pub fn compares_anything(&self) -> bool {
    self.compare_sql || self.compare_tuples
  }
}
