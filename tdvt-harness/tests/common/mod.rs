#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tdvt_harness::{ExecutionError, QueryRunner, TestInvocationConfig, TestUnit};

pub const LOGICAL_TEST: &str = "logicaltests/setup/calcs/setup.BUGS.B1713.bool_.xml";
pub const EXPRESSION_TESTS: &[&str] = &[
  "exprtests/standard/setup.math.abs.txt",
  "exprtests/standard/setup.string.left.txt",
];

pub const LOGICAL_OUTPUT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<results>
  <test name="BUGS.B1713">
    <sql>SELECT "Calcs"."int0" AS "int0" FROM "Calcs" GROUP BY 1</sql>
    <table>
      <schema><column>[int0]:integer:quantitative</column></schema>
      <tuple><value>%null%</value></tuple>
      <tuple><value>1</value></tuple>
      <tuple><value>7</value></tuple>
    </table>
  </test>
</results>
"#;

pub const ABS_OUTPUT: &str = r#"<results>
  <test name="ABS([int2])">
    <table>
      <schema><column>[calc]:real:quantitative</column></schema>
      <tuple><value>5.0</value></tuple>
      <tuple><value>0.1</value></tuple>
    </table>
  </test>
</results>
"#;

pub const LEFT_OUTPUT: &str = r#"<results>
  <test name="LEFT([str2], 2)">
    <table>
      <tuple><value>on</value></tuple>
      <tuple><value>%null%</value></tuple>
    </table>
  </test>
</results>
"#;

pub fn write_file(path: &Path, body: &str) {
  fs::create_dir_all(path.parent().unwrap()).unwrap();
  fs::write(path, body).unwrap();
}

/// A small test root: one logical test, two expression tests, expected
/// outputs for each and a datasource descriptor.
pub fn write_test_root(root: &Path) {
  write_file(&root.join("tds/cast_calcs.tde.tds"), "<datasource/>");
  write_file(&root.join(LOGICAL_TEST), "<test/>");
  write_file(
    &root.join("logicaltests/setup/calcs/expected.BUGS.B1713.xml"),
    LOGICAL_OUTPUT,
  );
  // A dialect variant that never wins.
  write_file(
    &root.join("logicaltests/setup/calcs/expected.BUGS.B1713.1.xml"),
    &LOGICAL_OUTPUT.replace("<value>7</value>", "<value>8</value>"),
  );
  for rel in EXPRESSION_TESTS {
    write_file(&root.join(rel), "");
  }
  write_file(&root.join("exprtests/standard/expected.math.abs.xml"), ABS_OUTPUT);
  write_file(&root.join("exprtests/standard/expected.string.left.xml"), LEFT_OUTPUT);

  write_file(
    &root.join("config/tde.ini"),
    "[defaults]\nlogical_query_format = bool_\n\n[tde]\nlogical_calcs = \nlogical_calcs_tds = cast_calcs.tde.tds\nexpression_standard = \nexpression_standard_tds = cast_calcs.tde.tds\n",
  );
}

/// Plays back canned documents by test name instead of running a tool, and
/// records the flags of every invocation.
#[derive(Default)]
pub struct CannedRunner {
  outputs: HashMap<String, String>,
  pub invocations: Mutex<Vec<(String, TestInvocationConfig)>>,
}

impl CannedRunner {
  /// Canned outputs matching the expected files of [`write_test_root`].
  pub fn matching() -> Self {
    Self::default()
      .with("BUGS.B1713", LOGICAL_OUTPUT)
      .with("math.abs", ABS_OUTPUT)
      .with("string.left", LEFT_OUTPUT)
  }

  pub fn with(mut self, name: &str, output: &str) -> Self {
    self.outputs.insert(name.to_string(), output.to_string());
    self
  }

  pub fn invocations(&self) -> Vec<(String, TestInvocationConfig)> {
    let mut seen = self.invocations.lock().unwrap().clone();
    seen.sort_by(|a, b| a.0.cmp(&b.0));
    seen
  }
}

impl QueryRunner for CannedRunner {
  fn run(&self, unit: &TestUnit, output: &Path, timeout: Duration) -> Result<(), ExecutionError> {
    self
      .invocations
      .lock()
      .unwrap()
      .push((unit.id.clone(), unit.config.clone()));
    let Some(body) = self.outputs.get(&unit.name) else {
      return Err(ExecutionError::Timeout(timeout));
    };
    write_file(output, body);
    Ok(())
  }
}

#[allow(dead_code)]
pub fn output_dir(root: &Path) -> PathBuf {
  root.join("tdvt_output")
}
