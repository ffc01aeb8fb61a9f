use crate::result_xml::{format_row, ParsedTestOutput, Row, TestCaseOutput};
use crate::test_set::TestInvocationConfig;
use serde::Serialize;
use similar::{ChangeTag, TextDiff};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiffKind {
  /// Case present in the expected document but not in the actual one.
  MissingCase,
  /// Case present in the actual document but not in the expected one.
  ExtraCase,
  Sql,
  Error,
  RowCount { expected: usize, actual: usize },
  Row { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffEntry {
  pub case: String,
  #[serde(flatten)]
  pub kind: DiffKind,
  pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffOutcome {
  pub diff_count: usize,
  pub entries: Vec<DiffEntry>,
}

impl DiffOutcome {
  pub fn is_clean(&self) -> bool {
    self.diff_count == 0
  }

  fn push(&mut self, case: &str, kind: DiffKind, detail: String) {
    self.diff_count += 1;
    self.entries.push(DiffEntry {
      case: case.to_string(),
      kind,
      detail,
    });
  }

  /// Human-readable description, one block per entry, in comparison order.
  pub fn text(&self) -> String {
    let mut out = String::new();
    for entry in &self.entries {
      let headline = match &entry.kind {
        DiffKind::MissingCase => "missing from actual output".to_string(),
        DiffKind::ExtraCase => "not present in expected output".to_string(),
        DiffKind::Sql => "sql differs".to_string(),
        DiffKind::Error => "error differs".to_string(),
        DiffKind::RowCount { expected, actual } => {
          format!("row count differs: expected {expected}, actual {actual}")
        }
        DiffKind::Row { index } => format!("row {index} differs"),
      };
      let _ = writeln!(out, "[{}] {headline}", entry.case);
      for line in entry.detail.lines() {
        let _ = writeln!(out, "  {line}");
      }
    }
    out
  }
}

/// Compares an actual document against one expected document.
///
/// Cases are paired by name; the n-th case of a name in `actual` pairs with
/// the n-th case of that name in `expected`. With both comparison flags off
/// nothing but case presence is checked.
pub fn diff_outputs(
  actual: &ParsedTestOutput,
  expected: &ParsedTestOutput,
  config: &TestInvocationConfig,
) -> DiffOutcome {
  let mut outcome = DiffOutcome::default();

  let mut actual_by_name: HashMap<&str, Vec<usize>> = HashMap::new();
  for (idx, case) in actual.cases.iter().enumerate() {
    actual_by_name.entry(case.name.as_str()).or_default().push(idx);
  }
  let mut seen: HashMap<&str, usize> = HashMap::new();
  let mut matched = vec![false; actual.cases.len()];

  for expected_case in &expected.cases {
    let occurrence = seen.entry(expected_case.name.as_str()).or_insert(0);
    let actual_idx = actual_by_name
      .get(expected_case.name.as_str())
      .and_then(|indices| indices.get(*occurrence))
      .copied();
    *occurrence += 1;

    match actual_idx {
      Some(idx) => {
        matched[idx] = true;
        diff_case(&actual.cases[idx], expected_case, config, &mut outcome);
      }
      None => outcome.push(&expected_case.name, DiffKind::MissingCase, String::new()),
    }
  }

  for (case, _) in actual
    .cases
    .iter()
    .zip(&matched)
    .filter(|(_, matched)| !**matched)
  {
    outcome.push(&case.name, DiffKind::ExtraCase, String::new());
  }

  outcome
}

fn diff_case(
  actual: &TestCaseOutput,
  expected: &TestCaseOutput,
  config: &TestInvocationConfig,
  outcome: &mut DiffOutcome,
) {
  let name = expected.name.as_str();

  if config.compare_sql {
    let actual_sql = actual.sql.as_deref().map(normalize_sql);
    let expected_sql = expected.sql.as_deref().map(normalize_sql);
    if actual_sql != expected_sql {
      outcome.push(
        name,
        DiffKind::Sql,
        render_text_diff(
          expected.sql.as_deref().unwrap_or(""),
          actual.sql.as_deref().unwrap_or(""),
        ),
      );
    }
  }

  if !config.compare_tuples {
    return;
  }

  if actual.error != expected.error {
    outcome.push(
      name,
      DiffKind::Error,
      format!(
        "expected: {}\nactual:   {}",
        expected.error.as_deref().unwrap_or("<none>"),
        actual.error.as_deref().unwrap_or("<none>"),
      ),
    );
  }

  if actual.rows.len() != expected.rows.len() {
    outcome.push(
      name,
      DiffKind::RowCount {
        expected: expected.rows.len(),
        actual: actual.rows.len(),
      },
      String::new(),
    );
  }

  for (index, (actual_row, expected_row)) in actual.rows.iter().zip(&expected.rows).enumerate() {
    if !rows_match(actual_row, expected_row) {
      outcome.push(
        name,
        DiffKind::Row { index },
        format!(
          "expected: {}\nactual:   {}",
          format_row(expected_row),
          format_row(actual_row)
        ),
      );
    }
  }
}

fn rows_match(actual: &Row, expected: &Row) -> bool {
  actual.len() == expected.len() && actual.iter().zip(expected).all(|(a, e)| a.matches(e))
}

/// Collapses whitespace runs to one space and trims.
pub fn normalize_sql(sql: &str) -> String {
  sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn render_text_diff(expected: &str, actual: &str) -> String {
  let expected = with_trailing_newline(expected);
  let actual = with_trailing_newline(actual);
  let diff = TextDiff::from_lines(&expected, &actual);
  let mut out = String::new();
  for change in diff.iter_all_changes() {
    let sign = match change.tag() {
      ChangeTag::Delete => "-",
      ChangeTag::Insert => "+",
      ChangeTag::Equal => " ",
    };
    out.push_str(sign);
    out.push_str(change.as_str().unwrap_or(""));
  }
  out
}

fn with_trailing_newline(text: &str) -> String {
  if text.ends_with('\n') {
    text.to_string()
  } else {
    format!("{text}\n")
  }
}

/// The candidate chosen for a unit and its comparison against the actual output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestMatch {
  pub index: usize,
  pub path: PathBuf,
  pub outcome: DiffOutcome,
}

/// Picks the candidate with the fewest diffs; the earliest candidate wins ties.
/// Returns `None` only when `candidates` is empty.
pub fn select_best_match(
  actual: &ParsedTestOutput,
  candidates: &[(PathBuf, ParsedTestOutput)],
  config: &TestInvocationConfig,
) -> Option<BestMatch> {
  let mut best: Option<BestMatch> = None;
  for (index, (path, expected)) in candidates.iter().enumerate() {
    let outcome = diff_outputs(actual, expected, config);
    let better = match &best {
      Some(current) => outcome.diff_count < current.outcome.diff_count,
      None => true,
    };
    if better {
      let clean = outcome.is_clean();
      best = Some(BestMatch {
        index,
        path: path.clone(),
        outcome,
      });
      if clean {
        break;
      }
    }
  }
  best
}
