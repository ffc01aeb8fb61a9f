//! Decoding of query-tool result documents.
//!
//! ```xml
//! <results>
//!   <test name="[int0] + 1">
//!     <sql>SELECT ...</sql>
//!     <table>
//!       <schema><column>[calc]:integer:quantitative</column></schema>
//!       <tuple><value>2</value></tuple>
//!       <tuple><value>%null%</value></tuple>
//!     </table>
//!   </test>
//! </results>
//! ```

use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const NULL_MARKER: &str = "%null%";
/// Relative tolerance applied when either side of a numeric comparison is real.
pub const REAL_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum ParseError {
  #[error("read result document {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("{origin}: malformed XML: {message}")]
  Xml { origin: String, message: String },
  #[error("{origin}: {message}")]
  Structure { origin: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
  Null,
  Bool(bool),
  Integer(i64),
  Real(f64),
  Text(String),
}

impl Value {
  fn as_f64(&self) -> Option<f64> {
    match self {
      Value::Integer(v) => Some(*v as f64),
      Value::Real(v) => Some(*v),
      _ => None,
    }
  }

  /// Type-aware comparison. Null only equals null; integers and reals compare
  /// numerically with [`REAL_TOLERANCE`].
  pub fn matches(&self, other: &Value) -> bool {
    match (self, other) {
      (Value::Null, Value::Null) => true,
      (Value::Null, _) | (_, Value::Null) => false,
      (Value::Integer(a), Value::Integer(b)) => a == b,
      (Value::Bool(a), Value::Bool(b)) => a == b,
      (Value::Text(a), Value::Text(b)) => a == b,
      (a, b) => match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => reals_match(a, b),
        _ => false,
      },
    }
  }
}

fn reals_match(a: f64, b: f64) -> bool {
  if a.is_nan() || b.is_nan() {
    return a.is_nan() && b.is_nan();
  }
  if a == b {
    return true;
  }
  let scale = 1f64.max(a.abs()).max(b.abs());
  (a - b).abs() <= REAL_TOLERANCE * scale
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Null => f.write_str(NULL_MARKER),
      Value::Bool(v) => write!(f, "{v}"),
      Value::Integer(v) => write!(f, "{v}"),
      Value::Real(v) => write!(f, "{v}"),
      Value::Text(v) => write!(f, "{v:?}"),
    }
  }
}

pub type Row = Vec<Value>;

pub fn format_row(row: &[Value]) -> String {
  let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
  format!("({})", cells.join(", "))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
  Bool,
  Integer,
  Real,
  Text,
  Unknown,
}

impl ColumnType {
  /// Column declarations look like `[label]:type:role`.
  fn from_declaration(raw: &str) -> Self {
    let mut parts = raw.trim().rsplitn(3, ':');
    let Some(last) = parts.next() else {
      return ColumnType::Unknown;
    };
    // With a role suffix the type is the middle segment.
    let declared = match parts.next() {
      Some(middle) if parts.next().is_some() => middle,
      Some(_) | None => last,
    };
    match declared.trim().to_ascii_lowercase().as_str() {
      "bool" | "boolean" => ColumnType::Bool,
      "int" | "integer" => ColumnType::Integer,
      "real" | "float" | "double" => ColumnType::Real,
      "str" | "string" | "date" | "datetime" | "time" => ColumnType::Text,
      _ => ColumnType::Unknown,
    }
  }

  fn parse(self, raw: &str) -> Value {
    if raw == NULL_MARKER {
      return Value::Null;
    }
    let trimmed = raw.trim();
    match self {
      ColumnType::Bool => parse_bool(trimmed).unwrap_or_else(|| Value::Text(raw.to_string())),
      ColumnType::Integer => trimmed
        .parse::<i64>()
        .map(Value::Integer)
        .or_else(|_| trimmed.parse::<f64>().map(Value::Real))
        .unwrap_or_else(|_| Value::Text(raw.to_string())),
      ColumnType::Real => trimmed
        .parse::<f64>()
        .map(Value::Real)
        .unwrap_or_else(|_| Value::Text(raw.to_string())),
      ColumnType::Text => Value::Text(raw.to_string()),
      ColumnType::Unknown => infer_value(raw),
    }
  }
}

fn parse_bool(raw: &str) -> Option<Value> {
  match raw {
    "true" | "True" | "TRUE" => Some(Value::Bool(true)),
    "false" | "False" | "FALSE" => Some(Value::Bool(false)),
    _ => None,
  }
}

fn infer_value(raw: &str) -> Value {
  let trimmed = raw.trim();
  if let Some(value) = parse_bool(trimmed) {
    return value;
  }
  if let Ok(v) = trimmed.parse::<i64>() {
    return Value::Integer(v);
  }
  match trimmed.parse::<f64>() {
    Ok(v) => Value::Real(v),
    Err(_) => Value::Text(raw.to_string()),
  }
}

/// One `<test>` element of a result document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseOutput {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sql: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default)]
  pub rows: Vec<Row>,
}

/// A decoded result document. Built once and never mutated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedTestOutput {
  pub cases: Vec<TestCaseOutput>,
}

pub fn parse_result_file(path: &Path) -> Result<ParsedTestOutput, ParseError> {
  let raw = fs::read_to_string(path).map_err(|source| ParseError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  parse_result_document(&raw, &path.display().to_string())
}

/// Parses a result document. `origin` names the input in error messages.
pub fn parse_result_document(raw: &str, origin: &str) -> Result<ParsedTestOutput, ParseError> {
  let doc = Document::parse(raw).map_err(|err| ParseError::Xml {
    origin: origin.to_string(),
    message: err.to_string(),
  })?;
  let structure = |message: String| ParseError::Structure {
    origin: origin.to_string(),
    message,
  };

  let mut cases = Vec::new();
  for (idx, test) in element_children(doc.root_element(), "test").enumerate() {
    let Some(name) = test.attribute("name") else {
      return Err(structure(format!("<test> #{} has no `name` attribute", idx + 1)));
    };

    let sql = element_children(test, "sql").next().map(node_text);
    let error = element_children(test, "error").next().map(node_text);
    let rows = match element_children(test, "table").next() {
      Some(table) => parse_table(table),
      None => Vec::new(),
    };

    cases.push(TestCaseOutput {
      name: name.to_string(),
      sql,
      error,
      rows,
    });
  }

  Ok(ParsedTestOutput { cases })
}

fn parse_table(table: Node<'_, '_>) -> Vec<Row> {
  let columns: Vec<ColumnType> = element_children(table, "schema")
    .next()
    .map(|schema| {
      element_children(schema, "column")
        .map(|column| ColumnType::from_declaration(&node_text(column)))
        .collect()
    })
    .unwrap_or_default();

  element_children(table, "tuple")
    .map(|tuple| {
      element_children(tuple, "value")
        .enumerate()
        .map(|(idx, value)| {
          let column = columns.get(idx).copied().unwrap_or(ColumnType::Unknown);
          column.parse(&node_text(value))
        })
        .collect()
    })
    .collect()
}

fn element_children<'a, 'input: 'a>(
  node: Node<'a, 'input>,
  tag: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
  node
    .children()
    .filter(move |child| child.is_element() && child.tag_name().name() == tag)
}

fn node_text(node: Node<'_, '_>) -> String {
  node
    .descendants()
    .filter(|n| n.is_text())
    .filter_map(|n| n.text())
    .collect()
}
