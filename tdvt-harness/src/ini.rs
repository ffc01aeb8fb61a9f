//! Minimal INI reader for datasource test matrices.
//!
//! Supported shape:
//!
//! ```text
//! # comment
//! ; comment
//! [section]
//! key = value
//! other: value
//! ```
//!
//! Keys are lower-cased, values are trimmed, and section names keep their case.
//! Sections and keys are kept in file order.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("read config {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("{origin}:{line}: {message}")]
  Syntax {
    origin: String,
    line: usize,
    message: String,
  },
  #[error("[{section}] {key} = '{value}': {reason}")]
  InvalidValue {
    section: String,
    key: String,
    value: String,
    reason: String,
  },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IniSection {
  pub name: String,
  /// 1-based line of the section header.
  pub line: usize,
  entries: Vec<(String, String)>,
}

impl IniSection {
  fn new(name: String, line: usize) -> Self {
    Self {
      name,
      line,
      entries: Vec::new(),
    }
  }

  /// Looks up a key (case-insensitive).
  pub fn get(&self, key: &str) -> Option<&str> {
    let key = key.to_ascii_lowercase();
    self
      .entries
      .iter()
      .find(|(k, _)| *k == key)
      .map(|(_, v)| v.as_str())
  }

  pub fn contains_key(&self, key: &str) -> bool {
    self.get(key).is_some()
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
  sections: Vec<IniSection>,
}

impl IniDocument {
  pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::parse(&raw, &path.display().to_string())
  }

  /// Parses INI text. `origin` names the input in error messages.
  pub fn parse(raw: &str, origin: &str) -> Result<Self, ConfigError> {
    let mut doc = IniDocument::default();
    let syntax = |line: usize, message: String| ConfigError::Syntax {
      origin: origin.to_string(),
      line,
      message,
    };

    for (idx, raw_line) in raw.lines().enumerate() {
      let line_number = idx + 1;
      let line = raw_line.trim();
      if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
        continue;
      }

      if let Some(header) = line.strip_prefix('[') {
        let Some(name) = header.strip_suffix(']') else {
          return Err(syntax(
            line_number,
            format!("unterminated section header `{line}`"),
          ));
        };
        let name = name.trim();
        if name.is_empty() {
          return Err(syntax(line_number, "empty section name".to_string()));
        }
        if let Some(existing) = doc.section(name) {
          return Err(syntax(
            line_number,
            format!(
              "duplicate section [{name}] (first defined on line {})",
              existing.line
            ),
          ));
        }
        doc
          .sections
          .push(IniSection::new(name.to_string(), line_number));
        continue;
      }

      let Some(split_at) = line.find(|c: char| c == '=' || c == ':') else {
        return Err(syntax(
          line_number,
          format!("expected `key = value` or a [section] header, found `{line}`"),
        ));
      };
      let (raw_key, raw_value) = line.split_at(split_at);
      let key = raw_key.trim().to_ascii_lowercase();
      let value = raw_value[1..].trim().to_string();
      if key.is_empty() {
        return Err(syntax(line_number, "empty key".to_string()));
      }

      let Some(section) = doc.sections.last_mut() else {
        return Err(syntax(
          line_number,
          format!("key `{key}` appears before any [section] header"),
        ));
      };
      if section.entries.iter().any(|(k, _)| *k == key) {
        return Err(syntax(
          line_number,
          format!("duplicate key `{key}` in section [{}]", section.name),
        ));
      }
      section.entries.push((key, value));
    }

    Ok(doc)
  }

  pub fn section(&self, name: &str) -> Option<&IniSection> {
    self.sections.iter().find(|section| section.name == name)
  }

  pub fn sections(&self) -> impl Iterator<Item = &IniSection> {
    self.sections.iter()
  }
}

/// Interprets the usual INI boolean spellings.
pub fn parse_bool(raw: &str) -> Option<bool> {
  match raw.trim().to_ascii_lowercase().as_str() {
    "1" | "on" | "true" | "yes" => Some(true),
    "0" | "off" | "false" | "no" => Some(false),
    _ => None,
  }
}
