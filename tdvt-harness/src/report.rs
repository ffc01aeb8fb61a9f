use crate::runner::TestRunResult;
use crate::{HarnessError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

pub const REPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
  pub total: usize,
  pub passed: usize,
  /// Ran to a verdict and failed it.
  pub failed: usize,
  /// Could not reach a verdict.
  pub errors: usize,
}

impl Summary {
  pub fn from_results<'a>(results: impl IntoIterator<Item = &'a TestRunResult>) -> Self {
    let mut summary = Summary::default();
    for result in results {
      summary.total += 1;
      if result.passed {
        summary.passed += 1;
      } else if result.error.is_some() {
        summary.errors += 1;
      } else {
        summary.failed += 1;
      }
    }
    summary
  }

  pub fn all_passed(&self) -> bool {
    self.passed == self.total
  }
}

/// A whole-run report; results are ordered by identity.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
  pub schema_version: u32,
  pub summary: Summary,
  pub results: Vec<&'a TestRunResult>,
}

impl<'a> RunReport<'a> {
  pub fn new(results: &'a BTreeMap<String, TestRunResult>) -> Self {
    let results: Vec<&TestRunResult> = results.values().collect();
    Self {
      schema_version: REPORT_SCHEMA_VERSION,
      summary: Summary::from_results(results.iter().copied()),
      results,
    }
  }

  pub fn failures(&self) -> impl Iterator<Item = &&'a TestRunResult> {
    self.results.iter().filter(|result| !result.passed)
  }

  /// Plain-text summary: one block per failing unit followed by the totals.
  pub fn write_human<W: Write>(&self, writer: &mut W) -> io::Result<()> {
    for result in self.failures() {
      writeln!(writer, "FAILED {}", result.id)?;
      if let Some(detail) = result.failure_detail() {
        for line in detail.lines() {
          writeln!(writer, "    {line}")?;
        }
      }
    }
    let Summary {
      total,
      passed,
      failed,
      errors,
    } = &self.summary;
    writeln!(
      writer,
      "{passed}/{total} passed, {failed} failed, {errors} error(s)"
    )
  }
}

/// Writes `report` as pretty JSON to `path`, creating parent directories.
pub fn write_json_report<T: Serialize>(path: &Path, report: &T) -> Result<()> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent)?;
  }
  let file = fs::File::create(path)?;
  let mut writer = BufWriter::new(file);
  write_json_report_to_writer(&mut writer, report)?;
  writer.flush()?;
  Ok(())
}

pub fn write_json_report_to_writer<W: Write, T: Serialize>(writer: &mut W, report: &T) -> Result<()> {
  serde_json::to_writer_pretty(&mut *writer, report)
    .map_err(|err| HarnessError::Report(err.to_string()))?;
  writeln!(&mut *writer)?;
  Ok(())
}

pub fn write_json_report_to_stdout<T: Serialize>(report: &T) -> Result<()> {
  let stdout = io::stdout();
  let mut handle = stdout.lock();
  write_json_report_to_writer(&mut handle, report)
}
