use crate::ini::ConfigError;
use crate::resources::{relative_to, resolve_resource};
use crate::test_set::{TestFamily, TestInvocationConfig, TestSet};
use crate::{HarnessError, Result};
use globset::{Glob, GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File pattern used when a test path names a directory (`exprtests/standard/`).
pub const DIRECTORY_TEST_GLOB: &str = "setup.*.txt";
const GLOB_META: &[char] = &['*', '?', '[', '{'];
const SHOULD_FAIL_MARKER: &str = "shouldfail";

/// One concrete test-definition file paired with the flags it runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestUnit {
  /// `{config_name}/{relative_path}`; unique within a run.
  pub id: String,
  /// Test file path relative to the test root, `/`-separated.
  pub relative_path: String,
  pub path: PathBuf,
  /// Sub-test name derived from the file name, matched against exclusions.
  pub name: String,
  pub test_set: TestSet,
  pub tds_path: PathBuf,
  pub config: TestInvocationConfig,
}

impl TestUnit {
  pub fn new(
    root: &Path,
    relative_path: &str,
    name: &str,
    test_set: TestSet,
    tds_path: PathBuf,
    config: TestInvocationConfig,
  ) -> Self {
    Self {
      id: format!("{}/{relative_path}", test_set.config_name),
      relative_path: relative_path.to_string(),
      path: root.join(relative_path),
      name: name.to_string(),
      test_set,
      tds_path,
      config,
    }
  }

  pub fn family(&self) -> TestFamily {
    self.config.family()
  }

  /// A `shouldfail` marker in the file name inverts the expected verdict.
  pub fn should_fail(&self) -> bool {
    self
      .path
      .file_name()
      .map(|name| name.to_string_lossy().contains(SHOULD_FAIL_MARKER))
      .unwrap_or(false)
  }

  /// Where the query tool writes this unit's result document.
  pub fn actual_path(&self, output_dir: &Path) -> PathBuf {
    let mut path = output_dir.join(&self.test_set.config_name);
    if let Some(parent) = Path::new(&self.relative_path).parent() {
      path.push(parent);
    }
    path.push(format!("actual.{}.xml", self.name));
    path
  }
}

#[derive(Debug, Clone)]
pub enum Filter {
  All,
  Glob(GlobSet),
  Regex(Regex),
}

pub fn build_filter(pattern: Option<&str>) -> Result<Filter> {
  match pattern {
    None => Ok(Filter::All),
    Some(raw) => {
      if let Ok(glob) = Glob::new(raw) {
        let mut builder = GlobSetBuilder::new();
        builder.add(glob);
        let set = builder
          .build()
          .map_err(|err| HarnessError::InvalidFilter(err.to_string()))?;
        return Ok(Filter::Glob(set));
      }

      let regex = Regex::new(raw).map_err(|err| HarnessError::InvalidFilter(err.to_string()))?;
      Ok(Filter::Regex(regex))
    }
  }
}

impl Filter {
  pub fn matches(&self, id: &str) -> bool {
    match self {
      Filter::All => true,
      Filter::Glob(set) => set.is_match(id),
      Filter::Regex(re) => re.is_match(id),
    }
  }
}

/// Expands a test set into invocation units, one per matching file under `root`.
///
/// Units come back in directory listing order. A pattern that matches nothing
/// yields an empty list.
pub fn enumerate_tests(
  root: &Path,
  set: &TestSet,
  config: &TestInvocationConfig,
) -> Result<Vec<TestUnit>> {
  let pattern = effective_pattern(&set.test_path);
  let matcher = compile_glob(&pattern).map_err(|reason| invalid(set, "test_path", &pattern, reason))?;
  let exclusions = Exclusions::new(set)?;
  let walk_root = root.join(literal_prefix(&pattern));
  if !walk_root.exists() {
    return Ok(Vec::new());
  }

  let pattern_file = pattern.rsplit('/').next().unwrap_or(&pattern);
  let tds_path = resolve_resource(root, &set.tds_name);
  let mut units = Vec::new();
  for entry in WalkDir::new(&walk_root).into_iter() {
    let entry = match entry {
      Ok(entry) => entry,
      Err(err) => {
        let path = err.path().map(|p| p.display().to_string()).unwrap_or_default();
        tracing::warn!(set = %set.config_name, path = %path, error = %err, "skipping unreadable entry");
        continue;
      }
    };
    if !entry.file_type().is_file() {
      continue;
    }

    let relative = relative_to(root, entry.path());
    if !matcher.is_match(&relative) {
      continue;
    }

    let file_name = entry.file_name().to_string_lossy();
    let name = derive_test_name(pattern_file, &file_name);
    if exclusions.excludes(&name) {
      tracing::debug!(test = %relative, name = %name, set = %set.config_name, "excluded");
      continue;
    }

    units.push(TestUnit::new(
      root,
      &relative,
      &name,
      set.clone(),
      tds_path.clone(),
      config.clone(),
    ));
  }

  Ok(units)
}

/// Expected output candidates for a unit, in preference order:
/// `expected.{name}.xml`, then `expected.{name}.1.xml`, `expected.{name}.2.xml`, ...
pub fn expected_candidates(unit: &TestUnit) -> Vec<PathBuf> {
  let Some(dir) = unit.path.parent() else {
    return Vec::new();
  };
  let Ok(pattern) = Regex::new(&format!(
    r"^expected\.{}(?:\.(\d+))?\.xml$",
    regex::escape(&unit.name)
  )) else {
    return Vec::new();
  };
  let Ok(entries) = fs::read_dir(dir) else {
    return Vec::new();
  };

  let mut found: Vec<(Option<u64>, PathBuf)> = Vec::new();
  for entry in entries.filter_map(|e| e.ok()) {
    let file_name = entry.file_name();
    let file_name = file_name.to_string_lossy();
    let Some(captures) = pattern.captures(&file_name) else {
      continue;
    };
    let index = match captures.get(1) {
      Some(raw) => match raw.as_str().parse::<u64>() {
        Ok(index) => Some(index),
        Err(_) => continue,
      },
      None => None,
    };
    found.push((index, entry.path()));
  }

  // `None` (the unnumbered file) sorts first.
  found.sort_by(|a, b| a.0.cmp(&b.0));
  found.into_iter().map(|(_, path)| path).collect()
}

fn effective_pattern(test_path: &str) -> String {
  let normalized = test_path.trim().replace('\\', "/");
  let normalized = normalized.trim_start_matches("./");
  if normalized.is_empty() || normalized.ends_with('/') {
    format!("{normalized}{DIRECTORY_TEST_GLOB}")
  } else {
    normalized.to_string()
  }
}

/// Directory part of `pattern` before the first component with glob syntax.
fn literal_prefix(pattern: &str) -> PathBuf {
  let components: Vec<&str> = pattern.split('/').collect();
  let mut prefix = PathBuf::new();
  for component in &components[..components.len().saturating_sub(1)] {
    if component.contains(GLOB_META) {
      break;
    }
    prefix.push(component);
  }
  prefix
}

fn compile_glob(pattern: &str) -> std::result::Result<GlobMatcher, String> {
  GlobBuilder::new(pattern)
    .literal_separator(true)
    .build()
    .map(|glob| glob.compile_matcher())
    .map_err(|err| err.to_string())
}

/// The text matched by the first `*` of the pattern's file component, falling
/// back to the file name minus a `setup.` prefix and its extension.
fn derive_test_name(pattern_file: &str, file_name: &str) -> String {
  if let Some((prefix, suffix)) = pattern_file.split_once('*') {
    let literal = !prefix.contains(GLOB_META) && !suffix.contains(GLOB_META);
    if literal
      && file_name.len() > prefix.len() + suffix.len()
      && file_name.starts_with(prefix)
      && file_name.ends_with(suffix)
    {
      return file_name[prefix.len()..file_name.len() - suffix.len()].to_string();
    }
  }

  let stem = file_name.strip_prefix("setup.").unwrap_or(file_name);
  match stem.rsplit_once('.') {
    Some((name, _ext)) if !name.is_empty() => name.to_string(),
    _ => stem.to_string(),
  }
}

struct Exclusions {
  exact: Vec<String>,
  globs: Vec<GlobMatcher>,
}

impl Exclusions {
  fn new(set: &TestSet) -> Result<Self> {
    let mut exact = Vec::new();
    let mut globs = Vec::new();
    for entry in set.exclusion_list() {
      if entry.contains(GLOB_META) {
        let glob = Glob::new(entry).map_err(|err| invalid(set, "exclusions", entry, err.to_string()))?;
        globs.push(glob.compile_matcher());
      } else {
        exact.push(entry.to_string());
      }
    }
    Ok(Self { exact, globs })
  }

  fn excludes(&self, name: &str) -> bool {
    self.exact.iter().any(|entry| entry == name) || self.globs.iter().any(|g| g.is_match(name))
  }
}

fn invalid(set: &TestSet, key: &str, value: &str, reason: String) -> HarnessError {
  HarnessError::Config(ConfigError::InvalidValue {
    section: set.config_name.clone(),
    key: key.to_string(),
    value: value.to_string(),
    reason,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  fn write(root: &Path, rel: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, "").unwrap();
  }

  fn sorted_names(units: &[TestUnit]) -> Vec<String> {
    let mut names: Vec<_> = units.iter().map(|u| u.name.clone()).collect();
    names.sort();
    names
  }

  #[test]
  fn logical_pattern_matches_setup_files() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    write(root, "logicaltests/setup/calcs/setup.BUGS.B1713.bool_.xml");
    write(root, "logicaltests/setup/calcs/setup.date.bool_.xml");
    write(root, "logicaltests/setup/calcs/setup.date.bigquery.xml");
    write(root, "logicaltests/setup/calcs/nested/setup.deep.bool_.xml");

    let set = TestSet::new(
      "logical.calcs.tde.cfg",
      "cast_calcs.tde.tds",
      "",
      "logicaltests/setup/calcs/setup.*.bool_.xml",
    );
    let config = TestInvocationConfig {
      logical: true,
      ..TestInvocationConfig::default()
    };
    let units = enumerate_tests(root, &set, &config).unwrap();

    assert_eq!(sorted_names(&units), vec!["BUGS.B1713", "date"]);
    let unit = units.iter().find(|u| u.name == "date").unwrap();
    assert_eq!(
      unit.id,
      "logical.calcs.tde.cfg/logicaltests/setup/calcs/setup.date.bool_.xml"
    );
    assert_eq!(unit.tds_path, root.join("cast_calcs.tde.tds"));
    assert!(unit.config.logical);
  }

  #[test]
  fn directory_pattern_expands_to_setup_txt_and_honors_exclusions() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    write(root, "exprtests/standard/setup.string.char.txt");
    write(root, "exprtests/standard/setup.dateparse.txt");
    write(root, "exprtests/standard/setup.math.abs.txt");
    write(root, "exprtests/standard/expected.setup.math.abs.xml");

    let set = TestSet::new(
      "expression_test.tde.cfg",
      "cast_calcs.tde.tds",
      "string.char, dateparse",
      "exprtests/standard/",
    );
    let units = enumerate_tests(root, &set, &TestInvocationConfig::default()).unwrap();
    assert_eq!(sorted_names(&units), vec!["math.abs"]);
  }

  #[cfg(unix)]
  #[test]
  fn unreadable_directories_are_skipped() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().unwrap();
    let root = dir.path();
    write(root, "exprtests/open/setup.math.abs.txt");
    write(root, "exprtests/locked/setup.string.left.txt");
    let locked = root.join("exprtests/locked");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    let readable_anyway = fs::read_dir(&locked).is_ok();

    let set = TestSet::new("expression_test.tde.cfg", "t.tds", "", "exprtests/**/setup.*.txt");
    let units = enumerate_tests(root, &set, &TestInvocationConfig::default());
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

    let names = sorted_names(&units.unwrap());
    if readable_anyway {
      assert_eq!(names, vec!["math.abs", "string.left"]);
    } else {
      assert_eq!(names, vec!["math.abs"]);
    }
  }

  #[test]
  fn glob_exclusions_match_names() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    write(root, "exprtests/standard/setup.string.left.txt");
    write(root, "exprtests/standard/setup.string.right.txt");
    write(root, "exprtests/standard/setup.math.abs.txt");

    let set = TestSet::new("e.cfg", "t.tds", "string.*", "exprtests/standard/");
    let units = enumerate_tests(root, &set, &TestInvocationConfig::default()).unwrap();
    assert_eq!(sorted_names(&units), vec!["math.abs"]);
  }

  #[test]
  fn matching_is_case_sensitive_and_empty_is_ok() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    write(root, "exprtests/lodcalcs/SETUP.fixed.txt");

    let set = TestSet::new("e.cfg", "t.tds", "", "exprtests/lodcalcs/setup.*.txt");
    let units = enumerate_tests(root, &set, &TestInvocationConfig::default()).unwrap();
    assert!(units.is_empty());

    let missing = TestSet::new("e.cfg", "t.tds", "", "nowhere/setup.*.txt");
    assert!(enumerate_tests(root, &missing, &TestInvocationConfig::default())
      .unwrap()
      .is_empty());
  }

  #[test]
  fn invalid_pattern_is_a_config_error() {
    let dir = tempdir().unwrap();
    let set = TestSet::new("e.cfg", "t.tds", "", "exprtests/[oops/setup.*.txt");
    let err = enumerate_tests(dir.path(), &set, &TestInvocationConfig::default()).unwrap_err();
    assert!(matches!(err, HarnessError::Config(_)));
  }

  #[test]
  fn expected_candidates_are_ordered() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    write(root, "exprtests/standard/setup.math.abs.txt");
    write(root, "exprtests/standard/expected.math.abs.10.xml");
    write(root, "exprtests/standard/expected.math.abs.2.xml");
    write(root, "exprtests/standard/expected.math.abs.xml");
    write(root, "exprtests/standard/expected.math.abs2.xml");

    let set = TestSet::new("e.cfg", "t.tds", "", "exprtests/standard/");
    let units = enumerate_tests(root, &set, &TestInvocationConfig::default()).unwrap();
    let candidates: Vec<_> = expected_candidates(&units[0])
      .into_iter()
      .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
      .collect();
    assert_eq!(
      candidates,
      vec![
        "expected.math.abs.xml",
        "expected.math.abs.2.xml",
        "expected.math.abs.10.xml"
      ]
    );
  }

  #[test]
  fn derives_names_with_fallback() {
    assert_eq!(derive_test_name("setup.*.bool_.xml", "setup.a.b.bool_.xml"), "a.b");
    assert_eq!(derive_test_name("setup.*.txt", "setup.string.char.txt"), "string.char");
    assert_eq!(derive_test_name("*", "setup.x.txt"), "setup.x.txt");
    assert_eq!(derive_test_name("setup.[ab]*.txt", "setup.a1.txt"), "a1");
  }

  #[test]
  fn actual_path_is_scoped_by_test_set() {
    let unit = TestUnit::new(
      Path::new("/suite"),
      "exprtests/standard/setup.math.abs.txt",
      "math.abs",
      TestSet::new("expression_test.tde.cfg", "t.tds", "", "exprtests/standard/"),
      PathBuf::from("/suite/t.tds"),
      TestInvocationConfig::default(),
    );
    assert_eq!(
      unit.actual_path(Path::new("/out")),
      PathBuf::from("/out/expression_test.tde.cfg/exprtests/standard/actual.math.abs.xml")
    );
    assert!(!unit.should_fail());
  }

  #[test]
  fn filter_accepts_glob_or_regex() {
    let glob = build_filter(Some("logical.*/**")).unwrap();
    assert!(glob.matches("logical.calcs.tde.cfg/logicaltests/setup/calcs/setup.a.bool_.xml"));
    assert!(!glob.matches("expression_test.tde.cfg/exprtests/standard/setup.a.txt"));

    assert!(matches!(build_filter(None).unwrap(), Filter::All));
    assert!(matches!(build_filter(Some("[")), Err(HarnessError::InvalidFilter(_))));
  }
}
