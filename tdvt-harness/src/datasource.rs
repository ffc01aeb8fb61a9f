//! Resolves a datasource's test matrix from a layered INI file.
//!
//! The `[defaults]` section supplies datasource-independent values. A section
//! named after a datasource overrides them field by field. Sections named
//! `{datasource}:logical:{label}` or `{datasource}:expression:{label}` add
//! custom test sets for that datasource.

use crate::ini::{parse_bool, ConfigError, IniDocument, IniSection};
use crate::test_set::{TestFamily, TestSet};
use serde::Serialize;
use std::path::Path;
use tracing::debug;

pub const DEFAULTS_SECTION: &str = "defaults";
pub const DEFAULT_LOGICAL_QUERY_FORMAT: &str = "bool_";

const CALCS_TDS: &str = "cast_calcs";
const STAPLES_TDS: &str = "Staples";
const STAPLES_DATA_KEY: &str = "staples_data";

#[derive(Debug, Clone, Copy)]
struct Category {
  key: &'static str,
  family: TestFamily,
  config_prefix: &'static str,
  tds_prefix: &'static str,
  default_path: &'static str,
  /// Emitted only while the `staples_data` gate is on.
  gated: bool,
}

const CATEGORIES: &[Category] = &[
  Category {
    key: "logical_calcs",
    family: TestFamily::Logical,
    config_prefix: "logical.calcs",
    tds_prefix: CALCS_TDS,
    default_path: "logicaltests/setup/calcs/setup.*.{fmt}.xml",
    gated: false,
  },
  Category {
    key: "logical_staples",
    family: TestFamily::Logical,
    config_prefix: "logical.staples",
    tds_prefix: STAPLES_TDS,
    default_path: "logicaltests/setup/staples/setup.*.{fmt}.xml",
    gated: false,
  },
  Category {
    key: "logical_lod",
    family: TestFamily::Logical,
    config_prefix: "logical.lod",
    tds_prefix: STAPLES_TDS,
    default_path: "logicaltests/setup/lod/setup.*.{fmt}.xml",
    gated: false,
  },
  Category {
    key: "expression_standard",
    family: TestFamily::Expression,
    config_prefix: "expression_test",
    tds_prefix: CALCS_TDS,
    default_path: "exprtests/standard/",
    gated: false,
  },
  Category {
    key: "expression_lod",
    family: TestFamily::Expression,
    config_prefix: "expression.lod",
    tds_prefix: CALCS_TDS,
    default_path: "exprtests/lodcalcs/setup.*.txt",
    gated: false,
  },
  Category {
    key: "expression_staples",
    family: TestFamily::Expression,
    config_prefix: "expression.staples",
    tds_prefix: STAPLES_TDS,
    default_path: "exprtests/staples/setup.*.txt",
    gated: true,
  },
];

/// The resolved test matrix for one datasource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasourceTests {
  pub name: String,
  pub logical_query_format: String,
  pub logical_tests: Vec<TestSet>,
  pub expression_tests: Vec<TestSet>,
  /// Extra connection settings handed to the query tool, e.g. `DWorkFaster=True`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub datasource_override: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_threads: Option<usize>,
}

impl DatasourceTests {
  /// Logical sets followed by expression sets, in resolution order.
  pub fn all_tests(&self) -> Vec<TestSet> {
    self
      .logical_tests
      .iter()
      .chain(self.expression_tests.iter())
      .cloned()
      .collect()
  }

  pub fn tests_for(&self, family: TestFamily) -> &[TestSet] {
    match family {
      TestFamily::Logical => &self.logical_tests,
      TestFamily::Expression => &self.expression_tests,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.logical_tests.is_empty() && self.expression_tests.is_empty()
  }

  fn push(&mut self, family: TestFamily, set: TestSet) {
    match family {
      TestFamily::Logical => self.logical_tests.push(set),
      TestFamily::Expression => self.expression_tests.push(set),
    }
  }
}

pub fn load_datasource_file(path: &Path, datasource: &str) -> Result<DatasourceTests, ConfigError> {
  let doc = IniDocument::from_path(path)?;
  load_datasource(&doc, datasource)
}

/// Resolves the test matrix for `datasource`.
///
/// A datasource without its own section resolves to an empty matrix.
pub fn load_datasource(doc: &IniDocument, datasource: &str) -> Result<DatasourceTests, ConfigError> {
  let mut resolved = DatasourceTests {
    name: datasource.to_string(),
    logical_query_format: DEFAULT_LOGICAL_QUERY_FORMAT.to_string(),
    ..DatasourceTests::default()
  };

  let Some(section) = doc.section(datasource) else {
    debug!(datasource, "no section for datasource; nothing to run");
    return Ok(resolved);
  };
  let layers = Layers {
    section,
    defaults: doc.section(DEFAULTS_SECTION),
  };

  if let Some(format) = layers.get("logical_query_format").filter(|v| !v.is_empty()) {
    resolved.logical_query_format = format.to_string();
  }
  resolved.datasource_override = layers
    .get("override")
    .filter(|v| !v.is_empty())
    .map(str::to_string);
  resolved.max_threads = match layers.get("max_threads") {
    Some(raw) => Some(parse_max_threads(layers.origin("max_threads"), raw)?),
    None => None,
  };

  let staples_data = match layers.get(STAPLES_DATA_KEY) {
    Some(raw) => parse_bool(raw).ok_or_else(|| ConfigError::InvalidValue {
      section: layers.origin(STAPLES_DATA_KEY).to_string(),
      key: STAPLES_DATA_KEY.to_string(),
      value: raw.to_string(),
      reason: "expected on/off".to_string(),
    })?,
    None => false,
  };

  for category in CATEGORIES {
    if category.gated && !staples_data {
      debug!(datasource, category = category.key, "staples data disabled");
      continue;
    }
    let Some(set) = resolve_category(category, &layers, datasource, &resolved.logical_query_format)
    else {
      continue;
    };
    debug!(datasource, category = category.key, set = %set, "resolved test set");
    resolved.push(category.family, set);
  }

  for custom in doc.sections() {
    let Some((family, label)) = custom_section(&custom.name, datasource) else {
      continue;
    };
    let set = resolve_custom(custom, family, label, datasource, &resolved.logical_query_format);
    if resolved
      .all_tests()
      .iter()
      .any(|existing| existing.config_name == set.config_name)
    {
      return Err(ConfigError::InvalidValue {
        section: custom.name.clone(),
        key: "name".to_string(),
        value: custom.get("name").unwrap_or(label).to_string(),
        reason: format!("test set {} is already defined", set.config_name),
      });
    }
    debug!(datasource, section = %custom.name, set = %set, "resolved custom test set");
    resolved.push(family, set);
  }

  Ok(resolved)
}

/// Names of every datasource section, in file order.
pub fn list_datasources(doc: &IniDocument) -> Vec<String> {
  doc
    .sections()
    .filter(|section| section.name != DEFAULTS_SECTION && !section.name.contains(':'))
    .map(|section| section.name.clone())
    .collect()
}

struct Layers<'a> {
  section: &'a IniSection,
  defaults: Option<&'a IniSection>,
}

impl<'a> Layers<'a> {
  fn get(&self, key: &str) -> Option<&'a str> {
    self
      .section
      .get(key)
      .or_else(|| self.defaults.and_then(|defaults| defaults.get(key)))
  }

  /// Which section a key resolved from, for error messages.
  fn origin(&self, key: &str) -> &'a str {
    if self.section.contains_key(key) {
      &self.section.name
    } else {
      DEFAULTS_SECTION
    }
  }
}

enum Presence {
  Absent,
  Disabled,
  Enabled,
}

fn category_presence(section: &IniSection, category: &Category) -> Presence {
  if let Some(raw) = section.get(category.key) {
    if parse_bool(raw) == Some(false) {
      return Presence::Disabled;
    }
    return Presence::Enabled;
  }

  let exclusions = format!("{}_exclusions", category.key);
  let tds = format!("{}_tds", category.key);
  if section.contains_key(&exclusions) || section.contains_key(&tds) {
    Presence::Enabled
  } else {
    Presence::Absent
  }
}

fn resolve_category(
  category: &Category,
  layers: &Layers<'_>,
  datasource: &str,
  logical_query_format: &str,
) -> Option<TestSet> {
  let presence = match category_presence(layers.section, category) {
    Presence::Absent => layers
      .defaults
      .map(|defaults| category_presence(defaults, category))
      .unwrap_or(Presence::Absent),
    other => other,
  };
  match presence {
    Presence::Disabled => return None,
    // Gated categories need no key of their own once the gate is on.
    Presence::Absent if !category.gated => return None,
    _ => {}
  }

  let exclusions = layers
    .get(&format!("{}_exclusions", category.key))
    .unwrap_or("")
    .to_string();
  let tds_name = layers
    .get(&format!("{}_tds", category.key))
    .filter(|v| !v.is_empty())
    .map(str::to_string)
    .unwrap_or_else(|| format!("{}.{datasource}.tds", category.tds_prefix));
  let test_path = match layers.get(category.key) {
    Some(raw) if !raw.is_empty() && parse_bool(raw).is_none() => raw.to_string(),
    _ => category.default_path.replace("{fmt}", logical_query_format),
  };

  Some(TestSet {
    config_name: format!("{}.{datasource}.cfg", category.config_prefix),
    tds_name,
    exclusions,
    test_path,
  })
}

fn custom_section<'a>(name: &'a str, datasource: &str) -> Option<(TestFamily, &'a str)> {
  let mut parts = name.splitn(3, ':');
  let owner = parts.next()?;
  let family = parts.next()?;
  let label = parts.next()?;
  if owner != datasource || label.is_empty() {
    return None;
  }

  match family {
    "logical" => Some((TestFamily::Logical, label)),
    "expression" => Some((TestFamily::Expression, label)),
    _ => None,
  }
}

fn resolve_custom(
  section: &IniSection,
  family: TestFamily,
  label: &str,
  datasource: &str,
  logical_query_format: &str,
) -> TestSet {
  let name = section
    .get("name")
    .filter(|v| !v.is_empty())
    .unwrap_or(label);
  let default_path = match family {
    TestFamily::Logical => CATEGORIES[0].default_path,
    TestFamily::Expression => CATEGORIES[3].default_path,
  };

  TestSet {
    config_name: format!("{name}.{datasource}.cfg"),
    tds_name: section
      .get("tds")
      .filter(|v| !v.is_empty())
      .map(str::to_string)
      .unwrap_or_else(|| format!("{CALCS_TDS}.{datasource}.tds")),
    exclusions: section.get("exclusions").unwrap_or("").to_string(),
    test_path: section
      .get("path")
      .filter(|v| !v.is_empty())
      .map(str::to_string)
      .unwrap_or_else(|| default_path.replace("{fmt}", logical_query_format)),
  }
}

fn parse_max_threads(section: &str, raw: &str) -> Result<usize, ConfigError> {
  match raw.trim().parse::<usize>() {
    Ok(count) if count > 0 => Ok(count),
    _ => Err(ConfigError::InvalidValue {
      section: section.to_string(),
      key: "max_threads".to_string(),
      value: raw.to_string(),
      reason: "expected a positive integer".to_string(),
    }),
  }
}
