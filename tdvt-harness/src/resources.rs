use std::path::{Path, PathBuf};

/// Subdirectories of a test root searched for named resources, after the root itself.
const RESOURCE_DIRS: &[&str] = &["tds", "config"];

/// Returns an absolute-ish path for a named resource under `root`.
///
/// Existing absolute paths are returned unchanged. Otherwise `root/name`,
/// `root/tds/name` and `root/config/name` are tried in order. When none exist
/// the result is `root/name` and the caller reports the absence.
pub fn resolve_resource(root: &Path, name: &str) -> PathBuf {
  let direct = Path::new(name);
  if direct.is_absolute() && direct.exists() {
    return direct.to_path_buf();
  }

  let joined = root.join(name);
  if joined.exists() {
    return joined;
  }

  for dir in RESOURCE_DIRS {
    let candidate = root.join(dir).join(name);
    if candidate.exists() {
      return candidate;
    }
  }

  joined
}

/// Renders `path` relative to `root` with `/` separators, or as-is when it is
/// not under `root`.
pub fn relative_to(root: &Path, path: &Path) -> String {
  path
    .strip_prefix(root)
    .unwrap_or(path)
    .to_string_lossy()
    .replace('\\', "/")
}
