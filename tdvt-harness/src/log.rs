use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const RUN_LOG_FILE_NAME: &str = "test_results.log";

/// Per-invocation progress sink.
///
/// Each line goes to the optional transcript file and is mirrored as a
/// `tracing` event. One `RunLog` lives for one harness invocation and is shared
/// by reference with the components that report progress.
#[derive(Debug)]
pub struct RunLog {
  path: Option<PathBuf>,
  writer: Mutex<Option<BufWriter<File>>>,
}

impl RunLog {
  /// A sink that only emits `tracing` events.
  pub fn disabled() -> Self {
    Self {
      path: None,
      writer: Mutex::new(None),
    }
  }

  /// Truncates `path` and records every line there.
  pub fn to_file(path: &Path) -> io::Result<Self> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)?;
      }
    }
    let file = File::create(path)?;
    Ok(Self {
      path: Some(path.to_path_buf()),
      writer: Mutex::new(Some(BufWriter::new(file))),
    })
  }

  /// Transcript at `{output_dir}/test_results.log`.
  pub fn in_output_dir(output_dir: &Path) -> io::Result<Self> {
    Self::to_file(&output_dir.join(RUN_LOG_FILE_NAME))
  }

  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  pub fn line(&self, message: impl AsRef<str>) {
    let message = message.as_ref();
    tracing::info!(target: "tdvt", "{message}");
    self.write(message);
  }

  pub fn warn(&self, message: impl AsRef<str>) {
    let message = message.as_ref();
    tracing::warn!(target: "tdvt", "{message}");
    self.write(message);
  }

  fn write(&self, message: &str) {
    let mut guard = match self.writer.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    let Some(writer) = guard.as_mut() else {
      return;
    };
    if let Err(err) = writeln!(writer, "{message}") {
      tracing::warn!("failed to append to run log: {err}");
      *guard = None;
    }
  }

  pub fn flush(&self) {
    let mut guard = match self.writer.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(writer) = guard.as_mut() {
      let _ = writer.flush();
    }
  }
}

impl Drop for RunLog {
  fn drop(&mut self) {
    self.flush();
  }
}
