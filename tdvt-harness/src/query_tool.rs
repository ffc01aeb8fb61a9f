use crate::discover::TestUnit;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_TOOL: &str = "tabquerytool";
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long to wait for stderr to drain once the tool has exited or been killed.
const STDERR_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ExecutionError {
  #[error("failed to spawn {tool}: {source}")]
  Spawn {
    tool: PathBuf,
    #[source]
    source: io::Error,
  },
  #[error("timed out after {}s", .0.as_secs_f64())]
  Timeout(Duration),
  #[error("query tool exited with {status}: {stderr}")]
  Failed { status: String, stderr: String },
  #[error("query tool produced no output at {0}")]
  MissingOutput(PathBuf),
  #[error("prepare output location {path}: {source}")]
  Prepare {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Executes one invocation unit, leaving a result document at `output`.
pub trait QueryRunner: Sync {
  fn run(&self, unit: &TestUnit, output: &Path, timeout: Duration) -> Result<(), ExecutionError>;
}

/// Runs the external query tool as a child process per unit.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
  tool: PathBuf,
  leading_args: Vec<OsString>,
}

impl ProcessRunner {
  pub fn new(tool: impl Into<PathBuf>) -> Self {
    Self {
      tool: tool.into(),
      leading_args: Vec::new(),
    }
  }

  /// Arguments placed before the per-unit ones, e.g. a script for an interpreter.
  pub fn with_leading_args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
  {
    self.leading_args = args.into_iter().map(Into::into).collect();
    self
  }
}

/// The per-unit command line understood by the query tool.
pub fn tool_arguments(unit: &TestUnit, output: &Path) -> Vec<OsString> {
  let mut args: Vec<OsString> = Vec::new();
  args.push(if unit.config.logical {
    "--logical".into()
  } else {
    "--expression".into()
  });
  args.push("--datasource".into());
  args.push(unit.tds_path.clone().into_os_string());
  args.push("--test".into());
  args.push(unit.path.clone().into_os_string());
  args.push("--output".into());
  args.push(output.as_os_str().to_os_string());
  if let Some(extra) = unit.config.datasource_override.as_deref() {
    args.push("--override".into());
    args.push(extra.into());
  }
  args.extend(unit.config.extra_args.split_whitespace().map(OsString::from));
  args
}

impl QueryRunner for ProcessRunner {
  fn run(&self, unit: &TestUnit, output: &Path, timeout: Duration) -> Result<(), ExecutionError> {
    let prepare = |source: io::Error| ExecutionError::Prepare {
      path: output.to_path_buf(),
      source,
    };
    if let Some(parent) = output.parent() {
      fs::create_dir_all(parent).map_err(prepare)?;
    }
    match fs::remove_file(output) {
      Ok(()) => {}
      Err(err) if err.kind() == io::ErrorKind::NotFound => {}
      Err(err) => return Err(prepare(err)),
    }

    let mut cmd = Command::new(&self.tool);
    cmd.args(&self.leading_args);
    cmd.args(tool_arguments(unit, output));
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());
    // The tool and anything it forks share a group, killed as one on timeout.
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
    tracing::debug!(test = %unit.id, tool = %self.tool.display(), "spawning query tool");

    let mut child = cmd.spawn().map_err(|source| ExecutionError::Spawn {
      tool: self.tool.clone(),
      source,
    })?;

    let stderr_reader = child.stderr.take().map(|mut stderr| {
      thread::spawn(move || {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf);
        buf
      })
    });
    let collect_stderr = |reader: Option<thread::JoinHandle<String>>| {
      reader.and_then(join_within).unwrap_or_default()
    };

    let deadline = Instant::now() + timeout;
    let status = loop {
      match child.try_wait() {
        Ok(Some(status)) => break status,
        Ok(None) => {}
        Err(err) => {
          kill_tree(&mut child);
          collect_stderr(stderr_reader);
          return Err(ExecutionError::Failed {
            status: "unknown".to_string(),
            stderr: err.to_string(),
          });
        }
      }
      if Instant::now() >= deadline {
        tracing::debug!(test = %unit.id, "query tool timed out; killing its process group");
        kill_tree(&mut child);
        collect_stderr(stderr_reader);
        return Err(ExecutionError::Timeout(timeout));
      }
      thread::sleep(POLL_INTERVAL);
    };

    // Leftover background processes would hold stderr open.
    #[cfg(unix)]
    kill_group(&child);
    let stderr = collect_stderr(stderr_reader);
    if !status.success() {
      return Err(ExecutionError::Failed {
        status: status.to_string(),
        stderr: stderr.trim().to_string(),
      });
    }
    if !output.is_file() {
      return Err(ExecutionError::MissingOutput(output.to_path_buf()));
    }
    Ok(())
  }
}

/// Kills the tool together with any processes it left in its group.
fn kill_tree(child: &mut Child) {
  #[cfg(unix)]
  kill_group(child);
  let _ = child.kill();
  let _ = child.wait();
}

#[cfg(unix)]
fn kill_group(child: &Child) {
  use nix::sys::signal::{killpg, Signal};
  use nix::unistd::Pid;

  let Ok(pid) = i32::try_from(child.id()) else {
    return;
  };
  match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
    Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
    Err(err) => tracing::warn!(pid, error = %err, "failed to kill query tool process group"),
  }
}

/// Joins the stderr reader, detaching it if the pipe is still held open after
/// the grace period.
fn join_within(handle: thread::JoinHandle<String>) -> Option<String> {
  let deadline = Instant::now() + STDERR_GRACE;
  while !handle.is_finished() {
    if Instant::now() >= deadline {
      tracing::warn!("query tool stderr still open; not waiting for it");
      return None;
    }
    thread::sleep(POLL_INTERVAL);
  }
  handle.join().ok()
}
