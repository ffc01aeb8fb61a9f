use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tdvt_harness::diff_fixtures::check_diff_fixtures;
use tdvt_harness::query_tool::DEFAULT_TOOL;
use tdvt_harness::report::{write_json_report, write_json_report_to_stdout};
use tdvt_harness::runner::DEFAULT_TIMEOUT_SECS;
use tdvt_harness::suite::SuiteOutcome;
use tdvt_harness::{
  build_filter, list_datasources, load_datasource, rerun_failed, run_datasource,
  DatasourceRunOptions, FamilySelection, IniDocument, ProcessRunner, RunLog, RunOptions, RunReport,
  TestInvocationConfig,
};
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

const DEFAULT_OUTPUT_DIR_NAME: &str = "tdvt_output";

#[derive(Parser)]
#[command(author, version, about = "Query translation verification harness", long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run every configured test set of a datasource
  Run(RunArgs),

  /// Re-run the tests recorded in a failed-tests file
  Rerun(RerunArgs),

  /// Print the resolved test sets of one or all datasources
  List {
    /// Datasource INI file
    #[arg(long)]
    config: PathBuf,

    /// Only this datasource
    #[arg(long)]
    datasource: Option<String>,

    /// Print JSON instead of one line per test set
    #[arg(long)]
    json: bool,
  },

  /// Check the diff engine against `expected.*` / `actual.*` fixture pairs
  Diff {
    #[arg(long)]
    dir: PathBuf,

    /// Emit JSON output in addition to the human summary
    #[arg(long)]
    json: bool,

    #[arg(long)]
    trace: bool,
  },
}

#[derive(Args)]
struct RunArgs {
  /// Datasource INI file
  #[arg(long)]
  config: PathBuf,

  /// Section of the INI file to run
  #[arg(long)]
  datasource: String,

  /// Glob or regex over test identities (`{config}/{path}`)
  #[arg(long)]
  filter: Option<String>,

  #[arg(long, conflicts_with = "expression_only")]
  logical_only: bool,

  #[arg(long)]
  expression_only: bool,

  #[command(flatten)]
  exec: ExecArgs,
}

#[derive(Args)]
struct RerunArgs {
  /// Failed-tests file written by an earlier run
  #[arg(long)]
  file: PathBuf,

  #[command(flatten)]
  exec: ExecArgs,
}

#[derive(Args)]
struct ExecArgs {
  /// Test root containing the test definitions and expected outputs
  #[arg(long)]
  root: PathBuf,

  /// Query tool executable
  #[arg(long, default_value = DEFAULT_TOOL)]
  tool: PathBuf,

  /// Maximum number of query tool processes to run concurrently
  #[arg(long)]
  jobs: Option<usize>,

  /// Timeout per test
  #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
  timeout_secs: u64,

  /// Where actual outputs, the run log and the failed-tests file go
  /// (default: `<root>/tdvt_output`)
  #[arg(long)]
  output_dir: Option<PathBuf>,

  /// Compare generated SQL
  #[arg(long)]
  compare_sql: bool,

  /// Do not compare result tuples
  #[arg(long)]
  no_compare_tuples: bool,

  /// Extra arguments passed through to the query tool
  #[arg(long, allow_hyphen_values = true)]
  extra_args: Option<String>,

  /// Emit JSON output in addition to the human summary
  #[arg(long)]
  json: bool,

  /// Write the JSON report to this path
  #[arg(long, value_name = "PATH")]
  report: Option<PathBuf>,

  /// Exit successfully even when tests fail
  #[arg(long)]
  allow_failures: bool,

  /// Enable tracing output from the harness
  #[arg(long)]
  trace: bool,

  /// Emit tracing output as JSON lines
  #[arg(long)]
  trace_json: bool,
}

impl ExecArgs {
  fn output_dir(&self) -> PathBuf {
    self
      .output_dir
      .clone()
      .unwrap_or_else(|| self.root.join(DEFAULT_OUTPUT_DIR_NAME))
  }

  fn invocation(&self) -> TestInvocationConfig {
    TestInvocationConfig {
      compare_sql: self.compare_sql,
      compare_tuples: !self.no_compare_tuples,
      extra_args: self.extra_args.clone().unwrap_or_default(),
      ..TestInvocationConfig::default()
    }
  }

  fn open_log(&self, output_dir: &Path) -> anyhow::Result<RunLog> {
    RunLog::in_output_dir(output_dir)
      .with_context(|| format!("create run log in {}", output_dir.display()))
  }
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  let result = match cli.command {
    Commands::Run(args) => {
      init_tracing(args.exec.trace, args.exec.trace_json);
      run_command(args)
    }
    Commands::Rerun(args) => {
      init_tracing(args.exec.trace, args.exec.trace_json);
      rerun_command(args)
    }
    Commands::List {
      config,
      datasource,
      json,
    } => list_command(&config, datasource.as_deref(), json),
    Commands::Diff { dir, json, trace } => {
      init_tracing(trace, false);
      diff_command(&dir, json)
    }
  };

  match result {
    Ok(code) => code,
    Err(err) => print_error(err),
  }
}

fn run_command(args: RunArgs) -> anyhow::Result<ExitCode> {
  let filter = build_filter(args.filter.as_deref())?;
  let families = if args.logical_only {
    FamilySelection::LogicalOnly
  } else if args.expression_only {
    FamilySelection::ExpressionOnly
  } else {
    FamilySelection::All
  };
  let output_dir = args.exec.output_dir();
  let log = args.exec.open_log(&output_dir)?;
  let options = DatasourceRunOptions {
    config_path: args.config,
    datasource: args.datasource,
    root: args.exec.root.clone(),
    families,
    invocation: args.exec.invocation(),
    filter,
    jobs: args.exec.jobs,
    timeout: Duration::from_secs(args.exec.timeout_secs),
    output_dir,
  };

  let runner = ProcessRunner::new(&args.exec.tool);
  let outcome = run_datasource(&options, &runner, &log)
    .with_context(|| format!("run datasource '{}'", options.datasource))?;
  finish(outcome, &args.exec, &log)
}

fn rerun_command(args: RerunArgs) -> anyhow::Result<ExitCode> {
  let output_dir = args.exec.output_dir();
  let log = args.exec.open_log(&output_dir)?;
  let run = RunOptions {
    jobs: args.exec.jobs.unwrap_or_else(default_jobs),
    timeout: Duration::from_secs(args.exec.timeout_secs),
    output_dir,
  };

  let runner = ProcessRunner::new(&args.exec.tool);
  let outcome = rerun_failed(
    &args.file,
    &args.exec.root,
    &args.exec.invocation(),
    &run,
    &runner,
    &log,
  )
  .with_context(|| format!("rerun {}", args.file.display()))?;
  finish(outcome, &args.exec, &log)
}

fn finish(outcome: SuiteOutcome, exec: &ExecArgs, log: &RunLog) -> anyhow::Result<ExitCode> {
  let report = RunReport::new(&outcome.results);
  if let Some(path) = &exec.report {
    write_json_report(path, &report)?;
  }
  if exec.json {
    write_json_report_to_stdout(&report)?;
  }

  let mut summary = Vec::new();
  report.write_human(&mut summary)?;
  let summary = String::from_utf8_lossy(&summary);
  for line in summary.lines() {
    log.line(line);
  }
  if !exec.json {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    handle.write_all(summary.as_bytes())?;
  }
  if let Some(path) = &outcome.failures_file {
    eprintln!("failed tests recorded in {}", path.display());
  }
  log.flush();

  if report.summary.all_passed() || exec.allow_failures {
    Ok(ExitCode::SUCCESS)
  } else {
    Ok(ExitCode::from(1))
  }
}

fn list_command(config: &Path, datasource: Option<&str>, json: bool) -> anyhow::Result<ExitCode> {
  let doc = IniDocument::from_path(config)?;
  let names = match datasource {
    Some(name) => vec![name.to_string()],
    None => list_datasources(&doc),
  };

  let mut resolved = Vec::with_capacity(names.len());
  for name in &names {
    resolved.push(load_datasource(&doc, name)?);
  }

  if json {
    write_json_report_to_stdout(&resolved)?;
    return Ok(ExitCode::SUCCESS);
  }
  let stdout = io::stdout();
  let mut out = stdout.lock();
  for tests in &resolved {
    writeln!(out, "{}", tests.name)?;
    for set in tests.all_tests() {
      writeln!(out, "  {set}")?;
    }
    if let Some(extra) = &tests.datasource_override {
      writeln!(out, "  override: {extra}")?;
    }
  }
  Ok(ExitCode::SUCCESS)
}

fn diff_command(dir: &Path, json: bool) -> anyhow::Result<ExitCode> {
  if !dir.is_dir() {
    bail!("diff fixture directory {} does not exist", dir.display());
  }
  let log = RunLog::disabled();
  let outcomes = check_diff_fixtures(dir, &log)?;
  if json {
    write_json_report_to_stdout(&outcomes)?;
  }

  let failed: Vec<_> = outcomes.iter().filter(|o| !o.passed).collect();
  for outcome in &failed {
    eprintln!("FAILED {}", outcome.name);
    if let Some(err) = &outcome.error {
      eprintln!("    {err}");
    }
    for line in outcome.diff_text.lines() {
      eprintln!("    {line}");
    }
  }
  println!(
    "{}/{} diff fixture(s) passed",
    outcomes.len() - failed.len(),
    outcomes.len()
  );
  Ok(if failed.is_empty() {
    ExitCode::SUCCESS
  } else {
    ExitCode::from(1)
  })
}

fn default_jobs() -> usize {
  num_cpus::get().max(1)
}

fn print_error(err: anyhow::Error) -> ExitCode {
  eprintln!("error: {err:#}");
  ExitCode::from(1)
}

fn init_tracing(enable: bool, json: bool) {
  if !enable && !json {
    return;
  }

  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let builder = fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr);
  let installed = if json {
    builder.json().with_ansi(false).try_init()
  } else {
    builder.try_init()
  };
  if let Err(err) = installed {
    eprintln!("failed to install tracing subscriber: {err}");
  }
}
