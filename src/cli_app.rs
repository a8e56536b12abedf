//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use cluster_diag::analyzer::engine::{ResolutionMode, TaskOutcome};
use cluster_diag::analyzer::pipeline::{self, AnalysisOutcome, AnalyzeRequest};
use cluster_diag::core::config::Config;
use cluster_diag::core::paths;
use cluster_diag::daemon::signals::SignalHandler;
use cluster_diag::logger::dual::{ActivityEvent, ActivityLoggerHandle, DualLoggerConfig, spawn_logger};
use cluster_diag::logs::item::{Level, LogItem, Timestamp};
use cluster_diag::logs::searcher::Searcher;
use cluster_diag::logs::timefmt;
use cluster_diag::splitter;
use cluster_diag::syncer::supervisor::{Supervisor, SupervisorOptions};
use cluster_diag::syncer::topology::SyncTask;

/// Cluster log diagnostics: mirror, slice, search and analyze TiDB logs.
#[derive(Debug, Parser)]
#[command(
    name = "cdiag",
    author,
    version,
    about = "Cluster log sync, search and analysis",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Mirror component logs from every host in the topology directory.
    Sync(SyncArgs),
    /// Copy the lines of a log tree that fall inside a time window.
    Split(SplitArgs),
    /// Search a log tree for records in a time window.
    Search(SearchArgs),
    /// Run the analysis pipeline over one inspection.
    Analyze(AnalyzeArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct SyncArgs {
    /// Directory of `{uuid}.json` topology descriptors.
    #[arg(long, value_name = "DIR")]
    topo: Option<PathBuf>,
    /// Local mirror root.
    #[arg(long, value_name = "DIR")]
    target: Option<PathBuf>,
    /// Seconds between copies of one lane.
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,
    /// Passed to `rsync --bwlimit`.
    #[arg(long, value_name = "KBPS")]
    bwlimit: Option<u64>,
    /// Enable the disk guard over the mirror root.
    #[arg(long)]
    gc: bool,
    /// Print the task set derived from the topology and exit.
    #[arg(long)]
    once: bool,
}

#[derive(Debug, Clone, Args)]
struct SplitArgs {
    /// Source log tree.
    #[arg(long, value_name = "DIR")]
    src: PathBuf,
    /// Destination root; the source layout is mirrored under it.
    #[arg(long, value_name = "DIR")]
    dst: PathBuf,
    /// Window start (RFC3339 or `YYYY/MM/DD HH:MM:SS`).
    #[arg(long)]
    begin: String,
    /// Window end, exclusive.
    #[arg(long)]
    end: String,
}

#[derive(Debug, Clone, Args)]
struct SearchArgs {
    /// Log tree laid out as `<host>/<component>-<port>/<file>`.
    #[arg(long, value_name = "DIR")]
    dir: PathBuf,
    #[arg(long)]
    begin: String,
    #[arg(long)]
    end: String,
    /// Only records at this level (`any` for all).
    #[arg(long, default_value = "any")]
    level: String,
    /// Only records containing this text.
    #[arg(long, default_value = "")]
    contains: String,
    /// Records fetched per page.
    #[arg(long)]
    page_size: Option<usize>,
    /// Stop after this many records.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Args, Default)]
struct AnalyzeArgs {
    /// Inspection directory (holds `log/`, `topology.json`, `args.json`).
    #[arg(long, value_name = "DIR", required_unless_present = "home")]
    src: Option<PathBuf>,
    /// Data home; the source becomes `<home>/inspection/<id>` and results
    /// are stored in `<home>/diag.sqlite3`.
    #[arg(long, value_name = "DIR", requires = "inspection")]
    home: Option<PathBuf>,
    /// Inspection id.
    #[arg(long)]
    inspection: Option<String>,
    #[arg(long)]
    begin: Option<String>,
    #[arg(long)]
    end: Option<String>,
    /// Run tasks even when some of their inputs are missing.
    #[arg(long)]
    tolerant: bool,
    /// Number of slowest queries to report.
    #[arg(long)]
    top: Option<usize>,
    /// Do not persist results.
    #[arg(long)]
    no_save: bool,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Operation partially succeeded.
    #[error("{0}")]
    Partial(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
            Self::Partial(_) => 4,
        }
    }
}

pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Sync(args) => run_sync(cli, args),
        Command::Split(args) => run_split(cli, args),
        Command::Search(args) => run_search(cli, args),
        Command::Analyze(args) => run_analyze(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Config::load(cli.config.as_deref()).map_err(|e| CliError::Runtime(e.to_string()))
}

fn parse_time(flag: &str, raw: &str) -> Result<Timestamp, CliError> {
    timefmt::parse_user_time(raw).map_err(|e| CliError::User(format!("--{flag}: {e}")))
}

fn parse_window(begin: &str, end: &str) -> Result<(Timestamp, Timestamp), CliError> {
    let begin = parse_time("begin", begin)?;
    let end = parse_time("end", end)?;
    if begin >= end {
        return Err(CliError::User("--begin must be earlier than --end".to_string()));
    }
    Ok((begin, end))
}

fn start_logger(config: &Config) -> Result<(ActivityLoggerHandle, std::thread::JoinHandle<()>), CliError> {
    spawn_logger(DualLoggerConfig::from_config(config)).map_err(|e| CliError::Runtime(e.to_string()))
}

// ──────────────────── sync ────────────────────

fn run_sync(cli: &Cli, args: &SyncArgs) -> Result<(), CliError> {
    let mut config = load_config(cli)?;
    if let Some(topo) = &args.topo {
        config.sync.topo_dir = paths::strip_trailing_slash(topo);
    }
    if let Some(target) = &args.target {
        config.sync.target_dir = paths::strip_trailing_slash(target);
    }
    if let Some(interval) = args.interval {
        config.sync.interval_secs = interval;
    }
    if let Some(bwlimit) = args.bwlimit {
        config.sync.bwlimit = bwlimit;
    }
    if args.gc {
        config.gc.enabled = true;
    }
    config.validate().map_err(|e| CliError::User(e.to_string()))?;

    let options = SupervisorOptions::from_config(&config);
    if args.once {
        let tasks = options.plan().map_err(|e| CliError::Runtime(e.to_string()))?;
        return print_plan(cli, &tasks);
    }

    let config_hash = config.stable_hash().unwrap_or_default();
    let (logger, logger_join) = start_logger(&config)?;
    if !cli.quiet {
        eprintln!(
            "cdiag sync: {} -> {} every {}s",
            options.topo_dir.display(),
            options.target_dir.display(),
            config.sync.interval_secs
        );
    }
    let result = Supervisor::new(options, config_hash, SignalHandler::new(), logger.clone()).run();
    if let Err(e) = &result {
        logger.send(ActivityEvent::error(e));
    }
    logger.shutdown();
    let _ = logger_join.join();
    result.map_err(|e| CliError::Runtime(e.to_string()))
}

fn print_plan(cli: &Cli, tasks: &[SyncTask]) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => {
            if tasks.is_empty() {
                println!("No sync tasks (no successful hosts in the topology directory).");
            }
            for task in tasks {
                println!("{}", task.key.bold());
                println!("  from:    {}", task.from);
                println!("  to:      {}", task.to.display());
                println!("  filters: {}", task.filters.join(" "));
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "sync",
                "once": true,
                "tasks": tasks,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ──────────────────── split ────────────────────

fn run_split(cli: &Cli, args: &SplitArgs) -> Result<(), CliError> {
    let (begin, end) = parse_window(&args.begin, &args.end)?;
    let report = splitter::split_dir(&args.src, &args.dst, begin, end).map_err(|e| CliError::Runtime(e.to_string()))?;

    match output_mode(cli) {
        OutputMode::Human => {
            if !cli.quiet {
                for file in &report.files {
                    println!("  {:<60} {:>10} lines", file.path.display(), file.lines);
                }
                if cli.verbose {
                    for skipped in &report.skipped {
                        println!("  {} {}", "skipped".dimmed(), skipped.display());
                    }
                }
            }
            println!(
                "Split {} files ({} lines) into {}",
                report.files.len(),
                report.total_lines(),
                args.dst.display()
            );
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "split",
                "begin": begin.to_rfc3339(),
                "end": end.to_rfc3339(),
                "total_lines": report.total_lines(),
                "report": report,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ──────────────────── search ────────────────────

fn run_search(cli: &Cli, args: &SearchArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let (begin, end) = parse_window(&args.begin, &args.end)?;
    let level = args.level.parse::<Level>().map_err(|e| CliError::User(e.to_string()))?;
    let page_size = args.page_size.unwrap_or(config.search.page_size).max(1);
    let limit = args.limit.unwrap_or(usize::MAX);

    let searcher = Searcher::with_idle_timeout(Duration::from_secs(config.search.idle_timeout_secs));
    let (_, token) = searcher
        .search(&args.dir, begin, end, level, &args.contains, None)
        .map_err(|e| CliError::Runtime(e.to_string()))?;

    let mode = output_mode(cli);
    let mut found: Vec<LogItem> = Vec::new();
    let mut pages = 0usize;
    let outcome = loop {
        let remaining = limit - found.len();
        if remaining == 0 {
            break Ok(());
        }
        let page = match searcher
            .search(&args.dir, begin, end, level, &args.contains, Some(&token))
            .and_then(|(session, _)| session.next_page(page_size.min(remaining)))
        {
            Ok(page) => page,
            Err(e) => break Err(CliError::Runtime(e.to_string())),
        };
        if page.is_empty() {
            break Ok(());
        }
        pages += 1;
        if mode == OutputMode::Human {
            for item in &page {
                print_item(item);
            }
        }
        found.extend(page);
    };
    searcher.close(&token);
    outcome?;

    match mode {
        OutputMode::Human => {
            if !cli.quiet {
                eprintln!("{} records in {pages} pages (token {token})", found.len());
            }
        }
        OutputMode::Json => {
            let items: Vec<Value> = found.iter().map(item_json).collect();
            let payload = json!({
                "command": "search",
                "token": token,
                "count": items.len(),
                "pages": pages,
                "items": items,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn print_item(item: &LogItem) {
    let level = match item.level {
        Level::Fatal | Level::Error => item.level.as_str().red().bold(),
        Level::Warn => item.level.as_str().yellow(),
        _ => item.level.as_str().normal(),
    };
    println!(
        "{} {} {}:{} {} {}",
        item.time.to_rfc3339().dimmed(),
        level,
        item.host,
        item.port,
        item.component.cyan(),
        item.content_lossy()
    );
}

fn item_json(item: &LogItem) -> Value {
    json!({
        "host": item.host,
        "port": item.port,
        "component": item.component,
        "file": item.file,
        "time": item.time.to_rfc3339(),
        "level": item.level,
        "content": item.content_lossy(),
    })
}

// ──────────────────── analyze ────────────────────

fn run_analyze(cli: &Cli, args: &AnalyzeArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let src = match (&args.src, &args.home, &args.inspection) {
        (Some(src), _, _) => src.clone(),
        (None, Some(home), Some(inspection)) => pipeline::inspection_dir(home, inspection),
        _ => {
            return Err(CliError::User(
                "analyze needs --src, or --home together with --inspection".to_string(),
            ));
        }
    };
    let begin = args.begin.as_deref().map(|raw| parse_time("begin", raw)).transpose()?;
    let end = args.end.as_deref().map(|raw| parse_time("end", raw)).transpose()?;

    let database = if args.no_save {
        None
    } else if !config.analyze.database.as_os_str().is_empty() {
        Some(config.analyze.database.clone())
    } else {
        args.home.as_deref().map(paths::analysis_db_path)
    };

    let request = AnalyzeRequest {
        src,
        inspection: args.inspection.clone(),
        begin,
        end,
        top_n: args.top.unwrap_or(config.analyze.top_slow_queries),
        database,
        mode: if args.tolerant {
            ResolutionMode::Tolerant
        } else {
            config.analyze.default_mode
        },
    };

    let outcome = pipeline::analyze(request).map_err(|e| CliError::Runtime(e.to_string()))?;
    log_analysis(&config, &outcome);

    match output_mode(cli) {
        OutputMode::Human => print_analysis_human(cli, &outcome),
        OutputMode::Json => {
            let tasks: Vec<Value> = outcome
                .tasks
                .iter()
                .map(|(name, task)| {
                    let mut value = serde_json::to_value(task).unwrap_or(Value::Null);
                    if let Value::Object(map) = &mut value {
                        map.insert("task".to_string(), Value::String(name.clone()));
                    }
                    value
                })
                .collect();
            let payload = json!({
                "command": "analyze",
                "complete": outcome.is_complete(),
                "failures": outcome.failures(),
                "report": outcome.report,
                "tasks": tasks,
            });
            write_json_line(&payload)?;
        }
    }

    if outcome.report.is_none() {
        return Err(CliError::Runtime("analysis produced no report".to_string()));
    }
    if outcome.failures() > 0 {
        return Err(CliError::Partial(format!(
            "{} analysis tasks failed",
            outcome.failures()
        )));
    }
    Ok(())
}

fn log_analysis(config: &Config, outcome: &AnalysisOutcome) {
    let Ok((logger, join)) = start_logger(config) else {
        return;
    };
    for (task, result) in &outcome.tasks {
        if let TaskOutcome::Failed { error } = result {
            logger.send(ActivityEvent::TaskFailed {
                task: task.clone(),
                code: error_code(error).to_string(),
                message: error.clone(),
            });
        }
    }
    logger.send(ActivityEvent::AnalysisCompleted {
        inspection: outcome
            .report
            .as_ref()
            .map_or_else(String::new, |r| r.inspection.clone()),
        tasks: outcome.tasks.len(),
        failures: outcome.failures(),
    });
    logger.shutdown();
    let _ = join.join();
}

/// `DIAG-xxxx` from a rendered error message.
fn error_code(message: &str) -> &str {
    message
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .map_or("DIAG-3900", |(code, _)| code)
}

fn print_analysis_human(cli: &Cli, outcome: &AnalysisOutcome) {
    if let Some(report) = &outcome.report {
        println!("{} {}", "Inspection".bold(), report.inspection);
        println!("  window:  {} .. {}", report.begin.to_rfc3339(), report.end.to_rfc3339());
        if let Some(name) = &report.cluster_name {
            println!("  cluster: {name} ({} hosts)", report.hosts);
        }
        match &report.slow_queries {
            Some(summary) => {
                println!(
                    "  slow queries: {} (max {:.3}s, min {:.3}s, avg {:.3}s)",
                    summary.count, summary.query_time_max, summary.query_time_min, summary.query_time_avg
                );
                for (rank, entry) in summary.top.iter().enumerate() {
                    println!(
                        "    {:>2}. {:>9.3}s  {}  {}",
                        rank + 1,
                        entry.value(),
                        entry.tag("instance").unwrap_or("-"),
                        entry.tag("digest").unwrap_or("-")
                    );
                }
            }
            None => println!("  slow queries: {}", "unavailable".yellow()),
        }
        if !report.level_counts.is_empty() {
            println!("  log levels:");
            for row in &report.level_counts {
                println!(
                    "    {:<16} {:<10} {:<6} {:<6} {:>8}",
                    row.host,
                    row.component,
                    row.port,
                    row.level.as_str(),
                    row.count
                );
            }
        }
        if let Some(saved) = report.saved_slow_logs {
            println!("  saved {saved} slow-log rows");
        }
        if let Some(saved) = report.saved_level_counts {
            println!("  saved {saved} level-count rows");
        }
    }

    if cli.verbose || !outcome.is_complete() {
        println!("  tasks:");
        for (name, task) in &outcome.tasks {
            match task {
                TaskOutcome::Ran => println!("    {:<24} {}", name, "ok".green()),
                TaskOutcome::Declined { missing } => {
                    println!("    {:<24} {} (missing {})", name, "skipped".yellow(), missing.join(", "));
                }
                TaskOutcome::Failed { error } => println!("    {:<24} {} {error}", name, "failed".red()),
            }
        }
    }
}

// ──────────────────── output ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("CDIAG_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_before_and_after_subcommand() {
        let before = Cli::try_parse_from([
            "cdiag",
            "--config",
            "/tmp/cdiag.toml",
            "--json",
            "--no-color",
            "-v",
            "sync",
            "--once",
        ]);
        assert!(before.is_ok());

        let after = Cli::try_parse_from(["cdiag", "sync", "--once", "--json", "--no-color", "-q"]);
        assert!(after.is_ok());
    }

    #[test]
    fn parses_every_subcommand() {
        let cases = [
            vec!["cdiag", "sync", "--topo", "/t", "--target", "/m", "--interval", "30", "--bwlimit", "500"],
            vec!["cdiag", "sync", "--gc"],
            vec!["cdiag", "split", "--src", "/a", "--dst", "/b", "--begin", "2026-01-01T00:00:00Z", "--end", "2026-01-02T00:00:00Z"],
            vec!["cdiag", "search", "--dir", "/a", "--begin", "x", "--end", "y", "--level", "warn", "--contains", "region", "--limit", "5"],
            vec!["cdiag", "analyze", "--src", "/a"],
            vec!["cdiag", "analyze", "--home", "/h", "--inspection", "i1", "--tolerant", "--top", "3"],
        ];
        for case in cases {
            let parsed = Cli::try_parse_from(case.clone());
            assert!(parsed.is_ok(), "failed to parse case: {case:?}");
        }
    }

    #[test]
    fn analyze_needs_a_source() {
        assert!(Cli::try_parse_from(["cdiag", "analyze"]).is_err());
        assert!(Cli::try_parse_from(["cdiag", "analyze", "--home", "/h"]).is_err());
    }

    #[test]
    fn split_requires_window() {
        assert!(Cli::try_parse_from(["cdiag", "split", "--src", "/a", "--dst", "/b"]).is_err());
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["cdiag", "-v", "-q", "sync"]).is_err());
    }

    #[test]
    fn completions_support_bash_zsh_and_fish() {
        for shell in ["bash", "zsh", "fish"] {
            let parsed = Cli::try_parse_from(["cdiag", "completions", shell]);
            assert!(parsed.is_ok(), "failed shell parse for {shell}");
        }
    }

    #[test]
    fn output_mode_resolution_honors_precedence() {
        assert_eq!(resolve_output_mode(true, Some("human"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("json"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("human"), false), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, Some("auto"), true), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, None, false), OutputMode::Json);
    }

    #[test]
    fn window_must_be_ordered() {
        assert!(parse_window("2026-01-02T00:00:00Z", "2026-01-01T00:00:00Z").is_err());
        assert!(parse_window("2026/01/01 00:00:00", "2026/01/01 00:00:01").is_ok());
        assert!(matches!(parse_window("soon", "later"), Err(CliError::User(_))));
    }

    #[test]
    fn error_code_is_read_from_message_prefix() {
        assert_eq!(error_code("[DIAG-2001] malformed x"), "DIAG-2001");
        assert_eq!(error_code("boom"), "DIAG-3900");
    }

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(CliError::User(String::new()).exit_code(), 1);
        assert_eq!(CliError::Runtime(String::new()).exit_code(), 2);
        assert_eq!(CliError::Partial(String::new()).exit_code(), 4);
    }

    #[test]
    fn help_lists_command_surface() {
        let mut cmd = Cli::command();
        let help = cmd.render_long_help().to_string();
        for keyword in ["sync", "split", "search", "analyze", "completions"] {
            assert!(help.contains(keyword), "help output missing command: {keyword}");
        }
    }
}
