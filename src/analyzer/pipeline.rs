//! Task wiring behind `cdiag analyze`.
//!
//! ```text
//! ParseArgs ─┬─ LoadTopology ─────────────────────────────┐
//!            ├─ CollectSlowQueries ─┬─ SummarizeSlowQueries┤
//!            │                      └─ SaveSlowQueries ────┤
//!            └─ SummarizeLogLevels ─── SaveLevelCounts ────┴─ Report
//! ```
//!
//! `Report` is tolerant: it always runs and records whatever upstream
//! tasks managed to produce.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::analyzer::engine::{AnalysisTask, Engine, ResolutionMode, RunReport, TaskOutcome, Wiring};
use crate::analyzer::slow_query::SlowQueryRecord;
use crate::core::errors::{DiagError, Result};
use crate::logs::descriptor::{FileDescriptor, resolve_dir};
use crate::logs::item::{Level, LogKind, SLOW_QUERY_FILE_NAME, Timestamp};
use crate::logs::iterator::{FileIterator, LogStream};
use crate::logs::merge::MergeSequence;
use crate::logs::parser::{ParserSet, SlowQueryParser};
use crate::logs::timefmt;
use crate::syncer::topology::ClusterTopology;
use crate::values::float_series::FloatSeries;
use crate::values::tagged::TaggedFloat;

#[cfg(feature = "sqlite")]
use crate::analyzer::sink::{AnalysisSink, LevelCountRow, SlowLogRow};
#[cfg(feature = "sqlite")]
use parking_lot::Mutex;

/// Optional per-inspection argument file inside the source directory.
pub const ARGS_FILE: &str = "args.json";
pub const TOPOLOGY_FILE: &str = "topology.json";
/// Collected logs live under this subdirectory of the source.
pub const LOG_DIR: &str = "log";
pub const DEFAULT_TOP_N: usize = 10;

// ──────────────────── wiring ────────────────────

/// What the caller asks for. Fields left empty are filled from
/// `<src>/args.json` when present.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeRequest {
    pub src: PathBuf,
    pub inspection: Option<String>,
    pub begin: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub top_n: usize,
    /// Persist results here when set.
    pub database: Option<PathBuf>,
    pub mode: ResolutionMode,
}

#[derive(Debug, Default, Deserialize)]
struct ArgsFile {
    begin: Option<String>,
    end: Option<String>,
    inspection_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisArgs {
    pub src: PathBuf,
    pub inspection: String,
    pub begin: Timestamp,
    pub end: Timestamp,
    pub top_n: usize,
}

impl AnalysisArgs {
    pub fn log_dir(&self) -> PathBuf {
        self.src.join(LOG_DIR)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowQueryEntry {
    pub host: String,
    pub port: String,
    /// `host:port` of the TiDB that wrote the record.
    pub instance: String,
    pub record: SlowQueryRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelCount {
    pub host: String,
    pub component: String,
    pub port: String,
    pub level: Level,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowQuerySummary {
    pub count: usize,
    pub query_time_max: f64,
    pub query_time_min: f64,
    pub query_time_avg: f64,
    /// Longest queries first, tagged with instance and digest.
    pub top: Vec<TaggedFloat>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub inspection: String,
    pub begin: Timestamp,
    pub end: Timestamp,
    pub cluster_name: Option<String>,
    pub hosts: usize,
    pub slow_queries: Option<SlowQuerySummary>,
    pub level_counts: Vec<LevelCount>,
    pub saved_slow_logs: Option<usize>,
    pub saved_level_counts: Option<usize>,
}

/// Values that flow between analysis tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Args(AnalysisArgs),
    Topology(ClusterTopology),
    SlowQueries(Vec<SlowQueryEntry>),
    LevelCounts(Vec<LevelCount>),
    SlowQuerySummary(SlowQuerySummary),
    SavedSlowLogs(usize),
    SavedLevelCounts(usize),
    Report(AnalysisReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Args,
    Topology,
    SlowQueries,
    LevelCounts,
    SlowQuerySummary,
    SavedSlowLogs,
    SavedLevelCounts,
    Report,
}

impl Wiring for Value {
    type Slot = Slot;

    fn slot(&self) -> Slot {
        match self {
            Self::Args(_) => Slot::Args,
            Self::Topology(_) => Slot::Topology,
            Self::SlowQueries(_) => Slot::SlowQueries,
            Self::LevelCounts(_) => Slot::LevelCounts,
            Self::SlowQuerySummary(_) => Slot::SlowQuerySummary,
            Self::SavedSlowLogs(_) => Slot::SavedSlowLogs,
            Self::SavedLevelCounts(_) => Slot::SavedLevelCounts,
            Self::Report(_) => Slot::Report,
        }
    }
}

type Inputs = Vec<Option<Arc<Value>>>;
type Outputs = Result<Vec<Option<Value>>>;

fn shape_error(task: &str) -> DiagError {
    DiagError::InvalidTask {
        task: task.to_string(),
        reason: "input carries an unexpected value".to_string(),
    }
}

fn args_input<'a>(task: &str, input: Option<&'a Arc<Value>>) -> Result<&'a AnalysisArgs> {
    match input.map(AsRef::as_ref) {
        Some(Value::Args(args)) => Ok(args),
        _ => Err(shape_error(task)),
    }
}

// ──────────────────── tasks ────────────────────

pub struct ParseArgs {
    request: AnalyzeRequest,
}

impl ParseArgs {
    pub fn new(request: AnalyzeRequest) -> Self {
        Self { request }
    }

    fn resolve(&self) -> Result<AnalysisArgs> {
        let file = self.request.src.join(ARGS_FILE);
        let stored = match fs::read_to_string(&file) {
            Ok(raw) => serde_json::from_str::<ArgsFile>(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ArgsFile::default(),
            Err(e) => return Err(DiagError::io(&file, e)),
        };

        let pick = |given: Option<Timestamp>, stored: Option<&String>, name: &'static str| {
            match (given, stored) {
                (Some(t), _) => Ok(t),
                (None, Some(raw)) => timefmt::parse_user_time(raw),
                (None, None) => Err(DiagError::malformed(
                    "analysis arguments",
                    format!("no {name} time given and none in {}", file.display()),
                )),
            }
        };
        let begin = pick(self.request.begin, stored.begin.as_ref(), "begin")?;
        let end = pick(self.request.end, stored.end.as_ref(), "end")?;
        if begin >= end {
            return Err(DiagError::malformed(
                "analysis arguments",
                format!("begin {begin} is not before end {end}"),
            ));
        }

        let inspection = self
            .request
            .inspection
            .clone()
            .or(stored.inspection_id)
            .or_else(|| {
                self.request
                    .src
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_default();

        Ok(AnalysisArgs {
            src: self.request.src.clone(),
            inspection,
            begin,
            end,
            top_n: if self.request.top_n == 0 {
                DEFAULT_TOP_N
            } else {
                self.request.top_n
            },
        })
    }
}

impl AnalysisTask<Value> for ParseArgs {
    fn name(&self) -> &str {
        "parse_args"
    }

    fn inputs(&self) -> Vec<Slot> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Slot> {
        vec![Slot::Args]
    }

    fn run(&mut self, _inputs: Inputs) -> Outputs {
        Ok(vec![Some(Value::Args(self.resolve()?))])
    }
}

/// Reads `<src>/topology.json`; a missing file leaves the slot empty.
pub struct LoadTopology;

impl AnalysisTask<Value> for LoadTopology {
    fn name(&self) -> &str {
        "load_topology"
    }

    fn inputs(&self) -> Vec<Slot> {
        vec![Slot::Args]
    }

    fn outputs(&self) -> Vec<Slot> {
        vec![Slot::Topology]
    }

    fn run(&mut self, inputs: Inputs) -> Outputs {
        let args = args_input(self.name(), inputs[0].as_ref())?;
        let path = args.src.join(TOPOLOGY_FILE);
        if !path.is_file() {
            return Ok(vec![None]);
        }
        Ok(vec![Some(Value::Topology(ClusterTopology::load(&path)?))])
    }
}

fn log_descriptors(args: &AnalysisArgs) -> Result<Vec<FileDescriptor>> {
    let dir = args.log_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    resolve_dir(&dir)
}

/// Parses every slow-query record in the window. Records that do not parse
/// are logged and skipped.
pub struct CollectSlowQueries;

impl CollectSlowQueries {
    fn collect_file(desc: &FileDescriptor, args: &AnalysisArgs, out: &mut Vec<SlowQueryEntry>) -> Result<()> {
        let (_, port) = desc.parse_folder_name()?;
        let instance = format!("{}:{port}", desc.host);
        let parsers = ParserSet::new(vec![Box::new(SlowQueryParser)]);
        let mut iter = FileIterator::with_parsers(desc, args.begin, args.end, parsers)?;
        while let Some(item) = iter.next_item()? {
            match SlowQueryRecord::parse(&item.content) {
                Ok(record) => out.push(SlowQueryEntry {
                    host: desc.host.clone(),
                    port: port.clone(),
                    instance: instance.clone(),
                    record,
                }),
                Err(e) => eprintln!(
                    "[DIAG-TASK] skipping slow query record in {}: {e}",
                    desc.path().display()
                ),
            }
        }
        iter.close();
        Ok(())
    }
}

impl AnalysisTask<Value> for CollectSlowQueries {
    fn name(&self) -> &str {
        "collect_slow_queries"
    }

    fn inputs(&self) -> Vec<Slot> {
        vec![Slot::Args]
    }

    fn outputs(&self) -> Vec<Slot> {
        vec![Slot::SlowQueries]
    }

    fn run(&mut self, inputs: Inputs) -> Outputs {
        let args = args_input(self.name(), inputs[0].as_ref())?;
        let mut entries = Vec::new();
        for desc in log_descriptors(args)?
            .iter()
            .filter(|d| d.filename == SLOW_QUERY_FILE_NAME)
        {
            if let Err(e) = Self::collect_file(desc, args, &mut entries) {
                eprintln!("[DIAG-TASK] skipping {}: {e}", desc.path().display());
            }
        }
        Ok(vec![Some(Value::SlowQueries(entries))])
    }
}

/// Counts record levels per instance across all leveled logs.
pub struct SummarizeLogLevels;

impl AnalysisTask<Value> for SummarizeLogLevels {
    fn name(&self) -> &str {
        "summarize_log_levels"
    }

    fn inputs(&self) -> Vec<Slot> {
        vec![Slot::Args]
    }

    fn outputs(&self) -> Vec<Slot> {
        vec![Slot::LevelCounts]
    }

    fn run(&mut self, inputs: Inputs) -> Outputs {
        let args = args_input(self.name(), inputs[0].as_ref())?;
        let leveled: Vec<FileDescriptor> = log_descriptors(args)?
            .into_iter()
            .filter(|d| {
                d.parse_folder_name().is_ok_and(|(component, _)| {
                    !matches!(
                        LogKind::classify(&component, &d.filename),
                        LogKind::Invalid | LogKind::TiDBSlowQuery
                    )
                })
            })
            .collect();

        let mut counts: BTreeMap<(String, String, String, Level), u64> = BTreeMap::new();
        let mut merged = MergeSequence::open(&leveled, args.begin, args.end);
        while let Some(item) = merged.next_item()? {
            *counts
                .entry((item.host, item.component, item.port, item.level))
                .or_default() += 1;
        }
        merged.close();

        let rows = counts
            .into_iter()
            .map(|((host, component, port, level), count)| LevelCount {
                host,
                component,
                port,
                level,
                count,
            })
            .collect();
        Ok(vec![Some(Value::LevelCounts(rows))])
    }
}

pub struct SummarizeSlowQueries;

impl AnalysisTask<Value> for SummarizeSlowQueries {
    fn name(&self) -> &str {
        "summarize_slow_queries"
    }

    fn inputs(&self) -> Vec<Slot> {
        vec![Slot::Args, Slot::SlowQueries]
    }

    fn outputs(&self) -> Vec<Slot> {
        vec![Slot::SlowQuerySummary]
    }

    fn run(&mut self, inputs: Inputs) -> Outputs {
        let args = args_input(self.name(), inputs[0].as_ref())?;
        let Some(Value::SlowQueries(entries)) = inputs[1].as_deref() else {
            return Err(shape_error(self.name()));
        };

        let series: FloatSeries = entries.iter().map(|e| e.record.query_time).collect();
        let mut ranked: Vec<&SlowQueryEntry> = entries.iter().collect();
        ranked.sort_by(|a, b| b.record.query_time.total_cmp(&a.record.query_time));
        let top = ranked
            .into_iter()
            .take(args.top_n)
            .map(|e| {
                TaggedFloat::new(
                    e.record.query_time,
                    [("instance", e.instance.as_str()), ("digest", e.record.digest.as_str())],
                )
            })
            .collect();

        Ok(vec![Some(Value::SlowQuerySummary(SlowQuerySummary {
            count: series.len(),
            query_time_max: series.max(),
            query_time_min: series.min(),
            query_time_avg: series.avg(),
            top,
        }))])
    }
}

#[cfg(feature = "sqlite")]
pub type SharedSink = Arc<Mutex<AnalysisSink>>;

#[cfg(feature = "sqlite")]
pub struct SaveSlowQueries {
    sink: SharedSink,
}

#[cfg(feature = "sqlite")]
impl SaveSlowQueries {
    pub fn new(sink: SharedSink) -> Self {
        Self { sink }
    }
}

#[cfg(feature = "sqlite")]
impl AnalysisTask<Value> for SaveSlowQueries {
    fn name(&self) -> &str {
        "save_slow_queries"
    }

    fn inputs(&self) -> Vec<Slot> {
        vec![Slot::Args, Slot::SlowQueries]
    }

    fn outputs(&self) -> Vec<Slot> {
        vec![Slot::SavedSlowLogs]
    }

    fn run(&mut self, inputs: Inputs) -> Outputs {
        let args = args_input(self.name(), inputs[0].as_ref())?;
        let Some(Value::SlowQueries(entries)) = inputs[1].as_deref() else {
            return Err(shape_error(self.name()));
        };
        let rows: Vec<SlowLogRow> = entries
            .iter()
            .map(|e| SlowLogRow::from_record(&args.inspection, &e.instance, &e.host, &e.record))
            .collect();
        let written = self.sink.lock().replace_slow_logs(&args.inspection, &rows)?;
        Ok(vec![Some(Value::SavedSlowLogs(written))])
    }
}

#[cfg(feature = "sqlite")]
pub struct SaveLevelCounts {
    sink: SharedSink,
}

#[cfg(feature = "sqlite")]
impl SaveLevelCounts {
    pub fn new(sink: SharedSink) -> Self {
        Self { sink }
    }
}

#[cfg(feature = "sqlite")]
impl AnalysisTask<Value> for SaveLevelCounts {
    fn name(&self) -> &str {
        "save_level_counts"
    }

    fn inputs(&self) -> Vec<Slot> {
        vec![Slot::Args, Slot::LevelCounts]
    }

    fn outputs(&self) -> Vec<Slot> {
        vec![Slot::SavedLevelCounts]
    }

    fn run(&mut self, inputs: Inputs) -> Outputs {
        let args = args_input(self.name(), inputs[0].as_ref())?;
        let Some(Value::LevelCounts(counts)) = inputs[1].as_deref() else {
            return Err(shape_error(self.name()));
        };
        let rows: Vec<LevelCountRow> = counts
            .iter()
            .map(|c| LevelCountRow {
                inspection: args.inspection.clone(),
                host: c.host.clone(),
                component: c.component.clone(),
                port: c.port.clone(),
                level: c.level.as_str().to_ascii_lowercase(),
                count: i64::try_from(c.count).unwrap_or(i64::MAX),
            })
            .collect();
        let written = self.sink.lock().replace_level_counts(&args.inspection, &rows)?;
        Ok(vec![Some(Value::SavedLevelCounts(written))])
    }
}

/// Gathers whatever upstream produced. Only the arguments are required.
pub struct Report;

const REPORT_INPUTS: [Slot; 6] = [
    Slot::Args,
    Slot::Topology,
    Slot::SlowQuerySummary,
    Slot::LevelCounts,
    Slot::SavedSlowLogs,
    Slot::SavedLevelCounts,
];

impl AnalysisTask<Value> for Report {
    fn name(&self) -> &str {
        "report"
    }

    fn inputs(&self) -> Vec<Slot> {
        REPORT_INPUTS.to_vec()
    }

    fn outputs(&self) -> Vec<Slot> {
        vec![Slot::Report]
    }

    fn mode(&self) -> Option<ResolutionMode> {
        Some(ResolutionMode::Tolerant)
    }

    fn run(&mut self, inputs: Inputs) -> Outputs {
        let Some(Value::Args(args)) = inputs[0].as_deref() else {
            return Err(DiagError::InvalidTask {
                task: self.name().to_string(),
                reason: "analysis arguments unavailable".to_string(),
            });
        };
        let mut report = AnalysisReport {
            inspection: args.inspection.clone(),
            begin: args.begin,
            end: args.end,
            cluster_name: None,
            hosts: 0,
            slow_queries: None,
            level_counts: Vec::new(),
            saved_slow_logs: None,
            saved_level_counts: None,
        };
        for value in inputs.iter().skip(1).flatten() {
            match value.as_ref() {
                Value::Topology(topo) => {
                    report.cluster_name = Some(topo.cluster_name.clone());
                    report.hosts = topo.hosts.len();
                }
                Value::SlowQuerySummary(summary) => report.slow_queries = Some(summary.clone()),
                Value::LevelCounts(counts) => report.level_counts.clone_from(counts),
                Value::SavedSlowLogs(n) => report.saved_slow_logs = Some(*n),
                Value::SavedLevelCounts(n) => report.saved_level_counts = Some(*n),
                _ => return Err(shape_error(self.name())),
            }
        }
        Ok(vec![Some(Value::Report(report))])
    }
}

// ──────────────────── entry point ────────────────────

/// Register the standard task set.
pub fn build_engine(request: AnalyzeRequest) -> Result<Engine<Value>> {
    let mut engine = Engine::new(request.mode);
    #[cfg(feature = "sqlite")]
    let sink = match &request.database {
        Some(path) => Some(Arc::new(Mutex::new(AnalysisSink::open(path)?))),
        None => None,
    };

    engine.register(ParseArgs::new(request))?;
    engine.register(LoadTopology)?;
    engine.register(CollectSlowQueries)?;
    engine.register(SummarizeLogLevels)?;
    engine.register(SummarizeSlowQueries)?;
    #[cfg(feature = "sqlite")]
    if let Some(sink) = sink {
        engine.register(SaveSlowQueries::new(Arc::clone(&sink)))?;
        engine.register(SaveLevelCounts::new(sink))?;
    }
    engine.register(Report)?;
    Ok(engine)
}

/// Outcome of one analysis run.
#[derive(Debug)]
pub struct AnalysisOutcome {
    pub report: Option<AnalysisReport>,
    pub tasks: Vec<(String, TaskOutcome)>,
}

impl AnalysisOutcome {
    fn from_run(run: &RunReport<Value>) -> Self {
        let report = match run.value(Slot::Report).map(AsRef::as_ref) {
            Some(Value::Report(report)) => Some(report.clone()),
            _ => None,
        };
        Self {
            report,
            tasks: run.outcomes.clone(),
        }
    }

    pub fn failures(&self) -> usize {
        self.tasks
            .iter()
            .filter(|(_, o)| matches!(o, TaskOutcome::Failed { .. }))
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.report.is_some() && self.tasks.iter().all(|(_, o)| *o == TaskOutcome::Ran)
    }
}

pub fn analyze(request: AnalyzeRequest) -> Result<AnalysisOutcome> {
    let mut engine = build_engine(request)?;
    Ok(AnalysisOutcome::from_run(&engine.run()))
}

/// Source directory layout helper for callers that only have a home dir.
pub fn inspection_dir(home: &Path, inspection: &str) -> PathBuf {
    home.join("inspection").join(inspection)
}
