// SPDX-License-Identifier: PMPL-1.0-or-later

//! Log post-processing: turn raw per-run round logs into CSV tables.
//!
//! Walks a result tree for run directories (a `round_logs.jsonl` or a
//! `run_summary.json`), groups runs by the experiment directory that holds
//! them and writes one `rounds.csv` per experiment plus a `summary.csv` with
//! one row per run. Tables left by an earlier pass are removed first, so the
//! output depends only on the input tree.

pub mod csv;
pub mod flatten;

pub use flatten::{flatten_record, read_round_log, FlatRecord, RoundLog};

use crate::experiment::sanitize_component;
use anyhow::{bail, Context, Result};
use colored::*;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const ROUND_LOG_FILE: &str = "round_logs.jsonl";
pub const ROUND_RESULTS_FILE: &str = "round_results.csv";
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const PARAMS_FILE: &str = "experiment_params.json";
pub const SUMMARY_CSV: &str = "summary.csv";
pub const ROUNDS_CSV: &str = "rounds.csv";

const ROUND_LEADING: &[&str] = &["run", "seed", "round_number"];
const SUMMARY_LEADING: &[&str] = &[
    "experiment_id",
    "run",
    "seed",
    "status",
    "rounds",
    "malformed_lines",
];

/// Configuration for a post-processing pass
pub struct ProcessConfig {
    /// Raw log tree written by attack runs
    pub result_path: PathBuf,
    /// Where CSV tables are written
    pub output_dir: PathBuf,
}

/// What a post-processing pass produced
#[derive(Debug, Clone, Default)]
pub struct ProcessReport {
    pub experiments: usize,
    pub runs: usize,
    pub rounds: usize,
    pub malformed_lines: usize,
    pub skipped_logs: Vec<PathBuf>,
    pub files_written: Vec<PathBuf>,
}

#[derive(Debug)]
struct RunLog {
    name: String,
    index: Option<u64>,
    seed: String,
    status: String,
    log: RoundLog,
}

impl RunLog {
    fn run_label(&self) -> String {
        self.index
            .map(|index| index.to_string())
            .unwrap_or_else(|| self.name.clone())
    }
}

#[derive(Debug, Default)]
struct ExperimentLogs {
    params: FlatRecord,
    runs: Vec<RunLog>,
}

/// Convert a single run's round log into `round_results.csv` next to it.
/// Returns the parsed log; nothing is written when it holds no rounds.
pub fn convert_round_log(log_path: &Path, csv_path: &Path) -> Result<RoundLog> {
    let log = read_round_log(log_path)?;
    if !log.rows.is_empty() {
        csv::write_records(csv_path, &log.rows, &["round_number"])?;
    }
    Ok(log)
}

pub fn run(config: &ProcessConfig) -> Result<ProcessReport> {
    let root = &config.result_path;
    if !root.exists() {
        bail!("result path not found: {}", root.display());
    }
    if !root.is_dir() {
        bail!("result path is not a directory: {}", root.display());
    }
    fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating output directory {}", config.output_dir.display()))?;
    clear_previous_outputs(&config.output_dir)?;

    let mut report = ProcessReport::default();
    let experiments = collect_experiments(root, &mut report)?;

    let mut summary_rows = Vec::new();
    for (experiment_id, experiment) in &experiments {
        let mut round_rows = Vec::new();
        for run in &experiment.runs {
            report.runs += 1;
            report.rounds += run.log.rows.len();
            report.malformed_lines += run.log.malformed_lines;

            for round in &run.log.rows {
                let mut row = round.clone();
                for key in ROUND_CONTEXT_KEYS {
                    set_aside(&mut row, key);
                }
                row.insert("run".to_string(), run.run_label());
                row.insert("seed".to_string(), run.seed.clone());
                round_rows.push(row);
            }
            summary_rows.push(summary_row(experiment_id, experiment, run));
        }

        if round_rows.is_empty() {
            continue;
        }
        let rounds_path = experiment_output_dir(&config.output_dir, experiment_id).join(ROUNDS_CSV);
        csv::write_records(&rounds_path, &round_rows, ROUND_LEADING)?;
        debug!(path = %rounds_path.display(), rows = round_rows.len(), "wrote rounds table");
        report.files_written.push(rounds_path);
    }
    report.experiments = experiments.len();

    if !summary_rows.is_empty() {
        let summary_path = config.output_dir.join(SUMMARY_CSV);
        csv::write_records(&summary_path, &summary_rows, SUMMARY_LEADING)?;
        report.files_written.push(summary_path);
    }

    info!(
        experiments = report.experiments,
        runs = report.runs,
        rounds = report.rounds,
        "post-processing finished"
    );
    Ok(report)
}

/// Columns the harness adds to every round row
const ROUND_CONTEXT_KEYS: [&str; 2] = ["run", "seed"];

/// Move a backend field out of the way of a harness column: `seed` becomes
/// `round_seed` (or `round_round_seed`, ...) so neither value is lost.
fn set_aside(row: &mut FlatRecord, key: &str) {
    let Some(value) = row.remove(key) else {
        return;
    };
    let mut name = format!("round_{}", key);
    while row.contains_key(&name) {
        name = format!("round_{}", name);
    }
    row.insert(name, value);
}

/// Tables from an earlier pass must not outlive the runs they came from.
/// Only files this stage writes are removed, along with directories that
/// end up empty because of it.
fn clear_previous_outputs(output_dir: &Path) -> Result<()> {
    let mut stale = Vec::new();
    for entry in WalkDir::new(output_dir).min_depth(1) {
        let entry = entry.with_context(|| format!("walking {}", output_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_summary = entry.depth() == 1 && entry.file_name() == SUMMARY_CSV;
        let is_rounds = entry.depth() > 1 && entry.file_name() == ROUNDS_CSV;
        if is_summary || is_rounds {
            stale.push(entry.into_path());
        }
    }

    for path in &stale {
        fs::remove_file(path).with_context(|| format!("removing stale {}", path.display()))?;
        debug!(path = %path.display(), "removed table from earlier pass");
        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == output_dir || fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
    }
    Ok(())
}

fn collect_experiments(
    root: &Path,
    report: &mut ProcessReport,
) -> Result<BTreeMap<String, ExperimentLogs>> {
    // A run is any directory holding a round log or a run summary; runs
    // that died before their first round still count.
    let mut run_dirs = BTreeSet::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        let name = entry.file_name();
        if !entry.file_type().is_file() || (name != ROUND_LOG_FILE && name != RUN_SUMMARY_FILE) {
            continue;
        }
        if let Some(run_dir) = entry.path().parent() {
            run_dirs.insert(run_dir.to_path_buf());
        }
    }

    let mut experiments: BTreeMap<String, ExperimentLogs> = BTreeMap::new();
    for run_dir in &run_dirs {
        let log_path = run_dir.join(ROUND_LOG_FILE);
        let log = if log_path.is_file() {
            match read_round_log(&log_path) {
                Ok(log) => log,
                Err(err) => {
                    warn!(path = %log_path.display(), "skipping unreadable round log: {:#}", err);
                    report.skipped_logs.push(log_path);
                    continue;
                }
            }
        } else {
            RoundLog::default()
        };

        let experiment_dir = run_dir.parent().unwrap_or(root);
        let experiment_id = experiment_id_for(root, experiment_dir);
        let experiment = experiments.entry(experiment_id).or_insert_with(|| ExperimentLogs {
            params: load_params(experiment_dir),
            runs: Vec::new(),
        });

        let name = run_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let index = name
            .strip_prefix("run_")
            .and_then(|suffix| suffix.parse::<u64>().ok());
        let (seed, status) = load_run_status(run_dir);
        experiment.runs.push(RunLog {
            name,
            index,
            seed,
            status,
            log,
        });
    }

    for experiment in experiments.values_mut() {
        experiment
            .runs
            .sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.name.cmp(&b.name)));
    }
    Ok(experiments)
}

/// Experiment id is the experiment directory relative to the result root,
/// `/`-separated regardless of platform.
fn experiment_id_for(root: &Path, experiment_dir: &Path) -> String {
    let relative = experiment_dir.strip_prefix(root).unwrap_or(experiment_dir);
    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        root.file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "experiment".to_string())
    } else {
        parts.join("/")
    }
}

fn experiment_output_dir(output_dir: &Path, experiment_id: &str) -> PathBuf {
    experiment_id
        .split('/')
        .fold(output_dir.to_path_buf(), |dir, part| {
            dir.join(sanitize_component(part))
        })
}

/// Flattened experiment parameters, minus harness plumbing sections.
fn load_params(experiment_dir: &Path) -> FlatRecord {
    let path = experiment_dir.join(PARAMS_FILE);
    let Ok(content) = fs::read_to_string(&path) else {
        return FlatRecord::new();
    };
    match serde_json::from_str::<Value>(&content) {
        Ok(value) => {
            let mut config = value.get("full_config").cloned().unwrap_or(Value::Null);
            if let Value::Object(map) = &mut config {
                map.remove("runner");
                map.remove("output");
                map.remove("experiment_id");
            }
            match config {
                Value::Object(_) => flatten_record(&config),
                _ => FlatRecord::new(),
            }
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "ignoring unreadable experiment params");
            FlatRecord::new()
        }
    }
}

fn load_run_status(run_dir: &Path) -> (String, String) {
    let path = run_dir.join(RUN_SUMMARY_FILE);
    let summary = fs::read_to_string(&path)
        .ok()
        .and_then(|content| serde_json::from_str::<Value>(&content).ok());
    match summary {
        Some(value) => {
            let seed = value
                .get("seed")
                .map(flatten::render_cell)
                .unwrap_or_default();
            let status = value
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            (seed, status)
        }
        None => (String::new(), "unknown".to_string()),
    }
}

fn summary_row(experiment_id: &str, experiment: &ExperimentLogs, run: &RunLog) -> FlatRecord {
    let mut row = FlatRecord::new();
    row.insert("experiment_id".to_string(), experiment_id.to_string());
    row.insert("run".to_string(), run.run_label());
    row.insert("seed".to_string(), run.seed.clone());
    row.insert("status".to_string(), run.status.clone());
    row.insert("rounds".to_string(), run.log.rows.len().to_string());
    row.insert(
        "malformed_lines".to_string(),
        run.log.malformed_lines.to_string(),
    );
    for (key, value) in &experiment.params {
        row.insert(format!("param_{}", key), value.clone());
    }
    if let Some(last) = run.log.last() {
        for (key, value) in last {
            row.insert(format!("final_{}", key), value.clone());
        }
    }
    row
}

/// Print a short account of the pass to the terminal
pub fn print_summary(report: &ProcessReport, output_dir: &Path) {
    println!("\n{}", "=== LOG POST-PROCESSING ===".bold().cyan());
    println!(
        "  Experiments: {}  |  Runs: {}  |  Rounds: {}",
        report.experiments, report.runs, report.rounds
    );
    if report.malformed_lines > 0 {
        println!(
            "  {} malformed round records skipped",
            report.malformed_lines.to_string().yellow()
        );
    }
    for path in &report.skipped_logs {
        println!("  {} {}", "unreadable:".red(), path.display());
    }
    if report.files_written.is_empty() {
        println!("  No round logs found; {} left empty.", output_dir.display());
    } else {
        println!("  Wrote {} CSV files to {}", report.files_written.len(), output_dir.display());
    }
    println!();
}
