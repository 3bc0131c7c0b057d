// SPDX-License-Identifier: PMPL-1.0-or-later

//! Batch: run every config under a directory through the attack runner
//!
//! Walks the config directory for `*.yaml` / `*.yml` files and launches one
//! `attack` process per config on a fixed-size worker pool, so no more than
//! `parallel` attack processes are alive at once. A failing config never
//! stops the batch; every config gets a row in the report, in path order.

use crate::attack::ENV_TIME_LIMIT_MS;
use crate::process::{self, Invocation};
use crate::types::RunStatus;
use anyhow::{bail, Context, Result};
use colored::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const DEFAULT_PARALLEL: usize = 20;
pub const BATCH_REPORT_FILE: &str = "batch_report.json";
/// Extra time an attack process gets to stop its backend after the limit
/// handed to it, before the batch kills its process group.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// How each config is handed to the single-attack runner
#[derive(Debug, Clone)]
pub struct RunnerCommand {
    pub program: PathBuf,
    /// Arguments placed before the config path
    pub args: Vec<String>,
}

impl RunnerCommand {
    /// This very binary's `attack` subcommand
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("locating the market-attack binary")?;
        Ok(Self {
            program,
            args: vec!["attack".to_string()],
        })
    }

    fn invocation(&self, config: &Path, timeout: Option<Duration>) -> Invocation {
        let mut args = self.args.clone();
        args.push(config.to_string_lossy().to_string());
        let invocation = Invocation::new(self.program.to_string_lossy().to_string(), args);
        match timeout {
            Some(limit) => invocation.env(ENV_TIME_LIMIT_MS, limit.as_millis().to_string()),
            None => invocation,
        }
    }
}

/// Configuration for a batch run
pub struct BatchConfig {
    /// Directory holding experiment configs
    pub config_dir: PathBuf,
    /// Upper bound on concurrently running attack processes
    pub parallel: usize,
    /// Per-config wall clock limit
    pub timeout: Option<Duration>,
    /// Where per-config logs and the batch report go
    pub log_dir: PathBuf,
    pub runner: RunnerCommand,
}

/// Result of running one config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResult {
    pub config_path: PathBuf,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub duration_secs: f64,
    pub log_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Complete batch report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub created_at: String,
    pub config_dir: PathBuf,
    pub parallel: usize,
    pub configs_found: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<ConfigResult>,
}

impl BatchReport {
    pub fn ensure_success(&self) -> Result<()> {
        if self.failed > 0 {
            bail!(
                "{} of {} configs did not complete successfully",
                self.failed,
                self.configs_found
            );
        }
        Ok(())
    }
}

/// Find all experiment configs under the given directory, sorted by path
pub fn discover_configs(directory: &Path) -> Result<Vec<PathBuf>> {
    if !directory.is_dir() {
        bail!("Not a directory: {}", directory.display());
    }

    let mut configs = Vec::new();
    for entry in WalkDir::new(directory).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", directory.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_yaml = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);
        if is_yaml {
            configs.push(entry.into_path());
        }
    }

    configs.sort();
    Ok(configs)
}

/// `configs/FMNIST/a.yaml` under `configs` becomes `FMNIST__a.log`
fn log_name(config_dir: &Path, config: &Path) -> String {
    let relative = config.strip_prefix(config_dir).unwrap_or(config);
    let parts: Vec<String> = relative
        .with_extension("")
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    format!("{}.log", parts.join("__"))
}

/// Run every config in the directory
pub fn run(config: &BatchConfig) -> Result<BatchReport> {
    if config.parallel == 0 {
        bail!("--parallel must be at least 1");
    }
    let configs = discover_configs(&config.config_dir)?;
    fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("creating log directory {}", config.log_dir.display()))?;

    info!(
        configs = configs.len(),
        parallel = config.parallel,
        logs = %config.log_dir.display(),
        "starting batch"
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.parallel)
        .thread_name(|index| format!("batch-worker-{}", index))
        .build()
        .context("building batch worker pool")?;

    // `collect` on an indexed parallel iterator keeps input order
    let results: Vec<ConfigResult> = pool.install(|| {
        configs
            .par_iter()
            .map(|path| run_one(config, path))
            .collect()
    });

    let succeeded = results.iter().filter(|r| r.status.is_success()).count();
    let report = BatchReport {
        created_at: chrono::Utc::now().to_rfc3339(),
        config_dir: config.config_dir.clone(),
        parallel: config.parallel,
        configs_found: configs.len(),
        succeeded,
        failed: results.len() - succeeded,
        results,
    };

    write_report(&report, &config.log_dir.join(BATCH_REPORT_FILE))?;
    Ok(report)
}

fn run_one(config: &BatchConfig, path: &Path) -> ConfigResult {
    let log_path = config.log_dir.join(log_name(&config.config_dir, path));
    let invocation = config.runner.invocation(path, config.timeout);
    debug!(config = %path.display(), command = %invocation.display(), "launching");

    let hard_limit = config.timeout.map(|limit| limit + KILL_GRACE);
    match process::run_logged(&invocation, &log_path, hard_limit) {
        Ok(outcome) => {
            // An attack that stopped itself at the limit exits with a plain failure
            let over_limit = config
                .timeout
                .is_some_and(|limit| !outcome.success && outcome.duration >= limit);
            let status = if outcome.timed_out || over_limit {
                RunStatus::TimedOut
            } else if outcome.success {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            };
            if status.is_success() {
                info!(config = %path.display(), secs = outcome.duration.as_secs_f64(), "config done");
            } else {
                warn!(
                    config = %path.display(),
                    status = status.label(),
                    exit_code = ?outcome.exit_code,
                    log = %log_path.display(),
                    "config did not succeed"
                );
            }
            ConfigResult {
                config_path: path.to_path_buf(),
                status,
                exit_code: outcome.exit_code,
                duration_secs: outcome.duration.as_secs_f64(),
                log_path,
                error: None,
            }
        }
        Err(err) => {
            warn!(config = %path.display(), "could not launch attack runner: {:#}", err);
            ConfigResult {
                config_path: path.to_path_buf(),
                status: RunStatus::SpawnError,
                exit_code: None,
                duration_secs: 0.0,
                log_path,
                error: Some(format!("{:#}", err)),
            }
        }
    }
}

/// Print a summary table to the terminal
pub fn print_summary(report: &BatchReport) {
    println!("\n{}", "=== BATCH SUMMARY ===".bold().cyan());
    println!(
        "Config dir: {}  |  Configs: {}  |  Parallel: {}",
        report.config_dir.display(),
        report.configs_found,
        report.parallel
    );
    println!(
        "Succeeded: {}  |  Did not succeed: {}",
        report.succeeded.to_string().green(),
        if report.failed > 0 {
            report.failed.to_string().red()
        } else {
            report.failed.to_string().normal()
        }
    );
    println!();

    if report.results.is_empty() {
        println!("  No configs found.");
        return;
    }

    println!("  {:<60} {:>12} {:>6} {:>10}", "Config", "Status", "Exit", "Seconds");
    println!("  {}", "-".repeat(91));
    for result in &report.results {
        let name = result
            .config_path
            .strip_prefix(&report.config_dir)
            .unwrap_or(&result.config_path)
            .display()
            .to_string();
        let exit = result
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<60} {:>12} {:>6} {:>10.1}",
            name,
            result.status.label(),
            exit,
            result.duration_secs
        );
    }
    println!();
}

/// Write batch report as JSON
pub fn write_report(report: &BatchReport, path: &Path) -> Result<()> {
    crate::storage::write_json(path, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_names_flatten_relative_paths() {
        let dir = Path::new("configs");
        assert_eq!(
            log_name(dir, Path::new("configs/FMNIST/martfl/a.yaml")),
            "FMNIST__martfl__a.log"
        );
        assert_eq!(log_name(dir, Path::new("configs/b.yml")), "b.log");
    }

    #[test]
    fn runner_appends_config_path() {
        let runner = RunnerCommand {
            program: PathBuf::from("/usr/bin/market-attack"),
            args: vec!["attack".to_string()],
        };
        let invocation = runner.invocation(Path::new("configs/a.yaml"), None);
        assert_eq!(invocation.args, vec!["attack", "configs/a.yaml"]);
        assert!(invocation.envs.is_empty());

        let limited = runner.invocation(Path::new("configs/a.yaml"), Some(Duration::from_secs(90)));
        assert_eq!(
            limited.envs,
            vec![(ENV_TIME_LIMIT_MS.to_string(), "90000".to_string())]
        );
    }
}
