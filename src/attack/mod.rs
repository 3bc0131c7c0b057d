// SPDX-License-Identifier: PMPL-1.0-or-later

//! Single-attack orchestration module

pub mod backend;
pub mod executor;

use crate::experiment::Experiment;
use anyhow::{Context, Result};
use colored::*;
use std::path::Path;
use std::time::Duration;

pub use executor::{AttackExecutor, AttackReport};

/// Overall time limit in milliseconds, set by `batch --timeout` so the
/// attack process stops its own backend before the batch gives up on it.
pub const ENV_TIME_LIMIT_MS: &str = "MARKET_ATTACK_TIME_LIMIT_MS";

/// Load the config at `config_path` and run all of its seeded runs
pub fn execute_attack(config_path: &Path) -> Result<AttackReport> {
    execute_attack_within(config_path, None)
}

/// Like [`execute_attack`], with every run bounded by `time_limit`
pub fn execute_attack_within(
    config_path: &Path,
    time_limit: Option<Duration>,
) -> Result<AttackReport> {
    let experiment = Experiment::load(config_path)?;
    let executor = AttackExecutor::new(experiment)?.with_time_limit(time_limit);
    executor.execute()
}

pub fn time_limit_from_env() -> Result<Option<Duration>> {
    match std::env::var(ENV_TIME_LIMIT_MS) {
        Ok(raw) => {
            let millis: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be milliseconds, got '{}'", ENV_TIME_LIMIT_MS, raw))?;
            Ok(Some(Duration::from_millis(millis)))
        }
        Err(_) => Ok(None),
    }
}

pub fn print_report(report: &AttackReport) {
    println!("\n{}", "=== ATTACK RUNS ===".bold().cyan());
    println!("  Experiment: {}", report.experiment_id);
    println!("  Results: {}", report.experiment_dir.display());
    for run in &report.runs {
        let status = if run.status.is_success() {
            run.status.label().green()
        } else {
            run.status.label().red()
        };
        println!(
            "  run_{:<4} seed {:<8} {:<12} exit {:<6} {:>8.2}s  rounds {}",
            run.run_index,
            run.seed,
            status,
            run.exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".to_string()),
            run.duration_secs,
            run.rounds_logged
        );
        if let Some(err) = &run.error {
            println!("         {}", err.red());
        }
    }
    println!();
}
