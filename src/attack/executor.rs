// SPDX-License-Identifier: PMPL-1.0-or-later

//! Attack execution engine: one experiment, `n_samples` seeded runs.

use crate::attack::backend;
use crate::experiment::{self, Experiment};
use crate::postprocess::{self, PARAMS_FILE, ROUND_LOG_FILE, ROUND_RESULTS_FILE, RUN_SUMMARY_FILE};
use crate::process;
use crate::storage;
use crate::types::*;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, File};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const RUN_CONFIG_FILE: &str = "run_config.yaml";
pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";

/// Everything one `attack` invocation produced
#[derive(Debug, Clone)]
pub struct AttackReport {
    pub experiment_id: String,
    pub experiment_dir: PathBuf,
    pub runs: Vec<RunSummary>,
}

impl AttackReport {
    pub fn failed_runs(&self) -> usize {
        self.runs.iter().filter(|run| !run.status.is_success()).count()
    }

    /// Turn any failed run into an error so the process exit status reflects it
    pub fn ensure_success(&self) -> Result<()> {
        let failed = self.failed_runs();
        if failed > 0 {
            anyhow::bail!(
                "{} of {} runs failed for experiment {} (see {})",
                failed,
                self.runs.len(),
                self.experiment_id,
                self.experiment_dir.display()
            );
        }
        Ok(())
    }
}

pub struct AttackExecutor {
    experiment: Experiment,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl AttackExecutor {
    pub fn new(experiment: Experiment) -> Result<Self> {
        let timeout = experiment::runner_timeout(&experiment.config)?;
        Ok(Self {
            experiment,
            timeout,
            deadline: None,
        })
    }

    /// Bound the whole experiment, on top of any per-run `runner.timeout`.
    /// Runs that would start after the limit are recorded as timed out.
    pub fn with_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.deadline = limit.map(|limit| Instant::now() + limit);
        self
    }

    pub fn execute(&self) -> Result<AttackReport> {
        let experiment_dir = self.experiment.base_dir();
        fs::create_dir_all(&experiment_dir)
            .with_context(|| format!("creating {}", experiment_dir.display()))?;
        self.write_params()?;

        let n_samples = self.experiment.config.n_samples;
        info!(
            experiment = %self.experiment.id,
            runs = n_samples,
            dir = %experiment_dir.display(),
            "starting experiment"
        );

        let mut runs = Vec::new();
        for run_index in 0..n_samples {
            let summary = match self.run_budget() {
                Some(budget) if budget.is_zero() => {
                    // Leftovers from an earlier attempt must not pass for this run's output
                    let run_dir = self.experiment.run_dir(run_index);
                    if let Err(err) = storage::reset_dir(&run_dir) {
                        warn!(dir = %run_dir.display(), "could not clear run directory: {:#}", err);
                    }
                    self.unstarted_run(
                        run_index,
                        RunStatus::TimedOut,
                        "time limit reached before the run started",
                    )
                }
                budget => self.execute_run(run_index, budget).unwrap_or_else(|err| {
                    self.unstarted_run(run_index, RunStatus::Failed, &format!("{:#}", err))
                }),
            };
            if summary.status.is_success() {
                info!(run = run_index, seed = summary.seed, rounds = summary.rounds_logged, "run finished");
            } else {
                warn!(
                    run = run_index,
                    seed = summary.seed,
                    status = summary.status.label(),
                    exit_code = ?summary.exit_code,
                    error = summary.error.as_deref().unwrap_or(""),
                    "run did not succeed"
                );
            }
            runs.push(summary);
        }

        Ok(AttackReport {
            experiment_id: self.experiment.id.clone(),
            experiment_dir,
            runs,
        })
    }

    /// The tighter of `runner.timeout` and what is left of the time limit
    fn run_budget(&self) -> Option<Duration> {
        let remaining = self
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        match (self.timeout, remaining) {
            (Some(timeout), Some(remaining)) => Some(timeout.min(remaining)),
            (timeout, remaining) => timeout.or(remaining),
        }
    }

    /// Summary for a run that never got its backend going. Best effort on
    /// disk, since the failure may be the run directory itself.
    fn unstarted_run(&self, run_index: u32, status: RunStatus, error: &str) -> RunSummary {
        let summary = RunSummary {
            experiment_id: self.experiment.id.clone(),
            run_index,
            seed: self
                .experiment
                .config
                .seed
                .saturating_add(u64::from(run_index)),
            status,
            exit_code: None,
            started_at: Utc::now().to_rfc3339(),
            duration_secs: 0.0,
            rounds_logged: 0,
            error: Some(error.to_string()),
        };
        let path = self.experiment.run_dir(run_index).join(RUN_SUMMARY_FILE);
        if let Err(err) = storage::write_json(&path, &summary) {
            warn!(path = %path.display(), "could not record run summary: {:#}", err);
        }
        summary
    }

    fn write_params(&self) -> Result<()> {
        let config = &self.experiment.config;
        let params = ExperimentParams {
            experiment_id: self.experiment.id.clone(),
            config_path: self.experiment.config_path.clone(),
            fingerprint: experiment::fingerprint(config)?,
            variant_path: experiment::variant_path(config),
            n_adversaries: experiment::n_adversaries(config),
            full_config: config.clone(),
        };
        storage::write_json(&self.experiment.base_dir().join(PARAMS_FILE), &params)
    }

    fn execute_run(&self, run_index: u32, timeout: Option<Duration>) -> Result<RunSummary> {
        let run_dir = self.experiment.run_dir(run_index);
        storage::reset_dir(&run_dir)?;

        let run_config_path = run_dir.join(RUN_CONFIG_FILE);
        let context = backend::run_context(&self.experiment, run_index, run_config_path.clone())?;
        storage::write_yaml(&run_config_path, &self.run_config(&context))?;

        let invocation = backend::build_invocation(&self.experiment.config.runner, &context);
        println!(
            "  run {} (seed {}): {}",
            run_index,
            context.seed,
            invocation.display()
        );

        let started_at = Utc::now().to_rfc3339();
        let stdout = File::create(run_dir.join(STDOUT_LOG))
            .with_context(|| format!("creating {}", run_dir.join(STDOUT_LOG).display()))?;
        let stderr = File::create(run_dir.join(STDERR_LOG))
            .with_context(|| format!("creating {}", run_dir.join(STDERR_LOG).display()))?;

        let (status, exit_code, duration_secs, error) =
            match process::run_with_deadline(&invocation, stdout, stderr, timeout) {
                Ok(outcome) => {
                    let status = if outcome.timed_out {
                        RunStatus::TimedOut
                    } else if outcome.success {
                        RunStatus::Succeeded
                    } else {
                        RunStatus::Failed
                    };
                    (status, outcome.exit_code, outcome.duration.as_secs_f64(), None)
                }
                Err(err) => (RunStatus::SpawnError, None, 0.0, Some(format!("{:#}", err))),
            };

        let rounds_logged = self.collect_rounds(&run_dir);

        let summary = RunSummary {
            experiment_id: self.experiment.id.clone(),
            run_index,
            seed: context.seed,
            status,
            exit_code,
            started_at,
            duration_secs,
            rounds_logged,
            error,
        };
        storage::write_json(&run_dir.join(RUN_SUMMARY_FILE), &summary)?;
        Ok(summary)
    }

    /// The config handed to the backend: seed, run index and save path are
    /// pinned for this run.
    fn run_config(&self, context: &backend::RunContext) -> ExperimentConfig {
        let mut config = self.experiment.config.clone();
        config.experiment_id = Some(self.experiment.id.clone());
        config.seed = context.seed;
        config.n_samples = 1;
        config.extra.insert(
            "run_index".to_string(),
            serde_yaml::Value::from(context.run_index),
        );
        config.extra.insert(
            "save_path".to_string(),
            serde_yaml::Value::from(context.run_dir.to_string_lossy().to_string()),
        );
        config
    }

    fn collect_rounds(&self, run_dir: &std::path::Path) -> usize {
        let log_path = run_dir.join(ROUND_LOG_FILE);
        if !log_path.is_file() {
            return 0;
        }
        match postprocess::convert_round_log(&log_path, &run_dir.join(ROUND_RESULTS_FILE)) {
            Ok(log) => {
                if log.malformed_lines > 0 {
                    warn!(
                        path = %log_path.display(),
                        malformed = log.malformed_lines,
                        "skipped malformed round records"
                    );
                }
                log.rows.len()
            }
            Err(err) => {
                warn!(path = %log_path.display(), "could not convert round log: {:#}", err);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::parse_config;

    fn executor() -> AttackExecutor {
        let config = parse_config(
            "dataset_name: CIFAR\nmodel_structure: resnet18\nseed: 100\nn_samples: 4\n",
        )
        .unwrap();
        AttackExecutor::new(Experiment {
            config_path: PathBuf::from("configs/x.yaml"),
            id: "x".to_string(),
            config,
        })
        .unwrap()
    }

    #[test]
    fn run_config_pins_seed_and_single_sample() {
        let executor = executor();
        let context =
            backend::run_context(&executor.experiment, 2, PathBuf::from("cfg.yaml")).unwrap();
        let config = executor.run_config(&context);
        assert_eq!(config.seed, 102);
        assert_eq!(config.n_samples, 1);
        assert_eq!(config.experiment_id.as_deref(), Some("x"));
        assert_eq!(
            config.extra.get("run_index").and_then(|v| v.as_u64()),
            Some(2)
        );
    }

    #[test]
    fn report_counts_failures() {
        let run = |status| RunSummary {
            experiment_id: "x".to_string(),
            run_index: 0,
            seed: 1,
            status,
            exit_code: None,
            started_at: String::new(),
            duration_secs: 0.0,
            rounds_logged: 0,
            error: None,
        };
        let report = AttackReport {
            experiment_id: "x".to_string(),
            experiment_dir: PathBuf::from("out/x"),
            runs: vec![run(RunStatus::Succeeded), run(RunStatus::TimedOut)],
        };
        assert_eq!(report.failed_runs(), 1);
        assert!(report.ensure_success().is_err());
    }

    #[cfg(unix)]
    fn shell_experiment(root: &std::path::Path, script: &str, n_samples: u32) -> Experiment {
        let yaml = format!(
            "dataset_name: FMNIST\nmodel_structure: mlp\nseed: 1\nn_samples: {}\noutput:\n  save_path_base: \"{}\"\nrunner:\n  program: sh\n  args: [\"-c\", \"{}\"]\n",
            n_samples,
            root.display(),
            script
        );
        Experiment {
            config_path: PathBuf::from("exp.yaml"),
            id: "exp".to_string(),
            config: parse_config(&yaml).unwrap(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn unusable_run_directory_fails_only_that_run() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("exp")).unwrap();
        // A file where run_0's directory belongs
        fs::write(dir.path().join("exp/run_0"), "in the way").unwrap();

        let executor = AttackExecutor::new(shell_experiment(dir.path(), "exit 0", 2)).unwrap();
        let report = executor.execute().unwrap();
        assert_eq!(report.runs.len(), 2);
        assert_eq!(report.runs[0].status, RunStatus::Failed);
        assert!(report.runs[0].error.is_some());
        assert_eq!(report.runs[1].status, RunStatus::Succeeded);
        assert!(dir.path().join("exp/run_1").join(RUN_SUMMARY_FILE).is_file());
    }

    #[cfg(unix)]
    #[test]
    fn time_limit_stops_current_and_later_runs() {
        let dir = tempfile::TempDir::new().unwrap();
        let executor = AttackExecutor::new(shell_experiment(dir.path(), "sleep 5", 2))
            .unwrap()
            .with_time_limit(Some(Duration::from_millis(300)));
        let started = Instant::now();
        let report = executor.execute().unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(report.runs[0].status, RunStatus::TimedOut);
        assert_eq!(report.runs[1].status, RunStatus::TimedOut);
        assert_eq!(report.runs[1].exit_code, None);
        assert!(dir.path().join("exp/run_1").join(RUN_SUMMARY_FILE).is_file());
    }
}
