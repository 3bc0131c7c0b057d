// SPDX-License-Identifier: PMPL-1.0-or-later

//! market-attack: experiment harness for data-marketplace poisoning attacks
//!
//! Generates experiment configurations, drives the attack backend over them
//! one config at a time or as a bounded parallel batch, and flattens the
//! per-round logs it leaves behind into CSV tables.

use anyhow::Result;
use clap::{Parser, Subcommand};
use market_attack::batch::{self, BatchConfig, RunnerCommand, DEFAULT_PARALLEL};
use market_attack::diagnostics::{self, SetupConfig};
use market_attack::experiment::parse_duration;
use market_attack::generate::{self, SweepSettings};
use market_attack::postprocess::{self, ProcessConfig};
use market_attack::types::DEFAULT_RUNNER_PROGRAM;
use market_attack::{attack, logging};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "market-attack")]
#[command(version)]
#[command(about = "Run poisoning-attack experiments against a data marketplace simulation")]
#[command(long_about = None)]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create working directories and check the backend interpreter
    Setup {
        /// Interpreter the attack backend runs on
        #[arg(long, default_value = DEFAULT_RUNNER_PROGRAM)]
        runner: String,
    },

    /// Expand sweep settings into a tree of experiment configs
    GenConfigs {
        /// Sweep settings file (default: sweep.yaml if present, else built-in)
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Directory the configs are written to
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Run every seeded run of a single experiment config
    Attack {
        /// Experiment config (YAML)
        #[arg(value_name = "CONFIG")]
        config_path: PathBuf,
    },

    /// Run every config under a directory on a bounded worker pool
    Batch {
        /// Directory holding experiment configs
        #[arg(long)]
        config_dir: PathBuf,

        /// Maximum number of attack processes running at once
        #[arg(long, default_value_t = DEFAULT_PARALLEL as u64, value_parser = clap::value_parser!(u64).range(1..))]
        parallel: u64,

        /// Kill a config's attack process after this long (e.g. 90m, 2h)
        #[arg(long, value_parser = parse_timeout)]
        timeout: Option<Duration>,

        /// Where per-config logs and batch_report.json go
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Program invoked as `<runner> attack <config>` (default: this binary)
        #[arg(long)]
        runner: Option<PathBuf>,

        /// List the configs that would run, then stop
        #[arg(long)]
        dry_run: bool,
    },

    /// Flatten raw round logs into CSV tables
    ProcessLogs {
        /// Raw log tree written by attack runs
        #[arg(long = "result_path", default_value = "./experiment_result")]
        result_path: PathBuf,

        /// Where CSV tables are written
        #[arg(long = "output_dir", default_value = "./results")]
        output_dir: PathBuf,
    },
}

fn parse_timeout(raw: &str) -> Result<Duration, String> {
    parse_duration(raw).map_err(|err| format!("{:#}", err))
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(diagnostics::DEFAULT_LOGS_DIR).join(format!(
        "batch-{}",
        chrono::Utc::now().format("%Y%m%d%H%M%S")
    ))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose)?;

    match cli.command {
        Commands::Setup { runner } => {
            let config = SetupConfig {
                runner,
                ..SetupConfig::default()
            };
            diagnostics::run_setup(&config)?;
        }

        Commands::GenConfigs {
            settings,
            output_dir,
        } => {
            let (sweep, source) = SweepSettings::resolve(settings.as_deref())?;
            let report = generate::write_configs(&sweep, source, output_dir.as_deref())?;
            generate::print_summary(&report);
        }

        Commands::Attack { config_path } => {
            println!("Running experiment config: {}", config_path.display());
            let time_limit = attack::time_limit_from_env()?;
            let report = attack::execute_attack_within(&config_path, time_limit)?;
            attack::print_report(&report);
            report.ensure_success()?;
        }

        Commands::Batch {
            config_dir,
            parallel,
            timeout,
            log_dir,
            runner,
            dry_run,
        } => {
            if dry_run {
                let configs = batch::discover_configs(&config_dir)?;
                println!("{} configs under {}:", configs.len(), config_dir.display());
                for config in &configs {
                    println!("  {}", config.display());
                }
                return Ok(());
            }

            let runner = match runner {
                Some(program) => RunnerCommand {
                    program,
                    args: vec!["attack".to_string()],
                },
                None => RunnerCommand::current_exe()?,
            };
            let config = BatchConfig {
                config_dir,
                parallel: parallel as usize,
                timeout,
                log_dir: log_dir.unwrap_or_else(default_log_dir),
                runner,
            };
            let report = batch::run(&config)?;
            batch::print_summary(&report);
            println!(
                "Batch report: {}",
                config.log_dir.join(batch::BATCH_REPORT_FILE).display()
            );
            report.ensure_success()?;
        }

        Commands::ProcessLogs {
            result_path,
            output_dir,
        } => {
            let config = ProcessConfig {
                result_path,
                output_dir,
            };
            let report = postprocess::run(&config)?;
            postprocess::print_summary(&report, &config.output_dir);
        }
    }

    Ok(())
}
