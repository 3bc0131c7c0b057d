// SPDX-License-Identifier: PMPL-1.0-or-later

//! Resolving the configured attack backend into a concrete command line.

use crate::experiment;
use crate::process::Invocation;
use crate::types::RunnerSpec;
use anyhow::{anyhow, Result};
use std::path::PathBuf;

pub const ENV_RUN_DIR: &str = "MARKET_ATTACK_RUN_DIR";
pub const ENV_SEED: &str = "MARKET_ATTACK_SEED";
pub const ENV_RUN_INDEX: &str = "MARKET_ATTACK_RUN_INDEX";
pub const ENV_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";

/// Per-run values available to `runner.args`
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: PathBuf,
    pub run_dir: PathBuf,
    pub experiment_dir: PathBuf,
    pub seed: u64,
    pub run_index: u32,
    pub visible_devices: Option<String>,
}

impl RunContext {
    pub fn substitute(&self, arg: &str) -> String {
        arg.replace("{config}", &self.config.to_string_lossy())
            .replace("{run_dir}", &self.run_dir.to_string_lossy())
            .replace("{experiment_dir}", &self.experiment_dir.to_string_lossy())
            .replace("{seed}", &self.seed.to_string())
            .replace("{run}", &self.run_index.to_string())
    }
}

pub fn build_invocation(runner: &RunnerSpec, context: &RunContext) -> Invocation {
    let args = runner
        .args
        .iter()
        .map(|arg| context.substitute(arg))
        .collect();
    let mut invocation = Invocation::new(runner.program.clone(), args)
        .env(ENV_RUN_DIR, context.run_dir.to_string_lossy())
        .env(ENV_SEED, context.seed.to_string())
        .env(ENV_RUN_INDEX, context.run_index.to_string());
    if let Some(devices) = &context.visible_devices {
        invocation = invocation.env(ENV_VISIBLE_DEVICES, devices.clone());
    }
    invocation
}

/// Context for run `run_index` of an experiment rooted at `experiment_dir`.
pub fn run_context(
    experiment: &experiment::Experiment,
    run_index: u32,
    config_path: PathBuf,
) -> Result<RunContext> {
    let seed = experiment
        .config
        .seed
        .checked_add(u64::from(run_index))
        .ok_or_else(|| anyhow!("`seed` {} + run {} overflows", experiment.config.seed, run_index))?;
    Ok(RunContext {
        config: config_path,
        run_dir: experiment.run_dir(run_index),
        experiment_dir: experiment.base_dir(),
        seed,
        run_index,
        visible_devices: experiment::visible_devices(&experiment.config),
    })
}
