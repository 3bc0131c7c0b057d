// SPDX-License-Identifier: PMPL-1.0-or-later

//! Core type definitions for market-attack
//!
//! The experiment config mirrors the knobs the attack backend understands.
//! Only the keys the harness itself reasons about are typed; anything else at
//! the top level is carried through to the backend untouched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const DEFAULT_SAVE_PATH_BASE: &str = "./experiment_result";
pub const DEFAULT_RUNNER_PROGRAM: &str = "python3";

/// One experiment variant, as read from a YAML config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    pub dataset_name: String,
    pub model_structure: String,
    #[serde(default = "default_aggregation_method")]
    pub aggregation_method: String,
    #[serde(default = "default_global_rounds")]
    pub global_rounds: u32,
    #[serde(default = "default_n_sellers")]
    pub n_sellers: u32,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Number of seeded runs for this variant
    #[serde(default = "default_n_samples")]
    pub n_samples: u32,
    #[serde(default = "default_true")]
    pub change_base: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_ids: Option<String>,
    #[serde(default)]
    pub data_split: DataSplitParams,
    #[serde(default)]
    pub attack: AttackParams,
    #[serde(default)]
    pub sybil: SybilParams,
    #[serde(default)]
    pub local_training: LocalTrainingParams,
    #[serde(default)]
    pub output: OutputParams,
    #[serde(default)]
    pub runner: RunnerSpec,
    /// Backend-specific keys the harness does not interpret
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataSplitParams {
    pub mode: String,
    pub buyer_percentage: f64,
    pub buyer_data_mode: String,
    pub discovery_quality: f64,
}

impl Default for DataSplitParams {
    fn default() -> Self {
        Self {
            mode: "NonIID".to_string(),
            buyer_percentage: 0.02,
            buyer_data_mode: "random".to_string(),
            discovery_quality: 0.3,
        }
    }
}

/// How adversarial sellers tamper with the gradients they submit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManipulationMode {
    #[serde(rename = "None")]
    NoAttack,
    #[serde(rename = "cmd")]
    Cmd,
    #[serde(rename = "single")]
    Single,
}

impl ManipulationMode {
    pub fn label(&self) -> &'static str {
        match self {
            ManipulationMode::NoAttack => "None",
            ManipulationMode::Cmd => "cmd",
            ManipulationMode::Single => "single",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AttackParams {
    pub gradient_manipulation_mode: ManipulationMode,
    pub adv_rate: f64,
    pub poison_strength: f64,
    pub trigger_rate: f64,
    pub trigger_type: String,
    pub trigger_attack_mode: String,
    pub backdoor_target_label: u32,
    pub bkd_loc: String,
    pub is_sybil: bool,
    pub clip: bool,
    pub remove_baseline: bool,
}

impl Default for AttackParams {
    fn default() -> Self {
        Self {
            gradient_manipulation_mode: ManipulationMode::Cmd,
            adv_rate: 0.0,
            poison_strength: 1.0,
            trigger_rate: 0.1,
            trigger_type: "blended_patch".to_string(),
            trigger_attack_mode: "static".to_string(),
            backdoor_target_label: 0,
            bkd_loc: "bottom_right".to_string(),
            is_sybil: false,
            clip: false,
            remove_baseline: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SybilParams {
    pub sybil_mode: String,
    pub benign_rounds: u32,
    pub alpha: f64,
    pub amplify_factor: f64,
    pub cost_scale: f64,
    pub trigger_mode: String,
}

impl Default for SybilParams {
    fn default() -> Self {
        Self {
            sybil_mode: "mimic".to_string(),
            benign_rounds: 5,
            alpha: 0.5,
            amplify_factor: 1.0,
            cost_scale: 1.0,
            trigger_mode: "always".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalTrainingParams {
    pub epochs: u32,
    pub learning_rate: f64,
    pub batch_size: u32,
}

impl Default for LocalTrainingParams {
    fn default() -> Self {
        Self {
            epochs: 1,
            learning_rate: 0.001,
            batch_size: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputParams {
    pub save_path_base: PathBuf,
}

impl Default for OutputParams {
    fn default() -> Self {
        Self {
            save_path_base: PathBuf::from(DEFAULT_SAVE_PATH_BASE),
        }
    }
}

/// Command line used to launch the attack backend for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerSpec {
    pub program: String,
    /// Arguments; `{config}`, `{run_dir}`, `{seed}`, `{run}` and
    /// `{experiment_dir}` are substituted per run
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

impl Default for RunnerSpec {
    fn default() -> Self {
        Self {
            program: DEFAULT_RUNNER_PROGRAM.to_string(),
            args: vec!["attack_backend.py".to_string(), "{config}".to_string()],
            timeout: None,
        }
    }
}

fn default_aggregation_method() -> String {
    "martfl".to_string()
}

fn default_global_rounds() -> u32 {
    100
}

fn default_n_sellers() -> u32 {
    30
}

fn default_seed() -> u64 {
    42
}

fn default_n_samples() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Outcome of a single seeded run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    TimedOut,
    SpawnError,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
            RunStatus::SpawnError => "spawn_error",
        }
    }
}

/// Written to `run_<i>/run_summary.json` after every run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub experiment_id: String,
    pub run_index: u32,
    pub seed: u64,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub started_at: String,
    pub duration_secs: f64,
    pub rounds_logged: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Written once per experiment to `experiment_params.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentParams {
    pub experiment_id: String,
    pub config_path: PathBuf,
    pub fingerprint: String,
    pub variant_path: String,
    pub n_adversaries: u32,
    pub full_config: ExperimentConfig,
}
