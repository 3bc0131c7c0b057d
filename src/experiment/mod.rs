// SPDX-License-Identifier: PMPL-1.0-or-later

//! Experiment config loading, validation and derived naming.

mod duration;

pub use duration::parse_duration;

use crate::types::{ExperimentConfig, ManipulationMode};
use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// A parsed and validated experiment config together with its identity
#[derive(Debug, Clone)]
pub struct Experiment {
    pub config_path: PathBuf,
    pub id: String,
    pub config: ExperimentConfig,
}

impl Experiment {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading experiment config {}", path.display()))?;
        let config = parse_config(&content)
            .with_context(|| format!("parsing experiment config {}", path.display()))?;
        validate(&config)
            .with_context(|| format!("invalid experiment config {}", path.display()))?;

        let id = match &config.experiment_id {
            Some(id) => id.clone(),
            None => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .ok_or_else(|| anyhow!("cannot derive experiment id from {}", path.display()))?,
        };
        validate_experiment_id(&id)
            .with_context(|| format!("invalid experiment config {}", path.display()))?;

        Ok(Self {
            config_path: path.to_path_buf(),
            id,
            config,
        })
    }

    /// `<save_path_base>/<experiment_id>`
    pub fn base_dir(&self) -> PathBuf {
        self.config.output.save_path_base.join(&self.id)
    }

    pub fn run_dir(&self, run_index: u32) -> PathBuf {
        self.base_dir().join(format!("run_{}", run_index))
    }
}

pub fn parse_config(content: &str) -> Result<ExperimentConfig> {
    Ok(serde_yaml::from_str(content)?)
}

pub fn validate(config: &ExperimentConfig) -> Result<()> {
    if config.dataset_name.trim().is_empty() {
        bail!("`dataset_name` must not be empty");
    }
    if config.model_structure.trim().is_empty() {
        bail!("`model_structure` must not be empty");
    }
    if config.aggregation_method.trim().is_empty() {
        bail!("`aggregation_method` must not be empty");
    }
    require_positive("global_rounds", config.global_rounds)?;
    require_positive("n_sellers", config.n_sellers)?;
    require_positive("n_samples", config.n_samples)?;
    // Run i uses seed + i
    if config
        .seed
        .checked_add(u64::from(config.n_samples - 1))
        .is_none()
    {
        bail!(
            "`seed` {} is too large for {} runs (run seeds would overflow)",
            config.seed,
            config.n_samples
        );
    }
    require_positive("local_training.epochs", config.local_training.epochs)?;
    require_positive("local_training.batch_size", config.local_training.batch_size)?;

    require_unit_interval("attack.adv_rate", config.attack.adv_rate)?;
    require_unit_interval("attack.trigger_rate", config.attack.trigger_rate)?;
    let buyer = config.data_split.buyer_percentage;
    if !(buyer > 0.0 && buyer <= 1.0) {
        bail!(
            "`data_split.buyer_percentage` must be within (0, 1], got {}",
            buyer
        );
    }
    let lr = config.local_training.learning_rate;
    if !(lr.is_finite() && lr > 0.0) {
        bail!("`local_training.learning_rate` must be positive, got {}", lr);
    }

    if config.runner.program.trim().is_empty() {
        bail!("`runner.program` must not be empty");
    }
    if let Some(raw) = &config.runner.timeout {
        parse_duration(raw).context("`runner.timeout`")?;
    }
    if let Some(ids) = &config.gpu_ids {
        for part in ids.split(',') {
            part.trim()
                .parse::<u32>()
                .with_context(|| format!("`gpu_ids` entry '{}' is not a GPU index", part))?;
        }
    }
    Ok(())
}

fn require_positive(key: &str, value: u32) -> Result<()> {
    if value == 0 {
        bail!("`{}` must be at least 1", key);
    }
    Ok(())
}

fn require_unit_interval(key: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        bail!("`{}` must be within [0, 1], got {}", key, value);
    }
    Ok(())
}

/// Experiment ids become directories below the result root, so they must
/// stay relative and must not climb out of it.
pub fn validate_experiment_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("`experiment_id` must not be empty");
    }
    for component in Path::new(id).components() {
        if !matches!(component, Component::Normal(_)) {
            bail!(
                "`experiment_id` '{}' must be a relative path without '..'",
                id
            );
        }
    }
    Ok(())
}

pub fn n_adversaries(config: &ExperimentConfig) -> u32 {
    (config.n_sellers as f64 * config.attack.adv_rate).floor() as u32
}

pub fn runner_timeout(config: &ExperimentConfig) -> Result<Option<Duration>> {
    config.runner.timeout.as_deref().map(parse_duration).transpose()
}

/// Comma separated GPU list for `CUDA_VISIBLE_DEVICES`
pub fn visible_devices(config: &ExperimentConfig) -> Option<String> {
    config.gpu_ids.as_ref().map(|ids| {
        ids.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    })
}

/// SHA-256 over the canonical YAML form of the parsed config
pub fn fingerprint(config: &ExperimentConfig) -> Result<String> {
    let canonical = serde_yaml::to_string(config)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Relative directory naming this variant, one level per experiment axis.
pub fn variant_path(config: &ExperimentConfig) -> String {
    let attack = &config.attack;
    let split = &config.data_split;

    let aggregation = if config.aggregation_method == "martfl" && config.change_base {
        format!("{}_cb", config.aggregation_method)
    } else {
        config.aggregation_method.clone()
    };

    let mut parts = vec![
        config.dataset_name.clone(),
        aggregation,
        format!("split_{}", split.mode),
    ];
    if split.mode == "discovery" {
        parts.push(format!(
            "discovery_quality_{}",
            format_float(split.discovery_quality)
        ));
    }
    parts.push(format!("buyer_{}", split.buyer_data_mode));
    parts.push(format!("trigger_{}", attack.trigger_attack_mode));
    parts.push(if attack.is_sybil {
        format!("sybil_{}", config.sybil.sybil_mode)
    } else {
        "sybil_off".to_string()
    });

    let training = format!(
        "local_epoch_{}_local_lr_{}",
        config.local_training.epochs,
        format_float(config.local_training.learning_rate)
    );
    match attack.gradient_manipulation_mode {
        ManipulationMode::NoAttack => {
            parts.push("no_attack".to_string());
            parts.push(format!("n_seller_{}_{}", config.n_sellers, training));
        }
        ManipulationMode::Cmd => {
            parts.push(format!(
                "backdoor_mode_cmd_strength_{}_trigger_rate_{}_trigger_type_{}",
                format_float(attack.poison_strength),
                format_float(attack.trigger_rate),
                attack.trigger_type
            ));
            parts.push(format!(
                "n_seller_{}_adv_rate_{}_{}",
                config.n_sellers,
                format_float(attack.adv_rate),
                training
            ));
        }
        ManipulationMode::Single => {
            parts.push(format!(
                "backdoor_mode_single_trigger_rate_{}_trigger_type_{}",
                format_float(attack.trigger_rate),
                attack.trigger_type
            ));
            parts.push(format!(
                "n_seller_{}_adv_rate_{}_{}",
                config.n_sellers,
                format_float(attack.adv_rate),
                training
            ));
        }
    }

    parts
        .iter()
        .map(|part| sanitize_component(part))
        .collect::<Vec<_>>()
        .join("/")
}

/// Whole numbers keep a trailing `.0` so `1.0` and `1` name the same variant.
pub fn format_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// Replace anything that is not safe inside a single path component.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "dataset_name: FMNIST\nmodel_structure: resnet18\n";

    #[test]
    fn minimal_config_takes_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.aggregation_method, "martfl");
        assert_eq!(config.global_rounds, 100);
        assert_eq!(config.n_samples, 1);
        assert_eq!(config.attack.gradient_manipulation_mode, ManipulationMode::Cmd);
        assert_eq!(config.runner.program, "python3");
        assert!(config.extra.is_empty());
        validate(&config).unwrap();
    }

    #[test]
    fn unknown_top_level_keys_are_kept() {
        let config = parse_config(&format!("{}early_stop_patience: 20\n", MINIMAL)).unwrap();
        let patience = config.extra.get("early_stop_patience").and_then(|v| v.as_u64());
        assert_eq!(patience, Some(20));
    }

    #[test]
    fn unknown_section_keys_are_rejected() {
        let err = parse_config(&format!("{}attack:\n  adv_rat: 0.2\n", MINIMAL)).unwrap_err();
        assert!(format!("{:#}", err).contains("adv_rat"));
    }

    #[test]
    fn missing_dataset_is_an_error() {
        assert!(parse_config("model_structure: mlp\n").is_err());
    }

    #[test]
    fn adv_rate_out_of_range_is_named() {
        let mut config = parse_config(MINIMAL).unwrap();
        config.attack.adv_rate = 1.5;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("attack.adv_rate"));
    }

    #[test]
    fn seed_near_max_is_rejected_for_multiple_runs() {
        let single = "dataset_name: FMNIST\nmodel_structure: mlp\nseed: 18446744073709551615\n";
        assert!(validate(&parse_config(single).unwrap()).is_ok());

        let err = validate(&parse_config(&format!("{}n_samples: 2\n", single)).unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("`seed`"));
    }

    #[test]
    fn bad_gpu_ids_are_rejected() {
        let mut config = parse_config(MINIMAL).unwrap();
        config.gpu_ids = Some("0,x".to_string());
        assert!(validate(&config).is_err());
        config.gpu_ids = Some(" 0, 2 ".to_string());
        validate(&config).unwrap();
        assert_eq!(visible_devices(&config).as_deref(), Some("0,2"));
    }

    #[test]
    fn experiment_ids_stay_relative() {
        validate_experiment_id("fmnist/martfl/run-a").unwrap();
        assert!(validate_experiment_id("../escape").is_err());
        assert!(validate_experiment_id("/abs").is_err());
        assert!(validate_experiment_id("").is_err());
    }

    #[test]
    fn adversaries_round_down() {
        let mut config = parse_config(MINIMAL).unwrap();
        config.n_sellers = 30;
        config.attack.adv_rate = 0.25;
        assert_eq!(n_adversaries(&config), 7);
    }

    #[test]
    fn variant_path_for_cmd_attack() {
        let mut config = parse_config(MINIMAL).unwrap();
        config.attack.adv_rate = 0.2;
        assert_eq!(
            variant_path(&config),
            "FMNIST/martfl_cb/split_NonIID/buyer_random/trigger_static/sybil_off/\
             backdoor_mode_cmd_strength_1.0_trigger_rate_0.1_trigger_type_blended_patch/\
             n_seller_30_adv_rate_0.2_local_epoch_1_local_lr_0.001"
        );
    }

    #[test]
    fn variant_path_without_attack_omits_adv_rate() {
        let mut config = parse_config(MINIMAL).unwrap();
        config.aggregation_method = "fedavg".to_string();
        config.attack.gradient_manipulation_mode = ManipulationMode::NoAttack;
        config.data_split.mode = "discovery".to_string();
        let path = variant_path(&config);
        assert!(path.starts_with("FMNIST/fedavg/split_discovery/discovery_quality_0.3/"));
        assert!(path.ends_with("/no_attack/n_seller_30_local_epoch_1_local_lr_0.001"));
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let config = parse_config(MINIMAL).unwrap();
        let again = parse_config(MINIMAL).unwrap();
        assert_eq!(fingerprint(&config).unwrap(), fingerprint(&again).unwrap());

        let mut changed = again;
        changed.seed += 1;
        assert_ne!(fingerprint(&config).unwrap(), fingerprint(&changed).unwrap());
    }

    #[test]
    fn sanitize_keeps_safe_characters() {
        assert_eq!(sanitize_component("CIFAR-10 v2"), "CIFAR-10_v2");
        assert_eq!(sanitize_component(".."), "_");
    }
}
