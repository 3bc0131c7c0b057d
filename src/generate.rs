// SPDX-License-Identifier: PMPL-1.0-or-later

//! Config generation: expand a sweep (base config + value grid) into one
//! experiment config file per combination.

use crate::experiment::{self, format_float, sanitize_component};
use crate::storage;
use crate::types::ExperimentConfig;
use anyhow::{anyhow, bail, Context, Result};
use colored::*;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_SETTINGS_FILE: &str = "sweep.yaml";
pub const DEFAULT_OUTPUT_DIR: &str = "configs";

const BUILTIN_SWEEP: &str = r#"
output_dir: configs
base:
  model_structure: resnet18
  global_rounds: 100
  n_sellers: 30
  n_samples: 3
  seed: 42
  data_split:
    mode: NonIID
    buyer_percentage: 0.02
    buyer_data_mode: random
  attack:
    trigger_type: blended_patch
    trigger_attack_mode: static
    poison_strength: 1.0
    trigger_rate: 0.1
    backdoor_target_label: 0
  local_training:
    epochs: 1
    learning_rate: 0.001
  output:
    save_path_base: ./experiment_result
  runner:
    program: python3
    args: [attack_backend.py, "{config}"]
grid:
  dataset_name: [FMNIST, CIFAR]
  aggregation_method: [martfl, fedavg, skymask]
  attack.gradient_manipulation_mode: [cmd, single]
  attack.adv_rate: [0.1, 0.2, 0.3]
"#;

/// Hand-tunable sweep description
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepSettings {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Partial experiment config shared by every combination
    #[serde(default)]
    pub base: Mapping,
    /// Dotted config key -> values to sweep over
    #[serde(default)]
    pub grid: BTreeMap<String, Vec<Value>>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_DIR)
}

impl SweepSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading sweep settings {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("parsing sweep settings {}", path.display()))
    }

    pub fn builtin() -> Result<Self> {
        serde_yaml::from_str(BUILTIN_SWEEP).context("parsing built-in sweep settings")
    }

    /// An explicit file must exist; otherwise `sweep.yaml` is used when
    /// present and the built-in sweep when not.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }
        let default_path = Path::new(DEFAULT_SETTINGS_FILE);
        if default_path.is_file() {
            return Ok((Self::load(default_path)?, Some(default_path.to_path_buf())));
        }
        Ok((Self::builtin()?, None))
    }
}

/// One expanded experiment config
#[derive(Debug, Clone)]
pub struct GeneratedConfig {
    pub experiment_id: String,
    pub config: ExperimentConfig,
}

impl GeneratedConfig {
    /// `<output_dir>/<experiment_id>.yaml`
    pub fn file_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(format!("{}.yaml", self.experiment_id))
    }
}

struct Combination {
    values: Vec<(String, Value)>,
    config: ExperimentConfig,
    variant: String,
}

/// Cartesian product of the grid in sorted key order, applied on top of
/// `base`. An empty grid yields the base config alone.
pub fn expand(settings: &SweepSettings) -> Result<Vec<GeneratedConfig>> {
    let mut combinations: Vec<Vec<(String, Value)>> = vec![Vec::new()];
    for (key, values) in &settings.grid {
        if values.is_empty() {
            bail!("grid key '{}' has no values", key);
        }
        combinations = combinations
            .into_iter()
            .flat_map(|prefix| {
                values.iter().map(move |value| {
                    let mut next = prefix.clone();
                    next.push((key.clone(), value.clone()));
                    next
                })
            })
            .collect();
    }

    let mut expanded = Vec::with_capacity(combinations.len());
    for values in combinations {
        let mut doc = settings.base.clone();
        doc.remove("experiment_id");
        for (key, value) in &values {
            set_dotted(&mut doc, key, value.clone())?;
        }
        let label = describe(&values);
        let config: ExperimentConfig = serde_yaml::from_value(Value::Mapping(doc))
            .with_context(|| format!("building config for {}", label))?;
        experiment::validate(&config).with_context(|| format!("invalid config for {}", label))?;
        let variant = experiment::variant_path(&config);
        expanded.push(Combination {
            values,
            config,
            variant,
        });
    }

    assign_ids(expanded)
}

/// Variant paths name most combinations on their own; where several share
/// one, the grid values that tell them apart are appended.
fn assign_ids(combinations: Vec<Combination>) -> Result<Vec<GeneratedConfig>> {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (index, combination) in combinations.iter().enumerate() {
        groups
            .entry(combination.variant.clone())
            .or_default()
            .push(index);
    }

    let mut suffixes: Vec<String> = vec![String::new(); combinations.len()];
    for members in groups.values().filter(|members| members.len() > 1) {
        let keys = &combinations[members[0]].values;
        for (position, (key, _)) in keys.iter().enumerate() {
            let distinct: BTreeSet<String> = members
                .iter()
                .map(|&member| value_label(&combinations[member].values[position].1))
                .collect();
            if distinct.len() < 2 {
                continue;
            }
            for &member in members {
                let value = value_label(&combinations[member].values[position].1);
                suffixes[member].push_str(&format!(
                    "_{}_{}",
                    sanitize_component(leaf(key)),
                    sanitize_component(&value)
                ));
            }
        }
    }

    let mut seen = BTreeSet::new();
    let mut generated = Vec::with_capacity(combinations.len());
    for (combination, suffix) in combinations.into_iter().zip(suffixes) {
        let experiment_id = format!("{}{}", combination.variant, suffix);
        experiment::validate_experiment_id(&experiment_id)?;
        if !seen.insert(experiment_id.clone()) {
            bail!(
                "grid produces duplicate experiment '{}' ({}); remove repeated grid values",
                experiment_id,
                describe(&combination.values)
            );
        }
        let mut config = combination.config;
        config.experiment_id = Some(experiment_id.clone());
        generated.push(GeneratedConfig {
            experiment_id,
            config,
        });
    }
    Ok(generated)
}

fn leaf(key: &str) -> &str {
    key.rsplit('.').next().unwrap_or(key)
}

fn value_label(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) if number.is_f64() => {
            number.as_f64().map(format_float).unwrap_or_else(|| number.to_string())
        }
        Value::Number(number) => number.to_string(),
        Value::Null => "null".to_string(),
        other => serde_yaml::to_string(other)
            .map(|text| text.trim().to_string())
            .unwrap_or_default(),
    }
}

fn describe(values: &[(String, Value)]) -> String {
    if values.is_empty() {
        return "base config".to_string();
    }
    values
        .iter()
        .map(|(key, value)| format!("{}={}", key, value_label(value)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Set `a.b.c` inside nested mappings, creating intermediate mappings.
fn set_dotted(root: &mut Mapping, key: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = key.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        bail!("invalid grid key '{}'", key);
    }
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| anyhow!("invalid grid key '{}'", key))?;

    let mut current = root;
    for segment in parents {
        let slot = current
            .entry(Value::from(*segment))
            .or_insert(Value::Mapping(Mapping::new()));
        current = match slot {
            Value::Mapping(mapping) => mapping,
            _ => bail!("grid key '{}': '{}' is not a mapping in the base config", key, segment),
        };
    }
    current.insert(Value::from(*last), value);
    Ok(())
}

/// What a generation pass wrote
#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub settings_source: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub written: Vec<PathBuf>,
}

pub fn write_configs(
    settings: &SweepSettings,
    settings_source: Option<PathBuf>,
    output_override: Option<&Path>,
) -> Result<GenerationReport> {
    let output_dir = output_override
        .map(Path::to_path_buf)
        .unwrap_or_else(|| settings.output_dir.clone());
    let generated = expand(settings)?;

    fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating config directory {}", output_dir.display()))?;
    let mut written = Vec::with_capacity(generated.len());
    for item in &generated {
        let path = item.file_path(&output_dir);
        storage::write_yaml(&path, &item.config)?;
        written.push(path);
    }

    info!(configs = written.len(), dir = %output_dir.display(), "configs generated");
    Ok(GenerationReport {
        settings_source,
        output_dir,
        written,
    })
}

pub fn print_summary(report: &GenerationReport) {
    println!("\n{}", "=== CONFIG GENERATION ===".bold().cyan());
    match &report.settings_source {
        Some(path) => println!("  Settings: {}", path.display()),
        None => println!("  Settings: built-in sweep"),
    }
    println!(
        "  Wrote {} configs to {}",
        report.written.len().to_string().green(),
        report.output_dir.display()
    );
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(yaml: &str) -> SweepSettings {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn builtin_sweep_expands_to_unique_ids() {
        let generated = expand(&SweepSettings::builtin().unwrap()).unwrap();
        assert_eq!(generated.len(), 2 * 3 * 2 * 3);
        let ids: BTreeSet<_> = generated.iter().map(|g| g.experiment_id.clone()).collect();
        assert_eq!(ids.len(), generated.len());
    }

    #[test]
    fn empty_grid_yields_base() {
        let generated = expand(&settings(
            "base:\n  dataset_name: FMNIST\n  model_structure: mlp\n",
        ))
        .unwrap();
        assert_eq!(generated.len(), 1);
        assert!(generated[0].experiment_id.starts_with("FMNIST/martfl_cb/"));
    }

    #[test]
    fn dotted_keys_reach_nested_sections() {
        let generated = expand(&settings(
            "base:\n  dataset_name: FMNIST\n  model_structure: mlp\ngrid:\n  sybil.alpha: [0.1, 0.9]\n",
        ))
        .unwrap();
        assert_eq!(generated.len(), 2);
        assert_eq!(generated[0].config.sybil.alpha, 0.1);
        assert_eq!(generated[1].config.sybil.alpha, 0.9);
        assert!(generated[0].experiment_id.ends_with("_alpha_0.1"));
        assert!(generated[1].experiment_id.ends_with("_alpha_0.9"));
    }

    #[test]
    fn colliding_variants_get_distinguishing_suffix() {
        let generated = expand(&settings(
            "base:\n  dataset_name: FMNIST\n  model_structure: mlp\n  attack:\n    gradient_manipulation_mode: None\ngrid:\n  attack.adv_rate: [0.1, 0.2]\n  n_sellers: [10]\n",
        ))
        .unwrap();
        assert_eq!(generated.len(), 2);
        assert!(generated[0].experiment_id.ends_with("local_lr_0.001_adv_rate_0.1"));
        assert!(generated[1].experiment_id.ends_with("local_lr_0.001_adv_rate_0.2"));
    }

    #[test]
    fn repeated_grid_values_are_rejected() {
        let result = expand(&settings(
            "base:\n  dataset_name: FMNIST\n  model_structure: mlp\ngrid:\n  seed: [1, 1]\n",
        ));
        assert!(result.is_err());
    }

    #[test]
    fn invalid_combination_names_the_values() {
        let err = expand(&settings(
            "base:\n  dataset_name: FMNIST\n  model_structure: mlp\ngrid:\n  attack.adv_rate: [2.0]\n",
        ))
        .unwrap_err();
        assert!(format!("{:#}", err).contains("attack.adv_rate=2.0"));
    }

    #[test]
    fn scalar_base_blocks_dotted_key() {
        let mut root = Mapping::new();
        root.insert(Value::from("attack"), Value::from("oops"));
        assert!(set_dotted(&mut root, "attack.adv_rate", Value::from(0.1)).is_err());
        assert!(set_dotted(&mut root, "a..b", Value::from(1)).is_err());
    }

    #[test]
    fn write_configs_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let sweep = SweepSettings::builtin().unwrap();
        let first = write_configs(&sweep, None, Some(dir.path())).unwrap();
        let snapshot: Vec<String> = first
            .written
            .iter()
            .map(|p| fs::read_to_string(p).unwrap())
            .collect();
        let second = write_configs(&sweep, None, Some(dir.path())).unwrap();
        assert_eq!(first.written, second.written);
        for (path, before) in second.written.iter().zip(snapshot) {
            assert_eq!(fs::read_to_string(path).unwrap(), before);
        }
    }
}
