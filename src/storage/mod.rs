// SPDX-License-Identifier: PMPL-1.0-or-later

//! Persistence helpers for harness artifacts (params, run summaries, batch
//! reports, generated configs).

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
    }
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    fs::write(path, json + "\n").with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let yaml =
        serde_yaml::to_string(value).with_context(|| format!("serializing {}", path.display()))?;
    fs::write(path, yaml).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Remove everything inside `dir` (creating it if needed) so a rerun never
/// mixes with leftovers from an earlier attempt.
pub fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() && !dir.is_dir() {
        anyhow::bail!("{} exists but is not a directory", dir.display());
    }
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("clearing {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("creating directory {}", dir.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reset_dir_drops_stale_files() {
        let dir = TempDir::new().unwrap();
        let run = dir.path().join("run_0");
        fs::create_dir_all(run.join("nested")).unwrap();
        fs::write(run.join("nested/stale.txt"), "old").unwrap();

        reset_dir(&run).unwrap();
        assert!(run.is_dir());
        assert_eq!(fs::read_dir(&run).unwrap().count(), 0);
    }

    #[test]
    fn write_json_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/report.json");
        write_json(&path, &serde_json::json!({"ok": true})).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["ok"], true);
    }
}
