// SPDX-License-Identifier: PMPL-1.0-or-later

//! Environment setup: prepare the working directories and check that the
//! attack backend's interpreter can be launched.

use crate::batch::BATCH_REPORT_FILE;
use crate::generate::{DEFAULT_OUTPUT_DIR, DEFAULT_SETTINGS_FILE};
use crate::types::{DEFAULT_RUNNER_PROGRAM, DEFAULT_SAVE_PATH_BASE};
use anyhow::{anyhow, Result};
use colored::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const DEFAULT_RESULTS_DIR: &str = "./results";
pub const DEFAULT_LOGS_DIR: &str = "logs";

/// Options for `setup`
pub struct SetupConfig {
    /// Root the working directories are created under
    pub root: PathBuf,
    /// Interpreter the attack backend runs on
    pub runner: String,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            runner: DEFAULT_RUNNER_PROGRAM.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Ok,
    Warn,
    Error,
}

impl Level {
    fn tag(&self) -> ColoredString {
        match self {
            Level::Ok => "OK".green(),
            Level::Warn => "WARN".yellow(),
            Level::Error => "ERR".red(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub label: &'static str,
    pub level: Level,
    pub detail: String,
}

impl Diagnostic {
    fn new(label: &'static str, level: Level, detail: String) -> Self {
        Self {
            label,
            level,
            detail,
        }
    }

    fn ok(label: &'static str, detail: String) -> Self {
        Self::new(label, Level::Ok, detail)
    }

    fn warning(label: &'static str, detail: String) -> Self {
        Self::new(label, Level::Warn, detail)
    }

    fn error(label: &'static str, detail: String) -> Self {
        Self::new(label, Level::Error, detail)
    }

    fn print(&self) {
        println!("  [{}] {:22} {}", self.level.tag(), self.label, self.detail);
    }
}

/// Run every check without printing
pub fn check_environment(config: &SetupConfig) -> Vec<Diagnostic> {
    let mut checks = vec![Diagnostic::ok(
        "version",
        format!("market-attack {}", env!("CARGO_PKG_VERSION")),
    )];

    checks.push(ensure_directory(
        "config directory",
        &config.root.join(DEFAULT_OUTPUT_DIR),
    ));
    checks.push(ensure_directory(
        "raw log directory",
        &config.root.join(DEFAULT_SAVE_PATH_BASE),
    ));
    checks.push(ensure_directory(
        "results directory",
        &config.root.join(DEFAULT_RESULTS_DIR),
    ));
    checks.push(ensure_directory(
        "batch log directory",
        &config.root.join(DEFAULT_LOGS_DIR),
    ));
    checks.push(check_settings(&config.root.join(DEFAULT_SETTINGS_FILE)));
    checks.push(check_runner(&config.runner));
    checks
}

/// `setup`: print the checks and fail if any of them is an error
pub fn run_setup(config: &SetupConfig) -> Result<Vec<Diagnostic>> {
    println!("market-attack environment setup");
    println!();

    let checks = check_environment(config);
    for entry in &checks {
        entry.print();
    }
    println!();

    if checks.iter().any(|entry| entry.level == Level::Error) {
        Err(anyhow!("environment setup reported errors"))
    } else {
        println!(
            "  Batch reports will be written as {} under {}/",
            BATCH_REPORT_FILE, DEFAULT_LOGS_DIR
        );
        Ok(checks)
    }
}

fn ensure_directory(label: &'static str, path: &Path) -> Diagnostic {
    if path.is_dir() {
        Diagnostic::ok(label, format!("{} exists", path.display()))
    } else if path.exists() {
        Diagnostic::error(
            label,
            format!("{} exists but is not a directory", path.display()),
        )
    } else {
        match fs::create_dir_all(path) {
            Ok(()) => Diagnostic::ok(label, format!("created {}", path.display())),
            Err(err) => Diagnostic::error(
                label,
                format!("cannot create {}: {}", path.display(), err),
            ),
        }
    }
}

fn check_settings(path: &Path) -> Diagnostic {
    if path.is_file() {
        match crate::generate::SweepSettings::load(path) {
            Ok(settings) => Diagnostic::ok(
                "sweep settings",
                format!("{} ({} grid keys)", path.display(), settings.grid.len()),
            ),
            Err(err) => Diagnostic::error("sweep settings", format!("{:#}", err)),
        }
    } else {
        Diagnostic::warning(
            "sweep settings",
            format!(
                "{} missing (gen-configs will use the built-in sweep)",
                path.display()
            ),
        )
    }
}

fn check_runner(program: &str) -> Diagnostic {
    let output = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .output();
    match output {
        Ok(output) if output.status.success() => {
            // Older interpreters print their version on stderr
            let text = if output.stdout.is_empty() {
                String::from_utf8_lossy(&output.stderr).trim().to_string()
            } else {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            };
            Diagnostic::ok("backend interpreter", format!("{} ({})", program, text))
        }
        Ok(output) => Diagnostic::error(
            "backend interpreter",
            format!("{} --version exited with {}", program, output.status),
        ),
        Err(err) => Diagnostic::error(
            "backend interpreter",
            format!("cannot launch {}: {}", program, err),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_working_directories() {
        let dir = TempDir::new().unwrap();
        let config = SetupConfig {
            root: dir.path().to_path_buf(),
            runner: "sh".to_string(),
        };
        let checks = check_environment(&config);
        assert!(dir.path().join("configs").is_dir());
        assert!(dir.path().join("experiment_result").is_dir());
        assert!(dir.path().join("results").is_dir());
        assert!(dir.path().join("logs").is_dir());
        let settings = checks.iter().find(|c| c.label == "sweep settings").unwrap();
        assert_eq!(settings.level, Level::Warn);
    }

    #[test]
    fn file_in_place_of_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("results"), "not a dir").unwrap();
        let config = SetupConfig {
            root: dir.path().to_path_buf(),
            runner: "sh".to_string(),
        };
        let checks = check_environment(&config);
        let results = checks
            .iter()
            .find(|c| c.label == "results directory")
            .unwrap();
        assert_eq!(results.level, Level::Error);
        assert!(run_setup(&config).is_err());
    }

    #[test]
    fn missing_interpreter_is_an_error() {
        let check = check_runner("definitely-not-a-real-interpreter-xyz");
        assert_eq!(check.level, Level::Error);
    }
}
