// SPDX-License-Identifier: PMPL-1.0-or-later

//! Child process execution with an optional deadline.
//!
//! Output goes straight to files rather than pipes, so a chatty child can
//! never stall on a full pipe while we poll for its exit. On Unix every
//! child leads its own process group and a deadline kills the whole group,
//! so nothing the child spawned outlives it.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A fully resolved command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Run to completion, killing the child and its descendants once `timeout`
/// elapses. Spawn failures are errors; a non-zero exit is not.
pub fn run_with_deadline(
    invocation: &Invocation,
    stdout: File,
    stderr: File,
    timeout: Option<Duration>,
) -> Result<ProcessOutcome> {
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .envs(invocation.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to launch `{}`", invocation.program))?;

    let start = Instant::now();
    let (status, timed_out) = match timeout {
        None => (child.wait()?, false),
        Some(limit) => loop {
            if let Some(status) = child.try_wait()? {
                break (status, false);
            }
            if start.elapsed() >= limit {
                kill_tree(&mut child);
                break (child.wait()?, true);
            }
            thread::sleep(POLL_INTERVAL);
        },
    };

    Ok(ProcessOutcome {
        exit_code: status.code(),
        success: status.success() && !timed_out,
        timed_out,
        duration: start.elapsed(),
    })
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let killed = i32::try_from(child.id())
        .ok()
        .map(|pid| killpg(Pid::from_raw(pid), Signal::SIGKILL));
    if !matches!(killed, Some(Ok(()))) {
        debug!(pid = child.id(), "process group kill failed, killing child only");
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

/// Same as [`run_with_deadline`] with stdout and stderr interleaved in one file.
pub fn run_logged(
    invocation: &Invocation,
    log_path: &Path,
    timeout: Option<Duration>,
) -> Result<ProcessOutcome> {
    let log = File::create(log_path)
        .with_context(|| format!("creating log file {}", log_path.display()))?;
    let stderr = log
        .try_clone()
        .with_context(|| format!("duplicating handle for {}", log_path.display()))?;
    run_with_deadline(invocation, log, stderr, timeout)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sh(script: &str) -> Invocation {
        Invocation::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn captures_output_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("out.log");
        let outcome = run_logged(&sh("echo hello; echo oops >&2; exit 3"), &log, None).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        let content = fs::read_to_string(&log).unwrap();
        assert!(content.contains("hello"));
        assert!(content.contains("oops"));
    }

    #[test]
    fn passes_environment() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("env.log");
        let invocation = sh("echo \"$MARKET_ATTACK_SEED\"").env("MARKET_ATTACK_SEED", "43");
        let outcome = run_logged(&invocation, &log, None).unwrap();
        assert!(outcome.success);
        assert_eq!(fs::read_to_string(&log).unwrap().trim(), "43");
    }

    #[test]
    fn kills_on_deadline() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("slow.log");
        let outcome =
            run_logged(&sh("sleep 5"), &log, Some(Duration::from_millis(200))).unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success);
        assert!(outcome.duration < Duration::from_secs(5));
    }

    #[test]
    fn deadline_reaches_grandchildren() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("tree.log");
        let marker = dir.path().join("marker");
        // The inner shell backgrounds a writer that would outlive a plain kill
        let script = format!(
            "sh -c 'sleep 1; touch {}' & wait",
            marker.display()
        );
        let outcome = run_logged(&sh(&script), &log, Some(Duration::from_millis(200))).unwrap();
        assert!(outcome.timed_out);
        thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists());
    }

    #[test]
    fn missing_program_is_an_error() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("missing.log");
        let invocation = Invocation::new("definitely-not-a-real-binary-xyz", Vec::new());
        assert!(run_logged(&invocation, &log, None).is_err());
    }
}
