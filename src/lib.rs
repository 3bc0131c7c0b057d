// SPDX-License-Identifier: PMPL-1.0-or-later

//! market-attack: experiment harness for data-marketplace poisoning attacks.
//!
//! The crate drives an external attack backend over a sweep of experiment
//! configurations and turns its per-round logs into CSV tables.
//!
//! STAGES:
//! 1. **Setup**: prepare working directories and probe the backend interpreter.
//! 2. **Generate**: expand a sweep grid into one YAML config per experiment.
//! 3. **Attack**: run one config for `n_samples` seeded runs.
//! 4. **Batch**: run a whole config tree on a bounded worker pool.
//! 5. **Post-process**: flatten round logs into per-experiment and summary CSVs.

pub mod attack;
pub mod batch;
pub mod diagnostics;
pub mod experiment;
pub mod generate;
pub mod logging;
pub mod postprocess;
pub mod process;
pub mod storage;
pub mod types;
