// SPDX-License-Identifier: PMPL-1.0-or-later

//! Flattening of per-round JSON records into single-level rows.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

pub type FlatRecord = BTreeMap<String, String>;

/// Nested objects join their keys with `_`; arrays keep their JSON text so
/// seller id lists survive a round trip through a spreadsheet.
pub fn flatten_record(value: &Value) -> FlatRecord {
    let mut out = FlatRecord::new();
    match value {
        Value::Object(map) => flatten_into("", map, &mut out),
        other => {
            out.insert("value".to_string(), render_cell(other));
        }
    }
    out
}

fn flatten_into(prefix: &str, map: &Map<String, Value>, out: &mut FlatRecord) {
    for (key, value) in map {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}_{}", prefix, key)
        };
        match value {
            Value::Object(inner) => flatten_into(&name, inner, out),
            other => {
                out.insert(name, render_cell(other));
            }
        }
    }
}

pub fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Rounds parsed from one `round_logs.jsonl`
#[derive(Debug, Clone, Default)]
pub struct RoundLog {
    pub rows: Vec<FlatRecord>,
    pub malformed_lines: usize,
}

impl RoundLog {
    pub fn last(&self) -> Option<&FlatRecord> {
        self.rows.last()
    }
}

/// Blank lines are ignored; lines that are not JSON objects are counted as
/// malformed and skipped.
pub fn read_round_log(path: &Path) -> Result<RoundLog> {
    let content =
        fs::read_to_string(path).with_context(|| format!("reading round log {}", path.display()))?;
    Ok(parse_round_log(&content, path))
}

fn parse_round_log(content: &str, path: &Path) -> RoundLog {
    let mut log = RoundLog::default();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value @ Value::Object(_)) => log.rows.push(flatten_record(&value)),
            Ok(_) => {
                debug!(path = %path.display(), line = line_no + 1, "round record is not an object");
                log.malformed_lines += 1;
            }
            Err(err) => {
                debug!(path = %path.display(), line = line_no + 1, %err, "unparsable round record");
                log.malformed_lines += 1;
            }
        }
    }
    log
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_objects_join_with_underscore() {
        let flat = flatten_record(&json!({
            "round_number": 3,
            "perf_global": {"accuracy": 0.91, "attack": {"success_rate": 0.4}},
            "selected_sellers": ["bn_1", "adv_0"],
            "outlier_sellers": null,
            "note": "ok"
        }));
        assert_eq!(flat["round_number"], "3");
        assert_eq!(flat["perf_global_accuracy"], "0.91");
        assert_eq!(flat["perf_global_attack_success_rate"], "0.4");
        assert_eq!(flat["selected_sellers"], "[\"bn_1\",\"adv_0\"]");
        assert_eq!(flat["outlier_sellers"], "");
        assert_eq!(flat["note"], "ok");
    }

    #[test]
    fn scalar_record_lands_in_value_column() {
        let flat = flatten_record(&json!(7));
        assert_eq!(flat["value"], "7");
    }

    #[test]
    fn malformed_lines_are_counted() {
        let content = "{\"round_number\":0}\n\nnot json\n[1,2]\n{\"round_number\":1}\n";
        let log = parse_round_log(content, Path::new("round_logs.jsonl"));
        assert_eq!(log.rows.len(), 2);
        assert_eq!(log.malformed_lines, 2);
        assert_eq!(log.last().unwrap()["round_number"], "1");
    }
}
