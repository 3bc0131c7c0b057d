// SPDX-License-Identifier: PMPL-1.0-or-later

//! Minimal CSV emitter: header row, `\n` line endings, quoting only where a
//! field needs it.

use super::flatten::FlatRecord;
use anyhow::{Context, Result};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

pub fn escape_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

pub fn render_table(header: &[String], rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    push_row(&mut out, header);
    for row in rows {
        push_row(&mut out, row);
    }
    out
}

fn push_row(out: &mut String, fields: &[String]) {
    for (index, field) in fields.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push_str(&escape_field(field));
    }
    out.push('\n');
}

/// `leading` columns that occur in any record come first, in the given order;
/// every other key follows in sorted order.
pub fn ordered_columns(records: &[FlatRecord], leading: &[&str]) -> Vec<String> {
    let mut rest: BTreeSet<&str> = BTreeSet::new();
    for record in records {
        rest.extend(record.keys().map(String::as_str));
    }

    let mut columns: Vec<String> = leading
        .iter()
        .filter(|name| rest.contains(*name))
        .map(|name| name.to_string())
        .collect();
    for name in leading {
        rest.remove(name);
    }
    columns.extend(rest.into_iter().map(str::to_string));
    columns
}

/// Write records as a table; a record missing a column gets an empty cell.
pub fn write_records(path: &Path, records: &[FlatRecord], leading: &[&str]) -> Result<()> {
    let columns = ordered_columns(records, leading);
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|record| {
            columns
                .iter()
                .map(|column| record.get(column).cloned().unwrap_or_default())
                .collect()
        })
        .collect();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    fs::write(path, render_table(&columns, &rows))
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> FlatRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn leading_columns_first_then_sorted() {
        let records = vec![
            record(&[("zeta", "1"), ("round_number", "0")]),
            record(&[("alpha", "2"), ("run", "0")]),
        ];
        let columns = ordered_columns(&records, &["run", "seed", "round_number"]);
        assert_eq!(columns, vec!["run", "round_number", "alpha", "zeta"]);
    }

    #[test]
    fn renders_missing_cells_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/out.csv");
        let records = vec![record(&[("a", "1")]), record(&[("b", "x,y")])];
        write_records(&path, &records, &[]).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "a,b\n1,\n,\"x,y\"\n");
    }
}
