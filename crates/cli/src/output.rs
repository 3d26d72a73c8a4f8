//! Result rendering: aligned text table, pretty JSON or CSV.

use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde_json::Value;

use dbconn_backend::Row;

/// Cells wider than this are cut with `...` in table output.
const MAX_COLUMN_WIDTH: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Csv,
}

pub fn render(rows: &[Row], format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Table => render_table(rows),
        OutputFormat::Json => {
            let mut out = serde_json::to_string_pretty(rows).context("serializing rows")?;
            out.push('\n');
            out
        }
        OutputFormat::Csv => render_csv(rows),
    })
}

/// Write rendered output to `path`, replacing any existing file.
pub fn save(text: &str, path: &Path) -> Result<()> {
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

fn columns(rows: &[Row]) -> Vec<&str> {
    rows.first()
        .map(|row| row.keys().map(String::as_str).collect())
        .unwrap_or_default()
}

fn table_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let kept: String = value.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", kept)
}

pub fn render_table(rows: &[Row]) -> String {
    let headers = columns(rows);
    if headers.is_empty() {
        return "(0 rows)\n".to_string();
    }

    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            headers
                .iter()
                .map(|h| row.get(*h).map(table_cell).unwrap_or_default())
                .collect()
        })
        .collect();

    let widths: Vec<usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            cells
                .iter()
                .map(|r| r[i].chars().count())
                .chain(std::iter::once(h.chars().count()))
                .max()
                .unwrap_or(0)
                .min(MAX_COLUMN_WIDTH)
        })
        .collect();

    let line = |values: &[String]| -> String {
        values
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!("{:<w$}", truncate(v, *w), w = *w))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };
    let separator = widths
        .iter()
        .map(|w| "-".repeat(*w))
        .collect::<Vec<_>>()
        .join("-+-");

    let header_values: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    let mut out = String::new();
    out.push_str(&separator);
    out.push('\n');
    out.push_str(&line(&header_values));
    out.push('\n');
    out.push_str(&separator);
    out.push('\n');
    for row in &cells {
        out.push_str(&line(row));
        out.push('\n');
    }
    out.push_str(&separator);
    out.push('\n');
    out.push_str(&format!(
        "({} row{})\n",
        rows.len(),
        if rows.len() == 1 { "" } else { "s" }
    ));
    out
}

fn csv_field(value: &Value) -> String {
    let raw = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw
    }
}

pub fn render_csv(rows: &[Row]) -> String {
    let headers = columns(rows);
    if headers.is_empty() {
        return String::new();
    }
    let mut out = headers
        .iter()
        .map(|h| csv_field(&Value::String(h.to_string())))
        .collect::<Vec<_>>()
        .join(",");
    out.push('\n');
    for row in rows {
        let line = headers
            .iter()
            .map(|h| row.get(*h).map(csv_field).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Row> {
        let mut a = Row::new();
        a.insert("id".into(), json!(1));
        a.insert("name".into(), json!("alice, \"al\""));
        a.insert("note".into(), Value::Null);
        let mut b = Row::new();
        b.insert("id".into(), json!(22));
        b.insert("name".into(), json!("x".repeat(60)));
        b.insert("note".into(), json!(true));
        vec![a, b]
    }

    #[test]
    fn test_table_aligns_and_truncates() {
        let table = render_table(&rows());
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines[1], format!("id | {:<50} | note", "name"));
        assert!(lines[3].starts_with("1  | alice"));
        assert!(lines[3].ends_with("| NULL"));
        assert!(lines[4].contains(&format!("{}...", "x".repeat(47))));
        assert_eq!(lines.last().copied(), Some("(2 rows)"));
    }

    #[test]
    fn test_empty_results() {
        assert_eq!(render_table(&[]), "(0 rows)\n");
        assert_eq!(render_csv(&[]), "");
        assert_eq!(render(&[], OutputFormat::Json).unwrap(), "[]\n");
    }

    #[test]
    fn test_csv_quotes_special_characters() {
        let csv = render_csv(&rows());
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines[0], "id,name,note");
        assert_eq!(lines[1], "1,\"alice, \"\"al\"\"\",");
        assert!(lines[2].ends_with(",true"));
    }

    #[test]
    fn test_json_keeps_column_order() {
        let json = render(&rows()[..1], OutputFormat::Json).unwrap();
        let id = json.find("\"id\"").unwrap();
        let name = json.find("\"name\"").unwrap();
        assert!(id < name);
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["note"], Value::Null);
    }

    #[test]
    fn test_save_writes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.csv");
        save("a\n1\n", &path).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "a\n1\n");
    }
}
