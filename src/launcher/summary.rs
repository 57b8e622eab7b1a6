//! The per-matrix results CSV.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::path::Path;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SummaryRow {
    pub run_id: String,
    pub name: String,
    pub model: String,
    pub dataset: String,
    #[serde(serialize_with = "title_bool", deserialize_with = "loose_bool")]
    pub distributed: bool,
    pub desc: String,
    #[serde(rename = "best_mAP_50")]
    pub best_map_50: Option<f64>,
    #[serde(rename = "eval_FPS")]
    pub eval_fps: Option<f64>,
    pub train_duration_h: f64,
    pub exit_code: i32,
    pub timestamp: String,
}

fn title_bool<S: Serializer>(value: &bool, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(if *value { "True" } else { "False" })
}

fn loose_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let raw = String::deserialize(d)?;
    Ok(matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1"))
}

/// Appends one row, writing the header first when the file is new.
pub fn append_summary(path: &Path, row: &SummaryRow) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let write_header = !path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(write_header)
        .from_writer(file);
    writer.serialize(row)?;
    writer.flush()?;
    Ok(())
}

pub fn read_summary(path: &Path) -> Result<Vec<SummaryRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row.with_context(|| format!("malformed row in {}", path.display()))?);
    }
    Ok(rows)
}

/// Fixed-width comparison table: run, dataset, cards, mAP, FPS, hours.
pub fn render_summary_table(rows: &[SummaryRow]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<6} {:>6} {:>6} {:>8} {:>7} {:>8}",
        "run", "data", "cards", "mAP@0.5", "FPS", "hours"
    );
    let _ = writeln!(out, "{}", "-".repeat(64));
    for row in rows {
        let cards = if row.distributed { "multi" } else { "single" };
        let map = row
            .best_map_50
            .map(|v| format!("{v:.2}"))
            .unwrap_or_default();
        let fps = row.eval_fps.map(|v| format!("{v}")).unwrap_or_default();
        let _ = writeln!(
            out,
            "{:<6} {:>6} {:>6} {:>7}% {:>7} {:>8}",
            row.run_id, row.dataset, cards, map, fps, row.train_duration_h
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(id: &str, map: Option<f64>) -> SummaryRow {
        SummaryRow {
            run_id: id.to_string(),
            name: format!("{id}_run"),
            model: "picodet_s_320".to_string(),
            dataset: "full".to_string(),
            distributed: id != "L1",
            desc: "2 gpu, bs=64, lr=0.16, 300e".to_string(),
            best_map_50: map,
            eval_fps: None,
            train_duration_h: 1.25,
            exit_code: 0,
            timestamp: "2024-05-01 10:00:00".to_string(),
        }
    }

    #[test]
    fn header_is_written_once() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("output").join("summary.csv");
        append_summary(&path, &row("L1", Some(80.5)))?;
        append_summary(&path, &row("L2", None))?;

        let raw = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "run_id,name,model,dataset,distributed,desc,best_mAP_50,eval_FPS,train_duration_h,exit_code,timestamp"
        );
        assert!(lines[1].starts_with("L1,L1_run,picodet_s_320,full,False,"));
        assert!(lines[2].contains(",True,\"2 gpu, bs=64, lr=0.16, 300e\",,,1.25,0,"));

        let rows = read_summary(&path)?;
        assert_eq!(rows, vec![row("L1", Some(80.5)), row("L2", None)]);
        Ok(())
    }

    #[test]
    fn table_marks_cards_and_missing_values() {
        let table = render_summary_table(&[row("L1", Some(80.5)), row("L2", None)]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[2].contains("single"));
        assert!(lines[2].contains("80.50%"));
        assert!(lines[3].contains("multi"));
    }
}
