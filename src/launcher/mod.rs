//! Multi-run training launchers.
//!
//! A [`RunMatrix`] is an ordered list of training runs that share a model and
//! a summary CSV. The [`Supervisor`] runs them one after another through the
//! PaddleDetection training entry point, records results and skips runs that
//! already finished.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub mod command;
pub mod metrics;
pub mod summary;
pub mod supervisor;

pub use command::{eval_command, train_command, CommandLine};
pub use metrics::{extract_metrics, RunMetrics};
pub use summary::{append_summary, read_summary, render_summary_table, SummaryRow};
pub use supervisor::{PlanStatus, PlannedRun, RunOutcome, RunRecord, Supervisor};

/// One training run of a matrix.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RunSpec {
    /// Short id used by `--from`, e.g. `Y3`.
    pub id: String,
    /// Directory name under `output/`.
    pub name: String,
    /// Training config, relative to the PaddleDetection root.
    pub config: String,
    /// Comma separated device list, exported as `CUDA_VISIBLE_DEVICES`.
    pub gpus: String,
    #[serde(default)]
    pub distributed: bool,
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default)]
    pub desc: String,
}

fn default_dataset() -> String {
    "full".to_string()
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RunMatrix {
    pub title: String,
    /// Model tag written to the summary CSV.
    pub model: String,
    /// Summary CSV, relative to the PaddleDetection root.
    pub summary_file: PathBuf,
    /// File that must exist before any run starts, e.g. a prepared train list.
    #[serde(default)]
    pub prerequisite: Option<PathBuf>,
    pub runs: Vec<RunSpec>,
}

impl RunMatrix {
    /// YOLOv3-MobileNetV1: 1/3 vs full data, one vs two cards.
    pub fn yolov3() -> Self {
        let run = |id: &str, name: &str, gpus: &str, dataset: &str, desc: &str| RunSpec {
            id: id.to_string(),
            name: name.to_string(),
            config: format!("configs/yolov3/runs/{name}.yml"),
            gpus: gpus.to_string(),
            distributed: gpus.contains(','),
            dataset: dataset.to_string(),
            desc: desc.to_string(),
        };
        Self {
            title: "YOLOv3-MobileNetV1".to_string(),
            model: "yolov3_mobilenetv1".to_string(),
            summary_file: PathBuf::from("output/yolov3_summary.csv"),
            prerequisite: Some(PathBuf::from("dataset/mouse_other_voc_1of3/train.txt")),
            runs: vec![
                run(
                    "Y1",
                    "Y1_yolov3_1of3_1gpu",
                    "0",
                    "1of3",
                    "1/3 data, 1 gpu, lr=0.00125, 80e (baseline)",
                ),
                run(
                    "Y2",
                    "Y2_yolov3_1of3_2gpu",
                    "0,1",
                    "1of3",
                    "1/3 data, 2 gpu, lr=0.0025, 80e",
                ),
                run(
                    "Y3",
                    "Y3_yolov3_full_1gpu",
                    "0",
                    "full",
                    "full data, 1 gpu, lr=0.00125, 80e",
                ),
                run(
                    "Y4",
                    "Y4_yolov3_full_2gpu",
                    "0,1",
                    "full",
                    "full data, 2 gpu, lr=0.0025, 80e",
                ),
            ],
        }
    }

    /// PicoDet-S on the full dataset: cards, batch size and schedule length.
    pub fn lightweight() -> Self {
        let run = |id: &str, name: &str, gpus: &str, desc: &str| RunSpec {
            id: id.to_string(),
            name: name.to_string(),
            config: format!("configs/picodet/runs/{name}.yml"),
            gpus: gpus.to_string(),
            distributed: gpus.contains(','),
            dataset: default_dataset(),
            desc: desc.to_string(),
        };
        Self {
            title: "PicoDet-S".to_string(),
            model: "picodet_s_320".to_string(),
            summary_file: PathBuf::from("output/lightweight_summary.csv"),
            prerequisite: None,
            runs: vec![
                run("L1", "L1_picodet_1gpu", "0", "1 gpu, bs=32, lr=0.08, 300e"),
                run(
                    "L2",
                    "L2_picodet_2gpu",
                    "0,1",
                    "2 gpu, bs=64, lr=0.16, 300e (reference)",
                ),
                run(
                    "L3",
                    "L3_picodet_bs96",
                    "0,1",
                    "2 gpu, bs=96, lr=0.24, 300e (large batch)",
                ),
                run(
                    "L4",
                    "L4_picodet_600e",
                    "0,1",
                    "2 gpu, bs=64, lr=0.16, 600e (long schedule)",
                ),
            ],
        }
    }

    /// Looks up a built-in matrix by name.
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "yolov3" => Some(Self::yolov3()),
            "lightweight" | "picodet" => Some(Self::lightweight()),
            _ => None,
        }
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read run plan {}", path.display()))?;
        let matrix: Self = toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid run plan {}: {}", path.display(), e))?;
        matrix.validate()?;
        Ok(matrix)
    }

    pub fn validate(&self) -> Result<()> {
        if self.runs.is_empty() {
            return Err(anyhow!("run plan '{}' has no runs", self.title));
        }
        let mut seen = std::collections::HashSet::new();
        for run in &self.runs {
            if run.id.trim().is_empty() || run.name.trim().is_empty() {
                return Err(anyhow!("every run needs an id and a name"));
            }
            if run.name.contains(['/', '\\']) || run.name == ".." {
                return Err(anyhow!("run name '{}' must be a plain directory name", run.name));
            }
            if !seen.insert(run.id.as_str()) {
                return Err(anyhow!("duplicate run id '{}'", run.id));
            }
        }
        Ok(())
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.runs.iter().position(|run| run.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.runs.iter().map(|run| run.id.as_str()).collect()
    }
}
