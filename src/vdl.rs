//! VisualDL to TensorBoard conversion for training runs.
//!
//! Every run logs scalars to `output/<name>/vdl_log/vdlrecords.*`. The
//! records are read by `visualdl` and rewritten as TensorBoard events in a
//! sibling `tb_log/` by a small Python driver.

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;

use crate::launcher::CommandLine;

const DRIVER_SCRIPT: &str = include_str!("../assets/vdl_driver.py");
const VDL_DIR: &str = "vdl_log";
const TB_DIR: &str = "tb_log";
const RECORD_PREFIX: &str = "vdlrecords.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertOutcome {
    Converted { tb_dir: PathBuf, points: u64 },
    /// No `vdlrecords.*` in the directory.
    Skipped,
}

/// `<run>/vdl_log` for every run directory under `output_root`.
pub fn find_vdl_dirs(output_root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(output_root)
        .with_context(|| format!("failed to read {}", output_root.display()))?
    {
        let vdl = entry?.path().join(VDL_DIR);
        if vdl.is_dir() {
            dirs.push(vdl);
        }
    }
    dirs.sort();
    Ok(dirs)
}

pub fn vdl_records(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut records = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_file()
            && entry.file_name().to_string_lossy().starts_with(RECORD_PREFIX)
        {
            records.push(entry.path());
        }
    }
    records.sort();
    Ok(records)
}

pub fn tb_dir(vdl_dir: &Path) -> PathBuf {
    match vdl_dir.parent() {
        Some(parent) => parent.join(TB_DIR),
        None => PathBuf::from(TB_DIR),
    }
}

fn parse_points(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix("points:"))
        .and_then(|n| n.trim().parse().ok())
}

pub struct Converter {
    python: String,
    driver: PathBuf,
    _scratch: Option<TempDir>,
}

impl Converter {
    /// Writes the bundled driver to a scratch directory.
    pub fn new(python: impl Into<String>) -> Result<Self> {
        let scratch = tempfile::tempdir()?;
        let driver = scratch.path().join("vdl_driver.py");
        std::fs::write(&driver, DRIVER_SCRIPT)
            .with_context(|| format!("failed to write {}", driver.display()))?;
        Ok(Self {
            python: python.into(),
            driver,
            _scratch: Some(scratch),
        })
    }

    /// Uses an existing driver script instead of the bundled one.
    pub fn with_driver(python: impl Into<String>, driver: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            driver: driver.into(),
            _scratch: None,
        }
    }

    pub fn command(&self, tb_dir: &Path, records: &[PathBuf]) -> CommandLine {
        CommandLine::new(self.python.as_str())
            .arg(self.driver.display().to_string())
            .arg(tb_dir.display().to_string())
            .args(records.iter().map(|r| r.display().to_string()))
    }

    pub fn convert(&self, vdl_dir: &Path) -> Result<ConvertOutcome> {
        let records = vdl_records(vdl_dir)?;
        if records.is_empty() {
            log::warn!("no vdlrecords found in {}", vdl_dir.display());
            return Ok(ConvertOutcome::Skipped);
        }
        let tb_dir = tb_dir(vdl_dir);
        std::fs::create_dir_all(&tb_dir)
            .with_context(|| format!("failed to create {}", tb_dir.display()))?;

        let cmd = self.command(&tb_dir, &records);
        log::debug!("running {}", cmd);
        let cwd = std::env::current_dir()?;
        let output = cmd
            .to_command(&cwd)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .with_context(|| format!("failed to start {}", self.python))?;
        if !output.status.success() {
            bail!(
                "conversion of {} failed ({})",
                vdl_dir.display(),
                output.status
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let points = parse_points(&stdout)
            .ok_or_else(|| anyhow!("driver reported no point count for {}", vdl_dir.display()))?;
        Ok(ConvertOutcome::Converted { tb_dir, points })
    }
}
