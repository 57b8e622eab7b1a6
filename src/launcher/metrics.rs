//! Scrapes the two numbers a training run reports: best bbox AP and eval FPS.

use anyhow::{Context, Result};
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RunMetrics {
    /// Best validation bbox AP as reported (a fraction, e.g. `0.8123`).
    pub best_ap: Option<f64>,
    pub fps: Option<f64>,
}

impl RunMetrics {
    /// Best AP as a percentage with two decimals.
    pub fn best_map(&self) -> Option<f64> {
        self.best_ap.map(|ap| (ap * 100.0 * 100.0).round() / 100.0)
    }

    /// Feeds one chunk of log text; later matches replace earlier ones.
    pub fn scan(&mut self, text: &str) {
        static BEST_AP_RE: OnceLock<Regex> = OnceLock::new();
        static FPS_RE: OnceLock<Regex> = OnceLock::new();
        let best_ap_re = BEST_AP_RE
            .get_or_init(|| Regex::new(r"Best test bbox ap is (\d+\.\d+)").unwrap());
        let fps_re = FPS_RE.get_or_init(|| Regex::new(r"average FPS: ([\d.]+)").unwrap());

        for line in text.lines() {
            if let Some(value) = first_capture(best_ap_re, line) {
                self.best_ap = Some(value);
            }
            if let Some(value) = first_capture(fps_re, line) {
                self.fps = Some(value);
            }
        }
    }
}

fn first_capture(re: &Regex, line: &str) -> Option<f64> {
    re.captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Scans each existing candidate log in order.
///
/// Single-card runs log into the run's `train.log`; distributed runs write the
/// interesting lines to `log/workerlog.0`, so both are usually passed.
/// Missing files are skipped and invalid UTF-8 is replaced.
pub fn extract_metrics(candidates: &[PathBuf]) -> Result<RunMetrics> {
    let mut metrics = RunMetrics::default();
    for path in candidates {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        metrics.scan(&String::from_utf8_lossy(&bytes));
    }
    Ok(metrics)
}
