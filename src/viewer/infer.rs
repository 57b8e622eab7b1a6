//! Background `tools/infer.py` jobs started from the browser.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::Workspace;
use crate::launcher::CommandLine;

/// Form fields posted by the UI. Empty strings count as unset.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InferParams {
    pub config: String,
    pub weights: Option<String>,
    /// Space separated `key=value` overrides appended after `-o`.
    pub extra_opts: Option<String>,
    pub infer_img: Option<String>,
    pub infer_dir: Option<String>,
    pub output_dir: Option<String>,
    pub draw_threshold: Option<Value>,
    pub slim_config: Option<String>,
    pub save_results: Option<Value>,
    pub slice_infer: Option<Value>,
    pub slice_size: Option<String>,
    pub overlap_ratio: Option<String>,
    pub combine_method: Option<String>,
    pub match_threshold: Option<Value>,
    pub match_metric: Option<String>,
    pub visualize: Option<Value>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn truthy(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// Scalar rendered as a command-line argument, if set.
fn scalar_arg(value: &Option<Value>) -> Option<String> {
    if !truthy(value) {
        return None;
    }
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
        None => None,
    }
}

fn visualize_disabled(value: &Option<Value>) -> bool {
    matches!(value, Some(Value::Bool(false)))
        || matches!(value, Some(Value::String(s)) if s == "false")
}

impl InferParams {
    /// The `tools/infer.py` invocation and the directory results land in.
    pub fn command(&self, python: &str, default_output: &Path) -> Result<(CommandLine, PathBuf)> {
        let config = self.config.trim();
        if config.is_empty() {
            return Err(anyhow!("config is required"));
        }
        let mut cmd = CommandLine::new(python).args(["tools/infer.py", "-c", config]);

        let mut opts = Vec::new();
        if let Some(weights) = non_empty(&self.weights) {
            opts.push(format!("weights={weights}"));
        }
        if let Some(extra) = non_empty(&self.extra_opts) {
            opts.extend(extra.split_whitespace().map(str::to_string));
        }
        if !opts.is_empty() {
            cmd = cmd.arg("-o").args(opts);
        }

        if let Some(img) = non_empty(&self.infer_img) {
            cmd = cmd.args(["--infer_img", img]);
        } else if let Some(dir) = non_empty(&self.infer_dir) {
            cmd = cmd.args(["--infer_dir", dir]);
        }

        let output_dir = match non_empty(&self.output_dir) {
            Some(dir) => PathBuf::from(dir),
            None => default_output.to_path_buf(),
        };
        cmd = cmd
            .arg("--output_dir")
            .arg(output_dir.to_string_lossy().into_owned());

        if let Some(threshold) = scalar_arg(&self.draw_threshold) {
            cmd = cmd.arg("--draw_threshold").arg(threshold);
        }
        if let Some(slim) = non_empty(&self.slim_config) {
            cmd = cmd.args(["--slim_config", slim]);
        }
        if truthy(&self.save_results) {
            cmd = cmd.args(["--save_results", "True"]);
        }
        if truthy(&self.slice_infer) {
            cmd = cmd.arg("--slice_infer");
            if let Some(size) = non_empty(&self.slice_size) {
                cmd = cmd.arg("--slice_size").args(size.split_whitespace());
            }
            if let Some(ratio) = non_empty(&self.overlap_ratio) {
                cmd = cmd.arg("--overlap_ratio").args(ratio.split_whitespace());
            }
            if let Some(method) = non_empty(&self.combine_method) {
                cmd = cmd.args(["--combine_method", method]);
            }
            if let Some(threshold) = scalar_arg(&self.match_threshold) {
                cmd = cmd.arg("--match_threshold").arg(threshold);
            }
            if let Some(metric) = non_empty(&self.match_metric) {
                cmd = cmd.args(["--match_metric", metric]);
            }
        }
        if visualize_disabled(&self.visualize) {
            cmd = cmd.args(["--visualize", "False"]);
        }
        Ok((cmd, output_dir))
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct InferStatus {
    pub running: bool,
    pub log: String,
    pub result_image: Option<String>,
    pub exit_code: Option<i32>,
}

/// At most one inference at a time; the status is shared with the HTTP thread.
#[derive(Debug, Clone)]
pub struct InferJob {
    workspace: Workspace,
    python: String,
    state: Arc<Mutex<InferStatus>>,
}

impl InferJob {
    pub fn new(workspace: Workspace, python: impl Into<String>) -> Self {
        Self {
            workspace,
            python: python.into(),
            state: Arc::new(Mutex::new(InferStatus::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InferStatus> {
        lock_status(&self.state)
    }

    pub fn status(&self) -> InferStatus {
        self.lock().clone()
    }

    pub fn result_image(&self) -> Option<PathBuf> {
        self.lock().result_image.as_ref().map(PathBuf::from)
    }

    /// Clears the previous results and starts `params` on a worker thread.
    ///
    /// Fails without side effects while another inference is running.
    pub fn start(&self, params: InferParams) -> Result<()> {
        let default_output = self.workspace.infer_output_dir();
        {
            let mut status = self.lock();
            if status.running {
                return Err(anyhow!("inference already running, wait for it to finish"));
            }
            *status = InferStatus {
                running: true,
                log: "Starting inference...\n".to_string(),
                result_image: None,
                exit_code: None,
            };
        }
        clear_directory(&default_output);

        let job = self.clone();
        let spawned = std::thread::Builder::new()
            .name("infer-job".to_string())
            .spawn(move || {
                job.run(&params, &default_output);
                job.lock().running = false;
            });
        if let Err(err) = spawned {
            let mut status = self.lock();
            status.running = false;
            status.exit_code = Some(-1);
            status.log.push_str(&format!("\n[ERROR] {err}\n"));
            return Err(err.into());
        }
        Ok(())
    }

    fn run(&self, params: &InferParams, default_output: &Path) {
        let (cmd, output_dir) = match params.command(&self.python, default_output) {
            Ok(built) => built,
            Err(err) => {
                self.fail(&err.to_string());
                return;
            }
        };
        self.lock().log.push_str(&format!("CMD: {cmd}\n\n"));
        log::info!("inference: {}", cmd);

        let mut child = match cmd
            .to_command(self.workspace.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                self.fail(&format!("failed to start {}: {}", cmd.program, err));
                return;
            }
        };

        let readers: Vec<_> = [
            child.stdout.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
            child.stderr.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
        ]
        .into_iter()
        .flatten()
        .map(|stream| {
            let state = self.state.clone();
            std::thread::spawn(move || pump_lines(stream, &state))
        })
        .collect();
        for reader in readers {
            let _ = reader.join();
        }

        let status = match child.wait() {
            Ok(status) => status,
            Err(err) => {
                self.fail(&err.to_string());
                return;
            }
        };
        let code = status.code().unwrap_or(-1);
        let output_dir = if output_dir.is_absolute() {
            output_dir
        } else {
            self.workspace.root().join(output_dir)
        };
        let mut state = self.lock();
        state.exit_code = Some(code);
        state.log.push_str(&format!("\n[Exit code: {code}]\n"));
        if code == 0 {
            state.result_image = newest_image(&output_dir).map(|p| p.display().to_string());
        }
    }

    fn fail(&self, message: &str) {
        log::warn!("inference failed: {}", message);
        let mut status = self.lock();
        status.log.push_str(&format!("\n[ERROR] {message}\n"));
        status.exit_code = Some(-1);
    }
}

fn lock_status(state: &Mutex<InferStatus>) -> MutexGuard<'_, InferStatus> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn pump_lines(stream: Box<dyn Read + Send>, state: &Mutex<InferStatus>) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => lock_status(state)
                .log
                .push_str(&String::from_utf8_lossy(&line)),
            Err(err) => {
                log::debug!("inference output closed: {}", err);
                break;
            }
        }
    }
}

/// Removes the plain files in `dir`; subdirectories are left alone.
fn clear_directory(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            if let Err(err) = std::fs::remove_file(&path) {
                log::debug!("could not remove {}: {}", path.display(), err);
            }
        }
    }
}

/// Most recently modified `.jpg` or `.png` directly inside `dir`.
pub fn newest_image(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("jpg") | Some("png")
            )
        })
        .filter_map(|path| {
            let modified = path.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, path))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> InferParams {
        serde_json::from_value(value).expect("params")
    }

    #[test]
    fn minimal_command_uses_default_output() -> Result<()> {
        let p = params(json!({"config": "configs/picodet/picodet_s_320_coco_lcnet.yml"}));
        let (cmd, out) = p.command("python3", Path::new("/ws/output/_web_infer_vis"))?;
        assert_eq!(
            cmd.to_string(),
            "python3 tools/infer.py -c configs/picodet/picodet_s_320_coco_lcnet.yml \
             --output_dir /ws/output/_web_infer_vis"
        );
        assert_eq!(out, PathBuf::from("/ws/output/_web_infer_vis"));
        Ok(())
    }

    #[test]
    fn full_command_keeps_argument_order() -> Result<()> {
        let p = params(json!({
            "config": "c.yml",
            "weights": "output/L1/best_model.pdparams",
            "extra_opts": " use_gpu=True  num_classes=2 ",
            "infer_img": "dataset/a.jpg",
            "infer_dir": "ignored",
            "output_dir": "out",
            "draw_threshold": 0.5,
            "slim_config": "",
            "save_results": true,
            "slice_infer": true,
            "slice_size": "640 640",
            "overlap_ratio": "0.25 0.25",
            "combine_method": "nms",
            "match_threshold": "0.6",
            "match_metric": "ios",
            "visualize": "false"
        }));
        let (cmd, out) = p.command("py", Path::new("/unused"))?;
        assert_eq!(
            cmd.args,
            vec![
                "tools/infer.py", "-c", "c.yml", "-o",
                "weights=output/L1/best_model.pdparams", "use_gpu=True", "num_classes=2",
                "--infer_img", "dataset/a.jpg", "--output_dir", "out",
                "--draw_threshold", "0.5", "--save_results", "True", "--slice_infer",
                "--slice_size", "640", "640", "--overlap_ratio", "0.25", "0.25",
                "--combine_method", "nms", "--match_threshold", "0.6",
                "--match_metric", "ios", "--visualize", "False",
            ]
        );
        assert_eq!(out, PathBuf::from("out"));
        Ok(())
    }

    #[test]
    fn slice_options_need_slice_infer() -> Result<()> {
        let p = params(json!({
            "config": "c.yml",
            "slice_infer": false,
            "slice_size": "640 640",
            "draw_threshold": "",
            "visualize": "true"
        }));
        let (cmd, _) = p.command("py", Path::new("/o"))?;
        assert_eq!(cmd.args, vec!["tools/infer.py", "-c", "c.yml", "--output_dir", "/o"]);
        Ok(())
    }

    #[test]
    fn missing_config_is_an_error() {
        assert!(InferParams::default().command("py", Path::new("/o")).is_err());
    }
}
