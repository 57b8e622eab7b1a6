use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const DEFAULT_PADDLE_ROOT: &str = ".";
const DEFAULT_PYTHON: &str = "python3";
const DEFAULT_VIEWER_ADDR: &str = "0.0.0.0:18765";
const DEFAULT_LOG_SINK_ADDR: &str = "0.0.0.0:8082";

pub const INFER_OUTPUT_DIR_NAME: &str = "_web_infer_vis";
pub const UPLOAD_DIR_NAME: &str = "_web_uploads";

#[derive(Debug, Deserialize, Default)]
struct OpsConfigFile {
    paddle_root: Option<PathBuf>,
    python: Option<String>,
    viewer: Option<ServerConfigFile>,
    log_sink: Option<ServerConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    addr: Option<String>,
}

/// Settings shared by every tool in the crate.
#[derive(Debug, Clone)]
pub struct OpsConfig {
    pub paddle_root: PathBuf,
    pub python: String,
    pub viewer_addr: String,
    pub log_sink_addr: String,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            paddle_root: PathBuf::from(DEFAULT_PADDLE_ROOT),
            python: DEFAULT_PYTHON.to_string(),
            viewer_addr: DEFAULT_VIEWER_ADDR.to_string(),
            log_sink_addr: DEFAULT_LOG_SINK_ADDR.to_string(),
        }
    }
}

impl OpsConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MOUSEDET_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: OpsConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            paddle_root: file.paddle_root.unwrap_or(defaults.paddle_root),
            python: file.python.unwrap_or(defaults.python),
            viewer_addr: file
                .viewer
                .and_then(|viewer| viewer.addr)
                .unwrap_or(defaults.viewer_addr),
            log_sink_addr: file
                .log_sink
                .and_then(|sink| sink.addr)
                .unwrap_or(defaults.log_sink_addr),
        }
    }

    fn apply_env(&mut self) {
        if let Some(root) = non_empty_env("MOUSEDET_PADDLE_ROOT") {
            self.paddle_root = PathBuf::from(root);
        }
        if let Some(python) = non_empty_env("MOUSEDET_PYTHON") {
            self.python = python;
        }
        if let Some(addr) = non_empty_env("MOUSEDET_VIEWER_ADDR") {
            self.viewer_addr = addr;
        }
        if let Some(addr) = non_empty_env("MOUSEDET_LOG_SINK_ADDR") {
            self.log_sink_addr = addr;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.python.trim().is_empty() {
            return Err(anyhow!("python interpreter must not be empty"));
        }
        for (what, addr) in [
            ("viewer", &self.viewer_addr),
            ("log sink", &self.log_sink_addr),
        ] {
            addr.parse::<SocketAddr>()
                .map_err(|e| anyhow!("invalid {} address '{}': {}", what, addr, e))?;
        }
        Ok(())
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::new(&self.paddle_root)
    }
}

/// Filesystem layout of a PaddleDetection checkout.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_root(&self) -> PathBuf {
        self.root.join("dataset")
    }

    pub fn dataset(&self, name: &str) -> PathBuf {
        self.dataset_root().join(name)
    }

    pub fn output_root(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn run_dir(&self, run_name: &str) -> PathBuf {
        self.output_root().join(run_name)
    }

    pub fn configs_root(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn slim_configs_root(&self) -> PathBuf {
        self.configs_root().join("slim")
    }

    /// Rank-0 log written by `paddle.distributed.launch`.
    pub fn worker_log(&self) -> PathBuf {
        self.root.join("log").join("workerlog.0")
    }

    pub fn infer_output_dir(&self) -> PathBuf {
        self.output_root().join(INFER_OUTPUT_DIR_NAME)
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.output_root().join(UPLOAD_DIR_NAME)
    }
}

fn read_config_file(path: &Path) -> Result<OpsConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}
