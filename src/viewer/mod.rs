//! Browser front end for VOC datasets and trained models.
//!
//! Serves the annotation browser, lists checkpoints and configs from the
//! PaddleDetection checkout, and runs `tools/infer.py` on request.

pub mod catalog;
pub mod infer;

pub use catalog::{DatasetList, DatasetSummary, PathEntry, ScanItem, ScanReport};
pub use infer::{InferJob, InferParams, InferStatus};

use anyhow::{Context, Result};
use serde_json::json;
use std::path::{Component, Path, PathBuf};

use crate::config::Workspace;
use crate::http::{self, guess_mime, HttpRequest, HttpResponse, ServerHandle};
use crate::voc;

const INDEX_HTML: &str = include_str!("../../assets/index.html");
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_UPLOAD_NAME: &str = "upload.jpg";

#[derive(Clone, Debug)]
pub struct ViewerConfig {
    pub addr: String,
    pub workspace: Workspace,
    pub python: String,
}

pub type ViewerHandle = ServerHandle;

/// Request router for the viewer.
pub struct Viewer {
    workspace: Workspace,
    job: InferJob,
}

impl Viewer {
    pub fn new(workspace: Workspace, python: impl Into<String>) -> Result<Self> {
        for dir in [workspace.infer_output_dir(), workspace.upload_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let job = InferJob::new(workspace.clone(), python);
        Ok(Self { workspace, job })
    }

    pub fn route(&mut self, request: &HttpRequest) -> HttpResponse {
        match request.method.as_str() {
            "GET" | "HEAD" => self.get(request),
            "POST" => self.post(request),
            _ => HttpResponse::error(405, "method_not_allowed"),
        }
    }

    fn get(&self, request: &HttpRequest) -> HttpResponse {
        let param = |key: &str| request.query_param(key).unwrap_or("");
        let path = request.path.as_str();
        match path {
            "/api/datasets" => match catalog::list_datasets(&self.workspace) {
                Ok(list) => HttpResponse::json(&list),
                Err(err) => HttpResponse::json(&json!({
                    "error": err.to_string(),
                    "datasets": [],
                })),
            },
            "/api/scan" => self.scan(param("path")),
            "/api/annotation" => self.annotation(param("dataset"), param("file")),
            "/api/models" => {
                HttpResponse::json(&json!({ "models": catalog::list_models(&self.workspace) }))
            }
            "/api/configs" => {
                HttpResponse::json(&json!({ "configs": catalog::list_configs(&self.workspace) }))
            }
            "/api/slim_configs" => HttpResponse::json(&json!({
                "slim_configs": catalog::list_slim_configs(&self.workspace)
            })),
            "/api/infer/status" => HttpResponse::json(&self.job.status()),
            "/api/infer/result_image" => match self.job.result_image() {
                Some(image) if image.is_file() => serve_file(&image, true),
                _ => HttpResponse::text(404, "No result image"),
            },
            "/" | "/index.html" => HttpResponse::new(200, "text/html; charset=utf-8", INDEX_HTML)
                .with_header("Cache-Control", "no-cache"),
            _ => {
                if let Some(name) = path.strip_prefix("/images/") {
                    let base = self.workspace.dataset_root();
                    let file = safe_join(&base, param("dataset"))
                        .and_then(|ds| safe_join(&ds.join("images"), name));
                    return serve_optional(file);
                }
                if let Some(name) = path.strip_prefix("/infer_vis/") {
                    return serve_optional(safe_join(&self.workspace.infer_output_dir(), name));
                }
                HttpResponse::not_found()
            }
        }
    }

    fn scan(&self, dataset: &str) -> HttpResponse {
        if dataset.is_empty() {
            return HttpResponse::json(&json!({ "error": "missing path parameter" }));
        }
        let dir = match safe_join(&self.workspace.dataset_root(), dataset) {
            Some(dir) if dir.is_dir() => dir,
            _ => {
                return HttpResponse::json(&json!({
                    "error": format!("directory does not exist: {dataset}")
                }))
            }
        };
        match catalog::scan_dataset(&dir) {
            Ok(report) => HttpResponse::json(&report),
            Err(err) => HttpResponse::json(&json!({ "error": err.to_string(), "items": [] })),
        }
    }

    fn annotation(&self, dataset: &str, file: &str) -> HttpResponse {
        let xml = safe_join(&self.workspace.dataset_root(), dataset)
            .and_then(|ds| safe_join(&ds.join("annotations"), file))
            .filter(|p| p.is_file());
        let Some(xml) = xml else {
            return HttpResponse::json(&json!({
                "error": format!("file does not exist: {dataset}/annotations/{file}")
            }));
        };
        match voc::parse_file(&xml) {
            Ok(ann) => HttpResponse::json(&ann),
            Err(err) => HttpResponse::json(&json!({ "error": format!("{err:#}") })),
        }
    }

    fn post(&self, request: &HttpRequest) -> HttpResponse {
        match request.path.as_str() {
            "/api/infer/run" => {
                let params: InferParams = match serde_json::from_slice(&request.body) {
                    Ok(params) => params,
                    Err(_) => return HttpResponse::json(&json!({ "error": "Invalid JSON" })),
                };
                match self.job.start(params) {
                    Ok(()) => HttpResponse::json(&json!({ "status": "started" })),
                    Err(err) => HttpResponse::json(&json!({ "error": err.to_string() })),
                }
            }
            "/api/upload" => self.upload(request),
            _ => HttpResponse::not_found(),
        }
    }

    fn upload(&self, request: &HttpRequest) -> HttpResponse {
        let requested = request
            .query_param("filename")
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_UPLOAD_NAME);
        let Some(name) = upload_name(requested) else {
            return HttpResponse::json(&json!({ "error": "invalid filename" }));
        };
        let path = self.workspace.upload_dir().join(&name);
        if let Err(err) = std::fs::write(&path, &request.body) {
            log::warn!("upload to {} failed: {}", path.display(), err);
            return HttpResponse::json(&json!({ "error": err.to_string() }));
        }
        log::info!("saved upload {} ({} bytes)", path.display(), request.body.len());
        HttpResponse::json(&json!({ "path": path.display().to_string(), "filename": name }))
    }
}

impl http::Handler for Viewer {
    fn handle(&mut self, request: HttpRequest) -> HttpResponse {
        let mut response = self.route(&request);
        if request.method == "HEAD" {
            response.body.clear();
        }
        response
    }

    fn max_body(&self) -> usize {
        MAX_UPLOAD_BYTES
    }
}

/// Binds the viewer and serves it on a background thread.
pub fn spawn(config: ViewerConfig) -> Result<ViewerHandle> {
    let viewer = Viewer::new(config.workspace, config.python)?;
    http::spawn(&config.addr, "voc-viewer", viewer)
}

/// Joins a client-supplied relative path onto `base`.
///
/// Absolute paths and `..` components are refused.
pub fn safe_join(base: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    let mut out = base.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Final path component of an uploaded file name.
fn upload_name(requested: &str) -> Option<String> {
    let normalized = requested.replace('\\', "/");
    Path::new(&normalized)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| name != "." && name != "..")
}

fn serve_optional(file: Option<PathBuf>) -> HttpResponse {
    match file {
        Some(file) if file.is_file() => serve_file(&file, false),
        _ => HttpResponse::not_found(),
    }
}

fn serve_file(path: &Path, no_store: bool) -> HttpResponse {
    match std::fs::read(path) {
        Ok(data) => HttpResponse::new(200, guess_mime(path), data).with_header(
            "Cache-Control",
            if no_store { "no-store" } else { "no-cache" },
        ),
        Err(err) => {
            log::debug!("cannot serve {}: {}", path.display(), err);
            HttpResponse::not_found()
        }
    }
}
