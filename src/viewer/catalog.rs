//! Directory scans behind the viewer's listing endpoints.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::Workspace;
use crate::dataset::has_image_extension;
use crate::voc;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DatasetSummary {
    pub name: String,
    pub image_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetList {
    pub root: String,
    pub datasets: Vec<DatasetSummary>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScanItem {
    pub image: String,
    pub annotation: Option<String>,
    pub basename: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub path: String,
    pub total_images: usize,
    pub annotated: usize,
    pub labels: BTreeMap<String, usize>,
    pub items: Vec<ScanItem>,
}

/// A file offered in a drop-down, relative to the PaddleDetection root.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PathEntry {
    pub path: String,
    pub name: String,
}

impl PathEntry {
    fn relative(root: &Path, file: &Path) -> Self {
        let rel = file.strip_prefix(root).unwrap_or(file);
        let path = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Self {
            name: path.clone(),
            path,
        }
    }
}

/// Label shown for "no slim config".
pub const NO_SLIM_CONFIG: &str = "(none)";

fn image_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && has_image_extension(&path) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Dataset directories under `dataset/` that have an `images/` folder.
pub fn list_datasets(workspace: &Workspace) -> Result<DatasetList> {
    let root = workspace.dataset_root();
    if !root.is_dir() {
        return Err(anyhow!("directory does not exist: {}", root.display()));
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(&root)? {
        let entry = entry?;
        if entry.path().join("images").is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();

    let mut datasets = Vec::with_capacity(names.len());
    for name in names {
        let image_count = image_files(&root.join(&name).join("images"))?.len();
        datasets.push(DatasetSummary { name, image_count });
    }
    Ok(DatasetList {
        root: root.display().to_string(),
        datasets,
    })
}

/// Pairs every image with its annotation and tallies object labels.
///
/// Annotations that fail to parse still count as annotated but add no labels.
pub fn scan_dataset(dataset: &Path) -> Result<ScanReport> {
    let image_dir = dataset.join("images");
    let annotation_dir = dataset.join("annotations");
    if !image_dir.is_dir() {
        return Err(anyhow!(
            "images/ directory does not exist: {}",
            image_dir.display()
        ));
    }

    let mut items = Vec::new();
    for image in image_files(&image_dir)? {
        let basename = Path::new(&image)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let xml = format!("{basename}.xml");
        let annotation = annotation_dir.join(&xml).exists().then_some(xml);
        items.push(ScanItem {
            image,
            annotation,
            basename,
        });
    }

    let mut labels = BTreeMap::new();
    let mut annotated = 0;
    for item in &items {
        let Some(xml) = &item.annotation else {
            continue;
        };
        annotated += 1;
        match voc::parse_file(&annotation_dir.join(xml)) {
            Ok(ann) => {
                for label in ann.labels() {
                    *labels.entry(label.to_string()).or_insert(0) += 1;
                }
            }
            Err(err) => log::debug!("skipping {}: {:#}", xml, err),
        }
    }

    Ok(ScanReport {
        path: dataset.display().to_string(),
        total_images: items.len(),
        annotated,
        labels,
        items,
    })
}

fn walk_files(dir: &Path, keep: impl Fn(&Path) -> bool) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                log::debug!("walk error under {}: {}", dir.display(), err);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && keep(entry.path()))
        .map(|entry| entry.into_path())
        .collect()
}

fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().ends_with(suffix))
        .unwrap_or(false)
}

fn sorted_entries(root: &Path, files: Vec<PathBuf>) -> Vec<PathEntry> {
    let mut entries: Vec<PathEntry> = files
        .iter()
        .map(|file| PathEntry::relative(root, file))
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

/// Every `*.pdparams` checkpoint under `output/`.
pub fn list_models(workspace: &Workspace) -> Vec<PathEntry> {
    let files = walk_files(&workspace.output_root(), |p| has_suffix(p, ".pdparams"));
    sorted_entries(workspace.root(), files)
}

/// Every `*.yml` under `configs/` except those inside a `_base_` directory.
pub fn list_configs(workspace: &Workspace) -> Vec<PathEntry> {
    let configs_root = workspace.configs_root();
    let files = walk_files(&configs_root, |p| {
        let in_base = p
            .parent()
            .and_then(|dir| dir.strip_prefix(&configs_root).ok())
            .map(|dir| dir.to_string_lossy().contains("_base_"))
            .unwrap_or(false);
        has_suffix(p, ".yml") && !in_base
    });
    sorted_entries(workspace.root(), files)
}

/// "(none)" followed by every `*.yml` under `configs/slim/`.
pub fn list_slim_configs(workspace: &Workspace) -> Vec<PathEntry> {
    let files = walk_files(&workspace.slim_configs_root(), |p| has_suffix(p, ".yml"));
    let mut entries = vec![PathEntry {
        path: String::new(),
        name: NO_SLIM_CONFIG.to_string(),
    }];
    entries.extend(sorted_entries(workspace.root(), files));
    entries
}
