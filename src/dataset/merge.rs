//! Merges several VOC sources into one renumbered, relabelled dataset.

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{find_pairs, write_file_list, AnnotatedImage, FileListEntry, NamePattern};
use crate::voc::{self, Rewrite};

const PROGRESS_EVERY: usize = 500;

/// One group of images taken from a source directory.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SourceSpec {
    /// Short tag used in progress output.
    pub name: String,
    pub images: PathBuf,
    /// Defaults to `images` when annotations live next to the pictures.
    #[serde(default)]
    pub annotations: Option<PathBuf>,
    /// File name pattern with one `*`, e.g. `dog_*.jpg`.
    pub pattern: String,
    /// Target class; every object in the annotation is renamed to it.
    pub label: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MergePlan {
    pub output: PathBuf,
    pub labels: Vec<String>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_train_ratio")]
    pub train_ratio: f64,
    pub sources: Vec<SourceSpec>,
}

fn default_seed() -> u64 {
    42
}

fn default_train_ratio() -> f64 {
    0.8
}

impl MergePlan {
    /// The mouse/other merge: the existing dog/mouse/other set (dogs become
    /// `other`), the whiteboard captures, and the raw VOC dump.
    pub fn mouse_other() -> Self {
        let source = |name: &str, images: &str, annotations: Option<&str>, pattern: &str, label: &str| {
            SourceSpec {
                name: name.to_string(),
                images: PathBuf::from(images),
                annotations: annotations.map(PathBuf::from),
                pattern: pattern.to_string(),
                label: label.to_string(),
            }
        };
        Self {
            output: PathBuf::from("dataset/mouse_other_voc"),
            labels: vec!["mouse".to_string(), "other".to_string()],
            seed: default_seed(),
            train_ratio: default_train_ratio(),
            sources: vec![
                source(
                    "dataset",
                    "dataset/dog_mouse_other_voc/images",
                    Some("dataset/dog_mouse_other_voc/annotations"),
                    "mouse_*.jpg",
                    "mouse",
                ),
                source(
                    "dataset",
                    "dataset/dog_mouse_other_voc/images",
                    Some("dataset/dog_mouse_other_voc/annotations"),
                    "other_*.jpg",
                    "other",
                ),
                source(
                    "dataset-dog",
                    "dataset/dog_mouse_other_voc/images",
                    Some("dataset/dog_mouse_other_voc/annotations"),
                    "dog_*.jpg",
                    "other",
                ),
                source("wb-img", "../RawData/wb-img", None, "mouse*.jpg", "mouse"),
                source(
                    "rawdata",
                    "../RawData/dog_mouse_other_voc/images",
                    Some("../RawData/dog_mouse_other_voc/annotations"),
                    "mouse*.jpg",
                    "mouse",
                ),
                source(
                    "rawdata",
                    "../RawData/dog_mouse_other_voc/images",
                    Some("../RawData/dog_mouse_other_voc/annotations"),
                    "other_*.jpg",
                    "other",
                ),
            ],
        }
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read merge plan {}", path.display()))?;
        let plan: Self = toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid merge plan {}: {}", path.display(), e))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        if self.labels.is_empty() {
            return Err(anyhow!("merge plan lists no labels"));
        }
        if !(0.0..=1.0).contains(&self.train_ratio) {
            return Err(anyhow!("train_ratio must be within [0, 1]"));
        }
        for source in &self.sources {
            if !self.labels.contains(&source.label) {
                return Err(anyhow!(
                    "source '{}' targets unknown label '{}'",
                    source.name,
                    source.label
                ));
            }
            NamePattern::parse(&source.pattern)?;
        }
        Ok(())
    }

    /// Resolves every relative path in the plan against `base`.
    pub fn rooted_at(mut self, base: &Path) -> Self {
        let join = |path: &PathBuf| {
            if path.is_absolute() {
                path.clone()
            } else {
                base.join(path)
            }
        };
        self.output = join(&self.output);
        for source in &mut self.sources {
            source.images = join(&source.images);
            source.annotations = source.annotations.as_ref().map(join);
        }
        self
    }
}

/// Pairs found for one source entry.
#[derive(Clone, Debug)]
pub struct CollectedSource {
    pub name: String,
    pub label: String,
    pub pairs: Vec<AnnotatedImage>,
}

pub fn collect(plan: &MergePlan) -> Result<Vec<CollectedSource>> {
    let mut collected = Vec::new();
    for source in &plan.sources {
        let pattern = NamePattern::parse(&source.pattern)?;
        let ann_dir = source.annotations.as_ref().unwrap_or(&source.images);
        let pairs = find_pairs(&source.images, ann_dir, &pattern)?;
        log::info!(
            "[{}] {} -> {}: {} pairs",
            source.name,
            source.pattern,
            source.label,
            pairs.len()
        );
        collected.push(CollectedSource {
            name: source.name.clone(),
            label: source.label.clone(),
            pairs,
        });
    }
    Ok(collected)
}

#[derive(Clone, Debug, Default)]
pub struct MergeReport {
    pub output: PathBuf,
    pub per_label: BTreeMap<String, usize>,
    pub train: Vec<FileListEntry>,
    pub val: Vec<FileListEntry>,
    pub train_counts: BTreeMap<String, usize>,
    pub val_counts: BTreeMap<String, usize>,
}

impl MergeReport {
    pub fn total(&self) -> usize {
        self.train.len() + self.val.len()
    }
}

/// Copies, renumbers and relabels every collected pair into `plan.output`.
///
/// The output directory is wiped first. Items are numbered per label in
/// source order (`mouse_00001`, ...), then shuffled with the plan seed and
/// split by `train_ratio`.
pub fn merge(plan: &MergePlan, collected: &[CollectedSource]) -> Result<MergeReport> {
    plan.validate()?;
    let out_images = plan.output.join("images");
    let out_annotations = plan.output.join("annotations");
    if plan.output.exists() {
        log::warn!("output {} exists; rebuilding it", plan.output.display());
        std::fs::remove_dir_all(&plan.output)
            .with_context(|| format!("failed to clear {}", plan.output.display()))?;
    }
    std::fs::create_dir_all(&out_images)?;
    std::fs::create_dir_all(&out_annotations)?;

    let mut report = MergeReport {
        output: plan.output.clone(),
        ..MergeReport::default()
    };
    let mut entries: Vec<(String, String)> = Vec::new();

    for label in &plan.labels {
        let items: Vec<&AnnotatedImage> = collected
            .iter()
            .filter(|source| &source.label == label)
            .flat_map(|source| source.pairs.iter())
            .collect();
        for (idx, pair) in items.iter().enumerate() {
            let basename = format!("{}_{:05}", label, idx + 1);
            let image_name = format!("{basename}.jpg");
            std::fs::copy(&pair.image, out_images.join(&image_name)).with_context(|| {
                format!("failed to copy {}", pair.image.display())
            })?;
            voc::rewrite_file(
                &pair.annotation,
                &out_annotations.join(format!("{basename}.xml")),
                &Rewrite {
                    filename: &image_name,
                    label: Some(label.as_str()),
                },
            )?;
            entries.push((basename, label.clone()));
            if (idx + 1) % PROGRESS_EVERY == 0 {
                log::info!("{}: {}/{} copied", label, idx + 1, items.len());
            }
        }
        report.per_label.insert(label.clone(), items.len());
    }

    let mut rng = StdRng::seed_from_u64(plan.seed);
    entries.shuffle(&mut rng);
    let train_count = (entries.len() as f64 * plan.train_ratio) as usize;
    let mut train: Vec<(String, String)> = entries[..train_count].to_vec();
    let mut val: Vec<(String, String)> = entries[train_count..].to_vec();
    train.sort();
    val.sort();

    report.train_counts = count_labels(&train);
    report.val_counts = count_labels(&val);
    report.train = train
        .iter()
        .map(|(basename, _)| FileListEntry::for_basename(basename))
        .collect();
    report.val = val
        .iter()
        .map(|(basename, _)| FileListEntry::for_basename(basename))
        .collect();

    write_file_list(&plan.output.join("train.txt"), &report.train)?;
    write_file_list(&plan.output.join("val.txt"), &report.val)?;
    let mut labels = plan.labels.join("\n");
    labels.push('\n');
    std::fs::write(plan.output.join("label_list.txt"), labels)?;

    Ok(report)
}

fn count_labels(entries: &[(String, String)]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for (_, label) in entries {
        *counts.entry(label.clone()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_plan_is_valid() -> Result<()> {
        let plan = MergePlan::mouse_other();
        plan.validate()?;
        assert_eq!(plan.seed, 42);
        assert_eq!(plan.sources.len(), 6);
        assert!(plan
            .sources
            .iter()
            .any(|s| s.pattern == "dog_*.jpg" && s.label == "other"));
        Ok(())
    }

    #[test]
    fn plan_parses_from_toml_with_defaults() -> Result<()> {
        let plan: MergePlan = toml::from_str(
            r#"
            output = "dataset/cats"
            labels = ["cat"]

            [[sources]]
            name = "raw"
            images = "raw"
            pattern = "cat*.jpg"
            label = "cat"
            "#,
        )?;
        plan.validate()?;
        assert_eq!(plan.seed, 42);
        assert!((plan.train_ratio - 0.8).abs() < f64::EPSILON);
        assert_eq!(plan.sources[0].annotations, None);
        Ok(())
    }

    #[test]
    fn unknown_label_is_rejected() {
        let mut plan = MergePlan::mouse_other();
        plan.sources[0].label = "cat".to_string();
        assert!(plan.validate().is_err());
    }

    #[test]
    fn rooted_at_keeps_absolute_paths() {
        let mut plan = MergePlan::mouse_other();
        plan.sources[0].images = PathBuf::from("/abs/images");
        let plan = plan.rooted_at(Path::new("/base"));
        assert_eq!(plan.output, PathBuf::from("/base/dataset/mouse_other_voc"));
        assert_eq!(plan.sources[0].images, PathBuf::from("/abs/images"));
        assert_eq!(
            plan.sources[3].images,
            PathBuf::from("/base/../RawData/wb-img")
        );
    }
}
