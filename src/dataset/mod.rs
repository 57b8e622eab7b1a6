//! VOC dataset preparation: file lists, subsets, merges and id splits.
//!
//! Every dataset handled here uses the PaddleDetection VOC layout:
//! `images/`, `annotations/`, and `train.txt` / `val.txt` lists whose lines
//! pair an image path with its annotation path.

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};

pub mod devkit;
pub mod merge;
pub mod split;
pub mod subset;

pub use devkit::{devkit_lists, write_devkit_lists, DevkitLists};
pub use merge::{MergePlan, MergeReport, SourceSpec};
pub use split::{split_ids, IdSplit};
pub use subset::{build_subset, SubsetReport};

pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// One line of a `train.txt` / `val.txt` list.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileListEntry {
    pub image: String,
    pub annotation: String,
}

impl FileListEntry {
    /// Entry for `images/<base>.jpg` + `annotations/<base>.xml` relative to the dataset root.
    pub fn for_basename(basename: &str) -> Self {
        Self {
            image: format!("./images/{basename}.jpg"),
            annotation: format!("./annotations/{basename}.xml"),
        }
    }
}

impl fmt::Display for FileListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.image, self.annotation)
    }
}

pub fn write_file_list(path: &Path, entries: &[FileListEntry]) -> Result<()> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.to_string());
        out.push('\n');
    }
    std::fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}

/// Reads a text file and drops blank lines.
pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

/// A single-wildcard file name pattern such as `mouse_*.jpg`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamePattern {
    prefix: String,
    suffix: String,
}

impl NamePattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut parts = pattern.splitn(2, '*');
        let prefix = parts.next().unwrap_or_default();
        let suffix = parts
            .next()
            .ok_or_else(|| anyhow!("pattern '{}' has no '*' wildcard", pattern))?;
        if suffix.contains('*') || prefix.contains('/') || suffix.contains('/') {
            return Err(anyhow!(
                "pattern '{}' must be a file name with exactly one '*'",
                pattern
            ));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        name.len() >= self.prefix.len() + self.suffix.len()
            && name.starts_with(&self.prefix)
            && name.ends_with(&self.suffix)
    }
}

/// An image together with the annotation sharing its stem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnotatedImage {
    pub image: PathBuf,
    pub annotation: PathBuf,
    pub stem: String,
}

/// Images in `image_dir` matching `pattern` that have `<stem>.xml` in `annotation_dir`.
///
/// A missing image directory yields no pairs. Results are sorted by image path.
pub fn find_pairs(
    image_dir: &Path,
    annotation_dir: &Path,
    pattern: &NamePattern,
) -> Result<Vec<AnnotatedImage>> {
    if !image_dir.is_dir() {
        log::warn!("image directory {} does not exist", image_dir.display());
        return Ok(Vec::new());
    }
    let mut images = Vec::new();
    for entry in std::fs::read_dir(image_dir)
        .with_context(|| format!("failed to list {}", image_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if pattern.matches(&name) && entry.path().is_file() {
            images.push(entry.path());
        }
    }
    images.sort();

    let mut pairs = Vec::new();
    for image in images {
        let stem = match image.file_stem() {
            Some(stem) => stem.to_string_lossy().into_owned(),
            None => continue,
        };
        let annotation = annotation_dir.join(format!("{stem}.xml"));
        if annotation.exists() {
            pairs.push(AnnotatedImage {
                image,
                annotation,
                stem,
            });
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matches_prefix_and_suffix() -> Result<()> {
        let pattern = NamePattern::parse("mouse_*.jpg")?;
        assert!(pattern.matches("mouse_001.jpg"));
        assert!(pattern.matches("mouse_.jpg"));
        assert!(!pattern.matches("mouse001.jpg"));
        assert!(!pattern.matches("mouse_001.png"));

        let loose = NamePattern::parse("mouse*.jpg")?;
        assert!(loose.matches("mouse0001.jpg"));
        assert!(loose.matches("mouse_12.jpg"));
        Ok(())
    }

    #[test]
    fn pattern_requires_single_wildcard() {
        assert!(NamePattern::parse("mouse.jpg").is_err());
        assert!(NamePattern::parse("a*b*.jpg").is_err());
        assert!(NamePattern::parse("dir/*.jpg").is_err());
    }

    #[test]
    fn file_list_entry_renders_voc_paths() {
        let entry = FileListEntry::for_basename("other_00042");
        assert_eq!(
            entry.to_string(),
            "./images/other_00042.jpg ./annotations/other_00042.xml"
        );
    }

    #[test]
    fn image_extensions_are_case_insensitive() {
        assert!(has_image_extension(Path::new("a/B.JPG")));
        assert!(has_image_extension(Path::new("c.bmp")));
        assert!(!has_image_extension(Path::new("c.xml")));
        assert!(!has_image_extension(Path::new("noext")));
    }
}
