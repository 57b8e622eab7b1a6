//! Reduced-train-set datasets that share images and annotations with their source.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::read_lines;

pub const DEFAULT_SOURCE: &str = "mouse_other_voc";
pub const DEFAULT_DESTINATION: &str = "mouse_other_voc_1of3";
pub const DEFAULT_DENOMINATOR: usize = 3;

const REQUIRED_FILES: [&str; 3] = ["train.txt", "val.txt", "label_list.txt"];
const LINKED_DIRS: [&str; 2] = ["images", "annotations"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubsetReport {
    pub destination: PathBuf,
    /// Non-blank lines in the source train list.
    pub total: usize,
    /// Lines kept in the subset train list.
    pub selected: usize,
    pub val_lines: usize,
    pub links: Vec<(PathBuf, PathBuf)>,
}

/// Builds `dst` from the first `1/denominator` of `src/train.txt`.
///
/// `images/` and `annotations/` become symlinks to the source directories and
/// the validation list is copied unchanged so results stay comparable.
pub fn build_subset(src: &Path, dst: &Path, denominator: usize) -> Result<SubsetReport> {
    if denominator == 0 {
        return Err(anyhow!("subset denominator must be >= 1"));
    }
    for name in REQUIRED_FILES {
        let path = src.join(name);
        if !path.exists() {
            return Err(anyhow!("source file does not exist: {}", path.display()));
        }
    }

    std::fs::create_dir_all(dst)
        .with_context(|| format!("failed to create {}", dst.display()))?;

    let mut links = Vec::new();
    for subdir in LINKED_DIRS {
        let link = dst.join(subdir);
        let target = absolute(&src.join(subdir))?;
        replace_symlink(&target, &link)?;
        links.push((link, target));
    }

    let all_lines = read_lines(&src.join("train.txt"))?;
    let total = all_lines.len();
    let selected = total / denominator;
    let mut train = all_lines[..selected].join("\n");
    train.push('\n');
    let dst_train = dst.join("train.txt");
    std::fs::write(&dst_train, train)
        .with_context(|| format!("failed to write {}", dst_train.display()))?;

    let dst_val = dst.join("val.txt");
    std::fs::copy(src.join("val.txt"), &dst_val)
        .with_context(|| format!("failed to copy val.txt to {}", dst_val.display()))?;
    let val_lines = std::fs::read_to_string(&dst_val)?.lines().count();

    let dst_labels = dst.join("label_list.txt");
    std::fs::copy(src.join("label_list.txt"), &dst_labels)
        .with_context(|| format!("failed to copy label_list.txt to {}", dst_labels.display()))?;

    Ok(SubsetReport {
        destination: dst.to_path_buf(),
        total,
        selected,
        val_lines,
        links,
    })
}

fn absolute(path: &Path) -> Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(resolved) => Ok(resolved),
        Err(_) if path.is_absolute() => Ok(path.to_path_buf()),
        Err(_) => Ok(std::env::current_dir()?.join(path)),
    }
}

fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    if let Ok(meta) = std::fs::symlink_metadata(link) {
        if meta.is_dir() {
            return Err(anyhow!(
                "{} is a real directory; refusing to replace it with a link",
                link.display()
            ));
        }
        std::fs::remove_file(link)
            .with_context(|| format!("failed to remove {}", link.display()))?;
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("failed to link {} -> {}", link.display(), target.display()))?;
    #[cfg(windows)]
    std::os::windows::fs::symlink_dir(target, link)
        .with_context(|| format!("failed to link {} -> {}", link.display(), target.display()))?;
    Ok(())
}
