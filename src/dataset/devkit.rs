//! File lists for a VOC devkit-style directory.
//!
//! Reads the id lists under `ImageSets/Main` and turns them into the
//! `<image> <annotation>` lists PaddleDetection trains from.

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use std::path::Path;
use walkdir::WalkDir;

use super::{write_file_list, FileListEntry};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DevkitLists {
    pub train: Vec<FileListEntry>,
    pub val: Vec<FileListEntry>,
}

enum ListKind {
    Train,
    Val,
}

/// Collects image/annotation pairs listed in `ImageSets/Main/{train,val}.txt`.
///
/// An id already seen in an earlier list is skipped. Every listed id must
/// have both `annotations/<id>.xml` and `images/<id>.jpg`.
pub fn devkit_lists(devkit: &Path) -> Result<DevkitLists> {
    let list_dir = devkit.join("ImageSets").join("Main");
    let annotation_dir = devkit.join("annotations");
    let image_dir = devkit.join("images");
    let mut lists = DevkitLists::default();
    let mut added: HashSet<String> = HashSet::new();

    for entry in WalkDir::new(&list_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", list_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let kind = match entry.file_name().to_str() {
            Some("train.txt") => ListKind::Train,
            Some("val.txt") => ListKind::Val,
            _ => continue,
        };
        let raw = std::fs::read_to_string(entry.path())
            .with_context(|| format!("failed to read {}", entry.path().display()))?;
        for line in raw.lines() {
            let Some(id) = line.split_whitespace().next() else {
                continue;
            };
            if !added.insert(id.to_string()) {
                continue;
            }
            let annotation = annotation_dir.join(format!("{id}.xml"));
            let image = image_dir.join(format!("{id}.jpg"));
            for path in [&annotation, &image] {
                if !path.is_file() {
                    return Err(anyhow!("file {} not found", path.display()));
                }
            }
            let pair = FileListEntry {
                image: image.to_string_lossy().into_owned(),
                annotation: annotation.to_string_lossy().into_owned(),
            };
            match kind {
                ListKind::Train => lists.train.push(pair),
                ListKind::Val => lists.val.push(pair),
            }
        }
    }
    Ok(lists)
}

/// Writes `train.txt` (shuffled) and `val.txt` into `out_dir`.
pub fn write_devkit_lists(devkit: &Path, out_dir: &Path, seed: Option<u64>) -> Result<DevkitLists> {
    let mut lists = devkit_lists(devkit)?;
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    lists.train.shuffle(&mut rng);
    write_file_list(&out_dir.join("train.txt"), &lists.train)?;
    write_file_list(&out_dir.join("val.txt"), &lists.val)?;
    Ok(lists)
}
