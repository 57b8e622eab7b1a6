//! Random train/val/test split of annotation ids into `ImageSets/Main`.

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdSplit {
    pub train: Vec<String>,
    pub val: Vec<String>,
    pub test: Vec<String>,
}

impl IdSplit {
    pub fn total(&self) -> usize {
        self.train.len() + self.val.len() + self.test.len()
    }
}

/// Splits the `.xml` stems of `annotation_dir` and writes `train.txt`,
/// `val.txt` and `test.txt` (one id per line) into `out_dir`.
///
/// `floor(n * train)` ids go to train, `floor(n * val)` to val and the rest
/// to test. Without a seed the shuffle is not reproducible.
pub fn split_ids(
    annotation_dir: &Path,
    out_dir: &Path,
    train: f64,
    val: f64,
    seed: Option<u64>,
) -> Result<IdSplit> {
    if train < 0.0 || val < 0.0 || train + val > 1.0 {
        return Err(anyhow!(
            "invalid split fractions train={} val={}; both must be >= 0 and sum to <= 1",
            train,
            val
        ));
    }
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(annotation_dir)
        .with_context(|| format!("failed to list {}", annotation_dir.display()))?
    {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if let Some(stem) = name.strip_suffix(".xml") {
            ids.push(stem.to_string());
        }
    }
    // read_dir order is platform dependent; sort so a seed fully determines the split.
    ids.sort();

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    ids.shuffle(&mut rng);

    let n = ids.len();
    let num_train = (n as f64 * train) as usize;
    let num_val = (n as f64 * val) as usize;
    let split = IdSplit {
        train: ids[..num_train].to_vec(),
        val: ids[num_train..num_train + num_val].to_vec(),
        test: ids[num_train + num_val..].to_vec(),
    };

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    for (name, ids) in [
        ("train.txt", &split.train),
        ("val.txt", &split.val),
        ("test.txt", &split.test),
    ] {
        let mut body = String::new();
        for id in ids {
            body.push_str(id);
            body.push('\n');
        }
        let path = out_dir.join(name);
        std::fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(split)
}
