//! split_voc_ids - Random train/val/test split of VOC annotation ids.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use mousedet_ops::dataset::split_ids;

#[derive(Parser, Debug)]
#[command(
    name = "split_voc_ids",
    about = "Write ImageSets/Main train/val/test id lists from an annotations dir"
)]
struct Args {
    /// Directory of VOC .xml annotations
    #[arg(long, default_value = "annotations", value_name = "DIR")]
    annotations: PathBuf,

    /// Where train.txt, val.txt and test.txt are written
    #[arg(long, default_value = "ImageSets/Main", value_name = "DIR")]
    out: PathBuf,

    /// Fraction of ids for training
    #[arg(long, default_value_t = 0.7)]
    train: f64,

    /// Fraction of ids for validation; the rest is test
    #[arg(long, default_value_t = 0.2)]
    val: f64,

    /// Shuffle seed (random when omitted)
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    std::fs::create_dir_all(&args.out)?;
    let split = split_ids(&args.annotations, &args.out, args.train, args.val, args.seed)?;
    println!(
        "{} ids: train {}  val {}  test {}",
        split.total(),
        split.train.len(),
        split.val.len(),
        split.test.len()
    );
    println!("written to {}", args.out.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_dataset_layout() {
        let args = Args::parse_from(["split_voc_ids"]);
        assert_eq!(args.annotations, PathBuf::from("annotations"));
        assert_eq!(args.out, PathBuf::from("ImageSets/Main"));
        assert_eq!(args.seed, None);
    }
}
