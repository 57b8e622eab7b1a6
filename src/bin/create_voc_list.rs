//! create_voc_list - PaddleDetection file lists for a VOC devkit directory.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use mousedet_ops::dataset::write_devkit_lists;

#[derive(Parser, Debug)]
#[command(
    name = "create_voc_list",
    about = "Turn ImageSets/Main id lists into image/annotation file lists"
)]
struct Args {
    /// Devkit directory containing ImageSets/, images/ and annotations/
    #[arg(long, default_value = ".", value_name = "DIR")]
    devkit: PathBuf,

    /// Output directory for train.txt and val.txt (defaults to the devkit)
    #[arg(long, value_name = "DIR")]
    out: Option<PathBuf>,

    /// Seed for shuffling the train list
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let out = args.out.unwrap_or_else(|| args.devkit.clone());
    std::fs::create_dir_all(&out)?;
    let lists = write_devkit_lists(&args.devkit, &out, args.seed)?;
    println!(
        "train {}  val {}  -> {}",
        lists.train.len(),
        lists.val.len(),
        out.display()
    );
    Ok(())
}
