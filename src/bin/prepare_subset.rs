//! prepare_subset - Build a reduced-train-set copy of a VOC dataset.
//!
//! The subset links `images/` and `annotations/` back to the source, keeps
//! the first 1/N of `train.txt` and copies `val.txt` and `label_list.txt`
//! unchanged so results remain comparable.

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use mousedet_ops::config::OpsConfig;
use mousedet_ops::dataset::subset::{DEFAULT_DENOMINATOR, DEFAULT_DESTINATION, DEFAULT_SOURCE};
use mousedet_ops::dataset::build_subset;

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "prepare_subset", about = "Create a 1/N train subset of a VOC dataset")]
struct Args {
    /// PaddleDetection checkout (overrides MOUSEDET_PADDLE_ROOT)
    #[arg(long, value_name = "DIR")]
    paddle_root: Option<PathBuf>,

    /// Source dataset name under dataset/
    #[arg(long, default_value = DEFAULT_SOURCE)]
    src: String,

    /// Destination dataset name under dataset/
    #[arg(long, default_value = DEFAULT_DESTINATION)]
    dst: String,

    /// Keep the first 1/N of train.txt
    #[arg(long, default_value_t = DEFAULT_DENOMINATOR)]
    denominator: usize,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(
        Some(&args.ui),
        std::io::stderr().is_terminal(),
        !std::io::stdout().is_terminal(),
    );

    let mut config = OpsConfig::load()?;
    if let Some(root) = args.paddle_root {
        config.paddle_root = root;
    }
    let workspace = config.workspace();
    let src = workspace.dataset(&args.src);
    let dst = workspace.dataset(&args.dst);

    let report = {
        let _stage = ui.stage("Build subset");
        build_subset(&src, &dst, args.denominator)?
    };

    for (link, target) in &report.links {
        println!("link   {} -> {}", link.display(), target.display());
    }
    println!(
        "train  {} / {} lines (1/{})",
        report.selected, report.total, args.denominator
    );
    println!("val    {} lines (copied)", report.val_lines);
    println!("output {}", report.destination.display());
    Ok(())
}
