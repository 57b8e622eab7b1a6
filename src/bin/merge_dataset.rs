//! merge_dataset - Merge several VOC sources into one relabelled dataset.
//!
//! Without `--plan` the built-in mouse/other merge is used. Relative paths
//! in the plan resolve against the PaddleDetection checkout.

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use mousedet_ops::config::OpsConfig;
use mousedet_ops::dataset::merge::{collect, merge};
use mousedet_ops::dataset::MergePlan;

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "merge_dataset", about = "Merge VOC sources into one dataset")]
struct Args {
    /// PaddleDetection checkout (overrides MOUSEDET_PADDLE_ROOT)
    #[arg(long, value_name = "DIR")]
    paddle_root: Option<PathBuf>,

    /// TOML merge plan (defaults to the built-in mouse/other plan)
    #[arg(long, value_name = "PATH")]
    plan: Option<PathBuf>,

    /// Override the plan's shuffle seed
    #[arg(long)]
    seed: Option<u64>,

    /// List what would be merged without writing anything
    #[arg(long)]
    dry_run: bool,

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

    let mut plan = match &args.plan {
        Some(path) => MergePlan::from_toml_file(path)?,
        None => MergePlan::mouse_other(),
    };
    if let Some(seed) = args.seed {
        plan.seed = seed;
    }
    let plan = plan.rooted_at(workspace.root());
    plan.validate()?;

    let collected = {
        let _stage = ui.stage("Collect sources");
        collect(&plan)?
    };
    for source in &collected {
        println!(
            "  {:<12} {:<6} {:>6} pairs",
            source.name,
            source.label,
            source.pairs.len()
        );
    }
    if args.dry_run {
        println!("dry run: nothing written");
        return Ok(());
    }

    let report = {
        let _stage = ui.stage("Copy and relabel");
        merge(&plan, &collected)?
    };

    println!();
    println!("output {}", report.output.display());
    for (label, count) in &report.per_label {
        println!("  {:<8} {:>6}", label, count);
    }
    println!("  {:<8} {:>6}", "total", report.total());
    println!(
        "train {} ({:?})  val {} ({:?})",
        report.train.len(),
        report.train_counts,
        report.val.len(),
        report.val_counts
    );
    Ok(())
}
