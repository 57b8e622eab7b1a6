//! vdl_to_tb - Convert training runs' VisualDL logs to TensorBoard events.
//!
//! Each `<run>/vdl_log` gets a sibling `<run>/tb_log`. With no directories
//! given, every `output/*/vdl_log` in the checkout is converted.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

use mousedet_ops::config::OpsConfig;
use mousedet_ops::vdl::{find_vdl_dirs, ConvertOutcome, Converter};

#[derive(Parser, Debug)]
#[command(name = "vdl_to_tb", about = "Convert VisualDL logs to TensorBoard event files")]
struct Args {
    /// vdl_log directories (default: output/*/vdl_log)
    #[arg(value_name = "DIR")]
    dirs: Vec<PathBuf>,

    /// PaddleDetection checkout (overrides MOUSEDET_PADDLE_ROOT)
    #[arg(long, value_name = "DIR")]
    paddle_root: Option<PathBuf>,

    /// Python interpreter with visualdl and tensorboard (overrides MOUSEDET_PYTHON)
    #[arg(long)]
    python: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = OpsConfig::load()?;
    if let Some(root) = args.paddle_root {
        config.paddle_root = root;
    }
    if let Some(python) = args.python {
        config.python = python;
    }
    let output_root = config.workspace().output_root();

    let dirs = if args.dirs.is_empty() {
        if !output_root.is_dir() {
            bail!("no output directory at {}", output_root.display());
        }
        let dirs = find_vdl_dirs(&output_root)?;
        if dirs.is_empty() {
            bail!("no vdl_log directories found under {}", output_root.display());
        }
        println!("found {} vdl_log directories", dirs.len());
        dirs
    } else {
        args.dirs
    };

    let converter = Converter::new(config.python)?;
    for dir in &dirs {
        match converter.convert(dir)? {
            ConvertOutcome::Converted { tb_dir, points } => println!(
                "  [OK]   {} -> {} ({points} points)",
                dir.display(),
                tb_dir.display()
            ),
            ConvertOutcome::Skipped => println!("  [SKIP] {} (no vdlrecords)", dir.display()),
        }
    }
    println!();
    println!(
        "view with: tensorboard --logdir {} --host 0.0.0.0 --port 8040",
        output_root.display()
    );
    Ok(())
}
