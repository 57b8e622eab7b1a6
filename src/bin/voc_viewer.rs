//! voc_viewer - Browse VOC annotations and run model inference from a browser.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use mousedet_ops::config::OpsConfig;
use mousedet_ops::viewer::{self, ViewerConfig};

#[derive(Parser, Debug)]
#[command(name = "voc_viewer", about = "VOC annotation viewer and inference service")]
struct Args {
    /// Listen address (overrides MOUSEDET_VIEWER_ADDR)
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,

    /// PaddleDetection checkout (overrides MOUSEDET_PADDLE_ROOT)
    #[arg(long, value_name = "DIR")]
    paddle_root: Option<PathBuf>,

    /// Python interpreter for tools/infer.py (overrides MOUSEDET_PYTHON)
    #[arg(long)]
    python: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = OpsConfig::load()?;
    if let Some(addr) = args.addr {
        config.viewer_addr = addr;
    }
    if let Some(root) = args.paddle_root {
        config.paddle_root = root;
    }
    if let Some(python) = args.python {
        config.python = python;
    }
    let workspace = config.workspace();

    let handle = viewer::spawn(ViewerConfig {
        addr: config.viewer_addr.clone(),
        workspace: workspace.clone(),
        python: config.python.clone(),
    })?;
    log::info!("paddle root:  {}", workspace.root().display());
    log::info!("datasets:     {}", workspace.dataset_root().display());
    log::info!("model output: {}", workspace.output_root().display());
    log::info!("voc viewer listening on http://{}", handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping viewer...");
    handle.stop()?;
    Ok(())
}
