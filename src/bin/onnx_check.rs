//! onnx_check - Run one random image through an exported detector.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use mousedet_ops::onnx_check::smoke_test;

#[derive(Parser, Debug)]
#[command(name = "onnx_check", about = "Smoke-test an exported ONNX detector")]
struct Args {
    /// ONNX model to load
    #[arg(long, default_value = "models/yolov3_mouse_fp32.onnx", value_name = "PATH")]
    model: PathBuf,

    /// Square input size
    #[arg(long, default_value_t = 608)]
    input_size: u32,

    /// Seed for the random input image
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if !args.model.exists() {
        return Err(anyhow!("missing model file: {}", args.model.display()));
    }

    let report = smoke_test(&args.model, args.input_size, args.seed)?;
    println!("inputs:");
    for input in &report.inputs {
        println!("  {}: {}", input.name, input.fact);
    }
    for (idx, shape) in report.output_shapes.iter().enumerate() {
        println!("output {idx} shape: {shape:?}");
    }
    if let Some(counts) = &report.box_counts {
        println!("num_boxes: {counts:?}");
    }
    Ok(())
}
