//! onnx_quantize - Static INT8 quantization for exported detector ONNX models.
//!
//! Calibration images are preprocessed here; quantization itself runs in
//! onnxruntime through the configured Python interpreter.

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use mousedet_ops::config::OpsConfig;
use mousedet_ops::quantize::{run_driver, write_calibration_set, CalibMethod, QuantizeOptions};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "onnx_quantize", about = "Static INT8 quantization (QDQ) for ONNX detectors")]
struct Args {
    /// Input FP32 ONNX model
    #[arg(long, value_name = "PATH")]
    input: PathBuf,

    /// Output INT8 ONNX model
    #[arg(long, value_name = "PATH")]
    output: PathBuf,

    /// Calibration image directory (jpg/png, searched recursively)
    #[arg(long, value_name = "DIR")]
    calib_dir: PathBuf,

    /// Number of calibration samples
    #[arg(long, default_value_t = 200)]
    num_samples: usize,

    /// Model input size
    #[arg(long, default_value_t = 608)]
    input_size: u32,

    /// Mean normalization values
    #[arg(long, num_args = 3, default_values_t = [0.485f32, 0.456, 0.406])]
    mean: Vec<f32>,

    /// Std normalization values
    #[arg(long, num_args = 3, default_values_t = [0.229f32, 0.224, 0.225])]
    std: Vec<f32>,

    /// Per-channel weight quantization
    #[arg(long)]
    per_channel: bool,

    /// Calibration method (minmax|entropy)
    #[arg(long, default_value = "minmax")]
    calib_method: CalibMethod,

    /// Run onnxruntime graph optimization first
    #[arg(long)]
    optimize: bool,

    /// Run symbolic shape inference first
    #[arg(long)]
    shape_infer: bool,

    /// Keep the calibration tensors in this directory
    #[arg(long, value_name = "DIR")]
    keep_calibration: Option<PathBuf>,

    /// Python interpreter with onnxruntime (overrides MOUSEDET_PYTHON)
    #[arg(long)]
    python: Option<String>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn triple(values: &[f32]) -> [f32; 3] {
    [values[0], values[1], values[2]]
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(
        Some(&args.ui),
        std::io::stderr().is_terminal(),
        !std::io::stdout().is_terminal(),
    );
    let config = OpsConfig::load()?;
    let python = args.python.clone().unwrap_or(config.python);

    let mut options = QuantizeOptions::new(args.input, args.output, args.calib_dir);
    options.num_samples = args.num_samples;
    options.input_size = args.input_size;
    options.mean = triple(&args.mean);
    options.std = triple(&args.std);
    options.per_channel = args.per_channel;
    options.calib_method = args.calib_method;
    options.optimize = args.optimize;
    options.shape_infer = args.shape_infer;

    let images = options.validate()?;
    let work = tempfile::tempdir()?;
    let dir = args
        .keep_calibration
        .clone()
        .unwrap_or_else(|| work.path().to_path_buf());
    let manifest = {
        let stage = ui.progress("Preprocess calibration images", images.len() as u64);
        write_calibration_set(&images, &options, &dir, |done| {
            stage.set_position(done as u64)
        })?
    };
    {
        let _stage = ui.stage("Quantize");
        run_driver(&python, &manifest)?;
    }
    println!("quantized model saved: {}", options.output.display());
    Ok(())
}
