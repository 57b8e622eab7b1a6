//! Static INT8 quantization of exported detector ONNX models.
//!
//! Calibration images are decoded and normalized here, written as raw
//! tensors, and handed to onnxruntime's `quantize_static` (QDQ format,
//! unsigned 8-bit activations, signed 8-bit weights) through a Python driver.

use anyhow::{anyhow, bail, Context, Result};
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use walkdir::WalkDir;

use crate::launcher::CommandLine;

const DRIVER_SCRIPT: &str = include_str!("../../assets/quantize_driver.py");
pub const MANIFEST_FILE: &str = "manifest.json";
pub const INPUT_NAMES: [&str; 3] = ["image", "im_shape", "scale_factor"];
const CALIBRATION_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibMethod {
    #[default]
    MinMax,
    Entropy,
}

impl FromStr for CalibMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "minmax" => Ok(CalibMethod::MinMax),
            "entropy" => Ok(CalibMethod::Entropy),
            other => Err(anyhow!("unknown calibration method '{}' (minmax|entropy)", other)),
        }
    }
}

impl fmt::Display for CalibMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CalibMethod::MinMax => "minmax",
            CalibMethod::Entropy => "entropy",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QuantizeOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub calib_dir: PathBuf,
    pub num_samples: usize,
    pub input_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub per_channel: bool,
    pub calib_method: CalibMethod,
    pub optimize: bool,
    pub shape_infer: bool,
}

impl QuantizeOptions {
    pub fn new(input: PathBuf, output: PathBuf, calib_dir: PathBuf) -> Self {
        Self {
            input,
            output,
            calib_dir,
            num_samples: 200,
            input_size: 608,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
            per_channel: false,
            calib_method: CalibMethod::MinMax,
            optimize: false,
            shape_infer: false,
        }
    }

    /// Checks the inputs and returns the calibration images to use.
    pub fn validate(&self) -> Result<Vec<PathBuf>> {
        if !self.input.exists() {
            bail!("input model not found: {}", self.input.display());
        }
        if !self.calib_dir.is_dir() {
            bail!("calibration dir not found: {}", self.calib_dir.display());
        }
        if self.input_size == 0 || self.num_samples == 0 {
            bail!("input_size and num_samples must be positive");
        }
        if self.std.iter().any(|s| *s == 0.0) {
            bail!("std values must be non-zero");
        }
        let mut images = list_calibration_images(&self.calib_dir);
        if images.is_empty() {
            bail!("no images found in calib_dir: {}", self.calib_dir.display());
        }
        images.truncate(self.num_samples);
        Ok(images)
    }
}

/// `.jpg`, `.jpeg` and `.png` files anywhere under `dir`, sorted by path.
pub fn list_calibration_images(dir: &Path) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| CALIBRATION_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    images.sort();
    images
}

/// Dense row-major `f32` tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            bail!("shape {:?} needs {} values, got {}", shape, expected, data.len());
        }
        Ok(Self { shape, data })
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.data.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

/// The three model inputs for one image.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationSample {
    pub source: PathBuf,
    pub image: Tensor,
    pub im_shape: Tensor,
    pub scale_factor: Tensor,
}

impl CalibrationSample {
    fn tensors(&self) -> [(&'static str, &Tensor); 3] {
        [
            ("image", &self.image),
            ("im_shape", &self.im_shape),
            ("scale_factor", &self.scale_factor),
        ]
    }
}

/// RGB, bilinear resize to `size`x`size`, scale to [0, 1], normalize, NCHW.
pub fn preprocess(path: &Path, size: u32, mean: [f32; 3], std: [f32; 3]) -> Result<CalibrationSample> {
    let rgb = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        bail!("empty image: {}", path.display());
    }
    let resized = image::imageops::resize(&rgb, size, size, FilterType::Triangle);

    let plane = (size * size) as usize;
    let mut chw = vec![0f32; 3 * plane];
    for (idx, pixel) in resized.pixels().enumerate() {
        for c in 0..3 {
            chw[c * plane + idx] = (pixel[c] as f32 / 255.0 - mean[c]) / std[c];
        }
    }
    let s = size as usize;
    let side = size as f32;
    Ok(CalibrationSample {
        source: path.to_path_buf(),
        image: Tensor::new(vec![1, 3, s, s], chw)?,
        im_shape: Tensor::new(vec![1, 2], vec![side, side])?,
        scale_factor: Tensor::new(vec![1, 2], vec![side / height as f32, side / width as f32])?,
    })
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ManifestSample {
    pub source: PathBuf,
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub per_channel: bool,
    pub calib_method: CalibMethod,
    pub optimize: bool,
    pub shape_infer: bool,
    pub shapes: BTreeMap<String, Vec<usize>>,
    pub samples: Vec<ManifestSample>,
}

/// Writes calibration samples to disk as they are produced.
///
/// Only file names and tensor shapes are kept in memory; `finish` writes
/// `manifest.json` for the driver.
#[derive(Debug)]
pub struct CalibrationWriter {
    dir: PathBuf,
    shapes: BTreeMap<String, Vec<usize>>,
    samples: Vec<ManifestSample>,
}

impl CalibrationWriter {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            shapes: BTreeMap::new(),
            samples: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Writes one little-endian `f32` file per tensor of `sample`.
    pub fn push(&mut self, sample: &CalibrationSample) -> Result<()> {
        let idx = self.samples.len();
        let mut files = BTreeMap::new();
        for (name, tensor) in sample.tensors() {
            match self.shapes.get(name) {
                Some(shape) if *shape != tensor.shape => bail!(
                    "{}: {} has shape {:?}, expected {:?}",
                    sample.source.display(),
                    name,
                    tensor.shape,
                    shape
                ),
                Some(_) => {}
                None => {
                    self.shapes.insert(name.to_string(), tensor.shape.clone());
                }
            }
            let file = format!("{idx:05}_{name}.bin");
            std::fs::write(self.dir.join(&file), tensor.to_le_bytes())
                .with_context(|| format!("failed to write {}", file))?;
            files.insert(name.to_string(), file);
        }
        self.samples.push(ManifestSample {
            source: sample.source.clone(),
            files,
        });
        Ok(())
    }

    /// Writes `manifest.json` and returns its path.
    pub fn finish(self, options: &QuantizeOptions) -> Result<PathBuf> {
        if self.samples.is_empty() {
            bail!("calibration set is empty");
        }
        let manifest = Manifest {
            input: absolute(&options.input)?,
            output: absolute(&options.output)?,
            per_channel: options.per_channel,
            calib_method: options.calib_method,
            optimize: options.optimize,
            shape_infer: options.shape_infer,
            shapes: self.shapes,
            samples: self.samples,
        };
        let path = self.dir.join(MANIFEST_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(&manifest)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

/// Preprocesses `images` one at a time into `dir`, calling `progress` after
/// each, and returns the manifest path.
pub fn write_calibration_set(
    images: &[PathBuf],
    options: &QuantizeOptions,
    dir: &Path,
    mut progress: impl FnMut(usize),
) -> Result<PathBuf> {
    let mut writer = CalibrationWriter::create(dir)?;
    for path in images {
        let sample = preprocess(path, options.input_size, options.mean, options.std)?;
        writer.push(&sample)?;
        progress(writer.len());
    }
    writer.finish(options)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Writes the driver next to `manifest` and builds its invocation.
pub fn driver_command(python: &str, manifest: &Path) -> Result<CommandLine> {
    let dir = manifest
        .parent()
        .ok_or_else(|| anyhow!("manifest has no parent directory"))?;
    let driver = dir.join("quantize_driver.py");
    std::fs::write(&driver, DRIVER_SCRIPT)
        .with_context(|| format!("failed to write {}", driver.display()))?;
    Ok(CommandLine::new(python)
        .arg(driver.display().to_string())
        .arg(manifest.display().to_string()))
}

/// Runs the driver over an already written calibration set.
pub fn run_driver(python: &str, manifest: &Path) -> Result<()> {
    let cmd = driver_command(python, manifest)?;
    log::info!("running {}", cmd);
    let cwd = std::env::current_dir()?;
    let status = cmd
        .to_command(&cwd)
        .stdin(Stdio::null())
        .status()
        .with_context(|| format!("failed to start {}", python))?;
    if !status.success() {
        bail!("quantization driver failed ({})", status);
    }
    Ok(())
}

/// Validates, preprocesses the calibration images and quantizes the model.
pub fn quantize(options: &QuantizeOptions, python: &str) -> Result<PathBuf> {
    let images = options.validate()?;
    log::info!(
        "calibrating with {} images from {}",
        images.len(),
        options.calib_dir.display()
    );
    let work = tempfile::tempdir()?;
    let manifest = write_calibration_set(&images, options, work.path(), |_| {})?;
    run_driver(python, &manifest)?;
    Ok(options.output.clone())
}
