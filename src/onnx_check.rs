//! Smoke test for exported PaddleDetection ONNX models.
//!
//! Feeds one random image through the graph with `tract` and reports the
//! input facts and output shapes. Detector exports take three inputs,
//! matched by name: `image`, `im_shape` and `scale_factor`.

use anyhow::{anyhow, bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use tract_onnx::prelude::*;

#[derive(Debug, Clone)]
pub struct InputInfo {
    pub name: String,
    pub fact: String,
}

#[derive(Debug, Clone)]
pub struct SmokeReport {
    pub inputs: Vec<InputInfo>,
    pub output_shapes: Vec<Vec<usize>>,
    /// Second output of a detector export: boxes kept per image.
    pub box_counts: Option<Vec<i64>>,
}

fn input_tensor(name: &str, size: usize, rng: &mut StdRng) -> Result<Tensor> {
    let tensor = match name {
        "image" => {
            tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |_| rng.gen::<f32>())
                .into_tensor()
        }
        "im_shape" => tract_ndarray::arr2(&[[size as f32, size as f32]]).into_tensor(),
        "scale_factor" => tract_ndarray::arr2(&[[1.0f32, 1.0]]).into_tensor(),
        other => bail!("unexpected model input '{}'", other),
    };
    Ok(tensor)
}

/// Loads `model_path`, runs one random `size`x`size` image and reports shapes.
pub fn smoke_test(model_path: &Path, size: u32, seed: Option<u64>) -> Result<SmokeReport> {
    let mut model = tract_onnx::onnx()
        .model_for_path(model_path)
        .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?;

    let names: Vec<String> = model
        .input_outlets()?
        .iter()
        .map(|outlet| model.node(outlet.node).name.clone())
        .collect();
    let mut inputs = Vec::with_capacity(names.len());
    for (idx, name) in names.iter().enumerate() {
        inputs.push(InputInfo {
            name: name.clone(),
            fact: format!("{:?}", model.input_fact(idx)?),
        });
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut values: TVec<TValue> = TVec::new();
    for (idx, name) in names.iter().enumerate() {
        let tensor = input_tensor(name, size as usize, &mut rng)?;
        let shape: TVec<usize> = tensor.shape().iter().copied().collect();
        model = model
            .with_input_fact(idx, InferenceFact::dt_shape(f32::datum_type(), shape))
            .with_context(|| format!("failed to set input fact for {}", name))?;
        values.push(tensor.into());
    }

    let plan = model
        .into_optimized()
        .context("failed to optimize ONNX model")?
        .into_runnable()
        .context("failed to build runnable ONNX model")?;
    let outputs = plan.run(values).context("ONNX inference failed")?;
    if outputs.is_empty() {
        return Err(anyhow!("model produced no outputs"));
    }

    let output_shapes = outputs.iter().map(|t| t.shape().to_vec()).collect();
    let box_counts = match outputs.get(1) {
        Some(counts) => Some(
            counts
                .cast_to::<i64>()
                .context("box count output is not numeric")?
                .as_slice::<i64>()?
                .to_vec(),
        ),
        None => None,
    };
    Ok(SmokeReport {
        inputs,
        output_shapes,
        box_counts,
    })
}
