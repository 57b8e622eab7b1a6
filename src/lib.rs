//! Mouse detection training operations
//!
//! Tooling around a PaddleDetection checkout used to train mouse/other
//! detectors and ship them to mobile.
//!
//! # Module Structure
//!
//! - `voc`: Pascal VOC annotation parsing and rewriting
//! - `dataset`: file lists, subsets, multi-source merges, id splits
//! - `launcher`: sequential training-run matrices with DONE flags and a summary CSV
//! - `viewer`: annotation browser and inference web service
//! - `log_sink`: receiver for logs posted by the mobile app
//! - `quantize`: static INT8 quantization of exported ONNX models
//! - `onnx_check`: ONNX smoke test (feature `onnx-check`)
//! - `vdl`: VisualDL to TensorBoard log conversion
//! - `config`: layered configuration and the checkout layout

pub mod config;
pub mod dataset;
pub mod http;
pub mod launcher;
pub mod log_sink;
#[cfg(feature = "onnx-check")]
pub mod onnx_check;
pub mod quantize;
pub mod vdl;
pub mod viewer;
pub mod voc;

pub use config::{OpsConfig, Workspace};
pub use dataset::{build_subset, split_ids, FileListEntry, MergePlan, NamePattern};
pub use launcher::{RunMatrix, RunSpec, Supervisor};
pub use voc::{VocAnnotation, VocObject};
