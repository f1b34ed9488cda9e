#![deny(clippy::all)]

pub mod classifier;
pub mod dicom;
pub mod error;
pub mod pipeline;
pub mod tensor;
pub mod utils;

pub use classifier::{default_classifier, LazyClassifier, OnnxModelFactory, PredictedClass, ScoreVector};
pub use error::{Error, ErrorKind, Result};
pub use pipeline::{Classification, ImageInput, InputKind, NormalizedInput, Pipeline, Stage};
pub use utils::{CropBox, Geometry};
