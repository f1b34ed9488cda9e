use std::path::{Path, PathBuf};
use std::sync::Arc;

use snafu::prelude::*;
use tracing::{debug, info};

use super::{Scorer, ScorerFactory};
use crate::error::{ModelNotFoundSnafu, Result};
use crate::tensor::InputScaling;
use crate::utils::CROP_SIZE;

/// Directory holding model artifacts, relative to the executable or working directory.
pub const MODEL_DIR: &str = "models";
/// File name of the exported classifier.
pub const MODEL_FILE_NAME: &str = "ett_model_resnet_cropped.onnx";
/// Environment variable overriding the model location.
pub const MODEL_PATH_ENV: &str = "ETT_MODEL_PATH";

/// Resolve the location of the bundled model.
///
/// `ETT_MODEL_PATH` wins; otherwise `models/` next to the executable, then
/// one directory above it, then relative to the working directory.
pub fn resolve_default_path() -> PathBuf {
    if let Some(path) = std::env::var_os(MODEL_PATH_ENV) {
        return PathBuf::from(path);
    }

    let relative = Path::new(MODEL_DIR).join(MODEL_FILE_NAME);
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        for candidate in [exe_dir.join(&relative), exe_dir.join("..").join(&relative)] {
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    relative
}

/// Loads an ONNX export of the trained classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnnxModelFactory {
    path: PathBuf,
    scaling: InputScaling,
    input_size: (u32, u32),
}

impl OnnxModelFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        OnnxModelFactory {
            path: path.into(),
            scaling: InputScaling::default(),
            input_size: (CROP_SIZE, CROP_SIZE),
        }
    }

    pub fn default_location() -> Self {
        Self::new(resolve_default_path())
    }

    pub fn with_scaling(mut self, scaling: InputScaling) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn with_input_size(mut self, width: u32, height: u32) -> Self {
        self.input_size = (width, height);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scaling(&self) -> InputScaling {
        self.scaling
    }
}

impl ScorerFactory for OnnxModelFactory {
    fn load(&self) -> Result<Arc<dyn Scorer>> {
        ensure!(
            self.path.is_file(),
            ModelNotFoundSnafu {
                path: self.path.clone()
            }
        );
        info!("Loading ONNX model from {}", self.path.display());

        #[cfg(feature = "onnx")]
        {
            let scorer = backend::OnnxScorer::load(&self.path, self.scaling, self.input_size)?;
            debug!("Model ready, input scaling {:?}", self.scaling);
            Ok(Arc::new(scorer))
        }

        #[cfg(not(feature = "onnx"))]
        {
            debug!("Built without the 'onnx' feature");
            crate::error::ModelSupportMissingSnafu.fail()
        }
    }
}

#[cfg(feature = "onnx")]
mod backend {
    use std::path::Path;

    use snafu::prelude::*;
    use tract_onnx::prelude::*;

    use crate::classifier::{ScoreVector, Scorer};
    use crate::error::{BoxedError, InferenceSnafu, LoadModelSnafu, Result};
    use crate::tensor::{ClassifierTensor, InputScaling};

    pub struct OnnxScorer {
        plan: TypedRunnableModel<TypedModel>,
        scaling: InputScaling,
    }

    impl OnnxScorer {
        pub fn load(path: &Path, scaling: InputScaling, input_size: (u32, u32)) -> Result<Self> {
            let (width, height) = input_size;
            let plan = tract_onnx::onnx()
                .model_for_path(path)
                .and_then(|model| {
                    model.with_input_fact(
                        0,
                        f32::fact([1, height as usize, width as usize, 3]).into(),
                    )
                })
                .and_then(|model| model.into_optimized())
                .and_then(|model| model.into_runnable())
                .map_err(BoxedError::from)
                .context(LoadModelSnafu { path })?;
            Ok(OnnxScorer { plan, scaling })
        }
    }

    impl Scorer for OnnxScorer {
        fn score(&self, tensor: &ClassifierTensor) -> Result<ScoreVector> {
            let input = tensor.to_f32(self.scaling);
            let data: Vec<f32> = input.iter().copied().collect();
            let input = Tensor::from_shape(input.shape(), &data)
                .map_err(BoxedError::from)
                .context(InferenceSnafu)?;

            let outputs = self
                .plan
                .run(tvec!(input.into()))
                .map_err(BoxedError::from)
                .context(InferenceSnafu)?;

            let scores: Vec<f32> = match outputs.first() {
                Some(output) => output
                    .to_array_view::<f32>()
                    .map_err(BoxedError::from)
                    .context(InferenceSnafu)?
                    .iter()
                    .copied()
                    .collect(),
                None => Vec::new(),
            };
            ScoreVector::new(scores)
        }
    }
}
