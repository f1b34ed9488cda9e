use std::fmt;
use std::path::Path;

use serde::Serialize;
use snafu::prelude::*;
use tracing::{debug, info};

use crate::classifier::{LazyClassifier, PredictedClass, ScoreVector};
use crate::dicom::{self, DicomImageInfo};
use crate::error::{DecodeImageSnafu, FailedSnafu, ReadInputSnafu, Result, WriteOutputSnafu};
use crate::tensor::{decode_png_tensor, encode_processed, ClassifierTensor};
use crate::utils::{
    encode_jpeg, normalize_channels, normalize_intensity, CropBox, Geometry, NormalizedImage,
    PREVIEW_JPEG_QUALITY,
};

/// States an image passes through on its way to a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    Received,
    Decoded,
    Normalized,
    Cropped,
    Encoded,
    Scored,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "Received",
            Stage::Decoded => "Decoded",
            Stage::Normalized => "Normalized",
            Stage::Cropped => "Cropped",
            Stage::Encoded => "Encoded",
            Stage::Scored => "Scored",
            Stage::Done => "Done",
        };
        f.write_str(name)
    }
}

/// Container format of an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Dicom,
    Raster,
}

impl InputKind {
    /// DICOM if the name ends in `.dcm`/`.dicom` or the bytes carry the `DICM` magic.
    pub fn detect(name: Option<&str>, bytes: &[u8]) -> InputKind {
        let by_name = name
            .and_then(|n| Path::new(n).extension())
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("dcm") || ext.eq_ignore_ascii_case("dicom"))
            .unwrap_or(false);

        if by_name || dicom::has_dicm_magic(bytes) {
            InputKind::Dicom
        } else {
            InputKind::Raster
        }
    }
}

/// An image as received by the pipeline.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub name: Option<String>,
    pub bytes: Vec<u8>,
}

impl ImageInput {
    pub fn new(bytes: Vec<u8>) -> Self {
        ImageInput { name: None, bytes }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).context(ReadInputSnafu { path })?;
        Ok(ImageInput {
            name: path.file_name().map(|n| n.to_string_lossy().into_owned()),
            bytes,
        })
    }

    pub fn kind(&self) -> InputKind {
        InputKind::detect(self.name.as_deref(), &self.bytes)
    }
}

/// Everything the classifier needs, plus what is reported about the source.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub tensor: ClassifierTensor,
    pub crop_box: CropBox,
    pub source_width: u32,
    pub source_height: u32,
    pub kind: InputKind,
    pub dicom: Option<DicomImageInfo>,
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub predicted_class: PredictedClass,
    pub scores: ScoreVector,
    pub crop_box: CropBox,
    pub source_width: u32,
    pub source_height: u32,
    pub kind: InputKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dicom: Option<DicomImageInfo>,
}

/// A decoded input at source resolution, before any geometry is applied.
#[derive(Debug, Clone)]
pub struct NormalizedInput {
    pub image: NormalizedImage,
    pub kind: InputKind,
    pub dicom: Option<DicomImageInfo>,
}

/// Write a normalized image as a JPEG preview at `out`, creating parent directories.
pub fn write_preview(image: &NormalizedImage, out: &Path) -> Result<()> {
    let jpeg = encode_jpeg(image.as_rgb(), PREVIEW_JPEG_QUALITY)?;

    if let Some(dir) = out.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).context(WriteOutputSnafu { path: dir })?;
    }
    std::fs::write(out, jpeg).context(WriteOutputSnafu { path: out })?;
    info!("Wrote preview {}", out.display());
    Ok(())
}

/// Runs inputs through decode, normalization, crop, encoding and scoring.
pub struct Pipeline<'a> {
    geometry: Geometry,
    classifier: &'a LazyClassifier,
}

impl<'a> Pipeline<'a> {
    pub fn new(geometry: Geometry, classifier: &'a LazyClassifier) -> Self {
        Pipeline {
            geometry,
            classifier,
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Classify one input. Errors are wrapped with the stage that could not be produced.
    pub fn run(&self, input: &ImageInput) -> Result<Classification> {
        let normalized = self.normalize(input)?;
        self.run_normalized(input, normalized)
    }

    /// Finish a run from an input that was already normalized.
    pub fn run_normalized(
        &self,
        input: &ImageInput,
        normalized: NormalizedInput,
    ) -> Result<Classification> {
        let prepared = self.prepare_normalized(input, normalized)?;

        let scores = self
            .classifier
            .score(&prepared.tensor)
            .context(FailedSnafu {
                stage: Stage::Scored,
            })?;
        debug!("{:?}: {}", input.name, Stage::Scored);

        let predicted_class = scores.argmax();
        debug!("{:?}: {} (class {})", input.name, Stage::Done, predicted_class);

        Ok(Classification {
            name: input.name.clone(),
            predicted_class,
            scores,
            crop_box: prepared.crop_box,
            source_width: prepared.source_width,
            source_height: prepared.source_height,
            kind: prepared.kind,
            dicom: prepared.dicom,
        })
    }

    /// Everything up to the classifier boundary.
    pub fn prepare(&self, input: &ImageInput) -> Result<Prepared> {
        let normalized = self.normalize(input)?;
        self.prepare_normalized(input, normalized)
    }

    fn prepare_normalized(&self, input: &ImageInput, normalized: NormalizedInput) -> Result<Prepared> {
        let (source_width, source_height) = normalized.image.dimensions();

        let processed = self.geometry.apply(&normalized.image);
        debug!("{:?}: {} {:?}", input.name, Stage::Cropped, processed.dimensions());

        let tensor = encode_processed(&processed)
            .and_then(|png| decode_png_tensor(&png))
            .context(FailedSnafu {
                stage: Stage::Encoded,
            })?;
        debug!("{:?}: {} {:?}", input.name, Stage::Encoded, tensor.shape());

        Ok(Prepared {
            tensor,
            crop_box: self.geometry.crop_box(),
            source_width,
            source_height,
            kind: normalized.kind,
            dicom: normalized.dicom,
        })
    }

    /// Decode and normalize to 8-bit RGB at source resolution.
    pub fn normalize(&self, input: &ImageInput) -> Result<NormalizedInput> {
        let kind = input.kind();
        debug!("{:?}: {} {:?}, {} bytes", input.name, Stage::Received, kind, input.bytes.len());

        let normalized = match kind {
            InputKind::Dicom => {
                let decoded = dicom::decode(&input.bytes).context(FailedSnafu {
                    stage: Stage::Decoded,
                })?;
                debug!("{:?}: {}", input.name, Stage::Decoded);

                let image = normalize_intensity(&decoded.pixels)
                    .into_rgb()
                    .context(FailedSnafu {
                        stage: Stage::Normalized,
                    })?;
                NormalizedInput {
                    image,
                    kind,
                    dicom: Some(decoded.info),
                }
            }
            InputKind::Raster => {
                let img = image::load_from_memory(&input.bytes)
                    .context(DecodeImageSnafu)
                    .context(FailedSnafu {
                        stage: Stage::Decoded,
                    })?;
                debug!("{:?}: {} {:?}", input.name, Stage::Decoded, img.color());

                NormalizedInput {
                    image: normalize_channels(img),
                    kind,
                    dicom: None,
                }
            }
        };
        debug!("{:?}: {} {:?}", input.name, Stage::Normalized, normalized.image.dimensions());
        Ok(normalized)
    }
}
