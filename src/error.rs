use std::path::PathBuf;

use dicom_core::Tag;
use snafu::Snafu;

use crate::pipeline::Stage;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Boxed error coming out of an inference backend.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Could not parse DICOM data
    ParseDicom {
        source: Box<dicom_object::ReadError>,
    },

    /// Missing DICOM attribute {tag}
    MissingAttribute {
        tag: Tag,
        source: dicom_object::AccessError,
    },

    /// Could not convert DICOM attribute {tag}
    ConvertField {
        tag: Tag,
        source: dicom_core::value::ConvertValueError,
    },

    /// Could not read pixel data
    ReadPixelData { source: BoxedError },

    /// Pixel data in transfer syntax {uid} cannot be decoded, codec support is not available
    CodecUnavailable { uid: String },

    #[cfg(feature = "transcode")]
    /// Could not decode pixel data
    DecodePixelData {
        source: Box<dicom_pixeldata::Error>,
    },

    /// Unsupported pixel layout: {bits_allocated} bits allocated
    UnsupportedBitDepth { bits_allocated: u16 },

    /// Image has no pixels: {width}x{height}
    EmptyImage { width: u32, height: u32 },

    /// Pixel data too short: expected {expected} bytes, found {actual}
    PixelDataLength { expected: usize, actual: usize },

    /// Could not decode image container
    DecodeImage { source: image::ImageError },

    /// Unsupported channel layout: {channels} channels (expected 1 or 3)
    UnsupportedChannelLayout { channels: u16 },

    /// Invalid geometry: crop {crop:?} does not fit into resize target {resize:?}
    InvalidGeometry { resize: (u32, u32), crop: (u32, u32) },

    /// Could not encode {format} image
    EncodeImage {
        format: &'static str,
        source: image::ImageError,
    },

    /// Classifier tensor has shape {shape:?}, expected (1, H, W, 3)
    TensorShape {
        shape: Vec<usize>,
        source: ndarray::ShapeError,
    },

    #[snafu(display("Classifier model not found at {}", path.display()))]
    ModelNotFound { path: PathBuf },

    #[snafu(display("Could not load classifier model from {}", path.display()))]
    LoadModel { path: PathBuf, source: BoxedError },

    /// Classifier support was not compiled in
    ModelSupportMissing,

    /// Classifier inference failed
    Inference { source: BoxedError },

    /// Classifier returned {len} scores, at least 2 are required
    NotEnoughScores { len: usize },

    #[snafu(display("Could not read input file {}", path.display()))]
    ReadInput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not write output file {}", path.display()))]
    WriteOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Pipeline failed while producing {stage}
    Failed {
        stage: Stage,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
}

/// Coarse classification of pipeline failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Decode,
    UnsupportedChannelLayout,
    ModelUnavailable,
    Inference,
    Encode,
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ParseDicom { .. }
            | Error::MissingAttribute { .. }
            | Error::ConvertField { .. }
            | Error::ReadPixelData { .. }
            | Error::CodecUnavailable { .. }
            | Error::UnsupportedBitDepth { .. }
            | Error::PixelDataLength { .. }
            | Error::EmptyImage { .. }
            | Error::DecodeImage { .. } => ErrorKind::Decode,
            #[cfg(feature = "transcode")]
            Error::DecodePixelData { .. } => ErrorKind::Decode,
            Error::UnsupportedChannelLayout { .. } => ErrorKind::UnsupportedChannelLayout,
            Error::ModelNotFound { .. }
            | Error::LoadModel { .. }
            | Error::ModelSupportMissing => ErrorKind::ModelUnavailable,
            Error::Inference { .. } | Error::NotEnoughScores { .. } => ErrorKind::Inference,
            Error::EncodeImage { .. } | Error::TensorShape { .. } => ErrorKind::Encode,
            Error::InvalidGeometry { .. }
            | Error::ReadInput { .. }
            | Error::WriteOutput { .. } => ErrorKind::Config,
            Error::Failed { source, .. } => source.kind(),
        }
    }

    /// The pipeline stage that failed, if this error came out of the orchestrator.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Failed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_delegates_kind_to_source() {
        let err = Error::Failed {
            stage: Stage::Normalized,
            source: Box::new(Error::UnsupportedChannelLayout { channels: 4 }),
        };
        assert_eq!(err.kind(), ErrorKind::UnsupportedChannelLayout);
        assert_eq!(err.stage(), Some(Stage::Normalized));
        assert_eq!(
            err.to_string(),
            "Pipeline failed while producing Normalized"
        );
    }

    #[test]
    fn model_errors_are_model_unavailable() {
        let err = Error::ModelNotFound { path: PathBuf::from("models/x.onnx") };
        assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
        assert_eq!(err.stage(), None);
        assert_eq!(err.to_string(), "Classifier model not found at models/x.onnx");
    }
}
