use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::file::ReadPreamble;
use dicom_object::{DefaultDicomObject, InMemDicomObject, OpenFileOptions};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use serde::Serialize;
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::error::{
    CodecUnavailableSnafu, ConvertFieldSnafu, EmptyImageSnafu, MissingAttributeSnafu, ParseDicomSnafu,
    PixelDataLengthSnafu, Result, UnsupportedBitDepthSnafu,
};

/// Numeric type of the samples stored in the pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
}

impl SampleType {
    /// Derive the sample type from Bits Allocated and Pixel Representation.
    pub fn from_layout(bits_allocated: u16, pixel_representation: u16) -> Result<Self> {
        let signed = pixel_representation == 1;
        Ok(match (bits_allocated, signed) {
            (8, false) => SampleType::U8,
            (8, true) => SampleType::I8,
            (16, false) => SampleType::U16,
            (16, true) => SampleType::I16,
            (32, false) => SampleType::U32,
            (32, true) => SampleType::I32,
            _ => return UnsupportedBitDepthSnafu { bits_allocated }.fail(),
        })
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleType::U8 | SampleType::I8 => 1,
            SampleType::U16 | SampleType::I16 => 2,
            SampleType::U32 | SampleType::I32 => 4,
        }
    }

    fn is_signed(self) -> bool {
        matches!(self, SampleType::I8 | SampleType::I16 | SampleType::I32)
    }
}

/// Dense pixel samples of a single frame, channels interleaved.
///
/// Values keep their original numeric range; converting them to 8 bits is
/// the job of the intensity normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPixelBuffer {
    width: u32,
    height: u32,
    channels: u16,
    dtype: SampleType,
    samples: Vec<f64>,
}

impl RawPixelBuffer {
    /// Build a buffer from already-decoded sample values.
    ///
    /// Fails when `samples` does not hold exactly `width * height * channels` values.
    pub fn new(
        width: u32,
        height: u32,
        channels: u16,
        dtype: SampleType,
        samples: Vec<f64>,
    ) -> Result<Self> {
        let expected = width as usize * height as usize * channels as usize;
        ensure!(
            samples.len() == expected,
            PixelDataLengthSnafu {
                expected,
                actual: samples.len()
            }
        );
        Ok(RawPixelBuffer {
            width,
            height,
            channels,
            dtype,
            samples,
        })
    }

    /// Interpret little endian frame bytes.
    ///
    /// `bits_stored` narrower than the allocated width is masked (unsigned)
    /// or sign-extended (signed). Colour-by-plane data is re-interleaved.
    pub fn from_le_bytes(
        width: u32,
        height: u32,
        channels: u16,
        dtype: SampleType,
        bits_stored: u16,
        planar: bool,
        bytes: &[u8],
    ) -> Result<Self> {
        let count = width as usize * height as usize * channels as usize;
        let step = dtype.bytes_per_sample();
        let expected = count * step;
        ensure!(
            bytes.len() >= expected,
            PixelDataLengthSnafu {
                expected,
                actual: bytes.len()
            }
        );

        let allocated = (step * 8) as u32;
        let stored = (bits_stored as u32).clamp(1, allocated);
        let samples: Vec<f64> = bytes[..expected]
            .chunks_exact(step)
            .map(|chunk| {
                let mut raw = [0u8; 4];
                raw[..step].copy_from_slice(chunk);
                sample_value(u32::from_le_bytes(raw), stored, dtype.is_signed())
            })
            .collect();

        let samples = if planar && channels > 1 {
            interleave_planes(&samples, channels as usize)
        } else {
            samples
        };

        RawPixelBuffer::new(width, height, channels, dtype, samples)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn dtype(&self) -> SampleType {
        self.dtype
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }
}

fn sample_value(raw: u32, stored: u32, signed: bool) -> f64 {
    let mask = if stored >= 32 { u32::MAX } else { (1u32 << stored) - 1 };
    let value = raw & mask;
    if signed {
        let shift = 32 - stored;
        (((value << shift) as i32) >> shift) as f64
    } else {
        value as f64
    }
}

fn interleave_planes(samples: &[f64], channels: usize) -> Vec<f64> {
    let plane = samples.len() / channels;
    let mut out = Vec::with_capacity(samples.len());
    for i in 0..plane {
        for c in 0..channels {
            out.push(samples[c * plane + i]);
        }
    }
    out
}

/// Image-level attributes read alongside the pixel data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DicomImageInfo {
    pub rows: u32,
    pub columns: u32,
    pub frames: u32,
    pub samples_per_pixel: u16,
    pub bits_allocated: u16,
    pub bits_stored: u16,
    pub pixel_representation: u16,
    pub planar_configuration: u16,
    pub photometric_interpretation: Option<String>,
    pub transfer_syntax_uid: String,
    pub is_compressed: bool,
    pub modality: Option<String>,
    pub sop_instance_uid: Option<String>,
}

impl DicomImageInfo {
    pub fn from_object(obj: &DefaultDicomObject) -> Result<Self> {
        let rows = required_u32(obj, tags::ROWS)?;
        let columns = required_u32(obj, tags::COLUMNS)?;
        let bits_allocated = required_u32(obj, tags::BITS_ALLOCATED)? as u16;
        let bits_stored = optional_u32(obj, tags::BITS_STORED)
            .map(|v| v as u16)
            .unwrap_or(bits_allocated);

        let transfer_syntax_uid = obj.meta().transfer_syntax.trim_end_matches('\0').to_string();
        let is_compressed = TransferSyntaxRegistry
            .get(&transfer_syntax_uid)
            .map(|ts| !ts.is_codec_free())
            .unwrap_or(true);

        Ok(DicomImageInfo {
            rows,
            columns,
            frames: optional_u32(obj, tags::NUMBER_OF_FRAMES).unwrap_or(1),
            samples_per_pixel: optional_u32(obj, tags::SAMPLES_PER_PIXEL).unwrap_or(1) as u16,
            bits_allocated,
            bits_stored,
            pixel_representation: optional_u32(obj, tags::PIXEL_REPRESENTATION).unwrap_or(0) as u16,
            planar_configuration: optional_u32(obj, tags::PLANAR_CONFIGURATION).unwrap_or(0) as u16,
            photometric_interpretation: optional_str(obj, tags::PHOTOMETRIC_INTERPRETATION),
            transfer_syntax_uid,
            is_compressed,
            modality: optional_str(obj, tags::MODALITY),
            sop_instance_uid: optional_str(obj, tags::SOP_INSTANCE_UID),
        })
    }

    pub fn sample_type(&self) -> Result<SampleType> {
        SampleType::from_layout(self.bits_allocated, self.pixel_representation)
    }
}

fn required_u32(obj: &InMemDicomObject, tag: Tag) -> Result<u32> {
    obj.element(tag)
        .context(MissingAttributeSnafu { tag })?
        .to_int::<u32>()
        .context(ConvertFieldSnafu { tag })
}

fn optional_u32(obj: &InMemDicomObject, tag: Tag) -> Option<u32> {
    obj.element(tag).ok().and_then(|e| e.to_int::<u32>().ok())
}

fn optional_str(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Which pixel data encodings this build can turn into samples.
pub struct PixelCodecs;

impl PixelCodecs {
    /// Whether pixel data in the given transfer syntax can be decoded.
    ///
    /// Without the `transcode` feature only native (uncompressed) syntaxes
    /// are readable.
    pub fn can_decode(transfer_syntax_uid: &str) -> bool {
        let uid = transfer_syntax_uid.trim_end_matches('\0');
        match TransferSyntaxRegistry.get(uid) {
            Some(ts) if cfg!(feature = "transcode") => ts.can_decode_all(),
            Some(ts) => ts.is_codec_free(),
            None => false,
        }
    }
}

/// Output of the DICOM decoder.
#[derive(Debug, Clone)]
pub struct DecodedDicom {
    pub info: DicomImageInfo,
    pub pixels: RawPixelBuffer,
}

/// Whether the bytes carry the `DICM` magic after the 128-byte preamble.
pub fn has_dicm_magic(bytes: &[u8]) -> bool {
    bytes.len() >= 132 && &bytes[128..132] == b"DICM"
}

/// Decode a DICOM byte stream into the samples of its first frame.
pub fn decode(bytes: &[u8]) -> Result<DecodedDicom> {
    let obj = OpenFileOptions::new()
        .read_preamble(ReadPreamble::Auto)
        .from_reader(bytes)
        .map_err(Box::from)
        .context(ParseDicomSnafu)?;

    let info = DicomImageInfo::from_object(&obj)?;
    debug!(
        "DICOM {}x{}, {} samples/pixel, {} bits allocated, transfer syntax {}",
        info.columns,
        info.rows,
        info.samples_per_pixel,
        info.bits_allocated,
        info.transfer_syntax_uid
    );

    ensure!(
        info.rows > 0 && info.columns > 0,
        EmptyImageSnafu {
            width: info.columns,
            height: info.rows
        }
    );
    ensure!(
        PixelCodecs::can_decode(&info.transfer_syntax_uid),
        CodecUnavailableSnafu {
            uid: info.transfer_syntax_uid.clone()
        }
    );

    if info.frames > 1 {
        warn!("Multi-frame object with {} frames, using the first frame", info.frames);
    }

    let dtype = info.sample_type()?;
    let frame = first_frame_bytes(&obj, &info, dtype)?;
    let pixels = RawPixelBuffer::from_le_bytes(
        info.columns,
        info.rows,
        info.samples_per_pixel,
        dtype,
        info.bits_stored,
        info.planar_configuration == 1 && !info.is_compressed,
        &frame,
    )?;

    Ok(DecodedDicom { info, pixels })
}

fn frame_size(info: &DicomImageInfo, dtype: SampleType) -> usize {
    info.rows as usize
        * info.columns as usize
        * info.samples_per_pixel as usize
        * dtype.bytes_per_sample()
}

#[cfg(feature = "transcode")]
fn first_frame_bytes(
    obj: &DefaultDicomObject,
    info: &DicomImageInfo,
    dtype: SampleType,
) -> Result<Vec<u8>> {
    use crate::error::DecodePixelDataSnafu;
    use dicom_pixeldata::PixelDecoder;

    let decoded = obj
        .decode_pixel_data()
        .map_err(Box::from)
        .context(DecodePixelDataSnafu)?;
    let data = decoded.data();

    let frame_size = frame_size(info, dtype);
    ensure!(
        data.len() >= frame_size,
        PixelDataLengthSnafu {
            expected: frame_size,
            actual: data.len()
        }
    );
    Ok(data[..frame_size].to_vec())
}

#[cfg(not(feature = "transcode"))]
fn first_frame_bytes(
    obj: &DefaultDicomObject,
    info: &DicomImageInfo,
    dtype: SampleType,
) -> Result<Vec<u8>> {
    use crate::error::{BoxedError, ReadPixelDataSnafu};

    let pixel_data = obj
        .element(tags::PIXEL_DATA)
        .context(MissingAttributeSnafu { tag: tags::PIXEL_DATA })?;
    let bytes = pixel_data
        .to_bytes()
        .map_err(BoxedError::from)
        .context(ReadPixelDataSnafu)?;

    let frame_size = frame_size(info, dtype);
    ensure!(
        bytes.len() >= frame_size,
        PixelDataLengthSnafu {
            expected: frame_size,
            actual: bytes.len()
        }
    );
    Ok(bytes[..frame_size].to_vec())
}
