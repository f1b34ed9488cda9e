use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageBuffer, Luma, RgbImage};
use serde::Serialize;
use snafu::prelude::*;

use crate::dicom::RawPixelBuffer;
use crate::error::{
    EncodeImageSnafu, InvalidGeometrySnafu, Result, UnsupportedChannelLayoutSnafu,
};

/// Side length the input is resized to before cropping.
pub const RESIZE_SIZE: u32 = 1024;
/// Side length of the classifier input.
pub const CROP_SIZE: u32 = 512;
/// JPEG quality used for viewing renditions of DICOM studies.
pub const PREVIEW_JPEG_QUALITY: u8 = 95;

/// 8-bit samples with the layout of the buffer they were normalized from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntensityImage {
    width: u32,
    height: u32,
    channels: u16,
    data: Vec<u8>,
}

impl IntensityImage {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Channel normalization of DICOM-derived samples.
    ///
    /// One channel is replicated three times, three channels pass through.
    pub fn into_rgb(self) -> Result<NormalizedImage> {
        match self.channels {
            1 => {
                let gray = GrayImage::from_raw(self.width, self.height, self.data)
                    .context(UnsupportedChannelLayoutSnafu { channels: 1u16 })?;
                Ok(NormalizedImage(grayscale_to_rgb(&gray)))
            }
            3 => {
                let rgb = RgbImage::from_raw(self.width, self.height, self.data)
                    .context(UnsupportedChannelLayoutSnafu { channels: 3u16 })?;
                Ok(NormalizedImage(rgb))
            }
            channels => UnsupportedChannelLayoutSnafu { channels }.fail(),
        }
    }
}

/// Linear min-max scaling of arbitrary samples into `[0, 255]`.
///
/// A constant buffer maps to all zeros. The mapping is lossy.
pub fn normalize_intensity(raw: &RawPixelBuffer) -> IntensityImage {
    let samples = raw.samples();
    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let data = if max > min {
        let range = max - min;
        samples
            .iter()
            .map(|&v| (((v - min) / range) * 255.0).round().clamp(0.0, 255.0) as u8)
            .collect()
    } else {
        vec![0u8; samples.len()]
    };

    IntensityImage {
        width: raw.width(),
        height: raw.height(),
        channels: raw.channels(),
        data,
    }
}

/// RGB image, 8 bits per channel, any size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage(RgbImage);

impl NormalizedImage {
    pub fn as_rgb(&self) -> &RgbImage {
        &self.0
    }

    pub fn into_rgb(self) -> RgbImage {
        self.0
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }
}

impl From<RgbImage> for NormalizedImage {
    fn from(img: RgbImage) -> Self {
        NormalizedImage(img)
    }
}

/// Channel normalization of a decoded raster image.
///
/// Grayscale is replicated exactly, RGB passes through, any other colour
/// type is converted to RGB (alpha dropped, deep samples reduced to 8 bits).
pub fn normalize_channels(img: DynamicImage) -> NormalizedImage {
    match img {
        DynamicImage::ImageLuma8(gray) => NormalizedImage(grayscale_to_rgb(&gray)),
        DynamicImage::ImageRgb8(rgb) => NormalizedImage(rgb),
        other => NormalizedImage(other.to_rgb8()),
    }
}

/// Convert grayscale image to RGB
fn grayscale_to_rgb(img: &ImageBuffer<Luma<u8>, Vec<u8>>) -> RgbImage {
    ImageBuffer::from_fn(img.width(), img.height(), |x, y| {
        let gray = img.get_pixel(x, y).0[0];
        image::Rgb([gray, gray, gray])
    })
}

/// Crop rectangle in pixel coordinates, `right` and `lower` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CropBox {
    pub left: u32,
    pub upper: u32,
    pub right: u32,
    pub lower: u32,
}

impl CropBox {
    /// Horizontally centred, top-aligned box of the given size.
    pub fn top_center(width: u32, crop_width: u32, crop_height: u32) -> Self {
        let left = (width - crop_width) / 2;
        let upper = 0;
        CropBox {
            left,
            upper,
            right: left + crop_width,
            lower: upper + crop_height,
        }
    }

    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.lower - self.upper
    }
}

/// Resize-then-crop transform producing the classifier input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    resize: (u32, u32),
    crop: (u32, u32),
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            resize: (RESIZE_SIZE, RESIZE_SIZE),
            crop: (CROP_SIZE, CROP_SIZE),
        }
    }
}

impl Geometry {
    pub fn new(resize: (u32, u32), crop: (u32, u32)) -> Result<Self> {
        ensure!(
            crop.0 > 0 && crop.1 > 0 && crop.0 <= resize.0 && crop.1 <= resize.1,
            InvalidGeometrySnafu { resize, crop }
        );
        Ok(Geometry { resize, crop })
    }

    pub fn resize_size(&self) -> (u32, u32) {
        self.resize
    }

    pub fn crop_size(&self) -> (u32, u32) {
        self.crop
    }

    pub fn crop_box(&self) -> CropBox {
        CropBox::top_center(self.resize.0, self.crop.0, self.crop.1)
    }

    /// Lanczos3 resize to the target size, then crop.
    ///
    /// The resize is skipped when the image already has the target size.
    pub fn apply(&self, img: &NormalizedImage) -> ProcessedImage {
        let (width, height) = self.resize;
        let resized;
        let source = if img.dimensions() == (width, height) {
            img.as_rgb()
        } else {
            resized = image::imageops::resize(
                img.as_rgb(),
                width,
                height,
                image::imageops::FilterType::Lanczos3,
            );
            &resized
        };

        let b = self.crop_box();
        let cropped = image::imageops::crop_imm(source, b.left, b.upper, b.width(), b.height()).to_image();
        ProcessedImage(cropped)
    }
}

/// RGB image with exactly the crop size of the geometry that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedImage(RgbImage);

impl ProcessedImage {
    pub fn as_rgb(&self) -> &RgbImage {
        &self.0
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }
}

/// Encode an RGB image as JPEG
pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    let mut jpeg_encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, quality);
    jpeg_encoder
        .encode(img, img.width(), img.height(), image::ExtendedColorType::Rgb8)
        .context(EncodeImageSnafu { format: "JPEG" })?;
    Ok(output)
}

/// Encode an RGB image as PNG
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    img.write_to(&mut Cursor::new(&mut output), image::ImageFormat::Png)
        .context(EncodeImageSnafu { format: "PNG" })?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dicom::SampleType;
    use crate::error::ErrorKind;
    use image::{GenericImageView, Rgb};

    fn gradient(width: u32, height: u32) -> RgbImage {
        ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn test_constant_buffer_maps_to_zero() {
        for value in [0.0, 17.0, 4095.0, -1024.0] {
            let raw = RawPixelBuffer::new(3, 2, 1, SampleType::I16, vec![value; 6]).unwrap();
            let out = normalize_intensity(&raw);
            assert_eq!(out.data(), &[0u8; 6]);
        }
    }

    #[test]
    fn test_min_max_scaling() {
        let raw = RawPixelBuffer::new(3, 1, 1, SampleType::U16, vec![10.0, 60.0, 110.0]).unwrap();
        let out = normalize_intensity(&raw);
        // (60 - 10) / 100 * 255 = 127.5, rounded half away from zero
        assert_eq!(out.data(), &[0, 128, 255]);
    }

    #[test]
    fn test_normalization_is_not_invertible() {
        // 4096 distinct inputs collapse onto at most 256 outputs
        let samples: Vec<f64> = (0..4096).map(f64::from).collect();
        let raw = RawPixelBuffer::new(64, 64, 1, SampleType::U16, samples).unwrap();
        let out = normalize_intensity(&raw);
        let mut distinct = out.data().to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), 256);
    }

    #[test]
    fn test_grayscale_replication() {
        for value in [0u8, 1, 128, 255] {
            let img = IntensityImage {
                width: 4,
                height: 3,
                channels: 1,
                data: vec![value; 12],
            };
            let rgb = img.into_rgb().unwrap();
            assert!(rgb.as_rgb().pixels().all(|p| p.0 == [value, value, value]));
        }

        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(5, 5, Luma([42])));
        let rgb = normalize_channels(gray);
        assert!(rgb.as_rgb().pixels().all(|p| p.0 == [42, 42, 42]));
    }

    #[test]
    fn test_rgb_passes_through() {
        let img = gradient(7, 5);
        let out = normalize_channels(DynamicImage::ImageRgb8(img.clone()));
        assert_eq!(out.as_rgb(), &img);

        let intensity = IntensityImage {
            width: 7,
            height: 5,
            channels: 3,
            data: img.as_raw().clone(),
        };
        assert_eq!(intensity.into_rgb().unwrap().as_rgb(), &img);
    }

    #[test]
    fn test_other_colour_types_convert_to_rgb() {
        let rgba = image::RgbaImage::from_fn(4, 4, |x, y| {
            image::Rgba([x as u8 * 10, y as u8 * 10, 99, (x * y) as u8])
        });
        let out = normalize_channels(DynamicImage::ImageRgba8(rgba));
        assert_eq!(out.dimensions(), (4, 4));
        assert_eq!(out.as_rgb().get_pixel(3, 2).0, [30, 20, 99]);
        assert_eq!(out.as_rgb().get_pixel(0, 0).0, [0, 0, 99]);

        let deep = image::ImageBuffer::from_fn(3, 1, |x, _| Luma([[0u16, 25700, 65535][x as usize]]));
        let out = normalize_channels(DynamicImage::ImageLuma16(deep));
        assert_eq!(out.as_rgb().get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(out.as_rgb().get_pixel(1, 0).0, [100, 100, 100]);
        assert_eq!(out.as_rgb().get_pixel(2, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_unsupported_channel_layout() {
        for channels in [2u16, 4] {
            let img = IntensityImage {
                width: 2,
                height: 2,
                channels,
                data: vec![0; 4 * channels as usize],
            };
            let err = img.into_rgb().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnsupportedChannelLayout);
        }
    }

    #[test]
    fn test_default_crop_box() {
        let b = Geometry::default().crop_box();
        assert_eq!(
            b,
            CropBox {
                left: 256,
                upper: 0,
                right: 768,
                lower: 512
            }
        );
    }

    #[test]
    fn test_output_is_512_for_any_aspect_ratio() {
        let geometry = Geometry::default();
        for (w, h) in [(2048, 1536), (300, 900), (1024, 1024), (17, 5), (640, 480)] {
            let out = geometry.apply(&NormalizedImage::from(gradient(w, h)));
            assert_eq!(out.dimensions(), (512, 512), "input {}x{}", w, h);
        }
    }

    #[test]
    fn test_identity_at_target_resolution() {
        let geometry = Geometry::new((512, 512), (512, 512)).unwrap();
        assert_eq!(
            geometry.crop_box(),
            CropBox {
                left: 0,
                upper: 0,
                right: 512,
                lower: 512
            }
        );
        let img = gradient(512, 512);
        let out = geometry.apply(&NormalizedImage::from(img.clone()));
        assert_eq!(out.as_rgb(), &img);
    }

    #[test]
    fn test_crop_selects_top_center_of_resized_image() {
        let img = gradient(1024, 1024);
        let out = Geometry::default().apply(&NormalizedImage::from(img.clone()));
        let expected = img.view(256, 0, 512, 512).to_image();
        assert_eq!(out.as_rgb(), &expected);
    }

    #[test]
    fn test_resize_matches_reference_values() {
        // vertical edge at x = 1024 of a 2048x1536 image lands on crop column 256
        let img = ImageBuffer::from_fn(2048, 1536, |x, _| {
            if x < 1024 {
                Rgb([20, 230, 90])
            } else {
                Rgb([200, 30, 90])
            }
        });
        let out = Geometry::default().apply(&NormalizedImage::from(img));

        // Lanczos3 ringing around the edge, columns 250..=259
        let red = [20, 20, 20, 21, 17, 30, 190, 203, 199, 200];
        let green = [230, 230, 230, 229, 233, 219, 41, 27, 31, 30];
        for y in [0, 200, 511] {
            for (i, x) in (250..260).enumerate() {
                assert_eq!(
                    out.as_rgb().get_pixel(x, y).0,
                    [red[i], green[i], 90],
                    "pixel ({}, {})",
                    x,
                    y
                );
            }
        }
        assert_eq!(out.as_rgb().get_pixel(0, 0).0, [20, 230, 90]);
        assert_eq!(out.as_rgb().get_pixel(511, 511).0, [200, 30, 90]);
    }

    #[test]
    fn test_resize_of_constant_image_is_constant() {
        let img = RgbImage::from_pixel(300, 200, Rgb([77, 77, 77]));
        let out = Geometry::default().apply(&NormalizedImage::from(img));
        assert!(out.as_rgb().pixels().all(|p| p.0 == [77, 77, 77]));
    }

    #[test]
    fn test_geometry_is_deterministic() {
        let img = NormalizedImage::from(gradient(731, 419));
        let geometry = Geometry::default();
        assert_eq!(geometry.apply(&img), geometry.apply(&img));
    }

    #[test]
    fn test_invalid_geometry() {
        let err = Geometry::new((256, 256), (512, 512)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(Geometry::new((1024, 1024), (0, 512)).is_err());
    }

    #[test]
    fn test_encode_jpeg() {
        let jpeg = encode_jpeg(&gradient(64, 32), PREVIEW_JPEG_QUALITY).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (64, 32));
    }
}
