use image::RgbImage;
use ndarray::{Array4, ArrayView4};
use serde::Serialize;
use snafu::prelude::*;

use crate::error::{DecodeImageSnafu, Result, TensorShapeSnafu};
use crate::utils::{encode_png, normalize_channels, ProcessedImage};

/// How pixel values are presented to the scoring function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputScaling {
    /// Raw 8-bit values in `[0, 255]`
    #[default]
    Raw,
    /// Values divided by 255 into `[0, 1]`
    Unit,
}

/// Batch of one RGB image in NHWC layout, shape `(1, H, W, 3)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierTensor {
    data: Array4<u8>,
}

impl ClassifierTensor {
    /// Build the tensor straight from the processed image.
    pub fn from_image(img: &ProcessedImage) -> Result<Self> {
        Self::from_rgb(img.as_rgb().clone())
    }

    fn from_rgb(img: RgbImage) -> Result<Self> {
        let (width, height) = img.dimensions();
        let shape = (1, height as usize, width as usize, 3);
        let data = Array4::from_shape_vec(shape, img.into_raw())
            .context(TensorShapeSnafu { shape: vec![shape.0, shape.1, shape.2, shape.3] })?;
        Ok(ClassifierTensor { data })
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn view(&self) -> ArrayView4<'_, u8> {
        self.data.view()
    }

    /// Values as `f32` in the requested scaling.
    pub fn to_f32(&self, scaling: InputScaling) -> Array4<f32> {
        match scaling {
            InputScaling::Raw => self.data.mapv(f32::from),
            InputScaling::Unit => self.data.mapv(|v| f32::from(v) / 255.0),
        }
    }
}

/// Serialize the processed image as PNG, the format consumed at the classifier boundary.
pub fn encode_processed(img: &ProcessedImage) -> Result<Vec<u8>> {
    encode_png(img.as_rgb())
}

/// Decode PNG bytes into a classifier tensor.
///
/// Grayscale PNGs get their single channel replicated to three.
pub fn decode_png_tensor(png: &[u8]) -> Result<ClassifierTensor> {
    let img = image::load_from_memory_with_format(png, image::ImageFormat::Png)
        .context(DecodeImageSnafu)?;
    ClassifierTensor::from_rgb(normalize_channels(img).into_rgb())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{Geometry, NormalizedImage};
    use image::{GrayImage, ImageBuffer, Luma, Rgb};

    fn processed() -> ProcessedImage {
        let img = ImageBuffer::from_fn(700, 500, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 3 % 256) as u8, ((x ^ y) % 256) as u8])
        });
        Geometry::default().apply(&NormalizedImage::from(img))
    }

    #[test]
    fn test_png_round_trip_is_pixel_identical() {
        let img = processed();
        let png = encode_processed(&img).unwrap();
        assert_eq!(&png[1..4], b"PNG");

        let decoded = image::load_from_memory(&png).unwrap().to_rgb8();
        assert_eq!(&decoded, img.as_rgb());

        let through_png = decode_png_tensor(&png).unwrap();
        let direct = ClassifierTensor::from_image(&img).unwrap();
        assert_eq!(through_png, direct);
    }

    #[test]
    fn test_tensor_layout() {
        let img = processed();
        let tensor = ClassifierTensor::from_image(&img).unwrap();
        assert_eq!(tensor.shape(), &[1, 512, 512, 3]);

        let p = img.as_rgb().get_pixel(100, 40).0;
        let view = tensor.view();
        assert_eq!(
            [view[[0, 40, 100, 0]], view[[0, 40, 100, 1]], view[[0, 40, 100, 2]]],
            p
        );
    }

    #[test]
    fn test_grayscale_png_is_replicated() {
        let gray = GrayImage::from_fn(8, 8, |x, y| Luma([(x * 8 + y) as u8]));
        let mut png = Vec::new();
        gray.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let tensor = decode_png_tensor(&png).unwrap();
        assert_eq!(tensor.shape(), &[1, 8, 8, 3]);
        let view = tensor.view();
        assert_eq!(view[[0, 3, 5, 0]], 43);
        assert_eq!(view[[0, 3, 5, 1]], 43);
        assert_eq!(view[[0, 3, 5, 2]], 43);
    }

    #[test]
    fn test_input_scaling() {
        let tensor = ClassifierTensor::from_image(&processed()).unwrap();
        let raw = tensor.to_f32(InputScaling::Raw);
        let unit = tensor.to_f32(InputScaling::Unit);
        assert!(raw.iter().all(|&v| (0.0..=255.0).contains(&v)));
        assert!(unit.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert_eq!(raw[[0, 0, 0, 0]] / 255.0, unit[[0, 0, 0, 0]]);
    }

    #[test]
    fn test_decode_garbage() {
        let err = decode_png_tensor(b"\x89PNG but not really").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Decode);
    }
}
