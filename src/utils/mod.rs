pub mod image_processing;

// Re-export commonly used items
pub use image_processing::{
    encode_jpeg, encode_png, normalize_channels, normalize_intensity, CropBox, Geometry,
    IntensityImage, NormalizedImage, ProcessedImage, CROP_SIZE, PREVIEW_JPEG_QUALITY, RESIZE_SIZE,
};
