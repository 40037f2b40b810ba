use crate::core::asset::Thumbnail;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, GenericImageView, ImageDecoder, ImageReader};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_THUMBNAIL_SIZE: u32 = 512;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid path: {path}")]
    InvalidPath { path: String },
}

/// Downsamples library images to a small, aspect-preserving thumbnail before
/// feature extraction.
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailService {
    thumbnail_size: u32,
}

impl ThumbnailService {
    pub fn new() -> Self {
        Self::with_size(DEFAULT_THUMBNAIL_SIZE)
    }

    pub fn with_size(thumbnail_size: u32) -> Self {
        Self {
            thumbnail_size: thumbnail_size.max(1),
        }
    }

    pub fn thumbnail_size(&self) -> u32 {
        self.thumbnail_size
    }

    /// Decode `path` and shrink it so the longest side is at most the
    /// configured size. The EXIF orientation is reported, not applied.
    pub fn load(&self, path: &Path) -> Result<Thumbnail, ThumbnailError> {
        if !path.is_file() {
            return Err(ThumbnailError::InvalidPath {
                path: path.to_string_lossy().to_string(),
            });
        }

        let mut decoder = ImageReader::open(path)?
            .with_guessed_format()?
            .into_decoder()?;
        let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
        let img = DynamicImage::from_decoder(decoder)?;

        Ok(Thumbnail {
            image: self.fit(img),
            orientation,
        })
    }

    /// Shrink `img` to fit the thumbnail size. Smaller images pass through.
    pub fn fit(&self, img: DynamicImage) -> DynamicImage {
        let (width, height) = img.dimensions();
        if width.max(height) <= self.thumbnail_size {
            return img;
        }

        let target_size = self.thumbnail_size;
        let (new_width, new_height) = if width > height {
            let ratio = target_size as f32 / width as f32;
            (target_size, ((height as f32 * ratio) as u32).max(1))
        } else {
            let ratio = target_size as f32 / height as f32;
            (((width as f32 * ratio) as u32).max(1), target_size)
        };

        img.resize_exact(new_width, new_height, FilterType::Triangle)
    }
}

impl Default for ThumbnailService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_image(
        path: &Path,
        width: u32,
        height: u32,
    ) -> Result<(), Box<dyn std::error::Error>> {
        use image::{ImageBuffer, Rgb};

        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let intensity = ((x + y) % 256) as u8;
            Rgb([intensity, intensity, intensity])
        });

        img.save(path)?;
        Ok(())
    }

    #[test]
    fn test_load_shrinks_large_image() {
        let service = ThumbnailService::new();
        let temp_dir = TempDir::new().unwrap();

        let original_path = temp_dir.path().join("test.png");
        create_test_image(&original_path, 1920, 1080).unwrap();

        let thumbnail = service.load(&original_path).unwrap();
        let (width, height) = thumbnail.image.dimensions();
        assert!(width <= 512 && height <= 512);
        assert!(width == 512 || height == 512);
        assert_eq!(thumbnail.orientation, Orientation::NoTransforms);
    }

    #[test]
    fn test_aspect_ratio_preservation() {
        let service = ThumbnailService::new();

        let wide = service.fit(DynamicImage::new_rgb8(1920, 1080));
        let (w_width, w_height) = wide.dimensions();
        assert_eq!(w_width, 512);
        assert!(w_height < 512);

        let tall = service.fit(DynamicImage::new_rgb8(1080, 1920));
        let (t_width, t_height) = tall.dimensions();
        assert_eq!(t_height, 512);
        assert!(t_width < 512);
    }

    #[test]
    fn test_small_images_are_untouched() {
        let service = ThumbnailService::with_size(64);
        let small = service.fit(DynamicImage::new_rgb8(40, 20));
        assert_eq!(small.dimensions(), (40, 20));
    }

    #[test]
    fn test_missing_file_is_invalid_path() {
        let service = ThumbnailService::new();
        let temp_dir = TempDir::new().unwrap();

        let result = service.load(&temp_dir.path().join("nonexistent.jpg"));
        assert!(matches!(result, Err(ThumbnailError::InvalidPath { .. })));
    }

    #[test]
    fn test_corrupt_file_is_image_error() {
        let service = ThumbnailService::new();
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        assert!(service.load(&path).is_err());
    }
}
