//! Thumbnail generation for received files.

use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, GenericImageView, ImageFormat};

use crate::error::{Error, Result};

/// Thumbnails fit inside a `THUMBNAIL_MAX` x `THUMBNAIL_MAX` box.
pub const THUMBNAIL_MAX: u32 = 128;

const SUPPORTED: &[ImageFormat] = &[
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::Gif,
    ImageFormat::Bmp,
    ImageFormat::WebP,
    ImageFormat::Ico,
    ImageFormat::Tiff,
];

/// PNG thumbnail of `content`, or an empty vector when the file is not a
/// supported raster image. Decode failures are logged, never returned.
pub fn generate(file_name: &str, content: &[u8]) -> Vec<u8> {
    match thumbnail(file_name, content) {
        Ok(Some(png)) => png,
        Ok(None) => Vec::new(),
        Err(e) => {
            tracing::warn!("No preview for {}: {}", file_name, e);
            Vec::new()
        }
    }
}

/// Reads `path` and builds its preview on the blocking pool. Files above
/// `max_source_bytes` are skipped.
pub async fn generate_for_file(path: &Path, file_name: &str, max_source_bytes: u64) -> Vec<u8> {
    let len = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            tracing::warn!("Cannot stat {} for preview: {}", path.display(), e);
            return Vec::new();
        }
    };
    if len == 0 || len > max_source_bytes {
        return Vec::new();
    }

    let content = match tokio::fs::read(path).await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Cannot read {} for preview: {}", path.display(), e);
            return Vec::new();
        }
    };
    let name = file_name.to_string();
    tokio::task::spawn_blocking(move || generate(&name, &content))
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("Preview task failed: {}", e);
            Vec::new()
        })
}

fn detect_format(file_name: &str, content: &[u8]) -> Option<ImageFormat> {
    image::guess_format(content)
        .ok()
        .filter(|f| SUPPORTED.contains(f))
        .or_else(|| {
            ImageFormat::from_path(file_name)
                .ok()
                .filter(|f| SUPPORTED.contains(f))
        })
}

fn thumbnail(file_name: &str, content: &[u8]) -> Result<Option<Vec<u8>>> {
    let Some(format) = detect_format(file_name, content) else {
        return Ok(None);
    };

    let img = image::load_from_memory_with_format(content, format)
        .map_err(|e| Error::PreviewDecodeFailure(e.to_string()))?;

    let (w, h) = img.dimensions();
    let thumb: DynamicImage = if w > THUMBNAIL_MAX || h > THUMBNAIL_MAX {
        img.thumbnail(THUMBNAIL_MAX, THUMBNAIL_MAX)
    } else {
        img
    };

    let mut out = Cursor::new(Vec::new());
    thumb
        .into_rgba8()
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| Error::PreviewDecodeFailure(e.to_string()))?;
    Ok(Some(out.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbImage};

    fn encoded(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_large_png_is_bounded() {
        let preview = generate("wide.png", &encoded(300, 200, ImageFormat::Png));
        assert!(!preview.is_empty());

        let decoded = image::load_from_memory(&preview).unwrap();
        let (w, h) = decoded.dimensions();
        assert_eq!(w, THUMBNAIL_MAX);
        assert!(h <= THUMBNAIL_MAX && h > 0);
    }

    #[test]
    fn test_jpeg_sniffed_without_extension() {
        let preview = generate("camera_upload", &encoded(640, 640, ImageFormat::Jpeg));
        let decoded = image::load_from_memory(&preview).unwrap();
        assert_eq!(decoded.dimensions(), (THUMBNAIL_MAX, THUMBNAIL_MAX));
    }

    #[test]
    fn test_small_image_not_upscaled() {
        let preview = generate("icon.png", &encoded(40, 30, ImageFormat::Png));
        let decoded = image::load_from_memory(&preview).unwrap();
        assert_eq!(decoded.dimensions(), (40, 30));
    }

    #[test]
    fn test_non_image_is_empty() {
        assert!(generate("notes.txt", b"just some text").is_empty());
        assert!(generate("empty.bin", b"").is_empty());
    }

    #[test]
    fn test_corrupt_image_is_empty() {
        let mut png = encoded(64, 64, ImageFormat::Png);
        png.truncate(40);
        assert!(generate("broken.png", &png).is_empty());
        assert!(generate("fake.jpg", b"definitely not a jpeg").is_empty());
    }

    #[tokio::test]
    async fn test_generate_for_file_respects_size_cap() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("big.png");
        let png = encoded(200, 200, ImageFormat::Png);
        std::fs::write(&path, &png).unwrap();

        assert!(!generate_for_file(&path, "big.png", u64::MAX).await.is_empty());
        assert!(generate_for_file(&path, "big.png", 10).await.is_empty());
    }
}
