use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::{imageops::FilterType, DynamicImage, ImageFormat as ImageLibFormat};

use crate::config::CodecParams;
use crate::models::ImageFormat;

const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Result of a resize attempt. Failures are captured in `error`, the
/// function contract is non-throwing.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub content_type: String,
    pub data: Option<Bytes>,
    pub error: Option<String>,
}

impl ImageData {
    fn failed(content_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Offloads the CPU-bound decode/resize/encode to a blocking thread; the
/// event loop never runs codec work.
pub async fn resize_image_async(
    data: Bytes,
    width: u32,
    height: u32,
    target_format: Option<ImageFormat>,
    params: Option<CodecParams>,
) -> ImageData {
    let handle = tokio::task::spawn_blocking(move || {
        resize_image(&data, width, height, target_format, params)
    });
    match handle.await {
        Ok(result) => result,
        Err(e) => ImageData::failed("", format!("Join error in resize: {}", e)),
    }
}

/// Scales the image down to fit inside `(width, height)` preserving the
/// aspect ratio, never upscaling, and re-encodes it into `target_format`
/// when given, the source format otherwise.
pub fn resize_image(
    data: &[u8],
    width: u32,
    height: u32,
    target_format: Option<ImageFormat>,
    params: Option<CodecParams>,
) -> ImageData {
    if width == 0 || height == 0 {
        return ImageData::failed("", format!("Invalid target size {}x{}", width, height));
    }

    let source_format = match image::guess_format(data) {
        Ok(format) => format,
        Err(e) => return ImageData::failed("", format!("Unrecognized image format: {}", e)),
    };
    let source_mime = source_format.to_mime_type().to_string();

    let img = match image::load_from_memory_with_format(data, source_format) {
        Ok(img) => img,
        Err(e) => return ImageData::failed(source_mime, format!("Failed to decode image: {}", e)),
    };

    let original = (img.width(), img.height());
    let target = fit_within(original, width, height);
    let resized = if target != original {
        img.resize(target.0, target.1, FilterType::Triangle)
    } else {
        img
    };

    let (output_format, content_type, resized) = match target_format {
        Some(format) => {
            let converted = convert_for_format(resized, format);
            (lib_format(format), format.mime_type().to_string(), converted)
        }
        None => (source_format, source_mime, resized),
    };

    let params = params.unwrap_or_default();
    let mut buffer = Vec::new();
    let mut cursor = Cursor::new(&mut buffer);
    let encoded = match output_format {
        ImageLibFormat::Jpeg => {
            let quality = params.quality.unwrap_or(DEFAULT_JPEG_QUALITY);
            let encoder = JpegEncoder::new_with_quality(&mut cursor, quality);
            resized.write_with_encoder(encoder)
        }
        ImageLibFormat::Png => {
            let compression = if params.optimize {
                CompressionType::Best
            } else {
                CompressionType::Default
            };
            let encoder = PngEncoder::new_with_quality(
                &mut cursor,
                compression,
                PngFilterType::Adaptive,
            );
            resized.write_with_encoder(encoder)
        }
        format => resized.write_to(&mut cursor, format),
    };

    match encoded {
        Ok(()) => ImageData {
            content_type,
            data: Some(Bytes::from(buffer)),
            error: None,
        },
        Err(e) => ImageData::failed(content_type, format!("Encoding failed: {}", e)),
    }
}

/// Largest size that fits inside `(width, height)` keeping the source
/// aspect ratio; the source size when it is already within bounds.
fn fit_within(original: (u32, u32), width: u32, height: u32) -> (u32, u32) {
    let (ow, oh) = original;
    if ow <= width && oh <= height {
        return original;
    }

    let ratio = (width as f32 / ow as f32).min(height as f32 / oh as f32);
    (
        ((ow as f32 * ratio) as u32).max(1),
        ((oh as f32 * ratio) as u32).max(1),
    )
}

/// JPEG can't carry alpha, so conversion flattens to RGB. PNG keeps the
/// decoded color mode and is only re-encoded.
fn convert_for_format(img: DynamicImage, format: ImageFormat) -> DynamicImage {
    match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()),
        ImageFormat::Png => img,
    }
}

fn lib_format(format: ImageFormat) -> ImageLibFormat {
    match format {
        ImageFormat::Png => ImageLibFormat::Png,
        ImageFormat::Jpeg => ImageLibFormat::Jpeg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([10, 120, 40])));
        let mut buffer = Vec::new();
        img.write_to(&mut Cursor::new(&mut buffer), ImageLibFormat::Png)
            .unwrap();
        buffer
    }

    #[test]
    fn resize_fits_within_bounds_preserving_ratio() {
        let source = png_bytes(400, 300);
        let result = resize_image(&source, 100, 100, None, None);

        assert!(result.error.is_none(), "error: {:?}", result.error);
        assert_eq!(result.content_type, "image/png");

        let thumb = image::load_from_memory(&result.data.unwrap()).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (100, 75));
    }

    #[test]
    fn resize_never_upscales() {
        let source = png_bytes(50, 40);
        let result = resize_image(&source, 200, 200, None, None);

        let thumb = image::load_from_memory(&result.data.unwrap()).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (50, 40));
    }

    #[test]
    fn converts_to_jpeg_on_request() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            300,
            300,
            Rgba([10, 120, 40, 128]),
        ));
        let mut source = Vec::new();
        img.write_to(&mut Cursor::new(&mut source), ImageLibFormat::Png)
            .unwrap();

        let result = resize_image(&source, 100, 100, Some(ImageFormat::Jpeg), None);
        assert!(result.error.is_none(), "error: {:?}", result.error);
        assert_eq!(result.content_type, "image/jpeg");

        let data = result.data.unwrap();
        assert_eq!(
            image::guess_format(&data).unwrap(),
            ImageLibFormat::Jpeg
        );
    }

    #[test]
    fn jpeg_quality_param_changes_encoding() {
        let source = png_bytes(300, 300);
        let low = resize_image(
            &source,
            200,
            200,
            Some(ImageFormat::Jpeg),
            Some(CodecParams {
                quality: Some(10),
                optimize: true,
            }),
        );
        let high = resize_image(
            &source,
            200,
            200,
            Some(ImageFormat::Jpeg),
            Some(CodecParams {
                quality: Some(95),
                optimize: true,
            }),
        );
        assert!(low.data.unwrap().len() <= high.data.unwrap().len());
    }

    #[test]
    fn garbage_input_is_captured_not_thrown() {
        let result = resize_image(b"definitely not an image", 100, 100, None, None);
        assert!(result.data.is_none());
        assert!(result.error.is_some());
    }

    #[test]
    fn zero_target_size_is_an_error() {
        let source = png_bytes(10, 10);
        let result = resize_image(&source, 0, 100, None, None);
        assert!(result.error.is_some());
    }

    #[test]
    fn fit_within_rounds_down_and_stays_positive() {
        assert_eq!(fit_within((400, 300), 100, 100), (100, 75));
        assert_eq!(fit_within((300, 400), 100, 100), (75, 100));
        assert_eq!(fit_within((1000, 1), 10, 10), (10, 1));
        assert_eq!(fit_within((80, 60), 100, 100), (80, 60));
    }

    #[tokio::test]
    async fn async_wrapper_runs_off_the_event_loop() {
        let source = Bytes::from(png_bytes(400, 300));
        let result = resize_image_async(source, 100, 100, None, None).await;
        assert!(result.error.is_none());
        assert!(result.data.is_some());
    }
}
