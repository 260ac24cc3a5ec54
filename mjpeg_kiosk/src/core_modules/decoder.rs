// THEORY:
// Decoding is the expensive step of the pipeline and the one most likely to meet
// garbage: a camera mid-reboot, a truncated upload, a corrupt boundary. The
// `FrameDecoder` trait isolates it so the display loop can be driven by a fake
// decoder in tests and by a real JPEG decoder in production.
//
// Key architectural principles:
// 1.  **Fit, never overflow**: The result always fits inside the target size.
//     Larger frames are scaled down preserving aspect ratio; smaller ones are
//     left alone and letterboxed later by the raster.
// 2.  **Bounded allocation**: The decoder refuses absurd dimensions before
//     allocating, so a corrupt header cannot take down the kiosk.
// 3.  **Errors are per frame**: A failure here never ends the pipeline.

use crate::error::DecodeError;
use image::imageops::FilterType;
use image::{ImageFormat, ImageReader, Limits, RgbaImage};
use std::io::Cursor;

/// Largest width or height accepted from a camera frame.
const MAX_FRAME_DIMENSION: u32 = 8192;
/// Decoder allocation ceiling per frame.
const MAX_DECODE_ALLOC: u64 = 256 * 1024 * 1024;

pub trait FrameDecoder {
    /// Decodes `data` into RGBA pixels no larger than `width` x `height`.
    fn decode(&mut self, data: &[u8], width: u32, height: u32) -> Result<RgbaImage, DecodeError>;
}

/// JPEG decoder backed by the `image` crate.
pub struct JpegFrameDecoder {
    limits: Limits,
    filter: FilterType,
}

impl Default for JpegFrameDecoder {
    fn default() -> Self {
        let mut limits = Limits::default();
        limits.max_image_width = Some(MAX_FRAME_DIMENSION);
        limits.max_image_height = Some(MAX_FRAME_DIMENSION);
        limits.max_alloc = Some(MAX_DECODE_ALLOC);
        Self {
            limits,
            filter: FilterType::Triangle,
        }
    }
}

impl FrameDecoder for JpegFrameDecoder {
    fn decode(&mut self, data: &[u8], width: u32, height: u32) -> Result<RgbaImage, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::Empty);
        }

        let mut reader = ImageReader::with_format(Cursor::new(data), ImageFormat::Jpeg);
        reader.limits(self.limits.clone());
        let image = reader.decode()?;

        let fitted = if image.width() > width || image.height() > height {
            // `resize` keeps the aspect ratio and fits within the bounds.
            image.resize(width, height, self.filter)
        } else {
            image
        };
        Ok(fitted.into_rgba8())
    }
}
