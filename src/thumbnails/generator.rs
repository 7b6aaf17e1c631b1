//! Video frame extraction and thumbnail encoding.
//!
//! Frames are grabbed with `ffmpeg` as a PNG on stdout, then resized to the
//! target height (preserving aspect ratio) and encoded as JPEG with the
//! image crate.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use tracing::{debug, trace};

use crate::error::ThumbnailFault;

/// Default target height for thumbnails in pixels.
pub const DEFAULT_THUMB_HEIGHT: u32 = 180;

/// Minimum width for thumbnails (to handle extreme aspect ratios).
const MIN_THUMB_WIDTH: u32 = 64;

/// Maximum width for thumbnails (to handle extreme panoramas).
const MAX_THUMB_WIDTH: u32 = 1024;

/// JPEG quality for thumbnail encoding (0-100).
const JPEG_QUALITY: u8 = 85;

/// Offset used when the duration is unknown. Many videos open on black.
pub const DEFAULT_OFFSET: Duration = Duration::from_secs(1);

/// Upper bound for the frame offset.
pub const MAX_OFFSET: Duration = Duration::from_secs(30);

/// Produces a thumbnail image for a video.
pub trait FrameExtractor: Send + Sync {
    /// Writes a thumbnail of `source` taken at `offset` to `dest`.
    fn extract(&self, source: &Path, offset: Duration, dest: &Path) -> Result<(), ThumbnailFault>;
}

/// Picks the frame offset for an attempt.
///
/// First attempt: 10% into the video, clamped to [0, MAX_OFFSET] and to the
/// duration itself. Retries use the first frame, which always exists.
pub fn frame_offset(duration_ms: Option<u64>, attempt: u32) -> Duration {
    if attempt > 0 {
        return Duration::ZERO;
    }
    match duration_ms {
        Some(ms) if ms > 0 => {
            let duration = Duration::from_millis(ms);
            (duration / 10).min(MAX_OFFSET).min(duration)
        }
        _ => DEFAULT_OFFSET,
    }
}

/// `ffmpeg`-backed extractor.
#[derive(Debug, Clone)]
pub struct FfmpegExtractor {
    binary: PathBuf,
    height: u32,
}

impl FfmpegExtractor {
    pub fn new(binary: impl Into<PathBuf>, height: u32) -> Self {
        Self {
            binary: binary.into(),
            height: height.max(1),
        }
    }

    fn grab_frame(&self, source: &Path, offset: Duration) -> Result<DynamicImage, ThumbnailFault> {
        let timestamp = format!("{:.3}", offset.as_secs_f64());
        trace!(?source, %timestamp, "Running ffmpeg");

        let output = Command::new(&self.binary)
            .arg("-v")
            .arg("error")
            .arg("-ss")
            .arg(&timestamp)
            .arg("-i")
            .arg(source)
            .arg("-frames:v")
            .arg("1")
            .arg("-f")
            .arg("image2pipe")
            .arg("-vcodec")
            .arg("png")
            .arg("-")
            .stdin(Stdio::null())
            .output()
            .map_err(ThumbnailFault::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let first_line = stderr.lines().next().unwrap_or("").trim();
            return Err(ThumbnailFault::Extractor(format!("{} {}", output.status, first_line)));
        }
        if output.stdout.is_empty() {
            return Err(ThumbnailFault::Extractor(format!("no frame at {timestamp}s")));
        }

        Ok(image::load_from_memory(&output.stdout)?)
    }
}

impl FrameExtractor for FfmpegExtractor {
    fn extract(&self, source: &Path, offset: Duration, dest: &Path) -> Result<(), ThumbnailFault> {
        let frame = self.grab_frame(source, offset)?;
        let (width, height) = frame.dimensions();
        let (thumb_width, thumb_height) = calculate_dimensions(width, height, self.height);
        let thumbnail = frame.resize_exact(thumb_width, thumb_height, FilterType::CatmullRom);
        save_jpeg(&thumbnail, dest)?;
        debug!(?source, thumb_width, thumb_height, "Extracted thumbnail frame");
        Ok(())
    }
}

/// Calculate thumbnail dimensions preserving aspect ratio.
///
/// The target height is used as the base, with width calculated proportionally.
/// Width is clamped to MIN_THUMB_WIDTH..MAX_THUMB_WIDTH to handle extreme aspect ratios.
pub fn calculate_dimensions(src_width: u32, src_height: u32, target_height: u32) -> (u32, u32) {
    if src_height == 0 || src_width == 0 {
        return (target_height, target_height);
    }

    // If source is smaller than target, don't upscale
    let effective_height = target_height.min(src_height);

    let aspect_ratio = src_width as f64 / src_height as f64;
    let calculated_width = (effective_height as f64 * aspect_ratio).round() as u32;
    let final_width = calculated_width.clamp(MIN_THUMB_WIDTH, MAX_THUMB_WIDTH);

    // If width was clamped, recalculate height to maintain aspect ratio
    let final_height = if final_width != calculated_width {
        (final_width as f64 / aspect_ratio).round() as u32
    } else {
        effective_height
    };

    (final_width.max(1), final_height.max(1))
}

/// Encodes `img` as JPEG at `dst`.
pub fn save_jpeg(img: &DynamicImage, dst: &Path) -> Result<(), ThumbnailFault> {
    let file = File::create(dst)?;
    let mut writer = BufWriter::new(file);

    // JPEG has no alpha channel
    let rgb = img.to_rgb8();
    let encoder = JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
    rgb.write_with_encoder(encoder)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use tempfile::tempdir;

    #[test]
    fn test_calculate_dimensions_normal() {
        // 1920x1080 -> target 180 height
        let (w, h) = calculate_dimensions(1920, 1080, 180);
        assert_eq!(h, 180);
        assert_eq!(w, 320);
    }

    #[test]
    fn test_calculate_dimensions_small_source() {
        let (w, h) = calculate_dimensions(200, 100, 180);
        assert_eq!((w, h), (200, 100));
    }

    #[test]
    fn test_calculate_dimensions_extreme_panorama() {
        let (w, h) = calculate_dimensions(10000, 500, 180);
        assert_eq!(w, MAX_THUMB_WIDTH);
        assert!(h < 180);
    }

    #[test]
    fn test_frame_offset() {
        assert_eq!(frame_offset(None, 0), DEFAULT_OFFSET);
        assert_eq!(frame_offset(Some(20_000), 0), Duration::from_secs(2));
        assert_eq!(frame_offset(Some(3_600_000), 0), MAX_OFFSET);
        assert_eq!(frame_offset(Some(20_000), 1), Duration::ZERO);
        assert_eq!(frame_offset(Some(0), 0), DEFAULT_OFFSET);
    }

    #[test]
    fn test_save_jpeg() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("t.jpg");
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(32, 18, Rgb([200u8, 10, 10])));
        save_jpeg(&img, &dst).unwrap();

        let decoded = image::open(&dst).unwrap();
        assert_eq!(decoded.dimensions(), (32, 18));
    }

    #[test]
    fn test_missing_ffmpeg_is_spawn_fault() {
        let dir = tempdir().unwrap();
        let extractor = FfmpegExtractor::new("/nonexistent/ffmpeg-binary", 180);
        let err = extractor
            .extract(Path::new("/tmp/x.mp4"), Duration::ZERO, &dir.path().join("o.jpg"))
            .unwrap_err();
        assert!(matches!(err, ThumbnailFault::Spawn(_)));
    }
}
