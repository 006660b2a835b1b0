// PyroVision — Image Encoding & Colour Maps
//
// Raw radiometric frames are coloured once, at conversion time, into RGB888.
// The network side only ever encodes that RGB buffer (JPEG, PNG or as-is).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder as _};
use thiserror::Error;

use crate::config::JPEG_DEFAULT_QUALITY;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("buffer holds {actual} bytes, {width}x{height} RGB needs {expected}")]
    Size {
        width: u16,
        height: u16,
        expected: usize,
        actual: usize,
    },
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Png,
    Raw,
}

impl ImageFormat {
    pub fn from_query(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "raw" => Some(Self::Raw),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Raw => "application/octet-stream",
        }
    }
}

// ---------------------------------------------------------------------------
// Palettes
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Palette {
    #[default]
    Iron = 0,
    Gray = 1,
    Rainbow = 2,
}

const IRON_STOPS: [(u8, [u8; 3]); 6] = [
    (0, [0, 0, 0]),
    (50, [32, 0, 140]),
    (110, [190, 0, 150]),
    (170, [240, 90, 0]),
    (220, [255, 200, 0]),
    (255, [255, 255, 255]),
];

const RAINBOW_STOPS: [(u8, [u8; 3]); 5] = [
    (0, [0, 0, 255]),
    (64, [0, 255, 255]),
    (128, [0, 255, 0]),
    (192, [255, 255, 0]),
    (255, [255, 0, 0]),
];

impl Palette {
    pub fn from_query(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "iron" => Some(Self::Iron),
            "gray" | "grey" => Some(Self::Gray),
            "rainbow" => Some(Self::Rainbow),
            _ => None,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Gray,
            2 => Self::Rainbow,
            _ => Self::Iron,
        }
    }

    /// Colour for an 8-bit intensity.
    pub fn color(&self, v: u8) -> [u8; 3] {
        match self {
            Self::Gray => [v, v, v],
            Self::Iron => interpolate(&IRON_STOPS, v),
            Self::Rainbow => interpolate(&RAINBOW_STOPS, v),
        }
    }
}

fn interpolate(stops: &[(u8, [u8; 3])], v: u8) -> [u8; 3] {
    for pair in stops.windows(2) {
        let (lo, a) = pair[0];
        let (hi, b) = pair[1];
        if v <= hi {
            let span = (hi - lo).max(1) as i32;
            let t = (v.saturating_sub(lo)) as i32;
            let mix = |x: u8, y: u8| (x as i32 + (y as i32 - x as i32) * t / span) as u8;
            return [mix(a[0], b[0]), mix(a[1], b[1]), mix(a[2], b[2])];
        }
    }
    stops.last().map_or([0; 3], |s| s.1)
}

/// Palette selection shared between the converter and the HTTP surface.
#[derive(Debug, Clone, Default)]
pub struct SharedPalette(Arc<AtomicU8>);

impl SharedPalette {
    pub fn new(palette: Palette) -> Self {
        Self(Arc::new(AtomicU8::new(palette as u8)))
    }

    pub fn get(&self) -> Palette {
        Palette::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, palette: Palette) {
        self.0.store(palette as u8, Ordering::Relaxed);
    }
}

/// Stretch `pixels` between their min and max and colour them into `rgb`.
/// Returns the (min, max) raw values used for the stretch.
pub fn colorize(pixels: &[u16], rgb: &mut [u8], palette: Palette) -> (u16, u16) {
    let min = pixels.iter().copied().min().unwrap_or(0);
    let max = pixels.iter().copied().max().unwrap_or(0);
    let range = u32::from(max - min).max(1);

    for (px, out) in pixels.iter().zip(rgb.chunks_exact_mut(3)) {
        let v = (u32::from(px - min) * 255 / range) as u8;
        out.copy_from_slice(&palette.color(v));
    }
    (min, max)
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy)]
pub struct ImageEncoder {
    quality: u8,
}

impl Default for ImageEncoder {
    fn default() -> Self {
        Self::new(JPEG_DEFAULT_QUALITY)
    }
}

impl ImageEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn set_quality(&mut self, quality: u8) {
        self.quality = quality.clamp(1, 100);
    }

    pub fn encode(
        &self,
        rgb: &[u8],
        width: u16,
        height: u16,
        format: ImageFormat,
    ) -> Result<Vec<u8>, EncodeError> {
        let expected = width as usize * height as usize * 3;
        if rgb.len() != expected || expected == 0 {
            return Err(EncodeError::Size {
                width,
                height,
                expected,
                actual: rgb.len(),
            });
        }

        let (w, h) = (u32::from(width), u32::from(height));
        let mut out = Vec::new();
        match format {
            ImageFormat::Jpeg => {
                JpegEncoder::new_with_quality(&mut out, self.quality).write_image(
                    rgb,
                    w,
                    h,
                    ExtendedColorType::Rgb8,
                )?;
            }
            ImageFormat::Png => {
                PngEncoder::new(&mut out).write_image(
                    rgb,
                    w,
                    h,
                    ExtendedColorType::Rgb8,
                )?;
            }
            ImageFormat::Raw => out.extend_from_slice(rgb),
        }
        log::debug!("Encoded {}x{} {:?}: {} bytes", width, height, format, out.len());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u16, h: u16) -> Vec<u8> {
        (0..w as usize * h as usize * 3).map(|i| (i % 256) as u8).collect()
    }

    #[test]
    fn quality_is_clamped() {
        assert_eq!(ImageEncoder::new(0).quality(), 1);
        assert_eq!(ImageEncoder::new(250).quality(), 100);
        assert_eq!(ImageEncoder::default().quality(), 80);
    }

    #[test]
    fn jpeg_and_png_carry_their_magic() {
        let enc = ImageEncoder::default();
        let rgb = gradient(16, 8);
        let jpeg = enc.encode(&rgb, 16, 8, ImageFormat::Jpeg).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let png = enc.encode(&rgb, 16, 8, ImageFormat::Png).unwrap();
        assert_eq!(&png[1..4], b"PNG");
    }

    #[test]
    fn raw_is_passthrough() {
        let rgb = gradient(4, 2);
        let raw = ImageEncoder::default().encode(&rgb, 4, 2, ImageFormat::Raw).unwrap();
        assert_eq!(raw, rgb);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let err = ImageEncoder::default()
            .encode(&[0; 10], 4, 2, ImageFormat::Jpeg)
            .unwrap_err();
        assert!(matches!(err, EncodeError::Size { expected: 24, actual: 10, .. }));
    }

    #[test]
    fn query_parsing() {
        assert_eq!(ImageFormat::from_query("PNG"), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::from_query("bmp"), None);
        assert_eq!(Palette::from_query("grey"), Some(Palette::Gray));
        assert_eq!(ImageFormat::Raw.content_type(), "application/octet-stream");
    }

    #[test]
    fn palettes_span_their_endpoints() {
        assert_eq!(Palette::Iron.color(0), [0, 0, 0]);
        assert_eq!(Palette::Iron.color(255), [255, 255, 255]);
        assert_eq!(Palette::Rainbow.color(0), [0, 0, 255]);
        assert_eq!(Palette::Rainbow.color(255), [255, 0, 0]);
        assert_eq!(Palette::Gray.color(77), [77, 77, 77]);
    }

    #[test]
    fn colorize_stretches_min_to_max() {
        let pixels = [30000u16, 31000, 32000];
        let mut rgb = [0u8; 9];
        let (min, max) = colorize(&pixels, &mut rgb, Palette::Gray);
        assert_eq!((min, max), (30000, 32000));
        assert_eq!(&rgb[..3], &[0, 0, 0]);
        assert_eq!(&rgb[6..], &[255, 255, 255]);
    }

    #[test]
    fn flat_frame_does_not_divide_by_zero() {
        let mut rgb = [1u8; 6];
        colorize(&[500, 500], &mut rgb, Palette::Gray);
        assert_eq!(rgb, [0; 6]);
    }

    #[test]
    fn shared_palette_round_trip() {
        let p = SharedPalette::new(Palette::Iron);
        let other = p.clone();
        other.set(Palette::Rainbow);
        assert_eq!(p.get(), Palette::Rainbow);
    }
}
