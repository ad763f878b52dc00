use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, Rgb, RgbImage};
use std::io::Cursor;
use webp::Encoder as WebpEncoder;

use crate::error::{MediaError, MediaResult};
use crate::profiles::{Codec, Fit, VariantDef};

/// Decoded-pixel overhead estimate per source pixel, used by the memory guard.
const BYTES_PER_PIXEL_ESTIMATE: u64 = 5;

pub const DEFAULT_JPEG_QUALITY: u8 = 82;
pub const DEFAULT_ALT_QUALITY: u8 = 80;

#[derive(Debug, Clone)]
pub struct RenderResult {
    pub body: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub content_type: &'static str,
}

/// Output of `render_original`: JPEG is always present, the alternates only
/// when the corresponding codec is available at runtime.
#[derive(Debug, Clone)]
pub struct OriginalRender {
    pub body_jpeg: Vec<u8>,
    pub body_webp: Option<Vec<u8>>,
    pub body_avif: Option<Vec<u8>>,
    pub body_png: Option<Vec<u8>>,
    pub width: u32,
    pub height: u32,
}

impl OriginalRender {
    pub fn body_for(&self, codec: Codec) -> Option<&[u8]> {
        match codec {
            Codec::Jpeg => Some(&self.body_jpeg),
            Codec::Webp => self.body_webp.as_deref(),
            Codec::Avif => self.body_avif.as_deref(),
            Codec::Png => self.body_png.as_deref(),
        }
    }
}

/// Stateless transcoder. One instance is shared by every caller; the only
/// configuration is the optional process memory budget.
#[derive(Debug, Clone, Default)]
pub struct ImageEngine {
    memory_limit: Option<u64>,
}

impl ImageEngine {
    pub fn new(memory_limit: Option<u64>) -> Self {
        ImageEngine { memory_limit }
    }

    pub fn supports(&self, codec: Codec) -> bool {
        match codec {
            Codec::Jpeg | Codec::Webp | Codec::Png => true,
            Codec::Avif => cfg!(feature = "avif"),
        }
    }

    /// Downscale the source so its long edge fits `max_long_edge` (never
    /// enlarging) and encode it in every available codec.
    pub fn render_original(
        &self,
        bytes: &[u8],
        max_long_edge: u32,
        jpeg_quality: u8,
        alt_quality: u8,
    ) -> MediaResult<OriginalRender> {
        let img = self.decode(bytes)?;
        let (sw, sh) = (img.width(), img.height());

        let long_edge = sw.max(sh);
        let img = if long_edge > max_long_edge && max_long_edge > 0 {
            let scale = max_long_edge as f64 / long_edge as f64;
            let w = ((sw as f64 * scale).floor() as u32).max(1);
            let h = ((sh as f64 * scale).floor() as u32).max(1);
            img.resize_exact(w, h, FilterType::Lanczos3)
        } else {
            img
        };

        let body_jpeg = encode(&img, Codec::Jpeg, jpeg_quality)?;
        let body_webp = self
            .supports(Codec::Webp)
            .then(|| encode(&img, Codec::Webp, alt_quality))
            .transpose()?;
        let body_avif = self
            .supports(Codec::Avif)
            .then(|| encode(&img, Codec::Avif, alt_quality))
            .transpose()?;
        let body_png = self
            .supports(Codec::Png)
            .then(|| encode(&img, Codec::Png, alt_quality))
            .transpose()?;

        Ok(OriginalRender {
            body_jpeg,
            body_webp,
            body_avif,
            body_png,
            width: img.width(),
            height: img.height(),
        })
    }

    /// Render one variant in one codec. With `no_upscale` (the default for
    /// every profile-driven rendition) the target box is clamped to the source
    /// dimensions before any geometry is computed, so nothing is ever
    /// enlarged.
    pub fn render_variant(
        &self,
        bytes: &[u8],
        def: &VariantDef,
        codec: Codec,
        quality: Option<u8>,
        no_upscale: bool,
    ) -> MediaResult<RenderResult> {
        let img = self.decode(bytes)?;
        let (sw, sh) = (img.width(), img.height());

        let mut tw = def.target_w;
        let mut th = def.target_h;
        if no_upscale {
            tw = tw.min(sw);
            th = th.min(sh);
        }

        let out = match def.fit {
            Fit::Cover => {
                let (x, y, cw, ch) = cover_crop(sw, sh, tw, th);
                img.crop_imm(x, y, cw, ch)
                    .resize_exact(tw, th, FilterType::Lanczos3)
            }
            Fit::Contain => {
                let (w, h) = contain_size(sw, sh, tw, th);
                img.resize_exact(w, h, FilterType::Lanczos3)
            }
        };

        let quality = quality.unwrap_or_else(|| codec.default_quality());
        let body = encode(&out, codec, quality)?;
        Ok(RenderResult {
            body,
            width: out.width(),
            height: out.height(),
            content_type: codec.content_type(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> MediaResult<DynamicImage> {
        let (w, h) = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| MediaError::ImageDecodeFailed {
                reason: format!("Failed to read image header: {e}"),
            })?
            .into_dimensions()?;

        self.check_memory(w, h)?;

        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| MediaError::ImageDecodeFailed {
                reason: format!("Failed to read image: {e}"),
            })?;
        Ok(reader.decode()?)
    }

    fn check_memory(&self, width: u32, height: u32) -> MediaResult<()> {
        let Some(limit) = self.memory_limit else {
            return Ok(());
        };
        let required = width as u64 * height as u64 * BYTES_PER_PIXEL_ESTIMATE;
        let available = limit.saturating_sub(current_rss_bytes());
        if required > available {
            return Err(MediaError::InsufficientMemory {
                required,
                available,
            });
        }
        Ok(())
    }
}

/// CONTAIN geometry: uniform scale by min(tw/sw, th/sh), dimensions floored,
/// each at least 1.
pub fn contain_size(sw: u32, sh: u32, tw: u32, th: u32) -> (u32, u32) {
    let scale = (tw as f64 / sw as f64).min(th as f64 / sh as f64);
    let w = ((sw as f64 * scale).floor() as u32).max(1);
    let h = ((sh as f64 * scale).floor() as u32).max(1);
    (w, h)
}

/// COVER geometry: the centered crop rectangle of aspect tw/th. Centering
/// ties round half-up toward the higher coordinate.
pub fn cover_crop(sw: u32, sh: u32, tw: u32, th: u32) -> (u32, u32, u32, u32) {
    let src_ratio = sw as f64 / sh as f64;
    let target_ratio = tw as f64 / th as f64;

    let (cw, ch) = if src_ratio > target_ratio {
        let cw = ((sh as f64 * target_ratio).round() as u32).clamp(1, sw);
        (cw, sh)
    } else {
        let ch = ((sw as f64 / target_ratio).round() as u32).clamp(1, sh);
        (sw, ch)
    };

    let x = (sw - cw + 1) / 2;
    let y = (sh - ch + 1) / 2;
    (x, y, cw, ch)
}

fn encode(img: &DynamicImage, codec: Codec, quality: u8) -> MediaResult<Vec<u8>> {
    let mut output = Vec::new();
    let mut cursor = Cursor::new(&mut output);

    match codec {
        Codec::Jpeg => {
            // JPEG has no alpha channel; flatten onto solid white.
            let rgb = flatten_onto_white(img);
            let encoder = JpegEncoder::new_with_quality(&mut cursor, quality);
            rgb.write_with_encoder(encoder)
                .map_err(|e| MediaError::ImageDecodeFailed {
                    reason: format!("Failed to encode JPEG: {e}"),
                })?;
        }
        Codec::Webp => {
            let rgba = img.to_rgba8();
            let (width, height) = rgba.dimensions();
            let encoder = WebpEncoder::from_rgba(&rgba, width, height);
            let webp_data = encoder.encode(quality as f32);
            output.extend_from_slice(&webp_data);
        }
        Codec::Png => {
            let level = png_compression_level(quality);
            let encoder =
                PngEncoder::new_with_quality(&mut cursor, png_compression(level), PngFilterType::Adaptive);
            img.write_with_encoder(encoder)
                .map_err(|e| MediaError::ImageDecodeFailed {
                    reason: format!("Failed to encode PNG: {e}"),
                })?;
        }
        Codec::Avif => {
            #[cfg(feature = "avif")]
            {
                let encoder =
                    image::codecs::avif::AvifEncoder::new_with_speed_quality(&mut cursor, 4, quality);
                img.write_with_encoder(encoder)
                    .map_err(|e| MediaError::ImageDecodeFailed {
                        reason: format!("Failed to encode AVIF: {e}"),
                    })?;
            }
            #[cfg(not(feature = "avif"))]
            {
                let _ = quality;
                return Err(MediaError::ImageDecodeFailed {
                    reason: "AVIF support is not compiled in".to_string(),
                });
            }
        }
    }

    Ok(output)
}

/// PNG quality 0..100 maps onto a 0..9 compression level: quality 100 is
/// level 0 (fastest), quality 0 is level 9 (smallest).
pub fn png_compression_level(quality: u8) -> u8 {
    let quality = quality.min(100) as f64;
    9 - (quality / 100.0 * 9.0).round() as u8
}

fn png_compression(level: u8) -> CompressionType {
    // The encoder exposes three tiers rather than nine levels.
    match level {
        0..=2 => CompressionType::Fast,
        3..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, px) in rgba.enumerate_pixels() {
        let a = px[3] as u32;
        let blend = |c: u8| ((c as u32 * a + 255 * (255 - a)) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(px[0]), blend(px[1]), blend(px[2])]));
    }
    out
}

#[cfg(target_os = "linux")]
fn current_rss_bytes() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    statm
        .split_whitespace()
        .nth(1)
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn current_rss_bytes() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([120, 80, 40]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }

    fn png_bytes_with_alpha(width: u32, height: u32, pixel: Rgba<u8>) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, pixel);
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn variant(w: u32, h: u32, fit: Fit) -> VariantDef {
        VariantDef {
            target_w: w,
            target_h: h,
            fit,
        }
    }

    #[test]
    fn contain_downscales_with_floor() {
        assert_eq!(contain_size(400, 200, 100, 100), (100, 50));
        assert_eq!(contain_size(333, 333, 100, 100), (100, 100));
        // Tiny sources never collapse to zero.
        assert_eq!(contain_size(1000, 3, 100, 1), (100, 1));
        assert_eq!(contain_size(3, 1000, 100, 100), (1, 100));
    }

    #[test]
    fn cover_crop_is_centered_with_half_up_ties() {
        // Wide source, square target: crop 200x200 out of 300x200.
        assert_eq!(cover_crop(300, 200, 100, 100), (50, 0, 200, 200));
        // Odd leftover rounds toward the higher coordinate.
        assert_eq!(cover_crop(301, 200, 100, 100), (51, 0, 200, 200));
        // Tall source.
        assert_eq!(cover_crop(200, 300, 100, 100), (0, 50, 200, 200));
    }

    #[test]
    fn variant_contain_matches_expected_dimensions() {
        let engine = ImageEngine::default();
        let bytes = jpeg_bytes(400, 200);
        let def = variant(100, 100, Fit::Contain);
        let result = engine
            .render_variant(&bytes, &def, Codec::Jpeg, None, true)
            .unwrap();
        assert_eq!((result.width, result.height), (100, 50));
        assert_eq!(result.content_type, "image/jpeg");
        assert_eq!(&result.body[..3], &[0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn cover_never_upscales_a_small_source() {
        let engine = ImageEngine::default();
        let bytes = png_bytes_with_alpha(500, 300, Rgba([10, 20, 30, 255]));
        let def = variant(1000, 1000, Fit::Cover);
        let result = engine
            .render_variant(&bytes, &def, Codec::Png, None, true)
            .unwrap();
        assert_eq!((result.width, result.height), (500, 300));
    }

    #[test]
    fn longer_edge_never_exceeds_source() {
        let engine = ImageEngine::default();
        let bytes = jpeg_bytes(50, 40);
        for fit in [Fit::Cover, Fit::Contain] {
            let result = engine
                .render_variant(&bytes, &variant(100, 100, fit), Codec::Jpeg, None, true)
                .unwrap();
            assert!(result.width.max(result.height) <= 50);
        }
    }

    #[test]
    fn jpeg_flattens_alpha_onto_white() {
        let engine = ImageEngine::default();
        // Fully transparent red must come out white.
        let bytes = png_bytes_with_alpha(16, 16, Rgba([255, 0, 0, 0]));
        let def = variant(16, 16, Fit::Contain);
        let result = engine
            .render_variant(&bytes, &def, Codec::Jpeg, Some(100), true)
            .unwrap();
        let decoded = image::load_from_memory(&result.body).unwrap().to_rgb8();
        let px = decoded.get_pixel(8, 8);
        assert!(px[0] > 240 && px[1] > 240 && px[2] > 240, "got {px:?}");
    }

    #[test]
    fn webp_preserves_alpha() {
        let engine = ImageEngine::default();
        let bytes = png_bytes_with_alpha(20, 20, Rgba([0, 255, 0, 128]));
        let def = variant(20, 20, Fit::Contain);
        let result = engine
            .render_variant(&bytes, &def, Codec::Webp, None, true)
            .unwrap();
        assert_eq!(result.content_type, "image/webp");
        assert_eq!(&result.body[..4], b"RIFF");
    }

    #[test]
    fn original_is_downscaled_but_never_enlarged() {
        let engine = ImageEngine::default();
        let bytes = jpeg_bytes(400, 200);
        let rendered = engine
            .render_original(&bytes, 100, DEFAULT_JPEG_QUALITY, DEFAULT_ALT_QUALITY)
            .unwrap();
        assert_eq!((rendered.width, rendered.height), (100, 50));
        assert!(rendered.body_webp.is_some());
        assert!(rendered.body_png.is_some());

        let small = engine
            .render_original(&jpeg_bytes(60, 30), 100, DEFAULT_JPEG_QUALITY, DEFAULT_ALT_QUALITY)
            .unwrap();
        assert_eq!((small.width, small.height), (60, 30));
    }

    #[test]
    fn png_quality_maps_to_compression_levels() {
        assert_eq!(png_compression_level(100), 0);
        assert_eq!(png_compression_level(0), 9);
        assert_eq!(png_compression_level(50), 5);
    }

    #[test]
    fn memory_guard_rejects_oversized_decodes() {
        let engine = ImageEngine::new(Some(1));
        let bytes = jpeg_bytes(64, 64);
        match engine.render_variant(
            &bytes,
            &variant(10, 10, Fit::Contain),
            Codec::Jpeg,
            None,
            true,
        ) {
            Err(MediaError::InsufficientMemory { required, .. }) => {
                assert_eq!(required, 64 * 64 * 5);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn capability_probes() {
        let engine = ImageEngine::default();
        assert!(engine.supports(Codec::Jpeg));
        assert!(engine.supports(Codec::Webp));
        assert!(engine.supports(Codec::Png));
        assert_eq!(engine.supports(Codec::Avif), cfg!(feature = "avif"));
    }
}
