//! Multi-pass decode engine: one pixel buffer in, accepted detections out.
//!
//! Each submodule implements exactly one concern. Keeping them separate
//! makes each independently testable and lets the scan order change without
//! touching plane math or payload rules.
//!
//! ## Data Flow
//!
//! ```text
//! PixelBuffer ──▶ validate ──▶ luma plane ──▶ native pass (3 variants)
//!                                                  │
//!                                 hits? ──yes──▶ supplemental 1.5x re-scan
//!                                   │
//!                                   no ──▶ corner/margin regions at 2x, 3x
//!                                                  │
//!                         dedup ──▶ bounds filter ──▶ payload gate ──▶ score
//! ```
//!
//! 1. [`buffer`]  — pixel types, luma plane, letterboxed upscale, crops
//! 2. [`regions`] — the fixed fallback region table
//! 3. [`content`] — payload validation, classification, confidence
//!
//! ## Why three scan variants?
//!
//! The grid detector binarises internally but assumes dark modules on a
//! light background. Scanning the plane as-is, inverted, and
//! contrast-stretched catches light-on-dark codes and washed-out scans for
//! one extra pass each. Variants run independently: a panic inside one pass
//! is caught and logged, the others still run, and a page where every pass
//! fails simply yields zero detections.

mod buffer;
mod content;
mod regions;

pub use buffer::{BoundingBox, Detection, PixelBuffer};
pub use content::{classify, ContentKind};

use crate::error::DecodeError;
use buffer::FrameTransform;
use image::GrayImage;
use regions::FALLBACK_REGIONS;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, trace, warn};

/// Whole-buffer upscale applied when the native pass already found a code;
/// catches a second code that sat just beneath detector resolution.
const SUPPLEMENTAL_SCALE: f32 = 1.5;

/// Region-crop upscales for the nothing-found fallback.
const REGION_SCALES: [f32; 2] = [2.0, 3.0];

/// Engine knobs. Field defaults match the validated production values.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOptions {
    /// Buffers larger than this many bytes are rejected before any scan.
    pub max_buffer_bytes: usize,
    /// Two hits with identical content whose top-left corners are within
    /// this distance are the same physical code.
    pub dedup_radius_px: f32,
    /// Decoded payloads longer than this are rejected.
    pub max_content_len: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 50 * 1024 * 1024,
            dedup_radius_px: 10.0,
            max_content_len: 4000,
        }
    }
}

/// A grid hit before deduplication and payload gating.
#[derive(Debug, Clone)]
struct RawHit {
    content: String,
    bounding_box: BoundingBox,
    /// All four corner anchors landed inside the frame they were found in.
    anchors_in_frame: bool,
}

/// Native-resolution scan variants, in merge order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanVariant {
    Plain,
    Inverted,
    Equalized,
}

impl ScanVariant {
    const ALL: [ScanVariant; 3] = [
        ScanVariant::Plain,
        ScanVariant::Inverted,
        ScanVariant::Equalized,
    ];

    fn name(&self) -> &'static str {
        match self {
            ScanVariant::Plain => "plain",
            ScanVariant::Inverted => "inverted",
            ScanVariant::Equalized => "equalized",
        }
    }
}

/// Stateless multi-pass decoder.
///
/// `decode` holds no shared mutable state and is safe to call concurrently
/// on distinct buffers; the orchestrator dispatches it onto the blocking
/// thread pool because a full multi-pass scan is CPU-bound.
#[derive(Debug, Clone, Default)]
pub struct DecodeEngine {
    options: DecodeOptions,
}

impl DecodeEngine {
    pub fn new(options: DecodeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }

    /// Pre-flight check: an engine whose options forbid every decode is
    /// reported unusable before a session starts.
    pub fn ensure_supported(&self) -> Result<(), DecodeError> {
        if self.options.max_buffer_bytes == 0 {
            return Err(DecodeError::Unsupported {
                reason: "max_buffer_bytes is 0; every buffer would be rejected".to_string(),
            });
        }
        if self.options.max_content_len == 0 {
            return Err(DecodeError::Unsupported {
                reason: "max_content_len is 0; every payload would be rejected".to_string(),
            });
        }
        Ok(())
    }

    /// Scan one page buffer.
    ///
    /// # Returns
    /// `Ok` with zero or more accepted detections in native buffer
    /// coordinates. A page with no codes is `Ok(vec![])`, not an error.
    ///
    /// # Errors
    /// Only structural problems surface as `Err`: a malformed buffer, a
    /// buffer over the byte ceiling, or unusable engine options. These are
    /// never retried by the orchestrator.
    pub fn decode(&self, buffer: &PixelBuffer) -> Result<Vec<Detection>, DecodeError> {
        self.ensure_supported()?;
        self.validate_structure(buffer)?;
        if buffer.byte_len() > self.options.max_buffer_bytes {
            return Err(DecodeError::BufferTooLarge {
                actual_bytes: buffer.byte_len(),
                limit_bytes: self.options.max_buffer_bytes,
            });
        }

        let plane = buffer::luma_plane(buffer);
        let mut hits = scan_all_variants(&plane);
        debug!(
            "native pass found {} raw hit(s) in {}x{} buffer",
            hits.len(),
            buffer.width,
            buffer.height
        );

        if !hits.is_empty() {
            hits.extend(supplemental_pass(&plane));
        } else {
            hits = region_fallback(&plane);
        }

        let deduped = dedup_hits(hits, self.options.dedup_radius_px);
        let mut detections = Vec::with_capacity(deduped.len());
        for hit in deduped {
            if !hit.bounding_box.fits_within(buffer.width, buffer.height) {
                trace!("dropping out-of-bounds hit at {:?}", hit.bounding_box);
                continue;
            }
            match content::validate(&hit.content, self.options.max_content_len) {
                Ok(kind) => {
                    let confidence = content::confidence_score(kind, hit.anchors_in_frame);
                    detections.push(Detection {
                        content: hit.content,
                        bounding_box: hit.bounding_box,
                        confidence,
                    });
                }
                Err(rejection) => debug!("rejected decoded payload: {}", rejection),
            }
        }
        Ok(detections)
    }

    fn validate_structure(&self, buffer: &PixelBuffer) -> Result<(), DecodeError> {
        if buffer.width == 0 || buffer.height == 0 {
            return Err(DecodeError::InvalidBuffer {
                reason: format!("zero dimension ({}x{})", buffer.width, buffer.height),
            });
        }
        let expected = (buffer.width as usize)
            .checked_mul(buffer.height as usize)
            .and_then(|px| px.checked_mul(4))
            .ok_or_else(|| DecodeError::InvalidBuffer {
                reason: format!(
                    "dimensions {}x{} overflow the addressable byte range",
                    buffer.width, buffer.height
                ),
            })?;
        if buffer.byte_len() != expected {
            return Err(DecodeError::InvalidBuffer {
                reason: format!(
                    "expected {} bytes for {}x{} RGBA, got {}",
                    expected,
                    buffer.width,
                    buffer.height,
                    buffer.byte_len()
                ),
            });
        }
        Ok(())
    }
}

/// Run every scan variant over one plane and merge the hits, in variant
/// order. A failed variant is logged and skipped; all failing means an
/// empty merge, which the caller treats as "nothing on this page".
fn scan_all_variants(plane: &GrayImage) -> Vec<RawHit> {
    let mut merged = Vec::new();
    let mut failed = 0;
    for variant in ScanVariant::ALL {
        let outcome = match variant {
            ScanVariant::Plain => scan_plane(plane),
            ScanVariant::Inverted => scan_plane(&buffer::inverted(plane)),
            ScanVariant::Equalized => scan_plane(&buffer::equalized(plane)),
        };
        match outcome {
            Ok(hits) => {
                trace!("{} variant: {} hit(s)", variant.name(), hits.len());
                merged.extend(hits);
            }
            Err(reason) => {
                failed += 1;
                warn!(
                    "{} variant failed ({}); continuing with remaining variants",
                    variant.name(),
                    reason
                );
            }
        }
    }
    if failed == ScanVariant::ALL.len() {
        debug!("all scan variants failed; treating plane as empty");
    }
    merged
}

/// One grid-detector pass over a single plane.
///
/// The detector is third-party compute; a panic on a pathological plane is
/// contained here so it costs one variant, not the page.
fn scan_plane(plane: &GrayImage) -> Result<Vec<RawHit>, String> {
    let (width, height) = plane.dimensions();
    let raw = plane.as_raw();
    catch_unwind(AssertUnwindSafe(|| {
        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
            width as usize,
            height as usize,
            |x, y| raw[y * width as usize + x],
        );
        let grids = prepared.detect_grids();
        let mut hits = Vec::with_capacity(grids.len());
        for grid in grids {
            let corners: Vec<(f32, f32)> = grid
                .bounds
                .iter()
                .map(|p| (p.x as f32, p.y as f32))
                .collect();
            let anchors_in_frame = corners
                .iter()
                .all(|&(x, y)| x >= 0.0 && y >= 0.0 && x <= width as f32 && y <= height as f32);
            match grid.decode() {
                Ok((_meta, text)) => hits.push(RawHit {
                    content: text,
                    bounding_box: BoundingBox::from_corners(&corners),
                    anchors_in_frame,
                }),
                Err(e) => trace!("grid near {:?} did not decode: {}", corners.first(), e),
            }
        }
        hits
    }))
    .map_err(panic_text)
}

/// Whole-plane 1.5x re-scan; hits come back in native coordinates.
fn supplemental_pass(plane: &GrayImage) -> Vec<RawHit> {
    let (canvas, transform) = buffer::upscale_letterboxed(plane, SUPPLEMENTAL_SCALE);
    let hits = scan_all_variants(&canvas);
    trace!("supplemental pass found {} raw hit(s)", hits.len());
    remap_hits(hits, &transform, 0.0, 0.0)
}

/// Corner/margin crops at 2x and 3x; hits come back in native coordinates.
fn region_fallback(plane: &GrayImage) -> Vec<RawHit> {
    let (page_w, page_h) = plane.dimensions();
    let mut merged = Vec::new();
    for spec in FALLBACK_REGIONS {
        let Some(rect) = spec.to_pixels(page_w, page_h) else {
            continue;
        };
        let crop = buffer::crop_region(plane, rect.x, rect.y, rect.width, rect.height);
        for factor in REGION_SCALES {
            let (canvas, transform) = buffer::upscale_letterboxed(&crop, factor);
            let hits = scan_all_variants(&canvas);
            if !hits.is_empty() {
                trace!(
                    "{} region at {}x: {} raw hit(s)",
                    spec.name,
                    factor,
                    hits.len()
                );
            }
            merged.extend(remap_hits(hits, &transform, rect.x as f32, rect.y as f32));
        }
    }
    merged
}

/// Map hits out of a resized frame into native coordinates: undo the
/// letterboxed scale, then translate by the crop origin.
fn remap_hits(
    hits: Vec<RawHit>,
    transform: &FrameTransform,
    offset_x: f32,
    offset_y: f32,
) -> Vec<RawHit> {
    hits.into_iter()
        .map(|mut hit| {
            hit.bounding_box = transform
                .to_source(hit.bounding_box)
                .translate(offset_x, offset_y);
            hit
        })
        .collect()
}

/// First-occurrence dedup: identical content with top-left corners within
/// `radius` pixels is the same physical code.
fn dedup_hits(hits: Vec<RawHit>, radius: f32) -> Vec<RawHit> {
    let mut unique: Vec<RawHit> = Vec::new();
    for hit in hits {
        let duplicate = unique.iter().any(|kept| {
            kept.content == hit.content
                && kept.bounding_box.top_left_distance(&hit.bounding_box) <= radius
        });
        if !duplicate {
            unique.push(hit);
        }
    }
    unique
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "scan pass panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(content: &str, x: f32, y: f32) -> RawHit {
        RawHit {
            content: content.to_string(),
            bounding_box: BoundingBox {
                x,
                y,
                width: 40.0,
                height: 40.0,
            },
            anchors_in_frame: true,
        }
    }

    fn blank_buffer(width: u32, height: u32) -> PixelBuffer {
        PixelBuffer::new(width, height, vec![255; (width * height * 4) as usize])
    }

    #[test]
    fn rejects_zero_dimensions() {
        let engine = DecodeEngine::default();
        let err = engine
            .decode(&PixelBuffer::new(0, 100, vec![]))
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidBuffer { .. }));
    }

    #[test]
    fn rejects_length_mismatch() {
        let engine = DecodeEngine::default();
        let err = engine
            .decode(&PixelBuffer::new(10, 10, vec![0; 399]))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("expected 400 bytes"), "got: {msg}");
    }

    #[test]
    fn rejects_oversized_buffer() {
        let engine = DecodeEngine::new(DecodeOptions {
            max_buffer_bytes: 1024,
            ..DecodeOptions::default()
        });
        // 32x32 RGBA = 4096 bytes, over the 1 KiB ceiling.
        let err = engine.decode(&blank_buffer(32, 32)).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::BufferTooLarge {
                actual_bytes: 4096,
                limit_bytes: 1024
            }
        ));
    }

    #[test]
    fn zeroed_options_report_unsupported() {
        let engine = DecodeEngine::new(DecodeOptions {
            max_buffer_bytes: 0,
            ..DecodeOptions::default()
        });
        assert!(engine.ensure_supported().is_err());
        let err = engine.decode(&blank_buffer(8, 8)).unwrap_err();
        assert!(matches!(err, DecodeError::Unsupported { .. }));
    }

    #[test]
    fn blank_page_yields_no_detections() {
        let engine = DecodeEngine::default();
        let detections = engine.decode(&blank_buffer(200, 150)).unwrap();
        assert!(detections.is_empty());
    }

    #[test]
    fn dedup_collapses_nearby_identical_content() {
        let hits = vec![
            hit("https://example.com", 100.0, 100.0),
            hit("https://example.com", 104.0, 97.0),
            hit("https://example.com", 100.0, 100.0),
        ];
        let unique = dedup_hits(hits, 10.0);
        assert_eq!(unique.len(), 1);
        // First occurrence wins.
        assert_eq!(unique[0].bounding_box.x, 100.0);
    }

    #[test]
    fn dedup_keeps_same_content_far_apart() {
        let hits = vec![
            hit("https://example.com", 100.0, 100.0),
            hit("https://example.com", 500.0, 100.0),
        ];
        assert_eq!(dedup_hits(hits, 10.0).len(), 2);
    }

    #[test]
    fn dedup_keeps_different_content_at_same_spot() {
        let hits = vec![hit("alpha", 100.0, 100.0), hit("beta", 102.0, 101.0)];
        assert_eq!(dedup_hits(hits, 10.0).len(), 2);
    }

    #[test]
    fn dedup_is_idempotent() {
        let hits = vec![
            hit("a", 0.0, 0.0),
            hit("a", 5.0, 5.0),
            hit("b", 0.0, 0.0),
            hit("a", 300.0, 0.0),
        ];
        let once = dedup_hits(hits, 10.0);
        let twice = dedup_hits(once.clone(), 10.0);
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.content, b.content);
            assert_eq!(a.bounding_box, b.bounding_box);
        }
    }

    #[test]
    fn remapped_region_hit_lands_inside_the_region() {
        // A 120x120 crop originating at (600, 480), upscaled 3x.
        let transform = FrameTransform {
            scale_x: 3.0,
            scale_y: 3.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let hits = vec![RawHit {
            content: "corner".into(),
            bounding_box: BoundingBox {
                x: 30.0,
                y: 60.0,
                width: 90.0,
                height: 90.0,
            },
            anchors_in_frame: true,
        }];
        let remapped = remap_hits(hits, &transform, 600.0, 480.0);
        let b = remapped[0].bounding_box;
        assert_eq!(b.x, 610.0);
        assert_eq!(b.y, 500.0);
        assert_eq!(b.width, 30.0);
        assert_eq!(b.height, 30.0);
        // Inside the original region bounds.
        assert!(b.x >= 600.0 && b.x + b.width <= 720.0);
        assert!(b.y >= 480.0 && b.y + b.height <= 600.0);
    }
}
