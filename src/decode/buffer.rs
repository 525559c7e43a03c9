//! Pixel-level types and plane operations for the decode engine.
//!
//! The engine works on a single greyscale plane derived once per buffer;
//! scan variants and upscale passes are cheap transforms of that plane.
//! Every resized frame carries a [`FrameTransform`] so hits found in the
//! resized frame can be remapped into native buffer coordinates.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};

/// Letterbox fill for upscale passes. Light enough to read as quiet zone
/// around a dark-on-light code; the inverted variant flips it along with
/// everything else.
const NEUTRAL_FILL: u8 = 200;

/// Raw RGBA pixels for one rendered page.
///
/// Plain data: construction performs no validation so a misbehaving image
/// provider is surfaced by [`crate::DecodeEngine::decode`] as a structural
/// error rather than a panic at the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    /// `width * height * 4` bytes, row-major RGBA.
    pub data: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    /// Wrap a decoded RGBA image (CLI page loading, test fixtures).
    pub fn from_rgba_image(image: image::RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            data: image.into_raw(),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// Axis-aligned box in a buffer's own pixel space. Fractional coordinates
/// appear once a hit has been remapped out of a resized frame.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Smallest box containing all `points`.
    pub fn from_corners(points: &[(f32, f32)]) -> Self {
        let mut min_x = f32::MAX;
        let mut min_y = f32::MAX;
        let mut max_x = f32::MIN;
        let mut max_y = f32::MIN;
        for &(x, y) in points {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        Self {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        }
    }

    /// Euclidean distance between the two boxes' top-left corners.
    pub fn top_left_distance(&self, other: &BoundingBox) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Positive extent, entirely inside a `width` x `height` frame.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0.0
            && self.height > 0.0
            && self.x >= 0.0
            && self.y >= 0.0
            && self.x + self.width <= width as f32
            && self.y + self.height <= height as f32
    }

    pub(crate) fn translate(&self, dx: f32, dy: f32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }
}

/// One accepted code found in a buffer.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Detection {
    /// Validated decoded payload.
    pub content: String,
    /// Location in the native buffer's pixel space.
    pub bounding_box: BoundingBox,
    /// Heuristic confidence in `[0, 1]`.
    pub confidence: f32,
}

/// Maps coordinates found in a resized, letterboxed frame back to the frame
/// it was produced from.
///
/// Per-axis scales preserve the exact ratio semantics of
/// `x_src = (x_hit - pad) * (src_width / scaled_width)` even when rounding
/// makes the two axes scale slightly differently.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FrameTransform {
    pub scale_x: f32,
    pub scale_y: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl FrameTransform {
    pub(crate) fn to_source(&self, hit: BoundingBox) -> BoundingBox {
        BoundingBox {
            x: (hit.x - self.pad_x) / self.scale_x,
            y: (hit.y - self.pad_y) / self.scale_y,
            width: hit.width / self.scale_x,
            height: hit.height / self.scale_y,
        }
    }
}

/// Collapse RGBA to a BT.601 luma plane, compositing alpha over white
/// (rendered pages with transparency read as paper).
pub(crate) fn luma_plane(buffer: &PixelBuffer) -> GrayImage {
    // Capacity from the byte length, not width * height: the u32 product
    // would overflow for buffers past 4 Gpx before the cast.
    let mut data = Vec::with_capacity(buffer.data.len() / 4);
    for px in buffer.data.chunks_exact(4) {
        let r = px[0] as u32;
        let g = px[1] as u32;
        let b = px[2] as u32;
        let a = px[3] as u32;
        let luma = (299 * r + 587 * g + 114 * b) / 1000;
        let over_white = (luma * a + 255 * (255 - a)) / 255;
        data.push(over_white as u8);
    }
    // Length is exact by construction; a mismatch would be a bug above.
    GrayImage::from_raw(buffer.width, buffer.height, data)
        .unwrap_or_else(|| GrayImage::new(buffer.width, buffer.height))
}

/// Polarity flip for light-on-dark codes.
pub(crate) fn inverted(plane: &GrayImage) -> GrayImage {
    let data = plane.as_raw().iter().map(|&v| 255 - v).collect();
    GrayImage::from_raw(plane.width(), plane.height(), data)
        .unwrap_or_else(|| GrayImage::new(plane.width(), plane.height()))
}

/// Linear contrast stretch for washed-out scans. A flat plane is returned
/// unchanged.
pub(crate) fn equalized(plane: &GrayImage) -> GrayImage {
    let raw = plane.as_raw();
    let (mut lo, mut hi) = (255u8, 0u8);
    for &v in raw {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if hi <= lo {
        return plane.clone();
    }
    let range = (hi - lo) as u32;
    let data = raw
        .iter()
        .map(|&v| (((v - lo) as u32 * 255) / range) as u8)
        .collect();
    GrayImage::from_raw(plane.width(), plane.height(), data)
        .unwrap_or_else(|| GrayImage::new(plane.width(), plane.height()))
}

/// Scale a plane by `factor`, centred on a neutral canvas whose dimensions
/// are the scaled size rounded up. Returns the new frame and the transform
/// mapping hit coordinates back into `plane`'s space.
pub(crate) fn upscale_letterboxed(plane: &GrayImage, factor: f32) -> (GrayImage, FrameTransform) {
    let (w, h) = plane.dimensions();
    let scaled_w = ((w as f32 * factor).round() as u32).max(1);
    let scaled_h = ((h as f32 * factor).round() as u32).max(1);
    let canvas_w = ((w as f32 * factor).ceil() as u32).max(scaled_w);
    let canvas_h = ((h as f32 * factor).ceil() as u32).max(scaled_h);

    let scaled = imageops::resize(plane, scaled_w, scaled_h, FilterType::Triangle);
    let pad_x = (canvas_w - scaled_w) / 2;
    let pad_y = (canvas_h - scaled_h) / 2;

    let mut canvas = GrayImage::from_pixel(canvas_w, canvas_h, Luma([NEUTRAL_FILL]));
    imageops::replace(&mut canvas, &scaled, pad_x as i64, pad_y as i64);

    let transform = FrameTransform {
        scale_x: scaled_w as f32 / w as f32,
        scale_y: scaled_h as f32 / h as f32,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
    };
    (canvas, transform)
}

/// Copy out a sub-rectangle of the plane. Caller guarantees the rectangle
/// lies inside the plane (region specs are clamped when converted).
pub(crate) fn crop_region(plane: &GrayImage, x: u32, y: u32, width: u32, height: u32) -> GrayImage {
    imageops::crop_imm(plane, x, y, width, height).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_buffer(width: u32, height: u32, rgba: [u8; 4]) -> PixelBuffer {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&rgba);
        }
        PixelBuffer::new(width, height, data)
    }

    #[test]
    fn luma_of_black_white_and_transparent() {
        let white = luma_plane(&solid_buffer(2, 2, [255, 255, 255, 255]));
        assert_eq!(white.get_pixel(0, 0)[0], 255);

        let black = luma_plane(&solid_buffer(2, 2, [0, 0, 0, 255]));
        assert_eq!(black.get_pixel(1, 1)[0], 0);

        // Fully transparent composites to paper white regardless of RGB.
        let clear = luma_plane(&solid_buffer(2, 2, [0, 0, 0, 0]));
        assert_eq!(clear.get_pixel(0, 0)[0], 255);
    }

    #[test]
    fn luma_plane_matches_buffer_dimensions() {
        let plane = luma_plane(&solid_buffer(5, 3, [10, 20, 30, 255]));
        assert_eq!(plane.dimensions(), (5, 3));
        // Every pixel is populated, not just the capacity reserved.
        assert_eq!(plane.as_raw().len(), 15);
        assert_eq!(plane.get_pixel(4, 2)[0], plane.get_pixel(0, 0)[0]);
    }

    #[test]
    fn inversion_flips_polarity() {
        let plane = luma_plane(&solid_buffer(2, 1, [0, 0, 0, 255]));
        let flipped = inverted(&plane);
        assert_eq!(flipped.get_pixel(0, 0)[0], 255);
        assert_eq!(inverted(&flipped).get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn equalize_stretches_midrange() {
        let mut plane = GrayImage::new(3, 1);
        plane.put_pixel(0, 0, Luma([100]));
        plane.put_pixel(1, 0, Luma([150]));
        plane.put_pixel(2, 0, Luma([200]));
        let stretched = equalized(&plane);
        assert_eq!(stretched.get_pixel(0, 0)[0], 0);
        assert_eq!(stretched.get_pixel(1, 0)[0], 127);
        assert_eq!(stretched.get_pixel(2, 0)[0], 255);
    }

    #[test]
    fn equalize_leaves_flat_plane_alone() {
        let plane = GrayImage::from_pixel(4, 4, Luma([77]));
        let out = equalized(&plane);
        assert_eq!(out.get_pixel(3, 3)[0], 77);
    }

    #[test]
    fn bounding_box_from_corners() {
        let b = BoundingBox::from_corners(&[(10.0, 20.0), (50.0, 20.0), (50.0, 60.0), (10.0, 60.0)]);
        assert_eq!(b.x, 10.0);
        assert_eq!(b.y, 20.0);
        assert_eq!(b.width, 40.0);
        assert_eq!(b.height, 40.0);
    }

    #[test]
    fn fits_within_rejects_edges_and_degenerate() {
        let frame = (100, 100);
        let inside = BoundingBox {
            x: 10.0,
            y: 10.0,
            width: 80.0,
            height: 80.0,
        };
        assert!(inside.fits_within(frame.0, frame.1));

        let overhang = BoundingBox {
            x: 50.0,
            y: 50.0,
            width: 60.0,
            height: 10.0,
        };
        assert!(!overhang.fits_within(frame.0, frame.1));

        let negative = BoundingBox {
            x: -1.0,
            y: 0.0,
            width: 10.0,
            height: 10.0,
        };
        assert!(!negative.fits_within(frame.0, frame.1));

        let flat = BoundingBox {
            x: 10.0,
            y: 10.0,
            width: 0.0,
            height: 5.0,
        };
        assert!(!flat.fits_within(frame.0, frame.1));
    }

    #[test]
    fn upscale_transform_round_trips() {
        let plane = GrayImage::from_pixel(100, 60, Luma([255]));
        let (canvas, transform) = upscale_letterboxed(&plane, 1.5);
        assert_eq!(canvas.dimensions(), (150, 90));

        // A hit covering the scaled frame maps back onto the source frame.
        let hit = BoundingBox {
            x: transform.pad_x + 30.0,
            y: transform.pad_y + 15.0,
            width: 60.0,
            height: 30.0,
        };
        let native = transform.to_source(hit);
        assert!((native.x - 20.0).abs() < 0.01);
        assert!((native.y - 10.0).abs() < 0.01);
        assert!((native.width - 40.0).abs() < 0.01);
        assert!((native.height - 20.0).abs() < 0.01);
    }

    #[test]
    fn upscale_of_odd_dimensions_stays_within_one_pixel_of_target() {
        let plane = GrayImage::from_pixel(33, 21, Luma([128]));
        let (canvas, transform) = upscale_letterboxed(&plane, 1.5);
        // ceil(33*1.5)=50 vs round(49.5)=50, ceil(21*1.5)=32 vs round(31.5)=32
        assert_eq!(canvas.dimensions(), (50, 32));
        assert!(transform.pad_x <= 1.0);
        assert!(transform.pad_y <= 1.0);
    }

    #[test]
    fn crop_region_extracts_expected_pixels() {
        let mut plane = GrayImage::from_pixel(10, 10, Luma([0]));
        plane.put_pixel(5, 5, Luma([255]));
        let crop = crop_region(&plane, 4, 4, 3, 3);
        assert_eq!(crop.dimensions(), (3, 3));
        assert_eq!(crop.get_pixel(1, 1)[0], 255);
        assert_eq!(crop.get_pixel(0, 0)[0], 0);
    }
}
