//! Fallback scan regions for pages where the native pass found nothing.
//!
//! Printed codes overwhelmingly sit in corners or margin bands, so the
//! fallback table is fixed and document-relative rather than data-driven:
//! four corner quadrants plus the top and bottom margin bands. Each region
//! is cropped out, upscaled, and re-scanned; small codes that were beneath
//! the detector's resolution at native size become readable at 2-3x.

/// Below this edge length a crop cannot hold a readable code plus quiet
/// zone, so the region is skipped.
const MIN_REGION_EDGE: u32 = 32;

/// One candidate region as fractions of the page dimensions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegionSpec {
    pub name: &'static str,
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

/// Concrete crop rectangle in buffer pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

pub(crate) const FALLBACK_REGIONS: [RegionSpec; 6] = [
    RegionSpec {
        name: "top-left",
        x: 0.0,
        y: 0.0,
        width: 0.4,
        height: 0.4,
    },
    RegionSpec {
        name: "top-right",
        x: 0.6,
        y: 0.0,
        width: 0.4,
        height: 0.4,
    },
    RegionSpec {
        name: "bottom-left",
        x: 0.0,
        y: 0.6,
        width: 0.4,
        height: 0.4,
    },
    RegionSpec {
        name: "bottom-right",
        x: 0.6,
        y: 0.6,
        width: 0.4,
        height: 0.4,
    },
    RegionSpec {
        name: "top-band",
        x: 0.0,
        y: 0.0,
        width: 1.0,
        height: 0.25,
    },
    RegionSpec {
        name: "bottom-band",
        x: 0.0,
        y: 0.75,
        width: 1.0,
        height: 0.25,
    },
];

impl RegionSpec {
    /// Resolve against a concrete page size, clamped to the page. Returns
    /// `None` when the resulting crop is too small to hold a code.
    pub(crate) fn to_pixels(&self, page_width: u32, page_height: u32) -> Option<PixelRect> {
        let x = ((self.x * page_width as f32).floor() as u32).min(page_width);
        let y = ((self.y * page_height as f32).floor() as u32).min(page_height);
        let width = ((self.width * page_width as f32).ceil() as u32).min(page_width - x);
        let height = ((self.height * page_height as f32).ceil() as u32).min(page_height - y);

        if width < MIN_REGION_EDGE || height < MIN_REGION_EDGE {
            return None;
        }
        Some(PixelRect {
            x,
            y,
            width,
            height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_stay_inside_the_page() {
        for (w, h) in [(1000, 800), (640, 480), (333, 517), (2481, 3507)] {
            for spec in FALLBACK_REGIONS {
                if let Some(rect) = spec.to_pixels(w, h) {
                    assert!(rect.x + rect.width <= w, "{} overflows x on {w}x{h}", spec.name);
                    assert!(
                        rect.y + rect.height <= h,
                        "{} overflows y on {w}x{h}",
                        spec.name
                    );
                    assert!(rect.width >= MIN_REGION_EDGE);
                    assert!(rect.height >= MIN_REGION_EDGE);
                }
            }
        }
    }

    #[test]
    fn corner_regions_land_in_their_corners() {
        let tl = FALLBACK_REGIONS[0].to_pixels(1000, 800).unwrap();
        assert_eq!(tl, PixelRect { x: 0, y: 0, width: 400, height: 320 });

        let br = FALLBACK_REGIONS[3].to_pixels(1000, 800).unwrap();
        assert_eq!(br.x, 600);
        assert_eq!(br.y, 480);
        assert_eq!(br.x + br.width, 1000);
        assert_eq!(br.y + br.height, 800);
    }

    #[test]
    fn tiny_pages_yield_no_regions() {
        for spec in FALLBACK_REGIONS {
            assert!(spec.to_pixels(64, 40).is_none(), "{} accepted", spec.name);
        }
    }

    #[test]
    fn bands_span_full_width() {
        let band = FALLBACK_REGIONS[4].to_pixels(777, 1111).unwrap();
        assert_eq!(band.x, 0);
        assert_eq!(band.width, 777);
        assert!(band.height >= 1111 / 4);
    }
}
