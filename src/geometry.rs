use serde::Serialize;

use crate::error::{MirrorError, Result};

/// Fractional bits used by compositing source rectangles.
pub const FIXED_SHIFT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplayInfo {
    pub width: u32,
    pub height: u32,
}

impl DisplayInfo {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn rect(&self) -> Rect {
        Rect::new(0, 0, self.width as i32, self.height as i32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Components in 16.16 fixed point, as compositing source rectangles
    /// expect them. `None` if a component is outside +/-32767.
    pub fn to_fixed(self) -> Option<Rect> {
        let fixed = |v: i32| v.checked_mul(1 << FIXED_SHIFT);
        Some(Rect {
            x: fixed(self.x)?,
            y: fixed(self.y)?,
            width: fixed(self.width)?,
            height: fixed(self.height)?,
        })
    }

    /// Integer pixel part of a 16.16 rectangle.
    pub fn from_fixed(self) -> Rect {
        Rect {
            x: self.x >> FIXED_SHIFT,
            y: self.y >> FIXED_SHIFT,
            width: self.width >> FIXED_SHIFT,
            height: self.height >> FIXED_SHIFT,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Whether this rectangle lies entirely inside `0..width, 0..height`.
    pub fn fits_within(&self, bounds: DisplayInfo) -> bool {
        self.x >= 0
            && self.y >= 0
            && self.x as i64 + self.width as i64 <= bounds.width as i64
            && self.y as i64 + self.height as i64 <= bounds.height as i64
    }
}

/// Operator-supplied crop. Negative width/height mean "to the display edge".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropSpec {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

impl Default for CropSpec {
    fn default() -> Self {
        Self {
            left: 0,
            top: 0,
            width: -1,
            height: -1,
        }
    }
}

impl CropSpec {
    /// True when the operator asked for anything other than the whole display.
    pub fn is_requested(&self) -> bool {
        self.left != 0 || self.top != 0 || self.width >= 0 || self.height >= 0
    }

    /// Resolve defaulted dimensions against the primary display.
    ///
    /// Out-of-range values supplied by the operator are kept as given; only
    /// a crop that ends up with no area is rejected.
    pub fn resolve(&self, primary: DisplayInfo) -> Result<Rect> {
        let width = if self.width < 0 {
            primary.width as i64 - self.left as i64
        } else {
            self.width as i64
        };
        let height = if self.height < 0 {
            primary.height as i64 - self.top as i64
        } else {
            self.height as i64
        };

        let invalid = || MirrorError::InvalidCrop {
            left: self.left,
            top: self.top,
            width: width.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            height: height.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
        };
        let width = i32::try_from(width).map_err(|_| invalid())?;
        let height = i32::try_from(height).map_err(|_| invalid())?;
        let rect = Rect::new(self.left, self.top, width, height);
        if rect.is_empty() {
            return Err(invalid());
        }
        Ok(rect)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleMode {
    /// Stretch to fill target, ignoring aspect ratio
    #[default]
    Stretch,
    /// Preserve aspect ratio, fit within target (letterbox/pillarbox)
    Fit,
    /// Preserve aspect ratio, fill target completely (crops edges)
    Fill,
    /// Display at 1:1 pixel ratio, centered (no scaling)
    Center,
}

/// Destination rectangle on a `target`-sized output for a source of
/// `src_w` x `src_h` pixels (already rotated).
pub fn destination_rect(mode: ScaleMode, src_w: u32, src_h: u32, target: DisplayInfo) -> Rect {
    let (width, height) = (target.width as i64, target.height as i64);
    let (sw, sh) = (src_w.max(1) as i64, src_h.max(1) as i64);
    // src aspect > dst aspect, compared without division
    let source_wider = sw * height > sh * width;

    let (x, y, w, h) = match mode {
        ScaleMode::Stretch => (0, 0, width, height),
        ScaleMode::Fit => {
            if source_wider {
                // Letterbox (bars top/bottom)
                let h = width * sh / sw;
                (0, (height - h) / 2, width, h)
            } else {
                // Pillarbox (bars left/right)
                let w = height * sw / sh;
                ((width - w) / 2, 0, w, height)
            }
        }
        ScaleMode::Fill => {
            if source_wider {
                // Extend beyond left/right edges
                let w = height * sw / sh;
                ((width - w) / 2, 0, w, height)
            } else {
                // Extend beyond top/bottom edges
                let h = width * sh / sw;
                (0, (height - h) / 2, width, h)
            }
        }
        ScaleMode::Center => (
            (width - sw) / 2,
            (height - sh) / 2,
            sw,
            sh,
        ),
    };

    Rect::new(x as i32, y as i32, w as i32, h as i32)
}

/// Nearest source index for destination index `i` when `src` samples are
/// spread over `dst` outputs, sampling at pixel centres.
#[inline]
pub fn scale_index(i: u32, dst: u32, src: u32) -> u32 {
    if dst == 0 {
        return 0;
    }
    ((2 * i as u64 + 1) * src as u64 / (2 * dst as u64)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_HD: DisplayInfo = DisplayInfo {
        width: 1920,
        height: 1080,
    };

    #[test]
    fn default_crop_extends_to_display_edge() {
        for (left, top) in [(0, 0), (10, 20), (1919, 1079), (640, 0)] {
            let crop = CropSpec {
                left,
                top,
                ..CropSpec::default()
            };
            let rect = crop.resolve(FULL_HD).unwrap();
            assert_eq!(rect, Rect::new(left, top, 1920 - left, 1080 - top));
        }
    }

    #[test]
    fn explicit_crop_is_not_clamped() {
        let crop = CropSpec {
            left: 1800,
            top: 0,
            width: 400,
            height: 100,
        };
        let rect = crop.resolve(FULL_HD).unwrap();
        assert_eq!(rect, Rect::new(1800, 0, 400, 100));
        assert!(!rect.fits_within(FULL_HD));
    }

    #[test]
    fn defaulted_crop_without_area_is_rejected() {
        let crop = CropSpec {
            left: 1920,
            ..CropSpec::default()
        };
        assert!(matches!(
            crop.resolve(FULL_HD),
            Err(MirrorError::InvalidCrop { width: 0, .. })
        ));
    }

    #[test]
    fn crop_requested_only_when_changed() {
        assert!(!CropSpec::default().is_requested());
        assert!(CropSpec {
            top: 4,
            ..CropSpec::default()
        }
        .is_requested());
        assert!(CropSpec {
            width: 100,
            ..CropSpec::default()
        }
        .is_requested());
    }

    #[test]
    fn fixed_point_shifts_by_sixteen() {
        let rect = Rect::new(1, 2, 320, 240).to_fixed().unwrap();
        assert_eq!(rect, Rect::new(65536, 131072, 320 << 16, 240 << 16));
        assert_eq!(rect.from_fixed(), Rect::new(1, 2, 320, 240));
        assert_eq!(
            Rect::new(-5, 0, 32767, 1).to_fixed(),
            Some(Rect::new(-5 << 16, 0, 32767 << 16, 1 << 16))
        );
    }

    #[test]
    fn fixed_point_rejects_components_that_would_wrap() {
        assert_eq!(Rect::new(0, 0, 40000, 1080).to_fixed(), None);
        assert_eq!(Rect::new(0, 32768, 10, 10).to_fixed(), None);
        assert_eq!(Rect::new(-32769, 0, 10, 10).to_fixed(), None);
    }

    #[test]
    fn fit_letterboxes_wide_source() {
        let rect = destination_rect(ScaleMode::Fit, 1920, 1080, DisplayInfo::new(320, 240));
        assert_eq!(rect, Rect::new(0, 30, 320, 180));
    }

    #[test]
    fn fit_pillarboxes_tall_source() {
        let rect = destination_rect(ScaleMode::Fit, 1080, 1920, DisplayInfo::new(320, 240));
        assert_eq!(rect, Rect::new(92, 0, 135, 240));
    }

    #[test]
    fn fill_overflows_target() {
        let rect = destination_rect(ScaleMode::Fill, 1920, 1080, DisplayInfo::new(320, 240));
        assert_eq!(rect, Rect::new(-53, 0, 426, 240));
    }

    #[test]
    fn center_and_stretch() {
        let target = DisplayInfo::new(320, 240);
        assert_eq!(
            destination_rect(ScaleMode::Center, 100, 40, target),
            Rect::new(110, 100, 100, 40)
        );
        assert_eq!(
            destination_rect(ScaleMode::Stretch, 1920, 1080, target),
            target.rect()
        );
    }

    #[test]
    fn scale_index_samples_pixel_centres() {
        // 1:1
        assert!((0..10).all(|i| scale_index(i, 10, 10) == i));
        // 2:1 downscale picks the second of each pair
        assert_eq!(
            (0..4).map(|i| scale_index(i, 4, 8)).collect::<Vec<_>>(),
            vec![1, 3, 5, 7]
        );
        // 1:2 upscale repeats
        assert_eq!(
            (0..4).map(|i| scale_index(i, 4, 2)).collect::<Vec<_>>(),
            vec![0, 0, 1, 1]
        );
    }
}
