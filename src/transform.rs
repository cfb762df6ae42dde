use serde::Serialize;

use crate::error::{MirrorError, Result};
use crate::geometry::scale_index;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Rotation {
    #[default]
    #[serde(rename = "0")]
    None,
    #[serde(rename = "90")]
    Cw90,
    #[serde(rename = "180")]
    Cw180,
    #[serde(rename = "270")]
    Cw270,
}

impl Rotation {
    pub fn degrees(self) -> u32 {
        match self {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }

    /// Quarter turns swap the width and height of the image.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Cw90 | Rotation::Cw270)
    }
}

impl TryFrom<i64> for Rotation {
    type Error = MirrorError;

    fn try_from(angle: i64) -> Result<Self> {
        match angle {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Cw90),
            180 => Ok(Rotation::Cw180),
            270 => Ok(Rotation::Cw270),
            other => Err(MirrorError::InvalidRotation(other)),
        }
    }
}

/// Rotation plus flips, applied in that order to the cropped source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Transform {
    pub rotation: Rotation,
    pub flip_vertical: bool,
    pub flip_horizontal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flip {
    pub vertical: bool,
    pub horizontal: bool,
}

impl Transform {
    pub fn new(rotation: Rotation, flip: Flip) -> Self {
        Self {
            rotation,
            flip_vertical: flip.vertical,
            flip_horizontal: flip.horizontal,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Transform::default()
    }

    /// Size of a `width` x `height` source once this transform is applied.
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        if self.rotation.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }
}

/// clap value parser for the rotation angle.
pub fn parse_rotation(value: &str) -> Result<Rotation, String> {
    let angle: i64 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a number", value))?;
    Rotation::try_from(angle).map_err(|e| e.to_string())
}

/// Parse a flip string: any mix of 'v' and 'h', case-insensitive.
pub fn parse_flip(spec: &str) -> Result<Flip> {
    let mut flip = Flip::default();
    for ch in spec.chars() {
        match ch.to_ascii_lowercase() {
            'v' => flip.vertical = true,
            'h' => flip.horizontal = true,
            _ => {
                return Err(MirrorError::InvalidFlip {
                    spec: spec.to_string(),
                    found: ch,
                })
            }
        }
    }
    Ok(flip)
}

/// clap value parser for the flip string.
pub fn parse_flip_arg(value: &str) -> Result<Flip, String> {
    parse_flip(value).map_err(|e| e.to_string())
}

/// Maps destination pixels of a transformed, scaled element back to
/// pixels of the (unrotated) crop region.
#[derive(Debug, Clone, Copy)]
pub struct SampleMap {
    transform: Transform,
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
}

impl SampleMap {
    pub fn new(transform: Transform, src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> Self {
        Self {
            transform,
            src_w,
            src_h,
            dst_w,
            dst_h,
        }
    }

    /// Crop-relative source pixel for destination pixel `(dx, dy)`.
    pub fn source(&self, dx: u32, dy: u32) -> (u32, u32) {
        let (rw, rh) = self.transform.output_size(self.src_w, self.src_h);
        let mut a = scale_index(dx, self.dst_w, rw);
        let mut b = scale_index(dy, self.dst_h, rh);

        // Flips act on the rotated image
        if self.transform.flip_horizontal {
            a = rw - 1 - a;
        }
        if self.transform.flip_vertical {
            b = rh - 1 - b;
        }

        match self.transform.rotation {
            Rotation::None => (a, b),
            Rotation::Cw90 => (b, self.src_h - 1 - a),
            Rotation::Cw180 => (self.src_w - 1 - a, self.src_h - 1 - b),
            Rotation::Cw270 => (self.src_w - 1 - b, a),
        }
    }
}
