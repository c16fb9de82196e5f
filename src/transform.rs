// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Geometric transforms carried by item properties: clean aperture, rotation and mirroring.
//!
//! Transforms apply in the order their properties are associated with the item.
//! Each step sees the output size of the step before it, so a crop listed after
//! a rotation is interpreted in rotated coordinates.

use crate::image::Image;
use crate::{Error, Result, SubCode, TryVec};
use log::trace;

/// Counter-clockwise rotation in quarter turns ('irot').
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// From the 2-bit 'irot' angle field.
    #[must_use]
    pub fn from_angle_code(code: u8) -> Self {
        match code & 3 {
            0 => Self::Deg0,
            1 => Self::Deg90,
            2 => Self::Deg180,
            _ => Self::Deg270,
        }
    }

    #[must_use]
    pub fn angle_code(self) -> u8 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 1,
            Self::Deg180 => 2,
            Self::Deg270 => 3,
        }
    }

    #[must_use]
    pub fn degrees(self) -> u16 {
        u16::from(self.angle_code()) * 90
    }

    /// Whether width and height trade places.
    #[must_use]
    pub fn swaps_axes(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

/// Mirror axis ('imir').
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorAxis {
    /// Mirror about the vertical axis: top and bottom rows swap.
    Vertical,
    /// Mirror about the horizontal axis: left and right columns swap.
    Horizontal,
}

/// A signed rational number as stored in 'clap'.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    pub numerator: i32,
    pub denominator: u32,
}

impl Fraction {
    #[must_use]
    pub const fn new(numerator: i32, denominator: u32) -> Self {
        Self { numerator, denominator }
    }
}

/// Pixel margins removed by a clean aperture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropMargins {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// Clean aperture ('clap'): a centered crop rectangle given as rationals.
/// See ISO 14496-12:2015 § 12.1.4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanAperture {
    pub width: Fraction,
    pub height: Fraction,
    pub horizontal_offset: Fraction,
    pub vertical_offset: Fraction,
}

/// First and last kept sample along one axis, by exact rational arithmetic.
///
/// The aperture center is `offset + (extent - 1) / 2`; the kept range spans
/// `(size - 1) / 2` to either side of it, rounded down.
fn aperture_range(size: Fraction, offset: Fraction, extent: u32) -> (i128, i128) {
    let (sn, sd) = (i128::from(size.numerator), i128::from(size.denominator));
    let (on, od) = (i128::from(offset.numerator), i128::from(offset.denominator));
    let extent = i128::from(extent);
    let den = 2 * od * sd;
    let center = 2 * on * sd + (extent - 1) * od * sd;
    let half = (sn - sd) * od;
    ((center - half).div_euclid(den), (center + half).div_euclid(den))
}

impl CleanAperture {
    pub(crate) fn validate(&self) -> Result<()> {
        let fractions = [self.width, self.height, self.horizontal_offset, self.vertical_offset];
        if fractions.iter().any(|f| f.denominator == 0) {
            return Err(Error::InvalidData(SubCode::InvalidFractionalNumber, "clap fraction with zero denominator"));
        }
        if self.width.numerator <= 0 || self.height.numerator <= 0 {
            return Err(Error::InvalidData(SubCode::InvalidCleanAperture, "clap size must be positive"));
        }
        Ok(())
    }

    /// The margins this aperture removes from a `width`×`height` image.
    pub fn margins(&self, width: u32, height: u32) -> Result<CropMargins> {
        self.validate()?;
        let (left, right) = aperture_range(self.width, self.horizontal_offset, width);
        let (top, bottom) = aperture_range(self.height, self.vertical_offset, height);
        let (w, h) = (i128::from(width), i128::from(height));
        let left = left.max(0);
        let top = top.max(0);
        let right = right.min(w - 1);
        let bottom = bottom.min(h - 1);
        if left > right || top > bottom {
            return Err(Error::InvalidData(SubCode::InvalidCleanAperture, "clap rectangle outside of the image"));
        }
        // all four values lie within [0, extent), so they fit
        Ok(CropMargins {
            left: u32::try_from(left)?,
            top: u32::try_from(top)?,
            right: u32::try_from(w - 1 - right)?,
            bottom: u32::try_from(h - 1 - bottom)?,
        })
    }

    /// Build the aperture that removes the given pixel margins from a `width`×`height` image.
    pub fn from_margins(width: u32, height: u32, left: u32, top: u32, right: u32, bottom: u32) -> Result<Self> {
        let crop_w = width
            .checked_sub(left)
            .and_then(|w| w.checked_sub(right))
            .filter(|&w| w > 0)
            .ok_or(Error::Usage(SubCode::InvalidParameterValue, "crop margins exceed image width"))?;
        let crop_h = height
            .checked_sub(top)
            .and_then(|h| h.checked_sub(bottom))
            .filter(|&h| h > 0)
            .ok_or(Error::Usage(SubCode::InvalidParameterValue, "crop margins exceed image height"))?;
        let offset = |a: u32, b: u32| -> Result<Fraction> { Ok(Fraction::new(i32::try_from(i64::from(a) - i64::from(b))?, 2)) };
        Ok(Self {
            width: Fraction::new(i32::try_from(crop_w)?, 1),
            height: Fraction::new(i32::try_from(crop_h)?, 1),
            horizontal_offset: offset(left, right)?,
            vertical_offset: offset(top, bottom)?,
        })
    }
}

/// One geometric transform of an image item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    CleanAperture(CleanAperture),
    Rotate(Rotation),
    Mirror(MirrorAxis),
}

/// A transform with the image size it applies to resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Crop(CropMargins),
    Rotate(Rotation),
    Mirror(MirrorAxis),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedStep {
    pub(crate) step: Step,
    pub(crate) in_width: u32,
    pub(crate) in_height: u32,
    pub(crate) out_width: u32,
    pub(crate) out_height: u32,
}

/// Resolve the sizes each transform sees, starting from a `width`×`height` image.
pub(crate) fn resolve(transforms: &[Transform], width: u32, height: u32) -> Result<TryVec<ResolvedStep>> {
    let mut steps = TryVec::with_capacity(transforms.len())?;
    let (mut w, mut h) = (width, height);
    for transform in transforms {
        let (step, out_w, out_h) = match *transform {
            Transform::CleanAperture(clap) => {
                let m = clap.margins(w, h)?;
                (Step::Crop(m), w - m.left - m.right, h - m.top - m.bottom)
            },
            Transform::Rotate(r) if r.swaps_axes() => (Step::Rotate(r), h, w),
            Transform::Rotate(r) => (Step::Rotate(r), w, h),
            Transform::Mirror(axis) => (Step::Mirror(axis), w, h),
        };
        steps.push(ResolvedStep {
            step,
            in_width: w,
            in_height: h,
            out_width: out_w,
            out_height: out_h,
        })?;
        w = out_w;
        h = out_h;
    }
    Ok(steps)
}

/// Size of a `width`×`height` image after all `transforms`.
pub fn transformed_size(transforms: &[Transform], width: u32, height: u32) -> Result<(u32, u32)> {
    let steps = resolve(transforms, width, height)?;
    Ok(steps.last().map_or((width, height), |s| (s.out_width, s.out_height)))
}

/// Apply `transforms` to `image` in order.
pub(crate) fn apply(mut image: Image, transforms: &[Transform]) -> Result<Image> {
    for s in resolve(transforms, image.width, image.height)?.iter() {
        trace!("{:?} on {}x{}", s.step, s.in_width, s.in_height);
        image = match s.step {
            Step::Crop(margins) => image.crop(margins)?,
            Step::Rotate(Rotation::Deg0) => image,
            Step::Rotate(rotation) => image.rotate_ccw(rotation)?,
            Step::Mirror(axis) => image.mirror(axis)?,
        };
        debug_assert_eq!((image.width, image.height), (s.out_width, s.out_height));
    }
    Ok(image)
}

#[test]
fn clap_margins_roundtrip() {
    let clap = CleanAperture::from_margins(64, 48, 3, 5, 7, 11).unwrap();
    assert_eq!(clap.width, Fraction::new(54, 1));
    assert_eq!(clap.horizontal_offset, Fraction::new(-4, 2));
    assert_eq!(
        clap.margins(64, 48).unwrap(),
        CropMargins {
            left: 3,
            top: 5,
            right: 7,
            bottom: 11
        }
    );
}

#[test]
fn clap_centered_odd_width() {
    // 10 wide aperture centered in 15: center 7, span 4.5 either side
    let clap = CleanAperture {
        width: Fraction::new(10, 1),
        height: Fraction::new(4, 1),
        horizontal_offset: Fraction::new(0, 1),
        vertical_offset: Fraction::new(0, 1),
    };
    let m = clap.margins(15, 4).unwrap();
    assert_eq!((m.left, m.right, m.top, m.bottom), (2, 3, 0, 0));
}

#[test]
fn clap_rejects_zero_denominator() {
    let clap = CleanAperture {
        width: Fraction::new(10, 0),
        height: Fraction::new(4, 1),
        horizontal_offset: Fraction::new(0, 1),
        vertical_offset: Fraction::new(0, 1),
    };
    assert!(matches!(clap.margins(15, 4), Err(Error::InvalidData(SubCode::InvalidFractionalNumber, _))));
}

#[test]
fn transform_order_changes_size() {
    let clap = CleanAperture::from_margins(64, 48, 10, 10, 10, 10).unwrap();
    let crop_then_rotate = [Transform::CleanAperture(clap), Transform::Rotate(Rotation::Deg90)];
    assert_eq!(transformed_size(&crop_then_rotate, 64, 48).unwrap(), (28, 44));
    let rotate_then_crop = [Transform::Rotate(Rotation::Deg90), Transform::CleanAperture(clap)];
    assert_eq!(transformed_size(&rotate_then_crop, 64, 48).unwrap(), (44, 28));
}
