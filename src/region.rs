// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Region annotation items ('rgan') and mapping of their geometry onto a transformed image.
//!
//! Region coordinates live in a reference space of `reference_width`×`reference_height`
//! that is scaled onto the untransformed image. The image's crop, rotation and mirror
//! steps then move them exactly as they move pixels.

use crate::transform::{ResolvedStep, Rotation, Step, Transform, resolve};
use crate::{Error, Result, SubCode, ToUsize, TryVec};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

mod geometry {
    pub(super) const POINT: u8 = 0;
    pub(super) const RECTANGLE: u8 = 1;
    pub(super) const ELLIPSE: u8 = 2;
    pub(super) const POLYGON: u8 = 3;
    pub(super) const REFERENCED_MASK: u8 = 4;
    pub(super) const INLINE_MASK: u8 = 5;
    pub(super) const POLYLINE: u8 = 6;
}

/// One region geometry in reference-space coordinates.
#[derive(Debug, PartialEq)]
pub enum Region {
    Point { x: i32, y: i32 },
    Rectangle { x: i32, y: i32, width: u32, height: u32 },
    /// Centered at (`x`, `y`).
    Ellipse { x: i32, y: i32, radius_x: u32, radius_y: u32 },
    Polygon { points: TryVec<(i32, i32)> },
    Polyline { points: TryVec<(i32, i32)> },
    /// A mask stored as its own item, linked through a 'mask' reference.
    ReferencedMask { x: i32, y: i32, width: u32, height: u32, mask_item: u32 },
    /// A 1-bit mask, row-major with the most significant bit first.
    InlineMask { x: i32, y: i32, width: u32, height: u32, data: TryVec<u8> },
}

/// A region item: a set of regions annotating the image it describes.
#[derive(Debug, PartialEq)]
pub struct RegionItem {
    pub item_id: u32,
    pub reference_width: u32,
    pub reference_height: u32,
    pub regions: TryVec<Region>,
}

struct Fields<'a> {
    data: &'a [u8],
    wide: bool,
}

impl Fields<'_> {
    fn truncated(_: std::io::Error) -> Error {
        Error::InvalidData(SubCode::InvalidRegionData, "region item data too short")
    }

    fn u8(&mut self) -> Result<u8> {
        self.data.read_u8().map_err(Self::truncated)
    }

    fn unsigned(&mut self) -> Result<u32> {
        if self.wide {
            self.data.read_u32::<BigEndian>().map_err(Self::truncated)
        } else {
            Ok(self.data.read_u16::<BigEndian>().map_err(Self::truncated)?.into())
        }
    }

    fn signed(&mut self) -> Result<i32> {
        if self.wide {
            self.data.read_i32::<BigEndian>().map_err(Self::truncated)
        } else {
            Ok(self.data.read_i16::<BigEndian>().map_err(Self::truncated)?.into())
        }
    }

    fn points(&mut self) -> Result<TryVec<(i32, i32)>> {
        let count = self.unsigned()?;
        // each point needs at least 4 bytes
        if count.to_usize() > self.data.len() / 4 {
            return Err(Error::InvalidData(SubCode::InvalidRegionData, "polygon point count exceeds data"));
        }
        let mut points = TryVec::with_capacity(count.to_usize())?;
        for _ in 0..count {
            points.push((self.signed()?, self.signed()?))?;
        }
        Ok(points)
    }
}

struct Writer {
    out: std::vec::Vec<u8>,
    wide: bool,
}

impl Writer {
    fn unsigned(&mut self, v: u32) -> Result<()> {
        if self.wide {
            self.out.write_u32::<BigEndian>(v)?;
        } else {
            self.out.write_u16::<BigEndian>(u16::try_from(v)?)?;
        }
        Ok(())
    }

    fn signed(&mut self, v: i32) -> Result<()> {
        if self.wide {
            self.out.write_i32::<BigEndian>(v)?;
        } else {
            self.out.write_i16::<BigEndian>(i16::try_from(v)?)?;
        }
        Ok(())
    }

    fn points(&mut self, points: &[(i32, i32)]) -> Result<()> {
        self.unsigned(u32::try_from(points.len())?)?;
        for &(x, y) in points {
            self.signed(x)?;
            self.signed(y)?;
        }
        Ok(())
    }
}

impl Region {
    fn needs_wide_fields(&self) -> bool {
        let signed = |v: i32| i16::try_from(v).is_err();
        let unsigned = |v: u32| u16::try_from(v).is_err();
        match self {
            Self::Point { x, y } => signed(*x) || signed(*y),
            Self::Rectangle { x, y, width, height }
            | Self::ReferencedMask { x, y, width, height, .. }
            | Self::InlineMask { x, y, width, height, .. } => signed(*x) || signed(*y) || unsigned(*width) || unsigned(*height),
            Self::Ellipse { x, y, radius_x, radius_y } => signed(*x) || signed(*y) || unsigned(*radius_x) || unsigned(*radius_y),
            Self::Polygon { points } | Self::Polyline { points } => {
                unsigned(points.len() as u32) || points.iter().any(|&(x, y)| signed(x) || signed(y))
            },
        }
    }
}

impl RegionItem {
    /// Parse a region item payload. `mask_items` are the item's 'mask' references in order.
    pub fn parse(item_id: u32, data: &[u8], mask_items: &[u32]) -> Result<Self> {
        let mut f = Fields { data, wide: false };
        let version = f.u8()?;
        if version != 0 {
            return Err(Error::Unsupported(SubCode::UnsupportedDataVersion, "region item version"));
        }
        f.wide = f.u8()? & 1 == 1;
        let reference_width = f.unsigned()?;
        let reference_height = f.unsigned()?;
        let count = f.u8()?;
        let mut masks = mask_items.iter().copied();
        let mut regions = TryVec::with_capacity(count.into())?;
        for _ in 0..count {
            let region = match f.u8()? {
                geometry::POINT => Region::Point { x: f.signed()?, y: f.signed()? },
                geometry::RECTANGLE => Region::Rectangle {
                    x: f.signed()?,
                    y: f.signed()?,
                    width: f.unsigned()?,
                    height: f.unsigned()?,
                },
                geometry::ELLIPSE => Region::Ellipse {
                    x: f.signed()?,
                    y: f.signed()?,
                    radius_x: f.unsigned()?,
                    radius_y: f.unsigned()?,
                },
                geometry::POLYGON => Region::Polygon { points: f.points()? },
                geometry::POLYLINE => Region::Polyline { points: f.points()? },
                geometry::REFERENCED_MASK => Region::ReferencedMask {
                    x: f.signed()?,
                    y: f.signed()?,
                    width: f.unsigned()?,
                    height: f.unsigned()?,
                    mask_item: masks
                        .next()
                        .ok_or(Error::InvalidData(SubCode::InvalidRegionData, "referenced mask without a 'mask' reference"))?,
                },
                geometry::INLINE_MASK => {
                    let (x, y, width, height) = (f.signed()?, f.signed()?, f.unsigned()?, f.unsigned()?);
                    if f.u8()? != 0 {
                        return Err(Error::Unsupported(SubCode::UnsupportedParameter, "inline mask coding method"));
                    }
                    let len = (u64::from(width) * u64::from(height)).div_ceil(8);
                    let len = usize::try_from(len)?;
                    if len > f.data.len() {
                        return Err(Error::InvalidData(SubCode::InvalidRegionData, "inline mask data too short"));
                    }
                    let (bits, rest) = f.data.split_at(len);
                    let mut mask = TryVec::with_capacity(len)?;
                    mask.extend_from_slice(bits)?;
                    f.data = rest;
                    Region::InlineMask {
                        x,
                        y,
                        width,
                        height,
                        data: mask,
                    }
                },
                _ => return Err(Error::InvalidData(SubCode::InvalidRegionData, "unknown region geometry type")),
            };
            regions.push(region)?;
        }
        Ok(Self {
            item_id,
            reference_width,
            reference_height,
            regions,
        })
    }

    /// Serialize the payload. Returns the 'mask' references the item needs, in order.
    pub fn to_bytes(&self) -> Result<(std::vec::Vec<u8>, std::vec::Vec<u32>)> {
        let count = u8::try_from(self.regions.len())
            .map_err(|_| Error::Encoding(SubCode::TooManyRegions, "a region item holds at most 255 regions"))?;
        let wide = self.reference_width > u32::from(u16::MAX)
            || self.reference_height > u32::from(u16::MAX)
            || self.regions.iter().any(Region::needs_wide_fields);
        let mut w = Writer {
            out: std::vec::Vec::new(),
            wide,
        };
        let mut masks = std::vec::Vec::new();
        w.out.write_u8(0)?;
        w.out.write_u8(u8::from(wide))?;
        w.unsigned(self.reference_width)?;
        w.unsigned(self.reference_height)?;
        w.out.write_u8(count)?;
        for region in self.regions.iter() {
            match region {
                Region::Point { x, y } => {
                    w.out.write_u8(geometry::POINT)?;
                    w.signed(*x)?;
                    w.signed(*y)?;
                },
                Region::Rectangle { x, y, width, height } => {
                    w.out.write_u8(geometry::RECTANGLE)?;
                    w.signed(*x)?;
                    w.signed(*y)?;
                    w.unsigned(*width)?;
                    w.unsigned(*height)?;
                },
                Region::Ellipse { x, y, radius_x, radius_y } => {
                    w.out.write_u8(geometry::ELLIPSE)?;
                    w.signed(*x)?;
                    w.signed(*y)?;
                    w.unsigned(*radius_x)?;
                    w.unsigned(*radius_y)?;
                },
                Region::Polygon { points } => {
                    w.out.write_u8(geometry::POLYGON)?;
                    w.points(points)?;
                },
                Region::Polyline { points } => {
                    w.out.write_u8(geometry::POLYLINE)?;
                    w.points(points)?;
                },
                Region::ReferencedMask { x, y, width, height, mask_item } => {
                    w.out.write_u8(geometry::REFERENCED_MASK)?;
                    w.signed(*x)?;
                    w.signed(*y)?;
                    w.unsigned(*width)?;
                    w.unsigned(*height)?;
                    masks.push(*mask_item);
                },
                Region::InlineMask { x, y, width, height, data } => {
                    w.out.write_u8(geometry::INLINE_MASK)?;
                    w.signed(*x)?;
                    w.signed(*y)?;
                    w.unsigned(*width)?;
                    w.unsigned(*height)?;
                    w.out.write_u8(0)?;
                    w.out.extend_from_slice(data);
                },
            }
        }
        Ok((w.out, masks))
    }
}

/// Region geometry in the coordinate space of the transformed image.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformedRegion {
    Point { x: f64, y: f64 },
    Rectangle { x: f64, y: f64, width: f64, height: f64 },
    Ellipse { x: f64, y: f64, radius_x: f64, radius_y: f64 },
    Polygon { points: std::vec::Vec<(f64, f64)> },
    Polyline { points: std::vec::Vec<(f64, f64)> },
    /// Bounding box of a mask region.
    Mask { x: f64, y: f64, width: f64, height: f64 },
}

/// Maps region coordinates between reference space and a transformed image.
///
/// Coordinates are continuous: a pixel covers `[x, x + 1)`, so mirroring a
/// `w`-wide image sends `x` to `w - x`.
#[derive(Debug, Clone)]
pub struct CoordinateMapper {
    scale_x: f64,
    scale_y: f64,
    steps: std::vec::Vec<ResolvedStep>,
}

impl CoordinateMapper {
    /// `image_width`×`image_height` is the image size before any of `transforms` apply.
    pub fn new(reference_width: u32, reference_height: u32, image_width: u32, image_height: u32, transforms: &[Transform]) -> Result<Self> {
        if reference_width == 0 || reference_height == 0 {
            return Err(Error::InvalidData(SubCode::InvalidRegionData, "region reference size cannot be zero"));
        }
        let steps = resolve(transforms, image_width, image_height)?;
        Ok(Self {
            scale_x: f64::from(image_width) / f64::from(reference_width),
            scale_y: f64::from(image_height) / f64::from(reference_height),
            steps: steps.iter().copied().collect(),
        })
    }

    /// Reference-space point to transformed-image coordinates.
    #[must_use]
    pub fn map_point(&self, x: f64, y: f64) -> (f64, f64) {
        let (mut x, mut y) = (x * self.scale_x, y * self.scale_y);
        for s in &self.steps {
            let (w, h) = (f64::from(s.in_width), f64::from(s.in_height));
            (x, y) = match s.step {
                Step::Crop(m) => (x - f64::from(m.left), y - f64::from(m.top)),
                Step::Rotate(Rotation::Deg0) => (x, y),
                Step::Rotate(Rotation::Deg90) => (y, w - x),
                Step::Rotate(Rotation::Deg180) => (w - x, h - y),
                Step::Rotate(Rotation::Deg270) => (h - y, x),
                Step::Mirror(crate::MirrorAxis::Vertical) => (x, h - y),
                Step::Mirror(crate::MirrorAxis::Horizontal) => (w - x, y),
            };
        }
        (x, y)
    }

    /// Transformed-image point back to reference space.
    #[must_use]
    pub fn unmap_point(&self, x: f64, y: f64) -> (f64, f64) {
        let (mut x, mut y) = (x, y);
        for s in self.steps.iter().rev() {
            let (w, h) = (f64::from(s.in_width), f64::from(s.in_height));
            (x, y) = match s.step {
                Step::Crop(m) => (x + f64::from(m.left), y + f64::from(m.top)),
                Step::Rotate(Rotation::Deg0) => (x, y),
                Step::Rotate(Rotation::Deg90) => (w - y, x),
                Step::Rotate(Rotation::Deg180) => (w - x, h - y),
                Step::Rotate(Rotation::Deg270) => (y, h - x),
                Step::Mirror(crate::MirrorAxis::Vertical) => (x, h - y),
                Step::Mirror(crate::MirrorAxis::Horizontal) => (w - x, y),
            };
        }
        (x / self.scale_x, y / self.scale_y)
    }

    fn map_box(&self, x: i32, y: i32, width: u32, height: u32) -> (f64, f64, f64, f64) {
        let (x0, y0) = self.map_point(f64::from(x), f64::from(y));
        let (x1, y1) = self.map_point(f64::from(x) + f64::from(width), f64::from(y) + f64::from(height));
        (x0.min(x1), y0.min(y1), (x1 - x0).abs(), (y1 - y0).abs())
    }

    pub fn map_region(&self, region: &Region) -> TransformedRegion {
        let map_points = |points: &[(i32, i32)]| points.iter().map(|&(x, y)| self.map_point(f64::from(x), f64::from(y))).collect();
        match region {
            Region::Point { x, y } => {
                let (x, y) = self.map_point(f64::from(*x), f64::from(*y));
                TransformedRegion::Point { x, y }
            },
            Region::Rectangle { x, y, width, height } => {
                let (x, y, width, height) = self.map_box(*x, *y, *width, *height);
                TransformedRegion::Rectangle { x, y, width, height }
            },
            Region::Ellipse { x, y, radius_x, radius_y } => {
                let (cx, cy) = self.map_point(f64::from(*x), f64::from(*y));
                let (mut rx, mut ry) = (f64::from(*radius_x) * self.scale_x, f64::from(*radius_y) * self.scale_y);
                for s in &self.steps {
                    if matches!(s.step, Step::Rotate(r) if r.swaps_axes()) {
                        std::mem::swap(&mut rx, &mut ry);
                    }
                }
                TransformedRegion::Ellipse {
                    x: cx,
                    y: cy,
                    radius_x: rx,
                    radius_y: ry,
                }
            },
            Region::Polygon { points } => TransformedRegion::Polygon { points: map_points(points) },
            Region::Polyline { points } => TransformedRegion::Polyline { points: map_points(points) },
            Region::ReferencedMask { x, y, width, height, .. } | Region::InlineMask { x, y, width, height, .. } => {
                let (x, y, width, height) = self.map_box(*x, *y, *width, *height);
                TransformedRegion::Mask { x, y, width, height }
            },
        }
    }
}

#[cfg(test)]
fn sample_item() -> RegionItem {
    let mut regions = TryVec::new();
    regions.push(Region::Point { x: -3, y: 7 }).unwrap();
    regions.push(Region::Rectangle { x: 10, y: 20, width: 30, height: 40 }).unwrap();
    regions.push(Region::Ellipse { x: 50, y: 50, radius_x: 8, radius_y: 4 }).unwrap();
    regions.push(Region::Polygon { points: vec![(0, 0), (5, 0), (5, 5)].into() }).unwrap();
    regions.push(Region::ReferencedMask { x: 1, y: 2, width: 3, height: 4, mask_item: 77 }).unwrap();
    regions.push(Region::InlineMask { x: 0, y: 0, width: 3, height: 3, data: vec![0b1010_1010, 0b1000_0000].into() }).unwrap();
    regions.push(Region::Polyline { points: vec![(1, 1), (2, 2)].into() }).unwrap();
    RegionItem {
        item_id: 9,
        reference_width: 640,
        reference_height: 480,
        regions,
    }
}

#[test]
fn region_item_roundtrip() {
    let item = sample_item();
    let (bytes, masks) = item.to_bytes().unwrap();
    assert_eq!(masks, [77]);
    assert_eq!(bytes[1], 0, "small values use 16-bit fields");
    assert_eq!(RegionItem::parse(9, &bytes, &masks).unwrap(), item);

    let err = RegionItem::parse(9, &bytes, &[]).unwrap_err();
    assert_eq!(err.subcode(), SubCode::InvalidRegionData);
    assert!(RegionItem::parse(9, &bytes[..bytes.len() - 3], &masks).is_err());
}

#[test]
fn wide_fields_when_needed() {
    let mut regions = TryVec::new();
    regions.push(Region::Point { x: 100_000, y: -100_000 }).unwrap();
    let item = RegionItem {
        item_id: 1,
        reference_width: 10,
        reference_height: 10,
        regions,
    };
    let (bytes, _) = item.to_bytes().unwrap();
    assert_eq!(bytes[1], 1);
    assert_eq!(RegionItem::parse(1, &bytes, &[]).unwrap(), item);
}

#[test]
fn map_through_rotation_and_crop() {
    use crate::transform::{CleanAperture, MirrorAxis};
    let clap = CleanAperture::from_margins(100, 50, 10, 0, 0, 0).unwrap();
    let transforms = [Transform::CleanAperture(clap), Transform::Rotate(Rotation::Deg90), Transform::Mirror(MirrorAxis::Horizontal)];
    // reference space is twice the image size
    let mapper = CoordinateMapper::new(200, 100, 100, 50, &transforms).unwrap();

    // (40, 20) -> image (20, 10) -> crop (10, 10) -> rot90 in 90x50: (10, 80) -> mirror in 50x90: (40, 80)
    assert_eq!(mapper.map_point(40.0, 20.0), (40.0, 80.0));
    assert_eq!(mapper.unmap_point(40.0, 80.0), (40.0, 20.0));

    let rect = mapper.map_region(&Region::Rectangle { x: 40, y: 20, width: 20, height: 10 });
    assert_eq!(
        rect,
        TransformedRegion::Rectangle {
            x: 35.0,
            y: 70.0,
            width: 5.0,
            height: 10.0
        }
    );

    let ellipse = mapper.map_region(&Region::Ellipse { x: 40, y: 20, radius_x: 8, radius_y: 2 });
    assert_eq!(
        ellipse,
        TransformedRegion::Ellipse {
            x: 40.0,
            y: 80.0,
            radius_x: 1.0,
            radius_y: 4.0
        }
    );
}
