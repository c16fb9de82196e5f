// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoded pixel storage and the geometric operations on it.

use crate::property::NclxProfile;
use crate::transform::{CropMargins, MirrorAxis, Rotation};
use crate::{Error, Result, SubCode, ToUsize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colorspace {
    YCbCr,
    Rgb,
    Monochrome,
    Undefined,
}

/// Chroma layout of the planes of an [`Image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chroma {
    Monochrome,
    C420,
    C422,
    C444,
    /// 8-bit R, G, B in one plane.
    InterleavedRgb,
    /// 8-bit R, G, B, A in one plane.
    InterleavedRgba,
    InterleavedRrggbbBe,
    InterleavedRrggbbLe,
    InterleavedRrggbbaaBe,
    InterleavedRrggbbaaLe,
    Undefined,
}

impl Chroma {
    /// Horizontal and vertical subsampling shifts of the chroma planes.
    #[must_use]
    pub fn subsampling(self) -> (u32, u32) {
        match self {
            Self::C420 => (1, 1),
            Self::C422 => (1, 0),
            _ => (0, 0),
        }
    }

    /// Number of components per pixel for interleaved layouts, `None` for planar ones.
    #[must_use]
    pub fn interleaved_components(self) -> Option<u8> {
        match self {
            Self::InterleavedRgb | Self::InterleavedRrggbbBe | Self::InterleavedRrggbbLe => Some(3),
            Self::InterleavedRgba | Self::InterleavedRrggbbaaBe | Self::InterleavedRrggbbaaLe => Some(4),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_interleaved(self) -> bool {
        self.interleaved_components().is_some()
    }

    pub(crate) fn is_big_endian(self) -> bool {
        matches!(self, Self::InterleavedRrggbbBe | Self::InterleavedRrggbbaaBe)
    }

    pub(crate) fn has_alpha(self) -> bool {
        matches!(self, Self::InterleavedRgba | Self::InterleavedRrggbbaaBe | Self::InterleavedRrggbbaaLe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Y,
    Cb,
    Cr,
    R,
    G,
    B,
    Alpha,
    Interleaved,
}

impl Channel {
    pub(crate) fn is_chroma(self) -> bool {
        matches!(self, Self::Cb | Self::Cr)
    }
}

/// One plane of samples.
///
/// Samples deeper than 8 bits take two bytes. Planar samples are little-endian;
/// interleaved 16-bit planes use the byte order of their [`Chroma`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    /// Components per pixel: 1 for planar, 3 or 4 for interleaved.
    pub components: u8,
    /// Bytes per row.
    pub stride: usize,
    pub data: Vec<u8>,
    pub(crate) big_endian: bool,
}

impl Plane {
    pub(crate) fn new(width: u32, height: u32, bit_depth: u8, components: u8) -> Result<Self> {
        if bit_depth == 0 || bit_depth > 16 {
            return Err(Error::Unsupported(SubCode::UnsupportedBitDepth, "bit depth must be within 1..=16"));
        }
        let bytes_per_pixel = usize::from(components) * if bit_depth > 8 { 2 } else { 1 };
        let stride = width
            .to_usize()
            .checked_mul(bytes_per_pixel)
            .ok_or(Error::ResourceLimitExceeded("plane row too large"))?;
        let len = stride
            .checked_mul(height.to_usize())
            .ok_or(Error::ResourceLimitExceeded("plane too large"))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
        data.resize(len, 0);
        Ok(Self {
            width,
            height,
            bit_depth,
            components,
            stride,
            data,
            big_endian: false,
        })
    }

    /// A plane with the same sample format and different dimensions.
    fn like(&self, width: u32, height: u32) -> Result<Self> {
        let mut plane = Self::new(width, height, self.bit_depth, self.components)?;
        plane.big_endian = self.big_endian;
        Ok(plane)
    }

    #[must_use]
    pub fn bytes_per_sample(&self) -> usize {
        if self.bit_depth > 8 { 2 } else { 1 }
    }

    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        self.bytes_per_sample() * usize::from(self.components)
    }

    /// Bytes of row `y`.
    ///
    /// # Panics
    ///
    /// If `y` is not below `height`.
    #[must_use]
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y.to_usize() * self.stride;
        &self.data[start..start + self.stride]
    }

    /// # Panics
    ///
    /// If `y` is not below `height`.
    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y.to_usize() * self.stride;
        &mut self.data[start..start + self.stride]
    }

    /// Component `c` of the pixel at (`x`, `y`), or `None` outside the plane.
    #[must_use]
    pub fn get_sample(&self, x: u32, y: u32, c: u8) -> Option<u16> {
        (x < self.width && y < self.height && c < self.components).then(|| self.sample(x, y, c))
    }

    /// Component `c` of the pixel at (`x`, `y`).
    ///
    /// # Panics
    ///
    /// If the coordinates lie outside the plane. See [`Plane::get_sample`].
    #[must_use]
    pub fn sample(&self, x: u32, y: u32, c: u8) -> u16 {
        let bps = self.bytes_per_sample();
        let at = y.to_usize() * self.stride + x.to_usize() * self.bytes_per_pixel() + usize::from(c) * bps;
        if bps == 1 {
            u16::from(self.data[at])
        } else if self.big_endian {
            u16::from_be_bytes([self.data[at], self.data[at + 1]])
        } else {
            u16::from_le_bytes([self.data[at], self.data[at + 1]])
        }
    }

    /// Store `value` as component `c` of the pixel at (`x`, `y`).
    ///
    /// # Panics
    ///
    /// If the coordinates lie outside the plane.
    pub fn set_sample(&mut self, x: u32, y: u32, c: u8, value: u16) {
        let bps = self.bytes_per_sample();
        let at = y.to_usize() * self.stride + x.to_usize() * self.bytes_per_pixel() + usize::from(c) * bps;
        if bps == 1 {
            self.data[at] = value as u8;
        } else {
            let bytes = if self.big_endian { value.to_be_bytes() } else { value.to_le_bytes() };
            self.data[at..at + 2].copy_from_slice(&bytes);
        }
    }

    /// Copy the `width`×`height` block at (`x`, `y`) into a new plane.
    pub(crate) fn sub_plane(&self, x: u32, y: u32, width: u32, height: u32) -> Result<Self> {
        let mut out = self.like(width, height)?;
        let bpp = self.bytes_per_pixel();
        let start = x.to_usize() * bpp;
        for (dst, src) in out
            .data
            .chunks_exact_mut(out.stride)
            .zip(self.data.chunks_exact(self.stride).skip(y.to_usize()))
        {
            dst.copy_from_slice(&src[start..start + dst.len()]);
        }
        Ok(out)
    }

    /// Copy all of `src` to (`x`, `y`), clipping whatever falls outside this plane.
    pub(crate) fn paste(&mut self, src: &Self, x: u32, y: u32) {
        let bpp = self.bytes_per_pixel();
        let columns = src.width.min(self.width.saturating_sub(x)).to_usize() * bpp;
        let rows = src.height.min(self.height.saturating_sub(y)).to_usize();
        let start = x.to_usize() * bpp;
        for (dst, src_row) in self
            .data
            .chunks_exact_mut(self.stride)
            .skip(y.to_usize())
            .zip(src.data.chunks_exact(src.stride))
            .take(rows)
        {
            dst[start..start + columns].copy_from_slice(&src_row[..columns]);
        }
    }

    fn rotated(&self, rotation: Rotation) -> Result<Self> {
        let (w, h) = (self.width.to_usize(), self.height.to_usize());
        let mut out = if rotation.swaps_axes() {
            self.like(self.height, self.width)?
        } else {
            self.like(self.width, self.height)?
        };
        let bpp = self.bytes_per_pixel();
        for (y, row) in self.data.chunks_exact(self.stride).enumerate() {
            for (x, px) in row.chunks_exact(bpp).enumerate() {
                let (dx, dy) = match rotation {
                    Rotation::Deg0 => (x, y),
                    Rotation::Deg90 => (y, w - 1 - x),
                    Rotation::Deg180 => (w - 1 - x, h - 1 - y),
                    Rotation::Deg270 => (h - 1 - y, x),
                };
                let at = dy * out.stride + dx * bpp;
                out.data[at..at + bpp].copy_from_slice(px);
            }
        }
        Ok(out)
    }

    fn mirrored(mut self, axis: MirrorAxis) -> Self {
        let bpp = self.bytes_per_pixel();
        let stride = self.stride;
        match axis {
            MirrorAxis::Vertical => {
                let half = self.data.len() / stride / 2 * stride;
                let (top, rest) = self.data.split_at_mut(half);
                let bottom_start = rest.len() - half;
                let bottom = &mut rest[bottom_start..];
                for (a, b) in top.chunks_exact_mut(stride).zip(bottom.chunks_exact_mut(stride).rev()) {
                    a.swap_with_slice(b);
                }
            },
            MirrorAxis::Horizontal => {
                for row in self.data.chunks_exact_mut(stride) {
                    let w = row.len() / bpp;
                    for x in 0..w / 2 {
                        let (left, right) = row.split_at_mut((w - 1 - x) * bpp);
                        left[x * bpp..(x + 1) * bpp].swap_with_slice(&mut right[..bpp]);
                    }
                }
            },
        }
        self
    }
}

/// A decoded image: a set of planes sharing one canvas size.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub colorspace: Colorspace,
    pub chroma: Chroma,
    pub(crate) planes: Vec<(Channel, Plane)>,
    /// Color channels are premultiplied by alpha.
    pub premultiplied_alpha: bool,
    pub nclx: Option<NclxProfile>,
    pub icc_profile: Option<Vec<u8>>,
    /// Non-fatal problems reported while producing this image.
    pub warnings: Vec<String>,
}

impl Image {
    #[must_use]
    pub fn new(width: u32, height: u32, colorspace: Colorspace, chroma: Chroma) -> Self {
        Self {
            width,
            height,
            colorspace,
            chroma,
            planes: Vec::new(),
            premultiplied_alpha: false,
            nclx: None,
            icc_profile: None,
            warnings: Vec::new(),
        }
    }

    /// Size of `channel`'s plane given the image's chroma subsampling.
    #[must_use]
    pub fn plane_size(&self, channel: Channel) -> (u32, u32) {
        let (sx, sy) = if channel.is_chroma() { self.chroma.subsampling() } else { (0, 0) };
        (self.width.div_ceil(1 << sx), self.height.div_ceil(1 << sy))
    }

    /// Allocate a zeroed plane for `channel`, replacing any existing one.
    pub fn add_plane(&mut self, channel: Channel, bit_depth: u8) -> Result<&mut Plane> {
        let (w, h) = self.plane_size(channel);
        let components = if channel == Channel::Interleaved {
            self.chroma
                .interleaved_components()
                .ok_or(Error::Usage(SubCode::InvalidParameterValue, "interleaved plane on a planar chroma"))?
        } else {
            1
        };
        let mut plane = Plane::new(w, h, bit_depth, components)?;
        plane.big_endian = self.chroma.is_big_endian();
        self.insert_plane(channel, plane)
    }

    pub(crate) fn insert_plane(&mut self, channel: Channel, plane: Plane) -> Result<&mut Plane> {
        self.planes.retain(|(c, _)| *c != channel);
        self.planes.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        self.planes.push((channel, plane));
        let last = self.planes.len() - 1;
        Ok(&mut self.planes[last].1)
    }

    #[must_use]
    pub fn plane(&self, channel: Channel) -> Option<&Plane> {
        self.planes.iter().find(|(c, _)| *c == channel).map(|(_, p)| p)
    }

    pub fn plane_mut(&mut self, channel: Channel) -> Option<&mut Plane> {
        self.planes.iter_mut().find(|(c, _)| *c == channel).map(|(_, p)| p)
    }

    pub(crate) fn take_plane(&mut self, channel: Channel) -> Option<Plane> {
        let i = self.planes.iter().position(|(c, _)| *c == channel)?;
        Some(self.planes.remove(i).1)
    }

    #[must_use]
    pub fn has_channel(&self, channel: Channel) -> bool {
        self.plane(channel).is_some()
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.planes.iter().map(|(c, _)| *c)
    }

    #[must_use]
    pub fn has_alpha(&self) -> bool {
        self.has_channel(Channel::Alpha) || self.chroma.has_alpha()
    }

    /// Bit depth of `channel`, if present.
    #[must_use]
    pub fn bit_depth(&self, channel: Channel) -> Option<u8> {
        self.plane(channel).map(|p| p.bit_depth)
    }

    /// The image without its planes, for building a derived image.
    pub(crate) fn empty_like(&self, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            colorspace: self.colorspace,
            chroma: self.chroma,
            planes: Vec::new(),
            premultiplied_alpha: self.premultiplied_alpha,
            nclx: self.nclx,
            icc_profile: self.icc_profile.clone(),
            warnings: Vec::new(),
        }
    }

    fn map_planes(self, width: u32, height: u32, mut f: impl FnMut(&Self, Channel, Plane) -> Result<Plane>) -> Result<Self> {
        let mut out = self.empty_like(width, height);
        out.warnings = self.warnings.clone();
        for (channel, plane) in &self.planes {
            let plane = f(&self, *channel, plane.clone())?;
            out.insert_plane(*channel, plane)?;
        }
        Ok(out)
    }

    /// Remove `margins` from every edge. Chroma offsets round down for subsampled planes.
    pub fn crop(self, margins: CropMargins) -> Result<Self> {
        let width = self
            .width
            .checked_sub(margins.left)
            .and_then(|w| w.checked_sub(margins.right))
            .filter(|&w| w > 0)
            .ok_or(Error::Usage(SubCode::InvalidParameterValue, "crop wider than the image"))?;
        let height = self
            .height
            .checked_sub(margins.top)
            .and_then(|h| h.checked_sub(margins.bottom))
            .filter(|&h| h > 0)
            .ok_or(Error::Usage(SubCode::InvalidParameterValue, "crop taller than the image"))?;
        self.map_planes(width, height, |img, channel, plane| {
            let (sx, sy) = if channel.is_chroma() { img.chroma.subsampling() } else { (0, 0) };
            let x = margins.left >> sx;
            let y = margins.top >> sy;
            let w = width.div_ceil(1 << sx).min(plane.width - x);
            let h = height.div_ceil(1 << sy).min(plane.height - y);
            plane.sub_plane(x, y, w, h)
        })
    }

    /// Rotate counter-clockwise. 4:2:2 images are converted to 4:4:4 first for quarter turns.
    pub fn rotate_ccw(self, rotation: Rotation) -> Result<Self> {
        let image = if rotation.swaps_axes() && self.chroma == Chroma::C422 {
            crate::color::to_chroma_444(&self)?
        } else {
            self
        };
        let (w, h) = if rotation.swaps_axes() {
            (image.height, image.width)
        } else {
            (image.width, image.height)
        };
        image.map_planes(w, h, |_, _, plane| plane.rotated(rotation))
    }

    pub fn mirror(self, axis: MirrorAxis) -> Result<Self> {
        let (w, h) = (self.width, self.height);
        self.map_planes(w, h, |_, _, plane| Ok(plane.mirrored(axis)))
    }
}

#[cfg(test)]
fn numbered(width: u32, height: u32) -> Image {
    let mut image = Image::new(width, height, Colorspace::Monochrome, Chroma::Monochrome);
    let plane = image.add_plane(Channel::Y, 8).unwrap();
    for y in 0..height {
        for x in 0..width {
            plane.set_sample(x, y, 0, (y * 10 + x) as u16);
        }
    }
    image
}

#[cfg(test)]
fn rows(image: &Image) -> Vec<Vec<u8>> {
    let plane = image.plane(Channel::Y).unwrap();
    (0..plane.height).map(|y| plane.row(y).to_vec()).collect()
}

#[test]
fn rotate_quarter_turns() {
    // 0 1 2
    // 10 11 12
    let image = numbered(3, 2);
    let ccw = image.clone().rotate_ccw(Rotation::Deg90).unwrap();
    assert_eq!((ccw.width, ccw.height), (2, 3));
    assert_eq!(rows(&ccw), vec![vec![2, 12], vec![1, 11], vec![0, 10]]);

    let cw = image.clone().rotate_ccw(Rotation::Deg270).unwrap();
    assert_eq!(rows(&cw), vec![vec![10, 0], vec![11, 1], vec![12, 2]]);

    let half = image.rotate_ccw(Rotation::Deg180).unwrap();
    assert_eq!(rows(&half), vec![vec![12, 11, 10], vec![2, 1, 0]]);
}

#[test]
fn mirror_axes() {
    let image = numbered(3, 3);
    let v = image.clone().mirror(MirrorAxis::Vertical).unwrap();
    assert_eq!(rows(&v), vec![vec![20, 21, 22], vec![10, 11, 12], vec![0, 1, 2]]);
    let h = image.mirror(MirrorAxis::Horizontal).unwrap();
    assert_eq!(rows(&h), vec![vec![2, 1, 0], vec![12, 11, 10], vec![22, 21, 20]]);
}

#[test]
fn crop_subsampled_planes() {
    let mut image = Image::new(9, 7, Colorspace::YCbCr, Chroma::C420);
    image.add_plane(Channel::Y, 10).unwrap();
    let cb = image.add_plane(Channel::Cb, 10).unwrap();
    assert_eq!((cb.width, cb.height), (5, 4));
    cb.set_sample(1, 1, 0, 700);
    image.add_plane(Channel::Cr, 10).unwrap();

    let cropped = image
        .crop(CropMargins {
            left: 3,
            top: 3,
            right: 1,
            bottom: 0,
        })
        .unwrap();
    assert_eq!((cropped.width, cropped.height), (5, 4));
    let cb = cropped.plane(Channel::Cb).unwrap();
    assert_eq!((cb.width, cb.height), (3, 2));
    assert_eq!(cb.sample(0, 0, 0), 700);
}

#[test]
fn checked_sample_access() {
    let mut image = Image::new(2, 2, Colorspace::Monochrome, Chroma::Monochrome);
    let plane = image.add_plane(Channel::Y, 8).unwrap();
    plane.set_sample(1, 1, 0, 9);
    assert_eq!(plane.get_sample(1, 1, 0), Some(9));
    assert_eq!(plane.get_sample(5, 5, 0), None);
    assert_eq!(plane.get_sample(0, 2, 0), None);
    assert_eq!(plane.get_sample(0, 0, 1), None);
}

#[test]
#[should_panic]
fn unchecked_sample_panics_outside_the_plane() {
    let mut image = Image::new(2, 2, Colorspace::Monochrome, Chroma::Monochrome);
    let plane = image.add_plane(Channel::Y, 8).unwrap();
    let _ = plane.sample(5, 5, 0);
}
