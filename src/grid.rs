// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Grid derived images: a canvas assembled from equally sized tile items.
//! See ISO/IEC 23008-12:2017 § 6.6.2.3

use crate::boxes::reference_type;
use crate::image::Image;
use crate::iref::ReferenceGraph;
use crate::{DecodeConfig, Error, Result, SubCode, TryVec};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

/// The payload of a `grid` item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridDescriptor {
    pub rows: u16,
    pub columns: u16,
    pub output_width: u32,
    pub output_height: u32,
}

impl GridDescriptor {
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        let truncated = |_| Error::InvalidData(SubCode::InvalidGridData, "grid descriptor too short");
        let version = data.read_u8().map_err(truncated)?;
        if version != 0 {
            return Err(Error::Unsupported(SubCode::UnsupportedDataVersion, "grid version"));
        }
        let flags = data.read_u8().map_err(truncated)?;
        let rows = u16::from(data.read_u8().map_err(truncated)?) + 1;
        let columns = u16::from(data.read_u8().map_err(truncated)?) + 1;
        let (output_width, output_height) = if flags & 1 == 1 {
            (
                data.read_u32::<BigEndian>().map_err(truncated)?,
                data.read_u32::<BigEndian>().map_err(truncated)?,
            )
        } else {
            (
                data.read_u16::<BigEndian>().map_err(truncated)?.into(),
                data.read_u16::<BigEndian>().map_err(truncated)?.into(),
            )
        };
        Ok(Self {
            rows,
            columns,
            output_width,
            output_height,
        })
    }

    pub fn to_bytes(&self) -> Result<std::vec::Vec<u8>> {
        let field = |n: u16| -> Result<u8> {
            n.checked_sub(1)
                .and_then(|n| u8::try_from(n).ok())
                .ok_or(Error::Usage(SubCode::InvalidParameterValue, "grid rows and columns must be within 1..=256"))
        };
        let wide = self.output_width > u32::from(u16::MAX) || self.output_height > u32::from(u16::MAX);
        let mut out = std::vec::Vec::with_capacity(12);
        out.write_u8(0)?;
        out.write_u8(u8::from(wide))?;
        out.write_u8(field(self.rows)?)?;
        out.write_u8(field(self.columns)?)?;
        if wide {
            out.write_u32::<BigEndian>(self.output_width)?;
            out.write_u32::<BigEndian>(self.output_height)?;
        } else {
            out.write_u16::<BigEndian>(u16::try_from(self.output_width)?)?;
            out.write_u16::<BigEndian>(u16::try_from(self.output_height)?)?;
        }
        Ok(out)
    }

    #[must_use]
    pub fn tile_count(&self) -> u32 {
        u32::from(self.rows) * u32::from(self.columns)
    }
}

/// A grid item with its tiles resolved, in row-major order.
#[derive(Debug, PartialEq)]
pub struct GridPlan {
    pub item_id: u32,
    pub descriptor: GridDescriptor,
    pub tiles: TryVec<u32>,
}

impl GridPlan {
    pub(crate) fn resolve(graph: &ReferenceGraph, item_id: u32, descriptor: GridDescriptor, config: &DecodeConfig) -> Result<Self> {
        config.validate_grid_tiles(descriptor.tile_count())?;
        config.validate_dimensions(descriptor.output_width, descriptor.output_height)?;

        let mut tiles = TryVec::new();
        for tile in graph.references_from(item_id, reference_type::DERIVED_IMAGE) {
            tiles.push(tile)?;
        }
        if tiles.len() != descriptor.tile_count() as usize {
            debug!(
                "grid {item_id}: {}x{} needs {} tiles, found {}",
                descriptor.columns,
                descriptor.rows,
                descriptor.tile_count(),
                tiles.len()
            );
            return Err(Error::InvalidData(SubCode::MissingGridImages, "grid tile count does not match its references"));
        }
        Ok(Self {
            item_id,
            descriptor,
            tiles,
        })
    }

    /// Row and column of tile `index`.
    #[must_use]
    pub fn cell(&self, index: usize) -> (u32, u32) {
        let columns = usize::from(self.descriptor.columns);
        ((index / columns) as u32, (index % columns) as u32)
    }
}

/// Place decoded tiles on the output canvas.
///
/// The first tile sets the nominal tile size; tiles overhanging the right or bottom edge are clipped.
pub(crate) fn compose(plan: &GridPlan, tiles: &[Image]) -> Result<Image> {
    let d = &plan.descriptor;
    let first = tiles.first().ok_or(Error::InvalidData(SubCode::MissingGridImages, "grid without tiles"))?;
    let (tile_w, tile_h) = (first.width, first.height);
    if u64::from(tile_w) * u64::from(d.columns) < u64::from(d.output_width) || u64::from(tile_h) * u64::from(d.rows) < u64::from(d.output_height) {
        return Err(Error::InvalidData(SubCode::InvalidGridData, "grid tiles do not cover the output size"));
    }

    for tile in &tiles[1..] {
        if tile.colorspace != first.colorspace || tile.chroma != first.chroma {
            return Err(Error::InvalidData(SubCode::WrongTileImageChromaFormat, "grid tiles differ in chroma format"));
        }
        if tile.channels().count() != first.channels().count() || first.channels().any(|c| tile.bit_depth(c) != first.bit_depth(c)) {
            return Err(Error::InvalidData(SubCode::WrongTileImagePixelDepth, "grid tiles differ in bit depth"));
        }
    }

    let mut out = first.empty_like(d.output_width, d.output_height);
    for channel in first.channels().collect::<std::vec::Vec<_>>() {
        let depth = first.bit_depth(channel).unwrap_or(8);
        out.add_plane(channel, depth)?;
    }
    for (index, tile) in tiles.iter().enumerate() {
        let (row, column) = plan.cell(index);
        for channel in tile.channels() {
            let (sx, sy) = if channel.is_chroma() { tile.chroma.subsampling() } else { (0, 0) };
            let x = (column * tile_w) >> sx;
            let y = (row * tile_h) >> sy;
            if let (Some(src), Some(dst)) = (tile.plane(channel), out.plane_mut(channel)) {
                dst.paste(src, x, y);
            }
        }
        out.warnings.extend(tile.warnings.iter().cloned());
    }
    Ok(out)
}

#[cfg(test)]
fn plan(columns: u16, rows: u16, output_width: u32, output_height: u32) -> GridPlan {
    let descriptor = GridDescriptor {
        rows,
        columns,
        output_width,
        output_height,
    };
    let tiles: std::vec::Vec<u32> = (0..descriptor.tile_count()).map(|i| i + 10).collect();
    GridPlan {
        item_id: 1,
        descriptor,
        tiles: tiles.into(),
    }
}

#[cfg(test)]
fn tile(index: u32, size: u32, depth: u8) -> Image {
    use crate::image::{Channel, Chroma, Colorspace};
    let mut image = Image::new(size, size, Colorspace::Monochrome, Chroma::Monochrome);
    let plane = image.add_plane(Channel::Y, depth).unwrap();
    for y in 0..size {
        for x in 0..size {
            plane.set_sample(x, y, 0, ((index * 37 + x * 3 + y * 5) % 256) as u16);
        }
    }
    image
}

#[test]
fn descriptor_forms() {
    let small = GridDescriptor::parse(&[0, 0, 1, 2, 0, 180, 0, 100]).unwrap();
    assert_eq!(
        small,
        GridDescriptor {
            rows: 2,
            columns: 3,
            output_width: 180,
            output_height: 100
        }
    );
    assert_eq!(small.to_bytes().unwrap(), [0, 0, 1, 2, 0, 180, 0, 100]);

    let wide = GridDescriptor {
        output_width: 70_000,
        ..small
    };
    assert_eq!(GridDescriptor::parse(&wide.to_bytes().unwrap()).unwrap(), wide);
    assert!(matches!(GridDescriptor::parse(&[0, 0, 1]), Err(Error::InvalidData(SubCode::InvalidGridData, _))));
    assert!(matches!(GridDescriptor::parse(&[1, 0, 0, 0, 0, 1, 0, 1]), Err(Error::Unsupported(..))));
}

#[test]
fn compose_clips_edge_tiles() {
    let tiles: std::vec::Vec<_> = (0..6).map(|i| tile(i, 64, 8)).collect();
    let image = compose(&plan(3, 2, 180, 100), &tiles).unwrap();
    assert_eq!((image.width, image.height), (180, 100));
    let y = image.plane(crate::image::Channel::Y).unwrap();
    // (130, 70) lies in tile 5 at local (2, 6)
    assert_eq!(y.sample(130, 70, 0), ((5 * 37 + 2 * 3 + 6 * 5) % 256) as u16);
    // seam between tiles 0 and 1
    assert_eq!(y.sample(63, 0, 0), ((63 * 3) % 256) as u16);
    assert_eq!(y.sample(64, 0, 0), 37);
}

#[test]
fn compose_rejects_mismatched_tiles() {
    let err = compose(&plan(2, 1, 100, 50), &[tile(0, 64, 8), tile(1, 64, 10)]).unwrap_err();
    assert_eq!(err.subcode(), SubCode::WrongTileImagePixelDepth);

    let err = compose(&plan(2, 1, 200, 50), &[tile(0, 64, 8), tile(1, 64, 8)]).unwrap_err();
    assert_eq!(err.subcode(), SubCode::InvalidGridData);
}
