// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serialization of an item graph and its payloads into a container.
//!
//! Layout: 'ftyp', then 'meta' (hdlr, pitm, iinf, iref, iprp, iloc, idat),
//! then one 'mdat' holding every payload not stored in 'idat'. Item locations
//! use fixed-width fields, so the meta box size does not depend on the offsets
//! it records and the media data offset is known after one sizing pass.

use crate::bmff::{write_box, write_full_box};
use crate::boxes::{BoxType, FourCC, item_type, reference_type};
use crate::codec::{CodecRegistry, CompressionFormat, EncodingOptions};
use crate::container::{HeifFile, ItemGraph};
use crate::grid::GridDescriptor;
use crate::image::{Channel, Chroma, Colorspace, Image};
use crate::item::{ConstructionMethod, Extent, Item, ItemLocation, write_idat, write_iinf, write_iloc, write_pitm};
use crate::iref::write_iref;
use crate::property::{AuxiliaryType, CodecConfiguration, ColorProfile, ImageSpatialExtents, ItemProperty, write_iprp};
use crate::region::RegionItem;
use crate::source::ByteSink;
use crate::{Error, Result, SubCode, TryVec};
use byteorder::{BigEndian, WriteBytesExt};
use fallible_collections::TryClone;
use log::debug;
use std::collections::BTreeMap;

const ALPHA_URN: &str = "urn:mpeg:mpegB:cicp:systems:auxiliary:alpha";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Storage {
    MediaData,
    ItemData,
}

#[derive(Debug)]
struct Payload {
    data: Vec<u8>,
    storage: Storage,
}

/// Builds a container from items, properties and references.
#[derive(Debug)]
pub struct HeifWriter {
    major_brand: FourCC,
    compatible_brands: Vec<FourCC>,
    graph: ItemGraph,
    payloads: BTreeMap<u32, Payload>,
    next_id: u32,
}

impl Default for HeifWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl HeifWriter {
    #[must_use]
    pub fn new() -> Self {
        let mif1 = FourCC::new(b"mif1");
        Self {
            major_brand: mif1,
            compatible_brands: vec![mif1],
            graph: ItemGraph::default(),
            payloads: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// A writer holding every item, property and reference of a parsed file.
    ///
    /// Item data is copied out of the source; items built from other items are
    /// stored with their resolved bytes.
    pub fn from_file(file: &HeifFile) -> Result<Self> {
        let source = file.graph();
        let mut graph = ItemGraph {
            catalog: source.catalog.clone(),
            ..ItemGraph::default()
        };
        for property in source.properties.properties() {
            graph.properties.add(property.try_clone()?)?;
        }
        for id in source.properties.associated_item_ids() {
            for a in source.properties.associations(id) {
                graph.properties.associate(id, a.property_index, a.essential)?;
            }
        }
        for r in source.references.references() {
            graph.references.add(r.reference_type, r.from, &r.to)?;
        }

        let mut payloads = BTreeMap::new();
        for id in source.catalog.item_ids() {
            let Some(location) = file.location(id) else { continue };
            let storage = if location.construction_method == ConstructionMethod::Idat {
                Storage::ItemData
            } else {
                Storage::MediaData
            };
            let data = file.item_data(id)?.to_vec();
            payloads.insert(id, Payload { data, storage });
        }

        let next_id = source.catalog.item_ids().max().map_or(Ok(1), |id| {
            id.checked_add(1)
                .ok_or(Error::Encoding(SubCode::Unspecified, "item ids exhausted"))
        })?;
        Ok(Self {
            major_brand: file.file_type().major_brand,
            compatible_brands: file.file_type().compatible_brands.clone(),
            graph,
            payloads,
            next_id,
        })
    }

    pub fn set_brands(&mut self, major_brand: FourCC, compatible_brands: &[FourCC]) {
        self.major_brand = major_brand;
        self.compatible_brands = compatible_brands.to_vec();
    }

    fn add_compatible_brand(&mut self, brand: FourCC) {
        if !self.compatible_brands.contains(&brand) {
            self.compatible_brands.push(brand);
        }
    }

    pub fn graph(&self) -> &ItemGraph {
        &self.graph
    }

    fn allocate_id(&mut self) -> Result<u32> {
        let id = self.next_id;
        self.next_id = id
            .checked_add(1)
            .ok_or(Error::Encoding(SubCode::Unspecified, "item ids exhausted"))?;
        Ok(id)
    }

    fn insert_item(&mut self, item_type: FourCC, data: &[u8], storage: Storage) -> Result<u32> {
        let id = self.allocate_id()?;
        self.graph.catalog.items.insert(id, Item::new(id, item_type));
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(data.len()).map_err(|_| Error::OutOfMemory)?;
        bytes.extend_from_slice(data);
        self.payloads.insert(id, Payload { data: bytes, storage });
        debug!("item {id} '{item_type}': {} bytes", data.len());
        Ok(id)
    }

    /// Add an item whose payload goes into the media data box.
    ///
    /// The first image item added becomes the primary item unless one is set.
    pub fn add_item(&mut self, item_type: FourCC, data: &[u8]) -> Result<u32> {
        let id = self.insert_item(item_type, data, Storage::MediaData)?;
        self.claim_primary(id);
        Ok(id)
    }

    /// Add an item whose payload is stored inside the meta box.
    pub fn add_idat_item(&mut self, item_type: FourCC, data: &[u8]) -> Result<u32> {
        let id = self.insert_item(item_type, data, Storage::ItemData)?;
        self.claim_primary(id);
        Ok(id)
    }

    fn claim_primary(&mut self, id: u32) {
        if !self.graph.catalog.contains(self.graph.catalog.primary_item) && self.graph.is_image(id) {
            self.graph.catalog.primary_item = id;
        }
    }

    /// Change name, hidden flag or MIME fields of an item.
    pub fn item_mut(&mut self, id: u32) -> Result<&mut Item> {
        self.graph
            .catalog
            .items
            .get_mut(&id)
            .ok_or(Error::Usage(SubCode::NonexistingItemReferenced, "item does not exist"))
    }

    pub fn set_primary(&mut self, id: u32) -> Result<()> {
        self.graph.catalog.require(id)?;
        self.graph.catalog.primary_item = id;
        Ok(())
    }

    /// Append a property to the container and return its 1-based index.
    pub fn add_property(&mut self, property: ItemProperty) -> Result<u16> {
        self.graph.properties.add(property)
    }

    /// Append `property_index` to the item's ordered association list.
    pub fn associate(&mut self, item_id: u32, property_index: u16, essential: bool) -> Result<()> {
        self.graph.catalog.require(item_id)?;
        if self.graph.properties.property(property_index).is_none() {
            return Err(Error::Usage(SubCode::IpmaReferencesNonexistingProperty, "property index out of range"));
        }
        self.graph.properties.associate(item_id, property_index, essential)
    }

    /// Add a property and associate it with one item.
    pub fn add_item_property(&mut self, item_id: u32, property: ItemProperty, essential: bool) -> Result<u16> {
        self.graph.catalog.require(item_id)?;
        let index = self.add_property(property)?;
        self.graph.properties.associate(item_id, index, essential)?;
        Ok(index)
    }

    /// Add a reference box: `from` refers to each of `to`, in order.
    pub fn add_reference(&mut self, reference_type: FourCC, from: u32, to: &[u32]) -> Result<()> {
        self.graph.catalog.require(from)?;
        for &id in to {
            self.graph.catalog.require(id)?;
        }
        self.graph.references.add(reference_type, from, to)
    }

    /// Add a grid image assembled from `tiles` in row-major order. The tiles are hidden.
    pub fn add_grid(&mut self, descriptor: GridDescriptor, tiles: &[u32]) -> Result<u32> {
        if u32::try_from(tiles.len()).ok() != Some(descriptor.tile_count()) {
            return Err(Error::Usage(SubCode::InvalidParameterValue, "tile count does not match the grid size"));
        }
        for &tile in tiles {
            self.graph.catalog.require(tile)?;
        }
        let id = self.insert_item(item_type::GRID, &descriptor.to_bytes()?, Storage::ItemData)?;
        self.add_reference(reference_type::DERIVED_IMAGE, id, tiles)?;
        let ispe = ImageSpatialExtents {
            width: descriptor.output_width,
            height: descriptor.output_height,
        };
        self.add_item_property(id, ItemProperty::ImageSpatialExtents(ispe), false)?;
        for &tile in tiles {
            self.item_mut(tile)?.hidden = true;
        }
        let primary = self.graph.catalog.primary_item;
        if !self.graph.catalog.contains(primary) || tiles.contains(&primary) {
            self.graph.catalog.primary_item = id;
        }
        Ok(id)
    }

    /// Add a region annotation item describing `image`.
    pub fn add_region_item(&mut self, image: u32, regions: &RegionItem) -> Result<u32> {
        self.graph.catalog.require(image)?;
        let (data, masks) = regions.to_bytes()?;
        let id = self.insert_item(item_type::REGION, &data, Storage::MediaData)?;
        self.add_reference(reference_type::CONTENT_DESCRIBES, id, &[image])?;
        if !masks.is_empty() {
            self.add_reference(reference_type::MASK, id, &masks)?;
        }
        Ok(id)
    }

    /// Add a metadata item (Exif, XMP, ...) describing `image`.
    pub fn add_metadata_item(&mut self, image: u32, item_type: FourCC, data: &[u8], content_type: Option<&str>) -> Result<u32> {
        self.graph.catalog.require(image)?;
        let id = self.insert_item(item_type, data, Storage::MediaData)?;
        self.item_mut(id)?.content_type = content_type.map(str::to_owned);
        self.add_reference(reference_type::CONTENT_DESCRIBES, id, &[image])?;
        Ok(id)
    }

    /// Encode `image` with the best encoder for `format` and add it as an item.
    ///
    /// An alpha plane is encoded separately as a hidden auxiliary image.
    pub fn encode_image(&mut self, registry: &CodecRegistry, image: &Image, format: CompressionFormat, options: &EncodingOptions) -> Result<u32> {
        let mut color = image.clone();
        let alpha = color.take_plane(Channel::Alpha);

        let id = self.encode_item(registry, &color, format, options)?;
        if let Some(nclx) = image.nclx {
            self.add_item_property(id, ItemProperty::ColorProfile(ColorProfile::Nclx(nclx)), false)?;
        }
        if let Some(icc) = &image.icc_profile {
            let profile = ColorProfile::Icc {
                profile_type: FourCC::new(b"prof"),
                data: TryVec::from(icc.clone()),
            };
            self.add_item_property(id, ItemProperty::ColorProfile(profile), false)?;
        }

        if let Some(plane) = alpha {
            let mut alpha_image = Image::new(image.width, image.height, Colorspace::Monochrome, Chroma::Monochrome);
            alpha_image.insert_plane(Channel::Y, plane)?;
            let alpha_options = EncodingOptions {
                chroma: Chroma::Monochrome,
                ..options.clone()
            };
            let alpha_id = self.encode_item(registry, &alpha_image, format, &alpha_options)?;
            self.item_mut(alpha_id)?.hidden = true;
            let aux = AuxiliaryType {
                aux_type: ALPHA_URN.to_owned(),
                subtype: TryVec::new(),
            };
            self.add_item_property(alpha_id, ItemProperty::AuxiliaryType(aux), true)?;
            self.add_reference(reference_type::AUXILIARY, alpha_id, &[id])?;
            if image.premultiplied_alpha {
                self.add_reference(reference_type::PREMULTIPLIED, id, &[alpha_id])?;
            }
        }
        self.claim_primary(id);
        Ok(id)
    }

    fn encode_item(&mut self, registry: &CodecRegistry, image: &Image, format: CompressionFormat, options: &EncodingOptions) -> Result<u32> {
        let encoder = registry
            .encoder_for(format)
            .ok_or(Error::Unsupported(SubCode::UnsupportedCodec, "no encoder registered for the format"))?;
        let encoded = encoder
            .encode(image, format, options)
            .map_err(|e| Error::from_encoder(encoder.name(), e))?;

        let id = self.insert_item(format.item_type(), &encoded.data, Storage::MediaData)?;
        let ispe = ImageSpatialExtents {
            width: image.width,
            height: image.height,
        };
        self.add_item_property(id, ItemProperty::ImageSpatialExtents(ispe), false)?;
        if let (Some(config), Some(box_type)) = (encoded.config, format.config_box()) {
            let config = CodecConfiguration {
                box_type,
                data: TryVec::from(config),
            };
            self.add_item_property(id, ItemProperty::CodecConfiguration(config), true)?;
        }
        match format {
            CompressionFormat::Hevc => self.add_compatible_brand(FourCC::new(b"heic")),
            CompressionFormat::Av1 => self.add_compatible_brand(FourCC::new(b"avif")),
            _ => {},
        }
        Ok(id)
    }

    fn validate(&self) -> Result<()> {
        if !self.graph.catalog.contains(self.graph.catalog.primary_item) {
            return Err(Error::Usage(SubCode::NoOrInvalidPrimaryItem, "no primary item set"));
        }
        self.graph.properties.validate(&self.graph.catalog)?;
        self.graph.references.validate(&self.graph.catalog)
    }

    /// Serialize the container into `sink`.
    pub fn write(&self, sink: &mut dyn ByteSink) -> Result<()> {
        let bytes = self.to_bytes()?;
        sink.write(&bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;

        let mut out = Vec::new();
        write_box(&mut out, BoxType::FileTypeBox.into(), |b| {
            b.write_u32::<BigEndian>(self.major_brand.into())?;
            b.write_u32::<BigEndian>(0)?;
            for &brand in &self.compatible_brands {
                b.write_u32::<BigEndian>(brand.into())?;
            }
            Ok(())
        })?;

        // offsets relative to the start of idat and of the mdat payload
        let mut idat = Vec::new();
        let mut media_len = 0u64;
        let mut placed = Vec::new();
        placed.try_reserve_exact(self.payloads.len()).map_err(|_| Error::OutOfMemory)?;
        for (&id, payload) in &self.payloads {
            let len = payload.data.len() as u64;
            let offset = match payload.storage {
                Storage::ItemData => {
                    let offset = idat.len() as u64;
                    idat.try_reserve(payload.data.len()).map_err(|_| Error::OutOfMemory)?;
                    idat.extend_from_slice(&payload.data);
                    offset
                },
                Storage::MediaData => {
                    let offset = media_len;
                    media_len += len;
                    offset
                },
            };
            placed.push((id, payload.storage, offset, len));
        }

        let sizing = self.write_meta(&placed, 0, &idat)?;
        let mdat_header = if u32::try_from(media_len + 8).is_ok() { 8 } else { 16 };
        let media_start = out.len() as u64 + sizing.len() as u64 + mdat_header;
        let meta = self.write_meta(&placed, media_start, &idat)?;
        if meta.len() != sizing.len() {
            return Err(Error::Encoding(SubCode::CannotWriteOutputData, "meta box size changed with offsets"));
        }
        out.try_reserve(meta.len()).map_err(|_| Error::OutOfMemory)?;
        out.extend_from_slice(&meta);

        if media_len > 0 {
            write_box(&mut out, BoxType::MediaDataBox.into(), |b| {
                for payload in self.payloads.values().filter(|p| p.storage == Storage::MediaData) {
                    b.extend_from_slice(&payload.data);
                }
                Ok(())
            })?;
        }
        debug!("wrote {} items, {} bytes", self.graph.catalog.items.len(), out.len());
        Ok(out)
    }

    fn write_meta(&self, placed: &[(u32, Storage, u64, u64)], media_start: u64, idat: &[u8]) -> Result<Vec<u8>> {
        let mut locations = Vec::new();
        locations.try_reserve_exact(placed.len()).map_err(|_| Error::OutOfMemory)?;
        for &(item_id, storage, offset, length) in placed {
            let (construction_method, offset) = match storage {
                Storage::ItemData => (ConstructionMethod::Idat, offset),
                Storage::MediaData => (ConstructionMethod::File, media_start + offset),
            };
            let mut extents = TryVec::new();
            // an empty payload has no extents; a zero length would mean "to the end"
            if length > 0 {
                extents.push(Extent { index: 0, offset, length })?;
            }
            locations.push(ItemLocation {
                item_id,
                construction_method,
                base_offset: 0,
                extents,
            });
        }

        let mut out = Vec::new();
        write_full_box(&mut out, BoxType::MetadataBox.into(), 0, 0, |meta| {
            write_full_box(meta, BoxType::HandlerBox.into(), 0, 0, |b| {
                b.write_u32::<BigEndian>(0)?;
                b.write_u32::<BigEndian>(FourCC::new(b"pict").into())?;
                for _ in 0..3 {
                    b.write_u32::<BigEndian>(0)?;
                }
                b.push(0);
                Ok(())
            })?;
            write_pitm(meta, self.graph.catalog.primary_item)?;
            write_iinf(meta, &self.graph.catalog)?;
            if !self.graph.references.references().is_empty() {
                write_iref(meta, &self.graph.references)?;
            }
            write_iprp(meta, &self.graph.properties)?;
            write_iloc(meta, &locations)?;
            if !idat.is_empty() {
                write_idat(meta, idat)?;
            }
            Ok(())
        })?;
        Ok(out)
    }
}

#[test]
fn payloads_land_where_iloc_says() {
    let mut writer = HeifWriter::new();
    let image = writer.add_item(item_type::HEVC, b"coded picture").unwrap();
    let exif = writer.add_metadata_item(image, item_type::EXIF, b"\0\0\0\0Exif", None).unwrap();
    let grid = GridDescriptor {
        rows: 1,
        columns: 1,
        output_width: 8,
        output_height: 8,
    };
    let grid_id = writer.add_grid(grid, &[image]).unwrap();
    let bytes = writer.to_bytes().unwrap();

    let file = HeifFile::from_bytes(bytes).unwrap();
    assert_eq!(file.primary_item(), grid_id);
    assert_eq!(file.item_data(image).unwrap(), b"coded picture".as_ref());
    assert_eq!(file.item_data(exif).unwrap(), b"\0\0\0\0Exif".as_ref());
    assert_eq!(file.location(grid_id).unwrap().construction_method, ConstructionMethod::Idat);
    assert_eq!(GridDescriptor::parse(&file.item_data(grid_id).unwrap()).unwrap(), grid);
    assert!(file.graph().catalog.get(image).unwrap().hidden);
}

#[test]
fn grid_needs_one_tile_per_cell() {
    let mut writer = HeifWriter::new();
    let tile = writer.add_item(item_type::HEVC, b"x").unwrap();
    let grid = GridDescriptor {
        rows: 2,
        columns: 1,
        output_width: 8,
        output_height: 8,
    };
    let err = writer.add_grid(grid, &[tile]).unwrap_err();
    assert_eq!(err.subcode(), SubCode::InvalidParameterValue);
}

#[test]
fn cyclic_references_are_not_written() {
    let mut writer = HeifWriter::new();
    let a = writer.add_item(item_type::IDENTITY, b"").unwrap();
    let b = writer.add_item(item_type::IDENTITY, b"").unwrap();
    writer.add_reference(reference_type::DERIVED_IMAGE, a, &[b]).unwrap();
    writer.add_reference(reference_type::DERIVED_IMAGE, b, &[a]).unwrap();
    assert_eq!(writer.to_bytes().unwrap_err().subcode(), SubCode::ItemReferenceCycle);
}

#[test]
fn writing_requires_a_primary_item() {
    let mut writer = HeifWriter::new();
    writer.add_item(item_type::EXIF, b"exif").unwrap();
    assert_eq!(writer.to_bytes().unwrap_err().subcode(), SubCode::NoOrInvalidPrimaryItem);
}
