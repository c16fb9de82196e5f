// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Top-level box walk and the parsed container.

use crate::bmff::{BMFFBox, BoxHeader, ResourceTracker, be_u32, check_parser_state, read_box_header, read_fullbox_version_no_flags, skip_box_content, skip_box_remain};
use crate::boxes::{BoxType, FourCC, item_type, reference_type};
use crate::codec::CompressionFormat;
use crate::item::{ConstructionMethod, ItemCatalog, ItemLocation, read_iinf, read_iloc, read_pitm};
use crate::iref::{ReferenceGraph, read_iref};
use crate::property::{PropertyStore, read_iprp};
use crate::source::{ByteSource, GrowStatus, MemorySource, SourceReader, probe_len, read_range};
use crate::{DecodeConfig, Error, Result, SubCode, TryVec};
use enough::{Stop, Unstoppable};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{Mutex, PoisonError};

/// Brands from the 'ftyp' box.
/// See ISO 14496-12:2015 § 4.3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileType {
    pub major_brand: FourCC,
    pub minor_version: u32,
    pub compatible_brands: Vec<FourCC>,
}

impl FileType {
    #[must_use]
    pub fn has_brand(&self, brand: FourCC) -> bool {
        self.major_brand == brand || self.compatible_brands.contains(&brand)
    }
}

/// Items, their properties and the references between them.
#[derive(Debug, PartialEq, Default)]
pub struct ItemGraph {
    pub catalog: ItemCatalog,
    pub properties: PropertyStore,
    pub references: ReferenceGraph,
}

impl ItemGraph {
    /// Whether the item holds pixels, either coded or derived.
    #[must_use]
    pub fn is_image(&self, id: u32) -> bool {
        self.catalog.get(id).is_some_and(|item| {
            CompressionFormat::from_item_type(item.item_type).is_some()
                || matches!(item.item_type, item_type::GRID | item_type::IDENTITY | item_type::OVERLAY)
        })
    }

    /// Images meant to be shown on their own: not hidden, and not a thumbnail,
    /// auxiliary image or input of a derived image. The primary item comes first.
    pub fn top_level_images(&self) -> Vec<u32> {
        let is_top_level = |id: u32| {
            self.is_image(id)
                && self.catalog.get(id).is_some_and(|item| !item.hidden)
                && !self.references.has_references(id, reference_type::THUMBNAIL)
                && !self.references.has_references(id, reference_type::AUXILIARY)
                && self.references.references_to(id, reference_type::DERIVED_IMAGE).next().is_none()
        };
        let primary = self.catalog.primary_item();
        let mut ids: Vec<u32> = self.catalog.item_ids().filter(|&id| id != primary && is_top_level(id)).collect();
        if self.is_image(primary) {
            ids.insert(0, primary);
        }
        ids
    }

    pub fn thumbnails(&self, image: u32) -> Vec<u32> {
        self.references.references_to(image, reference_type::THUMBNAIL).collect()
    }

    pub fn auxiliary_images(&self, image: u32) -> Vec<u32> {
        self.references.references_to(image, reference_type::AUXILIARY).collect()
    }

    /// Auxiliary image that carries the alpha plane of `image`.
    pub fn alpha_image(&self, image: u32) -> Result<Option<u32>> {
        for aux in self.references.references_to(image, reference_type::AUXILIARY) {
            if self.properties.auxiliary_type(aux)?.is_some_and(|t| t.is_alpha()) {
                return Ok(Some(aux));
            }
        }
        Ok(None)
    }

    /// Metadata items (Exif, XMP, ...) describing `image`. Region items are listed separately.
    pub fn metadata_items(&self, image: u32) -> Vec<u32> {
        self.describing(image).filter(|&id| !self.is_item_type(id, item_type::REGION)).collect()
    }

    pub fn region_items(&self, image: u32) -> Vec<u32> {
        self.describing(image).filter(|&id| self.is_item_type(id, item_type::REGION)).collect()
    }

    fn describing(&self, image: u32) -> impl Iterator<Item = u32> + '_ {
        self.references.references_to(image, reference_type::CONTENT_DESCRIBES)
    }

    fn is_item_type(&self, id: u32, t: FourCC) -> bool {
        self.catalog.get(id).is_some_and(|item| item.item_type == t)
    }
}

/// A media data box: where file-offset extents point.
#[derive(Debug, Clone, Copy)]
struct MediaData {
    offset: u64,
    /// `None` when the box runs to the end of the file.
    length: Option<u64>,
}

/// A parsed container. Item data stays in the byte source until it is asked for.
pub struct HeifFile {
    file_type: FileType,
    graph: ItemGraph,
    locations: BTreeMap<u32, ItemLocation>,
    idat: Option<TryVec<u8>>,
    media_data: TryVec<MediaData>,
    source: Mutex<Box<dyn ByteSource>>,
    config: DecodeConfig,
}

impl std::fmt::Debug for HeifFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeifFile")
            .field("file_type", &self.file_type)
            .field("graph", &self.graph)
            .field("locations", &self.locations)
            .finish_non_exhaustive()
    }
}

/// Everything the meta box contributes.
struct Meta {
    graph: ItemGraph,
    locations: TryVec<ItemLocation>,
    idat: Option<TryVec<u8>>,
}

const MAX_CONSTRUCTION_DEPTH: u32 = 8;

impl HeifFile {
    /// Parse a complete in-memory container with default limits.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Result<Self> {
        Self::parse(Box::new(MemorySource::new(data)), &DecodeConfig::default(), &Unstoppable)
    }

    /// Parse the box structure of `source`.
    ///
    /// Only 'ftyp' and 'meta' are read; media data boxes are skipped. If the source
    /// is still growing, the scan ends at the first box that has not arrived yet.
    pub fn parse(mut source: Box<dyn ByteSource>, config: &DecodeConfig, stop: &dyn Stop) -> Result<Self> {
        let tracker = ResourceTracker::new(config);
        let mut reader = SourceReader::new(source.as_mut());

        let mut file_type = None;
        let mut meta = None;
        let mut media_data = TryVec::new();

        loop {
            stop.check()?;
            let start = reader.position();
            match reader.wait_for_size(start + 1) {
                GrowStatus::SizeReached => {},
                GrowStatus::SizeBeyondEof => break,
                GrowStatus::Timeout => {
                    debug!("source not grown past {start}, stopping box scan");
                    break;
                },
            }
            let head = read_box_header(&mut reader)?;
            let end = if head.runs_to_end() { None } else { start.checked_add(head.size) };

            // 'ftyp' box must occur first; see ISO 14496-12:2015 § 4.3.1
            if file_type.is_none() && head.name != BoxType::FileTypeBox {
                return Err(Error::InvalidData(SubCode::NoFtypBox, "'ftyp' box must occur first"));
            }

            match head.name {
                BoxType::FileTypeBox | BoxType::MetadataBox => {
                    let content_len = match end {
                        Some(end) => {
                            match reader.wait_for_size(end) {
                                GrowStatus::SizeReached => {},
                                GrowStatus::SizeBeyondEof => return Err(Error::UnexpectedEOF),
                                GrowStatus::Timeout => {
                                    debug!("'{:?}' box not complete yet", head.name);
                                    break;
                                },
                            }
                            head.size - head.offset
                        },
                        // size 0: the box runs to the end of the source
                        None => {
                            let content_start = start + head.offset;
                            reader.probe_len(content_start)? - content_start
                        },
                    };
                    let mut b = BMFFBox {
                        head,
                        content: (&mut reader).take(content_len),
                    };
                    if head.name == BoxType::FileTypeBox {
                        if file_type.is_some() {
                            return Err(Error::InvalidData(SubCode::Unspecified, "there should be exactly one ftyp box"));
                        }
                        file_type = Some(read_ftyp(&mut b)?);
                    } else {
                        if meta.is_some() {
                            return Err(Error::InvalidData(SubCode::Unspecified, "There should be zero or one meta boxes per ISO 14496-12:2015 § 8.11.1.1"));
                        }
                        meta = Some(read_meta(&mut b, &tracker)?);
                    }
                    check_parser_state(&b.head, &b.content)?;
                },
                _ => {
                    if head.name == BoxType::MediaDataBox {
                        media_data.push(MediaData {
                            offset: start + head.offset,
                            length: end.map(|_| head.size - head.offset),
                        })?;
                    } else {
                        debug!("skipping top-level {:?} box", head.name);
                    }
                    let Some(end) = end else { break };
                    match reader.wait_for_size(end) {
                        GrowStatus::SizeReached => reader.seek(end)?,
                        GrowStatus::SizeBeyondEof => return Err(Error::UnexpectedEOF),
                        GrowStatus::Timeout => break,
                    }
                },
            }
            if end.is_none() {
                break;
            }
        }

        let file_type = file_type.ok_or(Error::InvalidData(SubCode::NoFtypBox, "missing ftyp box"))?;
        let meta = meta.ok_or(Error::InvalidData(SubCode::NoMetaBox, "missing meta box"))?;

        let mut locations = BTreeMap::new();
        for location in meta.locations {
            if !meta.graph.catalog.contains(location.item_id) {
                return Err(Error::InvalidData(SubCode::NonexistingItemReferenced, "iloc entry for a nonexistent item"));
            }
            if locations.insert(location.item_id, location).is_some() {
                return Err(Error::InvalidData(SubCode::Unspecified, "duplicate item id in iloc"));
            }
        }

        Ok(Self {
            file_type,
            graph: meta.graph,
            locations,
            idat: meta.idat,
            media_data,
            source: Mutex::new(source),
            config: config.clone(),
        })
    }

    pub fn file_type(&self) -> &FileType {
        &self.file_type
    }

    pub fn graph(&self) -> &ItemGraph {
        &self.graph
    }

    #[must_use]
    pub fn primary_item(&self) -> u32 {
        self.graph.catalog.primary_item()
    }

    pub fn location(&self, id: u32) -> Option<&ItemLocation> {
        self.locations.get(&id)
    }

    pub fn config(&self) -> &DecodeConfig {
        &self.config
    }

    pub(crate) fn idat(&self) -> Option<&[u8]> {
        self.idat.as_deref()
    }

    /// All extents of an item, concatenated. Waits on the byte source for each range.
    pub fn item_data(&self, id: u32) -> Result<TryVec<u8>> {
        self.graph.catalog.require(id)?;
        self.location_data(id, 0)
    }

    fn location_data(&self, id: u32, depth: u32) -> Result<TryVec<u8>> {
        if depth > MAX_CONSTRUCTION_DEPTH {
            return Err(Error::InvalidData(SubCode::Unspecified, "item construction chain too deep"));
        }
        let location = self
            .locations
            .get(&id)
            .ok_or(Error::InvalidData(SubCode::NoItemData, "item has no location"))?;

        let mut total = 0u64;
        let mut out = TryVec::new();
        for extent in location.extents.iter() {
            let offset = location
                .base_offset
                .checked_add(extent.offset)
                .ok_or(Error::InvalidData(SubCode::Unspecified, "extent offset overflow"))?;
            let data = match location.construction_method {
                ConstructionMethod::File => self.file_extent(offset, extent.length)?,
                ConstructionMethod::Idat => {
                    let idat = self
                        .idat
                        .as_deref()
                        .ok_or(Error::InvalidData(SubCode::NoIdatBox, "idat box missing but construction_method is Idat"))?;
                    slice_extent(idat, offset, extent.length)?
                },
                ConstructionMethod::Item => {
                    let index = usize::try_from(extent.index.max(1))?;
                    let source_item = self
                        .graph
                        .references
                        .references_from(id, reference_type::ITEM_LOCATION)
                        .nth(index - 1)
                        .ok_or(Error::InvalidData(SubCode::NonexistingItemReferenced, "construction method 2 extent index without 'iloc' reference"))?;
                    let data = self.location_data(source_item, depth + 1)?;
                    slice_extent(&data, offset, extent.length)?
                },
            };
            total = total.saturating_add(data.len() as u64);
            if self.config.peak_memory_limit.is_some_and(|limit| total > limit) {
                return Err(Error::ResourceLimitExceeded("item data exceeds peak memory limit"));
            }
            out.extend_from_slice(&data)?;
        }
        Ok(out)
    }

    fn file_extent(&self, offset: u64, length: u64) -> Result<TryVec<u8>> {
        let mut source = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        let length = if length != 0 {
            length
        } else {
            // to the end of the media data box holding the extent
            let mdat = self
                .media_data
                .iter()
                .find(|m| offset >= m.offset && m.length.is_none_or(|len| offset < m.offset + len))
                .ok_or(Error::InvalidData(SubCode::NoItemData, "extent is not in a media data box"))?;
            let end = match mdat.length {
                Some(len) => mdat.offset + len,
                None => probe_len(&mut **source, offset)?,
            };
            end - offset
        };
        if self.config.peak_memory_limit.is_some_and(|limit| length > limit) {
            return Err(Error::ResourceLimitExceeded("item data exceeds peak memory limit"));
        }
        read_range(&mut **source, offset, length)
    }
}

fn slice_extent(data: &[u8], offset: u64, length: u64) -> Result<TryVec<u8>> {
    let start = usize::try_from(offset)?;
    let slice = if length == 0 {
        data.get(start..)
    } else {
        let end = start
            .checked_add(usize::try_from(length)?)
            .ok_or(Error::InvalidData(SubCode::Unspecified, "extent end overflow"))?;
        data.get(start..end)
    };
    let slice = slice.ok_or(Error::InvalidData(SubCode::EndOfData, "extent exceeds the data it points into"))?;
    let mut out = TryVec::with_capacity(slice.len())?;
    out.extend_from_slice(slice)?;
    Ok(out)
}

fn read_ftyp<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<FileType> {
    let major = be_u32(src)?;
    let minor = be_u32(src)?;
    let bytes_left = src.bytes_left();
    if bytes_left % 4 != 0 {
        return Err(Error::InvalidData(SubCode::InvalidBoxSize, "invalid ftyp size"));
    }
    let brand_count = usize::try_from(bytes_left / 4)?;
    let mut brands = Vec::new();
    brands.try_reserve_exact(brand_count).map_err(|_| Error::OutOfMemory)?;
    for _ in 0..brand_count {
        brands.push(be_u32(src)?.into());
    }
    Ok(FileType {
        major_brand: major.into(),
        minor_version: minor,
        compatible_brands: brands,
    })
}

/// The handler type; only 'pict' marks an image collection.
fn read_hdlr<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &ResourceTracker<'_>) -> Result<FourCC> {
    let _version = read_fullbox_version_no_flags(src, tracker)?;
    let _pre_defined = be_u32(src)?;
    let handler_type = FourCC::from(be_u32(src)?);
    // reserved and the name are of no interest
    skip_box_remain(src)?;
    Ok(handler_type)
}

/// See ISO 14496-12:2015 § 8.11.1
fn read_meta<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &ResourceTracker<'_>) -> Result<Meta> {
    let version = read_fullbox_version_no_flags(src, tracker)?;
    if version != 0 {
        return Err(Error::Unsupported(SubCode::UnsupportedDataVersion, "unsupported meta version"));
    }

    let mut handler = None;
    let mut primary_item = None;
    let mut items = None;
    let mut locations = None;
    let mut references = None;
    let mut properties = None;
    let mut idat = None;

    let mut iter = src.box_iter(tracker);
    while let Some(mut b) = iter.next_box()? {
        let head: BoxHeader = *b.get_header();
        let duplicate = match head.name {
            BoxType::HandlerBox => handler.replace(read_hdlr(&mut b, tracker)?).is_some(),
            BoxType::PrimaryItemBox => primary_item.replace(read_pitm(&mut b, tracker)?).is_some(),
            BoxType::ItemInfoBox => items.replace(read_iinf(&mut b, tracker)?).is_some(),
            BoxType::ItemLocationBox => locations.replace(read_iloc(&mut b, tracker)?).is_some(),
            BoxType::ItemReferenceBox => references.replace(read_iref(&mut b, tracker)?).is_some(),
            BoxType::ItemPropertiesBox => properties.replace(read_iprp(&mut b, tracker)?).is_some(),
            BoxType::ItemDataBox => idat.replace(b.read_into_try_vec(tracker)?).is_some(),
            _ => {
                debug!("skipping {:?} in meta", head.name);
                skip_box_content(&mut b)?;
                false
            },
        };
        if duplicate {
            warn!("duplicate {:?} box in meta", head.name);
            return Err(Error::InvalidData(SubCode::Unspecified, "duplicate box in meta"));
        }
        check_parser_state(&b.head, &b.content)?;
    }

    let handler = handler.ok_or(Error::InvalidData(SubCode::NoHdlrBox, "meta box without hdlr"))?;
    if handler != FourCC::new(b"pict") {
        warn!("handler type {handler}");
        return Err(Error::InvalidData(SubCode::NoPictHandler, "meta handler is not 'pict'"));
    }
    let primary_item = primary_item.ok_or(Error::InvalidData(SubCode::NoPitmBox, "Required pitm box not present in meta box"))?;
    let items = items.ok_or(Error::InvalidData(SubCode::NoIinfBox, "iinf missing"))?;
    let locations = locations.ok_or(Error::InvalidData(SubCode::NoIlocBox, "iloc missing"))?;
    let properties = properties.ok_or(Error::InvalidData(SubCode::NoIprpBox, "iprp missing"))?;
    let references = references.unwrap_or_default();

    let catalog = ItemCatalog::new(items, primary_item)?;
    properties.validate(&catalog)?;
    references.validate(&catalog)?;

    Ok(Meta {
        graph: ItemGraph {
            catalog,
            properties,
            references,
        },
        locations,
        idat,
    })
}
