// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Item identity ('iinf'/'infe'), location ('iloc') and the primary item ('pitm').

use crate::bmff::{BMFFBox, ResourceTracker, be_u16, be_u32, check_parser_state, read_c_string, read_fullbox_extra, read_fullbox_version_no_flags, skip_box_remain, write_box, write_full_box};
use crate::boxes::{BoxType, FourCC, item_type};
use crate::{Error, Result, SubCode, ToUsize, TryVec};
use bitreader::BitReader;
use byteorder::{BigEndian, WriteBytesExt};
use log::debug;
use std::collections::BTreeMap;
use std::io::Read;

/// An item as described by its 'infe' entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: u32,
    pub item_type: FourCC,
    pub name: std::string::String,
    /// Hidden items are not meant to be shown on their own.
    pub hidden: bool,
    /// MIME type of a `mime` item.
    pub content_type: Option<std::string::String>,
    /// Transfer encoding of a `mime` item, such as `deflate`.
    pub content_encoding: Option<std::string::String>,
    /// URI describing the payload of a `uri ` item.
    pub uri_type: Option<std::string::String>,
}

impl Item {
    pub fn new(id: u32, item_type: FourCC) -> Self {
        Self {
            id,
            item_type,
            name: std::string::String::new(),
            hidden: false,
            content_type: None,
            content_encoding: None,
            uri_type: None,
        }
    }
}

/// All items of a container, keyed by id, and the primary item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemCatalog {
    pub(crate) primary_item: u32,
    pub(crate) items: BTreeMap<u32, Item>,
}

impl ItemCatalog {
    /// Build the catalog from parsed 'infe' entries.
    ///
    /// Fails on duplicate ids and on a primary item that has no entry.
    pub(crate) fn new(entries: TryVec<Item>, primary_item: u32) -> Result<Self> {
        let mut items = BTreeMap::new();
        for item in entries {
            let id = item.id;
            if items.insert(id, item).is_some() {
                return Err(Error::InvalidData(SubCode::Unspecified, "duplicate item id in iinf"));
            }
        }
        if !items.contains_key(&primary_item) {
            return Err(Error::InvalidData(SubCode::NoOrInvalidPrimaryItem, "primary item not present in iinf box"));
        }
        Ok(Self { primary_item, items })
    }

    #[must_use]
    pub fn primary_item(&self) -> u32 {
        self.primary_item
    }

    pub fn get(&self, id: u32) -> Option<&Item> {
        self.items.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.items.contains_key(&id)
    }

    pub fn item_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.items.keys().copied()
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> + '_ {
        self.items.values()
    }

    pub(crate) fn require(&self, id: u32) -> Result<&Item> {
        self.get(id)
            .ok_or(Error::Usage(SubCode::NonexistingItemReferenced, "item does not exist"))
    }
}

/// Where an extent's offset points.
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructionMethod {
    /// Absolute file offset, normally into a media data box.
    File,
    /// Offset into the 'idat' box of the meta box.
    Idat,
    /// Offset into the data of another item, named through the 'iloc' reference list.
    Item,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// 1-based position in the item's 'iloc' reference list; only used by [`ConstructionMethod::Item`].
    pub index: u64,
    pub offset: u64,
    /// Zero means "to the end of the source".
    pub length: u64,
}

#[derive(Debug, PartialEq)]
pub struct ItemLocation {
    pub item_id: u32,
    pub construction_method: ConstructionMethod,
    pub base_offset: u64,
    pub extents: TryVec<Extent>,
}

#[derive(Debug, Clone, Copy)]
enum IlocFieldSize {
    Zero,
    Four,
    Eight,
}

impl IlocFieldSize {
    const fn to_bits(self) -> u8 {
        match self {
            Self::Zero => 0,
            Self::Four => 32,
            Self::Eight => 64,
        }
    }
}

impl TryFrom<u8> for IlocFieldSize {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            _ => Err(Error::InvalidData(SubCode::Unspecified, "value must be in the set {0, 4, 8}")),
        }
    }
}

#[derive(PartialEq, Clone, Copy)]
enum IlocVersion {
    Zero,
    One,
    Two,
}

impl TryFrom<u8> for IlocVersion {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            _ => Err(Error::Unsupported(SubCode::UnsupportedDataVersion, "unsupported version in 'iloc' box")),
        }
    }
}

/// Parse a Primary Item Box
/// See ISO 14496-12:2015 § 8.11.4
pub(crate) fn read_pitm<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &ResourceTracker<'_>) -> Result<u32> {
    let version = read_fullbox_version_no_flags(src, tracker)?;

    let item_id = match version {
        0 => be_u16(src)?.into(),
        1 => be_u32(src)?,
        _ => return Err(Error::Unsupported(SubCode::UnsupportedDataVersion, "unsupported pitm version")),
    };

    Ok(item_id)
}

/// Parse an Item Information Box
/// See ISO 14496-12:2015 § 8.11.6
pub(crate) fn read_iinf<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &ResourceTracker<'_>) -> Result<TryVec<Item>> {
    let version = read_fullbox_version_no_flags(src, tracker)?;

    let entry_count = match version {
        0 => be_u16(src)?.into(),
        1 => be_u32(src)?,
        _ => return Err(Error::Unsupported(SubCode::UnsupportedDataVersion, "unsupported iinf version")),
    };
    tracker.validate_items(entry_count)?;
    let mut item_infos = TryVec::with_capacity(entry_count.to_usize())?;

    let mut iter = src.box_iter(tracker);
    while let Some(mut b) = iter.next_box()? {
        if b.head.name != BoxType::ItemInfoEntry {
            return Err(Error::InvalidData(SubCode::NoInfeBox, "iinf box should contain only infe boxes"));
        }

        item_infos.push(read_infe(&mut b)?)?;

        check_parser_state(&b.head, &b.content)?;
    }

    if item_infos.len() != entry_count.to_usize() {
        debug!("iinf declares {entry_count} entries, found {}", item_infos.len());
    }

    Ok(item_infos)
}

/// Parse an Item Info Entry
/// See ISO 14496-12:2015 § 8.11.6.2
fn read_infe<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<Item> {
    let (version, flags) = read_fullbox_extra(src)?;

    // mif1 brand (see ISO 23008-12:2017 § 10.2.1) only requires v2 and 3
    let id = match version {
        2 => be_u16(src)?.into(),
        3 => be_u32(src)?,
        _ => return Err(Error::Unsupported(SubCode::UnsupportedDataVersion, "unsupported version in 'infe' box")),
    };

    let item_protection_index = be_u16(src)?;

    if item_protection_index != 0 {
        return Err(Error::Unsupported(SubCode::Unspecified, "protected items (infe.item_protection_index != 0) are not supported"));
    }

    let mut item = Item::new(id, FourCC::from(be_u32(src)?));
    item.hidden = flags & 1 != 0;
    item.name = read_c_string(src)?;
    if item.item_type == item_type::MIME {
        item.content_type = Some(read_c_string(src)?);
        if src.bytes_left() > 0 {
            item.content_encoding = Some(read_c_string(src)?);
        }
    } else if item.item_type == item_type::URI {
        item.uri_type = Some(read_c_string(src)?);
    }
    debug!("infe item_id {id} item_type: {}", item.item_type);

    skip_box_remain(src)?;

    Ok(item)
}

/// Parse an item location box inside a meta box
/// See ISO 14496-12:2015 § 8.11.3
pub(crate) fn read_iloc<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &ResourceTracker<'_>) -> Result<TryVec<ItemLocation>> {
    let version: IlocVersion = read_fullbox_version_no_flags(src, tracker)?.try_into()?;

    let iloc = src.read_into_try_vec(tracker)?;
    let mut iloc = BitReader::new(&iloc);

    let offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let length_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let base_offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;

    let index_size: Option<IlocFieldSize> = match version {
        IlocVersion::One | IlocVersion::Two => Some(iloc.read_u8(4)?.try_into()?),
        IlocVersion::Zero => {
            let _reserved = iloc.read_u8(4)?;
            None
        },
    };

    let item_count = match version {
        IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
        IlocVersion::Two => iloc.read_u32(32)?,
    };
    tracker.validate_items(item_count)?;

    let mut items = TryVec::with_capacity(item_count.to_usize())?;

    for _ in 0..item_count {
        let item_id = match version {
            IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
            IlocVersion::Two => iloc.read_u32(32)?,
        };

        // Version 0 has no construction_method field and is interpreted as using file offsets.
        let construction_method = match version {
            IlocVersion::Zero => ConstructionMethod::File,
            IlocVersion::One | IlocVersion::Two => {
                let _reserved = iloc.read_u16(12)?;
                match iloc.read_u16(4)? {
                    0 => ConstructionMethod::File,
                    1 => ConstructionMethod::Idat,
                    2 => ConstructionMethod::Item,
                    _ => return Err(Error::Unsupported(SubCode::UnsupportedItemConstructionMethod, "construction_method is taken from the set 0, 1 or 2 per ISO 14496-12:2015 § 8.11.3.3")),
                }
            },
        };

        let data_reference_index = iloc.read_u16(16)?;

        if data_reference_index != 0 {
            return Err(Error::Unsupported(SubCode::Unspecified, "external file references (iloc.data_reference_index != 0) are not supported"));
        }

        let base_offset = iloc.read_u64(base_offset_size.to_bits())?;
        let extent_count = iloc.read_u16(16)?;

        if extent_count < 1 {
            return Err(Error::InvalidData(SubCode::Unspecified, "extent_count must have a value 1 or greater per ISO 14496-12:2015 § 8.11.3.3"));
        }

        tracker.validate_extents(extent_count)?;
        let mut extents = TryVec::with_capacity(extent_count.to_usize())?;

        for _ in 0..extent_count {
            let index = match &index_size {
                None | Some(IlocFieldSize::Zero) => 0,
                Some(index_size) => iloc.read_u64(index_size.to_bits())?,
            };

            // An absent offset field means offset 0; an absent or zero length means "to the end"
            let offset = iloc.read_u64(offset_size.to_bits())?;
            let length = iloc.read_u64(length_size.to_bits())?;

            extents.push(Extent { index, offset, length })?;
        }

        items.push(ItemLocation {
            item_id,
            construction_method,
            base_offset,
            extents,
        })?;
    }

    if iloc.remaining() == 0 {
        Ok(items)
    } else {
        Err(Error::InvalidData(SubCode::Unspecified, "invalid iloc size"))
    }
}

pub(crate) fn write_pitm(out: &mut std::vec::Vec<u8>, primary_item: u32) -> Result<()> {
    match u16::try_from(primary_item) {
        Ok(id) => write_full_box(out, BoxType::PrimaryItemBox.into(), 0, 0, |b| Ok(b.write_u16::<BigEndian>(id)?)),
        Err(_) => write_full_box(out, BoxType::PrimaryItemBox.into(), 1, 0, |b| Ok(b.write_u32::<BigEndian>(primary_item)?)),
    }
}

pub(crate) fn write_iinf(out: &mut std::vec::Vec<u8>, catalog: &ItemCatalog) -> Result<()> {
    let count = catalog.items.len();
    let version = if count > usize::from(u16::MAX) { 1 } else { 0 };
    write_full_box(out, BoxType::ItemInfoBox.into(), version, 0, |b| {
        if version == 0 {
            b.write_u16::<BigEndian>(u16::try_from(count)?)?;
        } else {
            b.write_u32::<BigEndian>(u32::try_from(count)?)?;
        }
        for item in catalog.items.values() {
            write_infe(b, item)?;
        }
        Ok(())
    })
}

fn write_infe(out: &mut std::vec::Vec<u8>, item: &Item) -> Result<()> {
    let short_id = u16::try_from(item.id).ok();
    let version = if short_id.is_some() { 2 } else { 3 };
    write_full_box(out, BoxType::ItemInfoEntry.into(), version, u32::from(item.hidden), |b| {
        match short_id {
            Some(id) => b.write_u16::<BigEndian>(id)?,
            None => b.write_u32::<BigEndian>(item.id)?,
        }
        b.write_u16::<BigEndian>(0)?;
        b.write_u32::<BigEndian>(item.item_type.into())?;
        write_c_string(b, &item.name);
        if let Some(content_type) = &item.content_type {
            write_c_string(b, content_type);
            if let Some(encoding) = &item.content_encoding {
                write_c_string(b, encoding);
            }
        }
        if let Some(uri_type) = &item.uri_type {
            write_c_string(b, uri_type);
        }
        Ok(())
    })
}

fn write_c_string(out: &mut std::vec::Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

/// Serialize the item locations as an 'iloc' box.
///
/// Always uses 8-byte offsets and lengths; version 2 only when ids need 32 bits.
pub(crate) fn write_iloc(out: &mut std::vec::Vec<u8>, locations: &[ItemLocation]) -> Result<()> {
    let wide_ids = locations.iter().any(|l| l.item_id > u32::from(u16::MAX));
    let version = if wide_ids { 2 } else { 1 };
    write_full_box(out, BoxType::ItemLocationBox.into(), version, 0, |b| {
        // offset_size, length_size, base_offset_size, index_size
        b.write_u8(0x88)?;
        b.write_u8(0x88)?;
        if wide_ids {
            b.write_u32::<BigEndian>(u32::try_from(locations.len())?)?;
        } else {
            b.write_u16::<BigEndian>(u16::try_from(locations.len())?)?;
        }
        for location in locations {
            if wide_ids {
                b.write_u32::<BigEndian>(location.item_id)?;
            } else {
                b.write_u16::<BigEndian>(u16::try_from(location.item_id)?)?;
            }
            let method: u16 = match location.construction_method {
                ConstructionMethod::File => 0,
                ConstructionMethod::Idat => 1,
                ConstructionMethod::Item => 2,
            };
            b.write_u16::<BigEndian>(method)?;
            b.write_u16::<BigEndian>(0)?;
            b.write_u64::<BigEndian>(location.base_offset)?;
            b.write_u16::<BigEndian>(u16::try_from(location.extents.len())?)?;
            for extent in location.extents.iter() {
                b.write_u64::<BigEndian>(extent.index)?;
                b.write_u64::<BigEndian>(extent.offset)?;
                b.write_u64::<BigEndian>(extent.length)?;
            }
        }
        Ok(())
    })
}

pub(crate) fn write_idat(out: &mut std::vec::Vec<u8>, data: &[u8]) -> Result<()> {
    write_box(out, BoxType::ItemDataBox.into(), |b| {
        b.extend_from_slice(data);
        Ok(())
    })
}

#[cfg(test)]
fn parse_box<R>(bytes: &[u8], parse: impl FnOnce(&mut BMFFBox<'_, &[u8]>, &ResourceTracker<'_>) -> Result<R>) -> Result<R> {
    let config = crate::DecodeConfig::default();
    let tracker = ResourceTracker::new(&config);
    let mut cursor = bytes;
    let head = crate::bmff::read_box_header(&mut cursor)?;
    let mut b = BMFFBox {
        head,
        content: <_ as Read>::take(&mut cursor, head.size - head.offset),
    };
    parse(&mut b, &tracker)
}

#[test]
fn iinf_roundtrip() {
    let mut hidden = Item::new(2, item_type::HEVC);
    hidden.hidden = true;
    hidden.name = "tile".into();
    let mut xmp = Item::new(70_000, item_type::MIME);
    xmp.content_type = Some("application/rdf+xml".into());
    let catalog = ItemCatalog::new(vec![Item::new(1, item_type::GRID), hidden, xmp].into(), 1).unwrap();

    let mut out = std::vec::Vec::new();
    write_iinf(&mut out, &catalog).unwrap();
    let parsed = parse_box(&out, |b, t| read_iinf(b, t)).unwrap();
    let reparsed = ItemCatalog::new(parsed, 1).unwrap();
    assert_eq!(reparsed, catalog);
    assert!(reparsed.get(2).unwrap().hidden);
    assert_eq!(reparsed.get(70_000).unwrap().content_type.as_deref(), Some("application/rdf+xml"));
}

#[test]
fn missing_primary_item() {
    let err = ItemCatalog::new(vec![Item::new(1, item_type::HEVC)].into(), 9).unwrap_err();
    assert_eq!(err.subcode(), SubCode::NoOrInvalidPrimaryItem);
}

#[cfg(test)]
fn location(item_id: u32, construction_method: ConstructionMethod, base_offset: u64, extent: Extent) -> ItemLocation {
    let mut extents = TryVec::new();
    extents.push(extent).unwrap();
    ItemLocation { item_id, construction_method, base_offset, extents }
}

#[test]
fn iloc_construction_methods() {
    let by_item = || location(5, ConstructionMethod::Item, 0, Extent { index: 1, offset: 4, length: 10 });
    let in_idat = || location(6, ConstructionMethod::Idat, 3, Extent { index: 0, offset: 0, length: 0 });
    let mut out = std::vec::Vec::new();
    write_iloc(&mut out, &[by_item(), in_idat()]).unwrap();
    let parsed = parse_box(&out, |b, t| read_iloc(b, t)).unwrap();
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0], by_item());
    assert_eq!(parsed[1], in_idat());
}

#[test]
fn iloc_version0_short_fields() {
    // version 0, offset_size 4, length_size 4, base_offset_size 0, one item with one extent
    let bytes = [
        0, 0, 0, 30, b'i', b'l', b'o', b'c', 0, 0, 0, 0, //
        0x44, 0x00, 0, 1, //
        0, 1, 0, 0, 0, 1, //
        0, 0, 0, 100, 0, 0, 0, 20,
    ];
    let parsed = parse_box(&bytes, |b, t| read_iloc(b, t)).unwrap();
    assert_eq!(parsed[0].construction_method, ConstructionMethod::File);
    assert_eq!(parsed[0].extents[0], Extent { index: 0, offset: 100, length: 20 });
}

#[test]
fn iloc_extent_count_is_limited() {
    let mut many = location(7, ConstructionMethod::File, 0, Extent { index: 0, offset: 0, length: 1 });
    for offset in 1..40 {
        many.extents.push(Extent { index: 0, offset, length: 1 }).unwrap();
    }
    let mut out = std::vec::Vec::new();
    write_iloc(&mut out, &[many]).unwrap();
    let err = parse_box(&out, |b, t| read_iloc(b, t)).unwrap_err();
    assert!(matches!(err, crate::Error::ResourceLimitExceeded(_)), "{err:?}");
}
