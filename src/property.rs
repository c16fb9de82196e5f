// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Item properties ('ipco') and their ordered per-item associations ('ipma').

use crate::bmff::{BMFFBox, ResourceTracker, be_i32, be_u16, be_u32, check_parser_state, read_c_string, read_fullbox_extra, read_fullbox_version_no_flags, skip, write_box, write_full_box};
use crate::boxes::{BoxType, FourCC};
use crate::item::ItemCatalog;
use crate::transform::{CleanAperture, Fraction, MirrorAxis, Rotation, Transform};
use crate::{Error, Result, SubCode, TryVec};
use arrayvec::ArrayVec;
use bitreader::BitReader;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use fallible_collections::{TryClone, TryReserveError};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::io::Read;

/// Image spatial extents (dimensions)
/// See ISO/IEC 23008-12:2017 § 6.5.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSpatialExtents {
    pub width: u32,
    pub height: u32,
}

/// See ISO 14496-12:2015 § 12.1.4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelAspectRatio {
    pub h_spacing: u32,
    pub v_spacing: u32,
}

/// User description property 'udes'.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserDescription {
    pub lang: std::string::String,
    pub name: std::string::String,
    pub description: std::string::String,
    pub tags: std::string::String,
}

/// Auxiliary type property 'auxC': a URN naming the kind of auxiliary image.
#[derive(Debug, PartialEq)]
pub struct AuxiliaryType {
    pub aux_type: std::string::String,
    pub subtype: TryVec<u8>,
}

impl AuxiliaryType {
    /// Whether this marks an alpha plane.
    #[must_use]
    pub fn is_alpha(&self) -> bool {
        self.aux_type == "urn:mpeg:mpegB:cicp:systems:auxiliary:alpha" || self.aux_type == "urn:mpeg:hevc:2015:auxid:1"
    }
}

/// Color description with code points from ITU-T H.273.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NclxProfile {
    pub color_primaries: u16,
    pub transfer_characteristics: u16,
    pub matrix_coefficients: u16,
    pub full_range: bool,
}

impl Default for NclxProfile {
    /// sRGB primaries and transfer with BT.601 matrix and full range.
    fn default() -> Self {
        Self {
            color_primaries: 1,
            transfer_characteristics: 13,
            matrix_coefficients: 6,
            full_range: true,
        }
    }
}

/// CIE 1931 xy coordinates of the primaries and white point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Chromaticities {
    pub red: (f32, f32),
    pub green: (f32, f32),
    pub blue: (f32, f32),
    pub white: (f32, f32),
}

impl NclxProfile {
    /// Chromaticities of `color_primaries`. Unknown or unspecified codes give BT.709.
    #[must_use]
    pub fn chromaticities(&self) -> Chromaticities {
        const D65: (f32, f32) = (0.3127, 0.3290);
        const ILLUMINANT_C: (f32, f32) = (0.310, 0.316);
        let (red, green, blue, white) = match self.color_primaries {
            4 => ((0.67, 0.33), (0.21, 0.71), (0.14, 0.08), ILLUMINANT_C),
            5 => ((0.64, 0.33), (0.29, 0.60), (0.15, 0.06), D65),
            6 | 7 => ((0.630, 0.340), (0.310, 0.595), (0.155, 0.070), D65),
            8 => ((0.681, 0.319), (0.243, 0.692), (0.145, 0.049), ILLUMINANT_C),
            9 => ((0.708, 0.292), (0.170, 0.797), (0.131, 0.046), D65),
            10 => ((1.0, 0.0), (0.0, 1.0), (0.0, 0.0), (1.0 / 3.0, 1.0 / 3.0)),
            11 => ((0.680, 0.320), (0.265, 0.690), (0.150, 0.060), (0.314, 0.351)),
            12 => ((0.680, 0.320), (0.265, 0.690), (0.150, 0.060), D65),
            22 => ((0.630, 0.340), (0.295, 0.605), (0.155, 0.077), D65),
            _ => ((0.64, 0.33), (0.30, 0.60), (0.15, 0.06), D65),
        };
        Chromaticities { red, green, blue, white }
    }
}

/// Color information property 'colr'.
#[derive(Debug, PartialEq)]
pub enum ColorProfile {
    Nclx(NclxProfile),
    /// `rICC` (restricted) or `prof` (unrestricted) ICC profile bytes.
    Icc { profile_type: FourCC, data: TryVec<u8> },
}

/// Decoder configuration record ('hvcC', 'av1C', ...) kept as raw bytes for the codec.
#[derive(Debug, PartialEq)]
pub struct CodecConfiguration {
    pub box_type: FourCC,
    pub data: TryVec<u8>,
}

#[derive(Debug, PartialEq)]
pub enum ItemProperty {
    ImageSpatialExtents(ImageSpatialExtents),
    Rotation(Rotation),
    Mirror(MirrorAxis),
    CleanAperture(CleanAperture),
    ColorProfile(ColorProfile),
    Channels(ArrayVec<u8, 16>),
    AuxiliaryType(AuxiliaryType),
    UserDescription(UserDescription),
    PixelAspectRatio(PixelAspectRatio),
    CodecConfiguration(CodecConfiguration),
    /// A property box this crate does not interpret. The payload is kept for re-serialization.
    Unknown { box_type: FourCC, data: TryVec<u8> },
}

impl ItemProperty {
    #[must_use]
    pub fn box_type(&self) -> FourCC {
        let t = match self {
            Self::ImageSpatialExtents(_) => BoxType::ImageSpatialExtentsBox,
            Self::Rotation(_) => BoxType::ImageRotationBox,
            Self::Mirror(_) => BoxType::ImageMirrorBox,
            Self::CleanAperture(_) => BoxType::CleanApertureBox,
            Self::ColorProfile(_) => BoxType::ColorInformationBox,
            Self::Channels(_) => BoxType::PixelInformationBox,
            Self::AuxiliaryType(_) => BoxType::AuxiliaryTypeProperty,
            Self::UserDescription(_) => BoxType::UserDescriptionBox,
            Self::PixelAspectRatio(_) => BoxType::PixelAspectRatioBox,
            Self::CodecConfiguration(c) => return c.box_type,
            Self::Unknown { box_type, .. } => return *box_type,
        };
        t.into()
    }

    /// The geometric transform this property describes, if it is one.
    #[must_use]
    pub fn as_transform(&self) -> Option<Transform> {
        match self {
            Self::Rotation(r) => Some(Transform::Rotate(*r)),
            Self::Mirror(axis) => Some(Transform::Mirror(*axis)),
            Self::CleanAperture(clap) => Some(Transform::CleanAperture(*clap)),
            _ => None,
        }
    }
}

impl TryClone for ItemProperty {
    fn try_clone(&self) -> Result<Self, TryReserveError> {
        Ok(match self {
            Self::ImageSpatialExtents(val) => Self::ImageSpatialExtents(*val),
            Self::Rotation(val) => Self::Rotation(*val),
            Self::Mirror(val) => Self::Mirror(*val),
            Self::CleanAperture(val) => Self::CleanAperture(*val),
            Self::ColorProfile(ColorProfile::Nclx(nclx)) => Self::ColorProfile(ColorProfile::Nclx(*nclx)),
            Self::ColorProfile(ColorProfile::Icc { profile_type, data }) => Self::ColorProfile(ColorProfile::Icc {
                profile_type: *profile_type,
                data: data.try_clone()?,
            }),
            Self::Channels(val) => Self::Channels(val.clone()),
            Self::AuxiliaryType(val) => Self::AuxiliaryType(AuxiliaryType {
                aux_type: val.aux_type.clone(),
                subtype: val.subtype.try_clone()?,
            }),
            Self::UserDescription(val) => Self::UserDescription(val.clone()),
            Self::PixelAspectRatio(val) => Self::PixelAspectRatio(*val),
            Self::CodecConfiguration(val) => Self::CodecConfiguration(CodecConfiguration {
                box_type: val.box_type,
                data: val.data.try_clone()?,
            }),
            Self::Unknown { box_type, data } => Self::Unknown {
                box_type: *box_type,
                data: data.try_clone()?,
            },
        })
    }
}

/// One entry of an item's ordered property list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Association {
    /// 1-based index into the property container.
    pub property_index: u16,
    /// An essential property must be understood to process the item.
    pub essential: bool,
}

/// Property definitions and the ordered associations of items to them.
#[derive(Debug, PartialEq, Default)]
pub struct PropertyStore {
    pub(crate) properties: TryVec<ItemProperty>,
    pub(crate) associations: BTreeMap<u32, TryVec<Association>>,
}

impl PropertyStore {
    pub fn properties(&self) -> &[ItemProperty] {
        &self.properties
    }

    /// Property by its 1-based index.
    pub fn property(&self, index: u16) -> Option<&ItemProperty> {
        usize::from(index).checked_sub(1).and_then(|i| self.properties.get(i))
    }

    /// The ordered associations of an item; empty if it has none.
    pub fn associations(&self, item_id: u32) -> &[Association] {
        self.associations.get(&item_id).map_or(&[], |a| &a[..])
    }

    pub(crate) fn associated_item_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.associations.keys().copied()
    }

    /// Check that every association points at an existing property and item.
    pub(crate) fn validate(&self, catalog: &ItemCatalog) -> Result<()> {
        for (item_id, associations) in &self.associations {
            if !catalog.contains(*item_id) {
                return Err(Error::InvalidData(SubCode::NonexistingItemReferenced, "ipma references a nonexistent item"));
            }
            for a in associations.iter() {
                if self.property(a.property_index).is_none() {
                    return Err(Error::InvalidData(SubCode::IpmaReferencesNonexistingProperty, "ipma references a nonexistent property"));
                }
            }
        }
        Ok(())
    }

    /// The item's properties in association order.
    ///
    /// Unknown properties are skipped unless marked essential, which fails the item.
    pub fn properties_of(&self, item_id: u32) -> Result<TryVec<&ItemProperty>> {
        let mut out = TryVec::new();
        for a in self.associations(item_id) {
            let prop = self
                .property(a.property_index)
                .ok_or(Error::InvalidData(SubCode::IpmaReferencesNonexistingProperty, "ipma references a nonexistent property"))?;
            if let ItemProperty::Unknown { box_type, .. } = prop {
                if a.essential {
                    warn!("item {item_id}: essential property {box_type} is not supported");
                    return Err(Error::Unsupported(SubCode::InvalidProperty, "essential property of unknown type"));
                }
                debug!("item {item_id}: skipping unknown property {box_type}");
                continue;
            }
            out.push(prop)?;
        }
        Ok(out)
    }

    /// First property of the item for which `pick` returns something.
    pub fn find<'a, R>(&'a self, item_id: u32, pick: impl Fn(&'a ItemProperty) -> Option<R>) -> Result<Option<R>> {
        Ok(self.properties_of(item_id)?.iter().find_map(|p| pick(p)))
    }

    pub fn image_size(&self, item_id: u32) -> Result<Option<ImageSpatialExtents>> {
        self.find(item_id, |p| match p {
            ItemProperty::ImageSpatialExtents(ispe) => Some(*ispe),
            _ => None,
        })
    }

    pub fn nclx_profile(&self, item_id: u32) -> Result<Option<NclxProfile>> {
        self.find(item_id, |p| match p {
            ItemProperty::ColorProfile(ColorProfile::Nclx(nclx)) => Some(*nclx),
            _ => None,
        })
    }

    pub fn icc_profile(&self, item_id: u32) -> Result<Option<&[u8]>> {
        self.find(item_id, |p| match p {
            ItemProperty::ColorProfile(ColorProfile::Icc { data, .. }) => Some(&data[..]),
            _ => None,
        })
    }

    pub fn auxiliary_type(&self, item_id: u32) -> Result<Option<&AuxiliaryType>> {
        self.find(item_id, |p| match p {
            ItemProperty::AuxiliaryType(aux) => Some(aux),
            _ => None,
        })
    }

    pub fn codec_configuration(&self, item_id: u32) -> Result<Option<&CodecConfiguration>> {
        self.find(item_id, |p| match p {
            ItemProperty::CodecConfiguration(config) => Some(config),
            _ => None,
        })
    }

    pub fn bits_per_channel(&self, item_id: u32) -> Result<Option<&[u8]>> {
        self.find(item_id, |p| match p {
            ItemProperty::Channels(bits) => Some(&bits[..]),
            _ => None,
        })
    }

    /// The item's geometric transforms, in the order they must be applied.
    pub fn transforms(&self, item_id: u32) -> Result<TryVec<Transform>> {
        let mut out = TryVec::new();
        for prop in self.properties_of(item_id)?.iter() {
            if let Some(t) = prop.as_transform() {
                out.push(t)?;
            }
        }
        Ok(out)
    }

    /// Append a property and return its 1-based index.
    pub(crate) fn add(&mut self, property: ItemProperty) -> Result<u16> {
        self.properties.push(property)?;
        u16::try_from(self.properties.len())
            .map_err(|_| Error::Encoding(SubCode::Unspecified, "too many properties for ipma"))
    }

    pub(crate) fn associate(&mut self, item_id: u32, property_index: u16, essential: bool) -> Result<()> {
        self.associations
            .entry(item_id)
            .or_default()
            .push(Association { property_index, essential })?;
        Ok(())
    }
}

/// Parse the item properties box: the property container followed by associations.
/// See ISO/IEC 23008-12:2017 § 9.3
pub(crate) fn read_iprp<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &ResourceTracker<'_>) -> Result<PropertyStore> {
    let mut properties = None;
    let mut associations = BTreeMap::new();
    let mut has_ipma = false;

    let mut iter = src.box_iter(tracker);
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::ItemPropertyContainerBox => {
                if properties.is_some() {
                    return Err(Error::InvalidData(SubCode::Unspecified, "There should be exactly one ipco box"));
                }
                properties = Some(read_ipco(&mut b, tracker)?);
            },
            BoxType::ItemPropertyAssociationBox => {
                has_ipma = true;
                read_ipma(&mut b, &mut associations)?;
            },
            _ => return Err(Error::InvalidData(SubCode::Unspecified, "unexpected iprp child")),
        }
        check_parser_state(&b.head, &b.content)?;
    }

    let properties = properties.ok_or(Error::InvalidData(SubCode::NoIpcoBox, "Required ipco box not present in iprp box"))?;
    if !has_ipma {
        return Err(Error::InvalidData(SubCode::NoIpmaBox, "Required ipma box not present in iprp box"));
    }

    Ok(PropertyStore { properties, associations })
}

fn read_ipma<T: Read>(src: &mut BMFFBox<'_, T>, associations: &mut BTreeMap<u32, TryVec<Association>>) -> Result<()> {
    let (version, flags) = read_fullbox_extra(src)?;

    let entry_count = be_u32(src)?;
    for _ in 0..entry_count {
        let item_id = if version == 0 {
            be_u16(src)?.into()
        } else {
            be_u32(src)?
        };
        let association_count = src.read_u8()?;
        let list = associations.entry(item_id).or_insert_with(TryVec::new);
        for _ in 0..association_count {
            let num_association_bytes = if flags & 1 == 1 { 2 } else { 1 };
            let association = &mut [0; 2][..num_association_bytes];
            src.read_exact(association)?;
            let mut association = BitReader::new(association);
            let essential = association.read_bool()?;
            let property_index = association.read_u16(association.remaining().try_into()?)?;
            // index 0 means "no property"
            if property_index != 0 {
                list.push(Association { property_index, essential })?;
            }
        }
    }
    Ok(())
}

fn read_ipco<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &ResourceTracker<'_>) -> Result<TryVec<ItemProperty>> {
    let mut properties = TryVec::new();

    let mut iter = src.box_iter(tracker);
    while let Some(mut b) = iter.next_box()? {
        // Must push for every property to have correct index for them
        let prop = match b.head.name {
            BoxType::ImageSpatialExtentsBox => ItemProperty::ImageSpatialExtents(read_ispe(&mut b, tracker)?),
            BoxType::ImageRotationBox => ItemProperty::Rotation(read_irot(&mut b)?),
            BoxType::ImageMirrorBox => ItemProperty::Mirror(read_imir(&mut b)?),
            BoxType::CleanApertureBox => ItemProperty::CleanAperture(read_clap(&mut b)?),
            BoxType::ColorInformationBox => read_colr(&mut b, tracker)?,
            BoxType::PixelInformationBox => ItemProperty::Channels(read_pixi(&mut b, tracker)?),
            BoxType::AuxiliaryTypeProperty => ItemProperty::AuxiliaryType(read_auxc(&mut b, tracker)?),
            BoxType::UserDescriptionBox => ItemProperty::UserDescription(read_udes(&mut b, tracker)?),
            BoxType::PixelAspectRatioBox => ItemProperty::PixelAspectRatio(PixelAspectRatio {
                h_spacing: be_u32(&mut b)?,
                v_spacing: be_u32(&mut b)?,
            }),
            BoxType::HevcConfigurationBox
            | BoxType::Av1ConfigurationBox
            | BoxType::AvcConfigurationBox
            | BoxType::VvcConfigurationBox
            | BoxType::JpegConfigurationBox
            | BoxType::Jpeg2000HeaderBox => ItemProperty::CodecConfiguration(CodecConfiguration {
                box_type: b.head.name.into(),
                data: b.read_into_try_vec(tracker)?,
            }),
            other => ItemProperty::Unknown {
                box_type: other.into(),
                data: b.read_into_try_vec(tracker)?,
            },
        };
        check_parser_state(&b.head, &b.content)?;
        properties.push(prop)?;
    }
    Ok(properties)
}

/// Parse an Image Spatial Extents property box
/// See ISO/IEC 23008-12:2017 § 6.5.3
fn read_ispe<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &ResourceTracker<'_>) -> Result<ImageSpatialExtents> {
    let _version = read_fullbox_version_no_flags(src, tracker)?;

    let width = be_u32(src)?;
    let height = be_u32(src)?;

    if width == 0 || height == 0 {
        return Err(Error::InvalidData(SubCode::InvalidImageSize, "ispe dimensions cannot be zero"));
    }

    Ok(ImageSpatialExtents { width, height })
}

/// See ISO/IEC 23008-12:2017 § 6.5.10
fn read_irot<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<Rotation> {
    let byte = [src.read_u8()?];
    let mut bits = BitReader::new(&byte);
    let _reserved = bits.read_u8(6)?;
    Ok(Rotation::from_angle_code(bits.read_u8(2)?))
}

/// See ISO/IEC 23008-12:2017 § 6.5.12
fn read_imir<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<MirrorAxis> {
    let byte = [src.read_u8()?];
    let mut bits = BitReader::new(&byte);
    let _reserved = bits.read_u8(7)?;
    Ok(if bits.read_bool()? {
        MirrorAxis::Horizontal
    } else {
        MirrorAxis::Vertical
    })
}

/// See ISO 14496-12:2015 § 12.1.4
fn read_clap<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<CleanAperture> {
    fn unsigned_fraction<R: Read>(src: &mut R) -> Result<Fraction> {
        let numerator = i32::try_from(be_u32(src)?)
            .map_err(|_| Error::InvalidData(SubCode::InvalidFractionalNumber, "clap size does not fit"))?;
        Ok(Fraction::new(numerator, be_u32(src)?))
    }
    let width = unsigned_fraction(src)?;
    let height = unsigned_fraction(src)?;
    let horizontal_offset = Fraction::new(be_i32(src)?, be_u32(src)?);
    let vertical_offset = Fraction::new(be_i32(src)?, be_u32(src)?);
    let clap = CleanAperture {
        width,
        height,
        horizontal_offset,
        vertical_offset,
    };
    clap.validate()?;
    Ok(clap)
}

/// See ISO/IEC 23008-12:2017 § 6.5.5
fn read_colr<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &ResourceTracker<'_>) -> Result<ItemProperty> {
    let colour_type = FourCC::from(be_u32(src)?);
    match &colour_type.0 {
        b"nclx" => {
            let color_primaries = be_u16(src)?;
            let transfer_characteristics = be_u16(src)?;
            let matrix_coefficients = be_u16(src)?;
            let byte = [src.read_u8()?];
            let mut bits = BitReader::new(&byte);
            let full_range = bits.read_bool()?;
            let _reserved = bits.read_u8(7)?;
            Ok(ItemProperty::ColorProfile(ColorProfile::Nclx(NclxProfile {
                color_primaries,
                transfer_characteristics,
                matrix_coefficients,
                full_range,
            })))
        },
        b"rICC" | b"prof" => Ok(ItemProperty::ColorProfile(ColorProfile::Icc {
            profile_type: colour_type,
            data: src.read_into_try_vec(tracker)?,
        })),
        _ if tracker.lenient() => {
            warn!("unknown colr type {colour_type}, keeping it as an opaque property");
            let rest = src.read_into_try_vec(tracker)?;
            let mut data = TryVec::with_capacity(rest.len() + 4)?;
            data.extend_from_slice(colour_type.as_bytes())?;
            data.extend_from_slice(&rest)?;
            Ok(ItemProperty::Unknown {
                box_type: BoxType::ColorInformationBox.into(),
                data,
            })
        },
        _ => Err(Error::InvalidData(SubCode::UnknownColorProfileType, "unknown colr colour_type")),
    }
}

fn read_pixi<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &ResourceTracker<'_>) -> Result<ArrayVec<u8, 16>> {
    let version = read_fullbox_version_no_flags(src, tracker)?;
    if version != 0 {
        return Err(Error::Unsupported(SubCode::UnsupportedDataVersion, "pixi version"));
    }

    let num_channels = usize::from(src.read_u8()?);
    if num_channels > 16 {
        return Err(Error::InvalidData(SubCode::InvalidPixiBox, "too many channels in pixi"));
    }
    let mut channels = ArrayVec::new();
    channels.extend((0..num_channels).map(|_| 0));
    src.read_exact(&mut channels)
        .map_err(|_| Error::InvalidData(SubCode::InvalidPixiBox, "invalid num_channels"))?;

    // In lenient mode, skip any extra bytes
    if tracker.lenient() && src.bytes_left() > 0 {
        let left = src.bytes_left();
        skip(src, left)?;
    }

    Ok(channels)
}

fn read_auxc<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &ResourceTracker<'_>) -> Result<AuxiliaryType> {
    let version = read_fullbox_version_no_flags(src, tracker)?;
    if version != 0 {
        return Err(Error::Unsupported(SubCode::UnsupportedDataVersion, "auxC version"));
    }

    let aux_type = read_c_string(src)?;
    let subtype = src.read_into_try_vec(tracker)?;

    Ok(AuxiliaryType { aux_type, subtype })
}

fn read_udes<T: Read>(src: &mut BMFFBox<'_, T>, tracker: &ResourceTracker<'_>) -> Result<UserDescription> {
    let version = read_fullbox_version_no_flags(src, tracker)?;
    if version != 0 {
        return Err(Error::Unsupported(SubCode::UnsupportedDataVersion, "udes version"));
    }
    Ok(UserDescription {
        lang: read_c_string(src)?,
        name: read_c_string(src)?,
        description: read_c_string(src)?,
        tags: read_c_string(src)?,
    })
}

fn write_c_string(out: &mut std::vec::Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn write_property(out: &mut std::vec::Vec<u8>, property: &ItemProperty) -> Result<()> {
    let fourcc = property.box_type();
    match property {
        ItemProperty::ImageSpatialExtents(ispe) => write_full_box(out, fourcc, 0, 0, |b| {
            b.write_u32::<BigEndian>(ispe.width)?;
            b.write_u32::<BigEndian>(ispe.height)?;
            Ok(())
        }),
        ItemProperty::Rotation(rotation) => write_box(out, fourcc, |b| Ok(b.write_u8(rotation.angle_code())?)),
        ItemProperty::Mirror(axis) => write_box(out, fourcc, |b| {
            Ok(b.write_u8(match axis {
                MirrorAxis::Vertical => 0,
                MirrorAxis::Horizontal => 1,
            })?)
        }),
        ItemProperty::CleanAperture(clap) => write_box(out, fourcc, |b| {
            for (i, f) in [clap.width, clap.height, clap.horizontal_offset, clap.vertical_offset].into_iter().enumerate() {
                if i < 2 {
                    b.write_u32::<BigEndian>(u32::try_from(f.numerator)?)?;
                } else {
                    b.write_i32::<BigEndian>(f.numerator)?;
                }
                b.write_u32::<BigEndian>(f.denominator)?;
            }
            Ok(())
        }),
        ItemProperty::ColorProfile(ColorProfile::Nclx(nclx)) => write_box(out, fourcc, |b| {
            b.write_u32::<BigEndian>(u32::from(FourCC::new(b"nclx")))?;
            b.write_u16::<BigEndian>(nclx.color_primaries)?;
            b.write_u16::<BigEndian>(nclx.transfer_characteristics)?;
            b.write_u16::<BigEndian>(nclx.matrix_coefficients)?;
            b.write_u8(if nclx.full_range { 0x80 } else { 0 })?;
            Ok(())
        }),
        ItemProperty::ColorProfile(ColorProfile::Icc { profile_type, data }) => write_box(out, fourcc, |b| {
            b.write_u32::<BigEndian>(u32::from(*profile_type))?;
            b.extend_from_slice(data);
            Ok(())
        }),
        ItemProperty::Channels(bits) => write_full_box(out, fourcc, 0, 0, |b| {
            b.write_u8(u8::try_from(bits.len())?)?;
            b.extend_from_slice(bits);
            Ok(())
        }),
        ItemProperty::AuxiliaryType(aux) => write_full_box(out, fourcc, 0, 0, |b| {
            write_c_string(b, &aux.aux_type);
            b.extend_from_slice(&aux.subtype);
            Ok(())
        }),
        ItemProperty::UserDescription(udes) => write_full_box(out, fourcc, 0, 0, |b| {
            for s in [&udes.lang, &udes.name, &udes.description, &udes.tags] {
                write_c_string(b, s);
            }
            Ok(())
        }),
        ItemProperty::PixelAspectRatio(pasp) => write_box(out, fourcc, |b| {
            b.write_u32::<BigEndian>(pasp.h_spacing)?;
            b.write_u32::<BigEndian>(pasp.v_spacing)?;
            Ok(())
        }),
        ItemProperty::CodecConfiguration(CodecConfiguration { data, .. }) | ItemProperty::Unknown { data, .. } => write_box(out, fourcc, |b| {
            b.extend_from_slice(data);
            Ok(())
        }),
    }
}

/// Serialize the store as an 'iprp' box holding 'ipco' and one 'ipma'.
pub(crate) fn write_iprp(out: &mut std::vec::Vec<u8>, store: &PropertyStore) -> Result<()> {
    write_box(out, BoxType::ItemPropertiesBox.into(), |iprp| {
        write_box(iprp, BoxType::ItemPropertyContainerBox.into(), |ipco| {
            for property in store.properties.iter() {
                write_property(ipco, property)?;
            }
            Ok(())
        })?;

        let wide_ids = store.associations.keys().any(|&id| id > u32::from(u16::MAX));
        let wide_indices = store.properties.len() > 0x7F;
        let version = u8::from(wide_ids);
        let flags = u32::from(wide_indices);
        write_full_box(iprp, BoxType::ItemPropertyAssociationBox.into(), version, flags, |ipma| {
            let entries: std::vec::Vec<_> = store.associations.iter().filter(|(_, a)| !a.is_empty()).collect();
            ipma.write_u32::<BigEndian>(u32::try_from(entries.len())?)?;
            for (&item_id, associations) in entries {
                if wide_ids {
                    ipma.write_u32::<BigEndian>(item_id)?;
                } else {
                    ipma.write_u16::<BigEndian>(u16::try_from(item_id)?)?;
                }
                let count = u8::try_from(associations.len())
                    .map_err(|_| Error::Encoding(SubCode::Unspecified, "too many properties on one item"))?;
                ipma.write_u8(count)?;
                for a in associations.iter() {
                    let essential = u16::from(a.essential);
                    if wide_indices {
                        ipma.write_u16::<BigEndian>(essential << 15 | a.property_index)?;
                    } else {
                        ipma.write_u8(u8::try_from(essential << 7 | a.property_index)?)?;
                    }
                }
            }
            Ok(())
        })
    })
}

#[cfg(test)]
fn parse_iprp(bytes: &[u8], config: &crate::DecodeConfig) -> Result<PropertyStore> {
    let tracker = ResourceTracker::new(config);
    let mut cursor = bytes;
    let head = crate::bmff::read_box_header(&mut cursor)?;
    let mut b = BMFFBox {
        head,
        content: <_ as Read>::take(&mut cursor, head.size - head.offset),
    };
    read_iprp(&mut b, &tracker)
}

#[cfg(test)]
fn sample_store() -> PropertyStore {
    let mut store = PropertyStore::default();
    let ispe = store.add(ItemProperty::ImageSpatialExtents(ImageSpatialExtents { width: 64, height: 48 })).unwrap();
    let rot = store.add(ItemProperty::Rotation(Rotation::Deg90)).unwrap();
    let mirror = store.add(ItemProperty::Mirror(MirrorAxis::Horizontal)).unwrap();
    let nclx = store.add(ItemProperty::ColorProfile(ColorProfile::Nclx(NclxProfile::default()))).unwrap();
    let clap = store.add(ItemProperty::CleanAperture(CleanAperture::from_margins(64, 48, 2, 4, 6, 8).unwrap())).unwrap();
    store.associate(1, ispe, false).unwrap();
    store.associate(1, mirror, true).unwrap();
    store.associate(1, rot, true).unwrap();
    store.associate(1, clap, true).unwrap();
    store.associate(1, nclx, true).unwrap();
    store
}

#[test]
fn iprp_roundtrip_keeps_order() {
    let store = sample_store();
    let mut out = std::vec::Vec::new();
    write_iprp(&mut out, &store).unwrap();
    let parsed = parse_iprp(&out, &crate::DecodeConfig::default()).unwrap();
    assert_eq!(parsed, store);

    let transforms = parsed.transforms(1).unwrap();
    assert_eq!(transforms.len(), 3);
    assert_eq!(transforms[0], Transform::Mirror(MirrorAxis::Horizontal));
    assert_eq!(transforms[1], Transform::Rotate(Rotation::Deg90));
    assert!(matches!(transforms[2], Transform::CleanAperture(_)));
    assert_eq!(parsed.image_size(1).unwrap(), Some(ImageSpatialExtents { width: 64, height: 48 }));
}

#[test]
fn unknown_property_essential_flag() {
    let mut store = PropertyStore::default();
    let unknown = store
        .add(ItemProperty::Unknown {
            box_type: FourCC::new(b"zzzz"),
            data: TryVec::new(),
        })
        .unwrap();
    let ispe = store.add(ItemProperty::ImageSpatialExtents(ImageSpatialExtents { width: 1, height: 1 })).unwrap();
    store.associate(1, unknown, false).unwrap();
    store.associate(1, ispe, false).unwrap();
    store.associate(2, unknown, true).unwrap();

    assert_eq!(store.properties_of(1).unwrap().len(), 1);
    let err = store.properties_of(2).unwrap_err();
    assert_eq!(err.category(), crate::Category::UnsupportedFeature);
}

#[test]
fn nonexistent_property_index() {
    let mut store = sample_store();
    store.associate(1, 42, false).unwrap();
    let catalog = ItemCatalog::new(vec![crate::Item::new(1, crate::item_type::HEVC)].into(), 1).unwrap();
    let err = store.validate(&catalog).unwrap_err();
    assert_eq!(err.subcode(), SubCode::IpmaReferencesNonexistingProperty);
}

#[test]
fn nclx_chromaticities() {
    let bt2020 = NclxProfile {
        color_primaries: 9,
        ..NclxProfile::default()
    };
    assert_eq!(bt2020.chromaticities().green, (0.170, 0.797));
    let unspecified = NclxProfile {
        color_primaries: 2,
        ..NclxProfile::default()
    };
    assert_eq!(unspecified.chromaticities().red, (0.64, 0.33));
}
