// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

/// A four-character code, as used for box types, item types, brands and
/// reference types.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    #[must_use]
    pub const fn new(value: &[u8; 4]) -> Self {
        Self(*value)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl From<u32> for FourCC {
    fn from(number: u32) -> Self {
        Self(number.to_be_bytes())
    }
}

impl From<FourCC> for u32 {
    fn from(fourcc: FourCC) -> Self {
        Self::from_be_bytes(fourcc.0)
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(value: [u8; 4]) -> Self {
        Self(value)
    }
}

impl From<&[u8; 4]> for FourCC {
    fn from(value: &[u8; 4]) -> Self {
        Self(*value)
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        self.0 == **other
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{self}'")
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            for &b in &self.0 {
                fmt::Write::write_char(f, char::from(b))?;
            }
            Ok(())
        } else {
            write!(f, "0x{:08x}", u32::from(*self))
        }
    }
}

macro_rules! box_database {
    ($($(#[$attr:meta])* $boxenum:ident $boxtype:literal),* $(,)?) => {
        /// Box types the reader and writer know by name.
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub(crate) enum BoxType {
            $($(#[$attr])* $boxenum,)*
            UnknownBox(FourCC),
        }

        impl From<FourCC> for BoxType {
            fn from(fourcc: FourCC) -> Self {
                match &fourcc.0 {
                    $($boxtype => Self::$boxenum,)*
                    _ => Self::UnknownBox(fourcc),
                }
            }
        }

        impl From<u32> for BoxType {
            fn from(number: u32) -> Self {
                FourCC::from(number).into()
            }
        }

        impl From<BoxType> for FourCC {
            fn from(t: BoxType) -> Self {
                match t {
                    $(BoxType::$boxenum => FourCC(*$boxtype),)*
                    BoxType::UnknownBox(fourcc) => fourcc,
                }
            }
        }

        impl fmt::Debug for BoxType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let fourcc: FourCC = From::from(*self);
                fmt::Debug::fmt(&fourcc, f)
            }
        }
    };
}

box_database!(
    FileTypeBox b"ftyp",
    MetadataBox b"meta",
    HandlerBox b"hdlr",
    PrimaryItemBox b"pitm",
    ItemInfoBox b"iinf",
    ItemInfoEntry b"infe",
    ItemLocationBox b"iloc",
    ItemReferenceBox b"iref",
    ItemDataBox b"idat",
    ItemPropertiesBox b"iprp",
    ItemPropertyContainerBox b"ipco",
    ItemPropertyAssociationBox b"ipma",
    MediaDataBox b"mdat",
    FreeSpaceBox b"free",
    UuidBox b"uuid",
    ImageSpatialExtentsBox b"ispe",
    ImageRotationBox b"irot",
    ImageMirrorBox b"imir",
    CleanApertureBox b"clap",
    ColorInformationBox b"colr",
    PixelInformationBox b"pixi",
    AuxiliaryTypeProperty b"auxC",
    UserDescriptionBox b"udes",
    PixelAspectRatioBox b"pasp",
    HevcConfigurationBox b"hvcC",
    Av1ConfigurationBox b"av1C",
    AvcConfigurationBox b"avcC",
    VvcConfigurationBox b"vvcC",
    JpegConfigurationBox b"jpgC",
    Jpeg2000HeaderBox b"j2kH",
);

/// Item types with special meaning to the decoder.
pub mod item_type {
    use super::FourCC;

    pub const GRID: FourCC = FourCC(*b"grid");
    pub const IDENTITY: FourCC = FourCC(*b"iden");
    pub const OVERLAY: FourCC = FourCC(*b"iovl");
    pub const HEVC: FourCC = FourCC(*b"hvc1");
    pub const AVC: FourCC = FourCC(*b"avc1");
    pub const AV1: FourCC = FourCC(*b"av01");
    pub const VVC: FourCC = FourCC(*b"vvc1");
    pub const JPEG: FourCC = FourCC(*b"jpeg");
    pub const JPEG2000: FourCC = FourCC(*b"j2k1");
    pub const UNCOMPRESSED: FourCC = FourCC(*b"unci");
    pub const MIME: FourCC = FourCC(*b"mime");
    pub const URI: FourCC = FourCC(*b"uri ");
    pub const EXIF: FourCC = FourCC(*b"Exif");
    pub const REGION: FourCC = FourCC(*b"rgan");
}

/// Item reference types.
pub mod reference_type {
    use super::FourCC;

    /// Derived image to its inputs (grid tiles, identity source).
    pub const DERIVED_IMAGE: FourCC = FourCC(*b"dimg");
    /// Thumbnail to its master image.
    pub const THUMBNAIL: FourCC = FourCC(*b"thmb");
    /// Auxiliary image (alpha, depth) to its master image.
    pub const AUXILIARY: FourCC = FourCC(*b"auxl");
    /// Metadata or region item to the image it describes.
    pub const CONTENT_DESCRIBES: FourCC = FourCC(*b"cdsc");
    /// Color image to the alpha image it was premultiplied with.
    pub const PREMULTIPLIED: FourCC = FourCC(*b"prem");
    /// Item whose data is built from other items' data (`iloc` construction method 2).
    pub const ITEM_LOCATION: FourCC = FourCC(*b"iloc");
    /// Region item to the mask items of its referenced-mask regions.
    pub const MASK: FourCC = FourCC(*b"mask");
}

#[test]
fn fourcc_display() {
    assert_eq!(FourCC::new(b"ftyp").to_string(), "ftyp");
    assert_eq!(FourCC::new(b"uri ").to_string(), "uri ");
    assert_eq!(FourCC::from(0x0000_0001).to_string(), "0x00000001");
}

#[test]
fn box_type_lookup() {
    assert!(BoxType::from(FourCC::new(b"ipma")) == BoxType::ItemPropertyAssociationBox);
    let unknown = BoxType::from(FourCC::new(b"zzzz"));
    assert_eq!(FourCC::from(unknown), FourCC::new(b"zzzz"));
    assert_eq!(FourCC::from(BoxType::CleanApertureBox), b"clap");
}
