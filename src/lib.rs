#![deny(unsafe_code)]
//! Reader and writer for HEIF-family image containers (HEIF, HEIC, AVIF).
//!
//! The crate parses the ISO base media box tree into a validated graph of
//! items, properties and references, resolves derived images such as grids,
//! dispatches coded payloads to registered codec capabilities (optionally in
//! parallel for grid tiles), and applies the ordered geometric transforms and
//! color conversions an image asks for. Region annotations can be mapped into
//! the coordinate space of a decoded image.
//!
//! Codecs are not part of this crate. Register implementations of
//! [`Decoder`] and [`Encoder`] with a [`HeifContext`] before decoding.
//!
//! This crate is written entirely in safe Rust code.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use fallible_collections::TryReserveError;

mod bmff;
mod boxes;
mod codec;
mod color;
mod container;
mod context;
mod decode;
mod grid;
mod image;
mod iref;
mod item;
mod pool;
mod property;
mod region;
mod source;
mod transform;
mod writer;

pub use crate::boxes::{FourCC, item_type, reference_type};
pub use crate::codec::{CodecError, CodecRegistry, CodedImage, CompressionFormat, DecodeMode, DecodedImage, Decoder, EncodedImage, Encoder, EncodingOptions};
pub use crate::color::{ChromaDownsampling, ChromaUpsampling, ColorConversionOptions};
pub use crate::container::{FileType, HeifFile, ItemGraph};
pub use crate::context::HeifContext;
pub use crate::decode::DecodingOptions;
pub use crate::grid::{GridDescriptor, GridPlan};
pub use crate::image::{Channel, Chroma, Colorspace, Image, Plane};
pub use crate::iref::{Reference, ReferenceGraph};
pub use crate::item::{ConstructionMethod, Extent, Item, ItemCatalog, ItemLocation};
pub use crate::property::{Association, AuxiliaryType, CodecConfiguration, ColorProfile, ImageSpatialExtents, ItemProperty, NclxProfile, PixelAspectRatio, PropertyStore, UserDescription};
pub use crate::region::{CoordinateMapper, Region, RegionItem, TransformedRegion};
pub use crate::source::{ByteSink, ByteSource, GrowStatus, MemorySource, ReaderSource, WriteSink};
pub use crate::transform::{CleanAperture, CropMargins, Fraction, MirrorAxis, Rotation, Transform, transformed_size};
pub use crate::writer::HeifWriter;

pub use enough::{Stop, StopReason, Unstoppable};

/// A trait to indicate a type can be infallibly converted to `u64`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Statically verify that the platform `usize` can fit within a `u64`.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self.try_into().ok().unwrap()
    }
}

/// A trait to indicate a type can be infallibly converted to `usize`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self.try_into().ok().unwrap()
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;
pub(crate) type TryString = fallible_collections::TryVec<u8>;

/// Coarse classification of an [`Error`].
///
/// Callers can use this to decide whether a failure is worth retrying with a
/// different codec or with raised limits, or whether the input is simply bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// The container or one of its payloads is corrupt or malformed.
    InvalidInput,
    /// The input uses a feature this crate or the registered codecs do not implement.
    UnsupportedFeature,
    /// The caller asked for something that does not exist or makes no sense.
    UsageError,
    /// A configured resource limit or an allocation failed.
    MemoryLimit,
    /// A registered decoder reported a failure.
    DecoderPlugin,
    /// A registered encoder reported a failure.
    EncoderPlugin,
    /// Writing the container failed.
    Encoding,
    /// The requested color profile is not present.
    ColorProfileMissing,
    /// The operation was stopped through its [`Stop`] token.
    Cancelled,
}

/// Fine-grained cause of an [`Error`].
///
/// The numeric values returned by [`SubCode::code`] are stable and follow the
/// codes used by other HEIF implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubCode {
    Unspecified,
    EndOfData,
    InvalidBoxSize,
    NoFtypBox,
    NoIdatBox,
    NoMetaBox,
    NoHdlrBox,
    NoPitmBox,
    NoIpcoBox,
    NoIpmaBox,
    NoIlocBox,
    NoIinfBox,
    NoIprpBox,
    NoIrefBox,
    NoPictHandler,
    IpmaReferencesNonexistingProperty,
    NoItemData,
    InvalidGridData,
    MissingGridImages,
    InvalidCleanAperture,
    NoOrInvalidPrimaryItem,
    NoInfeBox,
    UnknownColorProfileType,
    WrongTileImageChromaFormat,
    InvalidFractionalNumber,
    InvalidImageSize,
    InvalidPixiBox,
    WrongTileImagePixelDepth,
    InvalidRegionData,
    SecurityLimitExceeded,
    NonexistingItemReferenced,
    NonexistingImageChannelReferenced,
    UnsupportedParameter,
    InvalidParameterValue,
    InvalidProperty,
    ItemReferenceCycle,
    UnsupportedCodec,
    UnsupportedImageType,
    UnsupportedDataVersion,
    UnsupportedColorConversion,
    UnsupportedItemConstructionMethod,
    UnsupportedBitDepth,
    CannotWriteOutputData,
    EncoderEncoding,
    TooManyRegions,
}

impl SubCode {
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::Unspecified => 0,
            Self::EndOfData => 100,
            Self::InvalidBoxSize => 101,
            Self::NoFtypBox => 102,
            Self::NoIdatBox => 103,
            Self::NoMetaBox => 104,
            Self::NoHdlrBox => 105,
            Self::NoPitmBox => 107,
            Self::NoIpcoBox => 108,
            Self::NoIpmaBox => 109,
            Self::NoIlocBox => 110,
            Self::NoIinfBox => 111,
            Self::NoIprpBox => 112,
            Self::NoIrefBox => 113,
            Self::NoPictHandler => 114,
            Self::IpmaReferencesNonexistingProperty => 115,
            Self::NoItemData => 117,
            Self::InvalidGridData => 118,
            Self::MissingGridImages => 119,
            Self::InvalidCleanAperture => 120,
            Self::NoOrInvalidPrimaryItem => 124,
            Self::NoInfeBox => 125,
            Self::UnknownColorProfileType => 126,
            Self::WrongTileImageChromaFormat => 127,
            Self::InvalidFractionalNumber => 128,
            Self::InvalidImageSize => 129,
            Self::InvalidPixiBox => 130,
            Self::WrongTileImagePixelDepth => 132,
            Self::InvalidRegionData => 136,
            Self::SecurityLimitExceeded => 1000,
            Self::NonexistingItemReferenced => 2000,
            Self::NonexistingImageChannelReferenced => 2002,
            Self::UnsupportedParameter => 2005,
            Self::InvalidParameterValue => 2006,
            Self::InvalidProperty => 2007,
            Self::ItemReferenceCycle => 2008,
            Self::UnsupportedCodec => 3000,
            Self::UnsupportedImageType => 3001,
            Self::UnsupportedDataVersion => 3002,
            Self::UnsupportedColorConversion => 3003,
            Self::UnsupportedItemConstructionMethod => 3004,
            Self::UnsupportedBitDepth => 4000,
            Self::CannotWriteOutputData => 5000,
            Self::EncoderEncoding => 5002,
            Self::TooManyRegions => 5004,
        }
    }
}

/// Describes parser, decoder and writer failures.
///
/// This enum wraps the standard `io::Error` type, unified with
/// our own error states and those reported by registered codecs.
/// Use [`Error::category`] and [`Error::subcode`] for the two-level classification.
#[derive(Debug)]
pub enum Error {
    /// Parse error caused by corrupt or malformed data.
    InvalidData(SubCode, &'static str),
    /// Error caused by limited support rather than invalid data.
    Unsupported(SubCode, &'static str),
    /// The caller passed an argument that does not fit the container.
    Usage(SubCode, &'static str),
    /// Reflect `std::io::ErrorKind::UnexpectedEof` for short data.
    UnexpectedEOF,
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// Out of memory
    OutOfMemory,
    /// Resource limit exceeded during parsing or decoding
    ResourceLimitExceeded(&'static str),
    /// A registered decoder failed.
    Decoder {
        codec: std::string::String,
        source: CodecError,
    },
    /// A registered encoder failed.
    Encoder {
        codec: std::string::String,
        source: CodecError,
    },
    /// Serializing the container failed.
    Encoding(SubCode, &'static str),
    /// The item has no color profile of the requested kind.
    NoColorProfile,
    /// Operation was stopped/cancelled
    Stopped(enough::StopReason),
}

impl Error {
    /// The coarse category of this error.
    #[must_use]
    pub fn category(&self) -> Category {
        match self {
            Self::InvalidData(..) | Self::UnexpectedEOF | Self::Io(_) => Category::InvalidInput,
            Self::Unsupported(..) => Category::UnsupportedFeature,
            Self::Usage(..) => Category::UsageError,
            Self::OutOfMemory | Self::ResourceLimitExceeded(_) => Category::MemoryLimit,
            Self::Decoder { .. } => Category::DecoderPlugin,
            Self::Encoder { .. } => Category::EncoderPlugin,
            Self::Encoding(..) => Category::Encoding,
            Self::NoColorProfile => Category::ColorProfileMissing,
            Self::Stopped(_) => Category::Cancelled,
        }
    }

    /// The fine-grained cause of this error.
    #[must_use]
    pub fn subcode(&self) -> SubCode {
        match self {
            Self::InvalidData(code, _) | Self::Unsupported(code, _) | Self::Usage(code, _) | Self::Encoding(code, _) => *code,
            Self::UnexpectedEOF => SubCode::EndOfData,
            Self::ResourceLimitExceeded(_) => SubCode::SecurityLimitExceeded,
            Self::Encoder { .. } => SubCode::EncoderEncoding,
            Self::Io(_) | Self::OutOfMemory | Self::Decoder { .. } | Self::NoColorProfile | Self::Stopped(_) => SubCode::Unspecified,
        }
    }

    /// Wrap an error reported by a decoder capability.
    pub(crate) fn from_decoder(codec: &str, source: CodecError) -> Self {
        Self::Decoder {
            codec: codec.into(),
            source,
        }
    }

    /// Wrap an error reported by an encoder capability.
    pub(crate) fn from_encoder(codec: &str, source: CodecError) -> Self {
        Self::Encoder {
            codec: codec.into(),
            source,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(_, s) | Self::Unsupported(_, s) | Self::Usage(_, s) | Self::Encoding(_, s) | Self::ResourceLimitExceeded(s) => s,
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return err.fmt(f),
            Self::OutOfMemory => "OOM",
            Self::Decoder { codec, source } => return write!(f, "decoder '{codec}': {source}"),
            Self::Encoder { codec, source } => return write!(f, "encoder '{codec}': {source}"),
            Self::NoColorProfile => "color profile does not exist",
            Self::Stopped(reason) => return write!(f, "Stopped: {reason}"),
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Decoder { source, .. } | Self::Encoder { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::InvalidData(SubCode::EndOfData, "truncated bits")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEOF,
            _ => Self::Io(err),
        }
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Self::InvalidData(SubCode::Unspecified, "invalid utf8")
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported(SubCode::Unspecified, "integer conversion failed")
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(..) => std::io::ErrorKind::InvalidData,
            Error::UnexpectedEOF => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<enough::StopReason> for Error {
    fn from(reason: enough::StopReason) -> Self {
        Self::Stopped(reason)
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Limits and validation options applied while parsing a container.
///
/// Resource limits are checked **before** allocations occur, preventing out-of-memory
/// conditions from malicious files that declare unrealistic sizes or counts.
///
/// # Examples
///
/// ```rust
/// use heif_container::DecodeConfig;
///
/// // Default limits (suitable for most apps)
/// let config = DecodeConfig::default();
///
/// // Strict limits for untrusted input
/// let config = DecodeConfig::default()
///     .with_peak_memory_limit(100_000_000)
///     .with_max_image_dimension(8192)
///     .with_max_grid_tiles(64);
///
/// // No limits
/// let config = DecodeConfig::unlimited();
/// ```
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Maximum number of bytes held for box payloads and item data.
    /// Default: 1GB (1,000,000,000 bytes)
    pub peak_memory_limit: Option<u64>,

    /// Maximum number of grid tiles.
    /// Default: 4,096 tiles
    pub max_grid_tiles: Option<u32>,

    /// Maximum width or height of a decoded or composed image.
    /// Default: 32,768 pixels
    pub max_image_dimension: Option<u32>,

    /// Maximum number of child boxes in one container box.
    /// Default: 65,536
    pub max_children_per_box: Option<u32>,

    /// Maximum number of items in the item information box.
    /// Default: 20,000
    pub max_items: Option<u32>,

    /// Maximum number of extents in one item location.
    /// Default: 32
    pub max_extents_per_item: Option<u32>,

    /// Enable lenient parsing mode.
    ///
    /// When true, non-critical validation errors (like non-zero flags in boxes
    /// that expect zero flags) are ignored instead of returning errors.
    /// Default: false (strict validation)
    pub lenient: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            peak_memory_limit: Some(1_000_000_000),
            max_grid_tiles: Some(4_096),
            max_image_dimension: Some(32_768),
            max_children_per_box: Some(65_536),
            max_items: Some(20_000),
            max_extents_per_item: Some(32),
            lenient: false,
        }
    }
}

impl DecodeConfig {
    /// Create a configuration with no resource limits.
    pub fn unlimited() -> Self {
        Self {
            peak_memory_limit: None,
            max_grid_tiles: None,
            max_image_dimension: None,
            max_children_per_box: None,
            max_items: None,
            max_extents_per_item: None,
            lenient: false,
        }
    }

    /// Set the peak memory limit in bytes
    pub fn with_peak_memory_limit(mut self, bytes: u64) -> Self {
        self.peak_memory_limit = Some(bytes);
        self
    }

    /// Set the maximum grid tile count
    pub fn with_max_grid_tiles(mut self, tiles: u32) -> Self {
        self.max_grid_tiles = Some(tiles);
        self
    }

    /// Set the maximum accepted image width or height
    pub fn with_max_image_dimension(mut self, pixels: u32) -> Self {
        self.max_image_dimension = Some(pixels);
        self
    }

    /// Set the maximum number of children per container box
    pub fn with_max_children_per_box(mut self, children: u32) -> Self {
        self.max_children_per_box = Some(children);
        self
    }

    /// Set the maximum number of items
    pub fn with_max_items(mut self, items: u32) -> Self {
        self.max_items = Some(items);
        self
    }

    /// Set the maximum number of extents per item location
    pub fn with_max_extents_per_item(mut self, extents: u32) -> Self {
        self.max_extents_per_item = Some(extents);
        self
    }

    /// Enable lenient parsing mode
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    pub(crate) fn validate_dimensions(&self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidData(SubCode::InvalidImageSize, "image dimensions cannot be zero"));
        }
        if let Some(limit) = self.max_image_dimension {
            if width > limit || height > limit {
                return Err(Error::ResourceLimitExceeded("image dimension limit exceeded"));
            }
        }
        Ok(())
    }

    pub(crate) fn validate_grid_tiles(&self, count: u32) -> Result<()> {
        if let Some(limit) = self.max_grid_tiles {
            if count > limit {
                return Err(Error::ResourceLimitExceeded("grid tile count limit exceeded"));
            }
        }
        Ok(())
    }
}

#[test]
fn error_classification() {
    let err = Error::InvalidData(SubCode::NoPitmBox, "pitm missing");
    assert_eq!(err.category(), Category::InvalidInput);
    assert_eq!(err.subcode().code(), 107);

    let err = Error::from(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
    assert_eq!(err.subcode(), SubCode::EndOfData);

    let err = Error::ResourceLimitExceeded("peak memory limit exceeded");
    assert_eq!(err.category(), Category::MemoryLimit);
    assert_eq!(err.subcode(), SubCode::SecurityLimitExceeded);
}

#[test]
fn dimension_limits() {
    let config = DecodeConfig::default().with_max_image_dimension(100);
    assert!(config.validate_dimensions(100, 100).is_ok());
    assert!(matches!(config.validate_dimensions(101, 1), Err(Error::ResourceLimitExceeded(_))));
    assert!(matches!(config.validate_dimensions(0, 1), Err(Error::InvalidData(SubCode::InvalidImageSize, _))));
    assert!(DecodeConfig::unlimited().validate_dimensions(1 << 20, 1 << 20).is_ok());
}
