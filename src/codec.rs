// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Codec capabilities and the registry that picks one per compression format.
//!
//! The crate never decodes a bitstream itself. A [`Decoder`] turns the coded
//! bytes of one item into an [`Image`]; an [`Encoder`] does the reverse.

use crate::boxes::{BoxType, FourCC, item_type};
use crate::image::{Chroma, Image};
use crate::{Error, SubCode};
use std::fmt;
use std::sync::Arc;

/// Error type reported by codec implementations.
pub type CodecError = Box<dyn std::error::Error + Send + Sync>;

/// Compression formats an image item can be coded in, named after their item type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionFormat {
    Hevc,
    Avc,
    Av1,
    Vvc,
    Jpeg,
    Jpeg2000,
    Uncompressed,
}

impl CompressionFormat {
    #[must_use]
    pub fn from_item_type(item_type: FourCC) -> Option<Self> {
        Some(match item_type {
            item_type::HEVC => Self::Hevc,
            item_type::AVC => Self::Avc,
            item_type::AV1 => Self::Av1,
            item_type::VVC => Self::Vvc,
            item_type::JPEG => Self::Jpeg,
            item_type::JPEG2000 => Self::Jpeg2000,
            item_type::UNCOMPRESSED => Self::Uncompressed,
            _ => return None,
        })
    }

    #[must_use]
    pub fn item_type(self) -> FourCC {
        match self {
            Self::Hevc => item_type::HEVC,
            Self::Avc => item_type::AVC,
            Self::Av1 => item_type::AV1,
            Self::Vvc => item_type::VVC,
            Self::Jpeg => item_type::JPEG,
            Self::Jpeg2000 => item_type::JPEG2000,
            Self::Uncompressed => item_type::UNCOMPRESSED,
        }
    }

    /// The property box carrying this format's decoder configuration.
    #[must_use]
    pub fn config_box(self) -> Option<FourCC> {
        let box_type = match self {
            Self::Hevc => BoxType::HevcConfigurationBox,
            Self::Avc => BoxType::AvcConfigurationBox,
            Self::Av1 => BoxType::Av1ConfigurationBox,
            Self::Vvc => BoxType::VvcConfigurationBox,
            Self::Jpeg => BoxType::JpegConfigurationBox,
            Self::Jpeg2000 => BoxType::Jpeg2000HeaderBox,
            Self::Uncompressed => return None,
        };
        Some(box_type.into())
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.item_type(), f)
    }
}

/// Input handed to a [`Decoder`]: one item's coded bytes.
#[derive(Debug, Clone, Copy)]
pub struct CodedImage<'a> {
    pub format: CompressionFormat,
    /// Payload of the item's codec configuration property, if it has one.
    pub config: Option<&'a [u8]>,
    /// All extents of the item, concatenated.
    pub data: &'a [u8],
}

/// How a decoder treats bitstream anomalies it can work around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeMode {
    /// Any anomaly is an error.
    Strict,
    /// Anomalies are reported as warnings next to the decoded image.
    #[default]
    Lenient,
}

/// Output of a [`Decoder`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pub image: Image,
    /// Non-fatal problems found while decoding.
    pub warnings: Vec<String>,
}

impl DecodedImage {
    pub fn new(image: Image) -> Self {
        Self {
            image,
            warnings: Vec::new(),
        }
    }
}

/// A decoding capability for one or more compression formats.
pub trait Decoder: Send + Sync {
    /// Identifier used to select this decoder explicitly.
    fn name(&self) -> &str;

    /// Priority for `format`, or `None` if this decoder cannot handle it. Higher wins.
    fn supports(&self, format: CompressionFormat) -> Option<u32>;

    fn decode(&self, input: &CodedImage<'_>, mode: DecodeMode) -> Result<DecodedImage, CodecError>;
}

/// Settings passed through to an [`Encoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingOptions {
    /// 0 (smallest) to 100 (best).
    pub quality: u8,
    pub lossless: bool,
    /// Chroma format the encoder should produce; `Undefined` lets the encoder choose.
    pub chroma: Chroma,
}

impl Default for EncodingOptions {
    fn default() -> Self {
        Self {
            quality: 50,
            lossless: false,
            chroma: Chroma::Undefined,
        }
    }
}

/// Output of an [`Encoder`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedImage {
    /// Payload of the codec configuration property to associate with the item.
    pub config: Option<Vec<u8>>,
    pub data: Vec<u8>,
}

/// An encoding capability for one or more compression formats.
pub trait Encoder: Send + Sync {
    fn name(&self) -> &str;

    /// Priority for `format`, or `None` if this encoder cannot produce it. Higher wins.
    fn supports(&self, format: CompressionFormat) -> Option<u32>;

    fn encode(&self, image: &Image, format: CompressionFormat, options: &EncodingOptions) -> Result<EncodedImage, CodecError>;
}

/// Registered codec capabilities.
///
/// Lookup by format returns the highest priority match; among equal priorities
/// the one registered first wins.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    decoders: Vec<Arc<dyn Decoder>>,
    encoders: Vec<Arc<dyn Encoder>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_decoder(&mut self, decoder: Arc<dyn Decoder>) {
        log::debug!("registered decoder '{}'", decoder.name());
        self.decoders.push(decoder);
    }

    pub fn register_encoder(&mut self, encoder: Arc<dyn Encoder>) {
        log::debug!("registered encoder '{}'", encoder.name());
        self.encoders.push(encoder);
    }

    #[must_use]
    pub fn decoder_for(&self, format: CompressionFormat) -> Option<&Arc<dyn Decoder>> {
        best(&self.decoders, |d| d.supports(format))
    }

    /// The decoder called `name`, if it handles `format`.
    ///
    /// An unknown name is a usage error; a known decoder that does not claim
    /// `format` is reported as an unsupported codec.
    pub fn decoder_named(&self, name: &str, format: CompressionFormat) -> crate::Result<&Arc<dyn Decoder>> {
        named(&self.decoders, name, |d| d.name(), |d| d.supports(format))
    }

    #[must_use]
    pub fn encoder_for(&self, format: CompressionFormat) -> Option<&Arc<dyn Encoder>> {
        best(&self.encoders, |e| e.supports(format))
    }

    /// The encoder called `name`, if it handles `format`.
    pub fn encoder_named(&self, name: &str, format: CompressionFormat) -> crate::Result<&Arc<dyn Encoder>> {
        named(&self.encoders, name, |e| e.name(), |e| e.supports(format))
    }

    /// Whether any registered decoder handles `format`.
    #[must_use]
    pub fn can_decode(&self, format: CompressionFormat) -> bool {
        self.decoder_for(format).is_some()
    }
}

fn best<T: ?Sized>(list: &[Arc<T>], priority: impl Fn(&T) -> Option<u32>) -> Option<&Arc<T>> {
    let mut found: Option<(u32, &Arc<T>)> = None;
    for candidate in list {
        if let Some(p) = priority(candidate) {
            if found.is_none_or(|(best, _)| p > best) {
                found = Some((p, candidate));
            }
        }
    }
    found.map(|(_, c)| c)
}

fn named<'a, T: ?Sized>(list: &'a [Arc<T>], name: &str, name_of: impl Fn(&T) -> &str, priority: impl Fn(&T) -> Option<u32>) -> crate::Result<&'a Arc<T>> {
    let mut known = false;
    for candidate in list {
        if name_of(candidate) != name {
            continue;
        }
        if priority(candidate).is_some() {
            return Ok(candidate);
        }
        known = true;
    }
    if known {
        Err(Error::Unsupported(SubCode::UnsupportedCodec, "the named codec does not handle the item's format"))
    } else {
        Err(Error::Usage(SubCode::UnsupportedParameter, "no codec with that name"))
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("decoders", &self.decoders.iter().map(|d| d.name()).collect::<Vec<_>>())
            .field("encoders", &self.encoders.iter().map(|e| e.name()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
struct Named(&'static str, CompressionFormat, u32);

#[cfg(test)]
impl Decoder for Named {
    fn name(&self) -> &str {
        self.0
    }

    fn supports(&self, format: CompressionFormat) -> Option<u32> {
        (format == self.1).then_some(self.2)
    }

    fn decode(&self, _: &CodedImage<'_>, _: DecodeMode) -> Result<DecodedImage, CodecError> {
        Err("not a real decoder".into())
    }
}

#[test]
fn highest_priority_decoder_wins() {
    let mut registry = CodecRegistry::new();
    registry.register_decoder(Arc::new(Named("slow", CompressionFormat::Hevc, 10)));
    registry.register_decoder(Arc::new(Named("fast", CompressionFormat::Hevc, 50)));
    registry.register_decoder(Arc::new(Named("also-fast", CompressionFormat::Hevc, 50)));
    registry.register_decoder(Arc::new(Named("av1", CompressionFormat::Av1, 1)));

    assert_eq!(registry.decoder_for(CompressionFormat::Hevc).unwrap().name(), "fast");
    assert_eq!(registry.decoder_for(CompressionFormat::Av1).unwrap().name(), "av1");
    assert!(registry.decoder_for(CompressionFormat::Jpeg).is_none());
}

#[test]
fn named_decoder_must_claim_the_format() {
    let mut registry = CodecRegistry::new();
    registry.register_decoder(Arc::new(Named("slow", CompressionFormat::Hevc, 10)));
    registry.register_decoder(Arc::new(Named("fast", CompressionFormat::Hevc, 50)));
    registry.register_decoder(Arc::new(Named("dual", CompressionFormat::Hevc, 1)));
    registry.register_decoder(Arc::new(Named("dual", CompressionFormat::Av1, 1)));

    assert_eq!(registry.decoder_named("slow", CompressionFormat::Hevc).unwrap().name(), "slow");
    assert!(registry.decoder_named("dual", CompressionFormat::Av1).is_ok());

    let err = registry.decoder_named("slow", CompressionFormat::Av1).err().unwrap();
    assert_eq!(err.subcode(), SubCode::UnsupportedCodec);
    assert_eq!(err.category(), crate::Category::UnsupportedFeature);

    let err = registry.decoder_named("missing", CompressionFormat::Hevc).err().unwrap();
    assert_eq!(err.subcode(), SubCode::UnsupportedParameter);
    assert_eq!(err.category(), crate::Category::UsageError);
}

#[test]
fn formats_follow_item_types() {
    for format in [
        CompressionFormat::Hevc,
        CompressionFormat::Avc,
        CompressionFormat::Av1,
        CompressionFormat::Vvc,
        CompressionFormat::Jpeg,
        CompressionFormat::Jpeg2000,
        CompressionFormat::Uncompressed,
    ] {
        assert_eq!(CompressionFormat::from_item_type(format.item_type()), Some(format));
    }
    assert_eq!(CompressionFormat::from_item_type(item_type::GRID), None);
    assert_eq!(CompressionFormat::Hevc.config_box(), Some(FourCC::new(b"hvcC")));
    assert_eq!(CompressionFormat::Uncompressed.config_box(), None);
}
