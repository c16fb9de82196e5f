// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! From an item id to pixels: codec dispatch, grid composition, alpha,
//! transforms and color conversion.

use crate::boxes::{item_type, reference_type};
use crate::codec::{CodecRegistry, CodedImage, CompressionFormat, DecodeMode, Decoder};
use crate::color::{self, ColorConversionOptions};
use crate::container::HeifFile;
use crate::grid::{self, GridDescriptor, GridPlan};
use crate::image::{Channel, Chroma, Colorspace, Image};
use crate::pool::DecodePool;
use crate::transform;
use crate::{Error, Result, SubCode, TryVec};
use enough::Stop;
use log::{debug, warn};
use std::sync::Arc;

/// Caller choices for decoding one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodingOptions {
    pub mode: DecodeMode,
    /// Return the image as coded, without its crop, rotation and mirror properties.
    pub ignore_transformations: bool,
    /// Use this decoder instead of the highest priority one for the format.
    pub decoder_id: Option<String>,
    pub color_conversion: ColorConversionOptions,
    /// Target colorspace; `Undefined` keeps the decoded one.
    pub colorspace: Colorspace,
    /// Target chroma; `Undefined` keeps the decoded one.
    pub chroma: Chroma,
}

impl Default for DecodingOptions {
    fn default() -> Self {
        Self {
            mode: DecodeMode::Lenient,
            ignore_transformations: false,
            decoder_id: None,
            color_conversion: ColorConversionOptions::default(),
            colorspace: Colorspace::Undefined,
            chroma: Chroma::Undefined,
        }
    }
}

/// Identity derivations may chain; grids may not nest.
const MAX_DERIVATION_DEPTH: u32 = 16;

/// One decode operation over a parsed file.
pub(crate) struct ImageDecoder<'a> {
    pub(crate) file: &'a HeifFile,
    pub(crate) registry: &'a CodecRegistry,
    pub(crate) pool: &'a DecodePool,
    pub(crate) options: &'a DecodingOptions,
    pub(crate) stop: &'a dyn Stop,
}

/// The part of a decode that runs on worker threads.
#[derive(Clone, Copy)]
struct CodecStage<'a> {
    file: &'a HeifFile,
    registry: &'a CodecRegistry,
    options: &'a DecodingOptions,
}

/// Coded bytes of one item, read ahead of dispatch.
struct CodedItem {
    id: u32,
    format: CompressionFormat,
    config: Option<TryVec<u8>>,
    data: TryVec<u8>,
}

impl ImageDecoder<'_> {
    /// Decode `id` with its alpha plane, transforms and the requested color conversion.
    pub(crate) fn decode(&self, id: u32) -> Result<Image> {
        let graph = self.file.graph();
        let mut image = self.decode_untransformed(id, 0)?;

        if let Some(alpha_id) = graph.alpha_image(id)? {
            debug!("item {id}: alpha from item {alpha_id}");
            self.attach_alpha(&mut image, alpha_id)?;
            image.premultiplied_alpha = graph.references.references_from(id, reference_type::PREMULTIPLIED).any(|to| to == alpha_id);
        }

        // container color properties override what the codec reported
        if let Some(nclx) = graph.properties.nclx_profile(id)? {
            image.nclx = Some(nclx);
        }
        if let Some(icc) = graph.properties.icc_profile(id)? {
            image.icc_profile = Some(icc.to_vec());
        }

        if !self.options.ignore_transformations {
            let transforms = graph.properties.transforms(id)?;
            image = transform::apply(image, &transforms)?;
        }

        let (colorspace, chroma) = target_format(&image, self.options.colorspace, self.options.chroma);
        color::convert(image, colorspace, chroma, &self.options.color_conversion)
    }

    /// Pixels of `id` as stored, before its own transforms.
    fn decode_untransformed(&self, id: u32, depth: u32) -> Result<Image> {
        if depth > MAX_DERIVATION_DEPTH {
            return Err(Error::InvalidData(SubCode::Unspecified, "derived image chain too deep"));
        }
        self.stop.check()?;
        let graph = self.file.graph();
        let item = graph.catalog.require(id)?;
        // fails on essential properties this crate cannot interpret
        graph.properties.properties_of(id)?;

        match item.item_type {
            item_type::GRID => self.decode_grid(id),
            item_type::IDENTITY => {
                let mut inputs = graph.references.references_from(id, reference_type::DERIVED_IMAGE);
                let (Some(source), None) = (inputs.next(), inputs.next()) else {
                    return Err(Error::InvalidData(SubCode::MissingGridImages, "identity derivation needs exactly one input"));
                };
                let mut image = self.decode_untransformed(source, depth + 1)?;
                // the source's own transforms still apply beneath the derived item's
                if !self.options.ignore_transformations {
                    image = transform::apply(image, &graph.properties.transforms(source)?)?;
                }
                Ok(image)
            },
            item_type::OVERLAY => Err(Error::Unsupported(SubCode::UnsupportedImageType, "overlay images are not supported")),
            other => {
                let Some(format) = CompressionFormat::from_item_type(other) else {
                    warn!("item {id} of type {other} is not an image");
                    return Err(Error::Unsupported(SubCode::UnsupportedImageType, "item is not a supported image type"));
                };
                let coded = self.read_coded(id, format)?;
                self.codec_stage().decode(&coded)
            },
        }
    }

    fn decode_grid(&self, id: u32) -> Result<Image> {
        let graph = self.file.graph();
        let descriptor = GridDescriptor::parse(&self.file.item_data(id)?)?;
        let plan = GridPlan::resolve(&graph.references, id, descriptor, self.file.config())?;

        let mut coded = Vec::new();
        coded.try_reserve_exact(plan.tiles.len()).map_err(|_| Error::OutOfMemory)?;
        for &tile in plan.tiles.iter() {
            self.stop.check()?;
            let item = graph.catalog.require(tile)?;
            let format = CompressionFormat::from_item_type(item.item_type)
                .ok_or(Error::Unsupported(SubCode::UnsupportedImageType, "grid tiles must be coded images"))?;
            graph.properties.properties_of(tile)?;
            coded.push(self.read_coded(tile, format)?);
        }

        debug!("grid {id}: {} tiles on {} threads", coded.len(), self.pool.threads());
        let stage = self.codec_stage();
        let tiles = self.pool.run(coded.len(), |i| stage.decode(&coded[i]))?;
        grid::compose(&plan, &tiles)
    }

    fn read_coded(&self, id: u32, format: CompressionFormat) -> Result<CodedItem> {
        let properties = &self.file.graph().properties;
        let config = match properties.codec_configuration(id)? {
            Some(c) if Some(c.box_type) == format.config_box() => {
                let mut bytes = TryVec::with_capacity(c.data.len())?;
                bytes.extend_from_slice(&c.data)?;
                Some(bytes)
            },
            _ => None,
        };
        Ok(CodedItem {
            id,
            format,
            config,
            data: self.file.item_data(id)?,
        })
    }

    fn codec_stage(&self) -> CodecStage<'_> {
        CodecStage {
            file: self.file,
            registry: self.registry,
            options: self.options,
        }
    }

    fn attach_alpha(&self, image: &mut Image, alpha_id: u32) -> Result<()> {
        let mut alpha = self.decode_untransformed(alpha_id, 1)?;
        if (alpha.width, alpha.height) != (image.width, image.height) {
            return Err(Error::InvalidData(SubCode::InvalidImageSize, "alpha image size differs from the color image"));
        }
        let plane = alpha
            .take_plane(Channel::Y)
            .ok_or(Error::InvalidData(SubCode::NonexistingImageChannelReferenced, "alpha image has no luma plane"))?;
        image.insert_plane(Channel::Alpha, plane)?;
        image.warnings.append(&mut alpha.warnings);
        Ok(())
    }
}

impl CodecStage<'_> {
    fn decoder(&self, format: CompressionFormat) -> Result<&Arc<dyn Decoder>> {
        match &self.options.decoder_id {
            Some(name) => self.registry.decoder_named(name, format),
            None => self
                .registry
                .decoder_for(format)
                .ok_or(Error::Unsupported(SubCode::UnsupportedCodec, "no decoder registered for the item's format")),
        }
    }

    /// Run the codec on one item.
    fn decode(&self, coded: &CodedItem) -> Result<Image> {
        let decoder = self.decoder(coded.format)?;
        let input = CodedImage {
            format: coded.format,
            config: coded.config.as_deref(),
            data: &coded.data,
        };
        let decoded = decoder
            .decode(&input, self.options.mode)
            .map_err(|e| Error::from_decoder(decoder.name(), e))?;

        if self.options.mode == DecodeMode::Strict && !decoded.warnings.is_empty() {
            let message = decoded.warnings.join("; ");
            return Err(Error::from_decoder(decoder.name(), message.into()));
        }
        let mut image = decoded.image;
        self.file.config().validate_dimensions(image.width, image.height)?;
        if let Some(ispe) = self.file.graph().properties.image_size(coded.id)? {
            if (ispe.width, ispe.height) != (image.width, image.height) {
                debug!(
                    "item {}: decoded {}x{}, ispe says {}x{}",
                    coded.id, image.width, image.height, ispe.width, ispe.height
                );
            }
        }
        for w in &decoded.warnings {
            warn!("item {}: {w}", coded.id);
        }
        image.warnings.extend(decoded.warnings);
        Ok(image)
    }
}

/// Fill in `Undefined` parts of the requested format from the decoded image.
fn target_format(image: &Image, colorspace: Colorspace, chroma: Chroma) -> (Colorspace, Chroma) {
    match (colorspace, chroma) {
        (Colorspace::Undefined, Chroma::Undefined) => (image.colorspace, image.chroma),
        (Colorspace::Undefined, c) if c.is_interleaved() => (Colorspace::Rgb, c),
        (Colorspace::Undefined, Chroma::Monochrome) => (Colorspace::Monochrome, Chroma::Monochrome),
        (Colorspace::Undefined, c) => (Colorspace::YCbCr, c),
        (Colorspace::Rgb, Chroma::Undefined) => (Colorspace::Rgb, Chroma::C444),
        (Colorspace::Monochrome, _) => (Colorspace::Monochrome, Chroma::Monochrome),
        (Colorspace::YCbCr, Chroma::Undefined) if image.colorspace == Colorspace::YCbCr => (Colorspace::YCbCr, image.chroma),
        (Colorspace::YCbCr, Chroma::Undefined) => (Colorspace::YCbCr, Chroma::C444),
        (cs, c) => (cs, c),
    }
}

#[test]
fn undefined_target_keeps_decoded_format() {
    let image = Image::new(4, 4, Colorspace::YCbCr, Chroma::C420);
    assert_eq!(target_format(&image, Colorspace::Undefined, Chroma::Undefined), (Colorspace::YCbCr, Chroma::C420));
    assert_eq!(target_format(&image, Colorspace::Undefined, Chroma::InterleavedRgba), (Colorspace::Rgb, Chroma::InterleavedRgba));
    assert_eq!(target_format(&image, Colorspace::Rgb, Chroma::Undefined), (Colorspace::Rgb, Chroma::C444));
    assert_eq!(target_format(&image, Colorspace::YCbCr, Chroma::Undefined), (Colorspace::YCbCr, Chroma::C420));
}
