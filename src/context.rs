// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The embedder-facing context: registered codecs, limits, the decode pool and one parsed container.

use crate::boxes::reference_type;
use crate::codec::{CodecRegistry, CompressionFormat, Decoder, Encoder, EncodingOptions};
use crate::container::HeifFile;
use crate::decode::{DecodingOptions, ImageDecoder};
use crate::image::Image;
use crate::pool::DecodePool;
use crate::region::{CoordinateMapper, RegionItem};
use crate::source::{ByteSource, MemorySource};
use crate::transform::transformed_size;
use crate::writer::HeifWriter;
use crate::{DecodeConfig, Error, Result, SubCode};
use enough::{Stop, Unstoppable};
use log::debug;
use std::sync::Arc;

/// Entry point for reading, decoding and encoding.
///
/// Owns the registered codecs, the parse limits, the decode thread pool and at
/// most one parsed container. Independent contexts share nothing.
#[derive(Debug)]
pub struct HeifContext {
    registry: CodecRegistry,
    config: DecodeConfig,
    pool: DecodePool,
    file: Option<HeifFile>,
}

impl Default for HeifContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HeifContext {
    /// A context with default limits and one decode thread per available core.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DecodeConfig::default())
    }

    #[must_use]
    pub fn with_config(config: DecodeConfig) -> Self {
        Self {
            registry: CodecRegistry::new(),
            config,
            pool: DecodePool::with_threads(DecodePool::default_size()),
            file: None,
        }
    }

    pub fn config(&self) -> &DecodeConfig {
        &self.config
    }

    /// Limits used by the next `read_from_*` call.
    pub fn set_config(&mut self, config: DecodeConfig) {
        self.config = config;
    }

    pub fn register_decoder(&mut self, decoder: Arc<dyn Decoder>) {
        self.registry.register_decoder(decoder);
    }

    pub fn register_encoder(&mut self, encoder: Arc<dyn Encoder>) {
        self.registry.register_encoder(encoder);
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    /// Number of workers decoding grid tiles. Zero decodes on the calling thread.
    pub fn set_max_decoding_threads(&mut self, threads: usize) {
        if threads != self.pool.threads() {
            self.pool = DecodePool::with_threads(threads);
        }
    }

    #[must_use]
    pub fn max_decoding_threads(&self) -> usize {
        self.pool.threads()
    }

    pub fn read_from_bytes(&mut self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.read_from_source(Box::new(MemorySource::new(data)))
    }

    pub fn read_from_source(&mut self, source: Box<dyn ByteSource>) -> Result<()> {
        self.read_from_source_with_stop(source, &Unstoppable)
    }

    /// Parse `source`, replacing any previously loaded container.
    pub fn read_from_source_with_stop(&mut self, source: Box<dyn ByteSource>, stop: &dyn Stop) -> Result<()> {
        self.file = None;
        let file = HeifFile::parse(source, &self.config, stop)?;
        debug!(
            "parsed container: {} items, primary {}",
            file.graph().catalog.items().count(),
            file.primary_item()
        );
        self.file = Some(file);
        Ok(())
    }

    /// The loaded container.
    pub fn file(&self) -> Result<&HeifFile> {
        self.file
            .as_ref()
            .ok_or(Error::Usage(SubCode::Unspecified, "no container has been read"))
    }

    pub fn primary_image_id(&self) -> Result<u32> {
        Ok(self.file()?.primary_item())
    }

    /// Images meant to be shown on their own, primary first.
    pub fn top_level_image_ids(&self) -> Result<Vec<u32>> {
        Ok(self.file()?.graph().top_level_images())
    }

    /// Whether a registered decoder handles the coded item `id`.
    pub fn can_decode(&self, id: u32) -> Result<bool> {
        let item = self.file()?.graph().catalog.require(id)?;
        Ok(CompressionFormat::from_item_type(item.item_type).is_some_and(|f| self.registry.can_decode(f)))
    }

    /// Size of the image after its transforms, from its 'ispe' property.
    pub fn image_size(&self, id: u32) -> Result<(u32, u32)> {
        let (width, height) = self.untransformed_size(id)?;
        let transforms = self.file()?.graph().properties.transforms(id)?;
        transformed_size(&transforms, width, height)
    }

    fn untransformed_size(&self, id: u32) -> Result<(u32, u32)> {
        let file = self.file()?;
        file.graph().catalog.require(id)?;
        let ispe = file
            .graph()
            .properties
            .image_size(id)?
            .ok_or(Error::InvalidData(SubCode::InvalidImageSize, "image has no 'ispe' property"))?;
        Ok((ispe.width, ispe.height))
    }

    pub fn decode_image(&self, id: u32, options: &DecodingOptions) -> Result<Image> {
        self.decode_image_with_stop(id, options, &Unstoppable)
    }

    /// Decode `id`. `stop` is polled between items and grid tiles.
    pub fn decode_image_with_stop(&self, id: u32, options: &DecodingOptions, stop: &dyn Stop) -> Result<Image> {
        let decoder = ImageDecoder {
            file: self.file()?,
            registry: &self.registry,
            pool: &self.pool,
            options,
            stop,
        };
        decoder.decode(id)
    }

    pub fn decode_primary(&self, options: &DecodingOptions) -> Result<Image> {
        self.decode_image(self.primary_image_id()?, options)
    }

    /// Region annotations attached to `image`, in reference coordinates.
    pub fn region_items(&self, image: u32) -> Result<Vec<RegionItem>> {
        let file = self.file()?;
        let graph = file.graph();
        graph.catalog.require(image)?;
        let mut out = Vec::new();
        for id in graph.region_items(image) {
            let masks: Vec<u32> = graph.references.references_from(id, reference_type::MASK).collect();
            out.push(RegionItem::parse(id, &file.item_data(id)?, &masks)?);
        }
        Ok(out)
    }

    /// Maps `region`'s reference coordinates onto `image` as a default decode returns it.
    pub fn coordinate_mapper(&self, region: &RegionItem, image: u32) -> Result<CoordinateMapper> {
        let (width, height) = self.untransformed_size(image)?;
        let transforms = self.file()?.graph().properties.transforms(image)?;
        CoordinateMapper::new(region.reference_width, region.reference_height, width, height, &transforms)
    }

    /// Maps onto `image` as coded, ignoring its transforms.
    pub fn untransformed_coordinate_mapper(&self, region: &RegionItem, image: u32) -> Result<CoordinateMapper> {
        let (width, height) = self.untransformed_size(image)?;
        CoordinateMapper::new(region.reference_width, region.reference_height, width, height, &[])
    }

    /// Encode `image` into `writer` with this context's encoders.
    pub fn encode_image(&self, writer: &mut HeifWriter, image: &Image, format: CompressionFormat, options: &EncodingOptions) -> Result<u32> {
        writer.encode_image(&self.registry, image, format, options)
    }
}

#[test]
fn usage_before_read() {
    let ctx = HeifContext::new();
    assert_eq!(ctx.primary_image_id().unwrap_err().category(), crate::Category::UsageError);
    assert!(ctx.decode_primary(&DecodingOptions::default()).is_err());
}

#[test]
fn thread_count_is_adjustable() {
    let mut ctx = HeifContext::new();
    ctx.set_max_decoding_threads(0);
    assert_eq!(ctx.max_decoding_threads(), 0);
    ctx.set_max_decoding_threads(2);
    assert_eq!(ctx.max_decoding_threads(), 2);
}
