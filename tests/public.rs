// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use heif_container::{
    ByteSource, Category, Channel, Chroma, ChromaDownsampling, CleanAperture, CodecError, CodedImage, ColorConversionOptions, ColorProfile, Colorspace, CompressionFormat,
    DecodeConfig, DecodeMode, DecodedImage, Decoder, DecodingOptions, EncodedImage, Encoder, EncodingOptions, FourCC, GridDescriptor, GrowStatus, HeifContext, HeifFile,
    HeifWriter, Image, ImageSpatialExtents, ItemProperty, MirrorAxis, NclxProfile, Region, RegionItem, Rotation, SubCode, TryVec, item_type, reference_type,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Payload layout understood by the mock codec:
/// width u16, height u16, kind u8 (0 = monochrome, 1 = YCbCr 4:4:4), flags u8 (bit 0 = emit a warning),
/// then the 8-bit samples of each plane.
const MONO: u8 = 0;
const YCBCR: u8 = 1;
const WARN: u8 = 1;

struct MockCodec;

impl Decoder for MockCodec {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports(&self, format: CompressionFormat) -> Option<u32> {
        (format == CompressionFormat::Hevc).then_some(100)
    }

    fn decode(&self, input: &CodedImage<'_>, _mode: DecodeMode) -> Result<DecodedImage, CodecError> {
        let data = input.data;
        if data.len() < 6 {
            return Err("truncated header".into());
        }
        let width = u32::from(u16::from_be_bytes([data[0], data[1]]));
        let height = u32::from(u16::from_be_bytes([data[2], data[3]]));
        let (colorspace, chroma, channels): (_, _, &[Channel]) = match data[4] {
            MONO => (Colorspace::Monochrome, Chroma::Monochrome, &[Channel::Y]),
            YCBCR => (Colorspace::YCbCr, Chroma::C444, &[Channel::Y, Channel::Cb, Channel::Cr]),
            _ => return Err("unknown kind".into()),
        };
        let mut samples = &data[6..];
        let plane_len = (width * height) as usize;
        if samples.len() < plane_len * channels.len() {
            return Err("truncated samples".into());
        }
        let mut image = Image::new(width, height, colorspace, chroma);
        for &channel in channels {
            let plane = image.add_plane(channel, 8).map_err(|e| e.to_string())?;
            for y in 0..height {
                for x in 0..width {
                    plane.set_sample(x, y, 0, u16::from(samples[(y * width + x) as usize]));
                }
            }
            samples = &samples[plane_len..];
        }
        let mut decoded = DecodedImage::new(image);
        if data[5] & WARN != 0 {
            decoded.warnings.push("corrected slice header".to_owned());
        }
        Ok(decoded)
    }
}

impl Encoder for MockCodec {
    fn name(&self) -> &str {
        "mock"
    }

    fn supports(&self, format: CompressionFormat) -> Option<u32> {
        (format == CompressionFormat::Hevc).then_some(100)
    }

    fn encode(&self, image: &Image, _format: CompressionFormat, _options: &EncodingOptions) -> Result<EncodedImage, CodecError> {
        let (kind, channels): (u8, &[Channel]) = match image.chroma {
            Chroma::Monochrome => (MONO, &[Channel::Y]),
            Chroma::C444 => (YCBCR, &[Channel::Y, Channel::Cb, Channel::Cr]),
            _ => return Err("unsupported chroma".into()),
        };
        let mut data = header(image.width, image.height, kind, 0);
        for &channel in channels {
            let plane = image.plane(channel).ok_or("missing plane")?;
            for y in 0..image.height {
                for x in 0..image.width {
                    data.push(plane.sample(x, y, 0) as u8);
                }
            }
        }
        Ok(EncodedImage {
            config: Some(vec![1, 2, 3]),
            data,
        })
    }
}

fn header(width: u32, height: u32, kind: u8, flags: u8) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&(width as u16).to_be_bytes());
    data.extend_from_slice(&(height as u16).to_be_bytes());
    data.push(kind);
    data.push(flags);
    data
}

fn mono_payload(width: u32, height: u32, flags: u8, pixel: impl Fn(u32, u32) -> u8) -> Vec<u8> {
    let mut data = header(width, height, MONO, flags);
    for y in 0..height {
        for x in 0..width {
            data.push(pixel(x, y));
        }
    }
    data
}

fn context() -> HeifContext {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut ctx = HeifContext::new();
    ctx.register_decoder(Arc::new(MockCodec));
    ctx.register_encoder(Arc::new(MockCodec));
    ctx
}

fn read(bytes: Vec<u8>) -> HeifContext {
    let mut ctx = context();
    ctx.read_from_bytes(bytes).expect("read_from_bytes failed");
    ctx
}

fn boxed(name: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(name);
    out.extend_from_slice(payload);
    out
}

fn ftyp() -> Vec<u8> {
    boxed(b"ftyp", b"mif1\0\0\0\0mif1heic")
}

fn hdlr(handler: &[u8; 4]) -> Vec<u8> {
    let mut payload = vec![0; 8];
    payload.extend_from_slice(handler);
    payload.extend_from_slice(&[0; 13]);
    boxed(b"hdlr", &payload)
}

fn meta(children: &[Vec<u8>]) -> Vec<u8> {
    let mut payload = vec![0; 4];
    for child in children {
        payload.extend_from_slice(child);
    }
    boxed(b"meta", &payload)
}

fn grid_file(flags_for_tile: impl Fn(u32) -> u8) -> Vec<u8> {
    let mut writer = HeifWriter::new();
    let mut tiles = Vec::new();
    for index in 0..6 {
        let payload = mono_payload(64, 64, flags_for_tile(index), |x, y| (index * 40 + (x + y) % 30) as u8);
        tiles.push(writer.add_item(item_type::HEVC, &payload).expect("add_item failed"));
    }
    let descriptor = GridDescriptor {
        rows: 2,
        columns: 3,
        output_width: 180,
        output_height: 100,
    };
    writer.add_grid(descriptor, &tiles).expect("add_grid failed");
    writer.to_bytes().expect("to_bytes failed")
}

fn sample(image: &Image, x: u32, y: u32) -> u16 {
    image.plane(Channel::Y).expect("no luma plane").sample(x, y, 0)
}

#[test]
fn graph_survives_rewrite() {
    let mut writer = HeifWriter::new();
    let image = writer.add_item(item_type::HEVC, &mono_payload(16, 8, 0, |x, y| (x + y) as u8)).unwrap();
    writer.add_item_property(image, ItemProperty::ImageSpatialExtents(ImageSpatialExtents { width: 16, height: 8 }), false).unwrap();
    writer.add_item_property(image, ItemProperty::Rotation(Rotation::Deg90), true).unwrap();
    writer.add_item_property(image, ItemProperty::Mirror(MirrorAxis::Horizontal), true).unwrap();
    writer.add_item_property(image, ItemProperty::ColorProfile(ColorProfile::Nclx(NclxProfile::default())), false).unwrap();
    let thumb = writer.add_item(item_type::HEVC, &mono_payload(4, 2, 0, |_, _| 9)).unwrap();
    writer.add_reference(reference_type::THUMBNAIL, thumb, &[image]).unwrap();
    writer.add_metadata_item(image, item_type::EXIF, b"\0\0\0\0Exif\0\0", None).unwrap();
    let regions = RegionItem {
        item_id: 0,
        reference_width: 16,
        reference_height: 8,
        regions: vec![Region::Point { x: 3, y: 4 }].into(),
    };
    writer.add_region_item(image, &regions).unwrap();
    let first = HeifFile::from_bytes(writer.to_bytes().unwrap()).expect("first parse failed");

    let rewritten = HeifWriter::from_file(&first).unwrap().to_bytes().unwrap();
    let second = HeifFile::from_bytes(rewritten).expect("second parse failed");

    assert_eq!(first.graph(), second.graph());
    assert_eq!(first.file_type(), second.file_type());
    for id in first.graph().catalog.item_ids() {
        assert_eq!(first.item_data(id).unwrap(), second.item_data(id).unwrap());
    }
    assert_eq!(second.graph().thumbnails(image), vec![thumb]);
    assert_eq!(second.graph().top_level_images(), vec![image]);
}

#[test]
fn transforms_apply_in_stored_order() {
    let base = mono_payload(60, 40, 0, |x, y| ((x + y * 7) % 256) as u8);
    let clap = CleanAperture::from_margins(60, 40, 10, 10, 10, 10).unwrap();

    let build = |rotate_first: bool| {
        let mut writer = HeifWriter::new();
        let id = writer.add_item(item_type::HEVC, &base).unwrap();
        let rotate = ItemProperty::Rotation(Rotation::Deg90);
        let crop = ItemProperty::CleanAperture(clap);
        let (a, b) = if rotate_first { (rotate, crop) } else { (crop, rotate) };
        writer.add_item_property(id, ItemProperty::ImageSpatialExtents(ImageSpatialExtents { width: 60, height: 40 }), false).unwrap();
        writer.add_item_property(id, a, true).unwrap();
        writer.add_item_property(id, b, true).unwrap();
        read(writer.to_bytes().unwrap())
    };

    let rotate_then_crop = build(true);
    let image = rotate_then_crop.decode_primary(&DecodingOptions::default()).unwrap();
    assert_eq!((image.width, image.height), (40, 20));
    assert_eq!(rotate_then_crop.image_size(rotate_then_crop.primary_image_id().unwrap()).unwrap(), (40, 20));
    // top-left came from the top row of the rotated frame's middle
    assert_eq!(sample(&image, 0, 0), 39);

    let crop_then_rotate = build(false);
    let image = crop_then_rotate.decode_primary(&DecodingOptions::default()).unwrap();
    assert_eq!((image.width, image.height), (20, 40));
    assert_eq!(crop_then_rotate.image_size(crop_then_rotate.primary_image_id().unwrap()).unwrap(), (20, 40));
    assert_eq!(sample(&image, 0, 0), 119);

    let options = DecodingOptions {
        ignore_transformations: true,
        ..DecodingOptions::default()
    };
    let raw = crop_then_rotate.decode_primary(&options).unwrap();
    assert_eq!((raw.width, raw.height), (60, 40));
}

#[test]
fn grid_tiles_are_clipped_at_the_edges() {
    let ctx = read(grid_file(|_| 0));
    let image = ctx.decode_primary(&DecodingOptions::default()).unwrap();
    assert_eq!((image.width, image.height), (180, 100));

    let expected = |tile: u32, lx: u32, ly: u32| u16::from((tile * 40 + (lx + ly) % 30) as u8);
    assert_eq!(sample(&image, 63, 0), expected(0, 63, 0));
    assert_eq!(sample(&image, 64, 0), expected(1, 0, 0));
    assert_eq!(sample(&image, 127, 63), expected(1, 63, 63));
    assert_eq!(sample(&image, 128, 63), expected(2, 0, 63));
    assert_eq!(sample(&image, 0, 64), expected(3, 0, 0));
    assert_eq!(sample(&image, 179, 99), expected(5, 51, 35));
}

#[test]
fn thread_count_does_not_change_output() {
    let bytes = grid_file(|_| 0);
    let mut outputs = Vec::new();
    for threads in [0, 1, 8] {
        let mut ctx = read(bytes.clone());
        ctx.set_max_decoding_threads(threads);
        outputs.push(ctx.decode_primary(&DecodingOptions::default()).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0], outputs[2]);
}

#[test]
fn failing_tile_fails_the_grid() {
    let mut writer = HeifWriter::new();
    let good = writer.add_item(item_type::HEVC, &mono_payload(8, 8, 0, |_, _| 1)).unwrap();
    let bad = writer.add_item(item_type::HEVC, &[0, 8]).unwrap();
    let grid = GridDescriptor {
        rows: 1,
        columns: 2,
        output_width: 16,
        output_height: 8,
    };
    writer.add_grid(grid, &[good, bad]).unwrap();
    let bytes = writer.to_bytes().unwrap();
    for threads in [0, 4] {
        let mut ctx = read(bytes.clone());
        ctx.set_max_decoding_threads(threads);
        let err = ctx.decode_primary(&DecodingOptions::default()).unwrap_err();
        assert_eq!(err.category(), Category::DecoderPlugin);
    }
}

#[test]
fn regions_map_onto_the_decoded_image() {
    let mut writer = HeifWriter::new();
    let image = writer.add_item(item_type::HEVC, &mono_payload(200, 100, 0, |_, _| 0)).unwrap();
    writer.add_item_property(image, ItemProperty::ImageSpatialExtents(ImageSpatialExtents { width: 200, height: 100 }), false).unwrap();
    writer.add_item_property(image, ItemProperty::Rotation(Rotation::Deg90), true).unwrap();
    let regions = RegionItem {
        item_id: 0,
        reference_width: 200,
        reference_height: 100,
        regions: vec![
            Region::Point { x: 40, y: 20 },
            Region::Rectangle {
                x: 10,
                y: 10,
                width: 30,
                height: 20,
            },
        ]
        .into(),
    };
    writer.add_region_item(image, &regions).unwrap();
    let ctx = read(writer.to_bytes().unwrap());

    let found = ctx.region_items(image).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].regions, regions.regions);

    let raw = ctx.untransformed_coordinate_mapper(&found[0], image).unwrap();
    assert_eq!(raw.map_point(40.0, 20.0), (40.0, 20.0));

    let mapper = ctx.coordinate_mapper(&found[0], image).unwrap();
    let (x, y) = mapper.map_point(40.0, 20.0);
    let decoded = ctx.decode_image(image, &DecodingOptions::default()).unwrap();
    assert!(x <= f64::from(decoded.width) && y <= f64::from(decoded.height));
    let (bx, by) = mapper.unmap_point(x, y);
    assert!((bx - 40.0).abs() < 1e-9 && (by - 20.0).abs() < 1e-9);
}

#[test]
fn essential_unknown_property_blocks_decoding() {
    let build = |essential: bool| {
        let mut writer = HeifWriter::new();
        let id = writer.add_item(item_type::HEVC, &mono_payload(4, 4, 0, |_, _| 7)).unwrap();
        let unknown = ItemProperty::Unknown {
            box_type: FourCC::new(b"zzzz"),
            data: TryVec::new(),
        };
        writer.add_item_property(id, unknown, essential).unwrap();
        read(writer.to_bytes().unwrap())
    };

    let err = build(true).decode_primary(&DecodingOptions::default()).unwrap_err();
    assert_eq!(err.category(), Category::UnsupportedFeature);
    assert_eq!(err.subcode(), SubCode::InvalidProperty);

    let image = build(false).decode_primary(&DecodingOptions::default()).unwrap();
    assert_eq!(sample(&image, 3, 3), 7);
}

#[test]
fn missing_boxes_have_their_own_subcodes() {
    let parse = |bytes: Vec<u8>| HeifFile::from_bytes(bytes).unwrap_err().subcode();

    assert_eq!(parse(boxed(b"free", &[])), SubCode::NoFtypBox);
    assert_eq!(parse(ftyp()), SubCode::NoMetaBox);
    assert_eq!(parse([ftyp(), meta(&[])].concat()), SubCode::NoHdlrBox);
    assert_eq!(parse([ftyp(), meta(&[hdlr(b"vide")])].concat()), SubCode::NoPictHandler);
    assert_eq!(parse([ftyp(), meta(&[hdlr(b"pict")])].concat()), SubCode::NoPitmBox);

    let mut truncated = ftyp();
    truncated[3] = 100;
    assert_eq!(parse(truncated), SubCode::EndOfData);
}

#[test]
fn meta_box_may_run_to_the_end_of_the_file() {
    let mut writer = HeifWriter::new();
    let id = writer.add_idat_item(item_type::HEVC, &mono_payload(3, 2, 0, |x, y| (x + y * 3) as u8)).unwrap();
    let mut bytes = writer.to_bytes().unwrap();
    let ftyp_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    assert_eq!(&bytes[ftyp_len + 4..ftyp_len + 8], b"meta");
    bytes[ftyp_len..ftyp_len + 4].copy_from_slice(&[0; 4]);

    let ctx = read(bytes);
    assert_eq!(ctx.primary_image_id().unwrap(), id);
    let image = ctx.decode_primary(&DecodingOptions::default()).unwrap();
    assert_eq!((image.width, image.height), (3, 2));
    assert_eq!(image.plane(Channel::Y).unwrap().sample(2, 1, 0), 5);
}

#[test]
fn limits_are_memory_errors() {
    let bytes = grid_file(|_| 0);

    let mut ctx = context();
    ctx.set_config(DecodeConfig::default().with_max_grid_tiles(4));
    ctx.read_from_bytes(bytes.clone()).unwrap();
    let err = ctx.decode_primary(&DecodingOptions::default()).unwrap_err();
    assert_eq!(err.category(), Category::MemoryLimit);

    let mut ctx = context();
    ctx.set_config(DecodeConfig::default().with_max_image_dimension(100));
    ctx.read_from_bytes(bytes.clone()).unwrap();
    let err = ctx.decode_primary(&DecodingOptions::default()).unwrap_err();
    assert_eq!(err.subcode(), SubCode::SecurityLimitExceeded);

    let mut ctx = context();
    ctx.set_config(DecodeConfig::default().with_peak_memory_limit(1024));
    let err = ctx
        .read_from_bytes(bytes)
        .and_then(|()| ctx.decode_primary(&DecodingOptions::default()).map(drop))
        .unwrap_err();
    assert_eq!(err.category(), Category::MemoryLimit);
}

/// A source whose visible length is controlled from outside.
struct GrowingSource {
    data: Vec<u8>,
    available: Arc<AtomicUsize>,
    position: u64,
}

impl ByteSource for GrowingSource {
    fn position(&self) -> u64 {
        self.position
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        let start = self.position as usize;
        let end = start + buf.len();
        if end > self.available.load(Ordering::SeqCst) {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.copy_from_slice(&self.data[start..end]);
        self.position = end as u64;
        Ok(())
    }

    fn seek(&mut self, position: u64) -> std::io::Result<()> {
        self.position = position;
        Ok(())
    }

    fn wait_for_size(&mut self, target_size: u64) -> GrowStatus {
        if target_size > self.data.len() as u64 {
            GrowStatus::SizeBeyondEof
        } else if target_size > self.available.load(Ordering::SeqCst) as u64 {
            GrowStatus::Timeout
        } else {
            GrowStatus::SizeReached
        }
    }
}

#[test]
fn graph_is_complete_before_media_data_arrives() {
    let bytes = grid_file(|_| 0);
    let mdat_start = bytes.windows(4).rposition(|w| w == b"mdat").unwrap() - 4;
    let available = Arc::new(AtomicUsize::new(mdat_start));
    let source = GrowingSource {
        data: bytes.clone(),
        available: available.clone(),
        position: 0,
    };

    let mut ctx = context();
    ctx.read_from_source(Box::new(source)).unwrap();
    let full = HeifFile::from_bytes(bytes.clone()).unwrap();
    assert_eq!(ctx.file().unwrap().graph(), full.graph());

    assert!(ctx.decode_primary(&DecodingOptions::default()).is_err());
    available.store(bytes.len(), Ordering::SeqCst);
    let image = ctx.decode_primary(&DecodingOptions::default()).unwrap();
    assert_eq!((image.width, image.height), (180, 100));
}

#[test]
fn strict_mode_rejects_codec_warnings() {
    let ctx = read(grid_file(|tile| if tile == 4 { WARN } else { 0 }));

    let image = ctx.decode_primary(&DecodingOptions::default()).unwrap();
    assert_eq!(image.warnings, vec!["corrected slice header".to_owned()]);

    let strict = DecodingOptions {
        mode: DecodeMode::Strict,
        ..DecodingOptions::default()
    };
    let err = ctx.decode_primary(&strict).unwrap_err();
    assert_eq!(err.category(), Category::DecoderPlugin);
}

#[test]
fn decoder_selection() {
    let mut writer = HeifWriter::new();
    let hevc = writer.add_item(item_type::HEVC, &mono_payload(2, 2, 0, |_, _| 1)).unwrap();
    let av1 = writer.add_item(item_type::AV1, b"not decodable here").unwrap();
    let ctx = read(writer.to_bytes().unwrap());

    assert!(ctx.can_decode(hevc).unwrap());
    assert!(!ctx.can_decode(av1).unwrap());
    let err = ctx.decode_image(av1, &DecodingOptions::default()).unwrap_err();
    assert_eq!(err.subcode(), SubCode::UnsupportedCodec);

    let named = DecodingOptions {
        decoder_id: Some("other".to_owned()),
        ..DecodingOptions::default()
    };
    let err = ctx.decode_image(hevc, &named).unwrap_err();
    assert_eq!(err.category(), Category::UsageError);
    assert_eq!(err.subcode(), SubCode::UnsupportedParameter);
}

#[test]
fn named_decoder_is_not_used_for_other_formats() {
    let mut writer = HeifWriter::new();
    let hevc = writer.add_item(item_type::HEVC, &mono_payload(2, 2, 0, |_, _| 1)).unwrap();
    let av1 = writer.add_item(item_type::AV1, &mono_payload(2, 2, 0, |_, _| 1)).unwrap();
    let ctx = read(writer.to_bytes().unwrap());

    let named = DecodingOptions {
        decoder_id: Some("mock".to_owned()),
        ..DecodingOptions::default()
    };
    let image = ctx.decode_image(hevc, &named).unwrap();
    assert_eq!((image.width, image.height), (2, 2));

    let err = ctx.decode_image(av1, &named).unwrap_err();
    assert_eq!(err.category(), Category::UnsupportedFeature);
    assert_eq!(err.subcode(), SubCode::UnsupportedCodec);
}

#[test]
fn forbidden_chroma_substitution_fails() {
    let mut payload = header(8, 8, YCBCR, 0);
    payload.extend((0..8 * 8 * 3).map(|i| (i % 200) as u8));
    let mut writer = HeifWriter::new();
    writer.add_item(item_type::HEVC, &payload).unwrap();
    let ctx = read(writer.to_bytes().unwrap());

    let mut options = DecodingOptions {
        colorspace: Colorspace::YCbCr,
        chroma: Chroma::C420,
        color_conversion: ColorConversionOptions {
            preferred_chroma_downsampling: ChromaDownsampling::SharpYuv,
            only_use_preferred_chroma_algorithm: true,
            ..ColorConversionOptions::default()
        },
        ..DecodingOptions::default()
    };
    let err = ctx.decode_primary(&options).unwrap_err();
    assert_eq!(err.subcode(), SubCode::UnsupportedColorConversion);

    options.color_conversion.only_use_preferred_chroma_algorithm = false;
    let image = ctx.decode_primary(&options).unwrap();
    assert_eq!(image.chroma, Chroma::C420);
    assert_eq!(image.plane(Channel::Cb).unwrap().width, 4);
}

#[test]
fn alpha_round_trips_through_the_encoder() {
    let ctx = context();
    let mut image = Image::new(6, 4, Colorspace::Monochrome, Chroma::Monochrome);
    let luma = image.add_plane(Channel::Y, 8).unwrap();
    for y in 0..4 {
        for x in 0..6 {
            luma.set_sample(x, y, 0, (x * 10 + y) as u16);
        }
    }
    let alpha = image.add_plane(Channel::Alpha, 8).unwrap();
    for y in 0..4 {
        for x in 0..6 {
            alpha.set_sample(x, y, 0, 255 - (x + y) as u16);
        }
    }
    image.premultiplied_alpha = true;

    let mut writer = HeifWriter::new();
    let id = ctx.encode_image(&mut writer, &image, CompressionFormat::Hevc, &EncodingOptions::default()).unwrap();
    let decoded_ctx = read(writer.to_bytes().unwrap());
    assert_eq!(decoded_ctx.top_level_image_ids().unwrap(), vec![id]);
    assert!(decoded_ctx.file().unwrap().file_type().has_brand(FourCC::new(b"heic")));

    let decoded = decoded_ctx.decode_image(id, &DecodingOptions::default()).unwrap();
    assert!(decoded.premultiplied_alpha);
    assert_eq!(decoded.plane(Channel::Y), image.plane(Channel::Y));
    assert_eq!(decoded.plane(Channel::Alpha), image.plane(Channel::Alpha));
}
