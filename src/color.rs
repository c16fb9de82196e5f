// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Colorspace, chroma layout and bit depth conversion of decoded images.
//!
//! Every conversion passes through full-resolution (4:4:4) planes of `u16`
//! samples. Chroma is upsampled on the way in and downsampled on the way out,
//! with the algorithm picked by [`ColorConversionOptions`].

use crate::image::{Channel, Chroma, Colorspace, Image, Plane};
use crate::property::NclxProfile;
use crate::{Error, Result, SubCode, ToUsize};
use log::{debug, trace};

/// How subsampled chroma is brought to full resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChromaUpsampling {
    NearestNeighbor,
    /// Weights of 3/4 and 1/4 to the nearest two chroma samples along each subsampled axis.
    #[default]
    Bilinear,
}

/// How full-resolution chroma is reduced for 4:2:0 and 4:2:2 output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChromaDownsampling {
    NearestNeighbor,
    #[default]
    Average,
    /// Averages in linear light before computing chroma. Only possible from RGB input.
    SharpYuv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorConversionOptions {
    pub preferred_chroma_downsampling: ChromaDownsampling,
    pub preferred_chroma_upsampling: ChromaUpsampling,
    /// Fail instead of substituting another algorithm when the preferred one cannot be used.
    pub only_use_preferred_chroma_algorithm: bool,
}

impl Default for ColorConversionOptions {
    fn default() -> Self {
        Self {
            preferred_chroma_downsampling: ChromaDownsampling::Average,
            preferred_chroma_upsampling: ChromaUpsampling::Bilinear,
            only_use_preferred_chroma_algorithm: true,
        }
    }
}

/// YCbCr matrix coefficients and range of one image.
#[derive(Debug, Clone, Copy)]
struct Matrix {
    kr: f32,
    kb: f32,
    identity: bool,
    full_range: bool,
}

impl Matrix {
    fn from_nclx(nclx: &NclxProfile) -> Self {
        let (kr, kb) = match nclx.matrix_coefficients {
            1 => (0.2126, 0.0722),
            4 => (0.30, 0.11),
            7 => (0.212, 0.087),
            9 | 10 => (0.2627, 0.0593),
            12 | 13 => chromaticity_derived(nclx),
            _ => (0.299, 0.114),
        };
        Self {
            kr,
            kb,
            identity: nclx.matrix_coefficients == 0,
            full_range: nclx.full_range,
        }
    }

    fn kg(&self) -> f32 {
        1.0 - self.kr - self.kb
    }
}

/// Kr and Kb computed from the primaries (ITU-T H.273 equations 39 to 44).
fn chromaticity_derived(nclx: &NclxProfile) -> (f32, f32) {
    let c = nclx.chromaticities();
    let (xr, yr) = c.red;
    let (xg, yg) = c.green;
    let (xb, yb) = c.blue;
    let (xw, yw) = c.white;
    let zr = 1.0 - (xr + yr);
    let zg = 1.0 - (xg + yg);
    let zb = 1.0 - (xb + yb);
    let zw = 1.0 - (xw + yw);
    let denom = yw * (xr * (yg * zb - yb * zg) + xg * (yb * zr - yr * zb) + xb * (yr * zg - yg * zr));
    if denom == 0.0 {
        return (0.299, 0.114);
    }
    let kr = yr * (xw * (yg * zb - yb * zg) + yw * (xb * zg - xg * zb) + zw * (xg * yb - xb * yg)) / denom;
    let kb = yb * (xw * (yr * zg - yg * zr) + yw * (xg * zr - xr * zg) + zw * (xr * yg - xg * yr)) / denom;
    (kr, kb)
}

/// Sample scaling for one bit depth.
#[derive(Debug, Clone, Copy)]
struct Levels {
    max: f32,
    scale: f32,
}

impl Levels {
    fn new(depth: u8) -> Self {
        Self {
            max: ((1u32 << depth) - 1) as f32,
            scale: 2f32.powi(i32::from(depth) - 8),
        }
    }

    fn quantize(&self, v: f32) -> u16 {
        (v * self.max).round().clamp(0.0, self.max) as u16
    }

    fn luma_in(&self, v: u16, full: bool) -> f32 {
        if full { f32::from(v) / self.max } else { (f32::from(v) - 16.0 * self.scale) / (219.0 * self.scale) }
    }

    fn chroma_in(&self, v: u16, full: bool) -> f32 {
        let mid = (self.max + 1.0) / 2.0;
        if full { (f32::from(v) - mid) / self.max } else { (f32::from(v) - 128.0 * self.scale) / (224.0 * self.scale) }
    }

    fn luma_out(&self, v: f32, full: bool) -> u16 {
        if full {
            self.quantize(v)
        } else {
            (v * 219.0 * self.scale + 16.0 * self.scale).round().clamp(0.0, self.max) as u16
        }
    }

    fn chroma_out(&self, v: f32, full: bool) -> u16 {
        let mid = (self.max + 1.0) / 2.0;
        if full {
            (v * self.max + mid).round().clamp(0.0, self.max) as u16
        } else {
            (v * 224.0 * self.scale + 128.0 * self.scale).round().clamp(0.0, self.max) as u16
        }
    }
}

/// Full-resolution planes in the middle of a conversion.
struct Planes444 {
    width: usize,
    height: usize,
    depth: u8,
    colorspace: Colorspace,
    /// Y, Cb, Cr or R, G, B. Monochrome uses only the first.
    c: [Vec<u16>; 3],
    alpha: Option<(Vec<u16>, u8)>,
}

fn alloc(len: usize) -> Result<Vec<u16>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
    v.resize(len, 0);
    Ok(v)
}

fn read_plane(plane: &Plane) -> Result<Vec<u16>> {
    let mut out = alloc(plane.width.to_usize() * plane.height.to_usize())?;
    let mut i = 0;
    for y in 0..plane.height {
        for x in 0..plane.width {
            out[i] = plane.sample(x, y, 0);
            i += 1;
        }
    }
    Ok(out)
}

/// Bring one subsampled plane to `width`×`height`.
fn upsample(plane: &Plane, sx: u32, sy: u32, width: usize, height: usize, mode: ChromaUpsampling) -> Result<Vec<u16>> {
    let src = read_plane(plane)?;
    let (pw, ph) = (plane.width.to_usize(), plane.height.to_usize());
    let mut out = alloc(width * height)?;
    match mode {
        ChromaUpsampling::NearestNeighbor => {
            for y in 0..height {
                let row = &src[(y >> sy).min(ph - 1) * pw..][..pw];
                for (x, v) in out[y * width..(y + 1) * width].iter_mut().enumerate() {
                    *v = row[(x >> sx).min(pw - 1)];
                }
            }
        },
        ChromaUpsampling::Bilinear => {
            // horizontal pass into a full-width buffer, then vertical
            let mut wide = alloc(width * ph)?;
            for (src_row, dst_row) in src.chunks_exact(pw).zip(wide.chunks_exact_mut(width)) {
                upsample_line(src_row, dst_row, sx);
            }
            for x in 0..width {
                let column: Vec<u16> = (0..ph).map(|y| wide[y * width + x]).collect();
                let mut dst = vec![0u16; height];
                upsample_line(&column, &mut dst, sy);
                for (y, v) in dst.into_iter().enumerate() {
                    out[y * width + x] = v;
                }
            }
        },
    }
    Ok(out)
}

/// Fancy upsampling of one line: each output takes 3/4 of its nearest input and 1/4 of the next nearest.
fn upsample_line(input: &[u16], output: &mut [u16], shift: u32) {
    if shift == 0 {
        output.copy_from_slice(&input[..output.len()]);
        return;
    }
    let last = input.len() - 1;
    for (x, out) in output.iter_mut().enumerate() {
        let k = (x / 2).min(last);
        let near = u32::from(input[k]);
        let far = u32::from(input[if x % 2 == 0 { k.saturating_sub(1) } else { (k + 1).min(last) }]);
        *out = ((3 * near + far + 2) >> 2) as u16;
    }
}

fn expand(image: &Image, upsampling: ChromaUpsampling) -> Result<Planes444> {
    let (width, height) = (image.width.to_usize(), image.height.to_usize());
    let missing = || Error::Usage(SubCode::NonexistingImageChannelReferenced, "image lacks a channel its chroma requires");
    let alpha = match image.plane(Channel::Alpha) {
        Some(p) => Some((read_plane(p)?, p.bit_depth)),
        None => None,
    };

    if let Some(components) = image.chroma.interleaved_components() {
        let plane = image.plane(Channel::Interleaved).ok_or_else(missing)?;
        let mut c = [alloc(width * height)?, alloc(width * height)?, alloc(width * height)?];
        let mut a = if components == 4 { Some(alloc(width * height)?) } else { None };
        for y in 0..image.height {
            for x in 0..image.width {
                let i = y.to_usize() * width + x.to_usize();
                for (ch, dst) in c.iter_mut().enumerate() {
                    dst[i] = plane.sample(x, y, ch as u8);
                }
                if let Some(a) = &mut a {
                    a[i] = plane.sample(x, y, 3);
                }
            }
        }
        return Ok(Planes444 {
            width,
            height,
            depth: plane.bit_depth,
            colorspace: Colorspace::Rgb,
            c,
            alpha: a.map(|a| (a, plane.bit_depth)).or(alpha),
        });
    }

    match (image.colorspace, image.chroma) {
        (Colorspace::Monochrome, _) | (_, Chroma::Monochrome) => {
            let y = image.plane(Channel::Y).ok_or_else(missing)?;
            Ok(Planes444 {
                width,
                height,
                depth: y.bit_depth,
                colorspace: Colorspace::Monochrome,
                c: [read_plane(y)?, Vec::new(), Vec::new()],
                alpha,
            })
        },
        (Colorspace::YCbCr, chroma) => {
            let y = image.plane(Channel::Y).ok_or_else(missing)?;
            let cb = image.plane(Channel::Cb).ok_or_else(missing)?;
            let cr = image.plane(Channel::Cr).ok_or_else(missing)?;
            if cb.bit_depth != y.bit_depth || cr.bit_depth != y.bit_depth {
                return Err(Error::Unsupported(SubCode::UnsupportedBitDepth, "chroma and luma bit depths differ"));
            }
            let (sx, sy) = chroma.subsampling();
            Ok(Planes444 {
                width,
                height,
                depth: y.bit_depth,
                colorspace: Colorspace::YCbCr,
                c: [
                    read_plane(y)?,
                    upsample(cb, sx, sy, width, height, upsampling)?,
                    upsample(cr, sx, sy, width, height, upsampling)?,
                ],
                alpha,
            })
        },
        (Colorspace::Rgb, Chroma::C444) => {
            let r = image.plane(Channel::R).ok_or_else(missing)?;
            let g = image.plane(Channel::G).ok_or_else(missing)?;
            let b = image.plane(Channel::B).ok_or_else(missing)?;
            Ok(Planes444 {
                width,
                height,
                depth: r.bit_depth.max(g.bit_depth).max(b.bit_depth),
                colorspace: Colorspace::Rgb,
                c: [read_plane(r)?, read_plane(g)?, read_plane(b)?],
                alpha,
            })
        },
        _ => Err(Error::Unsupported(SubCode::UnsupportedColorConversion, "unsupported source colorspace and chroma")),
    }
}

fn ycbcr_pixel_to_rgb(m: &Matrix, l: &Levels, y: u16, cb: u16, cr: u16) -> [u16; 3] {
    if m.identity {
        return [cr, y, cb];
    }
    let yf = l.luma_in(y, m.full_range);
    let cbf = l.chroma_in(cb, m.full_range);
    let crf = l.chroma_in(cr, m.full_range);
    let r = yf + 2.0 * (1.0 - m.kr) * crf;
    let b = yf + 2.0 * (1.0 - m.kb) * cbf;
    let g = (yf - m.kr * r - m.kb * b) / m.kg();
    [l.quantize(r), l.quantize(g), l.quantize(b)]
}

fn rgb_to_ycbcr_float(m: &Matrix, r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let y = m.kr * r + m.kg() * g + m.kb * b;
    (y, (b - y) / (2.0 * (1.0 - m.kb)), (r - y) / (2.0 * (1.0 - m.kr)))
}

fn rgb_pixel_to_ycbcr(m: &Matrix, l: &Levels, rgb: [u16; 3]) -> [u16; 3] {
    if m.identity {
        return [rgb[1], rgb[2], rgb[0]];
    }
    let [r, g, b] = rgb.map(|v| f32::from(v) / l.max);
    let (y, cb, cr) = rgb_to_ycbcr_float(m, r, g, b);
    [l.luma_out(y, m.full_range), l.chroma_out(cb, m.full_range), l.chroma_out(cr, m.full_range)]
}

fn to_rgb(mut p: Planes444, m: &Matrix) -> Result<Planes444> {
    let l = Levels::new(p.depth);
    match p.colorspace {
        Colorspace::Rgb => {},
        Colorspace::YCbCr => {
            for i in 0..p.width * p.height {
                let rgb = ycbcr_pixel_to_rgb(m, &l, p.c[0][i], p.c[1][i], p.c[2][i]);
                for (ch, v) in rgb.into_iter().enumerate() {
                    p.c[ch][i] = v;
                }
            }
        },
        _ => {
            let gray = std::mem::take(&mut p.c[0]);
            let mid = (l.max as u16 >> 1) + 1;
            let mut out = [alloc(gray.len())?, alloc(gray.len())?, alloc(gray.len())?];
            let m = Matrix { identity: false, ..*m };
            for (i, &y) in gray.iter().enumerate() {
                let rgb = ycbcr_pixel_to_rgb(&m, &l, y, mid, mid);
                for (ch, v) in rgb.into_iter().enumerate() {
                    out[ch][i] = v;
                }
            }
            p.c = out;
        },
    }
    p.colorspace = Colorspace::Rgb;
    Ok(p)
}

fn to_ycbcr(mut p: Planes444, m: &Matrix) -> Result<Planes444> {
    let l = Levels::new(p.depth);
    match p.colorspace {
        Colorspace::YCbCr => {},
        Colorspace::Rgb => {
            for i in 0..p.width * p.height {
                let ycc = rgb_pixel_to_ycbcr(m, &l, [p.c[0][i], p.c[1][i], p.c[2][i]]);
                for (ch, v) in ycc.into_iter().enumerate() {
                    p.c[ch][i] = v;
                }
            }
        },
        _ => {
            let len = p.c[0].len();
            let mid = (l.max as u16 >> 1) + 1;
            p.c[1] = alloc(len)?;
            p.c[2] = alloc(len)?;
            p.c[1].fill(mid);
            p.c[2].fill(mid);
        },
    }
    p.colorspace = Colorspace::YCbCr;
    Ok(p)
}

fn to_monochrome(mut p: Planes444, m: &Matrix) -> Result<Planes444> {
    if p.colorspace == Colorspace::Rgb {
        p = to_ycbcr(p, m)?;
    }
    p.c[1] = Vec::new();
    p.c[2] = Vec::new();
    p.colorspace = Colorspace::Monochrome;
    Ok(p)
}

fn srgb_to_linear(v: f32) -> f32 {
    if v <= 0.04045 { v / 12.92 } else { ((v + 0.055) / 1.055).powf(2.4) }
}

fn linear_to_srgb(v: f32) -> f32 {
    if v <= 0.003_130_8 { v * 12.92 } else { 1.055 * v.powf(1.0 / 2.4) - 0.055 }
}

/// Reduce full-resolution chroma planes by `(sx, sy)`.
///
/// `sharp` carries the RGB source when chroma is to be derived from linear-light block averages.
fn downsample(p: &Planes444, sx: u32, sy: u32, mode: ChromaDownsampling, m: &Matrix, sharp: Option<&[Vec<u16>; 3]>) -> Result<[Vec<u16>; 2]> {
    let (w, h) = (p.width, p.height);
    let (cw, ch) = (w.div_ceil(1 << sx), h.div_ceil(1 << sy));
    let mut out = [alloc(cw * ch)?, alloc(cw * ch)?];
    let l = Levels::new(p.depth);
    for cy in 0..ch {
        for cx in 0..cw {
            let y0 = cy << sy;
            let x0 = cx << sx;
            let ys = y0..(y0 + (1 << sy)).min(h);
            let xs = x0..(x0 + (1 << sx)).min(w);
            let i = cy * cw + cx;
            match (mode, sharp) {
                (ChromaDownsampling::SharpYuv, Some(rgb)) => {
                    let mut sum = [0f32; 3];
                    let mut n = 0f32;
                    for y in ys.clone() {
                        for x in xs.clone() {
                            for (s, plane) in sum.iter_mut().zip(rgb) {
                                *s += srgb_to_linear(f32::from(plane[y * w + x]) / l.max);
                            }
                            n += 1.0;
                        }
                    }
                    let [r, g, b] = sum.map(|s| linear_to_srgb(s / n));
                    let (_, cb, cr) = rgb_to_ycbcr_float(m, r, g, b);
                    out[0][i] = l.chroma_out(cb, m.full_range);
                    out[1][i] = l.chroma_out(cr, m.full_range);
                },
                (ChromaDownsampling::NearestNeighbor, _) => {
                    out[0][i] = p.c[1][y0 * w + x0];
                    out[1][i] = p.c[2][y0 * w + x0];
                },
                _ => {
                    let mut sum = [0u32; 2];
                    let mut n = 0u32;
                    for y in ys.clone() {
                        for x in xs.clone() {
                            sum[0] += u32::from(p.c[1][y * w + x]);
                            sum[1] += u32::from(p.c[2][y * w + x]);
                            n += 1;
                        }
                    }
                    out[0][i] = ((sum[0] + n / 2) / n) as u16;
                    out[1][i] = ((sum[1] + n / 2) / n) as u16;
                },
            }
        }
    }
    Ok(out)
}

fn rescale(v: u16, from: u8, to: u8) -> u16 {
    if from == to {
        return v;
    }
    let from_max = (1u32 << from) - 1;
    let to_max = (1u32 << to) - 1;
    ((u32::from(v) * to_max + from_max / 2) / from_max) as u16
}

fn write_plane(image: &mut Image, channel: Channel, samples: &[u16], from_depth: u8, depth: u8) -> Result<()> {
    let plane = image.add_plane(channel, depth)?;
    let width = plane.width;
    for (i, &v) in samples.iter().enumerate() {
        let i = i as u32;
        plane.set_sample(i % width, i / width, 0, rescale(v, from_depth, depth));
    }
    Ok(())
}

fn check_target(colorspace: Colorspace, chroma: Chroma) -> Result<()> {
    let valid = match colorspace {
        Colorspace::YCbCr => matches!(chroma, Chroma::C420 | Chroma::C422 | Chroma::C444),
        Colorspace::Rgb => chroma == Chroma::C444 || chroma.is_interleaved(),
        Colorspace::Monochrome => chroma == Chroma::Monochrome,
        Colorspace::Undefined => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Usage(SubCode::UnsupportedColorConversion, "invalid colorspace and chroma combination"))
    }
}

/// Convert `image` to `colorspace` and `chroma`.
///
/// Interleaved 8-bit layouts are always 8 bits deep; the 16-bit layouts keep the source
/// depth when it is above 8 and scale 8-bit sources to 16. Planar output keeps the source depth.
pub(crate) fn convert(image: Image, colorspace: Colorspace, chroma: Chroma, options: &ColorConversionOptions) -> Result<Image> {
    if image.colorspace == colorspace && image.chroma == chroma {
        return Ok(image);
    }
    check_target(colorspace, chroma)?;
    debug!(
        "converting {:?}/{:?} to {:?}/{:?}",
        image.colorspace, image.chroma, colorspace, chroma
    );

    let nclx = image.nclx.unwrap_or_default();
    let m = Matrix::from_nclx(&nclx);
    let p = expand(&image, options.preferred_chroma_upsampling)?;
    let source_depth = p.depth;
    let mut out = image.empty_like(image.width, image.height);
    out.colorspace = colorspace;
    out.chroma = chroma;
    out.warnings = image.warnings;

    if let Some(components) = chroma.interleaved_components() {
        let p = to_rgb(p, &m)?;
        let depth = match chroma {
            Chroma::InterleavedRgb | Chroma::InterleavedRgba => 8,
            _ if source_depth > 8 => source_depth,
            _ => 16,
        };
        let alpha = p.alpha.as_ref();
        let plane = out.add_plane(Channel::Interleaved, depth)?;
        for y in 0..image.height {
            for x in 0..image.width {
                let i = y.to_usize() * p.width + x.to_usize();
                for ch in 0..3u8 {
                    plane.set_sample(x, y, ch, rescale(p.c[usize::from(ch)][i], source_depth, depth));
                }
                if components == 4 {
                    let a = alpha.map_or(((1u32 << depth) - 1) as u16, |(a, ad)| rescale(a[i], *ad, depth));
                    plane.set_sample(x, y, 3, a);
                }
            }
        }
        return Ok(out);
    }

    let p = match colorspace {
        Colorspace::Rgb => to_rgb(p, &m)?,
        Colorspace::Monochrome => to_monochrome(p, &m)?,
        _ => {
            let (sx, sy) = chroma.subsampling();
            let mut mode = options.preferred_chroma_downsampling;
            if mode == ChromaDownsampling::SharpYuv && p.colorspace != Colorspace::Rgb && (sx, sy) != (0, 0) {
                if options.only_use_preferred_chroma_algorithm {
                    return Err(Error::Unsupported(
                        SubCode::UnsupportedColorConversion,
                        "sharp chroma downsampling needs RGB input",
                    ));
                }
                trace!("sharp downsampling unavailable, averaging instead");
                mode = ChromaDownsampling::Average;
            }
            let rgb = if p.colorspace == Colorspace::Rgb && mode == ChromaDownsampling::SharpYuv {
                Some([p.c[0].clone(), p.c[1].clone(), p.c[2].clone()])
            } else {
                None
            };
            let mut p = to_ycbcr(p, &m)?;
            if (sx, sy) != (0, 0) {
                let [cb, cr] = downsample(&p, sx, sy, mode, &m, rgb.as_ref())?;
                p.c[1] = cb;
                p.c[2] = cr;
            }
            p
        },
    };

    let channels: &[Channel] = match colorspace {
        Colorspace::Rgb => &[Channel::R, Channel::G, Channel::B],
        Colorspace::Monochrome => &[Channel::Y],
        _ => &[Channel::Y, Channel::Cb, Channel::Cr],
    };
    for (channel, samples) in channels.iter().zip(&p.c) {
        write_plane(&mut out, *channel, samples, p.depth, p.depth)?;
    }
    if let Some((alpha, depth)) = &p.alpha {
        write_plane(&mut out, Channel::Alpha, alpha, *depth, *depth)?;
    }
    Ok(out)
}

/// Bring a subsampled YCbCr image to 4:4:4 by nearest-neighbor replication.
pub(crate) fn to_chroma_444(image: &Image) -> Result<Image> {
    let options = ColorConversionOptions {
        preferred_chroma_upsampling: ChromaUpsampling::NearestNeighbor,
        ..ColorConversionOptions::default()
    };
    convert(image.clone(), image.colorspace, Chroma::C444, &options)
}

#[cfg(test)]
fn flat_ycbcr(width: u32, height: u32, chroma: Chroma, depth: u8, ycc: [u16; 3]) -> Image {
    let mut image = Image::new(width, height, Colorspace::YCbCr, chroma);
    for (channel, v) in [Channel::Y, Channel::Cb, Channel::Cr].into_iter().zip(ycc) {
        let plane = image.add_plane(channel, depth).unwrap();
        for y in 0..plane.height {
            for x in 0..plane.width {
                plane.set_sample(x, y, 0, v);
            }
        }
    }
    image
}

#[test]
fn gray_ycbcr_to_rgb() {
    let image = flat_ycbcr(4, 4, Chroma::C420, 8, [128, 128, 128]);
    let rgb = convert(image, Colorspace::Rgb, Chroma::InterleavedRgb, &ColorConversionOptions::default()).unwrap();
    let plane = rgb.plane(Channel::Interleaved).unwrap();
    assert_eq!(plane.row(3), &[128; 12][..]);
}

#[test]
fn interleaved_deep_output_depth() {
    let image = flat_ycbcr(2, 2, Chroma::C444, 10, [1023, 512, 512]);
    let out = convert(image, Colorspace::Rgb, Chroma::InterleavedRrggbbaaLe, &ColorConversionOptions::default()).unwrap();
    let plane = out.plane(Channel::Interleaved).unwrap();
    assert_eq!(plane.bit_depth, 10);
    assert_eq!(plane.sample(1, 1, 0), 1023);
    assert_eq!(plane.sample(1, 1, 3), 1023);

    let image = flat_ycbcr(2, 2, Chroma::C444, 8, [255, 128, 128]);
    let out = convert(image, Colorspace::Rgb, Chroma::InterleavedRrggbbBe, &ColorConversionOptions::default()).unwrap();
    let plane = out.plane(Channel::Interleaved).unwrap();
    assert_eq!(plane.bit_depth, 16);
    assert_eq!(plane.sample(0, 0, 1), 65535);
    assert_eq!(&plane.row(0)[..2], &[0xFF, 0xFF]);
}

#[test]
fn sharp_downsampling_needs_rgb() {
    let image = flat_ycbcr(4, 4, Chroma::C444, 8, [100, 90, 160]);
    let strict = ColorConversionOptions {
        preferred_chroma_downsampling: ChromaDownsampling::SharpYuv,
        only_use_preferred_chroma_algorithm: true,
        ..ColorConversionOptions::default()
    };
    let err = convert(image.clone(), Colorspace::YCbCr, Chroma::C420, &strict).unwrap_err();
    assert_eq!(err.subcode(), SubCode::UnsupportedColorConversion);

    let relaxed = ColorConversionOptions {
        only_use_preferred_chroma_algorithm: false,
        ..strict
    };
    let out = convert(image, Colorspace::YCbCr, Chroma::C420, &relaxed).unwrap();
    let cr = out.plane(Channel::Cr).unwrap();
    assert_eq!((cr.width, cr.height), (2, 2));
    assert_eq!(cr.sample(1, 1, 0), 160);
}

#[test]
fn rgb_to_420_and_back_keeps_flat_color() {
    let mut image = Image::new(5, 3, Colorspace::Rgb, Chroma::C444);
    for (channel, v) in [(Channel::R, 200u16), (Channel::G, 40), (Channel::B, 90)] {
        let plane = image.add_plane(channel, 8).unwrap();
        plane.data.fill(v as u8);
    }
    let options = ColorConversionOptions {
        preferred_chroma_downsampling: ChromaDownsampling::SharpYuv,
        ..ColorConversionOptions::default()
    };
    let ycc = convert(image, Colorspace::YCbCr, Chroma::C420, &options).unwrap();
    assert_eq!(ycc.plane(Channel::Cb).unwrap().width, 3);
    let rgb = convert(ycc, Colorspace::Rgb, Chroma::C444, &options).unwrap();
    for (channel, v) in [(Channel::R, 200i32), (Channel::G, 40), (Channel::B, 90)] {
        let got = i32::from(rgb.plane(channel).unwrap().sample(4, 2, 0));
        assert!((got - v).abs() <= 2, "{channel:?}: {got} vs {v}");
    }
}

#[test]
fn bilinear_line_weights() {
    let mut out = [0u16; 6];
    upsample_line(&[0, 100, 200], &mut out, 1);
    assert_eq!(out, [0, 25, 75, 125, 175, 200]);
}
