// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ISO base media box framing: headers, nested box iteration, limits, and box writing.

use crate::boxes::{BoxType, FourCC};
use crate::source::SourceReader;
use crate::{DecodeConfig, Error, Result, SubCode, ToU64, TryVec};
use byteorder::{ReadBytesExt, WriteBytesExt};
use log::debug;
use std::cell::Cell;
use std::io::{Read, Take};

/// Basic ISO box structure.
///
/// Files are a sequence of possibly-nested 'box' structures.  Each box
/// begins with a header describing the length of the box's data and a
/// four-byte box type which identifies the type of the box. Together these
/// are enough to interpret the contents of that section of the file.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy)]
pub(crate) struct BoxHeader {
    /// Box type.
    pub(crate) name: BoxType,
    /// Size of the box in bytes, `u64::MAX` when the box runs to the end of its container.
    pub(crate) size: u64,
    /// Offset to the start of the contained data (or header size).
    pub(crate) offset: u64,
    /// Uuid for extended type.
    #[allow(unused)]
    pub(crate) uuid: Option<[u8; 16]>,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    pub(crate) const MIN_SIZE: u64 = 8;
    /// 4-byte size + 4-byte type + 8-byte size
    pub(crate) const MIN_LARGE_SIZE: u64 = 16;

    pub(crate) fn runs_to_end(&self) -> bool {
        self.size == u64::MAX
    }
}

/// Remaining bytes of the container a box is read from, if it is bounded.
pub(crate) trait Remaining {
    fn remaining(&self) -> Option<u64>;
}

impl Remaining for SourceReader<'_> {
    fn remaining(&self) -> Option<u64> {
        None
    }
}

/// Tracks allocations made for box payloads against the configured limits.
///
/// Uses interior mutability so that every parser can take it by shared reference.
pub(crate) struct ResourceTracker<'a> {
    config: &'a DecodeConfig,
    current_memory: Cell<u64>,
    peak_memory: Cell<u64>,
}

impl<'a> ResourceTracker<'a> {
    pub(crate) fn new(config: &'a DecodeConfig) -> Self {
        Self {
            config,
            current_memory: Cell::new(0),
            peak_memory: Cell::new(0),
        }
    }

    pub(crate) fn config(&self) -> &'a DecodeConfig {
        self.config
    }

    pub(crate) fn lenient(&self) -> bool {
        self.config.lenient
    }

    pub(crate) fn reserve(&self, bytes: u64) -> Result<()> {
        let current = self.current_memory.get().saturating_add(bytes);
        self.current_memory.set(current);
        self.peak_memory.set(self.peak_memory.get().max(current));

        if let Some(limit) = self.config.peak_memory_limit {
            if self.peak_memory.get() > limit {
                return Err(Error::ResourceLimitExceeded("peak memory limit exceeded"));
            }
        }

        Ok(())
    }

    pub(crate) fn validate_items(&self, count: u32) -> Result<()> {
        if let Some(limit) = self.config.max_items {
            if count > limit {
                return Err(Error::ResourceLimitExceeded("item count limit exceeded"));
            }
        }
        Ok(())
    }

    pub(crate) fn validate_extents(&self, count: u16) -> Result<()> {
        if let Some(limit) = self.config.max_extents_per_item {
            if u32::from(count) > limit {
                return Err(Error::ResourceLimitExceeded("extent count limit exceeded"));
            }
        }
        Ok(())
    }
}

/// See ISO 14496-12:2015 § 4.2
pub(crate) struct BMFFBox<'a, T> {
    pub(crate) head: BoxHeader,
    pub(crate) content: Take<&'a mut T>,
}

impl<T: Read> BMFFBox<'_, T> {
    pub(crate) fn read_into_try_vec(&mut self, tracker: &ResourceTracker<'_>) -> Result<TryVec<u8>> {
        let limit = self.content.limit();
        // For size=0 boxes the limit is close to u64::MAX; those are read without pre-allocation
        let mut vec = if limit >= u64::MAX - BoxHeader::MIN_LARGE_SIZE {
            std::vec::Vec::new()
        } else {
            tracker.reserve(limit)?;
            let mut v = std::vec::Vec::new();
            v.try_reserve_exact(usize::try_from(limit)?)
                .map_err(|_| Error::OutOfMemory)?;
            v
        };
        self.content.read_to_end(&mut vec)?;
        if vec.len().to_u64() != limit && !self.head.runs_to_end() {
            return Err(Error::UnexpectedEOF);
        }
        Ok(vec.into())
    }

    pub(crate) fn bytes_left(&self) -> u64 {
        self.content.limit()
    }

    pub(crate) const fn get_header(&self) -> &BoxHeader {
        &self.head
    }

    pub(crate) fn box_iter(&mut self, tracker: &ResourceTracker<'_>) -> BoxIter<'_, Self> {
        BoxIter::new(self, tracker.config().max_children_per_box)
    }
}

impl<T> Remaining for BMFFBox<'_, T> {
    fn remaining(&self) -> Option<u64> {
        Some(self.content.limit())
    }
}

impl<T: Read> Read for BMFFBox<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.content.read(buf)
    }
}

impl<T> Drop for BMFFBox<'_, T> {
    fn drop(&mut self) {
        if self.content.limit() > 0 && !self.head.runs_to_end() {
            let name: FourCC = From::from(self.head.name);
            debug!("Dropping {} bytes in '{}'", self.content.limit(), name);
        }
    }
}

pub(crate) struct BoxIter<'a, T> {
    src: &'a mut T,
    children: u32,
    max_children: Option<u32>,
}

impl<T: Read + Remaining> BoxIter<'_, T> {
    fn new(src: &mut T, max_children: Option<u32>) -> BoxIter<'_, T> {
        BoxIter {
            src,
            children: 0,
            max_children,
        }
    }

    pub(crate) fn next_box(&mut self) -> Result<Option<BMFFBox<'_, T>>> {
        if self.src.remaining() == Some(0) {
            return Ok(None);
        }
        let h = match read_box_header(self.src) {
            Ok(h) => h,
            Err(Error::UnexpectedEOF) if self.src.remaining().is_none() => return Ok(None),
            Err(Error::UnexpectedEOF) => return Err(Error::InvalidData(SubCode::InvalidBoxSize, "truncated child box header")),
            Err(e) => return Err(e),
        };

        self.children += 1;
        if let Some(limit) = self.max_children {
            if self.children > limit {
                return Err(Error::ResourceLimitExceeded("too many children in box"));
            }
        }

        let content_len = match (h.runs_to_end(), self.src.remaining()) {
            (true, Some(left)) => left,
            (true, None) => u64::MAX - h.offset,
            (false, left) => {
                let len = h.size - h.offset;
                if left.is_some_and(|left| len > left) {
                    return Err(Error::InvalidData(SubCode::InvalidBoxSize, "child box larger than its parent"));
                }
                len
            },
        };
        Ok(Some(BMFFBox {
            head: h,
            content: self.src.take(content_len),
        }))
    }
}

/// Read and parse a box header.
///
/// Call this first to determine the type of a particular box
/// and its length. Used internally for dispatching to specific
/// parsers for the internal content, or to get the length to
/// skip unknown or uninteresting boxes.
///
/// See ISO 14496-12:2015 § 4.2
pub(crate) fn read_box_header<T: ReadBytesExt>(src: &mut T) -> Result<BoxHeader> {
    let size32 = be_u32(src)?;
    let name = BoxType::from(be_u32(src)?);
    let size = match size32 {
        // valid only for top-level box and indicates it's the last box in the file.  usually mdat.
        0 => u64::MAX,
        1 => {
            let size64 = be_u64(src)?;
            if size64 < BoxHeader::MIN_LARGE_SIZE {
                return Err(Error::InvalidData(SubCode::InvalidBoxSize, "malformed wide size"));
            }
            size64
        },
        _ => {
            if u64::from(size32) < BoxHeader::MIN_SIZE {
                return Err(Error::InvalidData(SubCode::InvalidBoxSize, "malformed size"));
            }
            u64::from(size32)
        },
    };
    let mut offset = match size32 {
        1 => BoxHeader::MIN_LARGE_SIZE,
        _ => BoxHeader::MIN_SIZE,
    };
    let uuid = if name == BoxType::UuidBox {
        if size >= offset + 16 {
            let mut buffer = [0u8; 16];
            src.read_exact(&mut buffer)?;
            offset += 16;
            Some(buffer)
        } else {
            return Err(Error::InvalidData(SubCode::InvalidBoxSize, "uuid box too small for its extended type"));
        }
    } else {
        None
    };
    if offset > size {
        return Err(Error::InvalidData(SubCode::InvalidBoxSize, "box header larger than box"));
    }
    Ok(BoxHeader { name, size, offset, uuid })
}

/// Parse the extra header fields for a full box.
pub(crate) fn read_fullbox_extra<T: ReadBytesExt>(src: &mut T) -> Result<(u8, u32)> {
    let version = src.read_u8()?;
    let flags_a = src.read_u8()?;
    let flags_b = src.read_u8()?;
    let flags_c = src.read_u8()?;
    Ok((
        version,
        u32::from(flags_a) << 16 | u32::from(flags_b) << 8 | u32::from(flags_c),
    ))
}

// Parse the extra fields for a full box whose flag fields must be zero.
pub(crate) fn read_fullbox_version_no_flags<T: ReadBytesExt>(src: &mut T, tracker: &ResourceTracker<'_>) -> Result<u8> {
    let (version, flags) = read_fullbox_extra(src)?;

    if flags != 0 && !tracker.lenient() {
        return Err(Error::Unsupported(SubCode::Unspecified, "expected flags to be 0"));
    }

    Ok(version)
}

/// Skip over the entire contents of a box.
pub(crate) fn skip_box_content<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    debug!("{:?} (skipped)", src.get_header());
    let to_skip = src.bytes_left();
    skip(src, to_skip)
}

/// Skip over the remain data of a box.
pub(crate) fn skip_box_remain<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    let remain = {
        let header = src.get_header();
        let len = src.bytes_left();
        debug!("remain {len} (skipped) in {header:?}");
        len
    };
    skip(src, remain)
}

#[cfg_attr(debug_assertions, track_caller)]
pub(crate) fn check_parser_state<T>(header: &BoxHeader, left: &Take<T>) -> Result<(), Error> {
    let limit = left.limit();
    // Allow fully consumed boxes, or size=0 boxes (where original size was u64::MAX)
    if limit == 0 || header.runs_to_end() {
        Ok(())
    } else {
        Err(Error::InvalidData(SubCode::InvalidBoxSize, "unread box content or bad parser sync"))
    }
}

/// Read a NUL-terminated UTF-8 string, or the rest of the box if no terminator follows.
pub(crate) fn read_c_string<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<std::string::String> {
    let mut bytes = std::vec::Vec::new();
    while src.bytes_left() > 0 {
        match src.read_u8()? {
            0 => break,
            b => {
                bytes.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
                bytes.push(b);
            },
        }
    }
    Ok(std::string::String::from_utf8(bytes)?)
}

/// Skip a number of bytes that we don't care to parse.
pub(crate) fn skip<T: Read>(src: &mut T, bytes: u64) -> Result<()> {
    let copied = std::io::copy(&mut src.take(bytes), &mut std::io::sink())?;
    if copied != bytes {
        return Err(Error::UnexpectedEOF);
    }
    Ok(())
}

pub(crate) fn be_u16<T: ReadBytesExt>(src: &mut T) -> Result<u16> {
    src.read_u16::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn be_u32<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u32::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn be_i32<T: ReadBytesExt>(src: &mut T) -> Result<i32> {
    src.read_i32::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn be_u64<T: ReadBytesExt>(src: &mut T) -> Result<u64> {
    src.read_u64::<byteorder::BigEndian>().map_err(From::from)
}

/// Append a box of type `fourcc` whose payload is produced by `body`.
///
/// The size field is patched once the payload is known; payloads past 4GB use the 64-bit form.
pub(crate) fn write_box<F>(out: &mut std::vec::Vec<u8>, fourcc: FourCC, body: F) -> Result<()>
where
    F: FnOnce(&mut std::vec::Vec<u8>) -> Result<()>,
{
    let mut payload = std::vec::Vec::new();
    body(&mut payload)?;
    let size = payload.len().to_u64() + BoxHeader::MIN_SIZE;
    out.try_reserve(payload.len() + BoxHeader::MIN_LARGE_SIZE as usize)
        .map_err(|_| Error::OutOfMemory)?;
    if let Ok(size32) = u32::try_from(size) {
        out.write_u32::<byteorder::BigEndian>(size32)?;
        out.write_u32::<byteorder::BigEndian>(u32::from(fourcc))?;
    } else {
        out.write_u32::<byteorder::BigEndian>(1)?;
        out.write_u32::<byteorder::BigEndian>(u32::from(fourcc))?;
        out.write_u64::<byteorder::BigEndian>(size + 8)?;
    }
    out.extend_from_slice(&payload);
    Ok(())
}

/// Append a full box: a box whose payload starts with version and 24-bit flags.
pub(crate) fn write_full_box<F>(out: &mut std::vec::Vec<u8>, fourcc: FourCC, version: u8, flags: u32, body: F) -> Result<()>
where
    F: FnOnce(&mut std::vec::Vec<u8>) -> Result<()>,
{
    write_box(out, fourcc, |payload| {
        payload.write_u8(version)?;
        payload.write_u24::<byteorder::BigEndian>(flags & 0x00FF_FFFF)?;
        body(payload)
    })
}

#[cfg(test)]
fn test_tracker_config() -> DecodeConfig {
    DecodeConfig::default().with_peak_memory_limit(64)
}

#[test]
fn box_read_to_end() {
    let config = test_tracker_config();
    let tracker = ResourceTracker::new(&config);
    let tmp = &mut b"1234567890".as_slice();
    let mut src = BMFFBox {
        head: BoxHeader { name: BoxType::FileTypeBox, size: 13, offset: 8, uuid: None },
        content: <_ as Read>::take(tmp, 5),
    };
    let buf = src.read_into_try_vec(&tracker).unwrap();
    assert_eq!(buf.len(), 5);
    assert_eq!(buf, b"12345".as_ref());
}

#[test]
fn box_read_declared_beyond_limit() {
    let config = test_tracker_config();
    let tracker = ResourceTracker::new(&config);
    let tmp = &mut b"1234567890".as_slice();
    let mut src = BMFFBox {
        head: BoxHeader { name: BoxType::FileTypeBox, size: 1 << 40, offset: 8, uuid: None },
        content: <_ as Read>::take(tmp, u64::MAX / 2),
    };
    assert!(matches!(src.read_into_try_vec(&tracker), Err(Error::ResourceLimitExceeded(_))));
}

#[test]
fn header_forms() {
    let compact = [0, 0, 0, 12, b'f', b'r', b'e', b'e', 1, 2, 3, 4];
    let h = read_box_header(&mut compact.as_slice()).unwrap();
    assert!(h.name == BoxType::FreeSpaceBox);
    assert_eq!((h.size, h.offset), (12, 8));

    let wide = [0, 0, 0, 1, b'm', b'd', b'a', b't', 0, 0, 0, 0, 0, 0, 0, 16];
    let h = read_box_header(&mut wide.as_slice()).unwrap();
    assert_eq!((h.size, h.offset), (16, 16));

    let to_end = [0, 0, 0, 0, b'm', b'd', b'a', b't'];
    assert!(read_box_header(&mut to_end.as_slice()).unwrap().runs_to_end());

    let tiny = [0, 0, 0, 4, b'f', b'r', b'e', b'e'];
    assert!(matches!(read_box_header(&mut tiny.as_slice()), Err(Error::InvalidData(SubCode::InvalidBoxSize, _))));
}

#[test]
fn child_larger_than_parent() {
    let config = DecodeConfig::default();
    let tracker = ResourceTracker::new(&config);
    // parent payload holds 12 bytes, child claims 32
    let data = [0, 0, 0, 32, b'f', b'r', b'e', b'e', 0, 0, 0, 0];
    let tmp = &mut data.as_slice();
    let mut parent = BMFFBox {
        head: BoxHeader { name: BoxType::MetadataBox, size: 20, offset: 8, uuid: None },
        content: <_ as Read>::take(tmp, 12),
    };
    let mut iter = parent.box_iter(&tracker);
    assert!(matches!(iter.next_box(), Err(Error::InvalidData(SubCode::InvalidBoxSize, _))));
}

#[test]
fn write_box_roundtrip_header() {
    let mut out = std::vec::Vec::new();
    write_full_box(&mut out, FourCC::new(b"pitm"), 0, 0, |b| {
        b.write_u16::<byteorder::BigEndian>(7)?;
        Ok(())
    })
    .unwrap();
    assert_eq!(out, [0, 0, 0, 14, b'p', b'i', b't', b'm', 0, 0, 0, 0, 0, 7]);
}
