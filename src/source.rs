// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte sources the parser reads from and byte sinks the writer writes to.

use crate::{Error, Result, SubCode, ToU64};
use std::io::{Read, Seek, SeekFrom, Write};

/// Answer of [`ByteSource::wait_for_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowStatus {
    /// At least the requested number of bytes is available.
    SizeReached,
    /// The bytes are not available yet, but the source may still grow.
    Timeout,
    /// The source ended before the requested size and will not grow.
    SizeBeyondEof,
}

/// A seekable, possibly still growing, source of container bytes.
///
/// The parser never assumes the total size is known. Before touching a range it
/// asks [`wait_for_size`](ByteSource::wait_for_size) whether the range exists.
pub trait ByteSource: Send {
    /// Current read position.
    fn position(&self) -> u64;

    /// Fill `buf` completely from the current position and advance past it.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<()>;

    /// Move the read position. Seeking beyond the available data is allowed.
    fn seek(&mut self, position: u64) -> std::io::Result<()>;

    /// Block until the source holds at least `target_size` bytes, or report why it does not.
    fn wait_for_size(&mut self, target_size: u64) -> GrowStatus;
}

/// A fully loaded container held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    data: std::vec::Vec<u8>,
    position: u64,
}

impl MemorySource {
    pub fn new(data: impl Into<std::vec::Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }
}

impl ByteSource for MemorySource {
    fn position(&self) -> u64 {
        self.position
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        let start = usize::try_from(self.position).map_err(|_| std::io::ErrorKind::UnexpectedEof)?;
        let end = start.checked_add(buf.len()).ok_or(std::io::ErrorKind::UnexpectedEof)?;
        let bytes = self.data.get(start..end).ok_or(std::io::ErrorKind::UnexpectedEof)?;
        buf.copy_from_slice(bytes);
        self.position = end.to_u64();
        Ok(())
    }

    fn seek(&mut self, position: u64) -> std::io::Result<()> {
        self.position = position;
        Ok(())
    }

    fn wait_for_size(&mut self, target_size: u64) -> GrowStatus {
        if target_size <= self.data.len().to_u64() {
            GrowStatus::SizeReached
        } else {
            GrowStatus::SizeBeyondEof
        }
    }
}

/// Adapts any `Read + Seek` value, such as a `File`, into a [`ByteSource`].
///
/// The length is measured once on construction; the source is treated as complete.
#[derive(Debug)]
pub struct ReaderSource<R> {
    inner: R,
    len: u64,
    position: u64,
}

impl<R: Read + Seek> ReaderSource<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, len, position: 0 })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek + Send> ByteSource for ReaderSource<R> {
    fn position(&self) -> u64 {
        self.position
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.inner.read_exact(buf)?;
        self.position += buf.len().to_u64();
        Ok(())
    }

    fn seek(&mut self, position: u64) -> std::io::Result<()> {
        self.position = self.inner.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    fn wait_for_size(&mut self, target_size: u64) -> GrowStatus {
        if target_size <= self.len {
            GrowStatus::SizeReached
        } else {
            GrowStatus::SizeBeyondEof
        }
    }
}

/// Read `len` bytes at `offset`, waiting for them to arrive first.
pub(crate) fn read_range(source: &mut dyn ByteSource, offset: u64, len: u64) -> Result<crate::TryVec<u8>> {
    let end = offset
        .checked_add(len)
        .ok_or(Error::InvalidData(SubCode::InvalidBoxSize, "extent end overflow"))?;
    match source.wait_for_size(end) {
        GrowStatus::SizeReached => {},
        GrowStatus::Timeout | GrowStatus::SizeBeyondEof => return Err(Error::UnexpectedEOF),
    }
    let len = usize::try_from(len)?;
    let mut buf = std::vec::Vec::new();
    buf.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
    buf.resize(len, 0);
    source.seek(offset)?;
    source.read(&mut buf)?;
    Ok(buf.into())
}

/// Find the number of bytes a finished source holds, starting from a known-present `floor`.
///
/// Only used for open-ended extents in a media data box that runs to the end of the file.
pub(crate) fn probe_len(source: &mut dyn ByteSource, floor: u64) -> Result<u64> {
    let mut low = floor;
    let mut step = 1u64 << 16;
    let mut high = loop {
        let candidate = low.saturating_add(step);
        match source.wait_for_size(candidate) {
            GrowStatus::SizeReached if candidate < u64::MAX => {
                low = candidate;
                step = step.saturating_mul(2);
            },
            GrowStatus::SizeReached => return Ok(candidate),
            GrowStatus::SizeBeyondEof => break candidate,
            GrowStatus::Timeout => return Err(Error::UnexpectedEOF),
        }
    };
    // invariant: low is present, high is not
    while high - low > 1 {
        let mid = low + (high - low) / 2;
        match source.wait_for_size(mid) {
            GrowStatus::SizeReached => low = mid,
            GrowStatus::SizeBeyondEof => high = mid,
            GrowStatus::Timeout => return Err(Error::UnexpectedEOF),
        }
    }
    Ok(low)
}

/// Destination of a serialized container.
pub trait ByteSink {
    fn write(&mut self, data: &[u8]) -> Result<()>;
}

impl ByteSink for std::vec::Vec<u8> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.try_reserve(data.len()).map_err(|_| Error::OutOfMemory)?;
        self.extend_from_slice(data);
        Ok(())
    }
}

/// Adapts any `std::io::Write` into a [`ByteSink`].
#[derive(Debug)]
pub struct WriteSink<W>(pub W);

impl<W: Write> ByteSink for WriteSink<W> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.0.write_all(data).map_err(|err| {
            log::warn!("sink write failed: {err}");
            Error::Encoding(SubCode::CannotWriteOutputData, "cannot write output data")
        })
    }
}

/// Adapts a [`ByteSource`] into `std::io::Read` for the box parser.
///
/// Every read first waits for the bytes it needs; missing data is reported as EOF.
pub(crate) struct SourceReader<'a> {
    source: &'a mut dyn ByteSource,
}

impl<'a> SourceReader<'a> {
    pub(crate) fn new(source: &'a mut dyn ByteSource) -> Self {
        Self { source }
    }

    pub(crate) fn position(&self) -> u64 {
        self.source.position()
    }

    pub(crate) fn seek(&mut self, position: u64) -> Result<()> {
        self.source.seek(position)?;
        Ok(())
    }

    pub(crate) fn wait_for_size(&mut self, target_size: u64) -> GrowStatus {
        self.source.wait_for_size(target_size)
    }

    /// Length of the finished source; bytes up to `floor` must be present.
    pub(crate) fn probe_len(&mut self, floor: u64) -> Result<u64> {
        let position = self.source.position();
        let len = probe_len(self.source, floor)?;
        self.source.seek(position)?;
        Ok(len)
    }
}

impl Read for SourceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = self
            .source
            .position()
            .checked_add(buf.len().to_u64())
            .ok_or(std::io::ErrorKind::UnexpectedEof)?;
        if self.source.wait_for_size(end) != GrowStatus::SizeReached {
            // hand out whatever part of the request is present, one byte at a time
            let pos = self.source.position();
            if self.source.wait_for_size(pos + 1) != GrowStatus::SizeReached {
                return Ok(0);
            }
            self.source.read(&mut buf[..1])?;
            return Ok(1);
        }
        self.source.read(buf)?;
        Ok(buf.len())
    }
}

#[test]
fn memory_source_bounds() {
    let mut source = MemorySource::new(b"0123456789".to_vec());
    assert_eq!(source.wait_for_size(10), GrowStatus::SizeReached);
    assert_eq!(source.wait_for_size(11), GrowStatus::SizeBeyondEof);
    source.seek(8).unwrap();
    let mut buf = [0; 3];
    assert!(source.read(&mut buf).is_err());
    let mut buf = [0; 2];
    source.read(&mut buf).unwrap();
    assert_eq!(&buf, b"89");
    assert_eq!(source.position(), 10);
}

#[test]
fn probe_finds_length() {
    let mut source = MemorySource::new(vec![0u8; 200_001]);
    assert_eq!(probe_len(&mut source, 10).unwrap(), 200_001);
    let mut source = MemorySource::new(vec![0u8; 5]);
    assert_eq!(probe_len(&mut source, 5).unwrap(), 5);
}

#[test]
fn read_range_waits_for_data() {
    let mut source = MemorySource::new(b"abcdefgh".to_vec());
    let bytes = read_range(&mut source, 2, 3).unwrap();
    assert_eq!(&bytes[..], b"cde");
    assert!(matches!(read_range(&mut source, 6, 3), Err(Error::UnexpectedEOF)));
}
