//! Uniform read/append/rollback/close over bytes, spillable bytes, and
//! streamed files (spec §3, §4.1).
//!
//! Grounded on `original_source/waitress/buffers.py` as pinned down by
//! `original_source/waitress/tests/test_buffers.py`: `BytesIOBasedBuffer` →
//! [`InMemoryBuffer`], `OverflowableBuffer` → [`SpillableBuffer`],
//! `ReadOnlyFileBasedBuffer` → [`FileStreamBuffer`].

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::{ChannelError, Result};

/// Default chunk size used by [`Buffer::iter_chunks`], matching the
/// original's `ReadOnlyFileBasedBuffer` default block size.
pub const DEFAULT_BLOCK_SIZE: usize = 32 * 1024;

/// A byte source handed to [`Buffer::FileStream`]. Duck-typed the way the
/// `Parser`/`Task` collaborators are (spec §6): a plain file implements
/// `seek_info`/`seek_relative`, an opaque streaming source just implements
/// `Read` and stays unseekable forever.
pub trait FileSource: Read + Send {
    /// Returns `(current_position, total_length)` if the source supports
    /// position queries, `None` if it must be treated as unseekable.
    fn seek_info(&mut self) -> Option<(u64, u64)> {
        None
    }

    /// Move the read cursor backwards by `delta` bytes. Only ever called on
    /// sources that reported `Some(..)` from `seek_info`.
    fn seek_relative(&mut self, delta: i64) -> io::Result<()> {
        let _ = delta;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "source is not seekable",
        ))
    }
}

impl FileSource for std::fs::File {
    fn seek_info(&mut self) -> Option<(u64, u64)> {
        let pos = self.stream_position().ok()?;
        let len = self.metadata().ok()?.len();
        Some((pos, len))
    }

    fn seek_relative(&mut self, delta: i64) -> io::Result<()> {
        self.seek(SeekFrom::Current(delta)).map(|_| ())
    }
}

/// In-RAM byte buffer with a read cursor. Seekable; supports append and
/// rollback of previously-read bytes.
pub struct InMemoryBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl InMemoryBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new(), pos: 0 }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> i64 {
        (self.data.len() - self.pos) as i64
    }

    fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    fn read(&mut self, n: i64) -> Vec<u8> {
        let available = self.data.len() - self.pos;
        let take = if n < 0 { available } else { (n as usize).min(available) };
        let out = self.data[self.pos..self.pos + take].to_vec();
        self.pos += take;
        out
    }

    fn rollback(&mut self, n: usize) -> Result<()> {
        if n > self.pos {
            return Err(ChannelError::Buffer(format!(
                "rollback({n}) exceeds bytes read so far ({})",
                self.pos
            )));
        }
        self.pos -= n;
        Ok(())
    }

    fn close(&mut self) {
        self.data.clear();
        self.pos = 0;
    }
}

impl Default for InMemoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Begins in-RAM; once the accumulated size would exceed `overflow` bytes,
/// migrates the accumulator plus the new append to a temp-file-backed
/// buffer and marks itself overflowed (spec §4.1 "Spillable buffer rules").
pub struct SpillableBuffer {
    overflow: usize,
    stage: SpillStage,
}

enum SpillStage {
    Mem(InMemoryBuffer),
    Disk { file: std::fs::File, len: u64, pos: u64 },
}

impl SpillableBuffer {
    pub fn new(overflow: usize) -> Self {
        Self { overflow, stage: SpillStage::Mem(InMemoryBuffer::new()) }
    }

    fn remaining(&self) -> i64 {
        match &self.stage {
            SpillStage::Mem(m) => m.remaining(),
            SpillStage::Disk { len, pos, .. } => (*len - *pos) as i64,
        }
    }

    fn overflowed(&self) -> bool {
        matches!(self.stage, SpillStage::Disk { .. })
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.stage {
            SpillStage::Mem(mem) => {
                if mem.data.len() + bytes.len() > self.overflow {
                    let mut file = tempfile::tempfile()?;
                    file.write_all(&mem.data)?;
                    file.write_all(bytes)?;
                    let len = file.stream_position()?;
                    let pos = mem.pos as u64;
                    file.seek(SeekFrom::Start(pos))?;
                    self.stage = SpillStage::Disk { file, len, pos };
                } else {
                    mem.append(bytes);
                }
            }
            SpillStage::Disk { file, len, .. } => {
                file.seek(SeekFrom::End(0))?;
                file.write_all(bytes)?;
                *len += bytes.len() as u64;
            }
        }
        Ok(())
    }

    fn read(&mut self, n: i64) -> Result<Vec<u8>> {
        match &mut self.stage {
            SpillStage::Mem(mem) => Ok(mem.read(n)),
            SpillStage::Disk { file, len, pos } => {
                file.seek(SeekFrom::Start(*pos))?;
                let available = *len - *pos;
                let take = if n < 0 { available } else { (n as u64).min(available) };
                let mut out = vec![0u8; take as usize];
                file.read_exact(&mut out)?;
                *pos += take;
                Ok(out)
            }
        }
    }

    fn rollback(&mut self, n: usize) -> Result<()> {
        match &mut self.stage {
            SpillStage::Mem(mem) => mem.rollback(n),
            SpillStage::Disk { pos, .. } => {
                let n = n as u64;
                if n > *pos {
                    return Err(ChannelError::Buffer(format!(
                        "rollback({n}) exceeds bytes read so far ({pos})"
                    )));
                }
                *pos -= n;
                Ok(())
            }
        }
    }

    fn close(&mut self) {
        self.stage = SpillStage::Mem(InMemoryBuffer::new());
    }
}

/// Read-only wrapper over a caller-supplied byte source (spec §3
/// "FileStream"). Seekability and `remaining` are resolved lazily by
/// [`FileStreamBuffer::prepare`].
pub struct FileStreamBuffer {
    source: Box<dyn FileSource>,
    seekable: bool,
    remaining: i64,
    block_size: usize,
    prepared: bool,
}

impl FileStreamBuffer {
    pub fn new(source: Box<dyn FileSource>) -> Self {
        Self {
            source,
            seekable: false,
            remaining: -1,
            block_size: DEFAULT_BLOCK_SIZE,
            prepared: false,
        }
    }

    pub fn with_block_size(source: Box<dyn FileSource>, block_size: usize) -> Self {
        let mut b = Self::new(source);
        b.block_size = block_size;
        b
    }

    /// Resolve seekability and the known residual length, capped at `max`
    /// if given. Idempotent after the first call.
    pub fn prepare(&mut self, max: Option<u64>) -> i64 {
        if self.prepared {
            return self.remaining;
        }
        self.prepared = true;
        match self.source.seek_info() {
            Some((pos, len)) => {
                let residual = len.saturating_sub(pos);
                let residual = match max {
                    Some(m) => residual.min(m),
                    None => residual,
                };
                self.seekable = true;
                self.remaining = residual as i64;
            }
            None => {
                self.seekable = false;
                self.remaining = -1;
            }
        }
        self.remaining
    }

    fn read(&mut self, n: i64) -> Result<Vec<u8>> {
        if !self.prepared {
            self.prepare(None);
        }
        if self.remaining == 0 {
            return Ok(Vec::new());
        }
        let want = if self.seekable {
            let avail = self.remaining as u64;
            let req = if n < 0 { avail } else { (n as u64).min(avail) };
            req as usize
        } else {
            if n < 0 { self.block_size } else { (n as usize).min(self.block_size) }
        };
        let mut buf = vec![0u8; want];
        let mut read_total = 0usize;
        let mut hit_eof = false;
        while read_total < want {
            match self.source.read(&mut buf[read_total..]) {
                Ok(0) => {
                    hit_eof = true;
                    break;
                }
                Ok(k) => read_total += k,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChannelError::Socket(e)),
            }
        }
        buf.truncate(read_total);
        if self.seekable {
            self.remaining -= read_total as i64;
        } else if hit_eof {
            self.remaining = 0;
        }
        Ok(buf)
    }

    fn rollback(&mut self, n: usize) -> Result<()> {
        if !self.seekable {
            return Err(ChannelError::Buffer("rollback on unseekable FileStream".into()));
        }
        self.source
            .seek_relative(-(n as i64))
            .map_err(ChannelError::Socket)?;
        self.remaining += n as i64;
        Ok(())
    }

    fn close(&mut self) {
        self.remaining = 0;
    }
}

/// Sum type over the three buffer variants (spec §3 REDESIGN FLAGS).
pub enum Buffer {
    InMemory(InMemoryBuffer),
    Spillable(SpillableBuffer),
    FileStream(FileStreamBuffer),
}

impl Buffer {
    pub fn in_memory() -> Self {
        Buffer::InMemory(InMemoryBuffer::new())
    }

    pub fn in_memory_from(bytes: Vec<u8>) -> Self {
        Buffer::InMemory(InMemoryBuffer::from_bytes(bytes))
    }

    pub fn spillable(overflow: usize) -> Self {
        Buffer::Spillable(SpillableBuffer::new(overflow))
    }

    pub fn file_stream(source: Box<dyn FileSource>) -> Self {
        Buffer::FileStream(FileStreamBuffer::new(source))
    }

    /// `remaining = 0` iff no further bytes to yield; `-1` means
    /// "more, size unknown" (spec §3 invariants).
    pub fn remaining(&self) -> i64 {
        match self {
            Buffer::InMemory(b) => b.remaining(),
            Buffer::Spillable(b) => b.remaining(),
            Buffer::FileStream(b) => b.remaining,
        }
    }

    /// Boolean truth is "has data or unknown" — never treat `-1` as falsy.
    pub fn has_data(&self) -> bool {
        self.remaining() != 0
    }

    pub fn seekable(&self) -> bool {
        match self {
            Buffer::InMemory(_) | Buffer::Spillable(_) => true,
            Buffer::FileStream(b) => b.seekable,
        }
    }

    pub fn overflowed(&self) -> bool {
        matches!(self, Buffer::Spillable(b) if b.overflowed())
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Buffer::InMemory(b) => {
                b.append(bytes);
                Ok(())
            }
            Buffer::Spillable(b) => b.append(bytes),
            Buffer::FileStream(_) => {
                Err(ChannelError::Buffer("FileStream buffers are read-only".into()))
            }
        }
    }

    pub fn read(&mut self, n: i64) -> Result<Vec<u8>> {
        match self {
            Buffer::InMemory(b) => Ok(b.read(n)),
            Buffer::Spillable(b) => b.read(n),
            Buffer::FileStream(b) => b.read(n),
        }
    }

    pub fn rollback(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        match self {
            Buffer::InMemory(b) => b.rollback(n),
            Buffer::Spillable(b) => b.rollback(n),
            Buffer::FileStream(b) => b.rollback(n),
        }
    }

    pub fn close(&mut self) {
        match self {
            Buffer::InMemory(b) => b.close(),
            Buffer::Spillable(b) => b.close(),
            Buffer::FileStream(b) => b.close(),
        }
    }

    /// Yield successive chunks of `block_size` until exhausted (spec §4.1
    /// `iterate()`).
    pub fn iter_chunks(&mut self, block_size: usize) -> BufferChunks<'_> {
        BufferChunks { buffer: self, block_size }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Buffer::InMemory(_) => "InMemory",
            Buffer::Spillable(b) => if b.overflowed() { "Spillable(disk)" } else { "Spillable(mem)" },
            Buffer::FileStream(_) => "FileStream",
        };
        write!(f, "Buffer::{kind}(remaining={})", self.remaining())
    }
}

pub struct BufferChunks<'a> {
    buffer: &'a mut Buffer,
    block_size: usize,
}

impl<'a> Iterator for BufferChunks<'a> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.remaining() == 0 {
            return None;
        }
        match self.buffer.read(self.block_size as i64) {
            Ok(chunk) if chunk.is_empty() => None,
            Ok(chunk) => Some(Ok(chunk)),
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn make_file(bytes: &[u8]) -> std::fs::File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(bytes).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f
    }

    #[test]
    fn in_memory_append_and_read() {
        let mut b = Buffer::in_memory_from(b"data".to_vec());
        b.append(b"data2").unwrap();
        assert_eq!(b.remaining(), 9);
        assert_eq!(b.read(-1).unwrap(), b"datadata2");
        assert_eq!(b.remaining(), 0);
    }

    #[test]
    fn in_memory_read_partial_and_rollback() {
        let mut b = Buffer::in_memory_from(b"data".to_vec());
        let chunk = b.read(3).unwrap();
        assert_eq!(chunk, b"dat");
        assert_eq!(b.remaining(), 1);
        b.rollback(3).unwrap();
        assert_eq!(b.remaining(), 4);
        assert_eq!(b.read(-1).unwrap(), b"data");
        assert_eq!(b.remaining(), 0);
    }

    #[test]
    fn in_memory_read_zero_is_a_noop() {
        let mut b = Buffer::in_memory_from(b"data".to_vec());
        assert_eq!(b.read(0).unwrap(), b"");
        assert_eq!(b.remaining(), 4);
    }

    #[test]
    fn in_memory_read_more_than_available_returns_all() {
        let mut b = Buffer::in_memory_from(b"data".to_vec());
        assert_eq!(b.read(100).unwrap(), b"data");
        assert_eq!(b.remaining(), 0);
    }

    #[test]
    fn close_zeroes_remaining() {
        let mut b = Buffer::in_memory();
        b.append(b"x").unwrap();
        b.close();
        assert_eq!(b.remaining(), 0);
    }

    #[test]
    fn spillable_stays_in_memory_below_threshold() {
        let mut b = Buffer::spillable(1024);
        b.append(b"hello").unwrap();
        assert!(!b.overflowed());
        assert_eq!(b.remaining(), 5);
    }

    #[test]
    fn spillable_migrates_to_disk_past_overflow() {
        let mut b = Buffer::spillable(8);
        b.append(b"0123456789").unwrap(); // 10 > overflow(8)
        assert!(b.overflowed());
        assert_eq!(b.remaining(), 10);
        assert_eq!(b.read(-1).unwrap(), b"0123456789");
    }

    #[test]
    fn spillable_rollback_survives_disk_migration() {
        let mut b = Buffer::spillable(4);
        b.append(b"abcdefgh").unwrap(); // migrates (8 > 4)
        let first = b.read(3).unwrap();
        assert_eq!(first, b"abc");
        b.rollback(3).unwrap();
        assert_eq!(b.read(3).unwrap(), first);
    }

    #[test]
    fn spillable_further_appends_go_to_disk_once_overflowed() {
        let mut b = Buffer::spillable(2);
        b.append(b"abc").unwrap();
        assert!(b.overflowed());
        b.append(b"def").unwrap();
        assert_eq!(b.remaining(), 6);
        assert_eq!(b.read(-1).unwrap(), b"abcdef");
    }

    #[test]
    fn file_stream_prepare_seekable() {
        let f = make_file(b"abc");
        let mut b = Buffer::file_stream(Box::new(f));
        if let Buffer::FileStream(fs) = &mut b {
            let r = fs.prepare(None);
            assert_eq!(r, 3);
            assert!(fs.seekable);
        } else {
            unreachable!()
        }
    }

    #[test]
    fn file_stream_prepare_caps_at_max() {
        let f = make_file(b"abcdefghij");
        let mut b = Buffer::file_stream(Box::new(f));
        if let Buffer::FileStream(fs) = &mut b {
            let r = fs.prepare(Some(3));
            assert_eq!(r, 3);
        } else {
            unreachable!()
        }
    }

    #[test]
    fn file_stream_append_fails() {
        let f = make_file(b"abc");
        let mut b = Buffer::file_stream(Box::new(f));
        assert!(b.append(b"x").is_err());
    }

    struct Unseekable(io::Cursor<Vec<u8>>);
    impl Read for Unseekable {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }
    impl FileSource for Unseekable {}

    #[test]
    fn unseekable_eof_latches_remaining_zero() {
        let mut b = Buffer::file_stream(Box::new(Unseekable(io::Cursor::new(b"abcdef".to_vec()))));
        if let Buffer::FileStream(fs) = &mut b {
            fs.prepare(None);
            assert!(!fs.seekable);
            assert_eq!(fs.remaining, -1);
        }
        let first = b.read(-1).unwrap();
        assert_eq!(first, b"abcdef");
        assert_eq!(b.remaining(), 0);
        let second = b.read(-1).unwrap();
        assert_eq!(second, b"");
        assert_eq!(b.remaining(), 0);
    }

    #[test]
    fn iterate_yields_all_bytes_in_chunks() {
        let data = vec![b'a'; 10_000];
        let f = make_file(&data);
        let mut b = Buffer::file_stream(Box::new(f));
        if let Buffer::FileStream(fs) = &mut b {
            fs.prepare(None);
        }
        let mut collected = Vec::new();
        for chunk in b.iter_chunks(4096) {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, data);
    }
}
