//! FIFO queue of [`Buffer`]s draining to a socket write callback (spec §4.2).
//!
//! Grounded on `original_source/waitress/channel.py`'s `_flush_some` /
//! `_scan_outbufs` pair: the tail buffer is always a writable
//! [`Buffer::Spillable`]; sending rotates a fresh tail in; a partial or
//! refused send puts the unsent remainder back (`rollback` when the head is
//! seekable, a front-pushed [`Buffer::InMemory`] otherwise).

use std::collections::VecDeque;
use std::io;

use crate::buffer::Buffer;
use crate::error::Result;

/// Outcome of a single [`OutputQueue::drain_one`] step.
#[derive(Debug, PartialEq, Eq)]
pub enum DrainStep {
    /// `send_fn` accepted `n` bytes; more may remain.
    Sent(usize),
    /// `send_fn` returned 0 (socket would block); nothing further to do
    /// this tick.
    WouldBlock,
    /// The queue has nothing left to send.
    Empty,
}

pub struct OutputQueue {
    overflow: usize,
    buffers: VecDeque<Buffer>,
    known_len: u64,
    has_unseekable: bool,
    has_data: bool,
    current_tail_written: usize,
}

impl OutputQueue {
    pub fn new(overflow: usize) -> Self {
        let mut buffers = VecDeque::new();
        buffers.push_back(Buffer::spillable(overflow));
        Self {
            overflow,
            buffers,
            known_len: 0,
            has_unseekable: false,
            has_data: false,
            current_tail_written: 0,
        }
    }

    pub fn known_len(&self) -> u64 {
        self.known_len
    }

    pub fn has_unseekable(&self) -> bool {
        self.has_unseekable
    }

    pub fn has_data(&self) -> bool {
        self.has_data
    }

    /// Append bytes to the tail buffer, rotating in a fresh tail first if
    /// the current one has already accepted more than `watermark` bytes
    /// since it was created (bounds how large any single spillable grows).
    pub fn append_bytes(&mut self, data: &[u8], rotate_above: usize) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.current_tail_written > rotate_above {
            self.rotate();
        }
        {
            let tail = self.buffers.back_mut().expect("tail always present");
            tail.append(data)?;
        }
        self.current_tail_written += data.len();
        self.rescan();
        Ok(())
    }

    /// Splice a prepared, read-only [`Buffer::FileStream`] into the queue
    /// and rotate a fresh writable tail in behind it.
    pub fn append_file_stream(&mut self, stream: Buffer) {
        debug_assert!(matches!(stream, Buffer::FileStream(_)));
        self.buffers.push_back(stream);
        self.buffers.push_back(Buffer::spillable(self.overflow));
        self.current_tail_written = 0;
        self.rescan();
    }

    fn rotate(&mut self) {
        self.buffers.push_back(Buffer::spillable(self.overflow));
        self.current_tail_written = 0;
    }

    /// Recompute `known_len`/`has_unseekable`/`has_data` from scratch.
    pub fn rescan(&mut self) {
        let mut known = 0u64;
        let mut unseekable = false;
        for b in &self.buffers {
            match b.remaining() {
                r if r < 0 => unseekable = true,
                r => known += r as u64,
            }
        }
        self.known_len = known;
        self.has_unseekable = unseekable;
        self.has_data = known > 0 || unseekable;
    }

    /// Attempt one send: read up to `chunk_size` bytes from the head
    /// buffer and hand them to `send_fn`. Advances/rotates the queue and
    /// restores any unsent bytes on a partial or zero send.
    pub fn drain_one(
        &mut self,
        send_fn: &mut dyn FnMut(&[u8]) -> io::Result<usize>,
        chunk_size: usize,
    ) -> Result<DrainStep> {
        loop {
            while self.buffers.len() > 1
                && self.buffers.front().is_some_and(|b| b.remaining() == 0)
            {
                if let Some(mut stale) = self.buffers.pop_front() {
                    stale.close();
                }
            }
            let Some(head) = self.buffers.front_mut() else {
                self.rescan();
                return Ok(DrainStep::Empty);
            };
            if head.remaining() == 0 {
                self.rescan();
                return Ok(DrainStep::Empty);
            }
            let chunk = head.read(chunk_size as i64)?;
            if chunk.is_empty() {
                // unseekable buffer just hit EOF; re-run the cleanup check
                continue;
            }
            // Read resolves a fresh FileStream buffer's seekability lazily
            // (on its first call), so this must be checked after reading,
            // not before.
            let seekable = head.seekable();
            let requested = chunk.len();
            let sent = send_fn(&chunk).map_err(crate::error::ChannelError::Socket)?;
            if sent < requested {
                let unsent = &chunk[sent..];
                if seekable {
                    head.rollback(unsent.len())?;
                } else {
                    self.buffers.push_front(Buffer::in_memory_from(unsent.to_vec()));
                }
            }
            self.rescan();
            return if sent == 0 {
                Ok(DrainStep::WouldBlock)
            } else {
                Ok(DrainStep::Sent(sent))
            };
        }
    }

    /// Pop and close every buffer, resetting statistics (channel teardown).
    pub fn close_all(&mut self) {
        for mut b in self.buffers.drain(..) {
            b.close();
        }
        self.known_len = 0;
        self.has_unseekable = false;
        self.has_data = false;
        self.current_tail_written = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_drain_whole_chunk() {
        let mut q = OutputQueue::new(1_000_000);
        q.append_bytes(b"hello world", 1_000_000).unwrap();
        assert_eq!(q.known_len(), 11);
        assert!(q.has_data());

        let mut sent = Vec::new();
        let step = q
            .drain_one(
                &mut |b| {
                    sent.extend_from_slice(b);
                    Ok(b.len())
                },
                4096,
            )
            .unwrap();
        assert_eq!(step, DrainStep::Sent(11));
        assert_eq!(sent, b"hello world");
    }

    #[test]
    fn partial_send_rolls_back_seekable_head() {
        let mut q = OutputQueue::new(1_000_000);
        q.append_bytes(b"abcdefgh", 1_000_000).unwrap();

        let step = q.drain_one(&mut |b| Ok(b.len().min(3)), 4096).unwrap();
        assert_eq!(step, DrainStep::Sent(3));
        assert_eq!(q.known_len(), 5);

        let mut collected = Vec::new();
        loop {
            match q
                .drain_one(
                    &mut |b| {
                        collected.extend_from_slice(b);
                        Ok(b.len())
                    },
                    4096,
                )
                .unwrap()
            {
                DrainStep::Sent(_) => continue,
                DrainStep::Empty | DrainStep::WouldBlock => break,
            }
        }
        assert_eq!(collected, b"defgh");
    }

    #[test]
    fn zero_send_stops_without_losing_bytes() {
        let mut q = OutputQueue::new(1_000_000);
        q.append_bytes(b"data", 1_000_000).unwrap();

        let step = q.drain_one(&mut |_| Ok(0), 4096).unwrap();
        assert_eq!(step, DrainStep::WouldBlock);
        assert_eq!(q.known_len(), 4);

        let mut collected = Vec::new();
        let step2 = q
            .drain_one(
                &mut |b| {
                    collected.extend_from_slice(b);
                    Ok(b.len())
                },
                4096,
            )
            .unwrap();
        assert_eq!(step2, DrainStep::Sent(4));
        assert_eq!(collected, b"data");
    }

    #[test]
    fn byte_order_preserved_across_rotations() {
        let mut q = OutputQueue::new(4);
        q.append_bytes(b"ab", 0).unwrap(); // tail written beyond rotate_above(0) next call
        q.append_bytes(b"cd", 0).unwrap();
        q.append_bytes(b"ef", 0).unwrap();

        let mut collected = Vec::new();
        loop {
            match q
                .drain_one(
                    &mut |b| {
                        collected.extend_from_slice(b);
                        Ok(b.len())
                    },
                    4096,
                )
                .unwrap()
            {
                DrainStep::Sent(_) => continue,
                _ => break,
            }
        }
        assert_eq!(collected, b"abcdef");
    }

    #[test]
    fn close_all_resets_statistics() {
        let mut q = OutputQueue::new(1_000_000);
        q.append_bytes(b"data", 1_000_000).unwrap();
        q.close_all();
        assert_eq!(q.known_len(), 0);
        assert!(!q.has_data());
        assert!(q.buffers.is_empty());
    }

    #[test]
    fn file_stream_reports_unseekable_until_prepared() {
        use std::io::{Read, Write};

        struct Chunked(Vec<u8>, usize);
        impl Read for Chunked {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.0.is_empty() {
                    return Ok(0);
                }
                let n = buf.len().min(self.0.len());
                buf[..n].copy_from_slice(&self.0[..n]);
                self.0.drain(..n);
                Ok(n)
            }
        }
        impl crate::buffer::FileSource for Chunked {}

        let mut q = OutputQueue::new(1_000_000);
        let mut stream = crate::buffer::Buffer::file_stream(Box::new(Chunked(b"xyz".to_vec(), 0)));
        if let crate::buffer::Buffer::FileStream(_) = &mut stream {
            // unseekable source -> prepare leaves remaining = -1
        }
        q.append_file_stream(stream);
        assert!(q.has_unseekable());

        let mut collected = Vec::new();
        loop {
            match q
                .drain_one(
                    &mut |b| {
                        collected.extend_from_slice(b);
                        Ok(b.len())
                    },
                    4096,
                )
                .unwrap()
            {
                DrainStep::Sent(_) => continue,
                _ => break,
            }
        }
        assert_eq!(collected, b"xyz");
        let _ = Write::flush(&mut io::sink());
    }
}
