//! Per-connection state machine bridging the reactor and the worker pool
//! (spec §4.3, §5).
//!
//! Grounded on `original_source/waitress/channel.py`'s `HTTPChannel`:
//! `readable`/`writable`/`handle_read`/`handle_write`/`handle_close`/
//! `write_soon`/`service`/`cancel`, and on the teacher's
//! `src/http/http_connection.rs` for the read-phase/write-phase split
//! (`handle_read_phase`/`handle_write_phase`). The task lock and buffer
//! lock are `std::sync::Mutex`/`Condvar`, a direct match for
//! `threading.Lock`/`threading.Condition` in the original.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token, Waker};

use crate::config::Adj;
use crate::error::{ChannelError, Result};
use crate::output_queue::{DrainStep, OutputQueue};
use crate::parser::RequestParser;
use crate::task::{RequestFactory, Task};

const CONTINUE_PREFACE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Outcome of [`Channel::handle_read`], telling the reactor what to do
/// next.
pub enum ReadOutcome {
    /// A full request (or more) completed; schedule a worker if none is
    /// already draining this channel's queue.
    Dispatch,
    /// Peer closed or the socket errored; channel is torn down.
    Closed,
    /// Would block; reactor keeps waiting on readiness.
    WouldBlock,
}

struct ReactorIo {
    stream: TcpStream,
    parser: Option<Box<dyn RequestParser>>,
}

struct Flags {
    connected: AtomicBool,
    will_close: AtomicBool,
    close_when_flushed: AtomicBool,
    sent_continue: AtomicBool,
}

impl Flags {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            will_close: AtomicBool::new(false),
            close_when_flushed: AtomicBool::new(false),
            sent_continue: AtomicBool::new(false),
        }
    }
}

pub struct Channel {
    conn: Mutex<ReactorIo>,
    pending: Mutex<VecDeque<Box<dyn RequestParser>>>,
    pending_count: AtomicUsize,
    buffer: Mutex<OutputQueue>,
    cond: Condvar,
    flags: Flags,
    last_activity_ms: AtomicU64,
    creation_time: Instant,
    peer_addr: SocketAddr,
    pub token: Token,
    adj: Arc<Adj>,
    waker: Arc<Waker>,
}

impl Channel {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, token: Token, adj: Arc<Adj>, waker: Arc<Waker>) -> Self {
        Self {
            conn: Mutex::new(ReactorIo { stream, parser: None }),
            pending: Mutex::new(VecDeque::new()),
            pending_count: AtomicUsize::new(0),
            buffer: Mutex::new(OutputQueue::new(adj.outbuf_overflow)),
            cond: Condvar::new(),
            flags: Flags::new(),
            last_activity_ms: AtomicU64::new(0),
            creation_time: Instant::now(),
            peer_addr,
            token,
            adj,
            waker,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn touch(&self) {
        let ms = self.creation_time.elapsed().as_millis() as u64;
        self.last_activity_ms.store(ms, Ordering::Relaxed);
    }

    /// Milliseconds since this channel last saw activity, for the server's
    /// idle-timeout sweep.
    pub fn idle_ms(&self) -> u64 {
        let now = self.creation_time.elapsed().as_millis() as u64;
        now.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed))
    }

    pub fn connected(&self) -> bool {
        self.flags.connected.load(Ordering::Acquire)
    }

    fn will_close(&self) -> bool {
        self.flags.will_close.load(Ordering::Acquire)
    }

    /// True while the reactor should keep polling this socket for
    /// readability: no close pending, no request awaiting a worker, and no
    /// unflushed output (spec §4.3) — admitting a read while any of those
    /// hold would let a new request overlap one still being serviced.
    pub fn readable(&self) -> bool {
        self.connected()
            && !self.will_close()
            && self.pending_count.load(Ordering::Acquire) == 0
            && !self.buffer.lock().unwrap().has_data()
    }

    /// True while the reactor should keep polling this socket for
    /// writability: either there's output to drain, or the channel is
    /// winding down and needs its final `handle_write` to observe an empty
    /// queue and close.
    pub fn writable(&self) -> bool {
        if !self.connected() {
            return false;
        }
        self.buffer.lock().unwrap().has_data() || self.will_close()
    }

    pub fn should_remove(&self) -> bool {
        self.will_close() && !self.writable()
    }

    /// Remove this channel's stream from the reactor's interest list.
    /// Called once by the server just before dropping a torn-down channel.
    pub fn deregister(&self, registry: &Registry) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        match registry.deregister(&mut conn.stream) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChannelError::Socket(e)),
        }
    }

    fn reregister(&self, registry: &Registry) -> Result<()> {
        let mut interest = None;
        if self.readable() {
            interest = Some(Interest::READABLE);
        }
        if self.writable() {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        let mut conn = self.conn.lock().unwrap();
        match interest {
            Some(i) => registry.reregister(&mut conn.stream, self.token, i).map_err(ChannelError::Socket),
            None => Ok(()),
        }
    }

    /// Read available bytes, feed the parser, and queue up any completed
    /// requests. Sends the `100-continue` preface itself the instant
    /// headers finish, per spec.md's "at most once, before the worker
    /// runs" rule.
    pub fn handle_read(&self, factory: &dyn RequestFactory, registry: &Registry) -> Result<ReadOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let mut recv_buf = vec![0u8; self.adj.recv_bytes];
        let mut dispatched = false;

        loop {
            match conn.stream.read(&mut recv_buf) {
                Ok(0) => {
                    drop(conn);
                    self.handle_close();
                    return Ok(ReadOutcome::Closed);
                }
                Ok(n) => {
                    self.touch();
                    let mut offset = 0;
                    while offset < n {
                        if conn.parser.is_none() {
                            conn.parser = Some(factory.new_parser());
                        }
                        let consumed = conn.parser.as_mut().unwrap().received(&recv_buf[offset..n]);
                        offset += consumed.max(1).min(n - offset);

                        let should_send_continue = {
                            let parser = conn.parser.as_ref().unwrap();
                            parser.expect_continue()
                                && parser.headers_finished()
                                && !self.flags.sent_continue.load(Ordering::Acquire)
                        };
                        if should_send_continue {
                            // Reactor-originated write: must never block, so this
                            // bypasses write_soon's watermark wait (only a worker
                            // thread is allowed to apply that backpressure).
                            self.enqueue(CONTINUE_PREFACE)?;
                            self.flags.sent_continue.store(true, Ordering::Release);
                            conn.parser.as_mut().unwrap().clear_expect_continue();
                        }

                        let done = conn.parser.as_ref().unwrap().completed();
                        let errored = conn.parser.as_ref().unwrap().error().is_some();
                        if done || errored {
                            let finished = conn.parser.take().unwrap();
                            self.flags.sent_continue.store(false, Ordering::Release);
                            let mut pending = self.pending.lock().unwrap();
                            pending.push_back(finished);
                            self.pending_count.store(pending.len(), Ordering::Release);
                            dispatched = true;
                        }
                        if consumed == 0 && !done && !errored {
                            // parser needs more bytes than this read had; stop
                            // consuming this recv_buf and wait for the next one.
                            break;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    drop(conn);
                    self.handle_close();
                    return Err(ChannelError::Socket(e));
                }
            }
        }
        drop(conn);
        self.reregister(registry)?;
        if dispatched {
            Ok(ReadOutcome::Dispatch)
        } else {
            Ok(ReadOutcome::WouldBlock)
        }
    }

    /// Drain as much of the output queue as the socket will currently
    /// accept. Per spec.md §4.3: promotes `close_when_flushed` to
    /// `will_close` once the queue empties, and actually tears the channel
    /// down once `will_close` holds with nothing left to send.
    pub fn handle_write(&self, registry: &Registry) -> Result<()> {
        let mut close_after = false;
        let drained: Result<()> = (|| {
            let mut conn = self.conn.lock().unwrap();
            if let Ok(mut q) = self.buffer.try_lock() {
                // spec.md §4.3/§6: with a request still pending/in-flight,
                // skip the flush while there isn't enough data to bother
                // sending yet — avoids TCP fragmentation from dribbling out
                // tiny writes while a worker is still producing output.
                let has_pending = self.pending_count.load(Ordering::Acquire) > 0;
                let worth_sending = q.known_len() >= self.adj.send_bytes as u64 || q.has_unseekable();
                if !has_pending || worth_sending {
                    loop {
                        let stream = &mut conn.stream;
                        let step = q.drain_one(
                            &mut |chunk| match stream.write(chunk) {
                                Ok(n) => Ok(n),
                                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                                Err(e) => Err(e),
                            },
                            self.adj.send_bytes,
                        );
                        match step {
                            Ok(DrainStep::Sent(_)) => continue,
                            Ok(DrainStep::WouldBlock) | Ok(DrainStep::Empty) => break,
                            Err(e) => {
                                // Socket error during flush: spec.md §4.3 sets
                                // will_close; handle_close is the one place
                                // that actually tears the channel down.
                                self.flags.will_close.store(true, Ordering::Release);
                                close_after = true;
                                return Err(e);
                            }
                        }
                    }
                }
                if self.flags.close_when_flushed.load(Ordering::Acquire) && !q.has_data() {
                    self.flags.will_close.store(true, Ordering::Release);
                }
                if self.flags.will_close.load(Ordering::Acquire) && !q.has_data() {
                    close_after = true;
                }
                self.cond.notify_all();
            }
            Ok(())
        })();

        if close_after {
            self.handle_close();
        }
        self.reregister(registry)?;
        drained
    }

    /// Tear the channel down: close every buffer, wake any blocked
    /// workers, and mark it disconnected so `write_soon` stops accepting
    /// new data.
    pub fn handle_close(&self) {
        self.flags.connected.store(false, Ordering::Release);
        self.flags.will_close.store(true, Ordering::Release);
        {
            let mut q = self.buffer.lock().unwrap();
            q.close_all();
        }
        self.cond.notify_all();
    }

    /// Append bytes to the output queue and prod the reactor. Never
    /// blocks — safe to call from the reactor thread itself (e.g. the
    /// `100-continue` preface).
    fn enqueue(&self, data: &[u8]) -> Result<()> {
        if !self.connected() {
            return Err(ChannelError::ClientDisconnected);
        }
        {
            let mut q = self.buffer.lock().unwrap();
            q.append_bytes(data, self.adj.outbuf_high_watermark)?;
        }
        let _ = self.waker.wake();
        Ok(())
    }

    /// Worker-side append. Blocks (on the buffer condvar, never the task
    /// lock) while the queue sits above the high watermark, so a slow
    /// client applies backpressure to the application instead of letting
    /// memory grow unbounded. Must only be called from a worker thread —
    /// the reactor itself must never block (spec §5).
    pub fn write_soon(&self, data: Vec<u8>) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        self.enqueue(&data)?;
        let n = data.len();

        let mut q = self.buffer.lock().unwrap();
        while self.connected() && q.known_len() > self.adj.outbuf_high_watermark as u64 {
            q = self.cond.wait(q).unwrap();
        }
        if !self.connected() {
            return Err(ChannelError::ClientDisconnected);
        }
        Ok(n)
    }

    /// Splice a prepared file-backed buffer into the output queue —
    /// streamed bodies bypass the in-RAM/spillable accumulator entirely.
    pub fn write_file_stream(&self, stream: crate::buffer::Buffer) -> Result<()> {
        if !self.connected() {
            return Err(ChannelError::ClientDisconnected);
        }
        {
            let mut q = self.buffer.lock().unwrap();
            q.append_file_stream(stream);
        }
        let _ = self.waker.wake();
        Ok(())
    }

    /// Worker-side request loop. Holds the task lock for its whole
    /// duration: only one worker ever services a given channel at a time.
    ///
    /// A popped request stays counted in `pending_count` for the rest of
    /// its own iteration (only dropping to the queue's real remaining size
    /// right before the next pop, or to zero on exit) — spec.md §4.3's
    /// "`pending_requests` must not become empty until the loop's last
    /// iteration" rule, so the reactor's `readable()` stays false for a
    /// task's whole execution, not just while the request sat queued.
    pub fn service(&self, factory: &dyn RequestFactory) {
        loop {
            let (request, remaining) = {
                let mut pending = self.pending.lock().unwrap();
                let next = pending.pop_front();
                (next, pending.len())
            };
            let Some(request) = request else {
                self.pending_count.store(0, Ordering::Release);
                break;
            };
            self.pending_count.store(remaining + 1, Ordering::Release);

            if request.empty() {
                self.pending_count.store(remaining, Ordering::Release);
                continue;
            }

            let errored = request.error().is_some();
            // Snapshot version/Connection before the request is moved into
            // the task, so a worker exception can still synthesize a 500
            // that preserves them (spec.md §4.3, §8 "Worker exception
            // pre-header"), matching channel.py's `req_version`/
            // `req_headers['CONNECTION']` capture at the same point.
            let req_version = request.version().to_string();
            let req_connection = request.header("Connection").map(|s| s.to_string());
            let mut task: Box<dyn Task> = if errored {
                factory.make_error_task(request)
            } else {
                factory.make_task(request)
            };

            let outcome = task.service(self);
            self.touch();

            let mut terminate = false;
            match outcome {
                Err(ChannelError::ClientDisconnected) => {
                    self.pending_count.store(0, Ordering::Release);
                    self.handle_close();
                    return;
                }
                Err(err) => {
                    if !task.wrote_header() {
                        let mut fallback = factory.make_error_task(Box::new(ClearedRequest {
                            version: req_version,
                            connection: req_connection,
                            error: err.to_string(),
                        }));
                        let _ = fallback.service(self);
                    }
                    self.flags.close_when_flushed.store(true, Ordering::Release);
                    terminate = true;
                }
                Ok(()) if task.close_on_finish() => {
                    self.flags.close_when_flushed.store(true, Ordering::Release);
                    terminate = true;
                }
                Ok(()) => {}
            }

            if terminate {
                // Discard the rest now that we've decided to close rather
                // than dispatch them.
                let mut pending = self.pending.lock().unwrap();
                pending.clear();
                self.pending_count.store(0, Ordering::Release);
                let _ = self.waker.wake();
                break;
            }

            // Bounded backpressure between pipelined responses (spec.md
            // §4.3): don't start the next queued request until this one's
            // output has drained below the high watermark.
            {
                let mut q = self.buffer.lock().unwrap();
                while self.connected() && q.known_len() > self.adj.outbuf_high_watermark as u64 {
                    q = self.cond.wait(q).unwrap();
                }
            }
            self.pending_count.store(remaining, Ordering::Release);
            let _ = self.waker.wake();
        }
    }

    /// Abandon in-flight work and tear the channel down (idle timeout or
    /// shutdown request from the server).
    pub fn cancel(&self) {
        self.handle_close();
        let mut pending = self.pending.lock().unwrap();
        pending.clear();
        self.pending_count.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};

    use mio::Poll;

    use super::*;
    use crate::task::EchoFactory;

    /// Mirrors `tests/channel_scenarios.rs`'s `accept_pair`: a real loopback
    /// pair, registered once so `reregister` (called from `handle_read`/
    /// `handle_write`) has something to reregister.
    fn accept_pair() -> (Channel, StdTcpStream, Poll) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server_std, peer) = listener.accept().unwrap();
        server_std.set_nonblocking(true).unwrap();
        let mut mio_stream = TcpStream::from_std(server_std);

        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(999)).unwrap());
        poll.registry()
            .register(&mut mio_stream, Token(1), Interest::READABLE | Interest::WRITABLE)
            .unwrap();
        let adj = Arc::new(Adj::default());
        let channel = Channel::new(mio_stream, peer, Token(1), adj, waker);
        (channel, client, poll)
    }

    // spec.md §8 "No-overlap": the reactor must never observe a channel as
    // readable while a request is still pending dispatch/execution, nor
    // while output from a prior response hasn't finished draining.
    #[test]
    fn readable_is_false_while_a_request_is_pending() {
        let (channel, mut client, poll) = accept_pair();
        let factory = EchoFactory { expose_tracebacks: false };

        client.write_all(b"GET /x HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        assert!(channel.readable(), "nothing pending yet, should still be readable");
        let outcome = channel.handle_read(&factory, poll.registry()).unwrap();
        assert!(matches!(outcome, ReadOutcome::Dispatch));

        // A full request is now sitting in `pending`, unserviced.
        assert!(!channel.readable(), "pending_requests is non-empty, must not be readable");
    }

    #[test]
    fn readable_is_false_while_output_is_unflushed() {
        let (channel, mut client, poll) = accept_pair();
        let factory = EchoFactory { expose_tracebacks: false };

        client.write_all(b"GET /x HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        channel.handle_read(&factory, poll.registry()).unwrap();
        channel.service(&factory);

        // service() ran the task synchronously here (single-threaded test),
        // so pending_requests is empty again, but the response is still
        // sitting in the output queue until handle_write drains it.
        assert!(!channel.readable(), "unflushed output must block readability");

        // Drain it fully; only then should readability return.
        loop {
            channel.handle_write(poll.registry()).unwrap();
            let mut buf = [0u8; 256];
            client.set_read_timeout(Some(std::time::Duration::from_millis(200))).unwrap();
            match client.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if !channel.writable() {
                break;
            }
        }
        assert!(channel.readable(), "readable once the queue is fully drained");
    }

    // spec.md §8 "100-continue at most once": the preface latch must not
    // let a second one queue up even if handle_read were re-entered before
    // the body arrived.
    #[test]
    fn continue_preface_is_sent_only_once() {
        let (channel, mut client, poll) = accept_pair();
        let factory = EchoFactory { expose_tracebacks: false };

        client
            .write_all(b"POST /x HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\n")
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        let _ = channel.handle_read(&factory, poll.registry()).unwrap();
        assert!(channel.flags.sent_continue.load(Ordering::Acquire));

        // Nothing else arrived yet; re-polling readability must not queue a
        // second preface even though the parser hasn't finished the body.
        let _ = channel.handle_read(&factory, poll.registry());
        channel.handle_write(poll.registry()).unwrap();

        let mut buf = [0u8; 256];
        client.set_read_timeout(Some(std::time::Duration::from_millis(200))).unwrap();
        let n = client.read(&mut buf).unwrap_or(0);
        let received = &buf[..n];
        assert_eq!(
            received.windows(CONTINUE_PREFACE.len()).filter(|w| *w == CONTINUE_PREFACE).count(),
            1,
            "continue preface must appear exactly once: {:?}",
            String::from_utf8_lossy(received)
        );
    }
}

/// A fully-synthetic [`RequestParser`] used only to carry version/
/// connection context into a fallback [`crate::task::ErrorTask`] when a
/// worker panics-equivalent (returns an application error) after already
/// having written part of a response.
struct ClearedRequest {
    version: String,
    connection: Option<String>,
    error: String,
}

impl std::fmt::Debug for ClearedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClearedRequest").finish()
    }
}

impl RequestParser for ClearedRequest {
    fn received(&mut self, _data: &[u8]) -> usize {
        0
    }
    fn completed(&self) -> bool {
        true
    }
    fn headers_finished(&self) -> bool {
        true
    }
    fn empty(&self) -> bool {
        false
    }
    fn error(&self) -> Option<&str> {
        Some(&self.error)
    }
    fn expect_continue(&self) -> bool {
        false
    }
    fn clear_expect_continue(&mut self) {}
    fn version(&self) -> &str {
        &self.version
    }
    fn method(&self) -> &str {
        ""
    }
    fn path(&self) -> &str {
        ""
    }
    fn header(&self, name: &str) -> Option<&str> {
        if name.eq_ignore_ascii_case("connection") {
            self.connection.as_deref()
        } else {
            None
        }
    }
    fn body(&self) -> &[u8] {
        &[]
    }
    fn clear(&mut self) {}
}
