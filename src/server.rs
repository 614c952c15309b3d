//! Reactor loop, listener bookkeeping, and worker thread pool (spec §4.4
//! "Server hooks" — ambient plumbing the crate needs to be runnable).
//!
//! Grounded on the teacher's `src/bin/main.rs` (`mio::Poll::new()`,
//! `Server::new`, `server.run(poll)`) for the overall shape, and on its
//! `src/http/http_connection.rs` read/write-phase split for how a single
//! channel's readiness event is handled. The worker hand-off generalizes
//! the teacher's CGI-subprocess-as-offload pattern into a plain
//! `std::thread` pool fed by `std::sync::mpsc`, since this crate has no
//! subprocess concept in scope.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::channel::{Channel, ReadOutcome};
use crate::config::{Adj, ServerSettings};
use crate::error::{ChannelError, Result};
use crate::task::RequestFactory;

const WAKER_TOKEN: Token = Token(usize::MAX);
const LISTENER_TOKEN_BASE: usize = 0;
const CHANNEL_TOKEN_BASE: usize = 1_000_000;

struct WorkQueue {
    receiver: Mutex<Receiver<Arc<Channel>>>,
}

/// Owns the `mio::Poll` reactor, one or more listeners, the worker pool,
/// and the live channel table.
pub struct Server {
    poll: Poll,
    listeners: Vec<(Token, TcpListener)>,
    channels: HashMap<Token, Arc<Channel>>,
    next_channel_token: usize,
    factory: Arc<dyn RequestFactory>,
    settings: Arc<ServerSettings>,
    adj: Arc<Adj>,
    waker: Arc<Waker>,
    task_tx: Sender<Arc<Channel>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(settings: ServerSettings, factory: Arc<dyn RequestFactory>) -> Result<Self> {
        let settings = Arc::new(settings);
        let mut poll = Poll::new().map_err(ChannelError::Socket)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(ChannelError::Socket)?);

        let mut listeners = Vec::new();
        for (i, l) in settings.listeners.iter().enumerate() {
            let addr: SocketAddr = format!("{}:{}", l.host, l.port)
                .parse()
                .map_err(|e| ChannelError::Application(format!("bad listener address: {e}")))?;
            let mut listener = TcpListener::bind(addr).map_err(ChannelError::Socket)?;
            let token = Token(LISTENER_TOKEN_BASE + i);
            poll.registry()
                .register(&mut listener, token, Interest::READABLE)
                .map_err(ChannelError::Socket)?;
            listeners.push((token, listener));
        }

        let adj = Arc::new(settings.adj.clone());
        let (task_tx, task_rx) = mpsc::channel::<Arc<Channel>>();
        let work = Arc::new(WorkQueue { receiver: Mutex::new(task_rx) });
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(settings.workers);
        for i in 0..settings.workers.max(1) {
            let work = Arc::clone(&work);
            let factory = Arc::clone(&factory);
            let shutdown = Arc::clone(&shutdown);
            let handle = std::thread::Builder::new()
                .name(format!("chanserve-worker-{i}"))
                .spawn(move || worker_loop(work, factory, shutdown))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Ok(Self {
            poll,
            listeners,
            channels: HashMap::new(),
            next_channel_token: CHANNEL_TOKEN_BASE,
            factory,
            settings,
            adj,
            waker,
            task_tx,
            workers,
            shutdown,
        })
    }

    fn accept_all(&mut self, listener_token: Token) -> Result<()> {
        let listener_idx = self.listeners.iter().position(|(t, _)| *t == listener_token);
        let Some(idx) = listener_idx else { return Ok(()) };
        loop {
            let (mut stream, peer) = match self.listeners[idx].1.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(ChannelError::Socket(e)),
            };
            let token = Token(self.next_channel_token);
            self.next_channel_token += 1;
            self.poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
                .map_err(ChannelError::Socket)?;
            let channel = Arc::new(Channel::new(
                stream,
                peer,
                token,
                Arc::clone(&self.adj),
                Arc::clone(&self.waker),
            ));
            tracing::debug!(?peer, "accepted connection");
            self.channels.insert(token, channel);
        }
    }

    fn dispatch(&self, channel: &Arc<Channel>) {
        let _ = self.task_tx.send(Arc::clone(channel));
    }

    /// Run the reactor loop until `shutdown` is requested.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        let timeout = Duration::from_secs(1);

        while !self.shutdown.load(Ordering::Acquire) {
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChannelError::Socket(e)),
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                if self.listeners.iter().any(|(t, _)| *t == token) {
                    if let Err(e) = self.accept_all(token) {
                        if self.settings.adj.log_socket_errors {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                    continue;
                }

                let Some(channel) = self.channels.get(&token).cloned() else { continue };

                if event.is_readable() && channel.readable() {
                    match channel.handle_read(self.factory.as_ref(), self.poll.registry()) {
                        Ok(ReadOutcome::Dispatch) => self.dispatch(&channel),
                        Ok(_) => {}
                        Err(e) => {
                            if self.settings.adj.log_socket_errors {
                                tracing::warn!(error = %e, token = ?token, "read failed");
                            }
                        }
                    }
                }

                if event.is_writable() && channel.connected() {
                    if let Err(e) = channel.handle_write(self.poll.registry()) {
                        if self.settings.adj.log_socket_errors {
                            tracing::warn!(error = %e, token = ?token, "write failed");
                        }
                    }
                }
            }

            // Waker wakeups and the timeout both land here: re-check every
            // live channel's writability (a worker may have appended data
            // without a fresh READABLE/WRITABLE mio event arriving) and
            // sweep idle ones.
            self.flush_ready_writes();
            self.sweep_idle();
            self.reap_closed();
        }
        Ok(())
    }

    fn flush_ready_writes(&mut self) {
        for channel in self.channels.values() {
            if channel.connected() && channel.writable() {
                let _ = channel.handle_write(self.poll.registry());
            }
        }
    }

    fn sweep_idle(&mut self) {
        let timeout_ms = self.settings.adj.channel_timeout_secs * 1000;
        for channel in self.channels.values() {
            if channel.idle_ms() > timeout_ms {
                channel.cancel();
            }
        }
    }

    fn reap_closed(&mut self) {
        let dead: Vec<Token> = self
            .channels
            .iter()
            .filter(|(_, c)| c.should_remove())
            .map(|(t, _)| *t)
            .collect();
        for token in dead {
            if let Some(channel) = self.channels.remove(&token) {
                let _ = channel.deregister(self.poll.registry());
                tracing::debug!(?token, peer = ?channel.peer_addr(), "closing connection");
            }
        }
    }

    /// Wake the reactor out of `poll()` — used by `write_soon` so a
    /// worker's append is flushed promptly instead of waiting for the
    /// next timeout tick.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for channel in self.channels.values() {
            channel.cancel();
        }
        drop(std::mem::take(&mut self.channels));
        // Dropping task_tx's last sender lets worker_loop's recv() return
        // Err and exit; join them so no threads leak past the server.
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(work: Arc<WorkQueue>, factory: Arc<dyn RequestFactory>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let channel = {
            let rx = work.receiver.lock().unwrap();
            match rx.recv_timeout(Duration::from_millis(250)) {
                Ok(channel) => channel,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return,
            }
        };
        channel.service(factory.as_ref());
    }
}
