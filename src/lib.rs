//! Connection-layer core for a non-blocking HTTP/1.x reactor bridging to a
//! pool of blocking worker threads: a typed [`buffer::Buffer`], a FIFO
//! [`output_queue::OutputQueue`] built from them, and a [`channel::Channel`]
//! state machine tying socket readiness to request parsing and worker
//! dispatch.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod output_queue;
pub mod parser;
pub mod server;
pub mod task;

pub use channel::Channel;
pub use config::{Adj, ServerSettings};
pub use error::{ChannelError, ClientDisconnected, Result};
pub use server::Server;
