//! Error kinds surfaced by the channel core (spec §7).

use std::io;

/// Raised from [`crate::channel::Channel::write_soon`] when the peer is gone.
///
/// Workers propagate this up to their own task loop; the reactor never sees
/// it directly (it tears the channel down once `connected` goes false).
#[derive(Debug, thiserror::Error)]
#[error("client disconnected")]
pub struct ClientDisconnected;

/// Everything else the core can fail with.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("client disconnected")]
    ClientDisconnected,

    #[error("request parse error: {0}")]
    Parser(String),

    #[error("application error: {0}")]
    Application(String),

    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("buffer error: {0}")]
    Buffer(String),
}

impl From<ClientDisconnected> for ChannelError {
    fn from(_: ClientDisconnected) -> Self {
        ChannelError::ClientDisconnected
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
