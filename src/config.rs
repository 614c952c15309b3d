//! `adj` configuration record (spec §6) plus server/listener settings,
//! loaded via `serde` + `serde_yaml`.
//!
//! The teacher's own `src/config.rs` already reached for `serde`/
//! `serde_yaml` before the crate's config subsystem forked into two
//! incompatible hand-rolled YAML engines (`config_handler::parser` and the
//! separate `parser`/`parser_derive` crates). This crate consolidates on
//! the one real approach the teacher had already started down.

use std::path::Path;

use serde::Deserialize;

use crate::error::{ChannelError, Result};

fn default_outbuf_overflow() -> usize {
    1_048_576
}

fn default_outbuf_high_watermark() -> usize {
    16 * 1_048_576
}

fn default_send_bytes() -> usize {
    18_000
}

fn default_recv_bytes() -> usize {
    8192
}

fn default_channel_timeout_secs() -> u64 {
    120
}

/// Tunables for a channel's buffering and logging behavior (spec §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Adj {
    /// Bytes an in-RAM accumulator may hold before spilling to a temp file.
    pub outbuf_overflow: usize,
    /// Output queue size above which `write_soon` blocks the worker.
    pub outbuf_high_watermark: usize,
    /// Bytes attempted per non-blocking `send`.
    pub send_bytes: usize,
    /// Bytes attempted per non-blocking `recv`.
    pub recv_bytes: usize,
    /// Emit a `WARN`-level `tracing` event for unexpected socket errors.
    pub log_socket_errors: bool,
    /// Include error detail/tracebacks in synthesized 500 bodies.
    pub expose_tracebacks: bool,
    /// Idle channels older than this are cancelled by the reactor sweep.
    pub channel_timeout_secs: u64,
}

impl Default for Adj {
    fn default() -> Self {
        Self {
            outbuf_overflow: default_outbuf_overflow(),
            outbuf_high_watermark: default_outbuf_high_watermark(),
            send_bytes: default_send_bytes(),
            recv_bytes: default_recv_bytes(),
            log_socket_errors: true,
            expose_tracebacks: false,
            channel_timeout_secs: default_channel_timeout_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}

/// A single bind address this server should listen on.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
}

/// Top-level server settings: where to listen, how many workers, and the
/// shared `adj` tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub listeners: Vec<ListenerConfig>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub adj: Adj,
}

impl ServerSettings {
    pub fn from_yaml_str(s: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(s)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(ChannelError::Socket)?;
        Self::from_yaml_str(&text)
            .map_err(|e| ChannelError::Application(format!("invalid config at {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adj_defaults_are_populated() {
        let adj = Adj::default();
        assert_eq!(adj.recv_bytes, 8192);
        assert!(adj.log_socket_errors);
    }

    #[test]
    fn loads_minimal_yaml() {
        let yaml = "listeners:\n  - host: 0.0.0.0\n    port: 8080\n";
        let settings = ServerSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.listeners.len(), 1);
        assert_eq!(settings.listeners[0].port, 8080);
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.adj.outbuf_overflow, default_outbuf_overflow());
    }

    #[test]
    fn overrides_adj_fields() {
        let yaml = "listeners:\n  - host: 127.0.0.1\n    port: 9000\nadj:\n  send_bytes: 4096\n  log_socket_errors: false\n";
        let settings = ServerSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.adj.send_bytes, 4096);
        assert!(!settings.adj.log_socket_errors);
        assert_eq!(settings.adj.recv_bytes, default_recv_bytes());
    }
}
