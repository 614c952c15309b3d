//! Demo entry point: loads a YAML config, starts the reactor with the
//! reference echo factory. Mirrors the teacher's `src/bin/main.rs` shape
//! (`AppConfig::from_str` → `Poll::new()` → `Server::new` → `server.run`).

use std::path::PathBuf;
use std::sync::Arc;

use chanserve::config::ServerSettings;
use chanserve::server::Server;
use chanserve::task::EchoFactory;

fn main() -> chanserve::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("chanserve.yaml"));

    let settings = ServerSettings::load(&config_path)?;
    let factory = Arc::new(EchoFactory { expose_tracebacks: settings.adj.expose_tracebacks });

    let mut server = Server::new(settings, factory)?;
    tracing::info!("server starting");
    server.run()
}
