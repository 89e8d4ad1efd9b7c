//! meshwarden-server: resilience core for a sidecar mesh
//!
//! Discovers and health-checks the registered sidecar topology, translates
//! dead-lettered work and topology changes into pulse events, escalates
//! anything above informational severity to a remediation agent, and
//! coordinates multi-sidecar workflows as compensating sagas.
//!
//! ## Architecture
//! ```text
//! [Registry] -> [mesh sweep] -> snapshot -> [mesh watcher] --\
//!                                                            v
//! [Broker DLQ] -> [dead-letter listener] ---------> [event dispatcher]
//!                                                            |
//!                                             +--------------+------------+
//!                                             v                           v
//!                                      [task queue]               [direct HTTP]
//!
//! [HTTP API :8180] -> /mesh, /pulse, /sagas
//! ```
//!
//! ## Configuration
//! - First CLI argument: path to a YAML configuration file
//! - MESHWARDEN_CONFIG: configuration file path, applied after the CLI file
//! - MESHWARDEN__SERVER__PORT etc.: environment overrides per config key
//! - MESHWARDEN_LOG: tracing filter (default: info)

use tracing::error;

use meshwarden::config::Config;
use meshwarden::server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    server::init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    server::run(config).await
}
