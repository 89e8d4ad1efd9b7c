//! Composition root.
//!
//! [`Runtime::build`] wires the durable store, topology registry, mesh
//! discovery, pulse detection, and the saga manager into one [`ApiContext`]
//! and starts the background workers; [`Runtime::run`] serves the control
//! API until Ctrl+C and then stops everything. Nothing here is a global:
//! tests build a runtime against in-memory storage and drive the router
//! directly.

use std::sync::Arc;

use deadpool_lapin::{Manager, Pool};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::api::{self, ApiContext};
use crate::config::{Config, LOG_ENV_VAR};
use crate::mesh::{spawn_sweep_loop, MeshService};
use crate::pulse::{
    spawn_watch_loop, DeadLetterListener, DirectHttpChannel, EscalationChannel, EventDispatcher,
    EventLog, MeshWatcher, PulseService, SqliteJournalStore, TaskQueueChannel,
};
use crate::registry::{RegistryStore, SidecarEntry, SqliteRegistryStore};
use crate::saga::{HttpToolInvoker, SagaManager, SqliteSagaStore};
use crate::storage;
use crate::worker::WorkerHandle;

/// Initialize tracing from the `MESHWARDEN_LOG` environment variable.
///
/// Defaults to "info" level if the variable is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// All wired services plus the workers that animate them.
pub struct Runtime {
    context: Arc<ApiContext>,
    host: String,
    port: u16,
    workers: Vec<WorkerHandle>,
}

impl Runtime {
    /// Build every service from configuration and start the background
    /// workers.
    ///
    /// The broker pool hands out connections lazily, so a broker that is
    /// down at startup only affects the calls that need it; the dead-letter
    /// listener keeps reconnecting on its own schedule.
    pub async fn build(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let pool = storage::connect(&config.storage.database_url).await?;
        storage::create_tables(&pool).await?;

        let registry: Arc<dyn RegistryStore> = Arc::new(SqliteRegistryStore::new(pool.clone()));
        for seed in &config.sidecars {
            let entry = SidecarEntry {
                name: seed.name.clone(),
                url: seed.url.clone(),
                host_url: seed.host_url.clone(),
                tools_count: seed.tools_count,
                category: seed.category.clone(),
            };
            registry.upsert(&entry).await?;
        }
        if !config.sidecars.is_empty() {
            info!(count = config.sidecars.len(), "Seeded topology registry");
        }

        let mesh = Arc::new(MeshService::new(Arc::clone(&registry), &config.mesh));

        let log = Arc::new(EventLog::new(config.pulse.event_log_capacity));
        let journal = Arc::new(SqliteJournalStore::new(pool.clone()));
        let pulse = Arc::new(PulseService::new(Arc::clone(&log), journal));

        let mut channels: Vec<Arc<dyn EscalationChannel>> = Vec::new();
        let amqp_pool = match &config.messaging {
            Some(messaging) => {
                let manager = Manager::new(messaging.url.clone(), Default::default());
                let amqp_pool = Pool::builder(manager).max_size(10).build()?;
                channels.push(Arc::new(TaskQueueChannel::new(
                    amqp_pool.clone(),
                    messaging.clone(),
                )));
                Some(amqp_pool)
            }
            None => {
                warn!("No messaging configured; dead-letter listening and queue escalation disabled");
                None
            }
        };
        if let Some(url) = &config.pulse.dispatch_url {
            channels.push(Arc::new(DirectHttpChannel::new(
                url.clone(),
                config.pulse.dispatch_timeout(),
            )?));
        }
        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&log),
            channels,
            config.pulse.remediation_agent.clone(),
            config.pulse.task_priority,
        ));

        let saga_store = Arc::new(SqliteSagaStore::new(pool.clone()));
        let invoker = Arc::new(HttpToolInvoker::new(
            Arc::clone(&registry),
            config.saga.tool_timeout(),
        ));
        let sagas = Arc::new(SagaManager::new(saga_store, invoker));

        let mut workers = Vec::new();
        workers.push(spawn_sweep_loop(
            Arc::clone(&mesh),
            config.mesh.sweep_interval(),
        ));
        let watcher = Arc::new(MeshWatcher::new(Arc::clone(&mesh), Arc::clone(&dispatcher)));
        workers.push(spawn_watch_loop(watcher, config.pulse.watch_interval()));
        if let (Some(amqp_pool), Some(messaging)) = (amqp_pool, &config.messaging) {
            let listener = DeadLetterListener::new(
                amqp_pool,
                messaging.clone(),
                Arc::clone(&dispatcher),
                config.pulse.reconnect_delay(),
                pulse.queue_flag(),
            );
            workers.push(listener.spawn());
        }
        pulse.mark_running(true);

        info!(
            sidecars = config.sidecars.len(),
            messaging = config.messaging.is_some(),
            "Runtime initialized"
        );

        Ok(Runtime {
            context: Arc::new(ApiContext { mesh, pulse, sagas }),
            host: config.server.host.clone(),
            port: config.server.port,
            workers,
        })
    }

    /// Shared handler state, exposed for tests that drive the router
    /// directly.
    pub fn context(&self) -> Arc<ApiContext> {
        Arc::clone(&self.context)
    }

    /// Serve the control API until Ctrl+C, then stop the workers.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let context = Arc::clone(&self.context);
        let host = self.host.clone();
        let port = self.port;

        let server = tokio::spawn(async move {
            if let Err(e) = api::serve(context, &host, port).await {
                error!(error = %e, "control API server failed");
            }
        });

        info!("Runtime running, press Ctrl+C to exit");
        tokio::signal::ctrl_c().await?;

        info!("Shutting down runtime");
        for worker in &self.workers {
            worker.stop();
        }
        server.abort();

        Ok(())
    }
}

/// Build the runtime from configuration and run it to completion.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Runtime::build(config).await?;
    runtime.run().await
}
