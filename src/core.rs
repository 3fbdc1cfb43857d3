//! The root object owning every component, and process lifecycle.
//!
//! All mutable state hangs off `Core` and is threaded by constructor
//! injection; there is no static mutable state besides the metrics
//! registry. Shutdown is staged: stop accepting work, drain live
//! sessions for the configured window, then force-close what remains.

use crate::config::Config;
use crate::context::ContextStore;
use crate::credentials::CredentialStore;
use crate::dispatch::Dispatcher;
use crate::error::{ConfigError, Result};
use crate::registry::{CloseReason, InstanceRegistry};
use crate::store::{MemoryStore, SqliteStore, StateStore};
use crate::tasks::TaskManager;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// The assembled control plane.
pub struct Core {
    pub config: Config,
    pub store: Arc<dyn StateStore>,
    pub credentials: CredentialStore,
    pub registry: Arc<InstanceRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub tasks: Arc<TaskManager>,
    pub context: Arc<ContextStore>,
    shutdown_tx: watch::Sender<bool>,
}

impl Core {
    /// Build every component against the configured state store.
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let store: Arc<dyn StateStore> = match config.state_store_url.as_deref() {
            None => Arc::new(MemoryStore::new()),
            Some(url) if url.starts_with("sqlite:") => Arc::new(SqliteStore::connect(url).await?),
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported STATE_STORE_URL scheme: {other}"
                ))
                .into());
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(InstanceRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone()));
        let tasks = Arc::new(TaskManager::new(
            store.clone(),
            dispatcher.clone(),
            config.dispatch_default_deadline,
            config.task_max_retries,
            shutdown_rx,
        ));

        Ok(Arc::new(Self {
            credentials: CredentialStore::new(store.clone()),
            store,
            registry,
            dispatcher,
            tasks,
            context: Arc::new(ContextStore::new()),
            config,
            shutdown_tx,
        }))
    }

    /// A receiver that flips to true once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Drain every live session of a bot. Used by definition deletion
    /// and admin force-close.
    pub fn teardown_bot(&self, bot_id: &str, reason: CloseReason) {
        for handle in self.registry.list_by_bot(bot_id) {
            handle.begin_drain(reason);
        }
    }

    /// Run until SIGINT/SIGTERM. Returns once every surface has drained.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let shutdown_rx = self.shutdown_signal();

        let admin_state = Arc::new(crate::api::ApiState::new(self.clone()));
        let admin = crate::api::start_admin_server(
            self.config.admin_address,
            admin_state,
            shutdown_rx.clone(),
        )
        .await?;

        let mut metrics = None;
        if let Some(bind) = self.config.metrics_address {
            metrics = Some(crate::telemetry::start_metrics_server(bind, shutdown_rx.clone()).await?);
        }

        let sweeper = self.context.spawn_sweeper(shutdown_rx.clone());
        self.tasks.recover().await?;

        let listener = {
            let core = self.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move { crate::session::run_listener(core, shutdown_rx).await })
        };

        wait_for_signal().await;
        tracing::info!("shutdown signal received");

        // Stop accepting new connections and REST calls first, then give
        // sessions the drain window before the process exits.
        let _ = self.shutdown_tx.send(true);
        self.drain_sessions().await;

        for handle in self.registry.all() {
            handle.begin_drain(CloseReason::Shutdown);
        }

        let _ = admin.await;
        if let Some(metrics) = metrics {
            let _ = metrics.await;
        }
        let _ = sweeper.await;
        match listener.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::error!(%error, "data-plane listener failed"),
            Err(error) => tracing::error!(%error, "data-plane listener panicked"),
        }

        tracing::info!("shutdown complete");
        Ok(())
    }

    /// Wait up to the drain window for sessions to tear themselves down.
    async fn drain_sessions(&self) {
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while !self.registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.registry.len();
        if remaining > 0 {
            tracing::warn!(remaining, "force-closing sessions after drain window");
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("SIGTERM handler installs at startup");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
