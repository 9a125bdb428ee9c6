//! Service assembly and lifecycle
//!
//! Builds the whole acquisition graph from a config snapshot: connections
//! and their dispatchers, virtual slaves, per-device pollers, the parser,
//! sink writers and the rule engine. Startup is best-effort: an invalid
//! connection is refused, a slave that cannot bind is skipped, and a
//! connection that fails to open is retried on first use.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::spec::ConnectionSpec;
use crate::config::AppConfig;
use crate::core::dispatch::{spawn_dispatcher, DispatcherHandle};
use crate::core::events::{pipeline, PipelineTx};
use crate::core::parser::spawn_parser;
use crate::core::poller::{spawn_poller, PollerCtx};
use crate::core::rules::{spawn_rule_engine, Rule, RuleContext};
use crate::core::{ChangeTracker, Connection, ConnectionManager};
use crate::sinks::writer::{spawn_batch_writer, spawn_change_publisher};
use crate::sinks::{BrokerPublisher, TimeSeriesSink};
use crate::slave::{SlaveHandle, SlaveManager};
use crate::utils::error::Result;

/// External collaborators injected at startup
#[derive(Default)]
pub struct Collaborators {
    pub sink: Option<Arc<dyn TimeSeriesSink>>,
    pub broker: Option<Arc<dyn BrokerPublisher>>,
    pub rules: Vec<Arc<dyn Rule>>,
}

/// The running service
pub struct Runtime {
    shutdown: CancellationToken,
    manager: Arc<ConnectionManager>,
    dispatchers: HashMap<String, DispatcherHandle>,
    slaves: HashMap<String, Arc<SlaveHandle>>,
    pipeline_tx: PipelineTx,
    tasks: Vec<JoinHandle<()>>,
    max_timeout: std::time::Duration,
}

impl Runtime {
    /// Wire everything up and start the tasks
    pub async fn start(config: Arc<AppConfig>, collaborators: Collaborators) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        // Refuse structurally broken connections, keep the rest running
        let mut specs: Vec<Arc<ConnectionSpec>> = Vec::new();
        for conn in &config.connections {
            if !conn.enabled {
                info!(conn_id = %conn.conn_id, "connection disabled, skipping");
                continue;
            }
            match conn.validate() {
                Ok(()) => specs.push(Arc::new(conn.clone())),
                Err(e) => {
                    error!(conn_id = %conn.conn_id, "connection refused: {e}");
                },
            }
        }

        let manager = Arc::new(ConnectionManager::new(specs.iter().cloned()));
        let tracker = Arc::new(ChangeTracker::new());
        let slave_manager = SlaveManager::new(shutdown.clone());

        let (tx, rx) = pipeline(config.service.parser_queue, config.service.event_queue);

        tasks.push(spawn_parser(
            rx.acquired,
            tx.clone(),
            tracker.clone(),
            shutdown.child_token(),
        ));
        tasks.push(spawn_batch_writer(
            rx.parsed,
            collaborators.sink.clone(),
            collaborators.broker.clone(),
            config.mqtt.base_topic.clone(),
            shutdown.child_token(),
        ));
        tasks.push(spawn_change_publisher(
            rx.changes,
            collaborators.broker.clone(),
            config.mqtt.base_topic.clone(),
            shutdown.child_token(),
        ));

        let mut dispatchers = HashMap::new();
        let mut slaves = HashMap::new();
        let mut connections_by_id = HashMap::new();
        let mut max_timeout = std::time::Duration::from_secs(1);

        for spec in &specs {
            max_timeout = max_timeout.max(spec.timeout);
            connections_by_id.insert(spec.conn_id.clone(), spec.clone());

            // Transports are lazy: building the connection does no I/O, the
            // first request opens it
            let connection = Arc::new(Connection::new(spec.clone()));
            manager.insert(connection.clone()).await;

            let (handle, task) = spawn_dispatcher(connection, shutdown.child_token());
            tasks.push(task);
            dispatchers.insert(spec.conn_id.clone(), handle.clone());

            // A slave that cannot bind is logged and skipped, acquisition
            // still runs
            let slave = match slave_manager
                .start_slave(&spec.conn_id, spec.slave_port)
                .await
            {
                Ok(slave) => {
                    slaves.insert(spec.conn_id.clone(), slave.clone());
                    Some(slave)
                },
                Err(e) => {
                    warn!(conn_id = %spec.conn_id, "virtual slave skipped: {e}");
                    None
                },
            };

            for device in &spec.devices {
                let ctx = PollerCtx {
                    connection: spec.clone(),
                    device: Arc::new(device.clone()),
                    dispatcher: handle.clone(),
                    acquired_tx: tx.acquired.clone(),
                    slave: slave.clone(),
                    shutdown: shutdown.child_token(),
                };
                if let Some(task) = spawn_poller(ctx) {
                    tasks.push(task);
                }
            }
        }

        let rule_ctx = Arc::new(RuleContext::new(
            dispatchers.clone(),
            connections_by_id,
            shutdown.child_token(),
        ));
        tasks.push(spawn_rule_engine(
            rx.rule_events,
            collaborators.rules,
            rule_ctx,
            shutdown.child_token(),
        ));

        info!(
            connections = specs.len(),
            slaves = slaves.len(),
            "acquisition service started"
        );

        Ok(Self {
            shutdown,
            manager,
            dispatchers,
            slaves,
            pipeline_tx: tx,
            tasks,
            max_timeout,
        })
    }

    /// Dispatcher handle for on-demand reads and writes from outside
    pub fn dispatcher(&self, conn_id: &str) -> Option<&DispatcherHandle> {
        self.dispatchers.get(conn_id)
    }

    /// Running slave instance of one connection
    pub fn slave(&self, conn_id: &str) -> Option<&Arc<SlaveHandle>> {
        self.slaves.get(conn_id)
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Sending side of the pipeline. External acquisition sources (and
    /// tests) feed ticks in through this.
    pub fn pipeline(&self) -> &PipelineTx {
        &self.pipeline_tx
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop everything: cancel the tasks, give each loop one timeout period
    /// to exit, then close the connections.
    pub async fn shutdown(mut self) {
        info!("shutting down acquisition service");
        self.shutdown.cancel();

        let budget = self.max_timeout;
        for task in self.tasks.drain(..) {
            match tokio::time::timeout(budget, task).await {
                Ok(_) => {},
                Err(_) => warn!("task did not stop within {budget:?}, abandoning"),
            }
        }

        self.manager.shutdown().await;
        info!("acquisition service stopped");
    }
}

/// Wait for Ctrl+C or SIGTERM
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}; only Ctrl+C will work");
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(mut sig) = term_signal {
                    sig.recv().await;
                } else {
                    std::future::pending::<()>().await
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
