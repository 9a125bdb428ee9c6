//! Connection registry
//!
//! Seeded with every configured spec at startup; `Connection` instances are
//! created on first use and shared from then on. A per-id guard coalesces
//! concurrent `ensure` calls so at most one connect runs per upstream.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::spec::ConnectionSpec;
use crate::utils::error::{AcqError, Result};

use super::connection::Connection;

pub struct ConnectionManager {
    specs: HashMap<String, Arc<ConnectionSpec>>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConnectionManager {
    pub fn new(specs: impl IntoIterator<Item = Arc<ConnectionSpec>>) -> Self {
        let specs = specs
            .into_iter()
            .map(|spec| (spec.conn_id.clone(), spec))
            .collect();
        Self {
            specs,
            connections: RwLock::new(HashMap::new()),
            guards: Mutex::new(HashMap::new()),
        }
    }

    pub fn spec(&self, conn_id: &str) -> Option<Arc<ConnectionSpec>> {
        self.specs.get(conn_id).cloned()
    }

    async fn guard_for(&self, conn_id: &str) -> Arc<Mutex<()>> {
        let mut guards = self.guards.lock().await;
        guards
            .entry(conn_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Get the shared connection, constructing and opening it on first use.
    /// On failure the instance is discarded so the next call starts from
    /// scratch.
    pub async fn ensure(&self, conn_id: &str) -> Result<Arc<Connection>> {
        if let Some(conn) = self.connections.read().await.get(conn_id) {
            return Ok(conn.clone());
        }

        let guard = self.guard_for(conn_id).await;
        let _held = guard.lock().await;

        // A racing caller may have finished while we waited on the guard
        if let Some(conn) = self.connections.read().await.get(conn_id) {
            return Ok(conn.clone());
        }

        let spec = self.spec(conn_id).ok_or_else(|| {
            AcqError::config(format!("unknown connection '{conn_id}'"))
        })?;

        let conn = Arc::new(Connection::new(spec));
        if let Err(e) = conn.open().await {
            warn!(conn_id, "connection open failed: {e}");
            return Err(e);
        }

        self.connections
            .write()
            .await
            .insert(conn_id.to_string(), conn.clone());
        info!(conn_id, "connection registered");
        Ok(conn)
    }

    /// Register a pre-built connection (tests inject mock-backed ones)
    pub async fn insert(&self, conn: Arc<Connection>) {
        let conn_id = conn.spec().conn_id.clone();
        self.connections.write().await.insert(conn_id, conn);
    }

    /// Close and drop one connection. Idempotent.
    pub async fn close(&self, conn_id: &str) {
        if let Some(conn) = self.connections.write().await.remove(conn_id) {
            conn.close().await;
            info!(conn_id, "connection closed");
        }
    }

    /// Close everything and wait for the transports to let go
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.connections.write().await.drain().collect();
        for (conn_id, conn) in drained {
            conn.close().await;
            info!(conn_id, "connection closed");
        }
    }
}
