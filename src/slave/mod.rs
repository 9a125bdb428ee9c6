//! Virtual slave fan-out
//!
//! Every enabled connection gets a local Modbus TCP server mirroring its
//! latest acquisition, so third-party clients read consolidated state
//! without touching the field network.

pub mod image;
pub mod server;

use std::collections::HashSet;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::spec::RegisterKind;
use crate::utils::error::{AcqError, Result};

pub use image::SlaveImage;

/// Automatic allocation range for unset slave ports
pub const AUTO_PORT_START: u16 = 60000;
pub const AUTO_PORT_END: u16 = 65535;
const AUTO_PORT_ATTEMPTS: u32 = 1000;

/// One running slave instance
#[derive(Debug)]
pub struct SlaveHandle {
    conn_id: String,
    port: u16,
    image: Arc<RwLock<SlaveImage>>,
    task: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl SlaveHandle {
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Mirror one acquired block into the slave image. Atomic per block:
    /// the write lock covers the whole range.
    pub async fn apply_block(&self, kind: RegisterKind, start: u16, words: &[u16]) {
        self.image.write().await.apply_block(kind, start, words);
    }

    /// Snapshot a word range (tests and diagnostics)
    pub async fn read_words(&self, kind: RegisterKind, start: u16, count: u16) -> Vec<u16> {
        self.image.read().await.read_words(kind, start, count)
    }

    /// Snapshot a bit range (tests and diagnostics)
    pub async fn read_bits(&self, kind: RegisterKind, start: u16, count: u16) -> Vec<bool> {
        self.image.read().await.read_bits(kind, start, count)
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

/// Creates slave instances and owns port allocation for the process
pub struct SlaveManager {
    used_ports: Mutex<HashSet<u16>>,
    next_auto: Mutex<u16>,
    shutdown: CancellationToken,
}

impl SlaveManager {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            used_ports: Mutex::new(HashSet::new()),
            next_auto: Mutex::new(AUTO_PORT_START),
            shutdown,
        }
    }

    /// Start a slave for one connection. An explicit port that is already
    /// taken fails outright; an unset port is allocated from the automatic
    /// range by probe-binding.
    pub async fn start_slave(
        &self,
        conn_id: &str,
        slave_port: Option<u16>,
    ) -> Result<Arc<SlaveHandle>> {
        let (listener, port) = match slave_port {
            Some(port) if port > 0 => {
                let mut used = self.used_ports.lock().await;
                if used.contains(&port) {
                    return Err(AcqError::config(format!(
                        "slave port {port} already taken by another slave"
                    )));
                }
                let listener = TcpListener::bind(("127.0.0.1", port))
                    .await
                    .map_err(|e| {
                        AcqError::config(format!("cannot bind slave port {port}: {e}"))
                    })?;
                used.insert(port);
                (listener, port)
            },
            _ => self.allocate_auto_port().await?,
        };

        let image = Arc::new(RwLock::new(SlaveImage::new()));
        let shutdown = self.shutdown.child_token();
        let task = server::spawn_server(listener, image.clone(), shutdown.clone());

        info!(conn_id, port, "virtual slave started");
        Ok(Arc::new(SlaveHandle {
            conn_id: conn_id.to_string(),
            port,
            image,
            task,
            shutdown,
        }))
    }

    async fn allocate_auto_port(&self) -> Result<(TcpListener, u16)> {
        let mut used = self.used_ports.lock().await;
        let mut next = self.next_auto.lock().await;
        let mut candidate = *next;

        for _ in 0..AUTO_PORT_ATTEMPTS {
            if !used.contains(&candidate) {
                match TcpListener::bind(("127.0.0.1", candidate)).await {
                    Ok(listener) => {
                        used.insert(candidate);
                        *next = wrap_next(candidate);
                        return Ok((listener, candidate));
                    },
                    Err(e) => {
                        warn!(port = candidate, "auto slave port busy: {e}");
                    },
                }
            }
            candidate = wrap_next(candidate);
        }

        Err(AcqError::config(format!(
            "no free slave port after {AUTO_PORT_ATTEMPTS} attempts"
        )))
    }

    /// Release an explicit port after its slave stopped
    pub async fn release_port(&self, port: u16) {
        self.used_ports.lock().await.remove(&port);
    }
}

fn wrap_next(port: u16) -> u16 {
    if port >= AUTO_PORT_END {
        AUTO_PORT_START
    } else {
        port + 1
    }
}
