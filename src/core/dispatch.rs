//! Per-connection priority dispatch
//!
//! All read and write traffic for one upstream funnels through a single
//! dispatcher task, so at most one request is in flight on a connection at
//! any time. Pending requests wait in a binary heap keyed by priority with
//! FIFO order inside one priority level.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::spec::DeviceSpec;
use crate::core::events::BlockOutcome;
use crate::utils::error::{AcqError, Result};

use super::connection::Connection;

/// Writes pre-empt everything
pub const PRIORITY_WRITE: i32 = 10;
/// Reads triggered by an external caller or rule
pub const PRIORITY_ON_DEMAND_READ: i32 = 2;
/// Background poll reads
pub const PRIORITY_BACKGROUND_READ: i32 = 1;

/// Budget from submission to completion, dispatcher wait included
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What the dispatcher should do on the wire
#[derive(Debug, Clone)]
pub enum RequestKind {
    /// Read every block of the device, in declaration order
    Read { device: Arc<DeviceSpec> },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
    WriteSingleCoil { address: u16, value: bool },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
}

impl RequestKind {
    fn is_read(&self) -> bool {
        matches!(self, RequestKind::Read { .. })
    }
}

/// Dispatcher answer
#[derive(Debug)]
pub enum Response {
    /// Per-block outcomes; a block that failed carries no words
    Read(Vec<BlockOutcome>),
    Write,
}

struct QueuedRequest {
    kind: RequestKind,
    priority: i32,
    seq: u64,
    deadline: Instant,
    cancel: CancellationToken,
    respond_to: oneshot::Sender<Result<Response>>,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: larger priority wins; inside a priority level the
        // earlier submission (smaller seq) wins
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Handle for submitting requests to one connection's dispatcher
#[derive(Clone)]
pub struct DispatcherHandle {
    conn_id: Arc<str>,
    tx: mpsc::UnboundedSender<QueuedRequest>,
    seq: Arc<AtomicU64>,
}

impl DispatcherHandle {
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Submit a request; the returned receiver resolves when it completes,
    /// errors, or is skipped due to cancellation.
    pub fn submit(
        &self,
        kind: RequestKind,
        priority: i32,
        cancel: CancellationToken,
    ) -> Result<oneshot::Receiver<Result<Response>>> {
        let (respond_to, response) = oneshot::channel();
        let request = QueuedRequest {
            kind,
            priority,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            deadline: Instant::now() + REQUEST_TIMEOUT,
            cancel,
            respond_to,
        };
        self.tx
            .send(request)
            .map_err(|_| AcqError::Cancelled("dispatcher stopped".to_string()))?;
        Ok(response)
    }

    /// Submit and wait for the outcome
    pub async fn submit_and_wait(
        &self,
        kind: RequestKind,
        priority: i32,
        cancel: CancellationToken,
    ) -> Result<Response> {
        let response = self.submit(kind, priority, cancel)?;
        match response.await {
            Ok(result) => result,
            Err(_) => Err(AcqError::Cancelled("dispatcher dropped request".to_string())),
        }
    }
}

/// Spawn the dispatcher task for one connection
pub fn spawn_dispatcher(
    conn: Arc<Connection>,
    shutdown: CancellationToken,
) -> (DispatcherHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = DispatcherHandle {
        conn_id: conn.spec().conn_id.clone().into(),
        tx,
        seq: Arc::new(AtomicU64::new(0)),
    };
    let task = tokio::spawn(dispatch_loop(conn, rx, shutdown));
    (handle, task)
}

async fn dispatch_loop(
    conn: Arc<Connection>,
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    shutdown: CancellationToken,
) {
    let conn_id = conn.spec().conn_id.clone();
    let mut heap: BinaryHeap<QueuedRequest> = BinaryHeap::new();

    loop {
        // Pull everything already waiting so priorities are compared across
        // the full backlog, then pop the winner
        while let Ok(request) = rx.try_recv() {
            heap.push(request);
        }

        let request = match heap.pop() {
            Some(request) => request,
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(request) => {
                            heap.push(request);
                            continue;
                        },
                        None => break,
                    },
                }
            },
        };

        // Cancelled or expired before start: skip without touching the wire
        if request.cancel.is_cancelled() {
            let _ = request
                .respond_to
                .send(Err(AcqError::Cancelled("cancelled before dispatch".to_string())));
            continue;
        }
        let now = Instant::now();
        let Some(remaining) = request.deadline.checked_duration_since(now) else {
            let _ = request
                .respond_to
                .send(Err(AcqError::timeout("expired in dispatch queue")));
            continue;
        };

        let is_read = request.kind.is_read();
        let result =
            match tokio::time::timeout(remaining, execute(&conn, request.kind)).await {
                Ok(result) => result,
                Err(_) => Err(AcqError::timeout("request exceeded its budget")),
            };

        if is_read {
            conn.finish_gather().await;
        }
        if let Err(e) = &result {
            debug!(conn_id = %conn_id, "request failed: {e}");
        }
        let _ = request.respond_to.send(result);
    }

    // Drain whatever is left so no caller hangs on shutdown
    while let Some(request) = heap.pop() {
        let _ = request
            .respond_to
            .send(Err(AcqError::Cancelled("dispatcher shut down".to_string())));
    }
    while let Ok(request) = rx.try_recv() {
        let _ = request
            .respond_to
            .send(Err(AcqError::Cancelled("dispatcher shut down".to_string())));
    }
    debug!(conn_id = %conn_id, "dispatcher stopped");
}

async fn execute(conn: &Connection, kind: RequestKind) -> Result<Response> {
    match kind {
        RequestKind::Read { device } => {
            let register_kind = conn.spec().register_type;
            let mut outcomes = Vec::with_capacity(device.read_blocks.len());
            let mut last_error = None;
            let mut any_ok = false;

            for block in &device.read_blocks {
                match conn.read_block(register_kind, block.start, block.count).await {
                    Ok(words) => {
                        any_ok = true;
                        outcomes.push(BlockOutcome {
                            start: block.start,
                            count: block.count,
                            words: Some(words),
                        });
                    },
                    Err(e) => {
                        warn!(
                            conn_id = %conn.spec().conn_id,
                            device_id = %device.device_id,
                            start = block.start,
                            count = block.count,
                            "block read failed: {e}"
                        );
                        outcomes.push(BlockOutcome {
                            start: block.start,
                            count: block.count,
                            words: None,
                        });
                        last_error = Some(e);
                    },
                }
            }

            if any_ok {
                Ok(Response::Read(outcomes))
            } else {
                Err(last_error
                    .unwrap_or_else(|| AcqError::internal("device has no read blocks")))
            }
        },
        RequestKind::WriteSingleRegister { address, value } => {
            conn.write_single_register(address, value).await?;
            Ok(Response::Write)
        },
        RequestKind::WriteMultipleRegisters { address, values } => {
            conn.write_multiple_registers(address, &values).await?;
            Ok(Response::Write)
        },
        RequestKind::WriteSingleCoil { address, value } => {
            conn.write_single_coil(address, value).await?;
            Ok(Response::Write)
        },
        RequestKind::WriteMultipleCoils { address, values } => {
            conn.write_multiple_coils(address, &values).await?;
            Ok(Response::Write)
        },
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn queued(priority: i32, seq: u64) -> QueuedRequest {
        let (respond_to, _rx) = oneshot::channel();
        QueuedRequest {
            kind: RequestKind::WriteSingleRegister {
                address: 0,
                value: 0,
            },
            priority,
            seq,
            deadline: Instant::now() + REQUEST_TIMEOUT,
            cancel: CancellationToken::new(),
            respond_to,
        }
    }

    #[test]
    fn test_heap_orders_by_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(queued(PRIORITY_BACKGROUND_READ, 0));
        heap.push(queued(PRIORITY_WRITE, 3));
        heap.push(queued(PRIORITY_ON_DEMAND_READ, 1));
        heap.push(queued(PRIORITY_WRITE, 2));

        let order: Vec<(i32, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|r| (r.priority, r.seq))
            .collect();
        assert_eq!(
            order,
            vec![
                (PRIORITY_WRITE, 2),
                (PRIORITY_WRITE, 3),
                (PRIORITY_ON_DEMAND_READ, 1),
                (PRIORITY_BACKGROUND_READ, 0),
            ]
        );
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut heap = BinaryHeap::new();
        for seq in [5u64, 1, 9, 3] {
            heap.push(queued(1, seq));
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop()).map(|r| r.seq).collect();
        assert_eq!(order, vec![1, 3, 5, 9]);
    }
}
