//! Per-device acquisition scheduling
//!
//! `periodic` fires on a fixed interval and drops ticks that land while the
//! previous read is still in flight, `continuous` chains read after read,
//! `on_demand` leaves the device alone until an external caller asks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::spec::{ConnectionSpec, DeviceSpec, PollMode};
use crate::slave::SlaveHandle;
use crate::utils::now_millis;

use super::dispatch::{DispatcherHandle, RequestKind, Response, PRIORITY_BACKGROUND_READ};
use super::events::{BlockOutcome, DataAcquired};

/// Start skew so a fleet of periodic pollers does not fire as one burst
const START_SKEW: Duration = Duration::from_millis(100);

/// Consecutive continuous-mode failures before the long cooldown
const FAILURE_THRESHOLD: u32 = 10;
const FAILURE_COOLDOWN: Duration = Duration::from_secs(5);
const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Everything a poller task needs for one device
#[derive(Clone)]
pub struct PollerCtx {
    pub connection: Arc<ConnectionSpec>,
    pub device: Arc<DeviceSpec>,
    pub dispatcher: DispatcherHandle,
    pub acquired_tx: mpsc::Sender<DataAcquired>,
    pub slave: Option<Arc<SlaveHandle>>,
    pub shutdown: CancellationToken,
}

impl PollerCtx {
    /// Mirror successful blocks into the slave image, then hand the tick to
    /// the parser. The mirror write happens first so external clients never
    /// observe a parse result whose registers are not yet served.
    async fn forward(&self, outcomes: Vec<BlockOutcome>) {
        let register_kind = self.connection.register_type;

        if let Some(slave) = &self.slave {
            for block in &outcomes {
                if let Some(words) = &block.words {
                    slave.apply_block(register_kind, block.start, words).await;
                }
            }
        }

        let acquired = DataAcquired {
            connection: self.connection.clone(),
            device: self.device.clone(),
            register_kind,
            blocks: outcomes,
            ts_ms: now_millis(),
        };

        // Bounded channel: this send is where backpressure stalls the
        // acquisition side
        tokio::select! {
            _ = self.shutdown.cancelled() => {},
            _ = self.acquired_tx.send(acquired) => {},
        }
    }
}

/// Spawn the scheduling task for one device. `on_demand` devices have no
/// self-driven activity and return no task.
pub fn spawn_poller(ctx: PollerCtx) -> Option<JoinHandle<()>> {
    match ctx.device.poll_mode {
        PollMode::Periodic => Some(tokio::spawn(periodic_loop(ctx))),
        PollMode::Continuous => Some(tokio::spawn(continuous_loop(ctx))),
        PollMode::OnDemand => None,
    }
}

async fn periodic_loop(ctx: PollerCtx) {
    let conn_id = ctx.connection.conn_id.clone();
    let device_id = ctx.device.device_id.clone();

    tokio::select! {
        _ = ctx.shutdown.cancelled() => return,
        _ = tokio::time::sleep(START_SKEW) => {},
    }

    let mut ticker = tokio::time::interval(ctx.connection.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let in_flight = Arc::new(AtomicBool::new(false));

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = ticker.tick() => {},
        }

        // A tick landing while the previous read is still pending is
        // dropped, not queued; queueing would grow head-of-line latency
        // without bound on a slow upstream
        if in_flight.swap(true, Ordering::SeqCst) {
            debug!(conn_id = %conn_id, device_id = %device_id, "tick coalesced");
            continue;
        }

        let receiver = match ctx.dispatcher.submit(
            RequestKind::Read {
                device: ctx.device.clone(),
            },
            PRIORITY_BACKGROUND_READ,
            ctx.shutdown.clone(),
        ) {
            Ok(receiver) => receiver,
            Err(_) => {
                in_flight.store(false, Ordering::SeqCst);
                break;
            },
        };

        // Completion is handled off the tick loop so the ticker keeps
        // running (and coalescing) while a slow read drains
        let ctx_done = ctx.clone();
        let in_flight_done = in_flight.clone();
        tokio::spawn(async move {
            match receiver.await {
                Ok(Ok(Response::Read(outcomes))) => ctx_done.forward(outcomes).await,
                Ok(Ok(Response::Write)) => {},
                Ok(Err(e)) => {
                    warn!(
                        conn_id = %ctx_done.connection.conn_id,
                        device_id = %ctx_done.device.device_id,
                        "periodic read failed: {e}"
                    );
                },
                Err(_) => {},
            }
            in_flight_done.store(false, Ordering::SeqCst);
        });
    }

    info!(conn_id = %conn_id, device_id = %device_id, "periodic poller stopped");
}

async fn continuous_loop(ctx: PollerCtx) {
    let conn_id = ctx.connection.conn_id.clone();
    let device_id = ctx.device.device_id.clone();
    let mut failures: u32 = 0;

    loop {
        if ctx.shutdown.is_cancelled() {
            break;
        }

        let result = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            result = ctx.dispatcher.submit_and_wait(
                RequestKind::Read { device: ctx.device.clone() },
                PRIORITY_BACKGROUND_READ,
                ctx.shutdown.clone(),
            ) => result,
        };

        match result {
            Ok(Response::Read(outcomes)) => {
                failures = 0;
                ctx.forward(outcomes).await;
                if !ctx.connection.min_poll_interval.is_zero() {
                    tokio::select! {
                        _ = ctx.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ctx.connection.min_poll_interval) => {},
                    }
                }
            },
            Ok(Response::Write) => {},
            Err(e) => {
                failures += 1;
                let pause = if failures >= FAILURE_THRESHOLD {
                    warn!(
                        conn_id = %conn_id,
                        device_id = %device_id,
                        failures,
                        "continuous read failing, cooling down: {e}"
                    );
                    failures = 0;
                    FAILURE_COOLDOWN
                } else {
                    debug!(conn_id = %conn_id, device_id = %device_id, "continuous read failed: {e}");
                    ERROR_PAUSE
                };
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {},
                }
            },
        }
    }

    info!(conn_id = %conn_id, device_id = %device_id, "continuous poller stopped");
}
