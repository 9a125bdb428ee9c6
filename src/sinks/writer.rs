//! Sink writer tasks
//!
//! Two stages consume the pipeline tail: the batch writer takes `DataParsed`
//! to the time-series sink and the broker data topic, the change publisher
//! takes `ParamChanged` to the broker changes topic. A storage failure is
//! logged and the batch dropped; the broker path leans on QoS 1 instead.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::events::{DataParsed, ParamChanged};

use super::{samples_to_points, BrokerPublisher, TimeSeriesSink};

/// `<base>/<conn>/<device>/data`
fn data_topic(base: &str, conn_id: &str, device_id: &str) -> String {
    format!("{base}/{conn_id}/{device_id}/data")
}

/// `<base>/<conn>/<device>/changes`
fn changes_topic(base: &str, conn_id: &str, device_id: &str) -> String {
    format!("{base}/{conn_id}/{device_id}/changes")
}

/// Spawn the parsed-batch consumer
pub fn spawn_batch_writer(
    mut parsed_rx: mpsc::Receiver<DataParsed>,
    sink: Option<Arc<dyn TimeSeriesSink>>,
    broker: Option<Arc<dyn BrokerPublisher>>,
    base_topic: String,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = parsed_rx.recv() => match received {
                    Some(batch) => batch,
                    None => break,
                },
            };

            if let Some(sink) = &sink {
                let points = samples_to_points(&batch);
                if !points.is_empty() {
                    // At-most-once on the storage path: log and drop
                    match sink.write(&points).await {
                        Ok(()) => {
                            debug!(
                                conn_id = %batch.conn_id,
                                device_id = %batch.device_id,
                                points = points.len(),
                                "batch stored"
                            );
                        },
                        Err(e) => {
                            warn!(
                                conn_id = %batch.conn_id,
                                device_id = %batch.device_id,
                                points = points.len(),
                                "time-series write failed, batch dropped: {e}"
                            );
                        },
                    }
                }
            }

            if let Some(broker) = &broker {
                match serde_json::to_vec(&batch) {
                    Ok(payload) => {
                        let topic = data_topic(&base_topic, &batch.conn_id, &batch.device_id);
                        if let Err(e) = broker.publish(&topic, payload).await {
                            warn!(topic, "data publish failed: {e}");
                        }
                    },
                    Err(e) => debug!("batch serialization failed: {e}"),
                }
            }
        }
        info!("batch writer stopped");
    })
}

/// Spawn the change-event publisher
pub fn spawn_change_publisher(
    mut changes_rx: mpsc::Receiver<ParamChanged>,
    broker: Option<Arc<dyn BrokerPublisher>>,
    base_topic: String,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = changes_rx.recv() => match received {
                    Some(event) => event,
                    None => break,
                },
            };

            let Some(broker) = &broker else { continue };

            match serde_json::to_vec(&event) {
                Ok(payload) => {
                    let topic = changes_topic(&base_topic, &event.conn_id, &event.device_id);
                    if let Err(e) = broker.publish(&topic, payload).await {
                        warn!(topic, "change publish failed: {e}");
                    }
                },
                Err(e) => debug!("change serialization failed: {e}"),
            }
        }
        info!("change publisher stopped");
    })
}
