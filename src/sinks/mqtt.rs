//! MQTT broker publisher
//!
//! QoS 1 (at-least-once) publishing over rumqttc. The event loop runs as a
//! background task; rumqttc reconnects and re-delivers unacknowledged
//! publishes on its own, which is where the at-least-once (and possible
//! duplicate) semantics come from.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::utils::error::{AcqError, Result};

use super::BrokerPublisher;

pub struct MqttPublisher {
    client: AsyncClient,
    _event_loop: JoinHandle<()>,
}

impl MqttPublisher {
    pub fn new(config: &MqttConfig, shutdown: CancellationToken) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);

        let (client, mut event_loop) = AsyncClient::new(options, 64);

        let host = config.host.clone();
        let event_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("connected to MQTT broker at {host}");
                        },
                        Ok(_) => {},
                        Err(e) => {
                            warn!("MQTT event loop error: {e}");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        },
                    },
                }
            }
            debug!("MQTT event loop stopped");
        });

        Self {
            client,
            _event_loop: event_task,
        }
    }
}

#[async_trait]
impl BrokerPublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| AcqError::storage(format!("MQTT publish failed: {e}")))
    }
}
