//! InfluxDB 2.x time-series sink

use async_trait::async_trait;
use influxdb2::Client;
use tracing::debug;

use crate::config::InfluxConfig;
use crate::utils::error::{AcqError, Result};

use super::{DataPoint, TimeSeriesSink};

/// Line-protocol writer against an InfluxDB 2.x bucket
pub struct InfluxSink {
    client: Client,
    org: String,
    bucket: String,
    measurement: String,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Self {
        let client = Client::new(&config.url, &config.org, &config.token);
        Self {
            client,
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            measurement: config.measurement.clone(),
        }
    }

    fn to_line_protocol(&self, batch: &[DataPoint]) -> String {
        let mut lines = String::new();
        for point in batch {
            lines.push_str(&format!(
                "{},connection_id={},device_id={},parameter_code={} value={} {}\n",
                escape_measurement(&self.measurement),
                escape_tag(&point.conn_id),
                escape_tag(&point.device_id),
                escape_tag(&point.code),
                point.value,
                // millisecond timestamps as nanoseconds, the client default
                point.ts_ms as i128 * 1_000_000,
            ));
        }
        lines
    }
}

/// Escape line-protocol tag values: comma, space and equals
fn escape_tag(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
        .replace('=', "\\=")
}

/// Measurement names escape comma and space only
fn escape_measurement(value: &str) -> String {
    value.replace(',', "\\,").replace(' ', "\\ ")
}

#[async_trait]
impl TimeSeriesSink for InfluxSink {
    async fn write(&self, batch: &[DataPoint]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let data = self.to_line_protocol(batch);
        debug!(
            org = %self.org,
            bucket = %self.bucket,
            points = batch.len(),
            "writing batch to InfluxDB"
        );

        self.client
            .write_line_protocol(&self.org, &self.bucket, data)
            .await
            .map_err(|e| AcqError::storage(format!("InfluxDB write failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MEASUREMENT;

    fn sink() -> InfluxSink {
        InfluxSink::new(&InfluxConfig {
            enabled: true,
            url: "http://localhost:8086".to_string(),
            org: "plant".to_string(),
            bucket: "field".to_string(),
            token: "secret".to_string(),
            measurement: DEFAULT_MEASUREMENT.to_string(),
        })
    }

    #[test]
    fn test_line_protocol_shape() {
        let lines = sink().to_line_protocol(&[DataPoint {
            conn_id: "line_a".to_string(),
            device_id: "pump1".to_string(),
            code: "flow_rate".to_string(),
            value: 12.5,
            ts_ms: 1_700_000_000_000,
        }]);

        assert_eq!(
            lines,
            format!(
                "{DEFAULT_MEASUREMENT},connection_id=line_a,device_id=pump1,parameter_code=flow_rate value=12.5 1700000000000000000\n"
            )
        );
    }

    #[test]
    fn test_tag_escaping() {
        let lines = sink().to_line_protocol(&[DataPoint {
            conn_id: "line a".to_string(),
            device_id: "p=1".to_string(),
            code: "f,r".to_string(),
            value: 1.0,
            ts_ms: 1,
        }]);
        assert!(lines.contains("connection_id=line\\ a"));
        assert!(lines.contains("device_id=p\\=1"));
        assert!(lines.contains("parameter_code=f\\,r"));
    }
}
