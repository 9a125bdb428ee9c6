//! Rule engine
//!
//! Consumes change events with a per-fingerprint debounce and hands them to
//! registered rules. Rules read parameters and write control registers
//! through the same dispatchers as everything else, at write priority, so
//! rule traffic pre-empts background polling. A panicking rule is contained
//! at the engine boundary.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::spec::ConnectionSpec;
use crate::utils::error::{AcqError, Result};

use super::dispatch::{DispatcherHandle, RequestKind, Response, PRIORITY_WRITE};
use super::events::{ParamChanged, Value};
use super::parser::{parse_parameter, RegisterImage};

/// Events with the same `(conn, device, code)` inside this window are
/// dropped
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(50);

/// A reaction to parameter changes, loaded at startup
#[async_trait]
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    /// Called for every debounced change event
    async fn on_change(&self, event: &ParamChanged, ctx: &RuleContext) -> Result<()>;
}

/// Field access handed to rules
pub struct RuleContext {
    dispatchers: HashMap<String, DispatcherHandle>,
    connections: HashMap<String, Arc<ConnectionSpec>>,
    shutdown: CancellationToken,
}

impl RuleContext {
    pub fn new(
        dispatchers: HashMap<String, DispatcherHandle>,
        connections: HashMap<String, Arc<ConnectionSpec>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            dispatchers,
            connections,
            shutdown,
        }
    }

    fn dispatcher(&self, conn_id: &str) -> Result<&DispatcherHandle> {
        self.dispatchers
            .get(conn_id)
            .ok_or_else(|| AcqError::config(format!("no dispatcher for connection '{conn_id}'")))
    }

    /// Read one parameter fresh from the field: one priority-10 read of the
    /// owning device, then a single-parameter decode. A bit code resolves
    /// through its parent register.
    pub async fn read_parameter(
        &self,
        conn_id: &str,
        device_id: &str,
        code: &str,
    ) -> Result<Value> {
        let connection = self
            .connections
            .get(conn_id)
            .ok_or_else(|| AcqError::config(format!("unknown connection '{conn_id}'")))?;
        let device = connection
            .devices
            .iter()
            .find(|d| d.device_id == device_id)
            .ok_or_else(|| {
                AcqError::config(format!("unknown device '{device_id}' on '{conn_id}'"))
            })?;
        let (param, bit) = device.find_parameter(code).ok_or_else(|| {
            AcqError::config(format!("unknown parameter '{code}' on '{device_id}'"))
        })?;

        let response = self
            .dispatcher(conn_id)?
            .submit_and_wait(
                RequestKind::Read {
                    device: Arc::new(device.clone()),
                },
                PRIORITY_WRITE,
                self.shutdown.clone(),
            )
            .await?;

        let Response::Read(outcomes) = response else {
            return Err(AcqError::internal("read request answered with write response"));
        };

        let acquired = super::events::DataAcquired {
            connection: connection.clone(),
            device: Arc::new(device.clone()),
            register_kind: connection.register_type,
            blocks: outcomes,
            ts_ms: crate::utils::now_millis(),
        };
        let image = RegisterImage::from_acquired(&acquired);
        let sample = parse_parameter(
            param,
            &image,
            connection.register_type,
            conn_id,
            device_id,
            acquired.ts_ms,
            connection.byte_order,
        )?;

        match bit {
            Some(bit) => {
                let raw = match sample.raw {
                    Value::Integer(v) => v as u16,
                    _ => 0,
                };
                Ok(Value::Bool(raw & (1 << bit) != 0))
            },
            None => Ok(sample.parsed),
        }
    }

    /// Write one holding register at write priority
    pub async fn write_register(&self, conn_id: &str, address: u16, value: u16) -> Result<()> {
        self.dispatcher(conn_id)?
            .submit_and_wait(
                RequestKind::WriteSingleRegister { address, value },
                PRIORITY_WRITE,
                self.shutdown.clone(),
            )
            .await
            .map(|_| ())
    }

    /// Write a run of holding registers at write priority
    pub async fn write_registers(
        &self,
        conn_id: &str,
        address: u16,
        values: Vec<u16>,
    ) -> Result<()> {
        self.dispatcher(conn_id)?
            .submit_and_wait(
                RequestKind::WriteMultipleRegisters { address, values },
                PRIORITY_WRITE,
                self.shutdown.clone(),
            )
            .await
            .map(|_| ())
    }

    /// Write one coil at write priority
    pub async fn write_coil(&self, conn_id: &str, address: u16, value: bool) -> Result<()> {
        self.dispatcher(conn_id)?
            .submit_and_wait(
                RequestKind::WriteSingleCoil { address, value },
                PRIORITY_WRITE,
                self.shutdown.clone(),
            )
            .await
            .map(|_| ())
    }
}

/// Debounce filter, separated from the task for testability
pub struct Debouncer {
    window: Duration,
    seen: HashMap<(String, String, String), Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// True when the event passes; a passing event arms the window for its
    /// fingerprint
    pub fn admit(&mut self, event: &ParamChanged, now: Instant) -> bool {
        let key = event.fingerprint();
        if let Some(&last) = self.seen.get(&key) {
            if now.duration_since(last) < self.window {
                return false;
            }
        }
        self.seen.insert(key, now);
        true
    }
}

/// Spawn the rule engine task
pub fn spawn_rule_engine(
    mut events: mpsc::Receiver<ParamChanged>,
    rules: Vec<Arc<dyn Rule>>,
    ctx: Arc<RuleContext>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut debouncer = Debouncer::new(DEBOUNCE_WINDOW);

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => match received {
                    Some(event) => event,
                    None => break,
                },
            };

            if !debouncer.admit(&event, Instant::now()) {
                debug!(
                    conn_id = %event.conn_id,
                    device_id = %event.device_id,
                    code = %event.code,
                    "change event debounced"
                );
                continue;
            }

            for rule in &rules {
                let outcome = AssertUnwindSafe(rule.on_change(&event, &ctx))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {},
                    Ok(Err(e)) => {
                        warn!(rule = rule.name(), code = %event.code, "rule failed: {e}");
                    },
                    Err(_) => {
                        error!(rule = rule.name(), code = %event.code, "rule panicked");
                    },
                }
            }
        }
        info!("rule engine stopped");
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::events::ParameterSample;

    fn event(code: &str, ts_ms: i64) -> ParamChanged {
        let sample = ParameterSample {
            conn_id: "c1".to_string(),
            device_id: "d1".to_string(),
            code: code.to_string(),
            raw: Value::Integer(1),
            parsed: Value::Integer(1),
            unit: None,
            ts_ms,
            metadata: Default::default(),
        };
        ParamChanged {
            conn_id: "c1".to_string(),
            device_id: "d1".to_string(),
            code: code.to_string(),
            old: Value::Integer(0),
            new: Value::Integer(1),
            ts_ms,
            sample,
        }
    }

    #[test]
    fn test_debounce_window() {
        let mut debouncer = Debouncer::new(Duration::from_millis(50));
        let start = Instant::now();

        assert!(debouncer.admit(&event("x", 0), start));
        // 20 ms later: dropped
        assert!(!debouncer.admit(&event("x", 1), start + Duration::from_millis(20)));
        // 60 ms after the first: admitted again
        assert!(debouncer.admit(&event("x", 2), start + Duration::from_millis(60)));
    }

    #[test]
    fn test_debounce_isolated_per_fingerprint() {
        let mut debouncer = Debouncer::new(Duration::from_millis(50));
        let start = Instant::now();

        assert!(debouncer.admit(&event("x", 0), start));
        // Different code: its own window
        assert!(debouncer.admit(&event("y", 0), start + Duration::from_millis(10)));
        assert!(!debouncer.admit(&event("y", 1), start + Duration::from_millis(30)));
    }

    #[test]
    fn test_debounce_window_rearms_on_admit_only() {
        let mut debouncer = Debouncer::new(Duration::from_millis(50));
        let start = Instant::now();

        assert!(debouncer.admit(&event("x", 0), start));
        // Dropped events do not extend the window
        assert!(!debouncer.admit(&event("x", 1), start + Duration::from_millis(40)));
        assert!(debouncer.admit(&event("x", 2), start + Duration::from_millis(55)));
    }

    #[tokio::test]
    async fn test_panicking_rule_is_contained() {
        struct PanickingRule;

        #[async_trait]
        impl Rule for PanickingRule {
            fn name(&self) -> &str {
                "panicker"
            }
            async fn on_change(&self, _: &ParamChanged, _: &RuleContext) -> Result<()> {
                panic!("rule bug");
            }
        }

        let (tx, rx) = mpsc::channel(8);
        let ctx = Arc::new(RuleContext::new(
            HashMap::new(),
            HashMap::new(),
            CancellationToken::new(),
        ));
        let shutdown = CancellationToken::new();
        let task = spawn_rule_engine(rx, vec![Arc::new(PanickingRule)], ctx, shutdown.clone());

        tx.send(event("x", 0)).await.unwrap();
        tx.send(event("y", 0)).await.unwrap();

        // The engine survives both panics and still shuts down cleanly
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rule_invocation_counts_debounced() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingRule(Arc<AtomicU32>);

        #[async_trait]
        impl Rule for CountingRule {
            fn name(&self) -> &str {
                "counter"
            }
            async fn on_change(&self, _: &ParamChanged, _: &RuleContext) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let count = Arc::new(AtomicU32::new(0));
        let (tx, rx) = mpsc::channel(8);
        let ctx = Arc::new(RuleContext::new(
            HashMap::new(),
            HashMap::new(),
            CancellationToken::new(),
        ));
        let shutdown = CancellationToken::new();
        let task = spawn_rule_engine(
            rx,
            vec![Arc::new(CountingRule(count.clone()))],
            ctx,
            shutdown.clone(),
        );

        // Two events with the same key in quick succession: one invocation
        tx.send(event("x", 0)).await.unwrap();
        tx.send(event("x", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // After the window: another invocation
        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(event("x", 2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        task.await.unwrap();
    }
}
