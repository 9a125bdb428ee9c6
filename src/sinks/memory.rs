//! In-memory sink doubles for tests

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::utils::error::{AcqError, Result};

use super::{BrokerPublisher, DataPoint, TimeSeriesSink};

/// Records written batches; can be switched into failure mode
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<DataPoint>>>,
    fail: Mutex<bool>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn batches(&self) -> Vec<Vec<DataPoint>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl TimeSeriesSink for MemorySink {
    async fn write(&self, batch: &[DataPoint]) -> Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(AcqError::storage("memory sink in failure mode"));
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

/// Records published messages
#[derive(Default)]
pub struct MemoryBroker {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

#[async_trait]
impl BrokerPublisher for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}
