//! Mock transport for protocol tests
//!
//! Lets tests script receive data and inspect sent frames without a real
//! endpoint. Shared state sits behind an Arc so the test keeps a handle
//! while the client owns the transport.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::utils::error::{AcqError, Result};

use super::Transport;

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    receive_queue: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    fail_connect: bool,
    fail_send: bool,
    connect_count: u32,
}

/// Test double implementing [`Transport`]
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes returned by the next `receive` call
    pub fn push_receive(&self, data: Vec<u8>) {
        self.state.lock().unwrap().receive_queue.push_back(data);
    }

    /// Frames sent so far
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().unwrap().fail_connect = fail;
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.state.lock().unwrap().fail_send = fail;
    }

    pub fn connect_count(&self) -> u32 {
        self.state.lock().unwrap().connect_count
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> &str {
        "mock"
    }

    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.connect_count += 1;
        if state.fail_connect {
            return Err(AcqError::transport("mock connect failure"));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state.lock().unwrap().connected = false;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(AcqError::NotConnected);
        }
        if state.fail_send {
            state.connected = false;
            return Err(AcqError::transport("mock send failure"));
        }
        state.sent.push(data.to_vec());
        Ok(data.len())
    }

    async fn receive(&mut self, buffer: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(AcqError::NotConnected);
        }
        match state.receive_queue.pop_front() {
            Some(data) => {
                let n = data.len().min(buffer.len());
                buffer[..n].copy_from_slice(&data[..n]);
                Ok(n)
            },
            None => Err(AcqError::timeout("mock receive queue empty")),
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }
}
