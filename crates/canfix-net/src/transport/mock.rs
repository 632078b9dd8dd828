//! Mock bus adapter for testing

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{BusAdapter, CanFrame, TransportError};
use crate::config::MockConfig;

/// In-memory bus
///
/// Frames passed to [`inject`](Self::inject) appear as if they came from the
/// network. Frames sent through the adapter are recorded and republished on
/// a second channel so simulated peers can answer them.
pub struct MockBusAdapter {
    config: MockConfig,
    connected: AtomicBool,
    incoming_tx: broadcast::Sender<CanFrame>,
    sent_tx: broadcast::Sender<CanFrame>,
    sent: RwLock<Vec<CanFrame>>,
}

impl MockBusAdapter {
    pub fn new(config: &MockConfig) -> Self {
        let (incoming_tx, _) = broadcast::channel(1024);
        let (sent_tx, _) = broadcast::channel(1024);
        Self {
            config: config.clone(),
            connected: AtomicBool::new(true),
            incoming_tx,
            sent_tx,
            sent: RwLock::new(Vec::new()),
        }
    }

    /// Inject a frame as though another node transmitted it
    pub fn inject(&self, frame: CanFrame) {
        let _ = self.incoming_tx.send(frame);
    }

    /// Every frame sent so far, oldest first
    pub fn sent(&self) -> Vec<CanFrame> {
        self.sent.read().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.write().clear();
    }

    /// Observe frames as they are sent
    pub fn subscribe_sent(&self) -> broadcast::Receiver<CanFrame> {
        self.sent_tx.subscribe()
    }

    /// Set connection state
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Default for MockBusAdapter {
    fn default() -> Self {
        Self::new(&MockConfig::default())
    }
}

#[async_trait]
impl BusAdapter for MockBusAdapter {
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        // Simulate latency
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        tracing::trace!(%frame, "Mock bus: sent frame");
        self.sent.write().push(frame.clone());
        let _ = self.sent_tx.send(frame.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.incoming_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}
