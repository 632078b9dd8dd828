//! Background tracker loop

use std::sync::Arc;
use std::time::{Duration, Instant};

use canfix_defs::DeviceStore;
use parking_lot::RwLock;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Node, NodeTracker, Parameter, TrackerEvent};
use crate::bus::{BusError, CanBus, Connection};
use crate::config::TrackerConfig;
use crate::protocol::Message;

/// Tracker running on its own bus connection
///
/// Stopped with [`stop`](Self::stop); dropping the service aborts the loop.
pub struct TrackerService {
    tracker: Arc<RwLock<NodeTracker>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TrackerService {
    pub fn spawn(bus: &CanBus, store: Arc<DeviceStore>, config: &TrackerConfig) -> Self {
        let tracker = Arc::new(RwLock::new(NodeTracker::new(
            config.node_id,
            config.stale_after(),
            store,
        )));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let conn = bus.connection();
        let handle = tokio::spawn(run(
            tracker.clone(),
            conn,
            shutdown_rx,
            config.poll_interval(),
            config.sweep_interval(),
        ));

        info!(
            node = config.node_id,
            stale_after_ms = config.stale_after_ms,
            "Node tracker started"
        );
        Self {
            tracker,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Shared handle to the tracker state
    pub fn tracker(&self) -> Arc<RwLock<NodeTracker>> {
        self.tracker.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.tracker.read().subscribe()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.tracker.read().nodes()
    }

    pub fn node(&self, id: u8) -> Option<Node> {
        self.tracker.read().node(id)
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        self.tracker.read().parameters()
    }

    pub fn parameter(&self, id: u16, index: u8) -> Option<Parameter> {
        self.tracker.read().parameter(id, index)
    }

    /// Signal the loop and wait up to `timeout` for it to finish
    ///
    /// Returns false if the loop had to be aborted.
    pub async fn stop(mut self, timeout: Duration) -> bool {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let Some(mut handle) = self.handle.take() else {
            return true;
        };
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => {
                debug!("Node tracker stopped");
                true
            }
            Err(_) => {
                warn!("Node tracker did not stop in time, aborting");
                handle.abort();
                false
            }
        }
    }
}

impl Drop for TrackerService {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run(
    tracker: Arc<RwLock<NodeTracker>>,
    mut conn: Connection,
    mut shutdown_rx: oneshot::Receiver<()>,
    poll: Duration,
    sweep_every: Duration,
) {
    let mut last_sweep = Instant::now();
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            result = conn.recv(poll) => match result {
                Ok(frame) => match Message::parse(&frame) {
                    Ok(msg) => {
                        let outcome = tracker.write().process(&msg, Instant::now());
                        match outcome {
                            Ok(Some(request)) => send_request(&conn, &request).await,
                            Ok(None) => {}
                            Err(e) => warn!(%frame, error = %e, "Tracker failed to process message"),
                        }
                    }
                    Err(e) => debug!(%frame, error = %e, "Ignoring undecodable frame"),
                },
                Err(BusError::Timeout) => {}
                Err(BusError::Closed) => {
                    warn!("Bus closed, node tracker exiting");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Tracker receive failed");
                    tokio::time::sleep(poll).await;
                }
            }
        }

        if last_sweep.elapsed() >= sweep_every {
            let now = Instant::now();
            let removed = tracker.write().sweep(now);
            if removed > 0 {
                debug!(removed, "Swept stale nodes and parameters");
            }
            last_sweep = now;
        }
    }
    conn.release();
}

async fn send_request(conn: &Connection, request: &Message) {
    match request.to_frame() {
        Ok(frame) => {
            if let Err(e) = conn.send(&frame).await {
                warn!(error = %e, "Failed to send identification request");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode identification request"),
    }
}
