//! Bus fan-out and logical connections
//!
//! One [`CanBus`] owns the physical adapter. A dispatcher task copies every
//! received frame into a bounded broadcast queue; each [`Connection`] is an
//! independent reader of that queue, so the tracker, interactive exchanges
//! and a firmware transfer can share the bus without stealing each other's
//! frames. A reader that falls behind loses only its own oldest frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::BusConfig;
use crate::transport::{create_adapter, BusAdapter, CanFrame, TransportError};

/// Errors seen by a logical connection
#[derive(Debug, Error, Clone)]
pub enum BusError {
    #[error("timed out waiting for a frame")]
    Timeout,

    #[error("bus is not connected")]
    NotConnected,

    #[error("bus closed")]
    Closed,

    #[error(transparent)]
    Send(#[from] TransportError),
}

pub type BusResult<T> = Result<T, BusError>;

/// Traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub send_frames: u64,
    pub recv_frames: u64,
    pub send_errors: u64,
    pub recv_errors: u64,
    pub open_connections: u64,
    pub released_connections: u64,
}

#[derive(Default)]
struct Counters {
    send_frames: AtomicU64,
    recv_frames: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
    opened: AtomicU64,
    released: AtomicU64,
}

struct Shared {
    adapter: Arc<dyn BusAdapter>,
    frames: broadcast::Sender<CanFrame>,
    counters: Counters,
    send_lock: AsyncMutex<()>,
}

impl Shared {
    async fn send(&self, frame: &CanFrame) -> BusResult<()> {
        if !self.adapter.is_connected() {
            self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(BusError::NotConnected);
        }
        let _guard = self.send_lock.lock().await;
        match self.adapter.send(frame).await {
            Ok(()) => {
                self.counters.send_frames.fetch_add(1, Ordering::Relaxed);
                trace!(%frame, "Frame sent");
                Ok(())
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!(%frame, error = %e, "Frame send failed");
                Err(e.into())
            }
        }
    }
}

/// The physical bus, shared by handle
pub struct CanBus {
    shared: Arc<Shared>,
    dispatcher: JoinHandle<()>,
}

impl CanBus {
    /// Open the configured adapter and start dispatching
    pub async fn connect(config: &BusConfig) -> BusResult<Arc<Self>> {
        let adapter = create_adapter(&config.transport).await?;
        Ok(Arc::new(Self::with_adapter(adapter, config.queue_depth)))
    }

    /// Wrap an existing adapter
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_adapter(adapter: Arc<dyn BusAdapter>, queue_depth: usize) -> Self {
        let (frames, _) = broadcast::channel(queue_depth.max(1));
        let shared = Arc::new(Shared {
            adapter: adapter.clone(),
            frames,
            counters: Counters::default(),
            send_lock: AsyncMutex::new(()),
        });

        let mut incoming = adapter.subscribe();
        let inner = shared.clone();
        let dispatcher = tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(frame) => {
                        inner.counters.recv_frames.fetch_add(1, Ordering::Relaxed);
                        let _ = inner.frames.send(frame);
                    }
                    Err(RecvError::Lagged(n)) => {
                        inner.counters.recv_errors.fetch_add(n, Ordering::Relaxed);
                        warn!(dropped = n, "Bus dispatcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Bus dispatcher stopped");
        });

        debug!(adapter = %adapter.name(), "Bus started");
        Self { shared, dispatcher }
    }

    /// Acquire a logical connection
    ///
    /// The connection sees every frame received after this call.
    pub fn connection(&self) -> Connection {
        let id = self.shared.counters.opened.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(connection = id, "Connection acquired");
        Connection {
            id,
            rx: self.shared.frames.subscribe(),
            shared: self.shared.clone(),
            released: false,
        }
    }

    pub async fn send(&self, frame: &CanFrame) -> BusResult<()> {
        self.shared.send(frame).await
    }

    pub fn is_connected(&self) -> bool {
        self.shared.adapter.is_connected()
    }

    pub fn adapter(&self) -> &Arc<dyn BusAdapter> {
        &self.shared.adapter
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.shared.counters;
        let opened = c.opened.load(Ordering::Relaxed);
        let released = c.released.load(Ordering::Relaxed);
        BusStats {
            send_frames: c.send_frames.load(Ordering::Relaxed),
            recv_frames: c.recv_frames.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            recv_errors: c.recv_errors.load(Ordering::Relaxed),
            open_connections: opened - released,
            released_connections: released,
        }
    }
}

impl Drop for CanBus {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// One consumer's view of the bus
///
/// Released exactly once, by [`release`](Self::release) or on drop.
pub struct Connection {
    id: u64,
    rx: broadcast::Receiver<CanFrame>,
    shared: Arc<Shared>,
    released: bool,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn send(&self, frame: &CanFrame) -> BusResult<()> {
        self.shared.send(frame).await
    }

    /// Wait up to `timeout` for the next frame
    pub async fn recv(&mut self, timeout: Duration) -> BusResult<CanFrame> {
        if !self.shared.adapter.is_connected() {
            return Err(BusError::NotConnected);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Err(BusError::Timeout),
                Ok(Ok(frame)) => return Ok(frame),
                Ok(Err(RecvError::Lagged(n))) => {
                    self.shared
                        .counters
                        .recv_errors
                        .fetch_add(n, Ordering::Relaxed);
                    warn!(connection = self.id, dropped = n, "Connection lagged");
                }
                Ok(Err(RecvError::Closed)) => return Err(BusError::Closed),
            }
        }
    }

    /// Next queued frame, if any, without waiting
    pub fn try_recv(&mut self) -> BusResult<Option<CanFrame>> {
        loop {
            match self.rx.try_recv() {
                Ok(frame) => return Ok(Some(frame)),
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(n)) => {
                    self.shared
                        .counters
                        .recv_errors
                        .fetch_add(n, Ordering::Relaxed);
                }
                Err(TryRecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }

    /// Release the connection now
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.counters.released.fetch_add(1, Ordering::Relaxed);
            trace!(connection = self.id, "Connection released");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.release_once();
    }
}
