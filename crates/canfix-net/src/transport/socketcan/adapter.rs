//! SocketCAN adapter implementation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use socketcan::{CanFrame as RawFrame, CanSocket, EmbeddedFrame, Id, Socket, StandardId};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::SocketCanConfig;
use crate::transport::{BusAdapter, CanFrame, TransportError};

/// Raw CAN adapter on a SocketCAN interface
pub struct SocketCanAdapter {
    config: SocketCanConfig,
    socket: Arc<Mutex<CanSocket>>,
    connected: AtomicBool,
    /// Stop flag of the current listener thread
    running: Mutex<Arc<AtomicBool>>,
    incoming_tx: broadcast::Sender<CanFrame>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SocketCanAdapter {
    pub async fn new(config: &SocketCanConfig) -> Result<Self, TransportError> {
        let socket = Self::open_socket(&config.interface)?;
        let (incoming_tx, _) = broadcast::channel(1024);

        let adapter = Self {
            config: config.clone(),
            socket: Arc::new(Mutex::new(socket)),
            connected: AtomicBool::new(true),
            running: Mutex::new(Arc::new(AtomicBool::new(false))),
            incoming_tx,
            listener_handle: Mutex::new(None),
        };

        adapter.start_listener();
        tracing::info!(interface = %config.interface, bitrate = config.bitrate, "SocketCAN bus open");
        Ok(adapter)
    }

    fn open_socket(interface: &str) -> Result<CanSocket, TransportError> {
        let socket = CanSocket::open(interface).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to open CAN socket on {}: {}",
                interface, e
            ))
        })?;

        // Set socket to non-blocking for the polling listener
        socket.set_nonblocking(true).map_err(|e| {
            TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e))
        })?;

        Ok(socket)
    }

    fn start_listener(&self) {
        let socket = self.socket.clone();
        let incoming_tx = self.incoming_tx.clone();
        let running = Arc::new(AtomicBool::new(true));
        *self.running.lock() = running.clone();

        let handle = tokio::task::spawn_blocking(move || {
            while running.load(Ordering::SeqCst) {
                let result = socket.lock().read_frame();
                match result {
                    Ok(RawFrame::Data(raw)) => {
                        let Id::Standard(id) = EmbeddedFrame::id(&raw) else {
                            continue;
                        };
                        let frame = CanFrame {
                            id: id.as_raw(),
                            data: EmbeddedFrame::data(&raw).to_vec(),
                        };
                        tracing::trace!(%frame, "Frame received");
                        let _ = incoming_tx.send(frame);
                    }
                    Ok(_) => {
                        // Remote and error frames carry no CAN-FIX payload
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        tracing::error!(?e, "SocketCAN read error");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            tracing::debug!("SocketCAN listener stopped");
        });

        *self.listener_handle.lock() = Some(handle);
    }

    fn stop_listener(&self) {
        self.running.lock().store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener_handle.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl BusAdapter for SocketCanAdapter {
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let id = StandardId::new(frame.id).ok_or_else(|| {
            TransportError::InvalidFrame(format!("Invalid standard CAN ID: 0x{:X}", frame.id))
        })?;
        let raw = RawFrame::new(id, &frame.data).ok_or_else(|| {
            TransportError::InvalidFrame(format!("{} data bytes", frame.data.len()))
        })?;

        let socket = self.socket.clone();
        tokio::task::spawn_blocking(move || {
            let guard = socket.lock();
            loop {
                match guard.write_frame(&raw) {
                    Ok(()) => return Ok(()),
                    // Transmit queue full on a non-blocking socket
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => return Err(TransportError::SendFailed(e.to_string())),
                }
            }
        })
        .await
        .map_err(|e| TransportError::SendFailed(format!("Task join error: {}", e)))??;

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.incoming_tx.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.stop_listener();
        let socket = Self::open_socket(&self.config.interface)?;
        *self.socket.lock() = socket;
        self.connected.store(true, Ordering::SeqCst);
        self.start_listener();
        Ok(())
    }

    fn name(&self) -> String {
        format!("socketcan:{}", self.config.interface)
    }
}

impl Drop for SocketCanAdapter {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.stop_listener();
    }
}
