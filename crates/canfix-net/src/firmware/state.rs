//! Transfer state, progress events and cancellation

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Firmware transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    /// Asking the node to enter its loader
    RequestingDownload,
    SendingBlocks,
    /// All blocks written, sending end of transmission
    Finalizing,
    /// Terminal
    Complete,
    /// Terminal, stopped at a block boundary
    Cancelled,
    /// Terminal
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::RequestingDownload => "requesting_download",
            Self::SendingBlocks => "sending_blocks",
            Self::Finalizing => "finalizing",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TransferState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "requesting_download" => Ok(Self::RequestingDownload),
            "sending_blocks" => Ok(Self::SendingBlocks),
            "finalizing" => Ok(Self::Finalizing),
            "complete" => Ok(Self::Complete),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown transfer state '{}'", other)),
        }
    }
}

/// How a transfer ended
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Complete(TransferSummary),
    Cancelled,
    Failed(String),
}

/// Totals of a completed transfer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferSummary {
    pub bytes: u64,
    pub blocks: u32,
    /// CRC-16 of the image, for drivers that report one
    pub checksum: Option<u16>,
}

/// Event delivered to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    State(TransferState),
    Status(String),
    /// 0.0 ..= 1.0
    Progress(f32),
    /// Sent exactly once per transfer
    Finished(TransferOutcome),
}

/// Cooperative stop request, checked between blocks
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sends transfer events and tracks the current state
pub struct Reporter {
    tx: Option<mpsc::UnboundedSender<TransferEvent>>,
    state: TransferState,
    finished: bool,
}

impl Reporter {
    pub fn new(tx: Option<mpsc::UnboundedSender<TransferEvent>>) -> Self {
        Self {
            tx,
            state: TransferState::Idle,
            finished: false,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn set_state(&mut self, state: TransferState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Transfer state");
            self.state = state;
            self.send(TransferEvent::State(state));
        }
    }

    pub fn status(&self, text: impl Into<String>) {
        let text = text.into();
        info!(status = %text, "Firmware");
        self.send(TransferEvent::Status(text));
    }

    pub fn progress(&self, fraction: f32) {
        self.send(TransferEvent::Progress(fraction.clamp(0.0, 1.0)));
    }

    /// Emit the terminal event; later calls are ignored
    pub fn finish(&mut self, outcome: TransferOutcome) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.send(TransferEvent::Finished(outcome));
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn send(&self, event: TransferEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
