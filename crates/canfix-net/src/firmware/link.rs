//! Two-way channel used by the transfer drivers

use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use super::error::{FirmwareError, FirmwareResult};
use crate::bus::{BusError, Connection};
use crate::protocol::{channel_id, CodecError};
use crate::transport::CanFrame;

/// Requests go out on the channel's request id, replies are read from its
/// response id; everything else on the connection is skipped.
pub struct ChannelLink {
    conn: Connection,
    request_id: u16,
    response_id: u16,
    timeout: Duration,
}

impl ChannelLink {
    pub fn new(conn: Connection, channel: u8, timeout: Duration) -> FirmwareResult<Self> {
        Ok(Self {
            conn,
            request_id: channel_id(channel, false)?,
            response_id: channel_id(channel, true)?,
            timeout,
        })
    }

    pub async fn send(&self, data: &[u8]) -> FirmwareResult<()> {
        let frame = CanFrame::new(self.request_id, data.to_vec()).map_err(CodecError::from)?;
        trace!(%frame, "Firmware frame out");
        self.conn.send(&frame).await?;
        Ok(())
    }

    /// Next reply on the channel, or [`FirmwareError::Timeout`]
    pub async fn recv(&mut self) -> FirmwareResult<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FirmwareError::Timeout);
            }
            match self.conn.recv(remaining).await {
                Ok(frame) if frame.id == self.response_id => {
                    trace!(%frame, "Firmware frame in");
                    return Ok(frame.data);
                }
                Ok(_) => {}
                Err(BusError::Timeout) => return Err(FirmwareError::Timeout),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send and wait for the reply
    pub async fn request(&mut self, data: &[u8]) -> FirmwareResult<Vec<u8>> {
        self.send(data).await?;
        self.recv().await
    }

    /// Best-effort send used while already failing
    pub async fn send_quiet(&self, data: &[u8]) {
        if let Err(e) = self.send(data).await {
            trace!(error = %e, "Ignoring send failure");
        }
    }
}

/// Little-endian integer from the first `n` bytes
pub(crate) fn le_value(data: &[u8], n: usize) -> Option<u32> {
    if data.len() < n {
        return None;
    }
    Some(
        data[..n]
            .iter()
            .rev()
            .fold(0u32, |acc, b| (acc << 8) | *b as u32),
    )
}
