//! Streamed block transfer ("CANFIX" driver)
//!
//! Per block:
//!
//! ```text
//! -> [block type, subsystem, log2(block size), offset LE32]
//! <- anything but [0xFF, code ...]
//! -> up to 8 data bytes            (repeated)
//! <- LE32 offset of the last byte received within the block
//! -> []                            end of block
//! <- ack
//! ```
//!
//! After the last file `[0xFD]` ends the transmission. An echo mismatch
//! sends `[0xFE]` to terminate the block before failing.

use tracing::{debug, warn};

use super::error::{FirmwareError, FirmwareResult, NodeErrorKind};
use super::link::{le_value, ChannelLink};
use super::package::FirmwarePackage;
use super::state::{CancelHandle, Reporter, TransferState, TransferSummary};

pub const NODE_ERROR: u8 = 0xFF;
pub const TERMINATE: u8 = 0xFE;
pub const END_OF_TRANSMISSION: u8 = 0xFD;
pub const GROUP_SIZE: usize = 8;

pub async fn download(
    link: &mut ChannelLink,
    package: &FirmwarePackage,
    reporter: &mut Reporter,
    cancel: &CancelHandle,
) -> FirmwareResult<TransferSummary> {
    let total = package.total_size().max(1) as f32;
    let blocks_total = package.block_count();
    let mut summary = TransferSummary::default();

    for file in package.files() {
        let log2 = file.block_log2()?;
        debug!(
            file = %file.name,
            size = file.size(),
            block_size = file.block_size,
            "Sending file"
        );

        for (offset, block) in file.blocks()? {
            if cancel.is_cancelled() {
                return Err(FirmwareError::Cancelled);
            }
            reporter.status(format!(
                "Writing Block {} of {}",
                summary.blocks + 1,
                blocks_total
            ));

            let mut start = vec![file.block_type, file.subsystem, log2];
            start.extend_from_slice(&offset.to_le_bytes());
            let reply = link.request(&start).await?;
            if reply.first() == Some(&NODE_ERROR) {
                let kind = NodeErrorKind::from_code(reply.get(1).copied().unwrap_or(0xFF));
                warn!(%kind, offset, "Node rejected block");
                return Err(FirmwareError::Node {
                    kind,
                    block_type: file.block_type,
                    subsystem: file.subsystem,
                    offset,
                });
            }

            send_block(link, block, reporter, &mut summary, total).await?;
            summary.blocks += 1;
        }
    }

    reporter.set_state(TransferState::Finalizing);
    link.request(&[END_OF_TRANSMISSION]).await?;
    Ok(summary)
}

async fn send_block(
    link: &mut ChannelLink,
    block: &[u8],
    reporter: &Reporter,
    summary: &mut TransferSummary,
    total: f32,
) -> FirmwareResult<()> {
    let mut received = 0u32;
    for group in block.chunks(GROUP_SIZE) {
        let echo = match link.request(group).await {
            Ok(echo) => echo,
            Err(e) => {
                link.send_quiet(&[TERMINATE]).await;
                return Err(e);
            }
        };
        received += group.len() as u32;

        let expected = received - 1;
        let echoed = le_value(&echo, 4);
        if echoed != Some(expected) {
            link.send_quiet(&[TERMINATE]).await;
            return Err(FirmwareError::BadOffset {
                expected,
                received: echoed.unwrap_or(u32::MAX),
            });
        }

        summary.bytes += group.len() as u64;
        reporter.progress(summary.bytes as f32 / total);
    }

    // End of block
    link.request(&[]).await?;
    Ok(())
}
