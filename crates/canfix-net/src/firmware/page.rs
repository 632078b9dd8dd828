//! Page buffer transfer ("BASIC" driver)
//!
//! The node holds one page buffer. Each block is loaded into it and then
//! explicitly erased and written:
//!
//! ```text
//! -> [0x01, addr LE32, len LE16]   fill buffer, echoed back
//! -> up to 8 data bytes            acked with LE16 running count
//! -> [0x02, addr LE32]             erase page, echoed back
//! -> [0x03, addr LE32]             write page, echoed back
//! ...
//! -> [0x05, crc16 LE16, size LE32] download complete, echoed back
//! ```
//!
//! A failed fill (bad echo or count) is retried from the start of the block.

use crc::{Crc, CRC_16_IBM_SDLC};
use tracing::{debug, warn};

use super::error::{FirmwareError, FirmwareResult, PackageError, PackageResult};
use super::link::{le_value, ChannelLink};
use super::package::FirmwarePackage;
use super::state::{CancelHandle, Reporter, TransferState, TransferSummary};

pub const FILL_BUFFER: u8 = 0x01;
pub const ERASE_PAGE: u8 = 0x02;
pub const WRITE_PAGE: u8 = 0x03;
pub const COMPLETE: u8 = 0x05;

const FILL_ATTEMPTS: usize = 3;

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// Fill length and running count are LE16 on the wire
pub const MAX_BLOCK_SIZE: u32 = u16::MAX as u32;

/// Reject blocks the page buffer commands cannot describe
pub fn check_block_sizes(package: &FirmwarePackage) -> PackageResult<()> {
    for file in package.files() {
        if file.block_size > MAX_BLOCK_SIZE {
            return Err(PackageError::BlockTooLarge {
                name: file.name.clone(),
                size: file.block_size,
                limit: MAX_BLOCK_SIZE,
            });
        }
    }
    Ok(())
}

pub async fn download(
    link: &mut ChannelLink,
    package: &FirmwarePackage,
    reporter: &mut Reporter,
    cancel: &CancelHandle,
) -> FirmwareResult<TransferSummary> {
    check_block_sizes(package)?;
    let total = package.total_size().max(1) as f32;
    let blocks_total = package.block_count();
    let mut digest = CRC16.digest();
    let mut summary = TransferSummary::default();

    for file in package.files() {
        file.block_log2()?;
        for (address, block) in file.blocks()? {
            if cancel.is_cancelled() {
                return Err(FirmwareError::Cancelled);
            }
            reporter.status(format!(
                "Writing Block {} of {}",
                summary.blocks + 1,
                blocks_total
            ));
            reporter.progress(summary.bytes as f32 / total);

            fill_with_retry(link, address, block, cancel).await?;
            command(link, ERASE_PAGE, address).await?;
            command(link, WRITE_PAGE, address).await?;

            digest.update(block);
            summary.bytes += block.len() as u64;
            summary.blocks += 1;
        }
    }

    reporter.set_state(TransferState::Finalizing);
    let checksum = digest.finalize();
    let mut complete = vec![COMPLETE];
    complete.extend_from_slice(&checksum.to_le_bytes());
    complete.extend_from_slice(&(summary.bytes as u32).to_le_bytes());
    let echo = link.request(&complete).await?;
    if echo != complete {
        return Err(FirmwareError::BadOffset {
            expected: summary.bytes as u32,
            received: le_value(echo.get(3..).unwrap_or_default(), 4).unwrap_or(u32::MAX),
        });
    }

    summary.checksum = Some(checksum);
    Ok(summary)
}

async fn fill_with_retry(
    link: &mut ChannelLink,
    address: u32,
    block: &[u8],
    cancel: &CancelHandle,
) -> FirmwareResult<()> {
    let mut last = FirmwareError::BadOffset {
        expected: 0,
        received: u32::MAX,
    };
    for attempt in 1..=FILL_ATTEMPTS {
        match fill_buffer(link, address, block).await {
            Ok(()) => return Ok(()),
            Err(e @ FirmwareError::BadOffset { .. }) => {
                warn!(address, attempt, error = %e, "Buffer fill failed");
                last = e;
            }
            Err(e) => return Err(e),
        }
        if cancel.is_cancelled() {
            return Err(FirmwareError::Cancelled);
        }
    }
    Err(last)
}

async fn fill_buffer(link: &mut ChannelLink, address: u32, block: &[u8]) -> FirmwareResult<()> {
    let len = u16::try_from(block.len()).map_err(|_| PackageError::BlockTooLarge {
        name: format!("block 0x{:08X}", address),
        size: block.len() as u32,
        limit: MAX_BLOCK_SIZE,
    })?;
    let mut fill = vec![FILL_BUFFER];
    fill.extend_from_slice(&address.to_le_bytes());
    fill.extend_from_slice(&len.to_le_bytes());
    let echo = link.request(&fill).await?;
    if echo != fill {
        return Err(FirmwareError::BadOffset {
            expected: address,
            received: le_value(echo.get(1..).unwrap_or_default(), 4).unwrap_or(u32::MAX),
        });
    }

    let mut count = 0u32;
    for group in block.chunks(8) {
        let ack = link.request(group).await?;
        count += group.len() as u32;
        let acked = le_value(&ack, 2);
        if acked != Some(count) {
            return Err(FirmwareError::BadOffset {
                expected: count,
                received: acked.unwrap_or(u32::MAX),
            });
        }
    }
    debug!(address, len = block.len(), "Buffer filled");
    Ok(())
}

async fn command(link: &mut ChannelLink, code: u8, address: u32) -> FirmwareResult<()> {
    let mut cmd = vec![code];
    cmd.extend_from_slice(&address.to_le_bytes());
    let echo = link.request(&cmd).await?;
    if echo != cmd {
        return Err(FirmwareError::BadOffset {
            expected: address,
            received: le_value(echo.get(1..).unwrap_or_default(), 4).unwrap_or(u32::MAX),
        });
    }
    Ok(())
}

/// CRC-16 reported in the download-complete command
pub fn checksum(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}
