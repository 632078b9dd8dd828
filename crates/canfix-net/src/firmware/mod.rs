//! Firmware update
//!
//! [`FirmwarePackage`] decodes the package archive, [`FirmwareUpdater`]
//! asks the node to enter its loader and then runs the driver named by the
//! device definition over a two-way channel. Progress goes out as
//! [`TransferEvent`]s with exactly one [`TransferEvent::Finished`].

mod error;
mod link;
mod package;
pub mod page;
mod state;
pub mod streamed;

use std::fmt;
use std::str::FromStr;

use canfix_defs::DeviceDefinition;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use error::{FirmwareError, FirmwareResult, NodeErrorKind, PackageError, PackageResult};
pub use link::ChannelLink;
pub use package::{FileFormat, FirmwarePackage, PackageFile};
pub use state::{
    CancelHandle, Reporter, TransferEvent, TransferOutcome, TransferState, TransferSummary,
};

use crate::config::FirmwareConfig;
use crate::exchange::NodeExchange;

/// Transfer protocol, selected by the device definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareDriver {
    /// Block start / grouped data / end of block
    Streamed,
    /// Fill buffer / erase page / write page
    Page,
}

impl FirmwareDriver {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Streamed => "CANFIX",
            Self::Page => "BASIC",
        }
    }

    /// Driver and update code for a device
    pub fn for_device(device: &DeviceDefinition) -> FirmwareResult<(Self, u16)> {
        let code = device
            .firmware_code
            .ok_or_else(|| FirmwareError::NoFirmwareCode(device.name.clone()))?;
        let driver = match device.firmware_driver.as_deref() {
            Some(name) => name.parse()?,
            None => Self::Streamed,
        };
        Ok((driver, code))
    }

    /// Check a package against this driver's limits before anything is sent
    pub fn validate(&self, package: &FirmwarePackage) -> PackageResult<()> {
        package.validate()?;
        match self {
            Self::Streamed => Ok(()),
            Self::Page => page::check_block_sizes(package),
        }
    }
}

impl FromStr for FirmwareDriver {
    type Err = FirmwareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CANFIX" | "STD" => Ok(Self::Streamed),
            "BASIC" => Ok(Self::Page),
            _ => Err(FirmwareError::UnknownDriver(s.to_string())),
        }
    }
}

impl fmt::Display for FirmwareDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Pushes a firmware package to one node
pub struct FirmwareUpdater {
    exchange: NodeExchange,
    config: FirmwareConfig,
    cancel: CancelHandle,
}

impl FirmwareUpdater {
    pub fn new(exchange: NodeExchange, config: FirmwareConfig) -> Self {
        Self {
            exchange,
            config,
            cancel: CancelHandle::new(),
        }
    }

    /// Handle that stops the transfer at the next block boundary
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run a transfer to completion
    ///
    /// Every outcome, including errors raised before the first block, is
    /// also reported as a single `Finished` event.
    pub async fn update(
        &self,
        node: u8,
        code: u16,
        driver: FirmwareDriver,
        package: &FirmwarePackage,
        events: Option<mpsc::UnboundedSender<TransferEvent>>,
    ) -> FirmwareResult<TransferSummary> {
        let mut reporter = Reporter::new(events);
        let result = self
            .run(node, code, driver, package, &mut reporter)
            .await;

        match &result {
            Ok(summary) => {
                reporter.set_state(TransferState::Complete);
                reporter.progress(1.0);
                match summary.checksum {
                    Some(crc) => reporter.status(format!(
                        "Download Complete Checksum 0x{:X}, Size {}",
                        crc, summary.bytes
                    )),
                    None => reporter.status("Download Complete"),
                }
                info!(node, bytes = summary.bytes, blocks = summary.blocks, "Firmware transfer complete");
                reporter.finish(TransferOutcome::Complete(summary.clone()));
            }
            Err(FirmwareError::Cancelled) => {
                reporter.set_state(TransferState::Cancelled);
                reporter.progress(0.0);
                reporter.status("Download Stopped");
                reporter.finish(TransferOutcome::Cancelled);
            }
            Err(e) => {
                let text = failure_status(e, reporter.state());
                warn!(node, error = %e, "Firmware transfer failed");
                reporter.set_state(TransferState::Failed);
                reporter.progress(0.0);
                reporter.status(text.clone());
                reporter.finish(TransferOutcome::Failed(text));
            }
        }
        result
    }

    /// Run the transfer on its own task
    pub fn spawn(
        self,
        node: u8,
        code: u16,
        driver: FirmwareDriver,
        package: FirmwarePackage,
    ) -> (
        JoinHandle<FirmwareResult<TransferSummary>>,
        mpsc::UnboundedReceiver<TransferEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            self.update(node, code, driver, &package, Some(tx)).await
        });
        (handle, rx)
    }

    async fn run(
        &self,
        node: u8,
        code: u16,
        driver: FirmwareDriver,
        package: &FirmwarePackage,
        reporter: &mut Reporter,
    ) -> FirmwareResult<TransferSummary> {
        driver.validate(package)?;

        reporter.set_state(TransferState::RequestingDownload);
        reporter.status("Requesting Firmware Load");
        // Listen on the channel before the node can start answering
        let mut link = ChannelLink::new(
            self.exchange.bus().connection(),
            self.config.channel,
            self.config.ack_timeout(),
        )?;

        let status = self
            .exchange
            .start_firmware_update(node, code, self.config.channel)
            .await?
            .ok_or(FirmwareError::NoResponse(node))?;
        if status != 0 {
            return Err(FirmwareError::Refused { node, status });
        }
        info!(
            node,
            driver = %driver,
            channel = self.config.channel,
            size = package.total_size(),
            "Firmware load started"
        );

        reporter.set_state(TransferState::SendingBlocks);
        match driver {
            FirmwareDriver::Streamed => {
                streamed::download(&mut link, package, reporter, &self.cancel).await
            }
            FirmwareDriver::Page => page::download(&mut link, package, reporter, &self.cancel).await,
        }
    }
}

/// Status line shown when a transfer fails
pub fn failure_status(error: &FirmwareError, state: TransferState) -> String {
    match (error, state) {
        (FirmwareError::Timeout, TransferState::Finalizing) => {
            "FAIL: Timeout While Finalizing Download".to_string()
        }
        (FirmwareError::Timeout, _) => "FAIL: Timeout Writing Data".to_string(),
        (FirmwareError::BadOffset { .. }, _) => "FAIL: Bad Block Offset Received".to_string(),
        (e, _) => format!("FAIL: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CanBus;
    use crate::config::ExchangeConfig;
    use crate::testing::{Fault, SimulatedNode, SimulatedNodeConfig};
    use crate::transport::MockBusAdapter;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::sync::Arc;

    const NODE: u8 = 0x20;
    const CODE: u16 = 0x5A5A;

    fn package(sizes: &[(usize, u32)]) -> FirmwarePackage {
        FirmwarePackage::from_files(
            sizes
                .iter()
                .enumerate()
                .map(|(n, (size, block_size))| PackageFile {
                    format: FileFormat::List,
                    name: format!("f{}", n),
                    offset: 0,
                    block_type: 1,
                    subsystem: n as u8,
                    block_size: *block_size,
                    data: (0..*size).map(|b| b as u8).collect(),
                })
                .collect(),
        )
    }

    fn setup(driver: FirmwareDriver, fault: Fault) -> (SimulatedNode, FirmwareUpdater) {
        let mock = Arc::new(MockBusAdapter::default());
        let bus = Arc::new(CanBus::with_adapter(mock.clone(), 1024));
        let sim = SimulatedNode::start(
            mock,
            SimulatedNodeConfig {
                node_id: NODE,
                firmware_code: CODE,
                driver,
                fault,
                ..Default::default()
            },
        );
        let exchange = NodeExchange::new(
            bus,
            ExchangeConfig {
                node_id: 0xFF,
                response_timeout_ms: 500,
            },
        );
        let updater = FirmwareUpdater::new(
            exchange,
            FirmwareConfig {
                ack_timeout_ms: 200,
                channel: 2,
            },
        );
        (sim, updater)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    fn finished(events: &[TransferEvent]) -> Vec<&TransferOutcome> {
        events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Finished(o) => Some(o),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_driver_names() {
        assert_eq!("CANFIX".parse::<FirmwareDriver>().unwrap(), FirmwareDriver::Streamed);
        assert_eq!("std".parse::<FirmwareDriver>().unwrap(), FirmwareDriver::Streamed);
        assert_eq!("BASIC".parse::<FirmwareDriver>().unwrap(), FirmwareDriver::Page);
        assert!(matches!(
            "AVR109".parse::<FirmwareDriver>(),
            Err(FirmwareError::UnknownDriver(_))
        ));
    }

    #[tokio::test]
    async fn test_streamed_transfer() {
        let (sim, updater) = setup(FirmwareDriver::Streamed, Fault::None);
        let pkg = package(&[(20, 8), (5, 4)]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let summary = updater
            .update(NODE, CODE, FirmwareDriver::Streamed, &pkg, Some(tx))
            .await
            .unwrap();
        assert_eq!(summary.bytes, 25);
        assert_eq!(summary.blocks, 5);

        // ceil(20/8) + ceil(5/4)
        let starts = sim.block_starts();
        assert_eq!(starts.len(), 5);
        assert_eq!(starts[0], (1, 0, 3, 0));
        assert_eq!(starts[2], (1, 0, 3, 16));
        assert_eq!(starts[4], (1, 1, 2, 4));
        assert_eq!(sim.end_of_transmission(), 1);
        assert_eq!(sim.image().len(), 25);

        let events = drain(&mut rx);
        assert_eq!(
            finished(&events),
            vec![&TransferOutcome::Complete(summary)]
        );
        assert!(events.contains(&TransferEvent::Status("Writing Block 1 of 5".into())));
        assert!(events.contains(&TransferEvent::State(TransferState::Finalizing)));
        assert_eq!(events.last(), Some(&TransferEvent::Finished(TransferOutcome::Complete(TransferSummary {
            bytes: 25,
            blocks: 5,
            checksum: None,
        }))));
    }

    #[tokio::test]
    async fn test_bad_address_stops_transfer() {
        let (sim, updater) = setup(
            FirmwareDriver::Streamed,
            Fault::NodeError { block: 1, code: 0x03 },
        );
        let pkg = package(&[(32, 8)]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = updater
            .update(NODE, CODE, FirmwareDriver::Streamed, &pkg, Some(tx))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::Node {
                kind: NodeErrorKind::BadAddress,
                offset: 8,
                ..
            }
        ));
        assert!(err.to_string().contains("Bad Address Error"));
        // No further blocks after the rejected one
        assert_eq!(sim.block_starts().len(), 2);
        assert_eq!(sim.end_of_transmission(), 0);

        let events = drain(&mut rx);
        assert_eq!(finished(&events).len(), 1);
        assert!(events.contains(&TransferEvent::State(TransferState::Failed)));
    }

    #[tokio::test]
    async fn test_bad_echo_terminates_block() {
        let (sim, updater) = setup(FirmwareDriver::Streamed, Fault::BadEcho { block: 0 });
        let pkg = package(&[(16, 16)]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = updater
            .update(NODE, CODE, FirmwareDriver::Streamed, &pkg, Some(tx))
            .await
            .unwrap_err();
        assert!(matches!(err, FirmwareError::BadOffset { expected: 7, .. }));
        assert!(err.to_string().starts_with("bad block offset received"));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(sim.terminations(), 1);
        let events = drain(&mut rx);
        assert!(events.contains(&TransferEvent::Status("FAIL: Bad Block Offset Received".into())));
    }

    #[tokio::test]
    async fn test_cancel_before_first_block() {
        let (sim, updater) = setup(FirmwareDriver::Streamed, Fault::None);
        updater.cancel_handle().cancel();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = updater
            .update(NODE, CODE, FirmwareDriver::Streamed, &package(&[(16, 8)]), Some(tx))
            .await
            .unwrap_err();
        assert!(matches!(err, FirmwareError::Cancelled));
        assert!(sim.block_starts().is_empty());
        assert_eq!(sim.end_of_transmission(), 0);

        let events = drain(&mut rx);
        assert!(events.contains(&TransferEvent::Status("Download Stopped".into())));
        assert!(events.contains(&TransferEvent::Progress(0.0)));
        assert_eq!(finished(&events), vec![&TransferOutcome::Cancelled]);
    }

    #[tokio::test]
    async fn test_wrong_code_refused_before_any_block() {
        let (sim, updater) = setup(FirmwareDriver::Streamed, Fault::None);
        let err = updater
            .update(NODE, 0x1111, FirmwareDriver::Streamed, &package(&[(8, 8)]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FirmwareError::Refused { node: NODE, .. }));
        assert!(sim.block_starts().is_empty());
    }

    #[tokio::test]
    async fn test_bad_block_size_fails_before_handshake() {
        let (sim, updater) = setup(FirmwareDriver::Streamed, Fault::None);
        let err = updater
            .update(NODE, CODE, FirmwareDriver::Streamed, &package(&[(8, 6)]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FirmwareError::Package(PackageError::BadBlockSize { .. })));
        assert_eq!(sim.update_requests(), 0);
    }

    #[tokio::test]
    async fn test_address_overflow_fails_before_handshake() {
        let (sim, updater) = setup(FirmwareDriver::Streamed, Fault::None);
        let pkg = FirmwarePackage::from_files(vec![PackageFile {
            format: FileFormat::List,
            name: "high".into(),
            offset: 0xFFFF_FFF8,
            block_type: 1,
            subsystem: 0,
            block_size: 8,
            data: vec![0; 16],
        }]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = updater
            .update(NODE, CODE, FirmwareDriver::Streamed, &pkg, Some(tx))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::Package(PackageError::AddressOverflow { .. })
        ));
        assert_eq!(sim.update_requests(), 0);
        assert!(sim.block_starts().is_empty());

        let events = drain(&mut rx);
        assert_eq!(finished(&events).len(), 1);
        assert!(events.contains(&TransferEvent::State(TransferState::Failed)));
    }

    #[tokio::test]
    async fn test_page_block_larger_than_buffer_fails_before_handshake() {
        let (sim, updater) = setup(FirmwareDriver::Page, Fault::None);
        let pkg = package(&[(16, 0x1_0000)]);

        // The streamed driver has no such limit
        assert!(FirmwareDriver::Streamed.validate(&pkg).is_ok());

        let err = updater
            .update(NODE, CODE, FirmwareDriver::Page, &pkg, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::Package(PackageError::BlockTooLarge {
                size: 0x1_0000,
                limit: 0xFFFF,
                ..
            })
        ));
        assert_eq!(sim.update_requests(), 0);
        assert!(sim.pages_written().is_empty());
    }

    #[rstest]
    #[case(0x00, NodeErrorKind::BadBlockType, "Bad Block Type Error")]
    #[case(0x01, NodeErrorKind::WrongSubsystem, "Wrong Subsystem Error")]
    #[case(0x02, NodeErrorKind::UnsupportedBlockSize, "Unsupported Block Size Error")]
    #[case(0x03, NodeErrorKind::BadAddress, "Bad Address Error")]
    #[tokio::test]
    async fn test_node_error_stops_transfer(
        #[case] code: u8,
        #[case] kind: NodeErrorKind,
        #[case] text: &str,
    ) {
        let (sim, updater) = setup(FirmwareDriver::Streamed, Fault::NodeError { block: 0, code });
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = updater
            .update(NODE, CODE, FirmwareDriver::Streamed, &package(&[(24, 8)]), Some(tx))
            .await
            .unwrap_err();
        assert_eq!(err.node_error(), Some(kind));
        assert!(err.to_string().starts_with(text), "{}", err);

        assert_eq!(sim.block_starts().len(), 1);
        assert_eq!(sim.end_of_transmission(), 0);
        let events = drain(&mut rx);
        assert_eq!(
            finished(&events),
            vec![&TransferOutcome::Failed(format!("FAIL: {}", err))]
        );
    }

    #[tokio::test]
    async fn test_page_transfer_reports_checksum() {
        let (sim, updater) = setup(FirmwareDriver::Page, Fault::None);
        let pkg = package(&[(40, 16)]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let summary = updater
            .update(NODE, CODE, FirmwareDriver::Page, &pkg, Some(tx))
            .await
            .unwrap();
        let crc = page::checksum(&pkg.files()[0].data);
        assert_eq!(summary.checksum, Some(crc));
        assert_eq!(sim.pages_written(), vec![0, 16, 32]);
        assert_eq!(sim.image(), pkg.files()[0].data);
        assert_eq!(sim.completion(), Some((crc, 40)));

        let events = drain(&mut rx);
        assert!(events.contains(&TransferEvent::Status(format!(
            "Download Complete Checksum 0x{:X}, Size 40",
            crc
        ))));
    }

    #[tokio::test]
    async fn test_page_fill_retried_after_bad_echo() {
        let (sim, updater) = setup(FirmwareDriver::Page, Fault::BadEcho { block: 1 });
        let pkg = package(&[(32, 16)]);
        updater
            .update(NODE, CODE, FirmwareDriver::Page, &pkg, None)
            .await
            .unwrap();
        assert_eq!(sim.pages_written(), vec![0, 16]);
        assert_eq!(sim.image(), pkg.files()[0].data);
    }

    #[tokio::test]
    async fn test_timeout_while_finalizing() {
        let (_sim, updater) = setup(FirmwareDriver::Page, Fault::SilentAtEnd);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = updater
            .update(NODE, CODE, FirmwareDriver::Page, &package(&[(8, 8)]), Some(tx))
            .await
            .unwrap_err();
        assert!(matches!(err, FirmwareError::Timeout));
        let events = drain(&mut rx);
        assert!(events.contains(&TransferEvent::Status(
            "FAIL: Timeout While Finalizing Download".into()
        )));
        assert_eq!(finished(&events).len(), 1);
    }

    #[tokio::test]
    async fn test_silent_node_times_out_writing() {
        let (_sim, updater) = setup(FirmwareDriver::Streamed, Fault::Silent);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = updater
            .update(NODE, CODE, FirmwareDriver::Streamed, &package(&[(8, 8)]), Some(tx))
            .await
            .unwrap_err();
        assert!(matches!(err, FirmwareError::Timeout));
        assert!(drain(&mut rx).contains(&TransferEvent::Status("FAIL: Timeout Writing Data".into())));
    }

    #[tokio::test]
    async fn test_spawned_transfer() {
        let (sim, updater) = setup(FirmwareDriver::Streamed, Fault::None);
        let (handle, mut rx) = updater.spawn(NODE, CODE, FirmwareDriver::Streamed, package(&[(12, 8)]));
        let mut outcomes = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event, TransferEvent::Finished(_)) {
                outcomes += 1;
            }
        }
        assert_eq!(outcomes, 1);
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(sim.block_starts().len(), 2);
    }
}
