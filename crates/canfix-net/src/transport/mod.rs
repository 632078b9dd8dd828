//! Transport layer for CAN-FIX traffic
//!
//! This module provides bus adapters for a physical CAN interface:
//! - SocketCAN adapter for raw CAN frames (Linux only)
//! - Mock adapter for testing
//!
//! # Example
//!
//! ```ignore
//! use canfix_net::transport::{create_adapter, BusAdapter, CanFrame};
//! use canfix_net::config::TransportConfig;
//!
//! let adapter = create_adapter(&TransportConfig::default()).await?;
//! adapter.send(&CanFrame::new(0x6FF, vec![0x00, 0x05])?).await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use adapter::{BusAdapter, CanFrame, MAX_STANDARD_ID};
pub use error::TransportError;
pub use mock::MockBusAdapter;

use std::sync::Arc;

use crate::config::TransportConfig;

/// Create a bus adapter based on configuration
pub async fn create_adapter(
    config: &TransportConfig,
) -> Result<Arc<dyn BusAdapter>, TransportError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::SocketCan(cfg) => {
            let adapter = socketcan::SocketCanAdapter::new(cfg).await?;
            Ok(Arc::new(adapter))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportConfig::SocketCan(_) => Err(TransportError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        TransportConfig::Mock(cfg) => Ok(Arc::new(MockBusAdapter::new(cfg))),
    }
}
