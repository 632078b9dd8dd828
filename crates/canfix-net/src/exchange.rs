//! Request/response exchanges with a single node
//!
//! Each exchange acquires its own bus connection, sends one request and
//! waits for the first matching response inside the response window. A
//! response matches when it is the expected message kind, is addressed to
//! our node id and comes from the node we asked. No retries happen here;
//! callers that want them (configuration save/load) loop themselves.

use std::sync::Arc;
use std::time::Duration;

use canfix_defs::{DataType, DefsError, Value};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::bus::{BusError, CanBus};
use crate::config::ExchangeConfig;
use crate::protocol::{config_status_text, CodecError, ConfigFrame, Message, NodeIdentity};

/// Per-attempt receive bound
const RECV_ATTEMPT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("value conversion: {0}")]
    Value(#[from] DefsError),

    #[error("node {node} rejected key {key}: {text}")]
    Status {
        node: u8,
        key: u16,
        status: u8,
        text: String,
    },
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Configuration set/query response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigResponse {
    pub status: u8,
    /// Value bytes of a query response
    pub value: Vec<u8>,
}

impl ConfigResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }

    pub fn status_text(&self) -> String {
        config_status_text(self.status)
    }
}

/// Synchronous request/response helpers bound to one bus
#[derive(Clone)]
pub struct NodeExchange {
    bus: Arc<CanBus>,
    config: ExchangeConfig,
}

impl NodeExchange {
    pub fn new(bus: Arc<CanBus>, config: ExchangeConfig) -> Self {
        Self { bus, config }
    }

    /// Our node id, used as sender
    pub fn node_id(&self) -> u8 {
        self.config.node_id
    }

    pub fn bus(&self) -> &Arc<CanBus> {
        &self.bus
    }

    /// Write one configuration key
    ///
    /// The value is encoded with the key's datatype and multiplier.
    pub async fn set_node_configuration(
        &self,
        dest: u8,
        key: u16,
        datatype: DataType,
        multiplier: f64,
        value: &Value,
    ) -> ExchangeResult<Option<ConfigResponse>> {
        let bytes = datatype.encode(value, multiplier)?;
        debug!(node = dest, key, value = %value, "Setting configuration");
        let request = Message::ConfigSet(ConfigFrame::set_request(self.node_id(), dest, key, &bytes));
        self.request(&request, |msg| match msg {
            Message::ConfigSet(c) if self.is_reply(c.sender, c.dest, dest) => {
                Some(ConfigResponse {
                    status: c.status()?,
                    value: Vec::new(),
                })
            }
            _ => None,
        })
        .await
    }

    /// Read the raw bytes of one configuration key
    pub async fn query_node_configuration(
        &self,
        dest: u8,
        key: u16,
    ) -> ExchangeResult<Option<ConfigResponse>> {
        debug!(node = dest, key, "Querying configuration");
        let request = Message::ConfigQuery(ConfigFrame::query_request(self.node_id(), dest, key));
        self.request(&request, |msg| match msg {
            Message::ConfigQuery(c) if self.is_reply(c.sender, c.dest, dest) => {
                Some(ConfigResponse {
                    status: c.status()?,
                    value: c.response_value().to_vec(),
                })
            }
            _ => None,
        })
        .await
    }

    /// Read and decode one configuration key
    ///
    /// A non-zero response status is an error; no response is `Ok(None)`.
    pub async fn query_value(
        &self,
        dest: u8,
        key: u16,
        datatype: DataType,
        multiplier: f64,
    ) -> ExchangeResult<Option<Value>> {
        let Some(resp) = self.query_node_configuration(dest, key).await? else {
            return Ok(None);
        };
        if !resp.is_ok() {
            return Err(ExchangeError::Status {
                node: dest,
                key,
                status: resp.status,
                text: resp.status_text(),
            });
        }
        Ok(Some(datatype.decode(&resp.value, multiplier)?))
    }

    /// Ask a node to identify itself
    pub async fn get_node_information(&self, dest: u8) -> ExchangeResult<Option<NodeIdentity>> {
        let request = Message::IdentifyRequest {
            sender: self.node_id(),
            dest,
        };
        self.request(&request, |msg| match msg {
            Message::IdentifyResponse {
                sender,
                dest: to,
                identity,
            } if self.is_reply(*sender, *to, dest) => Some(*identity),
            _ => None,
        })
        .await
    }

    /// Ask a node to enter its firmware loader
    ///
    /// Returns the node's status byte (0 = ready).
    pub async fn start_firmware_update(
        &self,
        dest: u8,
        code: u16,
        channel: u8,
    ) -> ExchangeResult<Option<u8>> {
        let request = Message::UpdateFirmwareRequest {
            sender: self.node_id(),
            dest,
            code,
            channel,
        };
        self.request(&request, |msg| match msg {
            Message::UpdateFirmwareResponse {
                sender,
                dest: to,
                status,
            } if self.is_reply(*sender, *to, dest) => Some(*status),
            _ => None,
        })
        .await
    }

    fn is_reply(&self, sender: u8, to: u8, target: u8) -> bool {
        sender == target && to == self.node_id()
    }

    async fn request<T>(
        &self,
        request: &Message,
        matcher: impl Fn(&Message) -> Option<T>,
    ) -> ExchangeResult<Option<T>> {
        let frame = request.to_frame()?;
        let mut conn = self.bus.connection();
        conn.send(&frame).await?;

        let deadline = Instant::now() + self.config.response_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(request = %request, "No response");
                return Ok(None);
            }
            match conn.recv(remaining.min(RECV_ATTEMPT)).await {
                Ok(reply) => match Message::parse(&reply) {
                    Ok(msg) => {
                        if let Some(found) = matcher(&msg) {
                            return Ok(Some(found));
                        }
                    }
                    Err(e) => trace!(frame = %reply, error = %e, "Skipping undecodable frame"),
                },
                Err(BusError::Timeout) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CanFrame, MockBusAdapter};
    use pretty_assertions::assert_eq;

    fn setup(timeout_ms: u64) -> (Arc<MockBusAdapter>, NodeExchange) {
        let mock = Arc::new(MockBusAdapter::default());
        let bus = Arc::new(CanBus::with_adapter(mock.clone(), 64));
        let ex = NodeExchange::new(
            bus,
            ExchangeConfig {
                node_id: 0xFF,
                response_timeout_ms: timeout_ms,
            },
        );
        (mock, ex)
    }

    /// Answer the first sent frame with `reply`
    fn respond(mock: &Arc<MockBusAdapter>, reply: Vec<CanFrame>) {
        let mut sent = mock.subscribe_sent();
        let mock = mock.clone();
        tokio::spawn(async move {
            if sent.recv().await.is_ok() {
                for f in reply {
                    mock.inject(f);
                }
            }
        });
    }

    #[tokio::test]
    async fn test_query_no_reply_is_none_and_releases() {
        let (_mock, ex) = setup(100);
        let result = ex.query_node_configuration(3, 1).await.unwrap();
        assert!(result.is_none());
        let stats = ex.bus().stats();
        assert_eq!(stats.open_connections, 0);
        assert_eq!(stats.released_connections, 1);
    }

    #[tokio::test]
    async fn test_query_ignores_other_nodes_and_kinds() {
        let (mock, ex) = setup(500);
        respond(
            &mock,
            vec![
                // Wrong sender
                CanFrame::new(0x6E4, vec![0x0A, 0xFF, 0x00, 0x01]).unwrap(),
                // Wrong destination
                CanFrame::new(0x6E3, vec![0x0A, 0x10, 0x00, 0x02]).unwrap(),
                // Wrong kind
                CanFrame::new(0x6E3, vec![0x09, 0xFF, 0x00]).unwrap(),
                CanFrame::new(0x6E3, vec![0x0A, 0xFF, 0x00, 0x2C, 0x01]).unwrap(),
            ],
        );
        let value = ex
            .query_value(3, 1, DataType::Uint, 1.0)
            .await
            .unwrap();
        assert_eq!(value, Some(Value::Int(300)));
        let sent = mock.sent();
        assert_eq!(sent[0].id, 0x7DF);
        assert_eq!(sent[0].data, vec![0x0A, 0x03, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn test_query_value_status_error() {
        let (mock, ex) = setup(500);
        respond(&mock, vec![CanFrame::new(0x6E3, vec![0x0A, 0xFF, 0x01]).unwrap()]);
        let err = ex
            .query_value(3, 7, DataType::Uint, 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Status { status: 1, key: 7, .. }));
    }

    #[tokio::test]
    async fn test_set_encodes_with_multiplier() {
        let (mock, ex) = setup(500);
        respond(&mock, vec![CanFrame::new(0x6E3, vec![0x09, 0xFF, 0x00]).unwrap()]);
        let resp = ex
            .set_node_configuration(3, 0x10, DataType::Uint, 0.1, &Value::Float(40.0))
            .await
            .unwrap()
            .unwrap();
        assert!(resp.is_ok());
        assert_eq!(mock.sent()[0].data, vec![0x09, 0x03, 0x10, 0x00, 0x90, 0x01]);
    }

    #[tokio::test]
    async fn test_node_information() {
        let (mock, ex) = setup(500);
        respond(
            &mock,
            vec![CanFrame::new(0x6E3, vec![0x00, 0xFF, 0x01, 0x10, 0x02, 0x2B, 0x1A, 0x00]).unwrap()],
        );
        let id = ex.get_node_information(3).await.unwrap().unwrap();
        assert_eq!(id.device_type, 0x10);
        assert_eq!(id.model, 0x1A2B);
        assert_eq!(id.firmware_version, 2);
    }

    #[tokio::test]
    async fn test_not_connected_is_error() {
        let (mock, ex) = setup(100);
        mock.set_connected(false);
        assert!(matches!(
            ex.get_node_information(3).await,
            Err(ExchangeError::Bus(BusError::NotConnected))
        ));
        assert_eq!(ex.bus().stats().open_connections, 0);
    }
}
