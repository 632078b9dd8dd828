//! Simulated CAN-FIX node
//!
//! Attaches to a [`MockBusAdapter`] and answers what our side sends:
//! identification, configuration query/set, the firmware update handshake
//! and both firmware transfer protocols. It records what it received so
//! tests can check the wire traffic, and can be told to misbehave.
//! Also used by the command line tool's `mock` interface.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::firmware::{page, streamed, FirmwareDriver};
use crate::protocol::{channel_id, ConfigFrame, Function, Message, NodeIdentity, ParameterFrame};
use crate::transport::{CanFrame, MockBusAdapter};

/// Misbehaviour injected into the firmware loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    None,
    /// Reject the block start of block `block` with `[0xFF, code]`
    NodeError { block: usize, code: u8 },
    /// Wrong echo for the first data of block `block` (once)
    BadEcho { block: usize },
    /// Accept the handshake but never answer on the channel
    Silent,
    /// Never acknowledge end of transmission / download complete
    SilentAtEnd,
}

#[derive(Debug, Clone)]
pub struct SimulatedNodeConfig {
    pub node_id: u8,
    pub identity: NodeIdentity,
    pub firmware_code: u16,
    pub driver: FirmwareDriver,
    pub fault: Fault,
    /// Raw configuration values by key
    pub configuration: BTreeMap<u16, Vec<u8>>,
    pub read_only: BTreeSet<u16>,
    /// Periodic node status and parameter broadcast
    pub heartbeat: Option<Duration>,
    /// (id, data) parameters sent with every heartbeat
    pub parameters: Vec<(u16, Vec<u8>)>,
}

impl Default for SimulatedNodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0x20,
            identity: NodeIdentity {
                device_type: 0x30,
                firmware_version: 1,
                model: 1,
            },
            firmware_code: 0,
            driver: FirmwareDriver::Streamed,
            fault: Fault::None,
            configuration: BTreeMap::new(),
            read_only: BTreeSet::new(),
            heartbeat: None,
            parameters: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Loader {
    channel: Option<u8>,
    blocks_started: usize,
    in_block: bool,
    block_received: u32,
    faulted_block: Option<usize>,
    terminating: bool,
    fill: Option<(u32, usize)>,
    buffer: Vec<u8>,
    block_starts: Vec<(u8, u8, u8, u32)>,
    image: Vec<u8>,
    pages_written: Vec<u32>,
    end_of_transmission: usize,
    terminations: usize,
    completion: Option<(u16, u32)>,
    update_requests: usize,
}

struct Core {
    config: SimulatedNodeConfig,
    values: Mutex<BTreeMap<u16, Vec<u8>>>,
    loader: Mutex<Loader>,
}

/// Running simulated node; stops when dropped
pub struct SimulatedNode {
    core: Arc<Core>,
    handle: JoinHandle<()>,
}

impl SimulatedNode {
    pub fn start(mock: Arc<MockBusAdapter>, config: SimulatedNodeConfig) -> Self {
        let core = Arc::new(Core {
            values: Mutex::new(config.configuration.clone()),
            config,
            loader: Mutex::new(Loader::default()),
        });
        let mut sent = mock.subscribe_sent();
        let task_core = core.clone();
        let handle = tokio::spawn(async move {
            let core = task_core;
            let mut heartbeat = core.config.heartbeat.map(tokio::time::interval);
            loop {
                let tick = async {
                    match heartbeat.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    received = sent.recv() => match received {
                        Ok(frame) => {
                            for reply in core.handle(&frame) {
                                mock.inject(reply);
                            }
                        }
                        Err(RecvError::Lagged(n)) => debug!(dropped = n, "Simulated node lagged"),
                        Err(RecvError::Closed) => break,
                    },
                    _ = tick => {
                        for frame in core.heartbeat() {
                            mock.inject(frame);
                        }
                    }
                }
            }
        });
        debug!(node = core.config.node_id, "Simulated node started");
        Self { core, handle }
    }

    pub fn node_id(&self) -> u8 {
        self.core.config.node_id
    }

    /// Current raw value of a configuration key
    pub fn config_value(&self, key: u16) -> Option<Vec<u8>> {
        self.core.values.lock().get(&key).cloned()
    }

    /// (block type, subsystem, log2 block size, offset) of every block start
    pub fn block_starts(&self) -> Vec<(u8, u8, u8, u32)> {
        self.core.loader.lock().block_starts.clone()
    }

    /// Bytes received by the loader
    pub fn image(&self) -> Vec<u8> {
        self.core.loader.lock().image.clone()
    }

    pub fn pages_written(&self) -> Vec<u32> {
        self.core.loader.lock().pages_written.clone()
    }

    pub fn end_of_transmission(&self) -> usize {
        self.core.loader.lock().end_of_transmission
    }

    pub fn terminations(&self) -> usize {
        self.core.loader.lock().terminations
    }

    /// Checksum and size of the page driver's download-complete command
    pub fn completion(&self) -> Option<(u16, u32)> {
        self.core.loader.lock().completion
    }

    pub fn update_requests(&self) -> usize {
        self.core.loader.lock().update_requests
    }
}

impl Drop for SimulatedNode {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl Core {
    fn handle(&self, frame: &CanFrame) -> Vec<CanFrame> {
        let channel = self.loader.lock().channel;
        if let Some(ch) = channel {
            if channel_id(ch, false).ok() == Some(frame.id) {
                return self.handle_channel(&frame.data);
            }
        }

        let Ok(msg) = Message::parse(frame) else {
            return Vec::new();
        };
        let me = self.config.node_id;
        let reply = match msg {
            Message::IdentifyRequest { sender, dest } if dest == me => {
                Some(Message::IdentifyResponse {
                    sender: me,
                    dest: sender,
                    identity: self.config.identity,
                })
            }
            Message::ConfigQuery(c) if c.dest == me => {
                let key = c.key().unwrap_or_default();
                let values = self.values.lock();
                let reply = match values.get(&key) {
                    Some(v) => ConfigFrame::response(me, c.sender, 0, v),
                    None => ConfigFrame::response(me, c.sender, 1, &[]),
                };
                Some(Message::ConfigQuery(reply))
            }
            Message::ConfigSet(c) if c.dest == me => {
                let key = c.key().unwrap_or_default();
                let mut values = self.values.lock();
                let status = if self.config.read_only.contains(&key) {
                    2
                } else if values.contains_key(&key) {
                    values.insert(key, c.request_value().to_vec());
                    0
                } else {
                    1
                };
                Some(Message::ConfigSet(ConfigFrame::response(me, c.sender, status, &[])))
            }
            Message::UpdateFirmwareRequest {
                sender,
                dest,
                code,
                channel,
            } if dest == me => {
                let mut loader = self.loader.lock();
                loader.update_requests += 1;
                let status = if code == self.config.firmware_code {
                    loader.channel = Some(channel);
                    0
                } else {
                    1
                };
                Some(Message::UpdateFirmwareResponse {
                    sender: me,
                    dest: sender,
                    status,
                })
            }
            _ => None,
        };
        reply
            .and_then(|m| m.to_frame().ok())
            .into_iter()
            .collect()
    }

    fn handle_channel(&self, data: &[u8]) -> Vec<CanFrame> {
        let Some(ch) = self.loader.lock().channel else {
            return Vec::new();
        };
        if self.config.fault == Fault::Silent {
            return Vec::new();
        }
        let reply = match self.config.driver {
            FirmwareDriver::Streamed => self.streamed(data),
            FirmwareDriver::Page => self.page(data),
        };
        reply
            .and_then(|d| channel_id(ch, true).ok().and_then(|id| CanFrame::new(id, d).ok()))
            .into_iter()
            .collect()
    }

    fn streamed(&self, data: &[u8]) -> Option<Vec<u8>> {
        let mut l = self.loader.lock();
        if l.terminating {
            if data == [streamed::TERMINATE] {
                l.terminations += 1;
            }
            l.terminating = false;
            l.in_block = false;
            return None;
        }
        if !l.in_block {
            if data == [streamed::END_OF_TRANSMISSION] {
                l.end_of_transmission += 1;
                return (self.config.fault != Fault::SilentAtEnd).then(|| vec![0x00]);
            }
            if data.len() < 7 {
                return None;
            }
            let offset = u32::from_le_bytes([data[3], data[4], data[5], data[6]]);
            l.block_starts.push((data[0], data[1], data[2], offset));
            let block = l.blocks_started;
            l.blocks_started += 1;
            if let Fault::NodeError { block: at, code } = self.config.fault {
                if at == block {
                    return Some(vec![streamed::NODE_ERROR, code]);
                }
            }
            l.in_block = true;
            l.block_received = 0;
            return Some(vec![0x00]);
        }
        if data.is_empty() {
            l.in_block = false;
            return Some(vec![0x00]);
        }

        l.image.extend_from_slice(data);
        l.block_received += data.len() as u32;
        let mut echo = l.block_received - 1;
        if let Fault::BadEcho { block } = self.config.fault {
            if block + 1 == l.blocks_started && l.faulted_block.is_none() {
                l.faulted_block = Some(block);
                l.terminating = true;
                echo += 1;
            }
        }
        trace!(echo, "Simulated node echo");
        Some(echo.to_le_bytes().to_vec())
    }

    fn page(&self, data: &[u8]) -> Option<Vec<u8>> {
        let mut l = self.loader.lock();
        if let Some((address, len)) = l.fill {
            l.buffer.extend_from_slice(data);
            let count = l.buffer.len();
            if count >= len {
                l.fill = None;
            }
            trace!(address, count, "Simulated page fill");
            return Some((count as u16).to_le_bytes().to_vec());
        }

        match data.first().copied() {
            Some(page::FILL_BUFFER) if data.len() == 7 => {
                let address = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                let len = u16::from_le_bytes([data[5], data[6]]) as usize;
                let block = l.blocks_started;
                if let Fault::BadEcho { block: at } = self.config.fault {
                    if at == block && l.faulted_block.is_none() {
                        l.faulted_block = Some(at);
                        let mut bad = data.to_vec();
                        bad[1] ^= 0xFF;
                        return Some(bad);
                    }
                }
                l.blocks_started += 1;
                l.buffer.clear();
                l.fill = (len > 0).then_some((address, len));
                Some(data.to_vec())
            }
            Some(page::ERASE_PAGE) if data.len() == 5 => Some(data.to_vec()),
            Some(page::WRITE_PAGE) if data.len() == 5 => {
                let address = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
                let buffer = std::mem::take(&mut l.buffer);
                if l.image.len() < address + buffer.len() {
                    l.image.resize(address + buffer.len(), 0xFF);
                }
                l.image[address..address + buffer.len()].copy_from_slice(&buffer);
                l.pages_written.push(address as u32);
                Some(data.to_vec())
            }
            Some(page::COMPLETE) if data.len() == 7 => {
                let crc = u16::from_le_bytes([data[1], data[2]]);
                let size = u32::from_le_bytes([data[3], data[4], data[5], data[6]]);
                l.completion = Some((crc, size));
                (self.config.fault != Fault::SilentAtEnd).then(|| data.to_vec())
            }
            _ => None,
        }
    }

    fn heartbeat(&self) -> Vec<CanFrame> {
        let me = self.config.node_id;
        let mut messages = vec![Message::NodeStatus {
            sender: me,
            status_type: 0,
            value: vec![0, 0],
        }];
        messages.extend(self.config.parameters.iter().map(|(id, data)| {
            Message::Parameter(ParameterFrame {
                id: *id,
                node: me,
                index: 0,
                function: Function(0),
                data: data.clone(),
            })
        }));
        messages.iter().filter_map(|m| m.to_frame().ok()).collect()
    }
}
