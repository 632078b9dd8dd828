//! Node and parameter tracking engine
//!
//! Pure state: messages and the current time go in, events and at most one
//! identification request come out. The service module drives it from a bus
//! connection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use canfix_defs::DeviceStore;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Node, Parameter, TrackerError, TrackerEvent};
use crate::protocol::{Message, ParameterFrame};

/// Node status type carrying the status code
const STATUS_CODE: u16 = 0;

pub struct NodeTracker {
    own_node: u8,
    stale_after: Duration,
    store: Arc<DeviceStore>,
    nodes: BTreeMap<u8, Node>,
    parameters: BTreeMap<(u16, u8), Parameter>,
    events: broadcast::Sender<TrackerEvent>,
}

impl NodeTracker {
    pub fn new(own_node: u8, stale_after: Duration, store: Arc<DeviceStore>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            own_node,
            stale_after,
            store,
            nodes: BTreeMap::new(),
            parameters: BTreeMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    pub fn node(&self, id: u8) -> Option<Node> {
        self.nodes.get(&id).cloned()
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        self.parameters.values().cloned().collect()
    }

    pub fn parameter(&self, id: u16, index: u8) -> Option<Parameter> {
        self.parameters.get(&(id, index)).cloned()
    }

    /// Apply one message
    ///
    /// Returns the identification request to transmit when the message
    /// introduced a node that has not identified itself.
    pub fn process(&mut self, msg: &Message, now: Instant) -> Result<Option<Message>, TrackerError> {
        match msg {
            Message::IdentifyResponse {
                sender, identity, ..
            } => {
                let store = self.store.clone();
                let (created, node) = self.entry(*sender, now)?;
                node.set_device_type(identity.device_type, &store);
                node.set_firmware_version(identity.firmware_version, &store);
                node.set_model(identity.model, &store);
                let snapshot = node.clone();
                self.emit_node(created, snapshot);
                Ok(None)
            }
            Message::NodeDescription {
                sender,
                packet,
                chars,
                ..
            } => {
                let (created, node) = self.entry(*sender, now)?;
                let result = node.set_description(*packet, chars);
                if created {
                    let snapshot = node.clone();
                    self.emit(TrackerEvent::NodeAdded(snapshot));
                }
                result.map(|_| None)
            }
            Message::NodeStatus {
                sender,
                status_type,
                value,
            } => {
                let (created, node) = self.entry(*sender, now)?;
                if *status_type == STATUS_CODE {
                    node.status = le_uint(value);
                }
                let snapshot = node.clone();
                self.emit_node(created, snapshot);
                Ok(self.identify_if(created, *sender))
            }
            Message::NodeAlarm { node, .. } => self.ensure_node(*node, now),
            Message::Parameter(frame) => self.process_parameter(frame, now),
            other => {
                // Other node-specific traffic only refreshes a known node
                if let Some(sender) = other.sender() {
                    if let Some(node) = self.nodes.get_mut(&sender) {
                        node.touch(now);
                    }
                }
                Ok(None)
            }
        }
    }

    fn process_parameter(
        &mut self,
        frame: &ParameterFrame,
        now: Instant,
    ) -> Result<Option<Message>, TrackerError> {
        let key = (frame.id, frame.index);
        let applied = match self.parameters.get_mut(&key) {
            Some(param) => param.update(frame, now),
            None => {
                let mut param = Parameter::new(frame.id, frame.index, frame.node, now);
                match param.update(frame, now) {
                    Ok(_) => {
                        self.parameters.insert(key, param.clone());
                        self.emit(TrackerEvent::ParameterAdded(param));
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            }
        };
        let changed = match applied {
            Ok(changed) => changed,
            Err(e) => {
                // Undecodable values are dropped; the sender is still alive
                if let Some(node) = self.nodes.get_mut(&frame.node) {
                    node.touch(now);
                }
                return Err(e);
            }
        };
        if changed {
            if let Some(param) = self.parameters.get(&key) {
                self.emit(TrackerEvent::ParameterUpdated(param.clone()));
            }
        }
        self.ensure_node(frame.node, now)
    }

    /// Create (announcing it) or refresh a node
    fn ensure_node(&mut self, id: u8, now: Instant) -> Result<Option<Message>, TrackerError> {
        let (created, node) = self.entry(id, now)?;
        if created {
            let snapshot = node.clone();
            self.emit(TrackerEvent::NodeAdded(snapshot));
        }
        Ok(self.identify_if(created, id))
    }

    fn identify_if(&self, created: bool, id: u8) -> Option<Message> {
        if !created {
            return None;
        }
        debug!(node = id, "Requesting identification");
        Some(Message::IdentifyRequest {
            sender: self.own_node,
            dest: id,
        })
    }

    /// Node for `id`, created if unknown, with its last-seen refreshed
    fn entry(&mut self, id: u8, now: Instant) -> Result<(bool, &mut Node), TrackerError> {
        if id == 0 {
            return Err(TrackerError::InvalidNode(id));
        }
        let mut created = false;
        let node = self.nodes.entry(id).or_insert_with(|| {
            debug!(node = id, "Node added");
            created = true;
            Node::new(id, now)
        });
        node.touch(now);
        Ok((created, node))
    }

    fn emit_node(&self, created: bool, node: Node) {
        if created {
            self.emit(TrackerEvent::NodeAdded(node));
        } else {
            self.emit(TrackerEvent::NodeUpdated(node));
        }
    }

    /// Evict everything unseen for longer than the staleness threshold
    ///
    /// Returns the number of nodes and parameters removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let stale_after = self.stale_after;
        let is_stale = |last: Instant| now.saturating_duration_since(last) > stale_after;

        let stale_nodes: Vec<u8> = self
            .nodes
            .iter()
            .filter(|(_, n)| is_stale(n.last_seen))
            .map(|(id, _)| *id)
            .collect();
        let stale_params: Vec<(u16, u8)> = self
            .parameters
            .iter()
            .filter(|(_, p)| is_stale(p.last_seen))
            .map(|(k, _)| *k)
            .collect();

        let removed = stale_nodes.len() + stale_params.len();
        for id in stale_nodes {
            if let Some(node) = self.nodes.remove(&id) {
                debug!(node = id, "Node removed");
                self.emit(TrackerEvent::NodeRemoved(node));
            }
        }
        for key in stale_params {
            if let Some(param) = self.parameters.remove(&key) {
                self.emit(TrackerEvent::ParameterRemoved(param));
            }
        }
        removed
    }

    fn emit(&self, event: TrackerEvent) {
        let _ = self.events.send(event);
    }
}

fn le_uint(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .enumerate()
        .fold(0u32, |acc, (i, b)| acc | (*b as u32) << (8 * i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Function, NodeIdentity};
    use pretty_assertions::assert_eq;

    fn tracker() -> (NodeTracker, broadcast::Receiver<TrackerEvent>) {
        let store = DeviceStore::from_json(
            r#"{"name": "EFIS", "type": 16, "model": 6699, "version": 2}"#,
        )
        .unwrap();
        let t = NodeTracker::new(0xFF, Duration::from_secs(5), Arc::new(store));
        let rx = t.subscribe();
        (t, rx)
    }

    fn drain(rx: &mut broadcast::Receiver<TrackerEvent>) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        while let Ok(e) = rx.try_recv() {
            kinds.push(e.kind());
        }
        kinds
    }

    fn status(sender: u8, value: u8) -> Message {
        Message::NodeStatus {
            sender,
            status_type: 0,
            value: vec![value, 0],
        }
    }

    fn param(node: u8, data: &[u8]) -> Message {
        Message::Parameter(ParameterFrame {
            id: 0x183,
            node,
            index: 0,
            function: Function(0),
            data: data.to_vec(),
        })
    }

    #[test]
    fn test_node_status_adds_once_then_updates() {
        let (mut t, mut rx) = tracker();
        let now = Instant::now();
        let req = t.process(&status(5, 0), now).unwrap();
        assert_eq!(req, Some(Message::IdentifyRequest { sender: 0xFF, dest: 5 }));
        assert_eq!(t.process(&status(5, 0), now).unwrap(), None);
        assert_eq!(t.process(&status(5, 2), now).unwrap(), None);
        assert_eq!(drain(&mut rx), vec!["node added", "node updated", "node updated"]);
        assert_eq!(t.node(5).unwrap().status_text(), "Error 2");
    }

    #[test]
    fn test_identification_resolves_without_request() {
        let (mut t, mut rx) = tracker();
        let msg = Message::IdentifyResponse {
            sender: 5,
            dest: 0xFF,
            identity: NodeIdentity {
                device_type: 16,
                firmware_version: 2,
                model: 6699,
            },
        };
        assert_eq!(t.process(&msg, Instant::now()).unwrap(), None);
        assert_eq!(t.node(5).unwrap().name(), "EFIS");
        // Second response refreshes
        t.process(&msg, Instant::now()).unwrap();
        assert_eq!(drain(&mut rx), vec!["node added", "node updated"]);
    }

    #[test]
    fn test_parameter_change_detection() {
        let (mut t, mut rx) = tracker();
        let now = Instant::now();
        assert!(t.process(&param(5, &[0xE8, 0x03]), now).unwrap().is_some());
        assert!(t.process(&param(5, &[0xE8, 0x03]), now).unwrap().is_none());
        t.process(&param(5, &[0xE9, 0x03]), now).unwrap();
        assert_eq!(
            drain(&mut rx),
            vec!["parameter added", "node added", "parameter updated"]
        );
    }

    #[test]
    fn test_undecodable_parameter_is_dropped() {
        let (mut t, mut rx) = tracker();
        let start = Instant::now();
        t.process(&param(5, &[0xE8, 0x03]), start).unwrap();
        drain(&mut rx);

        // Too short for a UINT: value kept, node still refreshed
        let later = start + Duration::from_secs(3);
        assert!(matches!(
            t.process(&param(5, &[0x01]), later),
            Err(TrackerError::Decode(_))
        ));
        assert_eq!(t.node(5).unwrap().last_seen, later);
        let airspeed = t.parameter(0x183, 0).unwrap();
        assert_eq!(airspeed.last_seen, start);
        assert_eq!(airspeed.value_text, "100.0 knots");

        // First frame from an unseen node creates nothing
        assert!(t.process(&param(9, &[0x01]), later).is_err());
        assert!(t.node(9).is_none());
        assert_eq!(t.parameters().len(), 1);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_sweep_removes_stale_once() {
        let (mut t, mut rx) = tracker();
        let start = Instant::now();
        t.process(&param(5, &[0xE8, 0x03]), start).unwrap();
        t.process(&status(6, 0), start + Duration::from_secs(4)).unwrap();
        drain(&mut rx);

        assert_eq!(t.sweep(start + Duration::from_secs(5)), 0);
        assert_eq!(t.sweep(start + Duration::from_secs(6)), 2);
        assert_eq!(drain(&mut rx), vec!["node removed", "parameter removed"]);
        assert_eq!(t.sweep(start + Duration::from_secs(6)), 0);
        assert_eq!(t.nodes().len(), 1);
        assert!(t.parameters().is_empty());
    }

    #[test]
    fn test_description_out_of_range_is_error() {
        let (mut t, _rx) = tracker();
        let msg = Message::NodeDescription {
            sender: 5,
            dest: 0,
            packet: 200,
            chars: b"ABCD".to_vec(),
        };
        assert!(matches!(
            t.process(&msg, Instant::now()),
            Err(TrackerError::DescriptionOutOfRange { .. })
        ));
        // Node was still created, without an identification request
        assert!(t.node(5).is_some());
    }

    #[test]
    fn test_node_zero_rejected() {
        let (mut t, _rx) = tracker();
        assert!(matches!(
            t.process(&status(0, 0), Instant::now()),
            Err(TrackerError::InvalidNode(0))
        ));
    }

    #[test]
    fn test_other_traffic_refreshes_known_node() {
        let (mut t, _rx) = tracker();
        let start = Instant::now();
        t.process(&status(5, 0), start).unwrap();
        let later = start + Duration::from_secs(4);
        let other = Message::NodeSpecific {
            sender: 5,
            code: 0x0C,
            data: vec![],
        };
        t.process(&other, later).unwrap();
        assert_eq!(t.node(5).unwrap().last_seen, later);
        // Unknown senders are not created
        t.process(
            &Message::NodeSpecific {
                sender: 9,
                code: 0x0C,
                data: vec![],
            },
            later,
        )
        .unwrap();
        assert!(t.node(9).is_none());
    }
}
