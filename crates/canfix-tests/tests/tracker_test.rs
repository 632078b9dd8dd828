//! Node and parameter discovery over a mock bus
//!
//! Run with: cargo test -p canfix-tests --test tracker_test

use std::sync::Arc;
use std::time::{Duration, Instant};

use canfix_net::protocol::{Function, ParameterFrame};
use canfix_net::testing::SimulatedNodeConfig;
use canfix_net::{Message, NodeTracker, TrackerConfig, TrackerEvent, TrackerService};
use canfix_tests::{device_store, Harness, OWN_NODE};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

fn drain(rx: &mut broadcast::Receiver<TrackerEvent>) -> Vec<TrackerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn status(sender: u8) -> Message {
    Message::NodeStatus {
        sender,
        status_type: 0,
        value: vec![0, 0],
    }
}

fn airspeed(node: u8, raw: u16) -> Message {
    Message::Parameter(ParameterFrame {
        id: 0x183,
        node,
        index: 0,
        function: Function(0),
        data: raw.to_le_bytes().to_vec(),
    })
}

// =============================================================================
// Live tracking
// =============================================================================

#[tokio::test]
#[serial_test::serial]
async fn test_heartbeat_node_is_added_once_and_identified() {
    let mock = Arc::new(canfix_net::MockBusAdapter::default());
    let bus = canfix_net::CanBus::with_adapter(mock.clone(), 256);
    let service = TrackerService::spawn(
        &bus,
        Arc::new(device_store()),
        &TrackerConfig {
            node_id: OWN_NODE,
            poll_interval_ms: 20,
            ..TrackerConfig::default()
        },
    );
    let mut events = service.subscribe();

    let _node = canfix_net::testing::SimulatedNode::start(
        mock.clone(),
        SimulatedNodeConfig {
            heartbeat: Some(Duration::from_millis(25)),
            parameters: vec![(0x183, vec![0xE8, 0x03])],
            ..SimulatedNodeConfig::default()
        },
    );

    // Several heartbeats plus the identification round trip
    let mut identified = None;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        if let Some(node) = service.node(0x20).filter(|n| n.device.is_some()) {
            identified = Some(node);
            break;
        }
    }
    let node = identified.expect("node identified");
    assert_eq!(node.name(), "Test Engine Monitor");
    assert_eq!(node.model_hex().as_deref(), Some("1"));

    let events = drain(&mut events);
    let added = events
        .iter()
        .filter(|e| matches!(e, TrackerEvent::NodeAdded(n) if n.node_id == 0x20))
        .count();
    assert_eq!(added, 1);
    assert!(events
        .iter()
        .any(|e| matches!(e, TrackerEvent::NodeUpdated(n) if n.node_id == 0x20)));

    let param = service.parameter(0x183, 0).expect("airspeed tracked");
    assert_eq!(param.name, "Indicated Airspeed");
    assert_eq!(param.value_text, "100.0 knots");

    assert!(service.stop(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_tracker_releases_connection_on_stop() {
    let harness = Harness::start(SimulatedNodeConfig::default());
    let service = TrackerService::spawn(&harness.bus, harness.store.clone(), &TrackerConfig::default());
    assert_eq!(harness.bus.stats().open_connections, 1);

    assert!(service.stop(Duration::from_secs(1)).await);
    let stats = harness.bus.stats();
    assert_eq!(stats.open_connections, 0);
    assert_eq!(stats.released_connections, 1);
}

// =============================================================================
// Engine rules
// =============================================================================

#[test]
fn test_sweep_emits_one_removal_per_entry() {
    let mut tracker = NodeTracker::new(OWN_NODE, Duration::from_secs(5), Arc::new(device_store()));
    let mut rx = tracker.subscribe();
    let start = Instant::now();

    tracker.process(&status(0x20), start).unwrap();
    tracker.process(&airspeed(0x20, 1000), start).unwrap();
    tracker.process(&status(0x21), start).unwrap();
    drain(&mut rx);

    // Only node 0x21 stays fresh
    let later = start + Duration::from_secs(4);
    tracker.process(&status(0x21), later).unwrap();
    drain(&mut rx);

    let removed = tracker.sweep(start + Duration::from_secs(6));
    assert_eq!(removed, 2);

    let events = drain(&mut rx);
    let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec!["node removed", "parameter removed"]);
    assert!(tracker.node(0x21).is_some());

    // A second sweep finds nothing left to remove
    assert_eq!(tracker.sweep(start + Duration::from_secs(6)), 0);
    assert!(drain(&mut rx).is_empty());
}

#[test]
fn test_unchanged_parameter_emits_no_update() {
    let mut tracker = NodeTracker::new(OWN_NODE, Duration::from_secs(5), Arc::new(device_store()));
    let mut rx = tracker.subscribe();
    let now = Instant::now();

    tracker.process(&airspeed(0x20, 1000), now).unwrap();
    let first: Vec<&str> = drain(&mut rx).iter().map(|e| e.kind()).collect();
    assert_eq!(first, vec!["parameter added", "node added"]);

    tracker.process(&airspeed(0x20, 1000), now).unwrap();
    assert!(drain(&mut rx).is_empty());

    tracker.process(&airspeed(0x20, 1010), now).unwrap();
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    match &events[0] {
        TrackerEvent::ParameterUpdated(p) => assert_eq!(p.value_text, "101.0 knots"),
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_new_node_requests_identification() {
    let mut tracker = NodeTracker::new(OWN_NODE, Duration::from_secs(5), Arc::new(device_store()));
    let now = Instant::now();

    let request = tracker.process(&status(0x20), now).unwrap();
    assert_eq!(
        request,
        Some(Message::IdentifyRequest {
            sender: OWN_NODE,
            dest: 0x20,
        })
    );
    assert_eq!(tracker.process(&status(0x20), now).unwrap(), None);
}

#[test]
fn test_node_zero_is_rejected() {
    let mut tracker = NodeTracker::new(OWN_NODE, Duration::from_secs(5), Arc::new(device_store()));
    assert!(tracker.process(&status(0), Instant::now()).is_err());
    assert!(tracker.nodes().is_empty());
}
