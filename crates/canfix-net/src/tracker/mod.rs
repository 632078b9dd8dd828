//! Node and parameter tracking
//!
//! [`NodeTracker`] holds the table of nodes and parameters seen on the bus;
//! [`TrackerService`] runs it in the background on its own bus connection.

mod engine;
mod node;
mod parameter;
mod service;

pub use engine::NodeTracker;
pub use node::{Node, DESCRIPTION_LEN};
pub use parameter::Parameter;
pub use service::TrackerService;

use canfix_defs::DefsError;
use thiserror::Error;

/// Per-message processing failure
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("node {node} description packet {packet} is past the end of the description")]
    DescriptionOutOfRange { node: u8, packet: u16 },

    #[error("node id {0} is reserved")]
    InvalidNode(u8),

    #[error("parameter value: {0}")]
    Decode(#[from] DefsError),
}

/// Change notification with a snapshot of the affected entry
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    NodeAdded(Node),
    NodeUpdated(Node),
    NodeRemoved(Node),
    ParameterAdded(Parameter),
    ParameterUpdated(Parameter),
    ParameterRemoved(Parameter),
}

impl TrackerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerEvent::NodeAdded(_) => "node added",
            TrackerEvent::NodeUpdated(_) => "node updated",
            TrackerEvent::NodeRemoved(_) => "node removed",
            TrackerEvent::ParameterAdded(_) => "parameter added",
            TrackerEvent::ParameterUpdated(_) => "parameter updated",
            TrackerEvent::ParameterRemoved(_) => "parameter removed",
        }
    }
}
