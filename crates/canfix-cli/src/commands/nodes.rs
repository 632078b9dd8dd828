//! Nodes command - discover nodes and parameters

use anyhow::Result;
use canfix_net::{Node, Parameter, TrackerConfig, TrackerService};
use std::time::Duration;

use super::Session;
use crate::output::{NodeRow, OutputContext, ParameterRow};

/// Track the network for `seconds`, then list what was seen
pub async fn nodes(session: &Session, seconds: u64, ctx: &OutputContext) -> Result<()> {
    let config = TrackerConfig {
        node_id: session.node,
        ..TrackerConfig::default()
    };
    let service = TrackerService::spawn(&session.bus, session.store.clone(), &config);

    ctx.info(&format!("Listening for {}s...", seconds));
    tokio::time::sleep(Duration::from_secs(seconds)).await;

    let mut nodes = service.nodes();
    let mut params = service.parameters();
    service.stop(Duration::from_secs(1)).await;

    nodes.sort_by_key(|n| n.node_id);
    params.sort_by_key(|p| (p.node, p.id, p.index));

    let node_rows: Vec<NodeRow> = nodes.iter().map(node_row).collect();
    ctx.print(&node_rows);

    if !params.is_empty() {
        ctx.info("");
        let param_rows: Vec<ParameterRow> = params.iter().map(parameter_row).collect();
        ctx.print(&param_rows);
    }
    Ok(())
}

fn node_row(node: &Node) -> NodeRow {
    let unknown = || "-".to_string();
    NodeRow {
        node: node.node_id,
        name: node.name().to_string(),
        device_type: node
            .device_type
            .map(|t| format!("0x{:02X}", t))
            .unwrap_or_else(unknown),
        model: node.model_hex().unwrap_or_else(unknown),
        version: node
            .firmware_version
            .map(|v| v.to_string())
            .unwrap_or_else(unknown),
        status: node.status_text(),
    }
}

fn parameter_row(param: &Parameter) -> ParameterRow {
    let name = if param.index > 0 {
        format!("{} [{}]", param.name, param.index)
    } else {
        param.name.clone()
    };
    ParameterRow {
        id: format!("0x{:03X}", param.id),
        node: param.node,
        name,
        value: param.value_text.clone(),
        quality: param.quality_text(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    #[test]
    fn test_unidentified_node_row() {
        let node = Node::new(0x42, Instant::now());
        let row = node_row(&node);
        assert_eq!(row.node, 0x42);
        assert_eq!(row.name, "Unknown Device");
        assert_eq!(row.device_type, "-");
        assert_eq!(row.status, "OK");
    }
}
