//! Query and set commands - single configuration keys

use anyhow::{anyhow, bail, Result};
use canfix_defs::{ConfigRecord, DataType, Value};

use super::Session;
use crate::output::{ConfigRow, OutputContext};

/// Read one configuration key
///
/// Keys known from the node's device definition are decoded; anything
/// else is shown as raw bytes.
pub async fn query(session: &Session, node: u8, key: u16, ctx: &OutputContext) -> Result<()> {
    let id = session.identify(node).await?;
    let exchange = session.exchange();

    let Some(device) = session.device_for(&id).filter(|d| d.config_item(key).is_some()) else {
        let resp = exchange
            .query_node_configuration(node, key)
            .await?
            .ok_or_else(|| anyhow!("No response from node {}", node))?;
        if !resp.is_ok() {
            bail!("Query of key {} failed: {}", key, resp.status_text());
        }
        ctx.print(&[ConfigRow {
            key,
            name: String::new(),
            value: String::new(),
            raw: hex::encode_upper(&resp.value),
        }]);
        return Ok(());
    };

    let set = session.config_set(node, &device, key).await?;
    let record = set
        .get(key)
        .ok_or_else(|| anyhow!("{} has no configuration key {}", device.name, key))?;
    let datatype = record_datatype(record)?;

    let resp = exchange
        .query_node_configuration(node, key)
        .await?
        .ok_or_else(|| anyhow!("No response from node {}", node))?;
    if !resp.is_ok() {
        bail!("Query of key {} failed: {}", key, resp.status_text());
    }
    let value = datatype.decode(&resp.value, record.multiplier())?;

    ctx.print(&[ConfigRow {
        key,
        name: record.name().to_string(),
        value: display_value(record, &value),
        raw: hex::encode_upper(&resp.value),
    }]);
    Ok(())
}

/// Validate and write one configuration key
pub async fn set(
    session: &Session,
    node: u8,
    key: u16,
    text: &str,
    ctx: &OutputContext,
) -> Result<()> {
    let id = session.identify(node).await?;
    let device = session
        .device_for(&id)
        .ok_or_else(|| anyhow!("No device definition for node {} ({:?})", node, id))?;

    let mut set = session.config_set(node, &device, key).await?;
    let value = set.parse_and_set(key, text)?;
    let record = set
        .get(key)
        .ok_or_else(|| anyhow!("{} has no configuration key {}", device.name, key))?;
    let datatype = record_datatype(record)?;

    let resp = session
        .exchange()
        .set_node_configuration(node, key, datatype, record.multiplier(), &value)
        .await?
        .ok_or_else(|| anyhow!("No response from node {}", node))?;
    if !resp.is_ok() {
        bail!("Set of key {} failed: {}", key, resp.status_text());
    }

    ctx.success(&format!(
        "{} set to {}",
        record.name(),
        display_value(record, &value)
    ));
    Ok(())
}

fn record_datatype(record: &ConfigRecord) -> Result<DataType> {
    record.datatype().ok_or_else(|| {
        anyhow!(
            "Key {} has no definition for the current parent value",
            record.key()
        )
    })
}

/// Selection label when the value is one of the record's choices
fn display_value(record: &ConfigRecord, value: &Value) -> String {
    let label = record.control().and_then(|c| {
        let v = value.as_f64()?;
        c.selections
            .iter()
            .find(|(_, s)| **s as f64 == v)
            .map(|(label, _)| label.clone())
    });
    label.unwrap_or_else(|| value.format_with_units(record.multiplier(), record.units()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use canfix_defs::{ConfigControl, ConfigItem, InputKind};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[test]
    fn test_display_value_uses_selection_label() {
        let record = ConfigRecord::new(ConfigItem::plain(
            17,
            ConfigControl {
                name: "Units".into(),
                datatype: DataType::Ushort,
                input: InputKind::List,
                selections: BTreeMap::from([("Imperial".into(), 0), ("Metric".into(), 1)]),
                ..ConfigControl::default()
            },
        ));
        assert_eq!(display_value(&record, &Value::Int(1)), "Metric");
    }

    #[test]
    fn test_display_value_with_units() {
        let record = ConfigRecord::new(ConfigItem::plain(
            16,
            ConfigControl {
                name: "Fuel Tank Size".into(),
                multiplier: 0.1,
                units: "gal".into(),
                ..ConfigControl::default()
            },
        ));
        assert_eq!(display_value(&record, &Value::Float(40.0)), "40.0 gal");
    }
}
