//! Info command - node identification

use anyhow::Result;

use super::Session;
use crate::output::OutputContext;

pub async fn info(session: &Session, node: u8, ctx: &OutputContext) -> Result<()> {
    let id = session.identify(node).await?;
    let device = session.device_for(&id);

    let mut pairs = vec![
        ("Node", node.to_string()),
        ("Device Type", format!("0x{:02X}", id.device_type)),
        ("Model", format!("0x{:06X}", id.model)),
        ("Firmware Version", id.firmware_version.to_string()),
        (
            "Name",
            device
                .as_ref()
                .map(|d| d.name.clone())
                .unwrap_or_else(|| "Unknown Device".to_string()),
        ),
    ];
    if let Some(device) = &device {
        pairs.push(("Parameters", device.parameters.len().to_string()));
        pairs.push(("Configuration Keys", device.configuration.len().to_string()));
        if let Some(driver) = &device.firmware_driver {
            pairs.push(("Firmware Driver", driver.clone()));
        }
    }

    ctx.print_kv(&pairs);
    Ok(())
}
