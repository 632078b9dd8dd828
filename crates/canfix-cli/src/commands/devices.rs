//! Devices command - list loaded device definitions

use anyhow::Result;

use super::Session;
use crate::output::{DeviceRow, OutputContext};

pub fn devices(session: &Session, ctx: &OutputContext) -> Result<()> {
    let mut rows: Vec<DeviceRow> = session
        .store
        .list()
        .iter()
        .map(|d| DeviceRow {
            device_type: format!("0x{:02X}", d.device_type),
            model: format!("{:X}", d.model),
            version: d.version,
            name: d.name.clone(),
            firmware: match (&d.firmware_driver, d.firmware_code) {
                (Some(driver), Some(code)) => format!("{} 0x{:04X}", driver, code),
                (None, Some(code)) => format!("0x{:04X}", code),
                _ => "-".to_string(),
            },
            keys: d.configuration.len(),
        })
        .collect();
    rows.sort_by(|a, b| (&a.device_type, &a.model, a.version).cmp(&(&b.device_type, &b.model, b.version)));

    ctx.print(&rows);
    Ok(())
}
