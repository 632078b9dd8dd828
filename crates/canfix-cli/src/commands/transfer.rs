//! Save and load commands - whole node configurations

use anyhow::Result;
use canfix_net::{ConfigTransfer, TransferNotice};
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Session;
use crate::output::{ConfigRow, OutputContext};

/// Read every configuration key of `node` into `file`
pub async fn save(session: &Session, node: u8, file: &Path, ctx: &OutputContext) -> Result<()> {
    let (tx, printer) = notice_printer(ctx.quiet);
    let transfer = ConfigTransfer::new(session.exchange(), session.store.clone()).with_notices(tx);

    let result = transfer.save_configuration(node, file).await;
    drop(transfer);
    let _ = printer.await;
    let cfg = result?;

    let rows: Vec<ConfigRow> = cfg
        .items
        .iter()
        .map(|(key, item)| ConfigRow {
            key: *key,
            name: item.name.clone(),
            value: item.value.format(item.multiplier),
            raw: item
                .datatype
                .encode(&item.value, item.multiplier)
                .map(hex::encode_upper)
                .unwrap_or_default(),
        })
        .collect();
    ctx.print(&rows);
    ctx.success(&format!(
        "Saved {} keys to {}",
        cfg.items.len(),
        file.display()
    ));
    Ok(())
}

/// Write a saved configuration file back to `node`
pub async fn load(session: &Session, node: u8, file: &Path, ctx: &OutputContext) -> Result<()> {
    let (tx, printer) = notice_printer(ctx.quiet);
    let transfer = ConfigTransfer::new(session.exchange(), session.store.clone()).with_notices(tx);

    let result = transfer.load_configuration(node, file).await;
    drop(transfer);
    let _ = printer.await;
    let summary = result?;

    if summary.failed.is_empty() {
        ctx.success(&format!("Wrote {} keys", summary.written));
    } else {
        let failed: Vec<String> = summary.failed.iter().map(|k| k.to_string()).collect();
        ctx.warn(&format!(
            "Wrote {} keys, failed: {}",
            summary.written,
            failed.join(", ")
        ));
    }
    Ok(())
}

/// Print status notices as they arrive; progress is only logged
fn notice_printer(quiet: bool) -> (mpsc::UnboundedSender<TransferNotice>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        while let Some(notice) = rx.recv().await {
            match notice {
                TransferNotice::Status(text) if !quiet => eprintln!("{}", text),
                TransferNotice::Progress(p) => tracing::debug!(progress = p, "Transfer progress"),
                _ => {}
            }
        }
    });
    (tx, handle)
}
