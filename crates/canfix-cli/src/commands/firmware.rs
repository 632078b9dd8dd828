//! Firmware command - load a firmware package into a node

use anyhow::{anyhow, bail, Result};
use canfix_net::{
    FirmwareConfig, FirmwareDriver, FirmwarePackage, FirmwareUpdater, TransferEvent,
    TransferOutcome,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

use super::Session;
use crate::output::OutputContext;

/// Arguments of the firmware command
#[derive(Debug, Clone)]
pub struct FirmwareArgs {
    pub node: u8,
    pub file: PathBuf,
    /// Overrides the device definition's update code
    pub code: Option<u16>,
    /// Overrides the device definition's driver
    pub driver: Option<String>,
    pub channel: u8,
    /// (device type, model, version) when the node cannot identify itself
    pub device: Option<(u8, u32, u8)>,
}

pub async fn firmware(session: &Session, args: FirmwareArgs, ctx: &OutputContext) -> Result<()> {
    let package = FirmwarePackage::from_path(&args.file)?;
    package.validate()?;
    let (driver, code) = resolve_driver(session, &args).await?;
    driver.validate(&package)?;

    ctx.info(&format!(
        "Loading {} ({} bytes, {} blocks) into node {} using {}",
        args.file.display(),
        package.total_size(),
        package.block_count(),
        args.node,
        driver
    ));

    let updater = FirmwareUpdater::new(
        session.exchange(),
        FirmwareConfig {
            channel: args.channel,
            ..FirmwareConfig::default()
        },
    );
    let cancel = updater.cancel_handle();
    ctrlc::set_handler(move || cancel.cancel())?;

    let pb = if ctx.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(100)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );

    let (handle, mut events) = updater.spawn(args.node, code, driver, package);
    let mut outcome = None;
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Status(text) => pb.set_message(text),
            TransferEvent::Progress(p) => pb.set_position((p * 100.0).round() as u64),
            TransferEvent::State(state) => tracing::debug!(%state, "Transfer state"),
            TransferEvent::Finished(o) => outcome = Some(o),
        }
    }
    let result = handle.await?;

    match outcome {
        Some(TransferOutcome::Complete(_)) => {
            pb.finish();
            ctx.success("Firmware update completed successfully");
        }
        Some(TransferOutcome::Cancelled) => {
            pb.abandon();
            ctx.warn("Firmware update cancelled");
        }
        Some(TransferOutcome::Failed(text)) => {
            pb.abandon();
            bail!("{}", text);
        }
        None => {
            pb.abandon();
        }
    }
    result.map(|_| ()).map_err(Into::into)
}

/// Driver and update code from the arguments, falling back to the
/// node's device definition
async fn resolve_driver(session: &Session, args: &FirmwareArgs) -> Result<(FirmwareDriver, u16)> {
    let override_driver = args
        .driver
        .as_deref()
        .map(str::parse::<FirmwareDriver>)
        .transpose()?;
    if let (Some(code), Some(driver)) = (args.code, override_driver) {
        return Ok((driver, code));
    }

    let (device_type, model, version) = match args.device {
        Some(d) => d,
        None => {
            let id = session.identify(args.node).await?;
            (id.device_type, id.model, id.firmware_version)
        }
    };
    let Some(device) = session.store.find(device_type, model, version) else {
        return match args.code {
            Some(code) => Ok((override_driver.unwrap_or(FirmwareDriver::Streamed), code)),
            None => Err(anyhow!(
                "No device definition for type 0x{:02X} model 0x{:06X} version {}, use --code",
                device_type,
                model,
                version
            )),
        };
    };

    let (driver, code) = match FirmwareDriver::for_device(&device) {
        Ok(found) => found,
        Err(e) => match args.code {
            Some(code) => (FirmwareDriver::Streamed, code),
            None => return Err(e.into()),
        },
    };
    Ok((
        override_driver.unwrap_or(driver),
        args.code.unwrap_or(code),
    ))
}
