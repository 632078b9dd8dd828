//! cfutil - CAN-FIX network utility
//!
//! Watches the bus, lists nodes and parameters, reads and writes node
//! configuration and loads firmware.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::Session;
use crate::config::{ArgOverrides, Config};
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "cfutil")]
#[command(author, version, about = "CAN-FIX network utility")]
#[command(propagate_version = true)]
struct Cli {
    /// Bus interface type: socketcan or mock
    #[arg(short, long, env = "CFUTIL_INTERFACE")]
    interface: Option<String>,

    /// CAN channel, e.g. can0
    #[arg(long, env = "CFUTIL_CHANNEL")]
    channel: Option<String>,

    /// Bitrate in kbps
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// Our node id on the network
    #[arg(short, long, value_parser = parse_u8)]
    node: Option<u8>,

    /// Directory of device definition files
    #[arg(short, long, env = "CFUTIL_DEVICES")]
    device_dir: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, env = "CFUTIL_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum)]
    output: Option<OutputFormat>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print frames received from the bus
    Listen {
        /// Show raw frames instead of decoded messages
        #[arg(long)]
        raw: bool,

        /// Stop after this many frames
        #[arg(long)]
        frame_count: Option<usize>,
    },

    /// Discover nodes and parameters on the network
    Nodes {
        /// Seconds to listen before listing (default 3)
        #[arg(long)]
        node_timeout: Option<u64>,
    },

    /// List known device definitions
    Devices,

    /// Show a node's identification
    Info {
        /// Node id
        #[arg(value_parser = parse_u8)]
        node: u8,
    },

    /// Read a configuration key
    Query {
        #[arg(value_parser = parse_u8)]
        node: u8,

        #[arg(value_parser = parse_u16)]
        key: u16,
    },

    /// Write a configuration key
    Set {
        #[arg(value_parser = parse_u8)]
        node: u8,

        #[arg(value_parser = parse_u16)]
        key: u16,

        /// Value, or a selection label for list keys
        value: String,
    },

    /// Save a node's configuration to a file
    Save {
        #[arg(value_parser = parse_u8)]
        node: u8,

        file: PathBuf,
    },

    /// Restore a node's configuration from a file
    Load {
        #[arg(value_parser = parse_u8)]
        node: u8,

        file: PathBuf,
    },

    /// Load firmware into a node
    Firmware {
        #[arg(value_parser = parse_u8)]
        node: u8,

        /// Firmware package
        file: PathBuf,

        /// Firmware update code (default: from the device definition)
        #[arg(long, value_parser = parse_u16)]
        code: Option<u16>,

        /// Transfer driver: CANFIX or BASIC (default: from the device definition)
        #[arg(long)]
        driver: Option<String>,

        /// Two-way channel used for the transfer
        #[arg(long, default_value = "0", value_parser = parse_u8)]
        channel: u8,

        /// Device type, when the node cannot identify itself
        #[arg(long, value_parser = parse_u8, requires_all = ["model", "firmware_version"])]
        device_type: Option<u8>,

        #[arg(long, value_parser = parse_u32)]
        model: Option<u32>,

        #[arg(long, value_parser = parse_u8)]
        firmware_version: Option<u8>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Load config file
    let config = if let Some(config_path) = &cli.config {
        Config::load_from(config_path)?
    } else {
        Config::load().unwrap_or_default()
    };

    // Merge CLI args with config
    let merged = config.merge_with_args(&ArgOverrides {
        interface: cli.interface.clone(),
        channel: cli.channel.clone(),
        bitrate: cli.bitrate,
        node: cli.node,
        device_dir: cli.device_dir.clone(),
        node_timeout: match &cli.command {
            Commands::Nodes { node_timeout } => *node_timeout,
            _ => None,
        },
        no_color: cli.no_color,
    });
    let format = cli
        .output
        .or_else(|| {
            config
                .output
                .as_deref()
                .and_then(|s| OutputFormat::from_str(s, true).ok())
        })
        .unwrap_or_default();

    // Create output context
    let ctx = OutputContext::new(format, merged.no_color, cli.quiet);

    let session = Session::open(&merged).await?;

    // Execute command
    match &cli.command {
        Commands::Listen { raw, frame_count } => {
            commands::listen(&session, *raw, *frame_count, &ctx).await?;
        }

        Commands::Nodes { .. } => {
            commands::nodes(&session, merged.node_timeout, &ctx).await?;
        }

        Commands::Devices => {
            commands::devices(&session, &ctx)?;
        }

        Commands::Info { node } => {
            commands::info(&session, *node, &ctx).await?;
        }

        Commands::Query { node, key } => {
            commands::query(&session, *node, *key, &ctx).await?;
        }

        Commands::Set { node, key, value } => {
            commands::set(&session, *node, *key, value, &ctx).await?;
        }

        Commands::Save { node, file } => {
            commands::save(&session, *node, file, &ctx).await?;
        }

        Commands::Load { node, file } => {
            commands::load(&session, *node, file, &ctx).await?;
        }

        Commands::Firmware {
            node,
            file,
            code,
            driver,
            channel,
            device_type,
            model,
            firmware_version,
        } => {
            let device = match (device_type, model, firmware_version) {
                (Some(t), Some(m), Some(v)) => Some((*t, *m, *v)),
                _ => None,
            };
            commands::firmware(
                &session,
                commands::FirmwareArgs {
                    node: *node,
                    file: file.clone(),
                    code: *code,
                    driver: driver.clone(),
                    channel: *channel,
                    device,
                },
                &ctx,
            )
            .await?;
        }
    }

    Ok(())
}

/// Integer argument, decimal or 0x/0o/0b prefixed
fn parse_number<T: TryFrom<i64>>(s: &str) -> Result<T, String> {
    let n = canfix_defs::parse_int(s).map_err(|e| e.to_string())?;
    T::try_from(n).map_err(|_| format!("{} is out of range", s))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    parse_number(s)
}

fn parse_u16(s: &str) -> Result<u16, String> {
    parse_number(s)
}

fn parse_u32(s: &str) -> Result<u32, String> {
    parse_number(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_arguments() {
        assert_eq!(parse_u8("0x20"), Ok(0x20));
        assert_eq!(parse_u8("255"), Ok(255));
        assert!(parse_u8("256").is_err());
        assert_eq!(parse_u16("0x5A5A"), Ok(0x5A5A));
        assert!(parse_u32("-1").is_err());
    }

    #[test]
    fn test_cli_parses_firmware() {
        let cli = Cli::try_parse_from([
            "cfutil", "-i", "mock", "firmware", "0x20", "fw.tar", "--driver", "BASIC",
        ])
        .unwrap();
        assert_eq!(cli.interface.as_deref(), Some("mock"));
        assert!(matches!(
            cli.command,
            Commands::Firmware { node: 0x20, channel: 0, .. }
        ));
    }
}
