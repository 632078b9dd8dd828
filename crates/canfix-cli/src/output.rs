//! Output formatting for cfutil (table, json, csv)

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print data in the configured format
    pub fn print<T: Tabled + Serialize>(&self, data: &[T]) {
        match self.format {
            OutputFormat::Table => {
                if data.is_empty() {
                    if !self.quiet {
                        println!("No data");
                    }
                } else {
                    println!("{}", Table::new(data));
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(data).unwrap_or_else(|_| "[]".to_string())
                );
            }
            OutputFormat::Csv => print_csv(data),
        }
    }

    /// Print key-value pairs (for info command)
    pub fn print_kv(&self, pairs: &[(&str, String)]) {
        match self.format {
            OutputFormat::Table => {
                for (key, value) in pairs {
                    println!("{}: {}", key.bold(), value);
                }
            }
            OutputFormat::Json => {
                let map: serde_json::Map<String, serde_json::Value> = pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&map).unwrap_or_else(|_| "{}".to_string())
                );
            }
            OutputFormat::Csv => {
                let keys: Vec<&str> = pairs.iter().map(|(k, _)| *k).collect();
                println!("{}", keys.join(","));
                let values: Vec<String> = pairs.iter().map(|(_, v)| escape_csv(v)).collect();
                println!("{}", values.join(","));
            }
        }
    }
}

/// Print data as CSV
fn print_csv<T: Serialize>(data: &[T]) {
    let Some(first) = data.first() else {
        return;
    };

    // Field names from the first item
    if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(first) {
        let headers: Vec<&str> = map.keys().map(|s| s.as_str()).collect();
        println!("{}", headers.join(","));

        for item in data {
            if let Ok(serde_json::Value::Object(row)) = serde_json::to_value(item) {
                let values: Vec<String> = headers
                    .iter()
                    .map(|h| {
                        row.get(*h)
                            .map(|v| match v {
                                serde_json::Value::String(s) => escape_csv(s),
                                other => escape_csv(&other.to_string()),
                            })
                            .unwrap_or_default()
                    })
                    .collect();
                println!("{}", values.join(","));
            }
        }
    }
}

/// Escape a value for CSV output
fn escape_csv(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// =============================================================================
// Display types for various commands
// =============================================================================

/// Received frame for listen command
#[derive(Debug, Tabled, Serialize)]
pub struct FrameRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Data")]
    pub data: String,
    #[tabled(rename = "Message")]
    pub message: String,
}

/// Node display for nodes command
#[derive(Debug, Tabled, Serialize)]
pub struct NodeRow {
    #[tabled(rename = "Node")]
    pub node: u8,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Type")]
    pub device_type: String,
    #[tabled(rename = "Model")]
    pub model: String,
    #[tabled(rename = "Version")]
    pub version: String,
    #[tabled(rename = "Status")]
    pub status: String,
}

/// Parameter display for nodes command
#[derive(Debug, Tabled, Serialize)]
pub struct ParameterRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Node")]
    pub node: u8,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Value")]
    pub value: String,
    #[tabled(rename = "Quality")]
    pub quality: String,
}

/// Device definition display for devices command
#[derive(Debug, Tabled, Serialize)]
pub struct DeviceRow {
    #[tabled(rename = "Type")]
    pub device_type: String,
    #[tabled(rename = "Model")]
    pub model: String,
    #[tabled(rename = "Version")]
    pub version: u8,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Firmware")]
    pub firmware: String,
    #[tabled(rename = "Keys")]
    pub keys: usize,
}

/// Configuration value display for query and save commands
#[derive(Debug, Tabled, Serialize)]
pub struct ConfigRow {
    #[tabled(rename = "Key")]
    pub key: u16,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Value")]
    pub value: String,
    #[tabled(rename = "Raw")]
    pub raw: String,
}
