//! Listen command - print bus traffic

use anyhow::Result;
use canfix_net::{BusError, CanFrame, Message};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::Session;
use crate::output::{FrameRow, OutputContext, OutputFormat};

const POLL: Duration = Duration::from_millis(100);

/// Print frames until Ctrl+C or `frame_count` frames have been seen
pub async fn listen(
    session: &Session,
    raw: bool,
    frame_count: Option<usize>,
    ctx: &OutputContext,
) -> Result<()> {
    ctx.info("Listening for frames, press Ctrl+C to stop");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    if ctx.format == OutputFormat::Csv {
        println!("id,data,message");
    }

    let mut conn = session.bus.connection();
    let mut seen = 0usize;
    while running.load(Ordering::SeqCst) {
        let frame = match conn.recv(POLL).await {
            Ok(frame) => frame,
            Err(BusError::Timeout) => continue,
            Err(e) => {
                ctx.error(&format!("Bus error: {}", e));
                break;
            }
        };
        print_frame(&frame_row(&frame, raw), ctx);

        seen += 1;
        if frame_count.is_some_and(|n| seen >= n) {
            break;
        }
    }
    conn.release();

    ctx.info(&format!("{} frames received", seen));
    Ok(())
}

fn frame_row(frame: &CanFrame, raw: bool) -> FrameRow {
    let message = if raw {
        String::new()
    } else {
        match Message::parse(frame) {
            Ok(msg) => msg.to_string(),
            Err(e) => format!("<{}>", e),
        }
    };
    FrameRow {
        id: format!("0x{:03X}", frame.id),
        data: hex::encode_upper(&frame.data),
        message,
    }
}

// Frames are printed as they arrive, so no table is collected
fn print_frame(row: &FrameRow, ctx: &OutputContext) {
    match ctx.format {
        OutputFormat::Table => {
            if row.message.is_empty() {
                println!("{}  {}", row.id, row.data);
            } else {
                println!("{}  {:<16}  {}", row.id, row.data, row.message);
            }
        }
        OutputFormat::Json => {
            if let Ok(line) = serde_json::to_string(row) {
                println!("{}", line);
            }
        }
        OutputFormat::Csv => println!("{},{},\"{}\"", row.id, row.data, row.message.replace('"', "\"\"")),
    }
}
