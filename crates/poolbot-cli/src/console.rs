//! Stdin/stdout adapter used by `poolbot start`.
//!
//! Every non-empty line becomes a direct message on the `console` thread; the
//! reply chunks for that line are printed before the next line is read.

use anyhow::Result;
use poolbot_ipc::{EventBus, InboundMessage, OutboundMessage};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const CONSOLE_CHANNEL: &str = "console";
pub const CONSOLE_THREAD: &str = "console";
const CONSOLE_SENDER: &str = "operator";

pub async fn run(event_bus: EventBus, reply_timeout: Duration) -> Result<()> {
    let mut outbound = event_bus.outbound_subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        let message = InboundMessage::new(CONSOLE_CHANNEL, CONSOLE_THREAD, CONSOLE_SENDER, text)
            .with_sender_name(CONSOLE_SENDER);
        let trace_id = message.trace_id.clone();
        event_bus.publish(message)?;

        match tokio::time::timeout(reply_timeout, collect_reply(&mut outbound, &trace_id)).await {
            Ok(chunks) => {
                for chunk in chunks {
                    stdout.write_all(chunk.as_bytes()).await?;
                    stdout.write_all(b"\n").await?;
                }
                stdout.flush().await?;
            }
            Err(_) => debug!(trace_id = %trace_id, "No reply within {:?}", reply_timeout),
        }
    }

    Ok(())
}

/// Gathers the chunks carrying `trace_id` until the last one has arrived, an
/// empty-reply marker is seen, or the outbound channel closes.
async fn collect_reply(
    outbound: &mut broadcast::Receiver<OutboundMessage>,
    trace_id: &str,
) -> Vec<String> {
    let mut chunks = Vec::new();
    loop {
        match outbound.recv().await {
            Ok(out) if out.trace_id == trace_id => {
                if out.is_completion_marker() {
                    return chunks;
                }
                let last = out.is_last();
                chunks.push(out.text);
                if last {
                    return chunks;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Console missed {} outbound chunk(s)", n);
            }
            Err(broadcast::error::RecvError::Closed) => return chunks,
        }
    }
}
