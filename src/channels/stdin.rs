//! Stdin transport: reads `conversation|sender|text` lines for local runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::channels::{IncomingMessage, MessageStream, Transport};
use crate::error::ChannelError;

/// Sender id used for alerts printed by this transport.
const STDIN_SELF_ID: &str = "stdin";

/// Reads messages from stdin and prints outbound alerts to stdout.
pub struct StdinTransport {
    seq: Arc<AtomicU64>,
}

impl StdinTransport {
    pub fn new() -> Self {
        Self {
            seq: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Default for StdinTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one `conversation|sender|text` line. The text may itself contain `|`.
pub fn parse_line(line: &str, seq: u64) -> Result<IncomingMessage, ChannelError> {
    let mut parts = line.splitn(3, '|');
    let (Some(conversation), Some(sender), Some(text)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ChannelError::InvalidMessage(format!(
            "expected 'conversation|sender|text', got '{line}'"
        )));
    };

    let (conversation, sender) = (conversation.trim(), sender.trim());
    if conversation.is_empty() || sender.is_empty() {
        return Err(ChannelError::InvalidMessage(
            "conversation and sender must not be empty".into(),
        ));
    }

    Ok(IncomingMessage::text(
        "stdin",
        format!("stdin:{seq}"),
        conversation,
        sender,
        text.trim(),
    ))
}

#[async_trait]
impl Transport for StdinTransport {
    fn name(&self) -> &str {
        "stdin"
    }

    fn self_id(&self) -> Option<String> {
        Some(STDIN_SELF_ID.to_string())
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let seq = Arc::clone(&self.seq);

        tokio::spawn(async move {
            let reader = BufReader::new(tokio::io::stdin());
            let mut lines = reader.lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() || line.starts_with('#') {
                            continue;
                        }
                        let n = seq.fetch_add(1, Ordering::Relaxed) + 1;
                        match parse_line(line, n) {
                            Ok(msg) => {
                                if tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!("Skipping stdin line: {e}"),
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send_message(&self, recipient: &str, body: &str) -> Result<(), ChannelError> {
        println!("\n[to {recipient}]\n{body}\n");
        Ok(())
    }
}
