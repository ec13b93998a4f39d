//! Telegram transport: long-polls the Bot API for group messages and sends
//! alerts through `sendMessage`.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::channels::{IncomingMessage, MessageStream, Transport};
use crate::error::ChannelError;
use crate::pipeline::types::MessageKind;

/// `sendMessage` text limit, in characters.
const MAX_TEXT_CHARS: usize = 4096;

/// Delay before polling again after a failed `getUpdates`.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Long-poll timeout passed to `getUpdates`.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Telegram Bot API transport using long-polling.
pub struct TelegramTransport {
    bot_token: SecretString,
    client: reqwest::Client,
    bot_id: Arc<OnceLock<String>>,
}

impl TelegramTransport {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
            bot_id: Arc::new(OnceLock::new()),
        }
    }

    fn api_url(&self, method: &str) -> String {
        api_url(self.bot_token.expose_secret(), method)
    }

    /// Resolve the bot's own user id via `getMe`.
    async fn fetch_bot_id(&self) -> Result<String, ChannelError> {
        let startup_failed = |reason: String| ChannelError::StartupFailed {
            name: "telegram".into(),
            reason,
        };

        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| startup_failed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(startup_failed(format!("getMe returned {}", resp.status())));
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| startup_failed(format!("getMe parse error: {e}")))?;

        data.get("result")
            .and_then(|r| r.get("id"))
            .and_then(Value::as_i64)
            .map(|id| id.to_string())
            .ok_or_else(|| startup_failed("getMe response has no result.id".into()))
    }

    /// POST one `sendMessage`. Returns the HTTP status on a non-2xx reply.
    async fn post_send(
        &self,
        chat_id: &str,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<Result<(), reqwest::StatusCode>, ChannelError> {
        let mut body = serde_json::json!({ "chat_id": chat_id, "text": text });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = Value::from(mode);
        }

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;

        let status = resp.status();
        Ok(if status.is_success() { Ok(()) } else { Err(status) })
    }

    /// Alerts use Markdown; user text inside can break Telegram's parser, in
    /// which case the chunk is resent as plain text.
    async fn send_chunk(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let Err(markdown_status) = self.post_send(chat_id, text, Some("Markdown")).await? else {
            return Ok(());
        };
        tracing::warn!(status = %markdown_status, "Markdown rejected, resending as plain text");

        match self.post_send(chat_id, text, None).await? {
            Ok(()) => Ok(()),
            Err(plain_status) => Err(send_failed(format!(
                "sendMessage rejected (markdown: {markdown_status}, plain: {plain_status})"
            ))),
        }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    fn self_id(&self) -> Option<String> {
        self.bot_id.get().cloned()
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let bot_id = match self.bot_id.get() {
            Some(id) => id.clone(),
            None => {
                let id = self.fetch_bot_id().await?;
                self.bot_id.get_or_init(|| id).clone()
            }
        };
        tracing::info!(bot_id = %bot_id, "Telegram transport connected");

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram transport listening for messages...");

            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["message"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };

                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(Value::as_array) else {
                    tracing::warn!(response = %data, "Telegram getUpdates returned no result");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                };

                for update in results {
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(incoming) = parse_update(update, &bot_id) else {
                        continue;
                    };

                    if tx.send(incoming).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send_message(&self, recipient: &str, body: &str) -> Result<(), ChannelError> {
        for chunk in chunk_text(body, MAX_TEXT_CHARS) {
            self.send_chunk(recipient, chunk).await?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Telegram transport shutting down");
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn api_url(bot_token: &str, method: &str) -> String {
    format!("https://api.telegram.org/bot{bot_token}/{method}")
}

/// Classify a Telegram message payload by its content field.
fn message_kind(message: &Value) -> (MessageKind, bool) {
    if message.get("text").is_some() {
        return (MessageKind::Text, false);
    }

    let media = [
        ("photo", MessageKind::Image),
        ("audio", MessageKind::Audio),
        ("voice", MessageKind::Audio),
        ("video", MessageKind::Video),
        ("video_note", MessageKind::Video),
        ("animation", MessageKind::Video),
        ("document", MessageKind::Document),
        ("sticker", MessageKind::Sticker),
    ];
    if let Some((_, kind)) = media
        .into_iter()
        .find(|(field, _)| message.get(*field).is_some())
    {
        return (kind, true);
    }
    let other = ["contact", "location", "poll", "venue", "dice"]
        .into_iter()
        .find(|field| message.get(*field).is_some())
        .unwrap_or("service");
    (MessageKind::Other(other.to_string()), false)
}

/// Map one `getUpdates` entry to an inbound message.
///
/// Returns `None` for updates without a message or without a chat id.
fn parse_update(update: &Value, bot_id: &str) -> Option<IncomingMessage> {
    let message = update.get("message")?;

    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?
        .to_string();
    let message_id = message.get("message_id").and_then(Value::as_i64)?;

    let sender_id = message
        .get("from")
        .and_then(|f| f.get("id"))
        .and_then(Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let body = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let (kind, has_media) = message_kind(message);
    let mut incoming = IncomingMessage::text(
        "telegram",
        format!("{chat_id}:{message_id}"),
        chat_id,
        sender_id.as_str(),
        body,
    )
    .with_kind(kind, has_media)
    .from_self(sender_id == bot_id);

    if let Some(date) = message.get("date").and_then(Value::as_i64) {
        incoming = incoming.with_timestamp(date);
    }
    Some(incoming)
}

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: "telegram".into(),
        reason,
    }
}

/// Cut `text` into pieces of at most `max_chars` characters, preferring to
/// break after the last newline (or else space) inside each window.
fn chunk_text(text: &str, max_chars: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;

    loop {
        let Some((window_end, _)) = rest.char_indices().nth(max_chars) else {
            chunks.push(rest);
            return chunks;
        };
        let window = &rest[..window_end];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(window_end);
        chunks.push(&rest[..cut]);
        rest = rest[cut..].trim_start_matches(['\n', ' ']);
        if rest.is_empty() {
            return chunks;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> TelegramTransport {
        TelegramTransport::new(SecretString::from("123:ABC"))
    }

    #[test]
    fn telegram_transport_name() {
        assert_eq!(transport().name(), "telegram");
        assert_eq!(transport().self_id(), None);
    }

    #[test]
    fn telegram_api_url() {
        assert_eq!(
            transport().api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    // ── Update parsing tests ────────────────────────────────────────

    #[test]
    fn parses_group_text_message() {
        let update = serde_json::json!({
            "update_id": 10,
            "message": {
                "message_id": 77,
                "date": 1_700_000_000,
                "chat": {"id": -100123, "type": "supergroup"},
                "from": {"id": 42, "is_bot": false, "first_name": "Carol"},
                "text": "he's not breathing"
            }
        });
        let msg = parse_update(&update, "999").unwrap();
        assert_eq!(msg.id, "-100123:77");
        assert_eq!(msg.conversation_id, "-100123");
        assert_eq!(msg.sender_id, "42");
        assert_eq!(msg.body, "he's not breathing");
        assert_eq!(msg.timestamp, 1_700_000_000);
        assert_eq!(msg.kind, MessageKind::Text);
        assert!(!msg.has_media);
        assert!(!msg.from_self);
    }

    #[test]
    fn photo_with_caption_is_media() {
        let update = serde_json::json!({
            "update_id": 11,
            "message": {
                "message_id": 78,
                "date": 1,
                "chat": {"id": -1},
                "from": {"id": 42},
                "photo": [{"file_id": "x"}],
                "caption": "look"
            }
        });
        let msg = parse_update(&update, "999").unwrap();
        assert_eq!(msg.kind, MessageKind::Image);
        assert!(msg.has_media);
        assert_eq!(msg.body, "look");
    }

    #[test]
    fn own_messages_are_marked() {
        let update = serde_json::json!({
            "update_id": 12,
            "message": {
                "message_id": 1,
                "chat": {"id": -1},
                "from": {"id": 999, "is_bot": true},
                "text": "alert"
            }
        });
        assert!(parse_update(&update, "999").unwrap().from_self);
    }

    #[test]
    fn updates_without_message_are_skipped() {
        let update = serde_json::json!({"update_id": 13, "edited_message": {}});
        assert!(parse_update(&update, "999").is_none());
        let no_chat = serde_json::json!({"update_id": 14, "message": {"message_id": 1}});
        assert!(parse_update(&no_chat, "999").is_none());
    }

    #[test]
    fn service_messages_are_other_kind() {
        let msg = serde_json::json!({"new_chat_members": []});
        assert_eq!(
            message_kind(&msg),
            (MessageKind::Other("service".into()), false)
        );
        let loc = serde_json::json!({"location": {}});
        assert_eq!(
            message_kind(&loc),
            (MessageKind::Other("location".into()), false)
        );
    }

    // ── Chunking ────────────────────────────────────────────────────

    #[test]
    fn alert_sized_text_is_one_chunk() {
        let text = "🚨 *EMERGENCY ALERT* 🚨\n\n*Category:* 🚑 Medical";
        assert_eq!(chunk_text(text, MAX_TEXT_CHARS), vec![text]);
    }

    #[test]
    fn limit_counts_characters_not_bytes() {
        // 4096 four-byte emoji is 16 KiB but still within the limit.
        let text = "🚨".repeat(4096);
        assert_eq!(chunk_text(&text, MAX_TEXT_CHARS).len(), 1);

        let over = "🚨".repeat(4097);
        let chunks = chunk_text(&over, MAX_TEXT_CHARS);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 4096);
        assert_eq!(chunks[1], "🚨");
    }

    #[test]
    fn prefers_line_breaks() {
        let text = format!("{}\n{}", "x".repeat(10), "y".repeat(10));
        assert_eq!(chunk_text(&text, 15), vec!["x".repeat(10), "y".repeat(10)]);
    }

    #[test]
    fn falls_back_to_spaces_then_hard_cut() {
        assert_eq!(chunk_text("aaaa bbbb cccc", 10), vec!["aaaa bbbb", "cccc"]);
        assert_eq!(chunk_text("abcdefghij", 4), vec!["abcd", "efgh", "ij"]);
    }
}
