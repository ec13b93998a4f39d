//! Transport abstraction for inbound chat messages and outbound alerts.

pub mod stdin;
pub mod telegram;

use std::pin::Pin;

use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;

use crate::error::ChannelError;
use crate::pipeline::types::{Message, MessageKind};

pub use stdin::StdinTransport;
pub use telegram::TelegramTransport;

/// A message as delivered by a transport, before admission.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    /// Transport that produced the message.
    pub channel: String,
    /// Unique per transport.
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    /// Seconds since epoch.
    pub timestamp: i64,
    pub kind: MessageKind,
    pub has_media: bool,
    /// Sent by the account the transport is logged in as.
    pub from_self: bool,
}

impl IncomingMessage {
    pub fn text(
        channel: impl Into<String>,
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            id: id.into(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            body: body.into(),
            timestamp: Utc::now().timestamp(),
            kind: MessageKind::Text,
            has_media: false,
            from_self: false,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_kind(mut self, kind: MessageKind, has_media: bool) -> Self {
        self.kind = kind;
        self.has_media = has_media;
        self
    }

    pub fn from_self(mut self, from_self: bool) -> Self {
        self.from_self = from_self;
        self
    }

    /// Pipeline view of this message.
    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            body: self.body,
            sender_id: self.sender_id,
            conversation_id: self.conversation_id,
            timestamp: self.timestamp,
            has_media: self.has_media,
            kind: self.kind,
        }
    }
}

/// Stream of inbound messages produced by `Transport::start`.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A chat transport: yields inbound messages and delivers outbound text.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Identity of the account this transport is connected as, once known.
    fn self_id(&self) -> Option<String>;

    /// Connect and begin yielding inbound messages.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Deliver `body` to `recipient`.
    async fn send_message(&self, recipient: &str, body: &str) -> Result<(), ChannelError>;

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
