//! Shared types for the triage pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Message ─────────────────────────────────────────────────────────

/// Kind of an inbound chat message. Only `Text` is classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Sticker,
    Other(String),
}

/// An immutable chat message as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique per source transport.
    pub id: String,
    pub body: String,
    pub sender_id: String,
    pub conversation_id: String,
    /// Origin timestamp, seconds since epoch.
    pub timestamp: i64,
    pub has_media: bool,
    pub kind: MessageKind,
}

impl Message {
    /// Build a plain text message.
    pub fn text(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        body: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            sender_id: sender_id.into(),
            conversation_id: conversation_id.into(),
            timestamp,
            has_media: false,
            kind: MessageKind::Text,
        }
    }

    pub fn is_text(&self) -> bool {
        self.kind == MessageKind::Text
    }

    /// `sender: body`, the line format used in transcripts and stored context.
    pub fn transcript_line(&self) -> String {
        format!("{}: {}", self.sender_id, self.body)
    }

    /// Origin time as UTC. Out-of-range timestamps fall back to the epoch.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.timestamp, 0).unwrap_or_default()
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Closed set of emergency categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyCategory {
    MentalHealth,
    Medical,
    Conflict,
    Other,
}

impl EmergencyCategory {
    /// Storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MentalHealth => "mental_health",
            Self::Medical => "medical",
            Self::Conflict => "conflict",
            Self::Other => "other",
        }
    }

    /// Display label used in alerts.
    pub fn label(&self) -> &'static str {
        match self {
            Self::MentalHealth => "🧠 Mental Health",
            Self::Medical => "🚑 Medical",
            Self::Conflict => "⚠️ Conflict/Aggression",
            Self::Other => "🔔 Other Emergency",
        }
    }

    /// Parse a classifier or storage name. Case-insensitive; `-` and `_`
    /// are interchangeable.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "mental_health" => Some(Self::MentalHealth),
            "medical" => Some(Self::Medical),
            "conflict" => Some(Self::Conflict),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

impl fmt::Display for EmergencyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of classifying one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub is_emergency: bool,
    /// `None` whenever `is_emergency` is false.
    pub category: Option<EmergencyCategory>,
    /// In [0, 1]. Always present, only meaningful for emergencies.
    pub confidence_score: f64,
    pub explanation: String,
}

impl ClassificationResult {
    /// Result used when the classifier output cannot be understood.
    pub fn safe_default() -> Self {
        Self {
            is_emergency: false,
            category: None,
            confidence_score: 0.0,
            explanation: "parse failure".to_string(),
        }
    }

    /// A non-emergency with the given explanation.
    pub fn safe(explanation: impl Into<String>) -> Self {
        Self {
            is_emergency: false,
            category: None,
            confidence_score: 0.0,
            explanation: explanation.into(),
        }
    }

    /// An emergency of `category`.
    pub fn emergency(
        category: EmergencyCategory,
        confidence_score: f64,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            is_emergency: true,
            category: Some(category),
            confidence_score: clamp_confidence(confidence_score),
            explanation: explanation.into(),
        }
    }
}

/// Clamp to [0, 1]; NaN becomes 0.
pub fn clamp_confidence(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

// ── Alert ───────────────────────────────────────────────────────────

/// Payload handed to the alert dispatcher.
#[derive(Debug, Clone)]
pub struct AlertNotification {
    pub message_text: String,
    pub category: EmergencyCategory,
    pub confidence_score: f64,
    pub conversation_id: String,
    pub sender_id: String,
    pub occurred_at: DateTime<Utc>,
    pub context: Vec<String>,
}
