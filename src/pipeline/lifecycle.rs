//! Flagged-record lifecycle.
//!
//! A detection moves through `FlagDraft` (in memory) → `PersistedFlag`
//! (saved, not yet delivered) → `NotifiedFlag` (saved, delivered). Each
//! transition consumes the previous handle, so a record can only be marked
//! notified after it was saved, and only once. A `PersistedFlag` dropped
//! without `mark_notified` is the delivery-failed state; the stored row keeps
//! `notification_sent = false` and shows up in `list_undelivered`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::DatabaseError;
use crate::pipeline::types::{AlertNotification, EmergencyCategory, Message};
use crate::store::FlagStore;

/// Delivery state derived from a record's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlagState {
    Persisted,
    NotifiedPersisted,
}

/// In-memory record of an escalated message, before its first save.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagDraft {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub message_text: String,
    pub occurred_at: DateTime<Utc>,
    pub category: EmergencyCategory,
    pub confidence_score: f64,
    /// `sender: body` lines of the messages that preceded this one.
    pub context: Vec<String>,
}

impl FlagDraft {
    pub fn from_message(
        message: &Message,
        category: EmergencyCategory,
        confidence_score: f64,
        previous: &[Message],
    ) -> Self {
        Self {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            message_text: message.body.clone(),
            occurred_at: message.occurred_at(),
            category,
            confidence_score,
            context: previous.iter().map(Message::transcript_line).collect(),
        }
    }
}

/// A flagged message as stored.
///
/// `processed` and `notification_sent` are only reachable through the
/// lifecycle or `restore`, which keep `notification_sent ⇒ processed`.
#[derive(Debug, Clone, PartialEq)]
pub struct FlaggedRecord {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub message_text: String,
    pub occurred_at: DateTime<Utc>,
    pub category: EmergencyCategory,
    pub confidence_score: f64,
    pub context: Vec<String>,
    processed: bool,
    notification_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlaggedRecord {
    fn persisted(draft: FlagDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: draft.id,
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            message_text: draft.message_text,
            occurred_at: draft.occurred_at,
            category: draft.category,
            confidence_score: draft.confidence_score,
            context: draft.context,
            processed: true,
            notification_sent: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a record read back from storage.
    pub fn restore(
        draft: FlagDraft,
        processed: bool,
        notification_sent: bool,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, DatabaseError> {
        if notification_sent && !processed {
            return Err(DatabaseError::Serialization(format!(
                "flagged message {} is marked notified but not processed",
                draft.id
            )));
        }
        let mut record = Self::persisted(draft, created_at);
        record.processed = processed;
        record.notification_sent = notification_sent;
        record.updated_at = updated_at;
        Ok(record)
    }

    pub fn processed(&self) -> bool {
        self.processed
    }

    pub fn notification_sent(&self) -> bool {
        self.notification_sent
    }

    pub fn state(&self) -> FlagState {
        if self.notification_sent {
            FlagState::NotifiedPersisted
        } else {
            FlagState::Persisted
        }
    }

    /// Alert payload for this record.
    pub fn alert(&self) -> AlertNotification {
        AlertNotification {
            message_text: self.message_text.clone(),
            category: self.category,
            confidence_score: self.confidence_score,
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            occurred_at: self.occurred_at,
            context: self.context.clone(),
        }
    }
}

// ── Transitions ─────────────────────────────────────────────────────

/// Entry point of the lifecycle.
pub struct FlagLifecycle;

impl FlagLifecycle {
    /// Save a new record with `processed = true, notification_sent = false`.
    /// A duplicate id is reported as `DatabaseError::Constraint`.
    pub async fn persist(
        store: &dyn FlagStore,
        draft: FlagDraft,
    ) -> Result<PersistedFlag, DatabaseError> {
        let record = FlaggedRecord::persisted(draft, Utc::now());
        if let Err(e) = store.save(&record).await {
            error!(id = %record.id, error = %e, "Error saving flagged message");
            return Err(e);
        }
        debug!(id = %record.id, category = %record.category, "Flagged message saved");
        Ok(PersistedFlag { record })
    }
}

/// Saved record whose alert has not been confirmed delivered.
#[derive(Debug)]
pub struct PersistedFlag {
    record: FlaggedRecord,
}

impl PersistedFlag {
    pub fn record(&self) -> &FlaggedRecord {
        &self.record
    }

    /// Record delivery. On failure the handle is returned alongside the error
    /// and the stored row is unchanged.
    pub async fn mark_notified(
        self,
        store: &dyn FlagStore,
    ) -> Result<NotifiedFlag, (PersistedFlag, DatabaseError)> {
        let mut updated = self.record.clone();
        updated.notification_sent = true;
        updated.updated_at = Utc::now();

        match store.update(&updated).await {
            Ok(()) => Ok(NotifiedFlag { record: updated }),
            Err(e) => {
                error!(id = %self.record.id, error = %e, "Error updating flagged message");
                Err((self, e))
            }
        }
    }
}

/// Saved record whose alert was delivered. Terminal.
#[derive(Debug)]
pub struct NotifiedFlag {
    record: FlaggedRecord,
}

impl NotifiedFlag {
    pub fn record(&self) -> &FlaggedRecord {
        &self.record
    }

    pub fn into_record(self) -> FlaggedRecord {
        self.record
    }
}

// ── Recovery ────────────────────────────────────────────────────────

/// Records whose alert never went out.
#[derive(Debug, Default)]
pub struct UndeliveredReport {
    pub count: u64,
    /// Oldest first, at most the requested limit.
    pub oldest: Vec<FlaggedRecord>,
}

/// Count undelivered records and fetch the oldest `limit` of them. Store
/// failures are returned, never reported as "nothing pending".
pub async fn undelivered_report(
    store: &dyn FlagStore,
    limit: usize,
) -> Result<UndeliveredReport, DatabaseError> {
    let count = store.count_undelivered().await?;
    if count == 0 {
        return Ok(UndeliveredReport::default());
    }
    let oldest = store.list_undelivered(limit).await?;
    Ok(UndeliveredReport { count, oldest })
}
