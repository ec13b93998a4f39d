//! Triage processor: classifies one message and, on escalation, records the
//! detection and alerts the recipient.
//!
//! Flow:
//! 1. Classifier → `ClassificationResult` (safe default on malformed output)
//! 2. Triage policy → escalate or dismiss
//! 3. Persist the flagged record (processed, not yet notified)
//! 4. Dispatch the alert
//! 5. On delivery, mark the record notified
//!
//! Persistence and delivery failures end the attempt with a logged outcome.
//! Only classifier call failures are returned as errors.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::pipeline::classifier::Classifier;
use crate::pipeline::dispatcher::AlertDispatcher;
use crate::pipeline::lifecycle::{FlagDraft, FlagLifecycle};
use crate::pipeline::triage::{DismissReason, TriageDecision, TriagePolicy};
use crate::pipeline::types::Message;
use crate::store::FlagStore;

/// How a single message left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageOutcome {
    NotEscalated(DismissReason),
    /// Escalated, but the record could not be saved. No alert was sent.
    PersistFailed,
    /// Alert delivered and the record marked notified.
    Notified,
    /// Record saved, alert not delivered.
    NotifyFailed,
    /// Alert delivered, but the record still says not notified.
    NotifiedUpdateFailed,
}

impl TriageOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotEscalated(reason) => reason.label(),
            Self::PersistFailed => "persist_failed",
            Self::Notified => "notified",
            Self::NotifyFailed => "notify_failed",
            Self::NotifiedUpdateFailed => "notified_update_failed",
        }
    }

    pub fn escalated(&self) -> bool {
        !matches!(self, Self::NotEscalated(_))
    }

    /// The alert reached the recipient.
    pub fn delivered(&self) -> bool {
        matches!(self, Self::Notified | Self::NotifiedUpdateFailed)
    }
}

/// Composes classifier, policy, lifecycle and dispatcher for one message.
pub struct TriageProcessor {
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn FlagStore>,
    dispatcher: Arc<AlertDispatcher>,
    policy: TriagePolicy,
}

impl TriageProcessor {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn FlagStore>,
        dispatcher: Arc<AlertDispatcher>,
        policy: TriagePolicy,
    ) -> Self {
        Self {
            classifier,
            store,
            dispatcher,
            policy,
        }
    }

    /// Process one admitted message given the context that preceded it.
    pub async fn process(
        &self,
        message: &Message,
        previous: &[Message],
    ) -> Result<TriageOutcome, PipelineError> {
        debug!(id = %message.id, context = previous.len(), "Classifying message");

        let result = self
            .classifier
            .classify(message, previous)
            .await
            .map_err(|source| PipelineError::Classify {
                message_id: message.id.clone(),
                source,
            })?;

        let category = match self.policy.decide(&result) {
            TriageDecision::Dismiss(reason) => {
                debug!(
                    id = %message.id,
                    reason = reason.label(),
                    confidence = result.confidence_score,
                    "Message not escalated"
                );
                return Ok(TriageOutcome::NotEscalated(reason));
            }
            TriageDecision::Escalate {
                category,
                below_threshold,
            } => {
                info!(
                    id = %message.id,
                    conversation = %message.conversation_id,
                    category = %category,
                    confidence = result.confidence_score,
                    below_threshold,
                    "Emergency detected"
                );
                category
            }
        };

        let draft = FlagDraft::from_message(message, category, result.confidence_score, previous);
        let persisted = match FlagLifecycle::persist(self.store.as_ref(), draft).await {
            Ok(flag) => flag,
            Err(e) => {
                error!(id = %message.id, error = %e, "Abandoning escalation: flagged message not saved");
                return Ok(TriageOutcome::PersistFailed);
            }
        };

        if !self.dispatcher.dispatch(&persisted.record().alert()).await {
            warn!(id = %message.id, "Alert not delivered; record left unnotified");
            return Ok(TriageOutcome::NotifyFailed);
        }

        match persisted.mark_notified(self.store.as_ref()).await {
            Ok(_) => Ok(TriageOutcome::Notified),
            Err((_, e)) => {
                warn!(id = %message.id, error = %e, "Alert delivered but delivery not recorded");
                Ok(TriageOutcome::NotifiedUpdateFailed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::channels::{MessageStream, Transport};
    use crate::error::{ChannelError, ClassifyError, DatabaseError, LlmError};
    use crate::pipeline::classifier::parse_classification;
    use crate::pipeline::lifecycle::{FlagState, FlaggedRecord};
    use crate::pipeline::types::{ClassificationResult, EmergencyCategory};
    use crate::store::LibSqlFlagStore;

    // ── Stubs ───────────────────────────────────────────────────────

    /// Classifier that parses a canned raw answer, or fails the call.
    struct CannedClassifier {
        raw: Option<String>,
        calls: Mutex<usize>,
    }

    impl CannedClassifier {
        fn answering(raw: &str) -> Arc<Self> {
            Arc::new(Self {
                raw: Some(raw.to_string()),
                calls: Mutex::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                raw: None,
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl Classifier for CannedClassifier {
        async fn classify(
            &self,
            _message: &Message,
            _previous: &[Message],
        ) -> Result<ClassificationResult, ClassifyError> {
            *self.calls.lock().unwrap() += 1;
            match &self.raw {
                Some(raw) => Ok(parse_classification(raw)),
                None => Err(ClassifyError::Call(LlmError::RequestFailed {
                    provider: "stub".into(),
                    reason: "unreachable".into(),
                })),
            }
        }
    }

    struct RecordingTransport {
        fail: bool,
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        fn self_id(&self) -> Option<String> {
            None
        }

        async fn start(&self) -> Result<MessageStream, ChannelError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn send_message(&self, recipient: &str, body: &str) -> Result<(), ChannelError> {
            self.sent
                .lock()
                .unwrap()
                .push((recipient.to_string(), body.to_string()));
            if self.fail {
                return Err(ChannelError::SendFailed {
                    name: "recording".into(),
                    reason: "offline".into(),
                });
            }
            Ok(())
        }
    }

    /// Delegates to libSQL but can fail saves or updates.
    struct FlakyStore {
        inner: LibSqlFlagStore,
        fail_save: bool,
        fail_update: bool,
    }

    #[async_trait]
    impl FlagStore for FlakyStore {
        async fn save(&self, record: &FlaggedRecord) -> Result<(), DatabaseError> {
            if self.fail_save {
                return Err(DatabaseError::Pool("database unavailable".into()));
            }
            self.inner.save(record).await
        }

        async fn update(&self, record: &FlaggedRecord) -> Result<(), DatabaseError> {
            if self.fail_update {
                return Err(DatabaseError::Pool("database unavailable".into()));
            }
            self.inner.update(record).await
        }

        async fn get(&self, id: &str) -> Result<Option<FlaggedRecord>, DatabaseError> {
            self.inner.get(id).await
        }

        async fn list_undelivered(&self, limit: usize) -> Result<Vec<FlaggedRecord>, DatabaseError> {
            self.inner.list_undelivered(limit).await
        }

        async fn count_undelivered(&self) -> Result<u64, DatabaseError> {
            self.inner.count_undelivered().await
        }
    }

    struct Harness {
        processor: TriageProcessor,
        store: Arc<FlakyStore>,
        transport: Arc<RecordingTransport>,
    }

    async fn harness(
        classifier: Arc<dyn Classifier>,
        fail_send: bool,
        fail_save: bool,
        fail_update: bool,
    ) -> Harness {
        let store = Arc::new(FlakyStore {
            inner: LibSqlFlagStore::new_memory().await.unwrap(),
            fail_save,
            fail_update,
        });
        let transport = Arc::new(RecordingTransport {
            fail: fail_send,
            sent: Mutex::new(Vec::new()),
        });
        let dispatcher = Arc::new(AlertDispatcher::new(
            transport.clone(),
            "admin",
            Duration::from_secs(5),
        ));
        Harness {
            processor: TriageProcessor::new(
                classifier,
                store.clone(),
                dispatcher,
                TriagePolicy::default(),
            ),
            store,
            transport,
        }
    }

    const MEDICAL: &str = r#"{"isEmergency":true,"emergencyCategory":"medical","confidenceScore":0.9,"explanation":"collapse"}"#;
    const SAFE: &str = r#"{"isEmergency":false,"emergencyCategory":null,"confidenceScore":0.95,"explanation":"chat"}"#;

    fn message() -> Message {
        Message::text("G1:6", "G1", "carol", "Dad collapsed and isn't responding", 1_700_000_000)
    }

    fn previous() -> Vec<Message> {
        (2..=5)
            .map(|n| Message::text(format!("G1:{n}"), "G1", "alice", format!("M{n}"), n))
            .collect()
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn medical_emergency_is_stored_and_notified() {
        let h = harness(CannedClassifier::answering(MEDICAL), false, false, false).await;
        let outcome = h.processor.process(&message(), &previous()).await.unwrap();
        assert_eq!(outcome, TriageOutcome::Notified);

        let record = h.store.get("G1:6").await.unwrap().unwrap();
        assert_eq!(record.category, EmergencyCategory::Medical);
        assert_eq!(record.state(), FlagState::NotifiedPersisted);
        assert!(record.processed());
        assert_eq!(record.context, ["alice: M2", "alice: M3", "alice: M4", "alice: M5"]);

        let sent = h.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "admin");
        assert!(sent[0].1.contains("🚑 Medical"));
        assert!(sent[0].1.contains("*Confidence:* 90%"));
    }

    #[tokio::test]
    async fn malformed_output_is_not_escalated() {
        let h = harness(CannedClassifier::answering("not json"), false, false, false).await;
        let outcome = h.processor.process(&message(), &[]).await.unwrap();
        assert_eq!(outcome, TriageOutcome::NotEscalated(DismissReason::NotEmergency));
        assert!(h.store.get("G1:6").await.unwrap().is_none());
        assert!(h.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn high_confidence_non_emergency_is_not_escalated() {
        let h = harness(CannedClassifier::answering(SAFE), false, false, false).await;
        let outcome = h.processor.process(&message(), &[]).await.unwrap();
        assert!(!outcome.escalated());
        assert!(h.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn emergency_without_category_is_not_escalated() {
        let raw = r#"{"isEmergency":true,"emergencyCategory":null,"confidenceScore":0.9,"explanation":"?"}"#;
        let h = harness(CannedClassifier::answering(raw), false, false, false).await;
        let outcome = h.processor.process(&message(), &[]).await.unwrap();
        assert_eq!(outcome, TriageOutcome::NotEscalated(DismissReason::MissingCategory));
    }

    #[tokio::test]
    async fn dispatch_failure_leaves_record_unnotified() {
        let h = harness(CannedClassifier::answering(MEDICAL), true, false, false).await;
        let outcome = h.processor.process(&message(), &previous()).await.unwrap();
        assert_eq!(outcome, TriageOutcome::NotifyFailed);
        assert!(!outcome.delivered());

        let record = h.store.get("G1:6").await.unwrap().unwrap();
        assert!(record.processed());
        assert!(!record.notification_sent());
        assert_eq!(h.store.count_undelivered().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn persist_failure_skips_alert() {
        let h = harness(CannedClassifier::answering(MEDICAL), false, true, false).await;
        let outcome = h.processor.process(&message(), &previous()).await.unwrap();
        assert_eq!(outcome, TriageOutcome::PersistFailed);
        assert!(h.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_failure_after_delivery() {
        let h = harness(CannedClassifier::answering(MEDICAL), false, false, true).await;
        let outcome = h.processor.process(&message(), &previous()).await.unwrap();
        assert_eq!(outcome, TriageOutcome::NotifiedUpdateFailed);
        assert!(outcome.delivered());

        assert_eq!(h.transport.sent.lock().unwrap().len(), 1);
        let record = h.store.get("G1:6").await.unwrap().unwrap();
        assert!(!record.notification_sent());
    }

    #[tokio::test]
    async fn duplicate_message_is_not_alerted_twice() {
        let h = harness(CannedClassifier::answering(MEDICAL), false, false, false).await;
        assert_eq!(
            h.processor.process(&message(), &[]).await.unwrap(),
            TriageOutcome::Notified
        );
        assert_eq!(
            h.processor.process(&message(), &[]).await.unwrap(),
            TriageOutcome::PersistFailed
        );
        assert_eq!(h.transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn classifier_call_failure_is_an_error() {
        let classifier = CannedClassifier::failing();
        let h = harness(classifier.clone(), false, false, false).await;
        let err = h.processor.process(&message(), &[]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Classify { ref message_id, .. } if message_id == "G1:6"));
        assert_eq!(*classifier.calls.lock().unwrap(), 1);
        assert!(h.transport.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(TriageOutcome::Notified.label(), "notified");
        assert_eq!(
            TriageOutcome::NotEscalated(DismissReason::BelowThreshold).label(),
            "below_threshold"
        );
        assert!(TriageOutcome::PersistFailed.escalated());
        assert!(!TriageOutcome::PersistFailed.delivered());
    }
}
