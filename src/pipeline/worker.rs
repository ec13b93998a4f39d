//! Inbound queue worker.
//!
//! A single consumer reads the queue in arrival order, applies admission
//! filters and takes the context snapshot inline, so messages of one
//! conversation always see each other in order. Classification and delivery
//! then run as concurrent tasks, at most `max_in_flight` at a time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::channels::IncomingMessage;
use crate::error::PipelineError;
use crate::pipeline::context_cache::ContextCache;
use crate::pipeline::processor::{TriageOutcome, TriageProcessor};
use crate::pipeline::types::MessageKind;

/// Default number of messages classified concurrently.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Default time allowed for in-flight work after the queue closes.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Why an inbound message was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotText,
    NotMonitored,
    FromSelf,
}

impl Rejection {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotText => "not_text",
            Self::NotMonitored => "not_monitored",
            Self::FromSelf => "from_self",
        }
    }
}

/// Counters reported when the worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: u64,
    pub admitted: u64,
    pub escalated: u64,
    /// Alerts that reached the recipient.
    pub notified: u64,
    /// Classifier errors, lost escalations, panicked or aborted tasks.
    pub failed: u64,
}

type TaskResult = (String, Result<TriageOutcome, PipelineError>);

impl WorkerStats {
    fn absorb(&mut self, joined: Result<TaskResult, JoinError>) {
        match joined {
            Ok((id, Ok(outcome))) => {
                debug!(id = %id, outcome = outcome.label(), "Message triaged");
                if outcome.escalated() {
                    self.escalated += 1;
                }
                if outcome.delivered() {
                    self.notified += 1;
                }
                if matches!(
                    outcome,
                    TriageOutcome::PersistFailed | TriageOutcome::NotifyFailed
                ) {
                    self.failed += 1;
                }
            }
            Ok((id, Err(e))) => {
                error!(id = %id, error = %e, "Error processing message");
                self.failed += 1;
            }
            Err(e) => {
                error!(error = %e, "Triage task panicked");
                self.failed += 1;
            }
        }
    }
}

/// Consumes `IncomingMessage`s and drives them through the processor.
pub struct TriageWorker {
    processor: Arc<TriageProcessor>,
    cache: Arc<ContextCache>,
    monitored: HashSet<String>,
    self_id: Option<String>,
    alert_recipient: Option<String>,
    max_in_flight: usize,
    shutdown_grace: Duration,
}

impl TriageWorker {
    pub fn new(
        processor: Arc<TriageProcessor>,
        cache: Arc<ContextCache>,
        monitored: HashSet<String>,
    ) -> Self {
        Self {
            processor,
            cache,
            monitored,
            self_id: None,
            alert_recipient: None,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Id the transport is connected as; its messages are never classified.
    pub fn with_self_id(mut self, self_id: Option<String>) -> Self {
        self.self_id = self_id;
        self
    }

    /// Alert recipient chat; messages posted in it are never classified. The
    /// recipient's own messages in monitored groups still are.
    pub fn with_alert_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.alert_recipient = Some(recipient.into());
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Admission filter: text only, monitored conversations only, never our
    /// own messages or anything in the alert chat.
    pub fn admit(&self, message: &IncomingMessage) -> Result<(), Rejection> {
        if message.kind != MessageKind::Text {
            return Err(Rejection::NotText);
        }
        let is_self = self
            .self_id
            .as_deref()
            .is_some_and(|id| id == message.sender_id || id == message.conversation_id);
        let in_alert_chat =
            self.alert_recipient.as_deref() == Some(message.conversation_id.as_str());
        if message.from_self || is_self || in_alert_chat {
            return Err(Rejection::FromSelf);
        }
        if !self.monitored.contains(&message.conversation_id) {
            return Err(Rejection::NotMonitored);
        }
        Ok(())
    }

    /// Run until `rx` closes, then wait up to the shutdown grace for
    /// in-flight messages and abort whatever is left.
    pub async fn run(self, mut rx: mpsc::Receiver<IncomingMessage>) -> WorkerStats {
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut stats = WorkerStats::default();

        info!(
            monitored = self.monitored.len(),
            max_in_flight = self.max_in_flight,
            "Triage worker started"
        );

        while let Some(incoming) = rx.recv().await {
            stats.received += 1;

            if let Err(reason) = self.admit(&incoming) {
                debug!(
                    id = %incoming.id,
                    conversation = %incoming.conversation_id,
                    reason = reason.label(),
                    "Message skipped"
                );
                continue;
            }
            stats.admitted += 1;

            let message = incoming.into_message();
            let previous = self
                .cache
                .record_and_snapshot(&message.conversation_id, message.clone());

            while let Some(joined) = tasks.try_join_next() {
                stats.absorb(joined);
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let processor = Arc::clone(&self.processor);
            tasks.spawn(async move {
                let _permit = permit;
                let result = processor.process(&message, &previous).await;
                (message.id, result)
            });
        }

        info!(in_flight = tasks.len(), "Inbound queue closed, draining");
        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => stats.absorb(joined),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        aborted = tasks.len(),
                        grace_secs = self.shutdown_grace.as_secs(),
                        "Shutdown grace elapsed, aborting in-flight messages"
                    );
                    stats.failed += tasks.len() as u64;
                    tasks.abort_all();
                    break;
                }
            }
        }

        info!(
            received = stats.received,
            admitted = stats.admitted,
            escalated = stats.escalated,
            notified = stats.notified,
            failed = stats.failed,
            "Triage worker stopped"
        );
        stats
    }
}
