//! Message triage pipeline.
//!
//! Every admitted chat message flows through:
//! 1. `ContextCache::record_and_snapshot()`: rolling per-conversation context
//! 2. `Classifier::classify()`: LLM judgement, safe default on bad output
//! 3. `TriagePolicy::decide()`: escalate or dismiss
//! 4. `FlagLifecycle::persist()`: store the flagged record
//! 5. `AlertDispatcher::dispatch()`: alert the recipient, then mark notified

pub mod classifier;
pub mod context_cache;
pub mod dispatcher;
pub mod lifecycle;
pub mod processor;
pub mod triage;
pub mod types;
pub mod worker;

pub use classifier::{Classifier, LlmClassifier};
pub use context_cache::ContextCache;
pub use dispatcher::AlertDispatcher;
pub use processor::{TriageOutcome, TriageProcessor};
pub use triage::TriagePolicy;
pub use worker::{TriageWorker, WorkerStats};
