//! Classifier adapter: renders the emergency-detection prompt, calls the
//! LLM, and turns its answer into a `ClassificationResult`.
//!
//! A response that cannot be parsed never fails the pipeline: it becomes
//! `ClassificationResult::safe_default()`. Only call-level failures (network,
//! auth, timeout) are returned as `ClassifyError`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ClassifyError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{ClassificationResult, EmergencyCategory, Message, clamp_confidence};

/// Temperature for classification (near-deterministic).
const CLASSIFY_TEMPERATURE: f32 = 0.1;

/// Max tokens for the classification answer.
const CLASSIFY_MAX_TOKENS: u32 = 512;

/// Rendered in place of a transcript when the conversation has no history.
pub const NO_PREVIOUS_MESSAGES: &str = "No previous messages available";

/// Something that can judge whether a message describes an emergency.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        message: &Message,
        previous: &[Message],
    ) -> Result<ClassificationResult, ClassifyError>;
}

/// LLM-backed classifier.
pub struct LlmClassifier {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(
        &self,
        message: &Message,
        previous: &[Message],
    ) -> Result<ClassificationResult, ClassifyError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt()),
            ChatMessage::user(build_user_prompt(message, previous)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let response = tokio::time::timeout(self.timeout, self.llm.complete(request))
            .await
            .map_err(|_| ClassifyError::Timeout(self.timeout))??;

        let result = parse_classification(&response.content);
        debug!(
            id = %message.id,
            model = self.llm.model_name(),
            is_emergency = result.is_emergency,
            category = ?result.category,
            confidence = result.confidence_score,
            "Message classification result"
        );
        Ok(result)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt() -> String {
    "You are an emergency detection system that specializes in identifying potential \
     emergency situations in group chat messages.\n\
     Determine whether the message indicates any of these emergency categories:\n\n\
     1. MENTAL_HEALTH: depression, suicidal thoughts, severe anxiety, or other mental health crises.\n\
     2. MEDICAL: physical health emergencies, requests for medical assistance, or reports of injury.\n\
     3. CONFLICT: violent situations, abuse, threats, or severe aggressive behavior.\n\
     4. OTHER: emergencies not covered by the above categories.\n\n\
     If the message does not indicate an emergency, classify it as safe.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"isEmergency\": boolean, \"emergencyCategory\": \"MENTAL_HEALTH\" | \"MEDICAL\" | \"CONFLICT\" | \"OTHER\" | null, \
     \"confidenceScore\": number between 0 and 1, \"explanation\": \"brief explanation\"}\n\n\
     emergencyCategory must be null when isEmergency is false."
        .to_string()
}

/// Human-readable transcript of the preceding messages.
pub fn render_transcript(previous: &[Message]) -> String {
    if previous.is_empty() {
        return NO_PREVIOUS_MESSAGES.to_string();
    }
    previous
        .iter()
        .map(Message::transcript_line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_user_prompt(message: &Message, previous: &[Message]) -> String {
    format!(
        "Here is the message to analyze:\n\"{}\"\n\nContext (previous messages in the group chat):\n{}",
        message.body,
        render_transcript(previous)
    )
}

// ── Response parsing ────────────────────────────────────────────────

/// Classifier answer as it appears on the wire. Every field is required.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawClassification {
    is_emergency: bool,
    /// Required but nullable.
    emergency_category: serde_json::Value,
    confidence_score: f64,
    explanation: String,
}

/// Parse classifier output, falling back to the safe default on any problem.
pub fn parse_classification(raw: &str) -> ClassificationResult {
    match try_parse_classification(raw) {
        Ok(result) => result,
        Err(e) => {
            warn!(raw_result = %raw, error = %e, "Failed to parse classification result");
            ClassificationResult::safe_default()
        }
    }
}

fn try_parse_classification(raw: &str) -> Result<ClassificationResult, String> {
    let parsed: RawClassification =
        serde_json::from_str(json_payload(raw)).map_err(|e| format!("JSON parse error: {e}"))?;

    let category = match &parsed.emergency_category {
        serde_json::Value::Null => None,
        serde_json::Value::String(name) if name.trim().is_empty() => None,
        serde_json::Value::String(name) => Some(
            EmergencyCategory::parse(name).ok_or_else(|| format!("unknown category '{name}'"))?,
        ),
        other => return Err(format!("emergencyCategory has unexpected type: {other}")),
    };

    Ok(ClassificationResult {
        is_emergency: parsed.is_emergency,
        category: if parsed.is_emergency { category } else { None },
        confidence_score: clamp_confidence(parsed.confidence_score),
        explanation: parsed.explanation,
    })
}

/// The outermost `{...}` in the model's answer. Code fences and surrounding
/// prose are ignored.
fn json_payload(text: &str) -> &str {
    let trimmed = text.trim();
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::CompletionResponse;

    // ── Prompt construction tests ───────────────────────────────────

    #[test]
    fn transcript_uses_sender_body_lines() {
        let previous = vec![
            Message::text("1", "g1", "alice", "anyone around?", 1),
            Message::text("2", "g1", "bob", "yes", 2),
        ];
        assert_eq!(render_transcript(&previous), "alice: anyone around?\nbob: yes");
    }

    #[test]
    fn empty_transcript_uses_sentinel() {
        assert_eq!(render_transcript(&[]), NO_PREVIOUS_MESSAGES);
    }

    #[test]
    fn user_prompt_contains_message_and_context() {
        let msg = Message::text("3", "g1", "carol", "I can't breathe", 3);
        let previous = vec![Message::text("2", "g1", "bob", "how are you", 2)];
        let prompt = build_user_prompt(&msg, &previous);
        assert!(prompt.contains("\"I can't breathe\""));
        assert!(prompt.contains("bob: how are you"));
    }

    #[test]
    fn system_prompt_lists_categories() {
        let prompt = build_system_prompt();
        for name in ["MENTAL_HEALTH", "MEDICAL", "CONFLICT", "OTHER", "isEmergency"] {
            assert!(prompt.contains(name), "missing {name}");
        }
    }

    // ── Response parsing tests ──────────────────────────────────────

    #[test]
    fn parses_medical_emergency() {
        let raw = r#"{"isEmergency":true,"emergencyCategory":"medical","confidenceScore":0.9,"explanation":"injury"}"#;
        let r = parse_classification(raw);
        assert!(r.is_emergency);
        assert_eq!(r.category, Some(EmergencyCategory::Medical));
        assert!((r.confidence_score - 0.9).abs() < 1e-9);
        assert_eq!(r.explanation, "injury");
    }

    #[test]
    fn parses_upper_case_category() {
        let raw = r#"{"isEmergency":true,"emergencyCategory":"MENTAL_HEALTH","confidenceScore":0.8,"explanation":"x"}"#;
        assert_eq!(
            parse_classification(raw).category,
            Some(EmergencyCategory::MentalHealth)
        );
    }

    #[test]
    fn not_json_yields_safe_default() {
        assert_eq!(
            parse_classification("not json"),
            ClassificationResult::safe_default()
        );
    }

    #[test]
    fn missing_field_yields_safe_default() {
        let raw = r#"{"isEmergency":true,"emergencyCategory":"medical","explanation":"no score"}"#;
        assert_eq!(parse_classification(raw), ClassificationResult::safe_default());
    }

    #[test]
    fn missing_category_key_yields_safe_default() {
        let raw = r#"{"isEmergency":false,"confidenceScore":0.1,"explanation":"fine"}"#;
        assert_eq!(parse_classification(raw), ClassificationResult::safe_default());
    }

    #[test]
    fn wrong_type_yields_safe_default() {
        let raw = r#"{"isEmergency":"yes","emergencyCategory":"medical","confidenceScore":0.9,"explanation":""}"#;
        assert_eq!(parse_classification(raw), ClassificationResult::safe_default());
    }

    #[test]
    fn unknown_category_yields_safe_default() {
        let raw = r#"{"isEmergency":true,"emergencyCategory":"weather","confidenceScore":0.9,"explanation":""}"#;
        assert_eq!(parse_classification(raw), ClassificationResult::safe_default());
    }

    #[test]
    fn category_dropped_when_not_emergency() {
        let raw = r#"{"isEmergency":false,"emergencyCategory":"conflict","confidenceScore":0.4,"explanation":"banter"}"#;
        let r = parse_classification(raw);
        assert!(!r.is_emergency);
        assert!(r.category.is_none());
        assert!((r.confidence_score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn emergency_without_category_is_kept_for_the_gate() {
        let raw = r#"{"isEmergency":true,"emergencyCategory":null,"confidenceScore":0.7,"explanation":"?"}"#;
        let r = parse_classification(raw);
        assert!(r.is_emergency);
        assert!(r.category.is_none());
    }

    #[test]
    fn confidence_is_clamped() {
        let raw = r#"{"isEmergency":true,"emergencyCategory":"other","confidenceScore":4.2,"explanation":""}"#;
        assert_eq!(parse_classification(raw).confidence_score, 1.0);
    }

    #[test]
    fn parses_markdown_wrapped_response() {
        let raw = "Here you go:\n```json\n{\"isEmergency\":false,\"emergencyCategory\":null,\"confidenceScore\":0.1,\"explanation\":\"chat\"}\n```";
        let r = parse_classification(raw);
        assert!(!r.is_emergency);
        assert_eq!(r.explanation, "chat");
    }

    #[test]
    fn parses_object_embedded_in_prose() {
        let raw = "Assessment: {\"isEmergency\":true,\"emergencyCategory\":\"CONFLICT\",\"confidenceScore\":0.6,\"explanation\":\"threat\"} end.";
        assert_eq!(
            parse_classification(raw).category,
            Some(EmergencyCategory::Conflict)
        );
    }

    #[test]
    fn payload_strips_fences_and_prose() {
        assert_eq!(json_payload("  {\"a\": {\"b\": 1}}\n"), "{\"a\": {\"b\": 1}}");
        assert_eq!(json_payload("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(json_payload("no object here"), "no object here");
    }

    // ── Adapter with stub LLM ───────────────────────────────────────

    struct StubLlm {
        reply: Result<String, ()>,
        delay: Duration,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl StubLlm {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                delay: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.seen.lock().unwrap().push(request);
            tokio::time::sleep(self.delay).await;
            match &self.reply {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                }),
                Err(()) => Err(LlmError::RequestFailed {
                    provider: "stub".into(),
                    reason: "connection refused".into(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn classify_sends_context_and_parses() {
        let llm = Arc::new(StubLlm::replying(
            r#"{"isEmergency":true,"emergencyCategory":"medical","confidenceScore":0.9,"explanation":"fall"}"#,
        ));
        let classifier = LlmClassifier::new(llm.clone(), Duration::from_secs(5));
        let msg = Message::text("m2", "g1", "bob", "she fell and isn't moving", 2);
        let previous = vec![Message::text("m1", "g1", "alice", "where is mum?", 1)];

        let result = classifier.classify(&msg, &previous).await.unwrap();
        assert_eq!(result.category, Some(EmergencyCategory::Medical));

        let seen = llm.seen.lock().unwrap();
        let prompt = seen[0].last_user_text().unwrap();
        assert!(prompt.contains("alice: where is mum?"));
        assert_eq!(seen[0].temperature, Some(CLASSIFY_TEMPERATURE));
    }

    #[tokio::test]
    async fn classify_malformed_output_is_not_an_error() {
        let llm = Arc::new(StubLlm::replying("not json"));
        let classifier = LlmClassifier::new(llm, Duration::from_secs(5));
        let msg = Message::text("m1", "g1", "bob", "hello", 1);
        let result = classifier.classify(&msg, &[]).await.unwrap();
        assert_eq!(result, ClassificationResult::safe_default());
    }

    #[tokio::test]
    async fn classify_call_failure_propagates() {
        let llm = Arc::new(StubLlm {
            reply: Err(()),
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        });
        let classifier = LlmClassifier::new(llm, Duration::from_secs(5));
        let msg = Message::text("m1", "g1", "bob", "hello", 1);
        let err = classifier.classify(&msg, &[]).await.unwrap_err();
        assert!(matches!(err, ClassifyError::Call(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn classify_times_out() {
        let llm = Arc::new(StubLlm {
            reply: Ok("{}".into()),
            delay: Duration::from_secs(60),
            seen: Mutex::new(Vec::new()),
        });
        let classifier = LlmClassifier::new(llm, Duration::from_secs(1));
        let msg = Message::text("m1", "g1", "bob", "hello", 1);
        let err = classifier.classify(&msg, &[]).await.unwrap_err();
        assert!(matches!(err, ClassifyError::Timeout(_)));
    }
}
