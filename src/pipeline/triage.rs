//! Escalation policy.

use crate::config::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::pipeline::types::{ClassificationResult, EmergencyCategory};

/// True iff the result is an emergency with a known category.
pub fn should_escalate(result: &ClassificationResult) -> bool {
    result.is_emergency && result.category.is_some()
}

/// Why a result was not escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissReason {
    NotEmergency,
    /// Emergency flagged without a category (malformed classifier answer).
    MissingCategory,
    /// Confidence below the configured threshold while the threshold is enforced.
    BelowThreshold,
}

impl DismissReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotEmergency => "not_emergency",
            Self::MissingCategory => "missing_category",
            Self::BelowThreshold => "below_threshold",
        }
    }
}

/// Result of applying the policy to one classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriageDecision {
    Escalate {
        category: EmergencyCategory,
        /// Confidence fell short of the threshold but the threshold is advisory.
        below_threshold: bool,
    },
    Dismiss(DismissReason),
}

/// Escalation gate plus the optional confidence threshold.
///
/// With `enforce_threshold` off the threshold is only reported, never applied,
/// so every emergency with a category escalates.
#[derive(Debug, Clone, Copy)]
pub struct TriagePolicy {
    pub confidence_threshold: f64,
    pub enforce_threshold: bool,
}

impl Default for TriagePolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            enforce_threshold: false,
        }
    }
}

impl TriagePolicy {
    pub fn new(confidence_threshold: f64, enforce_threshold: bool) -> Self {
        Self {
            confidence_threshold,
            enforce_threshold,
        }
    }

    pub fn decide(&self, result: &ClassificationResult) -> TriageDecision {
        if !should_escalate(result) {
            return TriageDecision::Dismiss(if result.is_emergency {
                DismissReason::MissingCategory
            } else {
                DismissReason::NotEmergency
            });
        }
        let Some(category) = result.category else {
            return TriageDecision::Dismiss(DismissReason::MissingCategory);
        };

        let below_threshold = result.confidence_score < self.confidence_threshold;
        if below_threshold && self.enforce_threshold {
            return TriageDecision::Dismiss(DismissReason::BelowThreshold);
        }
        TriageDecision::Escalate {
            category,
            below_threshold,
        }
    }
}
