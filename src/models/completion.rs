//! Completion and termination result types.

use serde::{Deserialize, Serialize};

/// Why the engine considers a session finished (or not yet).
///
/// Serialized as the literal reason strings carried in the response
/// envelope's `completionStatus.reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionReason {
    #[serde(rename = "score_95_at_10")]
    Score95At10,
    #[serde(rename = "score_90_at_15")]
    Score90At15,
    #[serde(rename = "score_85_at_20")]
    Score85At20,
    #[serde(rename = "stagnation_detected")]
    StagnationDetected,
    #[serde(rename = "max_loops_reached")]
    MaxLoopsReached,
    #[serde(rename = "in_progress")]
    InProgress,
}

impl std::fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompletionReason::Score95At10 => "score_95_at_10",
            CompletionReason::Score90At15 => "score_90_at_15",
            CompletionReason::Score85At20 => "score_85_at_20",
            CompletionReason::StagnationDetected => "stagnation_detected",
            CompletionReason::MaxLoopsReached => "max_loops_reached",
            CompletionReason::InProgress => "in_progress",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one completion evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    pub is_complete: bool,
    pub reason: CompletionReason,
    pub next_thought_needed: bool,
    pub message: String,
}

/// Outcome of the termination check run after each iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationResult {
    pub should_terminate: bool,
    pub reason: String,
    /// Fraction of iterations whose verdict was `reject`, in [0, 1].
    pub failure_rate: f64,
    pub critical_issues: Vec<String>,
    pub final_assessment: String,
}

impl TerminationResult {
    /// The non-terminating result: empty reason, zero failure rate.
    pub fn none() -> Self {
        Self {
            should_terminate: false,
            reason: String::new(),
            failure_rate: 0.0,
            critical_issues: Vec::new(),
            final_assessment: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_wire_strings() {
        for (reason, expected) in [
            (CompletionReason::Score95At10, "\"score_95_at_10\""),
            (CompletionReason::Score90At15, "\"score_90_at_15\""),
            (CompletionReason::Score85At20, "\"score_85_at_20\""),
            (CompletionReason::StagnationDetected, "\"stagnation_detected\""),
            (CompletionReason::MaxLoopsReached, "\"max_loops_reached\""),
            (CompletionReason::InProgress, "\"in_progress\""),
        ] {
            assert_eq!(serde_json::to_string(&reason).unwrap(), expected);
        }
    }

    #[test]
    fn test_display_matches_wire() {
        let reason = CompletionReason::StagnationDetected;
        let wire = serde_json::to_string(&reason).unwrap();
        assert_eq!(wire, format!("\"{reason}\""));
    }

    #[test]
    fn test_none_termination() {
        let t = TerminationResult::none();
        assert!(!t.should_terminate);
        assert_eq!(t.failure_rate, 0.0);
        assert!(t.critical_issues.is_empty());
    }
}
