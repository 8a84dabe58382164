//! Outbound envelope assembly.
//!
//! The builder is a pure function from the engine's gathered state to the
//! response JSON. When enhanced assembly fails the engine falls back to
//! [`build_degraded`], which carries only the baseline echo and the review.

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::models::{CompletionResult, Review, SessionState, TerminationResult, Verdict};

/// Fields echoed on every response, audited or not.
#[derive(Debug, Clone)]
pub struct BaselineEcho {
    pub thought_number: u32,
    pub total_thoughts: u32,
    pub next_thought_needed: bool,
    pub branches: Vec<String>,
    pub thought_history_length: usize,
}

/// What one audit pass produced, beyond the review itself.
#[derive(Debug, Clone)]
pub struct AuditOutcome {
    pub review: Review,
    pub cached: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// True when the review is a conservative substitute, not reviewer
    /// output. Fallback reviews are never cached.
    pub fallback: bool,
}

/// Baseline envelope for thoughts that skip auditing.
pub fn build_baseline(echo: &BaselineEcho) -> Value {
    json!({
        "thoughtNumber": echo.thought_number,
        "totalThoughts": echo.total_thoughts,
        "nextThoughtNeeded": echo.next_thought_needed,
        "branches": echo.branches,
        "thoughtHistoryLength": echo.thought_history_length,
    })
}

/// Full envelope: baseline echo plus the audit extension.
pub fn build_enhanced(
    echo: &BaselineEcho,
    session: &SessionState,
    outcome: &AuditOutcome,
    completion: &CompletionResult,
    termination: Option<&TerminationResult>,
) -> Result<Value> {
    let gan = serde_json::to_value(&outcome.review)?;

    let mut envelope = build_baseline(echo);
    let obj = envelope
        .as_object_mut()
        .ok_or_else(|| Error::ResponseBuild("baseline is not an object".to_string()))?;

    obj.insert("sessionId".to_string(), json!(session.id));
    obj.insert("gan".to_string(), gan);
    obj.insert(
        "completionStatus".to_string(),
        json!({
            "isComplete": completion.is_complete,
            "reason": completion.reason,
            "currentLoop": session.current_loop,
            "score": outcome.review.overall,
            "message": completion.message,
        }),
    );

    let mut loop_info = json!({
        "currentLoop": session.current_loop,
        "stagnationDetected": session
            .stagnation_info
            .as_ref()
            .map(|s| s.is_stagnant)
            .unwrap_or(false),
    });
    if let Some(stagnation) = &session.stagnation_info {
        let info = loop_info
            .as_object_mut()
            .ok_or_else(|| Error::ResponseBuild("loopInfo is not an object".to_string()))?;
        info.insert("similarityScore".to_string(), json!(stagnation.similarity_score));
        info.insert(
            "recommendation".to_string(),
            json!(stagnation.recommendation),
        );
    }
    obj.insert("loopInfo".to_string(), loop_info);

    obj.insert("feedback".to_string(), build_feedback(outcome));

    if let Some(termination) = termination
        && termination.should_terminate
    {
        obj.insert(
            "terminationInfo".to_string(),
            json!({
                "reason": termination.reason,
                "failureRate": termination.failure_rate,
                "criticalIssues": termination.critical_issues,
                "finalAssessment": termination.final_assessment,
            }),
        );
    }

    Ok(envelope)
}

/// Baseline + review only, for when enhanced assembly failed.
pub fn build_degraded(echo: &BaselineEcho, review: &Review) -> Value {
    let mut envelope = build_baseline(echo);
    if let Some(obj) = envelope.as_object_mut() {
        obj.insert(
            "gan".to_string(),
            serde_json::to_value(review).unwrap_or(Value::Null),
        );
    }
    envelope
}

/// Validation failures produce a formatted error envelope; no state was
/// touched.
pub fn build_error(message: &str) -> Value {
    json!({
        "error": message,
        "status": "failed",
    })
}

fn build_feedback(outcome: &AuditOutcome) -> Value {
    let review = &outcome.review;
    let mut improvements: Vec<String> = review
        .review
        .inline
        .iter()
        .map(|c| format!("{}:{} {}", c.path, c.line, c.comment))
        .collect();
    if improvements.is_empty()
        && review.verdict != Verdict::Pass
        && !review.review.summary.is_empty()
    {
        improvements.push(review.review.summary.clone());
    }

    let mut feedback = json!({
        "improvements": improvements,
        "summary": review.review.summary,
        "citations": review.review.citations,
        "cached": outcome.cached,
        "timedOut": outcome.timed_out,
        "fallback": outcome.fallback,
        "durationMs": outcome.duration_ms,
    });
    if let Some(diff) = &review.proposed_diff
        && let Some(obj) = feedback.as_object_mut()
    {
        obj.insert("proposedDiff".to_string(), json!(diff));
    }
    feedback
}
