//! Persistent per-session state: the iteration log, completion flags, and
//! the reviewer context handle.
//!
//! One `SessionState` maps to one JSON document under the state directory.
//! All mutation goes through `AuditEngine` while it holds the per-session
//! mutex; the invariants below are what any reader may rely on.

use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::models::completion::CompletionReason;
use crate::models::review::Review;

/// Current schema version for session state files.
/// Bump when adding/removing/modifying fields.
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// One appended `(thought, review)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub thought_number: u32,
    /// Hex SHA-256 of the normalized code extraction.
    pub code_fingerprint: String,
    /// The normalized code itself, kept for stagnation analysis.
    pub normalized_code: String,
    pub review: Review,
    pub timestamp_ms: i64,
}

/// Stagnation verdict, sticky once detected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagnationInfo {
    pub is_stagnant: bool,
    pub detected_at_loop: u32,
    /// Mean pairwise similarity over the analysis window, in [0, 1].
    pub similarity_score: f64,
    pub recommendation: String,
}

/// Durable state for one audit session, keyed by `branchId`.
///
/// Invariants:
/// - `iterations` is append-only; timestamps never decrease.
/// - `current_loop == iterations.len()` whenever a reader observes the state.
/// - once `is_complete` is true, no further iteration is appended.
/// - `codex_context_active` iff `codex_context_id` is set.
/// - `stagnation_info`, once stagnant, stays set until the session ends or
///   is explicitly reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub id: String,
    /// Last observed loop id, if the caller supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_id: Option<String>,
    #[serde(default)]
    pub config: SessionConfig,
    #[serde(default)]
    pub iterations: Vec<IterationRecord>,
    /// Always `iterations.len()`; persisted for human readability.
    #[serde(default)]
    pub current_loop: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codex_context_id: Option<String>,
    #[serde(default)]
    pub codex_context_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stagnation_info: Option<StagnationInfo>,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<CompletionReason>,
    /// Last engine failure recorded against this session, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

fn default_schema_version() -> u32 {
    SESSION_SCHEMA_VERSION
}

impl SessionState {
    /// Create a fresh session for `id`, optionally bound to a loop id.
    pub fn new(id: impl Into<String>, loop_id: Option<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            id: id.into(),
            loop_id,
            config: SessionConfig::default(),
            iterations: Vec::new(),
            current_loop: 0,
            codex_context_id: None,
            codex_context_active: false,
            stagnation_info: None,
            is_complete: false,
            completion_reason: None,
            last_error: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// Append one iteration, enforcing the append-only invariants.
    ///
    /// Rejected once the session is complete. Timestamps are clamped to be
    /// non-decreasing relative to the last record.
    pub fn append_iteration(&mut self, mut iter: IterationRecord) -> Result<()> {
        if self.is_complete {
            return Err(Error::SessionCorruption(format!(
                "session '{}' is complete; refusing to append iteration",
                self.id
            )));
        }
        if let Some(last) = self.iterations.last()
            && iter.timestamp_ms < last.timestamp_ms
        {
            iter.timestamp_ms = last.timestamp_ms;
        }
        self.iterations.push(iter);
        self.current_loop = self.iterations.len() as u32;
        self.touch();
        Ok(())
    }

    /// Record the reviewer context handle. Keeps the
    /// `active ⇔ id present` invariant.
    pub fn set_context_handle(&mut self, handle: Option<String>) {
        self.codex_context_active = handle.is_some();
        self.codex_context_id = handle;
        self.touch();
    }

    /// Mark the session terminal. Idempotent; the first reason wins.
    pub fn mark_complete(&mut self, reason: CompletionReason) {
        if !self.is_complete {
            self.is_complete = true;
            self.completion_reason = Some(reason);
        }
        self.touch();
    }

    /// Latest review, if any iteration has been recorded.
    pub fn latest_review(&self) -> Option<&Review> {
        self.iterations.last().map(|i| &i.review)
    }

    pub fn touch(&mut self) {
        let now = chrono::Utc::now().timestamp_millis();
        if now > self.updated_at_ms {
            self.updated_at_ms = now;
        }
    }

    /// Check the structural invariants; returns the list of violations.
    pub fn integrity_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.current_loop as usize != self.iterations.len() {
            issues.push(format!(
                "currentLoop {} does not match {} iterations",
                self.current_loop,
                self.iterations.len()
            ));
        }
        if self.codex_context_active != self.codex_context_id.is_some() {
            issues.push("codexContextActive inconsistent with codexContextId".to_string());
        }
        let mut prev_ts = i64::MIN;
        for (i, iter) in self.iterations.iter().enumerate() {
            if iter.timestamp_ms < prev_ts {
                issues.push(format!("iteration {i} timestamp decreases"));
            }
            prev_ts = iter.timestamp_ms;
        }
        if self.is_complete && self.completion_reason.is_none() {
            issues.push("isComplete set without completionReason".to_string());
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::review::Review;

    fn iteration(n: u32, ts: i64) -> IterationRecord {
        IterationRecord {
            thought_number: n,
            code_fingerprint: format!("{n:064x}"),
            normalized_code: format!("fn f{n}() {{}}"),
            review: Review::fallback("test"),
            timestamp_ms: ts,
        }
    }

    #[test]
    fn test_new_session_invariants() {
        let state = SessionState::new("s1", Some("L1".into()));
        assert_eq!(state.current_loop, 0);
        assert!(state.integrity_issues().is_empty());
        assert!(!state.codex_context_active);
    }

    #[test]
    fn test_append_keeps_current_loop_in_sync() {
        let mut state = SessionState::new("s1", None);
        state.append_iteration(iteration(1, 100)).unwrap();
        state.append_iteration(iteration(2, 200)).unwrap();
        assert_eq!(state.current_loop, 2);
        assert!(state.integrity_issues().is_empty());
    }

    #[test]
    fn test_append_clamps_decreasing_timestamp() {
        let mut state = SessionState::new("s1", None);
        state.append_iteration(iteration(1, 500)).unwrap();
        state.append_iteration(iteration(2, 100)).unwrap();
        assert_eq!(state.iterations[1].timestamp_ms, 500);
        assert!(state.integrity_issues().is_empty());
    }

    #[test]
    fn test_complete_session_rejects_append() {
        let mut state = SessionState::new("s1", None);
        state.append_iteration(iteration(1, 100)).unwrap();
        state.mark_complete(CompletionReason::MaxLoopsReached);
        assert!(state.append_iteration(iteration(2, 200)).is_err());
        assert_eq!(state.current_loop, 1);
    }

    #[test]
    fn test_mark_complete_first_reason_wins() {
        let mut state = SessionState::new("s1", None);
        state.mark_complete(CompletionReason::StagnationDetected);
        state.mark_complete(CompletionReason::MaxLoopsReached);
        assert_eq!(
            state.completion_reason,
            Some(CompletionReason::StagnationDetected)
        );
    }

    #[test]
    fn test_context_handle_invariant() {
        let mut state = SessionState::new("s1", None);
        state.set_context_handle(Some("ctx-1".into()));
        assert!(state.codex_context_active);
        state.set_context_handle(None);
        assert!(!state.codex_context_active);
        assert!(state.integrity_issues().is_empty());
    }

    #[test]
    fn test_persist_roundtrip_equality() {
        let mut state = SessionState::new("s1", Some("L1".into()));
        state.append_iteration(iteration(1, 100)).unwrap();
        state.set_context_handle(Some("ctx-1".into()));
        let json = serde_json::to_string_pretty(&state).unwrap();
        let back: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn test_integrity_detects_desync() {
        let mut state = SessionState::new("s1", None);
        state.append_iteration(iteration(1, 100)).unwrap();
        state.current_loop = 5;
        assert!(!state.integrity_issues().is_empty());
    }

    #[test]
    fn test_persisted_names_are_camel_case() {
        let state = SessionState::new("s1", None);
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("currentLoop").is_some());
        assert!(json.get("isComplete").is_some());
        assert!(json.get("createdAtMs").is_some());
    }
}
