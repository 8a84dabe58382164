//! Reviewer client: turns an audit request into a reviewer prompt, runs
//! the reviewer through the supervisor, and parses the reply into a
//! validated [`Review`].
//!
//! The reviewer replies either with a single JSON object or with JSONL
//! where the final record tagged `"type": "agent_message"` carries the
//! review payload. The client never fabricates data: parse failures are
//! returned to the engine, which substitutes the fallback review.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::codex::supervisor::{ExecFailure, ExecRequest, ProcessSupervisor};
use crate::error::{Error, Result};
use crate::models::Review;

/// Everything the reviewer needs for one audit pass.
#[derive(Debug, Clone)]
pub struct AuditRequest {
    pub session_id: String,
    /// What the reviewer is asked to do, from the session config.
    pub task: String,
    /// Packed repository context. Truncated from the tail to fit the
    /// prompt budget.
    pub context: String,
    /// The candidate code under audit.
    pub candidate: String,
    /// Rubric dimension names the reviewer scores.
    pub judges: Vec<String>,
    pub working_dir: Option<std::path::PathBuf>,
}

/// Seam for the reviewer invocation so the engine can be driven by a test
/// double.
#[async_trait]
pub trait ReviewerBackend: Send + Sync {
    async fn review(&self, request: &AuditRequest, timeout: Duration) -> Result<Review>;
}

/// The production backend: the `codex` CLI as a child process.
pub struct ReviewerClient {
    supervisor: Arc<ProcessSupervisor>,
    binary: String,
    context_token_limit: usize,
}

/// Rough prompt accounting: four bytes per token.
const BYTES_PER_TOKEN: usize = 4;

const PROMPT_HEADER: &str = "You are an adversarial code auditor. Review the candidate code \
below against the stated task. Reply with a single JSON object: \
{\"overall\": 0-100, \"verdict\": \"pass\"|\"revise\"|\"reject\", \
\"dimensions\": [{\"name\", \"score\"}], \"review\": {\"summary\", \"inline\": \
[{\"path\", \"line\", \"comment\"}], \"citations\"}, \"proposedDiff\", \
\"judgeCards\": [{\"model\", \"score\", \"notes\"}]}. No prose outside the JSON.";

impl ReviewerClient {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        binary: String,
        context_token_limit: usize,
    ) -> Self {
        Self {
            supervisor,
            binary,
            context_token_limit,
        }
    }

    /// Assemble the reviewer prompt, clamped to the token budget by
    /// truncating the context section from the tail first.
    pub fn build_prompt(&self, request: &AuditRequest) -> String {
        let rubric = if request.judges.is_empty() {
            "overall".to_string()
        } else {
            request.judges.join(", ")
        };

        let fixed = format!(
            "{PROMPT_HEADER}\n\n## Task\n{}\n\n## Candidate\n{}\n\n## Rubric\nScore dimensions: {}\n",
            request.task, request.candidate, rubric
        );

        let budget = self.context_token_limit.saturating_mul(BYTES_PER_TOKEN);
        let context_budget = budget.saturating_sub(fixed.len());
        let context = truncate_tail(&request.context, context_budget);

        if context.is_empty() {
            fixed
        } else {
            format!(
                "{PROMPT_HEADER}\n\n## Task\n{}\n\n## Repository context\n{}\n\n## Candidate\n{}\n\n## Rubric\nScore dimensions: {}\n",
                request.task, context, request.candidate, rubric
            )
        }
    }
}

#[async_trait]
impl ReviewerBackend for ReviewerClient {
    async fn review(&self, request: &AuditRequest, timeout: Duration) -> Result<Review> {
        let prompt = self.build_prompt(request);
        debug!(
            session = %request.session_id,
            prompt_bytes = prompt.len(),
            "invoking reviewer"
        );

        let outcome = self
            .supervisor
            .execute(ExecRequest {
                command: self.binary.clone(),
                args: vec!["exec".to_string(), "--json".to_string()],
                env: Vec::new(),
                cwd: request.working_dir.clone(),
                stdin_data: Some(prompt),
                timeout,
            })
            .await;

        if outcome.timed_out {
            return Err(Error::Timeout(timeout));
        }
        match outcome.failure {
            Some(ExecFailure::NotFound) => {
                return Err(Error::ReviewerUnavailable(format!(
                    "'{}' not found on PATH",
                    self.binary
                )));
            }
            Some(ExecFailure::Permission) => {
                return Err(Error::ReviewerUnavailable(format!(
                    "'{}' is not executable",
                    self.binary
                )));
            }
            Some(ExecFailure::BadCwd) => {
                return Err(Error::ReviewerUnavailable(
                    "reviewer working directory missing".to_string(),
                ));
            }
            Some(ExecFailure::QueueTimeout) => {
                return Err(Error::ReviewerUnavailable(
                    "no reviewer process slot became available".to_string(),
                ));
            }
            Some(ExecFailure::Spawn(e)) => {
                return Err(Error::ReviewerUnavailable(e));
            }
            None => {}
        }
        if outcome.exit_code != 0 {
            warn!(
                session = %request.session_id,
                exit = outcome.exit_code,
                "reviewer exited nonzero"
            );
            return Err(Error::ReviewerUnavailable(format!(
                "reviewer exited with code {}: {}",
                outcome.exit_code,
                outcome.stderr.trim()
            )));
        }

        parse_review_reply(&outcome.stdout)
    }
}

/// Parse the reviewer's reply: a bare JSON object, or JSONL whose final
/// `agent_message` record carries the payload.
pub fn parse_review_reply(raw: &str) -> Result<Review> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Parse("reviewer returned empty output".to_string()));
    }

    // Whole-body JSON object first.
    if let Ok(review) = serde_json::from_str::<Review>(trimmed) {
        review.validate()?;
        return Ok(review);
    }

    // JSONL: scan for the final agent_message record.
    let mut payload: Option<String> = None;
    for line in trimmed.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if value.get("type").and_then(|t| t.as_str()) == Some("agent_message")
            && let Some(text) = message_text(&value)
        {
            payload = Some(text);
        }
    }

    let Some(payload) = payload else {
        return Err(Error::Parse(
            "reviewer output contained no parseable review or agent_message record".to_string(),
        ));
    };

    let body = strip_code_fences(&payload);
    let review: Review = serde_json::from_str(&body)
        .map_err(|e| Error::Parse(format!("agent_message payload is not a review: {e}")))?;
    review.validate()?;
    Ok(review)
}

/// The message body field varies across reviewer versions.
fn message_text(value: &serde_json::Value) -> Option<String> {
    for field in ["message", "content", "text"] {
        if let Some(s) = value.get(field).and_then(|v| v.as_str()) {
            return Some(s.to_string());
        }
    }
    None
}

/// Remove a surrounding markdown code fence, returning the inner content.
fn strip_code_fences(input: &str) -> String {
    let trimmed = input.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let after_tag = match rest.find('\n') {
            Some(pos) => &rest[pos + 1..],
            None => return String::new(),
        };
        if let Some(pos) = after_tag.rfind("```") {
            return after_tag[..pos].trim().to_string();
        }
        return after_tag.trim().to_string();
    }
    trimmed.to_string()
}

/// Truncate UTF-8 text to at most `budget` bytes, dropping from the tail.
fn truncate_tail(text: &str, budget: usize) -> &str {
    if text.len() <= budget {
        return text;
    }
    let mut cut = budget;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}
