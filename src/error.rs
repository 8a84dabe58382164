//! Error taxonomy for the audit server.
//!
//! Errors are kinds, not call sites: every fallible layer maps its failures
//! into one of these variants and the engine localizes all of them; a
//! `process_thought` call always produces a response envelope.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad thought shape. Rejected before any state mutation.
    #[error("invalid thought: {0}")]
    Validation(String),

    /// Reviewer binary not found, not executable, or persistently failing
    /// to spawn.
    #[error("reviewer unavailable: {0}")]
    ReviewerUnavailable(String),

    /// Reviewer deadline expired; the engine substitutes a fallback review.
    #[error("reviewer timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed reviewer output (empty bytes, non-JSON, or a reply that
    /// fails Review shape validation).
    #[error("failed to parse reviewer output: {0}")]
    Parse(String),

    /// Session state file unreadable or structurally invalid beyond what
    /// corruption recovery can repair.
    #[error("session state corrupted: {0}")]
    SessionCorruption(String),

    /// Context start/maintain/terminate failed. Never fatal to an audit.
    #[error("context lifecycle failed: {0}")]
    ContextLifecycle(String),

    /// Enhanced response assembly failed; the engine downgrades to the
    /// baseline + review envelope.
    #[error("response build failed: {0}")]
    ResponseBuild(String),

    /// Invalid configuration discovered at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for failures that should yield a conservative fallback review
    /// rather than abort the audit pass.
    pub fn recoverable_in_audit(&self) -> bool {
        matches!(
            self,
            Error::ReviewerUnavailable(_)
                | Error::Timeout(_)
                | Error::Parse(_)
                | Error::ContextLifecycle(_)
        )
    }
}
