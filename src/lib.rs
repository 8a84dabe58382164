pub mod audit;
pub mod codex;
pub mod config;
pub mod error;
pub mod mcp;
pub mod models;
pub mod session;

// Re-export main types
pub use audit::{
    AuditCache, AuditEngine, AuditOutcome, BaselineEcho, CompletionEvaluator, StagnationDetector,
};
pub use codex::{
    AuditRequest, ContextManager, ContextPacker, GitContextPacker, ProcessSupervisor,
    ReviewerBackend, ReviewerClient,
};
pub use config::{AuditorConfig, SessionConfig};
pub use error::{Error, Result};
pub use models::{
    CompletionReason, CompletionResult, Review, SessionState, TerminationResult, Thought, Verdict,
};
pub use session::SessionStore;

// Re-export MCP server
pub use mcp::GansAuditorServer;
