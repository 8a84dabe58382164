//! Reviewer process integration: supervision, invocation, context
//! lifecycle, and repository context packing.

pub mod client;
pub mod context;
pub mod pack;
pub mod supervisor;

pub use client::{parse_review_reply, AuditRequest, ReviewerBackend, ReviewerClient};
pub use context::ContextManager;
pub use pack::{ContextPacker, GitContextPacker};
pub use supervisor::{ExecFailure, ExecOutcome, ExecRequest, ProcessSupervisor, SupervisorHealth};
