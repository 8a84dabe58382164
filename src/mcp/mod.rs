//! MCP server module exposing the audit loop to AI assistants.
//!
//! One tool, `gansauditor_codex`, routed over the stdio transport.

pub mod server;

pub use server::{AuditThoughtParams, GansAuditorServer};
