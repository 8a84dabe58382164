//! GansAuditor MCP Server implementation.
//!
//! Exposes the `gansauditor_codex` tool over the MCP stdio transport and
//! owns the periodic sweepers plus the shutdown cascade.

use rmcp::{
    handler::server::router::tool::ToolRouter,
    model::{
        CallToolResult, Content, ErrorData, Implementation, Role, ServerCapabilities, ServerInfo,
    },
    schemars::JsonSchema,
    tool, tool_handler, tool_router, ServerHandler,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::AuditEngine;
use crate::codex::{ContextManager, GitContextPacker, ProcessSupervisor, ReviewerClient};
use crate::config::AuditorConfig;
use crate::models::Thought;
use crate::session::SessionStore;

// ============================================================================
// Tool Parameters
// ============================================================================

/// Parameters for the gansauditor_codex tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditThoughtParams {
    /// The current reasoning step, optionally carrying code to audit.
    pub thought: String,
    /// Whether the caller intends to continue. The engine may override
    /// this in the response.
    pub next_thought_needed: bool,
    /// Position of this thought in the sequence (1-indexed).
    pub thought_number: u32,
    /// Estimated total thoughts; raised automatically when overshot.
    pub total_thoughts: u32,
    /// Whether this thought revises an earlier one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_revision: Option<bool>,
    /// The thought number being revised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revises_thought: Option<u32>,
    /// The thought number this branch forked from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_from_thought: Option<u32>,
    /// Session key; audits on the same branchId share one iteration log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Binds iterations to a reusable reviewer-side context window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_id: Option<String>,
    /// Opaque bookkeeping flag, echoed unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_more_thoughts: Option<bool>,
}

impl From<AuditThoughtParams> for Thought {
    fn from(params: AuditThoughtParams) -> Self {
        Thought {
            thought: params.thought,
            thought_number: params.thought_number,
            total_thoughts: params.total_thoughts,
            next_thought_needed: params.next_thought_needed,
            is_revision: params.is_revision,
            revises_thought: params.revises_thought,
            branch_from_thought: params.branch_from_thought,
            branch_id: params.branch_id,
            loop_id: params.loop_id,
            needs_more_thoughts: params.needs_more_thoughts,
        }
    }
}

// ============================================================================
// Server Implementation
// ============================================================================

/// GansAuditor MCP Server
///
/// Routes `tools/call` on `gansauditor_codex` to the audit engine and
/// sweeps stale sessions and reviewer contexts in the background.
#[derive(Clone)]
pub struct GansAuditorServer {
    tool_router: ToolRouter<Self>,
    engine: Arc<AuditEngine>,
    shutdown: CancellationToken,
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for GansAuditorServer {
    fn get_info(&self) -> ServerInfo {
        let instructions = r#"GansAuditor: iterative code-audit loop driven by the codex reviewer.

Submit each reasoning step as a thought. Thoughts carrying code are audited
synchronously; the response reports the verdict, completion status, and
whether another iteration is worthwhile. Use branchId to keep a session's
iteration log together and loopId to reuse a reviewer context window across
iterations. An inline ```gan-config``` block tunes the audit per session.
"#
        .to_string();

        ServerInfo {
            server_info: Implementation {
                name: "gansauditor-codex".to_string(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                title: Some("GansAuditor Codex".to_string()),
                icons: None,
                website_url: None,
            },
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(instructions),
            ..Default::default()
        }
    }
}

#[tool_router(router = tool_router)]
impl GansAuditorServer {
    /// Wire the full component stack from a resolved configuration.
    pub fn new(config: AuditorConfig) -> anyhow::Result<Self> {
        let supervisor = Arc::new(ProcessSupervisor::new(
            config.audit.max_concurrent_audits,
            Duration::from_millis(config.codex.queue_timeout_ms),
            Duration::from_millis(config.codex.process_cleanup_timeout_ms),
        ));
        let store = Arc::new(SessionStore::new(config.session.state_directory.clone())?);
        let cache = Arc::new(crate::audit::AuditCache::new(config.cache.clone()));
        let reviewer = Arc::new(ReviewerClient::new(
            Arc::clone(&supervisor),
            config.codex.binary.clone(),
            config.codex.context_token_limit,
        ));
        let contexts = Arc::new(ContextManager::new(
            Arc::clone(&supervisor),
            config.codex.binary.clone(),
        ));
        let packer = Arc::new(GitContextPacker::new(Arc::clone(&supervisor), None));

        let engine = Arc::new(AuditEngine::new(
            config.clone(),
            store,
            cache,
            reviewer,
            contexts,
            packer,
            supervisor,
        ));

        let server = Self {
            tool_router: Self::tool_router(),
            engine,
            shutdown: CancellationToken::new(),
        };
        server.spawn_sweepers(config.session.sweep_interval_secs);
        Ok(server)
    }

    /// Build a server around an existing engine (tests inject doubles).
    pub fn with_engine(engine: Arc<AuditEngine>, sweep_interval_secs: u64) -> Self {
        let server = Self {
            tool_router: Self::tool_router(),
            engine,
            shutdown: CancellationToken::new(),
        };
        server.spawn_sweepers(sweep_interval_secs);
        server
    }

    /// Periodic maintenance: stale reviewer contexts and idle session
    /// files, on the same cadence. Sweeper failures never stop the server.
    fn spawn_sweepers(&self, interval_secs: u64) {
        let engine = Arc::clone(&self.engine);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("sweeper cancelled");
                        return;
                    }
                    _ = ticker.tick() => {
                        engine.contexts().sweep().await;
                        let removed = engine.sweep_sessions();
                        if removed > 0 {
                            info!(removed, "session sweeper removed stale files");
                        }
                    }
                }
            }
        });
    }

    /// Cancel the sweepers and tear down children and reviewer contexts.
    pub async fn shutdown(&self) {
        info!("shutting down: cancelling sweepers, terminating children and contexts");
        self.shutdown.cancel();
        self.engine.contexts().terminate_all("shutdown").await;
        self.engine.supervisor().terminate_all().await;
    }

    /// Submit one thought to the audit loop. Thoughts carrying code are
    /// audited against the reviewer; the response carries the verdict,
    /// completion status, and loop guidance.
    #[tool(
        name = "gansauditor_codex",
        description = "Iterative code audit. Submit a reasoning step ('thought'); steps containing code are reviewed by the codex auditor. The response echoes the thought bookkeeping and adds the audit verdict, completion status, stagnation info, and structured feedback. Use branchId for session continuity and loopId to reuse a reviewer context."
    )]
    pub async fn gansauditor_codex(
        &self,
        params: rmcp::handler::server::wrapper::Parameters<AuditThoughtParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let envelope = self.engine.process_thought(params.0.into()).await;
        let is_error = envelope.get("error").is_some();
        let text = serde_json::to_string_pretty(&envelope)
            .unwrap_or_else(|e| format!("{{\"error\": \"serialization failed: {e}\"}}"));

        if is_error {
            warn!("thought rejected: {text}");
            Ok(CallToolResult::error(vec![Content::text(text)]))
        } else {
            Ok(CallToolResult::success(vec![
                Content::text(text).with_audience(vec![Role::Assistant])
            ]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_convert_to_thought() {
        let params = AuditThoughtParams {
            thought: "check this".to_string(),
            next_thought_needed: true,
            thought_number: 2,
            total_thoughts: 4,
            is_revision: Some(true),
            revises_thought: Some(1),
            branch_from_thought: None,
            branch_id: Some("b1".to_string()),
            loop_id: Some("L1".to_string()),
            needs_more_thoughts: None,
        };
        let thought: Thought = params.into();
        assert_eq!(thought.thought_number, 2);
        assert_eq!(thought.branch_id.as_deref(), Some("b1"));
        assert_eq!(thought.loop_id.as_deref(), Some("L1"));
        assert_eq!(thought.is_revision, Some(true));
    }

    #[test]
    fn test_params_wire_names() {
        let json = r#"{
            "thought": "x",
            "nextThoughtNeeded": false,
            "thoughtNumber": 1,
            "totalThoughts": 1,
            "branchId": "b"
        }"#;
        let params: AuditThoughtParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.branch_id.as_deref(), Some("b"));
        assert!(!params.next_thought_needed);
    }
}
