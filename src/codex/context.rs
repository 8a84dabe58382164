//! Reviewer context lifecycle, keyed by the caller's loop id.
//!
//! The reviewer keeps cross-iteration state in "contexts" addressed by an
//! opaque handle. This manager maps `loopId → handle`, drives the
//! reviewer's `context start|maintain|terminate|status` sub-commands
//! through the supervisor, and sweeps handles the reviewer has forgotten.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codex::supervisor::{ExecRequest, ProcessSupervisor};
use crate::error::{Error, Result};

/// Stderr marker meaning the reviewer no longer knows the handle.
const CONTEXT_NOT_FOUND: &str = "context not found";

/// Deadline for context sub-commands, which should be near-instant.
const CONTEXT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ContextManager {
    supervisor: Arc<ProcessSupervisor>,
    binary: String,
    handles: Mutex<HashMap<String, String>>,
}

impl ContextManager {
    pub fn new(supervisor: Arc<ProcessSupervisor>, binary: String) -> Self {
        Self {
            supervisor,
            binary,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// The handle currently mapped to a loop id, if any.
    pub async fn handle_for(&self, loop_id: &str) -> Option<String> {
        self.handles.lock().await.get(loop_id).cloned()
    }

    /// Start a reviewer context for a loop id. Empty output from the child
    /// is a hard failure; a successful start records the handle.
    pub async fn start(&self, loop_id: &str) -> Result<String> {
        let outcome = self
            .run_subcommand(&["context", "start", "--loop-id", loop_id], None)
            .await;

        if !outcome.success() {
            return Err(Error::ContextLifecycle(format!(
                "context start for '{loop_id}' failed: {}",
                outcome.stderr.trim()
            )));
        }
        let handle = outcome.stdout.trim().to_string();
        if handle.is_empty() {
            return Err(Error::ContextLifecycle(format!(
                "context start for '{loop_id}' returned no handle"
            )));
        }

        self.handles
            .lock()
            .await
            .insert(loop_id.to_string(), handle.clone());
        info!(loop_id, handle = %handle, "reviewer context started");
        Ok(handle)
    }

    /// Keep a context alive. Most failures are non-fatal; the literal
    /// "context not found" clears the mapping so the next call re-starts.
    pub async fn maintain(&self, loop_id: &str, handle: &str) -> Result<()> {
        let outcome = self
            .run_subcommand(&["context", "maintain", "--context-id", handle], None)
            .await;

        if outcome.success() {
            return Ok(());
        }

        if outcome.stderr.contains(CONTEXT_NOT_FOUND) {
            warn!(loop_id, handle, "reviewer dropped context; clearing handle");
            self.handles.lock().await.remove(loop_id);
            return Err(Error::ContextLifecycle(format!(
                "context '{handle}' not found for loop '{loop_id}'"
            )));
        }

        // Transient failure: keep the handle, report upward for logging.
        debug!(
            loop_id,
            handle,
            stderr = %outcome.stderr.trim(),
            "context maintain failed transiently"
        );
        Err(Error::ContextLifecycle(format!(
            "context maintain for '{loop_id}' failed: {}",
            outcome.stderr.trim()
        )))
    }

    /// Terminate a context. The local mapping is removed even when the
    /// reviewer call fails.
    pub async fn terminate(&self, loop_id: &str, reason: &str) -> Result<()> {
        let handle = self.handles.lock().await.remove(loop_id);
        let Some(handle) = handle else {
            return Ok(());
        };

        let outcome = self
            .run_subcommand(
                &[
                    "context",
                    "terminate",
                    "--context-id",
                    &handle,
                    "--reason",
                    reason,
                ],
                None,
            )
            .await;

        if !outcome.success() {
            warn!(
                loop_id,
                handle = %handle,
                "context terminate failed; mapping removed anyway"
            );
            return Err(Error::ContextLifecycle(format!(
                "context terminate for '{loop_id}' failed: {}",
                outcome.stderr.trim()
            )));
        }
        info!(loop_id, reason, "reviewer context terminated");
        Ok(())
    }

    /// Ask the reviewer which handles it still knows and drop the rest.
    /// Called periodically by the server's sweeper.
    pub async fn sweep(&self) {
        let snapshot: Vec<(String, String)> = self
            .handles
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (loop_id, handle) in snapshot {
            let outcome = self
                .run_subcommand(&["context", "status", "--context-id", &handle], None)
                .await;
            if !outcome.success() || outcome.stderr.contains(CONTEXT_NOT_FOUND) {
                warn!(loop_id = %loop_id, handle = %handle, "sweeping stale reviewer context");
                self.handles.lock().await.remove(&loop_id);
            }
        }
    }

    /// Terminate every context in parallel, e.g. at shutdown.
    pub async fn terminate_all(&self, reason: &str) {
        let loop_ids: Vec<String> = self.handles.lock().await.keys().cloned().collect();
        if loop_ids.is_empty() {
            return;
        }
        info!(count = loop_ids.len(), reason, "terminating all reviewer contexts");
        let results = join_all(
            loop_ids
                .iter()
                .map(|loop_id| self.terminate(loop_id, reason)),
        )
        .await;
        for (loop_id, result) in loop_ids.iter().zip(results) {
            if let Err(e) = result {
                warn!(loop_id = %loop_id, "terminate during shutdown failed: {e}");
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.handles.lock().await.len()
    }

    async fn run_subcommand(
        &self,
        args: &[&str],
        stdin: Option<String>,
    ) -> crate::codex::supervisor::ExecOutcome {
        self.supervisor
            .execute(ExecRequest {
                command: self.binary.clone(),
                args: args.iter().map(|s| s.to_string()).collect(),
                env: Vec::new(),
                cwd: None,
                stdin_data: stdin,
                timeout: CONTEXT_COMMAND_TIMEOUT,
            })
            .await
    }
}
