//! Repository context packing.
//!
//! The audit engine consumes context through this one seam; the default
//! implementation shells out to git through the supervisor. Scope
//! semantics: `diff` packs the working-tree diff, `paths` packs the named
//! files, `workspace` packs the tracked file listing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::codex::supervisor::{ExecRequest, ProcessSupervisor};
use crate::config::AuditScope;
use crate::error::Result;

/// Per-file ceiling when packing explicit paths.
const MAX_CHARS_PER_FILE: usize = 32 * 1024;

const GIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait ContextPacker: Send + Sync {
    /// Pack repository context for the given scope. Failures degrade to an
    /// empty context; auditing proceeds without it.
    async fn pack(&self, scope: AuditScope, paths: &[String]) -> Result<String>;
}

/// Git-backed packer running through the process supervisor.
pub struct GitContextPacker {
    supervisor: Arc<ProcessSupervisor>,
    working_dir: Option<PathBuf>,
}

impl GitContextPacker {
    pub fn new(supervisor: Arc<ProcessSupervisor>, working_dir: Option<PathBuf>) -> Self {
        Self {
            supervisor,
            working_dir,
        }
    }

    async fn git(&self, args: &[&str]) -> Option<String> {
        let outcome = self
            .supervisor
            .execute(ExecRequest {
                command: "git".to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                env: Vec::new(),
                cwd: self.working_dir.clone(),
                stdin_data: None,
                timeout: GIT_COMMAND_TIMEOUT,
            })
            .await;
        if outcome.success() {
            Some(outcome.stdout)
        } else {
            debug!(stderr = %outcome.stderr.trim(), "git call failed; packing empty context");
            None
        }
    }

    fn read_path(&self, path: &str) -> Option<String> {
        let resolved = match &self.working_dir {
            Some(dir) => dir.join(path),
            None => PathBuf::from(path),
        };
        let content = std::fs::read_to_string(&resolved).ok()?;
        let clipped: String = content.chars().take(MAX_CHARS_PER_FILE).collect();
        Some(format!("### {path}\n{clipped}\n"))
    }
}

#[async_trait]
impl ContextPacker for GitContextPacker {
    async fn pack(&self, scope: AuditScope, paths: &[String]) -> Result<String> {
        let packed = match scope {
            AuditScope::Diff => self.git(&["diff", "HEAD"]).await.unwrap_or_default(),
            AuditScope::Workspace => self
                .git(&["ls-files"])
                .await
                .map(|listing| format!("Tracked files:\n{listing}"))
                .unwrap_or_default(),
            AuditScope::Paths => paths
                .iter()
                .filter_map(|p| self.read_path(p))
                .collect::<Vec<_>>()
                .join("\n"),
        };
        Ok(packed)
    }
}
