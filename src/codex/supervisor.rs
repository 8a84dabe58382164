//! Bounded child-process supervisor for reviewer invocations.
//!
//! At most `max_concurrent_audits` children run at any time; excess
//! requests queue FIFO behind a fair semaphore and fail with a queue
//! timeout instead of waiting forever. Timed-out children get a graceful
//! signal, then a force kill after the cleanup grace period. Execution
//! never throws: every failure is reported through [`ExecOutcome`] fields.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

// ============================================================================
// Request / Outcome
// ============================================================================

/// One child-process execution request.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Written to the child's stdin, which is then closed.
    pub stdin_data: Option<String>,
    pub timeout: Duration,
}

/// Why an execution failed, when it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecFailure {
    /// Executable not found.
    NotFound,
    /// Executable not permitted.
    Permission,
    /// Working directory missing.
    BadCwd,
    /// The request waited longer than `queue_timeout` for a process slot.
    QueueTimeout,
    /// Other spawn or wait error.
    Spawn(String),
}

/// Result of one execution. `exit_code` is -1 whenever the child never
/// produced a real status.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub failure: Option<ExecFailure>,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && self.failure.is_none()
    }

    fn failed(failure: ExecFailure, duration_ms: u64) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            timed_out: false,
            duration_ms,
            failure: Some(failure),
        }
    }
}

// ============================================================================
// Health
// ============================================================================

/// Point-in-time supervisor health.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorHealth {
    pub active: usize,
    pub total_executed: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_duration_ms: f64,
    pub last_duration_ms: u64,
    /// Under the concurrency cap and failing less than half the time.
    pub is_healthy: bool,
}

#[derive(Default)]
struct Metrics {
    active: usize,
    total_executed: u64,
    successful: u64,
    failed: u64,
    total_duration_ms: u64,
    last_duration_ms: u64,
}

// ============================================================================
// Supervisor
// ============================================================================

pub struct ProcessSupervisor {
    max_concurrent: usize,
    queue_timeout: Duration,
    cleanup_timeout: Duration,
    slots: Arc<Semaphore>,
    metrics: Arc<Mutex<Metrics>>,
    /// Process-group ids of live children, for `terminate_all`.
    live: Arc<Mutex<HashSet<i32>>>,
}

impl ProcessSupervisor {
    pub fn new(max_concurrent: usize, queue_timeout: Duration, cleanup_timeout: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            max_concurrent,
            queue_timeout,
            cleanup_timeout,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            metrics: Arc::new(Mutex::new(Metrics::default())),
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Execute one child process under the concurrency cap.
    ///
    /// Never returns an error: spawn failures, queue timeouts, and deadline
    /// expiry are all reported through the outcome fields.
    pub async fn execute(&self, request: ExecRequest) -> ExecOutcome {
        let queued = Instant::now();
        let permit = match tokio::time::timeout(self.queue_timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                let outcome = ExecOutcome::failed(
                    ExecFailure::QueueTimeout,
                    queued.elapsed().as_millis() as u64,
                );
                self.record(&outcome, false);
                return outcome;
            }
        };

        {
            let mut metrics = self.metrics.lock().expect("metrics mutex poisoned");
            metrics.active += 1;
        }
        let outcome = self.run_child(&request).await;
        {
            let mut metrics = self.metrics.lock().expect("metrics mutex poisoned");
            metrics.active -= 1;
        }
        self.record(&outcome, true);
        drop(permit);
        outcome
    }

    async fn run_child(&self, request: &ExecRequest) -> ExecOutcome {
        let started = Instant::now();

        // Fail fast on a missing working directory; spawning would report
        // it as a generic NotFound otherwise.
        if let Some(cwd) = &request.cwd
            && !cwd.is_dir()
        {
            return ExecOutcome::failed(ExecFailure::BadCwd, started.elapsed().as_millis() as u64);
        }

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .stdin(if request.stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let failure = match e.kind() {
                    std::io::ErrorKind::NotFound => ExecFailure::NotFound,
                    std::io::ErrorKind::PermissionDenied => ExecFailure::Permission,
                    _ => ExecFailure::Spawn(e.to_string()),
                };
                return ExecOutcome::failed(failure, started.elapsed().as_millis() as u64);
            }
        };

        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        if pid > 0 {
            self.live.lock().expect("live set poisoned").insert(pid);
        }

        if let Some(data) = &request.stdin_data
            && let Some(mut stdin) = child.stdin.take()
        {
            let data = data.clone();
            tokio::spawn(async move {
                let _ = stdin.write_all(data.as_bytes()).await;
                // Dropping stdin closes the pipe and unblocks the child.
            });
        }

        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut stdout = stdout;
            let _ = stdout.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut stderr = stderr;
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let mut timed_out = false;
        let status = match tokio::time::timeout(request.timeout, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!("wait failed for '{}': {e}", request.command);
                None
            }
            Err(_) => {
                timed_out = true;
                debug!(
                    "'{}' exceeded {:?}; sending graceful signal",
                    request.command, request.timeout
                );
                Self::signal_group(pid, GroupSignal::Term);
                match tokio::time::timeout(self.cleanup_timeout, child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    _ => {
                        warn!(
                            "'{}' survived graceful signal; force killing",
                            request.command
                        );
                        Self::signal_group(pid, GroupSignal::Kill);
                        child.wait().await.ok()
                    }
                }
            }
        };

        if pid > 0 {
            self.live.lock().expect("live set poisoned").remove(&pid);
        }

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);

        ExecOutcome {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            timed_out,
            duration_ms: started.elapsed().as_millis() as u64,
            failure: None,
        }
    }

    /// Gracefully stop every live child, force-kill stragglers after the
    /// cleanup grace period, and wait until all are reaped.
    pub async fn terminate_all(&self) {
        let pids: Vec<i32> = self
            .live
            .lock()
            .expect("live set poisoned")
            .iter()
            .copied()
            .collect();
        if pids.is_empty() {
            return;
        }
        debug!("terminating {} live reviewer processes", pids.len());

        for pid in &pids {
            Self::signal_group(*pid, GroupSignal::Term);
        }
        tokio::time::sleep(self.cleanup_timeout).await;
        for pid in &pids {
            if self.live.lock().expect("live set poisoned").contains(pid) {
                Self::signal_group(*pid, GroupSignal::Kill);
            }
        }

        // Children are reaped by their owning execute() calls; wait for the
        // live set to drain, bounded by one more cleanup period.
        let deadline = Instant::now() + self.cleanup_timeout;
        while Instant::now() < deadline {
            if self.live.lock().expect("live set poisoned").is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        warn!("some reviewer processes were not reaped before the cleanup deadline");
    }

    pub fn health(&self) -> SupervisorHealth {
        let metrics = self.metrics.lock().expect("metrics mutex poisoned");
        let average_duration_ms = if metrics.total_executed == 0 {
            0.0
        } else {
            metrics.total_duration_ms as f64 / metrics.total_executed as f64
        };
        let failing = metrics.total_executed >= 4
            && metrics.failed * 2 > metrics.total_executed;
        SupervisorHealth {
            active: metrics.active,
            total_executed: metrics.total_executed,
            successful: metrics.successful,
            failed: metrics.failed,
            average_duration_ms,
            last_duration_ms: metrics.last_duration_ms,
            is_healthy: metrics.active <= self.max_concurrent && !failing,
        }
    }

    pub fn active_count(&self) -> usize {
        self.metrics.lock().expect("metrics mutex poisoned").active
    }

    fn record(&self, outcome: &ExecOutcome, ran: bool) {
        let mut metrics = self.metrics.lock().expect("metrics mutex poisoned");
        metrics.total_executed += 1;
        if outcome.success() {
            metrics.successful += 1;
        } else {
            metrics.failed += 1;
        }
        if ran {
            metrics.total_duration_ms += outcome.duration_ms;
            metrics.last_duration_ms = outcome.duration_ms;
        }
    }

    #[cfg(unix)]
    fn signal_group(pid: i32, signal: GroupSignal) {
        if pid <= 0 {
            return;
        }
        let sig = match signal {
            GroupSignal::Term => libc::SIGTERM,
            GroupSignal::Kill => libc::SIGKILL,
        };
        unsafe {
            libc::killpg(pid, sig);
        }
    }

    #[cfg(not(unix))]
    fn signal_group(_pid: i32, _signal: GroupSignal) {}
}

#[derive(Clone, Copy)]
enum GroupSignal {
    Term,
    Kill,
}
