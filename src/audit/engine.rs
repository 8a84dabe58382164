//! The audit engine: turns one inbound thought into one outbound envelope.
//!
//! Every `process_thought` call returns exactly one well-formed response.
//! Failures after session load are localized: the session gets a
//! best-effort failure record and the caller still receives the baseline
//! envelope. Same-session calls serialize behind a per-session mutex;
//! cross-session calls run concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::audit::cache::AuditCache;
use crate::audit::classifier;
use crate::audit::completion::CompletionEvaluator;
use crate::audit::fingerprint::{self, cache_key};
use crate::audit::response::{self, AuditOutcome, BaselineEcho};
use crate::audit::stagnation::StagnationDetector;
use crate::codex::{AuditRequest, ContextManager, ContextPacker, ProcessSupervisor, ReviewerBackend};
use crate::config::{AuditorConfig, SessionConfig};
use crate::error::Result;
use crate::models::{
    CompletionReason, CompletionResult, IterationRecord, Review, SessionState, Thought,
};
use crate::session::SessionStore;

/// Non-durable echo bookkeeping for the baseline response fields.
#[derive(Default)]
struct ThoughtHistory {
    total: usize,
    branches: Vec<String>,
}

pub struct AuditEngine {
    config: AuditorConfig,
    store: Arc<SessionStore>,
    cache: Arc<AuditCache>,
    reviewer: Arc<dyn ReviewerBackend>,
    contexts: Arc<ContextManager>,
    packer: Arc<dyn ContextPacker>,
    supervisor: Arc<ProcessSupervisor>,
    stagnation: StagnationDetector,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    history: StdMutex<ThoughtHistory>,
    /// Bounded worker pool for fire-and-forget audits in asynchronous mode.
    background_permits: Arc<Semaphore>,
    /// Strictly increasing timestamp source for synthesized session ids.
    monotonic_ts: AtomicI64,
}

impl AuditEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AuditorConfig,
        store: Arc<SessionStore>,
        cache: Arc<AuditCache>,
        reviewer: Arc<dyn ReviewerBackend>,
        contexts: Arc<ContextManager>,
        packer: Arc<dyn ContextPacker>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Self {
        let stagnation = StagnationDetector::new(config.stagnation.clone());
        let background_permits = Arc::new(Semaphore::new(config.audit.max_concurrent_audits.max(1)));
        Self {
            config,
            store,
            cache,
            reviewer,
            contexts,
            packer,
            supervisor,
            stagnation,
            session_locks: Mutex::new(HashMap::new()),
            history: StdMutex::new(ThoughtHistory::default()),
            background_permits,
            monotonic_ts: AtomicI64::new(0),
        }
    }

    /// Total entry point. Never fails: validation errors produce an error
    /// envelope, everything else produces at least the baseline echo.
    ///
    /// In synchronous mode the response blocks on the verdict. Otherwise a
    /// code-bearing thought is audited on a bounded background worker: the
    /// caller gets the baseline echo immediately and the outcome is still
    /// recorded on the session.
    pub async fn process_thought(self: &Arc<Self>, mut thought: Thought) -> serde_json::Value {
        if let Err(e) = thought.validate() {
            return response::build_error(&e.to_string());
        }
        thought.normalize();

        if !self.config.audit.disable_thought_logging {
            debug!(
                thought_number = thought.thought_number,
                branch = thought.branch_id.as_deref().unwrap_or("-"),
                "thought: {}",
                thought.thought
            );
        }

        let echo = self.record_in_history(&thought);

        if !self.config.audit.enabled || !classifier::should_audit(&thought.thought) {
            debug!(
                thought_number = thought.thought_number,
                "baseline path (audit gate closed)"
            );
            return response::build_baseline(&echo);
        }

        let session_id = thought
            .branch_id
            .clone()
            .unwrap_or_else(|| self.synthesize_session_id());

        if !self.config.audit.synchronous {
            self.spawn_background_audit(thought, session_id, echo.clone());
            return response::build_baseline(&echo);
        }

        let lock = self.session_lock(&session_id).await;
        let _guard = lock.lock().await;

        match self.run_audit(&thought, &session_id, &echo).await {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(session = %session_id, "audit pass failed: {e}; degrading to baseline");
                self.store.handle_failure(&session_id, &e);
                if let Some(loop_id) = &thought.loop_id {
                    let _ = self.contexts.terminate(loop_id, "audit failure").await;
                }
                response::build_baseline(&echo)
            }
        }
    }

    /// Fire-and-forget audit for asynchronous mode. The task queues behind
    /// the worker-pool semaphore, holds the session mutex like any other
    /// pass, and discards the envelope after persisting the outcome.
    fn spawn_background_audit(
        self: &Arc<Self>,
        thought: Thought,
        session_id: String,
        echo: BaselineEcho,
    ) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = match engine.background_permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let lock = engine.session_lock(&session_id).await;
            let _guard = lock.lock().await;

            match engine.run_audit(&thought, &session_id, &echo).await {
                Ok(_) => {
                    debug!(session = %session_id, "background audit recorded");
                }
                Err(e) => {
                    warn!(session = %session_id, "background audit failed: {e}");
                    engine.store.handle_failure(&session_id, &e);
                }
            }
        });
    }

    /// The audited path, run under the session mutex. Any error here is
    /// localized by the caller.
    async fn run_audit(
        &self,
        thought: &Thought,
        session_id: &str,
        echo: &BaselineEcho,
    ) -> Result<serde_json::Value> {
        let session_count = self.store.session_count();
        if session_count >= self.config.audit.max_concurrent_sessions {
            warn!(
                session_count,
                limit = self.config.audit.max_concurrent_sessions,
                "live session count at or above the configured cap; sweeping early"
            );
            self.sweep_sessions();
        }

        let mut session = self
            .store
            .load_or_create(session_id, thought.loop_id.as_deref());

        // A complete session appends nothing; restate the terminal status.
        if session.is_complete {
            return Ok(self.completed_session_response(echo, &session));
        }

        if let Some((config, _)) = SessionConfig::from_thought_text(&thought.thought) {
            session.config = config;
        }

        self.sync_loop_binding(&mut session, thought).await;
        self.drive_context_lifecycle(&mut session, thought).await;

        // Cache lookup keyed by the normalized code and thought number.
        let fp = fingerprint::fingerprint(&thought.thought);
        let key = cache_key(&fp.hash, thought.thought_number);
        let outcome = match self.cache.get(&key) {
            Some(review) => {
                debug!(session = %session_id, "audit cache hit");
                AuditOutcome {
                    review,
                    cached: true,
                    timed_out: false,
                    duration_ms: 0,
                    fallback: false,
                }
            }
            None => self.invoke_reviewer(&session, thought, &fp, &key).await,
        };

        session.append_iteration(IterationRecord {
            thought_number: thought.thought_number,
            code_fingerprint: fp.hash.clone(),
            normalized_code: fp.normalized.clone(),
            review: outcome.review.clone(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        })?;

        let mut completion =
            CompletionEvaluator::evaluate(outcome.review.overall, session.current_loop);

        // Stagnation newly detected overrides the tier evaluation.
        if session
            .stagnation_info
            .as_ref()
            .is_none_or(|s| !s.is_stagnant)
            && let Some(info) = self
                .stagnation
                .analyze(&session.iterations, session.current_loop)
        {
            info!(
                session = %session_id,
                loop_count = session.current_loop,
                similarity = info.similarity_score,
                "stagnation detected"
            );
            session.stagnation_info = Some(info);
            completion = CompletionResult {
                is_complete: true,
                reason: CompletionReason::StagnationDetected,
                next_thought_needed: false,
                message: "Stagnation detected; stop resubmitting near-identical code"
                    .to_string(),
            };
        }

        let termination = CompletionEvaluator::should_terminate(&session);
        if termination.should_terminate && !completion.is_complete {
            let reason = if session
                .stagnation_info
                .as_ref()
                .is_some_and(|s| s.is_stagnant)
            {
                CompletionReason::StagnationDetected
            } else {
                CompletionReason::MaxLoopsReached
            };
            completion = CompletionResult {
                is_complete: true,
                reason,
                next_thought_needed: false,
                message: termination.reason.clone(),
            };
        }

        if completion.is_complete {
            session.mark_complete(completion.reason);
            if let Some(loop_id) = session.loop_id.clone() {
                let _ = self
                    .contexts
                    .terminate(&loop_id, &completion.reason.to_string())
                    .await;
            }
            session.set_context_handle(None);
        }

        self.store.save(&session)?;

        let health = self.supervisor.health();
        debug!(
            session = %session_id,
            active = health.active,
            executed = health.total_executed,
            cache_hit_rate = self.cache.stats().hit_rate,
            "audit pass finished"
        );

        // The engine's verdict on continuation overrides the caller's.
        let echo = BaselineEcho {
            next_thought_needed: completion.next_thought_needed,
            ..echo.clone()
        };
        match response::build_enhanced(
            &echo,
            &session,
            &outcome,
            &completion,
            Some(&termination),
        ) {
            Ok(envelope) => Ok(envelope),
            Err(e) => {
                warn!(session = %session_id, "enhanced response failed: {e}; degrading");
                Ok(response::build_degraded(&echo, &outcome.review))
            }
        }
    }

    /// Invoke the reviewer with the audit deadline; every failure becomes
    /// the conservative fallback review. Only genuine reviewer output is
    /// cached.
    async fn invoke_reviewer(
        &self,
        session: &SessionState,
        thought: &Thought,
        fp: &fingerprint::CodeFingerprint,
        key: &str,
    ) -> AuditOutcome {
        let timeout = Duration::from_secs(self.config.audit.timeout_seconds);
        let context = match self
            .packer
            .pack(session.config.scope, &session.config.paths)
            .await
        {
            Ok(context) => context,
            Err(e) => {
                warn!(session = %session.id, "context packing failed: {e}; auditing without context");
                String::new()
            }
        };

        let candidate = {
            let extracted = fingerprint::extract_code(&thought.thought);
            if extracted.trim().is_empty() {
                thought.thought.clone()
            } else {
                extracted
            }
        };

        let request = AuditRequest {
            session_id: session.id.clone(),
            task: session.config.task.clone(),
            context,
            candidate,
            judges: session.config.judges.clone(),
            working_dir: None,
        };

        let started = Instant::now();
        match self.reviewer.review(&request, timeout).await {
            Ok(review) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.cache
                    .put(key.to_string(), fp.hash.clone(), review.clone());
                AuditOutcome {
                    review,
                    cached: false,
                    timed_out: false,
                    duration_ms,
                    fallback: false,
                }
            }
            Err(crate::error::Error::Timeout(_)) => {
                warn!(session = %session.id, "audit timed out after {}s", timeout.as_secs());
                AuditOutcome {
                    review: Review::fallback(format!(
                        "Audit timed out after {}s; treat this verdict as provisional",
                        timeout.as_secs()
                    )),
                    cached: false,
                    timed_out: true,
                    duration_ms: started.elapsed().as_millis() as u64,
                    fallback: true,
                }
            }
            Err(e) => {
                warn!(session = %session.id, "audit failed: {e}");
                AuditOutcome {
                    review: Review::fallback(format!("Audit could not run: {e}")),
                    cached: false,
                    timed_out: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                    fallback: true,
                }
            }
        }
    }

    /// Track the caller's loop binding: a changed loop id on an existing
    /// session drops the old reviewer context and rebinds.
    async fn sync_loop_binding(&self, session: &mut SessionState, thought: &Thought) {
        let Some(loop_id) = &thought.loop_id else {
            return;
        };
        if session.loop_id.as_deref() == Some(loop_id.as_str()) {
            return;
        }
        if let Some(previous) = session.loop_id.clone()
            && session.codex_context_active
        {
            info!(session = %session.id, previous = %previous, new = %loop_id, "loop id changed; dropping old context");
            let _ = self.contexts.terminate(&previous, "loop rebound").await;
        }
        session.loop_id = Some(loop_id.clone());
        session.set_context_handle(None);
    }

    /// Start or maintain the reviewer context. All failures are non-fatal;
    /// a context the reviewer forgot is cleared so the next call restarts.
    async fn drive_context_lifecycle(&self, session: &mut SessionState, thought: &Thought) {
        let Some(loop_id) = &thought.loop_id else {
            return;
        };

        if !session.codex_context_active {
            match self.contexts.start(loop_id).await {
                Ok(handle) => session.set_context_handle(Some(handle)),
                Err(e) => {
                    warn!(session = %session.id, "context start failed: {e}; auditing without context");
                }
            }
            return;
        }

        if let Some(handle) = session.codex_context_id.clone()
            && let Err(e) = self.contexts.maintain(loop_id, &handle).await
        {
            // The manager clears its mapping when the reviewer reports
            // the context gone; mirror that in the session.
            if self.contexts.handle_for(loop_id).await.is_none() {
                warn!(session = %session.id, "context lost; will restart next call ({e})");
                session.set_context_handle(None);
            } else {
                debug!(session = %session.id, "context maintenance failed transiently: {e}");
            }
        }
    }

    fn completed_session_response(
        &self,
        echo: &BaselineEcho,
        session: &SessionState,
    ) -> serde_json::Value {
        let reason = session
            .completion_reason
            .unwrap_or(CompletionReason::MaxLoopsReached);
        let review = session
            .latest_review()
            .cloned()
            .unwrap_or_else(|| Review::fallback("session is already complete"));
        let outcome = AuditOutcome {
            review,
            cached: false,
            timed_out: false,
            duration_ms: 0,
            fallback: false,
        };
        let completion = CompletionResult {
            is_complete: true,
            reason,
            next_thought_needed: false,
            message: format!("Session '{}' already completed ({reason})", session.id),
        };
        let echo = BaselineEcho {
            next_thought_needed: false,
            ..echo.clone()
        };
        response::build_enhanced(&echo, session, &outcome, &completion, None)
            .unwrap_or_else(|_| response::build_degraded(&echo, &outcome.review))
    }

    fn record_in_history(&self, thought: &Thought) -> BaselineEcho {
        let mut history = self.history.lock().expect("history mutex poisoned");
        history.total += 1;
        if let Some(branch) = &thought.branch_id
            && !history.branches.contains(branch)
        {
            history.branches.push(branch.clone());
        }
        BaselineEcho {
            thought_number: thought.thought_number,
            total_thoughts: thought.total_thoughts,
            next_thought_needed: thought.next_thought_needed,
            branches: history.branches.clone(),
            thought_history_length: history.total,
        }
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// `session-<monotonic-ts>`: wall-clock milliseconds, bumped past the
    /// previous value when calls land on the same tick.
    fn synthesize_session_id(&self) -> String {
        let now = chrono::Utc::now().timestamp_millis();
        let mut prev = self.monotonic_ts.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self.monotonic_ts.compare_exchange(
                prev,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return format!("session-{next}"),
                Err(actual) => prev = actual,
            }
        }
    }

    /// Remove idle session files. Called by the server's periodic sweeper.
    pub fn sweep_sessions(&self) -> usize {
        self.store.sweep(self.config.session.max_session_age_ms)
    }

    pub fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use crate::config::AuditScope;
    use crate::error::Error;
    use crate::models::Verdict;

    /// Reviewer double: pops scripted reviews, falls back to a default.
    struct ScriptedReviewer {
        replies: StdMutex<VecDeque<Result<Review>>>,
        calls: AtomicUsize,
        default_overall: u8,
        default_verdict: Verdict,
    }

    impl ScriptedReviewer {
        fn new(default_overall: u8, default_verdict: Verdict) -> Self {
            Self {
                replies: StdMutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
                default_overall,
                default_verdict,
            }
        }

        fn push(&self, reply: Result<Review>) {
            self.replies.lock().unwrap().push_back(reply);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReviewerBackend for ScriptedReviewer {
        async fn review(&self, _request: &AuditRequest, _timeout: Duration) -> Result<Review> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(reply) = self.replies.lock().unwrap().pop_front() {
                return reply;
            }
            let mut review = Review::fallback("scripted default");
            review.overall = self.default_overall;
            review.verdict = self.default_verdict;
            Ok(review)
        }
    }

    struct EmptyPacker;

    #[async_trait]
    impl ContextPacker for EmptyPacker {
        async fn pack(&self, _scope: AuditScope, _paths: &[String]) -> Result<String> {
            Ok(String::new())
        }
    }

    struct Harness {
        engine: Arc<AuditEngine>,
        reviewer: Arc<ScriptedReviewer>,
        _state_dir: tempfile::TempDir,
    }

    fn harness(reviewer: ScriptedReviewer) -> Harness {
        harness_with(reviewer, true)
    }

    fn harness_with(reviewer: ScriptedReviewer, synchronous: bool) -> Harness {
        let state_dir = tempfile::tempdir().unwrap();
        let mut config = AuditorConfig::default();
        config.audit.synchronous = synchronous;
        config.session.state_directory = state_dir.path().to_path_buf();

        let supervisor = Arc::new(ProcessSupervisor::new(
            2,
            Duration::from_secs(1),
            Duration::from_millis(100),
        ));
        let reviewer = Arc::new(reviewer);
        let engine = AuditEngine::new(
            config.clone(),
            Arc::new(SessionStore::new(state_dir.path()).unwrap()),
            Arc::new(AuditCache::new(config.cache.clone())),
            Arc::clone(&reviewer) as Arc<dyn ReviewerBackend>,
            Arc::new(ContextManager::new(Arc::clone(&supervisor), "codex".to_string())),
            Arc::new(EmptyPacker),
            supervisor,
        );
        Harness {
            engine: Arc::new(engine),
            reviewer,
            _state_dir: state_dir,
        }
    }

    fn code_thought(n: u32, session: &str, code: &str) -> Thought {
        Thought {
            thought: format!("```rust\n{code}\n```"),
            thought_number: n,
            total_thoughts: n.max(3),
            next_thought_needed: true,
            is_revision: None,
            revises_thought: None,
            branch_from_thought: None,
            branch_id: Some(session.to_string()),
            loop_id: None,
            needs_more_thoughts: None,
        }
    }

    #[tokio::test]
    async fn test_prose_takes_baseline_path() {
        let h = harness(ScriptedReviewer::new(75, Verdict::Revise));
        let mut thought = code_thought(1, "s1", "");
        thought.thought = "Still mulling over the approach, nothing concrete.".to_string();
        let envelope = h.engine.process_thought(thought).await;
        assert!(envelope.get("sessionId").is_none());
        assert_eq!(envelope["thoughtNumber"], 1);
        assert_eq!(h.reviewer.calls(), 0);
    }

    #[tokio::test]
    async fn test_code_thought_is_audited() {
        let h = harness(ScriptedReviewer::new(75, Verdict::Revise));
        let envelope = h
            .engine
            .process_thought(code_thought(1, "s1", "fn main() {}"))
            .await;
        assert_eq!(envelope["sessionId"], "s1");
        assert_eq!(envelope["gan"]["overall"], 75);
        assert_eq!(envelope["completionStatus"]["reason"], "in_progress");
        assert_eq!(envelope["completionStatus"]["currentLoop"], 1);
        assert_eq!(envelope["nextThoughtNeeded"], true);
        assert_eq!(h.reviewer.calls(), 1);
    }

    #[tokio::test]
    async fn test_validation_error_envelope() {
        let h = harness(ScriptedReviewer::new(75, Verdict::Revise));
        let mut thought = code_thought(1, "s1", "fn main() {}");
        thought.thought = String::new();
        let envelope = h.engine.process_thought(thought).await;
        assert_eq!(envelope["status"], "failed");
        assert_eq!(h.reviewer.calls(), 0);
    }

    #[tokio::test]
    async fn test_identical_code_hits_cache() {
        let h = harness(ScriptedReviewer::new(80, Verdict::Revise));
        let first = h
            .engine
            .process_thought(code_thought(1, "c-1", "fn f() { 1 }"))
            .await;
        assert_eq!(h.reviewer.calls(), 1);

        let second = h
            .engine
            .process_thought(code_thought(1, "c-1b", "fn f() { 1 }"))
            .await;
        assert_eq!(h.reviewer.calls(), 1, "second call must not invoke the reviewer");
        assert_eq!(first["gan"], second["gan"]);
        assert_eq!(second["feedback"]["cached"], true);
    }

    #[tokio::test]
    async fn test_timeout_yields_fallback_review() {
        let h = harness(ScriptedReviewer::new(80, Verdict::Revise));
        h.reviewer.push(Err(Error::Timeout(Duration::from_secs(1))));
        let envelope = h
            .engine
            .process_thought(code_thought(1, "s1", "fn f() {}"))
            .await;
        assert_eq!(envelope["gan"]["overall"], 50);
        assert_eq!(envelope["gan"]["verdict"], "revise");
        assert!(envelope["gan"]["review"]["summary"]
            .as_str()
            .unwrap()
            .contains("timed out"));
        assert_eq!(envelope["feedback"]["timedOut"], true);
    }

    #[tokio::test]
    async fn test_fallback_review_is_not_cached() {
        let h = harness(ScriptedReviewer::new(80, Verdict::Revise));
        h.reviewer.push(Err(Error::Timeout(Duration::from_secs(1))));
        h.engine
            .process_thought(code_thought(1, "s1", "fn g() {}"))
            .await;
        // Same code again: the fallback was not cached, reviewer runs
        h.engine
            .process_thought(code_thought(1, "s2", "fn g() {}"))
            .await;
        assert_eq!(h.reviewer.calls(), 2);
    }

    #[tokio::test]
    async fn test_reviewer_unavailable_still_appends_iteration() {
        let h = harness(ScriptedReviewer::new(80, Verdict::Revise));
        h.reviewer
            .push(Err(Error::ReviewerUnavailable("gone".to_string())));
        let envelope = h
            .engine
            .process_thought(code_thought(1, "s1", "fn f() {}"))
            .await;
        assert_eq!(envelope["completionStatus"]["currentLoop"], 1);
        assert_eq!(envelope["gan"]["overall"], 50);
    }

    #[tokio::test]
    async fn test_kill_switch_at_loop_25() {
        let h = harness(ScriptedReviewer::new(50, Verdict::Reject));
        let mut last = serde_json::Value::Null;
        for n in 1..=25 {
            last = h
                .engine
                .process_thought(code_thought(n, "kill", &format!("fn f{n}() {{ {n} }}")))
                .await;
        }
        assert_eq!(last["completionStatus"]["isComplete"], true);
        assert_eq!(last["completionStatus"]["reason"], "max_loops_reached");
        assert_eq!(last["nextThoughtNeeded"], false);
        assert!(last["terminationInfo"]["reason"]
            .as_str()
            .unwrap()
            .contains("Maximum loops (25) reached"));
        assert_eq!(last["terminationInfo"]["failureRate"], 1.0);
    }

    #[tokio::test]
    async fn test_complete_session_appends_nothing_further() {
        let h = harness(ScriptedReviewer::new(50, Verdict::Reject));
        for n in 1..=25 {
            h.engine
                .process_thought(code_thought(n, "done", &format!("fn f{n}() {{}}")))
                .await;
        }
        let calls_at_completion = h.reviewer.calls();
        let after = h
            .engine
            .process_thought(code_thought(26, "done", "fn brand_new() {}"))
            .await;
        assert_eq!(h.reviewer.calls(), calls_at_completion);
        assert_eq!(after["completionStatus"]["isComplete"], true);
        assert_eq!(after["completionStatus"]["currentLoop"], 25);
        assert_eq!(after["nextThoughtNeeded"], false);
    }

    #[tokio::test]
    async fn test_stagnation_detected_on_identical_submissions() {
        let h = harness(ScriptedReviewer::new(75, Verdict::Revise));
        let mut last = serde_json::Value::Null;
        for n in 1..=12 {
            last = h
                .engine
                .process_thought(code_thought(n, "stag", "fn same() { 42 }"))
                .await;
            if last["completionStatus"]["isComplete"] == true {
                break;
            }
        }
        assert_eq!(last["completionStatus"]["reason"], "stagnation_detected");
        assert_eq!(last["loopInfo"]["stagnationDetected"], true);
        assert_eq!(last["nextThoughtNeeded"], false);
        assert!(last["loopInfo"]["similarityScore"].as_f64().unwrap() >= 0.95);
    }

    #[tokio::test]
    async fn test_tier_one_completion() {
        let h = harness(ScriptedReviewer::new(96, Verdict::Pass));
        let mut last = serde_json::Value::Null;
        for n in 1..=10 {
            last = h
                .engine
                .process_thought(code_thought(n, "imp-1", &format!("fn v{n}() {{}}")))
                .await;
        }
        assert_eq!(last["completionStatus"]["isComplete"], true);
        assert_eq!(last["completionStatus"]["reason"], "score_95_at_10");
        assert_eq!(last["nextThoughtNeeded"], false);
    }

    #[tokio::test]
    async fn test_high_score_before_loop_minimum_keeps_going() {
        let h = harness(ScriptedReviewer::new(97, Verdict::Pass));
        let envelope = h
            .engine
            .process_thought(code_thought(1, "s1", "fn f() {}"))
            .await;
        assert_eq!(envelope["completionStatus"]["isComplete"], false);
        assert_eq!(envelope["nextThoughtNeeded"], true);
    }

    #[tokio::test]
    async fn test_thought_number_overshoot_raises_total() {
        let h = harness(ScriptedReviewer::new(70, Verdict::Revise));
        let mut thought = code_thought(7, "s1", "fn f() {}");
        thought.total_thoughts = 3;
        let envelope = h.engine.process_thought(thought).await;
        assert_eq!(envelope["totalThoughts"], 7);
    }

    #[tokio::test]
    async fn test_branches_accumulate_in_echo() {
        let h = harness(ScriptedReviewer::new(70, Verdict::Revise));
        h.engine
            .process_thought(code_thought(1, "a", "fn f() {}"))
            .await;
        let envelope = h
            .engine
            .process_thought(code_thought(1, "b", "fn g() {}"))
            .await;
        let branches: Vec<&str> = envelope["branches"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b.as_str().unwrap())
            .collect();
        assert_eq!(branches, vec!["a", "b"]);
        assert_eq!(envelope["thoughtHistoryLength"], 2);
    }

    #[tokio::test]
    async fn test_synthesized_session_ids_are_unique() {
        let h = harness(ScriptedReviewer::new(70, Verdict::Revise));
        let a = h.engine.synthesize_session_id();
        let b = h.engine.synthesize_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with("session-"));
    }

    #[tokio::test]
    async fn test_async_mode_returns_baseline_immediately() {
        let h = harness_with(ScriptedReviewer::new(70, Verdict::Revise), false);
        let envelope = h
            .engine
            .process_thought(code_thought(1, "bg-1", "fn f() {}"))
            .await;
        assert!(envelope.get("sessionId").is_none());
        assert_eq!(envelope["thoughtNumber"], 1);
    }

    #[tokio::test]
    async fn test_async_mode_records_outcome_on_session() {
        let h = harness_with(ScriptedReviewer::new(70, Verdict::Revise), false);
        h.engine
            .process_thought(code_thought(1, "bg-2", "fn f() {}"))
            .await;

        // The background worker persists the iteration without the caller
        // waiting on it.
        let store = SessionStore::new(h._state_dir.path()).unwrap();
        let mut recorded = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let state = store.load_or_create("bg-2", None);
            if state.current_loop == 1 {
                recorded = true;
                break;
            }
        }
        assert!(recorded, "background audit never recorded an iteration");
        assert_eq!(h.reviewer.calls(), 1);
    }

    #[tokio::test]
    async fn test_async_mode_prose_spawns_nothing() {
        let h = harness_with(ScriptedReviewer::new(70, Verdict::Revise), false);
        let mut thought = code_thought(1, "bg-3", "");
        thought.thought = "Plain planning prose with no codey words at all.".to_string();
        h.engine.process_thought(thought).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.reviewer.calls(), 0);
    }
}
