use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main server configuration.
///
/// Layered resolution: defaults → optional YAML file → environment
/// variables → CLI flags (applied in `main.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditorConfig {
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub codex: CodexConfig,
    #[serde(default)]
    pub session: SessionStoreConfig,
    #[serde(default)]
    pub stagnation: StagnationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Audit orchestration knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Master switch for auditing. When false every thought takes the
    /// baseline (echo-only) path.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Run the audit inline and block the response on the verdict.
    #[serde(default)]
    pub synchronous: bool,
    /// Deadline for one reviewer invocation.
    #[serde(default = "default_audit_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Concurrent reviewer child processes.
    #[serde(default = "default_max_concurrent_audits")]
    pub max_concurrent_audits: usize,
    /// Sessions kept live before the sweeper complains.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Suppress thought bodies from the log stream.
    #[serde(default)]
    pub disable_thought_logging: bool,
}

/// Reviewer child-process knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexConfig {
    /// Reviewer executable, resolved against PATH unless absolute.
    #[serde(default = "default_codex_binary")]
    pub binary: String,
    /// Prompt budget; the packed context is truncated from the tail to fit.
    #[serde(default = "default_context_token_limit")]
    pub context_token_limit: usize,
    /// How long a queued execution may wait for a process slot.
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL.
    #[serde(default = "default_process_cleanup_timeout_ms")]
    pub process_cleanup_timeout_ms: u64,
}

/// Session persistence knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStoreConfig {
    /// Directory holding one `<sessionId>.json` per session.
    #[serde(default = "default_state_directory")]
    pub state_directory: PathBuf,
    /// Idle age after which the sweeper deletes a session file.
    #[serde(default = "default_max_session_age_ms")]
    pub max_session_age_ms: i64,
    /// Cadence of the session and context sweepers.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Stagnation detection knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagnationConfig {
    /// Mean pairwise similarity at which the window counts as stagnant.
    #[serde(default = "default_stagnation_threshold")]
    pub threshold: f64,
    /// Any single pair at or above this is treated as identical.
    #[serde(default = "default_identical_threshold")]
    pub identical_threshold: f64,
    /// Analysis only starts at this loop count.
    #[serde(default = "default_stagnation_start_loop")]
    pub start_loop: u32,
    /// Number of trailing iterations compared pairwise.
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,
}

/// Audit cache knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_max_memory_bytes")]
    pub max_memory_bytes: usize,
    /// Entries older than this are expired lazily on access.
    #[serde(default = "default_cache_max_age_ms")]
    pub max_age_ms: i64,
}

fn default_true() -> bool {
    true
}

fn default_audit_timeout_seconds() -> u64 {
    30
}

fn default_max_concurrent_audits() -> usize {
    5
}

fn default_max_concurrent_sessions() -> usize {
    50
}

fn default_codex_binary() -> String {
    "codex".to_string()
}

fn default_context_token_limit() -> usize {
    32_000
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

fn default_process_cleanup_timeout_ms() -> u64 {
    5_000
}

fn default_state_directory() -> PathBuf {
    PathBuf::from("./.gansauditor/sessions")
}

fn default_max_session_age_ms() -> i64 {
    24 * 60 * 60 * 1000 // 24 hours
}

fn default_sweep_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_stagnation_threshold() -> f64 {
    0.95
}

fn default_identical_threshold() -> f64 {
    0.99
}

fn default_stagnation_start_loop() -> u32 {
    10
}

fn default_recent_window() -> usize {
    3
}

fn default_cache_max_entries() -> usize {
    1000
}

fn default_cache_max_memory_bytes() -> usize {
    64 * 1024 * 1024 // 64 MiB
}

fn default_cache_max_age_ms() -> i64 {
    30 * 60 * 1000 // 30 minutes
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            synchronous: false,
            timeout_seconds: default_audit_timeout_seconds(),
            max_concurrent_audits: default_max_concurrent_audits(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            disable_thought_logging: false,
        }
    }
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            binary: default_codex_binary(),
            context_token_limit: default_context_token_limit(),
            queue_timeout_ms: default_queue_timeout_ms(),
            process_cleanup_timeout_ms: default_process_cleanup_timeout_ms(),
        }
    }
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            state_directory: default_state_directory(),
            max_session_age_ms: default_max_session_age_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for StagnationConfig {
    fn default() -> Self {
        Self {
            threshold: default_stagnation_threshold(),
            identical_threshold: default_identical_threshold(),
            start_loop: default_stagnation_start_loop(),
            recent_window: default_recent_window(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            max_memory_bytes: default_cache_max_memory_bytes(),
            max_age_ms: default_cache_max_age_ms(),
        }
    }
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            audit: AuditConfig::default(),
            codex: CodexConfig::default(),
            session: SessionStoreConfig::default(),
            stagnation: StagnationConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl AuditorConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AuditorConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is absent.
    pub fn load_or_default(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        match path {
            Some(p) if p.exists() => Self::from_file(p),
            _ => Ok(Self::default()),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Environment variables override config file values but are themselves
    /// overridden by CLI arguments. Unparseable values are left for
    /// `validate()` to report.
    ///
    /// Supported environment variables:
    /// - ENABLE_GAN_AUDITING: master audit switch (true/false)
    /// - ENABLE_SYNCHRONOUS_AUDIT: block responses on the verdict (true/false)
    /// - DISABLE_THOUGHT_LOGGING: suppress thought bodies in logs (true/false)
    /// - AUDIT_TIMEOUT_SECONDS: reviewer deadline
    /// - MAX_CONCURRENT_AUDITS: reviewer process cap
    /// - MAX_CONCURRENT_SESSIONS: live session cap
    /// - SESSION_STATE_DIRECTORY: session file directory
    /// - STAGNATION_THRESHOLD: mean-similarity cutoff (0.0-1.0)
    /// - STAGNATION_START_LOOP: first loop analyzed for stagnation
    /// - CODEX_BINARY: reviewer executable
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("ENABLE_GAN_AUDITING")
            && !val.is_empty()
        {
            self.audit.enabled = parse_bool(&val).unwrap_or(self.audit.enabled);
        }

        if let Ok(val) = std::env::var("ENABLE_SYNCHRONOUS_AUDIT")
            && !val.is_empty()
        {
            self.audit.synchronous = parse_bool(&val).unwrap_or(self.audit.synchronous);
        }

        if let Ok(val) = std::env::var("DISABLE_THOUGHT_LOGGING")
            && !val.is_empty()
        {
            self.audit.disable_thought_logging =
                parse_bool(&val).unwrap_or(self.audit.disable_thought_logging);
        }

        if let Ok(val) = std::env::var("AUDIT_TIMEOUT_SECONDS")
            && let Ok(secs) = val.parse::<u64>()
        {
            self.audit.timeout_seconds = secs.max(1);
        }

        if let Ok(val) = std::env::var("MAX_CONCURRENT_AUDITS")
            && let Ok(n) = val.parse::<usize>()
        {
            self.audit.max_concurrent_audits = n.max(1);
        }

        if let Ok(val) = std::env::var("MAX_CONCURRENT_SESSIONS")
            && let Ok(n) = val.parse::<usize>()
        {
            self.audit.max_concurrent_sessions = n.max(1);
        }

        if let Ok(val) = std::env::var("SESSION_STATE_DIRECTORY")
            && !val.is_empty()
        {
            self.session.state_directory = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("STAGNATION_THRESHOLD")
            && let Ok(threshold) = val.parse::<f64>()
        {
            self.stagnation.threshold = threshold.clamp(0.0, 1.0);
        }

        if let Ok(val) = std::env::var("STAGNATION_START_LOOP")
            && let Ok(loop_n) = val.parse::<u32>()
        {
            self.stagnation.start_loop = loop_n;
        }

        if let Ok(val) = std::env::var("CODEX_BINARY")
            && !val.is_empty()
        {
            self.codex.binary = val;
        }

        self
    }

    /// Load configuration with environment variable overrides applied.
    ///
    /// Priority: CLI args (applied in main) > env vars > config file > defaults.
    pub fn load_with_env(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        Self::load_or_default(path).map(|c| c.apply_env_overrides())
    }

    /// Validate the resolved configuration.
    ///
    /// Returns human-readable warnings. Only one combination is fatal, and
    /// the caller decides: synchronous auditing with no reviewer binary on
    /// PATH (see [`AuditorConfig::reviewer_binary_resolved`]).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Ok(val) = std::env::var("AUDIT_TIMEOUT_SECONDS")
            && val.parse::<u64>().is_err()
        {
            warnings.push(format!(
                "AUDIT_TIMEOUT_SECONDS='{val}' is not an integer; using {}",
                self.audit.timeout_seconds
            ));
        }
        if let Ok(val) = std::env::var("STAGNATION_THRESHOLD")
            && val.parse::<f64>().is_err()
        {
            warnings.push(format!(
                "STAGNATION_THRESHOLD='{val}' is not a number; using {}",
                self.stagnation.threshold
            ));
        }

        if self.stagnation.threshold > self.stagnation.identical_threshold {
            warnings.push(format!(
                "stagnation threshold {} exceeds identical threshold {}; identical pairs will dominate",
                self.stagnation.threshold, self.stagnation.identical_threshold
            ));
        }
        if self.stagnation.recent_window < 2 {
            warnings.push("stagnation window below 2 disables pairwise comparison".to_string());
        }
        if self.audit.synchronous && !self.audit.enabled {
            warnings.push(
                "ENABLE_SYNCHRONOUS_AUDIT is set but auditing is disabled; audits will not run"
                    .to_string(),
            );
        }
        if self.audit.synchronous && self.reviewer_binary_resolved().is_none() {
            warnings.push(format!(
                "synchronous auditing requires the reviewer binary '{}' on PATH",
                self.codex.binary
            ));
        }
        if self.cache.max_entries == 0 || self.cache.max_memory_bytes == 0 {
            warnings.push("cache limits of zero disable caching entirely".to_string());
        }

        warnings
    }

    /// Resolve the reviewer executable: an absolute/relative path is checked
    /// directly, a bare name is searched on PATH.
    pub fn reviewer_binary_resolved(&self) -> Option<PathBuf> {
        let binary = Path::new(&self.codex.binary);
        if binary.components().count() > 1 {
            return binary.is_file().then(|| binary.to_path_buf());
        }
        let path_var = std::env::var_os("PATH")?;
        std::env::split_paths(&path_var)
            .map(|dir| dir.join(binary))
            .find(|candidate| candidate.is_file())
    }

    /// The fatal startup condition: synchronous mode without a reviewer.
    pub fn startup_fatal(&self) -> Option<String> {
        if self.audit.synchronous && self.reviewer_binary_resolved().is_none() {
            return Some(format!(
                "ENABLE_SYNCHRONOUS_AUDIT=true but reviewer binary '{}' was not found",
                self.codex.binary
            ));
        }
        None
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
