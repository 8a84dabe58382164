//! The shouldAudit classifier: decides whether a thought carries code
//! worth sending to the reviewer.
//!
//! Pure and idempotent: the same text always classifies the same way.

use once_cell::sync::Lazy;
use regex::Regex;

/// Which rule matched, for log lines and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditTrigger {
    InlineConfig,
    FencedCode,
    DiffContent,
    KeywordDensity,
}

impl std::fmt::Display for AuditTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditTrigger::InlineConfig => write!(f, "inline gan-config"),
            AuditTrigger::FencedCode => write!(f, "fenced code block"),
            AuditTrigger::DiffContent => write!(f, "diff content"),
            AuditTrigger::KeywordDensity => write!(f, "programming keywords"),
        }
    }
}

static GAN_CONFIG_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```gan-config\b").expect("gan-config tag regex"));

static JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*\n(.*?)```").expect("json fence regex"));

/// Fenced block with a recognized language tag.
static TAGGED_CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)```(javascript|typescript|python|java|cpp|c\+\+|csharp|c#|go|rust|php|ruby|swift|kotlin|scala|sql|html|css|json|yaml|xml|bash|shell|sh)\b",
    )
    .expect("tagged fence regex")
});

/// Untagged fence whose first line already looks like code.
static UNTAGGED_CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"```[ \t]*\r?\n[^\n]*\b(function|class|def|public|private|const|let|var|import|export)\b",
    )
    .expect("untagged fence regex")
});

static DIFF_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)(^[+-]|^@@.*@@|diff --git|index [0-9a-f]+\.\.[0-9a-f]+)")
        .expect("diff regex")
});

static DECLARATION_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(function|class|interface|type|const|let|var|def|public|private|protected|static|async|await|return|import|export|from|require)\b",
    )
    .expect("declaration keyword regex")
});

static CONTROL_FLOW_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(if|else|for|while|switch|case|try|catch|finally|throw|new|this|super|extends|implements)\b",
    )
    .expect("control flow keyword regex")
});

/// `name(args) {` or `name(args) =`, a function-definition-like signature.
static FUNCTION_SIGNATURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\w+\s*\([^)]*\)\s*[={]").expect("signature regex"));

/// Classify a thought. Returns the first matching trigger, or `None` when
/// the thought is prose-only.
pub fn audit_trigger(text: &str) -> Option<AuditTrigger> {
    if has_inline_config(text) {
        return Some(AuditTrigger::InlineConfig);
    }
    if TAGGED_CODE_FENCE.is_match(text) || UNTAGGED_CODE_FENCE.is_match(text) {
        return Some(AuditTrigger::FencedCode);
    }
    if DIFF_LINE.is_match(text) {
        return Some(AuditTrigger::DiffContent);
    }
    if DECLARATION_KEYWORDS.is_match(text)
        || CONTROL_FLOW_KEYWORDS.is_match(text)
        || FUNCTION_SIGNATURE.is_match(text)
    {
        return Some(AuditTrigger::KeywordDensity);
    }
    None
}

/// True when the thought should be routed through the audit loop.
pub fn should_audit(text: &str) -> bool {
    audit_trigger(text).is_some()
}

fn has_inline_config(text: &str) -> bool {
    if GAN_CONFIG_TAG.is_match(text) {
        return true;
    }
    JSON_FENCE
        .captures_iter(text)
        .any(|c| c.get(1).is_some_and(|body| body.as_str().contains("gan-config")))
}
