//! Code fingerprinting for the audit cache.
//!
//! Formatting and comment changes should hit the same cache entry;
//! control-flow and identifier changes should miss. The normalization is
//! idempotent: `normalize(normalize(x)) == normalize(x)`.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Fenced block with an optional language tag. The body is capture 1.
static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9+#.-]*[ \t]*\r?\n?(.*?)```").expect("fence regex"));

/// Inline code span on a single line.
static INLINE_SPAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`\n]+)`").expect("span regex"));

static BLOCK_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("block comment regex"));

static HTML_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("html comment regex"));

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));

static SPACE_AROUND_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*([{}();,])\s*").expect("punct regex"));

/// The hash and normalized form of one thought's code extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeFingerprint {
    /// Hex SHA-256 of the normalized code.
    pub hash: String,
    pub normalized: String,
}

/// Pull every fenced block and inline code span out of the thought text,
/// stripped of backticks and language tags, in document order.
pub fn extract_code(text: &str) -> String {
    let mut pieces: Vec<String> = Vec::new();

    for captures in FENCED_BLOCK.captures_iter(text) {
        if let Some(body) = captures.get(1) {
            pieces.push(body.as_str().to_string());
        }
    }

    // Inline spans are scanned on the text with fences removed so a span
    // inside a block is not counted twice.
    let without_fences = FENCED_BLOCK.replace_all(text, " ");
    for captures in INLINE_SPAN.captures_iter(&without_fences) {
        if let Some(span) = captures.get(1) {
            pieces.push(span.as_str().to_string());
        }
    }

    pieces.join("\n")
}

/// Normalize extracted code: strip comments, collapse whitespace, drop
/// spaces around structural punctuation.
pub fn normalize(code: &str) -> String {
    // Line comments first, while line structure still exists.
    let stripped: String = code
        .lines()
        .map(strip_line_comment)
        .collect::<Vec<_>>()
        .join("\n");

    let stripped = BLOCK_COMMENT.replace_all(&stripped, " ");
    let stripped = HTML_COMMENT.replace_all(&stripped, " ");
    let collapsed = WHITESPACE_RUN.replace_all(&stripped, " ");
    let tightened = SPACE_AROUND_PUNCT.replace_all(&collapsed, "$1");
    tightened.trim().to_string()
}

fn strip_line_comment(line: &str) -> &str {
    let cut = match (line.find("//"), line.find('#')) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    match cut {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Extract, normalize, and hash the code carried by a thought.
pub fn fingerprint(thought_text: &str) -> CodeFingerprint {
    let normalized = normalize(&extract_code(thought_text));
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    CodeFingerprint { hash, normalized }
}

/// Cache key: the code hash qualified by the thought number, so the same
/// candidate at different loop positions stays distinct.
pub fn cache_key(code_hash: &str, thought_number: u32) -> String {
    format!("{code_hash}:{thought_number}")
}
