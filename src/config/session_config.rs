//! Per-session configuration resolved from the inline `gan-config` block.
//!
//! A thought may carry a fenced block tagged `gan-config` whose body is
//! JSON. Recognized keys override the session defaults; unknown keys are
//! ignored; mistyped or out-of-range values are clamped back to defaults
//! and reported as warnings.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// What the reviewer is asked to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditScope {
    Diff,
    Paths,
    Workspace,
}

/// Resolved audit configuration for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// What the reviewer is asked to do.
    pub task: String,
    pub scope: AuditScope,
    /// Only meaningful when `scope` is `paths`.
    pub paths: Vec<String>,
    /// Score the caller considers acceptable, 0–100.
    pub threshold: u32,
    pub judges: Vec<String>,
    pub max_cycles: u32,
    pub candidates: u32,
    pub apply_fixes: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            task: "Audit the submitted code for correctness, completeness, and quality"
                .to_string(),
            scope: AuditScope::Diff,
            paths: Vec::new(),
            threshold: 85,
            judges: vec!["internal".to_string()],
            max_cycles: 1,
            candidates: 1,
            apply_fixes: false,
        }
    }
}

static GAN_CONFIG_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```gan-config\s*\n(.*?)```").expect("gan-config fence regex")
});

impl SessionConfig {
    /// Extract and resolve the inline `gan-config` block from a thought.
    ///
    /// Returns the resolved config and the warnings produced while
    /// clamping. Absent or unparseable blocks yield `None`.
    pub fn from_thought_text(text: &str) -> Option<(Self, Vec<String>)> {
        let captures = GAN_CONFIG_FENCE.captures(text)?;
        let body = captures.get(1)?.as_str();
        let value: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => {
                warn!("ignoring malformed gan-config block: {e}");
                return None;
            }
        };
        let mut config = Self::default();
        let warnings = config.merge_value(&value);
        for w in &warnings {
            warn!("gan-config: {w}");
        }
        Some((config, warnings))
    }

    /// Merge a parsed JSON object into this config, clamping bad values.
    fn merge_value(&mut self, value: &Value) -> Vec<String> {
        let mut warnings = Vec::new();
        let Some(obj) = value.as_object() else {
            warnings.push("gan-config body is not a JSON object".to_string());
            return warnings;
        };

        for (key, val) in obj {
            match key.as_str() {
                "task" => match val.as_str() {
                    Some(s) if !s.trim().is_empty() => self.task = s.to_string(),
                    _ => warnings.push("task must be a non-empty string".to_string()),
                },
                "scope" => match val.as_str().map(str::to_ascii_lowercase).as_deref() {
                    Some("diff") => self.scope = AuditScope::Diff,
                    Some("paths") => self.scope = AuditScope::Paths,
                    Some("workspace") => self.scope = AuditScope::Workspace,
                    _ => warnings
                        .push(format!("scope '{val}' is not diff|paths|workspace")),
                },
                "paths" => match val.as_array() {
                    Some(arr) => {
                        self.paths = arr
                            .iter()
                            .filter_map(|p| p.as_str().map(String::from))
                            .collect();
                    }
                    None => warnings.push("paths must be an array of strings".to_string()),
                },
                "threshold" => match val.as_u64() {
                    Some(t) if t <= 100 => self.threshold = t as u32,
                    _ => warnings.push(format!(
                        "threshold '{val}' outside 0-100; using {}",
                        self.threshold
                    )),
                },
                "judges" => match val.as_array() {
                    Some(arr) if !arr.is_empty() => {
                        self.judges = arr
                            .iter()
                            .filter_map(|j| j.as_str().map(String::from))
                            .collect();
                    }
                    _ => warnings.push("judges must be a non-empty array".to_string()),
                },
                "maxCycles" => match val.as_u64() {
                    Some(n) if n >= 1 => self.max_cycles = n as u32,
                    _ => warnings.push(format!(
                        "maxCycles '{val}' must be >= 1; using {}",
                        self.max_cycles
                    )),
                },
                "candidates" => match val.as_u64() {
                    Some(n) if n >= 1 => self.candidates = n as u32,
                    _ => warnings.push(format!(
                        "candidates '{val}' must be >= 1; using {}",
                        self.candidates
                    )),
                },
                "applyFixes" => match val.as_bool() {
                    Some(b) => self.apply_fixes = b,
                    None => warnings.push("applyFixes must be a boolean".to_string()),
                },
                // Unknown keys are ignored by contract.
                _ => {}
            }
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_block_is_none() {
        assert!(SessionConfig::from_thought_text("plain text, no config").is_none());
    }

    #[test]
    fn test_full_block_resolves() {
        let text = r#"Here is my plan.

```gan-config
{
  "task": "Check the retry logic",
  "scope": "paths",
  "paths": ["src/retry.rs"],
  "threshold": 90,
  "judges": ["internal", "external"],
  "maxCycles": 3,
  "candidates": 2,
  "applyFixes": true
}
```
"#;
        let (config, warnings) = SessionConfig::from_thought_text(text).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(config.task, "Check the retry logic");
        assert_eq!(config.scope, AuditScope::Paths);
        assert_eq!(config.paths, vec!["src/retry.rs"]);
        assert_eq!(config.threshold, 90);
        assert_eq!(config.judges.len(), 2);
        assert_eq!(config.max_cycles, 3);
        assert!(config.apply_fixes);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let text = "```gan-config\n{\"threshold\": 70, \"futureKnob\": 42}\n```";
        let (config, warnings) = SessionConfig::from_thought_text(text).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(config.threshold, 70);
    }

    #[test]
    fn test_out_of_range_threshold_clamped_with_warning() {
        let text = "```gan-config\n{\"threshold\": 250}\n```";
        let (config, warnings) = SessionConfig::from_thought_text(text).unwrap();
        assert_eq!(config.threshold, SessionConfig::default().threshold);
        assert!(warnings.iter().any(|w| w.contains("threshold")));
    }

    #[test]
    fn test_mistyped_scope_clamped_with_warning() {
        let text = "```gan-config\n{\"scope\": \"everything\"}\n```";
        let (config, warnings) = SessionConfig::from_thought_text(text).unwrap();
        assert_eq!(config.scope, AuditScope::Diff);
        assert!(warnings.iter().any(|w| w.contains("scope")));
    }

    #[test]
    fn test_zero_max_cycles_clamped() {
        let text = "```gan-config\n{\"maxCycles\": 0}\n```";
        let (config, warnings) = SessionConfig::from_thought_text(text).unwrap();
        assert_eq!(config.max_cycles, 1);
        assert!(warnings.iter().any(|w| w.contains("maxCycles")));
    }

    #[test]
    fn test_malformed_json_is_none() {
        let text = "```gan-config\n{not valid json}\n```";
        assert!(SessionConfig::from_thought_text(text).is_none());
    }

    #[test]
    fn test_non_object_body_warns() {
        let text = "```gan-config\n[1, 2, 3]\n```";
        let (config, warnings) = SessionConfig::from_thought_text(text).unwrap();
        assert_eq!(config, SessionConfig::default());
        assert!(warnings.iter().any(|w| w.contains("JSON object")));
    }
}
