//! Inbound thought model and shape validation.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One inbound request: the caller's current reasoning step, optionally
/// carrying code to audit and an inline `gan-config` block.
///
/// Field names follow the wire format of the `gansauditor_codex` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thought {
    /// The thought text. Non-empty.
    pub thought: String,
    /// Position of this thought in the caller's sequence (1-indexed).
    pub thought_number: u32,
    /// The caller's current estimate of total thoughts. Raised to
    /// `thought_number` when the caller overshoots.
    pub total_thoughts: u32,
    /// The caller's intent to continue. The engine may override this in the
    /// outbound response.
    pub next_thought_needed: bool,
    /// Set when this thought revises an earlier one. Echoed unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_revision: Option<bool>,
    /// The thought number being revised. Echoed unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revises_thought: Option<u32>,
    /// The thought number this branch forked from. Echoed unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_from_thought: Option<u32>,
    /// Session key. When absent the engine synthesizes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Identifier binding iterations to a reusable reviewer-side context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_id: Option<String>,
    /// Opaque bookkeeping flag. Echoed unchanged, never read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_more_thoughts: Option<bool>,
}

impl Thought {
    /// Validate the thought shape. Does not mutate; callers apply
    /// [`Thought::normalize`] after validation succeeds.
    pub fn validate(&self) -> Result<()> {
        if self.thought.trim().is_empty() {
            return Err(Error::Validation("thought must be a non-empty string".into()));
        }
        if self.thought_number == 0 {
            return Err(Error::Validation("thoughtNumber must be >= 1".into()));
        }
        if self.total_thoughts == 0 {
            return Err(Error::Validation("totalThoughts must be >= 1".into()));
        }
        if let Some(n) = self.revises_thought
            && n == 0
        {
            return Err(Error::Validation("revisesThought must be >= 1".into()));
        }
        if let Some(n) = self.branch_from_thought
            && n == 0
        {
            return Err(Error::Validation("branchFromThought must be >= 1".into()));
        }
        Ok(())
    }

    /// Raise `total_thoughts` to `thought_number` when the caller overshoots.
    /// Not an error.
    pub fn normalize(&mut self) {
        if self.thought_number > self.total_thoughts {
            self.total_thoughts = self.thought_number;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_thought() -> Thought {
        Thought {
            thought: "Reviewing the retry logic".to_string(),
            thought_number: 2,
            total_thoughts: 5,
            next_thought_needed: true,
            is_revision: None,
            revises_thought: None,
            branch_from_thought: None,
            branch_id: Some("session-a".to_string()),
            loop_id: None,
            needs_more_thoughts: None,
        }
    }

    #[test]
    fn test_valid_thought_passes() {
        assert!(valid_thought().validate().is_ok());
    }

    #[test]
    fn test_empty_thought_rejected() {
        let mut t = valid_thought();
        t.thought = "   ".to_string();
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_zero_thought_number_rejected() {
        let mut t = valid_thought();
        t.thought_number = 0;
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_overshoot_raises_total() {
        let mut t = valid_thought();
        t.thought_number = 9;
        t.total_thoughts = 3;
        assert!(t.validate().is_ok());
        t.normalize();
        assert_eq!(t.total_thoughts, 9);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut t = valid_thought();
        t.thought_number = 9;
        t.total_thoughts = 3;
        t.normalize();
        t.normalize();
        assert_eq!(t.total_thoughts, 9);
    }

    #[test]
    fn test_wire_names_are_camel_case() {
        let json = serde_json::to_value(valid_thought()).unwrap();
        assert!(json.get("thoughtNumber").is_some());
        assert!(json.get("totalThoughts").is_some());
        assert!(json.get("nextThoughtNeeded").is_some());
        assert!(json.get("branchId").is_some());
    }

    #[test]
    fn test_optional_fields_deserialize_absent() {
        let t: Thought = serde_json::from_str(
            r#"{"thought": "x", "thoughtNumber": 1, "totalThoughts": 1, "nextThoughtNeeded": true}"#,
        )
        .unwrap();
        assert!(t.branch_id.is_none());
        assert!(t.loop_id.is_none());
        assert!(t.validate().is_ok());
    }
}
