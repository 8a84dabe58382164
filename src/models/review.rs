//! Review model: the reviewer's verdict over one candidate submission.
//!
//! Verdicts and reasons are parsed into enums at the boundary; the engine
//! never compares raw strings.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The reviewer's overall judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Revise,
    Reject,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Revise => write!(f, "revise"),
            Verdict::Reject => write!(f, "reject"),
        }
    }
}

/// Score for a single rubric dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
    pub name: String,
    /// 0–100.
    pub score: u8,
}

/// A line-anchored reviewer comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineComment {
    pub path: String,
    pub line: u32,
    pub comment: String,
}

/// Free-form review body: summary, inline comments, citations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewDetails {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub inline: Vec<InlineComment>,
    #[serde(default)]
    pub citations: Vec<String>,
}

/// One judge's card when the reviewer fans out internally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeCard {
    pub model: String,
    pub score: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// The reviewer's complete reply for one audit.
///
/// `overall` and `verdict` are required on the wire; everything else
/// defaults. [`Review::validate`] enforces the range constraints serde
/// cannot express.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    /// Aggregate score, 0–100. The type bounds it to a byte; `validate`
    /// rejects the 101–255 remainder.
    pub overall: u8,
    pub verdict: Verdict,
    #[serde(default)]
    pub dimensions: Vec<DimensionScore>,
    #[serde(default)]
    pub review: ReviewDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_diff: Option<String>,
    /// The reviewer's internal iteration count. Ignored for control flow.
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub judge_cards: Vec<JudgeCard>,
}

impl Review {
    /// Enforce the shape constraints from the reviewer contract: scores in
    /// 0–100 at every level.
    pub fn validate(&self) -> Result<()> {
        if self.overall > 100 {
            return Err(Error::Parse(format!(
                "overall score {} outside 0-100",
                self.overall
            )));
        }
        for dim in &self.dimensions {
            if dim.score > 100 {
                return Err(Error::Parse(format!(
                    "dimension '{}' score {} outside 0-100",
                    dim.name, dim.score
                )));
            }
        }
        for card in &self.judge_cards {
            if card.score > 100 {
                return Err(Error::Parse(format!(
                    "judge '{}' score {} outside 0-100",
                    card.model, card.score
                )));
            }
        }
        Ok(())
    }

    /// Conservative substitute used when the reviewer times out, fails to
    /// spawn, or returns unparseable output.
    pub fn fallback(summary: impl Into<String>) -> Self {
        Self {
            overall: 50,
            verdict: Verdict::Revise,
            dimensions: Vec::new(),
            review: ReviewDetails {
                summary: summary.into(),
                inline: Vec::new(),
                citations: Vec::new(),
            },
            proposed_diff: None,
            iterations: 0,
            judge_cards: Vec::new(),
        }
    }

    /// Approximate serialized size, used for cache memory accounting.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}
