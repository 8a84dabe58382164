//! Stagnation detection over the recent iteration window.
//!
//! Similarity metric: token-level Jaccard, the intersection over union of
//! the alphanumeric token sets of two normalized code extractions. Bounded
//! to [0, 1]; two empty extractions count as identical (1.0), one empty
//! side counts as disjoint (0.0).

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::config::StagnationConfig;
use crate::models::{IterationRecord, StagnationInfo};

static TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9_]+").expect("token regex"));

/// What the recent window looks like, used to pick the recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowPattern {
    Identical,
    NearIdentical,
    OscillatingScores,
    DecliningScores,
    Plateau,
}

pub struct StagnationDetector {
    config: StagnationConfig,
}

impl StagnationDetector {
    pub fn new(config: StagnationConfig) -> Self {
        Self { config }
    }

    /// Analyze the iteration log. Returns a verdict only when the session
    /// is stagnant; analysis does not start before `start_loop` and needs
    /// at least two iterations in the window.
    pub fn analyze(
        &self,
        iterations: &[IterationRecord],
        current_loop: u32,
    ) -> Option<StagnationInfo> {
        if current_loop < self.config.start_loop {
            return None;
        }
        let window_len = self.config.recent_window.max(2);
        if iterations.len() < 2 {
            return None;
        }
        let window = &iterations[iterations.len().saturating_sub(window_len)..];

        let mut pair_scores = Vec::new();
        for i in 0..window.len() {
            for j in (i + 1)..window.len() {
                pair_scores.push(jaccard(
                    &window[i].normalized_code,
                    &window[j].normalized_code,
                ));
            }
        }
        if pair_scores.is_empty() {
            return None;
        }

        let mean = pair_scores.iter().sum::<f64>() / pair_scores.len() as f64;
        let max_pair = pair_scores.iter().copied().fold(0.0_f64, f64::max);
        debug!(
            current_loop,
            mean_similarity = mean,
            max_pair,
            "stagnation window analyzed"
        );

        let is_stagnant =
            mean >= self.config.threshold || max_pair >= self.config.identical_threshold;
        if !is_stagnant {
            return None;
        }

        let pattern = classify_pattern(window, max_pair, self.config.identical_threshold);
        Some(StagnationInfo {
            is_stagnant: true,
            detected_at_loop: current_loop,
            similarity_score: mean.clamp(0.0, 1.0),
            recommendation: recommendation_for(pattern).to_string(),
        })
    }
}

/// Jaccard similarity of two token sets, in [0, 1].
pub fn jaccard(a: &str, b: &str) -> f64 {
    let tokens_a: HashSet<&str> = TOKEN.find_iter(a).map(|m| m.as_str()).collect();
    let tokens_b: HashSet<&str> = TOKEN.find_iter(b).map(|m| m.as_str()).collect();

    if tokens_a.is_empty() && tokens_b.is_empty() {
        return 1.0;
    }
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }
    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    intersection as f64 / union as f64
}

fn classify_pattern(
    window: &[IterationRecord],
    max_pair: f64,
    identical_threshold: f64,
) -> WindowPattern {
    let scores: Vec<i64> = window.iter().map(|i| i.review.overall as i64).collect();

    if max_pair >= 1.0 {
        return WindowPattern::Identical;
    }
    if scores.windows(2).all(|w| w[1] < w[0]) {
        return WindowPattern::DecliningScores;
    }
    if scores.len() >= 3 {
        let deltas: Vec<i64> = scores.windows(2).map(|w| w[1] - w[0]).collect();
        let alternating = deltas
            .windows(2)
            .all(|d| d[0] != 0 && d[1] != 0 && (d[0] > 0) != (d[1] > 0));
        if alternating {
            return WindowPattern::OscillatingScores;
        }
    }
    if scores.windows(2).all(|w| w[1] == w[0]) {
        return WindowPattern::Plateau;
    }
    if max_pair >= identical_threshold {
        return WindowPattern::Identical;
    }
    WindowPattern::NearIdentical
}

fn recommendation_for(pattern: WindowPattern) -> &'static str {
    match pattern {
        WindowPattern::Identical => {
            "Recent submissions are identical. Resubmitting the same code will not change \
             the verdict; address the outstanding reviewer comments or try a different approach."
        }
        WindowPattern::NearIdentical => {
            "Recent submissions are nearly identical. The changes are too small to move the \
             review; make a substantive revision before continuing."
        }
        WindowPattern::OscillatingScores => {
            "Scores are oscillating between revisions. Changes are being undone across \
             iterations; pick one direction and carry it through."
        }
        WindowPattern::DecliningScores => {
            "Scores are declining across revisions. Recent changes made things worse; revert \
             to the best-scoring iteration and restart from there."
        }
        WindowPattern::Plateau => {
            "Scores have plateaued. The remaining reviewer comments are not being addressed; \
             work through them directly instead of resubmitting variations."
        }
    }
}
