//! Tiered completion evaluation and the hard kill switch.
//!
//! Tiers trade score against patience: a higher score completes earlier.
//! Evaluation is monotone in both score and loop count (once complete,
//! raising either keeps it complete), and loop 25 terminates regardless
//! of score. When stagnation and the loop cap both hold, stagnation wins
//! the reason text.

use crate::models::{
    CompletionReason, CompletionResult, SessionState, TerminationResult, Verdict,
};

/// `(score, minLoop)` acceptance tiers, most ambitious first.
const TIERS: [(u8, u32, CompletionReason); 3] = [
    (95, 10, CompletionReason::Score95At10),
    (90, 15, CompletionReason::Score90At15),
    (85, 20, CompletionReason::Score85At20),
];

/// Hard stop: no session runs past this loop count.
pub const MAX_LOOPS: u32 = 25;

/// How many trailing iterations are scanned for CRITICAL inline comments.
const CRITICAL_SCAN_WINDOW: usize = 10;

pub struct CompletionEvaluator;

impl CompletionEvaluator {
    /// Evaluate the tiers in order; the first match wins, then the kill
    /// switch, then in-progress with a message naming the missing piece.
    pub fn evaluate(score: u8, loop_count: u32) -> CompletionResult {
        for (min_score, min_loop, reason) in TIERS {
            if score >= min_score && loop_count >= min_loop {
                return CompletionResult {
                    is_complete: true,
                    reason,
                    next_thought_needed: false,
                    message: format!(
                        "Completion criteria met: score {score} >= {min_score} at loop {loop_count} (tier minimum {min_loop})"
                    ),
                };
            }
        }

        if loop_count >= MAX_LOOPS {
            return CompletionResult {
                is_complete: true,
                reason: CompletionReason::MaxLoopsReached,
                next_thought_needed: false,
                message: format!(
                    "Maximum loops ({MAX_LOOPS}) reached at score {score}; terminating without completion criteria"
                ),
            };
        }

        // Name the gap for the most ambitious tier the score already meets,
        // or the score shortfall when no tier is reachable yet.
        let message = match TIERS.iter().find(|(min_score, _, _)| score >= *min_score) {
            Some((min_score, min_loop, _)) => format!(
                "Score {score} meets the {min_score}-point tier; {} more loop(s) until loop {min_loop}",
                min_loop - loop_count
            ),
            None => {
                let (lowest_score, _, _) = TIERS[TIERS.len() - 1];
                format!("Score {score} below the lowest completion tier ({lowest_score})")
            }
        };

        CompletionResult {
            is_complete: false,
            reason: CompletionReason::InProgress,
            next_thought_needed: true,
            message,
        }
    }

    /// Decide whether the session must terminate now. Stagnation takes
    /// precedence over the loop cap in the reason text.
    pub fn should_terminate(session: &SessionState) -> TerminationResult {
        if let Some(stagnation) = &session.stagnation_info
            && stagnation.is_stagnant
        {
            return TerminationResult {
                should_terminate: true,
                reason: format!("Stagnation detected: {}", stagnation.recommendation),
                failure_rate: failure_rate(session),
                critical_issues: critical_issues(session),
                final_assessment: format!(
                    "Session stagnated at loop {} with mean similarity {:.2}",
                    stagnation.detected_at_loop, stagnation.similarity_score
                ),
            };
        }

        if session.current_loop >= MAX_LOOPS {
            let rate = failure_rate(session);
            return TerminationResult {
                should_terminate: true,
                reason: format!(
                    "Maximum loops ({MAX_LOOPS}) reached without achieving completion criteria"
                ),
                failure_rate: rate,
                critical_issues: critical_issues(session),
                final_assessment: format!(
                    "Terminated after {} loops; {:.0}% of iterations were rejected",
                    session.current_loop,
                    rate * 100.0
                ),
            };
        }

        TerminationResult::none()
    }
}

/// Fraction of iterations whose verdict was `reject`. Empty log → 0.
fn failure_rate(session: &SessionState) -> f64 {
    if session.iterations.is_empty() {
        return 0.0;
    }
    let rejects = session
        .iterations
        .iter()
        .filter(|i| i.review.verdict == Verdict::Reject)
        .count();
    rejects as f64 / session.iterations.len() as f64
}

/// Inline comments containing "CRITICAL" across the recent iterations.
fn critical_issues(session: &SessionState) -> Vec<String> {
    let start = session.iterations.len().saturating_sub(CRITICAL_SCAN_WINDOW);
    let mut issues = Vec::new();
    for iteration in &session.iterations[start..] {
        for comment in &iteration.review.review.inline {
            if comment.comment.contains("CRITICAL") {
                let formatted = format!("{}:{} {}", comment.path, comment.line, comment.comment);
                if !issues.contains(&formatted) {
                    issues.push(formatted);
                }
            }
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InlineComment, IterationRecord, Review, StagnationInfo};

    fn session_with_iterations(count: usize, verdict: Verdict) -> SessionState {
        let mut session = SessionState::new("s1", None);
        for n in 0..count {
            let mut review = Review::fallback("t");
            review.verdict = verdict;
            session
                .append_iteration(IterationRecord {
                    thought_number: n as u32 + 1,
                    code_fingerprint: "f".repeat(64),
                    normalized_code: format!("code {n}"),
                    review,
                    timestamp_ms: n as i64,
                })
                .unwrap();
        }
        session
    }

    #[test]
    fn test_tier_one() {
        let result = CompletionEvaluator::evaluate(95, 10);
        assert!(result.is_complete);
        assert_eq!(result.reason, CompletionReason::Score95At10);
        assert!(!result.next_thought_needed);
    }

    #[test]
    fn test_tier_two_and_three() {
        assert_eq!(
            CompletionEvaluator::evaluate(90, 15).reason,
            CompletionReason::Score90At15
        );
        assert_eq!(
            CompletionEvaluator::evaluate(85, 20).reason,
            CompletionReason::Score85At20
        );
    }

    #[test]
    fn test_higher_tier_preferred_when_multiple_qualify() {
        // Score 97 at loop 21 satisfies all three tiers; tier 1 wins
        assert_eq!(
            CompletionEvaluator::evaluate(97, 21).reason,
            CompletionReason::Score95At10
        );
    }

    #[test]
    fn test_high_score_before_minimum_loop_is_in_progress() {
        let result = CompletionEvaluator::evaluate(98, 5);
        assert!(!result.is_complete);
        assert!(result.next_thought_needed);
        assert!(result.message.contains("more loop"));
    }

    #[test]
    fn test_low_score_message_names_threshold() {
        let result = CompletionEvaluator::evaluate(60, 5);
        assert!(!result.is_complete);
        assert!(result.message.contains("below"));
        assert!(result.message.contains("85"));
    }

    #[test]
    fn test_kill_switch_ignores_score() {
        let result = CompletionEvaluator::evaluate(10, 25);
        assert!(result.is_complete);
        assert_eq!(result.reason, CompletionReason::MaxLoopsReached);
    }

    #[test]
    fn test_monotone_in_score_and_loop() {
        // Every complete point stays complete when score or loop rises
        for score in 0..=100 {
            for loop_count in 0..=30 {
                let base = CompletionEvaluator::evaluate(score, loop_count);
                if base.is_complete {
                    assert!(
                        CompletionEvaluator::evaluate((score + 1).min(100), loop_count).is_complete,
                        "raising score broke completion at ({score}, {loop_count})"
                    );
                    assert!(
                        CompletionEvaluator::evaluate(score, loop_count + 1).is_complete,
                        "raising loop broke completion at ({score}, {loop_count})"
                    );
                }
            }
        }
    }

    #[test]
    fn test_empty_session_does_not_terminate() {
        let session = SessionState::new("s1", None);
        let result = CompletionEvaluator::should_terminate(&session);
        assert!(!result.should_terminate);
        assert_eq!(result.failure_rate, 0.0);
    }

    #[test]
    fn test_max_loops_termination_with_failure_rate() {
        let session = session_with_iterations(25, Verdict::Reject);
        let result = CompletionEvaluator::should_terminate(&session);
        assert!(result.should_terminate);
        assert!(result.reason.contains("Maximum loops (25) reached"));
        assert_eq!(result.failure_rate, 1.0);
    }

    #[test]
    fn test_stagnation_takes_precedence_over_max_loops() {
        let mut session = session_with_iterations(25, Verdict::Reject);
        session.stagnation_info = Some(StagnationInfo {
            is_stagnant: true,
            detected_at_loop: 12,
            similarity_score: 0.98,
            recommendation: "try a different approach".to_string(),
        });
        let result = CompletionEvaluator::should_terminate(&session);
        assert!(result.should_terminate);
        assert!(result.reason.contains("Stagnation"));
        assert!(!result.reason.contains("Maximum loops"));
    }

    #[test]
    fn test_critical_issues_extracted_from_recent_inline() {
        let mut session = session_with_iterations(24, Verdict::Reject);
        let mut review = Review::fallback("bad");
        review.verdict = Verdict::Reject;
        review.review.inline.push(InlineComment {
            path: "src/auth.rs".to_string(),
            line: 7,
            comment: "CRITICAL: token compared without constant-time equality".to_string(),
        });
        session
            .append_iteration(IterationRecord {
                thought_number: 25,
                code_fingerprint: "f".repeat(64),
                normalized_code: "code".to_string(),
                review,
                timestamp_ms: 99,
            })
            .unwrap();

        let result = CompletionEvaluator::should_terminate(&session);
        assert!(result.should_terminate);
        assert_eq!(result.critical_issues.len(), 1);
        assert!(result.critical_issues[0].contains("src/auth.rs:7"));
    }

    #[test]
    fn test_failure_rate_partial() {
        let mut session = session_with_iterations(3, Verdict::Reject);
        let mut review = Review::fallback("ok");
        review.verdict = Verdict::Pass;
        session
            .append_iteration(IterationRecord {
                thought_number: 4,
                code_fingerprint: "f".repeat(64),
                normalized_code: "code".to_string(),
                review,
                timestamp_ms: 50,
            })
            .unwrap();
        assert_eq!(failure_rate(&session), 0.75);
    }
}
