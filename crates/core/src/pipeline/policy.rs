//! Automated policy gate for drafted answers.

use crate::config::PolicyThresholds;
use crate::model::{PendingCandidate, PolicyScore};

/// Outcome of scoring one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    /// Every sub-score cleared its threshold; eligible for automatic commit.
    Clear,
    /// Needs a human. Carries one reason per failed check.
    Review(Vec<String>),
}

impl PolicyVerdict {
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Clear => None,
            Self::Review(reasons) => Some(reasons.join("; ")),
        }
    }
}

/// Score a policy result against the thresholds.
///
/// NaN never clears a threshold.
#[allow(clippy::neg_cmp_op_on_partial_ord)]
pub fn evaluate_score(score: &PolicyScore, thresholds: &PolicyThresholds) -> Vec<String> {
    let mut failures = Vec::new();
    if !(score.sensitive_data <= thresholds.max_sensitive_data) {
        failures.push(format!(
            "sensitive_data {:.2} above {:.2}",
            score.sensitive_data, thresholds.max_sensitive_data
        ));
    }
    if !(score.genericness >= thresholds.min_genericness) {
        failures.push(format!("genericness {:.2} below {:.2}", score.genericness, thresholds.min_genericness));
    }
    if !(score.actionability >= thresholds.min_actionability) {
        failures.push(format!(
            "actionability {:.2} below {:.2}",
            score.actionability, thresholds.min_actionability
        ));
    }
    if !(score.safety >= thresholds.min_safety) {
        failures.push(format!("safety {:.2} below {:.2}", score.safety, thresholds.min_safety));
    }
    failures
}

/// Decide whether a candidate may skip human review.
pub fn evaluate(candidate: &PendingCandidate, thresholds: &PolicyThresholds) -> PolicyVerdict {
    let mut reasons = evaluate_score(&candidate.policy_score, thresholds);
    if candidate.requires_human {
        reasons.insert(0, "flagged for human review".to_string());
    }
    if let Some(reason) = &candidate.failure_reason {
        reasons.push(format!("drafting reported: {reason}"));
    }

    if reasons.is_empty() { PolicyVerdict::Clear } else { PolicyVerdict::Review(reasons) }
}
