//! Arbitration: folds N competing worker decisions into one final decision
//! with a consensus classification and an escalation signal.
//!
//! The board never retries and never picks `abstain` as a final decision.
//! Boundary rules are fixed in one place: a category holding exactly half of
//! the votes classifies as `weak` (the `>= 50%` rule), and escalation on low
//! confidence uses strict `<`.

pub mod scorer;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{
    ArbitrationResult, ConsensusLevel, Decision, DecisionBreakdown, FinalDecision,
    PleadingDecision,
};
use self::scorer::{ConfidenceScorer, WorkerContext};

/// Per-vote weight added to a side's score on top of its mean confidence.
const COUNT_WEIGHT: f64 = 0.1;

/// Errors surfaced by the arbitration board.
#[derive(Debug, thiserror::Error)]
pub enum ArbitrationError {
    #[error("insufficient participants: required {required}, got {actual}")]
    InsufficientParticipants { required: usize, actual: usize },
}

/// Multiplier applied per consensus level in side scoring and overall
/// confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusWeights {
    pub unanimous: f64,
    pub strong: f64,
    pub weak: f64,
    pub contested: f64,
}

impl Default for ConsensusWeights {
    fn default() -> Self {
        Self {
            unanimous: 1.0,
            strong: 0.8,
            weak: 0.6,
            contested: 0.4,
        }
    }
}

impl ConsensusWeights {
    pub fn weight(&self, level: ConsensusLevel) -> f64 {
        match level {
            ConsensusLevel::Unanimous => self.unanimous,
            ConsensusLevel::Strong => self.strong,
            ConsensusLevel::Weak => self.weak,
            ConsensusLevel::Contested => self.contested,
        }
    }
}

/// Board configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationConfig {
    /// Fewer pleadings than this is an error.
    pub min_participants: usize,
    /// Results below this are flagged as low-confidence in the reasoning.
    pub confidence_threshold: f64,
    /// Strictly below this triggers escalation.
    pub escalation_threshold: f64,
    pub consensus_weights: ConsensusWeights,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            min_participants: 3,
            confidence_threshold: 0.6,
            escalation_threshold: 0.3,
            consensus_weights: ConsensusWeights::default(),
        }
    }
}

/// Per-worker context supplied by the caller for scoring.
#[derive(Debug, Clone, Default)]
pub struct ArbitrationContext {
    pub task_id: String,
    pub worker_contexts: HashMap<String, WorkerContext>,
}

/// Classify how closely a breakdown agrees.
///
/// `unanimous` when one category holds every vote; otherwise the largest
/// category's share decides: `>= 75%` strong, `>= 50%` weak, below that
/// contested.
pub fn classify_consensus(breakdown: &DecisionBreakdown) -> ConsensusLevel {
    let total = breakdown.total();
    let largest = breakdown
        .approve
        .count
        .max(breakdown.deny.count)
        .max(breakdown.abstain.count);

    if largest == total {
        return ConsensusLevel::Unanimous;
    }
    let share = largest as f64 / total as f64;
    if share >= 0.75 {
        ConsensusLevel::Strong
    } else if share >= 0.5 {
        ConsensusLevel::Weak
    } else {
        ConsensusLevel::Contested
    }
}

/// The arbitration board: a confidence scorer plus the decision rules.
#[derive(Debug, Default)]
pub struct ArbitrationBoard {
    config: ArbitrationConfig,
    scorer: ConfidenceScorer,
}

impl ArbitrationBoard {
    pub fn new(config: ArbitrationConfig, scorer: ConfidenceScorer) -> Self {
        Self { config, scorer }
    }

    pub fn config(&self) -> &ArbitrationConfig {
        &self.config
    }

    /// Combine N pleadings into one decision.
    ///
    /// Fails with [`ArbitrationError::InsufficientParticipants`] when fewer
    /// than `min_participants` pleadings arrive, or when every pleading
    /// abstains (no decisive participants to arbitrate between).
    pub fn arbitrate(
        &self,
        pleadings: &[PleadingDecision],
        context: &ArbitrationContext,
    ) -> Result<ArbitrationResult, ArbitrationError> {
        if pleadings.len() < self.config.min_participants {
            return Err(ArbitrationError::InsufficientParticipants {
                required: self.config.min_participants,
                actual: pleadings.len(),
            });
        }

        let mut breakdown = DecisionBreakdown::default();
        let mut reasoning = Vec::new();
        let default_ctx = WorkerContext::default();

        for pleading in pleadings {
            let confidence = pleading.confidence.clamp(0.0, 1.0);
            let tally = breakdown.tally_mut(pleading.decision);
            tally.count += 1;
            tally.total_confidence += confidence;
            tally.workers.push(pleading.worker_id.clone());

            let worker_ctx = context
                .worker_contexts
                .get(&pleading.worker_id)
                .unwrap_or(&default_ctx);
            let score = self.scorer.score(worker_ctx);
            reasoning.push(format!(
                "{} voted {} (stated confidence {:.2}, scored trust {:.2} / {})",
                pleading.worker_id, pleading.decision, confidence, score.value, score.level,
            ));
        }

        let decisive = breakdown.approve.count + breakdown.deny.count;
        if decisive == 0 {
            return Err(ArbitrationError::InsufficientParticipants {
                required: self.config.min_participants,
                actual: 0,
            });
        }

        let consensus = classify_consensus(&breakdown);
        let weight = self.config.consensus_weights.weight(consensus);

        let final_decision = if consensus == ConsensusLevel::Unanimous {
            // All votes are in one category and at least one is decisive,
            // so the unanimous category cannot be abstain.
            if breakdown.approve.count > 0 {
                FinalDecision::Approve
            } else {
                FinalDecision::Deny
            }
        } else {
            let approve_score = side_score(&breakdown.approve, weight);
            let deny_score = side_score(&breakdown.deny, weight);
            reasoning.push(format!(
                "weighted scores: approve {approve_score:.3}, deny {deny_score:.3}"
            ));
            if approve_score > deny_score {
                FinalDecision::Approve
            } else {
                FinalDecision::Deny
            }
        };

        let total = breakdown.total();
        let mean_confidence = pleadings
            .iter()
            .map(|p| p.confidence.clamp(0.0, 1.0))
            .sum::<f64>()
            / pleadings.len() as f64;
        let majority_share =
            breakdown.approve.count.max(breakdown.deny.count) as f64 / total as f64;
        let confidence =
            (0.4 * weight + 0.4 * mean_confidence + 0.2 * majority_share).clamp(0.0, 1.0);

        let abstain_ratio = breakdown.abstain.count as f64 / total as f64;
        let escalation_required = confidence < self.config.escalation_threshold
            || consensus == ConsensusLevel::Contested
            || abstain_ratio > 0.5;

        reasoning.push(format!(
            "consensus {consensus} ({} approve / {} deny / {} abstain), overall confidence {confidence:.2}",
            breakdown.approve.count, breakdown.deny.count, breakdown.abstain.count,
        ));
        if confidence < self.config.confidence_threshold {
            reasoning.push(format!(
                "confidence below quality gate {:.2}",
                self.config.confidence_threshold
            ));
        }
        if escalation_required {
            reasoning.push("escalation required".to_string());
        }

        tracing::info!(
            task_id = %context.task_id,
            %final_decision,
            %consensus,
            confidence,
            escalation_required,
            "arbitration resolved"
        );

        Ok(ArbitrationResult {
            final_decision,
            confidence,
            reasoning,
            breakdown,
            consensus,
            escalation_required,
            participants: pleadings.iter().map(|p| p.worker_id.clone()).collect(),
        })
    }
}

/// `mean confidence x consensus weight + count x 0.1`. Empty sides score
/// zero.
fn side_score(tally: &crate::model::DecisionTally, consensus_weight: f64) -> f64 {
    if tally.count == 0 {
        return 0.0;
    }
    (tally.total_confidence / tally.count as f64) * consensus_weight
        + tally.count as f64 * COUNT_WEIGHT
}
