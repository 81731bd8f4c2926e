//! Confidence scoring: a weight-normalized blend of verification results,
//! evidence quality, worker track record, and arbitration history.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::verify::{EvidenceKind, VerificationReport};

/// Each distinct evidence kind adds this much to the richness multiplier.
const RICHNESS_PER_KIND: f64 = 0.2;

/// Cap on the accuracy bonus added to the worker-history factor.
const ACCURACY_BONUS: f64 = 0.2;

/// Per-factor weights. Defaults follow the standard blend; optional signals
/// default to zero weight and only participate when enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerWeights {
    pub verification_success_rate: f64,
    pub evidence_quality: f64,
    pub worker_history: f64,
    pub arbitration_wins: f64,
    pub policy_compliance: f64,
    pub model_reliability: f64,
    pub source_credibility: f64,
}

impl Default for ScorerWeights {
    fn default() -> Self {
        Self {
            verification_success_rate: 0.40,
            evidence_quality: 0.30,
            worker_history: 0.20,
            arbitration_wins: 0.10,
            policy_compliance: 0.0,
            model_reliability: 0.0,
            source_credibility: 0.0,
        }
    }
}

/// Score boundaries for the qualitative confidence levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerThresholds {
    pub very_high: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for ScorerThresholds {
    fn default() -> Self {
        Self {
            very_high: 0.9,
            high: 0.8,
            medium: 0.6,
            low: 0.4,
        }
    }
}

/// Scorer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    pub weights: ScorerWeights,
    pub thresholds: ScorerThresholds,
}

/// Qualitative bucket for a confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    VeryHigh,
    High,
    Medium,
    Low,
    VeryLow,
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::VeryHigh => "very_high",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::VeryLow => "very_low",
        };
        f.write_str(s)
    }
}

/// A worker's task track record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHistory {
    pub total_tasks: u64,
    pub successful_tasks: u64,
    /// Mean historical accuracy in [0, 1].
    pub average_accuracy: f64,
}

/// A worker's arbitration track record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ArbitrationRecord {
    pub wins: u64,
    pub losses: u64,
}

/// A worker's policy-compliance record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ComplianceRecord {
    pub tasks: u64,
    pub violations: u64,
}

/// Everything known about one worker's decision on one task, fed to the
/// scorer. Missing pieces fall back to neutral values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerContext {
    pub verifications: Vec<VerificationReport>,
    pub history: Option<WorkerHistory>,
    pub arbitration: Option<ArbitrationRecord>,
    pub compliance: Option<ComplianceRecord>,
    pub model_reliability: Option<f64>,
    pub source_credibility: Option<f64>,
}

/// A computed confidence score with its factor breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceScore {
    /// Weight-normalized blend, clamped to [0, 1].
    pub value: f64,
    pub level: ConfidenceLevel,
    pub factors: BTreeMap<String, f64>,
}

/// Computes a score in [0, 1] for a single worker's decision.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceScorer {
    config: ScorerConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self { config }
    }

    /// Score one worker's decision from its context. The result is the
    /// weight-normalized sum of the enabled factors.
    pub fn score(&self, ctx: &WorkerContext) -> ConfidenceScore {
        let weights = &self.config.weights;
        let mut factors = BTreeMap::new();
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;

        let mut add = |name: &str, weight: f64, value: f64| {
            factors.insert(name.to_string(), value);
            weighted_sum += weight * value;
            weight_total += weight;
        };

        add(
            "verification_success_rate",
            weights.verification_success_rate,
            verification_success_rate(&ctx.verifications),
        );
        add(
            "evidence_quality",
            weights.evidence_quality,
            evidence_quality(&ctx.verifications),
        );
        add(
            "worker_history",
            weights.worker_history,
            worker_history_factor(ctx.history.as_ref()),
        );
        add(
            "arbitration_wins",
            weights.arbitration_wins,
            arbitration_factor(ctx.arbitration),
        );
        add(
            "policy_compliance",
            weights.policy_compliance,
            compliance_factor(ctx.compliance),
        );
        if let Some(reliability) = ctx.model_reliability {
            add(
                "model_reliability",
                weights.model_reliability,
                reliability.clamp(0.0, 1.0),
            );
        }
        if let Some(credibility) = ctx.source_credibility {
            add(
                "source_credibility",
                weights.source_credibility,
                credibility.clamp(0.0, 1.0),
            );
        }

        let value = if weight_total > 0.0 {
            (weighted_sum / weight_total).clamp(0.0, 1.0)
        } else {
            0.5
        };

        ConfidenceScore {
            value,
            level: self.level_for(value),
            factors,
        }
    }

    /// Bucket a score into its qualitative level.
    pub fn level_for(&self, value: f64) -> ConfidenceLevel {
        let t = &self.config.thresholds;
        if value >= t.very_high {
            ConfidenceLevel::VeryHigh
        } else if value >= t.high {
            ConfidenceLevel::High
        } else if value >= t.medium {
            ConfidenceLevel::Medium
        } else if value >= t.low {
            ConfidenceLevel::Low
        } else {
            ConfidenceLevel::VeryLow
        }
    }
}

/// Fraction of checks that verified. Neutral 0.5 when no checks ran.
fn verification_success_rate(verifications: &[VerificationReport]) -> f64 {
    if verifications.is_empty() {
        return 0.5;
    }
    let successes = verifications.iter().filter(|v| v.succeeded()).count();
    successes as f64 / verifications.len() as f64
}

/// Mean confidence of successful checks times the evidence-richness
/// multiplier. Neutral 0.5 when no checks ran; zero when checks ran and
/// none verified.
fn evidence_quality(verifications: &[VerificationReport]) -> f64 {
    if verifications.is_empty() {
        return 0.5;
    }
    let successful: Vec<&VerificationReport> =
        verifications.iter().filter(|v| v.succeeded()).collect();
    if successful.is_empty() {
        return 0.0;
    }

    let mean_confidence = successful.iter().map(|v| v.confidence).sum::<f64>()
        / successful.len() as f64;

    let kinds: std::collections::BTreeSet<EvidenceKind> = successful
        .iter()
        .flat_map(|v| v.evidence.iter().map(|e| e.kind))
        .collect();
    let richness = (kinds.len() as f64 * RICHNESS_PER_KIND).min(1.0);

    (mean_confidence * richness).clamp(0.0, 1.0)
}

/// Success ratio plus up to +0.2 from average accuracy, capped at 1.0.
/// New workers get a neutral 0.5.
fn worker_history_factor(history: Option<&WorkerHistory>) -> f64 {
    match history {
        Some(h) if h.total_tasks > 0 => {
            let base = h.successful_tasks as f64 / h.total_tasks as f64;
            (base + ACCURACY_BONUS * h.average_accuracy.clamp(0.0, 1.0)).min(1.0)
        }
        _ => 0.5,
    }
}

/// Win ratio; neutral 0.5 without arbitration history.
fn arbitration_factor(record: Option<ArbitrationRecord>) -> f64 {
    match record {
        Some(r) if r.wins + r.losses > 0 => r.wins as f64 / (r.wins + r.losses) as f64,
        _ => 0.5,
    }
}

/// `1 - violations/tasks`; a clean slate scores 1.0.
fn compliance_factor(record: Option<ComplianceRecord>) -> f64 {
    match record {
        Some(r) if r.tasks > 0 => (1.0 - r.violations as f64 / r.tasks as f64).clamp(0.0, 1.0),
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::{EvidenceItem, Verdict};
    use chrono::Utc;

    fn report(verdict: Verdict, confidence: f64, kinds: &[EvidenceKind]) -> VerificationReport {
        VerificationReport {
            verifier: "test".to_string(),
            verdict,
            confidence,
            evidence: kinds
                .iter()
                .map(|k| EvidenceItem {
                    kind: *k,
                    detail: serde_json::Value::Null,
                })
                .collect(),
            checked_at: Utc::now(),
        }
    }

    #[test]
    fn new_worker_scores_neutral() {
        let scorer = ConfidenceScorer::default();
        let score = scorer.score(&WorkerContext::default());
        assert!((score.value - 0.5).abs() < 0.11, "value {}", score.value);
    }

    #[test]
    fn success_rate_counts_verified_only() {
        assert_eq!(
            verification_success_rate(&[
                report(Verdict::Verified, 0.9, &[]),
                report(Verdict::Refuted, 0.9, &[]),
                report(Verdict::Insufficient, 0.9, &[]),
                report(Verdict::Verified, 0.9, &[]),
            ]),
            0.5
        );
    }

    #[test]
    fn evidence_richness_saturates_at_five_kinds() {
        let all = [
            EvidenceKind::Sources,
            EvidenceKind::Citations,
            EvidenceKind::Calculations,
            EvidenceKind::Data,
            EvidenceKind::References,
        ];
        let quality = evidence_quality(&[report(Verdict::Verified, 1.0, &all)]);
        assert!((quality - 1.0).abs() < f64::EPSILON);

        let one = evidence_quality(&[report(Verdict::Verified, 1.0, &[EvidenceKind::Data])]);
        assert!((one - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn evidence_quality_zero_when_nothing_verified() {
        let quality = evidence_quality(&[report(
            Verdict::Refuted,
            0.9,
            &[EvidenceKind::Sources],
        )]);
        assert_eq!(quality, 0.0);
    }

    #[test]
    fn history_factor_caps_at_one() {
        let factor = worker_history_factor(Some(&WorkerHistory {
            total_tasks: 10,
            successful_tasks: 10,
            average_accuracy: 1.0,
        }));
        assert!((factor - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn history_factor_neutral_for_new_worker() {
        assert_eq!(worker_history_factor(None), 0.5);
        assert_eq!(
            worker_history_factor(Some(&WorkerHistory {
                total_tasks: 0,
                successful_tasks: 0,
                average_accuracy: 0.0,
            })),
            0.5
        );
    }

    #[test]
    fn arbitration_factor_is_win_ratio() {
        assert_eq!(
            arbitration_factor(Some(ArbitrationRecord { wins: 3, losses: 1 })),
            0.75
        );
        assert_eq!(
            arbitration_factor(Some(ArbitrationRecord { wins: 0, losses: 0 })),
            0.5
        );
    }

    #[test]
    fn score_is_clamped_and_leveled() {
        let scorer = ConfidenceScorer::default();
        let ctx = WorkerContext {
            verifications: vec![report(
                Verdict::Verified,
                1.0,
                &[
                    EvidenceKind::Sources,
                    EvidenceKind::Citations,
                    EvidenceKind::Calculations,
                    EvidenceKind::Data,
                    EvidenceKind::References,
                ],
            )],
            history: Some(WorkerHistory {
                total_tasks: 100,
                successful_tasks: 100,
                average_accuracy: 1.0,
            }),
            arbitration: Some(ArbitrationRecord { wins: 10, losses: 0 }),
            ..Default::default()
        };
        let score = scorer.score(&ctx);
        assert!(score.value <= 1.0);
        assert_eq!(score.level, ConfidenceLevel::VeryHigh);
    }

    #[test]
    fn level_boundaries_are_inclusive() {
        let scorer = ConfidenceScorer::default();
        assert_eq!(scorer.level_for(0.9), ConfidenceLevel::VeryHigh);
        assert_eq!(scorer.level_for(0.8), ConfidenceLevel::High);
        assert_eq!(scorer.level_for(0.6), ConfidenceLevel::Medium);
        assert_eq!(scorer.level_for(0.4), ConfidenceLevel::Low);
        assert_eq!(scorer.level_for(0.39), ConfidenceLevel::VeryLow);
    }
}
