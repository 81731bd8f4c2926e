//! Integration tests for the arbitration board: the documented scenarios
//! plus exhaustive checks of the consensus and escalation boundary rules.

use chrono::Utc;

use drover_core::arbitration::scorer::ConfidenceScorer;
use drover_core::arbitration::{
    classify_consensus, ArbitrationBoard, ArbitrationConfig, ArbitrationContext,
};
use drover_core::model::{
    ConsensusLevel, Decision, DecisionBreakdown, FinalDecision, PleadingDecision,
};

fn pleading(worker_id: &str, decision: Decision, confidence: f64) -> PleadingDecision {
    PleadingDecision {
        id: format!("p-{worker_id}"),
        worker_id: worker_id.to_string(),
        decision,
        confidence,
        reasoning: format!("{worker_id} says {decision}"),
        evidence: serde_json::Value::Null,
        timestamp: Utc::now(),
    }
}

fn votes(spec: &[(Decision, f64)]) -> Vec<PleadingDecision> {
    spec.iter()
        .enumerate()
        .map(|(i, (decision, confidence))| pleading(&format!("w{i}"), *decision, *confidence))
        .collect()
}

fn ctx() -> ArbitrationContext {
    ArbitrationContext {
        task_id: "t1".to_string(),
        ..Default::default()
    }
}

#[test]
fn unanimous_approval_scenario() {
    let board = ArbitrationBoard::default();
    let result = board
        .arbitrate(
            &votes(&[
                (Decision::Approve, 0.9),
                (Decision::Approve, 0.8),
                (Decision::Approve, 0.85),
            ]),
            &ctx(),
        )
        .unwrap();

    assert_eq!(result.final_decision, FinalDecision::Approve);
    assert_eq!(result.consensus, ConsensusLevel::Unanimous);
    assert!(!result.escalation_required);
    assert!((result.confidence - 0.94).abs() < 1e-9);
    assert_eq!(result.breakdown.approve.count, 3);
    assert_eq!(result.breakdown.deny.count, 0);
    assert_eq!(
        result.participants,
        vec!["w0".to_string(), "w1".to_string(), "w2".to_string()]
    );
}

#[test]
fn split_vote_scenario() {
    let board = ArbitrationBoard::default();
    let result = board
        .arbitrate(
            &votes(&[
                (Decision::Approve, 0.6),
                (Decision::Approve, 0.5),
                (Decision::Deny, 0.7),
                (Decision::Deny, 0.8),
            ]),
            &ctx(),
        )
        .unwrap();

    // A 50/50 tie is weak, not contested: 2/4 reaches the half boundary.
    assert_eq!(result.consensus, ConsensusLevel::Weak);
    // score(approve) = 0.55 * 0.6 + 0.2 = 0.53
    // score(deny)    = 0.75 * 0.6 + 0.2 = 0.65
    assert_eq!(result.final_decision, FinalDecision::Deny);
    assert!(result.confidence >= 0.3);
    assert!(!result.escalation_required);
}

#[test]
fn final_decision_is_always_decisive() {
    // Sweep vote mixes: whatever the mix, the final decision is approve or
    // deny (never abstain), and a unanimous decisive vote matches every
    // non-abstaining participant.
    let board = ArbitrationBoard::default();
    let decisions = [Decision::Approve, Decision::Deny, Decision::Abstain];

    for a in decisions {
        for b in decisions {
            for c in decisions {
                let pleadings = votes(&[(a, 0.7), (b, 0.6), (c, 0.8)]);
                match board.arbitrate(&pleadings, &ctx()) {
                    Ok(result) => {
                        // Property: the result is one of the two decisive
                        // categories.
                        let decisive: Vec<Decision> = [a, b, c]
                            .into_iter()
                            .filter(|d| *d != Decision::Abstain)
                            .collect();
                        assert!(!decisive.is_empty());

                        if result.consensus == ConsensusLevel::Unanimous {
                            let expected = match decisive[0] {
                                Decision::Approve => FinalDecision::Approve,
                                Decision::Deny => FinalDecision::Deny,
                                Decision::Abstain => unreachable!(),
                            };
                            assert!(decisive.iter().all(|d| *d == decisive[0]));
                            assert_eq!(result.final_decision, expected);
                        }
                    }
                    Err(_) => {
                        // Only the all-abstain mix may error.
                        assert!(
                            [a, b, c].iter().all(|d| *d == Decision::Abstain),
                            "unexpected error for mix {a}/{b}/{c}"
                        );
                    }
                }
            }
        }
    }
}

#[test]
fn contested_exactly_when_no_category_reaches_half() {
    // Directly check the classifier over count triples.
    for approve in 0..=4usize {
        for deny in 0..=4usize {
            for abstain in 0..=4usize {
                let total = approve + deny + abstain;
                if total == 0 {
                    continue;
                }
                let mut breakdown = DecisionBreakdown::default();
                breakdown.approve.count = approve;
                breakdown.deny.count = deny;
                breakdown.abstain.count = abstain;

                let level = classify_consensus(&breakdown);
                let largest = approve.max(deny).max(abstain);
                let reaches_half = (largest * 2) >= total;
                assert_eq!(
                    level == ConsensusLevel::Contested,
                    !reaches_half,
                    "{approve}/{deny}/{abstain}"
                );
            }
        }
    }
}

#[test]
fn escalates_on_low_confidence_but_not_at_threshold() {
    // Weak consensus, minimal confidences: 0.4*0.6 + 0.4*mean + 0.2*(2/3).
    // With mean 0.0 the total is 0.373; set the threshold just above and
    // below to check the strict comparison.
    let pleadings = votes(&[
        (Decision::Approve, 0.0),
        (Decision::Approve, 0.0),
        (Decision::Deny, 0.0),
    ]);

    let exactly = ArbitrationBoard::new(
        ArbitrationConfig {
            escalation_threshold: 0.4 * 0.6 + 0.2 * (2.0 / 3.0),
            ..Default::default()
        },
        ConfidenceScorer::default(),
    );
    let result = exactly.arbitrate(&pleadings, &ctx()).unwrap();
    assert!(
        !result.escalation_required,
        "confidence equal to the threshold must not escalate"
    );

    let above = ArbitrationBoard::new(
        ArbitrationConfig {
            escalation_threshold: 0.4 * 0.6 + 0.2 * (2.0 / 3.0) + 1e-6,
            ..Default::default()
        },
        ConfidenceScorer::default(),
    );
    let result = above.arbitrate(&pleadings, &ctx()).unwrap();
    assert!(result.escalation_required);
}

#[test]
fn abstain_majority_escalates() {
    let board = ArbitrationBoard::default();
    let result = board
        .arbitrate(
            &votes(&[
                (Decision::Abstain, 0.9),
                (Decision::Abstain, 0.9),
                (Decision::Abstain, 0.9),
                (Decision::Deny, 0.9),
                (Decision::Approve, 0.4),
            ]),
            &ctx(),
        )
        .unwrap();

    assert!(result.escalation_required);
    assert_ne!(result.consensus, ConsensusLevel::Contested);
}

#[test]
fn breakdown_totals_track_stated_confidence() {
    let board = ArbitrationBoard::default();
    let result = board
        .arbitrate(
            &votes(&[
                (Decision::Approve, 0.6),
                (Decision::Approve, 0.4),
                (Decision::Deny, 0.9),
            ]),
            &ctx(),
        )
        .unwrap();

    assert_eq!(result.breakdown.approve.count, 2);
    assert!((result.breakdown.approve.total_confidence - 1.0).abs() < 1e-9);
    assert_eq!(result.breakdown.approve.workers, vec!["w0", "w1"]);
    assert_eq!(result.breakdown.deny.workers, vec!["w2"]);
}

#[test]
fn min_participants_is_configurable() {
    let board = ArbitrationBoard::new(
        ArbitrationConfig {
            min_participants: 5,
            ..Default::default()
        },
        ConfidenceScorer::default(),
    );
    let err = board
        .arbitrate(
            &votes(&[
                (Decision::Approve, 0.9),
                (Decision::Approve, 0.9),
                (Decision::Approve, 0.9),
                (Decision::Approve, 0.9),
            ]),
            &ctx(),
        )
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("required 5"));
    assert!(message.contains("got 4"));
}
