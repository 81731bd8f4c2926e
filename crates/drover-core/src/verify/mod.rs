//! The narrow contract consumed from external verification adapters.
//!
//! Fact-checking, math checking, and code sandboxing live outside the core;
//! the core only sees a [`Verifier`] returning a verdict, a confidence, and
//! evidence. Each verifier declares its own deadline; the core enforces it
//! with [`verify_with_deadline`] so a hung provider turns into a typed
//! timeout instead of a stuck task. Retries and circuit breaking belong to
//! the adapters, never to the core.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one verification check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Verified,
    Refuted,
    Insufficient,
    Error,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Verified => "verified",
            Self::Refuted => "refuted",
            Self::Insufficient => "insufficient",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Kinds of supporting material a verification can cite. Distinct kinds
/// raise the evidence-richness multiplier in confidence scoring.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Sources,
    Citations,
    Calculations,
    Data,
    References,
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sources => "sources",
            Self::Citations => "citations",
            Self::Calculations => "calculations",
            Self::Data => "data",
            Self::References => "references",
        };
        f.write_str(s)
    }
}

impl FromStr for EvidenceKind {
    type Err = EvidenceKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sources" => Ok(Self::Sources),
            "citations" => Ok(Self::Citations),
            "calculations" => Ok(Self::Calculations),
            "data" => Ok(Self::Data),
            "references" => Ok(Self::References),
            other => Err(EvidenceKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EvidenceKind`] string.
#[derive(Debug, Clone)]
pub struct EvidenceKindParseError(pub String);

impl fmt::Display for EvidenceKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid evidence kind: {:?}", self.0)
    }
}

impl std::error::Error for EvidenceKindParseError {}

/// One piece of evidence attached to a verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub kind: EvidenceKind,
    pub detail: serde_json::Value,
}

/// The full result of a verification check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Name of the verifier that produced this report.
    pub verifier: String,
    pub verdict: Verdict,
    /// Provider confidence in [0, 1].
    pub confidence: f64,
    pub evidence: Vec<EvidenceItem>,
    pub checked_at: DateTime<Utc>,
}

impl VerificationReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.verdict, Verdict::Verified)
    }
}

/// A claim to be checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub task_id: String,
    pub statement: String,
    /// Opaque context for the provider (payload excerpts, locale, ...).
    pub metadata: serde_json::Value,
}

/// Errors from verification callouts.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("verification timed out after {0:?}")]
    Timeout(Duration),

    #[error("verification provider unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

/// A pluggable verification provider.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Stable provider name, used in reports and logs.
    fn name(&self) -> &str;

    /// Per-call deadline declared by the provider.
    fn deadline(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn verify(&self, claim: &Claim) -> Result<VerificationReport, VerifyError>;
}

/// Run a verification under the provider's declared deadline. Expiry cancels
/// the in-flight call and surfaces as [`VerifyError::Timeout`].
pub async fn verify_with_deadline(
    verifier: &dyn Verifier,
    claim: &Claim,
) -> Result<VerificationReport, VerifyError> {
    let deadline = verifier.deadline();
    match tokio::time::timeout(deadline, verifier.verify(claim)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                verifier = verifier.name(),
                task_id = %claim.task_id,
                deadline_ms = deadline.as_millis() as u64,
                "verification timed out"
            );
            Err(VerifyError::Timeout(deadline))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedVerifier {
        delay: Duration,
        deadline: Duration,
    }

    #[async_trait]
    impl Verifier for FixedVerifier {
        fn name(&self) -> &str {
            "fixed"
        }

        fn deadline(&self) -> Duration {
            self.deadline
        }

        async fn verify(&self, claim: &Claim) -> Result<VerificationReport, VerifyError> {
            tokio::time::sleep(self.delay).await;
            Ok(VerificationReport {
                verifier: "fixed".to_string(),
                verdict: Verdict::Verified,
                confidence: 0.9,
                evidence: vec![EvidenceItem {
                    kind: EvidenceKind::Sources,
                    detail: serde_json::json!({"claim": claim.statement}),
                }],
                checked_at: Utc::now(),
            })
        }
    }

    fn claim() -> Claim {
        Claim {
            task_id: "t1".to_string(),
            statement: "water is wet".to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn evidence_kind_roundtrip() {
        let kinds = [
            EvidenceKind::Sources,
            EvidenceKind::Citations,
            EvidenceKind::Calculations,
            EvidenceKind::Data,
            EvidenceKind::References,
        ];
        for k in &kinds {
            let parsed: EvidenceKind = k.to_string().parse().expect("should parse");
            assert_eq!(*k, parsed);
        }
        assert!("hearsay".parse::<EvidenceKind>().is_err());
    }

    #[tokio::test]
    async fn fast_provider_completes() {
        let verifier = FixedVerifier {
            delay: Duration::from_millis(0),
            deadline: Duration::from_secs(1),
        };
        let report = verify_with_deadline(&verifier, &claim()).await.unwrap();
        assert!(report.succeeded());
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let verifier = FixedVerifier {
            delay: Duration::from_millis(250),
            deadline: Duration::from_millis(10),
        };
        let err = verify_with_deadline(&verifier, &claim()).await.unwrap_err();
        assert!(matches!(err, VerifyError::Timeout(_)));
    }
}
