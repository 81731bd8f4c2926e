//! Shared domain types: task states, priorities, worker health, and the
//! arbitration vocabulary.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Queued,
    Assigned,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Terminal states have no outgoing transitions, with the single
    /// exception of `failed -> queued` for retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskState {
    type Err = TaskStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskState`] string.
#[derive(Debug, Clone)]
pub struct TaskStateParseError(pub String);

impl fmt::Display for TaskStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task state: {:?}", self.0)
    }
}

impl std::error::Error for TaskStateParseError {}

// ---------------------------------------------------------------------------

/// Scheduling priority hint carried in task metadata.
///
/// Ordered so that `Low < Normal < High < Urgent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Priority`] string.
#[derive(Debug, Clone)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------

/// Health of a registered worker.
///
/// Ordered so that `Unhealthy < Degraded < Healthy`, which is the order used
/// by registry queries (`health >= min_health`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unhealthy,
    Degraded,
    Healthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unhealthy => "unhealthy",
            Self::Degraded => "degraded",
            Self::Healthy => "healthy",
        };
        f.write_str(s)
    }
}

impl FromStr for HealthStatus {
    type Err = HealthStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unhealthy" => Ok(Self::Unhealthy),
            "degraded" => Ok(Self::Degraded),
            "healthy" => Ok(Self::Healthy),
            other => Err(HealthStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`HealthStatus`] string.
#[derive(Debug, Clone)]
pub struct HealthStatusParseError(pub String);

impl fmt::Display for HealthStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid health status: {:?}", self.0)
    }
}

impl std::error::Error for HealthStatusParseError {}

// ---------------------------------------------------------------------------

/// A single worker's vote in an arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Deny,
    Abstain,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approve => "approve",
            Self::Deny => "deny",
            Self::Abstain => "abstain",
        };
        f.write_str(s)
    }
}

impl FromStr for Decision {
    type Err = DecisionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "deny" => Ok(Self::Deny),
            "abstain" => Ok(Self::Abstain),
            other => Err(DecisionParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Decision`] string.
#[derive(Debug, Clone)]
pub struct DecisionParseError(pub String);

impl fmt::Display for DecisionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid decision: {:?}", self.0)
    }
}

impl std::error::Error for DecisionParseError {}

// ---------------------------------------------------------------------------

/// Outcome of an arbitration. Abstain is a valid vote but never a final
/// decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalDecision {
    Approve,
    Deny,
}

impl fmt::Display for FinalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approve => "approve",
            Self::Deny => "deny",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// How closely a set of pleadings agrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusLevel {
    Unanimous,
    Strong,
    Weak,
    Contested,
}

impl fmt::Display for ConsensusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unanimous => "unanimous",
            Self::Strong => "strong",
            Self::Weak => "weak",
            Self::Contested => "contested",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Structs
// ---------------------------------------------------------------------------

/// Typed metadata attached to a task at intake. The payload itself stays an
/// opaque blob; this is the part the scheduler reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub content_type: String,
    pub encoding: String,
    pub priority_hint: Priority,
    pub required_capabilities: BTreeSet<String>,
    /// Free-form tag identifying where the task entered the system.
    pub surface: String,
}

impl Default for TaskMetadata {
    fn default() -> Self {
        Self {
            content_type: "application/json".to_string(),
            encoding: "utf-8".to_string(),
            priority_hint: Priority::Normal,
            required_capabilities: BTreeSet::new(),
            surface: String::new(),
        }
    }
}

/// A recorded move between task states. Append-only; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// A single worker's decision submitted to the arbitration board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PleadingDecision {
    pub id: String,
    pub worker_id: String,
    pub decision: Decision,
    /// Self-reported confidence in [0, 1].
    pub confidence: f64,
    pub reasoning: String,
    /// Opaque supporting material; only the verification layer interprets it.
    pub evidence: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Per-category tally in an arbitration breakdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionTally {
    pub count: usize,
    pub total_confidence: f64,
    pub workers: Vec<String>,
}

/// Vote counts and confidence totals per decision category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionBreakdown {
    pub approve: DecisionTally,
    pub deny: DecisionTally,
    pub abstain: DecisionTally,
}

impl DecisionBreakdown {
    pub fn tally(&self, decision: Decision) -> &DecisionTally {
        match decision {
            Decision::Approve => &self.approve,
            Decision::Deny => &self.deny,
            Decision::Abstain => &self.abstain,
        }
    }

    pub(crate) fn tally_mut(&mut self, decision: Decision) -> &mut DecisionTally {
        match decision {
            Decision::Approve => &mut self.approve,
            Decision::Deny => &mut self.deny,
            Decision::Abstain => &mut self.abstain,
        }
    }

    pub fn total(&self) -> usize {
        self.approve.count + self.deny.count + self.abstain.count
    }
}

/// The single decision an arbitration produces from N pleadings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrationResult {
    pub final_decision: FinalDecision,
    /// Overall confidence in [0, 1].
    pub confidence: f64,
    pub reasoning: Vec<String>,
    pub breakdown: DecisionBreakdown,
    pub consensus: ConsensusLevel,
    pub escalation_required: bool,
    pub participants: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
