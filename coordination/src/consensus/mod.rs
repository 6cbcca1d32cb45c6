//! Consensus Engine
//!
//! Reconciles the results several agents returned for one task into a
//! single [`Decision`]. Each strategy is a pure function over the recorded
//! responses: the same set of responses yields the same decision whatever
//! order they are handed in. Arrival order is only ever consulted as a
//! late tie-breaker, never as the primary criterion.
//!
//! ```text
//! majority             most frequent value
//!                      tie: aggregate confidence, first arrival, value
//! weighted-confidence  largest summed confidence
//!                      tie: count, first arrival, value
//! first-quorum{k,tol}  first value that k responses agree with (numeric
//!                      values agree within tol)
//!                      tie: support, value
//! ```

pub mod archive;
pub mod strategy;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SwarmError};
use crate::state::{AgentId, BackendId, TaskId, Tier};

pub use archive::ConsensusArchive;

/// How to merge redundant results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConsensusStrategy {
    /// Mode of the discrete results
    #[default]
    Majority,
    /// Sum confidence per distinct result, pick the max
    WeightedConfidence,
    /// First `k` agreeing results, numeric values compared within `tolerance`
    FirstQuorum {
        k: usize,
        #[serde(default)]
        tolerance: f64,
    },
}

impl fmt::Display for ConsensusStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusStrategy::Majority => write!(f, "majority"),
            ConsensusStrategy::WeightedConfidence => write!(f, "weighted-confidence"),
            ConsensusStrategy::FirstQuorum { k, tolerance } => {
                write!(f, "first-quorum(k={}, tolerance={})", k, tolerance)
            }
        }
    }
}

/// Error type for consensus resolution
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConsensusError {
    #[error("No quorum for task {task_id}: got {got}, need {need}")]
    NoQuorum {
        task_id: TaskId,
        got: usize,
        need: usize,
    },
}

impl From<ConsensusError> for SwarmError {
    fn from(err: ConsensusError) -> Self {
        match err {
            ConsensusError::NoQuorum { task_id, got, need } => {
                SwarmError::NoQuorum { task_id, got, need }
            }
        }
    }
}

/// One agent's answer as recorded for consensus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub agent_id: AgentId,
    pub backend_id: BackendId,
    pub value: String,
    pub confidence: f32,
    /// Arrival sequence within the record, starting at 1
    pub arrival: u64,
    pub received_at: DateTime<Utc>,
}

/// An agent that failed to answer during a round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub agent_id: AgentId,
    pub kind: ErrorKind,
    pub detail: String,
}

/// The merged result of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub value: String,
    /// Mean confidence of the supporting responses
    pub confidence: f32,
    /// Number of responses backing `value`
    pub support: usize,
    /// Number of responses considered
    pub total: usize,
    pub strategy: ConsensusStrategy,
    /// Agents whose responses back `value`, sorted
    pub supporters: Vec<AgentId>,
    /// Backends that produced the supporting responses, sorted and deduplicated
    pub backends: Vec<BackendId>,
}

/// Where a consensus round ended up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusOutcome {
    Pending,
    Resolved(Decision),
    /// Round failed; the task was sent to another agent of the same tier
    Redispatched { kind: ErrorKind },
    /// Round closed without a decision; the task moved to the parent tier
    Escalated { kind: ErrorKind },
    /// Task failed terminally in this round
    Failed { kind: ErrorKind },
}

/// Audit record of one dispatch round of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRecord {
    pub task_id: TaskId,
    pub tier: Tier,
    /// Dispatch round, 1-indexed
    pub attempt: u32,
    pub strategy: ConsensusStrategy,
    pub min_quorum: usize,
    /// Number of agents the task was sent to
    pub fan_out: usize,
    responses: Vec<ResponseRecord>,
    failures: Vec<FailureRecord>,
    outcome: ConsensusOutcome,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ConsensusRecord {
    pub fn new(
        task_id: impl Into<TaskId>,
        tier: Tier,
        attempt: u32,
        strategy: ConsensusStrategy,
        min_quorum: usize,
        fan_out: usize,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            tier,
            attempt,
            strategy,
            min_quorum: min_quorum.max(1),
            fan_out,
            responses: Vec::new(),
            failures: Vec::new(),
            outcome: ConsensusOutcome::Pending,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    /// Record a response; returns its arrival sequence, or `None` once closed
    pub fn record_response(
        &mut self,
        agent_id: impl Into<AgentId>,
        backend_id: impl Into<BackendId>,
        value: impl Into<String>,
        confidence: f32,
    ) -> Option<u64> {
        if self.is_closed() {
            return None;
        }
        let arrival = self.responses.len() as u64 + 1;
        self.responses.push(ResponseRecord {
            agent_id: agent_id.into(),
            backend_id: backend_id.into(),
            value: value.into(),
            confidence,
            arrival,
            received_at: Utc::now(),
        });
        Some(arrival)
    }

    pub fn record_failure(
        &mut self,
        agent_id: impl Into<AgentId>,
        kind: ErrorKind,
        detail: impl Into<String>,
    ) {
        if self.is_closed() {
            return;
        }
        self.failures.push(FailureRecord {
            agent_id: agent_id.into(),
            kind,
            detail: detail.into(),
        });
    }

    pub fn responses(&self) -> &[ResponseRecord] {
        &self.responses
    }

    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    pub fn outcome(&self) -> &ConsensusOutcome {
        &self.outcome
    }

    /// Number of agents that have either answered or failed
    pub fn settled(&self) -> usize {
        self.responses.len() + self.failures.len()
    }

    pub fn is_closed(&self) -> bool {
        !matches!(self.outcome, ConsensusOutcome::Pending)
    }

    /// Resolved or failed; redispatched and escalated rounds hand the task on
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.outcome,
            ConsensusOutcome::Resolved(_) | ConsensusOutcome::Failed { .. }
        )
    }

    pub fn decision(&self) -> Option<&Decision> {
        match &self.outcome {
            ConsensusOutcome::Resolved(decision) => Some(decision),
            _ => None,
        }
    }

    /// Close the record; returns false if it was already closed
    pub fn close(&mut self, outcome: ConsensusOutcome) -> bool {
        if self.is_closed() || matches!(outcome, ConsensusOutcome::Pending) {
            return false;
        }
        self.outcome = outcome;
        self.closed_at = Some(Utc::now());
        true
    }

    /// Resolve with the record's own strategy and quorum
    pub fn resolve(&self) -> Result<Decision, ConsensusError> {
        resolve(self, &self.strategy)
    }
}

/// Merge the responses in `record` into a decision with `strategy`
pub fn resolve(
    record: &ConsensusRecord,
    strategy: &ConsensusStrategy,
) -> Result<Decision, ConsensusError> {
    let responses = record.responses();
    if responses.len() < record.min_quorum {
        return Err(ConsensusError::NoQuorum {
            task_id: record.task_id.clone(),
            got: responses.len(),
            need: record.min_quorum,
        });
    }

    let winner = match strategy {
        ConsensusStrategy::Majority => strategy::majority(responses),
        ConsensusStrategy::WeightedConfidence => strategy::weighted_confidence(responses),
        ConsensusStrategy::FirstQuorum { k, tolerance } => {
            strategy::first_quorum(responses, *k, *tolerance)
        }
    };

    let group = winner.ok_or_else(|| ConsensusError::NoQuorum {
        task_id: record.task_id.clone(),
        got: strategy::best_support(responses, strategy),
        need: strategy::required_support(strategy),
    })?;

    Ok(group.into_decision(strategy.clone(), responses.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(values: &[(&str, f32)], strategy: ConsensusStrategy) -> ConsensusRecord {
        let mut record =
            ConsensusRecord::new("task-1", Tier::Neuronal, 1, strategy, 1, values.len());
        for (i, (value, confidence)) in values.iter().enumerate() {
            record.record_response(format!("neuronal-{:02}", i + 1), "zamba", *value, *confidence);
        }
        record
    }

    #[test]
    fn test_majority_picks_mode() {
        let record = record_with(&[("x", 0.9), ("x", 0.9), ("y", 0.9)], ConsensusStrategy::Majority);
        let decision = record.resolve().unwrap();
        assert_eq!(decision.value, "x");
        assert_eq!(decision.support, 2);
        assert_eq!(decision.total, 3);
        assert_eq!(decision.supporters, vec!["neuronal-01", "neuronal-02"]);
        assert!((decision.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_majority_tie_uses_confidence() {
        let record = record_with(
            &[("x", 0.4), ("y", 0.9), ("x", 0.4), ("y", 0.8)],
            ConsensusStrategy::Majority,
        );
        assert_eq!(record.resolve().unwrap().value, "y");
    }

    #[test]
    fn test_weighted_confidence_beats_count() {
        let record = record_with(
            &[("x", 0.2), ("x", 0.2), ("y", 0.9)],
            ConsensusStrategy::WeightedConfidence,
        );
        assert_eq!(record.resolve().unwrap().value, "y");
    }

    #[test]
    fn test_first_quorum_numeric_tolerance() {
        let strategy = ConsensusStrategy::FirstQuorum { k: 2, tolerance: 0.05 };
        let record = record_with(&[("3.14", 0.5), ("2.0", 0.9), ("3.15", 0.5)], strategy);
        let decision = record.resolve().unwrap();
        assert_eq!(decision.support, 2);
        assert!(decision.value == "3.14" || decision.value == "3.15");
    }

    #[test]
    fn test_first_quorum_without_agreement_is_no_quorum() {
        let strategy = ConsensusStrategy::FirstQuorum { k: 2, tolerance: 0.0 };
        let record = record_with(&[("a", 0.5), ("b", 0.5)], strategy);
        assert!(matches!(
            record.resolve(),
            Err(ConsensusError::NoQuorum { got: 1, need: 2, .. })
        ));
    }

    #[test]
    fn test_min_quorum_enforced() {
        let mut record =
            ConsensusRecord::new("t", Tier::Swarm, 1, ConsensusStrategy::Majority, 3, 3);
        record.record_response("a", "b", "x", 0.9);
        record.record_failure("c", ErrorKind::Timeout, "deadline");
        let err = record.resolve().unwrap_err();
        assert_eq!(
            err,
            ConsensusError::NoQuorum {
                task_id: "t".into(),
                got: 1,
                need: 3
            }
        );
        assert_eq!(SwarmError::from(err).kind(), ErrorKind::NoQuorum);
    }

    #[test]
    fn test_closed_record_rejects_updates() {
        let mut record = record_with(&[("x", 0.9)], ConsensusStrategy::Majority);
        let decision = record.resolve().unwrap();
        assert!(record.close(ConsensusOutcome::Resolved(decision)));
        assert!(record.is_terminal());
        assert!(!record.close(ConsensusOutcome::Failed {
            kind: ErrorKind::NoQuorum
        }));
        assert_eq!(record.record_response("z", "b", "late", 1.0), None);
        assert_eq!(record.responses().len(), 1);
    }

    #[test]
    fn test_escalated_is_not_terminal() {
        let mut record = record_with(&[], ConsensusStrategy::Majority);
        assert!(record.close(ConsensusOutcome::Escalated {
            kind: ErrorKind::NoQuorum
        }));
        assert!(record.is_closed());
        assert!(!record.is_terminal());
    }

    #[test]
    fn test_strategy_serde_names() {
        let yaml = "first-quorum:\n  k: 2\n  tolerance: 0.1\n";
        let parsed: ConsensusStrategy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed, ConsensusStrategy::FirstQuorum { k: 2, tolerance: 0.1 });
        let parsed: ConsensusStrategy = serde_yaml::from_str("weighted-confidence").unwrap();
        assert_eq!(parsed, ConsensusStrategy::WeightedConfidence);
    }
}
