//! Consensus record retention
//!
//! Records stay in the active set for audit until `archive_before` moves
//! finished tasks out, and `prune_before` drops finished tasks for good. A
//! task may hold several records (one per dispatch round) but at most one
//! terminal record.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::ConsensusRecord;
use crate::state::TaskId;

#[derive(Default)]
struct ArchiveState {
    active: BTreeMap<TaskId, Vec<ConsensusRecord>>,
    archived: BTreeMap<TaskId, Vec<ConsensusRecord>>,
}

/// Storage for closed consensus records
#[derive(Default)]
pub struct ConsensusArchive {
    state: Mutex<ArchiveState>,
}

impl ConsensusArchive {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ArchiveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a closed record.
    ///
    /// Returns false, and drops the record, if it is still pending or if the
    /// task already has a terminal record.
    pub fn store(&self, record: ConsensusRecord) -> bool {
        if !record.is_closed() {
            warn!(task_id = %record.task_id, "Refusing to store a pending consensus record");
            return false;
        }
        let mut state = self.lock();
        let rounds = state.active.entry(record.task_id.clone()).or_default();
        if record.is_terminal() && rounds.iter().any(ConsensusRecord::is_terminal) {
            warn!(task_id = %record.task_id, "Task already has a terminal consensus record");
            return false;
        }
        debug!(
            task_id = %record.task_id,
            attempt = record.attempt,
            terminal = record.is_terminal(),
            "Consensus record stored"
        );
        rounds.push(record);
        true
    }

    /// Every stored round for a task, active or archived, in attempt order
    pub fn records(&self, task_id: &str) -> Vec<ConsensusRecord> {
        let state = self.lock();
        let mut records: Vec<ConsensusRecord> = state
            .active
            .get(task_id)
            .into_iter()
            .chain(state.archived.get(task_id))
            .flatten()
            .cloned()
            .collect();
        records.sort_by_key(|r| r.attempt);
        records
    }

    /// The terminal record of a task, if it has finished
    pub fn terminal(&self, task_id: &str) -> Option<ConsensusRecord> {
        self.records(task_id).into_iter().find(ConsensusRecord::is_terminal)
    }

    /// Whether a task id has been seen at all
    pub fn contains(&self, task_id: &str) -> bool {
        let state = self.lock();
        state.active.contains_key(task_id) || state.archived.contains_key(task_id)
    }

    /// Move finished tasks whose terminal record closed before `cutoff` to the
    /// archive; returns how many tasks moved
    pub fn archive_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.lock();
        let finished: Vec<TaskId> = state
            .active
            .iter()
            .filter(|(_, rounds)| {
                rounds
                    .iter()
                    .any(|r| r.is_terminal() && r.closed_at.is_some_and(|at| at < cutoff))
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &finished {
            if let Some(rounds) = state.active.remove(id) {
                state.archived.insert(id.clone(), rounds);
            }
        }
        if !finished.is_empty() {
            debug!(count = finished.len(), "Consensus records archived");
        }
        finished.len()
    }

    /// Drop every finished task whose terminal record closed before
    /// `cutoff`, active or archived; returns the ids dropped.
    ///
    /// A dropped id is no longer known to [`contains`](Self::contains).
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Vec<TaskId> {
        let expired = |rounds: &Vec<ConsensusRecord>| {
            rounds
                .iter()
                .any(|r| r.is_terminal() && r.closed_at.is_some_and(|at| at < cutoff))
        };
        let mut state = self.lock();
        let mut pruned = Vec::new();
        state.active.retain(|id, rounds| {
            let keep = !expired(rounds);
            if !keep {
                pruned.push(id.clone());
            }
            keep
        });
        state.archived.retain(|id, rounds| {
            let keep = !expired(rounds);
            if !keep {
                pruned.push(id.clone());
            }
            keep
        });
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "Consensus records pruned");
        }
        pruned
    }

    pub fn active_len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn archived_len(&self) -> usize {
        self.lock().archived.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ConsensusOutcome, ConsensusStrategy};
    use crate::error::ErrorKind;
    use crate::state::Tier;

    fn closed(task: &str, attempt: u32, outcome: ConsensusOutcome) -> ConsensusRecord {
        let mut record =
            ConsensusRecord::new(task, Tier::Neuronal, attempt, ConsensusStrategy::Majority, 1, 1);
        record.close(outcome);
        record
    }

    #[test]
    fn test_single_terminal_record_per_task() {
        let archive = ConsensusArchive::new();
        assert!(archive.store(closed(
            "t",
            1,
            ConsensusOutcome::Escalated { kind: ErrorKind::NoQuorum }
        )));
        assert!(archive.store(closed("t", 2, ConsensusOutcome::Failed { kind: ErrorKind::NoQuorum })));
        assert!(!archive.store(closed("t", 3, ConsensusOutcome::Failed { kind: ErrorKind::Timeout })));

        let records = archive.records("t");
        assert_eq!(records.len(), 2);
        assert_eq!(archive.terminal("t").unwrap().attempt, 2);
    }

    #[test]
    fn test_pending_records_rejected() {
        let archive = ConsensusArchive::new();
        let pending = ConsensusRecord::new("t", Tier::Swarm, 1, ConsensusStrategy::Majority, 1, 1);
        assert!(!archive.store(pending));
        assert!(!archive.contains("t"));
    }

    #[test]
    fn test_archive_before_moves_finished_tasks() {
        let archive = ConsensusArchive::new();
        archive.store(closed("done", 1, ConsensusOutcome::Failed { kind: ErrorKind::NoQuorum }));
        archive.store(closed(
            "open",
            1,
            ConsensusOutcome::Escalated { kind: ErrorKind::NoQuorum },
        ));

        let moved = archive.archive_before(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(moved, 1);
        assert_eq!(archive.active_len(), 1);
        assert_eq!(archive.archived_len(), 1);
        // Archived records remain queryable
        assert!(archive.terminal("done").is_some());
    }

    #[test]
    fn test_prune_before_drops_only_finished_tasks() {
        let archive = ConsensusArchive::new();
        archive.store(closed("old", 1, ConsensusOutcome::Failed { kind: ErrorKind::Timeout }));
        archive.store(closed("moved", 1, ConsensusOutcome::Failed { kind: ErrorKind::NoQuorum }));
        archive.store(closed(
            "open",
            1,
            ConsensusOutcome::Escalated { kind: ErrorKind::NoQuorum },
        ));
        let later = Utc::now() + chrono::Duration::seconds(1);
        archive.archive_before(later);
        assert_eq!(archive.archived_len(), 2);

        // Nothing closed before this cutoff
        let earlier = Utc::now() - chrono::Duration::hours(1);
        assert!(archive.prune_before(earlier).is_empty());

        let mut pruned = archive.prune_before(later);
        pruned.sort();
        assert_eq!(pruned, vec!["moved".to_string(), "old".to_string()]);
        assert!(!archive.contains("old"));
        assert_eq!(archive.archived_len(), 0);
        assert_eq!(archive.records("open").len(), 1);
    }
}
