//! Pure resolution functions, one per strategy
//!
//! Confidences are summed as integer micro-units so that aggregate weights
//! are exact and do not depend on summation order.

use std::collections::BTreeMap;

use super::{ConsensusStrategy, Decision, ResponseRecord};

const MICROS: f64 = 1_000_000.0;

fn micros(confidence: f32) -> u64 {
    (f64::from(confidence.clamp(0.0, 1.0)) * MICROS).round() as u64
}

/// Values compare after surrounding whitespace is stripped
pub fn normalize(value: &str) -> &str {
    value.trim()
}

/// Whether two values agree: equal after normalization, or both numeric
/// and within `tolerance` of each other
pub fn agrees(a: &str, b: &str, tolerance: f64) -> bool {
    let (a, b) = (normalize(a), normalize(b));
    if a == b {
        return true;
    }
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => (x - y).abs() <= tolerance.abs(),
        _ => false,
    }
}

/// Responses backing one candidate value
#[derive(Debug)]
pub(crate) struct Group<'a> {
    value: String,
    members: Vec<&'a ResponseRecord>,
}

impl<'a> Group<'a> {
    fn count(&self) -> usize {
        self.members.len()
    }

    fn weight(&self) -> u64 {
        self.members.iter().map(|r| micros(r.confidence)).sum()
    }

    fn first_arrival(&self) -> u64 {
        self.members.iter().map(|r| r.arrival).min().unwrap_or(u64::MAX)
    }

    /// Arrival of the k-th member, if the group has that many
    fn kth_arrival(&self, k: usize) -> Option<u64> {
        let mut arrivals: Vec<u64> = self.members.iter().map(|r| r.arrival).collect();
        arrivals.sort_unstable();
        arrivals.get(k.saturating_sub(1)).copied()
    }

    pub(crate) fn into_decision(self, strategy: ConsensusStrategy, total: usize) -> Decision {
        let support = self.count();
        let confidence = if support == 0 {
            0.0
        } else {
            (self.weight() as f64 / support as f64 / MICROS) as f32
        };
        let mut supporters: Vec<String> = self.members.iter().map(|r| r.agent_id.clone()).collect();
        supporters.sort();
        let mut backends: Vec<String> = self.members.iter().map(|r| r.backend_id.clone()).collect();
        backends.sort();
        backends.dedup();

        Decision {
            value: self.value,
            confidence,
            support,
            total,
            strategy,
            supporters,
            backends,
        }
    }
}

/// Group responses by exact normalized value, in value order
fn exact_groups(responses: &[ResponseRecord]) -> Vec<Group<'_>> {
    let mut groups: BTreeMap<&str, Vec<&ResponseRecord>> = BTreeMap::new();
    for response in responses {
        groups
            .entry(normalize(&response.value))
            .or_default()
            .push(response);
    }
    groups
        .into_iter()
        .map(|(value, members)| Group {
            value: value.to_string(),
            members,
        })
        .collect()
}

/// For every distinct value, the responses that agree with it within tolerance
fn tolerant_groups(responses: &[ResponseRecord], tolerance: f64) -> Vec<Group<'_>> {
    exact_groups(responses)
        .into_iter()
        .map(|candidate| Group {
            members: responses
                .iter()
                .filter(|r| agrees(&candidate.value, &r.value, tolerance))
                .collect(),
            value: candidate.value,
        })
        .collect()
}

/// Most frequent value; ties on aggregate confidence, then earliest
/// arrival, then lexicographic value
pub(crate) fn majority(responses: &[ResponseRecord]) -> Option<Group<'_>> {
    exact_groups(responses).into_iter().max_by(|a, b| {
        a.count()
            .cmp(&b.count())
            .then_with(|| a.weight().cmp(&b.weight()))
            .then_with(|| b.first_arrival().cmp(&a.first_arrival()))
            .then_with(|| b.value.cmp(&a.value))
    })
}

/// Largest summed confidence; ties on count, then earliest arrival, then value
pub(crate) fn weighted_confidence(responses: &[ResponseRecord]) -> Option<Group<'_>> {
    exact_groups(responses).into_iter().max_by(|a, b| {
        a.weight()
            .cmp(&b.weight())
            .then_with(|| a.count().cmp(&b.count()))
            .then_with(|| b.first_arrival().cmp(&a.first_arrival()))
            .then_with(|| b.value.cmp(&a.value))
    })
}

/// The value whose k-th agreeing response arrived first; ties on support,
/// then value. `None` when no value gathers k agreeing responses.
pub(crate) fn first_quorum(
    responses: &[ResponseRecord],
    k: usize,
    tolerance: f64,
) -> Option<Group<'_>> {
    let k = k.max(1);
    tolerant_groups(responses, tolerance)
        .into_iter()
        .filter_map(|g| g.kth_arrival(k).map(|at| (at, g)))
        .min_by(|(at_a, a), (at_b, b)| {
            at_a.cmp(at_b)
                .then_with(|| b.count().cmp(&a.count()))
                .then_with(|| a.value.cmp(&b.value))
        })
        .map(|(_, group)| group)
}

/// Largest group size the strategy could see, for NoQuorum reporting
pub(crate) fn best_support(responses: &[ResponseRecord], strategy: &ConsensusStrategy) -> usize {
    let groups = match strategy {
        ConsensusStrategy::FirstQuorum { tolerance, .. } => tolerant_groups(responses, *tolerance),
        _ => exact_groups(responses),
    };
    groups.iter().map(Group::count).max().unwrap_or(0)
}

/// Support a single value needs before the strategy accepts it
pub(crate) fn required_support(strategy: &ConsensusStrategy) -> usize {
    match strategy {
        ConsensusStrategy::FirstQuorum { k, .. } => (*k).max(1),
        _ => 1,
    }
}
