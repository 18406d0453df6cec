//! Pool Navigator
//!
//! Zero-round-trip narrowing. A sibling pool is walked two labels at a
//! time; a dichotomy pool narrows a candidate-id set through binary duels.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::drill_down::Choice;

/// Convergence threshold for dichotomy narrowing.
pub const CONVERGED_AT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPair<'a> {
    Duel(&'a str, &'a str),
    Solo(&'a str),
    Exhausted,
}

pub fn get_pair(pool: &[String], index: usize) -> PoolPair<'_> {
    match (pool.get(index), pool.get(index + 1)) {
        (Some(a), Some(b)) => PoolPair::Duel(a, b),
        (Some(a), None) => PoolPair::Solo(a),
        _ => PoolPair::Exhausted,
    }
}

pub fn advance(index: usize) -> usize {
    index + 2
}

pub fn rewind(index: usize) -> usize {
    index.saturating_sub(2)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DichotomyNode {
    pub question: String,
    pub label_a: String,
    pub label_b: String,
    pub ids_a: Vec<String>,
    pub ids_b: Vec<String>,
}

impl DichotomyNode {
    /// A duel is trivial when one side shares nothing with the candidates.
    pub fn is_trivial(&self, candidates: &[String]) -> bool {
        let live = |ids: &[String]| ids.iter().any(|id| candidates.contains(id));
        !live(&self.ids_a) || !live(&self.ids_b)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DichotomyPool {
    pub message: String,
    pub duels: Vec<DichotomyNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DichotomySnapshot {
    pub candidate_ids: Vec<String>,
    pub duel_index: usize,
}

/// First non-trivial duel at or after `from`, or `duels.len()`.
pub fn next_duel_index(candidates: &[String], duels: &[DichotomyNode], from: usize) -> usize {
    (from..duels.len())
        .find(|&i| !duels[i].is_trivial(candidates))
        .unwrap_or(duels.len())
}

pub fn is_converged(candidates: &[String], duels: &[DichotomyNode], duel_index: usize) -> bool {
    candidates.len() <= CONVERGED_AT || duel_index >= duels.len()
}

/// Apply `choice` to the duel at `duel_index`. Returns the new candidate set
/// and the index of the next playable duel.
pub fn apply_choice(
    candidate_ids: &[String],
    duels: &[DichotomyNode],
    duel_index: usize,
    choice: Choice,
) -> (Vec<String>, usize) {
    let Some(duel) = duels.get(duel_index) else {
        return (candidate_ids.to_vec(), duels.len());
    };

    let side: Option<HashSet<&String>> = match choice {
        Choice::A => Some(duel.ids_a.iter().collect()),
        Choice::B => Some(duel.ids_b.iter().collect()),
        Choice::Neither => None,
    };

    let candidates = match side {
        Some(side) => {
            let kept: Vec<String> = candidate_ids.iter().filter(|id| side.contains(id)).cloned().collect();
            // stale ids would empty the set
            if kept.is_empty() {
                candidate_ids.to_vec()
            } else {
                kept
            }
        }
        None => candidate_ids.to_vec(),
    };

    let next = next_duel_index(&candidates, duels, duel_index + 1);
    (candidates, next)
}

/// Dichotomy narrowing with a snapshot stack for `back`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DichotomyState {
    pub pool: DichotomyPool,
    pub candidates: Vec<String>,
    pub duel_index: usize,
    pub snapshots: Vec<DichotomySnapshot>,
}

impl DichotomyState {
    pub fn new(pool: DichotomyPool, candidates: Vec<String>) -> Self {
        let duel_index = next_duel_index(&candidates, &pool.duels, 0);
        Self { pool, candidates, duel_index, snapshots: Vec::new() }
    }

    pub fn current_duel(&self) -> Option<&DichotomyNode> {
        if self.is_converged() {
            return None;
        }
        self.pool.duels.get(self.duel_index)
    }

    pub fn is_converged(&self) -> bool {
        is_converged(&self.candidates, &self.pool.duels, self.duel_index)
    }

    pub fn choose(&mut self, choice: Choice) {
        self.snapshots.push(DichotomySnapshot {
            candidate_ids: self.candidates.clone(),
            duel_index: self.duel_index,
        });
        let (candidates, next) = apply_choice(&self.candidates, &self.pool.duels, self.duel_index, choice);
        self.candidates = candidates;
        self.duel_index = next;
    }

    /// Restore the state before the last choice. False when there is none.
    pub fn back(&mut self) -> bool {
        match self.snapshots.pop() {
            Some(snapshot) => {
                self.candidates = snapshot.candidate_ids;
                self.duel_index = snapshot.duel_index;
                true
            }
            None => false,
        }
    }
}
