// Thread set diff between two snapshots

use crate::decoders::threads::mentions_wait;
use crate::model::Thread;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    /// Normalized id the diff matched on
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_function: Option<String>,
}

impl From<&Thread> for ThreadSummary {
    fn from(thread: &Thread) -> Self {
        Self {
            key: thread.identity_key(),
            name: thread.name.clone(),
            state: thread.state.clone(),
            top_function: thread.top_function().map(str::to_string),
        }
    }
}

/// A thread present in both snapshots whose state or top frame changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadChange {
    pub key: String,
    pub before_state: String,
    pub after_state: String,
    pub before_top: Option<String>,
    pub after_top: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadDiff {
    pub new_threads: Vec<ThreadSummary>,
    pub terminated_threads: Vec<ThreadSummary>,
    pub state_changes: Vec<ThreadChange>,
    pub baseline_waiting: usize,
    pub comparison_waiting: usize,
    /// More threads are waiting in the comparison snapshot than in the baseline
    pub potential_deadlock: bool,
}

/// A thread whose state or top function names a wait or lock primitive
pub fn is_waiting(thread: &Thread) -> bool {
    mentions_wait(&thread.state) || thread.top_function().is_some_and(mentions_wait)
}

/// Diff thread sets by normalized id
pub fn diff_threads(baseline: &[Thread], comparison: &[Thread]) -> ThreadDiff {
    let before_keys: HashSet<String> = baseline.iter().map(Thread::identity_key).collect();
    let after_keys: HashSet<String> = comparison.iter().map(Thread::identity_key).collect();

    let new_threads = comparison
        .iter()
        .filter(|t| !before_keys.contains(&t.identity_key()))
        .map(ThreadSummary::from)
        .collect();
    let terminated_threads = baseline
        .iter()
        .filter(|t| !after_keys.contains(&t.identity_key()))
        .map(ThreadSummary::from)
        .collect();

    let mut state_changes = Vec::new();
    for after in comparison {
        let key = after.identity_key();
        let Some(before) = baseline.iter().find(|t| t.identity_key() == key) else {
            continue;
        };
        let (before_top, after_top) = (before.top_function(), after.top_function());
        if before.state != after.state || before_top != after_top {
            state_changes.push(ThreadChange {
                key,
                before_state: before.state.clone(),
                after_state: after.state.clone(),
                before_top: before_top.map(str::to_string),
                after_top: after_top.map(str::to_string),
            });
        }
    }

    let baseline_waiting = baseline.iter().filter(|t| is_waiting(t)).count();
    let comparison_waiting = comparison.iter().filter(|t| is_waiting(t)).count();

    ThreadDiff {
        new_threads,
        terminated_threads,
        state_changes,
        baseline_waiting,
        comparison_waiting,
        potential_deadlock: comparison_waiting > baseline_waiting,
    }
}
