//! Lock graph deadlock heuristic
//!
//! Builds the set of threads holding a monitor and the set of threads
//! blocked in a wait, and reports their intersection. Two or more threads
//! that both hold a lock and wait is reported as a deadlock; a single one is
//! only an advisory.
//!
//! This is a necessary condition for a deadlock, not a proof: the lock table
//! does not say which lock a waiting thread is waiting for, so no wait-for
//! cycle is constructed.

use crate::decoders::ThreadState;
use crate::model::{LockTable, ThreadId};
use serde::{Deserialize, Serialize};

/// Threads in `holders ∩ waiting` needed to report a deadlock
pub const MIN_DEADLOCK_THREADS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlockVerdict {
    #[default]
    None,
    /// One thread holds a lock and waits; suspicious but not a deadlock
    Advisory,
    Deadlock,
}

/// A held lock with waiters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContendedLock {
    pub lock_id: String,
    pub owner: Option<ThreadId>,
    pub waiters: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadlockAnalysis {
    pub verdict: DeadlockVerdict,
    /// Threads that hold a lock and are waiting
    pub involved_threads: Vec<ThreadId>,
    pub holders: Vec<ThreadId>,
    pub waiting: Vec<ThreadId>,
    pub contended_locks: Vec<ContendedLock>,
    pub description: String,
}

impl DeadlockAnalysis {
    pub fn is_deadlock(&self) -> bool {
        self.verdict == DeadlockVerdict::Deadlock
    }
}

/// Deduplicate by lenient id matching, keeping first occurrence
fn push_unique(ids: &mut Vec<ThreadId>, id: &ThreadId) {
    if !ids.iter().any(|existing| existing.matches(id)) {
        ids.push(id.clone());
    }
}

/// Analyze a lock table against per-thread wait flags
///
/// # Example
/// ```
/// use crashlens::deadlock::{analyze_locks, DeadlockVerdict};
/// use crashlens::model::LockTable;
///
/// let analysis = analyze_locks(&LockTable::default(), &[]);
/// assert_eq!(analysis.verdict, DeadlockVerdict::None);
/// ```
pub fn analyze_locks(locks: &LockTable, states: &[ThreadState]) -> DeadlockAnalysis {
    let mut holders = Vec::new();
    for owner in locks.entries.iter().filter_map(|e| e.owner.as_ref()) {
        push_unique(&mut holders, owner);
    }

    let mut waiting = Vec::new();
    for state in states.iter().filter(|s| s.waiting) {
        push_unique(&mut waiting, &state.thread);
    }

    let involved: Vec<ThreadId> = holders
        .iter()
        .filter(|h| waiting.iter().any(|w| w.matches(h)))
        .cloned()
        .collect();

    let contended_locks = locks
        .entries
        .iter()
        .filter(|e| e.waiter_estimate() > 0)
        .map(|e| ContendedLock {
            lock_id: e.lock_id.clone(),
            owner: e.owner.clone(),
            waiters: e.waiter_estimate(),
            object_type: e.object_type.clone(),
        })
        .collect();

    let names = || {
        involved
            .iter()
            .map(ThreadId::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    let (verdict, description) = match involved.len() {
        0 => (
            DeadlockVerdict::None,
            "no thread both holds a lock and waits".to_string(),
        ),
        n if n < MIN_DEADLOCK_THREADS => (
            DeadlockVerdict::Advisory,
            format!("thread {} holds a lock while waiting", names()),
        ),
        n => (
            DeadlockVerdict::Deadlock,
            format!("{n} threads hold locks while waiting: {}", names()),
        ),
    };

    if verdict == DeadlockVerdict::Deadlock {
        tracing::debug!(threads = involved.len(), "possible deadlock");
    }

    DeadlockAnalysis {
        verdict,
        involved_threads: involved,
        holders,
        waiting,
        contended_locks,
        description,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LockEntry;

    fn lock(id: &str, owner: &str, held: u32) -> LockEntry {
        LockEntry {
            lock_id: id.to_string(),
            sync_block: None,
            monitor_held: held,
            recursion: 1,
            owner: Some(ThreadId::parse(owner)),
            owner_index: None,
            object: None,
            object_type: Some("System.Object".to_string()),
            waiters: None,
        }
    }

    fn state(id: &str, waiting: bool) -> ThreadState {
        ThreadState {
            thread: ThreadId::parse(id),
            waiting,
            description: String::new(),
        }
    }

    #[test]
    fn test_two_holders_waiting_is_deadlock() {
        let locks = LockTable {
            entries: vec![lock("1", "0x1a01", 3), lock("2", "0x1a02", 3)],
        };
        let states = vec![
            state("0x1a01", true),
            state("0x1a02", true),
            state("0x1a03", true),
        ];
        let analysis = analyze_locks(&locks, &states);
        assert!(analysis.is_deadlock());
        assert_eq!(analysis.involved_threads.len(), 2);
        assert!(analysis.involved_threads[0].matches(&ThreadId::parse("0x1a01")));
        assert!(analysis.involved_threads[1].matches(&ThreadId::parse("0x1a02")));
        assert_eq!(analysis.waiting.len(), 3);
        assert_eq!(analysis.contended_locks.len(), 2);
    }

    #[test]
    fn test_single_holder_waiting_is_advisory() {
        let locks = LockTable {
            entries: vec![lock("1", "0x1a01", 1), lock("2", "0x1a02", 1)],
        };
        let states = vec![state("0x1a01", true), state("0x1a02", false)];
        let analysis = analyze_locks(&locks, &states);
        assert_eq!(analysis.verdict, DeadlockVerdict::Advisory);
        assert!(!analysis.is_deadlock());
        assert!(analysis.contended_locks.is_empty());
    }

    #[test]
    fn test_id_forms_are_reconciled() {
        // syncblk prints hex OS ids, the thread list may print decimal
        let locks = LockTable {
            entries: vec![lock("1", "0x1a2b", 3), lock("2", "0x1a2c", 3)],
        };
        let states = vec![state("6699", true), state("6700", true)];
        assert!(analyze_locks(&locks, &states).is_deadlock());
    }

    #[test]
    fn test_recursive_holder_counted_once() {
        let locks = LockTable {
            entries: vec![lock("1", "0x1a01", 1), lock("2", "0x1a01", 1)],
        };
        let states = vec![state("0x1a01", true)];
        let analysis = analyze_locks(&locks, &states);
        assert_eq!(analysis.holders.len(), 1);
        assert_eq!(analysis.verdict, DeadlockVerdict::Advisory);
    }
}
