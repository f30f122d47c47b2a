// Two-snapshot comparison
//
// Diffs a baseline and a comparison snapshot of the same process, each
// decoded independently: heap histogram, thread list and module list.
//
// - Heap: per-type count/size deltas, new and removed types, growth sorted
//   by size delta. Leak confidence comes from a rule table (absolute growth,
//   relative growth, leak-prone type fragments), not a single formula.
// - Threads: new/terminated by normalized id, state or top-frame changes,
//   and a potential-deadlock flag when more threads wait than before.
// - Modules: loaded/unloaded by normalized file name, version or base
//   address changes on shared modules.

mod heap;
mod modules;
mod threads;

pub use heap::{
    diff_heap, GrowthMeasure, HeapDiff, LeakConfidence, SuspectedLeak, TypeDelta,
    LEAK_PRONE_PATTERNS,
};
pub use modules::{diff_modules, ModuleChange, ModuleDiff};
pub use threads::{diff_threads, is_waiting, ThreadChange, ThreadDiff, ThreadSummary};

use crate::config::LeakThresholds;
use crate::decoders::{decode_heap_histogram, decode_modules, decode_threads};
use crate::model::{HeapHistogram, Module, Thread};
use serde::{Deserialize, Serialize};

/// One point-in-time capture of a process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// `None` when the heap could not be enumerated
    pub heap: Option<HeapHistogram>,
    pub threads: Vec<Thread>,
    pub modules: Vec<Module>,
}

impl Snapshot {
    /// Decode raw command output; text that does not decode leaves its field empty
    pub fn decode(heap_text: &str, threads_text: &str, modules_text: &str) -> Self {
        let (heap, heap_ok) = decode_heap_histogram(heap_text);
        let (threads, _) = decode_threads(threads_text);
        let (modules, _) = decode_modules(modules_text);
        Self {
            heap: heap_ok.then_some(heap),
            threads,
            modules,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    /// `None` unless both snapshots carry a heap histogram
    pub heap: Option<HeapDiff>,
    pub threads: ThreadDiff,
    pub modules: ModuleDiff,
    pub memory_leak_suspected: bool,
    pub potential_deadlock: bool,
    /// Commands that failed or data that was missing while capturing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Compare two snapshots
pub fn compare_snapshots(
    baseline: &Snapshot,
    comparison: &Snapshot,
    thresholds: &LeakThresholds,
) -> SnapshotDiff {
    let heap = match (&baseline.heap, &comparison.heap) {
        (Some(before), Some(after)) => Some(diff_heap(before, after, thresholds)),
        _ => {
            tracing::debug!("heap histogram missing from a snapshot, skipping heap diff");
            None
        }
    };
    let threads = diff_threads(&baseline.threads, &comparison.threads);
    let modules = diff_modules(&baseline.modules, &comparison.modules);

    SnapshotDiff {
        memory_leak_suspected: heap.as_ref().is_some_and(|h| h.memory_leak_suspected),
        potential_deadlock: threads.potential_deadlock,
        heap,
        threads,
        modules,
        warnings: Vec::new(),
    }
}

fn format_bytes(bytes: i64) -> String {
    let magnitude = bytes.unsigned_abs() as f64;
    let sign = if bytes < 0 { "-" } else { "+" };
    if magnitude >= 1024.0 * 1024.0 {
        format!("{sign}{:.1} MiB", magnitude / (1024.0 * 1024.0))
    } else if magnitude >= 1024.0 {
        format!("{sign}{:.1} KiB", magnitude / 1024.0)
    } else {
        format!("{sign}{} B", bytes.unsigned_abs())
    }
}

impl SnapshotDiff {
    pub fn with_warnings(mut self, warnings: impl IntoIterator<Item = String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    /// Render the diff as a human-readable report
    pub fn to_report_string(&self) -> String {
        let mut report = String::new();

        if self.memory_leak_suspected {
            report.push_str("❌ MEMORY LEAK SUSPECTED\n");
        } else if self.heap.is_none() {
            report.push_str("❓ MEMORY LEAK UNKNOWN (heap not available in both snapshots)\n");
        } else {
            report.push_str("✅ NO MEMORY LEAK SUSPECTED\n");
        }
        for warning in &self.warnings {
            report.push_str(&format!("⚠️  {warning}\n"));
        }
        report.push('\n');

        match &self.heap {
            Some(heap) => {
                report.push_str("Heap:\n");
                report.push_str(&format!(
                    "  Total size: {} -> {} ({})",
                    heap.baseline_total_size,
                    heap.comparison_total_size,
                    format_bytes(heap.total_size_delta)
                ));
                if let Some(percent) = heap.total_size_percent {
                    report.push_str(&format!(", {percent:+.1}%"));
                }
                report.push('\n');
                report.push_str(&format!("  Leak confidence: {:?}\n", heap.leak_confidence));
                report.push_str(&format!(
                    "  New types: {}, removed types: {}\n",
                    heap.new_types.len(),
                    heap.removed_types.len()
                ));

                if !heap.growth.is_empty() {
                    report.push_str("\n  Top growth:\n");
                    for entry in heap.growth.iter().take(10) {
                        report.push_str(&format!(
                            "    {:<50} count {:+} size {}\n",
                            entry.type_name,
                            entry.count_delta,
                            format_bytes(entry.size_delta)
                        ));
                    }
                }

                if !heap.suspected_leaks.is_empty() {
                    report.push_str("\n  Suspected leaking types:\n");
                    for leak in &heap.suspected_leaks {
                        report.push_str(&format!("    - {}\n", leak.indicator));
                    }
                }
            }
            None => report.push_str("Heap: not available in both snapshots\n"),
        }

        report.push_str("\nThreads:\n");
        report.push_str(&format!(
            "  New: {}, terminated: {}, changed: {}\n",
            self.threads.new_threads.len(),
            self.threads.terminated_threads.len(),
            self.threads.state_changes.len()
        ));
        report.push_str(&format!(
            "  Waiting: {} -> {}\n",
            self.threads.baseline_waiting, self.threads.comparison_waiting
        ));
        if self.potential_deadlock {
            report.push_str("  ⚠️  More threads are waiting than in the baseline (potential deadlock)\n");
        }
        for change in &self.threads.state_changes {
            report.push_str(&format!(
                "  {}: {} -> {}",
                change.key, change.before_state, change.after_state
            ));
            if change.before_top != change.after_top {
                report.push_str(&format!(
                    " (top: {} -> {})",
                    change.before_top.as_deref().unwrap_or("?"),
                    change.after_top.as_deref().unwrap_or("?")
                ));
            }
            report.push('\n');
        }

        report.push_str("\nModules:\n");
        for module in &self.modules.loaded {
            report.push_str(&format!("  + {}\n", module.name));
        }
        for module in &self.modules.unloaded {
            report.push_str(&format!("  - {}\n", module.name));
        }
        for change in &self.modules.changed {
            if change.version_changed() {
                report.push_str(&format!(
                    "  ~ {} version {} -> {}\n",
                    change.name,
                    change.version_before.as_deref().unwrap_or("?"),
                    change.version_after.as_deref().unwrap_or("?")
                ));
            }
            if change.rebased() {
                report.push_str(&format!("  ~ {} rebased\n", change.name));
            }
        }
        if self.modules.loaded.is_empty()
            && self.modules.unloaded.is_empty()
            && self.modules.changed.is_empty()
        {
            report.push_str("  no changes\n");
        }

        report
    }
}
