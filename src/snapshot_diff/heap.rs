// Heap histogram diff and leak confidence rules

use crate::config::LeakThresholds;
use crate::model::HeapHistogram;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Confidence that the heap growth between two snapshots is a leak
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakConfidence {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl LeakConfidence {
    fn escalate(self) -> Self {
        match self {
            LeakConfidence::None | LeakConfidence::Low => LeakConfidence::Medium,
            LeakConfidence::Medium | LeakConfidence::High => LeakConfidence::High,
        }
    }
}

/// How a leak-prone pattern is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthMeasure {
    /// Instance count growth above `leak_prone_count`
    Count,
    /// Byte growth above `oversized_growth_bytes`
    Size,
}

/// Type-name fragments that commonly leak, with the message attached to a hit
pub const LEAK_PRONE_PATTERNS: &[(&str, GrowthMeasure, &str)] = &[
    ("EventHandler", GrowthMeasure::Count, "event handler subscriptions are accumulating; look for missing unsubscribes"),
    ("Delegate", GrowthMeasure::Count, "delegate instances are accumulating; look for captured closures kept alive by long-lived objects"),
    ("Timer", GrowthMeasure::Count, "timers are accumulating; look for timers that are never disposed"),
    ("Connection", GrowthMeasure::Count, "connections are accumulating; look for connections that are never closed or returned to a pool"),
    ("Socket", GrowthMeasure::Count, "sockets are accumulating; look for undisposed network clients"),
    ("HttpClient", GrowthMeasure::Count, "HttpClient instances are accumulating; reuse one client or use a client factory"),
    ("ConcurrentDictionary`", GrowthMeasure::Count, "concurrent dictionaries are growing; look for caches without eviction"),
    ("Dictionary`", GrowthMeasure::Count, "dictionaries are growing; look for caches without eviction"),
    ("List`", GrowthMeasure::Count, "lists are growing; look for collections that are only ever appended to"),
    ("Queue`", GrowthMeasure::Count, "queues are growing; consumers may be falling behind"),
    ("System.String", GrowthMeasure::Size, "string data is growing; look for unbounded string caches or concatenation in loops"),
    ("System.Byte[]", GrowthMeasure::Size, "byte arrays are growing; look for buffers that are not returned to a pool"),
];

/// Per-type change between two histograms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDelta {
    pub type_name: String,
    pub baseline_count: u64,
    pub comparison_count: u64,
    pub count_delta: i64,
    pub baseline_size: u64,
    pub comparison_size: u64,
    pub size_delta: i64,
}

/// A type whose growth matches a leak-prone pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspectedLeak {
    pub type_name: String,
    pub pattern: String,
    pub count_delta: i64,
    pub size_delta: i64,
    pub indicator: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeapDiff {
    pub baseline_total_size: u64,
    pub comparison_total_size: u64,
    pub total_size_delta: i64,
    /// Growth as a percentage of the baseline; `None` when the baseline is empty
    pub total_size_percent: Option<f64>,
    pub total_count_delta: i64,
    pub new_types: Vec<TypeDelta>,
    pub removed_types: Vec<TypeDelta>,
    /// Shared types with a nonzero delta, largest size growth first
    pub growth: Vec<TypeDelta>,
    pub suspected_leaks: Vec<SuspectedLeak>,
    pub leak_confidence: LeakConfidence,
    pub memory_leak_suspected: bool,
}

fn signed_delta(before: u64, after: u64) -> i64 {
    (after as i128 - before as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

fn delta(type_name: &str, before: (u64, u64), after: (u64, u64)) -> TypeDelta {
    TypeDelta {
        type_name: type_name.to_string(),
        baseline_count: before.0,
        comparison_count: after.0,
        count_delta: signed_delta(before.0, after.0),
        baseline_size: before.1,
        comparison_size: after.1,
        size_delta: signed_delta(before.1, after.1),
    }
}

/// First leak-prone pattern the type's growth trips, if any
fn suspect(entry: &TypeDelta, thresholds: &LeakThresholds) -> Option<SuspectedLeak> {
    let (pattern, _, message) = LEAK_PRONE_PATTERNS.iter().find(|(pattern, measure, _)| {
        entry.type_name.contains(pattern)
            && match measure {
                GrowthMeasure::Count => entry.count_delta > thresholds.leak_prone_count as i64,
                GrowthMeasure::Size => {
                    entry.size_delta > thresholds.oversized_growth_bytes as i64
                }
            }
    })?;

    Some(SuspectedLeak {
        type_name: entry.type_name.clone(),
        pattern: pattern.to_string(),
        count_delta: entry.count_delta,
        size_delta: entry.size_delta,
        indicator: format!(
            "{} grew by {} instances ({} bytes): {}",
            entry.type_name, entry.count_delta, entry.size_delta, message
        ),
    })
}

/// Apply the confidence rule table
///
/// Large absolute growth is High on its own, large relative growth is Medium
/// on its own, any other growth is Low. Suspected types escalate one level
/// (to at least Medium), and enough of them escalate to High.
fn leak_confidence(
    total_delta: i64,
    percent: Option<f64>,
    suspects: usize,
    thresholds: &LeakThresholds,
) -> LeakConfidence {
    let mut confidence = if total_delta >= thresholds.large_absolute_bytes as i64 {
        LeakConfidence::High
    } else if percent.is_some_and(|p| p >= thresholds.large_percent) {
        LeakConfidence::Medium
    } else if total_delta > 0 {
        LeakConfidence::Low
    } else {
        LeakConfidence::None
    };

    if suspects >= thresholds.suspected_types_for_high {
        confidence = LeakConfidence::High;
    } else if suspects > 0 {
        confidence = confidence.escalate();
    }
    confidence
}

/// Diff two heap histograms
pub fn diff_heap(
    baseline: &HeapHistogram,
    comparison: &HeapHistogram,
    thresholds: &LeakThresholds,
) -> HeapDiff {
    let mut before: HashMap<&str, (u64, u64)> = HashMap::new();
    for entry in &baseline.entries {
        let slot = before.entry(entry.type_name.as_str()).or_default();
        slot.0 += entry.count;
        slot.1 += entry.total_size;
    }
    let mut after: Vec<(&str, (u64, u64))> = Vec::new();
    let mut after_index: HashMap<&str, usize> = HashMap::new();
    for entry in &comparison.entries {
        let index = *after_index
            .entry(entry.type_name.as_str())
            .or_insert_with(|| {
                after.push((entry.type_name.as_str(), (0, 0)));
                after.len() - 1
            });
        after[index].1 .0 += entry.count;
        after[index].1 .1 += entry.total_size;
    }

    let mut new_types = Vec::new();
    let mut growth = Vec::new();
    for (name, sizes) in &after {
        match before.get(name) {
            Some(old) => {
                let d = delta(name, *old, *sizes);
                if d.count_delta != 0 || d.size_delta != 0 {
                    growth.push(d);
                }
            }
            None => new_types.push(delta(name, (0, 0), *sizes)),
        }
    }

    let mut removed_types: Vec<TypeDelta> = Vec::new();
    for entry in &baseline.entries {
        let name = entry.type_name.as_str();
        if after_index.contains_key(name) || removed_types.iter().any(|t| t.type_name == name) {
            continue;
        }
        if let Some(old) = before.get(name) {
            removed_types.push(delta(name, *old, (0, 0)));
        }
    }

    growth.sort_by(|a, b| b.size_delta.cmp(&a.size_delta));
    new_types.sort_by(|a, b| b.size_delta.cmp(&a.size_delta));

    let suspected_leaks: Vec<SuspectedLeak> = growth
        .iter()
        .chain(new_types.iter())
        .filter_map(|entry| suspect(entry, thresholds))
        .collect();

    let baseline_total_size = baseline.total_size();
    let comparison_total_size = comparison.total_size();
    let total_size_delta = signed_delta(baseline_total_size, comparison_total_size);
    let total_size_percent = (baseline_total_size > 0)
        .then(|| total_size_delta as f64 / baseline_total_size as f64 * 100.0);

    let leak_confidence = leak_confidence(
        total_size_delta,
        total_size_percent,
        suspected_leaks.len(),
        thresholds,
    );

    HeapDiff {
        baseline_total_size,
        comparison_total_size,
        total_size_delta,
        total_size_percent,
        total_count_delta: signed_delta(baseline.total_count(), comparison.total_count()),
        new_types,
        removed_types,
        growth,
        suspected_leaks,
        leak_confidence,
        memory_leak_suspected: leak_confidence >= LeakConfidence::Medium,
    }
}
