//! Aggregate analysis report
//!
//! One [`AnalysisReport`] is produced per run. Pipeline stages fill its
//! fields in a fixed order; a field a stage could not populate stays empty.
//! The report is serde-serializable for JSON output and renders itself as
//! text with [`AnalysisReport::to_report_string`].

use crate::aot::AotClassification;
use crate::backend::CrashRecord;
use crate::deadlock::{DeadlockAnalysis, DeadlockVerdict};
use crate::exception_chain::ExceptionNode;
use crate::model::{HeapHistogram, LockTable, Module, Thread};
use crate::type_resolution::TypeResolutionReport;
use serde::{Deserialize, Serialize};

/// Frames shown per thread in the text rendering
const REPORT_FRAMES_PER_THREAD: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    #[default]
    Complete,
    Failed,
}

/// A data category the backend could not provide
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailableData {
    pub command: String,
    pub phrase: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub status: AnalysisStatus,
    /// Set when the run failed as a whole
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub threads: Vec<Thread>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub faulting_thread: Option<String>,
    pub modules: Vec<Module>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_resolution: Option<TypeResolutionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aot: Option<AotClassification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heap: Option<HeapHistogram>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locks: Option<LockTable>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadlock: Option<DeadlockAnalysis>,
    /// Commands that crashed or timed out; reported once, here
    pub crash_log: Vec<CrashRecord>,
    pub unavailable: Vec<UnavailableData>,
    pub stages_run: Vec<String>,
    pub commands_run: usize,
}

impl AnalysisReport {
    /// Minimal report for a run that failed as a whole
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: AnalysisStatus::Failed,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == AnalysisStatus::Complete
    }

    pub fn faulting(&self) -> Option<&Thread> {
        self.threads.iter().find(|t| t.is_faulting)
    }

    /// Warnings worth surfacing next to the findings
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.crash_log.is_empty() {
            let commands: Vec<&str> = self.crash_log.iter().map(|c| c.command.as_str()).collect();
            warnings.push(format!(
                "{} debugger command(s) crashed or timed out: {}",
                commands.len(),
                commands.join(", ")
            ));
        }
        if self.threads.is_empty() && self.is_complete() {
            warnings.push("no threads could be decoded".to_string());
        }
        warnings
    }

    /// Render the report as human-readable text
    pub fn to_report_string(&self) -> String {
        let mut report = String::new();

        if let AnalysisStatus::Failed = self.status {
            report.push_str("❌ ANALYSIS FAILED\n\n");
            report.push_str(&format!(
                "Error: {}\n",
                self.error.as_deref().unwrap_or("unknown error")
            ));
            return report;
        }

        report.push_str("=== Crash Analysis ===\n\n");
        report.push_str(&format!(
            "Threads: {}  Modules: {}  Commands run: {}\n",
            self.threads.len(),
            self.modules.len(),
            self.commands_run
        ));

        for warning in self.warnings() {
            report.push_str(&format!("⚠️  {warning}\n"));
        }

        if let Some(exception) = &self.exception {
            report.push_str("\n--- Exception ---\n");
            for node in exception.iter() {
                let indent = "  ".repeat(node.depth);
                if node.is_cycle {
                    report.push_str(&format!("{indent}↺ cycle back to an earlier exception\n"));
                    continue;
                }
                report.push_str(&format!(
                    "{indent}{} [{}]\n",
                    node.type_name.as_deref().unwrap_or("<unknown type>"),
                    node.category
                ));
                if let Some(message) = &node.message {
                    report.push_str(&format!("{indent}  Message: {message}\n"));
                }
                if let Some(hresult) = &node.hresult {
                    report.push_str(&format!("{indent}  HResult: {hresult}\n"));
                }
                for (key, value) in &node.custom_fields {
                    report.push_str(&format!("{indent}  {key}: {value}\n"));
                }
            }
        }

        if let Some(resolution) = &self.type_resolution {
            report.push_str("\n--- Type Resolution ---\n");
            report.push_str(&format!("Type: {}", resolution.failed_type));
            if let Some(member) = &resolution.expected_member {
                report.push_str(&format!("  Member: {member}"));
            }
            report.push('\n');
            if let Some(via) = &resolution.resolved_via {
                report.push_str(&format!("Resolved via instantiation: {via}\n"));
            }
            report.push_str(&format!("Diagnosis: {}\n", resolution.diagnosis_text));
            if !resolution.similar_matches.is_empty() {
                report.push_str(&format!(
                    "Similar members: {}\n",
                    resolution.similar_matches.join(", ")
                ));
            }
        }

        if let Some(aot) = &self.aot {
            report.push_str("\n--- Deployment ---\n");
            report.push_str(&format!(
                "Ahead-of-time compiled: {}\n",
                if aot.is_aot { "yes" } else { "no" }
            ));
            if aot.has_on_demand_compiler {
                report.push_str("On-demand compiler loaded\n");
            }
            for indicator in &aot.indicators {
                report.push_str(&format!(
                    "  indicator {} matched {}\n",
                    indicator.pattern, indicator.matched
                ));
            }
            if let Some(trimming) = &aot.trimming {
                report.push_str(&format!(
                    "Trimming {} (confidence {:?}, score {})\n",
                    if trimming.likely_trimmed { "likely" } else { "unlikely" },
                    trimming.confidence,
                    trimming.score
                ));
                for recommendation in &trimming.recommendations {
                    report.push_str(&format!("  - {recommendation}\n"));
                }
            }
        }

        if let Some(deadlock) = &self.deadlock {
            report.push_str("\n--- Locks ---\n");
            match deadlock.verdict {
                DeadlockVerdict::Deadlock => report.push_str("❌ POSSIBLE DEADLOCK\n"),
                DeadlockVerdict::Advisory => report.push_str("⚠️  LOCK ADVISORY\n"),
                DeadlockVerdict::None => {}
            }
            report.push_str(&format!("{}\n", deadlock.description));
            for lock in &deadlock.contended_locks {
                report.push_str(&format!(
                    "  lock {} owner {} waiters {}\n",
                    lock.lock_id,
                    lock.owner
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "-".to_string()),
                    lock.waiters
                ));
            }
        }

        if let Some(heap) = &self.heap {
            report.push_str("\n--- Heap ---\n");
            report.push_str(&format!(
                "{} objects, {} bytes\n",
                heap.total_count(),
                heap.total_size()
            ));
            let mut largest: Vec<_> = heap.entries.iter().collect();
            largest.sort_by(|a, b| b.total_size.cmp(&a.total_size));
            for entry in largest.iter().take(5) {
                report.push_str(&format!(
                    "  {:<50} {:>10} {:>14}\n",
                    entry.type_name, entry.count, entry.total_size
                ));
            }
        }

        let faulting = self.faulting();
        let shown = faulting.into_iter().chain(
            self.threads
                .iter()
                .filter(|t| !t.is_faulting)
                .take(if faulting.is_some() { 0 } else { 1 }),
        );
        for thread in shown {
            report.push_str(&format!(
                "\n--- Thread {}{} ---\n",
                thread.id,
                if thread.is_faulting { " (faulting)" } else { "" }
            ));
            for frame in thread.call_stack.iter().take(REPORT_FRAMES_PER_THREAD) {
                let marker = if frame.is_runtime_tracked { "*" } else { " " };
                report.push_str(&format!("{marker}{:>3} {}", frame.index, frame.display_name()));
                if let Some(source) = &frame.source {
                    report.push_str(&format!(" at {source}"));
                }
                report.push('\n');
            }
            if thread.call_stack.len() > REPORT_FRAMES_PER_THREAD {
                report.push_str(&format!(
                    "  ... {} more frames\n",
                    thread.call_stack.len() - REPORT_FRAMES_PER_THREAD
                ));
            }
        }

        report
    }
}
