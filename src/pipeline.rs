//! Analysis pipeline
//!
//! An ordered list of stages, each reading fields earlier stages produced
//! and writing its own into one [`AnalysisReport`]. The order is fixed:
//! stack correlation has to precede AOT classification, which inspects the
//! correlated frames, and lock analysis needs the thread states. Each stage
//! declares the fields it requires and produces; [`validate_stages`] checks
//! that no stage reads a field before an earlier stage writes it.
//!
//! Stages never fail. A command that crashes is logged in the session's
//! crash log and the stage keeps whatever it has; a category the backend
//! cannot provide is skipped. Only an unexpected failure of the whole run
//! (invalid configuration, a broken stage order, a panic) ends it, and
//! [`analyze`] turns that into a minimal failed report.

use crate::aot::AotClassifier;
use crate::backend::{CommandBackend, CommandOutcome, CrashRecord, DebuggerSession, Introspector};
use crate::config::AnalyzerConfig;
use crate::deadlock::analyze_locks;
use crate::decoders::{
    decode_heap_histogram, decode_lock_table, decode_modules, decode_native_stacks,
    decode_runtime_stacks, decode_thread_states, decode_threads, ThreadState,
};
use crate::error::AnalysisError;
use crate::exception_chain::ExceptionChainWalker;
use crate::report::{AnalysisReport, UnavailableData};
use crate::snapshot_diff::Snapshot;
use crate::stack_correlation::{correlate_process, StackCorrelator};
use crate::type_resolution::{SessionTypeCatalog, TypeResolver};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Runtime-aware thread table first, native thread list as fallback
pub const THREAD_COMMANDS: &[&str] = &["clrthreads", "thread list"];
pub const NATIVE_STACK_COMMANDS: &[&str] = &["bt all", "~*k"];
pub const RUNTIME_STACK_COMMANDS: &[&str] = &["clrstack -a -all"];
pub const MODULE_COMMANDS: &[&str] = &["image list", "lm", "modules -v"];
pub const EXCEPTION_COMMANDS: &[&str] = &["printexception -nested"];
pub const HEAP_COMMANDS: &[&str] = &["dumpheap -stat"];
pub const LOCK_COMMANDS: &[&str] = &["syncblk", "!locks"];

/// Report fields a stage can depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportField {
    Threads,
    ThreadStates,
    CallStacks,
    Modules,
    Exception,
    TypeResolution,
    Aot,
    Heap,
    Locks,
    Deadlock,
}

/// One pipeline step with its dependency contract
pub struct Stage {
    pub name: &'static str,
    pub requires: &'static [ReportField],
    pub produces: &'static [ReportField],
    pub run: fn(&mut AnalysisContext<'_, '_>),
}

/// State threaded through the stages
///
/// The report has one writer at a time, the running stage. Intermediate
/// decoder output that is not part of the report lives next to it.
pub struct AnalysisContext<'s, 'a> {
    pub session: DebuggerSession<'a>,
    pub introspector: &'s mut dyn Introspector,
    pub config: &'s AnalyzerConfig,
    pub report: AnalysisReport,
    pub thread_states: Vec<ThreadState>,
}

impl AnalysisContext<'_, '_> {
    /// Run `commands` in order until one produces output `decode` accepts
    fn fetch<R>(&mut self, commands: &[&str], decode: fn(&str) -> (R, bool)) -> Option<R> {
        self.fetch_with_text(commands, decode).map(|(_, record)| record)
    }

    fn fetch_with_text<R>(
        &mut self,
        commands: &[&str],
        decode: fn(&str) -> (R, bool),
    ) -> Option<(String, R)> {
        fetch_decoded(&mut self.session, &mut self.report.unavailable, commands, decode)
    }
}

fn fetch_decoded<R>(
    session: &mut DebuggerSession<'_>,
    unavailable: &mut Vec<UnavailableData>,
    commands: &[&str],
    decode: fn(&str) -> (R, bool),
) -> Option<(String, R)> {
    for command in commands {
        match session.run(command) {
            CommandOutcome::Output(text) => match decode(&text) {
                (record, true) => return Some((text, record)),
                (_, false) => tracing::debug!("'{}' output not recognized", command),
            },
            CommandOutcome::Unavailable { command, phrase } => {
                unavailable.push(UnavailableData {
                    command,
                    phrase: phrase.to_string(),
                });
            }
            // Already in the crash log
            CommandOutcome::Failed { .. } => {}
        }
    }
    None
}

fn stage_threads(ctx: &mut AnalysisContext<'_, '_>) {
    let Some((text, threads)) = ctx.fetch_with_text(THREAD_COMMANDS, decode_threads) else {
        return;
    };
    ctx.report.faulting_thread = threads
        .iter()
        .find(|t| t.is_faulting)
        .map(|t| t.id.to_string());
    ctx.report.threads = threads;
    // Wait flags come from the same table
    ctx.thread_states = decode_thread_states(&text).0;
}

fn stage_stacks(ctx: &mut AnalysisContext<'_, '_>) {
    let native = ctx
        .fetch(NATIVE_STACK_COMMANDS, decode_native_stacks)
        .unwrap_or_default();
    let runtime = ctx
        .fetch(RUNTIME_STACK_COMMANDS, decode_runtime_stacks)
        .unwrap_or_default();

    let correlator = StackCorrelator::from_config(ctx.config);
    let threads = std::mem::take(&mut ctx.report.threads);
    ctx.report.threads = correlate_process(threads, native, runtime, &correlator);

    if ctx.report.faulting_thread.is_none() {
        ctx.report.faulting_thread = ctx.report.faulting().map(|t| t.id.to_string());
    }
}

fn stage_modules(ctx: &mut AnalysisContext<'_, '_>) {
    if let Some(modules) = ctx.fetch(MODULE_COMMANDS, decode_modules) {
        ctx.report.modules = modules;
    }
}

fn stage_exception(ctx: &mut AnalysisContext<'_, '_>) {
    let mut text = None;
    for command in EXCEPTION_COMMANDS {
        match ctx.session.run(command) {
            CommandOutcome::Output(output) => {
                text = Some(output);
                break;
            }
            CommandOutcome::Unavailable { command, phrase } => {
                ctx.report.unavailable.push(UnavailableData {
                    command,
                    phrase: phrase.to_string(),
                });
            }
            CommandOutcome::Failed { .. } => {}
        }
    }
    let Some(text) = text else {
        return;
    };
    let mut walker = ExceptionChainWalker::new(&mut *ctx.introspector, ctx.config);
    ctx.report.exception = walker.walk(&text);
}

fn stage_type_resolution(ctx: &mut AnalysisContext<'_, '_>) {
    // The first resolution failure in the chain, outermost first
    let Some(message) = ctx.report.exception.as_ref().and_then(|root| {
        root.iter()
            .find(|node| node.category.is_resolution_failure())
            .and_then(|node| node.message.clone())
    }) else {
        return;
    };

    let resolver = TypeResolver::new(ctx.config);
    let mut catalog = SessionTypeCatalog::new(&mut ctx.session).with_heap(ctx.report.heap.take());
    ctx.report.type_resolution = resolver.resolve(&message, &mut catalog);
    ctx.report.heap = catalog.into_heap();
}

fn stage_aot(ctx: &mut AnalysisContext<'_, '_>) {
    let exception_type = ctx.report.exception.as_ref().and_then(|root| {
        root.iter()
            .find(|node| node.category.is_resolution_failure())
            .or(Some(root))
            .and_then(|node| node.type_name.clone())
    });
    let classifier = AotClassifier::new(ctx.config);
    ctx.report.aot = Some(classifier.classify(
        &ctx.report.modules,
        &ctx.report.threads,
        exception_type.as_deref(),
    ));
}

fn stage_heap(ctx: &mut AnalysisContext<'_, '_>) {
    if ctx.report.heap.is_some() {
        return;
    }
    ctx.report.heap = ctx.fetch(HEAP_COMMANDS, decode_heap_histogram);
}

fn stage_locks(ctx: &mut AnalysisContext<'_, '_>) {
    let Some(locks) = ctx.fetch(LOCK_COMMANDS, decode_lock_table) else {
        return;
    };
    ctx.report.deadlock = Some(analyze_locks(&locks, &ctx.thread_states));
    ctx.report.locks = Some(locks);
}

/// The analysis stages in execution order
pub const STAGES: &[Stage] = &[
    Stage {
        name: "threads",
        requires: &[],
        produces: &[ReportField::Threads, ReportField::ThreadStates],
        run: stage_threads,
    },
    Stage {
        name: "stacks",
        requires: &[ReportField::Threads],
        produces: &[ReportField::CallStacks],
        run: stage_stacks,
    },
    Stage {
        name: "modules",
        requires: &[],
        produces: &[ReportField::Modules],
        run: stage_modules,
    },
    Stage {
        name: "exception",
        requires: &[],
        produces: &[ReportField::Exception],
        run: stage_exception,
    },
    Stage {
        name: "type_resolution",
        requires: &[ReportField::Exception],
        produces: &[ReportField::TypeResolution],
        run: stage_type_resolution,
    },
    Stage {
        name: "aot",
        requires: &[
            ReportField::CallStacks,
            ReportField::Modules,
            ReportField::Exception,
        ],
        produces: &[ReportField::Aot],
        run: stage_aot,
    },
    Stage {
        name: "heap",
        requires: &[],
        produces: &[ReportField::Heap],
        run: stage_heap,
    },
    Stage {
        name: "locks",
        requires: &[ReportField::ThreadStates],
        produces: &[ReportField::Locks, ReportField::Deadlock],
        run: stage_locks,
    },
];

/// Check that every stage's inputs are produced by an earlier stage
pub fn validate_stages(stages: &[Stage]) -> Result<(), AnalysisError> {
    for (i, stage) in stages.iter().enumerate() {
        for field in stage.requires {
            let produced = stages[..i].iter().any(|s| s.produces.contains(field));
            if !produced {
                return Err(AnalysisError::StageOrder {
                    stage: stage.name.to_string(),
                    field: format!("{field:?}"),
                });
            }
        }
    }
    Ok(())
}

/// Run `stages` against a backend and return the report
pub fn run_stages(
    stages: &[Stage],
    backend: &mut dyn CommandBackend,
    introspector: &mut dyn Introspector,
    config: &AnalyzerConfig,
) -> Result<AnalysisReport, AnalysisError> {
    config.validate().map_err(AnalysisError::InvalidConfig)?;
    validate_stages(stages)?;

    let mut ctx = AnalysisContext {
        session: DebuggerSession::new(backend, config.command_timeout()),
        introspector,
        config,
        report: AnalysisReport::default(),
        thread_states: Vec::new(),
    };

    for stage in stages {
        tracing::debug!(stage = stage.name, "running stage");
        (stage.run)(&mut ctx);
        ctx.report.stages_run.push(stage.name.to_string());
    }

    ctx.report.crash_log = ctx.session.crash_log().to_vec();
    ctx.report.commands_run = ctx.session.commands_run();
    if !ctx.report.crash_log.is_empty() {
        tracing::warn!(
            crashed = ctx.report.crash_log.len(),
            "analysis finished with crashed commands"
        );
    }
    Ok(ctx.report)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run the full analysis; never fails and never panics the caller
///
/// # Example
/// ```
/// use crashlens::backend::NoIntrospection;
/// use crashlens::config::AnalyzerConfig;
/// use crashlens::pipeline::analyze;
/// use crashlens::transcript::{ReplayBackend, Transcript};
///
/// let mut backend = ReplayBackend::new(Transcript::default());
/// let report = analyze(&mut backend, &mut NoIntrospection, &AnalyzerConfig::default());
/// assert!(report.is_complete());
/// assert!(report.threads.is_empty());
/// ```
pub fn analyze(
    backend: &mut dyn CommandBackend,
    introspector: &mut dyn Introspector,
    config: &AnalyzerConfig,
) -> AnalysisReport {
    let result = catch_unwind(AssertUnwindSafe(|| {
        run_stages(STAGES, backend, introspector, config)
    }));
    match result {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            tracing::warn!("analysis failed: {}", e);
            AnalysisReport::failed(e.to_string())
        }
        Err(payload) => {
            let error = AnalysisError::Panicked(panic_message(payload.as_ref()));
            tracing::warn!("{}", error);
            AnalysisReport::failed(error.to_string())
        }
    }
}

/// A snapshot plus what went wrong while capturing it
#[derive(Debug, Clone, Default)]
pub struct CapturedSnapshot {
    pub snapshot: Snapshot,
    pub crash_log: Vec<CrashRecord>,
    pub unavailable: Vec<UnavailableData>,
}

impl CapturedSnapshot {
    /// Crashed commands and missing data, each line prefixed with `label`
    pub fn warnings(&self, label: &str) -> Vec<String> {
        let mut warnings: Vec<String> = self
            .crash_log
            .iter()
            .map(|c| format!("{label}: '{}' crashed or timed out ({})", c.command, c.reason))
            .collect();
        if self.snapshot.heap.is_none() {
            warnings.push(format!("{label}: heap histogram not available"));
        }
        if self.snapshot.threads.is_empty() {
            warnings.push(format!("{label}: no threads could be decoded"));
        }
        warnings
    }
}

/// Capture the data a snapshot comparison needs
pub fn capture_snapshot(
    backend: &mut dyn CommandBackend,
    config: &AnalyzerConfig,
) -> CapturedSnapshot {
    let mut session = DebuggerSession::new(backend, config.command_timeout());
    let mut unavailable = Vec::new();
    let snapshot = Snapshot {
        heap: fetch_decoded(&mut session, &mut unavailable, HEAP_COMMANDS, decode_heap_histogram)
            .map(|(_, heap)| heap),
        threads: fetch_decoded(&mut session, &mut unavailable, THREAD_COMMANDS, decode_threads)
            .map(|(_, threads)| threads)
            .unwrap_or_default(),
        modules: fetch_decoded(&mut session, &mut unavailable, MODULE_COMMANDS, decode_modules)
            .map(|(_, modules)| modules)
            .unwrap_or_default(),
    };
    if !session.crash_log().is_empty() {
        tracing::warn!(
            crashed = session.crash_log().len(),
            "debugger commands failed during snapshot capture"
        );
    }
    CapturedSnapshot {
        snapshot,
        crash_log: session.crash_log().to_vec(),
        unavailable,
    }
}
