//! End-to-end analysis over recorded debugger transcripts
//!
//! Drives the full stage pipeline through `Transcript::into_parts()` the same
//! way the CLI does, then checks the cross-stage results: correlated stacks,
//! the exception chain, member diagnosis, deployment classification and the
//! lock heuristics.

use crashlens::config::AnalyzerConfig;
use crashlens::deadlock::DeadlockVerdict;
use crashlens::exception_category::ExceptionCategory;
use crashlens::pipeline::{analyze, STAGES};
use crashlens::report::AnalysisReport;
use crashlens::transcript::Transcript;
use crashlens::type_resolution::Diagnosis;
use std::path::PathBuf;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

fn analyze_transcript(transcript: Transcript) -> AnalysisReport {
    let (mut backend, mut introspector) = transcript.into_parts();
    analyze(&mut backend, &mut introspector, &AnalyzerConfig::default())
}

fn analyze_fixture(name: &str) -> AnalysisReport {
    analyze_transcript(Transcript::load(fixture(name)).unwrap())
}

/// Test full analysis of a missing-method crash
///
/// Scenario: WinDbg + SOS transcript, worker thread faulted with MissingMethodException
/// Expected: every stage runs and the report is complete
#[test]
fn test_missing_method_report_is_complete() {
    let report = analyze_fixture("missing_method.json");

    assert!(report.is_complete());
    assert_eq!(report.error, None);
    assert_eq!(report.stages_run.len(), STAGES.len());
    assert!(report.crash_log.is_empty());
    assert_eq!(report.threads.len(), 3);
    assert_eq!(report.faulting_thread.as_deref(), Some("9"));
}

/// Test stack correlation through the pipeline
///
/// Scenario: native `~*k` walk and `clrstack` for OS thread 2a3c
/// Expected: one stack, contiguous indices, runtime frames merged by stack pointer
#[test]
fn test_stacks_are_correlated() {
    let report = analyze_fixture("missing_method.json");
    let main = report
        .threads
        .iter()
        .find(|t| t.id.raw == "0")
        .expect("thread 0 present");

    assert!(main.call_stack.len() >= 4);
    for (i, frame) in main.call_stack.iter().enumerate() {
        assert_eq!(frame.index, i, "indices must be contiguous");
    }

    let sps: Vec<u64> = main
        .call_stack
        .iter()
        .filter_map(|f| f.stack_pointer.map(|sp| sp.0))
        .collect();
    assert!(sps.windows(2).all(|w| w[0] <= w[1]), "SP order broken: {sps:x?}");

    let functions: Vec<&str> = main
        .call_stack
        .iter()
        .filter_map(|f| f.function.as_deref())
        .collect();
    assert!(functions.iter().any(|f| f.contains("MyApp.Worker.Run")));
    assert!(functions.iter().any(|f| f.contains("Monitor.Enter")));
    assert!(functions.iter().any(|f| f.contains("WaitForSingleObjectEx")));

    // Thread 6 only has runtime frames
    let finalizer = report.threads.iter().find(|t| t.id.raw == "6").unwrap();
    assert!(!finalizer.call_stack.is_empty());
    assert!(finalizer.call_stack.iter().all(|f| f.is_runtime_tracked));
}

/// Test exception chain and member diagnosis
///
/// Scenario: "Method not found: 'Void MyApp.Services.PluginLoader.Reload()'"
/// Expected: type found, no exact match, Load offered as a similar member
#[test]
fn test_missing_member_diagnosis() {
    let report = analyze_fixture("missing_method.json");

    let exception = report.exception.as_ref().expect("exception decoded");
    assert_eq!(exception.chain_len(), 1);
    assert_eq!(
        exception.type_name.as_deref(),
        Some("System.MissingMethodException")
    );
    assert_eq!(exception.category, ExceptionCategory::MissingMethod);
    assert_eq!(exception.hresult.as_deref(), Some("0x80131513"));

    let resolution = report.type_resolution.as_ref().expect("type resolution ran");
    assert_eq!(resolution.failed_type, "MyApp.Services.PluginLoader");
    assert_eq!(resolution.expected_member.as_deref(), Some("Reload"));
    assert!(resolution.type_found);
    assert!(!resolution.exact_match);
    assert!(resolution.similar_matches.contains(&"Load".to_string()));
    assert_eq!(resolution.diagnosis, Diagnosis::SimilarMatchesFound);
    assert_eq!(resolution.total_members, 4);
}

/// Test deployment classification with the on-demand compiler loaded
///
/// Scenario: module list includes clrjit, no AOT symbols on the stacks
/// Expected: not AOT, trimming analysis present for the resolution failure
#[test]
fn test_deployment_classification() {
    let report = analyze_fixture("missing_method.json");
    let aot = report.aot.as_ref().expect("aot stage ran");

    assert!(aot.module_list_available);
    assert!(aot.has_on_demand_compiler);
    assert!(!aot.is_aot);
    let trimming = aot.trimming.as_ref().expect("resolution failure analyzed");
    assert_eq!(trimming.category, ExceptionCategory::MissingMethod);
    assert!(!trimming.likely_trimmed);
}

/// Test heap and lock stages
///
/// Scenario: two owned sync blocks, only the faulting thread waiting
/// Expected: locks decoded, no owner is waiting so no deadlock
#[test]
fn test_heap_and_locks() {
    let report = analyze_fixture("missing_method.json");

    let heap = report.heap.as_ref().expect("heap histogram");
    assert!(heap.find("System.Threading.Timer").is_some());

    let locks = report.locks.as_ref().expect("lock table");
    assert_eq!(locks.entries.len(), 2);
    let deadlock = report.deadlock.as_ref().expect("deadlock analysis");
    assert_eq!(deadlock.verdict, DeadlockVerdict::None);
    assert!(!deadlock.is_deadlock());
}

/// Test fallback bookkeeping
///
/// Scenario: `image list` and `bt all` are not recorded, later dialects are
/// Expected: the misses are listed as unavailable, the fallbacks supply data
#[test]
fn test_unrecorded_commands_are_unavailable() {
    let report = analyze_fixture("missing_method.json");

    let missing: Vec<&str> = report
        .unavailable
        .iter()
        .map(|u| u.command.as_str())
        .collect();
    assert!(missing.contains(&"bt all"));
    assert!(missing.contains(&"image list"));
    assert!(!report.modules.is_empty());
}

/// Test crash containment
///
/// Scenario: `dumpheap -stat` crashes the debugger and `syncblk` hangs
/// Expected: both logged, the remaining stages still produce their results
#[test]
fn test_crashing_commands_do_not_stop_analysis() {
    let report = analyze_fixture("crashing_backend.json");

    assert!(report.is_complete());
    let crashed: Vec<&str> = report.crash_log.iter().map(|c| c.command.as_str()).collect();
    assert_eq!(crashed, vec!["dumpheap -stat", "syncblk"]);

    assert!(report.heap.is_none());
    assert!(report.locks.is_none());
    assert!(report.deadlock.is_none());
    assert!(report.exception.is_some());
    assert!(report.type_resolution.is_some());
    assert_eq!(report.threads.len(), 3);

    let warnings = report.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("dumpheap -stat"));
}

const WAITING_OWNERS: &str = "\
 DBG   ID     OSID ThreadOBJ           State GC Mode     GC Alloc Context                  Domain           Count Apt Exception
   0    1     2a3c 000001D4A1B2C3D0  202a020 Preemptive  000001D4A1B30000:000001D4A1B31FD0 000001D4A1B00000 1 MTA
   6    2     2b40 000001D4A1B4C3D0  202b220 Preemptive  0000000000000000:0000000000000000 000001D4A1B00000 1 MTA
";

const CROSSED_LOCKS: &str = "\
Index         SyncBlock MonitorHeld Recursion Owning Thread Info          SyncBlock Owner
   12 000001D4A1C0F1A8            3         1 000001D4A1B2C3D0 2a3c   0   000001d4a1b6c3e8 System.Object
   14 000001D4A1C0F200            3         1 000001D4A1B4C3D0 2b40   6   000001d4a1b6c500 MyApp.Cache
";

/// Test deadlock detection end to end
///
/// Scenario: both lock owners are themselves waiting
/// Expected: Deadlock verdict naming both threads
#[test]
fn test_crossed_locks_report_deadlock() {
    let transcript: Transcript = serde_json::from_value(serde_json::json!({
        "commands": {
            "clrthreads": WAITING_OWNERS,
            "syncblk": CROSSED_LOCKS,
        }
    }))
    .unwrap();
    let report = analyze_transcript(transcript);

    let deadlock = report.deadlock.as_ref().expect("deadlock analysis");
    assert_eq!(deadlock.verdict, DeadlockVerdict::Deadlock);
    assert_eq!(deadlock.involved_threads.len(), 2);
    assert!(report.to_report_string().contains("POSSIBLE DEADLOCK"));
}

/// Test an empty transcript
///
/// Scenario: nothing recorded at all
/// Expected: complete but empty report, every category unavailable
#[test]
fn test_empty_transcript() {
    let report = analyze_transcript(Transcript::default());

    assert!(report.is_complete());
    assert!(report.threads.is_empty());
    assert!(report.exception.is_none());
    assert!(report.type_resolution.is_none());
    assert!(!report.unavailable.is_empty());
    assert!(report
        .warnings()
        .iter()
        .any(|w| w.contains("no threads")));
}

/// Test invalid configuration
///
/// Scenario: zero exception depth
/// Expected: failed report carrying the validation message, nothing executed
#[test]
fn test_invalid_config_fails_whole_run() {
    let (mut backend, mut introspector) =
        Transcript::load(fixture("missing_method.json")).unwrap().into_parts();
    let config = AnalyzerConfig {
        max_exception_depth: 0,
        ..AnalyzerConfig::default()
    };
    let report = analyze(&mut backend, &mut introspector, &config);

    assert!(!report.is_complete());
    assert!(report.error.is_some());
    assert!(backend.executed().is_empty());
    assert!(report.to_report_string().contains("ANALYSIS FAILED"));
}
