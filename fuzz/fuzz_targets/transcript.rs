#![no_main]

use crashlens::backend::NoIntrospection;
use crashlens::config::AnalyzerConfig;
use crashlens::pipeline::analyze;
use crashlens::transcript::{ReplayBackend, Transcript};
use libfuzzer_sys::fuzz_target;

// Every command answers with the same fuzzed text; the pipeline must
// always return a report
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let mut transcript = Transcript::default();
    for command in [
        "clrthreads",
        "bt all",
        "clrstack -a -all",
        "image list",
        "printexception -nested",
        "dumpheap -stat",
        "syncblk",
    ] {
        transcript.commands.insert(command.to_string(), text.to_string());
    }
    let mut backend = ReplayBackend::new(transcript);
    let _ = analyze(&mut backend, &mut NoIntrospection, &AnalyzerConfig::default());
});
