#![no_main]

use crashlens::decoders::{parse, DecodeKind};
use libfuzzer_sys::fuzz_target;

const KINDS: [DecodeKind; 10] = [
    DecodeKind::Threads,
    DecodeKind::ThreadStates,
    DecodeKind::NativeStack,
    DecodeKind::RuntimeStack,
    DecodeKind::HeapHistogram,
    DecodeKind::LockTable,
    DecodeKind::Modules,
    DecodeKind::Exception,
    DecodeKind::MemberTable,
    DecodeKind::TypeLookup,
];

fuzz_target!(|data: &[u8]| {
    // Debugger output is not guaranteed UTF-8; decode lossily like a backend would
    let text = String::from_utf8_lossy(data);
    for kind in KINDS {
        let _ = parse(kind, &text);
    }
});
