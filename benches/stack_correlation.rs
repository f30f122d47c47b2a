//! Stack correlation benchmark
//!
//! Measures merging runtime-tracked frames into native stacks, the one
//! step whose cost grows with stack depth times thread count. Large
//! processes have hundreds of threads with deep stacks, so the merge is
//! benchmarked both per stack and across a whole process.
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench stack_correlation
//! ```

use crashlens::address::Address;
use crashlens::decoders::{decode_native_stacks, decode_runtime_stacks, ThreadStack};
use crashlens::model::{Frame, Thread, ThreadId};
use crashlens::stack_correlation::{correlate_process, StackCorrelator};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Native frames every 0x40 bytes, runtime frames on every third one
/// plus an orphan between each pair
fn build_stacks(depth: u64) -> (Vec<Frame>, Vec<Frame>) {
    let base = 0x7ffe_0000_0000u64;
    let native = (0..depth)
        .map(|i| Frame {
            stack_pointer: Some(Address(base + i * 0x40)),
            instruction_pointer: Some(Address(0x7f00_0000_0000 + i)),
            module: Some("libcoreclr.so".to_string()),
            function: Some(format!("native_{i}")),
            ..Default::default()
        })
        .collect();
    let runtime = (0..depth)
        .filter(|i| i % 3 == 0)
        .flat_map(|i| {
            [
                Frame {
                    stack_pointer: Some(Address(base + i * 0x40)),
                    function: Some(format!("MyApp.Worker.Step{i}()")),
                    is_runtime_tracked: true,
                    ..Default::default()
                },
                Frame {
                    stack_pointer: Some(Address(base + i * 0x40 + 0x20)),
                    function: Some(format!("MyApp.Worker.Inlined{i}()")),
                    is_runtime_tracked: true,
                    ..Default::default()
                },
            ]
        })
        .collect();
    (native, runtime)
}

fn bench_merge_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_depth");
    let correlator = StackCorrelator::default();

    for depth in [16u64, 64, 256, 1024] {
        let (native, runtime) = build_stacks(depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| correlator.merge(black_box(native.clone()), black_box(runtime.clone())));
        });
    }

    group.finish();
}

/// Whole-process correlation: thread lookup by OS id plus one merge each
fn bench_correlate_process(c: &mut Criterion) {
    let correlator = StackCorrelator::default();
    let mut threads = Vec::new();
    let mut native = Vec::new();
    let mut runtime = Vec::new();

    for t in 0..200u64 {
        let os = ThreadId::from_hex(0x2000 + t);
        threads.push(Thread {
            id: ThreadId::parse(&t.to_string()),
            os_thread_id: Some(os.clone()),
            ..Default::default()
        });
        let (n, r) = build_stacks(48);
        native.push(ThreadStack {
            thread_id: None,
            os_thread_id: Some(os.clone()),
            frames: n,
        });
        runtime.push(ThreadStack {
            thread_id: None,
            os_thread_id: Some(os),
            frames: r,
        });
    }

    c.bench_function("correlate_process_200_threads", |b| {
        b.iter(|| {
            correlate_process(
                black_box(threads.clone()),
                black_box(native.clone()),
                black_box(runtime.clone()),
                &correlator,
            )
        });
    });
}

const WINDBG_K: &str = "\
   0  Id: 1a2b.2a3c Suspend: 1 Teb: 000000e5`1a5f1000 Unfrozen
 # Child-SP          RetAddr               Call Site
00 000000e5`1a7fe6c8 00007ff8`9a1b2c3d     ntdll!NtWaitForSingleObject+0x14
01 000000e5`1a7fe6d0 00007ff8`9a1b0000     KERNELBASE!WaitForSingleObjectEx+0x8e
02 000000e5`1a7fe770 00000000`00000000     0x00007ff8`12345678
";

const CLRSTACK: &str = "\
OS Thread Id: 0x2a3c (0)
        Child SP               IP Call Site
000000E51A7FE6C8 00007FF8A1B2C3D4 MyApp.Worker.Run(System.String) [/src/MyApp/Worker.cs @ 42]
000000E51A7FE8B0 00007FF8A1B2C500 System.Private.CoreLib.dll!System.Threading.Monitor.Enter(System.Object)
";

/// Decoding is part of the real cost; keep it visible next to the merge
fn bench_decode_stacks(c: &mut Criterion) {
    let native = WINDBG_K.repeat(100);
    let runtime = CLRSTACK.repeat(100);

    c.bench_function("decode_native_stacks", |b| {
        b.iter(|| decode_native_stacks(black_box(&native)));
    });
    c.bench_function("decode_runtime_stacks", |b| {
        b.iter(|| decode_runtime_stacks(black_box(&runtime)));
    });
}

criterion_group!(
    benches,
    bench_merge_depth,
    bench_correlate_process,
    bench_decode_stacks
);
criterion_main!(benches);
