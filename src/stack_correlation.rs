//! Stack correlation: merging native and runtime-tracked frames
//!
//! The native unwinder sees every frame but knows nothing about managed
//! methods; the runtime-aware walker names managed methods but skips native
//! ones. Both report stack pointers, so frames are joined on that address:
//!
//! 1. Native frames matching a runtime-tracked frame's stack pointer take the
//!    runtime frame's function/module/source/registers/variables, keeping
//!    their own stack and instruction pointers.
//! 2. Runtime-tracked frames nothing matched ("orphans") are inserted before
//!    the first merged frame that lies further out on the stack.
//! 3. Frames are renumbered `0..N`.
//!
//! Frame 0 is the innermost frame. With a downward-growing stack that is the
//! lowest stack pointer, so merged output is ascending in stack pointer.
//! Ordering is computed on a growth-adjusted "rank" so both directions share
//! one code path.
//!
//! Frames missing a stack pointer get an estimate (interpolated between known
//! neighbors, or extrapolated by a fixed stride) that is used only to place
//! orphans. Estimates never reach the output frames.

use crate::config::{AnalyzerConfig, StackGrowth};
use crate::decoders::ThreadStack;
use crate::model::{Frame, Thread, ThreadId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a stack was assembled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Joined on stack pointers
    Correlated,
    /// Fewer than two stack pointers were known; sources were concatenated
    Concatenated,
}

/// Result of merging one thread's frame lists
#[derive(Debug, Clone, PartialEq)]
pub struct MergedStack {
    pub frames: Vec<Frame>,
    pub strategy: MergeStrategy,
    /// Native frames enriched with runtime data
    pub matched: usize,
    /// Runtime-tracked frames inserted without a native counterpart
    pub inserted: usize,
}

/// Merges native and runtime-tracked frame lists
#[derive(Debug, Clone, Copy)]
pub struct StackCorrelator {
    growth: StackGrowth,
    stride: u64,
}

impl Default for StackCorrelator {
    fn default() -> Self {
        Self::new(StackGrowth::Downward, 0x10)
    }
}

impl StackCorrelator {
    pub fn new(growth: StackGrowth, stride: u64) -> Self {
        Self { growth, stride }
    }

    pub fn from_config(config: &AnalyzerConfig) -> Self {
        Self::new(config.stack_growth, config.sp_extrapolation_stride)
    }

    /// Position on the stack, innermost lowest, whatever the growth direction
    fn rank(&self, sp: u64) -> u64 {
        match self.growth {
            StackGrowth::Downward => sp,
            StackGrowth::Upward => !sp,
        }
    }

    /// Merge one thread's native and runtime-tracked frames
    ///
    /// # Example
    /// ```
    /// use crashlens::address::Address;
    /// use crashlens::model::Frame;
    /// use crashlens::stack_correlation::StackCorrelator;
    ///
    /// let frame = |sp: u64, function: &str| Frame {
    ///     stack_pointer: Some(Address(sp)),
    ///     function: Some(function.to_string()),
    ///     ..Default::default()
    /// };
    /// let native = vec![frame(0x100, "main"), frame(0x60, "raise")];
    /// let runtime = vec![frame(0x80, "App.Run()")];
    ///
    /// let merged = StackCorrelator::default().merge(native, runtime);
    /// let order: Vec<_> = merged.frames.iter().map(|f| f.display_name()).collect();
    /// assert_eq!(order, ["raise", "App.Run()", "main"]);
    /// ```
    pub fn merge(&self, native: Vec<Frame>, runtime: Vec<Frame>) -> MergedStack {
        let known_sps = native
            .iter()
            .chain(runtime.iter())
            .filter(|f| f.stack_pointer.is_some())
            .count();

        if known_sps < 2 {
            if !runtime.is_empty() && !native.is_empty() {
                tracing::debug!(
                    known_sps,
                    native = native.len(),
                    runtime = runtime.len(),
                    "too few stack pointers to correlate; concatenating"
                );
            }
            let inserted = runtime.len();
            let mut frames: Vec<Frame> = native.into_iter().chain(runtime).collect();
            renumber(&mut frames);
            return MergedStack {
                frames,
                strategy: MergeStrategy::Concatenated,
                matched: 0,
                inserted,
            };
        }

        let native = self.normalize(native);
        let runtime = self.normalize(runtime);

        // Index runtime frames by their real stack pointer; first one wins
        let mut by_sp: HashMap<u64, usize> = HashMap::new();
        for (i, (frame, _)) in runtime.iter().enumerate() {
            if let Some(sp) = frame.stack_pointer {
                by_sp.entry(sp.0).or_insert(i);
            }
        }

        let mut consumed = vec![false; runtime.len()];
        let mut merged: Vec<(Frame, Option<u64>)> = Vec::with_capacity(native.len() + runtime.len());
        let mut matched = 0;

        for (mut frame, rank) in native {
            let hit = frame
                .stack_pointer
                .and_then(|sp| by_sp.get(&sp.0).copied())
                .filter(|&i| !consumed[i]);
            if let Some(i) = hit {
                overlay(&mut frame, &runtime[i].0);
                consumed[i] = true;
                matched += 1;
            }
            merged.push((frame, rank));
        }

        let mut inserted = 0;
        for ((orphan, rank), used) in runtime.into_iter().zip(consumed) {
            if used {
                continue;
            }
            let position = rank
                .and_then(|r| {
                    merged
                        .iter()
                        .position(|(_, other)| other.is_some_and(|o| o > r))
                })
                .unwrap_or(merged.len());
            merged.insert(position, (orphan, rank));
            inserted += 1;
        }

        let mut frames: Vec<Frame> = merged.into_iter().map(|(frame, _)| frame).collect();
        renumber(&mut frames);

        MergedStack {
            frames,
            strategy: MergeStrategy::Correlated,
            matched,
            inserted,
        }
    }

    /// Put frames innermost-first and attach effective ranks
    fn normalize(&self, mut frames: Vec<Frame>) -> Vec<(Frame, Option<u64>)> {
        let known: Vec<u64> = frames
            .iter()
            .filter_map(|f| f.stack_pointer.map(|sp| self.rank(sp.0)))
            .collect();
        if let (Some(first), Some(last)) = (known.first(), known.last()) {
            if first > last {
                frames.reverse();
            }
        }

        let ranks = self.effective_ranks(&frames);
        let mut paired: Vec<(Frame, Option<u64>)> = frames.into_iter().zip(ranks).collect();

        // Out-of-order input only gets sorted when every position is known
        if paired.iter().all(|(_, r)| r.is_some()) {
            paired.sort_by_key(|(_, r)| *r);
        }
        paired
    }

    /// Real rank where known, else an estimate from the nearest known frames
    fn effective_ranks(&self, frames: &[Frame]) -> Vec<Option<u64>> {
        let known: Vec<(usize, u64)> = frames
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.stack_pointer.map(|sp| (i, self.rank(sp.0))))
            .collect();

        (0..frames.len())
            .map(|i| {
                let before = known.iter().rev().find(|(k, _)| *k <= i).copied();
                let after = known.iter().find(|(k, _)| *k >= i).copied();
                match (before, after) {
                    (Some((bi, bv)), Some((ai, _))) if bi == ai => Some(bv),
                    (Some((bi, bv)), Some((ai, av))) => Some(interpolate(bi, bv, ai, av, i)),
                    (Some((bi, bv)), None) => {
                        Some(bv.saturating_add(self.stride.saturating_mul((i - bi) as u64)))
                    }
                    (None, Some((ai, av))) => {
                        Some(av.saturating_sub(self.stride.saturating_mul((ai - i) as u64)))
                    }
                    (None, None) => None,
                }
            })
            .collect()
    }
}

fn interpolate(bi: usize, bv: u64, ai: usize, av: u64, i: usize) -> u64 {
    let span = (ai - bi) as i128;
    let offset = (i - bi) as i128;
    let value = bv as i128 + (av as i128 - bv as i128) * offset / span;
    value.clamp(0, u64::MAX as i128) as u64
}

/// Runtime data wins on everything except the stack and instruction pointers
fn overlay(native: &mut Frame, runtime: &Frame) {
    if runtime.function.is_some() {
        native.function = runtime.function.clone();
    }
    if runtime.module.is_some() {
        native.module = runtime.module.clone();
    }
    if runtime.source.is_some() {
        native.source = runtime.source.clone();
    }
    if !runtime.registers.is_empty() {
        native.registers = runtime.registers.clone();
    }
    if !runtime.parameters.is_empty() {
        native.parameters = runtime.parameters.clone();
    }
    if !runtime.locals.is_empty() {
        native.locals = runtime.locals.clone();
    }
    if native.instruction_pointer.is_none() {
        native.instruction_pointer = runtime.instruction_pointer;
    }
    native.is_runtime_tracked = true;
}

fn renumber(frames: &mut [Frame]) {
    for (i, frame) in frames.iter_mut().enumerate() {
        frame.index = i;
    }
}

/// Does `thread` correspond to a stack section with these ids?
///
/// OS ids are compared when both sides have one; debugger indices only
/// otherwise, since each debugger numbers threads its own way.
fn same_thread(thread: &Thread, id: Option<&ThreadId>, os: Option<&ThreadId>) -> bool {
    match (thread.os_thread_id.as_ref(), os) {
        (Some(a), Some(b)) => a.matches(b),
        _ => id.is_some_and(|id| thread.id.matches(id)),
    }
}

fn thread_from_stack(stack: &ThreadStack) -> Thread {
    let id = stack
        .thread_id
        .clone()
        .or_else(|| stack.os_thread_id.clone())
        .unwrap_or_default();
    Thread {
        id,
        os_thread_id: stack.os_thread_id.clone(),
        state: "unknown".to_string(),
        ..Default::default()
    }
}

/// Attach stacks to threads and merge runtime-tracked frames in
///
/// Native stacks fill threads from the thread list (or create threads the
/// list did not mention). Each runtime stack is merged into the thread with
/// the matching OS id; runtime stacks with no native thread become
/// runtime-only threads. Every returned call stack is numbered `0..N`.
pub fn correlate_process(
    mut threads: Vec<Thread>,
    native: Vec<ThreadStack>,
    runtime: Vec<ThreadStack>,
    correlator: &StackCorrelator,
) -> Vec<Thread> {
    for stack in native {
        let position = threads.iter().position(|t| {
            same_thread(t, stack.thread_id.as_ref(), stack.os_thread_id.as_ref())
        });
        match position {
            Some(i) => {
                let thread = &mut threads[i];
                if thread.os_thread_id.is_none() {
                    thread.os_thread_id = stack.os_thread_id.clone();
                }
                thread.call_stack = stack.frames;
            }
            None => {
                let mut thread = thread_from_stack(&stack);
                thread.call_stack = stack.frames;
                threads.push(thread);
            }
        }
    }

    let mut runtime_by_thread: Vec<Option<Vec<Frame>>> = vec![None; threads.len()];
    let mut runtime_only = Vec::new();
    for stack in runtime {
        let position = threads.iter().position(|t| match stack.os_thread_id.as_ref() {
            Some(os) => t.has_id(os),
            None => same_thread(t, stack.thread_id.as_ref(), None),
        });
        match position {
            Some(i) if runtime_by_thread[i].is_none() => runtime_by_thread[i] = Some(stack.frames),
            _ => runtime_only.push(stack),
        }
    }

    for (thread, runtime_frames) in threads.iter_mut().zip(runtime_by_thread) {
        let native_frames = std::mem::take(&mut thread.call_stack);
        let merged = correlator.merge(native_frames, runtime_frames.unwrap_or_default());
        thread.call_stack = merged.frames;
    }

    for stack in runtime_only {
        tracing::debug!(
            os_thread_id = ?stack.os_thread_id,
            "runtime stack without a native thread"
        );
        let mut thread = thread_from_stack(&stack);
        thread.call_stack = correlator.merge(Vec::new(), stack.frames).frames;
        threads.push(thread);
    }

    threads
}
