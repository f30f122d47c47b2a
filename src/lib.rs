//! Crashlens - crash snapshot analysis over debugger command output
//!
//! This library turns the raw text of debugger commands (thread lists, native
//! and runtime-aware stack walks, heap histograms, lock tables, module lists,
//! exception dumps) into one structured diagnostic report: correlated call
//! stacks, exception chains with cycle protection, missing-member diagnosis,
//! ahead-of-time/trimming classification, deadlock heuristics and
//! two-snapshot leak comparison.
//!
//! The debugger itself is injected through [`backend::CommandBackend`] and
//! [`backend::Introspector`]; [`transcript`] replays recorded sessions.

pub mod address;
pub mod aot;
pub mod backend;
pub mod cli;
pub mod config;
pub mod deadlock;
pub mod decoders;
pub mod error;
pub mod exception_category;
pub mod exception_chain;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod snapshot_diff;
pub mod stack_correlation;
pub mod transcript;
pub mod type_resolution;
