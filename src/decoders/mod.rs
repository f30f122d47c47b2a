//! Text decoders for debugger command output
//!
//! One decoder per (data category, debugger dialect). Each decoder is a pure
//! function of its input text: it sniffs whether the text looks like its
//! dialect and, if so, turns it into a typed record. Nothing here returns an
//! error. Unrecognized or malformed input yields the record's default and
//! `false`, so callers can leave the field empty and move on.
//!
//! ```
//! use crashlens::decoders::{parse, DecodeKind, DecodedRecord};
//!
//! let (record, ok) = parse(DecodeKind::HeapHistogram, "Statistics:\n\
//!          MT    Count    TotalSize Class Name\n\
//! 00007ff8a1b2c400    1,234      567,890 System.String\n\
//! Total 1,234 objects");
//! assert!(ok);
//! if let DecodedRecord::HeapHistogram(heap) = record {
//!     assert_eq!(heap.entries[0].count, 1234);
//! }
//! ```

pub mod exception;
pub mod heap;
pub mod locks;
pub mod members;
pub mod modules;
pub mod stack;
pub mod threads;

use crate::model::{HeapHistogram, LockTable, Module, Thread};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

pub use exception::{decode_exception, split_nested_sections, ExceptionRecord};
pub use heap::decode_heap_histogram;
pub use locks::decode_lock_table;
pub use members::{decode_member_table, decode_type_lookup, MemberTable, TypeLookup};
pub use modules::decode_modules;
pub use stack::{decode_native_stacks, decode_runtime_stacks, ThreadStack};
pub use threads::{decode_thread_states, decode_threads, ThreadState};

/// A decoder for one dialect of one category of command output
pub trait Decoder {
    type Record: Default;

    /// Dialect name, used in debug logs
    const DIALECT: &'static str;

    /// Cheap format check; decoders are only run on text they recognize
    fn sniff(text: &str) -> bool;

    /// Decode the text; `None` when nothing usable was found
    fn decode(text: &str) -> Option<Self::Record>;
}

/// Run `D` if its sniff accepts the text
pub(crate) fn try_decode<D: Decoder>(text: &str) -> Option<D::Record> {
    if !D::sniff(text) {
        return None;
    }
    let record = D::decode(text);
    if record.is_none() {
        tracing::debug!("{} sniffed but produced no records", D::DIALECT);
    }
    record
}

/// Collapse an optional record into the `(record, ok)` contract
pub(crate) fn finish<R: Default>(record: Option<R>) -> (R, bool) {
    match record {
        Some(record) => (record, true),
        None => (R::default(), false),
    }
}

/// Category of command output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeKind {
    Threads,
    ThreadStates,
    NativeStack,
    RuntimeStack,
    HeapHistogram,
    LockTable,
    Modules,
    Exception,
    MemberTable,
    TypeLookup,
}

/// Output of [`parse`]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum DecodedRecord {
    Threads(Vec<Thread>),
    ThreadStates(Vec<ThreadState>),
    NativeStack(Vec<ThreadStack>),
    RuntimeStack(Vec<ThreadStack>),
    HeapHistogram(HeapHistogram),
    LockTable(LockTable),
    Modules(Vec<Module>),
    Exception(ExceptionRecord),
    MemberTable(MemberTable),
    TypeLookup(TypeLookup),
}

/// Decode `text` as `kind`. Never panics; `false` means "skip this field".
pub fn parse(kind: DecodeKind, text: &str) -> (DecodedRecord, bool) {
    match kind {
        DecodeKind::Threads => wrap(decode_threads(text), DecodedRecord::Threads),
        DecodeKind::ThreadStates => wrap(decode_thread_states(text), DecodedRecord::ThreadStates),
        DecodeKind::NativeStack => wrap(decode_native_stacks(text), DecodedRecord::NativeStack),
        DecodeKind::RuntimeStack => wrap(decode_runtime_stacks(text), DecodedRecord::RuntimeStack),
        DecodeKind::HeapHistogram => {
            wrap(decode_heap_histogram(text), DecodedRecord::HeapHistogram)
        }
        DecodeKind::LockTable => wrap(decode_lock_table(text), DecodedRecord::LockTable),
        DecodeKind::Modules => wrap(decode_modules(text), DecodedRecord::Modules),
        DecodeKind::Exception => wrap(decode_exception(text), DecodedRecord::Exception),
        DecodeKind::MemberTable => wrap(decode_member_table(text), DecodedRecord::MemberTable),
        DecodeKind::TypeLookup => wrap(decode_type_lookup(text), DecodedRecord::TypeLookup),
    }
}

fn wrap<R>(decoded: (R, bool), variant: fn(R) -> DecodedRecord) -> (DecodedRecord, bool) {
    (variant(decoded.0), decoded.1)
}

/// Compile a literal pattern once
pub(crate) fn cached_regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("decoder patterns are valid literals"))
}

/// Parse a count that may carry thousands separators (`1,234`, `1.234`, `1 234`)
pub fn parse_count(text: &str) -> Option<u64> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '.' | '_' | '\'' | ' ' | '\u{a0}'))
        .collect();
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    cleaned.parse().ok()
}

/// Treat SOS placeholders as missing values
pub(crate) fn non_placeholder(text: &str) -> Option<String> {
    let trimmed = text.trim();
    match trimmed {
        "" | "<none>" | "<NULL>" | "<null>" | "<no data>" | "(null)" => None,
        _ => Some(trimmed.to_string()),
    }
}

/// Split a "Key:   value" line
pub(crate) fn key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || key.len() > 40 {
        return None;
    }
    Some((key, value.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_count_separators() {
        assert_eq!(parse_count("1,234"), Some(1234));
        assert_eq!(parse_count("1.234.567"), Some(1_234_567));
        assert_eq!(parse_count("1 234"), Some(1234));
        assert_eq!(parse_count("42"), Some(42));
        assert_eq!(parse_count(""), None);
        assert_eq!(parse_count("-1"), None);
        assert_eq!(parse_count("12ab"), None);
    }

    #[test]
    fn test_non_placeholder() {
        assert_eq!(non_placeholder("<none>"), None);
        assert_eq!(non_placeholder("  "), None);
        assert_eq!(non_placeholder(" boom "), Some("boom".to_string()));
    }

    #[test]
    fn test_parse_unknown_text_is_not_ok() {
        for kind in [
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
        ] {
            let (_, ok) = parse(kind, "the quick brown fox");
            assert!(!ok, "{kind:?} accepted garbage");
        }
    }

    #[test]
    fn test_parse_empty_text_is_not_ok() {
        let (record, ok) = parse(DecodeKind::Modules, "");
        assert!(!ok);
        assert!(matches!(record, DecodedRecord::Modules(m) if m.is_empty()));
    }
}
