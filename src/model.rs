//! Typed records shared by the decoders and the analysis engines
//!
//! Everything here is a plain value produced once per analysis run. Frames
//! are immutable after construction; the only place a call stack is
//! rearranged is the stack correlation step.

use crate::address::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Source file and line attached to a frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: Option<u32>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.file, line),
            None => write!(f, "{}", self.file),
        }
    }
}

/// A parameter or local variable reported by a runtime-aware stack walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// A single call frame
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Frame {
    /// Position in the call stack, 0 is the innermost frame
    pub index: usize,
    pub instruction_pointer: Option<Address>,
    pub stack_pointer: Option<Address>,
    pub module: Option<String>,
    pub function: Option<String>,
    pub source: Option<SourceLocation>,
    /// Reconstructed by the runtime-aware walker rather than the native unwinder
    pub is_runtime_tracked: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub registers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub parameters: Vec<Variable>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub locals: Vec<Variable>,
}

impl Frame {
    /// `module!function` in the form most debuggers print
    pub fn display_name(&self) -> String {
        match (&self.module, &self.function) {
            (Some(m), Some(f)) => format!("{m}!{f}"),
            (None, Some(f)) => f.clone(),
            (Some(m), None) => format!("{m}!<unknown>"),
            (None, None) => match self.instruction_pointer {
                Some(ip) => ip.to_string(),
                None => "<unknown>".to_string(),
            },
        }
    }

    /// All text a heuristic scan should look at: function, module and source file
    pub fn searchable_text(&self) -> impl Iterator<Item = (FrameField, &str)> {
        [
            (FrameField::Function, self.function.as_deref()),
            (FrameField::Module, self.module.as_deref()),
            (FrameField::Source, self.source.as_ref().map(|s| s.file.as_str())),
        ]
        .into_iter()
        .filter_map(|(field, text)| text.map(|t| (field, t)))
    }
}

/// Which frame field a heuristic matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameField {
    Function,
    Module,
    Source,
}

/// Debugger-native thread identifier
///
/// Backends disagree on how to print thread ids: `0x2a3c`, `2a3c`,
/// `10812`, `0x2a3c (10812)`. Both readings of an ambiguous token are kept
/// and [`ThreadId::matches`] compares them leniently. This is deliberately
/// not a strict key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadId {
    pub raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hex: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimal: Option<u64>,
}

/// Minimum length for substring containment to count as a thread id match
const MIN_CONTAINMENT_LEN: usize = 3;

impl ThreadId {
    pub fn parse(text: &str) -> Self {
        let raw = text.trim().to_string();
        let mut id = ThreadId {
            raw: raw.clone(),
            hex: None,
            decimal: None,
        };

        // Dual form: "0x2a3c (10812)"
        let (head, tail) = match (raw.find('('), raw.rfind(')')) {
            (Some(open), Some(close)) if close > open => {
                (raw[..open].trim(), Some(raw[open + 1..close].trim()))
            }
            _ => (raw.as_str(), None),
        };

        if let Some(digits) = head.strip_prefix("0x").or_else(|| head.strip_prefix("0X")) {
            id.hex = u64::from_str_radix(digits, 16).ok();
        } else if !head.is_empty() && head.chars().all(|c| c.is_ascii_digit()) {
            id.decimal = head.parse().ok();
            id.hex = u64::from_str_radix(head, 16).ok();
        } else if !head.is_empty() && head.chars().all(|c| c.is_ascii_hexdigit()) {
            id.hex = u64::from_str_radix(head, 16).ok();
        }

        if let Some(tail) = tail {
            if let Ok(value) = tail.parse::<u64>() {
                id.decimal = Some(value);
            } else if let Some(digits) = tail.strip_prefix("0x") {
                id.hex = id.hex.or_else(|| u64::from_str_radix(digits, 16).ok());
            }
        }

        id
    }

    pub fn from_hex(value: u64) -> Self {
        ThreadId {
            raw: format!("0x{value:x}"),
            hex: Some(value),
            decimal: None,
        }
    }

    /// Canonical key for set operations within one source
    pub fn key(&self) -> String {
        match (self.hex, self.decimal) {
            (Some(hex), _) if self.is_explicit_hex() => format!("{hex:x}"),
            (_, Some(dec)) => dec.to_string(),
            (Some(hex), None) => format!("{hex:x}"),
            (None, None) => self.raw.to_ascii_lowercase(),
        }
    }

    fn is_explicit_hex(&self) -> bool {
        let raw = self.raw.trim();
        raw.starts_with("0x")
            || raw.starts_with("0X")
            || raw.chars().any(|c| c.is_ascii_alphabetic() && c.is_ascii_hexdigit())
    }

    fn normalized_raw(&self) -> String {
        let lower = self.raw.to_ascii_lowercase();
        let stripped = lower.trim().trim_start_matches("0x");
        let trimmed = stripped.trim_start_matches('0');
        if trimmed.is_empty() && !stripped.is_empty() {
            "0".to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// Best-effort identity across sources: hex equality, decimal equality,
    /// or substring containment of the normalized text.
    pub fn matches(&self, other: &ThreadId) -> bool {
        let (a, b) = (self.normalized_raw(), other.normalized_raw());
        if !a.is_empty() && a == b {
            return true;
        }

        if let (Some(x), Some(y)) = (self.hex, other.hex) {
            if x == y && (self.is_explicit_hex() || other.is_explicit_hex()) {
                return true;
            }
        }
        if let (Some(x), Some(y)) = (self.decimal, other.decimal) {
            if x == y {
                return true;
            }
        }
        // "0x2a3c" on one side, "10812" on the other
        if let (Some(x), Some(y)) = (self.hex, other.decimal) {
            if self.is_explicit_hex() && x == y {
                return true;
            }
        }
        if let (Some(x), Some(y)) = (self.decimal, other.hex) {
            if other.is_explicit_hex() && x == y {
                return true;
            }
        }

        let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
        short.len() >= MIN_CONTAINMENT_LEN && long.contains(short.as_str())
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A thread with its call stack
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Thread {
    /// Debugger-native id (index in the debugger's own thread list)
    pub id: ThreadId,
    pub os_thread_id: Option<ThreadId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub state: String,
    pub is_faulting: bool,
    pub call_stack: Vec<Frame>,
    pub is_thread_pool: bool,
    pub lock_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

impl Thread {
    /// Function of the innermost frame, if any
    pub fn top_function(&self) -> Option<&str> {
        self.call_stack.first().and_then(|f| f.function.as_deref())
    }

    /// True when either the native or the OS id matches `id`
    pub fn has_id(&self, id: &ThreadId) -> bool {
        self.id.matches(id) || self.os_thread_id.as_ref().is_some_and(|os| os.matches(id))
    }

    /// Key used when diffing thread sets between snapshots
    pub fn identity_key(&self) -> String {
        self.os_thread_id
            .as_ref()
            .map(ThreadId::key)
            .unwrap_or_else(|| self.id.key())
    }
}

/// A loaded module (shared library, assembly, executable)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub base_address: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_address: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl Module {
    /// File name without directory, lowercased; the key for module diffs
    pub fn normalized_name(&self) -> String {
        normalize_module_name(&self.name)
    }
}

pub fn normalize_module_name(name: &str) -> String {
    let file = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(name);
    file.trim().to_ascii_lowercase()
}

/// One row of a heap histogram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapEntry {
    pub method_table: Option<Address>,
    pub type_name: String,
    pub count: u64,
    pub total_size: u64,
}

/// Per-type object counts and sizes for one heap snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapHistogram {
    pub entries: Vec<HeapEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_objects: Option<u64>,
}

impl HeapHistogram {
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.total_size).sum()
    }

    pub fn total_count(&self) -> u64 {
        self.total_objects
            .unwrap_or_else(|| self.entries.iter().map(|e| e.count).sum())
    }

    pub fn find(&self, type_name: &str) -> Option<&HeapEntry> {
        self.entries.iter().find(|e| e.type_name == type_name)
    }
}

/// One held monitor from the lock table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockEntry {
    /// Lock identity (sync block index as printed)
    pub lock_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_block: Option<Address>,
    pub monitor_held: u32,
    pub recursion: u32,
    pub owner: Option<ThreadId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    /// Waiter count when the dialect reports it directly
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiters: Option<u32>,
}

impl LockEntry {
    /// Waiters reported directly, else implied by `MonitorHeld`
    /// (1 for the owner plus 2 per waiter)
    pub fn waiter_estimate(&self) -> u32 {
        self.waiters
            .unwrap_or_else(|| self.monitor_held.saturating_sub(1) / 2)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockTable {
    pub entries: Vec<LockEntry>,
}

/// Compilation status of a method in a member table dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileStatus {
    PreJit,
    Jit,
    NotCompiled,
    Fcall,
    #[default]
    Unknown,
}

impl CompileStatus {
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_uppercase().as_str() {
            "PREJIT" | "R2R" | "READYTORUN" => CompileStatus::PreJit,
            "JIT" => CompileStatus::Jit,
            "NONE" => CompileStatus::NotCompiled,
            "FCALL" => CompileStatus::Fcall,
            _ => CompileStatus::Unknown,
        }
    }
}

/// One member from a type's member table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub name: String,
    pub signature: String,
    pub compile_status: CompileStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_hex_forms_match() {
        let a = ThreadId::parse("0x2a3c");
        let b = ThreadId::parse("2a3c");
        let c = ThreadId::parse("00002A3C");
        assert!(a.matches(&b));
        assert!(b.matches(&c));
        assert_eq!(a.key(), "2a3c");
        assert_eq!(b.key(), "2a3c");
    }

    #[test]
    fn test_thread_id_dual_form() {
        let dual = ThreadId::parse("0x2a3c (10812)");
        assert_eq!(dual.hex, Some(0x2a3c));
        assert_eq!(dual.decimal, Some(10812));
        assert!(dual.matches(&ThreadId::parse("10812")));
        assert!(dual.matches(&ThreadId::parse("0x2a3c")));
    }

    #[test]
    fn test_thread_id_hex_decimal_cross_match() {
        let hex = ThreadId::parse("0x1a2b");
        let dec = ThreadId::parse("6699");
        assert!(hex.matches(&dec));
    }

    #[test]
    fn test_thread_id_distinct() {
        assert!(!ThreadId::parse("0x10").matches(&ThreadId::parse("0x11")));
        // Short ids never match by containment
        assert!(!ThreadId::parse("1").matches(&ThreadId::parse("12")));
    }

    #[test]
    fn test_module_normalized_name() {
        let m = Module {
            name: "/usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.0/libclrjit.so".to_string(),
            ..Default::default()
        };
        assert_eq!(m.normalized_name(), "libclrjit.so");
        assert_eq!(normalize_module_name(r"C:\Windows\System32\NTDLL.DLL"), "ntdll.dll");
    }

    #[test]
    fn test_lock_waiter_estimate() {
        let entry = LockEntry {
            lock_id: "1".to_string(),
            sync_block: None,
            monitor_held: 5,
            recursion: 1,
            owner: None,
            owner_index: None,
            object: None,
            object_type: None,
            waiters: None,
        };
        assert_eq!(entry.waiter_estimate(), 2);
    }

    #[test]
    fn test_frame_display_name() {
        let frame = Frame {
            module: Some("libcoreclr.so".to_string()),
            function: Some("ThrowException".to_string()),
            ..Default::default()
        };
        assert_eq!(frame.display_name(), "libcoreclr.so!ThrowException");
    }

    #[test]
    fn test_compile_status_parse() {
        assert_eq!(CompileStatus::parse("PreJIT"), CompileStatus::PreJit);
        assert_eq!(CompileStatus::parse("JIT"), CompileStatus::Jit);
        assert_eq!(CompileStatus::parse("NONE"), CompileStatus::NotCompiled);
        assert_eq!(CompileStatus::parse("???"), CompileStatus::Unknown);
    }
}
