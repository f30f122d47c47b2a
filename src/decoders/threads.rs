//! Thread list decoders
//!
//! Dialects:
//! - SOS `clrthreads`: one row per runtime-known thread with OS id, state
//!   flags, lock count and the thread's last thrown exception.
//! - LLDB `thread list`: one line per native thread with tid, name and stop
//!   reason.
//!
//! The same text also yields per-thread wait/blocked flags for the deadlock
//! analyzer via [`decode_thread_states`].

use super::{cached_regex, finish, try_decode, Decoder};
use crate::address::Address;
use crate::model::{Frame, Thread, ThreadId};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Runtime thread state bits as printed by SOS `threadstate`
const THREAD_STATE_FLAGS: &[(u32, &str)] = &[
    (0x0000_0001, "Abort Requested"),
    (0x0000_0002, "GC Suspend Pending"),
    (0x0000_0004, "User Suspend Pending"),
    (0x0000_0008, "Debug Suspend Pending"),
    (0x0000_0010, "GC On Transitions"),
    (0x0000_0020, "Legal to Join"),
    (0x0000_0040, "Yield Requested"),
    (0x0000_0080, "Hijacked by the GC"),
    (0x0000_0100, "Blocking GC for Stack Overflow"),
    (0x0000_0200, "Background"),
    (0x0000_0400, "Unstarted"),
    (0x0000_0800, "Dead"),
    (0x0000_1000, "CLR Owns"),
    (0x0000_2000, "CoInitialized"),
    (0x0000_4000, "In Single Threaded Apartment"),
    (0x0000_8000, "In Multi Threaded Apartment"),
    (0x0001_0000, "Reported Dead"),
    (0x0002_0000, "Fully initialized"),
    (0x0004_0000, "Task Reset"),
    (0x0008_0000, "Sync Suspended"),
    (0x0010_0000, "Debug Will Sync"),
    (0x0020_0000, "Stack Crawl Needed"),
    (0x0040_0000, "Suspend Unstarted"),
    (0x0080_0000, "Aborted"),
    (0x0100_0000, "Thread Pool Worker Thread"),
    (0x0200_0000, "Interruptible"),
    (0x0400_0000, "Interrupted"),
    (0x0800_0000, "Completion Port Thread"),
    (0x1000_0000, "Abort Initiated"),
    (0x2000_0000, "Finalized"),
    (0x4000_0000, "Failed to Start"),
    (0x8000_0000, "Detached"),
];

/// Bits that mean the thread is parked in a wait, sleep or join
const WAITING_STATE_BITS: u32 = 0x0200_0000 | 0x0008_0000;

/// Name pieces that mark a thread as waiting on something. A piece matches
/// when it starts with one of these, so `WaitOne` and `pthread_mutex_lock`
/// match while `clock_gettime` and `BlockCopy` do not.
pub const WAIT_WORDS: &[&str] = &[
    "wait",
    "sleep",
    "lock",
    "blocked",
    "futex",
    "semaphore",
    "psynch",
    "interruptible",
];

/// Names matched as a whole. `join` alone would match the `Legal to Join`
/// state flag every runtime thread carries.
pub const WAIT_PHRASES: &[&str] = &[
    "monitor.enter",
    "monitor.reliableenter",
    "cvwait",
    "thread.join",
    "pthread_join",
    "sync suspended",
];

/// Human-readable names for a runtime thread state value
pub fn describe_thread_state(bits: u32) -> Vec<&'static str> {
    THREAD_STATE_FLAGS
        .iter()
        .filter(|(mask, _)| bits & mask != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Lowercased identifier pieces of `text`, split on punctuation,
/// underscores and lower-to-upper case changes
fn name_pieces(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut after_lower = false;
    for c in text.chars() {
        if !c.is_ascii_alphanumeric() {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            after_lower = false;
            continue;
        }
        if c.is_ascii_uppercase() && after_lower {
            pieces.push(std::mem::take(&mut current));
        }
        after_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        current.push(c.to_ascii_lowercase());
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// True when `text` names a wait, sleep, join or lock primitive
pub fn mentions_wait(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    WAIT_PHRASES.iter().any(|p| lower.contains(p))
        || name_pieces(text)
            .iter()
            .any(|piece| WAIT_WORDS.iter().any(|w| piece.starts_with(w)))
}

/// SOS `clrthreads` table
pub struct SosThreadTable;

struct SosRow {
    thread: Thread,
    state_bits: u32,
}

fn sos_row_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"(?x)
        ^\s*(?:(?P<dbg>\d+|XXXX)\s+)?
        (?P<id>\d+)\s+
        (?P<osid>[0-9a-fA-F]+)\s+
        (?P<obj>[0-9a-fA-F]{8,16})\s+
        (?P<state>[0-9a-fA-F]+)\s+
        (?P<mode>Preemptive|Cooperative)\s+
        (?P<alloc>\S+)\s+
        (?P<domain>\S+)\s+
        (?P<lock>-?\d+)\s+
        (?P<apt>\S+)
        (?P<rest>.*)$",
    )
}

fn parse_sos_row(line: &str) -> Option<SosRow> {
    let caps = sos_row_regex().captures(line)?;
    let state_bits = u32::from_str_radix(&caps["state"], 16).unwrap_or(0);
    let lock_count = caps["lock"].parse::<i64>().unwrap_or(0).max(0) as u32;

    let mut rest = caps["rest"].trim().to_string();
    let mut tags = Vec::new();
    while let Some(open) = rest.find('(') {
        let Some(close) = rest[open..].find(')') else {
            break;
        };
        tags.push(rest[open + 1..open + close].trim().to_string());
        rest.replace_range(open..=open + close, " ");
    }
    let exception = rest
        .split_whitespace()
        .next()
        .filter(|t| t.contains('.'))
        .map(str::to_string);

    let is_thread_pool = state_bits & 0x0100_0000 != 0
        || state_bits & 0x0800_0000 != 0
        || tags.iter().any(|t| t.to_ascii_lowercase().contains("threadpool"));

    let dbg = caps.name("dbg").map(|m| m.as_str()).filter(|d| *d != "XXXX");
    let managed_id = caps["id"].parse().ok();

    let mut state: Vec<&str> = describe_thread_state(state_bits);
    if state.is_empty() {
        state.push("Running");
    }

    let thread = Thread {
        id: ThreadId::parse(dbg.unwrap_or(&caps["id"])),
        os_thread_id: Some(ThreadId::parse(&caps["osid"])),
        managed_id,
        name: tags.first().cloned(),
        state: state.join(", "),
        is_faulting: exception.is_some(),
        call_stack: Vec::new(),
        is_thread_pool,
        lock_count,
        exception,
    };

    Some(SosRow { thread, state_bits })
}

impl Decoder for SosThreadTable {
    type Record = Vec<Thread>;
    const DIALECT: &'static str = "sos-clrthreads";

    fn sniff(text: &str) -> bool {
        text.contains("ThreadOBJ") && text.contains("OSID")
    }

    fn decode(text: &str) -> Option<Self::Record> {
        let threads: Vec<Thread> = text
            .lines()
            .filter_map(parse_sos_row)
            .map(|row| row.thread)
            .collect();
        (!threads.is_empty()).then_some(threads)
    }
}

/// LLDB `thread list`
pub struct LldbThreadList;

fn lldb_thread_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(&RE, r"^\s*(?P<sel>\*)?\s*thread #(?P<num>\d+)[:,]\s*(?P<rest>.*)$")
}

fn lldb_field_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"tid = (?P<tid>0x[0-9a-fA-F]+|\d+)|name = '(?P<name>[^']*)'|stop reason = (?P<reason>.*)$",
    )
}

fn lldb_top_frame_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"(?P<ip>0x[0-9a-fA-F]+) (?P<module>[^`\s,]+)`(?P<func>[^,+]+)",
    )
}

/// Stop reasons that mean the thread faulted rather than merely stopped
const FAULT_MARKERS: &[&str] = &[
    "exception",
    "exc_",
    "sigsegv",
    "sigabrt",
    "sigbus",
    "sigill",
    "sigfpe",
    "sigtrap",
];

struct LldbLine {
    thread: Thread,
    selected: bool,
}

fn parse_lldb_line(line: &str) -> Option<LldbLine> {
    let caps = lldb_thread_regex().captures(line)?;
    let rest = &caps["rest"];

    let mut os_id = None;
    let mut name = None;
    let mut reason = None;
    for field in lldb_field_regex().captures_iter(rest) {
        if let Some(tid) = field.name("tid") {
            os_id = Some(ThreadId::parse(tid.as_str()));
        } else if let Some(n) = field.name("name") {
            name = Some(n.as_str().to_string());
        } else if let Some(r) = field.name("reason") {
            reason = Some(r.as_str().trim().to_string());
        }
    }

    // The line carries the innermost frame; a later `bt all` replaces it
    let top_frame = lldb_top_frame_regex().captures(rest).map(|c| Frame {
        index: 0,
        instruction_pointer: Address::parse(&c["ip"]),
        module: Some(c["module"].to_string()),
        function: Some(c["func"].trim().to_string()),
        ..Default::default()
    });

    let is_faulting = reason.as_deref().is_some_and(|r| {
        let lower = r.to_ascii_lowercase();
        FAULT_MARKERS.iter().any(|m| lower.contains(m))
    });

    let thread = Thread {
        id: ThreadId::parse(&caps["num"]),
        os_thread_id: os_id,
        name,
        state: reason.clone().unwrap_or_else(|| "stopped".to_string()),
        is_faulting,
        call_stack: top_frame.into_iter().collect(),
        ..Default::default()
    };

    Some(LldbLine {
        thread,
        selected: caps.name("sel").is_some(),
    })
}

fn parse_lldb_lines(text: &str) -> Vec<LldbLine> {
    text.lines().filter_map(parse_lldb_line).collect()
}

impl Decoder for LldbThreadList {
    type Record = Vec<Thread>;
    const DIALECT: &'static str = "lldb-thread-list";

    fn sniff(text: &str) -> bool {
        text.contains("thread #")
    }

    fn decode(text: &str) -> Option<Self::Record> {
        let lines = parse_lldb_lines(text);
        if lines.is_empty() {
            return None;
        }

        // No explicit fault: the selected thread is where the debugger stopped
        let any_faulting = lines.iter().any(|l| l.thread.is_faulting);
        let threads = lines
            .into_iter()
            .map(|mut l| {
                if !any_faulting && l.selected {
                    l.thread.is_faulting = true;
                }
                l.thread
            })
            .collect();
        Some(threads)
    }
}

/// Decode a thread list in any supported dialect
pub fn decode_threads(text: &str) -> (Vec<Thread>, bool) {
    finish(try_decode::<SosThreadTable>(text).or_else(|| try_decode::<LldbThreadList>(text)))
}

/// Blocked/waiting flag for one thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadState {
    pub thread: ThreadId,
    pub waiting: bool,
    pub description: String,
}

/// Per-thread wait flags from `clrthreads`
pub struct SosThreadStates;

impl Decoder for SosThreadStates {
    type Record = Vec<ThreadState>;
    const DIALECT: &'static str = "sos-clrthreads-states";

    fn sniff(text: &str) -> bool {
        SosThreadTable::sniff(text)
    }

    fn decode(text: &str) -> Option<Self::Record> {
        let states: Vec<ThreadState> = text
            .lines()
            .filter_map(parse_sos_row)
            .map(|row| ThreadState {
                thread: row.thread.os_thread_id.clone().unwrap_or(row.thread.id.clone()),
                waiting: row.state_bits & WAITING_STATE_BITS != 0,
                description: row.thread.state,
            })
            .collect();
        (!states.is_empty()).then_some(states)
    }
}

/// Per-thread wait flags from LLDB `thread list` (stop reason and top frame)
pub struct LldbThreadStates;

impl Decoder for LldbThreadStates {
    type Record = Vec<ThreadState>;
    const DIALECT: &'static str = "lldb-thread-states";

    fn sniff(text: &str) -> bool {
        LldbThreadList::sniff(text)
    }

    fn decode(text: &str) -> Option<Self::Record> {
        let states: Vec<ThreadState> = parse_lldb_lines(text)
            .into_iter()
            .map(|l| {
                let top = l.thread.top_function().map(str::to_string);
                let waiting = top.as_deref().is_some_and(mentions_wait)
                    || (!l.thread.is_faulting && mentions_wait(&l.thread.state));
                ThreadState {
                    waiting,
                    description: match top {
                        Some(top) => format!("{} in {}", l.thread.state, top),
                        None => l.thread.state.clone(),
                    },
                    thread: l.thread.os_thread_id.unwrap_or(l.thread.id),
                }
            })
            .collect();
        (!states.is_empty()).then_some(states)
    }
}

/// Decode per-thread wait flags in any supported dialect
pub fn decode_thread_states(text: &str) -> (Vec<ThreadState>, bool) {
    finish(try_decode::<SosThreadStates>(text).or_else(|| try_decode::<LldbThreadStates>(text)))
}
