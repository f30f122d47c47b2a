//! Stack walk decoders
//!
//! Native unwinder dialects:
//! - LLDB `bt` / `bt all`
//! - WinDbg `k` / `~*k`
//!
//! Runtime-aware walker dialect:
//! - SOS `clrstack [-a] [-r] [-all]`, including `PARAMETERS:` / `LOCALS:`
//!   blocks and register lines
//!
//! Every dialect yields one [`ThreadStack`] per thread section. Frames keep
//! their emission order; renumbering happens in stack correlation.

use super::{cached_regex, finish, non_placeholder, try_decode, Decoder};
use crate::address::{parse_address, Address};
use crate::model::{Frame, SourceLocation, ThreadId, Variable};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Frames decoded for one thread
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadStack {
    /// Debugger-native thread id from the section header
    pub thread_id: Option<ThreadId>,
    pub os_thread_id: Option<ThreadId>,
    pub frames: Vec<Frame>,
}

impl ThreadStack {
    fn new(thread_id: Option<ThreadId>, os_thread_id: Option<ThreadId>) -> Self {
        Self {
            thread_id,
            os_thread_id,
            frames: Vec::new(),
        }
    }
}

/// Push the current section if it has frames
fn flush(stacks: &mut Vec<ThreadStack>, current: &mut Option<ThreadStack>) {
    if let Some(stack) = current.take() {
        if !stack.frames.is_empty() {
            stacks.push(stack);
        }
    }
}

/// Split `module!function+0x14` into its parts
fn split_call_site(site: &str) -> (Option<String>, Option<String>) {
    let site = site.trim();
    let (module, function) = match site.split_once('!') {
        Some((m, f)) => (non_placeholder(m), f),
        None => (None, site),
    };
    (module, non_placeholder(strip_offset(function)))
}

/// Drop a trailing `+0x14` / `+ 478` displacement
fn strip_offset(function: &str) -> &str {
    let function = function.trim();
    match function.rfind('+') {
        Some(pos) => {
            let tail = function[pos + 1..].trim();
            let is_offset = !tail.is_empty()
                && (tail.starts_with("0x") || tail.chars().all(|c| c.is_ascii_digit()));
            if is_offset {
                function[..pos].trim_end()
            } else {
                function
            }
        }
        None => function,
    }
}

/// `file.c:10`, `/src/x.cs @ 42`, `d:\src\x.c @ 1328`
fn parse_source(text: &str) -> Option<SourceLocation> {
    let text = text.trim().trim_start_matches('[').trim_end_matches(']').trim();
    if text.is_empty() {
        return None;
    }

    if let Some((file, line)) = text.rsplit_once(" @ ") {
        return Some(SourceLocation {
            file: file.trim().to_string(),
            line: line.trim().parse().ok(),
        });
    }

    // file:line[:column]; Windows drive letters keep their colon
    let mut parts: Vec<&str> = text.rsplitn(3, ':').collect();
    parts.reverse();
    let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    match parts.as_slice() {
        [file, line, column] if numeric(line) && numeric(column) => Some(SourceLocation {
            file: file.to_string(),
            line: line.parse().ok(),
        }),
        [head, file, line] if numeric(line) => Some(SourceLocation {
            file: format!("{head}:{file}"),
            line: line.parse().ok(),
        }),
        [file, line] if numeric(line) => Some(SourceLocation {
            file: file.to_string(),
            line: line.parse().ok(),
        }),
        _ => Some(SourceLocation {
            file: text.to_string(),
            line: None,
        }),
    }
}

/// LLDB `bt`
pub struct LldbBacktrace;

fn lldb_frame_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"^\s*\*?\s*frame #(?P<idx>\d+):\s*(?P<ip>0x[0-9a-fA-F]+)(?P<rest>.*)$",
    )
}

fn lldb_thread_header_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"^\s*\*?\s*thread #(?P<num>\d+)(?:[:,].*?tid = (?P<tid>0x[0-9a-fA-F]+|\d+))?",
    )
}

fn lldb_sp_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(&RE, r"\bsp\s*=\s*(?P<sp>0x[0-9a-fA-F]+)")
}

fn parse_lldb_frame(line: &str) -> Option<Frame> {
    let caps = lldb_frame_regex().captures(line)?;
    let mut rest = caps["rest"].trim().to_string();

    let stack_pointer = lldb_sp_regex()
        .captures(&rest)
        .and_then(|c| Address::parse(&c["sp"]));
    rest = lldb_sp_regex().replace_all(&rest, "").trim().trim_matches(',').trim().to_string();

    let (site, source) = match rest.rfind(" at ") {
        Some(pos) => (rest[..pos].to_string(), parse_source(&rest[pos + 4..])),
        None => (rest.clone(), None),
    };

    let (module, function) = match site.split_once('`') {
        Some((m, f)) => (non_placeholder(m), non_placeholder(strip_offset(f))),
        None => (None, non_placeholder(strip_offset(&site))),
    };

    Some(Frame {
        index: caps["idx"].parse().unwrap_or(0),
        instruction_pointer: Address::parse(&caps["ip"]),
        stack_pointer,
        module,
        function,
        source,
        ..Default::default()
    })
}

impl Decoder for LldbBacktrace {
    type Record = Vec<ThreadStack>;
    const DIALECT: &'static str = "lldb-bt";

    fn sniff(text: &str) -> bool {
        text.contains("frame #")
    }

    fn decode(text: &str) -> Option<Self::Record> {
        let mut stacks = Vec::new();
        let mut current: Option<ThreadStack> = None;

        for line in text.lines() {
            if let Some(frame) = parse_lldb_frame(line) {
                current
                    .get_or_insert_with(|| ThreadStack::new(None, None))
                    .frames
                    .push(frame);
            } else if let Some(caps) = lldb_thread_header_regex().captures(line) {
                flush(&mut stacks, &mut current);
                current = Some(ThreadStack::new(
                    Some(ThreadId::parse(&caps["num"])),
                    caps.name("tid").map(|t| ThreadId::parse(t.as_str())),
                ));
            }
        }
        flush(&mut stacks, &mut current);

        (!stacks.is_empty()).then_some(stacks)
    }
}

/// WinDbg `k`
pub struct WindbgStack;

fn windbg_frame_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"^\s*(?P<idx>[0-9a-fA-F]{2,})\s+(?P<sp>[0-9a-fA-F`]{8,17})\s+(?P<ret>[0-9a-fA-F`]{8,17})\s+(?P<site>.+?)\s*$",
    )
}

fn windbg_thread_header_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"^\s*[.#]?\s*(?P<num>\d+)\s+Id:\s*(?P<pid>[0-9a-fA-F]+)\.(?P<tid>[0-9a-fA-F]+)",
    )
}

impl Decoder for WindbgStack {
    type Record = Vec<ThreadStack>;
    const DIALECT: &'static str = "windbg-k";

    fn sniff(text: &str) -> bool {
        text.contains("Child-SP") || (text.contains("Call Site") && text.contains("RetAddr"))
    }

    fn decode(text: &str) -> Option<Self::Record> {
        let mut stacks = Vec::new();
        let mut current: Option<ThreadStack> = None;
        // `k` prints each frame's return address; that is the next frame's IP
        let mut previous_return: Option<Address> = None;

        for line in text.lines() {
            if let Some(caps) = windbg_thread_header_regex().captures(line) {
                flush(&mut stacks, &mut current);
                previous_return = None;
                current = Some(ThreadStack::new(
                    Some(ThreadId::parse(&caps["num"])),
                    Some(ThreadId::parse(&format!("0x{}", &caps["tid"]))),
                ));
                continue;
            }

            let Some(caps) = windbg_frame_regex().captures(line) else {
                continue;
            };
            let site = &caps["site"];
            let (site, source) = match site.find(" [") {
                Some(pos) => (&site[..pos], parse_source(&site[pos + 1..])),
                None => (site, None),
            };
            let (module, function) = if parse_address(site).is_some() && !site.contains('!') {
                (None, None)
            } else {
                split_call_site(site)
            };

            let frame = Frame {
                index: usize::from_str_radix(&caps["idx"], 16).unwrap_or(0),
                instruction_pointer: previous_return,
                stack_pointer: Address::parse(&caps["sp"]),
                module,
                function,
                source,
                ..Default::default()
            };
            previous_return = Address::parse(&caps["ret"]);

            current
                .get_or_insert_with(|| ThreadStack::new(None, None))
                .frames
                .push(frame);
        }
        flush(&mut stacks, &mut current);

        (!stacks.is_empty()).then_some(stacks)
    }
}

/// SOS `clrstack`
pub struct SosClrStack;

fn clr_thread_header_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"OS Thread Id:\s*(?P<osid>0x[0-9a-fA-F]+|\d+)(?:\s*\((?P<num>\d+)\))?",
    )
}

fn clr_frame_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"^\s*(?P<sp>(?:0x)?[0-9a-fA-F]{8,16})\s+(?:(?P<ip>(?:0x)?[0-9a-fA-F]{8,16})\s+)?(?P<site>\S.*?)\s*$",
    )
}

fn clr_variable_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"^\s*(?P<name>[^=()]+?)\s*(?:\((?P<loc>[^)]*)\))?\s*=\s*(?P<val>.+?)\s*$",
    )
}

fn clr_register_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(&RE, r"\b(?P<reg>[a-z][a-z0-9]{1,5})=(?P<val>[0-9a-fA-F]{4,16})\b")
}

#[derive(Clone, Copy, PartialEq)]
enum VarBlock {
    None,
    Parameters,
    Locals,
}

fn parse_clr_frame(line: &str) -> Option<Frame> {
    let caps = clr_frame_regex().captures(line)?;
    let mut site = caps["site"].trim();

    // Transition frames: "[GCFrame: 000000e51a7fe7a0]" carry no method;
    // "[InlinedCallFrame: ...] System.Threading.Monitor.Enter(...)" does
    if site.starts_with('[') {
        let close = site.find(']')?;
        site = site[close + 1..].trim();
        if site.is_empty() {
            return None;
        }
    }

    let (site, source) = match site.rfind(" [") {
        Some(pos) if site.ends_with(']') => (&site[..pos], parse_source(&site[pos + 1..])),
        _ => (site, None),
    };
    let (module, function) = split_call_site(site);

    Some(Frame {
        stack_pointer: Address::parse(&caps["sp"]),
        instruction_pointer: caps.name("ip").and_then(|m| Address::parse(m.as_str())),
        module,
        function,
        source,
        is_runtime_tracked: true,
        ..Default::default()
    })
}

fn parse_clr_variable(line: &str) -> Option<Variable> {
    let caps = clr_variable_regex().captures(line)?;
    Some(Variable {
        name: caps["name"].trim().to_string(),
        location: caps.name("loc").and_then(|m| non_placeholder(m.as_str())),
        value: non_placeholder(&caps["val"]),
    })
}

impl Decoder for SosClrStack {
    type Record = Vec<ThreadStack>;
    const DIALECT: &'static str = "sos-clrstack";

    fn sniff(text: &str) -> bool {
        text.contains("OS Thread Id:") || text.contains("Child SP")
    }

    fn decode(text: &str) -> Option<Self::Record> {
        let mut stacks = Vec::new();
        let mut current: Option<ThreadStack> = None;
        let mut block = VarBlock::None;

        for line in text.lines() {
            let trimmed = line.trim();

            if let Some(caps) = clr_thread_header_regex().captures(line) {
                flush(&mut stacks, &mut current);
                block = VarBlock::None;
                current = Some(ThreadStack::new(
                    caps.name("num").map(|m| ThreadId::parse(m.as_str())),
                    Some(ThreadId::parse(&caps["osid"])),
                ));
                continue;
            }

            match trimmed {
                "PARAMETERS:" => {
                    block = VarBlock::Parameters;
                    continue;
                }
                "LOCALS:" => {
                    block = VarBlock::Locals;
                    continue;
                }
                "" => continue,
                _ => {}
            }
            if trimmed.starts_with("Child SP") || trimmed.starts_with("Failed to start") {
                continue;
            }

            // Frame rows start at column 0; variable and register lines are indented
            let indented = line.starts_with(' ') || line.starts_with('\t');
            if !indented || block == VarBlock::None {
                if let Some(frame) = parse_clr_frame(line) {
                    block = VarBlock::None;
                    current
                        .get_or_insert_with(|| ThreadStack::new(None, None))
                        .frames
                        .push(frame);
                    continue;
                }
            }
            if !indented {
                // transition frame or unrecognized row ends any variable block
                block = VarBlock::None;
                continue;
            }

            let Some(frame) = current.as_mut().and_then(|s| s.frames.last_mut()) else {
                continue;
            };

            let registers: Vec<(String, String)> = clr_register_regex()
                .captures_iter(trimmed)
                .map(|c| (c["reg"].to_string(), c["val"].to_string()))
                .collect();
            if !registers.is_empty() && !trimmed.contains(" = ") {
                frame.registers.extend(registers);
                continue;
            }

            if trimmed == "<no data>" {
                continue;
            }
            let Some(variable) = parse_clr_variable(trimmed) else {
                continue;
            };
            match block {
                VarBlock::Parameters => frame.parameters.push(variable),
                VarBlock::Locals => frame.locals.push(variable),
                VarBlock::None => {}
            }
        }
        flush(&mut stacks, &mut current);

        for stack in &mut stacks {
            for (i, frame) in stack.frames.iter_mut().enumerate() {
                frame.index = i;
            }
        }

        (!stacks.is_empty()).then_some(stacks)
    }
}

/// Decode native unwinder output in any supported dialect
pub fn decode_native_stacks(text: &str) -> (Vec<ThreadStack>, bool) {
    finish(try_decode::<LldbBacktrace>(text).or_else(|| try_decode::<WindbgStack>(text)))
}

/// Decode runtime-aware stack walker output
pub fn decode_runtime_stacks(text: &str) -> (Vec<ThreadStack>, bool) {
    finish(try_decode::<SosClrStack>(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LLDB_BT: &str = "\
* thread #1, name = 'dotnet', stop reason = signal SIGSEGV
  * frame #0: 0x00007f8a1b2c3d4e libcoreclr.so`RaiseTheExceptionInternalOnly(Object*, int, int) + 478 at excep.cpp:2941
    frame #1: 0x00007f8a1b2c0000 libcoreclr.so`IL_Throw + 220
    frame #2: 0x00007f8a0c123456
  thread #2, name = 'worker'
    frame #0: 0x00007f8a1b000000 libc.so.6`__futex_abstimed_wait_common + 180
";

    const WINDBG_K: &str = "\
   0  Id: 1a2b.2a3c Suspend: 1 Teb: 000000e5`1a5f1000 Unfrozen
 # Child-SP          RetAddr               Call Site
00 000000e5`1a7fe6c8 00007ff8`9a1b2c3d     ntdll!NtWaitForSingleObject+0x14
01 000000e5`1a7fe6d0 00007ff8`9a1b0000     KERNELBASE!WaitForSingleObjectEx+0x8e [d:\\os\\src\\base.c @ 1328]
02 000000e5`1a7fe770 00000000`00000000     0x00007ff8`12345678
";

    const CLRSTACK: &str = "\
OS Thread Id: 0x2a3c (0)
        Child SP               IP Call Site
000000E51A7FE6C8 00007FF8A1B2C3D4 MyApp.Worker.Run(System.String) [/src/MyApp/Worker.cs @ 42]
    PARAMETERS:
        this (0x000000E51A7FE700) = 0x000001d4a1b2c3d0
        name (<CLR reg>) = 0x000001d4a1b2c500
    LOCALS:
        <no data>
        0x000000E51A7FE6F0 = 0x0000000000000005
000000E51A7FE7A0                  [GCFrame: 000000e51a7fe7a0]
000000E51A7FE8B0 00007FF8A1B2C500 System.Private.CoreLib.dll!System.Threading.Monitor.Enter(System.Object)
    rip=00007ff8a1b2c500 rsp=000000e51a7fe8b0 rbp=000000e51a7fe900
OS Thread Id: 0x2b40 (6)
        Child SP               IP Call Site
000000E51A8FE000 00007FF8A1B2C600 [InlinedCallFrame: 000000e51a8fe000] System.Threading.Thread.Sleep(Int32)
";

    #[test]
    fn test_lldb_bt_sections() {
        let (stacks, ok) = decode_native_stacks(LLDB_BT);
        assert!(ok);
        assert_eq!(stacks.len(), 2);

        let main = &stacks[0];
        assert_eq!(main.thread_id.as_ref().unwrap().raw, "1");
        assert_eq!(main.frames.len(), 3);
        let top = &main.frames[0];
        assert_eq!(top.module.as_deref(), Some("libcoreclr.so"));
        assert_eq!(
            top.function.as_deref(),
            Some("RaiseTheExceptionInternalOnly(Object*, int, int)")
        );
        assert_eq!(top.source.as_ref().unwrap().line, Some(2941));
        assert_eq!(main.frames[1].function.as_deref(), Some("IL_Throw"));
        assert_eq!(main.frames[2].function, None);
        assert_eq!(main.frames[2].instruction_pointer, Some(Address(0x7f8a0c123456)));

        assert_eq!(stacks[1].frames[0].module.as_deref(), Some("libc.so.6"));
    }

    #[test]
    fn test_lldb_bt_with_stack_pointer() {
        let text = "frame #0: 0x0000000000401000 a.out`main + 4, sp = 0x00007ffe00001000";
        let (stacks, ok) = decode_native_stacks(text);
        assert!(ok);
        let frame = &stacks[0].frames[0];
        assert_eq!(frame.stack_pointer, Some(Address(0x7ffe00001000)));
        assert_eq!(frame.function.as_deref(), Some("main"));
    }

    #[test]
    fn test_windbg_k() {
        let (stacks, ok) = decode_native_stacks(WINDBG_K);
        assert!(ok);
        assert_eq!(stacks.len(), 1);
        let stack = &stacks[0];
        assert_eq!(stack.os_thread_id.as_ref().unwrap().hex, Some(0x2a3c));
        assert_eq!(stack.frames.len(), 3);

        let f0 = &stack.frames[0];
        assert_eq!(f0.module.as_deref(), Some("ntdll"));
        assert_eq!(f0.function.as_deref(), Some("NtWaitForSingleObject"));
        assert_eq!(f0.stack_pointer, Some(Address(0xe51a7fe6c8)));
        assert_eq!(f0.instruction_pointer, None);

        let f1 = &stack.frames[1];
        assert_eq!(f1.instruction_pointer, Some(Address(0x7ff89a1b2c3d)));
        assert_eq!(f1.source.as_ref().unwrap().line, Some(1328));

        assert_eq!(stack.frames[2].function, None);
    }

    #[test]
    fn test_clrstack_sections_and_variables() {
        let (stacks, ok) = decode_runtime_stacks(CLRSTACK);
        assert!(ok);
        assert_eq!(stacks.len(), 2);

        let first = &stacks[0];
        assert_eq!(first.os_thread_id.as_ref().unwrap().hex, Some(0x2a3c));
        assert_eq!(first.thread_id.as_ref().unwrap().raw, "0");
        assert_eq!(first.frames.len(), 2, "GCFrame transition is skipped");

        let run = &first.frames[0];
        assert!(run.is_runtime_tracked);
        assert_eq!(run.stack_pointer, Some(Address(0xe51a7fe6c8)));
        assert_eq!(run.function.as_deref(), Some("MyApp.Worker.Run(System.String)"));
        let source = run.source.as_ref().unwrap();
        assert_eq!(source.file, "/src/MyApp/Worker.cs");
        assert_eq!(source.line, Some(42));
        assert_eq!(run.parameters.len(), 2);
        assert_eq!(run.parameters[0].name, "this");
        assert_eq!(run.parameters[1].location, Some("<CLR reg>".to_string()));
        assert_eq!(run.locals.len(), 1);

        let enter = &first.frames[1];
        assert_eq!(enter.index, 1);
        assert_eq!(enter.module.as_deref(), Some("System.Private.CoreLib.dll"));
        assert_eq!(
            enter.function.as_deref(),
            Some("System.Threading.Monitor.Enter(System.Object)")
        );
        assert_eq!(enter.registers.get("rsp").map(String::as_str), Some("000000e51a7fe8b0"));

        let sleep = &stacks[1].frames[0];
        assert_eq!(sleep.function.as_deref(), Some("System.Threading.Thread.Sleep(Int32)"));
    }

    #[test]
    fn test_parse_source_forms() {
        let unix = parse_source("foo.c:10:5").unwrap();
        assert_eq!((unix.file.as_str(), unix.line), ("foo.c", Some(10)));
        let windows = parse_source(r"C:\src\foo.c:10").unwrap();
        assert_eq!((windows.file.as_str(), windows.line), (r"C:\src\foo.c", Some(10)));
        let sos = parse_source("[/src/x.cs @ 7]").unwrap();
        assert_eq!((sos.file.as_str(), sos.line), ("/src/x.cs", Some(7)));
    }

    #[test]
    fn test_strip_offset() {
        assert_eq!(strip_offset("IL_Throw + 220"), "IL_Throw");
        assert_eq!(strip_offset("NtWait+0x14"), "NtWait");
        assert_eq!(strip_offset("operator+"), "operator+");
    }

    #[test]
    fn test_stack_garbage() {
        let (stacks, ok) = decode_native_stacks("frame #zero: nothing");
        assert!(!ok);
        assert!(stacks.is_empty());
    }
}
