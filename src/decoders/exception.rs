//! Exception record decoder (SOS `printexception` / `pe`)
//!
//! `printexception -nested` prints one section per exception in the chain,
//! each introduced by a `Nested exception ----` rule; [`split_nested_sections`]
//! cuts the output along those rules so each section decodes on its own.

use super::{cached_regex, finish, key_value, non_placeholder, try_decode, Decoder};
use crate::address::Address;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// One exception as printed by the runtime-aware debugger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub address: Option<Address>,
    pub type_name: Option<String>,
    pub message: Option<String>,
    pub inner_type: Option<String>,
    pub inner_address: Option<Address>,
    /// `0x`-prefixed, as printed in error tables
    pub hresult: Option<String>,
    pub stack_trace: Vec<String>,
    pub stack_trace_string: Option<String>,
}

pub struct SosPrintException;

fn inner_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"^(?P<type>[^,\s]+)(?:,.*?(?:PrintException|pe)\s+(?:-nested\s+)?(?P<addr>(?:0x)?[0-9a-fA-F]{6,16}))?",
    )
}

fn trace_row_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"^\s*(?:(?:0x)?[0-9a-fA-F]{8,16}\s+){1,2}(?P<site>\S.*?)\s*$",
    )
}

/// Normalize an HRESULT to `0x80131509` form.
///
/// A `0x` prefix always means hex and a leading `-` always means a signed
/// decimal; bare digits are read in `bare_radix`. `printexception` prints
/// bare hex, object fields hold the signed decimal `int`.
pub(crate) fn format_hresult(value: &str, bare_radix: u32) -> Option<String> {
    let value = value.trim();
    let hex = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"));
    let code = match hex {
        Some(digits) => u32::from_str_radix(digits, 16).ok()?,
        None if value.starts_with('-') || bare_radix == 10 => {
            let signed = value.parse::<i64>().ok()?;
            if signed < i64::from(i32::MIN) || signed > i64::from(u32::MAX) {
                return None;
            }
            signed as u32
        }
        None => u32::from_str_radix(value, bare_radix).ok()?,
    };
    Some(format!("{code:#010x}"))
}

impl Decoder for SosPrintException {
    type Record = ExceptionRecord;
    const DIALECT: &'static str = "sos-printexception";

    fn sniff(text: &str) -> bool {
        text.contains("Exception type:") || text.contains("Exception object:")
    }

    fn decode(text: &str) -> Option<Self::Record> {
        let mut record = ExceptionRecord::default();
        let mut in_trace = false;

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                in_trace = false;
                continue;
            }

            if in_trace {
                if trimmed.starts_with("SP ") || trimmed == "<none>" {
                    continue;
                }
                if let Some(caps) = trace_row_regex().captures(line) {
                    record.stack_trace.push(caps["site"].to_string());
                    continue;
                }
                in_trace = false;
            }

            let Some((key, value)) = key_value(trimmed) else {
                continue;
            };
            match key {
                "Exception object" => record.address = Address::parse(value),
                "Exception type" => record.type_name = non_placeholder(value),
                "Message" => record.message = non_placeholder(value),
                "InnerException" => {
                    if let Some(caps) = non_placeholder(value)
                        .as_deref()
                        .and_then(|v| inner_regex().captures(v))
                    {
                        record.inner_type = Some(caps["type"].to_string());
                        record.inner_address =
                            caps.name("addr").and_then(|m| Address::parse(m.as_str()));
                    }
                }
                "StackTrace (generated)" => in_trace = true,
                "StackTraceString" => record.stack_trace_string = non_placeholder(value),
                "HResult" => record.hresult = format_hresult(value, 16),
                _ => {}
            }
        }

        (record.type_name.is_some() || record.address.is_some()).then_some(record)
    }
}

/// Decode one exception section
pub fn decode_exception(text: &str) -> (ExceptionRecord, bool) {
    finish(try_decode::<SosPrintException>(text))
}

/// Split `printexception -nested` output into one section per exception,
/// outermost first
pub fn split_nested_sections(text: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if line.trim_start().starts_with("Nested exception") {
            if !current.trim().is_empty() {
                sections.push(std::mem::take(&mut current));
            }
            current.clear();
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRINTEXCEPTION: &str = "\
Exception object: 000001d4a1b6c3d0
Exception type:   System.InvalidOperationException
Message:          Operation is not valid due to the current state of the object.
InnerException:   System.IO.FileNotFoundException, Use !PrintException 000001d4a1b6d000 to see more.
StackTrace (generated):
    SP               IP               Function
    000000E51A7FE6C8 00007FF8A1B2C3D4 MyApp!MyApp.Worker.Run(System.String)+0x4a
    000000E51A7FE7A0 00007FF8A1B2C500 MyApp!MyApp.Program.Main(System.String[])+0x20

StackTraceString: <none>
HResult: 80131509
";

    #[test]
    fn test_printexception_fields() {
        let (record, ok) = decode_exception(PRINTEXCEPTION);
        assert!(ok);
        assert_eq!(record.address, Some(Address(0x1d4a1b6c3d0)));
        assert_eq!(record.type_name.as_deref(), Some("System.InvalidOperationException"));
        assert!(record.message.as_deref().unwrap().starts_with("Operation is not valid"));
        assert_eq!(record.inner_type.as_deref(), Some("System.IO.FileNotFoundException"));
        assert_eq!(record.inner_address, Some(Address(0x1d4a1b6d000)));
        assert_eq!(record.hresult.as_deref(), Some("0x80131509"));
        assert_eq!(record.stack_trace.len(), 2);
        assert_eq!(
            record.stack_trace[0],
            "MyApp!MyApp.Worker.Run(System.String)+0x4a"
        );
        assert_eq!(record.stack_trace_string, None);
    }

    #[test]
    fn test_no_inner_exception() {
        let text = "Exception object: 000001d4a1b6d000\n\
                    Exception type:   System.IO.FileNotFoundException\n\
                    Message:          Could not load file or assembly 'Plugin'.\n\
                    InnerException:   <none>\n\
                    StackTrace (generated):\n\
                    <none>\n\
                    HResult: 0x80070002\n";
        let (record, ok) = decode_exception(text);
        assert!(ok);
        assert_eq!(record.inner_type, None);
        assert_eq!(record.inner_address, None);
        assert!(record.stack_trace.is_empty());
        assert_eq!(record.hresult.as_deref(), Some("0x80070002"));
    }

    #[test]
    fn test_format_hresult_forms() {
        assert_eq!(format_hresult("80131509", 16).as_deref(), Some("0x80131509"));
        assert_eq!(format_hresult("0x80131509", 16).as_deref(), Some("0x80131509"));
        // Object fields hold the signed int
        assert_eq!(format_hresult("-2146233079", 10).as_deref(), Some("0x80131509"));
        assert_eq!(format_hresult("-2146233079", 16).as_deref(), Some("0x80131509"));
        assert_eq!(format_hresult("0x80131509", 10).as_deref(), Some("0x80131509"));
        assert_eq!(format_hresult("1", 10).as_deref(), Some("0x00000001"));
        assert_eq!(format_hresult("garbage", 10), None);
        assert_eq!(format_hresult("-99999999999", 10), None);
    }

    #[test]
    fn test_split_nested_sections() {
        let text = format!(
            "{PRINTEXCEPTION}\nNested exception -------------------------------------------------------------\n\
             Exception object: 000001d4a1b6d000\nException type:   System.IO.FileNotFoundException\n"
        );
        let sections = split_nested_sections(&text);
        assert_eq!(sections.len(), 2);
        let (inner, ok) = decode_exception(&sections[1]);
        assert!(ok);
        assert_eq!(inner.address, Some(Address(0x1d4a1b6d000)));
    }

    #[test]
    fn test_no_exception_banner() {
        let (record, ok) = decode_exception("The current thread has no managed exception");
        assert!(!ok);
        assert_eq!(record, ExceptionRecord::default());
    }
}
