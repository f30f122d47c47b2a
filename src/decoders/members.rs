//! Type metadata decoders
//!
//! - SOS `dumpmt -md`: type header plus the `MethodDesc Table`
//! - SOS `name2ee`: name to method table lookup, one block per module searched

use super::{cached_regex, finish, key_value, non_placeholder, try_decode, Decoder};
use crate::address::Address;
use crate::model::{CompileStatus, MemberInfo};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Members of one type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberTable {
    pub type_name: Option<String>,
    pub members: Vec<MemberInfo>,
}

/// Result of a type name lookup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeLookup {
    pub method_table: Option<Address>,
    pub eeclass: Option<Address>,
    pub name: Option<String>,
    /// Assembly the type was found in
    pub module: Option<String>,
}

pub struct SosDumpMt;

fn method_row_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"^\s*(?P<entry>(?:0x)?[0-9a-fA-F]{8,16})\s+(?P<md>(?:0x)?[0-9a-fA-F]{8,16})\s+(?P<jit>PreJIT|JIT|NONE|FCALL|R2R)\s+(?P<sig>\S.*?)\s*$",
    )
}

/// Short member name from a full method signature
///
/// `MyApp.Loader.Load(System.String)` is `Load`,
/// `MyApp.Loader..ctor()` is `.ctor`.
pub fn member_name(signature: &str) -> String {
    let head = signature.split('(').next().unwrap_or(signature).trim();
    for ctor in ["..cctor", "..ctor"] {
        if head.ends_with(ctor) {
            return ctor[1..].to_string();
        }
    }
    // Generic method instantiations: Foo.Bar[[System.Int32, ...]]
    let head = head.split("[[").next().unwrap_or(head);
    head.rsplit('.').next().unwrap_or(head).to_string()
}

impl Decoder for SosDumpMt {
    type Record = MemberTable;
    const DIALECT: &'static str = "sos-dumpmt-md";

    fn sniff(text: &str) -> bool {
        text.contains("MethodDesc Table") || (text.contains("MethodDesc") && text.contains("JIT"))
    }

    fn decode(text: &str) -> Option<Self::Record> {
        let mut table = MemberTable::default();
        for line in text.lines() {
            if let Some(caps) = method_row_regex().captures(line) {
                let signature = caps["sig"].to_string();
                table.members.push(MemberInfo {
                    name: member_name(&signature),
                    signature,
                    compile_status: CompileStatus::parse(&caps["jit"]),
                });
                continue;
            }
            if let Some(("Name", value)) = key_value(line) {
                table.type_name = non_placeholder(value);
            }
        }
        (table.type_name.is_some() || !table.members.is_empty()).then_some(table)
    }
}

pub struct SosName2Ee;

impl Decoder for SosName2Ee {
    type Record = TypeLookup;
    const DIALECT: &'static str = "sos-name2ee";

    fn sniff(text: &str) -> bool {
        text.contains("MethodTable:") || text.contains("Assembly:")
    }

    fn decode(text: &str) -> Option<Self::Record> {
        let mut lookup = TypeLookup::default();
        for line in text.lines() {
            let Some((key, value)) = key_value(line) else {
                continue;
            };
            match key {
                // Each searched module starts a new block
                "Module" if lookup.method_table.is_none() => lookup = TypeLookup::default(),
                "Module" => break,
                "Assembly" => lookup.module = non_placeholder(value),
                "MethodTable" => lookup.method_table = Address::parse(value),
                "EEClass" => lookup.eeclass = Address::parse(value),
                "Name" => lookup.name = non_placeholder(value),
                _ => {}
            }
        }
        lookup.method_table.is_some().then_some(lookup)
    }
}

/// Decode a member table dump
pub fn decode_member_table(text: &str) -> (MemberTable, bool) {
    finish(try_decode::<SosDumpMt>(text))
}

/// Decode a type name lookup; `false` when no method table was found
pub fn decode_type_lookup(text: &str) -> (TypeLookup, bool) {
    finish(try_decode::<SosName2Ee>(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMPMT: &str = "\
EEClass:         00007ff8a1c0e3a8
Module:          00007ff8a1b04000
Name:            MyApp.Services.PluginLoader
mdToken:         0000000002000005
File:            /app/MyApp.dll
BaseSize:        0x18
--------------------------------------
MethodDesc Table
           Entry       MethodDesc    JIT Name
00007FF8A1A10000 00007FF8A1B2D0C8   NONE System.Object.Finalize()
00007FF8A1B30450 00007FF8A1C0E358    JIT MyApp.Services.PluginLoader.Load(System.String)
00007FF8A1B30460 00007FF8A1C0E370 PreJIT MyApp.Services.PluginLoader..ctor()
00007FF8A1B30470 00007FF8A1C0E388   NONE MyApp.Services.PluginLoader.get_Count()
";

    const NAME2EE: &str = "\
Module:      00007ff8a1a04000
Assembly:    System.Private.CoreLib.dll
--------------------------------------
Module:      00007ff8a1b04000
Assembly:    MyApp.dll
Token:       0000000002000005
MethodTable: 00007ff8a1c0e3c0
EEClass:     00007ff8a1c0e3a8
Name:        MyApp.Services.PluginLoader
";

    #[test]
    fn test_dumpmt_members() {
        let (table, ok) = decode_member_table(DUMPMT);
        assert!(ok);
        assert_eq!(table.type_name.as_deref(), Some("MyApp.Services.PluginLoader"));
        assert_eq!(table.members.len(), 4);
        assert_eq!(table.members[0].name, "Finalize");
        assert_eq!(table.members[0].compile_status, CompileStatus::NotCompiled);
        assert_eq!(table.members[1].name, "Load");
        assert_eq!(table.members[1].compile_status, CompileStatus::Jit);
        assert_eq!(table.members[2].name, ".ctor");
        assert_eq!(table.members[2].compile_status, CompileStatus::PreJit);
        assert_eq!(table.members[3].name, "get_Count");
    }

    #[test]
    fn test_member_name_forms() {
        assert_eq!(member_name("A.B..cctor()"), ".cctor");
        assert_eq!(member_name("A.B.Map[[System.Int32, System.Private.CoreLib]](Int32)"), "Map");
        assert_eq!(member_name("Run"), "Run");
    }

    #[test]
    fn test_name2ee_found_in_second_module() {
        let (lookup, ok) = decode_type_lookup(NAME2EE);
        assert!(ok);
        assert_eq!(lookup.method_table, Some(Address(0x7ff8a1c0e3c0)));
        assert_eq!(lookup.module.as_deref(), Some("MyApp.dll"));
        assert_eq!(lookup.name.as_deref(), Some("MyApp.Services.PluginLoader"));
    }

    #[test]
    fn test_name2ee_not_found() {
        let text = "Module:      00007ff8a1a04000\nAssembly:    System.Private.CoreLib.dll\n";
        let (lookup, ok) = decode_type_lookup(text);
        assert!(!ok);
        assert_eq!(lookup.method_table, None);
    }
}
