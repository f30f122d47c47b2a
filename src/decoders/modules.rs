//! Module list decoders
//!
//! - LLDB `image list`: `[  0] UUID 0xBASE /path/to/module`
//! - WinDbg `lm` / `lmv`: `start end name (symbol state)`, with `lmv`
//!   adding indented `Image path:` and `File version:` lines
//! - dotnet-dump `modules`: `BASE SIZE /path/to/module`

use super::{cached_regex, finish, key_value, non_placeholder, try_decode, Decoder};
use crate::address::Address;
use crate::model::Module;
use std::sync::OnceLock;

fn file_name(path: &str) -> String {
    path.rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(path)
        .to_string()
}

/// Runtime and framework assemblies carry their version in the install path
fn version_from_path(path: &str) -> Option<String> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(&RE, r"[/\\](?P<v>\d+\.\d+\.\d+(?:\.\d+)?(?:-[0-9A-Za-z.]+)?)[/\\]")
        .captures(path)
        .map(|c| c["v"].to_string())
}

pub struct LldbImageList;

fn lldb_row_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"^\s*\[\s*(?P<idx>\d+)\]\s+(?:(?P<uuid>[0-9A-Fa-f]{8}(?:-[0-9A-Fa-f]+)+|[0-9A-Fa-f]{32,40})\s+)?(?P<base>0x[0-9a-fA-F]+)\s+(?P<path>[^(]+?)\s*(?:\(.*\))?\s*$",
    )
}

impl Decoder for LldbImageList {
    type Record = Vec<Module>;
    const DIALECT: &'static str = "lldb-image-list";

    fn sniff(text: &str) -> bool {
        text.lines().any(|line| lldb_row_regex().is_match(line))
    }

    fn decode(text: &str) -> Option<Self::Record> {
        let modules: Vec<Module> = text
            .lines()
            .filter_map(|line| lldb_row_regex().captures(line))
            .map(|caps| {
                let path = caps["path"].trim().to_string();
                Module {
                    name: file_name(&path),
                    version: version_from_path(&path),
                    path: Some(path),
                    base_address: Address::parse(&caps["base"]),
                    end_address: None,
                    uuid: caps.name("uuid").map(|m| m.as_str().to_string()),
                }
            })
            .collect();
        (!modules.is_empty()).then_some(modules)
    }
}

pub struct WindbgModuleList;

fn windbg_row_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"^(?P<start>[0-9a-fA-F`]{8,17})\s+(?P<end>[0-9a-fA-F`]{8,17})\s+(?P<name>[^\s(]+)(?:\s+(?P<rest>.*?))?\s*$",
    )
}

impl Decoder for WindbgModuleList {
    type Record = Vec<Module>;
    const DIALECT: &'static str = "windbg-lm";

    fn sniff(text: &str) -> bool {
        text.contains("module name") || text.contains("Image path:")
    }

    fn decode(text: &str) -> Option<Self::Record> {
        let mut modules: Vec<Module> = Vec::new();
        for line in text.lines() {
            if let Some(caps) = windbg_row_regex().captures(line) {
                modules.push(Module {
                    name: caps["name"].to_string(),
                    base_address: Address::parse(&caps["start"]),
                    end_address: Address::parse(&caps["end"]),
                    ..Default::default()
                });
                continue;
            }

            // lmv detail lines belong to the last row
            let (Some(module), Some((key, value))) = (modules.last_mut(), key_value(line)) else {
                continue;
            };
            match key {
                "Image path" => {
                    module.path = non_placeholder(value);
                }
                "File version" => module.version = non_placeholder(value),
                "Product version" if module.version.is_none() => {
                    module.version = non_placeholder(value);
                }
                _ => {}
            }
        }
        (!modules.is_empty()).then_some(modules)
    }
}

pub struct DotnetDumpModules;

fn dotnet_dump_row_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"^\s*(?P<base>(?:0x)?[0-9a-fA-F]{8,16})\s+(?P<size>(?:0x)?[0-9a-fA-F]{8,16})\s+(?P<path>.*[/\\].*?)\s*$",
    )
}

impl Decoder for DotnetDumpModules {
    type Record = Vec<Module>;
    const DIALECT: &'static str = "dotnet-dump-modules";

    fn sniff(text: &str) -> bool {
        text.lines().any(|line| dotnet_dump_row_regex().is_match(line))
    }

    fn decode(text: &str) -> Option<Self::Record> {
        let modules: Vec<Module> = text
            .lines()
            .filter_map(|line| dotnet_dump_row_regex().captures(line))
            .map(|caps| {
                let path = caps["path"].to_string();
                let base = Address::parse(&caps["base"]);
                let size = Address::parse(&caps["size"]);
                Module {
                    name: file_name(&path),
                    version: version_from_path(&path),
                    path: Some(path),
                    base_address: base,
                    end_address: base
                        .zip(size)
                        .and_then(|(b, s)| b.0.checked_add(s.0))
                        .map(Address),
                    uuid: None,
                }
            })
            .collect();
        (!modules.is_empty()).then_some(modules)
    }
}

/// Decode a module list in any supported dialect
pub fn decode_modules(text: &str) -> (Vec<Module>, bool) {
    finish(
        try_decode::<LldbImageList>(text)
            .or_else(|| try_decode::<WindbgModuleList>(text))
            .or_else(|| try_decode::<DotnetDumpModules>(text)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE_LIST: &str = "\
[  0] 5F1E2D3C-4B5A-6978-8796-A5B4C3D2E1F0 0x0000555555554000 /usr/share/dotnet/dotnet
[  1] 0x00007ffff7fc3000 /lib64/ld-linux-x86-64.so.2
[  2] 1A2B3C4D-0000-1111-2222-333344445555 0x00007f8a1b000000 /usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.1/libclrjit.so
";

    const LMV: &str = "\
start             end                 module name
00007ff6`1a2b0000 00007ff6`1a2d5000   dotnet     (deferred)
    Image path: C:\\Program Files\\dotnet\\dotnet.exe
    Image name: dotnet.exe
    File version:     8.0.123.58001
00007ff8`9a1b0000 00007ff8`9a4c5000   KERNELBASE   (pdb symbols)          c:\\symbols\\kernelbase.pdb
";

    const DOTNET_DUMP: &str = "\
00007F8A1B000000 00000000004B6000 /usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.1/libcoreclr.so
0000555555554000 0000000000010000 /usr/share/dotnet/dotnet
";

    #[test]
    fn test_lldb_image_list() {
        let (modules, ok) = decode_modules(IMAGE_LIST);
        assert!(ok);
        assert_eq!(modules.len(), 3);
        assert_eq!(modules[0].name, "dotnet");
        assert_eq!(
            modules[0].uuid.as_deref(),
            Some("5F1E2D3C-4B5A-6978-8796-A5B4C3D2E1F0")
        );
        assert_eq!(modules[1].name, "ld-linux-x86-64.so.2");
        assert_eq!(modules[1].uuid, None);
        assert_eq!(modules[2].name, "libclrjit.so");
        assert_eq!(modules[2].version.as_deref(), Some("8.0.1"));
        assert_eq!(modules[2].base_address, Some(Address(0x7f8a1b000000)));
    }

    #[test]
    fn test_windbg_lmv() {
        let (modules, ok) = decode_modules(LMV);
        assert!(ok);
        assert_eq!(modules.len(), 2);
        let dotnet = &modules[0];
        assert_eq!(dotnet.name, "dotnet");
        assert_eq!(dotnet.path.as_deref(), Some(r"C:\Program Files\dotnet\dotnet.exe"));
        assert_eq!(dotnet.version.as_deref(), Some("8.0.123.58001"));
        assert_eq!(dotnet.end_address, Some(Address(0x7ff61a2d5000)));
        assert_eq!(modules[1].name, "KERNELBASE");
        assert_eq!(modules[1].version, None);
    }

    #[test]
    fn test_dotnet_dump_modules() {
        let (modules, ok) = decode_modules(DOTNET_DUMP);
        assert!(ok);
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].name, "libcoreclr.so");
        assert_eq!(modules[0].end_address, Some(Address(0x7f8a1b4b6000)));
        assert_eq!(modules[0].normalized_name(), "libcoreclr.so");
    }
}
