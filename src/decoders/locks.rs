//! Lock table decoders
//!
//! - SOS `syncblk`: one row per sync block; the owning thread is printed as
//!   thread object, OS thread id (hex) and debugger index, or `none`
//! - WinDbg `!locks`: `CritSec` blocks with `OwningThread` and `LockCount`

use super::{cached_regex, finish, non_placeholder, try_decode, Decoder};
use crate::address::Address;
use crate::model::{LockEntry, LockTable, ThreadId};
use std::sync::OnceLock;

pub struct SosSyncBlk;

fn syncblk_row_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"(?x)
        ^\s*(?P<index>\d+)
        \s+(?P<syncblock>(?:0x)?[0-9a-fA-F]{8,16})
        \s+(?P<held>\d+)
        \s+(?P<recursion>\d+)
        \s+(?:(?P<threadobj>(?:0x)?[0-9a-fA-F]{8,16})\s+)?
        (?:
            (?P<osid>(?:0x)?[0-9a-fA-F]+)\s+(?P<tindex>\d+|XXXX)
          | none
        )
        (?:\s+(?P<object>(?:0x)?[0-9a-fA-F]{8,16}))?
        (?:\s+(?P<type>\S.*?))?
        \s*$",
    )
}

impl Decoder for SosSyncBlk {
    type Record = LockTable;
    const DIALECT: &'static str = "sos-syncblk";

    fn sniff(text: &str) -> bool {
        text.contains("SyncBlock") && text.contains("MonitorHeld")
    }

    fn decode(text: &str) -> Option<Self::Record> {
        let mut table = LockTable::default();
        for line in text.lines() {
            let Some(caps) = syncblk_row_regex().captures(line) else {
                continue;
            };
            let monitor_held: u32 = caps["held"].parse().unwrap_or(0);
            let owner = caps.name("osid").map(|osid| {
                let osid = osid.as_str();
                if osid.starts_with("0x") {
                    ThreadId::parse(osid)
                } else {
                    ThreadId::parse(&format!("0x{osid}"))
                }
            });
            if monitor_held == 0 && owner.is_none() {
                continue;
            }

            table.entries.push(LockEntry {
                lock_id: caps["index"].to_string(),
                sync_block: Address::parse(&caps["syncblock"]),
                monitor_held,
                recursion: caps["recursion"].parse().unwrap_or(0),
                owner,
                owner_index: caps.name("tindex").and_then(|m| m.as_str().parse().ok()),
                object: caps.name("object").and_then(|m| Address::parse(m.as_str())),
                object_type: caps.name("type").and_then(|m| non_placeholder(m.as_str())),
                waiters: None,
            });
        }

        (!table.entries.is_empty()).then_some(table)
    }
}

pub struct WindbgCritSec;

fn critsec_header_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"^\s*CritSec\s+(?P<name>\S+)\s+at\s+(?P<addr>(?:0x)?[0-9a-fA-F`]+)",
    )
}

impl Decoder for WindbgCritSec {
    type Record = LockTable;
    const DIALECT: &'static str = "windbg-locks";

    fn sniff(text: &str) -> bool {
        text.contains("CritSec")
    }

    fn decode(text: &str) -> Option<Self::Record> {
        let mut table = LockTable::default();
        let mut current: Option<(LockEntry, bool)> = None;

        for line in text.lines() {
            if let Some(caps) = critsec_header_regex().captures(line) {
                push_critsec(current.take(), &mut table);
                let address = Address::parse(&caps["addr"]);
                current = Some((
                    LockEntry {
                        lock_id: caps["name"].to_string(),
                        sync_block: address,
                        monitor_held: 0,
                        recursion: 0,
                        owner: None,
                        owner_index: None,
                        object: address,
                        object_type: Some("CRITICAL_SECTION".to_string()),
                        waiters: None,
                    },
                    false,
                ));
                continue;
            }

            let Some((entry, locked)) = current.as_mut() else {
                continue;
            };
            if line.contains("*** Locked") || line.trim() == "Locked" {
                *locked = true;
                continue;
            }
            // "LockCount          2": no separator besides whitespace
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            match key {
                "OwningThread" => {
                    let owner = if value.starts_with("0x") {
                        ThreadId::parse(value)
                    } else {
                        ThreadId::parse(&format!("0x{value}"))
                    };
                    // An all-zero owner means unowned
                    if owner.hex.is_some_and(|v| v != 0) {
                        entry.owner = Some(owner);
                    }
                }
                "RecursionCount" => entry.recursion = value.parse().unwrap_or(0),
                "LockCount" => {
                    // LockCount counts the owner too
                    let count: u32 = value.parse().unwrap_or(0);
                    entry.monitor_held = count;
                    entry.waiters = Some(count.saturating_sub(1));
                }
                "ContentionCount" if entry.waiters.is_none() => {
                    entry.waiters = value.parse().ok();
                }
                _ => {}
            }
        }
        push_critsec(current.take(), &mut table);

        (!table.entries.is_empty()).then_some(table)
    }
}

fn push_critsec(entry: Option<(LockEntry, bool)>, table: &mut LockTable) {
    if let Some((entry, locked)) = entry {
        if locked || entry.owner.is_some() {
            table.entries.push(entry);
        }
    }
}

/// Decode a lock table in any supported dialect
pub fn decode_lock_table(text: &str) -> (LockTable, bool) {
    finish(try_decode::<SosSyncBlk>(text).or_else(|| try_decode::<WindbgCritSec>(text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYNCBLK: &str = "\
Index         SyncBlock MonitorHeld Recursion Owning Thread Info          SyncBlock Owner
   12 000001D4A1C0F1A8            3         1 000001D4A1B2C3D0 2a3c   0   000001d4a1b6c3e8 System.Object
   14 000001D4A1C0F200            5         1 000001D4A1B2F000 2b40   6   000001d4a1b6c500 MyApp.Cache
   15 000001D4A1C0F2B8            0         0 0000000000000000     none    000001d4a1b6c600 System.Object
-----------------------------
Total           16
CCW             0
RCW             0
ComClassFactory 0
Free            0
";

    const CRITSEC: &str = "\
CritSec ntdll!LdrpLoaderLock+0 at 00007ff8`9a2c6508
WaiterWoken        No
LockCount          2
RecursionCount     1
OwningThread       2a3c
EntryCount         0
ContentionCount    3
*** Locked

CritSec MyApp!g_unused+0 at 00007ff8`00001000
LockCount          0
RecursionCount     0
OwningThread       0
";

    #[test]
    fn test_syncblk_rows() {
        let (table, ok) = decode_lock_table(SYNCBLK);
        assert!(ok);
        assert_eq!(table.entries.len(), 2, "unowned row is skipped");

        let first = &table.entries[0];
        assert_eq!(first.lock_id, "12");
        assert_eq!(first.monitor_held, 3);
        assert_eq!(first.waiter_estimate(), 1);
        assert_eq!(first.owner.as_ref().unwrap().hex, Some(0x2a3c));
        assert_eq!(first.owner_index, Some(0));
        assert_eq!(first.object, Some(Address(0x1d4a1b6c3e8)));
        assert_eq!(first.object_type.as_deref(), Some("System.Object"));

        assert_eq!(table.entries[1].waiter_estimate(), 2);
        assert_eq!(table.entries[1].object_type.as_deref(), Some("MyApp.Cache"));
    }

    #[test]
    fn test_windbg_critsec() {
        let (table, ok) = decode_lock_table(CRITSEC);
        assert!(ok);
        assert_eq!(table.entries.len(), 1);
        let lock = &table.entries[0];
        assert_eq!(lock.lock_id, "ntdll!LdrpLoaderLock+0");
        assert_eq!(lock.owner.as_ref().unwrap().hex, Some(0x2a3c));
        assert_eq!(lock.recursion, 1);
        assert_eq!(lock.waiter_estimate(), 1);
    }

    #[test]
    fn test_syncblk_header_only() {
        let text = "Index SyncBlock MonitorHeld Recursion Owning Thread Info  SyncBlock Owner\n\
                    -----------------------------\nTotal 0\n";
        let (table, ok) = decode_lock_table(text);
        assert!(!ok);
        assert!(table.entries.is_empty());
    }
}
