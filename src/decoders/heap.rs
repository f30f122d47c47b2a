//! Heap histogram decoder (`dumpheap -stat`)
//!
//! Both the classic layout (zero-padded method tables, plain counts) and the
//! newer one (short method tables, thousands separators, byte total in the
//! trailer) go through the same row pattern.

use super::{cached_regex, finish, parse_count, try_decode, Decoder};
use crate::address::Address;
use crate::model::{HeapEntry, HeapHistogram};
use std::sync::OnceLock;

pub struct SosHeapStat;

fn row_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"^\s*(?P<mt>(?:0x)?[0-9a-fA-F]{6,16})\s+(?P<count>\d[\d,._']*)\s+(?P<size>\d[\d,._']*)\s+(?P<name>\S.*?)\s*$",
    )
}

fn total_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    cached_regex(
        &RE,
        r"^\s*Total\s+(?P<objects>\d[\d,._']*)\s+objects",
    )
}

impl Decoder for SosHeapStat {
    type Record = HeapHistogram;
    const DIALECT: &'static str = "sos-dumpheap-stat";

    fn sniff(text: &str) -> bool {
        text.contains("Statistics:") || (text.contains("TotalSize") && text.contains("Count"))
    }

    fn decode(text: &str) -> Option<Self::Record> {
        // Without -stat the object listing precedes the statistics block
        let body = match text.find("Statistics:") {
            Some(pos) => &text[pos + "Statistics:".len()..],
            None => text,
        };

        let mut histogram = HeapHistogram::default();
        for line in body.lines() {
            if let Some(caps) = total_regex().captures(line) {
                histogram.total_objects = parse_count(&caps["objects"]);
                continue;
            }
            let Some(caps) = row_regex().captures(line) else {
                continue;
            };
            let (Some(count), Some(total_size)) =
                (parse_count(&caps["count"]), parse_count(&caps["size"]))
            else {
                continue;
            };
            histogram.entries.push(HeapEntry {
                method_table: Address::parse(&caps["mt"]),
                type_name: caps["name"].to_string(),
                count,
                total_size,
            });
        }

        (!histogram.entries.is_empty()).then_some(histogram)
    }
}

/// Decode a heap histogram
pub fn decode_heap_histogram(text: &str) -> (HeapHistogram, bool) {
    finish(try_decode::<SosHeapStat>(text))
}
