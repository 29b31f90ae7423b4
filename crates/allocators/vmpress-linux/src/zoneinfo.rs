use lazy_static::lazy_static;
use log::{debug, warn};
use std::fs::File;
use std::io::Read;
use std::ops::Range;
use vmpress_core::allocator::{Watermarks, ZoneClass, ZoneSnapshot};

use crate::LinuxError;

// https://www.kernel.org/doc/Documentation/sysctl/vm.txt
//
// Every zone of every node gets a block like:
//
// Node 0, zone   Normal
//   pages free     3301021
//         boost    0
//         min      16893
//         low      21116
//         high     25339
//         spanned  3657728
//         present  3657728
//         managed  3580211
//   ...
//   start_pfn:           1048576

const ZONEINFO_PATH: &str = "/proc/zoneinfo";

/// One zone block of `/proc/zoneinfo`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ZoneInfo {
    /// NUMA node
    pub node: usize,
    /// Zone name as printed by the kernel
    pub name: String,
    /// `pages free`
    pub free: u64,
    /// `min`, `low` and `high`
    pub watermarks: Watermarks,
    /// `spanned`
    pub spanned: u64,
    /// `present`
    pub present: u64,
    /// `start_pfn:`
    pub start_pfn: u64,
}

impl ZoneInfo {
    /// Zone class, if the kernel zone maps to one.
    pub fn class(&self) -> Option<ZoneClass> {
        ZoneClass::from_name(&self.name)
    }

    /// Page frames spanned by the zone.
    pub fn pfns(&self) -> Range<u64> {
        self.start_pfn..self.start_pfn + self.spanned
    }
}

/// Parses the contents of `/proc/zoneinfo`.
///
/// # Errors
///
/// Returns [`LinuxError::Parse`] if a zone header or counter is malformed.
pub fn parse_zoneinfo(s: &str) -> Result<Vec<ZoneInfo>, LinuxError> {
    let mut zones: Vec<ZoneInfo> = vec![];
    for line in s.lines() {
        if let Some(header) = line.strip_prefix("Node ") {
            let (node, zone) = header
                .split_once(", zone")
                .ok_or_else(|| LinuxError::Parse(format!("bad zone header: {}", line)))?;
            zones.push(ZoneInfo {
                node: parse_num(node)? as usize,
                name: zone.trim().to_owned(),
                ..Default::default()
            });
            continue;
        }
        let Some(zone) = zones.last_mut() else {
            continue;
        };
        let mut parts = line.split_whitespace();
        let value = match (parts.next(), parts.next(), parts.next()) {
            (Some("pages"), Some("free"), Some(v)) => {
                zone.free = parse_num(v)?;
                continue;
            }
            (Some(_), Some(v), None) => v,
            _ => continue,
        };
        // the first token alone decides; pageset lines use `high:` with a colon
        match line.split_whitespace().next() {
            Some("min") => zone.watermarks.min = parse_num(value)?,
            Some("low") => zone.watermarks.low = parse_num(value)?,
            Some("high") => zone.watermarks.high = parse_num(value)?,
            Some("spanned") => zone.spanned = parse_num(value)?,
            Some("present") => zone.present = parse_num(value)?,
            Some("start_pfn:") => zone.start_pfn = parse_num(value)?,
            _ => {}
        }
    }
    Ok(zones)
}

fn parse_num(s: &str) -> Result<u64, LinuxError> {
    s.trim()
        .parse()
        .map_err(|_| LinuxError::Parse(format!("not a number: {:?}", s)))
}

/// Reads and parses `/proc/zoneinfo`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn read_zoneinfo() -> Result<Vec<ZoneInfo>, LinuxError> {
    let mut buf = String::new();
    File::open(ZONEINFO_PATH)?.read_to_string(&mut buf)?;
    parse_zoneinfo(&buf)
}

/// Folds all kernel zones of one class (every node, DMA and DMA32) into one
/// snapshot. Returns `None` if no populated zone has that class.
pub fn snapshot(zones: &[ZoneInfo], class: ZoneClass) -> Option<ZoneSnapshot> {
    zones
        .iter()
        .filter(|z| z.class() == Some(class) && z.present > 0)
        .fold(None, |acc: Option<ZoneSnapshot>, z| {
            let mut s = acc.unwrap_or(ZoneSnapshot {
                zone: class,
                free_pages: 0,
                watermarks: Watermarks::default(),
                present_pages: 0,
                spanned_pages: 0,
            });
            s.free_pages += z.free;
            s.watermarks.min += z.watermarks.min;
            s.watermarks.low += z.watermarks.low;
            s.watermarks.high += z.watermarks.high;
            s.present_pages += z.present;
            s.spanned_pages += z.spanned;
            Some(s)
        })
}

lazy_static! {
    /// Frame ranges of the zones, read once: zone boundaries are fixed at boot.
    static ref ZONE_SPANS: Vec<(Range<u64>, ZoneClass)> = match read_zoneinfo() {
        Ok(zones) => {
            let spans: Vec<_> = zones
                .iter()
                .filter_map(|z| z.class().map(|c| (z.pfns(), c)))
                .collect();
            debug!("zone spans: {:?}", spans);
            spans
        }
        Err(e) => {
            warn!("Cannot read {}: {}", ZONEINFO_PATH, e);
            vec![]
        }
    };
}

/// The zone holding page frame `pfn`, if known.
pub fn zone_of_pfn(pfn: u64) -> Option<ZoneClass> {
    ZONE_SPANS
        .iter()
        .find(|(span, _)| span.contains(&pfn))
        .map(|(_, class)| *class)
}
