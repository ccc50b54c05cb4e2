//! Inventory output parsing
//!
//! Turns the free text printed by `usbip list -l` into [`DeviceRecord`]s:
//!
//! ```text
//!  - busid 1-1.2 (046d:c52b)                        <- header
//!    Logitech, Inc. : Unifying Receiver (046d:c52b) <- continuation
//! ```
//!
//! Parsing never fails. Anything unexpected is skipped with a warning and the
//! caller gets whatever could be recovered.

use crate::usb::sysfs::BoundProbe;
use protocol::{BusId, DeviceRecord, MAX_BUSID_LEN, MAX_INFO_LEN, sanitize_info};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Token that introduces a bus identifier on a header line
const BUSID_MARKER: &str = "busid";

/// Marker usbip prints when its ID database has no entry for a device
const UNKNOWN_VENDOR_MARKER: &str = "unknown vendor";

/// Vendor and product identifiers
pub type UsbIdPair = (u16, u16);

/// A record still collecting continuation lines
struct OpenRecord {
    busid: BusId,
    info: String,
}

/// Parse inventory output into at most `capacity` records
///
/// `probe` decides each record's `bound` flag; the inventory text itself is
/// not trusted for that.
pub fn parse_inventory(output: &str, capacity: usize, probe: &dyn BoundProbe) -> Vec<DeviceRecord> {
    let mut records: Vec<DeviceRecord> = Vec::new();
    let mut open: Option<OpenRecord> = None;
    let mut seen: HashSet<BusId> = HashSet::new();
    let mut dropped = 0usize;

    let mut close = |open: &mut Option<OpenRecord>, records: &mut Vec<DeviceRecord>| {
        if let Some(rec) = open.take() {
            if records.len() < capacity {
                let bound = probe.is_bound(&rec.busid);
                records.push(DeviceRecord::new(rec.busid, &rec.info, bound));
            } else {
                dropped += 1;
            }
        }
    };

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(token) = header_busid(trimmed) {
            close(&mut open, &mut records);
            open = match BusId::parse(token) {
                Ok(busid) if seen.contains(&busid) => {
                    // Continuation lines of the repeat are dropped with it
                    warn!("Skipping repeated inventory entry for bus ID {}", busid);
                    None
                }
                Ok(busid) => {
                    seen.insert(busid.clone());
                    Some(OpenRecord {
                        busid,
                        info: String::new(),
                    })
                }
                Err(e) => {
                    warn!("Skipping inventory entry with unusable bus ID: {}", e);
                    None
                }
            };
            continue;
        }

        let indented = line.starts_with(' ') || line.starts_with('\t');
        match open.as_mut() {
            Some(rec) if indented => append_info(&mut rec.info, strip_id_prefix(trimmed)),
            _ => debug!("Ignoring inventory line outside a device entry"),
        }
    }
    close(&mut open, &mut records);

    if dropped > 0 {
        warn!(
            "Inventory listed {} more device(s) than the registry holds ({}), ignoring them",
            dropped, capacity
        );
    }
    if records.is_empty() && output.lines().any(|l| !l.trim().is_empty()) {
        warn!("Inventory output contained no recognizable device entries");
    }

    records
}

/// Extract the bus identifier from a header line, if it is one
///
/// A header starts with the `busid` marker, optionally preceded by `-`.
/// The identifier is the token right after it, with trailing `:()`
/// removed and cut to [`MAX_BUSID_LEN`] characters.
fn header_busid(trimmed: &str) -> Option<&str> {
    let rest = trimmed.strip_prefix('-').unwrap_or(trimmed);
    let mut tokens = rest.split_whitespace();
    if !tokens.next()?.eq_ignore_ascii_case(BUSID_MARKER) {
        return None;
    }
    let token = tokens.next()?.trim_end_matches([':', '(', ')']);
    let end = token
        .char_indices()
        .nth(MAX_BUSID_LEN)
        .map_or(token.len(), |(i, _)| i);
    Some(&token[..end])
}

fn strip_id_prefix(line: &str) -> &str {
    line.strip_prefix("ID ").unwrap_or(line)
}

/// Space-join `piece` onto `info`, silently stopping at [`MAX_INFO_LEN`]
fn append_info(info: &mut String, piece: &str) {
    let piece = sanitize_info(piece);
    if piece.is_empty() {
        return;
    }
    if !info.is_empty() {
        if info.len() + 1 > MAX_INFO_LEN {
            return;
        }
        info.push(' ');
    }
    for c in piece.chars() {
        if info.len() + c.len_utf8() > MAX_INFO_LEN {
            break;
        }
        info.push(c);
    }
}

/// Build a `(vendor, product) -> name` table from `lsusb` output
///
/// ```text
/// Bus 001 Device 004: ID 046d:c52b Logitech, Inc. Unifying Receiver
/// ```
pub fn parse_lsusb(output: &str) -> HashMap<UsbIdPair, String> {
    let mut table = HashMap::new();

    for line in output.lines() {
        let Some((_, rest)) = line.split_once(" ID ") else {
            continue;
        };
        let rest = rest.trim();
        let (ids, name) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let (Some(pair), name) = (parse_id_pair(ids), name.trim()) else {
            continue;
        };
        if !name.is_empty() {
            table.entry(pair).or_insert_with(|| name.to_string());
        }
    }

    table
}

/// Replace `unknown vendor` descriptions with names from `table`
///
/// Records without the marker, or whose identifier pair has no entry, are
/// left alone.
pub fn enrich(records: &mut [DeviceRecord], table: &HashMap<UsbIdPair, String>) {
    for record in records.iter_mut() {
        if !record
            .info
            .to_ascii_lowercase()
            .contains(UNKNOWN_VENDOR_MARKER)
        {
            continue;
        }
        let Some(pair) = find_id_pair(&record.info) else {
            continue;
        };
        if let Some(name) = table.get(&pair) {
            debug!(
                "Resolved {} ({:04x}:{:04x}) to {:?}",
                record.busid, pair.0, pair.1, name
            );
            record.info = sanitize_info(name);
        }
    }
}

/// Find the first `vvvv:pppp` token in free text, ignoring brackets
fn find_id_pair(text: &str) -> Option<UsbIdPair> {
    text.split(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .find_map(parse_id_pair)
}

fn parse_id_pair(token: &str) -> Option<UsbIdPair> {
    let (vid, pid) = token.split_once(':')?;
    if vid.len() != 4 || pid.len() != 4 {
        return None;
    }
    Some((
        u16::from_str_radix(vid, 16).ok()?,
        u16::from_str_radix(pid, 16).ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{LSUSB_OUTPUT, USBIP_LIST_OUTPUT, create_mock_inventory};

    fn unbound(_: &BusId) -> bool {
        false
    }

    fn parse(output: &str) -> Vec<DeviceRecord> {
        parse_inventory(output, 32, &unbound)
    }

    #[test]
    fn test_two_headers_one_continuation() {
        let records = parse(" - busid 1-1 (dead:beef)\n   Foo Corp Widget\n - busid 1-2 (dead:beef)\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].busid.as_str(), "1-1");
        assert_eq!(records[0].info, "Foo Corp Widget");
        assert_eq!(records[1].busid.as_str(), "1-2");
        assert_eq!(records[1].info, "");
    }

    #[test]
    fn test_continuations_are_space_joined() {
        let records = parse(" - busid 1-1\n   Foo Corp\n\tWidget Mk II\n");
        assert_eq!(records[0].info, "Foo Corp Widget Mk II");
    }

    #[test]
    fn test_continuation_without_open_record_ignored() {
        let records = parse("   orphan line\n - busid 1-1\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].info, "");
    }

    #[test]
    fn test_unindented_lines_do_not_append() {
        let records = parse(" - busid 1-1\nusbip: warning: something\n   Real info\n");
        assert_eq!(records[0].info, "Real info");
    }

    #[test]
    fn test_uppercase_marker_and_trailing_colon() {
        let records = parse("BUSID 2-3:\n  Thing\n");
        assert_eq!(records[0].busid.as_str(), "2-3");
    }

    #[test]
    fn test_invalid_busid_entry_skipped_with_its_continuations() {
        let records = parse(" - busid 1-1;reboot\n   Evil\n - busid 1-2\n   Good\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].busid.as_str(), "1-2");
        assert_eq!(records[0].info, "Good");
    }

    #[test]
    fn test_repeated_busid_kept_once() {
        let records = parse(
            " - busid 1-1 (dead:beef)\n   Foo Corp Widget\n - busid 1-1 (dead:beef)\n   Again\n - busid 1-2\n",
        );
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].busid.as_str(), "1-1");
        assert_eq!(records[0].info, "Foo Corp Widget");
        assert_eq!(records[1].busid.as_str(), "1-2");
    }

    #[test]
    fn test_diagnostic_mentioning_busid_is_not_a_header() {
        let records = parse(
            " - busid 1-1 (dead:beef)\n   Foo Corp Widget\nusbip: warning: cannot read busid 2-1: permission denied\n   more info\n",
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].busid.as_str(), "1-1");
        assert_eq!(records[0].info, "Foo Corp Widget more info");
    }

    #[test]
    fn test_marker_must_lead_the_line() {
        assert_eq!(header_busid("- busid 1-1 (dead:beef)"), Some("1-1"));
        assert_eq!(header_busid("-busid 1-2"), Some("1-2"));
        assert_eq!(header_busid("BUSID 2-3:"), Some("2-3"));
        assert_eq!(header_busid("error: busid 2-1 not found"), None);
        assert_eq!(header_busid("x - busid 1-1"), None);
    }

    #[test]
    fn test_header_without_token_is_not_a_header() {
        let records = parse(" - busid 1-1\n   mentions busid\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].info, "mentions busid");
    }

    #[test]
    fn test_info_capped() {
        let long = "x".repeat(200);
        let output = format!(" - busid 1-1\n   {long}\n   {long}\n   {long}\n");
        let records = parse(&output);
        assert_eq!(records[0].info.len(), MAX_INFO_LEN);
    }

    #[test]
    fn test_id_prefix_stripped() {
        let records = parse(" - busid 1-1\n   ID 046d:c52b Logitech\n");
        assert_eq!(records[0].info, "046d:c52b Logitech");
    }

    #[test]
    fn test_capacity_limit() {
        let entries: Vec<(String, &str)> = (1..=5).map(|i| (format!("1-{i}"), "dev")).collect();
        let refs: Vec<(&str, &str)> = entries.iter().map(|(b, i)| (b.as_str(), *i)).collect();
        let records = parse_inventory(&create_mock_inventory(&refs), 3, &unbound);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].busid.as_str(), "1-3");
    }

    #[test]
    fn test_garbage_yields_empty_list() {
        assert!(parse("\u{0}\u{1}binary junk\nmore junk").is_empty());
        assert!(parse("").is_empty());
    }

    #[test]
    fn test_bound_comes_from_probe() {
        let probe = |busid: &BusId| busid.as_str() == "1-1.3";
        let records = parse_inventory(USBIP_LIST_OUTPUT, 32, &probe);
        assert!(!records[0].bound);
        assert!(records[1].bound);
    }

    #[test]
    fn test_parse_lsusb_table() {
        let table = parse_lsusb(LSUSB_OUTPUT);
        assert_eq!(
            table.get(&(0x1a86, 0x7523)).map(String::as_str),
            Some("QinHeng Electronics CH340 serial converter")
        );
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_enrich_resolves_unknown_vendor() {
        let mut records = parse(USBIP_LIST_OUTPUT);
        enrich(&mut records, &parse_lsusb(LSUSB_OUTPUT));
        assert_eq!(
            records[0].info,
            "Logitech, Inc. : Unifying Receiver (046d:c52b)"
        );
        assert_eq!(records[1].info, "QinHeng Electronics CH340 serial converter");
    }

    #[test]
    fn test_enrich_miss_leaves_info() {
        let mut records = parse(USBIP_LIST_OUTPUT);
        enrich(&mut records, &HashMap::new());
        assert_eq!(
            records[1].info,
            "unknown vendor : unknown product (1a86:7523)"
        );
    }

    #[test]
    fn test_find_id_pair() {
        assert_eq!(find_id_pair("x (1a86:7523)"), Some((0x1a86, 0x7523)));
        assert_eq!(find_id_pair("no ids here: none"), None);
        assert_eq!(find_id_pair("(12345:1)"), None);
    }
}
