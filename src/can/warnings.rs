use std::collections::HashMap;

use log::warn;

/// Frame identifiers that signal a vehicle warning, mapped to their label.
pub type WarningTable = HashMap<u32, String>;

/// Parses `id,label` pairs separated by `;`.
///
/// IDs are decimal or `0x` prefixed hex. Malformed entries are logged and skipped.
pub fn parse_can_warnings(text: &str) -> WarningTable {
    let mut table = WarningTable::new();
    for entry in text.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((id, label)) = entry.split_once(',') else {
            warn!("Skipping CAN warning entry {:?}: expected id,label", entry);
            continue;
        };
        let label = label.trim();
        if label.is_empty() {
            warn!("Skipping CAN warning entry {:?}: empty label", entry);
            continue;
        }
        match parse_frame_id(id.trim()) {
            Some(id) => {
                if let Some(previous) = table.insert(id, label.to_string()) {
                    warn!(
                        "CAN warning 0x{:X} listed twice, {:?} replaced by {:?}",
                        id, previous, label
                    );
                }
            }
            None => warn!("Skipping CAN warning entry {:?}: bad frame id", entry),
        }
    }
    table
}

fn parse_frame_id(text: &str) -> Option<u32> {
    match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_entries() {
        let table = parse_can_warnings("0x1A1,EngineFault;0x3F3,BrakeWarn");
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&0x1A1).map(String::as_str), Some("EngineFault"));
        assert_eq!(table.get(&0x3F3).map(String::as_str), Some("BrakeWarn"));
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let table = parse_can_warnings("badentry;0x1A1,EngineFault;0xZZ,Nope;417,Airbag;12,");
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&0x1A1).map(String::as_str), Some("EngineFault"));
        assert_eq!(table.get(&417).map(String::as_str), Some("Airbag"));
    }

    #[test]
    fn test_whitespace_and_empty_input() {
        assert!(parse_can_warnings("").is_empty());
        assert!(parse_can_warnings(" ; ;").is_empty());

        let table = parse_can_warnings(" 0X10 , Low Oil ; ");
        assert_eq!(table.get(&0x10).map(String::as_str), Some("Low Oil"));
    }

    #[test]
    fn test_duplicate_id_keeps_last_label() {
        let table = parse_can_warnings("0x1A1,First;0x1A1,Second");
        assert_eq!(table.get(&0x1A1).map(String::as_str), Some("Second"));
    }
}
