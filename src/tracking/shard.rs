//! Shard keying for the tracking map.

use std::collections::BTreeMap;

use super::types::TrackingEntry;

/// The 16 shard digits, in order.
pub const SHARD_DIGITS: [char; 16] = [
  '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

/// Shard for a file id: its lowercased leading character if that is a hex
/// digit, otherwise `'0'`.
pub fn shard_key(id: &str) -> char {
  match id.chars().next().map(|c| c.to_ascii_lowercase()) {
    Some(c) if c.is_ascii_hexdigit() => c,
    _ => '0',
  }
}

/// Remote document name of a shard.
pub fn shard_name(prefix: &str, digit: char) -> String {
  format!("{}{}.json", prefix, digit)
}

/// Split entries by shard. Shards with no entries are omitted.
pub fn partition(
  entries: &BTreeMap<String, TrackingEntry>,
) -> BTreeMap<char, BTreeMap<String, TrackingEntry>> {
  let mut shards: BTreeMap<char, BTreeMap<String, TrackingEntry>> = BTreeMap::new();
  for (id, entry) in entries {
    shards
      .entry(shard_key(id))
      .or_default()
      .insert(id.clone(), entry.clone());
  }
  shards
}
