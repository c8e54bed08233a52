// src/core/cluster/slot.rs

//! The cluster hash-slot algorithm for channel names.

use crc::{CRC_16_USB, Crc};

/// The total number of hash slots in the cluster.
pub const NUM_SLOTS: u16 = 16384;

/// The CRC16 algorithm used for calculating hash slots.
const CRC16_ALGO: Crc<u16> = Crc::<u16>::new(&CRC_16_USB);

/// Calculates the hash slot a channel name routes to.
///
/// Honors hash tags: if the name contains a non-empty `{...}` section, only
/// the bytes inside the first such pair of braces are hashed. This lets
/// callers pin related channels to the same slot.
pub fn channel_slot(name: &[u8]) -> u16 {
    let hashed = hash_tag(name).unwrap_or(name);
    CRC16_ALGO.checksum(hashed) % NUM_SLOTS
}

/// The content of the first hash tag in `name`, if one is present.
///
/// A tag opens at the first `{` and runs to the next `}`. An empty tag, as
/// in `news:{}`, does not count; neither does an unclosed brace.
fn hash_tag(name: &[u8]) -> Option<&[u8]> {
    let open = name.iter().position(|&b| b == b'{')?;
    let rest = &name[open + 1..];
    let close = rest.iter().position(|&b| b == b'}')?;
    if close == 0 {
        return None;
    }
    Some(&rest[..close])
}
