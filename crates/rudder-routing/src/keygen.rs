//! Per-shard sample key generation.
//!
//! Diagnostics and keyslot probes need, for each shard, some short key
//! that provably hashes into that shard's slot range. Keys are found by
//! brute force over `[a-z0-9]` strings in length order; with 16384 slots
//! spread over a handful of shards a hit for every shard shows up well
//! inside length 3, so the default cap of 4 is generous.

use crate::slot_map::SlotMap;
use crate::slots::key_slot;
use crate::ShardId;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Sample keys, one per shard where the slot map allowed finding one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeysForShards {
    keys: Vec<Option<String>>,
}

impl KeysForShards {
    /// The sample key for a shard, if one was found.
    pub fn key_for_shard(&self, shard: ShardId) -> Option<&str> {
        self.keys.get(shard.index())?.as_deref()
    }

    /// Returns `true` when every shard has a key.
    pub fn is_complete(&self) -> bool {
        !self.keys.is_empty() && self.keys.iter().all(Option::is_some)
    }
}

/// Searches for one key per shard under the given slot map.
///
/// Candidates are enumerated shortest-first, so the stored keys stay
/// short and stable across runs. Shards owning no slots in the map keep
/// `None`; the caller treats that as "no probe key available".
pub fn generate_keys_for_shards(
    map: &SlotMap,
    shard_count: u16,
    max_len: usize,
) -> KeysForShards {
    let mut keys: Vec<Option<String>> = vec![None; shard_count as usize];
    let mut missing = shard_count as usize;

    let mut buf = Vec::with_capacity(max_len);
    for len in 1..=max_len {
        if missing == 0 {
            break;
        }
        buf.clear();
        buf.resize(len, ALPHABET[0]);
        let mut digits = vec![0usize; len];

        loop {
            if let Some(shard) = map.shard_of(key_slot(&buf)) {
                if let Some(slot @ None) = keys.get_mut(shard.index()) {
                    // candidate bytes come from ALPHABET, always UTF-8
                    *slot = Some(String::from_utf8_lossy(&buf).into_owned());
                    missing -= 1;
                    if missing == 0 {
                        break;
                    }
                }
            }

            // odometer increment over the alphabet
            let mut pos = len;
            loop {
                if pos == 0 {
                    break;
                }
                pos -= 1;
                digits[pos] += 1;
                if digits[pos] < ALPHABET.len() {
                    buf[pos] = ALPHABET[digits[pos]];
                    break;
                }
                digits[pos] = 0;
                buf[pos] = ALPHABET[0];
            }
            if pos == 0 && digits[0] == 0 && buf[0] == ALPHABET[0] {
                // odometer rolled over: this length is exhausted
                break;
            }
        }
    }

    KeysForShards { keys }
}
