//! rudder-routing: pure routing data structures.
//!
//! Everything in this crate is deterministic and I/O-free:
//!
//! - **Slot hashing**: CRC16 over the hash-tag slice of a key, mod 16384
//!   ([`key_slot`]).
//! - **[`SlotMap`]**: immutable interval map from slot to shard, replaced
//!   wholesale on topology change and refined point-wise on `MOVED`.
//! - **[`HostIndex`]**: constant-time `(host, port)` to shard lookup used
//!   to interpret redirects.
//! - **[`KeysForShards`]**: per-shard sample keys for diagnostics and
//!   keyslot probes.
//!
//! The live engine (connections, polling, dispatch) builds on these in
//! `rudder-engine`.

mod host_index;
mod key_shard;
mod keygen;
mod slot_map;
mod slots;

pub use host_index::HostIndex;
pub use key_shard::KeyShard;
pub use keygen::{generate_keys_for_shards, KeysForShards};
pub use slot_map::{SlotInterval, SlotMap, SlotMapError};
pub use slots::{key_slot, SLOT_COUNT};

/// Dense index of a logical shard, stable for the engine's lifetime.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct ShardId(pub u16);

impl ShardId {
    /// Returns the shard index as a plain usize, for arena indexing.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}
