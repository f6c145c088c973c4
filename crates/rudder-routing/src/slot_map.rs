//! Interval map from hash slot to shard.
//!
//! The map is an immutable value: topology refreshes construct a new map
//! with [`SlotMap::from_intervals`] and swap it in wholesale, `MOVED`
//! redirects refine a copy point-wise with [`SlotMap::with_point_update`].
//! Storage is a sorted vector of `(upper_bound, shard)` entries, so a
//! lookup is a binary search over the handful of intervals a cluster
//! actually has rather than a 16384-entry table.
//!
//! Every full rebuild bumps the map's epoch. A point update computed
//! against epoch N must not be applied over a map at epoch N+1 — the
//! owner swapping maps in checks [`SlotMap::epoch`] first and drops the
//! stale update.

use thiserror::Error;

use crate::slots::SLOT_COUNT;
use crate::ShardId;

/// One contiguous slot range owned by a shard, the input form for a
/// rebuild. `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInterval {
    pub start: u16,
    pub end: u16,
    pub shard: ShardId,
}

impl SlotInterval {
    pub fn new(start: u16, end: u16, shard: ShardId) -> Self {
        Self { start, end, shard }
    }
}

/// Rejection reasons for a rebuild. The previous map stays in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotMapError {
    #[error("interval {start}..={end} is inverted")]
    Inverted { start: u16, end: u16 },

    #[error("slot {0} is out of range")]
    OutOfRange(u16),

    #[error("interval starting at {start} overlaps or is out of order (previous end {prev_end})")]
    Overlap { prev_end: u16, start: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bound {
    /// Highest slot covered by this entry.
    upper: u16,
    /// Owning shard, or `None` for a gap.
    shard: Option<ShardId>,
}

/// Immutable slot-to-shard mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMap {
    bounds: Vec<Bound>,
    epoch: u64,
}

impl SlotMap {
    /// A map that knows nothing: every slot is unknown. Epoch 0.
    pub fn unknown() -> Self {
        Self {
            bounds: Vec::new(),
            epoch: 0,
        }
    }

    /// Builds a map from intervals sorted by `start`.
    ///
    /// Intervals must be non-overlapping; gaps are allowed and resolve to
    /// unknown. On any invalid input the whole set is rejected so a caller
    /// never observes a partially applied topology.
    pub fn from_intervals(
        intervals: &[SlotInterval],
        epoch: u64,
    ) -> Result<Self, SlotMapError> {
        // validate everything before building
        let mut next_free: u32 = 0;
        for iv in intervals {
            if iv.start > iv.end {
                return Err(SlotMapError::Inverted {
                    start: iv.start,
                    end: iv.end,
                });
            }
            if iv.end >= SLOT_COUNT {
                return Err(SlotMapError::OutOfRange(iv.end));
            }
            if (iv.start as u32) < next_free {
                return Err(SlotMapError::Overlap {
                    prev_end: (next_free - 1) as u16,
                    start: iv.start,
                });
            }
            next_free = iv.end as u32 + 1;
        }

        let mut bounds = Vec::with_capacity(intervals.len() * 2);
        let mut covered: u32 = 0;
        for iv in intervals {
            if (iv.start as u32) > covered {
                // gap before this interval
                bounds.push(Bound {
                    upper: iv.start - 1,
                    shard: None,
                });
            }
            bounds.push(Bound {
                upper: iv.end,
                shard: Some(iv.shard),
            });
            covered = iv.end as u32 + 1;
        }
        // a trailing gap stays implicit: lookups past the last bound miss

        Ok(Self { bounds, epoch })
    }

    /// The epoch this map was built at. Point updates keep the epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Resolves a slot to its owning shard, or `None` while unknown.
    pub fn shard_of(&self, slot: u16) -> Option<ShardId> {
        if slot >= SLOT_COUNT {
            return None;
        }
        let idx = self.bounds.partition_point(|b| b.upper < slot);
        self.bounds.get(idx).and_then(|b| b.shard)
    }

    /// Returns `true` when every slot resolves to some shard.
    pub fn is_complete(&self) -> bool {
        self.bounds.last().map(|b| b.upper) == Some(SLOT_COUNT - 1)
            && self.bounds.iter().all(|b| b.shard.is_some())
    }

    /// Returns a copy with a single slot remapped, same epoch.
    ///
    /// Used for `MOVED` redirects: the full refresh is on its way, this
    /// keeps the hot path correct in the meantime.
    pub fn with_point_update(&self, slot: u16, shard: ShardId) -> Self {
        if slot >= SLOT_COUNT {
            return self.clone();
        }

        // decompress, patch, recompress — interval counts are tiny and
        // this sidesteps the interval-splitting edge cases entirely
        let mut owners = vec![None; SLOT_COUNT as usize];
        let mut cursor: usize = 0;
        for b in &self.bounds {
            for owner in owners[cursor..=b.upper as usize].iter_mut() {
                *owner = b.shard;
            }
            cursor = b.upper as usize + 1;
        }
        owners[slot as usize] = Some(shard);

        let mut bounds = Vec::with_capacity(self.bounds.len() + 2);
        for (idx, owner) in owners.iter().enumerate() {
            match bounds.last_mut() {
                Some(Bound { upper, shard }) if *shard == *owner => *upper = idx as u16,
                _ => bounds.push(Bound {
                    upper: idx as u16,
                    shard: *owner,
                }),
            }
        }
        // drop a trailing unknown run to keep the implicit-tail form
        if bounds.last().map(|b| b.shard.is_none()) == Some(true) {
            bounds.pop();
        }

        Self {
            bounds,
            epoch: self.epoch,
        }
    }
}
