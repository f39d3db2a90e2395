// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Contiguous block runs, the unit payload operations are addressed in.

use serde::{Deserialize, Serialize};

/// A contiguous run of blocks within a partition.
///
/// All payload operations address their source and destination in extents;
/// byte offsets are always `start_block * block_size` for the partition's
/// declared block size.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct Extent {
    pub start_block: u64,
    pub num_blocks: u64,
}

impl Extent {
    pub fn new(start_block: u64, num_blocks: u64) -> Self {
        Self { start_block, num_blocks }
    }

    /// First block past the end of the extent.
    pub fn end_block(&self) -> u64 {
        self.start_block + self.num_blocks
    }

    pub fn byte_offset(&self, block_size: u64) -> u64 {
        self.start_block * block_size
    }

    pub fn num_bytes(&self, block_size: u64) -> u64 {
        self.num_blocks * block_size
    }
}

/// Total number of blocks covered by a list of extents.
pub fn total_blocks(extents: &[Extent]) -> u64 {
    extents.iter().map(|e| e.num_blocks).sum()
}

/// Coalesce adjacent extents into single runs, preserving order.
///
/// Only extents that are directly adjacent in the list are merged; the list
/// order is significant because it defines the order data is laid out in.
pub fn coalesce(extents: &[Extent]) -> Vec<Extent> {
    let mut out: Vec<Extent> = Vec::with_capacity(extents.len());
    for extent in extents {
        if extent.num_blocks == 0 {
            continue;
        }
        match out.last_mut() {
            Some(prev) if prev.end_block() == extent.start_block => {
                prev.num_blocks += extent.num_blocks;
            }
            _ => out.push(*extent),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_strategy::proptest;

    #[test]
    fn coalesce_merges_adjacent_runs() {
        let extents = [
            Extent::new(0, 2),
            Extent::new(2, 3),
            Extent::new(8, 1),
            Extent::new(9, 1),
            Extent::new(4, 1),
        ];
        assert_eq!(
            coalesce(&extents),
            vec![Extent::new(0, 5), Extent::new(8, 2), Extent::new(4, 1)],
        );
    }

    #[test]
    fn coalesce_drops_empty_extents() {
        let extents = [Extent::new(3, 0), Extent::new(5, 2), Extent::new(7, 0)];
        assert_eq!(coalesce(&extents), vec![Extent::new(5, 2)]);
    }

    #[proptest]
    fn coalesce_preserves_block_count(
        #[strategy(proptest::collection::vec((0u64..1024, 0u64..64), 0..32))]
        raw: Vec<(u64, u64)>,
    ) {
        let extents: Vec<_> =
            raw.into_iter().map(|(s, n)| Extent::new(s, n)).collect();
        let merged = coalesce(&extents);
        assert_eq!(total_blocks(&merged), total_blocks(&extents));
        // No two consecutive output extents are still adjacent.
        for pair in merged.windows(2) {
            assert_ne!(pair[0].end_block(), pair[1].start_block);
        }
    }
}
