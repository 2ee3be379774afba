//! The local half of the distributed bump allocator: size-class math and
//! per-thread free lists. The remote half (the fetch-and-add bump over a
//! segment's control block) is driven by the compute thread, which owns the
//! connections.
//!
//! The allocator is size-preserving: freed blocks return to the class they
//! were carved for and are never coalesced.

use std::collections::HashMap;

use crate::sched::MnAllocPolicy;

/// Every block is preceded by 16 bytes: the total allocated size (header
/// included) and a reserved word.
pub const HEADER_SIZE: u64 = 16;

/// Requests at or below this round to the next 64 bytes.
const SMALL_THRESH: u64 = 1024;

/// Requests at or below this round to the next 1024 bytes.
const MED_THRESH: u64 = 8192;

/// Round a headered size up to its slab class. Large requests fall back to
/// 64-byte granularity.
fn slab_class(size: u64) -> u64 {
    if size <= SMALL_THRESH {
        (size + 63) >> 6 << 6
    } else if size <= MED_THRESH {
        (size + 1023) >> 10 << 10
    } else {
        (size + 63) >> 6 << 6
    }
}

/// Free lists segregated by slab class, plus the placement policy used when
/// they run dry and a fresh remote bump is needed.
pub struct BumpAllocator {
    /// Small and medium classes, keyed by class size.
    freelists: HashMap<u64, Vec<u64>>,
    /// Large blocks as `(class size, block base)` pairs, scanned first-fit.
    free_blocks: Vec<(u64, u64)>,
    pub policy: MnAllocPolicy,
}

impl BumpAllocator {
    pub fn new(policy: MnAllocPolicy) -> Self {
        let mut freelists = HashMap::new();
        for class in (64..=SMALL_THRESH).step_by(64) {
            freelists.insert(class, Vec::new());
        }
        for class in ((SMALL_THRESH + 1024)..=MED_THRESH).step_by(1024) {
            freelists.insert(class, Vec::new());
        }
        Self {
            freelists,
            free_blocks: Vec::new(),
            policy,
        }
    }

    /// The size to claim for a `bytes`-byte payload, header included.
    pub fn compute_size(&self, bytes: u64) -> u64 {
        slab_class(bytes + HEADER_SIZE)
    }

    /// Pop a block from the free lists, returning the address just past the
    /// header. `size` must come from [`Self::compute_size`].
    pub fn try_allocate_local(&mut self, size: u64) -> Option<u64> {
        if size > MED_THRESH {
            // First-fit linear scan over the large blocks.
            let at = self.free_blocks.iter().position(|&(cap, _)| cap >= size)?;
            let (_, base) = self.free_blocks.remove(at);
            return Some(base + HEADER_SIZE);
        }
        let list = self.freelists.get_mut(&size)?;
        list.pop().map(|base| base + HEADER_SIZE)
    }

    /// Push a block onto the free list for its class. `raw` is the
    /// caller-visible pointer; `size` is the header's stored size.
    pub fn reclaim(&mut self, raw: u64, size: u64) {
        let class = slab_class(size);
        let base = raw - HEADER_SIZE;
        if class > MED_THRESH {
            self.free_blocks.push((class, base));
        } else {
            self.freelists.entry(class).or_default().push(base);
        }
    }

    /// True when the free lists hold nothing (used by tests).
    pub fn is_drained(&self) -> bool {
        self.free_blocks.is_empty() && self.freelists.values().all(|l| l.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::ClusterConfig;
    use clap::Parser;

    fn policy() -> MnAllocPolicy {
        let cfg = ClusterConfig::parse_from([
            "test",
            "--node-id",
            "0",
            "--first-mn-id",
            "0",
            "--last-mn-id",
            "0",
            "--first-cn-id",
            "0",
            "--last-cn-id",
            "0",
            "--cn-threads",
            "1",
            "--alloc-pol",
            "NONE",
        ]);
        MnAllocPolicy::new(&cfg, 0)
    }

    #[test]
    fn slab_classes_round_by_size_band() {
        assert_eq!(slab_class(1), 64);
        assert_eq!(slab_class(64), 64);
        assert_eq!(slab_class(65), 128);
        assert_eq!(slab_class(1024), 1024);
        assert_eq!(slab_class(1025), 2048);
        assert_eq!(slab_class(8192), 8192);
        assert_eq!(slab_class(8193), 8256);
        assert_eq!(slab_class(100_000), 100_032);
    }

    #[test]
    fn computed_sizes_cover_the_header() {
        let alloc = BumpAllocator::new(policy());
        assert_eq!(alloc.compute_size(8), 64);
        assert_eq!(alloc.compute_size(48), 64);
        assert_eq!(alloc.compute_size(49), 128);
        assert!(alloc.compute_size(1) >= 8 + HEADER_SIZE);
    }

    #[test]
    fn small_blocks_recycle_through_their_class() {
        let mut alloc = BumpAllocator::new(policy());
        let size = alloc.compute_size(40);
        assert_eq!(alloc.try_allocate_local(size), None);
        // A freed pointer comes back for the next same-class request.
        alloc.reclaim(0x5000 + HEADER_SIZE, size);
        assert_eq!(alloc.try_allocate_local(size), Some(0x5000 + HEADER_SIZE));
        assert_eq!(alloc.try_allocate_local(size), None);
        assert!(alloc.is_drained());
    }

    #[test]
    fn classes_do_not_cross_feed() {
        let mut alloc = BumpAllocator::new(policy());
        alloc.reclaim(0x5000 + HEADER_SIZE, 64);
        assert_eq!(alloc.try_allocate_local(128), None);
        assert_eq!(alloc.try_allocate_local(64), Some(0x5000 + HEADER_SIZE));
    }

    #[test]
    fn large_blocks_are_first_fit() {
        let mut alloc = BumpAllocator::new(policy());
        let big = alloc.compute_size(20_000);
        let bigger = alloc.compute_size(40_000);
        alloc.reclaim(0x10000 + HEADER_SIZE, bigger);
        alloc.reclaim(0x20000 + HEADER_SIZE, big);
        // The first block that fits wins, even though the second is tighter.
        assert_eq!(alloc.try_allocate_local(big), Some(0x10000 + HEADER_SIZE));
        assert_eq!(alloc.try_allocate_local(big), Some(0x20000 + HEADER_SIZE));
        assert_eq!(alloc.try_allocate_local(bigger), None);
    }
}
