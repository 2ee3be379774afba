//! Fixed-capacity rings backing per-thread completion slots and staging
//! buffers.
//!
//! Both rings reclaim in FIFO order only: a release marks its entry free, and
//! the `start` cursor then sweeps forward over every consecutive free entry.
//! This keeps the set of live entries a single cyclic range even when
//! operations complete out of order.

use std::collections::HashMap;

/// State of one slot in a [`SlotRing`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SlotState {
    Available,
    InUse,
    ToBeFreed,
}

/// A FIFO ring of reusable slot indices.
pub struct SlotRing {
    states: Vec<SlotState>,
    start: usize,
    end: usize,
}

impl SlotRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "slot ring capacity must be nonzero");
        Self {
            states: vec![SlotState::Available; capacity],
            start: 0,
            end: 0,
        }
    }

    /// Reserve the slot under the `end` cursor, or `None` if it is busy.
    pub fn acquire(&mut self) -> Option<usize> {
        if self.states[self.end] != SlotState::Available {
            return None;
        }
        let idx = self.end;
        self.states[idx] = SlotState::InUse;
        self.end = (self.end + 1) % self.states.len();
        Some(idx)
    }

    /// Release a previously acquired slot. The slot becomes reusable once
    /// every slot acquired before it has also been released.
    pub fn release(&mut self, idx: usize) {
        assert!(
            self.states[idx] == SlotState::InUse,
            "double release of ring slot {idx}"
        );
        self.states[idx] = SlotState::ToBeFreed;
        while self.states[self.start] == SlotState::ToBeFreed {
            self.states[self.start] = SlotState::Available;
            self.start = (self.start + 1) % self.states.len();
        }
    }

    /// The index the next `acquire` will inspect.
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn capacity(&self) -> usize {
        self.states.len()
    }

    /// True when no slot is outstanding.
    pub fn is_empty(&self) -> bool {
        self.start == self.end && self.states[self.start] == SlotState::Available
    }
}

/// Bookkeeping for one carved chunk: where the following chunk begins, and
/// whether the bytes are handed out (padding and wrap markers are not).
#[derive(Clone, Copy, Debug)]
struct Chunk {
    next: usize,
    in_use: bool,
}

/// A ring allocator over a contiguous byte range.
///
/// Allocations are carved at the `end` cursor, padded up to the requested
/// alignment, and wrapped to the base of the range when the straight-line
/// tail cannot hold them. The ring tracks addresses only and never touches
/// the bytes.
pub struct ChunkRing {
    base: usize,
    size: usize,
    start: usize,
    end: usize,
    chunks: HashMap<usize, Chunk>,
}

#[inline]
fn next_align(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

impl ChunkRing {
    pub fn new(base: usize, size: usize) -> Self {
        Self {
            base,
            size,
            start: base,
            end: base,
            chunks: HashMap::new(),
        }
    }

    /// Insert a padding chunk if `end` is not aligned.
    fn keep_align(&mut self, align: usize) {
        let aligned = next_align(self.end, align);
        if aligned != self.end {
            let padding = self.end;
            self.end = aligned;
            self.chunks.insert(
                padding,
                Chunk {
                    next: aligned,
                    in_use: false,
                },
            );
        }
    }

    fn carve(&mut self, size: usize, align: usize, wrapped: bool) -> usize {
        self.keep_align(align);
        let buf = self.end;
        self.end += size;
        // After a wrap, an exact fit against the cap records its successor at
        // the base so the release sweep can follow it around.
        let next = if wrapped && self.end == self.base + self.size {
            self.base
        } else {
            self.end
        };
        self.chunks.insert(buf, Chunk { next, in_use: true });
        buf
    }

    /// Carve `size` bytes aligned to `align`, or `None` when no hole fits.
    pub fn acquire(&mut self, size: usize, align: usize) -> Option<usize> {
        if next_align(self.base, align) + size > self.base + self.size {
            return None;
        }

        // `start == end` is ambiguous: the ring is empty only if no chunk is
        // outstanding. A completely full ring must not be treated as an
        // untouched tail.
        let unwrapped = self.start < self.end || self.chunks.is_empty();

        let mut real = size + next_align(self.end, align) - self.end;
        if unwrapped && self.end + real <= self.base + self.size {
            // The straight-line tail is big enough.
            return Some(self.carve(size, align, false));
        }

        if unwrapped {
            // Mark the tail dead and wrap to the front.
            self.chunks.insert(
                self.end,
                Chunk {
                    next: self.base,
                    in_use: false,
                },
            );
            self.end = self.base;
            real = size + next_align(self.end, align) - self.end;
        }

        if self.start == self.end {
            // Reachable right after wrapping; the front is free only if the
            // wrap marker is the sole remaining chunk.
            if self.chunks.len() == 1 {
                return Some(self.carve(size, align, true));
            }
            return None;
        }

        // Wrapped: the hole runs from `end` up to `start`.
        if self.end + real <= self.start {
            return Some(self.carve(size, align, true));
        }
        None
    }

    /// Return a chunk. Reuse happens once every chunk carved before it has
    /// also been returned.
    pub fn release(&mut self, buf: usize) {
        let chunk = self
            .chunks
            .get_mut(&buf)
            .unwrap_or_else(|| panic!("release of unknown chunk 0x{buf:x}"));
        assert!(chunk.in_use, "double release of chunk 0x{buf:x}");
        chunk.in_use = false;
        while let Some(chunk) = self.chunks.get(&self.start) {
            if chunk.in_use {
                break;
            }
            let next = chunk.next;
            self.chunks.remove(&self.start);
            self.start = next;
        }
    }

    /// Release every outstanding chunk.
    pub fn release_all(&mut self) {
        let live: Vec<usize> = self
            .chunks
            .iter()
            .filter(|(_, c)| c.in_use)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in live {
            self.release(addr);
        }
    }

    /// True when no chunk is outstanding.
    pub fn is_empty(&self) -> bool {
        self.start == self.end && self.chunks.is_empty()
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_ring_hands_out_fifo_indices() {
        let mut ring = SlotRing::new(4);
        assert_eq!(ring.acquire(), Some(0));
        assert_eq!(ring.acquire(), Some(1));
        assert_eq!(ring.acquire(), Some(2));
        assert_eq!(ring.acquire(), Some(3));
        assert_eq!(ring.acquire(), None);
        ring.release(0);
        assert_eq!(ring.acquire(), Some(0));
    }

    #[test]
    fn slot_ring_reclaims_prefix_only() {
        let mut ring = SlotRing::new(4);
        for _ in 0..3 {
            ring.acquire().unwrap();
        }
        // Out-of-order completion: 1 and 2 finish before 0.
        ring.release(1);
        ring.release(2);
        assert!(!ring.is_empty());
        ring.acquire().unwrap(); // slot 3 is still available
        assert_eq!(ring.acquire(), None); // slot 0 still pins the ring
        ring.release(0);
        ring.release(3);
        assert!(ring.is_empty());
    }

    #[test]
    fn slot_ring_busy_range_is_contiguous() {
        // Under arbitrary release interleavings, the set of busy indices is
        // always the cyclic range [start, end).
        let mut ring = SlotRing::new(5);
        let mut live = Vec::new();
        for step in 0..100usize {
            if step % 3 != 0 {
                if let Some(idx) = ring.acquire() {
                    live.push(idx);
                }
            } else if !live.is_empty() {
                let idx = live.remove(step % live.len());
                ring.release(idx);
            }
            for &idx in &live {
                let in_range = if live.len() == ring.capacity() {
                    true
                } else if ring.start <= ring.end {
                    idx >= ring.start && idx < ring.end
                } else {
                    idx >= ring.start || idx < ring.end
                };
                assert!(in_range, "live slot {idx} outside [{}, {})", ring.start, ring.end);
            }
        }
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn slot_ring_rejects_double_release() {
        let mut ring = SlotRing::new(2);
        let idx = ring.acquire().unwrap();
        ring.release(idx);
        ring.release(idx);
    }

    const BASE: usize = 0x10000;

    #[test]
    fn chunk_ring_carves_aligned_ranges() {
        let mut ring = ChunkRing::new(BASE, 256);
        let a = ring.acquire(10, 8).unwrap();
        assert_eq!(a % 8, 0);
        let b = ring.acquire(16, 64).unwrap();
        assert_eq!(b % 64, 0);
        assert!(b >= a + 10);
        ring.release(a);
        ring.release(b);
        assert!(ring.is_empty());
    }

    #[test]
    fn chunk_ring_rejects_oversize_requests() {
        let mut ring = ChunkRing::new(BASE, 128);
        assert_eq!(ring.acquire(256, 8), None);
        let a = ring.acquire(64, 8).unwrap();
        assert_eq!(a, BASE);
        // 64 live + 64 tail: a 65-byte request cannot fit anywhere. The
        // failed attempt marks the tail dead.
        assert_eq!(ring.acquire(65, 1), None);
        ring.release(a);
        assert!(ring.is_empty());
        assert_eq!(ring.acquire(100, 4), Some(BASE));
    }

    #[test]
    fn chunk_ring_wraps_into_released_space() {
        let mut ring = ChunkRing::new(BASE, 128);
        let a = ring.acquire(48, 8).unwrap();
        let b = ring.acquire(48, 8).unwrap();
        ring.release(a);
        // The 32-byte tail cannot hold 40 bytes, but the released front can.
        let c = ring.acquire(40, 8).unwrap();
        assert_eq!(c, BASE);
        ring.release(b);
        ring.release(c);
        assert!(ring.is_empty());
    }

    #[test]
    fn chunk_ring_blocks_wrap_past_live_chunks() {
        let mut ring = ChunkRing::new(BASE, 128);
        let a = ring.acquire(64, 8).unwrap();
        let _b = ring.acquire(32, 8).unwrap();
        ring.release(a);
        // start is at offset 64; a 72-byte request does not fit in front of
        // it after wrapping.
        assert_eq!(ring.acquire(72, 8), None);
        assert!(ring.acquire(32, 8).is_some());
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn chunk_ring_rejects_double_release() {
        let mut ring = ChunkRing::new(BASE, 64);
        let a = ring.acquire(16, 8).unwrap();
        ring.release(a);
        ring.release(a);
    }

    #[test]
    #[should_panic(expected = "unknown chunk")]
    fn chunk_ring_rejects_foreign_pointers() {
        let mut ring = ChunkRing::new(BASE, 64);
        ring.release(BASE + 4);
    }

    #[test]
    fn chunk_ring_live_ranges_never_overlap() {
        // Randomized-ish workload: live byte ranges must stay disjoint.
        let mut ring = ChunkRing::new(BASE, 1 << 12);
        let mut live: Vec<(usize, usize)> = Vec::new();
        let mut seed = 0x9e3779b97f4a7c15u64;
        let mut rand = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };
        for _ in 0..2000 {
            if rand() % 3 != 0 {
                let size = 1 + rand() % 96;
                let align = 1 << (rand() % 7);
                if let Some(addr) = ring.acquire(size, align) {
                    assert_eq!(addr % align, 0);
                    assert!(addr >= BASE && addr + size <= BASE + (1 << 12));
                    for &(other, olen) in &live {
                        assert!(
                            addr + size <= other || other + olen <= addr,
                            "overlap: 0x{addr:x}+{size} vs 0x{other:x}+{olen}"
                        );
                    }
                    live.push((addr, size));
                }
            } else if !live.is_empty() {
                let idx = rand() % live.len();
                let (addr, _) = live.remove(idx);
                ring.release(addr);
            }
        }
        for (addr, _) in live.drain(..) {
            ring.release(addr);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn chunk_ring_release_all_drains_everything() {
        let mut ring = ChunkRing::new(BASE, 512);
        for _ in 0..5 {
            ring.acquire(32, 16).unwrap();
        }
        ring.release_all();
        assert!(ring.is_empty());
    }
}
