//! Remotely accessible memory segments.

use std::fs;
use std::ptr;
use std::sync::atomic::AtomicU64;

use rrddmma::prelude::*;
use rrddmma::rdma::mr::Permission;
use tracing::{debug, info, warn};

/// Lowest virtual address a segment may be placed at.
pub const SEGMENT_FLOOR: u64 = 1 << 35;

const HUGE_PAGE_PATH: &str = "/proc/sys/vm/nr_hugepages";
const HUGE_PAGE_SIZE: u64 = 1 << 21;

/// The 64-byte header at offset 0 of every segment.
///
/// `allocated` is the bump counter claimed by remote fetch-and-adds. The
/// remaining words are meaningful only in segment 0: `control_flag` counts
/// compute-thread shutdown signals, and `barrier` and `root` (memory node 0
/// only) hold the cluster barrier word and the published root pointer.
#[repr(C, align(64))]
pub struct ControlBlock {
    pub size: u64,
    pub allocated: AtomicU64,
    pub control_flag: AtomicU64,
    pub barrier: AtomicU64,
    pub root: AtomicU64,
}

impl ControlBlock {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            allocated: AtomicU64::new(std::mem::size_of::<ControlBlock>() as u64),
            control_flag: AtomicU64::new(0),
            barrier: AtomicU64::new(0),
            root: AtomicU64::new(0),
        }
    }
}

/// Find an unmapped, size-aligned hole at or above `min_addr` by walking
/// `/proc/self/maps`.
///
/// The caller must pass the result to `mmap` with `MAP_FIXED_NOREPLACE`
/// before anything else maps memory, or the placement can be stolen.
fn find_map_hole(min_addr: u64, len: u64) -> Option<u64> {
    assert!(
        len.is_power_of_two(),
        "segment size must be a power of two, got {len}"
    );
    let round_up = |addr: u64| (addr + len - 1) & !(len - 1);

    let mut addr = round_up(min_addr);
    let maps = fs::read_to_string("/proc/self/maps").ok()?;
    // Lines are "lo-hi perms offset dev inode path", sorted by lo, disjoint.
    for line in maps.lines() {
        let Some(range) = line.split_whitespace().next() else {
            continue;
        };
        let Some((lo, hi)) = range.split_once('-') else {
            continue;
        };
        let (Ok(lo), Ok(hi)) = (u64::from_str_radix(lo, 16), u64::from_str_radix(hi, 16)) else {
            continue;
        };
        if addr + len <= lo {
            break;
        }
        if addr < hi {
            addr = round_up(hi);
        }
    }
    addr.checked_add(len)?;
    Some(addr)
}

/// Number of huge pages the kernel has reserved, or 0 when unknown.
fn num_huge_pages() -> u64 {
    fs::read_to_string(HUGE_PAGE_PATH)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// A power-of-two byte region, aligned to its size, registered with the
/// RDMA device by the owner.
pub struct Segment {
    base: *mut u8,
    capacity: u64,
    from_huge: bool,
}

// The region is plain anonymous memory; accesses to it are coordinated by
// the control block's atomics and by RDMA completion order.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Map a `capacity`-byte region at a deterministically probed address.
    /// Fatal when no placement exists or the mapping fails.
    pub fn new(capacity: u64) -> Self {
        let hint = find_map_hole(SEGMENT_FLOOR, capacity)
            .expect("no aligned hole in the address space for a segment");
        let base_flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE;

        let want_huge = num_huge_pages() > 0 && capacity % HUGE_PAGE_SIZE == 0;
        let mut from_huge = want_huge;
        let mut raw = if want_huge {
            unsafe { Self::map_at(hint, capacity, base_flags | libc::MAP_HUGETLB) }
        } else {
            libc::MAP_FAILED
        };
        if raw == libc::MAP_FAILED {
            if want_huge {
                warn!(capacity, "huge-page mapping failed, falling back to normal pages");
            }
            from_huge = false;
            raw = unsafe { Self::map_at(hint, capacity, base_flags) };
        }
        assert!(
            raw != libc::MAP_FAILED,
            "mmap of {capacity}-byte segment at 0x{hint:x} failed: {}",
            std::io::Error::last_os_error()
        );
        debug!(base = raw as u64, capacity, from_huge, "mapped segment");
        Self {
            base: raw as *mut u8,
            capacity,
            from_huge,
        }
    }

    unsafe fn map_at(hint: u64, len: u64, flags: i32) -> *mut libc::c_void {
        libc::mmap(
            hint as *mut libc::c_void,
            len as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    }

    /// Register the whole region with a protection domain, granting local
    /// write and remote read/write/atomic access. Fatal on failure.
    pub fn register(&self, pd: &Pd) -> Mr {
        let mr = unsafe { Mr::reg(pd, self.base, self.capacity as usize, Permission::default()) }
            .expect("cannot register segment memory");
        info!(
            base = self.base as u64,
            capacity = self.capacity,
            pages = if self.from_huge { "2MB" } else { "4KB" },
            "registered segment"
        );
        mr
    }

    /// Placement-initialize the control block at offset 0.
    pub fn init_control(&self) {
        unsafe { ptr::write(self.base as *mut ControlBlock, ControlBlock::new(self.capacity)) };
    }

    /// View the control block at offset 0.
    pub fn control(&self) -> &ControlBlock {
        unsafe { &*(self.base as *const ControlBlock) }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.capacity as usize) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn control_block_layout_is_wire_stable() {
        assert_eq!(size_of::<ControlBlock>(), 64);
        assert_eq!(align_of::<ControlBlock>(), 64);
        assert_eq!(offset_of!(ControlBlock, size), 0);
        assert_eq!(offset_of!(ControlBlock, allocated), 8);
        assert_eq!(offset_of!(ControlBlock, control_flag), 16);
        assert_eq!(offset_of!(ControlBlock, barrier), 24);
        assert_eq!(offset_of!(ControlBlock, root), 32);
    }

    #[test]
    fn fresh_control_block_reserves_its_own_bytes() {
        let cb = ControlBlock::new(1 << 20);
        assert_eq!(cb.size, 1 << 20);
        assert_eq!(
            cb.allocated.load(std::sync::atomic::Ordering::Relaxed),
            size_of::<ControlBlock>() as u64
        );
    }

    #[test]
    fn map_hole_is_aligned_and_above_the_floor() {
        let len = 1 << 20;
        let hole = find_map_hole(SEGMENT_FLOOR, len).unwrap();
        assert!(hole >= SEGMENT_FLOOR);
        assert_eq!(hole % len, 0);
    }

    #[test]
    fn segments_map_at_their_probed_placement() {
        let seg = Segment::new(1 << 20);
        assert!((seg.base() as u64) >= SEGMENT_FLOOR);
        assert_eq!(seg.base() as u64 % (1 << 20), 0);
        seg.init_control();
        assert_eq!(seg.control().size, 1 << 20);
        assert_eq!(
            seg.control()
                .allocated
                .load(std::sync::atomic::Ordering::Relaxed),
            64
        );
    }
}
