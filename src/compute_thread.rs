//! The per-thread operation surface over the distributed heap.
//!
//! Every operation follows the same shape: pick a lane, resolve the
//! connection and rkey for the target pointer, take a completion slot (and a
//! staging chunk unless the caller provided registered memory), post, wait,
//! and release everything in reverse. Blocking calls spin on the lane's send
//! CQ; async calls return an [`AsyncOp`] the caller drives.
//!
//! Completion words are identified by address: each posted work request
//! carries the address of its `AtomicI32` as the `wr_id`, and whichever
//! thread reaps the completion decrements that word. A thread polling a
//! shared lane may therefore retire another thread's operation, which is
//! exactly what lets lanes be shared at all.
//!
//! `fence` flags are accepted throughout; on blocking paths the completion
//! wait already orders against earlier operations on the same lane, so the
//! flag only has an architectural effect on the local-write fast path.

use std::collections::HashMap;
use std::mem::{align_of, offset_of, size_of};
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use rrddmma::prelude::*;
use tracing::{info, warn};

use crate::alloc::{BumpAllocator, HEADER_SIZE};
use crate::async_op::{AsyncOp, Pending};
use crate::cfg::ClusterConfig;
use crate::compute_node::ComputeNode;
use crate::conn::Connection;
use crate::ptr::{RemotePtr, ADDR_BITS};
use crate::ring::{ChunkRing, SlotRing};
use crate::sched::{MnAllocPolicy, QpSchedPolicy};
use crate::segment::ControlBlock;

/// The one coroutine slot the sequenced-group API currently drives.
const CORO: usize = 0;

/// Counts of issued operations, kept per thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpStats {
    pub ops: u64,
    pub bytes: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OpMetrics {
    pub read: OpStats,
    pub write: OpStats,
    pub cas: u64,
    pub faa: u64,
}

/// Holds one lane's in-flight slot for the duration of an operation.
pub(crate) struct Lane {
    idx: u32,
    cn: Arc<ComputeNode>,
}

impl Lane {
    pub(crate) fn new(cn: Arc<ComputeNode>, idx: u32) -> Self {
        cn.lane_acquire(idx);
        Self { idx, cn }
    }

    pub(crate) fn idx(&self) -> u32 {
        self.idx
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        self.cn.lane_release(self.idx);
    }
}

/// Where one queued work request reads or writes its bytes locally.
#[derive(Clone, Copy)]
enum SeqKind {
    /// Read into an owned staging chunk; the value joins the result vector.
    Read { buf: usize },
    /// Read straight into caller-registered memory; excluded from results.
    ReadInto { dst: usize },
    /// Write from an owned staging chunk holding the staged value.
    Write { buf: usize },
    /// Write straight out of caller-registered memory.
    WriteFrom { src: usize },
}

impl SeqKind {
    fn is_write(self) -> bool {
        matches!(self, SeqKind::Write { .. } | SeqKind::WriteFrom { .. })
    }

    fn staging(self) -> Option<usize> {
        match self {
            SeqKind::Read { buf } | SeqKind::Write { buf } => Some(buf),
            _ => None,
        }
    }
}

#[derive(Clone, Copy)]
struct SeqOp {
    kind: SeqKind,
    len: usize,
    raw: u64,
    slot: usize,
}

/// A chain of work requests built up across calls and posted as one unit.
struct SeqGroup {
    seq_slot: usize,
    lane: Lane,
    /// Raw pointer of the first queued op; the whole group must target the
    /// same segment.
    target: u64,
    ops: Vec<SeqOp>,
    posted: bool,
}

/// A thread's handle onto the distributed heap.
///
/// One `ComputeThread` belongs to exactly one OS thread. Registration takes
/// a slice of the compute node's registered buffer; the first half backs
/// staging for in-flight operations and the second half backs the cached
/// buffers handed out by [`Self::local_allocate`].
pub struct ComputeThread {
    node_id: u16,
    tid: u64,
    cn: Arc<ComputeNode>,
    cfg: ClusterConfig,
    /// Completion words, one per outstanding-op slot. Their addresses ride
    /// in `wr_id`s, so the storage must never move.
    counters: Box<[AtomicI32]>,
    op_ring: SlotRing,
    seq_rings: Vec<SlotRing>,
    groups: Vec<HashMap<usize, SeqGroup>>,
    sched: QpSchedPolicy,
    alloc: BumpAllocator,
    staging: ChunkRing,
    cached: ChunkRing,
    metrics: OpMetrics,
}

impl ComputeThread {
    pub fn new(cn: Arc<ComputeNode>) -> Self {
        let cfg = cn.cfg().clone();
        let (tid, offset) = cn.register_thread();
        let n = cfg.cn_ops_per_thread;
        let slice_base = cn.staging_base() + offset;
        let half = cfg.thread_buf_bytes() / 2;

        let counters = (0..n).map(|_| AtomicI32::new(0)).collect::<Vec<_>>().into_boxed_slice();
        let seq_rings = (0..n).map(|_| SlotRing::new(n)).collect();
        let groups = (0..n).map(|_| HashMap::new()).collect();
        let sched = QpSchedPolicy::new(&cfg, tid);
        let alloc = BumpAllocator::new(MnAllocPolicy::new(&cfg, tid));
        info!(tid, "created compute thread");

        Self {
            node_id: cfg.node_id,
            tid,
            cn,
            counters,
            op_ring: SlotRing::new(n),
            seq_rings,
            groups,
            sched,
            alloc,
            staging: ChunkRing::new(slice_base, half),
            cached: ChunkRing::new(slice_base + half, half),
            metrics: OpMetrics::default(),
            cfg,
        }
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn metrics(&self) -> &OpMetrics {
        &self.metrics
    }

    /// The segment index a pointer falls in.
    pub fn seg_id<T>(&self, ptr: RemotePtr<T>) -> u64 {
        ptr.raw() >> self.cfg.seg_size
    }

    pub fn is_local<T>(&self, ptr: RemotePtr<T>) -> bool {
        ptr.is_local(self.node_id)
    }

    // ---- plumbing ----------------------------------------------------

    fn lane_for(&mut self, node: u16) -> Lane {
        Lane::new(self.cn.clone(), self.sched.lane(node))
    }

    fn acquire_slot(&mut self) -> usize {
        self.op_ring.acquire().expect("no completion slot available")
    }

    fn acquire_staging(&mut self, size: usize, align: usize) -> usize {
        self.staging
            .acquire(size, align)
            .expect("staging buffer exhausted")
    }

    /// Arm a completion word for one posted work request.
    fn arm(&self, slot: usize) {
        self.counters[slot].store(1, Ordering::Release);
    }

    fn wr_id(&self, slot: usize) -> u64 {
        &self.counters[slot] as *const AtomicI32 as u64
    }

    /// An `MrSlice` over an address inside this node's registered buffer.
    /// Fatal when the address is outside it.
    fn registered_slice(&self, addr: usize, len: usize) -> MrSlice<'_> {
        let offset = addr
            .checked_sub(self.cn.staging_base())
            .expect("buffer is outside the registered staging area");
        self.cn.mem_slice(offset, len)
    }

    fn remote_of(&self, raw: u64, len: usize) -> MrRemote {
        MrRemote {
            addr: RemotePtr::<u8>::from_raw(raw).address(),
            len,
            rkey: self.cn.get_rkey(raw),
        }
    }

    /// Retire one completion, whosever it is.
    fn consume(wc: &Wc) {
        assert!(
            wc.status() == WcStatus::Success,
            "one-sided operation failed: {:?}",
            wc.status()
        );
        let ack = wc.wr_id() as *const AtomicI32;
        let old = unsafe { &*ack }.fetch_sub(1, Ordering::AcqRel);
        assert!(old >= 1, "completion counter underflow");
    }

    /// Spin until this slot's completion word drains.
    fn spin(&self, conn: &Connection, slot: usize) {
        let mut wcs = [Wc::default()];
        while self.counters[slot].load(Ordering::Acquire) != 0 {
            if conn.poll_send(&mut wcs) == 0 {
                std::hint::spin_loop();
                continue;
            }
            Self::consume(&wcs[0]);
        }
    }

    /// One non-blocking poll; true when the slot's word has drained.
    fn poll_once(&self, conn: &Connection, slot: usize) -> bool {
        if self.counters[slot].load(Ordering::Acquire) == 0 {
            return true;
        }
        let mut wcs = [Wc::default()];
        if conn.poll_send(&mut wcs) > 0 {
            Self::consume(&wcs[0]);
        }
        self.counters[slot].load(Ordering::Acquire) == 0
    }

    /// Local-store fast path for writes to this node's own segments.
    fn write_local(&self, address: u64, src: *const u8, size: usize, fence: bool) {
        unsafe {
            ptr::copy_nonoverlapping(src, address as *mut u8, size);
            #[cfg(target_arch = "x86_64")]
            {
                std::arch::x86_64::_mm_clflush(address as *const u8);
                if fence {
                    std::arch::x86_64::_mm_sfence();
                }
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        if fence {
            std::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // ---- one-sided operations ----------------------------------------

    /// Read a `T` from the distributed heap.
    pub fn read<T: Copy>(&mut self, ptr: RemotePtr<T>, fence: bool) -> T {
        let _ = fence;
        let size = size_of::<T>();
        let lane = self.lane_for(ptr.id());
        let slot = self.acquire_slot();
        let buf = self.acquire_staging(size, align_of::<T>());
        self.arm(slot);
        {
            let conn = self.cn.get_conn(ptr.raw(), lane.idx());
            let local = self.registered_slice(buf, size);
            let remote = self.remote_of(ptr.raw(), size);
            conn.post_read(local, &remote, self.wr_id(slot), true);
            self.spin(conn, slot);
        }
        let val = unsafe { ptr::read(buf as *const T) };
        self.metrics.read.ops += 1;
        self.metrics.read.bytes += size as u64;
        self.staging.release(buf);
        self.op_ring.release(slot);
        val
    }

    /// Zero-copy read: `size` bytes land directly in `dst`, which must lie
    /// in this thread's registered memory (see [`Self::local_allocate`]).
    pub fn read_into<T: Copy>(&mut self, ptr: RemotePtr<T>, dst: *mut T, fence: bool, size: usize) {
        let _ = fence;
        let lane = self.lane_for(ptr.id());
        let slot = self.acquire_slot();
        self.arm(slot);
        {
            let conn = self.cn.get_conn(ptr.raw(), lane.idx());
            let local = self.registered_slice(dst as usize, size);
            let remote = self.remote_of(ptr.raw(), size);
            conn.post_read(local, &remote, self.wr_id(slot), true);
            self.spin(conn, slot);
        }
        self.metrics.read.ops += 1;
        self.metrics.read.bytes += size as u64;
        self.op_ring.release(slot);
    }

    /// Write a `T` to the distributed heap. Local targets are stored
    /// directly and flushed.
    pub fn write<T: Copy>(&mut self, ptr: RemotePtr<T>, val: T, fence: bool) {
        self.write_opts(ptr, val, fence, size_of::<T>(), true)
    }

    pub fn write_opts<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        val: T,
        fence: bool,
        size: usize,
        local_copy: bool,
    ) {
        if local_copy && ptr.is_local(self.node_id) {
            self.write_local(ptr.address(), &val as *const T as *const u8, size, fence);
            return;
        }
        let lane = self.lane_for(ptr.id());
        let slot = self.acquire_slot();
        let buf = self.acquire_staging(size, align_of::<T>());
        unsafe {
            ptr::write_bytes(buf as *mut u8, 0, size);
            ptr::copy_nonoverlapping(
                &val as *const T as *const u8,
                buf as *mut u8,
                size.min(size_of::<T>()),
            );
        }
        self.arm(slot);
        {
            let conn = self.cn.get_conn(ptr.raw(), lane.idx());
            let local = self.registered_slice(buf, size);
            let remote = self.remote_of(ptr.raw(), size);
            conn.post_write(local, &remote, self.wr_id(slot), true);
            self.spin(conn, slot);
        }
        self.metrics.write.ops += 1;
        self.metrics.write.bytes += size as u64;
        self.staging.release(buf);
        self.op_ring.release(slot);
    }

    /// Zero-copy write: `size` bytes are sent straight from `src`, which
    /// must lie in this thread's registered memory.
    pub fn write_from<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        src: *const T,
        fence: bool,
        size: usize,
        local_copy: bool,
    ) {
        if local_copy && ptr.is_local(self.node_id) {
            self.write_local(ptr.address(), src as *const u8, size, fence);
            return;
        }
        let lane = self.lane_for(ptr.id());
        let slot = self.acquire_slot();
        self.arm(slot);
        {
            let conn = self.cn.get_conn(ptr.raw(), lane.idx());
            let local = self.registered_slice(src as usize, size);
            let remote = self.remote_of(ptr.raw(), size);
            conn.post_write(local, &remote, self.wr_id(slot), true);
            self.spin(conn, slot);
        }
        self.metrics.write.ops += 1;
        self.metrics.write.bytes += size as u64;
        self.op_ring.release(slot);
    }

    /// Atomically replace the remote word with `swap` if it equals
    /// `expected`, returning the observed value. The remote operand is
    /// always 8 bytes.
    pub fn compare_and_swap<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        expected: T,
        swap: T,
        fence: bool,
    ) -> T {
        const { assert!(size_of::<T>() <= 8, "atomic operands are at most 8 bytes") };
        let _ = fence;
        let lane = self.lane_for(ptr.id());
        let slot = self.acquire_slot();
        let buf = self.acquire_staging(8, 8);
        self.arm(slot);
        {
            let conn = self.cn.get_conn(ptr.raw(), lane.idx());
            let local = self.registered_slice(buf, 8);
            let remote = self.remote_of(ptr.raw(), 8);
            conn.post_cas(
                local,
                remote,
                to_word(expected),
                to_word(swap),
                self.wr_id(slot),
                true,
            );
            self.spin(conn, slot);
        }
        let word = unsafe { ptr::read(buf as *const u64) };
        self.metrics.cas += 1;
        self.staging.release(buf);
        self.op_ring.release(slot);
        from_word(word)
    }

    /// Atomically add to the remote 8-byte word, returning its prior value.
    pub fn fetch_and_add<T: Copy>(&mut self, ptr: RemotePtr<T>, add: u64, fence: bool) -> T {
        const { assert!(size_of::<T>() <= 8, "atomic operands are at most 8 bytes") };
        let _ = fence;
        let lane = self.lane_for(ptr.id());
        let slot = self.acquire_slot();
        let buf = self.acquire_staging(8, 8);
        self.arm(slot);
        {
            let conn = self.cn.get_conn(ptr.raw(), lane.idx());
            let local = self.registered_slice(buf, 8);
            let remote = self.remote_of(ptr.raw(), 8);
            conn.post_faa(local, remote, add, self.wr_id(slot), true);
            self.spin(conn, slot);
        }
        let word = unsafe { ptr::read(buf as *const u64) };
        self.metrics.faa += 1;
        self.staging.release(buf);
        self.op_ring.release(slot);
        from_word(word)
    }

    // ---- async single-shot operations --------------------------------

    /// Post a read and return a future the caller drives to completion.
    pub fn read_async<T: Copy>(&mut self, ptr: RemotePtr<T>, fence: bool) -> AsyncOp<T> {
        let _ = fence;
        let size = size_of::<T>();
        let lane = self.lane_for(ptr.id());
        let slot = self.acquire_slot();
        let buf = self.acquire_staging(size, align_of::<T>());
        self.arm(slot);
        {
            let conn = self.cn.get_conn(ptr.raw(), lane.idx());
            let local = self.registered_slice(buf, size);
            let remote = self.remote_of(ptr.raw(), size);
            conn.post_read(local, &remote, self.wr_id(slot), true);
        }
        AsyncOp::pending(
            Pending::Single {
                lane,
                target: ptr.raw(),
                slot,
                buf: Some(buf),
            },
            Self::finish_single_read::<T>,
        )
    }

    /// Post a write and return a future. Local targets complete
    /// immediately through the store fast path.
    pub fn write_async<T: Copy>(&mut self, ptr: RemotePtr<T>, val: T, fence: bool) -> AsyncOp<()> {
        let size = size_of::<T>();
        if ptr.is_local(self.node_id) {
            self.write_local(ptr.address(), &val as *const T as *const u8, size, fence);
            return AsyncOp::completed(());
        }
        let lane = self.lane_for(ptr.id());
        let slot = self.acquire_slot();
        let buf = self.acquire_staging(size, align_of::<T>());
        unsafe { ptr::write(buf as *mut T, val) };
        self.arm(slot);
        {
            let conn = self.cn.get_conn(ptr.raw(), lane.idx());
            let local = self.registered_slice(buf, size);
            let remote = self.remote_of(ptr.raw(), size);
            conn.post_write(local, &remote, self.wr_id(slot), true);
        }
        AsyncOp::pending(
            Pending::Single {
                lane,
                target: ptr.raw(),
                slot,
                buf: Some(buf),
            },
            Self::finish_single_write,
        )
    }

    pub(crate) fn poll_pending(&self, op: &Pending) -> bool {
        let (target, lane_idx, slot) = match op {
            Pending::Single { lane, target, slot, .. } => (*target, lane.idx(), *slot),
            Pending::Group {
                target,
                lane_idx,
                slot,
                ..
            } => (*target, *lane_idx, *slot),
        };
        let conn = self.cn.get_conn(target, lane_idx);
        self.poll_once(conn, slot)
    }

    pub(crate) fn finish_single_read<T: Copy>(&mut self, op: Pending) -> T {
        let Pending::Single { slot, buf, .. } = op else {
            panic!("mismatched pending operation");
        };
        let buf = buf.expect("read completed without a staging chunk");
        let val = unsafe { ptr::read(buf as *const T) };
        self.metrics.read.ops += 1;
        self.metrics.read.bytes += size_of::<T>() as u64;
        self.staging.release(buf);
        self.op_ring.release(slot);
        val
    }

    pub(crate) fn finish_single_write(&mut self, op: Pending) {
        let Pending::Single { slot, buf, .. } = op else {
            panic!("mismatched pending operation");
        };
        self.metrics.write.ops += 1;
        if let Some(buf) = buf {
            self.staging.release(buf);
        }
        self.op_ring.release(slot);
    }

    // ---- sequenced groups --------------------------------------------

    /// Queue a read into the current sequenced group. With `signal` the
    /// whole group is posted as one chain and the reads' values come back
    /// in queue order.
    ///
    /// Every pointer queued into one group must target the same segment,
    /// and a group mixes element types at its own peril: results are
    /// reinterpreted as the signaling call's `T`.
    pub fn read_seq<T: Copy>(&mut self, ptr: RemotePtr<T>, signal: bool, fence: bool) -> Option<Vec<T>> {
        let _ = fence;
        let gidx = self.append_read::<T>(ptr);
        if !signal {
            return None;
        }
        let (target, lane_idx, tail) = self.post_group(gidx);
        {
            let conn = self.cn.get_conn(target, lane_idx);
            self.spin(conn, tail);
        }
        Some(self.finish_group::<T>(gidx))
    }

    /// Zero-copy sequenced read; the value lands in `dst` and is excluded
    /// from the group's result vector.
    pub fn read_seq_into<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        dst: *mut T,
        signal: bool,
        fence: bool,
        size: usize,
    ) -> Option<Vec<T>> {
        let _ = fence;
        let gidx = self.append_op(ptr.raw(), SeqKind::ReadInto { dst: dst as usize }, size);
        if !signal {
            return None;
        }
        let (target, lane_idx, tail) = self.post_group(gidx);
        {
            let conn = self.cn.get_conn(target, lane_idx);
            self.spin(conn, tail);
        }
        Some(self.finish_group::<T>(gidx))
    }

    /// Queue a write into the current sequenced group. Writes to local
    /// memory are stored directly and never join a group.
    pub fn write_seq<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        val: T,
        signal: bool,
        fence: bool,
    ) -> Option<Vec<T>> {
        if ptr.is_local(self.node_id) {
            self.write_local(ptr.address(), &val as *const T as *const u8, size_of::<T>(), fence);
            return None;
        }
        let gidx = self.append_write(ptr, val);
        if !signal {
            return None;
        }
        let (target, lane_idx, tail) = self.post_group(gidx);
        {
            let conn = self.cn.get_conn(target, lane_idx);
            self.spin(conn, tail);
        }
        Some(self.finish_group::<T>(gidx))
    }

    /// Zero-copy sequenced write out of `src`.
    pub fn write_seq_from<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        src: *const T,
        signal: bool,
        fence: bool,
        size: usize,
    ) -> Option<Vec<T>> {
        if ptr.is_local(self.node_id) {
            self.write_local(ptr.address(), src as *const u8, size, fence);
            return None;
        }
        let gidx = self.append_op(ptr.raw(), SeqKind::WriteFrom { src: src as usize }, size);
        if !signal {
            return None;
        }
        let (target, lane_idx, tail) = self.post_group(gidx);
        {
            let conn = self.cn.get_conn(target, lane_idx);
            self.spin(conn, tail);
        }
        Some(self.finish_group::<T>(gidx))
    }

    /// Async flavor of [`Self::read_seq`]: `None` until a signaling call,
    /// which returns a future for the whole group's results.
    pub fn read_seq_async<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        signal: bool,
        fence: bool,
    ) -> Option<AsyncOp<Vec<T>>> {
        let _ = fence;
        let gidx = self.append_read::<T>(ptr);
        if !signal {
            return None;
        }
        let (target, lane_idx, tail) = self.post_group(gidx);
        Some(AsyncOp::pending(
            Pending::Group {
                target,
                lane_idx,
                group: gidx,
                slot: tail,
            },
            Self::finish_group_pending::<T>,
        ))
    }

    /// Async flavor of [`Self::read_seq_into`].
    pub fn read_seq_into_async<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        dst: *mut T,
        signal: bool,
        fence: bool,
        size: usize,
    ) -> Option<AsyncOp<Vec<T>>> {
        let _ = fence;
        let gidx = self.append_op(ptr.raw(), SeqKind::ReadInto { dst: dst as usize }, size);
        if !signal {
            return None;
        }
        let (target, lane_idx, tail) = self.post_group(gidx);
        Some(AsyncOp::pending(
            Pending::Group {
                target,
                lane_idx,
                group: gidx,
                slot: tail,
            },
            Self::finish_group_pending::<T>,
        ))
    }

    /// Async flavor of [`Self::write_seq_from`].
    pub fn write_seq_from_async<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        src: *const T,
        signal: bool,
        fence: bool,
        size: usize,
    ) -> Option<AsyncOp<Vec<T>>> {
        if ptr.is_local(self.node_id) {
            self.write_local(ptr.address(), src as *const u8, size, fence);
            return None;
        }
        let gidx = self.append_op(ptr.raw(), SeqKind::WriteFrom { src: src as usize }, size);
        if !signal {
            return None;
        }
        let (target, lane_idx, tail) = self.post_group(gidx);
        Some(AsyncOp::pending(
            Pending::Group {
                target,
                lane_idx,
                group: gidx,
                slot: tail,
            },
            Self::finish_group_pending::<T>,
        ))
    }

    /// Async flavor of [`Self::write_seq`].
    pub fn write_seq_async<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        val: T,
        signal: bool,
        fence: bool,
    ) -> Option<AsyncOp<Vec<T>>> {
        if ptr.is_local(self.node_id) {
            self.write_local(ptr.address(), &val as *const T as *const u8, size_of::<T>(), fence);
            return None;
        }
        let gidx = self.append_write(ptr, val);
        if !signal {
            return None;
        }
        let (target, lane_idx, tail) = self.post_group(gidx);
        Some(AsyncOp::pending(
            Pending::Group {
                target,
                lane_idx,
                group: gidx,
                slot: tail,
            },
            Self::finish_group_pending::<T>,
        ))
    }

    /// Find the group new work should join: the most recent unposted one
    /// while it has capacity, else a fresh slot.
    fn current_group(&mut self, raw: u64) -> usize {
        let n = self.cfg.cn_ops_per_thread;
        if !self.groups[CORO].is_empty() {
            let last = (self.seq_rings[CORO].end() + n - 1) % n;
            if let Some(g) = self.groups[CORO].get(&last) {
                if !g.posted && g.ops.len() < self.cfg.cn_wrs_per_seq {
                    return last;
                }
            }
        }
        assert!(
            self.groups[CORO].len() < n,
            "too many live sequenced groups"
        );
        let idx = self.seq_rings[CORO]
            .acquire()
            .expect("no sequenced-group slot available");
        let lane = Lane::new(self.cn.clone(), self.sched.lane((raw >> ADDR_BITS) as u16));
        self.groups[CORO].insert(
            idx,
            SeqGroup {
                seq_slot: idx,
                lane,
                target: raw,
                ops: Vec::new(),
                posted: false,
            },
        );
        idx
    }

    fn append_op(&mut self, raw: u64, kind: SeqKind, len: usize) -> usize {
        let gidx = self.current_group(raw);
        let slot = self.acquire_slot();
        self.groups[CORO]
            .get_mut(&gidx)
            .unwrap()
            .ops
            .push(SeqOp { kind, len, raw, slot });
        gidx
    }

    fn append_read<T: Copy>(&mut self, ptr: RemotePtr<T>) -> usize {
        let size = size_of::<T>();
        let gidx = self.current_group(ptr.raw());
        let buf = self.acquire_staging(size, align_of::<T>());
        let slot = self.acquire_slot();
        self.groups[CORO].get_mut(&gidx).unwrap().ops.push(SeqOp {
            kind: SeqKind::Read { buf },
            len: size,
            raw: ptr.raw(),
            slot,
        });
        gidx
    }

    fn append_write<T: Copy>(&mut self, ptr: RemotePtr<T>, val: T) -> usize {
        let size = size_of::<T>();
        let gidx = self.current_group(ptr.raw());
        let buf = self.acquire_staging(size, align_of::<T>());
        unsafe { ptr::write(buf as *mut T, val) };
        let slot = self.acquire_slot();
        self.groups[CORO].get_mut(&gidx).unwrap().ops.push(SeqOp {
            kind: SeqKind::Write { buf },
            len: size,
            raw: ptr.raw(),
            slot,
        });
        gidx
    }

    /// Post a group's ops back-to-back on its lane with only the tail
    /// signaled. In-order execution on the lane makes waiting on the tail
    /// equivalent to waiting on the whole chain.
    fn post_group(&mut self, gidx: usize) -> (u64, u32, usize) {
        let (target, lane_idx, posts) = {
            let g = self.groups[CORO].get_mut(&gidx).expect("posting an unknown group");
            assert!(!g.ops.is_empty(), "posting an empty sequenced group");
            g.posted = true;
            (g.target, g.lane.idx(), g.ops.clone())
        };
        let tail = posts.last().unwrap().slot;
        self.arm(tail);
        let conn = self.cn.get_conn(target, lane_idx);
        for (i, op) in posts.iter().enumerate() {
            let is_tail = i + 1 == posts.len();
            let wr_id = if is_tail { self.wr_id(tail) } else { 0 };
            let addr = match op.kind {
                SeqKind::Read { buf } | SeqKind::Write { buf } => buf,
                SeqKind::ReadInto { dst } => dst,
                SeqKind::WriteFrom { src } => src,
            };
            let local = self.registered_slice(addr, op.len);
            let remote = self.remote_of(op.raw, op.len);
            if op.kind.is_write() {
                conn.post_write(local, &remote, wr_id, is_tail);
            } else {
                conn.post_read(local, &remote, wr_id, is_tail);
            }
        }
        (target, lane_idx, tail)
    }

    /// Gather a finished group's read results and give everything back.
    fn finish_group<T: Copy>(&mut self, gidx: usize) -> Vec<T> {
        let g = self.groups[CORO].remove(&gidx).expect("finishing an unknown group");
        let mut out = Vec::new();
        for op in &g.ops {
            if let SeqKind::Read { buf } = op.kind {
                out.push(unsafe { ptr::read(buf as *const T) });
            }
            if op.kind.is_write() {
                self.metrics.write.ops += 1;
                self.metrics.write.bytes += op.len as u64;
            } else {
                self.metrics.read.ops += 1;
                self.metrics.read.bytes += op.len as u64;
            }
        }
        for op in &g.ops {
            if let Some(buf) = op.kind.staging() {
                self.staging.release(buf);
            }
            self.op_ring.release(op.slot);
        }
        self.seq_rings[CORO].release(g.seq_slot);
        out
    }

    pub(crate) fn finish_group_pending<T: Copy>(&mut self, op: Pending) -> Vec<T> {
        let Pending::Group { group, .. } = op else {
            panic!("mismatched pending operation");
        };
        self.finish_group::<T>(group)
    }

    // ---- cluster primitives ------------------------------------------

    fn control_word(&self, mn_index: u16, offset: usize) -> RemotePtr<u64> {
        RemotePtr::from_raw(self.cn.get_seg_start(mn_index, 0) + offset as u64)
    }

    /// Arrive at the sense-reversing barrier in segment 0 of memory node 0
    /// and return once every one of `total_threads` arrivals of this wave
    /// has been observed.
    ///
    /// The barrier word is only ever touched through the RNIC, so the
    /// arrival count and the sense bit stay coherent across nodes.
    pub fn arrive_control_barrier(&mut self, total_threads: u64) {
        let barrier = self.control_word(0, offset_of!(ControlBlock, barrier));
        // Arrive by +2; the low bit is the sense of the current wave.
        let was: u64 = self.fetch_and_add(barrier, 2, true);
        let new_sense = 1 - (was & 1);
        if was >> 1 == total_threads - 1 {
            // Last arrival: reset the count and flip the sense.
            self.write_opts(barrier, new_sense, true, 8, false);
        } else {
            while self.read::<u64>(barrier, true) & 1 != new_sense {}
        }
    }

    /// Publish the cluster root pointer (segment 0 of memory node 0).
    pub fn set_root<T>(&mut self, root: RemotePtr<T>) {
        let word = self.control_word(0, offset_of!(ControlBlock, root));
        self.write_opts(word, root.raw(), true, 8, false);
    }

    pub fn get_root<T>(&mut self) -> RemotePtr<T> {
        let word = self.control_word(0, offset_of!(ControlBlock, root));
        RemotePtr::from_raw(self.read::<u64>(word, true))
    }

    /// Swap the root if it still equals `old`, returning the observed root.
    pub fn cas_root<T>(&mut self, old: RemotePtr<T>, new: RemotePtr<T>) -> RemotePtr<T> {
        let word = self.control_word(0, offset_of!(ControlBlock, root));
        RemotePtr::from_raw(self.compare_and_swap(word, old.raw(), new.raw(), true))
    }

    pub fn faa_root(&mut self, add: u64) -> u64 {
        let word = self.control_word(0, offset_of!(ControlBlock, root));
        self.fetch_and_add(word, add, true)
    }

    // ---- distributed allocation --------------------------------------

    /// Allocate `n` objects of type `T` somewhere in the cluster, per the
    /// placement policy. The free lists are consulted first.
    pub fn allocate<T>(&mut self, n: u64) -> RemotePtr<T> {
        let size = self.alloc.compute_size(size_of::<T>() as u64 * n);
        if let Some(raw) = self.alloc.try_allocate_local(size) {
            return RemotePtr::from_raw(raw);
        }
        RemotePtr::from_raw(self.bump_global(size))
    }

    /// Claim `size` bytes from some segment's bump counter with a remote
    /// fetch-and-add.
    ///
    /// A fetch-and-add that lands beyond the segment is never rolled back;
    /// the bytes leak and the local hint is raised so the segment is
    /// skipped from then on. Cycling twice through the policy's segments
    /// without an admissible candidate is fatal.
    fn bump_global(&mut self, size: u64) -> u64 {
        let seg_bytes = self.cfg.seg_bytes();
        let give_up = 2 * self.alloc.policy.total_segs();
        let mut fruitless = 0u64;
        loop {
            assert!(
                fruitless < give_up,
                "out of memory: no segment can hold {size} bytes"
            );
            let (mn, seg) = self.alloc.policy.pick();
            let base = self.cn.get_seg_start(mn, seg);
            if self.cn.get_alloc_hint(mn, seg).load(Ordering::Relaxed) + size > seg_bytes {
                fruitless += 1;
                continue;
            }
            let bump =
                RemotePtr::<u64>::from_raw(base + offset_of!(ControlBlock, allocated) as u64);
            let offset = self.fetch_and_add(bump, size, true);
            raise_hint(self.cn.get_alloc_hint(mn, seg), offset + size);
            if offset + size > seg_bytes {
                fruitless += 1;
                continue;
            }
            let block = base + offset;
            // Fresh block: record its size and zero the reserved word.
            self.write(RemotePtr::<u64>::from_raw(block), size, true);
            self.write(RemotePtr::<u64>::from_raw(block + 8), 0u64, true);
            return block + HEADER_SIZE;
        }
    }

    /// Return a block to this thread's free lists. The block's size is
    /// fetched from its header with a remote read.
    pub fn deallocate<T>(&mut self, ptr: RemotePtr<T>) {
        let header = RemotePtr::<u64>::from_raw(ptr.raw() - HEADER_SIZE);
        let size = self.read::<u64>(header, true);
        self.alloc.reclaim(ptr.raw(), size);
    }

    /// Allocate and hand back the block's local address. Touching the
    /// result requires the placement policy to have chosen this node.
    pub fn alloc_raw<T>(&mut self, n: u64) -> *mut T {
        let ptr = self.allocate::<T>(n);
        assert!(!ptr.is_null(), "allocation returned null");
        ptr.as_local()
    }

    pub fn dealloc_raw<T>(&mut self, raw: *mut T) {
        assert!(!raw.is_null(), "deallocation of null");
        self.deallocate(RemotePtr::<T>::from_raw(raw as u64));
    }

    /// Placeholder for epoch-based reclamation of unlinked nodes.
    pub fn reclaim<T>(&mut self, ptr: RemotePtr<T>) {
        assert!(!ptr.is_null(), "reclamation of null");
    }

    // ---- thread-local cached buffers ---------------------------------

    /// Carve `n` objects worth of bytes out of the cached half of this
    /// thread's slice. The memory is registered, so it can serve as the
    /// local side of zero-copy operations.
    pub fn local_allocate<T>(&mut self, n: usize) -> *mut T {
        let bytes = size_of::<T>() * n;
        let addr = self
            .cached
            .acquire(bytes, align_of::<T>())
            .expect("cached buffer exhausted");
        addr as *mut T
    }

    pub fn local_deallocate<T>(&mut self, buf: *mut T) {
        self.cached.release(buf as usize);
    }

    /// Drop every cached buffer at once.
    pub fn reset_cache_slice(&mut self) {
        self.cached.release_all();
    }

    // ---- shutdown ----------------------------------------------------

    /// True when every ring of this thread is drained and no sequenced
    /// group is live.
    ///
    /// Lane in-flight counters are node-global and shared with concurrently
    /// running threads; their quiescence is a whole-node property checked
    /// through [`ComputeNode::lanes_idle`] once every thread has dropped.
    pub fn no_leak_detected(&self) -> bool {
        let mut clean = true;
        if !self.op_ring.is_empty() {
            warn!(tid = self.tid, "completion-slot ring is not drained");
            clean = false;
        }
        if !self.seq_rings[CORO].is_empty() || !self.groups[CORO].is_empty() {
            warn!(tid = self.tid, "sequenced groups are still live");
            clean = false;
        }
        if !self.staging.is_empty() {
            warn!(tid = self.tid, "staging chunks are still outstanding");
            clean = false;
        }
        if !self.cached.is_empty() {
            warn!(tid = self.tid, "cached buffers are still outstanding");
            clean = false;
        }
        clean
    }
}

impl Drop for ComputeThread {
    fn drop(&mut self) {
        // Tell every memory node this thread is done; their shutdown gate
        // waits for the cluster-wide count.
        for mn in 0..self.cfg.num_mns() {
            let flag = self.control_word(mn as u16, offset_of!(ControlBlock, control_flag));
            self.fetch_and_add(flag, 1, true);
        }
        assert!(self.no_leak_detected(), "resource leak at compute-thread shutdown");
        info!(tid = self.tid, "compute thread shutdown");
    }
}

/// Best-effort monotonic raise of a segment's allocation hint.
fn raise_hint(hint: &std::sync::atomic::AtomicU64, to: u64) {
    let mut cur = hint.load(Ordering::Relaxed);
    while cur < to {
        match hint.compare_exchange(cur, to, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => break,
            Err(seen) => cur = seen,
        }
    }
}

/// A value's bytes in the low end of an 8-byte atomic operand.
fn to_word<T: Copy>(val: T) -> u64 {
    let mut word = 0u64;
    unsafe {
        ptr::copy_nonoverlapping(
            &val as *const T as *const u8,
            &mut word as *mut u64 as *mut u8,
            size_of::<T>(),
        );
    }
    word
}

fn from_word<T: Copy>(word: u64) -> T {
    unsafe { ptr::read_unaligned(&word as *const u64 as *const T) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn atomic_operands_round_trip_through_words() {
        assert_eq!(to_word(42u64), 42);
        assert_eq!(to_word(true), 1);
        assert_eq!(to_word(0xabcdu16), 0xabcd);
        assert_eq!(from_word::<u64>(7), 7);
        assert!(from_word::<bool>(to_word(true)));
        assert_eq!(from_word::<u32>(to_word(0xdead_beefu32)), 0xdead_beef);
    }

    #[test]
    fn hints_only_move_up() {
        let hint = AtomicU64::new(64);
        raise_hint(&hint, 32);
        assert_eq!(hint.load(Ordering::Relaxed), 64);
        raise_hint(&hint, 4096);
        assert_eq!(hint.load(Ordering::Relaxed), 4096);
        raise_hint(&hint, 100);
        assert_eq!(hint.load(Ordering::Relaxed), 4096);
    }
}
