//! The compute-node role: connections to every memory node, the region-key
//! map, and the shared staging buffer that compute threads slice up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use rrddmma::prelude::*;
use rrddmma::wrap::RegisteredMem;
use tracing::info;

use crate::cfg::{ClusterConfig, PeerInfo};
use crate::conn::{self, Connection, RegionInfo};
use crate::nic::Rnic;
use crate::ptr::ADDR_BITS;
use crate::segment::ControlBlock;

/// Cap on outstanding work requests per lane; exceeding it is fatal.
pub const MAX_OUTSTANDING_WRS: usize = 1024;

/// Upper bound on the bootstrap region-key message.
const REGION_MSG_MAX: usize = 4096;

/// A segment known to this node: its packed `(node id | base)` start word
/// and the last bump-counter value this node observed, kept so allocation
/// fetch-and-adds usually succeed on the first try.
pub struct SegDesc {
    start: u64,
    hint: AtomicU64,
}

/// Everything a machine needs to run compute threads.
///
/// Bootstrapping connects `qp_lanes` QPs to every memory node (loopback
/// first when co-located) and collects each node's region keys. After
/// bootstrap the maps are read-only; compute threads share the node behind
/// an `Arc`.
pub struct ComputeNode {
    cfg: ClusterConfig,
    self_id: u16,
    pd: Pd,
    port: Port,
    /// One registered buffer for all compute threads; each registered
    /// thread owns a `1 << cn_thread_bufsz` slice of it.
    mem: RegisteredMem,
    conns: HashMap<u16, Vec<Connection>>,
    /// `(node id << 48) | region base` to rkey, written once per region.
    rkeys: HashMap<u64, u32>,
    /// Per memory-node index, the segments it hosts.
    segs: Vec<Vec<SegDesc>>,
    /// In-flight one-sided operations per lane, across all threads.
    lane_ops: Vec<AtomicUsize>,
    threads: AtomicU64,
    seg_mask: u64,
}

// Bootstrap happens before sharing; afterwards every mutable member is
// atomic, and QP post/poll are thread-safe in libibverbs.
unsafe impl Send for ComputeNode {}
unsafe impl Sync for ComputeNode {}

impl ComputeNode {
    pub fn new(rnic: &Rnic, cfg: &ClusterConfig) -> Self {
        info!(node = cfg.node_id, "configuring compute node");
        let buf_bytes =
            (cfg.cn_threads as usize * cfg.thread_buf_bytes()).next_power_of_two();
        let mem = RegisteredMem::new(rnic.pd(), buf_bytes)
            .expect("cannot register the compute-thread staging buffer");
        let segs = (0..cfg.num_mns()).map(|_| Vec::new()).collect();
        let lane_ops = (0..cfg.qp_lanes).map(|_| AtomicUsize::new(0)).collect();
        Self {
            self_id: cfg.node_id,
            pd: rnic.pd().clone(),
            port: rnic.port().clone(),
            mem,
            conns: HashMap::new(),
            rkeys: HashMap::new(),
            segs,
            lane_ops,
            threads: AtomicU64::new(0),
            seg_mask: cfg.seg_bytes() - 1,
            cfg: cfg.clone(),
        }
    }

    /// Create the loopback lanes to a co-located memory node, whose region
    /// keys must be handed over directly.
    pub fn connect_local(&mut self, local_regions: &[RegionInfo]) {
        assert!(
            self.cfg.is_mn(self.self_id),
            "connect_local on a node that hosts no segments"
        );
        for lane in 0..self.cfg.qp_lanes {
            info!(node = self.self_id, lane, "connecting to localhost");
            let c = conn::connect_loopback(&self.pd, &self.port, self.self_id);
            self.conns.entry(self.self_id).or_default().push(c);
        }
        for r in local_regions {
            self.save_region(self.self_id, r);
        }
    }

    /// Connect every lane to every remote memory node and collect their
    /// region keys.
    pub fn connect_remote(&mut self, peers: &[PeerInfo]) {
        for peer in peers {
            if !self.cfg.is_mn(peer.id) || peer.id == self.self_id {
                continue;
            }
            for lane in 0..self.cfg.qp_lanes {
                info!(
                    node = self.self_id,
                    mn = peer.id,
                    lane,
                    addr = %peer.addr,
                    "connecting to remote memory node"
                );
                let recv_slice = self
                    .mem
                    .slice(0, REGION_MSG_MAX)
                    .expect("staging buffer smaller than a bootstrap message");
                let c = conn::connect_remote(
                    &self.pd,
                    &self.port,
                    self.self_id,
                    lane,
                    peer.id,
                    &peer.addr,
                    self.cfg.mn_port,
                    recv_slice,
                );
                let len = c.recv_done_blocking();
                let bytes = unsafe {
                    std::slice::from_raw_parts(self.mem.as_slice().addr() as *const u8, len)
                };
                for r in conn::unpack_region_info(bytes) {
                    self.save_region(peer.id, &r);
                }
                self.conns.entry(peer.id).or_default().push(c);
            }
        }
    }

    /// Record a region's rkey and seed its allocation hint. Later lanes to
    /// the same node report the same regions; only the first sighting
    /// counts.
    fn save_region(&mut self, node_id: u16, r: &RegionInfo) {
        assert!(
            r.raddr >> ADDR_BITS == 0,
            "region base 0x{:x} does not fit the address bits",
            r.raddr
        );
        assert!(
            r.raddr & self.seg_mask == 0,
            "region base 0x{:x} is not segment-aligned",
            r.raddr
        );
        let key = ((node_id as u64) << ADDR_BITS) | r.raddr;
        if self.rkeys.contains_key(&key) {
            return;
        }
        info!(
            "  received segment 0x{:x} from node {} (rkey=0x{:x})",
            r.raddr, node_id, r.rkey
        );
        self.rkeys.insert(key, r.rkey);
        self.segs[self.cfg.mn_index(node_id) as usize].push(SegDesc {
            start: key,
            // Nothing is allocated at bootstrap, so the first bytes past
            // the control block are the best guess.
            hint: AtomicU64::new(std::mem::size_of::<ControlBlock>() as u64),
        });
    }

    /// Hand out a unique 0-based thread id and the byte offset of that
    /// thread's staging slice. Fatal past the configured thread count.
    pub fn register_thread(&self) -> (u64, usize) {
        let tid = self.threads.fetch_add(1, Ordering::AcqRel);
        assert!(
            tid < self.cfg.cn_threads,
            "thread #{tid} registered but only {} are configured",
            self.cfg.cn_threads
        );
        (tid, tid as usize * self.cfg.thread_buf_bytes())
    }

    /// The connection for a pointer's node on the given lane.
    pub fn get_conn(&self, raw: u64, lane: u32) -> &Connection {
        let node = (raw >> ADDR_BITS) as u16;
        &self
            .conns
            .get(&node)
            .unwrap_or_else(|| panic!("no connections to node {node}"))[lane as usize]
    }

    /// The rkey for the segment containing a pointer. Segments are aligned
    /// to their size, so masking the low bits of the raw word yields the
    /// region key.
    pub fn get_rkey(&self, raw: u64) -> u32 {
        let key = raw & !self.seg_mask;
        *self
            .rkeys
            .get(&key)
            .unwrap_or_else(|| panic!("no rkey covers pointer 0x{raw:x}"))
    }

    /// The packed `(node id | base)` start of a segment.
    pub fn get_seg_start(&self, mn_index: u16, seg_index: u64) -> u64 {
        self.segs[mn_index as usize][seg_index as usize].start
    }

    /// The last observed bump-counter value for a segment.
    pub fn get_alloc_hint(&self, mn_index: u16, seg_index: u64) -> &AtomicU64 {
        &self.segs[mn_index as usize][seg_index as usize].hint
    }

    pub(crate) fn lane_acquire(&self, lane: u32) {
        let inflight = self.lane_ops[lane as usize].fetch_add(1, Ordering::AcqRel) + 1;
        assert!(
            inflight < MAX_OUTSTANDING_WRS,
            "lane {lane} has {inflight} in-flight ops, above the device limit"
        );
    }

    pub(crate) fn lane_release(&self, lane: u32) {
        self.lane_ops[lane as usize].fetch_sub(1, Ordering::AcqRel);
    }

    /// True when no operation is in flight on any lane.
    pub fn lanes_idle(&self) -> bool {
        self.lane_ops.iter().all(|c| c.load(Ordering::Acquire) == 0)
    }

    /// Base address of the shared staging buffer.
    pub(crate) fn staging_base(&self) -> usize {
        self.mem.as_slice().addr() as usize
    }

    /// A slice of the shared staging buffer. Fatal out of range.
    pub(crate) fn mem_slice(&self, offset: usize, len: usize) -> MrSlice<'_> {
        self.mem
            .slice(offset, len)
            .unwrap_or_else(|| panic!("staging slice {offset}+{len} out of range"))
    }

    pub fn cfg(&self) -> &ClusterConfig {
        &self.cfg
    }

    pub fn node_id(&self) -> u16 {
        self.self_id
    }
}
