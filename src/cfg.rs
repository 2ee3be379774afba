//! Cluster configuration.
//!
//! Every process in a deployment runs with identical options except for
//! `node_id`. Host programs may parse the bag from a command line or build
//! it directly.

use clap::Parser;

/// How a compute thread picks the QP lane for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
pub enum QpSchedKind {
    /// Always lane 0.
    #[strum(serialize = "NONE")]
    None,
    /// Lane `thread_id % qp_lanes`.
    #[strum(serialize = "MOD")]
    Mod,
    /// Thread `t` always uses lane `t`; requires `qp_lanes >= cn_threads`.
    #[strum(serialize = "ONE_TO_ONE")]
    OneToOne,
    /// Per target memory node, a monotonically advancing counter.
    #[strum(serialize = "RR")]
    Rr,
    /// Uniform random per operation.
    #[strum(serialize = "RAND")]
    Rand,
}

/// How a compute thread picks the `(memory node, segment)` to allocate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
pub enum AllocKind {
    /// Always `(0, 0)`.
    #[strum(serialize = "NONE")]
    None,
    /// Pinned by the thread's global uid for its whole lifetime.
    #[strum(serialize = "GLOBAL-MOD")]
    GlobalMod,
    /// Advance the segment on every allocation, carrying into the next node.
    #[strum(serialize = "GLOBAL-RR")]
    GlobalRr,
    /// Always the local node; requires every process to be both roles.
    #[strum(serialize = "LOCAL-MOD")]
    LocalMod,
    /// Rotate segments on the local node; same role requirement.
    #[strum(serialize = "LOCAL-RR")]
    LocalRr,
    /// Uniform random per allocation.
    #[strum(serialize = "RAND")]
    Rand,
}

/// A node-id to address record, supplied by the host program.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: u16,
    pub addr: String,
}

impl PeerInfo {
    pub fn new(id: u16, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

/// The configuration bag recognized by the runtime.
#[derive(Debug, Clone, Parser)]
#[command(about = "Distributed shared-memory runtime options", long_about = None)]
pub struct ClusterConfig {
    /// This process's node id.
    #[clap(long)]
    pub node_id: u16,

    /// First node id that hosts memory segments.
    #[clap(long)]
    pub first_mn_id: u16,

    /// Last node id that hosts memory segments.
    #[clap(long)]
    pub last_mn_id: u16,

    /// First node id that performs computations.
    #[clap(long)]
    pub first_cn_id: u16,

    /// Last node id that performs computations.
    #[clap(long)]
    pub last_cn_id: u16,

    /// Listening port of every memory node.
    #[clap(long, default_value = "31850")]
    pub mn_port: u16,

    /// Each segment holds 2^{seg_size} bytes.
    #[clap(long, default_value = "20")]
    pub seg_size: u32,

    /// Segments hosted per memory node.
    #[clap(long, default_value = "2")]
    pub segs_per_mn: u64,

    /// QP connections per (compute node, memory node) pair.
    #[clap(long, default_value = "2")]
    pub qp_lanes: u32,

    /// Lane selection policy.
    #[clap(long, default_value = "RAND")]
    pub qp_sched_pol: QpSchedKind,

    /// Allocation placement policy.
    #[clap(long, default_value = "GLOBAL-RR")]
    pub alloc_pol: AllocKind,

    /// Compute threads per compute node.
    #[clap(long)]
    pub cn_threads: u64,

    /// Each compute thread's staging slice holds 2^{cn_thread_bufsz} bytes.
    #[clap(long, default_value = "20")]
    pub cn_thread_bufsz: u32,

    /// Outstanding-operation and sequenced-group ring capacity per thread.
    #[clap(long, default_value = "8")]
    pub cn_ops_per_thread: usize,

    /// Maximum work requests per sequenced group.
    #[clap(long, default_value = "16")]
    pub cn_wrs_per_seq: usize,

    /// RDMA device to use.
    #[clap(long, default_value = "mlx5_0")]
    pub dev: String,
}

impl ClusterConfig {
    pub fn num_mns(&self) -> u64 {
        (self.last_mn_id - self.first_mn_id + 1) as u64
    }

    pub fn num_cns(&self) -> u64 {
        (self.last_cn_id - self.first_cn_id + 1) as u64
    }

    pub fn is_mn(&self, id: u16) -> bool {
        id >= self.first_mn_id && id <= self.last_mn_id
    }

    pub fn is_cn(&self, id: u16) -> bool {
        id >= self.first_cn_id && id <= self.last_cn_id
    }

    /// Compute threads across the whole cluster.
    pub fn total_threads(&self) -> u64 {
        self.num_cns() * self.cn_threads
    }

    /// Segments across the whole cluster.
    pub fn total_segs(&self) -> u64 {
        self.num_mns() * self.segs_per_mn
    }

    pub fn seg_bytes(&self) -> u64 {
        1 << self.seg_size
    }

    pub fn thread_buf_bytes(&self) -> usize {
        1 << self.cn_thread_bufsz
    }

    /// The 0-based index of a memory node within the MN id range.
    pub fn mn_index(&self, node_id: u16) -> u16 {
        debug_assert!(self.is_mn(node_id));
        node_id - self.first_mn_id
    }

    /// The node id of the memory node at a 0-based index.
    pub fn mn_id(&self, mn_index: u16) -> u16 {
        self.first_mn_id + mn_index
    }

    /// A cluster-unique 0-based id for a compute thread.
    pub fn thread_uid(&self, tid: u64) -> u64 {
        (self.node_id - self.first_cn_id) as u64 * self.cn_threads + tid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn parse(extra: &[&str]) -> ClusterConfig {
        let mut argv = vec![
            "test",
            "--node-id",
            "1",
            "--first-mn-id",
            "0",
            "--last-mn-id",
            "1",
            "--first-cn-id",
            "0",
            "--last-cn-id",
            "2",
            "--cn-threads",
            "4",
        ];
        argv.extend_from_slice(extra);
        ClusterConfig::parse_from(argv)
    }

    #[test]
    fn defaults_and_derived_quantities() {
        let cfg = parse(&[]);
        assert_eq!(cfg.mn_port, 31850);
        assert_eq!(cfg.seg_bytes(), 1 << 20);
        assert_eq!(cfg.num_mns(), 2);
        assert_eq!(cfg.num_cns(), 3);
        assert_eq!(cfg.total_threads(), 12);
        assert_eq!(cfg.total_segs(), 4);
        assert_eq!(cfg.qp_sched_pol, QpSchedKind::Rand);
        assert_eq!(cfg.alloc_pol, AllocKind::GlobalRr);
    }

    #[test]
    fn policies_parse_from_canonical_spellings() {
        assert_eq!(QpSchedKind::from_str("ONE_TO_ONE").unwrap(), QpSchedKind::OneToOne);
        assert_eq!(QpSchedKind::from_str("RR").unwrap(), QpSchedKind::Rr);
        assert_eq!(AllocKind::from_str("GLOBAL-MOD").unwrap(), AllocKind::GlobalMod);
        assert_eq!(AllocKind::from_str("LOCAL-RR").unwrap(), AllocKind::LocalRr);
        assert!(AllocKind::from_str("global-rr").is_err());

        let cfg = parse(&["--qp-sched-pol", "MOD", "--alloc-pol", "LOCAL-MOD"]);
        assert_eq!(cfg.qp_sched_pol, QpSchedKind::Mod);
        assert_eq!(cfg.alloc_pol, AllocKind::LocalMod);
    }

    #[test]
    fn node_roles_and_indexing() {
        let cfg = parse(&[]);
        assert!(cfg.is_mn(0) && cfg.is_mn(1) && !cfg.is_mn(2));
        assert!(cfg.is_cn(2) && !cfg.is_cn(3));
        assert_eq!(cfg.mn_index(1), 1);
        assert_eq!(cfg.mn_id(1), 1);
        assert_eq!(cfg.thread_uid(3), 7);
    }
}
