//! The memory-node role: host segments, accept connections, ship region
//! keys, and hold the process open until every compute thread has signaled
//! shutdown.

use std::io::Read;
use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use rrddmma::prelude::*;
use rrddmma::wrap::RegisteredMem;
use tracing::info;

use crate::cfg::ClusterConfig;
use crate::conn::{self, ConnectHello, ConnectReply, Connection, RegionInfo};
use crate::nic::Rnic;
use crate::segment::Segment;

/// A hosted segment together with its device registration.
struct SegInfo {
    seg: Segment,
    _mr: Mr,
}

/// A machine that provides segments for compute nodes.
///
/// Construction maps and registers every segment, then parks a listener
/// thread on the bootstrap port. Compute nodes connect once per lane; each
/// accepted connection immediately receives the packed region-key vector as
/// its first and only two-sided message. The listener exits once the
/// expected connection count has been reached.
///
/// Dropping the node blocks until segment 0's `control_flag` equals the
/// cluster-wide compute-thread count, which every compute thread bumps by
/// one as it shuts down.
pub struct MemoryNode {
    self_id: u16,
    segs: Vec<SegInfo>,
    regions: Vec<RegionInfo>,
    listener: Option<JoinHandle<Vec<Connection>>>,
    conns: Vec<Connection>,
    total_threads: u64,
}

/// Connections a memory node expects: one per lane from every compute node,
/// except the co-located one, whose lanes are loopback QPs that never touch
/// the listener.
pub(crate) fn expected_connections(cfg: &ClusterConfig) -> u64 {
    let mut cns = cfg.num_cns();
    if cfg.is_cn(cfg.node_id) {
        cns -= 1;
    }
    cns * cfg.qp_lanes as u64
}

impl MemoryNode {
    pub fn new(rnic: &Rnic, cfg: &ClusterConfig) -> Self {
        let self_id = cfg.node_id;
        info!(
            node = self_id,
            segs = cfg.segs_per_mn,
            seg_size = cfg.seg_size,
            "configuring memory node"
        );

        let mut segs = Vec::new();
        let mut regions = Vec::new();
        for _ in 0..cfg.segs_per_mn {
            let seg = Segment::new(cfg.seg_bytes());
            seg.init_control();
            let mr = seg.register(rnic.pd());
            let remote = MrRemote::from(mr.as_slice());
            regions.push(RegionInfo {
                raddr: remote.addr,
                rkey: remote.rkey,
                pad: 0,
            });
            segs.push(SegInfo { seg, _mr: mr });
        }
        for r in &regions {
            info!("  shared segment 0x{:x} (rkey=0x{:x})", r.raddr, r.rkey);
        }

        let expected = expected_connections(cfg);
        let pd = rnic.pd().clone();
        let port = rnic.port().clone();
        let mn_port = cfg.mn_port;
        let listen_regions = regions.clone();
        let listener =
            thread::spawn(move || listen(pd, port, self_id, mn_port, expected, listen_regions));

        Self {
            self_id,
            segs,
            regions,
            listener: Some(listener),
            conns: Vec::new(),
            total_threads: cfg.total_threads(),
        }
    }

    /// The local `(base, rkey)` vector, for a co-located compute node whose
    /// loopback connections cannot fetch it over send/recv.
    pub fn region_info(&self) -> Vec<RegionInfo> {
        self.regions.clone()
    }

    /// Block until the listener has accepted every expected connection, and
    /// join it. Segments stay alive until the node is dropped.
    pub fn init_done(&mut self) {
        if let Some(handle) = self.listener.take() {
            self.conns = handle.join().expect("listener thread panicked");
            info!(node = self.self_id, "listener finished");
        }
    }
}

impl Drop for MemoryNode {
    fn drop(&mut self) {
        self.init_done();
        let cb = self.segs[0].seg.control();
        while cb.control_flag.load(Ordering::Acquire) != self.total_threads {
            thread::yield_now();
        }
        info!(
            node = self.self_id,
            conns = self.conns.len(),
            "memory node shutdown"
        );
    }
}

/// The listener loop: accept bootstrap streams until the expected count is
/// reached, answering each with a connected QP and the region-key vector.
fn listen(
    pd: Pd,
    port: Port,
    self_id: u16,
    mn_port: u16,
    expected: u64,
    regions: Vec<RegionInfo>,
) -> Vec<Connection> {
    let listener =
        TcpListener::bind(("0.0.0.0", mn_port)).expect("cannot bind bootstrap listener");
    info!(node = self_id, port = mn_port, expected, "memory node listening");

    let mut send_mem =
        RegisteredMem::new(&pd, 4096).expect("cannot register bootstrap send buffer");
    let payload_len = conn::pack_region_info(&regions, send_mem.as_mut());

    let mut conns = Vec::new();
    for _ in 0..expected {
        let (mut stream, peer_addr) = listener.accept().expect("cannot accept connection");
        let hello: ConnectHello = conn::read_frame(&mut stream);
        if hello.node_id == self_id {
            panic!("connect request from self (node {})", self_id);
        }
        info!(
            node = self_id,
            from = hello.node_id,
            lane = hello.lane,
            %peer_addr,
            "accepting connection"
        );

        let mut qp = conn::make_rc_qp(&pd, &port);
        qp.bind_peer(hello.ep).expect("cannot bind peer");
        let reply = ConnectReply {
            ep: qp.endpoint().expect("cannot get QP endpoint"),
        };
        conn::write_frame(&mut stream, &reply);

        // The peer acks once its QP can receive; only then is the region
        // vector sent as the first message on the new QP.
        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack).expect("cannot read ready ack");

        let connection = Connection::new(qp, hello.node_id, false);
        connection.send_bytes(
            send_mem
                .slice(0, payload_len)
                .expect("bootstrap send slice out of range"),
        );
        conns.push(connection);
    }
    conns
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cfg(node_id: &str) -> ClusterConfig {
        ClusterConfig::parse_from([
            "test",
            "--node-id",
            node_id,
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
            "--qp-lanes",
            "3",
        ])
    }

    #[test]
    fn colocated_nodes_expect_one_fewer_peer() {
        // Node 0 is both roles: 2 of the 3 compute nodes connect remotely.
        assert_eq!(expected_connections(&cfg("0")), 6);
    }

    #[test]
    fn pure_memory_nodes_expect_every_compute_node() {
        let mut c = cfg("0");
        c.first_cn_id = 1;
        assert_eq!(expected_connections(&c), 6);
        c.first_cn_id = 0;
        c.node_id = 5;
        assert_eq!(expected_connections(&c), 9);
    }
}
