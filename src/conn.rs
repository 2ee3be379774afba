//! Queue-pair connections and the bootstrap handshake.
//!
//! A `Connection` owns one reliable-connection QP. Establishing one between
//! two processes goes through a short TCP exchange: the compute side sends a
//! [`ConnectHello`] carrying its node id and QP endpoint, the memory side
//! binds a fresh QP to it and answers with a [`ConnectReply`]. The only
//! two-sided RDMA traffic ever issued is the memory node's region-key vector,
//! sent once on each new QP; everything after that is one-sided.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use rrddmma::prelude::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

/// Largest handshake frame we are willing to exchange.
const MAX_FRAME: usize = 4096;

/// Connect-time backoff bounds while a memory node is not reachable yet.
const CONNECT_BACKOFF_MIN_US: u64 = 100;
const CONNECT_BACKOFF_MAX_US: u64 = 5_000_000;

/// First frame on a bootstrap stream, compute side to memory side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectHello {
    /// The connecting node's id. A memory node refuses its own id here.
    pub node_id: u16,
    /// Which of the `qp_lanes` connections this one is.
    pub lane: u32,
    pub ep: QpEndpoint,
}

/// Second frame, memory side back to compute side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectReply {
    pub ep: QpEndpoint,
}

/// One record of the region-key vector a memory node ships after accepting
/// a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RegionInfo {
    pub raddr: u64,
    pub rkey: u32,
    pub pad: u32,
}

pub(crate) const REGION_INFO_BYTES: usize = std::mem::size_of::<RegionInfo>();

/// Pack region records into `out`, returning the byte length. The receiver
/// recovers the count from the length alone; there is no framing.
pub(crate) fn pack_region_info(records: &[RegionInfo], out: &mut [u8]) -> usize {
    let len = records.len() * REGION_INFO_BYTES;
    assert!(len <= out.len(), "region-info vector exceeds the send buffer");
    for (i, r) in records.iter().enumerate() {
        let at = i * REGION_INFO_BYTES;
        out[at..at + 8].copy_from_slice(&r.raddr.to_le_bytes());
        out[at + 8..at + 12].copy_from_slice(&r.rkey.to_le_bytes());
        out[at + 12..at + 16].copy_from_slice(&r.pad.to_le_bytes());
    }
    len
}

pub(crate) fn unpack_region_info(bytes: &[u8]) -> Vec<RegionInfo> {
    assert!(
        bytes.len() % REGION_INFO_BYTES == 0,
        "region-info payload of {} bytes is not record-aligned",
        bytes.len()
    );
    bytes
        .chunks_exact(REGION_INFO_BYTES)
        .map(|c| RegionInfo {
            raddr: u64::from_le_bytes(c[0..8].try_into().unwrap()),
            rkey: u32::from_le_bytes(c[8..12].try_into().unwrap()),
            pad: u32::from_le_bytes(c[12..16].try_into().unwrap()),
        })
        .collect()
}

/// The receive path's retryable outcomes.
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    /// Nothing has completed yet; the caller may retry.
    #[error("no receive completion available yet")]
    Unavailable,
    /// The QP flushed or the completion failed.
    #[error("receive aborted: {status}")]
    Aborted { status: String },
}

/// One reliable-connection queue pair to a peer (possibly this process).
pub struct Connection {
    qp: Qp,
    peer_id: u16,
    loopback: bool,
}

// libibverbs guarantees thread safety of posting and polling; compute
// threads share lanes under that contract.
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl Connection {
    pub fn new(qp: Qp, peer_id: u16, loopback: bool) -> Self {
        Self {
            qp,
            peer_id,
            loopback,
        }
    }

    pub fn peer_id(&self) -> u16 {
        self.peer_id
    }

    /// Loopback connections skip any disconnect handshake on teardown; the
    /// QP is simply destroyed with the connection.
    pub fn is_loopback(&self) -> bool {
        self.loopback
    }

    pub fn post_read(&self, local: MrSlice, remote: &MrRemote, wr_id: u64, signal: bool) {
        self.qp
            .read(&[local], remote, wr_id, signal)
            .expect("cannot post one-sided read");
    }

    pub fn post_write(&self, local: MrSlice, remote: &MrRemote, wr_id: u64, signal: bool) {
        self.qp
            .write(&[local], remote, wr_id, None, signal)
            .expect("cannot post one-sided write");
    }

    pub fn post_cas(
        &self,
        local: MrSlice,
        remote: MrRemote,
        compare: u64,
        swap: u64,
        wr_id: u64,
        signal: bool,
    ) {
        self.qp
            .compare_swap(local, remote, compare, swap, wr_id, signal)
            .expect("cannot post compare-and-swap");
    }

    pub fn post_faa(&self, local: MrSlice, remote: MrRemote, add: u64, wr_id: u64, signal: bool) {
        self.qp
            .fetch_add(local, remote, add, wr_id, signal)
            .expect("cannot post fetch-and-add");
    }

    /// Drain up to `wcs.len()` send completions without blocking.
    pub fn poll_send(&self, wcs: &mut [Wc]) -> usize {
        self.qp.scq().poll_into(wcs).expect("cannot poll send CQ") as usize
    }

    /// Post a signaled two-sided send of an already-staged slice and wait
    /// for its completion. Only used to ship region keys during bootstrap.
    pub fn send_bytes(&self, slice: MrSlice) {
        self.qp
            .send(&[slice], None, None, 0, true, false)
            .expect("cannot post two-sided send");
        self.qp.scq().poll_one_blocking_consumed();
    }

    pub fn post_recv(&self, slice: MrSlice, wr_id: u64) {
        self.qp.recv(&[slice], wr_id).expect("cannot post receive");
    }

    /// One non-blocking look at the receive CQ. `Ok` carries the received
    /// byte count.
    pub fn try_recv_done(&self) -> Result<usize, RecvError> {
        let mut wcs = [Wc::default()];
        let n = self.qp.rcq().poll_into(&mut wcs).expect("cannot poll recv CQ") as usize;
        if n == 0 {
            return Err(RecvError::Unavailable);
        }
        match wcs[0].status() {
            WcStatus::Success => Ok(wcs[0].byte_len() as usize),
            status => Err(RecvError::Aborted {
                status: format!("{status:?}"),
            }),
        }
    }

    /// Spin until the posted receive completes. Fatal on a flushed QP, which
    /// during bootstrap means the peer died.
    pub fn recv_done_blocking(&self) -> usize {
        loop {
            match self.try_recv_done() {
                Ok(len) => return len,
                Err(RecvError::Unavailable) => std::hint::spin_loop(),
                Err(e) => panic!("bootstrap receive failed: {e}"),
            }
        }
    }
}

/// Build an RC QP on the process PD with its own send and receive CQs.
pub(crate) fn make_rc_qp(pd: &Pd, port: &Port) -> Qp {
    let scq = Cq::new(pd.context(), Cq::DEFAULT_CQ_DEPTH).expect("cannot create send CQ");
    let rcq = Cq::new(pd.context(), Cq::DEFAULT_CQ_DEPTH).expect("cannot create recv CQ");
    let mut qp = Qp::builder()
        .qp_type(QpType::Rc)
        .caps(QpCaps::default())
        .send_cq(&scq)
        .recv_cq(&rcq)
        .sq_sig_all(false)
        .global_routing(false)
        .build(pd)
        .expect("cannot create QP");
    qp.bind_local_port(port, None).expect("cannot bind local port");
    qp
}

/// Create a connection from this process to itself by binding a QP to its
/// own endpoint. No handshake and no region-key message are involved; the
/// co-located memory role hands its keys over directly.
pub(crate) fn connect_loopback(pd: &Pd, port: &Port, self_id: u16) -> Connection {
    let mut qp = make_rc_qp(pd, port);
    let ep = qp.endpoint().expect("cannot get QP endpoint");
    qp.bind_peer(ep).expect("cannot bind QP to itself");
    Connection::new(qp, self_id, true)
}

/// Connect one lane to a remote memory node.
///
/// `recv_slice` must already be posted as the receive for the region-key
/// message; it is registered staging memory owned by the caller. Retries
/// with exponential backoff while the listener is unreachable.
pub(crate) fn connect_remote(
    pd: &Pd,
    port: &Port,
    self_id: u16,
    lane: u32,
    mn_id: u16,
    mn_addr: &str,
    mn_port: u16,
    recv_slice: MrSlice,
) -> Connection {
    let mut backoff_us: u64 = 0;
    let mut stream = loop {
        match TcpStream::connect((mn_addr, mn_port)) {
            Ok(s) => break s,
            Err(e) => {
                backoff_us = if backoff_us > 0 {
                    ((backoff_us + 100 * self_id as u64) * 2).min(CONNECT_BACKOFF_MAX_US)
                } else {
                    CONNECT_BACKOFF_MIN_US
                };
                debug!(mn_id, backoff_us, "memory node not reachable yet: {e}");
                thread::sleep(Duration::from_micros(backoff_us));
            }
        }
    };

    let mut qp = make_rc_qp(pd, port);
    qp.recv(&[recv_slice], 0).expect("cannot post bootstrap receive");

    let hello = ConnectHello {
        node_id: self_id,
        lane,
        ep: qp.endpoint().expect("cannot get QP endpoint"),
    };
    write_frame(&mut stream, &hello);
    let reply: ConnectReply = read_frame(&mut stream);
    qp.bind_peer(reply.ep).expect("cannot bind QP to memory node");

    // Tell the listener we reached RTR, so its region-key send cannot
    // outrun this QP.
    stream.write_all(&[1u8]).expect("cannot send ready ack");

    Connection::new(qp, mn_id, false)
}

pub(crate) fn write_frame<T: Serialize>(stream: &mut TcpStream, msg: &T) {
    let buf = serde_json::to_vec(msg).expect("cannot serialize handshake frame");
    assert!(buf.len() <= MAX_FRAME, "handshake frame too large: {}", buf.len());
    stream
        .write_all(&(buf.len() as u32).to_le_bytes())
        .expect("cannot send frame length");
    stream.write_all(&buf).expect("cannot send frame");
}

pub(crate) fn read_frame<T: DeserializeOwned>(stream: &mut TcpStream) -> T {
    let mut lenbuf = [0u8; 4];
    stream.read_exact(&mut lenbuf).expect("cannot read frame length");
    let len = u32::from_le_bytes(lenbuf) as usize;
    assert!(len <= MAX_FRAME, "handshake frame too large: {len}");
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).expect("cannot read frame");
    serde_json::from_slice(&buf)
        .unwrap_or_else(|_| panic!("invalid handshake frame: {:?}", String::from_utf8_lossy(&buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_records_are_16_bytes() {
        assert_eq!(REGION_INFO_BYTES, 16);
    }

    #[test]
    fn region_info_round_trips_without_framing() {
        let records = vec![
            RegionInfo {
                raddr: 0x8_0000_0000,
                rkey: 0x1234,
                pad: 0,
            },
            RegionInfo {
                raddr: 0x8_0010_0000,
                rkey: 0x5678,
                pad: 0,
            },
        ];
        let mut buf = [0u8; 64];
        let len = pack_region_info(&records, &mut buf);
        assert_eq!(len, 32);
        // The receiver infers the count from the byte length.
        assert_eq!(unpack_region_info(&buf[..len]), records);
    }

    #[test]
    #[should_panic(expected = "record-aligned")]
    fn truncated_region_payloads_are_rejected() {
        let _ = unpack_region_info(&[0u8; 20]);
    }
}
