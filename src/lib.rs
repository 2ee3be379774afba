//! A distributed shared-memory runtime over one-sided RDMA verbs.
//!
//! Processes expose pinned local RAM as remotely accessible segments
//! ([`MemoryNode`]) and issue reads, writes, and atomics against any
//! segment in the cluster without involving the owning CPU
//! ([`ComputeNode`], [`ComputeThread`]). On top of the substrate sit a fat
//! pointer ([`RemotePtr`]), a distributed bump allocator, lane and
//! placement policies, sequenced operation batching, manually driven
//! futures ([`AsyncOp`]), and a cluster-wide sense-reversing barrier and
//! root pointer.
//!
//! A process that plays both roles must construct its [`MemoryNode`] before
//! its [`ComputeNode`]: loopback connections need the local region keys up
//! front.

pub mod alloc;
pub mod atomic;
pub mod async_op;
pub mod cfg;
pub mod compute_node;
pub mod compute_thread;
pub mod conn;
pub mod mem_node;
pub mod nic;
pub mod ptr;
pub mod ring;
pub mod sched;
pub mod segment;

pub use atomic::Atomic;
pub use async_op::AsyncOp;
pub use cfg::{AllocKind, ClusterConfig, PeerInfo, QpSchedKind};
pub use compute_node::ComputeNode;
pub use compute_thread::{ComputeThread, OpMetrics, OpStats};
pub use conn::{Connection, RecvError, RegionInfo};
pub use mem_node::MemoryNode;
pub use nic::Rnic;
pub use ptr::RemotePtr;
pub use segment::{ControlBlock, Segment};
