//! End-to-end smoke test for the runtime.
//!
//! Run one process per node with identical options except `--node-id`.
//! Every compute thread allocates, reads, writes, contends a CAS, and
//! drives sequenced batches against the distributed heap, then the whole
//! cluster shuts down gracefully.

use std::sync::Arc;
use std::thread;

use clap::Parser;
use core_affinity::CoreId;
use rmem::{ClusterConfig, ComputeNode, ComputeThread, MemoryNode, PeerInfo, Rnic};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[clap(flatten)]
    cluster: ClusterConfig,

    /// Peer hostnames, one per node id in order. Defaults to localhost for
    /// single-machine runs.
    #[clap(long = "peer")]
    peers: Vec<String>,
}

/// Words in the shared array the leader publishes through the root.
const CELLS: u64 = 64;
const MAGIC: u64 = 42;

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let cfg = args.cluster;

    let peers: Vec<PeerInfo> = if args.peers.is_empty() {
        (0..=cfg.last_mn_id.max(cfg.last_cn_id))
            .map(|id| PeerInfo::new(id, "localhost"))
            .collect()
    } else {
        args.peers
            .iter()
            .enumerate()
            .map(|(id, addr)| PeerInfo::new(id as u16, addr.clone()))
            .collect()
    };

    let rnic = Rnic::open(&cfg.dev);

    // The memory role must come up first: a co-located compute node takes
    // the local region keys over the loopback path.
    let mut memory_node = cfg.is_mn(cfg.node_id).then(|| MemoryNode::new(&rnic, &cfg));

    let compute_node = cfg.is_cn(cfg.node_id).then(|| {
        let mut cn = ComputeNode::new(&rnic, &cfg);
        if let Some(mn) = &memory_node {
            cn.connect_local(&mn.region_info());
        }
        cn.connect_remote(&peers);
        Arc::new(cn)
    });

    if let Some(mn) = &mut memory_node {
        mn.init_done();
    }

    if let Some(cn) = compute_node {
        let total = cfg.total_threads();
        let workers: Vec<_> = (0..cfg.cn_threads)
            .map(|i| {
                let cn = cn.clone();
                let cfg = cfg.clone();
                thread::spawn(move || {
                    core_affinity::set_for_current(CoreId {
                        id: i as usize + 1,
                    });
                    run_worker(cn, &cfg, total);
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker thread panicked");
        }
        assert!(cn.lanes_idle(), "in-flight operations left on a lane");
    }

    // Blocks until every compute thread in the cluster has signaled.
    drop(memory_node);
    println!("hello: all checks passed");
}

fn run_worker(cn: Arc<ComputeNode>, cfg: &ClusterConfig, total_threads: u64) {
    let mut ct = ComputeThread::new(cn);
    let uid = cfg.thread_uid(ct.tid());
    let leader = cfg.node_id == cfg.first_cn_id && ct.tid() == 0;

    if leader {
        // Array layout: [0] magic, [1] CAS target, [2..] one word per thread.
        let array = ct.allocate::<u64>(CELLS + 2 + total_threads);
        for i in 0..CELLS + 2 + total_threads {
            ct.write(array + i, 0u64, true);
        }
        ct.write(array, MAGIC, true);
        assert_eq!(ct.read::<u64>(array, true), MAGIC);
        ct.set_root(array);
    }
    ct.arrive_control_barrier(total_threads);

    let array = ct.get_root::<u64>();
    assert_eq!(ct.read::<u64>(array, true), MAGIC);

    // Exactly one thread in the cluster observes the old value.
    let won = ct.compare_and_swap(array + 1, 0u64, uid + 1, true) == 0;
    ct.arrive_control_barrier(total_threads);
    let winner = ct.read::<u64>(array + 1, true);
    assert!(winner != 0);
    assert!(!won || winner == uid + 1);

    // Every thread writes its own cell, synchronously and asynchronously.
    let mine = array + (2 + uid);
    ct.write(mine, uid, true);
    assert_eq!(ct.read::<u64>(mine, true), uid);
    let pending = ct.write_async(mine, uid + 100, true);
    pending.wait(&mut ct);
    let got = ct.read_async::<u64>(mine, true).wait(&mut ct);
    assert_eq!(got, uid + 100);
    assert!(ct.no_leak_detected());

    // Sequenced batches: 64 reads of the magic word, grouped into chains
    // with one signaled tail each. Each group is drained before the next
    // one opens, so the default ring capacities suffice.
    for group_size in [1u64, 4, 8] {
        let mut seen = 0;
        for _ in 0..CELLS / group_size {
            let mut tail = None;
            for j in 0..group_size {
                let signal = j == group_size - 1;
                tail = ct.read_seq_async::<u64>(array, signal, signal);
            }
            let values = tail.expect("the signaling call yields a future").wait(&mut ct);
            assert!(values.iter().all(|&v| v == MAGIC));
            seen += values.len() as u64;
        }
        assert_eq!(seen, CELLS);
        assert!(ct.no_leak_detected());
    }

    // Zero-copy through the cached half of the thread slice.
    let scratch = ct.local_allocate::<u64>(1);
    unsafe { *scratch = uid + 7 };
    ct.write_from(mine, scratch, true, 8, false);
    unsafe { *scratch = 0 };
    ct.read_into(mine, scratch, true, 8);
    assert_eq!(unsafe { *scratch }, uid + 7);
    ct.local_deallocate(scratch);

    ct.arrive_control_barrier(total_threads);
    if leader {
        for t in 0..total_threads {
            assert_eq!(ct.read::<u64>(array + (2 + t), true), t + 7);
        }
        ct.deallocate(array);
    }
    ct.arrive_control_barrier(total_threads);
    assert!(ct.no_leak_detected());
}
