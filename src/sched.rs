//! Per-thread scheduling policies: which QP lane carries an operation, and
//! which segment serves an allocation.

use rand::prelude::*;

use crate::cfg::{AllocKind, ClusterConfig, QpSchedKind};

/// Picks the QP lane to use for an operation against a given node.
pub struct QpSchedPolicy {
    kind: QpSchedKind,
    num_lanes: u32,
    last_lane: u32,
    /// Independent rotation state per target node, indexed by node id.
    per_node: Vec<u32>,
}

impl QpSchedPolicy {
    pub fn new(cfg: &ClusterConfig, thread_id: u64) -> Self {
        let kind = cfg.qp_sched_pol;
        let num_lanes = cfg.qp_lanes;
        let last_lane = match kind {
            QpSchedKind::None => 0,
            QpSchedKind::Mod => (thread_id % num_lanes as u64) as u32,
            QpSchedKind::OneToOne => {
                assert!(
                    num_lanes as u64 >= cfg.cn_threads,
                    "ONE_TO_ONE requested with {} threads and only {} lanes",
                    cfg.cn_threads,
                    num_lanes
                );
                thread_id as u32
            }
            QpSchedKind::Rr | QpSchedKind::Rand => 0,
        };
        let per_node = (0..=cfg.last_mn_id)
            .map(|_| thread_rng().gen_range(0..num_lanes))
            .collect();
        Self {
            kind,
            num_lanes,
            last_lane,
            per_node,
        }
    }

    /// The lane index to use for the next operation against `node`.
    pub fn lane(&mut self, node: u16) -> u32 {
        match self.kind {
            QpSchedKind::Rr => {
                let slot = &mut self.per_node[node as usize];
                *slot = (*slot + 1) % self.num_lanes;
                *slot
            }
            QpSchedKind::Rand => {
                self.last_lane = thread_rng().gen_range(0..self.num_lanes);
                self.last_lane
            }
            _ => self.last_lane,
        }
    }
}

/// Picks the `(memory node index, segment index)` for the next allocation.
pub struct MnAllocPolicy {
    kind: AllocKind,
    num_segs: u64,
    num_mns: u64,
    last_mn: u16,
    last_seg: u64,
}

impl MnAllocPolicy {
    pub fn new(cfg: &ClusterConfig, thread_id: u64) -> Self {
        let kind = cfg.alloc_pol;
        let num_segs = cfg.segs_per_mn;
        let num_mns = cfg.num_mns();
        let (last_mn, last_seg) = match kind {
            AllocKind::None | AllocKind::Rand => (0, 0),
            AllocKind::GlobalMod => {
                let seg_uid = cfg.thread_uid(thread_id) % cfg.total_segs();
                ((seg_uid / num_segs) as u16, seg_uid % num_segs)
            }
            AllocKind::GlobalRr => (
                thread_rng().gen_range(0..num_mns) as u16,
                thread_rng().gen_range(0..num_segs),
            ),
            AllocKind::LocalMod => {
                assert_local_roles(cfg);
                (cfg.mn_index(cfg.node_id), thread_id % num_segs)
            }
            AllocKind::LocalRr => {
                assert_local_roles(cfg);
                (cfg.mn_index(cfg.node_id), thread_rng().gen_range(0..num_segs))
            }
        };
        Self {
            kind,
            num_segs,
            num_mns,
            last_mn,
            last_seg,
        }
    }

    /// The `(mn index, segment index)` to try for the next allocation.
    pub fn pick(&mut self) -> (u16, u64) {
        match self.kind {
            AllocKind::GlobalRr => {
                // Next segment; on overflow, the next memory node.
                self.last_seg = (self.last_seg + 1) % self.num_segs;
                if self.last_seg == 0 {
                    self.last_mn = ((self.last_mn as u64 + 1) % self.num_mns) as u16;
                }
            }
            AllocKind::LocalRr => {
                self.last_seg = (self.last_seg + 1) % self.num_segs;
            }
            AllocKind::Rand => {
                self.last_mn = thread_rng().gen_range(0..self.num_mns) as u16;
                self.last_seg = thread_rng().gen_range(0..self.num_segs);
            }
            AllocKind::None | AllocKind::GlobalMod | AllocKind::LocalMod => {}
        }
        (self.last_mn, self.last_seg)
    }

    /// Segments reachable by this policy in one full rotation.
    pub fn total_segs(&self) -> u64 {
        self.num_mns * self.num_segs
    }
}

fn assert_local_roles(cfg: &ClusterConfig) {
    assert!(
        cfg.first_cn_id == cfg.first_mn_id && cfg.last_cn_id == cfg.last_mn_id,
        "local allocation policies require every node to be both compute and memory"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cfg(extra: &[&str]) -> ClusterConfig {
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
            "1",
            "--cn-threads",
            "2",
        ];
        if !extra.contains(&"--qp-lanes") {
            argv.extend_from_slice(&["--qp-lanes", "4"]);
        }
        if !extra.contains(&"--segs-per-mn") {
            argv.extend_from_slice(&["--segs-per-mn", "3"]);
        }
        argv.extend_from_slice(extra);
        ClusterConfig::parse_from(argv)
    }

    #[test]
    fn none_always_picks_lane_zero() {
        let c = cfg(&["--qp-sched-pol", "NONE"]);
        let mut pol = QpSchedPolicy::new(&c, 1);
        for _ in 0..10 {
            assert_eq!(pol.lane(0), 0);
        }
    }

    #[test]
    fn mod_and_one_to_one_pin_the_lane() {
        let c = cfg(&["--qp-sched-pol", "MOD"]);
        let mut pol = QpSchedPolicy::new(&c, 7);
        assert_eq!(pol.lane(0), 3);
        assert_eq!(pol.lane(1), 3);

        let c = cfg(&["--qp-sched-pol", "ONE_TO_ONE"]);
        let mut pol = QpSchedPolicy::new(&c, 1);
        assert_eq!(pol.lane(0), 1);
    }

    #[test]
    #[should_panic(expected = "ONE_TO_ONE")]
    fn one_to_one_requires_enough_lanes() {
        let c = cfg(&["--qp-sched-pol", "ONE_TO_ONE", "--qp-lanes", "1"]);
        let _ = QpSchedPolicy::new(&c, 0);
    }

    #[test]
    fn rr_rotates_independently_per_node() {
        let c = cfg(&["--qp-sched-pol", "RR"]);
        let mut pol = QpSchedPolicy::new(&c, 0);
        let first = pol.lane(0);
        assert_eq!(pol.lane(0), (first + 1) % 4);
        let other_first = pol.lane(1);
        assert_eq!(pol.lane(1), (other_first + 1) % 4);
        // Node 0's rotation was not disturbed by node 1's.
        assert_eq!(pol.lane(0), (first + 2) % 4);
    }

    #[test]
    fn rand_lane_stays_in_range() {
        let c = cfg(&["--qp-sched-pol", "RAND"]);
        let mut pol = QpSchedPolicy::new(&c, 0);
        for _ in 0..100 {
            assert!(pol.lane(0) < 4);
        }
    }

    #[test]
    fn none_allocates_from_segment_zero() {
        let c = cfg(&["--alloc-pol", "NONE"]);
        let mut pol = MnAllocPolicy::new(&c, 1);
        assert_eq!(pol.pick(), (0, 0));
        assert_eq!(pol.pick(), (0, 0));
    }

    #[test]
    fn global_mod_pins_by_thread_uid() {
        let c = cfg(&["--alloc-pol", "GLOBAL-MOD"]);
        // node_id 1, 2 threads per node: thread 1 has uid 3; 6 total segs.
        let mut pol = MnAllocPolicy::new(&c, 1);
        let first = pol.pick();
        assert_eq!(first, (1, 0));
        assert_eq!(pol.pick(), first);
    }

    #[test]
    fn global_rr_carries_into_the_next_node() {
        let c = cfg(&["--alloc-pol", "GLOBAL-RR"]);
        let mut pol = MnAllocPolicy::new(&c, 0);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..pol.total_segs() {
            assert!(seen.insert(pol.pick()), "rotation revisited a segment early");
        }
        // A full rotation returns to the starting point.
        let again = pol.pick();
        assert!(seen.contains(&again));
    }

    #[test]
    fn local_policies_stay_on_the_local_node() {
        let c = cfg(&["--alloc-pol", "LOCAL-RR"]);
        let mut pol = MnAllocPolicy::new(&c, 0);
        for _ in 0..10 {
            let (mn, seg) = pol.pick();
            assert_eq!(mn, 1);
            assert!(seg < 3);
        }

        let c = cfg(&["--alloc-pol", "LOCAL-MOD"]);
        let mut pol = MnAllocPolicy::new(&c, 5);
        assert_eq!(pol.pick(), (1, 5 % 3));
    }

    #[test]
    #[should_panic(expected = "local allocation")]
    fn local_policies_require_matching_roles() {
        let mut argv: Vec<&str> = vec![
            "test",
            "--node-id",
            "1",
            "--first-mn-id",
            "0",
            "--last-mn-id",
            "0",
            "--first-cn-id",
            "1",
            "--last-cn-id",
            "1",
            "--cn-threads",
            "1",
        ];
        argv.extend_from_slice(&["--alloc-pol", "LOCAL-MOD"]);
        let c = ClusterConfig::parse_from(argv);
        let _ = MnAllocPolicy::new(&c, 0);
    }
}
