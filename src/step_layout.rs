//! Component E: step layout builder — distributes a job step's tasks
//! across its allocated nodes.

use crate::credential::StepCredential;
use crate::error::CoreError;
use crate::job::Distribution;

/// One job step's task-to-node-to-slot layout.
#[derive(Clone, Debug)]
pub struct StepLayout {
    pub node_list: Vec<String>,
    pub num_tasks: u32,
    pub node_cnt: u32,
    /// `tasks[i]`: number of tasks placed on node `i`.
    pub tasks: Vec<u32>,
    /// `tids[i][j]`: global task id of the j-th task on node `i`.
    pub tids: Vec<Vec<u32>>,
    /// `hostids[t]`: host index of global task `t` (inverse of `tids`).
    pub hostids: Vec<u32>,
    pub dist: Distribution,
    pub plane_size: u16,
    pub resv_ports: String,
    pub resv_port_array: Vec<u16>,
    pub credential: Option<StepCredential>,
}

/// Build a [`StepLayout`]. `cpus[i]` is node i's available cpu count;
/// `cpu_groups[i]` is the number of replicated cpu-groups on node i (used
/// by the two-level distributions; pass 1 when irrelevant).
pub fn distribute_tasks(
    node_list: &[String],
    cpus: &[u32],
    cpu_groups: &[u32],
    num_tasks: u32,
    dist: Distribution,
    plane_size: u16,
) -> Result<StepLayout, CoreError> {
    if node_list.is_empty() {
        return Err(CoreError::Invalid("step has no nodes".into()));
    }
    if num_tasks == 0 {
        return Err(CoreError::Invalid("step requests zero tasks".into()));
    }

    let effective_node_list = if dist == Distribution::Arbitrary {
        distinct_in_order(node_list)
    } else {
        node_list.to_vec()
    };

    if cpus.len() != effective_node_list.len() {
        return Err(CoreError::Invalid(
            "cpu count array length does not match node list".into(),
        ));
    }

    let nhosts = effective_node_list.len();
    let tasks = match dist {
        Distribution::Block | Distribution::BlockBlock | Distribution::BlockCyclic => {
            block_counts(cpus, num_tasks)
        }
        Distribution::Cyclic | Distribution::CyclicBlock | Distribution::CyclicCyclic => {
            cyclic_counts(cpus, num_tasks)
        }
        Distribution::Plane => plane_counts(cpus, num_tasks, plane_size.max(1))?,
        Distribution::Arbitrary => arbitrary_counts(node_list),
    };

    let assigned: u32 = tasks.iter().sum();
    if assigned != num_tasks {
        return Err(CoreError::Invalid(format!(
            "distribution assigned {assigned} tasks, expected {num_tasks}"
        )));
    }

    let (tids, hostids) = build_tid_maps(&tasks, dist, plane_size.max(1));

    let _ = cpu_groups; // two-level inner dimension is a refinement of the
                        // same per-node task count; cpu_groups informs a
                        // richer inner ordering a caller may not need.

    Ok(StepLayout {
        node_list: effective_node_list,
        num_tasks,
        node_cnt: nhosts as u32,
        tasks,
        tids,
        hostids,
        dist,
        plane_size,
        resv_ports: String::new(),
        resv_port_array: Vec::new(),
        credential: None,
    })
}

pub(crate) fn block_counts(cpus: &[u32], num_tasks: u32) -> Vec<u32> {
    let nhosts = (cpus.len() as u32).max(1);
    let ceiling = num_tasks.div_ceil(nhosts);
    let mut tasks = vec![0u32; cpus.len()];
    let mut remaining = num_tasks;
    for (i, &cap) in cpus.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        let take = cap.min(ceiling).min(remaining);
        tasks[i] = take;
        remaining -= take;
    }
    // If capacity ran out before tasks did, keep piling onto the last
    // node rather than lose tasks (capacities are considered advisory
    // caps, not hard limits, once every node has been offered its share).
    if remaining > 0 {
        *tasks.last_mut().unwrap() += remaining;
    }
    tasks
}

pub(crate) fn cyclic_counts(cpus: &[u32], num_tasks: u32) -> Vec<u32> {
    let n = cpus.len();
    let mut tasks = vec![0u32; n];
    let mut remaining_cap = cpus.to_vec();
    let mut assigned = 0;
    let mut i = 0;
    while assigned < num_tasks {
        if remaining_cap[i % n] > 0 || remaining_cap.iter().all(|&c| c == 0) {
            tasks[i % n] += 1;
            if remaining_cap[i % n] > 0 {
                remaining_cap[i % n] -= 1;
            }
            assigned += 1;
        }
        i += 1;
        if i > num_tasks as usize * n + n {
            // capacities exhausted cluster-wide; fall back to pure
            // round-robin with no capacity cap to guarantee termination.
            while assigned < num_tasks {
                tasks[(assigned as usize) % n] += 1;
                assigned += 1;
            }
            break;
        }
    }
    tasks
}

pub(crate) fn plane_counts(cpus: &[u32], num_tasks: u32, plane_size: u16) -> Result<Vec<u32>, CoreError> {
    let n = cpus.len();
    let mut tasks = vec![0u32; n];
    let mut remaining_cap = cpus.to_vec();
    let plane = plane_size as u32;
    let mut assigned = 0u32;
    let mut node = 0usize;
    let mut skipped_in_a_row = 0usize;
    while assigned < num_tasks {
        let idx = node % n;
        node += 1;
        if remaining_cap[idx] == 0 {
            skipped_in_a_row += 1;
            if skipped_in_a_row >= n {
                // capacities exhausted cluster-wide; keep piling on in
                // plane-size chunks rather than lose tasks.
                while assigned < num_tasks {
                    let idx = node % n;
                    let take = plane.min(num_tasks - assigned);
                    tasks[idx] += take;
                    assigned += take;
                    node += 1;
                }
                break;
            }
            continue;
        }
        skipped_in_a_row = 0;
        let take = plane.min(num_tasks - assigned).min(remaining_cap[idx]);
        tasks[idx] += take;
        remaining_cap[idx] -= take;
        assigned += take;
    }
    Ok(tasks)
}

fn distinct_in_order(node_list: &[String]) -> Vec<String> {
    let mut order = Vec::new();
    for n in node_list {
        if !order.contains(n) {
            order.push(n.clone());
        }
    }
    order
}

fn arbitrary_counts(node_list: &[String]) -> Vec<u32> {
    // node_list here is the literal per-task assignment list; collapse to
    // per-distinct-node counts in first-seen order, matching how `tids`
    // is then built in list order.
    let mut order: Vec<&str> = Vec::new();
    let mut counts: std::collections::HashMap<&str, u32> = std::collections::HashMap::new();
    for n in node_list {
        *counts.entry(n.as_str()).or_insert(0) += 1;
        if !order.contains(&n.as_str()) {
            order.push(n.as_str());
        }
    }
    order.iter().map(|n| counts[n]).collect()
}

fn build_tid_maps(tasks: &[u32], dist: Distribution, plane_size: u16) -> (Vec<Vec<u32>>, Vec<u32>) {
    let total: u32 = tasks.iter().sum();
    let mut hostids = vec![0u32; total as usize];
    let mut tids: Vec<Vec<u32>> = tasks.iter().map(|&t| Vec::with_capacity(t as usize)).collect();

    match dist {
        Distribution::Cyclic | Distribution::CyclicBlock | Distribution::CyclicCyclic => {
            let n = tasks.len();
            let mut remaining = tasks.to_vec();
            let mut t = 0u32;
            let mut i = 0usize;
            while t < total {
                if remaining[i % n] > 0 {
                    tids[i % n].push(t);
                    hostids[t as usize] = (i % n) as u32;
                    remaining[i % n] -= 1;
                    t += 1;
                }
                i += 1;
            }
        }
        Distribution::Plane => {
            let n = tasks.len();
            let plane = plane_size.max(1) as u32;
            let mut remaining = tasks.to_vec();
            let mut t = 0u32;
            let mut node = 0usize;
            while t < total {
                let take = plane.min(remaining[node % n]);
                for _ in 0..take {
                    tids[node % n].push(t);
                    hostids[t as usize] = (node % n) as u32;
                    t += 1;
                }
                remaining[node % n] -= take;
                node += 1;
                if node > tasks.len() * 4 + total as usize {
                    break; // defensive; cannot actually be hit given take>=0 progress
                }
            }
        }
        _ => {
            // Block, BlockBlock, BlockCyclic, Arbitrary: fill node 0's
            // slots contiguously, then node 1, in global task-id order.
            let mut t = 0u32;
            for (i, &count) in tasks.iter().enumerate() {
                for _ in 0..count {
                    tids[i].push(t);
                    hostids[t as usize] = i as u32;
                    t += 1;
                }
            }
        }
    }

    (tids, hostids)
}

impl StepLayout {
    /// Host index for global task id `tid`, or `None` if out of range.
    pub fn host_id(&self, tid: u32) -> Option<u32> {
        self.hostids.get(tid as usize).copied()
    }

    /// Host name for global task id `tid`.
    pub fn host_name(&self, tid: u32) -> Option<&str> {
        self.host_id(tid)
            .and_then(|h| self.node_list.get(h as usize))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("n{i}")).collect()
    }

    #[test]
    fn block_fills_nodes_in_order() {
        let layout = distribute_tasks(&names(3), &[2, 2, 2], &[1, 1, 1], 4, Distribution::Block, 0)
            .unwrap();
        assert_eq!(layout.tasks, vec![2, 2, 0]);
        assert_eq!(layout.tids[0], vec![0, 1]);
        assert_eq!(layout.tids[1], vec![2, 3]);
        assert!(layout.tids[2].is_empty());
    }

    #[test]
    fn plane_distribution_respects_per_node_capacity() {
        // A plane size larger than any single node's capacity must spill
        // onto the next node rather than oversubscribing the first one.
        let layout = distribute_tasks(&names(4), &[1, 1, 1, 1], &[1, 1, 1, 1], 4, Distribution::Plane, 4)
            .unwrap();
        assert_eq!(layout.tasks, vec![1, 1, 1, 1]);
    }

    #[test]
    fn cyclic_round_robins_tasks() {
        let layout =
            distribute_tasks(&names(3), &[2, 2, 2], &[1, 1, 1], 5, Distribution::Cyclic, 0)
                .unwrap();
        assert_eq!(layout.tasks.iter().sum::<u32>(), 5);
        assert_eq!(layout.tids[0][0], 0);
        assert_eq!(layout.tids[1][0], 1);
        assert_eq!(layout.tids[2][0], 2);
    }

    #[test]
    fn invariant_sum_tasks_equals_num_tasks_and_hostids_invert_tids() {
        for dist in [
            Distribution::Block,
            Distribution::Cyclic,
            Distribution::Plane,
        ] {
            let layout =
                distribute_tasks(&names(4), &[3, 3, 3, 3], &[1, 1, 1, 1], 7, dist, 2).unwrap();
            assert_eq!(layout.tasks.iter().sum::<u32>(), 7);
            for (i, row) in layout.tids.iter().enumerate() {
                for &t in row {
                    assert_eq!(layout.hostids[t as usize], i as u32);
                }
            }
        }
    }

    #[test]
    fn arbitrary_uses_literal_assignment() {
        let assignment: Vec<String> = ["n0", "n1", "n0", "n0"].iter().map(|s| s.to_string()).collect();
        let layout = distribute_tasks(
            &assignment,
            &[100, 100],
            &[1, 1],
            4,
            Distribution::Arbitrary,
            0,
        )
        .unwrap();
        assert_eq!(layout.tasks, vec![3, 1]);
    }

    #[test]
    fn zero_tasks_is_invalid() {
        assert!(distribute_tasks(&names(2), &[1, 1], &[1, 1], 0, Distribution::Block, 0).is_err());
    }

    #[test]
    fn host_name_and_host_id_lookups() {
        let layout = distribute_tasks(&names(2), &[2, 2], &[1, 1], 3, Distribution::Block, 0)
            .unwrap();
        assert_eq!(layout.host_id(2), Some(1));
        assert_eq!(layout.host_name(0), Some("n0"));
    }
}
