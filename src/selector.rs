//! Component D: the job placement selector.
//!
//! The hard core: given a candidate node bitmap and a job's requirements,
//! chooses which nodes (and which row on each) the job will occupy.

use tracing::{debug, instrument};

use crate::bitmap::NodeBitmap;
use crate::error::CoreError;
use crate::job::{AllocState, Distribution, Job, JobAllocation, McGranularity, NodeReq};
use crate::node_table::{NodeState, NodeTable};
use crate::step_layout;

/// How the selector is being invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectMode {
    /// Actually commit the placement.
    RunNow,
    /// Report whether it would succeed, without committing.
    TestOnly,
    /// Like `TestOnly`, but also estimate a future start — treated
    /// identically to `TestOnly` by this core since scheduling-queue
    /// simulation is out of scope.
    WillRun,
}

/// Per-node capacity figures computed during D.1, carried through D.2–D.5.
#[derive(Clone, Debug)]
struct NodeCapacity {
    node_idx: usize,
    avail_tasks: u32,
    avail_cpus: u32,
    row_idx: u16,
    is_required: bool,
}

/// §4.D.1: per-node task capacity under the job's constraints.
///
/// Walks the node's rows for the job's partition: `row_idx` minimises
/// allocated sockets (socket granularity) or allocated cpus (cpu/core
/// granularity); `free_row` is the first completely empty row, if any.
fn avail_tasks(
    nodes: &NodeTable,
    node_idx: usize,
    job: &Job,
    try_partial_idle: bool,
    node_req: NodeReq,
) -> (u32, u32, u16) {
    let node = nodes.get(node_idx);
    let cpus_per_task = job.cpus_per_task.max(1) as u32;
    let part = nodes.part_row(node_idx, &job.partition);

    let Some(part) = part else {
        // No partition row yet: node is pristine for this partition.
        let total_cpus = node.cpus();
        let tasks = total_cpus / cpus_per_task;
        return (tasks, total_cpus, 0);
    };

    let sockets = node.sockets.max(1);
    let num_rows = part.num_rows;

    let row_loads: Vec<u32> = (0..num_rows)
        .map(|r| {
            let start = r as usize * sockets as usize;
            part.alloc_cores[start..start + sockets as usize]
                .iter()
                .map(|&c| c as u32)
                .sum()
        })
        .collect();

    let free_row = row_loads.iter().position(|&l| l == 0).map(|r| r as u16);
    let min_row = row_loads
        .iter()
        .enumerate()
        .min_by_key(|(_, &l)| l)
        .map(|(r, _)| r as u16)
        .unwrap_or(0);

    let total_cpus = node.cpus();

    let row_idx = match node_req {
        NodeReq::OneRow => {
            // every single-row partition contributes its allocated
            // cores; a multi-row partition on a OneRow-seeking job is
            // treated as idle (it cannot host a OneRow job anyway —
            // filtered in D.2).
            if num_rows == 1 { 0 } else { free_row.unwrap_or(min_row) }
        }
        NodeReq::Reserved => {
            // pristine: use the emptiest row (should be all-empty, but
            // tolerate pre-existing occupancy defensively).
            free_row.unwrap_or(min_row)
        }
        NodeReq::Available => {
            if try_partial_idle {
                min_row
            } else {
                free_row.unwrap_or(min_row)
            }
        }
    };

    let load = row_loads[row_idx as usize];
    let free_cpus = total_cpus.saturating_sub(load);
    if free_cpus == 0 {
        return (0, 0, row_idx);
    }
    let tasks = free_cpus / cpus_per_task;
    (tasks, free_cpus, row_idx)
}

/// §4.D.2: node-state verification. Returns the filtered bitmap, or
/// `MemoryBusy` if a required node was excluded.
fn verify_node_states(
    nodes: &NodeTable,
    candidates: &NodeBitmap,
    job: &Job,
) -> Result<NodeBitmap, CoreError> {
    let node_req = job.node_req();
    let mut filtered = candidates.clone();
    for idx in candidates.iter_ones() {
        let node = nodes.get(idx);
        let free_mem = node.real_memory.saturating_sub(node.allocated_memory);
        let mem_ok = job.max_memory_per_job == 0 || free_mem >= job.max_memory_per_job;
        let state_ok = match node.state {
            NodeState::Reserved => false,
            NodeState::OneRow => {
                !matches!(node_req, NodeReq::Reserved | NodeReq::Available)
                    && nodes
                        .part_row(idx, &job.partition)
                        .map(|p| p.num_rows == 1)
                        .unwrap_or(true)
            }
            NodeState::Available => match node_req {
                NodeReq::Reserved => !node_is_busy(nodes, idx),
                NodeReq::OneRow => !node_hosts_shared_work(nodes, idx),
                NodeReq::Available => true,
            },
        };
        if !mem_ok || !state_ok {
            filtered.clear(idx);
        }
    }

    if let Some(req) = &job.req_node_bitmap {
        for idx in req.iter_ones() {
            if !filtered.test(idx) {
                return Err(CoreError::MemoryBusy);
            }
        }
    }

    Ok(filtered)
}

fn node_is_busy(nodes: &NodeTable, idx: usize) -> bool {
    nodes
        .get(idx)
        .parts
        .iter()
        .any(|p| p.alloc_cores.iter().any(|&c| c > 0))
}

fn node_hosts_shared_work(nodes: &NodeTable, idx: usize) -> bool {
    nodes.get(idx).parts.iter().any(|p| {
        p.num_rows > 1 && p.alloc_cores.iter().any(|&c| c > 0)
    })
}

struct ConsecRun {
    start: usize,
    end: usize,
    total_cpus: u32,
    node_count: u32,
    required_idx: Option<usize>,
}

/// §4.D.3: collapse the filtered bitmap into maximal runs and pick nodes
/// greedily from the best one.
fn consec_search(
    nodes: &NodeTable,
    filtered: &NodeBitmap,
    caps: &[NodeCapacity],
    job: &Job,
) -> Option<NodeBitmap> {
    let mut rem_nodes = job.min_nodes.max(1) as i64;
    let mut max_nodes = if job.max_nodes > 0 {
        job.max_nodes as i64
    } else {
        i64::MAX
    };
    let mut rem_cpus = job.num_procs.max(1) as i64 * job.cpus_per_task.max(1) as i64;

    let cap_by_idx = |idx: usize| caps.iter().find(|c| c.node_idx == idx);

    let mut runs = Vec::new();
    for r in filtered.runs() {
        let mut total_cpus = 0u32;
        let mut required_idx = None;
        for i in r.start..r.end {
            if let Some(c) = cap_by_idx(i) {
                total_cpus += c.avail_cpus;
                if c.is_required && required_idx.is_none() {
                    required_idx = Some(i);
                }
            }
        }
        runs.push(ConsecRun {
            start: r.start,
            end: r.end,
            total_cpus,
            node_count: (r.end - r.start) as u32,
            required_idx,
        });
    }

    if job.contiguous && runs.len() > 1 {
        runs.truncate(1);
    }

    // Charge required nodes immediately.
    let mut chosen = NodeBitmap::new(filtered.len());
    for run in &runs {
        if let Some(ri) = run.required_idx {
            if let Some(c) = cap_by_idx(ri) {
                chosen.set(ri);
                rem_nodes -= 1;
                max_nodes -= 1;
                rem_cpus -= c.avail_cpus as i64;
            }
        }
    }

    let best = pick_best_run(&runs, rem_nodes, rem_cpus)?;
    let run = &runs[best];

    // Fill the remaining demand from this run's not-yet-chosen nodes,
    // taking the highest-capacity node first rather than scanning
    // positionally, so a few large nodes are favoured over a spray of
    // small ones. Ties break by node index for determinism.
    let mut candidates: Vec<usize> = (run.start..run.end).filter(|&i| !chosen.test(i)).collect();
    candidates.sort_by(|&a, &b| {
        let ca = cap_by_idx(a).map(|c| c.avail_tasks).unwrap_or(0);
        let cb = cap_by_idx(b).map(|c| c.avail_tasks).unwrap_or(0);
        cb.cmp(&ca).then(a.cmp(&b))
    });

    for i in candidates {
        if !(rem_nodes > 0 || rem_cpus > 0) || max_nodes <= 0 {
            break;
        }
        if let Some(c) = cap_by_idx(i) {
            if c.avail_tasks > 0 {
                chosen.set(i);
                rem_nodes -= 1;
                max_nodes -= 1;
                rem_cpus -= c.avail_cpus as i64;
            }
        }
    }

    let _ = nodes;
    if rem_nodes <= 0 && rem_cpus <= 0 {
        Some(chosen)
    } else {
        None
    }
}

fn pick_best_run(runs: &[ConsecRun], rem_nodes: i64, rem_cpus: i64) -> Option<usize> {
    if let Some((i, _)) = runs.iter().enumerate().find(|(_, r)| r.required_idx.is_some()) {
        return Some(i);
    }
    let sufficient: Vec<usize> = runs
        .iter()
        .enumerate()
        .filter(|(_, r)| r.node_count as i64 >= rem_nodes && r.total_cpus as i64 >= rem_cpus)
        .map(|(i, _)| i)
        .collect();
    if let Some(&i) = sufficient.first() {
        // Among sufficient runs, tightest fit (smallest cpus).
        return sufficient
            .into_iter()
            .min_by_key(|&i| runs[i].total_cpus)
            .or(Some(i));
    }
    runs.iter()
        .enumerate()
        .max_by_key(|(_, r)| r.total_cpus)
        .map(|(i, _)| i)
}

/// §4.D.4: knapsack-style threshold truncation escape.
fn knapsack_escape(
    nodes: &NodeTable,
    filtered: &NodeBitmap,
    caps: &[NodeCapacity],
    job: &Job,
) -> Result<NodeBitmap, CoreError> {
    let max_cap = caps.iter().map(|c| c.avail_tasks).max().unwrap_or(0);
    for count in 0..=max_cap {
        let mut trial = filtered.clone();
        for c in caps {
            if c.avail_tasks <= count && !c.is_required {
                trial.clear(c.node_idx);
            }
        }
        if let Some(req) = &job.req_node_bitmap {
            for idx in req.iter_ones() {
                if caps
                    .iter()
                    .find(|c| c.node_idx == idx)
                    .map(|c| c.avail_tasks <= count)
                    .unwrap_or(false)
                {
                    return Err(CoreError::NodesBusy);
                }
            }
        }
        if let Some(result) = consec_search(nodes, &trial, caps, job) {
            return Ok(result);
        }
    }
    Err(CoreError::NodesBusy)
}

/// §4.D.5 (continued) / §4.E: the task-distribution pass that fills
/// `alloc_cpus` once nodes are chosen. A job's own tasks spread across its
/// granted nodes by the same block/cyclic/plane counting the step layout
/// builder uses for a step's tasks — `Arbitrary` has no literal per-task
/// list at allocation time (that only exists once a step is launched), so
/// it falls back to `Block`.
fn distribute_job_tasks(job: &Job, cpus_vec: &[u32]) -> Vec<u32> {
    match job.dist {
        Distribution::Cyclic | Distribution::CyclicBlock | Distribution::CyclicCyclic => {
            step_layout::cyclic_counts(cpus_vec, job.num_procs)
        }
        Distribution::Plane => {
            step_layout::plane_counts(cpus_vec, job.num_procs, job.mc.plane_size.max(1))
                .unwrap_or_else(|_| step_layout::block_counts(cpus_vec, job.num_procs))
        }
        _ => step_layout::block_counts(cpus_vec, job.num_procs),
    }
}

/// Spreads `cpus_needed` cores across a node's sockets, filling each up to
/// `cores_per_socket` before moving to the next.
fn distribute_cores_across_sockets(cpus_needed: u32, sockets: u16, cores_per_socket: u16) -> Vec<u16> {
    let mut cores = vec![0u16; sockets.max(1) as usize];
    let mut remaining = cpus_needed;
    for slot in cores.iter_mut() {
        if remaining == 0 {
            break;
        }
        let take = (cores_per_socket as u32).min(remaining);
        *slot = take as u16;
        remaining -= take;
    }
    cores
}

/// §4.D.5: pick a row per chosen node. Three passes: unchanged, bumped if
/// full, bumped if occupied at all — "least-loaded over contiguous."
fn select_row(nodes: &NodeTable, node_idx: usize, part_name: &str, preferred: u16) -> u16 {
    let Some(part) = nodes.part_row(node_idx, part_name) else {
        return 0;
    };
    let sockets = nodes.get(node_idx).sockets.max(1);
    let cores_per_socket = nodes.get(node_idx).cores_per_socket;
    let num_rows = part.num_rows;

    for attempt in 0..3u8 {
        for offset in 0..num_rows {
            let row = (preferred + offset) % num_rows;
            let ok = match attempt {
                0 => true,
                1 => !part.is_row_full(row, cores_per_socket, sockets),
                _ => part.is_row_empty(row, sockets) || attempt == 2,
            };
            if ok {
                return row;
            }
        }
    }
    preferred % num_rows.max(1)
}

/// Run the full selection pipeline. On `SelectMode::RunNow` success,
/// returns a populated [`JobAllocation`] ready for `add_job_to_nodes`.
#[instrument(skip(nodes, job, candidates), fields(job_id = job.id))]
pub fn job_test(
    nodes: &NodeTable,
    candidates: &NodeBitmap,
    job: &Job,
    mode: SelectMode,
) -> Result<JobAllocation, CoreError> {
    if job.num_procs == 0 {
        return Err(CoreError::Invalid("job requests zero tasks".into()));
    }

    let filtered = verify_node_states(nodes, candidates, job)?;

    let node_req = job.node_req();
    let try_partial_idle = true;
    let mut caps = Vec::new();
    for idx in filtered.iter_ones() {
        let (tasks, cpus, row) = avail_tasks(nodes, idx, job, try_partial_idle, node_req);
        let is_required = job
            .req_node_bitmap
            .as_ref()
            .map(|b| b.test(idx))
            .unwrap_or(false);
        caps.push(NodeCapacity {
            node_idx: idx,
            avail_tasks: tasks,
            avail_cpus: cpus,
            row_idx: row,
            is_required,
        });
    }

    let chosen = match consec_search(nodes, &filtered, &caps, job) {
        Some(c) => c,
        None => knapsack_escape(nodes, &filtered, &caps, job)?,
    };

    debug!(chosen = chosen.count_ones(), "placement selected");

    let mut hosts = Vec::new();
    let mut node_indices = Vec::new();
    let mut cpus_vec = Vec::new();
    let mut node_offset = Vec::new();
    let mut alloc_cores = Vec::new();
    for idx in chosen.iter_ones() {
        let cap = caps.iter().find(|c| c.node_idx == idx).unwrap();
        hosts.push(nodes.get(idx).name.clone());
        node_indices.push(idx);
        cpus_vec.push(cap.avail_cpus);
        let row = if mode == SelectMode::RunNow {
            select_row(nodes, idx, &job.partition, cap.row_idx)
        } else {
            cap.row_idx
        };
        node_offset.push(row);
    }

    let cpus_per_task = job.cpus_per_task.max(1) as u32;
    let tasks_per_host = distribute_job_tasks(job, &cpus_vec);
    let mut alloc_cpus = Vec::with_capacity(node_indices.len());
    for (i, &idx) in node_indices.iter().enumerate() {
        let granted = (tasks_per_host.get(i).copied().unwrap_or(0) * cpus_per_task).min(cpus_vec[i]);
        alloc_cpus.push(granted);
        let node = nodes.get(idx);
        alloc_cores.push(distribute_cores_across_sockets(
            granted,
            node.sockets,
            node.cores_per_socket,
        ));
    }

    let nhosts = hosts.len();
    Ok(JobAllocation {
        job_id: job.id,
        partition: job.partition.clone(),
        granularity: job.granularity,
        state: AllocState::default(),
        nprocs: job.num_procs,
        node_req,
        hosts,
        node_indices,
        cpus: cpus_vec,
        alloc_cpus,
        node_offset,
        alloc_cores,
        alloc_memory: vec![job.max_memory_per_job; nhosts],
        node_bitmap: chosen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Distribution, McConstraints, Shared};

    fn make_job(id: u32, num_procs: u32, min_nodes: u32, max_nodes: u32) -> Job {
        Job {
            id,
            partition: "p".into(),
            num_procs,
            min_nodes,
            max_nodes,
            req_nodes: 0,
            cpus_per_task: 1,
            max_memory_per_job: 0,
            shared: Shared::Yes,
            contiguous: false,
            req_node_bitmap: None,
            mc: McConstraints::default(),
            dist: Distribution::Block,
            granularity: McGranularity::Cpu,
        }
    }

    fn make_cluster(caps: &[(&str, u16)]) -> NodeTable {
        let mut t = NodeTable::new();
        let nodes = caps
            .iter()
            .map(|(name, cpus)| crate::node_table::NodeRecord::new(*name, 1, *cpus, 1, 1 << 34))
            .collect();
        t.node_init(nodes, 2);
        t
    }

    #[test]
    fn places_job_on_sufficient_contiguous_run() {
        let nodes = make_cluster(&[("n1", 2), ("n2", 2), ("n3", 2), ("n4", 2), ("n5", 4)]);
        let candidates = {
            let mut b = NodeBitmap::new(5);
            for i in 0..5 {
                b.set(i);
            }
            b
        };
        let job = make_job(1, 4, 4, 4);
        let alloc = job_test(&nodes, &candidates, &job, SelectMode::RunNow).unwrap();
        assert_eq!(alloc.nhosts(), 4);
    }

    #[test]
    fn zero_task_job_is_invalid() {
        let nodes = make_cluster(&[("n1", 2)]);
        let mut b = NodeBitmap::new(1);
        b.set(0);
        let job = make_job(1, 0, 1, 1);
        assert!(matches!(
            job_test(&nodes, &b, &job, SelectMode::RunNow),
            Err(CoreError::Invalid(_))
        ));
    }

    #[test]
    fn consec_fill_prefers_large_nodes_over_a_spray_of_small_ones() {
        let nodes = make_cluster(&[("n1", 1), ("n2", 1), ("n3", 1), ("n4", 4), ("n5", 4)]);
        let mut b = NodeBitmap::new(5);
        for i in 0..5 {
            b.set(i);
        }
        let mut job = make_job(5, 6, 1, 5);
        job.cpus_per_task = 1;
        let alloc = job_test(&nodes, &b, &job, SelectMode::RunNow).unwrap();
        // The two 4-cpu nodes alone cover 6 tasks; the fill picks them
        // before touching any of the three 1-cpu nodes.
        assert_eq!(alloc.nhosts(), 2);
        assert!(alloc.hosts.contains(&"n4".to_string()));
        assert!(alloc.hosts.contains(&"n5".to_string()));
    }

    #[test]
    fn reserved_node_excludes_every_job() {
        let mut nodes = make_cluster(&[("n1", 2)]);
        nodes.get_mut(0).state = NodeState::Reserved;
        let mut b = NodeBitmap::new(1);
        b.set(0);
        let job = make_job(1, 1, 1, 1);
        assert!(matches!(
            job_test(&nodes, &b, &job, SelectMode::RunNow),
            Err(CoreError::NodesBusy)
        ));
    }

    #[test]
    fn insufficient_memory_on_required_node_is_memory_busy() {
        let mut nodes = make_cluster(&[("n1", 2)]);
        nodes.get_mut(0).allocated_memory = nodes.get(0).real_memory;
        let mut b = NodeBitmap::new(1);
        b.set(0);
        let mut req = NodeBitmap::new(1);
        req.set(0);
        let mut job = make_job(1, 1, 1, 1);
        job.max_memory_per_job = 1024;
        job.req_node_bitmap = Some(req);
        assert!(matches!(
            job_test(&nodes, &b, &job, SelectMode::RunNow),
            Err(CoreError::MemoryBusy)
        ));
    }
}
