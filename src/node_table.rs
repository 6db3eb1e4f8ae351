//! Component C: the node-resource table.
//!
//! A flat array of [`NodeRecord`] plus a chained-bucket hash table keyed
//! by node name. The hash preserves the original character-weighted
//! function verbatim (see [`hash_index`]) — it is specifically resistant
//! to collisions on `cluster[0001-1000]`-style names, which is a lookup
//! *correctness*-adjacent performance requirement, not an incidental
//! optimisation.

use std::collections::HashMap;

use crate::job::JobAllocation;

/// Coarse allocation discipline for a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// No occupancy at all for the partitions tracked here.
    Available,
    /// Currently hosting one or more single-row (unshared) partition
    /// allocations.
    OneRow,
    /// Exclusively held; excludes every job.
    Reserved,
}

/// Per-partition view of one node's row occupancy.
#[derive(Clone, Debug)]
pub struct PartRow {
    pub part_name: String,
    /// Number of concurrent-allocation slots this partition permits on
    /// this node. Always ≥ 1.
    pub num_rows: u16,
    /// `num_rows * sockets` entries; `alloc_cores[r * sockets + s]` is the
    /// number of cores allocated to row `r`, socket `s`.
    pub alloc_cores: Vec<u16>,
}

impl PartRow {
    fn new(part_name: String, num_rows: u16, sockets: u16) -> Self {
        Self {
            part_name,
            num_rows: num_rows.max(1),
            alloc_cores: vec![0u16; num_rows.max(1) as usize * sockets as usize],
        }
    }

    fn row_slice(&self, row: u16, sockets: u16) -> &[u16] {
        let start = row as usize * sockets as usize;
        &self.alloc_cores[start..start + sockets as usize]
    }

    fn row_slice_mut(&mut self, row: u16, sockets: u16) -> &mut [u16] {
        let start = row as usize * sockets as usize;
        &mut self.alloc_cores[start..start + sockets as usize]
    }

    fn row_sum(&self, row: u16, sockets: u16) -> u32 {
        self.row_slice(row, sockets).iter().map(|&c| c as u32).sum()
    }

    pub(crate) fn is_row_empty(&self, row: u16, sockets: u16) -> bool {
        self.row_slice(row, sockets).iter().all(|&c| c == 0)
    }

    pub(crate) fn is_row_full(&self, row: u16, cores_per_socket: u16, sockets: u16) -> bool {
        self.row_slice(row, sockets)
            .iter()
            .all(|&c| c >= cores_per_socket)
    }

    fn grow_sockets(&mut self, old_sockets: u16, new_sockets: u16) {
        if new_sockets <= old_sockets {
            return;
        }
        let mut grown = vec![0u16; self.num_rows as usize * new_sockets as usize];
        for r in 0..self.num_rows as usize {
            let old_row = &self.alloc_cores[r * old_sockets as usize..(r + 1) * old_sockets as usize];
            grown[r * new_sockets as usize..r * new_sockets as usize + old_sockets as usize]
                .copy_from_slice(old_row);
        }
        self.alloc_cores = grown;
    }
}

/// Optional advisory energy reading.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnergyCounters {
    pub joule_counter: u64,
    pub time_usec: u64,
    pub current_watts: u32,
}

/// One physical node.
#[derive(Clone, Debug)]
pub struct NodeRecord {
    pub name: String,
    pub sockets: u16,
    pub cores_per_socket: u16,
    pub threads_per_core: u16,
    pub real_memory: u64,
    pub allocated_memory: u64,
    pub parts: Vec<PartRow>,
    pub state: NodeState,
    pub new_job_time: u64,
    pub energy: Option<EnergyCounters>,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>, sockets: u16, cores_per_socket: u16, threads_per_core: u16, real_memory: u64) -> Self {
        Self {
            name: name.into(),
            sockets,
            cores_per_socket,
            threads_per_core,
            real_memory,
            allocated_memory: 0,
            parts: Vec::new(),
            state: NodeState::Available,
            new_job_time: 0,
            energy: None,
        }
    }

    pub fn cpus(&self) -> u32 {
        self.sockets as u32 * self.cores_per_socket as u32 * self.threads_per_core.max(1) as u32
    }

    fn part_mut(&mut self, part_name: &str, default_num_rows: u16) -> &mut PartRow {
        if let Some(idx) = self.parts.iter().position(|p| p.part_name == part_name) {
            return &mut self.parts[idx];
        }
        self.parts
            .push(PartRow::new(part_name.to_string(), default_num_rows, self.sockets));
        self.parts.last_mut().unwrap()
    }

    fn part(&self, part_name: &str) -> Option<&PartRow> {
        self.parts.iter().find(|p| p.part_name == part_name)
    }

    /// Zero-extend this node's row arrays for `part_name` to at least
    /// `num_rows` rows and `self.sockets` sockets, preserving existing
    /// occupancy. Shrinking never happens here: rows beyond the new count
    /// are simply not addressed again, matching the "tolerate stale
    /// occupancy" policy for in-flight jobs whose offset has gone stale.
    pub fn ensure_part_capacity(&mut self, part_name: &str, num_rows: u16, default_num_rows: u16) {
        let sockets = self.sockets;
        let row = self.part_mut(part_name, default_num_rows);
        if num_rows > row.num_rows {
            let mut grown = vec![0u16; num_rows as usize * sockets as usize];
            grown[..row.alloc_cores.len()].copy_from_slice(&row.alloc_cores);
            row.alloc_cores = grown;
            row.num_rows = num_rows;
        }
    }

    /// Called after a reconfigure widens `sockets`; zero-extends every
    /// partition row in place.
    pub fn grow_sockets(&mut self, old_sockets: u16) {
        let new_sockets = self.sockets;
        for p in &mut self.parts {
            p.grow_sockets(old_sockets, new_sockets);
        }
    }

    /// §4.C `count_idle_cpus`.
    pub fn count_idle_cpus(&self, part_name: &str) -> u32 {
        let cpus = self.cpus();
        match self.state {
            NodeState::Reserved => 0,
            NodeState::OneRow => {
                let used: u32 = self
                    .parts
                    .iter()
                    .filter(|p| p.num_rows == 1)
                    .map(|p| p.row_sum(0, self.sockets))
                    .sum();
                cpus.saturating_sub(used)
            }
            NodeState::Available => {
                let mut min_row_load = None;
                for p in &self.parts {
                    for r in 0..p.num_rows {
                        let load = p.row_sum(r, self.sockets);
                        min_row_load = Some(min_row_load.map_or(load, |m: u32| m.min(load)));
                    }
                }
                let _ = part_name;
                cpus.saturating_sub(min_row_load.unwrap_or(0))
            }
        }
    }

    /// True once every single-row partition on this node has gone back to
    /// zero occupancy — the node returns to `Available`.
    fn all_single_row_parts_idle(&self) -> bool {
        self.parts
            .iter()
            .filter(|p| p.num_rows == 1)
            .all(|p| p.row_sum(0, self.sockets) == 0)
    }
}

/// The custom character-weighted hash: `Σ byte[j] * (j+1)`, one-based
/// position, modulo table size. Preserved verbatim — this specific
/// weighting is what defeats collisions on `clusterNNNN`-style names.
pub fn hash_index(name: &str, table_size: usize) -> usize {
    if table_size == 0 {
        return 0;
    }
    let mut index: i64 = 0;
    for (j, byte) in name.bytes().enumerate() {
        index += byte as i64 * (j as i64 + 1);
    }
    (index.rem_euclid(table_size as i64)) as usize
}

/// Flat node array plus chained-bucket hash index.
pub struct NodeTable {
    nodes: Vec<NodeRecord>,
    name_to_index: HashMap<String, usize>,
    buckets: Vec<Vec<usize>>,
    default_num_rows: u16,
}

impl NodeTable {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            name_to_index: HashMap::new(),
            buckets: Vec::new(),
            default_num_rows: 1,
        }
    }

    /// Publish the authoritative node array, rebuilding the hash table.
    pub fn node_init(&mut self, nodes: Vec<NodeRecord>, default_num_rows: u16) {
        self.default_num_rows = default_num_rows;
        self.name_to_index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        self.rebuild_buckets(&nodes);
        self.nodes = nodes;
    }

    fn rebuild_buckets(&mut self, nodes: &[NodeRecord]) {
        let size = nodes.len().max(1);
        let mut buckets = vec![Vec::new(); size];
        for (i, n) in nodes.iter().enumerate() {
            let h = hash_index(&n.name, size);
            buckets[h].push(i);
        }
        self.buckets = buckets;
    }

    /// Append a record without reallocating the whole table — prepended
    /// to its bucket's chain, per the design note.
    pub fn push_node(&mut self, node: NodeRecord) {
        let idx = self.nodes.len();
        self.name_to_index.insert(node.name.clone(), idx);
        if self.buckets.is_empty() {
            self.buckets.push(Vec::new());
        }
        let h = hash_index(&node.name, self.buckets.len());
        self.buckets[h].insert(0, idx);
        self.nodes.push(node);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        if self.buckets.is_empty() {
            return None;
        }
        let h = hash_index(name, self.buckets.len());
        self.buckets[h]
            .iter()
            .copied()
            .find(|&i| self.nodes[i].name == name)
            .or_else(|| self.name_to_index.get(name).copied())
    }

    pub fn get(&self, idx: usize) -> &NodeRecord {
        &self.nodes[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut NodeRecord {
        &mut self.nodes[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    /// Lazily create/widen a partition's row array on `node_idx`.
    pub fn ensure_partition(&mut self, node_idx: usize, part_name: &str, configured_max_share: u16) {
        let num_rows = (configured_max_share & 0x7fff).max(1);
        self.nodes[node_idx].ensure_part_capacity(part_name, num_rows, self.default_num_rows);
    }

    /// §4.D.6 `add_job_to_nodes`. Idempotent: a second call with the same
    /// allocation state bits is a no-op per-bit.
    pub fn add_job_to_nodes(&mut self, alloc: &mut JobAllocation, suspend: bool) {
        for (i, &node_idx) in alloc.node_indices.iter().enumerate() {
            let mem_already = alloc.state.allocated_mem;
            let cpus_already = alloc.state.allocated_cpus;
            let node = &mut self.nodes[node_idx];

            if !mem_already {
                node.allocated_memory = node
                    .allocated_memory
                    .saturating_add(alloc.alloc_memory[i]);
            }
            if suspend {
                continue;
            }
            if cpus_already {
                continue;
            }
            let part = node.part_mut(&alloc.partition, self.default_num_rows);
            let row = alloc.node_offset[i];
            let sockets = part
                .alloc_cores
                .len()
                .checked_div(part.num_rows as usize)
                .unwrap_or(0) as u16;
            // Always charged via the per-socket `alloc_cores` breakdown,
            // regardless of granularity: `alloc_cpus` is the same total
            // under a different shape (kept for §4.F's on-disk field and
            // §6's per-node reporting), and `rm_job_from_nodes` releases
            // through `alloc_cores` symmetrically.
            let slice = part.row_slice_mut(row, sockets);
            for (s, &cores) in alloc.alloc_cores[i].iter().enumerate() {
                if s < slice.len() {
                    slice[s] = slice[s].saturating_add(cores);
                }
            }
            if part.num_rows == 1 {
                node.state = NodeState::OneRow;
            }
        }
        alloc.state.allocated_mem = true;
        if !suspend {
            alloc.state.allocated_cpus = true;
        }
    }

    /// §4.D.6 `rm_job_from_nodes`. Underflow-guarded: clamps to zero and
    /// returns the list of nodes where an underflow was detected (the
    /// caller logs these via `tracing::error!`).
    ///
    /// `remove_all=false` is the suspend path: cpu rows are released but
    /// memory is retained (both the physical charge and the `allocated_mem`
    /// bit stay put), so a suspended job's footprint still counts against
    /// `real_memory` until `job_fini` calls this with `remove_all=true`.
    pub fn rm_job_from_nodes(&mut self, alloc: &mut JobAllocation, remove_all: bool) -> Vec<String> {
        let mut underflowed = Vec::new();
        for (i, &node_idx) in alloc.node_indices.iter().enumerate() {
            let node = &mut self.nodes[node_idx];
            if alloc.state.allocated_cpus {
                let part_name = alloc.partition.clone();
                let node_offset = alloc.node_offset[i];
                let sockets = node.sockets;
                if let Some(part) = node.parts.iter_mut().find(|p| p.part_name == part_name) {
                    let slice = part.row_slice_mut(node_offset, sockets);
                    for (s, &cores) in alloc.alloc_cores[i].iter().enumerate() {
                        if s < slice.len() {
                            if slice[s] < cores {
                                underflowed.push(node.name.clone());
                                slice[s] = 0;
                            } else {
                                slice[s] -= cores;
                            }
                        }
                    }
                }
            }
            if remove_all && alloc.state.allocated_mem {
                if node.allocated_memory < alloc.alloc_memory[i] {
                    underflowed.push(node.name.clone());
                    node.allocated_memory = 0;
                } else {
                    node.allocated_memory -= alloc.alloc_memory[i];
                }
            }
            if node.all_single_row_parts_idle() {
                node.state = NodeState::Available;
            }
        }
        alloc.state.allocated_cpus = false;
        if remove_all {
            alloc.state.allocated_mem = false;
        }
        underflowed
    }

    pub fn part_row(&self, node_idx: usize, part_name: &str) -> Option<&PartRow> {
        self.nodes[node_idx].part(part_name)
    }

    /// True if `additional` cores per socket still fit in `row` of
    /// `part_name` on `node_idx` without exceeding `cores_per_socket`.
    /// A partition with no row array yet always has room.
    pub fn row_has_room(&self, node_idx: usize, part_name: &str, row: u16, additional: &[u16]) -> bool {
        let node = &self.nodes[node_idx];
        let Some(part) = node.part(part_name) else {
            return true;
        };
        if row >= part.num_rows {
            return true;
        }
        let slice = part.row_slice(row, node.sockets);
        slice
            .iter()
            .zip(additional.iter())
            .all(|(&have, &add)| have as u32 + add as u32 <= node.cores_per_socket as u32)
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}
