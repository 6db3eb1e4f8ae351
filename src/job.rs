//! Shared job and allocation types consumed by the selector, the step
//! layout builder, and the persistence codec.

use crate::bitmap::NodeBitmap;

/// A job's posture on node-sharing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeReq {
    /// Exclusive: no other job may share any of this job's nodes.
    Reserved,
    /// No cohabitation with other *shared* work, but the node is not
    /// fully exclusive.
    OneRow,
    /// Sharing permitted.
    Available,
}

/// Whether a job tolerates co-resident jobs on its nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shared {
    No,
    Yes,
    User,
}

/// Consumable-resource accounting granularity, mirrors
/// [`crate::config::CrGranularity`] but scoped to a single allocation
/// (an allocation is always consistent with the process-wide config at
/// the time it was made).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum McGranularity {
    Cpu,
    Core,
    Socket,
}

/// Multi-core binding constraints.
#[derive(Clone, Copy, Debug, Default)]
pub struct McConstraints {
    pub min_sockets: u16,
    pub max_sockets: u16,
    pub min_cores: u16,
    pub max_cores: u16,
    pub min_threads: u16,
    pub max_threads: u16,
    pub ntasks_per_socket: u16,
    pub ntasks_per_core: u16,
    pub ntasks_per_node: u16,
    pub plane_size: u16,
}

/// Task distribution across a step's nodes. See §4.E.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Distribution {
    Block,
    Cyclic,
    Plane,
    BlockBlock,
    BlockCyclic,
    CyclicBlock,
    CyclicCyclic,
    Arbitrary,
}

/// Subset of a pending/running job consumed by the selector.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: u32,
    pub partition: String,
    pub num_procs: u32,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub req_nodes: u32,
    pub cpus_per_task: u16,
    pub max_memory_per_job: u64,
    pub shared: Shared,
    pub contiguous: bool,
    pub req_node_bitmap: Option<NodeBitmap>,
    pub mc: McConstraints,
    pub dist: Distribution,
    pub granularity: McGranularity,
}

impl Job {
    pub fn node_req(&self) -> NodeReq {
        match self.shared {
            Shared::No => NodeReq::Reserved,
            Shared::User => NodeReq::OneRow,
            Shared::Yes => NodeReq::Available,
        }
    }
}

/// Bit-encoded allocation state. Written as an explicit struct rather
/// than raw bits because the gating logic in `add_job_to_nodes` reads
/// more plainly this way, and it is what gets packed/unpacked in §4.F.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocState {
    pub allocated_mem: bool,
    pub allocated_cpus: bool,
}

impl AllocState {
    pub fn to_u8(self) -> u8 {
        (self.allocated_mem as u8) | ((self.allocated_cpus as u8) << 1)
    }

    pub fn from_u8(raw: u8) -> Self {
        Self {
            allocated_mem: raw & 0x1 != 0,
            allocated_cpus: raw & 0x2 != 0,
        }
    }
}

/// One accepted job's placement, as recorded by the selector.
#[derive(Clone, Debug)]
pub struct JobAllocation {
    pub job_id: u32,
    pub partition: String,
    pub granularity: McGranularity,
    pub state: AllocState,
    pub nprocs: u32,
    pub node_req: NodeReq,
    pub hosts: Vec<String>,
    /// Parallel to `hosts`: index into the live node table. Not persisted
    /// directly — rebuilt on restore from `hosts` via name lookup.
    pub node_indices: Vec<usize>,
    pub cpus: Vec<u32>,
    pub alloc_cpus: Vec<u32>,
    pub node_offset: Vec<u16>,
    pub alloc_cores: Vec<Vec<u16>>,
    pub alloc_memory: Vec<u64>,
    pub node_bitmap: NodeBitmap,
}

impl JobAllocation {
    pub fn nhosts(&self) -> usize {
        self.hosts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_state_round_trips_through_u8() {
        for mem in [false, true] {
            for cpus in [false, true] {
                let s = AllocState {
                    allocated_mem: mem,
                    allocated_cpus: cpus,
                };
                assert_eq!(AllocState::from_u8(s.to_u8()), s);
            }
        }
    }

    #[test]
    fn node_req_mirrors_shared_mode() {
        let mut j = Job {
            id: 1,
            partition: "p".into(),
            num_procs: 1,
            min_nodes: 1,
            max_nodes: 1,
            req_nodes: 1,
            cpus_per_task: 1,
            max_memory_per_job: 0,
            shared: Shared::No,
            contiguous: false,
            req_node_bitmap: None,
            mc: McConstraints::default(),
            dist: Distribution::Block,
            granularity: McGranularity::Core,
        };
        assert_eq!(j.node_req(), NodeReq::Reserved);
        j.shared = Shared::User;
        assert_eq!(j.node_req(), NodeReq::OneRow);
        j.shared = Shared::Yes;
        assert_eq!(j.node_req(), NodeReq::Available);
    }
}
