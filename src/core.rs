//! The `Core` facade: the crate's sole public entry point.
//!
//! Owns every domain — configuration, partitions, the node/port table, and
//! the selector's job list — behind its own lock, per §5's hierarchical
//! reader/writer scheme. No free-standing static mutable state; every API
//! is threaded through `&self`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use tracing::{debug, info, instrument, warn};

use crate::bitmap::NodeBitmap;
use crate::config::SelectConfig;
use crate::error::CoreError;
use crate::job::{AllocState, Distribution, Job, JobAllocation};
use crate::node_table::{NodeRecord, NodeTable};
use crate::persist::{self, find_prev_node, NodeSummary};
use crate::port_table::PortTable;
use crate::selector::{self, SelectMode};
use crate::step_layout::{self, StepLayout};

/// Keys for [`Core::get_extra_jobinfo`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtraJobInfoKey {
    /// Cpus granted to this job on this node.
    AllocCpus,
}

/// Keys for [`Core::get_select_nodeinfo`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectNodeInfoKey {
    /// Worst-case (busiest-row) allocated cpus across every partition row
    /// on this node.
    AllocCpus,
    /// Idle cpus under the same worst-case-row accounting.
    IdleCpus,
}

/// The process-wide port table is guarded by the node lock (§5), so it
/// lives alongside the node array in the same `RwLock`.
struct NodesDomain {
    table: NodeTable,
    ports: PortTable,
}

/// Owns every mutable domain of the selector core.
pub struct Core {
    config: RwLock<SelectConfig>,
    partitions: RwLock<HashMap<String, u16>>,
    nodes: RwLock<NodesDomain>,
    /// The selector's job list. Guarded by its own mutex, independent of
    /// the node/config locks, so restore and fini can traverse it without
    /// holding the large locks (§5).
    jobs: Mutex<Vec<JobAllocation>>,
    /// Jobs decoded by `state_restore` but not yet resolved against the
    /// controller's live job table; merged into `jobs` by `job_init`.
    pending_restored_jobs: Mutex<Vec<JobAllocation>>,
    /// Node summary snapshot from the last `state_restore`, consumed by
    /// the next `node_init`.
    restore_previous: Mutex<Option<(Vec<NodeSummary>, usize)>>,
}

impl Core {
    /// Brings up the plugin. Configuration errors (e.g. a descending port
    /// range) are fatal at this point, per §7 policy.
    #[instrument(skip(config))]
    pub fn new(config: SelectConfig) -> Result<Self, CoreError> {
        if config.port_max < config.port_min {
            return Err(CoreError::Invalid(format!(
                "descending port range {}-{}",
                config.port_min, config.port_max
            )));
        }
        let ports = PortTable::new(config.port_min, config.port_max, 0);
        Ok(Self {
            config: RwLock::new(config),
            partitions: RwLock::new(HashMap::new()),
            nodes: RwLock::new(NodesDomain {
                table: NodeTable::new(),
                ports,
            }),
            jobs: Mutex::new(Vec::new()),
            pending_restored_jobs: Mutex::new(Vec::new()),
            restore_previous: Mutex::new(None),
        })
    }

    /// Records a partition's configured `max_share` for lazy row creation.
    /// Mirrors reading it from live partition config in the original.
    pub fn configure_partition(&self, partition: impl Into<String>, max_share: u16) {
        self.partitions
            .write()
            .unwrap()
            .insert(partition.into(), max_share);
    }

    fn configured_max_share(&self, partition: &str) -> u16 {
        if let Some(&m) = self.partitions.read().unwrap().get(partition) {
            m
        } else {
            self.config.read().unwrap().default_num_rows
        }
    }

    /// §6 `node_init`: publish the authoritative node array. Rebuilds the
    /// hash table and resizes the port table, then replays any pending
    /// restored jobs against the fresh node table.
    #[instrument(skip(self, nodes))]
    pub fn node_init(&self, nodes: Vec<NodeRecord>) -> Result<(), CoreError> {
        let (default_num_rows, port_min, port_max) = {
            let config = self.config.read().unwrap();
            (config.default_num_rows, config.port_min, config.port_max)
        };
        {
            let mut domain = self.nodes.write().unwrap();
            domain.table.node_init(nodes, default_num_rows);
            let node_count = domain.table.len();
            domain.ports = PortTable::new(port_min, port_max, node_count);
        }
        self.replay_restored_jobs();
        Ok(())
    }

    /// Replays every job in the live job list against the node table,
    /// consuming the "previous" node summary left by the last
    /// `state_restore`. A no-op if there is nothing pending. Called from
    /// both `node_init` and `job_init`, since the controller may call
    /// either one first; the snapshot is only taken once both the node
    /// table and the job list are actually ready to replay against.
    fn replay_restored_jobs(&self) {
        let mut previous_guard = self.restore_previous.lock().unwrap();
        if previous_guard.is_none() {
            return;
        }
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.is_empty() {
            return;
        }
        if self.nodes.read().unwrap().table.len() == 0 {
            return;
        }
        let (previous_nodes, mut cursor) = previous_guard.take().unwrap();
        drop(previous_guard);
        let mut domain = self.nodes.write().unwrap();
        for alloc in jobs.iter_mut() {
            let max_share = self.configured_max_share(&alloc.partition);
            let mut indices = Vec::with_capacity(alloc.hosts.len());
            let mut all_found = true;
            for host in &alloc.hosts {
                match domain.table.find_by_name(host) {
                    Some(idx) => {
                        if find_prev_node(&previous_nodes, host, &mut cursor).is_none() {
                            debug!(node = %host, "replaying job onto a node absent from the prior snapshot");
                        }
                        indices.push(idx);
                    }
                    None => {
                        all_found = false;
                        break;
                    }
                }
            }
            if !all_found {
                warn!(
                    job_id = alloc.job_id,
                    "restore: a node for this job no longer exists; dropping its replay"
                );
                continue;
            }
            alloc.node_indices = indices;
            for &idx in &alloc.node_indices {
                domain.table.ensure_partition(idx, &alloc.partition, max_share);
            }
            // The persisted state carries the allocated-mem/allocated-cpus
            // bits from before the save; reset them so the charge below
            // actually lands on the freshly initialized node table instead
            // of being skipped as already-applied.
            alloc.state = AllocState::default();
            domain.table.add_job_to_nodes(alloc, false);
        }
    }

    /// §6 `state_save`.
    #[instrument(skip(self, dir))]
    pub fn state_save(&self, dir: &Path) -> Result<(), CoreError> {
        let config = self.config.read().unwrap();
        let jobs = self.jobs.lock().unwrap();
        let domain = self.nodes.read().unwrap();
        let node_summaries: Vec<NodeSummary> = domain
            .table
            .iter()
            .map(|n| NodeSummary {
                name: n.name.clone(),
                num_sockets: n.sockets,
            })
            .collect();
        persist::state_save(dir, &config, &jobs, &node_summaries)
    }

    /// §6 `state_restore`. Header mismatch or a missing state file are
    /// both treated as a clean start, per §4.F policy; other I/O or
    /// unpacking errors propagate.
    #[instrument(skip(self, dir))]
    pub fn state_restore(&self, dir: &Path) -> Result<(), CoreError> {
        let result = {
            let config = self.config.read().unwrap();
            persist::state_restore(dir, &config)
        };
        match result {
            Ok(decoded) => {
                *self.pending_restored_jobs.lock().unwrap() = decoded.jobs;
                *self.restore_previous.lock().unwrap() = Some((decoded.nodes, 0));
                Ok(())
            }
            Err(CoreError::PersistVersionMismatch) => {
                warn!("persisted state version mismatch on restore; starting clean");
                Ok(())
            }
            Err(CoreError::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no persisted state file found; starting clean");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// §6 `job_init`: accept the controller's live job ids as ground
    /// truth, resolving any jobs staged by `state_restore` against them.
    /// May run before or after `node_init`; either order completes the
    /// deferred replay once both have happened.
    pub fn job_init(&self, live_job_ids: &[u32]) {
        let pending = std::mem::take(&mut *self.pending_restored_jobs.lock().unwrap());
        if !pending.is_empty() {
            let resolved = persist::resolve_against_live_jobs(pending, live_job_ids);
            self.jobs.lock().unwrap().extend(resolved);
        }
        self.replay_restored_jobs();
    }

    /// A bitmap with every currently-known node set — a convenient default
    /// candidate set for callers that don't pre-filter.
    pub fn all_nodes_bitmap(&self) -> NodeBitmap {
        let domain = self.nodes.read().unwrap();
        let mut bm = NodeBitmap::new(domain.table.len());
        for i in 0..domain.table.len() {
            bm.set(i);
        }
        bm
    }

    /// §6 `job_test` / §4.D. For `SelectMode::RunNow`, this both selects
    /// and commits the placement (populating per-partition row occupancy
    /// and appending to the job list) as a side effect; `TestOnly` and
    /// `WillRun` only compute and return the would-be allocation.
    #[instrument(skip(self, job, candidates), fields(job_id = job.id))]
    pub fn job_test(
        &self,
        job: &Job,
        candidates: &NodeBitmap,
        mode: SelectMode,
    ) -> Result<JobAllocation, CoreError> {
        if mode == SelectMode::RunNow {
            let max_share = self.configured_max_share(&job.partition);
            let mut domain = self.nodes.write().unwrap();
            for idx in candidates.iter_ones() {
                domain.table.ensure_partition(idx, &job.partition, max_share);
            }
        }

        let mut alloc = {
            let domain = self.nodes.read().unwrap();
            selector::job_test(&domain.table, candidates, job, mode)?
        };

        if mode == SelectMode::RunNow {
            {
                let mut domain = self.nodes.write().unwrap();
                domain.table.add_job_to_nodes(&mut alloc, false);
            }
            self.jobs.lock().unwrap().push(alloc.clone());
            info!(job_id = job.id, nhosts = alloc.nhosts(), "job placed and committed");
        }

        Ok(alloc)
    }

    /// §6 `job_begin`: lifecycle notification that a placed job has
    /// actually started. Stamps `new_job_time` on its nodes.
    pub fn job_begin(&self, job_id: u32) -> Result<(), CoreError> {
        let hosts = {
            let jobs = self.jobs.lock().unwrap();
            jobs.iter()
                .find(|a| a.job_id == job_id)
                .ok_or_else(|| CoreError::Invalid(format!("unknown job {job_id}")))?
                .hosts
                .clone()
        };
        let now = now_marker();
        let mut domain = self.nodes.write().unwrap();
        for host in &hosts {
            if let Some(idx) = domain.table.find_by_name(host) {
                domain.table.get_mut(idx).new_job_time = now;
            }
        }
        Ok(())
    }

    /// §6 `job_ready`: lifecycle notification, no state change beyond
    /// validating the job is still known to the core.
    pub fn job_ready(&self, job_id: u32) -> Result<(), CoreError> {
        let jobs = self.jobs.lock().unwrap();
        if jobs.iter().any(|a| a.job_id == job_id) {
            Ok(())
        } else {
            Err(CoreError::Invalid(format!("unknown job {job_id}")))
        }
    }

    /// §6 `job_fini`: tear down a job's allocation entirely (cpu rows and
    /// memory both released) and remove it from the job list.
    #[instrument(skip(self))]
    pub fn job_fini(&self, job_id: u32) -> Result<(), CoreError> {
        let mut alloc = {
            let mut jobs = self.jobs.lock().unwrap();
            let pos = jobs
                .iter()
                .position(|a| a.job_id == job_id)
                .ok_or_else(|| CoreError::Invalid(format!("unknown job {job_id}")))?;
            jobs.remove(pos)
        };
        let mut domain = self.nodes.write().unwrap();
        let underflowed = domain.table.rm_job_from_nodes(&mut alloc, true);
        for name in underflowed {
            tracing::error!(job_id, node = %name, "accounting underflow on job_fini");
        }
        Ok(())
    }

    /// §6 `job_suspend`: release cpu rows, keep memory charged.
    #[instrument(skip(self))]
    pub fn job_suspend(&self, job_id: u32) -> Result<(), CoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let alloc = jobs
            .iter_mut()
            .find(|a| a.job_id == job_id)
            .ok_or_else(|| CoreError::Invalid(format!("unknown job {job_id}")))?;
        let mut domain = self.nodes.write().unwrap();
        let underflowed = domain.table.rm_job_from_nodes(alloc, false);
        for name in underflowed {
            tracing::error!(job_id, node = %name, "accounting underflow on suspend");
        }
        Ok(())
    }

    /// §6 `job_resume`: re-add cpu rows on the job's existing nodes.
    /// Rejected with `NodesBusy` if another job has since taken the room.
    #[instrument(skip(self))]
    pub fn job_resume(&self, job_id: u32) -> Result<(), CoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let alloc = jobs
            .iter_mut()
            .find(|a| a.job_id == job_id)
            .ok_or_else(|| CoreError::Invalid(format!("unknown job {job_id}")))?;
        let mut domain = self.nodes.write().unwrap();
        for (i, &idx) in alloc.node_indices.iter().enumerate() {
            if !domain
                .table
                .row_has_room(idx, &alloc.partition, alloc.node_offset[i], &alloc.alloc_cores[i])
            {
                return Err(CoreError::NodesBusy);
            }
        }
        domain.table.add_job_to_nodes(alloc, false);
        Ok(())
    }

    /// §6 `update_nodeinfo`: apply a recovered allocation the controller
    /// built out-of-band (e.g. while reattaching to a running job).
    pub fn update_nodeinfo(&self, mut alloc: JobAllocation) -> Result<(), CoreError> {
        let max_share = self.configured_max_share(&alloc.partition);
        let mut domain = self.nodes.write().unwrap();
        let mut indices = Vec::with_capacity(alloc.hosts.len());
        for host in &alloc.hosts {
            let idx = domain
                .table
                .find_by_name(host)
                .ok_or_else(|| CoreError::Invalid(format!("unknown node {host}")))?;
            domain.table.ensure_partition(idx, &alloc.partition, max_share);
            indices.push(idx);
        }
        alloc.node_indices = indices;
        domain.table.add_job_to_nodes(&mut alloc, false);
        drop(domain);
        self.jobs.lock().unwrap().push(alloc);
        Ok(())
    }

    /// §6 `get_extra_jobinfo`.
    pub fn get_extra_jobinfo(&self, node_name: &str, job_id: u32, key: ExtraJobInfoKey) -> Option<u32> {
        let jobs = self.jobs.lock().unwrap();
        let alloc = jobs.iter().find(|a| a.job_id == job_id)?;
        let pos = alloc.hosts.iter().position(|h| h == node_name)?;
        match key {
            ExtraJobInfoKey::AllocCpus => Some(alloc.alloc_cpus[pos]),
        }
    }

    /// §6 `get_select_nodeinfo`.
    pub fn get_select_nodeinfo(&self, node_name: &str, key: SelectNodeInfoKey) -> Option<u32> {
        let domain = self.nodes.read().unwrap();
        let idx = domain.table.find_by_name(node_name)?;
        let node = domain.table.get(idx);
        let idle = node.count_idle_cpus("");
        match key {
            SelectNodeInfoKey::IdleCpus => Some(idle),
            SelectNodeInfoKey::AllocCpus => Some(node.cpus().saturating_sub(idle)),
        }
    }

    /// §6 `reconfigure`: swap in new configuration and resize the port
    /// table to match. Node tables are untouched — rebuilding them is the
    /// caller's job via a fresh `node_init`.
    pub fn reconfigure(&self, new_config: SelectConfig) {
        let node_count = self.nodes.read().unwrap().table.len();
        {
            let mut domain = self.nodes.write().unwrap();
            domain.ports = PortTable::new(new_config.port_min, new_config.port_max, node_count);
        }
        *self.config.write().unwrap() = new_config;
    }

    /// Builds the node bitmap covering `hosts`, for port (de)allocation.
    /// Takes the already-held node domain rather than its own lock so
    /// callers can build the bitmap and mutate the port table under one
    /// write guard.
    fn bitmap_for_hosts(domain: &NodesDomain, hosts: &[String]) -> NodeBitmap {
        let mut bm = NodeBitmap::new(domain.table.len());
        for h in hosts {
            if let Some(idx) = domain.table.find_by_name(h) {
                bm.set(idx);
            }
        }
        bm
    }

    /// §6 `step_layout_create` / §4.E.
    pub fn step_layout_create(
        &self,
        node_list: &[String],
        cpus: &[u32],
        cpu_groups: &[u32],
        num_tasks: u32,
        dist: Distribution,
        plane_size: u16,
    ) -> Result<StepLayout, CoreError> {
        step_layout::distribute_tasks(node_list, cpus, cpu_groups, num_tasks, dist, plane_size)
    }

    /// §6 `step_layout_destroy`: releases any port reservation still held
    /// by the layout.
    pub fn step_layout_destroy(&self, mut layout: StepLayout) {
        if !layout.resv_port_array.is_empty() {
            self.resv_port_free(&mut layout);
        }
    }

    pub fn step_layout_host_id(&self, layout: &StepLayout, tid: u32) -> Option<u32> {
        layout.host_id(tid)
    }

    pub fn step_layout_host_name<'a>(&self, layout: &'a StepLayout, tid: u32) -> Option<&'a str> {
        layout.host_name(tid)
    }

    /// §6 `resv_port_alloc` / §4.B.
    pub fn resv_port_alloc(&self, layout: &mut StepLayout, count: u16) -> Result<(), CoreError> {
        let mut domain = self.nodes.write().unwrap();
        let node_bitmap = Self::bitmap_for_hosts(&domain, &layout.node_list);
        let (text, ports) = domain.ports.alloc(count, &node_bitmap)?;
        layout.resv_ports = text;
        layout.resv_port_array = ports;
        Ok(())
    }

    /// §6 `resv_port_free` / §4.B.
    pub fn resv_port_free(&self, layout: &mut StepLayout) {
        let mut domain = self.nodes.write().unwrap();
        let node_bitmap = Self::bitmap_for_hosts(&domain, &layout.node_list);
        domain.ports.free(&layout.resv_port_array, &node_bitmap);
        layout.resv_port_array.clear();
        layout.resv_ports.clear();
    }
}

fn now_marker() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{McConstraints, McGranularity, Shared};

    fn config() -> SelectConfig {
        SelectConfig {
            port_min: 20000,
            port_max: 20009,
            ..SelectConfig::default()
        }
    }

    fn nodes(caps: &[(&str, u16)]) -> Vec<NodeRecord> {
        caps.iter()
            .map(|(name, cpus)| NodeRecord::new(*name, 1, *cpus, 1, 1 << 34))
            .collect()
    }

    fn job(id: u32, num_procs: u32, min_nodes: u32, max_nodes: u32) -> Job {
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

    #[test]
    fn new_rejects_descending_port_range() {
        let mut c = config();
        c.port_min = 30000;
        c.port_max = 29000;
        assert!(matches!(Core::new(c), Err(CoreError::Invalid(_))));
    }

    #[test]
    fn job_test_run_now_commits_and_job_fini_releases() {
        let core = Core::new(config()).unwrap();
        core.node_init(nodes(&[("n1", 4), ("n2", 4)])).unwrap();
        let candidates = core.all_nodes_bitmap();
        let j = job(1, 4, 1, 2);
        let alloc = core.job_test(&j, &candidates, SelectMode::RunNow).unwrap();
        assert!(alloc.nhosts() >= 1);

        // 4 single-cpu tasks land entirely on the first node (min_nodes=1
        // is already satisfied by its 4 cpus), so it is charged for all 4.
        assert_eq!(
            core.get_select_nodeinfo(&alloc.hosts[0], SelectNodeInfoKey::AllocCpus),
            Some(4)
        );

        core.job_fini(1).unwrap();
        assert!(core.job_fini(1).is_err());

        assert_eq!(
            core.get_select_nodeinfo(&alloc.hosts[0], SelectNodeInfoKey::AllocCpus),
            Some(0)
        );
    }

    #[test]
    fn suspend_retains_memory_resume_requires_room() {
        let core = Core::new(config()).unwrap();
        core.node_init(nodes(&[("n1", 4)])).unwrap();
        let candidates = core.all_nodes_bitmap();
        let mut j = job(1, 2, 1, 1);
        j.max_memory_per_job = 1024;
        core.job_test(&j, &candidates, SelectMode::RunNow).unwrap();

        core.job_suspend(1).unwrap();
        core.job_resume(1).unwrap();
    }

    #[test]
    fn unknown_job_lifecycle_calls_are_invalid() {
        let core = Core::new(config()).unwrap();
        core.node_init(nodes(&[("n1", 2)])).unwrap();
        assert!(matches!(core.job_ready(99), Err(CoreError::Invalid(_))));
        assert!(matches!(core.job_begin(99), Err(CoreError::Invalid(_))));
        assert!(matches!(core.job_suspend(99), Err(CoreError::Invalid(_))));
    }

    #[test]
    fn state_save_restore_round_trips_allocation() {
        let dir = std::env::temp_dir().join(format!(
            "cr_select_core_test_{:?}",
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&dir);

        let core = Core::new(config()).unwrap();
        core.node_init(nodes(&[("n1", 4), ("n2", 4)])).unwrap();
        let candidates = core.all_nodes_bitmap();
        let j = job(7, 4, 1, 2);
        core.job_test(&j, &candidates, SelectMode::RunNow).unwrap();
        core.state_save(&dir).unwrap();

        let core2 = Core::new(config()).unwrap();
        core2.state_restore(&dir).unwrap();
        core2.job_init(&[7]);
        core2.node_init(nodes(&[("n1", 4), ("n2", 4)])).unwrap();

        assert_eq!(
            core2.get_extra_jobinfo("n1", 7, ExtraJobInfoKey::AllocCpus),
            core.get_extra_jobinfo("n1", 7, ExtraJobInfoKey::AllocCpus),
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn restore_replay_completes_regardless_of_node_init_job_init_order() {
        let dir = std::env::temp_dir().join(format!(
            "cr_select_core_test_order_{:?}",
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&dir);

        let core = Core::new(config()).unwrap();
        core.node_init(nodes(&[("n1", 4), ("n2", 4)])).unwrap();
        let candidates = core.all_nodes_bitmap();
        let j = job(7, 4, 1, 2);
        core.job_test(&j, &candidates, SelectMode::RunNow).unwrap();
        let before = core.get_select_nodeinfo("n1", SelectNodeInfoKey::AllocCpus);
        core.state_save(&dir).unwrap();

        // Reverse of the order exercised by `state_save_restore_round_trips_allocation`:
        // node_init runs before job_init. The replay must still land once both
        // have happened, instead of being silently dropped.
        let restarted = Core::new(config()).unwrap();
        restarted.state_restore(&dir).unwrap();
        restarted.node_init(nodes(&[("n1", 4), ("n2", 4)])).unwrap();
        restarted.job_init(&[7]);

        assert_eq!(
            restarted.get_select_nodeinfo("n1", SelectNodeInfoKey::AllocCpus),
            before
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn step_layout_and_port_reservation_round_trip() {
        let core = Core::new(config()).unwrap();
        core.node_init(nodes(&[("n1", 4), ("n2", 4)])).unwrap();
        let mut layout = core
            .step_layout_create(
                &["n1".to_string(), "n2".to_string()],
                &[4, 4],
                &[1, 1],
                4,
                Distribution::Block,
                0,
            )
            .unwrap();
        core.resv_port_alloc(&mut layout, 2).unwrap();
        assert!(!layout.resv_ports.is_empty());
        core.resv_port_free(&mut layout);
        assert!(layout.resv_port_array.is_empty());
    }
}
