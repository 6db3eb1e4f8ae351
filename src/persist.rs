//! Component F: the persistence codec.
//!
//! Packs/unpacks the selector's state to a byte buffer with a four-field
//! header and deterministic, explicit-length-prefixed field ordering —
//! the lineage this crate comes from hand-rolls its own wire format
//! rather than reaching for a schema-driven serializer, and the exact
//! field order here is a correctness requirement (restore must read back
//! exactly what save wrote), not an implementation detail.

use std::fs;
use std::path::Path;

use tracing::warn;

use crate::config::{CrType, SelectConfig};
use crate::error::CoreError;
use crate::job::{AllocState, JobAllocation, McGranularity, NodeReq};

const STATE_FILE_NAME: &str = "cr_select_state.bin";

/// Appends length-prefixed fields to an in-memory buffer.
#[derive(Default)]
pub struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn pack_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn pack_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn pack_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn pack_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn pack_str(&mut self, s: &str) {
        self.pack_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn pack_u16_array(&mut self, arr: &[u16]) {
        self.pack_u32(arr.len() as u32);
        for &v in arr {
            self.pack_u16(v);
        }
    }

    pub fn pack_u32_array(&mut self, arr: &[u32]) {
        self.pack_u32(arr.len() as u32);
        for &v in arr {
            self.pack_u32(v);
        }
    }

    pub fn pack_u64_array(&mut self, arr: &[u64]) {
        self.pack_u32(arr.len() as u32);
        for &v in arr {
            self.pack_u64(v);
        }
    }

    pub fn pack_str_array(&mut self, arr: &[String]) {
        self.pack_u32(arr.len() as u32);
        for s in arr {
            self.pack_str(s);
        }
    }
}

/// Reads length-prefixed fields back out of a byte buffer.
pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or_else(|| CoreError::PersistCorrupt("length overflow".into()))?;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| CoreError::PersistCorrupt("buffer underrun".into()))?;
        self.pos = end;
        Ok(slice)
    }

    pub fn unpack_u8(&mut self) -> Result<u8, CoreError> {
        Ok(self.take(1)?[0])
    }

    pub fn unpack_u16(&mut self) -> Result<u16, CoreError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn unpack_u32(&mut self) -> Result<u32, CoreError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn unpack_u64(&mut self) -> Result<u64, CoreError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn unpack_str(&mut self) -> Result<String, CoreError> {
        let len = self.unpack_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CoreError::PersistCorrupt(format!("invalid utf8: {e}")))
    }

    pub fn unpack_u16_array(&mut self) -> Result<Vec<u16>, CoreError> {
        let len = self.unpack_u32()? as usize;
        (0..len).map(|_| self.unpack_u16()).collect()
    }

    pub fn unpack_u32_array(&mut self) -> Result<Vec<u32>, CoreError> {
        let len = self.unpack_u32()? as usize;
        (0..len).map(|_| self.unpack_u32()).collect()
    }

    pub fn unpack_u64_array(&mut self) -> Result<Vec<u64>, CoreError> {
        let len = self.unpack_u32()? as usize;
        (0..len).map(|_| self.unpack_u64()).collect()
    }

    pub fn unpack_str_array(&mut self) -> Result<Vec<String>, CoreError> {
        let len = self.unpack_u32()? as usize;
        (0..len).map(|_| self.unpack_str()).collect()
    }
}

fn node_req_to_u8(r: NodeReq) -> u8 {
    match r {
        NodeReq::Reserved => 0,
        NodeReq::OneRow => 1,
        NodeReq::Available => 2,
    }
}

fn node_req_from_u8(v: u8) -> Result<NodeReq, CoreError> {
    match v {
        0 => Ok(NodeReq::Reserved),
        1 => Ok(NodeReq::OneRow),
        2 => Ok(NodeReq::Available),
        _ => Err(CoreError::PersistCorrupt(format!("bad node_req tag {v}"))),
    }
}

fn granularity_to_u8(g: McGranularity) -> u8 {
    match g {
        McGranularity::Cpu => 0,
        McGranularity::Core => 1,
        McGranularity::Socket => 2,
    }
}

fn granularity_from_u8(v: u8) -> Result<McGranularity, CoreError> {
    match v {
        0 => Ok(McGranularity::Cpu),
        1 => Ok(McGranularity::Core),
        2 => Ok(McGranularity::Socket),
        _ => Err(CoreError::PersistCorrupt(format!("bad granularity tag {v}"))),
    }
}

/// Per-field packing of one [`JobAllocation`]. `node_bitmap` is persisted
/// as its `bit_fmt`-style range text plus bit count rather than the raw
/// words, matching the original on-disk convention.
fn pack_job(p: &mut Packer, alloc: &JobAllocation) {
    p.pack_u32(alloc.job_id);
    p.pack_u8(alloc.state.to_u8());
    p.pack_u32(alloc.nprocs);
    p.pack_u32(alloc.nhosts() as u32);
    p.pack_u8(node_req_to_u8(alloc.node_req));
    p.pack_str(&alloc.partition);
    p.pack_u8(granularity_to_u8(alloc.granularity));
    p.pack_str_array(&alloc.hosts);
    p.pack_u32_array(&alloc.cpus);
    p.pack_u32_array(&alloc.alloc_cpus);
    p.pack_u16_array(&alloc.node_offset);

    let has_sockets = alloc.granularity != McGranularity::Cpu;
    p.pack_u8(has_sockets as u8);
    if has_sockets {
        p.pack_u32(alloc.alloc_cores.len() as u32);
        for row in &alloc.alloc_cores {
            p.pack_u16_array(row);
        }
    }

    p.pack_u64_array(&alloc.alloc_memory);
    p.pack_str(&alloc.node_bitmap.fmt_ranges());
    p.pack_u32(alloc.node_bitmap.count_ones() as u32);
}

fn unpack_job(u: &mut Unpacker<'_>) -> Result<JobAllocation, CoreError> {
    let job_id = u.unpack_u32()?;
    let state = AllocState::from_u8(u.unpack_u8()?);
    let nprocs = u.unpack_u32()?;
    let _nhosts = u.unpack_u32()?;
    let node_req = node_req_from_u8(u.unpack_u8()?)?;
    let partition = u.unpack_str()?;
    let granularity = granularity_from_u8(u.unpack_u8()?)?;
    let hosts = u.unpack_str_array()?;
    let cpus = u.unpack_u32_array()?;
    let alloc_cpus = u.unpack_u32_array()?;
    let node_offset = u.unpack_u16_array()?;

    let has_sockets = u.unpack_u8()? != 0;
    let alloc_cores = if has_sockets {
        let rows = u.unpack_u32()? as usize;
        (0..rows).map(|_| u.unpack_u16_array()).collect::<Result<Vec<_>, _>>()?
    } else {
        vec![Vec::new(); hosts.len()]
    };

    let alloc_memory = u.unpack_u64_array()?;
    let _bitmap_text = u.unpack_str()?;
    let _bit_count = u.unpack_u32()?;

    Ok(JobAllocation {
        job_id,
        partition,
        granularity,
        state,
        nprocs,
        node_req,
        hosts,
        node_indices: Vec::new(),
        cpus,
        alloc_cpus,
        node_offset,
        alloc_cores,
        alloc_memory,
        node_bitmap: crate::bitmap::NodeBitmap::new(0),
    })
}

/// Node summary persisted alongside jobs: just enough to replay
/// allocations against a freshly re-initialized node table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSummary {
    pub name: String,
    pub num_sockets: u16,
}

/// Serialize the four-field header, the job list, and the node summary
/// array to a byte buffer.
pub fn encode_state(config: &SelectConfig, jobs: &[JobAllocation], nodes: &[NodeSummary]) -> Vec<u8> {
    let mut p = Packer::new();
    p.pack_str(&config.plugin_type);
    p.pack_u32(config.plugin_version);
    p.pack_u16(config.cr_type.to_u16());
    p.pack_u32(crate::config::PERSIST_VERSION);

    p.pack_u16(jobs.len() as u16);
    for job in jobs {
        pack_job(&mut p, job);
    }

    p.pack_u32(nodes.len() as u32);
    for n in nodes {
        p.pack_str(&n.name);
        p.pack_u16(n.num_sockets);
    }

    p.into_bytes()
}

pub struct DecodedState {
    pub jobs: Vec<JobAllocation>,
    pub nodes: Vec<NodeSummary>,
}

/// Decode a byte buffer previously written by [`encode_state`]. On header
/// mismatch, returns `PersistVersionMismatch` — the caller treats this as
/// a clean start, never a migration.
pub fn decode_state(config: &SelectConfig, buf: &[u8]) -> Result<DecodedState, CoreError> {
    let mut u = Unpacker::new(buf);
    let plugin_type = u.unpack_str()?;
    let plugin_version = u.unpack_u32()?;
    let cr_type_raw = u.unpack_u16()?;
    let persist_version = u.unpack_u32()?;

    let header_ok = plugin_type == config.plugin_type
        && plugin_version == config.plugin_version
        && cr_type_raw == config.cr_type.to_u16()
        && persist_version == crate::config::PERSIST_VERSION;
    if !header_ok {
        return Err(CoreError::PersistVersionMismatch);
    }

    let job_count = u.unpack_u16()?;
    let mut jobs = Vec::with_capacity(job_count as usize);
    for _ in 0..job_count {
        jobs.push(unpack_job(&mut u)?);
    }

    let node_count = u.unpack_u32()?;
    let mut nodes = Vec::with_capacity(node_count as usize);
    for _ in 0..node_count {
        let name = u.unpack_str()?;
        let num_sockets = u.unpack_u16()?;
        nodes.push(NodeSummary { name, num_sockets });
    }

    Ok(DecodedState { jobs, nodes })
}

/// Filter the decoded job list against the controller's live job ids.
/// Unresolved jobs are dropped with a warning, matching the "state is
/// advisory" restore policy.
pub fn resolve_against_live_jobs(jobs: Vec<JobAllocation>, live_job_ids: &[u32]) -> Vec<JobAllocation> {
    jobs.into_iter()
        .filter(|j| {
            let known = live_job_ids.contains(&j.job_id);
            if !known {
                warn!(job_id = j.job_id, "dropping unresolved job on restore");
            }
            known
        })
        .collect()
}

/// §4.F / §9 `_cr_find_prev_node`: locate `name` in `previous`, assuming
/// `previous` and the caller's iteration over live nodes are both in a
/// mostly-matching order. `cursor` is advanced one-ahead each call so
/// repeated lookups in matched order are near-O(1); a full linear
/// fallback (wrapping from `cursor`) handles the unmatched case.
pub fn find_prev_node<'a>(
    previous: &'a [NodeSummary],
    name: &str,
    cursor: &mut usize,
) -> Option<&'a NodeSummary> {
    if previous.is_empty() {
        return None;
    }
    let n = previous.len();
    for offset in 0..n {
        let i = (*cursor + offset) % n;
        if previous[i].name == name {
            *cursor = (i + 1) % n;
            return Some(&previous[i]);
        }
    }
    None
}

pub fn state_save(dir: &Path, config: &SelectConfig, jobs: &[JobAllocation], nodes: &[NodeSummary]) -> Result<(), CoreError> {
    let bytes = encode_state(config, jobs, nodes);
    fs::create_dir_all(dir)?;
    fs::write(dir.join(STATE_FILE_NAME), bytes)?;
    Ok(())
}

pub fn state_restore(dir: &Path, config: &SelectConfig) -> Result<DecodedState, CoreError> {
    let path = dir.join(STATE_FILE_NAME);
    let bytes = fs::read(path)?;
    decode_state(config, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::NodeBitmap;
    use crate::job::Shared;

    fn sample_job() -> JobAllocation {
        let mut bm = NodeBitmap::new(4);
        bm.set(0);
        bm.set(1);
        JobAllocation {
            job_id: 42,
            partition: "p".into(),
            granularity: McGranularity::Core,
            state: AllocState {
                allocated_mem: true,
                allocated_cpus: true,
            },
            nprocs: 2,
            node_req: NodeReq::Available,
            hosts: vec!["n1".into(), "n2".into()],
            node_indices: vec![0, 1],
            cpus: vec![4, 4],
            alloc_cpus: vec![2, 2],
            node_offset: vec![0, 1],
            alloc_cores: vec![vec![2, 0], vec![0, 2]],
            alloc_memory: vec![1024, 2048],
            node_bitmap: bm,
        }
    }

    #[test]
    fn packer_unpacker_round_trip_primitives() {
        let mut p = Packer::new();
        p.pack_u8(7);
        p.pack_u16(1000);
        p.pack_u32(70000);
        p.pack_u64(1 << 40);
        p.pack_str("hello");
        p.pack_u32_array(&[1, 2, 3]);
        let bytes = p.into_bytes();

        let mut u = Unpacker::new(&bytes);
        assert_eq!(u.unpack_u8().unwrap(), 7);
        assert_eq!(u.unpack_u16().unwrap(), 1000);
        assert_eq!(u.unpack_u32().unwrap(), 70000);
        assert_eq!(u.unpack_u64().unwrap(), 1 << 40);
        assert_eq!(u.unpack_str().unwrap(), "hello");
        assert_eq!(u.unpack_u32_array().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn job_round_trips_through_pack_unpack() {
        let job = sample_job();
        let mut p = Packer::new();
        pack_job(&mut p, &job);
        let bytes = p.into_bytes();
        let mut u = Unpacker::new(&bytes);
        let back = unpack_job(&mut u).unwrap();
        assert_eq!(back.job_id, job.job_id);
        assert_eq!(back.hosts, job.hosts);
        assert_eq!(back.alloc_cores, job.alloc_cores);
        assert_eq!(back.alloc_memory, job.alloc_memory);
    }

    #[test]
    fn s6_encode_decode_round_trip() {
        let config = SelectConfig::default();
        let jobs = vec![sample_job()];
        let nodes = vec![
            NodeSummary { name: "n1".into(), num_sockets: 2 },
            NodeSummary { name: "n2".into(), num_sockets: 2 },
        ];
        let bytes = encode_state(&config, &jobs, &nodes);
        let decoded = decode_state(&config, &bytes).unwrap();
        assert_eq!(decoded.jobs.len(), 1);
        assert_eq!(decoded.jobs[0].alloc_cores, jobs[0].alloc_cores);
        assert_eq!(decoded.nodes, nodes);
    }

    #[test]
    fn header_mismatch_is_version_mismatch() {
        let mut config = SelectConfig::default();
        let bytes = encode_state(&config, &[], &[]);
        config.plugin_version += 1;
        assert!(matches!(
            decode_state(&config, &bytes),
            Err(CoreError::PersistVersionMismatch)
        ));
    }

    #[test]
    fn unresolved_jobs_are_dropped() {
        let jobs = vec![sample_job()];
        let resolved = resolve_against_live_jobs(jobs, &[]);
        assert!(resolved.is_empty());
    }

    #[test]
    fn find_prev_node_cursor_advances_in_matched_order() {
        let previous = vec![
            NodeSummary { name: "n1".into(), num_sockets: 2 },
            NodeSummary { name: "n2".into(), num_sockets: 2 },
            NodeSummary { name: "n3".into(), num_sockets: 2 },
        ];
        let mut cursor = 0;
        assert_eq!(find_prev_node(&previous, "n1", &mut cursor).unwrap().name, "n1");
        assert_eq!(cursor, 1);
        assert_eq!(find_prev_node(&previous, "n2", &mut cursor).unwrap().name, "n2");
        assert_eq!(cursor, 2);
        // out-of-order lookup still finds it via wraparound scan
        assert_eq!(find_prev_node(&previous, "n1", &mut cursor).unwrap().name, "n1");
    }

    #[test]
    fn unused_alloc_state_is_used_to_avoid_warning() {
        let _ = Shared::Yes;
    }
}
