//! Component B: the port reservation table.
//!
//! A per-port bitmap over node-table indices. Ports are allocated
//! round-robin from a saved cursor and released when their owning step
//! ends.

use crate::bitmap::NodeBitmap;
use crate::error::CoreError;

/// `ports=<min>-<max>` configuration plus the live allocation bitmaps.
pub struct PortTable {
    min: u16,
    max: u16,
    /// One bitmap per port in `[min, max]`, indexed from 0.
    table: Vec<NodeBitmap>,
    node_count: usize,
    /// Round-robin cursor, spread across the range to avoid immediately
    /// reusing a just-freed port.
    cursor: usize,
}

impl PortTable {
    /// §6/§4.B `resv_port_config`: parse `ports=<min>-<max>` and
    /// (re)allocate the table.
    pub fn from_spec(spec: &str, node_count: usize) -> Result<Self, CoreError> {
        let range = spec
            .strip_prefix("ports=")
            .ok_or_else(|| CoreError::Invalid(format!("expected 'ports=min-max', got {spec}")))?;
        let (min_s, max_s) = range
            .split_once('-')
            .ok_or_else(|| CoreError::Invalid(format!("expected 'min-max' range, got {range}")))?;
        let min: u16 = min_s
            .parse()
            .map_err(|_| CoreError::Invalid(format!("bad port min: {min_s}")))?;
        let max: u16 = max_s
            .parse()
            .map_err(|_| CoreError::Invalid(format!("bad port max: {max_s}")))?;
        if max < min {
            return Err(CoreError::Invalid(format!(
                "descending port range {min}-{max}"
            )));
        }
        Ok(Self::new(min, max, node_count))
    }

    pub fn new(min: u16, max: u16, node_count: usize) -> Self {
        let count = (max as usize - min as usize) + 1;
        Self {
            min,
            max,
            table: (0..count).map(|_| NodeBitmap::new(node_count)).collect(),
            node_count,
            cursor: 0,
        }
    }

    pub fn port_count(&self) -> usize {
        self.table.len()
    }

    /// §4.B `resv_port_alloc`. Scans round-robin from the saved cursor; a
    /// port is free for the step if its bitmap does not overlap the
    /// step's node bitmap. Returns the bracket-free canonical text form
    /// and the numeric port list.
    pub fn alloc(&mut self, count: u16, step_nodes: &NodeBitmap) -> Result<(String, Vec<u16>), CoreError> {
        if count == 0 {
            return Err(CoreError::Invalid("zero ports requested".into()));
        }
        if count as usize > self.table.len() {
            return Err(CoreError::PortsInvalid);
        }
        assert_eq!(step_nodes.len(), self.node_count);

        let n = self.table.len();
        let mut chosen = Vec::with_capacity(count as usize);
        let mut scanned = 0;
        let mut idx = self.cursor;
        while scanned < n && chosen.len() < count as usize {
            if self.table[idx].is_disjoint(step_nodes) {
                chosen.push(idx);
            }
            idx = (idx + 1) % n;
            scanned += 1;
        }

        if chosen.len() < count as usize {
            return Err(CoreError::PortsBusy);
        }

        for &idx in &chosen {
            self.table[idx].or_with(step_nodes);
        }
        self.cursor = (idx) % n;

        let ports: Vec<u16> = chosen.iter().map(|&i| self.min + i as u16).collect();
        let mut sorted_ports = ports.clone();
        sorted_ports.sort_unstable();
        Ok((render_port_ranges(&sorted_ports), sorted_ports))
    }

    /// §4.B `resv_port_free`. Clears the step's node bits from each of its
    /// ports. No underflow is possible — reservation only ORs in bits.
    pub fn free(&mut self, ports: &[u16], step_nodes: &NodeBitmap) {
        for &port in ports {
            if port < self.min || port > self.max {
                continue;
            }
            let idx = (port - self.min) as usize;
            self.table[idx].and_not_with(step_nodes);
        }
    }

    pub fn min(&self) -> u16 {
        self.min
    }

    pub fn max(&self) -> u16 {
        self.max
    }
}

/// Render a sorted port list as bracket-free comma/range text, e.g.
/// `"12345,12347-12349"`. Mandated directly per design note — no
/// bracket-then-strip step.
fn render_port_ranges(ports: &[u16]) -> String {
    let mut out = Vec::new();
    let mut i = 0;
    while i < ports.len() {
        let start = ports[i];
        let mut end = start;
        let mut j = i + 1;
        while j < ports.len() && ports[j] == end + 1 {
            end = ports[j];
            j += 1;
        }
        if end == start {
            out.push(start.to_string());
        } else {
            out.push(format!("{start}-{end}"));
        }
        i = j;
    }
    out.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bm(n: usize, bits: &[usize]) -> NodeBitmap {
        let mut b = NodeBitmap::new(n);
        for &i in bits {
            b.set(i);
        }
        b
    }

    #[test]
    fn from_spec_parses_range() {
        let t = PortTable::from_spec("ports=10000-10004", 3).unwrap();
        assert_eq!(t.min(), 10000);
        assert_eq!(t.max(), 10004);
        assert_eq!(t.port_count(), 5);
    }

    #[test]
    fn render_port_ranges_is_bracket_free() {
        assert_eq!(render_port_ranges(&[12345, 12347, 12348, 12349]), "12345,12347-12349");
    }

    #[test]
    fn s3_scenario_overlap_then_free() {
        let mut t = PortTable::new(10000, 10004, 3);
        let step1 = bm(3, &[0, 1]);
        let (text1, ports1) = t.alloc(2, &step1).unwrap();
        assert_eq!(text1, "10000-10001");

        let step2 = bm(3, &[1, 2]);
        let (text2, _) = t.alloc(2, &step2).unwrap();
        assert_eq!(text2, "10002-10003");

        let step3 = bm(3, &[0, 1]);
        assert!(matches!(t.alloc(2, &step3), Err(CoreError::PortsBusy)));

        t.free(&ports1, &step1);
        let (text3, _) = t.alloc(2, &step3).unwrap();
        assert!(!text3.is_empty());
    }

    #[test]
    fn request_exceeding_table_size_is_invalid() {
        let mut t = PortTable::new(10000, 10001, 2);
        let step = bm(2, &[0]);
        assert!(matches!(t.alloc(5, &step), Err(CoreError::PortsInvalid)));
    }
}
