//! Process-wide configuration for the selector core.
//!
//! Parsing a configuration *file* is out of scope; this struct is meant to
//! be populated programmatically by the embedding controller, optionally
//! as a sub-document of a larger YAML config when the `serde-config`
//! feature is enabled.

#[cfg_attr(feature = "serde-config", derive(serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrGranularity {
    Cpu,
    Core,
    Socket,
}

#[cfg_attr(feature = "serde-config", derive(serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrType {
    pub granularity: CrGranularity,
    pub with_memory: bool,
}

impl CrType {
    pub const fn new(granularity: CrGranularity, with_memory: bool) -> Self {
        Self {
            granularity,
            with_memory,
        }
    }

    /// Pack into the u16 on-disk representation used by the persistence
    /// header (low byte: granularity, bit 8: with_memory).
    pub fn to_u16(self) -> u16 {
        let g = match self.granularity {
            CrGranularity::Cpu => 0u16,
            CrGranularity::Core => 1u16,
            CrGranularity::Socket => 2u16,
        };
        g | if self.with_memory { 0x100 } else { 0 }
    }

    pub fn from_u16(raw: u16) -> Option<Self> {
        let granularity = match raw & 0xff {
            0 => CrGranularity::Cpu,
            1 => CrGranularity::Core,
            2 => CrGranularity::Socket,
            _ => return None,
        };
        Some(Self {
            granularity,
            with_memory: raw & 0x100 != 0,
        })
    }
}

#[cfg_attr(feature = "serde-config", derive(serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct SelectConfig {
    /// Consumable-resource accounting granularity.
    pub cr_type: CrType,
    /// Inclusive ephemeral port range reserved for step use.
    pub port_min: u16,
    pub port_max: u16,
    /// Default per-partition row count used when a partition has not
    /// configured `max_share` explicitly.
    pub default_num_rows: u16,
    /// Use configured (true) rather than measured (false) node resources.
    pub fast_schedule: bool,
    /// Plugin type tag embedded in the persistence header.
    pub plugin_type: String,
    /// Plugin version embedded in the persistence header.
    pub plugin_version: u32,
}

impl Default for SelectConfig {
    fn default() -> Self {
        Self {
            cr_type: CrType::new(CrGranularity::Core, true),
            port_min: 10000,
            port_max: 19999,
            default_num_rows: 1,
            fast_schedule: true,
            plugin_type: "select/cons_res".to_string(),
            plugin_version: 1,
        }
    }
}

/// On-disk format version. Bumped whenever the persisted byte layout
/// changes; a mismatch on restore is a clean start, never a migration.
pub const PERSIST_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cr_type_round_trips_through_u16() {
        for g in [CrGranularity::Cpu, CrGranularity::Core, CrGranularity::Socket] {
            for with_memory in [false, true] {
                let ct = CrType::new(g, with_memory);
                assert_eq!(CrType::from_u16(ct.to_u16()), Some(ct));
            }
        }
    }

    #[test]
    fn unknown_granularity_byte_rejected() {
        assert_eq!(CrType::from_u16(0x0007), None);
    }

    #[cfg(feature = "serde-config")]
    #[test]
    fn select_config_embeds_in_a_larger_yaml_document() {
        #[derive(serde::Deserialize)]
        struct ControllerConfig {
            cluster_name: String,
            select: SelectConfig,
        }

        let doc = "
cluster_name: prod1
select:
  cr_type:
    granularity: Core
    with_memory: true
  port_min: 10000
  port_max: 19999
  default_num_rows: 4
  fast_schedule: true
  plugin_type: select/cons_res
  plugin_version: 1
";
        let parsed: ControllerConfig = serde_yaml::from_str(doc).unwrap();
        assert_eq!(parsed.cluster_name, "prod1");
        assert_eq!(parsed.select.default_num_rows, 4);
        assert_eq!(parsed.select.cr_type.granularity, CrGranularity::Core);
    }
}
