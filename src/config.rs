//src/config.rs

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::kmer::check_ksize;

/// Default k-mer size.
pub const DEFAULT_KSIZE: u8 = 32;
/// Default number of hash tables.
pub const DEFAULT_N_TABLES: usize = 4;
/// Default (upper bound of the) per-table size.
pub const DEFAULT_MIN_TABLE_SIZE: u64 = 1_000_000;
/// Distinct k-mers between tags on a contiguous path.
pub const DEFAULT_TAG_DENSITY: u32 = 40;
/// Visited-node budget of a single partition traversal.
pub const DEFAULT_BIG_TRAVERSAL_CUTOFF: usize = 200;
/// Normalization coverage cutoff.
pub const DEFAULT_NORMALIZE_CUTOFF: u64 = 20;
/// Abundance filter cutoff.
pub const DEFAULT_FILTER_CUTOFF: u64 = 2;
pub const DEFAULT_MAX_FALSE_POSITIVE_RATE: f64 = 0.15;

/// Dimensions of a probabilistic table. Fixed once the table exists.
#[derive(Debug, Clone, PartialEq)]
pub struct TableConfig {
    pub ksize: u8,
    pub n_tables: usize,
    /// Each table gets a distinct prime at or below this size.
    pub min_table_size: u64,
    /// Only meaningful for counting tables.
    pub bigcount: bool,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            ksize: DEFAULT_KSIZE,
            n_tables: DEFAULT_N_TABLES,
            min_table_size: DEFAULT_MIN_TABLE_SIZE,
            bigcount: true,
        }
    }
}

impl TableConfig {
    pub fn new(ksize: u8, n_tables: usize, min_table_size: u64) -> Self {
        Self {
            ksize,
            n_tables,
            min_table_size,
            ..Self::default()
        }
    }

    pub fn with_bigcount(mut self, bigcount: bool) -> Self {
        self.bigcount = bigcount;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_ksize(self.ksize)?;
        if self.n_tables == 0 || self.n_tables > u8::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "n_tables must be in 1..=255, got {}",
                self.n_tables
            )));
        }
        if self.min_table_size < 2 {
            return Err(Error::InvalidConfig(format!(
                "table size must be at least 2, got {}",
                self.min_table_size
            )));
        }
        Ok(())
    }
}

/// Parameters for building a tagged graph from reads.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub table: TableConfig,
    /// `None` disables tagging; the table then only answers membership.
    pub tag_density: Option<u32>,
    pub max_false_positive_rate: f64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            table: TableConfig::default(),
            tag_density: Some(DEFAULT_TAG_DENSITY),
            max_false_positive_rate: DEFAULT_MAX_FALSE_POSITIVE_RATE,
        }
    }
}

impl GraphConfig {
    pub fn validate(&self) -> Result<()> {
        self.table.validate()?;
        if let Some(density) = self.tag_density {
            if density < 2 {
                return Err(Error::InvalidConfig(format!(
                    "tag density must be at least 2, got {density}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.max_false_positive_rate) {
            return Err(Error::InvalidConfig(format!(
                "max false positive rate must be in [0, 1], got {}",
                self.max_false_positive_rate
            )));
        }
        Ok(())
    }
}

/// Traversal limits for the partition engine.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Halt a traversal once it has visited `big_traversal_cutoff` nodes.
    pub stop_big_traversals: bool,
    pub big_traversal_cutoff: usize,
    /// Maximum breadth-first depth. Defaults to `2 * tag_density + 1`.
    pub max_breadth: Option<u32>,
    pub show_progress: bool,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            stop_big_traversals: true,
            big_traversal_cutoff: DEFAULT_BIG_TRAVERSAL_CUTOFF,
            max_breadth: None,
            show_progress: false,
        }
    }
}

impl PartitionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stop_big_traversals && self.big_traversal_cutoff == 0 {
            return Err(Error::InvalidConfig(
                "big traversal cutoff must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where and how often the normalizer snapshots its counting table.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    /// Snapshot every `interval` processed records.
    pub interval: u64,
}

#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    pub cutoff: u64,
    pub paired: bool,
    pub checkpoint: Option<CheckpointConfig>,
    /// Where to save the table (plus a continuation marker) when a record fails to parse.
    pub failed_path: Option<PathBuf>,
    /// Fail the run if the fraction of unparseable records exceeds this.
    pub max_failure_rate: Option<f64>,
    /// Leading records to skip, e.g. when resuming from a checkpoint.
    pub skip_records: u64,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            cutoff: DEFAULT_NORMALIZE_CUTOFF,
            paired: false,
            checkpoint: None,
            failed_path: None,
            max_failure_rate: None,
            skip_records: 0,
        }
    }
}

impl NormalizeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cutoff == 0 {
            return Err(Error::InvalidConfig("cutoff must be positive".to_string()));
        }
        if let Some(cp) = &self.checkpoint {
            if cp.interval == 0 {
                return Err(Error::InvalidConfig(
                    "checkpoint interval must be positive".to_string(),
                ));
            }
        }
        if let Some(rate) = self.max_failure_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(Error::InvalidConfig(format!(
                    "max failure rate must be in [0, 1], got {rate}"
                )));
            }
        }
        Ok(())
    }
}

/// Abundance trimming parameters.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub cutoff: u64,
    /// Only trim reads whose median abundance reaches `normalize_to`.
    pub variable_coverage: bool,
    pub normalize_to: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            cutoff: DEFAULT_FILTER_CUTOFF,
            variable_coverage: false,
            normalize_to: DEFAULT_NORMALIZE_CUTOFF,
        }
    }
}
