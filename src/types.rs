//src/types.rs

/// Partition identifier. `0` means the tag has not been assigned.
pub type PartitionId = u32;

pub const UNASSIGNED_PARTITION: PartitionId = 0;

/// A minimal representation of a read, as handed over by an external parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Read {
    pub name: String,
    pub sequence: String,
    pub quality: Option<String>,
}

impl Read {
    pub fn new(name: impl Into<String>, sequence: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sequence: sequence.into(),
            quality: None,
        }
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = Some(quality.into());
        self
    }

    /// Copy of this read cut down to its first `len` bases (quality included).
    pub fn truncated(&self, len: usize) -> Read {
        let cut = |s: &str| s.get(..len.min(s.len())).unwrap_or(s).to_string();
        Read {
            name: self.name.clone(),
            sequence: cut(&self.sequence),
            quality: self.quality.as_deref().map(cut),
        }
    }
}

/// One line of the abundance distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct AbundanceRow {
    pub abundance: u64,
    pub count: u64,
    pub cumulative: u64,
    /// `cumulative / total`, rounded to three decimals.
    pub fraction: f64,
}

/// One line of the per-read abundance report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadAbundance {
    pub name: String,
    pub median: u64,
    pub average: f64,
    pub stddev: f64,
    pub length: usize,
}

impl ReadAbundance {
    /// `name median average stddev length`
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {:?} {:?} {}",
            self.name, self.median, self.average, self.stddev, self.length
        )
    }
}
