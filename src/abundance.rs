//src/abundance.rs

use std::collections::BTreeMap;
use std::io::{self, Write};

use rayon::prelude::*;

use crate::counting::CountingTable;
use crate::error::Result;
use crate::hashbits::PresenceTable;
use crate::kmer::KmerIterator;
use crate::types::{AbundanceRow, Read, ReadAbundance};

/// Number of distinct k-mers observed at each abundance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AbundanceHistogram {
    counts: BTreeMap<u64, u64>,
}

impl AbundanceHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, abundance: u64) {
        *self.counts.entry(abundance).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &AbundanceHistogram) {
        for (&abundance, &n) in &other.counts {
            *self.counts.entry(abundance).or_insert(0) += n;
        }
    }

    /// Number of k-mers observed.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Histogram of the distinct k-mers of `reads`, each bucketed by its
    /// estimate in `table`.
    ///
    /// Distinctness is tracked in a presence table of the same dimensions,
    /// so a k-mer colliding in every tracker table is skipped.
    pub fn from_reads<'r, I>(table: &CountingTable, reads: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'r Read>,
    {
        let seen = PresenceTable::with_sizes(table.ksize(), &table.sizes(), None)?;
        let mut hist = Self::new();
        for read in reads {
            for km in KmerIterator::new(read.sequence.as_bytes(), table.ksize()) {
                let kmer = km.canonical();
                if seen.test_and_set(kmer) {
                    hist.observe(table.get_count(kmer));
                }
            }
        }
        Ok(hist)
    }

    /// Rows in ascending abundance. `skip_zero` drops the abundance-0 row
    /// without changing the totals the fractions are based on.
    pub fn rows(&self, skip_zero: bool) -> Vec<AbundanceRow> {
        let total = self.total();
        let mut cumulative = 0;
        let mut rows = Vec::with_capacity(self.counts.len());
        for (&abundance, &count) in &self.counts {
            cumulative += count;
            if skip_zero && abundance == 0 {
                continue;
            }
            let fraction = if total == 0 {
                0.0
            } else {
                (cumulative as f64 / total as f64 * 1000.0).round() / 1000.0
            };
            rows.push(AbundanceRow {
                abundance,
                count,
                cumulative,
                fraction,
            });
        }
        rows
    }

    /// `abundance count cumulative fraction`, one row per line.
    pub fn write_to<W: Write>(&self, w: &mut W, skip_zero: bool) -> io::Result<()> {
        w.write_all(self.to_text(skip_zero).as_bytes())
    }

    pub fn to_text(&self, skip_zero: bool) -> String {
        self.rows(skip_zero)
            .iter()
            .map(|row| format!("{} {} {} {:?}\n", row.abundance, row.count, row.cumulative, row.fraction))
            .collect()
    }
}

// ---------------------------------------------------------------------------
//  Per-read report
// ---------------------------------------------------------------------------

pub fn read_abundance(table: &CountingTable, read: &Read) -> ReadAbundance {
    let (median, average, stddev) = table.median_count(read.sequence.as_bytes());
    ReadAbundance {
        name: read.name.clone(),
        median,
        average,
        stddev,
        length: read.sequence.len(),
    }
}

/// One [`ReadAbundance`] per read, in input order.
pub fn read_abundance_report(table: &CountingTable, reads: &[Read]) -> Vec<ReadAbundance> {
    reads.par_iter().map(|r| read_abundance(table, r)).collect()
}
