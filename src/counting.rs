//src/counting.rs

use std::path::Path;
use std::sync::atomic::Ordering;

use ahash::AHashMap;
use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use crate::config::TableConfig;
use crate::error::{Error, Result};
use crate::hashtable::{CellKind, ProbabilisticTable};
use crate::io::{read_file, read_header, write_file, write_header, FileKind};
use crate::kmer::{canonical_str, KmerIterator};

/// Saturation value of a table cell.
pub const MAX_COUNT: u8 = u8::MAX;

/// Approximate k-mer abundance counter (count-min sketch over 8-bit cells).
///
/// With BigCount enabled, a k-mer whose cells are saturated in every table
/// gets an exact overflow entry, which from then on is authoritative.
pub struct CountingTable {
    table: ProbabilisticTable,
    use_bigcount: bool,
    bigcounts: Mutex<AHashMap<u64, u64>>,
}

impl CountingTable {
    pub fn new(config: &TableConfig) -> Result<Self> {
        config.validate()?;
        let table = ProbabilisticTable::with_primes(
            config.ksize,
            config.n_tables,
            config.min_table_size,
            CellKind::Counter,
        )?;
        log::info!(
            "Created counting table k={}, sizes={:?}, bigcount={}",
            config.ksize,
            table.sizes(),
            config.bigcount
        );
        Ok(Self::from_parts(table, config.bigcount))
    }

    /// Build with explicit table sizes.
    pub fn with_sizes(ksize: u8, sizes: &[u64], bigcount: bool) -> Result<Self> {
        let table = ProbabilisticTable::new(ksize, sizes, CellKind::Counter)?;
        Ok(Self::from_parts(table, bigcount))
    }

    fn from_parts(table: ProbabilisticTable, use_bigcount: bool) -> Self {
        Self {
            table,
            use_bigcount,
            bigcounts: Mutex::new(AHashMap::new()),
        }
    }

    #[inline]
    pub fn ksize(&self) -> u8 {
        self.table.ksize()
    }

    pub fn n_tables(&self) -> usize {
        self.table.n_tables()
    }

    pub fn sizes(&self) -> Vec<u64> {
        self.table.sizes()
    }

    pub fn use_bigcount(&self) -> bool {
        self.use_bigcount
    }

    pub fn table(&self) -> &ProbabilisticTable {
        &self.table
    }

    /// Number of k-mers with an exact overflow entry.
    pub fn n_overflow(&self) -> usize {
        self.bigcounts.lock().len()
    }

    pub fn estimated_fp_rate(&self) -> f64 {
        self.table.estimated_fp_rate()
    }

    pub fn check_fp_rate(&self, max: f64) -> Result<f64> {
        self.table.check_fp_rate(max)
    }

    pub fn check_compatible(&self, other: &CountingTable) -> Result<()> {
        self.table.check_compatible(&other.table)
    }

    // -----------------------------------------------------------------------
    //  Insertion
    // -----------------------------------------------------------------------

    /// Increment the count of one canonical k-mer.
    ///
    /// Safe to call from many threads: each cell is bumped atomically and
    /// clamps at [`MAX_COUNT`].
    pub fn count(&self, kmer: u64) {
        let mut n_full = 0;
        for t in self.table.tables() {
            let cell = t.byte(t.slot(kmer) as usize);
            let bumped = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                (v < MAX_COUNT).then(|| v + 1)
            });
            if bumped.is_err() {
                n_full += 1;
            }
        }

        if n_full == self.table.n_tables() && self.use_bigcount {
            let mut big = self.bigcounts.lock();
            let entry = big.entry(kmer).or_insert(MAX_COUNT as u64);
            *entry = entry.saturating_add(1);
        }
    }

    /// Count a k-mer given as text. Returns `false` if it isn't a valid k-mer.
    pub fn count_str(&self, kmer: &str) -> bool {
        match canonical_str(kmer, self.ksize()) {
            Some(code) => {
                self.count(code);
                true
            }
            None => false,
        }
    }

    /// Count every valid k-mer of `seq`; returns how many were counted.
    pub fn consume_sequence(&self, seq: &[u8]) -> usize {
        let mut n = 0;
        for km in KmerIterator::new(seq, self.ksize()) {
            self.count(km.canonical());
            n += 1;
        }
        n
    }

    // -----------------------------------------------------------------------
    //  Queries
    // -----------------------------------------------------------------------

    /// Estimated abundance of one canonical k-mer. Never under-estimates
    /// (barring lost concurrent updates).
    pub fn get_count(&self, kmer: u64) -> u64 {
        let min = self
            .table
            .tables()
            .iter()
            .map(|t| t.byte(t.slot(kmer) as usize).load(Ordering::Relaxed))
            .min()
            .unwrap_or(0);

        if min == MAX_COUNT && self.use_bigcount {
            if let Some(&big) = self.bigcounts.lock().get(&kmer) {
                return big;
            }
        }
        min as u64
    }

    /// Abundance of a k-mer given as text; `0` if it isn't a valid k-mer.
    pub fn get_count_str(&self, kmer: &str) -> u64 {
        canonical_str(kmer, self.ksize())
            .map(|code| self.get_count(code))
            .unwrap_or(0)
    }

    /// `(median, mean, stddev)` of the abundances of the read's k-mers.
    ///
    /// The median is the lower median (element `(n-1)/2` of the sorted
    /// estimates); the standard deviation is the population one. A read
    /// without valid k-mers gives `(0, 0.0, 0.0)`.
    pub fn median_count(&self, seq: &[u8]) -> (u64, f64, f64) {
        let mut counts: Vec<u64> = KmerIterator::new(seq, self.ksize())
            .map(|km| self.get_count(km.canonical()))
            .collect();
        if counts.is_empty() {
            return (0, 0.0, 0.0);
        }
        counts.sort_unstable();

        let n = counts.len() as f64;
        let median = counts[(counts.len() - 1) / 2];
        let mean = counts.iter().map(|&c| c as f64).sum::<f64>() / n;
        let variance = counts
            .iter()
            .map(|&c| {
                let d = c as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        (median, mean, variance.sqrt())
    }

    /// Length of the longest prefix of `seq` whose k-mers all have an
    /// abundance of at least `min_abundance`.
    ///
    /// Returns `0` if the first k-mer already fails, `seq.len()` if none do.
    /// Windows containing a non-ACGT base count as abundance zero.
    pub fn trim_on_abundance(&self, seq: &[u8], min_abundance: u64) -> usize {
        let k = self.ksize() as usize;
        if seq.len() < k {
            return 0;
        }
        let mut expected_pos = 0;
        for km in KmerIterator::new(seq, self.ksize()) {
            // a skipped window (invalid base) fails the threshold
            if km.pos != expected_pos || self.get_count(km.canonical()) < min_abundance {
                return if expected_pos == 0 { 0 } else { expected_pos + k - 1 };
            }
            expected_pos += 1;
        }
        if expected_pos + k - 1 < seq.len() {
            // trailing windows were invalid
            return if expected_pos == 0 { 0 } else { expected_pos + k - 1 };
        }
        seq.len()
    }

    // -----------------------------------------------------------------------
    //  Persistence
    // -----------------------------------------------------------------------

    /// Save cells, the BigCount flag and the overflow entries (sorted by k-mer).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        write_file(path, |w| {
            write_header(w, FileKind::Counting, self.ksize())?;
            self.table.write_to(w, self.use_bigcount as u8)?;

            let mut entries: Vec<(u64, u64)> =
                self.bigcounts.lock().iter().map(|(&k, &v)| (k, v)).collect();
            entries.sort_unstable();
            w.write_u64::<LE>(entries.len() as u64)?;
            for (kmer, count) in entries {
                w.write_u64::<LE>(kmer)?;
                w.write_u64::<LE>(count)?;
            }
            Ok(())
        })?;
        log::info!("Saved counting table to {}", path.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let loaded = read_file(path, |r| {
            let ksize = read_header(r, path, FileKind::Counting)?;
            let (table, flag) = ProbabilisticTable::read_from(r, ksize, CellKind::Counter)?;
            if flag > 1 {
                return Err(Error::format(path, format!("bad bigcount flag {flag}")));
            }
            let n_overflow = r.read_u64::<LE>()?;
            let mut bigcounts = AHashMap::new();
            for _ in 0..n_overflow {
                let kmer = r.read_u64::<LE>()?;
                let count = r.read_u64::<LE>()?;
                bigcounts.insert(kmer, count);
            }
            Ok(Self {
                table,
                use_bigcount: flag == 1,
                bigcounts: Mutex::new(bigcounts),
            })
        })?;
        log::info!(
            "Loaded counting table from {}: k={}, sizes={:?}, {} overflow entries",
            path.display(),
            loaded.ksize(),
            loaded.sizes(),
            loaded.n_overflow()
        );
        Ok(loaded)
    }
}
