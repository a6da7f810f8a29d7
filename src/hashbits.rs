//src/hashbits.rs

use std::path::Path;
use std::sync::atomic::Ordering;

use crate::config::TableConfig;
use crate::error::{Error, Result};
use crate::hashtable::{CellKind, ProbabilisticTable};
use crate::io::{read_file, read_header, write_file, write_header, FileKind};
use crate::kmer::{canonical, canonical_str, kmer_mask, KmerIterator};
use crate::tags::KmerSet;

/// Bloom-filter style k-mer membership table ("hashbits").
///
/// Besides membership it answers de Bruijn neighbor queries and owns the
/// tag and stop-tag sets placed over the implicit graph.
pub struct PresenceTable {
    table: ProbabilisticTable,
    tag_density: Option<u32>,
    pub(crate) tags: KmerSet,
    pub(crate) stop_tags: KmerSet,
}

impl PresenceTable {
    /// `tag_density = None` disables tagging during ingestion.
    pub fn new(config: &TableConfig, tag_density: Option<u32>) -> Result<Self> {
        config.validate()?;
        let table = ProbabilisticTable::with_primes(
            config.ksize,
            config.n_tables,
            config.min_table_size,
            CellKind::Bit,
        )?;
        log::info!(
            "Created presence table k={}, sizes={:?}, tag density={:?}",
            config.ksize,
            table.sizes(),
            tag_density
        );
        Ok(Self::from_table(table, tag_density))
    }

    pub fn with_sizes(ksize: u8, sizes: &[u64], tag_density: Option<u32>) -> Result<Self> {
        let table = ProbabilisticTable::new(ksize, sizes, CellKind::Bit)?;
        Ok(Self::from_table(table, tag_density))
    }

    fn from_table(table: ProbabilisticTable, tag_density: Option<u32>) -> Self {
        Self {
            table,
            tag_density,
            tags: KmerSet::default(),
            stop_tags: KmerSet::default(),
        }
    }

    #[inline]
    pub fn ksize(&self) -> u8 {
        self.table.ksize()
    }

    pub fn sizes(&self) -> Vec<u64> {
        self.table.sizes()
    }

    pub fn table(&self) -> &ProbabilisticTable {
        &self.table
    }

    pub fn tag_density(&self) -> Option<u32> {
        self.tag_density
    }

    pub fn tagging_enabled(&self) -> bool {
        self.tag_density.is_some()
    }

    pub fn estimated_fp_rate(&self) -> f64 {
        self.table.estimated_fp_rate()
    }

    pub fn check_fp_rate(&self, max: f64) -> Result<f64> {
        self.table.check_fp_rate(max)
    }

    pub fn check_compatible(&self, other: &PresenceTable) -> Result<()> {
        self.table.check_compatible(&other.table)
    }

    // -----------------------------------------------------------------------
    //  Membership
    // -----------------------------------------------------------------------

    /// Set the k-mer's bit in every table. Returns `true` if any bit was
    /// previously clear, i.e. the k-mer was (probably) new.
    pub fn test_and_set(&self, kmer: u64) -> bool {
        let mut is_new = false;
        for t in self.table.tables() {
            let slot = t.slot(kmer);
            let bit = 1u8 << (slot % 8);
            let prev = t.byte((slot / 8) as usize).fetch_or(bit, Ordering::Relaxed);
            if prev & bit == 0 {
                is_new = true;
            }
        }
        is_new
    }

    #[inline]
    pub fn add(&self, kmer: u64) {
        self.test_and_set(kmer);
    }

    /// Present in every table.
    pub fn contains(&self, kmer: u64) -> bool {
        self.table.tables().iter().all(|t| {
            let slot = t.slot(kmer);
            t.byte((slot / 8) as usize).load(Ordering::Relaxed) & (1u8 << (slot % 8)) != 0
        })
    }

    pub fn contains_str(&self, kmer: &str) -> bool {
        canonical_str(kmer, self.ksize())
            .map(|code| self.contains(code))
            .unwrap_or(false)
    }

    /// Insert every valid k-mer of `seq`; returns how many were new.
    pub fn consume_sequence(&self, seq: &[u8]) -> usize {
        KmerIterator::new(seq, self.ksize())
            .filter(|km| self.test_and_set(km.canonical()))
            .count()
    }

    /// Canonical k-mers one base away in the de Bruijn graph that are
    /// present in the table, sorted ascending and deduplicated.
    ///
    /// With `filter_stop_tags`, stop tags are never returned.
    pub fn neighbors(&self, kmer: u64, filter_stop_tags: bool) -> Vec<u64> {
        let k = self.ksize();
        let mask = kmer_mask(k);
        let shift = 2 * (k as u32 - 1);

        let mut found = Vec::with_capacity(8);
        for base in 0..4u64 {
            let right = ((kmer << 2) | base) & mask;
            let left = (kmer >> 2) | (base << shift);
            for next in [canonical(right, k), canonical(left, k)] {
                if !self.contains(next) {
                    continue;
                }
                if filter_stop_tags && self.stop_tags.contains(next) {
                    continue;
                }
                found.push(next);
            }
        }
        found.sort_unstable();
        found.dedup();
        found
    }

    // -----------------------------------------------------------------------
    //  Tags and stop tags
    // -----------------------------------------------------------------------

    pub fn tags(&self) -> &KmerSet {
        &self.tags
    }

    pub fn stop_tags(&self) -> &KmerSet {
        &self.stop_tags
    }

    pub fn n_tags(&self) -> usize {
        self.tags.len()
    }

    pub fn add_tag(&self, kmer: u64) {
        self.tags.insert(kmer);
    }

    pub fn add_stop_tag(&self, kmer: u64) {
        self.stop_tags.insert(kmer);
    }

    /// Register a stop tag given as text. Fails on a malformed k-mer.
    pub fn add_stop_tag_str(&self, kmer: &str) -> Result<()> {
        let code = canonical_str(kmer, self.ksize()).ok_or_else(|| {
            Error::InvalidConfig(format!("{kmer:?} is not a valid {}-mer", self.ksize()))
        })?;
        self.add_stop_tag(code);
        Ok(())
    }

    // -----------------------------------------------------------------------
    //  Persistence of the bit arrays (tags persist separately)
    // -----------------------------------------------------------------------

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        write_file(path, |w| {
            write_header(w, FileKind::Presence, self.ksize())?;
            self.table.write_to(w, 0)
        })?;
        log::info!("Saved presence table to {}", path.display());
        Ok(())
    }

    /// Load the bit arrays. Tagging is configured by the caller; tags and
    /// stop tags are loaded with [`load_tagset`](Self::load_tagset) and
    /// [`load_stop_tags`](Self::load_stop_tags).
    pub fn load<P: AsRef<Path>>(path: P, tag_density: Option<u32>) -> Result<Self> {
        let path = path.as_ref();
        let table = read_file(path, |r| {
            let ksize = read_header(r, path, FileKind::Presence)?;
            let (table, _) = ProbabilisticTable::read_from(r, ksize, CellKind::Bit)?;
            Ok(table)
        })?;
        log::info!(
            "Loaded presence table from {}: k={}, sizes={:?}",
            path.display(),
            table.ksize(),
            table.sizes()
        );
        Ok(Self::from_table(table, tag_density))
    }
}
