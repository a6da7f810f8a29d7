//src/tags.rs
//
// Sparse waypoints ("tags") over the implicit de Bruijn graph of a
// PresenceTable, plus the stop tags that cut it.

use std::path::{Path, PathBuf};

use ahash::AHashSet;
use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::hashbits::PresenceTable;
use crate::io::{read_file, read_header, write_file, write_header, BatchReport, FileKind};
use crate::kmer::KmerIterator;
use crate::types::Read;

/// A concurrent set of canonical k-mer codes, used for both tags and stop tags.
#[derive(Default)]
pub struct KmerSet {
    inner: RwLock<AHashSet<u64>>,
}

impl KmerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the k-mer wasn't in the set yet.
    pub fn insert(&self, kmer: u64) -> bool {
        self.inner.write().insert(kmer)
    }

    #[inline]
    pub fn contains(&self, kmer: u64) -> bool {
        self.inner.read().contains(&kmer)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn extend<I: IntoIterator<Item = u64>>(&self, kmers: I) {
        self.inner.write().extend(kmers);
    }

    /// All members in ascending order.
    pub fn sorted(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.inner.read().iter().copied().collect();
        v.sort_unstable();
        v
    }
}

// ---------------------------------------------------------------------------
//  Tagging during ingestion
// ---------------------------------------------------------------------------

impl PresenceTable {
    /// Insert the read's k-mers and place tags so that no contiguous run of
    /// k-mers goes longer than the tag density without one.
    ///
    /// Returns the number of k-mers that were new to the table. With tagging
    /// disabled this is plain [`consume_sequence`](Self::consume_sequence).
    pub fn consume_sequence_and_tag(&self, seq: &[u8]) -> usize {
        let Some(density) = self.tag_density() else {
            return self.consume_sequence(seq);
        };
        let density = density as usize;
        let restart = density / 2 + 1;
        let tag_run_end = (density / 2).saturating_sub(1);

        let mut n_new = 0;
        let mut since = restart;
        let mut last: Option<(usize, u64)> = None;

        for km in KmerIterator::new(seq, self.ksize()) {
            let kmer = km.canonical();

            if let Some((prev_pos, prev_kmer)) = last {
                if km.pos != prev_pos + 1 {
                    // invalid bases broke the path
                    if since >= tag_run_end {
                        self.tags.insert(prev_kmer);
                    }
                    since = restart;
                }
            }

            if self.test_and_set(kmer) {
                n_new += 1;
                since += 1;
            } else if self.tags.contains(kmer) {
                since = 1;
            } else {
                since += 1;
            }

            if since >= density {
                self.tags.insert(kmer);
                since = 1;
            }
            last = Some((km.pos, kmer));
        }

        if let Some((_, prev_kmer)) = last {
            if since >= tag_run_end {
                self.tags.insert(prev_kmer);
            }
        }
        n_new
    }

    /// Tag and insert many reads at once. Cells are atomic and the tag set
    /// is locked, so reads may be ingested in any order.
    pub fn consume_reads_parallel(&self, reads: &[Read]) -> usize {
        reads
            .par_iter()
            .map(|r| self.consume_sequence_and_tag(r.sequence.as_bytes()))
            .sum()
    }

    /// Length of the prefix of `seq` that covers every k-mer before the
    /// first stop tag; `seq.len()` if there is none.
    pub fn trim_on_stoptags(&self, seq: &[u8]) -> usize {
        let k = self.ksize() as usize;
        for km in KmerIterator::new(seq, self.ksize()) {
            if self.stop_tags.contains(km.canonical()) {
                return km.pos + k - 1;
            }
        }
        seq.len()
    }

    // -----------------------------------------------------------------------
    //  Tagset / stoptags files
    // -----------------------------------------------------------------------

    /// `k`, tag density and the sorted tag codes.
    pub fn save_tagset<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let tags = self.tags.sorted();
        write_file(path, |w| {
            write_header(w, FileKind::Tagset, self.ksize())?;
            w.write_u32::<LE>(self.tag_density().unwrap_or(0))?;
            write_codes(w, &tags)
        })?;
        log::info!("Saved {} tags to {}", tags.len(), path.display());
        Ok(())
    }

    /// Merge a tagset file into this table's tags. Returns how many codes
    /// the file held.
    pub fn load_tagset<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let (ksize, density, codes) = read_file(path, |r| {
            let ksize = read_header(r, path, FileKind::Tagset)?;
            let density = r.read_u32::<LE>()?;
            Ok((ksize, density, read_codes(r)?))
        })?;
        self.check_ksize(ksize)?;
        if density != 0 && self.tag_density() != Some(density) {
            log::warn!(
                "{} was tagged at density {}, table uses {:?}",
                path.display(),
                density,
                self.tag_density()
            );
        }
        let n = codes.len();
        self.tags.extend(codes);
        log::info!("Loaded {} tags from {}", n, path.display());
        Ok(n)
    }

    pub fn save_stop_tags<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let stops = self.stop_tags.sorted();
        write_file(path, |w| {
            write_header(w, FileKind::Stoptags, self.ksize())?;
            write_codes(w, &stops)
        })?;
        log::info!("Saved {} stop tags to {}", stops.len(), path.display());
        Ok(())
    }

    /// Merge a stoptags file into this table's stop tags.
    pub fn load_stop_tags<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let (ksize, codes) = read_file(path, |r| {
            let ksize = read_header(r, path, FileKind::Stoptags)?;
            Ok((ksize, read_codes(r)?))
        })?;
        self.check_ksize(ksize)?;
        let n = codes.len();
        self.stop_tags.extend(codes);
        log::info!("Loaded {} stop tags from {}", n, path.display());
        Ok(n)
    }

    /// Load several stoptags files. A corrupt file is skipped and reported;
    /// a k-mer size mismatch aborts the batch.
    pub fn load_stop_tags_batch(&self, paths: &[PathBuf]) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for path in paths {
            match self.load_stop_tags(path) {
                Ok(_) => report.loaded.push(path.clone()),
                Err(e @ Error::Format { .. }) => {
                    log::warn!("Skipping stoptags file {}: {}", path.display(), e);
                    report.failed.push((path.clone(), e));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    fn check_ksize(&self, found: u8) -> Result<()> {
        if found != self.ksize() {
            return Err(Error::KsizeMismatch {
                expected: self.ksize(),
                found,
            });
        }
        Ok(())
    }
}

fn write_codes<W: std::io::Write + ?Sized>(w: &mut W, codes: &[u64]) -> Result<()> {
    w.write_u64::<LE>(codes.len() as u64)?;
    for &code in codes {
        w.write_u64::<LE>(code)?;
    }
    Ok(())
}

fn read_codes<R: std::io::Read + ?Sized>(r: &mut R) -> Result<Vec<u64>> {
    let n = r.read_u64::<LE>()?;
    let mut codes = Vec::new();
    for _ in 0..n {
        codes.push(r.read_u64::<LE>()?);
    }
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::kmer::canonical_kmers;

    fn random_seq(len: usize, mut state: u64) -> String {
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                b"ACGT"[(state >> 32) as usize % 4] as char
            })
            .collect()
    }

    fn graph(k: u8, density: Option<u32>) -> PresenceTable {
        PresenceTable::new(&TableConfig::new(k, 2, 1_000_000), density).unwrap()
    }

    #[test]
    fn test_short_read_gets_one_tag() {
        let ht = graph(20, Some(40));
        let seq = random_seq(30, 7);
        assert_eq!(ht.consume_sequence_and_tag(seq.as_bytes()), 11);
        assert_eq!(ht.n_tags(), 1);
    }

    #[test]
    fn test_tags_are_spaced_by_density() {
        let ht = graph(20, Some(40));
        let seq = random_seq(1000, 11);
        ht.consume_sequence_and_tag(seq.as_bytes());

        let kmers: Vec<u64> = canonical_kmers(seq.as_bytes(), 20).collect();
        let tagged: Vec<usize> = kmers
            .iter()
            .enumerate()
            .filter(|(_, k)| ht.tags().contains(**k))
            .map(|(i, _)| i)
            .collect();
        assert!(!tagged.is_empty());
        // no untagged stretch longer than the density
        assert!(tagged[0] < 40);
        for w in tagged.windows(2) {
            assert!(w[1] - w[0] <= 40);
        }
        assert!(kmers.len() - 1 - tagged[tagged.len() - 1] <= 40);
    }

    #[test]
    fn test_tagging_disabled() {
        let ht = graph(20, None);
        let seq = random_seq(500, 3);
        ht.consume_sequence_and_tag(seq.as_bytes());
        assert!(!ht.tagging_enabled());
        assert_eq!(ht.n_tags(), 0);
        assert!(ht.contains_str(&seq[..20]));
    }

    #[test]
    fn test_each_run_is_tagged() {
        let ht = graph(20, Some(40));
        let seq = format!("{}NNNN{}", random_seq(25, 5), random_seq(25, 9));
        ht.consume_sequence_and_tag(seq.as_bytes());
        assert_eq!(ht.n_tags(), 2);
    }

    #[test]
    fn test_parallel_ingestion_inserts_everything() {
        let ht = graph(20, Some(40));
        let reads: Vec<Read> = (0..50)
            .map(|i| Read::new(format!("r{i}"), random_seq(120, 100 + i)))
            .collect();
        ht.consume_reads_parallel(&reads);
        for r in &reads {
            for kmer in canonical_kmers(r.sequence.as_bytes(), 20) {
                assert!(ht.contains(kmer));
            }
        }
        assert!(ht.n_tags() >= reads.len());
    }

    #[test]
    fn test_trim_on_stoptags() {
        let ht = graph(18, Some(40));
        let long = "GGTTGACGGGGCTCAGGGGGCGGCTGACTCCGAGAGACAGC";
        ht.add_stop_tag_str("GTTGACGGGGCTCAGGGG").unwrap();
        // second k-mer is a stop tag -> only the first k-mer's span remains
        assert_eq!(ht.trim_on_stoptags(long.as_bytes()), 18);
        assert_eq!(ht.trim_on_stoptags(b"GGTTGACGGGGCTCAGGG"), 18);
        assert_eq!(ht.trim_on_stoptags(b"GTTGACGGGGCTCAGGGG"), 17);
    }

    #[test]
    fn test_tagset_and_stoptags_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ht = graph(20, Some(40));
        ht.consume_sequence_and_tag(random_seq(400, 21).as_bytes());
        ht.add_stop_tag(12345);
        ht.save_tagset(dir.path().join("g.tagset")).unwrap();
        ht.save_stop_tags(dir.path().join("g.stoptags.gz")).unwrap();

        let other = graph(20, Some(40));
        assert_eq!(other.load_tagset(dir.path().join("g.tagset")).unwrap(), ht.n_tags());
        assert_eq!(other.tags().sorted(), ht.tags().sorted());
        other.load_stop_tags(dir.path().join("g.stoptags.gz")).unwrap();
        assert!(other.stop_tags().contains(12345));

        let wrong_k = graph(21, Some(40));
        assert!(matches!(
            wrong_k.load_tagset(dir.path().join("g.tagset")),
            Err(Error::KsizeMismatch { .. })
        ));
    }

    #[test]
    fn test_stoptags_batch_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let ht = graph(20, Some(40));
        ht.add_stop_tag(7);
        let good = dir.path().join("a.stoptags");
        let bad = dir.path().join("b.stoptags");
        ht.save_stop_tags(&good).unwrap();
        std::fs::write(&bad, b"garbage!").unwrap();

        let other = graph(20, Some(40));
        let report = other.load_stop_tags_batch(&[bad.clone(), good.clone()]).unwrap();
        assert_eq!(report.loaded, vec![good]);
        assert_eq!(report.failed.len(), 1);
        assert!(other.stop_tags().contains(7));
    }
}
