//src/partition/mod.rs

mod partition_map;
mod subset;
mod union_find;

pub use partition_map::PartitionMap;
pub use subset::{PartitionEngine, Traversal, TraversalLimits};
pub use union_find::UnionFind;

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::io::BatchReport;

// ---------------------------------------------------------------------------
//  Sharded driver
// ---------------------------------------------------------------------------

/// Split `n` items into at most `n_shards` contiguous, disjoint ranges.
pub fn shard_ranges(n: usize, n_shards: usize) -> Vec<std::ops::Range<usize>> {
    let n_shards = n_shards.max(1);
    let chunk = n.div_ceil(n_shards).max(1);
    (0..n).step_by(chunk).map(|s| s..(s + chunk).min(n)).collect()
}

fn progress_bar(len: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    if let Ok(style) =
        ProgressStyle::default_bar().template("{spinner:.blue} [{bar:40}] {pos}/{len} shards {msg}")
    {
        pb.set_style(style);
    }
    pb
}

impl PartitionEngine<'_> {
    /// Partition all tags in `n_shards` parallel shards and merge the result.
    pub fn partition_parallel(&self, n_shards: usize) -> Result<PartitionMap> {
        let ranges = shard_ranges(self.tags_sorted().len(), n_shards);
        let pb = progress_bar(ranges.len() as u64, self.config().show_progress);
        pb.set_message("partitioning");

        let shards: Vec<PartitionMap> = ranges
            .into_par_iter()
            .map(|range| {
                let shard = self.subset_partition(range);
                pb.inc(1);
                shard
            })
            .collect();

        let merged = merge_partitions(self.table().ksize(), self.tags_sorted(), &shards)?;
        let (n_partitions, n_unassigned) = merged.count_partitions();
        pb.finish_with_message(format!("{n_partitions} partitions"));
        log::info!(
            "Partitioned {} tags in {} shards: {} partitions, {} unassigned, {} truncated traversals",
            self.tags_sorted().len(),
            shards.len(),
            n_partitions,
            n_unassigned,
            merged.n_truncated()
        );
        Ok(merged)
    }
}

// ---------------------------------------------------------------------------
//  Merging
// ---------------------------------------------------------------------------

/// Union shard maps over the full tag universe and renumber densely.
///
/// The result doesn't depend on the order of `shards`.
pub fn merge_partitions(ksize: u8, tags: &[u64], shards: &[PartitionMap]) -> Result<PartitionMap> {
    let mut merged = PartitionMap::new(ksize);
    for &tag in tags {
        merged.register_tag(tag);
    }
    for shard in shards {
        merged.merge_from(shard)?;
    }
    merged.compact();
    merged.set_merged();
    Ok(merged)
}

/// `(n_partitions, n_unassigned_tags)` of a map.
pub fn count_partitions(map: &PartitionMap) -> (usize, usize) {
    map.count_partitions()
}

/// Load shard files and merge them. Corrupt files are skipped and listed
/// in the report; a k-mer size mismatch fails the whole batch.
pub fn load_and_merge_shard_files<P: AsRef<Path>>(
    paths: &[P],
    ksize: u8,
    tags: &[u64],
) -> Result<(PartitionMap, BatchReport)> {
    let mut report = BatchReport::default();
    let mut shards = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        match PartitionMap::load(path, ksize) {
            Ok(map) => {
                shards.push(map);
                report.loaded.push(path.to_path_buf());
            }
            Err(e @ Error::Format { .. }) => {
                log::warn!("Skipping partition map {}: {}", path.display(), e);
                report.failed.push((PathBuf::from(path), e));
            }
            Err(e) => return Err(e),
        }
    }
    let merged = merge_partitions(ksize, tags, &shards)?;
    log::info!(
        "Merged {} partition map files ({} skipped)",
        report.loaded.len(),
        report.failed.len()
    );
    Ok((merged, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PartitionConfig, TableConfig};
    use crate::hashbits::PresenceTable;
    use crate::kmer::canonical_kmers;

    fn random_seq(len: usize, mut state: u64) -> Vec<u8> {
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                b"ACGT"[(state >> 32) as usize % 4]
            })
            .collect()
    }

    /// 99 reads of 100 bp, each sharing exactly 19 bp with the next: the
    /// junctions are edges of the K=20 graph but not of the K=21 one.
    fn overlapping_reads() -> Vec<Vec<u8>> {
        let genome = random_seq(98 * 81 + 100, 0x5eed);
        (0..99).map(|i| genome[i * 81..i * 81 + 100].to_vec()).collect()
    }

    fn graph(k: u8, reads: &[Vec<u8>]) -> PresenceTable {
        let table = PresenceTable::new(&TableConfig::new(k, 4, 1_000_000), Some(40)).unwrap();
        for r in reads {
            table.consume_sequence_and_tag(r);
        }
        table
    }

    #[test]
    fn test_shard_ranges_cover_everything() {
        let ranges = shard_ranges(10, 3);
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);
        assert_eq!(shard_ranges(2, 8), vec![0..1, 1..2]);
        assert!(shard_ranges(0, 4).is_empty());
    }

    #[test]
    fn test_overlap_of_k_minus_one_connects() {
        let _ = env_logger::builder().is_test(true).try_init();
        let reads = overlapping_reads();
        let table = graph(20, &reads);
        let engine = PartitionEngine::new(&table, PartitionConfig::default()).unwrap();
        let map = engine.partition_parallel(4).unwrap();
        assert_eq!(count_partitions(&map), (1, 0));
    }

    #[test]
    fn test_shorter_overlap_separates() {
        let reads = overlapping_reads();
        let table = graph(21, &reads);
        let engine = PartitionEngine::new(&table, PartitionConfig::default()).unwrap();
        let map = engine.partition_parallel(4).unwrap();
        assert_eq!(count_partitions(&map), (99, 0));
    }

    #[test]
    fn test_stop_tag_splits_path() {
        let seq = random_seq(100, 99);
        let table = graph(20, &[seq.clone()]);
        let kmers: Vec<u64> = canonical_kmers(&seq, 20).collect();
        let tagged: Vec<usize> = (0..kmers.len())
            .filter(|&i| table.tags().contains(kmers[i]))
            .collect();
        assert!(tagged.len() >= 2);

        let engine = PartitionEngine::new(&table, PartitionConfig::default()).unwrap();
        assert_eq!(engine.partition_parallel(1).unwrap().count_partitions(), (1, 0));

        let cut = (tagged[0] + tagged[1]) / 2;
        table.add_stop_tag(kmers[cut]);
        let engine = PartitionEngine::new(&table, PartitionConfig::default()).unwrap();
        assert_eq!(engine.partition_parallel(1).unwrap().count_partitions(), (2, 0));
    }

    #[test]
    fn test_shard_count_does_not_change_result() {
        let genome = random_seq(3000, 4242);
        let reads: Vec<Vec<u8>> = vec![
            genome[..1200].to_vec(),
            genome[1000..2000].to_vec(),
            genome[2200..].to_vec(),
        ];
        let table = graph(20, &reads);
        let engine = PartitionEngine::new(&table, PartitionConfig::default()).unwrap();
        let one = engine.partition_parallel(1).unwrap();
        let many = engine.partition_parallel(7).unwrap();
        assert_eq!(one.assignments(), many.assignments());
        assert_eq!(one.count_partitions(), (2, 0));
    }

    #[test]
    fn test_merge_is_order_independent() {
        let reads = overlapping_reads();
        let table = graph(21, &reads[..10]);
        let engine = PartitionEngine::new(&table, PartitionConfig::default()).unwrap();
        let tags = engine.tags_sorted();
        let shards: Vec<PartitionMap> = shard_ranges(tags.len(), 3)
            .into_iter()
            .map(|r| engine.subset_partition(r))
            .collect();

        let forward = merge_partitions(21, tags, &shards).unwrap();
        let reversed: Vec<PartitionMap> = shards.iter().rev().cloned().collect();
        let backward = merge_partitions(21, tags, &reversed).unwrap();
        assert_eq!(forward.assignments(), backward.assignments());

        // merging in two steps gives the same relation
        let ab = merge_partitions(21, tags, &shards[..2]).unwrap();
        let abc = merge_partitions(21, tags, &[ab, shards[2].clone()]).unwrap();
        assert_eq!(abc.assignments(), forward.assignments());

        let wrong_k = PartitionMap::new(20);
        assert!(matches!(
            merge_partitions(21, tags, &[wrong_k]),
            Err(Error::KsizeMismatch { .. })
        ));
    }

    #[test]
    fn test_load_and_merge_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let reads = overlapping_reads();
        let table = graph(21, &reads[..4]);
        let engine = PartitionEngine::new(&table, PartitionConfig::default()).unwrap();
        let tags = engine.tags_sorted().to_vec();

        let mut paths = Vec::new();
        for (i, range) in shard_ranges(tags.len(), 2).into_iter().enumerate() {
            let path = dir.path().join(format!("shard{i}.pmap"));
            engine.subset_partition(range).save(&path).unwrap();
            paths.push(path);
        }
        let bad = dir.path().join("bad.pmap");
        std::fs::write(&bad, b"KHMR\x01\x05").unwrap();
        paths.push(bad);

        let (merged, report) = load_and_merge_shard_files(&paths, 21, &tags).unwrap();
        assert_eq!(report.loaded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(merged.count_partitions(), (4, 0));

        assert!(matches!(
            load_and_merge_shard_files(&paths[..1], 20, &tags),
            Err(Error::KsizeMismatch { .. })
        ));
    }
}
