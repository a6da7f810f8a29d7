// src/lib.rs
pub mod abundance;
pub mod config;
pub mod counting;
pub mod error;
pub mod filter;
pub mod hashbits;
pub mod hashtable;
pub mod io;
pub mod kmer;
pub mod normalize;
pub mod partition;
pub mod tags;
pub mod types;

use rayon::prelude::*;

pub use crate::abundance::{read_abundance, read_abundance_report, AbundanceHistogram};
pub use crate::config::{
    CheckpointConfig, FilterConfig, GraphConfig, NormalizeConfig, PartitionConfig, TableConfig,
};
pub use crate::counting::CountingTable;
pub use crate::error::{Error, Result};
pub use crate::filter::{filter_read, filter_stoptags};
pub use crate::hashbits::PresenceTable;
pub use crate::normalize::{Checkpoint, NormalizeStats, Normalizer};
pub use crate::partition::{
    count_partitions, load_and_merge_shard_files, merge_partitions, PartitionEngine, PartitionMap,
};
pub use crate::types::{PartitionId, Read};

/// A tagged graph together with the partitioning of its tags.
pub struct PartitionResults {
    pub graph: PresenceTable,
    pub partitions: PartitionMap,
}

impl PartitionResults {
    /// `(n_partitions, n_unassigned_tags)`
    pub fn count(&self) -> (usize, usize) {
        self.partitions.count_partitions()
    }

    /// Partition of each read, in input order.
    pub fn assign_reads(&self, reads: &[Read]) -> Result<Vec<Option<PartitionId>>> {
        reads
            .par_iter()
            .map(|r| {
                self.partitions
                    .partition_for_sequence(&self.graph, r.sequence.as_bytes())
            })
            .collect()
    }
}

/// Count every k-mer of `reads` into a fresh counting table, refusing the
/// result if the table came out too full to trust.
pub fn count_reads(reads: &[Read], config: &TableConfig, max_false_positive_rate: f64) -> Result<CountingTable> {
    let table = CountingTable::new(config)?;
    let n: usize = reads
        .par_iter()
        .map(|r| table.consume_sequence(r.sequence.as_bytes()))
        .sum();
    let fp = table.check_fp_rate(max_false_positive_rate)?;
    log::info!(
        "Counted {} k-mers from {} reads; estimated false positive rate {:.3}",
        n,
        reads.len(),
        fp
    );
    Ok(table)
}

/// Load `reads` into a presence table, tagging as configured.
pub fn build_graph(reads: &[Read], config: &GraphConfig) -> Result<PresenceTable> {
    config.validate()?;
    let graph = PresenceTable::new(&config.table, config.tag_density)?;
    let n_new = graph.consume_reads_parallel(reads);
    let fp = graph.check_fp_rate(config.max_false_positive_rate)?;
    log::info!(
        "Loaded {} reads: {} distinct k-mers, {} tags, estimated false positive rate {:.3}",
        reads.len(),
        n_new,
        graph.n_tags(),
        fp
    );
    Ok(graph)
}

/// Build the graph for `reads` and partition it in `n_shards` parallel shards.
pub fn do_partition(
    reads: &[Read],
    graph_config: &GraphConfig,
    partition_config: PartitionConfig,
    n_shards: usize,
) -> Result<PartitionResults> {
    let graph = build_graph(reads, graph_config)?;
    let partitions = PartitionEngine::new(&graph, partition_config)?.partition_parallel(n_shards)?;
    Ok(PartitionResults { graph, partitions })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_seq(len: usize, mut state: u64) -> String {
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                ['A', 'C', 'G', 'T'][(state >> 32) as usize % 4]
            })
            .collect()
    }

    fn graph_config(k: u8, size: u64) -> GraphConfig {
        GraphConfig {
            table: TableConfig::new(k, 4, size),
            ..Default::default()
        }
    }

    #[test]
    fn test_do_partition_two_loci() {
        let _ = env_logger::builder().is_test(true).try_init();
        let a = random_seq(600, 1);
        let b = random_seq(600, 2);
        let reads = vec![
            Read::new("a1", &a[..350]),
            Read::new("a2", &a[300..]),
            Read::new("b1", &b[..400]),
            Read::new("b2", &b[350..]),
        ];
        let results =
            do_partition(&reads, &graph_config(20, 1_000_000), PartitionConfig::default(), 3).unwrap();
        assert_eq!(results.count(), (2, 0));

        let assigned = results.assign_reads(&reads).unwrap();
        assert!(assigned.iter().all(|p| p.is_some()));
        assert_eq!(assigned[0], assigned[1]);
        assert_eq!(assigned[2], assigned[3]);
        assert_ne!(assigned[0], assigned[2]);

        // a graph built with another K can't answer for this map
        let other = build_graph(&reads, &graph_config(21, 1_000_000)).unwrap();
        let mismatched = PartitionResults {
            graph: other,
            partitions: results.partitions,
        };
        assert!(matches!(
            mismatched.assign_reads(&reads),
            Err(Error::KsizeMismatch { expected: 20, found: 21 })
        ));
    }

    #[test]
    fn test_undersized_graph_trips_fp_guard() {
        let reads: Vec<Read> = (0..20)
            .map(|i| Read::new(format!("r{i}"), random_seq(200, 100 + i)))
            .collect();
        assert!(matches!(
            build_graph(&reads, &graph_config(20, 1000)),
            Err(Error::FalsePositiveRate { .. })
        ));
        assert!(matches!(
            count_reads(&reads, &TableConfig::new(20, 4, 100), 0.15),
            Err(Error::FalsePositiveRate { .. })
        ));
    }

    #[test]
    fn test_count_reads() {
        let reads = vec![Read::new("r", "ACGTACGGTTAC"); 3];
        let table = count_reads(&reads, &TableConfig::new(8, 2, 10_000), 0.15).unwrap();
        assert_eq!(table.get_count_str("ACGTACGG"), 3);
    }
}
