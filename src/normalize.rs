//src/normalize.rs
//
// Streaming digital normalization: keep a read only while the coverage of
// its k-mers, as seen so far, is below the cutoff.

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::NormalizeConfig;
use crate::counting::CountingTable;
use crate::error::{Error, Result};
use crate::types::Read;

/// A record the parser could not turn into a [`Read`].
#[derive(Debug, Clone, PartialEq)]
pub struct FailedRecord {
    /// Zero-based position in the input stream.
    pub index: u64,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizeStats {
    /// Reads that went through the keep/discard decision.
    pub processed: u64,
    pub kept: u64,
    pub discarded: u64,
    pub failed: u64,
    pub checkpoints: u64,
    pub failures: Vec<FailedRecord>,
}

// ---------------------------------------------------------------------------
//  Checkpoints
// ---------------------------------------------------------------------------

/// A counting table snapshot plus a marker recording how many input records
/// it covers.
pub struct Checkpoint;

impl Checkpoint {
    /// `<path>.marker`
    pub fn marker_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".marker");
        PathBuf::from(name)
    }

    /// Write the table and its marker. The table goes to a temporary file
    /// first so an interrupted save never clobbers the previous snapshot.
    pub fn save(table: &CountingTable, path: &Path, records_done: u64) -> Result<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!("tmp.{file_name}"));
        table.save(&tmp)?;
        fs::rename(&tmp, path)?;
        fs::write(Self::marker_path(path), format!("records_done\t{records_done}\n"))?;
        Ok(())
    }

    /// Reload a snapshot and the number of records it covers.
    pub fn load(path: &Path) -> Result<(CountingTable, u64)> {
        let table = CountingTable::load(path)?;
        let marker_path = Self::marker_path(path);
        let marker = fs::read_to_string(&marker_path)?;
        let records_done = marker
            .trim_end()
            .strip_prefix("records_done\t")
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| Error::format(&marker_path, "malformed continuation marker"))?;
        Ok((table, records_done))
    }
}

// ---------------------------------------------------------------------------
//  Pairing
// ---------------------------------------------------------------------------

/// Whether `first` and `second` name the two mates of one pair, either as
/// `name/1` + `name/2` or Casava 1.8 style `name 1:...` + `name 2:...`.
pub fn is_pair(first: &str, second: &str) -> bool {
    if let (Some(a), Some(b)) = (first.strip_suffix("/1"), second.strip_suffix("/2")) {
        return a == b;
    }
    match (first.split_once(' '), second.split_once(' ')) {
        (Some((a, rest_a)), Some((b, rest_b))) => {
            a == b && rest_a.starts_with("1:") && rest_b.starts_with("2:")
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
//  Normalizer
// ---------------------------------------------------------------------------

pub struct Normalizer<'a> {
    table: &'a CountingTable,
    config: NormalizeConfig,
}

impl<'a> Normalizer<'a> {
    pub fn new(table: &'a CountingTable, config: NormalizeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { table, config })
    }

    pub fn table(&self) -> &CountingTable {
        self.table
    }

    /// Median coverage of the read, before it is counted.
    fn coverage(&self, read: &Read) -> u64 {
        self.table.median_count(read.sequence.as_bytes()).0
    }

    /// Stream `records` through the filter, handing every kept read to
    /// `on_keep` in input order.
    ///
    /// Parse failures are logged, recorded and skipped. In paired mode a
    /// record that does not pair with its neighbor is fatal.
    pub fn run<I, E, F>(&self, records: I, mut on_keep: F) -> Result<NormalizeStats>
    where
        I: IntoIterator<Item = std::result::Result<Read, E>>,
        E: Display,
        F: FnMut(&Read) -> std::io::Result<()>,
    {
        let cutoff = self.config.cutoff;
        let mut stats = NormalizeStats::default();
        let mut position: u64 = 0;
        let mut since_checkpoint: u64 = 0;
        // first mate and its position, waiting for the second
        let mut pending: Option<(u64, Read)> = None;

        for record in records {
            let index = position;
            position += 1;
            if index < self.config.skip_records {
                continue;
            }

            let read = match record {
                Ok(read) => read,
                Err(e) => {
                    log::warn!("*** Skipping record {}: {}", index, e);
                    stats.failed += 1;
                    stats.failures.push(FailedRecord {
                        index,
                        message: e.to_string(),
                    });
                    if let Some(failed_path) = &self.config.failed_path {
                        // a waiting first mate isn't counted yet; resume from it
                        let records_done = pending.as_ref().map_or(position, |(i, _)| *i);
                        Checkpoint::save(self.table, failed_path, records_done)?;
                        log::info!("Saved counting table to {} after failure", failed_path.display());
                    }
                    continue;
                }
            };

            if self.config.paired {
                let first = match pending.take() {
                    None => {
                        pending = Some((index, read));
                        continue;
                    }
                    Some((_, first)) => first,
                };
                if !is_pair(&first.name, &read.name) {
                    return Err(Error::UnpairedRead { name: first.name });
                }
                stats.processed += 2;
                since_checkpoint += 2;
                if self.coverage(&first).min(self.coverage(&read)) < cutoff {
                    for mate in [&first, &read] {
                        self.table.consume_sequence(mate.sequence.as_bytes());
                        on_keep(mate)?;
                    }
                    stats.kept += 2;
                } else {
                    stats.discarded += 2;
                }
            } else {
                stats.processed += 1;
                since_checkpoint += 1;
                if self.coverage(&read) < cutoff {
                    self.table.consume_sequence(read.sequence.as_bytes());
                    on_keep(&read)?;
                    stats.kept += 1;
                } else {
                    stats.discarded += 1;
                }
            }

            if let Some(cp) = &self.config.checkpoint {
                if since_checkpoint >= cp.interval {
                    log::info!("Backup: saving k-mer counting table to {}", cp.path.display());
                    Checkpoint::save(self.table, &cp.path, position)?;
                    stats.checkpoints += 1;
                    since_checkpoint = 0;
                }
            }
        }

        if let Some((_, dangling)) = pending {
            return Err(Error::UnpairedRead { name: dangling.name });
        }

        if stats.processed == 0 {
            log::warn!("Nothing to normalize; no reads were processed");
        } else {
            log::info!(
                "Kept {} of {} reads ({:.1}%), {} unparseable records",
                stats.kept,
                stats.processed,
                100.0 * stats.kept as f64 / stats.processed as f64,
                stats.failed
            );
        }

        if let Some(max) = self.config.max_failure_rate {
            let total = stats.processed + stats.failed;
            if total > 0 && stats.failed as f64 / total as f64 > max {
                return Err(Error::FailureRate {
                    failed: stats.failed,
                    total,
                    max,
                });
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckpointConfig, TableConfig};

    const LONG: &str = "GGTTGACGGGGCTCAGGGGGCGGCTGACTCCGAGAGACAGC";
    const SHORT: &str = "GGTTGACGGGGCTCAGGG";

    fn table() -> CountingTable {
        CountingTable::new(&TableConfig::new(17, 4, 100_000)).unwrap()
    }

    fn corpus() -> Vec<std::result::Result<Read, String>> {
        let mut reads = vec![Ok(Read::new("long", LONG))];
        for i in 0..20 {
            reads.push(Ok(Read::new(format!("short{i}"), SHORT)));
        }
        reads
    }

    fn config(cutoff: u64) -> NormalizeConfig {
        NormalizeConfig {
            cutoff,
            ..Default::default()
        }
    }

    fn run(
        table: &CountingTable,
        config: NormalizeConfig,
        records: Vec<std::result::Result<Read, String>>,
    ) -> (Result<NormalizeStats>, Vec<Read>) {
        let mut kept = Vec::new();
        let stats = Normalizer::new(table, config).unwrap().run(records, |r| {
            kept.push(r.clone());
            Ok(())
        });
        (stats, kept)
    }

    #[test]
    fn test_cutoff_one_keeps_first_read_only() {
        let _ = env_logger::builder().is_test(true).try_init();
        let ct = table();
        let (stats, kept) = run(&ct, config(1), corpus());
        let stats = stats.unwrap();
        assert_eq!(kept.len(), 1);
        assert!(kept[0].sequence.starts_with("GGTTGACGGGGCTCAGGGGG"));
        assert_eq!(stats.processed, 21);
        assert_eq!(stats.discarded, 20);
    }

    #[test]
    fn test_cutoff_two_keeps_one_duplicate() {
        let ct = table();
        let (_, kept) = run(&ct, config(2), corpus());
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[1].sequence, SHORT);
    }

    #[test]
    fn test_discarded_reads_are_not_counted() {
        let ct = table();
        run(&ct, config(2), corpus()).0.unwrap();
        assert_eq!(ct.get_count_str(&SHORT[..17]), 2);
    }

    #[test]
    fn test_paired_keeps_both_mates() {
        let ct = table();
        let records = vec![
            Ok(Read::new("p/1", LONG)),
            Ok(Read::new("p/2", SHORT)),
            Ok(Read::new("q 1:N:0:1", SHORT)),
            Ok(Read::new("q 2:N:0:1", SHORT)),
        ];
        let (stats, kept) = run(
            &ct,
            NormalizeConfig {
                paired: true,
                ..config(1)
            },
            records,
        );
        let stats = stats.unwrap();
        // the first pair is novel; the second duplicates its mate
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[1].sequence, SHORT);
        assert_eq!((stats.kept, stats.discarded), (2, 2));
    }

    #[test]
    fn test_unpaired_read_is_fatal() {
        let ct = table();
        let paired = NormalizeConfig {
            paired: true,
            ..config(1)
        };
        let records = vec![Ok(Read::new("a/1", LONG)), Ok(Read::new("b/2", SHORT))];
        let (res, _) = run(&ct, paired.clone(), records);
        assert!(matches!(res, Err(Error::UnpairedRead { name }) if name == "a/1"));

        let records = vec![
            Ok(Read::new("a/1", LONG)),
            Ok(Read::new("a/2", LONG)),
            Ok(Read::new("c/1", SHORT)),
        ];
        let (res, _) = run(&table(), paired, records);
        assert!(matches!(res, Err(Error::UnpairedRead { name }) if name == "c/1"));
    }

    #[test]
    fn test_is_pair() {
        assert!(is_pair("read7/1", "read7/2"));
        assert!(!is_pair("read7/1", "read8/2"));
        assert!(!is_pair("read7/2", "read7/1"));
        assert!(is_pair("M01 1:N:0:ACGT", "M01 2:N:0:ACGT"));
        assert!(!is_pair("M01 1:N:0:ACGT", "M02 2:N:0:ACGT"));
        assert!(!is_pair("read7", "read7"));
    }

    #[test]
    fn test_parse_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let failed_path = dir.path().join("reads.ht.failed");
        let ct = table();
        let records = vec![
            Ok(Read::new("good1", "CAGGCGCCCACCACCGTGCCCTCCAACCTGATGGT")),
            Err("truncated quality line".to_string()),
            Ok(Read::new("good2", "TAGTATCATCAAGGTTCAAGATGTTAATGAATAACAATTGCGCAGCAA")),
        ];
        let cfg = NormalizeConfig {
            failed_path: Some(failed_path.clone()),
            ..config(1)
        };
        let (stats, kept) = run(&ct, cfg, records);
        let stats = stats.unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.failures[0].index, 1);

        let (saved, records_done) = Checkpoint::load(&failed_path).unwrap();
        assert_eq!(records_done, 2);
        assert!(saved.get_count_str("CAGGCGCCCACCACCGT") > 0);
        assert_eq!(saved.get_count_str("TAGTATCATCAAGGTTC"), 0);
    }

    #[test]
    fn test_failure_between_mates_resumes_at_first_mate() {
        let dir = tempfile::tempdir().unwrap();
        let failed_path = dir.path().join("pairs.ht.failed");
        let records = || {
            vec![
                Ok(Read::new("a/1", LONG)),
                Err("bad record".to_string()),
                Ok(Read::new("a/2", SHORT)),
            ]
        };
        let paired = NormalizeConfig {
            paired: true,
            failed_path: Some(failed_path.clone()),
            ..config(1)
        };
        let (stats, kept) = run(&table(), paired.clone(), records());
        assert_eq!(stats.unwrap().kept, 2);
        assert_eq!(kept.len(), 2);

        let (saved, records_done) = Checkpoint::load(&failed_path).unwrap();
        assert_eq!(records_done, 0);
        assert_eq!(saved.get_count_str(&LONG[..17]), 0);

        let cfg = NormalizeConfig {
            skip_records: records_done,
            ..paired
        };
        let (stats, kept) = run(&saved, cfg, records());
        assert_eq!(stats.unwrap().kept, 2);
        assert_eq!(kept[1].name, "a/2");
    }

    #[test]
    fn test_failure_rate_limit() {
        let ct = table();
        let records = vec![
            Ok(Read::new("good", LONG)),
            Err("bad".to_string()),
            Err("bad".to_string()),
        ];
        let cfg = NormalizeConfig {
            max_failure_rate: Some(0.5),
            ..config(1)
        };
        let (res, _) = run(&ct, cfg, records);
        assert!(matches!(res, Err(Error::FailureRate { failed: 2, total: 3, .. })));
    }

    #[test]
    fn test_checkpoint_every_two_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.ht");
        let ct = table();
        let records: Vec<std::result::Result<Read, String>> = (0..5)
            .map(|i| Ok(Read::new(format!("r{i}"), LONG)))
            .collect();
        let cfg = NormalizeConfig {
            checkpoint: Some(CheckpointConfig {
                path: path.clone(),
                interval: 2,
            }),
            ..config(1)
        };
        let stats = run(&ct, cfg, records).0.unwrap();
        assert_eq!(stats.checkpoints, 2);

        let (saved, records_done) = Checkpoint::load(&path).unwrap();
        assert_eq!(records_done, 4);
        assert_eq!(saved.get_count_str(&LONG[..17]), 1);
        assert!(!dir.path().join("tmp.backup.ht").exists());
    }

    #[test]
    fn test_resume_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.ht.gz");
        let all = corpus();

        // first run dies after the checkpoint at record 2
        let ct = table();
        let cfg = NormalizeConfig {
            checkpoint: Some(CheckpointConfig {
                path: path.clone(),
                interval: 2,
            }),
            ..config(2)
        };
        let head: Vec<_> = all.iter().take(3).cloned().collect();
        run(&ct, cfg, head).0.unwrap();

        let (resumed, records_done) = Checkpoint::load(&path).unwrap();
        let cfg = NormalizeConfig {
            skip_records: records_done,
            ..config(2)
        };
        let (stats, kept) = run(&resumed, cfg, all);
        let stats = stats.unwrap();
        assert_eq!(stats.processed, 19);
        assert!(kept.is_empty());
    }
}
