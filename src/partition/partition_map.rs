//src/partition/partition_map.rs

use std::path::Path;

use ahash::{AHashMap, AHashSet};
use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};

use super::subset::{walk, TraversalLimits};
use super::union_find::UnionFind;
use crate::config::PartitionConfig;
use crate::error::{Error, Result};
use crate::hashbits::PresenceTable;
use crate::io::{read_file, read_header, write_file, write_header, FileKind};
use crate::kmer::KmerIterator;
use crate::types::{PartitionId, UNASSIGNED_PARTITION};

/// Tag → partition assignment, backed by a union-find arena.
///
/// A tag mapped to [`UNASSIGNED_PARTITION`] is known but belongs to no
/// component yet. Ids are arbitrary until [`compact`](Self::compact) is
/// called, which renumbers them densely from 1.
#[derive(Debug, Clone)]
pub struct PartitionMap {
    ksize: u8,
    tags: AHashMap<u64, u32>,
    sets: UnionFind,
    truncated: AHashSet<u64>,
    merged: bool,
}

impl PartitionMap {
    pub fn new(ksize: u8) -> Self {
        Self {
            ksize,
            tags: AHashMap::new(),
            sets: UnionFind::new(),
            truncated: AHashSet::new(),
            merged: false,
        }
    }

    pub fn ksize(&self) -> u8 {
        self.ksize
    }

    pub fn n_tags(&self) -> usize {
        self.tags.len()
    }

    pub fn is_merged(&self) -> bool {
        self.merged
    }

    pub(crate) fn set_merged(&mut self) {
        self.merged = true;
    }

    /// Make the tag known without assigning it.
    pub fn register_tag(&mut self, tag: u64) {
        self.tags.entry(tag).or_insert(UNASSIGNED_PARTITION);
    }

    /// Put all `tags` into one partition, joining whatever partitions they
    /// were already in.
    pub fn assign_together(&mut self, tags: &[u64]) {
        let mut root: Option<u32> = None;
        for &tag in tags {
            let current = self.tags.get(&tag).copied().unwrap_or(UNASSIGNED_PARTITION);
            let id = if current == UNASSIGNED_PARTITION {
                let id = match root {
                    Some(r) => r,
                    None => self.sets.make_set(),
                };
                self.tags.insert(tag, id);
                id
            } else {
                current
            };
            root = Some(match root {
                Some(r) => self.sets.union(r, id),
                None => id,
            });
        }
    }

    /// `None` if the tag is unknown, `Some(0)` if it is unassigned.
    pub fn partition_of(&self, tag: u64) -> Option<PartitionId> {
        self.tags.get(&tag).map(|&id| {
            if id == UNASSIGNED_PARTITION {
                UNASSIGNED_PARTITION
            } else {
                self.sets.find_const(id)
            }
        })
    }

    /// Record that a traversal from `tag` hit the node budget.
    pub fn mark_truncated(&mut self, tag: u64) {
        self.truncated.insert(tag);
    }

    pub fn n_truncated(&self) -> usize {
        self.truncated.len()
    }

    /// Partitions containing at least one tag whose traversal was cut short.
    pub fn truncated_partitions(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self
            .truncated
            .iter()
            .filter_map(|&t| self.partition_of(t))
            .filter(|&id| id != UNASSIGNED_PARTITION)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Fold another map's relation into this one.
    pub fn merge_from(&mut self, other: &PartitionMap) -> Result<()> {
        if other.ksize != self.ksize {
            return Err(Error::KsizeMismatch {
                expected: self.ksize,
                found: other.ksize,
            });
        }
        let mut classes: AHashMap<u32, Vec<u64>> = AHashMap::new();
        for (&tag, &id) in &other.tags {
            if id == UNASSIGNED_PARTITION {
                self.register_tag(tag);
            } else {
                classes.entry(other.sets.find_const(id)).or_default().push(tag);
            }
        }
        for tags in classes.values() {
            self.assign_together(tags);
        }
        self.truncated.extend(other.truncated.iter().copied());
        Ok(())
    }

    /// Renumber partitions densely as `1..=n`, ordered by the smallest tag
    /// in each partition. Returns `n`.
    pub fn compact(&mut self) -> usize {
        let mut min_tag: AHashMap<u32, u64> = AHashMap::new();
        for (&tag, &id) in &self.tags {
            if id == UNASSIGNED_PARTITION {
                continue;
            }
            let root = self.sets.find_const(id);
            let slot = min_tag.entry(root).or_insert(tag);
            if tag < *slot {
                *slot = tag;
            }
        }

        let mut order: Vec<(u64, u32)> = min_tag.into_iter().map(|(root, t)| (t, root)).collect();
        order.sort_unstable();

        let mut sets = UnionFind::new();
        let mut renumber: AHashMap<u32, u32> = AHashMap::with_capacity(order.len());
        for (_, root) in &order {
            renumber.insert(*root, sets.make_set());
        }
        for id in self.tags.values_mut() {
            if *id != UNASSIGNED_PARTITION {
                let root = self.sets.find_const(*id);
                *id = renumber.get(&root).copied().unwrap_or(UNASSIGNED_PARTITION);
            }
        }
        self.sets = sets;
        order.len()
    }

    /// `(n_partitions, n_unassigned_tags)`.
    pub fn count_partitions(&self) -> (usize, usize) {
        let mut roots = AHashSet::new();
        let mut unassigned = 0;
        for &id in self.tags.values() {
            if id == UNASSIGNED_PARTITION {
                unassigned += 1;
            } else {
                roots.insert(self.sets.find_const(id));
            }
        }
        (roots.len(), unassigned)
    }

    /// `(tag, partition)` pairs sorted by tag.
    pub fn assignments(&self) -> Vec<(u64, PartitionId)> {
        let mut out: Vec<(u64, PartitionId)> = self
            .tags
            .keys()
            .filter_map(|&t| self.partition_of(t).map(|p| (t, p)))
            .collect();
        out.sort_unstable();
        out
    }

    // -----------------------------------------------------------------------
    //  Reads against the map
    // -----------------------------------------------------------------------

    fn check_table(&self, table: &PresenceTable) -> Result<()> {
        if table.ksize() != self.ksize {
            return Err(Error::KsizeMismatch {
                expected: self.ksize,
                found: table.ksize(),
            });
        }
        Ok(())
    }

    /// Partition a read belongs to: that of its first assigned tag, or,
    /// if the read carries no tag, of the nearest tag reachable from it.
    pub fn partition_for_sequence(&self, table: &PresenceTable, seq: &[u8]) -> Result<Option<PartitionId>> {
        self.check_table(table)?;
        let kmers: Vec<u64> = KmerIterator::new(seq, table.ksize())
            .map(|km| km.canonical())
            .collect();
        let direct = kmers
            .iter()
            .filter_map(|&k| self.partition_of(k))
            .find(|&id| id != UNASSIGNED_PARTITION);
        if direct.is_some() {
            return Ok(direct);
        }

        let limits = TraversalLimits::new(&PartitionConfig::default(), table.tag_density());
        let found = walk(table, |k| self.tags.contains_key(&k), &kmers, &limits);
        let mut tags = found.tags;
        tags.sort_unstable();
        Ok(tags
            .into_iter()
            .filter_map(|t| self.partition_of(t))
            .find(|&id| id != UNASSIGNED_PARTITION))
    }

    /// Join every partition whose tags lie on the read's path. Returns the
    /// resulting partition, or `None` if the read carries no tag.
    pub fn join_partitions_by_path(&mut self, table: &PresenceTable, seq: &[u8]) -> Result<Option<PartitionId>> {
        self.check_table(table)?;
        let tags: Vec<u64> = KmerIterator::new(seq, table.ksize())
            .map(|km| km.canonical())
            .filter(|&k| table.tags().contains(k))
            .collect();
        let Some(&first) = tags.first() else {
            return Ok(None);
        };
        self.assign_together(&tags);
        Ok(self.partition_of(first))
    }

    // -----------------------------------------------------------------------
    //  Persistence
    // -----------------------------------------------------------------------

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let assignments = self.assignments();
        let mut truncated: Vec<u64> = self.truncated.iter().copied().collect();
        truncated.sort_unstable();

        write_file(path, |w| {
            write_header(w, FileKind::PartitionMap, self.ksize)?;
            w.write_u8(self.merged as u8)?;
            w.write_u64::<LE>(assignments.len() as u64)?;
            for &(tag, id) in &assignments {
                w.write_u64::<LE>(tag)?;
                w.write_u32::<LE>(id)?;
            }
            w.write_u64::<LE>(truncated.len() as u64)?;
            for &tag in &truncated {
                w.write_u64::<LE>(tag)?;
            }
            Ok(())
        })?;
        log::info!(
            "Saved partition map ({} tags) to {}",
            assignments.len(),
            path.display()
        );
        Ok(())
    }

    /// Load a map saved with K = `ksize`. Partition ids are kept as stored.
    pub fn load<P: AsRef<Path>>(path: P, ksize: u8) -> Result<Self> {
        let path = path.as_ref();
        let (found, merged, assignments, truncated) = read_file(path, |r| {
            let found = read_header(r, path, FileKind::PartitionMap)?;
            let merged = r.read_u8()? != 0;
            let n = r.read_u64::<LE>()?;
            let mut assignments = Vec::new();
            for _ in 0..n {
                let tag = r.read_u64::<LE>()?;
                let id = r.read_u32::<LE>()?;
                assignments.push((tag, id));
            }
            let n_truncated = r.read_u64::<LE>()?;
            let mut truncated = AHashSet::new();
            for _ in 0..n_truncated {
                truncated.insert(r.read_u64::<LE>()?);
            }
            Ok((found, merged, assignments, truncated))
        })?;
        if found != ksize {
            return Err(Error::KsizeMismatch {
                expected: ksize,
                found,
            });
        }

        // ids are dense after compaction, so no id can exceed the tag count
        let max_id = assignments.iter().map(|&(_, id)| id).max().unwrap_or(0);
        if max_id as usize > assignments.len() {
            return Err(Error::format(
                path,
                format!("partition id {} exceeds tag count {}", max_id, assignments.len()),
            ));
        }
        let mut sets = UnionFind::new();
        for _ in 0..max_id {
            sets.make_set();
        }
        let map = Self {
            ksize,
            tags: assignments.into_iter().collect(),
            sets,
            truncated,
            merged,
        };
        log::info!(
            "Loaded partition map from {}: {} tags",
            path.display(),
            map.n_tags()
        );
        Ok(map)
    }
}
