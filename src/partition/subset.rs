//src/partition/subset.rs
//
// Bounded breadth-first walks between tags, and partitioning of one
// contiguous range of tags into a shard map.

use std::collections::VecDeque;
use std::ops::Range;

use ahash::AHashSet;

use super::partition_map::PartitionMap;
use crate::config::{PartitionConfig, DEFAULT_TAG_DENSITY};
use crate::error::{Error, Result};
use crate::hashbits::PresenceTable;

/// Depth and node budget of one walk.
#[derive(Debug, Clone, Copy)]
pub struct TraversalLimits {
    pub max_breadth: u32,
    /// Stop once this many nodes have been visited; `None` walks until the
    /// depth limit.
    pub cutoff: Option<usize>,
}

impl TraversalLimits {
    pub fn new(config: &PartitionConfig, tag_density: Option<u32>) -> Self {
        let density = tag_density.unwrap_or(DEFAULT_TAG_DENSITY);
        Self {
            max_breadth: config.max_breadth.unwrap_or(2 * density + 1),
            cutoff: config
                .stop_big_traversals
                .then_some(config.big_traversal_cutoff),
        }
    }
}

/// Tags reached by one walk.
#[derive(Debug, Clone, Default)]
pub struct Traversal {
    pub tags: Vec<u64>,
    pub visited: usize,
    /// The node budget ran out before the frontier was exhausted.
    pub truncated: bool,
}

/// Breadth-first walk from `starts` over present k-mers.
///
/// Start nodes that are tags are recorded and expanded. Any other tag met
/// on the way is recorded but not expanded past. Stop tags are never
/// entered, starts included.
pub(crate) fn walk<F>(table: &PresenceTable, is_tag: F, starts: &[u64], limits: &TraversalLimits) -> Traversal
where
    F: Fn(u64) -> bool,
{
    let stop_tags = table.stop_tags();
    let mut seen: AHashSet<u64> = AHashSet::new();
    let mut found: Vec<u64> = Vec::new();
    let mut queue: VecDeque<(u64, u32)> = VecDeque::new();

    for &s in starts {
        if stop_tags.contains(s) || !seen.insert(s) {
            continue;
        }
        if is_tag(s) {
            found.push(s);
        }
        queue.push_back((s, 0));
    }

    let mut truncated = false;
    'walk: while let Some((node, depth)) = queue.pop_front() {
        if depth >= limits.max_breadth {
            continue;
        }
        for next in table.neighbors(node, true) {
            if !seen.insert(next) {
                continue;
            }
            if is_tag(next) {
                found.push(next);
            } else {
                queue.push_back((next, depth + 1));
            }
            if limits.cutoff.is_some_and(|c| seen.len() >= c) {
                truncated = true;
                break 'walk;
            }
        }
    }

    Traversal {
        tags: found,
        visited: seen.len(),
        truncated,
    }
}

/// Partitions the tags of one [`PresenceTable`].
///
/// The table is only read; shards can be partitioned from many threads.
pub struct PartitionEngine<'a> {
    table: &'a PresenceTable,
    config: PartitionConfig,
    limits: TraversalLimits,
    tags: Vec<u64>,
    tag_lookup: AHashSet<u64>,
}

impl<'a> PartitionEngine<'a> {
    pub fn new(table: &'a PresenceTable, config: PartitionConfig) -> Result<Self> {
        config.validate()?;
        let tags = table.tags().sorted();
        if tags.is_empty() && !table.tagging_enabled() {
            return Err(Error::TaggingDisabled);
        }
        let limits = TraversalLimits::new(&config, table.tag_density());
        let tag_lookup = tags.iter().copied().collect();
        Ok(Self {
            table,
            config,
            limits,
            tags,
            tag_lookup,
        })
    }

    pub fn table(&self) -> &PresenceTable {
        self.table
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    pub fn limits(&self) -> TraversalLimits {
        self.limits
    }

    /// Every tag, ascending. Shard ranges index into this.
    pub fn tags_sorted(&self) -> &[u64] {
        &self.tags
    }

    /// All tags reachable from `start` without passing through another tag.
    /// `start` itself is included unless it is a stop tag.
    pub fn find_all_tags(&self, start: u64) -> Traversal {
        walk(
            self.table,
            |k| self.tag_lookup.contains(&k),
            &[start],
            &self.limits,
        )
    }

    /// Partition the tags at `range` of [`tags_sorted`](Self::tags_sorted).
    ///
    /// Every start tag lands in the result, joined with whatever it reached.
    /// A truncated walk contributes only its start tag, in a partition of
    /// its own, so a dense knot doesn't join the paths running through it.
    pub fn subset_partition(&self, range: Range<usize>) -> PartitionMap {
        let mut map = PartitionMap::new(self.table.ksize());
        let end = range.end.min(self.tags.len());
        let start = range.start.min(end);
        for &tag in &self.tags[start..end] {
            let found = self.find_all_tags(tag);
            if found.tags.is_empty() {
                // stop tag; known but never assigned
                map.register_tag(tag);
                continue;
            }
            if found.truncated {
                log::debug!(
                    "Traversal from tag {:#x} truncated after {} nodes",
                    tag,
                    found.visited
                );
                map.mark_truncated(tag);
                map.assign_together(&[tag]);
                continue;
            }
            map.assign_together(&found.tags);
        }
        map
    }
}
