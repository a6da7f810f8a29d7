//src/filter.rs
//
// Read trimming against a loaded table: at the first low-abundance k-mer,
// or at the first stop tag.

use crate::config::FilterConfig;
use crate::counting::CountingTable;
use crate::hashbits::PresenceTable;
use crate::types::Read;

/// Keep `read` cut to `len`, or drop it if less than one k-mer remains.
fn keep_prefix(read: &Read, len: usize, ksize: u8) -> Option<Read> {
    if len < ksize as usize {
        return None;
    }
    if len >= read.sequence.len() {
        return Some(read.clone());
    }
    Some(read.truncated(len))
}

/// Trim the read at its first k-mer below `config.cutoff`.
///
/// In variable-coverage mode reads whose median abundance is below
/// `config.normalize_to` are low-coverage and pass untrimmed.
pub fn filter_read(table: &CountingTable, read: &Read, config: &FilterConfig) -> Option<Read> {
    let seq = read.sequence.as_bytes();
    if config.variable_coverage {
        let (median, _, _) = table.median_count(seq);
        if median < config.normalize_to {
            return Some(read.clone());
        }
    }
    let len = table.trim_on_abundance(seq, config.cutoff);
    keep_prefix(read, len, table.ksize())
}

/// Trim the read just before its first stop tag.
pub fn filter_stoptags(table: &PresenceTable, read: &Read) -> Option<Read> {
    let len = table.trim_on_stoptags(read.sequence.as_bytes());
    keep_prefix(read, len, table.ksize())
}
