//src/hashtable.rs

use std::io::{self, BufRead, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicU8, Ordering};

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::kmer::check_ksize;

/// What a single table cell holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// One saturating byte per slot.
    Counter,
    /// One bit per slot, packed eight to a byte.
    Bit,
}

impl CellKind {
    /// Bytes needed to store `size` slots.
    pub fn bytes_for(self, size: u64) -> usize {
        match self {
            CellKind::Counter => size as usize,
            CellKind::Bit => size.div_ceil(8) as usize,
        }
    }
}

/// One fixed-size array with its own hash seed.
#[derive(Debug)]
pub struct HashTable {
    size: u64,
    seed: u64,
    cells: Box<[AtomicU8]>,
}

impl HashTable {
    fn new(size: u64, seed: u64, kind: CellKind) -> Self {
        let cells = (0..kind.bytes_for(size)).map(|_| AtomicU8::new(0)).collect();
        Self { size, seed, cells }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn slot(&self, kmer: u64) -> u64 {
        fmix64(kmer ^ self.seed) % self.size
    }

    #[inline]
    pub fn byte(&self, index: usize) -> &AtomicU8 {
        &self.cells[index]
    }

    fn raw(&self) -> Vec<u8> {
        self.cells.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }
}

/// Murmur3 64-bit finalizer. Platform and version stable, so persisted
/// tables hash identically everywhere.
#[inline]
pub fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

/// Per-table seed; a splitmix64 step over the table index.
fn table_seed(index: usize) -> u64 {
    let mut z = (index as u64 + 1).wrapping_mul(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut i = 3u64;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 2;
    }
    true
}

/// `n` distinct primes at or below `x`, largest first. Falls back to
/// distinct non-prime sizes only when there aren't enough primes below `x`.
pub fn primes_below(n: usize, x: u64) -> Vec<u64> {
    let mut primes = Vec::with_capacity(n);
    let mut candidate = x;
    while primes.len() < n && candidate >= 2 {
        if is_prime(candidate) {
            primes.push(candidate);
        }
        candidate -= 1;
    }
    let mut filler = x + 1;
    while primes.len() < n {
        primes.push(filler);
        filler += 1;
    }
    primes
}

/// N independent hash tables over canonical k-mers.
///
/// The counting and presence tables both own one of these and decide how
/// a slot is read and written.
#[derive(Debug)]
pub struct ProbabilisticTable {
    ksize: u8,
    kind: CellKind,
    tables: Vec<HashTable>,
}

impl ProbabilisticTable {
    /// Build with explicit per-table sizes.
    pub fn new(ksize: u8, sizes: &[u64], kind: CellKind) -> Result<Self> {
        check_ksize(ksize)?;
        if sizes.is_empty() {
            return Err(Error::InvalidConfig("at least one table is required".to_string()));
        }
        if let Some(&bad) = sizes.iter().find(|&&s| s == 0) {
            return Err(Error::InvalidConfig(format!("table size {bad} is invalid")));
        }
        let tables = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| HashTable::new(size, table_seed(i), kind))
            .collect();
        Ok(Self { ksize, kind, tables })
    }

    /// Build `n_tables` tables whose sizes are distinct primes at or below `min_size`.
    pub fn with_primes(ksize: u8, n_tables: usize, min_size: u64, kind: CellKind) -> Result<Self> {
        let sizes = primes_below(n_tables, min_size);
        Self::new(ksize, &sizes, kind)
    }

    #[inline]
    pub fn ksize(&self) -> u8 {
        self.ksize
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    pub fn n_tables(&self) -> usize {
        self.tables.len()
    }

    pub fn sizes(&self) -> Vec<u64> {
        self.tables.iter().map(|t| t.size).collect()
    }

    #[inline]
    pub fn tables(&self) -> &[HashTable] {
        &self.tables
    }

    /// Number of non-empty slots in table `i`.
    pub fn n_occupied(&self, i: usize) -> u64 {
        let table = &self.tables[i];
        match self.kind {
            CellKind::Counter => table
                .cells
                .iter()
                .filter(|c| c.load(Ordering::Relaxed) != 0)
                .count() as u64,
            CellKind::Bit => table
                .cells
                .iter()
                .map(|c| c.load(Ordering::Relaxed).count_ones() as u64)
                .sum(),
        }
    }

    /// Probability that an absent k-mer looks present: the product of the
    /// occupied fractions of all tables.
    pub fn estimated_fp_rate(&self) -> f64 {
        (0..self.tables.len())
            .map(|i| self.n_occupied(i) as f64 / self.tables[i].size as f64)
            .product()
    }

    /// Error out if the table is too full to be trusted.
    pub fn check_fp_rate(&self, max: f64) -> Result<f64> {
        let rate = self.estimated_fp_rate();
        if rate > max {
            return Err(Error::FalsePositiveRate { rate, max });
        }
        Ok(rate)
    }

    /// K and every table size must agree.
    pub fn check_compatible(&self, other: &ProbabilisticTable) -> Result<()> {
        if self.ksize != other.ksize {
            return Err(Error::KsizeMismatch {
                expected: self.ksize,
                found: other.ksize,
            });
        }
        if self.sizes() != other.sizes() {
            return Err(Error::Dimension(format!(
                "table sizes {:?} vs {:?}",
                self.sizes(),
                other.sizes()
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    //  Persistence (body only; the caller writes the file header)
    // -----------------------------------------------------------------------

    /// `n_tables: u32`, `flag: u8`, then per table `size: u64` and the raw cells.
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W, flag: u8) -> Result<()> {
        w.write_u32::<LE>(self.tables.len() as u32)?;
        w.write_u8(flag)?;
        for table in &self.tables {
            w.write_u64::<LE>(table.size)?;
            w.write_all(&table.raw())?;
        }
        Ok(())
    }

    /// Inverse of [`write_to`](Self::write_to). Returns the table and the flag byte.
    pub fn read_from<R: BufRead + ?Sized>(
        r: &mut R,
        ksize: u8,
        kind: CellKind,
    ) -> Result<(Self, u8)> {
        check_ksize(ksize)?;
        let n_tables = r.read_u32::<LE>()? as usize;
        if n_tables == 0 {
            return Err(Error::Dimension("file declares zero tables".to_string()));
        }
        let flag = r.read_u8()?;
        let mut tables = Vec::with_capacity(n_tables.min(64));
        for i in 0..n_tables {
            let size = r.read_u64::<LE>()?;
            if size == 0 {
                return Err(Error::Dimension(format!("table {i} has size 0")));
            }
            // the declared size can't be trusted for an up-front allocation
            let want = kind.bytes_for(size);
            let mut raw = Vec::new();
            Read::take(&mut *r, want as u64).read_to_end(&mut raw)?;
            if raw.len() != want {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("table {i} declares {want} bytes, found {}", raw.len()),
                )
                .into());
            }
            tables.push(HashTable {
                size,
                seed: table_seed(i),
                cells: raw.into_iter().map(AtomicU8::new).collect(),
            });
        }
        Ok((Self { ksize, kind, tables }, flag))
    }
}
