//src/kmer.rs
//
// 2-bit k-mer codec. Bases are packed first-base-most-significant with
// A=0, C=1, G=2, T=3, so the complement of a base is its bitwise NOT.

use crate::error::{Error, Result};

/// Largest k that fits in a `u64` at 2 bits per base.
pub const MAX_KSIZE: u8 = 32;

/// Reject k-mer sizes that cannot be packed into a `u64`.
pub fn check_ksize(k: u8) -> Result<()> {
    if k == 0 || k > MAX_KSIZE {
        return Err(Error::InvalidKsize(k));
    }
    Ok(())
}

/// Mask covering the low `2k` bits.
#[inline]
pub fn kmer_mask(k: u8) -> u64 {
    if k >= 32 {
        u64::MAX
    } else {
        (1u64 << (2 * k as u32)) - 1
    }
}

/// 2-bit code of one base, or `None` for anything that isn't ACGT.
#[inline]
pub fn base_code(base: u8) -> Option<u64> {
    match base {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

/// Encode a whole window into a forward code. `None` if it contains a non-ACGT byte.
pub fn encode(window: &[u8]) -> Option<u64> {
    let mut val = 0u64;
    for &b in window {
        val = (val << 2) | base_code(b)?;
    }
    Some(val)
}

/// Decode `k` bases of `code` back to an uppercase string.
pub fn decode(code: u64, k: u8) -> String {
    (0..k)
        .rev()
        .map(|i| match (code >> (2 * i as u32)) & 0b11 {
            0 => 'A',
            1 => 'C',
            2 => 'G',
            _ => 'T',
        })
        .collect()
}

/// Reverse complement of a k-mer of `k` nucleotides.
///
/// Reverses the 2-bit groups of the whole word, complements by subtracting
/// from all-ones and shifts the result back down to the low `2k` bits.
#[inline]
pub fn reverse_complement(mut kmer: u64, k: u8) -> u64 {
    kmer = ((kmer >> 2) & 0x3333333333333333) | ((kmer & 0x3333333333333333) << 2);
    kmer = ((kmer >> 4) & 0x0F0F0F0F0F0F0F0F) | ((kmer & 0x0F0F0F0F0F0F0F0F) << 4);
    kmer = ((kmer >> 8) & 0x00FF00FF00FF00FF) | ((kmer & 0x00FF00FF00FF00FF) << 8);
    kmer = ((kmer >> 16) & 0x0000FFFF0000FFFF) | ((kmer & 0x0000FFFF0000FFFF) << 16);
    kmer = (kmer >> 32) | (kmer << 32);
    (u64::MAX - kmer) >> (64 - 2 * k as u32)
}

/// Numerically smaller of `(kmer, revcomp(kmer))`.
#[inline]
pub fn canonical(kmer: u64, k: u8) -> u64 {
    kmer.min(reverse_complement(kmer, k))
}

/// Canonical code of a k-mer given as text, `None` if it has the wrong
/// length or a non-ACGT base.
pub fn canonical_str(kmer: &str, k: u8) -> Option<u64> {
    if kmer.len() != k as usize {
        return None;
    }
    encode(kmer.as_bytes()).map(|code| canonical(code, k))
}

/// One valid window of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kmer {
    /// Offset of the first base of the window.
    pub pos: usize,
    pub forward: u64,
    pub reverse: u64,
}

impl Kmer {
    #[inline]
    pub fn canonical(&self) -> u64 {
        self.forward.min(self.reverse)
    }
}

/// Lazy rolling iterator over the valid k-mers of a sequence.
///
/// Windows overlapping a non-ACGT byte are skipped; everything else is
/// yielded in position order.
#[derive(Debug, Clone)]
pub struct KmerIterator<'a> {
    seq: &'a [u8],
    k: u8,
    mask: u64,
    rc_shift: u32,
    next_byte: usize,
    run: usize,
    forward: u64,
    reverse: u64,
}

impl<'a> KmerIterator<'a> {
    pub fn new(seq: &'a [u8], k: u8) -> Self {
        Self {
            seq,
            k,
            mask: kmer_mask(k),
            rc_shift: 2 * (k.max(1) as u32 - 1),
            next_byte: 0,
            run: 0,
            forward: 0,
            reverse: 0,
        }
    }

    /// Start over from the beginning of the sequence.
    pub fn restart(&mut self) {
        self.next_byte = 0;
        self.run = 0;
        self.forward = 0;
        self.reverse = 0;
    }

    pub fn ksize(&self) -> u8 {
        self.k
    }
}

impl Iterator for KmerIterator<'_> {
    type Item = Kmer;

    fn next(&mut self) -> Option<Kmer> {
        let k = self.k as usize;
        if k == 0 {
            return None;
        }
        while self.next_byte < self.seq.len() {
            let b = self.seq[self.next_byte];
            self.next_byte += 1;
            match base_code(b) {
                Some(code) => {
                    self.forward = ((self.forward << 2) | code) & self.mask;
                    self.reverse = (self.reverse >> 2) | ((3 - code) << self.rc_shift);
                    self.run += 1;
                    if self.run >= k {
                        return Some(Kmer {
                            pos: self.next_byte - k,
                            forward: self.forward,
                            reverse: self.reverse,
                        });
                    }
                }
                None => {
                    self.run = 0;
                    self.forward = 0;
                    self.reverse = 0;
                }
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.seq.len() - self.next_byte))
    }
}

/// Canonical codes of every valid k-mer of `seq`, in position order.
pub fn canonical_kmers(seq: &[u8], k: u8) -> impl Iterator<Item = u64> + '_ {
    KmerIterator::new(seq, k).map(|km| km.canonical())
}
