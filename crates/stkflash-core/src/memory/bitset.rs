//! Fixed-length bit set

use alloc::vec;
use alloc::vec::Vec;

const WORD_BITS: usize = 32;

/// Fixed-length set of bits backed by 32-bit words
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u32>,
    len: usize,
}

impl BitSet {
    /// Create a set of `len` clear bits
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    /// Number of bits
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the set holds no bits at all
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read bit `index` (out of range reads as clear)
    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Set bit `index` (out of range is ignored)
    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        }
    }

    /// Clear bit `index` (out of range is ignored)
    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        }
    }

    /// Clear bits in `start..end`
    pub fn clear_range(&mut self, start: usize, end: usize) {
        for index in start..end.min(self.len) {
            self.clear(index);
        }
    }

    /// Clear every bit
    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Whether any bit is set
    pub fn any(&self) -> bool {
        self.words.iter().any(|&w| w != 0)
    }

    /// Whether any bit in `start..end` is set
    pub fn any_in(&self, start: usize, end: usize) -> bool {
        (start..end.min(self.len)).any(|i| self.get(i))
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Indices of set bits, ascending
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .filter(|(_, w)| **w != 0)
            .flat_map(|(wi, &w)| {
                (0..WORD_BITS)
                    .filter(move |b| w & (1 << b) != 0)
                    .map(move |b| wi * WORD_BITS + b)
            })
    }

    /// Highest set bit
    pub fn last_one(&self) -> Option<usize> {
        self.iter_ones().last()
    }
}
