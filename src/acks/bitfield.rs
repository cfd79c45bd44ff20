use std::fmt::{Display, Formatter};
use anyhow::bail;

const WORD_BITS: u64 = 64;
const WORD_SHIFT: u32 = 6;

/// Cyclic bit vector over 64 bit words. Positions are taken modulo the bit length, so any `u64`
///  is a valid position, and 64 bit windows may straddle the wrap-around boundary.
///
/// The number of words is a power of two, which makes all index calculations simple masks and
///  shifts.
#[derive(Debug, Clone)]
pub struct Bitfield {
    words: Vec<u64>,
    /// bit length - 1
    bit_mask: u64,
}

struct WordIndices {
    low_word: usize,
    high_word: usize,
    bit_offset: u32,
}

impl Bitfield {
    pub const MAX_WORD_COUNT: usize = 1 << 25;

    pub fn new(word_count: usize, initially_set: bool) -> anyhow::Result<Bitfield> {
        if word_count == 0 {
            bail!("bitfield word count must be at least 1");
        }
        if word_count > Self::MAX_WORD_COUNT {
            bail!("bitfield word count {} exceeds the maximum of {}", word_count, Self::MAX_WORD_COUNT);
        }
        if !word_count.is_power_of_two() {
            bail!("bitfield word count {} is not a power of two", word_count);
        }

        let initial = if initially_set { u64::MAX } else { 0 };
        Ok(Bitfield {
            words: vec![initial; word_count],
            bit_mask: (word_count as u64) * WORD_BITS - 1,
        })
    }

    pub fn single_word(initially_set: bool) -> Bitfield {
        Bitfield {
            words: vec![if initially_set { u64::MAX } else { 0 }],
            bit_mask: WORD_BITS - 1,
        }
    }

    /// Creates the smallest bitfield with at least `min_bits` bits
    pub fn with_min_bits(min_bits: usize, initially_set: bool) -> anyhow::Result<Bitfield> {
        let min_words = min_bits.div_ceil(WORD_BITS as usize).max(1);
        match min_words.checked_next_power_of_two() {
            Some(word_count) => Self::new(word_count, initially_set),
            None => bail!("bitfield of {} bits is not representable", min_bits),
        }
    }

    pub fn bit_len(&self) -> u64 {
        self.bit_mask + 1
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    fn indices(&self, pos: u64) -> WordIndices {
        let bit_pos = pos & self.bit_mask;
        WordIndices {
            low_word: (bit_pos >> WORD_SHIFT) as usize,
            high_word: ((pos.wrapping_add(WORD_BITS - 1) & self.bit_mask) >> WORD_SHIFT) as usize,
            bit_offset: (bit_pos & (WORD_BITS - 1)) as u32,
        }
    }

    pub fn zero_bit(&mut self, pos: u64) {
        let wi = self.indices(pos);
        self.words[wi.low_word] &= !(1u64 << wi.bit_offset);
    }

    /// ORs a 64 bit window into the field, bit 0 of `bits` landing on `lsb_pos`
    pub fn or(&mut self, lsb_pos: u64, bits: u64) {
        let wi = self.indices(lsb_pos);
        self.words[wi.low_word] |= bits << wi.bit_offset;
        if wi.bit_offset != 0 {
            self.words[wi.high_word] |= bits >> (WORD_BITS as u32 - wi.bit_offset);
        }
    }

    /// Reads the 64 bit window starting at (and including) `lsb_pos`
    pub fn get_bits(&self, lsb_pos: u64) -> u64 {
        let wi = self.indices(lsb_pos);
        let low_bits = self.words[wi.low_word] >> wi.bit_offset;
        if wi.bit_offset == 0 {
            return low_bits;
        }
        let high_bits = self.words[wi.high_word] << (WORD_BITS as u32 - wi.bit_offset);
        low_bits | high_bits
    }
}

impl Display for Bitfield {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for word in self.words.iter().rev() {
            write!(f, "{:064b}", word)?;
        }
        Ok(())
    }
}
