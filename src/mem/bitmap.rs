//! Bitmaps for buddy pairs and chunk slots.

/// The number of `u64` words needed to store `bits` bits.
pub const fn words_for(bits: usize) -> usize {
    (bits + 63) / 64
}

/// A bitmap over borrowed storage.
#[derive(Debug, Default)]
pub struct Bitmap<'m> {
    words: &'m mut [u64],
    bits: usize,
}

impl<'m> Bitmap<'m> {
    /// Create a bitmap of `bits` bits and clear every bit.
    ///
    /// `words` must hold at least [`words_for(bits)`](words_for) words.
    pub fn new(words: &'m mut [u64], bits: usize) -> Self {
        let mut this = Self::from_words(words, bits);
        this.words.iter_mut().for_each(|w| *w = 0);
        this
    }

    /// Wrap `words` that already hold a bitmap of `bits` bits.
    pub fn from_words(words: &'m mut [u64], bits: usize) -> Self {
        assert!(
            words.len() >= words_for(bits),
            "bitmap storage too small for {} bits",
            bits
        );
        Self { words, bits }
    }

    /// Flip the bit at `idx` and return its new value.
    pub fn toggle(&mut self, idx: usize) -> bool {
        assert!(idx < self.bits, "bitmap index {} out of range", idx);
        let word = &mut self.words[idx / 64];
        *word ^= 1 << (idx % 64);
        *word & (1 << (idx % 64)) != 0
    }

    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < self.bits, "bitmap index {} out of range", idx);
        self.words[idx / 64] & (1 << (idx % 64)) != 0
    }
}
