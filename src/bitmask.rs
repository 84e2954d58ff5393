//! This module contains the [`TokenBitmask`] struct, the packed form of the allowed tokens.
//!
//! A bitmask is a sequence of `u32` words where bit `i % 32` of word `i / 32` is set when token `i` is allowed.
use displaydoc::Display;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
/// Represents the error when a [`TokenBitmask`] is applied to logits.
pub enum MaskLogitsError {
    /// The input logits array is not equal to the bitmask size.
    InvalidLogitsLength,
}

impl std::error::Error for MaskLogitsError {}

/// The number of `u32` words needed for a bitmask of `vocab_size` tokens.
pub fn bitmask_word_count(vocab_size: usize) -> usize {
    (vocab_size + 31) / 32
}

/// Expands packed bitmask words into the IDs of the rejected tokens.
///
/// # Arguments
///
/// * `words` - The bitmask words.
/// * `vocab_size` - The number of tokens the bitmask covers. Bits at or beyond it are ignored,
///     as are tokens beyond the given words.
///
/// # Returns
///
/// The rejected token IDs in ascending order.
pub fn get_rejected_tokens(words: &[u32], vocab_size: usize) -> Vec<u32> {
    let limit = vocab_size.min(words.len() * 32);
    (0..limit)
        .filter(|&i| (words[i / 32] >> (i % 32)) & 1 == 0)
        .map(|i| i as u32)
        .collect()
}

/// A packed set of allowed tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenBitmask {
    words: Vec<u32>,
    vocab_size: usize,
}

impl TokenBitmask {
    /// Creates a bitmask of `vocab_size` tokens that rejects every token.
    pub fn new_rejecting_all(vocab_size: usize) -> Self {
        Self {
            words: vec![0; bitmask_word_count(vocab_size)],
            vocab_size,
        }
    }

    /// Creates a bitmask of `vocab_size` tokens that allows every token.
    /// Bits beyond `vocab_size` in the last word stay unset.
    pub fn new_allowing_all(vocab_size: usize) -> Self {
        let mut words = vec![u32::MAX; bitmask_word_count(vocab_size)];
        let remainder = vocab_size % 32;
        if remainder > 0 {
            if let Some(last) = words.last_mut() {
                *last = (1u32 << remainder) - 1;
            }
        }
        Self { words, vocab_size }
    }

    /// Marks the token as allowed. IDs at or beyond the bitmask size are ignored.
    #[inline]
    pub fn allow(&mut self, token_id: u32) {
        let i = token_id as usize;
        if i < self.vocab_size {
            self.words[i / 32] |= 1 << (i % 32);
        }
    }

    /// Marks the token as rejected. IDs at or beyond the bitmask size are ignored.
    #[inline]
    pub fn reject(&mut self, token_id: u32) {
        let i = token_id as usize;
        if i < self.vocab_size {
            self.words[i / 32] &= !(1 << (i % 32));
        }
    }

    /// Whether the token is allowed. IDs at or beyond the bitmask size are never allowed.
    #[inline]
    pub fn is_allowed(&self, token_id: u32) -> bool {
        let i = token_id as usize;
        i < self.vocab_size && (self.words[i / 32] >> (i % 32)) & 1 == 1
    }

    /// The packed words.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// The packed words in little-endian byte order.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|word| word.to_le_bytes()).collect()
    }

    /// The number of tokens the bitmask covers.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// The number of allowed tokens.
    pub fn count_allowed(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// The allowed token IDs in ascending order.
    pub fn allowed_token_ids(&self) -> Vec<u32> {
        (0..self.vocab_size as u32)
            .filter(|&token_id| self.is_allowed(token_id))
            .collect()
    }

    /// The rejected token IDs in ascending order.
    pub fn rejected_token_ids(&self) -> Vec<u32> {
        get_rejected_tokens(&self.words, self.vocab_size)
    }

    /// Sets the logits of the rejected tokens to negative infinity.
    ///
    /// # Errors
    ///
    /// Returns [`MaskLogitsError::InvalidLogitsLength`] when the logits array is not of the bitmask size.
    /// The logits array is not updated in this case.
    pub fn apply_to_logits(&self, logits: &mut [f32]) -> Result<(), MaskLogitsError> {
        if logits.len() != self.vocab_size {
            return Err(MaskLogitsError::InvalidLogitsLength);
        }
        for (i, logit) in logits.iter_mut().enumerate() {
            if (self.words[i / 32] >> (i % 32)) & 1 == 0 {
                *logit = f32::NEG_INFINITY;
            }
        }
        Ok(())
    }
}
