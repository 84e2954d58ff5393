//! This module contains the [`Vocabulary`] struct, which indexes a language model's vocabulary
//! for grammar matching.
use std::collections::hash_map::Entry;
use std::fmt::Debug;
use std::str::Utf8Error;

use ahash::AHashMap;
use fixedbitset_stack::FixedBitSet;
use jaggedarray::jagged_array::{JaggedArray, JaggedArrayViewTrait};
use serde::{Deserialize, Serialize};

use crate::utils;
use crate::utils::ByteSet;

const MAX_VOCAB_SIZE: usize = 0x1000000;
const SENTENCEPIECE_SPACE: char = '\u{2581}';
/// Control tokens that never carry grammar content.
const SPECIAL_TOKENS: [&str; 14] = [
    "<unk>",
    "<s>",
    "</s>",
    "<pad>",
    "<bos>",
    "<eos>",
    "<|begin_of_text|>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<|endoftext|>",
    "<|im_start|>",
    "<|im_end|>",
    "<|end|>",
    "<end_of_turn>",
];
/// Control tokens that end a generation.
const STOP_TOKENS: [&str; 8] = [
    "</s>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<|endoftext|>",
    "<eos>",
    "<|im_end|>",
    "<|end|>",
    "<end_of_turn>",
];

/// A wrapper struct that represents a token in bytes in a language model's vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Token(pub Box<[u8]>);

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Token(value.as_bytes().into())
    }
}

impl From<&[u8]> for Token {
    fn from(value: &[u8]) -> Self {
        Token(value.into())
    }
}

/// How the tokenizer encodes bytes in its tokens.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VocabType {
    /// Tokens are used as they are.
    #[default]
    Raw,
    /// SentencePiece style. `<0xAB>` stands for the byte `0xAB` and `▁` (U+2581) for a space.
    ByteFallback,
    /// GPT-2 style byte-level BPE. Every byte is mapped to a unique printable character.
    ByteLevel,
}

/// The struct represents a language model's vocabulary.
#[derive(Clone)]
pub struct Vocabulary {
    raw_tokens: Vec<Token>,
    decoded_tokens: JaggedArray<u8, Vec<usize>, 2>,
    raw_token_to_id: AHashMap<Token, u32>,
    decoded_index: fst::Map<Vec<u8>>,
    sorted_token_ids: Vec<u32>,
    special_token_ids: FixedBitSet,
    detected_stop_token_ids: Vec<u32>,
    vocab_type: VocabType,
    prepend_space_in_tokenization: bool,
}

impl Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocabulary")
            .field("vocab_size", &self.raw_tokens.len())
            .field("vocab_type", &self.vocab_type)
            .field(
                "prepend_space_in_tokenization",
                &self.prepend_space_in_tokenization,
            )
            .field(
                "special_token_ids",
                &utils::get_display_form_from_bitset(&self.special_token_ids),
            )
            .field("detected_stop_token_ids", &self.detected_stop_token_ids)
            .finish()
    }
}

fn check_vocab_size(vocab_size: usize) -> Result<(), CreateVocabularyError> {
    if vocab_size > MAX_VOCAB_SIZE {
        return Err(CreateVocabularyError::VocabularyTooLarge(
            vocab_size,
            MAX_VOCAB_SIZE,
        ));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
/// The error type for [Vocabulary] creation.
pub enum CreateVocabularyError {
    /// The vocabulary size exceeds the maximum supported size.
    #[error("The vocabulary size is {0}, while the maximum supported is {1}.")]
    VocabularyTooLarge(usize, usize),
    /// A token is not valid UTF-8 although the vocabulary type requires it.
    #[error("Token ID {0} is not valid UTF-8, which a {1} vocabulary requires.")]
    NonUtf8Token(u32, VocabType),
    /// The index from decoded tokens to token IDs could not be built.
    #[error("Failed to build the decoded token index: {0}")]
    IndexError(#[from] fst::Error),
}

impl Vocabulary {
    /// Creates a new instance of [Vocabulary].
    ///
    /// # Arguments
    ///
    /// * `tokens` - The tokens in bytes, indexed by token ID.
    /// * `vocab_type` - How the tokens encode bytes.
    /// * `prepend_space_in_tokenization` - Whether the tokenizer prepends a space to the text,
    ///     in which case the leading space of the first token in a sequence is not matched against the grammar.
    ///
    /// # Errors
    ///
    /// Returns a [CreateVocabularyError] when the vocabulary is too large,
    /// when a token is not valid UTF-8 under [VocabType::ByteFallback] or [VocabType::ByteLevel],
    /// or when the decoded token index cannot be built.
    pub fn new(
        tokens: Vec<Token>,
        vocab_type: VocabType,
        prepend_space_in_tokenization: bool,
    ) -> Result<Vocabulary, CreateVocabularyError> {
        check_vocab_size(tokens.len())?;
        let vocab_size = tokens.len();
        let mut raw_token_to_id = AHashMap::with_capacity(vocab_size);
        let mut decoded_tokens = JaggedArray::<u8, Vec<usize>, 2>::with_capacity([
            vocab_size,
            tokens.iter().map(|token| token.0.len()).sum(),
        ]);
        let mut special_token_ids = FixedBitSet::with_capacity(vocab_size);
        let mut detected_stop_token_ids = Vec::new();
        let mut present_bytes = ByteSet::with_capacity(256);
        for (token_id, token) in tokens.iter().enumerate() {
            let token_id = token_id as u32;
            match raw_token_to_id.entry(token.clone()) {
                Entry::Occupied(entry) => {
                    log::warn!(
                        "Token ID {} and token ID {} corresponds to the same token. \
                        The second token ID will be ignored when matching tokens to ids.",
                        entry.get(),
                        token_id
                    );
                }
                Entry::Vacant(entry) => {
                    entry.insert(token_id);
                }
            }
            let decoded = decode_token(&token.0, vocab_type)
                .map_err(|_| CreateVocabularyError::NonUtf8Token(token_id, vocab_type))?;
            if STOP_TOKENS.iter().any(|name| name.as_bytes() == &*token.0) {
                detected_stop_token_ids.push(token_id);
            }
            let is_control = SPECIAL_TOKENS
                .iter()
                .any(|name| name.as_bytes() == &*token.0);
            decoded_tokens.new_row::<0>();
            match decoded {
                Some(decoded) => {
                    if decoded.is_empty() || is_control {
                        special_token_ids.insert(token_id as usize);
                    } else {
                        for &byte in decoded.iter() {
                            present_bytes.insert(byte as usize);
                        }
                    }
                    decoded_tokens.extend_last_row_from_slice(&decoded);
                }
                None => {
                    log::warn!(
                        "Token ID {} cannot be decoded as a {} token. \
                        It will be treated as a special token and never match grammar content.",
                        token_id,
                        vocab_type
                    );
                    special_token_ids.insert(token_id as usize);
                }
            }
        }
        Self::check_vocabulary_utf8_support(&present_bytes);
        let decoded = |id: u32| decoded_tokens.view::<1, 1>([id as usize]).as_slice();
        let mut sorted_token_ids: Vec<u32> = (0..vocab_size as u32)
            .filter(|&id| !special_token_ids.contains(id as usize))
            .collect();
        sorted_token_ids.sort_unstable_by(|&a, &b| decoded(a).cmp(decoded(b)).then(a.cmp(&b)));
        let mut entries: Vec<(&[u8], u64)> = Vec::with_capacity(sorted_token_ids.len());
        for &id in sorted_token_ids.iter() {
            let bytes = decoded(id);
            // Tokens sharing a decoded form are indexed under the smallest ID.
            if entries.last().is_some_and(|&(last, _)| last == bytes) {
                continue;
            }
            entries.push((bytes, id as u64));
        }
        let decoded_index = fst::Map::from_iter(entries)?;
        Ok(Self {
            raw_tokens: tokens,
            decoded_tokens,
            raw_token_to_id,
            decoded_index,
            sorted_token_ids,
            special_token_ids,
            detected_stop_token_ids,
            vocab_type,
            prepend_space_in_tokenization,
        })
    }

    /// Creates a new instance of [Vocabulary] from token strings.
    ///
    /// This is a convenience wrapper around [Vocabulary::new].
    pub fn from_strings<S: AsRef<str>>(
        tokens: &[S],
        vocab_type: VocabType,
        prepend_space_in_tokenization: bool,
    ) -> Result<Vocabulary, CreateVocabularyError> {
        Self::new(
            tokens
                .iter()
                .map(|token| Token::from(token.as_ref()))
                .collect(),
            vocab_type,
            prepend_space_in_tokenization,
        )
    }

    fn check_vocabulary_utf8_support(present_bytes: &ByteSet) {
        let mut not_existing_bytes = ByteSet::with_capacity(256);
        for byte in 0..=247usize {
            if !present_bytes.contains(byte) {
                not_existing_bytes.insert(byte);
            }
        }
        if !not_existing_bytes.is_clear() {
            log::warn!(
                "\
The following bytes are not present in any decoded token: {:?}. \
This likely indicates that the vocabulary loading code is wrong, the vocabulary type is wrong \
or the tokenizer is not UTF-8 compatible. \
Grammars requiring these bytes cannot be matched by any token.",
                utils::get_display_form_from_bitset_on_stack(&not_existing_bytes)
            );
        }
    }

    /// Retrieves the token associated with the given token ID.
    ///
    /// # Returns
    ///
    /// * `Some(&Token)` - The token if it exists.
    /// * `None` - If the token ID is out of range.
    pub fn raw_token(&self, token_id: u32) -> Option<&Token> {
        self.raw_tokens.get(token_id as usize)
    }

    /// All the tokens, indexed by token ID.
    pub fn raw_vocab(&self) -> &[Token] {
        &self.raw_tokens
    }

    /// Retrieves the decoded bytes of the given token ID.
    ///
    /// # Returns
    ///
    /// * `Some(&[u8])` - The decoded bytes. Tokens that cannot be decoded have no bytes.
    /// * `None` - If the token ID is out of range.
    pub fn decoded_token(&self, token_id: u32) -> Option<&[u8]> {
        if (token_id as usize) < self.raw_tokens.len() {
            Some(self.decoded_unchecked(token_id))
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn decoded_unchecked(&self, token_id: u32) -> &[u8] {
        self.decoded_tokens
            .view::<1, 1>([token_id as usize])
            .as_slice()
    }

    /// The vocabulary type.
    pub fn vocab_type(&self) -> VocabType {
        self.vocab_type
    }

    /// Whether the tokenizer prepends a space to the text.
    pub fn prepend_space_in_tokenization(&self) -> bool {
        self.prepend_space_in_tokenization
    }

    /// Retrieves the size of the vocabulary.
    pub fn vocab_size(&self) -> usize {
        self.raw_tokens.len()
    }

    /// Retrieves the token ID associated with the given token.
    ///
    /// # Returns
    ///
    /// * `Some(u32)` - The token ID if it exists.
    /// * `None` - If the token does not exist in the vocabulary.
    pub fn token_id(&self, token: &Token) -> Option<u32> {
        self.raw_token_to_id.get(token).copied()
    }

    /// Retrieves the smallest ID of a regular token whose decoded form is `bytes`.
    pub fn token_id_from_decoded(&self, bytes: &[u8]) -> Option<u32> {
        self.decoded_index.get(bytes).map(|id| id as u32)
    }

    /// Whether the token never matches grammar content.
    pub fn is_special_token(&self, token_id: u32) -> bool {
        self.special_token_ids.contains(token_id as usize)
    }

    /// The IDs of the special tokens in ascending order.
    pub fn special_token_ids(&self) -> Vec<u32> {
        self.special_token_ids
            .ones()
            .map(|token_id| token_id as u32)
            .collect()
    }

    /// The IDs of the tokens recognized as stop tokens in ascending order.
    pub fn detected_stop_token_ids(&self) -> &[u32] {
        &self.detected_stop_token_ids
    }

    /// The regular token IDs sorted by their decoded bytes.
    pub(crate) fn sorted_token_ids(&self) -> &[u32] {
        &self.sorted_token_ids
    }
}

/// Decodes a token according to the vocabulary type.
///
/// # Returns
///
/// * `Ok(Some(bytes))` - The decoded bytes.
/// * `Ok(None)` - If the token has no decoding under the vocabulary type.
/// * `Err(_)` - If the vocabulary type requires UTF-8 and the token is not.
fn decode_token(token: &[u8], vocab_type: VocabType) -> Result<Option<Vec<u8>>, Utf8Error> {
    match vocab_type {
        VocabType::Raw => Ok(Some(token.to_vec())),
        VocabType::ByteFallback => Ok(Some(decode_byte_fallback(std::str::from_utf8(token)?))),
        VocabType::ByteLevel => Ok(decode_byte_level(std::str::from_utf8(token)?)),
    }
}

fn decode_byte_fallback(token: &str) -> Vec<u8> {
    if let Some(hex) = token.strip_prefix("<0x").and_then(|rest| rest.strip_suffix('>')) {
        if hex.len() == 2 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                return vec![byte];
            }
        }
    }
    token.replace(SENTENCEPIECE_SPACE, " ").into_bytes()
}

fn decode_byte_level(token: &str) -> Option<Vec<u8>> {
    token.chars().map(byte_level_char_to_byte).collect()
}

/// The inverse of GPT-2's byte to unicode table.
/// Printable bytes map to themselves; the others were shifted to `U+0100` onwards in ascending order.
fn byte_level_char_to_byte(c: char) -> Option<u8> {
    let code_point = c as u32;
    match code_point {
        0x21..=0x7E | 0xA1..=0xAC | 0xAE..=0xFF => Some(code_point as u8),
        0x100..=0x120 => Some((code_point - 0x100) as u8),
        0x121..=0x142 => Some((code_point - 0x121 + 0x7F) as u8),
        0x143 => Some(0xAD),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_byte_level_tokens() {
        let vocabulary =
            Vocabulary::from_strings(&["Ġhello", "Ċ", "ĉx", "ł", "Ń", "ä½ł"], VocabType::ByteLevel, false)
                .unwrap();
        assert_eq!(vocabulary.decoded_token(0), Some(&b" hello"[..]));
        assert_eq!(vocabulary.decoded_token(1), Some(&b"\n"[..]));
        assert_eq!(vocabulary.decoded_token(2), Some(&b"\tx"[..]));
        assert_eq!(vocabulary.decoded_token(3), Some(&[0xA0][..]));
        assert_eq!(vocabulary.decoded_token(4), Some(&[0xAD][..]));
        assert_eq!(vocabulary.decoded_token(5), Some("你".as_bytes()));
        assert_eq!(vocabulary.decoded_token(6), None);
    }

    #[test]
    fn decodes_byte_fallback_tokens() {
        let vocabulary = Vocabulary::from_strings(
            &["<0x0A>", "▁hello", "<0xZZ>", "<unk>", "a▁b"],
            VocabType::ByteFallback,
            true,
        )
        .unwrap();
        assert_eq!(vocabulary.decoded_token(0), Some(&b"\n"[..]));
        assert_eq!(vocabulary.decoded_token(1), Some(&b" hello"[..]));
        assert_eq!(vocabulary.decoded_token(2), Some(&b"<0xZZ>"[..]));
        assert_eq!(vocabulary.decoded_token(4), Some(&b"a b"[..]));
        assert_eq!(vocabulary.special_token_ids(), vec![3]);
        assert!(vocabulary.prepend_space_in_tokenization());
    }

    #[test]
    fn classifies_special_and_stop_tokens() {
        let vocabulary = Vocabulary::from_strings(
            &["<s>", "</s>", "", "a", "<|im_end|>", "ab"],
            VocabType::Raw,
            false,
        )
        .unwrap();
        assert_eq!(vocabulary.special_token_ids(), vec![0, 1, 2, 4]);
        assert_eq!(vocabulary.detected_stop_token_ids(), &[1, 4]);
        assert_eq!(vocabulary.sorted_token_ids(), &[3, 5]);
        assert_eq!(vocabulary.token_id_from_decoded(b"ab"), Some(5));
        assert_eq!(vocabulary.token_id_from_decoded(b"</s>"), None);
        assert_eq!(vocabulary.token_id(&Token::from("</s>")), Some(1));
    }

    #[test]
    fn duplicate_decoded_forms_resolve_to_the_smallest_id() {
        let vocabulary =
            Vocabulary::from_strings(&["▁", "<0x20>", "x"], VocabType::ByteFallback, false).unwrap();
        assert_eq!(vocabulary.sorted_token_ids(), &[0, 1, 2]);
        assert_eq!(vocabulary.token_id_from_decoded(b" "), Some(0));
    }

    #[test]
    fn rejects_non_utf8_tokens() {
        let tokens = vec![Token::from(&[0xFFu8][..])];
        assert!(Vocabulary::new(tokens.clone(), VocabType::Raw, false).is_ok());
        let error = Vocabulary::new(tokens, VocabType::ByteLevel, false).unwrap_err();
        assert_eq!(
            error.to_string(),
            "Token ID 0 is not valid UTF-8, which a BYTE_LEVEL vocabulary requires."
        );
    }

    #[test]
    fn rejects_oversized_vocabularies() {
        assert!(check_vocab_size(MAX_VOCAB_SIZE).is_ok());
        let error = check_vocab_size(MAX_VOCAB_SIZE + 1).unwrap_err();
        assert!(matches!(
            error,
            CreateVocabularyError::VocabularyTooLarge(size, MAX_VOCAB_SIZE) if size == MAX_VOCAB_SIZE + 1
        ));
        assert_eq!(
            error.to_string(),
            "The vocabulary size is 16777217, while the maximum supported is 16777216."
        );
    }

    #[test]
    fn raw_vocab_keeps_token_order() {
        let vocabulary =
            Vocabulary::from_strings(&["Ġa", "b", "Ġa"], VocabType::ByteLevel, false).unwrap();
        assert_eq!(
            vocabulary.raw_vocab(),
            &[Token::from("Ġa"), Token::from("b"), Token::from("Ġa")]
        );
        assert_eq!(vocabulary.vocab_type(), VocabType::ByteLevel);
        assert_eq!(vocabulary.decoded_token(0), Some(&b" a"[..]));
    }

    #[test]
    fn parses_vocab_types() {
        assert_eq!("byte_fallback".parse::<VocabType>().unwrap(), VocabType::ByteFallback);
        assert_eq!(VocabType::ByteLevel.to_string(), "BYTE_LEVEL");
        assert_eq!(serde_json::to_string(&VocabType::Raw).unwrap(), "\"RAW\"");
    }
}
