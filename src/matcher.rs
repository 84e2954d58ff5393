//! The main module that contains the [`GrammarMatcher`] struct and its related types.
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;

use ahash::AHashMap;
use fixedbitset_stack::FixedBitSet;

use crate::automaton::{ClosureScratch, PositionSet};
use crate::bitmask::TokenBitmask;
use crate::config::{Config, MatcherConfig};
use crate::grammar::{CreateGrammarError, Grammar};
use crate::matcher_like::{sealed, FindBitmaskError, MatcherLike, RollbackError};
use crate::utils;
use crate::vocabulary::Vocabulary;

/// Jump-forward strings are cut off at this many bytes, since a grammar may force an infinite string.
const MAX_JUMP_FORWARD_BYTES: usize = 4096;

#[derive(Debug, thiserror::Error)]
/// Represents the error type for the [`GrammarMatcher`] creation.
pub enum CreateMatcherError {
    #[error("{0}")] // inherits the error message from the wrapped GrammarError
    /// A wrapper for the [`CreateGrammarError`] error type.
    GrammarError(#[from] CreateGrammarError),
    /// A stop token ID does not exist in the vocabulary.
    #[error("The stop token ID {token_id} is out of range for a vocabulary of size {vocab_size}.")]
    StopTokenOutOfRange {
        /// The stop token ID.
        token_id: u32,
        /// The vocabulary size.
        vocab_size: usize,
    },
}

/// The matcher state recorded before each accepted token.
#[derive(Debug, Clone)]
struct Snapshot {
    positions: PositionSet,
    stopped: bool,
    tokens_accepted: usize,
}

/// The bitmask depends on the positions and on whether the leading space of a token is dropped.
type CacheKey = (PositionSet, bool);

/// The struct that tracks the match progress of one generation sequence against a [`Grammar`].
#[derive(Clone)]
pub struct GrammarMatcher {
    grammar: Arc<Grammar>,
    vocabulary: Arc<Vocabulary>,
    stop_token_ids: Vec<u32>,
    stop_tokens: FixedBitSet,
    terminate_without_stop_token: bool,
    mask_vocab_size: usize,
    max_rollback_steps: usize,
    cache_enabled: bool,
    max_cache_entries: usize,
    current: PositionSet,
    stopped: bool,
    tokens_accepted: usize,
    history: VecDeque<Snapshot>,
    cache: AHashMap<CacheKey, TokenBitmask>,
    scratch: ClosureScratch,
}

impl Debug for GrammarMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrammarMatcher")
            .field("grammar", &self.grammar)
            .field("vocabulary", &self.vocabulary)
            .field("stop_token_ids", &self.stop_token_ids)
            .field(
                "terminate_without_stop_token",
                &self.terminate_without_stop_token,
            )
            .field("mask_vocab_size", &self.mask_vocab_size)
            .field("max_rollback_steps", &self.max_rollback_steps)
            .field("current", &self.current)
            .field("stopped", &self.stopped)
            .field("tokens_accepted", &self.tokens_accepted)
            .field("history_len", &self.history.len())
            .field("cache_len", &self.cache.len())
            .finish()
    }
}

impl GrammarMatcher {
    /// Creates a new [`GrammarMatcher`].
    ///
    /// # Arguments
    ///
    /// * `grammar` - The compiled grammar, shared by all matchers.
    /// * `vocabulary` - The vocabulary, shared by all matchers.
    /// * `config` - The [`MatcherConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`CreateMatcherError::StopTokenOutOfRange`] when a configured stop token does not exist in the vocabulary.
    pub fn new(
        grammar: Arc<Grammar>,
        vocabulary: Arc<Vocabulary>,
        config: MatcherConfig,
    ) -> Result<GrammarMatcher, CreateMatcherError> {
        let vocab_size = vocabulary.vocab_size();
        let stop_token_ids = match config.stop_token_ids {
            Some(ids) => ids,
            None => vocabulary.detected_stop_token_ids().to_vec(),
        };
        let mut stop_tokens = FixedBitSet::with_capacity(vocab_size);
        for &token_id in stop_token_ids.iter() {
            if token_id as usize >= vocab_size {
                return Err(CreateMatcherError::StopTokenOutOfRange {
                    token_id,
                    vocab_size,
                });
            }
            stop_tokens.insert(token_id as usize);
        }
        let current = grammar.automaton().initial_positions();
        Ok(GrammarMatcher {
            grammar,
            vocabulary,
            stop_token_ids,
            stop_tokens,
            terminate_without_stop_token: config.terminate_without_stop_token,
            mask_vocab_size: config.mask_vocab_size.unwrap_or(vocab_size),
            max_rollback_steps: config.max_rollback_steps,
            cache_enabled: config.cache_enabled,
            max_cache_entries: config.max_cache_entries,
            current,
            stopped: false,
            tokens_accepted: 0,
            history: VecDeque::with_capacity(config.max_rollback_steps),
            cache: AHashMap::default(),
            scratch: ClosureScratch::default(),
        })
    }

    /// Compiles an EBNF grammar and creates a [`GrammarMatcher`] for it in one call.
    ///
    /// # Errors
    ///
    /// Returns a [`CreateMatcherError`] when the grammar cannot be compiled or the matcher cannot be created.
    pub fn from_ebnf(
        ebnf: &str,
        vocabulary: Arc<Vocabulary>,
        config: Config,
    ) -> Result<GrammarMatcher, CreateMatcherError> {
        let grammar = Grammar::with_config(ebnf, config.grammar_config)?;
        Self::new(Arc::new(grammar), vocabulary, config.matcher_config)
    }

    /// Tries to accept a string as if it were one token.
    pub fn accept_string(&mut self, input: &str) -> bool {
        self.accept_bytes(input.as_bytes())
    }

    /// The number of bits of the bitmasks.
    pub fn mask_vocab_size(&self) -> usize {
        self.mask_vocab_size
    }

    /// The number of accepted tokens that can be rolled back at most.
    pub fn max_rollback_steps(&self) -> usize {
        self.max_rollback_steps
    }

    /// The tokens that end the generation.
    pub fn stop_token_ids(&self) -> &[u32] {
        &self.stop_token_ids
    }

    /// The number of accepted tokens that can currently be rolled back.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Whether the leading space of the next token is dropped before matching.
    fn strips_leading_space(&self) -> bool {
        self.tokens_accepted == 0 && self.vocabulary.prepend_space_in_tokenization()
    }

    fn record_history(&mut self) {
        if self.max_rollback_steps == 0 {
            return;
        }
        if self.history.len() == self.max_rollback_steps {
            self.history.pop_front();
        }
        self.history.push_back(Snapshot {
            positions: self.current.clone(),
            stopped: self.stopped,
            tokens_accepted: self.tokens_accepted,
        });
    }

    /// Steps the bytes from the current positions, committing only if all of them are accepted.
    fn advance(&mut self, bytes: &[u8]) -> bool {
        let Some(next) =
            self.grammar
                .automaton()
                .step_bytes_with(&self.current, bytes, &mut self.scratch)
        else {
            return false;
        };
        self.record_history();
        self.current = next;
        self.tokens_accepted += 1;
        true
    }

    fn compute_bitmask(&mut self, strip_leading_space: bool) -> TokenBitmask {
        let grammar = Arc::clone(&self.grammar);
        let vocabulary = Arc::clone(&self.vocabulary);
        let automaton = grammar.automaton();
        let eval_limit = self.mask_vocab_size.min(vocabulary.vocab_size());
        let mut bitmask = TokenBitmask::new_rejecting_all(self.mask_vocab_size);
        let first_bytes = automaton.allowed_first_bytes(&self.current);
        // prefix_sets[k] holds the positions after the first k bytes of the previous token.
        let mut prefix_sets: Vec<PositionSet> = vec![self.current.clone()];
        let mut previous: &[u8] = &[];
        // The length of the shortest prefix of `previous` that is known to fail.
        let mut dead_prefix_len: Option<usize> = None;
        let mut evaluated = 0usize;
        for &token_id in vocabulary.sorted_token_ids() {
            if token_id as usize >= eval_limit || self.stop_tokens.contains(token_id as usize) {
                continue;
            }
            evaluated += 1;
            let token = vocabulary.decoded_unchecked(token_id);
            let lcp = utils::common_prefix_len(previous, token);
            previous = token;
            if dead_prefix_len.is_some_and(|len| lcp >= len) {
                continue;
            }
            dead_prefix_len = None;
            prefix_sets.truncate(lcp.min(prefix_sets.len() - 1) + 1);
            for depth in prefix_sets.len() - 1..token.len() {
                let byte = token[depth];
                let positions = &prefix_sets[depth];
                let next = if depth == 0 && strip_leading_space && byte == b' ' {
                    positions.clone()
                } else if depth == 0 && !first_bytes.contains(byte as usize) {
                    PositionSet::default()
                } else {
                    automaton.step_with(positions, byte, &mut self.scratch)
                };
                if next.is_dead() {
                    dead_prefix_len = Some(depth + 1);
                    break;
                }
                prefix_sets.push(next);
            }
            if dead_prefix_len.is_none() {
                bitmask.allow(token_id);
            }
        }
        if self.current.is_accepting() {
            for &token_id in self.stop_token_ids.iter() {
                if (token_id as usize) < eval_limit {
                    bitmask.allow(token_id);
                }
            }
        }
        log::trace!(
            "Computed the token bitmask: {} of {} evaluated tokens are allowed.",
            bitmask.count_allowed(),
            evaluated
        );
        bitmask
    }
}

impl sealed::Sealed for GrammarMatcher {}

impl MatcherLike for GrammarMatcher {
    fn accept_token(&mut self, token_id: u32) -> bool {
        if self.stopped {
            log::debug!(
                "Token ID {} is rejected because the matcher is terminated.",
                token_id
            );
            return false;
        }
        if token_id as usize >= self.vocabulary.vocab_size() {
            return false;
        }
        if self.stop_tokens.contains(token_id as usize) {
            if !self.current.is_accepting() {
                log::debug!(
                    "Stop token ID {} is rejected because the grammar is not matched yet.",
                    token_id
                );
                return false;
            }
            self.record_history();
            self.stopped = true;
            self.tokens_accepted += 1;
            return true;
        }
        if self.vocabulary.is_special_token(token_id) {
            return false;
        }
        let vocabulary = Arc::clone(&self.vocabulary);
        let mut bytes = vocabulary.decoded_unchecked(token_id);
        if self.strips_leading_space() {
            if let Some(rest) = bytes.strip_prefix(b" ") {
                bytes = rest;
            }
        }
        self.advance(bytes)
    }

    fn accept_bytes(&mut self, bytes: &[u8]) -> bool {
        if self.stopped {
            return false;
        }
        self.advance(bytes)
    }

    fn rollback(&mut self, num_tokens: usize) -> Result<(), RollbackError> {
        if num_tokens > self.max_rollback_steps || num_tokens > self.history.len() {
            return Err(RollbackError::RollbackLimitExceeded {
                requested: num_tokens,
                available: self.history.len(),
                max_rollback_steps: self.max_rollback_steps,
            });
        }
        let mut removed = self.history.split_off(self.history.len() - num_tokens);
        if let Some(snapshot) = removed.pop_front() {
            self.current = snapshot.positions;
            self.stopped = snapshot.stopped;
            self.tokens_accepted = snapshot.tokens_accepted;
            log::debug!("Rolled back {} tokens.", num_tokens);
        }
        Ok(())
    }

    fn find_next_token_bitmask(&mut self) -> Result<TokenBitmask, FindBitmaskError> {
        if self.stopped {
            return Err(FindBitmaskError::Terminated);
        }
        let strip_leading_space = self.strips_leading_space();
        if !self.cache_enabled {
            return Ok(self.compute_bitmask(strip_leading_space));
        }
        let key = (self.current.clone(), strip_leading_space);
        if let Some(bitmask) = self.cache.get(&key) {
            return Ok(bitmask.clone());
        }
        let bitmask = self.compute_bitmask(strip_leading_space);
        if self.max_cache_entries > 0 {
            if self.cache.len() >= self.max_cache_entries {
                log::debug!(
                    "The bitmask cache reached {} entries and is cleared.",
                    self.cache.len()
                );
                self.cache.clear();
            }
            self.cache.insert(key, bitmask.clone());
        }
        Ok(bitmask)
    }

    fn find_jump_forward_string(&mut self) -> String {
        if self.stopped {
            return String::new();
        }
        let grammar = Arc::clone(&self.grammar);
        let automaton = grammar.automaton();
        let mut positions = self.current.clone();
        let mut bytes = Vec::new();
        while !positions.is_accepting() && bytes.len() < MAX_JUMP_FORWARD_BYTES {
            let Some(byte) = automaton.forced_byte(&positions) else {
                break;
            };
            positions = automaton.step_with(&positions, byte, &mut self.scratch);
            bytes.push(byte);
        }
        match String::from_utf8(bytes) {
            Ok(string) => string,
            Err(e) => {
                let valid_up_to = e.utf8_error().valid_up_to();
                let mut bytes = e.into_bytes();
                bytes.truncate(valid_up_to);
                String::from_utf8(bytes).unwrap_or_default()
            }
        }
    }

    fn is_terminated(&self) -> bool {
        self.stopped || (self.terminate_without_stop_token && self.current.is_accepting())
    }

    fn can_terminate(&self) -> bool {
        self.stopped || self.current.is_accepting()
    }

    fn reset(&mut self) {
        self.current = self.grammar.automaton().initial_positions();
        self.stopped = false;
        self.tokens_accepted = 0;
        self.history.clear();
        log::debug!("The matcher is reset.");
    }

    fn into_boxed_matcher(self) -> Box<dyn MatcherLike + Send> {
        Box::new(self)
    }

    fn vocab(&self) -> Arc<Vocabulary> {
        Arc::clone(&self.vocabulary)
    }

    fn grammar(&self) -> Arc<Grammar> {
        Arc::clone(&self.grammar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocabulary::VocabType;

    fn matcher(ebnf: &str, tokens: &[&str], config: MatcherConfig) -> GrammarMatcher {
        let vocabulary =
            Arc::new(Vocabulary::from_strings(tokens, VocabType::Raw, false).unwrap());
        GrammarMatcher::new(Arc::new(Grammar::new(ebnf).unwrap()), vocabulary, config).unwrap()
    }

    #[test]
    fn shared_dead_prefixes_are_skipped() {
        let mut matcher = matcher(
            r#"root ::= "ab" [0-9]*"#,
            &["a", "ab", "abc", "abcd", "ab1", "ab12", "b", "</s>"],
            MatcherConfig::default(),
        );
        let bitmask = matcher.find_next_token_bitmask().unwrap();
        assert_eq!(bitmask.allowed_token_ids(), vec![0, 1, 4, 5]);
        assert!(matcher.accept_token(1));
        let bitmask = matcher.find_next_token_bitmask().unwrap();
        assert_eq!(bitmask.allowed_token_ids(), vec![7]);
        assert!(matcher.accept_string("12"));
        assert!(matcher.find_next_token_bitmask().unwrap().is_allowed(7));
    }

    #[test]
    fn leading_space_is_dropped_for_the_first_token_only() {
        let vocabulary = Arc::new(
            Vocabulary::from_strings(&["▁a", "▁", "a", "</s>"], VocabType::ByteFallback, true)
                .unwrap(),
        );
        let grammar = Arc::new(Grammar::new(r#"root ::= "a" " a"?"#).unwrap());
        let mut matcher =
            GrammarMatcher::new(grammar, vocabulary, MatcherConfig::default()).unwrap();
        assert_eq!(
            matcher.find_next_token_bitmask().unwrap().allowed_token_ids(),
            vec![0, 1, 2]
        );
        assert!(matcher.accept_token(0));
        assert_eq!(
            matcher.find_next_token_bitmask().unwrap().allowed_token_ids(),
            vec![0, 1, 3]
        );
        assert!(matcher.accept_token(0));
        assert!(matcher.can_terminate());
    }

    #[test]
    fn stop_tokens_must_be_in_range() {
        let vocabulary = Arc::new(Vocabulary::from_strings(&["a"], VocabType::Raw, false).unwrap());
        let config = MatcherConfig {
            stop_token_ids: Some(vec![1]),
            ..Default::default()
        };
        let error = GrammarMatcher::new(
            Arc::new(Grammar::new(r#"root ::= "a""#).unwrap()),
            vocabulary,
            config,
        )
        .unwrap_err();
        assert_eq!(
            error.to_string(),
            "The stop token ID 1 is out of range for a vocabulary of size 1."
        );
    }

    #[test]
    fn cached_and_uncached_bitmasks_agree() {
        let tokens = ["a", "b", "ab", "ba", "</s>"];
        let ebnf = r#"root ::= ("a" | "b")* "b""#;
        let mut cached = matcher(ebnf, &tokens, MatcherConfig::default());
        let mut uncached = matcher(
            ebnf,
            &tokens,
            MatcherConfig {
                cache_enabled: false,
                ..Default::default()
            },
        );
        for token_id in [0, 2, 3, 1] {
            assert_eq!(
                cached.find_next_token_bitmask().unwrap(),
                uncached.find_next_token_bitmask().unwrap()
            );
            assert!(cached.accept_token(token_id));
            assert!(uncached.accept_token(token_id));
        }
        assert!(cached.find_next_token_bitmask().unwrap().is_allowed(4));
    }

    #[test]
    fn cache_is_bounded() {
        let mut matcher = matcher(
            r#"root ::= "abcd""#,
            &["a", "b", "c", "d", "</s>"],
            MatcherConfig {
                max_cache_entries: 2,
                ..Default::default()
            },
        );
        let mut sizes = Vec::new();
        for token_id in 0..4 {
            assert_eq!(
                matcher.find_next_token_bitmask().unwrap().allowed_token_ids(),
                vec![token_id]
            );
            sizes.push(matcher.cache.len());
            assert!(matcher.accept_token(token_id));
        }
        assert_eq!(sizes, vec![1, 2, 1, 2]);
        matcher.reset();
        assert_eq!(
            matcher.find_next_token_bitmask().unwrap().allowed_token_ids(),
            vec![0]
        );
        assert_eq!(matcher.cache.len(), 1);
    }

    #[test]
    fn empty_input_is_a_rollback_step() {
        let mut matcher = matcher(
            r#"root ::= "ab""#,
            &["a", "b", "</s>"],
            MatcherConfig {
                max_rollback_steps: 3,
                ..Default::default()
            },
        );
        assert!(matcher.accept_token(0));
        assert!(matcher.accept_bytes(b""));
        assert_eq!(matcher.history_len(), 2);
        matcher.rollback(1).unwrap();
        assert_eq!(
            matcher.find_next_token_bitmask().unwrap().allowed_token_ids(),
            vec![1]
        );
        matcher.rollback(1).unwrap();
        assert_eq!(
            matcher.find_next_token_bitmask().unwrap().allowed_token_ids(),
            vec![0]
        );
    }
}
