//! The configuration module of the grammar matcher.
use serde::{Deserialize, Serialize};

/// The configuration of the [`GrammarMatcher`](crate::matcher::GrammarMatcher) construction.
/// This should suffice most scenarios.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct Config {
    /// The configuration of the grammar compilation.
    pub grammar_config: GrammarConfig,
    /// The configuration of the matcher itself.
    pub matcher_config: MatcherConfig,
}

/// The configuration of the [`Grammar`](crate::grammar::Grammar) compilation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GrammarConfig {
    /// The rule the whole output must match.
    /// The default is `root`.
    pub main_rule: String,
    /// Whether nested groups, options and repetitions are lifted into helper rules
    /// before the automaton is built.
    /// The default is `true`.
    pub normalize: bool,
}

impl Default for GrammarConfig {
    fn default() -> Self {
        Self {
            main_rule: "root".to_string(),
            normalize: true,
        }
    }
}

/// The configuration of [`Grammar::from_json_schema`](crate::grammar::Grammar::from_json_schema).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JsonSchemaConfig {
    /// Whether any amount of spaces, newlines and tabs is allowed around the structural characters.
    /// When set, `indent` is ignored and only the non-whitespace part of `separators` is kept.
    /// The default is `true`.
    pub any_whitespace: bool,
    /// The number of spaces per nesting level. `None` keeps the whole value on one line.
    /// The default is `None`.
    pub indent: Option<usize>,
    /// The item separator and the key-value separator.
    /// `None` means `(", ", ": ")` without indentation and `(",", ": ")` with it.
    /// The default is `None`.
    pub separators: Option<(String, String)>,
    /// Whether arrays and objects are restricted to the items and properties the schema lists.
    /// In strict mode, arrays and objects are also never empty unless the schema leaves nothing to put in them.
    /// The default is `true`.
    pub strict_mode: bool,
}

impl Default for JsonSchemaConfig {
    fn default() -> Self {
        Self {
            any_whitespace: true,
            indent: None,
            separators: None,
            strict_mode: true,
        }
    }
}

/// The configuration of the [`GrammarMatcher`](crate::matcher::GrammarMatcher).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MatcherConfig {
    /// The tokens that end the generation.
    /// `None` means the stop tokens detected by the [`Vocabulary`](crate::vocabulary::Vocabulary) are used.
    /// The default is `None`.
    pub stop_token_ids: Option<Vec<u32>>,
    /// Whether the matcher is terminated as soon as the grammar is matched, without a stop token.
    /// The default is `false`.
    pub terminate_without_stop_token: bool,
    /// The number of bits of the token bitmask, which may exceed the vocabulary size when the model pads its vocabulary.
    /// `None` means the vocabulary size is used.
    /// The default is `None`.
    pub mask_vocab_size: Option<usize>,
    /// The number of accepted tokens that can be rolled back.
    /// The default is `0`.
    pub max_rollback_steps: usize,
    /// Whether the token bitmasks are cached per matcher state.
    /// Enabling the cache speeds up repeated states, for example in grammars with many repetitions, at the cost of memory.
    /// The default is `true`.
    pub cache_enabled: bool,
    /// The number of cached bitmasks after which the cache is cleared.
    /// Each entry holds one bit per token, so long generations over large vocabularies should keep this bounded.
    /// The default is `1024`.
    pub max_cache_entries: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            stop_token_ids: None,
            terminate_without_stop_token: false,
            mask_vocab_size: None,
            max_rollback_steps: 0,
            cache_enabled: true,
            max_cache_entries: 1024,
        }
    }
}
