/*!
# gramask

This crate provides a constrained decoding engine
which ensures that a language model's output adheres strictly to the format defined by an EBNF grammar.
Before every decoding step the matcher computes a bitmask over the vocabulary
marking the tokens that keep the output inside the grammar's language.
Here is a quick example of how this crate works:

```rust
use std::sync::Arc;
use gramask::{Grammar, GrammarMatcher, MatcherConfig, MatcherLike, VocabType, Vocabulary};

let grammar = Arc::new(Grammar::new(r#"root ::= "你好" [0-9]+ "\n""#).unwrap());
let vocabulary = Arc::new(
    Vocabulary::from_strings(
        &["</s>", "你好", "hello", "250", "\n", "\n\n"],
        VocabType::Raw,
        false,
    )
    .unwrap(),
);
let mut matcher = GrammarMatcher::new(grammar, vocabulary, MatcherConfig::default()).unwrap();
assert_eq!(matcher.find_next_token_bitmask().unwrap().allowed_token_ids(), vec![1]);
assert!(matcher.accept_token(1));
let mut logits = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0]; // logits obtained from the language model
matcher
    .find_next_token_bitmask()
    .unwrap()
    .apply_to_logits(&mut logits)
    .unwrap();
assert_eq!(&format!("{:?}", logits), "[-inf, -inf, -inf, 1.0, -inf, -inf]");
assert!(matcher.accept_token(3));
assert_eq!(matcher.find_next_token_bitmask().unwrap().allowed_token_ids(), vec![3, 4]);
assert!(matcher.accept_token(4));
// The grammar is matched, so only the stop token is left.
assert_eq!(matcher.find_next_token_bitmask().unwrap().allowed_token_ids(), vec![0]);
assert!(matcher.accept_token(0));
assert!(matcher.is_terminated());
```

# Overview

The primary types in this crate are [MatcherLike] and [GrammarMatcher]. [MatcherLike] defines the behavior of a matcher,
while [GrammarMatcher] is a concrete implementation of [MatcherLike]. The most important methods are as follows:
- [GrammarMatcher::new]: creates a matcher from a shared [Grammar], a shared [Vocabulary] and a [MatcherConfig].
- [MatcherLike::find_next_token_bitmask]: computes the [TokenBitmask] of the tokens that can be accepted next.
- [MatcherLike::accept_token]: advances the matcher by one token.
- [MatcherLike::rollback]: undoes the last accepted tokens, up to [MatcherConfig::max_rollback_steps].

A [Grammar] and a [Vocabulary] are immutable once built and meant to be shared through [Arc](std::sync::Arc)
by all the matchers of a model. A [GrammarMatcher] follows exactly one generation sequence.

# EBNF grammar

The grammar is a list of rules of the form `name ::= expression`. A rule may span several lines and an optional `;`
ends it. `#` starts a comment that runs to the end of the line. The main rule is `root` unless configured otherwise.

| Syntax | Meaning |
| --- | --- |
| `"abc"`, `'abc'` | A literal string. `""` is the empty string. |
| `[a-z0-9_]`, `[^"\\]` | A character class, or its complement. Classes match Unicode scalar values. |
| `name` | A reference to another rule. Recursion is allowed but left recursion is rejected. |
| `a b` | Concatenation. |
| <code>a &#124; b</code> | Alternation. |
| `( ... )` | Grouping. |
| `a*`, `a+`, `a?` | Repetition. |
| `a{n}`, `a{n,}`, `a{n,m}` | Bounded repetition. |

Literals and classes support the escapes `\n`, `\r`, `\t`, `\\`, `\"`, `\'`, `\[`, `\]`, `\-`, `\^`, `\/`,
`\xHH`, `\uHHHH` and `\UHHHHHHHH`. [Grammar::builtin_json] provides a grammar of JSON, and [Grammar::from_json_schema] compiles
the grammar of the values a JSON schema accepts.

# Vocabulary

Tokens are given in the tokenizer's own encoding together with a [VocabType]:
- [VocabType::Raw]: the token bytes are the text.
- [VocabType::ByteFallback]: SentencePiece tokens, where `<0x0A>` is a single byte and `▁` is a space.
- [VocabType::ByteLevel]: GPT-2 style byte-level BPE tokens.

Control tokens such as `<s>` never match grammar content, and the usual end-of-sequence tokens are detected as stop tokens.
*/
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod automaton;
pub mod bitmask;
pub mod config;
pub mod grammar;
pub mod json_schema;
pub mod matcher;
pub mod matcher_like;
mod normalize;
mod parser;
mod utf8;
mod utils;
pub mod vocabulary;
pub use bitmask::get_rejected_tokens;
pub use bitmask::TokenBitmask;
pub use config::{Config, GrammarConfig, JsonSchemaConfig, MatcherConfig};
pub use grammar::Grammar;
pub use matcher::GrammarMatcher;
pub use matcher_like::MatcherLike;
pub use vocabulary::Token;
pub use vocabulary::VocabType;
pub use vocabulary::Vocabulary;
