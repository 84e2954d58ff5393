//! The grammar module that contains the [`Grammar`] struct, its expression tree and its related errors.
use std::fmt::{Debug, Display};

use ahash::AHashMap;
use string_interner::{DefaultStringInterner, DefaultSymbol};

use crate::automaton::Automaton;
use crate::config::{GrammarConfig, JsonSchemaConfig};
use crate::json_schema::{self, JsonSchemaError};
use crate::normalize;
use crate::parser::{self, ParsedExpr};
use crate::utils;

/// The EBNF grammar of JSON, with `root` as the main rule.
///
/// The top level value must be an object or an array, and no whitespace is allowed after it.
pub const JSON_GRAMMAR: &str = r#"
root ::= object | array
value ::= object | array | string | number | "true" | "false" | "null"
object ::= "{" ws ( member ( ws "," ws member )* ws )? "}"
member ::= string ws ":" ws value
array ::= "[" ws ( value ( ws "," ws value )* ws )? "]"
string ::= "\"" char* "\""
char ::= [^"\\\x00-\x1f] | "\\" escape
escape ::= ["\\/bfnrt] | "u" [A-Fa-f0-9]{4}
number ::= "-"? ( "0" | [1-9] [0-9]* ) ( "." [0-9]+ )? ( [eE] [+-]? [0-9]+ )?
ws ::= [ \n\t]*
"#;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
/// The wrapper struct that represents the index of a rule in the grammar's rule table.
pub struct RuleId(pub u32);

impl RuleId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// An expression in a rule's body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    /// Matches the empty string.
    Empty,
    /// Matches the bytes exactly.
    Literal(Vec<u8>),
    /// Matches one Unicode scalar value, encoded in UTF-8, inside (or outside, if `negated`) the inclusive ranges.
    CharClass {
        /// Whether the class is complemented.
        negated: bool,
        /// Inclusive code point ranges.
        ranges: Vec<(u32, u32)>,
    },
    /// Matches the referenced rule.
    RuleRef(RuleId),
    /// Matches the items one after another.
    Sequence(Vec<Expr>),
    /// Matches any one of the alternatives.
    Choice(Vec<Expr>),
    /// Matches the expression at least `min` and at most `max` times. `None` means no upper bound.
    Repeat {
        /// The repeated expression.
        expr: Box<Expr>,
        /// The minimum number of repetitions.
        min: u32,
        /// The maximum number of repetitions.
        max: Option<u32>,
    },
}

/// A named rule of the grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// The interned name of the rule.
    pub name: DefaultSymbol,
    /// The body of the rule.
    pub body: Expr,
}

#[derive(Debug, thiserror::Error)]
/// The error type for errors in [`Grammar`] creation.
pub enum CreateGrammarError {
    #[error("EBNF syntax error at line {line}, column {column}: {message}")]
    /// The grammar text is malformed.
    SyntaxError {
        /// The 1-based line of the error.
        line: usize,
        /// The 1-based column, in characters, of the error.
        column: usize,
        /// What went wrong.
        message: String,
    },
    #[error("EBNF semantics error: {0}")]
    /// The grammar text is well formed but does not describe a valid grammar.
    SemanticError(#[from] SemanticError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// The semantic errors of an EBNF grammar.
pub enum SemanticError {
    #[error("the main rule `{0}` is not defined")]
    /// The main rule is not defined.
    UndefinedMainRule(String),
    #[error("rule `{rule}` references the undefined rule `{reference}`")]
    /// A rule reference does not resolve.
    UndefinedRule {
        /// The rule containing the reference.
        rule: String,
        /// The unresolved name.
        reference: String,
    },
    #[error("rule `{0}` is defined more than once")]
    /// Two rules share the same name.
    DuplicateRule(String),
    #[error("rule `{0}` is left recursive")]
    /// A rule can reach itself without consuming any input.
    LeftRecursion(String),
}

/// A compiled grammar. It is immutable and meant to be shared through an [`Arc`](std::sync::Arc).
#[derive(Clone)]
pub struct Grammar {
    rules: Vec<Rule>,
    interned_rule_names: DefaultStringInterner,
    rule_ids: AHashMap<DefaultSymbol, RuleId>,
    main_rule: RuleId,
    normalized: bool,
    automaton: Automaton,
}

impl Debug for Grammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grammar")
            .field("rules", &self.to_string())
            .field("main_rule", &self.rule_name(self.main_rule))
            .field("normalized", &self.normalized)
            .field("automaton", &self.automaton)
            .finish()
    }
}

impl Grammar {
    /// Compiles an EBNF grammar whose main rule is `root`, normalizing it.
    ///
    /// # Errors
    ///
    /// Returns a [`CreateGrammarError`] when the grammar is malformed or invalid.
    pub fn new(ebnf: &str) -> Result<Grammar, CreateGrammarError> {
        Self::with_config(ebnf, GrammarConfig::default())
    }

    /// Compiles an EBNF grammar with a [`GrammarConfig`].
    ///
    /// # Errors
    ///
    /// Returns a [`CreateGrammarError`] when the grammar is malformed or invalid.
    pub fn with_config(ebnf: &str, config: GrammarConfig) -> Result<Grammar, CreateGrammarError> {
        Self::compile(ebnf, &config.main_rule, config.normalize)
    }

    /// Compiles the builtin [JSON grammar](JSON_GRAMMAR).
    ///
    /// # Errors
    ///
    /// This only fails if the builtin grammar itself is broken.
    pub fn builtin_json() -> Result<Grammar, CreateGrammarError> {
        Self::new(JSON_GRAMMAR)
    }

    /// Compiles a grammar of the JSON values a JSON schema accepts.
    ///
    /// The generated rules can be inspected with [`json_schema::json_schema_to_ebnf`].
    ///
    /// # Errors
    ///
    /// Returns a [`JsonSchemaError`] when the schema is not valid JSON or uses something that cannot be converted.
    pub fn from_json_schema(
        schema: &str,
        config: JsonSchemaConfig,
    ) -> Result<Grammar, JsonSchemaError> {
        let ebnf = json_schema::json_schema_to_ebnf(schema, &config)?;
        log::debug!("Converted the JSON schema into the grammar:\n{}", ebnf);
        Ok(Self::new(&ebnf)?)
    }

    /// Compiles an EBNF grammar.
    ///
    /// # Arguments
    ///
    /// * `ebnf` - The grammar text.
    /// * `main_rule` - The name of the rule the whole output must match.
    /// * `normalize` - Whether to rewrite the rules into the restricted form before building the automaton.
    ///   Without normalization the rules are kept exactly as parsed, which is mostly useful for debugging.
    ///
    /// # Errors
    ///
    /// Returns [`CreateGrammarError::SyntaxError`] for malformed text and
    /// [`CreateGrammarError::SemanticError`] for undefined, duplicate or left recursive rules.
    pub fn compile(
        ebnf: &str,
        main_rule: &str,
        normalize: bool,
    ) -> Result<Grammar, CreateGrammarError> {
        let parsed = parser::parse_grammar(ebnf)?;
        let mut interned_rule_names = DefaultStringInterner::new();
        let mut rule_ids = AHashMap::with_capacity(parsed.len());
        let mut names = Vec::with_capacity(parsed.len());
        for (index, rule) in parsed.iter().enumerate() {
            let symbol = interned_rule_names.get_or_intern(rule.name);
            if rule_ids.insert(symbol, RuleId(index as u32)).is_some() {
                return Err(SemanticError::DuplicateRule(rule.name.to_string()).into());
            }
            names.push(symbol);
        }
        let main_rule_id = interned_rule_names
            .get(main_rule)
            .and_then(|symbol| rule_ids.get(&symbol).copied())
            .ok_or_else(|| SemanticError::UndefinedMainRule(main_rule.to_string()))?;
        let mut rules = Vec::with_capacity(parsed.len());
        for (rule, name) in parsed.iter().zip(names) {
            let resolver = |reference: &str| {
                interned_rule_names
                    .get(reference)
                    .and_then(|symbol| rule_ids.get(&symbol).copied())
                    .ok_or_else(|| SemanticError::UndefinedRule {
                        rule: rule.name.to_string(),
                        reference: reference.to_string(),
                    })
            };
            let body = resolve(&rule.body, &resolver)?;
            rules.push(Rule { name, body });
        }
        let user_rule_count = rules.len();
        if normalize {
            rules = normalize::normalize(rules, &mut interned_rule_names, &mut rule_ids);
        }
        let automaton = Automaton::new(&rules, main_rule_id);
        if let Some(rule) = automaton.find_left_recursion(user_rule_count) {
            let name = interned_rule_names
                .resolve(rules[rule.index()].name)
                .unwrap_or_default()
                .to_string();
            return Err(SemanticError::LeftRecursion(name).into());
        }
        Ok(Grammar {
            rules,
            interned_rule_names,
            rule_ids,
            main_rule: main_rule_id,
            normalized: normalize,
            automaton,
        })
    }

    /// Retrieves the rule table, in definition order followed by generated helper rules.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Retrieves the id of the main rule.
    pub fn main_rule(&self) -> RuleId {
        self.main_rule
    }

    /// Whether the rules were normalized.
    pub fn is_normalized(&self) -> bool {
        self.normalized
    }

    /// Retrieves the name of a rule.
    ///
    /// # Returns
    ///
    /// * `Some(&str)` - The name if the rule exists.
    /// * `None` - If the rule id is out of range.
    pub fn rule_name(&self, rule: RuleId) -> Option<&str> {
        self.rules
            .get(rule.index())
            .and_then(|r| self.interned_rule_names.resolve(r.name))
    }

    /// Retrieves the id of the rule with the given name.
    pub fn rule_id(&self, name: &str) -> Option<RuleId> {
        self.interned_rule_names
            .get(name)
            .and_then(|symbol| self.rule_ids.get(&symbol).copied())
    }

    /// Retrieves the compiled automaton.
    pub fn automaton(&self) -> &Automaton {
        &self.automaton
    }

    fn fmt_expr(
        &self,
        expr: &Expr,
        nested: bool,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match expr {
            Expr::Empty => write!(f, "\"\""),
            Expr::Literal(bytes) => write!(f, "\"{}\"", utils::escape_bytes(bytes)),
            Expr::CharClass { negated, ranges } => {
                write!(f, "[{}", if *negated { "^" } else { "" })?;
                for &(lo, hi) in ranges {
                    if lo == hi {
                        write!(f, "{}", utils::escape_class_char(lo))?;
                    } else {
                        write!(
                            f,
                            "{}-{}",
                            utils::escape_class_char(lo),
                            utils::escape_class_char(hi)
                        )?;
                    }
                }
                write!(f, "]")
            }
            Expr::RuleRef(rule) => write!(f, "{}", self.rule_name(*rule).unwrap_or("<unknown>")),
            Expr::Sequence(items) => {
                if items.is_empty() {
                    return write!(f, "\"\"");
                }
                if nested && items.len() > 1 {
                    write!(f, "(")?;
                }
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    self.fmt_expr(item, true, f)?;
                }
                if nested && items.len() > 1 {
                    write!(f, ")")?;
                }
                Ok(())
            }
            Expr::Choice(alternatives) => {
                if nested && alternatives.len() > 1 {
                    write!(f, "(")?;
                }
                for (i, alternative) in alternatives.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    self.fmt_expr(alternative, nested && alternatives.len() == 1, f)?;
                }
                if nested && alternatives.len() > 1 {
                    write!(f, ")")?;
                }
                Ok(())
            }
            Expr::Repeat { expr, min, max } => {
                self.fmt_expr(expr, true, f)?;
                match (min, max) {
                    (0, None) => write!(f, "*"),
                    (1, None) => write!(f, "+"),
                    (0, Some(1)) => write!(f, "?"),
                    (min, None) => write!(f, "{{{min},}}"),
                    (min, Some(max)) if min == max => write!(f, "{{{min}}}"),
                    (min, Some(max)) => write!(f, "{{{min},{max}}}"),
                }
            }
        }
    }
}

impl Display for Grammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for rule in self.rules.iter() {
            let name = self
                .interned_rule_names
                .resolve(rule.name)
                .unwrap_or("<unknown>");
            write!(f, "{name} ::= ")?;
            self.fmt_expr(&rule.body, false, f)?;
            writeln!(f)?;
        }
        Ok(())
    }
}

fn resolve(
    expr: &ParsedExpr<'_>,
    resolver: &impl Fn(&str) -> Result<RuleId, SemanticError>,
) -> Result<Expr, SemanticError> {
    Ok(match expr {
        ParsedExpr::Literal(bytes) if bytes.is_empty() => Expr::Empty,
        ParsedExpr::Literal(bytes) => Expr::Literal(bytes.clone()),
        ParsedExpr::CharClass { negated, ranges } => Expr::CharClass {
            negated: *negated,
            ranges: ranges.clone(),
        },
        ParsedExpr::RuleRef(name) => Expr::RuleRef(resolver(name)?),
        ParsedExpr::Sequence(items) => Expr::Sequence(
            items
                .iter()
                .map(|item| resolve(item, resolver))
                .collect::<Result<_, _>>()?,
        ),
        ParsedExpr::Choice(alternatives) => Expr::Choice(
            alternatives
                .iter()
                .map(|alternative| resolve(alternative, resolver))
                .collect::<Result<_, _>>()?,
        ),
        ParsedExpr::Repeat { expr, min, max } => Expr::Repeat {
            expr: Box::new(resolve(expr, resolver)?),
            min: *min,
            max: *max,
        },
    })
}
