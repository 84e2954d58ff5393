//! Rewrites rules into the normalized form.
//!
//! A normalized rule body is a [`Expr::Choice`] of [`Expr::Sequence`]s whose items are literals,
//! character classes, rule references, or a `*` repetition of a single character class or rule
//! reference. Nested choices and bounded repetitions are lifted into helper rules named after the
//! rule they come from, which are appended after the user defined rules.
use ahash::AHashMap;
use string_interner::{DefaultStringInterner, DefaultSymbol};

use crate::grammar::{Expr, Rule, RuleId};

struct Normalizer<'a> {
    rules: Vec<Rule>,
    names: &'a mut DefaultStringInterner,
    rule_ids: &'a mut AHashMap<DefaultSymbol, RuleId>,
    helper_counters: AHashMap<RuleId, usize>,
}

impl Normalizer<'_> {
    fn owner_name(&self, owner: RuleId) -> String {
        self.rules
            .get(owner.index())
            .and_then(|rule| self.names.resolve(rule.name))
            .unwrap_or("rule")
            .to_string()
    }

    fn add_helper(&mut self, owner: RuleId, alternatives: Vec<Vec<Expr>>) -> RuleId {
        let owner_name = self.owner_name(owner);
        let counter = self.helper_counters.entry(owner).or_insert(0);
        let name = loop {
            *counter += 1;
            let candidate = format!("{}_{}", owner_name, counter);
            if self.names.get(&candidate).is_none() {
                break candidate;
            }
        };
        let symbol = self.names.get_or_intern(name);
        let id = RuleId(self.rules.len() as u32);
        self.rule_ids.insert(symbol, id);
        self.rules.push(Rule {
            name: symbol,
            body: into_body(alternatives),
        });
        id
    }

    /// Flattens an expression into alternatives of normalized items.
    fn alternatives(&mut self, owner: RuleId, expr: Expr) -> Vec<Vec<Expr>> {
        match expr {
            Expr::Choice(alternatives) => {
                let mut output = Vec::with_capacity(alternatives.len());
                for alternative in alternatives {
                    output.extend(self.alternatives(owner, alternative));
                }
                output
            }
            expr => vec![self.items(owner, expr)],
        }
    }

    /// Flattens an expression into a sequence of normalized items.
    fn items(&mut self, owner: RuleId, expr: Expr) -> Vec<Expr> {
        let mut output = Vec::new();
        self.push_items(owner, expr, &mut output);
        merge_literals(output)
    }

    fn push_items(&mut self, owner: RuleId, expr: Expr, output: &mut Vec<Expr>) {
        match expr {
            Expr::Empty => {}
            Expr::Literal(bytes) if bytes.is_empty() => {}
            expr @ (Expr::Literal(_) | Expr::CharClass { .. } | Expr::RuleRef(_)) => {
                output.push(expr)
            }
            Expr::Sequence(items) => {
                for item in items {
                    self.push_items(owner, item, output);
                }
            }
            Expr::Choice(alternatives) => {
                let mut alternatives = self.alternatives(owner, Expr::Choice(alternatives));
                if alternatives.len() == 1 {
                    output.extend(alternatives.pop().unwrap_or_default());
                } else {
                    output.push(Expr::RuleRef(self.add_helper(owner, alternatives)));
                }
            }
            Expr::Repeat { expr, min, max } => self.push_repeat(owner, *expr, min, max, output),
        }
    }

    fn push_repeat(
        &mut self,
        owner: RuleId,
        expr: Expr,
        min: u32,
        max: Option<u32>,
        output: &mut Vec<Expr>,
    ) {
        let items = self.items(owner, expr);
        if items.is_empty() {
            return;
        }
        for _ in 0..min {
            output.extend(items.iter().cloned());
        }
        match max {
            None => {
                let unit = match items.as_slice() {
                    [item @ (Expr::CharClass { .. } | Expr::RuleRef(_))] => item.clone(),
                    _ => Expr::RuleRef(self.add_helper(owner, vec![items])),
                };
                output.push(Expr::Repeat {
                    expr: Box::new(unit),
                    min: 0,
                    max: None,
                });
            }
            Some(max) if max > min => {
                // x{0,k} is lowered to (x (x (...)?)?)?, innermost first.
                let mut tail: Option<RuleId> = None;
                for _ in min..max {
                    let mut alternative = items.clone();
                    if let Some(tail) = tail {
                        alternative.push(Expr::RuleRef(tail));
                    }
                    tail = Some(self.add_helper(owner, vec![alternative, Vec::new()]));
                }
                if let Some(tail) = tail {
                    output.push(Expr::RuleRef(tail));
                }
            }
            Some(_) => {}
        }
    }
}

fn into_body(alternatives: Vec<Vec<Expr>>) -> Expr {
    Expr::Choice(alternatives.into_iter().map(Expr::Sequence).collect())
}

fn merge_literals(items: Vec<Expr>) -> Vec<Expr> {
    let mut output: Vec<Expr> = Vec::with_capacity(items.len());
    for item in items {
        if let (Some(Expr::Literal(last)), Expr::Literal(bytes)) = (output.last_mut(), &item) {
            last.extend_from_slice(bytes);
            continue;
        }
        output.push(item);
    }
    output
}

/// Normalizes every rule, appending the generated helper rules to the rule table.
pub(crate) fn normalize(
    rules: Vec<Rule>,
    names: &mut DefaultStringInterner,
    rule_ids: &mut AHashMap<DefaultSymbol, RuleId>,
) -> Vec<Rule> {
    let user_rule_count = rules.len();
    let mut normalizer = Normalizer {
        rules,
        names,
        rule_ids,
        helper_counters: AHashMap::default(),
    };
    for index in 0..user_rule_count {
        let owner = RuleId(index as u32);
        let body = std::mem::replace(&mut normalizer.rules[index].body, Expr::Empty);
        let alternatives = normalizer.alternatives(owner, body);
        normalizer.rules[index].body = into_body(alternatives);
    }
    normalizer.rules
}
