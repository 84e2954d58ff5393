//! The byte-level automaton compiled from a [`Grammar`](crate::Grammar)'s rules.
//!
//! Every rule is compiled into a Thompson-style NFA fragment with one start node and one end node.
//! A rule reference is a call transition: entering the callee pushes the node to return to on the
//! position's call stack, and reaching the callee's end node pops it. Character classes are
//! lowered into UTF-8 byte ranges, so the automaton always consumes exactly one byte per step.
use std::fmt::Debug;

use ahash::AHashSet;
use fixedbitset_stack::FixedBitSet;
use jaggedarray::jagged_array::{JaggedArray, JaggedArrayViewTrait};
use nonmax::NonMaxU32;
use tinyvec::TinyVec;

use crate::grammar::{Expr, Rule, RuleId};
use crate::utf8;
use crate::utils::{self, ByteSet};

/// An outgoing transition of an automaton node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Consumes one byte in `lo..=hi`.
    Byte {
        /// The inclusive lower bound.
        lo: u8,
        /// The inclusive upper bound.
        hi: u8,
        /// The target node.
        next: u32,
    },
    /// Enters `rule`, continuing at `next` once the rule is matched.
    Call {
        /// The called rule.
        rule: RuleId,
        /// The return node.
        next: u32,
    },
    /// Moves to `next` without consuming input.
    Epsilon {
        /// The target node.
        next: u32,
    },
}

/// The return nodes of the rules a position is nested in, innermost last.
pub type CallStack = TinyVec<[u32; 8]>;

/// A live parse position: a node together with its call stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    /// The automaton node.
    pub node: u32,
    /// The return nodes.
    pub stack: CallStack,
}

/// The set of positions the automaton can be in after consuming some input.
///
/// Only positions that can consume a byte are kept. Whether the main rule can be completed
/// right here is recorded separately in the accepting flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PositionSet {
    positions: Vec<Position>,
    accepting: bool,
}

impl PositionSet {
    /// The live positions, sorted.
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// Whether the main rule has been fully matched.
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Whether no further input can be consumed and the input so far is not a complete match either.
    pub fn is_dead(&self) -> bool {
        self.positions.is_empty() && !self.accepting
    }
}

/// Reusable buffers for epsilon closures.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClosureScratch {
    visited: AHashSet<Position>,
    worklist: Vec<Position>,
}

impl ClosureScratch {
    fn visit(&mut self, position: Position) {
        if !self.visited.contains(&position) {
            self.visited.insert(position.clone());
            self.worklist.push(position);
        }
    }
}

struct Builder {
    edges: Vec<Vec<Transition>>,
}

impl Builder {
    fn add_node(&mut self) -> u32 {
        self.edges.push(Vec::new());
        (self.edges.len() - 1) as u32
    }

    fn add_edge(&mut self, from: u32, transition: Transition) {
        self.edges[from as usize].push(transition);
    }

    fn add_byte_ranges(&mut self, ranges: &[(u8, u8)], from: u32, to: u32) {
        let mut current = from;
        for (i, &(lo, hi)) in ranges.iter().enumerate() {
            let next = if i + 1 == ranges.len() {
                to
            } else {
                self.add_node()
            };
            self.add_edge(current, Transition::Byte { lo, hi, next });
            current = next;
        }
    }

    /// Adds the fragment matching `expr` between `from` and `to`.
    /// Fragments never add edges into `from` or out of `to`, so they can be chained freely.
    fn add_expr(&mut self, expr: &Expr, from: u32, to: u32) {
        match expr {
            Expr::Empty => self.add_edge(from, Transition::Epsilon { next: to }),
            Expr::Literal(bytes) if bytes.is_empty() => {
                self.add_edge(from, Transition::Epsilon { next: to })
            }
            Expr::Literal(bytes) => {
                let ranges: Vec<(u8, u8)> = bytes.iter().map(|&b| (b, b)).collect();
                self.add_byte_ranges(&ranges, from, to);
            }
            Expr::CharClass { negated, ranges } => {
                for (lo, hi) in utf8::canonical_ranges(ranges, *negated) {
                    for sequence in utf8::utf8_sequences(lo, hi) {
                        self.add_byte_ranges(&sequence, from, to);
                    }
                }
            }
            Expr::RuleRef(rule) => self.add_edge(
                from,
                Transition::Call {
                    rule: *rule,
                    next: to,
                },
            ),
            Expr::Sequence(items) => {
                if items.is_empty() {
                    self.add_edge(from, Transition::Epsilon { next: to });
                    return;
                }
                let mut current = from;
                for (i, item) in items.iter().enumerate() {
                    let next = if i + 1 == items.len() {
                        to
                    } else {
                        self.add_node()
                    };
                    self.add_expr(item, current, next);
                    current = next;
                }
            }
            Expr::Choice(alternatives) => {
                for alternative in alternatives {
                    self.add_expr(alternative, from, to);
                }
            }
            Expr::Repeat { expr, min, max } => {
                let mut current = from;
                for _ in 0..*min {
                    let next = self.add_node();
                    self.add_expr(expr, current, next);
                    current = next;
                }
                match max {
                    None => {
                        let repeat = self.add_node();
                        self.add_edge(current, Transition::Epsilon { next: repeat });
                        self.add_expr(expr, repeat, repeat);
                        self.add_edge(repeat, Transition::Epsilon { next: to });
                    }
                    Some(max) => {
                        for _ in *min..*max {
                            self.add_edge(current, Transition::Epsilon { next: to });
                            let next = self.add_node();
                            self.add_expr(expr, current, next);
                            current = next;
                        }
                        self.add_edge(current, Transition::Epsilon { next: to });
                    }
                }
            }
        }
    }
}

/// The compiled automaton of a grammar.
#[derive(Clone)]
pub struct Automaton {
    transitions: JaggedArray<Transition, Vec<usize>, 2>,
    node_count: usize,
    rule_starts: Vec<u32>,
    completed_rules: Vec<Option<NonMaxU32>>,
    tail_nodes: FixedBitSet,
    nullable_rules: FixedBitSet,
    main_rule: RuleId,
}

impl Debug for Automaton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Automaton")
            .field("node_count", &self.node_count)
            .field("rule_starts", &self.rule_starts)
            .field("main_rule", &self.main_rule)
            .field(
                "nullable_rules",
                &utils::get_display_form_from_bitset(&self.nullable_rules),
            )
            .field(
                "tail_nodes",
                &utils::get_display_form_from_bitset(&self.tail_nodes),
            )
            .finish()
    }
}

impl Automaton {
    /// Compiles the rules into an automaton.
    pub fn new(rules: &[Rule], main_rule: RuleId) -> Automaton {
        let mut builder = Builder {
            edges: Vec::with_capacity(rules.len() * 4),
        };
        let mut rule_starts = Vec::with_capacity(rules.len());
        let mut rule_ends = Vec::with_capacity(rules.len());
        for _ in rules {
            rule_starts.push(builder.add_node());
            rule_ends.push(builder.add_node());
        }
        for (i, rule) in rules.iter().enumerate() {
            builder.add_expr(&rule.body, rule_starts[i], rule_ends[i]);
        }
        let node_count = builder.edges.len();
        let mut completed_rules = vec![None; node_count];
        for (i, &end) in rule_ends.iter().enumerate() {
            completed_rules[end as usize] = NonMaxU32::new(i as u32);
        }
        let mut transitions = JaggedArray::<Transition, Vec<usize>, 2>::with_capacity([
            node_count,
            builder.edges.iter().map(|edges| edges.len()).sum(),
        ]);
        for edges in builder.edges.iter() {
            transitions.new_row::<0>();
            transitions.extend_last_row_from_slice(edges);
        }
        let mut automaton = Automaton {
            transitions,
            node_count,
            rule_starts,
            completed_rules,
            tail_nodes: FixedBitSet::with_capacity(node_count),
            nullable_rules: FixedBitSet::with_capacity(rules.len()),
            main_rule,
        };
        automaton.compute_tail_nodes();
        automaton.compute_nullable_rules();
        automaton
    }

    /// The outgoing transitions of a node.
    #[inline]
    pub fn transitions(&self, node: u32) -> &[Transition] {
        self.transitions.view::<1, 1>([node as usize]).as_slice()
    }

    /// The number of nodes.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// The start node of a rule.
    pub fn rule_start(&self, rule: RuleId) -> Option<u32> {
        self.rule_starts.get(rule.index()).copied()
    }

    /// The rule whose end node is `node`, if any.
    #[inline]
    pub fn completed_rule(&self, node: u32) -> Option<RuleId> {
        self.completed_rules
            .get(node as usize)
            .copied()
            .flatten()
            .map(|rule| RuleId(rule.get()))
    }

    /// A node is a tail node if reaching it means its rule is matched, with nothing left to consume.
    /// Calls returning to a tail node do not need a stack frame.
    fn compute_tail_nodes(&mut self) {
        for node in 0..self.node_count {
            if self.completed_rules[node].is_some() {
                self.tail_nodes.insert(node);
            }
        }
        loop {
            let mut changed = false;
            for node in 0..self.node_count {
                if self.tail_nodes.contains(node) {
                    continue;
                }
                let transitions = self.transitions(node as u32);
                let is_tail = !transitions.is_empty()
                    && transitions.iter().all(|transition| {
                        matches!(transition, Transition::Epsilon { next } if self.tail_nodes.contains(*next as usize))
                    });
                if is_tail {
                    self.tail_nodes.insert(node);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Visits the nodes reachable from a rule's start without consuming input,
    /// stepping over calls to nullable rules. Returns the rules called along the way
    /// and whether the rule's end is reachable.
    fn walk_without_input(&self, rule: usize, mut on_call: impl FnMut(RuleId)) -> bool {
        let start = self.rule_starts[rule];
        let mut visited = FixedBitSet::with_capacity(self.node_count);
        let mut stack = vec![start];
        visited.insert(start as usize);
        let mut reaches_end = false;
        while let Some(node) = stack.pop() {
            if self.completed_rule(node).map(|r| r.index()) == Some(rule) {
                reaches_end = true;
                continue;
            }
            for transition in self.transitions(node) {
                let next = match *transition {
                    Transition::Byte { .. } => continue,
                    Transition::Epsilon { next } => next,
                    Transition::Call { rule: callee, next } => {
                        on_call(callee);
                        if !self.nullable_rules.contains(callee.index()) {
                            continue;
                        }
                        next
                    }
                };
                if !visited.contains(next as usize) {
                    visited.insert(next as usize);
                    stack.push(next);
                }
            }
        }
        reaches_end
    }

    fn compute_nullable_rules(&mut self) {
        loop {
            let mut changed = false;
            for rule in 0..self.rule_starts.len() {
                if !self.nullable_rules.contains(rule) && self.walk_without_input(rule, |_| {}) {
                    self.nullable_rules.insert(rule);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Finds a rule that can reach itself without consuming input.
    ///
    /// Rules with ids below `preferred_below` are reported in preference to others on the same cycle.
    pub fn find_left_recursion(&self, preferred_below: usize) -> Option<RuleId> {
        let rule_count = self.rule_starts.len();
        let left_calls: Vec<Vec<usize>> = (0..rule_count)
            .map(|rule| {
                let mut callees = Vec::new();
                self.walk_without_input(rule, |callee| callees.push(callee.index()));
                callees.sort_unstable();
                callees.dedup();
                callees
            })
            .collect();
        // 0 = unvisited, 1 = on the current path, 2 = done
        let mut state = vec![0u8; rule_count];
        for root in 0..rule_count {
            if state[root] != 0 {
                continue;
            }
            state[root] = 1;
            let mut path: Vec<(usize, usize)> = vec![(root, 0)];
            while let Some(top) = path.last_mut() {
                let rule = top.0;
                if top.1 == left_calls[rule].len() {
                    state[rule] = 2;
                    path.pop();
                    continue;
                }
                let callee = left_calls[rule][top.1];
                top.1 += 1;
                match state[callee] {
                    0 => {
                        state[callee] = 1;
                        path.push((callee, 0));
                    }
                    1 => {
                        let start = path.iter().position(|&(r, _)| r == callee).unwrap_or(0);
                        let cycle = path[start..].iter().map(|&(r, _)| r);
                        let reported = cycle
                            .clone()
                            .filter(|&r| r < preferred_below)
                            .min()
                            .or_else(|| cycle.min())
                            .unwrap_or(callee);
                        return Some(RuleId(reported as u32));
                    }
                    _ => {}
                }
            }
        }
        None
    }

    /// The positions before any input is consumed.
    pub fn initial_positions(&self) -> PositionSet {
        let mut scratch = ClosureScratch::default();
        let start = self.rule_starts.get(self.main_rule.index()).copied();
        match start {
            Some(node) => self.closure(
                vec![Position {
                    node,
                    stack: CallStack::default(),
                }],
                &mut scratch,
            ),
            None => PositionSet::default(),
        }
    }

    /// Consumes one byte from every position of the set.
    pub fn step(&self, positions: &PositionSet, byte: u8) -> PositionSet {
        self.step_with(positions, byte, &mut ClosureScratch::default())
    }

    /// Consumes the bytes one after another.
    ///
    /// # Returns
    ///
    /// * `Some(PositionSet)` - The positions after the last byte.
    /// * `None` - If the bytes leave the grammar's language.
    pub fn step_bytes(&self, positions: &PositionSet, bytes: &[u8]) -> Option<PositionSet> {
        self.step_bytes_with(positions, bytes, &mut ClosureScratch::default())
    }

    pub(crate) fn step_bytes_with(
        &self,
        positions: &PositionSet,
        bytes: &[u8],
        scratch: &mut ClosureScratch,
    ) -> Option<PositionSet> {
        let mut current = positions.clone();
        for &byte in bytes {
            current = self.step_with(&current, byte, scratch);
            if current.is_dead() {
                return None;
            }
        }
        Some(current)
    }

    pub(crate) fn step_with(
        &self,
        positions: &PositionSet,
        byte: u8,
        scratch: &mut ClosureScratch,
    ) -> PositionSet {
        let mut seeds = Vec::new();
        for position in positions.positions.iter() {
            for transition in self.transitions(position.node) {
                if let Transition::Byte { lo, hi, next } = *transition {
                    if lo <= byte && byte <= hi {
                        seeds.push(Position {
                            node: next,
                            stack: position.stack.clone(),
                        });
                    }
                }
            }
        }
        self.closure(seeds, scratch)
    }

    /// Whether the main rule has been fully matched.
    pub fn is_accepting(&self, positions: &PositionSet) -> bool {
        positions.accepting
    }

    /// The bytes some position of the set can consume next.
    pub(crate) fn allowed_first_bytes(&self, positions: &PositionSet) -> ByteSet {
        let mut bytes = ByteSet::with_capacity(256);
        for position in positions.positions.iter() {
            for transition in self.transitions(position.node) {
                if let Transition::Byte { lo, hi, .. } = *transition {
                    for byte in lo..=hi {
                        bytes.insert(byte as usize);
                    }
                }
            }
        }
        bytes
    }

    /// The only byte the set can consume next.
    ///
    /// # Returns
    ///
    /// * `Some(u8)` - If exactly one byte is allowed.
    /// * `None` - If no byte or several bytes are allowed.
    pub fn forced_byte(&self, positions: &PositionSet) -> Option<u8> {
        let mut forced = None;
        for position in positions.positions.iter() {
            for transition in self.transitions(position.node) {
                if let Transition::Byte { lo, hi, .. } = *transition {
                    if lo != hi {
                        return None;
                    }
                    match forced {
                        None => forced = Some(lo),
                        Some(byte) if byte == lo => {}
                        Some(_) => return None,
                    }
                }
            }
        }
        forced
    }

    fn closure(&self, seeds: Vec<Position>, scratch: &mut ClosureScratch) -> PositionSet {
        scratch.visited.clear();
        scratch.worklist.clear();
        for seed in seeds {
            scratch.visit(seed);
        }
        let mut positions = Vec::new();
        let mut accepting = false;
        while let Some(position) = scratch.worklist.pop() {
            if self.completed_rule(position.node).is_some() {
                let mut stack = position.stack;
                match stack.pop() {
                    None => accepting = true,
                    Some(node) => scratch.visit(Position { node, stack }),
                }
                continue;
            }
            let mut consumes = false;
            for transition in self.transitions(position.node) {
                match *transition {
                    Transition::Byte { .. } => consumes = true,
                    Transition::Epsilon { next } => scratch.visit(Position {
                        node: next,
                        stack: position.stack.clone(),
                    }),
                    Transition::Call { rule, next } => {
                        let mut stack = position.stack.clone();
                        if !self.tail_nodes.contains(next as usize) {
                            stack.push(next);
                        }
                        scratch.visit(Position {
                            node: self.rule_starts[rule.index()],
                            stack,
                        });
                    }
                }
            }
            if consumes {
                positions.push(position);
            }
        }
        positions.sort_unstable();
        PositionSet {
            positions,
            accepting,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::grammar::Grammar;

    fn matches(grammar: &Grammar, input: &str) -> bool {
        let automaton = grammar.automaton();
        automaton
            .step_bytes(&automaton.initial_positions(), input.as_bytes())
            .is_some_and(|positions| positions.is_accepting())
    }

    #[test]
    fn matches_recursive_rules() {
        for normalize in [true, false] {
            let grammar = Grammar::compile(
                r#"root ::= "(" root ")" root | """#,
                "root",
                normalize,
            )
            .unwrap();
            assert!(matches(&grammar, ""));
            assert!(matches(&grammar, "(()())()"));
            assert!(!matches(&grammar, "(()"));
            assert!(!matches(&grammar, "())"));
        }
    }

    #[test]
    fn matches_unicode_classes() {
        for normalize in [true, false] {
            let grammar =
                Grammar::compile(r#"root ::= [^a-z]{2} [é-ë]+"#, "root", normalize).unwrap();
            assert!(matches(&grammar, "A你éë"));
            assert!(!matches(&grammar, "a你é"));
            assert!(!matches(&grammar, "AB"));
            assert!(!matches(&grammar, "ABf"));
        }
    }

    #[test]
    fn right_recursion_keeps_the_stack_flat() {
        let grammar = Grammar::new(r#"root ::= "a" root | "b""#).unwrap();
        let automaton = grammar.automaton();
        let positions = automaton
            .step_bytes(&automaton.initial_positions(), "a".repeat(100).as_bytes())
            .unwrap();
        assert!(positions.positions().iter().all(|p| p.stack.is_empty()));
        assert!(!positions.is_accepting());
        assert!(automaton.step(&positions, b'b').is_accepting());
    }

    #[test]
    fn nullable_repetitions_terminate() {
        let grammar = Grammar::new(r#"root ::= ("a"?)* "b""#).unwrap();
        assert!(matches(&grammar, "aab"));
        assert!(matches(&grammar, "b"));
    }

    #[test]
    fn detects_left_recursion() {
        let error = Grammar::new("root ::= x \"a\"\nx ::= \"b\"? root").unwrap_err();
        assert_eq!(error.to_string(), "EBNF semantics error: rule `root` is left recursive");
        assert!(Grammar::new(r#"root ::= root "a" | "a""#).is_err());
    }
}
