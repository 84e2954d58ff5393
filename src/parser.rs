//! The EBNF parser, built on [`nom`].
//!
//! The parser only produces a syntax tree with rule references kept as names.
//! Name resolution and validation happen in [`crate::grammar`].
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while_m_n};
use nom::character::complete::{char, digit1, multispace1, not_line_ending, satisfy, space0};
use nom::combinator::{cut, map, map_res, not, opt, recognize, value};
use nom::error::{context, VerboseError, VerboseErrorKind};
use nom::multi::many0_count;
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;

use crate::grammar::CreateGrammarError;

type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

/// The largest bound accepted in a `{n,m}` repetition range.
pub(crate) const MAX_REPETITION_BOUND: u32 = 1 << 16;

/// A rule as written in the grammar text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedRule<'a> {
    pub name: &'a str,
    pub body: ParsedExpr<'a>,
}

/// An expression as written in the grammar text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParsedExpr<'a> {
    Literal(Vec<u8>),
    CharClass {
        negated: bool,
        ranges: Vec<(u32, u32)>,
    },
    RuleRef(&'a str),
    Sequence(Vec<ParsedExpr<'a>>),
    Choice(Vec<ParsedExpr<'a>>),
    Repeat {
        expr: Box<ParsedExpr<'a>>,
        min: u32,
        max: Option<u32>,
    },
}

fn failure<'a, T>(input: &'a str, message: &'static str) -> PResult<'a, T> {
    Err(nom::Err::Failure(VerboseError {
        errors: vec![(input, VerboseErrorKind::Context(message))],
    }))
}

fn comment(input: &str) -> PResult<'_, ()> {
    value((), pair(char('#'), not_line_ending))(input)
}

/// Skips whitespace, newlines and comments.
fn ws(input: &str) -> PResult<'_, ()> {
    value((), many0_count(alt((value((), multispace1), comment))))(input)
}

fn identifier(input: &str) -> PResult<'_, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')),
    ))(input)
}

fn hex_code_point(input: &str, digits: usize) -> PResult<'_, u32> {
    let Ok((rest, hex)) = take_while_m_n::<_, _, VerboseError<&str>>(digits, digits, |c: char| {
        c.is_ascii_hexdigit()
    })(input) else {
        return failure(input, "malformed hexadecimal escape sequence");
    };
    match u32::from_str_radix(hex, 16) {
        Ok(code_point) => Ok((rest, code_point)),
        Err(_) => failure(input, "malformed hexadecimal escape sequence"),
    }
}

/// Parses the part of an escape sequence after the backslash.
fn escape(input: &str) -> PResult<'_, u32> {
    let mut chars = input.chars();
    let Some(c) = chars.next() else {
        return failure(input, "unterminated escape sequence");
    };
    let rest = chars.as_str();
    let simple = match c {
        'n' => '\n',
        'r' => '\r',
        't' => '\t',
        '0' => '\0',
        '\\' | '"' | '\'' | '[' | ']' | '-' | '^' | '/' => c,
        'x' => return hex_code_point(rest, 2),
        'u' => return hex_code_point(rest, 4),
        'U' => return hex_code_point(rest, 8),
        _ => return failure(input, "invalid escape sequence"),
    };
    Ok((rest, simple as u32))
}

/// Parses a literal delimited by `quote`.
fn quoted_literal(input: &str, quote: char) -> PResult<'_, ParsedExpr<'_>> {
    let (mut rest, _) = char(quote)(input)?;
    let mut bytes = Vec::new();
    loop {
        let mut chars = rest.chars();
        match chars.next() {
            None | Some('\n') => return failure(input, "unterminated string literal"),
            Some(c) if c == quote => return Ok((chars.as_str(), ParsedExpr::Literal(bytes))),
            Some('\\') => {
                let (after, code_point) = escape(chars.as_str())?;
                let Some(c) = char::from_u32(code_point) else {
                    return failure(rest, "escape sequence is not a Unicode scalar value");
                };
                let mut buffer = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buffer).as_bytes());
                rest = after;
            }
            Some(c) => {
                let mut buffer = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buffer).as_bytes());
                rest = chars.as_str();
            }
        }
    }
}

fn double_quoted(input: &str) -> PResult<'_, ParsedExpr<'_>> {
    quoted_literal(input, '"')
}

fn single_quoted(input: &str) -> PResult<'_, ParsedExpr<'_>> {
    quoted_literal(input, '\'')
}

fn class_char(input: &str) -> PResult<'_, u32> {
    let mut chars = input.chars();
    match chars.next() {
        None | Some('\n') => failure(input, "unterminated character class"),
        Some('\\') => escape(chars.as_str()),
        Some(c) => Ok((chars.as_str(), c as u32)),
    }
}

fn char_class(input: &str) -> PResult<'_, ParsedExpr<'_>> {
    let (rest, _) = char('[')(input)?;
    let (mut rest, negated) = map(opt(char('^')), |x| x.is_some())(rest)?;
    let mut ranges = Vec::new();
    loop {
        if let Some(after) = rest.strip_prefix(']') {
            if ranges.is_empty() {
                return failure(input, "empty character class");
            }
            return Ok((after, ParsedExpr::CharClass { negated, ranges }));
        }
        let (after, lo) = class_char(rest)?;
        rest = after;
        match rest.strip_prefix('-') {
            Some(after) if !after.starts_with(']') => {
                let (after, hi) = class_char(after)?;
                if hi < lo {
                    return failure(rest, "character range is out of order");
                }
                ranges.push((lo, hi));
                rest = after;
            }
            _ => ranges.push((lo, lo)),
        }
    }
}

fn number(input: &str) -> PResult<'_, u32> {
    map_res(digit1, str::parse::<u32>)(input)
}

fn repetition_range(input: &str) -> PResult<'_, (u32, Option<u32>)> {
    let (rest, _) = char('{')(input)?;
    let (rest, (min, max)) = cut(context(
        "malformed repetition range",
        delimited(
            space0,
            pair(
                number,
                opt(preceded(tuple((space0, char(','), space0)), opt(number))),
            ),
            pair(space0, char('}')),
        ),
    ))(rest)?;
    let max = match max {
        None => Some(min),
        Some(max) => max,
    };
    if matches!(max, Some(max) if max < min) {
        return failure(input, "repetition upper bound is smaller than the lower bound");
    }
    if min > MAX_REPETITION_BOUND || matches!(max, Some(max) if max > MAX_REPETITION_BOUND) {
        return failure(input, "repetition bound exceeds 65536");
    }
    Ok((rest, (min, max)))
}

fn quantifier(input: &str) -> PResult<'_, (u32, Option<u32>)> {
    alt((
        value((0, None), char('*')),
        value((1, None), char('+')),
        value((0, Some(1)), char('?')),
        repetition_range,
    ))(input)
}

fn group(input: &str) -> PResult<'_, ParsedExpr<'_>> {
    preceded(
        pair(char('('), ws),
        cut(context(
            "unbalanced parenthesis",
            terminated(alternation, pair(ws, char(')'))),
        )),
    )(input)
}

fn rule_ref(input: &str) -> PResult<'_, ParsedExpr<'_>> {
    map(
        terminated(identifier, not(pair(ws, tag("::=")))),
        ParsedExpr::RuleRef,
    )(input)
}

fn atom(input: &str) -> PResult<'_, ParsedExpr<'_>> {
    alt((double_quoted, single_quoted, char_class, group, rule_ref))(input)
}

fn element(input: &str) -> PResult<'_, ParsedExpr<'_>> {
    let (rest, atom) = atom(input)?;
    let (rest, quantifier) = opt(preceded(space0, quantifier))(rest)?;
    Ok((
        rest,
        match quantifier {
            None => atom,
            Some((min, max)) => ParsedExpr::Repeat {
                expr: Box::new(atom),
                min,
                max,
            },
        },
    ))
}

fn sequence(input: &str) -> PResult<'_, ParsedExpr<'_>> {
    let (mut rest, first) = element(input)?;
    let mut items = vec![first];
    loop {
        match preceded(ws, element)(rest) {
            Ok((after, item)) => {
                items.push(item);
                rest = after;
            }
            Err(nom::Err::Error(_)) => break,
            Err(e) => return Err(e),
        }
    }
    let expr = if items.len() == 1 {
        items.pop().unwrap_or(ParsedExpr::Literal(Vec::new()))
    } else {
        ParsedExpr::Sequence(items)
    };
    Ok((rest, expr))
}

fn alternation(input: &str) -> PResult<'_, ParsedExpr<'_>> {
    let (mut rest, first) = sequence(input)?;
    let mut alternatives = vec![first];
    loop {
        match tuple((ws, char('|'), ws))(rest) {
            Ok((after, _)) => {
                let (after, alternative) =
                    cut(context("expected an expression after '|'", sequence))(after)?;
                alternatives.push(alternative);
                rest = after;
            }
            Err(nom::Err::Error(_)) => break,
            Err(e) => return Err(e),
        }
    }
    let expr = if alternatives.len() == 1 {
        alternatives.pop().unwrap_or(ParsedExpr::Literal(Vec::new()))
    } else {
        ParsedExpr::Choice(alternatives)
    };
    Ok((rest, expr))
}

fn rule(input: &str) -> PResult<'_, ParsedRule<'_>> {
    let (rest, (name, _, _, _)) = context(
        "expected a rule definition",
        tuple((identifier, ws, tag("::="), ws)),
    )(input)?;
    let (rest, body) = cut(context("expected an expression", alternation))(rest)?;
    let (rest, _) = opt(pair(space0, char(';')))(rest)?;
    Ok((rest, ParsedRule { name, body }))
}

fn location(input: &str, remaining: &str) -> (usize, usize) {
    let offset = input.len().saturating_sub(remaining.len());
    let consumed = &input[..offset];
    let line = consumed.matches('\n').count() + 1;
    let column = match consumed.rfind('\n') {
        Some(newline) => consumed[newline + 1..].chars().count() + 1,
        None => consumed.chars().count() + 1,
    };
    (line, column)
}

fn syntax_error(input: &str, error: nom::Err<VerboseError<&str>>) -> CreateGrammarError {
    let errors = match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => e.errors,
        nom::Err::Incomplete(_) => Vec::new(),
    };
    let remaining = errors.first().map(|(remaining, _)| *remaining).unwrap_or("");
    let message = errors
        .iter()
        .find_map(|(_, kind)| match kind {
            VerboseErrorKind::Context(message) => Some(message.to_string()),
            _ => None,
        })
        .or_else(|| {
            errors.first().map(|(_, kind)| match kind {
                VerboseErrorKind::Char(c) => format!("expected '{c}'"),
                _ => "unexpected input".to_string(),
            })
        })
        .unwrap_or_else(|| "unexpected end of input".to_string());
    let (line, column) = location(input, remaining);
    CreateGrammarError::SyntaxError {
        line,
        column,
        message,
    }
}

/// Parses EBNF text into rules in definition order.
pub(crate) fn parse_grammar(input: &str) -> Result<Vec<ParsedRule<'_>>, CreateGrammarError> {
    let mut rules = Vec::new();
    let (mut rest, _) = ws(input).map_err(|e| syntax_error(input, e))?;
    while !rest.is_empty() {
        let (after, rule) = rule(rest).map_err(|e| syntax_error(input, e))?;
        rules.push(rule);
        let (after, _) = ws(after).map_err(|e| syntax_error(input, e))?;
        rest = after;
    }
    if rules.is_empty() {
        let (line, column) = location(input, rest);
        return Err(CreateGrammarError::SyntaxError {
            line,
            column,
            message: "the grammar does not define any rule".to_string(),
        });
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rules_across_lines() {
        let rules = parse_grammar(
            "# leading comment\nroot ::= \"a\" b\n  | [x-z]*\nb ::= (\"c\" | \"d\"){2,3} # trailing\n",
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "root");
        assert_eq!(
            rules[0].body,
            ParsedExpr::Choice(vec![
                ParsedExpr::Sequence(vec![
                    ParsedExpr::Literal(b"a".to_vec()),
                    ParsedExpr::RuleRef("b")
                ]),
                ParsedExpr::Repeat {
                    expr: Box::new(ParsedExpr::CharClass {
                        negated: false,
                        ranges: vec![('x' as u32, 'z' as u32)]
                    }),
                    min: 0,
                    max: None
                }
            ])
        );
        assert!(matches!(
            rules[1].body,
            ParsedExpr::Repeat {
                min: 2,
                max: Some(3),
                ..
            }
        ));
    }

    #[test]
    fn parses_escapes() {
        let rules = parse_grammar(r#"root ::= "\n\"é\x41" [^\]\-a]"#).unwrap();
        assert_eq!(
            rules[0].body,
            ParsedExpr::Sequence(vec![
                ParsedExpr::Literal("\n\"éA".as_bytes().to_vec()),
                ParsedExpr::CharClass {
                    negated: true,
                    ranges: vec![(']' as u32, ']' as u32), ('-' as u32, '-' as u32), ('a' as u32, 'a' as u32)]
                }
            ])
        );
    }

    #[test]
    fn reports_error_locations() {
        let Err(CreateGrammarError::SyntaxError { line, message, .. }) =
            parse_grammar("root ::= \"a\"\nb ::= (\"c\"")
        else {
            panic!("expected a syntax error");
        };
        assert_eq!(line, 2);
        assert_eq!(message, "unbalanced parenthesis");
        assert!(matches!(
            parse_grammar("root ::= \"a\" |"),
            Err(CreateGrammarError::SyntaxError { .. })
        ));
        assert!(matches!(
            parse_grammar("root ::= \"a\"{3,1}"),
            Err(CreateGrammarError::SyntaxError { .. })
        ));
        assert!(matches!(
            parse_grammar("  # only a comment\n"),
            Err(CreateGrammarError::SyntaxError { line: 2, column: 1, .. })
        ));
    }

    #[test]
    fn rejects_huge_repetition_bounds() {
        for grammar in [
            r#"root ::= "a"{0,4000000000}"#,
            r#"root ::= "a"{65537}"#,
            r#"root ::= "a"{65537,}"#,
        ] {
            let Err(CreateGrammarError::SyntaxError { line, column, message }) = parse_grammar(grammar)
            else {
                panic!("expected a syntax error for {grammar}");
            };
            assert_eq!((line, column), (1, 13));
            assert_eq!(message, "repetition bound exceeds 65536");
        }
        assert!(parse_grammar(r#"root ::= "a"{0,65536}"#).is_ok());
        assert!(matches!(
            parse_grammar(r#"root ::= "a"{0,99999999999}"#),
            Err(CreateGrammarError::SyntaxError { .. })
        ));
    }
}
