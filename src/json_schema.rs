//! The module that converts JSON schemas into EBNF grammars of the JSON values they accept.
//!
//! Supported keywords are `type`, `properties`, `required`, `additionalProperties`,
//! `unevaluatedProperties`, `items`, `prefixItems`, `unevaluatedItems`, `minItems`, `maxItems`,
//! `minLength`, `maxLength`, `enum`, `const`, `anyOf`, `oneOf`, single-schema `allOf` and local `$ref`s
//! such as `#/$defs/Name`. Value constraints such as `pattern` or `minimum` are ignored with a warning.
//!
//! Properties are generated in the order the schema lists them.
use std::cmp::Ordering;

use ahash::{AHashMap, AHashSet};
use serde_json::{Map, Value};

use crate::config::JsonSchemaConfig;
use crate::grammar::CreateGrammarError;
use crate::parser::MAX_REPETITION_BOUND;
use crate::utils;

const WHITESPACE: &str = r"[ \n\t]*";

const BASIC_RULES: [(&str, &str); 8] = [
    ("basic_escape", r#"["\\/bfnrt] | "u" [A-Fa-f0-9]{4}"#),
    ("basic_char", r#"[^"\\\x00-\x1f] | "\\" basic_escape"#),
    ("basic_string", r#""\"" basic_char* "\"""#),
    ("basic_integer", r#""-"? ("0" | [1-9] [0-9]*)"#),
    (
        "basic_number",
        r#""-"? ("0" | [1-9] [0-9]*) ("." [0-9]+)? ([eE] [+-]? [0-9]+)?"#,
    ),
    ("basic_boolean", r#""true" | "false""#),
    ("basic_null", r#""null""#),
    (
        "basic_any",
        "basic_number | basic_string | basic_boolean | basic_null | basic_array | basic_object",
    ),
];

const IGNORED_KEYWORDS: [&str; 12] = [
    "pattern",
    "format",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
    "minProperties",
    "maxProperties",
    "uniqueItems",
    "contains",
    "not",
];

#[derive(Debug, thiserror::Error)]
/// The error type for errors in the conversion of a JSON schema.
pub enum JsonSchemaError {
    #[error("The JSON schema is not valid JSON: {0}")]
    /// The schema text could not be parsed.
    InvalidJson(#[from] serde_json::Error),
    #[error("Unsupported JSON schema at `{rule}`: {message}")]
    /// A part of the schema cannot be expressed as a grammar.
    UnsupportedSchema {
        /// The name of the rule generated for the offending part of the schema.
        rule: String,
        /// What went wrong.
        message: String,
    },
    #[error("{0}")] // inherits the error message from the wrapped GrammarError
    /// The generated grammar could not be compiled.
    GrammarError(#[from] CreateGrammarError),
}

fn unsupported<T>(rule: &str, message: impl Into<String>) -> Result<T, JsonSchemaError> {
    Err(JsonSchemaError::UnsupportedSchema {
        rule: rule.to_string(),
        message: message.into(),
    })
}

/// Renders text as a double-quoted EBNF literal.
fn literal(text: &str) -> String {
    format!("\"{}\"", utils::escape_bytes(text.as_bytes()))
}

/// Renders a JSON value, serialized compactly, as an EBNF literal.
fn json_literal(value: &Value) -> Result<String, JsonSchemaError> {
    Ok(literal(&serde_json::to_string(value)?))
}

fn is_rule_name(expr: &str) -> bool {
    let mut chars = expr.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn sanitize(name: &str) -> String {
    let mut output: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if !output.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        output.insert(0, '_');
    }
    output
}

/// Appends a repetition suffix to an atom. A maximum of zero repetitions yields the empty string.
fn repeat(atom: &str, min: usize, max: Option<usize>) -> String {
    match (min, max) {
        (_, Some(0)) => "\"\"".to_string(),
        (0, None) => format!("{atom}*"),
        (1, None) => format!("{atom}+"),
        (0, Some(1)) => format!("{atom}?"),
        (min, None) => format!("{atom}{{{min},}}"),
        (min, Some(max)) if min == max => format!("{atom}{{{min}}}"),
        (min, Some(max)) => format!("{atom}{{{min},{max}}}"),
    }
}

/// The EBNF fragments placed between the brackets and items of an array or an object.
#[derive(Debug, Clone)]
struct Layout {
    start: String,
    item: String,
    key_value: String,
    end: String,
    empty: String,
}

struct SchemaConverter<'a> {
    root: &'a Value,
    config: &'a JsonSchemaConfig,
    item_separator: String,
    key_value_separator: String,
    rules: Vec<(String, String)>,
    used_names: AHashSet<String>,
    references: AHashMap<String, String>,
}

impl<'a> SchemaConverter<'a> {
    fn new(root: &'a Value, config: &'a JsonSchemaConfig) -> Self {
        let (item_separator, key_value_separator) = match &config.separators {
            Some((item, key_value)) => (item.clone(), key_value.clone()),
            None if config.indent.is_some() => (",".to_string(), ": ".to_string()),
            None => (", ".to_string(), ": ".to_string()),
        };
        let mut used_names: AHashSet<String> = BASIC_RULES
            .iter()
            .map(|(name, _)| name.to_string())
            .collect();
        used_names.extend(["basic_array", "basic_object", "root"].map(String::from));
        SchemaConverter {
            root,
            config,
            item_separator,
            key_value_separator,
            rules: Vec::new(),
            used_names,
            references: AHashMap::default(),
        }
    }

    fn whitespace_layout(&self) -> Layout {
        Layout {
            start: WHITESPACE.to_string(),
            item: format!(
                "{WHITESPACE} {} {WHITESPACE}",
                literal(self.item_separator.trim())
            ),
            key_value: format!(
                "{WHITESPACE} {} {WHITESPACE}",
                literal(self.key_value_separator.trim())
            ),
            end: WHITESPACE.to_string(),
            empty: WHITESPACE.to_string(),
        }
    }

    /// The layout of an array or object nested `depth` levels deep.
    fn layout(&self, depth: usize) -> Layout {
        if self.config.any_whitespace {
            return self.whitespace_layout();
        }
        match self.config.indent {
            Some(indent) => {
                let inner = " ".repeat(indent * (depth + 1));
                let outer = " ".repeat(indent * depth);
                Layout {
                    start: literal(&format!("\n{inner}")),
                    item: literal(&format!("{}\n{inner}", self.item_separator)),
                    key_value: literal(&self.key_value_separator),
                    end: literal(&format!("\n{outer}")),
                    empty: "\"\"".to_string(),
                }
            }
            None => self.inline_layout(),
        }
    }

    /// The layout of values the schema says nothing about, which are always kept on one line.
    fn inline_layout(&self) -> Layout {
        if self.config.any_whitespace {
            return self.whitespace_layout();
        }
        let item = match (&self.config.separators, self.config.indent) {
            (None, Some(_)) => ", ",
            _ => &self.item_separator,
        };
        Layout {
            start: "\"\"".to_string(),
            item: literal(item),
            key_value: literal(&self.key_value_separator),
            end: "\"\"".to_string(),
            empty: "\"\"".to_string(),
        }
    }

    fn fresh_name(&mut self, hint: &str) -> String {
        let base = sanitize(hint);
        let mut name = base.clone();
        let mut counter = 0;
        while !self.used_names.insert(name.clone()) {
            counter += 1;
            name = format!("{base}_{counter}");
        }
        name
    }

    fn add_rule(&mut self, hint: &str, body: String) -> String {
        let name = self.fresh_name(hint);
        self.rules.push((name.clone(), body));
        name
    }

    /// Converts a schema into a rule name, adding a rule unless the schema maps to an existing one.
    fn visit_as_rule(
        &mut self,
        schema: &'a Value,
        hint: &str,
        depth: usize,
    ) -> Result<String, JsonSchemaError> {
        let body = self.visit(schema, hint, depth)?;
        if is_rule_name(&body) {
            Ok(body)
        } else {
            Ok(self.add_rule(hint, body))
        }
    }

    /// Converts a schema into an expression that can be used as a rule body.
    fn visit(
        &mut self,
        schema: &'a Value,
        hint: &str,
        depth: usize,
    ) -> Result<String, JsonSchemaError> {
        let object = match schema {
            Value::Bool(true) => return Ok("basic_any".to_string()),
            Value::Bool(false) => return unsupported(hint, "the schema `false` accepts no value"),
            Value::Object(object) => object,
            _ => return unsupported(hint, "a schema must be an object or a boolean"),
        };
        for keyword in IGNORED_KEYWORDS {
            if object.contains_key(keyword) {
                log::warn!(
                    "The JSON schema keyword `{}` in `{}` is not supported and is ignored.",
                    keyword,
                    hint
                );
            }
        }
        if let Some(reference) = object.get("$ref") {
            let Some(reference) = reference.as_str() else {
                return unsupported(hint, "`$ref` must be a string");
            };
            return self.visit_reference(reference, hint, depth);
        }
        if let Some(value) = object.get("const") {
            return json_literal(value);
        }
        if let Some(values) = object.get("enum") {
            let Some(values) = values.as_array().filter(|values| !values.is_empty()) else {
                return unsupported(hint, "`enum` must be a non-empty array");
            };
            let alternatives = values
                .iter()
                .map(json_literal)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(format!("({})", alternatives.join(" | ")));
        }
        if let Some(schemas) = object.get("anyOf").or_else(|| object.get("oneOf")) {
            let Some(schemas) = schemas.as_array().filter(|schemas| !schemas.is_empty()) else {
                return unsupported(hint, "`anyOf` and `oneOf` must be non-empty arrays");
            };
            let mut alternatives = Vec::with_capacity(schemas.len());
            for (i, schema) in schemas.iter().enumerate() {
                alternatives.push(self.visit_as_rule(schema, &format!("{hint}_case_{i}"), depth)?);
            }
            return Ok(format!("({})", alternatives.join(" | ")));
        }
        if let Some(schemas) = object.get("allOf") {
            return match schemas.as_array().map(Vec::as_slice) {
                Some([schema]) => self.visit(schema, hint, depth),
                _ => unsupported(hint, "`allOf` is only supported with exactly one schema"),
            };
        }
        match object.get("type") {
            Some(Value::String(type_name)) => self.visit_type(object, type_name, hint, depth),
            Some(Value::Array(type_names)) => {
                let mut alternatives = Vec::with_capacity(type_names.len());
                for type_name in type_names {
                    let Some(type_name) = type_name.as_str() else {
                        return unsupported(hint, "`type` must contain strings");
                    };
                    alternatives.push(self.visit_type(object, type_name, hint, depth)?);
                }
                Ok(format!("({})", alternatives.join(" | ")))
            }
            Some(_) => unsupported(hint, "`type` must be a string or an array of strings"),
            None => {
                let has_any = |keywords: &[&str]| keywords.iter().any(|k| object.contains_key(*k));
                if has_any(&[
                    "properties",
                    "required",
                    "additionalProperties",
                    "unevaluatedProperties",
                ]) {
                    self.visit_object(object, hint, depth)
                } else if has_any(&["items", "prefixItems", "unevaluatedItems", "minItems", "maxItems"]) {
                    self.visit_array(object, hint, depth)
                } else if has_any(&["minLength", "maxLength", "pattern", "format"]) {
                    self.visit_string(object, hint)
                } else {
                    Ok("basic_any".to_string())
                }
            }
        }
    }

    fn visit_reference(
        &mut self,
        reference: &str,
        hint: &str,
        depth: usize,
    ) -> Result<String, JsonSchemaError> {
        if reference == "#" {
            return Ok("root".to_string());
        }
        if let Some(name) = self.references.get(reference) {
            return Ok(name.clone());
        }
        let Some(pointer) = reference.strip_prefix('#') else {
            return unsupported(hint, format!("only local references are supported, got `{reference}`"));
        };
        let root: &'a Value = self.root;
        let Some(target) = root.pointer(pointer) else {
            return unsupported(hint, format!("the reference `{reference}` does not resolve"));
        };
        let last = pointer.rsplit('/').next().unwrap_or_default();
        let name = self.fresh_name(&format!("defs_{last}"));
        self.references.insert(reference.to_string(), name.clone());
        let body = self.visit(target, &name, depth)?;
        self.rules.push((name.clone(), body));
        Ok(name)
    }

    fn visit_type(
        &mut self,
        object: &'a Map<String, Value>,
        type_name: &str,
        hint: &str,
        depth: usize,
    ) -> Result<String, JsonSchemaError> {
        match type_name {
            "string" => self.visit_string(object, hint),
            "integer" => Ok("basic_integer".to_string()),
            "number" => Ok("basic_number".to_string()),
            "boolean" => Ok("basic_boolean".to_string()),
            "null" => Ok("basic_null".to_string()),
            "array" => self.visit_array(object, hint, depth),
            "object" => self.visit_object(object, hint, depth),
            _ => unsupported(hint, format!("unknown type `{type_name}`")),
        }
    }

    /// Reads a pair of count bounds. Upper bounds too large for a repetition are dropped.
    fn bounds(
        object: &Map<String, Value>,
        min_key: &str,
        max_key: &str,
        hint: &str,
    ) -> Result<(usize, Option<usize>), JsonSchemaError> {
        let read = |key: &str| match object.get(key) {
            None => Ok(None),
            Some(value) => match value.as_u64() {
                Some(bound) => Ok(Some(bound)),
                None => unsupported(hint, format!("`{key}` must be a non-negative integer")),
            },
        };
        let limit = MAX_REPETITION_BOUND as u64;
        let min = read(min_key)?.unwrap_or(0);
        if min > limit {
            return unsupported(hint, format!("`{min_key}` must not exceed {limit}"));
        }
        let max = match read(max_key)? {
            Some(max) if max > limit => {
                log::warn!(
                    "`{}` in `{}` exceeds {} and is treated as unbounded.",
                    max_key,
                    hint,
                    limit
                );
                None
            }
            max => max,
        };
        if max.is_some_and(|max| max < min) {
            return unsupported(hint, format!("`{min_key}` is greater than `{max_key}`"));
        }
        Ok((min as usize, max.map(|max| max as usize)))
    }

    fn visit_string(
        &mut self,
        object: &Map<String, Value>,
        hint: &str,
    ) -> Result<String, JsonSchemaError> {
        match Self::bounds(object, "minLength", "maxLength", hint)? {
            (0, None) => Ok("basic_string".to_string()),
            (min, max) => Ok(format!(
                r#""\"" {} "\"""#,
                repeat("basic_char", min, max)
            )),
        }
    }

    fn visit_array(
        &mut self,
        object: &'a Map<String, Value>,
        hint: &str,
        depth: usize,
    ) -> Result<String, JsonSchemaError> {
        let layout = self.layout(depth);
        let mut prefix = Vec::new();
        if let Some(items) = object.get("prefixItems") {
            let Some(items) = items.as_array() else {
                return unsupported(hint, "`prefixItems` must be an array");
            };
            for (i, item) in items.iter().enumerate() {
                prefix.push(self.visit_as_rule(item, &format!("{hint}_item_{i}"), depth + 1)?);
            }
        }
        let additional = match object.get("items").or_else(|| object.get("unevaluatedItems")) {
            Some(Value::Bool(false)) => None,
            Some(schema) => Some(self.visit_as_rule(schema, &format!("{hint}_items"), depth + 1)?),
            None if self.config.strict_mode => None,
            None => Some("basic_any".to_string()),
        };
        let (min, max) = Self::bounds(object, "minItems", "maxItems", hint)?;
        let fixed = prefix.len();
        if (additional.is_none() && min > fixed) || max.is_some_and(|max| max < fixed) {
            return unsupported(hint, "the item count bounds contradict `prefixItems`");
        }
        let empty = format!("\"[\" {} \"]\"", layout.empty);
        Ok(match additional {
            None if fixed == 0 => empty,
            None => format!(
                "\"[\" {} {} {} \"]\"",
                layout.start,
                prefix.join(&format!(" {} ", layout.item)),
                layout.end
            ),
            Some(item) if fixed > 0 => {
                let extra = repeat(
                    &format!("({} {})", layout.item, item),
                    min.saturating_sub(fixed),
                    max.map(|max| max - fixed),
                );
                format!(
                    "\"[\" {} {} {} {} \"]\"",
                    layout.start,
                    prefix.join(&format!(" {} ", layout.item)),
                    extra,
                    layout.end
                )
            }
            Some(_) if max == Some(0) => empty,
            Some(item) => {
                let rest = repeat(
                    &format!("({} {})", layout.item, item),
                    min.saturating_sub(1),
                    max.map(|max| max - 1),
                );
                let non_empty = format!(
                    "\"[\" {} {} {} {} \"]\"",
                    layout.start, item, rest, layout.end
                );
                if min == 0 && !self.config.strict_mode {
                    format!("({non_empty} | {empty})")
                } else {
                    non_empty
                }
            }
        })
    }

    fn visit_object(
        &mut self,
        object: &'a Map<String, Value>,
        hint: &str,
        depth: usize,
    ) -> Result<String, JsonSchemaError> {
        let layout = self.layout(depth);
        let properties: Vec<(&String, &'a Value)> = match object.get("properties") {
            None => Vec::new(),
            Some(Value::Object(properties)) => properties.iter().collect(),
            Some(_) => return unsupported(hint, "`properties` must be an object"),
        };
        let required: AHashSet<&str> = object
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let additional = match object
            .get("additionalProperties")
            .or_else(|| object.get("unevaluatedProperties"))
        {
            Some(Value::Bool(false)) => None,
            Some(schema) => Some(self.visit_as_rule(schema, &format!("{hint}_addl"), depth + 1)?),
            None if self.config.strict_mode => None,
            None => Some("basic_any".to_string()),
        };
        let mut pairs = Vec::with_capacity(properties.len());
        for (i, (key, schema)) in properties.into_iter().enumerate() {
            let value = self.visit_as_rule(schema, &format!("{hint}_prop_{i}"), depth + 1)?;
            let key_literal = literal(&serde_json::to_string(key)?);
            pairs.push((
                format!("{} {} {}", key_literal, layout.key_value, value),
                required.contains(key.as_str()),
            ));
        }
        let additional_pair =
            additional.map(|value| format!("basic_string {} {}", layout.key_value, value));
        let additional_tail = additional_pair
            .as_ref()
            .map(|pair| format!("({} {})*", layout.item, pair));
        let empty = format!("\"{{\" {} \"}}\"", layout.empty);
        let non_empty = if pairs.is_empty() {
            let (Some(pair), Some(tail)) = (&additional_pair, &additional_tail) else {
                return Ok(empty);
            };
            format!(
                "\"{{\" {} {} {} {} \"}}\"",
                layout.start, pair, tail, layout.end
            )
        } else if let Some(first_required) = pairs.iter().position(|(_, required)| *required) {
            // Optional properties before the first required one carry their separator after them.
            let mut parts = Vec::with_capacity(pairs.len() + 1);
            for (i, (pair, is_required)) in pairs.iter().enumerate() {
                parts.push(match i.cmp(&first_required) {
                    Ordering::Less => format!("({} {})?", pair, layout.item),
                    Ordering::Equal => pair.clone(),
                    Ordering::Greater if *is_required => format!("{} {}", layout.item, pair),
                    Ordering::Greater => format!("({} {})?", layout.item, pair),
                });
            }
            parts.extend(additional_tail);
            return Ok(format!(
                "\"{{\" {} {} {} \"}}\"",
                layout.start,
                parts.join(" "),
                layout.end
            ));
        } else {
            // tails[k] matches whatever may follow once property k is written.
            let last = additional_tail.unwrap_or_else(|| "\"\"".to_string());
            let mut tails = vec![last.clone(); pairs.len()];
            for k in (0..pairs.len() - 1).rev() {
                let next = tails[k + 1].clone();
                let body = format!("{next} | {} {} {next}", layout.item, pairs[k + 1].0);
                tails[k] = self.add_rule(&format!("{hint}_part_{k}"), body);
            }
            let mut alternatives: Vec<String> = pairs
                .iter()
                .zip(tails.iter())
                .map(|((pair, _), tail)| format!("{pair} {tail}"))
                .collect();
            if let Some(pair) = &additional_pair {
                alternatives.push(format!("{pair} {last}"));
            }
            format!(
                "\"{{\" {} ({}) {} \"}}\"",
                layout.start,
                alternatives.join(" | "),
                layout.end
            )
        };
        if self.config.strict_mode {
            Ok(non_empty)
        } else {
            Ok(format!("({non_empty} | {empty})"))
        }
    }

    fn into_ebnf(self) -> String {
        let layout = self.inline_layout();
        let strict = self.config.strict_mode;
        let container = |non_empty: String, empty: String| {
            if strict {
                non_empty
            } else {
                format!("({non_empty} | {empty})")
            }
        };
        let basic_array = container(
            format!(
                "\"[\" {} basic_any ({} basic_any)* {} \"]\"",
                layout.start, layout.item, layout.end
            ),
            format!("\"[\" {} \"]\"", layout.empty),
        );
        let pair = format!("basic_string {} basic_any", layout.key_value);
        let basic_object = container(
            format!(
                "\"{{\" {} {} ({} {})* {} \"}}\"",
                layout.start, pair, layout.item, pair, layout.end
            ),
            format!("\"{{\" {} \"}}\"", layout.empty),
        );
        let mut output = String::new();
        for (name, body) in BASIC_RULES {
            output.push_str(&format!("{name} ::= {body}\n"));
        }
        output.push_str(&format!("basic_array ::= {basic_array}\n"));
        output.push_str(&format!("basic_object ::= {basic_object}\n"));
        for (name, body) in self.rules {
            output.push_str(&format!("{name} ::= {body}\n"));
        }
        output
    }
}

/// Converts a JSON schema into EBNF text whose main rule `root` matches the JSON values the schema accepts.
///
/// The text can be inspected, edited and then compiled with [`Grammar::new`](crate::grammar::Grammar::new);
/// [`Grammar::from_json_schema`](crate::grammar::Grammar::from_json_schema) does both in one call.
///
/// # Errors
///
/// Returns [`JsonSchemaError::InvalidJson`] when the schema is not JSON and
/// [`JsonSchemaError::UnsupportedSchema`] when a part of it cannot be converted.
pub fn json_schema_to_ebnf(
    schema: &str,
    config: &JsonSchemaConfig,
) -> Result<String, JsonSchemaError> {
    let schema: Value = serde_json::from_str(schema)?;
    let mut converter = SchemaConverter::new(&schema, config);
    let root = converter.visit(&schema, "root", 0)?;
    converter.rules.push(("root".to_string(), root));
    Ok(converter.into_ebnf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Grammar;

    fn accepts(grammar: &Grammar, input: &str) -> bool {
        let automaton = grammar.automaton();
        automaton
            .step_bytes(&automaton.initial_positions(), input.as_bytes())
            .is_some_and(|positions| automaton.is_accepting(&positions))
    }

    fn compact() -> JsonSchemaConfig {
        JsonSchemaConfig {
            any_whitespace: false,
            ..Default::default()
        }
    }

    #[test]
    fn basic_types() {
        let schema = r#"{
            "properties": {
                "integer_field": {"type": "integer"},
                "number_field": {"type": "number"},
                "boolean_field": {"type": "boolean"},
                "any_array_field": {"items": {}, "type": "array"},
                "array_field": {"items": {"type": "string"}, "type": "array"},
                "tuple_field": {
                    "maxItems": 3,
                    "minItems": 3,
                    "prefixItems": [
                        {"type": "string"},
                        {"type": "integer"},
                        {"items": {"type": "string"}, "type": "array"}
                    ],
                    "type": "array"
                },
                "object_field": {"additionalProperties": {"type": "integer"}, "type": "object"},
                "nested_object_field": {
                    "additionalProperties": {"additionalProperties": {"type": "integer"}, "type": "object"},
                    "type": "object"
                }
            },
            "required": ["integer_field", "number_field", "boolean_field", "any_array_field",
                "array_field", "tuple_field", "object_field", "nested_object_field"],
            "title": "MainModel",
            "type": "object"
        }"#;
        let grammar = Grammar::from_json_schema(schema, compact()).unwrap();
        assert!(accepts(
            &grammar,
            r#"{"integer_field": 42, "number_field": 314000.0, "boolean_field": true, "any_array_field": [3.14, "foo", null, true], "array_field": ["foo", "bar"], "tuple_field": ["foo", 42, ["bar", "baz"]], "object_field": {"foo": 42, "bar": 43}, "nested_object_field": {"foo": {"bar": 42}}}"#
        ));
        // Strict mode never generates empty arrays or objects for listed items or properties.
        assert!(!accepts(
            &grammar,
            r#"{"integer_field": 42, "number_field": 314000.0, "boolean_field": true, "any_array_field": [], "array_field": [], "tuple_field": ["foo", 42, []], "object_field": {}, "nested_object_field": {}}"#
        ));
        assert!(!accepts(
            &grammar,
            r#"{"integer_field": 4.2, "number_field": 3, "boolean_field": true, "any_array_field": [1], "array_field": ["foo"], "tuple_field": ["foo", 42, ["bar"]], "object_field": {"a": 1}, "nested_object_field": {"b": {"c": 1}}}"#
        ));
        assert!(accepts(
            &grammar,
            r#"{"integer_field": -4, "number_field": 3, "boolean_field": false, "any_array_field": [{"x": [1]}], "array_field": ["foo"], "tuple_field": ["foo", 42, ["bar"]], "object_field": {"a": 1}, "nested_object_field": {"b": {"c": 1}}}"#
        ));
    }

    #[test]
    fn enum_and_const() {
        let schema = r##"{
            "$defs": {"Field": {"enum": ["foo", "bar"], "title": "Field", "type": "string"}},
            "properties": {
                "bars": {"const": "a", "type": "string"},
                "str_values": {"const": "a\n\r\"", "type": "string"},
                "foo": {"enum": ["a", "b", "c"], "type": "string"},
                "values": {"enum": [1, "a", true]},
                "field": {"$ref": "#/$defs/Field"}
            },
            "required": ["bars", "str_values", "foo", "values", "field"],
            "type": "object"
        }"##;
        let grammar = Grammar::from_json_schema(schema, compact()).unwrap();
        assert!(accepts(
            &grammar,
            r#"{"bars": "a", "str_values": "a\n\r\"", "foo": "a", "values": 1, "field": "foo"}"#
        ));
        assert!(accepts(
            &grammar,
            r#"{"bars": "a", "str_values": "a\n\r\"", "foo": "c", "values": true, "field": "bar"}"#
        ));
        assert!(!accepts(
            &grammar,
            r#"{"bars": "a", "str_values": "a\n\r\"", "foo": "a", "values": 2, "field": "foo"}"#
        ));
        assert!(!accepts(
            &grammar,
            r#"{"bars": "a", "str_values": "a\n\r\"", "foo": "a", "values": 1, "field": "baz"}"#
        ));
        let ebnf = json_schema_to_ebnf(r#"{"enum": ["a", 1]}"#, &compact()).unwrap();
        assert!(ebnf.ends_with(&format!("{}\n", r#"root ::= ("\"a\"" | "1")"#)));
    }

    #[test]
    fn optional_properties() {
        let schema = r#"{
            "properties": {
                "num": {"default": 0, "type": "integer"},
                "opt_bool": {"anyOf": [{"type": "boolean"}, {"type": "null"}], "default": null},
                "size": {"anyOf": [{"type": "number"}, {"type": "null"}]},
                "name": {"default": "", "type": "string"}
            },
            "required": ["size"],
            "type": "object"
        }"#;
        let grammar = Grammar::from_json_schema(schema, compact()).unwrap();
        for input in [
            r#"{"num": 42, "opt_bool": true, "size": 3.14, "name": "foo"}"#,
            r#"{"size": null}"#,
            r#"{"size": null, "name": "foo"}"#,
            r#"{"num": 1, "size": null, "name": "foo"}"#,
        ] {
            assert!(accepts(&grammar, input), "{input}");
        }
        for input in [
            r#"{"num": 1}"#,
            r#"{"name": "foo", "size": null}"#,
            r#"{"size": null, "other": 1}"#,
        ] {
            assert!(!accepts(&grammar, input), "{input}");
        }
    }

    #[test]
    fn all_optional_properties() {
        let schema = r#"{
            "properties": {
                "size": {"type": "integer"},
                "state": {"type": "boolean"},
                "num": {"type": "number"}
            },
            "type": "object"
        }"#;
        let grammar = Grammar::from_json_schema(schema, compact()).unwrap();
        for input in [
            r#"{"size": 42, "state": true, "num": 3.14}"#,
            r#"{"state": false}"#,
            r#"{"size": 1, "num": 1.5}"#,
        ] {
            assert!(accepts(&grammar, input), "{input}");
        }
        assert!(!accepts(&grammar, "{}"));
        assert!(!accepts(&grammar, r#"{"num": 1.5, "size": 1}"#));
        let non_strict = JsonSchemaConfig {
            strict_mode: false,
            ..compact()
        };
        let grammar = Grammar::from_json_schema(schema, non_strict).unwrap();
        for input in [
            r#"{"size": 1, "num": 1.5, "other": false}"#,
            r#"{"other": false}"#,
            "{}",
        ] {
            assert!(accepts(&grammar, input), "{input}");
        }
    }

    #[test]
    fn references() {
        let schema = r##"{
            "$defs": {
                "Bar": {
                    "properties": {
                        "apple": {"default": "x", "type": "string"},
                        "banana": {"default": "y", "type": "string"}
                    },
                    "type": "object"
                },
                "Foo": {
                    "properties": {
                        "count": {"type": "integer"},
                        "size": {"anyOf": [{"type": "number"}, {"type": "null"}], "default": null}
                    },
                    "required": ["count"],
                    "type": "object"
                }
            },
            "properties": {
                "foo": {"$ref": "#/$defs/Foo"},
                "bars": {"items": {"$ref": "#/$defs/Bar"}, "type": "array"}
            },
            "required": ["foo", "bars"],
            "type": "object"
        }"##;
        let grammar = Grammar::from_json_schema(schema, compact()).unwrap();
        assert!(accepts(
            &grammar,
            r#"{"foo": {"count": 42, "size": 3.14}, "bars": [{"apple": "a", "banana": "b"}, {"apple": "c", "banana": "d"}]}"#
        ));
        assert!(accepts(
            &grammar,
            r#"{"foo": {"count": 42}, "bars": [{"banana": "b"}]}"#
        ));
        assert!(!accepts(
            &grammar,
            r#"{"foo": {"count": 42}, "bars": [{"banana": "b", "apple": "a"}]}"#
        ));
        assert!(grammar.rule_id("defs_Foo").is_some());
        assert!(grammar.rule_id("defs_Bar").is_some());
    }

    #[test]
    fn recursive_references() {
        let schema = r##"{
            "type": "object",
            "properties": {
                "value": {"type": "integer"},
                "next": {"anyOf": [{"$ref": "#"}, {"type": "null"}]}
            },
            "required": ["value", "next"]
        }"##;
        let grammar = Grammar::from_json_schema(schema, compact()).unwrap();
        assert!(accepts(
            &grammar,
            r#"{"value": 1, "next": {"value": 2, "next": null}}"#
        ));
        assert!(!accepts(&grammar, r#"{"value": 1, "next": {"value": 2}}"#));
    }

    #[test]
    fn any_of_and_one_of() {
        for keyword in ["anyOf", "oneOf"] {
            let schema = format!(
                r#"{{"type": "object", "properties": {{"name": {{"{keyword}": [{{"type": "string"}}, {{"type": "integer"}}]}}}}}}"#
            );
            let grammar = Grammar::from_json_schema(&schema, compact()).unwrap();
            assert!(accepts(&grammar, r#"{"name": "John"}"#));
            assert!(accepts(&grammar, r#"{"name": 123}"#));
            assert!(!accepts(&grammar, r#"{"name": {"a": 1}}"#));
        }
    }

    #[test]
    fn any_whitespace() {
        let schema = r#"{
            "properties": {
                "value": {"type": "string"},
                "arr": {"items": {"type": "integer"}, "type": "array"},
                "obj": {"additionalProperties": {"type": "integer"}, "type": "object"}
            },
            "required": ["value", "arr", "obj"],
            "type": "object"
        }"#;
        let grammar = Grammar::from_json_schema(schema, JsonSchemaConfig::default()).unwrap();
        for input in [
            r#"{"value": "test", "arr": [1, 2], "obj": {"a": 1}}"#,
            r#"{ "value" : "test", "arr": [1, 2], "obj": {"a": 1} }"#,
            "{\n  \"value\"  :  \"test\",\n  \"arr\"  :  [1, 2],\n  \"obj\"  :  {\"a\": 1}\n}",
            "{\t\"value\"\t:\t\"test\",\t\"arr\":\t[1,\t2],\t\"obj\":\t{\"a\":\t1}\t}",
            r#"{"value":"test","arr":[1,2],"obj":{"a":1}}"#,
        ] {
            assert!(accepts(&grammar, input), "{input:?}");
        }
        assert!(!accepts(&grammar, r#"{"value": "test", "arr": [1, 2], "obj": {"a": 1}, "b": 1}"#));
    }

    #[test]
    fn indent_and_separators() {
        let schema = r#"{
            "properties": {
                "array_field": {"items": {"type": "string"}, "type": "array"},
                "tuple_field": {
                    "prefixItems": [
                        {"type": "string"},
                        {"type": "integer"},
                        {"items": {"type": "string"}, "type": "array"}
                    ],
                    "type": "array"
                },
                "object_field": {"additionalProperties": {"type": "integer"}, "type": "object"}
            },
            "required": ["array_field", "tuple_field", "object_field"],
            "type": "object"
        }"#;
        let indented = JsonSchemaConfig {
            indent: Some(2),
            ..compact()
        };
        let grammar = Grammar::from_json_schema(schema, indented).unwrap();
        let input = r#"{
  "array_field": [
    "foo",
    "bar"
  ],
  "tuple_field": [
    "foo",
    42,
    [
      "bar",
      "baz"
    ]
  ],
  "object_field": {
    "foo": 42,
    "bar": 43
  }
}"#;
        assert!(accepts(&grammar, input));
        assert!(!accepts(
            &grammar,
            r#"{"array_field": ["foo", "bar"], "tuple_field": ["foo", 42, ["bar", "baz"]], "object_field": {"foo": 42, "bar": 43}}"#
        ));
        let minified = JsonSchemaConfig {
            separators: Some((",".to_string(), ":".to_string())),
            ..compact()
        };
        let grammar = Grammar::from_json_schema(schema, minified).unwrap();
        assert!(accepts(
            &grammar,
            r#"{"array_field":["foo","bar"],"tuple_field":["foo",42,["bar","baz"]],"object_field":{"foo":42,"bar":43}}"#
        ));
        assert!(!accepts(
            &grammar,
            r#"{"array_field": ["foo", "bar"], "tuple_field": ["foo", 42, ["bar", "baz"]], "object_field": {"foo": 42, "bar": 43}}"#
        ));
    }

    #[test]
    fn array_and_string_bounds() {
        let schema = r#"{
            "type": "array",
            "items": {"type": "string", "minLength": 1, "maxLength": 3},
            "minItems": 2,
            "maxItems": 3
        }"#;
        let grammar = Grammar::from_json_schema(schema, compact()).unwrap();
        assert!(accepts(&grammar, r#"["a", "abc"]"#));
        assert!(accepts(&grammar, r#"["a", "b", "c"]"#));
        assert!(!accepts(&grammar, r#"["a"]"#));
        assert!(!accepts(&grammar, r#"["a", "b", "c", "d"]"#));
        assert!(!accepts(&grammar, r#"["a", ""]"#));
        assert!(!accepts(&grammar, r#"["a", "abcd"]"#));
        let items_only = r#"{"items": {"type": "integer"}}"#;
        let grammar = Grammar::from_json_schema(items_only, compact()).unwrap();
        assert!(accepts(&grammar, "[1, 2]"));
        assert!(!accepts(&grammar, "[]"));
        let non_strict = JsonSchemaConfig {
            strict_mode: false,
            ..compact()
        };
        let grammar = Grammar::from_json_schema(items_only, non_strict).unwrap();
        assert!(accepts(&grammar, "[]"));
        assert!(!accepts(&grammar, r#"["a"]"#));
    }

    #[test]
    fn unsupported_schemas() {
        assert!(matches!(
            Grammar::from_json_schema("{", JsonSchemaConfig::default()),
            Err(JsonSchemaError::InvalidJson(_))
        ));
        for schema in [
            r#"{"type": "date"}"#,
            "false",
            r##"{"$ref": "#/$defs/Missing"}"##,
            r#"{"$ref": "https://example.com/schema.json"}"#,
            r#"{"type": "array", "minItems": 3, "maxItems": 2}"#,
            r#"{"type": "string", "minLength": 100000}"#,
            r#"{"enum": []}"#,
        ] {
            assert!(
                matches!(
                    Grammar::from_json_schema(schema, JsonSchemaConfig::default()),
                    Err(JsonSchemaError::UnsupportedSchema { .. })
                ),
                "{schema}"
            );
        }
        let error = Grammar::from_json_schema(r#"{"type": "date"}"#, JsonSchemaConfig::default())
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "Unsupported JSON schema at `root`: unknown type `date`"
        );
        assert!(matches!(
            Grammar::from_json_schema(
                r##"{"$defs": {"A": {"$ref": "#/$defs/A"}}, "$ref": "#/$defs/A"}"##,
                JsonSchemaConfig::default()
            ),
            Err(JsonSchemaError::GrammarError(CreateGrammarError::SemanticError(_)))
        ));
    }
}
