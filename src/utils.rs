//! Utility functions for the library.
use fixedbitset_stack::on_stack::{get_nblock, FixedBitSet};

pub(crate) type ByteSet = FixedBitSet<{ get_nblock(u8::MAX as usize) }>;

pub(crate) fn get_display_form_from_bitset_on_stack<const NBLOCK: usize>(
    bitset: &FixedBitSet<NBLOCK>,
) -> Vec<usize> {
    bitset.ones().collect()
}

pub(crate) fn get_display_form_from_bitset(bitset: &fixedbitset_stack::FixedBitSet) -> Vec<usize> {
    bitset.ones().collect()
}

/// Renders bytes the way they would be written inside a double-quoted EBNF literal.
pub(crate) fn escape_bytes(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len());
    let mut rest = bytes;
    while !rest.is_empty() {
        let (valid, invalid_len) = match std::str::from_utf8(rest) {
            Ok(s) => (s, 0),
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                let s = std::str::from_utf8(&rest[..valid_up_to]).unwrap_or_default();
                (s, e.error_len().unwrap_or(rest.len() - valid_up_to))
            }
        };
        for c in valid.chars() {
            escape_char_into(c, &mut output);
        }
        let consumed = valid.len();
        for byte in &rest[consumed..consumed + invalid_len] {
            output.push_str(&format!("\\x{:02x}", byte));
        }
        rest = &rest[consumed + invalid_len..];
    }
    output
}

/// Renders a code point the way it would be written inside an EBNF character class.
pub(crate) fn escape_class_char(code_point: u32) -> String {
    match char::from_u32(code_point) {
        Some(c @ (']' | '-' | '^')) => format!("\\{c}"),
        Some(c) => {
            let mut output = String::new();
            escape_char_into(c, &mut output);
            output
        }
        None => format!("\\U{:08x}", code_point),
    }
}

fn escape_char_into(c: char, output: &mut String) {
    match c {
        '\n' => output.push_str("\\n"),
        '\r' => output.push_str("\\r"),
        '\t' => output.push_str("\\t"),
        '\\' => output.push_str("\\\\"),
        '"' => output.push_str("\\\""),
        c if c.is_control() => output.push_str(&format!("\\x{:02x}", c as u32)),
        c => output.push(c),
    }
}

/// Returns the length of the longest common prefix of two byte strings.
#[inline]
pub(crate) fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
