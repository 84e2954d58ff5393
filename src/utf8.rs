//! Lowering of Unicode scalar value ranges into sequences of UTF-8 byte ranges.
//!
//! Character classes are matched byte by byte at runtime, so every class is
//! translated here into a small set of byte-range sequences, each of which
//! matches exactly the UTF-8 encodings of one contiguous slice of the class.
use tinyvec::ArrayVec;

const MAX_SCALAR_VALUE: u32 = 0x10FFFF;
const SURROGATE_START: u32 = 0xD800;
const SURROGATE_END: u32 = 0xDFFF;

/// A sequence of at most four inclusive byte ranges.
pub(crate) type Utf8Sequence = ArrayVec<[(u8, u8); 4]>;

/// Sorts and merges code point ranges, complementing them over the scalar value space if `negated`.
pub(crate) fn canonical_ranges(ranges: &[(u32, u32)], negated: bool) -> Vec<(u32, u32)> {
    let mut sorted: Vec<(u32, u32)> = ranges
        .iter()
        .map(|&(lo, hi)| (lo.min(hi), lo.max(hi).min(MAX_SCALAR_VALUE)))
        .filter(|&(lo, _)| lo <= MAX_SCALAR_VALUE)
        .collect();
    sorted.sort_unstable();
    let mut merged: Vec<(u32, u32)> = Vec::with_capacity(sorted.len());
    for (lo, hi) in sorted {
        match merged.last_mut() {
            Some(last) if lo <= last.1.saturating_add(1) => last.1 = last.1.max(hi),
            _ => merged.push((lo, hi)),
        }
    }
    if !negated {
        return merged;
    }
    let mut complement = Vec::with_capacity(merged.len() + 1);
    let mut next = 0u32;
    for (lo, hi) in merged {
        if lo > next {
            complement.push((next, lo - 1));
        }
        next = hi + 1;
    }
    if next <= MAX_SCALAR_VALUE {
        complement.push((next, MAX_SCALAR_VALUE));
    }
    complement
}

fn max_scalar_value(nbytes: usize) -> u32 {
    match nbytes {
        1 => 0x007F,
        2 => 0x07FF,
        3 => 0xFFFF,
        _ => MAX_SCALAR_VALUE,
    }
}

/// Splits the scalar value range `[start, end]` into UTF-8 byte-range sequences, in ascending order.
///
/// Surrogate code points are skipped since they have no UTF-8 encoding.
pub(crate) fn utf8_sequences(start: u32, end: u32) -> Vec<Utf8Sequence> {
    let mut output = Vec::new();
    let mut stack = vec![(start, end.min(MAX_SCALAR_VALUE))];
    'outer: while let Some((mut start, mut end)) = stack.pop() {
        'inner: loop {
            if start < SURROGATE_END + 1 && end > SURROGATE_START - 1 {
                if end > SURROGATE_END {
                    stack.push((SURROGATE_END + 1, end));
                }
                end = SURROGATE_START - 1;
                if start > end {
                    continue 'outer;
                }
                continue 'inner;
            }
            if start > end {
                continue 'outer;
            }
            for nbytes in 1..4 {
                let max = max_scalar_value(nbytes);
                if start <= max && max < end {
                    stack.push((max + 1, end));
                    end = max;
                    continue 'inner;
                }
            }
            if end <= 0x7F {
                let mut sequence = Utf8Sequence::new();
                sequence.push((start as u8, end as u8));
                output.push(sequence);
                continue 'outer;
            }
            for i in 1..4 {
                let mask = (1u32 << (6 * i)) - 1;
                if (start & !mask) != (end & !mask) {
                    if (start & mask) != 0 {
                        stack.push(((start | mask) + 1, end));
                        end = start | mask;
                        continue 'inner;
                    }
                    if (end & mask) != mask {
                        stack.push((end & !mask, end));
                        end = (end & !mask) - 1;
                        continue 'inner;
                    }
                }
            }
            let (Some(first), Some(last)) = (char::from_u32(start), char::from_u32(end)) else {
                continue 'outer;
            };
            let mut first_buf = [0u8; 4];
            let mut last_buf = [0u8; 4];
            let first = first.encode_utf8(&mut first_buf).as_bytes();
            let last = last.encode_utf8(&mut last_buf).as_bytes();
            debug_assert_eq!(first.len(), last.len());
            let mut sequence = Utf8Sequence::new();
            for (&lo, &hi) in first.iter().zip(last.iter()) {
                sequence.push((lo, hi));
            }
            output.push(sequence);
            continue 'outer;
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(sequences: &[Utf8Sequence], bytes: &[u8]) -> bool {
        sequences.iter().any(|sequence| {
            sequence.len() == bytes.len()
                && sequence
                    .iter()
                    .zip(bytes)
                    .all(|(&(lo, hi), &b)| lo <= b && b <= hi)
        })
    }

    #[test]
    fn ascii_range_is_one_sequence() {
        let sequences = utf8_sequences('a' as u32, 'z' as u32);
        assert_eq!(sequences.len(), 1);
        assert_eq!(sequences[0].as_slice(), &[(b'a', b'z')]);
    }

    #[test]
    fn sequences_cover_exactly_the_range() {
        let (start, end) = (0x70, 0x1F600);
        let sequences = utf8_sequences(start, end);
        for cp in [0x00u32, 0x6F, 0x70, 0x7F, 0x80, 0x7FF, 0x800, 0xD7FF, 0xE000, 0xFFFF, 0x10000, 0x1F600, 0x1F601] {
            let Some(c) = char::from_u32(cp) else { continue };
            let mut buf = [0u8; 4];
            let encoded = c.encode_utf8(&mut buf).as_bytes();
            assert_eq!(
                matches(&sequences, encoded),
                (start..=end).contains(&cp),
                "code point {cp:#x}"
            );
        }
    }

    #[test]
    fn every_two_byte_char_matches() {
        let sequences = utf8_sequences(0x80, 0x7FF);
        for cp in 0x80..=0x7FF {
            let c = char::from_u32(cp).unwrap();
            let mut buf = [0u8; 4];
            assert!(matches(&sequences, c.encode_utf8(&mut buf).as_bytes()));
        }
    }

    #[test]
    fn surrogates_are_skipped() {
        assert!(utf8_sequences(0xD800, 0xDFFF).is_empty());
        let sequences = utf8_sequences(0xD000, 0xE0FF);
        assert!(matches(&sequences, "\u{D7FF}".as_bytes()));
        assert!(matches(&sequences, "\u{E000}".as_bytes()));
    }

    #[test]
    fn negated_ranges_complement() {
        assert_eq!(
            canonical_ranges(&[('b' as u32, 'd' as u32), ('a' as u32, 'a' as u32)], false),
            vec![('a' as u32, 'd' as u32)]
        );
        assert_eq!(
            canonical_ranges(&[(0x22, 0x22), (0x00, 0x1F)], true),
            vec![(0x20, 0x21), (0x23, MAX_SCALAR_VALUE)]
        );
    }
}
