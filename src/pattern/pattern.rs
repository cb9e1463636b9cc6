//! Hex Pattern Analyzer: entropy, repeating byte patterns, arithmetic
//! sequences, and candidate encodings over an opaque payload. Never panics
//! or errors — every method degrades to an empty/zero result on malformed
//! or trivial input.

use std::collections::HashMap;
use std::fmt::Write as _;

use bluefusion_crypto::{byte_frequency, shannon_entropy};

/// Default minimum window length scanned for repeating patterns.
pub const DEFAULT_MIN_PATTERN_LEN: usize = 2;
/// Default maximum window length scanned for repeating patterns.
pub const DEFAULT_MAX_PATTERN_LEN: usize = 8;

/// A repeating byte-window pattern found in a payload.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct PatternMatch {
    /// Raw bytes of the pattern.
    pub pattern: Vec<u8>,
    /// Lowercase hex encoding of `pattern`.
    pub hex_pattern: String,
    /// 0-indexed byte offsets where the pattern occurs (overlaps allowed).
    pub positions: Vec<usize>,
    /// Number of occurrences.
    pub count: usize,
    /// `count / max(1, N - length + 1)`.
    pub frequency: f64,
    /// Pattern length in bytes.
    pub length: usize,
}

/// Result of [`HexPatternAnalyzer::analyze`].
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct PatternReport {
    /// All discovered patterns, sorted `(count desc, length desc, bytes asc)`.
    pub patterns: Vec<PatternMatch>,
    /// The first element of `patterns`, if any.
    pub most_frequent: Option<PatternMatch>,
    /// Fraction of the payload covered by the chosen pattern list, `0..=1`.
    pub coverage: f64,
    /// Shannon entropy of the payload, in bits per byte (`0..=8`).
    pub entropy: f64,
}

/// Kind of arithmetic progression found by [`HexPatternAnalyzer::find_sequences`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SequenceKind {
    /// Consecutive bytes forming a progression.
    Arithmetic,
    /// Consecutive little-endian `uint16` values forming a progression.
    ArithmeticUint16,
}

/// A maximal monotone arithmetic progression.
#[derive(Clone, Debug, PartialEq)]
pub struct Sequence {
    pub kind: SequenceKind,
    pub start_value: i64,
    pub difference: i64,
    pub length: usize,
    pub start_index: usize,
}

/// A repeating bit-level pattern found by [`HexPatternAnalyzer::find_bit_patterns`].
#[derive(Clone, Debug, PartialEq)]
pub struct BitPattern {
    /// Period of the repeat, in bits (`1..=16`).
    pub period_bits: usize,
    /// The repeating bit pattern, packed into the low `period_bits` bits.
    pub pattern: u16,
    /// How many full periods were observed back to back.
    pub repeats: usize,
}

/// A decoded candidate encoding with a confidence heuristic.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodingMatch {
    pub decoded: String,
    pub confidence: f64,
}

/// Scans opaque payloads for repeating patterns, arithmetic runs, and
/// plausible text/BCD encodings. Stateless aside from its configured
/// window bounds, so it's cheap to keep one instance around per inspector.
#[derive(Clone, Copy, Debug)]
pub struct HexPatternAnalyzer {
    pub min_pattern_length: usize,
    pub max_pattern_length: usize,
}

impl Default for HexPatternAnalyzer {
    fn default() -> Self {
        Self {
            min_pattern_length: DEFAULT_MIN_PATTERN_LEN,
            max_pattern_length: DEFAULT_MAX_PATTERN_LEN,
        }
    }
}

impl HexPatternAnalyzer {
    #[must_use]
    pub fn new(min_pattern_length: usize, max_pattern_length: usize) -> Self {
        Self {
            min_pattern_length,
            max_pattern_length,
        }
    }

    /// Runs the full pattern/entropy analysis. Never panics; an empty
    /// `data` yields a zeroed, empty report.
    #[must_use]
    pub fn analyze(&self, data: &[u8]) -> PatternReport {
        let entropy = shannon_entropy(data);
        if data.is_empty() {
            return PatternReport {
                entropy,
                ..PatternReport::default()
            };
        }

        let n = data.len();
        let mut found: HashMap<Vec<u8>, Vec<usize>> = HashMap::new();
        let max_len = self.max_pattern_length.min(n);
        for len in self.min_pattern_length..=max_len.max(self.min_pattern_length) {
            if len == 0 || len > n {
                continue;
            }
            for start in 0..=n - len {
                found
                    .entry(data[start..start + len].to_vec())
                    .or_default()
                    .push(start);
            }
        }

        let mut patterns: Vec<PatternMatch> = found
            .into_iter()
            .filter(|(_, positions)| positions.len() >= 2)
            .map(|(pattern, positions)| {
                let length = pattern.len();
                let count = positions.len();
                let denom = (n - length + 1).max(1) as f64;
                PatternMatch {
                    hex_pattern: to_hex(&pattern),
                    frequency: count as f64 / denom,
                    positions,
                    count,
                    length,
                    pattern,
                }
            })
            .collect();

        patterns.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(b.length.cmp(&a.length))
                .then(a.pattern.cmp(&b.pattern))
        });

        let covered: usize = patterns.iter().map(|p| p.count * p.length).sum();
        let coverage = (covered as f64 / n as f64).min(1.0);
        let most_frequent = patterns.first().cloned();

        PatternReport {
            patterns,
            most_frequent,
            coverage,
            entropy,
        }
    }

    /// Detects maximal monotone arithmetic progressions, both over raw
    /// bytes (length ≥ 3, difference in `-255..=255`, nonzero) and over
    /// little-endian `uint16` pairs taken at stride 2.
    #[must_use]
    pub fn find_sequences(&self, data: &[u8]) -> Vec<Sequence> {
        let mut out = byte_sequences(data);
        out.extend(uint16_sequences(data));
        out
    }

    /// Finds repeating bit-level patterns with periods of 1..=16 bits.
    /// A heuristic companion to [`Self::analyze`]'s byte-level view, useful
    /// for payloads whose structure doesn't align to byte boundaries.
    #[must_use]
    pub fn find_bit_patterns(&self, data: &[u8]) -> Vec<BitPattern> {
        if data.is_empty() {
            return Vec::new();
        }
        let bits = to_bit_vec(data);
        let mut out = Vec::new();
        for period in 1..=16usize.min(bits.len() / 2) {
            let mut repeats = 1;
            let mut i = period;
            while i + period <= bits.len() && bits[i..i + period] == bits[..period] {
                repeats += 1;
                i += period;
            }
            if repeats >= 2 {
                let mut pattern = 0u16;
                for (bit_idx, &b) in bits[..period].iter().enumerate() {
                    if b {
                        pattern |= 1 << (period - 1 - bit_idx);
                    }
                }
                out.push(BitPattern {
                    period_bits: period,
                    pattern,
                    repeats,
                });
            }
        }
        out
    }

    /// Runs a fixed battery of encoding heuristics over `data`, returning
    /// only the encodings that successfully decode.
    #[must_use]
    pub fn detect_encoding(&self, data: &[u8]) -> HashMap<String, EncodingMatch> {
        let mut out = HashMap::new();
        if data.is_empty() {
            return out;
        }

        let printable = data
            .iter()
            .filter(|&&b| (0x20..=0x7E).contains(&b))
            .count();
        #[allow(clippy::cast_precision_loss)]
        let printable_ratio = printable as f64 / data.len() as f64;
        if printable > 0 {
            let decoded: String = data.iter().map(|&b| b as char).collect();
            out.insert(
                "ascii".to_owned(),
                EncodingMatch {
                    decoded,
                    confidence: printable_ratio,
                },
            );
        }

        if data.iter().all(|&b| (b & 0x0F) <= 9 && (b >> 4) <= 9) {
            let decoded: String = data
                .iter()
                .flat_map(|&b| [b >> 4, b & 0x0F])
                .map(|nibble| char::from(b'0' + nibble))
                .collect();
            out.insert(
                "bcd".to_owned(),
                EncodingMatch {
                    decoded,
                    confidence: 1.0,
                },
            );
        }

        if data.len() % 2 == 0 {
            let units: Vec<u16> = data
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            if let Ok(decoded) = String::from_utf16(&units) {
                out.insert(
                    "utf16le".to_owned(),
                    EncodingMatch {
                        decoded,
                        confidence: 0.7,
                    },
                );
            }
        }

        if let Ok(decoded) = std::str::from_utf8(data) {
            out.insert(
                "utf8".to_owned(),
                EncodingMatch {
                    decoded: decoded.to_owned(),
                    confidence: 0.8,
                },
            );
        }

        out
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn to_bit_vec(data: &[u8]) -> Vec<bool> {
    data.iter()
        .flat_map(|&b| (0..8).rev().map(move |i| (b >> i) & 1 == 1))
        .collect()
}

fn byte_sequences(data: &[u8]) -> Vec<Sequence> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 1 < data.len() {
        let d = i64::from(data[i + 1]) - i64::from(data[i]);
        if d == 0 || d.abs() > 255 {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j + 1 < data.len() && i64::from(data[j + 1]) - i64::from(data[j]) == d {
            j += 1;
        }
        let length = j - i + 1;
        if length >= 3 {
            out.push(Sequence {
                kind: SequenceKind::Arithmetic,
                start_value: i64::from(data[i]),
                difference: d,
                length,
                start_index: i,
            });
            i = j + 1;
        } else {
            i += 1;
        }
    }
    out
}

fn uint16_sequences(data: &[u8]) -> Vec<Sequence> {
    let values: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i + 1 < values.len() {
        let d = i64::from(values[i + 1]) - i64::from(values[i]);
        if d == 0 {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j + 1 < values.len() && i64::from(values[j + 1]) - i64::from(values[j]) == d {
            j += 1;
        }
        let length = j - i + 1;
        if length >= 3 {
            out.push(Sequence {
                kind: SequenceKind::ArithmeticUint16,
                start_value: i64::from(values[i]),
                difference: d,
                length,
                start_index: i * 2,
            });
            i = j + 1;
        } else {
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> HexPatternAnalyzer {
        HexPatternAnalyzer::new(2, 8)
    }

    #[test]
    fn simple_repeating_pattern() {
        let data = hex("AABBAABBAABB");
        let result = analyzer().analyze(&data);
        assert!(!result.patterns.is_empty());
        let top = result.most_frequent.unwrap();
        assert_eq!(top.hex_pattern, "aabb");
        assert_eq!(top.count, 3);
        assert!(result.coverage > 0.9);
    }

    #[test]
    fn no_patterns_in_random_data() {
        let data = hex("0123456789ABCDEF");
        let result = analyzer().analyze(&data);
        assert!(result.patterns.len() < 3);
        assert!(result.coverage < 0.5);
    }

    #[test]
    fn empty_data_yields_empty_report() {
        let result = analyzer().analyze(&[]);
        assert!(result.patterns.is_empty());
        assert!(result.most_frequent.is_none());
        assert_eq!(result.coverage, 0.0);
        assert_eq!(result.entropy, 0.0);
    }

    #[test]
    fn pattern_positions_are_byte_offsets() {
        let data = hex("00CAFE00CAFE00");
        let result = analyzer().analyze(&data);
        let cafe = result.patterns.iter().find(|p| p.hex_pattern == "cafe").unwrap();
        assert_eq!(cafe.positions, vec![1, 4]);
    }

    #[test]
    fn pattern_frequency_matches_denominator() {
        let data = hex("ABABAB00");
        let result = analyzer().analyze(&data);
        let ab = result.patterns.iter().find(|p| p.hex_pattern == "ab").unwrap();
        assert_eq!(ab.count, 3);
        assert!((ab.frequency - 3.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn narrow_window_bounds() {
        let analyzer = HexPatternAnalyzer::new(4, 4);
        let data = hex("DEADBEEFDEADBEEF");
        let result = analyzer.analyze(&data);
        let top = result.most_frequent.unwrap();
        assert_eq!(top.hex_pattern, "deadbeef");
        assert_eq!(top.length, 4);
    }

    #[test]
    fn entropy_low_vs_high() {
        let low = analyzer().analyze(&hex("00000000"));
        let high = analyzer().analyze(&hex("1A2B3C4D"));
        assert!(low.entropy < high.entropy);
        assert!(low.entropy < 0.5);
        assert!(high.entropy > 0.5);
    }

    #[test]
    fn byte_sequence_detection() {
        let data = hex("0102030405");
        let seqs = analyzer().find_sequences(&data);
        assert_eq!(seqs[0].kind, SequenceKind::Arithmetic);
        assert_eq!(seqs[0].difference, 1);
        assert_eq!(seqs[0].length, 5);
    }

    #[test]
    fn uint16_sequence_detection() {
        let data = hex("000100020003");
        let seqs = analyzer().find_sequences(&data);
        let u16seq = seqs
            .iter()
            .find(|s| s.kind == SequenceKind::ArithmeticUint16)
            .unwrap();
        assert_eq!(u16seq.difference, 0x0100);
        assert_eq!(u16seq.length, 3);
    }

    #[test]
    fn bit_pattern_detection() {
        let data = hex("AA55AA55");
        let bits = analyzer().find_bit_patterns(&data);
        assert!(!bits.is_empty());
    }

    #[test]
    fn ascii_encoding_detection() {
        let encodings = analyzer().detect_encoding(b"Hello");
        let ascii = &encodings["ascii"];
        assert_eq!(ascii.confidence, 1.0);
        assert_eq!(ascii.decoded, "Hello");
    }

    #[test]
    fn bcd_encoding_detection() {
        let encodings = analyzer().detect_encoding(&hex("1234"));
        assert_eq!(encodings["bcd"].decoded, "1234");
    }

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }
}
