//! XOR obfuscation analysis: decryption with a repeating or counter-mixed
//! key, known-plaintext key recovery, and coincidence-based key-length
//! detection. Used for links that obfuscate rather than properly encrypt
//! traffic, which is common on cheap BLE peripherals.

use std::collections::HashMap;

use crate::{byte_frequency, shannon_entropy, CryptoError};

/// Applies repeating-key XOR, optionally mixing in a per-byte counter.
/// XOR is its own inverse, so this same function both encrypts and
/// decrypts.
///
/// When `use_packet_counter` is set, byte `i` is XORed with
/// `key[i % key.len()] ^ ((counter_start + i) & 0xFF)` instead of the bare
/// key byte.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKeyLength`] for an empty key (`0` is
/// reported as the length) or an error describing an empty `ciphertext`.
pub fn xor_decrypt(
    key: &[u8],
    ciphertext: &[u8],
    counter_start: Option<u64>,
    use_packet_counter: bool,
) -> Result<Vec<u8>, CryptoError> {
    if key.is_empty() {
        return Err(CryptoError::EmptyXorKey);
    }
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }
    let counter_start = counter_start.unwrap_or(0);
    let out = ciphertext
        .iter()
        .enumerate()
        .map(|(i, &b)| {
            let key_byte = key[i % key.len()];
            if use_packet_counter {
                #[allow(clippy::cast_possible_truncation)]
                let mix = ((counter_start + i as u64) & 0xFF) as u8;
                b ^ key_byte ^ mix
            } else {
                b ^ key_byte
            }
        })
        .collect();
    Ok(out)
}

/// Decrypts a BLE PDU's payload with XOR, optionally skipping the
/// `header(1) ∥ length_le(2)` prefix. Returns `None` if the PDU is shorter
/// than the skipped prefix.
#[must_use]
pub fn xor_decrypt_packet(
    key: &[u8],
    pdu: &[u8],
    skip_header: bool,
    packet_counter: Option<u64>,
) -> Option<Vec<u8>> {
    let header_len = if skip_header { 3 } else { 0 };
    if pdu.len() < header_len {
        return None;
    }
    let payload = &pdu[header_len..];
    if payload.is_empty() {
        return Some(Vec::new());
    }
    xor_decrypt(key, payload, packet_counter, packet_counter.is_some()).ok()
}

/// Recovers `key_len` bytes of a repeating XOR key from `known_plaintext`
/// observed at `offset` in `ciphertext`. If `known_plaintext` is shorter
/// than `key_len`, there isn't enough data to recover the remaining key
/// bytes at all, so the known plaintext itself is tiled to fill out the
/// result instead of guessing at unseen key bytes.
#[must_use]
pub fn find_xor_key(ciphertext: &[u8], known_plaintext: &[u8], key_len: usize, offset: usize) -> Vec<u8> {
    if key_len == 0 || known_plaintext.is_empty() {
        return Vec::new();
    }
    let n = known_plaintext.len().min(ciphertext.len().saturating_sub(offset));
    if n == 0 {
        return Vec::new();
    }
    if n < key_len {
        return (0..key_len).map(|i| known_plaintext[i % known_plaintext.len()]).collect();
    }
    (0..n).map(|i| ciphertext[offset + i] ^ known_plaintext[i]).take(key_len).collect()
}

/// Report produced by [`analyze_xor_patterns`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct XorPatternReport {
    /// Candidate key lengths ranked by coincidence/repeat evidence, most
    /// likely first.
    pub likely_key_lengths: Vec<usize>,
    /// Byte value histogram over the whole ciphertext.
    pub byte_frequency: HashMap<u8, usize>,
    /// Shannon entropy of the ciphertext, in bits per byte.
    pub entropy: f64,
    /// For each candidate key length, how many repeating blocks of that
    /// period were observed.
    pub pattern_repeats: HashMap<usize, usize>,
}

/// Analyzes `ciphertext` for evidence of a repeating XOR key, up to
/// `max_key_len` bytes. Combines a coincidence-of-bytes score (how often
/// bytes `period` apart are equal — true plaintext/key repeats inflate
/// this versus a uniform distribution) with a literal block-repeat count.
#[must_use]
pub fn analyze_xor_patterns(ciphertext: &[u8], max_key_len: usize) -> XorPatternReport {
    let byte_frequency = byte_frequency(ciphertext);
    let entropy = shannon_entropy(ciphertext);
    let mut pattern_repeats = HashMap::new();
    let mut scores: Vec<(usize, f64)> = Vec::new();

    for period in 1..=max_key_len.max(1) {
        if period >= ciphertext.len() {
            break;
        }
        let mut matches = 0usize;
        let mut total = 0usize;
        for i in 0..ciphertext.len() - period {
            total += 1;
            if ciphertext[i] == ciphertext[i + period] {
                matches += 1;
            }
        }
        if total > 0 {
            #[allow(clippy::cast_precision_loss)]
            let score = matches as f64 / total as f64;
            scores.push((period, score));
        }

        let repeats = count_block_repeats(ciphertext, period);
        if repeats > 0 {
            pattern_repeats.insert(period, repeats);
        }
    }

    // Coincidence score for the true period is elevated above the ~1/256
    // baseline expected from unrelated bytes; rank candidates by score
    // descending, breaking ties toward the shorter period.
    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then(a.0.cmp(&b.0)));
    let baseline = 1.0 / 256.0;
    let likely_key_lengths = scores
        .into_iter()
        .filter(|&(_, score)| score > baseline * 2.0)
        .map(|(period, _)| period)
        .collect();

    XorPatternReport {
        likely_key_lengths,
        byte_frequency,
        entropy,
        pattern_repeats,
    }
}

/// Counts how many consecutive `period`-length blocks of `data` repeat
/// their predecessor exactly.
fn count_block_repeats(data: &[u8], period: usize) -> usize {
    if period == 0 || period > data.len() {
        return 0;
    }
    data.chunks(period)
        .collect::<Vec<_>>()
        .windows(2)
        .filter(|w| w[0].len() == w[1].len() && w[0] == w[1])
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_simple_xor() {
        let key = b"SECRET";
        let plaintext = b"Hello XOR World! This is a test message.";
        let ciphertext = xor_decrypt(key, plaintext, None, false).unwrap();
        let decrypted = xor_decrypt(key, &ciphertext, None, false).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn round_trip_counter_xor() {
        let key = b"SECRET";
        let plaintext = b"Hello XOR World! This is a test message.";
        let ciphertext = xor_decrypt(key, plaintext, Some(42), true).unwrap();
        let decrypted = xor_decrypt(key, &ciphertext, Some(42), true).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn empty_key_errors() {
        assert!(xor_decrypt(b"", b"test", None, false).is_err());
    }

    #[test]
    fn empty_ciphertext_errors() {
        assert!(xor_decrypt(b"key", b"", None, false).is_err());
    }

    #[test]
    fn find_key_exact_length() {
        let known_plain = b"SECRET";
        let key = b"KEY123";
        let dummy_prefix = b"ABCDEF";
        let mut plaintext = Vec::new();
        plaintext.extend_from_slice(dummy_prefix);
        plaintext.extend_from_slice(known_plain);
        plaintext.extend_from_slice(b"MORE DATA");

        let ciphertext: Vec<u8> = plaintext
            .iter()
            .enumerate()
            .map(|(i, &b)| b ^ key[i % key.len()])
            .collect();

        let recovered = find_xor_key(&ciphertext, known_plain, key.len(), dummy_prefix.len());
        assert_eq!(recovered, key);
    }

    #[test]
    fn find_key_tiles_short_known_plaintext() {
        let known_plain = b"HI";
        let key = b"LONGKEY";
        let ciphertext: Vec<u8> = known_plain
            .iter()
            .enumerate()
            .map(|(i, &b)| b ^ key[i % key.len()])
            .collect();

        let recovered = find_xor_key(&ciphertext, known_plain, key.len(), 0);
        assert_eq!(recovered, b"HIHIHIH");
    }

    #[test]
    fn analyze_detects_key_length() {
        let key = b"ABCD";
        let plaintext = b"This is a test message for pattern analysis".repeat(3);
        let ciphertext: Vec<u8> = plaintext
            .iter()
            .enumerate()
            .map(|(i, &b)| b ^ key[i % key.len()])
            .collect();

        let report = analyze_xor_patterns(&ciphertext, 10);
        assert!(report.likely_key_lengths.contains(&4));
        assert!(!report.byte_frequency.is_empty());
        assert!(report.entropy > 0.0);
        assert!(report.pattern_repeats.contains_key(&4));
    }
}
