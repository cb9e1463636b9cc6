//! BLE cryptographic toolbox: AES-CCM decryption aligned to the BLE nonce
//! construction ([Vol 6] Part C, Section 1), and XOR obfuscation analysis
//! for links where no session key is available.
//!
//! This crate never attempts to *encrypt* traffic for transmission; it only
//! recovers plaintext from captured ciphertext when the relevant key
//! material is already known to the caller.

#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::collections::HashMap;

use aes::Aes128;
use ccm::aead::consts::{U10, U12, U13, U14, U16, U4, U6, U8};
use ccm::aead::{Aead, Payload};
use ccm::{Ccm, KeyInit};
use thiserror::Error;
use zeroize::Zeroize;

mod xor;

pub use xor::{analyze_xor_patterns, find_xor_key, xor_decrypt, XorPatternReport};

/// 128-bit AES key used throughout this crate.
pub const KEY_LEN: usize = 16;
/// BLE CCM nonce length ([Vol 6] Part C, Section 1).
pub const NONCE_LEN: usize = 13;
/// Packet counter is 39 bits wide; the 40th bit and up are the IV's domain.
const MAX_PACKET_COUNTER: u64 = (1 << 39) - 1;

/// Errors produced by the crypto toolbox. Authentication failure is
/// deliberately *not* a variant here: it is reported as `Ok(None)` so
/// callers can distinguish "wrong call" from "not our traffic".
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum CryptoError {
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("nonce must be {NONCE_LEN} bytes, got {0}")]
    InvalidNonceLength(usize),
    #[error("invalid tag length {0}, must be one of 4, 6, 8, 10, 12, 14, 16")]
    InvalidTagLength(usize),
    #[error("IV must be 8 bytes, got {0}")]
    InvalidIvLength(usize),
    #[error("packet counter too large: {0} (must be < 2^39)")]
    PacketCounterTooLarge(u64),
    #[error("XOR key cannot be empty")]
    EmptyXorKey,
    #[error("ciphertext cannot be empty")]
    EmptyCiphertext,
}

/// Decrypts `ciphertext` (payload followed by a `tag_len`-byte MIC) using
/// AES-128-CCM with the given 13-byte BLE nonce and optional associated
/// data.
///
/// Returns `Ok(None)` on authentication failure (wrong key, corrupted
/// ciphertext, or a bit-flipped tag) rather than an error, since that is
/// an expected outcome when sniffing traffic the caller cannot decode.
///
/// # Errors
///
/// Returns [`CryptoError`] if `key`, `nonce`, or `tag_len` are malformed.
pub fn decrypt(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: Option<&[u8]>,
    tag_len: usize,
) -> Result<Option<Vec<u8>>, CryptoError> {
    let key: &[u8; KEY_LEN] = key
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    let nonce: &[u8; NONCE_LEN] = nonce
        .try_into()
        .map_err(|_| CryptoError::InvalidNonceLength(nonce.len()))?;
    let aad = aad.unwrap_or(&[]);
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    let plaintext = match tag_len {
        4 => Ccm::<Aes128, U4, U13>::new(key.into()).decrypt(nonce.into(), payload),
        6 => Ccm::<Aes128, U6, U13>::new(key.into()).decrypt(nonce.into(), payload),
        8 => Ccm::<Aes128, U8, U13>::new(key.into()).decrypt(nonce.into(), payload),
        10 => Ccm::<Aes128, U10, U13>::new(key.into()).decrypt(nonce.into(), payload),
        12 => Ccm::<Aes128, U12, U13>::new(key.into()).decrypt(nonce.into(), payload),
        14 => Ccm::<Aes128, U14, U13>::new(key.into()).decrypt(nonce.into(), payload),
        16 => Ccm::<Aes128, U16, U13>::new(key.into()).decrypt(nonce.into(), payload),
        _ => return Err(CryptoError::InvalidTagLength(tag_len)),
    };
    Ok(plaintext.ok())
}

/// Constructs the 13-byte BLE CCM nonce from an 8-byte IV and a 39-bit
/// packet counter, setting the directionality bit (bit 7 of byte 12) per
/// master-to-slave / slave-to-master framing ([Vol 6] Part C, Section 1).
///
/// # Errors
///
/// Returns [`CryptoError`] if `iv` is not 8 bytes or `counter` does not fit
/// in 39 bits.
pub fn construct_ble_nonce(
    iv: &[u8],
    counter: u64,
    is_master_to_slave: bool,
) -> Result<[u8; NONCE_LEN], CryptoError> {
    let iv: &[u8; 8] = iv.try_into().map_err(|_| CryptoError::InvalidIvLength(iv.len()))?;
    if counter > MAX_PACKET_COUNTER {
        return Err(CryptoError::PacketCounterTooLarge(counter));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(iv);
    let counter_le = counter.to_le_bytes();
    nonce[8..13].copy_from_slice(&counter_le[..5]);
    if is_master_to_slave {
        nonce[12] |= 0x80;
    } else {
        nonce[12] &= 0x7F;
    }
    Ok(nonce)
}

/// Splits an encrypted BLE data PDU into `(header, payload, mic)` per the
/// layout `header(1) ∥ length_le(2) ∥ ciphertext ∥ MIC(tag_len)`. Returns
/// `None` if `pdu` is too short for the declared `tag_len`; never panics.
#[must_use]
pub fn parse_encrypted_pdu(pdu: &[u8], tag_len: usize) -> Option<(&[u8], &[u8], &[u8])> {
    let min_len = 1 + 2 + tag_len;
    if pdu.len() < min_len {
        return None;
    }
    let header = &pdu[..1];
    let payload_len = pdu.len() - 3 - tag_len;
    let payload = &pdu[3..3 + payload_len];
    let mic = &pdu[pdu.len() - tag_len..];
    Some((header, payload, mic))
}

/// Decrypts a full BLE PDU: parses `header(1) ∥ length_le(2) ∥ ciphertext ∥
/// MIC(tag_len)`, builds the nonce from `iv` and `packet_counter`, and uses
/// `header ∥ length` as associated data.
///
/// # Errors
///
/// Returns [`CryptoError`] for malformed key/iv/counter/tag_len; returns
/// `Ok(None)` if the PDU is too short or authentication fails.
pub fn decrypt_ble_packet(
    key: &[u8],
    iv: &[u8],
    packet_counter: u64,
    pdu: &[u8],
    is_master_to_slave: bool,
    tag_len: usize,
) -> Result<Option<Vec<u8>>, CryptoError> {
    if parse_encrypted_pdu(pdu, tag_len).is_none() {
        return Ok(None);
    }
    let aad = &pdu[..3];
    let ciphertext_with_tag = &pdu[3..];
    let nonce = construct_ble_nonce(iv, packet_counter, is_master_to_slave)?;
    decrypt(key, &nonce, ciphertext_with_tag, Some(aad), tag_len)
}

/// Data-channel MIC length used throughout the Link Layer ([Vol 6] Part B,
/// Section 5.1.3): BLE data channel PDUs always carry a 4-byte MIC.
pub const DATA_CHANNEL_TAG_LEN: usize = 4;

/// BLE data-channel decryption helper: builds `IV = SKD_slave ∥ SKD_master`
/// and decrypts with no associated data, matching the Link Layer encryption
/// procedure ([Vol 6] Part B, Section 5.1.3 and Part C, Section 1).
///
/// # Errors
///
/// Returns [`CryptoError`] for malformed key/counter; `Ok(None)` on
/// authentication failure.
pub fn decrypt_data_channel(
    ltk: &[u8],
    skd_master: &[u8; 4],
    skd_slave: &[u8; 4],
    ciphertext_with_tag: &[u8],
    packet_counter: u64,
    is_master_to_slave: bool,
) -> Result<Option<Vec<u8>>, CryptoError> {
    let mut iv = [0u8; 8];
    iv[..4].copy_from_slice(skd_slave);
    iv[4..].copy_from_slice(skd_master);
    let nonce = construct_ble_nonce(&iv, packet_counter, is_master_to_slave)?;
    iv.zeroize();
    decrypt(ltk, &nonce, ciphertext_with_tag, None, DATA_CHANNEL_TAG_LEN)
}

/// Shannon entropy of a byte slice, in bits per byte (`0.0..=8.0`).
#[must_use]
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0u32; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = f64::from(c) / len;
            -p * p.log2()
        })
        .sum()
}

/// Byte frequency histogram, used by both the XOR analyzer and the
/// standalone pattern analyzer.
#[must_use]
pub fn byte_frequency(data: &[u8]) -> HashMap<u8, usize> {
    let mut freq = HashMap::new();
    for &b in data {
        *freq.entry(b).or_insert(0) += 1;
    }
    freq
}
