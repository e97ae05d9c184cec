//! Cryptographic primitives for MTProto 2.0.
//!
//! - AES-256-IGE and AES-256-CTR ([`aes`])
//! - `sha1!` / `sha256!` over concatenated slices
//! - Pollard-rho `pq` factorization
//! - RSA_PAD and key fingerprints ([`rsa`])
//! - [`AuthKey`] and message encryption in both directions
//! - Obfuscated2 key setup ([`obfuscation`])

#![deny(unsafe_code)]

pub mod aes;
mod auth_key;
mod factorize;
mod hash;
pub mod obfuscation;
pub mod rsa;

use std::fmt;

pub use auth_key::AuthKey;
pub use factorize::factorize;

#[doc(hidden)]
pub mod __private {
    pub use sha1;
    pub use sha2;
}

/// Fill an array from the operating system's RNG.
///
/// # Panics
///
/// If the platform has no usable entropy source.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).expect("system RNG unavailable");
    buf
}

/// Why an encrypted message was rejected.
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// Shorter than a header plus one block, or not block-aligned.
    InvalidBuffer,
    /// The message names a different `auth_key_id`.
    AuthKeyMismatch,
    /// The recomputed `msg_key` differs: the ciphertext was altered or
    /// encrypted under another key.
    IntegrityFailure,
}

impl fmt::Display for DecryptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBuffer => write!(f, "invalid ciphertext length"),
            Self::AuthKeyMismatch => write!(f, "auth_key_id mismatch"),
            Self::IntegrityFailure => write!(f, "msg_key mismatch"),
        }
    }
}

impl std::error::Error for DecryptError {}

/// Which peer produced a message. Selects the `x` offset into the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn x(self) -> usize {
        match self {
            Self::Client => 0,
            Self::Server => 8,
        }
    }
}

fn msg_key_for(auth_key: &AuthKey, side: Side, plaintext: &[u8]) -> [u8; 16] {
    let x = side.x();
    let large = sha256!(&auth_key.data[88 + x..120 + x], plaintext);
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&large[8..24]);
    msg_key
}

fn calc_key(auth_key: &AuthKey, msg_key: &[u8; 16], side: Side) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let sha_a = sha256!(msg_key, &auth_key.data[x..x + 36]);
    let sha_b = sha256!(&auth_key.data[40 + x..76 + x], msg_key);

    let mut aes_key = [0u8; 32];
    aes_key[..8].copy_from_slice(&sha_a[..8]);
    aes_key[8..24].copy_from_slice(&sha_b[8..24]);
    aes_key[24..].copy_from_slice(&sha_a[24..]);

    let mut aes_iv = [0u8; 32];
    aes_iv[..8].copy_from_slice(&sha_b[..8]);
    aes_iv[8..24].copy_from_slice(&sha_a[8..24]);
    aes_iv[24..].copy_from_slice(&sha_b[24..]);

    (aes_key, aes_iv)
}

/// Longest padding [`padding_len`] can return.
pub const MAX_PADDING: usize = 27 + 16 * 15;

/// Padding length for a `len`-byte plaintext: at least 12 bytes, the total
/// a multiple of 16, plus `extra_blocks` (0..16) whole blocks.
pub fn padding_len(len: usize, extra_blocks: u8) -> usize {
    let base = 12 + (16 - (len + 12) % 16) % 16;
    base + 16 * usize::from(extra_blocks % 16)
}

/// Encrypt `plaintext` with random padding of random length.
///
/// Returns `auth_key_id || msg_key || ciphertext`.
pub fn encrypt_data_v2(plaintext: &[u8], auth_key: &AuthKey, side: Side) -> Vec<u8> {
    let rnd: [u8; 1 + MAX_PADDING] = random_bytes();
    let pad = padding_len(plaintext.len(), rnd[0]);
    encrypt_data_v2_with_padding(plaintext, &rnd[1..=pad], auth_key, side)
}

/// Deterministic core of [`encrypt_data_v2`]; `padding` must be 12..=1024
/// bytes and bring the total to a multiple of 16.
pub fn encrypt_data_v2_with_padding(plaintext: &[u8], padding: &[u8], auth_key: &AuthKey, side: Side) -> Vec<u8> {
    debug_assert!((12..=1024).contains(&padding.len()));
    debug_assert_eq!((plaintext.len() + padding.len()) % 16, 0);

    let mut out = Vec::with_capacity(24 + plaintext.len() + padding.len());
    out.extend_from_slice(&auth_key.key_id());
    out.extend_from_slice(&[0; 16]);
    out.extend_from_slice(plaintext);
    out.extend_from_slice(padding);

    let msg_key = msg_key_for(auth_key, side, &out[24..]);
    let (key, iv) = calc_key(auth_key, &msg_key, side);
    aes::ige_encrypt(&mut out[24..], &key, &iv);
    out[8..24].copy_from_slice(&msg_key);
    out
}

/// Decrypt `auth_key_id || msg_key || ciphertext` produced by `side`.
///
/// The message key is always recomputed over the decrypted plaintext; the
/// returned buffer still carries its padding.
pub fn decrypt_data_v2(buffer: &[u8], auth_key: &AuthKey, side: Side) -> Result<Vec<u8>, DecryptError> {
    if buffer.len() < 24 + 16 || (buffer.len() - 24) % 16 != 0 {
        return Err(DecryptError::InvalidBuffer);
    }
    if auth_key.key_id() != buffer[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&buffer[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, side);
    let mut plaintext = buffer[24..].to_vec();
    aes::ige_decrypt(&mut plaintext, &key, &iv);

    if msg_key_for(auth_key, side, &plaintext) != msg_key {
        return Err(DecryptError::IntegrityFailure);
    }
    Ok(plaintext)
}

/// `(key, iv)` for the encrypted parts of the DH exchange.
pub fn nonce_key_iv(server_nonce: &[u8; 16], new_nonce: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let h1 = sha1!(new_nonce, server_nonce);
    let h2 = sha1!(server_nonce, new_nonce);
    let h3 = sha1!(new_nonce, new_nonce);

    let mut key = [0u8; 32];
    key[..20].copy_from_slice(&h1);
    key[20..].copy_from_slice(&h2[..12]);

    let mut iv = [0u8; 32];
    iv[..8].copy_from_slice(&h2[12..]);
    iv[8..28].copy_from_slice(&h3);
    iv[28..].copy_from_slice(&new_nonce[..4]);

    (key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AuthKey {
        AuthKey::from_bytes(std::array::from_fn(|i| ((i * 7 + 3) % 256) as u8))
    }

    #[test]
    fn padding_bounds() {
        for len in 0..64 {
            for extra in [0u8, 7, 15, 255] {
                let pad = padding_len(len, extra);
                assert!((12..=MAX_PADDING).contains(&pad));
                assert_eq!((len + pad) % 16, 0);
            }
        }
    }

    #[test]
    fn known_client_vector() {
        let plaintext: Vec<u8> = (100..140).collect();
        let padding: Vec<u8> = (200..224).collect();
        let out = encrypt_data_v2_with_padding(&plaintext, &padding, &key(), Side::Client);
        assert_eq!(
            hex::encode(&out),
            "9ed6e6ef196cc93193c6532c8f618c46a79a1c4ad2fff5c671f48cb00e0300be\
             5d21850976bd88baba3bccfa651d39e9eb944d30e0f3505e881b2aafb8a60cc2\
             b72334966f143abaa5c755c113da84bd9f93d8b150e025ae"
        );
        let back = decrypt_data_v2(&out, &key(), Side::Client).unwrap();
        assert_eq!(&back[..40], plaintext.as_slice());
    }

    #[test]
    fn random_padding_fits_every_length() {
        let key = key();
        for len in 0..64 {
            let plaintext = vec![0x5a; len];
            for _ in 0..300 {
                let out = encrypt_data_v2(&plaintext, &key, Side::Client);
                assert_eq!((out.len() - 24) % 16, 0);
                assert!(out.len() - 24 - len <= MAX_PADDING);
                let back = decrypt_data_v2(&out, &key, Side::Client).unwrap();
                assert_eq!(&back[..len], plaintext.as_slice());
            }
        }
    }

    #[test]
    fn direction_matters() {
        let out = encrypt_data_v2(b"0123456789abcdef", &key(), Side::Client);
        assert_eq!(decrypt_data_v2(&out, &key(), Side::Server), Err(DecryptError::IntegrityFailure));
    }
}
