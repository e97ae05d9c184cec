//! AES-256 in the two modes MTProto uses: IGE for messages and the key
//! exchange, CTR for the obfuscated transport.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};

/// AES-256-IGE encryption in place.
///
/// `iv[..16]` is the previous ciphertext block and `iv[16..]` the previous
/// plaintext block. `buffer.len()` must be a multiple of 16.
pub fn ige_encrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    assert_eq!(buffer.len() % 16, 0, "IGE input must be block-aligned");
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher: [u8; 16] = first_half(iv);
    let mut prev_plain: [u8; 16] = second_half(iv);

    for chunk in buffer.chunks_exact_mut(16) {
        let mut plain = [0u8; 16];
        plain.copy_from_slice(chunk);

        let mut block = xor16(&plain, &prev_cipher);
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
        let block = xor16(&block, &prev_plain);

        chunk.copy_from_slice(&block);
        prev_cipher = block;
        prev_plain = plain;
    }
}

/// AES-256-IGE decryption in place. Same layout rules as [`ige_encrypt`].
pub fn ige_decrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    assert_eq!(buffer.len() % 16, 0, "IGE input must be block-aligned");
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher: [u8; 16] = first_half(iv);
    let mut prev_plain: [u8; 16] = second_half(iv);

    for chunk in buffer.chunks_exact_mut(16) {
        let mut encrypted = [0u8; 16];
        encrypted.copy_from_slice(chunk);

        let mut block = xor16(&encrypted, &prev_plain);
        cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));
        let block = xor16(&block, &prev_cipher);

        chunk.copy_from_slice(&block);
        prev_cipher = encrypted;
        prev_plain = block;
    }
}

fn first_half(iv: &[u8; 32]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&iv[..16]);
    out
}

fn second_half(iv: &[u8; 32]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&iv[16..]);
    out
}

fn xor16(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    std::array::from_fn(|i| a[i] ^ b[i])
}

/// AES-256-CTR keystream with a 128-bit big-endian counter.
pub struct Ctr(ctr::Ctr128BE<Aes256>);

impl Ctr {
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Self {
        Self(ctr::Ctr128BE::<Aes256>::new(key.into(), iv.into()))
    }

    /// XOR `data` with the next bytes of the keystream.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}
