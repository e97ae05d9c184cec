//! Obfuscated2 stream cipher setup.
//!
//! The client opens with 64 bytes: 56 random bytes in the clear followed by
//! an encrypted protocol tag and DC id. Both directions then run AES-256-CTR
//! with keys cut from that header (the receive key from its reversed middle).

use crate::aes::Ctr;
use crate::sha256;

/// Values the first word of the header must avoid so the stream is not
/// mistaken for another protocol.
const RESERVED_FIRST_WORDS: [[u8; 4]; 7] = [
    *b"HEAD",
    *b"POST",
    *b"GET ",
    *b"OPTI",
    [0x16, 0x03, 0x01, 0x02],
    [0xdd; 4],
    [0xee; 4],
];

/// Build a 64-byte header from `random`, rerolling reserved prefixes with
/// `reroll`. `tag` lands at bytes 56..60 and `dc_id` at 60..62.
pub fn build_header(
    mut random: [u8; 64],
    tag: [u8; 4],
    dc_id: i16,
    mut reroll: impl FnMut(&mut [u8; 64]),
) -> [u8; 64] {
    loop {
        let first: [u8; 4] = [random[0], random[1], random[2], random[3]];
        let acceptable = random[0] != 0xef
            && !RESERVED_FIRST_WORDS.contains(&first)
            && random[4..8] != [0; 4];
        if acceptable {
            break;
        }
        reroll(&mut random);
    }
    random[56..60].copy_from_slice(&tag);
    random[60..62].copy_from_slice(&dc_id.to_le_bytes());
    random
}

fn derive(key: &[u8], iv: &[u8], secret: Option<&[u8; 16]>) -> Ctr {
    let key: [u8; 32] = match secret {
        Some(secret) => sha256!(key, secret),
        None => {
            let mut out = [0u8; 32];
            out.copy_from_slice(key);
            out
        }
    };
    let mut ctr_iv = [0u8; 16];
    ctr_iv.copy_from_slice(iv);
    Ctr::new(&key, &ctr_iv)
}

/// `(forward, backward)`: the forward stream is keyed by `header[8..56]`,
/// the backward stream by the same bytes reversed.
fn streams(header: &[u8; 64], secret: Option<&[u8; 16]>) -> (Ctr, Ctr) {
    let forward = derive(&header[8..40], &header[40..56], secret);
    let mut reversed = [0u8; 48];
    reversed.copy_from_slice(&header[8..56]);
    reversed.reverse();
    let backward = derive(&reversed[..32], &reversed[32..], secret);
    (forward, backward)
}

/// Both directions of an obfuscated connection.
pub struct ObfuscatedCipher {
    tx: Ctr,
    rx: Ctr,
}

impl ObfuscatedCipher {
    /// Client side. Returns the cipher and the header to put on the wire.
    pub fn client(header: &[u8; 64], secret: Option<&[u8; 16]>) -> (Self, [u8; 64]) {
        let (mut tx, rx) = streams(header, secret);
        let mut encrypted = *header;
        tx.apply(&mut encrypted);
        let mut wire = *header;
        wire[56..].copy_from_slice(&encrypted[56..]);
        (Self { tx, rx }, wire)
    }

    /// Server side, from the header as received. Returns the cipher and the
    /// decrypted protocol tag.
    pub fn server(wire: &[u8; 64], secret: Option<&[u8; 16]>) -> (Self, [u8; 4]) {
        let (mut rx, tx) = streams(wire, secret);
        let mut plain = *wire;
        rx.apply(&mut plain);
        let tag = [plain[56], plain[57], plain[58], plain[59]];
        (Self { tx, rx }, tag)
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.tx.apply(data);
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.rx.apply(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> [u8; 64] {
        build_header(std::array::from_fn(|i| (i * 13 + 1) as u8), [0xee; 4], 2, |_| unreachable!())
    }

    #[test]
    fn reserved_prefix_is_rerolled() {
        let mut random = [1u8; 64];
        random[..4].copy_from_slice(b"POST");
        let mut rolls = 0;
        let h = build_header(random, [0xef; 4], -2, |r| {
            rolls += 1;
            r[0] = 0x42;
        });
        assert_eq!(rolls, 1);
        assert_eq!(h[0], 0x42);
        assert_eq!(&h[60..62], &(-2i16).to_le_bytes());
    }

    #[test]
    fn both_ends_agree() {
        for secret in [None, Some(&[3u8; 16])] {
            let (mut client, wire) = ObfuscatedCipher::client(&header(), secret);
            assert_eq!(&wire[..56], &header()[..56]);
            let (mut server, tag) = ObfuscatedCipher::server(&wire, secret);
            assert_eq!(tag, [0xee; 4]);

            let mut up = *b"ping from client";
            client.encrypt(&mut up);
            server.decrypt(&mut up);
            assert_eq!(&up, b"ping from client");

            let mut down = *b"pong from server";
            server.encrypt(&mut down);
            client.decrypt(&mut down);
            assert_eq!(&down, b"pong from server");
        }
    }
}
