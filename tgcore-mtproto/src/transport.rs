//! Transport framing, independent of any I/O.
//!
//! A [`FrameCodec`] turns payloads into wire bytes and accumulated wire
//! bytes back into payloads. Feed it whatever the socket produced with
//! [`FrameCodec::push_inbound`] and drain frames with
//! [`FrameCodec::next_frame`].
//!
//! | Framing        | Init bytes     | Frame                                   |
//! |----------------|----------------|-----------------------------------------|
//! | Abridged       | `0xef`         | `len/4` (1 byte, or `0x7f` + 3) payload |
//! | Intermediate   | `0xeeeeeeee`   | `len` (4 bytes LE) payload              |
//! | Full           | none           | `len` `seq` payload `crc32`             |
//!
//! Abridged and Intermediate may be wrapped in Obfuscated2: a 64-byte
//! header followed by AES-256-CTR in both directions.

use std::fmt;

use tgcore_crypto::obfuscation::{ObfuscatedCipher, build_header};
use tgcore_crypto::random_bytes;
use tgcore_tl::schema::crc32;

/// Frames larger than this are treated as corrupt.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const ABRIDGED_TAG: [u8; 4] = [0xef; 4];
const INTERMEDIATE_TAG: [u8; 4] = [0xee; 4];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Framing {
    #[default]
    Abridged,
    Intermediate,
    Full,
}

impl Framing {
    fn tag(self) -> Option<[u8; 4]> {
        match self {
            Self::Abridged => Some(ABRIDGED_TAG),
            Self::Intermediate => Some(INTERMEDIATE_TAG),
            Self::Full => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameError {
    /// The server sent a bare negative code instead of a message,
    /// e.g. -404 when it does not know the auth key.
    Transport(i32),
    TooLarge { len: usize },
    BadLength { len: usize },
    BadChecksum { expected: u32, got: u32 },
    BadSequence { expected: u32, got: u32 },
    /// Full framing cannot be obfuscated.
    Unsupported,
    /// The first bytes of a stream match no known framing.
    UnknownProtocol,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(code) => write!(f, "transport error {code}"),
            Self::TooLarge { len } => write!(f, "frame of {len} bytes exceeds the limit"),
            Self::BadLength { len } => write!(f, "invalid frame length {len}"),
            Self::BadChecksum { expected, got } => {
                write!(f, "frame crc32 mismatch: expected {expected:#010x}, got {got:#010x}")
            }
            Self::BadSequence { expected, got } => write!(f, "frame seq {got}, expected {expected}"),
            Self::Unsupported => write!(f, "full transport cannot be obfuscated"),
            Self::UnknownProtocol => write!(f, "unrecognised transport prefix"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Stateful encoder/decoder for one connection direction pair.
pub struct FrameCodec {
    framing: Framing,
    cipher: Option<ObfuscatedCipher>,
    init: Vec<u8>,
    rx: Vec<u8>,
    send_seq: u32,
    recv_seq: u32,
}

impl FrameCodec {
    /// Client codec without obfuscation.
    pub fn plain(framing: Framing) -> Self {
        let init = match framing {
            Framing::Abridged => vec![0xef],
            Framing::Intermediate => INTERMEDIATE_TAG.to_vec(),
            Framing::Full => Vec::new(),
        };
        Self::with_parts(framing, None, init)
    }

    /// Client codec wrapped in Obfuscated2, optionally keyed with a proxy
    /// secret.
    pub fn obfuscated(framing: Framing, secret: Option<&[u8; 16]>, dc_id: i16) -> Result<Self, FrameError> {
        let tag = framing.tag().ok_or(FrameError::Unsupported)?;
        let header = build_header(random_bytes(), tag, dc_id, |h| *h = random_bytes());
        let (cipher, wire) = ObfuscatedCipher::client(&header, secret);
        Ok(Self::with_parts(framing, Some(cipher), wire.to_vec()))
    }

    /// Server side: detect the framing from the first bytes a client sent.
    /// Returns `Ok(None)` until enough bytes have arrived, otherwise the
    /// codec and how many bytes of `prefix` the handshake used.
    pub fn accept(prefix: &[u8], secret: Option<&[u8; 16]>) -> Result<Option<(Self, usize)>, FrameError> {
        match prefix {
            [] => Ok(None),
            [0xef, ..] => Ok(Some((Self::with_parts(Framing::Abridged, None, Vec::new()), 1))),
            [0xee, 0xee, 0xee, 0xee, ..] => {
                Ok(Some((Self::with_parts(Framing::Intermediate, None, Vec::new()), 4)))
            }
            _ if prefix.len() < 8 => Ok(None),
            // A Full frame's sequence word starts at zero; obfuscated
            // headers never have zeros there.
            _ if prefix[4..8] == [0; 4] => Ok(Some((Self::with_parts(Framing::Full, None, Vec::new()), 0))),
            _ if prefix.len() < 64 => Ok(None),
            _ => {
                let mut wire = [0u8; 64];
                wire.copy_from_slice(&prefix[..64]);
                let (cipher, tag) = ObfuscatedCipher::server(&wire, secret);
                let framing = match tag {
                    ABRIDGED_TAG => Framing::Abridged,
                    INTERMEDIATE_TAG => Framing::Intermediate,
                    _ => return Err(FrameError::UnknownProtocol),
                };
                Ok(Some((Self::with_parts(framing, Some(cipher), Vec::new()), 64)))
            }
        }
    }

    fn with_parts(framing: Framing, cipher: Option<ObfuscatedCipher>, init: Vec<u8>) -> Self {
        Self { framing, cipher, init, rx: Vec::new(), send_seq: 0, recv_seq: 0 }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn is_obfuscated(&self) -> bool {
        self.cipher.is_some()
    }

    /// Frame `payload` for the wire. The first call also carries the
    /// connection preamble.
    pub fn encode(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.init);
        let start = out.len();
        match self.framing {
            Framing::Abridged => {
                let words = payload.len() / 4;
                if words < 0x7f {
                    out.push(words as u8);
                } else {
                    out.push(0x7f);
                    out.extend_from_slice(&(words as u32).to_le_bytes()[..3]);
                }
                out.extend_from_slice(payload);
            }
            Framing::Intermediate => {
                out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                out.extend_from_slice(payload);
            }
            Framing::Full => {
                let total = (payload.len() + 12) as u32;
                out.extend_from_slice(&total.to_le_bytes());
                out.extend_from_slice(&self.send_seq.to_le_bytes());
                out.extend_from_slice(payload);
                let crc = crc32(&out[start..]);
                out.extend_from_slice(&crc.to_le_bytes());
                self.send_seq = self.send_seq.wrapping_add(1);
            }
        }
        if let Some(cipher) = &mut self.cipher {
            cipher.encrypt(&mut out[start..]);
        }
        out
    }

    /// Append bytes read from the socket.
    pub fn push_inbound(&mut self, data: &[u8]) {
        let start = self.rx.len();
        self.rx.extend_from_slice(data);
        if let Some(cipher) = &mut self.cipher {
            cipher.decrypt(&mut self.rx[start..]);
        }
    }

    /// Bytes received but not yet consumed by a frame.
    pub fn buffered(&self) -> usize {
        self.rx.len()
    }

    /// Pop the next complete payload, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some((header, len)) = self.peek_header()? else {
            return Ok(None);
        };
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge { len });
        }
        let trailer = if self.framing == Framing::Full { 4 } else { 0 };
        if self.rx.len() < header + len + trailer {
            return Ok(None);
        }

        let frame: Vec<u8> = self.rx.drain(..header + len + trailer).collect();
        if self.framing == Framing::Full {
            let body_end = header + len;
            let got = u32::from_le_bytes([frame[body_end], frame[body_end + 1], frame[body_end + 2], frame[body_end + 3]]);
            let expected = crc32(&frame[..body_end]);
            if got != expected {
                return Err(FrameError::BadChecksum { expected, got });
            }
            let seq = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
            if seq != self.recv_seq {
                return Err(FrameError::BadSequence { expected: self.recv_seq, got: seq });
            }
            self.recv_seq = self.recv_seq.wrapping_add(1);
        }

        let payload = frame[header..header + len].to_vec();
        if payload.len() == 4 {
            let code = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            if code < 0 {
                return Err(FrameError::Transport(code));
            }
        }
        Ok(Some(payload))
    }

    /// `(header length, payload length)` of the frame at the buffer head.
    fn peek_header(&self) -> Result<Option<(usize, usize)>, FrameError> {
        let rx = &self.rx;
        match self.framing {
            Framing::Abridged => {
                let Some(&first) = rx.first() else { return Ok(None) };
                match first {
                    0..0x7f => Ok(Some((1, usize::from(first) * 4))),
                    0x7f if rx.len() >= 4 => {
                        let words = u32::from_le_bytes([rx[1], rx[2], rx[3], 0]) as usize;
                        Ok(Some((4, words * 4)))
                    }
                    0x7f => Ok(None),
                    _ => Err(FrameError::BadLength { len: usize::from(first) }),
                }
            }
            Framing::Intermediate => {
                if rx.len() < 4 {
                    return Ok(None);
                }
                let len = u32::from_le_bytes([rx[0], rx[1], rx[2], rx[3]]) as usize;
                if len % 4 != 0 {
                    return Err(FrameError::BadLength { len });
                }
                Ok(Some((4, len)))
            }
            Framing::Full => {
                if rx.len() < 8 {
                    return Ok(None);
                }
                let total = u32::from_le_bytes([rx[0], rx[1], rx[2], rx[3]]) as usize;
                if total < 12 || total % 4 != 0 {
                    return Err(FrameError::BadLength { len: total });
                }
                Ok(Some((8, total - 12)))
            }
        }
    }
}

impl fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("framing", &self.framing)
            .field("obfuscated", &self.cipher.is_some())
            .field("buffered", &self.rx.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Push the client's bytes through a server codec and back.
    fn exchange(mut client: FrameCodec, payloads: &[Vec<u8>]) {
        let mut wire = Vec::new();
        for p in payloads {
            wire.extend(client.encode(p));
        }
        let (mut server, used) = FrameCodec::accept(&wire, None).unwrap().unwrap();
        assert_eq!(server.framing(), client.framing());
        server.push_inbound(&wire[used..]);
        for p in payloads {
            assert_eq!(server.next_frame().unwrap().as_ref(), Some(p));
        }
        assert_eq!(server.next_frame().unwrap(), None);

        for p in payloads {
            let reply = server.encode(p);
            client.push_inbound(&reply);
            assert_eq!(client.next_frame().unwrap().as_ref(), Some(p));
        }
    }

    fn payloads() -> Vec<Vec<u8>> {
        vec![vec![1; 8], vec![2; 0x7f * 4], vec![3; 4096]]
    }

    #[test]
    fn abridged_lengths() {
        let mut codec = FrameCodec::plain(Framing::Abridged);
        assert_eq!(codec.encode(&[0; 8])[..2], [0xef, 2]);
        assert_eq!(codec.encode(&[0; 0x7f * 4])[..4], [0x7f, 0x7f, 0, 0]);
    }

    #[test]
    fn every_framing_round_trips() {
        exchange(FrameCodec::plain(Framing::Abridged), &payloads());
        exchange(FrameCodec::plain(Framing::Intermediate), &payloads());
        exchange(FrameCodec::plain(Framing::Full), &payloads());
        exchange(FrameCodec::obfuscated(Framing::Abridged, None, 2).unwrap(), &payloads());
        exchange(FrameCodec::obfuscated(Framing::Intermediate, None, -2).unwrap(), &payloads());
    }

    #[test]
    fn partial_input_waits_for_more() {
        let mut client = FrameCodec::plain(Framing::Intermediate);
        let wire = client.encode(&[5; 16]);
        let (mut server, used) = FrameCodec::accept(&wire, None).unwrap().unwrap();
        server.push_inbound(&wire[used..used + 10]);
        assert_eq!(server.next_frame().unwrap(), None);
        server.push_inbound(&wire[used + 10..]);
        assert_eq!(server.next_frame().unwrap(), Some(vec![5; 16]));
    }

    #[test]
    fn negative_code_is_a_transport_error() {
        let mut codec = FrameCodec::plain(Framing::Abridged);
        codec.push_inbound(&[1]);
        codec.push_inbound(&(-404i32).to_le_bytes());
        assert_eq!(codec.next_frame(), Err(FrameError::Transport(-404)));
    }

    #[test]
    fn full_frame_checks_crc() {
        let mut client = FrameCodec::plain(Framing::Full);
        let mut wire = client.encode(&[9; 8]);
        wire[10] ^= 1;
        let mut server = FrameCodec::accept(&wire, None).unwrap().unwrap().0;
        server.push_inbound(&wire);
        assert!(matches!(server.next_frame(), Err(FrameError::BadChecksum { .. })));
    }

    #[test]
    fn full_cannot_be_obfuscated() {
        assert!(matches!(FrameCodec::obfuscated(Framing::Full, None, 1), Err(FrameError::Unsupported)));
    }

    #[test]
    fn proxy_secret_must_match() {
        let secret = [7u8; 16];
        let mut client = FrameCodec::obfuscated(Framing::Intermediate, Some(&secret), 2).unwrap();
        let wire = client.encode(&[1; 4]);
        assert!(FrameCodec::accept(&wire, Some(&secret)).unwrap().is_some());
        assert!(matches!(FrameCodec::accept(&wire, None), Err(FrameError::UnknownProtocol)));
    }
}
