//! Unencrypted messages, used only for the key exchange.
//!
//! Layout: `auth_key_id = 0 (8) | msg_id (8) | len (4) | body`.

use std::fmt;

use tgcore_tl::Serializable;

#[derive(Clone, Debug, PartialEq)]
pub enum PlainError {
    TooShort { len: usize },
    /// The frame carries a non-zero `auth_key_id`.
    Encrypted { auth_key_id: i64 },
    BadLength { declared: i32, available: usize },
}

impl fmt::Display for PlainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len } => write!(f, "plain message of {len} bytes is too short"),
            Self::Encrypted { auth_key_id } => {
                write!(f, "expected a plain message, got auth_key_id {auth_key_id}")
            }
            Self::BadLength { declared, available } => {
                write!(f, "plain message declares {declared} bytes, {available} available")
            }
        }
    }
}

impl std::error::Error for PlainError {}

pub fn pack(msg_id: i64, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20 + body.len());
    0i64.serialize(&mut buf);
    msg_id.serialize(&mut buf);
    (body.len() as i32).serialize(&mut buf);
    buf.extend_from_slice(body);
    buf
}

/// Split a plain message into `(msg_id, body)`.
pub fn unpack(frame: &[u8]) -> Result<(i64, &[u8]), PlainError> {
    if frame.len() < 20 {
        return Err(PlainError::TooShort { len: frame.len() });
    }
    let word = |range: std::ops::Range<usize>| {
        let mut b = [0u8; 8];
        b[..range.len()].copy_from_slice(&frame[range]);
        i64::from_le_bytes(b)
    };
    let auth_key_id = word(0..8);
    if auth_key_id != 0 {
        return Err(PlainError::Encrypted { auth_key_id });
    }
    let msg_id = word(8..16);
    let declared = i32::from_le_bytes([frame[16], frame[17], frame[18], frame[19]]);
    let available = frame.len() - 20;
    match usize::try_from(declared) {
        Ok(len) if len <= available => Ok((msg_id, &frame[20..20 + len])),
        _ => Err(PlainError::BadLength { declared, available }),
    }
}
