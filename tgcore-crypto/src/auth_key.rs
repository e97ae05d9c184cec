use std::fmt;

use crate::sha1;

/// A 2048-bit authorization key with its derived identifiers.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; 256],
    aux_hash: [u8; 8],
    key_id: [u8; 8],
}

impl AuthKey {
    pub fn from_bytes(data: [u8; 256]) -> Self {
        let sha = sha1!(&data);
        let mut aux_hash = [0u8; 8];
        aux_hash.copy_from_slice(&sha[..8]);
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&sha[12..20]);
        Self { data, aux_hash, key_id }
    }

    /// `None` unless `bytes` is exactly 256 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self::from_bytes)
    }

    pub fn to_bytes(&self) -> [u8; 256] {
        self.data
    }

    /// `SHA1(key)[12..20]`, as it appears on the wire.
    pub fn key_id(&self) -> [u8; 8] {
        self.key_id
    }

    /// [`key_id`](Self::key_id) read as a little-endian integer.
    pub fn id(&self) -> i64 {
        i64::from_le_bytes(self.key_id)
    }

    /// `SHA1(new_nonce || number || aux_hash)[4..20]`, checked against the
    /// `dh_gen_ok` (1), `dh_gen_retry` (2) and `dh_gen_fail` (3) answers.
    pub fn calc_new_nonce_hash(&self, new_nonce: &[u8; 32], number: u8) -> [u8; 16] {
        let sha = sha1!(new_nonce, [number], self.aux_hash);
        let mut out = [0u8; 16];
        out.copy_from_slice(&sha[4..]);
        out
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthKey(id={:#018x})", self.id())
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for AuthKey {}
