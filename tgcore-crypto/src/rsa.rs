//! RSA public keys, fingerprints and the RSA_PAD scheme of the key exchange.

use std::fmt;

use num_bigint::BigUint;
use tgcore_tl::Serializable;

use crate::{aes, sha1, sha256};

/// Decimal modulus of the production key (fingerprint `-3414540481677951611`).
pub const PRODUCTION_KEY_N: &str = "29379598170669337022986177149456128565388431120058863768162556424047512191330847455146576344487764408661701890505066208632169112269581063774293102577308490531282748465986139880977280302242772832972539403531316010870401287642763009136156734339538042419388722777357134487746169093539093850251243897188928735903389451772730245253062963384108812842079887538976360465290946139638691491496062099570836476454855996319192747663615955633778034897140982517446405334423701359108810182097749467210509584293428076654573384828809574217079944388301239431309115013843331317877374435868468779972014486325557807783825502498215169806323";

/// Decimal modulus of the test-DC key (fingerprint `-5595554452916591101`).
pub const TEST_KEY_N: &str = "25342889448840415564971689590713473206898847759084779052582026594546022463853940585885215951168491965708222649399180603818074200620463776135424884632162512403163793083921641631564740959529419359595852941166848940585952337613333022396096584117954892216031229237302943701877588456738335398602461675225081791820393153757504952636234951323237820036543581047826906120927972487366805292115792231423684261262330394324750785450942589751755390156647751460719351439969059949569615302809050721500330239005077889855323917509948255722081644689442127297605422579707142646660768825302832201908302295573257427896031830742328565032949";

pub const DEFAULT_EXPONENT: &str = "65537";

/// Largest payload [`encrypt_hashed`] accepts.
pub const MAX_PAYLOAD: usize = 144;

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    DataTooLarge { len: usize },
    InvalidKey,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataTooLarge { len } => write!(f, "{len} bytes exceed the {MAX_PAYLOAD}-byte RSA_PAD limit"),
            Self::InvalidKey => write!(f, "RSA key is not 2048 bits"),
        }
    }
}

impl std::error::Error for Error {}

/// An RSA public key `(n, e)`.
#[derive(Clone, PartialEq, Eq)]
pub struct Key {
    n: BigUint,
    e: BigUint,
}

impl Key {
    /// Parse decimal `n` and `e`.
    pub fn new(n: &str, e: &str) -> Option<Self> {
        Some(Self {
            n: BigUint::parse_bytes(n.as_bytes(), 10)?,
            e: BigUint::parse_bytes(e.as_bytes(), 10)?,
        })
    }

    pub fn from_components(n: BigUint, e: BigUint) -> Self {
        Self { n, e }
    }

    /// The pinned production key.
    pub fn production() -> Self {
        Self::from_components(parse_decimal(PRODUCTION_KEY_N), BigUint::from(65537u32))
    }

    /// The key of Telegram's test datacenters.
    pub fn test_dc() -> Self {
        Self::from_components(parse_decimal(TEST_KEY_N), BigUint::from(65537u32))
    }

    pub fn modulus(&self) -> &BigUint {
        &self.n
    }

    /// `SHA1(bytes(n) || bytes(e))[12..20]` as a little-endian integer,
    /// where `bytes` is the TL encoding of the big-endian value.
    pub fn fingerprint(&self) -> i64 {
        let n = self.n.to_bytes_be();
        let e = self.e.to_bytes_be();
        let sha = sha1!(n.to_bytes(), e.to_bytes());
        let mut out = [0u8; 8];
        out.copy_from_slice(&sha[12..20]);
        i64::from_le_bytes(out)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rsa::Key(fingerprint={})", self.fingerprint())
    }
}

fn parse_decimal(digits: &str) -> BigUint {
    digits
        .bytes()
        .fold(BigUint::default(), |acc, d| acc * 10u32 + u32::from(d - b'0'))
}

fn increment(data: &mut [u8]) {
    for byte in data.iter_mut().rev() {
        let (n, overflow) = byte.overflowing_add(1);
        *byte = n;
        if !overflow {
            break;
        }
    }
}

/// RSA_PAD: encrypt up to 144 bytes of `data` under `key`.
///
/// `random` supplies the 192-byte padding source (only the bytes past
/// `data.len()` are used) followed by the 32-byte temporary AES key.
pub fn encrypt_hashed(data: &[u8], key: &Key, random: &[u8; 224]) -> Result<Vec<u8>, Error> {
    if data.len() > MAX_PAYLOAD {
        return Err(Error::DataTooLarge { len: data.len() });
    }
    if key.n.bits() != 2048 {
        return Err(Error::InvalidKey);
    }

    let mut with_padding = Vec::with_capacity(192);
    with_padding.extend_from_slice(data);
    with_padding.extend_from_slice(&random[..192 - data.len()]);
    let reversed: Vec<u8> = with_padding.iter().rev().copied().collect();

    let mut temp_key = [0u8; 32];
    temp_key.copy_from_slice(&random[192..]);

    let payload = loop {
        let mut with_hash = Vec::with_capacity(224);
        with_hash.extend_from_slice(&reversed);
        with_hash.extend_from_slice(&sha256!(&temp_key, &with_padding));
        aes::ige_encrypt(&mut with_hash, &temp_key, &[0u8; 32]);

        let hash = sha256!(&with_hash);
        let mut candidate = Vec::with_capacity(256);
        candidate.extend(temp_key.iter().zip(hash).map(|(a, b)| a ^ b));
        candidate.extend_from_slice(&with_hash);

        let value = BigUint::from_bytes_be(&candidate);
        if value < key.n {
            break value;
        }
        increment(&mut temp_key);
    };

    Ok(left_pad(payload.modpow(&key.e, &key.n).to_bytes_be()))
}

fn left_pad(bytes: Vec<u8>) -> Vec<u8> {
    let mut out = vec![0u8; 256usize.saturating_sub(bytes.len())];
    out.extend(bytes);
    out
}

/// The private half of a key, for servers answering the key exchange.
pub struct PrivateKey {
    public: Key,
    d: BigUint,
}

impl PrivateKey {
    pub fn new(public: Key, d: BigUint) -> Self {
        Self { public, d }
    }

    pub fn public(&self) -> &Key {
        &self.public
    }

    /// Undo [`encrypt_hashed`]; `None` if the embedded hash does not match.
    /// Returns the 192-byte padded block, payload first.
    pub fn decrypt_hashed(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let value = BigUint::from_bytes_be(ciphertext).modpow(&self.d, &self.public.n);
        let block = left_pad(value.to_bytes_be());
        if block.len() != 256 {
            return None;
        }

        let mut with_hash = block[32..].to_vec();
        let hash = sha256!(&with_hash);
        let mut temp_key = [0u8; 32];
        for (i, byte) in temp_key.iter_mut().enumerate() {
            *byte = block[i] ^ hash[i];
        }
        aes::ige_decrypt(&mut with_hash, &temp_key, &[0u8; 32]);

        let with_padding: Vec<u8> = with_hash[..192].iter().rev().copied().collect();
        (sha256!(&temp_key, &with_padding) == with_hash[192..]).then_some(with_padding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_fingerprint() {
        assert_eq!(Key::production().fingerprint(), -3414540481677951611);
        assert_eq!(Key::new(PRODUCTION_KEY_N, DEFAULT_EXPONENT).unwrap(), Key::production());
    }

    #[test]
    fn test_dc_fingerprint() {
        assert_eq!(Key::test_dc().fingerprint(), -5595554452916591101);
    }

    #[test]
    fn oversized_payload() {
        let err = encrypt_hashed(&[0; 145], &Key::production(), &[0; 224]).unwrap_err();
        assert_eq!(err, Error::DataTooLarge { len: 145 });
    }

    #[test]
    fn output_is_one_block() {
        let out = encrypt_hashed(b"hello", &Key::production(), &[5; 224]).unwrap();
        assert_eq!(out.len(), 256);
    }
}
