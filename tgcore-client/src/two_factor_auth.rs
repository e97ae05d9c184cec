//! SRP math for cloud-password (2FA) sign in.

use std::fmt;

use hmac::Hmac;
use num_bigint::{BigInt, Sign};
use num_traits::ops::euclid::Euclid;
use num_traits::{One, Zero};
use sha2::{Digest, Sha256, Sha512};
use tgcore_tl::{TlObject, TlValue};

const KDF_ALGO: &str = "passwordKdfAlgoSHA256SHA256PBKDF2HMACSHA512iter100000SHA256ModPow";
const PBKDF2_ROUNDS: u32 = 100_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SrpError {
    /// The account uses a key derivation this client does not implement.
    UnsupportedAlgorithm(String),
    /// The server's `g_b` is outside `(1, p - 1)`.
    BadServerValue,
    /// The account reports no password.
    NoPassword,
    Kdf,
}

impl fmt::Display for SrpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedAlgorithm(name) => write!(f, "unsupported password algorithm {name}"),
            Self::BadServerValue => write!(f, "server SRP value out of range"),
            Self::NoPassword => write!(f, "account has no cloud password"),
            Self::Kdf => write!(f, "password key derivation failed"),
        }
    }
}

impl std::error::Error for SrpError {}

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Sha256::new();
    for p in parts {
        h.update(p);
    }
    h.finalize().into()
}

fn sh(data: &[u8], salt: &[u8]) -> [u8; 32] {
    sha256(&[salt, data, salt])
}

fn ph1(password: &[u8], salt1: &[u8], salt2: &[u8]) -> [u8; 32] {
    sh(&sh(password, salt1), salt2)
}

/// The password-derived SRP exponent `x`.
pub fn password_hash(password: &[u8], salt1: &[u8], salt2: &[u8]) -> Result<[u8; 32], SrpError> {
    let hash1 = ph1(password, salt1, salt2);
    let mut dk = [0u8; 64];
    pbkdf2::pbkdf2::<Hmac<Sha512>>(&hash1, salt1, PBKDF2_ROUNDS, &mut dk).map_err(|_| SrpError::Kdf)?;
    Ok(sh(&dk, salt2))
}

pub(crate) fn pad256(data: &[u8]) -> [u8; 256] {
    let mut out = [0u8; 256];
    let data = &data[data.len().saturating_sub(256)..];
    out[256 - data.len()..].copy_from_slice(data);
    out
}

fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b)) {
        *o = x ^ y;
    }
    out
}

fn big(bytes: &[u8]) -> BigInt {
    BigInt::from_bytes_be(Sign::Plus, bytes)
}

/// Compute SRP `(M1, g_a)` from the server's parameters and a random `a`.
#[allow(clippy::too_many_arguments)]
pub fn calculate_2fa(
    salt1: &[u8],
    salt2: &[u8],
    p: &[u8],
    g: i32,
    g_b: &[u8],
    a: &[u8],
    password: impl AsRef<[u8]>,
) -> Result<([u8; 32], [u8; 256]), SrpError> {
    let big_p = big(p);
    let g_b = pad256(g_b);
    let a = pad256(a);
    let g_hash = pad256(&g.to_be_bytes());

    let big_g_b = big(&g_b);
    if big_g_b <= BigInt::one() || big_g_b >= &big_p - BigInt::one() {
        return Err(SrpError::BadServerValue);
    }
    let big_g = BigInt::from(g);
    let big_a = big(&a);

    let big_k = big(&sha256(&[p, &g_hash]));

    let g_a = pad256(&big_g.modpow(&big_a, &big_p).to_bytes_be().1);
    let big_u = big(&sha256(&[&g_a, &g_b]));

    let big_x = big(&password_hash(password.as_ref(), salt1, salt2)?);
    let big_v = big_g.modpow(&big_x, &big_p);
    let big_kv = (big_k * big_v) % &big_p;

    let big_t = (big_g_b - big_kv).rem_euclid(&big_p);
    if big_t.is_zero() {
        return Err(SrpError::BadServerValue);
    }
    let big_sa = big_t.modpow(&(big_a + big_u * big_x), &big_p);
    let k_a = sha256(&[&pad256(&big_sa.to_bytes_be().1)]);

    let p_xg = xor32(&sha256(&[p]), &sha256(&[&g_hash]));
    let m1 = sha256(&[&p_xg, &sha256(&[salt1]), &sha256(&[salt2]), &g_a, &g_b, &k_a]);
    Ok((m1, g_a))
}

/// Build `inputCheckPasswordSRP` for an `account.password` response.
pub(crate) fn check_password_input(account_password: &TlObject, password: &str) -> Result<TlObject, crate::InvocationError> {
    let algo = account_password.opt_object("current_algo").ok_or(SrpError::NoPassword)?;
    if algo.name() != KDF_ALGO {
        return Err(SrpError::UnsupportedAlgorithm(algo.name().to_owned()).into());
    }
    let srp_b = account_password.get("srp_B").and_then(TlValue::as_bytes).ok_or(SrpError::NoPassword)?;
    let srp_id = account_password.opt_long("srp_id").ok_or(SrpError::NoPassword)?;

    let mut a = [0u8; 256];
    getrandom::getrandom(&mut a)
        .map_err(|e| crate::InvocationError::Io(std::io::Error::other(e.to_string())))?;

    let (m1, g_a) = calculate_2fa(
        algo.bytes("salt1")?,
        algo.bytes("salt2")?,
        algo.bytes("p")?,
        algo.int("g")?,
        srp_b,
        &a,
        password,
    )?;

    Ok(TlObject::builder("inputCheckPasswordSRP")?
        .set("srp_id", srp_id)
        .set("A", g_a.to_vec())
        .set("M1", m1.to_vec())
        .build()?)
}

impl From<SrpError> for crate::InvocationError {
    fn from(e: SrpError) -> Self {
        Self::MalformedData(e.to_string())
    }
}
