//! Sans-IO MTProto authorization key generation.
//!
//! # Flow
//!
//! ```text
//! let (req, s1) = authentication::step1()?;
//! // send req, receive resPQ
//! let (req, s2) = authentication::step2(s1, &resp, &trusted_keys)?;
//! // send req, receive Server_DH_Params
//! let (req, s3) = authentication::step3(s2, &resp)?;
//! // send req, receive Set_client_DH_params_answer
//! let done = authentication::finish(s3, &resp)?;
//! // done.auth_key is ready
//! ```
//!
//! Requests and responses are plain [`TlObject`]s; the caller wraps them in
//! unencrypted messages (see [`crate::plain`]).

use std::fmt;

use num_bigint::BigUint;
use num_traits::One;
use tgcore_crypto::{AuthKey, aes, factorize, nonce_key_iv, random_bytes, rsa, sha1};
use tgcore_tl::{Cursor, Registry, Serializable, TlObject};

use crate::message_id::unix_now;

/// Size of the DH prime the server must use.
pub const DH_PRIME_BITS: u64 = 2048;

/// Errors that can occur during auth key generation.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    InvalidNonce { got: [u8; 16], expected: [u8; 16] },
    InvalidPqSize { size: usize },
    /// `pq` could not be split into two factors.
    FactorizationFailed { pq: u64 },
    /// None of the offered fingerprints belongs to a trusted key.
    UntrustedServer { fingerprints: Vec<i64> },
    DhParamsFail,
    InvalidServerNonce { got: [u8; 16], expected: [u8; 16] },
    EncryptedResponseNotPadded { len: usize },
    InvalidDhInnerData { error: tgcore_tl::Error },
    /// A response did not have the expected shape.
    UnexpectedResponse { error: tgcore_tl::Error },
    InvalidGenerator { g: i32 },
    InvalidDhPrime { bits: u64 },
    GParameterOutOfRange { value: BigUint, low: BigUint, high: BigUint },
    DhGenRetry,
    DhGenFail,
    InvalidAnswerHash { got: [u8; 20], expected: [u8; 20] },
    InvalidNewNonceHash { got: [u8; 16], expected: [u8; 16] },
    Rsa(rsa::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNonce { got, expected } => {
                write!(f, "nonce mismatch: got {got:?}, expected {expected:?}")
            }
            Self::InvalidPqSize { size } => write!(f, "pq size {size} invalid (expected 8)"),
            Self::FactorizationFailed { pq } => write!(f, "could not factorize pq={pq}"),
            Self::UntrustedServer { fingerprints } => {
                write!(f, "no trusted key among fingerprints {fingerprints:?}")
            }
            Self::DhParamsFail => write!(f, "server returned DH params failure"),
            Self::InvalidServerNonce { got, expected } => {
                write!(f, "server_nonce mismatch: got {got:?}, expected {expected:?}")
            }
            Self::EncryptedResponseNotPadded { len } => {
                write!(f, "encrypted answer len {len} is not 16-byte aligned")
            }
            Self::InvalidDhInnerData { error } => write!(f, "DH inner data deserialization error: {error}"),
            Self::UnexpectedResponse { error } => write!(f, "unexpected handshake response: {error}"),
            Self::InvalidGenerator { g } => write!(f, "g={g} not in [2, 7]"),
            Self::InvalidDhPrime { bits } => write!(f, "dh_prime has {bits} bits, expected {DH_PRIME_BITS}"),
            Self::GParameterOutOfRange { value, low, high } => {
                write!(f, "g={value} not in range ({low}, {high})")
            }
            Self::DhGenRetry => write!(f, "DH gen retry requested"),
            Self::DhGenFail => write!(f, "DH gen failed"),
            Self::InvalidAnswerHash { got, expected } => {
                write!(f, "answer hash mismatch: got {got:?}, expected {expected:?}")
            }
            Self::InvalidNewNonceHash { got, expected } => {
                write!(f, "new nonce hash mismatch: got {got:?}, expected {expected:?}")
            }
            Self::Rsa(e) => write!(f, "RSA: {e}"),
        }
    }
}

impl From<rsa::Error> for Error {
    fn from(e: rsa::Error) -> Self {
        Self::Rsa(e)
    }
}

fn unexpected(error: tgcore_tl::Error) -> Error {
    Error::UnexpectedResponse { error }
}

/// State after step 1.
#[derive(Debug)]
pub struct Step1 {
    nonce: [u8; 16],
}

/// State after step 2.
#[derive(Debug)]
pub struct Step2 {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
}

/// State after step 3.
#[derive(Debug)]
pub struct Step3 {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
    gab: BigUint,
    time_offset: i32,
}

/// The final output of a successful auth key handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct Finished {
    pub auth_key: AuthKey,
    /// Server time minus local time, in seconds.
    pub time_offset: i32,
    /// `new_nonce[0..8] ^ server_nonce[0..8]`.
    pub first_salt: i64,
}

/// Generate a `req_pq_multi` request.
pub fn step1() -> Result<(TlObject, Step1), Error> {
    do_step1(&random_bytes())
}

/// [`step1`] with an explicit nonce.
pub fn do_step1(random: &[u8; 16]) -> Result<(TlObject, Step1), Error> {
    let nonce = *random;
    let request = TlObject::builder("req_pq_multi")
        .and_then(|b| b.set("nonce", nonce).build())
        .map_err(unexpected)?;
    Ok((request, Step1 { nonce }))
}

/// Process `resPQ` and generate `req_DH_params`, encrypting under the first
/// offered fingerprint found in `trusted`.
pub fn step2(data: Step1, response: &TlObject, trusted: &[rsa::Key]) -> Result<(TlObject, Step2), Error> {
    do_step2(data, response, trusted, &random_bytes())
}

/// [`step2`] with explicit randomness: 32 bytes of `new_nonce`, then the
/// 224 bytes RSA_PAD consumes.
pub fn do_step2(
    data: Step1,
    response: &TlObject,
    trusted: &[rsa::Key],
    random: &[u8; 256],
) -> Result<(TlObject, Step2), Error> {
    let Step1 { nonce } = data;
    expect_name(response, &["resPQ"])?;

    check_nonce(&response.int128("nonce").map_err(unexpected)?, &nonce)?;
    let server_nonce = response.int128("server_nonce").map_err(unexpected)?;

    let pq_bytes = response.bytes("pq").map_err(unexpected)?;
    let pq_bytes: [u8; 8] = pq_bytes
        .try_into()
        .map_err(|_| Error::InvalidPqSize { size: pq_bytes.len() })?;
    let pq = u64::from_be_bytes(pq_bytes);
    let (p, q) = factorize(pq).ok_or(Error::FactorizationFailed { pq })?;

    let mut new_nonce = [0u8; 32];
    new_nonce.copy_from_slice(&random[..32]);
    let mut rnd224 = [0u8; 224];
    rnd224.copy_from_slice(&random[32..]);

    let fingerprints: Vec<i64> = response
        .vector("server_public_key_fingerprints")
        .map_err(unexpected)?
        .iter()
        .filter_map(|v| v.as_long())
        .collect();
    let (fingerprint, key) = fingerprints
        .iter()
        .find_map(|&fp| trusted.iter().find(|k| k.fingerprint() == fp).map(|k| (fp, k)))
        .ok_or_else(|| Error::UntrustedServer { fingerprints: fingerprints.clone() })?;

    let pq_inner = TlObject::builder("p_q_inner_data")
        .and_then(|b| {
            b.set("pq", pq_bytes.to_vec())
                .set("p", trim_be(p))
                .set("q", trim_be(q))
                .set("nonce", nonce)
                .set("server_nonce", server_nonce)
                .set("new_nonce", new_nonce)
                .build()
        })
        .map_err(unexpected)?
        .to_bytes();

    let ciphertext = rsa::encrypt_hashed(&pq_inner, key, &rnd224)?;

    let request = TlObject::builder("req_DH_params")
        .and_then(|b| {
            b.set("nonce", nonce)
                .set("server_nonce", server_nonce)
                .set("p", trim_be(p))
                .set("q", trim_be(q))
                .set("public_key_fingerprint", fingerprint)
                .set("encrypted_data", ciphertext)
                .build()
        })
        .map_err(unexpected)?;

    Ok((request, Step2 { nonce, server_nonce, new_nonce }))
}

/// Process `Server_DH_Params` and generate `set_client_DH_params`.
pub fn step3(data: Step2, response: &TlObject) -> Result<(TlObject, Step3), Error> {
    let now = unix_now().0 as i32;
    do_step3(data, response, &random_bytes(), now)
}

/// [`step3`] with explicit randomness (256 bytes of `b`, 16 of padding)
/// and local time.
pub fn do_step3(data: Step2, response: &TlObject, random: &[u8; 272], now: i32) -> Result<(TlObject, Step3), Error> {
    let Step2 { nonce, server_nonce, new_nonce } = data;
    expect_name(response, &["server_DH_params_ok", "server_DH_params_fail"])?;

    check_nonce(&response.int128("nonce").map_err(unexpected)?, &nonce)?;
    check_server_nonce(&response.int128("server_nonce").map_err(unexpected)?, &server_nonce)?;

    if response.name() == "server_DH_params_fail" {
        let digest = sha1!(new_nonce);
        let mut expected = [0u8; 16];
        expected.copy_from_slice(&digest[4..]);
        check_new_nonce_hash(&response.int128("new_nonce_hash").map_err(unexpected)?, &expected)?;
        return Err(Error::DhParamsFail);
    }

    let mut answer = response.bytes("encrypted_answer").map_err(unexpected)?.to_vec();
    if answer.is_empty() || answer.len() % 16 != 0 {
        return Err(Error::EncryptedResponseNotPadded { len: answer.len() });
    }

    let (key, iv) = nonce_key_iv(&server_nonce, &new_nonce);
    aes::ige_decrypt(&mut answer, &key, &iv);
    if answer.len() < 20 {
        return Err(Error::EncryptedResponseNotPadded { len: answer.len() });
    }

    let mut got_hash = [0u8; 20];
    got_hash.copy_from_slice(&answer[..20]);
    let mut cursor = Cursor::from_slice(&answer[20..]);
    let inner = Registry::embedded()
        .read_object(&mut cursor, Some("Server_DH_inner_data"))
        .map_err(|error| Error::InvalidDhInnerData { error })?;

    let expected_hash = sha1!(&answer[20..20 + cursor.pos()]);
    if got_hash != expected_hash {
        return Err(Error::InvalidAnswerHash { got: got_hash, expected: expected_hash });
    }

    let dh_err = |error| Error::InvalidDhInnerData { error };
    check_nonce(&inner.int128("nonce").map_err(dh_err)?, &nonce)?;
    check_server_nonce(&inner.int128("server_nonce").map_err(dh_err)?, &server_nonce)?;

    let g_raw = inner.int("g").map_err(dh_err)?;
    if !(2..=7).contains(&g_raw) {
        return Err(Error::InvalidGenerator { g: g_raw });
    }
    let dh_prime = BigUint::from_bytes_be(inner.bytes("dh_prime").map_err(dh_err)?);
    if dh_prime.bits() != DH_PRIME_BITS {
        return Err(Error::InvalidDhPrime { bits: dh_prime.bits() });
    }
    let g = BigUint::from(g_raw as u32);
    let g_a = BigUint::from_bytes_be(inner.bytes("g_a").map_err(dh_err)?);
    let time_offset = inner.int("server_time").map_err(dh_err)? - now;

    let one = BigUint::one();
    let upper = &dh_prime - &one;
    check_g_in_range(&g_a, &one, &upper)?;
    let safety = BigUint::one() << (DH_PRIME_BITS - 64);
    let safe_upper = &dh_prime - &safety;
    check_g_in_range(&g_a, &safety, &safe_upper)?;

    let b = BigUint::from_bytes_be(&random[..256]);
    let g_b = g.modpow(&b, &dh_prime);
    check_g_in_range(&g_b, &one, &upper)?;
    check_g_in_range(&g_b, &safety, &safe_upper)?;
    let gab = g_a.modpow(&b, &dh_prime);

    let client_dh_inner = TlObject::builder("client_DH_inner_data")
        .and_then(|b| {
            b.set("nonce", nonce)
                .set("server_nonce", server_nonce)
                .set("retry_id", 0i64)
                .set("g_b", g_b.to_bytes_be())
                .build()
        })
        .map_err(unexpected)?
        .to_bytes();

    let pad_len = (16 - ((20 + client_dh_inner.len()) % 16)) % 16;
    let mut hashed = Vec::with_capacity(20 + client_dh_inner.len() + pad_len);
    hashed.extend_from_slice(&sha1!(&client_dh_inner));
    hashed.extend_from_slice(&client_dh_inner);
    hashed.extend_from_slice(&random[256..256 + pad_len]);
    aes::ige_encrypt(&mut hashed, &key, &iv);

    let request = TlObject::builder("set_client_DH_params")
        .and_then(|b| {
            b.set("nonce", nonce)
                .set("server_nonce", server_nonce)
                .set("encrypted_data", hashed)
                .build()
        })
        .map_err(unexpected)?;

    Ok((request, Step3 { nonce, server_nonce, new_nonce, gab, time_offset }))
}

/// Finalise the handshake.
pub fn finish(data: Step3, response: &TlObject) -> Result<Finished, Error> {
    let Step3 { nonce, server_nonce, new_nonce, gab, time_offset } = data;

    let (field, number) = match response.name() {
        "dh_gen_ok" => ("new_nonce_hash1", 1),
        "dh_gen_retry" => ("new_nonce_hash2", 2),
        _ => {
            expect_name(response, &["dh_gen_fail"])?;
            ("new_nonce_hash3", 3)
        }
    };

    check_nonce(&response.int128("nonce").map_err(unexpected)?, &nonce)?;
    check_server_nonce(&response.int128("server_nonce").map_err(unexpected)?, &server_nonce)?;

    let mut key_bytes = [0u8; 256];
    let gab_bytes = gab.to_bytes_be();
    let skip = 256usize.saturating_sub(gab_bytes.len());
    key_bytes[skip..].copy_from_slice(&gab_bytes[gab_bytes.len().saturating_sub(256)..]);

    let auth_key = AuthKey::from_bytes(key_bytes);
    let expected_hash = auth_key.calc_new_nonce_hash(&new_nonce, number);
    check_new_nonce_hash(&response.int128(field).map_err(unexpected)?, &expected_hash)?;

    match number {
        1 => Ok(Finished { auth_key, time_offset, first_salt: first_salt(&new_nonce, &server_nonce) }),
        2 => Err(Error::DhGenRetry),
        _ => Err(Error::DhGenFail),
    }
}

/// `new_nonce[0..8] ^ server_nonce[0..8]` read as a little-endian salt.
pub fn first_salt(new_nonce: &[u8; 32], server_nonce: &[u8; 16]) -> i64 {
    let mut buf = [0u8; 8];
    for ((dst, a), b) in buf.iter_mut().zip(&new_nonce[..8]).zip(&server_nonce[..8]) {
        *dst = a ^ b;
    }
    i64::from_le_bytes(buf)
}

fn expect_name(response: &TlObject, names: &[&str]) -> Result<(), Error> {
    if names.contains(&response.name()) {
        Ok(())
    } else {
        Err(unexpected(tgcore_tl::Error::UnexpectedConstructor {
            id: response.id(),
            expected: names.join(" | "),
        }))
    }
}

fn trim_be(v: u64) -> Vec<u8> {
    let b = v.to_be_bytes();
    let skip = b.iter().position(|&x| x != 0).unwrap_or(7);
    b[skip..].to_vec()
}

fn check_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected {
        Ok(())
    } else {
        Err(Error::InvalidNonce { got: *got, expected: *expected })
    }
}

fn check_server_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected {
        Ok(())
    } else {
        Err(Error::InvalidServerNonce { got: *got, expected: *expected })
    }
}

fn check_new_nonce_hash(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected {
        Ok(())
    } else {
        Err(Error::InvalidNewNonceHash { got: *got, expected: *expected })
    }
}

fn check_g_in_range(val: &BigUint, lo: &BigUint, hi: &BigUint) -> Result<(), Error> {
    if lo < val && val < hi {
        Ok(())
    } else {
        Err(Error::GParameterOutOfRange { value: val.clone(), low: lo.clone(), high: hi.clone() })
    }
}
