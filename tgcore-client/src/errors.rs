//! Error types for tgcore-client.

use std::{fmt, io};

use tgcore_mtproto::authentication;
use tgcore_mtproto::envelope;
use tgcore_mtproto::plain::PlainError;
use tgcore_mtproto::{DecryptError, FrameError, ServerError};

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server in response to an RPC call.
///
/// Numeric values are stripped from the name and placed in [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with the numeric suffix removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw error message like `"FLOOD_WAIT_30"`.
    pub fn from_server(code: i32, message: &str) -> Self {
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    return Self { code, name: message[..idx].to_string(), value: Some(v) };
                }
            }
        }
        Self { code, name: message.to_string(), value: None }
    }

    /// Match on the error name, with an optional `'*'` wildcard prefix or suffix.
    ///
    /// - `err.is("FLOOD_WAIT")`: exact match
    /// - `err.is("PHONE_CODE_*")`: starts-with match
    /// - `err.is("*_INVALID")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// Seconds to wait, if this is a `FLOOD_WAIT_N`.
    pub fn flood_wait_seconds(&self) -> Option<u32> {
        if self.code == 420 && self.name == "FLOOD_WAIT" { self.value } else { None }
    }

    /// Target DC of a `303 *_MIGRATE_N` redirect.
    pub fn migrate_dc(&self) -> Option<i32> {
        if self.code == 303 && self.name.ends_with("_MIGRATE") {
            self.value.and_then(|v| i32::try_from(v).ok())
        } else {
            None
        }
    }
}

impl From<&ServerError> for RpcError {
    fn from(e: &ServerError) -> Self {
        Self::from_server(e.code, &e.message)
    }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned from any `Client` method that talks to the server.
#[derive(Debug)]
pub enum InvocationError {
    /// The server rejected the request.
    Rpc(RpcError),
    /// The server requires authorization first (code 401). The wrapped error
    /// names the reason, e.g. `AUTH_KEY_UNREGISTERED` or `SESSION_PASSWORD_NEEDED`.
    AuthRequired(RpcError),
    /// `FLOOD_WAIT_N` that was not slept through.
    FloodWait(u32),
    /// A response or handshake message could not be decoded.
    MalformedData(String),
    /// The server presented no RSA key from the trusted set.
    UntrustedServer { fingerprints: Vec<i64> },
    /// An inbound frame failed `msg_key` verification.
    IntegrityFailure,
    /// The auth key exchange failed.
    Handshake(authentication::Error),
    /// The server closed the transport with a negative error code.
    Transport(i32),
    /// The connection went away before the call completed.
    Disconnected,
    /// Connecting failed.
    Io(io::Error),
    /// No result within the configured request timeout.
    Timeout,
    /// Too many consecutive `*_MIGRATE_N` redirects.
    TooManyRedirects { dc_id: i32 },
    /// The account has a cloud password; call `check_password`.
    TwoFactorRequired { hint: Option<String> },
    /// The phone number is not registered.
    SignUpRequired,
    /// The login code was wrong or expired.
    InvalidCode,
    /// The caller's cancellation token fired.
    Cancelled,
    /// The prepared call already completed and cannot be dispatched again.
    StaleCall,
    /// `bad_msg_notification` with a code the session cannot recover from.
    BadMessage(i32),
    /// Reading or writing the session store failed.
    Storage(io::Error),
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "{e}"),
            Self::AuthRequired(e) => write!(f, "authorization required: {}", e.name),
            Self::FloodWait(secs) => write!(f, "flood wait of {secs}s"),
            Self::MalformedData(s) => write!(f, "malformed data: {s}"),
            Self::UntrustedServer { fingerprints } => {
                write!(f, "server offered no trusted RSA key (fingerprints {fingerprints:x?})")
            }
            Self::IntegrityFailure => write!(f, "inbound message failed integrity check"),
            Self::Handshake(e) => write!(f, "auth key exchange failed: {e}"),
            Self::Transport(code) => write!(f, "transport error {code}"),
            Self::Disconnected => write!(f, "connection lost"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Timeout => write!(f, "request timed out"),
            Self::TooManyRedirects { dc_id } => write!(f, "too many redirects (last to DC {dc_id})"),
            Self::TwoFactorRequired { hint: Some(hint) } => write!(f, "2FA password required (hint: {hint})"),
            Self::TwoFactorRequired { hint: None } => write!(f, "2FA password required"),
            Self::SignUpRequired => write!(f, "sign up required"),
            Self::InvalidCode => write!(f, "invalid or expired code"),
            Self::Cancelled => write!(f, "request cancelled"),
            Self::StaleCall => write!(f, "call already completed"),
            Self::BadMessage(code) => write!(f, "bad message notification {code}"),
            Self::Storage(e) => write!(f, "session storage: {e}"),
        }
    }
}

impl std::error::Error for InvocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rpc(e) | Self::AuthRequired(e) => Some(e),
            Self::Handshake(e) => Some(e),
            Self::Io(e) | Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for InvocationError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<tgcore_tl::Error> for InvocationError {
    fn from(e: tgcore_tl::Error) -> Self {
        Self::MalformedData(e.to_string())
    }
}

impl From<envelope::Error> for InvocationError {
    fn from(e: envelope::Error) -> Self {
        Self::MalformedData(e.to_string())
    }
}

impl From<PlainError> for InvocationError {
    fn from(e: PlainError) -> Self {
        Self::MalformedData(e.to_string())
    }
}

impl From<FrameError> for InvocationError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Transport(code) => Self::Transport(code),
            other => Self::MalformedData(other.to_string()),
        }
    }
}

impl From<DecryptError> for InvocationError {
    fn from(e: DecryptError) -> Self {
        match e {
            DecryptError::Crypto(_) | DecryptError::BadPadding { .. } => Self::IntegrityFailure,
            other => Self::MalformedData(other.to_string()),
        }
    }
}

impl From<authentication::Error> for InvocationError {
    fn from(e: authentication::Error) -> Self {
        match e {
            authentication::Error::UntrustedServer { fingerprints } => Self::UntrustedServer { fingerprints },
            other => Self::Handshake(other),
        }
    }
}

impl From<&ServerError> for InvocationError {
    fn from(e: &ServerError) -> Self {
        let rpc = RpcError::from(e);
        match rpc.flood_wait_seconds() {
            Some(secs) => Self::FloodWait(secs),
            None if rpc.code == 401 => Self::AuthRequired(rpc),
            None => Self::Rpc(rpc),
        }
    }
}

impl InvocationError {
    /// The server error behind this failure, if any.
    pub fn rpc(&self) -> Option<&RpcError> {
        match self {
            Self::Rpc(e) | Self::AuthRequired(e) => Some(e),
            _ => None,
        }
    }

    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        self.rpc().is_some_and(|e| e.is(pattern))
    }

    /// If this is a flood wait, how many seconds the server asked for.
    pub fn flood_wait_seconds(&self) -> Option<u32> {
        match self {
            Self::FloodWait(secs) => Some(*secs),
            _ => None,
        }
    }

    /// Failures of the link rather than of the request itself.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Io(_) | Self::Timeout | Self::Transport(_))
    }
}
