//! MTProto 2.0 protocol core, free of I/O.
//!
//! This crate handles:
//! * Auth key generation ([`authentication`])
//! * Message ids, sequence numbers, salts and replay checks
//! * Encrypting and decrypting session messages ([`encrypted`])
//! * Unencrypted handshake messages ([`plain`])
//! * Abridged, Intermediate and Full framing, optionally obfuscated ([`transport`])
//! * Containers, gzip and service messages ([`envelope`])
//!
//! It is intentionally transport-agnostic: bring your own socket.

#![deny(unsafe_code)]

pub mod authentication;
pub mod encrypted;
pub mod envelope;
pub mod message_id;
pub mod plain;
pub mod replay;
pub mod salt;
pub mod transport;

pub use encrypted::{DecryptError, DecryptedMessage, EncryptedSession, OutgoingMessage, SessionOptions};
pub use envelope::{Envelope, Inbound, ServerError};
pub use message_id::MsgIdGenerator;
pub use replay::{ReplayError, ReplayGuard};
pub use salt::{FutureSalt, SaltHistory};
pub use transport::{FrameCodec, FrameError, Framing};
