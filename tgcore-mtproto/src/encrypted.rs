//! Encrypted MTProto 2.0 session (post auth-key).
//!
//! Once you have a [`Finished`](crate::authentication::Finished), construct
//! an [`EncryptedSession`] and use it to seal and open all subsequent
//! messages. [`seal`] and [`open`] are the stateless halves, usable from
//! either side of the connection.

use std::fmt;

use log::{debug, warn};
use tgcore_crypto::{AuthKey, Side, decrypt_data_v2, encrypt_data_v2, random_bytes};
use tgcore_tl::Serializable;

use crate::message_id::{MsgIdGenerator, unix_now};
use crate::replay::{ReplayError, ReplayGuard};
use crate::salt::SaltHistory;

/// Header bytes before the body: salt, session_id, msg_id, seq_no, length.
pub const HEADER_LEN: usize = 32;
pub const MIN_PADDING: usize = 12;
pub const MAX_PADDING: usize = 1024;

const MSG_CONTAINER_ID: u32 = 0x73f1_f8dc;
const BAD_MSG_NOTIFICATION_ID: u32 = 0xa7ef_f811;

/// Errors that can occur when opening a server message.
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// The crypto layer rejected the message.
    Crypto(tgcore_crypto::DecryptError),
    /// The plaintext is too short to hold a header.
    FrameTooShort,
    SessionMismatch { got: i64, expected: i64 },
    /// The length field does not fit the plaintext or is not word-aligned.
    BadLength { declared: i32, available: usize },
    /// Padding outside 12..=1024 bytes.
    BadPadding { len: usize },
    Replay(ReplayError),
}

impl fmt::Display for DecryptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crypto(e) => write!(f, "crypto: {e}"),
            Self::FrameTooShort => write!(f, "inner plaintext too short"),
            Self::SessionMismatch { got, expected } => {
                write!(f, "session_id mismatch: got {got}, expected {expected}")
            }
            Self::BadLength { declared, available } => {
                write!(f, "message length {declared} invalid for {available} bytes")
            }
            Self::BadPadding { len } => write!(f, "padding of {len} bytes out of range"),
            Self::Replay(e) => write!(f, "replay: {e}"),
        }
    }
}

impl std::error::Error for DecryptError {}

impl From<tgcore_crypto::DecryptError> for DecryptError {
    fn from(e: tgcore_crypto::DecryptError) -> Self {
        Self::Crypto(e)
    }
}

impl From<ReplayError> for DecryptError {
    fn from(e: ReplayError) -> Self {
        Self::Replay(e)
    }
}

/// The inner payload of a successfully opened message.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedMessage {
    pub salt: i64,
    pub session_id: i64,
    pub msg_id: i64,
    pub seq_no: i32,
    /// TL-serialized body.
    pub body: Vec<u8>,
}

/// A message queued for sending, before encryption.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingMessage {
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
}

/// Knobs for inbound validation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SessionOptions {
    /// Inbound message ids further than this from server time are rejected.
    pub clock_skew_window: u64,
    /// How many inbound ids are remembered for duplicate detection.
    pub replay_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { clock_skew_window: 300, replay_capacity: 1024 }
    }
}

/// Encrypt one message as `side`.
pub fn seal(
    auth_key: &AuthKey,
    side: Side,
    salt: i64,
    session_id: i64,
    msg_id: i64,
    seq_no: i32,
    body: &[u8],
) -> Vec<u8> {
    let mut plaintext = Vec::with_capacity(HEADER_LEN + body.len());
    salt.serialize(&mut plaintext);
    session_id.serialize(&mut plaintext);
    msg_id.serialize(&mut plaintext);
    seq_no.serialize(&mut plaintext);
    (body.len() as i32).serialize(&mut plaintext);
    plaintext.extend_from_slice(body);
    encrypt_data_v2(&plaintext, auth_key, side)
}

/// Decrypt a message produced by `side` and validate its framing.
/// Session id and replay checks are left to the caller.
pub fn open(auth_key: &AuthKey, side: Side, frame: &[u8]) -> Result<DecryptedMessage, DecryptError> {
    let plaintext = decrypt_data_v2(frame, auth_key, side)?;
    if plaintext.len() < HEADER_LEN {
        return Err(DecryptError::FrameTooShort);
    }

    let long = |at: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&plaintext[at..at + 8]);
        i64::from_le_bytes(b)
    };
    let int = |at: usize| i32::from_le_bytes([plaintext[at], plaintext[at + 1], plaintext[at + 2], plaintext[at + 3]]);

    let declared = int(28);
    let available = plaintext.len() - HEADER_LEN;
    let len = usize::try_from(declared)
        .ok()
        .filter(|&len| len % 4 == 0 && len <= available)
        .ok_or(DecryptError::BadLength { declared, available })?;

    let padding = available - len;
    if !(MIN_PADDING..=MAX_PADDING).contains(&padding) {
        return Err(DecryptError::BadPadding { len: padding });
    }

    Ok(DecryptedMessage {
        salt: long(0),
        session_id: long(8),
        msg_id: long(16),
        seq_no: int(24),
        body: plaintext[HEADER_LEN..HEADER_LEN + len].to_vec(),
    })
}

/// Serialize `messages` as a `msg_container` body.
pub fn container_body(messages: &[OutgoingMessage]) -> Vec<u8> {
    let len = 8 + messages.iter().map(|m| 16 + m.body.len()).sum::<usize>();
    let mut buf = Vec::with_capacity(len);
    MSG_CONTAINER_ID.serialize(&mut buf);
    (messages.len() as i32).serialize(&mut buf);
    for m in messages {
        m.msg_id.serialize(&mut buf);
        m.seq_no.serialize(&mut buf);
        (m.body.len() as i32).serialize(&mut buf);
        buf.extend_from_slice(&m.body);
    }
    buf
}

/// MTProto 2.0 encrypted session state.
///
/// Wraps an [`AuthKey`] and tracks the per-session counters: session id,
/// sequence number, message ids (with the server time offset), the salt
/// history and the inbound replay window.
pub struct EncryptedSession {
    auth_key: AuthKey,
    session_id: i64,
    sequence: i32,
    ids: MsgIdGenerator,
    salts: SaltHistory,
    replay: ReplayGuard,
}

impl EncryptedSession {
    pub fn new(auth_key: AuthKey, salts: SaltHistory, time_offset: i32, options: SessionOptions) -> Self {
        Self {
            auth_key,
            session_id: i64::from_le_bytes(random_bytes()),
            sequence: 0,
            ids: MsgIdGenerator::new(time_offset),
            salts,
            replay: ReplayGuard::new(options.clock_skew_window, options.replay_capacity),
        }
    }

    pub fn auth_key(&self) -> &AuthKey {
        &self.auth_key
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn salts(&self) -> &SaltHistory {
        &self.salts
    }

    pub fn salts_mut(&mut self) -> &mut SaltHistory {
        &mut self.salts
    }

    pub fn time_offset(&self) -> i32 {
        self.ids.time_offset()
    }

    /// Start a new session on the same key: fresh id, sequence and replay
    /// memory. Used after reconnecting.
    pub fn reset(&mut self) {
        self.session_id = i64::from_le_bytes(random_bytes());
        self.sequence = 0;
        self.replay.clear();
        debug!("new session id {:#x}", self.session_id);
    }

    /// Re-derive the time offset from a server message id.
    pub fn sync_time(&mut self, server_msg_id: i64) -> i32 {
        let offset = self.ids.sync_with(server_msg_id, unix_now().0);
        debug!("time offset resynchronised to {offset}s");
        offset
    }

    /// Allocate a message id and sequence number.
    pub fn next_message(&mut self, content_related: bool) -> (i64, i32) {
        let msg_id = self.ids.next();
        let seq_no = if content_related {
            let n = self.sequence * 2 + 1;
            self.sequence += 1;
            n
        } else {
            self.sequence * 2
        };
        (msg_id, seq_no)
    }

    /// Encrypt `body` under a fresh message id. Returns the wire bytes and
    /// the id.
    pub fn pack(&mut self, body: &[u8], content_related: bool) -> (Vec<u8>, i64) {
        let (msg_id, seq_no) = self.next_message(content_related);
        (self.seal(msg_id, seq_no, body), msg_id)
    }

    /// Encrypt a message whose id was allocated with
    /// [`next_message`](Self::next_message).
    pub fn seal(&self, msg_id: i64, seq_no: i32, body: &[u8]) -> Vec<u8> {
        seal(&self.auth_key, Side::Client, self.salts.current(), self.session_id, msg_id, seq_no, body)
    }

    /// Encrypt several messages at once. A single message is sent as is;
    /// more are wrapped in a `msg_container` with its own id, which is
    /// returned alongside the bytes.
    pub fn pack_messages(&mut self, messages: &[OutgoingMessage]) -> (Vec<u8>, i64) {
        match messages {
            [single] => (self.seal(single.msg_id, single.seq_no, &single.body), single.msg_id),
            many => {
                let body = container_body(many);
                self.pack(&body, false)
            }
        }
    }

    /// Decrypt and validate a server frame.
    pub fn unpack(&mut self, frame: &[u8]) -> Result<DecryptedMessage, DecryptError> {
        let message = open(&self.auth_key, Side::Server, frame)?;
        if message.session_id != self.session_id {
            return Err(DecryptError::SessionMismatch { got: message.session_id, expected: self.session_id });
        }

        self.replay.check_id(message.msg_id)?;
        if let Err(e) = self.replay.check_window(message.msg_id, self.ids.server_now()) {
            if !is_time_sync_notification(&message.body) {
                warn!("rejecting inbound message: {e}");
                return Err(e.into());
            }
            debug!("accepting time-sync notification outside the clock window");
        }
        self.replay.remember(message.msg_id);

        if !self.salts.is_known(message.salt) {
            debug!("inbound message carries unknown salt {:#x}", message.salt);
        }
        Ok(message)
    }
}

/// `bad_msg_notification` with code 16 or 17: the client clock is off,
/// so the server's id legitimately falls outside the window.
fn is_time_sync_notification(body: &[u8]) -> bool {
    if body.len() < 20 {
        return false;
    }
    let id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let code = i32::from_le_bytes([body[16], body[17], body[18], body[19]]);
    id == BAD_MSG_NOTIFICATION_ID && matches!(code, 16 | 17)
}

impl fmt::Debug for EncryptedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedSession")
            .field("auth_key", &self.auth_key)
            .field("session_id", &self.session_id)
            .field("sequence", &self.sequence)
            .field("salt", &self.salts.current())
            .field("time_offset", &self.ids.time_offset())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AuthKey {
        let mut data = [0u8; 256];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        AuthKey::from_bytes(data)
    }

    #[test]
    fn seq_numbers_follow_content_relatedness() {
        let mut session = EncryptedSession::new(key(), SaltHistory::new(1), 0, SessionOptions::default());
        let (_, a) = session.next_message(true);
        let (_, b) = session.next_message(false);
        let (_, c) = session.next_message(true);
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn client_message_opens_on_the_server_side() {
        let mut session = EncryptedSession::new(key(), SaltHistory::new(77), 0, SessionOptions::default());
        let (wire, msg_id) = session.pack(&[1, 2, 3, 4], true);
        let opened = open(&key(), Side::Client, &wire).unwrap();
        assert_eq!(opened.msg_id, msg_id);
        assert_eq!(opened.salt, 77);
        assert_eq!(opened.session_id, session.session_id());
        assert_eq!(opened.body, [1, 2, 3, 4]);
    }

    #[test]
    fn container_wraps_multiple_messages() {
        let mut session = EncryptedSession::new(key(), SaltHistory::new(1), 0, SessionOptions::default());
        let (id1, seq1) = session.next_message(true);
        let (id2, seq2) = session.next_message(true);
        let msgs = [
            OutgoingMessage { msg_id: id1, seq_no: seq1, body: vec![1; 4] },
            OutgoingMessage { msg_id: id2, seq_no: seq2, body: vec![2; 8] },
        ];
        let (wire, container_id) = session.pack_messages(&msgs);
        assert!(container_id > id2);
        let opened = open(&key(), Side::Client, &wire).unwrap();
        assert_eq!(opened.seq_no % 2, 0);
        assert_eq!(opened.body, container_body(&msgs));
        assert_eq!(&opened.body[..4], &MSG_CONTAINER_ID.to_le_bytes());
    }

    #[test]
    fn time_sync_notification_is_recognised() {
        let mut body = Vec::new();
        BAD_MSG_NOTIFICATION_ID.serialize(&mut body);
        5i64.serialize(&mut body);
        1i32.serialize(&mut body);
        16i32.serialize(&mut body);
        assert!(is_time_sync_notification(&body));
        body[16] = 32;
        assert!(!is_time_sync_notification(&body));
    }

    #[test]
    fn replayed_server_message_is_rejected() {
        let mut session = EncryptedSession::new(key(), SaltHistory::new(5), 0, SessionOptions::default());
        let server_id = (crate::message_id::unix_now().0 << 32) | 1;
        let frame = seal(&key(), Side::Server, 5, session.session_id(), server_id, 1, &[9; 8]);

        assert_eq!(session.unpack(&frame).unwrap().msg_id, server_id);
        assert_eq!(
            session.unpack(&frame),
            Err(DecryptError::Replay(ReplayError::Duplicate { msg_id: server_id }))
        );
    }

    #[test]
    fn altered_server_message_fails_integrity() {
        let mut session = EncryptedSession::new(key(), SaltHistory::new(5), 0, SessionOptions::default());
        let server_id = (crate::message_id::unix_now().0 << 32) | 1;
        let mut frame = seal(&key(), Side::Server, 5, session.session_id(), server_id, 1, &[9; 8]);
        frame[30] ^= 0x01;
        assert_eq!(
            session.unpack(&frame),
            Err(DecryptError::Crypto(tgcore_crypto::DecryptError::IntegrityFailure))
        );
        frame[30] ^= 0x01;
        assert!(session.unpack(&frame).is_ok());
    }
}
