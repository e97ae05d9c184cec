//! Service-level envelope handling.
//!
//! [`classify`] turns one decrypted message body into a flat list of
//! [`Envelope`]s: containers are flattened, `gzip_packed` payloads are
//! inflated (also inside `rpc_result`), and MTProto service messages are
//! mapped to [`Inbound`] variants. The outbound helpers serialize the few
//! service calls a session sends on its own.

use std::fmt;
use std::io::Read;

use flate2::read::GzDecoder;
use tgcore_tl::{Cursor, Deserializable, Registry, Serializable, TlObject, TlValue};

use crate::salt::FutureSalt;

/// Inflated payloads larger than this are rejected.
pub const MAX_UNPACKED_LEN: usize = 32 * 1024 * 1024;

pub const RPC_ERROR_ID: u32 = 0x2144_ca19;
pub const GZIP_PACKED_ID: u32 = 0x3072_cfa1;
const MSGS_ACK_ID: u32 = 0x62d6_b459;
const PING_DELAY_DISCONNECT_ID: u32 = 0xf342_7b8c;
const GET_FUTURE_SALTS_ID: u32 = 0xb921_bd04;

#[derive(Debug)]
pub enum Error {
    Decode(tgcore_tl::Error),
    Inflate(std::io::Error),
    /// Inflating would exceed [`MAX_UNPACKED_LEN`].
    TooLarge,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "malformed envelope: {e}"),
            Self::Inflate(e) => write!(f, "gzip_packed: {e}"),
            Self::TooLarge => write!(f, "gzip_packed payload too large"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::Inflate(e) => Some(e),
            Self::TooLarge => None,
        }
    }
}

impl From<tgcore_tl::Error> for Error {
    fn from(e: tgcore_tl::Error) -> Self {
        Self::Decode(e)
    }
}

/// `rpc_error` as sent by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerError {
    pub code: i32,
    pub message: String,
}

/// What an inbound message means to the session.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Serialized result, already inflated.
    RpcResult { req_msg_id: i64, result: Vec<u8> },
    RpcError { req_msg_id: i64, error: ServerError },
    Ack { msg_ids: Vec<i64> },
    BadServerSalt { bad_msg_id: i64, new_salt: i64 },
    BadMessage { bad_msg_id: i64, code: i32 },
    NewSession { first_msg_id: i64, server_salt: i64 },
    Pong { msg_id: i64, ping_id: i64 },
    FutureSalts { req_msg_id: i64, now: i32, salts: Vec<FutureSalt> },
    /// The server has an answer to `answer_msg_id` ready; it must be acked.
    DetailedInfo { answer_msg_id: i64 },
    /// Anything of type `Updates`.
    Updates(TlObject),
    Other(TlObject),
}

/// One message after flattening.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub msg_id: i64,
    pub seq_no: i32,
    pub item: Inbound,
}

impl Envelope {
    /// Content-related messages (odd `seq_no`) must be acknowledged.
    pub fn is_content_related(&self) -> bool {
        self.seq_no & 1 == 1
    }
}

/// Decode a message body into envelopes, flattening containers.
pub fn classify(registry: &Registry, msg_id: i64, seq_no: i32, body: &[u8]) -> Result<Vec<Envelope>, Error> {
    let mut out = Vec::new();
    classify_into(registry, msg_id, seq_no, body, &mut out)?;
    Ok(out)
}

fn classify_into(
    registry: &Registry,
    msg_id: i64,
    seq_no: i32,
    body: &[u8],
    out: &mut Vec<Envelope>,
) -> Result<(), Error> {
    let object = registry.decode_object(body)?;
    let item = match object.name() {
        "msg_container" => {
            for message in object.vector("messages")? {
                let Some(inner) = message.as_object() else { continue };
                let body = inner.bytes("body")?;
                classify_into(registry, inner.long("msg_id")?, inner.int("seqno")?, body, out)?;
            }
            return Ok(());
        }
        "gzip_packed" => {
            let inner = gunzip(object.bytes("packed_data")?)?;
            return classify_into(registry, msg_id, seq_no, &inner, out);
        }
        "rpc_result" => {
            let req_msg_id = object.long("req_msg_id")?;
            let mut result = object.bytes("result")?.to_vec();
            if peek_id(&result) == Some(GZIP_PACKED_ID) {
                result = unpack_gzip_object(&result)?;
            }
            match peek_id(&result) {
                Some(RPC_ERROR_ID) => Inbound::RpcError { req_msg_id, error: decode_rpc_error(&result)? },
                _ => Inbound::RpcResult { req_msg_id, result },
            }
        }
        "msgs_ack" => Inbound::Ack { msg_ids: longs(object.vector("msg_ids")?) },
        "bad_server_salt" => Inbound::BadServerSalt {
            bad_msg_id: object.long("bad_msg_id")?,
            new_salt: object.long("new_server_salt")?,
        },
        "bad_msg_notification" => Inbound::BadMessage {
            bad_msg_id: object.long("bad_msg_id")?,
            code: object.int("error_code")?,
        },
        "new_session_created" => Inbound::NewSession {
            first_msg_id: object.long("first_msg_id")?,
            server_salt: object.long("server_salt")?,
        },
        "pong" => Inbound::Pong { msg_id: object.long("msg_id")?, ping_id: object.long("ping_id")? },
        "future_salts" => {
            let mut salts = Vec::new();
            for salt in object.vector("salts")? {
                let Some(salt) = salt.as_object() else { continue };
                salts.push(FutureSalt {
                    valid_since: salt.int("valid_since")?,
                    valid_until: salt.int("valid_until")?,
                    salt: salt.long("salt")?,
                });
            }
            Inbound::FutureSalts { req_msg_id: object.long("req_msg_id")?, now: object.int("now")?, salts }
        }
        "msg_detailed_info" | "msg_new_detailed_info" => {
            Inbound::DetailedInfo { answer_msg_id: object.long("answer_msg_id")? }
        }
        _ if object.ty() == "Updates" => Inbound::Updates(object),
        _ => Inbound::Other(object),
    };
    out.push(Envelope { msg_id, seq_no, item });
    Ok(())
}

fn longs(values: &[TlValue]) -> Vec<i64> {
    values.iter().filter_map(TlValue::as_long).collect()
}

fn peek_id(bytes: &[u8]) -> Option<u32> {
    Cursor::from_slice(bytes).peek_u32().ok()
}

fn decode_rpc_error(bytes: &[u8]) -> Result<ServerError, Error> {
    let mut cursor = Cursor::from_slice(bytes);
    let _id = u32::deserialize(&mut cursor)?;
    let code = i32::deserialize(&mut cursor)?;
    let message = String::deserialize(&mut cursor)?;
    Ok(ServerError { code, message })
}

/// Inflate a serialized `gzip_packed` object.
pub fn unpack_gzip_object(bytes: &[u8]) -> Result<Vec<u8>, Error> {
    let mut cursor = Cursor::from_slice(bytes);
    let _id = u32::deserialize(&mut cursor)?;
    let packed = Vec::<u8>::deserialize(&mut cursor)?;
    gunzip(&packed)
}

/// Inflate gzip data, bounded by [`MAX_UNPACKED_LEN`].
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(MAX_UNPACKED_LEN as u64 + 1)
        .read_to_end(&mut out)
        .map_err(Error::Inflate)?;
    if out.len() > MAX_UNPACKED_LEN {
        return Err(Error::TooLarge);
    }
    Ok(out)
}

/// `msgs_ack msg_ids:Vector<long>`
pub fn msgs_ack(msg_ids: &[i64]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + msg_ids.len() * 8);
    MSGS_ACK_ID.serialize(&mut buf);
    msg_ids.serialize(&mut buf);
    buf
}

/// `ping_delay_disconnect ping_id:long disconnect_delay:int`
pub fn ping_delay_disconnect(ping_id: i64, disconnect_delay: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    PING_DELAY_DISCONNECT_ID.serialize(&mut buf);
    ping_id.serialize(&mut buf);
    disconnect_delay.serialize(&mut buf);
    buf
}

/// `get_future_salts num:int`
pub fn get_future_salts(num: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    GET_FUTURE_SALTS_ID.serialize(&mut buf);
    num.serialize(&mut buf);
    buf
}
