//! An in-memory MTProto server for driving a real `Client`.
//!
//! Connections are `tokio::io::duplex` pairs. The server side shares the
//! auth key with the client's session up front, so no key exchange runs
//! unless a test asks for it.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use num_bigint::{BigInt, Sign};
use sha2::{Digest, Sha256};
use tgcore_client::session::{MemorySessionStore, SessionData};
use tgcore_client::transport::{BoxStream, ConnectFuture, Connector};
use tgcore_client::{Config, Settings};
use tgcore_crypto::{AuthKey, Side};
use tgcore_mtproto::encrypted;
use tgcore_mtproto::envelope::{self, Inbound};
use tgcore_mtproto::message_id::unix_now;
use tgcore_mtproto::{FrameCodec, plain};
use tgcore_tl::{Registry, Serializable, TlObject, TlValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

pub const KEY: [u8; 256] = [0x3c; 256];
pub const SALT: i64 = 0x1234_5678;

// ─── Connector ────────────────────────────────────────────────────────────────

/// Hands the server end of every connection to the test.
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<(i32, DuplexStream)>,
}

impl Connector for MemoryConnector {
    fn connect<'a>(&'a self, dc_id: i32, _addr: &'a str) -> ConnectFuture<'a> {
        Box::pin(async move {
            let (client, server) = tokio::io::duplex(1 << 20);
            self.tx
                .send((dc_id, server))
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "test server is gone"))?;
            Ok(Box::new(client) as BoxStream)
        })
    }
}

pub struct Listener {
    rx: mpsc::UnboundedReceiver<(i32, DuplexStream)>,
}

impl Listener {
    /// The next connection attempt, wrapped as a server connection.
    pub async fn accept(&mut self) -> ServerConn {
        let (dc_id, stream) = self.rx.recv().await.expect("client stopped connecting");
        ServerConn::accept(dc_id, stream)
    }
}

pub fn network() -> (MemoryConnector, Listener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryConnector { tx }, Listener { rx })
}

/// A session where every DC in `dcs` already has the shared key.
pub fn session_with_keys(home: i32, dcs: &[i32]) -> SessionData {
    let addresses: BTreeMap<i32, String> = dcs.iter().map(|&id| (id, format!("10.0.0.{id}:443"))).collect();
    let mut data = SessionData::new(home, &addresses);
    for entry in &mut data.dcs {
        entry.auth_key = Some(KEY);
        entry.salt = SALT;
    }
    data
}

pub fn settings() -> Settings {
    Settings { api_id: 4242, api_hash: "0123456789abcdef".into(), ..Settings::default() }
}

pub fn config(connector: MemoryConnector, store: &Arc<MemorySessionStore>, settings: Settings) -> Config {
    let mut config = Config::new(settings).with_connector(connector);
    config.session_store = store.clone();
    config
}

// ─── Server connection ────────────────────────────────────────────────────────

static NEXT_SERVER_MSG: AtomicI64 = AtomicI64::new(0);

fn server_msg_id() -> i64 {
    let n = NEXT_SERVER_MSG.fetch_add(1, Ordering::Relaxed);
    (unix_now().0 << 32) | (n * 4 + 1)
}

/// A function call the client made, with the connection wrappers removed.
#[derive(Debug)]
pub struct Request {
    pub msg_id: i64,
    pub query: TlObject,
}

impl Request {
    pub fn name(&self) -> &str {
        self.query.name()
    }
}

pub struct ServerConn {
    pub dc_id: i32,
    stream: DuplexStream,
    codec: Option<FrameCodec>,
    pending: Vec<u8>,
    key: AuthKey,
    session_id: i64,
    registry: Arc<Registry>,
    inbox: VecDeque<Request>,
}

impl ServerConn {
    fn accept(dc_id: i32, stream: DuplexStream) -> Self {
        Self {
            dc_id,
            stream,
            codec: None,
            pending: Vec::new(),
            key: AuthKey::from_bytes(KEY),
            session_id: 0,
            registry: Registry::embedded(),
            inbox: VecDeque::new(),
        }
    }

    /// The next transport frame, or `None` once the client hung up. The
    /// transport is detected from the first bytes.
    pub async fn read_frame(&mut self) -> Option<Vec<u8>> {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match self.codec.as_mut() {
                Some(codec) => {
                    if let Some(frame) = codec.next_frame().expect("bad frame") {
                        return Some(frame);
                    }
                }
                None => {
                    if let Some((mut codec, used)) = FrameCodec::accept(&self.pending, None).expect("unknown transport") {
                        codec.push_inbound(&self.pending[used..]);
                        self.pending.clear();
                        self.codec = Some(codec);
                        continue;
                    }
                }
            }
            let n = match self.stream.read(&mut buf).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => n,
            };
            match self.codec.as_mut() {
                Some(codec) => codec.push_inbound(&buf[..n]),
                None => self.pending.extend_from_slice(&buf[..n]),
            }
        }
    }

    pub async fn write_frame(&mut self, payload: &[u8]) {
        let wire = self.codec.as_mut().expect("reply before the client spoke").encode(payload);
        self.stream.write_all(&wire).await.expect("write frame");
    }

    /// The next RPC the client made. Acks, pings and salt requests are
    /// skipped.
    pub async fn next_request(&mut self) -> Option<Request> {
        loop {
            if let Some(request) = self.inbox.pop_front() {
                return Some(request);
            }
            let frame = self.read_frame().await?;
            let message = encrypted::open(&self.key, Side::Client, &frame).expect("decrypt client frame");
            self.session_id = message.session_id;
            let envelopes = envelope::classify(&self.registry, message.msg_id, message.seq_no, &message.body)
                .expect("classify client message");
            for envelope in envelopes {
                let object = match envelope.item {
                    Inbound::Other(object) | Inbound::Updates(object) => object,
                    _ => continue,
                };
                if !object.constructor().is_function()
                    || matches!(object.name(), "ping_delay_disconnect" | "get_future_salts")
                {
                    continue;
                }
                self.inbox.push_back(Request { msg_id: envelope.msg_id, query: unwrap_query(object) });
            }
        }
    }

    /// Like [`next_request`](Self::next_request), asserting the function.
    pub async fn expect(&mut self, name: &str) -> Request {
        let request = self.next_request().await.expect("client hung up");
        assert_eq!(request.name(), name, "unexpected call {:?}", request.query);
        request
    }

    pub async fn send_body(&mut self, body: &[u8]) {
        let frame = encrypted::seal(&self.key, Side::Server, SALT, self.session_id, server_msg_id(), 1, body);
        self.write_frame(&frame).await;
    }

    pub async fn reply(&mut self, req_msg_id: i64, result: &impl Serializable) {
        let frame = self.sealed_reply(req_msg_id, result);
        self.write_frame(&frame).await;
    }

    /// An encrypted `rpc_result` ready for [`write_frame`](Self::write_frame),
    /// for tests that alter or repeat it.
    pub fn sealed_reply(&self, req_msg_id: i64, result: &impl Serializable) -> Vec<u8> {
        let rpc_result = TlObject::builder("rpc_result")
            .unwrap()
            .set("req_msg_id", req_msg_id)
            .set("result", TlValue::Raw(result.to_bytes()))
            .build()
            .unwrap();
        encrypted::seal(&self.key, Side::Server, SALT, self.session_id, server_msg_id(), 1, &rpc_result.to_bytes())
    }

    pub async fn reply_error(&mut self, req_msg_id: i64, code: i32, message: &str) {
        let error = TlObject::builder("rpc_error")
            .unwrap()
            .set("error_code", code)
            .set("error_message", message)
            .build()
            .unwrap();
        self.reply(req_msg_id, &error).await;
    }

    /// Push an `Updates` object outside of any call.
    pub async fn push(&mut self, updates: &TlObject) {
        self.send_body(&updates.to_bytes()).await;
    }
}

/// Strip `invokeWithLayer(initConnection(...))`.
fn unwrap_query(mut object: TlObject) -> TlObject {
    while matches!(object.name(), "invokeWithLayer" | "initConnection") {
        object = object.object("query").expect("wrapper without query").clone();
    }
    object
}

// ─── Plain exchange ───────────────────────────────────────────────────────────

/// Answer `req_pq_multi` with a `resPQ` listing only `fingerprints`.
pub async fn answer_req_pq(conn: &mut ServerConn, fingerprints: &[i64]) {
    let frame = conn.read_frame().await.expect("client hung up");
    let (_, body) = plain::unpack(&frame).expect("plain message");
    let req = Registry::embedded().decode_object(body).expect("decode req_pq");
    assert_eq!(req.name(), "req_pq_multi");
    let res_pq = TlObject::builder("resPQ")
        .unwrap()
        .set("nonce", req.int128("nonce").unwrap())
        .set("server_nonce", [0x42u8; 16])
        .set("pq", 1470626929934143021u64.to_be_bytes().to_vec())
        .set("server_public_key_fingerprints", fingerprints.iter().map(|&f| TlValue::Long(f)).collect::<Vec<_>>())
        .build()
        .unwrap();
    let reply = plain::pack(server_msg_id(), &res_pq.to_bytes());
    conn.write_frame(&reply).await;
}

// ─── Fixtures ─────────────────────────────────────────────────────────────────

pub fn object(name: &str) -> tgcore_tl::ObjectBuilder {
    TlObject::builder(name).unwrap()
}

pub fn user(id: i64, first_name: &str) -> TlObject {
    object("user").set("id", id).set("access_hash", id * 7).set("first_name", first_name).build().unwrap()
}

pub fn peer_user(id: i64) -> TlObject {
    object("peerUser").set("user_id", id).build().unwrap()
}

pub fn text_message(id: i32, from: i64, text: &str) -> TlObject {
    object("message")
        .set("id", id)
        .set("peer_id", peer_user(from))
        .set("date", 1_700_000_000 + id)
        .set("message", text)
        .build()
        .unwrap()
}

pub fn update_state(pts: i32, seq: i32) -> TlObject {
    object("updates.state")
        .set("pts", pts)
        .set("qts", 0)
        .set("date", 1_700_000_000)
        .set("seq", seq)
        .set("unread_count", 0)
        .build()
        .unwrap()
}

pub fn difference_empty(seq: i32) -> TlObject {
    object("updates.differenceEmpty").set("date", 1_700_000_000).set("seq", seq).build().unwrap()
}

// ─── SRP server side ──────────────────────────────────────────────────────────

/// 2048-bit safe prime used as the password group.
pub const SRP_PRIME: &str = "c71caeb9c6b1c9048e6c522f70f13f73980d40238e3e21c14934d037563d930f48198a0aa7c14058229493d22530f4dbfa336f6e0ac925139543aed44cce7c3720fd51f69458705ac68cd4fe6b6b13abdc9746512969328454f18faf8c595f642477fe96bb2a941d5bcd1d4ac8cc49880708fa9b378e3c4f3a9060bee67cf9a4a4a695811051907e162753b56b0f6b410dba74d8a84b2a14b3144e0ef1284754fd17ed950d5965b4b9dd46582db1178d169c6bc465b0d6ff9ca3928fef5b9ae4e418fc15e83ebea0f87fa9ff5eed70050ded2849f47bf959d956850ce929851f0d8115f635b105ee2e4e15d04b2454bf6f4fadf034b10403119cd8e3b92fcc5b";

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Sha256::new();
    for p in parts {
        h.update(p);
    }
    h.finalize().into()
}

fn pad256(data: &[u8]) -> [u8; 256] {
    let mut out = [0u8; 256];
    out[256 - data.len()..].copy_from_slice(data);
    out
}

fn big(bytes: &[u8]) -> BigInt {
    BigInt::from_bytes_be(Sign::Plus, bytes)
}

/// Server half of the cloud-password check.
pub struct SrpServer {
    pub salt1: Vec<u8>,
    pub salt2: Vec<u8>,
    pub p: Vec<u8>,
    pub g: i32,
    pub srp_id: i64,
    verifier: BigInt,
    b: BigInt,
    pub g_b: [u8; 256],
}

impl SrpServer {
    pub fn new(password: &str) -> Self {
        let (salt1, salt2, g) = (b"first salt".to_vec(), b"second salt".to_vec(), 3i32);
        let p = hex::decode(SRP_PRIME).unwrap();
        let big_p = big(&p);
        let big_g = BigInt::from(g);
        let x = tgcore_client::two_factor_auth::password_hash(password.as_bytes(), &salt1, &salt2).unwrap();
        let verifier = big_g.modpow(&big(&x), &big_p);
        let k = big(&sha256(&[&p, &pad256(&g.to_be_bytes())]));
        let b = big(&[0x29; 256]);
        let g_b = pad256(&((&k * &verifier + big_g.modpow(&b, &big_p)) % &big_p).to_bytes_be().1);
        Self { salt1, salt2, p, g, srp_id: 0x5151, verifier, b, g_b }
    }

    pub fn account_password(&self, hint: &str) -> TlObject {
        let algo = object("passwordKdfAlgoSHA256SHA256PBKDF2HMACSHA512iter100000SHA256ModPow")
            .set("salt1", self.salt1.clone())
            .set("salt2", self.salt2.clone())
            .set("g", self.g)
            .set("p", self.p.clone())
            .build()
            .unwrap();
        object("account.password")
            .set("has_password", true)
            .set("current_algo", algo)
            .set("srp_B", self.g_b.to_vec())
            .set("srp_id", self.srp_id)
            .set("hint", hint)
            .set("new_algo", object("passwordKdfAlgoUnknown").build().unwrap())
            .set("new_secure_algo", object("securePasswordKdfAlgoUnknown").build().unwrap())
            .set("secure_random", vec![0u8; 32])
            .build()
            .unwrap()
    }

    /// Whether `inputCheckPasswordSRP` proves knowledge of the password.
    pub fn verify(&self, input: &TlObject) -> bool {
        if input.long("srp_id").unwrap() != self.srp_id {
            return false;
        }
        let g_a = pad256(input.bytes("A").unwrap());
        let big_p = big(&self.p);
        let u = big(&sha256(&[&g_a, &self.g_b]));
        let s = (big(&g_a) * self.verifier.modpow(&u, &big_p)).modpow(&self.b, &big_p);
        let k = sha256(&[&pad256(&s.to_bytes_be().1)]);

        let g_hash = pad256(&self.g.to_be_bytes());
        let (hp, hg) = (sha256(&[&self.p]), sha256(&[&g_hash]));
        let mut p_xg = [0u8; 32];
        for i in 0..32 {
            p_xg[i] = hp[i] ^ hg[i];
        }
        let expected = sha256(&[&p_xg, &sha256(&[&self.salt1]), &sha256(&[&self.salt2]), &g_a, &self.g_b, &k]);
        input.bytes("M1").unwrap() == expected
    }
}
