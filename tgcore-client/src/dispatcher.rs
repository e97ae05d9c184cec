//! RPC dispatch over a supervised connection.
//!
//! Every call lives in a table keyed by submission order until it completes,
//! fails, or its caller gives up. The table survives reconnects: when a new
//! link comes up, every outstanding call is sent again in submission order.
//!
//! Three tasks share the table:
//!
//! * the caller, which submits and waits on a oneshot channel;
//! * the supervisor, which connects, reads frames and reconnects;
//! * a writer per link, which drains an outbox of sealed frames.
//!
//! The table sits behind a single mutex that is never held across I/O.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tgcore_crypto::{AuthKey, rsa};
use tgcore_mtproto::envelope::{self, Envelope, Inbound};
use tgcore_mtproto::message_id::unix_now;
use tgcore_mtproto::{DecryptError, EncryptedSession, OutgoingMessage, SaltHistory};
use tgcore_tl::{LAYER, Registry, RemoteCall, Serializable, TlObject, TlValue};

use crate::config::Settings;
use crate::errors::{InvocationError, RpcError};
use crate::locked;
use crate::retry::{RetryContext, RetryPolicy};
use crate::session::SessionHandle;
use crate::transport::{Connection, Connector, FrameReader, FrameWriter, authenticate};
use crate::updates::UpdateEvent;

/// Results remembered after completion, to recognise duplicates.
const RECENT_RESULTS: usize = 512;
/// Request more salts when the announced ones run out within this many seconds.
const SALT_REFILL_MARGIN: i32 = 30 * 60;
const FUTURE_SALTS_WANTED: i32 = 32;

/// Where a call is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    /// Queued, not on the wire (no link, or waiting to be re-sent).
    Submitted,
    /// Sent; the server has not acknowledged it yet.
    AwaitingAck,
    /// Acknowledged; the result is pending.
    AwaitingResult,
    /// Waiting for the connection to move to another DC.
    Redirected,
    Completed,
    Failed,
}

type Reply = oneshot::Sender<Result<Vec<u8>, InvocationError>>;

struct PendingCall {
    body: Vec<u8>,
    tx: Option<Reply>,
    state: CallState,
    msg_id: Option<i64>,
    container_id: Option<i64>,
    redirects: u32,
}

struct Link {
    session: EncryptedSession,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    dc_id: i32,
    /// Set once the server answered a call on this link, which means it
    /// processed `initConnection`.
    init_confirmed: bool,
}

impl Link {
    fn push(&self, frame: Vec<u8>) {
        if self.outbox.send(frame).is_err() {
            tracing::debug!("[tgcore] writer gone, dropping frame");
        }
    }

    fn send_service(&mut self, body: &[u8], content_related: bool) -> i64 {
        let (frame, msg_id) = self.session.pack(body, content_related);
        self.push(frame);
        msg_id
    }

    fn crypto_state(&self) -> (i32, i64, Vec<i64>, i32) {
        let salts = self.session.salts();
        (self.dc_id, salts.current(), salts.previous().collect(), self.session.time_offset())
    }
}

#[derive(Default)]
struct RecentIds(VecDeque<i64>);

impl RecentIds {
    fn insert(&mut self, id: i64) {
        if self.0.len() == RECENT_RESULTS {
            self.0.pop_front();
        }
        self.0.push_back(id);
    }

    fn contains(&self, id: i64) -> bool {
        self.0.contains(&id)
    }
}

#[derive(Default)]
struct State {
    next_seq: u64,
    calls: BTreeMap<u64, PendingCall>,
    by_msg: HashMap<i64, u64>,
    link: Option<Link>,
    pending_acks: Vec<i64>,
    completed: RecentIds,
    migrate_to: Option<i32>,
    closed: bool,
}

impl State {
    /// Put call `seq` on the wire, piggybacking pending acks.
    fn transmit(&mut self, seq: u64, init_prefix: &[u8]) {
        let Some(link) = self.link.as_mut() else { return };
        let Some(call) = self.calls.get_mut(&seq) else { return };
        for old in call.msg_id.take().into_iter().chain(call.container_id.take()) {
            self.by_msg.remove(&old);
        }

        let body = if link.init_confirmed { call.body.clone() } else { [init_prefix, &call.body].concat() };
        let (msg_id, seq_no) = link.session.next_message(true);
        let mut messages = vec![OutgoingMessage { msg_id, seq_no, body }];
        if !self.pending_acks.is_empty() {
            let (ack_id, ack_seq) = link.session.next_message(false);
            let acks = envelope::msgs_ack(&std::mem::take(&mut self.pending_acks));
            messages.push(OutgoingMessage { msg_id: ack_id, seq_no: ack_seq, body: acks });
        }
        let (frame, outer_id) = link.session.pack_messages(&messages);
        link.push(frame);

        call.msg_id = Some(msg_id);
        call.state = CallState::AwaitingAck;
        self.by_msg.insert(msg_id, seq);
        if outer_id != msg_id {
            call.container_id = Some(outer_id);
            self.by_msg.insert(outer_id, seq);
        }
    }

    /// Re-send every call sent as `msg_id` or inside container `msg_id`.
    fn resend(&mut self, msg_id: i64, init_prefix: &[u8]) {
        if let Some(&seq) = self.by_msg.get(&msg_id) {
            self.transmit(seq, init_prefix);
        }
    }

    fn resend_all(&mut self, init_prefix: &[u8], only: impl Fn(&PendingCall) -> bool) {
        let seqs: Vec<u64> = self.calls.iter().filter(|(_, c)| only(c)).map(|(&s, _)| s).collect();
        for seq in seqs {
            self.transmit(seq, init_prefix);
        }
    }

    fn take_call(&mut self, msg_id: i64) -> Option<PendingCall> {
        let seq = self.by_msg.remove(&msg_id)?;
        let call = self.calls.remove(&seq)?;
        for id in call.msg_id.into_iter().chain(call.container_id) {
            self.by_msg.remove(&id);
        }
        Some(call)
    }

    fn complete(&mut self, msg_id: i64, result: Result<Vec<u8>, InvocationError>) {
        match self.take_call(msg_id) {
            Some(mut call) => {
                self.completed.insert(msg_id);
                if let Some(tx) = call.tx.take() {
                    let _ = tx.send(result);
                }
            }
            None if self.completed.contains(msg_id) => {
                tracing::debug!("[tgcore] duplicate result for {msg_id:#x} dropped");
            }
            None => tracing::debug!("[tgcore] result for unknown message {msg_id:#x} dropped"),
        }
    }

    fn redirect(&mut self, msg_id: i64, dc_id: i32, max_redirects: u32, init_prefix: &[u8]) {
        let Some(&seq) = self.by_msg.get(&msg_id) else { return };
        let Some(call) = self.calls.get_mut(&seq) else { return };
        call.redirects += 1;
        if call.redirects > max_redirects {
            tracing::warn!("[tgcore] giving up after {max_redirects} redirects");
            self.complete(msg_id, Err(InvocationError::TooManyRedirects { dc_id }));
            return;
        }
        if self.link.as_ref().is_some_and(|l| l.dc_id == dc_id) {
            self.transmit(seq, init_prefix);
            return;
        }
        call.state = CallState::Redirected;
        tracing::info!("[tgcore] redirected to DC{dc_id}");
        self.migrate_to = Some(dc_id);
    }

    /// Forget the link; calls wait for the next one.
    fn unlink(&mut self) -> Option<Link> {
        for call in self.calls.values_mut() {
            call.state = CallState::Submitted;
            call.msg_id = None;
            call.container_id = None;
        }
        self.by_msg.clear();
        self.pending_acks.clear();
        self.link.take()
    }

    fn fail_all(&mut self, error: impl Fn() -> InvocationError) {
        self.by_msg.clear();
        for (_, mut call) in std::mem::take(&mut self.calls) {
            if let Some(tx) = call.tx.take() {
                let _ = tx.send(Err(error()));
            }
        }
    }
}

// ─── Shared ───────────────────────────────────────────────────────────────────

pub(crate) struct Shared {
    state: Mutex<State>,
    registry: Arc<Registry>,
    settings: Settings,
    session: Arc<SessionHandle>,
    /// `invokeWithLayer(initConnection(...))` up to, not including, the query.
    init_prefix: Vec<u8>,
    /// Signals the supervisor that calls are waiting while it is idle.
    wake: Notify,
    migrate: Notify,
    updates: mpsc::UnboundedSender<UpdateEvent>,
    shutdown: CancellationToken,
}

fn build_init_prefix(settings: &Settings) -> Result<Vec<u8>, tgcore_tl::Error> {
    let init = TlObject::builder("initConnection")?
        .set("api_id", settings.api_id)
        .set("device_model", settings.device_model.as_str())
        .set("system_version", settings.system_version.as_str())
        .set("app_version", settings.app_version.as_str())
        .set("system_lang_code", settings.system_lang_code.as_str())
        .set("lang_pack", "")
        .set("lang_code", settings.lang_code.as_str())
        .set("query", TlValue::Raw(Vec::new()))
        .build()?;
    let wrapped = TlObject::builder("invokeWithLayer")?.set("layer", LAYER).set("query", init).build()?;
    Ok(wrapped.to_bytes())
}

impl Shared {
    fn submit(&self, body: Vec<u8>) -> Result<(u64, oneshot::Receiver<Result<Vec<u8>, InvocationError>>), InvocationError> {
        let (tx, rx) = oneshot::channel();
        let mut st = locked(&self.state);
        if st.closed {
            return Err(InvocationError::Disconnected);
        }
        let seq = st.next_seq;
        st.next_seq += 1;
        st.calls.insert(
            seq,
            PendingCall {
                body,
                tx: Some(tx),
                state: CallState::Submitted,
                msg_id: None,
                container_id: None,
                redirects: 0,
            },
        );
        if st.link.is_some() {
            st.transmit(seq, &self.init_prefix);
        } else {
            self.wake.notify_one();
        }
        Ok((seq, rx))
    }

    fn forget(&self, seq: u64) {
        let mut st = locked(&self.state);
        if let Some(call) = st.calls.remove(&seq) {
            for id in call.msg_id.into_iter().chain(call.container_id) {
                st.by_msg.remove(&id);
            }
        }
    }

    fn persist_crypto(&self, (dc_id, salt, previous, offset): (i32, i64, Vec<i64>, i32)) {
        self.session.update_in_background(|data| {
            if let Some(entry) = data.dc_mut(dc_id, || None) {
                entry.salt = salt;
                entry.previous_salts = previous;
                entry.time_offset = offset;
            }
        });
    }

    fn handle_frame(&self, frame: &[u8]) -> Result<(), InvocationError> {
        let mut persist = None;
        let migrate;
        {
            let mut st = locked(&self.state);
            let Some(link) = st.link.as_mut() else { return Ok(()) };
            let message = match link.session.unpack(frame) {
                Ok(m) => m,
                Err(e @ (DecryptError::Replay(_) | DecryptError::SessionMismatch { .. })) => {
                    tracing::debug!("[tgcore] dropping inbound frame: {e}");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let envelopes = match envelope::classify(&self.registry, message.msg_id, message.seq_no, &message.body) {
                Ok(envelopes) => envelopes,
                Err(e) => {
                    tracing::warn!("[tgcore] undecodable message {:#x}: {e}", message.msg_id);
                    st.pending_acks.push(message.msg_id);
                    Vec::new()
                }
            };

            for envelope in envelopes {
                if envelope.is_content_related() {
                    st.pending_acks.push(envelope.msg_id);
                }
                if self.handle_envelope(&mut st, envelope) {
                    persist = st.link.as_ref().map(Link::crypto_state);
                }
            }
            migrate = st.migrate_to.is_some();

            if !st.pending_acks.is_empty() {
                let acks = envelope::msgs_ack(&std::mem::take(&mut st.pending_acks));
                if let Some(link) = st.link.as_mut() {
                    link.send_service(&acks, false);
                }
            }
        }
        if let Some(state) = persist {
            self.persist_crypto(state);
        }
        if migrate {
            self.migrate.notify_one();
        }
        Ok(())
    }

    /// Returns whether the salt or clock changed.
    fn handle_envelope(&self, st: &mut State, envelope: Envelope) -> bool {
        let prefix = &self.init_prefix;
        match envelope.item {
            Inbound::RpcResult { req_msg_id, result } => {
                if let Some(link) = st.link.as_mut() {
                    link.init_confirmed = true;
                }
                st.complete(req_msg_id, Ok(result));
            }
            Inbound::RpcError { req_msg_id, error } => {
                let rpc = RpcError::from(&error);
                match rpc.migrate_dc() {
                    Some(dc_id) => st.redirect(req_msg_id, dc_id, self.settings.max_redirects, prefix),
                    None => st.complete(req_msg_id, Err(InvocationError::from(&error))),
                }
            }
            Inbound::Ack { msg_ids } => {
                for id in msg_ids {
                    let Some(&seq) = st.by_msg.get(&id) else { continue };
                    if let Some(call) = st.calls.get_mut(&seq).filter(|c| c.state == CallState::AwaitingAck) {
                        call.state = CallState::AwaitingResult;
                    }
                }
            }
            Inbound::BadServerSalt { bad_msg_id, new_salt } => {
                tracing::debug!("[tgcore] bad_server_salt, switching to {new_salt:#x}");
                if let Some(link) = st.link.as_mut() {
                    link.session.salts_mut().rotate(new_salt);
                }
                st.resend(bad_msg_id, prefix);
                return true;
            }
            Inbound::BadMessage { bad_msg_id, code } => match code {
                16 | 17 => {
                    if let Some(link) = st.link.as_mut() {
                        link.session.sync_time(envelope.msg_id);
                    }
                    st.resend(bad_msg_id, prefix);
                    return true;
                }
                32 | 33 => {
                    tracing::info!("[tgcore] bad_msg_notification {code}, starting a new session");
                    if let Some(link) = st.link.as_mut() {
                        link.session.reset();
                    }
                    st.resend_all(prefix, |_| true);
                }
                _ => {
                    tracing::warn!("[tgcore] bad_msg_notification {code} for {bad_msg_id:#x}");
                    st.complete(bad_msg_id, Err(InvocationError::BadMessage(code)));
                }
            },
            Inbound::NewSession { first_msg_id, server_salt } => {
                tracing::debug!("[tgcore] new session created, first message {first_msg_id:#x}");
                if let Some(link) = st.link.as_mut() {
                    link.session.salts_mut().rotate(server_salt);
                }
                st.resend_all(prefix, |c| c.msg_id.is_some_and(|id| id < first_msg_id));
                return true;
            }
            Inbound::Pong { msg_id, ping_id } => {
                if st.by_msg.contains_key(&msg_id) {
                    let pong = TlObject::builder("pong")
                        .and_then(|b| b.set("msg_id", msg_id).set("ping_id", ping_id).build());
                    st.complete(msg_id, pong.map(|p| p.to_bytes()).map_err(Into::into));
                }
            }
            Inbound::FutureSalts { req_msg_id, now, salts } => {
                tracing::debug!("[tgcore] received {} future salts", salts.len());
                if st.by_msg.contains_key(&req_msg_id) {
                    let encoded = encode_future_salts(req_msg_id, now, &salts);
                    st.complete(req_msg_id, encoded.map_err(Into::into));
                }
                if let Some(link) = st.link.as_mut() {
                    let salts_mut = link.session.salts_mut();
                    salts_mut.add_future(salts);
                    return salts_mut.refresh(now).is_some();
                }
            }
            Inbound::DetailedInfo { answer_msg_id } => st.pending_acks.push(answer_msg_id),
            Inbound::Updates(updates) => {
                let _ = self.updates.send(UpdateEvent::Push(updates));
            }
            Inbound::Other(object) => tracing::debug!("[tgcore] unhandled {}", object.name()),
        }
        false
    }

    /// Keep-alive ping, plus salt upkeep.
    fn ping(&self) {
        let mut persist = None;
        {
            let mut st = locked(&self.state);
            let Some(link) = st.link.as_mut() else { return };
            let delay = (self.settings.ping_interval().as_secs() + 15) as i32;
            let ping_id = i64::from_le_bytes(tgcore_crypto::random_bytes());
            link.send_service(&envelope::ping_delay_disconnect(ping_id, delay), true);

            let server_now = (unix_now().0 + i64::from(link.session.time_offset())) as i32;
            let salts = link.session.salts_mut();
            if salts.refresh(server_now).is_some() {
                persist = Some(link.crypto_state());
            }
            let salts = link.session.salts();
            if salts.remaining_validity(server_now).is_none_or(|left| left < SALT_REFILL_MARGIN) {
                link.send_service(&envelope::get_future_salts(FUTURE_SALTS_WANTED), true);
            }
        }
        if let Some(state) = persist {
            self.persist_crypto(state);
        }
    }

    fn unlink(&self) {
        let link = locked(&self.state).unlink();
        if let Some(link) = link {
            self.persist_crypto(link.crypto_state());
        }
    }

    fn is_closed(&self) -> bool {
        locked(&self.state).closed
    }
}

fn encode_future_salts(
    req_msg_id: i64,
    now: i32,
    salts: &[tgcore_mtproto::FutureSalt],
) -> Result<Vec<u8>, tgcore_tl::Error> {
    let items = salts
        .iter()
        .map(|s| {
            TlObject::builder("future_salt")?
                .set("valid_since", s.valid_since)
                .set("valid_until", s.valid_until)
                .set("salt", s.salt)
                .build()
                .map(TlValue::BareObject)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let object = TlObject::builder("future_salts")?
        .set("req_msg_id", req_msg_id)
        .set("now", now)
        .set("salts", TlValue::BareVector(items))
        .build()?;
    Ok(object.to_bytes())
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

/// Handle to the call table, cloned into every [`Client`](crate::Client).
#[derive(Clone)]
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    policy: Arc<dyn RetryPolicy>,
}

/// An established link, ready to be driven by the supervisor.
pub(crate) struct LinkIo {
    reader: FrameReader,
    link_down: CancellationToken,
}

enum Exit {
    Shutdown,
    Migrate(i32),
    Lost(InvocationError),
}

impl Dispatcher {
    pub fn new(
        settings: Settings,
        registry: Arc<Registry>,
        session: Arc<SessionHandle>,
        policy: Arc<dyn RetryPolicy>,
        updates: mpsc::UnboundedSender<UpdateEvent>,
        shutdown: CancellationToken,
    ) -> Result<Self, InvocationError> {
        let init_prefix = build_init_prefix(&settings)?;
        let shared = Shared {
            state: Mutex::new(State::default()),
            registry,
            settings,
            session,
            init_prefix,
            wake: Notify::new(),
            migrate: Notify::new(),
            updates,
            shutdown,
        };
        Ok(Self { shared: Arc::new(shared), policy })
    }

    /// States of the calls still in flight, in submission order.
    pub fn pending_states(&self) -> Vec<CallState> {
        locked(&self.shared.state).calls.values().map(|c| c.state).collect()
    }

    /// Send a serialized call and wait for its result, retrying per the
    /// policy.
    pub async fn invoke(&self, body: &[u8], cancel: Option<&CancellationToken>) -> Result<Vec<u8>, InvocationError> {
        let mut fail_count = NonZeroU32::MIN;
        let mut slept_so_far = Duration::ZERO;
        loop {
            let error = match self.call_once(body.to_vec(), cancel).await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };
            if matches!(error, InvocationError::Cancelled) || self.shared.is_closed() {
                return Err(error);
            }
            let ctx = RetryContext { fail_count, slept_so_far, error };
            match self.policy.should_retry(&ctx) {
                ControlFlow::Continue(delay) => {
                    self.sleep(delay, cancel).await?;
                    slept_so_far += delay;
                    fail_count = fail_count.saturating_add(1);
                }
                ControlFlow::Break(()) => return Err(ctx.error),
            }
        }
    }

    /// Invoke a typed request and decode the answer by the function's
    /// return type.
    pub async fn call(&self, request: &impl RemoteCall, cancel: Option<&CancellationToken>) -> Result<TlValue, InvocationError> {
        let function = request.to_function()?;
        let registry = &self.shared.registry;
        let kind = registry
            .return_kind(&function)
            .ok_or_else(|| InvocationError::MalformedData(format!("{} has no return type", function.name())))?;
        let bytes = self.invoke(&function.to_bytes(), cancel).await?;
        Ok(registry.decode_as(&bytes, &kind)?)
    }

    /// Like [`call`](Self::call), for functions returning a boxed object.
    pub async fn call_object(&self, request: &impl RemoteCall, cancel: Option<&CancellationToken>) -> Result<TlObject, InvocationError> {
        let value = self.call(request, cancel).await?;
        value
            .into_object()
            .ok_or_else(|| InvocationError::MalformedData("expected an object in the result".into()))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    async fn call_once(&self, body: Vec<u8>, cancel: Option<&CancellationToken>) -> Result<Vec<u8>, InvocationError> {
        let (seq, rx) = self.shared.submit(body)?;
        let _guard = Forget { shared: &self.shared, seq };
        let wait = async {
            match timeout(self.shared.settings.request_timeout(), rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(InvocationError::Disconnected),
                Err(_) => Err(InvocationError::Timeout),
            }
        };
        match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(InvocationError::Cancelled),
                result = wait => result,
            },
            None => wait.await,
        }
    }

    async fn sleep(&self, delay: Duration, cancel: Option<&CancellationToken>) -> Result<(), InvocationError> {
        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);
        tokio::select! {
            _ = cancel.cancelled() => Err(InvocationError::Cancelled),
            _ = self.shared.shutdown.cancelled() => Err(InvocationError::Disconnected),
            _ = sleep(delay) => Ok(()),
        }
    }

    /// Connect to `dc_id`, negotiating a key if the DC has none, and make
    /// the link current. Outstanding calls are sent at once.
    pub async fn establish(
        &self,
        dc_id: i32,
        connector: &dyn Connector,
        trusted: &[rsa::Key],
    ) -> Result<LinkIo, InvocationError> {
        let shared = &self.shared;
        let addresses = shared.settings.addresses();
        let entry = shared
            .session
            .update(|data| data.dc_mut(dc_id, || addresses.get(&dc_id).cloned()).map(|e| e.clone()))
            .map_err(InvocationError::Storage)?
            .ok_or_else(|| {
                InvocationError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address known for DC{dc_id}"),
                ))
            })?;

        let connect_timeout = shared.settings.connect_timeout();
        let mut conn = timeout(connect_timeout, Connection::open(connector, &shared.settings.transport, dc_id, &entry.addr))
            .await
            .map_err(|_| InvocationError::Timeout)??;

        let (auth_key, salts, time_offset) = match entry.auth_key {
            Some(key) => (AuthKey::from_bytes(key), SaltHistory::from_parts(entry.salt, entry.previous_salts), entry.time_offset),
            None => {
                tracing::info!("[tgcore] no auth key for DC{dc_id}, negotiating one");
                let finished = timeout(connect_timeout, authenticate(&mut conn, &shared.registry, trusted))
                    .await
                    .map_err(|_| InvocationError::Timeout)??;
                let key = finished.auth_key.to_bytes();
                shared
                    .session
                    .update(|data| {
                        if let Some(entry) = data.dc_mut(dc_id, || None) {
                            entry.auth_key = Some(key);
                            entry.salt = finished.first_salt;
                            entry.previous_salts.clear();
                            entry.time_offset = finished.time_offset;
                        }
                    })
                    .map_err(InvocationError::Storage)?;
                (finished.auth_key, SaltHistory::new(finished.first_salt), finished.time_offset)
            }
        };

        let session = EncryptedSession::new(auth_key, salts, time_offset, shared.settings.session_options());
        let (reader, writer) = conn.into_split();
        let (outbox, frames) = mpsc::unbounded_channel();
        let link_down = CancellationToken::new();
        tokio::spawn(write_loop(writer, frames, link_down.clone()));

        let mut st = locked(&shared.state);
        st.link = Some(Link { session, outbox, dc_id, init_confirmed: false });
        st.migrate_to = None;
        st.resend_all(&shared.init_prefix, |_| true);
        tracing::info!("[tgcore] connected to DC{dc_id} ({} calls outstanding)", st.calls.len());
        Ok(LinkIo { reader, link_down })
    }

    /// Keep a link up until shutdown, reconnecting per the retry policy.
    pub async fn supervise(self, first: LinkIo, connector: Arc<dyn Connector>, trusted: Vec<rsa::Key>) {
        let shared = Arc::clone(&self.shared);
        let mut link = Some(first);
        let mut fail_count = NonZeroU32::MIN;
        let mut slept_so_far = Duration::ZERO;

        loop {
            let io = match link.take() {
                Some(io) => io,
                None => {
                    let home = shared.session.read(|d| d.home_dc_id);
                    let target = locked(&shared.state).migrate_to.unwrap_or(home);
                    let attempt = tokio::select! {
                        _ = shared.shutdown.cancelled() => break,
                        attempt = self.establish(target, connector.as_ref(), &trusted) => attempt,
                    };
                    match attempt {
                        Ok(io) => {
                            fail_count = NonZeroU32::MIN;
                            slept_so_far = Duration::ZERO;
                            let _ = shared.updates.send(UpdateEvent::Reconnected);
                            io
                        }
                        Err(error) => {
                            tracing::warn!("[tgcore] reconnect to DC{target} failed: {error}");
                            let ctx = RetryContext { fail_count, slept_so_far, error };
                            match self.policy.should_retry(&ctx) {
                                ControlFlow::Continue(delay) => {
                                    fail_count = fail_count.saturating_add(1);
                                    slept_so_far += delay;
                                    tokio::select! {
                                        _ = shared.shutdown.cancelled() => break,
                                        _ = sleep(delay) => {}
                                    }
                                }
                                ControlFlow::Break(()) => {
                                    tracing::warn!("[tgcore] giving up reconnecting until new calls arrive");
                                    locked(&shared.state).fail_all(|| replicate(&ctx.error));
                                    fail_count = NonZeroU32::MIN;
                                    slept_so_far = Duration::ZERO;
                                    tokio::select! {
                                        _ = shared.shutdown.cancelled() => break,
                                        _ = shared.wake.notified() => {}
                                    }
                                }
                            }
                            continue;
                        }
                    }
                }
            };

            let exit = self.drive(io).await;
            shared.unlink();
            match exit {
                Exit::Shutdown => break,
                Exit::Migrate(dc_id) => {
                    if let Err(e) = shared.session.update(|d| d.home_dc_id = dc_id) {
                        tracing::warn!("[tgcore] failed to save session: {e}");
                    }
                    locked(&shared.state).migrate_to = Some(dc_id);
                }
                Exit::Lost(InvocationError::Transport(-404)) => {
                    let dc_id = shared.session.read(|d| d.home_dc_id);
                    tracing::warn!("[tgcore] DC{dc_id} does not know our auth key, dropping it");
                    let dropped = shared.session.update(|d| {
                        if let Some(entry) = d.dc_mut(dc_id, || None) {
                            entry.auth_key = None;
                        }
                    });
                    if let Err(e) = dropped {
                        tracing::warn!("[tgcore] failed to save session: {e}");
                    }
                }
                Exit::Lost(error) => tracing::info!("[tgcore] connection lost: {error}"),
            }
        }

        let mut st = locked(&shared.state);
        st.closed = true;
        st.unlink();
        st.fail_all(|| InvocationError::Disconnected);
        tracing::debug!("[tgcore] supervisor stopped");
    }

    async fn drive(&self, mut io: LinkIo) -> Exit {
        let shared = &self.shared;
        let period = shared.settings.ping_interval();
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => return Exit::Shutdown,
                _ = io.link_down.cancelled() => return Exit::Lost(InvocationError::Disconnected),
                _ = shared.migrate.notified() => {
                    if let Some(dc_id) = locked(&shared.state).migrate_to.take() {
                        return Exit::Migrate(dc_id);
                    }
                }
                _ = ping.tick() => shared.ping(),
                frame = io.reader.recv() => {
                    let result = frame.and_then(|frame| shared.handle_frame(&frame));
                    if let Err(error) = result {
                        return Exit::Lost(error);
                    }
                }
            }
        }
    }

    /// Stop the supervisor and fail everything still pending.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
        let mut st = locked(&self.shared.state);
        st.closed = true;
        st.fail_all(|| InvocationError::Disconnected);
    }
}

/// Removes a call from the table when its caller stops waiting.
struct Forget<'a> {
    shared: &'a Shared,
    seq: u64,
}

impl Drop for Forget<'_> {
    fn drop(&mut self) {
        self.shared.forget(self.seq);
    }
}

async fn write_loop(mut writer: FrameWriter, mut frames: mpsc::UnboundedReceiver<Vec<u8>>, link_down: CancellationToken) {
    while let Some(frame) = frames.recv().await {
        if writer.send(&frame).await.is_err() {
            link_down.cancel();
            break;
        }
    }
}

/// A copy of `error` for each failed call, where it can be copied.
fn replicate(error: &InvocationError) -> InvocationError {
    match error {
        InvocationError::UntrustedServer { fingerprints } => {
            InvocationError::UntrustedServer { fingerprints: fingerprints.clone() }
        }
        InvocationError::Transport(code) => InvocationError::Transport(*code),
        InvocationError::Timeout => InvocationError::Timeout,
        InvocationError::MalformedData(s) => InvocationError::MalformedData(s.clone()),
        _ => InvocationError::Disconnected,
    }
}
