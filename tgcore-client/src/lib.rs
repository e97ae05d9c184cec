//! # tgcore-client
//!
//! Async MTProto client core on top of [`tgcore_mtproto`].
//!
//! A [`Client`] owns one supervised connection to its home DC. Calls from
//! any number of tasks are multiplexed over it; the connection is rebuilt
//! after failures and outstanding calls are sent again in submission order.
//!
//! | Module            | Contents                                                  |
//! |-------------------|-----------------------------------------------------------|
//! | [`session`]       | Persisted auth keys, salts and update state; stores       |
//! | [`transport`]     | Byte-stream connectors and framing selection              |
//! | [`requests`]      | Typed requests usable with [`Client::invoke`]             |
//! | [`peers`]         | Marked chat ids                                           |
//! | [`types`]         | Summaries returned by the high-level calls                |
//! | [`two_factor_auth`] | SRP for cloud passwords                                 |
//!
//! ```no_run
//! use tgcore_client::{Client, Config, Settings};
//!
//! # async fn run() -> Result<(), tgcore_client::InvocationError> {
//! let settings = Settings { api_id: 12345, api_hash: "0123456789abcdef".into(), ..Settings::default() };
//! let client = Client::connect(Config::new(settings)).await?;
//! if !client.is_authorized().await? {
//!     let token = client.request_code("+15550100").await?;
//!     client.sign_in(&token, "12345", None).await?;
//! }
//! for dialog in client.get_dialogs(20).await? {
//!     println!("{} {}", dialog.id, dialog.name);
//! }
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

mod config;
mod dispatcher;
mod errors;
pub mod peers;
pub mod requests;
mod retry;
pub mod session;
pub mod transport;
pub mod two_factor_auth;
pub mod types;
mod updates;

pub use config::{Config, Settings};
pub use dispatcher::CallState;
pub use errors::{InvocationError, RpcError};
pub use peers::PeerRef;
pub use retry::{AutoSleep, NoRetries, RetryContext, RetryPolicy};
pub use session::{DcEntry, FileSessionStore, MemorySessionStore, SessionData, SessionStore, UpdateState};
pub use tgcore_tl::{RemoteCall, TlObject, TlValue};
pub use transport::{Connector, TcpConnector, TransportKind};
pub use types::{Dialog, DialogKind, LoginToken, Message, Sender, SentMessage, User, UserStatus};
pub use updates::{Backpressure, MessageDeletion, Subscription, Update};

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tgcore_tl::{Kind, Registry, Serializable};

use dispatcher::Dispatcher;
use peers::PeerCache;
use session::SessionHandle;
use updates::{UpdateEvent, UpdateHub, UpdateTask};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Client ───────────────────────────────────────────────────────────────────

struct ClientInner {
    settings: Settings,
    dispatcher: Dispatcher,
    session: Arc<SessionHandle>,
    peers: Arc<Mutex<PeerCache>>,
    hub: Arc<UpdateHub>,
    updates: mpsc::UnboundedSender<UpdateEvent>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A connected client. Cheap to clone; clones share the connection.
///
/// The connection closes when the last clone is dropped or on
/// [`disconnect`](Self::disconnect).
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    cancel: Option<CancellationToken>,
}

impl Client {
    // ── Connect ────────────────────────────────────────────────────────────

    /// Load the session, connect to its home DC (negotiating an auth key if
    /// there is none) and start the background tasks.
    pub async fn connect(config: Config) -> Result<Self, InvocationError> {
        let Config { settings, retry_policy, session_store, connector, trusted_keys } = config;

        let data = match session_store.load().map_err(InvocationError::Storage)? {
            Some(data) => {
                tracing::info!("[tgcore] loaded session from {} (DC{})", session_store.name(), data.home_dc_id);
                data
            }
            None => {
                tracing::info!("[tgcore] no saved session, starting at DC{}", settings.home_dc);
                SessionData::new(settings.home_dc, &settings.addresses())
            }
        };
        let home_dc = data.home_dc_id;
        let session = Arc::new(SessionHandle::new(data, session_store));

        let registry = Registry::embedded();
        let shutdown = CancellationToken::new();
        let (updates, update_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            settings.clone(),
            registry,
            Arc::clone(&session),
            retry_policy,
            updates.clone(),
            shutdown.clone(),
        )?;

        let first = dispatcher.establish(home_dc, connector.as_ref(), &trusted_keys).await?;
        let supervisor = tokio::spawn(dispatcher.clone().supervise(first, connector, trusted_keys));

        let peers = Arc::new(Mutex::new(PeerCache::default()));
        let hub = UpdateHub::new(settings.update_queue_capacity, settings.backpressure);
        let task = UpdateTask::new(dispatcher.clone(), Arc::clone(&peers), Arc::clone(&session), Arc::clone(&hub));
        let update_task = tokio::spawn(task.run(update_rx, shutdown.clone()));

        let inner = ClientInner {
            settings,
            dispatcher,
            session,
            peers,
            hub,
            updates,
            shutdown,
            tasks: Mutex::new(vec![supervisor, update_task]),
        };
        Ok(Self { inner: Arc::new(inner), cancel: None })
    }

    /// A handle whose calls fail with [`InvocationError::Cancelled`] once
    /// `token` is cancelled. Other handles are unaffected.
    pub fn cancellable(&self, token: CancellationToken) -> Self {
        Self { inner: Arc::clone(&self.inner), cancel: Some(token) }
    }

    /// Stop the connection. Pending calls fail with
    /// [`InvocationError::Disconnected`]; subscriptions end.
    pub async fn disconnect(&self) {
        self.inner.dispatcher.close();
        let tasks = std::mem::take(&mut *locked(&self.inner.tasks));
        for task in tasks {
            let _ = task.await;
        }
        if let Err(e) = self.inner.session.flush() {
            tracing::warn!("[tgcore] failed to save session: {e}");
        }
        tracing::info!("[tgcore] disconnected");
    }

    /// States of the calls in flight, oldest first.
    pub fn pending_calls(&self) -> Vec<CallState> {
        self.inner.dispatcher.pending_states()
    }

    /// A copy of the live session.
    pub fn session(&self) -> SessionData {
        self.inner.session.snapshot()
    }

    // ── Raw calls ──────────────────────────────────────────────────────────

    /// Invoke any function and return the decoded answer.
    ///
    /// Users and chats in the answer are remembered for later access
    /// hashes, and `Updates` answers are fed to subscribers.
    pub async fn invoke(&self, request: &impl RemoteCall) -> Result<TlValue, InvocationError> {
        let value = self.inner.dispatcher.call(request, self.cancel.as_ref()).await?;
        self.observe(&value);
        Ok(value)
    }

    /// Serialize `request` once for dispatching with [`dispatch`](Self::dispatch).
    pub fn prepare(&self, request: &impl RemoteCall) -> Result<PreparedCall, InvocationError> {
        let function = request.to_function()?;
        let kind = self
            .inner
            .dispatcher
            .registry()
            .return_kind(&function)
            .ok_or_else(|| InvocationError::MalformedData(format!("{} has no return type", function.name())))?;
        Ok(PreparedCall { body: function.to_bytes(), kind, state: AtomicU8::new(PREPARED) })
    }

    /// Send a prepared call. A call that already completed, or is being
    /// sent right now, fails with [`InvocationError::StaleCall`]; a failed
    /// call may be dispatched again.
    pub async fn dispatch(&self, call: &PreparedCall) -> Result<TlValue, InvocationError> {
        if call.state.compare_exchange(PREPARED, IN_FLIGHT, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(InvocationError::StaleCall);
        }
        let result = self.inner.dispatcher.invoke(&call.body, self.cancel.as_ref()).await.and_then(|bytes| {
            Ok(self.inner.dispatcher.registry().decode_as(&bytes, &call.kind)?)
        });
        match &result {
            Ok(value) => {
                call.state.store(COMPLETED, Ordering::Release);
                self.observe(value);
            }
            Err(_) => call.state.store(PREPARED, Ordering::Release),
        }
        result
    }

    async fn invoke_object(&self, request: &impl RemoteCall) -> Result<TlObject, InvocationError> {
        self.invoke(request)
            .await?
            .into_object()
            .ok_or_else(|| InvocationError::MalformedData("expected an object in the result".into()))
    }

    fn observe(&self, value: &TlValue) {
        let Some(object) = value.as_object() else { return };
        locked(&self.inner.peers).cache_response(object);
        if object.ty() == "Updates" {
            let _ = self.inner.updates.send(UpdateEvent::Push(object.clone()));
        }
    }

    // ── Auth ───────────────────────────────────────────────────────────────

    /// Whether the session's key is bound to an account.
    pub async fn is_authorized(&self) -> Result<bool, InvocationError> {
        match self.invoke(&requests::GetState {}).await {
            Ok(_) => Ok(true),
            Err(InvocationError::AuthRequired(e)) => {
                tracing::debug!("[tgcore] not authorized: {e}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Ask for a login code to be sent to `phone`.
    pub async fn request_code(&self, phone: &str) -> Result<LoginToken, InvocationError> {
        let request = requests::SendCode {
            phone_number: phone.to_owned(),
            api_id: self.inner.settings.api_id,
            api_hash: self.inner.settings.api_hash.clone(),
        };
        let sent = self.invoke_object(&request).await?;
        if sent.name() != "auth.sentCode" {
            return Err(InvocationError::MalformedData(format!("unexpected {} for auth.sendCode", sent.name())));
        }
        tracing::info!("[tgcore] login code sent");
        Ok(LoginToken { phone: phone.to_owned(), phone_code_hash: sent.string("phone_code_hash")?.to_owned() })
    }

    /// Sign in with the received code. If the account has a cloud password,
    /// `password` is checked as well; without one this fails with
    /// [`InvocationError::TwoFactorRequired`] and
    /// [`check_password`](Self::check_password) finishes the login.
    pub async fn sign_in(&self, token: &LoginToken, code: &str, password: Option<&str>) -> Result<User, InvocationError> {
        let request = requests::SignIn {
            phone_number: token.phone.clone(),
            phone_code_hash: token.phone_code_hash.clone(),
            phone_code: code.trim().to_owned(),
        };
        match self.invoke_object(&request).await {
            Ok(authorization) => self.finish_sign_in(&authorization),
            Err(e) if e.is("SESSION_PASSWORD_NEEDED") => match password {
                Some(password) => self.check_password(password).await,
                None => {
                    let info = self.invoke_object(&requests::GetPassword {}).await?;
                    let hint = info.opt_string("hint").map(str::to_owned);
                    Err(InvocationError::TwoFactorRequired { hint })
                }
            },
            Err(e) if e.is("PHONE_CODE_*") => Err(InvocationError::InvalidCode),
            Err(e) => Err(e),
        }
    }

    /// Finish a login that needs the cloud password.
    pub async fn check_password(&self, password: &str) -> Result<User, InvocationError> {
        let info = self.invoke_object(&requests::GetPassword {}).await?;
        let input = two_factor_auth::check_password_input(&info, password)?;
        let authorization = self.invoke_object(&requests::CheckPassword { password: input }).await?;
        self.finish_sign_in(&authorization)
    }

    fn finish_sign_in(&self, authorization: &TlObject) -> Result<User, InvocationError> {
        if authorization.name() == "auth.authorizationSignUpRequired" {
            return Err(InvocationError::SignUpRequired);
        }
        let user = authorization.object("user")?;
        locked(&self.inner.peers).cache_user(user);
        let user = User::from_tl(user)?;
        self.inner.session.update(|data| data.user_id = Some(user.id)).map_err(InvocationError::Storage)?;
        let _ = self.inner.updates.send(UpdateEvent::SignedIn);
        tracing::info!("[tgcore] signed in as {} ({})", user.full_name(), user.id);
        Ok(user)
    }

    /// Log out, delete the session and disconnect.
    pub async fn log_out(&self) -> Result<(), InvocationError> {
        match self.invoke(&requests::LogOut {}).await {
            Ok(_) => tracing::info!("[tgcore] logged out"),
            Err(e) if e.is("AUTH_KEY_UNREGISTERED") => tracing::debug!("[tgcore] already logged out"),
            Err(e) => return Err(e),
        }
        self.inner.session.delete().map_err(InvocationError::Storage)?;
        self.disconnect().await;
        Ok(())
    }

    // ── Account and chats ──────────────────────────────────────────────────

    /// The signed-in account.
    pub async fn get_self(&self) -> Result<User, InvocationError> {
        let users = self.invoke(&requests::GetSelf).await?;
        let user = users
            .as_vector()
            .and_then(|v| v.iter().filter_map(TlValue::as_object).find(|u| u.name() == "user"))
            .ok_or_else(|| InvocationError::MalformedData("users.getUsers returned no user".into()))?;
        locked(&self.inner.peers).cache_user(user);
        let user = User::from_tl(user)?;
        if self.inner.session.read(|d| d.user_id) != Some(user.id) {
            self.inner.session.update(|d| d.user_id = Some(user.id)).map_err(InvocationError::Storage)?;
        }
        Ok(user)
    }

    /// The first `limit` entries of the chat list.
    pub async fn get_dialogs(&self, limit: i32) -> Result<Vec<Dialog>, InvocationError> {
        let response = self.invoke_object(&requests::GetDialogs { limit }).await?;
        Ok(types::dialogs_from_tl(&response)?)
    }

    /// The latest `limit` text messages of `chat_id` (a marked id), newest
    /// first.
    pub async fn get_messages(&self, chat_id: i64, limit: i32) -> Result<Vec<Message>, InvocationError> {
        let peer = self.input_peer(chat_id)?;
        let response = self.invoke_object(&requests::GetHistory { peer, limit }).await?;
        Ok(types::messages_from_tl(&response)?)
    }

    /// Send a text message to `chat_id` (a marked id).
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<SentMessage, InvocationError> {
        let peer = self.input_peer(chat_id)?;
        let random_id = i64::from_le_bytes(tgcore_crypto::random_bytes());
        let request = requests::SendMessage { peer, message: text.to_owned(), random_id };
        let updates = self.invoke_object(&request).await?;
        let (id, date) = sent_message_id(&updates, random_id)?;
        Ok(SentMessage { id, text: text.to_owned(), date, chat_id })
    }

    fn input_peer(&self, chat_id: i64) -> Result<TlObject, InvocationError> {
        let peer = PeerRef::from_marked(chat_id)
            .ok_or_else(|| InvocationError::MalformedData(format!("{chat_id} is not a chat id")))?;
        let self_id = self.inner.session.read(|d| d.user_id);
        Ok(locked(&self.inner.peers).input_peer(peer, self_id)?)
    }

    // ── Updates ────────────────────────────────────────────────────────────

    /// Receive updates from now on. The first subscription also starts
    /// tracking the update state, fetching what was missed since the
    /// session last saw one.
    pub fn subscribe(&self) -> Subscription {
        let subscription = self.inner.hub.subscribe();
        let _ = self.inner.updates.send(UpdateEvent::Init);
        subscription
    }
}

/// Id and date of the message a `messages.sendMessage` answer describes.
fn sent_message_id(updates: &TlObject, random_id: i64) -> Result<(i32, i32), InvocationError> {
    match updates.name() {
        "updateShortSentMessage" => Ok((updates.int("id")?, updates.int("date")?)),
        "updates" | "updatesCombined" => {
            let list: Vec<&TlObject> = updates.vector("updates")?.iter().filter_map(TlValue::as_object).collect();
            let id = list
                .iter()
                .find(|u| u.name() == "updateMessageID" && u.opt_long("random_id") == Some(random_id))
                .map(|u| u.int("id"))
                .transpose()?
                .ok_or_else(|| InvocationError::MalformedData("no updateMessageID for the sent message".into()))?;
            let date = list
                .iter()
                .filter(|u| matches!(u.name(), "updateNewMessage" | "updateNewChannelMessage"))
                .filter_map(|u| u.opt_object("message"))
                .find(|m| m.opt_int("id") == Some(id))
                .and_then(|m| m.opt_int("date"))
                .unwrap_or(updates.int("date")?);
            Ok((id, date))
        }
        other => Err(InvocationError::MalformedData(format!("unexpected {other} for messages.sendMessage"))),
    }
}

// ─── PreparedCall ─────────────────────────────────────────────────────────────

const PREPARED: u8 = 0;
const IN_FLIGHT: u8 = 1;
const COMPLETED: u8 = 2;

/// A serialized request that can be dispatched until it succeeds once.
#[derive(Debug)]
pub struct PreparedCall {
    body: Vec<u8>,
    kind: Kind,
    state: AtomicU8,
}

impl PreparedCall {
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_id_update(id: i32, random_id: i64) -> TlValue {
        TlValue::Object(
            TlObject::builder("updateMessageID").unwrap().set("id", id).set("random_id", random_id).build().unwrap(),
        )
    }

    #[test]
    fn sent_id_from_short_answer() {
        let short = TlObject::builder("updateShortSentMessage")
            .unwrap()
            .set("out", true)
            .set("id", 40)
            .set("pts", 5)
            .set("pts_count", 1)
            .set("date", 1_700_000_000)
            .build()
            .unwrap();
        assert_eq!(sent_message_id(&short, 1).unwrap(), (40, 1_700_000_000));
    }

    #[test]
    fn sent_id_matches_random_id() {
        let updates = TlObject::builder("updates")
            .unwrap()
            .set("updates", vec![message_id_update(7, 111), message_id_update(8, 222)])
            .set("users", Vec::<TlValue>::new())
            .set("chats", Vec::<TlValue>::new())
            .set("date", 1_700_000_500)
            .set("seq", 0)
            .build()
            .unwrap();
        assert_eq!(sent_message_id(&updates, 222).unwrap(), (8, 1_700_000_500));
        assert!(sent_message_id(&updates, 333).is_err());
    }
}
