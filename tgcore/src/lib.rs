//! # tgcore: MTProto client core
//!
//! The workspace crates, wired together for convenience:
//!
//! | Sub-crate        | Role                                                   |
//! |------------------|--------------------------------------------------------|
//! | `tgcore-tl`      | Schema registry, dynamic TL objects, wire codec        |
//! | `tgcore-crypto`  | AES-IGE, SHA, RSA, factorization, AuthKey              |
//! | `tgcore-mtproto` | Key exchange, encrypted sessions, framing, envelopes   |
//! | `tgcore-client`  | Async client: dispatcher, updates, session storage     |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tgcore::{Client, Config, Settings};
//!
//! # async fn run() -> Result<(), tgcore::InvocationError> {
//! let settings = Settings { api_id: 12345, api_hash: "0123456789abcdef".into(), ..Settings::default() };
//! let client = Client::connect(Config::new(settings)).await?;
//! if client.is_authorized().await? {
//!     for dialog in client.get_dialogs(10).await? {
//!         println!("{}: {}", dialog.id, dialog.name);
//!     }
//! }
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Raw calls
//!
//! Any schema function can be built and sent without a typed wrapper:
//!
//! ```rust,no_run
//! # async fn run(client: tgcore::Client) -> Result<(), tgcore::InvocationError> {
//! let call = tgcore::TlObject::builder("help.getNearestDc")?.build()?;
//! let nearest = client.invoke(&call).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Re-export of [`tgcore_tl`]: schema registry and TL values.
pub use tgcore_tl as tl;

/// Re-export of [`tgcore_mtproto`]: key exchange, sessions, framing.
pub use tgcore_mtproto as mtproto;

/// Re-export of [`tgcore_crypto`]: primitives and the auth key.
pub use tgcore_crypto as crypto;

/// Re-export of [`tgcore_client`]: the async client.
pub use tgcore_client as client;

// ─── Convenience re-exports ───────────────────────────────────────────────────

pub use tgcore_tl::{Deserializable, LAYER, Registry, RemoteCall, Serializable, TlObject, TlValue};

pub use tgcore_client::{
    Backpressure, Client, Config, Dialog, DialogKind, InvocationError, LoginToken, Message, RpcError, SentMessage,
    Settings, Subscription, Update, User,
};
pub use tgcore_client::session::{FileSessionStore, MemorySessionStore, SessionStore};

pub use tgcore_crypto::AuthKey;
pub use tgcore_mtproto::EncryptedSession;
