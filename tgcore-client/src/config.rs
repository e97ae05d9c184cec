//! Client configuration.
//!
//! [`Settings`] is plain data and can be loaded from a file (with the
//! `serde` feature). [`Config`] adds the pluggable policies.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tgcore_crypto::rsa;
use tgcore_mtproto::SessionOptions;

use crate::retry::{AutoSleep, RetryPolicy};
use crate::session::{FileSessionStore, SessionStore, default_dc_addresses};
use crate::transport::{Connector, TcpConnector, TransportKind};
use crate::updates::Backpressure;

/// Tunables of a client.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(default))]
pub struct Settings {
    pub api_id: i32,
    pub api_hash: String,
    /// DC used when the session has none recorded.
    pub home_dc: i32,
    /// Address table; overrides entries of the built-in one.
    pub dc_addresses: BTreeMap<i32, String>,
    pub transport: TransportKind,

    pub device_model: String,
    pub system_version: String,
    pub app_version: String,
    pub system_lang_code: String,
    pub lang_code: String,

    /// Inbound message ids further than this from server time are dropped.
    pub clock_skew_window_secs: u64,
    pub max_redirects: u32,
    pub ping_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub flood_sleep_threshold_secs: u64,
    pub max_retries: u32,
    /// Capacity of each update subscription.
    pub update_queue_capacity: usize,
    pub backpressure: Backpressure,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_id: 0,
            api_hash: String::new(),
            home_dc: 2,
            dc_addresses: default_dc_addresses(),
            transport: TransportKind::default(),
            device_model: "Linux".into(),
            system_version: "1.0".into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
            system_lang_code: "en".into(),
            lang_code: "en".into(),
            clock_skew_window_secs: 300,
            max_redirects: 5,
            ping_interval_secs: 60,
            request_timeout_secs: 60,
            connect_timeout_secs: 15,
            flood_sleep_threshold_secs: 60,
            max_retries: 5,
            update_queue_capacity: 256,
            backpressure: Backpressure::default(),
        }
    }
}

impl Settings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub(crate) fn session_options(&self) -> SessionOptions {
        SessionOptions { clock_skew_window: self.clock_skew_window_secs, ..SessionOptions::default() }
    }

    /// The built-in address table with this configuration's overrides applied.
    pub(crate) fn addresses(&self) -> BTreeMap<i32, String> {
        let mut table = default_dc_addresses();
        table.extend(self.dc_addresses.iter().map(|(id, addr)| (*id, addr.clone())));
        table
    }
}

/// Everything needed to build a [`Client`](crate::Client).
#[derive(Clone)]
pub struct Config {
    pub settings: Settings,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub session_store: Arc<dyn SessionStore>,
    pub connector: Arc<dyn Connector>,
    /// RSA keys a server may present during key exchange.
    pub trusted_keys: Vec<rsa::Key>,
}

impl Config {
    /// Defaults derived from `settings`: automatic sleeping with its
    /// thresholds, a `tgcore.session` file, plain TCP and the production key.
    pub fn new(settings: Settings) -> Self {
        let retry_policy = AutoSleep {
            flood_sleep_threshold: Duration::from_secs(settings.flood_sleep_threshold_secs),
            max_retries: settings.max_retries,
            ..AutoSleep::default()
        };
        Self {
            settings,
            retry_policy: Arc::new(retry_policy),
            session_store: Arc::new(FileSessionStore::new("tgcore.session")),
            connector: Arc::new(TcpConnector),
            trusted_keys: vec![rsa::Key::production()],
        }
    }

    pub fn with_session_store(mut self, store: impl SessionStore + 'static) -> Self {
        self.session_store = Arc::new(store);
        self
    }

    pub fn with_connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn with_retry_policy(mut self, policy: impl RetryPolicy) -> Self {
        self.retry_policy = Arc::new(policy);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_extend_builtin_table() {
        let mut settings = Settings::default();
        settings.dc_addresses = [(2, "127.0.0.1:4430".to_string()), (9, "10.0.0.9:443".to_string())].into();
        let table = settings.addresses();
        assert_eq!(table[&1], "149.154.175.53:443");
        assert_eq!(table[&2], "127.0.0.1:4430");
        assert_eq!(table[&9], "10.0.0.9:443");
    }

    #[test]
    fn session_options_follow_clock_window() {
        let settings = Settings { clock_skew_window_secs: 30, ..Settings::default() };
        assert_eq!(settings.session_options().clock_skew_window, 30);
    }
}
