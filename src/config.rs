//! Connector and acceptor settings.
//!
//! Both sides share the framing limit and the size of the pool running reply
//! callbacks. Timeouts are held as [`Duration`]s; the `*_millis` setters accept the
//! millisecond values used by the protocol's configuration surface.
use std::{net::SocketAddr, time::Duration};

use crate::protocol::{
    codec::DEFAULT_MAX_FRAME_LENGTH,
    tls::{ServerIdentity, TrustPolicy},
};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 7000;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(60_000);
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_millis(240_000);
pub const DEFAULT_CALLBACK_THREADS: usize = 4;

/// Worker-side connection settings.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub host: String,
    pub port: u16,
    /// Negotiate TLS before exchanging frames. Requires `trust_policy`.
    pub ssl: bool,
    pub trust_policy: Option<TrustPolicy>,
    pub connect_timeout: Duration,
    /// Longest the connection may stay silent before it is considered broken.
    pub socket_timeout: Duration,
    pub max_frame_length: usize,
    pub callback_threads: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            ssl: false,
            trust_policy: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            callback_threads: DEFAULT_CALLBACK_THREADS,
        }
    }
}

impl ConnectorConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Enables TLS with the given trust policy.
    pub fn with_tls(mut self, policy: TrustPolicy) -> Self {
        self.ssl = true;
        self.trust_policy = Some(policy);
        self
    }

    pub fn with_connect_timeout_millis(mut self, millis: u64) -> Self {
        self.connect_timeout = Duration::from_millis(millis);
        self
    }

    pub fn with_socket_timeout_millis(mut self, millis: u64) -> Self {
        self.socket_timeout = Duration::from_millis(millis);
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn with_callback_threads(mut self, threads: usize) -> Self {
        self.callback_threads = threads;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Broker-side listening settings.
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    pub address: SocketAddr,
    /// Certificate and key to present; plain TCP when absent.
    pub identity: Option<ServerIdentity>,
    pub socket_timeout: Duration,
    pub max_frame_length: usize,
    pub callback_threads: usize,
}

impl AcceptorConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            identity: None,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            callback_threads: DEFAULT_CALLBACK_THREADS,
        }
    }

    pub fn with_identity(mut self, identity: ServerIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_socket_timeout_millis(mut self, millis: u64) -> Self {
        self.socket_timeout = Duration::from_millis(millis);
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn with_callback_threads(mut self, threads: usize) -> Self {
        self.callback_threads = threads;
        self
    }
}
