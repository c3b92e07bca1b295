//! SSH Configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-host connection parameters
///
/// Owned by the caller; a [`Connection`](super::Connection) keeps its own
/// copy for its lifetime and never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    #[serde(default)]
    pub auth: AuthMethod,

    /// Base64 encoded raw public key pinned on a previous contact.
    /// Empty means first contact: any key is accepted and recorded.
    #[serde(default)]
    pub host_key: String,

    /// Optional SOCKS5 proxy (`host:port`). Empty or absent dials directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_addr: Option<String>,

    /// Handshake timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file. Empty picks the first default key found.
        #[serde(default)]
        key_path: String,
        /// Host password, also used as the passphrase of an encrypted key
        #[serde(default, alias = "passphrase")]
        password: Option<String>,
    },
}

impl Default for AuthMethod {
    fn default() -> Self {
        Self::Key {
            key_path: String::new(),
            password: None,
        }
    }
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, password: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            password,
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth,
            host_key: String::new(),
            proxy_addr: None,
            timeout_secs: default_timeout(),
        }
    }

    /// Pin a host key (base64 of the raw key bytes)
    pub fn with_host_key(mut self, host_key: impl Into<String>) -> Self {
        self.host_key = host_key.into();
        self
    }

    /// Route the TCP connection through a SOCKS5 proxy
    pub fn with_proxy(mut self, proxy_addr: impl Into<String>) -> Self {
        self.proxy_addr = Some(proxy_addr.into());
        self
    }

    /// `host:port` as dialed
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Proxy address, treating an empty string as "no proxy"
    pub fn proxy(&self) -> Option<&str> {
        self.proxy_addr.as_deref().filter(|p| !p.trim().is_empty())
    }
}

/// Retry policy for operations that open a fresh remote session
///
/// `max_attempts` counts the first try, so the default of 2 means one
/// reconnect-and-retry after a stale-session failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: 0,
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Never retry
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, initial_ms: u64, multiplier: f64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.multiplier = multiplier;
        self.max_backoff_ms = max_ms;
        self
    }

    /// Delay before retry number `retry` (0-based, exponential backoff)
    pub fn backoff(&self, retry: u32) -> Duration {
        let delay_ms = (self.initial_backoff_ms as f64 * self.multiplier.powi(retry as i32))
            .min(self.max_backoff_ms as f64);
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// First existing default private key, in OpenSSH preference order
pub fn default_key_path() -> PathBuf {
    let ssh_dir = dirs::home_dir()
        .map(|h| h.join(".ssh"))
        .unwrap_or_else(|| PathBuf::from(".ssh"));

    ["id_ed25519", "id_rsa", "id_ecdsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|p| p.exists())
        .unwrap_or_else(|| ssh_dir.join("id_rsa"))
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    2
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    5_000
}
