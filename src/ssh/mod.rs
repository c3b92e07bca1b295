//! SSH module - persistent transports to hypervisor hosts
//!
//! This module provides the remote session layer using the russh library.
//!
//! # Features
//! - One reconnecting [`Connection`] per host, pooled by [`ConnectionPool`]
//! - Trust-on-first-use host key pinning
//! - Command execution, PTY shells, tunneled TCP dials, streamed uploads
//! - Optional SOCKS5 proxy for the initial TCP hop

mod client;
mod config;
mod error;
pub mod escape;
mod handle_owner;
pub mod host_key;
mod pool;
mod proxy;
mod session;

#[cfg(test)]
pub(crate) mod test_server;

pub use client::{ClientHandler, CommandOutput, Connection, TunnelStream};
pub use config::{default_key_path, expand_tilde, AuthMethod, ConnectionConfig, RetryPolicy};
pub use error::SshError;
pub use escape::shell_quote;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use host_key::{fingerprint_sha256, verify_pinned, HostKeyVerification};
pub use pool::ConnectionPool;
pub use proxy::connect_via_socks5;
pub use session::{
    spawn_channel_task, SessionCommand, StderrMode, ShellInput, ShellOutput, ShellSession,
};
