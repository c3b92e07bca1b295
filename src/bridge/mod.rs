//! Terminal / VNC WebSocket bridge
//!
//! Local frontends open `/ws/terminal` or `/ws/vnc`; each accepted socket is
//! wired to a PTY shell or a tunneled TCP port on a pooled connection.
//! Failures before the upgrade are answered with a plain HTTP status.

pub mod relay;
pub mod request;
mod server;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::warn;

use crate::ssh::SshError;

pub use relay::{decode_resize, encode_resize, relay_terminal, relay_tunnel, SocketMessage, TeardownLatch};
pub use request::{TerminalParams, VncParams};
pub use server::{router, BridgeConfig, BridgeServer};

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Origin not allowed: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The host, its session or the tunneled port could not be reached
    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// HTTP status sent before the upgrade
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::Forbidden(_) => StatusCode::FORBIDDEN,
            BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::Upstream(_) => StatusCode::BAD_GATEWAY,
            BridgeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!("Bridge request rejected ({}): {}", status.as_u16(), self);
        (status, format!("{}\n", self)).into_response()
    }
}

impl From<SshError> for BridgeError {
    fn from(err: SshError) -> Self {
        BridgeError::Upstream(err.to_string())
    }
}
