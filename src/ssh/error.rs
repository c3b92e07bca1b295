//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    /// Bad or missing credentials, unreadable or unparsable key material
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Network or proxy failure while establishing the transport
    #[error("Dial failed: {0}")]
    Dial(String),

    /// Pinned host key differs from the one presented by the server
    #[error(
        "SSH host key mismatch for {host}, possible man-in-the-middle attack!\n\
         Pinned fingerprint:   {pinned}\n\
         Observed fingerprint: {observed}\n\
         If the host was reinstalled or its key rotated, clear the pinned key and reconnect"
    )]
    HostKeyMismatch {
        host: String,
        pinned: String,
        observed: String,
    },

    #[error("Not connected: {0}")]
    NotConnected(String),

    /// A remote command or session could not be opened
    #[error("Session error: {0}")]
    Session(String),

    /// Read/write failure in the middle of a byte-stream copy
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// The command ran but exited non-zero
    #[error("Remote command exited with status {status}: {output}")]
    RemoteCommand { status: u32, output: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SshError {
    /// Whether a fresh connection might make the operation succeed.
    ///
    /// Credential and host-key failures are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SshError::NotConnected(_)
                | SshError::Session(_)
                | SshError::Protocol(_)
                | SshError::Io(_)
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::Auth(err.to_string())
    }
}
