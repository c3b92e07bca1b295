//! SSH Connection implementation using russh
//!
//! A [`Connection`] is one resilient, authenticated transport to a single
//! host. Operations that need a fresh remote session reconnect lazily when
//! the transport is missing, and retry stale-session failures according to
//! the configured [`RetryPolicy`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use russh::client::{self, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey, PublicKeyBase64};
use russh::{Channel, ChannelMsg, ChannelStream, Pty};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{default_key_path, expand_tilde, AuthMethod, ConnectionConfig, RetryPolicy};
use super::error::SshError;
use super::escape::shell_quote;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::host_key::{encode_host_key, fingerprint_sha256, verify_pinned, HostKeyVerification};
use super::session::{spawn_channel_task, ShellSession, StderrMode};

/// Chunk size for [`Connection::write_file`]
const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// Tunneled socket returned by [`Connection::dial`]
pub type TunnelStream = ChannelStream<Msg>;

/// Output of a remote command: stdout and stderr combined, trimmed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    /// `None` if the server closed the channel without reporting a status
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// Turn a non-zero exit into [`SshError::RemoteCommand`]
    pub fn into_result(self) -> Result<String, SshError> {
        if self.success() {
            Ok(self.output)
        } else {
            Err(SshError::RemoteCommand {
                // A missing status is reported like a generic failure
                status: self.exit_status.unwrap_or(u32::MAX),
                output: self.output,
            })
        }
    }
}

/// Client handler for russh callbacks
///
/// Records the server key of every handshake and enforces the pinned key.
pub struct ClientHandler {
    label: String,
    pinned_key: String,
    observed_key: Arc<SyncMutex<Option<Vec<u8>>>>,
}

impl ClientHandler {
    fn new(label: String, pinned_key: String, observed_key: Arc<SyncMutex<Option<Vec<u8>>>>) -> Self {
        Self {
            label,
            pinned_key,
            observed_key,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let raw = server_public_key.public_key_bytes();
        *self.observed_key.lock() = Some(raw.clone());

        match verify_pinned(&self.pinned_key, &raw) {
            HostKeyVerification::FirstContact { fingerprint } => {
                info!(
                    "First contact with {}, accepting host key {}",
                    self.label, fingerprint
                );
                Ok(true)
            }
            HostKeyVerification::Verified => {
                debug!("Host key verified for {}", self.label);
                Ok(true)
            }
            HostKeyVerification::Mismatch { pinned, observed } => {
                warn!(
                    "HOST KEY CHANGED for {}! Pinned {}, got {}",
                    self.label, pinned, observed
                );
                Err(SshError::HostKeyMismatch {
                    host: self.label.clone(),
                    pinned,
                    observed,
                })
            }
        }
    }
}

/// Credentials ready for the authentication exchange
enum AuthMaterial {
    Password(String),
    Key(Arc<PrivateKey>),
}

struct ConnectionState {
    controller: Option<HandleController>,
    host_key: Option<Vec<u8>>,
    closed: bool,
}

/// One authenticated, reconnecting SSH transport to a host
pub struct Connection {
    id: String,
    config: ConnectionConfig,
    retry: RetryPolicy,
    state: Mutex<ConnectionState>,
}

impl Connection {
    /// Create a detached connection; nothing is dialed until [`connect`](Self::connect)
    pub fn new(id: impl Into<String>, config: ConnectionConfig) -> Self {
        Self {
            id: id.into(),
            config,
            retry: RetryPolicy::default(),
            state: Mutex::new(ConnectionState {
                controller: None,
                host_key: None,
                closed: false,
            }),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Establish (or re-establish) the transport, closing any previous one
    pub async fn connect(&self) -> Result<(), SshError> {
        let mut state = self.state.lock().await;

        if let Some(old) = state.controller.take() {
            debug!("Replacing existing transport for {}", self.id);
            old.disconnect();
        }

        let observed = Arc::new(SyncMutex::new(None));
        let result = self.establish(observed.clone()).await;

        // Record the key even when the handshake was rejected
        if let Some(key) = observed.lock().take() {
            state.host_key = Some(key);
        }

        let controller = result?;
        state.controller = Some(controller);
        state.closed = false;
        info!("Connected to {} ({})", self.id, self.config.addr());
        Ok(())
    }

    async fn establish(
        &self,
        observed: Arc<SyncMutex<Option<Vec<u8>>>>,
    ) -> Result<HandleController, SshError> {
        let auth = self.load_auth()?;
        let timeout = self.config.timeout();
        let addr = self.config.addr();

        let stream = match self.config.proxy() {
            Some(proxy) => {
                super::proxy::connect_via_socks5(proxy, &self.config.host, self.config.port, timeout)
                    .await?
            }
            None => {
                info!("Connecting to SSH server at {}", addr);
                tokio::time::timeout(timeout, TcpStream::connect(&addr))
                    .await
                    .map_err(|_| SshError::Dial(format!("{}: connection timed out", addr)))?
                    .map_err(|e| SshError::Dial(format!("{}: {}", addr, e)))?
            }
        };
        let _ = stream.set_nodelay(true);

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(self.id.clone(), self.config.host_key.clone(), observed);

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect_stream(Arc::new(ssh_config), stream, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("SSH handshake with {} timed out", addr)))??;

        debug!("SSH handshake completed with {}", addr);

        let username = self.config.username.as_str();
        let authenticated = match auth {
            AuthMaterial::Password(password) => handle
                .authenticate_password(username, password)
                .await
                .map_err(|e| SshError::Auth(e.to_string()))?,
            AuthMaterial::Key(key) => handle
                .authenticate_publickey(username, PrivateKeyWithHashAlg::new(key, None))
                .await
                .map_err(|e| SshError::Auth(e.to_string()))?,
        };

        if !authenticated.success() {
            return Err(SshError::Auth(format!(
                "{}@{} rejected the credentials",
                username, addr
            )));
        }

        Ok(spawn_handle_owner_task(handle, self.id.clone()))
    }

    fn load_auth(&self) -> Result<AuthMaterial, SshError> {
        match &self.config.auth {
            AuthMethod::Password { password } => Ok(AuthMaterial::Password(password.clone())),
            AuthMethod::Key { key_path, password } => {
                let path = if key_path.trim().is_empty() {
                    default_key_path()
                } else {
                    expand_tilde(key_path)
                };
                let passphrase = password.as_deref().filter(|p| !p.is_empty());
                let key = russh::keys::load_secret_key(&path, passphrase).map_err(|e| {
                    SshError::Auth(format!("load key {}: {}", path.display(), e))
                })?;
                Ok(AuthMaterial::Key(Arc::new(key)))
            }
        }
    }

    /// Controller of the current transport, if one is up and not closed
    async fn live_controller(&self) -> Option<HandleController> {
        let state = self.state.lock().await;
        if state.closed {
            return None;
        }
        state
            .controller
            .as_ref()
            .filter(|c| c.is_connected())
            .cloned()
    }

    /// Open a session channel, connecting lazily and retrying stale transports
    async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let mut retries = 0u32;
        loop {
            let controller = match self.live_controller().await {
                Some(c) => c,
                None => {
                    self.connect().await?;
                    self.live_controller()
                        .await
                        .ok_or_else(|| SshError::NotConnected(self.id.clone()))?
                }
            };

            match controller.open_session_channel().await {
                Ok(channel) => return Ok(channel),
                Err(e) if e.is_retryable() && retries + 1 < self.retry.max_attempts => {
                    let delay = self.retry.backoff(retries);
                    warn!(
                        "Session open failed on {} ({}), reconnecting in {:?}",
                        self.id, e, delay
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    retries += 1;
                    self.connect().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `cmd` and collect its combined, trimmed output and exit status.
    ///
    /// `Ok` means the command ran, whatever its status; `Err` means it could
    /// not be run at all.
    pub async fn execute(&self, cmd: &str) -> Result<CommandOutput, SshError> {
        let mut channel = self.open_session_channel().await?;
        debug!("exec on {}: {}", self.id, cmd);

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| SshError::Session(format!("exec: {}", e)))?;

        let mut output = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, .. } => output.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                ChannelMsg::Failure => {
                    return Err(SshError::Session(format!("{} refused exec request", self.id)))
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        Ok(CommandOutput {
            output: String::from_utf8_lossy(&output).trim().to_string(),
            exit_status,
        })
    }

    /// Like [`execute`](Self::execute) but a non-zero exit is an error
    pub async fn execute_checked(&self, cmd: &str) -> Result<String, SshError> {
        self.execute(cmd).await?.into_result()
    }

    /// Start `cmd` without a PTY and stream its stdin/stdout
    pub async fn open_command(&self, cmd: &str) -> Result<ShellSession, SshError> {
        let channel = self.open_session_channel().await?;
        channel
            .exec(true, cmd)
            .await
            .map_err(|e| SshError::Session(format!("exec: {}", e)))?;
        let id = format!("{}/cmd-{}", self.id, uuid::Uuid::new_v4());
        debug!("Started streaming command {}: {}", id, cmd);
        Ok(spawn_channel_task(channel, id, StderrMode::Discard))
    }

    /// Open a PTY session running `command`, or an interactive shell when `None`.
    ///
    /// Requires an established transport; this never reconnects.
    pub async fn open_shell(
        &self,
        rows: u16,
        cols: u16,
        command: Option<&str>,
    ) -> Result<ShellSession, SshError> {
        let controller = self
            .live_controller()
            .await
            .ok_or_else(|| SshError::Session(format!("{} is not connected", self.id)))?;

        let channel = controller.open_session_channel().await?;

        let modes = [
            (Pty::ECHO, 1),
            (Pty::TTY_OP_ISPEED, 14400),
            (Pty::TTY_OP_OSPEED, 14400),
        ];
        channel
            .request_pty(false, "xterm-256color", cols as u32, rows as u32, 0, 0, &modes)
            .await
            .map_err(|e| SshError::Session(format!("PTY request failed: {}", e)))?;

        match command.filter(|c| !c.trim().is_empty()) {
            Some(cmd) => channel
                .exec(false, cmd)
                .await
                .map_err(|e| SshError::Session(format!("start command: {}", e)))?,
            None => channel
                .request_shell(false)
                .await
                .map_err(|e| SshError::Session(format!("start shell: {}", e)))?,
        }

        let id = format!("{}/pty-{}", self.id, uuid::Uuid::new_v4());
        info!("Shell session {} opened ({}x{})", id, cols, rows);
        Ok(spawn_channel_task(channel, id, StderrMode::Forward))
    }

    /// Open a socket to `addr` from the remote host's point of view
    pub async fn dial(&self, network: &str, addr: &str) -> Result<TunnelStream, SshError> {
        if !matches!(network, "tcp" | "tcp4" | "tcp6") {
            return Err(SshError::Session(format!("unsupported network {:?}", network)));
        }
        let (host, port) = split_host_port(addr)
            .ok_or_else(|| SshError::Session(format!("invalid address {:?}", addr)))?;

        let controller = self
            .live_controller()
            .await
            .ok_or_else(|| SshError::NotConnected(self.id.clone()))?;

        let channel = controller
            .open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await?;
        debug!("Tunnel to {} opened through {}", addr, self.id);
        Ok(channel.into_stream())
    }

    /// Stream `reader` into `remote_path`, creating its directory first.
    ///
    /// `on_progress` receives the running byte count after every chunk.
    /// There is no resume: a failed transfer has to be restarted from zero.
    pub async fn write_file<R, F>(
        &self,
        remote_path: &str,
        mut reader: R,
        size: u64,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<u64, SshError>
    where
        R: AsyncRead + Unpin,
        F: FnMut(u64),
    {
        let dir = match remote_path.rfind('/') {
            Some(0) => "/",
            Some(idx) => &remote_path[..idx],
            None => ".",
        };
        let cmd = format!(
            "mkdir -p {} && cat > {}",
            shell_quote(dir),
            shell_quote(remote_path)
        );

        let mut channel = self.open_session_channel().await?;
        channel
            .exec(true, cmd)
            .await
            .map_err(|e| SshError::Session(format!("start upload: {}", e)))?;

        info!("Uploading {} bytes to {}:{}", size, self.id, remote_path);

        let mut buf = vec![0u8; WRITE_CHUNK_SIZE];
        let mut written: u64 = 0;
        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = channel.close().await;
                    return Err(SshError::Cancelled);
                }
                read = reader.read(&mut buf) => {
                    read.map_err(|e| SshError::Transfer(format!("read: {}", e)))?
                }
            };
            if n == 0 {
                break;
            }
            channel
                .data(&buf[..n])
                .await
                .map_err(|e| SshError::Transfer(format!("write: {}", e)))?;
            written += n as u64;
            on_progress(written);
        }

        if written != size {
            warn!(
                "Upload to {} produced {} bytes, expected {}",
                remote_path, written, size
            );
        }

        channel
            .eof()
            .await
            .map_err(|e| SshError::Transfer(format!("close stdin: {}", e)))?;

        let mut stderr = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExtendedData { data, .. } | ChannelMsg::Data { data } => {
                    stderr.extend_from_slice(&data)
                }
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        CommandOutput {
            output: String::from_utf8_lossy(&stderr).trim().to_string(),
            exit_status,
        }
        .into_result()?;

        debug!("Upload to {}:{} finished ({} bytes)", self.id, remote_path, written);
        Ok(written)
    }

    /// Keepalive round trip over the current transport
    pub async fn is_alive(&self) -> bool {
        match self.live_controller().await {
            Some(controller) => controller.ping().await,
            None => false,
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Mark closed and release the transport. Idempotent.
    pub async fn close(&self) -> Result<(), SshError> {
        let mut state = self.state.lock().await;
        let was_open = !state.closed;
        state.closed = true;
        if let Some(controller) = state.controller.take() {
            controller.disconnect();
        }
        if was_open {
            debug!("Connection {} closed", self.id);
        }
        Ok(())
    }

    /// Base64 raw key observed on the latest handshake; empty before any
    pub async fn connected_host_key(&self) -> String {
        self.state
            .lock()
            .await
            .host_key
            .as_deref()
            .map(encode_host_key)
            .unwrap_or_default()
    }

    /// `SHA256:<base64>` fingerprint of the observed host key
    pub async fn host_fingerprint(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .host_key
            .as_deref()
            .map(fingerprint_sha256)
    }
}

/// Split `host:port`, accepting `[v6]:port`
fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}
