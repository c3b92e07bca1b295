//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>` of a transport. Everything
//! else (command execution, shells, tunnels, keepalive requests) talks to it
//! through a cloneable [`HandleController`] over an mpsc channel, so no lock
//! is ever held across an SSH round trip.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How long a keepalive request may take before the transport counts as dead
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (exec / PTY shell)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel (tunneled dial)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Keepalive request
    Ping { reply_tx: oneshot::Sender<bool> },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Wrap a raw command sender (tests drive the receiving side themselves)
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::NotConnected("transport closed".into()))?;
        reply_rx
            .await
            .map_err(|_| SshError::NotConnected("transport closed".into()))?
            .map_err(|e| SshError::Session(format!("open session: {}", e)))
    }

    /// Open a direct-tcpip channel to `host:port` on the remote side
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::NotConnected("transport closed".into()))?;
        reply_rx
            .await
            .map_err(|_| SshError::NotConnected("transport closed".into()))?
            .map_err(|e| SshError::Session(format!("dial {}:{}: {}", host, port, e)))
    }

    /// Send a keepalive request; `false` if the transport is gone or silent
    pub async fn ping(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Ask the owner task to disconnect; returns immediately.
    ///
    /// If the queue is full the request is dropped; the task still exits once
    /// every controller clone is gone.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.try_send(HandleCommand::Disconnect);
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task, moving `handle` into it
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let mut handle = handle;
        debug!("Handle owner task started for {}", label);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }

                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(host, port, originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                HandleCommand::Ping { reply_tx } => {
                    let alive = match tokio::time::timeout(
                        KEEPALIVE_TIMEOUT,
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => true,
                        Ok(Err(e)) => {
                            warn!("Keepalive failed for {}: {}", label, e);
                            false
                        }
                        Err(_) => {
                            warn!("Keepalive timeout for {} ({:?})", label, KEEPALIVE_TIMEOUT);
                            false
                        }
                    };
                    let _ = reply_tx.send(alive);
                }

                HandleCommand::Disconnect => {
                    debug!("Disconnect requested for {}", label);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Connection closed", "en")
            .await;
        info!("Transport closed for {}", label);
    });

    HandleController { cmd_tx }
}

/// Fail every queued command so callers don't wait on a closed transport
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(false);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
