//! Remote sessions: PTY shells and single command invocations
//!
//! A spawned task owns the russh `Channel`. The [`ShellSession`] handed to
//! callers only holds the two ends of that task's queues: a command sender
//! (input bytes, resize, EOF, close) and an output receiver, plus a oneshot
//! that yields the exit status once the channel is gone.

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Queue depth for both directions; bounds memory per session
const SESSION_QUEUE_CAPACITY: usize = 64;

/// Commands that can be sent to a session task
#[derive(Debug)]
pub enum SessionCommand {
    /// Bytes for the remote stdin
    Data(Vec<u8>),
    /// Resize the PTY
    Resize { rows: u16, cols: u16 },
    /// Close the remote stdin, keep reading output
    Eof,
    /// Tear the session down
    Close,
}

/// Write side of a session
#[derive(Clone)]
pub struct ShellInput {
    id: String,
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl ShellInput {
    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        self.cmd_tx
            .send(SessionCommand::Data(data.to_vec()))
            .await
            .map_err(|_| SshError::Session(format!("session {} is closed", self.id)))
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), SshError> {
        self.cmd_tx
            .send(SessionCommand::Resize { rows, cols })
            .await
            .map_err(|_| SshError::Session(format!("session {} is closed", self.id)))
    }

    /// Signal end of input (the remote command sees EOF on stdin)
    pub async fn finish(&self) -> Result<(), SshError> {
        self.cmd_tx
            .send(SessionCommand::Eof)
            .await
            .map_err(|_| SshError::Session(format!("session {} is closed", self.id)))
    }

    /// Close input and the remote session. Safe to call repeatedly.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Close).await;
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// Read side of a session
pub struct ShellOutput {
    out_rx: mpsc::Receiver<Vec<u8>>,
    exit_rx: Option<oneshot::Receiver<Option<u32>>>,
}

impl ShellOutput {
    /// Next chunk of combined stdout/stderr; `None` once the remote side is done
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.out_rx.recv().await
    }

    /// Wait for the session to end and return the remote exit status, if one was sent
    pub async fn wait(&mut self) -> Option<u32> {
        match self.exit_rx.take() {
            Some(rx) => rx.await.unwrap_or(None),
            None => None,
        }
    }
}

/// One interactive shell or command invocation on a remote host
pub struct ShellSession {
    id: String,
    input: ShellInput,
    output: ShellOutput,
}

impl ShellSession {
    /// Assemble a session from raw queue ends.
    ///
    /// [`spawn_channel_task`] is the production constructor; fakes use this
    /// directly to stand in for a remote command.
    pub fn from_parts(
        id: impl Into<String>,
        cmd_tx: mpsc::Sender<SessionCommand>,
        out_rx: mpsc::Receiver<Vec<u8>>,
        exit_rx: oneshot::Receiver<Option<u32>>,
    ) -> Self {
        let id = id.into();
        Self {
            input: ShellInput {
                id: id.clone(),
                cmd_tx,
            },
            output: ShellOutput {
                out_rx,
                exit_rx: Some(exit_rx),
            },
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        self.input.write(data).await
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), SshError> {
        self.input.resize(rows, cols).await
    }

    pub async fn finish_input(&self) -> Result<(), SshError> {
        self.input.finish().await
    }

    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.output.read().await
    }

    pub async fn wait(&mut self) -> Option<u32> {
        self.output.wait().await
    }

    /// Close input and the remote session
    pub async fn close(&self) {
        self.input.close().await
    }

    /// Split into independently owned write and read halves
    pub fn into_split(self) -> (ShellInput, ShellOutput) {
        (self.input, self.output)
    }
}

/// What a session task does with the remote's stderr stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrMode {
    /// Interleave with stdout (terminal sessions)
    Forward,
    /// Log at debug and drop; stdout stays a clean byte stream
    Discard,
}

/// Spawn the task that owns `channel` and return the caller-facing session
pub fn spawn_channel_task(mut channel: Channel<Msg>, id: String, stderr: StderrMode) -> ShellSession {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(SESSION_QUEUE_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(SESSION_QUEUE_CAPACITY);
    let (exit_tx, exit_rx) = oneshot::channel::<Option<u32>>();

    let sid = id.clone();
    tokio::spawn(async move {
        debug!("Session task started for {}", sid);
        let mut exit_status = None;
        let mut output_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                warn!("Failed to send data to session {}: {}", sid, e);
                                break;
                            }
                        }
                        Some(SessionCommand::Resize { rows, cols }) => {
                            if let Err(e) = channel.window_change(cols as u32, rows as u32, 0, 0).await {
                                warn!("Failed to resize PTY for session {}: {}", sid, e);
                            } else {
                                debug!("PTY resized to {}x{} for session {}", cols, rows, sid);
                            }
                        }
                        Some(SessionCommand::Eof) => {
                            if let Err(e) = channel.eof().await {
                                warn!("Failed to send EOF to session {}: {}", sid, e);
                                break;
                            }
                        }
                        Some(SessionCommand::Close) | None => {
                            debug!("Closing session {}", sid);
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    }
                }

                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if output_open && out_tx.send(data.to_vec()).await.is_err() {
                                // Nobody reads the output; keep serving input
                                output_open = false;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            match stderr {
                                StderrMode::Forward if ext == 1 => {
                                    if output_open && out_tx.send(data.to_vec()).await.is_err() {
                                        output_open = false;
                                    }
                                }
                                StderrMode::Discard if ext == 1 => {
                                    debug!(
                                        "Session {} stderr: {}",
                                        sid,
                                        String::from_utf8_lossy(&data).trim_end()
                                    );
                                }
                                _ => {}
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                            debug!("Session {} exit status {}", sid, status);
                            exit_status = Some(status);
                        }
                        Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                            info!("Session {} killed by signal {:?}", sid, signal_name);
                        }
                        Some(ChannelMsg::Eof) => {
                            debug!("Session {} remote EOF", sid);
                        }
                        Some(ChannelMsg::Close) | None => {
                            debug!("Session {} closed by remote", sid);
                            break;
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        drop(out_tx);
        let _ = exit_tx.send(exit_status);
        debug!("Session task terminated for {}", sid);
    });

    ShellSession::from_parts(id, cmd_tx, out_rx, exit_rx)
}
