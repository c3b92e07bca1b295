//! Bidirectional relays between an upgraded socket and a remote stream
//!
//! Each bridge runs two copy tasks. Each task owns one half of each side and
//! closes what it owns on exit. The first task to finish fires the
//! [`TeardownLatch`], which stops the other one; the latch records which side
//! ended the session and fires only once.
//!
//! The relays work on any WebSocket whose message type implements
//! [`SocketMessage`]: the server's axum sockets and plain tokio-tungstenite
//! streams.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ssh::{ShellInput, ShellSession};

/// First byte of a terminal resize control frame
pub const RESIZE_SENTINEL: u8 = 0x01;

/// Read size for tunneled TCP data
const TUNNEL_BUFFER_SIZE: usize = 32 * 1024;

/// A peer that stopped reading cannot hold a relay task open past this
const SOCKET_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Inbound WebSocket message as the relays see it
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// Binary or text payload
    Data(Vec<u8>),
    Close,
    /// Ping, pong and raw frames
    Control,
}

/// Message type of a WebSocket implementation
pub trait SocketMessage: Send + Unpin + 'static {
    fn binary(data: Vec<u8>) -> Self;

    fn into_frame(self) -> Frame;
}

impl SocketMessage for axum::extract::ws::Message {
    fn binary(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }

    fn into_frame(self) -> Frame {
        match self {
            Self::Binary(data) => Frame::Data(data),
            Self::Text(text) => Frame::Data(text.into_bytes()),
            Self::Close(_) => Frame::Close,
            Self::Ping(_) | Self::Pong(_) => Frame::Control,
        }
    }
}

impl SocketMessage for tungstenite::Message {
    fn binary(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }

    fn into_frame(self) -> Frame {
        match self {
            Self::Binary(data) => Frame::Data(data),
            Self::Text(text) => Frame::Data(text.into_bytes()),
            Self::Close(_) => Frame::Close,
            Self::Ping(_) | Self::Pong(_) | Self::Frame(_) => Frame::Control,
        }
    }
}

/// Send a close frame, giving up after [`SOCKET_CLOSE_TIMEOUT`]
async fn close_socket<Si, M>(sink: &mut Si, label: &str)
where
    Si: Sink<M> + Unpin,
    Si::Error: fmt::Display,
{
    match tokio::time::timeout(SOCKET_CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Socket close failed for {}: {}", label, e),
        Err(_) => debug!("Socket close timed out for {}", label),
    }
}

/// `[0x01, rowsHi, rowsLo, colsHi, colsLo]` -> `(rows, cols)`
pub fn decode_resize(frame: &[u8]) -> Option<(u16, u16)> {
    match frame {
        [RESIZE_SENTINEL, r0, r1, c0, c1] => {
            Some((u16::from_be_bytes([*r0, *r1]), u16::from_be_bytes([*c0, *c1])))
        }
        _ => None,
    }
}

pub fn encode_resize(rows: u16, cols: u16) -> [u8; 5] {
    let [r0, r1] = rows.to_be_bytes();
    let [c0, c1] = cols.to_be_bytes();
    [RESIZE_SENTINEL, r0, r1, c0, c1]
}

/// Which end of a bridge stopped first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The browser socket closed or failed
    Socket,
    /// The shell session or tunnel closed or failed
    Remote,
    /// The server is shutting down
    Shutdown,
}

/// Single-fire teardown signal shared by the two copy tasks of one bridge
pub struct TeardownLatch {
    fired: AtomicBool,
    trigger: Mutex<Option<Side>>,
    token: CancellationToken,
}

impl Default for TeardownLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl TeardownLatch {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Latch that is also released when `parent` is cancelled
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self::with_token(parent.child_token())
    }

    fn with_token(token: CancellationToken) -> Self {
        Self {
            fired: AtomicBool::new(false),
            trigger: Mutex::new(None),
            token,
        }
    }

    /// Fire the latch. Returns `true` only for the first caller.
    pub fn fire(&self, side: Side) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.trigger.lock() = Some(side);
            self.token.cancel();
            true
        } else {
            false
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Side recorded by the winning [`fire`](Self::fire)
    pub fn trigger(&self) -> Option<Side> {
        *self.trigger.lock()
    }

    /// Resolves once the latch fired or the parent token was cancelled
    pub async fn released(&self) {
        self.token.cancelled().await
    }
}

/// Relay between a socket and a PTY shell until either side ends.
///
/// Socket frames are shell input, except 5-byte resize control frames.
/// Returns the side that ended the session.
pub async fn relay_terminal<W, M, E>(ws: W, shell: ShellSession, latch: Arc<TeardownLatch>) -> Option<Side>
where
    W: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + 'static,
    M: SocketMessage,
    E: fmt::Display + Send + 'static,
{
    let label = shell.id().to_string();
    let (input, mut output) = shell.into_split();
    let (mut sink, mut stream) = ws.split();

    // Shell output -> socket
    let out_latch = latch.clone();
    let out_label = label.clone();
    let remote_to_socket = tokio::spawn(async move {
        let ended = tokio::select! {
            _ = out_latch.released() => None,
            side = async {
                while let Some(chunk) = output.read().await {
                    if let Err(e) = sink.send(M::binary(chunk)).await {
                        debug!("Socket send failed for {}: {}", out_label, e);
                        return Side::Socket;
                    }
                }
                Side::Remote
            } => Some(side),
        };
        if let Some(side) = ended {
            out_latch.fire(side);
        }
        close_socket::<_, M>(&mut sink, &out_label).await;
        debug!("Shell -> socket relay stopped for {}", out_label);
    });

    // Socket -> shell input
    let in_latch = latch.clone();
    let in_label = label.clone();
    let socket_to_remote = tokio::spawn(async move {
        let ended = tokio::select! {
            _ = in_latch.released() => None,
            side = pump_terminal_input(&mut stream, &input, &in_label) => Some(side),
        };
        if let Some(side) = ended {
            in_latch.fire(side);
        }
        input.close().await;
        debug!("Socket -> shell relay stopped for {}", in_label);
    });

    let _ = tokio::join!(remote_to_socket, socket_to_remote);
    latch.fire(Side::Shutdown);

    let trigger = latch.trigger();
    info!("Terminal bridge {} closed ({:?} ended first)", label, trigger);
    trigger
}

async fn pump_terminal_input<St, M, E>(stream: &mut St, input: &ShellInput, label: &str) -> Side
where
    St: Stream<Item = Result<M, E>> + Unpin,
    M: SocketMessage,
    E: fmt::Display,
{
    while let Some(msg) = stream.next().await {
        let data = match msg.map(M::into_frame) {
            Ok(Frame::Data(data)) => data,
            Ok(Frame::Close) => {
                debug!("Socket close received for {}", label);
                return Side::Socket;
            }
            Ok(Frame::Control) => continue,
            Err(e) => {
                debug!("Socket receive error for {}: {}", label, e);
                return Side::Socket;
            }
        };

        if let Some((rows, cols)) = decode_resize(&data) {
            debug!("Resize {}x{} for {}", cols, rows, label);
            if input.resize(rows, cols).await.is_err() {
                return Side::Remote;
            }
            continue;
        }

        if input.write(&data).await.is_err() {
            return Side::Remote;
        }
    }
    Side::Socket
}

/// Relay raw bytes between a socket and a tunneled TCP stream.
///
/// `banner` holds bytes already read from the tunnel; they are sent to the
/// socket before anything else.
pub async fn relay_tunnel<W, M, E, T>(
    ws: W,
    tunnel: T,
    banner: Vec<u8>,
    latch: Arc<TeardownLatch>,
    label: String,
) -> Option<Side>
where
    W: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + 'static,
    M: SocketMessage,
    E: fmt::Display + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (mut reader, mut writer) = tokio::io::split(tunnel);

    if !banner.is_empty() {
        if let Err(e) = sink.send(M::binary(banner)).await {
            debug!("Failed to forward handshake for {}: {}", label, e);
            latch.fire(Side::Socket);
            let _ = writer.shutdown().await;
            return latch.trigger();
        }
    }

    // Tunnel -> socket
    let out_latch = latch.clone();
    let out_label = label.clone();
    let remote_to_socket = tokio::spawn(async move {
        let ended = tokio::select! {
            _ = out_latch.released() => None,
            side = async {
                let mut buf = vec![0u8; TUNNEL_BUFFER_SIZE];
                loop {
                    let n = match reader.read(&mut buf).await {
                        Ok(0) => return Side::Remote,
                        Ok(n) => n,
                        Err(e) => {
                            debug!("Tunnel read failed for {}: {}", out_label, e);
                            return Side::Remote;
                        }
                    };
                    if let Err(e) = sink.send(M::binary(buf[..n].to_vec())).await {
                        debug!("Socket send failed for {}: {}", out_label, e);
                        return Side::Socket;
                    }
                }
            } => Some(side),
        };
        if let Some(side) = ended {
            out_latch.fire(side);
        }
        close_socket::<_, M>(&mut sink, &out_label).await;
    });

    // Socket -> tunnel
    let in_latch = latch.clone();
    let in_label = label.clone();
    let socket_to_remote = tokio::spawn(async move {
        let ended = tokio::select! {
            _ = in_latch.released() => None,
            side = async {
                while let Some(msg) = stream.next().await {
                    let data = match msg.map(M::into_frame) {
                        Ok(Frame::Data(data)) => data,
                        Ok(Frame::Close) => return Side::Socket,
                        Ok(Frame::Control) => continue,
                        Err(e) => {
                            debug!("Socket receive error for {}: {}", in_label, e);
                            return Side::Socket;
                        }
                    };
                    if writer.write_all(&data).await.is_err() {
                        return Side::Remote;
                    }
                }
                Side::Socket
            } => Some(side),
        };
        if let Some(side) = ended {
            in_latch.fire(side);
        }
        let _ = writer.shutdown().await;
    });

    let _ = tokio::join!(remote_to_socket, socket_to_remote);
    latch.fire(Side::Shutdown);

    let trigger = latch.trigger();
    info!("Tunnel bridge {} closed ({:?} ended first)", label, trigger);
    trigger
}
