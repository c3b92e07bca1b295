//! WebSocket server for the terminal and VNC bridges
//!
//! An axum router serves `/ws/terminal` and `/ws/vnc`. The origin is checked
//! before routing, and the remote end is opened before the upgrade so that
//! failures reach the client as HTTP statuses.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, Request, State};
use axum::http::header::ORIGIN;
use axum::http::Uri;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::relay::{relay_terminal, relay_tunnel, TeardownLatch};
use super::request::{is_allowed_origin, TerminalParams, VncParams, TERMINAL_PATH, VNC_PATH};
use super::BridgeError;
use crate::ssh::{ConnectionPool, TunnelStream};

/// Time allowed for the VNC server to send its protocol banner
const VNC_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// RFB banner is `RFB xxx.yyy\n`
const VNC_BANNER_LEN: usize = 12;
const RFB_PREFIX: &[u8] = b"RFB ";
/// noVNC disconnects unless this subprotocol is echoed
const VNC_SUBPROTOCOL: &str = "binary";

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bind address; port 0 picks a free port
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:0".to_string()
}

#[derive(Clone)]
struct BridgeState {
    pool: Arc<ConnectionPool>,
    /// Parent of every bridge's teardown latch
    cancel: CancellationToken,
}

/// Routes for both bridge endpoints.
///
/// Cancelling `cancel` tears down every bridge opened through the router.
pub fn router(pool: Arc<ConnectionPool>, cancel: CancellationToken) -> Router {
    Router::new()
        .route(TERMINAL_PATH, get(terminal_handler))
        .route(VNC_PATH, get(vnc_handler))
        .fallback(not_found)
        .layer(middleware::from_fn(check_origin))
        .with_state(BridgeState { pool, cancel })
}

/// WebSocket bridge server
pub struct BridgeServer;

impl BridgeServer {
    /// Bind and start serving bridge requests.
    ///
    /// Returns the bound port and the server task. Cancelling `cancel` stops
    /// accepting and tears down every open bridge.
    pub async fn start(
        pool: Arc<ConnectionPool>,
        config: BridgeConfig,
        cancel: CancellationToken,
    ) -> Result<(u16, JoinHandle<()>), BridgeError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let addr = listener.local_addr()?;
        info!("Bridge server listening on {}", addr);

        let app = router(pool, cancel.clone());
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .tcp_nodelay(true)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
            if let Err(e) = served {
                error!("Bridge server failed: {}", e);
            }
            info!("Bridge server stopped");
        });
        Ok((addr.port(), handle))
    }
}

/// Reject foreign origins before routing, so unknown paths get 403 too
async fn check_origin(request: Request, next: Next) -> Result<Response, BridgeError> {
    if let Some(value) = request.headers().get(ORIGIN) {
        let origin = value.to_str().ok();
        if origin.is_none() || !is_allowed_origin(origin) {
            return Err(BridgeError::Forbidden(String::from_utf8_lossy(value.as_bytes()).into_owned()));
        }
    }
    Ok(next.run(request).await)
}

async fn not_found(uri: Uri) -> BridgeError {
    BridgeError::NotFound(uri.path().to_string())
}

async fn terminal_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<TerminalParams>,
    State(state): State<BridgeState>,
) -> Result<Response, BridgeError> {
    params.validate()?;
    let conn = state.pool.get(&params.host_id).await?;
    let shell = conn
        .open_shell(params.rows, params.cols, params.command.as_deref())
        .await?;

    info!(
        "Terminal bridge {} opened for {} ({}x{})",
        shell.id(),
        params.host_id,
        params.cols,
        params.rows
    );
    let latch = Arc::new(TeardownLatch::child_of(&state.cancel));
    Ok(ws.on_upgrade(move |socket| async move {
        relay_terminal(socket, shell, latch).await;
    }))
}

async fn vnc_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<VncParams>,
    State(state): State<BridgeState>,
) -> Result<Response, BridgeError> {
    params.validate()?;
    let (stream, banner) = open_vnc(&params, &state.pool).await?;

    let label = format!("{}/vnc-{}", params.host_id, params.port);
    info!("VNC bridge {} opened", label);
    let latch = Arc::new(TeardownLatch::child_of(&state.cancel));
    Ok(ws
        .protocols([VNC_SUBPROTOCOL])
        .on_upgrade(move |socket| async move {
            relay_tunnel(socket, stream, banner, latch, label).await;
        }))
}

/// Tunnel to the VNC port and read its banner
async fn open_vnc(
    params: &VncParams,
    pool: &ConnectionPool,
) -> Result<(TunnelStream, Vec<u8>), BridgeError> {
    let conn = pool.get(&params.host_id).await?;

    let mut last_err = None;
    let mut tunnel = None;
    for target in params.dial_targets() {
        match conn.dial("tcp", &target).await {
            Ok(stream) => {
                debug!("VNC tunnel to {} via {}", target, params.host_id);
                tunnel = Some(stream);
                break;
            }
            Err(e) => {
                debug!("VNC dial {} via {} failed: {}", target, params.host_id, e);
                last_err = Some(e);
            }
        }
    }
    let mut stream = match (tunnel, last_err) {
        (Some(stream), _) => stream,
        (None, Some(e)) => {
            return Err(BridgeError::Upstream(format!(
                "dial vnc port {}: {}",
                params.port, e
            )))
        }
        (None, None) => {
            return Err(BridgeError::Upstream(format!("dial vnc port {}", params.port)))
        }
    };

    let banner = read_vnc_banner(&mut stream).await?;
    Ok((stream, banner))
}

/// Read the start of the RFB banner to confirm the port serves VNC
async fn read_vnc_banner<T: AsyncRead + Unpin>(tunnel: &mut T) -> Result<Vec<u8>, BridgeError> {
    let mut buf = [0u8; VNC_BANNER_LEN];
    let mut n = 0;
    let read = tokio::time::timeout(VNC_HANDSHAKE_TIMEOUT, async {
        while n < RFB_PREFIX.len() {
            let m = tunnel.read(&mut buf[n..]).await?;
            if m == 0 {
                break;
            }
            n += m;
        }
        Ok::<_, std::io::Error>(())
    })
    .await;

    match read {
        Err(_) => {
            return Err(BridgeError::Upstream("vnc handshake timed out".into()));
        }
        Ok(Err(e)) => {
            return Err(BridgeError::Upstream(format!("vnc handshake failed: {}", e)));
        }
        Ok(Ok(())) => {}
    }

    if n == 0 {
        return Err(BridgeError::Upstream("vnc port closed before handshake".into()));
    }
    if !buf[..n].starts_with(RFB_PREFIX) {
        return Err(BridgeError::Upstream(format!(
            "port does not speak RFB (got {:?})",
            String::from_utf8_lossy(&buf[..n])
        )));
    }
    Ok(buf[..n].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use crate::bridge::encode_resize;
    use crate::ssh::test_server::TestServer;

    type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_bridge(pool: Arc<ConnectionPool>) -> (u16, CancellationToken) {
        let cancel = CancellationToken::new();
        let (port, _handle) = BridgeServer::start(pool, BridgeConfig::default(), cancel.clone())
            .await
            .unwrap();
        (port, cancel)
    }

    /// Send `head` and read one response; the server may keep the connection open
    async fn raw_request(port: u16, head: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(head.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        let mut chunk = [0u8; 1024];
        tokio::time::timeout(Duration::from_secs(5), async {
            while !response_complete(&response) {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                response.extend_from_slice(&chunk[..n]);
            }
        })
        .await
        .unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    fn response_complete(buf: &[u8]) -> bool {
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
        let body_len = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        buf.len() >= end + 4 + body_len
    }

    fn upgrade_head(target: &str, origin: Option<&str>) -> String {
        let mut head = format!(
            "GET {} HTTP/1.1\r\nHost: 127.0.0.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n",
            target
        );
        if let Some(origin) = origin {
            head.push_str(&format!("Origin: {}\r\n", origin));
        }
        head.push_str("\r\n");
        head
    }

    async fn next_binary(ws: &mut ClientWs) -> Option<Vec<u8>> {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Binary(data)) => return Some(data),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    }

    /// Collect socket output until it contains `needle`
    async fn read_until(ws: &mut ClientWs, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            let chunk = tokio::time::timeout(Duration::from_secs(5), next_binary(ws))
                .await
                .unwrap()
                .unwrap();
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        seen
    }

    #[tokio::test]
    async fn test_http_errors_before_upgrade() {
        let pool = Arc::new(ConnectionPool::new());
        let (port, cancel) = start_bridge(pool).await;

        let missing_host = raw_request(port, &upgrade_head("/ws/terminal", None)).await;
        assert!(missing_host.starts_with("HTTP/1.1 400"), "{missing_host}");

        let bad_origin = raw_request(
            port,
            &upgrade_head("/ws/terminal?host=hv1", Some("https://evil.example")),
        )
        .await;
        assert!(bad_origin.starts_with("HTTP/1.1 403"), "{bad_origin}");

        let unknown_path = raw_request(port, &upgrade_head("/ws/ftp?host=hv1", None)).await;
        assert!(unknown_path.starts_with("HTTP/1.1 404"), "{unknown_path}");

        let not_connected = raw_request(port, &upgrade_head("/ws/terminal?host=hv1", None)).await;
        assert!(not_connected.starts_with("HTTP/1.1 502"), "{not_connected}");
        assert!(not_connected.contains("hv1"));

        let bad_port = raw_request(port, &upgrade_head("/ws/vnc?host=hv1&port=vnc", None)).await;
        assert!(bad_port.starts_with("HTTP/1.1 400"), "{bad_port}");

        let plain_get = raw_request(
            port,
            "GET /ws/vnc?host=hv1&port=5900 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(plain_get.starts_with("HTTP/1.1 400"), "{plain_get}");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_origin_checked_before_routing_and_params() {
        let pool = Arc::new(ConnectionPool::new());
        let (port, cancel) = start_bridge(pool).await;
        let evil = Some("https://evil.example");

        for target in ["/ws/ftp?host=hv1", "/ws/terminal", "/ws/vnc?host=hv1&port=0", "/"] {
            let response = raw_request(port, &upgrade_head(target, evil)).await;
            assert!(response.starts_with("HTTP/1.1 403"), "{target}: {response}");
        }

        // Allowed origins still get the specific status
        let response = raw_request(port, &upgrade_head("/ws/ftp?host=hv1", Some("tauri://localhost"))).await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_terminal_bridge_end_to_end() {
        let server = TestServer::start().await;
        let pool = Arc::new(ConnectionPool::new());
        pool.connect("hv1", server.config()).await.unwrap();
        let (port, cancel) = start_bridge(pool).await;

        let url = format!("ws://127.0.0.1:{}/ws/terminal?host=hv1&rows=30&cols=100", port);
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

        read_until(&mut ws, "$ ").await;

        ws.send(Message::Binary(b"uptime\n".to_vec())).await.unwrap();
        read_until(&mut ws, "uptime").await;

        ws.send(Message::Binary(encode_resize(40, 120).to_vec()))
            .await
            .unwrap();
        read_until(&mut ws, "[resized 120x40]").await;

        // Remote shell exits: the socket is closed by the bridge
        ws.send(Message::Binary(b"exit\n".to_vec())).await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), async {
            while next_binary(&mut ws).await.is_some() {}
        })
        .await;
        assert!(end.is_ok());

        cancel.cancel();
    }

    async fn fake_vnc_server(greeting: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    sock.write_all(greeting).await.unwrap();
                    let mut buf = [0u8; 1024];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if sock.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_vnc_bridge_forwards_banner_and_echoes_subprotocol() {
        let server = TestServer::start().await;
        let vnc_port = fake_vnc_server(b"RFB 003.008\n").await;
        let pool = Arc::new(ConnectionPool::new());
        pool.connect("hv1", server.config()).await.unwrap();
        let (port, cancel) = start_bridge(pool).await;

        let url = format!("ws://127.0.0.1:{}/ws/vnc?host=hv1&port={}", port, vnc_port);
        let mut request = url.into_client_request().unwrap();
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("binary"));
        let (mut ws, response) = connect_async(request).await.unwrap();

        assert_eq!(
            response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "binary"
        );
        assert_eq!(next_binary(&mut ws).await.unwrap(), b"RFB 003.008\n");

        ws.send(Message::Binary(b"RFB 003.008\n".to_vec())).await.unwrap();
        assert_eq!(next_binary(&mut ws).await.unwrap(), b"RFB 003.008\n");

        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), async {
            while next_binary(&mut ws).await.is_some() {}
        })
        .await;
        assert!(end.is_ok());
    }

    #[tokio::test]
    async fn test_vnc_bridge_rejects_non_rfb_port() {
        let server = TestServer::start().await;
        let not_vnc = fake_vnc_server(b"SSH-2.0-OpenSSH_9.6\r\n").await;
        let pool = Arc::new(ConnectionPool::new());
        pool.connect("hv1", server.config()).await.unwrap();
        let (port, cancel) = start_bridge(pool).await;

        let target = format!("/ws/vnc?host=hv1&port={}", not_vnc);
        let response = raw_request(port, &upgrade_head(&target, Some("wails://wails"))).await;
        assert!(response.starts_with("HTTP/1.1 502"), "{response}");
        assert!(response.contains("RFB"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_read_vnc_banner() {
        let (mut tunnel, mut vnc) = tokio::io::duplex(64);
        vnc.write_all(b"RFB 003.008\n").await.unwrap();
        assert_eq!(read_vnc_banner(&mut tunnel).await.unwrap(), b"RFB 003.008\n");

        let (mut tunnel, vnc) = tokio::io::duplex(64);
        drop(vnc);
        assert!(matches!(
            read_vnc_banner(&mut tunnel).await,
            Err(BridgeError::Upstream(_))
        ));
    }
}
