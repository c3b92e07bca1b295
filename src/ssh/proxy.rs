//! SOCKS5 client for reaching SSH hosts through a proxy
//!
//! Only the unauthenticated CONNECT flow (RFC 1928) is needed: greeting,
//! method selection, CONNECT request with a domain-name target, reply.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::error::SshError;

mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
}

/// Open a TCP stream to `target_host:target_port` through the SOCKS5 proxy at `proxy_addr`
pub async fn connect_via_socks5(
    proxy_addr: &str,
    target_host: &str,
    target_port: u16,
    timeout: Duration,
) -> Result<TcpStream, SshError> {
    info!(
        "Connecting to {}:{} via SOCKS5 proxy {}",
        target_host, target_port, proxy_addr
    );

    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(proxy_addr))
        .await
        .map_err(|_| SshError::Dial(format!("SOCKS5 proxy {} timed out", proxy_addr)))?
        .map_err(|e| SshError::Dial(format!("SOCKS5 proxy {}: {}", proxy_addr, e)))?;

    tokio::time::timeout(timeout, socks5_handshake(&mut stream, target_host, target_port))
        .await
        .map_err(|_| SshError::Dial(format!("SOCKS5 handshake with {} timed out", proxy_addr)))??;

    debug!("SOCKS5 tunnel established to {}:{}", target_host, target_port);
    Ok(stream)
}

/// Run the client side of the SOCKS5 handshake on an already connected stream
pub async fn socks5_handshake<S>(stream: &mut S, host: &str, port: u16) -> Result<(), SshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if host.is_empty() || host.len() > 255 {
        return Err(SshError::Dial(format!("Invalid SOCKS5 target host: {:?}", host)));
    }

    // Greeting: one method, NO AUTH
    stream
        .write_all(&[socks5::VERSION, 1, socks5::AUTH_NONE])
        .await
        .map_err(|e| SshError::Dial(format!("Failed to send SOCKS5 greeting: {}", e)))?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| SshError::Dial(format!("Failed to read SOCKS5 method selection: {}", e)))?;

    if reply[0] != socks5::VERSION {
        return Err(SshError::Dial(format!(
            "Unsupported SOCKS version from proxy: {}",
            reply[0]
        )));
    }
    if reply[1] != socks5::AUTH_NONE {
        return Err(SshError::Dial(
            "SOCKS5 proxy requires authentication".to_string(),
        ));
    }

    // CONNECT with a domain-name address; the proxy resolves it
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[socks5::VERSION, socks5::CMD_CONNECT, 0x00, socks5::ATYP_DOMAIN]);
    request.push(host.len() as u8);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream
        .write_all(&request)
        .await
        .map_err(|e| SshError::Dial(format!("Failed to send SOCKS5 request: {}", e)))?;

    // VER | REP | RSV | ATYP
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| SshError::Dial(format!("Failed to read SOCKS5 reply: {}", e)))?;

    if head[1] != socks5::REP_SUCCESS {
        return Err(SshError::Dial(format!(
            "SOCKS5 proxy refused {}:{}: {}",
            host,
            port,
            reply_message(head[1])
        )));
    }

    // Drain BND.ADDR and BND.PORT
    let bound_len = match head[3] {
        socks5::ATYP_IPV4 => 4,
        socks5::ATYP_IPV6 => 16,
        socks5::ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| SshError::Dial(format!("Failed to read SOCKS5 bound address: {}", e)))?;
            len[0] as usize
        }
        other => {
            return Err(SshError::Dial(format!(
                "Unsupported SOCKS5 address type in reply: {}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(|e| SshError::Dial(format!("Failed to read SOCKS5 bound address: {}", e)))?;

    debug!("SOCKS5 bound address: {}", describe_bound(head[3], &bound));
    Ok(())
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

fn describe_bound(atyp: u8, bound: &[u8]) -> String {
    let (addr, port) = bound.split_at(bound.len() - 2);
    let port = u16::from_be_bytes([port[0], port[1]]);
    match atyp {
        socks5::ATYP_IPV4 if addr.len() == 4 => {
            format!("{}:{}", Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]), port)
        }
        socks5::ATYP_IPV6 if addr.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(addr);
            format!("[{}]:{}", Ipv6Addr::from(octets), port)
        }
        _ => format!("{}:{}", String::from_utf8_lossy(addr), port),
    }
}
