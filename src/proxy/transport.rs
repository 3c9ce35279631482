//! Outbound TCP transport: direct, HTTP CONNECT, and SOCKS5
//!
//! Every function returns a raw `TcpStream` positioned at the target, so the
//! HTTP client can layer TLS and HTTP/1.1 on top without knowing the route.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};

use crate::error::{Result, ScoutError};
use crate::models::{format_tcp_addr, ProxyCandidate, ProxyConfiguration, ProxyKind};

/// Upper bound on a CONNECT response head
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Open a stream to `host:port` following the given routing
#[instrument(skip(proxy), fields(route = %proxy))]
pub async fn open_tunnel(proxy: &ProxyConfiguration, host: &str, port: u16) -> Result<TcpStream> {
    match proxy {
        ProxyConfiguration::None => connect_direct(host, port).await,
        ProxyConfiguration::Selected(candidate) => connect_through(candidate, host, port).await,
    }
}

/// Connect straight to the target
pub async fn connect_direct(host: &str, port: u16) -> Result<TcpStream> {
    let addr = format_tcp_addr(host, port);
    debug!("Connecting directly to {}", addr);
    TcpStream::connect(&addr)
        .await
        .map_err(|e| ScoutError::ConnectFailed(format!("TCP connect to {} failed: {}", addr, e)))
}

/// Connect to the proxy itself, for absolute-form HTTP forwarding
pub async fn connect_to_proxy(candidate: &ProxyCandidate) -> Result<TcpStream> {
    let proxy_addr = candidate.address();
    TcpStream::connect(&proxy_addr).await.map_err(|e| {
        ScoutError::ProxyConnectionFailed(format!("TCP connect to proxy {} failed: {}", proxy_addr, e))
    })
}

/// Tunnel to `host:port` through a proxy candidate
pub async fn connect_through(
    candidate: &ProxyCandidate,
    host: &str,
    port: u16,
) -> Result<TcpStream> {
    let proxy_addr = candidate.address();
    let target_addr = format_tcp_addr(host, port);

    match candidate.kind() {
        ProxyKind::Http => connect_via_http_proxy(&proxy_addr, host, port)
            .await
            .map_err(|e| {
                ScoutError::ProxyConnectionFailed(format!(
                    "HTTP proxy CONNECT failed ({} -> {}): {}",
                    proxy_addr, target_addr, e
                ))
            }),
        ProxyKind::Socks5 => connect_via_socks5_proxy(&proxy_addr, host, port)
            .await
            .map_err(|e| {
                ScoutError::ProxyConnectionFailed(format!(
                    "SOCKS5 proxy connect failed ({} -> {}): {}",
                    proxy_addr, target_addr, e
                ))
            }),
    }
}

async fn connect_via_http_proxy(
    proxy_addr: &str,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let mut stream = TcpStream::connect(proxy_addr).await?;

    let authority = format_tcp_addr(target_host, target_port);
    let request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\n\r\n",
        authority, authority
    );
    stream.write_all(request.as_bytes()).await?;

    let head = read_response_head(&mut stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    if !is_connect_success(status_line) {
        anyhow::bail!(
            "CONNECT rejected: {}",
            if status_line.is_empty() { "empty status line" } else { status_line }
        );
    }

    debug!("HTTP CONNECT tunnel established to {}", authority);
    Ok(stream)
}

async fn connect_via_socks5_proxy(
    proxy_addr: &str,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let socket = TcpStream::connect(proxy_addr).await?;
    let stream = Socks5Stream::connect_with_socket(socket, (target_host, target_port)).await?;

    debug!("SOCKS5 connection established to {}:{}", target_host, target_port);
    Ok(stream.into_inner())
}

/// Read a response head byte-wise so no tunnelled payload is consumed
async fn read_response_head(stream: &mut TcpStream) -> std::result::Result<String, anyhow::Error> {
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            if head.is_empty() {
                anyhow::bail!("empty CONNECT response");
            }
            anyhow::bail!("connection closed inside CONNECT response");
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_CONNECT_RESPONSE {
            anyhow::bail!("CONNECT response head too large");
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn is_connect_success(status_line: &str) -> bool {
    let mut parts = status_line.split_whitespace();
    matches!(
        (parts.next(), parts.next()),
        (Some("HTTP/1.1" | "HTTP/1.0"), Some(code)) if code.starts_with('2') && code.len() == 3
    )
}
