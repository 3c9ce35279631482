//! Loopback fixtures shared by the unit tests.
//!
//! `spawn_http_server` doubles as an HTTP forward proxy: it answers whatever
//! request line it receives, absolute-form included. `spawn_socks5_server`
//! completes a no-auth SOCKS5 handshake and then answers the tunnelled HTTP
//! request itself.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
pub struct CannedResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
    pub delay: Option<Duration>,
}

impl CannedResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
            delay: None,
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.to_string(),
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn to_wire(&self) -> String {
        let reason = http::StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown");
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            reason,
            self.content_type,
            self.body.len(),
            self.body
        )
    }
}

/// Handle to a running fixture
pub struct Fixture {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    targets: Arc<Mutex<Vec<String>>>,
}

impl Fixture {
    /// Request heads received, in order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// SOCKS5 CONNECT destinations received, as `host:port`
    pub fn targets(&self) -> Vec<String> {
        self.targets.lock().unwrap().clone()
    }
}

/// Serve the canned responses in order, repeating the last one
pub async fn spawn_http_server(responses: Vec<CannedResponse>) -> Fixture {
    spawn_fixture(responses, false).await
}

/// No-auth SOCKS5 proxy that answers the tunnelled request itself
pub async fn spawn_socks5_server(responses: Vec<CannedResponse>) -> Fixture {
    spawn_fixture(responses, true).await
}

/// Bind and immediately release a loopback port so nothing listens on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn spawn_fixture(responses: Vec<CannedResponse>, socks: bool) -> Fixture {
    assert!(!responses.is_empty(), "fixture needs at least one response");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fixture = Fixture {
        addr: listener.local_addr().unwrap(),
        requests: Arc::new(Mutex::new(Vec::new())),
        targets: Arc::new(Mutex::new(Vec::new())),
    };

    let requests = fixture.requests.clone();
    let targets = fixture.targets.clone();

    tokio::spawn(async move {
        let mut served = 0usize;
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };

            let mut first = [0u8; 1];
            if stream.read_exact(&mut first).await.is_err() {
                continue;
            }

            // Wrong protocol for this fixture: hang up, like a real server would.
            let is_socks_greeting = first[0] == 0x05;
            if is_socks_greeting != socks {
                continue;
            }

            if socks {
                match socks5_handshake(&mut stream).await {
                    Some(target) => targets.lock().unwrap().push(target),
                    None => continue,
                }
                first[0] = match read_byte(&mut stream).await {
                    Some(b) => b,
                    None => continue,
                };
            }

            let Some(head) = read_head(&mut stream, first[0]).await else {
                continue;
            };
            requests.lock().unwrap().push(head);

            let response = responses[served.min(responses.len() - 1)].clone();
            served += 1;

            if let Some(delay) = response.delay {
                tokio::time::sleep(delay).await;
            }
            let _ = stream.write_all(response.to_wire().as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    fixture
}

/// Finish a SOCKS5 handshake whose version byte was already consumed
async fn socks5_handshake(stream: &mut TcpStream) -> Option<String> {
    let nmethods = read_byte(stream).await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await.ok()?;
    if !methods.contains(&0x00) {
        let _ = stream.write_all(&[0x05, 0xFF]).await;
        return None;
    }
    stream.write_all(&[0x05, 0x00]).await.ok()?;

    let mut req_head = [0u8; 4];
    stream.read_exact(&mut req_head).await.ok()?;
    if req_head[0] != 0x05 || req_head[1] != 0x01 {
        return None;
    }

    let host = match req_head[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await.ok()?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let len = read_byte(stream).await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await.ok()?;
            String::from_utf8(name).ok()?
        }
        0x04 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await.ok()?;
            format!("[{}]", std::net::Ipv6Addr::from(ip))
        }
        _ => return None,
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await.ok()?;

    stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .ok()?;

    Some(format!("{}:{}", host, u16::from_be_bytes(port)))
}

async fn read_byte(stream: &mut TcpStream) -> Option<u8> {
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte).await.ok()?;
    Some(byte[0])
}

async fn read_head(stream: &mut TcpStream, first: u8) -> Option<String> {
    let mut head = vec![first];
    while !head.ends_with(b"\r\n\r\n") {
        head.push(read_byte(stream).await?);
        if head.len() > 16 * 1024 {
            return None;
        }
    }
    Some(String::from_utf8_lossy(&head).into_owned())
}
