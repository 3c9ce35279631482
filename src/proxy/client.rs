//! Minimal HTTP/1.1 GET client over the proxy transport
//!
//! Plain `http://` targets behind an HTTP proxy are sent in absolute-form to
//! the proxy. Everything else is tunnelled (CONNECT or SOCKS5) and, for
//! `https://`, wrapped in TLS before the request is written.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use http::header::{ACCEPT, CONNECTION, HOST, USER_AGENT};
use http::{Method, Request};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};
use url::{Position, Url};

use crate::error::{Result, ScoutError};
use crate::models::{ProxyConfiguration, ProxyKind};
use crate::proxy::transport;

const DEFAULT_USER_AGENT: &str = concat!("proxy-scout/", env!("CARGO_PKG_VERSION"));

/// Status and body of a completed response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Performs a single GET, with no retries and no deadline of its own.
///
/// Callers bound each call with their own timeout and classify the result.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get(&self, url: &Url, proxy: &ProxyConfiguration) -> Result<FetchedResponse>;
}

/// Where a URL points, split for the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// `host[:port]` exactly as written in the URL
    pub authority: String,
    /// Origin-form request target, `/path?query`
    pub path_and_query: String,
}

impl Target {
    /// Split an `http`/`https` URL; anything else is an argument error
    pub fn parse(url: &Url) -> Result<Self> {
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(ScoutError::InvalidArgument(format!(
                    "unsupported URL scheme '{}' in {}",
                    other, url
                )))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| ScoutError::InvalidArgument(format!("URL has no host: {}", url)))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
            .to_string();

        let port = url
            .port_or_known_default()
            .ok_or_else(|| ScoutError::InvalidArgument(format!("URL has no port: {}", url)))?;

        Ok(Self {
            host,
            port,
            tls,
            authority: url[Position::BeforeHost..Position::AfterPort].to_string(),
            path_and_query: url[Position::BeforePath..Position::AfterQuery].to_string(),
        })
    }

    fn absolute_form(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.authority, self.path_and_query)
    }
}

/// hyper-based implementation of [`Fetcher`]
pub struct HttpClient {
    tls: TlsConnector,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ScoutError::Tls(format!("TLS setup failed: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
        })
    }

    async fn tls_handshake(&self, stream: TcpStream, host: &str) -> Result<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ScoutError::Tls(format!("invalid TLS server name '{}': {}", host, e)))?;
        self.tls
            .connect(server_name, stream)
            .await
            .map_err(|e| ScoutError::Tls(format!("TLS handshake with {} failed: {}", host, e)))
    }

    async fn send_get<S>(&self, stream: S, request_target: &str, target: &Target) -> Result<FetchedResponse>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Connection ended: {}", e);
            }
        });

        let request = Request::builder()
            .method(Method::GET)
            .uri(request_target)
            .header(HOST, target.authority.as_str())
            .header(USER_AGENT, DEFAULT_USER_AGENT)
            .header(ACCEPT, "application/json, */*")
            .header(CONNECTION, "close")
            .body(Empty::<Bytes>::new())
            .map_err(|e| ScoutError::InvalidArgument(format!("Failed to build request: {}", e)))?;

        let response = sender.send_request(request).await?;
        let status = response.status().as_u16();
        let body = response.into_body().collect().await?.to_bytes();

        debug!(status, bytes = body.len(), "Response received");
        Ok(FetchedResponse { status, body })
    }
}

#[async_trait]
impl Fetcher for HttpClient {
    #[instrument(skip(self, url, proxy), fields(url = %url, route = %proxy))]
    async fn get(&self, url: &Url, proxy: &ProxyConfiguration) -> Result<FetchedResponse> {
        let target = Target::parse(url)?;

        match proxy.candidate() {
            // Plain forwarding: the proxy sees the absolute URL.
            Some(candidate) if candidate.kind() == ProxyKind::Http && !target.tls => {
                let stream = transport::connect_to_proxy(candidate).await?;
                self.send_get(stream, &target.absolute_form(), &target).await
            }
            _ => {
                let stream = transport::open_tunnel(proxy, &target.host, target.port).await?;
                if target.tls {
                    let stream = self.tls_handshake(stream, &target.host).await?;
                    self.send_get(stream, &target.path_and_query, &target).await
                } else {
                    self.send_get(stream, &target.path_and_query, &target).await
                }
            }
        }
    }
}
