//! HTTP transport
//!
//! The dispatcher talks to the network through the [`Transport`] trait so the
//! same signing and classification path runs against the hyper client in
//! production and against in-memory servers in tests.
//!
//! [`HyperTransport`] settings:
//! - HTTP/1.1 only
//! - Tuned connection pool (1024 idle per host, 90s idle timeout)
//! - TCP_NODELAY and 90s keepalive
//! - native-tls (OpenSSL) for TLS
//! - Per-request timeout covering the round trip and body collection

use crate::sufy::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{HeaderMap, Method, Request, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// A fully signed request ready for the wire
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A raw response, body fully collected
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Executes one HTTP round trip
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Hyper-backed transport. Clone is cheap, the pool is shared.
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl HyperTransport {
    pub fn new(timeout: Duration, insecure_tls: bool) -> Result<Self, TransportError> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if insecure_tls {
            tracing::warn!("INSECURE TLS MODE ENABLED: Certificate verification is disabled!");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?
        } else {
            TlsConnector::new()?
        };

        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(1024)
            .set_host(true)
            .build(https);

        Ok(Self { client, timeout })
    }

    async fn round_trip(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = Request::builder().method(request.method).uri(request.uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = request.headers;
        }
        let request = builder.body(Full::new(request.body))?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.collect().await?.to_bytes();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        tokio::time::timeout(self.timeout, self.round_trip(request))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
    }
}

/// One captured round trip
#[derive(Debug, Clone)]
pub struct HttpRecord {
    pub request: HttpRequest,
    /// `None` when the transport failed
    pub response: Option<HttpResponse>,
}

/// Wraps a transport and captures request/response pairs between
/// [`start_recording`](Self::start_recording) and
/// [`stop_and_take`](Self::stop_and_take).
pub struct RecordingTransport {
    inner: Arc<dyn Transport>,
    records: Mutex<Option<Vec<HttpRecord>>>,
}

impl RecordingTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            records: Mutex::new(None),
        }
    }

    /// Begin capturing. Discards anything captured by an unfinished session.
    pub fn start_recording(&self) {
        *self.records.lock() = Some(Vec::new());
    }

    /// Stop capturing and return what was recorded, oldest first
    pub fn stop_and_take(&self) -> Vec<HttpRecord> {
        self.records.lock().take().unwrap_or_default()
    }

    pub fn is_recording(&self) -> bool {
        self.records.lock().is_some()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let captured = self.is_recording().then(|| request.clone());
        let result = self.inner.execute(request).await;

        if let Some(request) = captured {
            if let Some(records) = self.records.lock().as_mut() {
                records.push(HttpRecord {
                    request,
                    response: result.as_ref().ok().cloned(),
                });
            }
        }

        result
    }
}
