//! Request dispatcher
//!
//! Turns a logical [`SufyRequest`] into exactly one signed HTTP round trip:
//! validate, address (path-style or virtual-host), sign, execute, classify.
//! Retries are not done here; see [`crate::sufy::retry`].

use crate::sufy::canonical::{uri_encode, wire_query, QueryParams};
use crate::sufy::error::{
    classify, Resource, Result, SufyError, REQID_HEADER, REQUEST_ID_HEADER,
};
use crate::sufy::signer::{payload_hash, Clock, Signer};
use crate::sufy::transport::{HttpRequest, Transport};
use crate::sufy::types::ObjectMetadata;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{HeaderMap, Method, StatusCode, Uri};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Prefix of user metadata headers
pub const META_PREFIX: &str = "x-sufy-meta-";

/// Service endpoint and addressing style
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: String,
    authority: String,
    force_path_style: bool,
}

impl Endpoint {
    /// Parse `http(s)://host[:port]`. A path component is rejected.
    pub fn parse(endpoint: &str, force_path_style: bool) -> Result<Self> {
        let invalid = |reason: &str| SufyError::Config(format!("invalid endpoint {:?}: {}", endpoint, reason));

        let uri: Uri = endpoint
            .trim_end_matches('/')
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| invalid(&e.to_string()))?;

        let scheme = match uri.scheme_str() {
            Some(s @ ("http" | "https")) => s.to_string(),
            Some(_) => return Err(invalid("scheme must be http or https")),
            None => return Err(invalid("missing scheme")),
        };
        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| invalid("missing host"))?;
        if !matches!(uri.path(), "" | "/") || uri.query().is_some() {
            return Err(invalid("must not contain a path or query"));
        }

        Ok(Self {
            scheme,
            authority,
            force_path_style,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn force_path_style(&self) -> bool {
        self.force_path_style
    }

    fn virtual_host(&self, bucket: Option<&str>) -> Option<String> {
        match bucket {
            Some(b) if !self.force_path_style && is_dns_compatible(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Authority used in the request URI
    fn authority_for(&self, bucket: Option<&str>) -> String {
        match self.virtual_host(bucket) {
            Some(b) => format!("{}.{}", b, self.authority),
            None => self.authority.clone(),
        }
    }

    /// Host header value, default port stripped
    pub fn host_for(&self, bucket: Option<&str>) -> String {
        let authority = self.authority_for(bucket);
        let default_port = if self.scheme == "https" { ":443" } else { ":80" };
        match authority.strip_suffix(default_port) {
            Some(host) => host.to_string(),
            None => authority,
        }
    }

    /// Percent-encoded request path
    pub fn path_for(&self, bucket: Option<&str>, key: Option<&str>) -> String {
        let encoded_key = key.map(|k| uri_encode(k, false));
        let mut path = String::with_capacity(64);
        path.push('/');

        if let Some(bucket) = bucket {
            if self.virtual_host(Some(bucket)).is_none() {
                path.push_str(&uri_encode(bucket, true));
                if encoded_key.is_some() {
                    path.push('/');
                }
            }
        }
        if let Some(key) = encoded_key {
            path.push_str(&key);
        }
        path
    }
}

/// Bucket names that can be used as a DNS label
fn is_dns_compatible(bucket: &str) -> bool {
    (3..=63).contains(&bucket.len())
        && bucket
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !bucket.starts_with('-')
        && !bucket.ends_with('-')
}

/// A logical request, before addressing and signing
#[derive(Debug, Clone)]
pub struct SufyRequest {
    pub method: Method,
    pub resource: Resource,
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub query: QueryParams,
    /// Extra headers, lower-case names. Repeats are sent as separate values.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub unsigned_payload: bool,
}

impl SufyRequest {
    fn new(method: Method, resource: Resource, bucket: Option<String>, key: Option<String>) -> Self {
        Self {
            method,
            resource,
            bucket,
            key,
            query: Vec::new(),
            headers: Vec::new(),
            body: Bytes::new(),
            unsigned_payload: false,
        }
    }

    /// Request against the service root (`/`)
    pub fn service(method: Method) -> Self {
        Self::new(method, Resource::Service, None, None)
    }

    pub fn bucket(method: Method, bucket: &str) -> Self {
        Self::new(method, Resource::Bucket, Some(bucket.to_string()), None)
    }

    pub fn object(method: Method, bucket: &str, key: &str) -> Self {
        Self::new(
            method,
            Resource::Object,
            Some(bucket.to_string()),
            Some(key.to_string()),
        )
    }

    /// Override the resource kind used for error classification
    pub fn resource(mut self, resource: Resource) -> Self {
        self.resource = resource;
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), Some(value.into())));
        self
    }

    pub fn param_opt<T: ToString>(self, key: &str, value: Option<T>) -> Self {
        match value {
            Some(v) => self.param(key, v.to_string()),
            None => self,
        }
    }

    /// Bare query key (`?uploads`, `?acl`)
    pub fn flag(mut self, key: &str) -> Self {
        self.query.push((key.to_string(), None));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn json_body<T: Serialize>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self.header("content-type", "application/json").body(Bytes::from(body)))
    }

    /// Add `Content-MD5` for the current body
    pub fn content_md5(self) -> Self {
        let digest = md5::compute(&self.body);
        let value = STANDARD.encode(digest.0);
        self.header("content-md5", value)
    }

    /// Skip hashing the body
    pub fn unsigned_payload(mut self) -> Self {
        self.unsigned_payload = true;
        self
    }

    /// Reject requests that can never be valid. Runs before anything is sent.
    pub fn validate(&self) -> Result<()> {
        if matches!(self.bucket.as_deref(), Some("")) {
            return Err(SufyError::Validation("bucket name is empty".to_string()));
        }
        if matches!(self.key.as_deref(), Some("")) {
            return Err(SufyError::Validation("object key is empty".to_string()));
        }
        if self.key.is_some() && self.bucket.is_none() {
            return Err(SufyError::Validation("object key given without a bucket".to_string()));
        }
        Ok(())
    }
}

/// A successful response. Headers are kept verbatim.
#[derive(Debug, Clone)]
pub struct SufyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl SufyResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `X-Sufy-Request-Id`, falling back to `X-Reqid`
    pub fn request_id(&self) -> Option<&str> {
        self.header(REQUEST_ID_HEADER)
            .or_else(|| self.header(REQID_HEADER))
    }

    pub fn etag(&self) -> Option<String> {
        self.header("etag").map(str::to_string)
    }

    /// Decode the JSON body
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.body.is_empty() {
            return Err(SufyError::InvalidResponse(format!(
                "expected a JSON body, got an empty {} response",
                self.status.as_u16()
            )));
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// `X-Sufy-Meta-*` headers, prefix stripped
    pub fn user_metadata(&self) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .filter_map(|(name, value)| {
                let name = name.as_str().strip_prefix(META_PREFIX)?;
                let value = value.to_str().ok()?;
                Some((name.to_string(), value.to_string()))
            })
            .collect()
    }

    pub fn object_metadata(&self) -> ObjectMetadata {
        ObjectMetadata {
            content_length: self
                .header("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(self.body.len() as u64),
            content_type: self.header("content-type").map(str::to_string),
            etag: self.etag(),
            last_modified: self.header("last-modified").map(str::to_string),
            storage_class: self.header("x-sufy-storage-class").map(str::to_string),
            metadata: self.user_metadata(),
            request_id: self.request_id().map(str::to_string),
        }
    }
}

/// Signs and sends requests over a [`Transport`]
#[derive(Clone)]
pub struct Dispatcher {
    endpoint: Endpoint,
    signer: Signer,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("endpoint", &self.endpoint)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(endpoint: Endpoint, signer: Signer, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoint,
            signer,
            transport,
        }
    }

    pub fn with_clock(&self, clock: Arc<dyn Clock>) -> Self {
        Self {
            signer: self.signer.clone().with_clock(clock),
            ..self.clone()
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Build the signed wire request
    pub fn prepare(&self, request: &SufyRequest) -> Result<HttpRequest> {
        request.validate()?;

        let bucket = request.bucket.as_deref();
        let host = self.endpoint.host_for(bucket);
        let path = self.endpoint.path_for(bucket, request.key.as_deref());

        let mut headers = HeaderMap::with_capacity(request.headers.len() + 6);
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| SufyError::Validation(format!("invalid header name: {:?}", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| SufyError::Validation(format!("invalid value for header {}", name)))?;
            headers.append(name, value);
        }
        if request.method == Method::PUT || request.method == Method::POST || !request.body.is_empty() {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(request.body.len()));
        }
        if !request.body.is_empty() && !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        }

        let hash = payload_hash(&request.body, request.unsigned_payload);
        self.signer.sign(
            &request.method,
            &host,
            &path,
            &request.query,
            &mut headers,
            &hash,
        )?;

        let query = wire_query(&request.query);
        let mut uri = format!(
            "{}://{}{}",
            self.endpoint.scheme,
            self.endpoint.authority_for(bucket),
            path
        );
        if !query.is_empty() {
            uri.push('?');
            uri.push_str(&query);
        }
        let uri: Uri = uri
            .parse()
            .map_err(|e| SufyError::Validation(format!("invalid request URI {:?}: {}", uri, e)))?;

        Ok(HttpRequest {
            method: request.method.clone(),
            uri,
            headers,
            body: request.body.clone(),
        })
    }

    /// One signed round trip. Non-2xx responses come back classified.
    pub async fn send(&self, request: SufyRequest) -> Result<SufyResponse> {
        let http = self.prepare(&request)?;
        let method = http.method.clone();
        let uri = http.uri.clone();
        let started = Instant::now();

        let response = match self.transport.execute(http).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(method = %method, uri = %uri, error = %e, "sufy request failed");
                return Err(e.into());
            }
        };

        let request_id = response
            .headers
            .get(REQUEST_ID_HEADER)
            .or_else(|| response.headers.get(REQID_HEADER))
            .and_then(|v| v.to_str().ok());
        tracing::debug!(
            method = %method,
            uri = %uri,
            status = response.status.as_u16(),
            request_id = request_id.unwrap_or("-"),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sufy request"
        );

        if !response.status.is_success() {
            let err = classify(response.status, &response.headers, &response.body, request.resource);
            return Err(err.into());
        }

        let missing = missing_request_id_headers(&response.headers);
        if !missing.is_empty() {
            tracing::warn!(
                method = %method,
                uri = %uri,
                missing = ?missing,
                "response lacks request id headers"
            );
        }

        Ok(SufyResponse {
            status: response.status,
            headers: response.headers,
            body: response.body,
        })
    }
}

/// Request id headers a successful response should carry but does not
fn missing_request_id_headers(headers: &HeaderMap) -> Vec<&'static str> {
    [REQUEST_ID_HEADER, REQID_HEADER]
        .into_iter()
        .filter(|name| !headers.contains_key(*name))
        .collect()
}
