//! Error taxonomy and response classification
//!
//! Every failed response is classified into a [`ServiceError`] carrying the
//! status, the server's error code, message and request id. Classification
//! consults the structured body first (JSON as Sufy sends it, XML as
//! S3-compatible gateways send it) and falls back to the status code plus the
//! kind of resource the request addressed. HEAD responses never carry a body,
//! so the fallback is what turns a bare 404 into `NoSuchKey` or
//! `NoSuchBucket`.

use bytes::Bytes;
use hyper::{HeaderMap, StatusCode};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Response header carrying the request id
pub const REQUEST_ID_HEADER: &str = "x-sufy-request-id";

/// Legacy request id header, sent alongside `X-Sufy-Request-Id`
pub const REQID_HEADER: &str = "x-reqid";

/// Bucket sub-resources that hold an optional configuration document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    Cors,
    Lifecycle,
    Policy,
    Tagging,
}

impl ConfigKind {
    /// Bare query key selecting this sub-resource (`?cors`, `?policy`, ...)
    pub fn query_key(self) -> &'static str {
        match self {
            ConfigKind::Cors => "cors",
            ConfigKind::Lifecycle => "lifecycle",
            ConfigKind::Policy => "policy",
            ConfigKind::Tagging => "tagging",
        }
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.query_key())
    }
}

/// What a request addresses. Decides how a body-less 404 is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Service,
    Bucket,
    Object,
    Upload,
    Config(ConfigKind),
    /// Sub-resources whose absence is not a "no such X" condition (acl, location, ...)
    Other,
}

/// Classified failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoSuchKey,
    NoSuchBucket,
    NoSuchUpload,
    NoSuchConfiguration(ConfigKind),
    SignatureMismatch,
    NotImplemented,
    /// 429: the server asked the client to back off
    SlowDown,
    /// Transient 5xx fault
    RetryableServerError,
    /// Unknown code or status, kept for forward compatibility
    Other,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::SlowDown | ErrorKind::RetryableServerError)
    }

    pub fn is_not_found(self) -> bool {
        matches!(
            self,
            ErrorKind::NoSuchKey
                | ErrorKind::NoSuchBucket
                | ErrorKind::NoSuchUpload
                | ErrorKind::NoSuchConfiguration(_)
        )
    }
}

/// A classified server response
#[derive(Debug, Clone)]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub status: StatusCode,
    /// Error code from the response body, if the body carried one
    pub code: Option<String>,
    pub message: String,
    pub request_id: Option<String>,
    pub resource: Resource,
    /// Raw response body
    pub body: Bytes,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status.as_u16())?;
        if let Some(code) = &self.code {
            write!(f, " {}", code)?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(id) = &self.request_id {
            write!(f, " (request id: {})", id)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServiceError {}

/// Network-level failures. Always surfaced, never swallowed.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request build error: {0}")]
    Build(#[from] hyper::http::Error),

    #[error("connection error: {0}")]
    Connect(#[from] hyper_util::client::legacy::Error),

    #[error("body error: {0}")]
    Body(#[from] hyper::Error),

    #[error("TLS setup error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

/// Client errors
#[derive(Error, Debug)]
pub enum SufyError {
    /// Rejected before anything was sent
    #[error("invalid request: {0}")]
    Validation(String),

    /// Missing or malformed credentials / endpoint
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("service error: {0}")]
    Service(Box<ServiceError>),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ServiceError> for SufyError {
    fn from(err: ServiceError) -> Self {
        SufyError::Service(Box::new(err))
    }
}

impl SufyError {
    /// The classified kind, for service errors
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SufyError::Service(e) => Some(e.kind),
            _ => None,
        }
    }

    /// HTTP status, for service errors
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            SufyError::Service(e) => Some(e.status),
            _ => None,
        }
    }

    pub fn service(&self) -> Option<&ServiceError> {
        match self {
            SufyError::Service(e) => Some(e),
            _ => None,
        }
    }

    /// Only classified transient server faults qualify
    pub fn is_retryable(&self) -> bool {
        self.kind().is_some_and(ErrorKind::is_retryable)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind().is_some_and(ErrorKind::is_not_found)
    }
}

pub type Result<T> = std::result::Result<T, SufyError>;

/// JSON error body. Field casing differs between endpoints.
#[derive(Debug, Default, Deserialize)]
struct JsonErrorBody {
    #[serde(default, alias = "Code", alias = "error")]
    code: Option<String>,
    #[serde(default, alias = "Message")]
    message: Option<String>,
    #[serde(default, alias = "RequestId", alias = "request_id", alias = "reqid")]
    request_id: Option<String>,
}

#[derive(Debug, Default)]
struct ParsedErrorBody {
    code: Option<String>,
    message: Option<String>,
    request_id: Option<String>,
}

/// Classify a non-success response
pub fn classify(
    status: StatusCode,
    headers: &HeaderMap,
    body: &Bytes,
    resource: Resource,
) -> ServiceError {
    let parsed = parse_error_body(body).unwrap_or_default();

    let kind = match parsed.code.as_deref().filter(|c| !c.is_empty()) {
        Some(code) => kind_from_code(code),
        None => kind_from_status(status, resource),
    };

    let request_id = parsed.request_id.or_else(|| {
        header_str(headers, REQUEST_ID_HEADER)
            .or_else(|| header_str(headers, REQID_HEADER))
            .map(str::to_string)
    });

    let message = parsed.message.unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("unknown status")
            .to_string()
    });

    ServiceError {
        kind,
        status,
        code: parsed.code,
        message,
        request_id,
        resource,
        body: body.clone(),
    }
}

/// Map a body error code. Comparison ignores case since servers disagree on it.
fn kind_from_code(code: &str) -> ErrorKind {
    match code.to_ascii_lowercase().as_str() {
        "nosuchkey" => ErrorKind::NoSuchKey,
        "nosuchbucket" => ErrorKind::NoSuchBucket,
        "nosuchupload" => ErrorKind::NoSuchUpload,
        "nosuchcorsconfiguration" => ErrorKind::NoSuchConfiguration(ConfigKind::Cors),
        "nosuchlifecycleconfiguration" => ErrorKind::NoSuchConfiguration(ConfigKind::Lifecycle),
        "nosuchbucketpolicy" => ErrorKind::NoSuchConfiguration(ConfigKind::Policy),
        "nosuchtagset" | "nosuchtagging" | "nosuchtagsetconfiguration" => {
            ErrorKind::NoSuchConfiguration(ConfigKind::Tagging)
        }
        "signaturedoesnotmatch" => ErrorKind::SignatureMismatch,
        "notimplemented" => ErrorKind::NotImplemented,
        "slowdown" | "toomanyrequests" => ErrorKind::SlowDown,
        "internalerror" | "serviceunavailable" | "badgateway" | "gatewaytimeout" => {
            ErrorKind::RetryableServerError
        }
        _ => ErrorKind::Other,
    }
}

fn kind_from_status(status: StatusCode, resource: Resource) -> ErrorKind {
    match status {
        StatusCode::NOT_FOUND => match resource {
            Resource::Object => ErrorKind::NoSuchKey,
            Resource::Bucket | Resource::Service => ErrorKind::NoSuchBucket,
            Resource::Upload => ErrorKind::NoSuchUpload,
            Resource::Config(kind) => ErrorKind::NoSuchConfiguration(kind),
            Resource::Other => ErrorKind::Other,
        },
        StatusCode::FORBIDDEN => ErrorKind::SignatureMismatch,
        StatusCode::NOT_IMPLEMENTED => ErrorKind::NotImplemented,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::SlowDown,
        s if s.is_server_error() => ErrorKind::RetryableServerError,
        _ => ErrorKind::Other,
    }
}

fn parse_error_body(body: &[u8]) -> Option<ParsedErrorBody> {
    let first = body.iter().find(|b| !b.is_ascii_whitespace())?;
    match first {
        b'{' => {
            let json: JsonErrorBody = serde_json::from_slice(body).ok()?;
            Some(ParsedErrorBody {
                code: json.code,
                message: json.message,
                request_id: json.request_id,
            })
        }
        b'<' => parse_xml_error(body),
        _ => None,
    }
}

/// Parse `<Error><Code/><Message/><RequestId/></Error>`
fn parse_xml_error(body: &[u8]) -> Option<ParsedErrorBody> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut parsed = ParsedErrorBody::default();
    let mut current_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Text(e)) => {
                current_text.clear();
                current_text.push_str(&e.unescape().ok()?);
            }
            Ok(Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"Code" => parsed.code = Some(std::mem::take(&mut current_text)),
                    b"Message" => parsed.message = Some(std::mem::take(&mut current_text)),
                    b"RequestId" => parsed.request_id = Some(std::mem::take(&mut current_text)),
                    _ => {}
                }
                current_text.clear();
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
    }

    Some(parsed)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
