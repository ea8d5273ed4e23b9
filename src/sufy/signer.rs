//! Sufy request signer
//!
//! Signs the canonical form of a request with HMAC-SHA256 keyed by the secret
//! key and emits `Authorization: Sufy <access-key>:<signature>`, where the
//! signature is the URL-safe base64 of the keyed hash.
//!
//! Signing is pure given the request, the credentials and the clock reading.
//! The clock is injected so tests can pin the timestamp.

use crate::sufy::canonical::CanonicalRequest;
use crate::sufy::error::{Result, SufyError};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use hyper::header::{HeaderName, HeaderValue, AUTHORIZATION, HOST, USER_AGENT};
use hyper::{HeaderMap, Method};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Authorization scheme
pub const AUTH_SCHEME: &str = "Sufy";

/// Signing timestamp header
pub const DATE_HEADER: &str = "x-sufy-date";

/// Payload hash header
pub const CONTENT_SHA256_HEADER: &str = "x-sufy-content-sha256";

/// `X-Sufy-Date` format, e.g. `20230413T012347Z`
pub const DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// User-Agent sent with every request
pub const SDK_USER_AGENT: &str = concat!("sufy-sdk-rust/", env!("CARGO_PKG_VERSION"));

/// SHA256 of the empty payload
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Payload hash for bodies that are not hashed (large part uploads)
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Time source for signing
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Access key / secret key pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key: String,
    secret_key: String,
}

impl Credentials {
    /// Both keys must be non-empty. The access key may not contain `:` or
    /// whitespace since it is embedded in the Authorization header.
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Result<Self> {
        let access_key = access_key.into();
        let secret_key = secret_key.into();

        if access_key.is_empty() {
            return Err(SufyError::Config("access key is empty".to_string()));
        }
        if secret_key.is_empty() {
            return Err(SufyError::Config("secret key is empty".to_string()));
        }
        if access_key.contains(':') || access_key.chars().any(char::is_whitespace) {
            return Err(SufyError::Config(
                "access key contains ':' or whitespace".to_string(),
            ));
        }

        Ok(Self {
            access_key,
            secret_key,
        })
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Output of signing a request
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub canonical: CanonicalRequest,
    /// Value written to `X-Sufy-Date`
    pub date: String,
    /// Value written to `Authorization`
    pub authorization: String,
}

/// Payload hash for a body
pub fn payload_hash(body: &[u8], unsigned: bool) -> String {
    if unsigned {
        UNSIGNED_PAYLOAD.to_string()
    } else if body.is_empty() {
        EMPTY_SHA256.to_string()
    } else {
        hex::encode(Sha256::digest(body))
    }
}

/// Request signer. Cheap to clone.
#[derive(Clone)]
pub struct Signer {
    credentials: Credentials,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Sign a request in place.
    ///
    /// `host` is written to the Host header, then the date, payload hash and
    /// User-Agent headers are stamped before the canonical form is computed,
    /// so all of them (except User-Agent) are covered by the signature.
    /// Finally the Authorization header is added.
    pub fn sign(
        &self,
        method: &Method,
        host: &str,
        path: &str,
        query: &[(String, Option<String>)],
        headers: &mut HeaderMap,
        payload_hash: &str,
    ) -> Result<SignedRequest> {
        let date = self.clock.now().format(DATE_FORMAT).to_string();

        headers.insert(HOST, header_value(host)?);
        headers.insert(HeaderName::from_static(DATE_HEADER), header_value(&date)?);
        headers.insert(
            HeaderName::from_static(CONTENT_SHA256_HEADER),
            header_value(payload_hash)?,
        );
        headers.insert(USER_AGENT, HeaderValue::from_static(SDK_USER_AGENT));

        let canonical = CanonicalRequest::new(method, path, query, headers, payload_hash);
        tracing::trace!(canonical = %canonical.to_canonical_string(), "canonical request");
        let authorization = format!(
            "{} {}:{}",
            AUTH_SCHEME,
            self.credentials.access_key,
            self.signature(&canonical)
        );
        headers.insert(AUTHORIZATION, header_value(&authorization)?);

        Ok(SignedRequest {
            canonical,
            date,
            authorization,
        })
    }

    /// Signature over a canonical request
    pub fn signature(&self, canonical: &CanonicalRequest) -> String {
        let mac = Self::hmac_sha256(
            self.credentials.secret_key.as_bytes(),
            canonical.to_canonical_string().as_bytes(),
        );
        URL_SAFE.encode(mac)
    }

    /// HMAC-SHA256 returning fixed-size array
    fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
        mac.update(msg);
        let result = mac.finalize().into_bytes();
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        output
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| SufyError::Validation(format!("invalid header value: {:?}", value)))
}

/// Split `Sufy <ak>:<sig>` into its parts
pub fn parse_authorization(value: &str) -> Option<(&str, &str)> {
    let rest = value.strip_prefix(AUTH_SCHEME)?.strip_prefix(' ')?;
    rest.split_once(':')
}
