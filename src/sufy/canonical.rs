//! Canonical request form
//!
//! The canonical form is what the signer hashes. It must be byte-identical to
//! what the server reconstructs from the wire request:
//! - header names lower-cased and sorted, repeated headers joined with `,` in
//!   the order they were added, values trimmed
//! - query parameters percent-encoded and sorted by key then value, with bare
//!   keys (`?uploads`, `?acl`) rendered as `key=`
//! - the path percent-encoded with `/` preserved

use hyper::{HeaderMap, Method};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Hex lookup table for percent encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Query parameters as (key, value). `None` is a bare key.
pub type QueryParams = Vec<(String, Option<String>)>;

#[inline]
fn is_unreserved(byte: u8) -> bool {
    matches!(byte, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~')
}

/// Percent-encode (RFC 3986). Borrows when nothing needs encoding.
pub fn uri_encode(s: &str, encode_slash: bool) -> Cow<'_, str> {
    let keep = |b: u8| is_unreserved(b) || (b == b'/' && !encode_slash);
    if s.bytes().all(keep) {
        return Cow::Borrowed(s);
    }

    let mut result = String::with_capacity(s.len() + 16);
    for byte in s.bytes() {
        if keep(byte) {
            result.push(byte as char);
        } else {
            result.push('%');
            result.push(HEX_UPPER[(byte >> 4) as usize] as char);
            result.push(HEX_UPPER[(byte & 0xf) as usize] as char);
        }
    }
    Cow::Owned(result)
}

/// Headers that take part in the signature
pub fn is_signed_header(name: &str) -> bool {
    matches!(name, "host" | "content-type" | "content-md5") || name.starts_with("x-sufy-")
}

fn encoded_sorted(params: &[(String, Option<String>)]) -> Vec<(String, Option<String>)> {
    let mut encoded: Vec<(String, Option<String>)> = params
        .iter()
        .map(|(k, v)| {
            (
                uri_encode(k, true).into_owned(),
                v.as_deref().map(|v| uri_encode(v, true).into_owned()),
            )
        })
        .collect();
    encoded.sort();
    encoded
}

/// Canonical query string. Bare keys are rendered as `key=`.
pub fn canonical_query(params: &[(String, Option<String>)]) -> String {
    encoded_sorted(params)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v.as_deref().unwrap_or("")))
        .collect::<Vec<_>>()
        .join("&")
}

/// Query string as sent on the wire: same order as the canonical form, bare
/// keys without `=`.
pub fn wire_query(params: &[(String, Option<String>)]) -> String {
    let mut query = String::new();
    for (k, v) in encoded_sorted(params) {
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&k);
        if let Some(v) = v {
            query.push('=');
            query.push_str(&v);
        }
    }
    query
}

/// Parse a raw query string back into decoded parameters
pub fn parse_query(raw: &str) -> QueryParams {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode(k), Some(decode(v))),
            None => (decode(pair), None),
        })
        .collect()
}

fn decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| s.to_string())
}

/// A request reduced to the form the signature covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    pub method: String,
    /// Percent-encoded path
    pub path: String,
    pub query: String,
    /// Signed headers, lower-cased and sorted, values joined
    pub headers: Vec<(String, String)>,
    /// `;`-joined names of the signed headers
    pub signed_headers: String,
    pub payload_hash: String,
}

impl CanonicalRequest {
    /// Build from an already-encoded path and decoded query parameters
    pub fn new(
        method: &Method,
        path: &str,
        query: &[(String, Option<String>)],
        headers: &HeaderMap,
        payload_hash: &str,
    ) -> Self {
        // HeaderMap names are already lower-case; BTreeMap sorts them
        let mut grouped: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for name in headers.keys() {
            if !is_signed_header(name.as_str()) {
                continue;
            }
            let values = headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).trim().to_string())
                .collect();
            grouped.insert(name.as_str(), values);
        }

        let signed_headers = grouped.keys().copied().collect::<Vec<_>>().join(";");
        let headers = grouped
            .into_iter()
            .map(|(name, values)| (name.to_string(), values.join(",")))
            .collect();

        Self {
            method: method.as_str().to_string(),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            query: canonical_query(query),
            headers,
            signed_headers,
            payload_hash: payload_hash.to_string(),
        }
    }

    /// Serialized canonical form, the exact bytes fed to the keyed hash
    pub fn to_canonical_string(&self) -> String {
        let mut canonical_headers = String::with_capacity(self.headers.len() * 64);
        for (name, value) in &self.headers {
            canonical_headers.push_str(name);
            canonical_headers.push(':');
            canonical_headers.push_str(value);
            canonical_headers.push('\n');
        }

        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.method,
            self.path,
            self.query,
            canonical_headers,
            self.signed_headers,
            self.payload_hash
        )
    }
}
