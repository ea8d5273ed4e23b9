//! In-memory Sufy server for integration tests
//!
//! Implements `Transport`, so the client runs its real signing, addressing
//! and classification path against it. Every request's signature is checked
//! with the shared test credentials, and every response carries
//! `X-Sufy-Request-Id`, `X-Reqid` and `Date`. Only path-style addressing is
//! understood.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use hyper::header::HeaderValue;
use hyper::{HeaderMap, Method, StatusCode};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use sufy::sufy::canonical::{parse_query, CanonicalRequest};
use sufy::sufy::signer::{
    parse_authorization, payload_hash, CONTENT_SHA256_HEADER, UNSIGNED_PAYLOAD,
};
use sufy::sufy::{
    Credentials, HttpRequest, HttpResponse, RecordingTransport, Signer, SufyClient, Transport,
    TransportError,
};
use sufy::ClientConfig;

pub const ACCESS_KEY: &str = "test-access-key";
pub const SECRET_KEY: &str = "test-secret-key";
pub const ENDPOINT: &str = "http://sufy.test:9000";
pub const DEFAULT_REGION: &str = "z0";
const LAST_MODIFIED: &str = "2023-04-13T01:23:47Z";

struct StoredObject {
    data: Bytes,
    etag: String,
    content_type: Option<String>,
    storage_class: Option<String>,
    metadata: Vec<(String, String)>,
}

struct Upload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (Bytes, String)>,
    content_type: Option<String>,
}

#[derive(Default)]
struct Bucket {
    objects: BTreeMap<String, StoredObject>,
    configs: HashMap<String, Bytes>,
    region: String,
}

#[derive(Default)]
struct State {
    buckets: BTreeMap<String, Bucket>,
    uploads: BTreeMap<String, Upload>,
    next_upload: u64,
}

/// Listing entry: a key or a rolled-up prefix
enum Entry {
    Object(String),
    Prefix(String),
}

impl Entry {
    fn name(&self) -> &str {
        match self {
            Entry::Object(k) | Entry::Prefix(k) => k,
        }
    }
}

pub struct FakeSufy {
    signer: Signer,
    state: Mutex<State>,
    requests: AtomicUsize,
    next_request_id: AtomicUsize,
    injected: Mutex<VecDeque<(StatusCode, &'static str)>>,
    failing_parts: Mutex<HashSet<u32>>,
}

fn etag_of(data: &[u8]) -> String {
    format!("\"{:x}\"", md5::compute(data))
}

fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn parse_range(value: &str, len: usize) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = end.parse().ok()?;
    (start <= end && start < len).then(|| (start, end.min(len - 1)))
}

fn decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

impl FakeSufy {
    pub fn new() -> Self {
        Self {
            signer: Signer::new(Credentials::new(ACCESS_KEY, SECRET_KEY).unwrap()),
            state: Mutex::new(State::default()),
            requests: AtomicUsize::new(0),
            next_request_id: AtomicUsize::new(1),
            injected: Mutex::new(VecDeque::new()),
            failing_parts: Mutex::new(HashSet::new()),
        }
    }

    /// Number of HTTP requests received
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Answer the next request with `status` and error `code` instead of handling it
    pub fn inject_failure(&self, status: StatusCode, code: &'static str) {
        self.injected.lock().unwrap().push_back((status, code));
    }

    /// Reject every upload of `part_number` with a 500
    pub fn fail_part(&self, part_number: u32) {
        self.failing_parts.lock().unwrap().insert(part_number);
    }

    pub fn create_bucket(&self, name: &str) {
        self.state.lock().unwrap().buckets.insert(
            name.to_string(),
            Bucket {
                region: DEFAULT_REGION.to_string(),
                ..Bucket::default()
            },
        );
    }

    pub fn put_raw(&self, bucket: &str, key: &str, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let bucket = state.buckets.get_mut(bucket).expect("bucket exists");
        bucket.objects.insert(
            key.to_string(),
            StoredObject {
                data: Bytes::copy_from_slice(data),
                etag: etag_of(data),
                content_type: None,
                storage_class: None,
                metadata: Vec::new(),
            },
        );
    }

    pub fn object_exists(&self, bucket: &str, key: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .buckets
            .get(bucket)
            .is_some_and(|b| b.objects.contains_key(key))
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.buckets.get(bucket).map_or(0, |b| b.objects.len())
    }

    pub fn open_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    // =========================================================================
    // Responses
    // =========================================================================

    fn respond(&self, status: StatusCode) -> HttpResponse {
        let id = format!(
            "req-{:08}",
            self.next_request_id.fetch_add(1, Ordering::SeqCst)
        );
        let mut response = HttpResponse::new(status);
        let id = HeaderValue::from_str(&id).unwrap();
        response.headers.insert("x-sufy-request-id", id.clone());
        response.headers.insert("x-reqid", id);
        response
            .headers
            .insert("date", HeaderValue::from_str(&http_date()).unwrap());
        response
    }

    fn json(&self, status: StatusCode, value: Value) -> HttpResponse {
        let mut response = self.respond(status);
        response
            .headers
            .insert("content-type", HeaderValue::from_static("application/json"));
        response.body = Bytes::from(serde_json::to_vec(&value).unwrap());
        response
    }

    fn error(&self, status: StatusCode, code: &str, message: &str) -> HttpResponse {
        let mut response = self.respond(status);
        let id = response.headers["x-sufy-request-id"].to_str().unwrap().to_string();
        response
            .headers
            .insert("content-type", HeaderValue::from_static("application/json"));
        response.body = Bytes::from(
            serde_json::to_vec(&json!({"code": code, "message": message, "requestId": id})).unwrap(),
        );
        response
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    fn verify(&self, request: &HttpRequest) -> Option<HttpResponse> {
        let forbidden = |code: &str| Some(self.error(StatusCode::FORBIDDEN, code, "authentication failed"));

        let Some(auth) = request
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
        else {
            return forbidden("AccessDenied");
        };
        let Some((access_key, signature)) = parse_authorization(auth) else {
            return forbidden("AccessDenied");
        };
        if access_key != ACCESS_KEY {
            return forbidden("InvalidAccessKeyId");
        }
        if request.headers.get("x-sufy-date").is_none() {
            return forbidden("AccessDenied");
        }

        let claimed_hash = request
            .headers
            .get(CONTENT_SHA256_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if claimed_hash != UNSIGNED_PAYLOAD && claimed_hash != payload_hash(&request.body, false) {
            return Some(self.error(
                StatusCode::BAD_REQUEST,
                "XSufyContentSHA256Mismatch",
                "payload hash mismatch",
            ));
        }

        let query = parse_query(request.uri.query().unwrap_or(""));
        let canonical = CanonicalRequest::new(
            &request.method,
            request.uri.path(),
            &query,
            &request.headers,
            claimed_hash,
        );
        if self.signer.signature(&canonical) != signature {
            return forbidden("SignatureDoesNotMatch");
        }
        None
    }

    // =========================================================================
    // Routing
    // =========================================================================

    fn handle(&self, request: HttpRequest) -> HttpResponse {
        if let Some((status, code)) = self.injected.lock().unwrap().pop_front() {
            return self.error(status, code, "injected failure");
        }
        if let Some(denied) = self.verify(&request) {
            return denied;
        }

        let query: BTreeMap<String, Option<String>> = parse_query(request.uri.query().unwrap_or(""))
            .into_iter()
            .collect();
        let path = request.uri.path().trim_start_matches('/').to_string();
        let (bucket, key) = match path.split_once('/') {
            Some((b, k)) if !k.is_empty() => (decode(b), Some(decode(k))),
            Some((b, _)) => (decode(b), None),
            None => (decode(&path), None),
        };

        if bucket.is_empty() {
            return match request.method {
                Method::GET => self.list_buckets(),
                _ => self.error(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", "service"),
            };
        }
        if query.contains_key("acl") {
            return self.error(StatusCode::NOT_IMPLEMENTED, "NotImplemented", "acl is not supported");
        }

        match key {
            None => self.handle_bucket(&request, &bucket, &query),
            Some(key) => self.handle_object(&request, &bucket, &key, &query),
        }
    }

    fn list_buckets(&self) -> HttpResponse {
        let state = self.state.lock().unwrap();
        let buckets: Vec<Value> = state
            .buckets
            .iter()
            .map(|(name, b)| {
                json!({
                    "name": name,
                    "creationDate": LAST_MODIFIED,
                    "locationConstraint": b.region,
                })
            })
            .collect();
        self.json(
            StatusCode::OK,
            json!({"buckets": buckets, "owner": {"id": "owner-1", "displayName": "tester"}}),
        )
    }

    fn no_such_bucket(&self, bucket: &str) -> HttpResponse {
        self.error(StatusCode::NOT_FOUND, "NoSuchBucket", &format!("bucket {} does not exist", bucket))
    }

    fn handle_bucket(
        &self,
        request: &HttpRequest,
        bucket: &str,
        query: &BTreeMap<String, Option<String>>,
    ) -> HttpResponse {
        if request.method == Method::PUT && query.is_empty() {
            return self.create_bucket_op(request, bucket);
        }

        let exists = self.state.lock().unwrap().buckets.contains_key(bucket);
        if !exists {
            // HEAD responses never carry a body
            if request.method == Method::HEAD {
                return self.respond(StatusCode::NOT_FOUND);
            }
            return self.no_such_bucket(bucket);
        }

        for kind in ["cors", "lifecycle", "policy", "tagging"] {
            if query.contains_key(kind) {
                return self.bucket_config(request, bucket, kind);
            }
        }

        match (&request.method, query) {
            (&Method::HEAD, _) => {
                let state = self.state.lock().unwrap();
                let mut response = self.respond(StatusCode::OK);
                response.headers.insert(
                    "x-sufy-bucket-region",
                    HeaderValue::from_str(&state.buckets[bucket].region).unwrap(),
                );
                response
            }
            (&Method::DELETE, _) => {
                let mut state = self.state.lock().unwrap();
                if !state.buckets[bucket].objects.is_empty() {
                    drop(state);
                    return self.error(StatusCode::CONFLICT, "BucketNotEmpty", "bucket is not empty");
                }
                state.buckets.remove(bucket);
                drop(state);
                self.respond(StatusCode::NO_CONTENT)
            }
            (&Method::GET, q) if q.contains_key("location") => {
                let region = self.state.lock().unwrap().buckets[bucket].region.clone();
                self.json(StatusCode::OK, json!({"locationConstraint": region}))
            }
            (&Method::GET, q) if q.contains_key("policyStatus") => {
                let public = self.state.lock().unwrap().buckets[bucket]
                    .configs
                    .contains_key("policy");
                self.json(StatusCode::OK, json!({"policyStatus": {"isPublic": public}}))
            }
            (&Method::GET, q) if q.contains_key("uploads") => self.list_uploads(bucket, q),
            (&Method::POST, q) if q.contains_key("delete") => self.delete_objects(request, bucket),
            (&Method::GET, q) => {
                if q.get("list-type").cloned().flatten().as_deref() == Some("2") {
                    self.list_objects_v2(bucket, q)
                } else {
                    self.list_objects_v1(bucket, q)
                }
            }
            _ => self.error(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", "bucket"),
        }
    }

    fn create_bucket_op(&self, request: &HttpRequest, bucket: &str) -> HttpResponse {
        let region = if request.body.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            match serde_json::from_slice::<Value>(&request.body) {
                Ok(v) => v["locationConstraint"]
                    .as_str()
                    .unwrap_or(DEFAULT_REGION)
                    .to_string(),
                Err(_) => return self.error(StatusCode::BAD_REQUEST, "MalformedJSON", "bad body"),
            }
        };

        let mut state = self.state.lock().unwrap();
        if state.buckets.contains_key(bucket) {
            drop(state);
            return self.error(StatusCode::CONFLICT, "BucketAlreadyOwnedByYou", "exists");
        }
        state.buckets.insert(
            bucket.to_string(),
            Bucket {
                region,
                ..Bucket::default()
            },
        );
        drop(state);

        let mut response = self.respond(StatusCode::OK);
        response
            .headers
            .insert("location", HeaderValue::from_str(&format!("/{}", bucket)).unwrap());
        response
    }

    fn bucket_config(&self, request: &HttpRequest, bucket: &str, kind: &str) -> HttpResponse {
        match request.method {
            Method::PUT => {
                let declared = request.headers.get("content-md5").and_then(|v| v.to_str().ok());
                let actual = STANDARD.encode(md5::compute(&request.body).0);
                if declared != Some(actual.as_str()) {
                    return self.error(StatusCode::BAD_REQUEST, "InvalidDigest", "Content-MD5 mismatch");
                }
                if kind == "cors"
                    && request.headers.get("content-type").map(|v| v.as_bytes())
                        != Some(b"application/json".as_slice())
                {
                    return self.error(StatusCode::BAD_REQUEST, "InvalidArgument", "cors needs JSON");
                }
                if serde_json::from_slice::<Value>(&request.body).is_err() {
                    return self.error(StatusCode::BAD_REQUEST, "MalformedJSON", "bad document");
                }
                let mut state = self.state.lock().unwrap();
                state
                    .buckets
                    .get_mut(bucket)
                    .unwrap()
                    .configs
                    .insert(kind.to_string(), request.body.clone());
                drop(state);
                self.respond(StatusCode::OK)
            }
            Method::DELETE => {
                let mut state = self.state.lock().unwrap();
                state.buckets.get_mut(bucket).unwrap().configs.remove(kind);
                drop(state);
                self.respond(StatusCode::NO_CONTENT)
            }
            Method::GET => {
                let stored = self.state.lock().unwrap().buckets[bucket].configs.get(kind).cloned();
                match stored {
                    Some(body) => {
                        let mut response = self.respond(StatusCode::OK);
                        response.body = body;
                        response
                    }
                    // Each sub-resource reports absence differently
                    None => match kind {
                        "cors" => self.error(StatusCode::NOT_FOUND, "NoSuchCORSConfiguration", "no cors"),
                        "lifecycle" => {
                            let mut response = self.respond(StatusCode::NOT_FOUND);
                            response.body = Bytes::from_static(
                                br#"{"Code":"NoSuchLifecycleConfiguration","Message":"no lifecycle"}"#,
                            );
                            response
                        }
                        "policy" => {
                            let mut response = self.respond(StatusCode::NOT_FOUND);
                            response.body = Bytes::from_static(
                                b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                                  <Error><Code>NoSuchBucketPolicy</Code>\
                                  <Message>no policy</Message></Error>",
                            );
                            response
                        }
                        _ => self.respond(StatusCode::NOT_FOUND),
                    },
                }
            }
            _ => self.error(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", kind),
        }
    }

    // =========================================================================
    // Listing
    // =========================================================================

    fn collect_entries(
        bucket: &Bucket,
        prefix: &str,
        delimiter: Option<&str>,
        after: Option<&str>,
        max: usize,
    ) -> (Vec<Entry>, bool) {
        let delimiter = delimiter.filter(|d| !d.is_empty());
        let mut entries: Vec<Entry> = Vec::new();
        let mut truncated = false;

        for key in bucket.objects.keys() {
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some(after) = after {
                if key.as_str() <= after {
                    continue;
                }
                // Resuming after a rolled-up prefix skips everything under it
                if delimiter.is_some_and(|d| after.ends_with(d)) && key.starts_with(after) {
                    continue;
                }
            }

            let entry = match delimiter.and_then(|d| key[prefix.len()..].find(d).map(|i| (d, i))) {
                Some((d, i)) => Entry::Prefix(key[..prefix.len() + i + d.len()].to_string()),
                None => Entry::Object(key.clone()),
            };
            if let (Entry::Prefix(p), Some(Entry::Prefix(last))) = (&entry, entries.last()) {
                if p == last {
                    continue;
                }
            }

            if entries.len() == max {
                truncated = true;
                break;
            }
            entries.push(entry);
        }
        (entries, truncated)
    }

    fn render_entries(bucket: &Bucket, entries: &[Entry]) -> (Vec<Value>, Vec<Value>) {
        let mut contents = Vec::new();
        let mut prefixes = Vec::new();
        for entry in entries {
            match entry {
                Entry::Object(key) => {
                    let object = &bucket.objects[key];
                    contents.push(json!({
                        "key": key,
                        "size": object.data.len(),
                        "eTag": object.etag,
                        "lastModified": LAST_MODIFIED,
                        "storageClass": object.storage_class.clone().unwrap_or_else(|| "STANDARD".to_string()),
                    }));
                }
                Entry::Prefix(prefix) => prefixes.push(json!({"prefix": prefix})),
            }
        }
        (contents, prefixes)
    }

    fn max_param(query: &BTreeMap<String, Option<String>>, name: &str) -> usize {
        query
            .get(name)
            .cloned()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000)
    }

    fn param<'a>(query: &'a BTreeMap<String, Option<String>>, name: &str) -> Option<&'a str> {
        query.get(name).and_then(|v| v.as_deref())
    }

    fn list_objects_v1(&self, bucket: &str, query: &BTreeMap<String, Option<String>>) -> HttpResponse {
        let state = self.state.lock().unwrap();
        let b = &state.buckets[bucket];
        let prefix = Self::param(query, "prefix").unwrap_or("");
        let delimiter = Self::param(query, "delimiter");
        let marker = Self::param(query, "marker");
        let max = Self::max_param(query, "max-keys");

        let (entries, truncated) = Self::collect_entries(b, prefix, delimiter, marker, max);
        let (contents, prefixes) = Self::render_entries(b, &entries);

        let mut body = json!({
            "name": bucket,
            "prefix": prefix,
            "marker": marker.unwrap_or(""),
            "maxKeys": max,
            "isTruncated": truncated,
            "contents": contents,
            "commonPrefixes": prefixes,
        });
        if let Some(d) = delimiter {
            body["delimiter"] = json!(d);
            // Like S3, nextMarker is only sent for delimited listings
            if truncated {
                body["nextMarker"] = json!(entries.last().map(Entry::name));
            }
        }
        drop(state);
        self.json(StatusCode::OK, body)
    }

    fn list_objects_v2(&self, bucket: &str, query: &BTreeMap<String, Option<String>>) -> HttpResponse {
        let state = self.state.lock().unwrap();
        let b = &state.buckets[bucket];
        let prefix = Self::param(query, "prefix").unwrap_or("");
        let delimiter = Self::param(query, "delimiter");
        let max = Self::max_param(query, "max-keys");
        let token = Self::param(query, "continuation-token");

        let after = match token {
            Some(token) => match token
                .strip_prefix("ct-")
                .and_then(|h| hex::decode(h).ok())
                .and_then(|raw| String::from_utf8(raw).ok())
            {
                Some(after) => Some(after),
                None => {
                    drop(state);
                    return self.error(StatusCode::BAD_REQUEST, "InvalidArgument", "bad continuation token");
                }
            },
            None => Self::param(query, "start-after").map(str::to_string),
        };

        let (entries, truncated) = Self::collect_entries(b, prefix, delimiter, after.as_deref(), max);
        let (contents, prefixes) = Self::render_entries(b, &entries);

        let mut body = json!({
            "name": bucket,
            "prefix": prefix,
            "maxKeys": max,
            "keyCount": entries.len(),
            "isTruncated": truncated,
            "contents": contents,
            "commonPrefixes": prefixes,
        });
        if let Some(d) = delimiter {
            body["delimiter"] = json!(d);
        }
        if let Some(token) = token {
            body["continuationToken"] = json!(token);
        }
        if truncated {
            let last = entries.last().map(Entry::name).unwrap_or("");
            body["nextContinuationToken"] = json!(format!("ct-{}", hex::encode(last)));
        }
        drop(state);
        self.json(StatusCode::OK, body)
    }

    fn list_uploads(&self, bucket: &str, query: &BTreeMap<String, Option<String>>) -> HttpResponse {
        let state = self.state.lock().unwrap();
        let prefix = Self::param(query, "prefix").unwrap_or("");
        let key_marker = Self::param(query, "key-marker");
        let upload_id_marker = Self::param(query, "upload-id-marker");
        let max = Self::max_param(query, "max-uploads");

        let mut candidates: Vec<(&str, &str)> = state
            .uploads
            .iter()
            .filter(|(_, u)| u.bucket == bucket && u.key.starts_with(prefix))
            .map(|(id, u)| (u.key.as_str(), id.as_str()))
            .filter(|(key, id)| match (key_marker, upload_id_marker) {
                (Some(km), Some(im)) => (*key, *id) > (km, im),
                (Some(km), None) => *key > km,
                _ => true,
            })
            .collect();
        candidates.sort();

        let truncated = candidates.len() > max;
        candidates.truncate(max);
        let uploads: Vec<Value> = candidates
            .iter()
            .map(|(key, id)| json!({"key": key, "uploadId": id, "initiated": LAST_MODIFIED}))
            .collect();

        let mut body = json!({
            "bucket": bucket,
            "prefix": prefix,
            "maxUploads": max,
            "isTruncated": truncated,
            "uploads": uploads,
        });
        if truncated {
            if let Some((key, id)) = candidates.last() {
                body["nextKeyMarker"] = json!(key);
                body["nextUploadIdMarker"] = json!(id);
            }
        }
        drop(state);
        self.json(StatusCode::OK, body)
    }

    // =========================================================================
    // Batch delete
    // =========================================================================

    fn delete_objects(&self, request: &HttpRequest, bucket: &str) -> HttpResponse {
        let declared = request.headers.get("content-md5").and_then(|v| v.to_str().ok());
        let actual = STANDARD.encode(md5::compute(&request.body).0);
        if declared != Some(actual.as_str()) {
            return self.error(StatusCode::BAD_REQUEST, "InvalidDigest", "Content-MD5 mismatch");
        }
        let Ok(batch) = serde_json::from_slice::<Value>(&request.body) else {
            return self.error(StatusCode::BAD_REQUEST, "MalformedJSON", "bad batch");
        };
        let quiet = batch["quiet"].as_bool().unwrap_or(false);
        let keys: Vec<String> = batch["objects"]
            .as_array()
            .map(|objects| {
                objects
                    .iter()
                    .filter_map(|o| o["key"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if keys.len() > 1000 {
            return self.error(StatusCode::BAD_REQUEST, "MalformedJSON", "too many keys");
        }

        let mut deleted = Vec::new();
        let mut errors = Vec::new();
        let mut state = self.state.lock().unwrap();
        let b = state.buckets.get_mut(bucket).unwrap();
        for key in keys {
            if key.starts_with("locked/") {
                errors.push(json!({"key": key, "code": "AccessDenied", "message": "object is locked"}));
                continue;
            }
            b.objects.remove(&key);
            if !quiet {
                deleted.push(json!({"key": key}));
            }
        }
        drop(state);

        self.json(StatusCode::OK, json!({"deleted": deleted, "errors": errors}))
    }

    // =========================================================================
    // Objects and multipart
    // =========================================================================

    fn handle_object(
        &self,
        request: &HttpRequest,
        bucket: &str,
        key: &str,
        query: &BTreeMap<String, Option<String>>,
    ) -> HttpResponse {
        if !self.state.lock().unwrap().buckets.contains_key(bucket) {
            if request.method == Method::HEAD {
                return self.respond(StatusCode::NOT_FOUND);
            }
            return self.no_such_bucket(bucket);
        }

        if let Some(upload_id) = Self::param(query, "uploadId") {
            return self.handle_upload(request, bucket, key, upload_id, query);
        }

        match request.method {
            Method::POST if query.contains_key("uploads") => self.create_upload(request, bucket, key),
            Method::POST if query.contains_key("restore") => {
                if self.object_exists(bucket, key) {
                    self.respond(StatusCode::ACCEPTED)
                } else {
                    self.error(StatusCode::NOT_FOUND, "NoSuchKey", "no such key")
                }
            }
            Method::PUT if request.headers.contains_key("x-sufy-copy-source") => {
                self.copy_object(request, bucket, key)
            }
            Method::PUT => self.put_object(request, bucket, key),
            Method::GET | Method::HEAD => self.get_object(request, bucket, key),
            Method::DELETE => {
                let mut state = self.state.lock().unwrap();
                state.buckets.get_mut(bucket).unwrap().objects.remove(key);
                drop(state);
                self.respond(StatusCode::NO_CONTENT)
            }
            _ => self.error(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", "object"),
        }
    }

    fn user_metadata(headers: &HeaderMap) -> Vec<(String, String)> {
        headers
            .iter()
            .filter(|(name, _)| name.as_str().starts_with("x-sufy-meta-"))
            .map(|(name, value)| (name.as_str().to_string(), value.to_str().unwrap_or("").to_string()))
            .collect()
    }

    fn header(headers: &HeaderMap, name: &str) -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn put_object(&self, request: &HttpRequest, bucket: &str, key: &str) -> HttpResponse {
        let declared_len = Self::header(&request.headers, "content-length").and_then(|v| v.parse::<usize>().ok());
        if declared_len != Some(request.body.len()) {
            return self.error(StatusCode::BAD_REQUEST, "MissingContentLength", "content-length");
        }

        let etag = etag_of(&request.body);
        let object = StoredObject {
            data: request.body.clone(),
            etag: etag.clone(),
            content_type: Self::header(&request.headers, "content-type"),
            storage_class: Self::header(&request.headers, "x-sufy-storage-class"),
            metadata: Self::user_metadata(&request.headers),
        };
        let mut state = self.state.lock().unwrap();
        state
            .buckets
            .get_mut(bucket)
            .unwrap()
            .objects
            .insert(key.to_string(), object);
        drop(state);

        let mut response = self.respond(StatusCode::OK);
        response.headers.insert("etag", HeaderValue::from_str(&etag).unwrap());
        response
    }

    fn source_of(request: &HttpRequest) -> Option<(String, String)> {
        let source = Self::header(&request.headers, "x-sufy-copy-source")?;
        let (bucket, key) = source.trim_start_matches('/').split_once('/')?;
        Some((decode(bucket), decode(key)))
    }

    fn copy_object(&self, request: &HttpRequest, bucket: &str, key: &str) -> HttpResponse {
        let Some((src_bucket, src_key)) = Self::source_of(request) else {
            return self.error(StatusCode::BAD_REQUEST, "InvalidArgument", "bad copy source");
        };
        let directive = Self::header(&request.headers, "x-sufy-metadata-directive")
            .unwrap_or_else(|| "COPY".to_string());

        let mut state = self.state.lock().unwrap();
        let Some(source) = state
            .buckets
            .get(&src_bucket)
            .and_then(|b| b.objects.get(&src_key))
        else {
            drop(state);
            return self.error(StatusCode::NOT_FOUND, "NoSuchKey", "copy source missing");
        };

        let copied = if directive == "REPLACE" {
            StoredObject {
                data: source.data.clone(),
                etag: source.etag.clone(),
                content_type: Self::header(&request.headers, "content-type"),
                storage_class: Self::header(&request.headers, "x-sufy-storage-class")
                    .or_else(|| source.storage_class.clone()),
                metadata: Self::user_metadata(&request.headers),
            }
        } else {
            StoredObject {
                data: source.data.clone(),
                etag: source.etag.clone(),
                content_type: source.content_type.clone(),
                storage_class: Self::header(&request.headers, "x-sufy-storage-class")
                    .or_else(|| source.storage_class.clone()),
                metadata: source.metadata.clone(),
            }
        };
        let etag = copied.etag.clone();
        state
            .buckets
            .get_mut(bucket)
            .unwrap()
            .objects
            .insert(key.to_string(), copied);
        drop(state);

        self.json(StatusCode::OK, json!({"eTag": etag, "lastModified": LAST_MODIFIED}))
    }

    fn get_object(&self, request: &HttpRequest, bucket: &str, key: &str) -> HttpResponse {
        let is_head = request.method == Method::HEAD;
        let state = self.state.lock().unwrap();
        let Some(object) = state.buckets[bucket].objects.get(key) else {
            drop(state);
            if is_head {
                return self.respond(StatusCode::NOT_FOUND);
            }
            return self.error(StatusCode::NOT_FOUND, "NoSuchKey", "The specified key does not exist.");
        };

        let range = Self::header(&request.headers, "range")
            .and_then(|r| parse_range(&r, object.data.len()));
        let (status, body) = match range {
            Some((start, end)) => (StatusCode::PARTIAL_CONTENT, object.data.slice(start..=end)),
            None => (StatusCode::OK, object.data.clone()),
        };

        let mut response = self.respond(status);
        let headers = &mut response.headers;
        headers.insert("content-length", HeaderValue::from(body.len()));
        headers.insert("etag", HeaderValue::from_str(&object.etag).unwrap());
        headers.insert("last-modified", HeaderValue::from_static("Thu, 13 Apr 2023 01:23:47 GMT"));
        headers.insert(
            "content-type",
            HeaderValue::from_str(object.content_type.as_deref().unwrap_or("application/octet-stream")).unwrap(),
        );
        if let Some(class) = &object.storage_class {
            headers.insert("x-sufy-storage-class", HeaderValue::from_str(class).unwrap());
        }
        for (name, value) in &object.metadata {
            headers.append(
                hyper::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        if !is_head {
            response.body = body;
        }
        drop(state);
        response
    }

    fn create_upload(&self, request: &HttpRequest, bucket: &str, key: &str) -> HttpResponse {
        let mut state = self.state.lock().unwrap();
        state.next_upload += 1;
        let upload_id = format!("upload-{:06}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
                content_type: Self::header(&request.headers, "content-type"),
            },
        );
        drop(state);
        self.json(
            StatusCode::OK,
            json!({"bucket": bucket, "key": key, "uploadId": upload_id}),
        )
    }

    fn handle_upload(
        &self,
        request: &HttpRequest,
        bucket: &str,
        key: &str,
        upload_id: &str,
        query: &BTreeMap<String, Option<String>>,
    ) -> HttpResponse {
        let known = self
            .state
            .lock()
            .unwrap()
            .uploads
            .get(upload_id)
            .is_some_and(|u| u.bucket == bucket && u.key == key);
        if !known {
            return self.error(StatusCode::NOT_FOUND, "NoSuchUpload", "upload does not exist");
        }

        match request.method {
            Method::PUT => self.upload_part(request, upload_id, query),
            Method::POST => self.complete_upload(request, bucket, key, upload_id),
            Method::DELETE => {
                self.state.lock().unwrap().uploads.remove(upload_id);
                self.respond(StatusCode::NO_CONTENT)
            }
            Method::GET => self.list_parts(bucket, key, upload_id, query),
            _ => self.error(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", "upload"),
        }
    }

    fn upload_part(
        &self,
        request: &HttpRequest,
        upload_id: &str,
        query: &BTreeMap<String, Option<String>>,
    ) -> HttpResponse {
        let Some(part_number) = Self::param(query, "partNumber").and_then(|n| n.parse::<u32>().ok()) else {
            return self.error(StatusCode::BAD_REQUEST, "InvalidArgument", "bad partNumber");
        };
        if !(1..=10_000).contains(&part_number) {
            return self.error(StatusCode::BAD_REQUEST, "InvalidArgument", "partNumber out of range");
        }
        if self.failing_parts.lock().unwrap().contains(&part_number) {
            return self.error(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", "part store failed");
        }

        let copy = Self::source_of(request);
        let data = match &copy {
            Some((src_bucket, src_key)) => {
                let state = self.state.lock().unwrap();
                let Some(source) = state.buckets.get(src_bucket).and_then(|b| b.objects.get(src_key)) else {
                    drop(state);
                    return self.error(StatusCode::NOT_FOUND, "NoSuchKey", "copy source missing");
                };
                let range = Self::header(&request.headers, "x-sufy-copy-source-range");
                match range.map(|r| parse_range(&r, source.data.len())) {
                    Some(Some((start, end))) => source.data.slice(start..=end),
                    Some(None) => {
                        drop(state);
                        return self.error(StatusCode::BAD_REQUEST, "InvalidRange", "bad range");
                    }
                    None => source.data.clone(),
                }
            }
            None => request.body.clone(),
        };

        let etag = etag_of(&data);
        self.state
            .lock()
            .unwrap()
            .uploads
            .get_mut(upload_id)
            .unwrap()
            .parts
            .insert(part_number, (data, etag.clone()));

        if copy.is_some() {
            return self.json(StatusCode::OK, json!({"eTag": etag, "lastModified": LAST_MODIFIED}));
        }
        let mut response = self.respond(StatusCode::OK);
        response.headers.insert("etag", HeaderValue::from_str(&etag).unwrap());
        response
    }

    fn complete_upload(&self, request: &HttpRequest, bucket: &str, key: &str, upload_id: &str) -> HttpResponse {
        let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
            return self.error(StatusCode::BAD_REQUEST, "MalformedJSON", "bad complete body");
        };
        let listed: Vec<(u32, String)> = body["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| Some((p["partNumber"].as_u64()? as u32, p["eTag"].as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        if listed.is_empty() {
            return self.error(StatusCode::BAD_REQUEST, "MalformedJSON", "no parts");
        }
        if listed.windows(2).any(|w| w[0].0 >= w[1].0) {
            return self.error(StatusCode::BAD_REQUEST, "InvalidPartOrder", "parts must be ascending");
        }

        let mut state = self.state.lock().unwrap();
        let upload = &state.uploads[upload_id];
        let mut data = Vec::new();
        let mut digests = Vec::new();
        for (number, etag) in &listed {
            match upload.parts.get(number) {
                Some((part, stored)) if stored == etag => {
                    data.extend_from_slice(part);
                    digests.extend_from_slice(&md5::compute(part).0);
                }
                _ => {
                    drop(state);
                    return self.error(StatusCode::BAD_REQUEST, "InvalidPart", "unknown part or etag");
                }
            }
        }
        let etag = format!("\"{:x}-{}\"", md5::compute(&digests), listed.len());
        let content_type = upload.content_type.clone();
        state.uploads.remove(upload_id);
        state.buckets.get_mut(bucket).unwrap().objects.insert(
            key.to_string(),
            StoredObject {
                data: Bytes::from(data),
                etag: etag.clone(),
                content_type,
                storage_class: None,
                metadata: Vec::new(),
            },
        );
        drop(state);

        self.json(
            StatusCode::OK,
            json!({
                "location": format!("/{}/{}", bucket, key),
                "bucket": bucket,
                "key": key,
                "eTag": etag,
            }),
        )
    }

    fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        query: &BTreeMap<String, Option<String>>,
    ) -> HttpResponse {
        let state = self.state.lock().unwrap();
        let upload = &state.uploads[upload_id];
        let marker: u32 = Self::param(query, "part-number-marker")
            .and_then(|m| m.parse().ok())
            .unwrap_or(0);
        let max = Self::max_param(query, "max-parts");

        let remaining: Vec<(&u32, &(Bytes, String))> = upload.parts.range(marker + 1..).collect();
        let truncated = remaining.len() > max;
        let page = &remaining[..remaining.len().min(max)];
        let parts: Vec<Value> = page
            .iter()
            .map(|(n, (data, etag))| {
                json!({"partNumber": n, "eTag": etag, "size": data.len(), "lastModified": LAST_MODIFIED})
            })
            .collect();

        let mut body = json!({
            "bucket": bucket,
            "key": key,
            "uploadId": upload_id,
            "partNumberMarker": marker,
            "maxParts": max,
            "isTruncated": truncated,
            "parts": parts,
        });
        if truncated {
            body["nextPartNumberMarker"] = json!(page.last().map(|(n, _)| **n));
        }
        drop(state);
        self.json(StatusCode::OK, body)
    }
}

#[async_trait]
impl Transport for FakeSufy {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle(request))
    }
}

/// Client wired to a fresh fake server through a recorder
pub struct TestEnv {
    pub client: SufyClient,
    pub server: Arc<FakeSufy>,
    pub recorder: Arc<RecordingTransport>,
}

pub fn config() -> ClientConfig {
    ClientConfig::new(ENDPOINT, ACCESS_KEY, SECRET_KEY)
}

pub fn setup() -> TestEnv {
    setup_with_config(config())
}

pub fn setup_with_config(config: ClientConfig) -> TestEnv {
    let server = Arc::new(FakeSufy::new());
    let recorder = Arc::new(RecordingTransport::new(server.clone()));
    let client = SufyClient::with_transport(&config, recorder.clone()).unwrap();
    TestEnv {
        client,
        server,
        recorder,
    }
}

/// Fresh environment with `bucket` already created server-side
pub fn setup_with_bucket(bucket: &str) -> TestEnv {
    let env = setup();
    env.server.create_bucket(bucket);
    env
}
