//! Sufy request and response types
//!
//! Response bodies are JSON with camelCase fields. Servers are not consistent
//! about casing (`eTag`, `ETag`, `etag`) or about sending `null` for empty
//! lists, so the deserializers accept those variants.

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Largest valid part number
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Minimum size of every part but the last
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Treat `null` like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// =============================================================================
// Objects
// =============================================================================

/// One entry of an object listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSummary {
    pub key: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default, rename = "eTag", alias = "ETag", alias = "etag")]
    pub etag: Option<String>,
    #[serde(default)]
    pub storage_class: Option<String>,
}

impl ObjectSummary {
    pub fn new(key: String, size: u64) -> Self {
        Self {
            key,
            size,
            last_modified: None,
            etag: None,
            storage_class: None,
        }
    }
}

/// A key prefix rolled up by the delimiter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonPrefix {
    pub prefix: String,
}

/// Options for a single-request upload
#[derive(Debug, Clone, Default)]
pub struct PutObjectOptions {
    pub content_type: Option<String>,
    pub storage_class: Option<String>,
    /// User metadata, sent as `X-Sufy-Meta-<name>`
    pub metadata: BTreeMap<String, String>,
}

impl PutObjectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = Some(storage_class.into());
        self
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }
}

/// Result of a put
#[derive(Debug, Clone)]
pub struct PutObjectOutput {
    /// ETag header, verbatim
    pub etag: Option<String>,
    pub request_id: Option<String>,
}

/// Object metadata from HEAD/GET response headers
#[derive(Debug, Clone, Default)]
pub struct ObjectMetadata {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub storage_class: Option<String>,
    /// `X-Sufy-Meta-*` headers with the prefix stripped
    pub metadata: BTreeMap<String, String>,
    pub request_id: Option<String>,
}

/// Result of a get
#[derive(Debug, Clone)]
pub struct GetObjectOutput {
    pub metadata: ObjectMetadata,
    pub body: Bytes,
}

/// Result of a server-side copy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyObjectOutput {
    #[serde(default, rename = "eTag", alias = "ETag", alias = "etag")]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
}

// =============================================================================
// Buckets
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketInfo {
    pub name: String,
    #[serde(default)]
    pub creation_date: Option<String>,
    #[serde(default)]
    pub location_constraint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    #[serde(default, alias = "ID")]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListBucketsOutput {
    #[serde(default, deserialize_with = "null_as_default")]
    pub buckets: Vec<BucketInfo>,
    #[serde(default)]
    pub owner: Option<Owner>,
}

/// Result of HEAD on a bucket
#[derive(Debug, Clone, Default)]
pub struct HeadBucketOutput {
    /// `X-Sufy-Bucket-Region`
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketLocation {
    #[serde(default)]
    pub location_constraint: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default)]
    pub is_public: bool,
}

/// Policy status arrives either bare or wrapped in `policyStatus`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum PolicyStatusBody {
    Wrapped {
        #[serde(rename = "policyStatus", alias = "PolicyStatus")]
        policy_status: PolicyStatus,
    },
    Bare(PolicyStatus),
}

impl From<PolicyStatusBody> for PolicyStatus {
    fn from(body: PolicyStatusBody) -> Self {
        match body {
            PolicyStatusBody::Wrapped { policy_status } => policy_status,
            PolicyStatusBody::Bare(status) => status,
        }
    }
}

// =============================================================================
// Listing
// =============================================================================

/// Cursor for marker-based (v1) listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListObjectsRequest {
    pub bucket: String,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub marker: Option<String>,
    pub max_keys: Option<u32>,
}

impl ListObjectsRequest {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: None,
            delimiter: None,
            marker: None,
            max_keys: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    pub fn with_max_keys(mut self, max_keys: u32) -> Self {
        self.max_keys = Some(max_keys);
        self
    }
}

/// One page of a v1 listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListObjectsPage {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub marker: Option<String>,
    #[serde(default)]
    pub next_marker: Option<String>,
    #[serde(default)]
    pub max_keys: Option<u32>,
    #[serde(default)]
    pub is_truncated: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub contents: Vec<ObjectSummary>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub common_prefixes: Vec<CommonPrefix>,
}

/// Cursor for token-based (v2) listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListObjectsV2Request {
    pub bucket: String,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
    pub start_after: Option<String>,
    pub max_keys: Option<u32>,
}

impl ListObjectsV2Request {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: None,
            delimiter: None,
            continuation_token: None,
            start_after: None,
            max_keys: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    pub fn with_start_after(mut self, start_after: impl Into<String>) -> Self {
        self.start_after = Some(start_after.into());
        self
    }

    pub fn with_max_keys(mut self, max_keys: u32) -> Self {
        self.max_keys = Some(max_keys);
        self
    }
}

/// One page of a v2 listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListObjectsV2Page {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub max_keys: Option<u32>,
    #[serde(default)]
    pub key_count: Option<u32>,
    #[serde(default)]
    pub continuation_token: Option<String>,
    #[serde(default)]
    pub next_continuation_token: Option<String>,
    #[serde(default)]
    pub start_after: Option<String>,
    #[serde(default)]
    pub is_truncated: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub contents: Vec<ObjectSummary>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub common_prefixes: Vec<CommonPrefix>,
}

// =============================================================================
// Batch delete
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIdentifier {
    pub key: String,
}

/// Body of a batch delete request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteBatch {
    pub objects: Vec<ObjectIdentifier>,
    /// Quiet mode reports failures only
    #[serde(default)]
    pub quiet: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedObject {
    pub key: String,
    #[serde(default)]
    pub version_id: Option<String>,
    #[serde(default)]
    pub delete_marker: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteError {
    pub key: String,
    #[serde(default, alias = "Code")]
    pub code: String,
    #[serde(default, alias = "Message")]
    pub message: String,
}

/// Batch delete response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteObjectsOutput {
    #[serde(default, deserialize_with = "null_as_default")]
    pub deleted: Vec<DeletedObject>,
    #[serde(default, alias = "error", deserialize_with = "null_as_default")]
    pub errors: Vec<DeleteError>,
}

/// Per-key outcome of a batch delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Failed { code: String, message: String },
    /// Neither deleted nor failed was reported for the key
    Unreported,
}

// =============================================================================
// Multipart upload
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMultipartUploadOutput {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    pub upload_id: String,
}

/// Part number + ETag pair, as listed in the complete request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    #[serde(rename = "eTag", alias = "ETag", alias = "etag")]
    pub etag: String,
}

impl CompletedPart {
    pub fn new(part_number: u32, etag: String) -> Self {
        Self { part_number, etag }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CompleteMultipartUploadBody<'a> {
    pub parts: &'a [CompletedPart],
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMultipartUploadOutput {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default, rename = "eTag", alias = "ETag", alias = "etag")]
    pub etag: Option<String>,
}

/// Server-side copy of a byte range into a part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartCopySource {
    pub bucket: String,
    pub key: String,
    /// Inclusive byte range
    pub range: Option<(u64, u64)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CopyPartOutput {
    #[serde(default, rename = "eTag", alias = "ETag", alias = "etag")]
    pub etag: Option<String>,
}

/// An uploaded part as reported by ListParts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartSummary {
    pub part_number: u32,
    #[serde(default, rename = "eTag", alias = "ETag", alias = "etag")]
    pub etag: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub last_modified: Option<String>,
}

/// Cursor for listing the parts of one upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPartsRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub part_number_marker: Option<u32>,
    pub max_parts: Option<u32>,
}

impl ListPartsRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, upload_id: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            upload_id: upload_id.into(),
            part_number_marker: None,
            max_parts: None,
        }
    }

    pub fn with_max_parts(mut self, max_parts: u32) -> Self {
        self.max_parts = Some(max_parts);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPartsPage {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub part_number_marker: Option<u32>,
    #[serde(default)]
    pub next_part_number_marker: Option<u32>,
    #[serde(default)]
    pub max_parts: Option<u32>,
    #[serde(default)]
    pub is_truncated: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub parts: Vec<PartSummary>,
}

/// An in-progress upload as reported by ListMultipartUploads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub key: String,
    pub upload_id: String,
    #[serde(default)]
    pub initiated: Option<String>,
    #[serde(default)]
    pub storage_class: Option<String>,
}

/// Cursor for listing in-progress uploads of a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListMultipartUploadsRequest {
    pub bucket: String,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub key_marker: Option<String>,
    pub upload_id_marker: Option<String>,
    pub max_uploads: Option<u32>,
}

impl ListMultipartUploadsRequest {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: None,
            delimiter: None,
            key_marker: None,
            upload_id_marker: None,
            max_uploads: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_max_uploads(mut self, max_uploads: u32) -> Self {
        self.max_uploads = Some(max_uploads);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMultipartUploadsPage {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub key_marker: Option<String>,
    #[serde(default)]
    pub upload_id_marker: Option<String>,
    #[serde(default)]
    pub next_key_marker: Option<String>,
    #[serde(default)]
    pub next_upload_id_marker: Option<String>,
    #[serde(default)]
    pub max_uploads: Option<u32>,
    #[serde(default)]
    pub is_truncated: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub uploads: Vec<UploadSummary>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub common_prefixes: Vec<CommonPrefix>,
}

/// Configuration for high-level multipart uploads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultipartConfig {
    /// Part size in bytes (default: 5MB, the minimum)
    pub part_size: usize,
    /// Maximum concurrent part uploads (default: 10)
    pub concurrency: usize,
    /// Object size at which multipart is used (default: 100MB)
    pub threshold: u64,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            part_size: MIN_PART_SIZE,
            concurrency: 10,
            threshold: 100 * 1024 * 1024,
        }
    }
}

impl MultipartConfig {
    /// Part size, raised to the 5MB minimum
    pub fn with_part_size(mut self, size: usize) -> Self {
        self.part_size = size.max(MIN_PART_SIZE);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }
}
