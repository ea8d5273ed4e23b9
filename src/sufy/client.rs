//! Sufy client
//!
//! Thin typed operations on top of the [`Dispatcher`]. Every method is one
//! signed round trip; pagination, multipart sessions and batch delete build on
//! these in their own modules.

use crate::config::ClientConfig;
use crate::sufy::canonical::uri_encode;
use crate::sufy::dispatch::{Dispatcher, Endpoint, SufyRequest, SufyResponse, META_PREFIX};
use crate::sufy::error::{ConfigKind, Resource, Result, SufyError};
use crate::sufy::paginate::{Pageable, Paginator};
use crate::sufy::signer::{Clock, Credentials, Signer};
use crate::sufy::transport::{HyperTransport, Transport};
use crate::sufy::types::{
    BucketLocation, CopyObjectOutput, GetObjectOutput, HeadBucketOutput, ListBucketsOutput,
    ListMultipartUploadsPage, ListMultipartUploadsRequest, ListObjectsPage, ListObjectsRequest,
    ListObjectsV2Page, ListObjectsV2Request, ListPartsPage, ListPartsRequest, MultipartConfig,
    ObjectMetadata, PolicyStatus, PolicyStatusBody, PutObjectOptions, PutObjectOutput,
};
use bytes::Bytes;
use hyper::Method;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Whether a copy keeps the source metadata or replaces it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MetadataDirective {
    #[default]
    Copy,
    Replace,
}

impl MetadataDirective {
    fn as_str(self) -> &'static str {
        match self {
            MetadataDirective::Copy => "COPY",
            MetadataDirective::Replace => "REPLACE",
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBucketBody<'a> {
    location_constraint: &'a str,
}

#[derive(Serialize)]
struct RestoreBody {
    days: u32,
}

/// Sufy object storage client
///
/// Clone is cheap - the dispatcher is shared behind an Arc.
#[derive(Clone, Debug)]
pub struct SufyClient {
    dispatcher: Arc<Dispatcher>,
    region: Option<String>,
    multipart: MultipartConfig,
}

impl SufyClient {
    /// Client over the hyper transport
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let transport = HyperTransport::new(
            Duration::from_secs(config.request_timeout_secs),
            config.insecure_tls,
        )?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Client over any transport
    pub fn with_transport(config: &ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let endpoint = Endpoint::parse(&config.endpoint, config.force_path_style)?;
        let credentials = Credentials::new(config.access_key.clone(), config.secret_key.clone())?;
        let dispatcher = Dispatcher::new(endpoint, Signer::new(credentials), transport);

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            region: config.region.clone(),
            multipart: config.multipart.clone(),
        })
    }

    /// Replace the signing clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.dispatcher = Arc::new(self.dispatcher.with_clock(clock));
        self
    }

    pub fn multipart_config(&self) -> &MultipartConfig {
        &self.multipart
    }

    /// Send a raw request through the signer and classifier
    pub async fn send(&self, request: SufyRequest) -> Result<SufyResponse> {
        self.dispatcher.send(request).await
    }

    /// Lazily walk every page starting at `first`
    pub fn paginate<R: Pageable>(&self, first: R) -> Paginator<R> {
        Paginator::new(self.clone(), first)
    }

    // =========================================================================
    // Service and bucket operations
    // =========================================================================

    pub async fn list_buckets(&self) -> Result<ListBucketsOutput> {
        self.send(SufyRequest::service(Method::GET)).await?.json()
    }

    /// Create a bucket, returning the `Location` header. `region` defaults to
    /// the configured region.
    pub async fn create_bucket(&self, bucket: &str, region: Option<&str>) -> Result<Option<String>> {
        let mut request = SufyRequest::bucket(Method::PUT, bucket);
        if let Some(region) = region.or(self.region.as_deref()) {
            request = request.json_body(&CreateBucketBody {
                location_constraint: region,
            })?;
        }
        let response = self.send(request).await?;
        tracing::info!(bucket = %bucket, "bucket created");
        Ok(response.header("location").map(str::to_string))
    }

    pub async fn head_bucket(&self, bucket: &str) -> Result<HeadBucketOutput> {
        let response = self.send(SufyRequest::bucket(Method::HEAD, bucket)).await?;
        Ok(HeadBucketOutput {
            region: response.header("x-sufy-bucket-region").map(str::to_string),
        })
    }

    pub async fn get_bucket_location(&self, bucket: &str) -> Result<BucketLocation> {
        self.send(SufyRequest::bucket(Method::GET, bucket).flag("location"))
            .await?
            .json()
    }

    pub async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.send(SufyRequest::bucket(Method::DELETE, bucket)).await?;
        tracing::info!(bucket = %bucket, "bucket deleted");
        Ok(())
    }

    /// Store a CORS, lifecycle, policy or tagging document
    pub async fn put_bucket_config(
        &self,
        bucket: &str,
        kind: ConfigKind,
        document: &serde_json::Value,
    ) -> Result<()> {
        let request = SufyRequest::bucket(Method::PUT, bucket)
            .resource(Resource::Config(kind))
            .flag(kind.query_key())
            .json_body(document)?
            .content_md5();
        self.send(request).await?;
        Ok(())
    }

    /// Fetch a configuration document. A missing one is
    /// `ErrorKind::NoSuchConfiguration(kind)`.
    pub async fn get_bucket_config(&self, bucket: &str, kind: ConfigKind) -> Result<serde_json::Value> {
        let request = SufyRequest::bucket(Method::GET, bucket)
            .resource(Resource::Config(kind))
            .flag(kind.query_key());
        self.send(request).await?.json()
    }

    pub async fn delete_bucket_config(&self, bucket: &str, kind: ConfigKind) -> Result<()> {
        let request = SufyRequest::bucket(Method::DELETE, bucket)
            .resource(Resource::Config(kind))
            .flag(kind.query_key());
        self.send(request).await?;
        Ok(())
    }

    pub async fn get_bucket_policy_status(&self, bucket: &str) -> Result<PolicyStatus> {
        let request = SufyRequest::bucket(Method::GET, bucket).flag("policyStatus");
        let body: PolicyStatusBody = self.send(request).await?.json()?;
        Ok(body.into())
    }

    pub async fn get_bucket_acl(&self, bucket: &str) -> Result<serde_json::Value> {
        let request = SufyRequest::bucket(Method::GET, bucket)
            .resource(Resource::Other)
            .flag("acl");
        self.send(request).await?.json()
    }

    /// Apply a canned ACL (`private`, `public-read`, ...)
    pub async fn put_bucket_acl(&self, bucket: &str, canned_acl: &str) -> Result<()> {
        let request = SufyRequest::bucket(Method::PUT, bucket)
            .resource(Resource::Other)
            .flag("acl")
            .header("x-sufy-acl", canned_acl);
        self.send(request).await?;
        Ok(())
    }

    // =========================================================================
    // Object operations
    // =========================================================================

    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: &PutObjectOptions,
    ) -> Result<PutObjectOutput> {
        let mut request = SufyRequest::object(Method::PUT, bucket, key).body(data);
        if let Some(content_type) = &options.content_type {
            request = request.header("content-type", content_type.as_str());
        }
        if let Some(storage_class) = &options.storage_class {
            request = request.header("x-sufy-storage-class", storage_class.as_str());
        }
        for (name, value) in &options.metadata {
            request = request.header(&format!("{}{}", META_PREFIX, name), value.as_str());
        }

        let response = self.send(request).await?;
        Ok(PutObjectOutput {
            etag: response.etag(),
            request_id: response.request_id().map(str::to_string),
        })
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<GetObjectOutput> {
        let response = self.send(SufyRequest::object(Method::GET, bucket, key)).await?;
        Ok(GetObjectOutput {
            metadata: response.object_metadata(),
            body: response.body,
        })
    }

    /// Read an inclusive byte range
    pub async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
    ) -> Result<GetObjectOutput> {
        if end < start {
            return Err(SufyError::Validation(format!(
                "invalid range {}-{}",
                start, end
            )));
        }
        let request = SufyRequest::object(Method::GET, bucket, key)
            .header("range", format!("bytes={}-{}", start, end));
        let response = self.send(request).await?;
        Ok(GetObjectOutput {
            metadata: response.object_metadata(),
            body: response.body,
        })
    }

    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        let response = self.send(SufyRequest::object(Method::HEAD, bucket, key)).await?;
        Ok(response.object_metadata())
    }

    /// Server-side copy. With `Replace`, the destination takes `options`
    /// instead of the source metadata.
    pub async fn copy_object(
        &self,
        source_bucket: &str,
        source_key: &str,
        bucket: &str,
        key: &str,
        directive: MetadataDirective,
        options: &PutObjectOptions,
    ) -> Result<CopyObjectOutput> {
        if source_key.is_empty() {
            return Err(SufyError::Validation("source key is empty".to_string()));
        }

        let mut request = SufyRequest::object(Method::PUT, bucket, key)
            .header("x-sufy-copy-source", copy_source(source_bucket, source_key))
            .header("x-sufy-metadata-directive", directive.as_str());
        if directive == MetadataDirective::Replace {
            if let Some(content_type) = &options.content_type {
                request = request.header("content-type", content_type.as_str());
            }
            for (name, value) in &options.metadata {
                request = request.header(&format!("{}{}", META_PREFIX, name), value.as_str());
            }
        }
        if let Some(storage_class) = &options.storage_class {
            request = request.header("x-sufy-storage-class", storage_class.as_str());
        }

        let response = self.send(request).await?;
        if response.body.is_empty() {
            return Ok(CopyObjectOutput {
                etag: response.etag(),
                last_modified: None,
            });
        }
        response.json()
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.send(SufyRequest::object(Method::DELETE, bucket, key)).await?;
        Ok(())
    }

    /// Ask for an archived object to be restored for `days` days
    pub async fn restore_object(&self, bucket: &str, key: &str, days: u32) -> Result<()> {
        let request = SufyRequest::object(Method::POST, bucket, key)
            .flag("restore")
            .json_body(&RestoreBody { days })?;
        self.send(request).await?;
        Ok(())
    }

    pub async fn get_object_acl(&self, bucket: &str, key: &str) -> Result<serde_json::Value> {
        let request = SufyRequest::object(Method::GET, bucket, key)
            .resource(Resource::Other)
            .flag("acl");
        self.send(request).await?.json()
    }

    pub async fn put_object_acl(&self, bucket: &str, key: &str, canned_acl: &str) -> Result<()> {
        let request = SufyRequest::object(Method::PUT, bucket, key)
            .resource(Resource::Other)
            .flag("acl")
            .header("x-sufy-acl", canned_acl);
        self.send(request).await?;
        Ok(())
    }

    // =========================================================================
    // Listing (one page per call; see `paginate` for the full walk)
    // =========================================================================

    pub async fn list_objects(&self, request: &ListObjectsRequest) -> Result<ListObjectsPage> {
        let request = SufyRequest::bucket(Method::GET, &request.bucket)
            .param_opt("prefix", request.prefix.as_deref())
            .param_opt("delimiter", request.delimiter.as_deref())
            .param_opt("marker", request.marker.as_deref())
            .param_opt("max-keys", request.max_keys);
        self.send(request).await?.json()
    }

    pub async fn list_objects_v2(&self, request: &ListObjectsV2Request) -> Result<ListObjectsV2Page> {
        let request = SufyRequest::bucket(Method::GET, &request.bucket)
            .param("list-type", "2")
            .param_opt("prefix", request.prefix.as_deref())
            .param_opt("delimiter", request.delimiter.as_deref())
            .param_opt("continuation-token", request.continuation_token.as_deref())
            .param_opt("start-after", request.start_after.as_deref())
            .param_opt("max-keys", request.max_keys);
        self.send(request).await?.json()
    }

    pub async fn list_parts(&self, request: &ListPartsRequest) -> Result<ListPartsPage> {
        let request = SufyRequest::object(Method::GET, &request.bucket, &request.key)
            .resource(Resource::Upload)
            .param("uploadId", request.upload_id.as_str())
            .param_opt("part-number-marker", request.part_number_marker)
            .param_opt("max-parts", request.max_parts);
        self.send(request).await?.json()
    }

    pub async fn list_multipart_uploads(
        &self,
        request: &ListMultipartUploadsRequest,
    ) -> Result<ListMultipartUploadsPage> {
        let request = SufyRequest::bucket(Method::GET, &request.bucket)
            .flag("uploads")
            .param_opt("prefix", request.prefix.as_deref())
            .param_opt("delimiter", request.delimiter.as_deref())
            .param_opt("key-marker", request.key_marker.as_deref())
            .param_opt("upload-id-marker", request.upload_id_marker.as_deref())
            .param_opt("max-uploads", request.max_uploads);
        self.send(request).await?.json()
    }
}

/// `X-Sufy-Copy-Source` value: `<bucket>/<key>`, key percent-encoded
pub(crate) fn copy_source(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, uri_encode(key, false))
}
