//! Multipart upload coordinator
//!
//! A [`MultipartSession`] tracks one upload through
//! `Created -> PartsUploading -> Completed | Aborted`. Parts may be uploaded
//! concurrently and in any order; completion sends them sorted by part
//! number. Once completed or aborted, the session refuses further work
//! locally without touching the network.

use crate::sufy::client::{copy_source, SufyClient};
use crate::sufy::dispatch::{SufyRequest, META_PREFIX};
use crate::sufy::error::{Resource, Result, SufyError};
use crate::sufy::paginate::Paginator;
use crate::sufy::types::{
    CompleteMultipartUploadBody, CompleteMultipartUploadOutput, CompletedPart, CopyPartOutput,
    CreateMultipartUploadOutput, ListPartsRequest, MultipartConfig, PartCopySource,
    PutObjectOptions, MAX_PART_NUMBER,
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use hyper::Method;
use parking_lot::Mutex;
use std::collections::HashSet;

/// Lifecycle of an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    PartsUploading,
    Completed,
    Aborted,
}

/// Outcome of a concurrent batch of part uploads
#[derive(Debug, Default)]
pub struct PartUploadReport {
    /// Successful parts, sorted by part number
    pub completed: Vec<CompletedPart>,
    /// Failed part numbers with their errors. Retry them under the same number.
    pub failed: Vec<(u32, SufyError)>,
}

impl PartUploadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

fn check_part_number(part_number: u32) -> Result<()> {
    if part_number == 0 || part_number > MAX_PART_NUMBER {
        return Err(SufyError::Validation(format!(
            "part number {} outside 1..={}",
            part_number, MAX_PART_NUMBER
        )));
    }
    Ok(())
}

/// One in-progress multipart upload
#[derive(Debug)]
pub struct MultipartSession {
    client: SufyClient,
    bucket: String,
    key: String,
    upload_id: String,
    state: Mutex<SessionState>,
}

impl MultipartSession {
    /// Attach to an upload that already exists, e.g. one found with
    /// `list_multipart_uploads`
    pub fn resume(client: SufyClient, bucket: &str, key: &str, upload_id: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            state: Mutex::new(SessionState::PartsUploading),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to `PartsUploading` unless already finished
    fn begin_part(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Created | SessionState::PartsUploading => {
                *state = SessionState::PartsUploading;
                Ok(())
            }
            finished => Err(SufyError::Validation(format!(
                "upload {} is {:?}",
                self.upload_id, finished
            ))),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            SessionState::Created | SessionState::PartsUploading => Ok(()),
            finished => Err(SufyError::Validation(format!(
                "upload {} is {:?}",
                self.upload_id, finished
            ))),
        }
    }

    fn part_request(&self, method: Method) -> SufyRequest {
        SufyRequest::object(method, &self.bucket, &self.key)
            .resource(Resource::Upload)
            .param("uploadId", self.upload_id.as_str())
    }

    /// Upload one part. The body is sent unhashed.
    pub async fn upload_part(&self, part_number: u32, data: Bytes) -> Result<CompletedPart> {
        check_part_number(part_number)?;
        self.begin_part()?;

        let request = self
            .part_request(Method::PUT)
            .param("partNumber", part_number.to_string())
            .body(data)
            .unsigned_payload();
        let response = self.client.send(request).await?;

        let etag = response.etag().ok_or_else(|| {
            SufyError::InvalidResponse(format!("part {} response has no ETag", part_number))
        })?;
        tracing::debug!(upload_id = %self.upload_id, part_number, "part uploaded");
        Ok(CompletedPart::new(part_number, etag))
    }

    /// Fill a part by copying from an existing object
    pub async fn upload_part_copy(
        &self,
        part_number: u32,
        source: &PartCopySource,
    ) -> Result<CompletedPart> {
        check_part_number(part_number)?;
        if source.key.is_empty() {
            return Err(SufyError::Validation("copy source key is empty".to_string()));
        }
        if let Some((start, end)) = source.range {
            if end < start {
                return Err(SufyError::Validation(format!(
                    "invalid copy source range {}-{}",
                    start, end
                )));
            }
        }
        self.begin_part()?;

        let mut request = self
            .part_request(Method::PUT)
            .param("partNumber", part_number.to_string())
            .header("x-sufy-copy-source", copy_source(&source.bucket, &source.key));
        if let Some((start, end)) = source.range {
            request = request.header("x-sufy-copy-source-range", format!("bytes={}-{}", start, end));
        }
        let response = self.client.send(request).await?;

        let etag = match response.etag() {
            Some(etag) => etag,
            None => response.json::<CopyPartOutput>()?.etag.ok_or_else(|| {
                SufyError::InvalidResponse(format!("copied part {} has no ETag", part_number))
            })?,
        };
        Ok(CompletedPart::new(part_number, etag))
    }

    /// Upload many parts with at most `concurrency` in flight. Every part
    /// runs to completion; failures are reported, not short-circuited.
    pub async fn upload_parts(
        &self,
        parts: Vec<(u32, Bytes)>,
        concurrency: usize,
    ) -> Result<PartUploadReport> {
        let mut seen = HashSet::with_capacity(parts.len());
        for (part_number, _) in &parts {
            check_part_number(*part_number)?;
            if !seen.insert(*part_number) {
                return Err(SufyError::Validation(format!(
                    "part number {} given twice",
                    part_number
                )));
            }
        }
        self.ensure_open()?;

        let results: Vec<(u32, Result<CompletedPart>)> = stream::iter(parts)
            .map(|(part_number, data)| async move {
                (part_number, self.upload_part(part_number, data).await)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut report = PartUploadReport::default();
        for (part_number, result) in results {
            match result {
                Ok(part) => report.completed.push(part),
                Err(e) => report.failed.push((part_number, e)),
            }
        }
        report.completed.sort_by_key(|p| p.part_number);
        report.failed.sort_by_key(|(n, _)| *n);
        Ok(report)
    }

    /// Walk the parts the server has recorded for this upload
    pub fn list_parts(&self) -> Paginator<ListPartsRequest> {
        self.client.paginate(ListPartsRequest::new(
            self.bucket.as_str(),
            self.key.as_str(),
            self.upload_id.as_str(),
        ))
    }

    /// Assemble the object from `parts`. They are sorted here; duplicates and
    /// an empty list are rejected before anything is sent. A failed complete
    /// leaves the session open so it can be retried or aborted.
    pub async fn complete(&self, mut parts: Vec<CompletedPart>) -> Result<CompleteMultipartUploadOutput> {
        self.ensure_open()?;
        if parts.is_empty() {
            return Err(SufyError::Validation(
                "cannot complete an upload with no parts".to_string(),
            ));
        }
        for part in &parts {
            check_part_number(part.part_number)?;
        }
        parts.sort_by_key(|p| p.part_number);
        if let Some(pair) = parts.windows(2).find(|w| w[0].part_number == w[1].part_number) {
            return Err(SufyError::Validation(format!(
                "part number {} listed twice",
                pair[0].part_number
            )));
        }

        let request = self
            .part_request(Method::POST)
            .json_body(&CompleteMultipartUploadBody { parts: &parts })?;
        let response = self.client.send(request).await?;
        *self.state.lock() = SessionState::Completed;

        tracing::info!(
            bucket = %self.bucket,
            key = %self.key,
            upload_id = %self.upload_id,
            parts = parts.len(),
            "multipart upload completed"
        );

        if response.body.is_empty() {
            return Ok(CompleteMultipartUploadOutput {
                etag: response.etag(),
                ..CompleteMultipartUploadOutput::default()
            });
        }
        response.json()
    }

    /// Discard the upload and every part uploaded so far
    pub async fn abort(&self) -> Result<()> {
        self.ensure_open()?;
        self.client.send(self.part_request(Method::DELETE)).await?;
        *self.state.lock() = SessionState::Aborted;
        tracing::info!(upload_id = %self.upload_id, "multipart upload aborted");
        Ok(())
    }
}

impl SufyClient {
    /// Start a multipart upload
    pub async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        options: &PutObjectOptions,
    ) -> Result<MultipartSession> {
        let mut request = SufyRequest::object(Method::POST, bucket, key).flag("uploads");
        if let Some(content_type) = &options.content_type {
            request = request.header("content-type", content_type.as_str());
        }
        if let Some(storage_class) = &options.storage_class {
            request = request.header("x-sufy-storage-class", storage_class.as_str());
        }
        for (name, value) in &options.metadata {
            request = request.header(&format!("{}{}", META_PREFIX, name), value.as_str());
        }

        let output: CreateMultipartUploadOutput = self.send(request).await?.json()?;
        if output.upload_id.is_empty() {
            return Err(SufyError::InvalidResponse("empty uploadId".to_string()));
        }

        Ok(MultipartSession {
            client: self.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: output.upload_id,
            state: Mutex::new(SessionState::Created),
        })
    }

    /// Upload `data` in one request below the threshold, in parallel parts
    /// above it. A failed part aborts the upload.
    pub async fn upload_multipart(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        config: &MultipartConfig,
    ) -> Result<Option<String>> {
        if (data.len() as u64) < config.threshold {
            let output = self
                .put_object(bucket, key, data, &PutObjectOptions::default())
                .await?;
            return Ok(output.etag);
        }

        let part_size = config.part_size.max(1);
        let part_count = data.len().div_ceil(part_size);
        if part_count > MAX_PART_NUMBER as usize {
            return Err(SufyError::Validation(format!(
                "{} bytes needs {} parts of {} bytes, more than {}",
                data.len(),
                part_count,
                part_size,
                MAX_PART_NUMBER
            )));
        }

        let session = self
            .create_multipart_upload(bucket, key, &PutObjectOptions::default())
            .await?;

        let parts: Vec<(u32, Bytes)> = (0..part_count)
            .map(|i| {
                let start = i * part_size;
                let end = std::cmp::min(start + part_size, data.len());
                ((i + 1) as u32, data.slice(start..end))
            })
            .collect();

        let report = session.upload_parts(parts, config.concurrency).await?;
        if let Some((part_number, err)) = report.failed.into_iter().next() {
            tracing::warn!(
                upload_id = %session.upload_id(),
                part_number,
                error = %err,
                "part upload failed, aborting"
            );
            if let Err(abort_err) = session.abort().await {
                tracing::warn!(upload_id = %session.upload_id(), error = %abort_err, "abort failed");
            }
            return Err(err);
        }

        let output = session.complete(report.completed).await?;
        Ok(output.etag)
    }
}
