//! Batch delete
//!
//! Up to [`MAX_DELETE_BATCH`] keys per request, sent as JSON with a
//! `Content-MD5` header. Per-key outcomes are matched by key, not position.

use crate::sufy::client::SufyClient;
use crate::sufy::dispatch::SufyRequest;
use crate::sufy::error::{Result, SufyError};
use crate::sufy::types::{
    DeleteBatch, DeleteError, DeleteObjectsOutput, DeleteOutcome, ListObjectsV2Request,
    ObjectIdentifier,
};
use futures::stream::StreamExt;
use hyper::Method;
use std::collections::{HashMap, HashSet};

/// Largest number of keys in one batch delete
pub const MAX_DELETE_BATCH: usize = 1000;

impl DeleteBatch {
    /// Build a batch, rejecting empty keys and more than [`MAX_DELETE_BATCH`] keys
    pub fn new<I, S>(keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let objects: Vec<ObjectIdentifier> = keys
            .into_iter()
            .map(|k| ObjectIdentifier { key: k.into() })
            .collect();

        let batch = Self {
            objects,
            quiet: false,
        };
        batch.validate()?;
        Ok(batch)
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.objects.is_empty() || self.objects.len() > MAX_DELETE_BATCH {
            return Err(SufyError::Validation(format!(
                "delete batch must hold 1..={} keys, has {}",
                MAX_DELETE_BATCH,
                self.objects.len()
            )));
        }
        if self.objects.iter().any(|o| o.key.is_empty()) {
            return Err(SufyError::Validation("delete batch contains an empty key".to_string()));
        }
        Ok(())
    }
}

impl DeleteObjectsOutput {
    /// Outcome for every key of `batch`, in request order. In quiet mode the
    /// server reports failures only, so unreported keys count as deleted.
    pub fn outcomes(&self, batch: &DeleteBatch) -> Vec<(String, DeleteOutcome)> {
        let deleted: HashSet<&str> = self.deleted.iter().map(|d| d.key.as_str()).collect();
        let failed: HashMap<&str, &DeleteError> =
            self.errors.iter().map(|e| (e.key.as_str(), e)).collect();

        batch
            .objects
            .iter()
            .map(|o| {
                let outcome = if let Some(e) = failed.get(o.key.as_str()) {
                    DeleteOutcome::Failed {
                        code: e.code.clone(),
                        message: e.message.clone(),
                    }
                } else if deleted.contains(o.key.as_str()) || batch.quiet {
                    DeleteOutcome::Deleted
                } else {
                    DeleteOutcome::Unreported
                };
                (o.key.clone(), outcome)
            })
            .collect()
    }

    /// Whether `deleted` lists the batch keys in request order. Servers
    /// usually echo the order, but nothing depends on it.
    pub fn echoes_request_order(&self, batch: &DeleteBatch) -> bool {
        self.deleted
            .iter()
            .map(|d| d.key.as_str())
            .eq(batch.objects.iter().map(|o| o.key.as_str()))
    }
}

/// Totals of a prefix-wide delete
#[derive(Debug, Default)]
pub struct DeletePrefixReport {
    pub deleted: usize,
    pub errors: Vec<DeleteError>,
}

impl SufyClient {
    /// Delete up to [`MAX_DELETE_BATCH`] objects in one request
    pub async fn delete_objects(&self, bucket: &str, batch: &DeleteBatch) -> Result<DeleteObjectsOutput> {
        batch.validate()?;

        let request = SufyRequest::bucket(Method::POST, bucket)
            .flag("delete")
            .json_body(batch)?
            .content_md5();
        let response = self.send(request).await?;

        let output: DeleteObjectsOutput = if response.body.is_empty() {
            DeleteObjectsOutput::default()
        } else {
            response.json()?
        };

        if !output.errors.is_empty() {
            tracing::warn!(
                bucket = %bucket,
                failed = output.errors.len(),
                requested = batch.len(),
                "batch delete reported failures"
            );
        }
        Ok(output)
    }

    /// Delete every object under `prefix`. Listing pages are consumed in
    /// order; each page's keys become one batch, with at most `concurrency`
    /// batches in flight.
    pub async fn delete_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        concurrency: usize,
    ) -> Result<DeletePrefixReport> {
        let listing = self
            .paginate(
                ListObjectsV2Request::new(bucket)
                    .with_prefix(prefix)
                    .with_max_keys(MAX_DELETE_BATCH as u32),
            )
            .into_stream();

        let results: Vec<Result<(usize, DeleteObjectsOutput)>> = listing
            .map(|page| async move {
                let page = page?;
                if page.contents.is_empty() {
                    return Ok((0, DeleteObjectsOutput::default()));
                }
                let batch = DeleteBatch::new(page.contents.into_iter().map(|o| o.key))?.quiet(true);
                let output = self.delete_objects(bucket, &batch).await?;
                Ok((batch.len(), output))
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut report = DeletePrefixReport::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok((requested, output)) => {
                    report.deleted += requested.saturating_sub(output.errors.len());
                    report.errors.extend(output.errors);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        tracing::info!(
            bucket = %bucket,
            prefix = %prefix,
            failed = report.errors.len(),
            "prefix delete finished"
        );
        Ok(report)
    }
}
