//! Pagination engine
//!
//! A [`Paginator`] walks a listing one page at a time. The cursor it holds is
//! the next request to send, so saving [`Paginator::cursor`] and handing it to
//! [`Paginator::resume`] later continues exactly where the walk stopped, even
//! after a failed page. Marker-based (v1) and token-based (v2) listings use
//! distinct request types, so their cursors cannot be mixed.
//!
//! A truncated page that carries no usable cursor is an
//! [`SufyError::InvalidResponse`] rather than an empty tail.

use crate::sufy::client::SufyClient;
use crate::sufy::error::{Result, SufyError};
use crate::sufy::types::{
    ListMultipartUploadsPage, ListMultipartUploadsRequest, ListObjectsPage, ListObjectsRequest,
    ListObjectsV2Page, ListObjectsV2Request, ListPartsPage, ListPartsRequest,
};
use async_trait::async_trait;
use futures::stream::{self, Stream};

/// A listing request that can be advanced from the page it produced
#[async_trait]
pub trait Pageable: Clone + Send + Sync + 'static {
    type Page: Send + 'static;

    /// Fetch the page this cursor points at
    async fn fetch(&self, client: &SufyClient) -> Result<Self::Page>;

    /// The cursor for the following page, `None` once the listing is complete
    fn next(&self, page: &Self::Page) -> Result<Option<Self>>;
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn stalled(what: &str, value: &str) -> SufyError {
    SufyError::InvalidResponse(format!("{} did not advance past {:?}", what, value))
}

#[async_trait]
impl Pageable for ListObjectsRequest {
    type Page = ListObjectsPage;

    async fn fetch(&self, client: &SufyClient) -> Result<ListObjectsPage> {
        client.list_objects(self).await
    }

    fn next(&self, page: &ListObjectsPage) -> Result<Option<Self>> {
        if !page.is_truncated {
            return Ok(None);
        }

        let marker = match non_empty(page.next_marker.as_deref()) {
            Some(marker) => marker.to_string(),
            // Without a delimiter every entry is a key, so the last one is the cursor
            None if self.delimiter.is_none() => page
                .contents
                .last()
                .map(|o| o.key.clone())
                .ok_or_else(|| {
                    SufyError::InvalidResponse(
                        "truncated listing page has neither nextMarker nor contents".to_string(),
                    )
                })?,
            None => {
                return Err(SufyError::InvalidResponse(
                    "truncated delimited listing page has no nextMarker".to_string(),
                ))
            }
        };

        if self.marker.as_deref() == Some(marker.as_str()) {
            return Err(stalled("marker", &marker));
        }

        Ok(Some(Self {
            marker: Some(marker),
            ..self.clone()
        }))
    }
}

#[async_trait]
impl Pageable for ListObjectsV2Request {
    type Page = ListObjectsV2Page;

    async fn fetch(&self, client: &SufyClient) -> Result<ListObjectsV2Page> {
        client.list_objects_v2(self).await
    }

    fn next(&self, page: &ListObjectsV2Page) -> Result<Option<Self>> {
        if !page.is_truncated {
            return Ok(None);
        }

        let token = non_empty(page.next_continuation_token.as_deref()).ok_or_else(|| {
            SufyError::InvalidResponse(
                "truncated listing page has no nextContinuationToken".to_string(),
            )
        })?;
        if self.continuation_token.as_deref() == Some(token) {
            return Err(stalled("continuation token", token));
        }

        Ok(Some(Self {
            continuation_token: Some(token.to_string()),
            ..self.clone()
        }))
    }
}

#[async_trait]
impl Pageable for ListPartsRequest {
    type Page = ListPartsPage;

    async fn fetch(&self, client: &SufyClient) -> Result<ListPartsPage> {
        client.list_parts(self).await
    }

    fn next(&self, page: &ListPartsPage) -> Result<Option<Self>> {
        if !page.is_truncated {
            return Ok(None);
        }

        let marker = page
            .next_part_number_marker
            .or_else(|| page.parts.last().map(|p| p.part_number))
            .ok_or_else(|| {
                SufyError::InvalidResponse(
                    "truncated parts page has no nextPartNumberMarker".to_string(),
                )
            })?;
        if self.part_number_marker.is_some_and(|current| marker <= current) {
            return Err(stalled("part number marker", &marker.to_string()));
        }

        Ok(Some(Self {
            part_number_marker: Some(marker),
            ..self.clone()
        }))
    }
}

#[async_trait]
impl Pageable for ListMultipartUploadsRequest {
    type Page = ListMultipartUploadsPage;

    async fn fetch(&self, client: &SufyClient) -> Result<ListMultipartUploadsPage> {
        client.list_multipart_uploads(self).await
    }

    fn next(&self, page: &ListMultipartUploadsPage) -> Result<Option<Self>> {
        if !page.is_truncated {
            return Ok(None);
        }

        let key_marker = non_empty(page.next_key_marker.as_deref()).ok_or_else(|| {
            SufyError::InvalidResponse("truncated uploads page has no nextKeyMarker".to_string())
        })?;
        let upload_id_marker = non_empty(page.next_upload_id_marker.as_deref());

        if self.key_marker.as_deref() == Some(key_marker)
            && self.upload_id_marker.as_deref() == upload_id_marker
        {
            return Err(stalled("key marker", key_marker));
        }

        Ok(Some(Self {
            key_marker: Some(key_marker.to_string()),
            upload_id_marker: upload_id_marker.map(str::to_string),
            ..self.clone()
        }))
    }
}

/// Lazy, resumable page walker
pub struct Paginator<R: Pageable> {
    client: SufyClient,
    next: Option<R>,
    pages: usize,
}

impl<R: Pageable> Paginator<R> {
    pub fn new(client: SufyClient, first: R) -> Self {
        Self {
            client,
            next: Some(first),
            pages: 0,
        }
    }

    /// Continue from a cursor saved with [`cursor`](Self::cursor)
    pub fn resume(client: SufyClient, cursor: R) -> Self {
        Self::new(client, cursor)
    }

    /// The request that will fetch the next page, `None` when done
    pub fn cursor(&self) -> Option<&R> {
        self.next.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.next.is_none()
    }

    /// Pages fetched so far
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    /// Fetch the next page. A failed fetch leaves the cursor in place so the
    /// call can be repeated.
    pub async fn next_page(&mut self) -> Result<Option<R::Page>> {
        let Some(request) = self.next.take() else {
            return Ok(None);
        };

        let page = match request.fetch(&self.client).await {
            Ok(page) => page,
            Err(e) => {
                self.next = Some(request);
                return Err(e);
            }
        };

        match request.next(&page) {
            Ok(next) => self.next = next,
            Err(e) => {
                self.next = Some(request);
                return Err(e);
            }
        }
        self.pages += 1;
        Ok(Some(page))
    }

    /// Walk to the end, keeping every page
    pub async fn collect_pages(mut self) -> Result<Vec<R::Page>> {
        let mut pages = Vec::new();
        while let Some(page) = self.next_page().await? {
            pages.push(page);
        }
        Ok(pages)
    }

    /// Pages as a stream. Stops after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<R::Page>> + Send {
        stream::try_unfold(self, |mut paginator| async move {
            Ok(paginator.next_page().await?.map(|page| (page, paginator)))
        })
    }
}
