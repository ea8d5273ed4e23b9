//! Sufy protocol client
//!
//! This module provides:
//! - Canonical request form and Sufy HMAC-SHA256 signing
//! - A dispatcher that sends one signed request per call over a pluggable transport
//! - Typed error classification of failed responses
//! - Resumable pagination, multipart upload sessions and batch delete

pub mod batch;
pub mod canonical;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod multipart;
pub mod paginate;
pub mod retry;
pub mod signer;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use batch::{DeletePrefixReport, MAX_DELETE_BATCH};
pub use canonical::CanonicalRequest;
pub use client::{MetadataDirective, SufyClient};
pub use dispatch::{Dispatcher, Endpoint, SufyRequest, SufyResponse};
pub use error::{ConfigKind, ErrorKind, Resource, Result, ServiceError, SufyError, TransportError};
pub use multipart::{MultipartSession, PartUploadReport, SessionState};
pub use paginate::{Pageable, Paginator};
pub use retry::RetryPolicy;
pub use signer::{Clock, Credentials, FixedClock, Signer, SystemClock};
pub use transport::{HttpRecord, HttpRequest, HttpResponse, HyperTransport, RecordingTransport, Transport};
pub use types::*;
