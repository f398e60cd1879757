//! Transport capabilities consumed by the engines and controllers.
//!
//! Every capability is a trait returning a boxed future, so controllers can
//! be driven by the reqwest-backed [`HttpTransport`] in production and by
//! in-memory fakes in tests.

pub mod http;

use std::future::Future;
use std::pin::Pin;

use futures::Stream;
use futures::stream;
use serde::Deserialize;
use serde_json::Value;

use crate::core::errors::{SyncError, SyncResult};
use crate::core::ids::EntityId;
use crate::polling::entity::EntityFields;

pub use http::HttpTransport;

/// Boxed future type for transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Body chunks in arrival order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = SyncResult<Vec<u8>>> + Send>>;

/// HTTP method of a streamed request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Method {
    /// `GET`.
    Get,
    /// `POST`.
    Post,
}

/// Request payload.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    /// No body.
    Empty,
    /// JSON document.
    Json(Value),
    /// Single-file multipart form.
    File {
        /// Form field name.
        field: String,
        /// File name reported to the server.
        file_name: String,
        /// MIME type of the file.
        mime: String,
        /// File contents.
        bytes: Vec<u8>,
    },
}

/// Request whose response body is read incrementally.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRequest {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the API base URL.
    pub path: String,
    /// Extra headers; the credential is added by the transport.
    pub headers: Vec<(String, String)>,
    /// Payload.
    pub body: RequestBody,
}

impl StreamRequest {
    /// `POST` a JSON document.
    #[must_use]
    pub fn post_json(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            headers: Vec::new(),
            body: RequestBody::Json(body),
        }
    }

    /// `POST` a single file as multipart form data.
    #[must_use]
    pub fn post_file(
        path: impl Into<String>,
        file_name: impl Into<String>,
        mime: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            headers: Vec::new(),
            body: RequestBody::File {
                field: "file".to_string(),
                file_name: file_name.into(),
                mime: mime.into(),
                bytes,
            },
        }
    }
}

/// Response whose body has not been read yet.
pub struct StreamingResponse {
    /// HTTP status code.
    pub status: u16,
    /// Body chunks.
    pub body: ChunkStream,
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl StreamingResponse {
    /// Build a response from pre-made chunks.
    #[must_use]
    pub fn from_chunks(status: u16, chunks: Vec<SyncResult<Vec<u8>>>) -> Self {
        Self {
            status,
            body: Box::pin(stream::iter(chunks)),
        }
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Take the body of a successful response.
    ///
    /// # Errors
    /// Returns [`SyncError::Status`] for a non-2xx status.
    pub fn into_body(self) -> SyncResult<ChunkStream> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(SyncError::Status {
                status: self.status,
                detail: String::new(),
            })
        }
    }
}

/// Capability to issue a request and read its body incrementally.
pub trait Transport: Send + Sync {
    /// Send the request and return once the response head has arrived.
    ///
    /// # Errors
    /// Returns an error if the request cannot be sent.
    fn open_stream(
        &self,
        request: StreamRequest,
    ) -> TransportFuture<'_, SyncResult<StreamingResponse>>;
}

/// Capability to fetch the current fields of a polled entity.
pub trait EntityFetcher: Send + Sync {
    /// Fetch the entity. Must be idempotent.
    ///
    /// # Errors
    /// Returns an error on network, auth, or decoding failure.
    fn fetch_entity<'a>(
        &'a self,
        id: &'a EntityId,
    ) -> TransportFuture<'a, SyncResult<EntityFields>>;
}

/// Adapter turning an async closure into an [`EntityFetcher`].
pub struct FnFetcher<F> {
    fetch: F,
}

impl<F> FnFetcher<F> {
    /// Wrap a fetch closure.
    #[must_use]
    pub const fn new(fetch: F) -> Self {
        Self { fetch }
    }
}

impl<F, Fut> EntityFetcher for FnFetcher<F>
where
    F: Fn(EntityId) -> Fut + Send + Sync,
    Fut: Future<Output = SyncResult<EntityFields>> + Send + 'static,
{
    fn fetch_entity<'a>(
        &'a self,
        id: &'a EntityId,
    ) -> TransportFuture<'a, SyncResult<EntityFields>> {
        Box::pin((self.fetch)(id.clone()))
    }
}

/// Entry returned by the backend after creation.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CreatedEntry {
    /// Key to poll for enrichment.
    pub id: EntityId,
    /// Remaining fields of the created record.
    #[serde(flatten)]
    pub fields: EntityFields,
}

/// Non-streamed journal endpoints.
pub trait JournalApi: Send + Sync {
    /// Create a journal entry from text.
    ///
    /// # Errors
    /// Returns an error if the request fails or the backend rejects the entry.
    fn create_entry<'a>(
        &'a self,
        content: &'a str,
    ) -> TransportFuture<'a, SyncResult<CreatedEntry>>;

    /// Fetch suggested follow-up questions for mind search.
    ///
    /// # Errors
    /// Returns an error if the request fails.
    fn suggestions(&self) -> TransportFuture<'_, SyncResult<Vec<String>>>;
}

/// Source of the bearer credential attached to requests.
pub trait CredentialProvider: Send + Sync {
    /// Current token, if the user is signed in.
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed token.
#[derive(Clone)]
pub struct StaticCredential(String);

impl StaticCredential {
    /// Wrap a token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticCredential(***)")
    }
}

impl CredentialProvider for StaticCredential {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}
