//! reqwest-backed implementation of every transport capability.

use std::sync::Arc;

use futures::TryStreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use crate::core::config::ApiConfig;
use crate::core::errors::{SyncError, SyncResult};
use crate::core::ids::EntityId;
use crate::messages::message::AudioAttachment;
use crate::polling::entity::EntityFields;
use crate::speech::SpeechSynthesizer;
use crate::transport::{
    CreatedEntry, CredentialProvider, EntityFetcher, JournalApi, Method, RequestBody,
    StreamRequest, StreamingResponse, Transport, TransportFuture,
};

/// HTTP client for the journaling backend.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    config: ApiConfig,
    credential: Option<Arc<dyn CredentialProvider>>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.credential.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<Value>,
}

impl HttpTransport {
    /// Create a transport for the configured backend.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid or the client cannot be built.
    pub fn new(config: ApiConfig) -> SyncResult<Self> {
        let base_url = config.base_url()?;
        let client = Self::build_client(&config)?;
        Ok(Self {
            client,
            base_url,
            config,
            credential: None,
        })
    }

    /// Attach the bearer credential source.
    #[must_use]
    pub fn with_credential(mut self, credential: Arc<dyn CredentialProvider>) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Base URL requests are resolved against.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn build_client(config: &ApiConfig) -> SyncResult<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain"));

        // Streamed bodies have no whole-request timeout.
        Ok(reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout())
            .build()?)
    }

    /// Resolve an API path, keeping any path prefix of the base URL.
    fn url(&self, path: &str) -> SyncResult<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}{path}"))?)
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> SyncResult<reqwest::RequestBuilder> {
        let mut builder = self.client.request(method, self.url(path)?);
        if let Some(token) = self.credential.as_ref().and_then(|c| c.bearer_token()) {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        Ok(builder)
    }

    fn timed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.request_timeout() {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }

    async fn send_json<T>(&self, builder: reqwest::RequestBuilder) -> SyncResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self.timed(builder).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// Turn a non-2xx response into [`SyncError::Status`] with the backend's detail.
    async fn check(response: reqwest::Response) -> SyncResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.detail)
            .map(|d| match d {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .unwrap_or_default();
        tracing::debug!(status = status.as_u16(), %detail, "backend rejected request");
        Err(SyncError::Status {
            status: status.as_u16(),
            detail,
        })
    }

    async fn open(&self, request: StreamRequest) -> SyncResult<StreamingResponse> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };
        let mut builder = self.request(method, &request.path)?;
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::File {
                field,
                file_name,
                mime,
                bytes,
            } => {
                let part = reqwest::multipart::Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str(&mime)?;
                builder.multipart(reqwest::multipart::Form::new().part(field, part))
            }
        };

        let response = Self::check(builder.send().await?).await?;
        let status = response.status().as_u16();
        tracing::debug!(path = %request.path, status, "stream opened");
        let body = response
            .bytes_stream()
            .map_ok(|bytes| bytes.to_vec())
            .map_err(SyncError::from);
        Ok(StreamingResponse {
            status,
            body: Box::pin(body),
        })
    }

    async fn entry(&self, id: &EntityId) -> SyncResult<EntityFields> {
        let path = format!(
            "{}/{}",
            self.config.entries_path,
            urlencoding::encode(id.as_str())
        );
        let value: Value = self.send_json(self.request(reqwest::Method::GET, &path)?).await?;
        Ok(EntityFields::from_value(value))
    }
}

impl Transport for HttpTransport {
    /// Non-2xx statuses are returned as [`SyncError::Status`] before any body is read.
    fn open_stream(
        &self,
        request: StreamRequest,
    ) -> TransportFuture<'_, SyncResult<StreamingResponse>> {
        Box::pin(self.open(request))
    }
}

impl EntityFetcher for HttpTransport {
    fn fetch_entity<'a>(
        &'a self,
        id: &'a EntityId,
    ) -> TransportFuture<'a, SyncResult<EntityFields>> {
        Box::pin(async move {
            self.entry(id).await.map_err(|err| SyncError::PollFetch {
                entity_id: id.clone(),
                reason: err.to_string(),
            })
        })
    }
}

impl JournalApi for HttpTransport {
    fn create_entry<'a>(
        &'a self,
        content: &'a str,
    ) -> TransportFuture<'a, SyncResult<CreatedEntry>> {
        Box::pin(async move {
            let builder = self
                .request(reqwest::Method::POST, &self.config.entry_path)?
                .json(&json!({ "content": content }));
            self.send_json(builder).await
        })
    }

    fn suggestions(&self) -> TransportFuture<'_, SyncResult<Vec<String>>> {
        Box::pin(async move {
            let builder = self.request(reqwest::Method::GET, &self.config.suggestions_path)?;
            self.send_json(builder).await
        })
    }
}

impl SpeechSynthesizer for HttpTransport {
    fn synthesize<'a>(
        &'a self,
        text: &'a str,
    ) -> TransportFuture<'a, SyncResult<AudioAttachment>> {
        Box::pin(async move {
            let builder = self
                .request(reqwest::Method::POST, &self.config.tts_path)?
                .json(&json!({ "text": text }));
            self.send_json(builder).await
        })
    }
}
