//! Generation backends.
//!
//! A backend turns a [`GenerationRequest`] into a stream of raw bytes. The
//! orchestrator owns decoding; backends only deal with transport.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use coursegen_protocol::{GenerationEvent, GenerationRequest};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::ACCEPT;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::BackendError;

/// Environment variable holding the bearer token.
pub const TOKEN_ENV_VAR: &str = "COURSEGEN_TOKEN";

/// Raw response body of a generation request.
pub type ByteStream = BoxStream<'static, Result<Bytes, BackendError>>;

/// Trait for generation backends.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Get the name of this backend.
    fn name(&self) -> &str;

    /// Open a streaming request. Fails if the request could not be sent or
    /// was answered with a non-success status.
    async fn open(&self, request: &GenerationRequest) -> Result<ByteStream, BackendError>;
}

/// Supplies the bearer credential attached to every request.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// A fixed token, or none.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Read the token from `COURSEGEN_TOKEN`.
    pub fn from_env() -> Self {
        Self {
            token: std::env::var(TOKEN_ENV_VAR).ok().filter(|t| !t.is_empty()),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn bearer_token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// Backend speaking server-sent events over HTTP.
pub struct HttpGenerationBackend {
    client: reqwest::Client,
    config: BackendConfig,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpGenerationBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self {
            client,
            config,
            credentials: Arc::new(StaticCredentials::default()),
        })
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    fn endpoint(&self, request: &GenerationRequest) -> String {
        if request.is_modification() {
            self.config.url(&self.config.modify_path)
        } else {
            self.config.url(&self.config.generate_path)
        }
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn open(&self, request: &GenerationRequest) -> Result<ByteStream, BackendError> {
        let url = self.endpoint(request);
        debug!("Opening generation stream for unit {} at {url}", request.unit_id);

        let mut builder = self
            .client
            .post(&url)
            .header(ACCEPT, "text/event-stream")
            .json(request);
        if let Some(token) = self.credentials.bearer_token() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!("Generation request for unit {} failed: {status}", request.unit_id);
            return Err(BackendError::Status {
                status: status.as_u16(),
                message,
            });
        }

        info!("Generation stream opened for unit {}", request.unit_id);
        Ok(response.bytes_stream().map_err(BackendError::from).boxed())
    }
}

/// The server side of a stream opened on a [`ChannelBackend`].
pub struct OpenedStream {
    pub request: GenerationRequest,
    feed: mpsc::UnboundedSender<Result<Bytes, BackendError>>,
}

impl OpenedStream {
    /// Send raw bytes. Returns `false` once the reader is gone.
    pub fn send_bytes(&self, bytes: impl Into<Bytes>) -> bool {
        self.feed.send(Ok(bytes.into())).is_ok()
    }

    /// Send one `data:` record carrying `event`.
    pub fn send_event(&self, event: &GenerationEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(json) => self.send_bytes(format!("data: {json}\n\n")),
            Err(e) => {
                warn!("Cannot encode event: {e}");
                false
            }
        }
    }

    /// Fail the stream with a transport error.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.feed
            .send(Err(BackendError::Stream(message.into())))
            .is_ok()
    }

    /// Whether the reading side has dropped the stream.
    pub fn is_closed(&self) -> bool {
        self.feed.is_closed()
    }

    /// Close the connection.
    pub fn close(self) {}
}

/// In-process backend: every opened request is handed to the receiver
/// returned by [`ChannelBackend::new`], which then plays the server.
pub struct ChannelBackend {
    opened: mpsc::UnboundedSender<OpenedStream>,
}

impl ChannelBackend {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OpenedStream>) {
        let (opened, rx) = mpsc::unbounded_channel();
        (Self { opened }, rx)
    }
}

#[async_trait]
impl GenerationBackend for ChannelBackend {
    fn name(&self) -> &str {
        "channel"
    }

    async fn open(&self, request: &GenerationRequest) -> Result<ByteStream, BackendError> {
        let (feed, rx) = mpsc::unbounded_channel();
        self.opened
            .send(OpenedStream {
                request: request.clone(),
                feed,
            })
            .map_err(|_| BackendError::Stream("backend is shut down".to_string()))?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
