//! Transports to the host application.

use std::fmt;
use std::future::Future;

use dwell_core::Envelope;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// A failed delivery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The host did not answer in time.
    #[error("delivery timed out")]
    Timeout,
    /// The delivery failed; retrying may succeed.
    #[error("delivery failed: {0}")]
    Failed(String),
    /// The host cannot be reached or is overloaded.
    #[error("host unavailable: {0}")]
    Unavailable(String),
}

/// A way to hand one envelope to the host.
pub trait Channel: Send + Sync {
    fn deliver(&self, envelope: &Envelope) -> impl Future<Output = Result<(), ChannelError>> + Send;
}

fn encode(envelope: &Envelope) -> Result<String, ChannelError> {
    envelope
        .to_json()
        .map_err(|err| ChannelError::Failed(format!("encode {}: {err}", envelope.kind())))
}

/// POSTs envelopes as JSON to `{base_url}/messages`.
///
/// The client is cheap to clone; clones share a connection pool.
#[derive(Clone)]
pub struct HttpChannel {
    http: reqwest::Client,
    endpoint: String,
}

impl fmt::Debug for HttpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpChannel")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpChannel {
    pub fn new(base_url: &str) -> Result<Self, ChannelError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| ChannelError::Failed(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            http,
            endpoint: format!("{}/messages", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify(err: &reqwest::Error) -> ChannelError {
    if err.is_timeout() {
        ChannelError::Timeout
    } else if err.is_connect() {
        ChannelError::Unavailable(err.to_string())
    } else {
        ChannelError::Failed(err.to_string())
    }
}

impl Channel for HttpChannel {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        let body = encode(envelope)?;
        let response = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| classify(&err))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        let message = format!("status {status}: {text}");
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            Err(ChannelError::Unavailable(message))
        } else {
            Err(ChannelError::Failed(message))
        }
    }
}

/// Writes each envelope as one JSON line, native-messaging style.
pub struct JsonLinesChannel<W> {
    out: Mutex<W>,
}

impl<W> fmt::Debug for JsonLinesChannel<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLinesChannel").finish_non_exhaustive()
    }
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesChannel<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl JsonLinesChannel<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> Channel for JsonLinesChannel<W> {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        let mut line = encode(envelope)?;
        line.push('\n');
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes())
            .await
            .map_err(|err| ChannelError::Unavailable(err.to_string()))?;
        out.flush()
            .await
            .map_err(|err| ChannelError::Unavailable(err.to_string()))
    }
}

/// The host channel selected by configuration.
#[derive(Debug)]
pub enum HostChannel {
    Http(HttpChannel),
    Stdout(JsonLinesChannel<tokio::io::Stdout>),
}

impl Channel for HostChannel {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        match self {
            Self::Http(channel) => channel.deliver(envelope).await,
            Self::Stdout(channel) => channel.deliver(envelope).await,
        }
    }
}
