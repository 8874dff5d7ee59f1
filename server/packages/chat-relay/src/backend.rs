use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chat_relay_error::RelayError;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::request::Attachment;

/// Everything the agent needs for one turn.
#[derive(Debug, Clone, Serialize)]
pub struct Invocation {
    pub user_id: String,
    pub session_id: String,
    pub message: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub caching_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub api_keys: BTreeMap<String, String>,
    #[serde(skip)]
    pub auth_token: Option<String>,
}

pub type ChunkStream = BoxStream<'static, Result<Bytes, RelayError>>;

/// Chunks of an accepted invocation plus the hook that frees whatever is
/// behind them. [`BackendStream::release`] must be called on every exit path.
pub struct BackendStream {
    chunks: ChunkStream,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl fmt::Debug for BackendStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendStream")
            .field("releasable", &self.on_release.is_some())
            .finish()
    }
}

impl BackendStream {
    pub fn new(chunks: ChunkStream) -> Self {
        Self {
            chunks,
            on_release: None,
        }
    }

    pub fn with_release(mut self, on_release: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(on_release));
        self
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, RelayError>> {
        self.chunks.next().await
    }

    /// Drops the underlying stream (closing any connection behind it) and runs
    /// the release hook.
    pub fn release(mut self) {
        let on_release = self.on_release.take();
        drop(self);
        if let Some(on_release) = on_release {
            on_release();
        }
    }
}

/// The agent that produces a turn. `cancel` fires when the relay no longer
/// wants output; implementations should stop work server-side when it does.
pub trait AgentBackend: Send + Sync + 'static {
    fn invoke(
        &self,
        invocation: Invocation,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<BackendStream, RelayError>>;
}

/// Posts the invocation as JSON to an agent HTTP endpoint and relays the
/// response body as-is.
#[derive(Debug, Clone)]
pub struct HttpAgentBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpAgentBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl AgentBackend for HttpAgentBackend {
    fn invoke(
        &self,
        invocation: Invocation,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<BackendStream, RelayError>> {
        Box::pin(async move {
            let mut request = self
                .client
                .post(&self.url)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(&invocation);
            if let Some(token) = invocation.auth_token.as_deref() {
                request = request.bearer_auth(token);
            }

            tracing::debug!(
                session_id = %invocation.session_id,
                model_id = %invocation.model_id,
                url = %self.url,
                "backend: invoking agent"
            );

            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RelayError::InvocationFailed {
                        status: None,
                        message: "cancelled before the agent accepted the turn".to_string(),
                    });
                }
                response = request.send() => response.map_err(|err| RelayError::InvocationFailed {
                    status: None,
                    message: err.to_string(),
                })?,
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(RelayError::InvocationFailed {
                    status: Some(status.as_u16()),
                    message: if body.is_empty() {
                        format!("agent returned {status}")
                    } else {
                        format!("agent returned {status}: {}", truncate(&body, 200))
                    },
                });
            }

            let chunks = response
                .bytes_stream()
                .map_err(|err| RelayError::backend_stream(err.to_string()))
                .boxed();
            Ok(BackendStream::new(chunks))
        })
    }
}

/// Streams the user's message back as a few `text` events followed by `done`.
#[derive(Debug, Clone, Default)]
pub struct EchoBackend {
    pub chunk_delay: Duration,
}

impl AgentBackend for EchoBackend {
    fn invoke(
        &self,
        invocation: Invocation,
        _cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<BackendStream, RelayError>> {
        let delay = self.chunk_delay;
        Box::pin(async move {
            let mut frames: Vec<Bytes> = invocation
                .message
                .split_inclusive(' ')
                .map(|word| {
                    let event = json!({
                        "type": "text",
                        "content": word,
                        "metadata": { "session_id": invocation.session_id },
                    });
                    Bytes::from(format!("data: {event}\n\n"))
                })
                .collect();
            let done = json!({
                "type": "done",
                "metadata": { "session_id": invocation.session_id, "model_id": invocation.model_id },
            });
            frames.push(Bytes::from(format!("data: {done}\n\n")));

            let chunks = stream::iter(frames)
                .then(move |frame| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok::<_, RelayError>(frame)
                })
                .boxed();
            Ok(BackendStream::new(chunks))
        })
    }
}

fn truncate(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}
