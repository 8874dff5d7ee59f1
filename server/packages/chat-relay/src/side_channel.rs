use std::sync::Arc;
use std::time::Duration;

use chat_relay_error::RelayError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::session::StreamSession;
use crate::sse;
use crate::writer::{Delivery, FrameKind, SseWriter, WriteError};

/// Out-of-band notification injected into the turn's stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideChannelEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
}

/// External state polled while the agent is working. `Ok(Some(_))` means the
/// state of interest has been reached.
pub trait SideChannelSource: Send + Sync + 'static {
    fn poll<'a>(
        &'a self,
        user_id: &'a str,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SideChannelEvent>, RelayError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerOutcome {
    Emitted,
    Cancelled,
    /// The condition was met but the client was already gone.
    WriteFailed,
}

pub fn spawn(
    session: Arc<StreamSession>,
    writer: SseWriter,
    source: Arc<dyn SideChannelSource>,
    period: Duration,
) -> JoinHandle<PollerOutcome> {
    tokio::spawn(run(session, writer, source, period))
}

async fn run(
    session: Arc<StreamSession>,
    writer: SseWriter,
    source: Arc<dyn SideChannelSource>,
    period: Duration,
) -> PollerOutcome {
    let stop = session.cancel.poller_token();
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut polls: u64 = 0;

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                tracing::debug!(
                    session_id = %session.session_id(),
                    polls = polls,
                    "side channel: cancelled"
                );
                return PollerOutcome::Cancelled;
            }
            _ = ticker.tick() => {}
        }

        polls += 1;
        let polled = tokio::select! {
            _ = stop.cancelled() => return PollerOutcome::Cancelled,
            polled = source.poll(session.user_id(), session.session_id()) => polled,
        };

        let event = match polled {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(
                    session_id = %session.session_id(),
                    poll = polls,
                    error = %err,
                    "side channel: poll failed"
                );
                continue;
            }
        };

        // The forward loop may have finished while the poll was in flight.
        if stop.is_cancelled() {
            return PollerOutcome::Cancelled;
        }

        let frame = match sse::data_frame(&json!({
            "type": event.kind,
            "content": event.content,
            "metadata": { "session_id": session.session_id() },
        })) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "side channel: failed to encode event");
                return PollerOutcome::Cancelled;
            }
        };

        return match writer.send_until(frame, FrameKind::Injected, &stop).await {
            Ok(delivery) => {
                tracing::info!(
                    session_id = %session.session_id(),
                    kind = %event.kind,
                    polls = polls,
                    queued = delivery == Delivery::Queued,
                    "side channel: event emitted"
                );
                PollerOutcome::Emitted
            }
            Err(WriteError::Cancelled) => PollerOutcome::Cancelled,
            Err(err) => {
                tracing::debug!(
                    session_id = %session.session_id(),
                    error = %err,
                    "side channel: output closed before event could be written"
                );
                PollerOutcome::WriteFailed
            }
        };
    }
}

/// Polls `<base>/sessions/<id>/browser` for a remote browser session.
#[derive(Debug, Clone)]
pub struct HttpBrowserSessionSource {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BrowserStatus {
    status: String,
    #[serde(default)]
    live_view_url: Option<String>,
}

impl HttpBrowserSessionSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl SideChannelSource for HttpBrowserSessionSource {
    fn poll<'a>(
        &'a self,
        _user_id: &'a str,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SideChannelEvent>, RelayError>> {
        Box::pin(async move {
            let url = format!("{}/sessions/{}/browser", self.base_url, session_id);
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|err| RelayError::SideChannel {
                    message: err.to_string(),
                })?;
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let response = response
                .error_for_status()
                .map_err(|err| RelayError::SideChannel {
                    message: err.to_string(),
                })?;
            let status: BrowserStatus =
                response.json().await.map_err(|err| RelayError::SideChannel {
                    message: err.to_string(),
                })?;
            if status.status != "ready" {
                return Ok(None);
            }
            Ok(Some(SideChannelEvent {
                kind: "browser_session_ready".to_string(),
                content: json!({ "live_view_url": status.live_view_url }),
            }))
        })
    }
}
