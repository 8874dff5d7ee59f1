//! Scripted collaborators for the unit and integration tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use chat_relay_error::RelayError;
use futures::future::BoxFuture;
use futures::{stream, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::backend::{AgentBackend, BackendStream, Invocation};
use crate::side_channel::{SideChannelEvent, SideChannelSource};

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub enum Step {
    Chunk(Bytes),
    Delay(Duration),
    Fail(String),
}

impl Step {
    pub fn chunk(data: &str) -> Self {
        Self::Chunk(Bytes::from(data.to_string()))
    }

    pub fn delay(duration: Duration) -> Self {
        Self::Delay(duration)
    }

    pub fn fail(message: &str) -> Self {
        Self::Fail(message.to_string())
    }
}

/// Backend that plays back a fixed script and records how it was driven.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    steps: Vec<Step>,
    reject: Option<String>,
    accept_delay: Duration,
    invocations: StdMutex<Vec<Invocation>>,
    cancel: StdMutex<Option<CancellationToken>>,
    released: Arc<AtomicBool>,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    /// A backend whose invocation fails before any stream is returned.
    pub fn rejecting(message: &str) -> Self {
        Self {
            reject: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn with_accept_delay(mut self, delay: Duration) -> Self {
        self.accept_delay = delay;
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).clone()
    }

    /// Whether the cancellation handle passed to the last invocation fired.
    pub fn cancel_fired(&self) -> bool {
        lock(&self.cancel)
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl AgentBackend for ScriptedBackend {
    fn invoke(
        &self,
        invocation: Invocation,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<BackendStream, RelayError>> {
        Box::pin(async move {
            lock(&self.invocations).push(invocation);
            *lock(&self.cancel) = Some(cancel);

            if !self.accept_delay.is_zero() {
                tokio::time::sleep(self.accept_delay).await;
            }
            if let Some(message) = &self.reject {
                return Err(RelayError::InvocationFailed {
                    status: Some(503),
                    message: message.clone(),
                });
            }

            let chunks = stream::unfold(self.steps.clone().into_iter(), |mut steps| async move {
                loop {
                    match steps.next()? {
                        Step::Chunk(data) => return Some((Ok(data), steps)),
                        Step::Delay(duration) => tokio::time::sleep(duration).await,
                        Step::Fail(message) => {
                            return Some((Err(RelayError::backend_stream(message)), steps))
                        }
                    }
                }
            })
            .boxed();

            let released = self.released.clone();
            Ok(BackendStream::new(chunks)
                .with_release(move || released.store(true, Ordering::SeqCst)))
        })
    }
}

/// Side channel that becomes ready on the `ready_after`-th poll.
#[derive(Debug, Default)]
pub struct ScriptedSideChannel {
    ready_after: Option<u64>,
    fail_first: u64,
    polls: AtomicU64,
}

impl ScriptedSideChannel {
    pub fn ready_after(polls: u64) -> Self {
        Self {
            ready_after: Some(polls),
            ..Self::default()
        }
    }

    pub fn never_ready() -> Self {
        Self::default()
    }

    pub fn failing_first(mut self, polls: u64) -> Self {
        self.fail_first = polls;
        self
    }

    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }
}

impl SideChannelSource for ScriptedSideChannel {
    fn poll<'a>(
        &'a self,
        _user_id: &'a str,
        session_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SideChannelEvent>, RelayError>> {
        Box::pin(async move {
            let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if poll <= self.fail_first {
                return Err(RelayError::SideChannel {
                    message: format!("status service unavailable (poll {poll})"),
                });
            }
            match self.ready_after {
                Some(ready) if poll >= ready => Ok(Some(SideChannelEvent {
                    kind: "browser_session_ready".to_string(),
                    content: json!({ "live_view_url": format!("https://browser.test/{session_id}") }),
                })),
                _ => Ok(None),
            }
        })
    }
}

pub fn sample_invocation() -> Invocation {
    Invocation {
        user_id: "u-1".to_string(),
        session_id: "s-1".to_string(),
        message: "hello".to_string(),
        model_id: "default-model".to_string(),
        tools: Vec::new(),
        files: Vec::new(),
        temperature: None,
        system_prompt: None,
        caching_enabled: false,
        request_type: None,
        artifact_id: None,
        api_keys: BTreeMap::new(),
        auth_token: None,
    }
}
