use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chat_relay_error::RelayError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backend::{AgentBackend, Invocation};
use crate::cancel::TerminalCause;
use crate::config::RelayConfig;
use crate::finalizer::SessionFinalizer;
use crate::forwarder::{ForwardOutcome, Forwarder};
use crate::heartbeat;
use crate::request::{AttachmentPreprocessor, ChatRequest, PassthroughPreprocessor};
use crate::session::StreamSession;
use crate::side_channel::{self, PollerOutcome, SideChannelSource};
use crate::store::{session_title, ConfigStore, SessionRecord, SessionStore};
use crate::writer::{BodyStream, SseWriter};

/// Who is asking, as established in front of this service.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub auth_token: Option<String>,
}

/// A turn whose session and configuration are resolved; nothing has been
/// sent to the client yet.
#[derive(Debug)]
pub struct PreparedTurn {
    session: Arc<StreamSession>,
    invocation: Invocation,
}

impl PreparedTurn {
    pub fn session(&self) -> &Arc<StreamSession> {
        &self.session
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }
}

/// A started turn: the response body plus the task driving it.
#[derive(Debug)]
pub struct RelayStream {
    pub session_id: String,
    pub created: bool,
    pub body: BodyStream,
    pub task: JoinHandle<TurnReport>,
}

#[derive(Debug, Clone, Copy)]
pub struct TurnReport {
    pub outcome: ForwardOutcome,
    pub keep_alives: u64,
    pub side_channel: Option<PollerOutcome>,
    pub finalized: bool,
    pub closed: bool,
    pub close_count: usize,
}

/// Active turns are keyed by owner as well as session id.
type StreamKey = (String, String);

pub struct ChatRelay {
    config: RelayConfig,
    backend: Arc<dyn AgentBackend>,
    sessions: Arc<dyn SessionStore>,
    configs: Arc<dyn ConfigStore>,
    side_channel: Option<Arc<dyn SideChannelSource>>,
    preprocessor: Arc<dyn AttachmentPreprocessor>,
    active: StdMutex<HashMap<StreamKey, Arc<StreamSession>>>,
}

impl ChatRelay {
    pub fn new(
        config: RelayConfig,
        backend: Arc<dyn AgentBackend>,
        sessions: Arc<dyn SessionStore>,
        configs: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            config,
            backend,
            sessions,
            configs,
            side_channel: None,
            preprocessor: Arc::new(PassthroughPreprocessor),
            active: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_side_channel(mut self, source: Arc<dyn SideChannelSource>) -> Self {
        self.side_channel = Some(source);
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn AttachmentPreprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn preprocessor(&self) -> &dyn AttachmentPreprocessor {
        self.preprocessor.as_ref()
    }

    pub fn active_streams(&self) -> usize {
        self.lock_active().len()
    }

    /// Resolves the session and merges configuration. Any failure here happens
    /// before a byte is streamed and is reported as a plain HTTP error.
    pub async fn prepare(
        &self,
        caller: Caller,
        request: ChatRequest,
    ) -> Result<PreparedTurn, RelayError> {
        let (record, created) = self.resolve_session(&caller.user_id, &request).await?;
        let user_config = self.configs.user_config(&caller.user_id).await?;

        let model_id = request
            .model_id
            .clone()
            .or_else(|| user_config.default_model_id.clone())
            .unwrap_or_else(|| self.config.default_model_id.clone());
        let tools = request
            .enabled_tools
            .clone()
            .unwrap_or_else(|| user_config.enabled_tools.clone());
        let armed = request.enables(&self.config.side_channel_tool);

        tracing::info!(
            session_id = %record.session_id,
            user_id = %caller.user_id,
            created = created,
            model_id = %model_id,
            tools = ?tools,
            side_channel_armed = armed,
            attachments = request.files.len(),
            "relay: turn prepared"
        );

        let session = Arc::new(StreamSession::new(
            record.session_id.clone(),
            caller.user_id.clone(),
            created,
            armed,
        ));
        let invocation = Invocation {
            user_id: caller.user_id,
            session_id: record.session_id,
            message: request.message,
            model_id,
            tools,
            files: request.files,
            temperature: request.temperature,
            system_prompt: request.system_prompt,
            caching_enabled: user_config
                .caching_enabled
                .unwrap_or(self.config.caching_enabled),
            request_type: request.request_type,
            artifact_id: request.selected_artifact_id,
            api_keys: user_config.api_keys,
            auth_token: caller.auth_token,
        };

        Ok(PreparedTurn {
            session,
            invocation,
        })
    }

    async fn resolve_session(
        &self,
        user_id: &str,
        request: &ChatRequest,
    ) -> Result<(SessionRecord, bool), RelayError> {
        if let Some(session_id) = request.session_id.as_deref() {
            if let Some(record) = self.sessions.get(user_id, session_id).await? {
                return Ok((record, false));
            }
            tracing::info!(
                session_id = %session_id,
                user_id = %user_id,
                "relay: requested session not found, creating a new one"
            );
        }
        let record = self
            .sessions
            .create(user_id, &session_title(&request.message))
            .await?;
        Ok((record, true))
    }

    /// Opens the output stream and spawns the task that drives the turn.
    ///
    /// A session carries at most one turn at a time; a second start while the
    /// first is still registered fails with `StreamConflict`.
    pub fn start(self: &Arc<Self>, turn: PreparedTurn) -> Result<RelayStream, RelayError> {
        let PreparedTurn {
            session,
            invocation,
        } = turn;
        self.register(session.clone())?;
        let (writer, body) =
            SseWriter::channel(session.activity().clone(), self.config.channel_capacity);

        let task = tokio::spawn(self.clone().drive(session.clone(), writer, invocation));
        Ok(RelayStream {
            session_id: session.session_id().to_string(),
            created: session.created(),
            body,
            task,
        })
    }

    /// Cancels the caller's in-flight turn for `session_id`.
    pub fn abort(&self, user_id: &str, session_id: &str) -> Result<(), RelayError> {
        let key = (user_id.to_string(), session_id.to_string());
        let session = self
            .lock_active()
            .get(&key)
            .cloned()
            .ok_or_else(|| RelayError::StreamNotFound {
                session_id: session_id.to_string(),
            })?;
        tracing::info!(session_id = %session_id, user_id = %user_id, "relay: abort requested");
        session.cancel.cancel_client(TerminalCause::ClientCancelled);
        Ok(())
    }

    async fn drive(
        self: Arc<Self>,
        session: Arc<StreamSession>,
        writer: SseWriter,
        invocation: Invocation,
    ) -> TurnReport {
        let started = Instant::now();
        let model_id = invocation.model_id.clone();
        let tools = invocation.tools.clone();
        let heartbeat_stop = session.cancel.client_token().child_token();
        let mut forwarder = Forwarder::new(session.clone(), writer.clone());
        let mut heartbeat_task = None;
        let mut poller = None;

        match heartbeat::announce(&writer).await {
            Ok(()) => {
                heartbeat_task = Some(heartbeat::spawn(
                    session.clone(),
                    writer.clone(),
                    self.config.heartbeat(),
                    heartbeat_stop.clone(),
                ));
                if let Some(stream) = forwarder.invoke(self.backend.as_ref(), invocation).await {
                    poller = self.arm_side_channel(&session, &writer);
                    forwarder.pump(stream).await;
                }
            }
            Err(err) => {
                tracing::debug!(
                    session_id = %session.session_id(),
                    error = %err,
                    "relay: client gone before stream opened"
                );
                forwarder.disconnect();
            }
        }

        let outcome = forwarder.outcome();
        session.cancel.terminate(outcome.cause);

        let side_channel = match poller {
            Some(handle) => handle.await.ok(),
            None => None,
        };
        heartbeat_stop.cancel();
        let keep_alives = match heartbeat_task {
            Some(handle) => handle.await.unwrap_or(0),
            None => 0,
        };

        let finalized = SessionFinalizer::new(self.sessions.clone())
            .finalize(&session, &model_id, &tools)
            .await;
        self.unregister(&session);
        let closed = writer.close().await;
        let close_count = writer.close_count();

        tracing::info!(
            session_id = %session.session_id(),
            user_id = %session.user_id(),
            state = outcome.state.as_str(),
            cause = outcome.cause.as_str(),
            chunks = outcome.chunks,
            bytes = outcome.bytes,
            keep_alives = keep_alives,
            side_channel = ?side_channel,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "relay: turn finished"
        );

        TurnReport {
            outcome,
            keep_alives,
            side_channel,
            finalized,
            closed,
            close_count,
        }
    }

    fn arm_side_channel(
        &self,
        session: &Arc<StreamSession>,
        writer: &SseWriter,
    ) -> Option<JoinHandle<PollerOutcome>> {
        if !session.side_channel_armed() {
            return None;
        }
        let Some(source) = self.side_channel.clone() else {
            tracing::debug!(
                session_id = %session.session_id(),
                "relay: side channel requested but no source configured"
            );
            return None;
        };
        Some(side_channel::spawn(
            session.clone(),
            writer.clone(),
            source,
            self.config.poll_interval,
        ))
    }

    fn register(&self, session: Arc<StreamSession>) -> Result<(), RelayError> {
        let mut active = self.lock_active();
        match active.entry(stream_key(&session)) {
            Entry::Occupied(_) => {
                tracing::info!(
                    session_id = %session.session_id(),
                    user_id = %session.user_id(),
                    "relay: turn rejected, session already streaming"
                );
                Err(RelayError::StreamConflict {
                    session_id: session.session_id().to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    fn unregister(&self, session: &Arc<StreamSession>) {
        let mut active = self.lock_active();
        let key = stream_key(session);
        if active
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            active.remove(&key);
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<StreamKey, Arc<StreamSession>>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn stream_key(session: &StreamSession) -> StreamKey {
    (
        session.user_id().to_string(),
        session.session_id().to_string(),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chat_relay_error::ErrorType;
    use futures::StreamExt;

    use super::*;
    use crate::forwarder::ForwardState;
    use crate::store::UserConfig;
    use crate::memory::{InMemorySessionStore, StaticConfigStore};
    use crate::testing::{ScriptedBackend, ScriptedSideChannel, Step};

    struct Harness {
        relay: Arc<ChatRelay>,
        backend: Arc<ScriptedBackend>,
        sessions: Arc<InMemorySessionStore>,
    }

    fn harness(backend: ScriptedBackend) -> Harness {
        harness_with(backend, None, StaticConfigStore::new())
    }

    fn harness_with(
        backend: ScriptedBackend,
        side_channel: Option<Arc<ScriptedSideChannel>>,
        configs: StaticConfigStore,
    ) -> Harness {
        let backend = Arc::new(backend);
        let sessions = Arc::new(InMemorySessionStore::new());
        let mut relay = ChatRelay::new(
            RelayConfig::default(),
            backend.clone(),
            sessions.clone(),
            Arc::new(configs),
        );
        if let Some(source) = side_channel {
            relay = relay.with_side_channel(source);
        }
        Harness {
            relay: Arc::new(relay),
            backend,
            sessions,
        }
    }

    fn caller() -> Caller {
        Caller {
            user_id: "u-1".to_string(),
            auth_token: Some("token".to_string()),
        }
    }

    fn request(message: &str) -> ChatRequest {
        ChatRequest {
            message: message.to_string(),
            ..ChatRequest::default()
        }
    }

    async fn collect(body: BodyStream) -> Vec<String> {
        body.filter_map(|frame| async move { frame.ok() })
            .map(|frame: Bytes| String::from_utf8(frame.to_vec()).unwrap())
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn prepare_creates_session_and_merges_config() {
        let configs = StaticConfigStore::new().with_user(
            "u-1",
            UserConfig {
                default_model_id: Some("user-model".to_string()),
                enabled_tools: vec!["search".to_string()],
                api_keys: [("openai".to_string(), "k".to_string())].into(),
                caching_enabled: Some(false),
            },
        );
        let h = harness_with(ScriptedBackend::new(Vec::new()), None, configs);

        let turn = h.relay.prepare(caller(), request("hello there")).await.unwrap();
        assert!(turn.session().created());
        assert!(!turn.session().side_channel_armed());
        let invocation = turn.invocation();
        assert_eq!(invocation.model_id, "user-model");
        assert_eq!(invocation.tools, vec!["search".to_string()]);
        assert!(!invocation.caching_enabled);
        assert_eq!(invocation.api_keys.get("openai").map(String::as_str), Some("k"));
        assert_eq!(invocation.auth_token.as_deref(), Some("token"));

        let stored = h
            .sessions
            .record("u-1", turn.session().session_id())
            .expect("session created");
        assert_eq!(stored.title, "hello there");
    }

    #[tokio::test]
    async fn prepare_reuses_known_session_and_request_overrides_win() {
        let h = harness(ScriptedBackend::new(Vec::new()));
        let existing = h.sessions.insert("u-1", "earlier");

        let turn = h
            .relay
            .prepare(
                caller(),
                ChatRequest {
                    session_id: Some(existing.session_id.clone()),
                    model_id: Some("picked".to_string()),
                    enabled_tools: Some(vec!["browser".to_string()]),
                    ..request("again")
                },
            )
            .await
            .unwrap();
        assert!(!turn.session().created());
        assert_eq!(turn.session().session_id(), existing.session_id);
        assert!(turn.session().side_channel_armed());
        assert_eq!(turn.invocation().model_id, "picked");
        assert_eq!(h.sessions.len(), 1);
    }

    #[tokio::test]
    async fn prepare_surfaces_collaborator_failures() {
        let h = harness_with(
            ScriptedBackend::new(Vec::new()),
            None,
            StaticConfigStore::new().failing(),
        );
        let err = h.relay.prepare(caller(), request("hi")).await.unwrap_err();
        assert_eq!(err.error_type(), ErrorType::ConfigUnavailable);
    }

    #[tokio::test]
    async fn completed_turn_streams_connected_then_chunks_and_finalizes_once() {
        let h = harness(ScriptedBackend::new(vec![
            Step::chunk("data: {\"c\":1}\n\n"),
            Step::chunk("data: {\"c\":2}\n\n"),
            Step::chunk("data: {\"c\":3}\n\n"),
        ]));
        let turn = h.relay.prepare(caller(), request("hi")).await.unwrap();
        let stream = h.relay.start(turn).unwrap();
        let session_id = stream.session_id.clone();

        let frames = collect(stream.body).await;
        let report = stream.task.await.unwrap();

        assert!(frames[0].starts_with(": connected "));
        assert_eq!(
            &frames[1..],
            &["data: {\"c\":1}\n\n", "data: {\"c\":2}\n\n", "data: {\"c\":3}\n\n"]
        );
        assert_eq!(report.outcome.state, ForwardState::Completed);
        assert!(report.finalized);
        assert!(report.closed);
        assert_eq!(h.sessions.record("u-1", &session_id).unwrap().message_count, 1);
        assert_eq!(h.relay.active_streams(), 0);
    }

    #[tokio::test]
    async fn invocation_failure_yields_connected_and_one_error() {
        let h = harness(ScriptedBackend::rejecting("no capacity"));
        let turn = h.relay.prepare(caller(), request("hi")).await.unwrap();
        let stream = h.relay.start(turn).unwrap();

        let frames = collect(stream.body).await;
        let report = stream.task.await.unwrap();

        assert_eq!(frames.len(), 2);
        assert!(frames[0].starts_with(": connected "));
        assert!(frames[1].contains("\"type\":\"error\""));
        assert!(frames[1].contains("no capacity"));
        assert_eq!(report.outcome.state, ForwardState::Failed);
        assert_eq!(report.outcome.cause, TerminalCause::InvocationFailed);
        assert!(report.finalized);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_gets_keep_alives() {
        let h = harness(ScriptedBackend::new(vec![
            Step::delay(Duration::from_secs(45)),
            Step::chunk("data: {\"late\":true}\n\n"),
        ]));
        let turn = h.relay.prepare(caller(), request("hi")).await.unwrap();
        let stream = h.relay.start(turn).unwrap();

        let frames = collect(stream.body).await;
        let report = stream.task.await.unwrap();

        let keep_alives = frames
            .iter()
            .filter(|f| f.starts_with(": keep-alive "))
            .count();
        assert_eq!(keep_alives, 2);
        assert_eq!(report.keep_alives, 2);
        assert_eq!(frames.last().unwrap(), "data: {\"late\":true}\n\n");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_gap_inside_an_event_leaves_the_event_intact() {
        let h = harness(ScriptedBackend::new(vec![
            Step::chunk("data: {\"a\":"),
            Step::delay(Duration::from_secs(45)),
            Step::chunk("1}\n\n"),
        ]));
        let turn = h.relay.prepare(caller(), request("hi")).await.unwrap();
        let stream = h.relay.start(turn).unwrap();

        let frames = collect(stream.body).await;
        let report = stream.task.await.unwrap();

        assert!(frames[0].starts_with(": connected "));
        assert_eq!(frames[1..].concat(), "data: {\"a\":1}\n\n");
        assert_eq!(report.keep_alives, 0);
        assert_eq!(report.outcome.state, ForwardState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn gap_starting_between_heartbeat_ticks_gets_a_keep_alive() {
        let h = harness(ScriptedBackend::new(vec![
            Step::delay(Duration::from_secs(19)),
            Step::chunk("data: {\"n\":1}\n\n"),
            Step::delay(Duration::from_millis(20_500)),
            Step::chunk("data: {\"n\":2}\n\n"),
        ]));
        let turn = h.relay.prepare(caller(), request("hi")).await.unwrap();
        let stream = h.relay.start(turn).unwrap();

        let frames = collect(stream.body).await;
        let report = stream.task.await.unwrap();

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[1], "data: {\"n\":1}\n\n");
        assert!(frames[2].starts_with(": keep-alive "));
        assert_eq!(frames[3], "data: {\"n\":2}\n\n");
        assert_eq!(report.keep_alives, 1);
    }

    #[tokio::test]
    async fn mid_stream_failure_closes_once_and_finalizes() {
        let h = harness(ScriptedBackend::new(vec![
            Step::chunk("data: {\"c\":1}\n\n"),
            Step::fail("upstream reset"),
            Step::chunk("data: {\"never\":true}\n\n"),
        ]));
        let turn = h.relay.prepare(caller(), request("hi")).await.unwrap();
        let stream = h.relay.start(turn).unwrap();
        let session_id = stream.session_id.clone();

        let frames = collect(stream.body).await;
        let report = stream.task.await.unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1], "data: {\"c\":1}\n\n");
        assert!(frames[2].contains("\"type\":\"error\""));
        assert!(frames[2].contains("upstream reset"));
        assert!(frames.iter().all(|f| !f.contains("never")));
        assert_eq!(report.outcome.state, ForwardState::Failed);
        assert_eq!(report.outcome.cause, TerminalCause::BackendFailed);
        assert!(report.closed);
        assert_eq!(report.close_count, 1);
        assert!(report.finalized);
        assert_eq!(h.sessions.update_calls(), 1);
        assert_eq!(h.sessions.record("u-1", &session_id).unwrap().message_count, 1);
        assert!(h.backend.released());
        assert_eq!(h.relay.active_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_turn_on_a_streaming_session_is_rejected() {
        let h = harness(ScriptedBackend::new(vec![Step::delay(Duration::from_secs(3600))]));
        let first = h.relay.prepare(caller(), request("first")).await.unwrap();
        let stream = h.relay.start(first).unwrap();
        let session_id = stream.session_id.clone();

        let second = h
            .relay
            .prepare(
                caller(),
                ChatRequest {
                    session_id: Some(session_id.clone()),
                    ..request("second")
                },
            )
            .await
            .unwrap();
        let err = h.relay.start(second).unwrap_err();
        assert_eq!(err.error_type(), ErrorType::StreamConflict);
        assert_eq!(h.relay.active_streams(), 1);

        h.relay.abort("u-1", &session_id).unwrap();
        collect(stream.body).await;
        let report = stream.task.await.unwrap();
        assert_eq!(report.outcome.cause, TerminalCause::ClientCancelled);
        assert_eq!(h.relay.active_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn side_channel_event_is_injected_between_chunks() {
        let source = Arc::new(ScriptedSideChannel::ready_after(2));
        let h = harness_with(
            ScriptedBackend::new(vec![
                Step::chunk("data: {\"c\":1}\n\n"),
                Step::delay(Duration::from_secs(10)),
                Step::chunk("data: {\"c\":2}\n\n"),
            ]),
            Some(source.clone()),
            StaticConfigStore::new(),
        );
        let turn = h
            .relay
            .prepare(
                caller(),
                ChatRequest {
                    enabled_tools: Some(vec!["browser".to_string()]),
                    ..request("open a page")
                },
            )
            .await
            .unwrap();
        let stream = h.relay.start(turn).unwrap();

        let frames = collect(stream.body).await;
        let report = stream.task.await.unwrap();

        assert_eq!(report.side_channel, Some(PollerOutcome::Emitted));
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[1], "data: {\"c\":1}\n\n");
        assert!(frames[2].contains("browser_session_ready"));
        assert_eq!(frames[3], "data: {\"c\":2}\n\n");
        assert_eq!(source.polls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unarmed_request_never_polls() {
        let source = Arc::new(ScriptedSideChannel::ready_after(1));
        let h = harness_with(
            ScriptedBackend::new(vec![
                Step::delay(Duration::from_secs(10)),
                Step::chunk("data: {}\n\n"),
            ]),
            Some(source.clone()),
            StaticConfigStore::new(),
        );
        let turn = h.relay.prepare(caller(), request("hi")).await.unwrap();
        let stream = h.relay.start(turn).unwrap();
        collect(stream.body).await;
        let report = stream.task.await.unwrap();

        assert_eq!(report.side_channel, None);
        assert_eq!(source.polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_cancels_backend_and_poller_and_closes_once() {
        let source = Arc::new(ScriptedSideChannel::never_ready());
        let h = harness_with(
            ScriptedBackend::new(vec![Step::delay(Duration::from_secs(3600))]),
            Some(source.clone()),
            StaticConfigStore::new(),
        );
        let turn = h
            .relay
            .prepare(
                caller(),
                ChatRequest {
                    enabled_tools: Some(vec!["browser".to_string()]),
                    ..request("long job")
                },
            )
            .await
            .unwrap();
        let stream = h.relay.start(turn).unwrap();
        let session_id = stream.session_id.clone();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.relay.active_streams(), 1);
        assert!(h.relay.abort("someone-else", &session_id).is_err());
        h.relay.abort("u-1", &session_id).unwrap();

        let frames = collect(stream.body).await;
        let report = stream.task.await.unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(report.outcome.state, ForwardState::Aborted);
        assert_eq!(report.outcome.cause, TerminalCause::ClientCancelled);
        assert_eq!(report.side_channel, Some(PollerOutcome::Cancelled));
        assert!(h.backend.cancel_fired());
        assert!(h.backend.released());
        assert!(report.closed);
        assert!(report.finalized);
        assert_eq!(h.relay.active_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_body_tears_everything_down() {
        let h = harness(ScriptedBackend::new(vec![
            Step::chunk("data: {\"c\":1}\n\n"),
            Step::delay(Duration::from_secs(3600)),
        ]));
        let turn = h.relay.prepare(caller(), request("hi")).await.unwrap();
        let mut stream = h.relay.start(turn).unwrap();

        let first = stream.body.next().await.unwrap().unwrap();
        assert!(first.starts_with(b": connected "));
        drop(stream.body);

        let report = stream.task.await.unwrap();
        assert_eq!(report.outcome.state, ForwardState::Aborted);
        assert_eq!(report.outcome.cause, TerminalCause::ClientGone);
        assert!(h.backend.cancel_fired());
        assert!(h.backend.released());
        assert!(report.closed);
    }
}
