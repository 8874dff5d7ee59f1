use std::sync::Arc;

use chat_relay_error::RelayError;
use tokio::time::Instant;

use crate::backend::{AgentBackend, BackendStream, Invocation};
use crate::cancel::TerminalCause;
use crate::session::StreamSession;
use crate::sse;
use crate::writer::{FrameKind, SseWriter, WriteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Init,
    Invoking,
    Forwarding,
    Completed,
    Failed,
    Aborted,
}

impl ForwardState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Invoking => "invoking",
            Self::Forwarding => "forwarding",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub state: ForwardState,
    pub cause: TerminalCause,
    pub chunks: u64,
    pub bytes: u64,
}

/// Drives one backend invocation through
/// `Init -> Invoking -> Forwarding -> {Completed | Failed | Aborted}`.
///
/// Chunks are written to the client untouched. The only frame this type ever
/// authors is the single error event on the `Failed` path.
#[derive(Debug)]
pub struct Forwarder {
    session: Arc<StreamSession>,
    writer: SseWriter,
    state: ForwardState,
    cause: Option<TerminalCause>,
    chunks: u64,
    bytes: u64,
}

impl Forwarder {
    pub fn new(session: Arc<StreamSession>, writer: SseWriter) -> Self {
        Self {
            session,
            writer,
            state: ForwardState::Init,
            cause: None,
            chunks: 0,
            bytes: 0,
        }
    }

    pub fn state(&self) -> ForwardState {
        self.state
    }

    /// Issues the backend call. Returns the stream once the backend accepted
    /// the turn; on any other result the forwarder is already terminal.
    pub async fn invoke(
        &mut self,
        backend: &dyn AgentBackend,
        invocation: Invocation,
    ) -> Option<BackendStream> {
        self.state = ForwardState::Invoking;
        let backend_cancel = self.session.cancel.backend_token();
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = self.writer.client_gone() => {
                self.abort(TerminalCause::ClientGone);
                return None;
            }
            _ = backend_cancel.cancelled() => {
                self.abort_on_cancel();
                return None;
            }
            result = backend.invoke(invocation, backend_cancel.clone()) => result,
        };

        match result {
            Ok(stream) => {
                self.session.mark_backend_started();
                self.state = ForwardState::Forwarding;
                tracing::info!(
                    session_id = %self.session.session_id(),
                    accept_ms = started.elapsed().as_millis() as u64,
                    "forwarder: backend accepted turn"
                );
                Some(stream)
            }
            Err(err) => {
                self.fail(TerminalCause::InvocationFailed, err).await;
                None
            }
        }
    }

    /// Pumps chunks until the backend ends, fails, or either side goes away.
    /// The stream is released on every path.
    pub async fn pump(&mut self, mut stream: BackendStream) {
        let backend_cancel = self.session.cancel.backend_token();

        while self.state == ForwardState::Forwarding {
            tokio::select! {
                biased;
                _ = self.writer.client_gone() => {
                    self.abort(TerminalCause::ClientGone);
                }
                _ = backend_cancel.cancelled() => {
                    self.abort_on_cancel();
                }
                next = stream.next_chunk() => match next {
                    Some(Ok(chunk)) => {
                        if chunk.is_empty() {
                            continue;
                        }
                        let len = chunk.len() as u64;
                        match self
                            .writer
                            .send_until(chunk, FrameKind::Forwarded, &backend_cancel)
                            .await
                        {
                            Ok(_) => {
                                self.chunks += 1;
                                self.bytes += len;
                            }
                            Err(WriteError::Cancelled) => self.abort_on_cancel(),
                            Err(err) => {
                                tracing::debug!(
                                    session_id = %self.session.session_id(),
                                    error = %err,
                                    "forwarder: client write failed"
                                );
                                self.abort(TerminalCause::ClientGone);
                            }
                        }
                    }
                    Some(Err(err)) => {
                        self.fail(TerminalCause::BackendFailed, err).await;
                    }
                    None => {
                        self.state = ForwardState::Completed;
                        self.cause = Some(TerminalCause::Completed);
                        self.session.cancel.terminate(TerminalCause::Completed);
                    }
                },
            }
        }

        stream.release();
        tracing::debug!(
            session_id = %self.session.session_id(),
            state = self.state.as_str(),
            chunks = self.chunks,
            bytes = self.bytes,
            "forwarder: backend stream released"
        );
    }

    /// Marks the turn aborted because the client went away before the backend
    /// was ever called.
    pub fn disconnect(&mut self) {
        self.abort(TerminalCause::ClientGone);
    }

    pub fn outcome(&self) -> ForwardOutcome {
        ForwardOutcome {
            state: self.state,
            cause: self
                .cause
                .or_else(|| self.session.cancel.cause())
                .unwrap_or(TerminalCause::ClientGone),
            chunks: self.chunks,
            bytes: self.bytes,
        }
    }

    async fn fail(&mut self, cause: TerminalCause, err: RelayError) {
        self.state = ForwardState::Failed;
        self.cause = Some(cause);
        self.session.cancel.terminate(cause);
        tracing::warn!(
            session_id = %self.session.session_id(),
            cause = cause.as_str(),
            chunks = self.chunks,
            error = %err,
            "forwarder: backend failed"
        );
        let event = err.to_stream_event(self.session.session_id());
        let client_cancel = self.session.cancel.client_token();
        if let Err(write_err) = self
            .writer
            .send_until(sse::error_frame(&event), FrameKind::Terminal, &client_cancel)
            .await
        {
            tracing::debug!(
                session_id = %self.session.session_id(),
                error = %write_err,
                "forwarder: client gone before error event could be written"
            );
        }
    }

    fn abort(&mut self, cause: TerminalCause) {
        self.state = ForwardState::Aborted;
        self.session.cancel.cancel_client(cause);
        self.cause = self.session.cancel.cause().or(Some(cause));
        tracing::info!(
            session_id = %self.session.session_id(),
            cause = self.cause.map(|c| c.as_str()).unwrap_or("unknown"),
            chunks = self.chunks,
            "forwarder: aborted"
        );
    }

    fn abort_on_cancel(&mut self) {
        let cause = self
            .session
            .cancel
            .cause()
            .unwrap_or(TerminalCause::ClientCancelled);
        self.abort(cause);
    }
}
