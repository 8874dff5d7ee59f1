use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::session::ActivityClock;

pub type BodyStream = ReceiverStream<Result<Bytes, Infallible>>;

const EVENT_END: &[u8] = b"\n\n";
const TAIL_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("output stream already closed by the relay")]
    Closed,
    #[error("client disconnected")]
    Disconnected,
    #[error("write abandoned because the turn is being torn down")]
    Cancelled,
}

/// Who authored a frame, which decides what happens when a backend event is
/// still half-written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Opaque backend bytes. Always written; may leave an event open.
    Forwarded,
    /// Relay comment (`connected`, `keep-alive`). Skipped while an event is open.
    Comment,
    /// Side-channel event. Queued while an event is open and flushed at the
    /// next boundary.
    Injected,
    /// The relay's error event. Any open event is terminated first.
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
    Skipped,
}

/// The only path to the response body. Every frame is sent as one channel
/// message while the writer lock is held, so frames from the heartbeat, the
/// forwarder and the side channel never interleave, and relay frames never
/// land inside a backend event.
#[derive(Debug, Clone)]
pub struct SseWriter {
    inner: Arc<WriterInner>,
}

#[derive(Debug)]
struct WriterInner {
    output: Mutex<Output>,
    // Never used to send; only watched for the receiver going away.
    watcher: StdMutex<Option<mpsc::Sender<Result<Bytes, Infallible>>>>,
    activity: ActivityClock,
    closes: AtomicUsize,
}

#[derive(Debug)]
struct Output {
    sender: Option<mpsc::Sender<Result<Bytes, Infallible>>>,
    /// Last bytes written, enough to recognise `\n\n` and `\r\n\r\n`.
    tail: Vec<u8>,
    pending: Vec<Bytes>,
}

impl Output {
    fn at_boundary(&self) -> bool {
        self.tail.ends_with(EVENT_END) || self.tail.ends_with(b"\r\n\r\n")
    }

    fn record(&mut self, frame: &[u8]) {
        self.tail.extend_from_slice(frame);
        if self.tail.len() > TAIL_LEN {
            self.tail.drain(..self.tail.len() - TAIL_LEN);
        }
    }
}

impl SseWriter {
    pub fn channel(activity: ActivityClock, capacity: usize) -> (Self, BodyStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = Self {
            inner: Arc::new(WriterInner {
                output: Mutex::new(Output {
                    sender: Some(tx.clone()),
                    tail: EVENT_END.to_vec(),
                    pending: Vec::new(),
                }),
                watcher: StdMutex::new(Some(tx)),
                activity,
                closes: AtomicUsize::new(0),
            }),
        };
        (writer, ReceiverStream::new(rx))
    }

    /// Forwards backend bytes untouched.
    pub async fn write(&self, frame: Bytes) -> Result<(), WriteError> {
        self.send(frame, FrameKind::Forwarded).await.map(|_| ())
    }

    pub async fn send(&self, frame: Bytes, kind: FrameKind) -> Result<Delivery, WriteError> {
        let mut output = self.inner.output.lock().await;
        let Some(sender) = output.sender.clone() else {
            return Err(WriteError::Closed);
        };

        if !output.at_boundary() {
            match kind {
                FrameKind::Forwarded => {}
                FrameKind::Comment => return Ok(Delivery::Skipped),
                FrameKind::Injected => {
                    output.pending.push(frame);
                    return Ok(Delivery::Queued);
                }
                FrameKind::Terminal => {
                    self.push(&sender, &mut output, Bytes::from_static(EVENT_END))
                        .await?;
                }
            }
        }

        self.push(&sender, &mut output, frame).await?;
        if kind == FrameKind::Forwarded && output.at_boundary() {
            while !output.pending.is_empty() {
                let queued = output.pending.remove(0);
                self.push(&sender, &mut output, queued).await?;
            }
        }
        Ok(Delivery::Sent)
    }

    /// Like [`SseWriter::send`], but gives up with [`WriteError::Cancelled`]
    /// once `stop` fires, so a client that stopped reading cannot park the
    /// caller on a full channel.
    pub async fn send_until(
        &self,
        frame: Bytes,
        kind: FrameKind,
        stop: &CancellationToken,
    ) -> Result<Delivery, WriteError> {
        tokio::select! {
            biased;
            _ = stop.cancelled() => Err(WriteError::Cancelled),
            result = self.send(frame, kind) => result,
        }
    }

    async fn push(
        &self,
        sender: &mpsc::Sender<Result<Bytes, Infallible>>,
        output: &mut Output,
        frame: Bytes,
    ) -> Result<(), WriteError> {
        if frame.is_empty() {
            return Ok(());
        }
        output.record(&frame);
        sender
            .send(Ok(frame))
            .await
            .map_err(|_| WriteError::Disconnected)?;
        self.inner.activity.touch();
        Ok(())
    }

    /// Resolves once the response body has been dropped by the HTTP layer.
    /// Resolves immediately if the writer is already closed.
    pub async fn client_gone(&self) {
        let watcher = {
            let guard = self
                .inner
                .watcher
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.clone()
        };
        if let Some(sender) = watcher {
            sender.closed().await;
        }
    }

    /// Ends the response body. Only the first call has any effect; it returns
    /// `true`. Queued side-channel frames are flushed without waiting, after
    /// terminating any event the backend left open.
    pub async fn close(&self) -> bool {
        let mut output = self.inner.output.lock().await;
        let Some(sender) = output.sender.take() else {
            return false;
        };
        if !output.pending.is_empty() {
            let mut frames = std::mem::take(&mut output.pending);
            if !output.at_boundary() {
                frames.insert(0, Bytes::from_static(EVENT_END));
            }
            for frame in frames {
                if sender.try_send(Ok(frame)).is_err() {
                    tracing::debug!("writer: dropped queued frame at close");
                    break;
                }
            }
        }
        drop(sender);
        self.inner
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }
}
