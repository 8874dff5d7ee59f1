use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::session::StreamSession;
use crate::sse;
use crate::writer::{Delivery, FrameKind, SseWriter, WriteError};

const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub threshold: Duration,
}

/// Writes the `connected` comment. Must run before anything else touches the
/// writer so it always precedes backend output.
pub async fn announce(writer: &SseWriter) -> Result<(), WriteError> {
    writer
        .send(sse::connected_frame(Utc::now()), FrameKind::Comment)
        .await
        .map(|_| ())
}

pub fn spawn(
    session: Arc<StreamSession>,
    writer: SseWriter,
    config: HeartbeatConfig,
    stop: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(run(session, writer, config, stop))
}

/// Sleeps until the connection would have been idle for `threshold`, then
/// re-checks the activity clock. `interval` is the retry delay when a
/// keep-alive had to be held back inside an open backend event.
///
/// Returns the number of keep-alives written.
async fn run(
    session: Arc<StreamSession>,
    writer: SseWriter,
    config: HeartbeatConfig,
    stop: CancellationToken,
) -> u64 {
    let threshold = config.threshold.max(MIN_PERIOD);
    let retry = config.interval.max(MIN_PERIOD);
    let mut deadline = session.activity().last() + threshold;
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = sleep_until(deadline) => {}
        }

        let idle = session.activity().idle_for();
        if idle < threshold {
            deadline = session.activity().last() + threshold;
            continue;
        }

        match writer
            .send_until(sse::keep_alive_frame(Utc::now()), FrameKind::Comment, &stop)
            .await
        {
            Ok(Delivery::Sent) => {
                sent += 1;
                deadline = Instant::now() + threshold;
                tracing::trace!(
                    session_id = %session.session_id(),
                    idle_ms = idle.as_millis() as u64,
                    "heartbeat: keep-alive sent"
                );
            }
            Ok(_) => {
                deadline = Instant::now() + retry;
                tracing::trace!(
                    session_id = %session.session_id(),
                    "heartbeat: backend event open, keep-alive held back"
                );
            }
            Err(err) => {
                tracing::debug!(
                    session_id = %session.session_id(),
                    error = %err,
                    "heartbeat: output closed, stopping"
                );
                break;
            }
        }
    }

    sent
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::StreamExt;

    use super::*;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(20),
            threshold: Duration::from_secs(20),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_gap_produces_keep_alive() {
        let session = Arc::new(StreamSession::new("s", "u", false, false));
        let (writer, mut body) = SseWriter::channel(session.activity().clone(), 16);
        let stop = CancellationToken::new();
        let handle = spawn(session.clone(), writer.clone(), config(), stop.clone());

        tokio::time::sleep(Duration::from_secs(45)).await;
        stop.cancel();
        let sent = handle.await.unwrap();
        assert_eq!(sent, 2);

        writer.close().await;
        let mut frames = Vec::new();
        while let Some(Ok(frame)) = body.next().await {
            frames.push(String::from_utf8(frame.to_vec()).unwrap());
        }
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.starts_with(": keep-alive ")));
    }

    #[tokio::test(start_paused = true)]
    async fn recent_activity_suppresses_keep_alive() {
        let session = Arc::new(StreamSession::new("s", "u", false, false));
        let (writer, _body) = SseWriter::channel(session.activity().clone(), 16);
        let stop = CancellationToken::new();
        let handle = spawn(session.clone(), writer.clone(), config(), stop.clone());

        tokio::time::sleep(Duration::from_secs(15)).await;
        session.activity().touch();
        tokio::time::sleep(Duration::from_secs(10)).await;
        stop.cancel();
        assert_eq!(handle.await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_itself_when_output_is_closed() {
        let session = Arc::new(StreamSession::new("s", "u", false, false));
        let (writer, _body) = SseWriter::channel(session.activity().clone(), 16);
        writer.close().await;
        let handle = spawn(session, writer, config(), CancellationToken::new());

        let sent = tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .expect("heartbeat exits on its own")
            .unwrap();
        assert_eq!(sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gap_starting_mid_interval_still_gets_keep_alive() {
        let session = Arc::new(StreamSession::new("s", "u", false, false));
        let (writer, mut body) = SseWriter::channel(session.activity().clone(), 16);
        let stop = CancellationToken::new();
        let handle = spawn(session.clone(), writer.clone(), config(), stop.clone());

        tokio::time::sleep(Duration::from_secs(19)).await;
        writer.write(Bytes::from_static(b"data: {\"n\":1}\n\n")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20_500)).await;
        stop.cancel();
        assert_eq!(handle.await.unwrap(), 1);

        writer.close().await;
        let mut frames = Vec::new();
        while let Some(Ok(frame)) = body.next().await {
            frames.push(String::from_utf8(frame.to_vec()).unwrap());
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], "data: {\"n\":1}\n\n");
        assert!(frames[1].starts_with(": keep-alive "));
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_is_held_back_inside_an_open_event() {
        let session = Arc::new(StreamSession::new("s", "u", false, false));
        let (writer, _body) = SseWriter::channel(session.activity().clone(), 16);
        writer.write(Bytes::from_static(b"data: {\"a\":")).await.unwrap();
        let stop = CancellationToken::new();
        let handle = spawn(session.clone(), writer.clone(), config(), stop.clone());

        tokio::time::sleep(Duration::from_secs(45)).await;
        stop.cancel();
        assert_eq!(handle.await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_honoured_while_client_is_not_reading() {
        let session = Arc::new(StreamSession::new("s", "u", false, false));
        let (writer, _body) = SseWriter::channel(session.activity().clone(), 1);
        announce(&writer).await.unwrap();
        let stop = CancellationToken::new();
        let handle = spawn(session.clone(), writer.clone(), config(), stop.clone());

        tokio::time::sleep(Duration::from_secs(25)).await;
        stop.cancel();
        let sent = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("heartbeat stops although its write is parked")
            .unwrap();
        assert_eq!(sent, 0);
        tokio::time::timeout(Duration::from_secs(1), writer.close())
            .await
            .expect("writer lock released");
    }
}
