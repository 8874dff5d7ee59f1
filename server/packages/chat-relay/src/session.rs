use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::cancel::CancellationDomain;

/// Time of the last successful write to the client, shared between the
/// writer (which bumps it) and the heartbeat (which reads it).
#[derive(Debug, Clone)]
pub struct ActivityClock {
    last: Arc<StdMutex<Instant>>,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last: Arc::new(StdMutex::new(Instant::now())),
        }
    }

    pub fn touch(&self) {
        let mut guard = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Instant::now();
    }

    pub fn last(&self) -> Instant {
        *self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last())
    }
}

/// Request-scoped context for one relayed turn. Every relay task receives it
/// explicitly; nothing else about the turn is shared between them.
#[derive(Debug)]
pub struct StreamSession {
    session_id: String,
    user_id: String,
    created: bool,
    side_channel_armed: bool,
    backend_started: AtomicBool,
    activity: ActivityClock,
    pub cancel: CancellationDomain,
}

impl StreamSession {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        created: bool,
        side_channel_armed: bool,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            created,
            side_channel_armed,
            backend_started: AtomicBool::new(false),
            activity: ActivityClock::new(),
            cancel: CancellationDomain::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Whether the session was created for this request.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn side_channel_armed(&self) -> bool {
        self.side_channel_armed
    }

    pub fn mark_backend_started(&self) {
        self.backend_started.store(true, Ordering::SeqCst);
    }

    pub fn backend_started(&self) -> bool {
        self.backend_started.load(Ordering::SeqCst)
    }

    pub fn activity(&self) -> &ActivityClock {
        &self.activity
    }

    pub fn last_activity_at(&self) -> Instant {
        self.activity.last()
    }
}
