use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::session::StreamSession;
use crate::store::{SessionStore, SessionUpdate};

/// Writes end-of-turn bookkeeping for one request. The first call to
/// [`SessionFinalizer::finalize`] does the work; later calls are no-ops, so a
/// repeated teardown never double-counts the turn.
pub struct SessionFinalizer {
    store: Arc<dyn SessionStore>,
    done: AtomicBool,
}

impl SessionFinalizer {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            done: AtomicBool::new(false),
        }
    }

    /// Returns `true` if this call performed the update attempt. Store errors
    /// are logged and otherwise ignored.
    pub async fn finalize(
        &self,
        session: &StreamSession,
        model_id: &str,
        enabled_tools: &[String],
    ) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                session_id = %session.session_id(),
                "finalizer: already ran for this turn"
            );
            return false;
        }

        let update = SessionUpdate {
            last_message_at: Utc::now(),
            message_count_increment: 1,
            model_id: model_id.to_string(),
            enabled_tools: enabled_tools.to_vec(),
        };

        match self
            .store
            .update(session.user_id(), session.session_id(), update)
            .await
        {
            Ok(()) => tracing::debug!(
                session_id = %session.session_id(),
                "finalizer: session updated"
            ),
            Err(err) => tracing::warn!(
                session_id = %session.session_id(),
                user_id = %session.user_id(),
                error = %err,
                "finalizer: session update failed"
            ),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemorySessionStore;

    #[tokio::test]
    async fn second_finalize_does_not_double_count() {
        let store = Arc::new(InMemorySessionStore::new());
        let record = store.insert("u-1", "first");
        let session = StreamSession::new(record.session_id.clone(), "u-1", false, false);
        let finalizer = SessionFinalizer::new(store.clone());

        assert!(finalizer.finalize(&session, "model-a", &[]).await);
        assert!(!finalizer.finalize(&session, "model-a", &[]).await);

        let stored = store.record("u-1", &record.session_id).unwrap();
        assert_eq!(stored.message_count, 1);
        assert_eq!(stored.last_model_id.as_deref(), Some("model-a"));
        assert!(stored.last_message_at.is_some());
        assert_eq!(store.update_calls(), 1);
    }

    #[tokio::test]
    async fn store_failure_is_swallowed() {
        let store = Arc::new(InMemorySessionStore::new().failing_updates());
        let session = StreamSession::new("missing", "u-1", false, false);
        let finalizer = SessionFinalizer::new(store.clone());

        assert!(finalizer.finalize(&session, "model-a", &["browser".to_string()]).await);
        assert_eq!(store.update_calls(), 1);
    }
}
