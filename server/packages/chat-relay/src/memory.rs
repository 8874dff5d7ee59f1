//! Process-local stores. The binary uses them when no external session or
//! configuration service is wired in; tests use their failure switches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use chat_relay_error::RelayError;
use chrono::Utc;
use futures::future::BoxFuture;

use crate::store::{ConfigStore, SessionRecord, SessionStore, SessionUpdate, UserConfig};

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: StdMutex<HashMap<(String, String), SessionRecord>>,
    fail_updates: bool,
    fail_reads: bool,
    update_calls: AtomicUsize,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_updates(mut self) -> Self {
        self.fail_updates = true;
        self
    }

    pub fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    pub fn insert(&self, user_id: &str, title: &str) -> SessionRecord {
        let record = SessionRecord {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            message_count: 0,
            created_at: Utc::now(),
            last_message_at: None,
            last_model_id: None,
            last_enabled_tools: Vec::new(),
        };
        lock(&self.sessions).insert(
            (user_id.to_string(), record.session_id.clone()),
            record.clone(),
        );
        record
    }

    pub fn record(&self, user_id: &str, session_id: &str) -> Option<SessionRecord> {
        lock(&self.sessions)
            .get(&(user_id.to_string(), session_id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> BoxFuture<'_, Result<Option<SessionRecord>, RelayError>> {
        let result = if self.fail_reads {
            Err(RelayError::SessionUnavailable {
                session_id: Some(session_id.to_string()),
                message: "session store offline".to_string(),
            })
        } else {
            Ok(self.record(user_id, session_id))
        };
        Box::pin(async move { result })
    }

    fn create(&self, user_id: &str, title: &str) -> BoxFuture<'_, Result<SessionRecord, RelayError>> {
        let result = if self.fail_reads {
            Err(RelayError::SessionUnavailable {
                session_id: None,
                message: "session store offline".to_string(),
            })
        } else {
            Ok(self.insert(user_id, title))
        };
        Box::pin(async move { result })
    }

    fn update(
        &self,
        user_id: &str,
        session_id: &str,
        update: SessionUpdate,
    ) -> BoxFuture<'_, Result<(), RelayError>> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail_updates {
            Err(RelayError::SessionUnavailable {
                session_id: Some(session_id.to_string()),
                message: "session store rejected update".to_string(),
            })
        } else {
            let mut sessions = lock(&self.sessions);
            match sessions.get_mut(&(user_id.to_string(), session_id.to_string())) {
                Some(record) => {
                    record.message_count += update.message_count_increment;
                    record.last_message_at = Some(update.last_message_at);
                    record.last_model_id = Some(update.model_id);
                    record.last_enabled_tools = update.enabled_tools;
                    Ok(())
                }
                None => Err(RelayError::SessionUnavailable {
                    session_id: Some(session_id.to_string()),
                    message: "unknown session".to_string(),
                }),
            }
        };
        Box::pin(async move { result })
    }
}

#[derive(Debug, Default)]
pub struct StaticConfigStore {
    configs: HashMap<String, UserConfig>,
    fail: bool,
}

impl StaticConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: &str, config: UserConfig) -> Self {
        self.configs.insert(user_id.to_string(), config);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl ConfigStore for StaticConfigStore {
    fn user_config(&self, user_id: &str) -> BoxFuture<'_, Result<UserConfig, RelayError>> {
        let result = if self.fail {
            Err(RelayError::ConfigUnavailable {
                message: format!("no configuration service for {user_id}"),
            })
        } else {
            Ok(self.configs.get(user_id).cloned().unwrap_or_default())
        };
        Box::pin(async move { result })
    }
}
