//! Session and per-user configuration collaborators. Storage itself lives
//! elsewhere; the relay only needs these get/put contracts.

use std::collections::BTreeMap;

use chat_relay_error::RelayError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub title: String,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_model_id: Option<String>,
    pub last_enabled_tools: Vec<String>,
}

/// End-of-turn bookkeeping written by the finalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    pub last_message_at: DateTime<Utc>,
    pub message_count_increment: u64,
    pub model_id: String,
    pub enabled_tools: Vec<String>,
}

pub trait SessionStore: Send + Sync + 'static {
    fn get(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> BoxFuture<'_, Result<Option<SessionRecord>, RelayError>>;

    fn create(&self, user_id: &str, title: &str) -> BoxFuture<'_, Result<SessionRecord, RelayError>>;

    fn update(
        &self,
        user_id: &str,
        session_id: &str,
        update: SessionUpdate,
    ) -> BoxFuture<'_, Result<(), RelayError>>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub default_model_id: Option<String>,
    #[serde(default)]
    pub enabled_tools: Vec<String>,
    #[serde(default)]
    pub api_keys: BTreeMap<String, String>,
    #[serde(default)]
    pub caching_enabled: Option<bool>,
}

pub trait ConfigStore: Send + Sync + 'static {
    fn user_config(&self, user_id: &str) -> BoxFuture<'_, Result<UserConfig, RelayError>>;
}

/// Title for a session created from its first message.
pub fn session_title(message: &str) -> String {
    const MAX_CHARS: usize = 50;
    let line = message.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= MAX_CHARS {
        return line.to_string();
    }
    let mut title: String = line.chars().take(MAX_CHARS).collect();
    title.push('…');
    title
}
