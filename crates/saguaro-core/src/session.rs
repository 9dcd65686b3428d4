use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::agent::memory::MemoryStore;
use crate::agent::runner::Agent;

/// Shared state handed to every tool call of a session.
///
/// Fields are typed; [`SessionState::get`] keeps by-key lookup for tools that
/// need to probe generically.
#[derive(Clone, Default)]
pub struct SessionState {
    memory: Option<Arc<MemoryStore>>,
    neocortex: Option<Arc<Agent>>,
}

/// A borrowed value from [`SessionState`].
pub enum StateEntry<'a> {
    Memory(&'a Arc<MemoryStore>),
    Agent(&'a Arc<Agent>),
}

impl SessionState {
    pub const MEMORY: &'static str = "memory";
    pub const NEOCORTEX: &'static str = "neocortex";

    pub fn new(memory: Arc<MemoryStore>, neocortex: Arc<Agent>) -> Self {
        Self {
            memory: Some(memory),
            neocortex: Some(neocortex),
        }
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_neocortex(mut self, neocortex: Arc<Agent>) -> Self {
        self.neocortex = Some(neocortex);
        self
    }

    pub fn memory(&self) -> Option<&Arc<MemoryStore>> {
        self.memory.as_ref()
    }

    pub fn neocortex(&self) -> Option<&Arc<Agent>> {
        self.neocortex.as_ref()
    }

    pub fn get(&self, key: &str) -> Option<StateEntry<'_>> {
        match key {
            Self::MEMORY => self.memory.as_ref().map(StateEntry::Memory),
            Self::NEOCORTEX => self.neocortex.as_ref().map(StateEntry::Agent),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Keys currently present, in a fixed order.
    pub fn keys(&self) -> Vec<&'static str> {
        [Self::MEMORY, Self::NEOCORTEX]
            .into_iter()
            .filter(|k| self.contains_key(k))
            .collect()
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("keys", &self.keys())
            .finish()
    }
}

/// A single message in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_used: Option<Vec<String>>,
}

impl Message {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: Some(Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()),
            tools_used: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools_used = if tools.is_empty() { None } else { Some(tools) };
        self
    }
}

/// Identifies a session within the service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(app_name: &str, user_id: &str, session_id: &str) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.app_name, self.user_id, self.session_id)
    }
}

/// A conversation session: history plus the shared state its tools observe.
#[derive(Clone)]
pub struct Session {
    pub key: SessionKey,
    pub state: Arc<SessionState>,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(key: SessionKey, state: Arc<SessionState>) -> Self {
        let now = Utc::now();
        Self {
            key,
            state,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Get the most recent messages for LLM history.
    pub fn get_history(&self, max_messages: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(max_messages);
        &self.messages[start..]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session '{0}' already exists")]
    AlreadyExists(SessionKey),
    #[error("session '{0}' not found")]
    NotFound(SessionKey),
}

/// Storage for sessions. Runners read history from it and commit each
/// completed turn back.
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn create_session(
        &self,
        key: SessionKey,
        state: Arc<SessionState>,
    ) -> Result<(), SessionError>;

    async fn get_session(&self, key: &SessionKey) -> Option<Session>;

    async fn list_sessions(&self) -> Vec<SessionKey>;

    async fn append_messages(
        &self,
        key: &SessionKey,
        messages: Vec<Message>,
    ) -> Result<(), SessionError>;
}

/// Sessions held in process memory for the lifetime of the service.
#[derive(Default)]
pub struct InMemorySessionService {
    sessions: Mutex<HashMap<SessionKey, Session>>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create_session(
        &self,
        key: SessionKey,
        state: Arc<SessionState>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&key) {
            return Err(SessionError::AlreadyExists(key));
        }
        sessions.insert(key.clone(), Session::new(key, state));
        Ok(())
    }

    async fn get_session(&self, key: &SessionKey) -> Option<Session> {
        self.sessions.lock().await.get(key).cloned()
    }

    async fn list_sessions(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self.sessions.lock().await.keys().cloned().collect();
        keys.sort_by_key(|k| k.to_string());
        keys
    }

    async fn append_messages(
        &self,
        key: &SessionKey,
        messages: Vec<Message>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| SessionError::NotFound(key.clone()))?;
        session.messages.extend(messages);
        session.updated_at = Utc::now();
        Ok(())
    }
}
