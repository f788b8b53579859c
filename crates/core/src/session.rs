//! Session types
//!
//! A session is a named, stateful conversation bound to one model context.
//! This module defines the session key abstraction, the conversation
//! transcript, the live in-memory session object, and its serializable
//! persisted form.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::executor::InferenceExecutor;
use tokenmux_common::config::{InferenceParams, SessionConfig};

/// Key type a registry is indexed by. Any cloneable, hashable, ordered,
/// string-convertible type qualifies; the string form names the on-disk
/// checkpoint directory.
pub trait SessionKey:
    Clone + Eq + Hash + Ord + Display + FromStr + Debug + Send + Sync + 'static
{
}

impl<K> SessionKey for K where
    K: Clone + Eq + Hash + Ord + Display + FromStr + Debug + Send + Sync + 'static
{
}

/// Who produced a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    /// Caller input
    Prompt,

    /// Generated output
    Response,
}

/// One transcript entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Conversation transcript, appended to only after a turn fully completes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub entries: Vec<HistoryEntry>,
}

impl History {
    pub fn push(&mut self, role: HistoryRole, text: impl Into<String>) {
        self.entries.push(HistoryEntry {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        });
    }
}

/// A live session: immutable creation config plus the mutable pieces each
/// behind its own lock. The executor lock is async and held across engine
/// calls; the params, history, and cancel locks are short-lived.
pub struct Session<K> {
    id: K,
    config: SessionConfig,
    context_size: usize,
    created_at: DateTime<Utc>,
    params: Mutex<InferenceParams>,
    history: Mutex<History>,
    cancel: Mutex<CancellationToken>,
    executor: tokio::sync::Mutex<InferenceExecutor>,
}

impl<K: SessionKey> Session<K> {
    pub fn new(
        id: K,
        config: SessionConfig,
        context_size: usize,
        executor: InferenceExecutor,
    ) -> Self {
        Session {
            id,
            config,
            context_size,
            created_at: Utc::now(),
            params: Mutex::new(InferenceParams::default()),
            history: Mutex::new(History::default()),
            cancel: Mutex::new(CancellationToken::new()),
            executor: tokio::sync::Mutex::new(executor),
        }
    }

    /// Rebuild a live session from its persisted document
    pub fn from_state(id: K, state: &SessionState, executor: InferenceExecutor) -> Self {
        Session {
            id,
            config: state.config.clone(),
            context_size: state.context_size,
            created_at: state.created_at,
            params: Mutex::new(state.params.clone()),
            history: Mutex::new(state.history.clone()),
            cancel: Mutex::new(CancellationToken::new()),
            executor: tokio::sync::Mutex::new(executor),
        }
    }

    pub fn id(&self) -> &K {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn params(&self) -> InferenceParams {
        self.params.lock().clone()
    }

    pub fn set_params(&self, params: InferenceParams) {
        *self.params.lock() = params;
    }

    pub fn history(&self) -> History {
        self.history.lock().clone()
    }

    pub fn set_history(&self, history: History) {
        *self.history.lock() = history;
    }

    pub fn append_turn(&self, prompt: impl Into<String>, response: impl Into<String>) {
        let mut history = self.history.lock();
        history.push(HistoryRole::Prompt, prompt);
        history.push(HistoryRole::Response, response);
    }

    /// The cancellation token covering the current (or next) call
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Trip the current token. Idempotent; cancelling an idle session only
    /// affects a token nobody is watching.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    /// Install a fresh token for the next call and return it. A previously
    /// tripped token must never leak into a new call.
    pub fn rearm_cancel(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        token
    }

    pub fn executor(&self) -> &tokio::sync::Mutex<InferenceExecutor> {
        &self.executor
    }

    /// Build the persisted document for this session
    pub fn to_state(&self) -> SessionState {
        SessionState {
            id: self.id.to_string(),
            config: self.config.clone(),
            params: self.params(),
            history: self.history(),
            context_size: self.context_size,
            created_at: self.created_at,
        }
    }
}

impl<K: SessionKey> Debug for Session<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("model", &self.config.model)
            .field("executor", &self.config.executor)
            .field("context_size", &self.context_size)
            .finish()
    }
}

/// Serialized session document, one per checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// String form of the session key
    pub id: String,

    /// Creation-time configuration
    pub config: SessionConfig,

    /// Inference parameters in effect at checkpoint time
    pub params: InferenceParams,

    /// Conversation transcript
    pub history: History,

    /// Context window size the checkpoint was taken under. Restore fails
    /// when the configured model no longer matches.
    pub context_size: usize,

    /// Session creation time
    pub created_at: DateTime<Utc>,
}

/// Arc alias used throughout the registry
pub type SharedSession<K> = Arc<Session<K>>;

#[cfg(test)]
mod tests {
    use super::*;
    use tokenmux_common::config::ExecutorKind;

    fn config() -> SessionConfig {
        SessionConfig {
            model: "stub".to_string(),
            executor: ExecutorKind::Interactive,
            initial_prompt: String::new(),
            antiprompts: vec!["User:".to_string()],
            instruction_prefix: String::new(),
            instruction_suffix: String::new(),
        }
    }

    #[test]
    fn test_history_preserves_order() {
        let mut history = History::default();
        history.push(HistoryRole::Prompt, "hi");
        history.push(HistoryRole::Response, "hello");
        history.push(HistoryRole::Prompt, "bye");

        let roles: Vec<HistoryRole> = history.entries.iter().map(|e| e.role).collect();
        assert_eq!(
            roles,
            vec![HistoryRole::Prompt, HistoryRole::Response, HistoryRole::Prompt]
        );
    }

    #[test]
    fn test_session_state_serializes() {
        let state = SessionState {
            id: "chat-1".to_string(),
            config: config(),
            params: InferenceParams::default(),
            history: History::default(),
            context_size: 2048,
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&state).unwrap();
        let back: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_rearm_cancel_replaces_tripped_token() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(token.is_cancelled());

        let cancel = Mutex::new(token);
        let fresh = CancellationToken::new();
        *cancel.lock() = fresh.clone();
        assert!(!cancel.lock().is_cancelled());
    }
}
