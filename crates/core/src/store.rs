//! Durable session state store
//!
//! One directory per session under the configured base directory, holding
//! three artifacts: the opaque engine context blob, the session document,
//! and the executor document. The in-memory table is populated lazily from a
//! directory scan on first read and kept current by writes.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::executor::ExecutorState;
use crate::session::SessionState;
use tokenmux_common::config::ModelConfig;
use tokenmux_common::error::{Result, TokenMuxError};
use tokenmux_common::metrics::METRICS;

/// Opaque engine context blob
pub const CONTEXT_BLOB_FILE: &str = "context.bin";

/// Serialized session document
pub const SESSION_DOC_FILE: &str = "session.json";

/// Serialized executor document
pub const EXECUTOR_DOC_FILE: &str = "executor.json";

/// Filesystem-backed store of per-session checkpoints
pub struct StateStore {
    base: PathBuf,
    models: HashMap<String, ModelConfig>,
    // Lazily populated session-document table; None until the first scan
    cache: RwLock<Option<HashMap<String, SessionState>>>,
}

impl StateStore {
    pub fn new<P: Into<PathBuf>>(base: P, models: Vec<ModelConfig>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base).map_err(|e| {
            TokenMuxError::Config(format!(
                "failed to create state directory {}: {}",
                base.display(),
                e
            ))
        })?;
        let models = models.into_iter().map(|m| (m.name.clone(), m)).collect();
        Ok(StateStore {
            base,
            models,
            cache: RwLock::new(None),
        })
    }

    /// Directory holding one session's artifacts
    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.base.join(id)
    }

    /// Path the engine context blob is written to for a session
    pub fn context_blob_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join(CONTEXT_BLOB_FILE)
    }

    /// Persist the session and executor documents, creating the session
    /// directory. The engine blob is written separately by the caller.
    pub fn save(&self, session: &SessionState, executor: &ExecutorState) -> Result<()> {
        let dir = self.session_dir(&session.id);
        fs::create_dir_all(&dir)?;

        let session_json = serde_json::to_vec_pretty(session)?;
        fs::write(dir.join(SESSION_DOC_FILE), session_json)?;

        let executor_json = serde_json::to_vec_pretty(executor)?;
        fs::write(dir.join(EXECUTOR_DOC_FILE), executor_json)?;

        if let Some(cache) = self.cache.write().as_mut() {
            cache.insert(session.id.clone(), session.clone());
        }

        METRICS.store.saves_total.inc();
        debug!("Saved session state {} to {}", session.id, dir.display());
        Ok(())
    }

    /// Load one checkpoint, validating it against the current model table.
    ///
    /// A missing directory means the session was never saved (not found); a
    /// directory missing any of its three artifacts, or holding unparsable
    /// documents, is a corrupt checkpoint.
    pub fn load(&self, id: &str) -> Result<(SessionState, ExecutorState)> {
        let dir = self.session_dir(id);
        if !dir.is_dir() {
            return Err(TokenMuxError::not_found(format!(
                "no saved state for session {}",
                id
            )));
        }

        let loaded = self.load_validated(&dir, id);
        if loaded.is_err() {
            METRICS.store.load_failures_total.inc();
        }
        let (session, executor) = loaded?;

        if let Some(cache) = self.cache.write().as_mut() {
            cache.insert(session.id.clone(), session.clone());
        }

        METRICS.store.loads_total.inc();
        Ok((session, executor))
    }

    // Read and validate one checkpoint; any error here counts as a failed
    // load, unlike a never-saved session
    fn load_validated(&self, dir: &Path, id: &str) -> Result<(SessionState, ExecutorState)> {
        let (session, executor) = self.load_dir(dir)?;

        let model = self.models.get(&session.config.model).ok_or_else(|| {
            TokenMuxError::not_found(format!(
                "session {} references unconfigured model {}",
                id, session.config.model
            ))
        })?;
        if model.context_size != session.context_size {
            return Err(TokenMuxError::incompatible(format!(
                "session {} was saved with context size {} but model {} now has {}",
                id, session.context_size, model.name, model.context_size
            )));
        }

        Ok((session, executor))
    }

    fn load_dir(&self, dir: &Path) -> Result<(SessionState, ExecutorState)> {
        for artifact in [CONTEXT_BLOB_FILE, SESSION_DOC_FILE, EXECUTOR_DOC_FILE] {
            if !dir.join(artifact).is_file() {
                return Err(TokenMuxError::corrupt(format!(
                    "checkpoint {} is missing {}",
                    dir.display(),
                    artifact
                )));
            }
        }

        let session_bytes = fs::read(dir.join(SESSION_DOC_FILE))?;
        let session: SessionState = serde_json::from_slice(&session_bytes).map_err(|e| {
            TokenMuxError::corrupt(format!("session document in {}: {}", dir.display(), e))
        })?;

        let executor_bytes = fs::read(dir.join(EXECUTOR_DOC_FILE))?;
        let executor: ExecutorState = serde_json::from_slice(&executor_bytes).map_err(|e| {
            TokenMuxError::corrupt(format!("executor document in {}: {}", dir.display(), e))
        })?;

        Ok((session, executor))
    }

    /// All persisted session documents, scanning the base directory on
    /// first call. Unreadable entries are skipped with a warning rather
    /// than failing the listing.
    pub fn get_all(&self) -> Vec<SessionState> {
        {
            let cache = self.cache.read();
            if let Some(cache) = cache.as_ref() {
                return cache.values().cloned().collect();
            }
        }

        let mut table = HashMap::new();
        match fs::read_dir(&self.base) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let dir = entry.path();
                    if !dir.is_dir() {
                        continue;
                    }
                    match self.load_dir(&dir) {
                        Ok((session, _)) => {
                            table.insert(session.id.clone(), session);
                        }
                        Err(e) => {
                            warn!("Skipping unreadable checkpoint {}: {}", dir.display(), e);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Failed to scan state directory {}: {}",
                    self.base.display(),
                    e
                );
            }
        }

        info!("Loaded {} persisted session documents", table.len());
        let sessions: Vec<SessionState> = table.values().cloned().collect();
        *self.cache.write() = Some(table);
        sessions
    }

    /// Delete one session's checkpoint directory
    pub fn remove(&self, id: &str) -> Result<()> {
        let dir = self.session_dir(id);
        if !dir.is_dir() {
            return Err(TokenMuxError::not_found(format!(
                "no saved state for session {}",
                id
            )));
        }
        fs::remove_dir_all(&dir)?;

        if let Some(cache) = self.cache.write().as_mut() {
            cache.remove(id);
        }
        debug!("Removed saved state for session {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::History;
    use chrono::Utc;
    use std::collections::HashMap as StdHashMap;
    use tokenmux_common::config::{ExecutorKind, InferenceParams, SessionConfig};

    fn model(context_size: usize) -> ModelConfig {
        ModelConfig {
            name: "stub".to_string(),
            weights_path: PathBuf::from("/dev/null"),
            context_size,
            batch_size: 64,
            max_instances: -1,
            options: StdHashMap::new(),
        }
    }

    fn session_state(id: &str, context_size: usize) -> SessionState {
        SessionState {
            id: id.to_string(),
            config: SessionConfig {
                model: "stub".to_string(),
                executor: ExecutorKind::Interactive,
                initial_prompt: String::new(),
                antiprompts: Vec::new(),
                instruction_prefix: String::new(),
                instruction_suffix: String::new(),
            },
            params: InferenceParams::default(),
            history: History::default(),
            context_size,
            created_at: Utc::now(),
        }
    }

    fn executor_state() -> ExecutorState {
        ExecutorState {
            kind: ExecutorKind::Interactive,
            past_tokens: 3,
            consumed_tokens: 3,
            pending: vec![16, 17, 18],
            last_tokens: vec![16, 17, 18].into(),
            mirostat: None,
            prompt_run: false,
            instruction_prefix_tokens: Vec::new(),
            instruction_suffix_tokens: Vec::new(),
        }
    }

    fn store(dir: &Path) -> StateStore {
        StateStore::new(dir, vec![model(512)]).unwrap()
    }

    fn write_blob(store: &StateStore, id: &str) {
        fs::create_dir_all(store.session_dir(id)).unwrap();
        fs::write(store.context_blob_path(id), b"blob").unwrap();
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        write_blob(&store, "chat-1");
        let session = session_state("chat-1", 512);
        let executor = executor_state();
        store.save(&session, &executor).unwrap();

        let (loaded_session, loaded_executor) = store.load("chat-1").unwrap();
        assert_eq!(loaded_session, session);
        assert_eq!(loaded_executor, executor);
    }

    #[test]
    fn test_load_missing_session_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let err = store.load("nope").unwrap_err();
        assert!(matches!(err, TokenMuxError::NotFound(_)));
    }

    #[test]
    fn test_missing_artifact_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        write_blob(&store, "chat-1");
        store
            .save(&session_state("chat-1", 512), &executor_state())
            .unwrap();
        fs::remove_file(store.context_blob_path("chat-1")).unwrap();

        let err = store.load("chat-1").unwrap_err();
        assert!(matches!(err, TokenMuxError::Corrupt(_)));
    }

    #[test]
    fn test_garbled_document_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        write_blob(&store, "chat-1");
        store
            .save(&session_state("chat-1", 512), &executor_state())
            .unwrap();
        fs::write(
            store.session_dir("chat-1").join(SESSION_DOC_FILE),
            b"not json",
        )
        .unwrap();

        let err = store.load("chat-1").unwrap_err();
        assert!(matches!(err, TokenMuxError::Corrupt(_)));
    }

    #[test]
    fn test_unconfigured_model_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), vec![model(512)]).unwrap();

        write_blob(&store, "chat-1");
        let mut session = session_state("chat-1", 512);
        session.config.model = "gone".to_string();
        store.save(&session, &executor_state()).unwrap();

        let err = store.load("chat-1").unwrap_err();
        assert!(matches!(err, TokenMuxError::NotFound(_)));
    }

    #[test]
    fn test_context_size_mismatch_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        write_blob(&store, "chat-1");
        store
            .save(&session_state("chat-1", 4096), &executor_state())
            .unwrap();

        let err = store.load("chat-1").unwrap_err();
        assert!(matches!(err, TokenMuxError::Incompatible(_)));
    }

    #[test]
    fn test_validation_failures_counted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        write_blob(&store, "shrunk");
        store
            .save(&session_state("shrunk", 4096), &executor_state())
            .unwrap();

        write_blob(&store, "orphan");
        let mut orphan = session_state("orphan", 512);
        orphan.config.model = "gone".to_string();
        store.save(&orphan, &executor_state()).unwrap();

        // Both validation rejections land in the failure counter, not just
        // unreadable checkpoints. Other tests share the global registry, so
        // check the delta as a lower bound.
        let before = METRICS.store.load_failures_total.get();
        assert!(store.load("shrunk").is_err());
        assert!(store.load("orphan").is_err());
        assert!(METRICS.store.load_failures_total.get() >= before + 2);
    }

    #[test]
    fn test_get_all_scans_and_skips_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        write_blob(&store, "good");
        store
            .save(&session_state("good", 512), &executor_state())
            .unwrap();
        // A bare directory with no artifacts must not poison the listing
        fs::create_dir_all(dir.path().join("bad")).unwrap();

        // Fresh store so the listing comes from a scan, not the write path
        let fresh = store_from(dir.path());
        let all = fresh.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "good");
    }

    fn store_from(dir: &Path) -> StateStore {
        StateStore::new(dir, vec![model(512)]).unwrap()
    }

    #[test]
    fn test_remove_deletes_and_forgets() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        write_blob(&store, "chat-1");
        store
            .save(&session_state("chat-1", 512), &executor_state())
            .unwrap();

        store.remove("chat-1").unwrap();
        assert!(matches!(
            store.load("chat-1").unwrap_err(),
            TokenMuxError::NotFound(_)
        ));
        assert!(matches!(
            store.remove("chat-1").unwrap_err(),
            TokenMuxError::NotFound(_)
        ));
    }
}
