//! Deterministic stub engine
//!
//! A word-level reference backend used by tests and the `tokenmux` binary.
//! Tokenization interns whitespace-separated words into a per-model
//! vocabulary; generation replays a canned reply token by token and then
//! emits end-of-sequence. The context blob is the serialized token history,
//! which makes checkpoint round-trips exactly reproducible.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::{Distribution, EngineContext, LoadedModel, MirostatState, ModelBackend, TokenId};
use tokenmux_common::config::{InferenceParams, ModelConfig};
use tokenmux_common::error::{Result, TokenMuxError};

/// End-of-sequence token id
pub const EOS_TOKEN: TokenId = 2;

/// Newline token id
pub const NEWLINE_TOKEN: TokenId = 3;

/// First id handed out to interned words
const FIRST_WORD_TOKEN: TokenId = 16;

/// Per-model vocabulary shared by all contexts of one loaded model, so that
/// token ids stay stable across checkpoint save/restore.
#[derive(Debug, Default)]
struct Vocab {
    word_to_id: HashMap<String, TokenId>,
    id_to_word: HashMap<TokenId, String>,
}

impl Vocab {
    fn intern(&mut self, word: &str) -> TokenId {
        if let Some(&id) = self.word_to_id.get(word) {
            return id;
        }
        let id = FIRST_WORD_TOKEN + self.word_to_id.len() as TokenId;
        self.word_to_id.insert(word.to_string(), id);
        self.id_to_word.insert(id, word.to_string());
        id
    }

    fn text(&self, id: TokenId) -> String {
        match id {
            EOS_TOKEN => String::new(),
            NEWLINE_TOKEN => "\n".to_string(),
            // Leading-space convention, so decoded words concatenate cleanly
            _ => self
                .id_to_word
                .get(&id)
                .map(|w| format!(" {}", w))
                .unwrap_or_default(),
        }
    }
}

/// Stub model backend
pub struct StubBackend {
    /// Canned reply used when a model's options carry none
    default_reply: String,

    /// Per-model reply overrides set by tests
    replies: Mutex<HashMap<String, String>>,
}

impl StubBackend {
    pub fn new() -> Self {
        StubBackend {
            default_reply: "Hello there!".to_string(),
            replies: Mutex::new(HashMap::new()),
        }
    }

    /// Override the canned reply for one model name
    pub fn set_reply(&self, model: impl Into<String>, reply: impl Into<String>) {
        self.replies.lock().insert(model.into(), reply.into());
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBackend for StubBackend {
    fn load_model(&self, config: &ModelConfig) -> Result<Arc<dyn LoadedModel>> {
        // Reply precedence: test override, then model options, then default
        let reply = self
            .replies
            .lock()
            .get(&config.name)
            .cloned()
            .or_else(|| {
                config
                    .options
                    .get("reply")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            })
            .unwrap_or_else(|| self.default_reply.clone());

        debug!("Loading stub model {} (reply: {:?})", config.name, reply);

        Ok(Arc::new(StubModel {
            vocab: Arc::new(Mutex::new(Vocab::default())),
            reply,
        }))
    }
}

/// Loaded stub model: a shared vocabulary plus the scripted reply
pub struct StubModel {
    vocab: Arc<Mutex<Vocab>>,
    reply: String,
}

impl LoadedModel for StubModel {
    fn create_context(&self, config: &ModelConfig) -> Result<Box<dyn EngineContext>> {
        let script = {
            let mut vocab = self.vocab.lock();
            self.reply
                .split_whitespace()
                .map(|w| vocab.intern(w))
                .collect::<Vec<_>>()
        };

        Ok(Box::new(StubContext {
            vocab: Arc::clone(&self.vocab),
            script,
            context_size: config.context_size,
            history: Vec::new(),
            script_pos: 0,
            last_sampled: None,
        }))
    }
}

/// Serialized form of a stub context, written as the opaque blob
#[derive(Serialize, Deserialize)]
struct StubContextBlob {
    history: Vec<TokenId>,
    script_pos: usize,
    last_sampled: Option<TokenId>,
}

/// Stub execution context
pub struct StubContext {
    vocab: Arc<Mutex<Vocab>>,
    script: Vec<TokenId>,
    context_size: usize,
    history: Vec<TokenId>,
    script_pos: usize,
    last_sampled: Option<TokenId>,
}

impl StubContext {
    fn next_scripted(&self) -> TokenId {
        if self.script_pos < self.script.len() {
            self.script[self.script_pos]
        } else {
            EOS_TOKEN
        }
    }
}

impl EngineContext for StubContext {
    fn tokenize(&self, text: &str, _add_leading: bool) -> Vec<TokenId> {
        let mut vocab = self.vocab.lock();
        text.split_whitespace().map(|w| vocab.intern(w)).collect()
    }

    fn evaluate(&mut self, tokens: &[TokenId], past: usize) -> Result<usize> {
        if past + tokens.len() > self.context_size {
            return Err(TokenMuxError::engine(format!(
                "context window exceeded: {} + {} > {}",
                past,
                tokens.len(),
                self.context_size
            )));
        }
        self.history.truncate(past);
        self.history.extend_from_slice(tokens);
        // Fresh prompt tokens restart the scripted reply; re-evaluating the
        // token we just sampled (the generate loop's feedback step) does not
        if tokens != [self.last_sampled.unwrap_or(EOS_TOKEN)] {
            self.script_pos = 0;
        }
        Ok(past + tokens.len())
    }

    fn apply_penalties(
        &self,
        _last_tokens: &[TokenId],
        _params: &InferenceParams,
    ) -> Result<Distribution> {
        Ok(Distribution {
            candidates: vec![(self.next_scripted(), 1.0)],
        })
    }

    fn sample(
        &mut self,
        dist: Distribution,
        params: &InferenceParams,
        mirostat: &mut Option<MirostatState>,
    ) -> Result<TokenId> {
        let (token, _) = dist
            .candidates
            .first()
            .copied()
            .ok_or_else(|| TokenMuxError::engine("empty candidate distribution"))?;

        if let Some(state) = mirostat {
            // Deterministic mu drift stands in for the adaptive update
            state.mu -= params.mirostat_eta;
        }

        if self.script_pos < self.script.len() {
            self.script_pos += 1;
        }
        self.last_sampled = Some(token);
        Ok(token)
    }

    fn token_to_text(&self, token: TokenId) -> String {
        self.vocab.lock().text(token)
    }

    fn save_state(&self, path: &Path) -> Result<()> {
        let blob = StubContextBlob {
            history: self.history.clone(),
            script_pos: self.script_pos,
            last_sampled: self.last_sampled,
        };
        let bytes = serde_json::to_vec(&blob)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn load_state(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let blob: StubContextBlob = serde_json::from_slice(&bytes)
            .map_err(|e| TokenMuxError::corrupt(format!("stub context blob: {}", e)))?;
        self.history = blob.history;
        self.script_pos = blob.script_pos;
        self.last_sampled = blob.last_sampled;
        Ok(())
    }

    fn context_size(&self) -> usize {
        self.context_size
    }

    fn eos_token(&self) -> TokenId {
        EOS_TOKEN
    }

    fn newline_token(&self) -> TokenId {
        NEWLINE_TOKEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::path::PathBuf;

    fn model_config() -> ModelConfig {
        ModelConfig {
            name: "stub-7b".to_string(),
            weights_path: PathBuf::from("/dev/null"),
            context_size: 64,
            batch_size: 8,
            max_instances: -1,
            options: StdHashMap::new(),
        }
    }

    fn new_context() -> Box<dyn EngineContext> {
        let backend = StubBackend::new();
        backend.set_reply("stub-7b", "How can I help?");
        let model = backend.load_model(&model_config()).unwrap();
        model.create_context(&model_config()).unwrap()
    }

    #[test]
    fn test_tokenize_is_stable() {
        let ctx = new_context();
        let a = ctx.tokenize("hello world", true);
        let b = ctx.tokenize("hello world", true);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_scripted_generation_ends_with_eos() {
        let mut ctx = new_context();
        let prompt = ctx.tokenize("User: hi", true);
        let past = ctx.evaluate(&prompt, 0).unwrap();
        assert_eq!(past, prompt.len());

        let params = InferenceParams::default();
        let mut mirostat = None;
        let mut text = String::new();
        loop {
            let dist = ctx.apply_penalties(&[], &params).unwrap();
            let token = ctx.sample(dist, &params, &mut mirostat).unwrap();
            if token == ctx.eos_token() {
                break;
            }
            text.push_str(&ctx.token_to_text(token));
        }
        assert_eq!(text.trim(), "How can I help?");
    }

    #[test]
    fn test_evaluate_rejects_window_overflow() {
        let mut ctx = new_context();
        let tokens: Vec<TokenId> = (0..65).map(|_| NEWLINE_TOKEN).collect();
        assert!(ctx.evaluate(&tokens, 0).is_err());
    }

    #[test]
    fn test_blob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.bin");

        let mut ctx = new_context();
        let prompt = ctx.tokenize("save me", true);
        ctx.evaluate(&prompt, 0).unwrap();
        ctx.save_state(&path).unwrap();

        let mut restored = new_context();
        restored.load_state(&path).unwrap();
        // Restored context decodes the same history tokens
        assert_eq!(
            restored.token_to_text(prompt[0]),
            ctx.token_to_text(prompt[0])
        );
    }

    #[test]
    fn test_mirostat_state_updates() {
        let mut ctx = new_context();
        let params = InferenceParams {
            mirostat_eta: 0.1,
            ..Default::default()
        };
        let mut mirostat = Some(MirostatState::from_tau(5.0));
        let dist = ctx.apply_penalties(&[], &params).unwrap();
        ctx.sample(dist, &params, &mut mirostat).unwrap();
        assert!(mirostat.unwrap().mu < 10.0);
    }
}
