//! TokenMux engine boundary
//!
//! This crate defines the interface between the orchestration core and the
//! token-level inference engine. The engine is an external collaborator:
//! tokenization, matrix evaluation, penalty math, and context serialization
//! bytes all live behind these traits and are never interpreted by the core.

pub mod stub;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use tokenmux_common::config::{InferenceParams, ModelConfig};
use tokenmux_common::error::Result;

/// Engine token identifier
pub type TokenId = i32;

/// A probability distribution over candidate tokens, produced by the engine
/// after penalties have been applied. The core passes it straight back into
/// [`EngineContext::sample`] without inspecting it.
#[derive(Debug, Clone)]
pub struct Distribution {
    /// Candidate token ids with their adjusted weights
    pub candidates: Vec<(TokenId, f32)>,
}

/// Sampler carry-state for adaptive (mirostat) samplers. Threaded through
/// successive sampling calls and persisted with the executor state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MirostatState {
    /// The adaptive sampler's running mu scalar
    pub mu: f32,
}

impl MirostatState {
    /// Initial state derived from the configured target entropy
    pub fn from_tau(tau: f32) -> Self {
        MirostatState { mu: 2.0 * tau }
    }
}

/// Loads model weights for configured models
pub trait ModelBackend: Send + Sync {
    /// Load the weights for one model. Idempotency and instance caching are
    /// the pool's concern; each call here performs a fresh load.
    fn load_model(&self, config: &ModelConfig) -> Result<Arc<dyn LoadedModel>>;
}

/// Loaded weights for one model, parent of zero or more execution contexts
pub trait LoadedModel: Send + Sync {
    /// Create a new execution context sized by the model's context window
    fn create_context(&self, config: &ModelConfig) -> Result<Box<dyn EngineContext>>;
}

/// One engine execution context: token history plus engine-side cache,
/// bound to a fixed token budget. Exclusively owned by one session.
pub trait EngineContext: Send {
    /// Tokenize text, optionally prepending the engine's leading marker
    fn tokenize(&self, text: &str, add_leading: bool) -> Vec<TokenId>;

    /// Evaluate a batch of tokens at the given past-token offset, returning
    /// the new past-token count. May be CPU/GPU heavy and block.
    fn evaluate(&mut self, tokens: &[TokenId], past: usize) -> Result<usize>;

    /// Apply repeat/frequency/presence penalties over the recent-token
    /// window and return the resulting candidate distribution
    fn apply_penalties(
        &self,
        last_tokens: &[TokenId],
        params: &InferenceParams,
    ) -> Result<Distribution>;

    /// Sample exactly one token from the distribution, updating the
    /// mirostat carry-state in place when one is supplied
    fn sample(
        &mut self,
        dist: Distribution,
        params: &InferenceParams,
        mirostat: &mut Option<MirostatState>,
    ) -> Result<TokenId>;

    /// Decode a single token to text
    fn token_to_text(&self, token: TokenId) -> String;

    /// Serialize the engine-side context state to an opaque blob file
    fn save_state(&self, path: &Path) -> Result<()>;

    /// Restore the engine-side context state from an opaque blob file
    fn load_state(&mut self, path: &Path) -> Result<()>;

    /// The fixed token budget of this context
    fn context_size(&self) -> usize;

    /// The engine's end-of-sequence token id
    fn eos_token(&self) -> TokenId;

    /// The engine's newline token id
    fn newline_token(&self) -> TokenId;
}
