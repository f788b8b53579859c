//! Inference executor state machine
//!
//! Drives the generate loop for one session: batch-wise prompt feeding,
//! penalty application and single-token sampling, last-tokens bookkeeping,
//! and the rolling context-window eviction policy. The three executor kinds
//! (interactive, instruct, stateless) share this one loop and differ only in
//! input preprocessing and termination handling.
//!
//! Engine evaluation may be CPU/GPU heavy, so it runs on the blocking pool
//! rather than on the async executor's threads.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::pool::ContextHandle;
use tokenmux_common::config::{ExecutorKind, InferenceParams, MirostatMode, SessionConfig};
use tokenmux_common::error::{Result, TokenMuxError};
use tokenmux_common::metrics::METRICS;
use tokenmux_engine::{MirostatState, TokenId};

/// The generate loop's mutable working set. This is the unit persisted and
/// restored for a session to resume exactly where it left off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorState {
    /// Executor behavior variant this state belongs to
    pub kind: ExecutorKind,

    /// Tokens already evaluated by the engine
    pub past_tokens: usize,

    /// Tokens already fed from the pending prompt buffer
    pub consumed_tokens: usize,

    /// Prompt token buffer; `consumed_tokens` indexes the next unfed token
    pub pending: Vec<TokenId>,

    /// Fixed-capacity ring of recent tokens, used for repeat penalties and
    /// for re-feeding after a context-window eviction
    pub last_tokens: VecDeque<TokenId>,

    /// Adaptive sampler carry-state, if mirostat is active
    pub mirostat: Option<MirostatState>,

    /// Whether the fixed opening prompt is still being consumed
    pub prompt_run: bool,

    /// Cached instruction prefix token ids (instruct executor)
    pub instruction_prefix_tokens: Vec<TokenId>,

    /// Cached instruction suffix token ids (instruct executor)
    pub instruction_suffix_tokens: Vec<TokenId>,
}

impl ExecutorState {
    fn new(kind: ExecutorKind) -> Self {
        ExecutorState {
            kind,
            past_tokens: 0,
            consumed_tokens: 0,
            pending: Vec::new(),
            last_tokens: VecDeque::new(),
            mirostat: None,
            prompt_run: true,
            instruction_prefix_tokens: Vec::new(),
            instruction_suffix_tokens: Vec::new(),
        }
    }
}

/// What to do with a sampled token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampledToken {
    /// Token to emit to the caller, if any
    pub emit: Option<TokenId>,

    /// Whether generation stops after this token
    pub stop: bool,
}

/// Per-session generate-loop state machine bound to one execution context
pub struct InferenceExecutor {
    ctx: Arc<ContextHandle>,
    batch_size: usize,
    context_size: usize,
    eos_token: TokenId,
    newline_token: TokenId,
    state: ExecutorState,
}

impl InferenceExecutor {
    /// Create an executor for a freshly created context
    pub fn new(
        ctx: Arc<ContextHandle>,
        config: &SessionConfig,
        batch_size: usize,
    ) -> Result<Self> {
        let (context_size, eos_token, newline_token) =
            ctx.with_engine(|e| (e.context_size(), e.eos_token(), e.newline_token()))?;

        let mut state = ExecutorState::new(config.executor);
        if config.executor == ExecutorKind::Instruct {
            state.instruction_prefix_tokens =
                ctx.with_engine(|e| e.tokenize(&config.instruction_prefix, true))?;
            state.instruction_suffix_tokens =
                ctx.with_engine(|e| e.tokenize(&config.instruction_suffix, false))?;
        }

        Ok(InferenceExecutor {
            ctx,
            batch_size,
            context_size,
            eos_token,
            newline_token,
            state,
        })
    }

    pub fn kind(&self) -> ExecutorKind {
        self.state.kind
    }

    pub fn context(&self) -> &Arc<ContextHandle> {
        &self.ctx
    }

    /// Swap in a fresh execution context (stateless calls)
    pub fn replace_context(&mut self, ctx: Arc<ContextHandle>) {
        self.ctx = ctx;
    }

    /// Decode one token to text
    pub fn token_text(&self, token: TokenId) -> Result<String> {
        self.ctx.with_engine(|e| e.token_to_text(token))
    }

    /// Append user input to the pending prompt buffer, applying the
    /// kind-specific preprocessing policy.
    pub fn preprocess_input(&mut self, text: &str) -> Result<()> {
        let tokens = match self.state.kind {
            ExecutorKind::Interactive => self
                .ctx
                .with_engine(|e| e.tokenize(text, self.state.prompt_run))?,
            ExecutorKind::Instruct => {
                if self.state.prompt_run {
                    self.ctx.with_engine(|e| e.tokenize(text, true))?
                } else {
                    let mut wrapped = self.state.instruction_prefix_tokens.clone();
                    wrapped.extend(self.ctx.with_engine(|e| e.tokenize(text, false))?);
                    wrapped.extend_from_slice(&self.state.instruction_suffix_tokens);
                    wrapped
                }
            }
            ExecutorKind::Stateless => {
                self.reset_state();
                self.ctx.with_engine(|e| e.tokenize(text, true))?
            }
        };

        for &token in &tokens {
            self.push_last(token);
        }
        self.state.pending.extend(tokens);
        Ok(())
    }

    /// Whether the pending buffer holds tokens not yet fed to the engine
    pub fn has_unfed(&self) -> bool {
        self.state.consumed_tokens < self.state.pending.len()
    }

    /// Feed up to one batch of pending tokens into the engine without
    /// sampling, advancing the past and consumed counters. Applies the
    /// context-overflow eviction first when the batch would not fit.
    pub async fn feed_batch(&mut self, params: &InferenceParams) -> Result<usize> {
        let unfed = self.state.pending.len() - self.state.consumed_tokens;
        if unfed == 0 {
            return Ok(0);
        }

        let mut n = unfed.min(self.batch_size);
        if self.state.past_tokens + n > self.context_size {
            self.handle_overflow(params);
            let unfed = self.state.pending.len() - self.state.consumed_tokens;
            n = unfed.min(self.batch_size);
        }

        let start = self.state.consumed_tokens;
        let batch: Vec<TokenId> = self.state.pending[start..start + n].to_vec();
        let past = self.state.past_tokens;
        let ctx = Arc::clone(&self.ctx);

        let new_past = tokio::task::spawn_blocking(move || {
            ctx.with_engine(|engine| engine.evaluate(&batch, past))
                .and_then(|r| r)
        })
        .await
        .map_err(|e| TokenMuxError::Internal(format!("evaluate task panicked: {}", e)))??;

        self.state.past_tokens = new_past;
        self.state.consumed_tokens += n;
        Ok(n)
    }

    /// Sample exactly one token: penalties over the last-tokens window, one
    /// draw, ring and pending bookkeeping.
    pub fn generate_one(&mut self, params: &InferenceParams) -> Result<TokenId> {
        if params.mirostat != MirostatMode::Disabled && self.state.mirostat.is_none() {
            self.state.mirostat = Some(MirostatState::from_tau(params.mirostat_tau));
        }

        let window: Vec<TokenId> = {
            let len = self.state.last_tokens.len();
            let take = len.min(params.repeat_last_n);
            self.state.last_tokens.iter().skip(len - take).copied().collect()
        };

        let mut mirostat = self.state.mirostat;
        let token = self
            .ctx
            .with_engine(|engine| -> Result<TokenId> {
                let dist = engine.apply_penalties(&window, params)?;
                engine.sample(dist, params, &mut mirostat)
            })
            .and_then(|r| r)?;
        self.state.mirostat = mirostat;

        self.push_last(token);
        // The sampled token is evaluated on the next feed step
        self.state.pending.push(token);
        Ok(token)
    }

    /// Apply the kind-specific termination policy to a sampled token
    pub fn postprocess(&mut self, token: TokenId) -> SampledToken {
        if token != self.eos_token {
            return SampledToken {
                emit: Some(token),
                stop: false,
            };
        }

        match self.state.kind {
            // Mid-turn EOS becomes a newline so the transcript stays well
            // formed for the next turn
            ExecutorKind::Interactive if !self.state.prompt_run => {
                if let Some(last) = self.state.pending.last_mut() {
                    *last = self.newline_token;
                }
                if let Some(last) = self.state.last_tokens.back_mut() {
                    *last = self.newline_token;
                }
                SampledToken {
                    emit: Some(self.newline_token),
                    stop: true,
                }
            }
            _ => {
                // Do not feed EOS back through the engine
                self.state.pending.pop();
                self.state.last_tokens.pop_back();
                SampledToken {
                    emit: None,
                    stop: true,
                }
            }
        }
    }

    /// Run the fixed opening prompt once, discarding its first sampled token
    pub async fn warm_up(&mut self, initial_prompt: &str, params: &InferenceParams) -> Result<()> {
        if initial_prompt.is_empty() {
            return Ok(());
        }
        self.preprocess_input(initial_prompt)?;
        while self.has_unfed() {
            self.feed_batch(params).await?;
        }
        // Warm-up only: the sampled token is not a response
        self.generate_one(params)?;
        self.state.pending.pop();
        self.state.last_tokens.pop_back();
        self.state.prompt_run = false;
        Ok(())
    }

    /// Mark the end of a turn; the opening prompt phase is over
    pub fn finish_turn(&mut self) {
        self.state.prompt_run = false;
    }

    /// Snapshot the mutable working set
    pub fn state(&self) -> ExecutorState {
        self.state.clone()
    }

    /// Replay a previously captured working set
    pub fn restore(&mut self, state: ExecutorState) -> Result<()> {
        if state.kind != self.state.kind {
            return Err(TokenMuxError::invalid_argument(format!(
                "executor state kind {:?} does not match session kind {:?}",
                state.kind, self.state.kind
            )));
        }
        if state.past_tokens > self.context_size {
            return Err(TokenMuxError::invalid_argument(format!(
                "past token count {} exceeds context size {}",
                state.past_tokens, self.context_size
            )));
        }
        if state.consumed_tokens > state.pending.len() {
            return Err(TokenMuxError::invalid_argument(
                "consumed token count exceeds pending buffer length",
            ));
        }
        self.state = state;
        Ok(())
    }

    /// Clear the working set back to a fresh-context baseline
    pub fn reset_state(&mut self) {
        let kind = self.state.kind;
        let prefix = std::mem::take(&mut self.state.instruction_prefix_tokens);
        let suffix = std::mem::take(&mut self.state.instruction_suffix_tokens);
        self.state = ExecutorState::new(kind);
        self.state.instruction_prefix_tokens = prefix;
        self.state.instruction_suffix_tokens = suffix;
    }

    fn push_last(&mut self, token: TokenId) {
        if self.state.last_tokens.len() == self.context_size {
            self.state.last_tokens.pop_front();
        }
        self.state.last_tokens.push_back(token);
    }

    /// Rolling context-window eviction.
    ///
    /// Retains the first `tokens_keep` tokens, discards half of what
    /// remains, and re-feeds the most recent half of the stale window ahead
    /// of the unfed pending tokens, with the past counter re-anchored to
    /// `max(1, tokens_keep)`. The discard boundary is
    /// `(past - tokens_keep) / 2` — a frozen behavioral contract, required
    /// for checkpoint compatibility.
    fn handle_overflow(&mut self, params: &InferenceParams) {
        let keep = params.effective_tokens_keep();
        let n_left = self.state.past_tokens.saturating_sub(keep);
        let n_discard = n_left / 2;
        let n_refeed = n_left - n_discard;

        let ring_len = self.state.last_tokens.len();
        let take = n_refeed.min(ring_len);
        let refeed: Vec<TokenId> = self
            .state
            .last_tokens
            .iter()
            .skip(ring_len - take)
            .copied()
            .collect();

        debug!(
            "Context overflow: past={} keep={} discarding={} re-feeding={}",
            self.state.past_tokens, keep, n_discard, refeed.len()
        );

        self.state.past_tokens = keep.max(1);
        let at = self.state.consumed_tokens;
        self.state.pending.splice(at..at, refeed);
        METRICS.inference.context_evictions_total.inc();
    }
}
