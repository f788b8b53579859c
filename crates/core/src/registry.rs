//! Session registry
//!
//! The orchestration facade: owns the live-session table, the model pool,
//! the state store, the per-session single-flight guard, and the completion
//! queue. Every public operation on a session goes through here, and the
//! mutating ones (infer, save, load, remove) are mutually exclusive per
//! session id.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::InferenceExecutor;
use crate::guard::{Permit, SingleFlight};
use crate::pool::{ContextHandle, ModelPool};
use crate::queue::{CompletionQueue, ProcessFn};
use crate::session::{Session, SessionKey, SharedSession};
use crate::store::StateStore;
use tokenmux_common::config::{ExecutorKind, InferenceParams, SessionConfig};
use tokenmux_common::error::{Result, TokenMuxError};
use tokenmux_common::metrics::METRICS;

/// One element of an inference stream
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceEvent {
    /// Generation started; sent exactly once, first
    Begin,

    /// One decoded chunk of generated text
    Content(String),

    /// Generation completed normally; carries the full turn text
    End { message: String },

    /// Generation stopped by cancellation; no transcript entry was made
    Cancelled,
}

/// Stream of inference events. An `Err` item means the engine failed
/// mid-turn; the stream ends after it.
pub type InferenceStream = ReceiverStream<Result<InferenceEvent>>;

struct QueuedJob<K> {
    id: K,
    text: String,
    params: Option<InferenceParams>,
    persist: bool,
}

struct Inner<K: SessionKey> {
    pool: ModelPool,
    store: StateStore,
    guard: SingleFlight<K>,
    // Per-id creation reservation; see `create`
    creating: SingleFlight<K>,
    sessions: tokio::sync::RwLock<HashMap<K, SharedSession<K>>>,
    queue: OnceLock<CompletionQueue<QueuedJob<K>, String>>,
}

/// Registry of live sessions keyed by `K`
pub struct SessionRegistry<K: SessionKey> {
    inner: Arc<Inner<K>>,
}

impl<K: SessionKey> Clone for SessionRegistry<K> {
    fn clone(&self) -> Self {
        SessionRegistry {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: SessionKey> SessionRegistry<K> {
    pub fn new(pool: ModelPool, store: StateStore) -> Self {
        let inner = Arc::new(Inner {
            pool,
            store,
            guard: SingleFlight::new(),
            creating: SingleFlight::new(),
            sessions: tokio::sync::RwLock::new(HashMap::new()),
            queue: OnceLock::new(),
        });

        // The worker holds only a weak reference so shutdown can tear the
        // registry down while the queue drains
        let weak: Weak<Inner<K>> = Arc::downgrade(&inner);
        let process: ProcessFn<QueuedJob<K>, String> = Arc::new(move |job| {
            let weak = weak.clone();
            Box::pin(async move {
                let inner = weak
                    .upgrade()
                    .ok_or_else(|| TokenMuxError::cancelled("registry shut down"))?;
                let registry = SessionRegistry { inner };
                let text = registry
                    .infer_text_complete(&job.id, &job.text, job.params)
                    .await?;
                if job.persist {
                    registry.save_state(&job.id).await?;
                }
                Ok(text)
            })
        });
        let _ = inner.queue.set(CompletionQueue::new(process));

        SessionRegistry { inner }
    }

    /// Apply the model pool's eager load policy
    pub async fn preload(&self) -> Result<()> {
        self.inner.pool.preload().await
    }

    /// Create a session, binding it to a fresh execution context and
    /// running the opening prompt once. `params`, when given, become the
    /// session's initial inference parameters.
    pub async fn create(
        &self,
        id: K,
        config: SessionConfig,
        params: Option<InferenceParams>,
    ) -> Result<SharedSession<K>> {
        // Reserve the id for the whole creation. Two concurrent creates on
        // the same id would otherwise share one pool context, and the loser
        // would dispose it out from under the winner.
        let _reservation = self.inner.creating.try_acquire(&id).ok_or_else(|| {
            TokenMuxError::already_exists(format!("session {} already exists", id))
        })?;

        {
            let sessions = self.inner.sessions.read().await;
            if sessions.contains_key(&id) {
                return Err(TokenMuxError::already_exists(format!(
                    "session {} already exists",
                    id
                )));
            }
        }

        let id_str = id.to_string();
        let ctx = self
            .inner
            .pool
            .get_or_create_context(&config.model, &id_str)
            .await?;
        let model = self
            .inner
            .pool
            .model_config(&config.model)
            .ok_or_else(|| {
                TokenMuxError::not_found(format!("model {} is not configured", config.model))
            })?;
        let batch_size = model.batch_size;

        let session = match self
            .build_session(id.clone(), config, params, ctx.clone(), batch_size)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                let _ = self.inner.pool.remove_context(ctx.model(), &id_str).await;
                return Err(e);
            }
        };
        let session = Arc::new(session);

        let mut sessions = self.inner.sessions.write().await;
        sessions.insert(id.clone(), Arc::clone(&session));
        METRICS.sessions.active_sessions.inc();
        METRICS.sessions.sessions_created_total.inc();
        info!("Created session {} on model {}", id, session.config().model);
        Ok(session)
    }

    async fn build_session(
        &self,
        id: K,
        config: SessionConfig,
        params: Option<InferenceParams>,
        ctx: Arc<ContextHandle>,
        batch_size: usize,
    ) -> Result<Session<K>> {
        let context_size = ctx.with_engine(|e| e.context_size())?;
        let params = params.unwrap_or_default();
        let mut executor = InferenceExecutor::new(Arc::clone(&ctx), &config, batch_size)?;
        if !config.initial_prompt.is_empty() {
            executor.warm_up(&config.initial_prompt, &params).await?;
        }
        let session = Session::new(id, config, context_size, executor);
        session.set_params(params);
        Ok(session)
    }

    /// Look up a live session
    pub async fn get(&self, id: &K) -> Option<SharedSession<K>> {
        self.inner.sessions.read().await.get(id).cloned()
    }

    /// Ids of all live sessions
    pub async fn list(&self) -> Vec<K> {
        self.inner.sessions.read().await.keys().cloned().collect()
    }

    /// Persisted session documents, including sessions not currently live
    pub fn list_persisted(&self) -> Vec<crate::session::SessionState> {
        self.inner.store.get_all()
    }

    /// Persisted session ids that parse as `K`; unparsable directory names
    /// are skipped.
    pub fn list_persisted_ids(&self) -> Vec<K> {
        self.inner
            .store
            .get_all()
            .into_iter()
            .filter_map(|state| state.id.parse().ok())
            .collect()
    }

    /// Close a live session: cancel any in-flight call, drop it from the
    /// table, and release its execution context. Saved state is untouched.
    pub async fn close(&self, id: &K) -> Result<()> {
        let session = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.remove(id).ok_or_else(|| {
                TokenMuxError::not_found(format!("session {} does not exist", id))
            })?
        };
        session.cancel();
        self.inner
            .pool
            .remove_context(&session.config().model, &id.to_string())
            .await?;
        METRICS.sessions.active_sessions.dec();
        METRICS.sessions.sessions_closed_total.inc();
        info!("Closed session {}", id);
        Ok(())
    }

    /// Start one inference turn and stream its events.
    ///
    /// `params`, when given, replace the session's parameters for this and
    /// subsequent calls. `caller_cancel` is observed alongside the
    /// session's own token. Fails with `Conflict` when another mutating
    /// operation holds the session.
    pub async fn infer(
        &self,
        id: &K,
        text: &str,
        params: Option<InferenceParams>,
        caller_cancel: Option<CancellationToken>,
    ) -> Result<InferenceStream> {
        let session = self.get(id).await.ok_or_else(|| {
            TokenMuxError::not_found(format!("session {} does not exist", id))
        })?;

        let permit = self.inner.guard.try_acquire(id).ok_or_else(|| {
            METRICS.inference.requests_conflicted.inc();
            TokenMuxError::conflict(format!("session {} has an operation in flight", id))
        })?;

        if let Some(params) = params {
            session.set_params(params);
        }
        let params = session.params();

        // Session antiprompts joined with per-call ones, deduplicated
        let mut antiprompts = session.config().antiprompts.clone();
        for ap in &params.antiprompts {
            if !antiprompts.contains(ap) {
                antiprompts.push(ap.clone());
            }
        }

        let cancel = session.rearm_cancel();
        let (tx, rx) = mpsc::channel(64);
        METRICS.inference.requests_total.inc();

        let inner = Arc::clone(&self.inner);
        let input = text.to_string();
        tokio::spawn(async move {
            Inner::run_generation(
                inner,
                session,
                permit,
                input,
                params,
                antiprompts,
                cancel,
                caller_cancel,
                tx,
            )
            .await;
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Run one turn to completion and return the generated text.
    /// Cancellation surfaces as an error here.
    pub async fn infer_text_complete(
        &self,
        id: &K,
        text: &str,
        params: Option<InferenceParams>,
    ) -> Result<String> {
        use tokio_stream::StreamExt;

        let mut stream = self.infer(id, text, params, None).await?;
        let mut generated = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                InferenceEvent::Begin => {}
                InferenceEvent::Content(chunk) => generated.push_str(&chunk),
                InferenceEvent::End { message } => return Ok(message),
                InferenceEvent::Cancelled => {
                    return Err(TokenMuxError::cancelled(format!(
                        "inference on session {} was cancelled",
                        id
                    )));
                }
            }
        }
        // Stream ended without a terminal event: the worker went away
        Err(TokenMuxError::cancelled(format!(
            "inference stream for session {} ended early",
            id
        )))
    }

    /// Serialize a turn through the completion queue, optionally persisting
    /// the session afterwards.
    pub async fn infer_text_complete_queued(
        &self,
        id: &K,
        text: &str,
        params: Option<InferenceParams>,
        persist: bool,
    ) -> Result<String> {
        let queue = self
            .inner
            .queue
            .get()
            .ok_or_else(|| TokenMuxError::internal("completion queue not initialized"))?;
        queue
            .submit(QueuedJob {
                id: id.clone(),
                text: text.to_string(),
                params,
                persist,
            })
            .await
    }

    /// Cancel the session's in-flight call, if any. Cancelling an idle or
    /// unknown session is a no-op.
    pub async fn cancel(&self, id: &K) -> Result<()> {
        if let Some(session) = self.get(id).await {
            session.cancel();
        }
        Ok(())
    }

    /// Checkpoint a live session to the state store
    pub async fn save_state(&self, id: &K) -> Result<()> {
        let session = self.get(id).await.ok_or_else(|| {
            TokenMuxError::not_found(format!("session {} does not exist", id))
        })?;
        let _permit = self.inner.guard.try_acquire(id).ok_or_else(|| {
            TokenMuxError::conflict(format!("session {} has an operation in flight", id))
        })?;

        let id_str = id.to_string();
        let executor = session.executor().lock().await;

        // Documents first (this creates the directory), then the blob
        self.inner.store.save(&session.to_state(), &executor.state())?;

        let ctx = Arc::clone(executor.context());
        let path = self.inner.store.context_blob_path(&id_str);
        tokio::task::spawn_blocking(move || {
            ctx.with_engine(|e| e.save_state(&path)).and_then(|r| r)
        })
        .await
        .map_err(|e| TokenMuxError::Internal(format!("state save task panicked: {}", e)))??;

        info!("Saved state for session {}", id);
        Ok(())
    }

    /// Restore a session from the state store, replacing any live session
    /// under the same id.
    pub async fn load_state(&self, id: &K) -> Result<SharedSession<K>> {
        let _permit = self.inner.guard.try_acquire(id).ok_or_else(|| {
            TokenMuxError::conflict(format!("session {} has an operation in flight", id))
        })?;

        // A live session under this id is replaced wholesale
        match self.close_unguarded(id).await {
            Ok(()) | Err(TokenMuxError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let id_str = id.to_string();
        let (state, executor_state) = self.inner.store.load(&id_str)?;

        let model = self.inner.pool.model_config(&state.config.model).ok_or_else(|| {
            TokenMuxError::not_found(format!("model {} is not configured", state.config.model))
        })?;
        let batch_size = model.batch_size;

        let ctx = self
            .inner
            .pool
            .get_or_create_context(&state.config.model, &id_str)
            .await?;

        let result: Result<Session<K>> = async {
            let blob_ctx = Arc::clone(&ctx);
            let path = self.inner.store.context_blob_path(&id_str);
            tokio::task::spawn_blocking(move || {
                blob_ctx.with_engine(|e| e.load_state(&path)).and_then(|r| r)
            })
            .await
            .map_err(|e| TokenMuxError::Internal(format!("state load task panicked: {}", e)))??;

            let mut executor = InferenceExecutor::new(Arc::clone(&ctx), &state.config, batch_size)?;
            executor.restore(executor_state)?;
            Ok(Session::from_state(id.clone(), &state, executor))
        }
        .await;

        let session = match result {
            Ok(session) => Arc::new(session),
            Err(e) => {
                let _ = self.inner.pool.remove_context(ctx.model(), &id_str).await;
                return Err(e);
            }
        };

        let mut sessions = self.inner.sessions.write().await;
        sessions.insert(id.clone(), Arc::clone(&session));
        METRICS.sessions.active_sessions.inc();
        info!("Restored session {} from saved state", id);
        Ok(session)
    }

    /// Delete a session's saved state, closing the live session first if
    /// one exists.
    pub async fn remove_state(&self, id: &K) -> Result<()> {
        let _permit = self.inner.guard.try_acquire(id).ok_or_else(|| {
            TokenMuxError::conflict(format!("session {} has an operation in flight", id))
        })?;

        let had_live = match self.close_unguarded(id).await {
            Ok(()) => true,
            Err(TokenMuxError::NotFound(_)) => false,
            Err(e) => return Err(e),
        };

        match self.inner.store.remove(&id.to_string()) {
            Ok(()) => Ok(()),
            // A live session without a checkpoint is a legitimate target
            Err(TokenMuxError::NotFound(_)) if had_live => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drain the completion queue, close every session, and unload models
    pub async fn shutdown(&self) {
        if let Some(queue) = self.inner.queue.get() {
            queue.close().await;
        }

        let sessions: Vec<(K, SharedSession<K>)> = {
            let mut table = self.inner.sessions.write().await;
            table.drain().collect()
        };
        for (id, session) in sessions {
            session.cancel();
            let _ = self
                .inner
                .pool
                .remove_context(&session.config().model, &id.to_string())
                .await;
            METRICS.sessions.active_sessions.dec();
            METRICS.sessions.sessions_closed_total.inc();
        }

        self.inner.pool.unload_all().await;
        info!("Session registry shut down");
    }

    // close() without guard acquisition, for callers already holding it
    async fn close_unguarded(&self, id: &K) -> Result<()> {
        let session = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.remove(id).ok_or_else(|| {
                TokenMuxError::not_found(format!("session {} does not exist", id))
            })?
        };
        session.cancel();
        self.inner
            .pool
            .remove_context(&session.config().model, &id.to_string())
            .await?;
        METRICS.sessions.active_sessions.dec();
        METRICS.sessions.sessions_closed_total.inc();
        Ok(())
    }
}

impl<K: SessionKey> Inner<K> {
    /// The spawned per-turn generation task. Owns the single-flight permit
    /// for its whole lifetime; the permit drops (and the session becomes
    /// available again) before the receiver observes the terminal event at
    /// the latest.
    #[allow(clippy::too_many_arguments)]
    async fn run_generation(
        inner: Arc<Inner<K>>,
        session: SharedSession<K>,
        permit: Permit<K>,
        input: String,
        params: InferenceParams,
        antiprompts: Vec<String>,
        cancel: CancellationToken,
        caller_cancel: Option<CancellationToken>,
        tx: mpsc::Sender<Result<InferenceEvent>>,
    ) {
        let _permit = permit;
        let started = std::time::Instant::now();
        let timer = METRICS.inference.request_duration.start_timer();

        let cancelled = || {
            cancel.is_cancelled()
                || caller_cancel.as_ref().map_or(false, |t| t.is_cancelled())
        };

        let mut executor = session.executor().lock().await;

        // Stateless sessions evaluate against a fresh context every call
        if session.config().executor == ExecutorKind::Stateless {
            if let Err(e) = Self::refresh_context(&inner, &session, &mut executor).await {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }

        if tx.send(Ok(InferenceEvent::Begin)).await.is_err() {
            debug!("Inference receiver for {} dropped before start", session.id());
            return;
        }

        let outcome = Self::generate_loop(
            &mut executor,
            &input,
            &params,
            &antiprompts,
            &cancelled,
            &tx,
        )
        .await;

        drop(timer);

        // Bookkeeping first, then release the permit, then the terminal
        // event: a caller reacting to the terminal must never see a stale
        // conflict.
        match outcome {
            Ok(Some(message)) => {
                executor.finish_turn();
                // Transcript entries carry the turn timing signature
                let response = format!(
                    "{}\n[turn completed in {} ms]",
                    message.trim_end(),
                    started.elapsed().as_millis()
                );
                session.append_turn(input, response);
                drop(executor);
                drop(_permit);
                let _ = tx.send(Ok(InferenceEvent::End { message })).await;
            }
            Ok(None) => {
                drop(executor);
                drop(_permit);
                METRICS.inference.requests_cancelled.inc();
                debug!("Inference on session {} cancelled", session.id());
                let _ = tx.send(Ok(InferenceEvent::Cancelled)).await;
            }
            Err(e) => {
                drop(executor);
                drop(_permit);
                error!("Inference on session {} failed: {}", session.id(), e);
                let _ = tx.send(Err(e)).await;
            }
        }
    }

    /// Returns the full turn text, or `None` when cancelled
    async fn generate_loop(
        executor: &mut InferenceExecutor,
        input: &str,
        params: &InferenceParams,
        antiprompts: &[String],
        cancelled: &(dyn Fn() -> bool + Send + Sync),
        tx: &mpsc::Sender<Result<InferenceEvent>>,
    ) -> Result<Option<String>> {
        executor.preprocess_input(input)?;

        let mut generated = String::new();
        let mut remaining = if params.max_tokens < 0 {
            None
        } else {
            Some(params.max_tokens)
        };

        loop {
            if cancelled() {
                return Ok(None);
            }

            if executor.has_unfed() {
                executor.feed_batch(params).await?;
                continue;
            }

            if remaining == Some(0) {
                break;
            }

            let token = executor.generate_one(params)?;
            if let Some(remaining) = remaining.as_mut() {
                *remaining -= 1;
            }

            let outcome = executor.postprocess(token);
            if let Some(token) = outcome.emit {
                let chunk = executor.token_text(token)?;
                generated.push_str(&chunk);
                METRICS.inference.tokens_generated_total.inc();
                if tx.send(Ok(InferenceEvent::Content(chunk))).await.is_err() {
                    // Receiver gone; stop generating for nobody
                    warn!("Inference receiver dropped mid-turn");
                    return Ok(None);
                }
            }
            if outcome.stop {
                break;
            }
            if antiprompts.iter().any(|ap| generated.ends_with(ap)) {
                break;
            }
        }

        Ok(Some(generated))
    }

    async fn refresh_context(
        inner: &Arc<Inner<K>>,
        session: &SharedSession<K>,
        executor: &mut InferenceExecutor,
    ) -> Result<()> {
        let model = session.config().model.clone();
        let id_str = session.id().to_string();
        inner.pool.remove_context(&model, &id_str).await?;
        let ctx = inner.pool.get_or_create_context(&model, &id_str).await?;
        executor.replace_context(ctx);
        Ok(())
    }
}
