//! Model and context pooling
//!
//! Maps model name to loaded weights and (model, context id) to execution
//! contexts, subject to the configured load policy. The model-level lock and
//! the per-model context locks are separate, so context churn on one model
//! never blocks operations on another.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use tokenmux_common::config::{LoadPolicy, ModelConfig};
use tokenmux_common::error::{Result, TokenMuxError};
use tokenmux_common::metrics::METRICS;
use tokenmux_engine::{EngineContext, LoadedModel, ModelBackend};

/// Identifier of one execution context within a model instance
pub type ContextId = String;

/// One engine execution context plus its disposal flag.
///
/// The handle outlives pool eviction: a session may still hold the `Arc`
/// after its model was unloaded, in which case every engine access fails
/// instead of touching stale state.
pub struct ContextHandle {
    model: String,
    id: ContextId,
    engine: Mutex<Box<dyn EngineContext>>,
    disposed: AtomicBool,
}

impl ContextHandle {
    fn new(model: String, id: ContextId, engine: Box<dyn EngineContext>) -> Self {
        ContextHandle {
            model,
            id,
            engine: Mutex::new(engine),
            disposed: AtomicBool::new(false),
        }
    }

    /// Run a closure against the engine context, failing if disposed
    pub fn with_engine<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn EngineContext) -> R,
    {
        if self.is_disposed() {
            return Err(TokenMuxError::not_found(format!(
                "context {} of model {} is disposed",
                self.id, self.model
            )));
        }
        let mut engine = self.engine.lock();
        Ok(f(engine.as_mut()))
    }

    /// Mark the context disposed; further engine access fails
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

// The boxed engine context has no Debug of its own
impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("model", &self.model)
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Loaded weights for one named model, parent of zero or more contexts
pub struct ModelInstance {
    config: ModelConfig,
    model: Arc<dyn LoadedModel>,
    // Context-level lock, scoped to this model
    contexts: tokio::sync::Mutex<HashMap<ContextId, Arc<ContextHandle>>>,
}

impl ModelInstance {
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub async fn context_count(&self) -> usize {
        self.contexts.lock().await.len()
    }

    async fn dispose_all_contexts(&self) {
        let mut contexts = self.contexts.lock().await;
        for handle in contexts.values() {
            handle.dispose();
        }
        METRICS
            .sessions
            .active_contexts
            .sub(contexts.len() as i64);
        contexts.clear();
    }
}

/// Pool of loaded models and their execution contexts
pub struct ModelPool {
    backend: Arc<dyn ModelBackend>,
    configs: HashMap<String, ModelConfig>,
    policy: LoadPolicy,
    // Model-level lock over the name -> instance map
    models: tokio::sync::Mutex<HashMap<String, Arc<ModelInstance>>>,
    // First configured model name, used by the preload_single policy
    first_model: Option<String>,
}

impl ModelPool {
    pub fn new(
        models: Vec<ModelConfig>,
        policy: LoadPolicy,
        backend: Arc<dyn ModelBackend>,
    ) -> Self {
        let first_model = models.first().map(|m| m.name.clone());
        let configs = models.into_iter().map(|m| (m.name.clone(), m)).collect();
        ModelPool {
            backend,
            configs,
            policy,
            models: tokio::sync::Mutex::new(HashMap::new()),
            first_model,
        }
    }

    /// Apply the eager part of the load policy. Under `PreloadSingle` this
    /// loads the first configured model; otherwise it is a no-op.
    pub async fn preload(&self) -> Result<()> {
        if self.policy != LoadPolicy::PreloadSingle {
            return Ok(());
        }
        let name = self
            .first_model
            .clone()
            .ok_or_else(|| TokenMuxError::config("preload_single requires a configured model"))?;
        info!("Preloading model {}", name);
        self.load_model(&name).await?;
        Ok(())
    }

    /// Look up the immutable config for a model name
    pub fn model_config(&self, name: &str) -> Option<&ModelConfig> {
        self.configs.get(name)
    }

    /// Load a model, idempotently. Under Single/PreloadSingle policy all
    /// other instances are unloaded first.
    pub async fn load_model(&self, name: &str) -> Result<Arc<ModelInstance>> {
        let config = self
            .configs
            .get(name)
            .ok_or_else(|| TokenMuxError::not_found(format!("model {} is not configured", name)))?
            .clone();

        let mut models = self.models.lock().await;

        if let Some(instance) = models.get(name) {
            return Ok(Arc::clone(instance));
        }

        if matches!(self.policy, LoadPolicy::Single | LoadPolicy::PreloadSingle) {
            for (other, instance) in models.drain() {
                info!("Unloading model {} (single load policy)", other);
                instance.dispose_all_contexts().await;
            }
        }

        info!("Loading model {}", name);
        let model = self.backend.load_model(&config)?;
        let instance = Arc::new(ModelInstance {
            config,
            model,
            contexts: tokio::sync::Mutex::new(HashMap::new()),
        });
        models.insert(name.to_string(), Arc::clone(&instance));
        METRICS.sessions.loaded_models.set(models.len() as i64);
        Ok(instance)
    }

    /// Get a loaded model instance, if any
    pub async fn get_model(&self, name: &str) -> Option<Arc<ModelInstance>> {
        self.models.lock().await.get(name).cloned()
    }

    /// Unload one model: dispose all its contexts, then release the weights
    pub async fn unload_model(&self, name: &str) -> Result<()> {
        let instance = {
            let mut models = self.models.lock().await;
            let instance = models
                .remove(name)
                .ok_or_else(|| TokenMuxError::not_found(format!("model {} is not loaded", name)))?;
            METRICS.sessions.loaded_models.set(models.len() as i64);
            instance
        };
        instance.dispose_all_contexts().await;
        info!("Unloaded model {}", name);
        Ok(())
    }

    /// Unload every model
    pub async fn unload_all(&self) {
        let instances: Vec<Arc<ModelInstance>> = {
            let mut models = self.models.lock().await;
            let drained = models.drain().map(|(_, v)| v).collect();
            METRICS.sessions.loaded_models.set(0);
            drained
        };
        for instance in instances {
            instance.dispose_all_contexts().await;
        }
        info!("All models unloaded");
    }

    /// Return an existing context for `(model, id)` or create one, loading
    /// the model first if needed. Enforces the per-model instance cap.
    pub async fn get_or_create_context(
        &self,
        model_name: &str,
        context_id: &str,
    ) -> Result<Arc<ContextHandle>> {
        let instance = self.load_model(model_name).await?;

        let mut contexts = instance.contexts.lock().await;
        if let Some(handle) = contexts.get(context_id) {
            return Ok(Arc::clone(handle));
        }

        let cap = instance.config.max_instances;
        if cap >= 0 && contexts.len() >= cap as usize {
            return Err(TokenMuxError::resource_exhausted(format!(
                "model {} already has {} contexts (max {})",
                model_name,
                contexts.len(),
                cap
            )));
        }

        debug!("Creating context {} for model {}", context_id, model_name);
        let engine = instance.model.create_context(&instance.config)?;
        let handle = Arc::new(ContextHandle::new(
            model_name.to_string(),
            context_id.to_string(),
            engine,
        ));
        contexts.insert(context_id.to_string(), Arc::clone(&handle));
        METRICS.sessions.active_contexts.inc();
        Ok(handle)
    }

    /// Dispose and unmap a context. A missing model or context is a no-op:
    /// eviction may already have disposed it.
    pub async fn remove_context(&self, model_name: &str, context_id: &str) -> Result<()> {
        let instance = match self.get_model(model_name).await {
            Some(instance) => instance,
            None => {
                warn!(
                    "remove_context: model {} not loaded, nothing to do",
                    model_name
                );
                return Ok(());
            }
        };

        let mut contexts = instance.contexts.lock().await;
        if let Some(handle) = contexts.remove(context_id) {
            handle.dispose();
            METRICS.sessions.active_contexts.dec();
            debug!("Removed context {} from model {}", context_id, model_name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokenmux_engine::stub::StubBackend;

    fn config(name: &str, max_instances: i32) -> ModelConfig {
        ModelConfig {
            name: name.to_string(),
            weights_path: PathBuf::from("/dev/null"),
            context_size: 512,
            batch_size: 64,
            max_instances,
            options: HashMap::new(),
        }
    }

    fn pool(models: Vec<ModelConfig>, policy: LoadPolicy) -> ModelPool {
        ModelPool::new(models, policy, Arc::new(StubBackend::new()))
    }

    #[tokio::test]
    async fn test_load_model_is_idempotent() {
        let pool = pool(vec![config("a", -1)], LoadPolicy::Multiple);
        let first = pool.load_model("a").await.unwrap();
        let second = pool.load_model("a").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_unconfigured_model_not_found() {
        let pool = pool(vec![config("a", -1)], LoadPolicy::Multiple);
        let err = pool.get_or_create_context("missing", "ctx").await.unwrap_err();
        assert!(matches!(err, TokenMuxError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_context_cap_enforced() {
        let pool = pool(vec![config("a", 2)], LoadPolicy::Multiple);

        pool.get_or_create_context("a", "ctx-1").await.unwrap();
        pool.get_or_create_context("a", "ctx-2").await.unwrap();

        let err = pool.get_or_create_context("a", "ctx-3").await.unwrap_err();
        assert!(matches!(err, TokenMuxError::ResourceExhausted(_)));

        // Releasing one context permits exactly one more
        pool.remove_context("a", "ctx-1").await.unwrap();
        pool.get_or_create_context("a", "ctx-3").await.unwrap();
        let err = pool.get_or_create_context("a", "ctx-4").await.unwrap_err();
        assert!(matches!(err, TokenMuxError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_existing_context_returned_without_counting_again() {
        let pool = pool(vec![config("a", 1)], LoadPolicy::Multiple);
        let first = pool.get_or_create_context("a", "ctx").await.unwrap();
        let again = pool.get_or_create_context("a", "ctx").await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[tokio::test]
    async fn test_single_policy_unloads_previous_model() {
        let pool = pool(vec![config("a", -1), config("b", -1)], LoadPolicy::Single);

        let ctx_a = pool.get_or_create_context("a", "ctx").await.unwrap();
        assert!(pool.get_model("a").await.is_some());

        pool.load_model("b").await.unwrap();

        // A is gone and its contexts are observably dead, not silently stale
        assert!(pool.get_model("a").await.is_none());
        assert!(ctx_a.is_disposed());
        assert!(ctx_a.with_engine(|_| ()).is_err());
    }

    #[tokio::test]
    async fn test_preload_single_loads_first_model() {
        let pool = pool(
            vec![config("a", -1), config("b", -1)],
            LoadPolicy::PreloadSingle,
        );
        pool.preload().await.unwrap();
        assert!(pool.get_model("a").await.is_some());
        assert!(pool.get_model("b").await.is_none());
    }

    #[tokio::test]
    async fn test_unload_model_disposes_contexts() {
        let pool = pool(vec![config("a", -1)], LoadPolicy::Multiple);
        let ctx = pool.get_or_create_context("a", "ctx").await.unwrap();

        pool.unload_model("a").await.unwrap();
        assert!(ctx.is_disposed());
        assert!(pool.get_model("a").await.is_none());
    }

    #[tokio::test]
    async fn test_context_handle_debug_reports_disposal() {
        let pool = pool(vec![config("a", -1)], LoadPolicy::Multiple);
        let ctx = pool.get_or_create_context("a", "ctx").await.unwrap();
        assert!(format!("{:?}", ctx).contains("disposed: false"));

        pool.remove_context("a", "ctx").await.unwrap();
        assert!(format!("{:?}", ctx).contains("disposed: true"));
    }
}
