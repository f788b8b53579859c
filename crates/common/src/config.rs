//! Configuration structures for TokenMux
//!
//! This module defines all configuration types used by the orchestration
//! core. The model table and load policy are loaded from a YAML file once at
//! process start and treated as immutable thereafter.

use crate::error::{Result, TokenMuxError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration for TokenMux
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMuxConfig {
    /// Ordered list of configured models
    pub models: Vec<ModelConfig>,

    /// Global model load policy
    #[serde(default)]
    pub load_policy: LoadPolicy,

    /// Base directory for persisted session state
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Model load policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadPolicy {
    /// Only one model may be loaded at a time; loading another unloads it
    Single,

    /// Eagerly load the first configured model at startup, then behave as Single
    PreloadSingle,

    /// Load models lazily on first request; many may coexist
    Multiple,
}

impl Default for LoadPolicy {
    fn default() -> Self {
        LoadPolicy::Multiple
    }
}

/// Immutable descriptor for one configured model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name/identifier (unique within the table)
    pub name: String,

    /// Path to the model weights
    pub weights_path: PathBuf,

    /// Token context window size per execution context
    #[serde(default = "default_context_size")]
    pub context_size: usize,

    /// Number of prompt tokens fed to the engine per evaluation step
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum concurrent execution contexts (< 0 means unbounded)
    #[serde(default = "default_max_instances")]
    pub max_instances: i32,

    /// Engine-specific load parameters, passed through opaquely
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

/// Executor behavior variant for a session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Stateful multi-turn chat with antiprompt-driven turn boundaries
    Interactive,

    /// Stateful single-shot-per-call chat with instruction prefix/suffix wrapping
    Instruct,

    /// No persisted context between calls; fresh context per call
    Stateless,
}

/// Configuration captured when a session is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Name of the configured model this session binds to
    pub model: String,

    /// Executor behavior variant
    #[serde(default = "default_executor")]
    pub executor: ExecutorKind,

    /// Opening prompt run once at session creation
    #[serde(default)]
    pub initial_prompt: String,

    /// Strings whose appearance in output end the current turn
    #[serde(default)]
    pub antiprompts: Vec<String>,

    /// Instruction prefix wrapped around each input (Instruct executor)
    #[serde(default = "default_instruction_prefix")]
    pub instruction_prefix: String,

    /// Instruction suffix wrapped around each input (Instruct executor)
    #[serde(default = "default_instruction_suffix")]
    pub instruction_suffix: String,
}

/// Mirostat adaptive sampling mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MirostatMode {
    /// Mirostat disabled
    Disabled,

    /// Mirostat v1
    V1,

    /// Mirostat v2
    V2,
}

impl Default for MirostatMode {
    fn default() -> Self {
        MirostatMode::Disabled
    }
}

/// Per-call inference parameters (mutable between calls)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferenceParams {
    /// Maximum tokens generated in one turn (< 0 means unbounded)
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i32,

    /// Number of initial tokens retained across context overflow (minimum 1)
    #[serde(default = "default_tokens_keep")]
    pub tokens_keep: usize,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Top-k sampling cutoff
    #[serde(default = "default_top_k")]
    pub top_k: i32,

    /// Top-p (nucleus) sampling cutoff
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Repetition penalty over the last-tokens window
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    /// Frequency penalty over the last-tokens window
    #[serde(default)]
    pub frequency_penalty: f32,

    /// Presence penalty over the last-tokens window
    #[serde(default)]
    pub presence_penalty: f32,

    /// Window of recent tokens considered by penalties
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: usize,

    /// Mirostat mode
    #[serde(default)]
    pub mirostat: MirostatMode,

    /// Mirostat target entropy (tau)
    #[serde(default = "default_mirostat_tau")]
    pub mirostat_tau: f32,

    /// Mirostat learning rate (eta)
    #[serde(default = "default_mirostat_eta")]
    pub mirostat_eta: f32,

    /// Per-call antiprompts, unioned with the session's before each call
    #[serde(default)]
    pub antiprompts: Vec<String>,
}

impl Default for InferenceParams {
    fn default() -> Self {
        InferenceParams {
            max_tokens: default_max_tokens(),
            tokens_keep: default_tokens_keep(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            repeat_last_n: default_repeat_last_n(),
            mirostat: MirostatMode::Disabled,
            mirostat_tau: default_mirostat_tau(),
            mirostat_eta: default_mirostat_eta(),
            antiprompts: Vec::new(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_context_size() -> usize {
    2048
}

fn default_batch_size() -> usize {
    512
}

fn default_max_instances() -> i32 {
    -1
}

fn default_executor() -> ExecutorKind {
    ExecutorKind::Interactive
}

fn default_instruction_prefix() -> String {
    "\n\n### Instruction:\n\n".to_string()
}

fn default_instruction_suffix() -> String {
    "\n\n### Response:\n\n".to_string()
}

fn default_max_tokens() -> i32 {
    256
}

fn default_tokens_keep() -> usize {
    1
}

fn default_temperature() -> f32 {
    0.8
}

fn default_top_k() -> i32 {
    40
}

fn default_top_p() -> f32 {
    0.95
}

fn default_repeat_penalty() -> f32 {
    1.1
}

fn default_repeat_last_n() -> usize {
    64
}

fn default_mirostat_tau() -> f32 {
    5.0
}

fn default_mirostat_eta() -> f32 {
    0.1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl TokenMuxConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            TokenMuxError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: TokenMuxConfig = serde_yaml::from_str(&content).map_err(|e| {
            TokenMuxError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(TokenMuxError::config("At least one model must be configured"));
        }

        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if model.name.is_empty() {
                return Err(TokenMuxError::config("Model name must not be empty"));
            }
            if !seen.insert(model.name.as_str()) {
                return Err(TokenMuxError::config(format!(
                    "Duplicate model name: {}",
                    model.name
                )));
            }
            if model.context_size == 0 {
                return Err(TokenMuxError::config(format!(
                    "Model {} has zero context size",
                    model.name
                )));
            }
            if model.batch_size == 0 {
                return Err(TokenMuxError::config(format!(
                    "Model {} has zero batch size",
                    model.name
                )));
            }
        }

        Ok(())
    }

    /// Look up a model configuration by name
    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }
}

impl InferenceParams {
    /// Tokens retained across context overflow, never less than one
    pub fn effective_tokens_keep(&self) -> usize {
        self.tokens_keep.max(1)
    }
}
