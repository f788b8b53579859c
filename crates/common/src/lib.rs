//! TokenMux common library
//!
//! This crate contains shared code used across TokenMux components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{
    ExecutorKind, InferenceParams, LoadPolicy, MirostatMode, ModelConfig, SessionConfig,
    TokenMuxConfig,
};
pub use error::{Result, TokenMuxError};
pub use metrics::{MetricsRegistry, METRICS};
