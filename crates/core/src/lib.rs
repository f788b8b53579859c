//! TokenMux orchestration core
//!
//! Session orchestration over a token-level inference engine: model and
//! context pooling, per-session single-flight protection, the executor
//! state machine with rolling context truncation, streaming inference with
//! cancellation, and durable checkpoint/restore.

pub mod executor;
pub mod guard;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod session;
pub mod store;

// Re-export the main entry points
pub use executor::{ExecutorState, InferenceExecutor};
pub use guard::{Permit, SingleFlight};
pub use pool::{ContextHandle, ContextId, ModelInstance, ModelPool};
pub use queue::CompletionQueue;
pub use registry::{InferenceEvent, InferenceStream, SessionRegistry};
pub use session::{History, HistoryEntry, HistoryRole, Session, SessionKey, SessionState};
pub use store::StateStore;
