//! TokenMux - Main Entry Point
//!
//! Starts the session orchestration layer with the built-in stub engine and
//! exposes a minimal line-oriented console: each stdin line is one inference
//! turn on a persistent console session. Ctrl-C checkpoints the session and
//! shuts down cleanly.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokenmux_common::{ExecutorKind, Result, SessionConfig, TokenMuxConfig, TokenMuxError};
use tokenmux_core::{InferenceEvent, ModelPool, SessionRegistry, StateStore};
use tokenmux_engine::stub::StubBackend;

const CONSOLE_SESSION: &str = "console";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenmux=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting TokenMux");

    // Load configuration
    let config_path =
        std::env::var("TOKENMUX_CONFIG").unwrap_or_else(|_| "configs/tokenmux.yaml".to_string());

    let config = TokenMuxConfig::from_file(&config_path)?;
    config.validate()?;

    info!(
        "Configuration loaded: {} model(s), load policy {:?}, state dir {}",
        config.models.len(),
        config.load_policy,
        config.state_dir.display()
    );

    let pool = ModelPool::new(
        config.models.clone(),
        config.load_policy,
        Arc::new(StubBackend::new()),
    );
    let store = StateStore::new(&config.state_dir, config.models.clone())?;
    let registry: SessionRegistry<String> = SessionRegistry::new(pool, store);

    registry.preload().await?;

    for state in registry.list_persisted() {
        info!(
            "Found saved session {} (model {}, {} transcript entries)",
            state.id,
            state.config.model,
            state.history.entries.len()
        );
    }

    let model = config.models[0].name.clone();
    open_console_session(&registry, &model).await?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = run_console(registry.clone()) => {
            if let Err(e) = result {
                error!("Console loop failed: {}", e);
            }
        }
    }

    if let Err(e) = registry.save_state(&CONSOLE_SESSION.to_string()).await {
        warn!("Failed to checkpoint console session: {}", e);
    }
    registry.shutdown().await;

    info!("TokenMux shutdown complete");
    Ok(())
}

/// Restore the console session if a checkpoint exists, otherwise create it
async fn open_console_session(registry: &SessionRegistry<String>, model: &str) -> Result<()> {
    let id = CONSOLE_SESSION.to_string();
    match registry.load_state(&id).await {
        Ok(session) => {
            info!(
                "Resumed console session with {} transcript entries",
                session.history().entries.len()
            );
            return Ok(());
        }
        Err(TokenMuxError::NotFound(_)) => {}
        Err(e) => {
            warn!("Could not restore console session, starting fresh: {}", e);
            let _ = registry.remove_state(&id).await;
        }
    }

    registry
        .create(
            id,
            SessionConfig {
                model: model.to_string(),
                executor: ExecutorKind::Interactive,
                initial_prompt: "Transcript of a dialog between a user and an assistant."
                    .to_string(),
                antiprompts: vec!["User:".to_string()],
                instruction_prefix: String::new(),
                instruction_suffix: String::new(),
            },
            None,
        )
        .await?;
    Ok(())
}

/// One inference turn per stdin line, streamed to stdout as it generates
async fn run_console(registry: SessionRegistry<String>) -> Result<()> {
    let id = CONSOLE_SESSION.to_string();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let mut stream = registry.infer(&id, &line, None, None).await?;
        while let Some(event) = stream.next().await {
            match event {
                Ok(InferenceEvent::Begin) => {}
                Ok(InferenceEvent::Content(chunk)) => {
                    stdout.write_all(chunk.as_bytes()).await?;
                    stdout.flush().await?;
                }
                Ok(InferenceEvent::End { .. }) => {
                    stdout.write_all(b"\n").await?;
                    stdout.flush().await?;
                }
                Ok(InferenceEvent::Cancelled) => {
                    warn!("Turn cancelled");
                }
                Err(e) => {
                    error!("Inference failed: {}", e);
                    break;
                }
            }
        }
    }

    info!("Console input closed");
    Ok(())
}
