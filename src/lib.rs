pub mod config;
pub mod detector;
pub mod error;
pub mod executor;
pub mod interactions;
pub mod llm;
pub mod observers;
pub mod registry;
pub mod server;
pub mod suggestions;
pub mod summarizer;
pub mod util;

use anyhow::{Context, Result};
use log::{info, warn};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use config::ConfigStore;
use executor::ScriptExecutor;
use interactions::InteractionLog;
use llm::{GeminiClient, ModelHandle, TextModel};
use observers::{AppUsageLedger, FileWatcherController, RecentKeys};
use registry::ActionRegistry;
use server::{build_router, AppState, SystemProbe};
use suggestions::SuggestionManager;
use summarizer::SummaryStore;

/// Assemble every store and component from the data directory. Pure wiring;
/// no worker is started here, so tests can drive the state directly.
pub fn build_state(data_dir: &Path, config_store: Arc<ConfigStore>) -> AppState {
    let config = config_store.current();

    let interactions = Arc::new(InteractionLog::load(data_dir.join("ai_interactions.json")));
    let model = Arc::new(ModelHandle::new(Arc::new(GeminiClient::new(
        config.llm.api_key.clone(),
        config.llm.model.clone(),
        interactions.clone(),
    ))));
    let registry = Arc::new(ActionRegistry::load(
        config.watch.recent_ops_capacity,
        data_dir.join("action_registry.json"),
    ));
    let suggestions = Arc::new(SuggestionManager::load(
        data_dir.join("suggestions.json"),
        config.time_saved.clone(),
    ));
    let executor = Arc::new(ScriptExecutor::new(
        model.clone() as Arc<dyn TextModel>,
        registry.clone(),
        data_dir.join("scripts"),
        "python3".to_string(),
    ));
    let ledger = Arc::new(AppUsageLedger::load(data_dir.join("app_usage.json")));
    let minute_summaries = Arc::new(SummaryStore::load(data_dir.join("summaries_minute.json")));
    let ten_minute_summaries = Arc::new(SummaryStore::load(
        data_dir.join("summaries_ten_minute.json"),
    ));
    let file_watcher = Arc::new(tokio::sync::Mutex::new(FileWatcherController::new(
        registry.clone(),
    )));

    AppState {
        config: config_store,
        registry,
        suggestions,
        executor,
        ledger,
        minute_summaries,
        ten_minute_summaries,
        interactions,
        model,
        recent_keys: Arc::new(RecentKeys::default()),
        file_watcher,
        probe: Arc::new(SystemProbe::new()),
        shutdown: CancellationToken::new(),
        started_at: util::now_ts(),
    }
}

/// Start the observers and periodic workers for a built state.
pub async fn spawn_workers(state: &AppState) {
    let cancel = state.shutdown.clone();
    let config = state.config.current();

    // Filesystem observer.
    {
        let dirs = config.expanded_watch_dirs();
        if dirs.is_empty() {
            warn!("no valid watch directories configured");
        }
        if let Err(err) = state.file_watcher.lock().await.rebuild(dirs).await {
            warn!("file watcher failed to start: {err:#}");
        }
    }

    // Foreground-app tracker feeding the ledger and the focus channel.
    let (focus_tx, focus_rx) = watch::channel(None);
    tokio::spawn(observers::app_usage::tracker_loop(
        state.ledger.clone(),
        state.registry.clone(),
        focus_tx,
        cancel.clone(),
    ));

    // Keyboard observer, only when the platform bridge can deliver keys.
    let (key_tx, key_rx) = tokio::sync::mpsc::unbounded_channel();
    if observers::platform::spawn_key_listener(key_tx) {
        tokio::spawn(observers::input_monitor::input_loop(
            state.registry.clone(),
            key_rx,
            focus_rx,
            state.recent_keys.clone(),
            cancel.clone(),
        ));
    } else {
        warn!("no keyboard capture backend on this target; input monitoring idle");
    }

    // Periodic workers.
    tokio::spawn(registry::persistence_loop(
        state.registry.clone(),
        cancel.clone(),
    ));
    tokio::spawn(detector::detection_loop(
        state.registry.clone(),
        state.suggestions.clone(),
        state.model.clone() as Arc<dyn TextModel>,
        config.watch.pattern_interval_seconds,
        cancel.clone(),
    ));
    tokio::spawn(summarizer::minute_loop(
        state.registry.clone(),
        state.minute_summaries.clone(),
        state.model.clone() as Arc<dyn TextModel>,
        cancel.clone(),
    ));
    tokio::spawn(summarizer::ten_minute_loop(
        state.registry.clone(),
        state.minute_summaries.clone(),
        state.ten_minute_summaries.clone(),
        state.model.clone() as Arc<dyn TextModel>,
        cancel.clone(),
    ));
}

/// Flush every store once. Used on shutdown; individual failures are
/// logged, not propagated.
pub async fn persist_all(state: &AppState) {
    if let Err(err) = state.registry.persist() {
        warn!("registry persist failed: {err:#}");
    }
    if let Err(err) = state.suggestions.persist().await {
        warn!("suggestions persist failed: {err:#}");
    }
    if let Err(err) = state.ledger.persist() {
        warn!("app usage persist failed: {err:#}");
    }
    if let Err(err) = state.minute_summaries.persist() {
        warn!("minute summaries persist failed: {err:#}");
    }
    if let Err(err) = state.ten_minute_summaries.persist() {
        warn!("ten-minute summaries persist failed: {err:#}");
    }
    if let Err(err) = state.interactions.persist() {
        warn!("interaction log persist failed: {err:#}");
    }
}

/// Full backend lifecycle: load config, wire components, start workers,
/// serve the control plane, persist on the way out.
pub async fn run() -> Result<()> {
    let data_dir = config::data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data directory {}", data_dir.display()))?;

    let config_store =
        Arc::new(ConfigStore::load(data_dir.join("config.yaml")).context("configuration error")?);
    let config = config_store.current();

    let level = if config.logging.enabled {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();

    info!("encore starting, data dir {}", data_dir.display());

    let state = build_state(&data_dir, config_store);
    spawn_workers(&state).await;

    let addr = SocketAddr::from(([127, 0, 0, 1], config.backend.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind control plane to {addr}"))?;
    info!("control plane listening on http://{addr}");

    let shutdown = state.shutdown.clone();
    let graceful = {
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    shutdown.cancel();
                }
            }
        }
    };

    axum::serve(listener, build_router(state.clone()))
        .with_graceful_shutdown(graceful)
        .await
        .context("control plane server failed")?;

    // Workers flush on cancellation; this covers anything they missed.
    shutdown.cancel();
    persist_all(&state).await;
    info!("encore stopped cleanly");
    Ok(())
}
