//! Control-plane HTTP API. Every operation of the engine is reachable from
//! here; the frontend is whatever the user points at the port.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigStore, ConfigUpdate};
use crate::error::ApiError;
use crate::executor::ScriptExecutor;
use crate::interactions::InteractionLog;
use crate::llm::{GeminiClient, ModelHandle};
use crate::observers::{AppUsageLedger, FileWatcherController, RecentKeys};
use crate::registry::ActionRegistry;
use crate::suggestions::SuggestionManager;
use crate::summarizer::SummaryStore;
use crate::util::{format_duration, now_ts};

/// Process self-probe for the health endpoint.
pub struct SystemProbe {
    system: Mutex<System>,
    pid: Pid,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        Self {
            system: Mutex::new(system),
            pid,
        }
    }

    fn sample(&self) -> (f32, f64) {
        let mut system = self.system.lock().unwrap();
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]));
        match system.process(self.pid) {
            Some(process) => (
                process.cpu_usage(),
                process.memory() as f64 / 1024.0 / 1024.0,
            ),
            None => (0.0, 0.0),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub registry: Arc<ActionRegistry>,
    pub suggestions: Arc<SuggestionManager>,
    pub executor: Arc<ScriptExecutor>,
    pub ledger: Arc<AppUsageLedger>,
    pub minute_summaries: Arc<SummaryStore>,
    pub ten_minute_summaries: Arc<SummaryStore>,
    pub interactions: Arc<InteractionLog>,
    pub model: Arc<ModelHandle>,
    pub recent_keys: Arc<RecentKeys>,
    pub file_watcher: Arc<tokio::sync::Mutex<FileWatcherController>>,
    pub probe: Arc<SystemProbe>,
    pub shutdown: CancellationToken,
    pub started_at: f64,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/config", get(get_config).put(update_config))
        .route("/recent-actions", get(recent_actions))
        .route("/recent-actions/detailed", get(recent_actions_detailed))
        .route("/automation/action-registry/stats", get(registry_stats))
        .route("/automation/action-registry/all", get(registry_all))
        .route("/automation/action-registry/recent", get(registry_recent))
        .route("/automation/pending-suggestions", get(pending_suggestions))
        .route("/automation/suggestions/all", get(all_suggestions))
        .route("/automation/suggestion/:id/accept", post(accept_suggestion))
        .route("/automation/suggestion/:id/reject", post(reject_suggestion))
        .route("/automation/suggestion/:id/explain", post(explain_suggestion))
        .route("/automation/suggestion/:id/refine", post(refine_suggestion))
        .route(
            "/automation/suggestion/:id/confirm-and-execute",
            post(confirm_and_execute),
        )
        .route("/automation/suggestion/:id/status", get(suggestion_status))
        .route("/automation/mute", post(mute_automation))
        .route("/automation/time-saved", get(time_saved))
        .route("/automation/current-activity", get(current_activity))
        .route("/automation/keyboard/recent", get(keyboard_recent))
        .route("/automation/long-term/status", get(long_term_status))
        .route(
            "/summaries/minute",
            get(minute_summaries).delete(clear_minute_summaries),
        )
        .route(
            "/summaries/ten-minute",
            get(ten_minute_summaries).delete(clear_ten_minute_summaries),
        )
        .route("/summaries/:kind/:id", axum::routing::delete(delete_summary))
        .route("/app-usage/today", get(usage_today))
        .route("/app-usage/week", get(usage_week))
        .route("/app-usage/hourly", get(usage_hourly))
        .route("/app-usage/stats", get(usage_stats))
        .route("/ai-interactions", get(ai_interactions))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let (cpu_percent, memory_mb) = state.probe.sample();
    Json(json!({
        "status": "ok",
        "uptime_seconds": (now_ts() - state.started_at) as u64,
        "automation_running": state.registry.is_automation_running(),
        "system": { "cpu_percent": cpu_percent, "memory_mb": memory_mb },
    }))
}

// ---- config ----------------------------------------------------------------

async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.config.flattened()))
}

async fn update_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<Value>, ApiError> {
    let dirs_changed = update.watch_dirs.is_some();
    let llm_changed = update.llm_api_key.is_some() || update.llm_model.is_some();

    let updated = state
        .config
        .apply(update)
        .map_err(|err| ApiError::Internal(format!("failed to persist config: {err:#}")))?;

    if dirs_changed {
        let dirs = updated.expanded_watch_dirs();
        info!("watch.dirs changed, rebuilding file watcher over {} roots", dirs.len());
        state
            .file_watcher
            .lock()
            .await
            .rebuild(dirs)
            .await
            .map_err(|err| ApiError::Internal(format!("failed to rebuild watcher: {err:#}")))?;
    }
    if llm_changed {
        state.model.replace(Arc::new(GeminiClient::new(
            updated.llm.api_key.clone(),
            updated.llm.model.clone(),
            state.interactions.clone(),
        )));
    }

    Ok(Json(json!(state.config.flattened())))
}

// ---- registry --------------------------------------------------------------

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct SecondsQuery {
    seconds: Option<u64>,
}

async fn recent_actions(State(state): State<AppState>) -> Json<Value> {
    let actions = state.registry.recent(300.0);
    let simplified: Vec<Value> = actions
        .iter()
        .map(|a| {
            json!({
                "id": a.id,
                "action_type": a.action_type,
                "source": a.source.as_str(),
                "timestamp": a.timestamp,
            })
        })
        .collect();
    Json(json!({ "actions": simplified, "count": simplified.len() }))
}

async fn recent_actions_detailed(State(state): State<AppState>) -> Json<Value> {
    let actions = state.registry.recent(300.0);
    Json(json!({ "count": actions.len(), "actions": actions }))
}

async fn registry_stats(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.registry.stats()).unwrap_or_default())
}

async fn registry_all(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(100);
    let actions = state.registry.all(limit);
    Json(json!({
        "count": actions.len(),
        "total_count": state.registry.len(),
        "actions": actions,
    }))
}

async fn registry_recent(
    State(state): State<AppState>,
    Query(query): Query<SecondsQuery>,
) -> Json<Value> {
    let seconds = query.seconds.unwrap_or(300);
    let actions = state.registry.recent(seconds as f64);
    Json(json!({ "count": actions.len(), "actions": actions }))
}

// ---- suggestions -----------------------------------------------------------

#[derive(Deserialize)]
struct ExplainBody {
    explanation: String,
}

#[derive(Deserialize)]
struct RefineBody {
    refinement: String,
}

#[derive(Deserialize)]
struct MuteBody {
    minutes: u64,
}

async fn pending_suggestions(State(state): State<AppState>) -> Json<Value> {
    let pending = state.suggestions.pending().await;
    Json(json!({ "count": pending.len(), "suggestions": pending }))
}

async fn all_suggestions(State(state): State<AppState>) -> Json<Value> {
    let all = state.suggestions.all().await;
    Json(json!({ "count": all.len(), "suggestions": all }))
}

async fn accept_suggestion(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let suggestion = state.suggestions.accept(&id).await?;
    Ok(Json(json!({
        "message": "suggestion accepted",
        "suggestion_id": suggestion.suggestion_id,
        "next_step": "provide an explanation of what you want to automate",
    })))
}

async fn reject_suggestion(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let suggestion = state.suggestions.reject(&id).await?;
    Ok(Json(json!({
        "message": "suggestion rejected",
        "suggestion_id": suggestion.suggestion_id,
    })))
}

async fn explain_suggestion(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExplainBody>,
) -> Result<Json<Value>, ApiError> {
    if body.explanation.trim().is_empty() {
        return Err(ApiError::BadRequest("explanation required".into()));
    }
    let (script, summary) = state
        .suggestions
        .explain(&id, body.explanation, &state.executor)
        .await?;
    Ok(Json(json!({
        "message": "script generated",
        "suggestion_id": id,
        "script": script,
        "summary": summary,
        "next_step": "review the script, then refine or confirm",
    })))
}

async fn refine_suggestion(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RefineBody>,
) -> Result<Json<Value>, ApiError> {
    if body.refinement.trim().is_empty() {
        return Err(ApiError::BadRequest("refinement required".into()));
    }
    let (script, summary) = state
        .suggestions
        .refine(&id, body.refinement, &state.executor)
        .await?;
    Ok(Json(json!({
        "message": "script refined",
        "suggestion_id": id,
        "script": script,
        "summary": summary,
        "next_step": "review the script, then refine or confirm",
    })))
}

async fn confirm_and_execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .suggestions
        .confirm_and_execute(&id, state.executor.clone())
        .await?;
    Ok(Json(json!({
        "message": "automation execution started",
        "suggestion_id": id,
        "status": "executing",
    })))
}

async fn suggestion_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let view = state.suggestions.status(&id).await?;
    Ok(Json(serde_json::to_value(view).unwrap_or_default()))
}

async fn mute_automation(
    State(state): State<AppState>,
    Json(body): Json<MuteBody>,
) -> Json<Value> {
    let deadline = state.suggestions.mute(body.minutes).await;
    Json(json!({
        "success": true,
        "muted_for_minutes": body.minutes,
        "muted_until": deadline,
    }))
}

async fn time_saved(State(state): State<AppState>) -> Json<Value> {
    let total = state.suggestions.time_saved_total();
    Json(json!({
        "total_seconds": total,
        "total_minutes": total as f64 / 60.0,
        "total_hours": total as f64 / 3600.0,
        "display": format_duration(total),
    }))
}

async fn current_activity(State(state): State<AppState>) -> Json<Value> {
    let keys = state.recent_keys.snapshot();
    let switches: Vec<Value> = state
        .registry
        .all(50)
        .into_iter()
        .filter(|a| a.action_type == "app_focus")
        .take(10)
        .map(|a| {
            json!({
                "app_name": a.details.get("app_name"),
                "window_title": a.details.get("window_title"),
                "timestamp": a.timestamp,
                "time_ago": format_time_ago(a.timestamp),
            })
        })
        .collect();
    Json(json!({
        "current_app": state.ledger.current_app(),
        "recent_keys": keys,
        "keyboard_sequence": keys.join(" "),
        "recent_app_switches": switches,
    }))
}

async fn keyboard_recent(State(state): State<AppState>) -> Json<Value> {
    let keys = state.recent_keys.snapshot();
    Json(json!({
        "count": keys.len(),
        "sequence": keys.join(" "),
        "keys": keys,
    }))
}

async fn long_term_status() -> Json<Value> {
    Json(json!({
        "status": "coming_soon",
        "message": "long-term pattern mining is not part of this build",
    }))
}

// ---- summaries -------------------------------------------------------------

async fn minute_summaries(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<Value> {
    summaries_response(&state.minute_summaries, query.limit.unwrap_or(100))
}

async fn ten_minute_summaries(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<Value> {
    summaries_response(&state.ten_minute_summaries, query.limit.unwrap_or(100))
}

fn summaries_response(store: &SummaryStore, limit: usize) -> Json<Value> {
    let summaries = store.snapshot(limit);
    Json(json!({
        "count": summaries.len(),
        "total_count": store.len(),
        "summaries": summaries,
    }))
}

async fn clear_minute_summaries(State(state): State<AppState>) -> Json<Value> {
    state.minute_summaries.clear();
    Json(json!({ "message": "minute summaries cleared" }))
}

async fn clear_ten_minute_summaries(State(state): State<AppState>) -> Json<Value> {
    state.ten_minute_summaries.clear();
    Json(json!({ "message": "ten-minute summaries cleared" }))
}

async fn delete_summary(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let store = match kind.as_str() {
        "minute" => &state.minute_summaries,
        "ten-minute" => &state.ten_minute_summaries,
        other => return Err(ApiError::BadRequest(format!("unknown summary kind {other}"))),
    };
    if store.delete(&id) {
        Ok(Json(json!({ "message": "summary deleted", "summary_id": id })))
    } else {
        Err(ApiError::NotFound(format!("summary {id}")))
    }
}

// ---- app usage -------------------------------------------------------------

#[derive(Deserialize)]
struct DateQuery {
    date: Option<String>,
}

async fn usage_today(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.ledger.today()).unwrap_or_default())
}

async fn usage_week(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.ledger.week()).unwrap_or_default())
}

async fn usage_hourly(
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> Json<Value> {
    let date = query
        .date
        .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d").to_string());
    Json(json!({
        "date": date,
        "hours": state.ledger.hourly(&date),
    }))
}

async fn usage_stats(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.ledger.stats()).unwrap_or_default())
}

// ---- misc ------------------------------------------------------------------

async fn ai_interactions(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<Value> {
    let interactions = state.interactions.snapshot(query.limit.unwrap_or(100));
    Json(json!({
        "count": interactions.len(),
        "total_count": state.interactions.len(),
        "interactions": interactions,
    }))
}

async fn shutdown(State(state): State<AppState>) -> Json<Value> {
    info!("shutdown requested over the API");
    state.shutdown.cancel();
    Json(json!({ "message": "shutting down" }))
}

fn format_time_ago(timestamp: f64) -> String {
    let diff = (now_ts() - timestamp).max(0.0) as u64;
    if diff < 60 {
        format!("{diff}s ago")
    } else if diff < 3600 {
        format!("{}m ago", diff / 60)
    } else if diff < 86400 {
        format!("{}h ago", diff / 3600)
    } else {
        format!("{}d ago", diff / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_ago_buckets() {
        let now = now_ts();
        assert!(format_time_ago(now - 5.0).ends_with("s ago"));
        assert!(format_time_ago(now - 120.0).ends_with("m ago"));
        assert!(format_time_ago(now - 7200.0).ends_with("h ago"));
        assert!(format_time_ago(now - 200_000.0).ends_with("d ago"));
    }
}
