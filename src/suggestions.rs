//! Suggestion lifecycle: from detector emission through the user dialogue
//! to script execution, plus the ignored-pattern memory and the time-saved
//! ledger.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::TimeSavedConfig;
use crate::error::ApiError;
use crate::executor::{ExecutionResult, ScriptExecutor};
use crate::registry::{Action, FileEventKind};
use crate::util::{atomic_write_json, load_json_or_default, now_ts};

const SUGGESTION_COOLDOWN_SECS: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Accepted,
    Explained,
    Executing,
    Completed,
    Failed,
    Rejected,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Accepted => "accepted",
            SuggestionStatus::Explained => "explained",
            SuggestionStatus::Executing => "executing",
            SuggestionStatus::Completed => "completed",
            SuggestionStatus::Failed => "failed",
            SuggestionStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub suggestion_id: String,
    pub created_ts: f64,
    pub pattern_description: String,
    pub pattern_hash: String,
    pub status: SuggestionStatus,
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refinement_history: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_saved_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuggestionStatusView {
    pub suggestion_id: String,
    pub status: SuggestionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_saved_seconds: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedSuggestions {
    suggestions: Vec<Suggestion>,
    ignored_patterns: Vec<String>,
    total_time_saved_seconds: u64,
}

struct ManagerState {
    suggestions: Vec<Suggestion>,
    ignored: HashSet<String>,
    last_emission: f64,
    mute_deadline: f64,
}

pub struct SuggestionManager {
    state: Mutex<ManagerState>,
    time_saved: AtomicU64,
    time_saved_config: TimeSavedConfig,
    path: PathBuf,
}

/// Estimated manual cost of the actions a completed automation replaced.
pub fn compute_time_saved(actions: &[Action], config: &TimeSavedConfig) -> u64 {
    let mut renames = 0u64;
    let mut other_file_ops = 0u64;
    for action in actions {
        if let Some(op) = action.file_operation() {
            match op.event_type {
                FileEventKind::Renamed => renames += 1,
                _ => other_file_ops += 1,
            }
        }
    }
    other_file_ops * config.file_op_seconds + renames * config.rename_seconds
}

impl SuggestionManager {
    pub fn load(path: PathBuf, time_saved_config: TimeSavedConfig) -> Self {
        let persisted: PersistedSuggestions = load_json_or_default(&path);
        if !persisted.suggestions.is_empty() {
            info!("loaded {} suggestions from disk", persisted.suggestions.len());
        }
        Self {
            state: Mutex::new(ManagerState {
                suggestions: persisted.suggestions,
                ignored: persisted.ignored_patterns.into_iter().collect(),
                last_emission: 0.0,
                mute_deadline: 0.0,
            }),
            time_saved: AtomicU64::new(persisted.total_time_saved_seconds),
            time_saved_config,
            path,
        }
    }

    // ---- detector-facing gatekeeping -------------------------------------

    pub async fn is_muted(&self) -> bool {
        now_ts() < self.state.lock().await.mute_deadline
    }

    pub async fn in_cooldown(&self) -> bool {
        let state = self.state.lock().await;
        now_ts() - state.last_emission < SUGGESTION_COOLDOWN_SECS
    }

    pub async fn is_ignored(&self, pattern_hash: &str) -> bool {
        self.state.lock().await.ignored.contains(pattern_hash)
    }

    /// Mute the detector for `minutes`; returns the absolute deadline.
    pub async fn mute(&self, minutes: u64) -> f64 {
        let deadline = now_ts() + minutes as f64 * 60.0;
        self.state.lock().await.mute_deadline = deadline;
        info!("suggestions muted for {minutes} minutes");
        deadline
    }

    /// Store a freshly detected suggestion. Returns `None` when the pattern
    /// hash is already on the ignore list.
    pub async fn create(
        &self,
        pattern_description: String,
        pattern_hash: String,
        actions: Vec<Action>,
    ) -> Option<Suggestion> {
        let mut state = self.state.lock().await;
        if state.ignored.contains(&pattern_hash) {
            return None;
        }
        let suggestion = Suggestion {
            suggestion_id: format!("suggestion_{}", Uuid::new_v4()),
            created_ts: now_ts(),
            pattern_description,
            pattern_hash,
            status: SuggestionStatus::Pending,
            actions,
            user_explanation: None,
            generated_script: None,
            script_summary: None,
            refinement_history: Vec::new(),
            execution_result: None,
            time_saved_seconds: None,
        };
        state.last_emission = now_ts();
        state.suggestions.push(suggestion.clone());
        info!("new suggestion {}", suggestion.suggestion_id);
        Some(suggestion)
    }

    // ---- queries ---------------------------------------------------------

    pub async fn pending(&self) -> Vec<Suggestion> {
        let state = self.state.lock().await;
        state
            .suggestions
            .iter()
            .filter(|s| s.status == SuggestionStatus::Pending)
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<Suggestion> {
        self.state.lock().await.suggestions.clone()
    }

    pub async fn status(&self, suggestion_id: &str) -> Result<SuggestionStatusView, ApiError> {
        let state = self.state.lock().await;
        let suggestion = find(&state.suggestions, suggestion_id)?;

        let error_details = match (&suggestion.status, &suggestion.execution_result) {
            (SuggestionStatus::Failed, Some(result)) => Some(json!({
                "final_error": result.final_error,
                "attempts": result.attempts,
                "library_installation": result.library_installation,
                "execution_id": result.execution_id,
                "timestamp": result.timestamp,
            })),
            _ => None,
        };

        Ok(SuggestionStatusView {
            suggestion_id: suggestion.suggestion_id.clone(),
            status: suggestion.status,
            execution_result: suggestion.execution_result.clone(),
            error_details,
            time_saved_seconds: suggestion.time_saved_seconds,
        })
    }

    pub fn time_saved_total(&self) -> u64 {
        self.time_saved.load(Ordering::SeqCst)
    }

    // ---- transitions -----------------------------------------------------

    /// `pending -> accepted`. Accepting an already-accepted suggestion is a
    /// no-op so a double-click never errors.
    pub async fn accept(&self, suggestion_id: &str) -> Result<Suggestion, ApiError> {
        let mut state = self.state.lock().await;
        let suggestion = find_mut(&mut state.suggestions, suggestion_id)?;
        match suggestion.status {
            SuggestionStatus::Pending => {
                suggestion.status = SuggestionStatus::Accepted;
                Ok(suggestion.clone())
            }
            SuggestionStatus::Accepted => Ok(suggestion.clone()),
            status => Err(ApiError::InvalidTransition(format!(
                "cannot accept a {} suggestion",
                status.as_str()
            ))),
        }
    }

    /// `* -> rejected`; the pattern hash joins the ignore list. Rejecting
    /// an already-rejected suggestion is a no-op.
    pub async fn reject(&self, suggestion_id: &str) -> Result<Suggestion, ApiError> {
        let mut state = self.state.lock().await;
        let index = find_index(&state.suggestions, suggestion_id)?;
        if state.suggestions[index].status == SuggestionStatus::Executing {
            return Err(ApiError::InvalidTransition(
                "cannot reject a suggestion while it is executing".to_string(),
            ));
        }
        let hash = state.suggestions[index].pattern_hash.clone();
        state.ignored.insert(hash);
        state.suggestions[index].status = SuggestionStatus::Rejected;
        Ok(state.suggestions[index].clone())
    }

    /// `accepted -> explained`: store the explanation and ask the executor
    /// for a script plus summary. On model failure nothing is mutated.
    pub async fn explain(
        &self,
        suggestion_id: &str,
        explanation: String,
        executor: &ScriptExecutor,
    ) -> Result<(String, String), ApiError> {
        let (description, actions) = {
            let state = self.state.lock().await;
            let suggestion = find(&state.suggestions, suggestion_id)?;
            if suggestion.status != SuggestionStatus::Accepted {
                return Err(ApiError::InvalidTransition(format!(
                    "explanation requires an accepted suggestion, found {}",
                    suggestion.status.as_str()
                )));
            }
            (suggestion.pattern_description.clone(), suggestion.actions.clone())
        };

        let (script, summary) = executor
            .generate(&description, &explanation, &actions)
            .await?;

        let mut state = self.state.lock().await;
        let suggestion = find_mut(&mut state.suggestions, suggestion_id)?;
        if suggestion.status != SuggestionStatus::Accepted {
            return Err(ApiError::InvalidTransition(
                "suggestion changed state while the script was generated".to_string(),
            ));
        }
        suggestion.user_explanation = Some(explanation);
        suggestion.generated_script = Some(script.clone());
        suggestion.script_summary = Some(summary.clone());
        suggestion.status = SuggestionStatus::Explained;
        Ok((script, summary))
    }

    /// `explained -> explained`: replace the (script, summary) pair with a
    /// refined one. No intermediate state is ever visible.
    pub async fn refine(
        &self,
        suggestion_id: &str,
        refinement: String,
        executor: &ScriptExecutor,
    ) -> Result<(String, String), ApiError> {
        let previous_script = {
            let state = self.state.lock().await;
            let suggestion = find(&state.suggestions, suggestion_id)?;
            if suggestion.status != SuggestionStatus::Explained {
                return Err(ApiError::InvalidTransition(format!(
                    "refinement requires an explained suggestion, found {}",
                    suggestion.status.as_str()
                )));
            }
            suggestion
                .generated_script
                .clone()
                .ok_or_else(|| ApiError::Internal("explained suggestion has no script".into()))?
        };

        let (script, summary) = executor.refine(&previous_script, &refinement).await?;

        let mut state = self.state.lock().await;
        let suggestion = find_mut(&mut state.suggestions, suggestion_id)?;
        if suggestion.status != SuggestionStatus::Explained {
            return Err(ApiError::InvalidTransition(
                "suggestion changed state while the script was refined".to_string(),
            ));
        }
        suggestion.generated_script = Some(script.clone());
        suggestion.script_summary = Some(summary.clone());
        suggestion.refinement_history.push(refinement);
        Ok((script, summary))
    }

    /// `explained -> executing`; the run itself is detached and reported
    /// back through `finish_execution`. Returns as soon as the task starts.
    pub async fn confirm_and_execute(
        self: &Arc<Self>,
        suggestion_id: &str,
        executor: Arc<ScriptExecutor>,
    ) -> Result<(), ApiError> {
        let (script, explanation) = {
            let mut state = self.state.lock().await;
            let suggestion = find_mut(&mut state.suggestions, suggestion_id)?;
            if suggestion.status != SuggestionStatus::Explained {
                return Err(ApiError::InvalidTransition(format!(
                    "execution requires an explained suggestion, found {}",
                    suggestion.status.as_str()
                )));
            }
            let script = suggestion
                .generated_script
                .clone()
                .ok_or_else(|| ApiError::Internal("explained suggestion has no script".into()))?;
            suggestion.status = SuggestionStatus::Executing;
            (script, suggestion.user_explanation.clone().unwrap_or_default())
        };

        let manager = self.clone();
        let suggestion_id = suggestion_id.to_string();
        tokio::spawn(async move {
            let result = executor.execute(&script, &explanation).await;
            manager.finish_execution(&suggestion_id, result).await;
        });
        Ok(())
    }

    async fn finish_execution(&self, suggestion_id: &str, result: ExecutionResult) {
        let mut state = self.state.lock().await;
        let Ok(index) = find_index(&state.suggestions, suggestion_id) else {
            warn!("execution finished for unknown suggestion {suggestion_id}");
            return;
        };

        if result.success {
            let saved = {
                let suggestion = &mut state.suggestions[index];
                suggestion.status = SuggestionStatus::Completed;
                let saved = compute_time_saved(&suggestion.actions, &self.time_saved_config);
                suggestion.time_saved_seconds = Some(saved);
                suggestion.execution_result = Some(result);
                saved
            };
            let hash = state.suggestions[index].pattern_hash.clone();
            state.ignored.insert(hash);
            self.time_saved.fetch_add(saved, Ordering::SeqCst);
            info!("suggestion {suggestion_id} completed, {saved}s credited");
        } else {
            let suggestion = &mut state.suggestions[index];
            suggestion.status = SuggestionStatus::Failed;
            suggestion.execution_result = Some(result);
            info!("suggestion {suggestion_id} failed");
        }
    }

    pub async fn persist(&self) -> anyhow::Result<()> {
        let snapshot = {
            let state = self.state.lock().await;
            PersistedSuggestions {
                suggestions: state.suggestions.clone(),
                ignored_patterns: state.ignored.iter().cloned().collect(),
                total_time_saved_seconds: self.time_saved.load(Ordering::SeqCst),
            }
        };
        atomic_write_json(&self.path, &snapshot)
    }
}

fn find<'a>(suggestions: &'a [Suggestion], id: &str) -> Result<&'a Suggestion, ApiError> {
    suggestions
        .iter()
        .find(|s| s.suggestion_id == id)
        .ok_or_else(|| ApiError::NotFound(format!("suggestion {id}")))
}

fn find_mut<'a>(suggestions: &'a mut [Suggestion], id: &str) -> Result<&'a mut Suggestion, ApiError> {
    suggestions
        .iter_mut()
        .find(|s| s.suggestion_id == id)
        .ok_or_else(|| ApiError::NotFound(format!("suggestion {id}")))
}

fn find_index(suggestions: &[Suggestion], id: &str) -> Result<usize, ApiError> {
    suggestions
        .iter()
        .position(|s| s.suggestion_id == id)
        .ok_or_else(|| ApiError::NotFound(format!("suggestion {id}")))
}
