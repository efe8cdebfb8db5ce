//! Rolling activity summaries: a minute-granularity worker and a
//! ten-minute-granularity worker, both narrating recent registry activity
//! through the language model.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::llm::TextModel;
use crate::registry::{Action, ActionRegistry};
use crate::util::{atomic_write_json, load_json_or_default, now_ts};

const MINUTE_TICK_SECS: u64 = 60;
const TEN_MINUTE_TICK_SECS: u64 = 600;
const MIN_ACTIONS_FOR_SUMMARY: usize = 3;
const STORE_CAP: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub id: String,
    pub timestamp: f64,
    pub summary: String,
    pub action_count: usize,
}

/// Bounded, persisted list of summary records.
pub struct SummaryStore {
    entries: Mutex<Vec<SummaryRecord>>,
    path: PathBuf,
}

impl SummaryStore {
    pub fn load(path: PathBuf) -> Self {
        let mut entries: Vec<SummaryRecord> = load_json_or_default(&path);
        if entries.len() > STORE_CAP {
            let excess = entries.len() - STORE_CAP;
            entries.drain(..excess);
        }
        Self {
            entries: Mutex::new(entries),
            path,
        }
    }

    pub fn append(&self, summary: String, action_count: usize) -> SummaryRecord {
        let record = SummaryRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: now_ts(),
            summary,
            action_count,
        };
        let mut entries = self.entries.lock().unwrap();
        entries.push(record.clone());
        if entries.len() > STORE_CAP {
            entries.remove(0);
        }
        record
    }

    /// Newest first.
    pub fn snapshot(&self, limit: usize) -> Vec<SummaryRecord> {
        let entries = self.entries.lock().unwrap();
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Oldest first, most recent `count` records.
    pub fn tail(&self, count: usize) -> Vec<SummaryRecord> {
        let entries = self.entries.lock().unwrap();
        let start = entries.len().saturating_sub(count);
        entries[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn delete(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|record| record.id != id);
        entries.len() < before
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn persist(&self) -> anyhow::Result<()> {
        let snapshot = self.entries.lock().unwrap().clone();
        atomic_write_json(&self.path, &snapshot)
    }
}

fn describe_action(action: &Action) -> String {
    if let Some(op) = action.file_operation() {
        format!("{} {}", op.event_type.as_str(), op.src_path)
    } else if let Some(sequence) = action.key_sequence() {
        format!("typed: {}", sequence.keys)
    } else if action.action_type == "app_focus" {
        format!(
            "switched to {}",
            action
                .details
                .get("app_name")
                .and_then(|v| v.as_str())
                .unwrap_or("an application")
        )
    } else {
        action.action_type.clone()
    }
}

fn minute_prompt(actions: &[Action]) -> String {
    let mut lines = vec![
        "Summarise this user's last minute of desktop activity in one or".to_string(),
        "two plain sentences, past tense, no preamble.".to_string(),
        String::new(),
    ];
    for action in actions {
        lines.push(format!("- {}", describe_action(action)));
    }
    lines.join("\n")
}

fn ten_minute_prompt(minute_summaries: &[SummaryRecord], fallback_actions: &[Action]) -> String {
    let mut lines = vec![
        "Write a short narrative (3-4 sentences) of the user's last ten".to_string(),
        "minutes of desktop activity, based on these notes. Plain language,".to_string(),
        "past tense, no preamble.".to_string(),
        String::new(),
    ];
    if minute_summaries.is_empty() {
        for action in fallback_actions {
            lines.push(format!("- {}", describe_action(action)));
        }
    } else {
        for record in minute_summaries {
            lines.push(format!("- {}", record.summary));
        }
    }
    lines.join("\n")
}

/// One minute-granularity pass; appends a record when the window is busy
/// enough. Exposed for tests; the loop below drives it.
pub async fn minute_tick(
    registry: &ActionRegistry,
    store: &SummaryStore,
    model: &dyn TextModel,
) -> Option<SummaryRecord> {
    let window = registry.recent(MINUTE_TICK_SECS as f64);
    if window.len() < MIN_ACTIONS_FOR_SUMMARY {
        debug!("minute summary skipped, only {} actions", window.len());
        return None;
    }
    match model.ask(&minute_prompt(&window), "minute_summarizer").await {
        Ok(text) => Some(store.append(text.trim().to_string(), window.len())),
        Err(err) => {
            warn!("minute summary failed, skipping tick: {err}");
            None
        }
    }
}

/// One ten-minute pass over recent minute summaries (or raw actions when
/// none exist yet).
pub async fn ten_minute_tick(
    registry: &ActionRegistry,
    minute_store: &SummaryStore,
    ten_store: &SummaryStore,
    model: &dyn TextModel,
) -> Option<SummaryRecord> {
    let cutoff = now_ts() - TEN_MINUTE_TICK_SECS as f64;
    let recent_minutes: Vec<SummaryRecord> = minute_store
        .tail(10)
        .into_iter()
        .filter(|record| record.timestamp >= cutoff)
        .collect();

    let fallback = if recent_minutes.is_empty() {
        registry.recent(TEN_MINUTE_TICK_SECS as f64)
    } else {
        Vec::new()
    };
    let total_actions: usize = if recent_minutes.is_empty() {
        fallback.len()
    } else {
        recent_minutes.iter().map(|record| record.action_count).sum()
    };
    if total_actions < MIN_ACTIONS_FOR_SUMMARY {
        return None;
    }

    let prompt = ten_minute_prompt(&recent_minutes, &fallback);
    match model.ask(&prompt, "ten_minute_summarizer").await {
        Ok(text) => Some(ten_store.append(text.trim().to_string(), total_actions)),
        Err(err) => {
            warn!("ten-minute summary failed, skipping tick: {err}");
            None
        }
    }
}

pub async fn minute_loop(
    registry: Arc<ActionRegistry>,
    store: Arc<SummaryStore>,
    model: Arc<dyn TextModel>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(Duration::from_secs(MINUTE_TICK_SECS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                minute_tick(&registry, &store, model.as_ref()).await;
                if let Err(err) = store.persist() {
                    warn!("minute summary flush failed: {err:#}");
                }
            }
            _ = cancel.cancelled() => {
                if let Err(err) = store.persist() {
                    warn!("final minute summary flush failed: {err:#}");
                }
                break;
            }
        }
    }
}

pub async fn ten_minute_loop(
    registry: Arc<ActionRegistry>,
    minute_store: Arc<SummaryStore>,
    ten_store: Arc<SummaryStore>,
    model: Arc<dyn TextModel>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(Duration::from_secs(TEN_MINUTE_TICK_SECS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                ten_minute_tick(&registry, &minute_store, &ten_store, model.as_ref()).await;
                if let Err(err) = ten_store.persist() {
                    warn!("ten-minute summary flush failed: {err:#}");
                }
            }
            _ = cancel.cancelled() => {
                if let Err(err) = ten_store.persist() {
                    warn!("final ten-minute summary flush failed: {err:#}");
                }
                break;
            }
        }
    }
}
