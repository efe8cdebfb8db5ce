//! Central action registry: every observer hands its normalised events to
//! this bounded, time-ordered store. Readers always get snapshot copies.

mod action;

pub use action::{Action, ActionSource, AppFocus, FileEventKind, FileOperation, KeySequence};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::util::{atomic_write_json, load_json_or_default, now_ts};

const PERSIST_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedRegistry {
    next_id: u64,
    actions: Vec<Action>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_type: HashMap<String, usize>,
    pub by_source: HashMap<String, usize>,
    pub dropped_while_automating: u64,
}

struct RegistryState {
    actions: VecDeque<Action>,
    next_id: u64,
}

pub struct ActionRegistry {
    state: Mutex<RegistryState>,
    capacity: usize,
    automation_running: AtomicBool,
    dropped: AtomicU64,
    path: PathBuf,
}

impl ActionRegistry {
    pub fn new(capacity: usize, path: PathBuf) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                actions: VecDeque::with_capacity(capacity.min(1024)),
                next_id: 1,
            }),
            capacity: capacity.max(1),
            automation_running: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            path,
        }
    }

    /// Load persisted actions and resume the id counter. Missing or corrupt
    /// state starts empty.
    pub fn load(capacity: usize, path: PathBuf) -> Self {
        let persisted: PersistedRegistry = load_json_or_default(&path);
        let registry = Self::new(capacity, path);
        if !persisted.actions.is_empty() || persisted.next_id > 1 {
            let mut state = registry.state.lock().unwrap();
            let max_id = persisted.actions.iter().map(|a| a.id).max().unwrap_or(0);
            state.next_id = persisted.next_id.max(max_id + 1);
            for action in persisted.actions {
                state.actions.push_back(action);
            }
            while state.actions.len() > registry.capacity {
                state.actions.pop_front();
            }
            info!(
                "action registry loaded {} actions (next id {})",
                state.actions.len(),
                state.next_id
            );
        }
        registry
    }

    /// Admit a new action. Returns the assigned id, or `None` when the event
    /// arrives from a quarantined source while an automation script is
    /// running — those are dropped so the system's own activity is never
    /// mistaken for a user pattern.
    pub fn register(
        &self,
        action_type: &str,
        details: Value,
        source: ActionSource,
        metadata: Option<Value>,
    ) -> Option<u64> {
        if self.is_automation_running() && source.quarantined() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("dropped {action_type} from {} during automation", source.as_str());
            return None;
        }

        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.actions.push_back(Action {
            id,
            timestamp: now_ts(),
            action_type: action_type.to_string(),
            source,
            details,
            metadata,
        });
        while state.actions.len() > self.capacity {
            state.actions.pop_front();
        }
        Some(id)
    }

    /// Actions with timestamp >= now - window, oldest first.
    pub fn recent(&self, window_seconds: f64) -> Vec<Action> {
        let cutoff = now_ts() - window_seconds;
        let state = self.state.lock().unwrap();
        state
            .actions
            .iter()
            .filter(|a| a.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Newest-first slice of at most `limit` actions.
    pub fn all(&self, limit: usize) -> Vec<Action> {
        let state = self.state.lock().unwrap();
        state.actions.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock().unwrap();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut by_source: HashMap<String, usize> = HashMap::new();
        for action in &state.actions {
            *by_type.entry(action.action_type.clone()).or_insert(0) += 1;
            *by_source.entry(action.source.as_str().to_string()).or_insert(0) += 1;
        }
        RegistryStats {
            total: state.actions.len(),
            by_type,
            by_source,
            dropped_while_automating: self.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn is_automation_running(&self) -> bool {
        self.automation_running.load(Ordering::SeqCst)
    }

    /// Set or clear the quarantine flag. Only the executor calls this.
    pub fn set_automation_running(&self, running: bool) {
        self.automation_running.store(running, Ordering::SeqCst);
    }

    pub fn persist(&self) -> anyhow::Result<()> {
        let snapshot = {
            let state = self.state.lock().unwrap();
            PersistedRegistry {
                next_id: state.next_id,
                actions: state.actions.iter().cloned().collect(),
            }
        };
        atomic_write_json(&self.path, &snapshot)
    }
}

/// Background flush loop: every 30 s and once more when cancelled.
pub async fn persistence_loop(registry: std::sync::Arc<ActionRegistry>, cancel: CancellationToken) {
    let mut ticker = interval(Duration::from_secs(PERSIST_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = registry.persist() {
                    warn!("registry flush failed: {err:#}");
                }
            }
            _ = cancel.cancelled() => {
                if let Err(err) = registry.persist() {
                    warn!("final registry flush failed: {err:#}");
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_registry(capacity: usize) -> ActionRegistry {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        // Keep the tempdir alive by leaking it; each test process is short-lived.
        std::mem::forget(dir);
        ActionRegistry::new(capacity, path)
    }

    fn register_simple(registry: &ActionRegistry, action_type: &str) -> Option<u64> {
        registry.register(
            action_type,
            serde_json::json!({}),
            ActionSource::FileWatcher,
            None,
        )
    }

    #[test]
    fn ids_strictly_increase_and_timestamps_follow() {
        let registry = test_registry(100);
        for _ in 0..10 {
            register_simple(&registry, "file_created");
        }
        let actions = registry.recent(60.0);
        for pair in actions.windows(2) {
            assert!(pair[0].id < pair[1].id);
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn over_capacity_evicts_exactly_one_oldest_per_insert() {
        let registry = test_registry(3);
        for _ in 0..3 {
            register_simple(&registry, "file_created");
        }
        assert_eq!(registry.len(), 3);
        register_simple(&registry, "file_created");
        assert_eq!(registry.len(), 3);
        let oldest_id = registry.recent(60.0).first().unwrap().id;
        assert_eq!(oldest_id, 2);
    }

    #[test]
    fn quarantine_drops_observer_sources_only() {
        let registry = test_registry(10);
        registry.set_automation_running(true);

        assert!(register_simple(&registry, "file_created").is_none());
        assert!(registry
            .register("key_sequence", serde_json::json!({}), ActionSource::InputMonitor, None)
            .is_none());
        assert!(registry
            .register("app_focus", serde_json::json!({}), ActionSource::AppTracker, None)
            .is_some());
        assert!(registry
            .register("script_run", serde_json::json!({}), ActionSource::Automation, None)
            .is_some());

        registry.set_automation_running(false);
        assert!(register_simple(&registry, "file_created").is_some());
        assert_eq!(registry.stats().dropped_while_automating, 2);
    }

    #[test]
    fn recent_zero_window_is_empty() {
        let registry = test_registry(10);
        register_simple(&registry, "file_created");
        assert!(registry.recent(0.0).is_empty());
        assert_eq!(registry.recent(1e9).len(), 1);
    }

    #[test]
    fn all_returns_newest_first() {
        let registry = test_registry(10);
        for _ in 0..5 {
            register_simple(&registry, "file_created");
        }
        let slice = registry.all(3);
        assert_eq!(slice.len(), 3);
        assert!(slice[0].id > slice[1].id);
    }

    #[test]
    fn persist_and_reload_resumes_id_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let registry = ActionRegistry::new(10, path.clone());
        for _ in 0..4 {
            register_simple(&registry, "file_modified");
        }
        registry.persist().unwrap();

        let reloaded = ActionRegistry::load(10, path);
        assert_eq!(reloaded.len(), 4);
        let next = register_simple(&reloaded, "file_modified").unwrap();
        assert_eq!(next, 5);
    }

    #[test]
    fn load_from_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ActionRegistry::load(10, dir.path().join("absent.json"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn concurrent_registration_keeps_ids_unique() {
        let registry = Arc::new(test_registry(1000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    registry.register(
                        "file_created",
                        serde_json::json!({}),
                        ActionSource::FileWatcher,
                        None,
                    );
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let actions = registry.all(1000);
        let mut ids: Vec<u64> = actions.iter().map(|a| a.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 400);
    }
}
