use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::util::{atomic_write_json, load_json_or_default, now_ts};

/// Keep the log small; it exists for observability, not as a dataset.
const MAX_INTERACTIONS: usize = 500;

/// One prompt/response exchange with the language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiInteraction {
    pub timestamp: f64,
    pub agent: String,
    pub prompt: String,
    pub response: String,
}

/// Append-only interaction log with a soft cap, mirrored to disk.
pub struct InteractionLog {
    entries: Mutex<Vec<AiInteraction>>,
    path: PathBuf,
}

impl InteractionLog {
    pub fn load(path: PathBuf) -> Self {
        let mut entries: Vec<AiInteraction> = load_json_or_default(&path);
        if entries.len() > MAX_INTERACTIONS {
            let excess = entries.len() - MAX_INTERACTIONS;
            entries.drain(..excess);
        }
        Self {
            entries: Mutex::new(entries),
            path,
        }
    }

    pub fn record(&self, agent: &str, prompt: &str, response: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.push(AiInteraction {
            timestamp: now_ts(),
            agent: agent.to_string(),
            prompt: prompt.to_string(),
            response: response.to_string(),
        });
        if entries.len() > MAX_INTERACTIONS {
            entries.remove(0);
        }
    }

    /// Newest first.
    pub fn snapshot(&self, limit: usize) -> Vec<AiInteraction> {
        let entries = self.entries.lock().unwrap();
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn persist(&self) -> anyhow::Result<()> {
        let snapshot = self.entries.lock().unwrap().clone();
        atomic_write_json(&self.path, &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_snapshot_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = InteractionLog::load(dir.path().join("ai.json"));
        log.record("detector", "p1", "r1");
        log.record("detector", "p2", "r2");
        let snapshot = log.snapshot(10);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].prompt, "p2");
    }

    #[test]
    fn soft_cap_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let log = InteractionLog::load(dir.path().join("ai.json"));
        for i in 0..(MAX_INTERACTIONS + 10) {
            log.record("a", &format!("p{i}"), "r");
        }
        assert_eq!(log.len(), MAX_INTERACTIONS);
        let oldest = log.snapshot(MAX_INTERACTIONS).pop().unwrap();
        assert_eq!(oldest.prompt, "p10");
    }

    #[test]
    fn persist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ai.json");
        let log = InteractionLog::load(path.clone());
        log.record("summariser", "prompt", "response");
        log.persist().unwrap();

        let reloaded = InteractionLog::load(path);
        assert_eq!(reloaded.len(), 1);
    }
}
