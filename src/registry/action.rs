use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which component produced an action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionSource {
    FileWatcher,
    InputMonitor,
    AppTracker,
    Automation,
}

impl ActionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionSource::FileWatcher => "file_watcher",
            ActionSource::InputMonitor => "input_monitor",
            ActionSource::AppTracker => "app_tracker",
            ActionSource::Automation => "automation",
        }
    }

    /// Sources silenced while an automation script is running. App usage
    /// keeps flowing; the detector never treats it as substantive input.
    pub fn quarantined(&self) -> bool {
        matches!(self, ActionSource::FileWatcher | ActionSource::InputMonitor)
    }
}

/// One observed, normalised event. Read-only once admitted to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: u64,
    pub timestamp: f64,
    pub action_type: String,
    pub source: ActionSource,
    pub details: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Action {
    pub fn file_operation(&self) -> Option<FileOperation> {
        if !self.action_type.starts_with("file_") {
            return None;
        }
        serde_json::from_value(self.details.clone()).ok()
    }

    pub fn key_sequence(&self) -> Option<KeySequence> {
        if self.action_type != "key_sequence" {
            return None;
        }
        serde_json::from_value(self.details.clone()).ok()
    }
}

/// Canonical filesystem event kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileEventKind {
    Created,
    Modified,
    Moved,
    Deleted,
    Renamed,
}

impl FileEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEventKind::Created => "created",
            FileEventKind::Modified => "modified",
            FileEventKind::Moved => "moved",
            FileEventKind::Deleted => "deleted",
            FileEventKind::Renamed => "renamed",
        }
    }

    /// The `file_created` / `file_renamed` / ... action type tag.
    pub fn action_type(&self) -> String {
        format!("file_{}", self.as_str())
    }
}

/// Details payload for filesystem actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOperation {
    pub event_type: FileEventKind,
    pub src_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_path: Option<String>,
    #[serde(default)]
    pub file_extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

/// Details payload for a flushed keyboard buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySequence {
    /// Space-joined tokens, e.g. `"ctrl+c alt+tab h e l l o"`.
    pub keys: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
}

/// Details payload for a foreground-application change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppFocus {
    pub app_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_title: Option<String>,
}
