//! Short-term pattern detector: a periodic worker that inspects the recent
//! action window, pre-filters noise, and asks the model whether the window
//! holds an automatable pattern.

use chrono::{Local, TimeZone};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::llm::TextModel;
use crate::observers::input_monitor::{contains_shortcut, copy_paste_cycles};
use crate::registry::{Action, ActionRegistry};
use crate::suggestions::SuggestionManager;

pub const DETECT_WINDOW_SECS: f64 = 20.0;
pub const MIN_ACTIONS: usize = 3;
pub const MIN_SUBSTANTIVE: usize = 2;
const MIN_SUBSTANTIVE_BURST: usize = 5;
const MIN_IDENTICAL_FILE_OPS: usize = 3;
const MIN_COPY_PASTE_CYCLES: usize = 2;

pub const NO_PATTERN: &str = "NO_PATTERN";

/// Meaningful work: any filesystem event, or a key sequence containing a
/// recognised shortcut.
pub fn is_substantive(action: &Action) -> bool {
    if action.action_type.starts_with("file_") {
        return true;
    }
    if let Some(sequence) = action.key_sequence() {
        return contains_shortcut(&sequence.keys);
    }
    false
}

/// Cheap gate that keeps obvious noise away from the model.
pub fn prefilter(actions: &[Action]) -> bool {
    if actions.len() < MIN_ACTIONS {
        return false;
    }

    let substantive: Vec<&Action> = actions.iter().filter(|a| is_substantive(a)).collect();
    if substantive.len() < MIN_SUBSTANTIVE {
        return false;
    }
    if actions.iter().all(|a| a.action_type == "app_focus") {
        return false;
    }

    // Same operation on the same kind of file, several times over.
    let mut op_groups: HashMap<(String, String), usize> = HashMap::new();
    for action in actions {
        if let Some(op) = action.file_operation() {
            *op_groups
                .entry((op.event_type.as_str().to_string(), op.file_extension))
                .or_insert(0) += 1;
        }
    }
    if op_groups.values().any(|count| *count >= MIN_IDENTICAL_FILE_OPS) {
        return true;
    }

    // Repeated copy/paste cycling across key sequences.
    let cycles: usize = actions
        .iter()
        .filter_map(|a| a.key_sequence())
        .map(|sequence| copy_paste_cycles(&sequence.keys))
        .sum();
    if cycles >= MIN_COPY_PASTE_CYCLES {
        return true;
    }

    substantive.len() >= MIN_SUBSTANTIVE_BURST
}

/// Stable fingerprint over the (event_type, file_extension) tuple sequence.
pub fn pattern_hash(actions: &[Action]) -> String {
    let mut hasher = Sha256::new();
    for action in actions {
        if let Some(op) = action.file_operation() {
            hasher.update(op.event_type.as_str().as_bytes());
            hasher.update(b":");
            hasher.update(op.file_extension.as_bytes());
            hasher.update(b";");
        } else {
            hasher.update(action.action_type.as_bytes());
            hasher.update(b";");
        }
    }
    hex::encode(&hasher.finalize()[..8])
}

fn format_clock(timestamp: f64) -> String {
    Local
        .timestamp_opt(timestamp as i64, 0)
        .single()
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{timestamp:.0}"))
}

/// Compact action listing plus the answer contract.
pub fn build_prompt(actions: &[Action]) -> String {
    let mut lines = vec![
        "You watch a user's recent desktop activity and decide whether it".to_string(),
        "contains a short repetitive workflow worth automating.".to_string(),
        String::new(),
        "Real patterns: several file operations of the same kind in one".to_string(),
        "directory (renaming, moving, organising), or repeated copy/paste".to_string(),
        "between two applications. Noise: window switching on its own,".to_string(),
        "isolated single operations, browsing.".to_string(),
        String::new(),
        format!("If there is NO real pattern, answer exactly: {NO_PATTERN}"),
        "If there IS one, answer with a single line of the form:".to_string(),
        "You <verb> <count> <noun> in <directory-or-context>. You might want to <proposal>.".to_string(),
        String::new(),
        format!("Recent actions (last {DETECT_WINDOW_SECS:.0} seconds):"),
    ];
    for (index, action) in actions.iter().enumerate() {
        let detail = if let Some(op) = action.file_operation() {
            format!(
                "{} {} {}",
                op.event_type.as_str(),
                op.src_path,
                op.dest_path.unwrap_or_default()
            )
        } else if let Some(sequence) = action.key_sequence() {
            format!("keys: {}", sequence.keys)
        } else {
            action.details.to_string()
        };
        lines.push(format!(
            "{}. [{}] {} - {}",
            index + 1,
            format_clock(action.timestamp),
            action.action_type,
            detail
        ));
    }
    lines.join("\n")
}

/// One detection pass over the registry's recent window. Returns the id of
/// a created suggestion, if any.
pub async fn detect_once(
    registry: &ActionRegistry,
    suggestions: &Arc<SuggestionManager>,
    model: &dyn TextModel,
) -> Option<String> {
    if suggestions.is_muted().await {
        debug!("detector muted, skipping tick");
        return None;
    }
    if suggestions.in_cooldown().await {
        debug!("detector in cooldown, skipping tick");
        return None;
    }

    let actions = registry.recent(DETECT_WINDOW_SECS);
    if !prefilter(&actions) {
        return None;
    }

    let prompt = build_prompt(&actions);
    let response = match model.ask(&prompt, "pattern_detector").await {
        Ok(response) => response,
        Err(err) => {
            warn!("pattern detection call failed, treating as no pattern: {err}");
            return None;
        }
    };

    let description = response.trim();
    if description.is_empty() || description.contains(NO_PATTERN) {
        return None;
    }

    let hash = pattern_hash(&actions);
    if suggestions.is_ignored(&hash).await {
        debug!("pattern {hash} is on the ignore list");
        return None;
    }

    let created = suggestions
        .create(description.to_string(), hash, actions)
        .await?;
    info!("pattern detected: {}", created.pattern_description);
    Some(created.suggestion_id)
}

/// Periodic detector worker.
pub async fn detection_loop(
    registry: Arc<ActionRegistry>,
    suggestions: Arc<SuggestionManager>,
    model: Arc<dyn TextModel>,
    interval_seconds: u64,
    cancel: CancellationToken,
) {
    let mut ticker = interval(Duration::from_secs(interval_seconds.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _ = detect_once(&registry, &suggestions, model.as_ref()).await;
            }
            _ = cancel.cancelled() => break,
        }
    }
}
