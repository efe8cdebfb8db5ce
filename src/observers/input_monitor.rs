//! Keyboard observer: buffers key tokens from the platform bridge and
//! flushes them into the registry as one `key_sequence` action per burst.

use log::info;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::registry::{ActionRegistry, ActionSource, KeySequence};

const IDLE_FLUSH_SECS: f64 = 3.0;
const MAX_BUFFER_TOKENS: usize = 64;
const RECENT_KEYS_CAP: usize = 30;

/// Chorded shortcuts treated as meaningful work by the pattern detector.
pub const KNOWN_SHORTCUTS: &[&str] = &[
    "ctrl+c", "ctrl+v", "ctrl+x", "ctrl+z", "ctrl+y", "ctrl+s", "ctrl+a", "ctrl+f", "ctrl+n",
    "ctrl+o", "ctrl+w", "cmd+c", "cmd+v", "cmd+x", "cmd+z", "cmd+s", "alt+tab", "alt+f4",
];

pub fn is_shortcut_token(token: &str) -> bool {
    let lowered = token.to_ascii_lowercase();
    KNOWN_SHORTCUTS.contains(&lowered.as_str())
}

/// Does a space-joined key string contain any recognised shortcut?
pub fn contains_shortcut(keys: &str) -> bool {
    keys.split_whitespace().any(is_shortcut_token)
}

/// Count copy -> paste pairs across a key string, in order.
pub fn copy_paste_cycles(keys: &str) -> usize {
    let mut cycles = 0;
    let mut copied = false;
    for token in keys.split_whitespace() {
        match token.to_ascii_lowercase().as_str() {
            "ctrl+c" | "cmd+c" => copied = true,
            "ctrl+v" | "cmd+v" if copied => {
                cycles += 1;
                copied = false;
            }
            _ => {}
        }
    }
    cycles
}

/// Rolling view of the last keys for the current-activity endpoint.
#[derive(Default)]
pub struct RecentKeys {
    keys: Mutex<VecDeque<String>>,
}

impl RecentKeys {
    pub fn push(&self, token: &str) {
        let mut keys = self.keys.lock().unwrap();
        keys.push_back(token.to_string());
        while keys.len() > RECENT_KEYS_CAP {
            keys.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.keys.lock().unwrap().iter().cloned().collect()
    }
}

struct KeyBuffer {
    tokens: Vec<String>,
    opened_at: Option<Instant>,
    last_key_at: Option<Instant>,
}

impl KeyBuffer {
    fn new() -> Self {
        Self {
            tokens: Vec::new(),
            opened_at: None,
            last_key_at: None,
        }
    }

    fn push(&mut self, token: String) {
        let now = Instant::now();
        if self.tokens.is_empty() {
            self.opened_at = Some(now);
        }
        self.last_key_at = Some(now);
        self.tokens.push(token);
    }

    fn is_full(&self) -> bool {
        self.tokens.len() >= MAX_BUFFER_TOKENS
    }

    fn idle_deadline(&self) -> Option<Instant> {
        self.last_key_at
            .map(|at| at + tokio::time::Duration::from_secs_f64(IDLE_FLUSH_SECS))
    }

    fn take(&mut self, app_name: Option<String>) -> Option<KeySequence> {
        if self.tokens.is_empty() {
            return None;
        }
        let duration_ms = self
            .opened_at
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let keys = self.tokens.join(" ");
        self.tokens.clear();
        self.opened_at = None;
        self.last_key_at = None;
        Some(KeySequence {
            keys,
            duration_ms,
            app_name,
        })
    }
}

fn flush(buffer: &mut KeyBuffer, registry: &ActionRegistry, app_name: Option<String>) {
    if let Some(sequence) = buffer.take(app_name) {
        registry.register(
            "key_sequence",
            serde_json::to_value(&sequence).unwrap_or_default(),
            ActionSource::InputMonitor,
            None,
        );
    }
}

/// Consume key tokens and focus transitions; flush the buffer on focus
/// change, on three idle seconds, or when it reaches 64 tokens.
pub async fn input_loop(
    registry: Arc<ActionRegistry>,
    mut key_rx: mpsc::UnboundedReceiver<String>,
    mut focus_rx: watch::Receiver<Option<String>>,
    recent: Arc<RecentKeys>,
    cancel: CancellationToken,
) {
    let mut buffer = KeyBuffer::new();

    loop {
        let idle_deadline = buffer.idle_deadline();
        let current_app = focus_rx.borrow().clone();

        tokio::select! {
            maybe_key = key_rx.recv() => {
                match maybe_key {
                    Some(token) => {
                        recent.push(&token);
                        buffer.push(token);
                        if buffer.is_full() {
                            flush(&mut buffer, &registry, current_app);
                        }
                    }
                    None => {
                        flush(&mut buffer, &registry, current_app);
                        info!("key event source closed; input monitor stopping");
                        break;
                    }
                }
            }
            changed = focus_rx.changed() => {
                // Flush under the app that was focused while typing.
                flush(&mut buffer, &registry, current_app);
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(idle_deadline.unwrap_or_else(Instant::now)),
                if idle_deadline.is_some() =>
            {
                flush(&mut buffer, &registry, current_app);
            }
            _ = cancel.cancelled() => {
                flush(&mut buffer, &registry, current_app);
                break;
            }
        }
    }
}
