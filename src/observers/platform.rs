//! OS capture seam. Foreground-window queries and global key events are
//! platform services; everything above this module is platform-free and
//! driven through channels, so the capture backend can be swapped per
//! target without touching the observers.

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundWindow {
    pub app_name: String,
    pub window_title: Option<String>,
}

/// Whether this build carries a capture backend for the current target.
pub fn capture_supported() -> bool {
    false
}

/// The application currently holding focus, if a backend is wired.
pub fn foreground_window() -> Option<ForegroundWindow> {
    // TODO: wire the CGWindowList backend on macOS and the
    // GetForegroundWindow/QueryFullProcessImageName backend on Windows.
    None
}

/// Start delivering formatted key tokens (`"a"`, `"ctrl+c"`, `"alt+tab"`)
/// into `tx`. Returns false when no backend exists for this target; the
/// input monitor then stays idle.
pub fn spawn_key_listener(_tx: mpsc::UnboundedSender<String>) -> bool {
    false
}
