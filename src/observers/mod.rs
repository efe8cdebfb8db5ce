pub mod app_usage;
pub mod file_watcher;
pub mod input_monitor;
pub mod platform;

pub use app_usage::AppUsageLedger;
pub use file_watcher::FileWatcherController;
pub use input_monitor::RecentKeys;
