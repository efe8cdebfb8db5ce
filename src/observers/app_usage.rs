//! Foreground-application usage ledger. The tracker polls the platform
//! bridge once a second and attributes elapsed time to hour buckets, so a
//! day's total always equals the sum of its hours.

use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::registry::{ActionRegistry, ActionSource, AppFocus};
use crate::util::atomic_write_json;

const POLL_INTERVAL_SECS: u64 = 1;
const SAVE_INTERVAL_SECS: u64 = 60;
const RETENTION_DAYS: i64 = 30;

/// Usage for one day (or one hour of one day): app -> seconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSlice {
    pub usage: HashMap<String, f64>,
    pub total_seconds: f64,
}

impl UsageSlice {
    fn add(&mut self, app: &str, seconds: f64) {
        *self.usage.entry(app.to_string()).or_insert(0.0) += seconds;
        self.total_seconds += seconds;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub total_today: f64,
    pub most_used_today: Option<String>,
    pub apps_tracked: usize,
    pub current_app: Option<String>,
}

/// date -> hour ("00".."23") -> app -> seconds
type HourlyData = HashMap<String, HashMap<String, HashMap<String, f64>>>;

struct LedgerState {
    days: HourlyData,
    current_app: Option<String>,
}

pub struct AppUsageLedger {
    state: Mutex<LedgerState>,
    path: PathBuf,
}

impl AppUsageLedger {
    pub fn load(path: PathBuf) -> Self {
        let days = match std::fs::read_to_string(&path) {
            Ok(contents) => parse_persisted(&contents).unwrap_or_else(|err| {
                warn!("ignoring corrupt app usage file {}: {err}", path.display());
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        if !days.is_empty() {
            info!("app usage ledger loaded {} days", days.len());
        }
        Self {
            state: Mutex::new(LedgerState {
                days,
                current_app: None,
            }),
            path,
        }
    }

    /// Attribute `seconds` of `app` usage to the hour bucket containing `at`.
    pub fn accumulate(&self, app: &str, seconds: f64, at: DateTime<Local>) {
        if seconds <= 0.0 {
            return;
        }
        let date = at.format("%Y-%m-%d").to_string();
        let hour = format!("{:02}", at.hour());
        let mut state = self.state.lock().unwrap();
        *state
            .days
            .entry(date)
            .or_default()
            .entry(hour)
            .or_default()
            .entry(app.to_string())
            .or_insert(0.0) += seconds;
    }

    pub fn set_current_app(&self, app: Option<String>) {
        self.state.lock().unwrap().current_app = app;
    }

    pub fn current_app(&self) -> Option<String> {
        self.state.lock().unwrap().current_app.clone()
    }

    pub fn day(&self, date: &str) -> UsageSlice {
        let state = self.state.lock().unwrap();
        let mut slice = UsageSlice::default();
        if let Some(hours) = state.days.get(date) {
            for apps in hours.values() {
                for (app, seconds) in apps {
                    slice.add(app, *seconds);
                }
            }
        }
        slice
    }

    pub fn today(&self) -> UsageSlice {
        self.day(&Local::now().format("%Y-%m-%d").to_string())
    }

    /// The last 7 days that have data, keyed by date.
    pub fn week(&self) -> HashMap<String, UsageSlice> {
        let mut out = HashMap::new();
        for offset in 0..7 {
            let date = (Local::now() - ChronoDuration::days(offset))
                .format("%Y-%m-%d")
                .to_string();
            let slice = self.day(&date);
            if !slice.usage.is_empty() {
                out.insert(date, slice);
            }
        }
        out
    }

    /// Hour -> usage for one date. Only hours with data appear.
    pub fn hourly(&self, date: &str) -> HashMap<String, UsageSlice> {
        let state = self.state.lock().unwrap();
        let mut out = HashMap::new();
        if let Some(hours) = state.days.get(date) {
            for (hour, apps) in hours {
                let mut slice = UsageSlice::default();
                for (app, seconds) in apps {
                    slice.add(app, *seconds);
                }
                out.insert(hour.clone(), slice);
            }
        }
        out
    }

    pub fn stats(&self) -> UsageStats {
        let today = self.today();
        let most_used_today = today
            .usage
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(app, _)| app.clone());
        let state = self.state.lock().unwrap();
        let mut apps: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for hours in state.days.values() {
            for bucket in hours.values() {
                apps.extend(bucket.keys().map(|s| s.as_str()));
            }
        }
        UsageStats {
            total_today: today.total_seconds,
            most_used_today,
            apps_tracked: apps.len(),
            current_app: state.current_app.clone(),
        }
    }

    /// Persist in the documented shape, pruning entries past retention.
    pub fn persist(&self) -> anyhow::Result<()> {
        let cutoff = (Local::now() - ChronoDuration::days(RETENTION_DAYS))
            .format("%Y-%m-%d")
            .to_string();
        let days_snapshot = {
            let mut state = self.state.lock().unwrap();
            state.days.retain(|date, _| date.as_str() >= cutoff.as_str());
            state.days.clone()
        };

        let mut days = serde_json::Map::new();
        for (date, hours) in &days_snapshot {
            let mut day_apps: HashMap<&str, f64> = HashMap::new();
            let mut hours_json = serde_json::Map::new();
            let mut day_total = 0.0;
            for (hour, apps) in hours {
                let hour_total: f64 = apps.values().sum();
                day_total += hour_total;
                for (app, seconds) in apps {
                    *day_apps.entry(app.as_str()).or_insert(0.0) += seconds;
                }
                hours_json.insert(hour.clone(), json!({ "apps": apps, "total": hour_total }));
            }
            days.insert(
                date.clone(),
                json!({ "apps": day_apps, "hours": hours_json, "total": day_total }),
            );
        }
        atomic_write_json(&self.path, &json!({ "days": days }))
    }
}

#[derive(Debug, Deserialize)]
struct PersistedLedger {
    #[serde(default)]
    days: HashMap<String, PersistedDay>,
}

#[derive(Debug, Deserialize)]
struct PersistedDay {
    #[serde(default)]
    hours: HashMap<String, PersistedHour>,
}

#[derive(Debug, Deserialize)]
struct PersistedHour {
    #[serde(default)]
    apps: HashMap<String, f64>,
}

fn parse_persisted(contents: &str) -> anyhow::Result<HourlyData> {
    let parsed: PersistedLedger = serde_json::from_str(contents)?;
    let mut days: HourlyData = HashMap::new();
    for (date, day) in parsed.days {
        let hours = days.entry(date).or_default();
        for (hour, bucket) in day.hours {
            hours.insert(hour, bucket.apps);
        }
    }
    Ok(days)
}

/// Poll the foreground application, feed the ledger, publish focus changes
/// and register `app_focus` actions. Persists once a minute and on shutdown.
pub async fn tracker_loop(
    ledger: Arc<AppUsageLedger>,
    registry: Arc<ActionRegistry>,
    focus_tx: watch::Sender<Option<String>>,
    cancel: CancellationToken,
) {
    if !super::platform::capture_supported() {
        warn!("no foreground-window backend on this target; app usage tracking idle");
        cancel.cancelled().await;
        return;
    }

    let mut ticker = interval(Duration::from_secs(POLL_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_tick = tokio::time::Instant::now();
    let mut ticks_since_save: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let elapsed = last_tick.elapsed().as_secs_f64();
                last_tick = tokio::time::Instant::now();

                let window = super::platform::foreground_window();
                let app_name = window.as_ref().map(|w| clean_app_name(&w.app_name));

                if let Some(app) = &app_name {
                    ledger.accumulate(app, elapsed.min(POLL_INTERVAL_SECS as f64 * 2.0), Local::now());
                }

                if app_name != ledger.current_app() {
                    ledger.set_current_app(app_name.clone());
                    let _ = focus_tx.send(app_name.clone());
                    if let Some(window) = window {
                        let focus = AppFocus {
                            app_name: clean_app_name(&window.app_name),
                            window_title: window.window_title,
                        };
                        registry.register(
                            "app_focus",
                            serde_json::to_value(&focus).unwrap_or_default(),
                            ActionSource::AppTracker,
                            None,
                        );
                    }
                }

                ticks_since_save += 1;
                if ticks_since_save >= SAVE_INTERVAL_SECS {
                    ticks_since_save = 0;
                    if let Err(err) = ledger.persist() {
                        warn!("app usage flush failed: {err:#}");
                    }
                }
            }
            _ = cancel.cancelled() => {
                if let Err(err) = ledger.persist() {
                    warn!("final app usage flush failed: {err:#}");
                }
                break;
            }
        }
    }
}

/// Strip the Windows-style executable suffix.
fn clean_app_name(name: &str) -> String {
    let lowered = name.to_ascii_lowercase();
    if lowered.ends_with(".exe") {
        name[..name.len() - 4].to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ledger() -> AppUsageLedger {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app_usage.json");
        std::mem::forget(dir);
        AppUsageLedger::load(path)
    }

    fn at(date: &str, hour: u32, minute: u32) -> DateTime<Local> {
        let naive = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap();
        Local.from_local_datetime(&naive).unwrap()
    }

    #[test]
    fn day_total_equals_sum_of_hours() {
        let ledger = ledger();
        // 65 minutes of editor use spanning an hour boundary.
        for minute in 0..35 {
            ledger.accumulate("editor", 60.0, at("2026-07-01", 9, 25 + minute));
        }
        for minute in 0..30 {
            ledger.accumulate("editor", 60.0, at("2026-07-01", 10, minute));
        }

        let day = ledger.day("2026-07-01");
        assert!((day.total_seconds - 65.0 * 60.0).abs() < 1.0);

        let hourly = ledger.hourly("2026-07-01");
        assert_eq!(hourly.len(), 2);
        let hour_sum: f64 = hourly.values().map(|slice| slice.total_seconds).sum();
        assert!((day.total_seconds - hour_sum).abs() < 1e-6);
    }

    #[test]
    fn stats_reports_most_used() {
        let ledger = ledger();
        let now = Local::now();
        ledger.accumulate("browser", 120.0, now);
        ledger.accumulate("terminal", 300.0, now);
        ledger.set_current_app(Some("terminal".into()));

        let stats = ledger.stats();
        assert_eq!(stats.most_used_today.as_deref(), Some("terminal"));
        assert_eq!(stats.apps_tracked, 2);
        assert_eq!(stats.current_app.as_deref(), Some("terminal"));
        assert!((stats.total_today - 420.0).abs() < 1e-6);
    }

    #[test]
    fn persist_round_trip_keeps_hour_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app_usage.json");

        let ledger = AppUsageLedger::load(path.clone());
        let now = Local::now();
        ledger.accumulate("mail", 90.0, now);
        ledger.persist().unwrap();

        let reloaded = AppUsageLedger::load(path);
        let today = reloaded.today();
        assert!((today.total_seconds - 90.0).abs() < 1e-6);
        assert_eq!(today.usage.len(), 1);
    }

    #[test]
    fn week_skips_empty_days() {
        let ledger = ledger();
        ledger.accumulate("ide", 45.0, Local::now());
        let week = ledger.week();
        assert_eq!(week.len(), 1);
    }

    #[test]
    fn exe_suffix_is_stripped() {
        assert_eq!(clean_app_name("notepad.exe"), "notepad");
        assert_eq!(clean_app_name("Safari"), "Safari");
    }
}
