//! End-to-end tests of the control plane: a real listener, a scripted
//! language model, and the full suggestion dialogue driven over HTTP.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use encore::config::ConfigStore;
use encore::error::LlmError;
use encore::executor::ScriptExecutor;
use encore::llm::TextModel;
use encore::registry::{ActionSource, FileEventKind, FileOperation};
use encore::server::{build_router, AppState};
use encore::{build_state, detector};

struct CannedModel {
    responses: Mutex<VecDeque<String>>,
}

impl CannedModel {
    fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
        })
    }
}

#[async_trait]
impl TextModel for CannedModel {
    async fn ask(&self, _prompt: &str, _agent: &str) -> Result<String, LlmError> {
        let mut responses = self.responses.lock().unwrap();
        match responses.pop_front() {
            Some(text) => Ok(text),
            None => Ok("NO_PATTERN".to_string()),
        }
    }
}

struct TestServer {
    base_url: String,
    state: AppState,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
}

async fn start_server(model_responses: &[&str]) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let config_store = Arc::new(ConfigStore::load(dir.path().join("config.yaml")).unwrap());
    let mut state = build_state(dir.path(), config_store);

    // Swap in the canned model and a shell-backed executor so no network
    // and no Python are needed.
    let model: Arc<dyn TextModel> = CannedModel::new(model_responses);
    state.model.replace(model.clone());
    state.executor = Arc::new(ScriptExecutor::new(
        model,
        state.registry.clone(),
        dir.path().join("scripts"),
        "sh".to_string(),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        state,
        client: reqwest::Client::new(),
        _dir: dir,
    }
}

fn seed_rename_burst(state: &AppState, count: usize) {
    for i in 1..=count {
        let op = FileOperation {
            event_type: FileEventKind::Renamed,
            src_path: format!("/w/IMG_{i:03}.jpg"),
            dest_path: Some(format!("/w/photo_{i:03}.jpg")),
            file_extension: ".jpg".into(),
            file_size: Some(2048),
        };
        state.registry.register(
            "file_renamed",
            serde_json::to_value(&op).unwrap(),
            ActionSource::FileWatcher,
            None,
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn health_reports_ok() {
    let server = start_server(&[]).await;
    let body: serde_json::Value = server
        .client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["automation_running"], false);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_suggestion_is_404_and_bad_transition_is_409() {
    let server = start_server(&[]).await;

    let missing = server
        .client
        .post(format!("{}/automation/suggestion/nope/accept", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    // A pending suggestion cannot be explained before acceptance.
    seed_rename_burst(&server.state, 5);
    let id = server
        .state
        .suggestions
        .create("You renamed 5 files.".into(), "hash-x".into(), Vec::new())
        .await
        .unwrap()
        .suggestion_id;

    let conflict = server
        .client
        .post(format!(
            "{}/automation/suggestion/{id}/explain",
            server.base_url
        ))
        .json(&serde_json::json!({ "explanation": "rename them" }))
        .send()
        .await
        .unwrap();
    assert_eq!(conflict.status(), 409);

    // The rejected transition left no state behind.
    let status: serde_json::Value = server
        .client
        .get(format!(
            "{}/automation/suggestion/{id}/status",
            server.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "pending");
}

#[tokio::test(flavor = "multi_thread")]
async fn full_dialogue_from_detection_to_completion() {
    let server = start_server(&[
        // Detection tick.
        "You renamed 5 image files in /w. You might want to rename the rest automatically.",
        // Explain: script, then summary.
        "exit 0",
        "- Renames your remaining photos",
        // Refine: new script, new summary.
        "exit 0 # refined",
        "- Renames only PNG files",
    ])
    .await;

    seed_rename_burst(&server.state, 5);
    let suggestion_id = detector::detect_once(
        &server.state.registry,
        &server.state.suggestions,
        server.state.model.as_ref(),
    )
    .await
    .expect("detection should emit a suggestion");

    // The suggestion is visible as pending.
    let pending: serde_json::Value = server
        .client
        .get(format!("{}/automation/pending-suggestions", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pending["count"], 1);

    let url = |tail: &str| {
        format!(
            "{}/automation/suggestion/{suggestion_id}/{tail}",
            server.base_url
        )
    };

    let accept = server.client.post(url("accept")).send().await.unwrap();
    assert_eq!(accept.status(), 200);

    let explain: serde_json::Value = server
        .client
        .post(url("explain"))
        .json(&serde_json::json!({ "explanation": "rename to photo_001.jpg and so on" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(explain["script"], "exit 0");
    assert_eq!(explain["summary"], "- Renames your remaining photos");

    let refine: serde_json::Value = server
        .client
        .post(url("refine"))
        .json(&serde_json::json!({ "refinement": "only png files" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(refine["script"], "exit 0 # refined");

    let confirm: serde_json::Value = server
        .client
        .post(url("confirm-and-execute"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(confirm["status"], "executing");

    // Poll until the detached execution lands.
    let mut status = serde_json::Value::Null;
    for _ in 0..150 {
        status = server
            .client
            .get(url("status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if status["status"] != "executing" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(status["status"], "completed");
    assert_eq!(status["time_saved_seconds"], 5 * 25);

    // The credit shows up on the global counter with a display string.
    let saved: serde_json::Value = server
        .client
        .get(format!("{}/automation/time-saved", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(saved["total_seconds"], 125);
    assert_eq!(saved["display"], "2m 5s");
}

#[tokio::test(flavor = "multi_thread")]
async fn mute_endpoint_silences_detector() {
    let server = start_server(&["You renamed 5 files. You might want to automate it."]).await;

    let response = server
        .client
        .post(format!("{}/automation/mute", server.base_url))
        .json(&serde_json::json!({ "minutes": 15 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    seed_rename_burst(&server.state, 5);
    let result = detector::detect_once(
        &server.state.registry,
        &server.state.suggestions,
        server.state.model.as_ref(),
    )
    .await;
    assert!(result.is_none());

    // The registry still answers queries while muted.
    let recent: serde_json::Value = server
        .client
        .get(format!(
            "{}/automation/action-registry/recent?seconds=60",
            server.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(recent["count"], 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn config_roundtrip_and_watcher_rebuild() {
    let server = start_server(&[]).await;
    let watch_dir = tempfile::tempdir().unwrap();

    let updated: serde_json::Value = server
        .client
        .put(format!("{}/config", server.base_url))
        .json(&serde_json::json!({
            "watch_dirs": [watch_dir.path().to_string_lossy()],
            "pattern_interval_seconds": 5,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["pattern_interval_seconds"], 5);

    let fetched: serde_json::Value = server
        .client
        .get(format!("{}/config", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        fetched["watch_dirs"][0],
        watch_dir.path().to_string_lossy().as_ref()
    );

    // The rebuilt watcher registers events from the new directory.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    std::fs::write(watch_dir.path().join("fresh.txt"), b"x").unwrap();
    let mut seen = false;
    for _ in 0..40 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        if server
            .state
            .registry
            .all(50)
            .iter()
            .any(|a| a.action_type.starts_with("file_"))
        {
            seen = true;
            break;
        }
    }
    assert!(seen, "rebuilt watcher produced no events");
}

#[tokio::test(flavor = "multi_thread")]
async fn summaries_and_interactions_endpoints() {
    let server = start_server(&[]).await;

    server.state.minute_summaries.append("Minute one.".into(), 4);
    server.state.minute_summaries.append("Minute two.".into(), 3);
    server.state.interactions.record("pattern_detector", "p", "r");

    let minutes: serde_json::Value = server
        .client
        .get(format!("{}/summaries/minute?limit=1", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(minutes["count"], 1);
    assert_eq!(minutes["total_count"], 2);
    assert_eq!(minutes["summaries"][0]["summary"], "Minute two.");

    let id = minutes["summaries"][0]["id"].as_str().unwrap().to_string();
    let deleted = server
        .client
        .delete(format!("{}/summaries/minute/{id}", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);

    let missing = server
        .client
        .delete(format!("{}/summaries/minute/{id}", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let interactions: serde_json::Value = server
        .client
        .get(format!("{}/ai-interactions", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(interactions["count"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn app_usage_endpoints_share_one_ledger() {
    let server = start_server(&[]).await;
    server
        .state
        .ledger
        .accumulate("editor", 90.0, chrono::Local::now());

    let today: serde_json::Value = server
        .client
        .get(format!("{}/app-usage/today", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(today["total_seconds"], 90.0);

    let stats: serde_json::Value = server
        .client
        .get(format!("{}/app-usage/stats", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["most_used_today"], "editor");

    let hourly: serde_json::Value = server
        .client
        .get(format!("{}/app-usage/hourly", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let hours = hourly["hours"].as_object().unwrap();
    let hour_sum: f64 = hours
        .values()
        .map(|slice| slice["total_seconds"].as_f64().unwrap())
        .sum();
    assert!((hour_sum - 90.0).abs() < 1e-6);
}
