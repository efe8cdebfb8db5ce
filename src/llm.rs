//! Language-model capability. Pattern detection, script generation,
//! refinement and summarisation all go through the one `TextModel`
//! operation; callers differ only in prompt text and agent tag.

use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::LlmError;
use crate::interactions::InteractionLog;

const REQUEST_TIMEOUT_SECS: u64 = 30;
const MAX_TRIES: u32 = 3;
const BACKOFF_BASE_MS: u64 = 250;

#[async_trait]
pub trait TextModel: Send + Sync {
    /// One text-in/text-out exchange. The agent tag only labels the
    /// interaction log entry.
    async fn ask(&self, prompt: &str, agent: &str) -> Result<String, LlmError>;
}

/// Gemini `generateContent` REST client.
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    interactions: Arc<InteractionLog>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String, interactions: Arc<InteractionLog>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            model,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            interactions,
        }
    }

    async fn request_once(&self, prompt: &str) -> Result<String, LlmError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
        };

        let response = self.client.post(&url).json(&body).send().await.map_err(|err| {
            if err.is_timeout() {
                LlmError::Timeout(REQUEST_TIMEOUT_SECS)
            } else {
                LlmError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(text)
    }
}

#[async_trait]
impl TextModel for GeminiClient {
    async fn ask(&self, prompt: &str, agent: &str) -> Result<String, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::Unconfigured);
        }

        let mut last_err = LlmError::EmptyResponse;
        for attempt in 1..=MAX_TRIES {
            match self.request_once(prompt).await {
                Ok(text) => {
                    self.interactions.record(agent, prompt, &text);
                    return Ok(text);
                }
                Err(err) => {
                    if err.is_retryable() && attempt < MAX_TRIES {
                        let backoff = BACKOFF_BASE_MS * 2u64.pow(attempt - 1);
                        warn!("{agent} call failed (attempt {attempt}/{MAX_TRIES}): {err}; retrying in {backoff}ms");
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                        last_err = err;
                    } else {
                        self.interactions
                            .record(agent, prompt, &format!("[error] {err}"));
                        return Err(err);
                    }
                }
            }
        }
        self.interactions
            .record(agent, prompt, &format!("[error] {last_err}"));
        Err(last_err)
    }
}

/// Rebuildable handle so a config change can swap in a client with new
/// credentials without restarting the workers that hold the handle.
pub struct ModelHandle {
    inner: std::sync::RwLock<Arc<dyn TextModel>>,
}

impl ModelHandle {
    pub fn new(model: Arc<dyn TextModel>) -> Self {
        Self {
            inner: std::sync::RwLock::new(model),
        }
    }

    pub fn current(&self) -> Arc<dyn TextModel> {
        self.inner.read().unwrap().clone()
    }

    pub fn replace(&self, model: Arc<dyn TextModel>) {
        info!("language model client rebuilt");
        *self.inner.write().unwrap() = model;
    }
}

#[async_trait]
impl TextModel for ModelHandle {
    async fn ask(&self, prompt: &str, agent: &str) -> Result<String, LlmError> {
        let model = self.current();
        model.ask(prompt, agent).await
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted model for tests: pops canned responses in order, then
    /// repeats the last one. Records every prompt it saw.
    pub struct ScriptedModel {
        responses: Mutex<VecDeque<Result<String, ()>>>,
        fallback: String,
        pub prompts: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedModel {
        pub fn new<I: IntoIterator<Item = &'static str>>(responses: I) -> Self {
            Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|r| Ok(r.to_string()))
                        .collect(),
                ),
                fallback: "NO_PATTERN".to_string(),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                responses: Mutex::new(VecDeque::from([Err(())])),
                fallback: String::new(),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TextModel for ScriptedModel {
        async fn ask(&self, prompt: &str, agent: &str) -> Result<String, LlmError> {
            self.prompts
                .lock()
                .unwrap()
                .push((agent.to_string(), prompt.to_string()));
            let mut responses = self.responses.lock().unwrap();
            match responses.pop_front() {
                Some(Ok(text)) => {
                    if responses.is_empty() {
                        responses.push_back(Ok(text.clone()));
                    }
                    Ok(text)
                }
                Some(Err(())) => {
                    responses.push_back(Err(()));
                    Err(LlmError::Provider {
                        status: 500,
                        message: "scripted failure".into(),
                    })
                }
                None => Ok(self.fallback.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_client_fails_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let interactions = Arc::new(InteractionLog::load(dir.path().join("ai.json")));
        let client = GeminiClient::new(String::new(), "gemini-2.5-flash-lite".into(), interactions);
        let err = client.ask("hello", "test").await.unwrap_err();
        assert!(matches!(err, LlmError::Unconfigured));
    }

    #[tokio::test]
    async fn scripted_model_replays_in_order() {
        let model = testing::ScriptedModel::new(["first", "second"]);
        assert_eq!(model.ask("a", "t").await.unwrap(), "first");
        assert_eq!(model.ask("b", "t").await.unwrap(), "second");
        // Last response repeats.
        assert_eq!(model.ask("c", "t").await.unwrap(), "second");
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn handle_swaps_model() {
        let handle = ModelHandle::new(Arc::new(testing::ScriptedModel::new(["one"])));
        assert_eq!(handle.ask("p", "t").await.unwrap(), "one");
        handle.replace(Arc::new(testing::ScriptedModel::new(["two"])));
        assert_eq!(handle.ask("p", "t").await.unwrap(), "two");
    }
}
