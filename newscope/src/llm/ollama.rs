use anyhow::{Context, Result};
use common::ProviderConfig;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

use super::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const PROBE_TTL: Duration = Duration::from_secs(30);

/// Local Ollama runner. Free, so it never touches the budget ledger.
pub struct OllamaProvider {
    name: String,
    config: ProviderConfig,
    client: reqwest::Client,
    /// Last `/api/tags` check: when, and the models it reported (None = unreachable)
    last_tags: Mutex<Option<(Instant, Option<Vec<String>>)>>,
}

impl OllamaProvider {
    pub fn new(name: impl Into<String>, config: ProviderConfig) -> Self {
        Self {
            name: name.into(),
            config,
            client: reqwest::Client::new(),
            last_tags: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint().trim_end_matches('/'), path)
    }

    async fn request_tags(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .context("Ollama is unreachable")?;
        if !response.status().is_success() {
            anyhow::bail!("Ollama tags error {}", response.status());
        }
        let tags: TagsResponse = response.json().await.context("Failed to parse Ollama tags")?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Probe the runner, bypassing the cache, and remember the answer.
    async fn fetch_tags(&self) -> Option<Vec<String>> {
        let models = match self.request_tags().await {
            Ok(models) => Some(models),
            Err(e) => {
                debug!(provider = %self.name, "tags request failed: {:#}", e);
                None
            }
        };
        *self.last_tags.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((Instant::now(), models.clone()));
        models
    }

    async fn cached_tags(&self) -> Option<Vec<String>> {
        let cached = self
            .last_tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|(at, _)| at.elapsed() < PROBE_TTL)
            .map(|(_, models)| models.clone());
        match cached {
            Some(models) => models,
            None => self.fetch_tags().await,
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn is_available(&self) -> bool {
        self.config.enabled && self.cached_tags().await.is_some()
    }

    async fn list_models(&self) -> Vec<String> {
        self.cached_tags()
            .await
            .unwrap_or_else(|| self.config.models.clone())
    }

    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        let req_body = GenerateRequest {
            model: &request.model,
            prompt: &request.prompt,
            stream: false,
            options: GenerateOptions {
                num_predict: request.max_tokens,
                temperature: request.temperature,
            },
        };

        let response = self
            .client
            .post(self.url("/api/generate"))
            .json(&req_body)
            .send()
            .await
            .context("Ollama HTTP request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama API error {}: {}", status, body);
        }

        let resp_body: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        Ok(LlmResponse {
            content: resp_body.response,
            usage: UsageMetadata::new(
                resp_body.prompt_eval_count.unwrap_or(0),
                resp_body.eval_count.unwrap_or(0),
            ),
            model: resp_body.model.unwrap_or(request.model),
        })
    }

    async fn health_check(&self) -> bool {
        self.fetch_tags().await.is_some()
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_predict: usize,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    model: Option<String>,
    response: String,
    prompt_eval_count: Option<usize>,
    eval_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}
