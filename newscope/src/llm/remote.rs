use anyhow::{Context, Result};
use common::ProviderConfig;
use serde::{Deserialize, Serialize};

use super::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};

/// Remote LLM provider using OpenAI-compatible HTTP API
pub struct RemoteLlmProvider {
    name: String,
    config: ProviderConfig,
    api_key: String,
    client: reqwest::Client,
}

impl RemoteLlmProvider {
    pub fn new(name: impl Into<String>, config: ProviderConfig, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config,
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Infer the model listing URL from the chat endpoint.
    /// e.g. http://localhost:11434/v1/chat/completions -> http://localhost:11434/v1/models
    fn models_url(&self) -> String {
        let base_url = self.config.endpoint().trim_end_matches('/');
        if let Some(root) = base_url.strip_suffix("/chat/completions") {
            format!("{}/models", root)
        } else if let Some(root) = base_url.strip_suffix("/completions") {
            format!("{}/models", root)
        } else {
            format!("{}/models", base_url)
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for RemoteLlmProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn is_available(&self) -> bool {
        self.config.enabled && !self.api_key.is_empty()
    }

    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        // Build OpenAI-compatible request
        let req_body = OpenAiRequest {
            model: request.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: Some(request.prompt),
            }],
            max_tokens: Some(request.max_tokens),
            temperature: Some(request.temperature),
        };

        let response = self
            .client
            .post(self.config.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&req_body)
            .send()
            .await
            .context("LLM HTTP request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {}: {}", status, body);
        }

        let resp_body: OpenAiResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let choice = resp_body
            .choices
            .first()
            .context("LLM response has no choices")?;

        let content = choice
            .message
            .content
            .clone()
            .context("LLM response choice has no content")?;

        let usage = resp_body
            .usage
            .map(|u| UsageMetadata::new(u.prompt_tokens.unwrap_or(0), u.completion_tokens.unwrap_or(0)))
            .unwrap_or_default();

        Ok(LlmResponse {
            content,
            usage,
            model: resp_body.model.unwrap_or(request.model),
        })
    }

    async fn health_check(&self) -> bool {
        let response = tokio::time::timeout(
            self.config.timeout(),
            self.client
                .get(self.models_url())
                .header("Authorization", format!("Bearer {}", self.api_key))
                .send(),
        )
        .await;
        matches!(response, Ok(Ok(r)) if r.status().is_success())
    }
}

// OpenAI API request/response structures
#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<usize>,
    #[serde(default)]
    completion_tokens: Option<usize>,
}
