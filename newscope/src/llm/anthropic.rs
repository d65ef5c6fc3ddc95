use anyhow::{Context, Result};
use common::ProviderConfig;
use serde::{Deserialize, Serialize};

use super::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API provider
pub struct AnthropicProvider {
    name: String,
    config: ProviderConfig,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(name: impl Into<String>, config: ProviderConfig, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config,
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn models_url(&self) -> String {
        let endpoint = self.config.endpoint().trim_end_matches('/');
        match endpoint.strip_suffix("/messages") {
            Some(root) => format!("{}/models", root),
            None => format!("{}/models", endpoint),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
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
        let req_body = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: vec![InputMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .client
            .post(self.config.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req_body)
            .send()
            .await
            .context("Anthropic HTTP request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic API error {}: {}", status, body);
        }

        let resp_body: MessagesResponse = response
            .json()
            .await
            .context("Failed to parse Anthropic response")?;

        let content: String = resp_body
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        if content.trim().is_empty() {
            anyhow::bail!("Anthropic response has no text content");
        }

        let usage = resp_body
            .usage
            .map(|u| UsageMetadata::new(u.input_tokens, u.output_tokens))
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
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .send(),
        )
        .await;
        matches!(response, Ok(Ok(r)) if r.status().is_success())
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    temperature: f32,
    messages: Vec<InputMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct InputMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: usize,
    #[serde(default)]
    output_tokens: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ProviderKind;

    #[test]
    fn models_url_from_messages_endpoint() {
        let mut config = ProviderConfig::new(ProviderKind::Anthropic);
        config.models = vec!["claude-3-5-haiku-latest".into()];
        let provider = AnthropicProvider::new("anthropic", config, "key");
        assert_eq!(provider.models_url(), "https://api.anthropic.com/v1/models");
    }
}
