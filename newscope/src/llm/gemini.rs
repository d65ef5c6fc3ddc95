use anyhow::{Context, Result};
use common::ProviderConfig;
use serde::{Deserialize, Serialize};

use super::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};

/// Google Gemini `generateContent` provider
pub struct GeminiProvider {
    name: String,
    config: ProviderConfig,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(name: impl Into<String>, config: ProviderConfig, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config,
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn base_url(&self) -> &str {
        self.config.endpoint().trim_end_matches('/')
    }

    fn generate_url(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.base_url(), model)
    }
}

#[async_trait::async_trait]
impl LlmProvider for GeminiProvider {
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
        let req_body = GenerateRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: Some(request.prompt),
                }],
            }],
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
            },
        };

        let response = self
            .client
            .post(self.generate_url(&request.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&req_body)
            .send()
            .await
            .context("Gemini HTTP request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini API error {}: {}", status, body);
        }

        let resp_body: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse Gemini response")?;

        let candidate = resp_body
            .candidates
            .first()
            .context("Gemini response has no candidates")?;
        let content = candidate
            .content
            .as_ref()
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .filter(|text| !text.trim().is_empty())
            .context("Gemini candidate has no text")?;

        let usage = resp_body
            .usage_metadata
            .map(|u| UsageMetadata::new(u.prompt_token_count, u.candidates_token_count))
            .unwrap_or_default();

        Ok(LlmResponse {
            content,
            usage,
            model: resp_body.model_version.unwrap_or(request.model),
        })
    }

    async fn health_check(&self) -> bool {
        let response = tokio::time::timeout(
            self.config.timeout(),
            self.client
                .get(format!("{}/models", self.base_url()))
                .header("x-goog-api-key", &self.api_key)
                .send(),
        )
        .await;
        matches!(response, Ok(Ok(r)) if r.status().is_success())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: usize,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageCounts>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageCounts {
    #[serde(default)]
    prompt_token_count: usize,
    #[serde(default)]
    candidates_token_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ProviderKind;

    #[test]
    fn generate_url_embeds_model() {
        let mut config = ProviderConfig::new(ProviderKind::Gemini);
        config.api_url = Some("https://generativelanguage.googleapis.com/v1beta/".into());
        config.models = vec!["gemini-2.0-flash".into()];
        let provider = GeminiProvider::new("gemini", config, "key");
        assert_eq!(
            provider.generate_url("gemini-2.0-flash"),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }
}
