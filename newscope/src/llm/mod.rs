use anyhow::Result;
use common::ProviderConfig;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

pub mod anthropic;
pub mod budget;
pub mod gemini;
pub mod health;
pub mod ollama;
pub mod provider;
pub mod registry;
pub mod remote;
pub mod summarizer;
pub mod text;

pub use provider::ProviderBackend;

const DEFAULT_MAX_TOKENS: usize = 300;
const DEFAULT_TEMPERATURE: f32 = 0.3;

/// Core trait for LLM providers (local or remote)
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Configured provider name
    fn name(&self) -> &str;

    fn config(&self) -> &ProviderConfig;

    /// Cheap reachability/configuration check
    async fn is_available(&self) -> bool;

    async fn list_models(&self) -> Vec<String> {
        self.config().models.clone()
    }

    /// Generate completion for a given prompt
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse>;

    /// One lightweight round trip to the backend
    async fn health_check(&self) -> bool;

    /// Summarize `text`, never failing: every fault is mapped onto a failed `SummaryResult`.
    async fn summarize(
        &self,
        text: &str,
        model: Option<&str>,
        options: &SummaryOptions,
    ) -> SummaryResult {
        let config = self.config();
        let started = Instant::now();

        let Some(model) = config.resolve_model(model).map(str::to_string) else {
            return SummaryResult::failed(self.name(), None, "no model configured", started.elapsed());
        };

        let request = LlmRequest {
            prompt: build_summary_prompt(text),
            model: model.clone(),
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        };
        let timeout = options
            .timeout
            .map_or(config.timeout(), |t| t.min(config.timeout()));

        let outcome = tokio::time::timeout(timeout, self.generate(request)).await;
        let latency = started.elapsed();

        let response = match outcome {
            Err(_) => {
                return SummaryResult::failed(self.name(), Some(&model), "request timed out", latency)
            }
            Ok(Err(e)) => {
                return SummaryResult::failed(self.name(), Some(&model), format!("{:#}", e), latency)
            }
            Ok(Ok(response)) => response,
        };

        let content = text::clean_model_output(&response.content);
        if content.is_empty() {
            return SummaryResult::failed(self.name(), Some(&model), "empty summary in response", latency);
        }

        let usage = response.usage;
        // Priced by the requested model: vendors often echo a dated variant
        let cost = config.cost_for(&model, usage.prompt_tokens, usage.completion_tokens);
        debug!(provider = %self.name(), model = %response.model, cost, "summary generated");

        SummaryResult::succeeded(self.name(), &response.model, content, &usage, cost, latency)
    }
}

/// Request structure for LLM generation
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub model: String,
    pub max_tokens: usize,
    pub temperature: f32,
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl UsageMetadata {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Per-call knobs. Unset values fall back to the `[llm.summary]` defaults.
#[derive(Debug, Clone, Default)]
pub struct SummaryOptions {
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    /// Caller deadline for a single provider attempt
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct SummaryRequest {
    pub text: String,
    /// Model override, honored by providers that list it
    pub model: Option<String>,
    /// Provider to try first when it is usable
    pub preferred_provider: Option<String>,
    pub options: SummaryOptions,
}

impl SummaryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn prefer(mut self, provider: impl Into<String>) -> Self {
        self.preferred_provider = Some(provider.into());
        self
    }

    pub fn with_options(mut self, options: SummaryOptions) -> Self {
        self.options = options;
        self
    }
}

/// Outcome of one summarization request.
///
/// `success` implies a non-empty `summary` with `provider` and `model` set. A fallback
/// result carries the locally computed summary with `success == false` and `fallback == true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResult {
    pub summary: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cost: f64,
    pub latency_ms: u64,
    pub success: bool,
    pub fallback: bool,
    pub error: Option<String>,
}

pub const FALLBACK_PROVIDER: &str = "fallback";

impl SummaryResult {
    fn succeeded(
        provider: &str,
        model: &str,
        summary: String,
        usage: &UsageMetadata,
        cost: f64,
        latency: Duration,
    ) -> Self {
        Self {
            summary: Some(summary),
            provider: Some(provider.to_string()),
            model: Some(model.to_string()),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cost,
            latency_ms: latency.as_millis() as u64,
            success: true,
            fallback: false,
            error: None,
        }
    }

    pub fn failed(
        provider: &str,
        model: Option<&str>,
        error: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            summary: None,
            provider: Some(provider.to_string()),
            model: model.map(str::to_string),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            latency_ms: latency.as_millis() as u64,
            success: false,
            fallback: false,
            error: Some(error.into()),
        }
    }

    pub fn fallback(summary: String, error: impl Into<String>, latency: Duration) -> Self {
        Self {
            summary: Some(summary),
            provider: Some(FALLBACK_PROVIDER.to_string()),
            model: None,
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            latency_ms: latency.as_millis() as u64,
            success: false,
            fallback: true,
            error: Some(error.into()),
        }
    }

    /// Summary text, empty for failed provider attempts
    pub fn content(&self) -> &str {
        self.summary.as_deref().unwrap_or_default()
    }
}

/// Rough token count (4 chars per token), used for budget estimates.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

pub(crate) fn build_summary_prompt(content: &str) -> String {
    format!(
        r#"You are a news article summarizer. Write a concise, factual summary.

IMPORTANT INSTRUCTIONS:
1. IGNORE all markdown formatting and tables - extract only text content
2. Write 2-3 plain sentences covering the key points of the ENTIRE article
3. Do not list raw figures or price movements unless they are the story
4. KEEP THE ORIGINAL LANGUAGE - do not translate
5. Output only the summary, with no preamble

ARTICLE TO SUMMARIZE:
{}
"#,
        content
    )
}
