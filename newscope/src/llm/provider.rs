//! Closed set of provider backends behind the `LlmProvider` trait.

use anyhow::{Context, Result};
use common::{ProviderConfig, ProviderKind};

use super::anthropic::AnthropicProvider;
use super::gemini::GeminiProvider;
use super::ollama::OllamaProvider;
use super::remote::RemoteLlmProvider;
use super::{LlmProvider, LlmRequest, LlmResponse, SummaryOptions, SummaryResult};

pub enum ProviderBackend {
    Ollama(OllamaProvider),
    OpenAi(RemoteLlmProvider),
    Anthropic(AnthropicProvider),
    Gemini(GeminiProvider),
}

macro_rules! dispatch {
    ($self:expr, $p:ident => $body:expr) => {
        match $self {
            ProviderBackend::Ollama($p) => $body,
            ProviderBackend::OpenAi($p) => $body,
            ProviderBackend::Anthropic($p) => $body,
            ProviderBackend::Gemini($p) => $body,
        }
    };
}

impl ProviderBackend {
    /// Build the adapter for one validated config entry.
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self> {
        config
            .validate()
            .with_context(|| format!("provider '{}' is misconfigured", name))?;

        // validate() guarantees hosted kinds resolve to a key
        let api_key = config.resolve_api_key()?.unwrap_or_default();
        let config = config.clone();
        let backend = match config.kind {
            ProviderKind::Ollama => Self::Ollama(OllamaProvider::new(name, config)),
            ProviderKind::OpenAi => Self::OpenAi(RemoteLlmProvider::new(name, config, api_key)),
            ProviderKind::Anthropic => Self::Anthropic(AnthropicProvider::new(name, config, api_key)),
            ProviderKind::Gemini => Self::Gemini(GeminiProvider::new(name, config, api_key)),
        };
        Ok(backend)
    }

    pub fn kind(&self) -> ProviderKind {
        self.config().kind
    }
}

#[async_trait::async_trait]
impl LlmProvider for ProviderBackend {
    fn name(&self) -> &str {
        dispatch!(self, p => p.name())
    }

    fn config(&self) -> &ProviderConfig {
        dispatch!(self, p => p.config())
    }

    async fn is_available(&self) -> bool {
        dispatch!(self, p => p.is_available().await)
    }

    async fn list_models(&self) -> Vec<String> {
        dispatch!(self, p => p.list_models().await)
    }

    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        dispatch!(self, p => p.generate(request).await)
    }

    async fn health_check(&self) -> bool {
        dispatch!(self, p => p.health_check().await)
    }

    async fn summarize(
        &self,
        text: &str,
        model: Option<&str>,
        options: &SummaryOptions,
    ) -> SummaryResult {
        dispatch!(self, p => p.summarize(text, model, options).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: ProviderKind) -> ProviderConfig {
        let mut config = ProviderConfig::new(kind);
        config.models = vec!["m".into()];
        config
    }

    #[test]
    fn builds_each_kind() {
        let local = ProviderBackend::from_config("local", &config(ProviderKind::Ollama)).expect("ollama");
        assert_eq!(local.kind(), ProviderKind::Ollama);
        assert_eq!(local.name(), "local");

        for kind in [ProviderKind::OpenAi, ProviderKind::Anthropic, ProviderKind::Gemini] {
            let mut cfg = config(kind);
            cfg.api_key = Some("key".into());
            let backend = ProviderBackend::from_config("hosted", &cfg).expect("hosted");
            assert_eq!(backend.kind(), kind);
        }
    }

    #[test]
    fn hosted_without_credential_is_rejected() {
        let err = ProviderBackend::from_config("openai", &config(ProviderKind::OpenAi))
            .err()
            .expect("missing key must fail");
        let msg = format!("{:#}", err);
        assert!(msg.contains("openai"));
        assert!(msg.contains("credential"));
    }
}
