use serde::{Deserialize, Serialize};

use crate::llm::{SummaryResult, FALLBACK_PROVIDER};

/// Article record handed over by the ingestion side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub full_text: String,
}

impl Article {
    pub fn new(
        title: impl Into<String>,
        source: impl Into<String>,
        full_text: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            source: source.into(),
            full_text: full_text.into(),
        }
    }

    /// Text sent for summarization; the title when the body is empty.
    pub fn summary_input(&self) -> &str {
        if self.full_text.trim().is_empty() {
            &self.title
        } else {
            &self.full_text
        }
    }
}

/// Article augmented with its summary and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizedArticle {
    #[serde(flatten)]
    pub article: Article,
    pub summary: String,
    pub summary_provider: String,
    pub summary_model: Option<String>,
    pub summary_cost: f64,
    pub summary_latency_ms: u64,
    pub summary_success: bool,
    pub summary_fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_error: Option<String>,
}

impl SummarizedArticle {
    pub fn new(article: Article, result: SummaryResult) -> Self {
        Self {
            article,
            summary: result.content().to_string(),
            summary_provider: result
                .provider
                .unwrap_or_else(|| FALLBACK_PROVIDER.to_string()),
            summary_model: result.model,
            summary_cost: result.cost,
            summary_latency_ms: result.latency_ms,
            summary_success: result.success,
            summary_fallback: result.fallback,
            summary_error: result.error,
        }
    }
}
