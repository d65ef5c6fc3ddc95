/*!
common/src/lib.rs

Shared configuration types and DB helper functions for Newscope.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader for a TOML config file, with default/override merging
- Load-time validation of the LLM section
- A helper to initialize an SQLite connection pool
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/newscope.db")
    pub path: String,
}

/// Backend family of a configured provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Locally hosted Ollama runner (free)
    Ollama,
    /// Any OpenAI-compatible chat completions endpoint
    OpenAi,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }

    pub fn default_api_url(self) -> &'static str {
        match self {
            Self::Ollama => "http://localhost:11434",
            Self::OpenAi => "https://api.openai.com/v1/chat/completions",
            Self::Anthropic => "https://api.anthropic.com/v1/messages",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        }
    }

    /// Local runners cost nothing and never touch the budget ledger.
    pub fn is_local(self) -> bool {
        matches!(self, Self::Ollama)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-model pricing, expressed per million tokens in a currency-agnostic unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    #[serde(default)]
    pub input_per_million: f64,
    #[serde(default)]
    pub output_per_million: f64,
}

impl ModelRate {
    pub fn cost(&self, input_tokens: usize, output_tokens: usize) -> f64 {
        (input_tokens as f64 * self.input_per_million
            + output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

/// One `[llm.providers.<name>]` entry. The name is the table key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Endpoint; falls back to the kind's public default
    pub api_url: Option<String>,
    /// Inline credential (takes precedence over `api_key_env`)
    pub api_key: Option<String>,
    /// Name of the environment variable holding the credential
    pub api_key_env: Option<String>,
    pub timeout_seconds: Option<u64>,
    /// Supported models, the first one is the default
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub pricing: BTreeMap<String, ModelRate>,
    /// Lower ranks are tried first when health scores tie
    pub priority: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            enabled: true,
            api_url: None,
            api_key: None,
            api_key_env: None,
            timeout_seconds: None,
            models: Vec::new(),
            pricing: BTreeMap::new(),
            priority: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.api_url
            .as_deref()
            .unwrap_or_else(|| self.kind.default_api_url())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    pub fn is_free(&self) -> bool {
        self.kind.is_local()
    }

    pub fn default_model(&self) -> Option<&str> {
        self.models.first().map(String::as_str)
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Requested model if this provider lists it, otherwise the default one.
    pub fn resolve_model<'a>(&'a self, requested: Option<&'a str>) -> Option<&'a str> {
        match requested {
            Some(m) if self.supports_model(m) => Some(m),
            _ => self.default_model(),
        }
    }

    /// Cost of a call. Local providers are always free; unpriced models cost nothing.
    pub fn cost_for(&self, model: &str, input_tokens: usize, output_tokens: usize) -> f64 {
        if self.is_free() {
            return 0.0;
        }
        self.pricing
            .get(model)
            .map(|rate| rate.cost(input_tokens, output_tokens))
            .unwrap_or(0.0)
    }

    /// Resolve the credential reference.
    ///
    /// Returns `Ok(None)` when no credential is configured at all, and an error when
    /// `api_key_env` names a variable that is not set or is blank.
    pub fn resolve_api_key(&self) -> Result<Option<String>> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return Ok(Some(key.to_string()));
        }
        match self.api_key_env.as_deref() {
            Some(var) => {
                let key = std::env::var(var)
                    .with_context(|| format!("API key env var '{}' not set", var))?;
                if key.trim().is_empty() {
                    anyhow::bail!("API key env var '{}' is empty", var);
                }
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    /// Check this entry on its own. Failures disable the provider, not the whole config.
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            anyhow::bail!("no models configured");
        }
        if self.models.iter().any(|m| m.trim().is_empty()) {
            anyhow::bail!("empty model identifier");
        }
        url::Url::parse(self.endpoint())
            .with_context(|| format!("invalid api_url '{}'", self.endpoint()))?;
        if self.timeout_seconds == Some(0) {
            anyhow::bail!("timeout_seconds must be greater than zero");
        }
        for (model, rate) in &self.pricing {
            let valid = |v: f64| v.is_finite() && v >= 0.0;
            if !valid(rate.input_per_million) || !valid(rate.output_per_million) {
                anyhow::bail!("invalid pricing for model '{}'", model);
            }
        }
        if !self.kind.is_local() && self.resolve_api_key()?.is_none() {
            anyhow::bail!("missing credential (set api_key or api_key_env)");
        }
        Ok(())
    }
}

/// Daily and monthly spend caps. A missing cap means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub daily_limit: Option<f64>,
    pub monthly_limit: Option<f64>,
}

/// Smoothing parameters for provider health scores
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Weight kept from the previous score on every update
    pub decay: f64,
    /// Providers scoring below this are deprioritized
    pub floor: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            decay: 0.8,
            floor: 0.2,
        }
    }
}

/// Defaults applied to every summary request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub max_tokens: usize,
    pub temperature: f32,
    /// Character cap of the local extractive fallback
    pub fallback_max_chars: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            max_tokens: 300,
            temperature: 0.3,
            fallback_max_chars: 300,
        }
    }
}

/// LLM section: providers plus the policies shared between them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Explicit ranking by provider name, overriding `priority`
    #[serde(default)]
    pub fallback_order: Vec<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
}

fn default_max_concurrency() -> usize {
    4
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: BTreeMap::new(),
            fallback_order: Vec::new(),
            max_concurrency: default_max_concurrency(),
            budget: BudgetConfig::default(),
            health: HealthConfig::default(),
            summary: SummaryConfig::default(),
        }
    }
}

impl LlmConfig {
    /// Validate the shared policies. Individual providers are checked by the registry.
    pub fn validate(&self) -> Result<()> {
        for (field, cap) in [
            ("llm.budget.daily_limit", self.budget.daily_limit),
            ("llm.budget.monthly_limit", self.budget.monthly_limit),
        ] {
            if let Some(v) = cap {
                if !v.is_finite() || v < 0.0 {
                    anyhow::bail!("{} must be a non-negative number, got {}", field, v);
                }
            }
        }
        if !(self.health.decay > 0.0 && self.health.decay < 1.0) {
            anyhow::bail!("llm.health.decay must be in (0, 1), got {}", self.health.decay);
        }
        if !(0.0..=1.0).contains(&self.health.floor) {
            anyhow::bail!("llm.health.floor must be in [0, 1], got {}", self.health.floor);
        }
        if self.max_concurrency == 0 {
            anyhow::bail!("llm.max_concurrency must be at least 1");
        }
        if self.summary.max_tokens == 0 {
            anyhow::bail!("llm.summary.max_tokens must be at least 1");
        }
        if self.summary.fallback_max_chars == 0 {
            anyhow::bail!("llm.summary.fallback_max_chars must be at least 1");
        }
        Ok(())
    }
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if path.exists() {
                let data = tokio::fs::read_to_string(path).await
                    .with_context(|| format!("Failed to read config: {}", path.display()))?;
                let val: toml::Value = toml::from_str(&data)
                    .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
                merge_toml(&mut config_value, val);
            }
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.llm.validate().context("Invalid [llm] configuration")
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Initialize an SQLite connection pool.
///
/// This function will create the parent directory if necessary and return a configured
/// `SqlitePool` in WAL mode. Schema creation is left to the caller.
///
/// Example:
///   let pool = init_db_pool("data/newscope.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create DB parent directory: {}", parent.display())
        })?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [database]
        path = "data/test.db"

        [llm]
        fallback_order = ["local", "openai"]

        [llm.budget]
        daily_limit = 1.5

        [llm.providers.local]
        kind = "ollama"
        models = ["llama3.2"]

        [llm.providers.openai]
        kind = "openai"
        api_key = "sk-test"
        models = ["gpt-4o-mini", "gpt-4o"]
        priority = 2

        [llm.providers.openai.pricing."gpt-4o-mini"]
        input_per_million = 0.15
        output_per_million = 0.60
    "#;

    #[test]
    fn parses_llm_section_with_defaults() {
        let cfg: Config = toml::from_str(SAMPLE).expect("parse config");
        cfg.validate().expect("valid");

        assert_eq!(cfg.llm.providers.len(), 2);
        assert_eq!(cfg.llm.fallback_order, vec!["local", "openai"]);
        assert_eq!(cfg.llm.budget.daily_limit, Some(1.5));
        assert_eq!(cfg.llm.budget.monthly_limit, None);
        assert_eq!(cfg.llm.max_concurrency, 4);
        assert_eq!(cfg.llm.health.decay, 0.8);
        assert_eq!(cfg.llm.summary.fallback_max_chars, 300);

        let openai = &cfg.llm.providers["openai"];
        assert_eq!(openai.kind, ProviderKind::OpenAi);
        assert!(openai.enabled);
        assert_eq!(openai.endpoint(), "https://api.openai.com/v1/chat/completions");
        assert_eq!(openai.timeout(), Duration::from_secs(30));
        assert_eq!(openai.priority, Some(2));
    }

    #[test]
    fn cost_uses_per_million_rates_and_local_is_free() {
        let cfg: Config = toml::from_str(SAMPLE).expect("parse config");
        let openai = &cfg.llm.providers["openai"];

        let cost = openai.cost_for("gpt-4o-mini", 1_000_000, 1_000_000);
        assert!((cost - 0.75).abs() < 1e-12);
        // unpriced model
        assert_eq!(openai.cost_for("gpt-4o", 1000, 1000), 0.0);

        let mut local = cfg.llm.providers["local"].clone();
        local.pricing.insert("llama3.2".into(), ModelRate { input_per_million: 5.0, output_per_million: 5.0 });
        assert_eq!(local.cost_for("llama3.2", 1000, 1000), 0.0);
    }

    #[test]
    fn resolve_model_prefers_supported_request() {
        let cfg: Config = toml::from_str(SAMPLE).expect("parse config");
        let openai = &cfg.llm.providers["openai"];
        assert_eq!(openai.resolve_model(Some("gpt-4o")), Some("gpt-4o"));
        assert_eq!(openai.resolve_model(Some("claude-3")), Some("gpt-4o-mini"));
        assert_eq!(openai.resolve_model(None), Some("gpt-4o-mini"));
    }

    #[test]
    fn provider_validation_reports_problems() {
        let mut p = ProviderConfig::new(ProviderKind::Anthropic);
        assert!(p.validate().unwrap_err().to_string().contains("no models"));

        p.models = vec!["claude-3-5-haiku-latest".into()];
        assert!(p.validate().unwrap_err().to_string().contains("credential"));

        p.api_key_env = Some("NEWSCOPE_TEST_UNSET_KEY_VAR".into());
        assert!(p.validate().unwrap_err().to_string().contains("not set"));

        p.api_key = Some("key".into());
        p.api_url = Some("not a url".into());
        assert!(p.validate().unwrap_err().to_string().contains("invalid api_url"));

        p.api_url = None;
        p.timeout_seconds = Some(0);
        assert!(p.validate().is_err());

        p.timeout_seconds = Some(5);
        p.validate().expect("valid provider");

        let mut local = ProviderConfig::new(ProviderKind::Ollama);
        local.models = vec!["llama3.2".into()];
        local.validate().expect("local needs no credential");
    }

    #[test]
    fn blank_env_credential_is_rejected() {
        let mut p = ProviderConfig::new(ProviderKind::OpenAi);
        p.models = vec!["gpt-4o-mini".into()];
        p.api_key_env = Some("NEWSCOPE_TEST_BLANK_KEY_VAR".into());

        std::env::set_var("NEWSCOPE_TEST_BLANK_KEY_VAR", "");
        assert!(p.resolve_api_key().unwrap_err().to_string().contains("is empty"));
        assert!(p.validate().unwrap_err().to_string().contains("is empty"));

        std::env::set_var("NEWSCOPE_TEST_BLANK_KEY_VAR", "   ");
        assert!(p.validate().is_err());

        std::env::set_var("NEWSCOPE_TEST_BLANK_KEY_VAR", "sk-live");
        assert_eq!(p.resolve_api_key().unwrap().as_deref(), Some("sk-live"));
    }

    #[test]
    fn llm_validation_rejects_bad_policies() {
        let mut llm = LlmConfig::default();
        llm.validate().expect("defaults are valid");

        llm.budget.daily_limit = Some(-1.0);
        assert!(llm.validate().is_err());
        llm.budget.daily_limit = Some(0.0);
        llm.validate().expect("zero cap is valid");

        llm.health.decay = 1.0;
        assert!(llm.validate().is_err());
        llm.health.decay = 0.8;

        llm.max_concurrency = 0;
        assert!(llm.validate().is_err());
    }

    #[tokio::test]
    async fn load_with_defaults_merges_override() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        let override_path = dir.path().join("config.toml");
        std::fs::write(&default_path, SAMPLE).expect("write default");
        std::fs::write(
            &override_path,
            r#"
            [llm.budget]
            monthly_limit = 10.0

            [llm.providers.openai]
            enabled = false
            "#,
        )
        .expect("write override");

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&override_path))
            .await
            .expect("load");

        assert_eq!(cfg.llm.budget.daily_limit, Some(1.5));
        assert_eq!(cfg.llm.budget.monthly_limit, Some(10.0));
        let openai = &cfg.llm.providers["openai"];
        assert!(!openai.enabled);
        assert_eq!(openai.models.len(), 2);
    }

    #[tokio::test]
    async fn load_rejects_invalid_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[llm.health]\nfloor = 2.0\n").expect("write");
        let err = Config::from_file(&path).await.unwrap_err();
        assert!(format!("{:#}", err).contains("floor"));
    }

    #[tokio::test]
    async fn db_pool_in_temp_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("newscope.db");
        let pool = init_db_pool(&db_path.to_string_lossy()).await.expect("init pool");
        let conn = pool.acquire().await.expect("acquire conn");
        drop(conn);
    }
}
