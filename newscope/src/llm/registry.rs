//! Provider registry and candidate selection.
//!
//! Candidates are ordered by descending health score, then ascending rank, then
//! ascending estimated cost, then name, so identical inputs always yield the same order.
//! Rank is the position in `fallback_order` when the provider is listed there,
//! otherwise `fallback_order.len() + priority`.

use chrono::Utc;
use common::{LlmConfig, ProviderConfig, ProviderKind, SummaryConfig};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::budget::BudgetLedger;
use super::health::{HealthPolicy, ProviderStats};
use super::{
    build_summary_prompt, estimate_tokens, LlmProvider, ProviderBackend, SummaryOptions,
    SummaryRequest, SummaryResult,
};

const DEFAULT_PRIORITY: u32 = 100;

/// One configured provider with its own stats.
pub struct ProviderSlot {
    name: String,
    config: ProviderConfig,
    /// None when switched off or when the config entry failed validation
    backend: Option<ProviderBackend>,
    config_error: Option<String>,
    rank: u32,
    policy: HealthPolicy,
    stats: Mutex<ProviderStats>,
}

impl ProviderSlot {
    fn new(name: &str, config: &ProviderConfig, rank: u32, policy: HealthPolicy) -> Self {
        let (backend, config_error) = if !config.enabled {
            debug!(provider = %name, "provider switched off in config");
            (None, None)
        } else {
            match ProviderBackend::from_config(name, config) {
                Ok(backend) => (Some(backend), None),
                Err(e) => {
                    warn!(provider = %name, "{:#}; provider disabled", e);
                    (None, Some(format!("{:#}", e)))
                }
            }
        };
        Self {
            name: name.to_string(),
            config: config.clone(),
            backend,
            config_error,
            rank,
            policy,
            stats: Mutex::new(ProviderStats::default()),
        }
    }

    fn lock_stats(&self) -> MutexGuard<'_, ProviderStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProviderKind {
        self.config.kind
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn config_error(&self) -> Option<&str> {
        self.config_error.as_deref()
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Enabled in config and built without errors
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.backend.is_some()
    }

    pub fn is_free(&self) -> bool {
        self.config.is_free()
    }

    pub fn stats(&self) -> ProviderStats {
        self.lock_stats().clone()
    }

    pub fn health_score(&self) -> f64 {
        self.lock_stats().health_score
    }

    pub fn is_healthy(&self) -> bool {
        self.policy.is_healthy(self.health_score())
    }

    pub async fn is_available(&self) -> bool {
        match &self.backend {
            Some(backend) if self.config.enabled => backend.is_available().await,
            _ => false,
        }
    }

    pub async fn list_models(&self) -> Vec<String> {
        match &self.backend {
            Some(backend) => backend.list_models().await,
            None => self.config.models.clone(),
        }
    }

    pub async fn health_check(&self) -> bool {
        match &self.backend {
            Some(backend) if self.config.enabled => backend.health_check().await,
            _ => false,
        }
    }

    /// Estimated cost of one call: the full prompt as sent, at 4 chars per token,
    /// plus the whole output allowance.
    pub fn estimate_cost(&self, model: Option<&str>, text: &str, max_tokens: usize) -> f64 {
        if self.is_free() {
            return 0.0;
        }
        match self.config.resolve_model(model) {
            Some(model) => self.config.cost_for(
                model,
                estimate_tokens(&build_summary_prompt(text)),
                max_tokens,
            ),
            None => 0.0,
        }
    }

    /// Run one summarization attempt and fold the outcome into this slot's stats.
    pub async fn attempt(
        &self,
        text: &str,
        model: Option<&str>,
        options: &SummaryOptions,
    ) -> SummaryResult {
        let result = match &self.backend {
            Some(backend) => backend.summarize(text, model, options).await,
            None => SummaryResult::failed(
                &self.name,
                None,
                self.config_error.as_deref().unwrap_or("provider not configured"),
                std::time::Duration::ZERO,
            ),
        };
        self.lock_stats().record(&result, &self.policy, Utc::now());
        result
    }
}

/// Immutable set of provider slots plus the shared policies they were built with.
///
/// Reloading configuration means building a new registry.
pub struct ProviderRegistry {
    slots: Vec<ProviderSlot>,
    policy: HealthPolicy,
    summary: SummaryConfig,
    max_concurrency: usize,
}

impl ProviderRegistry {
    /// Build every configured provider. Misconfigured entries are kept, disabled.
    pub fn from_config(config: &LlmConfig) -> Self {
        let policy = HealthPolicy::from_config(&config.health);

        for name in &config.fallback_order {
            if !config.providers.contains_key(name) {
                warn!(provider = %name, "fallback_order names an unknown provider");
            }
        }

        let slots: Vec<ProviderSlot> = config
            .providers
            .iter()
            .map(|(name, provider)| {
                let rank = rank_for(name, provider, &config.fallback_order);
                ProviderSlot::new(name, provider, rank, policy)
            })
            .collect();

        info!(
            providers = slots.len(),
            enabled = slots.iter().filter(|s| s.is_enabled()).count(),
            "provider registry built"
        );

        Self {
            slots,
            policy,
            summary: config.summary.clone(),
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    pub fn slots(&self) -> &[ProviderSlot] {
        &self.slots
    }

    pub fn get(&self, name: &str) -> Option<&ProviderSlot> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    pub fn summary_config(&self) -> &SummaryConfig {
        &self.summary
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Fill unset knobs from `[llm.summary]`.
    pub fn resolve_options(&self, options: &SummaryOptions) -> SummaryOptions {
        SummaryOptions {
            max_tokens: Some(options.max_tokens.unwrap_or(self.summary.max_tokens)),
            temperature: Some(options.temperature.unwrap_or(self.summary.temperature)),
            timeout: options.timeout,
        }
    }

    /// Enabled providers in selection order, before availability and budget checks.
    pub fn ordered(&self, request: &SummaryRequest, max_tokens: usize) -> Vec<&ProviderSlot> {
        let model = request.model.as_deref();
        let mut keyed: Vec<(f64, u32, f64, &ProviderSlot)> = self
            .slots
            .iter()
            .filter(|s| s.is_enabled())
            .map(|s| {
                (
                    s.health_score(),
                    s.rank,
                    s.estimate_cost(model, &request.text, max_tokens),
                    s,
                )
            })
            .collect();

        keyed.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.total_cmp(&b.2))
                .then_with(|| a.3.name.cmp(&b.3.name))
        });
        keyed.into_iter().map(|(_, _, _, slot)| slot).collect()
    }

    /// Providers to try for `request`, in order.
    ///
    /// A usable preferred provider goes first; the rest follow `ordered`, skipping any
    /// that are unreachable or that the ledger cannot afford.
    pub async fn candidates(
        &self,
        request: &SummaryRequest,
        ledger: &BudgetLedger,
    ) -> Vec<&ProviderSlot> {
        let max_tokens = request.options.max_tokens.unwrap_or(self.summary.max_tokens);
        let model = request.model.as_deref();
        let affordable = |slot: &ProviderSlot| {
            slot.is_free() || ledger.can_afford(slot.estimate_cost(model, &request.text, max_tokens))
        };

        let mut candidates: Vec<&ProviderSlot> = Vec::new();

        if let Some(preferred) = request.preferred_provider.as_deref() {
            match self.get(preferred) {
                Some(slot) => {
                    let usable = slot.is_enabled()
                        && slot.is_healthy()
                        && affordable(slot)
                        && slot.is_available().await;
                    if usable {
                        candidates.push(slot);
                    } else {
                        debug!(provider = %preferred, "preferred provider not usable, using normal order");
                    }
                }
                None => debug!(provider = %preferred, "preferred provider is not configured"),
            }
        }

        for slot in self.ordered(request, max_tokens) {
            if candidates.iter().any(|c| c.name == slot.name) {
                continue;
            }
            if !affordable(slot) {
                debug!(provider = %slot.name, "skipping provider: over budget");
                continue;
            }
            if !slot.is_available().await {
                debug!(provider = %slot.name, "skipping provider: unavailable");
                continue;
            }
            candidates.push(slot);
        }
        candidates
    }
}

fn rank_for(name: &str, config: &ProviderConfig, fallback_order: &[String]) -> u32 {
    match fallback_order.iter().position(|n| n == name) {
        Some(pos) => pos as u32,
        None => fallback_order.len() as u32 + config.priority.unwrap_or(DEFAULT_PRIORITY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{BudgetConfig, ModelRate};

    fn hosted(priority: u32) -> ProviderConfig {
        let mut config = ProviderConfig::new(ProviderKind::OpenAi);
        config.api_key = Some("test-key".into());
        config.models = vec!["gpt-4o-mini".into()];
        config.priority = Some(priority);
        config
    }

    fn priced(priority: u32, per_million: f64) -> ProviderConfig {
        let mut config = hosted(priority);
        config.pricing.insert(
            "gpt-4o-mini".into(),
            ModelRate {
                input_per_million: per_million,
                output_per_million: per_million,
            },
        );
        config
    }

    fn registry(providers: Vec<(&str, ProviderConfig)>) -> ProviderRegistry {
        let mut config = LlmConfig::default();
        for (name, provider) in providers {
            config.providers.insert(name.to_string(), provider);
        }
        ProviderRegistry::from_config(&config)
    }

    fn set_health(registry: &ProviderRegistry, name: &str, score: f64) {
        registry.get(name).expect("slot").lock_stats().health_score = score;
    }

    fn names(slots: &[&ProviderSlot]) -> Vec<String> {
        slots.iter().map(|s| s.name().to_string()).collect()
    }

    fn request() -> SummaryRequest {
        SummaryRequest::new("Some article text that needs a summary.")
    }

    #[test]
    fn healthier_provider_goes_first() {
        let registry = registry(vec![("alpha", hosted(1)), ("beta", hosted(1))]);
        set_health(&registry, "alpha", 0.3);
        set_health(&registry, "beta", 0.9);

        let order = registry.ordered(&request(), 300);
        assert_eq!(names(&order), vec!["beta", "alpha"]);
    }

    #[test]
    fn ties_break_on_rank_then_cost_then_name() {
        let registry = registry(vec![
            ("a-expensive", priced(1, 10.0)),
            ("b-cheap", priced(1, 1.0)),
            ("c-top-rank", priced(0, 50.0)),
            ("d-cheap-twin", priced(1, 1.0)),
        ]);

        let order = registry.ordered(&request(), 300);
        assert_eq!(
            names(&order),
            vec!["c-top-rank", "b-cheap", "d-cheap-twin", "a-expensive"]
        );
        // deterministic
        assert_eq!(names(&registry.ordered(&request(), 300)), names(&order));
    }

    #[test]
    fn fallback_order_overrides_priority() {
        let mut config = LlmConfig::default();
        config.providers.insert("first".into(), hosted(0));
        config.providers.insert("second".into(), hosted(0));
        config.providers.insert("unlisted".into(), hosted(0));
        config.fallback_order = vec!["second".into(), "first".into()];
        let registry = ProviderRegistry::from_config(&config);

        assert_eq!(registry.get("second").unwrap().rank(), 0);
        assert_eq!(registry.get("first").unwrap().rank(), 1);
        assert_eq!(registry.get("unlisted").unwrap().rank(), 2);
        assert_eq!(
            names(&registry.ordered(&request(), 300)),
            vec!["second", "first", "unlisted"]
        );
    }

    #[test]
    fn misconfigured_provider_is_disabled_not_fatal() {
        let mut broken = hosted(0);
        broken.api_key = None;
        let mut switched_off = hosted(0);
        switched_off.enabled = false;
        let registry = registry(vec![("ok", hosted(1)), ("broken", broken), ("off", switched_off)]);

        let slot = registry.get("broken").expect("kept in registry");
        assert!(!slot.is_enabled());
        assert!(slot.config_error().unwrap().contains("credential"));
        assert!(registry.get("off").unwrap().config_error().is_none());
        assert_eq!(names(&registry.ordered(&request(), 300)), vec!["ok"]);
    }

    #[test]
    fn switched_off_provider_is_not_validated() {
        // would fail validation if it were checked
        let mut off = hosted(0);
        off.api_key = None;
        off.models.clear();
        off.enabled = false;
        let registry = registry(vec![("ok", hosted(1)), ("off", off)]);

        let slot = registry.get("off").expect("kept in registry");
        assert!(!slot.is_enabled());
        assert!(slot.config_error().is_none());
        assert_eq!(names(&registry.ordered(&request(), 300)), vec!["ok"]);
    }

    #[tokio::test]
    async fn preferred_provider_is_tried_first_when_usable() {
        let registry = registry(vec![("alpha", hosted(0)), ("beta", hosted(1))]);
        let ledger = BudgetLedger::unlimited();

        let picked = registry.candidates(&request().prefer("beta"), &ledger).await;
        assert_eq!(names(&picked), vec!["beta", "alpha"]);

        // below the health floor: back to normal ordering
        set_health(&registry, "beta", 0.1);
        let picked = registry.candidates(&request().prefer("beta"), &ledger).await;
        assert_eq!(names(&picked), vec!["alpha", "beta"]);

        let picked = registry.candidates(&request().prefer("missing"), &ledger).await;
        assert_eq!(names(&picked), vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn unaffordable_providers_are_skipped() {
        let registry = registry(vec![("paid", priced(0, 1_000.0)), ("unpriced", hosted(1))]);
        let ledger = BudgetLedger::new(&BudgetConfig {
            daily_limit: Some(0.01),
            monthly_limit: None,
        });

        let picked = registry.candidates(&request().prefer("paid"), &ledger).await;
        assert_eq!(names(&picked), vec!["unpriced"]);
    }

    #[tokio::test]
    async fn unreachable_local_runner_is_skipped() {
        let mut local = ProviderConfig::new(ProviderKind::Ollama);
        local.api_url = Some("http://127.0.0.1:9".into());
        local.models = vec!["llama3.2".into()];
        local.priority = Some(0);
        let registry = registry(vec![("local", local), ("hosted", hosted(5))]);
        let ledger = BudgetLedger::new(&BudgetConfig {
            daily_limit: Some(0.0),
            monthly_limit: Some(0.0),
        });

        assert!(registry.get("local").unwrap().is_free());
        assert_eq!(names(&registry.ordered(&request(), 300)), vec!["local", "hosted"]);
        let picked = registry.candidates(&request(), &ledger).await;
        assert_eq!(names(&picked), vec!["hosted"]);
    }

    #[test]
    fn estimate_cost_uses_output_allowance() {
        let registry = registry(vec![("paid", priced(0, 1.0))]);
        let slot = registry.get("paid").unwrap();
        let text = "x".repeat(400); // 100 tokens
        let prompt_tokens = estimate_tokens(&build_summary_prompt(&text));
        // the instruction template is counted too
        assert_eq!(prompt_tokens, 100 + estimate_tokens(&build_summary_prompt("")));
        let expected = (prompt_tokens + 300) as f64 / 1_000_000.0;
        assert!((slot.estimate_cost(None, &text, 300) - expected).abs() < 1e-15);
    }

    #[test]
    fn options_fall_back_to_summary_config() {
        let registry = registry(vec![]);
        let resolved = registry.resolve_options(&SummaryOptions {
            max_tokens: Some(42),
            ..Default::default()
        });
        assert_eq!(resolved.max_tokens, Some(42));
        assert_eq!(resolved.temperature, Some(0.3));
        assert!(resolved.timeout.is_none());
    }
}
