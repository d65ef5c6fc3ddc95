// Summarization orchestrator
//
// Tries registry candidates in order and falls back to a local extractive summary
// when none of them succeeds. Every public operation is infallible.

use anyhow::Result;
use chrono::{DateTime, Utc};
use common::{LlmConfig, ProviderKind};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::budget::{BudgetLedger, BudgetSnapshot};
use super::registry::ProviderRegistry;
use super::{text, SummaryRequest, SummaryResult};
use crate::article::{Article, SummarizedArticle};
use crate::storage::UsageStore;

/// Per-provider line of the stats report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderReport {
    pub name: String,
    pub kind: ProviderKind,
    pub enabled: bool,
    pub healthy: bool,
    pub health_score: f64,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub total_cost: f64,
    pub avg_latency_ms: u64,
    pub last_error: Option<String>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub config_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub providers: Vec<ProviderReport>,
    pub total_requests: u64,
    pub total_cost: f64,
    pub budget: BudgetSnapshot,
}

/// Work currently running on one `Summarizer`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingStatus {
    pub in_flight: usize,
    pub batches_running: usize,
}

/// Increments a counter for as long as it lives.
struct CounterGuard<'a>(&'a AtomicUsize);

impl<'a> CounterGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Summarizer {
    registry: RwLock<Arc<ProviderRegistry>>,
    ledger: BudgetLedger,
    store: Option<UsageStore>,
    in_flight: AtomicUsize,
    batches_running: AtomicUsize,
}

impl Summarizer {
    /// Build the registry from `config`. Fails only on a globally invalid config;
    /// broken provider entries are disabled instead.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: RwLock::new(Arc::new(ProviderRegistry::from_config(config))),
            ledger: BudgetLedger::new(&config.budget),
            store: None,
            in_flight: AtomicUsize::new(0),
            batches_running: AtomicUsize::new(0),
        })
    }

    /// Persist every successful call into `store`.
    pub fn with_store(mut self, store: UsageStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the whole registry. Stats start fresh; spend is kept under the new caps.
    pub fn reload(&self, config: &LlmConfig) -> Result<()> {
        config.validate()?;
        let registry = Arc::new(ProviderRegistry::from_config(config));
        self.ledger.set_limits(&config.budget);
        *self.registry.write().unwrap_or_else(PoisonError::into_inner) = registry;
        info!(providers = config.providers.len(), "provider registry reloaded");
        Ok(())
    }

    /// Current registry. Requests already running keep the one they started with.
    pub fn registry(&self) -> Arc<ProviderRegistry> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn status(&self) -> ProcessingStatus {
        ProcessingStatus {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            batches_running: self.batches_running.load(Ordering::SeqCst),
        }
    }

    /// Summarize one text. The result always carries non-empty content: a provider
    /// summary on success, the local fallback otherwise.
    pub async fn summarize(&self, request: SummaryRequest) -> SummaryResult {
        let _in_flight = CounterGuard::enter(&self.in_flight);
        let started = Instant::now();
        let registry = self.registry();
        let options = registry.resolve_options(&request.options);
        let max_tokens = options.max_tokens.unwrap_or(registry.summary_config().max_tokens);
        let model = request.model.as_deref();

        let mut errors = Vec::new();
        for slot in registry.candidates(&request, &self.ledger).await {
            // Paid calls hold their estimate until settled; the hold is released on any exit
            let reservation = if slot.is_free() {
                None
            } else {
                let estimate = slot.estimate_cost(model, &request.text, max_tokens);
                match self.ledger.reserve(estimate) {
                    Some(reservation) => Some(reservation),
                    None => {
                        debug!(provider = %slot.name(), estimate, "skipping provider: over budget");
                        continue;
                    }
                }
            };

            let result = slot.attempt(&request.text, model, &options).await;
            if result.success {
                if let Some(reservation) = reservation {
                    reservation.settle(result.cost);
                }
                info!(
                    provider = %slot.name(),
                    model = result.model.as_deref().unwrap_or_default(),
                    cost = result.cost,
                    latency_ms = result.latency_ms,
                    "summary completed"
                );
                if let Some(store) = &self.store {
                    store.record(&result, Utc::now()).await;
                }
                return result;
            }

            drop(reservation);
            let error = result.error.as_deref().unwrap_or("unknown error");
            warn!(provider = %slot.name(), error = %error, "provider failed, trying next");
            errors.push(format!("{}: {}", slot.name(), error));
        }

        let reason = if errors.is_empty() {
            "no provider available".to_string()
        } else {
            errors.join("; ")
        };
        warn!(reason = %reason, "all providers failed, using fallback summary");
        let summary =
            text::fallback_summary(&request.text, registry.summary_config().fallback_max_chars);
        SummaryResult::fallback(summary, reason, started.elapsed())
    }

    pub async fn summarize_text(&self, text: &str) -> SummaryResult {
        self.summarize(SummaryRequest::new(text)).await
    }

    /// Summarize a batch with bounded concurrency. Output order matches input order and
    /// every article gets a summary, real or fallback.
    pub async fn summarize_many(&self, articles: Vec<Article>) -> Vec<SummarizedArticle> {
        let _batch = CounterGuard::enter(&self.batches_running);
        let limit = self.registry().max_concurrency();
        let total = articles.len();
        info!(articles = total, concurrency = limit, "summarizing batch");

        let results: Vec<SummarizedArticle> = stream::iter(articles)
            .map(|article| async move {
                let result = self
                    .summarize(SummaryRequest::new(article.summary_input()))
                    .await;
                SummarizedArticle::new(article, result)
            })
            .buffered(limit)
            .collect()
            .await;

        let fallbacks = results.iter().filter(|a| a.summary_fallback).count();
        info!(articles = total, fallbacks, "batch finished");
        results
    }

    /// Probe every provider concurrently. Budget and stats are left untouched.
    pub async fn health_check_all(&self) -> BTreeMap<String, bool> {
        let registry = self.registry();
        let checks = registry.slots().iter().map(|slot| async move {
            let healthy = slot.health_check().await;
            debug!(provider = %slot.name(), healthy, "health check");
            (slot.name().to_string(), healthy)
        });
        join_all(checks).await.into_iter().collect()
    }

    /// Snapshot of provider stats and budget state. Reading changes nothing.
    pub fn stats(&self) -> StatsReport {
        let registry = self.registry();
        let providers: Vec<ProviderReport> = registry
            .slots()
            .iter()
            .map(|slot| {
                let stats = slot.stats();
                ProviderReport {
                    name: slot.name().to_string(),
                    kind: slot.kind(),
                    enabled: slot.is_enabled(),
                    healthy: registry.policy().is_healthy(stats.health_score),
                    health_score: stats.health_score,
                    requests: stats.requests,
                    successes: stats.successes,
                    failures: stats.failures,
                    success_rate: stats.success_rate(),
                    total_cost: stats.total_cost,
                    avg_latency_ms: stats.avg_latency_ms(),
                    last_error: stats.last_error,
                    last_attempt: stats.last_attempt,
                    config_error: slot.config_error().map(str::to_string),
                }
            })
            .collect();

        StatsReport {
            total_requests: providers.iter().map(|p| p.requests).sum(),
            total_cost: providers.iter().map(|p| p.total_cost).sum(),
            providers,
            budget: self.ledger.snapshot(),
        }
    }
}
