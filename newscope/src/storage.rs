use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::llm::budget::{day_key, month_key, BudgetLedger};
use crate::llm::SummaryResult;

/// Append-only log of successful provider calls, used to rebuild the budget
/// ledger after a restart.
#[derive(Debug, Clone)]
pub struct UsageStore {
    pool: SqlitePool,
}

impl UsageStore {
    /// Wrap `pool`, creating the `llm_usage` table when missing.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS llm_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                model TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                day TEXT NOT NULL,
                month TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create llm_usage table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_llm_usage_day ON llm_usage(day)")
            .execute(&pool)
            .await
            .context("failed to create llm_usage index")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append one successful call. Errors are logged, never returned.
    pub async fn record(&self, result: &SummaryResult, at: DateTime<Utc>) {
        if let Err(e) = self.insert(result, at).await {
            warn!("failed to persist LLM usage: {:#}", e);
        }
    }

    async fn insert(&self, result: &SummaryResult, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO llm_usage
            (provider, model, input_tokens, output_tokens, cost, latency_ms, day, month, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.provider.as_deref().unwrap_or_default())
        .bind(result.model.as_deref())
        .bind(result.input_tokens as i64)
        .bind(result.output_tokens as i64)
        .bind(result.cost.max(0.0))
        .bind(result.latency_ms as i64)
        .bind(day_key(at))
        .bind(month_key(at))
        .bind(at)
        .execute(&self.pool)
        .await
        .context("failed to insert llm_usage row")?;
        Ok(())
    }

    pub async fn spend_for_day(&self, day: &str) -> Result<f64> {
        sqlx::query_scalar::<_, f64>("SELECT COALESCE(SUM(cost), 0.0) FROM llm_usage WHERE day = ?")
            .bind(day)
            .fetch_one(&self.pool)
            .await
            .context("failed to sum daily spend")
    }

    pub async fn spend_for_month(&self, month: &str) -> Result<f64> {
        sqlx::query_scalar::<_, f64>(
            "SELECT COALESCE(SUM(cost), 0.0) FROM llm_usage WHERE month = ?",
        )
        .bind(month)
        .fetch_one(&self.pool)
        .await
        .context("failed to sum monthly spend")
    }

    pub async fn count(&self) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM llm_usage")
            .fetch_one(&self.pool)
            .await
            .context("failed to count llm_usage rows")
    }

    /// Seed `ledger` with today's and this month's persisted spend.
    pub async fn restore_ledger(&self, ledger: &BudgetLedger) -> Result<()> {
        self.restore_ledger_at(ledger, Utc::now()).await
    }

    pub async fn restore_ledger_at(&self, ledger: &BudgetLedger, now: DateTime<Utc>) -> Result<()> {
        let daily = self.spend_for_day(&day_key(now)).await?;
        let monthly = self.spend_for_month(&month_key(now)).await?;
        debug!(daily, monthly, "persisted spend loaded");
        ledger.restore_at(daily, monthly, now);
        Ok(())
    }
}
