//! The pool-backed store.
//!
//! All writes that touch `current_spend` happen here, inside the batch
//! transaction driven by the reconciliation worker. Handler code never
//! updates spend columns directly — that write path is single-consumer.

use chrono::Utc;
use pllm_core::usage::UsageRecord;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::{debug, info};

use crate::entities::{
    BudgetRecord, KeyRecord, MetricsRow, TeamMemberRecord, TeamRecord, UserRecord,
};

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Which metrics table an aggregate row lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricsTable {
    Model,
    System,
    User,
    Team,
}

impl MetricsTable {
    fn table_name(self) -> &'static str {
        match self {
            Self::Model => "model_metrics",
            Self::System => "system_metrics",
            Self::User => "user_metrics",
            Self::Team => "team_metrics",
        }
    }

    fn dimension_column(self) -> &'static str {
        match self {
            Self::Model => "model_name",
            Self::System => "scope",
            Self::User => "user_id",
            Self::Team => "team_id",
        }
    }
}

/// PostgreSQL-backed store shared across the gateway.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!("connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Liveness probe for `/ready`.
    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // --- credentials ---

    /// Active key by hash. Inactive rows are invisible to authentication.
    pub async fn find_key_by_hash(&self, key_hash: &str) -> Result<Option<KeyRecord>, StorageError> {
        let key = sqlx::query_as::<_, KeyRecord>(
            "SELECT * FROM keys WHERE key_hash = $1 AND is_active",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    pub async fn find_key(&self, id: &str) -> Result<Option<KeyRecord>, StorageError> {
        Ok(sqlx::query_as::<_, KeyRecord>("SELECT * FROM keys WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn insert_key(&self, key: &KeyRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO keys (id, key_hash, key_prefix, key_type, user_id, team_id, is_active, \
             expires_at, scopes, allowed_models, blocked_models, rpm, tpm, max_parallel, \
             max_budget, budget_period, current_spend, usage_count, total_tokens, total_cost) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, 0, 0, 0, 0)",
        )
        .bind(&key.id)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(&key.key_type)
        .bind(&key.user_id)
        .bind(&key.team_id)
        .bind(key.is_active)
        .bind(key.expires_at)
        .bind(&key.scopes)
        .bind(&key.allowed_models)
        .bind(&key.blocked_models)
        .bind(key.rpm)
        .bind(key.tpm)
        .bind(key.max_parallel)
        .bind(key.max_budget)
        .bind(&key.budget_period)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_key(&self, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE keys SET is_active = FALSE, revoked_at = NOW() WHERE id = $1 AND revoked_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_keys(&self, limit: i64) -> Result<Vec<KeyRecord>, StorageError> {
        Ok(sqlx::query_as::<_, KeyRecord>(
            "SELECT * FROM keys ORDER BY id LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn find_user(&self, id: &str) -> Result<Option<UserRecord>, StorageError> {
        Ok(sqlx::query_as::<_, UserRecord>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn find_team(&self, id: &str) -> Result<Option<TeamRecord>, StorageError> {
        Ok(sqlx::query_as::<_, TeamRecord>("SELECT * FROM teams WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn find_team_member(
        &self,
        team_id: &str,
        user_id: &str,
    ) -> Result<Option<TeamMemberRecord>, StorageError> {
        Ok(sqlx::query_as::<_, TeamMemberRecord>(
            "SELECT * FROM team_members WHERE team_id = $1 AND user_id = $2",
        )
        .bind(team_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    // --- budgets ---

    /// All active, in-window budgets applying to an entity, including any
    /// global budget.
    pub async fn budgets_for(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<BudgetRecord>, StorageError> {
        let now = Utc::now();
        let budgets = sqlx::query_as::<_, BudgetRecord>(
            "SELECT * FROM budgets \
             WHERE is_active AND starts_at <= $1 AND (ends_at IS NULL OR ends_at > $1) \
             AND (budget_type = 'global' OR (budget_type = $2 AND entity_ref = $3))",
        )
        .bind(now)
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(budgets)
    }

    // --- usage reconciliation ---

    /// Persist a batch of usage records in one transaction: one
    /// `usage_logs` row per record plus additive spend updates on the
    /// owning key, user, team, and any applicable budgets.
    pub async fn insert_usage_batch(&self, records: &[UsageRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for record in records {
            // request_id is unique; replays from the retry queue must not
            // double-bill.
            let inserted = sqlx::query(
                "INSERT INTO usage_logs (request_id, timestamp, model, provider, instance_id, \
                 provider_model, key_id, key_type, user_id, actual_user_id, team_id, method, \
                 path, status_code, input_tokens, output_tokens, total_tokens, cost, latency_ms, retries) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20) \
                 ON CONFLICT (request_id) DO NOTHING",
            )
            .bind(&record.request_id)
            .bind(record.timestamp)
            .bind(&record.model)
            .bind(record.provider.to_string())
            .bind(&record.instance_id)
            .bind(&record.provider_model)
            .bind(&record.key_id)
            .bind(&record.key_type)
            .bind(&record.user_id)
            .bind(&record.actual_user_id)
            .bind(&record.team_id)
            .bind(&record.method)
            .bind(&record.path)
            .bind(record.status_code as i32)
            .bind(record.input_tokens as i32)
            .bind(record.output_tokens as i32)
            .bind(record.total_tokens as i32)
            .bind(record.cost)
            .bind(record.latency_ms as i64)
            .bind(record.retries as i32)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted == 0 {
                debug!(request_id = %record.request_id, "usage row already reconciled, skipping");
                continue;
            }

            if let Some(key_id) = &record.key_id {
                sqlx::query(
                    "UPDATE keys SET current_spend = current_spend + $1, \
                     usage_count = usage_count + 1, total_tokens = total_tokens + $2, \
                     total_cost = total_cost + $1 WHERE id = $3",
                )
                .bind(record.cost)
                .bind(record.total_tokens as i64)
                .bind(key_id)
                .execute(&mut *tx)
                .await?;
            }

            if let Some(user_id) = &record.user_id {
                sqlx::query("UPDATE users SET current_spend = current_spend + $1 WHERE id = $2")
                    .bind(record.cost)
                    .bind(user_id)
                    .execute(&mut *tx)
                    .await?;
            }

            if let Some(team_id) = &record.team_id {
                sqlx::query("UPDATE teams SET current_spend = current_spend + $1 WHERE id = $2")
                    .bind(record.cost)
                    .bind(team_id)
                    .execute(&mut *tx)
                    .await?;
            }

            sqlx::query(
                "UPDATE budgets SET spent = spent + $1 \
                 WHERE is_active AND (budget_type = 'global' \
                 OR (budget_type = 'key' AND entity_ref = $2) \
                 OR (budget_type = 'user' AND entity_ref = $3) \
                 OR (budget_type = 'team' AND entity_ref = $4))",
            )
            .bind(record.cost)
            .bind(record.key_id.as_deref().unwrap_or(""))
            .bind(record.user_id.as_deref().unwrap_or(""))
            .bind(record.team_id.as_deref().unwrap_or(""))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(count = records.len(), "usage batch reconciled");
        Ok(())
    }

    // --- audits ---

    pub async fn insert_audit(
        &self,
        actor: &str,
        action: &str,
        resource: &str,
        detail: &serde_json::Value,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO audits (id, timestamp, actor, action, resource, detail) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(Utc::now())
        .bind(actor)
        .bind(action)
        .bind(resource)
        .bind(detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- metrics rollup ---

    /// Upsert one aggregate row keyed `(dimension, interval, bucket)`.
    pub async fn upsert_metrics(
        &self,
        table: MetricsTable,
        row: &MetricsRow,
    ) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO {table} ({dim}, interval, bucket_start, request_count, success_count, \
             input_tokens, output_tokens, cost, p50_latency_ms, p95_latency_ms, p99_latency_ms, \
             health_score, cache_hit_rate) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT ({dim}, interval, bucket_start) DO UPDATE SET \
             request_count = EXCLUDED.request_count, success_count = EXCLUDED.success_count, \
             input_tokens = EXCLUDED.input_tokens, output_tokens = EXCLUDED.output_tokens, \
             cost = EXCLUDED.cost, p50_latency_ms = EXCLUDED.p50_latency_ms, \
             p95_latency_ms = EXCLUDED.p95_latency_ms, p99_latency_ms = EXCLUDED.p99_latency_ms, \
             health_score = EXCLUDED.health_score, cache_hit_rate = EXCLUDED.cache_hit_rate",
            table = table.table_name(),
            dim = table.dimension_column(),
        );

        sqlx::query(&sql)
            .bind(&row.dimension)
            .bind(&row.interval)
            .bind(row.bucket_start)
            .bind(row.request_count)
            .bind(row.success_count)
            .bind(row.input_tokens)
            .bind(row.output_tokens)
            .bind(row.cost)
            .bind(row.p50_latency_ms)
            .bind(row.p95_latency_ms)
            .bind(row.p99_latency_ms)
            .bind(row.health_score)
            .bind(row.cache_hit_rate)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
