//! Saga persistence. Each saga is one row; the step list travels as a JSON
//! column so a save is always a single atomic upsert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, Iden, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use super::{Saga, SagaError, SagaStatus};

/// Sagas table schema.
#[derive(Iden)]
enum Sagas {
    Table,
    #[iden = "saga_id"]
    SagaId,
    #[iden = "name"]
    Name,
    #[iden = "initiator"]
    Initiator,
    #[iden = "status"]
    Status,
    #[iden = "steps"]
    Steps,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
    #[iden = "completed_at"]
    CompletedAt,
    #[iden = "error"]
    Error,
}

#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn save(&self, saga: &Saga) -> Result<(), SagaError>;
    async fn load(&self, saga_id: &str) -> Result<Option<Saga>, SagaError>;

    /// Sagas newest first, optionally filtered by status.
    async fn list(&self, status: Option<SagaStatus>, limit: u64) -> Result<Vec<Saga>, SagaError>;
}

pub struct SqliteSagaStore {
    pool: SqlitePool,
}

impl SqliteSagaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn saga_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Saga, SagaError> {
        let status: String = row.get("status");
        let steps: String = row.get("steps");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        let completed_at: Option<String> = row.get("completed_at");

        Ok(Saga {
            saga_id: row.get("saga_id"),
            name: row.get("name"),
            initiator: row.get("initiator"),
            status: status
                .parse()
                .map_err(|e| SagaError::Corrupt(format!("bad status: {e}")))?,
            steps: serde_json::from_str(&steps)
                .map_err(|e| SagaError::Corrupt(format!("bad steps: {e}")))?,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
            error: row.get("error"),
        })
    }
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, SagaError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SagaError::Corrupt(format!("bad timestamp: {e}")))
}

const SAGA_COLUMNS: [Sagas; 9] = [
    Sagas::SagaId,
    Sagas::Name,
    Sagas::Initiator,
    Sagas::Status,
    Sagas::Steps,
    Sagas::CreatedAt,
    Sagas::UpdatedAt,
    Sagas::CompletedAt,
    Sagas::Error,
];

#[async_trait]
impl SagaStore for SqliteSagaStore {
    async fn save(&self, saga: &Saga) -> Result<(), SagaError> {
        let steps = serde_json::to_string(&saga.steps)
            .map_err(|e| SagaError::Corrupt(format!("unencodable steps: {e}")))?;

        let query = Query::insert()
            .into_table(Sagas::Table)
            .columns(SAGA_COLUMNS)
            .values_panic([
                saga.saga_id.as_str().into(),
                saga.name.as_str().into(),
                saga.initiator.as_str().into(),
                saga.status.as_str().into(),
                steps.into(),
                saga.created_at.to_rfc3339().into(),
                saga.updated_at.to_rfc3339().into(),
                saga.completed_at.map(|t| t.to_rfc3339()).into(),
                saga.error.clone().into(),
            ])
            .on_conflict(
                OnConflict::column(Sagas::SagaId)
                    .update_columns([
                        Sagas::Status,
                        Sagas::Steps,
                        Sagas::UpdatedAt,
                        Sagas::CompletedAt,
                        Sagas::Error,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn load(&self, saga_id: &str) -> Result<Option<Saga>, SagaError> {
        let query = Query::select()
            .columns(SAGA_COLUMNS)
            .from(Sagas::Table)
            .and_where(Expr::col(Sagas::SagaId).eq(saga_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|r| Self::saga_from_row(&r)).transpose()
    }

    async fn list(&self, status: Option<SagaStatus>, limit: u64) -> Result<Vec<Saga>, SagaError> {
        // SelectStatement holds Rc internals and must drop before the await.
        let sql = {
            let mut select = Query::select();
            select
                .columns(SAGA_COLUMNS)
                .from(Sagas::Table)
                .order_by(Sagas::CreatedAt, Order::Desc)
                .limit(limit);
            if let Some(status) = status {
                select.and_where(Expr::col(Sagas::Status).eq(status.as_str()));
            }
            select.to_string(SqliteQueryBuilder)
        };

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::saga_from_row).collect()
    }
}

// =================================================================
// Tests
// =================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::{SagaStep, StepStatus, ToolCall};
    use crate::storage;

    async fn store() -> SqliteSagaStore {
        let pool = storage::connect("sqlite::memory:").await.unwrap();
        storage::create_tables(&pool).await.unwrap();
        SqliteSagaStore::new(pool)
    }

    fn make_saga(saga_id: &str, status: SagaStatus) -> Saga {
        let now = Utc::now();
        Saga {
            saga_id: saga_id.to_string(),
            name: "order-flow".to_string(),
            initiator: "tests".to_string(),
            status,
            steps: vec![SagaStep {
                step_id: format!("{saga_id}_step_0"),
                name: "reserve".to_string(),
                service: "inventory".to_string(),
                action: ToolCall {
                    tool: "reserve_stock".to_string(),
                    payload: serde_json::json!({"sku": "A-1"}),
                },
                compensation: ToolCall {
                    tool: "release_stock".to_string(),
                    payload: serde_json::json!({"sku": "A-1"}),
                },
                status: StepStatus::Pending,
                result: None,
                error: None,
                executed_at: None,
                compensated_at: None,
            }],
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let store = store().await;
        let saga = make_saga("saga_abc", SagaStatus::Pending);
        store.save(&saga).await.unwrap();

        let loaded = store.load("saga_abc").await.unwrap().unwrap();
        assert_eq!(loaded.saga_id, saga.saga_id);
        assert_eq!(loaded.status, SagaStatus::Pending);
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.steps[0].action.tool, "reserve_stock");
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let store = store().await;
        assert!(store.load("saga_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_updates_existing_row() {
        let store = store().await;
        let mut saga = make_saga("saga_upd", SagaStatus::Pending);
        store.save(&saga).await.unwrap();

        saga.status = SagaStatus::RolledBack;
        saga.steps[0].status = StepStatus::Compensated;
        saga.completed_at = Some(Utc::now());
        saga.error = Some("Step 'reserve' failed: boom".to_string());
        store.save(&saga).await.unwrap();

        let loaded = store.load("saga_upd").await.unwrap().unwrap();
        assert_eq!(loaded.status, SagaStatus::RolledBack);
        assert_eq!(loaded.steps[0].status, StepStatus::Compensated);
        assert!(loaded.completed_at.is_some());
        assert_eq!(loaded.error.as_deref(), Some("Step 'reserve' failed: boom"));
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = store().await;
        store
            .save(&make_saga("saga_a", SagaStatus::Pending))
            .await
            .unwrap();
        store
            .save(&make_saga("saga_b", SagaStatus::Completed))
            .await
            .unwrap();
        store
            .save(&make_saga("saga_c", SagaStatus::Pending))
            .await
            .unwrap();

        let pending = store.list(Some(SagaStatus::Pending), 50).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|s| s.status == SagaStatus::Pending));

        let all = store.list(None, 2).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
