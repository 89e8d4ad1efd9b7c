//! Incident journal: durable notes written by whoever works an incident,
//! queryable by agent, severity, and category.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, Iden, Order, Query, SqliteQueryBuilder};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{ParseSeverityError, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalCategory {
    Observation,
    Finding,
    Recommendation,
    Escalation,
}

impl JournalCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalCategory::Observation => "observation",
            JournalCategory::Finding => "finding",
            JournalCategory::Recommendation => "recommendation",
            JournalCategory::Escalation => "escalation",
        }
    }
}

impl std::fmt::Display for JournalCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown journal category: {0}")]
pub struct ParseCategoryError(String);

impl std::str::FromStr for JournalCategory {
    type Err = ParseCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observation" => Ok(JournalCategory::Observation),
            "finding" => Ok(JournalCategory::Finding),
            "recommendation" => Ok(JournalCategory::Recommendation),
            "escalation" => Ok(JournalCategory::Escalation),
            other => Err(ParseCategoryError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub entry_id: String,
    pub agent_id: String,
    pub entry: String,
    pub severity: Severity,
    pub category: JournalCategory,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the writer; id and timestamp are assigned on append.
#[derive(Debug, Clone, Deserialize)]
pub struct NewJournalEntry {
    pub agent_id: String,
    pub entry: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default = "default_category")]
    pub category: JournalCategory,
}

fn default_severity() -> Severity {
    Severity::Info
}

fn default_category() -> JournalCategory {
    JournalCategory::Observation
}

#[derive(Debug, Clone, Default)]
pub struct JournalQuery {
    pub agent_id: Option<String>,
    pub severity: Option<Severity>,
    pub category: Option<JournalCategory>,
    pub limit: Option<u64>,
}

/// Rows returned when no limit is given.
const DEFAULT_QUERY_LIMIT: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt journal row: {0}")]
    Corrupt(String),
}

impl From<ParseSeverityError> for JournalError {
    fn from(e: ParseSeverityError) -> Self {
        JournalError::Corrupt(e.to_string())
    }
}

impl From<ParseCategoryError> for JournalError {
    fn from(e: ParseCategoryError) -> Self {
        JournalError::Corrupt(e.to_string())
    }
}

#[async_trait]
pub trait JournalStore: Send + Sync {
    async fn append(&self, entry: NewJournalEntry) -> Result<JournalEntry, JournalError>;

    /// Entries matching the filter, newest first.
    async fn query(&self, query: &JournalQuery) -> Result<Vec<JournalEntry>, JournalError>;
}

/// Pulse journal table schema.
#[derive(Iden)]
enum PulseJournal {
    Table,
    #[iden = "entry_id"]
    EntryId,
    #[iden = "agent_id"]
    AgentId,
    #[iden = "entry"]
    Entry,
    #[iden = "severity"]
    Severity,
    #[iden = "category"]
    Category,
    #[iden = "created_at"]
    CreatedAt,
}

pub struct SqliteJournalStore {
    pool: SqlitePool,
}

impl SqliteJournalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<JournalEntry, JournalError> {
        let severity: String = row.get("severity");
        let category: String = row.get("category");
        let created_at: String = row.get("created_at");
        Ok(JournalEntry {
            entry_id: row.get("entry_id"),
            agent_id: row.get("agent_id"),
            entry: row.get("entry"),
            severity: severity.parse()?,
            category: category.parse()?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| JournalError::Corrupt(format!("bad created_at: {e}")))?
                .with_timezone(&Utc),
        })
    }
}

#[async_trait]
impl JournalStore for SqliteJournalStore {
    async fn append(&self, new: NewJournalEntry) -> Result<JournalEntry, JournalError> {
        let entry = JournalEntry {
            entry_id: format!("journal_{}", Uuid::new_v4().simple()),
            agent_id: new.agent_id,
            entry: new.entry,
            severity: new.severity,
            category: new.category,
            created_at: Utc::now(),
        };

        let query = Query::insert()
            .into_table(PulseJournal::Table)
            .columns([
                PulseJournal::EntryId,
                PulseJournal::AgentId,
                PulseJournal::Entry,
                PulseJournal::Severity,
                PulseJournal::Category,
                PulseJournal::CreatedAt,
            ])
            .values_panic([
                entry.entry_id.clone().into(),
                entry.agent_id.clone().into(),
                entry.entry.clone().into(),
                entry.severity.as_str().into(),
                entry.category.as_str().into(),
                entry.created_at.to_rfc3339().into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(entry)
    }

    async fn query(&self, filter: &JournalQuery) -> Result<Vec<JournalEntry>, JournalError> {
        // SelectStatement holds Rc internals and must drop before the await.
        let sql = {
            let mut select = Query::select();
            select
                .columns([
                    PulseJournal::EntryId,
                    PulseJournal::AgentId,
                    PulseJournal::Entry,
                    PulseJournal::Severity,
                    PulseJournal::Category,
                    PulseJournal::CreatedAt,
                ])
                .from(PulseJournal::Table)
                .order_by(PulseJournal::CreatedAt, Order::Desc)
                .limit(filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT));

            if let Some(agent_id) = &filter.agent_id {
                select.and_where(Expr::col(PulseJournal::AgentId).eq(agent_id.as_str()));
            }
            if let Some(severity) = filter.severity {
                select.and_where(Expr::col(PulseJournal::Severity).eq(severity.as_str()));
            }
            if let Some(category) = filter.category {
                select.and_where(Expr::col(PulseJournal::Category).eq(category.as_str()));
            }

            select.to_string(SqliteQueryBuilder)
        };
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::entry_from_row).collect()
    }
}

// =================================================================
// Tests
// =================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;

    async fn store() -> SqliteJournalStore {
        let pool = storage::connect("sqlite::memory:").await.unwrap();
        storage::create_tables(&pool).await.unwrap();
        SqliteJournalStore::new(pool)
    }

    fn note(agent: &str, severity: Severity, category: JournalCategory) -> NewJournalEntry {
        NewJournalEntry {
            agent_id: agent.to_string(),
            entry: format!("{agent} wrote a {category} note"),
            severity,
            category,
        }
    }

    #[tokio::test]
    async fn append_assigns_id_and_timestamp() {
        let store = store().await;
        let entry = store
            .append(note("remediation", Severity::Info, JournalCategory::Observation))
            .await
            .unwrap();
        assert!(entry.entry_id.starts_with("journal_"));

        let all = store.query(&JournalQuery::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].entry_id, entry.entry_id);
        assert_eq!(all[0].category, JournalCategory::Observation);
    }

    #[tokio::test]
    async fn filters_compose() {
        let store = store().await;
        store
            .append(note("remediation", Severity::Critical, JournalCategory::Finding))
            .await
            .unwrap();
        store
            .append(note("remediation", Severity::Info, JournalCategory::Observation))
            .await
            .unwrap();
        store
            .append(note("triage", Severity::Critical, JournalCategory::Finding))
            .await
            .unwrap();

        let hits = store
            .query(&JournalQuery {
                agent_id: Some("remediation".to_string()),
                severity: Some(Severity::Critical),
                category: None,
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].agent_id, "remediation");
        assert_eq!(hits[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn category_filter_selects_kind() {
        let store = store().await;
        store
            .append(note("a", Severity::Info, JournalCategory::Recommendation))
            .await
            .unwrap();
        store
            .append(note("a", Severity::Info, JournalCategory::Escalation))
            .await
            .unwrap();

        let hits = store
            .query(&JournalQuery {
                category: Some(JournalCategory::Escalation),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].category, JournalCategory::Escalation);
    }

    #[tokio::test]
    async fn limit_caps_results() {
        let store = store().await;
        for n in 0..5 {
            store
                .append(note(&format!("agent-{n}"), Severity::Info, JournalCategory::Observation))
                .await
                .unwrap();
        }
        let hits = store
            .query(&JournalQuery {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }
}
