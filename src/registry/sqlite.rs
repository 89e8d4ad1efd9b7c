//! SQLite implementation of the registry store.

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Expr, Iden, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use super::{RegistryError, RegistryStore, Result, SidecarEntry};

/// Registry sidecars table schema.
#[derive(Iden)]
enum RegistrySidecars {
    Table,
    #[iden = "name"]
    Name,
    #[iden = "url"]
    Url,
    #[iden = "host_url"]
    HostUrl,
    #[iden = "tools_count"]
    ToolsCount,
    #[iden = "category"]
    Category,
    #[iden = "registered_at"]
    RegisteredAt,
}

/// SQLite-backed registry store.
pub struct SqliteRegistryStore {
    pool: SqlitePool,
}

impl SqliteRegistryStore {
    /// Create a new SQLite registry store over an initialized pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> SidecarEntry {
        SidecarEntry {
            name: row.get("name"),
            url: row.get("url"),
            host_url: row.get("host_url"),
            tools_count: row.get("tools_count"),
            category: row.get("category"),
        }
    }
}

#[async_trait]
impl RegistryStore for SqliteRegistryStore {
    async fn load_all(&self) -> Result<Vec<SidecarEntry>> {
        let query = Query::select()
            .columns([
                RegistrySidecars::Name,
                RegistrySidecars::Url,
                RegistrySidecars::HostUrl,
                RegistrySidecars::ToolsCount,
                RegistrySidecars::Category,
            ])
            .from(RegistrySidecars::Table)
            .order_by(RegistrySidecars::Name, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(Self::entry_from_row).collect())
    }

    async fn get(&self, name: &str) -> Result<SidecarEntry> {
        let query = Query::select()
            .columns([
                RegistrySidecars::Name,
                RegistrySidecars::Url,
                RegistrySidecars::HostUrl,
                RegistrySidecars::ToolsCount,
                RegistrySidecars::Category,
            ])
            .from(RegistrySidecars::Table)
            .and_where(Expr::col(RegistrySidecars::Name).eq(name))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|r| Self::entry_from_row(&r))
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    async fn upsert(&self, entry: &SidecarEntry) -> Result<()> {
        let query = Query::insert()
            .into_table(RegistrySidecars::Table)
            .columns([
                RegistrySidecars::Name,
                RegistrySidecars::Url,
                RegistrySidecars::HostUrl,
                RegistrySidecars::ToolsCount,
                RegistrySidecars::Category,
                RegistrySidecars::RegisteredAt,
            ])
            .values_panic([
                entry.name.as_str().into(),
                entry.url.as_str().into(),
                entry.host_url.clone().into(),
                entry.tools_count.into(),
                entry.category.clone().into(),
                Utc::now().to_rfc3339().into(),
            ])
            .on_conflict(
                OnConflict::column(RegistrySidecars::Name)
                    .update_columns([
                        RegistrySidecars::Url,
                        RegistrySidecars::HostUrl,
                        RegistrySidecars::ToolsCount,
                        RegistrySidecars::Category,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        let query = Query::delete()
            .from_table(RegistrySidecars::Table)
            .and_where(Expr::col(RegistrySidecars::Name).eq(name))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}
