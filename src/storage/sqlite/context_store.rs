//! SQLite ContextStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::model::{PointerPosition, ReplicationPointer};
use crate::storage::schema::{Context, CONTEXT_ROW_ID, CREATE_CONTEXT_TABLE};
use crate::storage::{ContextStore, Result, StorageError};

/// SQLite implementation of ContextStore, backed by a single-row table.
pub struct SqliteContextStore {
    pool: SqlitePool,
}

impl SqliteContextStore {
    /// Create a new SQLite context store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the table and its row if missing.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_CONTEXT_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_pointer(&self, pointer: &ReplicationPointer) -> Result<()> {
        let query = Query::update()
            .table(Context::Table)
            .value(Context::Pointer, serde_json::to_string(pointer)?)
            .and_where(Expr::col(Context::Id).eq(CONTEXT_ROW_ID))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ContextStore for SqliteContextStore {
    async fn pointer(&self) -> Result<Option<ReplicationPointer>> {
        let query = Query::select()
            .column(Context::Pointer)
            .from(Context::Table)
            .and_where(Expr::col(Context::Id).eq(CONTEXT_ROW_ID))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        let raw: Option<String> = match row {
            Some(row) => row.try_get("pointer")?,
            None => None,
        };
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    async fn set_pointer(&self, position: &PointerPosition) -> Result<ReplicationPointer> {
        let previous = self.pointer().await?;
        let pointer = ReplicationPointer::anchored(position, previous.as_ref());
        self.write_pointer(&pointer).await?;
        debug!(seqno = pointer.seqno, stype = %pointer.stype, "Pointer set");
        Ok(pointer)
    }

    async fn pointer_update_timestamp(&self, timestamp: DateTime<Utc>) -> Result<()> {
        let mut pointer = self.pointer().await?.ok_or(StorageError::NoPointer)?;
        pointer.timestamp = timestamp;
        self.write_pointer(&pointer).await
    }

    async fn pointer_advance(&self, offset: i64) -> Result<ReplicationPointer> {
        let mut pointer = self.pointer().await?.ok_or(StorageError::NoPointer)?;
        let old = pointer.seqno;
        pointer.seqno = (pointer.seqno as i64 + offset).max(0) as u64;
        self.write_pointer(&pointer).await?;
        debug!(old, new = pointer.seqno, "Pointer advanced");
        Ok(pointer)
    }

    async fn generation(&self) -> Result<u64> {
        let query = Query::select()
            .column(Context::Generation)
            .from(Context::Table)
            .and_where(Expr::col(Context::Id).eq(CONTEXT_ROW_ID))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => {
                let generation: i64 = row.try_get("generation")?;
                Ok(generation as u64)
            }
            None => Ok(0),
        }
    }

    async fn generation_advance(&self) -> Result<u64> {
        let query = Query::update()
            .table(Context::Table)
            .value(Context::Generation, Expr::col(Context::Generation).add(1))
            .and_where(Expr::col(Context::Id).eq(CONTEXT_ROW_ID))
            .returning_col(Context::Generation)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let generation: i64 = row.try_get("generation")?;
        debug!(generation, "Generation advanced");
        Ok(generation as u64)
    }
}
