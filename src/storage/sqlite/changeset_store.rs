//! SQLite ChangesetStore implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, OnConflict, Order, Query, SelectStatement, SimpleExpr, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use super::{format_ts, parse_ts};
use crate::model::{ChangesetInfo, ChangesetMeta, ChangesetRecord, ChangesetState, Source};
use crate::storage::schema::{Changesets, CREATE_CHANGESETS_TABLE};
use crate::storage::{
    ChangesetQuery, ChangesetStore, ClaimRequest, ProcessedUpdate, Result, StorageError,
};

const COLUMNS: [Changesets; 11] = [
    Changesets::Cid,
    Changesets::State,
    Changesets::Labels,
    Changesets::Queued,
    Changesets::Updated,
    Changesets::Refreshed,
    Changesets::StateChanged,
    Changesets::Source,
    Changesets::Meta,
    Changesets::Info,
    Changesets::Failures,
];

/// SQLite implementation of ChangesetStore.
///
/// Claims are a single `UPDATE ... WHERE cid IN (SELECT ... LIMIT 1) ...
/// RETURNING` statement, which SQLite executes under its write lock.
pub struct SqliteChangesetStore {
    pool: SqlitePool,
}

impl SqliteChangesetStore {
    /// Create a new SQLite changeset store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the table and indices if missing.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_CHANGESETS_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn select_all() -> SelectStatement {
        Query::select()
            .columns(COLUMNS)
            .from(Changesets::Table)
            .to_owned()
    }

    fn state_values(states: &[ChangesetState]) -> Vec<&'static str> {
        states.iter().map(|s| s.as_str()).collect()
    }

    fn json_column<T: serde::de::DeserializeOwned>(
        row: &SqliteRow,
        column: &str,
    ) -> Result<Option<T>> {
        let raw: Option<String> = row.try_get(column)?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    fn ts_column(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
        let raw: String = row.try_get(column)?;
        parse_ts(column, &raw)
    }

    fn record_from_row(row: &SqliteRow) -> Result<ChangesetRecord> {
        let state: String = row.try_get("state")?;
        let state = state
            .parse::<ChangesetState>()
            .map_err(StorageError::InvalidState)?;
        let labels: Vec<String> = Self::json_column(row, "labels")?.unwrap_or_default();
        let failures: i64 = row.try_get("failures")?;

        Ok(ChangesetRecord {
            cid: row.try_get("cid")?,
            state,
            labels,
            queued: Self::ts_column(row, "queued")?,
            updated: Self::ts_column(row, "updated")?,
            refreshed: Self::ts_column(row, "refreshed")?,
            state_changed: Self::ts_column(row, "state_changed")?,
            source: Self::json_column::<Source>(row, "source")?,
            meta: Self::json_column::<ChangesetMeta>(row, "meta")?,
            info: Self::json_column::<ChangesetInfo>(row, "info")?,
            failures: failures.max(0) as u32,
        })
    }

    /// Write a JSON column unless it is structurally equal to the stored value.
    async fn set_json_gated<T: serde::Serialize>(
        &self,
        cid: i64,
        column: Changesets,
        name: &str,
        value: &T,
    ) -> Result<bool> {
        let query = Query::select()
            .column(column)
            .from(Changesets::Table)
            .and_where(Expr::col(Changesets::Cid).eq(cid))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::NotFound(cid))?;

        let new_value = serde_json::to_value(value)?;
        let old: Option<String> = row.try_get(name)?;
        if let Some(old) = old {
            let old_value: serde_json::Value = serde_json::from_str(&old)?;
            if old_value == new_value {
                debug!(cid, column = name, "Value unchanged, skipping write");
                return Ok(false);
            }
        }

        let query = Query::update()
            .table(Changesets::Table)
            .values([
                (column, new_value.to_string().into()),
                (Changesets::Updated, format_ts(&Utc::now()).into()),
            ])
            .and_where(Expr::col(Changesets::Cid).eq(cid))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        debug!(cid, column = name, "Value stored");
        Ok(true)
    }
}

#[async_trait]
impl ChangesetStore for SqliteChangesetStore {
    async fn append(&self, cid: i64, source: Option<Source>) -> Result<()> {
        let now = format_ts(&Utc::now());
        let source = source.map(|s| serde_json::to_string(&s)).transpose()?;

        let query = Query::insert()
            .into_table(Changesets::Table)
            .columns(COLUMNS)
            .values_panic([
                cid.into(),
                ChangesetState::New.as_str().into(),
                "[]".into(),
                now.clone().into(),
                now.clone().into(),
                now.clone().into(),
                now.into(),
                source.into(),
                Option::<String>::None.into(),
                Option::<String>::None.into(),
                0i64.into(),
            ])
            .on_conflict(
                OnConflict::column(Changesets::Cid)
                    .update_columns([
                        Changesets::State,
                        Changesets::Labels,
                        Changesets::Queued,
                        Changesets::Updated,
                        Changesets::Refreshed,
                        Changesets::StateChanged,
                        Changesets::Source,
                        Changesets::Meta,
                        Changesets::Info,
                        Changesets::Failures,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        debug!(cid, "Changeset appended");
        Ok(())
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<Option<ChangesetRecord>> {
        let query = {
            let states = Self::state_values(&request.from);
            let filter_column = Changesets::from(request.timestamp);

            let mut candidate = Query::select();
            candidate
                .column(Changesets::Cid)
                .from(Changesets::Table)
                .and_where(Expr::col(Changesets::State).is_in(states.clone()));
            if let Some(before) = request.before {
                candidate.and_where(Expr::col(filter_column).lt(format_ts(&before)));
            }
            if let Some(after) = request.after {
                candidate.and_where(Expr::col(filter_column).gt(format_ts(&after)));
            }
            if !request.skip.is_empty() {
                candidate.and_where(Expr::col(Changesets::Cid).is_not_in(request.skip.clone()));
            }
            candidate
                .order_by(Changesets::from(request.order_by), Order::Asc)
                .order_by(Changesets::Cid, Order::Asc)
                .limit(1);

            Query::update()
                .table(Changesets::Table)
                .values([
                    (Changesets::State, request.to.as_str().into()),
                    (Changesets::StateChanged, format_ts(&Utc::now()).into()),
                ])
                .and_where(Expr::col(Changesets::Cid).in_subquery(candidate))
                .and_where(Expr::col(Changesets::State).is_in(states))
                .returning_all()
                .to_string(SqliteQueryBuilder)
        };

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => {
                let record = Self::record_from_row(&row)?;
                debug!(cid = record.cid, to = %request.to, "Claimed changeset");
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn get(&self, cid: i64) -> Result<Option<ChangesetRecord>> {
        let query = Self::select_all()
            .and_where(Expr::col(Changesets::Cid).eq(cid))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn set_meta(&self, cid: i64, meta: &ChangesetMeta) -> Result<bool> {
        self.set_json_gated(cid, Changesets::Meta, "meta", meta).await
    }

    async fn set_info(&self, cid: i64, info: &ChangesetInfo) -> Result<bool> {
        self.set_json_gated(cid, Changesets::Info, "info", info).await
    }

    async fn processed(&self, cid: i64, update: &ProcessedUpdate) -> Result<()> {
        let record = self.get(cid).await?.ok_or(StorageError::NotFound(cid))?;
        let query = {
            let now = format_ts(&Utc::now());
            let mut values: Vec<(Changesets, SimpleExpr)> = vec![
                (Changesets::State, update.state.as_str().into()),
                (Changesets::StateChanged, now.clone().into()),
            ];
            if update.refreshed {
                values.push((Changesets::Refreshed, now.into()));
            }
            if let Some(labels) = &update.labels {
                values.push((Changesets::Labels, serde_json::to_string(labels)?.into()));
            }
            if update.state != ChangesetState::Quarantined {
                values.push((Changesets::Failures, 0i64.into()));
            }
            if let Some(meta) = &record.meta {
                let (_, updated) = meta.timestamp(true);
                values.push((Changesets::Updated, format_ts(&updated).into()));
            }

            Query::update()
                .table(Changesets::Table)
                .values(values)
                .and_where(Expr::col(Changesets::Cid).eq(cid))
                .to_string(SqliteQueryBuilder)
        };

        sqlx::query(&query).execute(&self.pool).await?;
        debug!(cid, state = %update.state, "Changeset processed");
        Ok(())
    }

    async fn restore(&self, cid: i64, state: ChangesetState) -> Result<()> {
        let query = Query::update()
            .table(Changesets::Table)
            .value(Changesets::State, state.as_str())
            .and_where(Expr::col(Changesets::Cid).eq(cid))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(cid));
        }
        Ok(())
    }

    async fn fail(&self, cid: i64, state: ChangesetState) -> Result<u32> {
        let query = Query::update()
            .table(Changesets::Table)
            .values([
                (Changesets::State, state.as_str().into()),
                (Changesets::Failures, Expr::col(Changesets::Failures).add(1)),
            ])
            .and_where(Expr::col(Changesets::Cid).eq(cid))
            .returning_col(Changesets::Failures)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::NotFound(cid))?;
        let failures: i64 = row.try_get("failures")?;
        Ok(failures.max(0) as u32)
    }

    async fn remove(&self, cid: i64) -> Result<bool> {
        let query = Query::delete()
            .from_table(Changesets::Table)
            .and_where(Expr::col(Changesets::Cid).eq(cid))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            warn!(cid, "Changeset to remove not found");
            return Ok(false);
        }
        Ok(true)
    }

    async fn find(&self, query: &ChangesetQuery) -> Result<Vec<ChangesetRecord>> {
        let sql = {
            let column = Changesets::from(query.timestamp);
            let mut select = Self::select_all();
            if !query.states.is_empty() {
                select.and_where(
                    Expr::col(Changesets::State).is_in(Self::state_values(&query.states)),
                );
            }
            if let Some(before) = query.before {
                select.and_where(Expr::col(column).lt(format_ts(&before)));
            }
            if let Some(after) = query.after {
                select.and_where(Expr::col(column).gte(format_ts(&after)));
            }
            select.order_by(column, Order::Desc);
            if let Some(limit) = query.limit {
                select.limit(limit);
            }
            select.to_string(SqliteQueryBuilder)
        };

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn count_by_state(&self) -> Result<BTreeMap<ChangesetState, u64>> {
        let query = Query::select()
            .column(Changesets::State)
            .expr(Expr::col(Changesets::Cid).count())
            .from(Changesets::Table)
            .group_by_col(Changesets::State)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let state: String = row.try_get(0)?;
            let count: i64 = row.try_get(1)?;
            let state = state
                .parse::<ChangesetState>()
                .map_err(StorageError::InvalidState)?;
            counts.insert(state, count as u64);
        }
        Ok(counts)
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let now = format_ts(&Utc::now());
        let cutoff = format_ts(&older_than);
        let mut reclaimed = 0;

        for transient in ChangesetState::TRANSIENT {
            let Some(recovery) = transient.recovery_state() else {
                continue;
            };
            let query = Query::update()
                .table(Changesets::Table)
                .values([
                    (Changesets::State, recovery.as_str().into()),
                    (Changesets::StateChanged, now.clone().into()),
                ])
                .and_where(Expr::col(Changesets::State).eq(transient.as_str()))
                .and_where(Expr::col(Changesets::StateChanged).lt(cutoff.clone()))
                .to_string(SqliteQueryBuilder);

            let result = sqlx::query(&query).execute(&self.pool).await?;
            if result.rows_affected() > 0 {
                warn!(
                    from = %transient,
                    to = %recovery,
                    count = result.rows_affected(),
                    "Reclaimed stale changesets"
                );
            }
            reclaimed += result.rows_affected();
        }
        Ok(reclaimed)
    }

    async fn reset_states(
        &self,
        from: &[ChangesetState],
        to: ChangesetState,
        cid: Option<i64>,
    ) -> Result<u64> {
        let sql = {
            let mut query = Query::update();
            query.table(Changesets::Table).values([
                (Changesets::State, to.as_str().into()),
                (Changesets::StateChanged, format_ts(&Utc::now()).into()),
            ]);
            if !from.is_empty() {
                query.and_where(Expr::col(Changesets::State).is_in(Self::state_values(from)));
            }
            if let Some(cid) = cid {
                query.and_where(Expr::col(Changesets::Cid).eq(cid));
            }
            query.to_string(SqliteQueryBuilder)
        };

        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn evict_older_than(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let query = Query::delete()
            .from_table(Changesets::Table)
            .and_where(Expr::col(Changesets::Updated).lt(format_ts(&older_than)))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
