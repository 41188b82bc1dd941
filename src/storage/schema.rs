//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

use super::TimestampColumn;

/// Changesets table schema.
#[derive(Iden, Clone, Copy)]
pub enum Changesets {
    Table,
    #[iden = "cid"]
    Cid,
    #[iden = "state"]
    State,
    #[iden = "labels"]
    Labels,
    #[iden = "queued"]
    Queued,
    #[iden = "updated"]
    Updated,
    #[iden = "refreshed"]
    Refreshed,
    #[iden = "state_changed"]
    StateChanged,
    #[iden = "source"]
    Source,
    #[iden = "meta"]
    Meta,
    #[iden = "info"]
    Info,
    #[iden = "failures"]
    Failures,
}

impl From<TimestampColumn> for Changesets {
    fn from(column: TimestampColumn) -> Self {
        match column {
            TimestampColumn::Queued => Changesets::Queued,
            TimestampColumn::Updated => Changesets::Updated,
            TimestampColumn::Refreshed => Changesets::Refreshed,
            TimestampColumn::StateChanged => Changesets::StateChanged,
        }
    }
}

/// Context singleton table schema.
#[derive(Iden)]
pub enum Context {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "pointer"]
    Pointer,
    #[iden = "generation"]
    Generation,
}

/// Primary key of the single context row.
pub const CONTEXT_ROW_ID: i64 = 0;

/// SQL for creating the changesets table.
///
/// Timestamps are fixed-width RFC 3339 strings so that text comparison
/// orders them chronologically.
pub const CREATE_CHANGESETS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS changesets (
    cid INTEGER PRIMARY KEY,
    state TEXT NOT NULL,
    labels TEXT NOT NULL DEFAULT '[]',
    queued TEXT NOT NULL,
    updated TEXT NOT NULL,
    refreshed TEXT NOT NULL,
    state_changed TEXT NOT NULL,
    source TEXT,
    meta TEXT,
    info TEXT,
    failures INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_changesets_state_changed ON changesets(state, state_changed);
CREATE INDEX IF NOT EXISTS idx_changesets_state_refreshed ON changesets(state, refreshed);
CREATE INDEX IF NOT EXISTS idx_changesets_state_updated ON changesets(state, updated);
CREATE INDEX IF NOT EXISTS idx_changesets_updated ON changesets(updated);
"#;

/// SQL for creating the context table and its single row.
pub const CREATE_CONTEXT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS context (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    pointer TEXT,
    generation INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO context (id, pointer, generation) VALUES (0, NULL, 0);
"#;
