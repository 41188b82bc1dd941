//! SQLite implementations of storage interfaces.

mod changeset_store;
mod context_store;

pub use changeset_store::SqliteChangesetStore;
pub use context_store::SqliteContextStore;

use chrono::{DateTime, SecondsFormat, Utc};

use super::{Result, StorageError};

/// Fixed-width RFC 3339 so that stored timestamps compare as text.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp {
            column: column.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_ts_orders_as_text() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 9, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
            + chrono::Duration::microseconds(1);
        assert!(format_ts(&early) < format_ts(&late));
        assert_eq!(format_ts(&early), "2024-01-01T09:59:59.000000Z");
    }

    #[test]
    fn test_parse_ts_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        assert_eq!(parse_ts("queued", &format_ts(&ts)).unwrap(), ts);
        assert!(matches!(
            parse_ts("queued", "not a timestamp"),
            Err(StorageError::InvalidTimestamp { .. })
        ));
    }
}
