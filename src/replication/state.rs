//! Replication state documents.
//!
//! The minute, hour and day feeds publish `key=value` files:
//!
//! ```text
//! #Sat Jul 02 22:24:02 UTC 2016
//! sequenceNumber=2081235
//! timestamp=2016-07-02T22\:23\:17Z
//! ```
//!
//! The changesets feed publishes a small YAML document instead:
//!
//! ```text
//! ---
//! last_run: 2016-07-02 22:23:17.546584000 +00:00
//! sequence: 2081235
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{FetchError, Result};
use crate::model::{parse_osm_timestamp, FeedType, PointerPosition};

const CHANGESETS_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f %:z";

/// Parsed state document.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationState {
    pub feed: FeedType,
    pub seqno: u64,
    pub timestamp: DateTime<Utc>,
}

impl ReplicationState {
    /// Parse a state document in the format used by `feed`.
    pub fn parse(feed: FeedType, body: &str) -> Result<Self> {
        match feed {
            FeedType::Changesets => Self::parse_changesets(body),
            _ => Self::parse_key_value(feed, body),
        }
    }

    fn parse_key_value(feed: FeedType, body: &str) -> Result<Self> {
        let mut seqno = None;
        let mut timestamp = None;

        for line in body.lines() {
            let mut parts = line.split('=');
            let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            match key.trim() {
                "sequenceNumber" => {
                    seqno = Some(value.trim().parse::<u64>().map_err(|e| {
                        FetchError::Parse(format!("sequenceNumber {:?}: {}", value, e))
                    })?);
                }
                "timestamp" => {
                    let unescaped = value.replace("\\:", ":");
                    timestamp = Some(parse_osm_timestamp(&unescaped).ok_or_else(|| {
                        FetchError::Parse(format!("timestamp {:?}", unescaped))
                    })?);
                }
                _ => {}
            }
        }

        Ok(Self {
            feed,
            seqno: seqno.ok_or(FetchError::MissingField("sequenceNumber"))?,
            timestamp: timestamp.ok_or(FetchError::MissingField("timestamp"))?,
        })
    }

    fn parse_changesets(body: &str) -> Result<Self> {
        let doc: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(body)
            .map_err(|e| FetchError::Parse(format!("changesets state: {}", e)))?;

        let seqno = doc
            .get("sequence")
            .and_then(|v| v.as_u64())
            .ok_or(FetchError::MissingField("sequence"))?;
        let last_run = doc
            .get("last_run")
            .and_then(|v| v.as_str())
            .ok_or(FetchError::MissingField("last_run"))?;
        let timestamp = DateTime::parse_from_str(last_run, CHANGESETS_TIMESTAMP_FORMAT)
            .map_err(|e| FetchError::Parse(format!("last_run {:?}: {}", last_run, e)))?
            .with_timezone(&Utc);

        Ok(Self {
            feed: FeedType::Changesets,
            seqno,
            timestamp,
        })
    }

    pub fn position(&self) -> PointerPosition {
        PointerPosition {
            stype: self.feed,
            seqno: self.seqno,
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_minute_state() {
        let body = "#Sat Jul 02 22:24:02 UTC 2016\nsequenceNumber=2081235\ntimestamp=2016-07-02T22\\:23\\:17Z\n";
        let state = ReplicationState::parse(FeedType::Minute, body).unwrap();
        assert_eq!(state.seqno, 2081235);
        assert_eq!(
            state.timestamp,
            Utc.with_ymd_and_hms(2016, 7, 2, 22, 23, 17).unwrap()
        );
    }

    #[test]
    fn test_parse_state_missing_timestamp() {
        let result = ReplicationState::parse(FeedType::Hour, "sequenceNumber=12\n");
        assert!(matches!(result, Err(FetchError::MissingField("timestamp"))));
    }

    #[test]
    fn test_parse_state_missing_sequence() {
        let result = ReplicationState::parse(FeedType::Day, "timestamp=2016-07-02T22\\:23\\:17Z\n");
        assert!(matches!(
            result,
            Err(FetchError::MissingField("sequenceNumber"))
        ));
    }

    #[test]
    fn test_parse_state_bad_sequence() {
        let body = "sequenceNumber=abc\ntimestamp=2016-07-02T22\\:23\\:17Z\n";
        let result = ReplicationState::parse(FeedType::Minute, body);
        assert!(matches!(result, Err(FetchError::Parse(_))));
    }

    #[test]
    fn test_parse_changesets_state() {
        let body = "---\nlast_run: 2016-07-02 22:23:17.546584000 +00:00\nsequence: 1912231\n";
        let state = ReplicationState::parse(FeedType::Changesets, body).unwrap();
        assert_eq!(state.seqno, 1912231);
        assert_eq!(state.feed, FeedType::Changesets);
        assert_eq!(
            state.timestamp.timestamp(),
            Utc.with_ymd_and_hms(2016, 7, 2, 22, 23, 17)
                .unwrap()
                .timestamp()
        );
    }
}
