//! Replication pointer and feed types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Replication feed granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedType {
    #[default]
    Minute,
    Hour,
    Day,
    /// Changeset envelopes (`replication/changesets`), carrying bounding boxes.
    Changesets,
}

impl FeedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedType::Minute => "minute",
            FeedType::Hour => "hour",
            FeedType::Day => "day",
            FeedType::Changesets => "changesets",
        }
    }

    /// Nominal seconds between two consecutive sequence numbers.
    pub fn period_secs(&self) -> i64 {
        match self {
            FeedType::Minute | FeedType::Changesets => 60,
            FeedType::Hour => 3600,
            FeedType::Day => 86400,
        }
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(FeedType::Minute),
            "hour" => Ok(FeedType::Hour),
            "day" => Ok(FeedType::Day),
            "changesets" => Ok(FeedType::Changesets),
            other => Err(format!("unknown feed type: {}", other)),
        }
    }
}

/// One position in a replication feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerPosition {
    pub stype: FeedType,
    pub seqno: u64,
    pub timestamp: DateTime<Utc>,
}

/// Persisted replication pointer.
///
/// `seqno` is the next sequence number to consume. `first_pointer` records
/// where tracking started and is never overwritten once set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPointer {
    pub stype: FeedType,
    pub seqno: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub first_pointer: Option<PointerPosition>,
}

impl ReplicationPointer {
    /// Build a pointer for `position`, keeping the anchor of `previous` if any.
    pub fn anchored(position: &PointerPosition, previous: Option<&ReplicationPointer>) -> Self {
        let first_pointer = match previous {
            Some(prev) => prev.first_pointer.clone(),
            None => Some(position.clone()),
        };
        Self {
            stype: position.stype,
            seqno: position.seqno,
            timestamp: position.timestamp,
            first_pointer,
        }
    }

    pub fn position(&self) -> PointerPosition {
        PointerPosition {
            stype: self.stype,
            seqno: self.seqno,
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(seqno: u64) -> PointerPosition {
        PointerPosition {
            stype: FeedType::Minute,
            seqno,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_anchored_sets_first_pointer_once() {
        let first = ReplicationPointer::anchored(&position(100), None);
        assert_eq!(first.first_pointer.as_ref().map(|p| p.seqno), Some(100));

        let second = ReplicationPointer::anchored(&position(250), Some(&first));
        assert_eq!(second.seqno, 250);
        assert_eq!(second.first_pointer.as_ref().map(|p| p.seqno), Some(100));
    }

    #[test]
    fn test_feed_type_round_trip() {
        for feed in [
            FeedType::Minute,
            FeedType::Hour,
            FeedType::Day,
            FeedType::Changesets,
        ] {
            assert_eq!(feed.as_str().parse::<FeedType>().unwrap(), feed);
        }
        assert!("weekly".parse::<FeedType>().is_err());
    }
}
