//! Domain types shared by the fetcher, the store and the analyzer.

mod changeset;
mod element;
mod pointer;

pub use changeset::{
    ActionCounts, BBox, ChangesetInfo, ChangesetMeta, ChangesetRecord, ChangesetState, Comment,
    DiffEntry, DiffList, ElementCounts, Geometry, Mileage, Misc, OtherUser, ProcessedTag, Source,
    Summary, TagDiff, TimestampType,
};
pub use element::{Action, Element, ElementType, Member, Modification};
pub use pointer::{FeedType, PointerPosition, ReplicationPointer};

use chrono::{DateTime, NaiveDateTime, Utc};

/// Timestamp format used by the OSM API and replication state files.
pub const OSM_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Parse an OSM timestamp (`2016-07-02T22:23:17Z`).
pub fn parse_osm_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s.trim(), OSM_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Format a timestamp the way the OSM API does.
pub fn format_osm_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(OSM_TIMESTAMP_FORMAT).to_string()
}
