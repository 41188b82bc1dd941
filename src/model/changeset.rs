//! Changeset records, metadata and analysis results.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::element::{Action, Element, ElementType, Modification};
use super::pointer::FeedType;

/// Lifecycle state of a tracked changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangesetState {
    New,
    /// Label pre-filter in progress.
    BoundsCheck,
    BoundsChecked,
    /// Light analysis in progress (initial, or refresh of an open changeset).
    Analyzing1,
    Open,
    Closed,
    /// Deep analysis in progress.
    Analyzing2,
    /// Periodic refresh of a finished changeset in progress.
    Reanalyzing,
    Done,
    Quarantined,
}

impl ChangesetState {
    pub const ALL: [ChangesetState; 10] = [
        ChangesetState::New,
        ChangesetState::BoundsCheck,
        ChangesetState::BoundsChecked,
        ChangesetState::Analyzing1,
        ChangesetState::Open,
        ChangesetState::Closed,
        ChangesetState::Analyzing2,
        ChangesetState::Reanalyzing,
        ChangesetState::Done,
        ChangesetState::Quarantined,
    ];

    /// States a record only holds while a worker owns it.
    pub const TRANSIENT: [ChangesetState; 4] = [
        ChangesetState::BoundsCheck,
        ChangesetState::Analyzing1,
        ChangesetState::Analyzing2,
        ChangesetState::Reanalyzing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangesetState::New => "NEW",
            ChangesetState::BoundsCheck => "BOUNDS_CHECK",
            ChangesetState::BoundsChecked => "BOUNDS_CHECKED",
            ChangesetState::Analyzing1 => "ANALYZING1",
            ChangesetState::Open => "OPEN",
            ChangesetState::Closed => "CLOSED",
            ChangesetState::Analyzing2 => "ANALYZING2",
            ChangesetState::Reanalyzing => "REANALYZING",
            ChangesetState::Done => "DONE",
            ChangesetState::Quarantined => "QUARANTINED",
        }
    }

    pub fn is_transient(&self) -> bool {
        Self::TRANSIENT.contains(self)
    }

    /// Stable state a stuck transient record is returned to by the timeout sweep.
    pub fn recovery_state(&self) -> Option<ChangesetState> {
        match self {
            ChangesetState::BoundsCheck => Some(ChangesetState::New),
            ChangesetState::Analyzing1 => Some(ChangesetState::BoundsChecked),
            ChangesetState::Analyzing2 => Some(ChangesetState::Closed),
            ChangesetState::Reanalyzing => Some(ChangesetState::Done),
            _ => None,
        }
    }
}

impl fmt::Display for ChangesetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangesetState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown changeset state: {}", s))
    }
}

/// Bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BBox {
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lon + self.max_lon) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
    }
}

/// Where and when a changeset was first observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    #[serde(rename = "type")]
    pub feed: FeedType,
    pub sequenceno: u64,
    pub observed: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BBox>,
}

/// One discussion comment on a changeset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub uid: i64,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub text: String,
}

/// Which changeset timestamp a derived timestamp came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampType {
    CreatedAt,
    ClosedAt,
    Comment,
}

impl TimestampType {
    /// Display text shown next to the timestamp.
    pub fn label(&self) -> &'static str {
        match self {
            TimestampType::CreatedAt => "Started",
            TimestampType::ClosedAt => "Closed",
            TimestampType::Comment => "Commented",
        }
    }
}

/// Changeset metadata as returned by the changeset API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesetMeta {
    pub id: i64,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub uid: i64,
    pub open: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lon: Option<f64>,
    #[serde(default)]
    pub comments_count: u32,
    #[serde(default)]
    pub changes_count: u32,
    #[serde(default)]
    pub tag: BTreeMap<String, String>,
    #[serde(default)]
    pub discussion: Vec<Comment>,
}

impl ChangesetMeta {
    /// Bounding box, if the changeset has one (empty changesets do not).
    pub fn bbox(&self) -> Option<BBox> {
        Some(BBox {
            min_lon: self.min_lon?,
            min_lat: self.min_lat?,
            max_lon: self.max_lon?,
            max_lat: self.max_lat?,
        })
    }

    /// Most relevant timestamp: `closed_at` if present, else `created_at`.
    ///
    /// With `include_discussion`, a changeset with comments reports its
    /// newest comment date instead.
    pub fn timestamp(&self, include_discussion: bool) -> (TimestampType, DateTime<Utc>) {
        if include_discussion && self.comments_count > 0 {
            if let Some(newest) = self.discussion.iter().map(|c| c.date).max() {
                return (TimestampType::Comment, newest);
            }
        }
        match self.closed_at {
            Some(closed) => (TimestampType::ClosedAt, closed),
            None => (TimestampType::CreatedAt, self.created_at),
        }
    }
}

/// Element counts per type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementCounts {
    pub node: u64,
    pub way: u64,
    pub relation: u64,
}

impl ElementCounts {
    pub fn add(&mut self, element_type: ElementType) {
        match element_type {
            ElementType::Node => self.node += 1,
            ElementType::Way => self.way += 1,
            ElementType::Relation => self.relation += 1,
        }
    }

    pub fn get(&self, element_type: ElementType) -> u64 {
        match element_type {
            ElementType::Node => self.node,
            ElementType::Way => self.way,
            ElementType::Relation => self.relation,
        }
    }
}

/// Created/modified/deleted counters per element type plus totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub create: ElementCounts,
    pub modify: ElementCounts,
    pub delete: ElementCounts,
    #[serde(rename = "_create")]
    pub total_create: u64,
    #[serde(rename = "_modify")]
    pub total_modify: u64,
    #[serde(rename = "_delete")]
    pub total_delete: u64,
}

impl Summary {
    pub fn record(&mut self, action: Action, element_type: ElementType) {
        match action {
            Action::Create => {
                self.create.add(element_type);
                self.total_create += 1;
            }
            Action::Modify => {
                self.modify.add(element_type);
                self.total_modify += 1;
            }
            Action::Delete => {
                self.delete.add(element_type);
                self.total_delete += 1;
            }
        }
    }

    pub fn counts(&self, action: Action) -> &ElementCounts {
        match action {
            Action::Create => &self.create,
            Action::Modify => &self.modify,
            Action::Delete => &self.delete,
        }
    }

    pub fn total(&self, action: Action) -> u64 {
        match action {
            Action::Create => self.total_create,
            Action::Modify => self.total_modify,
            Action::Delete => self.total_delete,
        }
    }
}

/// Counter per action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionCounts {
    pub create: u64,
    pub modify: u64,
    pub delete: u64,
}

impl ActionCounts {
    pub fn add(&mut self, action: Action) {
        match action {
            Action::Create => self.create += 1,
            Action::Modify => self.modify += 1,
            Action::Delete => self.delete += 1,
        }
    }
}

/// Tag changes between two versions, counted by occurrence.
///
/// Keys are `k=v` for created and deleted tags and `k=old --> k=new` for
/// modified ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagDiff {
    pub create: BTreeMap<String, u64>,
    pub modify: BTreeMap<String, u64>,
    pub delete: BTreeMap<String, u64>,
}

impl TagDiff {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.modify.is_empty() && self.delete.is_empty()
    }

    pub fn bucket(&self, action: Action) -> &BTreeMap<String, u64> {
        match action {
            Action::Create => &self.create,
            Action::Modify => &self.modify,
            Action::Delete => &self.delete,
        }
    }

    pub fn bucket_mut(&mut self, action: Action) -> &mut BTreeMap<String, u64> {
        match action {
            Action::Create => &mut self.create,
            Action::Modify => &mut self.modify,
            Action::Delete => &mut self.delete,
        }
    }

    /// Add the counts of `other` into `self`.
    pub fn merge(&mut self, other: &TagDiff) {
        for action in Action::ALL {
            let into = self.bucket_mut(action);
            for (key, count) in other.bucket(action) {
                *into.entry(key.clone()).or_insert(0) += count;
            }
        }
    }
}

/// Way length in metres. Deleted distances are stored negative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mileage {
    pub all_create: f64,
    pub all_delete: f64,
    pub navigable_create: f64,
    pub navigable_delete: f64,
    /// Navigable distance bucketed by tag key then value (`highway` -> `residential`).
    pub by_type: BTreeMap<String, BTreeMap<String, f64>>,
}

impl Mileage {
    /// Net change over all ways.
    pub fn net(&self) -> f64 {
        self.all_create + self.all_delete
    }

    /// Net change over navigable ways.
    pub fn navigable_net(&self) -> f64 {
        self.navigable_create + self.navigable_delete
    }
}

/// A previous author whose edits this changeset touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtherUser {
    pub user: String,
    pub edits: u64,
}

/// Human-readable description of one modified element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub action: Action,
    pub label: String,
    #[serde(default)]
    pub tag_diff: Option<TagDiff>,
    #[serde(default)]
    pub notes: Vec<String>,
    /// Previous authors; `None` for anonymous edits.
    #[serde(default)]
    pub prev_authors: Vec<Option<String>>,
}

/// Diff entries keyed by element type and id.
pub type DiffList = BTreeMap<ElementType, BTreeMap<i64, DiffEntry>>;

/// Element versions retained for later GeoJSON reconstruction.
pub type Geometry = BTreeMap<ElementType, BTreeMap<i64, BTreeMap<u32, Element>>>;

/// A tag-diff entry prepared for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedTag {
    pub tag: String,
    pub count: u64,
}

/// Derived display fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Misc {
    pub user_colour: Option<String>,
    pub timestamp_type: Option<TimestampType>,
    pub timestamp_type_txt: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// `new` for changesets observed less than four minutes ago, else `old`.
    pub state: Option<String>,
    pub processed_tagdiff: BTreeMap<Action, Vec<ProcessedTag>>,
    pub processed_tagdiff_trailer: BTreeMap<Action, String>,
    /// Reason the deep analysis stopped early.
    pub truncated: Option<String>,
}

/// Analysis results of a changeset.
///
/// Only `misc` is present after the light pass; the remaining fields are
/// filled by the deep pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangesetInfo {
    pub misc: Misc,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tagdiff: Option<TagDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simple_nodes: Option<ActionCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diffs: Option<DiffList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub other_users: Option<BTreeMap<i64, OtherUser>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mileage_m: Option<Mileage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<Modification>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geojson: Option<serde_json::Value>,
}

/// A tracked changeset as held by the changeset store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesetRecord {
    pub cid: i64,
    pub state: ChangesetState,
    pub labels: Vec<String>,
    pub queued: DateTime<Utc>,
    /// Last time the changeset content changed.
    pub updated: DateTime<Utc>,
    /// Last metadata refresh attempt.
    pub refreshed: DateTime<Utc>,
    pub state_changed: DateTime<Utc>,
    pub source: Option<Source>,
    pub meta: Option<ChangesetMeta>,
    pub info: Option<ChangesetInfo>,
    /// Failed steps since the last one that succeeded.
    #[serde(default)]
    pub failures: u32,
}

impl ChangesetRecord {
    /// A freshly observed record in state NEW.
    pub fn observed(cid: i64, source: Option<Source>, now: DateTime<Utc>) -> Self {
        Self {
            cid,
            state: ChangesetState::New,
            labels: Vec::new(),
            queued: now,
            updated: now,
            refreshed: now,
            state_changed: now,
            source,
            meta: None,
            info: None,
            failures: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn meta() -> ChangesetMeta {
        ChangesetMeta {
            id: 1,
            user: Some("mapper".to_string()),
            uid: 7,
            open: false,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
            closed_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap()),
            min_lat: None,
            min_lon: None,
            max_lat: None,
            max_lon: None,
            comments_count: 0,
            changes_count: 0,
            tag: BTreeMap::new(),
            discussion: Vec::new(),
        }
    }

    #[test]
    fn test_state_round_trip() {
        for state in ChangesetState::ALL {
            assert_eq!(state.as_str().parse::<ChangesetState>().unwrap(), state);
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
    }

    #[test]
    fn test_recovery_state_only_for_transient() {
        for state in ChangesetState::ALL {
            assert_eq!(state.recovery_state().is_some(), state.is_transient());
        }
        assert_eq!(
            ChangesetState::Analyzing2.recovery_state(),
            Some(ChangesetState::Closed)
        );
    }

    #[test]
    fn test_timestamp_prefers_closed_at() {
        let m = meta();
        assert_eq!(m.timestamp(false), (TimestampType::ClosedAt, m.closed_at.unwrap()));

        let mut open = meta();
        open.closed_at = None;
        assert_eq!(open.timestamp(true).0, TimestampType::CreatedAt);
    }

    #[test]
    fn test_timestamp_uses_newest_comment() {
        let mut m = meta();
        let newest = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        m.comments_count = 2;
        m.discussion = vec![
            Comment {
                date: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
                uid: 1,
                user: None,
                text: "first".to_string(),
            },
            Comment {
                date: newest,
                uid: 2,
                user: None,
                text: "second".to_string(),
            },
        ];
        assert_eq!(m.timestamp(true), (TimestampType::Comment, newest));
        assert_eq!(m.timestamp(false).0, TimestampType::ClosedAt);
    }

    #[test]
    fn test_tagdiff_merge() {
        let mut a = TagDiff::default();
        a.create.insert("highway=residential".to_string(), 1);
        let mut b = TagDiff::default();
        b.create.insert("highway=residential".to_string(), 2);
        b.delete.insert("name=Old".to_string(), 1);
        a.merge(&b);
        assert_eq!(a.create["highway=residential"], 3);
        assert_eq!(a.delete["name=Old"], 1);
        assert!(!a.is_empty());
        assert!(TagDiff::default().is_empty());
    }

    #[test]
    fn test_info_light_pass_serializes_misc_only() {
        let info = ChangesetInfo::default();
        let value = serde_json::to_value(&info).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("misc"));
    }
}
