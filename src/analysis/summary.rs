//! Per-changeset counters, tag statistics, affected users and mileage.

use std::collections::BTreeMap;

use tracing::debug;

use super::geo::path_length;
use super::history::{ElementCache, VersionRef};
use super::tagdiff::VersionPair;
use super::Result;
use crate::model::{
    Action, ActionCounts, ChangesetInfo, Element, ElementType, Mileage, Modification, OtherUser,
    Summary, TagDiff,
};

/// Way tag keys whose distance counts as navigable, in bucketing priority.
pub const NAVIGABLE_KEYS: [&str; 3] = ["highway", "cycleway", "busway"];

/// Placeholder for previous authors without a user name.
pub const ANONYMOUS: &str = "Anonymous";

/// First navigable key present in `tags`, with its value.
pub fn navigable_tag(tags: &BTreeMap<String, String>) -> Option<(&'static str, &str)> {
    NAVIGABLE_KEYS
        .iter()
        .find_map(|key| tags.get(*key).map(|value| (*key, value.as_str())))
}

/// Accumulates the summary part of the deep analysis, one modification at a
/// time, so a timeout keeps what was counted so far.
#[derive(Debug, Clone, Default)]
pub struct SummaryBuilder {
    pub summary: Summary,
    pub tagdiff: TagDiff,
    pub tags: BTreeMap<String, u64>,
    pub simple_nodes: ActionCounts,
    pub other_users: BTreeMap<i64, OtherUser>,
    pub mileage: Mileage,
}

impl SummaryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&mut self, cache: &mut ElementCache, modification: &Modification) -> Result<()> {
        let element_type = modification.element_type;
        let action = modification.action;
        let data = &modification.data;

        self.summary.record(action, element_type);

        let pair = VersionPair::resolve(cache, element_type, data.id, data.version).await?;
        let diff = pair.tag_diff();
        if !diff.is_empty() {
            self.tagdiff.merge(&diff);
        }
        pair.count_unchanged(&mut self.tags);

        if element_type == ElementType::Node {
            let tags = if action == Action::Delete {
                previous(cache, modification).await?.tag
            } else {
                data.tag.clone()
            };
            if diff.is_empty() && tags.is_empty() {
                self.simple_nodes.add(action);
            }
        }

        if action != Action::Create {
            let old = previous(cache, modification).await?;
            if old.uid != data.uid {
                self.other_users
                    .entry(old.uid)
                    .or_insert_with(|| OtherUser {
                        user: old.user.clone().unwrap_or_else(|| ANONYMOUS.to_string()),
                        edits: 0,
                    })
                    .edits += 1;
            }
        }

        if element_type == ElementType::Way {
            match action {
                Action::Create => {
                    let length = way_length(cache, &data.nd, VersionRef::Newest).await?;
                    self.add_mileage(action, &data.tag, length);
                }
                Action::Delete => {
                    // The deletion carries no nodes; measure the last visible
                    // version with node positions at deletion time.
                    let old = previous(cache, modification).await?;
                    let length = way_length(cache, &old.nd, VersionRef::At(data.timestamp)).await?;
                    self.add_mileage(action, &old.tag, -length);
                }
                Action::Modify => {}
            }
        }

        Ok(())
    }

    fn add_mileage(&mut self, action: Action, tags: &BTreeMap<String, String>, distance: f64) {
        let mileage = &mut self.mileage;
        let (all, navigable) = match action {
            Action::Create => (&mut mileage.all_create, &mut mileage.navigable_create),
            Action::Delete => (&mut mileage.all_delete, &mut mileage.navigable_delete),
            Action::Modify => return,
        };
        *all += distance;
        if let Some((key, value)) = navigable_tag(tags) {
            *navigable += distance;
            *mileage
                .by_type
                .entry(key.to_string())
                .or_default()
                .entry(value.to_string())
                .or_insert(0.0) += distance;
        }
    }

    /// Store the accumulated results on `info`.
    pub fn write_into(self, info: &mut ChangesetInfo) {
        info.summary = Some(self.summary);
        info.tagdiff = Some(self.tagdiff);
        info.tags = Some(self.tags);
        info.simple_nodes = Some(self.simple_nodes);
        info.other_users = Some(self.other_users);
        info.mileage_m = Some(self.mileage);
    }
}

/// The visible version before the one a modification produced.
pub(crate) async fn previous(cache: &mut ElementCache, modification: &Modification) -> Result<Element> {
    let data = &modification.data;
    cache
        .resolve(
            modification.element_type,
            data.id,
            VersionRef::Exact(data.version.saturating_sub(1).max(1)),
            true,
        )
        .await
}

/// Length of a way drawn through `nodes`, each resolved at `at`. Nodes
/// without coordinates are skipped.
async fn way_length(cache: &mut ElementCache, nodes: &[i64], at: VersionRef) -> Result<f64> {
    let mut points = Vec::with_capacity(nodes.len());
    for &nid in nodes {
        let node = cache.resolve(ElementType::Node, nid, at, true).await?;
        match node.coordinates() {
            Some(point) => points.push(point),
            None => debug!(node = nid, "Node without coordinates"),
        }
    }
    Ok(path_length(&points))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_navigable_tag_priority() {
        assert_eq!(
            navigable_tag(&tags(&[("cycleway", "lane"), ("highway", "primary")])),
            Some(("highway", "primary"))
        );
        assert_eq!(navigable_tag(&tags(&[("building", "yes")])), None);
    }

    #[test]
    fn test_mileage_buckets() {
        let mut builder = SummaryBuilder::new();
        builder.add_mileage(Action::Create, &tags(&[("highway", "residential")]), 100.0);
        builder.add_mileage(Action::Create, &tags(&[("building", "yes")]), 40.0);
        builder.add_mileage(Action::Delete, &tags(&[("highway", "residential")]), -30.0);

        let m = &builder.mileage;
        assert_eq!(m.all_create, 140.0);
        assert_eq!(m.navigable_create, 100.0);
        assert_eq!(m.all_delete, -30.0);
        assert_eq!(m.by_type["highway"]["residential"], 70.0);
        assert_eq!(m.navigable_net(), 70.0);
    }

    #[test]
    fn test_write_into_fills_deep_fields() {
        let mut info = ChangesetInfo::default();
        SummaryBuilder::new().write_into(&mut info);
        assert!(info.summary.is_some());
        assert!(info.mileage_m.is_some());
        assert!(info.other_users.is_some());
    }
}
